use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

pub fn encode_cursor<T: Serialize>(cursor: &T) -> StoreResult<String> {
    let json = serde_json::to_vec(cursor)
        .map_err(|err| StoreError::serialization(format!("failed to serialize cursor: {err}")))?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}

pub fn decode_cursor<T: for<'de> Deserialize<'de>>(token: &str) -> StoreResult<T> {
    let raw = URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|err| StoreError::invalid_cursor(format!("invalid base64 cursor: {err}")))?;
    serde_json::from_slice(&raw)
        .map_err(|err| StoreError::invalid_cursor(format!("invalid cursor payload: {err}")))
}
