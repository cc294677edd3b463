use crate::model::{NormalizedEvent, RawInteraction};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SubsecRound, Utc};
use serde_json::Value;
use shoptrace_store::{EventType, Metadata};
use tracing::warn;

const NAIVE_DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

pub fn default_reward(event_type: EventType) -> f64 {
    match event_type {
        EventType::View => 0.0,
        EventType::Click => 0.1,
        EventType::AddToCart => 0.4,
        EventType::Purchase => 1.0,
        EventType::Reject => -0.3,
        EventType::Out => -0.2,
        EventType::Chat => 0.05,
        EventType::Recommendation => 0.02,
    }
}

pub fn default_done(event_type: EventType) -> bool {
    matches!(event_type, EventType::Purchase | EventType::Out)
}

/// Accepts RFC 3339, naive date-times (read as UTC) and bare dates.
pub fn parse_occurred_at(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }

    for format in NAIVE_DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }

    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn clean_identifier(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|trimmed| !trimmed.is_empty())
        .map(str::to_string)
}

fn metadata_object(value: Option<&Value>) -> Option<&Metadata> {
    value.and_then(Value::as_object)
}

fn finite(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}

pub fn resolve_reward(raw: &RawInteraction) -> f64 {
    if let Some(reward) = raw.reward.and_then(finite) {
        return reward;
    }

    let metadata_reward = metadata_object(raw.metadata.as_ref())
        .and_then(|metadata| metadata.get("reward"))
        .and_then(Value::as_f64)
        .and_then(finite);
    if let Some(reward) = metadata_reward {
        return reward;
    }

    default_reward(raw.event_type)
}

pub fn resolve_done(raw: &RawInteraction) -> bool {
    if let Some(done) = raw.done {
        return done;
    }

    let metadata_done = metadata_object(raw.metadata.as_ref())
        .and_then(|metadata| metadata.get("done"))
        .and_then(Value::as_bool);
    if let Some(done) = metadata_done {
        return done;
    }

    default_done(raw.event_type)
}

fn resolve_step_hint(raw: Option<f64>) -> Option<i64> {
    raw.and_then(finite)
        .map(|hint| hint.floor().clamp(1.0, i64::MAX as f64) as i64)
}

/// Returns `None` when the timestamp is present but unparsable.
pub fn normalize_event(raw: &RawInteraction, now: DateTime<Utc>) -> Option<NormalizedEvent> {
    let occurred_at = match raw.occurred_at.as_deref() {
        None => now,
        Some(text) => match parse_occurred_at(text) {
            Some(ts) => ts,
            None => {
                warn!("dropping interaction event with unparsable occurred_at: {text:?}");
                return None;
            }
        },
    };

    Some(NormalizedEvent {
        user_id: clean_identifier(raw.user_id.as_deref()),
        session_id: clean_identifier(raw.session_id.as_deref()),
        product_id: clean_identifier(raw.product_id.as_deref()),
        event_type: raw.event_type,
        metadata: metadata_object(raw.metadata.as_ref()).cloned(),
        occurred_at: occurred_at.trunc_subsecs(6),
        reward: resolve_reward(raw),
        done: resolve_done(raw),
        requested_step_number: resolve_step_hint(raw.step_number),
    })
}

/// Normalizes a submission, returning the accepted events and the number dropped.
pub fn normalize_events(raws: &[RawInteraction]) -> (Vec<NormalizedEvent>, usize) {
    let now = Utc::now();
    let accepted: Vec<NormalizedEvent> = raws
        .iter()
        .filter_map(|raw| normalize_event(raw, now))
        .collect();
    let dropped = raws.len() - accepted.len();
    (accepted, dropped)
}
