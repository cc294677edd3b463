mod cursor;
mod domain;
mod error;
mod memory;
mod repo;
mod sqlite;

pub use cursor::{decode_cursor, encode_cursor};
pub use domain::{
    EpisodeState, EpisodeStepMetadata, EventCursor, EventListQuery, EventType, InteractionEvent,
    Metadata, NewInteractionEvent, Page, PageRequest, RlEpisodeStep, SessionSequence,
};
pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use repo::InteractionStore;
pub use sqlite::{bundled_migrations, Migration, SqliteStore};
