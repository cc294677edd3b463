use async_trait::async_trait;

use crate::domain::{
    EventListQuery, InteractionEvent, NewInteractionEvent, Page, RlEpisodeStep, SessionSequence,
};
use crate::error::StoreResult;

/// Storage boundary for the interaction pipeline.
///
/// Implementations must reject a second event-log row for the same
/// `(session_id, step_number)` with [`crate::StoreError::DuplicateStep`]
/// and must treat episode steps as an upsert keyed by
/// `(episode_id, step_number)`.
#[async_trait]
pub trait InteractionStore: Send + Sync {
    /// Most recent persisted event for a session, by step number.
    async fn last_event_for_session(
        &self,
        session_id: &str,
    ) -> StoreResult<Option<InteractionEvent>>;

    /// Persists a whole batch as one write. Either every row lands or none does.
    async fn insert_events(
        &self,
        events: Vec<NewInteractionEvent>,
    ) -> StoreResult<Vec<InteractionEvent>>;

    async fn load_sequence(&self, session_id: &str) -> StoreResult<Option<SessionSequence>>;

    /// Inserts or fully replaces the aggregate for `sequence.session_id`.
    async fn save_sequence(&self, sequence: &SessionSequence) -> StoreResult<()>;

    async fn upsert_episode_steps(&self, steps: &[RlEpisodeStep]) -> StoreResult<()>;

    /// Reverse-chronological listing of the event log.
    async fn list_events(&self, query: EventListQuery) -> StoreResult<Page<InteractionEvent>>;

    /// Every event of a session, ascending by step number.
    async fn events_for_session(&self, session_id: &str) -> StoreResult<Vec<InteractionEvent>>;

    async fn count_events_for_session(&self, session_id: &str) -> StoreResult<u64>;

    /// Every step of an episode, ascending by step number.
    async fn episode_steps_for_session(&self, episode_id: &str)
        -> StoreResult<Vec<RlEpisodeStep>>;

    /// Distinct explicit session ids present in the event log.
    async fn session_ids(&self) -> StoreResult<Vec<String>>;
}
