pub mod episode;
pub mod grouping;
pub mod locks;
pub mod model;
pub mod normalize;
pub mod reconcile;
pub mod sequence;
pub mod writer;

use crate::episode::record_episode_steps;
use crate::grouping::{assign_anonymous_sessions, group_by_session, SessionBatch};
use crate::locks::SessionLocks;
use crate::normalize::normalize_events;
use crate::sequence::update_session_sequence;
use crate::writer::write_event_log;
use shoptrace_config::IngestConfig;
use shoptrace_store::{
    decode_cursor, EventCursor, EventListQuery, InteractionEvent, InteractionStore, Page, PageRequest,
    StoreError, StoreResult,
};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};

pub use crate::model::{IngestReport, NormalizedEvent, RawInteraction, ReconcileReport};

/// Entry point for ingestion, listing and reconciliation over one store.
#[derive(Clone)]
pub struct IngestPipeline {
    store: Arc<dyn InteractionStore>,
    config: IngestConfig,
    locks: Arc<SessionLocks>,
}

impl IngestPipeline {
    pub fn new(store: Arc<dyn InteractionStore>, config: IngestConfig) -> Self {
        Self {
            store,
            config,
            locks: Arc::new(SessionLocks::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn InteractionStore> {
        &self.store
    }

    /// Single-event form of [`Self::log_interactions`]; `None` when the event was dropped.
    pub async fn log_interaction(&self, raw: RawInteraction) -> StoreResult<Option<InteractionEvent>> {
        let report = self.log_interactions(std::slice::from_ref(&raw)).await?;
        Ok(report.accepted.into_iter().next())
    }

    /// Normalizes, groups and persists a submission.
    ///
    /// Sessions run concurrently. Every session task is drained before an
    /// error is returned, so no write is left running after the call.
    pub async fn log_interactions(&self, raws: &[RawInteraction]) -> StoreResult<IngestReport> {
        let (mut events, dropped) = normalize_events(raws);
        assign_anonymous_sessions(&mut events, self.config.anonymous_sessions);
        let batches = group_by_session(events);
        let sessions = batches.len();

        let semaphore = Arc::new(Semaphore::new(self.config.max_session_workers.max(1)));
        let mut tasks = JoinSet::new();
        for (index, batch) in batches.into_iter().enumerate() {
            tasks.spawn(run_session(
                Arc::clone(&self.store),
                Arc::clone(&self.locks),
                Arc::clone(&semaphore),
                index,
                batch,
            ));
        }

        let mut written: Vec<(usize, Vec<InteractionEvent>)> = Vec::with_capacity(sessions);
        let mut first_error: Option<StoreError> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(result)) => written.push(result),
                Ok(Err(err)) => {
                    first_error.get_or_insert(err);
                }
                Err(err) => {
                    first_error
                        .get_or_insert(StoreError::backend(format!("session task failed: {err}")));
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        written.sort_by_key(|(index, _)| *index);
        let accepted: Vec<InteractionEvent> =
            written.into_iter().flat_map(|(_, rows)| rows).collect();

        info!(
            "logged {} interaction events across {sessions} sessions ({dropped} dropped)",
            accepted.len()
        );
        Ok(IngestReport {
            accepted,
            dropped,
            sessions,
        })
    }

    pub async fn list_interactions(
        &self,
        request: PageRequest,
    ) -> StoreResult<Page<InteractionEvent>> {
        let limit =
            request.normalized_limit(self.config.default_page_size, self.config.max_page_size);
        let after: Option<EventCursor> = request.cursor.as_deref().map(decode_cursor).transpose()?;

        self.store
            .list_events(EventListQuery {
                limit: usize::from(limit),
                offset: request.offset,
                after,
            })
            .await
    }

    pub async fn reconcile_session(&self, session_id: &str) -> StoreResult<ReconcileReport> {
        let _guard = self.locks.acquire(session_id).await;
        reconcile::reconcile_session(self.store.as_ref(), session_id).await
    }

    pub async fn reconcile_all(&self) -> StoreResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        for session_id in self.store.session_ids().await? {
            report.absorb(self.reconcile_session(&session_id).await?);
        }

        info!(
            "reconciled {} sessions ({} repaired, {} episode steps)",
            report.sessions, report.repaired, report.episode_steps
        );
        Ok(report)
    }
}

async fn run_session(
    store: Arc<dyn InteractionStore>,
    locks: Arc<SessionLocks>,
    semaphore: Arc<Semaphore>,
    index: usize,
    batch: SessionBatch,
) -> StoreResult<(usize, Vec<InteractionEvent>)> {
    let _permit = semaphore
        .acquire_owned()
        .await
        .map_err(|err| StoreError::backend(format!("session worker pool closed: {err}")))?;
    let _guard = locks.acquire(&batch.key).await;

    let rows = ingest_session(store.as_ref(), &batch).await?;
    Ok((index, rows))
}

/// Log, rollup, then episode steps for one session. Only explicit sessions
/// carry a rollup and an episode.
async fn ingest_session(
    store: &dyn InteractionStore,
    batch: &SessionBatch,
) -> StoreResult<Vec<InteractionEvent>> {
    let Some(session_id) = batch.session_id() else {
        debug!(
            "session {} has no explicit id; writing log rows only",
            batch.key
        );
        return write_event_log(store, batch).await;
    };

    let existing = store.load_sequence(session_id).await?;
    let prior_history = existing
        .as_ref()
        .map(|sequence| sequence.action_sequence.clone())
        .unwrap_or_default();

    let persisted = write_event_log(store, batch).await?;
    update_session_sequence(store, session_id, existing, &persisted).await?;
    record_episode_steps(store, session_id, &prior_history, &persisted).await?;
    Ok(persisted)
}
