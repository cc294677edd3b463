use crate::grouping::SessionBatch;
use crate::model::NormalizedEvent;
use chrono::{DateTime, Utc};
use shoptrace_store::{InteractionEvent, InteractionStore, NewInteractionEvent, StoreResult};
use tracing::debug;

/// Where a session's log currently ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionCursor {
    pub last_step: i64,
    pub last_occurred_at: Option<DateTime<Utc>>,
}

impl SessionCursor {
    pub fn after(event: &InteractionEvent) -> Self {
        Self {
            last_step: event.step_number,
            last_occurred_at: Some(event.occurred_at),
        }
    }
}

fn seconds_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> f64 {
    let micros = (later - earlier).num_microseconds().unwrap_or(i64::MAX);
    (micros as f64 / 1_000_000.0).max(0.0)
}

/// Assigns step numbers and deltas for a chronological batch.
///
/// A step hint is taken only when it moves the counter forward, so gaps are
/// allowed but steps never repeat within a call.
pub fn plan_rows(events: &[NormalizedEvent], cursor: SessionCursor) -> Vec<NewInteractionEvent> {
    let mut counter = cursor.last_step;
    let mut previous = cursor.last_occurred_at;

    events
        .iter()
        .map(|event| {
            let step_number = match event.requested_step_number {
                Some(hint) if hint > counter => hint,
                _ => counter.saturating_add(1),
            };
            counter = step_number;

            let delta_seconds = previous
                .map(|prev| seconds_between(prev, event.occurred_at))
                .unwrap_or(0.0);
            previous = Some(event.occurred_at);

            NewInteractionEvent {
                user_id: event.user_id.clone(),
                session_id: event.session_id.clone(),
                product_id: event.product_id.clone(),
                event_type: event.event_type,
                step_number,
                delta_seconds,
                reward: event.reward,
                done: event.done,
                metadata: event.metadata.clone(),
                occurred_at: event.occurred_at,
            }
        })
        .collect()
}

/// Continues the session's log from its last persisted step and writes the
/// batch in one store call.
pub async fn write_event_log(
    store: &dyn InteractionStore,
    batch: &SessionBatch,
) -> StoreResult<Vec<InteractionEvent>> {
    if batch.events.is_empty() {
        return Ok(Vec::new());
    }

    let cursor = match batch.session_id() {
        Some(session_id) => store
            .last_event_for_session(session_id)
            .await?
            .as_ref()
            .map(SessionCursor::after)
            .unwrap_or_default(),
        None => SessionCursor::default(),
    };

    let rows = plan_rows(&batch.events, cursor);
    debug!(
        "writing {} events for session {} from step {}",
        rows.len(),
        batch.key,
        cursor.last_step + 1
    );
    store.insert_events(rows).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use shoptrace_store::{EventType, MemoryStore};

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 17, 0, 0, 0).unwrap()
    }

    fn event(offset_millis: i64, hint: Option<i64>) -> NormalizedEvent {
        NormalizedEvent {
            user_id: Some("u1".to_string()),
            session_id: Some("S1".to_string()),
            product_id: None,
            event_type: EventType::View,
            metadata: None,
            occurred_at: base_time() + Duration::milliseconds(offset_millis),
            reward: 0.0,
            done: false,
            requested_step_number: hint,
        }
    }

    #[test]
    fn fresh_session_numbers_from_one_with_zero_first_delta() {
        let rows = plan_rows(
            &[event(0, None), event(5_000, None), event(12_000, None)],
            SessionCursor::default(),
        );
        let steps: Vec<i64> = rows.iter().map(|row| row.step_number).collect();
        let deltas: Vec<f64> = rows.iter().map(|row| row.delta_seconds).collect();
        assert_eq!(steps, vec![1, 2, 3]);
        assert_eq!(deltas, vec![0.0, 5.0, 7.0]);
    }

    #[test]
    fn continues_from_persisted_position() {
        let cursor = SessionCursor {
            last_step: 3,
            last_occurred_at: Some(base_time() + Duration::seconds(12)),
        };
        let rows = plan_rows(&[event(20_500, None)], cursor);
        assert_eq!(rows[0].step_number, 4);
        assert_eq!(rows[0].delta_seconds, 8.5);
    }

    #[test]
    fn earlier_event_than_last_persisted_has_zero_delta() {
        let cursor = SessionCursor {
            last_step: 1,
            last_occurred_at: Some(base_time() + Duration::seconds(60)),
        };
        let rows = plan_rows(&[event(0, None)], cursor);
        assert_eq!(rows[0].delta_seconds, 0.0);
    }

    #[test]
    fn hints_create_gaps_only_when_moving_forward() {
        let rows = plan_rows(
            &[
                event(0, None),
                event(1_000, Some(10)),
                event(2_000, Some(4)),
                event(3_000, Some(11)),
            ],
            SessionCursor::default(),
        );
        let steps: Vec<i64> = rows.iter().map(|row| row.step_number).collect();
        assert_eq!(steps, vec![1, 10, 11, 12]);
    }

    #[tokio::test]
    async fn user_bucket_restarts_numbering_each_call() {
        let store = MemoryStore::new();
        let mut first = event(0, None);
        first.session_id = None;
        let batch = SessionBatch {
            key: "user:u1".to_string(),
            events: vec![first],
        };

        let written = write_event_log(&store, &batch).await.expect("first write");
        assert_eq!(written[0].step_number, 1);
        let written = write_event_log(&store, &batch).await.expect("second write");
        assert_eq!(written[0].step_number, 1);
    }

    #[tokio::test]
    async fn empty_batch_is_a_no_op() {
        let store = MemoryStore::new();
        let batch = SessionBatch {
            key: "S1".to_string(),
            events: Vec::new(),
        };
        let written = write_event_log(&store, &batch).await.expect("write");
        assert!(written.is_empty());
        assert_eq!(store.count_events_for_session("S1").await.expect("count"), 0);
    }
}
