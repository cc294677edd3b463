use crate::episode::record_episode_steps;
use crate::model::ReconcileReport;
use crate::sequence::append_to_sequence;
use shoptrace_store::{InteractionStore, StoreResult};
use tracing::{debug, warn};

/// Rebuilds a session's rollup and episode steps from its event log.
///
/// Rollup metadata is carried over; everything else is recomputed in step order.
pub async fn reconcile_session(
    store: &dyn InteractionStore,
    session_id: &str,
) -> StoreResult<ReconcileReport> {
    let events = store.events_for_session(session_id).await?;
    let existing = store.load_sequence(session_id).await?;

    let Some(mut rebuilt) = append_to_sequence(session_id, None, &events) else {
        debug!("session {session_id} has no logged events; nothing to reconcile");
        return Ok(ReconcileReport::default());
    };
    rebuilt.metadata = existing.as_ref().and_then(|seq| seq.metadata.clone());

    let repaired = existing.as_ref() != Some(&rebuilt);
    if repaired {
        warn!(
            "session {session_id} rollup diverged from its log (stored length {}, log length {})",
            existing.as_ref().map_or(0, |seq| seq.length),
            rebuilt.length
        );
        store.save_sequence(&rebuilt).await?;
    }

    let episode_steps = record_episode_steps(store, session_id, &[], &events).await?;

    Ok(ReconcileReport {
        sessions: 1,
        repaired: usize::from(repaired),
        events: events.len(),
        episode_steps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;
    use shoptrace_store::{EventType, MemoryStore, NewInteractionEvent};

    fn new_event(step_number: i64, event_type: EventType, offset_secs: i64) -> NewInteractionEvent {
        NewInteractionEvent {
            user_id: Some("u1".to_string()),
            session_id: Some("S1".to_string()),
            product_id: None,
            event_type,
            step_number,
            delta_seconds: 0.0,
            reward: 0.1,
            done: event_type == EventType::Purchase,
            metadata: None,
            occurred_at: Utc.with_ymd_and_hms(2026, 2, 17, 0, 0, 0).unwrap()
                + Duration::seconds(offset_secs),
        }
    }

    #[tokio::test]
    async fn rebuilds_missing_rollup_and_steps_from_log() {
        let store = MemoryStore::new();
        store
            .insert_events(vec![
                new_event(1, EventType::View, 0),
                new_event(2, EventType::Click, 4),
                new_event(3, EventType::Purchase, 9),
            ])
            .await
            .expect("seed log");

        let report = reconcile_session(&store, "S1").await.expect("reconcile");
        assert_eq!(
            report,
            ReconcileReport {
                sessions: 1,
                repaired: 1,
                events: 3,
                episode_steps: 3,
            }
        );

        let sequence = store
            .load_sequence("S1")
            .await
            .expect("load")
            .expect("rebuilt");
        assert_eq!(sequence.length, 3);
        assert_eq!(sequence.time_sequence, vec![0.0, 4.0, 9.0]);
        assert!(sequence.completed_at.is_some());

        let steps = store.episode_steps_for_session("S1").await.expect("steps");
        assert_eq!(steps[2].state.history, vec![EventType::View, EventType::Click]);
    }

    #[tokio::test]
    async fn second_pass_reports_no_repair_and_keeps_metadata() {
        let store = MemoryStore::new();
        store
            .insert_events(vec![new_event(1, EventType::View, 0)])
            .await
            .expect("seed log");
        reconcile_session(&store, "S1").await.expect("first pass");

        let mut sequence = store
            .load_sequence("S1")
            .await
            .expect("load")
            .expect("present");
        sequence.metadata = json!({"channel": "web"}).as_object().cloned();
        store.save_sequence(&sequence).await.expect("annotate");

        let report = reconcile_session(&store, "S1").await.expect("second pass");
        assert_eq!(report.repaired, 0);
        assert_eq!(report.episode_steps, 1);
        let reloaded = store.load_sequence("S1").await.expect("load");
        assert_eq!(reloaded, Some(sequence));
    }

    #[tokio::test]
    async fn unknown_session_is_empty_report() {
        let store = MemoryStore::new();
        let report = reconcile_session(&store, "missing").await.expect("reconcile");
        assert_eq!(report, ReconcileReport::default());
    }
}
