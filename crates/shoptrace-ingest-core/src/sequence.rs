use chrono::{DateTime, Utc};
use shoptrace_store::{InteractionEvent, InteractionStore, SessionSequence, StoreResult};
use tracing::debug;

fn elapsed_seconds(started_at: DateTime<Utc>, at: DateTime<Utc>) -> f64 {
    match (at - started_at).num_microseconds() {
        Some(micros) => micros as f64 / 1_000_000.0,
        None => (at - started_at).num_milliseconds() as f64 / 1_000.0,
    }
}

/// Appends persisted rows to a rollup, creating it from the first row when absent.
///
/// Elapsed time is measured from `started_at` and can be negative when an
/// older event arrives in a later call.
pub fn append_to_sequence(
    session_id: &str,
    existing: Option<SessionSequence>,
    events: &[InteractionEvent],
) -> Option<SessionSequence> {
    let first = events.first()?;
    let mut sequence = existing.unwrap_or_else(|| {
        SessionSequence::new(session_id, first.user_id.clone(), first.occurred_at)
    });

    for event in events {
        sequence.action_sequence.push(event.event_type);
        sequence
            .product_sequence
            .push(event.product_id.clone().unwrap_or_default());
        sequence
            .time_sequence
            .push(elapsed_seconds(sequence.started_at, event.occurred_at));
        sequence.reward_sequence.push(event.reward);
        if event.done {
            sequence.completed_at = Some(event.occurred_at);
        }
        if sequence.user_id.is_none() {
            sequence.user_id = event.user_id.clone();
        }
    }
    sequence.length = sequence.action_sequence.len();

    debug_assert!(sequence.is_consistent());
    Some(sequence)
}

pub async fn update_session_sequence(
    store: &dyn InteractionStore,
    session_id: &str,
    existing: Option<SessionSequence>,
    events: &[InteractionEvent],
) -> StoreResult<Option<SessionSequence>> {
    let Some(sequence) = append_to_sequence(session_id, existing, events) else {
        return Ok(None);
    };

    store.save_sequence(&sequence).await?;
    debug!(
        "session {session_id} sequence now has {} actions",
        sequence.length
    );
    Ok(Some(sequence))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use shoptrace_store::EventType;

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 17, 0, 0, 0).unwrap()
    }

    fn row(
        step_number: i64,
        event_type: EventType,
        offset_secs: i64,
        user_id: Option<&str>,
    ) -> InteractionEvent {
        InteractionEvent {
            id: format!("id-{step_number}"),
            user_id: user_id.map(str::to_string),
            session_id: Some("S1".to_string()),
            product_id: (event_type != EventType::Chat).then(|| format!("sku-{step_number}")),
            event_type,
            step_number,
            delta_seconds: 0.0,
            reward: 0.5,
            done: matches!(event_type, EventType::Purchase | EventType::Out),
            metadata: None,
            occurred_at: base_time() + Duration::seconds(offset_secs),
            created_at: base_time(),
        }
    }

    #[test]
    fn new_sequence_starts_at_first_event() {
        let sequence = append_to_sequence(
            "S1",
            None,
            &[
                row(1, EventType::View, 0, None),
                row(2, EventType::Chat, 5, Some("u1")),
            ],
        )
        .expect("sequence");

        assert_eq!(sequence.started_at, base_time());
        assert_eq!(sequence.length, 2);
        assert_eq!(sequence.product_sequence, vec!["sku-1".to_string(), String::new()]);
        assert_eq!(sequence.time_sequence, vec![0.0, 5.0]);
        assert_eq!(sequence.user_id.as_deref(), Some("u1"));
        assert!(sequence.completed_at.is_none());
        assert!(sequence.is_consistent());
    }

    #[test]
    fn later_batches_append_and_last_terminal_wins() {
        let existing = append_to_sequence(
            "S1",
            None,
            &[
                row(1, EventType::View, 10, Some("u1")),
                row(2, EventType::Out, 20, Some("u1")),
            ],
        );
        let sequence = append_to_sequence(
            "S1",
            existing,
            &[
                row(3, EventType::View, 5, Some("u2")),
                row(4, EventType::Purchase, 40, Some("u2")),
            ],
        )
        .expect("sequence");

        assert_eq!(sequence.length, 4);
        assert_eq!(sequence.time_sequence, vec![0.0, 10.0, -5.0, 30.0]);
        assert_eq!(sequence.completed_at, Some(base_time() + Duration::seconds(40)));
        assert_eq!(sequence.user_id.as_deref(), Some("u1"));
    }

    #[test]
    fn empty_batch_produces_nothing() {
        assert!(append_to_sequence("S1", None, &[]).is_none());
    }
}
