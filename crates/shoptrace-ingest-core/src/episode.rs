use shoptrace_store::{
    EpisodeState, EpisodeStepMetadata, EventType, InteractionEvent, InteractionStore,
    RlEpisodeStep, StoreResult,
};
use tracing::debug;

/// Replays persisted rows against the episode's prior action history.
pub fn build_episode_steps(
    episode_id: &str,
    prior_history: &[EventType],
    events: &[InteractionEvent],
) -> Vec<RlEpisodeStep> {
    let mut history = prior_history.to_vec();

    events
        .iter()
        .map(|event| {
            let state = EpisodeState::from_history(&history);
            history.push(event.event_type);
            let next_state = EpisodeState::from_history(&history);

            RlEpisodeStep {
                episode_id: episode_id.to_string(),
                user_id: event.user_id.clone(),
                step_number: event.step_number,
                state,
                action: event.event_type,
                reward: event.reward,
                next_state,
                done: event.done,
                metadata: EpisodeStepMetadata {
                    product_id: event.product_id.clone(),
                    delta_seconds: event.delta_seconds,
                    raw_metadata: event.metadata.clone(),
                },
                occurred_at: event.occurred_at,
            }
        })
        .collect()
}

pub async fn record_episode_steps(
    store: &dyn InteractionStore,
    episode_id: &str,
    prior_history: &[EventType],
    events: &[InteractionEvent],
) -> StoreResult<usize> {
    let steps = build_episode_steps(episode_id, prior_history, events);
    if steps.is_empty() {
        return Ok(0);
    }

    store.upsert_episode_steps(&steps).await?;
    debug!("upserted {} episode steps for {episode_id}", steps.len());
    Ok(steps.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn row(step_number: i64, event_type: EventType) -> InteractionEvent {
        InteractionEvent {
            id: format!("id-{step_number}"),
            user_id: Some("u1".to_string()),
            session_id: Some("S1".to_string()),
            product_id: Some("sku-1".to_string()),
            event_type,
            step_number,
            delta_seconds: 2.5,
            reward: 0.1,
            done: false,
            metadata: json!({"page": "pdp"}).as_object().cloned(),
            occurred_at: Utc.with_ymd_and_hms(2026, 2, 17, 0, 0, 0).unwrap(),
            created_at: Utc.with_ymd_and_hms(2026, 2, 17, 0, 0, 1).unwrap(),
        }
    }

    #[test]
    fn states_accumulate_history() {
        let steps = build_episode_steps(
            "S1",
            &[],
            &[
                row(1, EventType::View),
                row(2, EventType::Click),
                row(3, EventType::Purchase),
            ],
        );

        assert_eq!(steps.len(), 3);
        assert!(steps[0].state.history.is_empty());
        assert_eq!(steps[2].state.history, vec![EventType::View, EventType::Click]);
        assert_eq!(steps[2].state.length, 2);
        assert_eq!(steps[2].next_state.length, 3);
        assert_eq!(steps[2].next_state.history.last(), Some(&EventType::Purchase));
    }

    #[test]
    fn prior_history_seeds_the_first_state() {
        let steps = build_episode_steps(
            "S1",
            &[EventType::View, EventType::Chat],
            &[row(3, EventType::AddToCart)],
        );
        assert_eq!(steps[0].step_number, 3);
        assert_eq!(steps[0].state.length, 2);
        assert_eq!(
            steps[0].next_state.history,
            vec![EventType::View, EventType::Chat, EventType::AddToCart]
        );
    }

    #[test]
    fn step_metadata_carries_product_delta_and_raw() {
        let steps = build_episode_steps("S1", &[], &[row(1, EventType::View)]);
        let metadata = &steps[0].metadata;
        assert_eq!(metadata.product_id.as_deref(), Some("sku-1"));
        assert_eq!(metadata.delta_seconds, 2.5);
        assert_eq!(
            metadata.raw_metadata.as_ref().and_then(|raw| raw.get("page")),
            Some(&json!("pdp"))
        );
    }
}
