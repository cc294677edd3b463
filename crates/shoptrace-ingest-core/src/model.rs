use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shoptrace_store::{EventType, InteractionEvent, Metadata};

/// One event as submitted by a caller, before any coercion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawInteraction {
    #[serde(default, alias = "userId")]
    pub user_id: Option<String>,
    #[serde(default, alias = "sessionId")]
    pub session_id: Option<String>,
    #[serde(default, alias = "productId")]
    pub product_id: Option<String>,
    #[serde(alias = "eventType")]
    pub event_type: EventType,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default, alias = "occurredAt")]
    pub occurred_at: Option<String>,
    #[serde(default)]
    pub reward: Option<f64>,
    #[serde(default)]
    pub done: Option<bool>,
    #[serde(default, alias = "stepNumber")]
    pub step_number: Option<f64>,
}

impl RawInteraction {
    pub fn new(event_type: EventType) -> Self {
        Self {
            user_id: None,
            session_id: None,
            product_id: None,
            event_type,
            metadata: None,
            occurred_at: None,
            reward: None,
            done: None,
            step_number: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEvent {
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub product_id: Option<String>,
    pub event_type: EventType,
    pub metadata: Option<Metadata>,
    pub occurred_at: DateTime<Utc>,
    pub reward: f64,
    pub done: bool,
    pub requested_step_number: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    /// Persisted rows, grouped by session in first-appearance order, then by step.
    pub accepted: Vec<InteractionEvent>,
    pub dropped: usize,
    pub sessions: usize,
}

impl IngestReport {
    pub fn created(&self) -> usize {
        self.accepted.len()
    }

    pub fn ids(&self) -> Vec<String> {
        self.accepted.iter().map(|event| event.id.clone()).collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub sessions: usize,
    /// Sessions whose stored sequence disagreed with the event log before the pass.
    pub repaired: usize,
    pub events: usize,
    pub episode_steps: usize,
}

impl ReconcileReport {
    pub(crate) fn absorb(&mut self, other: ReconcileReport) {
        self.sessions += other.sessions;
        self.repaired += other.repaired;
        self.events += other.events;
        self.episode_steps += other.episode_steps;
    }
}
