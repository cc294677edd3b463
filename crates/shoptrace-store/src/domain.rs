use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

pub type Metadata = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    View,
    Click,
    AddToCart,
    Purchase,
    Reject,
    Out,
    Chat,
    Recommendation,
}

impl EventType {
    pub const ALL: [EventType; 8] = [
        Self::View,
        Self::Click,
        Self::AddToCart,
        Self::Purchase,
        Self::Reject,
        Self::Out,
        Self::Chat,
        Self::Recommendation,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::View => "view",
            Self::Click => "click",
            Self::AddToCart => "add_to_cart",
            Self::Purchase => "purchase",
            Self::Reject => "reject",
            Self::Out => "out",
            Self::Chat => "chat",
            Self::Recommendation => "recommendation",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == raw)
            .ok_or_else(|| {
                format!(
                    "unsupported event type `{raw}`; expected one of: {}",
                    Self::ALL.map(EventType::as_str).join(", ")
                )
            })
    }
}

/// A row handed to the store for insertion; the store assigns `id` and `created_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewInteractionEvent {
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub product_id: Option<String>,
    pub event_type: EventType,
    pub step_number: i64,
    pub delta_seconds: f64,
    pub reward: f64,
    pub done: bool,
    pub metadata: Option<Metadata>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionEvent {
    pub id: String,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub product_id: Option<String>,
    pub event_type: EventType,
    pub step_number: i64,
    pub delta_seconds: f64,
    pub reward: f64,
    pub done: bool,
    pub metadata: Option<Metadata>,
    pub occurred_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl InteractionEvent {
    pub fn from_new(event: NewInteractionEvent, id: String, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            user_id: event.user_id,
            session_id: event.session_id,
            product_id: event.product_id,
            event_type: event.event_type,
            step_number: event.step_number,
            delta_seconds: event.delta_seconds,
            reward: event.reward,
            done: event.done,
            metadata: event.metadata,
            occurred_at: event.occurred_at,
            created_at,
        }
    }
}

/// Per-session rollup. The four `*_sequence` lists are parallel and always
/// share `length`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSequence {
    pub session_id: String,
    pub user_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub length: usize,
    pub action_sequence: Vec<EventType>,
    pub product_sequence: Vec<String>,
    pub time_sequence: Vec<f64>,
    pub reward_sequence: Vec<f64>,
    pub metadata: Option<Metadata>,
}

impl SessionSequence {
    pub fn new(
        session_id: impl Into<String>,
        user_id: Option<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            user_id,
            started_at,
            completed_at: None,
            length: 0,
            action_sequence: Vec::new(),
            product_sequence: Vec::new(),
            time_sequence: Vec::new(),
            reward_sequence: Vec::new(),
            metadata: None,
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.action_sequence.len() == self.length
            && self.product_sequence.len() == self.length
            && self.time_sequence.len() == self.length
            && self.reward_sequence.len() == self.length
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EpisodeState {
    pub history: Vec<EventType>,
    pub length: usize,
}

impl EpisodeState {
    pub fn from_history(history: &[EventType]) -> Self {
        Self {
            history: history.to_vec(),
            length: history.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeStepMetadata {
    pub product_id: Option<String>,
    pub delta_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_metadata: Option<Metadata>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RlEpisodeStep {
    pub episode_id: String,
    pub user_id: Option<String>,
    pub step_number: i64,
    pub state: EpisodeState,
    pub action: EventType,
    pub reward: f64,
    pub next_state: EpisodeState,
    pub done: bool,
    pub metadata: EpisodeStepMetadata,
    pub occurred_at: DateTime<Utc>,
}

/// Position after the last row of a reverse-chronological listing page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCursor {
    pub occurred_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub id: String,
}

impl EventCursor {
    pub fn after(event: &InteractionEvent) -> Self {
        Self {
            occurred_at: event.occurred_at,
            created_at: event.created_at,
            id: event.id.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageRequest {
    #[serde(default)]
    pub limit: Option<u16>,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub cursor: Option<String>,
}

impl PageRequest {
    pub fn normalized_limit(&self, default_limit: u16, max_limit: u16) -> u16 {
        self.limit.unwrap_or(default_limit).max(1).min(max_limit.max(1))
    }
}

/// Resolved listing query as seen by a store.
#[derive(Debug, Clone)]
pub struct EventListQuery {
    pub limit: usize,
    pub offset: u64,
    pub after: Option<EventCursor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub next_cursor: Option<String>,
}
