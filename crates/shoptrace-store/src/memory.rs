use async_trait::async_trait;
use chrono::{SubsecRound, Utc};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::cursor::encode_cursor;
use crate::domain::{
    EventCursor, EventListQuery, InteractionEvent, NewInteractionEvent, Page, RlEpisodeStep,
    SessionSequence,
};
use crate::error::{StoreError, StoreResult};
use crate::repo::InteractionStore;

#[derive(Default)]
struct MemoryState {
    events: Vec<InteractionEvent>,
    sequences: HashMap<String, SessionSequence>,
    steps: BTreeMap<(String, i64), RlEpisodeStep>,
}

/// Process-local store with the same constraint semantics as the SQLite store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut out = f.debug_struct("MemoryStore");
        if let Ok(state) = self.state.read() {
            out.field("events", &state.events.len())
                .field("sequences", &state.sequences.len())
                .field("steps", &state.steps.len());
        }
        out.finish()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, MemoryState>> {
        self.state
            .read()
            .map_err(|_| StoreError::backend("memory store lock poisoned"))
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, MemoryState>> {
        self.state
            .write()
            .map_err(|_| StoreError::backend("memory store lock poisoned"))
    }
}

fn event_tuple(event: &InteractionEvent) -> (i64, i64, &str) {
    (
        event.occurred_at.timestamp_micros(),
        event.created_at.timestamp_micros(),
        event.id.as_str(),
    )
}

fn cursor_tuple(cursor: &EventCursor) -> (i64, i64, &str) {
    (
        cursor.occurred_at.timestamp_micros(),
        cursor.created_at.timestamp_micros(),
        cursor.id.as_str(),
    )
}

#[async_trait]
impl InteractionStore for MemoryStore {
    async fn last_event_for_session(
        &self,
        session_id: &str,
    ) -> StoreResult<Option<InteractionEvent>> {
        let state = self.read()?;
        Ok(state
            .events
            .iter()
            .filter(|event| event.session_id.as_deref() == Some(session_id))
            .max_by_key(|event| event.step_number)
            .cloned())
    }

    async fn insert_events(
        &self,
        events: Vec<NewInteractionEvent>,
    ) -> StoreResult<Vec<InteractionEvent>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let mut state = self.write()?;
        let mut taken: HashSet<(String, i64)> = state
            .events
            .iter()
            .filter_map(|event| {
                event
                    .session_id
                    .clone()
                    .map(|session_id| (session_id, event.step_number))
            })
            .collect();

        for event in &events {
            if let Some(session_id) = &event.session_id {
                if !taken.insert((session_id.clone(), event.step_number)) {
                    return Err(StoreError::duplicate_step(
                        session_id.clone(),
                        event.step_number,
                    ));
                }
            }
        }

        let created_at = Utc::now().trunc_subsecs(6);
        let saved: Vec<InteractionEvent> = events
            .into_iter()
            .map(|event| {
                InteractionEvent::from_new(event, uuid::Uuid::new_v4().to_string(), created_at)
            })
            .collect();
        state.events.extend(saved.iter().cloned());
        Ok(saved)
    }

    async fn load_sequence(&self, session_id: &str) -> StoreResult<Option<SessionSequence>> {
        Ok(self.read()?.sequences.get(session_id).cloned())
    }

    async fn save_sequence(&self, sequence: &SessionSequence) -> StoreResult<()> {
        self.write()?
            .sequences
            .insert(sequence.session_id.clone(), sequence.clone());
        Ok(())
    }

    async fn upsert_episode_steps(&self, steps: &[RlEpisodeStep]) -> StoreResult<()> {
        let mut state = self.write()?;
        for step in steps {
            state
                .steps
                .insert((step.episode_id.clone(), step.step_number), step.clone());
        }
        Ok(())
    }

    async fn list_events(&self, query: EventListQuery) -> StoreResult<Page<InteractionEvent>> {
        let state = self.read()?;
        let mut ordered: Vec<&InteractionEvent> = state.events.iter().collect();
        ordered.sort_by_key(|event| Reverse(event_tuple(*event)));

        let total = ordered.len() as u64;
        let start = match &query.after {
            Some(after) => {
                let after = cursor_tuple(after);
                ordered
                    .iter()
                    .position(|event| event_tuple(event) < after)
                    .unwrap_or(ordered.len())
            }
            None => (query.offset.min(total)) as usize,
        };

        let mut items: Vec<InteractionEvent> = ordered
            .into_iter()
            .skip(start)
            .take(query.limit + 1)
            .cloned()
            .collect();

        let next_cursor = if items.len() > query.limit {
            items.truncate(query.limit);
            items
                .last()
                .map(|last| encode_cursor(&EventCursor::after(last)))
                .transpose()?
        } else {
            None
        };

        Ok(Page {
            items,
            total,
            next_cursor,
        })
    }

    async fn events_for_session(&self, session_id: &str) -> StoreResult<Vec<InteractionEvent>> {
        let state = self.read()?;
        let mut events: Vec<InteractionEvent> = state
            .events
            .iter()
            .filter(|event| event.session_id.as_deref() == Some(session_id))
            .cloned()
            .collect();
        events.sort_by_key(|event| event.step_number);
        Ok(events)
    }

    async fn count_events_for_session(&self, session_id: &str) -> StoreResult<u64> {
        let state = self.read()?;
        Ok(state
            .events
            .iter()
            .filter(|event| event.session_id.as_deref() == Some(session_id))
            .count() as u64)
    }

    async fn episode_steps_for_session(
        &self,
        episode_id: &str,
    ) -> StoreResult<Vec<RlEpisodeStep>> {
        let state = self.read()?;
        Ok(state
            .steps
            .range((episode_id.to_string(), i64::MIN)..=(episode_id.to_string(), i64::MAX))
            .map(|(_, step)| step.clone())
            .collect())
    }

    async fn session_ids(&self) -> StoreResult<Vec<String>> {
        let state = self.read()?;
        let ids: BTreeSet<String> = state
            .events
            .iter()
            .filter_map(|event| event.session_id.clone())
            .collect();
        Ok(ids.into_iter().collect())
    }
}
