use crate::model::NormalizedEvent;
use shoptrace_config::AnonymousSessionPolicy;
use std::collections::HashMap;

pub const ANONYMOUS_SESSION_KEY: &str = "anonymous_session";
const USER_SESSION_PREFIX: &str = "user:";
const ANONYMOUS_SESSION_PREFIX: &str = "anon:";

pub fn session_key(event: &NormalizedEvent) -> String {
    match (&event.session_id, &event.user_id) {
        (Some(session_id), _) => session_id.clone(),
        (None, Some(user_id)) => format!("{USER_SESSION_PREFIX}{user_id}"),
        (None, None) => ANONYMOUS_SESSION_KEY.to_string(),
    }
}

/// Under `per_event`, gives each fully anonymous event its own explicit session.
pub fn assign_anonymous_sessions(events: &mut [NormalizedEvent], policy: AnonymousSessionPolicy) {
    if policy != AnonymousSessionPolicy::PerEvent {
        return;
    }

    for event in events
        .iter_mut()
        .filter(|event| event.session_id.is_none() && event.user_id.is_none())
    {
        event.session_id = Some(format!(
            "{ANONYMOUS_SESSION_PREFIX}{}",
            uuid::Uuid::new_v4()
        ));
    }
}

/// Stable: events sharing a timestamp keep their submission order.
pub fn sort_chronologically(events: &mut [NormalizedEvent]) {
    events.sort_by_key(|event| event.occurred_at);
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionBatch {
    pub key: String,
    pub events: Vec<NormalizedEvent>,
}

impl SessionBatch {
    /// Explicit session id shared by the batch, if any.
    pub fn session_id(&self) -> Option<&str> {
        self.events
            .first()
            .and_then(|event| event.session_id.as_deref())
    }
}

/// Sorts, then splits into per-session batches in first-appearance order.
pub fn group_by_session(mut events: Vec<NormalizedEvent>) -> Vec<SessionBatch> {
    sort_chronologically(&mut events);

    let mut batches: Vec<SessionBatch> = Vec::new();
    let mut index_by_key: HashMap<String, usize> = HashMap::new();
    for event in events {
        let key = session_key(&event);
        match index_by_key.get(&key) {
            Some(&index) => batches[index].events.push(event),
            None => {
                index_by_key.insert(key.clone(), batches.len());
                batches.push(SessionBatch {
                    key,
                    events: vec![event],
                });
            }
        }
    }
    batches
}
