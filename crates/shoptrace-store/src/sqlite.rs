use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use shoptrace_config::StoreConfig;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

use crate::cursor::encode_cursor;
use crate::domain::{
    EpisodeState, EpisodeStepMetadata, EventCursor, EventListQuery, EventType, InteractionEvent,
    Metadata, NewInteractionEvent, Page, RlEpisodeStep, SessionSequence,
};
use crate::error::{StoreError, StoreResult};
use crate::repo::InteractionStore;

#[derive(Debug, Clone)]
pub struct Migration {
    pub version: &'static str,
    pub name: &'static str,
    pub sql: &'static str,
}

pub fn bundled_migrations() -> Vec<Migration> {
    vec![Migration {
        version: "001",
        name: "001_schema.sql",
        sql: include_str!("../../../sql/001_schema.sql"),
    }]
}

const EVENT_COLUMNS: &str = "id, user_id, session_id, product_id, event_type, step_number, \
     delta_seconds, reward, done, metadata, occurred_at, created_at";

const SEQUENCE_COLUMNS: &str = "session_id, user_id, started_at, completed_at, length, \
     action_sequence, product_sequence, time_sequence, reward_sequence, metadata";

const STEP_COLUMNS: &str = "episode_id, user_id, step_number, state, action, reward, \
     next_state, done, metadata, occurred_at";

/// SQLite-backed store. One connection is shared behind a mutex and every
/// call runs on the blocking pool, holding the connection only for that call.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    pub async fn open(cfg: &StoreConfig) -> StoreResult<Self> {
        Self::open_path(
            PathBuf::from(&cfg.path),
            Duration::from_millis(cfg.busy_timeout_ms),
        )
        .await
    }

    pub async fn open_path(path: PathBuf, busy_timeout: Duration) -> StoreResult<Self> {
        let conn = tokio::task::spawn_blocking(move || -> StoreResult<Connection> {
            ensure_parent_dir(&path)?;
            let conn = Connection::open(&path)?;
            conn.busy_timeout(busy_timeout)?;
            let mode: String =
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
            debug!(
                "opened sqlite store at {} (journal_mode={mode})",
                path.display()
            );
            Ok(conn)
        })
        .await
        .map_err(|err| StoreError::backend(format!("failed to spawn blocking task: {err}")))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run_blocking<F, R>(&self, f: F) -> StoreResult<R>
    where
        F: FnOnce(&mut Connection) -> StoreResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::backend("sqlite connection mutex poisoned"))?;
            f(&mut guard)
        })
        .await
        .map_err(|err| StoreError::backend(format!("blocking task failed: {err}")))?
    }

    pub async fn run_migrations(&self) -> StoreResult<Vec<String>> {
        self.run_blocking(|conn| {
            ensure_migration_ledger(conn)?;
            let applied = applied_migration_versions(conn)?;

            let mut executed = Vec::new();
            for migration in bundled_migrations() {
                if applied.contains(migration.version) {
                    continue;
                }

                let tx = conn.transaction()?;
                tx.execute_batch(migration.sql).map_err(|err| {
                    StoreError::backend(format!("failed migration {}: {err}", migration.name))
                })?;
                tx.execute(
                    "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
                    params![migration.version, migration.name, format_ts(&Utc::now())],
                )?;
                tx.commit()?;

                info!("applied migration {}", migration.name);
                executed.push(migration.version.to_string());
            }

            Ok(executed)
        })
        .await
    }

    pub async fn pending_migration_versions(&self) -> StoreResult<Vec<String>> {
        self.run_blocking(|conn| {
            ensure_migration_ledger(conn)?;
            let applied = applied_migration_versions(conn)?;
            Ok(bundled_migrations()
                .into_iter()
                .filter(|m| !applied.contains(m.version))
                .map(|m| m.version.to_string())
                .collect())
        })
        .await
    }
}

fn ensure_parent_dir(path: &Path) -> StoreResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|err| {
                StoreError::backend(format!(
                    "failed to create store directory {}: {err}",
                    parent.display()
                ))
            })?;
        }
    }
    Ok(())
}

fn ensure_migration_ledger(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (\
         version TEXT PRIMARY KEY, \
         name TEXT NOT NULL, \
         applied_at TEXT NOT NULL)",
    )?;
    Ok(())
}

fn applied_migration_versions(conn: &Connection) -> StoreResult<HashSet<String>> {
    let mut stmt = conn.prepare("SELECT version FROM schema_migrations")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    Ok(rows.collect::<Result<HashSet<_>, _>>()?)
}

/// Fixed-width UTC text so lexical order matches chronological order.
fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| StoreError::serialization(format!("invalid stored timestamp `{raw}`: {err}")))
}

fn parse_event_type(raw: &str) -> StoreResult<EventType> {
    raw.parse::<EventType>().map_err(StoreError::serialization)
}

fn encode_metadata(metadata: Option<&Metadata>) -> StoreResult<Option<String>> {
    metadata
        .map(serde_json::to_string)
        .transpose()
        .map_err(StoreError::from)
}

fn decode_metadata(raw: Option<String>) -> StoreResult<Option<Metadata>> {
    raw.map(|text| serde_json::from_str::<Metadata>(&text))
        .transpose()
        .map_err(StoreError::from)
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(code, _)
            if code.code == ErrorCode::ConstraintViolation
                && code.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

struct EventRow {
    id: String,
    user_id: Option<String>,
    session_id: Option<String>,
    product_id: Option<String>,
    event_type: String,
    step_number: i64,
    delta_seconds: f64,
    reward: f64,
    done: bool,
    metadata: Option<String>,
    occurred_at: String,
    created_at: String,
}

impl EventRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            session_id: row.get(2)?,
            product_id: row.get(3)?,
            event_type: row.get(4)?,
            step_number: row.get(5)?,
            delta_seconds: row.get(6)?,
            reward: row.get(7)?,
            done: row.get(8)?,
            metadata: row.get(9)?,
            occurred_at: row.get(10)?,
            created_at: row.get(11)?,
        })
    }

    fn into_event(self) -> StoreResult<InteractionEvent> {
        Ok(InteractionEvent {
            id: self.id,
            user_id: self.user_id,
            session_id: self.session_id,
            product_id: self.product_id,
            event_type: parse_event_type(&self.event_type)?,
            step_number: self.step_number,
            delta_seconds: self.delta_seconds,
            reward: self.reward,
            done: self.done,
            metadata: decode_metadata(self.metadata)?,
            occurred_at: parse_ts(&self.occurred_at)?,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

struct SequenceRow {
    session_id: String,
    user_id: Option<String>,
    started_at: String,
    completed_at: Option<String>,
    length: i64,
    action_sequence: String,
    product_sequence: String,
    time_sequence: String,
    reward_sequence: String,
    metadata: Option<String>,
}

impl SequenceRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            session_id: row.get(0)?,
            user_id: row.get(1)?,
            started_at: row.get(2)?,
            completed_at: row.get(3)?,
            length: row.get(4)?,
            action_sequence: row.get(5)?,
            product_sequence: row.get(6)?,
            time_sequence: row.get(7)?,
            reward_sequence: row.get(8)?,
            metadata: row.get(9)?,
        })
    }

    fn into_sequence(self) -> StoreResult<SessionSequence> {
        let length = usize::try_from(self.length).map_err(|_| {
            StoreError::serialization(format!(
                "negative sequence length {} for session {}",
                self.length, self.session_id
            ))
        })?;

        Ok(SessionSequence {
            session_id: self.session_id,
            user_id: self.user_id,
            started_at: parse_ts(&self.started_at)?,
            completed_at: self.completed_at.as_deref().map(parse_ts).transpose()?,
            length,
            action_sequence: serde_json::from_str(&self.action_sequence)?,
            product_sequence: serde_json::from_str(&self.product_sequence)?,
            time_sequence: serde_json::from_str(&self.time_sequence)?,
            reward_sequence: serde_json::from_str(&self.reward_sequence)?,
            metadata: decode_metadata(self.metadata)?,
        })
    }
}

struct StepRow {
    episode_id: String,
    user_id: Option<String>,
    step_number: i64,
    state: String,
    action: String,
    reward: f64,
    next_state: Option<String>,
    done: bool,
    metadata: Option<String>,
    occurred_at: String,
}

impl StepRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            episode_id: row.get(0)?,
            user_id: row.get(1)?,
            step_number: row.get(2)?,
            state: row.get(3)?,
            action: row.get(4)?,
            reward: row.get(5)?,
            next_state: row.get(6)?,
            done: row.get(7)?,
            metadata: row.get(8)?,
            occurred_at: row.get(9)?,
        })
    }

    fn into_step(self) -> StoreResult<RlEpisodeStep> {
        let next_state: EpisodeState = match self.next_state {
            Some(raw) => serde_json::from_str(&raw)?,
            None => EpisodeState::default(),
        };
        let metadata: EpisodeStepMetadata = match self.metadata {
            Some(raw) => serde_json::from_str(&raw)?,
            None => EpisodeStepMetadata {
                product_id: None,
                delta_seconds: 0.0,
                raw_metadata: None,
            },
        };

        Ok(RlEpisodeStep {
            episode_id: self.episode_id,
            user_id: self.user_id,
            step_number: self.step_number,
            state: serde_json::from_str(&self.state)?,
            action: parse_event_type(&self.action)?,
            reward: self.reward,
            next_state,
            done: self.done,
            metadata,
            occurred_at: parse_ts(&self.occurred_at)?,
        })
    }
}

fn query_events(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> StoreResult<Vec<InteractionEvent>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, EventRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(EventRow::into_event).collect()
}

#[async_trait]
impl InteractionStore for SqliteStore {
    async fn last_event_for_session(
        &self,
        session_id: &str,
    ) -> StoreResult<Option<InteractionEvent>> {
        let session_id = session_id.to_string();
        self.run_blocking(move |conn| {
            let sql = format!(
                "SELECT {EVENT_COLUMNS} FROM interaction_events \
                 WHERE session_id = ?1 ORDER BY step_number DESC LIMIT 1"
            );
            let row = conn
                .query_row(&sql, params![session_id], EventRow::from_row)
                .optional()?;
            row.map(EventRow::into_event).transpose()
        })
        .await
    }

    async fn insert_events(
        &self,
        events: Vec<NewInteractionEvent>,
    ) -> StoreResult<Vec<InteractionEvent>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        self.run_blocking(move |conn| {
            let created_at = Utc::now().trunc_subsecs(6);
            let created_text = format_ts(&created_at);
            let tx = conn.transaction()?;
            let mut saved = Vec::with_capacity(events.len());
            {
                let mut stmt = tx.prepare(&format!(
                    "INSERT INTO interaction_events ({EVENT_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ))?;

                for event in events {
                    let id = uuid::Uuid::new_v4().to_string();
                    let result = stmt.execute(params![
                        id,
                        event.user_id,
                        event.session_id,
                        event.product_id,
                        event.event_type.as_str(),
                        event.step_number,
                        event.delta_seconds,
                        event.reward,
                        event.done,
                        encode_metadata(event.metadata.as_ref())?,
                        format_ts(&event.occurred_at),
                        created_text,
                    ]);

                    match result {
                        Ok(_) => {}
                        Err(err) if is_unique_violation(&err) => {
                            return Err(StoreError::duplicate_step(
                                event.session_id.unwrap_or_default(),
                                event.step_number,
                            ));
                        }
                        Err(err) => return Err(err.into()),
                    }

                    saved.push(InteractionEvent::from_new(event, id, created_at));
                }
            }
            tx.commit()?;
            Ok(saved)
        })
        .await
    }

    async fn load_sequence(&self, session_id: &str) -> StoreResult<Option<SessionSequence>> {
        let session_id = session_id.to_string();
        self.run_blocking(move |conn| {
            let sql =
                format!("SELECT {SEQUENCE_COLUMNS} FROM session_sequences WHERE session_id = ?1");
            let row = conn
                .query_row(&sql, params![session_id], SequenceRow::from_row)
                .optional()?;
            row.map(SequenceRow::into_sequence).transpose()
        })
        .await
    }

    async fn save_sequence(&self, sequence: &SessionSequence) -> StoreResult<()> {
        let sequence = sequence.clone();
        self.run_blocking(move |conn| {
            let now = format_ts(&Utc::now());
            conn.execute(
                &format!(
                    "INSERT INTO session_sequences ({SEQUENCE_COLUMNS}, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11) \
                     ON CONFLICT(session_id) DO UPDATE SET \
                        user_id = excluded.user_id, \
                        started_at = excluded.started_at, \
                        completed_at = excluded.completed_at, \
                        length = excluded.length, \
                        action_sequence = excluded.action_sequence, \
                        product_sequence = excluded.product_sequence, \
                        time_sequence = excluded.time_sequence, \
                        reward_sequence = excluded.reward_sequence, \
                        metadata = excluded.metadata, \
                        updated_at = excluded.updated_at"
                ),
                params![
                    sequence.session_id,
                    sequence.user_id,
                    format_ts(&sequence.started_at),
                    sequence.completed_at.as_ref().map(format_ts),
                    sequence.length as i64,
                    serde_json::to_string(&sequence.action_sequence)?,
                    serde_json::to_string(&sequence.product_sequence)?,
                    serde_json::to_string(&sequence.time_sequence)?,
                    serde_json::to_string(&sequence.reward_sequence)?,
                    encode_metadata(sequence.metadata.as_ref())?,
                    now,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn upsert_episode_steps(&self, steps: &[RlEpisodeStep]) -> StoreResult<()> {
        if steps.is_empty() {
            return Ok(());
        }

        let steps = steps.to_vec();
        self.run_blocking(move |conn| {
            let now = format_ts(&Utc::now());
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(&format!(
                    "INSERT INTO rl_episode_steps ({STEP_COLUMNS}, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11) \
                     ON CONFLICT(episode_id, step_number) DO UPDATE SET \
                        user_id = excluded.user_id, \
                        state = excluded.state, \
                        action = excluded.action, \
                        reward = excluded.reward, \
                        next_state = excluded.next_state, \
                        done = excluded.done, \
                        metadata = excluded.metadata, \
                        occurred_at = excluded.occurred_at, \
                        updated_at = excluded.updated_at"
                ))?;

                for step in &steps {
                    stmt.execute(params![
                        step.episode_id,
                        step.user_id,
                        step.step_number,
                        serde_json::to_string(&step.state)?,
                        step.action.as_str(),
                        step.reward,
                        serde_json::to_string(&step.next_state)?,
                        step.done,
                        serde_json::to_string(&step.metadata)?,
                        format_ts(&step.occurred_at),
                        now,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn list_events(&self, query: EventListQuery) -> StoreResult<Page<InteractionEvent>> {
        self.run_blocking(move |conn| {
            let total: i64 =
                conn.query_row("SELECT COUNT(*) FROM interaction_events", [], |row| {
                    row.get(0)
                })?;
            let fetch = (query.limit + 1) as i64;
            let order = "ORDER BY occurred_at DESC, created_at DESC, id DESC";

            let mut items = match &query.after {
                Some(after) => query_events(
                    conn,
                    &format!(
                        "SELECT {EVENT_COLUMNS} FROM interaction_events \
                         WHERE (occurred_at, created_at, id) < (?1, ?2, ?3) {order} LIMIT ?4"
                    ),
                    params![
                        format_ts(&after.occurred_at),
                        format_ts(&after.created_at),
                        after.id,
                        fetch
                    ],
                )?,
                None => query_events(
                    conn,
                    &format!(
                        "SELECT {EVENT_COLUMNS} FROM interaction_events {order} LIMIT ?1 OFFSET ?2"
                    ),
                    params![fetch, query.offset.min(i64::MAX as u64) as i64],
                )?,
            };

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
                total: total.max(0) as u64,
                next_cursor,
            })
        })
        .await
    }

    async fn events_for_session(&self, session_id: &str) -> StoreResult<Vec<InteractionEvent>> {
        let session_id = session_id.to_string();
        self.run_blocking(move |conn| {
            query_events(
                conn,
                &format!(
                    "SELECT {EVENT_COLUMNS} FROM interaction_events \
                     WHERE session_id = ?1 ORDER BY step_number ASC"
                ),
                params![session_id],
            )
        })
        .await
    }

    async fn count_events_for_session(&self, session_id: &str) -> StoreResult<u64> {
        let session_id = session_id.to_string();
        self.run_blocking(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM interaction_events WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )?;
            Ok(count.max(0) as u64)
        })
        .await
    }

    async fn episode_steps_for_session(
        &self,
        episode_id: &str,
    ) -> StoreResult<Vec<RlEpisodeStep>> {
        let episode_id = episode_id.to_string();
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {STEP_COLUMNS} FROM rl_episode_steps \
                 WHERE episode_id = ?1 ORDER BY step_number ASC"
            ))?;
            let rows = stmt
                .query_map(params![episode_id], StepRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(StepRow::into_step).collect()
        })
        .await
    }

    async fn session_ids(&self) -> StoreResult<Vec<String>> {
        self.run_blocking(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT session_id FROM interaction_events \
                 WHERE session_id IS NOT NULL ORDER BY session_id",
            )?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }
}
