//! SQLite-backed store for sessions and their step artifacts.
//!
//! One connection is shared behind a mutex, which serialises writers and
//! keeps `:memory:` databases coherent. Every public operation is a single
//! transaction; a failed operation is retried once before surfacing as
//! `StorageError`.

use std::{fs, path::Path, sync::Arc};

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use tracing::warn;

use crate::core::domain::{
    Cursor, Session, SessionStatus, StepKey, StepResult, StepStatus,
};
use crate::core::error::{EngineError, Result};

const SCHEMA_VERSION: i64 = 1;

/// Plain steps store this in place of an iteration index so the primary key
/// stays non-null.
const NO_ITERATION: i64 = -1;

#[derive(Clone)]
pub struct SessionStore {
    conn: Arc<Mutex<Connection>>,
}

impl SessionStore {
    /// Open (or create) the database at `path`. `":memory:"` is honoured
    /// verbatim; for file paths the parent directory is created.
    pub fn open(path: &str) -> Result<Self> {
        if path != ":memory:"
            && let Some(parent) = Path::new(path).parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::Storage(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(path)
            .map_err(|e| EngineError::Storage(format!("cannot open {path}: {e}")))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS _meta (
                version INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                topic TEXT NOT NULL,
                flow_type TEXT NOT NULL,
                status TEXT NOT NULL,
                context_json TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS session_steps (
                session_id TEXT NOT NULL,
                step_name TEXT NOT NULL,
                iteration_index INTEGER NOT NULL DEFAULT -1,
                status TEXT NOT NULL,
                raw_text TEXT,
                structured_output_json TEXT,
                quality_score REAL,
                started_at INTEGER NOT NULL,
                finished_at INTEGER,
                retry_count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (session_id, step_name, iteration_index)
            );
            CREATE TABLE IF NOT EXISTS session_current (
                session_id TEXT PRIMARY KEY,
                current_step_name TEXT NOT NULL,
                step_number INTEGER NOT NULL,
                iteration_index INTEGER,
                retry_count INTEGER NOT NULL DEFAULT 0
            );
            "#,
        )?;

        let existing: Option<i64> = conn
            .query_row("SELECT version FROM _meta LIMIT 1", [], |row| row.get(0))
            .optional()?;
        match existing {
            None => {
                conn.execute("INSERT INTO _meta (version) VALUES (?1)", params![SCHEMA_VERSION])?;
            }
            Some(v) if v == SCHEMA_VERSION => {}
            Some(v) if v < SCHEMA_VERSION => {
                // Forward-only upgrades land here; none defined yet.
                conn.execute("UPDATE _meta SET version = ?1", params![SCHEMA_VERSION])?;
            }
            Some(v) => {
                return Err(EngineError::Storage(format!(
                    "database schema version {v} is newer than supported {SCHEMA_VERSION}"
                )));
            }
        }
        Ok(())
    }

    fn with_retry<T>(
        &self,
        op: &str,
        f: impl Fn(&mut Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn.lock();
        match f(&mut conn) {
            Ok(value) => Ok(value),
            Err(first) => {
                warn!(op, error = %first, "storage operation failed, retrying once");
                f(&mut conn).map_err(|e| EngineError::Storage(format!("{op}: {e}")))
            }
        }
    }

    /// Write the session row, its cursor, and the touched step entries in
    /// one transaction.
    pub fn commit_session(&self, session: &Session, touched: &[StepKey]) -> Result<()> {
        let context_json = serde_json::to_string(&session.context)?;
        self.with_retry("commit_session", |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                r#"
                INSERT INTO sessions (id, topic, flow_type, status, context_json, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    context_json = excluded.context_json,
                    updated_at = excluded.updated_at
                "#,
                params![
                    session.session_id,
                    session.topic,
                    session.flow_type,
                    session.status.as_str(),
                    context_json,
                    session.created_at,
                    session.updated_at,
                ],
            )?;
            tx.execute(
                r#"
                INSERT INTO session_current (session_id, current_step_name, step_number, iteration_index, retry_count)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(session_id) DO UPDATE SET
                    current_step_name = excluded.current_step_name,
                    step_number = excluded.step_number,
                    iteration_index = excluded.iteration_index,
                    retry_count = excluded.retry_count
                "#,
                params![
                    session.session_id,
                    session.cursor.step_name,
                    session.step_number as i64,
                    session.cursor.iteration_index.map(|k| k as i64),
                    session.cursor.retry_count as i64,
                ],
            )?;
            for key in touched {
                let Some(entry) = session.entry(&key.step_name, key.iteration_index) else {
                    continue;
                };
                upsert_step(&tx, &session.session_id, entry)?;
            }
            tx.commit()
        })
    }

    pub fn load(&self, session_id: &str) -> Result<Option<Session>> {
        self.with_retry("load_session", |conn| {
            let header = conn
                .query_row(
                    r#"
                    SELECT topic, flow_type, status, context_json, created_at, updated_at
                    FROM sessions WHERE id = ?1
                    "#,
                    params![session_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, i64>(4)?,
                            row.get::<_, i64>(5)?,
                        ))
                    },
                )
                .optional()?;
            let Some((topic, flow_type, status_str, context_json, created_at, updated_at)) = header
            else {
                return Ok(None);
            };

            let cursor_row = conn
                .query_row(
                    r#"
                    SELECT current_step_name, step_number, iteration_index, retry_count
                    FROM session_current WHERE session_id = ?1
                    "#,
                    params![session_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, Option<i64>>(2)?,
                            row.get::<_, i64>(3)?,
                        ))
                    },
                )
                .optional()?;
            let Some((current_step_name, step_number, iteration_index, retry_count)) = cursor_row
            else {
                return Ok(None);
            };

            let mut stmt = conn.prepare(
                r#"
                SELECT step_name, iteration_index, status, raw_text, structured_output_json,
                       quality_score, started_at, finished_at, retry_count
                FROM session_steps WHERE session_id = ?1 ORDER BY rowid
                "#,
            )?;
            let rows = stmt.query_map(params![session_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<f64>>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, Option<i64>>(7)?,
                    row.get::<_, i64>(8)?,
                ))
            })?;

            let mut session = Session {
                session_id: session_id.to_string(),
                topic,
                flow_type,
                cursor: Cursor {
                    step_name: current_step_name,
                    iteration_index: iteration_index.map(|k| k as u32),
                    retry_count: retry_count as u32,
                },
                step_number: step_number as u32,
                status: SessionStatus::parse(&status_str).unwrap_or(SessionStatus::Failed),
                context: serde_json::from_str(&context_json).unwrap_or_default(),
                step_results: Default::default(),
                step_outputs: Default::default(),
                quality_scores: Default::default(),
                created_at,
                updated_at,
            };

            for row in rows {
                let (
                    step_name,
                    iteration_db,
                    status_str,
                    raw_text,
                    output_json,
                    quality_score,
                    started_at,
                    finished_at,
                    retries,
                ) = row?;
                let iteration = (iteration_db != NO_ITERATION).then_some(iteration_db as u32);
                let structured_output = output_json
                    .as_deref()
                    .and_then(|s| serde_json::from_str::<Value>(s).ok());
                let result = StepResult {
                    step_name: step_name.clone(),
                    iteration_index: iteration,
                    status: StepStatus::parse(&status_str).unwrap_or(StepStatus::Failed),
                    raw_text,
                    structured_output,
                    quality_score,
                    retry_count: retries as u32,
                    started_at,
                    finished_at,
                };
                if let Some(score) = quality_score {
                    session.record_quality(&step_name, score);
                }
                session
                    .step_results
                    .entry(step_name)
                    .or_default()
                    .push(result);
            }

            rebuild_step_outputs(&mut session);
            Ok(Some(session))
        })
    }

    pub fn mark_status(&self, session_id: &str, status: SessionStatus, now: i64) -> Result<()> {
        self.with_retry("mark_status", |conn| {
            conn.execute(
                "UPDATE sessions SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![session_id, status.as_str(), now],
            )
            .map(|_| ())
        })
    }

    pub fn touch(&self, session_id: &str, now: i64) -> Result<()> {
        self.with_retry("touch", |conn| {
            conn.execute(
                "UPDATE sessions SET updated_at = ?2 WHERE id = ?1",
                params![session_id, now],
            )
            .map(|_| ())
        })
    }

    pub fn count_active(&self) -> Result<usize> {
        self.with_retry("count_active", |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM sessions WHERE status = 'active'",
                [],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as usize)
        })
    }

    /// Ids of active sessions whose last touch is before `cutoff`.
    pub fn list_expired(&self, cutoff: i64) -> Result<Vec<String>> {
        self.with_retry("list_expired", |conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM sessions WHERE status = 'active' AND updated_at < ?1",
            )?;
            let ids = stmt
                .query_map(params![cutoff], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(ids)
        })
    }
}

fn upsert_step(
    tx: &rusqlite::Transaction<'_>,
    session_id: &str,
    entry: &StepResult,
) -> rusqlite::Result<()> {
    let output_json = entry
        .structured_output
        .as_ref()
        .map(|v| v.to_string());
    tx.execute(
        r#"
        INSERT INTO session_steps
            (session_id, step_name, iteration_index, status, raw_text,
             structured_output_json, quality_score, started_at, finished_at, retry_count)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ON CONFLICT(session_id, step_name, iteration_index) DO UPDATE SET
            status = excluded.status,
            raw_text = excluded.raw_text,
            structured_output_json = excluded.structured_output_json,
            quality_score = excluded.quality_score,
            started_at = excluded.started_at,
            finished_at = excluded.finished_at,
            retry_count = excluded.retry_count
        "#,
        params![
            session_id,
            entry.step_name,
            entry.iteration_index.map(|k| k as i64).unwrap_or(NO_ITERATION),
            entry.status.as_str(),
            entry.raw_text,
            output_json,
            entry.quality_score,
            entry.started_at,
            entry.finished_at,
            entry.retry_count as i64,
        ],
    )
    .map(|_| ())
}

/// Derive `step_outputs` from the loaded step entries: plain steps map to
/// their object, fanned-out steps to an array indexed by iteration.
fn rebuild_step_outputs(session: &mut Session) {
    let mut outputs: Vec<(String, Value)> = Vec::new();
    for (name, entries) in &session.step_results {
        let fanned = entries.iter().any(|r| r.iteration_index.is_some());
        if fanned {
            let mut max_index = 0u32;
            let mut any = false;
            for r in entries {
                if let Some(k) = r.iteration_index {
                    max_index = max_index.max(k);
                    any = any || r.structured_output.is_some();
                }
            }
            if !any {
                continue;
            }
            let mut items = vec![Value::Null; (max_index + 1) as usize];
            for r in entries {
                if let (Some(k), Some(v)) = (r.iteration_index, &r.structured_output) {
                    items[k as usize] = v.clone();
                }
            }
            outputs.push((name.clone(), Value::Array(items)));
        } else if let Some(value) = entries.iter().find_map(|r| r.structured_output.clone()) {
            outputs.push((name.clone(), value));
        }
    }
    for (name, value) in outputs {
        session.step_outputs.insert(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_session(now: i64) -> Session {
        let mut context = serde_json::Map::new();
        context.insert("complexity".into(), json!("moderate"));
        Session::new(
            "sess-1".into(),
            "How to improve team productivity?".into(),
            "comprehensive_analysis".into(),
            "decompose_problem",
            context,
            now,
        )
    }

    #[test]
    fn commit_and_load_roundtrip() {
        let store = SessionStore::open(":memory:").unwrap();
        let mut session = sample_session(100);
        session.ensure_entry("decompose_problem", None, 100);
        {
            let entry = session.entry_mut("decompose_problem", None).unwrap();
            entry.status = StepStatus::Completed;
            entry.raw_text = Some("{\"sub_questions\": [1]}".into());
            entry.structured_output = Some(json!({"sub_questions": [1]}));
            entry.quality_score = Some(0.9);
            entry.finished_at = Some(150);
        }
        session.step_number = 1;
        session.record_quality("decompose_problem", 0.9);
        session
            .step_outputs
            .insert("decompose_problem".into(), json!({"sub_questions": [1]}));

        store
            .commit_session(&session, &[StepKey::new("decompose_problem", None)])
            .unwrap();

        let loaded = store.load("sess-1").unwrap().expect("session exists");
        assert_eq!(loaded.topic, session.topic);
        assert_eq!(loaded.step_number, 1);
        assert_eq!(loaded.cursor.step_name, "decompose_problem");
        assert_eq!(
            loaded.step_outputs["decompose_problem"]["sub_questions"],
            json!([1])
        );
        assert_eq!(loaded.quality_scores["decompose_problem"], 0.9);
        let entry = loaded.entry("decompose_problem", None).unwrap();
        assert_eq!(entry.status, StepStatus::Completed);
        assert_eq!(entry.finished_at, Some(150));
    }

    #[test]
    fn iteration_entries_rebuild_as_array() {
        let store = SessionStore::open(":memory:").unwrap();
        let mut session = sample_session(0);
        for k in 0..3u32 {
            session.ensure_entry("collect_evidence", Some(k), 10);
            let entry = session.entry_mut("collect_evidence", Some(k)).unwrap();
            entry.status = StepStatus::Completed;
            entry.structured_output = Some(json!({"evidence": k}));
        }
        let touched: Vec<StepKey> = (0..3)
            .map(|k| StepKey::new("collect_evidence", Some(k)))
            .collect();
        store.commit_session(&session, &touched).unwrap();

        let loaded = store.load("sess-1").unwrap().unwrap();
        let items = loaded.step_outputs["collect_evidence"].as_array().unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[2]["evidence"], json!(2));
    }

    #[test]
    fn upsert_replaces_instead_of_duplicating() {
        let store = SessionStore::open(":memory:").unwrap();
        let mut session = sample_session(0);
        session.ensure_entry("decompose_problem", None, 5);
        let key = [StepKey::new("decompose_problem", None)];
        store.commit_session(&session, &key).unwrap();

        session.entry_mut("decompose_problem", None).unwrap().retry_count = 2;
        store.commit_session(&session, &key).unwrap();

        let loaded = store.load("sess-1").unwrap().unwrap();
        let entries = loaded.step_results.get("decompose_problem").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].retry_count, 2);
    }

    #[test]
    fn list_expired_filters_by_status_and_cutoff() {
        let store = SessionStore::open(":memory:").unwrap();
        let mut a = sample_session(0);
        a.session_id = "old".into();
        a.updated_at = 10;
        store.commit_session(&a, &[]).unwrap();

        let mut b = sample_session(0);
        b.session_id = "fresh".into();
        b.updated_at = 1_000;
        store.commit_session(&b, &[]).unwrap();

        let expired = store.list_expired(500).unwrap();
        assert_eq!(expired, vec!["old".to_string()]);

        store.mark_status("old", SessionStatus::Expired, 1_001).unwrap();
        assert!(store.list_expired(500).unwrap().is_empty());
    }

    #[test]
    fn missing_session_loads_none() {
        let store = SessionStore::open(":memory:").unwrap();
        assert!(store.load("nope").unwrap().is_none());
    }

    #[test]
    fn schema_init_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deepthink.sqlite3");
        let path_str = path.to_str().unwrap();
        let store = SessionStore::open(path_str).unwrap();
        let session = sample_session(0);
        store.commit_session(&session, &[]).unwrap();
        drop(store);

        let reopened = SessionStore::open(path_str).unwrap();
        assert!(reopened.load("sess-1").unwrap().is_some());
    }
}
