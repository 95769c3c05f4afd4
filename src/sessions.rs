//! Authoritative owner of mutable session state. Wraps the persistent store
//! with a bounded write-through cache, per-session write locks, and the
//! expiry rule.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use crate::cache::LruCache;
use crate::core::domain::{Session, SessionStatus, StepKey};
use crate::core::error::{EngineError, Result};
use crate::core::ports::Clock;
use crate::persistence::SessionStore;

pub struct SessionManager {
    store: SessionStore,
    cache: Mutex<LruCache<Session>>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    clock: Arc<dyn Clock>,
    timeout_ms: i64,
    max_sessions: usize,
}

impl SessionManager {
    pub fn new(
        store: SessionStore,
        clock: Arc<dyn Clock>,
        cache_size: usize,
        timeout_minutes: u64,
        max_sessions: usize,
    ) -> Self {
        Self {
            store,
            cache: Mutex::new(LruCache::new(cache_size)),
            locks: DashMap::new(),
            clock,
            timeout_ms: (timeout_minutes as i64) * 60_000,
            max_sessions: max_sessions.max(1),
        }
    }

    /// Per-session mutual exclusion for read-modify-write tool calls.
    /// Callers hold the returned lock for the duration of the call.
    pub fn lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    pub fn create(
        &self,
        topic: &str,
        flow_type: &str,
        first_step: &str,
        context: Map<String, Value>,
    ) -> Result<Session> {
        let now = self.clock.now_ms();
        if self.store.count_active()? >= self.max_sessions {
            // A sweep may free capacity before rejecting.
            self.expire_stale()?;
            if self.store.count_active()? >= self.max_sessions {
                return Err(EngineError::Validation(format!(
                    "session limit reached (max_sessions = {})",
                    self.max_sessions
                )));
            }
        }
        let session = Session::new(
            Uuid::new_v4().to_string(),
            topic.to_string(),
            flow_type.to_string(),
            first_step,
            context,
            now,
        );
        info!(session_id = %session.session_id, flow_type, "session created");
        Ok(session)
    }

    /// Load a session, enforcing expiry and terminal-state rules.
    /// `touch` refreshes `updated_at`; tool-surface reads pass true,
    /// internal readers false.
    pub fn get(&self, session_id: &str, touch: bool) -> Result<Session> {
        let now = self.clock.now_ms();
        let cached = self.cache.lock().get(session_id).cloned();
        let mut session = match cached {
            Some(s) => s,
            None => {
                // Cache miss doubles as an expiry sweep opportunity.
                self.expire_stale()?;
                self.store
                    .load(session_id)?
                    .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?
            }
        };

        if session.status == SessionStatus::Active && now - session.updated_at > self.timeout_ms {
            self.store.mark_status(session_id, SessionStatus::Expired, now)?;
            self.cache.lock().remove(session_id);
            debug!(session_id, "session expired on touch");
            return Err(EngineError::SessionExpired(session_id.to_string()));
        }
        match session.status {
            SessionStatus::Active => {}
            SessionStatus::Expired => {
                return Err(EngineError::SessionExpired(session_id.to_string()));
            }
            status => {
                return Err(EngineError::SessionTerminal {
                    session_id: session_id.to_string(),
                    status: status.as_str().to_string(),
                });
            }
        }

        if touch {
            session.updated_at = now;
            self.store.touch(session_id, now)?;
            self.cache.lock().insert(session_id.to_string(), session.clone());
        }
        Ok(session)
    }

    /// Write-through commit of a mutated session plus the step entries the
    /// caller touched.
    pub fn commit(&self, session: &mut Session, touched: &[StepKey]) -> Result<()> {
        session.updated_at = self.clock.now_ms();
        self.store.commit_session(session, touched)?;
        self.cache
            .lock()
            .insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    /// Best-effort terminal marking after a storage failure mid-call.
    pub fn mark_failed(&self, session_id: &str) {
        let now = self.clock.now_ms();
        if self.store.mark_status(session_id, SessionStatus::Failed, now).is_ok() {
            self.cache.lock().remove(session_id);
        }
    }

    /// Mark every overdue active session expired. Returns how many flipped.
    pub fn expire_stale(&self) -> Result<usize> {
        let now = self.clock.now_ms();
        let ids = self.store.list_expired(now - self.timeout_ms)?;
        let count = ids.len();
        for id in ids {
            self.store.mark_status(&id, SessionStatus::Expired, now)?;
            self.cache.lock().remove(&id);
            self.locks.remove(&id);
            info!(session_id = %id, "session expired by sweep");
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ports::ManualClock;

    fn manager_with_clock(clock: Arc<ManualClock>) -> SessionManager {
        let store = SessionStore::open(":memory:").unwrap();
        SessionManager::new(store, clock, 4, 60, 10)
    }

    fn create_committed(manager: &SessionManager, topic: &str) -> Session {
        let mut session = manager
            .create(topic, "flow", "first", Map::new())
            .unwrap();
        manager.commit(&mut session, &[]).unwrap();
        session
    }

    #[test]
    fn get_returns_created_session() {
        let clock = Arc::new(ManualClock::new(0));
        let manager = manager_with_clock(clock);
        let session = create_committed(&manager, "topic");
        let loaded = manager.get(&session.session_id, false).unwrap();
        assert_eq!(loaded.topic, "topic");
    }

    #[test]
    fn unknown_session_is_not_found() {
        let clock = Arc::new(ManualClock::new(0));
        let manager = manager_with_clock(clock);
        let err = manager.get("missing", false).unwrap_err();
        assert_eq!(err.error_code(), "SessionNotFound");
    }

    #[test]
    fn session_expires_just_past_timeout() {
        let clock = Arc::new(ManualClock::new(0));
        let manager = manager_with_clock(clock.clone());
        let session = create_committed(&manager, "topic");

        // One millisecond inside the window still serves.
        clock.set(60 * 60_000);
        assert!(manager.get(&session.session_id, false).is_ok());

        clock.set(60 * 60_000 + 1);
        let err = manager.get(&session.session_id, false).unwrap_err();
        assert_eq!(err.error_code(), "SessionExpired");

        // Subsequent reads keep reporting expiry.
        let err = manager.get(&session.session_id, false).unwrap_err();
        assert_eq!(err.error_code(), "SessionExpired");
    }

    #[test]
    fn touch_refreshes_the_window() {
        let clock = Arc::new(ManualClock::new(0));
        let manager = manager_with_clock(clock.clone());
        let session = create_committed(&manager, "topic");

        clock.set(30 * 60_000);
        manager.get(&session.session_id, true).unwrap();
        clock.set(80 * 60_000);
        assert!(manager.get(&session.session_id, false).is_ok());
    }

    #[test]
    fn terminal_session_rejects_calls() {
        let clock = Arc::new(ManualClock::new(0));
        let manager = manager_with_clock(clock);
        let mut session = create_committed(&manager, "topic");
        session.status = SessionStatus::Completed;
        manager.commit(&mut session, &[]).unwrap();

        let err = manager.get(&session.session_id, true).unwrap_err();
        assert_eq!(err.error_code(), "SessionTerminal");
    }

    #[test]
    fn store_stays_authoritative_past_cache_eviction() {
        let clock = Arc::new(ManualClock::new(0));
        let store = SessionStore::open(":memory:").unwrap();
        let manager = SessionManager::new(store, clock, 1, 60, 10);

        let first = create_committed(&manager, "first");
        let _second = create_committed(&manager, "second");
        // "first" was evicted from the one-slot cache.
        let loaded = manager.get(&first.session_id, false).unwrap();
        assert_eq!(loaded.topic, "first");
    }

    #[test]
    fn session_limit_is_enforced() {
        let clock = Arc::new(ManualClock::new(0));
        let store = SessionStore::open(":memory:").unwrap();
        let manager = SessionManager::new(store, clock, 4, 60, 2);
        create_committed(&manager, "one");
        create_committed(&manager, "two");
        let err = manager.create("three", "flow", "first", Map::new()).unwrap_err();
        assert_eq!(err.error_code(), "ValidationError");
    }

    #[test]
    fn sweep_expires_and_frees_capacity() {
        let clock = Arc::new(ManualClock::new(0));
        let store = SessionStore::open(":memory:").unwrap();
        let manager = SessionManager::new(store, clock.clone(), 4, 60, 2);
        create_committed(&manager, "one");
        create_committed(&manager, "two");

        clock.set(61 * 60_000);
        // Limit check sweeps first, so creation succeeds.
        let session = manager.create("three", "flow", "first", Map::new()).unwrap();
        assert_eq!(session.topic, "three");
    }
}
