//! Process-wide session Registry: spec §2. Every accepted WebSocket gets an
//! entry here for the life of the connection, purely for capacity
//! enforcement (`MAX_SESSIONS`) and introspection; the Session itself owns
//! all protocol state. Grounded in the teacher's `TunnelSessions` shape in
//! `daemon/src/session.rs` (`Arc<DashMap<(Ulid, u32), SessionHandle>>`),
//! simplified to one entry per session id and wrapped in an RAII guard so a
//! session can't forget to deregister on any exit path.

use std::time::Instant;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::error::{GatewayError, Result};

pub struct SessionEntry {
    pub target_host: String,
    pub target_user: String,
    pub started_at: Instant,
    pub cancel: CancellationToken,
}

pub struct Registry {
    sessions: DashMap<Ulid, SessionEntry>,
    max_sessions: usize,
}

/// Holds a session's slot in the Registry. Dropping it (including on panic
/// unwind) removes the entry, so a session can never outlive its own
/// connection in the admin view.
pub struct RegistrationGuard {
    registry: std::sync::Arc<Registry>,
    id: Ulid,
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.registry.sessions.remove(&self.id);
    }
}

impl Registry {
    pub fn new(max_sessions: usize) -> Self {
        Self { sessions: DashMap::new(), max_sessions: max_sessions.max(1) }
    }

    /// Rejects past `MAX_SESSIONS` (spec §6.3) rather than queuing; the
    /// browser gets an immediate close instead of a silently stalled upgrade.
    pub fn register(
        self: &std::sync::Arc<Self>,
        id: Ulid,
        target_host: String,
        target_user: String,
        cancel: CancellationToken,
    ) -> Result<RegistrationGuard> {
        if self.sessions.len() >= self.max_sessions {
            return Err(GatewayError::QuotaExceeded(format!(
                "session limit reached ({}/{})",
                self.sessions.len(),
                self.max_sessions
            )));
        }
        self.sessions.insert(id, SessionEntry { target_host, target_user, started_at: Instant::now(), cancel });
        Ok(RegistrationGuard { registry: self.clone(), id })
    }

    /// Fills in the target once `connect` succeeds; sessions register
    /// before the target is known, so the initial entry carries empty strings.
    pub fn set_target(&self, id: Ulid, target_host: String, target_user: String) {
        if let Some(mut entry) = self.sessions.get_mut(&id) {
            entry.target_host = target_host;
            entry.target_user = target_user;
        }
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn list(&self) -> Vec<(Ulid, String, String)> {
        self.sessions.iter().map(|e| (*e.key(), e.target_host.clone(), e.target_user.clone())).collect()
    }

    /// Forced close, e.g. from an admin endpoint: cancels the session's
    /// token, which the session's own read loop observes and tears down on.
    pub fn close(&self, id: Ulid) -> bool {
        match self.sessions.get(&id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn register_rejects_past_the_cap() {
        let registry = Arc::new(Registry::new(1));
        let _first = registry.register(Ulid::new(), "h".into(), "u".into(), CancellationToken::new()).unwrap();
        let second = registry.register(Ulid::new(), "h".into(), "u".into(), CancellationToken::new());
        assert!(second.is_err());
    }

    #[test]
    fn dropping_the_guard_frees_the_slot() {
        let registry = Arc::new(Registry::new(1));
        let id = Ulid::new();
        let guard = registry.register(id, "h".into(), "u".into(), CancellationToken::new()).unwrap();
        assert_eq!(registry.count(), 1);
        drop(guard);
        assert_eq!(registry.count(), 0);
        assert!(registry.register(Ulid::new(), "h".into(), "u".into(), CancellationToken::new()).is_ok());
    }

    #[test]
    fn close_cancels_the_sessions_token() {
        let registry = Arc::new(Registry::new(4));
        let id = Ulid::new();
        let cancel = CancellationToken::new();
        let _guard = registry.register(id, "h".into(), "u".into(), cancel.clone()).unwrap();
        assert!(!cancel.is_cancelled());
        assert!(registry.close(id));
        assert!(cancel.is_cancelled());
        assert!(!registry.close(Ulid::new()));
    }
}
