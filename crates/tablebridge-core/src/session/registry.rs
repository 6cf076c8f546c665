//! Process-wide registry of live sessions.
//!
//! Holds only weak references, so registration never keeps a session alive.
//! [`cleanup_sessions`] is meant for process exit: it snapshots the live
//! entries under the lock, releases the lock, then shuts each one down.

use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};

use log::debug;

use super::SessionShared;

#[derive(Default)]
pub(crate) struct SessionRegistry {
    entries: Mutex<Vec<Weak<SessionShared>>>,
}

impl SessionRegistry {
    pub(crate) fn global() -> &'static SessionRegistry {
        static LIVE_SESSIONS: OnceLock<SessionRegistry> = OnceLock::new();
        LIVE_SESSIONS.get_or_init(SessionRegistry::default)
    }

    pub(crate) fn register(&self, session: &Arc<SessionShared>) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|w| w.strong_count() > 0);
        entries.push(Arc::downgrade(session));
    }

    pub(crate) fn live_count(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.iter().filter(|w| w.strong_count() > 0).count()
    }

    /// Shut down every live, owned session. Returns how many were shut down.
    pub(crate) fn sweep(&self) -> usize {
        let live: Vec<Arc<SessionShared>> = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries.retain(|w| w.strong_count() > 0);
            entries.iter().filter_map(Weak::upgrade).collect()
        };

        let mut closed = 0;
        for session in live {
            if session.is_external() {
                continue;
            }
            if session.shutdown() {
                closed += 1;
            }
        }
        debug!("Session sweep shut down {closed} session(s)");
        closed
    }
}

/// Shut down every session this process still owns.
///
/// Sessions wrapping an externally supplied client are left alone. Safe to
/// call repeatedly; sessions that were already dropped are skipped.
pub fn cleanup_sessions() -> usize {
    SessionRegistry::global().sweep()
}

/// Number of sessions currently registered and alive.
pub fn live_session_count() -> usize {
    SessionRegistry::global().live_count()
}
