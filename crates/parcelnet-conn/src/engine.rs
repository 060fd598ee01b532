//! Process bootstrap object: owns the shared sending thread and the
//! registry of live connections.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::connection::Connection;
use crate::core_send::CoreSend;
use crate::error::{CloseReason, Result};

pub(crate) struct EngineShared {
    pub(crate) core: Arc<CoreSend>,
    registry: Mutex<HashMap<Uuid, Connection>>,
    shut_down: AtomicBool,
}

impl EngineShared {
    pub(crate) fn register(&self, conn: Connection) {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(conn.id(), conn);
    }

    pub(crate) fn deregister(&self, id: Uuid) {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }
}

/// Runs connections. Engines are independent of each other; cloning
/// yields another handle to the same engine.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<EngineShared>,
}

impl Engine {
    /// Start the shared sending thread.
    pub fn start() -> Result<Self> {
        let core = CoreSend::start()?;
        tracing::debug!("engine started");
        Ok(Self {
            shared: Arc::new(EngineShared {
                core: Arc::new(core),
                registry: Mutex::new(HashMap::new()),
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    pub(crate) fn core(&self) -> Arc<CoreSend> {
        Arc::clone(&self.shared.core)
    }

    pub(crate) fn downgrade(&self) -> Weak<EngineShared> {
        Arc::downgrade(&self.shared)
    }

    /// Snapshot of the live connections.
    pub fn connections(&self) -> Vec<Connection> {
        self.shared
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.shared
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn find(&self, id: Uuid) -> Option<Connection> {
        self.shared
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shut_down.load(Ordering::SeqCst)
    }

    /// Close every connection, wait up to `timeout` for them to finish,
    /// then stop the sending thread. Returns `true` if all closed in time.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        if self.shared.shut_down.swap(true, Ordering::SeqCst) {
            return true;
        }
        let conns = self.connections();
        tracing::info!(connections = conns.len(), "engine shutting down");
        for conn in &conns {
            conn.close_with(CloseReason::ENGINE_SHUTDOWN, Some("engine shutdown".to_string()));
        }

        let deadline = Instant::now() + timeout;
        let mut clean = true;
        for conn in &conns {
            let left = deadline.saturating_duration_since(Instant::now());
            if !conn.wait_closed(left) {
                tracing::warn!(conn = %conn.short_id(), "connection did not close in time");
                conn.abort();
                clean = false;
            }
        }
        self.shared.core.shutdown();
        clean
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("connections", &self.connection_count())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engines_are_isolated() {
        let a = Engine::start().unwrap();
        let b = Engine::start().unwrap();
        assert_eq!(a.connection_count(), 0);
        assert!(!Arc::ptr_eq(&a.core(), &b.core()));
        assert!(a.shutdown(Duration::from_secs(1)));
        assert!(a.is_shut_down());
        assert!(!b.is_shut_down());
        assert!(b.shutdown(Duration::from_secs(1)));
    }
}
