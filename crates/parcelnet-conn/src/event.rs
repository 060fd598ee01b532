use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, SystemTime};

use crate::codec::Object;
use crate::error::{CloseReason, ConnError};

/// Which side of a transfer an operation refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl Direction {
    pub fn name(self) -> &'static str {
        match self {
            Self::Incoming => "incoming",
            Self::Outgoing => "outgoing",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransmissionEventKind {
    /// First parcel of a remote file arrived.
    FileIncoming,
    /// A remote file was stored completely.
    FileReceived,
    /// The remote confirmed a file sent from here.
    FileConfirmed,
    /// A file sent from here could not be realised remotely.
    FileFailed,
    /// A transfer was cancelled in either direction.
    FileAborted,
}

impl TransmissionEventKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::FileIncoming => "FILE_INCOMING",
            Self::FileReceived => "FILE_RECEIVED",
            Self::FileConfirmed => "FILE_CONFIRMED",
            Self::FileFailed => "FILE_FAILED",
            Self::FileAborted => "FILE_ABORTED",
        }
    }
}

impl std::fmt::Display for TransmissionEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A file transfer milestone.
#[derive(Debug, Clone)]
pub struct TransmissionEvent {
    pub kind: TransmissionEventKind,
    pub direction: Direction,
    pub object_id: u64,
    /// Declared size of the file.
    pub expected_length: u64,
    /// Bytes transferred so far.
    pub transmission_length: u64,
    /// Time since the transfer started.
    pub duration: Duration,
    /// Local file: the delivered file for incoming, the source for outgoing.
    pub path: Option<PathBuf>,
    /// Remote target path as announced by the sender.
    pub remote_path: Option<String>,
    /// Signal info code, when the event was caused by one.
    pub info: i32,
    pub error: Option<Arc<ConnError>>,
}

impl TransmissionEvent {
    pub fn new(kind: TransmissionEventKind, direction: Direction, object_id: u64) -> Self {
        Self {
            kind,
            direction,
            object_id,
            expected_length: 0,
            transmission_length: 0,
            duration: Duration::ZERO,
            path: None,
            remote_path: None,
            info: 0,
            error: None,
        }
    }
}

/// Result of a PING round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingEcho {
    pub ping_id: u64,
    pub sent_at: SystemTime,
    pub duration: Duration,
}

/// Callbacks fired by a connection. All methods default to no-ops.
///
/// Callbacks run on engine threads; a panic inside one is caught and
/// logged. Closing the connection from inside a callback is allowed.
pub trait ConnectionListener: Send + Sync {
    fn connected(&self) {}

    /// The socket went down. Fired at most once.
    fn disconnected(&self, _reason: &CloseReason) {}

    /// The connection reached its terminal state. Fired exactly once.
    fn closed(&self, _reason: &CloseReason) {}

    fn idle(&self, _idle: bool) {}

    fn object_received(&self, _object_id: u64, _object: &Object) {}

    fn ping_echo_received(&self, _echo: &PingEcho) {}

    fn transmission_event(&self, _event: &TransmissionEvent) {}
}

/// Registered listeners of one connection.
#[derive(Default)]
pub(crate) struct ListenerSet {
    listeners: RwLock<Vec<Arc<dyn ConnectionListener>>>,
}

impl ListenerSet {
    pub(crate) fn add(&self, listener: Arc<dyn ConnectionListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Invoke `f` on every listener, containing panics.
    pub(crate) fn fire(&self, conn: &str, event: &'static str, f: impl Fn(&dyn ConnectionListener)) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| f(listener.as_ref()))).is_err() {
                tracing::error!(conn, event, "listener panicked");
            }
        }
    }
}
