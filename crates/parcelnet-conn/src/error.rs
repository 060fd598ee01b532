use std::path::PathBuf;
use std::time::Duration;

use crate::codec::CodecError;

/// Errors that can occur in connection operations.
///
/// Variants fall into three groups: connection-fatal errors close the
/// connection ([`ConnError::is_fatal`]), transfer-scoped errors abort one
/// object or file and travel inside a [`crate::TransmissionEvent`], and
/// caller-misuse errors are returned synchronously without side effects.
#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] parcelnet_transport::TransportError),

    /// Parcel-level error (bad magic, checksum, malformed parcel).
    #[error("parcel error: {0}")]
    Frame(#[from] parcelnet_frame::FrameError),

    /// Local I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Handshake failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The accepting side refused the connection.
    #[error("connection rejected by remote (cause {cause})")]
    Rejected { cause: i32 },

    /// A blocking operation timed out.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// No ALIVE_ECHO arrived in time.
    #[error("heartbeat timeout: no ALIVE_ECHO for {0:?}")]
    AliveTimeout(Duration),

    /// The connection has not been started.
    #[error("connection is not connected")]
    NotConnected,

    /// The connection is closing or closed.
    #[error("connection is closed")]
    Closed,

    /// The outgoing object queue is full.
    #[error("send queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// The object type is not registered with the connection's codec.
    #[error("type {0} is not registered with the codec")]
    UnregisteredType(&'static str),

    /// A connection parameter is out of range.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The file to send does not exist or is not a regular file.
    #[error("not a readable file: {}", .0.display())]
    FileNotFound(PathBuf),

    /// The file is already being sent on this connection.
    #[error("file already in transfer: {}", .0.display())]
    TransferActive(PathBuf),

    /// No transfer with this id is active.
    #[error("no active transfer with id {0}")]
    UnknownTransfer(u64),

    /// A serialized object exceeds the configured maximum.
    #[error("serialized object too large ({size} bytes, max {max})")]
    SerializationOverflow { size: usize, max: usize },

    /// The serialization codec failed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Remote objects were serialized with a different method.
    #[error("serialization method mismatch (local {local}, remote {remote})")]
    CodecMismatch { local: u8, remote: u8 },

    /// Not enough free space to stage an incoming file.
    #[error("insufficient space ({available} bytes available, {required} required)")]
    InsufficientSpace { required: u64, available: u64 },

    /// A remote target path resolved outside the root directory.
    #[error("target path rejected: {0}")]
    PathRejected(String),

    /// A parcel arrived out of sequence.
    #[error("object {object_id}: expected parcel {expected}, got {got}")]
    OutOfSequence {
        object_id: u64,
        expected: u32,
        got: u32,
    },

    /// The transfer was cancelled by a BREAK.
    #[error("transfer broken (cause {cause}){}", fmt_text(.text))]
    TransferBroken { cause: i32, text: Option<String> },

    /// The remote could not realise the file.
    #[error("transfer failed remotely (info {info}){}", fmt_text(.text))]
    TransferFailed { info: i32, text: Option<String> },

    /// Neither CONFIRM nor FAIL arrived in time.
    #[error("no transfer confirmation within {0:?}")]
    ConfirmTimeout(Duration),

    /// The remote violated the protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

fn fmt_text(text: &Option<String>) -> String {
    text.as_ref().map(|t| format!(": {t}")).unwrap_or_default()
}

impl ConnError {
    /// Stable numeric code, used as the close cause.
    pub fn code(&self) -> i32 {
        match self {
            Self::Transport(_) => 10,
            Self::Frame(_) => 11,
            Self::Io(_) => 12,
            Self::HandshakeFailed(_) => 20,
            Self::Rejected { .. } => 21,
            Self::Timeout(_) => 22,
            Self::AliveTimeout(_) => 30,
            Self::NotConnected => 40,
            Self::Closed => 41,
            Self::QueueFull { .. } => 42,
            Self::UnregisteredType(_) => 43,
            Self::InvalidParameter(_) => 44,
            Self::FileNotFound(_) => 45,
            Self::TransferActive(_) => 46,
            Self::UnknownTransfer(_) => 47,
            Self::SerializationOverflow { .. } => 50,
            Self::Codec(_) => 51,
            Self::CodecMismatch { .. } => 52,
            Self::InsufficientSpace { .. } => 60,
            Self::PathRejected(_) => 61,
            Self::OutOfSequence { .. } => 62,
            Self::TransferBroken { .. } => 63,
            Self::TransferFailed { .. } => 64,
            Self::ConfirmTimeout(_) => 65,
            Self::Protocol(_) => 70,
        }
    }

    /// Whether this error terminates the whole connection.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Transport(_)
                | Self::Frame(_)
                | Self::Io(_)
                | Self::AliveTimeout(_)
                | Self::SerializationOverflow { .. }
                | Self::CodecMismatch { .. }
                | Self::Protocol(_)
        )
    }
}

/// Why a connection closed; delivered with the `disconnected` and `closed` events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// 0 for an orderly close, otherwise an error code or remote cause.
    pub code: i32,
    pub message: Option<String>,
    /// The remote side initiated the close.
    pub remote: bool,
}

impl CloseReason {
    /// Orderly close.
    pub const NORMAL: i32 = 0;
    /// The socket reached EOF without a CLOSE signal.
    pub const CONNECTION_LOST: i32 = 1;
    /// The close handshake did not drain in time.
    pub const DRAIN_TIMEOUT: i32 = 2;
    /// The owning engine shut down.
    pub const ENGINE_SHUTDOWN: i32 = 3;

    pub fn normal() -> Self {
        Self {
            code: Self::NORMAL,
            message: None,
            remote: false,
        }
    }

    pub fn local(code: i32, message: Option<String>) -> Self {
        Self {
            code,
            message,
            remote: false,
        }
    }

    pub fn remote(code: i32, message: Option<String>) -> Self {
        Self {
            code,
            message,
            remote: true,
        }
    }

    pub fn from_error(err: &ConnError) -> Self {
        Self::local(err.code(), Some(err.to_string()))
    }

    pub fn is_error(&self) -> bool {
        self.code != Self::NORMAL
    }
}

pub type Result<T> = std::result::Result<T, ConnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(ConnError::AliveTimeout(Duration::from_secs(1)).is_fatal());
        assert!(ConnError::Protocol("x".into()).is_fatal());
        assert!(!ConnError::QueueFull { capacity: 1 }.is_fatal());
        assert!(!ConnError::Codec(crate::codec::CodecError::UnknownTag("x".into())).is_fatal());
        assert!(!ConnError::InsufficientSpace {
            required: 2,
            available: 1
        }
        .is_fatal());
    }

    #[test]
    fn close_reason_from_error_keeps_code_and_message() {
        let err = ConnError::AliveTimeout(Duration::from_millis(1500));
        let reason = CloseReason::from_error(&err);
        assert_eq!(reason.code, 30);
        assert!(reason.is_error());
        assert!(reason.message.unwrap().contains("heartbeat"));
        assert!(!CloseReason::normal().is_error());
    }

    #[test]
    fn transfer_error_text_is_appended() {
        let err = ConnError::TransferBroken {
            cause: 4,
            text: Some("disk full".into()),
        };
        assert_eq!(err.to_string(), "transfer broken (cause 4): disk full");
        let bare = ConnError::TransferFailed {
            info: 1,
            text: None,
        };
        assert_eq!(bare.to_string(), "transfer failed remotely (info 1)");
    }
}
