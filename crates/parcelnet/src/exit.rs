use std::fmt;
use std::io;

use parcelnet_conn::ConnError;
use parcelnet_frame::FrameError;
use parcelnet_transport::TransportError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const TRANSFER_FAILED: i32 = 40;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::AddrInUse
        | io::ErrorKind::AddrNotAvailable => TRANSPORT_ERROR,
        io::ErrorKind::NotFound => USAGE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Bind { source, .. }
        | TransportError::Connect { source, .. }
        | TransportError::Accept(source)
        | TransportError::Io(source) => io_error(context, source),
        TransportError::Unresolved(_) => CliError::new(USAGE, format!("{context}: {err}")),
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn frame_error(context: &str, err: FrameError) -> CliError {
    match err {
        FrameError::Io(source) => io_error(context, source),
        FrameError::PayloadTooLarge { .. } => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        FrameError::ConnectionClosed => CliError::new(FAILURE, format!("{context}: {err}")),
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn conn_error(context: &str, err: ConnError) -> CliError {
    match err {
        ConnError::Transport(err) => transport_error(context, err),
        ConnError::Frame(err) => frame_error(context, err),
        ConnError::Io(err) => io_error(context, err),
        ConnError::HandshakeFailed(_) | ConnError::Rejected { .. } => {
            CliError::new(TRANSPORT_ERROR, format!("{context}: {err}"))
        }
        ConnError::Timeout(_) | ConnError::AliveTimeout(_) | ConnError::ConfirmTimeout(_) => {
            CliError::new(TIMEOUT, format!("{context}: {err}"))
        }
        ConnError::Codec(_)
        | ConnError::CodecMismatch { .. }
        | ConnError::UnregisteredType(_)
        | ConnError::SerializationOverflow { .. } => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        ConnError::InvalidParameter(_)
        | ConnError::FileNotFound(_)
        | ConnError::TransferActive(_)
        | ConnError::UnknownTransfer(_) => CliError::new(USAGE, format!("{context}: {err}")),
        ConnError::InsufficientSpace { .. }
        | ConnError::PathRejected(_)
        | ConnError::OutOfSequence { .. }
        | ConnError::TransferBroken { .. }
        | ConnError::TransferFailed { .. } => {
            CliError::new(TRANSFER_FAILED, format!("{context}: {err}"))
        }
        other => CliError::new(FAILURE, format!("{context}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn conn_errors_map_to_exit_codes() {
        assert_eq!(
            conn_error("x", ConnError::Rejected { cause: 1 }).code,
            TRANSPORT_ERROR
        );
        assert_eq!(
            conn_error("x", ConnError::ConfirmTimeout(Duration::from_secs(1))).code,
            TIMEOUT
        );
        assert_eq!(
            conn_error("x", ConnError::FileNotFound("/nope".into())).code,
            USAGE
        );
        assert_eq!(
            conn_error("x", ConnError::TransferFailed { info: 1, text: None }).code,
            TRANSFER_FAILED
        );
        assert_eq!(conn_error("x", ConnError::Closed).code, FAILURE);
    }

    #[test]
    fn nested_io_errors_keep_their_kind() {
        let err = ConnError::Transport(TransportError::Io(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "refused",
        )));
        let cli = conn_error("connect failed", err);
        assert_eq!(cli.code, TRANSPORT_ERROR);
        assert!(cli.message.starts_with("connect failed: "));
    }
}
