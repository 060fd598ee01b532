//! Connection handshake, run on the raw stream before any parcel.
//!
//! Both sides write their 16-byte role token and verify the counterpart's.
//! The accepting side then confirms with its requested alive period or
//! rejects with a cause code.

use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use crate::error::{ConnError, Result};

pub const TOKEN_LEN: usize = 16;

pub const SERVER_TOKEN: [u8; TOKEN_LEN] = *b"PARCELNET-SERVER";
pub const CLIENT_TOKEN: [u8; TOKEN_LEN] = *b"PARCELNET-CLIENT";
pub const CONFIRM_MARKER: [u8; TOKEN_LEN] = *b"PARCELNET-CONFRM";
pub const REJECT_MARKER: [u8; TOKEN_LEN] = *b"PARCELNET-REJECT";

/// Reject cause: the server is at its connection limit.
pub const REJECT_CAPACITY: i32 = 1;
/// Reject cause: the server is shutting down.
pub const REJECT_SHUTDOWN: i32 = 2;

/// What the accepting side answers after the tokens were exchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept { alive_period: Duration },
    Reject { cause: i32 },
}

/// Outcome of a successful handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeResult {
    /// Alive period requested by the accepting side.
    pub alive_period: Duration,
}

/// Accepting side. A [`Verdict::Reject`] is sent and reported as
/// [`ConnError::Rejected`].
pub fn handshake_server<S: Read + Write>(
    stream: &mut S,
    verdict: Verdict,
    timeout: Duration,
) -> Result<HandshakeResult> {
    let deadline = Instant::now() + timeout;
    write_all(stream, &SERVER_TOKEN)?;
    let token = read_exact(stream, TOKEN_LEN, deadline, timeout)?;
    if token != CLIENT_TOKEN {
        return Err(ConnError::HandshakeFailed(format!(
            "unexpected role token {}",
            printable(&token)
        )));
    }

    match verdict {
        Verdict::Accept { alive_period } => {
            let millis = u32::try_from(alive_period.as_millis()).unwrap_or(u32::MAX);
            let mut msg = Vec::with_capacity(TOKEN_LEN + 4);
            msg.extend_from_slice(&CONFIRM_MARKER);
            msg.extend_from_slice(&millis.to_le_bytes());
            write_all(stream, &msg)?;
            Ok(HandshakeResult { alive_period })
        }
        Verdict::Reject { cause } => {
            let mut msg = Vec::with_capacity(TOKEN_LEN + 4);
            msg.extend_from_slice(&REJECT_MARKER);
            msg.extend_from_slice(&cause.to_le_bytes());
            write_all(stream, &msg)?;
            Err(ConnError::Rejected { cause })
        }
    }
}

/// Connecting side.
pub fn handshake_client<S: Read + Write>(stream: &mut S, timeout: Duration) -> Result<HandshakeResult> {
    let deadline = Instant::now() + timeout;
    write_all(stream, &CLIENT_TOKEN)?;
    let token = read_exact(stream, TOKEN_LEN, deadline, timeout)?;
    if token != SERVER_TOKEN {
        return Err(ConnError::HandshakeFailed(format!(
            "unexpected role token {}",
            printable(&token)
        )));
    }

    let reply = read_exact(stream, TOKEN_LEN + 4, deadline, timeout)?;
    let (marker, value) = reply.split_at(TOKEN_LEN);
    let mut raw = [0u8; 4];
    raw.copy_from_slice(value);

    if marker == CONFIRM_MARKER {
        let millis = u32::from_le_bytes(raw);
        Ok(HandshakeResult {
            alive_period: Duration::from_millis(u64::from(millis)),
        })
    } else if marker == REJECT_MARKER {
        Err(ConnError::Rejected {
            cause: i32::from_le_bytes(raw),
        })
    } else {
        Err(ConnError::HandshakeFailed(format!(
            "unexpected confirm marker {}",
            printable(marker)
        )))
    }
}

fn write_all<S: Write>(stream: &mut S, bytes: &[u8]) -> Result<()> {
    stream.write_all(bytes)?;
    stream.flush()?;
    Ok(())
}

fn read_exact<S: Read>(
    stream: &mut S,
    len: usize,
    deadline: Instant,
    timeout: Duration,
) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    let mut filled = 0usize;
    while filled < len {
        if Instant::now() >= deadline {
            return Err(ConnError::Timeout(timeout));
        }
        match stream.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(ConnError::HandshakeFailed(
                    "connection closed during handshake".to_string(),
                ))
            }
            Ok(n) => filled += n,
            Err(err)
                if err.kind() == ErrorKind::WouldBlock
                    || err.kind() == ErrorKind::TimedOut
                    || err.kind() == ErrorKind::Interrupted =>
            {
                continue;
            }
            Err(err) => return Err(ConnError::Io(err)),
        }
    }
    Ok(buf)
}

fn printable(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| {
            if b.is_ascii_graphic() {
                char::from(b)
            } else {
                '.'
            }
        })
        .collect()
}
