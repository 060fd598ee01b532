//! In-band control signals carried on the SIGNAL channel.
//!
//! A signal is a parcel whose sequence field holds the [`SignalType`] code
//! and whose payload is a 4-byte little-endian `info` code followed by an
//! optional UTF-8 text.

use bytes::{BufMut, BytesMut};

use crate::channel::{Channel, Priority};
use crate::codec::TransmissionParcel;
use crate::error::{FrameError, Result};

/// Longest text a signal may carry.
pub const MAX_SIGNAL_TEXT: usize = 16 * 1024;

/// FAIL info: the receiver could not realise the transferred file.
pub const FAIL_DESTINATION: i32 = 1;

/// Closed set of control signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SignalType {
    /// Heartbeat request.
    Alive = 1,
    /// Heartbeat reply.
    AliveEcho = 2,
    /// Round-trip probe; object id is the ping id.
    Ping = 3,
    /// Reply to [`SignalType::Ping`] carrying the same ping id.
    Echo = 4,
    /// Transmission speed; info is bytes per second (-1 unlimited, 0 paused).
    Tempo = 5,
    /// Transfer cancellation; object id is the file id.
    Break = 6,
    /// File received and realised.
    Confirm = 7,
    /// File received but could not be realised.
    Fail = 8,
    /// Graceful shutdown request; info is the close cause.
    Close = 9,
}

impl SignalType {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Result<Self> {
        match code {
            1 => Ok(Self::Alive),
            2 => Ok(Self::AliveEcho),
            3 => Ok(Self::Ping),
            4 => Ok(Self::Echo),
            5 => Ok(Self::Tempo),
            6 => Ok(Self::Break),
            7 => Ok(Self::Confirm),
            8 => Ok(Self::Fail),
            9 => Ok(Self::Close),
            other => Err(FrameError::UnknownSignal(other)),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Alive => "ALIVE",
            Self::AliveEcho => "ALIVE_ECHO",
            Self::Ping => "PING",
            Self::Echo => "ECHO",
            Self::Tempo => "TEMPO",
            Self::Break => "BREAK",
            Self::Confirm => "CONFIRM",
            Self::Fail => "FAIL",
            Self::Close => "CLOSE",
        }
    }
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A decoded control signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    pub kind: SignalType,
    pub object_id: u64,
    pub info: i32,
    pub text: Option<String>,
}

impl Signal {
    pub fn new(kind: SignalType, object_id: u64, info: i32, text: Option<String>) -> Self {
        Self {
            kind,
            object_id,
            info,
            text,
        }
    }

    pub fn alive() -> Self {
        Self::new(SignalType::Alive, 0, 0, None)
    }

    pub fn alive_echo() -> Self {
        Self::new(SignalType::AliveEcho, 0, 0, None)
    }

    pub fn ping(ping_id: u64) -> Self {
        Self::new(SignalType::Ping, ping_id, 0, None)
    }

    pub fn echo(ping_id: u64) -> Self {
        Self::new(SignalType::Echo, ping_id, 0, None)
    }

    /// Announce a transmission speed in bytes per second (-1 unlimited, 0 paused).
    pub fn tempo(bytes_per_second: i32) -> Self {
        Self::new(SignalType::Tempo, 0, bytes_per_second, None)
    }

    /// Cancel a transfer. `from_sender` tells the peer which side of the
    /// transfer issued the break; it is encoded in the sign of `info`.
    pub fn break_transfer(file_id: u64, cause: i32, from_sender: bool, text: Option<String>) -> Self {
        let magnitude = cause.saturating_abs().max(1);
        let info = if from_sender { magnitude } else { -magnitude };
        Self::new(SignalType::Break, file_id, info, text)
    }

    pub fn confirm(file_id: u64) -> Self {
        Self::new(SignalType::Confirm, file_id, 0, None)
    }

    pub fn fail(file_id: u64, info: i32, text: Option<String>) -> Self {
        Self::new(SignalType::Fail, file_id, info, text)
    }

    pub fn close(cause: i32, text: Option<String>) -> Self {
        Self::new(SignalType::Close, 0, cause, text)
    }

    /// For BREAK signals: whether the sending side of the transfer issued it.
    pub fn issued_by_sender(&self) -> bool {
        self.info >= 0
    }

    /// For BREAK signals: the unsigned cause code.
    pub fn break_cause(&self) -> i32 {
        self.info.saturating_abs()
    }

    /// Render this signal as a SIGNAL-channel parcel.
    pub fn to_parcel(&self) -> TransmissionParcel {
        let text = self.text.as_deref().unwrap_or("");
        let text = truncate_utf8(text, MAX_SIGNAL_TEXT);
        let mut payload = BytesMut::with_capacity(4 + text.len());
        payload.put_i32_le(self.info);
        payload.put_slice(text.as_bytes());
        TransmissionParcel::new(
            Channel::Signal,
            Priority::Top,
            self.object_id,
            self.kind.code(),
            payload.freeze(),
        )
    }

    /// Interpret a SIGNAL-channel parcel.
    pub fn from_parcel(parcel: &TransmissionParcel) -> Result<Self> {
        if parcel.channel != Channel::Signal {
            return Err(FrameError::MalformedSignal(format!(
                "parcel on {} channel is not a signal",
                parcel.channel
            )));
        }
        let kind = SignalType::from_code(parcel.sequence)?;
        if parcel.payload.len() < 4 {
            return Err(FrameError::MalformedSignal(format!(
                "{} payload too short ({} bytes)",
                kind,
                parcel.payload.len()
            )));
        }
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&parcel.payload[..4]);
        let info = i32::from_le_bytes(raw);

        let text = if parcel.payload.len() == 4 {
            None
        } else {
            let text = std::str::from_utf8(&parcel.payload[4..]).map_err(|err| {
                FrameError::MalformedSignal(format!("{kind} text is not valid UTF-8: {err}"))
            })?;
            Some(text.to_string())
        };

        Ok(Self {
            kind,
            object_id: parcel.object_id,
            info,
            text,
        })
    }
}

fn truncate_utf8(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
