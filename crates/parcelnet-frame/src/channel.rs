//! Parcel channels and send priorities.

use crate::error::{FrameError, Result};

/// Category of a parcel.
///
/// The channel decides how the receiver routes a parcel: signals are handled
/// inline, objects and files go to their reassemblers. BLIND parcels never
/// reach the wire; they ride the send queue to trigger local actions in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Channel {
    /// In-band control messages.
    Signal = 0,
    /// Serialized application objects.
    Object = 1,
    /// File transfer chunks.
    File = 2,
    /// Locally scheduled marker, not transmitted.
    Blind = 3,
}

impl Channel {
    /// Wire code of this channel.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Parse a wire code.
    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Self::Signal),
            1 => Ok(Self::Object),
            2 => Ok(Self::File),
            3 => Ok(Self::Blind),
            other => Err(FrameError::UnknownChannel(other)),
        }
    }

    /// Whether sequence 0 of this channel carries an [`crate::ObjectHeader`].
    pub fn carries_header(self) -> bool {
        matches!(self, Self::Object | Self::File)
    }

    /// Human-readable channel name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Signal => "SIGNAL",
            Self::Object => "OBJECT",
            Self::File => "FILE",
            Self::Blind => "BLIND",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Send priority of an object or file.
///
/// Higher priorities are dispatched first; equal priorities go oldest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum Priority {
    Bottom = 0,
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    Top = 4,
}

impl Priority {
    /// Wire code of this priority.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Parse a wire code.
    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Self::Bottom),
            1 => Ok(Self::Low),
            2 => Ok(Self::Normal),
            3 => Ok(Self::High),
            4 => Ok(Self::Top),
            other => Err(FrameError::UnknownPriority(other)),
        }
    }

    /// Human-readable priority name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Bottom => "BOTTOM",
            Self::Low => "LOW",
            Self::Normal => "NORMAL",
            Self::High => "HIGH",
            Self::Top => "TOP",
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bottom" => Ok(Self::Bottom),
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "top" => Ok(Self::Top),
            other => Err(format!("unknown priority '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_codes_roundtrip() {
        for channel in [Channel::Signal, Channel::Object, Channel::File, Channel::Blind] {
            assert_eq!(Channel::from_code(channel.code()).unwrap(), channel);
        }
        assert!(matches!(
            Channel::from_code(9),
            Err(FrameError::UnknownChannel(9))
        ));
    }

    #[test]
    fn only_object_and_file_carry_headers() {
        assert!(!Channel::Signal.carries_header());
        assert!(Channel::Object.carries_header());
        assert!(Channel::File.carries_header());
        assert!(!Channel::Blind.carries_header());
    }

    #[test]
    fn priority_ordering_and_parsing() {
        assert!(Priority::Top > Priority::High);
        assert!(Priority::Low > Priority::Bottom);
        assert_eq!(Priority::default(), Priority::Normal);
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert!("urgent".parse::<Priority>().is_err());
        assert!(matches!(
            Priority::from_code(5),
            Err(FrameError::UnknownPriority(5))
        ));
    }
}
