use std::path::PathBuf;
use std::time::Duration;

use parcelnet_frame::{MAX_PARCEL_SIZE, MIN_PARCEL_SIZE};

use crate::error::{ConnError, Result};

/// Lower bound of the send-load gate threshold.
pub const MIN_SEND_LOAD_THRESHOLD: u64 = 16 * 1024;

/// Transmission speed of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Tempo {
    #[default]
    Unlimited,
    /// Data parcels are held back; signals still flow.
    Paused,
    /// Bytes per second.
    Limited(u32),
}

impl Tempo {
    /// Encoding carried in the `info` field of a TEMPO signal.
    pub fn to_wire(self) -> i32 {
        match self {
            Self::Unlimited => -1,
            Self::Paused => 0,
            Self::Limited(rate) => i32::try_from(rate).unwrap_or(i32::MAX),
        }
    }

    pub fn from_wire(info: i32) -> Self {
        match info {
            i32::MIN..=-1 => Self::Unlimited,
            0 => Self::Paused,
            rate => Self::Limited(rate as u32),
        }
    }

    pub fn is_paused(self) -> bool {
        self == Self::Paused
    }

    /// Minimum spacing between writes of `bytes` at this tempo.
    pub fn spacing(self, bytes: usize) -> Duration {
        match self {
            Self::Limited(rate) if rate > 0 => {
                Duration::from_millis((bytes as u64).saturating_mul(1000) / u64::from(rate))
            }
            _ => Duration::ZERO,
        }
    }
}

impl std::fmt::Display for Tempo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unlimited => f.write_str("unlimited"),
            Self::Paused => f.write_str("paused"),
            Self::Limited(rate) => write!(f, "{rate} B/s"),
        }
    }
}

/// Per-connection configuration.
///
/// Frozen once the connection starts, except for the alive period, the
/// idle threshold and the tempo which are adjusted through
/// [`crate::Connection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParameters {
    /// Payload bytes per parcel.
    pub parcel_size: usize,
    /// Maximum number of objects and files waiting to be sent.
    pub object_queue_capacity: usize,
    /// Sizes the send-load gate together with `parcel_size`.
    pub parcel_queue_capacity: usize,
    /// Maximum number of received objects waiting for delivery.
    pub delivery_queue_capacity: usize,
    /// ALIVE interval; zero disables the heartbeat.
    pub alive_period: Duration,
    /// Grace period for ALIVE_ECHO and file confirmations.
    pub confirm_timeout: Duration,
    /// Bytes per `idle_check_period` under which the connection counts as idle; zero disables.
    pub idle_threshold: u64,
    pub idle_check_period: Duration,
    /// Largest serialized object accepted for sending.
    pub max_serialization_size: usize,
    pub tempo: Tempo,
    /// When set, incoming TEMPO requests are overruled by `tempo`.
    pub tempo_fixed: bool,
    /// Base directory for remote target paths; files without one stay in `temp_dir`.
    pub root_dir: Option<PathBuf>,
    /// Staging directory for incoming files.
    pub temp_dir: PathBuf,
    pub handshake_timeout: Duration,
}

impl Default for ConnectionParameters {
    fn default() -> Self {
        Self {
            parcel_size: 32 * 1024,
            object_queue_capacity: 200,
            parcel_queue_capacity: 100,
            delivery_queue_capacity: 200,
            alive_period: Duration::from_secs(10),
            confirm_timeout: Duration::from_secs(30),
            idle_threshold: 0,
            idle_check_period: Duration::from_secs(60),
            max_serialization_size: 100 * 1024 * 1024,
            tempo: Tempo::Unlimited,
            tempo_fixed: false,
            root_dir: None,
            temp_dir: std::env::temp_dir(),
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

impl ConnectionParameters {
    pub fn validate(&self) -> Result<()> {
        if !(MIN_PARCEL_SIZE..=MAX_PARCEL_SIZE).contains(&self.parcel_size) {
            return Err(ConnError::InvalidParameter(format!(
                "parcel_size {} outside {}..={}",
                self.parcel_size, MIN_PARCEL_SIZE, MAX_PARCEL_SIZE
            )));
        }
        for (name, value) in [
            ("object_queue_capacity", self.object_queue_capacity),
            ("parcel_queue_capacity", self.parcel_queue_capacity),
            ("delivery_queue_capacity", self.delivery_queue_capacity),
            ("max_serialization_size", self.max_serialization_size),
        ] {
            if value == 0 {
                return Err(ConnError::InvalidParameter(format!("{name} must be positive")));
            }
        }
        if self.confirm_timeout.is_zero() {
            return Err(ConnError::InvalidParameter(
                "confirm_timeout must be positive".to_string(),
            ));
        }
        if self.handshake_timeout.is_zero() {
            return Err(ConnError::InvalidParameter(
                "handshake_timeout must be positive".to_string(),
            ));
        }
        if self.idle_threshold > 0 && self.idle_check_period.is_zero() {
            return Err(ConnError::InvalidParameter(
                "idle_check_period must be positive when idle detection is enabled".to_string(),
            ));
        }
        Ok(())
    }

    /// Unsent bytes above which the per-connection sender blocks.
    pub fn send_load_threshold(&self) -> u64 {
        let half = (self.parcel_queue_capacity as u64).saturating_mul(self.parcel_size as u64) / 2;
        half.max(MIN_SEND_LOAD_THRESHOLD)
    }

    /// Grace period after a close before the socket is forced down.
    pub fn drain_timeout(&self) -> Duration {
        self.confirm_timeout.saturating_mul(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        ConnectionParameters::default().validate().unwrap();
    }

    #[test]
    fn parcel_size_bounds() {
        let mut params = ConnectionParameters {
            parcel_size: MIN_PARCEL_SIZE - 1,
            ..ConnectionParameters::default()
        };
        assert!(matches!(
            params.validate(),
            Err(ConnError::InvalidParameter(_))
        ));
        params.parcel_size = MAX_PARCEL_SIZE;
        params.validate().unwrap();
        params.parcel_size = MAX_PARCEL_SIZE + 1;
        assert!(params.validate().is_err());
    }

    #[test]
    fn zero_capacity_rejected() {
        let params = ConnectionParameters {
            delivery_queue_capacity: 0,
            ..ConnectionParameters::default()
        };
        let err = params.validate().unwrap_err();
        assert!(err.to_string().contains("delivery_queue_capacity"));
    }

    #[test]
    fn send_load_threshold_has_floor() {
        let small = ConnectionParameters {
            parcel_size: MIN_PARCEL_SIZE,
            parcel_queue_capacity: 2,
            ..ConnectionParameters::default()
        };
        assert_eq!(small.send_load_threshold(), MIN_SEND_LOAD_THRESHOLD);

        let default = ConnectionParameters::default();
        assert_eq!(default.send_load_threshold(), 100 * 32 * 1024 / 2);
    }

    #[test]
    fn tempo_wire_encoding() {
        assert_eq!(Tempo::Unlimited.to_wire(), -1);
        assert_eq!(Tempo::Paused.to_wire(), 0);
        assert_eq!(Tempo::Limited(4096).to_wire(), 4096);
        assert_eq!(Tempo::from_wire(-7), Tempo::Unlimited);
        assert_eq!(Tempo::from_wire(0), Tempo::Paused);
        assert_eq!(Tempo::from_wire(10), Tempo::Limited(10));
    }

    #[test]
    fn tempo_spacing() {
        assert_eq!(Tempo::Limited(1000).spacing(500), Duration::from_millis(500));
        assert_eq!(Tempo::Unlimited.spacing(1 << 20), Duration::ZERO);
        assert_eq!(Tempo::Paused.spacing(10), Duration::ZERO);
    }
}
