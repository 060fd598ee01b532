//! Peer-to-peer object and file transfer over a single TCP connection.
//!
//! One connection carries prioritized application objects, files and
//! in-band control signals, with heartbeat supervision and flow control.
//!
//! # Crate Structure
//!
//! - [`transport`]: TCP stream wrapper and bind/accept/connect endpoint
//! - [`frame`]: parcel codec, signals and blocking parcel I/O
//! - [`conn`]: connection engine, acceptors and file transfer

/// Re-export transport types.
pub mod transport {
    pub use parcelnet_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use parcelnet_frame::*;
}

/// Re-export connection engine types.
pub mod conn {
    pub use parcelnet_conn::*;
}

pub use parcelnet_conn::{
    Client, CloseReason, ConnError, Connection, ConnectionListener, ConnectionParameters, Engine,
    JsonCodec, Priority, Server, TransmissionEvent, TransmissionEventKind,
};
