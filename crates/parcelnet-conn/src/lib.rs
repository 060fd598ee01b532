//! Connection engine for parcelnet.
//!
//! A [`Connection`] owns one TCP socket and multiplexes objects, files and
//! control signals over it:
//! - Sends are queued by priority and split into parcels by a per-connection
//!   sender thread, then written by the engine's single shared sending thread
//! - A send-load gate and an optional tempo limit hold back data, never signals
//! - Received objects are reassembled and delivered to listeners in completion order
//! - Files are staged in a temp directory by a worker thread per transfer and
//!   confirmed back to the sender
//! - ALIVE/ALIVE_ECHO detect a silent peer; idle detection reports low traffic
//!
//! Connections are created through a [`Server`] or [`Client`], both of
//! which run the role handshake first, or directly with a
//! [`ConnectionBuilder`] and [`Connection::start`].

pub mod client;
pub mod codec;
pub mod connection;
mod core_send;
mod delivery;
pub mod engine;
pub mod error;
pub mod event;
pub mod file_agglom;
pub mod handshake;
mod heartbeat;
mod object_agglom;
pub mod params;
mod receiver;
mod send_load;
mod send_queue;
mod sender;
pub mod server;
mod timer;
pub mod transfer;

pub use client::Client;
pub use codec::{CodecError, JsonCodec, Object, ObjectCodec};
pub use connection::{Connection, ConnectionBuilder, ConnectionState};
pub use engine::Engine;
pub use error::{CloseReason, ConnError, Result};
pub use event::{ConnectionListener, Direction, PingEcho, TransmissionEvent, TransmissionEventKind};
pub use file_agglom::{resolve_destination, FsSpaceProbe, SpaceProbe, SPACE_MARGIN};
pub use handshake::{HandshakeResult, Verdict, REJECT_CAPACITY, REJECT_SHUTDOWN};
pub use params::{ConnectionParameters, Tempo, MIN_SEND_LOAD_THRESHOLD};
pub use parcelnet_frame::Priority;
pub use server::Server;
pub use transfer::{
    BREAK_CANCELLED, BREAK_CONFIRM_TIMEOUT, BREAK_IO, BREAK_NO_SPACE, BREAK_SEQUENCE, FILE_METHOD,
};
