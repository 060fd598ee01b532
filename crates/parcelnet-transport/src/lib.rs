//! TCP transport abstraction.
//!
//! This is the lowest layer of parcelnet. It owns nothing but the socket:
//! a [`NetStream`] is a connected TCP stream that can be cloned into an
//! independent reader and writer half, and [`TcpEndpoint`] is the minimal
//! bind/accept/connect surface used by the acceptors above it.

pub mod error;
pub mod stream;
pub mod tcp;

pub use error::{Result, TransportError};
pub use stream::NetStream;
pub use tcp::TcpEndpoint;
