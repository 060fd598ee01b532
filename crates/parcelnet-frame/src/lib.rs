//! Checksummed parcel framing for parcelnet.
//!
//! Every transmission unit on the wire is a *parcel*:
//! - A 4-byte magic marker ("PRCL") for stream synchronization
//! - Channel, priority, object id, sequence number and payload length
//! - A CRC32 protecting everything that follows the magic
//! - On sequence 0 of OBJECT and FILE parcels, an [`ObjectHeader`]
//!
//! Multi-parcel objects are produced by [`PayloadSplitter`]; control
//! traffic travels as [`Signal`]s on the SIGNAL channel.

pub mod channel;
pub mod codec;
pub mod error;
pub mod reader;
pub mod signal;
pub mod writer;

pub use channel::{Channel, Priority};
pub use codec::{
    decode_parcel, encode_parcel, parcel_count, ObjectHeader, ParcelConfig, PayloadSplitter,
    TransmissionParcel, DEFAULT_MAX_PAYLOAD, HEADER_SIZE, MAGIC, MAX_PARCEL_SIZE,
    MIN_PARCEL_SIZE,
};
pub use error::{FrameError, Result};
pub use reader::ParcelReader;
pub use signal::{Signal, SignalType, FAIL_DESTINATION, MAX_SIGNAL_TEXT};
pub use writer::ParcelWriter;
