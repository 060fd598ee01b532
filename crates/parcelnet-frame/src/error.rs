/// Errors that can occur during parcel encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The parcel does not start with the magic marker.
    #[error("invalid parcel magic (expected \"PRCL\")")]
    InvalidMagic,

    /// The CRC32 stored in the parcel does not match its content.
    #[error("parcel checksum mismatch (stored {stored:#010x}, computed {computed:#010x})")]
    ChecksumMismatch { stored: u32, computed: u32 },

    /// The channel byte does not name a known channel.
    #[error("unknown channel code {0}")]
    UnknownChannel(u8),

    /// The priority byte does not name a known priority.
    #[error("unknown priority code {0}")]
    UnknownPriority(u8),

    /// A SIGNAL parcel carries an unknown signal type.
    #[error("unknown signal code {0}")]
    UnknownSignal(u32),

    /// BLIND parcels are scheduled locally and never cross the wire.
    #[error("BLIND parcels cannot be encoded or decoded")]
    BlindParcel,

    /// Sequence 0 of an OBJECT/FILE parcel lacks its object header.
    #[error("parcel 0 of object {object_id} has no object header")]
    MissingHeader { object_id: u64 },

    /// An object header was attached where none is allowed.
    #[error("object header attached to parcel {sequence} of object {object_id}")]
    UnexpectedHeader { object_id: u64, sequence: u32 },

    /// The object header is structurally invalid.
    #[error("malformed object header: {0}")]
    MalformedHeader(String),

    /// A SIGNAL parcel payload is structurally invalid.
    #[error("malformed signal: {0}")]
    MalformedSignal(String),

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// An I/O error occurred while reading or writing parcels.
    #[error("parcel I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete parcel was received.
    #[error("connection closed (incomplete parcel)")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, FrameError>;
