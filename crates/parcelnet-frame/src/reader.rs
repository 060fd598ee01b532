use std::io::{ErrorKind, Read};

use bytes::BytesMut;
use parcelnet_transport::NetStream;

use crate::codec::{decode_parcel, ParcelConfig, TransmissionParcel};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 64 * 1024;
const READ_CHUNK_SIZE: usize = 32 * 1024;

/// Reads complete parcels from any `Read` stream.
///
/// Handles partial reads internally; callers always get complete,
/// checksum-verified parcels.
pub struct ParcelReader<T> {
    inner: T,
    buf: BytesMut,
    config: ParcelConfig,
}

impl<T: Read> ParcelReader<T> {
    /// Create a new parcel reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, ParcelConfig::default())
    }

    /// Create a new parcel reader with explicit configuration.
    pub fn with_config(inner: T, config: ParcelConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Read the next complete parcel (blocking).
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when EOF is reached.
    pub fn read_parcel(&mut self) -> Result<TransmissionParcel> {
        let mut chunk = vec![0u8; READ_CHUNK_SIZE];
        loop {
            match decode_parcel(&mut self.buf, self.config.max_payload_size) {
                Ok(Some(parcel)) => return Ok(parcel),
                Ok(None) => {}
                Err(err) => {
                    tracing::debug!(buffered = self.buf.len(), error = %err, "undecodable parcel on stream");
                    return Err(err);
                }
            }

            let read = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            };

            if read == 0 {
                return Err(FrameError::ConnectionClosed);
            }

            self.buf.extend_from_slice(&chunk[..read]);
        }
    }

    /// Bytes received but not yet consumed as a parcel.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Current parcel reader configuration.
    pub fn config(&self) -> &ParcelConfig {
        &self.config
    }
}

impl ParcelReader<NetStream> {
    /// Create a parcel reader for `NetStream` and apply read timeout from config.
    pub fn with_config_net(inner: NetStream, config: ParcelConfig) -> Result<Self> {
        inner
            .set_read_timeout(config.read_timeout)
            .map_err(transport_to_frame_error)?;
        Ok(Self::with_config(inner, config))
    }
}

pub(crate) fn transport_to_frame_error(err: parcelnet_transport::TransportError) -> FrameError {
    match err {
        parcelnet_transport::TransportError::Io(io)
        | parcelnet_transport::TransportError::Accept(io) => FrameError::Io(io),
        parcelnet_transport::TransportError::Bind { source, .. }
        | parcelnet_transport::TransportError::Connect { source, .. } => FrameError::Io(source),
        other => FrameError::Io(std::io::Error::other(other.to_string())),
    }
}
