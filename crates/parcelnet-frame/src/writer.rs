use std::io::{self, ErrorKind, Write};

use bytes::BytesMut;

use crate::codec::{encode_parcel, ParcelConfig, TransmissionParcel, HEADER_SIZE};
use crate::error::{FrameError, Result};

/// Encodes parcels into one reused buffer and puts each on the wire whole.
///
/// Every parcel is flushed on its own, so a signal written after data never
/// waits in a userspace buffer. A parcel that fails to encode leaves the
/// stream untouched.
pub struct ParcelWriter<T> {
    inner: T,
    buf: BytesMut,
    max_payload: usize,
}

impl<T: Write> ParcelWriter<T> {
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, ParcelConfig::default())
    }

    /// Only `max_payload_size` applies; write timeouts belong to the stream.
    pub fn with_config(inner: T, config: ParcelConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(HEADER_SIZE + config.max_payload_size.min(64 * 1024)),
            max_payload: config.max_payload_size,
        }
    }

    /// Encode and write one parcel, blocking until it is flushed.
    ///
    /// Returns the number of bytes put on the wire.
    pub fn write_parcel(&mut self, parcel: &TransmissionParcel) -> Result<usize> {
        if parcel.payload.len() > self.max_payload {
            return Err(FrameError::PayloadTooLarge {
                size: parcel.payload.len(),
                max: self.max_payload,
            });
        }

        self.buf.clear();
        encode_parcel(parcel, &mut self.buf)?;
        if let Err(err) = self.put_encoded() {
            tracing::debug!(
                channel = %parcel.channel,
                object_id = parcel.object_id,
                sequence = parcel.sequence,
                error = %err,
                "parcel write failed"
            );
            return Err(err);
        }

        let size = self.buf.len();
        tracing::trace!(
            channel = %parcel.channel,
            object_id = parcel.object_id,
            sequence = parcel.sequence,
            size,
            "parcel written"
        );
        Ok(size)
    }

    fn put_encoded(&mut self) -> Result<()> {
        self.inner.write_all(&self.buf).map_err(write_error)?;
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(write_error(err)),
            }
        }
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

fn write_error(err: io::Error) -> FrameError {
    if err.kind() == ErrorKind::WriteZero {
        FrameError::ConnectionClosed
    } else {
        FrameError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::channel::{Channel, Priority};
    use crate::codec::{decode_parcel, ObjectHeader, DEFAULT_MAX_PAYLOAD};
    use crate::signal::Signal;

    fn decode_all(wire: Vec<u8>) -> Vec<TransmissionParcel> {
        let mut wire = BytesMut::from(wire.as_slice());
        let mut parcels = Vec::new();
        while let Some(parcel) = decode_parcel(&mut wire, DEFAULT_MAX_PAYLOAD).unwrap() {
            parcels.push(parcel);
        }
        assert!(wire.is_empty());
        parcels
    }

    #[test]
    fn write_reports_wire_size() {
        let mut writer = ParcelWriter::new(Cursor::new(Vec::<u8>::new()));
        let parcel = TransmissionParcel::new(Channel::File, Priority::Normal, 3, 2, &b"abc"[..]);

        let written = writer.write_parcel(&parcel).unwrap();
        assert_eq!(written, HEADER_SIZE + 3);
        assert_eq!(written, parcel.wire_size());
        assert_eq!(decode_all(writer.into_inner().into_inner()), vec![parcel]);
    }

    #[test]
    fn header_parcel_and_signal_share_the_stream() {
        let mut writer = ParcelWriter::new(Cursor::new(Vec::<u8>::new()));
        let first = TransmissionParcel::new(Channel::Object, Priority::High, 9, 0, &b"{}"[..])
            .with_header(ObjectHeader {
                method: 1,
                total_size: 2,
                parcel_count: 1,
                path: None,
            });
        let alive = Signal::alive().to_parcel();

        let a = writer.write_parcel(&first).unwrap();
        let b = writer.write_parcel(&alive).unwrap();
        let wire = writer.into_inner().into_inner();
        assert_eq!(wire.len(), a + b);
        assert_eq!(decode_all(wire), vec![first, alive]);
    }

    #[test]
    fn unencodable_parcel_leaves_stream_untouched() {
        let mut writer = ParcelWriter::new(Cursor::new(Vec::<u8>::new()));
        let headless = TransmissionParcel::new(Channel::Object, Priority::Normal, 4, 0, &b"x"[..]);
        assert!(matches!(
            writer.write_parcel(&headless),
            Err(FrameError::MissingHeader { object_id: 4 })
        ));
        assert!(writer.into_inner().into_inner().is_empty());
    }

    #[test]
    fn payload_too_large_rejected() {
        let cfg = ParcelConfig {
            max_payload_size: 4,
            ..ParcelConfig::default()
        };
        let mut writer = ParcelWriter::with_config(Cursor::new(Vec::<u8>::new()), cfg);
        let parcel = TransmissionParcel::new(Channel::File, Priority::Normal, 1, 1, &b"oversized"[..]);
        assert!(matches!(
            writer.write_parcel(&parcel),
            Err(FrameError::PayloadTooLarge { size: 9, max: 4 })
        ));
    }

    #[test]
    fn every_parcel_is_flushed() {
        let sink = FlushTrackingWriter::default();
        let flag = Arc::clone(&sink.flushed);
        let mut writer = ParcelWriter::new(sink);

        writer.write_parcel(&Signal::alive().to_parcel()).unwrap();
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn interrupted_write_is_retried() {
        let mut writer = ParcelWriter::new(InterruptOnce::default());
        let written = writer.write_parcel(&Signal::ping(3).to_parcel()).unwrap();
        let sink = writer.into_inner();
        assert!(sink.interrupted);
        assert_eq!(sink.data.len(), written);
    }

    #[test]
    fn zero_length_write_is_connection_closed() {
        let mut writer = ParcelWriter::new(ZeroWriter);
        assert!(matches!(
            writer.write_parcel(&Signal::alive().to_parcel()),
            Err(FrameError::ConnectionClosed)
        ));
    }

    #[derive(Default)]
    struct FlushTrackingWriter {
        flushed: Arc<AtomicBool>,
    }

    impl Write for FlushTrackingWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            self.flushed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct InterruptOnce {
        interrupted: bool,
        data: Vec<u8>,
    }

    impl Write for InterruptOnce {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if !self.interrupted {
                self.interrupted = true;
                return Err(io::Error::from(ErrorKind::Interrupted));
            }
            self.data.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct ZeroWriter;

    impl Write for ZeroWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Ok(0)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}
