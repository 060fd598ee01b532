use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::channel::{Channel, Priority};
use crate::error::{FrameError, Result};

/// Fixed parcel header: magic (4) + channel (1) + priority (1) + object id (8)
/// + sequence (4) + payload length (4) + crc (4) = 26 bytes.
pub const HEADER_SIZE: usize = 26;

/// Magic bytes: "PRCL".
pub const MAGIC: [u8; 4] = *b"PRCL";

/// Smallest configurable parcel payload size.
pub const MIN_PARCEL_SIZE: usize = 1024;

/// Largest configurable parcel payload size.
pub const MAX_PARCEL_SIZE: usize = 256 * 1024;

/// Default maximum accepted payload per parcel.
pub const DEFAULT_MAX_PAYLOAD: usize = MAX_PARCEL_SIZE;

/// Fixed part of an encoded object header: method (1) + total size (4)
/// + parcel count (4) + path length (2).
const OBJECT_HEADER_FIXED: usize = 11;

/// Extended header carried by parcel 0 of every OBJECT and FILE transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHeader {
    /// Serialization method id of the sending codec (0 for files).
    pub method: u8,
    /// Total serialized size of the object or file in bytes.
    pub total_size: u32,
    /// Number of parcels the object or file is split into.
    pub parcel_count: u32,
    /// Remote target path (files only).
    pub path: Option<String>,
}

impl ObjectHeader {
    /// Encoded length in bytes.
    pub fn encoded_len(&self) -> usize {
        OBJECT_HEADER_FIXED + self.path.as_ref().map_or(0, String::len)
    }

    /// Append the wire form of this header to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        let path = self.path.as_deref().unwrap_or("");
        if path.len() > u16::MAX as usize {
            return Err(FrameError::MalformedHeader(format!(
                "path too long ({} bytes, max {})",
                path.len(),
                u16::MAX
            )));
        }
        if self.parcel_count == 0 {
            return Err(FrameError::MalformedHeader(
                "parcel count must be at least 1".to_string(),
            ));
        }
        dst.reserve(self.encoded_len());
        dst.put_u8(self.method);
        dst.put_u32_le(self.total_size);
        dst.put_u32_le(self.parcel_count);
        dst.put_u16_le(path.len() as u16);
        dst.put_slice(path.as_bytes());
        Ok(())
    }

    /// Decode a header from exactly its encoded bytes.
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < OBJECT_HEADER_FIXED {
            return Err(FrameError::MalformedHeader(format!(
                "header truncated ({} bytes)",
                src.len()
            )));
        }
        let method = src[0];
        let total_size = le_u32(src, 1);
        let parcel_count = le_u32(src, 5);
        let path_len = le_u16(src, 9) as usize;

        if parcel_count == 0 {
            return Err(FrameError::MalformedHeader(
                "parcel count must be at least 1".to_string(),
            ));
        }
        if src.len() != OBJECT_HEADER_FIXED + path_len {
            return Err(FrameError::MalformedHeader(format!(
                "path length {} does not match header extent {}",
                path_len,
                src.len()
            )));
        }

        let path = if path_len == 0 {
            None
        } else {
            let raw = &src[OBJECT_HEADER_FIXED..];
            let text = std::str::from_utf8(raw).map_err(|err| {
                FrameError::MalformedHeader(format!("path is not valid UTF-8: {err}"))
            })?;
            Some(text.to_string())
        };

        Ok(Self {
            method,
            total_size,
            parcel_count,
            path,
        })
    }
}

/// One framed unit of wire data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransmissionParcel {
    pub channel: Channel,
    pub priority: Priority,
    /// Object or file id; for signals the subject of the signal.
    pub object_id: u64,
    /// 0-based parcel index; for signals the signal type code.
    pub sequence: u32,
    /// Present only on sequence 0 of OBJECT/FILE parcels.
    pub header: Option<ObjectHeader>,
    pub payload: Bytes,
}

impl TransmissionParcel {
    /// Create a parcel without an object header.
    pub fn new(
        channel: Channel,
        priority: Priority,
        object_id: u64,
        sequence: u32,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            channel,
            priority,
            object_id,
            sequence,
            header: None,
            payload: payload.into(),
        }
    }

    /// Attach an object header.
    pub fn with_header(mut self, header: ObjectHeader) -> Self {
        self.header = Some(header);
        self
    }

    /// Whether this parcel must carry an object header on the wire.
    pub fn requires_header(&self) -> bool {
        self.sequence == 0 && self.channel.carries_header()
    }

    /// The total wire size of this parcel (fixed header + object header + payload).
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.header.as_ref().map_or(0, ObjectHeader::encoded_len) + self.payload.len()
    }
}

/// Number of parcels needed for `len` payload bytes at `parcel_size` bytes each.
///
/// An empty payload still occupies one parcel so its header reaches the peer.
pub fn parcel_count(len: usize, parcel_size: usize) -> u32 {
    let parcel_size = parcel_size.max(1);
    len.div_ceil(parcel_size).max(1) as u32
}

/// Encode a parcel into the wire format.
///
/// Wire format:
/// ```text
/// ┌───────────┬─────────┬──────────┬─────────────┬──────────┬─────────────┬──────────┬────────────────┬──────────┐
/// │ Magic (4) │ Channel │ Priority │ Object id   │ Sequence │ Payload len │ CRC32    │ [ObjectHeader] │ Payload  │
/// │ "PRCL"    │ (1)     │ (1)      │ (8B LE)     │ (4B LE)  │ (4B LE)     │ (4B LE)  │ seq 0 only     │          │
/// └───────────┴─────────┴──────────┴─────────────┴──────────┴─────────────┴──────────┴────────────────┴──────────┘
/// ```
pub fn encode_parcel(parcel: &TransmissionParcel, dst: &mut BytesMut) -> Result<()> {
    if parcel.channel == Channel::Blind {
        return Err(FrameError::BlindParcel);
    }
    if parcel.payload.len() > u32::MAX as usize {
        return Err(FrameError::PayloadTooLarge {
            size: parcel.payload.len(),
            max: u32::MAX as usize,
        });
    }
    match (&parcel.header, parcel.requires_header()) {
        (None, true) => {
            return Err(FrameError::MissingHeader {
                object_id: parcel.object_id,
            })
        }
        (Some(_), false) => {
            return Err(FrameError::UnexpectedHeader {
                object_id: parcel.object_id,
                sequence: parcel.sequence,
            })
        }
        _ => {}
    }

    let start = dst.len();
    dst.reserve(parcel.wire_size());
    dst.put_slice(&MAGIC);
    dst.put_u8(parcel.channel.code());
    dst.put_u8(parcel.priority.code());
    dst.put_u64_le(parcel.object_id);
    dst.put_u32_le(parcel.sequence);
    dst.put_u32_le(parcel.payload.len() as u32);
    let crc_at = dst.len();
    dst.put_u32_le(0);

    let header_at = dst.len();
    if let Some(header) = &parcel.header {
        header.encode(dst)?;
    }
    let header_end = dst.len();
    dst.put_slice(&parcel.payload);

    let crc = parcel_crc(
        &parcel.payload,
        parcel.object_id,
        parcel.sequence,
        parcel.channel.code(),
        parcel.priority.code(),
        &dst[header_at..header_end],
    );
    dst[crc_at..crc_at + 4].copy_from_slice(&crc.to_le_bytes());
    debug_assert_eq!(dst.len() - start, parcel.wire_size());
    Ok(())
}

/// Decode a parcel from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete parcel yet.
/// The magic marker and the checksum are verified before any field is
/// interpreted; on success the parcel bytes are consumed from the buffer.
pub fn decode_parcel(src: &mut BytesMut, max_payload: usize) -> Result<Option<TransmissionParcel>> {
    let visible = src.len().min(MAGIC.len());
    if src[..visible] != MAGIC[..visible] {
        return Err(FrameError::InvalidMagic);
    }
    if src.len() < HEADER_SIZE {
        return Ok(None); // Need more data
    }

    let channel_code = src[4];
    let priority_code = src[5];
    let object_id = le_u64(src, 6);
    let sequence = le_u32(src, 14);
    let payload_len = le_u32(src, 18) as usize;
    let stored_crc = le_u32(src, 22);

    if payload_len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }

    // Framing only: the extent depends on whether an object header follows.
    let has_header = sequence == 0
        && Channel::from_code(channel_code).is_ok_and(Channel::carries_header);
    let header_len = if has_header {
        if src.len() < HEADER_SIZE + OBJECT_HEADER_FIXED {
            return Ok(None);
        }
        OBJECT_HEADER_FIXED + le_u16(src, HEADER_SIZE + 9) as usize
    } else {
        0
    };

    let total = HEADER_SIZE + header_len + payload_len;
    if src.len() < total {
        return Ok(None); // Need more data
    }

    let header_bytes = &src[HEADER_SIZE..HEADER_SIZE + header_len];
    let payload_bytes = &src[HEADER_SIZE + header_len..total];
    let computed_crc = parcel_crc(
        payload_bytes,
        object_id,
        sequence,
        channel_code,
        priority_code,
        header_bytes,
    );
    if computed_crc != stored_crc {
        return Err(FrameError::ChecksumMismatch {
            stored: stored_crc,
            computed: computed_crc,
        });
    }

    let channel = Channel::from_code(channel_code)?;
    if channel == Channel::Blind {
        return Err(FrameError::BlindParcel);
    }
    let priority = Priority::from_code(priority_code)?;
    let header = if has_header {
        Some(ObjectHeader::decode(header_bytes)?)
    } else {
        None
    };

    src.advance(HEADER_SIZE + header_len);
    let payload = src.split_to(payload_len).freeze();

    Ok(Some(TransmissionParcel {
        channel,
        priority,
        object_id,
        sequence,
        header,
        payload,
    }))
}

/// Splits a serialized payload into its sequence of parcels.
///
/// Parcel 0 carries the [`ObjectHeader`]; the rest carry plain slices of the
/// payload. Slicing is zero-copy.
#[derive(Debug, Clone)]
pub struct PayloadSplitter {
    channel: Channel,
    priority: Priority,
    object_id: u64,
    payload: Bytes,
    parcel_size: usize,
    header: Option<ObjectHeader>,
    next: u32,
    count: u32,
}

impl PayloadSplitter {
    /// Prepare to split `payload` into parcels of at most `parcel_size` bytes.
    pub fn new(
        channel: Channel,
        priority: Priority,
        object_id: u64,
        method: u8,
        payload: Bytes,
        parcel_size: usize,
        path: Option<String>,
    ) -> Result<Self> {
        if payload.len() > u32::MAX as usize {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                max: u32::MAX as usize,
            });
        }
        let parcel_size = parcel_size.max(1);
        let count = parcel_count(payload.len(), parcel_size);
        let header = ObjectHeader {
            method,
            total_size: payload.len() as u32,
            parcel_count: count,
            path,
        };
        Ok(Self {
            channel,
            priority,
            object_id,
            payload,
            parcel_size,
            header: Some(header),
            next: 0,
            count,
        })
    }

    /// Total number of parcels this payload splits into.
    pub fn parcel_count(&self) -> u32 {
        self.count
    }

    /// Parcels not yet produced.
    pub fn remaining(&self) -> u32 {
        self.count - self.next
    }

    /// Object id of the payload being split.
    pub fn object_id(&self) -> u64 {
        self.object_id
    }
}

impl Iterator for PayloadSplitter {
    type Item = TransmissionParcel;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.count {
            return None;
        }
        let start = (self.next as usize) * self.parcel_size;
        let end = (start + self.parcel_size).min(self.payload.len());
        let chunk = self.payload.slice(start.min(end)..end);

        let mut parcel =
            TransmissionParcel::new(self.channel, self.priority, self.object_id, self.next, chunk);
        if self.next == 0 {
            parcel.header = self.header.take();
        }
        self.next += 1;
        Some(parcel)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining() as usize;
        (remaining, Some(remaining))
    }
}

/// Configuration for the parcel reader and writer.
#[derive(Debug, Clone)]
pub struct ParcelConfig {
    /// Maximum payload size per parcel in bytes. Default: 256 KiB.
    pub max_payload_size: usize,
    /// Read timeout for blocking operations.
    pub read_timeout: Option<std::time::Duration>,
    /// Write timeout for blocking operations.
    pub write_timeout: Option<std::time::Duration>,
}

impl Default for ParcelConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

/// CRC32 over payload, object id, sequence and channel, followed by the
/// priority byte and the encoded object header.
fn parcel_crc(
    payload: &[u8],
    object_id: u64,
    sequence: u32,
    channel: u8,
    priority: u8,
    header: &[u8],
) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(payload);
    hasher.update(&object_id.to_le_bytes());
    hasher.update(&sequence.to_le_bytes());
    hasher.update(&[channel, priority]);
    hasher.update(header);
    hasher.finalize()
}

fn le_u16(src: &[u8], at: usize) -> u16 {
    let mut raw = [0u8; 2];
    raw.copy_from_slice(&src[at..at + 2]);
    u16::from_le_bytes(raw)
}

fn le_u32(src: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&src[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn le_u64(src: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&src[at..at + 8]);
    u64::from_le_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object_parcel(path: Option<&str>) -> TransmissionParcel {
        TransmissionParcel::new(Channel::File, Priority::High, 42, 0, &b"file-bytes"[..])
            .with_header(ObjectHeader {
                method: 0,
                total_size: 10,
                parcel_count: 1,
                path: path.map(str::to_string),
            })
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let parcel = TransmissionParcel::new(Channel::Object, Priority::Low, 7, 3, &b"chunk"[..]);
        let mut buf = BytesMut::new();
        encode_parcel(&parcel, &mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE + 5);

        let decoded = decode_parcel(&mut buf, DEFAULT_MAX_PAYLOAD)
            .unwrap()
            .unwrap();
        assert_eq!(decoded, parcel);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_header_roundtrip_with_path() {
        let parcel = object_parcel(Some("incoming/report.pdf"));
        let mut buf = BytesMut::new();
        encode_parcel(&parcel, &mut buf).unwrap();
        assert_eq!(buf.len(), parcel.wire_size());

        let decoded = decode_parcel(&mut buf, DEFAULT_MAX_PAYLOAD)
            .unwrap()
            .unwrap();
        let header = decoded.header.as_ref().unwrap();
        assert_eq!(header.path.as_deref(), Some("incoming/report.pdf"));
        assert_eq!(header.total_size, 10);
        assert_eq!(decoded.payload.as_ref(), b"file-bytes");
    }

    #[test]
    fn test_empty_path_decodes_as_absent() {
        let mut buf = BytesMut::new();
        encode_parcel(&object_parcel(None), &mut buf).unwrap();
        let decoded = decode_parcel(&mut buf, DEFAULT_MAX_PAYLOAD)
            .unwrap()
            .unwrap();
        assert_eq!(decoded.header.unwrap().path, None);
    }

    #[test]
    fn test_missing_header_rejected() {
        let parcel = TransmissionParcel::new(Channel::Object, Priority::Normal, 1, 0, &b"x"[..]);
        let mut buf = BytesMut::new();
        let err = encode_parcel(&parcel, &mut buf).unwrap_err();
        assert!(matches!(err, FrameError::MissingHeader { object_id: 1 }));
    }

    #[test]
    fn test_header_on_later_parcel_rejected() {
        let mut parcel = object_parcel(None);
        parcel.sequence = 2;
        let mut buf = BytesMut::new();
        let err = encode_parcel(&parcel, &mut buf).unwrap_err();
        assert!(matches!(err, FrameError::UnexpectedHeader { .. }));
    }

    #[test]
    fn test_blind_parcel_never_encoded() {
        let parcel = TransmissionParcel::new(Channel::Blind, Priority::Normal, 1, 1, Bytes::new());
        let mut buf = BytesMut::new();
        assert!(matches!(
            encode_parcel(&parcel, &mut buf),
            Err(FrameError::BlindParcel)
        ));
    }

    #[test]
    fn test_decode_incomplete() {
        let mut full = BytesMut::new();
        encode_parcel(&object_parcel(Some("a/b")), &mut full).unwrap();

        for cut in [2, HEADER_SIZE - 1, HEADER_SIZE + 3, full.len() - 1] {
            let mut partial = BytesMut::from(&full[..cut]);
            assert!(decode_parcel(&mut partial, DEFAULT_MAX_PAYLOAD)
                .unwrap()
                .is_none());
        }
    }

    #[test]
    fn test_decode_invalid_magic_before_anything_else() {
        let mut buf = BytesMut::from(&b"PRX"[..]);
        assert!(matches!(
            decode_parcel(&mut buf, DEFAULT_MAX_PAYLOAD),
            Err(FrameError::InvalidMagic)
        ));
    }

    #[test]
    fn test_decode_payload_too_large() {
        let parcel =
            TransmissionParcel::new(Channel::Object, Priority::Normal, 1, 1, vec![0u8; 2048]);
        let mut buf = BytesMut::new();
        encode_parcel(&parcel, &mut buf).unwrap();
        assert!(matches!(
            decode_parcel(&mut buf, 1024),
            Err(FrameError::PayloadTooLarge { size: 2048, .. })
        ));
    }

    #[test]
    fn test_any_tampered_byte_is_detected() {
        let mut wire = BytesMut::new();
        encode_parcel(&object_parcel(Some("dir/name.bin")), &mut wire).unwrap();

        for index in 0..wire.len() {
            for mask in [0x01u8, 0x80] {
                let mut tampered = BytesMut::from(&wire[..]);
                tampered[index] ^= mask;
                let result = decode_parcel(&mut tampered, DEFAULT_MAX_PAYLOAD);
                assert!(
                    !matches!(result, Ok(Some(_))),
                    "tampering byte {index} with mask {mask:#04x} went undetected"
                );
            }
        }
    }

    #[test]
    fn test_multiple_parcels_in_buffer() {
        let mut buf = BytesMut::new();
        let first = TransmissionParcel::new(Channel::Object, Priority::Normal, 5, 1, &b"one"[..]);
        let second = TransmissionParcel::new(Channel::Object, Priority::Normal, 5, 2, &b"two"[..]);
        encode_parcel(&first, &mut buf).unwrap();
        encode_parcel(&second, &mut buf).unwrap();

        assert_eq!(
            decode_parcel(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap(),
            Some(first)
        );
        assert_eq!(
            decode_parcel(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap(),
            Some(second)
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_parcel_count() {
        assert_eq!(parcel_count(0, 1024), 1);
        assert_eq!(parcel_count(1, 1024), 1);
        assert_eq!(parcel_count(1024, 1024), 1);
        assert_eq!(parcel_count(1025, 1024), 2);
        assert_eq!(parcel_count(500_000, 32 * 1024), 16);
    }

    #[test]
    fn test_splitter_attaches_header_to_first_parcel_only() {
        let payload: Bytes = (0..10_000u32).map(|i| i as u8).collect::<Vec<u8>>().into();
        let splitter = PayloadSplitter::new(
            Channel::Object,
            Priority::Normal,
            9,
            1,
            payload.clone(),
            4096,
            None,
        )
        .unwrap();
        assert_eq!(splitter.parcel_count(), 3);

        let parcels: Vec<_> = splitter.collect();
        assert_eq!(parcels.len(), 3);
        assert_eq!(
            parcels.iter().map(|p| p.sequence).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        let header = parcels[0].header.as_ref().unwrap();
        assert_eq!(header.total_size, 10_000);
        assert_eq!(header.parcel_count, 3);
        assert!(parcels[1..].iter().all(|p| p.header.is_none()));

        let joined: Vec<u8> = parcels
            .iter()
            .flat_map(|p| p.payload.iter().copied())
            .collect();
        assert_eq!(joined, payload.to_vec());
    }

    #[test]
    fn test_splitter_empty_payload_yields_single_parcel() {
        let mut splitter = PayloadSplitter::new(
            Channel::Object,
            Priority::Normal,
            1,
            1,
            Bytes::new(),
            1024,
            None,
        )
        .unwrap();
        let only = splitter.next().unwrap();
        assert!(only.payload.is_empty());
        assert_eq!(only.header.unwrap().parcel_count, 1);
        assert!(splitter.next().is_none());
    }
}
