use std::collections::HashMap;

use parcelnet_frame::{ObjectHeader, TransmissionParcel};

use crate::error::ConnError;

/// Initial buffer reservation cap, so a forged header cannot force a huge allocation.
const MAX_PREALLOC: usize = 1024 * 1024;

/// Outcome of feeding one OBJECT parcel.
#[derive(Debug)]
pub(crate) enum Assembly {
    /// More parcels expected.
    Pending,
    /// All parcels arrived; the bytes are the serialized object.
    Complete { object_id: u64, bytes: Vec<u8> },
    /// Continuation of an object with no reassembly record.
    Orphan,
    /// The object was abandoned; the connection carries on.
    Aborted { object_id: u64, error: ConnError },
}

struct Record {
    total: usize,
    count: u32,
    next: u32,
    buf: Vec<u8>,
}

/// Reassembly of multi-parcel objects, owned by the receive thread.
pub(crate) struct ObjectAgglomeration {
    conn: String,
    method: u8,
    max_size: usize,
    records: HashMap<u64, Record>,
}

impl ObjectAgglomeration {
    /// Objects declaring more than `max_size` bytes are refused.
    pub(crate) fn new(conn: String, method: u8, max_size: usize) -> Self {
        Self {
            conn,
            method,
            max_size,
            records: HashMap::new(),
        }
    }

    /// Feed one parcel. `Err` is connection fatal.
    pub(crate) fn accept(&mut self, parcel: TransmissionParcel) -> Result<Assembly, ConnError> {
        let object_id = parcel.object_id;
        if parcel.sequence == 0 {
            return self.start(parcel);
        }

        let Some(record) = self.records.get_mut(&object_id) else {
            return Ok(Assembly::Orphan);
        };
        if parcel.sequence != record.next {
            let expected = record.next;
            self.records.remove(&object_id);
            return Ok(Assembly::Aborted {
                object_id,
                error: ConnError::OutOfSequence {
                    object_id,
                    expected,
                    got: parcel.sequence,
                },
            });
        }
        if record.buf.len() + parcel.payload.len() > record.total {
            let total = record.total;
            self.records.remove(&object_id);
            return Ok(Assembly::Aborted {
                object_id,
                error: ConnError::Protocol(format!(
                    "object {object_id} exceeds its declared size of {total} bytes"
                )),
            });
        }
        record.buf.extend_from_slice(&parcel.payload);
        record.next += 1;
        if record.next < record.count {
            return Ok(Assembly::Pending);
        }

        match self.records.remove(&object_id) {
            Some(record) => Ok(finish(object_id, record)),
            None => Ok(Assembly::Pending),
        }
    }

    fn start(&mut self, parcel: TransmissionParcel) -> Result<Assembly, ConnError> {
        let object_id = parcel.object_id;
        let Some(ObjectHeader {
            method,
            total_size,
            parcel_count,
            ..
        }) = parcel.header
        else {
            return Err(ConnError::Protocol(format!(
                "object {object_id} started without a header"
            )));
        };
        if method != self.method {
            return Err(ConnError::CodecMismatch {
                local: self.method,
                remote: method,
            });
        }

        let total = total_size as usize;
        if total > self.max_size {
            return Err(ConnError::SerializationOverflow {
                size: total,
                max: self.max_size,
            });
        }

        // Parcel 0 again: the partial copy is lost, the new one starts over.
        if let Some(stale) = self.records.remove(&object_id) {
            tracing::warn!(
                conn = %self.conn,
                object_id,
                expected = stale.next,
                got = 0,
                received = stale.buf.len(),
                "object restarted, partial reassembly discarded"
            );
        }

        if parcel.payload.len() > total || parcel_count == 0 {
            return Ok(Assembly::Aborted {
                object_id,
                error: ConnError::Protocol(format!(
                    "object {object_id} header inconsistent with its first parcel"
                )),
            });
        }
        let mut buf = Vec::with_capacity(total.min(MAX_PREALLOC));
        buf.extend_from_slice(&parcel.payload);
        let record = Record {
            total,
            count: parcel_count,
            next: 1,
            buf,
        };

        if parcel_count == 1 {
            return Ok(finish(object_id, record));
        }
        self.records.insert(object_id, record);
        Ok(Assembly::Pending)
    }

    /// Objects currently being reassembled.
    pub(crate) fn in_progress(&self) -> usize {
        self.records.len()
    }

    pub(crate) fn clear(&mut self) {
        self.records.clear();
    }
}

fn finish(object_id: u64, record: Record) -> Assembly {
    if record.buf.len() != record.total {
        return Assembly::Aborted {
            object_id,
            error: ConnError::Protocol(format!(
                "object {object_id} reassembled to {} bytes, header declared {}",
                record.buf.len(),
                record.total
            )),
        };
    }
    Assembly::Complete {
        object_id,
        bytes: record.buf,
    }
}

#[cfg(test)]
mod tests {
    use parcelnet_frame::{Channel, PayloadSplitter, Priority};

    use super::*;

    const METHOD: u8 = 1;
    const LIMIT: usize = 1 << 20;

    fn split(object_id: u64, payload: &[u8], parcel_size: usize) -> Vec<TransmissionParcel> {
        PayloadSplitter::new(
            Channel::Object,
            Priority::Normal,
            object_id,
            METHOD,
            bytes::Bytes::copy_from_slice(payload),
            parcel_size,
            None,
        )
        .unwrap()
        .collect()
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn reassembles_across_parcel_counts() {
        for len in [0usize, 1, 1023, 1024, 1025, 5000] {
            let data = payload(len);
            let mut agg = ObjectAgglomeration::new("test".to_string(), METHOD, LIMIT);
            let parcels = split(4, &data, 1024);
            let last = parcels.len() - 1;
            for (i, parcel) in parcels.into_iter().enumerate() {
                match agg.accept(parcel).unwrap() {
                    Assembly::Pending => assert!(i < last),
                    Assembly::Complete { object_id, bytes } => {
                        assert_eq!(i, last);
                        assert_eq!(object_id, 4);
                        assert_eq!(bytes, data);
                    }
                    other => panic!("unexpected {other:?}"),
                }
            }
            assert_eq!(agg.in_progress(), 0);
        }
    }

    #[test]
    fn interleaved_objects() {
        let a = payload(3000);
        let b = payload(2500);
        let mut pa = split(1, &a, 1024).into_iter();
        let mut pb = split(2, &b, 1024).into_iter();
        let mut agg = ObjectAgglomeration::new("test".to_string(), METHOD, LIMIT);
        let mut done = Vec::new();
        loop {
            let (na, nb) = (pa.next(), pb.next());
            if na.is_none() && nb.is_none() {
                break;
            }
            for parcel in na.into_iter().chain(nb) {
                if let Assembly::Complete { object_id, bytes } = agg.accept(parcel).unwrap() {
                    done.push((object_id, bytes.len()));
                }
            }
        }
        done.sort();
        assert_eq!(done, vec![(1, 3000), (2, 2500)]);
    }

    #[test]
    fn gap_aborts_only_that_object() {
        let mut agg = ObjectAgglomeration::new("test".to_string(), METHOD, LIMIT);
        let broken = split(1, &payload(4000), 1024);
        let intact = split(2, &payload(10), 1024);

        assert!(matches!(agg.accept(broken[0].clone()).unwrap(), Assembly::Pending));
        match agg.accept(broken[2].clone()).unwrap() {
            Assembly::Aborted {
                object_id,
                error: ConnError::OutOfSequence { expected, got, .. },
            } => {
                assert_eq!(object_id, 1);
                assert_eq!((expected, got), (1, 2));
            }
            other => panic!("unexpected {other:?}"),
        }
        // The rest of the aborted object is orphaned.
        assert!(matches!(agg.accept(broken[3].clone()).unwrap(), Assembly::Orphan));
        assert!(matches!(
            agg.accept(intact[0].clone()).unwrap(),
            Assembly::Complete { object_id: 2, .. }
        ));
    }

    #[test]
    fn unseen_continuation_is_orphan() {
        let mut agg = ObjectAgglomeration::new("test".to_string(), METHOD, LIMIT);
        let parcels = split(8, &payload(3000), 1024);
        assert!(matches!(agg.accept(parcels[1].clone()).unwrap(), Assembly::Orphan));
        assert_eq!(agg.in_progress(), 0);
    }

    #[test]
    fn method_mismatch_is_fatal() {
        let mut agg = ObjectAgglomeration::new("test".to_string(), 2, LIMIT);
        let parcels = split(1, b"abc", 1024);
        assert!(matches!(
            agg.accept(parcels[0].clone()),
            Err(ConnError::CodecMismatch { local: 2, remote: METHOD })
        ));
    }

    #[test]
    fn restarted_object_replaces_stale_record() {
        let mut agg = ObjectAgglomeration::new("test".to_string(), METHOD, LIMIT);
        let data = payload(3000);
        let parcels = split(3, &data, 1024);
        assert!(matches!(agg.accept(parcels[0].clone()).unwrap(), Assembly::Pending));
        assert!(matches!(agg.accept(parcels[1].clone()).unwrap(), Assembly::Pending));

        // The peer starts object 3 over; the new copy must be assembled.
        let mut outcome = None;
        for parcel in parcels {
            outcome = Some(agg.accept(parcel).unwrap());
        }
        match outcome {
            Some(Assembly::Complete { object_id, bytes }) => {
                assert_eq!(object_id, 3);
                assert_eq!(bytes, data);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(agg.in_progress(), 0);
    }

    #[test]
    fn declared_size_above_limit_is_fatal() {
        let mut agg = ObjectAgglomeration::new("test".to_string(), METHOD, 2048);
        let parcels = split(5, &payload(3000), 1024);
        assert!(matches!(
            agg.accept(parcels[0].clone()),
            Err(ConnError::SerializationOverflow { size: 3000, max: 2048 })
        ));
        assert_eq!(agg.in_progress(), 0);

        let fits = split(6, &payload(2048), 1024);
        assert!(matches!(agg.accept(fits[0].clone()).unwrap(), Assembly::Pending));
    }
}
