//! Per-connection sender thread.
//!
//! Pops the highest-ranked pending send, produces its next parcel and
//! hands it to [`CoreSend`](crate::core_send::CoreSend). Entries with
//! parcels left go back into the queue, so a higher-priority send that
//! arrives mid-object overtakes it at the next parcel boundary.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Instant, SystemTime};

use bytes::Bytes;
use parcelnet_frame::{Channel, PayloadSplitter, Priority, Signal, TransmissionParcel};

use crate::codec::{Object, ObjectCodec};
use crate::connection::Inner;
use crate::error::{ConnError, Result};
use crate::event::{PingEcho, TransmissionEvent, TransmissionEventKind};
use crate::transfer::{FileSend, BREAK_IO};

/// What a pending-send entry carries.
pub(crate) enum Body {
    Object(ObjectSend),
    File(FileSend),
    Close { code: i32, message: Option<String> },
}

/// An object waiting to be sent. Serialization happens when its first
/// parcel is due.
pub(crate) struct ObjectSend {
    object: Option<Object>,
    parcels: Option<PayloadSplitter>,
}

impl ObjectSend {
    pub(crate) fn new(object: Object) -> Self {
        Self {
            object: Some(object),
            parcels: None,
        }
    }

    fn next_parcel(
        &mut self,
        object_id: u64,
        priority: Priority,
        codec: &dyn ObjectCodec,
        parcel_size: usize,
        max_size: usize,
    ) -> Result<Option<TransmissionParcel>> {
        if self.parcels.is_none() {
            let Some(object) = self.object.take() else {
                return Ok(None);
            };
            let bytes = codec.serialize(&*object)?;
            if bytes.len() > max_size {
                return Err(ConnError::SerializationOverflow {
                    size: bytes.len(),
                    max: max_size,
                });
            }
            self.parcels = Some(PayloadSplitter::new(
                Channel::Object,
                priority,
                object_id,
                codec.method_id(),
                Bytes::from(bytes),
                parcel_size,
                None,
            )?);
        }
        Ok(self.parcels.as_mut().and_then(Iterator::next))
    }

    fn is_done(&self) -> bool {
        self.object.is_none() && self.parcels.as_ref().is_none_or(|p| p.remaining() == 0)
    }
}

/// Send times of pings still waiting for their ECHO. Pings bypass the
/// send queue, so they are recorded when handed to `CoreSend`.
#[derive(Default)]
pub(crate) struct PingRegistry {
    sent: Mutex<HashMap<u64, (Instant, SystemTime)>>,
}

impl PingRegistry {
    pub(crate) fn dispatched(&self, ping_id: u64) {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(ping_id, (Instant::now(), SystemTime::now()));
    }

    /// Resolve an ECHO; `None` for ids never sent or already answered.
    pub(crate) fn echoed(&self, ping_id: u64) -> Option<PingEcho> {
        let (at, sent_at) = self
            .sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&ping_id)?;
        Some(PingEcho {
            ping_id,
            sent_at,
            duration: at.elapsed(),
        })
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Body of the sender thread.
pub(crate) fn run(inner: Arc<Inner>) {
    let Some(outlet) = inner.outlet() else {
        return;
    };
    let conn = inner.short_id.as_str();
    tracing::debug!(conn, "sender started");

    while let Some(mut entry) = inner.queue.pop() {
        match &mut entry.body {
            Body::Close { code, message } => {
                tracing::debug!(conn, code = *code, "sending CLOSE");
                inner
                    .core
                    .push_signal(&outlet, Signal::close(*code, message.take()).to_parcel());
                inner.queue.close();
                break;
            }
            Body::Object(send) => {
                if !outlet.load().wait_open() {
                    break;
                }
                let produced = send.next_parcel(
                    entry.object_id,
                    entry.priority,
                    inner.codec.as_ref(),
                    inner.params.parcel_size,
                    inner.params.max_serialization_size,
                );
                match produced {
                    Ok(Some(parcel)) => {
                        outlet.load().add(parcel.wire_size());
                        inner.core.push_data(&outlet, parcel);
                    }
                    Ok(None) => {}
                    Err(err) if err.is_fatal() => {
                        inner.fail(err);
                        break;
                    }
                    Err(err) => {
                        tracing::warn!(conn, object_id = entry.object_id, error = %err, "object dropped");
                        continue;
                    }
                }
                if !send.is_done() {
                    inner.queue.requeue(entry);
                }
            }
            Body::File(send) => {
                if !outlet.load().wait_open() {
                    break;
                }
                // A break may land while the gate is closed.
                if send.is_cancelled() {
                    continue;
                }
                if !send_file_parcel(&inner, &outlet, entry.priority, send) {
                    continue;
                }
                if !send.is_done() {
                    inner.queue.requeue(entry);
                }
            }
        }
    }
    tracing::debug!(conn, "sender stopped");
}

/// Push the next file parcel, or the confirm marker after the last one.
/// `false` when the transfer was abandoned.
fn send_file_parcel(
    inner: &Arc<Inner>,
    outlet: &Arc<crate::core_send::Outlet>,
    priority: Priority,
    send: &mut FileSend,
) -> bool {
    let file_id = send.object_id();
    match send.next_parcel() {
        Ok(parcel) => {
            outlet.load().add(parcel.wire_size());
            inner.core.push_data(outlet, parcel);
        }
        Err(err) => {
            tracing::warn!(conn = %inner.short_id, file_id, error = %err, "reading outgoing file failed");
            if let Some(record) = inner.transfers.take(file_id) {
                inner.send_signal(Signal::break_transfer(
                    file_id,
                    BREAK_IO,
                    true,
                    Some(err.to_string()),
                ));
                inner.emit(aborted_outgoing(&record, file_id, ConnError::Io(err)));
            }
            return false;
        }
    }

    if send.is_done() {
        let weak = Arc::downgrade(inner);
        inner.core.push_marker(
            outlet,
            priority,
            file_id,
            send.parcel_count(),
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.await_confirmation(file_id);
                }
            }),
        );
    }
    true
}

/// Event for an outgoing file that never reached its end.
pub(crate) fn aborted_outgoing(
    record: &crate::transfer::OutgoingRecord,
    file_id: u64,
    err: ConnError,
) -> TransmissionEvent {
    TransmissionEvent {
        error: Some(Arc::new(err)),
        ..record.event(TransmissionEventKind::FileAborted, file_id)
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Object(_) => f.write_str("Object"),
            Self::File(send) => write!(f, "File({})", send.object_id()),
            Self::Close { code, .. } => write!(f, "Close({code})"),
        }
    }
}
