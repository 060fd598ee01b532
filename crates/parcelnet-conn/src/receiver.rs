//! Per-connection receive thread.
//!
//! Reads one parcel at a time and dispatches it by channel. Signals are
//! handled inline; objects are reassembled here and handed to the
//! delivery thread; file parcels go to the file workers. The thread also
//! runs the teardown once the socket is down.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use parcelnet_frame::{Channel, FrameError, ParcelReader, Signal, SignalType, TransmissionParcel};
use parcelnet_transport::NetStream;

use crate::connection::Inner;
use crate::delivery::Delivery;
use crate::error::{CloseReason, ConnError};
use crate::event::{TransmissionEvent, TransmissionEventKind};
use crate::object_agglom::{Assembly, ObjectAgglomeration};

/// Why the read loop ended.
enum Ended {
    /// The peer closed the socket, or it was shut down locally.
    Eof,
    /// The peer sent CLOSE.
    RemoteClose,
    Failed(ConnError),
}

pub(crate) fn run(inner: Arc<Inner>, mut reader: ParcelReader<NetStream>) {
    let conn = inner.short_id.clone();
    let mut objects = ObjectAgglomeration::new(
        conn.clone(),
        inner.codec.method_id(),
        inner.params.max_serialization_size,
    );
    tracing::debug!(conn = %conn, "receiver started");

    let ended = loop {
        let parcel = match reader.read_parcel() {
            Ok(parcel) => parcel,
            Err(FrameError::ConnectionClosed) => break Ended::Eof,
            Err(FrameError::Io(err)) if inner.is_shutting_down() => {
                tracing::trace!(conn = %conn, error = %err, "read ended by local shutdown");
                break Ended::Eof;
            }
            Err(err) => break Ended::Failed(err.into()),
        };
        inner
            .exchanged
            .fetch_add(parcel.wire_size() as u64, Ordering::Relaxed);

        let step = match parcel.channel {
            Channel::Signal => match Signal::from_parcel(&parcel) {
                Ok(signal) => on_signal(&inner, signal),
                Err(err) => Err(err.into()),
            },
            Channel::Object => on_object(&inner, &mut objects, parcel),
            Channel::File => inner.incoming().accept(parcel).map(|()| true),
            Channel::Blind => Err(ConnError::Protocol("BLIND parcel on the wire".to_string())),
        };
        match step {
            Ok(true) => {}
            Ok(false) => break Ended::RemoteClose,
            Err(err) => break Ended::Failed(err),
        }
    };

    match ended {
        Ended::Eof => {
            if inner.record_reason(CloseReason::local(CloseReason::CONNECTION_LOST, None)) {
                tracing::info!(conn = %conn, "connection lost");
            }
        }
        Ended::RemoteClose => {}
        Ended::Failed(err) => inner.fail(err),
    }

    if objects.in_progress() > 0 {
        tracing::debug!(conn = %conn, pending = objects.in_progress(), "discarding partial objects");
    }
    objects.clear();
    inner.incoming().shutdown();
    inner.delivery.close();
    if !inner.delivery.wait_finished(inner.params.drain_timeout()) {
        tracing::warn!(conn = %conn, "delivery did not drain in time");
    }
    inner.finish();
    tracing::debug!(conn = %conn, "receiver stopped");
}

/// `Ok(false)` ends the read loop.
fn on_signal(inner: &Arc<Inner>, signal: Signal) -> Result<bool, ConnError> {
    let conn = inner.short_id.as_str();
    tracing::trace!(conn, signal = %signal.kind, object_id = signal.object_id, info = signal.info, "signal");
    match signal.kind {
        SignalType::Alive => inner.send_signal(Signal::alive_echo()),
        SignalType::AliveEcho => inner.heartbeat.echo_received(),
        SignalType::Ping => inner.send_signal(Signal::echo(signal.object_id)),
        SignalType::Echo => match inner.pings.echoed(signal.object_id) {
            Some(echo) => {
                inner.deliver(Delivery::PingEcho(echo));
            }
            None => tracing::debug!(conn, ping_id = signal.object_id, "unexpected ECHO"),
        },
        SignalType::Tempo => inner.remote_tempo(&signal),
        SignalType::Break => on_break(inner, signal),
        SignalType::Confirm => match inner.transfers.take(signal.object_id) {
            Some(record) => {
                tracing::info!(conn, file_id = signal.object_id, bytes = record.size, "file confirmed");
                inner.emit(record.event(TransmissionEventKind::FileConfirmed, signal.object_id));
            }
            None => tracing::debug!(conn, file_id = signal.object_id, "CONFIRM for unknown transfer"),
        },
        SignalType::Fail => match inner.transfers.take(signal.object_id) {
            Some(record) => {
                tracing::warn!(conn, file_id = signal.object_id, info = signal.info, "remote failed to store file");
                inner.emit(TransmissionEvent {
                    info: signal.info,
                    error: Some(Arc::new(ConnError::TransferFailed {
                        info: signal.info,
                        text: signal.text,
                    })),
                    ..record.event(TransmissionEventKind::FileFailed, signal.object_id)
                });
            }
            None => tracing::debug!(conn, file_id = signal.object_id, "FAIL for unknown transfer"),
        },
        SignalType::Close => {
            tracing::info!(conn, cause = signal.info, "remote closed the connection");
            inner.record_reason(CloseReason::remote(signal.info, signal.text));
            inner.close_outgoing();
            return Ok(false);
        }
    }
    Ok(true)
}

fn on_break(inner: &Arc<Inner>, signal: Signal) {
    let conn = inner.short_id.as_str();
    let file_id = signal.object_id;
    let err = ConnError::TransferBroken {
        cause: signal.break_cause(),
        text: signal.text.clone(),
    };
    if signal.issued_by_sender() {
        if !inner.incoming().abort(file_id, err) {
            tracing::debug!(conn, file_id, "BREAK for unknown incoming transfer");
        }
        return;
    }
    match inner.transfers.take(file_id) {
        Some(record) => {
            tracing::warn!(conn, file_id, cause = signal.break_cause(), "remote broke transfer");
            inner.emit(TransmissionEvent {
                error: Some(Arc::new(err)),
                ..record.event(TransmissionEventKind::FileAborted, file_id)
            });
        }
        None => tracing::debug!(conn, file_id, "BREAK for unknown outgoing transfer"),
    }
}

fn on_object(
    inner: &Arc<Inner>,
    objects: &mut ObjectAgglomeration,
    parcel: TransmissionParcel,
) -> Result<bool, ConnError> {
    let conn = inner.short_id.as_str();
    match objects.accept(parcel)? {
        Assembly::Pending => {}
        Assembly::Complete { object_id, bytes } => match inner.codec.deserialize(&bytes) {
            Ok(object) => {
                tracing::trace!(conn, object_id, bytes = bytes.len(), "object received");
                inner.deliver(Delivery::Object { object_id, object });
            }
            Err(err) => {
                tracing::warn!(conn, object_id, error = %err, "received object could not be decoded");
            }
        },
        Assembly::Orphan => {
            tracing::debug!(conn, marker = "orphan", "object parcel without reassembly record dropped");
        }
        Assembly::Aborted { object_id, error } => {
            tracing::warn!(conn, object_id, error = %error, "object reassembly aborted");
        }
    }
    Ok(true)
}
