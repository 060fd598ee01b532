//! Connection lifecycle and public API.
//!
//! A started connection runs four threads of its own (sender, receiver,
//! delivery, timer) plus one worker per incoming file, and shares the
//! engine's `CoreSend` for writing. Every fatal error funnels into
//! `Inner::fail`, which records the close reason and shuts the socket
//! down; the receiver thread notices and runs the teardown.

use std::any::{type_name, Any, TypeId};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parcelnet_frame::{ParcelConfig, ParcelReader, Priority, Signal, SignalType};
use parcelnet_transport::NetStream;
use uuid::Uuid;

use crate::codec::{JsonCodec, ObjectCodec};
use crate::core_send::{CoreSend, FailureHook, Outlet};
use crate::delivery::{self, Delivery, DeliveryQueue};
use crate::engine::{Engine, EngineShared};
use crate::error::{CloseReason, ConnError, Result};
use crate::event::{ConnectionListener, Direction, ListenerSet, TransmissionEvent, TransmissionEventKind};
use crate::file_agglom::{FileAgglomeration, FileSettings, FsSpaceProbe, SpaceProbe};
use crate::heartbeat::Heartbeat;
use crate::params::{ConnectionParameters, Tempo};
use crate::receiver;
use crate::send_load::SendLoad;
use crate::send_queue::{Rank, SendQueue};
use crate::sender::{self, aborted_outgoing, Body, ObjectSend, PingRegistry};
use crate::timer::Timer;
use crate::transfer::{FileSend, OutgoingTransfers, TransferContext, BREAK_CONFIRM_TIMEOUT};

/// TEMPO `object_id` marking an acknowledgement rather than a request.
/// Acknowledgements are adopted but never answered.
const TEMPO_ACK: u64 = 1;

/// Lifecycle of a connection. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Connected,
    /// Outgoing side shut; the socket is still draining.
    Closing,
    Closed,
}

/// Configures and creates connections.
pub struct ConnectionBuilder {
    engine: Engine,
    params: ConnectionParameters,
    codec: Box<dyn ObjectCodec>,
    probe: Arc<dyn SpaceProbe>,
    listeners: Vec<Arc<dyn ConnectionListener>>,
}

impl Clone for ConnectionBuilder {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            params: self.params.clone(),
            codec: self.codec.clone_codec(),
            probe: Arc::clone(&self.probe),
            listeners: self.listeners.clone(),
        }
    }
}

impl ConnectionBuilder {
    pub fn new(engine: &Engine) -> Self {
        Self {
            engine: engine.clone(),
            params: ConnectionParameters::default(),
            codec: Box::new(JsonCodec::new()),
            probe: Arc::new(FsSpaceProbe),
            listeners: Vec::new(),
        }
    }

    pub fn with_parameters(mut self, params: ConnectionParameters) -> Self {
        self.params = params;
        self
    }

    /// Codec template; every connection gets its own copy.
    pub fn with_codec(mut self, codec: impl ObjectCodec + 'static) -> Self {
        self.codec = Box::new(codec);
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn ConnectionListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Override how free space is measured for incoming files.
    pub fn with_space_probe(mut self, probe: Arc<dyn SpaceProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn parameters(&self) -> &ConnectionParameters {
        &self.params
    }

    pub(crate) fn parameters_mut(&mut self) -> &mut ConnectionParameters {
        &mut self.params
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Create an unconnected connection.
    pub fn build(&self) -> Result<Connection> {
        self.params.validate()?;
        if self.engine.is_shut_down() {
            return Err(ConnError::Closed);
        }
        let inner = Inner::new(
            &self.engine,
            self.params.clone(),
            self.codec.clone_codec(),
            Arc::clone(&self.probe),
        );
        for listener in &self.listeners {
            inner.listeners.add(Arc::clone(listener));
        }
        Ok(Connection { inner })
    }
}

/// One peer-to-peer connection over one TCP socket.
///
/// Handles are cheap to clone and all refer to the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// First four bytes of the id in hex, used in logs.
    pub fn short_id(&self) -> &str {
        &self.inner.short_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.lock_state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Outgoing side shut: nothing more will be sent.
    pub fn is_outgoing_closed(&self) -> bool {
        self.inner.outgoing_closed.load(Ordering::SeqCst)
    }

    pub fn parameters(&self) -> &ConnectionParameters {
        &self.inner.params
    }

    pub fn codec(&self) -> &dyn ObjectCodec {
        self.inner.codec.as_ref()
    }

    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.inner.listeners.add(listener);
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.wire.get().and_then(|w| w.stream.peer_addr().ok())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.wire.get().and_then(|w| w.stream.local_addr().ok())
    }

    /// Bytes read and written so far, parcel headers included.
    pub fn exchanged(&self) -> u64 {
        self.inner.exchanged.load(Ordering::Relaxed)
    }

    /// Bytes handed to the sending thread but not yet written.
    pub fn send_load(&self) -> u64 {
        self.inner.load.current()
    }

    pub fn queued_sends(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn outgoing_transfers(&self) -> usize {
        self.inner.transfers.len()
    }

    pub fn incoming_transfers(&self) -> usize {
        self.inner.incoming().in_progress()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.close_reason()
    }

    /// Take ownership of a connected socket and start all pipelines.
    pub fn start(&self, stream: NetStream) -> Result<()> {
        let inner = &self.inner;
        match *inner.lock_state() {
            ConnectionState::Unconnected => {}
            ConnectionState::Closed => return Err(ConnError::Closed),
            _ => {
                return Err(ConnError::InvalidParameter(
                    "connection already started".to_string(),
                ))
            }
        }

        stream.set_read_timeout(None)?;
        stream.set_write_timeout(None)?;
        let reader = ParcelReader::new(stream.try_clone()?);
        let sink = stream.try_clone()?;
        let weak = Arc::downgrade(inner);
        let on_failure: FailureHook = Box::new(move |err| {
            if let Some(inner) = weak.upgrade() {
                inner.fail(err);
            }
        });
        let tempo = *inner.initial_tempo.lock().unwrap_or_else(PoisonError::into_inner);
        let outlet = Arc::new(Outlet::new(
            inner.short_id.clone(),
            Box::new(sink),
            ParcelConfig::default(),
            Arc::clone(&inner.load),
            Arc::clone(&inner.exchanged),
            tempo,
            on_failure,
        ));
        let timer = Timer::start(format!("parcelnet-timer-{}", inner.short_id))?;
        let peer = stream.peer_addr().ok();
        if inner.wire.set(Wire { stream, outlet, timer }).is_err() {
            return Err(ConnError::InvalidParameter(
                "connection already started".to_string(),
            ));
        }

        {
            let mut state = inner.lock_state();
            if *state != ConnectionState::Unconnected {
                drop(state);
                inner.finish();
                return Err(ConnError::Closed);
            }
            *state = ConnectionState::Connected;
        }
        inner.deliver(Delivery::Connected);

        if let Err(err) = self.spawn_threads(reader) {
            inner.fail(ConnError::Io(err));
            inner.finish();
            return Err(ConnError::Closed);
        }

        if let Some(wire) = inner.wire.get() {
            let weak = Arc::downgrade(inner);
            inner.heartbeat.start_alive(&wire.timer, &weak);
            inner.heartbeat.start_idle(&wire.timer, &weak);
        }
        if tempo != Tempo::Unlimited || inner.params.tempo_fixed {
            inner.send_signal(Signal::tempo(tempo.to_wire()));
        }
        if let Some(engine) = inner.engine.upgrade() {
            engine.register(self.clone());
        }
        tracing::info!(
            conn = %inner.short_id,
            peer = ?peer,
            alive_period = ?inner.heartbeat.period(),
            "connection started"
        );
        Ok(())
    }

    fn spawn_threads(&self, reader: ParcelReader<NetStream>) -> std::io::Result<()> {
        let inner = &self.inner;
        let short = inner.short_id.as_str();

        let worker = Arc::clone(inner);
        let handle = thread::Builder::new()
            .name(format!("parcelnet-deliver-{short}"))
            .spawn(move || delivery::run(&worker.delivery, &worker.listeners, &worker.short_id))?;
        *inner.delivery_thread.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        let worker = Arc::clone(inner);
        let handle = thread::Builder::new()
            .name(format!("parcelnet-send-{short}"))
            .spawn(move || sender::run(worker))?;
        *inner.sender_thread.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        let worker = Arc::clone(inner);
        thread::Builder::new()
            .name(format!("parcelnet-recv-{short}"))
            .spawn(move || receiver::run(worker, reader))?;
        Ok(())
    }

    /// Queue an object at normal priority. Returns its object id.
    pub fn send<T: Any + Send>(&self, object: T) -> Result<u64> {
        self.send_with_priority(object, Priority::Normal)
    }

    pub fn send_with_priority<T: Any + Send>(&self, object: T, priority: Priority) -> Result<u64> {
        let inner = &self.inner;
        inner.check_sendable()?;
        if !inner.codec.is_registered(TypeId::of::<T>()) {
            return Err(ConnError::UnregisteredType(type_name::<T>()));
        }
        let object_id = inner.next_object_id.fetch_add(1, Ordering::SeqCst);
        inner.queue.push(
            Rank::Regular,
            priority,
            object_id,
            Body::Object(ObjectSend::new(Box::new(object))),
        )?;
        tracing::trace!(conn = %inner.short_id, object_id, ?priority, "object queued");
        Ok(object_id)
    }

    /// Queue a file at normal priority. Returns its file id.
    ///
    /// `remote_path` is where the receiver should place the file, relative
    /// to its root directory; without one the file stays in the receiver's
    /// temp directory.
    pub fn send_file(&self, path: impl AsRef<Path>, remote_path: Option<&str>) -> Result<u64> {
        self.send_file_with_priority(path, remote_path, Priority::Normal)
    }

    pub fn send_file_with_priority(
        &self,
        path: impl AsRef<Path>,
        remote_path: Option<&str>,
        priority: Priority,
    ) -> Result<u64> {
        let inner = &self.inner;
        let path = path.as_ref();
        inner.check_sendable()?;
        let file_id = inner.next_object_id.fetch_add(1, Ordering::SeqCst);
        let remote_path = remote_path.map(str::to_string);
        let (size, progress) = inner.transfers.register(file_id, path, remote_path.clone())?;
        let send = FileSend::new(
            file_id,
            priority,
            path.to_path_buf(),
            remote_path,
            size,
            inner.params.parcel_size,
            progress,
        );
        if let Err(err) = inner.queue.push(Rank::Regular, priority, file_id, Body::File(send)) {
            inner.transfers.take(file_id);
            return Err(err);
        }
        tracing::info!(conn = %inner.short_id, file_id, size, path = %path.display(), "file queued");
        Ok(file_id)
    }

    /// Send a PING ahead of everything queued. Returns the ping id; the
    /// answer arrives as `ping_echo_received`.
    ///
    /// The PING goes straight to the signal class of `CoreSend`, so a
    /// paused tempo or a closed send-load gate never holds it back.
    pub fn send_ping(&self) -> Result<u64> {
        let inner = &self.inner;
        inner.check_sendable()?;
        let outlet = inner.outlet().ok_or(ConnError::NotConnected)?;
        let ping_id = inner.next_ping_id.fetch_add(1, Ordering::SeqCst);
        inner.pings.dispatched(ping_id);
        inner.core.push_signal(&outlet, Signal::ping(ping_id).to_parcel());
        tracing::trace!(conn = %inner.short_id, ping_id, "ping sent");
        Ok(ping_id)
    }

    /// Cancel a transfer in either direction and tell the peer.
    pub fn break_transfer(&self, file_id: u64, direction: Direction, cause: i32) -> Result<()> {
        let inner = &self.inner;
        if cause <= 0 {
            return Err(ConnError::InvalidParameter(format!(
                "break cause must be positive, got {cause}"
            )));
        }
        if inner.finished.load(Ordering::SeqCst) {
            return Err(ConnError::Closed);
        }
        let err = ConnError::TransferBroken { cause, text: None };
        match direction {
            Direction::Incoming => {
                if !inner.incoming().abort(file_id, err) {
                    return Err(ConnError::UnknownTransfer(file_id));
                }
                inner.send_signal(Signal::break_transfer(file_id, cause, false, None));
            }
            Direction::Outgoing => {
                let record = inner
                    .transfers
                    .take(file_id)
                    .ok_or(ConnError::UnknownTransfer(file_id))?;
                inner.send_signal(Signal::break_transfer(file_id, cause, true, None));
                inner.emit(aborted_outgoing(&record, file_id, err));
            }
        }
        tracing::info!(conn = %inner.short_id, file_id, direction = direction.name(), cause, "transfer broken locally");
        Ok(())
    }

    pub fn tempo(&self) -> Tempo {
        match self.inner.outlet() {
            Some(outlet) => outlet.tempo(),
            None => *self.inner.initial_tempo.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Change the transmit speed and announce it to the peer.
    pub fn set_tempo(&self, tempo: Tempo) -> Result<()> {
        let inner = &self.inner;
        if inner.finished.load(Ordering::SeqCst) {
            return Err(ConnError::Closed);
        }
        match inner.outlet() {
            None => {
                *inner.initial_tempo.lock().unwrap_or_else(PoisonError::into_inner) = tempo;
            }
            Some(outlet) => {
                *inner.overruled.lock().unwrap_or_else(PoisonError::into_inner) = None;
                inner.apply_tempo(&outlet, tempo);
                inner.send_signal(Signal::tempo(tempo.to_wire()));
            }
        }
        Ok(())
    }

    pub fn alive_period(&self) -> Duration {
        self.inner.heartbeat.period()
    }

    /// Change the ALIVE period; zero disables the heartbeat.
    pub fn set_alive_period(&self, period: Duration) {
        let inner = &self.inner;
        let timer = inner.wire.get().map(|w| &w.timer);
        inner.heartbeat.set_period(period, timer, &Arc::downgrade(inner));
    }

    pub fn idle_threshold(&self) -> u64 {
        self.inner.heartbeat.idle_threshold()
    }

    /// Bytes per idle check period under which the connection reports idle;
    /// zero disables idle detection.
    pub fn set_idle_threshold(&self, threshold: u64) {
        let inner = &self.inner;
        let timer = inner.wire.get().map(|w| &w.timer);
        inner.heartbeat.set_idle_threshold(threshold, timer, &Arc::downgrade(inner));
    }

    /// Orderly close: queued sends go out, then CLOSE. Idempotent.
    pub fn close(&self) {
        self.close_with(CloseReason::NORMAL, None);
    }

    /// Orderly close with a cause code and message for the peer.
    pub fn close_with(&self, code: i32, message: Option<String>) {
        let inner = &self.inner;
        let mut state = inner.lock_state();
        match *state {
            ConnectionState::Unconnected => {
                drop(state);
                inner.record_reason(CloseReason::local(code, message));
                inner.finish();
            }
            ConnectionState::Connected => {
                *state = ConnectionState::Closing;
                drop(state);
                inner.record_reason(CloseReason::local(code, message.clone()));
                inner.outgoing_closed.store(true, Ordering::SeqCst);
                if inner
                    .queue
                    .push(Rank::Close, Priority::Bottom, 0, Body::Close { code, message })
                    .is_err()
                {
                    inner.shutdown_socket();
                }
                inner.schedule_drain_timeout();
                tracing::info!(conn = %inner.short_id, code, "closing");
            }
            ConnectionState::Closing | ConnectionState::Closed => {}
        }
    }

    /// Drop the socket immediately without sending what is queued.
    pub fn abort(&self) {
        let inner = &self.inner;
        if inner.wire.get().is_none() {
            self.close();
            return;
        }
        inner.record_reason(CloseReason::local(CloseReason::NORMAL, Some("aborted".to_string())));
        inner.close_outgoing();
        inner.shutdown_socket();
    }

    /// Block until the connection is closed. `false` on timeout.
    pub fn wait_closed(&self, timeout: Duration) -> bool {
        let inner = &self.inner;
        let state = inner.lock_state();
        let (state, _) = inner
            .state_cv
            .wait_timeout_while(state, timeout, |s| *s != ConnectionState::Closed)
            .unwrap_or_else(PoisonError::into_inner);
        *state == ConnectionState::Closed
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.short_id)
            .field("state", &self.state())
            .finish()
    }
}

pub(crate) struct Wire {
    pub(crate) stream: NetStream,
    pub(crate) outlet: Arc<Outlet>,
    pub(crate) timer: Timer,
}

/// State shared by a connection's handles and threads.
pub(crate) struct Inner {
    pub(crate) id: Uuid,
    pub(crate) short_id: String,
    pub(crate) params: ConnectionParameters,
    pub(crate) codec: Box<dyn ObjectCodec>,
    pub(crate) listeners: ListenerSet,
    pub(crate) core: Arc<CoreSend>,
    engine: Weak<EngineShared>,
    pub(crate) queue: SendQueue<Body>,
    pub(crate) delivery: DeliveryQueue,
    pub(crate) load: Arc<SendLoad>,
    pub(crate) exchanged: Arc<AtomicU64>,
    pub(crate) transfers: OutgoingTransfers,
    incoming: Mutex<FileAgglomeration>,
    pub(crate) pings: PingRegistry,
    pub(crate) heartbeat: Heartbeat,
    pub(crate) wire: OnceLock<Wire>,
    state: Mutex<ConnectionState>,
    state_cv: Condvar,
    reason: Mutex<Option<CloseReason>>,
    outgoing_closed: AtomicBool,
    finished: AtomicBool,
    next_object_id: AtomicU64,
    next_ping_id: AtomicU64,
    initial_tempo: Mutex<Tempo>,
    /// Last remote tempo overruled while the local tempo is fixed.
    overruled: Mutex<Option<Tempo>>,
    sender_thread: Mutex<Option<JoinHandle<()>>>,
    delivery_thread: Mutex<Option<JoinHandle<()>>>,
}

/// Non-owning handle the file workers use to reach their connection.
struct ConnContext {
    inner: Weak<Inner>,
}

impl TransferContext for ConnContext {
    fn emit(&self, event: TransmissionEvent) {
        if let Some(inner) = self.inner.upgrade() {
            inner.emit(event);
        }
    }

    fn signal(&self, signal: Signal) {
        if let Some(inner) = self.inner.upgrade() {
            inner.send_signal(signal);
        }
    }
}

impl Inner {
    fn new(
        engine: &Engine,
        params: ConnectionParameters,
        codec: Box<dyn ObjectCodec>,
        probe: Arc<dyn SpaceProbe>,
    ) -> Arc<Self> {
        let id = Uuid::new_v4();
        let short_id = id.as_bytes()[..4].iter().map(|b| format!("{b:02x}")).collect::<String>();
        Arc::new_cyclic(|weak: &Weak<Inner>| {
            let settings = FileSettings {
                temp_dir: params.temp_dir.clone(),
                root_dir: params.root_dir.clone(),
                probe,
            };
            let ctx: Arc<dyn TransferContext> = Arc::new(ConnContext {
                inner: weak.clone(),
            });
            Self {
                id,
                short_id: short_id.clone(),
                codec,
                listeners: ListenerSet::default(),
                core: engine.core(),
                engine: engine.downgrade(),
                queue: SendQueue::new(params.object_queue_capacity),
                delivery: DeliveryQueue::new(params.delivery_queue_capacity),
                load: Arc::new(SendLoad::new(params.send_load_threshold())),
                exchanged: Arc::new(AtomicU64::new(0)),
                transfers: OutgoingTransfers::default(),
                incoming: Mutex::new(FileAgglomeration::new(short_id, settings, ctx)),
                pings: PingRegistry::default(),
                heartbeat: Heartbeat::new(
                    params.alive_period,
                    params.confirm_timeout,
                    params.idle_threshold,
                    params.idle_check_period,
                ),
                wire: OnceLock::new(),
                state: Mutex::new(ConnectionState::Unconnected),
                state_cv: Condvar::new(),
                reason: Mutex::new(None),
                outgoing_closed: AtomicBool::new(false),
                finished: AtomicBool::new(false),
                next_object_id: AtomicU64::new(1),
                next_ping_id: AtomicU64::new(1),
                initial_tempo: Mutex::new(params.tempo),
                overruled: Mutex::new(None),
                sender_thread: Mutex::new(None),
                delivery_thread: Mutex::new(None),
                params,
            }
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn incoming(&self) -> MutexGuard<'_, FileAgglomeration> {
        self.incoming.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn outlet(&self) -> Option<Arc<Outlet>> {
        self.wire.get().map(|w| Arc::clone(&w.outlet))
    }

    fn check_sendable(&self) -> Result<()> {
        match *self.lock_state() {
            ConnectionState::Unconnected => Err(ConnError::NotConnected),
            ConnectionState::Connected if !self.outgoing_closed.load(Ordering::SeqCst) => Ok(()),
            _ => Err(ConnError::Closed),
        }
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        matches!(
            *self.lock_state(),
            ConnectionState::Closing | ConnectionState::Closed
        )
    }

    pub(crate) fn close_reason(&self) -> Option<CloseReason> {
        self.reason.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Keep the first reason; `true` if this one was recorded.
    pub(crate) fn record_reason(&self, reason: CloseReason) -> bool {
        let mut slot = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return false;
        }
        *slot = Some(reason);
        true
    }

    fn enter_closing(&self) {
        let mut state = self.lock_state();
        if *state == ConnectionState::Connected {
            *state = ConnectionState::Closing;
        }
    }

    /// Route a connection-fatal error: remember it and take the socket down.
    pub(crate) fn fail(&self, err: ConnError) {
        if self.record_reason(CloseReason::from_error(&err)) {
            tracing::error!(conn = %self.short_id, code = err.code(), error = %err, "connection failed");
        }
        self.enter_closing();
        self.outgoing_closed.store(true, Ordering::SeqCst);
        self.shutdown_socket();
    }

    pub(crate) fn shutdown_socket(&self) {
        if let Some(wire) = self.wire.get() {
            if let Err(err) = wire.stream.shutdown() {
                tracing::debug!(conn = %self.short_id, error = %err, "socket shutdown failed");
            }
        }
    }

    /// Stop sending: discard queued sends, keep receiving.
    pub(crate) fn close_outgoing(&self) {
        self.enter_closing();
        self.outgoing_closed.store(true, Ordering::SeqCst);
        let dropped = self.queue.close();
        if !dropped.is_empty() {
            tracing::debug!(conn = %self.short_id, dropped = dropped.len(), "discarded queued sends");
        }
    }

    fn schedule_drain_timeout(self: &Arc<Self>) {
        let Some(wire) = self.wire.get() else {
            return;
        };
        let weak = Arc::downgrade(self);
        let timeout = self.params.drain_timeout();
        wire.timer.schedule_once(timeout, move || {
            if let Some(inner) = weak.upgrade() {
                tracing::warn!(conn = %inner.short_id, ?timeout, "close did not complete, forcing socket down");
                inner.record_reason(CloseReason::local(CloseReason::DRAIN_TIMEOUT, None));
                inner.shutdown_socket();
            }
        });
    }

    pub(crate) fn send_signal(&self, signal: Signal) {
        if let Some(wire) = self.wire.get() {
            self.core.push_signal(&wire.outlet, signal.to_parcel());
        }
    }

    /// Hand an item to the delivery thread. Items arriving after the
    /// delivery queue closed are dropped.
    pub(crate) fn deliver(&self, item: Delivery) {
        if let Err(item) = self.delivery.push(item) {
            tracing::debug!(conn = %self.short_id, ?item, "delivery queue closed, item dropped");
        }
    }

    /// Queue a transfer event for the listeners, or fire it right away
    /// once the delivery thread is gone.
    pub(crate) fn emit(&self, event: TransmissionEvent) {
        if let Err(item) = self.delivery.push(Delivery::Transmission(event)) {
            delivery::deliver(&self.listeners, &self.short_id, item);
        }
    }

    fn apply_tempo(&self, outlet: &Outlet, tempo: Tempo) {
        outlet.set_tempo(tempo);
        self.core.wake();
        tracing::debug!(conn = %self.short_id, %tempo, "tempo set");
    }

    /// Negotiate a TEMPO from the peer.
    pub(crate) fn remote_tempo(&self, signal: &Signal) {
        let Some(outlet) = self.outlet() else {
            return;
        };
        let requested = Tempo::from_wire(signal.info);
        let current = outlet.tempo();
        if requested == current {
            return;
        }
        if self.params.tempo_fixed {
            let mut overruled = self.overruled.lock().unwrap_or_else(PoisonError::into_inner);
            if *overruled == Some(requested) {
                return;
            }
            *overruled = Some(requested);
            drop(overruled);
            tracing::info!(conn = %self.short_id, %requested, %current, "remote tempo overruled");
            self.send_signal(Signal::tempo(current.to_wire()));
            return;
        }
        tracing::info!(conn = %self.short_id, tempo = %requested, "tempo adopted from peer");
        self.apply_tempo(&outlet, requested);
        if signal.object_id != TEMPO_ACK {
            self.send_signal(Signal::new(
                SignalType::Tempo,
                TEMPO_ACK,
                requested.to_wire(),
                None,
            ));
        }
    }

    /// Start the confirm timeout once the last parcel of a file is written.
    pub(crate) fn await_confirmation(self: &Arc<Self>, file_id: u64) {
        let Some(wire) = self.wire.get() else {
            return;
        };
        let weak = Arc::downgrade(self);
        let timeout = self.params.confirm_timeout;
        let task = wire.timer.schedule_once(timeout, move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if let Some(record) = inner.transfers.take(file_id) {
                tracing::warn!(conn = %inner.short_id, file_id, ?timeout, "file not confirmed in time");
                inner.send_signal(Signal::break_transfer(file_id, BREAK_CONFIRM_TIMEOUT, true, None));
                inner.emit(TransmissionEvent {
                    error: Some(Arc::new(ConnError::ConfirmTimeout(timeout))),
                    ..record.event(TransmissionEventKind::FileFailed, file_id)
                });
            }
        });
        self.transfers.set_confirm_task(file_id, task);
    }

    /// Tear everything down and fire the final events. Runs once.
    pub(crate) fn finish(&self) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        let reason = self.close_reason().unwrap_or_else(CloseReason::normal);
        let was_connected = {
            let mut state = self.lock_state();
            let connected = matches!(
                *state,
                ConnectionState::Connected | ConnectionState::Closing
            );
            if connected {
                *state = ConnectionState::Closing;
            }
            connected
        };
        let conn = self.short_id.as_str();

        self.outgoing_closed.store(true, Ordering::SeqCst);
        self.heartbeat.stop();
        self.shutdown_socket();
        if let Some(wire) = self.wire.get() {
            wire.outlet.close();
            wire.timer.shutdown();
        }
        self.queue.close();
        self.load.close();
        self.delivery.close();

        if was_connected {
            tracing::info!(conn, code = reason.code, remote = reason.remote, "disconnected");
            self.listeners.fire(conn, "disconnected", |l| l.disconnected(&reason));
        }
        for (file_id, record) in self.transfers.drain() {
            self.emit(aborted_outgoing(&record, file_id, ConnError::Closed));
        }
        if let Some(engine) = self.engine.upgrade() {
            engine.deregister(self.id);
        }

        let current = thread::current().id();
        let sender = self.sender_thread.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = sender {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
        let delivery = self.delivery_thread.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = delivery {
            if handle.thread().id() != current && handle.is_finished() {
                let _ = handle.join();
            }
        }

        self.listeners.fire(conn, "closed", |l| l.closed(&reason));
        *self.lock_state() = ConnectionState::Closed;
        self.state_cv.notify_all();
        tracing::debug!(conn, "closed");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[derive(Default)]
    struct Closes {
        disconnected: AtomicUsize,
        closed: AtomicUsize,
        idle: AtomicUsize,
    }

    impl ConnectionListener for Closes {
        fn disconnected(&self, _reason: &CloseReason) {
            self.disconnected.fetch_add(1, Ordering::SeqCst);
        }

        fn closed(&self, _reason: &CloseReason) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }

        fn idle(&self, _idle: bool) {
            self.idle.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn unconnected(listener: Arc<dyn ConnectionListener>) -> (Engine, Connection) {
        let engine = Engine::start().unwrap();
        let conn = ConnectionBuilder::new(&engine)
            .with_listener(listener)
            .build()
            .unwrap();
        (engine, conn)
    }

    #[test]
    fn short_id_is_hex_prefix_of_uuid() {
        let (_engine, conn) = unconnected(Arc::new(Closes::default()));
        assert_eq!(conn.short_id().len(), 8);
        assert!(conn.id().simple().to_string().starts_with(conn.short_id()));
    }

    #[test]
    fn unconnected_rejects_sends() {
        let (_engine, conn) = unconnected(Arc::new(Closes::default()));
        assert_eq!(conn.state(), ConnectionState::Unconnected);
        assert!(matches!(conn.send(1u8), Err(ConnError::NotConnected)));
        assert!(matches!(conn.send_ping(), Err(ConnError::NotConnected)));
    }

    #[test]
    fn closing_unconnected_fires_closed_only() {
        let listener = Arc::new(Closes::default());
        let (_engine, conn) = unconnected(listener.clone());
        conn.close();
        conn.close();
        assert!(conn.wait_closed(Duration::from_secs(1)));
        assert_eq!(listener.closed.load(Ordering::SeqCst), 1);
        assert_eq!(listener.disconnected.load(Ordering::SeqCst), 0);
        assert!(!conn.close_reason().unwrap().is_error());
    }

    #[test]
    fn delivery_after_close_is_dropped() {
        let listener = Arc::new(Closes::default());
        let (_engine, conn) = unconnected(listener.clone());
        conn.close();
        assert!(conn.wait_closed(Duration::from_secs(1)));

        conn.inner.deliver(Delivery::Idle(true));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(listener.idle.load(Ordering::SeqCst), 0);
        assert_eq!(listener.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        let engine = Engine::start().unwrap();
        let params = ConnectionParameters {
            parcel_size: 10,
            ..ConnectionParameters::default()
        };
        assert!(matches!(
            ConnectionBuilder::new(&engine).with_parameters(params).build(),
            Err(ConnError::InvalidParameter(_))
        ));
    }

    #[test]
    fn pre_start_settings_are_kept() {
        let (_engine, conn) = unconnected(Arc::new(Closes::default()));
        conn.set_tempo(Tempo::Limited(4096)).unwrap();
        assert_eq!(conn.tempo(), Tempo::Limited(4096));
        conn.set_alive_period(Duration::from_secs(3));
        assert_eq!(conn.alive_period(), Duration::from_secs(3));
        conn.set_idle_threshold(100);
        assert_eq!(conn.idle_threshold(), 100);
    }

    #[test]
    fn break_requires_positive_cause_and_known_id() {
        let (_engine, conn) = unconnected(Arc::new(Closes::default()));
        assert!(matches!(
            conn.break_transfer(1, Direction::Outgoing, 0),
            Err(ConnError::InvalidParameter(_))
        ));
        assert!(matches!(
            conn.break_transfer(1, Direction::Outgoing, 1),
            Err(ConnError::UnknownTransfer(1))
        ));
        assert!(matches!(
            conn.break_transfer(1, Direction::Incoming, 1),
            Err(ConnError::UnknownTransfer(1))
        ));
    }
}
