//! The single process-wide sending thread.
//!
//! Every connection hands its parcels to one `CoreSend` through an
//! [`Outlet`]. Parcels from all connections share one priority queue
//! ordered by class (signals, data, closing signal), then priority, object
//! id and sequence. Tempo and pause are enforced per outlet by holding
//! that outlet's items back; other connections keep flowing.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parcelnet_frame::{
    Channel, FrameError, ParcelConfig, ParcelWriter, Priority, SignalType, TransmissionParcel,
};

use crate::error::ConnError;
use crate::params::Tempo;
use crate::send_load::SendLoad;

pub(crate) type ParcelSink = Box<dyn Write + Send>;
pub(crate) type FailureHook = Box<dyn Fn(ConnError) + Send + Sync>;
pub(crate) type MarkerAction = Box<dyn FnOnce() + Send>;

/// Dispatch class, in sending order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum SendClass {
    /// Signals other than CLOSE; never gated or paced.
    Urgent,
    /// OBJECT and FILE parcels and BLIND markers.
    Data,
    /// The CLOSE signal; waits until the outlet has no data queued.
    Final,
}

impl SendClass {
    pub(crate) fn of(parcel: &TransmissionParcel) -> Self {
        match parcel.channel {
            Channel::Signal if parcel.sequence == SignalType::Close.code() => Self::Final,
            Channel::Signal => Self::Urgent,
            _ => Self::Data,
        }
    }
}

#[derive(Debug)]
struct Pace {
    tempo: Tempo,
    not_before: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Ready,
    /// Retry at the given instant, or when woken.
    Hold(Option<Instant>),
}

/// A connection's end of `CoreSend`: its socket writer plus the state
/// `CoreSend` updates on the connection's behalf.
pub(crate) struct Outlet {
    conn: String,
    writer: Mutex<ParcelWriter<ParcelSink>>,
    load: Arc<SendLoad>,
    exchanged: Arc<AtomicU64>,
    pace: Mutex<Pace>,
    queued_data: AtomicUsize,
    closed: AtomicBool,
    on_failure: FailureHook,
}

impl Outlet {
    pub(crate) fn new(
        conn: String,
        sink: ParcelSink,
        config: ParcelConfig,
        load: Arc<SendLoad>,
        exchanged: Arc<AtomicU64>,
        tempo: Tempo,
        on_failure: FailureHook,
    ) -> Self {
        load.set_paused(tempo.is_paused());
        Self {
            conn,
            writer: Mutex::new(ParcelWriter::with_config(sink, config)),
            load,
            exchanged,
            pace: Mutex::new(Pace {
                tempo,
                not_before: None,
            }),
            queued_data: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            on_failure,
        }
    }

    pub(crate) fn tempo(&self) -> Tempo {
        self.pace.lock().unwrap_or_else(PoisonError::into_inner).tempo
    }

    /// Apply a new tempo. The caller wakes `CoreSend` afterwards.
    pub(crate) fn set_tempo(&self, tempo: Tempo) {
        {
            let mut pace = self.pace.lock().unwrap_or_else(PoisonError::into_inner);
            pace.tempo = tempo;
            if !matches!(tempo, Tempo::Limited(_)) {
                pace.not_before = None;
            }
        }
        self.load.set_paused(tempo.is_paused());
    }

    pub(crate) fn load(&self) -> &SendLoad {
        &self.load
    }

    /// Stop accepting parcels; queued ones are dropped.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Data parcels and markers currently queued in `CoreSend`.
    pub(crate) fn queued_data(&self) -> usize {
        self.queued_data.load(Ordering::SeqCst)
    }

    fn readiness(&self, class: SendClass, now: Instant) -> Readiness {
        match class {
            SendClass::Urgent => Readiness::Ready,
            SendClass::Final if self.queued_data() > 0 => Readiness::Hold(None),
            SendClass::Final => Readiness::Ready,
            SendClass::Data => {
                let pace = self.pace.lock().unwrap_or_else(PoisonError::into_inner);
                if pace.tempo.is_paused() {
                    return Readiness::Hold(None);
                }
                match pace.not_before {
                    Some(at) if at > now => Readiness::Hold(Some(at)),
                    _ => Readiness::Ready,
                }
            }
        }
    }

    fn write(&self, parcel: &TransmissionParcel) -> Result<usize, FrameError> {
        let written = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .write_parcel(parcel)?;
        self.exchanged.fetch_add(written as u64, Ordering::Relaxed);

        let mut pace = self.pace.lock().unwrap_or_else(PoisonError::into_inner);
        let spacing = pace.tempo.spacing(written);
        pace.not_before = (!spacing.is_zero()).then(|| Instant::now() + spacing);
        Ok(written)
    }

    fn fail(&self, err: FrameError) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::warn!(conn = %self.conn, error = %err, "parcel write failed");
            (self.on_failure)(ConnError::Frame(err));
        }
    }
}

enum Cargo {
    Parcel(TransmissionParcel),
    /// Local marker on the BLIND channel, never written.
    Blind(MarkerAction),
}

struct CoreItem {
    class: SendClass,
    priority: Priority,
    object_id: u64,
    sequence: u32,
    serial: u64,
    /// Bytes this item holds in the outlet's send load.
    counted: usize,
    outlet: Arc<Outlet>,
    cargo: Cargo,
}

impl CoreItem {
    fn key(&self) -> (SendClass, Reverse<Priority>, u64, u32, u64) {
        (
            self.class,
            Reverse(self.priority),
            self.object_id,
            self.sequence,
            self.serial,
        )
    }

    /// Give back everything the item holds on its outlet.
    fn discard(self) {
        if self.class == SendClass::Data {
            self.outlet.queued_data.fetch_sub(1, Ordering::SeqCst);
        }
        self.outlet.load.release(self.counted);
    }
}

impl PartialEq for CoreItem {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for CoreItem {}

impl PartialOrd for CoreItem {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for CoreItem {
    // Smallest key is the heap maximum.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.key().cmp(&self.key())
    }
}

#[derive(Default)]
struct CoreState {
    heap: BinaryHeap<CoreItem>,
    serial: u64,
    shutdown: bool,
}

impl CoreState {
    /// Pop the first item whose outlet may send now, dropping items of
    /// closed outlets. Also reports the earliest instant a held item
    /// becomes ready.
    fn take_ready(&mut self, now: Instant) -> (Option<CoreItem>, Option<Instant>) {
        let mut held = Vec::new();
        let mut wake: Option<Instant> = None;
        let mut picked = None;
        while let Some(item) = self.heap.pop() {
            if item.outlet.is_closed() {
                item.discard();
                continue;
            }
            match item.outlet.readiness(item.class, now) {
                Readiness::Ready => {
                    picked = Some(item);
                    break;
                }
                Readiness::Hold(at) => {
                    if let Some(at) = at {
                        wake = Some(wake.map_or(at, |w| w.min(at)));
                    }
                    held.push(item);
                }
            }
        }
        self.heap.extend(held);
        (picked, wake)
    }
}

#[derive(Default)]
struct CoreShared {
    state: Mutex<CoreState>,
    cv: Condvar,
}

/// Handle to the sending thread.
pub(crate) struct CoreSend {
    shared: Arc<CoreShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CoreSend {
    pub(crate) fn start() -> std::io::Result<Self> {
        let shared = Arc::new(CoreShared::default());
        let worker = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("parcelnet-core-send".to_string())
            .spawn(move || run(worker))?;
        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Queue a signal parcel; not counted in the send load.
    pub(crate) fn push_signal(&self, outlet: &Arc<Outlet>, parcel: TransmissionParcel) {
        let class = SendClass::of(&parcel);
        self.push(outlet, class, 0, parcel);
    }

    /// Queue a data parcel. The caller has already added its wire size to
    /// the outlet's send load.
    pub(crate) fn push_data(&self, outlet: &Arc<Outlet>, parcel: TransmissionParcel) {
        let counted = parcel.wire_size();
        self.push(outlet, SendClass::Data, counted, parcel);
    }

    /// Queue a BLIND marker: `action` runs on the sending thread once every
    /// parcel ordered before it has been written. It is never written to
    /// the wire.
    pub(crate) fn push_marker(
        &self,
        outlet: &Arc<Outlet>,
        priority: Priority,
        object_id: u64,
        sequence: u32,
        action: MarkerAction,
    ) {
        self.push_item(
            outlet,
            SendClass::Data,
            priority,
            object_id,
            sequence,
            0,
            Cargo::Blind(action),
        );
    }

    fn push(&self, outlet: &Arc<Outlet>, class: SendClass, counted: usize, parcel: TransmissionParcel) {
        let (priority, object_id, sequence) = (parcel.priority, parcel.object_id, parcel.sequence);
        self.push_item(
            outlet,
            class,
            priority,
            object_id,
            sequence,
            counted,
            Cargo::Parcel(parcel),
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn push_item(
        &self,
        outlet: &Arc<Outlet>,
        class: SendClass,
        priority: Priority,
        object_id: u64,
        sequence: u32,
        counted: usize,
        cargo: Cargo,
    ) {
        if class == SendClass::Data {
            outlet.queued_data.fetch_add(1, Ordering::SeqCst);
        }
        let mut state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
        let serial = state.serial;
        state.serial += 1;
        let item = CoreItem {
            class,
            priority,
            object_id,
            sequence,
            serial,
            counted,
            outlet: Arc::clone(outlet),
            cargo,
        };
        if state.shutdown || outlet.is_closed() {
            drop(state);
            item.discard();
            return;
        }
        state.heap.push(item);
        drop(state);
        self.shared.cv.notify_one();
    }

    /// Re-evaluate held items, e.g. after a tempo change.
    pub(crate) fn wake(&self) {
        self.shared.cv.notify_one();
    }

    /// Items currently queued across all outlets.
    pub(crate) fn queued(&self) -> usize {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .heap
            .len()
    }

    pub(crate) fn shutdown(&self) {
        let leftover: Vec<CoreItem> = {
            let mut state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.shutdown = true;
            state.heap.drain().collect()
        };
        self.shared.cv.notify_all();
        for item in leftover {
            item.discard();
        }

        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for CoreSend {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(shared: Arc<CoreShared>) {
    tracing::debug!("core send thread started");
    let mut state = shared.state.lock().unwrap_or_else(PoisonError::into_inner);
    loop {
        if state.shutdown {
            break;
        }
        let now = Instant::now();
        let (picked, wake) = state.take_ready(now);
        let Some(item) = picked else {
            state = match wake {
                Some(at) => {
                    shared
                        .cv
                        .wait_timeout(state, at.saturating_duration_since(now))
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => shared.cv.wait(state).unwrap_or_else(PoisonError::into_inner),
            };
            continue;
        };

        drop(state);
        dispatch(item);
        state = shared.state.lock().unwrap_or_else(PoisonError::into_inner);
    }
    tracing::debug!("core send thread stopped");
}

fn dispatch(item: CoreItem) {
    let CoreItem {
        class,
        counted,
        outlet,
        cargo,
        ..
    } = item;
    if class == SendClass::Data {
        outlet.queued_data.fetch_sub(1, Ordering::SeqCst);
    }
    match cargo {
        Cargo::Blind(action) => action(),
        Cargo::Parcel(parcel) => {
            let result = outlet.write(&parcel);
            outlet.load.release(counted);
            match result {
                Ok(written) => tracing::trace!(
                    conn = %outlet.conn,
                    channel = %parcel.channel,
                    object_id = parcel.object_id,
                    sequence = parcel.sequence,
                    written,
                    "parcel sent"
                ),
                Err(err) => outlet.fail(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::mpsc;
    use std::time::Duration;

    use bytes::BytesMut;
    use parcelnet_frame::{decode_parcel, Signal, DEFAULT_MAX_PAYLOAD};

    use super::*;

    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct BrokenSink;

    impl Write for BrokenSink {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn outlet_with(sink: ParcelSink, tempo: Tempo, hook: FailureHook) -> Arc<Outlet> {
        Arc::new(Outlet::new(
            "test".into(),
            sink,
            ParcelConfig::default(),
            Arc::new(SendLoad::new(1 << 20)),
            Arc::new(AtomicU64::new(0)),
            tempo,
            hook,
        ))
    }

    fn outlet(sink: SharedSink) -> Arc<Outlet> {
        outlet_with(Box::new(sink), Tempo::Unlimited, Box::new(|_| {}))
    }

    fn data(priority: Priority, object_id: u64, sequence: u32) -> TransmissionParcel {
        TransmissionParcel::new(Channel::File, priority, object_id, sequence, &b"x"[..])
    }

    fn item(outlet: &Arc<Outlet>, serial: u64, parcel: TransmissionParcel) -> CoreItem {
        let class = SendClass::of(&parcel);
        if class == SendClass::Data {
            outlet.queued_data.fetch_add(1, Ordering::SeqCst);
        }
        CoreItem {
            class,
            priority: parcel.priority,
            object_id: parcel.object_id,
            sequence: parcel.sequence,
            serial,
            counted: 0,
            outlet: Arc::clone(outlet),
            cargo: Cargo::Parcel(parcel),
        }
    }

    fn decode_all(sink: &SharedSink) -> Vec<TransmissionParcel> {
        let mut wire = BytesMut::from(sink.0.lock().unwrap().as_slice());
        let mut out = Vec::new();
        while let Some(parcel) = decode_parcel(&mut wire, DEFAULT_MAX_PAYLOAD).unwrap() {
            out.push(parcel);
        }
        out
    }

    #[test]
    fn ordering_by_class_priority_id_and_sequence() {
        let out = outlet(SharedSink::default());
        let mut state = CoreState::default();
        state.heap.push(item(&out, 0, Signal::close(0, None).to_parcel()));
        state.heap.push(item(&out, 1, data(Priority::Low, 1, 0)));
        state.heap.push(item(&out, 2, data(Priority::High, 9, 1)));
        state.heap.push(item(&out, 3, data(Priority::High, 9, 0)));
        state.heap.push(item(&out, 4, data(Priority::High, 3, 0)));
        state.heap.push(item(&out, 5, Signal::alive().to_parcel()));

        let mut order = Vec::new();
        let now = Instant::now();
        while let (Some(next), _) = state.take_ready(now) {
            if next.class == SendClass::Data {
                out.queued_data.fetch_sub(1, Ordering::SeqCst);
            }
            order.push((next.class, next.object_id, next.sequence));
        }
        assert_eq!(
            order,
            vec![
                (SendClass::Urgent, 0, SignalType::Alive.code()),
                (SendClass::Data, 3, 0),
                (SendClass::Data, 9, 0),
                (SendClass::Data, 9, 1),
                (SendClass::Data, 1, 0),
                (SendClass::Final, 0, SignalType::Close.code()),
            ]
        );
    }

    #[test]
    fn close_waits_for_queued_data() {
        let out = outlet_with(
            Box::new(SharedSink::default()),
            Tempo::Paused,
            Box::new(|_| {}),
        );
        let mut state = CoreState::default();
        state.heap.push(item(&out, 0, data(Priority::Normal, 1, 0)));
        state.heap.push(item(&out, 1, Signal::close(0, None).to_parcel()));
        state.heap.push(item(&out, 2, Signal::ping(4).to_parcel()));

        let (first, _) = state.take_ready(Instant::now());
        assert_eq!(first.unwrap().class, SendClass::Urgent);
        let (none, wake) = state.take_ready(Instant::now());
        assert!(none.is_none());
        assert!(wake.is_none());
        assert_eq!(state.heap.len(), 2);
    }

    #[test]
    fn paced_outlet_does_not_block_others() {
        let slow = outlet_with(
            Box::new(SharedSink::default()),
            Tempo::Limited(1000),
            Box::new(|_| {}),
        );
        slow.pace.lock().unwrap().not_before = Some(Instant::now() + Duration::from_secs(5));
        let fast = outlet(SharedSink::default());

        let mut state = CoreState::default();
        state.heap.push(item(&slow, 0, data(Priority::Top, 1, 0)));
        state.heap.push(item(&fast, 1, data(Priority::Bottom, 2, 0)));

        let (picked, wake) = state.take_ready(Instant::now());
        assert_eq!(picked.unwrap().object_id, 2);
        assert!(wake.is_some());
    }

    #[test]
    fn writes_parcels_and_releases_load() {
        let core = CoreSend::start().unwrap();
        let sink = SharedSink::default();
        let out = outlet(sink.clone());

        for seq in 0..3 {
            let parcel = data(Priority::Normal, 7, seq);
            out.load().add(parcel.wire_size());
            core.push_data(&out, parcel);
        }
        core.push_signal(&out, Signal::echo(5).to_parcel());

        let (tx, rx) = mpsc::channel();
        core.push_marker(
            &out,
            Priority::Normal,
            7,
            3,
            Box::new(move || {
                let _ = tx.send(());
            }),
        );
        rx.recv_timeout(Duration::from_secs(2)).unwrap();

        let parcels = decode_all(&sink);
        assert_eq!(parcels.len(), 4);
        let file: Vec<u32> = parcels
            .iter()
            .filter(|p| p.channel == Channel::File)
            .map(|p| p.sequence)
            .collect();
        assert_eq!(file, vec![0, 1, 2]);
        assert_eq!(out.load().current(), 0);
        assert_eq!(out.queued_data(), 0);
        assert!(out.exchanged.load(Ordering::Relaxed) > 0);
        core.shutdown();
    }

    #[test]
    fn tempo_spaces_writes() {
        let core = CoreSend::start().unwrap();
        let out = outlet_with(
            Box::new(SharedSink::default()),
            Tempo::Limited(10_000),
            Box::new(|_| {}),
        );
        let payload = vec![0u8; 1000 - parcelnet_frame::HEADER_SIZE];
        let started = Instant::now();
        for seq in 0..3 {
            let parcel =
                TransmissionParcel::new(Channel::File, Priority::Normal, 1, seq, payload.clone());
            out.load().add(parcel.wire_size());
            core.push_data(&out, parcel);
        }
        let (tx, rx) = mpsc::channel();
        core.push_marker(&out, Priority::Normal, 1, 3, Box::new(move || {
            let _ = tx.send(Instant::now());
        }));
        let done = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        // 1000 bytes at 10 kB/s is 100 ms per write.
        assert!(done.duration_since(started) >= Duration::from_millis(300));
        core.shutdown();
    }

    #[test]
    fn write_failure_closes_only_that_outlet() {
        let core = CoreSend::start().unwrap();
        let (tx, rx) = mpsc::channel();
        let broken = outlet_with(
            Box::new(BrokenSink),
            Tempo::Unlimited,
            Box::new(move |err| {
                let _ = tx.send(err.code());
            }),
        );
        let sink = SharedSink::default();
        let healthy = outlet(sink.clone());

        core.push_signal(&broken, Signal::alive().to_parcel());
        core.push_signal(&broken, Signal::alive().to_parcel());
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 11);
        assert!(broken.is_closed());

        let (done_tx, done_rx) = mpsc::channel();
        core.push_signal(&healthy, Signal::alive().to_parcel());
        core.push_marker(&healthy, Priority::Normal, 0, 0, Box::new(move || {
            let _ = done_tx.send(());
        }));
        done_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(decode_all(&sink).len(), 1);
        assert!(rx.try_recv().is_err());
        core.shutdown();
    }

    #[test]
    fn closed_outlet_items_are_discarded() {
        let core = CoreSend::start().unwrap();
        let out = outlet(SharedSink::default());
        out.close();
        let parcel = data(Priority::Normal, 1, 0);
        out.load().add(parcel.wire_size());
        core.push_data(&out, parcel);
        assert_eq!(out.load().current(), 0);
        assert_eq!(out.queued_data(), 0);
        core.shutdown();
    }
}
