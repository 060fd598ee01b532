use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

use crate::codec::Object;
use crate::event::{ListenerSet, PingEcho, TransmissionEvent};

/// Something to hand to the listeners.
pub(crate) enum Delivery {
    Connected,
    Object { object_id: u64, object: Object },
    PingEcho(PingEcho),
    Transmission(TransmissionEvent),
    Idle(bool),
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connected => f.write_str("Connected"),
            Self::Object { object_id, .. } => write!(f, "Object({object_id})"),
            Self::PingEcho(echo) => write!(f, "PingEcho({})", echo.ping_id),
            Self::Transmission(event) => write!(f, "{}({})", event.kind, event.object_id),
            Self::Idle(idle) => write!(f, "Idle({idle})"),
        }
    }
}

#[derive(Default)]
struct DeliveryState {
    items: VecDeque<Delivery>,
    objects: usize,
    closed: bool,
    finished: bool,
}

/// Queue drained by a connection's delivery thread.
///
/// Received objects are bounded by the capacity; producers block while
/// it is reached. Events and echoes are never held back.
pub(crate) struct DeliveryQueue {
    state: Mutex<DeliveryState>,
    cv: Condvar,
    capacity: usize,
}

impl DeliveryQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(DeliveryState::default()),
            cv: Condvar::new(),
            capacity,
        }
    }

    /// Enqueue `item`; hands it back once the queue is closed.
    pub(crate) fn push(&self, item: Delivery) -> Result<(), Delivery> {
        let is_object = matches!(item, Delivery::Object { .. });
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        while is_object && !state.closed && state.objects >= self.capacity {
            state = self.cv.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        if state.closed {
            return Err(item);
        }
        if is_object {
            state.objects += 1;
        }
        state.items.push_back(item);
        drop(state);
        self.cv.notify_all();
        Ok(())
    }

    /// Next item; after close the remaining items are still handed out.
    pub(crate) fn pop(&self) -> Option<Delivery> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(item) = state.items.pop_front() {
                if matches!(item, Delivery::Object { .. }) {
                    state.objects -= 1;
                    self.cv.notify_all();
                }
                return Some(item);
            }
            if state.closed {
                return None;
            }
            state = self.cv.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub(crate) fn close(&self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed = true;
        self.cv.notify_all();
    }

    /// Called by the delivery thread on exit.
    pub(crate) fn mark_finished(&self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .finished = true;
        self.cv.notify_all();
    }

    /// Wait for the delivery thread to drain and exit.
    pub(crate) fn wait_finished(&self, timeout: Duration) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let (state, _) = self
            .cv
            .wait_timeout_while(state, timeout, |s| !s.finished)
            .unwrap_or_else(PoisonError::into_inner);
        state.finished
    }

    pub(crate) fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .items
            .len()
    }
}

/// Fire the listener callbacks for one item.
pub(crate) fn deliver(listeners: &ListenerSet, conn: &str, item: Delivery) {
    match item {
        Delivery::Connected => listeners.fire(conn, "connected", |l| l.connected()),
        Delivery::Object { object_id, object } => {
            listeners.fire(conn, "object_received", |l| l.object_received(object_id, &object))
        }
        Delivery::PingEcho(echo) => {
            listeners.fire(conn, "ping_echo_received", |l| l.ping_echo_received(&echo))
        }
        Delivery::Transmission(event) => {
            listeners.fire(conn, "transmission_event", |l| l.transmission_event(&event))
        }
        Delivery::Idle(idle) => listeners.fire(conn, "idle", |l| l.idle(idle)),
    }
}

/// Body of a connection's delivery thread.
pub(crate) fn run(queue: &DeliveryQueue, listeners: &ListenerSet, conn: &str) {
    while let Some(item) = queue.pop() {
        tracing::trace!(conn, item = ?item, "delivering");
        deliver(listeners, conn, item);
    }
    queue.mark_finished();
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;

    use super::*;

    fn object(id: u64) -> Delivery {
        Delivery::Object {
            object_id: id,
            object: Box::new(id),
        }
    }

    #[test]
    fn objects_are_bounded_events_are_not() {
        let queue = Arc::new(DeliveryQueue::new(1));
        queue.push(object(1)).unwrap();
        queue.push(Delivery::Idle(true)).unwrap();
        queue.push(Delivery::Connected).unwrap();

        let (tx, rx) = mpsc::channel();
        let producer = Arc::clone(&queue);
        let handle = thread::spawn(move || {
            let _ = producer.push(object(2));
            let _ = tx.send(());
        });
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        assert!(matches!(queue.pop(), Some(Delivery::Object { object_id: 1, .. })));
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        handle.join().unwrap();
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn close_drains_then_ends() {
        let queue = DeliveryQueue::new(4);
        queue.push(Delivery::Idle(false)).unwrap();
        queue.close();
        assert!(queue.push(Delivery::Connected).is_err());
        assert!(matches!(queue.pop(), Some(Delivery::Idle(false))));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn close_releases_blocked_producer() {
        let queue = Arc::new(DeliveryQueue::new(1));
        queue.push(object(1)).unwrap();
        let producer = Arc::clone(&queue);
        let handle = thread::spawn(move || producer.push(object(2)).is_err());
        thread::sleep(Duration::from_millis(20));
        queue.close();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn run_marks_finished() {
        let queue = Arc::new(DeliveryQueue::new(4));
        let listeners = Arc::new(ListenerSet::default());
        let worker_queue = Arc::clone(&queue);
        let worker_listeners = Arc::clone(&listeners);
        let handle = thread::spawn(move || run(&worker_queue, &worker_listeners, "test"));
        queue.push(object(3)).unwrap();
        assert!(!queue.wait_finished(Duration::from_millis(20)));
        queue.close();
        assert!(queue.wait_finished(Duration::from_secs(2)));
        handle.join().unwrap();
    }
}
