use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::sync::{Condvar, Mutex, PoisonError};

use parcelnet_frame::Priority;

use crate::error::{ConnError, Result};

/// Coarse ordering class of a pending send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Rank {
    Regular,
    /// The closing entry trails everything.
    Close,
}

/// One queued send; `body` is consumed parcel by parcel.
pub(crate) struct Pending<T> {
    pub(crate) rank: Rank,
    pub(crate) priority: Priority,
    pub(crate) object_id: u64,
    serial: u64,
    pub(crate) body: T,
}

impl<T> Pending<T> {
    fn key(&self) -> (Rank, Reverse<Priority>, u64, u64) {
        (self.rank, Reverse(self.priority), self.object_id, self.serial)
    }
}

impl<T> PartialEq for Pending<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl<T> Eq for Pending<T> {}

impl<T> PartialOrd for Pending<T> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Pending<T> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.key().cmp(&self.key())
    }
}

struct QueueState<T> {
    heap: BinaryHeap<Pending<T>>,
    regular: usize,
    serial: u64,
    closed: bool,
}

/// Bounded priority queue of a connection's outgoing objects and files.
///
/// Only regular entries count against the capacity; a full queue fails
/// the caller immediately.
pub(crate) struct SendQueue<T> {
    state: Mutex<QueueState<T>>,
    cv: Condvar,
    capacity: usize,
}

impl<T> SendQueue<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                regular: 0,
                serial: 0,
                closed: false,
            }),
            cv: Condvar::new(),
            capacity,
        }
    }

    pub(crate) fn push(&self, rank: Rank, priority: Priority, object_id: u64, body: T) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return Err(ConnError::Closed);
        }
        if rank == Rank::Regular {
            if state.regular >= self.capacity {
                return Err(ConnError::QueueFull {
                    capacity: self.capacity,
                });
            }
            state.regular += 1;
        }
        let serial = state.serial;
        state.serial += 1;
        state.heap.push(Pending {
            rank,
            priority,
            object_id,
            serial,
            body,
        });
        drop(state);
        self.cv.notify_one();
        Ok(())
    }

    /// Put back an entry that still has parcels to send.
    pub(crate) fn requeue(&self, entry: Pending<T>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return;
        }
        if entry.rank == Rank::Regular {
            state.regular += 1;
        }
        state.heap.push(entry);
    }

    /// Next entry in send order; blocks while empty, `None` once closed.
    pub(crate) fn pop(&self) -> Option<Pending<T>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if state.closed {
                return None;
            }
            if let Some(entry) = state.heap.pop() {
                if entry.rank == Rank::Regular {
                    state.regular -= 1;
                }
                return Some(entry);
            }
            state = self.cv.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Refuse further entries and hand back what was still queued.
    pub(crate) fn close(&self) -> Vec<T> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.closed = true;
        state.regular = 0;
        let leftover = state.heap.drain().map(|entry| entry.body).collect();
        drop(state);
        self.cv.notify_all();
        leftover
    }

    pub(crate) fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .heap
            .len()
    }
}
