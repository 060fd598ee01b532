use std::sync::{Condvar, Mutex, PoisonError};

#[derive(Debug, Default)]
struct LoadState {
    bytes: u64,
    paused: bool,
    closed: bool,
}

/// Backpressure gate between a connection's sender thread and `CoreSend`.
///
/// Counts bytes handed over but not yet written to the socket. Signals
/// never pass through the gate.
#[derive(Debug)]
pub(crate) struct SendLoad {
    state: Mutex<LoadState>,
    cv: Condvar,
    threshold: u64,
}

impl SendLoad {
    pub(crate) fn new(threshold: u64) -> Self {
        Self {
            state: Mutex::new(LoadState::default()),
            cv: Condvar::new(),
            threshold,
        }
    }

    /// Block until the load is at or below the threshold and sending is
    /// not paused. Returns `false` once the gate is closed.
    pub(crate) fn wait_open(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if state.closed {
                return false;
            }
            if !state.paused && state.bytes <= self.threshold {
                return true;
            }
            state = self.cv.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`SendLoad::wait_open`], giving up after `timeout`.
    #[cfg(test)]
    pub(crate) fn wait_open_timeout(&self, timeout: std::time::Duration) -> Option<bool> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let (state, result) = self
            .cv
            .wait_timeout_while(state, timeout, |s| {
                !s.closed && (s.paused || s.bytes > self.threshold)
            })
            .unwrap_or_else(PoisonError::into_inner);
        if result.timed_out() {
            None
        } else {
            Some(!state.closed)
        }
    }

    pub(crate) fn add(&self, bytes: usize) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.bytes = state.bytes.saturating_add(bytes as u64);
    }

    /// Called by `CoreSend` after a write, or when a queued parcel is dropped.
    pub(crate) fn release(&self, bytes: usize) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.bytes = state.bytes.saturating_sub(bytes as u64);
        drop(state);
        self.cv.notify_all();
    }

    pub(crate) fn set_paused(&self, paused: bool) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .paused = paused;
        self.cv.notify_all();
    }

    pub(crate) fn close(&self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed = true;
        self.cv.notify_all();
    }

    pub(crate) fn current(&self) -> u64 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .bytes
    }

    pub(crate) fn threshold(&self) -> u64 {
        self.threshold
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn blocks_above_threshold_until_released() {
        let load = Arc::new(SendLoad::new(100));
        load.add(150);

        let (tx, rx) = mpsc::channel();
        let waiter = Arc::clone(&load);
        let handle = thread::spawn(move || {
            let open = waiter.wait_open();
            let _ = tx.send(open);
        });

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        load.release(40);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        load.release(10);
        assert!(rx.recv_timeout(Duration::from_secs(2)).unwrap());
        handle.join().unwrap();
        assert_eq!(load.current(), 100);
    }

    #[test]
    fn pause_blocks_even_when_empty() {
        let load = SendLoad::new(100);
        load.set_paused(true);
        assert_eq!(load.wait_open_timeout(Duration::from_millis(30)), None);
        load.set_paused(false);
        assert_eq!(load.wait_open_timeout(Duration::from_millis(30)), Some(true));
    }

    #[test]
    fn close_releases_waiters() {
        let load = Arc::new(SendLoad::new(1));
        load.add(10);
        let waiter = Arc::clone(&load);
        let handle = thread::spawn(move || waiter.wait_open());
        thread::sleep(Duration::from_millis(20));
        load.close();
        assert!(!handle.join().unwrap());
    }

    #[test]
    fn release_saturates_at_zero() {
        let load = SendLoad::new(1);
        load.add(5);
        load.release(50);
        assert_eq!(load.current(), 0);
        assert_eq!(load.threshold(), 1);
    }
}
