//! Per-connection timer thread.
//!
//! Tasks run on the timer thread in deadline order. A task decides after
//! each run whether it fires again, which lets heartbeat tasks follow a
//! live-adjusted period without being rescheduled from outside.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// What a task wants after running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Next {
    Done,
    After(Duration),
}

type TaskFn = Box<dyn FnMut() -> Next + Send>;

/// Cancels a scheduled task. Dropping the handle does not cancel.
#[derive(Debug, Clone)]
pub(crate) struct TaskHandle {
    cancelled: Arc<AtomicBool>,
}

impl TaskHandle {
    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

struct Scheduled {
    at: Instant,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    task: TaskFn,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    // Earliest deadline is the heap maximum.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.at.cmp(&self.at).then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct TimerState {
    tasks: BinaryHeap<Scheduled>,
    next_seq: u64,
    shutdown: bool,
}

#[derive(Default)]
struct TimerShared {
    state: Mutex<TimerState>,
    cv: Condvar,
}

pub(crate) struct Timer {
    shared: Arc<TimerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Timer {
    pub(crate) fn start(name: String) -> std::io::Result<Self> {
        let shared = Arc::new(TimerShared::default());
        let worker = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(name)
            .spawn(move || run(worker))?;
        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Run `task` once after `delay`.
    pub(crate) fn schedule_once(
        &self,
        delay: Duration,
        task: impl FnOnce() + Send + 'static,
    ) -> TaskHandle {
        let mut task = Some(task);
        self.schedule(delay, move || {
            if let Some(task) = task.take() {
                task();
            }
            Next::Done
        })
    }

    /// Run `task` after `delay`, then again as long as it returns [`Next::After`].
    pub(crate) fn schedule(
        &self,
        delay: Duration,
        task: impl FnMut() -> Next + Send + 'static,
    ) -> TaskHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let handle = TaskHandle {
            cancelled: Arc::clone(&cancelled),
        };
        let mut state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.shutdown {
            handle.cancel();
            return handle;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.tasks.push(Scheduled {
            at: Instant::now() + delay,
            seq,
            cancelled,
            task: Box::new(task),
        });
        drop(state);
        self.shared.cv.notify_one();
        handle
    }

    /// Number of tasks still scheduled (cancelled ones included until they come due).
    pub(crate) fn pending(&self) -> usize {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tasks
            .len()
    }

    /// Stop the thread and drop all tasks. Safe to call from a task.
    pub(crate) fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.shutdown = true;
            state.tasks.clear();
        }
        self.shared.cv.notify_all();

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

impl Drop for Timer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(shared: Arc<TimerShared>) {
    let mut state = shared.state.lock().unwrap_or_else(PoisonError::into_inner);
    loop {
        if state.shutdown {
            return;
        }
        let now = Instant::now();
        match state.tasks.peek().map(|task| task.at) {
            None => {
                state = shared.cv.wait(state).unwrap_or_else(PoisonError::into_inner);
                continue;
            }
            Some(at) if at > now => {
                state = shared
                    .cv
                    .wait_timeout(state, at - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
                continue;
            }
            Some(_) => {}
        }
        let Some(mut due) = state.tasks.pop() else {
            continue;
        };
        if due.cancelled.load(Ordering::SeqCst) {
            continue;
        }

        drop(state);
        let next = (due.task)();
        state = shared.state.lock().unwrap_or_else(PoisonError::into_inner);

        if let Next::After(delay) = next {
            if !state.shutdown && !due.cancelled.load(Ordering::SeqCst) {
                due.at = Instant::now() + delay;
                due.seq = state.next_seq;
                state.next_seq += 1;
                state.tasks.push(due);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    use super::*;

    #[test]
    fn runs_in_deadline_order() {
        let timer = Timer::start("timer-order".into()).unwrap();
        let (tx, rx) = mpsc::channel();
        let late = tx.clone();
        timer.schedule_once(Duration::from_millis(60), move || {
            let _ = late.send("late");
        });
        timer.schedule_once(Duration::from_millis(10), move || {
            let _ = tx.send("early");
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "early");
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "late");
    }

    #[test]
    fn never_fires_early() {
        let timer = Timer::start("timer-early".into()).unwrap();
        let (tx, rx) = mpsc::channel();
        let started = Instant::now();
        timer.schedule_once(Duration::from_millis(50), move || {
            let _ = tx.send(Instant::now());
        });
        let fired = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(fired.duration_since(started) >= Duration::from_millis(50));
    }

    #[test]
    fn cancelled_task_does_not_run() {
        let timer = Timer::start("timer-cancel".into()).unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let handle = timer.schedule_once(Duration::from_millis(30), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        handle.cancel();
        assert!(handle.is_cancelled());
        thread::sleep(Duration::from_millis(80));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn repeating_task_stops_when_done() {
        let timer = Timer::start("timer-repeat".into()).unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        timer.schedule(Duration::from_millis(5), move || {
            if counter.fetch_add(1, Ordering::SeqCst) + 1 < 3 {
                Next::After(Duration::from_millis(5))
            } else {
                Next::Done
            }
        });
        thread::sleep(Duration::from_millis(150));
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(timer.pending(), 0);
    }

    #[test]
    fn shutdown_from_inside_a_task() {
        let timer = Arc::new(Timer::start("timer-self".into()).unwrap());
        let (tx, rx) = mpsc::channel();
        let inner = Arc::clone(&timer);
        timer.schedule_once(Duration::from_millis(5), move || {
            inner.shutdown();
            let _ = tx.send(());
        });
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let handle = timer.schedule_once(Duration::ZERO, || {});
        assert!(handle.is_cancelled());
    }
}
