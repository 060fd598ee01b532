//! Liveness and idle tracking.
//!
//! Two independent timer tasks drive the heartbeat: one sends ALIVE every
//! period, the other checks that an ALIVE_ECHO arrived within
//! `period + confirm_timeout` of the previous one. A third task compares
//! the exchanged volume per check period against the idle threshold.

use std::sync::atomic::Ordering;
use std::sync::{Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use parcelnet_frame::Signal;

use crate::connection::Inner;
use crate::delivery::Delivery;
use crate::error::ConnError;
use crate::timer::{Next, TaskHandle, Timer};

struct Beat {
    period: Duration,
    last_echo: Instant,
    alive_task: Option<TaskHandle>,
    deadline_task: Option<TaskHandle>,
    idle_threshold: u64,
    idle_task: Option<TaskHandle>,
}

/// Heartbeat and idle state of one connection.
pub(crate) struct Heartbeat {
    confirm_timeout: Duration,
    idle_check_period: Duration,
    beat: Mutex<Beat>,
}

impl Heartbeat {
    pub(crate) fn new(
        period: Duration,
        confirm_timeout: Duration,
        idle_threshold: u64,
        idle_check_period: Duration,
    ) -> Self {
        Self {
            confirm_timeout,
            idle_check_period,
            beat: Mutex::new(Beat {
                period,
                last_echo: Instant::now(),
                alive_task: None,
                deadline_task: None,
                idle_threshold,
                idle_task: None,
            }),
        }
    }

    pub(crate) fn period(&self) -> Duration {
        self.lock().period
    }

    pub(crate) fn idle_threshold(&self) -> u64 {
        self.lock().idle_threshold
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Beat> {
        self.beat.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn echo_received(&self) {
        self.lock().last_echo = Instant::now();
    }

    /// Replace the alive period. `timer` is `None` before the connection starts.
    pub(crate) fn set_period(&self, period: Duration, timer: Option<&Timer>, conn: &Weak<Inner>) {
        self.lock().period = period;
        if let Some(timer) = timer {
            self.start_alive(timer, conn);
        }
    }

    /// (Re)schedule the ALIVE and deadline tasks from now.
    pub(crate) fn start_alive(&self, timer: &Timer, conn: &Weak<Inner>) {
        let mut beat = self.lock();
        cancel(&mut beat.alive_task);
        cancel(&mut beat.deadline_task);
        beat.last_echo = Instant::now();
        let period = beat.period;
        if period.is_zero() {
            return;
        }

        let weak = conn.clone();
        beat.alive_task = Some(timer.schedule(period, move || {
            let Some(inner) = weak.upgrade() else {
                return Next::Done;
            };
            inner.send_signal(Signal::alive());
            Next::After(inner.heartbeat.period())
        }));

        let weak = conn.clone();
        let grace = self.confirm_timeout;
        beat.deadline_task = Some(timer.schedule(period + grace, move || {
            let Some(inner) = weak.upgrade() else {
                return Next::Done;
            };
            let (last_echo, period) = {
                let beat = inner.heartbeat.lock();
                (beat.last_echo, beat.period)
            };
            let allowed = period + grace;
            let deadline = last_echo + allowed;
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(conn = %inner.short_id, ?allowed, "no ALIVE_ECHO in time");
                inner.fail(ConnError::AliveTimeout(allowed));
                return Next::Done;
            }
            Next::After(deadline - now)
        }));
        tracing::debug!(?period, ?grace, "heartbeat scheduled");
    }

    /// Replace the idle threshold; zero disables idle detection.
    pub(crate) fn set_idle_threshold(&self, threshold: u64, timer: Option<&Timer>, conn: &Weak<Inner>) {
        self.lock().idle_threshold = threshold;
        if let Some(timer) = timer {
            self.start_idle(timer, conn);
        }
    }

    pub(crate) fn start_idle(&self, timer: &Timer, conn: &Weak<Inner>) {
        let mut beat = self.lock();
        cancel(&mut beat.idle_task);
        let threshold = beat.idle_threshold;
        if threshold == 0 || self.idle_check_period.is_zero() {
            return;
        }

        let check = self.idle_check_period;
        let weak = conn.clone();
        let mut last_total = weak
            .upgrade()
            .map_or(0, |inner| inner.exchanged.load(Ordering::Relaxed));
        let mut idle = false;
        beat.idle_task = Some(timer.schedule(check, move || {
            let Some(inner) = weak.upgrade() else {
                return Next::Done;
            };
            let total = inner.exchanged.load(Ordering::Relaxed);
            let volume = total.saturating_sub(last_total);
            last_total = total;
            let now_idle = volume < threshold;
            if now_idle != idle {
                idle = now_idle;
                tracing::debug!(conn = %inner.short_id, idle, volume, threshold, "idle state changed");
                inner.deliver(Delivery::Idle(idle));
            }
            Next::After(check)
        }));
    }

    pub(crate) fn stop(&self) {
        let mut beat = self.lock();
        cancel(&mut beat.alive_task);
        cancel(&mut beat.deadline_task);
        cancel(&mut beat.idle_task);
    }
}

fn cancel(task: &mut Option<TaskHandle>) {
    if let Some(task) = task.take() {
        task.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_cancels_everything() {
        let timer = Timer::start("heartbeat-test".into()).unwrap();
        let beat = Heartbeat::new(
            Duration::from_secs(60),
            Duration::from_secs(1),
            10,
            Duration::from_secs(60),
        );
        let conn = Weak::new();
        beat.start_alive(&timer, &conn);
        beat.start_idle(&timer, &conn);
        let handles: Vec<TaskHandle> = {
            let b = beat.lock();
            [&b.alive_task, &b.deadline_task, &b.idle_task]
                .into_iter()
                .map(|t| t.clone().unwrap())
                .collect()
        };
        beat.stop();
        assert!(handles.iter().all(TaskHandle::is_cancelled));
    }

    #[test]
    fn zero_period_schedules_nothing() {
        let timer = Timer::start("heartbeat-test".into()).unwrap();
        let beat = Heartbeat::new(Duration::ZERO, Duration::from_secs(1), 0, Duration::from_secs(1));
        beat.start_alive(&timer, &Weak::new());
        beat.start_idle(&timer, &Weak::new());
        assert_eq!(timer.pending(), 0);
    }

    #[test]
    fn period_change_reschedules() {
        let timer = Timer::start("heartbeat-test".into()).unwrap();
        let beat = Heartbeat::new(Duration::from_secs(60), Duration::from_secs(1), 0, Duration::from_secs(1));
        let conn = Weak::new();
        beat.start_alive(&timer, &conn);
        let old = beat.lock().alive_task.clone().unwrap();
        beat.set_period(Duration::from_secs(30), Some(&timer), &conn);
        assert!(old.is_cancelled());
        assert_eq!(beat.period(), Duration::from_secs(30));
        beat.set_period(Duration::ZERO, Some(&timer), &conn);
        assert!(beat.lock().alive_task.is_none());
    }
}
