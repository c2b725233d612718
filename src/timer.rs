//! A single scheduled callback, owned by a [`TimerQueue`](crate::timer_queue::TimerQueue).

use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::timestamp::Timestamp;

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_sequence() -> u64 {
    NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

/// Opaque handle returned by `add_timer`, used only to cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(pub(crate) u64);

pub(crate) struct Timer {
    pub(crate) callback: RefCell<Box<dyn FnMut() + Send>>,
    pub(crate) expiration: Cell<Timestamp>,
    pub(crate) interval: Option<Duration>,
    pub(crate) sequence: u64,
}

impl Timer {
    pub(crate) fn new(
        callback: Box<dyn FnMut() + Send>,
        expiration: Timestamp,
        interval: Option<Duration>,
        sequence: u64,
    ) -> Timer {
        Timer {
            callback: RefCell::new(callback),
            expiration: Cell::new(expiration),
            interval,
            sequence,
        }
    }

    pub(crate) fn is_repeating(&self) -> bool {
        self.interval.is_some()
    }

    pub(crate) fn run(&self) {
        (self.callback.borrow_mut())();
    }

    /// Computes the next expiration from `now`, per the spec's "compute
    /// repeat times from firing time, not scheduled time" rule (prevents
    /// catch-up storms after a long stall).
    pub(crate) fn restart(&self, now: Timestamp) {
        if let Some(interval) = self.interval {
            self.expiration.set(now.add_seconds(interval.as_secs_f64()));
        } else {
            self.expiration.set(Timestamp::invalid());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_numbers_are_strictly_increasing() {
        let a = next_sequence();
        let b = next_sequence();
        assert!(b > a);
    }

    #[test]
    fn restart_advances_from_now_not_from_old_expiration() {
        let timer = Timer::new(
            Box::new(|| {}),
            Timestamp::new(1_000_000),
            Some(Duration::from_secs(5)),
            1,
        );
        let now = Timestamp::new(10_000_000);
        timer.restart(now);
        assert_eq!(timer.expiration.get(), Timestamp::new(15_000_000));
    }
}
