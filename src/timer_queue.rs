//! Ordered timer expirations multiplexed onto a single kernel timer
//! descriptor, so the reactor has exactly one time source.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

use crate::event_loop::EventLoopHandle;
use crate::channel::Channel;
use crate::timer::{next_sequence, Timer, TimerId};
use crate::timestamp::{Timestamp, MICROSECONDS_PER_SECOND};

/// Two parallel indices over the same set of `Timer`s, as in the reference
/// implementation, but restructured for Rust: `timers` is the ordered
/// `(expiration, sequence)` index used to find what's due; `arena` is a
/// `HashMap` keyed by sequence, replacing the reference's second
/// `Timer*`-ordered `BTreeSet` with an O(1)-lookup owner of every live
/// `Timer`. The invariant `|timers| == |arena|` holds between any two public
/// operations, same as the reference's `|timers_| == |activeTimers_|`.
pub struct TimerQueue {
    loop_: EventLoopHandle,
    timer_fd: RawFd,
    timer_channel: Channel,
    timers: std::cell::RefCell<BTreeSet<(Timestamp, u64)>>,
    arena: std::cell::RefCell<HashMap<u64, Rc<Timer>>>,
    calling_expired_timers: std::cell::Cell<bool>,
    canceling_timers: std::cell::RefCell<HashSet<u64>>,
}

/// Raw-pointer handle into a `TimerQueue`, mirroring [`EventLoopHandle`].
/// Valid because a `TimerQueue` is always embedded in its owning
/// `EventLoop`'s boxed storage and is moved into place exactly once before
/// any handle to it is taken.
#[derive(Clone, Copy)]
struct TimerQueueHandle(*const TimerQueue);

unsafe impl Send for TimerQueueHandle {}
unsafe impl Sync for TimerQueueHandle {}

impl TimerQueueHandle {
    /// # Safety
    /// `tq` must already be at its final, stable address.
    unsafe fn new(tq: &TimerQueue) -> TimerQueueHandle {
        TimerQueueHandle(tq as *const TimerQueue)
    }

    fn get(&self) -> &TimerQueue {
        unsafe { &*self.0 }
    }
}

fn create_timer_fd() -> io::Result<RawFd> {
    syscall!(timerfd_create(
        libc::CLOCK_MONOTONIC,
        libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
    ))
}

/// Clamped to a minimum of 100 microseconds so the kernel never rejects a
/// relative time that has already passed.
fn how_much_time_from_now(when: Timestamp) -> libc::timespec {
    let mut micros = when.micros_since_epoch() - Timestamp::now().micros_since_epoch();
    if micros < 100 {
        micros = 100;
    }
    libc::timespec {
        tv_sec: (micros / MICROSECONDS_PER_SECOND) as libc::time_t,
        tv_nsec: ((micros % MICROSECONDS_PER_SECOND) * 1000) as libc::c_long,
    }
}

fn reset_timer_fd(timer_fd: RawFd, expiration: Timestamp) {
    let mut new_value: libc::itimerspec = unsafe { std::mem::zeroed() };
    let mut old_value: libc::itimerspec = unsafe { std::mem::zeroed() };
    new_value.it_value = how_much_time_from_now(expiration);
    let ret = unsafe { libc::timerfd_settime(timer_fd, 0, &new_value, &mut old_value) };
    if ret != 0 {
        log::error!("timerfd_settime failed: {}", io::Error::last_os_error());
    }
}

impl TimerQueue {
    pub(crate) fn new(loop_: EventLoopHandle) -> io::Result<TimerQueue> {
        let timer_fd = create_timer_fd()?;
        let timer_channel = Channel::new(loop_, timer_fd);
        Ok(TimerQueue {
            loop_,
            timer_fd,
            timer_channel,
            timers: std::cell::RefCell::new(BTreeSet::new()),
            arena: std::cell::RefCell::new(HashMap::new()),
            calling_expired_timers: std::cell::Cell::new(false),
            canceling_timers: std::cell::RefCell::new(HashSet::new()),
        })
    }

    /// Wires the read callback and enables reading. Must be called once,
    /// after `self` has reached its final address inside the owning
    /// `EventLoop`.
    pub(crate) fn arm(&self) {
        let handle = unsafe { TimerQueueHandle::new(self) };
        self.timer_channel
            .set_read_callback(move |_ts| handle.get().handle_read());
        self.timer_channel.enable_reading();
    }

    /// May be called from any thread; the insertion itself always runs on
    /// the owning loop.
    pub fn add_timer(
        &self,
        when: Timestamp,
        interval: Option<Duration>,
        cb: impl FnMut() + Send + 'static,
    ) -> TimerId {
        let sequence = next_sequence();
        let handle = unsafe { TimerQueueHandle::new(self) };
        let cb: Box<dyn FnMut() + Send> = Box::new(cb);
        self.loop_.run_in_loop(move || {
            handle.get().insert_new_timer(sequence, when, interval, cb);
        });
        TimerId(sequence)
    }

    /// May be called from any thread. Best-effort: canceling a timer that
    /// has already fired and will not repeat is a silent no-op, matching the
    /// reference implementation's documented ambiguity around the
    /// fire-vs-cancel race.
    pub fn cancel(&self, id: TimerId) {
        let handle = unsafe { TimerQueueHandle::new(self) };
        self.loop_.run_in_loop(move || {
            handle.get().cancel_in_loop(id.0);
        });
    }

    fn insert_new_timer(
        &self,
        sequence: u64,
        when: Timestamp,
        interval: Option<Duration>,
        cb: Box<dyn FnMut() + Send>,
    ) {
        self.loop_.assert_in_loop_thread();
        let timer = Rc::new(Timer::new(cb, when, interval, sequence));
        let became_earliest = self.insert(when, sequence);
        self.arena.borrow_mut().insert(sequence, timer);
        if became_earliest {
            reset_timer_fd(self.timer_fd, when);
        }
    }

    fn insert(&self, when: Timestamp, sequence: u64) -> bool {
        let mut timers = self.timers.borrow_mut();
        let became_earliest = timers.iter().next().is_none_or(|&(t, _)| when < t);
        timers.insert((when, sequence));
        became_earliest
    }

    fn cancel_in_loop(&self, sequence: u64) {
        self.loop_.assert_in_loop_thread();
        debug_assert_eq!(self.timers.borrow().len(), self.arena.borrow().len());

        let expiration = self.arena.borrow().get(&sequence).map(|t| t.expiration.get());
        match expiration {
            Some(expiration) => {
                self.timers.borrow_mut().remove(&(expiration, sequence));
                self.arena.borrow_mut().remove(&sequence);
            }
            // Not found: either a stale/unknown id, or (if we're in the
            // middle of `handle_read`'s callback loop) a timer from the
            // current expired batch, already pulled out of `arena`/`timers`
            // by `get_expired` before its callback ran. In the latter case
            // this is the only remaining way to stop it re-arming itself —
            // mirrors TimerQueue.cc's `cancelInLoop`, whose `else if
            // (callingExpiredTimers_)` branch is reached the same way.
            None => {
                if self.calling_expired_timers.get() {
                    self.canceling_timers.borrow_mut().insert(sequence);
                }
            }
        }

        debug_assert_eq!(self.timers.borrow().len(), self.arena.borrow().len());
    }

    fn handle_read(&self) {
        self.loop_.assert_in_loop_thread();
        let now = Timestamp::now();
        self.read_timer_fd(now);

        let expired = self.get_expired(now);

        self.calling_expired_timers.set(true);
        self.canceling_timers.borrow_mut().clear();
        for timer in &expired {
            timer.run();
        }
        self.calling_expired_timers.set(false);

        self.reset_expired(&expired, now);
    }

    fn read_timer_fd(&self, now: Timestamp) {
        let mut how_many: u64 = 0;
        let n = unsafe {
            libc::read(
                self.timer_fd,
                &mut how_many as *mut u64 as *mut libc::c_void,
                8,
            )
        };
        log::trace!("TimerQueue::handle_read {how_many} at {now}");
        if n != 8 {
            log::error!("TimerQueue::handle_read reads {n} bytes instead of 8");
        }
    }

    fn get_expired(&self, now: Timestamp) -> Vec<Rc<Timer>> {
        debug_assert_eq!(self.timers.borrow().len(), self.arena.borrow().len());
        let sentry = (now, u64::MAX);
        let due: Vec<(Timestamp, u64)> = self
            .timers
            .borrow()
            .range(..=sentry)
            .copied()
            .collect();

        let mut arena = self.arena.borrow_mut();
        let mut timers = self.timers.borrow_mut();
        let mut expired = Vec::with_capacity(due.len());
        for key in due {
            timers.remove(&key);
            if let Some(timer) = arena.remove(&key.1) {
                expired.push(timer);
            }
        }
        expired
    }

    fn reset_expired(&self, expired: &[Rc<Timer>], now: Timestamp) {
        for timer in expired {
            if timer.is_repeating() && !self.canceling_timers.borrow().contains(&timer.sequence) {
                timer.restart(now);
                self.timers
                    .borrow_mut()
                    .insert((timer.expiration.get(), timer.sequence));
                self.arena.borrow_mut().insert(timer.sequence, timer.clone());
            }
            // else: drop it — non-repeating or cancelled mid-callback.
        }

        if let Some(&(next_expiration, _)) = self.timers.borrow().iter().next() {
            reset_timer_fd(self.timer_fd, next_expiration);
        }
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.timers.borrow().len()
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        self.timer_channel.disable_all();
        self.timer_channel.remove();
        unsafe { libc::close(self.timer_fd) };
    }
}

// The queue's RefCells are only ever touched on the owning loop's thread;
// `add_timer`/`cancel` only generate a sequence number and post a closure.
unsafe impl Sync for TimerQueue {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn how_much_time_clamps_past_deadlines_to_100_micros() {
        let ts = how_much_time_from_now(Timestamp::new(1));
        assert_eq!(ts.tv_sec, 0);
        assert_eq!(ts.tv_nsec, 100_000);
    }
}
