//! The single-threaded cooperative scheduler: owns one [`Poller`], a
//! wake-up descriptor, a pending-functor queue, and a [`TimerQueue`].

use std::cell::{Cell, RefCell};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread::ThreadId;
use std::time::Duration;

use crate::channel::Channel;
use crate::poller::{EpollPoller, Poller};
use crate::timer::TimerId;
use crate::timer_queue::TimerQueue;
use crate::timestamp::Timestamp;

const POLL_TIME_MS: i32 = 10_000;

type Functor = Box<dyn FnOnce() + Send>;

/// One per thread. Constructed via [`EventLoop::new`], which returns a
/// `Box<EventLoop>` so its address is stable for the lifetime of the loop —
/// required because [`EventLoopHandle`]s and `Channel`s embedded in it
/// (the wake-up channel, the timer queue's channel) hold raw pointers back
/// to it.
pub struct EventLoop {
    looping: AtomicBool,
    quit: AtomicBool,
    calling_pending_functors: AtomicBool,
    thread_id: ThreadId,
    poll_return_time: Cell<Timestamp>,
    poller: RefCell<EpollPoller>,
    wakeup_fd: RawFd,
    wakeup_channel: RefCell<Option<Channel>>,
    timer_queue: RefCell<Option<TimerQueue>>,
    pending_functors: Mutex<Vec<Functor>>,
}

/// A `Copy`, `Send + Sync` raw-pointer handle onto an [`EventLoop`].
///
/// The reference implementation publishes a raw, non-owning
/// `EventLoop*` across threads (under a mutex/condvar, see
/// [`EventLoopThread`](crate::event_loop_thread::EventLoopThread)); this type
/// is the Rust equivalent. It is safe to hold and copy from any thread —
/// every operation it exposes either only touches atomics/mutexes, or
/// asserts it is running on the owning thread before touching anything else.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct EventLoopHandle(*const EventLoop);

unsafe impl Send for EventLoopHandle {}
unsafe impl Sync for EventLoopHandle {}

impl EventLoopHandle {
    fn new(loop_: &EventLoop) -> EventLoopHandle {
        EventLoopHandle(loop_ as *const EventLoop)
    }

    /// A handle that points at nothing. `update_channel`/`remove_channel`
    /// become no-ops; every other operation panics. Exists only so unit
    /// tests can construct a [`Channel`](crate::channel::Channel) without a
    /// live `EventLoop`.
    #[doc(hidden)]
    pub unsafe fn dangling() -> EventLoopHandle {
        EventLoopHandle(std::ptr::null())
    }

    #[doc(hidden)]
    pub fn new_test_channel(&self, fd: RawFd) -> Channel {
        Channel::new(*self, fd)
    }

    pub(crate) fn get(&self) -> &EventLoop {
        debug_assert!(!self.0.is_null(), "EventLoopHandle::dangling used for a real operation");
        unsafe { &*self.0 }
    }

    pub fn update_channel(&self, channel: &Channel) {
        if self.0.is_null() {
            return;
        }
        self.get().update_channel(channel);
    }

    pub fn remove_channel(&self, channel: &Channel) {
        if self.0.is_null() {
            return;
        }
        self.get().remove_channel(channel);
    }

    pub fn run_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        self.get().run_in_loop(f);
    }

    pub fn queue_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        self.get().queue_in_loop(f);
    }

    pub fn is_in_loop_thread(&self) -> bool {
        self.get().is_in_loop_thread()
    }

    pub fn assert_in_loop_thread(&self) {
        self.get().assert_in_loop_thread();
    }

    pub fn wakeup(&self) {
        self.get().wakeup();
    }

    /// May be called from any thread. See [`EventLoop::quit`].
    pub fn quit(&self) {
        self.get().quit();
    }

    /// May be called from any thread. See [`EventLoop::is_looping`].
    pub fn is_looping(&self) -> bool {
        self.get().is_looping()
    }

    /// May be called from any thread. See [`EventLoop::run_at`].
    pub fn run_at(&self, when: Timestamp, cb: impl FnMut() + Send + 'static) -> TimerId {
        self.get().run_at(when, cb)
    }

    /// May be called from any thread. See [`EventLoop::run_after`].
    pub fn run_after(&self, delay: Duration, cb: impl FnMut() + Send + 'static) -> TimerId {
        self.get().run_after(delay, cb)
    }

    /// May be called from any thread. See [`EventLoop::run_every`].
    pub fn run_every(&self, interval: Duration, cb: impl FnMut() + Send + 'static) -> TimerId {
        self.get().run_every(interval, cb)
    }

    /// May be called from any thread. See [`EventLoop::cancel_timer`].
    pub fn cancel_timer(&self, id: TimerId) {
        self.get().cancel_timer(id);
    }
}

fn create_eventfd() -> io::Result<RawFd> {
    syscall!(eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC))
}

impl EventLoop {
    /// Builds a new loop, registered for the calling thread. Must be run
    /// from the thread that will own it (typically right after spawning,
    /// see [`EventLoopThread`](crate::event_loop_thread::EventLoopThread)).
    pub fn new() -> io::Result<Box<EventLoop>> {
        let poller = EpollPoller::new()?;
        let wakeup_fd = create_eventfd()?;

        let loop_ = Box::new(EventLoop {
            looping: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            calling_pending_functors: AtomicBool::new(false),
            thread_id: std::thread::current().id(),
            poll_return_time: Cell::new(Timestamp::invalid()),
            poller: RefCell::new(poller),
            wakeup_fd,
            wakeup_channel: RefCell::new(None),
            timer_queue: RefCell::new(None),
            pending_functors: Mutex::new(Vec::new()),
        });

        let handle = EventLoopHandle::new(&loop_);

        let wakeup_channel = Channel::new(handle, wakeup_fd);
        wakeup_channel.set_read_callback(move |_ts| handle.get().handle_wakeup_read());
        *loop_.wakeup_channel.borrow_mut() = Some(wakeup_channel);
        loop_
            .wakeup_channel
            .borrow()
            .as_ref()
            .unwrap()
            .enable_reading();

        let timer_queue = TimerQueue::new(handle)?;
        *loop_.timer_queue.borrow_mut() = Some(timer_queue);
        loop_.timer_queue.borrow().as_ref().unwrap().arm();

        log::trace!("EventLoop created in thread {:?}", loop_.thread_id);
        Ok(loop_)
    }

    pub fn handle(&self) -> EventLoopHandle {
        EventLoopHandle::new(self)
    }

    /// Runs until [`EventLoop::quit`] is observed. Must be called from the
    /// thread that created this loop.
    pub fn run(&self) {
        self.assert_in_loop_thread();
        assert!(
            !self.looping.swap(true, Ordering::SeqCst),
            "EventLoop::run called twice"
        );
        self.quit.store(false, Ordering::SeqCst);
        log::trace!("EventLoop {:p} start looping", self);

        let mut active_channels: Vec<*const Channel> = Vec::new();
        while !self.quit.load(Ordering::SeqCst) {
            let now = match self.poller.borrow_mut().poll(POLL_TIME_MS, &mut active_channels) {
                Ok(now) => now,
                Err(err) => {
                    log::error!("EventLoop::run: poll failed: {err}");
                    Timestamp::now()
                }
            };
            self.poll_return_time.set(now);

            for &channel in &active_channels {
                // SAFETY: channels reported by `poll` are registered
                // Channels owned by some object still alive on this thread.
                unsafe { (*channel).handle_event(now) };
            }

            self.do_pending_functors();
        }

        log::trace!("EventLoop {:p} stop looping", self);
        self.looping.store(false, Ordering::SeqCst);
    }

    /// May be called from any thread.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::SeqCst);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    pub fn poll_return_time(&self) -> Timestamp {
        self.poll_return_time.get()
    }

    pub fn is_looping(&self) -> bool {
        self.looping.load(Ordering::SeqCst)
    }

    pub fn run_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            f();
        } else {
            self.queue_in_loop(f);
        }
    }

    pub fn queue_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        let should_wake = {
            let mut functors = self.pending_functors.lock().unwrap();
            functors.push(Box::new(f));
            !self.is_in_loop_thread() || self.calling_pending_functors.load(Ordering::SeqCst)
        };
        if should_wake {
            self.wakeup();
        }
    }

    fn do_pending_functors(&self) {
        let mut functors = Vec::new();
        {
            let mut guard = self.pending_functors.lock().unwrap();
            std::mem::swap(&mut functors, &mut guard);
        }

        self.calling_pending_functors.store(true, Ordering::SeqCst);
        for f in functors {
            f();
        }
        self.calling_pending_functors.store(false, Ordering::SeqCst);
    }

    pub fn wakeup(&self) {
        let one: u64 = 1;
        let res = unsafe {
            libc::write(self.wakeup_fd, &one as *const u64 as *const libc::c_void, 8)
        };
        if res != 8 {
            log::error!(
                "EventLoop::wakeup wrote {res} bytes instead of 8: {}",
                io::Error::last_os_error()
            );
        }
    }

    fn handle_wakeup_read(&self) {
        let mut buf: u64 = 0;
        let res =
            unsafe { libc::read(self.wakeup_fd, &mut buf as *mut u64 as *mut libc::c_void, 8) };
        if res != 8 {
            log::error!("EventLoop::handle_wakeup_read read {res} bytes instead of 8");
        }
    }

    pub fn update_channel(&self, channel: &Channel) {
        self.assert_in_loop_thread();
        self.poller.borrow_mut().update_channel(channel);
    }

    pub fn remove_channel(&self, channel: &Channel) {
        self.assert_in_loop_thread();
        self.poller.borrow_mut().remove_channel(channel);
    }

    pub fn has_channel(&self, channel: &Channel) -> bool {
        self.assert_in_loop_thread();
        self.poller.borrow().has_channel(channel)
    }

    pub fn is_in_loop_thread(&self) -> bool {
        self.thread_id == std::thread::current().id()
    }

    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            panic!(
                "EventLoop {:p} created in thread {:?}; called from thread {:?}",
                self,
                self.thread_id,
                std::thread::current().id(),
            );
        }
    }

    /// Schedules `cb` to run once at `when`. May be called from any thread.
    pub fn run_at(&self, when: Timestamp, cb: impl FnMut() + Send + 'static) -> TimerId {
        self.timer_queue().add_timer(when, None, cb)
    }

    /// Schedules `cb` to run once after `delay`. May be called from any
    /// thread.
    pub fn run_after(&self, delay: Duration, cb: impl FnMut() + Send + 'static) -> TimerId {
        let when = Timestamp::now().add_seconds(delay.as_secs_f64());
        self.timer_queue().add_timer(when, None, cb)
    }

    /// Schedules `cb` to run every `interval`, starting one interval from
    /// now. May be called from any thread.
    pub fn run_every(&self, interval: Duration, cb: impl FnMut() + Send + 'static) -> TimerId {
        let when = Timestamp::now().add_seconds(interval.as_secs_f64());
        self.timer_queue().add_timer(when, Some(interval), cb)
    }

    /// May be called from any thread.
    pub fn cancel_timer(&self, id: TimerId) {
        self.timer_queue().cancel(id);
    }

    fn timer_queue(&self) -> &TimerQueue {
        // SAFETY-free: `timer_queue` is populated by `new` before it returns
        // and never cleared afterward, so this borrow always succeeds.
        // We can't return a `Ref<TimerQueue>` and a `&TimerQueue` at once,
        // so reach through the RefCell via a raw pointer instead — sound
        // because the Option is write-once and never mutated again.
        let ptr = self.timer_queue.as_ptr();
        unsafe { (*ptr).as_ref().expect("timer queue not yet initialized") }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        assert!(
            !self.looping.load(Ordering::SeqCst),
            "EventLoop dropped while still running"
        );
        if let Some(channel) = self.wakeup_channel.borrow().as_ref() {
            channel.disable_all();
            channel.remove();
        }
        unsafe { libc::close(self.wakeup_fd) };
    }
}

// EventLoop's interior-mutable fields (poller, wakeup_channel, timer_queue,
// pending_functors) are only ever touched on the owning thread, except for
// `pending_functors` (guarded by its own Mutex) and the `looping`/`quit`/
// `calling_pending_functors` atomics, which are exactly the fields the
// reference implementation allows other threads to reach.
unsafe impl Sync for EventLoop {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn new_loop_is_not_looping() {
        let loop_ = EventLoop::new().expect("EventLoop::new");
        assert!(!loop_.is_looping());
    }

    #[test]
    fn run_in_loop_executes_inline_on_owning_thread() {
        let loop_ = EventLoop::new().expect("EventLoop::new");
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        loop_.run_in_loop(move || ran2.store(true, Ordering::SeqCst));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn queue_in_loop_then_quit_runs_functor_before_loop_exits() {
        let loop_ = EventLoop::new().expect("EventLoop::new");
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        loop_.queue_in_loop(move || ran2.store(true, Ordering::SeqCst));
        loop_.quit();
        loop_.run();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn cross_thread_quit_wakes_the_loop() {
        let loop_ = EventLoop::new().expect("EventLoop::new");
        let handle = loop_.handle();
        let quitter = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            handle.get().quit();
        });
        loop_.run();
        quitter.join().unwrap();
    }

    #[test]
    #[should_panic(expected = "created in thread")]
    fn assert_in_loop_thread_panics_off_thread() {
        let loop_ = EventLoop::new().expect("EventLoop::new");
        let handle = loop_.handle();
        std::thread::spawn(move || {
            handle.assert_in_loop_thread();
        })
        .join()
        .unwrap();
    }

    #[test]
    fn run_after_fires_once() {
        let loop_ = EventLoop::new().expect("EventLoop::new");
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        let handle = loop_.handle();
        loop_.run_after(Duration::from_millis(5), move || {
            fired2.store(true, Ordering::SeqCst);
            handle.get().quit();
        });
        loop_.run();
        assert!(fired.load(Ordering::SeqCst));
    }
}
