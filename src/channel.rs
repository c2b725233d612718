//! Per-fd event registration and dispatch, bridging the [`Poller`](crate::poller::Poller)
//! to user callbacks.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::os::unix::io::RawFd;
use std::sync::Weak;

use crate::event_loop::EventLoopHandle;
use crate::timestamp::Timestamp;

/// Mirrors the state a [`Poller`](crate::poller::Poller) tracks per `Channel`
/// so it never has to search for one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelIndex {
    New,
    Added,
    Deleted,
}

type ReadCallback = Box<dyn FnMut(Timestamp)>;
type SimpleCallback = Box<dyn FnMut()>;

/// A Channel owns no file descriptor; the fd belongs to whatever socket or
/// kernel object created it (Acceptor, TcpConnection, EventLoop's wakeup fd,
/// TimerQueue's timer fd). A Channel is meaningfully mutated only from its
/// owning loop's thread.
///
/// Channels always live behind a stable heap allocation (`Box`/`Arc` owned by
/// the Acceptor/TcpConnection/EventLoop/TimerQueue that created them), so
/// `&Channel`'s address is stable for as long as it is registered with a
/// [`Poller`](crate::poller::Poller) — that address is what gets stored in
/// `epoll_event.u64` for O(1) dispatch.
pub struct Channel {
    loop_: EventLoopHandle,
    fd: RawFd,
    events: Cell<i32>,
    revents: Cell<i32>,
    index: Cell<ChannelIndex>,
    tied: Cell<bool>,
    guard: RefCell<Option<Weak<dyn Any + Send + Sync>>>,
    event_handling: Cell<bool>,
    read_callback: RefCell<Option<ReadCallback>>,
    write_callback: RefCell<Option<SimpleCallback>>,
    close_callback: RefCell<Option<SimpleCallback>>,
    error_callback: RefCell<Option<SimpleCallback>>,
}

pub const NONE_EVENT: i32 = 0;
pub const READ_EVENT: i32 = libc::EPOLLIN | libc::EPOLLPRI;
pub const WRITE_EVENT: i32 = libc::EPOLLOUT;

impl Channel {
    pub fn new(loop_: EventLoopHandle, fd: RawFd) -> Channel {
        Channel {
            loop_,
            fd,
            events: Cell::new(NONE_EVENT),
            revents: Cell::new(NONE_EVENT),
            index: Cell::new(ChannelIndex::New),
            tied: Cell::new(false),
            guard: RefCell::new(None),
            event_handling: Cell::new(false),
            read_callback: RefCell::new(None),
            write_callback: RefCell::new(None),
            close_callback: RefCell::new(None),
            error_callback: RefCell::new(None),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn events(&self) -> i32 {
        self.events.get()
    }

    pub fn is_none_event(&self) -> bool {
        self.events.get() == NONE_EVENT
    }

    pub fn is_reading(&self) -> bool {
        self.events.get() & READ_EVENT != 0
    }

    pub fn is_writing(&self) -> bool {
        self.events.get() & WRITE_EVENT != 0
    }

    pub fn index(&self) -> ChannelIndex {
        self.index.get()
    }

    pub fn set_index(&self, index: ChannelIndex) {
        self.index.set(index);
    }

    /// Reported by the [`Poller`](crate::poller::Poller) after a `poll` call.
    pub fn set_revents(&self, revents: i32) {
        self.revents.set(revents);
    }

    pub fn set_read_callback(&self, cb: impl FnMut(Timestamp) + 'static) {
        *self.read_callback.borrow_mut() = Some(Box::new(cb));
    }

    pub fn set_write_callback(&self, cb: impl FnMut() + 'static) {
        *self.write_callback.borrow_mut() = Some(Box::new(cb));
    }

    pub fn set_close_callback(&self, cb: impl FnMut() + 'static) {
        *self.close_callback.borrow_mut() = Some(Box::new(cb));
    }

    pub fn set_error_callback(&self, cb: impl FnMut() + 'static) {
        *self.error_callback.borrow_mut() = Some(Box::new(cb));
    }

    pub fn enable_reading(&self) {
        self.events.set(self.events.get() | READ_EVENT);
        self.update();
    }

    pub fn disable_reading(&self) {
        self.events.set(self.events.get() & !READ_EVENT);
        self.update();
    }

    pub fn enable_writing(&self) {
        self.events.set(self.events.get() | WRITE_EVENT);
        self.update();
    }

    pub fn disable_writing(&self) {
        self.events.set(self.events.get() & !WRITE_EVENT);
        self.update();
    }

    pub fn disable_all(&self) {
        self.events.set(NONE_EVENT);
        self.update();
    }

    fn update(&self) {
        self.loop_.update_channel(self);
    }

    /// Must be called from the owning loop before the Channel is dropped.
    pub fn remove(&self) {
        debug_assert!(self.is_none_event());
        self.loop_.remove_channel(self);
    }

    /// Pins `guard` for the duration of dispatch: see [`Channel::handle_event_with_guard`].
    pub fn tie(&self, guard: Weak<dyn Any + Send + Sync>) {
        *self.guard.borrow_mut() = Some(guard);
        self.tied.set(true);
    }

    /// Entry point invoked by the owning [`EventLoop`](crate::event_loop::EventLoop)
    /// once per active channel per poll iteration.
    pub fn handle_event(&self, receive_time: Timestamp) {
        if self.tied.get() {
            let upgraded = self
                .guard
                .borrow()
                .as_ref()
                .and_then(|weak| weak.upgrade());
            match upgraded {
                Some(_guard) => self.handle_event_inner(receive_time),
                None => {
                    log::trace!("channel fd={} dropped event, owner gone", self.fd);
                }
            }
        } else {
            self.handle_event_inner(receive_time);
        }
    }

    fn handle_event_inner(&self, receive_time: Timestamp) {
        self.event_handling.set(true);
        let revents = self.revents.get();

        if revents & libc::EPOLLHUP != 0 && revents & libc::EPOLLIN == 0 {
            if let Some(cb) = self.close_callback.borrow_mut().as_mut() {
                cb();
            }
            self.event_handling.set(false);
            return;
        }

        if revents & libc::EPOLLERR != 0 {
            if let Some(cb) = self.error_callback.borrow_mut().as_mut() {
                cb();
            }
        }

        if revents & (libc::EPOLLIN | libc::EPOLLPRI) != 0 {
            if let Some(cb) = self.read_callback.borrow_mut().as_mut() {
                cb(receive_time);
            }
        }

        if revents & libc::EPOLLOUT != 0 {
            if let Some(cb) = self.write_callback.borrow_mut().as_mut() {
                cb();
            }
        }

        self.event_handling.set(false);
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("events", &self.events.get())
            .field("revents", &self.revents.get())
            .field("index", &self.index.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;
    use std::rc::Rc;

    // EventLoopHandle::update_channel/remove_channel both dereference the
    // loop pointer; these unit tests only exercise the parts of Channel that
    // don't require a live EventLoop, by constructing a Channel through
    // EventLoop itself (see event_loop.rs tests for end-to-end dispatch).

    #[test]
    fn dispatch_order_hup_without_in_returns_early() {
        let read_fired = Rc::new(StdRefCell::new(false));
        let error_fired = Rc::new(StdRefCell::new(false));
        let close_fired = Rc::new(StdRefCell::new(false));
        let write_fired = Rc::new(StdRefCell::new(false));

        // Build a channel without a real loop by using a null handle; safe
        // here because update()/remove() are never invoked in this test.
        let channel = unsafe { EventLoopHandle::dangling() }.new_test_channel(-1);

        {
            let flag = read_fired.clone();
            channel.set_read_callback(move |_| *flag.borrow_mut() = true);
        }
        {
            let flag = error_fired.clone();
            channel.set_error_callback(move || *flag.borrow_mut() = true);
        }
        {
            let flag = close_fired.clone();
            channel.set_close_callback(move || *flag.borrow_mut() = true);
        }
        {
            let flag = write_fired.clone();
            channel.set_write_callback(move || *flag.borrow_mut() = true);
        }

        channel.set_revents(libc::EPOLLHUP | libc::EPOLLOUT);
        channel.handle_event(Timestamp::now());

        assert!(*close_fired.borrow());
        assert!(!*read_fired.borrow());
        assert!(!*error_fired.borrow());
        assert!(!*write_fired.borrow(), "HUP without IN must short-circuit");
    }

    #[test]
    fn dispatch_independent_callbacks_all_fire() {
        let error_fired = Rc::new(StdRefCell::new(false));
        let read_fired = Rc::new(StdRefCell::new(false));
        let write_fired = Rc::new(StdRefCell::new(false));

        let channel = unsafe { EventLoopHandle::dangling() }.new_test_channel(-1);
        {
            let flag = error_fired.clone();
            channel.set_error_callback(move || *flag.borrow_mut() = true);
        }
        {
            let flag = read_fired.clone();
            channel.set_read_callback(move |_| *flag.borrow_mut() = true);
        }
        {
            let flag = write_fired.clone();
            channel.set_write_callback(move || *flag.borrow_mut() = true);
        }

        channel.set_revents(libc::EPOLLERR | libc::EPOLLIN | libc::EPOLLOUT);
        channel.handle_event(Timestamp::now());

        assert!(*error_fired.borrow());
        assert!(*read_fired.borrow());
        assert!(*write_fired.borrow());
    }

    #[test]
    fn tie_drops_event_silently_once_owner_gone() {
        let read_fired = Rc::new(StdRefCell::new(false));
        let channel = unsafe { EventLoopHandle::dangling() }.new_test_channel(-1);
        {
            let flag = read_fired.clone();
            channel.set_read_callback(move |_| *flag.borrow_mut() = true);
        }

        let owner: std::sync::Arc<()> = std::sync::Arc::new(());
        channel.tie(std::sync::Arc::downgrade(&owner) as Weak<dyn Any + Send + Sync>);
        drop(owner);

        channel.set_revents(libc::EPOLLIN);
        channel.handle_event(Timestamp::now());
        assert!(!*read_fired.borrow());
    }

    #[test]
    fn enabling_reading_and_writing_is_idempotent() {
        let channel = unsafe { EventLoopHandle::dangling() }.new_test_channel(-1);
        assert!(channel.is_none_event());
    }
}
