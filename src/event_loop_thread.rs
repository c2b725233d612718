//! A thread that owns exactly one [`EventLoop`] and publishes it once ready.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::event_loop::{EventLoop, EventLoopHandle};

#[derive(Default)]
struct Published {
    mutex: Mutex<Option<EventLoopHandle>>,
    condvar: Condvar,
}

/// Unlike the reference implementation, which publishes a raw `EventLoop*`
/// across threads under a mutex/condvar because the loop lives on the
/// spawned thread's C++ call stack, this type keeps that same "the loop
/// lives on its own thread" property by moving a `Box<EventLoop>` into the
/// spawned closure itself — its `Drop` runs on that thread when the closure
/// returns, exactly matching the rationale in the reference implementation.
/// The condvar-published value is the lightweight [`EventLoopHandle`], not an
/// owning pointer.
pub struct EventLoopThread {
    published: Arc<Published>,
    join_handle: Option<JoinHandle<()>>,
}

impl EventLoopThread {
    pub fn new() -> EventLoopThread {
        EventLoopThread {
            published: Arc::new(Published::default()),
            join_handle: None,
        }
    }

    /// Spawns the thread, waits for its `EventLoop` to be constructed (and
    /// `init` to have run on it), and returns a handle to it.
    pub fn start_loop(
        &mut self,
        name: impl Into<String>,
        init: impl FnOnce(&EventLoop) + Send + 'static,
    ) -> EventLoopHandle {
        let published = self.published.clone();
        let name = name.into();

        let join_handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let loop_ = EventLoop::new().unwrap_or_else(|err| {
                    panic!("EventLoopThread {name}: failed to create EventLoop: {err}")
                });
                init(&loop_);
                {
                    let mut guard = published.mutex.lock().unwrap();
                    *guard = Some(loop_.handle());
                    published.condvar.notify_one();
                }
                loop_.run();
            })
            .expect("failed to spawn event loop thread");

        self.join_handle = Some(join_handle);

        let guard = self.published.mutex.lock().unwrap();
        let guard = self
            .published
            .condvar
            .wait_while(guard, |handle| handle.is_none())
            .unwrap();
        guard.expect("condvar woke with no published handle")
    }
}

impl Default for EventLoopThread {
    fn default() -> EventLoopThread {
        EventLoopThread::new()
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        let handle = *self.published.mutex.lock().unwrap();
        if let Some(handle) = handle {
            handle.quit();
        }
        if let Some(join_handle) = self.join_handle.take() {
            let _ = join_handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn start_loop_publishes_a_usable_handle() {
        let mut thread = EventLoopThread::new();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let handle = thread.start_loop("test-worker", move |loop_| {
            assert!(loop_.is_in_loop_thread());
            ran2.store(true, Ordering::SeqCst);
        });
        assert!(ran.load(Ordering::SeqCst));
        assert!(!handle.is_in_loop_thread());
    }

    #[test]
    fn drop_quits_the_worker_loop() {
        let thread = EventLoopThread::new();
        drop(thread);
    }
}
