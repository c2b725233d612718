//! A set of worker [`EventLoop`]s plus a consistent-hash ring for stable
//! connection-to-loop assignment.

use std::collections::HashMap;

use crate::consistent_hash::{ConsistentHash, DEFAULT_REPLICAS};
use crate::event_loop::{EventLoop, EventLoopHandle};
use crate::event_loop_thread::EventLoopThread;

pub struct EventLoopThreadPool {
    base_loop: EventLoopHandle,
    name: String,
    started: bool,
    num_threads: usize,
    threads: Vec<EventLoopThread>,
    loops: Vec<EventLoopHandle>,
    thread_name_to_loop: HashMap<String, EventLoopHandle>,
    hash: ConsistentHash,
}

impl EventLoopThreadPool {
    pub fn new(base_loop: EventLoopHandle, name: impl Into<String>) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base_loop,
            name: name.into(),
            started: false,
            num_threads: 0,
            threads: Vec::new(),
            loops: Vec::new(),
            thread_name_to_loop: HashMap::new(),
            hash: ConsistentHash::new(DEFAULT_REPLICAS),
        }
    }

    pub fn set_thread_num(&mut self, num_threads: usize) {
        self.num_threads = num_threads;
    }

    pub fn thread_num(&self) -> usize {
        self.num_threads
    }

    pub fn started(&self) -> bool {
        self.started
    }

    /// Spawns `numThreads` worker loops named `<name>0..N-1`, registering
    /// each with the hash ring once its loop has published. When
    /// `numThreads == 0`, `init` runs once on the base loop instead and the
    /// base loop serves all traffic.
    pub fn start(&mut self, init: impl Fn(&EventLoop) + Clone + Send + 'static) {
        assert!(!self.started, "EventLoopThreadPool::start called twice");
        self.started = true;

        for i in 0..self.num_threads {
            let worker_name = format!("{}{}", self.name, i);
            let mut thread = EventLoopThread::new();
            let init_cb = init.clone();
            let handle = thread.start_loop(worker_name.clone(), move |loop_| init_cb(loop_));
            self.threads.push(thread);
            self.loops.push(handle);
            self.thread_name_to_loop.insert(worker_name.clone(), handle);
            self.hash.add_node(&worker_name);
        }

        if self.num_threads == 0 {
            init(self.base_loop.get());
        }
    }

    /// Returns the worker loop assigned to `key` via the hash ring, falling
    /// back to the base loop if no workers have started.
    pub fn get_next_loop(&self, key: &str) -> EventLoopHandle {
        if self.loops.is_empty() {
            return self.base_loop;
        }
        match self.hash.get_node(key) {
            Some(name) => *self.thread_name_to_loop.get(&name).unwrap_or(&self.base_loop),
            None => self.base_loop,
        }
    }

    pub fn all_loops(&self) -> Vec<EventLoopHandle> {
        if self.loops.is_empty() {
            vec![self.base_loop]
        } else {
            self.loops.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn zero_threads_runs_init_on_base_loop_once() {
        let base = EventLoop::new().expect("EventLoop::new");
        let mut pool = EventLoopThreadPool::new(base.handle(), "test-pool-");
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        pool.start(move |_loop_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(pool.all_loops().len(), 1);
    }

    #[test]
    fn get_next_loop_falls_back_to_base_when_empty() {
        let base = EventLoop::new().expect("EventLoop::new");
        let pool = EventLoopThreadPool::new(base.handle(), "test-pool-");
        let picked = pool.get_next_loop("any-key");
        assert!(picked.is_in_loop_thread());
    }

    #[test]
    fn starting_with_workers_populates_ring_and_loops() {
        let base = EventLoop::new().expect("EventLoop::new");
        let mut pool = EventLoopThreadPool::new(base.handle(), "test-pool-");
        pool.set_thread_num(3);
        pool.start(|_loop_| {});
        assert_eq!(pool.all_loops().len(), 3);

        let picked = pool.get_next_loop("10.0.0.1:9000");
        assert!(pool.all_loops().contains(&picked));
    }
}
