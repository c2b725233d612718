//! A reactor-style TCP networking runtime built around "one event loop per
//! thread": event loops, readiness channels, an epoll-backed multiplexer, a
//! timer queue driven by a single kernel timer descriptor, a pool of worker
//! loops assigned via consistent hashing, and a buffered TCP connection state
//! machine.
//!
//! The pieces are meant to be composed through [`TcpServer`], which wires an
//! [`Acceptor`] to an [`EventLoopThreadPool`] and hands off each accepted
//! connection to a [`TcpConnection`] running on one of the pool's loops.

#![cfg(unix)]

#[macro_use]
mod macros;

pub mod acceptor;
pub mod buffer;
pub mod channel;
pub mod consistent_hash;
pub mod event_loop;
pub mod event_loop_thread;
pub mod event_loop_thread_pool;
pub mod inet_addr;
pub mod poller;
pub mod socket;
pub mod tcp_connection;
pub mod tcp_server;
pub mod timer;
pub mod timer_queue;
pub mod timestamp;

pub use acceptor::Acceptor;
pub use buffer::Buffer;
pub use channel::Channel;
pub use consistent_hash::ConsistentHash;
pub use event_loop::{EventLoop, EventLoopHandle};
pub use event_loop_thread::EventLoopThread;
pub use event_loop_thread_pool::EventLoopThreadPool;
pub use inet_addr::InetAddr;
pub use poller::{EpollPoller, Poller};
pub use tcp_connection::TcpConnection;
pub use tcp_server::{ServerOptions, TcpServer};
pub use timer::{Timer, TimerId};
pub use timer_queue::TimerQueue;
pub use timestamp::Timestamp;
