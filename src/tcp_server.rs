//! The facade wiring an [`Acceptor`], an [`EventLoopThreadPool`], and the
//! live connection map together: the crate's single entry point for running
//! a server.

use std::collections::HashMap;
use std::os::unix::io::IntoRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::cell::RefCell;

use crate::acceptor::Acceptor;
use crate::buffer::Buffer;
use crate::event_loop::EventLoopHandle;
use crate::event_loop_thread_pool::EventLoopThreadPool;
use crate::inet_addr::InetAddr;
use crate::socket::Socket;
use crate::tcp_connection::{TcpConnection, DEFAULT_HIGH_WATER_MARK};
use crate::timestamp::Timestamp;

type ConnectionCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
type MessageCallback = Arc<dyn Fn(&Arc<TcpConnection>, &mut Buffer, Timestamp) + Send + Sync>;
type WriteCompleteCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
type HighWaterMarkCallback = Arc<dyn Fn(&Arc<TcpConnection>, usize) + Send + Sync>;

/// In-process configuration surface. No CLI or config-file parsing — that is
/// left to callers.
#[derive(Debug, Clone, Copy)]
pub struct ServerOptions {
    pub thread_num: usize,
    pub reuse_port: bool,
    pub high_water_mark: usize,
}

impl ServerOptions {
    pub fn new() -> ServerOptions {
        ServerOptions {
            thread_num: 0,
            reuse_port: false,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
        }
    }

    pub fn thread_num(mut self, n: usize) -> ServerOptions {
        self.thread_num = n;
        self
    }

    pub fn reuse_port(mut self, on: bool) -> ServerOptions {
        self.reuse_port = on;
        self
    }

    pub fn high_water_mark(mut self, bytes: usize) -> ServerOptions {
        self.high_water_mark = bytes;
        self
    }
}

impl Default for ServerOptions {
    fn default() -> ServerOptions {
        ServerOptions::new()
    }
}

/// Owns the base loop's `Acceptor`, an `EventLoopThreadPool`, and a
/// name → connection map mutated only on the base loop. Always held behind
/// an `Arc` (see [`TcpConnection`] for why: the Acceptor's new-connection
/// callback and each connection's close callback both need to call back
/// into `self` from other call stacks, via a [`Weak`]).
pub struct TcpServer {
    self_weak: Weak<TcpServer>,
    loop_: EventLoopHandle,
    name: String,
    acceptor: Acceptor,
    thread_pool: RefCell<EventLoopThreadPool>,
    connection_callback: RefCell<Option<ConnectionCallback>>,
    message_callback: RefCell<Option<MessageCallback>>,
    write_complete_callback: RefCell<Option<WriteCompleteCallback>>,
    high_water_mark_callback: RefCell<Option<HighWaterMarkCallback>>,
    high_water_mark: usize,
    next_conn_id: AtomicU64,
    started: AtomicBool,
    connections: RefCell<HashMap<String, Arc<TcpConnection>>>,
}

impl TcpServer {
    /// Builds (but does not start) an `Acceptor` bound to `listen_addr` and
    /// an unstarted `EventLoopThreadPool` named after `name`.
    pub fn new(
        loop_: EventLoopHandle,
        listen_addr: InetAddr,
        name: impl Into<String>,
        options: ServerOptions,
    ) -> Arc<TcpServer> {
        Arc::new_cyclic(|weak_self| {
            let name = name.into();
            let acceptor = Acceptor::new(loop_, &listen_addr, options.reuse_port);

            let weak = weak_self.clone();
            acceptor.set_new_connection_callback(move |socket, peer| {
                if let Some(server) = weak.upgrade() {
                    server.new_connection(socket, peer);
                } else {
                    log::warn!("TcpServer: accepted connection from {peer} after server was dropped");
                }
            });

            let mut thread_pool = EventLoopThreadPool::new(loop_, format!("{name}-worker-"));
            thread_pool.set_thread_num(options.thread_num);

            TcpServer {
                self_weak: weak_self.clone(),
                loop_,
                name,
                acceptor,
                thread_pool: RefCell::new(thread_pool),
                connection_callback: RefCell::new(None),
                message_callback: RefCell::new(None),
                write_complete_callback: RefCell::new(None),
                high_water_mark_callback: RefCell::new(None),
                high_water_mark: options.high_water_mark,
                next_conn_id: AtomicU64::new(1),
                started: AtomicBool::new(false),
                connections: RefCell::new(HashMap::new()),
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> std::io::Result<InetAddr> {
        self.acceptor.local_addr()
    }

    pub fn set_thread_num(&self, num_threads: usize) {
        self.thread_pool.borrow_mut().set_thread_num(num_threads);
    }

    pub fn set_connection_callback(&self, cb: impl Fn(&Arc<TcpConnection>) + Send + Sync + 'static) {
        *self.connection_callback.borrow_mut() = Some(Arc::new(cb));
    }

    pub fn set_message_callback(
        &self,
        cb: impl Fn(&Arc<TcpConnection>, &mut Buffer, Timestamp) + Send + Sync + 'static,
    ) {
        *self.message_callback.borrow_mut() = Some(Arc::new(cb));
    }

    pub fn set_write_complete_callback(&self, cb: impl Fn(&Arc<TcpConnection>) + Send + Sync + 'static) {
        *self.write_complete_callback.borrow_mut() = Some(Arc::new(cb));
    }

    pub fn set_high_water_mark_callback(
        &self,
        cb: impl Fn(&Arc<TcpConnection>, usize) + Send + Sync + 'static,
    ) {
        *self.high_water_mark_callback.borrow_mut() = Some(Arc::new(cb));
    }

    /// Idempotent: a second call is a no-op, logged at `warn`. May be called
    /// from any thread — the actual `listen()` is posted onto the base loop.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            log::warn!("TcpServer[{}]::start called more than once", self.name);
            return;
        }

        self.thread_pool.borrow_mut().start(|_loop_| {});

        let weak = self.self_weak.clone();
        self.loop_.run_in_loop(move || {
            if let Some(server) = weak.upgrade() {
                server.acceptor.listen();
            }
        });
    }

    /// The `Acceptor`'s new-connection callback; always invoked on the base
    /// loop.
    fn new_connection(&self, socket: Socket, peer: InetAddr) {
        self.loop_.assert_in_loop_thread();
        let io_loop = self
            .thread_pool
            .borrow()
            .get_next_loop(&peer.to_ip_port_string());

        let conn_id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let conn_name = format!("{}-{}#{}", self.name, peer.to_ip_port_string(), conn_id);
        let local_addr = socket.local_addr().unwrap_or(peer);
        let fd = socket.into_raw_fd();

        log::info!(
            "TcpServer[{}] - new connection [{conn_name}] from {peer}",
            self.name
        );

        let conn = TcpConnection::new(io_loop, conn_name.clone(), fd, local_addr, peer);

        if let Some(cb) = self.connection_callback.borrow().clone() {
            conn.set_connection_callback(move |c| cb(c));
        }
        if let Some(cb) = self.message_callback.borrow().clone() {
            conn.set_message_callback(move |c, buf, ts| cb(c, buf, ts));
        }
        if let Some(cb) = self.write_complete_callback.borrow().clone() {
            conn.set_write_complete_callback(move |c| cb(c));
        }
        if let Some(cb) = self.high_water_mark_callback.borrow().clone() {
            conn.set_high_water_mark_callback(move |c, n| cb(c, n), self.high_water_mark);
        }

        let weak_server = self.self_weak.clone();
        conn.set_close_callback(move |c| {
            if let Some(server) = weak_server.upgrade() {
                server.remove_connection(c.clone());
            }
        });

        self.connections.borrow_mut().insert(conn_name, conn.clone());

        let weak_conn = Arc::downgrade(&conn);
        conn.loop_handle().run_in_loop(move || {
            if let Some(conn) = weak_conn.upgrade() {
                conn.connect_established();
            }
        });
    }

    /// Always posted onto the base loop, regardless of which worker loop
    /// owns `conn` — the connection map is only ever mutated here, so no
    /// extra lock is needed around it.
    fn remove_connection(&self, conn: Arc<TcpConnection>) {
        let weak = self.self_weak.clone();
        self.loop_.run_in_loop(move || {
            if let Some(server) = weak.upgrade() {
                server.remove_connection_in_loop(conn);
            }
        });
    }

    fn remove_connection_in_loop(&self, conn: Arc<TcpConnection>) {
        self.loop_.assert_in_loop_thread();
        log::info!(
            "TcpServer[{}] - remove connection [{}]",
            self.name,
            conn.name()
        );
        self.connections.borrow_mut().remove(conn.name());

        // Deferred via `queue_in_loop` (not `run_in_loop`) even when this
        // already runs on the connection's own loop: we're still inside the
        // call chain from that Channel's own event dispatch (handle_close),
        // and tearing the Channel down mid-dispatch is unsafe.
        let io_loop = conn.loop_handle();
        io_loop.queue_in_loop(move || conn.connect_destroyed());
    }
}

unsafe impl Send for TcpServer {}
// `connections`/callback `RefCell`s and `thread_pool` are only ever touched
// on the base loop's thread; the atomics are the only fields another thread
// legitimately touches (`start` may be called off-thread).
unsafe impl Sync for TcpServer {}
