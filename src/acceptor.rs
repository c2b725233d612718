//! Listening socket + [`Channel`]; turns kernel accept-readiness into
//! `(fd, peer)` pairs for [`TcpServer`](crate::tcp_server::TcpServer).

use std::cell::{Cell, RefCell};

use crate::channel::Channel;
use crate::event_loop::EventLoopHandle;
use crate::inet_addr::InetAddr;
use crate::socket::Socket;

type NewConnectionCallback = Box<dyn FnMut(Socket, InetAddr)>;

pub struct Acceptor {
    loop_: EventLoopHandle,
    accept_socket: Socket,
    accept_channel: Channel,
    new_connection_callback: RefCell<Option<NewConnectionCallback>>,
    listening: Cell<bool>,
}

impl Acceptor {
    pub fn new(loop_: EventLoopHandle, listen_addr: &InetAddr, reuse_port: bool) -> Acceptor {
        let domain = if listen_addr.socket_addr().is_ipv6() {
            libc::AF_INET6
        } else {
            libc::AF_INET
        };
        let accept_socket = Socket::create_nonblocking(domain);
        accept_socket.set_reuse_addr(true);
        accept_socket.set_reuse_port(reuse_port);
        accept_socket
            .bind(listen_addr)
            .unwrap_or_else(|err| panic!("Acceptor: bind({listen_addr}) failed: {err}"));

        let accept_channel = Channel::new(loop_, accept_socket.fd());

        Acceptor {
            loop_,
            accept_socket,
            accept_channel,
            new_connection_callback: RefCell::new(None),
            listening: Cell::new(false),
        }
    }

    pub fn set_new_connection_callback(&self, cb: impl FnMut(Socket, InetAddr) + 'static) {
        *self.new_connection_callback.borrow_mut() = Some(Box::new(cb));
    }

    pub fn is_listening(&self) -> bool {
        self.listening.get()
    }

    pub fn owner_loop(&self) -> EventLoopHandle {
        self.loop_
    }

    pub fn local_addr(&self) -> std::io::Result<InetAddr> {
        self.accept_socket.local_addr()
    }

    /// Wires the real read callback (it needs `&self`'s final address) and
    /// starts listening. Must be called once, after `self` has reached its
    /// final address inside its owner.
    pub fn listen(&self) {
        self.listening.set(true);
        self.accept_socket
            .listen()
            .unwrap_or_else(|err| panic!("Acceptor::listen failed: {err}"));

        let self_ptr = self as *const Acceptor;
        self.accept_channel.set_read_callback(move |_receive_time| {
            // SAFETY: `self` outlives the channel — the channel is removed
            // and the Acceptor torn down together (see `Drop`).
            unsafe { (*self_ptr).handle_read() };
        });
        self.accept_channel.enable_reading();
    }

    fn handle_read(&self) {
        match self.accept_socket.accept() {
            Ok(Some((socket, peer))) => {
                let mut cb = self.new_connection_callback.borrow_mut();
                match cb.as_mut() {
                    Some(cb) => cb(socket, peer),
                    None => log::debug!("Acceptor: no new-connection callback, dropping {peer}"),
                }
            }
            Ok(None) => {}
            Err(err) => log::error!("Acceptor::handle_read accept error: {err}"),
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.accept_channel.disable_all();
        self.accept_channel.remove();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn accepts_a_loopback_connection() {
        let loop_ = EventLoop::new().expect("EventLoop::new");
        let handle = loop_.handle();
        let addr = InetAddr::new("127.0.0.1:0".parse().unwrap());
        let acceptor = Acceptor::new(handle, &addr, true);
        let bound_addr = acceptor.accept_socket.local_addr().expect("local_addr");

        let accepted = Arc::new(AtomicUsize::new(0));
        let accepted2 = accepted.clone();
        acceptor.set_new_connection_callback(move |_socket, _peer| {
            accepted2.fetch_add(1, Ordering::SeqCst);
            handle.get().quit();
        });
        acceptor.listen();
        assert!(acceptor.is_listening());

        let connector = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            std::net::TcpStream::connect(bound_addr.socket_addr()).expect("connect")
        });

        loop_.run();
        connector.join().unwrap();
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }
}
