//! Raw, non-blocking socket helpers shared by [`Acceptor`](crate::acceptor::Acceptor)
//! and [`TcpConnection`](crate::tcp_connection::TcpConnection).

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};

use crate::inet_addr::InetAddr;

/// An owned, non-blocking socket fd. Closes on drop exactly once.
#[derive(Debug)]
pub struct Socket {
    fd: RawFd,
}

impl Socket {
    pub fn new(fd: RawFd) -> Socket {
        Socket { fd }
    }

    /// `socket(AF_INET, SOCK_STREAM | SOCK_NONBLOCK | SOCK_CLOEXEC, IPPROTO_TCP)`.
    /// Failure here is a fatal programmer/environment error, matching the
    /// reference implementation's `LOG_FATAL`.
    pub fn create_nonblocking(domain: libc::c_int) -> Socket {
        let fd = unsafe {
            libc::socket(
                domain,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                libc::IPPROTO_TCP,
            )
        };
        if fd < 0 {
            panic!(
                "Socket::create_nonblocking failed: {}",
                io::Error::last_os_error()
            );
        }
        Socket { fd }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn set_reuse_addr(&self, on: bool) {
        set_bool_opt(self.fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, on);
    }

    pub fn set_reuse_port(&self, on: bool) {
        set_bool_opt(self.fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, on);
    }

    pub fn set_tcp_no_delay(&self, on: bool) {
        set_bool_opt(self.fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, on);
    }

    pub fn set_keep_alive(&self, on: bool) {
        set_bool_opt(self.fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, on);
    }

    pub fn bind(&self, addr: &InetAddr) -> io::Result<()> {
        let (raw, len) = sockaddr_from(addr.socket_addr());
        syscall!(bind(self.fd, &raw as *const _ as *const libc::sockaddr, len)).map(|_| ())
    }

    pub fn listen(&self) -> io::Result<()> {
        syscall!(listen(self.fd, libc::SOMAXCONN)).map(|_| ())
    }

    /// `accept4` with `SOCK_NONBLOCK | SOCK_CLOEXEC` on the accepted fd.
    /// Returns `Ok(None)` on `WouldBlock`.
    pub fn accept(&self) -> io::Result<Option<(Socket, InetAddr)>> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

        let fd = unsafe {
            libc::accept4(
                self.fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };

        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err);
        }

        let peer = sockaddr_to_inet(&storage)?;
        Ok(Some((Socket::new(fd), peer)))
    }

    /// `shutdown(SHUT_WR)`. Errors are the caller's to log; a failure here
    /// typically means the peer already closed.
    pub fn shutdown_write(&self) -> io::Result<()> {
        syscall!(shutdown(self.fd, libc::SHUT_WR)).map(|_| ())
    }

    pub fn local_addr(&self) -> io::Result<InetAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        syscall!(getsockname(
            self.fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        ))?;
        sockaddr_to_inet(&storage)
    }

    pub fn peer_addr(&self) -> io::Result<InetAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        syscall!(getpeername(
            self.fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        ))?;
        sockaddr_to_inet(&storage)
    }

    /// `getsockopt(SOL_SOCKET, SO_ERROR)`, used by `TcpConnection::handle_error`
    /// to find out why the multiplexer reported `EPOLLERR`.
    pub fn socket_error(&self) -> io::Error {
        let mut err: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        let res = unsafe {
            libc::getsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut err as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if res < 0 {
            io::Error::last_os_error()
        } else {
            io::Error::from_raw_os_error(err)
        }
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl std::os::unix::io::IntoRawFd for Socket {
    /// Hands the fd to the caller without running `Drop`, so e.g.
    /// `TcpConnection::new` can wrap it in its own `Socket` without a
    /// double-close.
    fn into_raw_fd(self) -> RawFd {
        let fd = self.fd;
        mem::forget(self);
        fd
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

fn set_bool_opt(fd: RawFd, level: libc::c_int, name: libc::c_int, on: bool) {
    let value: libc::c_int = if on { 1 } else { 0 };
    let res = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if res < 0 {
        log::warn!(
            "setsockopt({level}, {name}) failed on fd {fd}: {}",
            io::Error::last_os_error()
        );
    }
}

fn sockaddr_from(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
        }
    };
    (storage, len)
}

fn sockaddr_to_inet(storage: &libc::sockaddr_storage) -> io::Result<InetAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(u32::from_ne_bytes(sin.sin_addr.s_addr.to_ne_bytes()));
            let port = u16::from_be(sin.sin_port);
            Ok(InetAddr::new(SocketAddr::new(ip.into(), port)))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            let port = u16::from_be(sin6.sin6_port);
            Ok(InetAddr::new(SocketAddr::new(ip.into(), port)))
        }
        family => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported address family {family}"),
        )),
    }
}

/// Zero-copy file-to-socket transfer, used by
/// [`TcpConnection::send_file`](crate::tcp_connection::TcpConnection::send_file).
pub fn send_file(out_fd: RawFd, in_fd: RawFd, offset: &mut i64, count: usize) -> io::Result<usize> {
    let sent = unsafe { libc::sendfile(out_fd, in_fd, offset, count) };
    if sent < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(0);
        }
        return Err(err);
    }
    Ok(sent as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_an_ipv4_address() {
        let addr: SocketAddr = "127.0.0.1:4242".parse().unwrap();
        let (storage, len) = sockaddr_from(addr);
        assert_eq!(len as usize, mem::size_of::<libc::sockaddr_in>());
        let back = sockaddr_to_inet(&storage).unwrap();
        assert_eq!(back.socket_addr(), addr);
    }

    #[test]
    fn round_trips_an_ipv6_address() {
        let addr: SocketAddr = "[::1]:4242".parse().unwrap();
        let (storage, len) = sockaddr_from(addr);
        assert_eq!(len as usize, mem::size_of::<libc::sockaddr_in6>());
        let back = sockaddr_to_inet(&storage).unwrap();
        assert_eq!(back.socket_addr(), addr);
    }

    #[test]
    fn create_bind_listen_accept_would_block() {
        let socket = Socket::create_nonblocking(libc::AF_INET);
        socket.set_reuse_addr(true);
        socket.set_reuse_port(true);
        let addr = InetAddr::new("127.0.0.1:0".parse().unwrap());
        socket.bind(&addr).expect("bind");
        socket.listen().expect("listen");
        assert!(matches!(socket.accept(), Ok(None)));
    }
}
