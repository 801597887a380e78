//! Raw socket syscall glue.
//!
//! Every fd created here is non-blocking and close-on-exec from birth
//! (SOCK_NONBLOCK | SOCK_CLOEXEC on socket/accept4); errors are captured at
//! the syscall edge as `io::Error` and surfaced to the caller.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

/// Owner of one socket fd. Close is idempotent; `Drop` is the safety net for
/// paths that never reach an explicit close.
pub(crate) struct Socket {
    fd: AtomicI32,
}

impl Socket {
    pub(crate) fn from_fd(fd: RawFd) -> Socket {
        Socket {
            fd: AtomicI32::new(fd),
        }
    }

    /// Create a non-blocking close-on-exec TCP stream socket for `addr`'s family.
    pub(crate) fn new_stream(addr: &SocketAddr) -> io::Result<Socket> {
        let fd = new_stream_fd(addr)?;
        Ok(Socket::from_fd(fd))
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd.load(Ordering::Relaxed)
    }

    pub(crate) fn bind(&self, addr: &SocketAddr) -> io::Result<()> {
        let (storage, len) = to_sockaddr(addr);
        let ret = unsafe {
            libc::bind(
                self.fd(),
                &storage as *const _ as *const libc::sockaddr,
                len,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub(crate) fn listen(&self) -> io::Result<()> {
        let ret = unsafe { libc::listen(self.fd(), libc::SOMAXCONN) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Accept one connection, non-blocking and close-on-exec atomically.
    pub(crate) fn accept(&self) -> io::Result<(RawFd, SocketAddr)> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let fd = unsafe {
            libc::accept4(
                self.fd(),
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let peer = from_sockaddr(&storage).unwrap_or_else(|| {
            SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), 0)
        });
        Ok((fd, peer))
    }

    pub(crate) fn set_reuse_addr(&self, on: bool) -> io::Result<()> {
        set_bool_opt(self.fd(), libc::SOL_SOCKET, libc::SO_REUSEADDR, on)
    }

    pub(crate) fn set_tcp_nodelay(&self, on: bool) -> io::Result<()> {
        set_bool_opt(self.fd(), libc::IPPROTO_TCP, libc::TCP_NODELAY, on)
    }

    /// Close the fd. Safe to call more than once.
    pub(crate) fn close(&self) {
        let fd = self.fd.swap(-1, Ordering::AcqRel);
        if fd >= 0 {
            unsafe {
                libc::close(fd);
            }
        }
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.close();
    }
}

/// Raw `socket(2)` with the stream + nonblock + cloexec flags.
pub(crate) fn new_stream_fd(addr: &SocketAddr) -> io::Result<RawFd> {
    let domain = if addr.is_ipv4() {
        libc::AF_INET
    } else {
        libc::AF_INET6
    };
    let fd = unsafe {
        libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            libc::IPPROTO_TCP,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

/// Initiate a non-blocking connect. Returns the raw errno (0 on immediate
/// success) so the caller can run the connector's errno partition.
pub(crate) fn connect(fd: RawFd, addr: &SocketAddr) -> i32 {
    let (storage, len) = to_sockaddr(addr);
    let ret = unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if ret == 0 {
        0
    } else {
        io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
    }
}

/// Pop the pending error from SO_ERROR. 0 means the socket is healthy.
pub(crate) fn so_error(fd: RawFd) -> i32 {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if ret < 0 {
        io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
    } else {
        err
    }
}

pub(crate) fn shutdown_write(fd: RawFd) -> io::Result<()> {
    let ret = unsafe { libc::shutdown(fd, libc::SHUT_WR) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let ret =
        unsafe { libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    from_sockaddr(&storage).ok_or_else(|| io::Error::other("unsupported address family"))
}

pub(crate) fn peer_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let ret =
        unsafe { libc::getpeername(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    from_sockaddr(&storage).ok_or_else(|| io::Error::other("unsupported address family"))
}

fn set_bool_opt(fd: RawFd, level: libc::c_int, opt: libc::c_int, on: bool) -> io::Result<()> {
    let val: libc::c_int = if on { 1 } else { 0 };
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            &val as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Pack a `SocketAddr` into stack-allocated sockaddr storage for bind/connect.
pub(crate) fn to_sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sa = &mut storage as *mut _ as *mut libc::sockaddr_in;
            unsafe {
                (*sa).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sa).sin_port = v4.port().to_be();
                (*sa).sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            }
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
        }
        SocketAddr::V6(v6) => {
            let sa = &mut storage as *mut _ as *mut libc::sockaddr_in6;
            unsafe {
                (*sa).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sa).sin6_port = v6.port().to_be();
                (*sa).sin6_flowinfo = v6.flowinfo();
                (*sa).sin6_addr.s6_addr = v6.ip().octets();
                (*sa).sin6_scope_id = v6.scope_id();
            }
            mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
        }
    };
    (storage, len)
}

/// Unpack kernel-filled sockaddr storage (accept4, getsockname, getpeername).
pub(crate) fn from_sockaddr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(sa.sin_addr.s_addr.to_ne_bytes());
            Some(SocketAddr::new(ip.into(), u16::from_be(sa.sin_port)))
        }
        libc::AF_INET6 => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(sa.sin6_addr.s6_addr);
            Some(SocketAddr::new(ip.into(), u16::from_be(sa.sin6_port)))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sockaddr_round_trip_v4() {
        let addr: SocketAddr = "192.168.1.7:4589".parse().unwrap();
        let (storage, _) = to_sockaddr(&addr);
        assert_eq!(from_sockaddr(&storage), Some(addr));
    }

    #[test]
    fn sockaddr_round_trip_v6() {
        let addr: SocketAddr = "[::1]:4589".parse().unwrap();
        let (storage, _) = to_sockaddr(&addr);
        assert_eq!(from_sockaddr(&storage), Some(addr));
    }

    #[test]
    fn bind_ephemeral_and_query() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let sock = Socket::new_stream(&addr).unwrap();
        sock.set_reuse_addr(true).unwrap();
        sock.bind(&addr).unwrap();
        sock.listen().unwrap();

        let bound = local_addr(sock.fd()).unwrap();
        assert!(bound.port() != 0);
        assert_eq!(bound.ip(), addr.ip());
    }

    #[test]
    fn close_is_idempotent() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let sock = Socket::new_stream(&addr).unwrap();
        sock.close();
        sock.close();
        assert_eq!(sock.fd(), -1);
    }
}
