//! Listening socket plus its read channel on the boss loop.

use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, error};

use crate::addr::parse_addr;
use crate::channel::Channel;
use crate::error::Error;
use crate::event_loop::with_current;
use crate::socket::{self, Socket};

pub(crate) type AcceptCallback = Arc<dyn Fn(RawFd, SocketAddr) + Send + Sync>;

pub(crate) struct Acceptor {
    me: Weak<Acceptor>,
    sock: Socket,
    local_addr: SocketAddr,
    listening: AtomicBool,
    on_accept: Mutex<Option<AcceptCallback>>,
}

impl Acceptor {
    /// Create, configure and bind the listening socket. Listening starts
    /// later, on the boss loop, via [`listen`](Acceptor::listen).
    pub(crate) fn new(addr: &str) -> Result<Arc<Acceptor>, Error> {
        let addr = parse_addr(addr)?;
        let sock = Socket::new_stream(&addr)?;
        sock.set_reuse_addr(true)?;
        sock.bind(&addr)?;
        let local_addr = socket::local_addr(sock.fd())?;
        Ok(Arc::new_cyclic(|me| Acceptor {
            me: me.clone(),
            sock,
            local_addr,
            listening: AtomicBool::new(false),
            on_accept: Mutex::new(None),
        }))
    }

    /// The bound address; with port 0 this is the kernel-assigned port.
    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn set_on_accept(&self, cb: AcceptCallback) {
        *self.on_accept.lock().unwrap() = Some(cb);
    }

    pub(crate) fn listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// Start listening and watch for readability. Runs on the boss loop.
    pub(crate) fn listen(&self) -> Result<(), Error> {
        self.listening.store(true, Ordering::Release);
        self.sock.listen()?;
        let registered = with_current(|el| {
            let channel = Channel::new(self.sock.fd());
            let acceptor = self.me.upgrade().expect("acceptor outside an Arc");
            channel.set_read_callback(Box::new(move |_| acceptor.handle_read()));
            channel.enable_reading(el.poller());
        });
        assert!(registered.is_some(), "listen must run on the boss loop");
        debug!(addr = %self.local_addr, "listening");
        Ok(())
    }

    /// One readiness, one accept. Transient errnos return to the loop (level
    /// triggering re-reports a non-empty backlog); anything else is treated
    /// as fatal for the listener.
    fn handle_read(&self) {
        match self.sock.accept() {
            Ok((fd, peer_addr)) => {
                let cb = self.on_accept.lock().unwrap().clone();
                match cb {
                    Some(cb) => cb(fd, peer_addr),
                    None => unsafe {
                        libc::close(fd);
                    },
                }
            }
            Err(e)
                if matches!(
                    e.raw_os_error(),
                    Some(libc::EAGAIN) | Some(libc::EINTR) | Some(libc::ECONNABORTED)
                ) => {}
            Err(e) => {
                error!(addr = %self.local_addr, "accept failed, closing listener: {e}");
                self.listening.store(false, Ordering::Release);
                let fd = self.sock.fd();
                with_current(|el| {
                    if let Some(channel) = el.poller().channel(fd) {
                        channel.disable_all(el.poller());
                    }
                    el.poller().remove_channel(fd);
                });
                self.sock.close();
            }
        }
    }
}
