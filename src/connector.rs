//! Client-side dialer with exponential-backoff retry.
//!
//! Disconnected → Connecting → Connected, falling back to Disconnected on
//! retryable failure. A non-blocking connect that returns EINPROGRESS parks
//! a write-interest channel; write readiness pops SO_ERROR to learn the
//! verdict. On success the channel is removed and the fd handed to the
//! callback, whose owner takes over the socket.

use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::addr::parse_addr;
use crate::channel::Channel;
use crate::error::Error;
use crate::event_loop::{LoopHandle, TimerHandle, with_current};
use crate::socket;

const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(500);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
enum ConnectState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

pub(crate) type ConnectedCallback = Arc<dyn Fn(RawFd) + Send + Sync>;

pub(crate) struct Connector {
    me: Weak<Connector>,
    owner: LoopHandle,
    server_addr: SocketAddr,
    intent: AtomicBool,
    state: AtomicU8,
    retry_delay_ms: AtomicU64,
    retry_timer: Mutex<Option<TimerHandle>>,
    on_connected: Mutex<Option<ConnectedCallback>>,
}

/// Next backoff step: double, capped at 30 s.
fn next_retry_delay(current: Duration) -> Duration {
    (current * 2).min(MAX_RETRY_DELAY)
}

impl Connector {
    pub(crate) fn new(owner: LoopHandle, addr: &str) -> Result<Arc<Connector>, Error> {
        let server_addr = parse_addr(addr)?;
        Ok(Arc::new_cyclic(|me| Connector {
            me: me.clone(),
            owner,
            server_addr,
            intent: AtomicBool::new(false),
            state: AtomicU8::new(ConnectState::Disconnected as u8),
            retry_delay_ms: AtomicU64::new(INITIAL_RETRY_DELAY.as_millis() as u64),
            retry_timer: Mutex::new(None),
            on_connected: Mutex::new(None),
        }))
    }

    /// Owned handle to self for closures; valid while the owning client
    /// holds the `Arc`.
    fn arc(&self) -> Arc<Connector> {
        self.me.upgrade().expect("connector outside an Arc")
    }

    pub(crate) fn set_on_connected(&self, cb: ConnectedCallback) {
        *self.on_connected.lock().unwrap() = Some(cb);
    }

    /// Begin dialing (on the owning loop).
    pub(crate) fn start(&self) {
        self.intent.store(true, Ordering::Release);
        let connector = self.arc();
        self.owner.queue_in_loop(move || connector.connect());
    }

    /// Clear the connect intent and cancel any scheduled retry.
    pub(crate) fn stop(&self) {
        self.intent.store(false, Ordering::Release);
        let timer = self.retry_timer.lock().unwrap().take();
        if let Some(timer) = timer {
            timer.cancel();
        }
    }

    /// Reset the backoff to 500 ms and dial again.
    pub(crate) fn restart(&self) {
        self.intent.store(true, Ordering::Release);
        self.state
            .store(ConnectState::Disconnected as u8, Ordering::Release);
        self.retry_delay_ms
            .store(INITIAL_RETRY_DELAY.as_millis() as u64, Ordering::Release);
        let connector = self.arc();
        self.owner.queue_in_loop(move || connector.connect());
    }

    fn connect(&self) {
        if !self.intent.load(Ordering::Acquire) {
            debug!(addr = %self.server_addr, "connect intent cleared, not dialing");
            return;
        }
        let fd = match socket::new_stream_fd(&self.server_addr) {
            Ok(fd) => fd,
            Err(e) => {
                error!(addr = %self.server_addr, "socket: {e}");
                return;
            }
        };
        let errno = socket::connect(fd, &self.server_addr);
        match errno {
            0 | libc::EINPROGRESS | libc::EINTR | libc::EISCONN => self.connecting(fd),
            libc::EAGAIN
            | libc::EADDRINUSE
            | libc::EADDRNOTAVAIL
            | libc::ECONNREFUSED
            | libc::ENETUNREACH => self.retry(fd),
            _ => {
                // EACCES, EPERM, EAFNOSUPPORT, EALREADY, EBADF, EFAULT,
                // ENOTSOCK and anything unexpected: unrecoverable.
                error!(
                    addr = %self.server_addr,
                    errno,
                    "connect failed with unrecoverable error"
                );
                unsafe {
                    libc::close(fd);
                }
            }
        }
    }

    /// Park a write-interest channel until the kernel decides the connect.
    fn connecting(&self, fd: RawFd) {
        self.state
            .store(ConnectState::Connecting as u8, Ordering::Release);
        let registered = with_current(|el| {
            let channel = Channel::new(fd);
            let connector = self.arc();
            channel.set_write_callback(Box::new(move || connector.handle_write(fd)));
            let connector = self.arc();
            channel.set_error_callback(Box::new(move || connector.handle_error(fd)));
            channel.enable_writing(el.poller());
        });
        assert!(registered.is_some(), "connect must run on the owning loop");
    }

    fn handle_write(&self, fd: RawFd) {
        if self.state.load(Ordering::Acquire) != ConnectState::Connecting as u8 {
            warn!(addr = %self.server_addr, "spurious write readiness while not connecting");
            return;
        }
        self.remove_channel(fd);
        let errno = socket::so_error(fd);
        if errno != 0 {
            warn!(addr = %self.server_addr, errno, "connect finished with SO_ERROR");
            self.retry(fd);
            return;
        }
        self.state
            .store(ConnectState::Connected as u8, Ordering::Release);
        if self.intent.load(Ordering::Acquire) {
            let cb = self.on_connected.lock().unwrap().clone();
            match cb {
                Some(cb) => cb(fd),
                None => unsafe {
                    libc::close(fd);
                },
            }
        } else {
            unsafe {
                libc::close(fd);
            }
        }
    }

    fn handle_error(&self, fd: RawFd) {
        if self.state.load(Ordering::Acquire) != ConnectState::Connecting as u8 {
            return;
        }
        warn!(addr = %self.server_addr, "error while connecting");
        self.remove_channel(fd);
        self.retry(fd);
    }

    fn remove_channel(&self, fd: RawFd) {
        with_current(|el| {
            if let Some(channel) = el.poller().channel(fd) {
                channel.disable_all(el.poller());
            }
            el.poller().remove_channel(fd);
        });
    }

    /// Close the failed socket and re-dial after the current backoff delay.
    fn retry(&self, fd: RawFd) {
        unsafe {
            libc::close(fd);
        }
        self.state
            .store(ConnectState::Disconnected as u8, Ordering::Release);
        if !self.intent.load(Ordering::Acquire) {
            debug!(addr = %self.server_addr, "retry skipped, intent cleared");
            return;
        }
        let delay = Duration::from_millis(self.retry_delay_ms.load(Ordering::Acquire));
        info!(addr = %self.server_addr, delay_ms = delay.as_millis() as u64, "retrying connect");
        let connector = self.arc();
        let timer = self
            .owner
            .schedule_after(move || connector.connect(), delay);
        *self.retry_timer.lock().unwrap() = Some(timer);
        self.retry_delay_ms
            .store(next_retry_delay(delay).as_millis() as u64, Ordering::Release);
    }
}
