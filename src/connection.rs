//! The user-facing per-connection object: a socket, an inbound and an
//! outbound buffer, and a monotonic state machine
//! Connecting → Connected → Disconnecting → Disconnected.
//!
//! A connection is shared as `Arc<TcpConnection>` (the owning server or
//! client holds one across threads) but its buffers and channel interest are
//! mutated only on the owning loop's thread. The channel's callbacks capture
//! the `Arc`; the connection reaches its channel back through the running
//! loop's registry, which keeps the ownership graph acyclic.

use std::any::Any;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::SystemTime;

use tracing::{debug, error, trace, warn};

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::error::Error;
use crate::event_loop::{LoopHandle, with_current};
use crate::socket::{self, Socket};

/// Connection lifecycle states, in order. Transitions never go backwards and
/// `Disconnecting` may be skipped.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ConnState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl ConnState {
    fn from_u8(v: u8) -> ConnState {
        match v {
            0 => ConnState::Connecting,
            1 => ConnState::Connected,
            2 => ConnState::Disconnecting,
            _ => ConnState::Disconnected,
        }
    }
}

/// Fired on establishment and again on teardown; dispatch on `state()`.
pub type ConnectCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
/// Fired when inbound data arrives, with the inbound buffer and receive time.
pub type MessageCallback = Arc<dyn Fn(&Arc<TcpConnection>, &mut Buffer, SystemTime) + Send + Sync>;
/// Fired (via a pending task, never inline) when the outbound buffer drains.
pub type WriteCompleteCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
pub(crate) type CloseCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    on_connect: Option<ConnectCallback>,
    on_message: Option<MessageCallback>,
    on_write_complete: Option<WriteCompleteCallback>,
    on_close: Option<CloseCallback>,
}

struct ConnIo {
    inbound: Buffer,
    outbound: Buffer,
}

pub struct TcpConnection {
    me: Weak<TcpConnection>,
    owner: LoopHandle,
    name: String,
    sock: Socket,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    state: AtomicU8,
    close_fired: AtomicBool,
    io: Mutex<ConnIo>,
    callbacks: Mutex<Callbacks>,
    context: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
}

impl TcpConnection {
    pub(crate) fn new(
        owner: LoopHandle,
        name: String,
        fd: RawFd,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Arc<TcpConnection> {
        debug!(name = %name, fd, peer = %peer_addr, "new connection");
        Arc::new_cyclic(|me| TcpConnection {
            me: me.clone(),
            owner,
            name,
            sock: Socket::from_fd(fd),
            local_addr,
            peer_addr,
            state: AtomicU8::new(ConnState::Connecting as u8),
            close_fired: AtomicBool::new(false),
            io: Mutex::new(ConnIo {
                inbound: Buffer::new(),
                outbound: Buffer::new(),
            }),
            callbacks: Mutex::new(Callbacks::default()),
            context: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handle to the loop that owns this connection.
    pub fn event_loop(&self) -> &LoopHandle {
        &self.owner
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    pub fn is_disconnected(&self) -> bool {
        self.state() == ConnState::Disconnected
    }

    pub fn set_on_connect(&self, cb: ConnectCallback) {
        self.callbacks.lock().unwrap().on_connect = Some(cb);
    }

    pub fn set_on_message(&self, cb: MessageCallback) {
        self.callbacks.lock().unwrap().on_message = Some(cb);
    }

    pub fn set_on_write_complete(&self, cb: WriteCompleteCallback) {
        self.callbacks.lock().unwrap().on_write_complete = Some(cb);
    }

    pub(crate) fn set_on_close(&self, cb: CloseCallback) {
        self.callbacks.lock().unwrap().on_close = Some(cb);
    }

    /// Stash an opaque per-connection value. Mutate it only from the owning
    /// loop's thread.
    pub fn set_context(&self, ctx: Arc<dyn Any + Send + Sync>) {
        *self.context.lock().unwrap() = Some(ctx);
    }

    pub fn context(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.context.lock().unwrap().clone()
    }

    pub fn set_tcp_nodelay(&self, on: bool) -> Result<(), Error> {
        self.sock.set_tcp_nodelay(on)?;
        Ok(())
    }

    /// Inspect the inbound buffer on the owning loop's thread.
    pub fn with_inbound<R>(&self, f: impl FnOnce(&mut Buffer) -> R) -> R {
        f(&mut self.io.lock().unwrap().inbound)
    }

    /// Inspect the outbound buffer on the owning loop's thread.
    pub fn with_outbound<R>(&self, f: impl FnOnce(&mut Buffer) -> R) -> R {
        f(&mut self.io.lock().unwrap().outbound)
    }

    /// Write from the owning loop's thread. Tries a direct syscall when
    /// nothing is queued; a partial write parks the remainder in the
    /// outbound buffer and enables write interest. Returns the bytes written
    /// synchronously.
    pub fn write(&self, data: &[u8]) -> Result<usize, Error> {
        if self.state() != ConnState::Connected {
            return Err(Error::NotConnected);
        }
        if data.is_empty() {
            return Ok(0);
        }

        let fd = self.sock.fd();
        let channel_writing = self.channel_is_writing();
        let mut sent = 0;
        let mut enable_writing = false;
        let mut completed = false;
        {
            let mut io = self.io.lock().unwrap();
            if !channel_writing && io.outbound.readable_bytes() == 0 {
                let n =
                    unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
                if n < 0 {
                    let err = io::Error::last_os_error();
                    match err.raw_os_error() {
                        Some(libc::EAGAIN) | Some(libc::EINTR) => {}
                        _ => {
                            error!(name = %self.name, "write error: {err}");
                            return Err(err.into());
                        }
                    }
                } else {
                    sent = n as usize;
                }
                if sent == data.len() {
                    completed = true;
                } else {
                    trace!(name = %self.name, sent, total = data.len(), "partial write");
                }
            }
            if sent < data.len() {
                io.outbound.write(&data[sent..]);
                enable_writing = !channel_writing;
            }
        }

        if enable_writing {
            self.with_channel(|channel, poller| channel.enable_writing(poller));
        }
        if completed {
            self.queue_write_complete();
        }
        Ok(sent)
    }

    /// Post a write onto the owning loop; safe from any thread. A write
    /// error is reported through the connection's error path.
    pub fn async_write(&self, data: Vec<u8>) -> Result<(), Error> {
        self.async_write_with(data, |conn, result| {
            if let Err(e) = result {
                error!(name = %conn.name, "async write error: {e}");
            }
        })
    }

    /// Post a write onto the owning loop and invoke `cb` with the result.
    pub fn async_write_with<F>(&self, data: Vec<u8>, cb: F) -> Result<(), Error>
    where
        F: FnOnce(&Arc<TcpConnection>, Result<usize, Error>) + Send + 'static,
    {
        if self.state() != ConnState::Connected {
            return Err(Error::NotConnected);
        }
        let conn = self.arc();
        self.owner.queue_in_loop(move || {
            let result = conn.write(&data);
            cb(&conn, result);
        });
        Ok(())
    }

    /// Half-close the write side once the outbound buffer drains, so
    /// everything already accepted by `write` reaches the peer before FIN.
    pub fn shutdown_write(&self) {
        let swapped = self.state.compare_exchange(
            ConnState::Connected as u8,
            ConnState::Disconnecting as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if swapped.is_ok() {
            let conn = self.arc();
            self.owner
                .queue_in_loop(move || conn.shutdown_write_in_loop());
        }
    }

    fn shutdown_write_in_loop(&self) {
        // Deferred while write interest is on; the drain path re-runs this.
        if !self.channel_is_writing()
            && let Err(e) = socket::shutdown_write(self.sock.fd())
        {
            error!(name = %self.name, "shutdown: {e}");
        }
    }

    /// Runs once on the owning loop right after construction: flips to
    /// Connected, registers the read-enabled channel, fires `on_connect`.
    pub(crate) fn connect_established(&self) {
        assert_eq!(self.state(), ConnState::Connecting, "{}", self.name);
        self.state
            .store(ConnState::Connected as u8, Ordering::Release);

        let registered = with_current(|el| {
            let channel = Channel::new(self.sock.fd());
            let conn = self.arc();
            channel.set_read_callback(Box::new(move |ts| conn.handle_read(ts)));
            let conn = self.arc();
            channel.set_write_callback(Box::new(move || conn.handle_write()));
            let conn = self.arc();
            channel.set_close_callback(Box::new(move || conn.handle_close()));
            let conn = self.arc();
            channel.set_error_callback(Box::new(move || conn.handle_error_event()));
            channel.enable_reading(el.poller());
        });
        assert!(
            registered.is_some(),
            "connect_established must run on the owning loop"
        );

        let cb = self.callbacks.lock().unwrap().on_connect.clone();
        if let Some(cb) = cb {
            cb(&self.arc());
        }
    }

    /// Runs once on the owning loop after the owner has dropped the
    /// connection: flips to Disconnected, unregisters the channel, fires
    /// `on_connect` one last time, closes the socket.
    pub(crate) fn connect_destroyed(&self) {
        let state = self.state();
        assert!(
            state == ConnState::Connected || state == ConnState::Disconnecting,
            "connect_destroyed on {} in state {state:?}",
            self.name
        );
        self.state
            .store(ConnState::Disconnected as u8, Ordering::Release);

        self.with_channel(|channel, poller| channel.disable_all(poller));

        let cb = self.callbacks.lock().unwrap().on_connect.clone();
        if let Some(cb) = cb {
            cb(&self.arc());
        }

        let fd = self.sock.fd();
        with_current(|el| el.poller().remove_channel(fd));
        self.sock.close();
        debug!(name = %self.name, "connection destroyed");
    }

    fn handle_read(&self, receive_time: SystemTime) {
        let fd = self.sock.fd();
        let mut io = self.io.lock().unwrap();
        match io.inbound.read_from_fd(fd) {
            Ok(0) => {
                drop(io);
                self.handle_close();
            }
            Ok(n) => {
                trace!(name = %self.name, n, "read");
                let cb = self.callbacks.lock().unwrap().on_message.clone();
                if let Some(cb) = cb {
                    // Hand the buffer out without holding the lock so the
                    // callback may call write() on this same connection.
                    let mut inbound = mem::replace(&mut io.inbound, Buffer::with_capacity(0));
                    drop(io);
                    cb(&self.arc(), &mut inbound, receive_time);
                    self.io.lock().unwrap().inbound = inbound;
                }
            }
            Err(e) if matches!(e.raw_os_error(), Some(libc::EAGAIN) | Some(libc::EINTR)) => {}
            Err(e) => {
                drop(io);
                error!(name = %self.name, "read error: {e}");
                self.handle_error(&e);
                self.handle_close();
            }
        }
    }

    fn handle_write(&self) {
        if !self.channel_is_writing() {
            warn!(name = %self.name, "connection is down, no more writing");
            return;
        }
        let fd = self.sock.fd();
        let mut io = self.io.lock().unwrap();
        let (ptr, len) = {
            let data = io.outbound.peek();
            (data.as_ptr(), data.len())
        };
        let n = unsafe { libc::write(fd, ptr as *const libc::c_void, len) };
        if n < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EINTR) => return,
                _ => {
                    drop(io);
                    error!(name = %self.name, "write error: {err}");
                    self.handle_error(&err);
                    self.handle_close();
                    return;
                }
            }
        }
        io.outbound.advance(n as usize);
        if io.outbound.readable_bytes() > 0 {
            trace!(name = %self.name, left = io.outbound.readable_bytes(), "more to write");
            return;
        }
        drop(io);

        self.with_channel(|channel, poller| channel.disable_writing(poller));
        self.queue_write_complete();
        if self.state() == ConnState::Disconnecting {
            self.shutdown_write_in_loop();
        }
    }

    fn handle_close(&self) {
        if self.close_fired.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(name = %self.name, peer = %self.peer_addr, "connection closed by peer");
        self.with_channel(|channel, poller| channel.disable_all(poller));
        let cb = self.callbacks.lock().unwrap().on_close.clone();
        if let Some(cb) = cb {
            cb(&self.arc());
        }
    }

    /// EPOLLERR on the channel: report, do not tear down; the read path
    /// observes the failure next and closes.
    fn handle_error_event(&self) {
        let errno = socket::so_error(self.sock.fd());
        let err = io::Error::from_raw_os_error(errno);
        self.handle_error(&err);
    }

    fn handle_error(&self, err: &io::Error) {
        error!(name = %self.name, peer = %self.peer_addr, "connection error: {err}");
    }

    fn queue_write_complete(&self) {
        let cb = self.callbacks.lock().unwrap().on_write_complete.clone();
        if let Some(cb) = cb {
            let conn = self.arc();
            self.owner.queue_in_loop(move || cb(&conn));
        }
    }

    fn channel_is_writing(&self) -> bool {
        let fd = self.sock.fd();
        with_current(|el| {
            el.poller()
                .channel(fd)
                .map(|channel| channel.is_writing())
                .unwrap_or(false)
        })
        .unwrap_or(false)
    }

    fn with_channel(&self, f: impl FnOnce(&Channel, &crate::poller::Poller)) {
        let fd = self.sock.fd();
        with_current(|el| {
            if let Some(channel) = el.poller().channel(fd) {
                f(&channel, el.poller());
            }
        });
    }

    /// Owned handle to self; valid while any owner still holds the `Arc`,
    /// which is the case for every callback and queued task.
    fn arc(&self) -> Arc<TcpConnection> {
        self.me.upgrade().expect("connection outside an Arc")
    }
}
