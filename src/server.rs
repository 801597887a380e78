//! TCP server façade: one acceptor on the boss loop, a group of worker
//! loops, and a name→connection map owned by the boss loop.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{error, info, warn};

use crate::acceptor::Acceptor;
use crate::connection::{ConnectCallback, MessageCallback, TcpConnection, WriteCompleteCallback};
use crate::error::Error;
use crate::event_loop::LoopHandle;
use crate::loop_group::LoopGroup;
use crate::socket;

pub struct TcpServer {
    me: Weak<TcpServer>,
    boss: LoopHandle,
    name: String,
    acceptor: Arc<Acceptor>,
    group: Arc<LoopGroup>,
    started: AtomicBool,
    tcp_nodelay: AtomicBool,
    next_conn_id: AtomicU64,
    on_connect: Mutex<Option<ConnectCallback>>,
    on_message: Mutex<Option<MessageCallback>>,
    on_write_complete: Mutex<Option<WriteCompleteCallback>>,
    // Only the boss loop touches this map; cross-loop close hooks hop here
    // through the boss handle first.
    connections: Mutex<HashMap<String, Arc<TcpConnection>>>,
}

impl TcpServer {
    /// Bind `addr` (e.g. `"tcp://127.0.0.1:4589"`) and prepare a group of
    /// `worker_count` worker loops. Nothing runs until
    /// [`start`](TcpServer::start).
    pub fn new(
        boss: LoopHandle,
        name: &str,
        addr: &str,
        worker_count: usize,
    ) -> Result<Arc<TcpServer>, Error> {
        let acceptor = Acceptor::new(addr)?;
        let group = Arc::new(LoopGroup::new(worker_count, boss.clone()));
        let server = Arc::new_cyclic(|me| TcpServer {
            me: me.clone(),
            boss,
            name: name.to_string(),
            acceptor,
            group,
            started: AtomicBool::new(false),
            tcp_nodelay: AtomicBool::new(true),
            next_conn_id: AtomicU64::new(1),
            on_connect: Mutex::new(None),
            on_message: Mutex::new(None),
            on_write_complete: Mutex::new(None),
            connections: Mutex::new(HashMap::new()),
        });

        let weak = server.me.clone();
        server.acceptor.set_on_accept(Arc::new(move |fd, peer| {
            if let Some(server) = weak.upgrade() {
                server.new_connection(fd, peer);
            } else {
                unsafe {
                    libc::close(fd);
                }
            }
        }));
        Ok(server)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The bound listening address (useful with an ephemeral port).
    pub fn local_addr(&self) -> SocketAddr {
        self.acceptor.local_addr()
    }

    pub fn set_on_connect(&self, cb: ConnectCallback) {
        *self.on_connect.lock().unwrap() = Some(cb);
    }

    pub fn set_on_message(&self, cb: MessageCallback) {
        *self.on_message.lock().unwrap() = Some(cb);
    }

    pub fn set_on_write_complete(&self, cb: WriteCompleteCallback) {
        *self.on_write_complete.lock().unwrap() = Some(cb);
    }

    /// Whether accepted sockets get TCP_NODELAY. Defaults to on.
    pub fn set_tcp_nodelay(&self, on: bool) {
        self.tcp_nodelay.store(on, Ordering::Release);
    }

    /// Number of live connections (tracked by the boss loop's map).
    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// Start the worker loops and begin listening on the boss loop.
    pub fn start(&self) -> Result<(), Error> {
        if !self.started.swap(true, Ordering::AcqRel) {
            self.group.start()?;
        }
        if !self.acceptor.listening() {
            let acceptor = self.acceptor.clone();
            let name = self.name.clone();
            // Always deferred: start() may be called on the boss thread
            // before the boss loop runs.
            self.boss.queue_in_loop(move || {
                if let Err(e) = acceptor.listen() {
                    error!(server = %name, "listen: {e}");
                }
            });
        }
        Ok(())
    }

    /// Stop the worker loops. Established connections die with their loops;
    /// the boss loop (owned by the caller) is left running.
    pub fn stop(&self) {
        self.group.stop();
    }

    /// Acceptor callback, runs on the boss loop.
    fn new_connection(&self, fd: RawFd, peer_addr: SocketAddr) {
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}-conn-{}", self.name, id);
        let local_addr = match socket::local_addr(fd) {
            Ok(addr) => addr,
            Err(e) => {
                error!(server = %self.name, "getsockname: {e}");
                unsafe {
                    libc::close(fd);
                }
                return;
            }
        };
        info!(server = %self.name, conn = %conn_name, peer = %peer_addr, "new connection");

        let worker = self.group.next();
        let conn = TcpConnection::new(worker.clone(), conn_name.clone(), fd, local_addr, peer_addr);
        if self.tcp_nodelay.load(Ordering::Acquire)
            && let Err(e) = conn.set_tcp_nodelay(true)
        {
            warn!(conn = %conn_name, "TCP_NODELAY: {e}");
        }

        if let Some(cb) = self.on_connect.lock().unwrap().clone() {
            conn.set_on_connect(cb);
        }
        if let Some(cb) = self.on_message.lock().unwrap().clone() {
            conn.set_on_message(cb);
        }
        if let Some(cb) = self.on_write_complete.lock().unwrap().clone() {
            conn.set_on_write_complete(cb);
        }
        let weak = self.me.clone();
        conn.set_on_close(Arc::new(move |conn| {
            if let Some(server) = weak.upgrade() {
                server.remove_connection(conn);
            }
        }));

        self.connections
            .lock()
            .unwrap()
            .insert(conn_name, conn.clone());
        worker.queue_in_loop(move || conn.connect_established());
    }

    /// Close hook: hop to the boss loop to drop the map entry, then to the
    /// worker loop to tear the connection down.
    fn remove_connection(&self, conn: &Arc<TcpConnection>) {
        let server = self.me.upgrade().expect("server outside an Arc");
        let conn = conn.clone();
        self.boss.run_in_loop(move || {
            server.connections.lock().unwrap().remove(conn.name());
            let worker = conn.event_loop().clone();
            worker.queue_in_loop(move || conn.connect_destroyed());
        });
    }
}
