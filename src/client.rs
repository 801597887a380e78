//! TCP client façade: one connector, at most one live connection.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, error, warn};

use crate::connection::{ConnectCallback, MessageCallback, TcpConnection, WriteCompleteCallback};
use crate::connector::Connector;
use crate::error::Error;
use crate::event_loop::LoopHandle;
use crate::socket;

pub struct TcpClient {
    me: Weak<TcpClient>,
    owner: LoopHandle,
    connector: Arc<Connector>,
    retry: AtomicBool,
    intent: AtomicBool,
    next_conn_id: AtomicU64,
    on_connect: Mutex<Option<ConnectCallback>>,
    on_message: Mutex<Option<MessageCallback>>,
    on_write_complete: Mutex<Option<WriteCompleteCallback>>,
    // Guarded because disconnect() and friends may run on any thread.
    connection: Mutex<Option<Arc<TcpConnection>>>,
}

impl TcpClient {
    pub fn new(owner: LoopHandle, addr: &str) -> Result<Arc<TcpClient>, Error> {
        let connector = Connector::new(owner.clone(), addr)?;
        let client = Arc::new_cyclic(|me| TcpClient {
            me: me.clone(),
            owner,
            connector,
            retry: AtomicBool::new(false),
            intent: AtomicBool::new(true),
            next_conn_id: AtomicU64::new(1),
            on_connect: Mutex::new(None),
            on_message: Mutex::new(None),
            on_write_complete: Mutex::new(None),
            connection: Mutex::new(None),
        });

        let weak = client.me.clone();
        client.connector.set_on_connected(Arc::new(move |fd| {
            if let Some(client) = weak.upgrade() {
                client.new_connection(fd);
            } else {
                unsafe {
                    libc::close(fd);
                }
            }
        }));
        Ok(client)
    }

    /// Reconnect automatically (with the connector's backoff) after an
    /// established connection drops.
    pub fn set_retry(&self, retry: bool) {
        self.retry.store(retry, Ordering::Release);
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

    /// The live connection, if any.
    pub fn connection(&self) -> Option<Arc<TcpConnection>> {
        self.connection.lock().unwrap().clone()
    }

    pub fn connect(&self) {
        self.intent.store(true, Ordering::Release);
        self.connector.start();
    }

    /// Write-shutdown the live connection; in-flight output is flushed
    /// before the FIN goes out. No reconnect follows.
    pub fn disconnect(&self) {
        self.intent.store(false, Ordering::Release);
        let conn = self.connection.lock().unwrap().clone();
        if let Some(conn) = conn {
            conn.shutdown_write();
        }
    }

    /// Abandon connecting: clear the intent and cancel any pending retry.
    pub fn stop(&self) {
        self.intent.store(false, Ordering::Release);
        self.connector.stop();
    }

    /// Connector callback, runs on the owning loop.
    fn new_connection(&self, fd: RawFd) {
        let peer_addr = match socket::peer_addr(fd) {
            Ok(addr) => addr,
            Err(e) => {
                error!("getpeername: {e}");
                unsafe {
                    libc::close(fd);
                }
                return;
            }
        };
        let local_addr = match socket::local_addr(fd) {
            Ok(addr) => addr,
            Err(e) => {
                error!("getsockname: {e}");
                unsafe {
                    libc::close(fd);
                }
                return;
            }
        };
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("{local_addr}-{peer_addr}#{id}");

        let conn = TcpConnection::new(self.owner.clone(), name, fd, local_addr, peer_addr);
        if let Err(e) = conn.set_tcp_nodelay(true) {
            warn!(conn = %conn.name(), "TCP_NODELAY: {e}");
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
            if let Some(client) = weak.upgrade() {
                client.remove_connection(conn);
            }
        }));

        *self.connection.lock().unwrap() = Some(conn.clone());
        conn.connect_established();
    }

    /// Close hook: clear the slot, tear the connection down on the loop,
    /// and dial again when retry is on and the intent still stands.
    fn remove_connection(&self, conn: &Arc<TcpConnection>) {
        debug!(conn = %conn.name(), "connection is down");
        *self.connection.lock().unwrap() = None;

        let conn = conn.clone();
        self.owner.queue_in_loop(move || conn.connect_destroyed());

        if self.retry.load(Ordering::Acquire) && self.intent.load(Ordering::Acquire) {
            self.connector.restart();
        }
    }
}
