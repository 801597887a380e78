//! muxio - one-loop-per-thread TCP reactor on raw epoll, eventfd and timerfd.
//!
//! A set of event loops, each bound to a single worker thread, dispatching
//! level-triggered readiness events to per-fd handlers. One boss loop
//! accepts connections; a round-robin group of worker loops owns them. All
//! per-connection state is mutated only on the owning loop's thread, so
//! handlers run lock-free; cross-thread work is posted through a
//! mutex-guarded task queue behind an eventfd wakeup, and timers fire from a
//! timerfd-backed queue with FIFO tie-breaking and O(log n) cancellation.
//!
//! # Quick Start
//!
//! ```ignore
//! use muxio::{EventLoop, TcpServer};
//! use std::sync::Arc;
//!
//! let boss = EventLoop::new("echo-boss")?;
//! let server = TcpServer::new(boss.handle(), "echo", "tcp://127.0.0.1:4589", 4)?;
//! server.set_on_message(Arc::new(|conn, buf, _receive_time| {
//!     let data = buf.next_all().to_vec();
//!     let _ = conn.write(&data);
//! }));
//! server.start()?;
//! boss.run();
//! ```
//!
//! Linux only: the reactor talks to epoll, eventfd and timerfd directly.

pub(crate) mod acceptor;
pub mod addr;
pub mod buffer;
pub(crate) mod channel;
pub mod client;
pub mod connection;
pub(crate) mod connector;
pub mod error;
pub mod event_loop;
pub mod loop_group;
pub(crate) mod poller;
pub mod server;
pub(crate) mod socket;
pub(crate) mod timer;

pub use addr::parse_addr;
pub use buffer::Buffer;
pub use client::TcpClient;
pub use connection::{
    ConnState, ConnectCallback, MessageCallback, TcpConnection, WriteCompleteCallback,
};
pub use error::Error;
pub use event_loop::{EventLoop, LoopHandle, TimerHandle};
pub use loop_group::{LoopGroup, LoopThread};
pub use server::TcpServer;
