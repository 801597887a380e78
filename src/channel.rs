//! Per-fd event channel: one fd, an interest mask, the mask the kernel last
//! returned, and up to four callbacks.
//!
//! Channels are loop-local: they are created, mutated and dispatched only on
//! the owning loop's thread. Interest mutators take the owning loop's poller
//! so every mask change is pushed to epoll immediately.

use std::cell::{Cell, RefCell};
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::time::SystemTime;

use tracing::warn;

use crate::poller::Poller;

pub(crate) const EVENT_NONE: u32 = 0;
pub(crate) const EVENT_READ: u32 = (libc::EPOLLIN | libc::EPOLLPRI) as u32;
pub(crate) const EVENT_WRITE: u32 = libc::EPOLLOUT as u32;

const EVENT_IN: u32 = libc::EPOLLIN as u32;
const EVENT_PRI: u32 = libc::EPOLLPRI as u32;
const EVENT_OUT: u32 = libc::EPOLLOUT as u32;
const EVENT_HUP: u32 = libc::EPOLLHUP as u32;
const EVENT_RDHUP: u32 = libc::EPOLLRDHUP as u32;
const EVENT_ERR: u32 = libc::EPOLLERR as u32;
const EVENT_NVAL: u32 = libc::POLLNVAL as u32;

/// Where the channel stands with its poller's epoll set.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Registration {
    /// Never handed to epoll_ctl.
    New,
    /// Registered with a non-empty mask.
    Added,
    /// Previously added, currently carries an empty mask.
    Deleted,
}

pub(crate) type ReadCallback = Box<dyn FnMut(SystemTime)>;
pub(crate) type EventCallback = Box<dyn FnMut()>;

pub(crate) struct Channel {
    // Self-reference so interest mutators can hand the poller an owned Rc
    // for its registry.
    me: Weak<Channel>,
    fd: RawFd,
    events: Cell<u32>,
    revents: Cell<u32>,
    registration: Cell<Registration>,
    read_cb: RefCell<Option<ReadCallback>>,
    write_cb: RefCell<Option<EventCallback>>,
    close_cb: RefCell<Option<EventCallback>>,
    error_cb: RefCell<Option<EventCallback>>,
}

impl Channel {
    pub(crate) fn new(fd: RawFd) -> Rc<Channel> {
        Rc::new_cyclic(|me| Channel {
            me: me.clone(),
            fd,
            events: Cell::new(EVENT_NONE),
            revents: Cell::new(0),
            registration: Cell::new(Registration::New),
            read_cb: RefCell::new(None),
            write_cb: RefCell::new(None),
            close_cb: RefCell::new(None),
            error_cb: RefCell::new(None),
        })
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn events(&self) -> u32 {
        self.events.get()
    }

    pub(crate) fn set_revents(&self, revents: u32) {
        self.revents.set(revents);
    }

    pub(crate) fn registration(&self) -> Registration {
        self.registration.get()
    }

    pub(crate) fn set_registration(&self, r: Registration) {
        self.registration.set(r);
    }

    pub(crate) fn set_read_callback(&self, cb: ReadCallback) {
        *self.read_cb.borrow_mut() = Some(cb);
    }

    pub(crate) fn set_write_callback(&self, cb: EventCallback) {
        *self.write_cb.borrow_mut() = Some(cb);
    }

    pub(crate) fn set_close_callback(&self, cb: EventCallback) {
        *self.close_cb.borrow_mut() = Some(cb);
    }

    pub(crate) fn set_error_callback(&self, cb: EventCallback) {
        *self.error_cb.borrow_mut() = Some(cb);
    }

    pub(crate) fn enable_reading(&self, poller: &Poller) {
        self.events.set(self.events.get() | EVENT_READ);
        self.update(poller);
    }

    pub(crate) fn enable_writing(&self, poller: &Poller) {
        self.events.set(self.events.get() | EVENT_WRITE);
        self.update(poller);
    }

    pub(crate) fn disable_writing(&self, poller: &Poller) {
        self.events.set(self.events.get() & !EVENT_WRITE);
        self.update(poller);
    }

    pub(crate) fn disable_all(&self, poller: &Poller) {
        self.events.set(EVENT_NONE);
        self.update(poller);
    }

    fn update(&self, poller: &Poller) {
        let me = self.me.upgrade().expect("channel outside an Rc");
        poller.update_channel(&me);
    }

    pub(crate) fn is_writing(&self) -> bool {
        self.events.get() & EVENT_WRITE != 0
    }

    pub(crate) fn is_none_event(&self) -> bool {
        self.events.get() == EVENT_NONE
    }

    /// Dispatch the events the kernel returned for this channel.
    ///
    /// Order matters: hang-up without pending input routes to the close
    /// callback first; errors fire before reads so a callback observing the
    /// error can tear down before consuming stale data.
    pub(crate) fn handle_event(&self, receive_time: SystemTime) {
        let revents = self.revents.get();
        if revents & EVENT_NVAL != 0 {
            warn!(fd = self.fd, "handle_event: POLLNVAL");
        }
        if revents & EVENT_HUP != 0 && revents & EVENT_IN == 0 {
            warn!(fd = self.fd, "handle_event: hang-up");
            if let Some(cb) = self.close_cb.borrow_mut().as_mut() {
                cb();
            }
        }
        if revents & (EVENT_ERR | EVENT_NVAL) != 0
            && let Some(cb) = self.error_cb.borrow_mut().as_mut()
        {
            cb();
        }
        if revents & (EVENT_IN | EVENT_PRI | EVENT_RDHUP) != 0
            && let Some(cb) = self.read_cb.borrow_mut().as_mut()
        {
            cb(receive_time);
        }
        if revents & EVENT_OUT != 0
            && let Some(cb) = self.write_cb.borrow_mut().as_mut()
        {
            cb();
        }
    }
}
