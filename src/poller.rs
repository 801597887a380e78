//! Thin adapter over epoll: owns the epoll fd, the fd→channel registry and
//! the scratch event array.

use std::collections::HashMap;
use std::io;
use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::SystemTime;

use tracing::{error, trace};

use crate::channel::{Channel, Registration};

const INITIAL_EVENT_CAPACITY: usize = 16;

pub(crate) struct Poller {
    epfd: RawFd,
    channels: RefCell<HashMap<RawFd, Rc<Channel>>>,
    events: RefCell<Vec<libc::epoll_event>>,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Poller> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Poller {
            epfd,
            channels: RefCell::new(HashMap::new()),
            events: RefCell::new(vec![
                libc::epoll_event { events: 0, u64: 0 };
                INITIAL_EVENT_CAPACITY
            ]),
        })
    }

    /// Wait for events for at most `timeout_ms`. Ready channels are appended
    /// to `active` in the order the kernel returned them; the returned
    /// timestamp is the receive time handed to read callbacks.
    pub(crate) fn poll(&self, timeout_ms: i32, active: &mut Vec<Rc<Channel>>) -> SystemTime {
        let mut events = self.events.borrow_mut();
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                events.as_mut_ptr(),
                events.len() as libc::c_int,
                timeout_ms,
            )
        };
        let now = SystemTime::now();

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                error!("epoll_wait: {err}");
            }
            return now;
        }
        if n == 0 {
            trace!(timeout_ms, "epoll_wait: nothing happened");
            return now;
        }

        let n = n as usize;
        trace!(events = n, "epoll_wait returned");
        {
            let channels = self.channels.borrow();
            for ev in &events[..n] {
                let fd = ev.u64 as RawFd;
                if let Some(ch) = channels.get(&fd) {
                    ch.set_revents(ev.events);
                    active.push(ch.clone());
                }
            }
        }
        // A completely full return suggests more events were pending.
        if n == events.len() {
            let doubled = events.len() * 2;
            events.resize(doubled, libc::epoll_event { events: 0, u64: 0 });
        }
        now
    }

    /// Push a channel's interest mask to epoll.
    ///
    /// | registration | mask      | action                          |
    /// |--------------|-----------|---------------------------------|
    /// | new          | any       | register in map, ADD, -> added  |
    /// | deleted      | any       | ADD, -> added                   |
    /// | added        | non-empty | MOD                             |
    /// | added        | empty     | DEL, -> deleted                 |
    pub(crate) fn update_channel(&self, channel: &Rc<Channel>) {
        let fd = channel.fd();
        trace!(fd, events = channel.events(), "update_channel");
        match channel.registration() {
            Registration::New | Registration::Deleted => {
                if channel.registration() == Registration::New {
                    let prev = self.channels.borrow_mut().insert(fd, channel.clone());
                    assert!(prev.is_none(), "fd {fd} already registered");
                } else {
                    debug_assert!(self.channels.borrow().contains_key(&fd));
                }
                channel.set_registration(Registration::Added);
                self.ctl(libc::EPOLL_CTL_ADD, channel);
            }
            Registration::Added => {
                if channel.is_none_event() {
                    self.ctl(libc::EPOLL_CTL_DEL, channel);
                    channel.set_registration(Registration::Deleted);
                } else {
                    self.ctl(libc::EPOLL_CTL_MOD, channel);
                }
            }
        }
    }

    /// Drop a channel from the registry. The channel must have an empty
    /// interest mask (`disable_all` first).
    pub(crate) fn remove_channel(&self, fd: RawFd) {
        let removed = self.channels.borrow_mut().remove(&fd);
        if let Some(channel) = removed {
            assert!(channel.is_none_event(), "removing fd {fd} with live interest");
            if channel.registration() == Registration::Added {
                self.ctl(libc::EPOLL_CTL_DEL, &channel);
            }
            channel.set_registration(Registration::New);
        }
    }

    pub(crate) fn channel(&self, fd: RawFd) -> Option<Rc<Channel>> {
        self.channels.borrow().get(&fd).cloned()
    }

    fn ctl(&self, op: libc::c_int, channel: &Channel) {
        let mut ev = libc::epoll_event {
            events: channel.events(),
            u64: channel.fd() as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd, op, channel.fd(), &mut ev) };
        if ret < 0 {
            error!(
                fd = channel.fd(),
                op,
                "epoll_ctl: {}",
                io::Error::last_os_error()
            );
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    fn dispatch(poller: &Poller, timeout_ms: i32) -> usize {
        let mut active = Vec::new();
        let now = poller.poll(timeout_ms, &mut active);
        for ch in &active {
            ch.handle_event(now);
        }
        active.len()
    }

    #[test]
    fn registration_follows_interest() {
        let poller = Poller::new().unwrap();
        let (mut tx, rx) = UnixStream::pair().unwrap();
        rx.set_nonblocking(true).unwrap();

        let fired = Rc::new(Cell::new(0u32));
        let channel = Channel::new(rx.as_raw_fd());
        let fired2 = fired.clone();
        channel.set_read_callback(Box::new(move |_| fired2.set(fired2.get() + 1)));

        channel.enable_reading(&poller);
        assert_eq!(channel.registration(), Registration::Added);

        tx.write_all(b"x").unwrap();
        assert_eq!(dispatch(&poller, 1000), 1);
        assert_eq!(fired.get(), 1);

        // Level-triggered: unread data keeps reporting.
        assert_eq!(dispatch(&poller, 100), 1);
        assert_eq!(fired.get(), 2);

        // Empty mask transitions to deleted and stops reporting.
        channel.disable_all(&poller);
        assert_eq!(channel.registration(), Registration::Deleted);
        assert_eq!(dispatch(&poller, 50), 0);
        assert_eq!(fired.get(), 2);

        // Re-enabling re-adds the fd to the epoll set.
        channel.enable_reading(&poller);
        assert_eq!(channel.registration(), Registration::Added);
        assert_eq!(dispatch(&poller, 1000), 1);
        assert_eq!(fired.get(), 3);

        channel.disable_all(&poller);
        poller.remove_channel(rx.as_raw_fd());
        assert!(poller.channel(rx.as_raw_fd()).is_none());
    }

    #[test]
    fn write_interest_reports_writable() {
        let poller = Poller::new().unwrap();
        let (tx, _rx) = UnixStream::pair().unwrap();
        tx.set_nonblocking(true).unwrap();

        let writable = Rc::new(Cell::new(false));
        let channel = Channel::new(tx.as_raw_fd());
        let writable2 = writable.clone();
        channel.set_write_callback(Box::new(move || writable2.set(true)));

        channel.enable_writing(&poller);
        assert_eq!(dispatch(&poller, 1000), 1);
        assert!(writable.get());

        channel.disable_writing(&poller);
        assert_eq!(channel.registration(), Registration::Deleted);
        assert_eq!(dispatch(&poller, 50), 0);
    }

    #[test]
    fn peer_close_routes_to_read_for_eof() {
        let poller = Poller::new().unwrap();
        let (tx, rx) = UnixStream::pair().unwrap();
        rx.set_nonblocking(true).unwrap();

        let saw_read = Rc::new(Cell::new(false));
        let channel = Channel::new(rx.as_raw_fd());
        let saw = saw_read.clone();
        channel.set_read_callback(Box::new(move |_| saw.set(true)));
        channel.enable_reading(&poller);

        drop(tx);
        assert_eq!(dispatch(&poller, 1000), 1);
        assert!(saw_read.get());
    }
}
