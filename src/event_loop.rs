//! The event loop: one poller, one timer queue, one eventfd wakeup channel
//! and a mutex-guarded pending-task queue, all driven by exactly one thread.
//!
//! `EventLoop` itself is `!Send`; it lives and dies on the thread that built
//! it. Everything cross-thread goes through the cloneable [`LoopHandle`]:
//! task submission, timer scheduling, stop. Submission is lock, push,
//! unlock, write the eventfd; the loop drains a snapshot of the queue after
//! each dispatch phase, so tasks enqueued during a drain run in the next
//! iteration.

use std::cell::Cell;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::channel::Channel;
use crate::error::Error;
use crate::poller::Poller;
use crate::timer::TimerQueue;

const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) type Task = Box<dyn FnOnce() + Send>;

thread_local! {
    static CURRENT_LOOP: Cell<*const EventLoop> = const { Cell::new(std::ptr::null()) };
}

/// Run `f` against the loop currently running on this thread, if any.
pub(crate) fn with_current<R>(f: impl FnOnce(&EventLoop) -> R) -> Option<R> {
    CURRENT_LOOP.with(|cell| {
        let ptr = cell.get();
        if ptr.is_null() {
            None
        } else {
            Some(f(unsafe { &*ptr }))
        }
    })
}

struct CurrentLoopGuard {
    prev: *const EventLoop,
}

impl CurrentLoopGuard {
    fn new(el: &EventLoop) -> CurrentLoopGuard {
        CURRENT_LOOP.with(|cell| {
            let prev = cell.get();
            cell.set(el as *const EventLoop);
            CurrentLoopGuard { prev }
        })
    }
}

impl Drop for CurrentLoopGuard {
    fn drop(&mut self) {
        CURRENT_LOOP.with(|cell| cell.set(self.prev));
    }
}

/// State shared between a loop and its handles.
pub(crate) struct LoopShared {
    name: String,
    wakeup_fd: RawFd,
    tasks: Mutex<Vec<Task>>,
    quit: AtomicBool,
    alive: AtomicBool,
    thread: ThreadId,
    next_timer_id: AtomicU64,
}

impl LoopShared {
    fn alloc_timer_id(&self) -> u64 {
        self.next_timer_id.fetch_add(1, Ordering::Relaxed)
    }
}

pub struct EventLoop {
    shared: Arc<LoopShared>,
    poller: Poller,
    timers: Rc<TimerQueue>,
    poll_timeout: Cell<Duration>,
    looping: Cell<bool>,
}

impl EventLoop {
    /// Build a loop bound to the calling thread. `name` shows up in logs and
    /// derived thread names.
    pub fn new(name: &str) -> Result<EventLoop, Error> {
        let poller = Poller::new()?;

        let timers = TimerQueue::new()?;
        let timer_channel = Channel::new(timers.fd());
        let weak_timers = Rc::downgrade(&timers);
        timer_channel.set_read_callback(Box::new(move |_| {
            if let Some(timers) = weak_timers.upgrade() {
                timers.handle_expired();
            }
        }));
        timer_channel.enable_reading(&poller);

        let wakeup_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wakeup_fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let wakeup_channel = Channel::new(wakeup_fd);
        wakeup_channel.set_read_callback(Box::new(move |_| {
            // Consume the counter so the level-triggered fd goes quiet.
            let mut buf = [0u8; 8];
            unsafe {
                libc::read(wakeup_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len());
            }
        }));
        wakeup_channel.enable_reading(&poller);

        Ok(EventLoop {
            shared: Arc::new(LoopShared {
                name: name.to_string(),
                wakeup_fd,
                tasks: Mutex::new(Vec::new()),
                quit: AtomicBool::new(false),
                alive: AtomicBool::new(true),
                thread: thread::current().id(),
                next_timer_id: AtomicU64::new(1),
            }),
            poller,
            timers,
            poll_timeout: Cell::new(DEFAULT_POLL_TIMEOUT),
            looping: Cell::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// A cloneable cross-thread handle to this loop.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: self.shared.clone(),
        }
    }

    /// Override the default 10 s poll timeout.
    pub fn set_poll_timeout(&self, timeout: Duration) {
        self.poll_timeout.set(timeout);
    }

    /// Run the dispatch loop until [`stop`](EventLoop::stop) (or a handle's
    /// stop) is observed. Dispatch order per iteration: ready channels in
    /// kernel order, then a snapshot of the pending-task queue in FIFO order.
    pub fn run(&self) {
        assert!(!self.looping.get(), "event loop already running");
        assert_eq!(
            thread::current().id(),
            self.shared.thread,
            "event loop must run on its owning thread"
        );
        self.looping.set(true);
        let _guard = CurrentLoopGuard::new(self);
        info!(name = %self.shared.name, "event loop started");

        let timeout_ms = |d: Duration| d.as_millis().min(i32::MAX as u128) as i32;
        let mut active: Vec<Rc<Channel>> = Vec::new();
        while !self.shared.quit.load(Ordering::Acquire) {
            active.clear();
            let receive_time = self
                .poller
                .poll(timeout_ms(self.poll_timeout.get()), &mut active);
            for channel in &active {
                trace!(name = %self.shared.name, fd = channel.fd(), "dispatch");
                channel.handle_event(receive_time);
            }
            self.run_pending_tasks();
        }

        info!(name = %self.shared.name, "event loop stopped");
        self.looping.set(false);
    }

    /// Ask the loop to exit after the current iteration. Callable only from
    /// the owning thread (the type is neither `Send` nor `Sync`); use
    /// [`LoopHandle::stop`] from other threads.
    pub fn stop(&self) {
        self.shared.quit.store(true, Ordering::Release);
    }

    /// Execute `f` immediately: a direct `EventLoop` reference only exists
    /// on the owning thread.
    pub fn run_in_loop(&self, f: impl FnOnce()) {
        f();
    }

    /// Execute `f` during the next drain of the pending-task queue.
    pub fn queue_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        self.handle().queue_in_loop(f);
    }

    /// Run `cb` once at `when`.
    pub fn schedule_at(&self, cb: impl FnMut() + 'static, when: Instant) -> TimerHandle {
        let id = self.shared.alloc_timer_id();
        self.timers.add_task(id, Box::new(cb), when, Duration::ZERO);
        TimerHandle {
            id,
            owner: self.handle(),
        }
    }

    /// Run `cb` once after `delay`.
    pub fn schedule_after(&self, cb: impl FnMut() + 'static, delay: Duration) -> TimerHandle {
        self.schedule_at(cb, Instant::now() + delay)
    }

    /// Run `cb` every `interval`, first at `now + interval`.
    pub fn schedule_every(&self, cb: impl FnMut() + 'static, interval: Duration) -> TimerHandle {
        let id = self.shared.alloc_timer_id();
        self.timers
            .add_task(id, Box::new(cb), Instant::now() + interval, interval);
        TimerHandle {
            id,
            owner: self.handle(),
        }
    }

    pub(crate) fn poller(&self) -> &Poller {
        &self.poller
    }

    pub(crate) fn timers(&self) -> &TimerQueue {
        &self.timers
    }

    fn run_pending_tasks(&self) {
        // Swap out a snapshot so submitters never contend with execution and
        // tasks queued by tasks land in the next drain.
        let tasks = std::mem::take(&mut *self.shared.tasks.lock().unwrap());
        if !tasks.is_empty() {
            trace!(name = %self.shared.name, count = tasks.len(), "running pending tasks");
        }
        for task in tasks {
            task();
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.shared.alive.store(false, Ordering::Release);
        unsafe {
            libc::close(self.shared.wakeup_fd);
        }
    }
}

/// Cross-thread handle to an [`EventLoop`]: submit tasks, schedule timers,
/// wake or stop the loop from any thread.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.shared.thread
    }

    /// Execute `f` on the owning loop: inline when already on its thread,
    /// otherwise enqueued behind a wakeup.
    pub fn run_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            f();
        } else {
            self.queue_in_loop(f);
        }
    }

    /// Enqueue `f` for the loop's next pending-task drain and wake it.
    pub fn queue_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        self.shared.tasks.lock().unwrap().push(Box::new(f));
        self.wakeup();
    }

    /// Write the eventfd so a blocked `epoll_wait` returns.
    pub fn wakeup(&self) {
        if !self.shared.alive.load(Ordering::Acquire) {
            warn!(name = %self.shared.name, "wakeup on a dead loop");
            return;
        }
        let one: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.shared.wakeup_fd,
                &one as *const u64 as *const libc::c_void,
                8,
            )
        };
        if ret < 0 {
            warn!(name = %self.shared.name, "wakeup write: {}", io::Error::last_os_error());
        }
    }

    /// Ask the loop to exit; wakes it when called from another thread.
    pub fn stop(&self) {
        self.shared.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Run `cb` once at `when` on the owning loop.
    pub fn schedule_at(&self, cb: impl FnMut() + Send + 'static, when: Instant) -> TimerHandle {
        let id = self.shared.alloc_timer_id();
        self.exec(move |el| el.timers().add_task(id, Box::new(cb), when, Duration::ZERO));
        TimerHandle {
            id,
            owner: self.clone(),
        }
    }

    /// Run `cb` once after `delay` on the owning loop.
    pub fn schedule_after(&self, cb: impl FnMut() + Send + 'static, delay: Duration) -> TimerHandle {
        self.schedule_at(cb, Instant::now() + delay)
    }

    /// Run `cb` every `interval` on the owning loop, first at `now + interval`.
    pub fn schedule_every(&self, cb: impl FnMut() + Send + 'static, interval: Duration) -> TimerHandle {
        let id = self.shared.alloc_timer_id();
        let when = Instant::now() + interval;
        self.exec(move |el| el.timers().add_task(id, Box::new(cb), when, interval));
        TimerHandle {
            id,
            owner: self.clone(),
        }
    }

    /// Run `f` with the owning `EventLoop`: inline when this thread is
    /// currently running that loop, otherwise as a pending task.
    pub(crate) fn exec(&self, f: impl FnOnce(&EventLoop) + Send + 'static) {
        if self.is_in_loop_thread() {
            let inline = CURRENT_LOOP.with(|cell| {
                let ptr = cell.get();
                if ptr.is_null() {
                    return false;
                }
                let el = unsafe { &*ptr };
                Arc::ptr_eq(&el.shared, &self.shared)
            });
            if inline {
                CURRENT_LOOP.with(|cell| {
                    let el = unsafe { &*cell.get() };
                    f(el);
                });
                return;
            }
        }
        self.queue_in_loop(move || {
            let ran = with_current(|el| f(el));
            if ran.is_none() {
                debug!("loop task dropped: no running loop on this thread");
            }
        });
    }
}

/// Cancellable handle for a scheduled timer.
#[derive(Clone)]
pub struct TimerHandle {
    id: u64,
    owner: LoopHandle,
}

impl TimerHandle {
    /// Cancel the timer. Idempotent, safe from any thread; a cancel issued
    /// on the owning thread (for example inside another timer's callback)
    /// takes effect immediately.
    pub fn cancel(&self) {
        let id = self.id;
        self.owner.exec(move |el| el.timers().cancel(id));
    }
}
