//! Timer queue: a binary min-heap of timer tasks backed by one timerfd armed
//! to the earliest expiry.
//!
//! Heap order is (expiry, insertion sequence), so tasks scheduled for the
//! same instant fire in the order they were scheduled. Each task tracks its
//! heap slot so cancellation can remove it in O(log n); a task popped but not
//! yet run is still silenced by its canceled flag.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::{error, trace};

const NOT_IN_HEAP: usize = usize::MAX;

/// Arming a timerfd for an expiry in the past would never fire; clamp to a
/// small positive delay instead.
const MIN_ARM_DELAY: Duration = Duration::from_micros(100);

pub(crate) type TimerCallback = Box<dyn FnMut()>;

pub(crate) struct TimerTask {
    id: u64,
    expire: Cell<Instant>,
    interval: Duration,
    repeat: Cell<bool>,
    canceled: Cell<bool>,
    heap_index: Cell<usize>,
    seq: Cell<u64>,
    cb: RefCell<TimerCallback>,
}

impl TimerTask {
    fn new(id: u64, cb: TimerCallback, when: Instant, interval: Duration) -> Rc<TimerTask> {
        Rc::new(TimerTask {
            id,
            expire: Cell::new(when),
            interval,
            repeat: Cell::new(interval > Duration::ZERO),
            canceled: Cell::new(false),
            heap_index: Cell::new(NOT_IN_HEAP),
            seq: Cell::new(0),
            cb: RefCell::new(cb),
        })
    }
}

pub(crate) struct TimerQueue {
    timer_fd: RawFd,
    heap: RefCell<TimerHeap>,
    by_id: RefCell<HashMap<u64, Rc<TimerTask>>>,
    next_seq: Cell<u64>,
}

impl TimerQueue {
    pub(crate) fn new() -> io::Result<Rc<TimerQueue>> {
        let timer_fd = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            )
        };
        if timer_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Rc::new(TimerQueue {
            timer_fd,
            heap: RefCell::new(TimerHeap::new()),
            by_id: RefCell::new(HashMap::new()),
            next_seq: Cell::new(0),
        }))
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.timer_fd
    }

    /// Schedule `cb` for `when`; a non-zero `interval` makes it repeat.
    /// Must run on the owning loop's thread.
    pub(crate) fn add_task(&self, id: u64, cb: TimerCallback, when: Instant, interval: Duration) {
        let task = TimerTask::new(id, cb, when, interval);
        self.by_id.borrow_mut().insert(id, task.clone());
        if self.insert(task) {
            self.reset_timer_fd(when);
        }
    }

    /// Cancel task `id`. Idempotent; also prevents a repeat from re-arming
    /// and an already-popped task from running. Must run on the owning
    /// loop's thread.
    pub(crate) fn cancel(&self, id: u64) {
        let task = self.by_id.borrow_mut().remove(&id);
        if let Some(task) = task {
            trace!(id, "cancel timer");
            task.repeat.set(false);
            task.canceled.set(true);
            let index = task.heap_index.get();
            if index != NOT_IN_HEAP {
                self.heap.borrow_mut().remove(index);
            }
        }
    }

    /// timerfd readability: consume the expiry counter, run everything due,
    /// re-insert live repeats, re-arm to the new earliest expiry.
    pub(crate) fn handle_expired(&self) {
        let mut counter = [0u8; 8];
        let n = unsafe {
            libc::read(
                self.timer_fd,
                counter.as_mut_ptr() as *mut libc::c_void,
                counter.len(),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EAGAIN) {
                error!("timerfd read: {err}");
            }
        }

        let now = Instant::now();
        let expired = {
            let mut heap = self.heap.borrow_mut();
            let mut expired = Vec::new();
            while let Some(task) = heap.top() {
                if task.expire.get() > now {
                    break;
                }
                expired.push(heap.pop().expect("non-empty heap"));
            }
            expired
        };

        for task in &expired {
            if !task.canceled.get() {
                (task.cb.borrow_mut())();
            }
        }

        for task in expired {
            if task.repeat.get() && !task.canceled.get() {
                task.expire.set(now + task.interval);
                self.insert(task);
            } else {
                self.by_id.borrow_mut().remove(&task.id);
            }
        }

        let next = self.heap.borrow().top().map(|t| t.expire.get());
        if let Some(when) = next {
            self.reset_timer_fd(when);
        }
    }

    /// Push into the heap; true when the new task became the earliest expiry
    /// (caller must re-arm the timerfd).
    fn insert(&self, task: Rc<TimerTask>) -> bool {
        let mut heap = self.heap.borrow_mut();
        let earliest_changed = match heap.top() {
            Some(top) => task.expire.get() < top.expire.get(),
            None => true,
        };
        let seq = self.next_seq.get();
        self.next_seq.set(seq + 1);
        task.seq.set(seq);
        heap.push(task);
        earliest_changed
    }

    fn reset_timer_fd(&self, when: Instant) {
        let delay = when
            .saturating_duration_since(Instant::now())
            .max(MIN_ARM_DELAY);
        let its = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: delay.as_secs() as libc::time_t,
                tv_nsec: delay.subsec_nanos() as libc::c_long,
            },
        };
        let ret = unsafe { libc::timerfd_settime(self.timer_fd, 0, &its, std::ptr::null_mut()) };
        if ret < 0 {
            error!("timerfd_settime: {}", io::Error::last_os_error());
        }
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.timer_fd);
        }
    }
}

/// Min-heap over `(expire, seq)` that keeps each task's `heap_index` current
/// so cancellation can remove by slot.
struct TimerHeap {
    tasks: Vec<Rc<TimerTask>>,
}

impl TimerHeap {
    fn new() -> TimerHeap {
        TimerHeap { tasks: Vec::new() }
    }

    fn top(&self) -> Option<&Rc<TimerTask>> {
        self.tasks.first()
    }

    fn push(&mut self, task: Rc<TimerTask>) {
        task.heap_index.set(self.tasks.len());
        self.tasks.push(task);
        self.sift_up(self.tasks.len() - 1);
    }

    fn pop(&mut self) -> Option<Rc<TimerTask>> {
        if self.tasks.is_empty() {
            return None;
        }
        let last = self.tasks.len() - 1;
        self.tasks.swap(0, last);
        let task = self.tasks.pop().expect("non-empty");
        task.heap_index.set(NOT_IN_HEAP);
        if !self.tasks.is_empty() {
            self.tasks[0].heap_index.set(0);
            self.sift_down(0);
        }
        Some(task)
    }

    fn remove(&mut self, index: usize) {
        let last = self.tasks.len() - 1;
        self.tasks.swap(index, last);
        let task = self.tasks.pop().expect("non-empty");
        task.heap_index.set(NOT_IN_HEAP);
        if index <= last && index < self.tasks.len() {
            self.tasks[index].heap_index.set(index);
            self.sift_down(index);
            self.sift_up(index);
        }
    }

    fn less(&self, i: usize, j: usize) -> bool {
        let (a, b) = (&self.tasks[i], &self.tasks[j]);
        match a.expire.get().cmp(&b.expire.get()) {
            std::cmp::Ordering::Less => true,
            std::cmp::Ordering::Greater => false,
            std::cmp::Ordering::Equal => a.seq.get() < b.seq.get(),
        }
    }

    fn swap(&mut self, i: usize, j: usize) {
        self.tasks.swap(i, j);
        self.tasks[i].heap_index.set(i);
        self.tasks[j].heap_index.set(j);
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if !self.less(index, parent) {
                break;
            }
            self.swap(index, parent);
            index = parent;
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        let len = self.tasks.len();
        loop {
            let left = 2 * index + 1;
            if left >= len {
                break;
            }
            let mut child = left;
            let right = left + 1;
            if right < len && self.less(right, left) {
                child = right;
            }
            if !self.less(child, index) {
                break;
            }
            self.swap(index, child);
            index = child;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: u64, when: Instant) -> Rc<TimerTask> {
        TimerTask::new(id, Box::new(|| {}), when, Duration::ZERO)
    }

    #[test]
    fn heap_pops_in_expiry_order() {
        let now = Instant::now();
        let mut heap = TimerHeap::new();
        let mut seq = 0u64;
        for offset in [40u64, 10, 30, 20, 50] {
            let t = task(offset, now + Duration::from_millis(offset));
            t.seq.set(seq);
            seq += 1;
            heap.push(t);
        }
        let mut order = Vec::new();
        while let Some(t) = heap.pop() {
            assert_eq!(t.heap_index.get(), NOT_IN_HEAP);
            order.push(t.id);
        }
        assert_eq!(order, vec![10, 20, 30, 40, 50]);
    }

    #[test]
    fn ties_break_in_insertion_order() {
        let now = Instant::now();
        let when = now + Duration::from_millis(5);
        let mut heap = TimerHeap::new();
        for id in 0..8u64 {
            let t = task(id, when);
            t.seq.set(id);
            heap.push(t);
        }
        let mut order = Vec::new();
        while let Some(t) = heap.pop() {
            order.push(t.id);
        }
        assert_eq!(order, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn remove_by_index_keeps_heap_valid() {
        let now = Instant::now();
        let mut heap = TimerHeap::new();
        let mut tasks = Vec::new();
        for id in 0..16u64 {
            let t = task(id, now + Duration::from_millis(id * 3));
            t.seq.set(id);
            heap.push(t.clone());
            tasks.push(t);
        }
        // Remove a middle element and the current top.
        heap.remove(tasks[7].heap_index.get());
        heap.remove(tasks[0].heap_index.get());
        assert_eq!(tasks[7].heap_index.get(), NOT_IN_HEAP);

        let mut order = Vec::new();
        while let Some(t) = heap.pop() {
            order.push(t.id);
        }
        let expected: Vec<u64> = (0..16).filter(|id| *id != 7 && *id != 0).collect();
        assert_eq!(order, expected);
    }

    #[test]
    fn queue_cancel_is_idempotent() {
        let tq = TimerQueue::new().unwrap();
        let when = Instant::now() + Duration::from_secs(60);
        tq.add_task(1, Box::new(|| {}), when, Duration::ZERO);
        assert_eq!(tq.heap.borrow().tasks.len(), 1);
        tq.cancel(1);
        tq.cancel(1);
        assert!(tq.heap.borrow().tasks.is_empty());
        assert!(tq.by_id.borrow().is_empty());
    }
}
