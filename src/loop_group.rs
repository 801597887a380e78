//! Worker loop threads and the round-robin group.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use tracing::info;

use crate::error::Error;
use crate::event_loop::{EventLoop, LoopHandle};

/// One spawned thread running one event loop.
pub struct LoopThread {
    handle: LoopHandle,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl LoopThread {
    /// Spawn a named thread, build an [`EventLoop`] on it, and run it. The
    /// returned `LoopThread` carries a handle to the running loop.
    pub fn start(name: &str) -> Result<LoopThread, Error> {
        let (tx, rx) = crossbeam_channel::bounded::<Result<LoopHandle, Error>>(1);
        let loop_name = name.to_string();
        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let event_loop = match EventLoop::new(&loop_name) {
                    Ok(el) => el,
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        return;
                    }
                };
                let _ = tx.send(Ok(event_loop.handle()));
                event_loop.run();
            })
            .map_err(Error::Io)?;

        let handle = rx.recv().map_err(|_| Error::LoopGone)??;
        Ok(LoopThread {
            handle,
            join: Mutex::new(Some(join)),
        })
    }

    /// Handle to the loop running on this thread.
    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Stop the loop and join the thread.
    pub fn stop(&self) {
        self.handle.stop();
        let join = self.join.lock().unwrap().take();
        if let Some(join) = join {
            let _ = join.join();
        }
    }
}

/// N worker loop threads plus the boss loop, handed out round robin.
pub struct LoopGroup {
    boss: LoopHandle,
    worker_count: usize,
    workers: Mutex<Vec<LoopThread>>,
    started: AtomicBool,
    next: AtomicUsize,
}

impl LoopGroup {
    /// A group of `worker_count` workers fed from `boss`. With zero workers
    /// the boss loop serves everything itself.
    pub fn new(worker_count: usize, boss: LoopHandle) -> LoopGroup {
        LoopGroup {
            boss,
            worker_count,
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            next: AtomicUsize::new(0),
        }
    }

    /// Spawn the worker threads. Idempotent.
    pub fn start(&self) -> Result<(), Error> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut workers = self.workers.lock().unwrap();
        for i in 0..self.worker_count {
            let name = format!("{}-worker-{}", self.boss.name(), i);
            workers.push(LoopThread::start(&name)?);
        }
        info!(boss = %self.boss.name(), workers = self.worker_count, "loop group started");
        Ok(())
    }

    /// Next worker loop, round robin; the boss loop when the group is empty.
    /// Called from the boss loop.
    pub fn next(&self) -> LoopHandle {
        let workers = self.workers.lock().unwrap();
        if workers.is_empty() {
            return self.boss.clone();
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % workers.len();
        workers[i].handle()
    }

    /// Stop every worker loop and join its thread.
    pub fn stop(&self) {
        let workers = self.workers.lock().unwrap();
        for worker in workers.iter() {
            worker.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[test]
    fn group_of_zero_returns_boss() {
        let boss = LoopThread::start("boss").unwrap();
        let group = LoopGroup::new(0, boss.handle());
        group.start().unwrap();
        assert_eq!(group.next().name(), "boss");
        assert_eq!(group.next().name(), "boss");
        boss.stop();
    }

    #[test]
    fn round_robin_cycles_workers() {
        let boss = LoopThread::start("rr-boss").unwrap();
        let group = LoopGroup::new(3, boss.handle());
        group.start().unwrap();

        let names: Vec<String> = (0..6).map(|_| group.next().name().to_string()).collect();
        assert_eq!(names[0], "rr-boss-worker-0");
        assert_eq!(names[1], "rr-boss-worker-1");
        assert_eq!(names[2], "rr-boss-worker-2");
        assert_eq!(&names[..3], &names[3..]);

        group.stop();
        boss.stop();
    }

    #[test]
    fn workers_execute_submitted_tasks() {
        let boss = LoopThread::start("task-boss").unwrap();
        let group = LoopGroup::new(2, boss.handle());
        group.start().unwrap();

        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..10 {
            let counter = counter.clone();
            group
                .next()
                .queue_in_loop(move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                });
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::Relaxed) < 10 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(counter.load(Ordering::Relaxed), 10);

        group.stop();
        boss.stop();
    }
}
