//! # Deferred Work Dispatch
//!
//! ## Purpose
//!
//! Completion processing is started from three kinds of context besides the
//! interrupt itself: soft interrupts, a shared worker pool and a periodic
//! timer. `Scheduler` is the seam the device uses to request each of them.
//!
//! ## How it works
//!
//! `TokioScheduler` runs softints as tasks on the runtime, workqueue items on
//! the blocking pool and callouts as sleeping tasks cancelled through a
//! `CancellationToken`. `PollScheduler` only queues work; the owner drains it
//! explicitly, which gives tests a deterministic interleaving.
//!
//! ## Main components
//!
//! - `Scheduler`: the three trigger sources.
//! - `TokioScheduler`: runtime-backed implementation.
//! - `PollScheduler`: caller-driven implementation.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::lock;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub trait Scheduler: Send + Sync {
    /// Runs `task` soon, in a context that may not block.
    fn softint(&self, task: Task);

    /// Runs `task` on a worker thread.
    fn workqueue(&self, task: Task);

    /// Runs `task` once after `delay` unless `cancel` fires first.
    fn callout(&self, delay: Duration, cancel: CancellationToken, task: Task);
}

/// Runs deferred work on a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        TokioScheduler { handle }
    }

    /// Uses the runtime the caller is running on.
    ///
    /// # Panics
    ///
    /// When called outside a tokio runtime.
    pub fn current() -> Self {
        TokioScheduler::new(Handle::current())
    }
}

impl Scheduler for TokioScheduler {
    fn softint(&self, task: Task) {
        self.handle.spawn(async move { task() });
    }

    fn workqueue(&self, task: Task) {
        self.handle.spawn_blocking(task);
    }

    fn callout(&self, delay: Duration, cancel: CancellationToken, task: Task) {
        self.handle.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if !cancel.is_cancelled() {
                        task();
                    }
                }
            }
        });
    }
}

/// Queues deferred work until the owner runs it.
#[derive(Default)]
pub struct PollScheduler {
    softints: Mutex<VecDeque<Task>>,
    work: Mutex<VecDeque<Task>>,
    callouts: Mutex<Vec<(CancellationToken, Task)>>,
}

impl PollScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_softints(&self) -> usize {
        lock(&self.softints).len()
    }

    pub fn pending_work(&self) -> usize {
        lock(&self.work).len()
    }

    /// Armed, not yet cancelled callouts.
    pub fn pending_callouts(&self) -> usize {
        lock(&self.callouts)
            .iter()
            .filter(|(cancel, _)| !cancel.is_cancelled())
            .count()
    }

    /// Runs queued softints, including ones queued while running.
    /// Returns the number of tasks run.
    pub fn run_softints(&self) -> usize {
        drain(&self.softints)
    }

    /// Runs queued workqueue items, including ones queued while running.
    pub fn run_work(&self) -> usize {
        drain(&self.work)
    }

    /// Runs softints and workqueue items until both queues are empty.
    pub fn run_pending(&self) -> usize {
        let mut total = 0;
        loop {
            let n = self.run_softints() + self.run_work();
            if n == 0 {
                return total;
            }
            total += n;
        }
    }

    /// Fires every armed callout once, as if its delay elapsed.
    pub fn fire_callouts(&self) -> usize {
        let armed = std::mem::take(&mut *lock(&self.callouts));
        let mut fired = 0;
        for (cancel, task) in armed {
            if !cancel.is_cancelled() {
                task();
                fired += 1;
            }
        }
        fired
    }
}

fn drain(queue: &Mutex<VecDeque<Task>>) -> usize {
    let mut n = 0;
    loop {
        let task = lock(queue).pop_front();
        match task {
            Some(task) => {
                task();
                n += 1;
            }
            None => return n,
        }
    }
}

impl Scheduler for PollScheduler {
    fn softint(&self, task: Task) {
        lock(&self.softints).push_back(task);
    }

    fn workqueue(&self, task: Task) {
        lock(&self.work).push_back(task);
    }

    fn callout(&self, _delay: Duration, cancel: CancellationToken, task: Task) {
        lock(&self.callouts).push((cancel, task));
    }
}
