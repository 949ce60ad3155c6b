//! Periodic timers dispatched from one execution context.
//!
//! Callbacks run one after another on whichever thread drives the scheduler,
//! so a slow callback delays later firings but never causes one to be
//! skipped: an auto-reload timer advances by exactly one interval per firing
//! and catches up on subsequent passes.

use std::{
    sync::mpsc::{self, Receiver, RecvTimeoutError, Sender},
    time::{Duration, Instant},
};

use log::{debug, info};

use crate::error::SchedulerStopped;

/// Upper bound on one idle wait so the stop condition is re-checked.
const MAX_IDLE_WAIT_MS: u64 = 1_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodicTask {
    pub name: &'static str,
    pub interval_ms: u64,
    pub auto_reload: bool,
}

impl PeriodicTask {
    pub fn every(name: &'static str, interval_ms: u64) -> Self {
        Self {
            name,
            interval_ms: interval_ms.max(1),
            auto_reload: true,
        }
    }

    pub fn once(name: &'static str, delay_ms: u64) -> Self {
        Self {
            name,
            interval_ms: delay_ms,
            auto_reload: false,
        }
    }
}

pub type Callback = Box<dyn FnMut(u64) + Send + 'static>;

pub type TaskId = usize;

struct Registration {
    task: PeriodicTask,
    callback: Callback,
}

struct Entry {
    task: PeriodicTask,
    callback: Callback,
    next_due_ms: u64,
    fired: u64,
    active: bool,
}

/// Lets other contexts arm timers on a running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: Sender<Registration>,
}

impl SchedulerHandle {
    /// The first firing happens one interval after the scheduler picks the
    /// timer up.
    pub fn schedule(
        &self,
        task: PeriodicTask,
        callback: impl FnMut(u64) + Send + 'static,
    ) -> Result<(), SchedulerStopped> {
        self.tx
            .send(Registration {
                task,
                callback: Box::new(callback),
            })
            .map_err(|_| SchedulerStopped)
    }
}

pub struct PeriodicScheduler {
    entries: Vec<Entry>,
    tx: Sender<Registration>,
    rx: Receiver<Registration>,
}

impl Default for PeriodicScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl PeriodicScheduler {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            entries: Vec::new(),
            tx,
            rx,
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            tx: self.tx.clone(),
        }
    }

    pub fn schedule(
        &mut self,
        task: PeriodicTask,
        now_ms: u64,
        callback: impl FnMut(u64) + Send + 'static,
    ) -> TaskId {
        self.insert(task, Box::new(callback), now_ms)
    }

    pub fn fired(&self, id: TaskId) -> u64 {
        self.entries.get(id).map_or(0, |entry| entry.fired)
    }

    pub fn is_active(&self, id: TaskId) -> bool {
        self.entries.get(id).is_some_and(|entry| entry.active)
    }

    pub fn next_deadline_ms(&self) -> Option<u64> {
        self.entries
            .iter()
            .filter(|entry| entry.active)
            .map(|entry| entry.next_due_ms)
            .min()
    }

    /// Fires every timer whose deadline has passed, once each, in the order
    /// they were armed. Returns how many callbacks ran.
    pub fn run_due(&mut self, now_ms: u64) -> usize {
        self.accept_registrations(now_ms);

        let mut ran = 0;
        for entry in self.entries.iter_mut().filter(|entry| entry.active) {
            if entry.next_due_ms > now_ms {
                continue;
            }

            debug!("timer `{}` firing at {now_ms} ms", entry.task.name);
            (entry.callback)(now_ms);
            entry.fired = entry.fired.saturating_add(1);
            ran += 1;

            if entry.task.auto_reload {
                entry.next_due_ms = entry.next_due_ms.saturating_add(entry.task.interval_ms);
            } else {
                entry.active = false;
            }
        }
        ran
    }

    /// Drives timers on the calling thread until `keep_running` returns false.
    /// `keep_running` runs on this thread once per pass, never more than
    /// `MAX_IDLE_WAIT_MS` apart while idle, and not at all while a callback is
    /// stuck, which makes it the place to feed a task watchdog.
    pub fn run(&mut self, clock: &MonotonicClock, mut keep_running: impl FnMut() -> bool) {
        info!("timer service running with {} timer(s)", self.entries.len());
        while keep_running() {
            self.run_due(clock.now_ms());

            let now_ms = clock.now_ms();
            let wait_ms = self
                .next_deadline_ms()
                .map_or(MAX_IDLE_WAIT_MS, |deadline| deadline.saturating_sub(now_ms))
                .min(MAX_IDLE_WAIT_MS);

            match self.rx.recv_timeout(Duration::from_millis(wait_ms)) {
                Ok(registration) => {
                    self.insert(registration.task, registration.callback, clock.now_ms());
                }
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => {}
            }
        }
    }

    fn accept_registrations(&mut self, now_ms: u64) {
        while let Ok(registration) = self.rx.try_recv() {
            self.insert(registration.task, registration.callback, now_ms);
        }
    }

    fn insert(&mut self, task: PeriodicTask, callback: Callback, now_ms: u64) -> TaskId {
        info!(
            "timer `{}` armed: {} ms{}",
            task.name,
            task.interval_ms,
            if task.auto_reload { ", auto-reload" } else { "" }
        );
        self.entries.push(Entry {
            next_due_ms: now_ms.saturating_add(task.interval_ms),
            task,
            callback,
            fired: 0,
            active: true,
        });
        self.entries.len() - 1
    }
}

/// Milliseconds since the clock was created.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    start: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}
