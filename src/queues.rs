// Copyright (c) 2025 The Estaminet developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Worker-queue admission control.
//!
//! Each named queue is a counting semaphore with a signed maximum: `-1`
//! means unlimited, any positive value bounds how many tasks may be in
//! flight on that queue at once. A global cap additionally bounds the sum
//! over all queues. The request queue gates connection workers; user
//! queues gate hopped response writes.
//!
//! Waiters block on a condition variable and are woken by every release
//! and by server shutdown; a waiter that observes the stopping flag gives
//! up and reports failure instead of acquiring.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

/// Identifies one worker queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueueId {
    /// The queue connection workers are admitted on.
    Request,
    /// A user-defined queue, created lazily on first use.
    Named(String),
}

impl QueueId {
    pub fn named<S>(name: S) -> QueueId
    where
        S: Into<String>,
    {
        QueueId::Named(name.into())
    }
}

impl From<&str> for QueueId {
    fn from(name: &str) -> QueueId {
        QueueId::Named(name.to_owned())
    }
}

impl From<String> for QueueId {
    fn from(name: String) -> QueueId {
        QueueId::Named(name)
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            QueueId::Request => write!(f, "request"),
            QueueId::Named(name) => write!(f, "{}", name),
        }
    }
}

/// Error raised when a queue limit is configured with an invalid count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueConfigError {
    /// The request queue must be unlimited or strictly positive.
    ZeroRequestLimit,
    /// Negative counts other than `-1` have no meaning.
    InvalidLimit(i64),
}

impl fmt::Display for QueueConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            QueueConfigError::ZeroRequestLimit => {
                write!(f, "the request queue limit must be -1 or strictly positive")
            }
            QueueConfigError::InvalidLimit(n) => {
                write!(f, "{} is not a valid queue limit (-1 means unlimited)", n)
            }
        }
    }
}

impl std::error::Error for QueueConfigError {}

struct State {
    limits: HashMap<QueueId, i64>,
    counts: HashMap<QueueId, usize>,
    global_limit: i64,
    total: usize,
}

impl State {
    fn limit(&self, queue: &QueueId) -> i64 {
        if let Some(limit) = self.limits.get(queue) {
            return *limit;
        }
        match queue {
            QueueId::Request => (num_cpus::get() * 4) as i64,
            QueueId::Named(_) => -1,
        }
    }

    fn has_capacity(&self, queue: &QueueId) -> bool {
        let limit = self.limit(queue);
        let count = self.counts.get(queue).copied().unwrap_or(0);
        if limit != -1 && count >= limit as usize {
            return false;
        }
        if self.global_limit != -1 && self.total >= self.global_limit as usize {
            return false;
        }
        true
    }
}

struct Shared {
    state: Mutex<State>,
    capacity: Condvar,
    stopping: Arc<AtomicBool>,
}

/// The multi-class admission controller.
#[derive(Clone)]
pub struct WorkerQueues {
    shared: Arc<Shared>,
}

/// An admission ticket on a queue. The count is released when the permit
/// drops, on every exit path including panics.
pub struct QueuePermit {
    shared: Arc<Shared>,
    queue: QueueId,
}

impl Drop for QueuePermit {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock().unwrap();
        if let Some(count) = state.counts.get_mut(&self.queue) {
            *count = count.saturating_sub(1);
        }
        state.total = state.total.saturating_sub(1);
        drop(state);
        self.shared.capacity.notify_all();
    }
}

impl WorkerQueues {
    /// Creates the controller. The stopping flag is shared with the server
    /// so that shutdown unblocks every waiter.
    pub fn new(stopping: Arc<AtomicBool>) -> WorkerQueues {
        WorkerQueues {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    limits: HashMap::new(),
                    counts: HashMap::new(),
                    global_limit: -1,
                    total: 0,
                }),
                capacity: Condvar::new(),
                stopping,
            }),
        }
    }

    /// Sets the maximum in-flight count for a queue. `-1` means unlimited;
    /// `0` admits nothing and is rejected for the request queue.
    pub fn set_limit(&self, queue: QueueId, max: i64) -> Result<(), QueueConfigError> {
        if max < -1 {
            return Err(QueueConfigError::InvalidLimit(max));
        }
        if max == 0 && queue == QueueId::Request {
            return Err(QueueConfigError::ZeroRequestLimit);
        }
        let mut state = self.shared.state.lock().unwrap();
        state.limits.insert(queue, max);
        drop(state);
        self.shared.capacity.notify_all();
        Ok(())
    }

    /// Sets the cap on the sum of all queues. `-1` means unlimited.
    pub fn set_global_limit(&self, max: i64) -> Result<(), QueueConfigError> {
        if max < -1 || max == 0 {
            return Err(QueueConfigError::InvalidLimit(max));
        }
        let mut state = self.shared.state.lock().unwrap();
        state.global_limit = max;
        drop(state);
        self.shared.capacity.notify_all();
        Ok(())
    }

    /// The configured limit of a queue.
    pub fn limit(&self, queue: &QueueId) -> i64 {
        self.shared.state.lock().unwrap().limit(queue)
    }

    /// How many tasks are currently in flight on a queue.
    pub fn current_count(&self, queue: &QueueId) -> usize {
        self.shared
            .state
            .lock()
            .unwrap()
            .counts
            .get(queue)
            .copied()
            .unwrap_or(0)
    }

    /// How many tasks are in flight over all queues.
    pub fn total_count(&self) -> usize {
        self.shared.state.lock().unwrap().total
    }

    /// Blocks until the queue and the global cap both have room, then takes
    /// a permit. Returns `None` if the server started stopping while
    /// waiting.
    pub fn acquire(&self, queue: &QueueId) -> Option<QueuePermit> {
        let mut state = self.shared.state.lock().unwrap();
        loop {
            if self.shared.stopping.load(Ordering::Relaxed) {
                return None;
            }
            if state.has_capacity(queue) {
                *state.counts.entry(queue.clone()).or_insert(0) += 1;
                state.total += 1;
                return Some(QueuePermit {
                    shared: self.shared.clone(),
                    queue: queue.clone(),
                });
            }
            // The timeout is a backstop so a stop that forgot to notify is
            // still observed.
            let (next, _) = self
                .shared
                .capacity
                .wait_timeout(state, Duration::from_millis(100))
                .unwrap();
            state = next;
        }
    }

    /// Waits for capacity and runs `task` on a thread admitted on `queue`,
    /// releasing the permit when the task finishes. Returns false without
    /// running the task if the server is stopping.
    pub fn submit<F>(&self, queue: &QueueId, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let permit = match self.acquire(queue) {
            Some(permit) => permit,
            None => return false,
        };
        thread::spawn(move || {
            let _permit = permit;
            task();
        });
        true
    }

    /// Wakes every waiter so they can observe the stopping flag.
    pub fn notify_stop(&self) {
        self.shared.capacity.notify_all();
    }
}
