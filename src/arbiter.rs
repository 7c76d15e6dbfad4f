// Single authoritative path from command sources to the serial dispatcher
//
// Every source submits whole `MotionCommand` snapshots through the `Arbiter`.
// Only the active `ControlSession` member gets through; accepted snapshots go
// into a bounded drop-oldest queue that the dispatcher drains.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::messages::{ControlSession, MotionCommand};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ArbiterError {
    #[error("{requested} is not the active control source ({active} is)")]
    InactiveSource {
        requested: ControlSession,
        active: ControlSession,
    },
}

/// Result of waiting on the queue
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Pop {
    Command(MotionCommand),
    TimedOut,
    Closed,
}

#[derive(Debug, Default)]
struct QueueInner {
    items: VecDeque<MotionCommand>,
    dropped: u64,
    closed: bool,
}

/// Bounded FIFO with drop-oldest overflow
///
/// Producers never block beyond the lock; a full queue evicts its oldest
/// snapshot and the eviction is never retried.
#[derive(Debug)]
pub struct CommandQueue {
    inner: Mutex<QueueInner>,
    ready: Condvar,
    capacity: usize,
}

impl CommandQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            ready: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        // A panicking holder cannot leave a torn command behind: pushes and
        // pops move whole values.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue a snapshot, returning the evicted one if the queue was full
    pub fn push(&self, cmd: MotionCommand) -> Option<MotionCommand> {
        let mut inner = self.lock();
        if inner.closed {
            return None;
        }
        let evicted = if inner.items.len() >= self.capacity {
            inner.dropped += 1;
            inner.items.pop_front()
        } else {
            None
        };
        inner.items.push_back(cmd);
        drop(inner);
        self.ready.notify_one();
        evicted
    }

    /// Wait up to `timeout` for the oldest snapshot
    pub fn pop_timeout(&self, timeout: Duration) -> Pop {
        let inner = self.lock();
        let (mut inner, _) = self
            .ready
            .wait_timeout_while(inner, timeout, |q| q.items.is_empty() && !q.closed)
            .unwrap_or_else(PoisonError::into_inner);

        match inner.items.pop_front() {
            Some(cmd) => Pop::Command(cmd),
            None if inner.closed => Pop::Closed,
            None => Pop::TimedOut,
        }
    }

    /// Stop accepting snapshots and wake any waiter. Queued snapshots can
    /// still be popped.
    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }

    pub fn drain(&self) -> Vec<MotionCommand> {
        self.lock().items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Snapshots evicted since creation
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }
}

/// Gatekeeper between command sources and the queue
#[derive(Debug)]
pub struct Arbiter {
    queue: Arc<CommandQueue>,
    session: Mutex<ControlSession>,
}

impl Arbiter {
    pub fn new(queue: Arc<CommandQueue>) -> Self {
        Self {
            queue,
            session: Mutex::new(ControlSession::default()),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(Arc::new(CommandQueue::new(capacity)))
    }

    pub fn queue(&self) -> &Arc<CommandQueue> {
        &self.queue
    }

    pub fn session(&self) -> ControlSession {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand control to another source.
    ///
    /// The outgoing source must already have zeroed the robot.
    pub fn activate(&self, session: ControlSession) {
        let mut current = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != session {
            info!("Control source: {} -> {}", *current, session);
            *current = session;
        }
    }

    /// Submit a snapshot on behalf of `source`
    pub fn submit(&self, source: ControlSession, cmd: MotionCommand) -> Result<(), ArbiterError> {
        // Holding the session lock across the push keeps a concurrent
        // `activate` from slipping in between the check and the enqueue.
        let active = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if *active != source {
            debug!("Rejected command from inactive source {}", source);
            return Err(ArbiterError::InactiveSource {
                requested: source,
                active: *active,
            });
        }
        if self.queue.push(cmd).is_some() {
            debug!("Queue full, dropped oldest command");
        }
        Ok(())
    }

    /// Zero everything regardless of the active source
    pub fn emergency_stop(&self) {
        warn!("Emergency stop");
        self.queue.push(MotionCommand::stop());
    }
}
