//! Coalescing work queue with at most one pass in flight
//!
//! A queue holds no items, only a state. Triggers that arrive while a pass
//! is queued are absorbed; triggers that arrive while a pass is running are
//! folded into exactly one follow-up pass.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueState {
    Idle,
    Queued,
    Running,
    /// Running, with a follow-up pass requested
    RunningPending,
}

pub struct CoalescingQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl Default for CoalescingQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CoalescingQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::Idle),
            notify: Notify::new(),
        }
    }

    pub fn state(&self) -> QueueState {
        *self.lock()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        // the state is a plain enum, a poisoned lock still holds a valid value
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Request a pass
    pub fn trigger(&self) {
        let mut state = self.lock();
        *state = match *state {
            QueueState::Idle => {
                self.notify.notify_one();
                QueueState::Queued
            }
            QueueState::Queued => QueueState::Queued,
            QueueState::Running | QueueState::RunningPending => QueueState::RunningPending,
        };
    }

    fn try_start(&self) -> bool {
        let mut state = self.lock();
        if *state == QueueState::Queued {
            *state = QueueState::Running;
            true
        } else {
            false
        }
    }

    /// Wait until a pass is queued and mark it running
    pub async fn next(&self) {
        loop {
            if self.try_start() {
                return;
            }
            self.notify.notified().await;
        }
    }

    /// Like [`next`](Self::next), but starts a pass on its own once `timeout`
    /// elapses without a trigger
    pub async fn next_within(&self, timeout: Duration) {
        if tokio::time::timeout(timeout, self.next()).await.is_err() {
            self.trigger();
            self.next().await;
        }
    }

    /// Mark the running pass as done. Returns whether a follow-up pass was
    /// queued by triggers that arrived meanwhile.
    pub fn finish(&self) -> bool {
        let mut state = self.lock();
        match *state {
            QueueState::RunningPending => {
                *state = QueueState::Queued;
                self.notify.notify_one();
                true
            }
            _ => {
                *state = QueueState::Idle;
                false
            }
        }
    }
}

/// Exponential backoff for failed passes
#[derive(Clone, Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(300))
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: None,
        }
    }

    /// Delay before the next retry; doubles on every call up to the maximum
    pub fn next_delay(&mut self) -> Duration {
        let next = match self.current {
            None => self.initial,
            Some(current) => (current * 2).min(self.max),
        };
        self.current = Some(next);
        next
    }

    pub fn reset(&mut self) {
        self.current = None;
    }
}
