//! Progress bus
//!
//! Carries stage events from the pipeline task to the presentation loop.
//! There is exactly one sender and one receiver. Progress updates share a
//! bounded budget and the oldest one is dropped when it is exceeded, since
//! only the latest percentage matters for rendering. Lifecycle events are
//! never dropped and keep their order.

use super::types::{RunStatus, StageFailure, StageStatus};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Events published by the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum ProgressEvent {
    StageStarted {
        index: usize,
    },
    StageProgress {
        index: usize,
        percent: f32,
    },
    StageFinished {
        index: usize,
        status: StageStatus,
        message: Option<String>,
    },
    RunFinished {
        status: RunStatus,
        error: Option<StageFailure>,
    },
}

impl ProgressEvent {
    /// Only progress updates may be dropped under load
    pub fn is_droppable(&self) -> bool {
        matches!(self, ProgressEvent::StageProgress { .. })
    }
}

/// Error returned by [`ProgressReceiver::try_recv`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryRecvError {
    Empty,
    /// The sender is gone and every event has been received
    Closed,
}

struct Queue {
    events: VecDeque<ProgressEvent>,
    progress_len: usize,
}

struct Shared {
    queue: Mutex<Queue>,
    progress_capacity: usize,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

/// Producing half; owned by the pipeline task
pub struct ProgressSender {
    shared: Arc<Shared>,
}

/// Consuming half; owned by the presentation loop
pub struct ProgressReceiver {
    shared: Arc<Shared>,
}

/// Create a bus keeping at most `progress_capacity` pending progress updates
pub fn channel(progress_capacity: usize) -> (ProgressSender, ProgressReceiver) {
    let shared = Arc::new(Shared {
        queue: Mutex::new(Queue {
            events: VecDeque::new(),
            progress_len: 0,
        }),
        progress_capacity: progress_capacity.max(1),
        notify: Notify::new(),
        closed: AtomicBool::new(false),
        dropped: AtomicU64::new(0),
    });
    (
        ProgressSender {
            shared: Arc::clone(&shared),
        },
        ProgressReceiver { shared },
    )
}

impl ProgressSender {
    /// Publish an event; never blocks
    pub fn send(&self, event: ProgressEvent) {
        {
            let mut queue = self.shared.queue.lock();
            if event.is_droppable() {
                if queue.progress_len >= self.shared.progress_capacity {
                    let oldest = queue.events.iter().position(ProgressEvent::is_droppable);
                    if let Some(oldest) = oldest {
                        queue.events.remove(oldest);
                        queue.progress_len -= 1;
                        self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
                queue.progress_len += 1;
            }
            queue.events.push_back(event);
        }
        self.shared.notify.notify_one();
    }
}

impl Drop for ProgressSender {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_one();
    }
}

impl ProgressReceiver {
    fn pop(&self) -> Option<ProgressEvent> {
        let mut queue = self.shared.queue.lock();
        let event = queue.events.pop_front()?;
        if event.is_droppable() {
            queue.progress_len -= 1;
        }
        Some(event)
    }

    /// Non-blocking receive for tick loops
    pub fn try_recv(&self) -> Result<ProgressEvent, TryRecvError> {
        if let Some(event) = self.pop() {
            return Ok(event);
        }
        if self.shared.closed.load(Ordering::Acquire) {
            // An event may have landed between the pop and the closed check
            self.pop().ok_or(TryRecvError::Closed)
        } else {
            Err(TryRecvError::Empty)
        }
    }

    /// Everything currently queued
    pub fn drain(&self) -> Vec<ProgressEvent> {
        let mut queue = self.shared.queue.lock();
        queue.progress_len = 0;
        queue.events.drain(..).collect()
    }

    /// Wait for the next event; `None` once the sender is gone and the queue is empty
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        loop {
            match self.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Closed) => return None,
                Err(TryRecvError::Empty) => self.shared.notify.notified().await,
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Progress updates discarded so far
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}
