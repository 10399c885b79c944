//! Write requests
//!
//! A [`WriteRequest`] is created by a caller thread and resolved by the
//! thread that talks to the device. The caller may block on
//! [`WriteRequest::wait_for_completion`] with a deadline; running out of time
//! there only means the outcome is unknown, the request can still resolve
//! afterwards.
//!
//! [`WriteDispatcher`] queues requests per server id. Only the head of each
//! queue is handed to the device; the next one is released when the head
//! resolves. Writes to one watchable therefore complete in issue order while
//! writes to different watchables proceed independently.

use crate::error::{Result, WatchError};
use crate::types::{next_unique_id, ServerId};
use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Lifecycle of a write as seen by the resolver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Pending,
    Succeeded,
    Failed,
}

#[derive(Debug)]
struct WriteState {
    status: WriteStatus,
    failure_reason: Option<String>,
    completion_time: Option<DateTime<Utc>>,
}

/// A single value write with completion tracking
#[derive(Debug)]
pub struct WriteRequest {
    id: u64,
    server_id: ServerId,
    value: f64,
    state: Mutex<WriteState>,
    completed: Condvar,
}

impl WriteRequest {
    /// Create a pending request for `server_id`
    pub fn new(server_id: impl Into<ServerId>, value: f64) -> Arc<Self> {
        Arc::new(Self {
            id: next_unique_id(),
            server_id: server_id.into(),
            value,
            state: Mutex::new(WriteState {
                status: WriteStatus::Pending,
                failure_reason: None,
                completion_time: None,
            }),
            completed: Condvar::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Requested value, in the watchable's own units
    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn status(&self) -> WriteStatus {
        self.state.lock().status
    }

    pub fn is_completed(&self) -> bool {
        self.status() != WriteStatus::Pending
    }

    pub fn failure_reason(&self) -> Option<String> {
        self.state.lock().failure_reason.clone()
    }

    pub fn completion_time(&self) -> Option<DateTime<Utc>> {
        self.state.lock().completion_time
    }

    /// Resolve as successful. Only the first resolution counts.
    pub fn mark_succeeded(&self) -> bool {
        self.resolve(WriteStatus::Succeeded, None)
    }

    /// Resolve as failed. Only the first resolution counts.
    pub fn mark_failed(&self, reason: impl Into<String>) -> bool {
        self.resolve(WriteStatus::Failed, Some(reason.into()))
    }

    fn resolve(&self, status: WriteStatus, reason: Option<String>) -> bool {
        let mut state = self.state.lock();
        if state.status != WriteStatus::Pending {
            return false;
        }
        state.status = status;
        state.failure_reason = reason;
        state.completion_time = Some(Utc::now());
        self.completed.notify_all();
        true
    }

    /// Block until the request resolves or `timeout` elapses
    ///
    /// Returns [`WatchError::Timeout`] if nothing happened in time and
    /// [`WatchError::OperationFailure`] if the write resolved unsuccessfully.
    /// Must not be called from the thread that resolves requests. A timeout
    /// too large to express as a deadline waits without one.
    pub fn wait_for_completion(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        while state.status == WriteStatus::Pending {
            match deadline {
                Some(deadline) => {
                    if self.completed.wait_until(&mut state, deadline).timed_out() {
                        break;
                    }
                }
                None => self.completed.wait(&mut state),
            }
        }
        match state.status {
            WriteStatus::Succeeded => Ok(()),
            WriteStatus::Failed => Err(WatchError::OperationFailure(format!(
                "write to {} failed: {}",
                self.server_id,
                state.failure_reason.as_deref().unwrap_or("no reason given")
            ))),
            WriteStatus::Pending => Err(WatchError::Timeout(format!(
                "write to {} did not complete within {:?}",
                self.server_id, timeout
            ))),
        }
    }
}

/// Wait for every request of a batch, sharing one deadline
pub fn wait_for_all(requests: &[Arc<WriteRequest>], timeout: Duration) -> Result<()> {
    let deadline = Instant::now().checked_add(timeout);
    for request in requests {
        let remaining = match deadline {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => timeout,
        };
        request.wait_for_completion(remaining)?;
    }
    Ok(())
}

struct InFlight {
    request: Arc<WriteRequest>,
    dispatched_at: Option<Instant>,
}

/// Per-server-id FIFO of write requests
///
/// Owned by the I/O thread; not shared.
#[derive(Default)]
pub struct WriteDispatcher {
    queues: HashMap<ServerId, VecDeque<InFlight>>,
}

impl WriteDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an existing request under its own server id
    pub fn submit(&mut self, request: Arc<WriteRequest>) {
        let key = request.server_id.clone();
        self.submit_to(key, request);
    }

    /// Queue a request under `key`, the device entry it will land on.
    /// Requests sharing a key complete in submission order.
    pub fn submit_to(&mut self, key: impl Into<ServerId>, request: Arc<WriteRequest>) {
        self.queues
            .entry(key.into())
            .or_default()
            .push_back(InFlight {
                request,
                dispatched_at: None,
            });
    }

    /// Create and queue a request
    pub fn write(&mut self, server_id: impl Into<ServerId>, value: f64) -> Arc<WriteRequest> {
        let request = WriteRequest::new(server_id, value);
        self.submit(Arc::clone(&request));
        request
    }

    /// Create and queue several requests, keeping their order
    pub fn batch_write<I, S>(&mut self, items: I) -> Vec<Arc<WriteRequest>>
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<ServerId>,
    {
        items
            .into_iter()
            .map(|(server_id, value)| self.write(server_id, value))
            .collect()
    }

    /// Heads that have not been handed to the device yet, with their key,
    /// oldest first
    ///
    /// Each returned request is marked as dispatched.
    pub fn take_ready(&mut self) -> Vec<(ServerId, Arc<WriteRequest>)> {
        let now = Instant::now();
        let mut ready = Vec::new();
        for (key, queue) in self.queues.iter_mut() {
            if let Some(head) = queue.front_mut() {
                if head.dispatched_at.is_none() {
                    head.dispatched_at = Some(now);
                    ready.push((key.clone(), Arc::clone(&head.request)));
                }
            }
        }
        ready.sort_by_key(|(_, r)| r.id);
        ready
    }

    /// Resolve the in-flight head for `key` and release the next one
    pub fn complete(
        &mut self,
        key: &str,
        outcome: std::result::Result<(), String>,
    ) -> Option<Arc<WriteRequest>> {
        let queue = self.queues.get_mut(key)?;
        if queue.front().map_or(true, |head| head.dispatched_at.is_none()) {
            tracing::warn!("Write completion for {} with nothing in flight", key);
            return None;
        }
        let head = queue.pop_front()?;
        if queue.is_empty() {
            self.queues.remove(key);
        }
        match outcome {
            Ok(()) => head.request.mark_succeeded(),
            Err(reason) => head.request.mark_failed(reason),
        };
        Some(head.request)
    }

    /// Fail every in-flight head dispatched more than `timeout` ago
    pub fn expire_stale(&mut self, timeout: Duration) -> usize {
        let now = Instant::now();
        let stale: Vec<ServerId> = self
            .queues
            .iter()
            .filter_map(|(server_id, queue)| {
                let dispatched = queue.front()?.dispatched_at?;
                (now.duration_since(dispatched) > timeout).then(|| server_id.clone())
            })
            .collect();
        for server_id in &stale {
            tracing::warn!("Write to {} got no answer from the device", server_id);
            self.complete(server_id, Err("device did not acknowledge the write".into()));
        }
        stale.len()
    }

    /// Fail everything queued, e.g. when the link goes away
    pub fn fail_all(&mut self, reason: &str) -> usize {
        let mut count = 0;
        for (_, queue) in self.queues.drain() {
            for entry in queue {
                if entry.request.mark_failed(reason) {
                    count += 1;
                }
            }
        }
        count
    }

    /// Number of requests queued or in flight
    pub fn pending_count(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    pub fn is_idle(&self) -> bool {
        self.queues.is_empty()
    }
}
