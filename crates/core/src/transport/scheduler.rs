// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared-link scheduler: one worker thread owns the serial port and drains
//! four priority queues.
//!
//! - Highest non-empty class first, FIFO within a class.
//! - Opportunistic batching: consecutive same-device, no-reply commands at
//!   `Normal`/`Background` coalesce into one write, up to a configured cap.
//!   Emergency traffic is never batched and preempts at frame boundaries.
//! - Transient I/O errors retry on an exponential backoff schedule; fatal
//!   errors fail everything pending with `TransportDown` and quarantine the
//!   link until a periodic reopen succeeds. Submissions fail fast while
//!   quarantined.
//!
//! Submission is async with per-class backpressure (`submit` waits for queue
//! room, `try_submit` returns `Busy`); the worker side is plain blocking code.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Semaphore};

use crate::command::DeviceId;
use crate::config::TimingConfig;
use crate::error::CommandError;
use crate::events::{AlertCode, Event, EventHub};
use crate::transport::serial::{SerialLink, TransportError};

/// Scheduler priority classes, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Emergency,
    High,
    Normal,
    Background,
}

pub const PRIORITY_CLASSES: usize = 4;

impl Priority {
    pub fn index(self) -> usize {
        match self {
            Self::Emergency => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Background => 3,
        }
    }

    fn may_batch(self) -> bool {
        matches!(self, Self::Normal | Self::Background)
    }
}

/// One request bound for the wire.
pub struct WireRequest {
    pub device: DeviceId,
    pub priority: Priority,
    pub payload: Vec<u8>,
    /// Expected reply length; `None` for fire-and-forget commands.
    pub reply_len: Option<usize>,
    /// Dispatch deadline. Defaulted from timing config when unset.
    pub deadline: Option<Instant>,
    /// Whether this frame may coalesce with same-device neighbors.
    pub batchable: bool,
}

/// Awaitable completion for a submitted request.
pub struct RequestHandle {
    rx: oneshot::Receiver<Result<Vec<u8>, CommandError>>,
}

impl RequestHandle {
    /// Wait for completion. Dropping the handle instead cancels the request
    /// if it has not reached the wire yet.
    pub async fn wait(self) -> Result<Vec<u8>, CommandError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(CommandError::Internal("scheduler dropped request".to_owned())),
        }
    }
}

struct QueuedRequest {
    device: DeviceId,
    priority: Priority,
    payload: Vec<u8>,
    reply_len: Option<usize>,
    deadline: Instant,
    batchable: bool,
    done: oneshot::Sender<Result<Vec<u8>, CommandError>>,
    /// Queue-slot permit; dropping it (when the request completes) frees
    /// capacity for the next submitter.
    _permit: tokio::sync::OwnedSemaphorePermit,
}

/// Scheduler tuning, lifted from the timing section of the hardware config.
#[derive(Debug, Clone)]
pub struct SchedulerTuning {
    pub request_timeout: Duration,
    pub reply_timeout: Duration,
    pub backoff: Vec<Duration>,
    pub reopen_interval: Duration,
    pub batch_max: usize,
    pub queue_capacity: usize,
}

impl SchedulerTuning {
    pub fn from_timing(timing: &TimingConfig) -> Self {
        Self {
            request_timeout: Duration::from_millis(timing.request_timeout_ms),
            reply_timeout: Duration::from_millis(timing.reply_timeout_ms),
            backoff: timing.retry_backoff_ms.iter().map(|&ms| Duration::from_millis(ms)).collect(),
            reopen_interval: timing.reopen_interval(),
            batch_max: timing.batch_max.max(1),
            queue_capacity: timing.queue_capacity.max(1),
        }
    }
}

// -- Stats --------------------------------------------------------------------

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    frames: AtomicU64,
    commands: AtomicU64,
    batched_commands: AtomicU64,
    retries: AtomicU64,
    transport_failures: AtomicU64,
    timeouts: AtomicU64,
    cancelled: AtomicU64,
    reopens: AtomicU64,
}

/// Point-in-time scheduler statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub queue_depths: [usize; PRIORITY_CLASSES],
    pub submitted: u64,
    /// Wire writes performed (a batch is one frame).
    pub frames: u64,
    /// Commands completed over the wire.
    pub commands: u64,
    /// Commands that rode a multi-command frame.
    pub batched_commands: u64,
    pub retries: u64,
    pub transport_failures: u64,
    pub timeouts: u64,
    pub cancelled: u64,
    pub reopens: u64,
    pub link_down: bool,
}

impl StatsSnapshot {
    /// Fraction of wire commands that were coalesced into a shared frame.
    pub fn batching_ratio(&self) -> f64 {
        if self.commands == 0 {
            return 0.0;
        }
        self.batched_commands as f64 / self.commands as f64
    }
}

// -- Scheduler ----------------------------------------------------------------

struct Shared {
    queues: Mutex<[VecDeque<QueuedRequest>; PRIORITY_CLASSES]>,
    available: Condvar,
    shutdown: AtomicBool,
    link_down: AtomicBool,
    counters: Counters,
}

/// Priority + batch scheduler over the shared serial link.
pub struct LinkScheduler {
    shared: Arc<Shared>,
    capacity: [Arc<Semaphore>; PRIORITY_CLASSES],
    tuning: SchedulerTuning,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl LinkScheduler {
    /// Start the worker thread over `link`.
    pub fn start(
        link: Box<dyn SerialLink>,
        tuning: SchedulerTuning,
        events: Arc<EventHub>,
    ) -> Self {
        let shared = Arc::new(Shared {
            queues: Mutex::new(std::array::from_fn(|_| VecDeque::new())),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
            link_down: AtomicBool::new(false),
            counters: Counters::default(),
        });

        // Emergency gets headroom so a stop can never block behind capacity.
        let capacity = [
            Arc::new(Semaphore::new(tuning.queue_capacity * 4)),
            Arc::new(Semaphore::new(tuning.queue_capacity)),
            Arc::new(Semaphore::new(tuning.queue_capacity)),
            Arc::new(Semaphore::new(tuning.queue_capacity)),
        ];

        let worker_shared = Arc::clone(&shared);
        let worker_tuning = tuning.clone();
        let handle = std::thread::Builder::new()
            .name("link-scheduler".to_owned())
            .spawn(move || worker_loop(link, worker_shared, worker_tuning, events))
            .ok();

        Self { shared, capacity, tuning, worker: Mutex::new(handle) }
    }

    /// Submit a request, waiting for queue room if the class is full.
    pub async fn submit(&self, request: WireRequest) -> Result<RequestHandle, CommandError> {
        let class = request.priority.index();
        let permit = Arc::clone(&self.capacity[class])
            .acquire_owned()
            .await
            .map_err(|_| CommandError::Internal("scheduler closed".to_owned()))?;
        self.enqueue(request, permit)
    }

    /// Submit without waiting; a full class rejects with `Busy`.
    pub fn try_submit(&self, request: WireRequest) -> Result<RequestHandle, CommandError> {
        let class = request.priority.index();
        let permit = Arc::clone(&self.capacity[class])
            .try_acquire_owned()
            .map_err(|_| CommandError::Busy("scheduler queue full".to_owned()))?;
        self.enqueue(request, permit)
    }

    fn enqueue(
        &self,
        request: WireRequest,
        permit: tokio::sync::OwnedSemaphorePermit,
    ) -> Result<RequestHandle, CommandError> {
        if self.shared.link_down.load(Ordering::Acquire) {
            return Err(CommandError::TransportDown);
        }
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(CommandError::Internal("scheduler shut down".to_owned()));
        }

        let default_timeout = if request.reply_len.is_some() {
            self.tuning.reply_timeout
        } else {
            self.tuning.request_timeout
        };
        let deadline = request.deadline.unwrap_or_else(|| Instant::now() + default_timeout);

        let (done, rx) = oneshot::channel();
        let queued = QueuedRequest {
            device: request.device,
            priority: request.priority,
            payload: request.payload,
            reply_len: request.reply_len,
            deadline,
            batchable: request.batchable && request.priority.may_batch(),
            done,
            _permit: permit,
        };

        {
            let mut queues = self.shared.queues.lock();
            queues[request.priority.index()].push_back(queued);
        }
        self.shared.counters.submitted.fetch_add(1, Ordering::Relaxed);
        self.shared.available.notify_one();
        Ok(RequestHandle { rx })
    }

    /// Drop queued requests for `device` in every class below `keep`.
    ///
    /// Used by `stop_all`: once an emergency frame is on its way, pending
    /// lower-priority writes for that device must not re-command a servo.
    /// Purged submitters observe `Busy`.
    pub fn purge_device(&self, device: DeviceId, keep: Priority) {
        let purged: Vec<QueuedRequest> = {
            let mut queues = self.shared.queues.lock();
            let mut purged = Vec::new();
            for class in (keep.index() + 1)..PRIORITY_CLASSES {
                let q = &mut queues[class];
                let mut kept = VecDeque::with_capacity(q.len());
                while let Some(req) = q.pop_front() {
                    if req.device == device {
                        purged.push(req);
                    } else {
                        kept.push_back(req);
                    }
                }
                *q = kept;
            }
            purged
        };
        for req in purged {
            self.shared.counters.cancelled.fetch_add(1, Ordering::Relaxed);
            let _ = req.done.send(Err(CommandError::Busy("superseded by stop_all".to_owned())));
        }
    }

    /// Whether the link is quarantined after a fatal error.
    pub fn link_down(&self) -> bool {
        self.shared.link_down.load(Ordering::Acquire)
    }

    /// Observable scheduler statistics.
    pub fn stats(&self) -> StatsSnapshot {
        let depths = {
            let queues = self.shared.queues.lock();
            std::array::from_fn(|i| queues[i].len())
        };
        let c = &self.shared.counters;
        StatsSnapshot {
            queue_depths: depths,
            submitted: c.submitted.load(Ordering::Relaxed),
            frames: c.frames.load(Ordering::Relaxed),
            commands: c.commands.load(Ordering::Relaxed),
            batched_commands: c.batched_commands.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
            transport_failures: c.transport_failures.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            reopens: c.reopens.load(Ordering::Relaxed),
            link_down: self.link_down(),
        }
    }

    /// Stop the worker and fail anything still queued.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.available.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for LinkScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// -- Worker -------------------------------------------------------------------

fn worker_loop(
    mut link: Box<dyn SerialLink>,
    shared: Arc<Shared>,
    tuning: SchedulerTuning,
    events: Arc<EventHub>,
) {
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            drain_all(&shared, &CommandError::Internal("scheduler shut down".to_owned()));
            return;
        }

        let Some(head) = pop_highest(&shared) else {
            continue;
        };

        // Pre-write checks: cancellation and deadline, both side-effect free.
        if head.done.is_closed() {
            shared.counters.cancelled.fetch_add(1, Ordering::Relaxed);
            continue;
        }
        if Instant::now() > head.deadline {
            shared.counters.timeouts.fetch_add(1, Ordering::Relaxed);
            let _ = head.done.send(Err(CommandError::Timeout));
            continue;
        }

        let batch = collect_batch(&shared, head, tuning.batch_max);

        match dispatch(link.as_mut(), &batch, &tuning, &shared.counters) {
            Ok(reply) => {
                complete_batch(batch, reply, &shared.counters);
            }
            Err(DispatchFailure::Exhausted) => {
                shared.counters.transport_failures.fetch_add(1, Ordering::Relaxed);
                for req in batch {
                    let _ = req.done.send(Err(CommandError::TransportFailed));
                }
            }
            Err(DispatchFailure::Fatal(e)) => {
                tracing::warn!(err = %e, "serial link fatal error, quarantining");
                shared.counters.transport_failures.fetch_add(1, Ordering::Relaxed);
                for req in batch {
                    let _ = req.done.send(Err(CommandError::TransportDown));
                }
                quarantine(link.as_mut(), &shared, &tuning, &events);
            }
        }
    }
}

/// Block until a request is available or the shutdown flag flips.
fn pop_highest(shared: &Shared) -> Option<QueuedRequest> {
    let mut queues = shared.queues.lock();
    loop {
        for class in queues.iter_mut() {
            if let Some(req) = class.pop_front() {
                return Some(req);
            }
        }
        if shared.shutdown.load(Ordering::Acquire) {
            return None;
        }
        // Timed wait so shutdown is noticed even without a notify.
        let _ = shared.available.wait_for(&mut queues, Duration::from_millis(100));
        if shared.shutdown.load(Ordering::Acquire) {
            return None;
        }
    }
}

/// Coalesce the head request with queued same-device, no-reply neighbors.
///
/// Only `Normal`/`Background` frames marked batchable participate, and only
/// commands already queued at pop time. Never crosses a device boundary.
fn collect_batch(shared: &Shared, head: QueuedRequest, batch_max: usize) -> Vec<QueuedRequest> {
    let mut batch = vec![head];
    let first = &batch[0];
    if !first.batchable || first.reply_len.is_some() || batch_max <= 1 {
        return batch;
    }
    let device = first.device;
    let class = first.priority.index();

    let mut queues = shared.queues.lock();
    while batch.len() < batch_max {
        let Some(next) = queues[class].front() else { break };
        if !next.batchable || next.reply_len.is_some() || next.device != device {
            break;
        }
        let Some(next) = queues[class].pop_front() else { break };
        if next.done.is_closed() {
            shared.counters.cancelled.fetch_add(1, Ordering::Relaxed);
            continue;
        }
        if Instant::now() > next.deadline {
            shared.counters.timeouts.fetch_add(1, Ordering::Relaxed);
            let _ = next.done.send(Err(CommandError::Timeout));
            continue;
        }
        batch.push(next);
    }
    batch
}

enum DispatchFailure {
    /// Retries exhausted on transient errors.
    Exhausted,
    Fatal(TransportError),
}

/// Write one frame (possibly compound) and read the reply if one is expected.
/// Transient failures retry the whole frame on the backoff schedule.
fn dispatch(
    link: &mut dyn SerialLink,
    batch: &[QueuedRequest],
    tuning: &SchedulerTuning,
    counters: &Counters,
) -> Result<Vec<u8>, DispatchFailure> {
    let frame: Vec<u8> = batch.iter().flat_map(|r| r.payload.iter().copied()).collect();
    let reply_len = batch[0].reply_len;

    let mut backoff = tuning.backoff.iter();
    loop {
        match write_and_read(link, &frame, reply_len, tuning.reply_timeout) {
            Ok(reply) => return Ok(reply),
            Err(e) if e.is_fatal() => return Err(DispatchFailure::Fatal(e)),
            Err(e) => match backoff.next() {
                Some(delay) => {
                    counters.retries.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(err = %e, delay_ms = delay.as_millis() as u64, "transient serial error, retrying");
                    std::thread::sleep(*delay);
                }
                None => return Err(DispatchFailure::Exhausted),
            },
        }
    }
}

fn write_and_read(
    link: &mut dyn SerialLink,
    frame: &[u8],
    reply_len: Option<usize>,
    reply_timeout: Duration,
) -> Result<Vec<u8>, TransportError> {
    link.write_all(frame)?;
    match reply_len {
        Some(n) => link.read_exact(n, reply_timeout),
        None => Ok(Vec::new()),
    }
}

fn complete_batch(batch: Vec<QueuedRequest>, reply: Vec<u8>, counters: &Counters) {
    counters.frames.fetch_add(1, Ordering::Relaxed);
    counters.commands.fetch_add(batch.len() as u64, Ordering::Relaxed);
    if batch.len() > 1 {
        counters.batched_commands.fetch_add(batch.len() as u64, Ordering::Relaxed);
    }
    let mut reply = Some(reply);
    for req in batch {
        // Only the head of a batch can expect a reply; the rest get empty.
        let payload = if req.reply_len.is_some() {
            reply.take().unwrap_or_default()
        } else {
            Vec::new()
        };
        let _ = req.done.send(Ok(payload));
    }
}

fn drain_all(shared: &Shared, err: &CommandError) {
    let drained: Vec<QueuedRequest> = {
        let mut queues = shared.queues.lock();
        queues.iter_mut().flat_map(|q| q.drain(..)).collect()
    };
    for req in drained {
        let _ = req.done.send(Err(err.clone()));
    }
}

/// Fatal-error state: fail everything pending, then attempt reopen on an
/// interval until the link is back. Submissions fail fast throughout.
fn quarantine(
    link: &mut dyn SerialLink,
    shared: &Shared,
    tuning: &SchedulerTuning,
    events: &EventHub,
) {
    shared.link_down.store(true, Ordering::Release);
    events.publish(Event::Alert {
        alert: AlertCode::TransportDown,
        message: "serial link down, reopening".to_owned(),
    });

    loop {
        // Requests that raced the link_down flag get failed here too.
        drain_all(shared, &CommandError::TransportDown);

        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        std::thread::sleep(tuning.reopen_interval);

        match link.reopen() {
            Ok(()) => {
                // Discard whatever half-frame the dying link left behind.
                let _ = link.drain();
                drain_all(shared, &CommandError::TransportDown);
                shared.link_down.store(false, Ordering::Release);
                shared.counters.reopens.fetch_add(1, Ordering::Relaxed);
                tracing::info!("serial link reopened");
                return;
            }
            Err(e) => {
                tracing::debug!(err = %e, "serial reopen failed");
            }
        }
    }
}

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod tests;
