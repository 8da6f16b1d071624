// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Traits implemented by the HAL client.
//!
//! The core never owns client objects directly; it calls back through
//! these traits from its worker threads, so every implementation must be
//! shareable across threads.

use std::{
    collections::VecDeque,
    io,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use crate::{
    control::{AeState, AwbState, CaptureRequest, CaptureResult, FrameNumber, ServiceAfState},
    stream::StreamId,
};

/// Queue of pending client capture requests.
pub trait RequestSource: Send + Sync {
    /// Take the next request, or `None` when the queue is drained.
    fn dequeue_request(&self) -> Option<CaptureRequest>;

    /// Give a request back to the client once its result was delivered.
    fn free_request(&self, request: CaptureRequest);

    /// Number of requests the client still has queued.
    fn request_count(&self) -> usize;
}

/// Receiver of completed results, called in ascending frame order.
pub trait FrameSink: Send + Sync {
    fn enqueue_frame(&self, request: &CaptureRequest, result: CaptureResult);
}

/// 3A notification delivered to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    Autofocus { state: ServiceAfState, trigger_id: i32 },
    AutoExposure { state: AeState, trigger_id: i32 },
    AutoWhiteBalance { state: AwbState, trigger_id: i32 },
}

pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Client buffer queue backing one output stream.
///
/// Buffers are identified by their position in the client's pool. The
/// first `hw_buffers` positions are the ones the scaler driver knows about.
pub trait StreamOps: Send {
    /// Take a buffer from the client, `None` if it has none available.
    fn dequeue_buffer(&mut self) -> Option<usize>;

    /// Return a filled buffer to the client with its capture timestamp.
    fn enqueue_buffer(&mut self, index: usize, timestamp_ns: i64) -> io::Result<()>;

    /// Return an unfilled buffer to the client.
    fn cancel_buffer(&mut self, index: usize) -> io::Result<()>;

    /// Buffers the client keeps for itself at all times.
    fn min_undequeued(&self) -> usize;

    /// Size of the client's buffer pool.
    fn buffer_count(&self) -> usize;
}

/// Frame handed to an attached substream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubstreamFrame {
    pub frame_number: FrameNumber,
    pub timestamp_ns: i64,
    /// Position of the source buffer in the parent stream.
    pub buffer: usize,
    pub parent: StreamId,
}

/// Inline transform attached to a stream loop, such as JPEG encoding.
pub trait Substream: Send {
    /// Output id whose bit in the request mask enables this substream.
    fn id(&self) -> StreamId;

    fn process(&mut self, frame: &SubstreamFrame) -> io::Result<()>;
}

/// Client callbacks shared by the worker loops.
#[derive(Clone)]
pub struct Client {
    pub requests: Arc<dyn RequestSource>,
    pub frames: Arc<dyn FrameSink>,
    pub notifications: Arc<dyn NotificationSink>,
}

impl Client {
    pub fn new(
        requests: Arc<dyn RequestSource>,
        frames: Arc<dyn FrameSink>,
        notifications: Arc<dyn NotificationSink>,
    ) -> Self {
        Client {
            requests,
            frames,
            notifications,
        }
    }

    /// Forward notifications in order.
    pub fn notify_all(&self, notifications: impl IntoIterator<Item = Notification>) {
        for notification in notifications {
            self.notifications.notify(notification);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory request queue for simulations and tests.
#[derive(Debug, Default)]
pub struct RequestQueue {
    queue: Mutex<VecDeque<CaptureRequest>>,
    freed: Mutex<Vec<CaptureRequest>>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, request: CaptureRequest) {
        lock(&self.queue).push_back(request);
    }

    /// Requests handed back through [`RequestSource::free_request`].
    pub fn freed(&self) -> usize {
        lock(&self.freed).len()
    }
}

impl RequestSource for RequestQueue {
    fn dequeue_request(&self) -> Option<CaptureRequest> {
        lock(&self.queue).pop_front()
    }

    fn free_request(&self, request: CaptureRequest) {
        lock(&self.freed).push(request);
    }

    fn request_count(&self) -> usize {
        lock(&self.queue).len()
    }
}

#[derive(Debug, Default)]
struct Collected {
    results: Vec<CaptureResult>,
    notifications: Vec<Notification>,
}

/// Records every result and notification it receives.
#[derive(Debug, Default)]
pub struct ResultCollector {
    collected: Mutex<Collected>,
    cond: Condvar,
}

impl ResultCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.collected).results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn results(&self) -> Vec<CaptureResult> {
        lock(&self.collected).results.clone()
    }

    /// Results from position `start` onwards.
    pub fn results_since(&self, start: usize) -> Vec<CaptureResult> {
        let collected = lock(&self.collected);
        collected.results.get(start..).unwrap_or_default().to_vec()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        lock(&self.collected).notifications.clone()
    }

    /// Wait until at least `count` results arrived. Returns `false` on timeout.
    pub fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let collected = lock(&self.collected);
        let (collected, _) = self
            .cond
            .wait_timeout_while(collected, timeout, |c| c.results.len() < count)
            .unwrap_or_else(PoisonError::into_inner);
        collected.results.len() >= count
    }
}

impl FrameSink for ResultCollector {
    fn enqueue_frame(&self, _request: &CaptureRequest, result: CaptureResult) {
        lock(&self.collected).results.push(result);
        self.cond.notify_all();
    }
}

impl NotificationSink for ResultCollector {
    fn notify(&self, notification: Notification) {
        lock(&self.collected).notifications.push(notification);
    }
}
