// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Worker threads.
//!
//! Every loop sleeps on its own [`Signal`] and handles whatever bits were
//! raised since it last woke. `RELEASE` is always handled before any other
//! bit; `TERMINATE` ends the thread.

use log::{debug, error};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle},
};

use crate::{
    af::AfController,
    client::{Client, Notification},
    config::SessionConfig,
    flash::FlashController,
    hw::HardwarePipeline,
    pool::FrameBufferPool,
    signal::{Completion, Signal, SignalSet},
    stream::{Scaler, StreamBinding},
    tracker::RequestTracker,
    Error,
};

pub mod drive;
pub mod intake;
pub mod stream;

/// Autofocus and flash state, always locked together.
#[derive(Debug)]
pub struct Controls {
    pub af: AfController,
    pub flash: FlashController,
}

impl Controls {
    pub fn new(config: &SessionConfig) -> Self {
        Controls {
            af: AfController::new(),
            flash: FlashController::new(config.flash, config.flash_stable_timeout),
        }
    }

    /// Pending client notifications, autofocus first.
    pub fn take_notifications(&mut self) -> Vec<Notification> {
        let mut notifications = self.af.take_notifications();
        notifications.extend(self.flash.take_notifications());
        notifications
    }
}

/// State shared by every loop of one session.
pub struct Shared {
    pub config: SessionConfig,
    pub tracker: RequestTracker,
    pub pool: FrameBufferPool,
    pub hw: HardwarePipeline,
    pub client: Client,
    pub controls: Mutex<Controls>,
    pub intake: Arc<Signal>,
    pub drive: Arc<Signal>,
    pub streams: [Arc<Signal>; 2],
    pub bindings: [Mutex<Option<StreamBinding>>; 2],
    /// Scaler outputs produced but not yet taken by their stream loop.
    ready: [AtomicUsize; 2],
    /// Set once the preview stream is going away.
    pub closing: AtomicBool,
    pub stabilization: AtomicBool,
    /// Placeholder frames still owed to the stabilization block.
    pub bubbles: AtomicU32,
}

impl Shared {
    pub fn new(config: SessionConfig, hw: HardwarePipeline, client: Client) -> Self {
        let intake = Arc::new(Signal::new());
        let tracker = RequestTracker::new(config.request_capacity)
            .with_completion_signal(intake.clone())
            .with_video_stabilization(config.video_stabilization);
        Shared {
            tracker,
            pool: FrameBufferPool::new(config.raw_buffers),
            hw,
            client,
            controls: Mutex::new(Controls::new(&config)),
            intake,
            drive: Arc::new(Signal::new()),
            streams: [Arc::new(Signal::new()), Arc::new(Signal::new())],
            bindings: [Mutex::new(None), Mutex::new(None)],
            ready: [AtomicUsize::new(0), AtomicUsize::new(0)],
            closing: AtomicBool::new(false),
            stabilization: AtomicBool::new(false),
            bubbles: AtomicU32::new(0),
            config,
        }
    }

    pub fn controls(&self) -> MutexGuard<'_, Controls> {
        self.controls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn binding(&self, scaler: Scaler) -> MutexGuard<'_, Option<StreamBinding>> {
        self.bindings[scaler.index()]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stream_signal(&self, scaler: Scaler) -> &Arc<Signal> {
        &self.streams[scaler.index()]
    }

    /// Count one produced output and wake the scaler's stream loop.
    pub fn output_ready(&self, scaler: Scaler) {
        self.ready[scaler.index()].fetch_add(1, Ordering::AcqRel);
        self.stream_signal(scaler).set(SignalSet::DATA_READY);
    }

    pub fn take_ready(&self, scaler: Scaler) -> usize {
        self.ready[scaler.index()].swap(0, Ordering::AcqRel)
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }
}

/// What a loop does after handling one wake-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

/// A named thread running one loop.
#[derive(Debug)]
pub struct Worker {
    name: String,
    signal: Arc<Signal>,
    exited: Arc<Completion>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn<F>(name: &str, signal: Arc<Signal>, mut handler: F) -> Result<Worker, Error>
    where
        F: FnMut(SignalSet) -> Flow + Send + 'static,
    {
        let exited = Arc::new(Completion::new());
        let handle = thread::Builder::new().name(name.to_owned()).spawn({
            let name = name.to_owned();
            let signal = signal.clone();
            let exited = exited.clone();
            move || {
                debug!("{} started", name);
                loop {
                    let bits = signal.wait();
                    let terminate = bits.contains(SignalSet::TERMINATE);
                    let flow = if terminate && !bits.contains(SignalSet::RELEASE) {
                        Flow::Exit
                    } else {
                        handler(bits)
                    };
                    if terminate || flow == Flow::Exit {
                        break;
                    }
                }
                exited.complete();
                debug!("{} exited", name);
            }
        })?;
        Ok(Worker {
            name: name.to_owned(),
            signal,
            exited,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signal(&self, bits: SignalSet) {
        self.signal.set(bits);
    }

    pub fn has_exited(&self) -> bool {
        self.exited.is_complete()
    }

    /// Block until the loop left its thread body.
    pub fn wait_exit(&self) {
        self.exited.wait();
    }

    /// Terminate the loop and join its thread.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.signal.set(SignalSet::TERMINATE);
        if handle.join().is_err() {
            error!("{} panicked", self.name);
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::mpsc, time::Duration};

    #[test]
    fn test_release_before_terminate() {
        let signal = Arc::new(Signal::new());
        let (tx, rx) = mpsc::channel();
        let mut worker = Worker::spawn("test-loop", signal.clone(), move |bits| {
            tx.send(bits).unwrap();
            Flow::Continue
        })
        .unwrap();

        signal.set(SignalSet::RELEASE | SignalSet::TERMINATE);
        let bits = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(bits.contains(SignalSet::RELEASE));
        worker.wait_exit();
        assert!(worker.has_exited());
        worker.stop();
    }

    #[test]
    fn test_terminate_skips_handler() {
        let signal = Arc::new(Signal::new());
        let (tx, rx) = mpsc::channel::<SignalSet>();
        let mut worker = Worker::spawn("test-loop", signal, move |bits| {
            tx.send(bits).unwrap();
            Flow::Continue
        })
        .unwrap();
        worker.signal(SignalSet::DATA_READY);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            SignalSet::DATA_READY
        );
        worker.stop();
        assert!(worker.has_exited());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_exit_flow() {
        let signal = Arc::new(Signal::new());
        let worker = Worker::spawn("test-loop", signal.clone(), |_| Flow::Exit).unwrap();
        signal.set(SignalSet::START_PROCESSING);
        worker.wait_exit();
        assert_eq!(worker.name(), "test-loop");
    }
}
