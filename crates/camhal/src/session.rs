// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! A camera session: the worker loops running over one hardware pipeline.
//!
//! ```no_run
//! use std::sync::Arc;
//! use camhal::{
//!     client::{Client, RequestQueue, ResultCollector},
//!     config::SessionConfig,
//!     control::{CaptureRequest, OutputMask},
//!     hw::{virt::{VirtualHardware, VirtualStreamOps}, Format},
//!     session::Session,
//!     stream::StreamId,
//! };
//!
//! let requests = Arc::new(RequestQueue::new());
//! let results = Arc::new(ResultCollector::new());
//! let client = Client::new(requests.clone(), results.clone(), results.clone());
//! let hw = VirtualHardware::default();
//!
//! let mut session = Session::open(SessionConfig::default(), hw.pipeline(), client)?;
//! session.add_stream(
//!     StreamId::PREVIEW,
//!     Format::new(1280, 720),
//!     4,
//!     Box::new(VirtualStreamOps::new(6, 2)),
//! )?;
//! requests.push(CaptureRequest::new(1, OutputMask::PREVIEW));
//! session.notify_request_queue_not_empty();
//! results.wait_for(1, std::time::Duration::from_secs(1));
//! session.close();
//! # Ok::<(), camhal::Error>(())
//! ```

use log::{debug, info, warn};
use std::sync::{atomic::Ordering, Arc};

use crate::{
    client::{Client, StreamOps, Substream},
    config::SessionConfig,
    control::{ServiceAfState, Shot},
    flash::FlashStep,
    hw::{DeviceKind, Format, HardwarePipeline},
    loops::{
        drive::DriveLoop, intake::IntakeLoop, stream::StreamLoop, Controls, Shared, Worker,
    },
    pool::FrameBufferPool,
    signal::{Completion, SignalSet},
    stream::{Scaler, StreamBinding, StreamId},
    tracker::RequestTracker,
    Error,
};

#[derive(Debug)]
struct StreamWorker {
    worker: Worker,
    released: Arc<Completion>,
}

pub struct Session {
    shared: Arc<Shared>,
    intake: Option<Worker>,
    drive: Option<Worker>,
    streams: [Option<StreamWorker>; 2],
}

impl Session {
    /// Configure the sensor and ISP, prime the sensor queue and start the
    /// intake and drive loops.
    pub fn open(
        config: SessionConfig,
        hw: HardwarePipeline,
        client: Client,
    ) -> Result<Session, Error> {
        let (width, height) = config.capabilities.sensor_size;
        let format = Format::new(width, height);
        info!(
            "opening {} sensor at {} with {} raw buffers",
            config.capabilities.name, format, config.raw_buffers
        );
        hw.configure(DeviceKind::Sensor, format, config.raw_buffers)?;
        hw.configure(DeviceKind::Isp, format, config.raw_buffers)?;

        let shared = Arc::new(Shared::new(config, hw, client));
        for _ in 0..shared.config.sensor_queue_depth() {
            let index = shared.pool.acquire_for_capture()?;
            shared
                .hw
                .enqueue(DeviceKind::Sensor, index.get(), Shot::dummy())?;
        }
        shared.hw.stream_on(DeviceKind::Sensor)?;
        shared.hw.stream_on(DeviceKind::Isp)?;

        let mut intake = IntakeLoop::new(shared.clone());
        let intake = Worker::spawn("camhal-intake", shared.intake.clone(), move |bits| {
            intake.handle(bits)
        })?;
        let mut drive = DriveLoop::new(shared.clone());
        let drive = Worker::spawn("camhal-drive", shared.drive.clone(), move |bits| {
            drive.handle(bits)
        })?;

        Ok(Session {
            shared,
            intake: Some(intake),
            drive: Some(drive),
            streams: [None, None],
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn tracker(&self) -> &RequestTracker {
        &self.shared.tracker
    }

    pub fn pool(&self) -> &FrameBufferPool {
        &self.shared.pool
    }

    /// Tell the intake loop the client queued new requests.
    pub fn notify_request_queue_not_empty(&self) {
        self.shared.intake.set(SignalSet::REQUEST_QUEUE_NOT_EMPTY);
    }

    /// Bind a stream delivering into client buffers. The first
    /// `hw_buffers` client buffers are queued to the scaler.
    pub fn add_stream(
        &mut self,
        id: StreamId,
        format: Format,
        hw_buffers: usize,
        ops: Box<dyn StreamOps>,
    ) -> Result<(), Error> {
        let caps = &self.shared.config.capabilities;
        let supported = match id.scaler() {
            Scaler::Preview => caps.supports_preview(format.width, format.height),
            Scaler::Capture => caps.supports_capture(format.width, format.height),
        };
        if !supported {
            return Err(Error::UnsupportedStream(format!(
                "{} at {} on {}",
                id, format, caps.name
            )));
        }
        let total = ops.buffer_count();
        let binding = StreamBinding::direct(id, format, hw_buffers, total, ops)?;
        self.bind(binding)
    }

    /// Bind a stream on internal buffers feeding only substreams, such as
    /// the JPEG encoder on the capture scaler.
    pub fn add_internal_stream(
        &mut self,
        scaler: Scaler,
        format: Format,
        hw_buffers: usize,
    ) -> Result<(), Error> {
        let caps = &self.shared.config.capabilities;
        if scaler == Scaler::Capture && !caps.supports_capture(format.width, format.height) {
            return Err(Error::UnsupportedStream(format!(
                "capture at {} on {}",
                format, caps.name
            )));
        }
        let binding = StreamBinding::indirect(scaler, format, hw_buffers)?;
        self.bind(binding)
    }

    fn bind(&mut self, mut binding: StreamBinding) -> Result<(), Error> {
        let scaler = binding.scaler();
        if self.shared.is_closing() {
            return Err(Error::InvalidStream("session is closing".to_owned()));
        }
        if self.shared.binding(scaler).is_some() {
            return Err(Error::InvalidStream(format!(
                "{:?} scaler already has a stream",
                scaler
            )));
        }
        binding.register(&self.shared.hw)?;
        if scaler == Scaler::Preview {
            self.shared.tracker.set_initial_skip(self.shared.config.initial_skip);
        }
        info!("{} stream bound at {}", binding.id(), binding.format());
        *self.shared.binding(scaler) = Some(binding);

        let slot = &mut self.streams[scaler.index()];
        if slot.is_none() {
            let released = Arc::new(Completion::new());
            let mut stream = StreamLoop::new(self.shared.clone(), scaler, released.clone());
            let name = match scaler {
                Scaler::Preview => "camhal-preview",
                Scaler::Capture => "camhal-capture",
            };
            let worker = Worker::spawn(
                name,
                self.shared.stream_signal(scaler).clone(),
                move |bits| stream.handle(bits),
            )?;
            *slot = Some(StreamWorker { worker, released });
        }
        Ok(())
    }

    /// Attach a substream to the stream on `scaler`. The substream's output
    /// must be one the scaler produces.
    pub fn attach_substream(
        &self,
        scaler: Scaler,
        substream: Box<dyn Substream>,
    ) -> Result<(), Error> {
        let id = substream.id();
        if id.scaler() != scaler {
            return Err(Error::InvalidStream(format!(
                "{} is not produced by the {:?} scaler",
                id, scaler
            )));
        }
        match self.shared.binding(scaler).as_mut() {
            Some(binding) => binding.substreams.attach(substream),
            None => Err(Error::InvalidStream(format!(
                "no stream on the {:?} scaler",
                scaler
            ))),
        }
    }

    pub fn detach_substream(
        &self,
        scaler: Scaler,
        id: StreamId,
    ) -> Result<Box<dyn Substream>, Error> {
        match self.shared.binding(scaler).as_mut() {
            Some(binding) => binding.substreams.detach(id),
            None => Err(Error::InvalidStream(format!(
                "no stream on the {:?} scaler",
                scaler
            ))),
        }
    }

    /// Release the stream on `scaler`. Releasing the preview stream also
    /// stops the drive loop, after which the session only drains.
    pub fn release_stream(&mut self, scaler: Scaler) -> Result<(), Error> {
        if self.shared.binding(scaler).is_none() {
            return Err(Error::InvalidStream(format!(
                "no stream on the {:?} scaler",
                scaler
            )));
        }
        if scaler == Scaler::Preview {
            self.stop_drive();
        }
        let Some(stream) = self.streams[scaler.index()].as_mut() else {
            return Err(Error::InvalidStream(format!(
                "no loop for the {:?} scaler",
                scaler
            )));
        };
        stream.released.reset();
        stream.worker.signal(SignalSet::RELEASE);
        stream.released.wait();
        debug!("{:?} stream release acknowledged", scaler);

        if scaler == Scaler::Preview {
            if let Some(mut stream) = self.streams[scaler.index()].take() {
                stream.worker.stop();
            }
        }
        Ok(())
    }

    fn stop_drive(&mut self) {
        self.shared.closing.store(true, Ordering::Release);
        if let Some(mut drive) = self.drive.take() {
            drive.signal(SignalSet::RELEASE);
            drive.wait_exit();
            drive.stop();
        }
    }

    fn with_controls<T>(&self, f: impl FnOnce(&mut Controls) -> T) -> T {
        let (value, notifications) = {
            let mut controls = self.shared.controls();
            let value = f(&mut controls);
            (value, controls.take_notifications())
        };
        self.shared.client.notify_all(notifications);
        value
    }

    pub fn trigger_autofocus(&self, id: i32) {
        debug!("AF trigger {}", id);
        self.with_controls(|c| c.af.on_trigger(id, &mut c.flash));
    }

    pub fn cancel_autofocus(&self, id: i32) {
        debug!("AF cancel {}", id);
        self.with_controls(|c| c.af.on_cancel(id, &mut c.flash));
    }

    pub fn trigger_precapture(&self, id: i32) {
        self.with_controls(|c| c.flash.on_precapture_trigger(id));
    }

    pub fn af_state(&self) -> ServiceAfState {
        self.shared.controls().af.service_state()
    }

    pub fn flash_step(&self) -> FlashStep {
        self.shared.controls().flash.step()
    }

    /// Release every stream and stop every loop.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        for scaler in [Scaler::Capture, Scaler::Preview] {
            if self.shared.binding(scaler).is_some() {
                if let Err(err) = self.release_stream(scaler) {
                    warn!("{}", err);
                }
            }
        }
        self.stop_drive();
        for stream in self.streams.iter_mut() {
            if let Some(mut stream) = stream.take() {
                stream.worker.stop();
            }
        }
        if let Some(mut intake) = self.intake.take() {
            intake.signal(SignalSet::RELEASE);
            intake.wait_exit();
            intake.stop();
            info!("session closed");
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}
