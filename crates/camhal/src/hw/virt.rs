// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! In-process hardware.
//!
//! The virtual sensor returns queued buffers at a fixed cadence. The
//! virtual ISP fills the dynamic metadata with a scripted autofocus scan,
//! a configurable flash decision and flash stability, and hands its output
//! to the scalers. An output is dropped, and its directive cleared on the
//! returned shot, when the scaler has no buffer queued.

use log::{debug, trace};
use std::{
    collections::VecDeque,
    io,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};

use crate::{
    client::StreamOps,
    control::{
        AeFlashMode, AeMode, AeState, AfMode, AwbMode, FlashDecision, FlashMode, HwAfState, Shot,
    },
    hw::{Device, DeviceKind, Format, HardwarePipeline},
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VirtualConfig {
    /// time between two sensor frames
    pub frame_interval: Duration,

    /// frames the ISP reports an active scan after a trigger
    pub af_scan_frames: u32,

    /// focus result reported once the scan ends
    pub af_result: HwAfState,

    /// pre-flash decision reported when the pre-flash fires
    pub flash_decision: FlashDecision,

    /// capture flash frames before firing is reported stable
    pub flash_stable_frames: u32,

    /// how long a scaler dequeue waits for output
    pub dequeue_timeout: Duration,
}

impl Default for VirtualConfig {
    fn default() -> Self {
        VirtualConfig {
            frame_interval: Duration::from_micros(33_333),
            af_scan_frames: 3,
            af_result: HwAfState::AcquiredFocus,
            flash_decision: FlashDecision::Fire,
            flash_stable_frames: 2,
            dequeue_timeout: Duration::from_secs(1),
        }
    }
}

impl VirtualConfig {
    pub fn with_frame_interval(self, frame_interval: Duration) -> Self {
        VirtualConfig {
            frame_interval,
            ..self
        }
    }

    pub fn with_af_scan_frames(self, af_scan_frames: u32) -> Self {
        VirtualConfig {
            af_scan_frames,
            ..self
        }
    }

    pub fn with_af_result(self, af_result: HwAfState) -> Self {
        VirtualConfig { af_result, ..self }
    }

    pub fn with_flash_decision(self, flash_decision: FlashDecision) -> Self {
        VirtualConfig {
            flash_decision,
            ..self
        }
    }

    pub fn with_flash_stable_frames(self, flash_stable_frames: u32) -> Self {
        VirtualConfig {
            flash_stable_frames,
            ..self
        }
    }

    pub fn with_dequeue_timeout(self, dequeue_timeout: Duration) -> Self {
        VirtualConfig {
            dequeue_timeout,
            ..self
        }
    }
}

/// Counters shared by the virtual devices.
#[derive(Debug, Default)]
pub struct VirtualStats {
    sensor_frames: AtomicU64,
    isp_frames: AtomicU64,
    bubbles: AtomicU64,
    scaler_frames: AtomicU64,
    dropped_outputs: AtomicU64,
}

impl VirtualStats {
    pub fn sensor_frames(&self) -> u64 {
        self.sensor_frames.load(Ordering::Relaxed)
    }

    pub fn isp_frames(&self) -> u64 {
        self.isp_frames.load(Ordering::Relaxed)
    }

    /// Frames the ISP processed with the bubble frame number.
    pub fn bubbles(&self) -> u64 {
        self.bubbles.load(Ordering::Relaxed)
    }

    pub fn scaler_frames(&self) -> u64 {
        self.scaler_frames.load(Ordering::Relaxed)
    }

    /// Scaler outputs dropped for lack of a queued buffer.
    pub fn dropped_outputs(&self) -> u64 {
        self.dropped_outputs.load(Ordering::Relaxed)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn check_index(kind: DeviceKind, index: usize, buffers: usize) -> io::Result<()> {
    if index < buffers {
        return Ok(());
    }
    Err(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("{} has no buffer {} ({} configured)", kind, index, buffers),
    ))
}

fn queue_one(
    kind: DeviceKind,
    queue: &mut VecDeque<(usize, Shot)>,
    buffers: usize,
    index: usize,
    shot: Shot,
) -> io::Result<()> {
    check_index(kind, index, buffers)?;
    if queue.iter().any(|(queued, _)| *queued == index) {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} buffer {} already queued", kind, index),
        ));
    }
    queue.push_back((index, shot));
    Ok(())
}

#[derive(Debug)]
struct VirtualSensor {
    interval: Duration,
    buffers: usize,
    queue: VecDeque<(usize, Shot)>,
    streaming: bool,
    next_due: Option<Instant>,
    flash_on: bool,
    stats: Arc<VirtualStats>,
}

impl Device for VirtualSensor {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Sensor
    }

    fn configure(&mut self, format: Format, buffers: usize) -> io::Result<()> {
        debug!("virtual sensor {} with {} buffers", format, buffers);
        self.buffers = buffers;
        Ok(())
    }

    fn stream_on(&mut self) -> io::Result<()> {
        self.streaming = true;
        self.next_due = None;
        Ok(())
    }

    fn stream_off(&mut self) -> io::Result<()> {
        self.streaming = false;
        Ok(())
    }

    fn release_buffers(&mut self) -> io::Result<()> {
        self.queue.clear();
        Ok(())
    }

    fn enqueue(&mut self, index: usize, shot: Shot) -> io::Result<()> {
        queue_one(DeviceKind::Sensor, &mut self.queue, self.buffers, index, shot)
    }

    fn dequeue(&mut self) -> io::Result<(usize, Shot)> {
        if !self.streaming {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "not streaming"));
        }
        let (index, mut shot) = self
            .queue
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::WouldBlock, "no buffer queued"))?;

        let now = Instant::now();
        let due = self.next_due.unwrap_or(now);
        if due > now {
            thread::sleep(due - now);
        }
        self.next_due = Some(due.max(now) + self.interval);

        match shot.ctl.ae_flash_mode {
            Some(AeFlashMode::On | AeFlashMode::OnAlways | AeFlashMode::Capture) => {
                self.flash_on = true
            }
            Some(AeFlashMode::Off | AeFlashMode::Auto) => self.flash_on = false,
            None => {}
        }
        shot.dm.frame_number = shot.ctl.frame_number;
        shot.dm.timestamp_ns = crate::timestamp();
        shot.dm.exposure_time_ns = shot.ctl.frame_duration_ns;
        shot.dm.flash_mode = if shot.ctl.flash_mode == FlashMode::Torch {
            FlashMode::Torch
        } else if self.flash_on {
            FlashMode::Single
        } else {
            FlashMode::Off
        };
        self.stats.sensor_frames.fetch_add(1, Ordering::Relaxed);
        trace!("virtual sensor returns buffer {}", index);
        Ok((index, shot))
    }
}

#[derive(Debug, Default)]
struct ScalerInner {
    streaming: bool,
    queued: VecDeque<usize>,
    done: VecDeque<(usize, Shot)>,
}

/// Buffer queues of one scaler, shared with the ISP that fills them.
#[derive(Debug, Default)]
struct ScalerQueue {
    inner: Mutex<ScalerInner>,
    cond: Condvar,
}

impl ScalerQueue {
    /// Write one output into the oldest queued buffer.
    fn produce(&self, shot: &Shot) -> bool {
        let mut inner = lock(&self.inner);
        if !inner.streaming {
            return false;
        }
        let Some(index) = inner.queued.pop_front() else {
            return false;
        };
        inner.done.push_back((index, shot.clone()));
        self.cond.notify_all();
        true
    }
}

#[derive(Debug)]
struct VirtualScaler {
    kind: DeviceKind,
    buffers: usize,
    timeout: Duration,
    queue: Arc<ScalerQueue>,
    stats: Arc<VirtualStats>,
}

impl Device for VirtualScaler {
    fn kind(&self) -> DeviceKind {
        self.kind
    }

    fn configure(&mut self, format: Format, buffers: usize) -> io::Result<()> {
        debug!("virtual {} {} with {} buffers", self.kind, format, buffers);
        self.buffers = buffers;
        Ok(())
    }

    fn stream_on(&mut self) -> io::Result<()> {
        lock(&self.queue.inner).streaming = true;
        Ok(())
    }

    fn stream_off(&mut self) -> io::Result<()> {
        let mut inner = lock(&self.queue.inner);
        inner.streaming = false;
        inner.done.clear();
        Ok(())
    }

    fn release_buffers(&mut self) -> io::Result<()> {
        let mut inner = lock(&self.queue.inner);
        inner.queued.clear();
        inner.done.clear();
        Ok(())
    }

    fn enqueue(&mut self, index: usize, _shot: Shot) -> io::Result<()> {
        check_index(self.kind, index, self.buffers)?;
        let mut inner = lock(&self.queue.inner);
        if inner.queued.contains(&index) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} buffer {} already queued", self.kind, index),
            ));
        }
        inner.queued.push_back(index);
        Ok(())
    }

    fn dequeue(&mut self) -> io::Result<(usize, Shot)> {
        let inner = lock(&self.queue.inner);
        let (mut inner, _) = self
            .queue
            .cond
            .wait_timeout_while(inner, self.timeout, |i| i.done.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        let done = inner
            .done
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "no output"))?;
        self.stats.scaler_frames.fetch_add(1, Ordering::Relaxed);
        Ok(done)
    }
}

#[derive(Debug)]
struct VirtualIsp {
    config: VirtualConfig,
    buffers: usize,
    queue: VecDeque<(usize, Shot)>,
    af: HwAfState,
    af_mode: AfMode,
    scan_left: u32,
    ae_mode: AeMode,
    awb_mode: AwbMode,
    capture_frames: Option<u32>,
    preview: Arc<ScalerQueue>,
    capture: Arc<ScalerQueue>,
    stats: Arc<VirtualStats>,
}

impl VirtualIsp {
    fn process(&mut self, shot: &mut Shot) {
        let ctl = &shot.ctl;
        let dm = &mut shot.dm;

        if let Some(mode) = ctl.af_mode {
            if mode != AfMode::Off && mode != self.af_mode && !ctl.af_trigger {
                self.af = HwAfState::Inactive;
            }
            self.af_mode = mode;
        }
        if ctl.af_trigger && self.af_mode != AfMode::Off {
            self.af = HwAfState::ActiveScan;
            self.scan_left = self.config.af_scan_frames;
        } else if self.af == HwAfState::ActiveScan {
            if self.scan_left == 0 {
                self.af = self.config.af_result;
            } else {
                self.scan_left -= 1;
            }
        }
        dm.af_state = self.af;
        dm.af_mode = Some(self.af_mode);

        dm.flash_decision = FlashDecision::Pending;
        match ctl.ae_flash_mode {
            Some(AeFlashMode::On | AeFlashMode::OnAlways) => {
                dm.flash_decision = self.config.flash_decision
            }
            Some(AeFlashMode::Capture) => self.capture_frames = Some(0),
            Some(AeFlashMode::Off) => self.capture_frames = None,
            _ => {}
        }
        dm.flash_firing_stable = match self.capture_frames.as_mut() {
            Some(frames) => {
                *frames += 1;
                *frames > self.config.flash_stable_frames
            }
            None => false,
        };

        if let Some(mode) = ctl.ae_mode {
            self.ae_mode = mode;
        }
        if let Some(mode) = ctl.awb_mode {
            self.awb_mode = mode;
        }
        dm.ae_mode = Some(self.ae_mode);
        dm.awb_mode = Some(self.awb_mode);
        dm.ae_state = if self.ae_mode == AeMode::Locked {
            AeState::Locked
        } else {
            AeState::Converged
        };
        dm.frame_number = ctl.frame_number;
        dm.sensitivity = 100;

        if shot.directives.request_scp && !self.preview.produce(shot) {
            trace!("preview scaler has no buffer for {:?}", shot.ctl.frame_number);
            shot.directives.request_scp = false;
            self.stats.dropped_outputs.fetch_add(1, Ordering::Relaxed);
        }
        if shot.directives.request_scc && !self.capture.produce(shot) {
            trace!("capture scaler has no buffer for {:?}", shot.ctl.frame_number);
            shot.directives.request_scc = false;
            self.stats.dropped_outputs.fetch_add(1, Ordering::Relaxed);
        }

        self.stats.isp_frames.fetch_add(1, Ordering::Relaxed);
        if shot.ctl.frame_number.map_or(false, |f| f.is_bubble()) {
            self.stats.bubbles.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl Device for VirtualIsp {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Isp
    }

    fn configure(&mut self, format: Format, buffers: usize) -> io::Result<()> {
        debug!("virtual isp {} with {} buffers", format, buffers);
        self.buffers = buffers;
        Ok(())
    }

    fn stream_on(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn stream_off(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn release_buffers(&mut self) -> io::Result<()> {
        self.queue.clear();
        Ok(())
    }

    fn enqueue(&mut self, index: usize, shot: Shot) -> io::Result<()> {
        queue_one(DeviceKind::Isp, &mut self.queue, self.buffers, index, shot)
    }

    fn dequeue(&mut self) -> io::Result<(usize, Shot)> {
        let (index, mut shot) = self
            .queue
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::WouldBlock, "no buffer queued"))?;
        self.process(&mut shot);
        Ok((index, shot))
    }
}

/// A complete set of virtual devices.
#[derive(Debug, Clone)]
pub struct VirtualHardware {
    pipeline: HardwarePipeline,
    stats: Arc<VirtualStats>,
}

impl VirtualHardware {
    pub fn new(config: VirtualConfig) -> Self {
        let stats = Arc::new(VirtualStats::default());
        let preview = Arc::new(ScalerQueue::default());
        let capture = Arc::new(ScalerQueue::default());
        let scaler = |kind, queue: &Arc<ScalerQueue>| VirtualScaler {
            kind,
            buffers: 0,
            timeout: config.dequeue_timeout,
            queue: queue.clone(),
            stats: stats.clone(),
        };
        let pipeline = HardwarePipeline::new(
            Box::new(VirtualSensor {
                interval: config.frame_interval,
                buffers: 0,
                queue: VecDeque::new(),
                streaming: false,
                next_due: None,
                flash_on: false,
                stats: stats.clone(),
            }),
            Box::new(VirtualIsp {
                config,
                buffers: 0,
                queue: VecDeque::new(),
                af: HwAfState::Inactive,
                af_mode: AfMode::Off,
                scan_left: 0,
                ae_mode: AeMode::On,
                awb_mode: AwbMode::Auto,
                capture_frames: None,
                preview: preview.clone(),
                capture: capture.clone(),
                stats: stats.clone(),
            }),
            Box::new(scaler(DeviceKind::ScalerPreview, &preview)),
            Box::new(scaler(DeviceKind::ScalerCapture, &capture)),
        );
        VirtualHardware { pipeline, stats }
    }

    pub fn pipeline(&self) -> HardwarePipeline {
        self.pipeline.clone()
    }

    pub fn stats(&self) -> Arc<VirtualStats> {
        self.stats.clone()
    }
}

impl Default for VirtualHardware {
    fn default() -> Self {
        Self::new(VirtualConfig::default())
    }
}

/// What a virtual client observed on one stream.
#[derive(Debug, Default)]
pub struct StreamCounters {
    delivered: AtomicU64,
    cancelled: AtomicU64,
    last_timestamp_ns: AtomicI64,
}

impl StreamCounters {
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn cancelled(&self) -> u64 {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn last_timestamp_ns(&self) -> i64 {
        self.last_timestamp_ns.load(Ordering::Relaxed)
    }
}

/// Client side of a stream that hands back every buffer right away.
#[derive(Debug)]
pub struct VirtualStreamOps {
    total: usize,
    free: VecDeque<usize>,
    min_undequeued: usize,
    counters: Arc<StreamCounters>,
}

impl VirtualStreamOps {
    pub fn new(total: usize, min_undequeued: usize) -> Self {
        VirtualStreamOps {
            total,
            free: (0..total).collect(),
            min_undequeued,
            counters: Arc::new(StreamCounters::default()),
        }
    }

    pub fn counters(&self) -> Arc<StreamCounters> {
        self.counters.clone()
    }

    fn give_back(&mut self, index: usize) -> io::Result<()> {
        if self.free.contains(&index) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("buffer {} is not dequeued", index),
            ));
        }
        self.free.push_back(index);
        Ok(())
    }
}

impl StreamOps for VirtualStreamOps {
    fn dequeue_buffer(&mut self) -> Option<usize> {
        if self.free.len() <= self.min_undequeued {
            return None;
        }
        self.free.pop_front()
    }

    fn enqueue_buffer(&mut self, index: usize, timestamp_ns: i64) -> io::Result<()> {
        self.give_back(index)?;
        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        self.counters
            .last_timestamp_ns
            .store(timestamp_ns, Ordering::Relaxed);
        Ok(())
    }

    fn cancel_buffer(&mut self, index: usize) -> io::Result<()> {
        self.give_back(index)?;
        self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn min_undequeued(&self) -> usize {
        self.min_undequeued
    }

    fn buffer_count(&self) -> usize {
        self.total
    }
}
