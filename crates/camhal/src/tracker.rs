// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! In-flight request table.
//!
//! Requests are admitted into a fixed ring of slots and walk
//! `Empty → Registered → Processing → Captured → MetadataReady → Completed
//! → Empty`. The drive loop stamps registered requests onto raw buffers,
//! matches returning hardware frames back to their slot and merges the
//! reported metadata. The stream loops report each delivered scaler output.
//! A slot completes once its metadata is in and every output it asked for
//! was delivered, and results are drained strictly by frame number.
//!
//! The table and the live count are guarded separately so that
//! [`RequestTracker::is_full`] and [`RequestTracker::len`] never contend
//! with the drive loop.

use log::{debug, error, trace, warn};
use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::{
    control::{
        AeMode, AfMode, AwbMode, CaptureIntent, CaptureRequest, CaptureResult, ControlMode,
        DynamicMetadata, FrameNumber, OutputMask, ServiceAfState, Shot, ShotControl,
        ShotDirectives, PROCESSING_FRAME_DURATION_NS,
    },
    ring::{Index, Ring},
    signal::{Signal, SignalSet},
    Error,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Empty,
    Registered,
    Processing,
    Captured,
    MetadataReady,
    Completed,
}

impl SlotState {
    pub fn name(self) -> &'static str {
        match self {
            SlotState::Empty => "empty",
            SlotState::Registered => "registered",
            SlotState::Processing => "processing",
            SlotState::Captured => "captured",
            SlotState::MetadataReady => "metadata-ready",
            SlotState::Completed => "completed",
        }
    }
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone)]
pub struct RequestSlot {
    state: SlotState,
    frame: FrameNumber,
    request: Option<CaptureRequest>,
    pending: OutputMask,
    timestamp_ns: i64,
    metadata: DynamicMetadata,
}

impl RequestSlot {
    fn empty() -> Self {
        RequestSlot {
            state: SlotState::Empty,
            frame: FrameNumber::default(),
            request: None,
            pending: OutputMask::empty(),
            timestamp_ns: 0,
            metadata: DynamicMetadata::default(),
        }
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn frame(&self) -> FrameNumber {
        self.frame
    }

    /// Requested outputs whose scaler has not reported delivery yet.
    pub fn pending(&self) -> OutputMask {
        self.pending
    }

    fn is_live(&self) -> bool {
        self.state != SlotState::Empty
    }
}

pub type SlotIndex = Index<RequestSlot>;

/// Autofocus settings to apply as soon as a request is admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AfIntent {
    pub frame: FrameNumber,
    pub af_mode: AfMode,
    pub af_regions: [u32; 4],
}

/// A drained request together with its result.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedRequest {
    pub request: CaptureRequest,
    pub result: CaptureResult,
}

/// Side information produced while stamping a matched frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IspUpdate {
    /// Flash UI mode derived from the request's AE mode, if it applies.
    pub flash_ui_mode: Option<AeMode>,
    /// Stabilization was requested and is enabled for the session.
    pub stabilization: bool,
}

#[derive(Debug)]
struct TrackerInner {
    ring: Ring<RequestSlot>,
    insertion: SlotIndex,
    processing: SlotIndex,
    next_frame: FrameNumber,
    next_drain: FrameNumber,
    stamped_once: bool,
    last_aa_mode: Option<ControlMode>,
    last_ae_mode: Option<AeMode>,
    last_awb_mode: Option<AwbMode>,
    last_ae_compensation: Option<i32>,
    last_timestamp_ns: i64,
    skip: u32,
}

impl TrackerInner {
    fn find(&self, frame: FrameNumber) -> Option<SlotIndex> {
        self.ring
            .position(|slot| slot.is_live() && slot.frame == frame)
    }
}

/// Fixed-capacity table of in-flight capture requests.
#[derive(Debug)]
pub struct RequestTracker {
    inner: Mutex<TrackerInner>,
    live: Mutex<usize>,
    capacity: usize,
    completion: Option<Arc<Signal>>,
    video_stabilization: bool,
}

fn delta<T: Copy + PartialEq>(last: &mut Option<T>, value: T) -> Option<T> {
    if *last == Some(value) {
        None
    } else {
        *last = Some(value);
        Some(value)
    }
}

impl RequestTracker {
    pub fn new(capacity: usize) -> Self {
        let ring = Ring::from_fn(capacity, |_| RequestSlot::empty());
        let last = ring.prev(ring.first());
        let capacity = ring.capacity();
        RequestTracker {
            inner: Mutex::new(TrackerInner {
                ring,
                insertion: last,
                processing: last,
                next_frame: FrameNumber(0),
                next_drain: FrameNumber(0),
                stamped_once: false,
                last_aa_mode: None,
                last_ae_mode: None,
                last_awb_mode: None,
                last_ae_compensation: None,
                last_timestamp_ns: 0,
                skip: 0,
            }),
            live: Mutex::new(0),
            capacity,
            completion: None,
            video_stabilization: false,
        }
    }

    /// Number the first admitted request with `frame`.
    pub fn starting_at(self, frame: FrameNumber) -> Self {
        {
            let mut inner = self.lock();
            inner.next_frame = frame;
            inner.next_drain = frame;
        }
        self
    }

    /// Raise `OUTPUT_DONE` on `signal` whenever the next result is ready.
    pub fn with_completion_signal(self, signal: Arc<Signal>) -> Self {
        RequestTracker {
            completion: Some(signal),
            ..self
        }
    }

    pub fn with_video_stabilization(self, video_stabilization: bool) -> Self {
        RequestTracker {
            video_stabilization,
            ..self
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn live(&self) -> MutexGuard<'_, usize> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Requests currently occupying a slot.
    pub fn len(&self) -> usize {
        *self.live()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    /// Admit a request into the slot after the insertion cursor.
    pub fn admit(&self, request: CaptureRequest) -> Result<AfIntent, Error> {
        let mut inner = self.lock();
        let mut live = self.live();
        if *live >= self.capacity {
            return Err(Error::QueueFull);
        }
        let index = inner.ring.next(inner.insertion);
        let slot = inner.ring.get(index);
        if slot.state != SlotState::Empty {
            error!(
                "request slot {} still holds frame {} ({})",
                index, slot.frame, slot.state
            );
            return Err(Error::SlotBusy(index.get()));
        }

        let frame = inner.next_frame;
        let intent = AfIntent {
            frame,
            af_mode: request.controls.af_mode,
            af_regions: request.controls.af_regions,
        };
        let pending = request.outputs;
        *inner.ring.get_mut(index) = RequestSlot {
            state: SlotState::Registered,
            frame,
            request: Some(request),
            pending,
            timestamp_ns: 0,
            metadata: DynamicMetadata::default(),
        };
        inner.insertion = index;
        inner.next_frame = frame.next();
        *live += 1;
        debug!(
            "registered frame {} in slot {} ({} in flight)",
            frame, index, *live
        );
        Ok(intent)
    }

    /// Move the next registered request to processing and stamp it on `shot`.
    pub fn mark_processing(&self, shot: &mut Shot) -> Result<(SlotIndex, FrameNumber), Error> {
        let mut inner = self.lock();
        if *self.live() == 0 {
            return Err(Error::NotFound);
        }
        let current = inner.ring.get(inner.processing).state;
        if inner.processing == inner.insertion
            && matches!(current, SlotState::Processing | SlotState::Captured)
        {
            trace!("processing caught up with insertion");
            return Err(Error::NotFound);
        }
        let index = inner.ring.next(inner.processing);
        if inner.ring.get(index).state != SlotState::Registered {
            return Err(Error::NotFound);
        }

        let aa_mode = if inner.stamped_once {
            None
        } else {
            Some(ControlMode::Auto)
        };
        inner.stamped_once = true;

        let slot = inner.ring.get_mut(index);
        slot.state = SlotState::Processing;
        let frame = slot.frame;
        let (outputs, crop_region) = slot
            .request
            .as_ref()
            .map(|r| (r.outputs, r.controls.crop_region))
            .unwrap_or_default();

        let mut directives = ShotDirectives::sensor_only();
        directives.route(outputs);
        shot.directives = directives;
        shot.ctl = ShotControl {
            frame_number: Some(frame),
            outputs,
            mode: aa_mode,
            frame_duration_ns: PROCESSING_FRAME_DURATION_NS,
            crop_region,
            ..ShotControl::default()
        };
        inner.processing = index;
        trace!("frame {} processing in slot {}", frame, index);
        Ok((index, frame))
    }

    /// Match a returning hardware frame to its processing slot.
    ///
    /// A miss leaves the table untouched.
    pub fn match_frame(&self, frame: FrameNumber) -> Result<SlotIndex, Error> {
        let mut inner = self.lock();
        if *self.live() == 0 {
            return Err(Error::NotFound);
        }
        let mut found = None;
        for (index, slot) in inner.ring.iter() {
            if !slot.is_live() || slot.frame != frame {
                continue;
            }
            if slot.state == SlotState::Processing {
                found = Some(index);
                break;
            }
            warn!(
                "frame {} matched slot {} in state {}",
                frame, index, slot.state
            );
        }
        let index = found.ok_or(Error::NotFound)?;
        inner.ring.get_mut(index).state = SlotState::Captured;
        Ok(index)
    }

    /// Copy a matched request's controls onto `shot`, stamping only the
    /// 3A values that changed since the previous stamp.
    pub fn update_isp_parameters(
        &self,
        frame: FrameNumber,
        shot: &mut Shot,
    ) -> Result<IspUpdate, Error> {
        let mut inner = self.lock();
        let index = inner.find(frame).ok_or(Error::NotFound)?;
        let request = inner
            .ring
            .get(index)
            .request
            .clone()
            .ok_or(Error::NotFound)?;
        let controls = &request.controls;

        let flash_ui_mode = (controls.ae_mode >= AeMode::On
            && matches!(
                controls.capture_intent,
                CaptureIntent::Preview | CaptureIntent::VideoRecord
            ))
        .then_some(controls.ae_mode);

        let mut ae_mode = controls.ae_mode.min(AeMode::On);
        if controls.ae_lock {
            ae_mode = AeMode::Locked;
        }
        let awb_mode = if controls.awb_lock {
            AwbMode::Locked
        } else {
            controls.awb_mode
        };

        let stabilization = controls.video_stabilization && self.video_stabilization;
        let mut directives = ShotDirectives::sensor_only();
        directives.dis_bypass = !stabilization;
        directives.dnr_bypass = !stabilization;
        directives.route(request.outputs);

        let frame_duration_ns = shot.ctl.frame_duration_ns;
        shot.ctl = ShotControl {
            frame_number: Some(frame),
            outputs: request.outputs,
            mode: delta(&mut inner.last_aa_mode, controls.mode),
            ae_mode: delta(&mut inner.last_ae_mode, ae_mode),
            awb_mode: delta(&mut inner.last_awb_mode, awb_mode),
            ae_exp_compensation: delta(
                &mut inner.last_ae_compensation,
                controls.ae_exp_compensation,
            ),
            ae_target_fps_range: controls.ae_target_fps_range,
            ae_flash_mode: None,
            af_mode: None,
            af_trigger: false,
            af_regions: controls.af_regions,
            scene_mode: controls.scene_mode,
            capture_intent: controls.capture_intent,
            flash_mode: controls.flash_mode,
            firing_power: 0,
            crop_region: controls.crop_region,
            frame_duration_ns,
            focus_distance: controls.focus_distance,
            face_detect: controls.face_detect,
        };
        shot.directives = directives;

        Ok(IspUpdate {
            flash_ui_mode,
            stabilization,
        })
    }

    pub fn register_timestamp(&self, frame: FrameNumber, timestamp_ns: i64) {
        let mut inner = self.lock();
        match inner.find(frame) {
            Some(index) => inner.ring.get_mut(index).timestamp_ns = timestamp_ns,
            None => warn!("no request for frame {} to timestamp", frame),
        }
    }

    /// Capture time of `frame`, or the last known capture time.
    pub fn timestamp_for(&self, frame: FrameNumber) -> i64 {
        let inner = self.lock();
        match inner.find(frame).map(|index| inner.ring.get(index).timestamp_ns) {
            Some(ts) if ts != 0 => ts,
            _ => inner.last_timestamp_ns,
        }
    }

    /// Output mask of `frame`, empty when the frame is unknown.
    pub fn outputs_for(&self, frame: FrameNumber) -> OutputMask {
        let inner = self.lock();
        inner
            .find(frame)
            .and_then(|index| inner.ring.get(index).request.as_ref().map(|r| r.outputs))
            .unwrap_or_default()
    }

    /// Merge the hardware's metadata into the captured slot of `frame`.
    pub fn apply_metadata(
        &self,
        frame: FrameNumber,
        metadata: &DynamicMetadata,
    ) -> Result<(), Error> {
        let mut inner = self.lock();
        let index = inner.find(frame).ok_or(Error::NotFound)?;
        let slot = inner.ring.get_mut(index);
        if slot.state != SlotState::Captured {
            error!("metadata for frame {} but slot is {}", frame, slot.state);
            return Err(Error::StateMismatch {
                index: index.get(),
                expected: SlotState::Captured.name(),
                found: slot.state.name(),
            });
        }
        slot.state = SlotState::MetadataReady;
        slot.metadata = DynamicMetadata {
            frame_number: Some(frame),
            timestamp_ns: slot.timestamp_ns,
            ..metadata.clone()
        };
        let timestamp_ns = slot.timestamp_ns;
        inner.last_timestamp_ns = timestamp_ns;
        self.check_completed(&mut inner, index);
        Ok(())
    }

    /// Complete a processing frame whose raw buffer was consumed without
    /// reaching the ISP. The client still gets a result, with no outputs.
    pub fn drop_frame(&self, frame: FrameNumber) -> Result<(), Error> {
        let mut inner = self.lock();
        let index = inner.find(frame).ok_or(Error::NotFound)?;
        let last_timestamp_ns = inner.last_timestamp_ns;
        let slot = inner.ring.get_mut(index);
        if slot.state != SlotState::Processing {
            return Err(Error::StateMismatch {
                index: index.get(),
                expected: SlotState::Processing.name(),
                found: slot.state.name(),
            });
        }
        warn!("dropping frame {} from slot {}", frame, index);
        if slot.timestamp_ns == 0 {
            slot.timestamp_ns = last_timestamp_ns;
        }
        slot.state = SlotState::MetadataReady;
        slot.pending = OutputMask::empty();
        slot.metadata = DynamicMetadata {
            frame_number: Some(frame),
            timestamp_ns: slot.timestamp_ns,
            ..DynamicMetadata::default()
        };
        let timestamp_ns = slot.timestamp_ns;
        inner.last_timestamp_ns = timestamp_ns;
        self.check_completed(&mut inner, index);
        Ok(())
    }

    /// Record that the scaler serving `group` is done with `frame`, clearing
    /// every requested output of that group. Repeated reports for a group
    /// already cleared change nothing.
    pub fn notify_output_delivered(&self, frame: FrameNumber, group: OutputMask) {
        let mut inner = self.lock();
        let Some(index) = inner.find(frame) else {
            warn!("output delivered for unknown frame {}", frame);
            return;
        };
        let slot = inner.ring.get_mut(index);
        if !slot.pending.intersects(group) {
            trace!("frame {} has no {:?} output pending", frame, group);
            return;
        }
        slot.pending.remove(group);
        self.check_completed(&mut inner, index);
    }

    fn check_completed(&self, inner: &mut TrackerInner, index: SlotIndex) -> bool {
        let next_drain = inner.next_drain;
        let slot = inner.ring.get_mut(index);
        if !matches!(slot.state, SlotState::MetadataReady | SlotState::Completed)
            || !slot.pending.is_empty()
        {
            return false;
        }
        slot.state = SlotState::Completed;
        if slot.frame != next_drain {
            trace!("frame {} completed ahead of {}", slot.frame, next_drain);
            return false;
        }
        if let Some(signal) = &self.completion {
            signal.set(SignalSet::OUTPUT_DONE);
        }
        true
    }

    /// Pop the next result in frame order if it is complete.
    pub fn drain(&self) -> Option<CompletedRequest> {
        let mut inner = self.lock();
        let frame = inner.next_drain;
        let index = inner.find(frame)?;
        if inner.ring.get(index).state != SlotState::Completed {
            return None;
        }
        let slot = std::mem::replace(inner.ring.get_mut(index), RequestSlot::empty());
        inner.next_drain = frame.next();
        {
            let mut live = self.live();
            *live = live.saturating_sub(1);
        }

        let next = inner.ring.next(index);
        if inner.ring.get(next).is_live() {
            self.check_completed(&mut inner, next);
        }

        let Some(request) = slot.request else {
            error!("slot {} completed frame {} without a request", index, frame);
            return None;
        };
        debug!("drained frame {} from slot {}", frame, index);

        Some(CompletedRequest {
            result: CaptureResult {
                frame_number: frame,
                handle: request.handle,
                timestamp_ns: slot.timestamp_ns,
                metadata: slot.metadata,
                af_state: ServiceAfState::Inactive,
            },
            request,
        })
    }

    /// Raise the output skip count to at least `count`.
    pub fn set_initial_skip(&self, count: u32) {
        let mut inner = self.lock();
        if count > inner.skip {
            inner.skip = count;
        }
    }

    /// Count down the output skip, returning the remaining count.
    pub fn next_skip(&self) -> u32 {
        let mut inner = self.lock();
        if inner.skip == 0 {
            return 0;
        }
        inner.skip -= 1;
        inner.skip
    }

    /// Drop every in-flight request, returning them to the caller.
    pub fn reset(&self) -> Vec<CaptureRequest> {
        let mut inner = self.lock();
        let mut dropped = Vec::new();
        for slot in inner.ring.iter_mut() {
            if let Some(request) = slot.request.take() {
                dropped.push(request);
            }
            *slot = RequestSlot::empty();
        }
        let last = inner.ring.prev(inner.ring.first());
        inner.insertion = last;
        inner.processing = last;
        inner.next_drain = inner.next_frame;
        inner.skip = 0;
        *self.live() = 0;
        if !dropped.is_empty() {
            debug!("reset dropped {} requests", dropped.len());
        }
        dropped
    }

    pub fn slot(&self, index: SlotIndex) -> (SlotState, FrameNumber, OutputMask) {
        let inner = self.lock();
        let slot = inner.ring.get(index);
        (slot.state, slot.frame, slot.pending)
    }

    /// State of every slot, in ring order.
    pub fn states(&self) -> Vec<SlotState> {
        self.lock().ring.iter().map(|(_, slot)| slot.state).collect()
    }

    /// Log the table at debug level.
    pub fn dump(&self) {
        let inner = self.lock();
        debug!(
            "tracker: {} in flight, insertion {}, processing {}, next drain {}",
            self.len(),
            inner.insertion,
            inner.processing,
            inner.next_drain
        );
        for (index, slot) in inner.ring.iter() {
            debug!(
                "  slot {}: {} frame {} pending {:?}",
                index, slot.state, slot.frame, slot.pending
            );
        }
    }
}
