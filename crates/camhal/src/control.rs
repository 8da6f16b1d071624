// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Per-frame control and metadata types.
//!
//! A [`CaptureRequest`] is what the client asks for. A [`Shot`] is what is
//! attached to a raw buffer on its way through the sensor and ISP: the
//! stamped [`ShotControl`] values, the [`ShotDirectives`] telling the
//! hardware which outputs to produce, and the [`DynamicMetadata`] the
//! hardware reports back.
//!
//! Fields of [`ShotControl`] wrapped in `Option` are delta-stamped: `None`
//! tells the hardware to keep its current setting.

use bitflags::bitflags;
use std::fmt;
use unix_ts::Timestamp;

/// Frame duration stamped when no fps ceiling applies, in nanoseconds.
pub const DEFAULT_FRAME_DURATION_NS: u64 = 33_333_000;

/// Frame duration stamped on newly marked and dummy shots, in nanoseconds.
pub const PROCESSING_FRAME_DURATION_NS: u64 = 33_000_000;

/// Monotonically increasing number correlating a hardware frame with the
/// request that asked for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FrameNumber(pub u32);

impl FrameNumber {
    /// Reserved number stamped on placeholder frames.
    pub const BUBBLE: FrameNumber = FrameNumber(0xffff_fffe);

    /// Number following `self`, wrapping around and never landing on
    /// [`FrameNumber::BUBBLE`].
    pub fn next(self) -> FrameNumber {
        let next = FrameNumber(self.0.wrapping_add(1));
        if next.is_bubble() {
            next.next()
        } else {
            next
        }
    }

    pub fn is_bubble(self) -> bool {
        self == Self::BUBBLE
    }
}

impl fmt::Display for FrameNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_bubble() {
            write!(f, "bubble")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

bitflags! {
    /// Output targets requested for a frame, one bit per stream id.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OutputMask: u8 {
        const PREVIEW = 1 << 0;
        const JPEG = 1 << 1;
        const RECORD = 1 << 2;
        const PREVIEW_CALLBACK = 1 << 3;
        const ZSL = 1 << 4;

        /// Targets produced by the preview scaler.
        const SCALER_PREVIEW =
            Self::PREVIEW.bits() | Self::RECORD.bits() | Self::PREVIEW_CALLBACK.bits();
        /// Targets produced by the capture scaler.
        const SCALER_CAPTURE = Self::JPEG.bits() | Self::ZSL.bits();
    }
}

/// 3A control mode (`android.control.mode`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControlMode {
    Off,
    #[default]
    Auto,
    UseSceneMode,
}

/// Auto-exposure mode. Ordering matters: the flash-capable modes compare
/// greater than [`AeMode::On`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum AeMode {
    Off,
    Locked,
    #[default]
    On,
    OnAutoFlash,
    OnAlwaysFlash,
    OnAutoFlashRedEye,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AwbMode {
    Off,
    #[default]
    Auto,
    Incandescent,
    Fluorescent,
    Daylight,
    CloudyDaylight,
    Locked,
}

/// Autofocus mode. `Infinity` and `ContinuousPictureFace` are only ever
/// stamped towards the hardware, never requested by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AfMode {
    #[default]
    Off,
    Auto,
    Macro,
    ContinuousVideo,
    ContinuousPicture,
    Manual,
    Infinity,
    ContinuousPictureFace,
}

impl AfMode {
    pub fn is_continuous(self) -> bool {
        matches!(self, AfMode::ContinuousVideo | AfMode::ContinuousPicture)
    }

    pub fn name(self) -> &'static str {
        match self {
            AfMode::Off => "off",
            AfMode::Auto => "auto",
            AfMode::Macro => "macro",
            AfMode::ContinuousVideo => "continuous-video",
            AfMode::ContinuousPicture => "continuous-picture",
            AfMode::Manual => "manual",
            AfMode::Infinity => "infinity",
            AfMode::ContinuousPictureFace => "continuous-picture-face",
        }
    }
}

impl fmt::Display for AfMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SceneMode {
    #[default]
    Unsupported,
    FacePriority,
    Action,
    Portrait,
    Landscape,
    Night,
    NightCapture,
    Sports,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureIntent {
    Custom,
    #[default]
    Preview,
    StillCapture,
    VideoRecord,
    VideoSnapshot,
    ZeroShutterLag,
}

/// Flash behaviour stamped by the flash sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AeFlashMode {
    Off,
    On,
    OnAlways,
    Auto,
    Capture,
}

/// Flash unit mode (`android.flash.mode`), plus `Nop` meaning untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlashMode {
    Nop,
    #[default]
    Off,
    Single,
    Torch,
}

/// Pre-flash outcome reported by the ISP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlashDecision {
    #[default]
    Pending,
    Fire,
    Skip,
}

/// Autofocus state as reported by the hardware for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HwAfState {
    #[default]
    Inactive,
    ActiveScan,
    AcquiredFocus,
    FailedFocus,
}

/// Autofocus state as presented to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServiceAfState {
    #[default]
    Inactive,
    PassiveScan,
    PassiveFocused,
    ActiveScan,
    FocusedLocked,
    NotFocusedLocked,
}

impl ServiceAfState {
    pub fn name(self) -> &'static str {
        match self {
            ServiceAfState::Inactive => "inactive",
            ServiceAfState::PassiveScan => "passive-scan",
            ServiceAfState::PassiveFocused => "passive-focused",
            ServiceAfState::ActiveScan => "active-scan",
            ServiceAfState::FocusedLocked => "focused-locked",
            ServiceAfState::NotFocusedLocked => "not-focused-locked",
        }
    }
}

impl fmt::Display for ServiceAfState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AeState {
    #[default]
    Inactive,
    Searching,
    Converged,
    Locked,
    FlashRequired,
    Precapture,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AwbState {
    #[default]
    Inactive,
    Searching,
    Converged,
    Locked,
}

/// Control values carried by a client request.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestControls {
    pub mode: ControlMode,
    pub ae_mode: AeMode,
    pub ae_lock: bool,
    pub ae_exp_compensation: i32,
    pub ae_target_fps_range: [u32; 2],
    pub awb_mode: AwbMode,
    pub awb_lock: bool,
    pub af_mode: AfMode,
    pub af_regions: [u32; 4],
    pub scene_mode: SceneMode,
    pub capture_intent: CaptureIntent,
    pub flash_mode: FlashMode,
    pub video_stabilization: bool,
    pub face_detect: bool,
    pub crop_region: [u32; 3],
    pub focus_distance: f32,
}

impl Default for RequestControls {
    fn default() -> Self {
        RequestControls {
            mode: ControlMode::Auto,
            ae_mode: AeMode::On,
            ae_lock: false,
            ae_exp_compensation: 0,
            ae_target_fps_range: [15, 30],
            awb_mode: AwbMode::Auto,
            awb_lock: false,
            af_mode: AfMode::Off,
            af_regions: [0; 4],
            scene_mode: SceneMode::Unsupported,
            capture_intent: CaptureIntent::Preview,
            flash_mode: FlashMode::Off,
            video_stabilization: false,
            face_detect: false,
            crop_region: [0; 3],
            focus_distance: 0.0,
        }
    }
}

/// Opaque client handle echoed back with the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestHandle(pub u64);

/// A client capture request.
///
/// The frame number is not part of the request; it is assigned by the
/// [`RequestTracker`](crate::tracker::RequestTracker) on admission.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRequest {
    pub handle: RequestHandle,
    pub outputs: OutputMask,
    pub controls: RequestControls,
}

impl CaptureRequest {
    pub fn new(handle: u64, outputs: OutputMask) -> Self {
        CaptureRequest {
            handle: RequestHandle(handle),
            outputs,
            controls: RequestControls::default(),
        }
    }

    pub fn with_controls(mut self, controls: RequestControls) -> Self {
        self.controls = controls;
        self
    }

    pub fn with_af_mode(mut self, mode: AfMode) -> Self {
        self.controls.af_mode = mode;
        self
    }

    pub fn with_af_regions(mut self, regions: [u32; 4]) -> Self {
        self.controls.af_regions = regions;
        self
    }

    pub fn with_ae_mode(mut self, mode: AeMode) -> Self {
        self.controls.ae_mode = mode;
        self
    }

    pub fn with_awb_mode(mut self, mode: AwbMode) -> Self {
        self.controls.awb_mode = mode;
        self
    }

    pub fn with_capture_intent(mut self, intent: CaptureIntent) -> Self {
        self.controls.capture_intent = intent;
        self
    }

    pub fn with_scene_mode(mut self, scene: SceneMode) -> Self {
        self.controls.scene_mode = scene;
        self
    }

    pub fn with_fps_range(mut self, min: u32, max: u32) -> Self {
        self.controls.ae_target_fps_range = [min, max];
        self
    }

    pub fn with_flash_mode(mut self, mode: FlashMode) -> Self {
        self.controls.flash_mode = mode;
        self
    }

    pub fn with_crop_region(mut self, crop: [u32; 3]) -> Self {
        self.controls.crop_region = crop;
        self
    }
}

/// Control values stamped onto a raw buffer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ShotControl {
    pub frame_number: Option<FrameNumber>,
    pub outputs: OutputMask,
    pub mode: Option<ControlMode>,
    pub ae_mode: Option<AeMode>,
    pub awb_mode: Option<AwbMode>,
    pub ae_exp_compensation: Option<i32>,
    pub ae_target_fps_range: [u32; 2],
    pub ae_flash_mode: Option<AeFlashMode>,
    pub af_mode: Option<AfMode>,
    pub af_trigger: bool,
    pub af_regions: [u32; 4],
    pub scene_mode: SceneMode,
    pub capture_intent: CaptureIntent,
    pub flash_mode: FlashMode,
    pub firing_power: u32,
    pub crop_region: [u32; 3],
    pub frame_duration_ns: u64,
    pub focus_distance: f32,
    pub face_detect: bool,
}

/// What the hardware is asked to do with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShotDirectives {
    pub request_sensor: bool,
    pub request_scp: bool,
    pub request_scc: bool,
    pub dis_bypass: bool,
    pub dnr_bypass: bool,
    pub fd_bypass: bool,
    pub drc_bypass: bool,
}

impl ShotDirectives {
    /// Sensor capture with every optional ISP block bypassed and no output.
    pub fn sensor_only() -> Self {
        ShotDirectives {
            request_sensor: true,
            request_scp: false,
            request_scc: false,
            dis_bypass: true,
            dnr_bypass: true,
            fd_bypass: true,
            drc_bypass: true,
        }
    }

    /// Set the scaler requests from an output mask.
    pub fn route(&mut self, outputs: OutputMask) {
        self.request_scp = outputs.intersects(OutputMask::SCALER_PREVIEW);
        self.request_scc = outputs.intersects(OutputMask::SCALER_CAPTURE);
    }
}

/// Values reported by the hardware for a processed frame.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DynamicMetadata {
    pub frame_number: Option<FrameNumber>,
    pub timestamp_ns: i64,
    pub af_state: HwAfState,
    pub af_mode: Option<AfMode>,
    pub ae_state: AeState,
    pub ae_mode: Option<AeMode>,
    pub awb_mode: Option<AwbMode>,
    pub flash_decision: FlashDecision,
    pub flash_firing_stable: bool,
    pub flash_mode: FlashMode,
    pub exposure_time_ns: u64,
    pub sensitivity: u32,
}

/// Everything attached to one raw buffer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Shot {
    pub ctl: ShotControl,
    pub directives: ShotDirectives,
    pub dm: DynamicMetadata,
}

impl Shot {
    /// Shot used to prime the sensor before any request is processed.
    pub fn dummy() -> Self {
        let mut shot = Shot::default();
        shot.ctl.frame_duration_ns = PROCESSING_FRAME_DURATION_NS;
        shot.directives.request_sensor = true;
        shot
    }
}

/// Result handed back to the client for one completed request.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureResult {
    pub frame_number: FrameNumber,
    pub handle: RequestHandle,
    pub timestamp_ns: i64,
    pub metadata: DynamicMetadata,
    pub af_state: ServiceAfState,
}

impl CaptureResult {
    /// Capture time of the frame.
    pub fn timestamp(&self) -> Timestamp {
        let secs = self.timestamp_ns.div_euclid(1_000_000_000);
        let nanos = self.timestamp_ns.rem_euclid(1_000_000_000);
        Timestamp::new(secs, nanos as u32)
    }
}

/// Sensor frame duration for the upper bound of an fps range.
pub fn frame_duration_for_fps(max_fps: u32) -> u64 {
    match max_fps {
        15 => 66_666_000,
        24 => 41_666_000,
        25 => 40_000_000,
        _ => DEFAULT_FRAME_DURATION_NS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaler_groups() {
        let all = OutputMask::all();
        assert_eq!(OutputMask::SCALER_PREVIEW | OutputMask::SCALER_CAPTURE, all);
        assert!(!OutputMask::SCALER_PREVIEW.intersects(OutputMask::SCALER_CAPTURE));
        let mut pending = OutputMask::PREVIEW | OutputMask::JPEG | OutputMask::ZSL;
        pending.remove(OutputMask::SCALER_CAPTURE);
        assert_eq!(pending, OutputMask::PREVIEW);
    }

    #[test]
    fn test_route() {
        let mut directives = ShotDirectives::sensor_only();
        directives.route(OutputMask::PREVIEW_CALLBACK | OutputMask::JPEG);
        assert!(directives.request_scp);
        assert!(directives.request_scc);
        directives.route(OutputMask::empty());
        assert!(!directives.request_scp);
        assert!(!directives.request_scc);
    }

    #[test]
    fn test_ae_mode_ordering() {
        assert!(AeMode::OnAutoFlash > AeMode::On);
        assert!(AeMode::OnAlwaysFlash >= AeMode::OnAutoFlash);
        assert!(AeMode::Locked < AeMode::On);
    }

    #[test]
    fn test_frame_duration() {
        assert_eq!(frame_duration_for_fps(15), 66_666_000);
        assert_eq!(frame_duration_for_fps(24), 41_666_000);
        assert_eq!(frame_duration_for_fps(25), 40_000_000);
        assert_eq!(frame_duration_for_fps(30), DEFAULT_FRAME_DURATION_NS);
        assert_eq!(frame_duration_for_fps(60), DEFAULT_FRAME_DURATION_NS);
    }

    #[test]
    fn test_frame_number_display() {
        assert_eq!(FrameNumber(42).to_string(), "42");
        assert_eq!(FrameNumber::BUBBLE.to_string(), "bubble");
        assert_eq!(FrameNumber(7).next(), FrameNumber(8));
    }

    #[test]
    fn test_frame_number_skips_bubble() {
        assert_eq!(FrameNumber(0xffff_fffd).next(), FrameNumber(0xffff_ffff));
        assert_eq!(FrameNumber(0xffff_ffff).next(), FrameNumber(0));
        assert!(!FrameNumber(0xffff_fffd).next().is_bubble());
    }
}
