// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Flash sequencer.
//!
//! The sequencer walks [`FlashStep`] once per produced frame. A pre-flash
//! is fired either by a precapture metering trigger or by an autofocus
//! trigger while the UI flash mode allows it. Once the ISP decided whether
//! the main flash is needed, AE and AWB are locked and the flash is turned
//! off again. A still capture then pins its frame while the main flash
//! fires, releasing the scaler outputs only once firing is stable.

use log::{debug, error, trace, warn};

use crate::{
    client::Notification,
    control::{
        AeFlashMode, AeMode, AeState, AwbMode, AwbState, CaptureIntent, DynamicMetadata,
        FlashDecision, FlashMode, FrameNumber, Shot, ShotControl,
    },
};

/// Frames to wait for a pre-flash decision before giving up on it.
pub const PRE_FIRE_TIMEOUT: u32 = 5;

/// Frames to wait for the AE/AWB lock, and then for the flash unit to
/// report off, before moving on regardless.
pub const LOCK_WAIT_TIMEOUT: u32 = 5;

/// Position in the flash sequence. Ordering follows the sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum FlashStep {
    #[default]
    None,
    On,
    OnWait,
    OnDone,
    AutoAeAwbLock,
    AeAwbLockWait,
    AutoWait,
    AutoDone,
    AutoOff,
    Capture,
    CaptureWait,
    CaptureJpeg,
    CaptureEnd,
}

#[derive(Debug, Clone)]
pub struct FlashController {
    available: bool,
    stable_timeout: u32,
    ui_mode: AeMode,
    enabled: bool,
    step: FlashStep,
    timeout: u32,
    decided: bool,
    af_flash_done: bool,
    frame: Option<FrameNumber>,
    torch: bool,
    precapture_id: i32,
    ae_notified: AeState,
    outbox: Vec<Notification>,
}

impl FlashController {
    pub fn new(available: bool, stable_timeout: u32) -> Self {
        FlashController {
            available,
            stable_timeout,
            ui_mode: AeMode::On,
            enabled: false,
            step: FlashStep::None,
            timeout: 0,
            decided: false,
            af_flash_done: false,
            frame: None,
            torch: false,
            precapture_id: 0,
            ae_notified: AeState::Inactive,
            outbox: Vec::new(),
        }
    }

    pub fn step(&self) -> FlashStep {
        self.step
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn ui_mode(&self) -> AeMode {
        self.ui_mode
    }

    pub fn set_ui_mode(&mut self, mode: AeMode) {
        if mode != self.ui_mode {
            debug!("flash UI mode {:?} -> {:?}", self.ui_mode, mode);
        }
        self.ui_mode = mode;
    }

    /// Whether the last pre-flash decided the main flash must fire.
    pub fn decided(&self) -> bool {
        self.decided
    }

    pub fn af_flash_done(&self) -> bool {
        self.af_flash_done
    }

    /// A pre-flash started by an autofocus trigger is in progress.
    pub fn is_af_sequence(&self) -> bool {
        self.enabled && self.af_flash_done
    }

    pub fn precapture_id(&self) -> i32 {
        self.precapture_id
    }

    /// The main flash holds its frame.
    pub fn is_capturing(&self) -> bool {
        self.step >= FlashStep::Capture
    }

    /// Frame pinned by the capture sequence.
    pub fn frame(&self) -> Option<FrameNumber> {
        self.frame
    }

    pub fn take_notifications(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.outbox)
    }

    pub(crate) fn set_step(&mut self, step: FlashStep) {
        trace!("flash step {:?} -> {:?}", self.step, step);
        self.step = step;
    }

    fn auto_flash_allowed(&self) -> bool {
        self.ui_mode >= AeMode::OnAutoFlash && self.available
    }

    /// Arm a pre-flash ahead of an autofocus scan.
    pub(crate) fn arm_for_af(&mut self) -> bool {
        if !self.auto_flash_allowed() || self.enabled {
            return false;
        }
        debug!("pre-flash armed for autofocus");
        self.enabled = true;
        self.step = FlashStep::On;
        self.decided = false;
        self.af_flash_done = true;
        true
    }

    /// Forget an autofocus pre-flash when continuous focus restarts.
    pub(crate) fn reset_af_flash(&mut self) {
        if self.af_flash_done {
            self.enabled = false;
            self.af_flash_done = false;
            self.decided = false;
            self.step = FlashStep::None;
        }
    }

    fn notify_ae(&mut self, state: AeState) {
        self.outbox.push(Notification::AutoExposure {
            state,
            trigger_id: self.precapture_id,
        });
    }

    fn notify_awb(&mut self, state: AwbState) {
        self.outbox.push(Notification::AutoWhiteBalance {
            state,
            trigger_id: self.precapture_id,
        });
    }

    /// Precapture metering trigger from the client.
    pub fn on_precapture_trigger(&mut self, id: i32) {
        self.precapture_id = id;
        self.ae_notified = AeState::Inactive;
        if self.auto_flash_allowed() {
            if !matches!(self.step, FlashStep::AutoDone | FlashStep::AutoOff) {
                self.step = FlashStep::On;
                self.enabled = true;
                self.timeout = 0;
            }
        } else {
            self.enabled = false;
            self.step = FlashStep::None;
        }
        debug!(
            "precapture trigger {} enabled={} step={:?}",
            id, self.enabled, self.step
        );
        self.notify_sensor();
    }

    /// Announce the start of precapture metering once.
    pub fn notify_sensor(&mut self) {
        if self.precapture_id > 0 && self.ae_notified != AeState::Precapture {
            self.notify_ae(AeState::Precapture);
            self.ae_notified = AeState::Precapture;
            self.notify_awb(AwbState::Converged);
        }
    }

    /// Report precapture metering progress after an ISP frame.
    pub fn notify_isp(&mut self) {
        if self.precapture_id <= 0 {
            return;
        }
        if self.enabled {
            match self.step {
                FlashStep::AutoDone | FlashStep::AutoOff => {
                    if self.ae_notified == AeState::Precapture {
                        self.notify_ae(AeState::Converged);
                        self.notify_awb(AwbState::Converged);
                        self.precapture_id = 0;
                    } else {
                        self.notify_ae(AeState::Precapture);
                        self.notify_awb(AwbState::Converged);
                        self.ae_notified = AeState::Precapture;
                    }
                }
                FlashStep::Capture
                | FlashStep::CaptureWait
                | FlashStep::CaptureJpeg
                | FlashStep::CaptureEnd => {
                    warn!("precapture still pending during flash capture");
                    self.step = FlashStep::AutoDone;
                    self.notify_ae(AeState::Converged);
                    self.notify_awb(AwbState::Converged);
                    self.precapture_id = 0;
                }
                _ => {}
            }
        } else if self.ae_notified == AeState::Precapture {
            self.notify_ae(AeState::Converged);
            self.notify_awb(AwbState::Converged);
            self.precapture_id = 0;
        }
    }

    /// Start the main flash for a still capture of `frame`.
    pub fn start_capture(&mut self, frame: FrameNumber, shot: &mut Shot) {
        let still = shot.ctl.capture_intent == CaptureIntent::StillCapture;
        if self.auto_flash_allowed() && still {
            if !self.decided {
                self.enabled = false;
                self.af_flash_done = false;
                self.step = FlashStep::None;
            } else if matches!(self.step, FlashStep::AutoDone | FlashStep::AutoOff) {
                debug!("flash capture start for frame {}", frame);
                shot.directives.request_scc = false;
                self.frame = Some(frame);
                self.enabled = true;
                self.af_flash_done = false;
                self.step = FlashStep::Capture;
            } else if self.step < FlashStep::AutoDone {
                error!("flash capture requested in step {:?}", self.step);
                shot.ctl.ae_flash_mode = Some(AeFlashMode::Off);
                self.enabled = false;
                self.af_flash_done = false;
                self.step = FlashStep::None;
            }
        } else if still {
            self.decided = false;
        }
    }

    /// Hand torch control back to the flash unit when the torch goes off.
    pub fn apply_torch(&mut self, ctl: &mut ShotControl) {
        if ctl.flash_mode == FlashMode::Torch {
            self.torch = true;
        } else if self.torch {
            ctl.flash_mode = FlashMode::Off;
            ctl.firing_power = 0;
            self.torch = false;
        } else {
            ctl.flash_mode = FlashMode::Nop;
        }
    }

    /// Advance on what the sensor reported for the frame.
    pub fn listen_sensor(&mut self, dm: &DynamicMetadata) {
        if self.step != FlashStep::AutoWait {
            return;
        }
        if !self.decided || dm.flash_mode == FlashMode::Off {
            self.set_step(FlashStep::AutoDone);
        } else if self.timeout == 0 {
            warn!("flash never reported off, continuing");
            self.set_step(FlashStep::AutoDone);
        } else {
            self.timeout -= 1;
        }
    }

    /// Stamp the flash controls for the current step.
    pub fn apply_setter(&mut self, shot: &mut Shot) {
        let ctl = &mut shot.ctl;
        let directives = &mut shot.directives;
        match self.step {
            FlashStep::On => {
                if self.precapture_id > 0 && self.timeout != 0 {
                    self.timeout -= 1;
                    return;
                }
                ctl.ae_flash_mode = Some(if self.ui_mode == AeMode::OnAlwaysFlash {
                    AeFlashMode::OnAlways
                } else {
                    AeFlashMode::On
                });
                self.timeout = PRE_FIRE_TIMEOUT;
                self.set_step(FlashStep::OnWait);
            }
            FlashStep::OnDone => {
                if !self.af_flash_done {
                    self.set_step(FlashStep::AutoAeAwbLock);
                }
            }
            FlashStep::AutoAeAwbLock => {
                ctl.ae_flash_mode = Some(AeFlashMode::Auto);
                ctl.awb_mode = Some(AwbMode::Locked);
                self.timeout = LOCK_WAIT_TIMEOUT;
                self.set_step(FlashStep::AeAwbLockWait);
            }
            FlashStep::AeAwbLockWait | FlashStep::AutoWait => {
                ctl.ae_mode = None;
                ctl.awb_mode = None;
            }
            FlashStep::AutoDone => {
                ctl.ae_flash_mode = Some(AeFlashMode::Off);
            }
            FlashStep::AutoOff => {
                ctl.ae_flash_mode = Some(AeFlashMode::Off);
                self.enabled = false;
            }
            FlashStep::Capture => {
                self.timeout = self.stable_timeout;
                ctl.ae_flash_mode = Some(AeFlashMode::Capture);
                directives.request_scc = false;
                directives.request_scp = false;
                self.set_step(FlashStep::CaptureWait);
            }
            FlashStep::CaptureWait => {
                directives.request_scc = false;
                directives.request_scp = false;
            }
            FlashStep::CaptureJpeg => {
                directives.request_scc = true;
                directives.request_scp = true;
                self.set_step(FlashStep::CaptureEnd);
            }
            FlashStep::CaptureEnd => {
                ctl.ae_flash_mode = Some(AeFlashMode::Off);
                directives.request_scc = false;
                directives.request_scp = false;
                self.enabled = false;
                self.af_flash_done = false;
                self.frame = None;
                self.set_step(FlashStep::None);
            }
            FlashStep::None | FlashStep::OnWait => {}
        }
    }

    /// Advance on what the ISP reported for the frame.
    pub fn listen_isp(&mut self, dm: &DynamicMetadata) {
        match self.step {
            FlashStep::OnWait => match dm.flash_decision {
                FlashDecision::Fire | FlashDecision::Skip => {
                    self.decided = dm.flash_decision == FlashDecision::Fire;
                    debug!("pre-flash decision: fire={}", self.decided);
                    self.set_step(FlashStep::OnDone);
                }
                FlashDecision::Pending if self.timeout == 0 => {
                    warn!("no pre-flash decision, continuing without flash");
                    self.decided = false;
                    self.set_step(FlashStep::OnDone);
                }
                FlashDecision::Pending => self.timeout -= 1,
            },
            FlashStep::AeAwbLockWait => {
                if dm.awb_mode == Some(AwbMode::Locked) {
                    self.timeout = LOCK_WAIT_TIMEOUT;
                    self.set_step(FlashStep::AutoWait);
                } else if self.timeout == 0 {
                    warn!("AWB never locked, continuing");
                    self.timeout = LOCK_WAIT_TIMEOUT;
                    self.set_step(FlashStep::AutoWait);
                } else {
                    self.timeout -= 1;
                }
            }
            FlashStep::CaptureWait => {
                if !self.decided || dm.flash_firing_stable {
                    self.set_step(FlashStep::CaptureJpeg);
                } else if self.timeout == 0 {
                    error!("flash never became stable, capturing anyway");
                    self.set_step(FlashStep::CaptureJpeg);
                } else {
                    self.timeout -= 1;
                }
            }
            _ => {}
        }
    }

    /// Report the AE state a still capture should see.
    pub fn override_ae_state(&self, dm: &mut DynamicMetadata) {
        match self.ui_mode {
            AeMode::On => dm.ae_state = AeState::Converged,
            AeMode::OnAutoFlash if self.decided && self.af_flash_done => {
                dm.ae_state = AeState::FlashRequired
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auto_flash() -> FlashController {
        let mut flash = FlashController::new(true, 3);
        flash.set_ui_mode(AeMode::OnAutoFlash);
        flash
    }

    fn dm_decision(decision: FlashDecision) -> DynamicMetadata {
        DynamicMetadata {
            flash_decision: decision,
            ..DynamicMetadata::default()
        }
    }

    /// One drive cycle: sensor listener, setter, ISP listener.
    fn cycle(flash: &mut FlashController, shot: &mut Shot, isp: &DynamicMetadata) {
        flash.listen_sensor(&shot.dm);
        flash.apply_setter(shot);
        flash.listen_isp(isp);
    }

    #[test]
    fn test_precapture_without_flash() {
        let mut flash = FlashController::new(true, 3);
        flash.on_precapture_trigger(7);
        assert!(!flash.is_enabled());
        assert_eq!(flash.step(), FlashStep::None);
        assert_eq!(
            flash.take_notifications(),
            vec![
                Notification::AutoExposure {
                    state: AeState::Precapture,
                    trigger_id: 7
                },
                Notification::AutoWhiteBalance {
                    state: AwbState::Converged,
                    trigger_id: 7
                },
            ]
        );
        flash.notify_sensor();
        assert!(flash.take_notifications().is_empty());

        flash.notify_isp();
        let notes = flash.take_notifications();
        assert_eq!(
            notes[0],
            Notification::AutoExposure {
                state: AeState::Converged,
                trigger_id: 7
            }
        );
        assert_eq!(flash.precapture_id(), 0);
    }

    #[test]
    fn test_full_precapture_sequence() {
        let mut flash = auto_flash();
        flash.on_precapture_trigger(3);
        flash.take_notifications();
        assert_eq!(flash.step(), FlashStep::On);

        let mut shot = Shot::default();
        cycle(&mut flash, &mut shot, &dm_decision(FlashDecision::Fire));
        assert_eq!(shot.ctl.ae_flash_mode, Some(AeFlashMode::On));
        assert_eq!(flash.step(), FlashStep::OnDone);
        assert!(flash.decided());

        let mut shot = Shot::default();
        cycle(&mut flash, &mut shot, &DynamicMetadata::default());
        assert_eq!(flash.step(), FlashStep::AutoAeAwbLock);

        let mut shot = Shot::default();
        let locked = DynamicMetadata {
            awb_mode: Some(AwbMode::Locked),
            ..DynamicMetadata::default()
        };
        cycle(&mut flash, &mut shot, &locked);
        assert_eq!(shot.ctl.awb_mode, Some(AwbMode::Locked));
        assert_eq!(shot.ctl.ae_flash_mode, Some(AeFlashMode::Auto));
        assert_eq!(flash.step(), FlashStep::AutoWait);

        // Sensor reports the flash unit off.
        let mut shot = Shot::default();
        shot.dm.flash_mode = FlashMode::Off;
        cycle(&mut flash, &mut shot, &DynamicMetadata::default());
        assert_eq!(flash.step(), FlashStep::AutoDone);
        assert_eq!(shot.ctl.ae_flash_mode, Some(AeFlashMode::Off));

        flash.notify_isp();
        assert!(flash
            .take_notifications()
            .contains(&Notification::AutoExposure {
                state: AeState::Converged,
                trigger_id: 3
            }));
    }

    #[test]
    fn test_pre_fire_timeout() {
        let mut flash = auto_flash();
        flash.on_precapture_trigger(1);
        let mut shot = Shot::default();
        flash.apply_setter(&mut shot);
        assert_eq!(flash.step(), FlashStep::OnWait);
        for _ in 0..PRE_FIRE_TIMEOUT {
            flash.listen_isp(&DynamicMetadata::default());
            assert_eq!(flash.step(), FlashStep::OnWait);
        }
        flash.listen_isp(&DynamicMetadata::default());
        assert_eq!(flash.step(), FlashStep::OnDone);
        assert!(!flash.decided());
    }

    /// Walk a precapture with a fire decision up to the AE/AWB lock wait.
    fn waiting_for_lock() -> FlashController {
        let mut flash = auto_flash();
        flash.on_precapture_trigger(4);
        let mut shot = Shot::default();
        cycle(&mut flash, &mut shot, &dm_decision(FlashDecision::Fire));
        cycle(&mut flash, &mut Shot::default(), &DynamicMetadata::default());
        flash.apply_setter(&mut Shot::default());
        assert_eq!(flash.step(), FlashStep::AeAwbLockWait);
        flash
    }

    #[test]
    fn test_lock_wait_times_out() {
        let mut flash = waiting_for_lock();
        let unlocked = DynamicMetadata {
            awb_mode: Some(AwbMode::Auto),
            ..DynamicMetadata::default()
        };
        for _ in 0..LOCK_WAIT_TIMEOUT {
            flash.listen_isp(&unlocked);
            assert_eq!(flash.step(), FlashStep::AeAwbLockWait);
        }
        flash.listen_isp(&unlocked);
        assert_eq!(flash.step(), FlashStep::AutoWait);
    }

    #[test]
    fn test_auto_wait_times_out() {
        let mut flash = waiting_for_lock();
        flash.listen_isp(&DynamicMetadata {
            awb_mode: Some(AwbMode::Locked),
            ..DynamicMetadata::default()
        });
        assert_eq!(flash.step(), FlashStep::AutoWait);

        let firing = DynamicMetadata {
            flash_mode: FlashMode::Single,
            ..DynamicMetadata::default()
        };
        for _ in 0..LOCK_WAIT_TIMEOUT {
            flash.listen_sensor(&firing);
            assert_eq!(flash.step(), FlashStep::AutoWait);
        }
        flash.listen_sensor(&firing);
        assert_eq!(flash.step(), FlashStep::AutoDone);

        flash.notify_isp();
        assert!(flash
            .take_notifications()
            .contains(&Notification::AutoExposure {
                state: AeState::Converged,
                trigger_id: 4
            }));
    }

    fn ready_for_capture() -> FlashController {
        let mut flash = auto_flash();
        flash.on_precapture_trigger(1);
        let mut shot = Shot::default();
        flash.apply_setter(&mut shot);
        flash.listen_isp(&dm_decision(FlashDecision::Fire));
        flash.set_step(FlashStep::AutoDone);
        flash
    }

    #[test]
    fn test_capture_reaches_jpeg_on_stable() {
        let mut flash = ready_for_capture();
        let mut shot = Shot::default();
        shot.ctl.capture_intent = CaptureIntent::StillCapture;
        shot.directives.request_scc = true;
        flash.start_capture(FrameNumber(9), &mut shot);
        assert_eq!(flash.step(), FlashStep::Capture);
        assert!(flash.is_capturing());
        assert_eq!(flash.frame(), Some(FrameNumber(9)));
        assert!(!shot.directives.request_scc);

        let stable = DynamicMetadata {
            flash_firing_stable: true,
            ..DynamicMetadata::default()
        };
        let mut shot = Shot::default();
        cycle(&mut flash, &mut shot, &stable);
        assert_eq!(shot.ctl.ae_flash_mode, Some(AeFlashMode::Capture));
        assert_eq!(flash.step(), FlashStep::CaptureJpeg);

        let mut shot = Shot::default();
        flash.apply_setter(&mut shot);
        assert!(shot.directives.request_scc && shot.directives.request_scp);
        assert_eq!(flash.step(), FlashStep::CaptureEnd);

        let mut shot = Shot::default();
        flash.apply_setter(&mut shot);
        assert_eq!(flash.step(), FlashStep::None);
        assert!(!flash.is_enabled());
        assert_eq!(flash.frame(), None);
    }

    #[test]
    fn test_capture_reaches_jpeg_on_timeout() {
        let mut flash = ready_for_capture();
        let mut shot = Shot::default();
        shot.ctl.capture_intent = CaptureIntent::StillCapture;
        flash.start_capture(FrameNumber(2), &mut shot);
        flash.apply_setter(&mut shot);
        assert_eq!(flash.step(), FlashStep::CaptureWait);
        for _ in 0..3 {
            flash.listen_isp(&DynamicMetadata::default());
            assert_eq!(flash.step(), FlashStep::CaptureWait);
        }
        flash.listen_isp(&DynamicMetadata::default());
        assert_eq!(flash.step(), FlashStep::CaptureJpeg);
    }

    #[test]
    fn test_capture_without_decision_resets() {
        let mut flash = auto_flash();
        let mut shot = Shot::default();
        shot.ctl.capture_intent = CaptureIntent::StillCapture;
        flash.start_capture(FrameNumber(1), &mut shot);
        assert_eq!(flash.step(), FlashStep::None);
        assert!(!flash.is_capturing());
    }

    #[test]
    fn test_torch_hand_off() {
        let mut flash = FlashController::new(true, 3);
        let mut ctl = ShotControl {
            flash_mode: FlashMode::Torch,
            firing_power: 5,
            ..ShotControl::default()
        };
        flash.apply_torch(&mut ctl);
        assert_eq!(ctl.flash_mode, FlashMode::Torch);

        let mut ctl = ShotControl {
            flash_mode: FlashMode::Off,
            firing_power: 5,
            ..ShotControl::default()
        };
        flash.apply_torch(&mut ctl);
        assert_eq!(ctl.flash_mode, FlashMode::Off);
        assert_eq!(ctl.firing_power, 0);

        let mut ctl = ShotControl::default();
        flash.apply_torch(&mut ctl);
        assert_eq!(ctl.flash_mode, FlashMode::Nop);
    }

    #[test]
    fn test_ae_state_override() {
        let mut flash = FlashController::new(true, 3);
        let mut dm = DynamicMetadata::default();
        flash.override_ae_state(&mut dm);
        assert_eq!(dm.ae_state, AeState::Converged);

        flash.set_ui_mode(AeMode::OnAutoFlash);
        flash.arm_for_af();
        flash.decided = true;
        let mut dm = DynamicMetadata::default();
        flash.override_ae_state(&mut dm);
        assert_eq!(dm.ae_state, AeState::FlashRequired);
    }

    #[test]
    fn test_unavailable_flash_never_arms() {
        let mut flash = FlashController::new(false, 3);
        flash.set_ui_mode(AeMode::OnAlwaysFlash);
        assert!(!flash.arm_for_af());
        flash.on_precapture_trigger(2);
        assert!(!flash.is_enabled());
    }
}
