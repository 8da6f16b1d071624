// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Autofocus state machine.
//!
//! Client triggers and cancels, and the per-frame focus state reported by
//! the hardware, are fed through one transition table per [`AfFamily`].
//! The controller also decides, once per frame, which AF mode and trigger
//! to stamp on the outgoing shot. AF and flash share a lock because an AF
//! trigger in auto mode may start a pre-flash and the focus result is held
//! back until that pre-flash finished.

use log::{debug, trace, warn};

use crate::{
    client::Notification,
    control::{AfMode, HwAfState, SceneMode, ServiceAfState, Shot},
    flash::{FlashController, FlashStep},
};

/// Inactive notifications tolerated after an automatic trigger.
pub const TRIGGER_TIMEOUT: u32 = 5;

/// Internal autofocus state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AfState {
    #[default]
    Inactive,
    NeedsCommand,
    Started,
    Scanning,
    Locked,
    Failed,
    NeedsDetermination,
    PassiveFocused,
}

/// Transition table selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfFamily {
    AutoMacro,
    ContinuousVideo,
    ContinuousPicture,
}

impl AfFamily {
    /// Family handling triggers and cancels for `mode`.
    pub fn for_command(mode: AfMode) -> Option<AfFamily> {
        match mode {
            AfMode::Auto | AfMode::Macro | AfMode::Manual | AfMode::Off => {
                Some(AfFamily::AutoMacro)
            }
            AfMode::ContinuousVideo => Some(AfFamily::ContinuousVideo),
            AfMode::ContinuousPicture => Some(AfFamily::ContinuousPicture),
            AfMode::Infinity | AfMode::ContinuousPictureFace => None,
        }
    }

    /// Family handling hardware notifications for `mode`.
    pub fn for_notification(mode: AfMode) -> Option<AfFamily> {
        match mode {
            AfMode::Auto | AfMode::Macro => Some(AfFamily::AutoMacro),
            AfMode::ContinuousVideo => Some(AfFamily::ContinuousVideo),
            AfMode::ContinuousPicture => Some(AfFamily::ContinuousPicture),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfEvent {
    Trigger,
    Cancel,
    Notification(HwAfState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Stay,
    To(AfState),
    Wrong,
}

use Transition::{Stay, To, Wrong};

#[derive(Debug, Clone)]
pub struct AfController {
    mode: AfMode,
    pending_mode: Option<AfMode>,
    state: AfState,
    service_state: ServiceAfState,
    trigger_id: i32,
    mode_update_required: bool,
    trigger_required: bool,
    lock_required: bool,
    hw_failed: bool,
    trigger_timeout: u32,
    region: [u32; 4],
    prev_scene: SceneMode,
    outbox: Vec<Notification>,
}

impl Default for AfController {
    fn default() -> Self {
        Self::new()
    }
}

impl AfController {
    pub fn new() -> Self {
        AfController {
            mode: AfMode::Off,
            pending_mode: None,
            state: AfState::Inactive,
            service_state: ServiceAfState::Inactive,
            trigger_id: 0,
            mode_update_required: false,
            trigger_required: false,
            lock_required: false,
            hw_failed: false,
            trigger_timeout: 0,
            region: [0; 4],
            prev_scene: SceneMode::Unsupported,
            outbox: Vec::new(),
        }
    }

    pub fn mode(&self) -> AfMode {
        self.mode
    }

    pub fn state(&self) -> AfState {
        self.state
    }

    pub fn service_state(&self) -> ServiceAfState {
        self.service_state
    }

    pub fn pending_mode(&self) -> Option<AfMode> {
        self.pending_mode
    }

    pub fn is_mode_update_required(&self) -> bool {
        self.mode_update_required
    }

    pub fn is_trigger_required(&self) -> bool {
        self.trigger_required
    }

    pub fn is_lock_required(&self) -> bool {
        self.lock_required
    }

    pub fn take_notifications(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.outbox)
    }

    fn report(&mut self, state: ServiceAfState) {
        if self.service_state != state || state == ServiceAfState::Inactive {
            self.outbox.push(Notification::Autofocus {
                state,
                trigger_id: self.trigger_id,
            });
        }
        self.service_state = state;
    }

    /// Switch AF mode. A change arriving before the previous one was
    /// stamped is parked and applied right after the next stamp.
    pub fn set_mode(&mut self, mode: AfMode) {
        if mode == self.mode {
            return;
        }
        if self.mode_update_required && self.mode != AfMode::Off {
            debug!("AF mode {} pending behind {}", mode, self.mode);
            self.pending_mode = Some(mode);
        } else {
            debug!("AF mode {} -> {}", self.mode, mode);
            self.mode_update_required = true;
            self.mode = mode;
            self.report(ServiceAfState::Inactive);
            self.state = AfState::Inactive;
        }
    }

    pub fn set_region(&mut self, region: [u32; 4]) {
        self.region = region;
    }

    pub fn on_trigger(&mut self, id: i32, flash: &mut FlashController) {
        self.trigger_id = id;
        if matches!(self.mode, AfMode::Auto | AfMode::Macro | AfMode::Manual) {
            flash.arm_for_af();
        }
        if self.mode == AfMode::Off {
            return;
        }
        if let Some(family) = AfFamily::for_command(self.mode) {
            self.dispatch(family, AfEvent::Trigger, flash);
        }
    }

    pub fn on_cancel(&mut self, id: i32, flash: &mut FlashController) {
        self.trigger_id = id;
        if let Some(family) = AfFamily::for_command(self.mode) {
            self.dispatch(family, AfEvent::Cancel, flash);
        }
    }

    /// Feed the focus state the hardware reported for a frame.
    pub fn on_notification(&mut self, hw: HwAfState, flash: &mut FlashController) {
        if let Some(family) = AfFamily::for_notification(self.mode) {
            self.dispatch(family, AfEvent::Notification(hw), flash);
        }
    }

    fn dispatch(&mut self, family: AfFamily, event: AfEvent, flash: &mut FlashController) {
        let before = self.state;
        let transition = match family {
            AfFamily::AutoMacro => self.auto_macro(event, flash),
            AfFamily::ContinuousVideo => self.continuous_video(event, flash),
            AfFamily::ContinuousPicture => self.continuous_picture(event, flash),
        };
        match transition {
            Stay => trace!("AF {:?} {:?}: stay in {:?}", family, event, before),
            To(next) => {
                debug!("AF {:?} {:?}: {:?} -> {:?}", family, event, before, next);
                self.state = next;
            }
            Wrong => warn!("AF {:?}: unexpected {:?} in {:?}", family, event, before),
        }
    }

    /// Settle on the focus result.
    fn settle(&mut self, focused: bool) -> Transition {
        if focused {
            self.report(ServiceAfState::FocusedLocked);
            To(AfState::Locked)
        } else {
            self.report(ServiceAfState::NotFocusedLocked);
            To(AfState::Failed)
        }
    }

    /// Focus result that waits for an AF pre-flash to finish first.
    fn flash_gated(
        &mut self,
        focused: bool,
        lock: bool,
        flash: &mut FlashController,
    ) -> Transition {
        if flash.is_af_sequence() {
            match flash.step() {
                FlashStep::OnDone => {
                    flash.set_step(FlashStep::AutoAeAwbLock);
                    Stay
                }
                FlashStep::AutoDone => {
                    flash.set_step(FlashStep::AutoOff);
                    self.lock_required |= lock;
                    self.settle(focused)
                }
                _ => Stay,
            }
        } else {
            self.lock_required |= lock;
            self.settle(focused)
        }
    }

    /// Reset a continuous family and start it again.
    fn restart(&mut self, mode: AfMode) -> Transition {
        self.set_mode(AfMode::Off);
        self.report(ServiceAfState::Inactive);
        self.set_mode(mode);
        To(AfState::Inactive)
    }

    fn auto_macro(&mut self, event: AfEvent, flash: &mut FlashController) -> Transition {
        use AfState::*;
        use HwAfState as Hw;
        match event {
            AfEvent::Trigger => match self.state {
                Inactive | PassiveFocused | Scanning | Locked | Failed => {
                    self.trigger_required = true;
                    To(NeedsCommand)
                }
                _ => Stay,
            },
            AfEvent::Cancel => {
                if flash.is_af_sequence() {
                    flash.set_step(FlashStep::AutoOff);
                }
                if self.state == Inactive {
                    self.report(ServiceAfState::Inactive);
                    Stay
                } else {
                    self.set_mode(AfMode::Off);
                    self.report(ServiceAfState::Inactive);
                    To(Inactive)
                }
            }
            AfEvent::Notification(hw) => match (self.state, hw) {
                (Inactive | NeedsCommand, _) => Stay,
                (Started, Hw::ActiveScan) => {
                    self.report(ServiceAfState::ActiveScan);
                    To(Scanning)
                }
                (Started, _) => Stay,
                (Scanning, Hw::Inactive) => Wrong,
                (Scanning, Hw::ActiveScan) => Stay,
                (Scanning, Hw::AcquiredFocus) => self.flash_gated(true, false, flash),
                (Scanning, Hw::FailedFocus) => self.flash_gated(false, false, flash),
                (Locked, Hw::AcquiredFocus) => Stay,
                (Failed, Hw::FailedFocus) => Stay,
                (Locked | Failed, _) => Wrong,
                (NeedsDetermination | PassiveFocused, _) => Stay,
            },
        }
    }

    fn continuous_video(&mut self, event: AfEvent, _flash: &mut FlashController) -> Transition {
        use AfState::*;
        use HwAfState as Hw;
        match event {
            AfEvent::Trigger => match self.state {
                Inactive => {
                    self.report(ServiceAfState::NotFocusedLocked);
                    To(Failed)
                }
                Started | Scanning => {
                    self.lock_required = true;
                    self.report(ServiceAfState::NotFocusedLocked);
                    To(Failed)
                }
                PassiveFocused => {
                    self.lock_required = true;
                    self.report(ServiceAfState::FocusedLocked);
                    To(Locked)
                }
                _ => Stay,
            },
            AfEvent::Cancel => match self.state {
                Inactive => Stay,
                _ => self.restart(AfMode::ContinuousVideo),
            },
            AfEvent::Notification(hw) => match (self.state, hw) {
                (Inactive | NeedsCommand, _) => Stay,
                (Started, Hw::ActiveScan) => {
                    self.report(ServiceAfState::PassiveScan);
                    To(Scanning)
                }
                (Started, Hw::AcquiredFocus) => {
                    self.report(ServiceAfState::PassiveFocused);
                    To(PassiveFocused)
                }
                (Started, Hw::FailedFocus) => {
                    self.report(ServiceAfState::NotFocusedLocked);
                    To(Failed)
                }
                (Started, Hw::Inactive) => Stay,
                (Scanning | PassiveFocused | NeedsDetermination, Hw::Inactive) => Wrong,
                (Scanning, Hw::AcquiredFocus) => {
                    self.report(ServiceAfState::PassiveFocused);
                    To(PassiveFocused)
                }
                (Scanning, _) => Stay,
                (PassiveFocused, Hw::ActiveScan) => {
                    self.report(ServiceAfState::PassiveScan);
                    To(Scanning)
                }
                (PassiveFocused, Hw::FailedFocus) => {
                    self.report(ServiceAfState::NotFocusedLocked);
                    To(Failed)
                }
                (PassiveFocused, Hw::AcquiredFocus) => Stay,
                (NeedsDetermination, Hw::AcquiredFocus) => {
                    self.lock_required = true;
                    self.report(ServiceAfState::FocusedLocked);
                    To(Locked)
                }
                (NeedsDetermination, Hw::FailedFocus) => {
                    self.report(ServiceAfState::NotFocusedLocked);
                    To(Failed)
                }
                (NeedsDetermination, Hw::ActiveScan) => Stay,
                (Locked, Hw::AcquiredFocus) => Stay,
                (Failed, Hw::FailedFocus) => Stay,
                (Locked | Failed, _) => Wrong,
            },
        }
    }

    fn continuous_picture(&mut self, event: AfEvent, flash: &mut FlashController) -> Transition {
        use AfState::*;
        use HwAfState as Hw;
        match event {
            AfEvent::Trigger => match self.state {
                Inactive => {
                    self.report(ServiceAfState::NotFocusedLocked);
                    To(Failed)
                }
                Started => {
                    self.hw_failed = false;
                    To(NeedsDetermination)
                }
                Scanning => {
                    self.hw_failed = false;
                    flash.arm_for_af();
                    To(NeedsDetermination)
                }
                PassiveFocused => {
                    self.lock_required = true;
                    let focused = !self.hw_failed;
                    self.hw_failed = false;
                    self.settle(focused)
                }
                _ => Stay,
            },
            AfEvent::Cancel => match self.state {
                Inactive => Stay,
                _ => self.restart(AfMode::ContinuousPicture),
            },
            AfEvent::Notification(hw) => match (self.state, hw) {
                (Inactive, _) => {
                    if self.trigger_timeout > 0 {
                        if self.trigger_timeout > TRIGGER_TIMEOUT {
                            warn!("no focus activity after trigger, restarting {}", self.mode);
                            let mode = self.mode;
                            self.set_mode(AfMode::Off);
                            self.set_mode(mode);
                            self.trigger_timeout = 0;
                        } else {
                            self.trigger_timeout += 1;
                        }
                    }
                    Stay
                }
                (NeedsCommand, _) => Stay,
                (Started, Hw::ActiveScan) => {
                    self.report(ServiceAfState::PassiveScan);
                    self.trigger_timeout = 0;
                    To(Scanning)
                }
                (Started, Hw::AcquiredFocus) => {
                    self.report(ServiceAfState::PassiveFocused);
                    self.trigger_timeout = 0;
                    To(PassiveFocused)
                }
                (Started, _) => Stay,
                (Scanning, Hw::Inactive) => Stay,
                (Scanning, Hw::ActiveScan) => {
                    self.hw_failed = false;
                    Stay
                }
                (Scanning, Hw::AcquiredFocus | Hw::FailedFocus) => {
                    self.hw_failed = hw == Hw::FailedFocus;
                    self.report(ServiceAfState::PassiveFocused);
                    To(PassiveFocused)
                }
                (PassiveFocused, Hw::Inactive) => Stay,
                (PassiveFocused, Hw::ActiveScan) => {
                    self.hw_failed = false;
                    self.report(ServiceAfState::PassiveScan);
                    To(Scanning)
                }
                (PassiveFocused, Hw::AcquiredFocus | Hw::FailedFocus) => {
                    self.hw_failed = hw == Hw::FailedFocus;
                    Stay
                }
                (NeedsDetermination, _)
                    if flash.is_af_sequence() && flash.step() < FlashStep::OnDone =>
                {
                    Stay
                }
                (NeedsDetermination, Hw::Inactive | Hw::ActiveScan) => Stay,
                (NeedsDetermination, Hw::AcquiredFocus) => self.flash_gated(true, true, flash),
                (NeedsDetermination, Hw::FailedFocus) => self.flash_gated(false, true, flash),
                (Locked, Hw::Inactive | Hw::AcquiredFocus) => Stay,
                (Locked, _) => Wrong,
                (Failed, Hw::ActiveScan) => To(Scanning),
                (Failed, Hw::FailedFocus) => Stay,
                (Failed, _) => Wrong,
            },
        }
    }

    /// Trigger the hardware. `keep_state` leaves a pending command as is.
    fn fire_trigger(&mut self, shot: &mut Shot, keep_state: bool) {
        if self.state == AfState::Scanning {
            debug!("AF trigger restarts scan");
        } else if !keep_state {
            if self.state == AfState::NeedsCommand {
                self.state = AfState::Started;
            } else {
                debug!("AF trigger in state {:?}", self.state);
            }
        }
        shot.ctl.af_trigger = true;
        shot.ctl.af_mode = Some(self.mode);
        self.trigger_required = false;
    }

    /// Stamp this frame's AF mode, trigger and region.
    pub fn stamp(&mut self, shot: &mut Shot, flash: &mut FlashController) {
        if self.prev_scene != shot.ctl.scene_mode {
            debug!("scene mode {:?}", shot.ctl.scene_mode);
            self.prev_scene = shot.ctl.scene_mode;
        }

        let mut triggered = false;
        if self.mode_update_required && flash.precapture_id() == 0 {
            debug!("applying AF mode {}", self.mode);
            shot.ctl.af_mode = Some(self.mode);
            if self.mode.is_continuous() {
                self.state = AfState::Started;
                shot.ctl.af_trigger = true;
                triggered = true;
                if self.mode == AfMode::ContinuousPicture
                    && matches!(self.prev_scene, SceneMode::Unsupported | SceneMode::FacePriority)
                {
                    shot.ctl.af_mode = Some(AfMode::ContinuousPictureFace);
                }
                flash.reset_af_flash();
                self.trigger_timeout = 1;
            }
            self.mode_update_required = false;
            if self.mode == AfMode::Manual && shot.ctl.focus_distance == 0.0 {
                shot.ctl.af_mode = Some(AfMode::Infinity);
                shot.ctl.af_trigger = true;
                triggered = true;
            }
            if let Some(mode) = self.pending_mode.take() {
                self.set_mode(mode);
            }
        } else {
            shot.ctl.af_mode = None;
        }

        if self.trigger_required {
            if flash.is_af_sequence() {
                if flash.step() == FlashStep::OnDone {
                    let keep_state = !matches!(self.mode, AfMode::Auto | AfMode::Macro);
                    self.fire_trigger(shot, keep_state);
                }
            } else {
                self.fire_trigger(shot, false);
            }
        } else {
            shot.ctl.af_trigger = false;
        }

        if triggered {
            shot.ctl.af_trigger = true;
        }
        if self.lock_required {
            shot.ctl.af_mode = Some(AfMode::Off);
            self.lock_required = false;
        }
        shot.ctl.af_regions = self.region;
    }
}
