// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Sensor and ISP drive loop.
//!
//! One cycle takes a captured raw buffer from the sensor, stamps the
//! matching request's controls on it (or a placeholder when no request
//! matches), runs it through the ISP, reports the produced outputs to the
//! stream loops and queues a fresh buffer to the sensor.

use log::{debug, error, info, trace, warn};
use std::sync::{atomic::Ordering, Arc};

use super::{Controls, Flow, Shared};
use crate::{
    control::{
        frame_duration_for_fps, AeFlashMode, AeMode, AfMode, CaptureIntent, FlashMode,
        FrameNumber, OutputMask, SceneMode, Shot, ShotDirectives, DEFAULT_FRAME_DURATION_NS,
    },
    hw::DeviceKind,
    signal::SignalSet,
    stream::Scaler,
    Error,
};

/// Cycles a night still capture holds its frame before releasing outputs.
const NIGHT_FRAMES: u32 = 4;
const NIGHT_FPS: [u32; 2] = [2, 30];
const NIGHT_BUBBLE_FPS: [u32; 2] = [8, 30];
const BUBBLE_FPS: [u32; 2] = [15, 30];

pub struct DriveLoop {
    shared: Arc<Shared>,
    night_count: u32,
    night_frame: Option<FrameNumber>,
    last_scene: SceneMode,
    cycles: u64,
    bubbles: u64,
}

impl DriveLoop {
    pub fn new(shared: Arc<Shared>) -> Self {
        DriveLoop {
            shared,
            night_count: 0,
            night_frame: None,
            last_scene: SceneMode::Unsupported,
            cycles: 0,
            bubbles: 0,
        }
    }

    pub fn handle(&mut self, bits: SignalSet) -> Flow {
        if bits.contains(SignalSet::RELEASE) {
            self.release();
            return Flow::Exit;
        }
        if bits.contains(SignalSet::START_PROCESSING) {
            self.cycle();
        }
        Flow::Continue
    }

    fn cycle(&mut self) {
        let shared = self.shared.clone();
        let (raw, sensor_shot) = match shared.hw.dequeue(DeviceKind::Sensor) {
            Ok(captured) => captured,
            Err(err) => {
                warn!("{}", err);
                self.refill();
                return;
            }
        };
        self.cycles += 1;

        let sensor_frame = sensor_shot.ctl.frame_number;
        match shared.pool.index(raw) {
            Some(index) => {
                let frame = sensor_frame.unwrap_or(FrameNumber::BUBBLE);
                if let Err(err) = shared.pool.release_from_capture(index, frame) {
                    error!("sensor buffer {}: {}", raw, err);
                }
            }
            None => error!("sensor returned unknown buffer {}", raw),
        }

        let mut shot = sensor_shot;
        let matched = match self.pick_frame(sensor_frame) {
            Some(frame) => self.stamp_matched(frame, &mut shot).then_some(frame),
            None => None,
        };
        if matched.is_none() {
            shot = self.bubble_shot(shot);
        }
        let requested = shot.directives;

        if let Some(mut out) = self.run_isp(shot) {
            match matched {
                Some(frame) => self.finish_matched(frame, &mut out, requested),
                None => self.finish_bubble(&out),
            }
        }

        let marked = self.refill();
        if !shared.is_closing() && (matched.is_none() || !marked) {
            shared.drive.set(SignalSet::START_PROCESSING);
        }
    }

    /// Frame the ISP works on this cycle, `None` for a bubble.
    fn pick_frame(&mut self, sensor_frame: Option<FrameNumber>) -> Option<FrameNumber> {
        let shared = &self.shared;
        let pinned = if self.night_count != 0 {
            self.night_frame
        } else {
            let controls = shared.controls();
            if controls.flash.is_capturing() {
                controls.flash.frame()
            } else {
                None
            }
        };

        let sensor_frame = sensor_frame.filter(|frame| !frame.is_bubble());
        if let Some(frame) = pinned {
            if let Some(other) = sensor_frame.filter(|other| *other != frame) {
                match shared.tracker.drop_frame(other) {
                    Ok(()) => {}
                    Err(Error::NotFound) => trace!("no request for frame {}", other),
                    Err(err) => debug!("frame {} not dropped: {}", other, err),
                }
            }
            return Some(frame);
        }

        let frame = sensor_frame?;
        match shared.tracker.match_frame(frame) {
            Ok(_) => Some(frame),
            Err(err) => {
                debug!("frame {} unmatched: {}", frame, err);
                None
            }
        }
    }

    /// Stamp the request of `frame` on `shot`. Returns `false` when the
    /// request is gone and the cycle must fall back to a bubble.
    fn stamp_matched(&mut self, frame: FrameNumber, shot: &mut Shot) -> bool {
        let shared = self.shared.clone();
        let timestamp_ns = if shot.dm.timestamp_ns != 0 {
            shot.dm.timestamp_ns
        } else {
            crate::timestamp()
        };
        shared.tracker.register_timestamp(frame, timestamp_ns);

        let update = match shared.tracker.update_isp_parameters(frame, shot) {
            Ok(update) => update,
            Err(err) => {
                warn!("frame {} lost its request: {}", frame, err);
                return false;
            }
        };
        shared
            .stabilization
            .store(update.stabilization, Ordering::Relaxed);

        let mut controls = shared.controls();
        let Controls { af, flash } = &mut *controls;
        if let Some(mode) = update.flash_ui_mode {
            flash.set_ui_mode(mode);
        }
        af.stamp(shot, flash);

        self.last_scene = shot.ctl.scene_mode;
        if shot.ctl.scene_mode == SceneMode::Night && shot.ctl.ae_mode == Some(AeMode::Locked) {
            shot.ctl.ae_mode = Some(AeMode::On);
        }
        self.night_sequence(frame, shot);

        let fps = &mut shot.ctl.ae_target_fps_range;
        shot.ctl.frame_duration_ns = frame_duration_for_fps(fps[1]);
        fps[1] = 30;

        flash.notify_sensor();
        flash.start_capture(frame, shot);
        flash.apply_torch(&mut shot.ctl);
        if flash.is_enabled() {
            flash.listen_sensor(&shot.dm);
            flash.apply_setter(shot);
        }
        true
    }

    fn night_sequence(&mut self, frame: FrameNumber, shot: &mut Shot) {
        match self.night_count {
            0 => {
                if shot.ctl.scene_mode != SceneMode::Night
                    || shot.ctl.capture_intent != CaptureIntent::StillCapture
                {
                    return;
                }
                debug!("night capture holds frame {}", frame);
                self.night_count = NIGHT_FRAMES;
                self.night_frame = Some(frame);
                shot.ctl.scene_mode = SceneMode::NightCapture;
                shot.ctl.ae_target_fps_range = NIGHT_FPS;
                shot.directives.request_scc = false;
            }
            1 => {
                debug!("night capture of frame {} done", frame);
                self.night_count = 0;
                self.night_frame = None;
                shot.ctl.ae_target_fps_range = [30, 30];
                shot.directives.request_scc =
                    shot.ctl.outputs.intersects(OutputMask::SCALER_CAPTURE);
            }
            _ => {
                self.night_count -= 1;
                shot.ctl.scene_mode = SceneMode::NightCapture;
                shot.ctl.ae_target_fps_range = NIGHT_FPS;
                shot.directives.request_scc = false;
            }
        }
    }

    /// Placeholder that keeps the sensor and ISP cadence without output.
    fn bubble_shot(&mut self, sensor_shot: Shot) -> Shot {
        self.bubbles += 1;
        let owed = &self.shared.bubbles;
        if owed.load(Ordering::Relaxed) > 0 {
            owed.fetch_sub(1, Ordering::Relaxed);
            trace!("stabilization bubble");
        }

        let mut shot = Shot {
            directives: ShotDirectives::sensor_only(),
            dm: sensor_shot.dm,
            ..Shot::default()
        };
        let ctl = &mut shot.ctl;
        ctl.frame_number = Some(FrameNumber::BUBBLE);
        ctl.scene_mode = self.last_scene;
        ctl.ae_target_fps_range = if self.last_scene == SceneMode::Night {
            NIGHT_BUBBLE_FPS
        } else {
            BUBBLE_FPS
        };
        ctl.ae_flash_mode = Some(AeFlashMode::Off);
        ctl.flash_mode = FlashMode::Off;
        ctl.frame_duration_ns = DEFAULT_FRAME_DURATION_NS;
        shot
    }

    /// Queue the filled buffer to the ISP and take back its oldest result.
    fn run_isp(&self, shot: Shot) -> Option<Shot> {
        let shared = &self.shared;
        let (index, _) = shared
            .pool
            .acquire_for_isp()
            .map_err(|err| error!("no buffer for the ISP: {}", err))
            .ok()?;
        shared
            .hw
            .enqueue(DeviceKind::Isp, index.get(), shot)
            .map_err(|err| error!("{}", err))
            .ok()?;

        let (head, _) = shared
            .pool
            .acquire_for_isp_dequeue()
            .map_err(|err| error!("ISP head: {}", err))
            .ok()?;
        let (raw, out) = shared
            .hw
            .dequeue(DeviceKind::Isp)
            .map_err(|err| error!("{}", err))
            .ok()?;
        if raw != head.get() {
            error!("ISP returned buffer {} but {} was expected", raw, head);
        }
        if let Err(err) = shared.pool.release_from_isp(head) {
            error!("ISP buffer {}: {}", head, err);
        }

        {
            let mut controls = shared.controls();
            if controls.flash.is_enabled() {
                controls.flash.listen_isp(&out.dm);
            }
        }
        Some(out)
    }

    fn finish_matched(&mut self, frame: FrameNumber, out: &mut Shot, requested: ShotDirectives) {
        let shared = self.shared.clone();
        let notifications = {
            let mut controls = shared.controls();
            let Controls { af, flash } = &mut *controls;
            if out.ctl.scene_mode != SceneMode::Night {
                flash.override_ae_state(&mut out.dm);
            }
            if out.dm.af_mode == Some(AfMode::ContinuousPictureFace) {
                out.dm.af_mode = Some(AfMode::ContinuousPicture);
            }
            if self.night_count == 0 && !flash.is_capturing() {
                if let Err(err) = shared.tracker.apply_metadata(frame, &out.dm) {
                    error!("metadata for frame {}: {}", frame, err);
                }
            }

            let produced = out.directives;
            if requested.request_scc && !produced.request_scc {
                debug!("capture output of frame {} dropped", frame);
                shared
                    .tracker
                    .notify_output_delivered(frame, Scaler::Capture.outputs());
            }
            if requested.request_scp && !produced.request_scp {
                debug!("preview output of frame {} dropped", frame);
                shared
                    .tracker
                    .notify_output_delivered(frame, Scaler::Preview.outputs());
            }
            if produced.request_scc {
                shared.output_ready(Scaler::Capture);
            }
            if produced.request_scp {
                shared.output_ready(Scaler::Preview);
            }

            af.on_notification(out.dm.af_state, flash);
            flash.notify_isp();
            controls.take_notifications()
        };
        shared.client.notify_all(notifications);
    }

    fn finish_bubble(&mut self, out: &Shot) {
        let notifications = {
            let mut controls = self.shared.controls();
            let Controls { af, flash } = &mut *controls;
            af.on_notification(out.dm.af_state, flash);
            controls.take_notifications()
        };
        self.shared.client.notify_all(notifications);
    }

    /// Queue a free buffer to the sensor, carrying the next request when
    /// no frame is pinned. Returns whether a request was marked.
    fn refill(&mut self) -> bool {
        let shared = &self.shared;
        let index = match shared.pool.acquire_for_capture() {
            Ok(index) => index,
            Err(err) => {
                trace!("sensor not refilled: {}", err);
                return false;
            }
        };

        let mut shot = Shot::dummy();
        let pinned = self.night_count != 0 || shared.controls().flash.is_capturing();
        let marked = !pinned && shared.tracker.mark_processing(&mut shot).is_ok();
        if shared.is_closing() {
            shot.directives = ShotDirectives::default();
        }
        if let Err(err) = shared.hw.enqueue(DeviceKind::Sensor, index.get(), shot) {
            error!("{}", err);
        }
        marked
    }

    fn release(&mut self) {
        let shared = &self.shared;
        info!(
            "drive loop released after {} cycles ({} bubbles)",
            self.cycles, self.bubbles
        );
        for kind in [DeviceKind::Sensor, DeviceKind::Isp] {
            if let Err(err) = shared.hw.stream_off(kind) {
                error!("{}", err);
            }
            if let Err(err) = shared.hw.release_buffers(kind) {
                error!("{}", err);
            }
        }
        shared.pool.reset();
        for request in shared.tracker.reset() {
            shared.client.requests.free_request(request);
        }
        self.night_count = 0;
        self.night_frame = None;
    }
}
