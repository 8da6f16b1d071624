// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Scaler stream loops, one per scaler.

use log::{info, trace, warn};
use std::sync::Arc;

use super::{Flow, Shared};
use crate::{
    control::{FrameNumber, OutputMask, Shot},
    signal::{Completion, SignalSet},
    stream::{Scaler, StreamBinding, StreamKind},
};

pub struct StreamLoop {
    shared: Arc<Shared>,
    scaler: Scaler,
    released: Arc<Completion>,
    frames: u64,
}

impl StreamLoop {
    pub fn new(shared: Arc<Shared>, scaler: Scaler, released: Arc<Completion>) -> Self {
        StreamLoop {
            shared,
            scaler,
            released,
            frames: 0,
        }
    }

    pub fn handle(&mut self, bits: SignalSet) -> Flow {
        if bits.contains(SignalSet::RELEASE) {
            self.release();
            return Flow::Continue;
        }
        if bits.contains(SignalSet::DATA_READY) {
            self.data_ready();
        }
        Flow::Continue
    }

    fn data_ready(&mut self) {
        let shared = self.shared.clone();
        let mut binding = shared.binding(self.scaler);
        let ready = shared.take_ready(self.scaler);
        let Some(binding) = binding.as_mut() else {
            trace!("{:?} scaler has no active stream", self.scaler);
            return;
        };
        for _ in 0..ready {
            match binding.kind() {
                StreamKind::Direct => self.direct(binding),
                StreamKind::Indirect => self.indirect(binding),
            }
        }
    }

    /// Take the oldest scaler output with its frame's timestamp and mask.
    fn dequeue(&self) -> Option<(usize, FrameNumber, i64, OutputMask)> {
        let shared = &self.shared;
        let (raw, out) = match shared.hw.dequeue(self.scaler.device()) {
            Ok(output) => output,
            Err(err) => {
                warn!("{}", err);
                return None;
            }
        };
        let frame = out.ctl.frame_number.unwrap_or(FrameNumber::BUBBLE);
        let timestamp_ns = shared.tracker.timestamp_for(frame);
        let mask = shared.tracker.outputs_for(frame);
        trace!(
            "{:?} scaler buffer {} holds frame {}",
            self.scaler,
            raw,
            frame
        );
        Some((raw, frame, timestamp_ns, mask))
    }

    fn direct(&mut self, binding: &mut StreamBinding) {
        binding.init_buffers();
        let Some((raw, frame, timestamp_ns, mask)) = self.dequeue() else {
            return;
        };
        self.frames += 1;
        binding.returned_from_driver(raw);
        binding.run_substreams(frame, timestamp_ns, raw, mask);

        let tracker = &self.shared.tracker;
        let deliver = tracker.next_skip() == 0 && mask.intersects(binding.id().mask());
        binding.hand_back(raw, deliver.then_some(timestamp_ns));
        tracker.notify_output_delivered(frame, self.scaler.outputs());
        binding.replenish(&self.shared.hw);
    }

    fn indirect(&mut self, binding: &mut StreamBinding) {
        let Some((raw, frame, timestamp_ns, mask)) = self.dequeue() else {
            return;
        };
        self.frames += 1;
        let ran = binding.run_substreams(frame, timestamp_ns, raw, mask);
        trace!("frame {} ran {} substreams", frame, ran);
        self.shared
            .tracker
            .notify_output_delivered(frame, self.scaler.outputs());
        if let Err(err) = self
            .shared
            .hw
            .enqueue(self.scaler.device(), raw, Shot::default())
        {
            warn!("{}", err);
        }
    }

    fn release(&mut self) {
        let shared = self.shared.clone();
        let binding = shared.binding(self.scaler).take();
        if let Some(mut binding) = binding {
            binding.unregister(&shared.hw);
            info!(
                "{} stream released after {} frames",
                binding.id(),
                self.frames
            );
        }
        self.frames = 0;
        self.shared.take_ready(self.scaler);
        self.released.complete();
    }
}
