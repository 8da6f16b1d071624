// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Request intake: admits client requests and hands back finished results.

use log::{debug, error, info, trace};
use std::sync::{atomic::Ordering, Arc};

use super::{Flow, Shared};
use crate::signal::SignalSet;

pub struct IntakeLoop {
    shared: Arc<Shared>,
    /// The client returned no request on the last attempt.
    drained: bool,
    /// A request was left with the client because the table was full.
    pending: bool,
    delivered: u64,
}

impl IntakeLoop {
    pub fn new(shared: Arc<Shared>) -> Self {
        IntakeLoop {
            shared,
            drained: false,
            pending: false,
            delivered: 0,
        }
    }

    pub fn handle(&mut self, bits: SignalSet) -> Flow {
        if bits.contains(SignalSet::RELEASE) {
            info!("intake loop released after {} results", self.delivered);
            return Flow::Exit;
        }
        if bits.contains(SignalSet::REQUEST_QUEUE_NOT_EMPTY) {
            self.admit_one();
        }
        if bits.contains(SignalSet::OUTPUT_DONE) {
            self.deliver();
        }
        Flow::Continue
    }

    fn admit_one(&mut self) {
        let shared = &self.shared;
        if shared.tracker.is_full() {
            trace!("request table full, holding the client queue");
            self.pending = true;
            return;
        }
        self.pending = false;

        let Some(request) = shared.client.requests.dequeue_request() else {
            debug!("client request queue drained");
            self.drained = true;
            if shared.stabilization.load(Ordering::Relaxed) {
                shared.bubbles.store(1, Ordering::Relaxed);
            }
            return;
        };
        self.drained = false;

        match shared.tracker.admit(request) {
            Ok(intent) => {
                let notifications = {
                    let mut controls = shared.controls();
                    controls.af.set_mode(intent.af_mode);
                    controls.af.set_region(intent.af_regions);
                    controls.take_notifications()
                };
                shared.client.notify_all(notifications);
            }
            Err(err) => error!("request not admitted: {}", err),
        }

        if !shared.tracker.is_full() {
            shared.intake.set(SignalSet::REQUEST_QUEUE_NOT_EMPTY);
        }
        shared.drive.set(SignalSet::START_PROCESSING);
    }

    fn deliver(&mut self) {
        let shared = &self.shared;
        while let Some(done) = shared.tracker.drain() {
            let mut result = done.result;
            result.af_state = shared.controls().af.service_state();
            trace!("result for frame {}", result.frame_number);
            shared.client.frames.enqueue_frame(&done.request, result);
            shared.client.requests.free_request(done.request);
            self.delivered += 1;
        }
        if !self.drained {
            shared.intake.set(SignalSet::REQUEST_QUEUE_NOT_EMPTY);
        }
        if !shared.tracker.is_empty() {
            shared.drive.set(SignalSet::START_PROCESSING);
        }
    }
}
