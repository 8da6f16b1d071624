// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use crate::error::CliError;
use crate::metrics::{self, MetricsCollector};
use crate::utils;
use camhal::{
    client::{Client, RequestQueue, ResultCollector, Substream, SubstreamFrame},
    config::SessionConfig,
    control::{AeMode, AfMode, CaptureIntent, CaptureRequest, OutputMask},
    hw::{
        virt::{VirtualConfig, VirtualHardware, VirtualStreamOps},
        Format,
    },
    session::Session,
    stream::{Scaler, StreamId},
};
use clap::Args as ClapArgs;
use std::{
    collections::VecDeque,
    io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

/// Client buffers behind the preview stream
const PREVIEW_BUFFERS: usize = 6;
/// Preview buffers the client always keeps
const MIN_UNDEQUEUED: usize = 2;
/// Preview buffers queued to the scaler
const PREVIEW_HW_BUFFERS: usize = 4;
/// Internal buffers on the capture scaler
const CAPTURE_HW_BUFFERS: usize = 2;
/// Requests between a precapture trigger and its still capture
const PRECAPTURE_LEAD: u64 = 6;

const POLL: Duration = Duration::from_millis(100);
const STALL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(ClapArgs, Debug)]
pub struct Args {
    /// Number of requests to submit (0=until Ctrl+C)
    #[arg(short = 'n', long, default_value = "120")]
    requests: u64,

    /// Preview resolution in WxH format
    #[arg(short, long, default_value = "1280x720")]
    resolution: String,

    /// Sensor module (back or front)
    #[arg(long, default_value = "back")]
    camera: String,

    /// Make every Nth request a still capture (0=never)
    #[arg(short = 'c', long, default_value = "0")]
    capture_every: u64,

    /// Meter with the pre-flash and fire the flash for still captures
    #[arg(long)]
    flash: bool,

    /// Autofocus mode (off, auto, macro, continuous-video, continuous-picture)
    #[arg(long, default_value = "continuous-picture")]
    af_mode: String,

    /// Virtual sensor frame interval in microseconds
    #[arg(long, default_value = "33333")]
    interval_us: u64,

    /// Print session metrics on exit
    #[arg(long)]
    metrics: bool,
}

/// Counts the still frames reaching the capture scaler.
struct StillCounter {
    count: Arc<AtomicU64>,
}

impl Substream for StillCounter {
    fn id(&self) -> StreamId {
        StreamId::JPEG
    }

    fn process(&mut self, frame: &SubstreamFrame) -> io::Result<()> {
        log::debug!(
            "Still frame {} from buffer {}",
            frame.frame_number,
            frame.buffer
        );
        self.count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

struct Plan {
    af_mode: AfMode,
    capture_every: u64,
    flash: bool,
}

impl Plan {
    fn is_still(&self, index: u64) -> bool {
        self.capture_every > 0 && (index + 1) % self.capture_every == 0
    }

    /// Whether the precapture trigger for an upcoming still goes out
    /// before request `index`.
    fn precapture_before(&self, index: u64) -> bool {
        self.flash && self.is_still(index + PRECAPTURE_LEAD)
    }

    fn request(&self, index: u64) -> CaptureRequest {
        let mut request = CaptureRequest::new(index + 1, OutputMask::PREVIEW);
        if self.is_still(index) {
            request = CaptureRequest::new(index + 1, OutputMask::PREVIEW | OutputMask::JPEG)
                .with_capture_intent(CaptureIntent::StillCapture);
        }
        let ae_mode = if self.flash {
            AeMode::OnAutoFlash
        } else {
            AeMode::On
        };
        request.with_af_mode(self.af_mode).with_ae_mode(ae_mode)
    }
}

pub fn execute(args: Args, json: bool) -> Result<(), CliError> {
    log::info!("Starting virtual session simulation");
    log::debug!("Simulation parameters: {:?}", args);

    let (width, height) = utils::parse_resolution(&args.resolution)?;
    let af_mode = utils::parse_af_mode(&args.af_mode)?;
    let caps = utils::parse_camera(&args.camera)?;
    if args.interval_us == 0 {
        return Err(CliError::InvalidArgs(
            "--interval-us must be positive".to_string(),
        ));
    }
    if args.flash && args.capture_every <= PRECAPTURE_LEAD {
        return Err(CliError::InvalidArgs(format!(
            "--flash needs --capture-every above {}",
            PRECAPTURE_LEAD
        )));
    }
    let plan = Plan {
        af_mode: if caps.has_autofocus { af_mode } else { AfMode::Off },
        capture_every: args.capture_every,
        flash: args.flash && caps.has_flash,
    };

    let term = utils::install_signal_handler()?;

    let config = SessionConfig::default()
        .with_capabilities(caps.clone())
        .with_flash(plan.flash);
    let hw = VirtualHardware::new(
        VirtualConfig::default().with_frame_interval(Duration::from_micros(args.interval_us)),
    );
    let requests = Arc::new(RequestQueue::new());
    let results = Arc::new(ResultCollector::new());
    let client = Client::new(requests.clone(), results.clone(), results.clone());

    log::info!("Opening {} camera, preview {}x{}", caps.name, width, height);
    let mut session = Session::open(config, hw.pipeline(), client)?;
    session.add_stream(
        StreamId::PREVIEW,
        Format::new(width, height),
        PREVIEW_HW_BUFFERS,
        Box::new(VirtualStreamOps::new(PREVIEW_BUFFERS, MIN_UNDEQUEUED)),
    )?;

    let stills = Arc::new(AtomicU64::new(0));
    if plan.capture_every > 0 {
        let Some(&(w, h)) = caps.capture_sizes.first() else {
            return Err(CliError::UnsupportedStream(format!(
                "{} camera has no capture size",
                caps.name
            )));
        };
        session.add_internal_stream(Scaler::Capture, Format::new(w, h), CAPTURE_HW_BUFFERS)?;
        session.attach_substream(
            Scaler::Capture,
            Box::new(StillCounter {
                count: stills.clone(),
            }),
        )?;
        log::info!("Still capture every {} requests at {}x{}", plan.capture_every, w, h);
    }

    let limit = if args.requests == 0 {
        u64::MAX
    } else {
        args.requests
    };
    let window = session.config().request_capacity as u64 + 2;
    let mut collector = MetricsCollector::new();
    let mut submitted_at = VecDeque::new();
    let mut submitted = 0u64;
    let mut seen = 0usize;
    let mut af_triggered = false;
    let mut next_trigger = 1;
    let mut last_progress = Instant::now();

    log::info!(
        "Submitting {} requests (Ctrl+C to stop)...",
        if limit == u64::MAX {
            "unlimited".to_string()
        } else {
            limit.to_string()
        }
    );

    while !term.load(Ordering::Relaxed) {
        let before = submitted;
        while submitted < limit && submitted - (seen as u64) < window {
            if plan.precapture_before(submitted) {
                log::debug!("Precapture trigger {} before request {}", next_trigger, submitted + 1);
                session.trigger_precapture(next_trigger);
                next_trigger += 1;
            }
            requests.push(plan.request(submitted));
            submitted_at.push_back(Instant::now());
            collector.record_request();
            submitted += 1;
        }
        if submitted > before {
            session.notify_request_queue_not_empty();
        }

        if submitted == seen as u64 && submitted >= limit {
            break;
        }

        results.wait_for(seen + 1, POLL);
        let fresh = results.results_since(seen);
        if fresh.is_empty() {
            if last_progress.elapsed() > STALL_TIMEOUT {
                session.close();
                return Err(CliError::Timeout(format!(
                    "no result for {:?} after {} of {} results",
                    STALL_TIMEOUT, seen, submitted
                )));
            }
            continue;
        }
        last_progress = Instant::now();
        for result in &fresh {
            let latency = submitted_at
                .pop_front()
                .map(|at: Instant| at.elapsed())
                .unwrap_or_default();
            collector.record_result(result, latency);
        }
        seen += fresh.len();

        if !af_triggered && plan.af_mode == AfMode::Auto {
            log::debug!("Autofocus trigger {}", next_trigger);
            session.trigger_autofocus(next_trigger);
            next_trigger += 1;
            af_triggered = true;
        }
        if seen % 30 == 0 {
            log::debug!("Received {} results", seen);
        }
    }

    if term.load(Ordering::Relaxed) {
        log::info!("Received Ctrl+C, stopping...");
    }

    log::info!(
        "Received {} of {} results, AF state {}",
        seen,
        submitted,
        session.af_state().name()
    );
    session.close();

    let stats = hw.stats();
    let summary = collector.finalize(
        &stats,
        &results.notifications(),
        stills.load(Ordering::Relaxed),
    );
    if !summary.in_order {
        log::error!("Results were delivered out of order");
    }

    if json {
        metrics::print_json(&summary)
            .map_err(|e| CliError::General(format!("Failed to output JSON metrics: {}", e)))?;
    } else if args.metrics {
        metrics::print_text(&summary);
    }

    if summary.in_order {
        Ok(())
    } else {
        Err(CliError::General("results delivered out of order".to_string()))
    }
}
