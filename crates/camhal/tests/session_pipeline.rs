// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies
//
// Session Pipeline Tests
//
// Runs complete sessions (intake, drive and stream loops on their own
// threads) over the virtual hardware with a 1 ms sensor cadence.
//
// RUN:
//   cargo test --test session_pipeline

use camhal::{
    client::{
        Client, FrameSink, Notification, RequestQueue, RequestSource, ResultCollector,
        StreamOps, Substream, SubstreamFrame,
    },
    config::{SensorCapabilities, SessionConfig},
    control::{
        AeMode, AeState, AfMode, CaptureIntent, CaptureRequest, CaptureResult, FrameNumber,
        OutputMask, RequestHandle, SceneMode, ServiceAfState,
    },
    flash::FlashStep,
    hw::{
        virt::{VirtualConfig, VirtualHardware, VirtualStreamOps},
        Format,
    },
    session::Session,
    stream::{Scaler, StreamId},
    tracker::SlotState,
    Error,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serial_test::serial;
use std::{
    io,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

const WAIT: Duration = Duration::from_secs(10);

struct Harness {
    requests: Arc<RequestQueue>,
    results: Arc<ResultCollector>,
    hw: VirtualHardware,
    session: Session,
}

impl Harness {
    fn open(config: SessionConfig) -> Harness {
        let results = Arc::new(ResultCollector::new());
        Self::open_with(config, results.clone(), results)
    }

    /// Open a session whose results are also recorded in a delivery log.
    fn open_logged(config: SessionConfig) -> (Harness, DeliveryLog) {
        let log = DeliveryLog::default();
        let results = Arc::new(ResultCollector::new());
        let sink = Arc::new(LoggedSink {
            log: log.clone(),
            results: results.clone(),
        });
        (Self::open_with(config, results, sink), log)
    }

    fn open_with(
        config: SessionConfig,
        results: Arc<ResultCollector>,
        frames: Arc<dyn FrameSink>,
    ) -> Harness {
        let _ = env_logger::builder().is_test(true).try_init();
        let requests = Arc::new(RequestQueue::new());
        let client = Client::new(requests.clone(), frames, results.clone());
        let hw = VirtualHardware::new(
            VirtualConfig::default()
                .with_frame_interval(Duration::from_millis(1))
                .with_dequeue_timeout(Duration::from_millis(500)),
        );
        let session = Session::open(config, hw.pipeline(), client).unwrap();
        Harness {
            requests,
            results,
            hw,
            session,
        }
    }

    fn with_preview(mut self) -> Harness {
        self.session
            .add_stream(
                StreamId::PREVIEW,
                Format::new(1280, 720),
                4,
                Box::new(VirtualStreamOps::new(6, 2)),
            )
            .unwrap();
        self
    }

    fn submit(&self, requests: impl IntoIterator<Item = CaptureRequest>) {
        for request in requests {
            self.requests.push(request);
        }
        self.session.notify_request_queue_not_empty();
    }

    fn wait_results(&self, count: usize) {
        assert!(
            self.results.wait_for(count, WAIT),
            "only {} of {} results arrived",
            self.results.len(),
            count
        );
    }
}

fn config() -> SessionConfig {
    SessionConfig::default().with_initial_skip(0)
}

fn preview(handle: u64) -> CaptureRequest {
    CaptureRequest::new(handle, OutputMask::PREVIEW)
}

fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < WAIT {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    false
}

fn assert_in_order(results: &[CaptureResult], first_handle: u64) {
    for (i, result) in results.iter().enumerate() {
        assert_eq!(result.frame_number, FrameNumber(i as u32));
        assert_eq!(result.handle, RequestHandle(first_handle + i as u64));
        assert!(result.timestamp_ns > 0, "frame {} has no timestamp", i);
    }
}

struct Recorder {
    id: StreamId,
    seen: Arc<Mutex<Vec<FrameNumber>>>,
}

impl Substream for Recorder {
    fn id(&self) -> StreamId {
        self.id
    }

    fn process(&mut self, frame: &SubstreamFrame) -> io::Result<()> {
        self.seen.lock().unwrap().push(frame.frame_number);
        Ok(())
    }
}

/// Something the client received, in the order it was received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Preview { timestamp_ns: i64 },
    Substream { id: StreamId, frame: FrameNumber },
    Result { frame: FrameNumber },
}

type DeliveryLog = Arc<Mutex<Vec<Delivery>>>;

struct LoggedSink {
    log: DeliveryLog,
    results: Arc<ResultCollector>,
}

impl FrameSink for LoggedSink {
    fn enqueue_frame(&self, request: &CaptureRequest, result: CaptureResult) {
        self.log.lock().unwrap().push(Delivery::Result {
            frame: result.frame_number,
        });
        self.results.enqueue_frame(request, result);
    }
}

struct LoggedSubstream {
    id: StreamId,
    log: DeliveryLog,
}

impl Substream for LoggedSubstream {
    fn id(&self) -> StreamId {
        self.id
    }

    fn process(&mut self, frame: &SubstreamFrame) -> io::Result<()> {
        self.log.lock().unwrap().push(Delivery::Substream {
            id: self.id,
            frame: frame.frame_number,
        });
        Ok(())
    }
}

/// Preview client that takes `delay` to accept each filled buffer.
struct SlowPreview {
    ops: VirtualStreamOps,
    delay: Duration,
    log: DeliveryLog,
}

impl StreamOps for SlowPreview {
    fn dequeue_buffer(&mut self) -> Option<usize> {
        self.ops.dequeue_buffer()
    }

    fn enqueue_buffer(&mut self, index: usize, timestamp_ns: i64) -> io::Result<()> {
        thread::sleep(self.delay);
        self.log
            .lock()
            .unwrap()
            .push(Delivery::Preview { timestamp_ns });
        self.ops.enqueue_buffer(index, timestamp_ns)
    }

    fn cancel_buffer(&mut self, index: usize) -> io::Result<()> {
        self.ops.cancel_buffer(index)
    }

    fn min_undequeued(&self) -> usize {
        self.ops.min_undequeued()
    }

    fn buffer_count(&self) -> usize {
        self.ops.buffer_count()
    }
}

fn position(log: &DeliveryLog, wanted: Delivery) -> usize {
    log.lock()
        .unwrap()
        .iter()
        .position(|delivery| *delivery == wanted)
        .unwrap_or_else(|| panic!("{:?} never reached the client", wanted))
}

fn attach_logged(harness: &Harness, log: &DeliveryLog, ids: &[StreamId]) {
    for &id in ids {
        harness
            .session
            .attach_substream(
                Scaler::Capture,
                Box::new(LoggedSubstream {
                    id,
                    log: log.clone(),
                }),
            )
            .unwrap();
    }
}

// =============================================================================
// Ordering
// =============================================================================

#[test]
#[serial]
fn test_every_request_delivered_once_in_order() {
    let harness = Harness::open(config()).with_preview();
    harness.submit((1..=20).map(preview));
    harness.wait_results(20);

    let results = harness.results.results();
    assert_eq!(results.len(), 20);
    assert_in_order(&results, 1);
    assert_eq!(harness.requests.freed(), 20);
    assert!(wait_until(|| harness.session.tracker().is_empty()));

    let stats = harness.hw.stats();
    assert!(stats.bubbles() >= config().sensor_queue_depth() as u64);
    harness.session.close();
}

#[test]
#[serial]
fn test_random_masks_with_small_table() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let masks = [
        OutputMask::PREVIEW,
        OutputMask::empty(),
        OutputMask::PREVIEW | OutputMask::RECORD,
        OutputMask::PREVIEW_CALLBACK,
    ];
    let harness = Harness::open(config().with_request_capacity(3)).with_preview();
    harness.submit((1..=30).map(|handle| {
        CaptureRequest::new(handle, masks[rng.random_range(0..masks.len())])
    }));
    harness.wait_results(30);

    let results = harness.results.results();
    assert_eq!(results.len(), 30);
    assert_in_order(&results, 1);
    assert_eq!(harness.requests.request_count(), 0);
    harness.session.close();
}

#[test]
#[serial]
fn test_requests_after_drain_resume() {
    let harness = Harness::open(config()).with_preview();
    harness.submit((1..=4).map(preview));
    harness.wait_results(4);
    harness.submit((5..=8).map(preview));
    harness.wait_results(8);
    assert_in_order(&harness.results.results(), 1);
    harness.session.close();
}

#[test]
#[serial]
fn test_unmatched_frames_become_bubbles() {
    // No stream bound: the only request carries no output at all.
    let harness = Harness::open(config());
    harness.submit([CaptureRequest::new(1, OutputMask::empty())]);
    harness.wait_results(1);

    let tracker = harness.session.tracker();
    assert!(wait_until(|| tracker.is_empty()));
    assert!(tracker.states().iter().all(|s| *s == SlotState::Empty));
    assert!(harness.hw.stats().bubbles() >= 3);
    assert_eq!(harness.hw.stats().scaler_frames(), 0);
    harness.session.close();
}

// =============================================================================
// Streams
// =============================================================================

#[test]
#[serial]
fn test_preview_skips_initial_frames() {
    let mut harness = Harness::open(config().with_initial_skip(3));
    let ops = VirtualStreamOps::new(6, 2);
    let counters = ops.counters();
    harness
        .session
        .add_stream(StreamId::PREVIEW, Format::new(640, 480), 4, Box::new(ops))
        .unwrap();
    harness.submit((1..=10).map(preview));
    harness.wait_results(10);

    let dropped = harness.hw.stats().dropped_outputs();
    assert_eq!(counters.delivered() + counters.cancelled() + dropped, 10);
    assert!(counters.cancelled() >= 2);
    harness.session.close();
}

#[test]
#[serial]
fn test_jpeg_substream_on_capture_scaler() {
    let mut harness = Harness::open(config().with_flash(false)).with_preview();
    harness
        .session
        .add_internal_stream(Scaler::Capture, Format::new(1920, 1080), 2)
        .unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    harness
        .session
        .attach_substream(
            Scaler::Capture,
            Box::new(Recorder {
                id: StreamId::JPEG,
                seen: seen.clone(),
            }),
        )
        .unwrap();

    harness.submit((1..=12).map(|handle| {
        if handle % 4 == 0 {
            CaptureRequest::new(handle, OutputMask::PREVIEW | OutputMask::JPEG)
                .with_capture_intent(CaptureIntent::StillCapture)
        } else {
            preview(handle)
        }
    }));
    harness.wait_results(12);

    let results = harness.results.results();
    assert_in_order(&results, 1);
    let jpeg_frames: Vec<FrameNumber> = results
        .iter()
        .filter(|r| r.handle.0 % 4 == 0)
        .map(|r| r.frame_number)
        .collect();
    let seen = seen.lock().unwrap().clone();
    assert!(!seen.is_empty());
    assert!(seen.iter().all(|frame| jpeg_frames.contains(frame)));
    assert!(seen.windows(2).all(|w| w[0] < w[1]));

    let detached = harness
        .session
        .detach_substream(Scaler::Capture, StreamId::JPEG)
        .unwrap();
    assert_eq!(detached.id(), StreamId::JPEG);
    harness.session.release_stream(Scaler::Capture).unwrap();
    harness
        .session
        .add_internal_stream(Scaler::Capture, Format::new(1920, 1080), 2)
        .unwrap();
    harness.session.close();
}

#[test]
#[serial]
fn test_stream_configuration_errors() {
    let mut harness = Harness::open(config().with_capabilities(SensorCapabilities::front()));
    let ops = || Box::new(VirtualStreamOps::new(6, 2));

    let err = harness
        .session
        .add_stream(StreamId::PREVIEW, Format::new(1920, 1080), 4, ops())
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedStream(_)));

    let err = harness
        .session
        .add_stream(StreamId::JPEG, Format::new(640, 480), 4, ops())
        .unwrap_err();
    assert!(matches!(err, Error::InvalidStream(_)));

    let err = harness
        .session
        .attach_substream(
            Scaler::Capture,
            Box::new(Recorder {
                id: StreamId::JPEG,
                seen: Arc::default(),
            }),
        )
        .unwrap_err();
    assert!(matches!(err, Error::InvalidStream(_)));
    assert!(harness.session.release_stream(Scaler::Capture).is_err());

    harness
        .session
        .add_stream(StreamId::PREVIEW, Format::new(640, 480), 4, ops())
        .unwrap();
    let err = harness
        .session
        .add_stream(StreamId::PREVIEW, Format::new(640, 480), 4, ops())
        .unwrap_err();
    assert!(matches!(err, Error::InvalidStream(_)));

    // Substreams only attach to the scaler producing their output.
    let recorder = |id| {
        Box::new(Recorder {
            id,
            seen: Arc::default(),
        })
    };
    let err = harness
        .session
        .attach_substream(Scaler::Preview, recorder(StreamId::JPEG))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidStream(_)));
    let err = harness
        .session
        .attach_substream(Scaler::Capture, recorder(StreamId::RECORD))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidStream(_)));
    harness
        .session
        .attach_substream(Scaler::Preview, recorder(StreamId::RECORD))
        .unwrap();

    harness.session.release_stream(Scaler::Preview).unwrap();
    let err = harness
        .session
        .add_stream(StreamId::PREVIEW, Format::new(640, 480), 4, ops())
        .unwrap_err();
    assert!(matches!(err, Error::InvalidStream(_)));
    harness.session.close();
}

#[test]
#[serial]
fn test_result_waits_for_outputs_on_both_scalers() {
    let (mut harness, log) = Harness::open_logged(config().with_flash(false));
    let slow = SlowPreview {
        ops: VirtualStreamOps::new(6, 2),
        delay: Duration::from_millis(300),
        log: log.clone(),
    };
    harness
        .session
        .add_stream(StreamId::PREVIEW, Format::new(1280, 720), 4, Box::new(slow))
        .unwrap();
    harness
        .session
        .add_internal_stream(Scaler::Capture, Format::new(1920, 1080), 2)
        .unwrap();
    attach_logged(&harness, &log, &[StreamId::JPEG, StreamId::ZSL]);

    let outputs = OutputMask::PREVIEW | OutputMask::JPEG | OutputMask::ZSL;
    harness.submit([CaptureRequest::new(1, outputs)
        .with_capture_intent(CaptureIntent::StillCapture)]);
    harness.wait_results(1);

    let result = harness.results.results()[0].clone();
    let frame = result.frame_number;
    let delivered = position(&log, Delivery::Result { frame });
    for output in [
        Delivery::Preview {
            timestamp_ns: result.timestamp_ns,
        },
        Delivery::Substream {
            id: StreamId::JPEG,
            frame,
        },
        Delivery::Substream {
            id: StreamId::ZSL,
            frame,
        },
    ] {
        assert!(
            position(&log, output) < delivered,
            "{:?} reached the client after the result",
            output
        );
    }
    harness.session.close();
}

#[test]
#[serial]
fn test_night_still_result_waits_for_jpeg() {
    let (harness, log) = Harness::open_logged(config().with_flash(false));
    let mut harness = harness.with_preview();
    harness
        .session
        .add_internal_stream(Scaler::Capture, Format::new(1920, 1080), 2)
        .unwrap();
    attach_logged(&harness, &log, &[StreamId::JPEG]);

    harness.submit((1..=2).map(preview));
    harness.submit([CaptureRequest::new(3, OutputMask::PREVIEW | OutputMask::JPEG)
        .with_scene_mode(SceneMode::Night)
        .with_capture_intent(CaptureIntent::StillCapture)]);
    harness.submit((4..=6).map(preview));
    harness.wait_results(6);

    let results = harness.results.results();
    assert_in_order(&results, 1);
    let night = results
        .iter()
        .find(|r| r.handle == RequestHandle(3))
        .unwrap();
    let frame = night.frame_number;
    let jpeg = position(
        &log,
        Delivery::Substream {
            id: StreamId::JPEG,
            frame,
        },
    );
    assert!(jpeg < position(&log, Delivery::Result { frame }));
    harness.session.close();
}

// =============================================================================
// 3A
// =============================================================================

fn af_notifications(results: &ResultCollector) -> Vec<(ServiceAfState, i32)> {
    results
        .notifications()
        .into_iter()
        .filter_map(|n| match n {
            Notification::Autofocus { state, trigger_id } => Some((state, trigger_id)),
            _ => None,
        })
        .collect()
}

#[test]
#[serial]
fn test_autofocus_trigger_locks_focus() {
    let harness = Harness::open(config().with_flash(false)).with_preview();
    let auto = |handle| preview(handle).with_af_mode(AfMode::Auto);
    harness.submit((1..=3).map(auto));
    harness.wait_results(3);

    harness.session.trigger_autofocus(7);
    harness.submit((4..=20).map(auto));
    assert!(wait_until(|| af_notifications(&harness.results)
        .contains(&(ServiceAfState::FocusedLocked, 7))));
    harness.wait_results(20);

    let states = af_notifications(&harness.results);
    let scan = states
        .iter()
        .position(|n| *n == (ServiceAfState::ActiveScan, 7))
        .unwrap();
    let locked = states
        .iter()
        .position(|n| *n == (ServiceAfState::FocusedLocked, 7))
        .unwrap();
    assert!(scan < locked);
    assert_eq!(harness.session.af_state(), ServiceAfState::FocusedLocked);
    harness.session.close();
}

#[test]
#[serial]
fn test_precapture_then_flash_still_capture() {
    let (harness, log) = Harness::open_logged(config());
    let mut harness = harness.with_preview();
    harness
        .session
        .add_internal_stream(Scaler::Capture, Format::new(3264, 2448), 2)
        .unwrap();
    attach_logged(&harness, &log, &[StreamId::JPEG]);

    let auto_flash = |handle| preview(handle).with_ae_mode(AeMode::OnAutoFlash);
    harness.submit((1..=3).map(auto_flash));
    harness.wait_results(3);

    harness.session.trigger_precapture(3);
    harness.submit((4..=12).map(auto_flash));
    harness.wait_results(12);
    assert!(wait_until(|| harness.session.flash_step() == FlashStep::AutoDone));
    let converged = Notification::AutoExposure {
        state: AeState::Converged,
        trigger_id: 3,
    };
    assert!(harness.results.notifications().contains(&converged));

    harness.submit([CaptureRequest::new(13, OutputMask::PREVIEW | OutputMask::JPEG)
        .with_ae_mode(AeMode::OnAutoFlash)
        .with_capture_intent(CaptureIntent::StillCapture)]);
    harness.submit((14..=16).map(auto_flash));
    harness.wait_results(16);

    let results = harness.results.results();
    assert_in_order(&results, 1);
    let still = results
        .iter()
        .find(|r| r.handle == RequestHandle(13))
        .unwrap();
    let frame = still.frame_number;
    let stills: Vec<FrameNumber> = log
        .lock()
        .unwrap()
        .iter()
        .filter_map(|delivery| match delivery {
            Delivery::Substream { frame, .. } => Some(*frame),
            _ => None,
        })
        .collect();
    assert_eq!(stills, vec![frame]);
    // The pinned frame's result waits for the flash-lit JPEG.
    let jpeg = position(
        &log,
        Delivery::Substream {
            id: StreamId::JPEG,
            frame,
        },
    );
    assert!(jpeg < position(&log, Delivery::Result { frame }));
    assert!(wait_until(|| harness.session.flash_step() == FlashStep::None));
    harness.session.close();
}

// =============================================================================
// Raw buffer ring
// =============================================================================

#[test]
fn test_pool_random_walk_keeps_ring_order() {
    use camhal::pool::FrameBufferPool;
    use std::collections::VecDeque;

    let mut rng = StdRng::seed_from_u64(42);
    let pool = FrameBufferPool::new(8);
    let mut on_sensor = VecDeque::new();
    let mut filled = VecDeque::new();
    let mut on_isp = VecDeque::new();
    let mut frame = 0u32;

    for _ in 0..2000 {
        match rng.random_range(0..4) {
            0 => match pool.acquire_for_capture() {
                Ok(index) => on_sensor.push_back(index),
                Err(_) => {
                    assert_eq!(on_sensor.len() + filled.len() + on_isp.len(), 8)
                }
            },
            1 => {
                if let Some(index) = on_sensor.pop_front() {
                    pool.release_from_capture(index, FrameNumber(frame)).unwrap();
                    filled.push_back((index, frame));
                    frame += 1;
                }
            }
            2 => match pool.acquire_for_isp() {
                Ok((index, got)) => {
                    let (expected, number) = filled.pop_front().unwrap();
                    assert_eq!(index, expected);
                    assert_eq!(got, Some(FrameNumber(number)));
                    on_isp.push_back(index);
                }
                Err(_) => assert!(filled.is_empty()),
            },
            _ => {
                if let Some(index) = on_isp.pop_front() {
                    let (head, _) = pool.acquire_for_isp_dequeue().unwrap();
                    assert_eq!(head, index);
                    pool.release_from_isp(index).unwrap();
                }
            }
        }
        let counts = pool.counts();
        assert_eq!(counts.total(), 8);
        assert_eq!(counts.on_sensor, on_sensor.len());
        assert_eq!(counts.filled_on_host, filled.len());
        assert_eq!(counts.on_isp, on_isp.len());
    }
}

// =============================================================================
// Request table
// =============================================================================

#[test]
fn test_drain_order_under_random_completion() {
    use camhal::control::{DynamicMetadata, Shot};
    use camhal::tracker::RequestTracker;
    use rand::seq::SliceRandom;

    let mut rng = StdRng::seed_from_u64(7);
    let tracker = RequestTracker::new(5);
    let mut drained = Vec::new();
    let mut handle = 0;

    for _ in 0..50 {
        let mut frames = Vec::new();
        while !tracker.is_full() {
            tracker.admit(preview(handle)).unwrap();
            handle += 1;
        }
        while let Ok((_, frame)) = tracker.mark_processing(&mut Shot::default()) {
            tracker.match_frame(frame).unwrap();
            tracker
                .apply_metadata(frame, &DynamicMetadata::default())
                .unwrap();
            frames.push(frame);
        }
        frames.shuffle(&mut rng);
        for frame in frames {
            tracker.notify_output_delivered(frame, OutputMask::SCALER_PREVIEW);
            while let Some(done) = tracker.drain() {
                drained.push(done.result.frame_number);
            }
        }
    }

    assert_eq!(drained.len() as u64, handle);
    assert!(drained
        .iter()
        .enumerate()
        .all(|(i, frame)| *frame == FrameNumber(i as u32)));
    assert!(tracker.is_empty());
}
