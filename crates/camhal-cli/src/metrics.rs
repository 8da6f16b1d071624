// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use camhal::{
    client::Notification,
    control::{CaptureResult, FrameNumber},
    hw::virt::VirtualStats,
};
use serde::Serialize;
use std::time::{Duration, Instant};

/// Summary of one simulated session
#[derive(Debug, Clone, Serialize)]
pub struct RunMetrics {
    /// Requests submitted to the session
    pub requests: u64,
    /// Results handed back
    pub results: u64,
    /// Whether every result followed its predecessor's frame number
    pub in_order: bool,
    /// Total duration in milliseconds
    pub duration_ms: u64,
    /// Average result rate in frames per second
    pub throughput_fps: f64,
    /// Minimum submit-to-result latency in microseconds
    pub latency_min_us: u64,
    /// Maximum submit-to-result latency in microseconds
    pub latency_max_us: u64,
    /// Average submit-to-result latency in microseconds
    pub latency_avg_us: u64,
    /// 50th percentile (median) latency in microseconds
    pub latency_p50_us: u64,
    /// 95th percentile latency in microseconds
    pub latency_p95_us: u64,
    /// 99th percentile latency in microseconds
    pub latency_p99_us: u64,
    /// Frames exposed by the virtual sensor
    pub sensor_frames: u64,
    /// Placeholder frames pushed through the ISP
    pub bubbles: u64,
    /// Scaler outputs dropped for lack of a queued buffer
    pub dropped_outputs: u64,
    /// Still frames seen by the JPEG substream
    pub still_captures: u64,
    /// Autofocus notifications received
    pub af_notifications: u64,
    /// Exposure and white balance notifications received
    pub ae_notifications: u64,
}

/// Collects per-result timings while a simulation runs
pub struct MetricsCollector {
    start_time: Instant,
    latencies_us: Vec<u64>,
    prev_frame: Option<FrameNumber>,
    out_of_order: u64,
    requests: u64,
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            latencies_us: Vec::new(),
            prev_frame: None,
            out_of_order: 0,
            requests: 0,
        }
    }

    pub fn record_request(&mut self) {
        self.requests += 1;
    }

    /// Record one result and how long after its submission it arrived.
    pub fn record_result(&mut self, result: &CaptureResult, latency: Duration) {
        if let Some(prev) = self.prev_frame {
            if result.frame_number != prev.next() {
                log::warn!(
                    "Result order broken: frame {} after {}",
                    result.frame_number,
                    prev
                );
                self.out_of_order += 1;
            }
        }
        self.prev_frame = Some(result.frame_number);
        self.latencies_us.push(latency.as_micros() as u64);
    }

    /// Finalize and calculate all metrics
    pub fn finalize(
        &mut self,
        stats: &VirtualStats,
        notifications: &[Notification],
        still_captures: u64,
    ) -> RunMetrics {
        let duration = self.start_time.elapsed();
        let duration_secs = duration.as_secs_f64();
        let results = self.latencies_us.len() as u64;

        let throughput_fps = if duration_secs > 0.0 {
            results as f64 / duration_secs
        } else {
            0.0
        };

        self.latencies_us.sort_unstable();
        let (min_us, max_us, avg_us) = match (self.latencies_us.first(), self.latencies_us.last()) {
            (Some(&min), Some(&max)) => {
                let sum: u64 = self.latencies_us.iter().sum();
                (min, max, sum / results)
            }
            _ => (0, 0, 0),
        };

        let af_notifications = notifications
            .iter()
            .filter(|n| matches!(n, Notification::Autofocus { .. }))
            .count() as u64;

        RunMetrics {
            requests: self.requests,
            results,
            in_order: self.out_of_order == 0,
            duration_ms: duration.as_millis() as u64,
            throughput_fps,
            latency_min_us: min_us,
            latency_max_us: max_us,
            latency_avg_us: avg_us,
            latency_p50_us: self.percentile(50.0),
            latency_p95_us: self.percentile(95.0),
            latency_p99_us: self.percentile(99.0),
            sensor_frames: stats.sensor_frames(),
            bubbles: stats.bubbles(),
            dropped_outputs: stats.dropped_outputs(),
            still_captures,
            af_notifications,
            ae_notifications: notifications.len() as u64 - af_notifications,
        }
    }

    /// Calculate percentile from sorted latency data
    /// Assumes self.latencies_us is already sorted
    fn percentile(&self, p: f64) -> u64 {
        if self.latencies_us.is_empty() {
            return 0;
        }

        let len = self.latencies_us.len();
        let idx = ((p / 100.0) * (len - 1) as f64).round() as usize;
        self.latencies_us[idx.min(len - 1)]
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Print metrics in human-readable format
pub fn print_text(metrics: &RunMetrics) {
    println!("\n=== Session Metrics ===");
    println!("Requests:          {}", metrics.requests);
    println!("Results:           {}", metrics.results);
    println!(
        "Order:             {}",
        if metrics.in_order { "in order" } else { "OUT OF ORDER" }
    );
    println!(
        "Duration:          {:.2} s",
        metrics.duration_ms as f64 / 1000.0
    );
    println!("Throughput:        {:.2} fps", metrics.throughput_fps);

    if metrics.results > 0 {
        println!("\nLatency Statistics (µs):");
        println!("  Min:    {}", metrics.latency_min_us);
        println!("  Max:    {}", metrics.latency_max_us);
        println!("  Avg:    {}", metrics.latency_avg_us);
        println!("  P50:    {}", metrics.latency_p50_us);
        println!("  P95:    {}", metrics.latency_p95_us);
        println!("  P99:    {}", metrics.latency_p99_us);
    }

    println!("\nPipeline:");
    println!("  Sensor frames:   {}", metrics.sensor_frames);
    println!("  Bubbles:         {}", metrics.bubbles);
    println!("  Dropped outputs: {}", metrics.dropped_outputs);
    println!("  Still captures:  {}", metrics.still_captures);
    println!("  AF events:       {}", metrics.af_notifications);
    println!("  AE/AWB events:   {}", metrics.ae_notifications);
}

/// Print metrics in JSON format
pub fn print_json(metrics: &RunMetrics) -> Result<(), serde_json::Error> {
    let json = serde_json::to_string_pretty(metrics)?;
    println!("{}", json);
    Ok(())
}
