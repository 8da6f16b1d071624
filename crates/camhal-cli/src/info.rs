// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use crate::error::CliError;
use crate::utils;
use camhal::config::{SensorCapabilities, SessionConfig};
use clap::Args as ClapArgs;
use serde::Serialize;

#[derive(ClapArgs, Debug)]
pub struct Args {
    /// Sensor module to describe (back or front; all when omitted)
    #[arg(short, long)]
    camera: Option<String>,
}

#[derive(Debug, Serialize)]
struct SystemInfo {
    version: String,
    session: SessionInfo,
    cameras: Vec<CameraInfo>,
}

#[derive(Debug, Serialize)]
struct SessionInfo {
    request_capacity: usize,
    raw_buffers: usize,
    min_sensor_queued: usize,
    sensor_queue_depth: usize,
    initial_skip: u32,
    flash: bool,
    video_stabilization: bool,
    flash_stable_timeout: u32,
}

#[derive(Debug, Serialize)]
struct CameraInfo {
    name: String,
    sensor_size: String,
    autofocus: bool,
    flash: bool,
    preview_sizes: Vec<String>,
    capture_sizes: Vec<String>,
    fps_ranges: Vec<String>,
}

impl From<&SessionConfig> for SessionInfo {
    fn from(config: &SessionConfig) -> Self {
        SessionInfo {
            request_capacity: config.request_capacity,
            raw_buffers: config.raw_buffers,
            min_sensor_queued: config.min_sensor_queued,
            sensor_queue_depth: config.sensor_queue_depth(),
            initial_skip: config.initial_skip,
            flash: config.flash,
            video_stabilization: config.video_stabilization,
            flash_stable_timeout: config.flash_stable_timeout,
        }
    }
}

impl From<&SensorCapabilities> for CameraInfo {
    fn from(caps: &SensorCapabilities) -> Self {
        let sizes = |sizes: &[(u32, u32)]| {
            sizes
                .iter()
                .map(|(w, h)| format!("{}x{}", w, h))
                .collect::<Vec<_>>()
        };
        CameraInfo {
            name: caps.name.clone(),
            sensor_size: format!("{}x{}", caps.sensor_size.0, caps.sensor_size.1),
            autofocus: caps.has_autofocus,
            flash: caps.has_flash,
            preview_sizes: sizes(&caps.preview_sizes),
            capture_sizes: sizes(&caps.capture_sizes),
            fps_ranges: caps
                .fps_ranges
                .iter()
                .map(|[min, max]| format!("{}-{}", min, max))
                .collect(),
        }
    }
}

pub fn execute(args: Args, json: bool) -> Result<(), CliError> {
    log::debug!("Executing info command: {:?}", args);

    let cameras = match args.camera.as_deref() {
        Some(name) => vec![utils::parse_camera(name)?],
        None => vec![SensorCapabilities::back(), SensorCapabilities::front()],
    };

    let info = SystemInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        session: SessionInfo::from(&SessionConfig::default()),
        cameras: cameras.iter().map(CameraInfo::from).collect(),
    };

    if json {
        let json_str = serde_json::to_string_pretty(&info)
            .map_err(|e| CliError::General(format!("Failed to serialize JSON: {}", e)))?;
        println!("{}", json_str);
    } else {
        print_text_info(&info);
    }

    Ok(())
}

fn print_text_info(info: &SystemInfo) {
    println!("camhal {}", info.version);

    let session = &info.session;
    println!("\nSession defaults:");
    println!("  Request capacity:     {}", session.request_capacity);
    println!("  Raw buffers:          {}", session.raw_buffers);
    println!(
        "  Sensor queue depth:   {} (min {})",
        session.sensor_queue_depth, session.min_sensor_queued
    );
    println!("  Initial skip:         {}", session.initial_skip);
    println!("  Flash:                {}", session.flash);
    println!("  Video stabilization:  {}", session.video_stabilization);
    println!("  Flash stable timeout: {} frames", session.flash_stable_timeout);

    for camera in &info.cameras {
        println!("\nCamera '{}':", camera.name);
        println!("  Sensor:    {}", camera.sensor_size);
        println!("  Autofocus: {}", if camera.autofocus { "yes" } else { "no" });
        println!("  Flash:     {}", if camera.flash { "yes" } else { "no" });
        println!("  Preview:   {}", camera.preview_sizes.join(", "));
        println!("  Capture:   {}", camera.capture_sizes.join(", "));
        println!("  FPS:       {}", camera.fps_ranges.join(", "));
    }
}
