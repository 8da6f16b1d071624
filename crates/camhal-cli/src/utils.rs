// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use crate::error::CliError;
use camhal::{config::SensorCapabilities, control::AfMode};
use signal_hook::consts::SIGINT;
use signal_hook::flag;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Parse resolution string in format "WxH" or "W*H"
///
/// # Examples
/// ```ignore
/// assert_eq!(parse_resolution("1920x1080").unwrap(), (1920, 1080));
/// assert_eq!(parse_resolution("1280*720").unwrap(), (1280, 720));
/// ```
pub fn parse_resolution(s: &str) -> Result<(u32, u32), CliError> {
    let Some((width_str, height_str)) = s.split_once('x').or_else(|| s.split_once('*')) else {
        return Err(CliError::InvalidArgs(format!(
            "Invalid resolution format (expected WxH or W*H): {}",
            s
        )));
    };

    let width = width_str
        .parse::<u32>()
        .map_err(|_| CliError::InvalidArgs(format!("Invalid width in resolution: {}", s)))?;
    let height = height_str
        .parse::<u32>()
        .map_err(|_| CliError::InvalidArgs(format!("Invalid height in resolution: {}", s)))?;

    if width == 0 || height == 0 {
        return Err(CliError::InvalidArgs(format!(
            "Resolution dimensions must be positive: {}",
            s
        )));
    }

    Ok((width, height))
}

/// Parse an autofocus mode name as accepted by `--af-mode`
pub fn parse_af_mode(s: &str) -> Result<AfMode, CliError> {
    match s.to_ascii_lowercase().as_str() {
        "off" => Ok(AfMode::Off),
        "auto" => Ok(AfMode::Auto),
        "macro" => Ok(AfMode::Macro),
        "continuous-video" | "video" => Ok(AfMode::ContinuousVideo),
        "continuous-picture" | "picture" => Ok(AfMode::ContinuousPicture),
        _ => Err(CliError::InvalidArgs(format!(
            "Unknown AF mode '{}' (expected off, auto, macro, video or picture)",
            s
        ))),
    }
}

/// Look up a sensor module by name
pub fn parse_camera(s: &str) -> Result<SensorCapabilities, CliError> {
    match s.to_ascii_lowercase().as_str() {
        "back" | "rear" => Ok(SensorCapabilities::back()),
        "front" => Ok(SensorCapabilities::front()),
        _ => Err(CliError::InvalidArgs(format!(
            "Unknown camera '{}' (expected back or front)",
            s
        ))),
    }
}

/// Install signal handler for graceful shutdown on Ctrl+C
///
/// Returns an Arc<AtomicBool> that will be set to true when SIGINT is received.
pub fn install_signal_handler() -> Result<Arc<AtomicBool>, CliError> {
    let term = Arc::new(AtomicBool::new(false));

    flag::register(SIGINT, Arc::clone(&term))
        .map_err(|e| CliError::General(format!("Failed to register signal handler: {}", e)))?;

    log::debug!("Installed SIGINT handler");
    Ok(term)
}
