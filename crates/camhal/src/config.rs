// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use std::fmt;

/// Static description of what a sensor module supports.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorCapabilities {
    pub name: String,
    pub sensor_size: (u32, u32),
    pub preview_sizes: Vec<(u32, u32)>,
    pub capture_sizes: Vec<(u32, u32)>,
    pub fps_ranges: Vec<[u32; 2]>,
    pub has_autofocus: bool,
    pub has_flash: bool,
}

impl SensorCapabilities {
    /// Rear module with autofocus and flash.
    pub fn back() -> Self {
        SensorCapabilities {
            name: "back".to_owned(),
            sensor_size: (3264, 2448),
            preview_sizes: vec![
                (1920, 1080),
                (1280, 720),
                (720, 480),
                (640, 480),
                (320, 240),
            ],
            capture_sizes: vec![(3264, 2448), (1920, 1080), (1280, 720), (640, 480)],
            fps_ranges: vec![[15, 15], [15, 30], [24, 24], [30, 30]],
            has_autofocus: true,
            has_flash: true,
        }
    }

    /// Front module, fixed focus and no flash.
    pub fn front() -> Self {
        SensorCapabilities {
            name: "front".to_owned(),
            sensor_size: (1392, 1392),
            preview_sizes: vec![(1280, 720), (640, 480), (320, 240)],
            capture_sizes: vec![(1392, 1392), (1280, 960), (640, 480)],
            fps_ranges: vec![[15, 15], [15, 30], [30, 30]],
            has_autofocus: false,
            has_flash: false,
        }
    }

    pub fn supports_preview(&self, width: u32, height: u32) -> bool {
        self.preview_sizes.contains(&(width, height))
    }

    pub fn supports_capture(&self, width: u32, height: u32) -> bool {
        self.capture_sizes.contains(&(width, height))
    }
}

impl Default for SensorCapabilities {
    fn default() -> Self {
        Self::back()
    }
}

impl fmt::Display for SensorCapabilities {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {}x{} af={} flash={}",
            self.name, self.sensor_size.0, self.sensor_size.1, self.has_autofocus, self.has_flash
        )
    }
}

/// Tunables for a capture session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// in-flight request table size
    pub request_capacity: usize,

    /// raw buffers shared by sensor and ISP
    pub raw_buffers: usize,

    /// raw buffers queued to the sensor before streaming starts
    pub min_sensor_queued: usize,

    /// output frames cancelled after stream start while 3A settles
    pub initial_skip: u32,

    /// whether the module has a usable flash unit
    pub flash: bool,

    /// whether stabilization bubbles are produced for video requests
    pub video_stabilization: bool,

    pub capabilities: SensorCapabilities,

    /// frames to wait for a stable flash before capturing anyway
    pub flash_stable_timeout: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            request_capacity: 5,
            raw_buffers: 8,
            min_sensor_queued: 3,
            initial_skip: 6,
            flash: true,
            video_stabilization: false,
            capabilities: SensorCapabilities::default(),
            flash_stable_timeout: 10,
        }
    }
}

impl SessionConfig {
    pub fn with_request_capacity(self, request_capacity: usize) -> Self {
        SessionConfig {
            request_capacity,
            ..self
        }
    }

    pub fn with_raw_buffers(self, raw_buffers: usize) -> Self {
        SessionConfig {
            raw_buffers,
            ..self
        }
    }

    pub fn with_min_sensor_queued(self, min_sensor_queued: usize) -> Self {
        SessionConfig {
            min_sensor_queued,
            ..self
        }
    }

    pub fn with_initial_skip(self, initial_skip: u32) -> Self {
        SessionConfig {
            initial_skip,
            ..self
        }
    }

    pub fn with_flash(self, flash: bool) -> Self {
        SessionConfig { flash, ..self }
    }

    pub fn with_video_stabilization(self, video_stabilization: bool) -> Self {
        SessionConfig {
            video_stabilization,
            ..self
        }
    }

    /// Also disables the flash when the module has none.
    pub fn with_capabilities(self, capabilities: SensorCapabilities) -> Self {
        SessionConfig {
            flash: self.flash && capabilities.has_flash,
            capabilities,
            ..self
        }
    }

    pub fn with_flash_stable_timeout(self, flash_stable_timeout: u32) -> Self {
        SessionConfig {
            flash_stable_timeout,
            ..self
        }
    }

    /// Sensor queue depth actually used, never more than the ring holds.
    pub fn sensor_queue_depth(&self) -> usize {
        self.min_sensor_queued.clamp(1, self.raw_buffers.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.request_capacity, 5);
        assert_eq!(config.raw_buffers, 8);
        assert_eq!(config.sensor_queue_depth(), 3);
        assert!(config.flash);
    }

    #[test]
    fn test_builder() {
        let config = SessionConfig::default()
            .with_request_capacity(3)
            .with_raw_buffers(2)
            .with_min_sensor_queued(4)
            .with_initial_skip(0)
            .with_flash_stable_timeout(2);
        assert_eq!(config.request_capacity, 3);
        assert_eq!(config.sensor_queue_depth(), 2);
        assert_eq!(config.initial_skip, 0);
        assert_eq!(config.flash_stable_timeout, 2);
    }

    #[test]
    fn test_front_camera_has_no_flash() {
        let config = SessionConfig::default().with_capabilities(SensorCapabilities::front());
        assert!(!config.flash);
        assert!(config.capabilities.supports_preview(640, 480));
        assert!(!config.capabilities.supports_preview(1920, 1080));
    }
}
