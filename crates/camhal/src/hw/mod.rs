// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Hardware device abstraction.
//!
//! The pipeline is made of four queue-based devices: the sensor, the ISP
//! and the two scalers. Buffers are opaque indices; a [`Shot`] travels
//! with each raw buffer through the sensor and ISP, and the scalers return
//! a shot carrying the frame number they produced.

use std::{
    fmt, io,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::{control::Shot, Error};

pub mod virt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Sensor,
    Isp,
    ScalerPreview,
    ScalerCapture,
}

impl DeviceKind {
    pub fn name(self) -> &'static str {
        match self {
            DeviceKind::Sensor => "sensor",
            DeviceKind::Isp => "isp",
            DeviceKind::ScalerPreview => "scaler-preview",
            DeviceKind::ScalerCapture => "scaler-capture",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Format {
    pub width: u32,
    pub height: u32,
}

impl Format {
    pub fn new(width: u32, height: u32) -> Self {
        Format { width, height }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// One queue-based hardware block.
pub trait Device: Send {
    fn kind(&self) -> DeviceKind;

    fn configure(&mut self, format: Format, buffers: usize) -> io::Result<()>;

    fn stream_on(&mut self) -> io::Result<()>;

    fn stream_off(&mut self) -> io::Result<()>;

    fn release_buffers(&mut self) -> io::Result<()>;

    fn enqueue(&mut self, index: usize, shot: Shot) -> io::Result<()>;

    /// Take the oldest completed buffer.
    fn dequeue(&mut self) -> io::Result<(usize, Shot)>;
}

pub type DeviceHandle = Arc<Mutex<Box<dyn Device>>>;

/// The four device handles of one camera.
#[derive(Clone)]
pub struct HardwarePipeline {
    sensor: DeviceHandle,
    isp: DeviceHandle,
    scaler_preview: DeviceHandle,
    scaler_capture: DeviceHandle,
}

impl fmt::Debug for HardwarePipeline {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("HardwarePipeline").finish_non_exhaustive()
    }
}

impl HardwarePipeline {
    pub fn new(
        sensor: Box<dyn Device>,
        isp: Box<dyn Device>,
        scaler_preview: Box<dyn Device>,
        scaler_capture: Box<dyn Device>,
    ) -> Self {
        HardwarePipeline {
            sensor: Arc::new(Mutex::new(sensor)),
            isp: Arc::new(Mutex::new(isp)),
            scaler_preview: Arc::new(Mutex::new(scaler_preview)),
            scaler_capture: Arc::new(Mutex::new(scaler_capture)),
        }
    }

    pub fn handle(&self, kind: DeviceKind) -> &DeviceHandle {
        match kind {
            DeviceKind::Sensor => &self.sensor,
            DeviceKind::Isp => &self.isp,
            DeviceKind::ScalerPreview => &self.scaler_preview,
            DeviceKind::ScalerCapture => &self.scaler_capture,
        }
    }

    fn lock(&self, kind: DeviceKind) -> MutexGuard<'_, Box<dyn Device>> {
        self.handle(kind)
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Run one device call, tagging a failure with the device and operation.
    pub fn call<T>(
        &self,
        kind: DeviceKind,
        op: &'static str,
        f: impl FnOnce(&mut dyn Device) -> io::Result<T>,
    ) -> Result<T, Error> {
        let mut device = self.lock(kind);
        f(device.as_mut()).map_err(|source| Error::Device { kind, op, source })
    }

    pub fn configure(&self, kind: DeviceKind, format: Format, buffers: usize) -> Result<(), Error> {
        self.call(kind, "configure", |d| d.configure(format, buffers))
    }

    pub fn stream_on(&self, kind: DeviceKind) -> Result<(), Error> {
        self.call(kind, "stream on", |d| d.stream_on())
    }

    pub fn stream_off(&self, kind: DeviceKind) -> Result<(), Error> {
        self.call(kind, "stream off", |d| d.stream_off())
    }

    pub fn release_buffers(&self, kind: DeviceKind) -> Result<(), Error> {
        self.call(kind, "release buffers", |d| d.release_buffers())
    }

    pub fn enqueue(&self, kind: DeviceKind, index: usize, shot: Shot) -> Result<(), Error> {
        self.call(kind, "enqueue", |d| d.enqueue(index, shot))
    }

    pub fn dequeue(&self, kind: DeviceKind) -> Result<(usize, Shot), Error> {
        self.call(kind, "dequeue", |d| d.dequeue())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Broken(DeviceKind);

    impl Device for Broken {
        fn kind(&self) -> DeviceKind {
            self.0
        }

        fn configure(&mut self, _format: Format, _buffers: usize) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::InvalidInput, "bad format"))
        }

        fn stream_on(&mut self) -> io::Result<()> {
            Ok(())
        }

        fn stream_off(&mut self) -> io::Result<()> {
            Ok(())
        }

        fn release_buffers(&mut self) -> io::Result<()> {
            Ok(())
        }

        fn enqueue(&mut self, _index: usize, _shot: Shot) -> io::Result<()> {
            Ok(())
        }

        fn dequeue(&mut self) -> io::Result<(usize, Shot)> {
            Err(io::Error::new(io::ErrorKind::WouldBlock, "empty"))
        }
    }

    fn broken() -> HardwarePipeline {
        HardwarePipeline::new(
            Box::new(Broken(DeviceKind::Sensor)),
            Box::new(Broken(DeviceKind::Isp)),
            Box::new(Broken(DeviceKind::ScalerPreview)),
            Box::new(Broken(DeviceKind::ScalerCapture)),
        )
    }

    #[test]
    fn test_errors_name_device_and_op() {
        let hw = broken();
        let err = hw
            .configure(DeviceKind::ScalerCapture, Format::new(640, 480), 4)
            .unwrap_err();
        assert_eq!(err.to_string(), "scaler-capture configure failed: bad format");
        match hw.dequeue(DeviceKind::Isp) {
            Err(Error::Device { kind, op, .. }) => {
                assert_eq!(kind, DeviceKind::Isp);
                assert_eq!(op, "dequeue");
            }
            other => panic!("unexpected {:?}", other.map(|(i, _)| i)),
        }
        assert!(hw.stream_on(DeviceKind::Sensor).is_ok());
    }

    #[test]
    fn test_handles_match_kind() {
        let hw = broken();
        for kind in [
            DeviceKind::Sensor,
            DeviceKind::Isp,
            DeviceKind::ScalerPreview,
            DeviceKind::ScalerCapture,
        ] {
            assert_eq!(hw.call(kind, "kind", |d| Ok(d.kind())).unwrap(), kind);
        }
    }
}
