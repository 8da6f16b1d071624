// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Raw buffer ring shared by the sensor and the ISP.
//!
//! Every buffer moves `FreeOnHost → OnSensor → FilledOnHost → OnIsp →
//! FreeOnHost`. Three cursors walk the ring independently: the next buffer
//! to give to the sensor, the next filled buffer to give to the ISP, and the
//! buffer the ISP is expected to return next. Each transition checks the
//! predecessor state and leaves the ring untouched when it does not hold.

use log::{debug, error};
use std::{
    fmt,
    sync::{Mutex, MutexGuard, PoisonError},
};

use crate::{
    control::FrameNumber,
    ring::{Index, Ring},
    Error,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    FreeOnHost,
    OnSensor,
    FilledOnHost,
    OnIsp,
}

impl BufferState {
    pub fn name(self) -> &'static str {
        match self {
            BufferState::FreeOnHost => "free-on-host",
            BufferState::OnSensor => "on-sensor",
            BufferState::FilledOnHost => "filled-on-host",
            BufferState::OnIsp => "on-isp",
        }
    }
}

impl fmt::Display for BufferState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawBuffer {
    state: BufferState,
    frame: Option<FrameNumber>,
}

impl RawBuffer {
    pub fn state(&self) -> BufferState {
        self.state
    }

    pub fn frame(&self) -> Option<FrameNumber> {
        self.frame
    }
}

pub type BufferIndex = Index<RawBuffer>;

/// Number of buffers in each state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateCounts {
    pub free_on_host: usize,
    pub on_sensor: usize,
    pub filled_on_host: usize,
    pub on_isp: usize,
}

impl StateCounts {
    pub fn total(&self) -> usize {
        self.free_on_host + self.on_sensor + self.filled_on_host + self.on_isp
    }
}

#[derive(Debug)]
struct PoolInner {
    ring: Ring<RawBuffer>,
    sensor_enqueue_head: BufferIndex,
    isp_enqueue_head: BufferIndex,
    isp_dequeue_head: BufferIndex,
}

impl PoolInner {
    fn check(&self, index: BufferIndex, expected: BufferState) -> Result<(), Error> {
        let found = self.ring.get(index).state;
        if found == expected {
            return Ok(());
        }
        error!(
            "raw buffer {} is {} but expected {}",
            index, found, expected
        );
        Err(Error::StateMismatch {
            index: index.get(),
            expected: expected.name(),
            found: found.name(),
        })
    }
}

/// Ownership tracker for the raw buffer ring.
#[derive(Debug)]
pub struct FrameBufferPool {
    inner: Mutex<PoolInner>,
}

impl FrameBufferPool {
    pub fn new(capacity: usize) -> Self {
        let ring = Ring::from_fn(capacity, |_| RawBuffer {
            state: BufferState::FreeOnHost,
            frame: None,
        });
        let first = ring.first();
        FrameBufferPool {
            inner: Mutex::new(PoolInner {
                ring,
                sensor_enqueue_head: first,
                isp_enqueue_head: first,
                isp_dequeue_head: first,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.lock().ring.capacity()
    }

    /// Validate a raw index reported by the hardware.
    pub fn index(&self, raw: usize) -> Option<BufferIndex> {
        self.lock().ring.index(raw)
    }

    pub fn buffer(&self, index: BufferIndex) -> RawBuffer {
        *self.lock().ring.get(index)
    }

    /// Take the buffer at the sensor cursor to queue it on the sensor.
    pub fn acquire_for_capture(&self) -> Result<BufferIndex, Error> {
        let mut inner = self.lock();
        let head = inner.sensor_enqueue_head;
        if inner.ring.get(head).state != BufferState::FreeOnHost {
            debug!("raw buffer {} not free, sensor queue is full", head);
            return Err(Error::Full);
        }
        inner.ring.get_mut(head).state = BufferState::OnSensor;
        inner.sensor_enqueue_head = inner.ring.next(head);
        Ok(head)
    }

    /// Record a buffer the sensor has filled with `frame`.
    pub fn release_from_capture(
        &self,
        index: BufferIndex,
        frame: FrameNumber,
    ) -> Result<(), Error> {
        let mut inner = self.lock();
        inner.check(index, BufferState::OnSensor)?;
        let buffer = inner.ring.get_mut(index);
        buffer.state = BufferState::FilledOnHost;
        buffer.frame = Some(frame);
        Ok(())
    }

    /// Take the next filled buffer to queue it on the ISP.
    pub fn acquire_for_isp(&self) -> Result<(BufferIndex, Option<FrameNumber>), Error> {
        let mut inner = self.lock();
        let head = inner.isp_enqueue_head;
        let buffer = inner.ring.get(head);
        if buffer.state != BufferState::FilledOnHost {
            debug!("raw buffer {} is {}, nothing for the ISP", head, buffer.state);
            return Err(Error::Empty);
        }
        let frame = buffer.frame;
        inner.ring.get_mut(head).state = BufferState::OnIsp;
        inner.isp_enqueue_head = inner.ring.next(head);
        Ok((head, frame))
    }

    /// Buffer the ISP is expected to return next.
    pub fn acquire_for_isp_dequeue(&self) -> Result<(BufferIndex, Option<FrameNumber>), Error> {
        let inner = self.lock();
        let head = inner.isp_dequeue_head;
        let buffer = inner.ring.get(head);
        if buffer.state != BufferState::OnIsp {
            return Err(Error::Empty);
        }
        Ok((head, buffer.frame))
    }

    /// Free a buffer the ISP returned. It must be the ISP dequeue head.
    pub fn release_from_isp(&self, index: BufferIndex) -> Result<(), Error> {
        let mut inner = self.lock();
        let head = inner.isp_dequeue_head;
        if index != head {
            error!("ISP returned raw buffer {} but {} was expected", index, head);
            return Err(Error::StateMismatch {
                index: index.get(),
                expected: "isp-dequeue-head",
                found: inner.ring.get(index).state.name(),
            });
        }
        inner.check(index, BufferState::OnIsp)?;
        let buffer = inner.ring.get_mut(index);
        buffer.state = BufferState::FreeOnHost;
        buffer.frame = None;
        inner.isp_dequeue_head = inner.ring.next(index);
        Ok(())
    }

    pub fn counts(&self) -> StateCounts {
        let inner = self.lock();
        let mut counts = StateCounts::default();
        for (_, buffer) in inner.ring.iter() {
            match buffer.state {
                BufferState::FreeOnHost => counts.free_on_host += 1,
                BufferState::OnSensor => counts.on_sensor += 1,
                BufferState::FilledOnHost => counts.filled_on_host += 1,
                BufferState::OnIsp => counts.on_isp += 1,
            }
        }
        counts
    }

    /// Return every buffer to the host and rewind the cursors.
    pub fn reset(&self) {
        let mut inner = self.lock();
        for buffer in inner.ring.iter_mut() {
            buffer.state = BufferState::FreeOnHost;
            buffer.frame = None;
        }
        let first = inner.ring.first();
        inner.sensor_enqueue_head = first;
        inner.isp_enqueue_head = first;
        inner.isp_dequeue_head = first;
    }
}
