// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Camera HAL coordination core for Rust
//!
//! Coordinates a continuous image-sensor capture stream with a client-driven
//! queue of per-frame capture requests. Raw buffers circulate between the
//! sensor and the ISP through a fixed ring, requests are matched to
//! hardware frames by frame number, and finished results are handed back to
//! the client in strict frame order regardless of the order in which their
//! outputs were delivered.
//!
//! # Quick Start
//!
//! ```no_run
//! use camhal::control::{CaptureRequest, OutputMask};
//! use camhal::tracker::RequestTracker;
//!
//! let tracker = RequestTracker::new(5);
//! let intent = tracker.admit(CaptureRequest::new(1, OutputMask::PREVIEW))?;
//! println!("admitted frame {}", intent.frame);
//! # Ok::<(), camhal::Error>(())
//! ```
//!
//! A full session with worker threads is opened with
//! [`Session::open`](session::Session::open) on a
//! [`HardwarePipeline`](hw::HardwarePipeline); the [`hw::virt`] module
//! provides in-process hardware for tests and simulation.
//!
//! # Features
//!
//! - Ordered completion of out-of-order output deliveries
//! - Raw buffer hand-off between sensor and ISP with state validation
//! - Autofocus transition tables for auto, macro and continuous families
//! - Pre-flash and capture flash sequencing
//! - Signal-driven worker loops with a release handshake

use std::{error, fmt, io};

use crate::hw::DeviceKind;

/// Error type for camera HAL operations
#[derive(Debug)]
pub enum Error {
    /// I/O error outside of a specific device call
    Io(io::Error),

    /// A hardware device call failed
    Device {
        kind: DeviceKind,
        op: &'static str,
        source: io::Error,
    },

    /// The request table has no free slot
    QueueFull,

    /// The slot at the insertion cursor still holds a request
    SlotBusy(usize),

    /// No raw buffer is free for capture
    Full,

    /// No raw buffer is waiting for the ISP
    Empty,

    /// No request matches the frame
    NotFound,

    /// A buffer or slot was not in the state the transition requires
    StateMismatch {
        index: usize,
        expected: &'static str,
        found: &'static str,
    },

    /// The requested stream format or size is not supported
    UnsupportedStream(String),

    /// The stream id or substream operation is not valid
    InvalidStream(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "I/O error: {}", err),
            Error::Device { kind, op, source } => {
                write!(f, "{} {} failed: {}", kind, op, source)
            }
            Error::QueueFull => write!(f, "request queue is full"),
            Error::SlotBusy(slot) => write!(f, "request slot {} is still occupied", slot),
            Error::Full => write!(f, "no raw buffer free for capture"),
            Error::Empty => write!(f, "no raw buffer waiting for the ISP"),
            Error::NotFound => write!(f, "no matching request"),
            Error::StateMismatch {
                index,
                expected,
                found,
            } => write!(
                f,
                "entry {} is {} but the transition requires {}",
                index, found, expected
            ),
            Error::UnsupportedStream(msg) => write!(f, "unsupported stream: {}", msg),
            Error::InvalidStream(msg) => write!(f, "invalid stream: {}", msg),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            Error::Device { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

/// The ring module provides fixed-capacity storage with typed indices.
pub mod ring;

/// The control module provides requests, shots and per-frame metadata.
pub mod control;

/// The client module provides the traits implemented by the HAL client.
pub mod client;

/// The config module provides session configuration.
pub mod config;

/// The signal module provides worker wake-up bits and completions.
pub mod signal;

/// The tracker module provides the in-flight request table.
pub mod tracker;

/// The pool module provides the raw buffer ring shared by sensor and ISP.
pub mod pool;

/// The af module provides the autofocus state machine.
pub mod af;

/// The flash module provides the flash sequencer.
pub mod flash;

/// The hw module provides the hardware device abstraction.
pub mod hw;

/// The stream module provides output stream bindings and substreams.
pub mod stream;

/// The loops module provides the worker threads.
pub mod loops;

/// The session module ties the workers together.
pub mod session;

/// Current wall-clock time in nanoseconds, as stamped on captured frames.
pub fn timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
