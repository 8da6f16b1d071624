// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Output streams.
//!
//! Each scaler feeds one stream loop. A *direct* stream hands scaler
//! buffers straight to the client; its first `hw_buffers` client buffers
//! double as the scaler's buffers. An *indirect* stream owns its buffers
//! and only feeds attached substreams.

use log::{debug, error, warn};
use std::fmt;

use crate::{
    client::{StreamOps, Substream, SubstreamFrame},
    control::{FrameNumber, OutputMask, Shot},
    hw::{DeviceKind, Format, HardwarePipeline},
    Error,
};

/// Substreams one stream loop can carry.
pub const MAX_SUBSTREAMS: usize = 4;

/// Output id, the bit position of the output in an [`OutputMask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(u8);

impl StreamId {
    pub const PREVIEW: StreamId = StreamId(0);
    pub const JPEG: StreamId = StreamId(1);
    pub const RECORD: StreamId = StreamId(2);
    pub const PREVIEW_CALLBACK: StreamId = StreamId(3);
    pub const ZSL: StreamId = StreamId(4);

    pub fn new(id: u8) -> Result<StreamId, Error> {
        if id <= Self::ZSL.0 {
            Ok(StreamId(id))
        } else {
            Err(Error::InvalidStream(format!("unknown stream id {}", id)))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }

    pub fn mask(self) -> OutputMask {
        OutputMask::from_bits_truncate(1 << self.0)
    }

    /// Scaler producing this output.
    pub fn scaler(self) -> Scaler {
        if self.mask().intersects(OutputMask::SCALER_PREVIEW) {
            Scaler::Preview
        } else {
            Scaler::Capture
        }
    }

    pub fn name(self) -> &'static str {
        match self.0 {
            0 => "preview",
            1 => "jpeg",
            2 => "record",
            3 => "preview-callback",
            _ => "zsl",
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// The two scalers, each with its own stream loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scaler {
    Preview,
    Capture,
}

impl Scaler {
    pub fn index(self) -> usize {
        match self {
            Scaler::Preview => 0,
            Scaler::Capture => 1,
        }
    }

    pub fn device(self) -> DeviceKind {
        match self {
            Scaler::Preview => DeviceKind::ScalerPreview,
            Scaler::Capture => DeviceKind::ScalerCapture,
        }
    }

    /// Output targets this scaler produces.
    pub fn outputs(self) -> OutputMask {
        match self {
            Scaler::Preview => OutputMask::SCALER_PREVIEW,
            Scaler::Capture => OutputMask::SCALER_CAPTURE,
        }
    }

    /// Stream delivered straight to the client by this scaler's loop.
    pub fn direct_stream(self) -> StreamId {
        match self {
            Scaler::Preview => StreamId::PREVIEW,
            Scaler::Capture => StreamId::ZSL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Direct,
    Indirect,
}

/// Who holds a client buffer of a direct stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientBufferStatus {
    OnService,
    /// Queued to the driver at registration, still to be taken from the client.
    RequiresDequeue,
    OnHal,
    OnDriver,
}

/// Fixed table of substreams attached to one stream loop.
#[derive(Default)]
pub struct SubstreamTable {
    slots: [Option<Box<dyn Substream>>; MAX_SUBSTREAMS],
}

impl fmt::Debug for SubstreamTable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list().entries(self.ids()).finish()
    }
}

impl SubstreamTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids(&self) -> Vec<StreamId> {
        self.slots.iter().flatten().map(|s| s.id()).collect()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn attach(&mut self, substream: Box<dyn Substream>) -> Result<(), Error> {
        let id = substream.id();
        if self.ids().contains(&id) {
            return Err(Error::InvalidStream(format!("{} already attached", id)));
        }
        let Some(slot) = self.slots.iter_mut().find(|slot| slot.is_none()) else {
            return Err(Error::InvalidStream(format!(
                "no room to attach {}, {} substreams attached",
                id, MAX_SUBSTREAMS
            )));
        };
        debug!("attached substream {}", id);
        *slot = Some(substream);
        Ok(())
    }

    pub fn detach(&mut self, id: StreamId) -> Result<Box<dyn Substream>, Error> {
        self.slots
            .iter_mut()
            .find(|slot| slot.as_ref().map_or(false, |s| s.id() == id))
            .and_then(Option::take)
            .ok_or_else(|| Error::InvalidStream(format!("{} is not attached", id)))
    }

    /// Run every substream whose output is in `mask`, returning how many ran.
    pub fn run(&mut self, frame: &SubstreamFrame, mask: OutputMask) -> usize {
        let mut ran = 0;
        for substream in self.slots.iter_mut().flatten() {
            if !mask.intersects(substream.id().mask()) {
                continue;
            }
            if let Err(err) = substream.process(frame) {
                error!(
                    "substream {} failed on frame {}: {}",
                    substream.id(),
                    frame.frame_number,
                    err
                );
            }
            ran += 1;
        }
        ran
    }
}

/// One scaler's stream and its buffers.
pub struct StreamBinding {
    id: StreamId,
    kind: StreamKind,
    format: Format,
    hw_buffers: usize,
    total_buffers: usize,
    ops: Option<Box<dyn StreamOps>>,
    status: Vec<ClientBufferStatus>,
    in_hal: usize,
    initialized: bool,
    pub substreams: SubstreamTable,
}

impl fmt::Debug for StreamBinding {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("StreamBinding")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("format", &self.format)
            .field("hw_buffers", &self.hw_buffers)
            .field("in_hal", &self.in_hal)
            .field("substreams", &self.substreams)
            .finish()
    }
}

impl StreamBinding {
    /// Stream delivering client buffers; the first `hw_buffers` of
    /// `total_buffers` are handed to the scaler.
    pub fn direct(
        id: StreamId,
        format: Format,
        hw_buffers: usize,
        total_buffers: usize,
        ops: Box<dyn StreamOps>,
    ) -> Result<Self, Error> {
        if id != id.scaler().direct_stream() {
            return Err(Error::InvalidStream(format!(
                "{} cannot be a direct stream",
                id
            )));
        }
        if hw_buffers == 0 || hw_buffers > total_buffers {
            return Err(Error::InvalidStream(format!(
                "{} hardware buffers out of {}",
                hw_buffers, total_buffers
            )));
        }
        Ok(StreamBinding {
            id,
            kind: StreamKind::Direct,
            format,
            hw_buffers,
            total_buffers,
            ops: Some(ops),
            status: vec![ClientBufferStatus::OnService; total_buffers],
            in_hal: 0,
            initialized: false,
            substreams: SubstreamTable::new(),
        })
    }

    /// Stream on internal buffers that only feeds substreams.
    pub fn indirect(scaler: Scaler, format: Format, hw_buffers: usize) -> Result<Self, Error> {
        if hw_buffers == 0 {
            return Err(Error::InvalidStream("no hardware buffers".to_owned()));
        }
        Ok(StreamBinding {
            id: scaler.direct_stream(),
            kind: StreamKind::Indirect,
            format,
            hw_buffers,
            total_buffers: hw_buffers,
            ops: None,
            status: Vec::new(),
            in_hal: 0,
            initialized: true,
            substreams: SubstreamTable::new(),
        })
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn scaler(&self) -> Scaler {
        self.id.scaler()
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn hw_buffers(&self) -> usize {
        self.hw_buffers
    }

    pub fn buffers_in_hal(&self) -> usize {
        self.in_hal
    }

    pub fn status(&self, index: usize) -> Option<ClientBufferStatus> {
        self.status.get(index).copied()
    }

    /// Configure the scaler, queue its buffers and start streaming.
    pub fn register(&mut self, hw: &HardwarePipeline) -> Result<(), Error> {
        let device = self.scaler().device();
        hw.configure(device, self.format, self.hw_buffers)?;
        for index in 0..self.hw_buffers {
            hw.enqueue(device, index, Shot::default())?;
            if let Some(status) = self.status.get_mut(index) {
                *status = ClientBufferStatus::RequiresDequeue;
            }
        }
        hw.stream_on(device)?;
        debug!(
            "{} stream registered {} with {} hardware buffers",
            self.id, self.format, self.hw_buffers
        );
        Ok(())
    }

    /// Take the client's buffers on first use.
    pub fn init_buffers(&mut self) {
        if self.initialized {
            return;
        }
        self.initialized = true;
        let Some(ops) = self.ops.as_mut() else {
            return;
        };
        let wanted = self.total_buffers.saturating_sub(ops.min_undequeued());
        for _ in 0..wanted {
            let Some(index) = ops.dequeue_buffer() else {
                error!("{} stream: client has no buffer to hand over", self.id);
                return;
            };
            match self.status.get_mut(index) {
                Some(status @ ClientBufferStatus::RequiresDequeue) => {
                    *status = ClientBufferStatus::OnDriver
                }
                Some(status @ ClientBufferStatus::OnService) => *status = ClientBufferStatus::OnHal,
                Some(status) => warn!("{} buffer {} is {:?}", self.id, index, status),
                None => {
                    error!("{} stream: unknown client buffer {}", self.id, index);
                    continue;
                }
            }
            self.in_hal += 1;
        }
    }

    /// Mark a buffer the scaler returned.
    pub fn returned_from_driver(&mut self, index: usize) {
        if let Some(status) = self.status.get_mut(index) {
            if *status != ClientBufferStatus::OnDriver {
                debug!("{} buffer {} returned while {:?}", self.id, index, status);
            }
            *status = ClientBufferStatus::OnHal;
        }
    }

    /// Give a filled buffer to the client, or cancel it back.
    pub fn hand_back(&mut self, index: usize, timestamp_ns: Option<i64>) {
        let Some(ops) = self.ops.as_mut() else {
            return;
        };
        let result = match timestamp_ns {
            Some(ts) => ops.enqueue_buffer(index, ts),
            None => ops.cancel_buffer(index),
        };
        match result {
            Ok(()) => {
                if let Some(status) = self.status.get_mut(index) {
                    *status = ClientBufferStatus::OnService;
                }
                self.in_hal = self.in_hal.saturating_sub(1);
            }
            Err(err) => {
                error!("{} stream: buffer {} not returned: {}", self.id, index, err);
            }
        }
    }

    /// Pull client buffers until the client keeps only its minimum, queuing
    /// scaler buffers back to the driver.
    pub fn replenish(&mut self, hw: &HardwarePipeline) {
        let device = self.scaler().device();
        let Some(ops) = self.ops.as_mut() else {
            return;
        };
        let target = self.total_buffers - self.hw_buffers + ops.min_undequeued();
        while self.in_hal < target {
            let Some(index) = ops.dequeue_buffer() else {
                break;
            };
            self.in_hal += 1;
            let Some(status) = self.status.get_mut(index) else {
                error!("{} stream: unknown client buffer {}", self.id, index);
                break;
            };
            if index < self.hw_buffers {
                match hw.enqueue(device, index, Shot::default()) {
                    Ok(()) => *status = ClientBufferStatus::OnDriver,
                    Err(err) => {
                        error!("{}", err);
                        *status = ClientBufferStatus::OnHal;
                    }
                }
            } else {
                *status = ClientBufferStatus::OnHal;
            }
        }
    }

    /// Feed substreams with one scaler buffer.
    pub fn run_substreams(
        &mut self,
        frame_number: FrameNumber,
        timestamp_ns: i64,
        buffer: usize,
        mask: OutputMask,
    ) -> usize {
        let frame = SubstreamFrame {
            frame_number,
            timestamp_ns,
            buffer,
            parent: self.id,
        };
        self.substreams.run(&frame, mask)
    }

    /// Stop the scaler and drop its buffers.
    pub fn unregister(&mut self, hw: &HardwarePipeline) {
        let device = self.scaler().device();
        if let Err(err) = hw.stream_off(device) {
            error!("{}", err);
        }
        if let Err(err) = hw.release_buffers(device) {
            error!("{}", err);
        }
        self.in_hal = 0;
        self.initialized = self.kind == StreamKind::Indirect;
        for status in &mut self.status {
            *status = ClientBufferStatus::OnService;
        }
        debug!("{} stream unregistered", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::virt::{VirtualHardware, VirtualStreamOps};
    use std::{
        io,
        sync::{Arc, Mutex},
    };

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

    fn recorder(id: StreamId) -> (Box<dyn Substream>, Arc<Mutex<Vec<FrameNumber>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        (
            Box::new(Recorder {
                id,
                seen: seen.clone(),
            }),
            seen,
        )
    }

    #[test]
    fn test_stream_ids() {
        assert_eq!(StreamId::RECORD.mask(), OutputMask::RECORD);
        assert_eq!(StreamId::RECORD.scaler(), Scaler::Preview);
        assert_eq!(StreamId::JPEG.scaler(), Scaler::Capture);
        assert_eq!(StreamId::new(4).unwrap(), StreamId::ZSL);
        assert!(matches!(StreamId::new(5), Err(Error::InvalidStream(_))));
        assert_eq!(StreamId::PREVIEW_CALLBACK.to_string(), "preview-callback");
        assert_eq!(Scaler::Preview.outputs(), OutputMask::SCALER_PREVIEW);
        assert_eq!(Scaler::Capture.outputs(), OutputMask::SCALER_CAPTURE);
        assert!(Scaler::Capture.outputs().contains(StreamId::JPEG.mask()));
    }

    #[test]
    fn test_substream_attach_rules() {
        let mut table = SubstreamTable::new();
        table.attach(recorder(StreamId::JPEG).0).unwrap();
        assert!(matches!(
            table.attach(recorder(StreamId::JPEG).0),
            Err(Error::InvalidStream(_))
        ));
        table.attach(recorder(StreamId::RECORD).0).unwrap();
        table.attach(recorder(StreamId::PREVIEW_CALLBACK).0).unwrap();
        table.attach(recorder(StreamId::ZSL).0).unwrap();
        assert!(matches!(
            table.attach(recorder(StreamId::PREVIEW).0),
            Err(Error::InvalidStream(_))
        ));
        assert_eq!(table.len(), MAX_SUBSTREAMS);

        let detached = table.detach(StreamId::RECORD).unwrap();
        assert_eq!(detached.id(), StreamId::RECORD);
        assert!(table.detach(StreamId::RECORD).is_err());
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_substreams_follow_mask() {
        let mut table = SubstreamTable::new();
        let (jpeg, seen_jpeg) = recorder(StreamId::JPEG);
        let (record, seen_record) = recorder(StreamId::RECORD);
        table.attach(jpeg).unwrap();
        table.attach(record).unwrap();

        let frame = SubstreamFrame {
            frame_number: FrameNumber(8),
            timestamp_ns: 1,
            buffer: 0,
            parent: StreamId::PREVIEW,
        };
        assert_eq!(table.run(&frame, OutputMask::PREVIEW | OutputMask::JPEG), 1);
        assert_eq!(*seen_jpeg.lock().unwrap(), vec![FrameNumber(8)]);
        assert!(seen_record.lock().unwrap().is_empty());
    }

    #[test]
    fn test_direct_binding_rejects_bad_layout() {
        let ops = || Box::new(VirtualStreamOps::new(4, 1)) as Box<dyn StreamOps>;
        let vga = Format::new(640, 480);
        assert!(StreamBinding::direct(StreamId::JPEG, vga, 2, 4, ops()).is_err());
        assert!(StreamBinding::direct(StreamId::PREVIEW, vga, 5, 4, ops()).is_err());
        assert!(StreamBinding::direct(StreamId::ZSL, vga, 2, 4, ops()).is_ok());
    }

    #[test]
    fn test_direct_buffer_accounting() {
        let virt = VirtualHardware::default();
        let hw = virt.pipeline();
        let ops = VirtualStreamOps::new(6, 2);
        let counters = ops.counters();
        let mut binding =
            StreamBinding::direct(StreamId::PREVIEW, Format::new(640, 480), 4, 6, Box::new(ops))
                .unwrap();
        binding.register(&hw).unwrap();
        assert_eq!(binding.status(0), Some(ClientBufferStatus::RequiresDequeue));
        assert_eq!(binding.status(4), Some(ClientBufferStatus::OnService));

        binding.init_buffers();
        assert_eq!(binding.buffers_in_hal(), 4);
        assert_eq!(binding.status(3), Some(ClientBufferStatus::OnDriver));

        binding.returned_from_driver(0);
        binding.hand_back(0, Some(77));
        assert_eq!(binding.status(0), Some(ClientBufferStatus::OnService));
        assert_eq!(counters.delivered(), 1);
        assert_eq!(counters.last_timestamp_ns(), 77);

        binding.replenish(&hw);
        assert_eq!(binding.buffers_in_hal(), 4);
        assert_eq!(binding.status(4), Some(ClientBufferStatus::OnHal));

        binding.returned_from_driver(1);
        binding.hand_back(1, None);
        assert_eq!(counters.cancelled(), 1);
        binding.unregister(&hw);
        assert_eq!(binding.buffers_in_hal(), 0);
    }
}
