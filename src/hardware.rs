// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interfaces of the hardware collaborators: the camera and zoom blocks, and the 2D engine.
//!
//! The buffer manager calls into these; it never implements them. Host-side implementations live
//! in [`crate::simulated`].

use std::sync::Arc;

use thiserror::Error;

use crate::buffer::BufferConfiguration;
use crate::buffer::BufferRequirement;
use crate::buffer::NativeBuffer;
use crate::buffer::Rect;
use crate::format::SurfaceDescription;
use crate::memory::MemoryError;
use crate::memory::MemoryHandle;
use crate::memory::MemoryManager;
use crate::stream::camera_output_stream;
use crate::stream::zoom_output_stream;
use crate::stream::StreamIndex;
use crate::Component;
use crate::OutputLocation;

/// Opaque status returned by a failing hardware block call.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
#[error("hardware block returned status {0:#x}")]
pub struct HardwareError(pub i32);

/// Negotiation events sent to a block on one of its streams.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    BufferRequirements(BufferRequirement),
    BufferConfiguration(BufferConfiguration),
    BufferConfigurationReply { accepted: bool },
}

/// What is being transferred to a block.
#[derive(Debug)]
pub enum TransferMessage<'a> {
    StreamEvent(StreamEvent),
    /// A filled buffer. The block holds it logically until it completes or is aborted.
    Payload(&'a NativeBuffer),
}

/// Control interface of a hardware block (camera capture or digital zoom).
///
/// Completion of asynchronous operations is reported from the block's own event thread through
/// [`crate::sync::PipelineSync`].
pub trait HardwareBlock: Send + Sync {
    /// Tells the block whether this buffer manager allocates the buffers of `stream`.
    fn set_buffer_allocator(&self, stream: StreamIndex, enabled: bool)
        -> Result<(), HardwareError>;

    fn transfer_buffer(
        &self,
        stream: StreamIndex,
        message: TransferMessage<'_>,
    ) -> Result<(), HardwareError>;

    /// Asks the block to give back every buffer it holds on `stream`.
    fn abort_buffers(&self, stream: StreamIndex) -> Result<(), HardwareError>;
}

/// The two hardware blocks of the pipeline.
#[derive(Clone)]
pub struct PipelineBlocks {
    pub camera: Arc<dyn HardwareBlock>,
    pub zoom: Arc<dyn HardwareBlock>,
}

impl PipelineBlocks {
    pub fn new(camera: Arc<dyn HardwareBlock>, zoom: Arc<dyn HardwareBlock>) -> Self {
        Self { camera, zoom }
    }

    /// Returns the block and output stream serving `location`, or `None` for the host stage.
    pub fn resolve(
        &self,
        location: OutputLocation,
        usb_camera: bool,
    ) -> Option<(&dyn HardwareBlock, StreamIndex)> {
        match location.component {
            Component::Capture => Some((
                self.camera.as_ref(),
                StreamIndex::Camera(camera_output_stream(location.port, usb_camera)),
            )),
            Component::Zoom => Some((
                self.zoom.as_ref(),
                StreamIndex::Zoom(zoom_output_stream(location.port)),
            )),
            Component::Host => None,
        }
    }
}

/// Buffer parameters the 2D engine needs for a surface.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferParams {
    pub use_system_memory: bool,
    pub alignment: u32,
    pub pitch: u32,
    pub size: u32,
}

/// The 2D engine: surface geometry queries and direct surface writes.
pub trait SurfaceEngine: Send + Sync {
    fn compute_alignment(&self, surface: &SurfaceDescription) -> u32;

    fn compute_pitch(&self, surface: &SurfaceDescription) -> u32;

    /// Size of `surface`, using its `pitch`.
    fn compute_size(&self, surface: &SurfaceDescription) -> u32;

    fn compute_buffer_params(&self, surface: &SurfaceDescription) -> BufferParams;

    /// Writes `value` into every pixel of `rect` of the surface stored at `offset` in `handle`.
    fn fill(
        &self,
        memory: &dyn MemoryManager,
        surface: &SurfaceDescription,
        handle: &MemoryHandle,
        offset: u32,
        rect: Rect,
        value: u8,
    ) -> Result<(), MemoryError>;
}
