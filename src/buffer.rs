// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Buffer requirements, agreed configurations and the native buffers allocated from them.

use crate::format::SurfaceDescription;
use crate::format::VideoFormat;
use crate::memory::SharedMemory;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum MemorySpace {
    #[default]
    System,
    Device,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Endianness {
    #[default]
    Little,
    Big,
}

/// What a pipeline stage needs from the buffers of one port.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferRequirement {
    pub min_buffers: u32,
    pub max_buffers: u32,
    pub memory_space: MemorySpace,
    pub byte_alignment: u32,
    pub endianness: Endianness,
    pub min_buffer_size: u32,
    pub physically_contiguous: bool,
    pub in_shared_memory: bool,
    pub format: VideoFormat,
}

/// The agreed counterpart of a [`BufferRequirement`]: what will actually be allocated.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferConfiguration {
    pub num_buffers: u32,
    pub memory_space: MemorySpace,
    pub byte_alignment: u32,
    pub endianness: Endianness,
    pub buffer_size: u32,
    pub physically_contiguous: bool,
    pub in_shared_memory: bool,
    pub format: VideoFormat,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl Rect {
    pub fn new(left: u32, top: u32, right: u32, bottom: u32) -> Self {
        Self { left, top, right, bottom }
    }

    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum PayloadKind {
    #[default]
    SurfaceArray,
    Opaque,
}

/// One plane of a [`NativeBuffer`].
#[derive(Clone, Debug, Default)]
pub struct Plane {
    pub surface: SurfaceDescription,
    /// Offset of the plane inside `memory`.
    pub offset: u32,
    /// Bytes reserved for this plane.
    pub size: u32,
    /// `None` when the memory is owned by somebody else (window buffers) or not allocated yet.
    pub memory: Option<SharedMemory>,
}

/// Metadata blocks attached to capture-stage buffers.
#[derive(Debug, Default)]
pub struct CaptureMetadata {
    pub exif: Option<SharedMemory>,
    pub maker_note: Option<SharedMemory>,
}

/// The allocated unit handed to the hardware blocks.
#[derive(Debug, Default)]
pub struct NativeBuffer {
    /// Assigned by the hardware block on first use.
    pub id: Option<u32>,
    pub payload: PayloadKind,
    pub planes: Vec<Plane>,
    /// Visible area. Only set for the zoom video stream when cropping is required.
    pub crop: Rect,
    pub metadata: Option<CaptureMetadata>,
}

impl NativeBuffer {
    /// A buffer whose planes mirror `format`, with no memory attached.
    pub fn from_format(format: &VideoFormat) -> Self {
        Self {
            planes: format
                .planes
                .iter()
                .map(|surface| Plane { surface: surface.clone(), ..Default::default() })
                .collect(),
            ..Default::default()
        }
    }

    pub fn num_planes(&self) -> usize {
        self.planes.len()
    }

    /// Whether every plane has memory attached.
    pub fn is_backed(&self) -> bool {
        !self.planes.is_empty() && self.planes.iter().all(|p| p.memory.is_some())
    }
}

/// A buffer in a caller-maintained pool, with the caller's record of whether the hardware
/// currently holds it.
#[derive(Debug, Default)]
pub struct PooledBuffer {
    pub buffer: NativeBuffer,
    pub in_use: bool,
}

impl From<NativeBuffer> for PooledBuffer {
    fn from(buffer: NativeBuffer) -> Self {
        Self { buffer, in_use: false }
    }
}
