// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Buffer management between the Tegra camera capture block and the digital zoom (DZ) block.
//!
//! The crate is split along the lifecycle of a buffer:
//!
//! * [`negotiator`] reconciles what each pipeline stage requires with what will actually be
//!   allocated, and runs the configuration handshake with the hardware blocks.
//! * [`allocator`] turns an agreed configuration into [`buffer::NativeBuffer`]s backed by physical
//!   memory, or repurposes existing buffers when a new configuration still fits in them.
//! * [`handler`] ships filled buffers to the hardware and reclaims them on abort.
//!
//! None of these spawn threads. They run on the caller's control thread, holding the pipeline
//! lock obtained from [`sync::PipelineSync::lock`], while hardware blocks report completion from
//! their own event threads.

pub mod allocator;
pub mod buffer;
pub mod format;
pub mod handler;
pub mod hardware;
pub mod memory;
pub mod negotiator;
pub mod platform;
pub mod policy;
pub mod properties;
pub mod simulated;
pub mod stream;
pub mod sync;

use enumn::N;
use thiserror::Error;

use crate::hardware::HardwareError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("insufficient memory")]
    InsufficientMemory,
    #[error("timed out waiting for the hardware block")]
    Timeout,
    #[error("bad parameter: {0}")]
    BadParameter(String),
    #[error(transparent)]
    Hardware(#[from] HardwareError),
}

/// Pipeline stage owning a buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, N)]
#[repr(u32)]
pub enum Component {
    /// The camera capture block.
    Capture = 0,
    /// The digital zoom / ISP block.
    Zoom = 1,
    /// The host (HAL) side. Buffers are never allocated or shipped for it here.
    Host = 2,
}

/// Destination of a buffer: a pipeline stage and one of its output ports.
///
/// `port` is kept as a raw index because it comes straight from the HAL. It is interpreted by
/// [`stream::camera_output_stream`] or [`stream::zoom_output_stream`] depending on `component`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct OutputLocation {
    pub component: Component,
    pub port: u32,
}

impl OutputLocation {
    pub fn new(component: Component, port: u32) -> Self {
        Self { component, port }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Whether `self` can hold a surface of resolution `other`.
    pub fn can_contain(&self, other: Self) -> bool {
        self.width >= other.width && self.height >= other.height
    }

    /// The same area with width and height exchanged, as seen after a 90 degree rotation.
    pub fn transposed(&self) -> Self {
        Self { width: self.height, height: self.width }
    }
}

/// Rounds `value` up to the next multiple of `alignment`, or returns `None` if that multiple does
/// not fit in a `u32`. An alignment of 0 or 1 is a no-op.
pub fn checked_align_up(value: u32, alignment: u32) -> Option<u32> {
    if alignment <= 1 {
        return Some(value);
    }
    value.checked_next_multiple_of(alignment)
}

/// Rounds `value` up to the next multiple of `alignment`, saturating at `u32::MAX`.
pub fn align_up(value: u32, alignment: u32) -> u32 {
    checked_align_up(value, alignment).unwrap_or(u32::MAX)
}
