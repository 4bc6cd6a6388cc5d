// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Physical memory manager interface.
//!
//! Handles returned by a [`MemoryManager`] are wrapped in a reference-counted [`SharedMemory`] once
//! they are attached to a plane, so that several planes can share a single allocation. The handle
//! is given back to the manager when its last owner releases it.

use std::sync::Arc;

use thiserror::Error;

/// Heaps a physical allocation can come from.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Heap {
    /// Carveout reserved for the camera.
    CameraReserved,
    ExternalCarveout,
    /// Generic external memory.
    External,
    /// System memory, used for small CPU-side blocks.
    System,
}

/// Priority order used for surface allocations.
pub const SURFACE_HEAPS: [Heap; 3] = [Heap::CameraReserved, Heap::ExternalCarveout, Heap::External];

/// Heaps used for metadata blocks.
pub const METADATA_HEAPS: [Heap; 1] = [Heap::System];

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Coherency {
    WriteCombine,
    Cached,
    Uncached,
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("no heap can satisfy {size} bytes aligned to {alignment}")]
    Exhausted { size: u32, alignment: u32 },
    #[error("failed to map memory: {0}")]
    Map(nix::errno::Errno),
    #[error("access outside of the allocation")]
    OutOfBounds,
    #[error("unknown memory handle {0}")]
    UnknownHandle(u64),
}

/// An allocation owned by whoever holds this value. Not `Clone`: sharing goes through
/// [`SharedMemory`].
#[derive(Debug, PartialEq, Eq)]
pub struct MemoryHandle {
    id: u64,
    size: u32,
    alignment: u32,
    heap: Heap,
}

impl MemoryHandle {
    /// Only memory managers should create handles.
    pub fn new(id: u64, size: u32, alignment: u32, heap: Heap) -> Self {
        Self { id, size, alignment, heap }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn alignment(&self) -> u32 {
        self.alignment
    }

    pub fn heap(&self) -> Heap {
        self.heap
    }
}

pub type SharedMemory = Arc<MemoryHandle>;

/// Physical memory manager.
///
/// `read` and `write` stand in for a map / copy / unmap sequence.
pub trait MemoryManager: Send + Sync {
    /// Allocates `size` bytes from the first heap of `heaps` that can satisfy the request.
    fn allocate(
        &self,
        heaps: &[Heap],
        alignment: u32,
        coherency: Coherency,
        size: u32,
    ) -> Result<MemoryHandle, MemoryError>;

    /// Returns the device address of `handle`.
    fn pin(&self, handle: &MemoryHandle) -> Result<u64, MemoryError>;

    fn write(&self, handle: &MemoryHandle, offset: usize, data: &[u8]) -> Result<(), MemoryError>;

    fn read(&self, handle: &MemoryHandle, offset: usize, data: &mut [u8])
        -> Result<(), MemoryError>;

    fn free(&self, handle: MemoryHandle);
}

/// Drops one reference to `shared`, returning the handle to `memory` if it was the last one.
pub fn release(memory: &dyn MemoryManager, shared: SharedMemory) {
    if let Some(handle) = Arc::into_inner(shared) {
        log::debug!("Freeing memory handle {} ({} bytes)", handle.id(), handle.size());
        memory.free(handle);
    }
}
