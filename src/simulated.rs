// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host-side implementations of the hardware collaborators.
//!
//! These let the buffer manager run without Tegra hardware: memory comes from anonymous mappings,
//! the 2D engine is a few lines of arithmetic and the hardware blocks answer from their own event
//! threads, like the real ones do.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::thread;

use nix::libc;
use nix::sys::mman::mmap_anonymous;
use nix::sys::mman::munmap;
use nix::sys::mman::MapFlags;
use nix::sys::mman::ProtFlags;

use crate::align_up;
use crate::buffer::BufferConfiguration;
use crate::buffer::BufferRequirement;
use crate::buffer::Rect;
use crate::format::MemoryLayout;
use crate::format::SurfaceDescription;
use crate::hardware::BufferParams;
use crate::hardware::HardwareBlock;
use crate::hardware::HardwareError;
use crate::hardware::StreamEvent;
use crate::hardware::SurfaceEngine;
use crate::hardware::TransferMessage;
use crate::memory::Coherency;
use crate::memory::Heap;
use crate::memory::MemoryError;
use crate::memory::MemoryHandle;
use crate::memory::MemoryManager;
use crate::stream::StreamIndex;
use crate::sync::PipelineSync;

/// Anonymous mapping backing one allocation. Accesses are bounds-checked against `size`.
struct HostMapping {
    addr: NonNull<libc::c_void>,
    len: usize,
    /// Offset of the aligned allocation inside the mapping.
    start: usize,
    size: usize,
}

// SAFETY: The mapping is plain memory owned by this struct and only accessed under the manager's
// lock.
unsafe impl Send for HostMapping {}

impl HostMapping {
    fn new(size: u32, alignment: u32) -> Result<Self, MemoryError> {
        let size = size as usize;
        let alignment = alignment.max(1) as usize;
        // mmap only guarantees page alignment, so leave room to align the start ourselves.
        let len = NonZeroUsize::new(size + alignment - 1)
            .ok_or(MemoryError::Exhausted { size: 0, alignment: alignment as u32 })?;

        // SAFETY: A new private anonymous mapping does not alias any existing memory.
        let addr = unsafe {
            mmap_anonymous(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE,
            )
        }
        .map_err(MemoryError::Map)?;

        let base = addr.as_ptr() as usize;
        let start = base.next_multiple_of(alignment) - base;

        Ok(Self { addr, len: len.get(), start, size })
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<(), MemoryError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(MemoryError::OutOfBounds),
        }
    }

    fn ptr(&self, offset: usize) -> *mut u8 {
        // SAFETY: `start + offset` stays inside the mapping for any offset that passed
        // `check_range`, and `start` itself is below `len`.
        unsafe { (self.addr.as_ptr() as *mut u8).add(self.start + offset) }
    }
}

impl Drop for HostMapping {
    fn drop(&mut self) {
        // SAFETY: `addr` and `len` describe the mapping created in `new`, which nothing else
        // unmaps. No pointer into it outlives the manager's lock.
        if let Err(err) = unsafe { munmap(self.addr, self.len) } {
            log::error!("Failed to unmap host allocation: {}", err);
        }
    }
}

/// Memory manager backed by anonymous mappings of the current process.
pub struct HostMemoryManager {
    next_id: AtomicU64,
    mappings: Mutex<BTreeMap<u64, HostMapping>>,
    available_heaps: Vec<Heap>,
    /// Number of allocations after which every further allocation fails.
    fail_after: Option<u64>,
}

impl HostMemoryManager {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            mappings: Default::default(),
            available_heaps: vec![
                Heap::CameraReserved,
                Heap::ExternalCarveout,
                Heap::External,
                Heap::System,
            ],
            fail_after: None,
        }
    }

    /// A manager that only serves allocations from `heaps`.
    pub fn with_heaps(heaps: &[Heap]) -> Self {
        Self { available_heaps: heaps.to_vec(), ..Self::new() }
    }

    /// A manager that runs out of memory after `count` successful allocations.
    pub fn failing_after(count: u64) -> Self {
        Self { fail_after: Some(count), ..Self::new() }
    }

    /// Number of allocations not freed yet.
    pub fn num_live_allocations(&self) -> usize {
        self.mappings.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Number of allocations ever made.
    pub fn num_allocations(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst) - 1
    }

    fn with_mapping<T>(
        &self,
        handle: &MemoryHandle,
        f: impl FnOnce(&HostMapping) -> Result<T, MemoryError>,
    ) -> Result<T, MemoryError> {
        let mappings = self.mappings.lock().unwrap_or_else(PoisonError::into_inner);
        let mapping = mappings.get(&handle.id()).ok_or(MemoryError::UnknownHandle(handle.id()))?;
        f(mapping)
    }
}

impl Default for HostMemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryManager for HostMemoryManager {
    fn allocate(
        &self,
        heaps: &[Heap],
        alignment: u32,
        _coherency: Coherency,
        size: u32,
    ) -> Result<MemoryHandle, MemoryError> {
        let exhausted = MemoryError::Exhausted { size, alignment };
        let heap = heaps
            .iter()
            .copied()
            .find(|heap| self.available_heaps.contains(heap))
            .ok_or(exhausted)?;

        if let Some(limit) = self.fail_after {
            if self.num_allocations() >= limit {
                return Err(MemoryError::Exhausted { size, alignment });
            }
        }

        let mapping = HostMapping::new(size, alignment)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.mappings.lock().unwrap_or_else(PoisonError::into_inner).insert(id, mapping);

        Ok(MemoryHandle::new(id, size, alignment, heap))
    }

    fn pin(&self, handle: &MemoryHandle) -> Result<u64, MemoryError> {
        self.with_mapping(handle, |mapping| Ok(mapping.ptr(0) as u64))
    }

    fn write(&self, handle: &MemoryHandle, offset: usize, data: &[u8]) -> Result<(), MemoryError> {
        self.with_mapping(handle, |mapping| {
            mapping.check_range(offset, data.len())?;
            // SAFETY: The destination range was checked above and `data` is a separate borrow.
            unsafe {
                std::ptr::copy_nonoverlapping(data.as_ptr(), mapping.ptr(offset), data.len())
            };
            Ok(())
        })
    }

    fn read(
        &self,
        handle: &MemoryHandle,
        offset: usize,
        data: &mut [u8],
    ) -> Result<(), MemoryError> {
        self.with_mapping(handle, |mapping| {
            mapping.check_range(offset, data.len())?;
            // SAFETY: The source range was checked above and `data` is a separate borrow.
            unsafe {
                std::ptr::copy_nonoverlapping(mapping.ptr(offset), data.as_mut_ptr(), data.len())
            };
            Ok(())
        })
    }

    fn free(&self, handle: MemoryHandle) {
        let mut mappings = self.mappings.lock().unwrap_or_else(PoisonError::into_inner);
        let removed = mappings.remove(&handle.id());
        if removed.is_none() {
            log::error!("Freeing unknown memory handle {}", handle.id());
        }
    }
}

const PITCH_LINEAR_PITCH_ALIGN: u32 = 32;
const PITCH_LINEAR_ALIGN: u32 = 256;
const TILE_WIDTH: u32 = 16;
const TILE_HEIGHT: u32 = 16;
const TILED_PITCH_ALIGN: u32 = 256;
const GOB_WIDTH: u32 = 64;
const GOB_HEIGHT: u32 = 8;
const TILED_ALIGN: u32 = 4096;

/// A 2D engine that computes geometry in software and writes surfaces as pitch-linear memory.
#[derive(Debug, Default)]
pub struct SoftwareSurfaceEngine;

impl SoftwareSurfaceEngine {
    fn rows(surface: &SurfaceDescription) -> u32 {
        match surface.layout {
            MemoryLayout::Pitch => surface.height,
            MemoryLayout::Tiled => align_up(surface.height, TILE_HEIGHT),
            MemoryLayout::BlockLinear => {
                align_up(surface.height, GOB_HEIGHT << surface.block_height_log2)
            }
        }
    }

    fn pitch_of(&self, surface: &SurfaceDescription) -> u32 {
        if surface.pitch != 0 {
            surface.pitch
        } else {
            self.compute_pitch(surface)
        }
    }
}

impl SurfaceEngine for SoftwareSurfaceEngine {
    fn compute_alignment(&self, surface: &SurfaceDescription) -> u32 {
        match surface.layout {
            MemoryLayout::Pitch => PITCH_LINEAR_ALIGN,
            MemoryLayout::Tiled | MemoryLayout::BlockLinear => TILED_ALIGN,
        }
    }

    fn compute_pitch(&self, surface: &SurfaceDescription) -> u32 {
        let bytes = surface.width.saturating_mul(surface.color_format.bytes_per_pixel());
        match surface.layout {
            MemoryLayout::Pitch => align_up(bytes, PITCH_LINEAR_PITCH_ALIGN),
            MemoryLayout::Tiled => align_up(align_up(bytes, TILE_WIDTH), TILED_PITCH_ALIGN),
            MemoryLayout::BlockLinear => align_up(bytes, GOB_WIDTH),
        }
    }

    fn compute_size(&self, surface: &SurfaceDescription) -> u32 {
        self.pitch_of(surface).saturating_mul(Self::rows(surface))
    }

    fn compute_buffer_params(&self, surface: &SurfaceDescription) -> BufferParams {
        let pitch = self.pitch_of(surface);
        BufferParams {
            use_system_memory: false,
            alignment: self.compute_alignment(surface),
            pitch,
            size: pitch.saturating_mul(Self::rows(surface)),
        }
    }

    fn fill(
        &self,
        memory: &dyn MemoryManager,
        surface: &SurfaceDescription,
        handle: &MemoryHandle,
        offset: u32,
        rect: Rect,
        value: u8,
    ) -> Result<(), MemoryError> {
        let bpp = surface.color_format.bytes_per_pixel() as usize;
        let pitch = self.pitch_of(surface) as usize;
        let row = vec![value; rect.width() as usize * bpp];

        for y in rect.top..rect.bottom {
            let start = offset as usize + y as usize * pitch + rect.left as usize * bpp;
            memory.write(handle, start, &row)?;
        }

        Ok(())
    }
}

/// A call received by a [`SimulatedBlock`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlockCall {
    SetBufferAllocator(StreamIndex, bool),
    Event(StreamIndex, StreamEvent),
    Payload { stream: StreamIndex, num_planes: usize },
    Abort(StreamIndex),
}

/// A hardware block that records what it is told and completes configurations and aborts from
/// its own event thread.
pub struct SimulatedBlock {
    sync: Arc<PipelineSync>,
    calls: Mutex<Vec<BlockCall>>,
    responsive: AtomicBool,
    /// Configuration the block reports instead of echoing the proposed one.
    overrides: Mutex<BTreeMap<StreamIndex, BufferConfiguration>>,
    /// Configuration and requirement announced when the manager becomes the allocator of a
    /// stream, as the camera block does.
    announcements: Mutex<BTreeMap<StreamIndex, (BufferConfiguration, BufferRequirement)>>,
    failures: Mutex<BTreeMap<StreamIndex, HardwareError>>,
}

impl SimulatedBlock {
    pub fn new(sync: Arc<PipelineSync>) -> Self {
        Self {
            sync,
            calls: Default::default(),
            responsive: AtomicBool::new(true),
            overrides: Default::default(),
            announcements: Default::default(),
            failures: Default::default(),
        }
    }

    /// When not responsive, the block never signals completion.
    pub fn set_responsive(&self, responsive: bool) {
        self.responsive.store(responsive, Ordering::SeqCst);
    }

    pub fn override_configuration(&self, stream: StreamIndex, configuration: BufferConfiguration) {
        lock(&self.overrides).insert(stream, configuration);
    }

    pub fn announce(
        &self,
        stream: StreamIndex,
        configuration: BufferConfiguration,
        requirement: BufferRequirement,
    ) {
        lock(&self.announcements).insert(stream, (configuration, requirement));
    }

    /// Makes every call on `stream` fail with `error`.
    pub fn fail_on(&self, stream: StreamIndex, error: HardwareError) {
        lock(&self.failures).insert(stream, error);
    }

    pub fn calls(&self) -> Vec<BlockCall> {
        lock(&self.calls).clone()
    }

    fn check(&self, stream: StreamIndex) -> Result<(), HardwareError> {
        match lock(&self.failures).get(&stream) {
            Some(err) => Err(*err),
            None => Ok(()),
        }
    }

    fn record(&self, call: BlockCall) {
        lock(&self.calls).push(call);
    }

    /// Runs `f` on the block's event thread, unless the block is unresponsive.
    fn post(&self, f: impl FnOnce(&PipelineSync) + Send + 'static) {
        if !self.responsive.load(Ordering::SeqCst) {
            return;
        }
        let sync = Arc::clone(&self.sync);
        thread::spawn(move || f(&sync));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl HardwareBlock for SimulatedBlock {
    fn set_buffer_allocator(
        &self,
        stream: StreamIndex,
        enabled: bool,
    ) -> Result<(), HardwareError> {
        self.check(stream)?;
        self.record(BlockCall::SetBufferAllocator(stream, enabled));

        if enabled {
            let announced = lock(&self.announcements).get(&stream).cloned();
            if let Some((configuration, requirement)) = announced {
                self.post(move |sync| {
                    sync.complete_configuration(stream, Some(configuration), Some(requirement))
                });
            }
        }

        Ok(())
    }

    fn transfer_buffer(
        &self,
        stream: StreamIndex,
        message: TransferMessage<'_>,
    ) -> Result<(), HardwareError> {
        self.check(stream)?;

        match message {
            TransferMessage::StreamEvent(event) => {
                if let StreamEvent::BufferConfiguration(proposed) = &event {
                    let configuration = lock(&self.overrides)
                        .get(&stream)
                        .cloned()
                        .unwrap_or_else(|| proposed.clone());
                    self.post(move |sync| {
                        sync.complete_configuration(stream, Some(configuration), None)
                    });
                }
                self.record(BlockCall::Event(stream, event));
            }
            TransferMessage::Payload(buffer) => {
                self.record(BlockCall::Payload { stream, num_planes: buffer.num_planes() });
            }
        }

        Ok(())
    }

    fn abort_buffers(&self, stream: StreamIndex) -> Result<(), HardwareError> {
        self.check(stream)?;
        self.record(BlockCall::Abort(stream));
        self.post(move |sync| sync.complete_abort(stream));

        Ok(())
    }
}
