// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Surface geometry and physical memory of buffer planes.

use std::sync::Arc;

use crate::align_up;
use crate::checked_align_up;
use crate::allocator::BufferAllocator;
use crate::buffer::NativeBuffer;
use crate::buffer::Plane;
use crate::buffer::Rect;
use crate::format::SurfaceDescription;
use crate::format::SurfaceRestrictions;
use crate::format::Y_PLANE;
use crate::memory;
use crate::memory::Coherency;
use crate::memory::MemoryError;
use crate::memory::MemoryHandle;
use crate::memory::SURFACE_HEAPS;
use crate::stream::StreamIndex;

/// Minimum alignment of still capture surfaces.
const STILL_MIN_ALIGNMENT: u32 = 1024;
const STILL_PITCH_ALIGNMENT: u32 = 64;
const STILL_ROW_ALIGNMENT: u32 = 16;
const RESTRICTED_ALIGNMENT: u32 = 16;

/// Near black.
const LUMA_PAD_VALUE: u8 = 0x10;
/// Neutral chroma.
const CHROMA_PAD_VALUE: u8 = 0x80;

/// Memory needed by one plane.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub(super) struct PlaneLayout {
    pub alignment: u32,
    pub size: u32,
    /// Rows allocated past the logical height of the plane.
    pub pad_rows: u32,
}

fn has_subsampled_chroma(planes: &[Plane]) -> bool {
    matches!(planes.len(), 2 | 3)
}

/// Rounds the dimensions of plane 0 up to 16 as `restrictions` require. Chroma planes follow at
/// half size.
pub(super) fn align_zoom_planes(planes: &mut [Plane], restrictions: SurfaceRestrictions) {
    let subsampled = has_subsampled_chroma(planes);
    let Some((luma, chroma)) = planes.split_first_mut() else {
        return;
    };

    if restrictions.contains(SurfaceRestrictions::WIDTH_16_ALIGN) {
        luma.surface.width = align_up(luma.surface.width, RESTRICTED_ALIGNMENT);
        if subsampled {
            for plane in chroma.iter_mut() {
                plane.surface.width = luma.surface.width / 2;
            }
        }
    }

    if restrictions.contains(SurfaceRestrictions::HEIGHT_16_ALIGN) {
        luma.surface.height = align_up(luma.surface.height, RESTRICTED_ALIGNMENT);
        if subsampled {
            for plane in chroma.iter_mut() {
                plane.surface.height = luma.surface.height / 2;
            }
        }
    }
}

impl BufferAllocator {
    /// Computes the pitch of a zoom output plane and the memory it needs.
    ///
    /// The size covers the surface rotated by 90 degrees as well, so that the same buffers remain
    /// usable if the image is rotated later.
    pub(super) fn layout_zoom_plane(
        &self,
        surface: &mut SurfaceDescription,
        byte_alignment: u32,
    ) -> PlaneLayout {
        let alignment = match byte_alignment {
            0 => self.engine.compute_alignment(surface),
            alignment => alignment,
        };

        surface.pitch = self.engine.compute_pitch(surface);
        let mut rotated = surface.transposed();
        rotated.pitch = self.engine.compute_pitch(&rotated);

        let size = self.engine.compute_size(surface).max(self.engine.compute_size(&rotated));

        PlaneLayout { alignment, size, pad_rows: 0 }
    }

    /// Computes the pitch of a capture output plane and the memory it needs.
    ///
    /// Still captures get stricter alignment and their height padded to a multiple of 16 rows.
    /// The 2D engine's own requirements are honored on top of that.
    pub(super) fn layout_camera_plane(
        &self,
        surface: &mut SurfaceDescription,
        still_alignment: bool,
    ) -> PlaneLayout {
        let mut alignment = self.engine.compute_alignment(surface);
        surface.pitch = self.engine.compute_pitch(surface);
        let mut pad_rows = 0;

        if still_alignment {
            alignment = alignment.max(STILL_MIN_ALIGNMENT);
            surface.pitch = align_up(surface.pitch, STILL_PITCH_ALIGNMENT);
            pad_rows = align_up(surface.height, STILL_ROW_ALIGNMENT) - surface.height;
        }

        // The engine works out its own pitch for the padded surface.
        let mut padded = SurfaceDescription {
            height: surface.height.saturating_add(pad_rows),
            pitch: 0,
            ..surface.clone()
        };
        let params = self.engine.compute_buffer_params(&padded);
        surface.pitch = surface.pitch.max(params.pitch);
        padded.pitch = surface.pitch;

        PlaneLayout {
            alignment: alignment.max(params.alignment),
            size: self.engine.compute_size(&padded).max(params.size),
            pad_rows,
        }
    }

    /// Attaches memory to every plane, either one allocation per plane or a single allocation
    /// holding all of them. Nothing stays allocated on failure.
    pub(super) fn allocate_surfaces(
        &self,
        stream: StreamIndex,
        planes: &mut [Plane],
        layouts: &[PlaneLayout],
        contiguous: bool,
    ) -> Result<(), MemoryError> {
        if contiguous {
            return self.allocate_contiguous_surfaces(stream, planes, layouts);
        }

        for i in 0..planes.len() {
            let layout = layouts[i];
            let handle = match self.allocate_surface_memory(layout.alignment, layout.size) {
                Ok(handle) => handle,
                Err(err) => {
                    self.release_surfaces(&mut planes[..i]);
                    return Err(err);
                }
            };
            self.log_allocation(stream, i, &handle);

            let plane = &mut planes[i];
            plane.offset = 0;
            plane.size = layout.size;
            plane.memory = Some(Arc::new(handle));
        }

        Ok(())
    }

    fn allocate_contiguous_surfaces(
        &self,
        stream: StreamIndex,
        planes: &mut [Plane],
        layouts: &[PlaneLayout],
    ) -> Result<(), MemoryError> {
        let alignment = layouts.iter().map(|l| l.alignment).max().unwrap_or(1);
        let mut offsets = Vec::with_capacity(layouts.len());
        let mut total: u32 = 0;
        for layout in layouts {
            let offset = checked_align_up(total, layout.alignment)
                .ok_or(MemoryError::Exhausted { size: u32::MAX, alignment })?;
            offsets.push(offset);
            total = offset
                .checked_add(layout.size)
                .ok_or(MemoryError::Exhausted { size: u32::MAX, alignment })?;
        }

        let handle = self.allocate_surface_memory(alignment, total)?;
        self.log_allocation(stream, Y_PLANE, &handle);

        let shared = Arc::new(handle);
        for ((plane, layout), offset) in planes.iter_mut().zip(layouts).zip(offsets) {
            plane.offset = offset;
            plane.size = layout.size;
            plane.memory = Some(Arc::clone(&shared));
        }

        Ok(())
    }

    fn allocate_surface_memory(
        &self,
        alignment: u32,
        size: u32,
    ) -> Result<MemoryHandle, MemoryError> {
        self.memory.allocate(&SURFACE_HEAPS, alignment, Coherency::WriteCombine, size)
    }

    fn log_allocation(&self, stream: StreamIndex, plane: usize, handle: &MemoryHandle) {
        if self.config.mem_profile_print {
            log::info!(
                "{:?} plane {}: {} bytes aligned to {} from {:?}",
                stream,
                plane,
                handle.size(),
                handle.alignment(),
                handle.heap()
            );
        }
    }

    /// Detaches the memory of every plane, freeing allocations whose last owner goes away.
    pub(super) fn release_surfaces(&self, planes: &mut [Plane]) {
        for plane in planes {
            if let Some(shared) = plane.memory.take() {
                memory::release(self.memory.as_ref(), shared);
            }
        }
    }

    /// Clears rows `first..last` of `plane`, seen through `surface`.
    fn fill_rows(
        &self,
        surface: &SurfaceDescription,
        plane: &Plane,
        first: u32,
        last: u32,
    ) -> Result<(), MemoryError> {
        let Some(memory) = &plane.memory else {
            return Ok(());
        };
        let value = if surface.color_format.is_luma() { LUMA_PAD_VALUE } else { CHROMA_PAD_VALUE };

        self.engine.fill(
            self.memory.as_ref(),
            surface,
            memory,
            plane.offset,
            Rect::new(0, first, surface.width, last),
            value,
        )
    }

    /// Clears the rows added below the crop rectangle by alignment, so the encoder does not see
    /// garbage there.
    pub(super) fn fill_crop_padding(&self, buffer: &NativeBuffer) -> Result<(), MemoryError> {
        let subsampled = has_subsampled_chroma(&buffer.planes);

        for (i, plane) in buffer.planes.iter().enumerate() {
            let visible = match i {
                Y_PLANE => buffer.crop.bottom,
                _ if subsampled => buffer.crop.bottom / 2,
                _ => buffer.crop.bottom,
            };
            if plane.surface.height > visible {
                self.fill_rows(&plane.surface, plane, visible, plane.surface.height)?;
            }
        }

        Ok(())
    }

    /// Clears the padding rows of still capture planes.
    pub(super) fn fill_camera_padding(
        &self,
        planes: &[Plane],
        layouts: &[PlaneLayout],
    ) -> Result<(), MemoryError> {
        for (plane, layout) in planes.iter().zip(layouts) {
            if layout.pad_rows == 0 {
                continue;
            }

            // The engine only reaches the padding through the padded height. The plane itself
            // keeps its logical height.
            let padded = SurfaceDescription {
                height: plane.surface.height.saturating_add(layout.pad_rows),
                ..plane.surface.clone()
            };
            self.fill_rows(&padded, plane, plane.surface.height, padded.height)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::tests::allocator;
    use crate::allocator::AllocatorConfig;
    use crate::format::ColorFormat;
    use crate::format::MemoryLayout;
    use crate::format::VideoFormat;
    use crate::hardware::BufferParams;
    use crate::hardware::SurfaceEngine;
    use crate::memory::MemoryManager;
    use crate::platform::Platform;
    use crate::simulated::HostMemoryManager;
    use crate::simulated::SoftwareSurfaceEngine;

    /// Asks for a 512 byte pitch in its buffer parameters unless the surface already has one.
    struct WidePitchEngine;

    impl SurfaceEngine for WidePitchEngine {
        fn compute_alignment(&self, surface: &SurfaceDescription) -> u32 {
            SoftwareSurfaceEngine.compute_alignment(surface)
        }

        fn compute_pitch(&self, surface: &SurfaceDescription) -> u32 {
            SoftwareSurfaceEngine.compute_pitch(surface)
        }

        fn compute_size(&self, surface: &SurfaceDescription) -> u32 {
            SoftwareSurfaceEngine.compute_size(surface)
        }

        fn compute_buffer_params(&self, surface: &SurfaceDescription) -> BufferParams {
            let pitch = match surface.pitch {
                0 => align_up(surface.width, 512),
                pitch => pitch,
            };
            BufferParams {
                use_system_memory: false,
                alignment: 256,
                pitch,
                size: pitch * surface.height,
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
            SoftwareSurfaceEngine.fill(memory, surface, handle, offset, rect, value)
        }
    }

    fn planes(width: u32, height: u32) -> Vec<Plane> {
        let mut format = VideoFormat::yuv420();
        format.set_resolution(width, height);
        NativeBuffer::from_format(&format).planes
    }

    #[test]
    fn alignment_follows_restrictions() {
        let mut p = planes(1921, 1081);
        align_zoom_planes(&mut p, SurfaceRestrictions::WIDTH_16_ALIGN);
        assert_eq!((p[0].surface.width, p[0].surface.height), (1936, 1081));
        assert_eq!((p[1].surface.width, p[1].surface.height), (968, 540));
        assert_eq!((p[2].surface.width, p[2].surface.height), (968, 540));

        align_zoom_planes(&mut p, SurfaceRestrictions::HEIGHT_16_ALIGN);
        assert_eq!(p[0].surface.height, 1088);
        assert_eq!(p[2].surface.height, 544);
    }

    #[test]
    fn single_plane_alignment_leaves_no_chroma() {
        let mut p = vec![Plane {
            surface: SurfaceDescription::new(641, 479, ColorFormat::Y8),
            ..Default::default()
        }];
        let restrictions =
            SurfaceRestrictions::WIDTH_16_ALIGN | SurfaceRestrictions::HEIGHT_16_ALIGN;
        align_zoom_planes(&mut p, restrictions);
        assert_eq!(p[0].surface.resolution(), crate::Resolution { width: 656, height: 480 });
    }

    #[test]
    fn zoom_layout_uses_requested_alignment() {
        let (allocator, _memory) = allocator();
        let mut surface = SurfaceDescription::new(640, 480, ColorFormat::Y8);

        assert_eq!(allocator.layout_zoom_plane(&mut surface, 0).alignment, 256);
        assert_eq!(allocator.layout_zoom_plane(&mut surface, 4096).alignment, 4096);
        assert_eq!(surface.pitch, 640);
    }

    #[test]
    fn camera_layout_honors_engine_minimums() {
        let (allocator, _memory) = allocator();
        let mut surface = SurfaceDescription::new(100, 50, ColorFormat::Y8);
        surface.layout = MemoryLayout::Tiled;

        let layout = allocator.layout_camera_plane(&mut surface, true);
        assert_eq!(layout.alignment, 4096);
        assert_eq!(surface.pitch, 256);
        assert_eq!(layout.pad_rows, 14);
        assert_eq!(layout.size, 256 * 64);
        assert_eq!(surface.height, 50);
    }

    #[test]
    fn camera_layout_queries_engine_pitch() {
        let allocator = BufferAllocator::new(
            AllocatorConfig { platform: Platform::default(), mem_profile_print: false },
            Arc::new(HostMemoryManager::new()),
            Arc::new(WidePitchEngine),
        );
        let mut surface = SurfaceDescription::new(100, 50, ColorFormat::Y8);

        let layout = allocator.layout_camera_plane(&mut surface, true);
        assert_eq!(surface.pitch, 512);
        assert_eq!(layout.pad_rows, 14);
        assert_eq!(layout.size, 512 * 64);
        assert_eq!(layout.alignment, STILL_MIN_ALIGNMENT);
    }
}
