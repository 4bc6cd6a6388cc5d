// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Turns an agreed [`BufferConfiguration`] into [`NativeBuffer`]s backed by physical memory.
//!
//! Capture-stage buffers always own their surfaces and carry two metadata blocks. Zoom-stage
//! buffers own their surfaces unless the platform says they come from the window system, in which
//! case only their geometry is filled in here.
//!
//! Calls on one allocator are not internally serialized: callers must not use the same instance
//! from several threads at once.

mod repurpose;
mod surfaces;

use std::sync::Arc;

use crate::buffer::BufferConfiguration;
use crate::buffer::CaptureMetadata;
use crate::buffer::NativeBuffer;
use crate::buffer::Rect;
use crate::format::SurfaceRestrictions;
use crate::format::Y_PLANE;
use crate::hardware::SurfaceEngine;
use crate::memory;
use crate::memory::Coherency;
use crate::memory::MemoryError;
use crate::memory::MemoryManager;
use crate::memory::METADATA_HEAPS;
use crate::platform::Platform;
use crate::properties;
use crate::properties::PropertyStore;
use crate::stream::camera_output_stream;
use crate::stream::zoom_port;
use crate::stream::CameraStream;
use crate::stream::StreamIndex;
use crate::stream::ZoomPort;
use crate::Component;
use crate::Error;
use crate::OutputLocation;
use crate::Result;

use surfaces::align_zoom_planes;
use surfaces::PlaneLayout;

/// Size of the EXIF block attached to capture buffers.
pub const EXIF_INFO_SIZE: u32 = 4 * 1024;
/// Size of the maker note extension attached to capture buffers.
pub const MAKER_NOTE_SIZE: u32 = 64 * 1024;
const METADATA_ALIGNMENT: u32 = 4;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct AllocatorConfig {
    pub platform: Platform,
    /// Log every plane allocation at info level.
    pub mem_profile_print: bool,
}

impl AllocatorConfig {
    pub fn new(platform: Platform, properties: &dyn PropertyStore) -> Self {
        Self { platform, mem_profile_print: properties::memory_profile_enabled(properties) }
    }
}

/// Where a buffer goes, resolved from an [`OutputLocation`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Target {
    Camera(CameraStream),
    Zoom(ZoomPort),
    Host,
}

pub struct BufferAllocator {
    config: AllocatorConfig,
    memory: Arc<dyn MemoryManager>,
    engine: Arc<dyn SurfaceEngine>,
}

impl BufferAllocator {
    pub fn new(
        config: AllocatorConfig,
        memory: Arc<dyn MemoryManager>,
        engine: Arc<dyn SurfaceEngine>,
    ) -> Self {
        Self { config, memory, engine }
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    fn target(&self, location: OutputLocation) -> Target {
        match location.component {
            Component::Capture => Target::Camera(camera_output_stream(
                location.port,
                self.config.platform.usb_camera,
            )),
            Component::Zoom => Target::Zoom(zoom_port(location.port)),
            Component::Host => Target::Host,
        }
    }

    /// Allocates one buffer for `location` according to `config`.
    ///
    /// Returns `Ok(None)` for locations this allocator does not serve.
    pub fn allocate_buffer(
        &self,
        location: OutputLocation,
        config: &BufferConfiguration,
    ) -> Result<Option<NativeBuffer>> {
        let buffer = match self.target(location) {
            Target::Camera(stream) => self.initialize_camera_output_buffer(stream, config, true)?,
            Target::Zoom(port) if self.config.platform.zoom_buffers_external(port) => {
                log::debug!("Zoom {:?} buffers are provided externally, no memory attached", port);
                descriptor(config)?
            }
            Target::Zoom(port) => self.initialize_zoom_output_buffer(port, config, true)?,
            Target::Host => {
                log::debug!("No buffer to allocate for {:?}", location);
                return Ok(None);
            }
        };

        Ok(Some(buffer))
    }

    /// Releases the memory owned by `buffer` and drops it.
    pub fn free_buffer(&self, location: OutputLocation, mut buffer: NativeBuffer) {
        match self.target(location) {
            Target::Camera(_) => self.cleanup_camera_buffer(buffer),
            Target::Zoom(port) if self.config.platform.zoom_buffers_owned_on_free(port) => {
                self.release_surfaces(&mut buffer.planes)
            }
            Target::Zoom(port) => {
                log::debug!("Zoom {:?} buffer memory is owned externally", port)
            }
            Target::Host => log::debug!("No buffer to free for {:?}", location),
        }
    }

    /// Builds a zoom output buffer, allocating and initializing its surfaces if `allocate` is set.
    pub fn initialize_zoom_output_buffer(
        &self,
        port: ZoomPort,
        config: &BufferConfiguration,
        allocate: bool,
    ) -> Result<NativeBuffer> {
        let stream = StreamIndex::Zoom(port.into());
        let (mut buffer, layouts) = self.describe_zoom_buffer(port, config)?;
        if !allocate {
            return Ok(buffer);
        }

        if let Err(err) = self.allocate_surfaces(stream, &mut buffer.planes, &layouts, false) {
            log::error!("Failed to allocate surfaces for {:?}: {}", stream, err);
            return Err(Error::InsufficientMemory);
        }

        if !buffer.crop.is_empty() {
            if let Err(err) = self.fill_crop_padding(&buffer) {
                log::error!("Failed to clear padding of {:?}: {}", stream, err);
                self.release_surfaces(&mut buffer.planes);
                return Err(Error::InsufficientMemory);
            }
        }

        Ok(buffer)
    }

    /// Builds a capture output buffer, allocating its surfaces and metadata blocks if `allocate`
    /// is set.
    pub fn initialize_camera_output_buffer(
        &self,
        stream: CameraStream,
        config: &BufferConfiguration,
        allocate: bool,
    ) -> Result<NativeBuffer> {
        let (mut buffer, layouts) = self.describe_camera_buffer(stream, config)?;
        if !allocate {
            return Ok(buffer);
        }

        let result = self
            .allocate_surfaces(
                stream.into(),
                &mut buffer.planes,
                &layouts,
                config.physically_contiguous,
            )
            .and_then(|()| self.fill_camera_padding(&buffer.planes, &layouts))
            .and_then(|()| self.allocate_capture_metadata(&mut buffer));

        if let Err(err) = result {
            log::error!("Failed to allocate capture buffer for {:?}: {}", stream, err);
            self.cleanup_camera_buffer(buffer);
            return Err(Error::InsufficientMemory);
        }

        Ok(buffer)
    }

    /// Zoom buffer geometry: restriction alignment applied, pitches and sizes computed.
    fn describe_zoom_buffer(
        &self,
        port: ZoomPort,
        config: &BufferConfiguration,
    ) -> Result<(NativeBuffer, Vec<PlaneLayout>)> {
        let mut buffer = descriptor(config)?;
        let restrictions = config.format.restrictions;

        // The crop keeps the size before alignment.
        if port == ZoomPort::Video && restrictions.contains(SurfaceRestrictions::NEEDS_CROP) {
            let luma = &buffer.planes[Y_PLANE].surface;
            buffer.crop = Rect::new(0, 0, luma.width, luma.height);
        }

        align_zoom_planes(&mut buffer.planes, restrictions);

        let layouts = buffer
            .planes
            .iter_mut()
            .map(|plane| self.layout_zoom_plane(&mut plane.surface, config.byte_alignment))
            .collect();

        Ok((buffer, layouts))
    }

    fn describe_camera_buffer(
        &self,
        stream: CameraStream,
        config: &BufferConfiguration,
    ) -> Result<(NativeBuffer, Vec<PlaneLayout>)> {
        let mut buffer = descriptor(config)?;
        let still_alignment = stream == CameraStream::Output;

        let layouts = buffer
            .planes
            .iter_mut()
            .map(|plane| self.layout_camera_plane(&mut plane.surface, still_alignment))
            .collect();

        Ok((buffer, layouts))
    }

    fn allocate_capture_metadata(
        &self,
        buffer: &mut NativeBuffer,
    ) -> std::result::Result<(), MemoryError> {
        let metadata = buffer.metadata.insert(CaptureMetadata::default());

        let exif = self.memory.allocate(
            &METADATA_HEAPS,
            METADATA_ALIGNMENT,
            Coherency::Cached,
            EXIF_INFO_SIZE,
        )?;
        metadata.exif = Some(Arc::new(exif));

        let maker_note = self.memory.allocate(
            &METADATA_HEAPS,
            METADATA_ALIGNMENT,
            Coherency::Cached,
            MAKER_NOTE_SIZE,
        )?;
        metadata.maker_note = Some(Arc::new(maker_note));

        Ok(())
    }

    fn cleanup_camera_buffer(&self, mut buffer: NativeBuffer) {
        self.release_surfaces(&mut buffer.planes);

        if let Some(metadata) = buffer.metadata.take() {
            for block in [metadata.exif, metadata.maker_note].into_iter().flatten() {
                memory::release(self.memory.as_ref(), block);
            }
        }
    }
}

/// A buffer whose planes mirror `config`'s format, with no memory attached.
fn descriptor(config: &BufferConfiguration) -> Result<NativeBuffer> {
    if config.format.planes.is_empty() {
        return Err(Error::BadParameter("configuration has no planes".into()));
    }

    Ok(NativeBuffer::from_format(&config.format))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::format::VideoFormat;
    use crate::format::U_PLANE;
    use crate::memory::Heap;
    use crate::platform::ChipFamily;
    use crate::platform::ProtocolVariant;
    use crate::simulated::HostMemoryManager;
    use crate::simulated::SoftwareSurfaceEngine;
    use crate::stream::CameraPort;
    use crate::Resolution;

    pub(super) fn allocator_with(
        platform: Platform,
        memory: HostMemoryManager,
    ) -> (BufferAllocator, Arc<HostMemoryManager>) {
        let memory = Arc::new(memory);
        let allocator = BufferAllocator::new(
            AllocatorConfig { platform, mem_profile_print: true },
            memory.clone(),
            Arc::new(SoftwareSurfaceEngine),
        );
        (allocator, memory)
    }

    pub(super) fn allocator() -> (BufferAllocator, Arc<HostMemoryManager>) {
        allocator_with(Platform::default(), HostMemoryManager::new())
    }

    pub(super) fn configuration(
        width: u32,
        height: u32,
        restrictions: SurfaceRestrictions,
    ) -> BufferConfiguration {
        let mut format = VideoFormat::yuv420();
        format.set_resolution(width, height);
        format.restrictions = restrictions;
        BufferConfiguration { num_buffers: 4, format, ..Default::default() }
    }

    fn aligned() -> SurfaceRestrictions {
        SurfaceRestrictions::WIDTH_16_ALIGN
            | SurfaceRestrictions::HEIGHT_16_ALIGN
            | SurfaceRestrictions::NEEDS_CROP
    }

    fn read_row(
        memory: &HostMemoryManager,
        buffer: &NativeBuffer,
        plane: usize,
        row: u32,
    ) -> Vec<u8> {
        let plane = &buffer.planes[plane];
        let mut data = vec![0u8; plane.surface.width as usize];
        let offset = plane.offset as usize + (row * plane.surface.pitch) as usize;
        memory.read(plane.memory.as_ref().unwrap(), offset, &mut data).unwrap();
        data
    }

    #[test]
    fn config_reads_memory_profile_property() {
        let mut store = HashMap::new();
        assert!(!AllocatorConfig::new(Platform::default(), &store).mem_profile_print);
        store.insert(properties::MEMORY_PROFILE_PROPERTY.to_string(), "1".to_string());
        assert!(AllocatorConfig::new(Platform::default(), &store).mem_profile_print);
    }

    #[test]
    fn host_component_allocates_nothing() {
        let (allocator, memory) = allocator();
        let location = OutputLocation::new(Component::Host, 0);
        let buffer =
            allocator.allocate_buffer(location, &configuration(640, 480, aligned())).unwrap();

        assert!(buffer.is_none());
        assert_eq!(memory.num_allocations(), 0);
    }

    #[test]
    fn still_surfaces_are_16_aligned() {
        let (allocator, memory) = allocator();
        let location = OutputLocation::new(Component::Zoom, ZoomPort::Still as u32);
        let buffer = allocator
            .allocate_buffer(location, &configuration(1921, 1081, aligned()))
            .unwrap()
            .unwrap();

        assert_eq!(buffer.num_planes(), 3);
        assert_eq!(
            buffer.planes[Y_PLANE].surface.resolution(),
            Resolution { width: 1936, height: 1088 }
        );
        for plane in &buffer.planes[1..] {
            assert_eq!(plane.surface.resolution(), Resolution { width: 968, height: 544 });
        }
        // Only the video stream is cropped.
        assert!(buffer.crop.is_empty());
        assert!(buffer.is_backed());
        assert_eq!(memory.num_live_allocations(), 3);

        allocator.free_buffer(location, buffer);
        assert_eq!(memory.num_live_allocations(), 0);
    }

    #[test]
    fn surfaces_fit_rotated_image() {
        let (allocator, _memory) = allocator();
        let location = OutputLocation::new(Component::Zoom, ZoomPort::Still as u32);
        let buffer = allocator
            .allocate_buffer(location, &configuration(1600, 1000, SurfaceRestrictions::NONE))
            .unwrap()
            .unwrap();

        let luma = &buffer.planes[Y_PLANE];
        assert_eq!(luma.surface.pitch, 1600);
        // Rotated, the 1000 pixel rows need a 1024 byte pitch.
        assert_eq!(luma.size, 1024 * 1600);
        assert!(luma.size > luma.surface.pitch * luma.surface.height);
        allocator.free_buffer(location, buffer);
    }

    #[test]
    fn video_crop_and_padding_rows() {
        let (allocator, memory) = allocator();
        let location = OutputLocation::new(Component::Zoom, ZoomPort::Video as u32);
        let buffer = allocator
            .allocate_buffer(location, &configuration(1921, 1081, aligned()))
            .unwrap()
            .unwrap();

        assert_eq!(buffer.crop, Rect::new(0, 0, 1921, 1081));
        assert_eq!(buffer.planes[Y_PLANE].surface.height, 1088);

        assert!(read_row(&memory, &buffer, Y_PLANE, 0).iter().all(|&b| b == 0));
        assert!(read_row(&memory, &buffer, Y_PLANE, 1081).iter().all(|&b| b == 0x10));
        assert!(read_row(&memory, &buffer, Y_PLANE, 1087).iter().all(|&b| b == 0x10));
        assert!(read_row(&memory, &buffer, U_PLANE, 539).iter().all(|&b| b == 0));
        assert!(read_row(&memory, &buffer, U_PLANE, 540).iter().all(|&b| b == 0x80));
        allocator.free_buffer(location, buffer);
        assert_eq!(memory.num_live_allocations(), 0);
    }

    #[test]
    fn zoom_preview_is_external() {
        let (allocator, memory) = allocator();
        let location = OutputLocation::new(Component::Zoom, ZoomPort::Preview as u32);
        let buffer = allocator
            .allocate_buffer(location, &configuration(1920, 1088, SurfaceRestrictions::NONE))
            .unwrap()
            .unwrap();

        assert_eq!(buffer.num_planes(), 3);
        assert!(buffer.planes.iter().all(|p| p.memory.is_none()));
        assert_eq!(memory.num_allocations(), 0);
        allocator.free_buffer(location, buffer);
    }

    #[test]
    fn unknown_zoom_port_is_treated_as_preview() {
        let (allocator, memory) = allocator();
        let location = OutputLocation::new(Component::Zoom, 42);
        let buffer = allocator
            .allocate_buffer(location, &configuration(640, 480, SurfaceRestrictions::NONE))
            .unwrap()
            .unwrap();

        assert!(!buffer.is_backed());
        assert_eq!(memory.num_allocations(), 0);
    }

    #[test]
    fn v3_zoom_buffers_are_external() {
        let platform = Platform::new(ProtocolVariant::V3, ChipFamily::T124);
        let (allocator, memory) = allocator_with(platform, HostMemoryManager::new());

        for port in [ZoomPort::Still, ZoomPort::Video] {
            let location = OutputLocation::new(Component::Zoom, port as u32);
            let buffer = allocator
                .allocate_buffer(location, &configuration(640, 480, aligned()))
                .unwrap()
                .unwrap();
            assert!(!buffer.is_backed());
        }
        assert_eq!(memory.num_allocations(), 0);
    }

    #[test]
    fn capture_output_gets_still_alignment_and_metadata() {
        let (allocator, memory) = allocator();
        let location = OutputLocation::new(Component::Capture, CameraPort::Capture as u32);
        let buffer = allocator
            .allocate_buffer(location, &configuration(1921, 1081, SurfaceRestrictions::NONE))
            .unwrap()
            .unwrap();

        let luma = &buffer.planes[Y_PLANE];
        assert_eq!(luma.memory.as_ref().unwrap().alignment(), 1024);
        assert_eq!(luma.surface.pitch % 64, 0);
        // Logical height is kept, the padding rows are cleared.
        assert_eq!(luma.surface.height, 1081);
        assert!(luma.size >= luma.surface.pitch * 1088);
        assert!(read_row(&memory, &buffer, Y_PLANE, 1087).iter().all(|&b| b == 0x10));
        assert!(read_row(&memory, &buffer, U_PLANE, 543).iter().all(|&b| b == 0x80));

        let metadata = buffer.metadata.as_ref().unwrap();
        let exif = metadata.exif.as_ref().unwrap();
        let maker_note = metadata.maker_note.as_ref().unwrap();
        assert_eq!(exif.size(), EXIF_INFO_SIZE);
        assert_eq!(maker_note.size(), MAKER_NOTE_SIZE);
        assert_eq!(exif.heap(), Heap::System);
        assert_eq!(memory.num_live_allocations(), 5);

        allocator.free_buffer(location, buffer);
        assert_eq!(memory.num_live_allocations(), 0);
    }

    #[test]
    fn capture_preview_has_no_still_alignment() {
        let (allocator, memory) = allocator();
        let location = OutputLocation::new(Component::Capture, CameraPort::Preview as u32);
        let buffer = allocator
            .allocate_buffer(location, &configuration(640, 480, SurfaceRestrictions::NONE))
            .unwrap()
            .unwrap();

        assert_eq!(buffer.planes[Y_PLANE].memory.as_ref().unwrap().alignment(), 256);
        allocator.free_buffer(location, buffer);
        assert_eq!(memory.num_live_allocations(), 0);
    }

    #[test]
    fn contiguous_capture_planes_share_memory() {
        let (allocator, memory) = allocator();
        let location = OutputLocation::new(Component::Capture, CameraPort::Preview as u32);
        let config = BufferConfiguration {
            physically_contiguous: true,
            ..configuration(640, 480, SurfaceRestrictions::NONE)
        };
        let buffer = allocator.allocate_buffer(location, &config).unwrap().unwrap();

        let shared = buffer.planes[Y_PLANE].memory.as_ref().unwrap();
        for window in buffer.planes.windows(2) {
            assert!(Arc::ptr_eq(shared, window[1].memory.as_ref().unwrap()));
            assert!(window[1].offset >= window[0].offset + window[0].size);
        }
        // Three planes in one allocation plus two metadata blocks.
        assert_eq!(memory.num_live_allocations(), 3);

        allocator.free_buffer(location, buffer);
        assert_eq!(memory.num_live_allocations(), 0);
    }

    #[test]
    fn oversized_contiguous_buffer_is_insufficient_memory() {
        let (allocator, memory) = allocator();
        let location = OutputLocation::new(Component::Capture, CameraPort::Preview as u32);
        let config = BufferConfiguration {
            physically_contiguous: true,
            ..configuration(60000, 60000, SurfaceRestrictions::NONE)
        };

        let result = allocator.allocate_buffer(location, &config);
        assert!(matches!(result, Err(Error::InsufficientMemory)));
        assert_eq!(memory.num_allocations(), 0);
    }

    #[test]
    fn failed_plane_rolls_back() {
        let (allocator, memory) =
            allocator_with(Platform::default(), HostMemoryManager::failing_after(2));
        let location = OutputLocation::new(Component::Zoom, ZoomPort::Still as u32);
        let result = allocator.allocate_buffer(location, &configuration(640, 480, aligned()));

        assert!(matches!(result, Err(Error::InsufficientMemory)));
        assert_eq!(memory.num_live_allocations(), 0);
    }

    #[test]
    fn failed_metadata_tears_down_capture_buffer() {
        let (allocator, memory) =
            allocator_with(Platform::default(), HostMemoryManager::failing_after(4));
        let location = OutputLocation::new(Component::Capture, CameraPort::Capture as u32);
        let config = configuration(640, 480, SurfaceRestrictions::NONE);
        let result = allocator.allocate_buffer(location, &config);

        assert!(matches!(result, Err(Error::InsufficientMemory)));
        assert_eq!(memory.num_allocations(), 4);
        assert_eq!(memory.num_live_allocations(), 0);
    }

    #[test]
    fn missing_heaps_report_insufficient_memory() {
        let (allocator, _memory) =
            allocator_with(Platform::default(), HostMemoryManager::with_heaps(&[Heap::System]));
        let location = OutputLocation::new(Component::Zoom, ZoomPort::Video as u32);
        let result = allocator.allocate_buffer(location, &configuration(640, 480, aligned()));

        assert!(matches!(result, Err(Error::InsufficientMemory)));
    }

    #[test]
    fn empty_format_is_rejected() {
        let (allocator, _memory) = allocator();
        let location = OutputLocation::new(Component::Zoom, ZoomPort::Still as u32);
        let mut config = configuration(640, 480, SurfaceRestrictions::NONE);
        config.format.planes.clear();

        let result = allocator.allocate_buffer(location, &config);
        assert!(matches!(result, Err(Error::BadParameter(_))));
    }
}
