// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Surface format policy for the zoom outputs, and the default requirement-to-configuration
//! transformation.

use crate::align_up;
use crate::buffer::BufferConfiguration;
use crate::buffer::BufferRequirement;
use crate::format::MemoryLayout;
use crate::format::VideoFormat;
use crate::format::BLOCK_LINEAR_KIND_GENERIC;
use crate::format::DEFAULT_BLOCK_HEIGHT_LOG2;
use crate::format::Y_PLANE;
use crate::format::SurfaceRestrictions;
use crate::platform::ChipFamily;
use crate::properties;
use crate::properties::PropertyStore;
use crate::stream::ZoomPort;
use crate::Resolution;

/// Used when the requester leaves the dimensions unset.
pub const DEFAULT_RESOLUTION: Resolution = Resolution { width: 1920, height: 1088 };

/// Picks plane count, color formats and layout for each zoom output.
#[derive(Clone, Debug, Default)]
pub struct FormatPolicy {
    chip: ChipFamily,
    video_layout_override: Option<MemoryLayout>,
}

impl FormatPolicy {
    pub fn new(chip: ChipFamily, properties: &dyn PropertyStore) -> Self {
        Self { chip, video_layout_override: properties::video_layout_override(properties) }
    }

    pub fn with_video_layout(
        chip: ChipFamily,
        video_layout_override: Option<MemoryLayout>,
    ) -> Self {
        Self { chip, video_layout_override }
    }

    /// Chip default for `port`, before any user override.
    fn default_format(&self, port: ZoomPort) -> VideoFormat {
        match (self.chip, port) {
            (ChipFamily::T124, ZoomPort::Still) => {
                let mut format = VideoFormat::nv12();
                set_layout(&mut format, MemoryLayout::BlockLinear);
                format
            }
            (ChipFamily::T124, _) => VideoFormat::yuv420(),
            (_, ZoomPort::Video) => {
                let mut format = VideoFormat::yuv420();
                set_layout(&mut format, MemoryLayout::Tiled);
                format
            }
            _ => VideoFormat::yuv420(),
        }
    }

    /// Fills in the surface format of `requirement` for zoom output `port`.
    ///
    /// The requested resolution and restrictions are kept.
    pub fn populate_zoom_surface_format(
        &self,
        requirement: &mut BufferRequirement,
        port: ZoomPort,
    ) {
        let resolution = requirement.format.resolution();
        let mut format = self.default_format(port);

        if port == ZoomPort::Video {
            if let Some(layout) = self.video_layout_override {
                log::debug!("Video layout overridden to {:?}", layout);
                set_layout(&mut format, layout);
            }
        }

        if format.planes[Y_PLANE].layout == MemoryLayout::BlockLinear {
            let luma = &mut format.planes[Y_PLANE];
            if luma.kind == 0 {
                luma.kind = BLOCK_LINEAR_KIND_GENERIC;
            }
            let (kind, block_height_log2) = (luma.kind, luma.block_height_log2);
            for plane in &mut format.planes[1..] {
                plane.kind = kind;
                plane.block_height_log2 = block_height_log2;
            }
        }

        format.restrictions = requirement.format.restrictions;
        format.set_resolution(resolution.width, resolution.height);
        requirement.format = format;
    }
}

fn set_layout(format: &mut VideoFormat, layout: MemoryLayout) {
    for plane in &mut format.planes {
        plane.layout = layout;
        if layout == MemoryLayout::BlockLinear {
            plane.block_height_log2 = DEFAULT_BLOCK_HEIGHT_LOG2;
        }
    }
}

/// Derives the configuration that will be proposed for `requirement`.
///
/// Pure transformation: the buffer count is the requirement's minimum, unset dimensions get
/// [`DEFAULT_RESOLUTION`], luma-only formats are made even and restricted dimensions are rounded
/// up to 16.
pub fn preview_buffer_config(requirement: &BufferRequirement) -> BufferConfiguration {
    let mut format = requirement.format.clone();
    if format.planes.is_empty() {
        log::debug!("Requirement carries no planes, assuming YUV 4:2:0");
        format = VideoFormat { restrictions: format.restrictions, ..VideoFormat::yuv420() };
    }

    let restrictions = format.restrictions;
    let luma_only = format.is_luma_only();
    let luma = &mut format.planes[Y_PLANE];

    if luma.width == 0 {
        luma.width = DEFAULT_RESOLUTION.width;
    }
    if luma.height == 0 {
        luma.height = DEFAULT_RESOLUTION.height;
    }

    if luma_only {
        luma.width = align_up(luma.width, 2);
        luma.height = align_up(luma.height, 2);
    }

    if restrictions.contains(SurfaceRestrictions::WIDTH_16_ALIGN) {
        luma.width = align_up(luma.width, 16);
    }
    if restrictions.contains(SurfaceRestrictions::HEIGHT_16_ALIGN) {
        luma.height = align_up(luma.height, 16);
    }

    format.derive_chroma_width();
    format.derive_chroma_height();

    BufferConfiguration {
        num_buffers: requirement.min_buffers,
        memory_space: requirement.memory_space,
        byte_alignment: requirement.byte_alignment,
        endianness: requirement.endianness,
        buffer_size: requirement.min_buffer_size,
        physically_contiguous: requirement.physically_contiguous,
        in_shared_memory: requirement.in_shared_memory,
        format,
    }
}
