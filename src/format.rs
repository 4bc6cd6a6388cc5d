// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Surface and video format descriptions exchanged during negotiation.

use std::ops::BitOr;

use enumn::N;

use crate::Resolution;

pub const Y_PLANE: usize = 0;
pub const U_PLANE: usize = 1;
pub const UV_PLANE: usize = 1;
pub const V_PLANE: usize = 2;

/// Kind tag consumed by the 2D engine for generic block-linear surfaces.
pub const BLOCK_LINEAR_KIND_GENERIC: u32 = 0xfe;
/// Block height (log2, in GOBs) used for block-linear surfaces unless told otherwise.
pub const DEFAULT_BLOCK_HEIGHT_LOG2: u32 = 2;

/// Per-plane color format.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum ColorFormat {
    #[default]
    Y8,
    U8,
    V8,
    /// Interleaved chroma, two bytes per sample pair.
    U8V8,
}

impl ColorFormat {
    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            ColorFormat::Y8 | ColorFormat::U8 | ColorFormat::V8 => 1,
            ColorFormat::U8V8 => 2,
        }
    }

    pub fn is_luma(&self) -> bool {
        matches!(self, ColorFormat::Y8)
    }
}

/// Memory layout of a surface. The discriminants match the values accepted by the
/// `camera.mode.videolayout.flags` property.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, N)]
#[repr(u32)]
pub enum MemoryLayout {
    #[default]
    Pitch = 1,
    Tiled = 2,
    BlockLinear = 3,
}

/// Logical pixel format of a whole buffer. This is the "format id" compared when deciding
/// whether buffers can be repurposed.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Planar YUV 4:2:0, three planes.
    #[default]
    Yuv420,
    /// Semi-planar YUV 4:2:0, luma plus interleaved chroma.
    Nv12,
    /// Single luma plane, used for odd-dimension 4:2:0 frames.
    Luma,
}

/// Constraints a stage puts on the surfaces it is handed.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct SurfaceRestrictions(u32);

impl SurfaceRestrictions {
    pub const NONE: Self = Self(0);
    pub const WIDTH_16_ALIGN: Self = Self(1 << 0);
    pub const HEIGHT_16_ALIGN: Self = Self(1 << 1);
    pub const NEEDS_CROP: Self = Self(1 << 2);

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl BitOr for SurfaceRestrictions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Geometry and layout of one plane.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SurfaceDescription {
    pub width: u32,
    pub height: u32,
    pub color_format: ColorFormat,
    pub layout: MemoryLayout,
    /// Bytes per row. 0 until computed by the 2D engine.
    pub pitch: u32,
    /// Block-linear only.
    pub kind: u32,
    /// Block-linear only.
    pub block_height_log2: u32,
}

impl SurfaceDescription {
    pub fn new(width: u32, height: u32, color_format: ColorFormat) -> Self {
        Self { width, height, color_format, ..Default::default() }
    }

    pub fn resolution(&self) -> Resolution {
        Resolution { width: self.width, height: self.height }
    }

    /// The same surface rotated by 90 degrees. Pitch must be recomputed by the caller.
    pub fn transposed(&self) -> Self {
        Self { width: self.height, height: self.width, pitch: 0, ..self.clone() }
    }
}

/// Format of a buffer: its planes and the restrictions that apply to them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VideoFormat {
    pub pixel_format: PixelFormat,
    pub planes: Vec<SurfaceDescription>,
    pub restrictions: SurfaceRestrictions,
}

impl VideoFormat {
    /// Three-plane 4:2:0 with all dimensions left unset.
    pub fn yuv420() -> Self {
        Self {
            pixel_format: PixelFormat::Yuv420,
            planes: vec![
                SurfaceDescription::new(0, 0, ColorFormat::Y8),
                SurfaceDescription::new(0, 0, ColorFormat::U8),
                SurfaceDescription::new(0, 0, ColorFormat::V8),
            ],
            restrictions: SurfaceRestrictions::NONE,
        }
    }

    /// Luma plus interleaved chroma, dimensions unset.
    pub fn nv12() -> Self {
        Self {
            pixel_format: PixelFormat::Nv12,
            planes: vec![
                SurfaceDescription::new(0, 0, ColorFormat::Y8),
                SurfaceDescription::new(0, 0, ColorFormat::U8V8),
            ],
            restrictions: SurfaceRestrictions::NONE,
        }
    }

    pub fn num_planes(&self) -> usize {
        self.planes.len()
    }

    /// Whether this is the single-plane luma-only layout.
    pub fn is_luma_only(&self) -> bool {
        self.planes.len() == 1 && self.planes[Y_PLANE].color_format.is_luma()
    }

    /// Whether chroma planes are derived from plane 0 at half resolution.
    pub fn has_subsampled_chroma(&self) -> bool {
        matches!(self.planes.len(), 2 | 3)
    }

    /// Sets the size of plane 0 and derives the chroma planes from it.
    pub fn set_resolution(&mut self, width: u32, height: u32) {
        if let Some(luma) = self.planes.first_mut() {
            luma.width = width;
            luma.height = height;
        }
        self.derive_chroma_width();
        self.derive_chroma_height();
    }

    pub(crate) fn derive_chroma_width(&mut self) {
        if !self.has_subsampled_chroma() {
            return;
        }
        let width = self.planes[Y_PLANE].width / 2;
        for plane in &mut self.planes[1..] {
            plane.width = width;
        }
    }

    pub(crate) fn derive_chroma_height(&mut self) {
        if !self.has_subsampled_chroma() {
            return;
        }
        let height = self.planes[Y_PLANE].height / 2;
        for plane in &mut self.planes[1..] {
            plane.height = height;
        }
    }

    pub fn resolution(&self) -> Resolution {
        self.planes.first().map(SurfaceDescription::resolution).unwrap_or_default()
    }
}

impl Default for VideoFormat {
    fn default() -> Self {
        Self::yuv420()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restrictions_combine() {
        let mut r = SurfaceRestrictions::WIDTH_16_ALIGN | SurfaceRestrictions::HEIGHT_16_ALIGN;
        assert!(r.contains(SurfaceRestrictions::WIDTH_16_ALIGN));
        assert!(!r.contains(SurfaceRestrictions::NEEDS_CROP));
        r.insert(SurfaceRestrictions::NEEDS_CROP);
        assert!(r.contains(SurfaceRestrictions::NEEDS_CROP));
        assert_eq!(r.bits(), 0b111);
    }

    #[test]
    fn chroma_planes_follow_luma() {
        let mut format = VideoFormat::yuv420();
        format.set_resolution(1280, 720);
        assert_eq!(format.planes[U_PLANE].resolution(), Resolution { width: 640, height: 360 });
        assert_eq!(format.planes[V_PLANE].resolution(), Resolution { width: 640, height: 360 });

        let mut format = VideoFormat::nv12();
        format.set_resolution(1280, 720);
        assert_eq!(format.planes[UV_PLANE].resolution(), Resolution { width: 640, height: 360 });
    }

    #[test]
    fn layout_from_property_value() {
        assert_eq!(MemoryLayout::n(1), Some(MemoryLayout::Pitch));
        assert_eq!(MemoryLayout::n(2), Some(MemoryLayout::Tiled));
        assert_eq!(MemoryLayout::n(3), Some(MemoryLayout::BlockLinear));
        assert_eq!(MemoryLayout::n(0), None);
    }
}
