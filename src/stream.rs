// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Mapping between the HAL's abstract output ports and the hardware blocks' stream indices.
//!
//! Unknown port values are not errors: they are logged and mapped to the preview stream.

use enumn::N;

/// Output ports of the camera capture stage, as numbered by the HAL.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, N)]
#[repr(u32)]
pub enum CameraPort {
    Preview = 0,
    Capture = 1,
}

impl CameraPort {
    pub const ALL: [CameraPort; 2] = [CameraPort::Preview, CameraPort::Capture];
}

/// Output ports of the digital zoom stage, as numbered by the HAL.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, N)]
#[repr(u32)]
pub enum ZoomPort {
    Preview = 0,
    Still = 1,
    Video = 2,
    Thumbnail = 3,
}

impl ZoomPort {
    pub const ALL: [ZoomPort; 4] =
        [ZoomPort::Preview, ZoomPort::Still, ZoomPort::Video, ZoomPort::Thumbnail];
}

/// Streams of the camera capture block.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CameraStream {
    OutputPreview,
    /// Still capture output. USB cameras route every output through this stream.
    Output,
}

/// Streams of the digital zoom block.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ZoomStream {
    InputPreview,
    InputStill,
    OutputPreview,
    OutputStill,
    OutputVideo,
    OutputThumbnail,
}

/// A stream of either hardware block.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StreamIndex {
    Camera(CameraStream),
    Zoom(ZoomStream),
}

impl StreamIndex {
    pub const COUNT: usize = 8;

    pub const ALL: [StreamIndex; 8] = [
        StreamIndex::Camera(CameraStream::OutputPreview),
        StreamIndex::Camera(CameraStream::Output),
        StreamIndex::Zoom(ZoomStream::InputPreview),
        StreamIndex::Zoom(ZoomStream::InputStill),
        StreamIndex::Zoom(ZoomStream::OutputPreview),
        StreamIndex::Zoom(ZoomStream::OutputStill),
        StreamIndex::Zoom(ZoomStream::OutputVideo),
        StreamIndex::Zoom(ZoomStream::OutputThumbnail),
    ];

    /// Position of this stream in [`StreamIndex::ALL`].
    pub fn index(&self) -> usize {
        match self {
            StreamIndex::Camera(CameraStream::OutputPreview) => 0,
            StreamIndex::Camera(CameraStream::Output) => 1,
            StreamIndex::Zoom(ZoomStream::InputPreview) => 2,
            StreamIndex::Zoom(ZoomStream::InputStill) => 3,
            StreamIndex::Zoom(ZoomStream::OutputPreview) => 4,
            StreamIndex::Zoom(ZoomStream::OutputStill) => 5,
            StreamIndex::Zoom(ZoomStream::OutputVideo) => 6,
            StreamIndex::Zoom(ZoomStream::OutputThumbnail) => 7,
        }
    }
}

impl From<CameraStream> for StreamIndex {
    fn from(stream: CameraStream) -> Self {
        StreamIndex::Camera(stream)
    }
}

impl From<ZoomStream> for StreamIndex {
    fn from(stream: ZoomStream) -> Self {
        StreamIndex::Zoom(stream)
    }
}

impl From<ZoomPort> for ZoomStream {
    fn from(port: ZoomPort) -> Self {
        match port {
            ZoomPort::Preview => ZoomStream::OutputPreview,
            ZoomPort::Still => ZoomStream::OutputStill,
            ZoomPort::Video => ZoomStream::OutputVideo,
            ZoomPort::Thumbnail => ZoomStream::OutputThumbnail,
        }
    }
}

/// Parses a raw zoom port, falling back to `Preview` for unknown values.
pub fn zoom_port(port: u32) -> ZoomPort {
    ZoomPort::n(port).unwrap_or_else(|| {
        log::error!("Unknown zoom output port {}, using preview", port);
        ZoomPort::Preview
    })
}

/// Parses a raw camera port, falling back to `Preview` for unknown values.
pub fn camera_port(port: u32) -> CameraPort {
    CameraPort::n(port).unwrap_or_else(|| {
        log::error!("Unknown camera output port {}, using preview", port);
        CameraPort::Preview
    })
}

/// Returns the zoom block stream backing output `port`.
pub fn zoom_output_stream(port: u32) -> ZoomStream {
    ZoomStream::from(zoom_port(port))
}

/// Returns the camera block stream backing output `port`.
///
/// USB cameras have a single output stream, so every port maps to [`CameraStream::Output`].
pub fn camera_output_stream(port: u32, usb_camera: bool) -> CameraStream {
    if usb_camera {
        return CameraStream::Output;
    }

    match camera_port(port) {
        CameraPort::Preview => CameraStream::OutputPreview,
        CameraPort::Capture => CameraStream::Output,
    }
}
