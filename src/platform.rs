// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Hardware variants and the decisions that depend on them.

use std::str::FromStr;

use crate::stream::ZoomPort;

/// Version of the buffer negotiation protocol spoken by the zoom block.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum ProtocolVariant {
    /// Preview buffers come from the window system; still and video are allocated here and
    /// negotiated asynchronously.
    #[default]
    Legacy,
    /// Every zoom output buffer comes from the window system and every port is negotiated
    /// asynchronously.
    V3,
}

impl FromStr for ProtocolVariant {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "legacy" | "Legacy" => Ok(ProtocolVariant::Legacy),
            "v3" | "V3" => Ok(ProtocolVariant::V3),
            _ => Err("unrecognized protocol variant. Valid values: legacy, v3"),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum ChipFamily {
    #[default]
    T30,
    T114,
    /// Still output is block-linear NV12 on this family.
    T124,
}

impl FromStr for ChipFamily {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "t30" | "T30" => Ok(ChipFamily::T30),
            "t114" | "T114" => Ok(ChipFamily::T114),
            "t124" | "T124" => Ok(ChipFamily::T124),
            _ => Err("unrecognized chip family. Valid values: t30, t114, t124"),
        }
    }
}

/// The hardware the buffer manager is driving.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Platform {
    pub protocol: ProtocolVariant,
    pub chip: ChipFamily,
    /// Whether the camera block is a USB camera with a single output stream.
    pub usb_camera: bool,
}

impl Platform {
    pub fn new(protocol: ProtocolVariant, chip: ChipFamily) -> Self {
        Self { protocol, chip, usb_camera: false }
    }

    pub fn is_v3(&self) -> bool {
        self.protocol == ProtocolVariant::V3
    }

    /// Whether buffers of zoom output `port` are owned by an external window-buffer provider.
    pub fn zoom_buffers_external(&self, port: ZoomPort) -> bool {
        port == ZoomPort::Preview || self.is_v3()
    }

    /// Whether existing buffers of zoom output `port` may be repurposed on a configuration
    /// change.
    pub fn zoom_buffers_repurposable(&self, port: ZoomPort) -> bool {
        match port {
            ZoomPort::Preview => false,
            ZoomPort::Video => !self.is_v3(),
            ZoomPort::Still | ZoomPort::Thumbnail => true,
        }
    }

    /// Whether freeing a buffer of zoom output `port` must release surfaces.
    pub fn zoom_buffers_owned_on_free(&self, port: ZoomPort) -> bool {
        match port {
            ZoomPort::Preview => false,
            ZoomPort::Video => !self.is_v3(),
            ZoomPort::Still | ZoomPort::Thumbnail => true,
        }
    }

    /// Whether the negotiation of zoom output `port` completes asynchronously and must be waited
    /// on and acknowledged.
    pub fn zoom_config_is_async(&self, port: ZoomPort) -> bool {
        match port {
            ZoomPort::Still | ZoomPort::Video => true,
            ZoomPort::Preview => self.is_v3(),
            ZoomPort::Thumbnail => false,
        }
    }

    /// Whether the zoom video output needs 16-aligned, croppable surfaces.
    pub fn zoom_video_needs_alignment(&self) -> bool {
        !self.is_v3()
    }
}
