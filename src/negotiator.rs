// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Negotiation of buffer requirements and configurations with the hardware blocks.
//!
//! A negotiation round runs with the pipeline lock held:
//!
//! 1. [`BufferNegotiator::output_requirements`] computes what each used zoom port needs.
//! 2. [`BufferNegotiator::output_configuration`] pushes every requirement and the configuration
//!    derived from it to the zoom block, then waits for the ports negotiated asynchronously and
//!    accepts what the block settled on. For the capture stage it waits for the configuration
//!    announced by the camera block.
//!
//! A timed out wait is logged and the round goes on with whatever the port holds at that point.
//! A failing hardware call ends the round immediately.

use crate::buffer::BufferConfiguration;
use crate::buffer::BufferRequirement;
use crate::format::SurfaceRestrictions;
use crate::hardware::PipelineBlocks;
use crate::hardware::StreamEvent;
use crate::hardware::TransferMessage;
use crate::platform::Platform;
use crate::policy::preview_buffer_config;
use crate::policy::FormatPolicy;
use crate::stream::camera_output_stream;
use crate::stream::CameraPort;
use crate::stream::StreamIndex;
use crate::stream::ZoomPort;
use crate::stream::ZoomStream;
use crate::sync::PipelineGuard;
use crate::Component;
use crate::OutputLocation;
use crate::Resolution;
use crate::Result;

const PREVIEW_BUFFERS: u32 = 2;
const STILL_BUFFERS: u32 = 4;
const VIDEO_BUFFERS: u32 = 6;
const THUMBNAIL_BUFFERS: u32 = 2;

/// Outcome of a negotiation round for one port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortConfiguration {
    pub location: OutputLocation,
    pub configuration: BufferConfiguration,
    pub requirement: BufferRequirement,
}

pub struct BufferNegotiator {
    platform: Platform,
    policy: FormatPolicy,
    blocks: PipelineBlocks,
}

impl BufferNegotiator {
    pub fn new(platform: Platform, policy: FormatPolicy, blocks: PipelineBlocks) -> Self {
        Self { platform, policy, blocks }
    }

    /// Marks `location` as used or not and tells the block serving it whether this manager
    /// allocates its buffers.
    pub fn enable_stream(
        &self,
        guard: &mut PipelineGuard<'_>,
        location: OutputLocation,
        used: bool,
    ) -> Result<()> {
        let Some((block, stream)) = self.blocks.resolve(location, self.platform.usb_camera) else {
            log::debug!("Nothing to enable for {:?}", location);
            return Ok(());
        };

        block.set_buffer_allocator(stream, used)?;

        // The block cannot announce anything before the lock is released.
        let port = guard.port_mut(stream);
        port.used = used;
        port.config_done = false;

        Ok(())
    }

    /// Sets the resolution requested for a zoom output. Other locations ignore it.
    pub fn request_resolution(
        &self,
        guard: &mut PipelineGuard<'_>,
        location: OutputLocation,
        resolution: Resolution,
    ) {
        match self.blocks.resolve(location, self.platform.usb_camera) {
            Some((_, stream @ StreamIndex::Zoom(_))) => guard
                .port_mut(stream)
                .requirement
                .format
                .set_resolution(resolution.width, resolution.height),
            _ => log::debug!("{:?} does not take a requested resolution", location),
        }
    }

    /// Computes the requirements of every used output of `component`.
    ///
    /// Only the zoom stage has requirements of its own; the others report none.
    pub fn output_requirements(
        &self,
        guard: &mut PipelineGuard<'_>,
        component: Component,
    ) -> Result<Vec<(OutputLocation, BufferRequirement)>> {
        if component != Component::Zoom {
            log::debug!("No output requirements for {:?}", component);
            return Ok(Vec::new());
        }

        let mut requirements = Vec::new();
        for port in ZoomPort::ALL {
            let stream = ZoomStream::from(port);
            if !guard.port(stream).used {
                continue;
            }

            let mut requirement = guard.port(stream).requirement.clone();
            self.policy.populate_zoom_surface_format(&mut requirement, port);

            let count = match port {
                ZoomPort::Preview => PREVIEW_BUFFERS,
                ZoomPort::Still => STILL_BUFFERS,
                ZoomPort::Video => VIDEO_BUFFERS,
                ZoomPort::Thumbnail => THUMBNAIL_BUFFERS,
            };
            requirement.min_buffers = count;
            requirement.max_buffers = count;
            requirement.format.restrictions = self.zoom_restrictions(port);

            log::debug!(
                "Zoom {:?} requires {} buffers of {:?}",
                port,
                count,
                requirement.format.resolution()
            );
            guard.port_mut(stream).requirement = requirement.clone();
            requirements.push((OutputLocation::new(Component::Zoom, port as u32), requirement));
        }

        Ok(requirements)
    }

    fn zoom_restrictions(&self, port: ZoomPort) -> SurfaceRestrictions {
        let aligned = SurfaceRestrictions::WIDTH_16_ALIGN
            | SurfaceRestrictions::HEIGHT_16_ALIGN
            | SurfaceRestrictions::NEEDS_CROP;

        match port {
            ZoomPort::Still => aligned,
            ZoomPort::Video if self.platform.zoom_video_needs_alignment() => aligned,
            _ => SurfaceRestrictions::NONE,
        }
    }

    /// Settles the configuration of every used output of `component`.
    pub fn output_configuration(
        &self,
        guard: &mut PipelineGuard<'_>,
        component: Component,
    ) -> Result<Vec<PortConfiguration>> {
        match component {
            Component::Capture => Ok(self.capture_configurations(guard)),
            Component::Zoom => self.zoom_configurations(guard),
            Component::Host => {
                log::debug!("No output configuration for {:?}", component);
                Ok(Vec::new())
            }
        }
    }

    /// Inputs do not carry requirements of their own. Kept so every stage answers the three
    /// negotiation requests.
    pub fn input_requirement(&self, _guard: &mut PipelineGuard<'_>, location: OutputLocation) {
        log::debug!("No input requirement for {:?}", location);
    }

    fn capture_configurations(&self, guard: &mut PipelineGuard<'_>) -> Vec<PortConfiguration> {
        let mut configurations: Vec<PortConfiguration> = Vec::new();
        let mut seen = Vec::new();

        for port in CameraPort::ALL {
            let stream =
                StreamIndex::Camera(camera_output_stream(port as u32, self.platform.usb_camera));
            // USB cameras serve every port from a single stream.
            if !guard.port(stream).used || seen.contains(&stream) {
                continue;
            }
            seen.push(stream);

            let (configuration, requirement) = self.capture_cfg_and_req(guard, stream);
            configurations.push(PortConfiguration {
                location: OutputLocation::new(Component::Capture, port as u32),
                configuration,
                requirement,
            });
        }

        configurations
    }

    /// Waits for the camera block to announce the configuration of `stream`, then returns it.
    fn capture_cfg_and_req(
        &self,
        guard: &mut PipelineGuard<'_>,
        stream: StreamIndex,
    ) -> (BufferConfiguration, BufferRequirement) {
        if !guard.port(stream).config_done {
            guard.wait_config_done(stream).report(stream, "capture configuration");
        }

        let port = guard.port(stream);
        (port.configuration.clone(), port.requirement.clone())
    }

    fn zoom_configurations(&self, guard: &mut PipelineGuard<'_>) -> Result<Vec<PortConfiguration>> {
        let ports: Vec<ZoomPort> = ZoomPort::ALL
            .into_iter()
            .filter(|&port| guard.port(ZoomStream::from(port)).used)
            .collect();

        for &port in &ports {
            guard.port_mut(ZoomStream::from(port)).config_done = false;
        }

        // Every port gets its requirement and configuration before any of them is waited on.
        for &port in &ports {
            let stream = StreamIndex::Zoom(port.into());
            let requirement = guard.port(stream).requirement.clone();
            self.blocks.zoom.transfer_buffer(
                stream,
                TransferMessage::StreamEvent(StreamEvent::BufferRequirements(requirement.clone())),
            )?;

            let configuration = preview_buffer_config(&requirement);
            guard.port_mut(stream).configuration = configuration.clone();
            self.blocks.zoom.transfer_buffer(
                stream,
                TransferMessage::StreamEvent(StreamEvent::BufferConfiguration(configuration)),
            )?;
        }

        let mut configurations = Vec::with_capacity(ports.len());
        for port in ports {
            let stream = StreamIndex::Zoom(port.into());
            let asynchronous = self.platform.zoom_config_is_async(port);

            if asynchronous && !guard.port(stream).config_done {
                guard.wait_config_done(stream).report(stream, "zoom configuration");
            }

            let state = guard.port(stream);
            configurations.push(PortConfiguration {
                location: OutputLocation::new(Component::Zoom, port as u32),
                configuration: state.configuration.clone(),
                requirement: state.requirement.clone(),
            });

            if asynchronous {
                self.reply_to_zoom_config(port)?;
            }
        }

        Ok(configurations)
    }

    /// Accepts the configuration the zoom block settled on for `port`.
    ///
    /// There is no rejection path: the reply always accepts.
    pub fn reply_to_zoom_config(&self, port: ZoomPort) -> Result<()> {
        let stream = StreamIndex::Zoom(port.into());
        self.blocks.zoom.transfer_buffer(
            stream,
            TransferMessage::StreamEvent(StreamEvent::BufferConfigurationReply { accepted: true }),
        )?;

        Ok(())
    }
}
