// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Runs one negotiation round, allocation, hand-off and abort against simulated hardware.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use argh::FromArgs;

use tegra_buffers::allocator::AllocatorConfig;
use tegra_buffers::allocator::BufferAllocator;
use tegra_buffers::buffer::BufferConfiguration;
use tegra_buffers::buffer::BufferRequirement;
use tegra_buffers::buffer::PooledBuffer;
use tegra_buffers::handler::BufferHandler;
use tegra_buffers::hardware::PipelineBlocks;
use tegra_buffers::negotiator::BufferNegotiator;
use tegra_buffers::platform::ChipFamily;
use tegra_buffers::platform::Platform;
use tegra_buffers::platform::ProtocolVariant;
use tegra_buffers::policy::FormatPolicy;
use tegra_buffers::properties;
use tegra_buffers::simulated::HostMemoryManager;
use tegra_buffers::simulated::SimulatedBlock;
use tegra_buffers::simulated::SoftwareSurfaceEngine;
use tegra_buffers::stream::CameraPort;
use tegra_buffers::stream::CameraStream;
use tegra_buffers::stream::StreamIndex;
use tegra_buffers::stream::ZoomPort;
use tegra_buffers::sync::PipelineSync;
use tegra_buffers::Component;
use tegra_buffers::OutputLocation;
use tegra_buffers::Resolution;

/// Negotiate and allocate camera buffers on simulated hardware
#[derive(Debug, FromArgs)]
struct Args {
    /// chip family: t30, t114 or t124
    #[argh(option, default = "ChipFamily::T30")]
    chip: ChipFamily,

    /// zoom block protocol: legacy or v3
    #[argh(option, default = "ProtocolVariant::Legacy")]
    protocol: ProtocolVariant,

    /// requested width
    #[argh(option, default = "1920")]
    width: u32,

    /// requested height
    #[argh(option, default = "1080")]
    height: u32,

    /// video layout override: 1 = pitch, 2 = tiled, 3 = block-linear
    #[argh(option)]
    video_layout: Option<u32>,

    /// log every plane allocation
    #[argh(switch)]
    mem_profile: bool,

    /// the camera is a USB camera
    #[argh(switch)]
    usb: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args: Args = argh::from_env();

    let mut store = HashMap::new();
    if let Some(layout) = args.video_layout {
        store.insert(properties::VIDEO_LAYOUT_PROPERTY.to_string(), layout.to_string());
    }
    if args.mem_profile {
        store.insert(properties::MEMORY_PROFILE_PROPERTY.to_string(), "1".to_string());
    }

    let platform = Platform { usb_camera: args.usb, ..Platform::new(args.protocol, args.chip) };
    let resolution = Resolution { width: args.width, height: args.height };

    let sync = Arc::new(PipelineSync::new());
    let camera = Arc::new(SimulatedBlock::new(sync.clone()));
    let zoom = Arc::new(SimulatedBlock::new(sync.clone()));
    let blocks = PipelineBlocks::new(camera.clone(), zoom.clone());

    let mut capture_requirement =
        BufferRequirement { min_buffers: 3, max_buffers: 3, ..Default::default() };
    capture_requirement.format.set_resolution(resolution.width, resolution.height);
    let capture_configuration = BufferConfiguration {
        num_buffers: 3,
        format: capture_requirement.format.clone(),
        ..Default::default()
    };
    camera.announce(
        StreamIndex::Camera(CameraStream::Output),
        capture_configuration,
        capture_requirement,
    );

    let negotiator =
        BufferNegotiator::new(platform, FormatPolicy::new(platform.chip, &store), blocks.clone());
    let memory = Arc::new(HostMemoryManager::new());
    let allocator = BufferAllocator::new(
        AllocatorConfig::new(platform, &store),
        memory.clone(),
        Arc::new(SoftwareSurfaceEngine),
    );
    let handler = BufferHandler::new(platform, blocks);

    let capture = OutputLocation::new(Component::Capture, CameraPort::Capture as u32);
    let zoom_ports = [ZoomPort::Preview, ZoomPort::Still, ZoomPort::Video];

    let mut guard = sync.lock();
    negotiator.enable_stream(&mut guard, capture, true)?;
    for port in zoom_ports {
        let location = OutputLocation::new(Component::Zoom, port as u32);
        negotiator.enable_stream(&mut guard, location, true)?;
        negotiator.request_resolution(&mut guard, location, resolution);
    }

    negotiator.output_requirements(&mut guard, Component::Zoom)?;
    let mut configurations = negotiator.output_configuration(&mut guard, Component::Capture)?;
    configurations.extend(negotiator.output_configuration(&mut guard, Component::Zoom)?);
    drop(guard);

    let mut pools = Vec::new();
    for port in &configurations {
        let config = &port.configuration;
        println!(
            "{:?}: {} buffers of {}x{}, {} planes",
            port.location,
            config.num_buffers,
            config.format.resolution().width,
            config.format.resolution().height,
            config.format.num_planes()
        );

        let mut pool: Vec<PooledBuffer> = Vec::new();
        for _ in 0..config.num_buffers {
            let buffer = allocator
                .allocate_buffer(port.location, config)
                .with_context(|| format!("allocating buffers for {:?}", port.location))?;
            if let Some(buffer) = buffer {
                handler.give_buffer_to_component(port.location, &buffer)?;
                pool.push(PooledBuffer { buffer, in_use: true });
            }
        }
        pools.push((port.location, config.clone(), pool));
    }
    println!("{} live allocations", memory.num_live_allocations());

    let mut guard = sync.lock();
    for (location, _, pool) in &mut pools {
        handler.return_buffers_to_manager(&mut guard, *location)?;
        for pooled in pool.iter_mut() {
            pooled.in_use = false;
        }
    }
    drop(guard);

    for (location, config, pool) in &mut pools {
        let mut smaller = config.clone();
        smaller.format.set_resolution(
            config.format.resolution().width / 2,
            config.format.resolution().height / 2,
        );
        let repurposed = allocator.repurpose_buffers(*location, config, &smaller, pool);
        println!("{:?}: repurposed at half size: {}", location, repurposed);
    }

    for (location, _, pool) in pools {
        for pooled in pool {
            allocator.free_buffer(location, pooled.buffer);
        }
    }
    println!("{} live allocations after free", memory.num_live_allocations());

    Ok(())
}
