// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Hand-off of filled buffers to the hardware blocks, and their reclaim on abort.

use crate::buffer::NativeBuffer;
use crate::hardware::HardwareBlock;
use crate::hardware::PipelineBlocks;
use crate::hardware::TransferMessage;
use crate::platform::Platform;
use crate::stream::CameraStream;
use crate::stream::StreamIndex;
use crate::stream::ZoomStream;
use crate::sync::PipelineGuard;
use crate::OutputLocation;
use crate::Result;

pub struct BufferHandler {
    platform: Platform,
    blocks: PipelineBlocks,
}

impl BufferHandler {
    pub fn new(platform: Platform, blocks: PipelineBlocks) -> Self {
        Self { platform, blocks }
    }

    /// Sends `buffer` to the block serving `location`. The block holds it until it completes it or
    /// is aborted.
    pub fn give_buffer_to_component(
        &self,
        location: OutputLocation,
        buffer: &NativeBuffer,
    ) -> Result<()> {
        let Some((block, stream)) = self.blocks.resolve(location, self.platform.usb_camera) else {
            log::debug!("No block to give buffers of {:?} to", location);
            return Ok(());
        };

        block.transfer_buffer(stream, TransferMessage::Payload(buffer))?;
        Ok(())
    }

    /// Aborts the stream serving `location` and waits until its buffers are given back.
    ///
    /// Capture buffers flow through the zoom block too, so aborting a capture output also aborts
    /// the zoom input it feeds.
    pub fn return_buffers_to_manager(
        &self,
        guard: &mut PipelineGuard<'_>,
        location: OutputLocation,
    ) -> Result<()> {
        let Some((block, stream)) = self.blocks.resolve(location, self.platform.usb_camera) else {
            log::debug!("No buffers of {:?} to return", location);
            return Ok(());
        };

        abort_and_wait(guard, block, stream)?;

        let zoom = self.blocks.zoom.as_ref();
        match stream {
            StreamIndex::Camera(CameraStream::OutputPreview) => {
                abort_and_wait(guard, zoom, ZoomStream::InputPreview.into())?;
            }
            StreamIndex::Camera(CameraStream::Output) => {
                abort_and_wait(guard, block, stream)?;
                abort_and_wait(guard, zoom, ZoomStream::InputStill.into())?;
            }
            StreamIndex::Zoom(_) => (),
        }

        Ok(())
    }
}

fn abort_and_wait(
    guard: &mut PipelineGuard<'_>,
    block: &dyn HardwareBlock,
    stream: StreamIndex,
) -> Result<()> {
    guard.port_mut(stream).abort_done = false;
    block.abort_buffers(stream)?;
    guard.wait_abort_done(stream).report(stream, "abort");

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::hardware::HardwareError;
    use crate::simulated::BlockCall;
    use crate::simulated::SimulatedBlock;
    use crate::stream::CameraPort;
    use crate::stream::ZoomPort;
    use crate::sync::PipelineSync;
    use crate::Component;
    use crate::Error;

    struct Fixture {
        sync: Arc<PipelineSync>,
        camera: Arc<SimulatedBlock>,
        zoom: Arc<SimulatedBlock>,
        handler: BufferHandler,
    }

    fn fixture_with(platform: Platform, wait_timeout: Duration) -> Fixture {
        let sync = Arc::new(PipelineSync::with_wait_timeout(wait_timeout));
        let camera = Arc::new(SimulatedBlock::new(sync.clone()));
        let zoom = Arc::new(SimulatedBlock::new(sync.clone()));
        let blocks = PipelineBlocks::new(camera.clone(), zoom.clone());
        let handler = BufferHandler::new(platform, blocks);
        Fixture { sync, camera, zoom, handler }
    }

    fn fixture() -> Fixture {
        fixture_with(Platform::default(), Duration::from_secs(5))
    }

    fn aborts(block: &SimulatedBlock) -> Vec<StreamIndex> {
        block
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                BlockCall::Abort(stream) => Some(stream),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn buffers_go_to_resolved_stream() {
        let f = fixture();
        let buffer = NativeBuffer::from_format(&Default::default());

        let still = OutputLocation::new(Component::Zoom, ZoomPort::Still as u32);
        f.handler.give_buffer_to_component(still, &buffer).unwrap();
        let capture = OutputLocation::new(Component::Capture, CameraPort::Preview as u32);
        f.handler.give_buffer_to_component(capture, &buffer).unwrap();
        let host = OutputLocation::new(Component::Host, 0);
        f.handler.give_buffer_to_component(host, &buffer).unwrap();

        assert_eq!(
            f.zoom.calls(),
            vec![BlockCall::Payload { stream: ZoomStream::OutputStill.into(), num_planes: 3 }]
        );
        assert_eq!(
            f.camera.calls(),
            vec![BlockCall::Payload { stream: CameraStream::OutputPreview.into(), num_planes: 3 }]
        );
    }

    #[test]
    fn transfer_failure_is_propagated() {
        let f = fixture();
        f.zoom.fail_on(ZoomStream::OutputVideo.into(), HardwareError(1));
        let video = OutputLocation::new(Component::Zoom, ZoomPort::Video as u32);
        let result = f.handler.give_buffer_to_component(video, &NativeBuffer::default());

        assert!(matches!(result, Err(Error::Hardware(HardwareError(1)))));
    }

    #[test]
    fn zoom_abort_waits_for_acknowledgement() {
        let f = fixture();
        let mut guard = f.sync.lock();
        let video = OutputLocation::new(Component::Zoom, ZoomPort::Video as u32);
        f.handler.return_buffers_to_manager(&mut guard, video).unwrap();

        assert!(guard.port(ZoomStream::OutputVideo).abort_done);
        drop(guard);
        assert_eq!(aborts(&f.zoom), vec![ZoomStream::OutputVideo.into()]);
        assert!(aborts(&f.camera).is_empty());
    }

    #[test]
    fn capture_preview_abort_cascades_to_zoom_input() {
        let f = fixture();
        let mut guard = f.sync.lock();
        let preview = OutputLocation::new(Component::Capture, CameraPort::Preview as u32);
        f.handler.return_buffers_to_manager(&mut guard, preview).unwrap();

        assert!(guard.port(ZoomStream::InputPreview).abort_done);
        drop(guard);
        assert_eq!(aborts(&f.camera), vec![CameraStream::OutputPreview.into()]);
        assert_eq!(aborts(&f.zoom), vec![ZoomStream::InputPreview.into()]);
    }

    #[test]
    fn capture_abort_reaborts_and_cascades_to_still_input() {
        let f = fixture();
        let mut guard = f.sync.lock();
        let capture = OutputLocation::new(Component::Capture, CameraPort::Capture as u32);
        f.handler.return_buffers_to_manager(&mut guard, capture).unwrap();
        drop(guard);

        let output = StreamIndex::Camera(CameraStream::Output);
        assert_eq!(aborts(&f.camera), vec![output, output]);
        assert_eq!(aborts(&f.zoom), vec![ZoomStream::InputStill.into()]);
    }

    #[test]
    fn abort_timeout_is_not_an_error() {
        let f = fixture_with(Platform::default(), Duration::from_millis(20));
        f.zoom.set_responsive(false);
        let mut guard = f.sync.lock();
        let still = OutputLocation::new(Component::Zoom, ZoomPort::Still as u32);

        f.handler.return_buffers_to_manager(&mut guard, still).unwrap();
        assert!(!guard.port(ZoomStream::OutputStill).abort_done);
    }

    #[test]
    fn failed_abort_stops_cascade() {
        let f = fixture();
        f.camera.fail_on(CameraStream::OutputPreview.into(), HardwareError(2));
        let mut guard = f.sync.lock();
        let preview = OutputLocation::new(Component::Capture, CameraPort::Preview as u32);

        let result = f.handler.return_buffers_to_manager(&mut guard, preview);
        assert!(matches!(result, Err(Error::Hardware(HardwareError(2)))));
        drop(guard);
        assert!(aborts(&f.zoom).is_empty());
    }

    #[test]
    fn host_abort_is_a_no_op() {
        let f = fixture();
        let mut guard = f.sync.lock();
        let host = OutputLocation::new(Component::Host, 3);
        f.handler.return_buffers_to_manager(&mut guard, host).unwrap();
        drop(guard);

        assert!(f.camera.calls().is_empty());
        assert!(f.zoom.calls().is_empty());
    }
}
