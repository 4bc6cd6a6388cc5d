// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reuse of already allocated buffers across a configuration change.

use thiserror::Error;

use crate::allocator::BufferAllocator;
use crate::allocator::Target;
use crate::buffer::BufferConfiguration;
use crate::buffer::NativeBuffer;
use crate::buffer::PooledBuffer;
use crate::format::Y_PLANE;
use crate::OutputLocation;
use crate::Result;

#[derive(Debug, Error)]
#[error("buffer has {actual} planes, new configuration has {expected}")]
struct PlaneCountMismatch {
    actual: usize,
    expected: usize,
}

impl BufferAllocator {
    /// Lays out a buffer for `config` without allocating anything.
    fn prototype(&self, target: Target, config: &BufferConfiguration) -> Result<NativeBuffer> {
        match target {
            Target::Camera(stream) => self.initialize_camera_output_buffer(stream, config, false),
            Target::Zoom(port) => self.initialize_zoom_output_buffer(port, config, false),
            Target::Host => Err(crate::Error::BadParameter("host buffers have no layout".into())),
        }
    }

    /// Tries to reuse `buffers`, allocated for `original`, under `new` without reallocating.
    ///
    /// Buffers held by the hardware are left alone. Returns true if every other buffer now
    /// describes `new`. On false, buffers updated before the failure keep their new geometry.
    pub fn repurpose_buffers(
        &self,
        location: OutputLocation,
        original: &BufferConfiguration,
        new: &BufferConfiguration,
        buffers: &mut [PooledBuffer],
    ) -> bool {
        let target = self.target(location);
        match target {
            Target::Zoom(port) if !self.config.platform.zoom_buffers_repurposable(port) => {
                log::debug!("Zoom {:?} buffers are owned externally, not repurposing", port);
                return false;
            }
            Target::Host => return false,
            _ => (),
        }

        if buffers.is_empty() {
            return false;
        }

        if original.in_shared_memory != new.in_shared_memory
            || original.format.pixel_format != new.format.pixel_format
        {
            log::debug!("Buffer memory or format changed, not repurposing");
            return false;
        }

        let (original_proto, new_proto) =
            match (self.prototype(target, original), self.prototype(target, new)) {
                (Ok(original), Ok(new)) => (original, new),
                _ => return false,
            };

        let old_luma = &original_proto.planes[Y_PLANE].surface;
        let new_luma = &new_proto.planes[Y_PLANE].surface;
        let old_bytes = u64::from(old_luma.pitch) * u64::from(old_luma.height);
        let new_bytes = u64::from(new_luma.pitch) * u64::from(new_luma.height);
        if new_bytes > old_bytes {
            log::debug!("New configuration needs {} bytes, buffers hold {}", new_bytes, old_bytes);
            return false;
        }

        for pooled in buffers.iter_mut().filter(|pooled| !pooled.in_use) {
            if let Err(err) = update_geometry(&mut pooled.buffer, &new_proto) {
                log::error!("Failed to repurpose buffer {:?}: {}", pooled.buffer.id, err);
                return false;
            }
        }

        true
    }
}

/// Gives `buffer` the plane geometry and crop of `prototype`, keeping its memory.
fn update_geometry(
    buffer: &mut NativeBuffer,
    prototype: &NativeBuffer,
) -> std::result::Result<(), PlaneCountMismatch> {
    if buffer.num_planes() != prototype.num_planes() {
        return Err(PlaneCountMismatch {
            actual: buffer.num_planes(),
            expected: prototype.num_planes(),
        });
    }

    for (plane, proto) in buffer.planes.iter_mut().zip(&prototype.planes) {
        plane.surface = proto.surface.clone();
    }
    buffer.crop = prototype.crop;

    Ok(())
}
