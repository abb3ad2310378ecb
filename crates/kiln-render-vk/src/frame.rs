// SPDX-License-Identifier: CEPL-1.0
//! Per-slot resources for frames in flight.
use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::device::RenderDevice;
use crate::error::SetupError;

/// How many frames the CPU may record ahead of the GPU. Independent of the
/// number of drawable images.
pub const FRAMES_IN_FLIGHT: usize = 2;

/// One rotation unit: a command buffer plus the objects that order its use.
///
/// ```text
/// wait in_flight -> acquire (signals image_available) -> reset + record
///   -> submit (waits image_available, signals render_finished + in_flight)
///   -> present (waits render_finished)
/// ```
///
/// The command buffer is only touched between a completed wait on
/// `in_flight` and the next submission.
pub struct FrameSlot<D: RenderDevice> {
    device: Arc<D>,
    command_buffer: vk::CommandBuffer,
    image_available: vk::Semaphore,
    render_finished: vk::Semaphore,
    in_flight: vk::Fence,
}

impl<D: RenderDevice> FrameSlot<D> {
    pub fn new(device: Arc<D>) -> Result<Self, SetupError> {
        // Null handles are skipped on drop, so a partial build cleans up.
        let mut slot = Self {
            device,
            command_buffer: vk::CommandBuffer::null(),
            image_available: vk::Semaphore::null(),
            render_finished: vk::Semaphore::null(),
            in_flight: vk::Fence::null(),
        };
        slot.command_buffer = slot
            .device
            .allocate_command_buffer()
            .map_err(SetupError::vk("allocate_command_buffers"))?;
        slot.image_available = slot
            .device
            .create_semaphore()
            .map_err(SetupError::vk("create_semaphore(image available)"))?;
        slot.render_finished = slot
            .device
            .create_semaphore()
            .map_err(SetupError::vk("create_semaphore(render finished)"))?;
        // Signaled, so the first wait on a fresh slot returns immediately.
        slot.in_flight = slot
            .device
            .create_fence(true)
            .map_err(SetupError::vk("create_fence(in flight)"))?;
        Ok(slot)
    }

    #[inline]
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    #[inline]
    pub fn image_available(&self) -> vk::Semaphore {
        self.image_available
    }

    #[inline]
    pub fn render_finished(&self) -> vk::Semaphore {
        self.render_finished
    }

    #[inline]
    pub fn in_flight(&self) -> vk::Fence {
        self.in_flight
    }
}

impl<D: RenderDevice> Drop for FrameSlot<D> {
    fn drop(&mut self) {
        if self.in_flight != vk::Fence::null() {
            self.device.destroy_fence(self.in_flight);
        }
        if self.render_finished != vk::Semaphore::null() {
            self.device.destroy_semaphore(self.render_finished);
        }
        if self.image_available != vk::Semaphore::null() {
            self.device.destroy_semaphore(self.image_available);
        }
        if self.command_buffer != vk::CommandBuffer::null() {
            self.device.free_command_buffer(self.command_buffer);
        }
    }
}

/// Builds the fixed pool. Sized by `FRAMES_IN_FLIGHT`, never by image count.
pub fn create_slots<D: RenderDevice>(
    device: &Arc<D>,
) -> Result<[FrameSlot<D>; FRAMES_IN_FLIGHT], SetupError> {
    let mut slots = Vec::with_capacity(FRAMES_IN_FLIGHT);
    for _ in 0..FRAMES_IN_FLIGHT {
        slots.push(FrameSlot::new(device.clone())?);
    }
    debug!("created {FRAMES_IN_FLIGHT} frame slots");
    match slots.try_into() {
        Ok(slots) => Ok(slots),
        Err(_) => unreachable!("pool holds exactly FRAMES_IN_FLIGHT slots"),
    }
}
