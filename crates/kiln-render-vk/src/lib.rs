// SPDX-License-Identifier: CEPL-1.0
//! Vulkan presentation core: swapchain lifecycle, per-image framebuffers and
//! a frames-in-flight scheduler, plus the [`VkRenderer`] that drives them for
//! a window.
use std::sync::Arc;

use anyhow::{Context, Result};
use kiln_render::{PresentPreference, RenderSize, Renderer, ResizeFlag, SurfaceProvider};
use tracing::{debug, info};

mod chain;
mod context;
mod device;
mod error;
mod frame;
mod scheduler;
mod targets;
#[cfg(test)]
mod testing;
mod vk_device;

pub use chain::{
    choose_extent, choose_image_count, choose_present_mode, choose_surface_format, Acquired,
    PresentStatus, PresentationChain, PREFERRED_FORMATS,
};
pub use context::DeviceContext;
pub use device::{RenderDevice, SurfaceSupport, SwapchainDesc};
pub use error::{FrameError, FrameStage, SetupError};
pub use frame::{create_slots, FrameSlot, FRAMES_IN_FLIGHT};
pub use scheduler::{FrameBegin, FrameScheduler, FrameStatus};
pub use targets::{pick_depth_format, FramebufferSet, RenderPass, DEPTH_CANDIDATES};
pub use vk_device::VkDevice;

/// Clears the window every frame through a [`FrameScheduler`].
///
/// The scheduler is built lazily: a window that starts minimized gets one on
/// the first frame it has area.
pub struct VkRenderer {
    // Dropped first: the scheduler's objects belong to `device`.
    scheduler: Option<FrameScheduler<VkDevice>>,
    device: Arc<VkDevice>,
    present: PresentPreference,
    resize: ResizeFlag,
    clear: [f32; 4],
}

impl VkRenderer {
    fn scheduler(&mut self) -> Result<Option<&mut FrameScheduler<VkDevice>>> {
        if self.scheduler.is_none() && !self.device.drawable_size().is_empty() {
            match FrameScheduler::new(self.device.clone(), self.present, self.resize.clone()) {
                Ok(mut scheduler) => {
                    scheduler.set_clear_color(self.clear);
                    self.scheduler = Some(scheduler);
                }
                Err(SetupError::NotReady) => debug!("surface not ready, deferring swapchain"),
                Err(e) => return Err(e).context("frame scheduler setup"),
            }
        }
        Ok(self.scheduler.as_mut())
    }
}

impl Renderer for VkRenderer {
    fn new(surface: Arc<dyn SurfaceProvider>, present: PresentPreference) -> Result<Self> {
        let ctx = DeviceContext::new(&*surface).context("Vulkan device bring-up")?;
        let device = Arc::new(VkDevice::new(ctx, surface));

        let mut renderer = Self {
            scheduler: None,
            device,
            present,
            resize: ResizeFlag::new(),
            clear: [0.02, 0.02, 0.04, 1.0],
        };
        if renderer.scheduler()?.is_none() {
            info!("window has no drawable area yet, swapchain deferred");
        }
        Ok(renderer)
    }

    fn resize(&mut self, size: RenderSize) {
        debug!("resize requested: {}x{}", size.width, size.height);
        self.resize.raise();
    }

    fn render(&mut self) -> Result<bool> {
        let Some(scheduler) = self.scheduler()? else {
            return Ok(false);
        };
        // No draw calls yet: the render pass clear is the whole frame.
        scheduler.begin_frame()?;
        let status = scheduler.end_frame()?;
        Ok(status != FrameStatus::Skipped)
    }

    fn set_clear_color(&mut self, rgba: [f32; 4]) {
        self.clear = rgba;
        if let Some(scheduler) = self.scheduler.as_mut() {
            scheduler.set_clear_color(rgba);
        }
    }

    fn set_present_preference(&mut self, present: PresentPreference) {
        self.present = present;
        if let Some(scheduler) = self.scheduler.as_mut() {
            scheduler.set_present_preference(present);
        }
    }
}
