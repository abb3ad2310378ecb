// SPDX-License-Identifier: CEPL-1.0
//! Render pass plus the per-image framebuffers that depend on the chain.
use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::chain::PresentationChain;
use crate::device::RenderDevice;
use crate::error::SetupError;

/// Depth formats tried in order; the first with optimal-tiling attachment
/// support wins.
pub const DEPTH_CANDIDATES: [vk::Format; 4] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
    vk::Format::D16_UNORM,
];

pub fn pick_depth_format<D: RenderDevice>(device: &D) -> Result<vk::Format, SetupError> {
    let format = device.find_supported_format(
        &DEPTH_CANDIDATES,
        vk::ImageTiling::OPTIMAL,
        vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
    );
    if format == vk::Format::UNDEFINED {
        return Err(SetupError::Unsupported(
            "no depth attachment format supported".into(),
        ));
    }
    Ok(format)
}

/// Single-subpass pass: color cleared and handed to present, depth cleared
/// and discarded.
pub struct RenderPass<D: RenderDevice> {
    device: Arc<D>,
    handle: vk::RenderPass,
    color_format: vk::Format,
    depth_format: vk::Format,
}

impl<D: RenderDevice> RenderPass<D> {
    pub fn new(
        device: Arc<D>,
        color_format: vk::Format,
        depth_format: vk::Format,
    ) -> Result<Self, SetupError> {
        let handle = device
            .create_render_pass(color_format, depth_format)
            .map_err(SetupError::vk("create_render_pass"))?;
        debug!("render pass created for {color_format:?} + {depth_format:?}");
        Ok(Self {
            device,
            handle,
            color_format,
            depth_format,
        })
    }

    pub fn handle(&self) -> vk::RenderPass {
        self.handle
    }

    pub fn color_format(&self) -> vk::Format {
        self.color_format
    }

    pub fn depth_format(&self) -> vk::Format {
        self.depth_format
    }
}

impl<D: RenderDevice> Drop for RenderPass<D> {
    fn drop(&mut self) {
        self.device.destroy_render_pass(self.handle);
    }
}

/// One framebuffer per drawable image, all sharing a single depth attachment.
pub struct FramebufferSet<D: RenderDevice> {
    device: Arc<D>,
    depth_image: vk::Image,
    depth_allocation: Option<D::Allocation>,
    depth_view: vk::ImageView,
    views: Vec<vk::ImageView>,
    framebuffers: Vec<vk::Framebuffer>,
    extent: vk::Extent2D,
}

impl<D: RenderDevice> FramebufferSet<D> {
    pub fn build(
        device: Arc<D>,
        pass: &RenderPass<D>,
        chain: &PresentationChain<D>,
    ) -> Result<Self, SetupError> {
        let mut set = Self {
            device,
            depth_image: vk::Image::null(),
            depth_allocation: None,
            depth_view: vk::ImageView::null(),
            views: Vec::new(),
            framebuffers: Vec::new(),
            extent: vk::Extent2D::default(),
        };
        set.populate(pass, chain)?;
        Ok(set)
    }

    /// Destroys every framebuffer of the previous chain (after the device is
    /// idle) and builds new ones for `chain`.
    pub fn rebuild(
        &mut self,
        pass: &RenderPass<D>,
        chain: &PresentationChain<D>,
    ) -> Result<(), SetupError> {
        self.device
            .wait_idle()
            .map_err(SetupError::vk("device_wait_idle"))?;
        self.release();
        self.populate(pass, chain)
    }

    fn populate(
        &mut self,
        pass: &RenderPass<D>,
        chain: &PresentationChain<D>,
    ) -> Result<(), SetupError> {
        let extent = chain.extent();
        let (image, allocation) = self
            .device
            .create_depth_image(extent, pass.depth_format())
            .map_err(SetupError::vk("create depth image"))?;
        self.depth_image = image;
        self.depth_allocation = Some(allocation);
        self.depth_view = self
            .device
            .create_image_view(image, pass.depth_format(), vk::ImageAspectFlags::DEPTH)
            .map_err(SetupError::vk("create depth view"))?;

        self.views.reserve(chain.images().len());
        self.framebuffers.reserve(chain.images().len());
        for &image in chain.images() {
            let view = self
                .device
                .create_image_view(image, chain.format(), vk::ImageAspectFlags::COLOR)
                .map_err(SetupError::vk("create swapchain image view"))?;
            self.views.push(view);

            let framebuffer = self
                .device
                .create_framebuffer(pass.handle(), &[view, self.depth_view], extent)
                .map_err(SetupError::vk("create_framebuffer"))?;
            self.framebuffers.push(framebuffer);
        }

        self.extent = extent;
        debug!(
            "built {} framebuffers at {}x{}",
            self.framebuffers.len(),
            extent.width,
            extent.height
        );
        Ok(())
    }

    // Framebuffers before the views they bind, depth view before its image.
    fn release(&mut self) {
        for framebuffer in self.framebuffers.drain(..) {
            self.device.destroy_framebuffer(framebuffer);
        }
        for view in self.views.drain(..) {
            self.device.destroy_image_view(view);
        }
        if self.depth_view != vk::ImageView::null() {
            self.device.destroy_image_view(self.depth_view);
            self.depth_view = vk::ImageView::null();
        }
        if let Some(allocation) = self.depth_allocation.take() {
            self.device.destroy_depth_image(self.depth_image, allocation);
            self.depth_image = vk::Image::null();
        }
    }

    pub fn get(&self, image_index: u32) -> Option<vk::Framebuffer> {
        self.framebuffers.get(image_index as usize).copied()
    }

    pub fn len(&self) -> usize {
        self.framebuffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.framebuffers.is_empty()
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

impl<D: RenderDevice> Drop for FramebufferSet<D> {
    fn drop(&mut self) {
        self.release();
    }
}
