// SPDX-License-Identifier: CEPL-1.0
//! The narrow set of device operations the frame core drives.
//!
//! `PresentationChain`, `FramebufferSet`, `FrameSlot` and `FrameScheduler` only
//! talk to the GPU through [`RenderDevice`]. `VkDevice` implements it on top of
//! a real `DeviceContext`; tests implement it with a recording stub.
use ash::prelude::VkResult;
use ash::vk;
use kiln_render::RenderSize;

/// Everything the surface reports about what it can present.
#[derive(Clone, Debug, Default)]
pub struct SurfaceSupport {
    /// Whether the present queue family can present to this surface.
    pub present_supported: bool,
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

/// Resolved swapchain parameters, after the selection policies have run.
#[derive(Clone, Copy, Debug)]
pub struct SwapchainDesc {
    pub image_count: u32,
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    pub old_swapchain: vk::SwapchainKHR,
}

pub trait RenderDevice {
    /// Memory backing an image created by [`RenderDevice::create_depth_image`].
    type Allocation;

    // --- surface ---
    fn drawable_size(&self) -> RenderSize;
    fn surface_support(&self) -> VkResult<SurfaceSupport>;

    // --- swapchain ---
    fn create_swapchain(&self, desc: &SwapchainDesc) -> VkResult<vk::SwapchainKHR>;
    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>>;
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);
    /// Blocks without timeout. `Ok((index, suboptimal))` on success.
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        signal: vk::Semaphore,
        fence: vk::Fence,
    ) -> VkResult<(u32, bool)>;
    /// Presents on the present queue. `Ok(true)` means suboptimal.
    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> VkResult<bool>;

    // --- synchronization ---
    fn create_semaphore(&self) -> VkResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    /// Blocks without timeout until `fence` is signaled.
    fn wait_for_fence(&self, fence: vk::Fence) -> VkResult<()>;
    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()>;
    fn wait_idle(&self) -> VkResult<()>;

    // --- commands ---
    fn allocate_command_buffer(&self) -> VkResult<vk::CommandBuffer>;
    fn free_command_buffer(&self, cmd: vk::CommandBuffer);
    /// Resets `cmd` and begins a one-time-submit recording.
    fn begin_commands(&self, cmd: vk::CommandBuffer) -> VkResult<()>;
    fn end_commands(&self, cmd: vk::CommandBuffer) -> VkResult<()>;
    fn begin_render_pass(
        &self,
        cmd: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear: &[vk::ClearValue],
    );
    fn end_render_pass(&self, cmd: vk::CommandBuffer);
    /// Graphics-queue submit: waits on `wait` at color-attachment output,
    /// signals `signal`, and signals `fence` on completion.
    fn submit(
        &self,
        cmd: vk::CommandBuffer,
        wait: vk::Semaphore,
        signal: vk::Semaphore,
        fence: vk::Fence,
    ) -> VkResult<()>;

    // --- render targets ---
    /// First candidate whose tiling features contain `features`, or
    /// `vk::Format::UNDEFINED`.
    fn find_supported_format(
        &self,
        candidates: &[vk::Format],
        tiling: vk::ImageTiling,
        features: vk::FormatFeatureFlags,
    ) -> vk::Format;
    fn create_render_pass(&self, color: vk::Format, depth: vk::Format)
        -> VkResult<vk::RenderPass>;
    fn destroy_render_pass(&self, render_pass: vk::RenderPass);
    fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    ) -> VkResult<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);
    fn create_depth_image(
        &self,
        extent: vk::Extent2D,
        format: vk::Format,
    ) -> VkResult<(vk::Image, Self::Allocation)>;
    fn destroy_depth_image(&self, image: vk::Image, allocation: Self::Allocation);
    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> VkResult<vk::Framebuffer>;
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);
}
