// SPDX-License-Identifier: CEPL-1.0
//! Recording stand-in for a GPU, shared by the unit tests.
//!
//! Every call is appended to an ordered log. Fences are real blocking
//! primitives (`Mutex` + `Condvar`) so tests can model a slow GPU by leaving
//! submissions incomplete and signaling them from another thread.
use std::collections::{HashMap, HashSet};
use std::sync::{Condvar, Mutex, MutexGuard};

use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use kiln_render::RenderSize;

use crate::device::{RenderDevice, SurfaceSupport, SwapchainDesc};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    CreateSwapchain { image_count: u32, extent: (u32, u32) },
    DestroySwapchain(vk::SwapchainKHR),
    Acquire { image_index: Option<u32> },
    Present { image_index: u32 },
    WaitFence(vk::Fence),
    GpuSignal(vk::Fence),
    ResetFence(vk::Fence),
    WaitIdle,
    BeginCommands(vk::CommandBuffer),
    EndCommands(vk::CommandBuffer),
    BeginRenderPass { framebuffer: vk::Framebuffer, extent: (u32, u32) },
    EndRenderPass,
    Submit { cmd: vk::CommandBuffer, fence: vk::Fence },
    CreateRenderPass(vk::Format),
    CreateFramebuffer { framebuffer: vk::Framebuffer, extent: (u32, u32) },
    DestroyFramebuffer(vk::Framebuffer),
}

#[derive(Clone, Copy, Debug)]
pub enum Scripted {
    OutOfDate,
    Suboptimal,
    Fail(vk::Result),
}

struct StubState {
    next_handle: u64,
    live: HashSet<u64>,
    drawable: RenderSize,
    support: SurfaceSupport,
    depth_format: vk::Format,
    gpu_auto_complete: bool,
    fences: HashMap<vk::Fence, bool>,
    pending: HashMap<vk::CommandBuffer, vk::Fence>,
    reset_while_pending: usize,
    swapchains: HashMap<vk::SwapchainKHR, Vec<vk::Image>>,
    next_image: u32,
    acquire_calls: usize,
    acquire_script: HashMap<usize, Scripted>,
    present_calls: usize,
    present_script: HashMap<usize, Scripted>,
    submit_error: Option<vk::Result>,
    wait_idle_error: Option<vk::Result>,
    log: Vec<Call>,
}

impl StubState {
    fn handle<H: Handle>(&mut self) -> H {
        self.next_handle += 1;
        self.live.insert(self.next_handle);
        H::from_raw(self.next_handle)
    }

    fn release<H: Handle>(&mut self, handle: H) {
        self.live.remove(&handle.as_raw());
    }
}

pub struct StubDevice {
    state: Mutex<StubState>,
    fence_cv: Condvar,
}

pub fn extent(width: u32, height: u32) -> vk::Extent2D {
    vk::Extent2D { width, height }
}

/// Surface capabilities with a fixed current extent.
pub fn capabilities(min_images: u32, max_images: u32, size: vk::Extent2D) -> vk::SurfaceCapabilitiesKHR {
    vk::SurfaceCapabilitiesKHR {
        min_image_count: min_images,
        max_image_count: max_images,
        current_extent: size,
        min_image_extent: extent(1, 1),
        max_image_extent: extent(16384, 16384),
        supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
        current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
        ..Default::default()
    }
}

pub fn srgb(format: vk::Format) -> vk::SurfaceFormatKHR {
    vk::SurfaceFormatKHR {
        format,
        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
    }
}

impl StubDevice {
    /// A 800x600 surface whose chain resolves to `image_count` images.
    pub fn new(image_count: u32) -> Self {
        let size = extent(800, 600);
        let support = SurfaceSupport {
            present_supported: true,
            capabilities: capabilities(image_count - 1, 8, size),
            formats: vec![
                srgb(vk::Format::B8G8R8A8_UNORM),
                srgb(vk::Format::B8G8R8A8_SRGB),
            ],
            present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
        };
        Self {
            state: Mutex::new(StubState {
                next_handle: 0,
                live: HashSet::new(),
                drawable: RenderSize::new(size.width, size.height),
                support,
                depth_format: vk::Format::D32_SFLOAT,
                gpu_auto_complete: true,
                fences: HashMap::new(),
                pending: HashMap::new(),
                reset_while_pending: 0,
                swapchains: HashMap::new(),
                next_image: 0,
                acquire_calls: 0,
                acquire_script: HashMap::new(),
                present_calls: 0,
                present_script: HashMap::new(),
                submit_error: None,
                wait_idle_error: None,
                log: Vec::new(),
            }),
            fence_cv: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StubState> {
        self.state.lock().unwrap()
    }

    /// Changes both the window size and the surface's reported extent, and
    /// the image count the next swapchain will get.
    pub fn resize_surface(&self, width: u32, height: u32, image_count: u32) {
        let mut st = self.lock();
        st.drawable = RenderSize::new(width, height);
        st.support.capabilities = capabilities(image_count.saturating_sub(1), 8, extent(width, height));
    }

    pub fn set_drawable(&self, size: RenderSize) {
        self.lock().drawable = size;
    }

    pub fn set_support(&self, support: SurfaceSupport) {
        self.lock().support = support;
    }

    pub fn set_depth_format(&self, format: vk::Format) {
        self.lock().depth_format = format;
    }

    /// When false, submissions stay in flight until [`StubDevice::complete`].
    pub fn set_gpu_auto_complete(&self, on: bool) {
        self.lock().gpu_auto_complete = on;
    }

    /// Scripts the outcome of the `call`-th acquire (1-based).
    pub fn script_acquire(&self, call: usize, outcome: Scripted) {
        self.lock().acquire_script.insert(call, outcome);
    }

    /// Scripts the outcome of the `call`-th present (1-based).
    pub fn script_present(&self, call: usize, outcome: Scripted) {
        self.lock().present_script.insert(call, outcome);
    }

    pub fn fail_submit(&self, result: vk::Result) {
        self.lock().submit_error = Some(result);
    }

    pub fn fail_wait_idle(&self, result: Option<vk::Result>) {
        self.lock().wait_idle_error = result;
    }

    /// GPU finishes the work that signals `fence`.
    pub fn complete(&self, fence: vk::Fence) {
        let mut st = self.lock();
        st.fences.insert(fence, true);
        st.pending.retain(|_, f| *f != fence);
        st.log.push(Call::GpuSignal(fence));
        drop(st);
        self.fence_cv.notify_all();
    }

    pub fn is_signaled(&self, fence: vk::Fence) -> bool {
        self.lock().fences.get(&fence).copied().unwrap_or(false)
    }

    pub fn log(&self) -> Vec<Call> {
        self.lock().log.clone()
    }

    pub fn clear_log(&self) {
        self.lock().log.clear();
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.lock().log.iter().filter(|c| pred(c)).count()
    }

    /// Command buffers re-recorded while their previous submission was still
    /// executing.
    pub fn reset_while_pending(&self) -> usize {
        self.lock().reset_while_pending
    }

    pub fn live_objects(&self) -> usize {
        self.lock().live.len()
    }

    pub fn swapchain_count(&self) -> usize {
        self.lock().swapchains.len()
    }
}

fn scripted_error(outcome: Scripted) -> vk::Result {
    match outcome {
        Scripted::OutOfDate => vk::Result::ERROR_OUT_OF_DATE_KHR,
        Scripted::Suboptimal => vk::Result::SUBOPTIMAL_KHR,
        Scripted::Fail(result) => result,
    }
}

impl RenderDevice for StubDevice {
    type Allocation = ();

    fn drawable_size(&self) -> RenderSize {
        self.lock().drawable
    }

    fn surface_support(&self) -> VkResult<SurfaceSupport> {
        Ok(self.lock().support.clone())
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> VkResult<vk::SwapchainKHR> {
        let mut st = self.lock();
        let swapchain: vk::SwapchainKHR = st.handle();
        let images: Vec<vk::Image> = (0..desc.image_count).map(|_| st.handle()).collect();
        st.swapchains.insert(swapchain, images);
        st.next_image = 0;
        st.log.push(Call::CreateSwapchain {
            image_count: desc.image_count,
            extent: (desc.extent.width, desc.extent.height),
        });
        Ok(swapchain)
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        self.lock()
            .swapchains
            .get(&swapchain)
            .cloned()
            .ok_or(vk::Result::ERROR_SURFACE_LOST_KHR)
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut st = self.lock();
        if let Some(images) = st.swapchains.remove(&swapchain) {
            for image in images {
                st.release(image);
            }
        }
        st.release(swapchain);
        st.log.push(Call::DestroySwapchain(swapchain));
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _signal: vk::Semaphore,
        _fence: vk::Fence,
    ) -> VkResult<(u32, bool)> {
        let mut st = self.lock();
        st.acquire_calls += 1;
        let call = st.acquire_calls;
        let suboptimal = match st.acquire_script.get(&call).copied() {
            None => false,
            Some(Scripted::Suboptimal) => true,
            Some(other) => {
                st.log.push(Call::Acquire { image_index: None });
                return Err(scripted_error(other));
            }
        };
        let count = st.swapchains.get(&swapchain).map_or(0, |i| i.len() as u32);
        if count == 0 {
            return Err(vk::Result::ERROR_SURFACE_LOST_KHR);
        }
        let index = st.next_image % count;
        st.next_image += 1;
        st.log.push(Call::Acquire { image_index: Some(index) });
        Ok((index, suboptimal))
    }

    fn queue_present(
        &self,
        _swapchain: vk::SwapchainKHR,
        image_index: u32,
        _wait: vk::Semaphore,
    ) -> VkResult<bool> {
        let mut st = self.lock();
        st.present_calls += 1;
        let call = st.present_calls;
        st.log.push(Call::Present { image_index });
        match st.present_script.get(&call).copied() {
            None => Ok(false),
            Some(Scripted::Suboptimal) => Ok(true),
            Some(other) => Err(scripted_error(other)),
        }
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        Ok(self.lock().handle())
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.lock().release(semaphore);
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let mut st = self.lock();
        let fence = st.handle();
        st.fences.insert(fence, signaled);
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut st = self.lock();
        st.fences.remove(&fence);
        st.release(fence);
    }

    fn wait_for_fence(&self, fence: vk::Fence) -> VkResult<()> {
        let mut st = self.lock();
        st.log.push(Call::WaitFence(fence));
        let _st = self
            .fence_cv
            .wait_while(st, |s| !s.fences.get(&fence).copied().unwrap_or(true))
            .unwrap();
        Ok(())
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        let mut st = self.lock();
        st.fences.insert(fence, false);
        st.log.push(Call::ResetFence(fence));
        Ok(())
    }

    fn wait_idle(&self) -> VkResult<()> {
        let mut st = self.lock();
        st.log.push(Call::WaitIdle);
        st.wait_idle_error.map_or(Ok(()), Err)
    }

    fn allocate_command_buffer(&self) -> VkResult<vk::CommandBuffer> {
        Ok(self.lock().handle())
    }

    fn free_command_buffer(&self, cmd: vk::CommandBuffer) {
        self.lock().release(cmd);
    }

    fn begin_commands(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        let mut st = self.lock();
        if st.pending.contains_key(&cmd) {
            st.reset_while_pending += 1;
        }
        st.log.push(Call::BeginCommands(cmd));
        Ok(())
    }

    fn end_commands(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        self.lock().log.push(Call::EndCommands(cmd));
        Ok(())
    }

    fn begin_render_pass(
        &self,
        _cmd: vk::CommandBuffer,
        _render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        _clear: &[vk::ClearValue],
    ) {
        self.lock().log.push(Call::BeginRenderPass {
            framebuffer,
            extent: (extent.width, extent.height),
        });
    }

    fn end_render_pass(&self, _cmd: vk::CommandBuffer) {
        self.lock().log.push(Call::EndRenderPass);
    }

    fn submit(
        &self,
        cmd: vk::CommandBuffer,
        _wait: vk::Semaphore,
        _signal: vk::Semaphore,
        fence: vk::Fence,
    ) -> VkResult<()> {
        let mut st = self.lock();
        if let Some(result) = st.submit_error {
            return Err(result);
        }
        st.log.push(Call::Submit { cmd, fence });
        if st.gpu_auto_complete {
            st.fences.insert(fence, true);
        } else {
            st.pending.insert(cmd, fence);
        }
        drop(st);
        self.fence_cv.notify_all();
        Ok(())
    }

    fn find_supported_format(
        &self,
        _candidates: &[vk::Format],
        _tiling: vk::ImageTiling,
        _features: vk::FormatFeatureFlags,
    ) -> vk::Format {
        self.lock().depth_format
    }

    fn create_render_pass(&self, color: vk::Format, _depth: vk::Format) -> VkResult<vk::RenderPass> {
        let mut st = self.lock();
        st.log.push(Call::CreateRenderPass(color));
        Ok(st.handle())
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        self.lock().release(render_pass);
    }

    fn create_image_view(
        &self,
        _image: vk::Image,
        _format: vk::Format,
        _aspect: vk::ImageAspectFlags,
    ) -> VkResult<vk::ImageView> {
        Ok(self.lock().handle())
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.lock().release(view);
    }

    fn create_depth_image(
        &self,
        _extent: vk::Extent2D,
        _format: vk::Format,
    ) -> VkResult<(vk::Image, ())> {
        Ok((self.lock().handle(), ()))
    }

    fn destroy_depth_image(&self, image: vk::Image, _allocation: ()) {
        self.lock().release(image);
    }

    fn create_framebuffer(
        &self,
        _render_pass: vk::RenderPass,
        _attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> VkResult<vk::Framebuffer> {
        let mut st = self.lock();
        let framebuffer = st.handle();
        st.log.push(Call::CreateFramebuffer {
            framebuffer,
            extent: (extent.width, extent.height),
        });
        Ok(framebuffer)
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        let mut st = self.lock();
        st.release(framebuffer);
        st.log.push(Call::DestroyFramebuffer(framebuffer));
    }
}
