// SPDX-License-Identifier: CEPL-1.0
//! The presentation chain: the swapchain bound to our surface, its drawable
//! images, and the policies that pick format, present mode, extent and image
//! count each time it is (re)built.
use std::sync::Arc;

use ash::vk;
use kiln_render::{PresentPreference, RenderSize};
use tracing::{debug, info};

use crate::device::{RenderDevice, SurfaceSupport, SwapchainDesc};
use crate::error::{FrameError, FrameStage, SetupError};

/// Formats tried in order before falling back to whatever the surface lists first.
pub const PREFERRED_FORMATS: [vk::Format; 2] = [vk::Format::B8G8R8A8_SRGB, vk::Format::R8G8B8A8_SRGB];

/// Result of asking the chain for the next drawable image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acquired {
    /// `suboptimal` images are still presentable, but the chain should be
    /// rebuilt at the next convenient point.
    Image { index: u32, suboptimal: bool },
    /// The chain was out of date and has been rebuilt. No image was acquired
    /// and the semaphore was not signaled.
    Stale,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentStatus {
    Presented,
    Suboptimal,
    OutOfDate,
}

pub struct PresentationChain<D: RenderDevice> {
    device: Arc<D>,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    surface_format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
    preference: PresentPreference,
    generation: u64,
}

pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    // A lone UNDEFINED entry means the surface takes any format.
    if let [only] = formats {
        if only.format == vk::Format::UNDEFINED {
            return Some(vk::SurfaceFormatKHR {
                format: PREFERRED_FORMATS[0],
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            });
        }
    }

    PREFERRED_FORMATS
        .iter()
        .find_map(|&want| {
            formats.iter().copied().find(|f| {
                f.format == want && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
        })
        .or_else(|| formats.first().copied())
}

pub fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    preference: PresentPreference,
) -> vk::PresentModeKHR {
    let order: &[vk::PresentModeKHR] = match preference {
        PresentPreference::Mailbox => &[vk::PresentModeKHR::MAILBOX],
        PresentPreference::Fifo => &[],
        PresentPreference::Immediate => {
            &[vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::MAILBOX]
        }
    };
    order
        .iter()
        .copied()
        .find(|m| modes.contains(m))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// One more than the minimum, capped by the maximum (0 means "no maximum").
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let want = caps.min_image_count + 1;
    if caps.max_image_count == 0 {
        want
    } else {
        want.min(caps.max_image_count)
    }
}

pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, window: RenderSize) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: window
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: window
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

fn describe(
    support: &SurfaceSupport,
    window: RenderSize,
    preference: PresentPreference,
    old_swapchain: vk::SwapchainKHR,
) -> Result<SwapchainDesc, SetupError> {
    if !support.present_supported {
        return Err(SetupError::Unsupported(
            "present queue family cannot present to this surface".into(),
        ));
    }
    let surface_format = choose_surface_format(&support.formats)
        .ok_or_else(|| SetupError::Unsupported("surface reports no formats".into()))?;
    if support.present_modes.is_empty() {
        return Err(SetupError::Unsupported(
            "surface reports no present modes".into(),
        ));
    }

    let caps = &support.capabilities;
    let extent = choose_extent(caps, window);
    if extent.width == 0 || extent.height == 0 {
        return Err(SetupError::NotReady);
    }

    let pre_transform = if caps
        .supported_transforms
        .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
    {
        vk::SurfaceTransformFlagsKHR::IDENTITY
    } else {
        caps.current_transform
    };

    Ok(SwapchainDesc {
        image_count: choose_image_count(caps),
        surface_format,
        present_mode: choose_present_mode(&support.present_modes, preference),
        extent,
        pre_transform,
        old_swapchain,
    })
}

fn resolve<D: RenderDevice>(
    device: &D,
    preference: PresentPreference,
    old_swapchain: vk::SwapchainKHR,
) -> Result<SwapchainDesc, SetupError> {
    let support = device
        .surface_support()
        .map_err(SetupError::vk("query surface support"))?;
    describe(&support, device.drawable_size(), preference, old_swapchain)
}

impl<D: RenderDevice> PresentationChain<D> {
    /// Builds the first swapchain for the device's surface.
    ///
    /// Returns [`SetupError::NotReady`] while the surface has no area; callers
    /// should retry once the window is visible again.
    pub fn create(device: Arc<D>, preference: PresentPreference) -> Result<Self, SetupError> {
        let desc = resolve(&*device, preference, vk::SwapchainKHR::null())?;
        let swapchain = device
            .create_swapchain(&desc)
            .map_err(SetupError::vk("create_swapchain"))?;

        let mut chain = Self {
            device,
            swapchain,
            images: Vec::new(),
            surface_format: desc.surface_format,
            present_mode: desc.present_mode,
            extent: desc.extent,
            preference,
            generation: 0,
        };
        chain.images = chain
            .device
            .swapchain_images(swapchain)
            .map_err(SetupError::vk("get_swapchain_images"))?;
        chain.log_built(&desc);
        Ok(chain)
    }

    /// Rebuilds the swapchain against the surface's current state.
    ///
    /// Returns `Ok(false)` and changes nothing when the surface has no area.
    pub fn recreate(&mut self) -> Result<bool, SetupError> {
        if self.device.drawable_size().is_empty() {
            info!("presentation chain: drawable area is 0x0, keeping current swapchain");
            return Ok(false);
        }
        let desc = match resolve(&*self.device, self.preference, self.swapchain) {
            Err(SetupError::NotReady) => {
                info!("presentation chain: surface extent is 0x0, keeping current swapchain");
                return Ok(false);
            }
            other => other?,
        };

        // STRICT ORDER:
        // 1) device idle, nothing may still reference the old images
        // 2) create the new swapchain handing over the old one
        // 3) destroy the old swapchain, then fetch the new images
        self.device
            .wait_idle()
            .map_err(SetupError::vk("device_wait_idle"))?;
        let swapchain = self
            .device
            .create_swapchain(&desc)
            .map_err(SetupError::vk("create_swapchain"))?;
        let old = std::mem::replace(&mut self.swapchain, swapchain);
        self.device.destroy_swapchain(old);
        self.images.clear();

        let images = self
            .device
            .swapchain_images(swapchain)
            .map_err(SetupError::vk("get_swapchain_images"))?;
        self.images = images;
        self.surface_format = desc.surface_format;
        self.present_mode = desc.present_mode;
        self.extent = desc.extent;
        self.generation += 1;
        self.log_built(&desc);
        Ok(true)
    }

    /// Acquires the next drawable image, signaling `signal` when it is ready.
    /// An out-of-date chain is rebuilt in place and reported as
    /// [`Acquired::Stale`].
    pub fn acquire_next(
        &mut self,
        signal: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<Acquired, FrameError> {
        match self
            .device
            .acquire_next_image(self.swapchain, signal, fence)
        {
            Ok((index, suboptimal)) => Ok(Acquired::Image { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                debug!("acquire: swapchain out of date, recreating");
                self.recreate()?;
                Ok(Acquired::Stale)
            }
            Err(result) => Err(FrameError::Vulkan {
                stage: FrameStage::Acquire,
                result,
            }),
        }
    }

    /// Queues `image_index` for presentation once `wait` is signaled.
    pub fn present(
        &self,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> Result<PresentStatus, FrameError> {
        match self.device.queue_present(self.swapchain, image_index, wait) {
            Ok(false) => Ok(PresentStatus::Presented),
            Ok(true) => Ok(PresentStatus::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentStatus::OutOfDate),
            Err(result) => Err(FrameError::Vulkan {
                stage: FrameStage::Present,
                result,
            }),
        }
    }

    /// Takes effect at the next recreation.
    pub fn set_present_preference(&mut self, preference: PresentPreference) {
        self.preference = preference;
    }

    pub fn present_preference(&self) -> PresentPreference {
        self.preference
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    pub fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn format(&self) -> vk::Format {
        self.surface_format.format
    }

    pub fn color_space(&self) -> vk::ColorSpaceKHR {
        self.surface_format.color_space
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    /// Bumped by every successful recreation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn log_built(&self, desc: &SwapchainDesc) {
        info!(
            "swapchain #{}: format {:?} / {:?}, present_mode {:?} (wanted {:?}), extent {}x{}, images {} (asked {})",
            self.generation,
            self.surface_format.format,
            self.surface_format.color_space,
            self.present_mode,
            self.preference,
            self.extent.width,
            self.extent.height,
            self.images.len(),
            desc.image_count,
        );
    }
}

impl<D: RenderDevice> Drop for PresentationChain<D> {
    fn drop(&mut self) {
        if self.swapchain != vk::SwapchainKHR::null() {
            self.device.destroy_swapchain(self.swapchain);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{capabilities, extent, srgb, Call, Scripted, StubDevice};

    fn chain(device: &Arc<StubDevice>) -> PresentationChain<StubDevice> {
        PresentationChain::create(device.clone(), PresentPreference::Mailbox).unwrap()
    }

    #[test]
    fn prefers_srgb_bgra_then_falls_back_to_first() {
        let formats = [srgb(vk::Format::B8G8R8A8_UNORM), srgb(vk::Format::B8G8R8A8_SRGB)];
        assert_eq!(
            choose_surface_format(&formats).unwrap().format,
            vk::Format::B8G8R8A8_SRGB
        );

        let formats = [srgb(vk::Format::R16G16B16A16_SFLOAT), srgb(vk::Format::A2B10G10R10_UNORM_PACK32)];
        assert_eq!(
            choose_surface_format(&formats).unwrap().format,
            vk::Format::R16G16B16A16_SFLOAT
        );

        let wrong_space = [vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT,
        }];
        assert_eq!(
            choose_surface_format(&wrong_space).unwrap().color_space,
            vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT
        );

        assert!(choose_surface_format(&[]).is_none());
        assert_eq!(
            choose_surface_format(&[srgb(vk::Format::UNDEFINED)]).unwrap().format,
            vk::Format::B8G8R8A8_SRGB
        );
    }

    #[test]
    fn preferred_formats_are_tried_in_order() {
        let formats: Vec<_> = crate::PREFERRED_FORMATS.iter().rev().map(|&f| srgb(f)).collect();
        assert_eq!(
            choose_surface_format(&formats).unwrap().format,
            crate::PREFERRED_FORMATS[0]
        );
        assert_eq!(
            choose_surface_format(&formats[..1]).unwrap().format,
            crate::PREFERRED_FORMATS[1]
        );
    }

    #[test]
    fn present_mode_falls_back_to_fifo() {
        use vk::PresentModeKHR as M;
        let all = [M::FIFO, M::MAILBOX, M::IMMEDIATE];
        let fifo_only = [M::FIFO];

        assert_eq!(choose_present_mode(&all, PresentPreference::Mailbox), M::MAILBOX);
        assert_eq!(choose_present_mode(&fifo_only, PresentPreference::Mailbox), M::FIFO);
        assert_eq!(choose_present_mode(&all, PresentPreference::Fifo), M::FIFO);
        assert_eq!(choose_present_mode(&all, PresentPreference::Immediate), M::IMMEDIATE);
        assert_eq!(
            choose_present_mode(&[M::FIFO, M::MAILBOX], PresentPreference::Immediate),
            M::MAILBOX
        );
        assert_eq!(choose_present_mode(&fifo_only, PresentPreference::Immediate), M::FIFO);
    }

    #[test]
    fn image_count_is_min_plus_one_capped_by_max() {
        let size = extent(640, 480);
        assert_eq!(choose_image_count(&capabilities(2, 8, size)), 3);
        assert_eq!(choose_image_count(&capabilities(2, 0, size)), 3);
        assert_eq!(choose_image_count(&capabilities(3, 3, size)), 3);
    }

    #[test]
    fn undefined_extent_clamps_window_size() {
        let mut caps = capabilities(2, 3, extent(u32::MAX, u32::MAX));
        caps.min_image_extent = extent(64, 64);
        caps.max_image_extent = extent(1920, 1080);

        let got = choose_extent(&caps, RenderSize::new(4000, 10));
        assert_eq!((got.width, got.height), (1920, 64));

        let fixed = capabilities(2, 3, extent(1024, 768));
        let got = choose_extent(&fixed, RenderSize::new(4000, 10));
        assert_eq!((got.width, got.height), (1024, 768));
    }

    #[test]
    fn create_retrieves_one_image_per_count() {
        let device = Arc::new(StubDevice::new(3));
        let chain = chain(&device);
        assert_eq!(chain.image_count(), 3);
        assert_eq!(chain.images().len() as u32, chain.image_count());
        assert_eq!(chain.format(), vk::Format::B8G8R8A8_SRGB);
        assert_eq!(chain.color_space(), vk::ColorSpaceKHR::SRGB_NONLINEAR);
        assert_eq!(chain.present_mode(), vk::PresentModeKHR::MAILBOX);
        assert_eq!((chain.extent().width, chain.extent().height), (800, 600));
    }

    #[test]
    fn create_on_minimized_surface_is_not_ready() {
        let device = Arc::new(StubDevice::new(3));
        device.resize_surface(0, 0, 3);
        let err = PresentationChain::create(device.clone(), PresentPreference::Fifo).err();
        assert!(matches!(err, Some(SetupError::NotReady)));
        assert_eq!(device.live_objects(), 0);
    }

    #[test]
    fn create_rejects_surface_without_present_support() {
        let device = Arc::new(StubDevice::new(3));
        device.set_support(SurfaceSupport {
            present_supported: false,
            ..Default::default()
        });
        let err = PresentationChain::create(device, PresentPreference::Fifo).err();
        assert!(matches!(err, Some(SetupError::Unsupported(_))));
    }

    #[test]
    fn recreate_keeps_images_matching_count() {
        let device = Arc::new(StubDevice::new(3));
        let mut chain = chain(&device);

        device.resize_surface(1280, 720, 4);
        assert!(chain.recreate().unwrap());
        assert_eq!(chain.image_count(), 4);
        assert_eq!(chain.images().len() as u32, chain.image_count());
        assert_eq!((chain.extent().width, chain.extent().height), (1280, 720));
        assert_eq!(chain.generation(), 1);
        // the retired swapchain is gone
        assert_eq!(device.swapchain_count(), 1);

        device.resize_surface(1280, 720, 2);
        assert!(chain.recreate().unwrap());
        assert_eq!(chain.images().len() as u32, chain.image_count());
        assert_eq!(chain.image_count(), 2);
    }

    #[test]
    fn recreate_waits_for_idle_before_replacing() {
        let device = Arc::new(StubDevice::new(3));
        let mut chain = chain(&device);
        let old = chain.handle();
        device.clear_log();

        chain.recreate().unwrap();
        let log = device.log();
        let idle = log.iter().position(|c| *c == Call::WaitIdle).unwrap();
        let create = log
            .iter()
            .position(|c| matches!(c, Call::CreateSwapchain { .. }))
            .unwrap();
        let destroy = log
            .iter()
            .position(|c| *c == Call::DestroySwapchain(old))
            .unwrap();
        assert!(idle < create && create < destroy);
    }

    #[test]
    fn recreate_with_zero_extent_changes_nothing() {
        let device = Arc::new(StubDevice::new(3));
        let mut chain = chain(&device);
        let images = chain.images().to_vec();
        let (ext, count, handle) = (chain.extent(), chain.image_count(), chain.handle());

        device.resize_surface(0, 0, 5);
        device.clear_log();
        assert!(!chain.recreate().unwrap());
        assert!(!chain.recreate().unwrap());

        assert_eq!(chain.images(), images.as_slice());
        assert_eq!((chain.extent().width, chain.extent().height), (ext.width, ext.height));
        assert_eq!(chain.image_count(), count);
        assert_eq!(chain.handle(), handle);
        assert_eq!(chain.generation(), 0);
        assert!(device.log().is_empty());
    }

    #[test]
    fn out_of_date_acquire_recreates_once_and_reports_stale() {
        let device = Arc::new(StubDevice::new(3));
        let mut chain = chain(&device);
        device.script_acquire(1, Scripted::OutOfDate);
        device.clear_log();

        let got = chain
            .acquire_next(vk::Semaphore::null(), vk::Fence::null())
            .unwrap();
        assert_eq!(got, Acquired::Stale);
        assert_eq!(
            device.count(|c| matches!(c, Call::CreateSwapchain { .. })),
            1
        );

        let got = chain
            .acquire_next(vk::Semaphore::null(), vk::Fence::null())
            .unwrap();
        assert_eq!(got, Acquired::Image { index: 0, suboptimal: false });
    }

    #[test]
    fn suboptimal_acquire_is_still_an_image() {
        let device = Arc::new(StubDevice::new(3));
        let mut chain = chain(&device);
        device.script_acquire(1, Scripted::Suboptimal);

        let got = chain
            .acquire_next(vk::Semaphore::null(), vk::Fence::null())
            .unwrap();
        assert_eq!(got, Acquired::Image { index: 0, suboptimal: true });
        assert_eq!(chain.generation(), 0);
    }

    #[test]
    fn other_acquire_errors_are_fatal() {
        let device = Arc::new(StubDevice::new(3));
        let mut chain = chain(&device);
        device.script_acquire(1, Scripted::Fail(vk::Result::ERROR_SURFACE_LOST_KHR));

        let err = chain
            .acquire_next(vk::Semaphore::null(), vk::Fence::null())
            .unwrap_err();
        assert_eq!(err.stage(), FrameStage::Acquire);
    }

    #[test]
    fn present_results_map_to_status() {
        let device = Arc::new(StubDevice::new(3));
        let chain = chain(&device);
        device.script_present(2, Scripted::Suboptimal);
        device.script_present(3, Scripted::OutOfDate);
        device.script_present(4, Scripted::Fail(vk::Result::ERROR_DEVICE_LOST));

        let wait = vk::Semaphore::null();
        assert_eq!(chain.present(0, wait).unwrap(), PresentStatus::Presented);
        assert_eq!(chain.present(1, wait).unwrap(), PresentStatus::Suboptimal);
        assert_eq!(chain.present(2, wait).unwrap(), PresentStatus::OutOfDate);
        assert_eq!(chain.present(0, wait).unwrap_err().stage(), FrameStage::Present);
    }

    #[test]
    fn present_preference_applies_on_recreate() {
        let device = Arc::new(StubDevice::new(3));
        let mut chain = chain(&device);
        chain.set_present_preference(PresentPreference::Fifo);
        assert_eq!(chain.present_mode(), vk::PresentModeKHR::MAILBOX);
        chain.recreate().unwrap();
        assert_eq!(chain.present_mode(), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn drop_destroys_swapchain_and_images() {
        let device = Arc::new(StubDevice::new(3));
        drop(chain(&device));
        assert_eq!(device.live_objects(), 0);
    }
}
