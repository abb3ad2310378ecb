// SPDX-License-Identifier: CEPL-1.0
//! Instance, surface, logical device, queues, command pool and allocator.
//!
//! Built once per window and torn down in strict reverse order. Everything
//! the frame core creates later (swapchains, framebuffers, sync objects) must
//! be gone before this is dropped.
use std::ffi::{c_char, CStr};
use std::mem::ManuallyDrop;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
#[cfg(debug_assertions)]
use ash::ext::debug_utils as ext_debug;
use ash::khr::{surface, swapchain};
use ash::{vk, Entry, Instance};
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use kiln_render::SurfaceProvider;
use raw_window_handle::RawDisplayHandle;
use tracing::{debug, info, warn};

const APP_NAME: &CStr = c"Kiln";
#[cfg(debug_assertions)]
const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

#[cfg(debug_assertions)]
type DebugState = Option<(ext_debug::Instance, vk::DebugUtilsMessengerEXT)>;
#[cfg(not(debug_assertions))]
type DebugState = ();

pub struct DeviceContext {
    // Keeps the loader library mapped for the lifetime of every handle below.
    _entry: Entry,
    instance: Instance,
    debug: DebugState,
    surface_loader: surface::Instance,
    surface: vk::SurfaceKHR,

    physical: vk::PhysicalDevice,
    device: ash::Device,
    graphics_family: u32,
    present_family: u32,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,

    command_pool: vk::CommandPool,
    allocator: ManuallyDrop<Mutex<Allocator>>,
}

#[cfg(debug_assertions)]
unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut std::os::raw::c_void,
) -> vk::Bool32 {
    if data.is_null() || (*data).p_message.is_null() {
        return vk::FALSE;
    }
    let msg = CStr::from_ptr((*data).p_message).to_string_lossy();
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        tracing::error!(target: "vulkan", "{msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!(target: "vulkan", "{msg}");
    } else {
        debug!(target: "vulkan", "{msg}");
    }
    vk::FALSE
}

#[cfg(debug_assertions)]
unsafe fn has_instance_extension(entry: &Entry, name: &CStr) -> bool {
    entry
        .enumerate_instance_extension_properties(None)
        .unwrap_or_default()
        .iter()
        .any(|e| CStr::from_ptr(e.extension_name.as_ptr()) == name)
}

#[cfg(debug_assertions)]
unsafe fn has_layer(entry: &Entry, name: &CStr) -> bool {
    entry
        .enumerate_instance_layer_properties()
        .unwrap_or_default()
        .iter()
        .any(|l| CStr::from_ptr(l.layer_name.as_ptr()) == name)
}

unsafe fn create_instance(entry: &Entry, display: RawDisplayHandle) -> Result<Instance> {
    let app_info = vk::ApplicationInfo {
        s_type: vk::StructureType::APPLICATION_INFO,
        p_application_name: APP_NAME.as_ptr(),
        application_version: 0,
        p_engine_name: APP_NAME.as_ptr(),
        engine_version: 0,
        api_version: vk::API_VERSION_1_1,
        ..Default::default()
    };

    #[allow(unused_mut)]
    let mut extensions = ash_window::enumerate_required_extensions(display)
        .context("enumerate_required_extensions")?
        .to_vec();
    #[allow(unused_mut)]
    let mut layers: Vec<*const c_char> = Vec::new();

    #[cfg(debug_assertions)]
    {
        if has_instance_extension(entry, ext_debug::NAME) {
            extensions.push(ext_debug::NAME.as_ptr());
        }
        if has_layer(entry, VALIDATION_LAYER) {
            layers.push(VALIDATION_LAYER.as_ptr());
        } else {
            warn!("{VALIDATION_LAYER:?} not installed, running without validation");
        }
    }

    let create_info = vk::InstanceCreateInfo {
        s_type: vk::StructureType::INSTANCE_CREATE_INFO,
        p_application_info: &app_info,
        enabled_extension_count: extensions.len() as u32,
        pp_enabled_extension_names: extensions.as_ptr(),
        enabled_layer_count: layers.len() as u32,
        pp_enabled_layer_names: layers.as_ptr(),
        ..Default::default()
    };

    Ok(entry.create_instance(&create_info, None)?)
}

#[cfg(debug_assertions)]
unsafe fn create_debug_messenger(entry: &Entry, instance: &Instance) -> DebugState {
    if !has_instance_extension(entry, ext_debug::NAME) {
        return None;
    }
    let loader = ext_debug::Instance::new(entry, instance);
    let ci = vk::DebugUtilsMessengerCreateInfoEXT {
        s_type: vk::StructureType::DEBUG_UTILS_MESSENGER_CREATE_INFO_EXT,
        message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
            | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
            | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
            | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
            | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        pfn_user_callback: Some(debug_callback),
        ..Default::default()
    };
    match loader.create_debug_utils_messenger(&ci, None) {
        Ok(messenger) => Some((loader, messenger)),
        Err(e) => {
            warn!("create_debug_utils_messenger: {e}");
            None
        }
    }
}

#[cfg(not(debug_assertions))]
unsafe fn create_debug_messenger(_entry: &Entry, _instance: &Instance) -> DebugState {}

#[cfg(debug_assertions)]
unsafe fn destroy_debug_messenger(debug: &mut DebugState) {
    if let Some((loader, messenger)) = debug.take() {
        loader.destroy_debug_utils_messenger(messenger, None);
    }
}

#[cfg(not(debug_assertions))]
unsafe fn destroy_debug_messenger(_debug: &mut DebugState) {}

struct DeviceChoice {
    physical: vk::PhysicalDevice,
    graphics_family: u32,
    present_family: u32,
    name: String,
}

/// Ranks a device: needs graphics, present to `surface` and the swapchain
/// extension. Discrete GPUs win, and a single family doing both is preferred.
unsafe fn rate_device(
    instance: &Instance,
    surface_loader: &surface::Instance,
    surface: vk::SurfaceKHR,
    physical: vk::PhysicalDevice,
) -> Option<(u32, DeviceChoice)> {
    let has_swapchain = instance
        .enumerate_device_extension_properties(physical)
        .unwrap_or_default()
        .iter()
        .any(|e| CStr::from_ptr(e.extension_name.as_ptr()) == swapchain::NAME);
    if !has_swapchain {
        return None;
    }

    let families = instance.get_physical_device_queue_family_properties(physical);
    let can_present = |i: u32| {
        surface_loader
            .get_physical_device_surface_support(physical, i, surface)
            .unwrap_or(false)
    };
    let graphics: Vec<u32> = families
        .iter()
        .enumerate()
        .filter(|(_, q)| q.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .map(|(i, _)| i as u32)
        .collect();

    let (graphics_family, present_family) = match graphics.iter().copied().find(|&i| can_present(i)) {
        Some(both) => (both, both),
        None => {
            let present = (0..families.len() as u32).find(|&i| can_present(i))?;
            (*graphics.first()?, present)
        }
    };

    let props = instance.get_physical_device_properties(physical);
    let mut score = match props.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 100,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 50,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 20,
        _ => 1,
    };
    if graphics_family == present_family {
        score += 10;
    }
    let name = CStr::from_ptr(props.device_name.as_ptr())
        .to_string_lossy()
        .into_owned();

    Some((
        score,
        DeviceChoice {
            physical,
            graphics_family,
            present_family,
            name,
        },
    ))
}

unsafe fn pick_device(
    instance: &Instance,
    surface_loader: &surface::Instance,
    surface: vk::SurfaceKHR,
) -> Result<DeviceChoice> {
    instance
        .enumerate_physical_devices()
        .context("enumerate_physical_devices")?
        .into_iter()
        .filter_map(|p| rate_device(instance, surface_loader, surface, p))
        .max_by_key(|(score, _)| *score)
        .map(|(_, choice)| choice)
        .ok_or_else(|| anyhow!("no GPU can both render and present to this window"))
}

unsafe fn create_device(instance: &Instance, choice: &DeviceChoice) -> Result<ash::Device> {
    let priorities = [1.0f32];
    let mut families = vec![choice.graphics_family];
    if choice.present_family != choice.graphics_family {
        families.push(choice.present_family);
    }
    let queue_infos: Vec<vk::DeviceQueueCreateInfo> = families
        .iter()
        .map(|&family| vk::DeviceQueueCreateInfo {
            s_type: vk::StructureType::DEVICE_QUEUE_CREATE_INFO,
            queue_family_index: family,
            queue_count: 1,
            p_queue_priorities: priorities.as_ptr(),
            ..Default::default()
        })
        .collect();

    let extensions = [swapchain::NAME.as_ptr()];
    let info = vk::DeviceCreateInfo {
        s_type: vk::StructureType::DEVICE_CREATE_INFO,
        queue_create_info_count: queue_infos.len() as u32,
        p_queue_create_infos: queue_infos.as_ptr(),
        enabled_extension_count: extensions.len() as u32,
        pp_enabled_extension_names: extensions.as_ptr(),
        ..Default::default()
    };
    Ok(instance.create_device(choice.physical, &info, None)?)
}

unsafe fn create_command_pool(device: &ash::Device, family: u32) -> Result<vk::CommandPool> {
    // Each frame slot resets its own buffer before re-recording.
    let info = vk::CommandPoolCreateInfo {
        s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
        flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        queue_family_index: family,
        ..Default::default()
    };
    Ok(device.create_command_pool(&info, None)?)
}

impl DeviceContext {
    pub fn new(window: &dyn SurfaceProvider) -> Result<Self> {
        // STRICT ORDER:
        // 1) instance (WSI extensions + optional debug)
        // 2) surface FROM THIS INSTANCE
        // 3) physical device/queues checked AGAINST THIS SURFACE
        // 4) logical device, queues, pool, allocator
        let display = window
            .display_handle()
            .map_err(|e| anyhow!("{e}"))?
            .as_raw();
        let handle = window
            .window_handle()
            .map_err(|e| anyhow!("{e}"))?
            .as_raw();

        unsafe {
            let entry = Entry::load().context("load Vulkan loader library")?;
            let instance = create_instance(&entry, display).context("create_instance")?;
            let debug = create_debug_messenger(&entry, &instance);

            let surface_loader = surface::Instance::new(&entry, &instance);
            let surface = ash_window::create_surface(&entry, &instance, display, handle, None)
                .context("ash_window::create_surface")?;

            let choice = pick_device(&instance, &surface_loader, surface)?;
            let device = create_device(&instance, &choice).context("create_device")?;
            let graphics_queue = device.get_device_queue(choice.graphics_family, 0);
            let present_queue = device.get_device_queue(choice.present_family, 0);
            let command_pool =
                create_command_pool(&device, choice.graphics_family).context("create_command_pool")?;

            let allocator = Allocator::new(&AllocatorCreateDesc {
                instance: instance.clone(),
                device: device.clone(),
                physical_device: choice.physical,
                debug_settings: Default::default(),
                buffer_device_address: false,
                allocation_sizes: Default::default(),
            })
            .context("create gpu allocator")?;

            info!(
                "Vulkan device: {} (graphics family {}, present family {})",
                choice.name, choice.graphics_family, choice.present_family
            );

            Ok(Self {
                _entry: entry,
                instance,
                debug,
                surface_loader,
                surface,
                physical: choice.physical,
                device,
                graphics_family: choice.graphics_family,
                present_family: choice.present_family,
                graphics_queue,
                present_queue,
                command_pool,
                allocator: ManuallyDrop::new(Mutex::new(allocator)),
            })
        }
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn physical(&self) -> vk::PhysicalDevice {
        self.physical
    }

    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }

    pub fn surface_loader(&self) -> &surface::Instance {
        &self.surface_loader
    }

    pub fn graphics_family(&self) -> u32 {
        self.graphics_family
    }

    pub fn present_family(&self) -> u32 {
        self.present_family
    }

    /// True when one queue family does both graphics and present.
    pub fn shares_queue_family(&self) -> bool {
        self.graphics_family == self.present_family
    }

    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    pub fn present_queue(&self) -> vk::Queue {
        self.present_queue
    }

    pub fn command_pool(&self) -> vk::CommandPool {
        self.command_pool
    }

    pub fn allocator(&self) -> &Mutex<Allocator> {
        &self.allocator
    }
}

// STRICT TEARDOWN ORDER:
// - device_wait_idle()
// - allocator BEFORE device (it frees its memory blocks through it)
// - command pool BEFORE device
// - device, then surface, then debug messenger, instance last
impl Drop for DeviceContext {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                warn!("device_wait_idle during teardown: {e}");
            }
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
            destroy_debug_messenger(&mut self.debug);
            self.instance.destroy_instance(None);
        }
        debug!("Vulkan context destroyed");
    }
}
