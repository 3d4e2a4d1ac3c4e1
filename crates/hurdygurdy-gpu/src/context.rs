//! Device context: instance, device, the general queue and the GPU allocator.

use crate::capabilities::GpuCapabilities;
use crate::command::OneShotCommands;
use crate::error::{GpuError, Result};
use crate::instance::{create_instance, select_physical_device};
use crate::memory::GpuAllocator;
use ash::vk;
use parking_lot::Mutex;
use raw_window_handle::RawDisplayHandle;
use std::sync::Arc;

/// Main GPU context holding Vulkan resources.
///
/// There is exactly one per process. Everything else in the crate borrows it.
pub struct GpuContext {
    pub(crate) entry: ash::Entry,
    pub(crate) instance: ash::Instance,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) device: Arc<ash::Device>,
    pub(crate) capabilities: GpuCapabilities,
    pub(crate) allocator: Mutex<GpuAllocator>,

    pub(crate) queue_family: u32,
    pub(crate) queue: vk::Queue,

    // Long-lived pool and fence for setup and transfer work outside the frame loop
    pub(crate) one_shot: OneShotCommands,
}

impl GpuContext {
    /// Get the Vulkan entry point.
    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    /// Get the Vulkan instance handle.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Get the physical device handle.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get GPU capabilities.
    pub fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    /// Get the general-purpose (graphics + compute + transfer) queue.
    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    /// Get the queue family index of [`GpuContext::queue`].
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Get access to the GPU allocator.
    pub fn allocator(&self) -> &Mutex<GpuAllocator> {
        &self.allocator
    }

    /// Begin recording a one-shot command buffer.
    ///
    /// Pair with [`GpuContext::commands_end`], which submits the buffer and
    /// blocks until the GPU has executed it.
    pub fn commands_begin(&self) -> Result<vk::CommandBuffer> {
        unsafe { self.one_shot.begin(&self.device) }
    }

    /// Submit a one-shot command buffer, wait for it and free it.
    pub fn commands_end(&self, cmd: vk::CommandBuffer) -> Result<()> {
        unsafe { self.one_shot.end(&self.device, self.queue, cmd) }
    }

    /// Record `f` into a one-shot command buffer and execute it synchronously.
    pub fn submit_one_shot<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let cmd = self.commands_begin()?;
        f(&self.device, cmd);
        self.commands_end(cmd)
    }

    /// Wait for device to be idle.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.device.device_wait_idle()?;
        }
        Ok(())
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            self.one_shot.destroy(&self.device);

            // Frees all VkDeviceMemory, so it must run before the device goes away
            self.allocator.lock().shutdown();

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    app_name: String,
    enable_validation: bool,
    display: Option<RawDisplayHandle>,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "Hurdy Gurdy".to_string(),
            enable_validation: cfg!(debug_assertions),
            display: None,
        }
    }
}

impl GpuContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Enable presentation to windows on this display.
    ///
    /// Without a display the context is headless and cannot create surfaces.
    pub fn display(mut self, display: RawDisplayHandle) -> Self {
        self.display = Some(display);
        self
    }

    /// Build the GPU context.
    pub fn build(self) -> Result<GpuContext> {
        let entry = unsafe { ash::Entry::load() }.map_err(|e| GpuError::Loading(e.to_string()))?;

        let instance = unsafe {
            create_instance(
                &entry,
                &self.app_name,
                self.display,
                self.enable_validation,
            )
        }?;

        let opened = unsafe { open_device(&instance, self.display.is_some()) };
        let (physical_device, capabilities, device, queue_family, queue) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(e);
            }
        };
        let device = Arc::new(device);

        let helpers = unsafe {
            GpuAllocator::new(&instance, device.clone(), physical_device).and_then(|allocator| {
                OneShotCommands::new(&device, queue_family).map(|one_shot| (allocator, one_shot))
            })
        };
        let (allocator, one_shot) = match helpers {
            Ok(helpers) => helpers,
            Err(e) => {
                // Any allocator was already dropped inside `and_then`
                unsafe {
                    device.destroy_device(None);
                    instance.destroy_instance(None);
                }
                return Err(e);
            }
        };

        Ok(GpuContext {
            entry,
            instance,
            physical_device,
            device,
            capabilities,
            allocator: Mutex::new(allocator),
            queue_family,
            queue,
            one_shot,
        })
    }
}

/// Pick a device and create it with its single general queue.
///
/// # Safety
/// The instance must be valid.
unsafe fn open_device(
    instance: &ash::Instance,
    presentable: bool,
) -> Result<(vk::PhysicalDevice, GpuCapabilities, ash::Device, u32, vk::Queue)> {
    let (physical_device, capabilities) = select_physical_device(instance)?;
    tracing::info!("Selected GPU: {}", capabilities.summary());
    let queue_family = capabilities
        .general_queue_family
        .ok_or(GpuError::NoSuitableDevice)?;
    let (device, queue) = create_device(
        instance,
        physical_device,
        queue_family,
        &capabilities,
        presentable,
    )?;
    Ok((physical_device, capabilities, device, queue_family, queue))
}

/// Create the logical device and retrieve its single queue.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_family: u32,
    capabilities: &GpuCapabilities,
    presentable: bool,
) -> Result<(ash::Device, vk::Queue)> {
    let queue_priority = 1.0_f32;
    let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(queue_family)
        .queue_priorities(std::slice::from_ref(&queue_priority))];

    // VK_KHR_swapchain depends on the surface instance extensions
    let extension_names = if presentable {
        vec![ash::khr::swapchain::NAME.as_ptr()]
    } else {
        vec![]
    };

    let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default()
        .dynamic_rendering(true)
        .synchronization2(true);

    let features = vk::PhysicalDeviceFeatures::default()
        .sampler_anisotropy(capabilities.supports_sampler_anisotropy);

    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .features(features)
        .push_next(&mut vulkan_1_3_features);

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .push_next(&mut features2);

    let device = instance
        .create_device(physical_device, &device_create_info, None)
        .map_err(GpuError::from)?;

    let queue = device.get_device_queue(queue_family, 0);

    Ok((device, queue))
}
