//! Window surfaces.
//!
//! Wraps the Vulkan surface and the swapchain extension loaders so the rest of
//! the engine never touches raw window handles.

use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::swapchain::{select_present_mode, select_surface_format};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

/// Surface of one window plus the extension loaders bound to it.
pub struct SurfaceContext {
    surface: vk::SurfaceKHR,
    surface_loader: ash::khr::surface::Instance,
    swapchain_loader: ash::khr::swapchain::Device,
}

impl SurfaceContext {
    /// Create a surface for `window`.
    ///
    /// The context must have been built with the window's display handle so
    /// the surface extensions are enabled.
    ///
    /// # Safety
    /// The window must outlive the surface.
    pub unsafe fn from_window<W>(gpu: &GpuContext, window: &W) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?;
        let window_handle = window
            .window_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get window handle: {e}")))?;

        let surface = ash_window::create_surface(
            gpu.entry(),
            gpu.instance(),
            display.as_raw(),
            window_handle.as_raw(),
            None,
        )
        .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?;

        let surface_loader = ash::khr::surface::Instance::new(gpu.entry(), gpu.instance());

        let supported = surface_loader.get_physical_device_surface_support(
            gpu.physical_device(),
            gpu.queue_family(),
            surface,
        );
        if !matches!(supported, Ok(true)) {
            surface_loader.destroy_surface(surface, None);
            return Err(GpuError::SurfaceCreation(
                "Queue family cannot present to this surface".to_string(),
            ));
        }

        let swapchain_loader = ash::khr::swapchain::Device::new(gpu.instance(), gpu.device());

        Ok(Self {
            surface,
            surface_loader,
            swapchain_loader,
        })
    }

    pub fn handle(&self) -> vk::SurfaceKHR {
        self.surface
    }

    pub fn swapchain_loader(&self) -> &ash::khr::swapchain::Device {
        &self.swapchain_loader
    }

    /// What the surface accepts on the context's device, re-queried on every
    /// swapchain build since the limits follow the window size.
    pub fn support(&self, gpu: &GpuContext) -> Result<SurfaceSupport> {
        let physical_device = gpu.physical_device();
        unsafe {
            Ok(SurfaceSupport {
                limits: self
                    .surface_loader
                    .get_physical_device_surface_capabilities(physical_device, self.surface)?,
                formats: self
                    .surface_loader
                    .get_physical_device_surface_formats(physical_device, self.surface)?,
                present_modes: self
                    .surface_loader
                    .get_physical_device_surface_present_modes(physical_device, self.surface)?,
            })
        }
    }

    /// Destroy the surface.
    ///
    /// # Safety
    /// Every swapchain created on the surface must be destroyed first.
    pub unsafe fn destroy(&self) {
        self.surface_loader.destroy_surface(self.surface, None);
    }
}

pub struct SurfaceSupport {
    pub limits: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceSupport {
    /// Preferred surface format, `None` if the surface reports none.
    pub fn recommended_format(&self) -> Option<vk::SurfaceFormatKHR> {
        select_surface_format(&self.formats)
    }

    pub fn recommended_present_mode(&self, vsync: bool) -> vk::PresentModeKHR {
        select_present_mode(&self.present_modes, vsync)
    }
}
