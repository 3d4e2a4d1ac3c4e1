//! Application context.

use std::sync::Arc;
use std::time::Instant;

use ash::vk;
use hurdygurdy_gpu::{
    FrameStatus, GpuContext, GpuError, RenderContext, SurfaceContext, SwapchainCommands,
    SwapchainImage, Texture,
};
use winit::window::Window;

/// Everything the framework owns on behalf of the application.
pub struct AppContext {
    /// The window being rendered to.
    pub window: Arc<Window>,
    /// Frame driver; records commands between `frame_begin` and `frame_end`.
    pub render: RenderContext,
    surface: SurfaceContext,
    /// `None` only while a rebuild is in progress or after it failed.
    swapchain: Option<SwapchainCommands>,
    /// Total frames presented.
    pub frame_count: u64,
    pub(crate) last_frame_time: Instant,
}

impl AppContext {
    /// Create the surface and swapchain for `window`.
    ///
    /// # Safety
    /// The window must have valid handles and outlive the context.
    pub(crate) unsafe fn new(window: Arc<Window>, gpu: GpuContext, vsync: bool) -> anyhow::Result<Self> {
        let render = RenderContext::new(gpu)?;

        // SAFETY: caller guarantees the window outlives the surface
        let surface = unsafe { SurfaceContext::from_window(render.gpu(), window.as_ref())? };

        let size = window.inner_size();
        let swapchain = match SwapchainCommands::new(
            render.gpu(),
            &surface,
            size.width.max(1),
            size.height.max(1),
            vsync,
        ) {
            Ok(swapchain) => swapchain,
            Err(e) => {
                // SAFETY: no swapchain exists on the surface
                unsafe { surface.destroy() };
                return Err(e.into());
            }
        };

        tracing::info!(
            "Swapchain created: {}x{} ({} images)",
            swapchain.extent().width,
            swapchain.extent().height,
            swapchain.swapchain().images().len()
        );

        Ok(Self {
            window,
            render,
            surface,
            swapchain: Some(swapchain),
            frame_count: 0,
            last_frame_time: Instant::now(),
        })
    }

    pub fn gpu(&self) -> &GpuContext {
        self.render.gpu()
    }

    /// Current swapchain extent.
    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain
            .as_ref()
            .map_or_else(vk::Extent2D::default, SwapchainCommands::extent)
    }

    pub fn width(&self) -> u32 {
        self.extent().width
    }

    pub fn height(&self) -> u32 {
        self.extent().height
    }

    /// Width over height, 1.0 for a degenerate extent.
    pub fn aspect_ratio(&self) -> f32 {
        let extent = self.extent();
        if extent.height == 0 {
            1.0
        } else {
            extent.width as f32 / extent.height as f32
        }
    }

    /// Format of the swapchain images.
    pub fn surface_format(&self) -> vk::Format {
        self.swapchain
            .as_ref()
            .map_or(vk::Format::UNDEFINED, SwapchainCommands::format)
    }

    /// The recorder together with the acquired swapchain image, for
    /// rendering straight into the window.
    pub fn frame_parts(&mut self) -> (&mut RenderContext, Option<&SwapchainImage>) {
        let image = self.swapchain.as_ref().and_then(SwapchainCommands::current_image);
        (&mut self.render, image)
    }

    pub(crate) fn frame_begin(&mut self) -> hurdygurdy_gpu::Result<FrameStatus> {
        let swapchain = self.swapchain.as_mut().ok_or_else(missing_swapchain)?;
        self.render.frame_begin(swapchain)
    }

    pub(crate) fn frame_end(&mut self, framebuffer: Option<&Texture>) -> hurdygurdy_gpu::Result<FrameStatus> {
        let swapchain = self.swapchain.as_mut().ok_or_else(missing_swapchain)?;
        self.render.frame_end(swapchain, framebuffer)
    }

    /// Rebuild the swapchain at `width` x `height`.
    ///
    /// Returns `false` without touching anything for a zero-sized window.
    pub(crate) fn recreate_swapchain(&mut self, width: u32, height: u32) -> hurdygurdy_gpu::Result<bool> {
        if width == 0 || height == 0 {
            return Ok(false);
        }
        let old = self.swapchain.take().ok_or_else(missing_swapchain)?;
        let swapchain = old.recreate(self.render.gpu(), &self.surface, width, height)?;

        tracing::info!(
            "Swapchain recreated: {}x{} ({} images)",
            swapchain.extent().width,
            swapchain.extent().height,
            swapchain.swapchain().images().len()
        );
        self.swapchain = Some(swapchain);
        Ok(true)
    }
}

fn missing_swapchain() -> GpuError {
    GpuError::InvalidState("Swapchain is missing".to_string())
}

impl Drop for AppContext {
    fn drop(&mut self) {
        if let Err(e) = self.render.gpu().wait_idle() {
            tracing::error!("Failed to wait idle: {e}");
        }
        if let Some(swapchain) = self.swapchain.take() {
            swapchain.destroy(self.render.gpu());
        }
        // SAFETY: the swapchain on this surface is gone
        unsafe { self.surface.destroy() };
    }
}
