//! `HgApp` trait definition.

use crate::context::AppContext;
use crate::frame::FrameContext;
use hurdygurdy_gpu::Texture;
use winit::event::WindowEvent;

/// An application driven by [`run_app`](crate::run_app).
///
/// The framework owns the window, the device and the swapchain. Between
/// `frame_begin` and `frame_end` it hands the application a recording
/// [`RenderContext`](hurdygurdy_gpu::RenderContext) through [`AppContext`].
pub trait HgApp: Sized {
    /// Called once after the window and device exist.
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self>;

    /// Advance time-dependent state. `dt` is in seconds.
    fn update(&mut self, ctx: &AppContext, dt: f32);

    /// Record the frame.
    ///
    /// A frame is already begun. Either render straight into the swapchain
    /// image (see [`AppContext::frame_parts`]) or into an offscreen texture
    /// returned from [`framebuffer`](Self::framebuffer).
    fn render(&mut self, ctx: &mut AppContext, frame: &FrameContext) -> anyhow::Result<()>;

    /// Texture to blit onto the swapchain image at the end of the frame.
    ///
    /// `None` presents the swapchain image as rendered.
    fn framebuffer(&self) -> Option<&Texture> {
        None
    }

    /// The swapchain was rebuilt at a new size.
    ///
    /// The device is idle, so size-dependent resources can be recreated here.
    #[allow(unused_variables)]
    fn on_resize(&mut self, ctx: &mut AppContext, width: u32, height: u32) -> anyhow::Result<()> {
        Ok(())
    }

    /// Return `true` to stop the framework from handling `event`.
    #[allow(unused_variables)]
    fn on_event(&mut self, event: &WindowEvent) -> bool {
        false
    }

    /// Release GPU resources. The device is idle.
    #[allow(unused_variables)]
    fn cleanup(&mut self, ctx: &mut AppContext) {}
}
