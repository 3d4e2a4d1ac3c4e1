//! Per-frame context for rendering.

use ash::vk;

/// Timing and size of the frame being recorded.
#[derive(Debug, Clone, Copy)]
pub struct FrameContext {
    /// Delta time since last frame in seconds.
    pub dt: f32,
    /// Frames presented before this one.
    pub frame_number: u64,
    /// Extent of the swapchain image being rendered.
    pub extent: vk::Extent2D,
}

impl FrameContext {
    pub(crate) fn new(dt: f32, frame_number: u64, extent: vk::Extent2D) -> Self {
        Self {
            dt,
            frame_number,
            extent,
        }
    }
}
