//! Vulkan rendering core for the Hurdy Gurdy engine.
//!
//! This crate provides:
//! - Vulkan instance and device management
//! - GPU buffers and textures with host-mapped or staged transfers
//! - Shader (graphics/compute pipeline) objects built from SPIR-V
//! - Swapchain and frames-in-flight synchronization
//! - Image layout tracking for dynamic rendering passes
//! - Transient per-frame descriptor sets
//! - The frame driver ([`RenderContext`]) tying all of it together
//!
//! The core is single-threaded: one thread records commands and owns the
//! [`RenderContext`]. Textures carry their tracked layout in shared,
//! non-`Send` state so the type system keeps them on that thread.

/// Precondition check for API misuse.
///
/// Active in debug builds and with the `strict-asserts` feature, compiled out
/// otherwise.
macro_rules! hg_assert {
    ($cond:expr $(,)?) => {
        hg_assert!($cond, "{}", stringify!($cond))
    };
    ($cond:expr, $($arg:tt)+) => {
        if cfg!(any(debug_assertions, feature = "strict-asserts")) && !($cond) {
            let message = format!($($arg)+);
            tracing::error!("assertion failed: {message}");
            panic!("assertion failed: {message}");
        }
    };
}

pub mod buffer;
pub mod capabilities;
pub mod command;
pub mod context;
pub mod descriptors;
pub mod error;
pub mod frame;
pub mod instance;
pub mod layout;
pub mod memory;
pub mod render_pass;
pub mod shader;
pub mod shader_file;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod texture;

pub use buffer::{Buffer, BufferUsage, MemoryType};
pub use capabilities::{GpuCapabilities, GpuVendor};
pub use context::{GpuContext, GpuContextBuilder};
pub use descriptors::{Descriptor, DescriptorKind};
pub use error::{GpuError, Result};
pub use frame::{FrameStatus, RenderContext};
pub use layout::{BarrierSpec, ImageState};
pub use render_pass::Attachment;
pub use shader::{
    ComputeShaderConfig, DescriptorBinding, Shader, ShaderConfig, VertexAttribute, VertexBinding,
};
pub use shader_file::{load_shader_file, ShaderStage};
pub use surface::SurfaceContext;
pub use swapchain::{SwapchainCommands, SwapchainImage};
pub use texture::{
    max_mip_count, texel_size, EdgeMode, Texture, TextureAspect, TextureConfig, TextureUsage,
    CUBEMAP_CROSS_CELLS,
};

/// Number of frames the CPU may record ahead of the GPU.
pub const FRAMES_IN_FLIGHT: usize = 2;
