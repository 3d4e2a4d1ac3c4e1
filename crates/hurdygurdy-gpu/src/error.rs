//! GPU error types.

use ash::vk;
use std::path::PathBuf;
use thiserror::Error;

/// GPU-related errors.
///
/// Every variant is fatal for the frame loop. The only recoverable condition,
/// an out-of-date or suboptimal swapchain, is reported through
/// [`FrameStatus::WindowInvalid`](crate::FrameStatus) instead.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// The Vulkan loader could not be found.
    #[error("Failed to load Vulkan: {0}")]
    Loading(String),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// SPIR-V bytecode could not be decoded.
    #[error("Invalid SPIR-V: {0}")]
    InvalidSpirv(String),

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// A format lacks a feature the operation needs.
    #[error("Format {format:?} does not support {feature}")]
    UnsupportedFormat {
        format: vk::Format,
        feature: &'static str,
    },

    /// Shader file does not exist.
    #[error("Shader file not found: {}", .0.display())]
    ShaderNotFound(PathBuf),

    /// Shader file exists but could not be read.
    #[error("Shader file not readable: {}: {source}", path.display())]
    ShaderUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
