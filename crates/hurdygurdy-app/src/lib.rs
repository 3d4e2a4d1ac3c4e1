//! Application framework for the Hurdy Gurdy engine.
//!
//! Handles the boilerplate around the GPU core:
//! - Logging setup
//! - Window creation and the event loop
//! - Device, surface and swapchain creation
//! - `frame_begin` / `frame_end` around the application's `render`
//! - Swapchain rebuilds on resize or when a frame reports the window invalid
//!
//! # Example
//!
//! ```no_run
//! use hurdygurdy_app::{run_app, AppConfig, AppContext, FrameContext, HgApp};
//!
//! struct Clear;
//!
//! impl HgApp for Clear {
//!     fn init(_ctx: &mut AppContext) -> anyhow::Result<Self> {
//!         Ok(Clear)
//!     }
//!
//!     fn update(&mut self, _ctx: &AppContext, _dt: f32) {}
//!
//!     fn render(&mut self, ctx: &mut AppContext, _frame: &FrameContext) -> anyhow::Result<()> {
//!         let (render, image) = ctx.frame_parts();
//!         if let Some(image) = image {
//!             render.renderpass_begin(image, None, Some([0.1, 0.1, 0.2, 1.0]), None)?;
//!             render.renderpass_end()?;
//!         }
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     run_app::<Clear>(AppConfig::new("clear"))
//! }
//! ```

mod app;
mod context;
mod frame;
mod runner;

pub use app::HgApp;
pub use context::AppContext;
pub use frame::FrameContext;
pub use runner::{init_logging, run_app, AppConfig};

pub use hurdygurdy_gpu::{GpuContext, RenderContext};
pub use winit::event::WindowEvent;
