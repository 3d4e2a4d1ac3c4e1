//! Application runner and event loop.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use hurdygurdy_gpu::{FrameStatus, GpuContextBuilder};
use raw_window_handle::HasDisplayHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
#[cfg(feature = "profiling-tracy")]
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

use crate::app::HgApp;
use crate::context::AppContext;
use crate::frame::FrameContext;

/// Application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Window title.
    pub title: String,
    /// Initial window width.
    pub width: u32,
    /// Initial window height.
    pub height: u32,
    /// Target frames per second (None for unlimited).
    pub target_fps: Option<u32>,
    /// Enable vsync.
    pub vsync: bool,
    /// Enable Vulkan validation layers (default: debug builds only).
    pub validation: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            title: "Hurdy Gurdy".to_string(),
            width: 1280,
            height: 720,
            target_fps: None,
            vsync: true,
            validation: cfg!(debug_assertions),
        }
    }
}

impl AppConfig {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_target_fps(mut self, fps: u32) -> Self {
        self.target_fps = Some(fps);
        self
    }

    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    /// Minimum duration of one frame, if a target rate is set.
    pub fn target_frame_time(&self) -> Option<Duration> {
        self.target_fps
            .filter(|&fps| fps > 0)
            .map(|fps| Duration::from_nanos(1_000_000_000 / u64::from(fps)))
    }
}

/// Default log filter when `RUST_LOG` is unset.
fn default_filter() -> &'static str {
    if cfg!(feature = "profiling-tracy") {
        "info,hurdygurdy_gpu=trace,hurdygurdy_app=trace"
    } else {
        "info"
    }
}

/// Install the global `tracing` subscriber, plus the Tracy layer with the
/// `profiling-tracy` feature. Later calls are no-ops.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter()));

    #[cfg(feature = "profiling-tracy")]
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_tracy::TracyLayer::default())
        .try_init();

    #[cfg(not(feature = "profiling-tracy"))]
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Run an [`HgApp`] until its window closes.
///
/// Any error out of the GPU core or the application is fatal: it is logged
/// and returned once the event loop has stopped.
pub fn run_app<A: HgApp + 'static>(config: AppConfig) -> anyhow::Result<()> {
    init_logging();

    info!("{} starting...", config.title);

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut runner = AppRunner::<A> {
        config,
        state: None,
        fatal: None,
    };

    event_loop.run_app(&mut runner)?;

    match runner.fatal {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

struct AppRunner<A: HgApp> {
    config: AppConfig,
    state: Option<AppState<A>>,
    fatal: Option<anyhow::Error>,
}

struct AppState<A: HgApp> {
    app: A,
    // Dropped after `app` so the application's resources go first.
    ctx: AppContext,
    target_frame_time: Option<Duration>,
    min_fps: f64,
    max_fps: f64,
    fps_sum: f64,
}

impl<A: HgApp + 'static> ApplicationHandler for AppRunner<A> {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }

        info!("Creating application state...");

        match self.create_state(event_loop) {
            Ok(state) => {
                self.state = Some(state);
                info!("Application ready!");
            }
            Err(e) => self.fail(event_loop, e.context("Failed to initialize application")),
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        let Some(state) = &mut self.state else {
            return;
        };
        if state.app.on_event(&event) {
            return;
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                self.shutdown();
                event_loop.exit();
            }
            WindowEvent::RedrawRequested => {
                let result = state.render_frame();
                match result {
                    Ok(()) => state.ctx.window.request_redraw(),
                    Err(e) => self.fail(event_loop, e.context("Render error")),
                }
            }
            WindowEvent::Resized(size) => {
                let result = state.handle_resize(size.width, size.height);
                if let Err(e) = result {
                    self.fail(event_loop, e.context("Resize error"));
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            state.ctx.window.request_redraw();
        }
    }
}

impl<A: HgApp + 'static> AppRunner<A> {
    fn create_state(&self, event_loop: &ActiveEventLoop) -> anyhow::Result<AppState<A>> {
        let window_attrs = Window::default_attributes()
            .with_title(&self.config.title)
            .with_inner_size(PhysicalSize::new(self.config.width, self.config.height));

        let window = Arc::new(event_loop.create_window(window_attrs)?);

        let gpu = GpuContextBuilder::new()
            .app_name(&self.config.title)
            .validation(self.config.validation)
            .display(event_loop.display_handle()?.as_raw())
            .build()?;

        // SAFETY: the window is kept alive by the context itself
        let mut ctx = unsafe { AppContext::new(window, gpu, self.config.vsync)? };

        let app = A::init(&mut ctx)?;

        Ok(AppState {
            app,
            ctx,
            target_frame_time: self.config.target_frame_time(),
            min_fps: f64::MAX,
            max_fps: 0.0,
            fps_sum: 0.0,
        })
    }

    /// Log a fatal error, tear everything down and stop the loop.
    fn fail(&mut self, event_loop: &ActiveEventLoop, e: anyhow::Error) {
        error!("{e:#}");
        self.shutdown();
        self.fatal = Some(e);
        event_loop.exit();
    }

    fn shutdown(&mut self) {
        if let Some(mut state) = self.state.take() {
            state.cleanup();
        }
    }
}

impl<A: HgApp> AppState<A> {
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn render_frame(&mut self) -> anyhow::Result<()> {
        let frame_start = Instant::now();

        let now = Instant::now();
        let dt = now.duration_since(self.ctx.last_frame_time).as_secs_f32();
        self.ctx.last_frame_time = now;
        if dt > 0.0 {
            let fps = 1.0 / f64::from(dt);
            self.min_fps = self.min_fps.min(fps);
            self.max_fps = self.max_fps.max(fps);
            self.fps_sum += fps;
        }

        self.app.update(&self.ctx, dt);

        if self.ctx.frame_begin()? == FrameStatus::WindowInvalid {
            return self.recover();
        }

        let frame = FrameContext::new(dt, self.ctx.frame_count, self.ctx.extent());
        self.app.render(&mut self.ctx, &frame)?;

        let status = self.ctx.frame_end(self.app.framebuffer())?;
        self.ctx.frame_count += 1;
        if status == FrameStatus::WindowInvalid {
            self.recover()?;
        }

        if let Some(target) = self.target_frame_time {
            let elapsed = frame_start.elapsed();
            if elapsed < target {
                thread::sleep(target - elapsed);
            }
        }

        Ok(())
    }

    /// Rebuild the swapchain after the window stopped matching it.
    fn recover(&mut self) -> anyhow::Result<()> {
        let size = self.ctx.window.inner_size();
        warn!("Window invalid, rebuilding swapchain at {}x{}", size.width, size.height);
        self.handle_resize(size.width, size.height)
    }

    fn handle_resize(&mut self, width: u32, height: u32) -> anyhow::Result<()> {
        if !self.ctx.recreate_swapchain(width, height)? {
            return Ok(());
        }

        self.app.on_resize(&mut self.ctx, width, height)?;

        info!("Resized to {}x{}", width, height);
        Ok(())
    }

    fn cleanup(&mut self) {
        if self.ctx.frame_count > 0 {
            let avg_fps = self.fps_sum / self.ctx.frame_count as f64;
            info!("FPS Statistics:");
            info!("  Min: {:.1}", self.min_fps);
            info!("  Max: {:.1}", self.max_fps);
            info!("  Avg: {:.1}", avg_fps);
            info!("  Total frames: {}", self.ctx.frame_count);
        }

        info!("Starting cleanup...");
        if let Err(e) = self.ctx.gpu().wait_idle() {
            error!("Failed to wait idle: {e}");
        }
        self.app.cleanup(&mut self.ctx);
        info!("Cleanup complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_vsync() {
        let config = AppConfig::default();
        assert!(config.vsync);
        assert_eq!((config.width, config.height), (1280, 720));
        assert_eq!(config.target_frame_time(), None);
    }

    #[test]
    fn builder_overrides_fields() {
        let config = AppConfig::new("demo")
            .with_size(640, 480)
            .with_vsync(false)
            .with_validation(true)
            .with_target_fps(50);
        assert_eq!(config.title, "demo");
        assert_eq!((config.width, config.height), (640, 480));
        assert!(!config.vsync);
        assert!(config.validation);
        assert_eq!(config.target_frame_time(), Some(Duration::from_millis(20)));
    }

    #[test]
    fn logging_can_be_initialized_twice() {
        init_logging();
        init_logging();
        tracing::info!("logging ready");
        if cfg!(feature = "profiling-tracy") {
            assert!(default_filter().contains("hurdygurdy_gpu=trace"));
        } else {
            assert_eq!(default_filter(), "info");
        }
    }

    #[test]
    fn zero_target_fps_means_unlimited() {
        let config = AppConfig::default().with_target_fps(0);
        assert_eq!(config.target_frame_time(), None);
    }
}
