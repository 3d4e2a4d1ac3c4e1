//! Hurdy Gurdy Engine Demo
//!
//! Draws a spinning triangle into an offscreen target that is blitted onto
//! the window, or straight into the swapchain image with `--direct`.
//!
//! ## Usage
//!
//! ```bash
//! glslc apps/hurdygurdy-demo/shaders/triangle.vert -o build/triangle.vert.spv
//! glslc apps/hurdygurdy-demo/shaders/triangle.frag -o build/triangle.frag.spv
//! cargo run -p hurdygurdy-demo -- [--direct] [--no-vsync]
//! ```
//!
//! Without the compiled shaders the demo only clears the screen.
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod app;

use hurdygurdy_app::{run_app, AppConfig};

use crate::app::Demo;

const WIDTH: u32 = 1280;
const HEIGHT: u32 = 720;

fn main() -> anyhow::Result<()> {
    if std::env::args().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    let vsync = !std::env::args().any(|arg| arg == "--no-vsync");

    run_app::<Demo>(
        AppConfig::new("Hurdy Gurdy - Demo")
            .with_size(WIDTH, HEIGHT)
            .with_vsync(vsync),
    )
}

fn print_help() {
    eprintln!(
        "Hurdy Gurdy Engine Demo

USAGE:
    hurdygurdy-demo [OPTIONS]

OPTIONS:
    --direct      Render straight into the swapchain image
    --no-vsync    Present without waiting for vertical blank
    -h, --help    Print this help message

Shaders are loaded from build/triangle.vert.spv and build/triangle.frag.spv."
    );
}
