//! Test harness for the Hurdy Gurdy engine.
//!
//! Provides a headless device for resource round trips and image comparison
//! against stored baselines.

pub mod harness;

pub use harness::{cubemap_cross_image, HeadlessHarness, VisualRegressionTest};

use hurdygurdy_gpu::GpuError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TestError {
    #[error(transparent)]
    Gpu(#[from] GpuError),
    #[error("Image mismatch: {0}")]
    ImageComparison(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Image(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, TestError>;

/// Where baselines live and how strictly renders are compared against them.
#[derive(Debug, Clone)]
pub struct VisualTestConfig {
    /// Largest accepted [`harness::image_difference`], 0.0 to 1.0.
    pub threshold: f64,
    pub baseline_dir: PathBuf,
    /// Receives every render and, on mismatch, a `<name>_diff.png`.
    pub output_dir: PathBuf,
    /// Overwrite baselines instead of comparing against them. Defaults to
    /// whether `HURDYGURDY_UPDATE_BASELINES` is set.
    pub update_baselines: bool,
}

impl Default for VisualTestConfig {
    fn default() -> Self {
        Self {
            threshold: 0.001,
            baseline_dir: PathBuf::from("assets/test_data/baselines"),
            output_dir: PathBuf::from("target/test_output"),
            update_baselines: std::env::var_os(UPDATE_BASELINES_VAR).is_some(),
        }
    }
}

pub const UPDATE_BASELINES_VAR: &str = "HURDYGURDY_UPDATE_BASELINES";
