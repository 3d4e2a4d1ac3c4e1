//! Headless device harness and image comparison.
//!
//! The round trips here go through the same staging paths the engine uses at
//! runtime, so a harness test failing usually means a transfer or layout bug
//! in `hurdygurdy-gpu` rather than in the test.

use ash::vk;
use image::{ImageBuffer, Rgba, RgbaImage};

use hurdygurdy_gpu::{
    texel_size, Buffer, BufferUsage, GpuContext, GpuContextBuilder, ImageState, MemoryType,
    Texture, TextureConfig, TextureUsage, CUBEMAP_CROSS_CELLS,
};

use crate::{Result, TestError, VisualTestConfig};

/// Device context without a window.
pub struct HeadlessHarness {
    gpu: GpuContext,
}

impl HeadlessHarness {
    pub fn new() -> Result<Self> {
        let gpu = GpuContextBuilder::new()
            .app_name("hurdygurdy-test")
            .validation(true)
            .build()?;
        Ok(Self { gpu })
    }

    pub fn gpu(&self) -> &GpuContext {
        &self.gpu
    }

    /// Write `data` into a fresh buffer of `memory_type` and read it back.
    pub fn buffer_round_trip(&self, memory_type: MemoryType, data: &[u8]) -> Result<Vec<u8>> {
        let mut buffer = Buffer::new(
            &self.gpu,
            data.len() as u64,
            BufferUsage::STORAGE,
            memory_type,
        )?;
        let mut out = vec![0; data.len()];
        let result = buffer
            .write(&self.gpu, 0, data)
            .and_then(|()| buffer.read(&self.gpu, 0, &mut out));
        buffer.destroy(&self.gpu)?;
        result?;
        Ok(out)
    }

    /// Upload `data` into a texture built from `config` and read mip 0 back.
    pub fn texture_round_trip(&self, config: &TextureConfig, data: &[u8]) -> Result<Vec<u8>> {
        let mut texture = Texture::new(&self.gpu, config)?;
        let result = texture
            .write(&self.gpu, Some(data), ImageState::ShaderReadOnly)
            .and_then(|()| self.read_all(&texture));
        texture.destroy(&self.gpu)?;
        Ok(result?)
    }

    /// Upload a cross of six solid faces into a cubemap and read the layers
    /// back, in layer order.
    pub fn cubemap_round_trip(&self, face_size: u32, faces: &[[u8; 4]; 6]) -> Result<Vec<u8>> {
        let config = TextureConfig::cubemap(
            face_size,
            vk::Format::R8G8B8A8_UNORM,
            TextureUsage::SAMPLED,
        );
        let cross = cubemap_cross_image(face_size, faces);
        self.texture_round_trip(&config, cross.as_raw())
    }

    /// Mip 0 of `texture` as an RGBA8 image.
    pub fn read_rgba(&self, texture: &Texture) -> Result<RgbaImage> {
        if texture.format() != vk::Format::R8G8B8A8_UNORM {
            return Err(TestError::ImageComparison(format!(
                "Expected an RGBA8 texture, got {:?}",
                texture.format()
            )));
        }
        let extent = texture.extent_3d();
        let data = self.read_all(texture)?;
        ImageBuffer::from_raw(extent.width, extent.height, data)
            .ok_or_else(|| TestError::ImageComparison("Texture data has the wrong size".to_string()))
    }

    fn read_all(&self, texture: &Texture) -> hurdygurdy_gpu::Result<Vec<u8>> {
        let extent = texture.extent_3d();
        let texel = texel_size(texture.format()).unwrap_or(4);
        let len = extent.width * extent.height * extent.depth * texture.array_layers() * texel;
        let mut out = vec![0; len as usize];
        texture.read(&self.gpu, &mut out)?;
        Ok(out)
    }
}

/// Unfolded cubemap cross, `4 * face_size` by `3 * face_size`, with each face
/// cell filled by its color and the unused cells left black.
pub fn cubemap_cross_image(face_size: u32, faces: &[[u8; 4]; 6]) -> RgbaImage {
    let mut cross = RgbaImage::new(face_size * 4, face_size * 3);
    for (&(column, row), &color) in CUBEMAP_CROSS_CELLS.iter().zip(faces) {
        for y in 0..face_size {
            for x in 0..face_size {
                cross.put_pixel(column * face_size + x, row * face_size + y, Rgba(color));
            }
        }
    }
    cross
}

/// Compares images against baselines and reports differences.
pub struct VisualRegressionTest {
    config: VisualTestConfig,
}

impl VisualRegressionTest {
    pub fn new(config: VisualTestConfig) -> Self {
        Self { config }
    }

    /// Compare `image` with the baseline called `name`. A missing baseline is
    /// created from `image`, as is every baseline in update mode.
    pub fn check(&self, name: &str, image: &RgbaImage) -> Result<()> {
        let config = &self.config;
        std::fs::create_dir_all(&config.baseline_dir)?;
        std::fs::create_dir_all(&config.output_dir)?;

        image.save(config.output_dir.join(format!("{name}.png")))?;

        let baseline_path = config.baseline_dir.join(format!("{name}.png"));
        if config.update_baselines || !baseline_path.exists() {
            image.save(&baseline_path)?;
            tracing::info!("Wrote baseline {}", baseline_path.display());
            return Ok(());
        }

        let baseline = image::open(&baseline_path)?.to_rgba8();
        let diff = image_difference(&baseline, image)?;
        if diff > config.threshold {
            let diff_path = config.output_dir.join(format!("{name}_diff.png"));
            diff_image(&baseline, image).save(&diff_path)?;
            return Err(TestError::ImageComparison(format!(
                "{name} differs by {diff:.4}, threshold {:.4} (see {})",
                config.threshold,
                diff_path.display()
            )));
        }
        Ok(())
    }
}

/// Normalized RGB difference of two images, 0.0 (same) to 1.0.
pub fn image_difference(a: &RgbaImage, b: &RgbaImage) -> Result<f64> {
    if a.dimensions() != b.dimensions() {
        return Err(TestError::ImageComparison(format!(
            "Image dimensions don't match: {:?} vs {:?}",
            a.dimensions(),
            b.dimensions()
        )));
    }

    let total_diff: u64 = a
        .pixels()
        .zip(b.pixels())
        .map(|(pa, pb)| {
            (0..3)
                .map(|c| u64::from(pa[c].abs_diff(pb[c])))
                .sum::<u64>()
        })
        .sum();

    let max_diff = (u64::from(a.width()) * u64::from(a.height()) * 3 * 255) as f64;
    if max_diff == 0.0 {
        return Ok(0.0);
    }
    Ok(total_diff as f64 / max_diff)
}

/// Differences above a small tolerance in red over a dimmed copy of `a`.
pub fn diff_image(a: &RgbaImage, b: &RgbaImage) -> RgbaImage {
    let (width, height) = a.dimensions();
    let mut diff = RgbaImage::new(width, height);

    for (x, y, pixel) in diff.enumerate_pixels_mut() {
        let pa = a.get_pixel(x, y);
        let pb = b.get_pixel(x, y);
        let max_diff = (0..3).map(|c| pa[c].abs_diff(pb[c])).max().unwrap_or(0);
        *pixel = if max_diff > 10 {
            Rgba([255, 0, 0, 255])
        } else {
            Rgba([pa[0] / 2, pa[1] / 2, pa[2] / 2, 255])
        };
    }

    diff
}

#[cfg(test)]
mod tests {
    use super::*;
    use hurdygurdy_gpu::sync::{reset_fence, FrameSync};
    use hurdygurdy_gpu::{max_mip_count, FRAMES_IN_FLIGHT};

    const FACES: [[u8; 4]; 6] = [
        [255, 0, 0, 255],
        [0, 255, 0, 255],
        [0, 0, 255, 255],
        [255, 255, 0, 255],
        [0, 255, 255, 255],
        [255, 0, 255, 255],
    ];

    fn gradient(width: u32, height: u32) -> RgbaImage {
        RgbaImage::from_fn(width, height, |x, y| {
            Rgba([(x * 255 / width) as u8, (y * 255 / height) as u8, 128, 255])
        })
    }

    #[test]
    fn cross_places_faces_in_their_cells() {
        let cross = cubemap_cross_image(2, &FACES);
        assert_eq!(cross.dimensions(), (8, 6));
        // +X sits at column 2, row 1
        assert_eq!(cross.get_pixel(5, 3), &Rgba(FACES[0]));
        // -Z sits at column 3, row 1
        assert_eq!(cross.get_pixel(7, 2), &Rgba(FACES[5]));
        // top-left cell is unused
        assert_eq!(cross.get_pixel(0, 0), &Rgba([0, 0, 0, 0]));
    }

    #[test]
    fn identical_images_have_no_difference() {
        let image = gradient(16, 16);
        assert_eq!(image_difference(&image, &image).unwrap(), 0.0);
    }

    #[test]
    fn mismatched_dimensions_are_rejected() {
        let result = image_difference(&gradient(4, 4), &gradient(8, 4));
        assert!(matches!(result, Err(TestError::ImageComparison(_))));
    }

    #[test]
    fn diff_image_marks_changed_pixels() {
        let a = RgbaImage::from_pixel(2, 1, Rgba([100, 100, 100, 255]));
        let mut b = a.clone();
        b.put_pixel(1, 0, Rgba([200, 100, 100, 255]));

        let diff = diff_image(&a, &b);
        assert_eq!(diff.get_pixel(0, 0), &Rgba([50, 50, 50, 255]));
        assert_eq!(diff.get_pixel(1, 0), &Rgba([255, 0, 0, 255]));
    }

    #[test]
    fn baselines_are_created_compared_and_updated() {
        let root = std::env::temp_dir().join(format!("hurdygurdy-baselines-{}", std::process::id()));
        let config = VisualTestConfig {
            threshold: 0.001,
            baseline_dir: root.join("baselines"),
            output_dir: root.join("output"),
            update_baselines: false,
        };
        let original = gradient(8, 8);
        let changed = RgbaImage::from_pixel(8, 8, Rgba([255, 255, 255, 255]));

        let checker = VisualRegressionTest::new(config.clone());
        checker.check("ramp", &original).unwrap();
        assert!(config.baseline_dir.join("ramp.png").exists());
        checker.check("ramp", &original).unwrap();

        let err = checker.check("ramp", &changed).unwrap_err();
        assert!(matches!(err, TestError::ImageComparison(_)));
        assert!(config.output_dir.join("ramp_diff.png").exists());

        let updater = VisualRegressionTest::new(VisualTestConfig {
            update_baselines: true,
            ..config
        });
        updater.check("ramp", &changed).unwrap();
        checker.check("ramp", &changed).unwrap();

        std::fs::remove_dir_all(root).unwrap();
    }

    // These tests require a GPU and will be skipped in CI without GPU support

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn headless_harness_creation() {
        let _harness = HeadlessHarness::new().unwrap();
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn buffer_round_trip_every_memory_type() {
        let harness = HeadlessHarness::new().unwrap();
        let data: Vec<u8> = (0..=255).cycle().take(4096).collect();

        for memory_type in [
            MemoryType::DeviceLocal,
            MemoryType::LinearAccess,
            MemoryType::RandomAccess,
        ] {
            let out = harness.buffer_round_trip(memory_type, &data).unwrap();
            assert_eq!(out, data, "{memory_type:?}");
        }
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn random_access_buffer_partial_write() {
        let harness = HeadlessHarness::new().unwrap();
        let gpu = harness.gpu();
        let mut buffer = Buffer::new(gpu, 16, BufferUsage::UNIFORM, MemoryType::RandomAccess).unwrap();

        buffer.write(gpu, 0, &[1; 16]).unwrap();
        buffer.write(gpu, 8, &[9; 4]).unwrap();
        let mut out = [0; 8];
        buffer.read(gpu, 6, &mut out).unwrap();
        assert_eq!(out, [1, 1, 9, 9, 9, 9, 1, 1]);

        buffer.destroy(gpu).unwrap();
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn texture_round_trip() {
        let harness = HeadlessHarness::new().unwrap();
        let image = gradient(64, 32);
        let config = TextureConfig::new(64, 32, vk::Format::R8G8B8A8_UNORM, TextureUsage::SAMPLED);

        let out = harness.texture_round_trip(&config, image.as_raw()).unwrap();
        assert_eq!(&out, image.as_raw());
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn cubemap_faces_land_in_layer_order() {
        let harness = HeadlessHarness::new().unwrap();
        let face_size = 8;

        let out = harness.cubemap_round_trip(face_size, &FACES).unwrap();
        let face_bytes = (face_size * face_size * 4) as usize;
        assert_eq!(out.len(), face_bytes * 6);
        for (layer, face) in out.chunks_exact(face_bytes).enumerate() {
            assert!(
                face.chunks_exact(4).all(|texel| texel == FACES[layer]),
                "layer {layer} has the wrong color"
            );
        }
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn mipmap_generation_keeps_base_level() {
        let harness = HeadlessHarness::new().unwrap();
        let gpu = harness.gpu();
        let image = gradient(64, 64);
        let config = TextureConfig::new(64, 64, vk::Format::R8G8B8A8_UNORM, TextureUsage::SAMPLED)
            .with_mip_levels(max_mip_count(64, 64, 1));

        let mut texture = Texture::new(gpu, &config).unwrap();
        assert_eq!(texture.mip_levels(), 7);
        texture
            .write(gpu, Some(image.as_raw()), ImageState::TransferDst)
            .unwrap();
        texture.generate_mipmaps(gpu, ImageState::ShaderReadOnly).unwrap();
        assert_eq!(texture.state(), ImageState::ShaderReadOnly);

        let base = harness.read_rgba(&texture).unwrap();
        assert_eq!(base, image);
        texture.destroy(gpu).unwrap();
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn resized_swapchain_gets_fresh_sync_objects() {
        let harness = HeadlessHarness::new().unwrap();
        let device = harness.gpu().device();
        unsafe {
            // Old swapchain of 3 images, mid-frame with its fence reset
            let mut old = FrameSync::new(device, FRAMES_IN_FLIGHT, 3).unwrap();
            let slot = old.slots.advance();
            reset_fence(device, old.in_flight[slot]).unwrap();
            old.slots.set_image(2);

            // Rebuilt at a size that yields 2 images, before the old one goes
            let mut new = FrameSync::new(device, FRAMES_IN_FLIGHT, 2).unwrap();
            assert_eq!(new.ready_to_present.len(), 2);
            assert_eq!(new.slots.image(), None);
            assert_eq!(new.slots.advance(), 0);
            new.slots.set_image(1);
            for &fence in &new.in_flight {
                assert!(device.get_fence_status(fence).unwrap(), "new fences start signaled");
            }

            assert!(new.in_flight.iter().all(|fence| !old.in_flight.contains(fence)));
            let old_semaphores: Vec<_> = old
                .image_available
                .iter()
                .chain(&old.ready_to_present)
                .collect();
            assert!(new
                .image_available
                .iter()
                .chain(&new.ready_to_present)
                .all(|semaphore| !old_semaphores.contains(&semaphore)));

            old.destroy(device);
            new.destroy(device);
        }
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn gradient_matches_baseline() {
        let harness = HeadlessHarness::new().unwrap();
        let gpu = harness.gpu();
        let image = gradient(128, 128);
        let config = TextureConfig::new(128, 128, vk::Format::R8G8B8A8_UNORM, TextureUsage::SAMPLED);

        let mut texture = Texture::new(gpu, &config).unwrap();
        texture
            .write(gpu, Some(image.as_raw()), ImageState::ShaderReadOnly)
            .unwrap();
        let rendered = harness.read_rgba(&texture).unwrap();
        texture.destroy(gpu).unwrap();

        VisualRegressionTest::new(VisualTestConfig::default())
            .check("gradient_128", &rendered)
            .unwrap();
    }
}
