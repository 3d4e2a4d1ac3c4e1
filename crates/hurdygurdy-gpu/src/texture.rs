//! Textures: images with an optional view and sampler, plus their tracked
//! layout.
//!
//! Uploads and downloads are synchronous. A cubemap is uploaded from a single
//! "unfolded cross" image four faces wide and three faces tall:
//!
//! ```text
//!          +-----+
//!          | top |
//!    +-----+-----+-----+-----+
//!    | left|front|right| back|
//!    +-----+-----+-----+-----+
//!          | bot |
//!          +-----+
//! ```

use crate::buffer::{Buffer, BufferUsage, MemoryType};
use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::layout::{cmd_image_barriers, full_range, ImageBarrier, ImageState, ImageTrack};
use crate::render_pass::Attachment;
use ash::vk;
use bitflags::bitflags;
use gpu_allocator::vulkan::Allocation;
use std::rc::Rc;

bitflags! {
    /// How a texture is used.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u32 {
        const SAMPLED = 1 << 0;
        const STORAGE = 1 << 1;
        const RENDER_TARGET = 1 << 2;
        const DEPTH_BUFFER = 1 << 3;
        const TRANSFER_SRC = 1 << 4;
        const TRANSFER_DST = 1 << 5;
    }
}

bitflags! {
    /// Which aspects of the image are addressed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TextureAspect: u32 {
        const COLOR = 1 << 0;
        const DEPTH = 1 << 1;
    }
}

impl TextureAspect {
    fn to_vk(self) -> vk::ImageAspectFlags {
        let mut flags = vk::ImageAspectFlags::empty();
        if self.contains(Self::COLOR) {
            flags |= vk::ImageAspectFlags::COLOR;
        }
        if self.contains(Self::DEPTH) {
            flags |= vk::ImageAspectFlags::DEPTH;
        }
        flags
    }
}

/// Sampler addressing outside `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum EdgeMode {
    #[default]
    Repeat,
    MirroredRepeat,
    ClampToEdge,
    ClampToBorder,
    MirrorClampToEdge,
}

impl EdgeMode {
    fn address_mode(self) -> vk::SamplerAddressMode {
        match self {
            Self::Repeat => vk::SamplerAddressMode::REPEAT,
            Self::MirroredRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
            Self::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
            Self::ClampToBorder => vk::SamplerAddressMode::CLAMP_TO_BORDER,
            Self::MirrorClampToEdge => vk::SamplerAddressMode::MIRROR_CLAMP_TO_EDGE,
        }
    }
}

/// Texture creation parameters.
#[derive(Debug, Clone)]
pub struct TextureConfig {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub array_layers: u32,
    /// Zero means one level.
    pub mip_levels: u32,
    pub format: vk::Format,
    pub aspect: TextureAspect,
    pub usage: TextureUsage,
    pub edge_mode: EdgeMode,
    pub bilinear_filter: bool,
    /// Requires six array layers, square faces and depth 1.
    pub make_cubemap: bool,
}

impl TextureConfig {
    /// A single-level 2D color texture.
    pub fn new(width: u32, height: u32, format: vk::Format, usage: TextureUsage) -> Self {
        Self {
            width,
            height,
            depth: 1,
            array_layers: 1,
            mip_levels: 1,
            format,
            aspect: TextureAspect::COLOR,
            usage,
            edge_mode: EdgeMode::default(),
            bilinear_filter: true,
            make_cubemap: false,
        }
    }

    /// A depth buffer usable as a depth attachment and sampled afterwards.
    pub fn depth_buffer(width: u32, height: u32, format: vk::Format) -> Self {
        Self {
            aspect: TextureAspect::DEPTH,
            ..Self::new(
                width,
                height,
                format,
                TextureUsage::DEPTH_BUFFER | TextureUsage::SAMPLED,
            )
        }
    }

    /// A cubemap with square faces of `size` texels.
    pub fn cubemap(size: u32, format: vk::Format, usage: TextureUsage) -> Self {
        Self {
            array_layers: 6,
            make_cubemap: true,
            ..Self::new(size, size, format, usage)
        }
    }

    pub fn with_mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    pub fn with_edge_mode(mut self, edge_mode: EdgeMode) -> Self {
        self.edge_mode = edge_mode;
        self
    }

    pub fn with_bilinear_filter(mut self, enable: bool) -> Self {
        self.bilinear_filter = enable;
        self
    }

    fn mip_level_count(&self) -> u32 {
        self.mip_levels.max(1)
    }

    fn validate(&self) {
        hg_assert!(
            self.width > 0 && self.height > 0 && self.depth > 0,
            "texture dimensions must be non-zero ({}x{}x{})",
            self.width,
            self.height,
            self.depth
        );
        hg_assert!(self.array_layers > 0, "texture must have at least one layer");
        hg_assert!(self.format != vk::Format::UNDEFINED, "texture format must be defined");
        hg_assert!(!self.aspect.is_empty(), "texture aspect must not be empty");
        hg_assert!(!self.usage.is_empty(), "texture usage must not be empty");
        if self.make_cubemap {
            hg_assert!(self.array_layers == 6, "cubemap needs exactly 6 layers");
            hg_assert!(self.width == self.height, "cubemap faces must be square");
            hg_assert!(self.depth == 1, "cubemap depth must be 1");
        }
    }

    /// Vulkan usage flags. Transfer bits are always present: every texture
    /// can be written, read back and blitted.
    fn vk_usage(&self) -> vk::ImageUsageFlags {
        let mut flags = vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;
        if self.usage.contains(TextureUsage::SAMPLED) {
            flags |= vk::ImageUsageFlags::SAMPLED;
        }
        if self.usage.contains(TextureUsage::STORAGE) {
            flags |= vk::ImageUsageFlags::STORAGE;
        }
        if self.usage.contains(TextureUsage::RENDER_TARGET) {
            flags |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
        }
        if self.usage.contains(TextureUsage::DEPTH_BUFFER) {
            flags |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
        }
        flags
    }

    fn image_type(&self) -> vk::ImageType {
        if self.depth > 1 {
            vk::ImageType::TYPE_3D
        } else {
            vk::ImageType::TYPE_2D
        }
    }

    fn view_type(&self) -> vk::ImageViewType {
        if self.make_cubemap {
            vk::ImageViewType::CUBE
        } else if self.depth > 1 {
            vk::ImageViewType::TYPE_3D
        } else if self.array_layers > 1 {
            vk::ImageViewType::TYPE_2D_ARRAY
        } else {
            vk::ImageViewType::TYPE_2D
        }
    }

    fn needs_view(&self) -> bool {
        self.usage.intersects(
            TextureUsage::SAMPLED
                | TextureUsage::STORAGE
                | TextureUsage::RENDER_TARGET
                | TextureUsage::DEPTH_BUFFER,
        )
    }
}

/// Number of mip levels in a full chain for the given dimensions.
///
/// `floor(log2(max(w, h, d))) + 1`, or 0 when every dimension is 0.
pub fn max_mip_count(width: u32, height: u32, depth: u32) -> u32 {
    let largest = width.max(height).max(depth);
    if largest == 0 {
        0
    } else {
        largest.ilog2() + 1
    }
}

/// Extent of mip `level`, each dimension halved per level down to 1.
pub(crate) fn mip_extent(extent: vk::Extent3D, level: u32) -> vk::Extent3D {
    vk::Extent3D {
        width: (extent.width >> level).max(1),
        height: (extent.height >> level).max(1),
        depth: (extent.depth >> level).max(1),
    }
}

/// Size in bytes of one texel, for the formats the engine uses.
pub fn texel_size(format: vk::Format) -> Option<u32> {
    let size = match format {
        vk::Format::R8_UNORM | vk::Format::R8_SRGB => 1,
        vk::Format::R8G8_UNORM => 2,
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::R32_SFLOAT
        | vk::Format::R32_UINT
        | vk::Format::D32_SFLOAT => 4,
        vk::Format::R16G16B16A16_SFLOAT | vk::Format::R32G32_SFLOAT => 8,
        vk::Format::R32G32B32A32_SFLOAT => 16,
        _ => return None,
    };
    Some(size)
}

/// Texels in mip 0 of an image, summed over `layers` layers.
pub(crate) fn mip0_texels(extent: vk::Extent3D, layers: u32) -> u64 {
    u64::from(extent.width) * u64::from(extent.height) * u64::from(extent.depth) * u64::from(layers)
}

/// Check that a host slice of `len` bytes matches a transfer of `texels`
/// texels. Formats without a known texel size need at least a byte per texel.
pub(crate) fn check_transfer_len(format: vk::Format, texels: u64, len: usize) {
    let len = len as u64;
    match texel_size(format) {
        Some(size) => {
            let expected = texels * u64::from(size);
            hg_assert!(
                len == expected,
                "texture transfer of {len} bytes, image needs {expected}"
            );
        }
        None => hg_assert!(
            len >= texels,
            "texture transfer of {len} bytes is smaller than its {texels} texels"
        ),
    }
}

/// Cross grid cell (column, row) of each cubemap layer, in layer order:
/// +X right, -X left, +Y top, -Y bottom, +Z front, -Z back.
pub const CUBEMAP_CROSS_CELLS: [(u32, u32); 6] = [(2, 1), (0, 1), (1, 0), (1, 2), (1, 1), (3, 1)];

/// Copy regions from an unfolded cross image into the six cubemap layers.
pub(crate) fn cubemap_cross_regions(
    face_size: u32,
    aspect: vk::ImageAspectFlags,
) -> [vk::ImageCopy2<'static>; 6] {
    std::array::from_fn(|layer| {
        let (column, row) = CUBEMAP_CROSS_CELLS[layer];
        vk::ImageCopy2::default()
            .src_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(aspect)
                    .mip_level(0)
                    .base_array_layer(0)
                    .layer_count(1),
            )
            .src_offset(vk::Offset3D {
                x: (column * face_size) as i32,
                y: (row * face_size) as i32,
                z: 0,
            })
            .dst_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(aspect)
                    .mip_level(0)
                    .base_array_layer(layer as u32)
                    .layer_count(1),
            )
            .dst_offset(vk::Offset3D::default())
            .extent(vk::Extent3D {
                width: face_size,
                height: face_size,
                depth: 1,
            })
    })
}

/// A GPU texture.
///
/// Owned exclusively by its creator and released with [`Texture::destroy`],
/// which must not happen while the GPU may still use it.
pub struct Texture {
    image: vk::Image,
    allocation: Option<Allocation>,
    view: vk::ImageView,
    sampler: vk::Sampler,
    track: Rc<ImageTrack>,
    extent: vk::Extent3D,
    format: vk::Format,
    aspect: vk::ImageAspectFlags,
    mip_levels: u32,
    array_layers: u32,
    cubemap: bool,
}

impl Texture {
    /// Create a texture. The image starts in [`ImageState::Undefined`].
    pub fn new(gpu: &GpuContext, config: &TextureConfig) -> Result<Self> {
        config.validate();

        let mip_levels = config.mip_level_count();
        let extent = vk::Extent3D {
            width: config.width,
            height: config.height,
            depth: config.depth,
        };
        let flags = if config.make_cubemap {
            vk::ImageCreateFlags::CUBE_COMPATIBLE
        } else {
            vk::ImageCreateFlags::empty()
        };

        let image_info = vk::ImageCreateInfo::default()
            .flags(flags)
            .image_type(config.image_type())
            .format(config.format)
            .extent(extent)
            .mip_levels(mip_levels)
            .array_layers(config.array_layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(config.vk_usage())
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let (image, allocation) = gpu.allocator().lock().create_image(&image_info, "texture")?;

        let aspect = config.aspect.to_vk();
        let range = full_range(aspect, mip_levels, config.array_layers);
        let device = gpu.device();

        let view = if config.needs_view() {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(config.view_type())
                .format(config.format)
                .subresource_range(range);
            match unsafe { device.create_image_view(&view_info, None) } {
                Ok(view) => view,
                Err(e) => {
                    gpu.allocator().lock().free_image(image, allocation)?;
                    return Err(e.into());
                }
            }
        } else {
            vk::ImageView::null()
        };

        let sampler = if config.usage.contains(TextureUsage::SAMPLED) {
            let filter = if config.bilinear_filter {
                vk::Filter::LINEAR
            } else {
                vk::Filter::NEAREST
            };
            let mipmap_mode = if config.bilinear_filter {
                vk::SamplerMipmapMode::LINEAR
            } else {
                vk::SamplerMipmapMode::NEAREST
            };
            let address_mode = config.edge_mode.address_mode();
            let anisotropy = gpu.capabilities().sampler_anisotropy();

            let sampler_info = vk::SamplerCreateInfo::default()
                .mag_filter(filter)
                .min_filter(filter)
                .mipmap_mode(mipmap_mode)
                .address_mode_u(address_mode)
                .address_mode_v(address_mode)
                .address_mode_w(address_mode)
                .anisotropy_enable(anisotropy.is_some())
                .max_anisotropy(anisotropy.unwrap_or(1.0))
                .border_color(vk::BorderColor::FLOAT_OPAQUE_BLACK)
                .min_lod(0.0)
                .max_lod(mip_levels as f32);
            match unsafe { device.create_sampler(&sampler_info, None) } {
                Ok(sampler) => sampler,
                Err(e) => {
                    unsafe { device.destroy_image_view(view, None) };
                    gpu.allocator().lock().free_image(image, allocation)?;
                    return Err(e.into());
                }
            }
        } else {
            vk::Sampler::null()
        };

        tracing::debug!(
            "Created texture {}x{}x{} {:?}, {} mips, {} layers",
            config.width,
            config.height,
            config.depth,
            config.format,
            mip_levels,
            config.array_layers
        );

        Ok(Self {
            image,
            allocation: Some(allocation),
            view,
            sampler,
            track: Rc::new(ImageTrack::new(
                image,
                range,
                config.usage.contains(TextureUsage::SAMPLED),
                ImageState::Undefined,
            )),
            extent,
            format: config.format,
            aspect,
            mip_levels,
            array_layers: config.array_layers,
            cubemap: config.make_cubemap,
        })
    }

    pub fn image(&self) -> vk::Image {
        self.image
    }

    /// Image view, null when the texture was created transfer-only.
    pub fn image_view(&self) -> vk::ImageView {
        self.view
    }

    /// Sampler, null unless the texture is sampled.
    pub fn sampler(&self) -> vk::Sampler {
        self.sampler
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent_3d(&self) -> vk::Extent3D {
        self.extent
    }

    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    pub fn array_layers(&self) -> u32 {
        self.array_layers
    }

    pub fn is_cubemap(&self) -> bool {
        self.cubemap
    }

    /// Last-known layout state.
    pub fn state(&self) -> ImageState {
        self.track.state()
    }

    /// Texels expected by `write`: every layer of mip 0, or the unfolded
    /// cross for a cubemap.
    fn upload_texels(&self) -> u64 {
        if self.cubemap {
            let face = self.extent.width;
            mip0_texels(
                vk::Extent3D {
                    width: face * 4,
                    height: face * 3,
                    depth: 1,
                },
                1,
            )
        } else {
            mip0_texels(self.extent, self.array_layers)
        }
    }

    fn base_layers(&self, layer_count: u32) -> vk::ImageSubresourceLayers {
        vk::ImageSubresourceLayers::default()
            .aspect_mask(self.aspect)
            .mip_level(0)
            .base_array_layer(0)
            .layer_count(layer_count)
    }

    /// Upload `src` into mip 0 and leave the texture in `layout`.
    ///
    /// With `src == None` only the transition to `layout` is recorded. For a
    /// cubemap `src` holds the unfolded cross, `4 * size` by `3 * size` texels.
    pub fn write(&mut self, gpu: &GpuContext, src: Option<&[u8]>, layout: ImageState) -> Result<()> {
        let Some(data) = src else {
            return gpu.submit_one_shot(|device, cmd| unsafe {
                cmd_image_barriers(device, cmd, self.track.transition(layout).as_slice());
            });
        };
        hg_assert!(!data.is_empty(), "texture write with empty data");
        check_transfer_len(self.format, self.upload_texels(), data.len());

        let mut staging = Buffer::new(
            gpu,
            data.len() as u64,
            BufferUsage::TRANSFER_SRC,
            MemoryType::LinearAccess,
        )?;
        let result = staging.write(gpu, 0, data).and_then(|()| {
            if self.cubemap {
                self.write_cross(gpu, &staging, layout)
            } else {
                gpu.submit_one_shot(|device, cmd| unsafe {
                    cmd_image_barriers(device, cmd, self.track.transition(ImageState::TransferDst).as_slice());

                    let region = vk::BufferImageCopy2::default()
                        .buffer_offset(0)
                        .image_subresource(self.base_layers(self.array_layers))
                        .image_extent(self.extent);
                    let copy = vk::CopyBufferToImageInfo2::default()
                        .src_buffer(staging.handle())
                        .dst_image(self.image)
                        .dst_image_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                        .regions(std::slice::from_ref(&region));
                    device.cmd_copy_buffer_to_image2(cmd, &copy);

                    cmd_image_barriers(device, cmd, self.track.transition(layout).as_slice());
                })
            }
        });
        staging.destroy(gpu)?;
        result
    }

    fn write_cross(&self, gpu: &GpuContext, staging: &Buffer, layout: ImageState) -> Result<()> {
        let face = self.extent.width;
        let cross_extent = vk::Extent3D {
            width: face * 4,
            height: face * 3,
            depth: 1,
        };
        let cross_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(self.format)
            .extent(cross_extent)
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let (cross, allocation) = gpu
            .allocator()
            .lock()
            .create_image(&cross_info, "cubemap_cross")?;
        let cross_track = ImageTrack::new(
            cross,
            full_range(self.aspect, 1, 1),
            false,
            ImageState::Undefined,
        );

        let result = gpu.submit_one_shot(|device, cmd| unsafe {
            cmd_image_barriers(device, cmd, cross_track.transition(ImageState::TransferDst).as_slice());

            let region = vk::BufferImageCopy2::default()
                .buffer_offset(0)
                .image_subresource(self.base_layers(1))
                .image_extent(cross_extent);
            let upload = vk::CopyBufferToImageInfo2::default()
                .src_buffer(staging.handle())
                .dst_image(cross)
                .dst_image_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .regions(std::slice::from_ref(&region));
            device.cmd_copy_buffer_to_image2(cmd, &upload);

            let barriers: Vec<_> = cross_track
                .transition(ImageState::TransferSrc)
                .into_iter()
                .chain(self.track.transition(ImageState::TransferDst))
                .collect();
            cmd_image_barriers(device, cmd, &barriers);

            let regions = cubemap_cross_regions(face, self.aspect);
            let unfold = vk::CopyImageInfo2::default()
                .src_image(cross)
                .src_image_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                .dst_image(self.image)
                .dst_image_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .regions(&regions);
            device.cmd_copy_image2(cmd, &unfold);

            cmd_image_barriers(device, cmd, self.track.transition(layout).as_slice());
        });

        gpu.allocator().lock().free_image(cross, allocation)?;
        result
    }

    /// Fill mip levels 1.. by repeatedly blitting each level into the next,
    /// then move every level to `layout`.
    pub fn generate_mipmaps(&mut self, gpu: &GpuContext, layout: ImageState) -> Result<()> {
        hg_assert!(
            self.aspect == vk::ImageAspectFlags::COLOR,
            "mipmaps can only be generated for color textures"
        );

        let properties = unsafe {
            gpu.instance()
                .get_physical_device_format_properties(gpu.physical_device(), self.format)
        };
        if !properties
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR)
        {
            return Err(GpuError::UnsupportedFormat {
                format: self.format,
                feature: "SAMPLED_IMAGE_FILTER_LINEAR",
            });
        }

        gpu.submit_one_shot(|device, cmd| unsafe {
            cmd_image_barriers(device, cmd, self.track.transition(ImageState::TransferDst).as_slice());

            for level in 0..self.mip_levels {
                let level_range = vk::ImageSubresourceRange {
                    base_mip_level: level,
                    level_count: 1,
                    ..self.track.range()
                };
                let to_src = ImageBarrier::for_range(
                    self.image,
                    level_range,
                    ImageState::TransferDst,
                    ImageState::TransferSrc,
                );
                cmd_image_barriers(device, cmd, to_src.as_slice());

                if level + 1 == self.mip_levels {
                    break;
                }

                let src = mip_extent(self.extent, level);
                let dst = mip_extent(self.extent, level + 1);
                let layers = |mip_level| {
                    vk::ImageSubresourceLayers::default()
                        .aspect_mask(self.aspect)
                        .mip_level(mip_level)
                        .base_array_layer(0)
                        .layer_count(self.array_layers)
                };
                let blit = vk::ImageBlit2::default()
                    .src_subresource(layers(level))
                    .src_offsets([vk::Offset3D::default(), extent_offset(src)])
                    .dst_subresource(layers(level + 1))
                    .dst_offsets([vk::Offset3D::default(), extent_offset(dst)]);
                let info = vk::BlitImageInfo2::default()
                    .src_image(self.image)
                    .src_image_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                    .dst_image(self.image)
                    .dst_image_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                    .regions(std::slice::from_ref(&blit))
                    .filter(vk::Filter::LINEAR);
                device.cmd_blit_image2(cmd, &info);
            }

            self.track.reset_state(ImageState::TransferSrc);
            cmd_image_barriers(device, cmd, self.track.transition(layout).as_slice());
        })
    }

    /// Download mip 0 of every layer into `out`.
    ///
    /// The texture returns to its previous layout afterwards, or stays in
    /// transfer-source if its contents were undefined.
    pub fn read(&self, gpu: &GpuContext, out: &mut [u8]) -> Result<()> {
        hg_assert!(!out.is_empty(), "texture read into empty buffer");
        check_transfer_len(self.format, mip0_texels(self.extent, self.array_layers), out.len());

        let staging = Buffer::new(
            gpu,
            out.len() as u64,
            BufferUsage::TRANSFER_DST,
            MemoryType::RandomAccess,
        )?;
        let previous = self.track.state();
        let result = gpu
            .submit_one_shot(|device, cmd| unsafe {
                cmd_image_barriers(device, cmd, self.track.transition(ImageState::TransferSrc).as_slice());

                let region = vk::BufferImageCopy2::default()
                    .buffer_offset(0)
                    .image_subresource(self.base_layers(self.array_layers))
                    .image_extent(self.extent);
                let copy = vk::CopyImageToBufferInfo2::default()
                    .src_image(self.image)
                    .src_image_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                    .dst_buffer(staging.handle())
                    .regions(std::slice::from_ref(&region));
                device.cmd_copy_image_to_buffer2(cmd, &copy);

                if previous != ImageState::Undefined {
                    cmd_image_barriers(device, cmd, self.track.transition(previous).as_slice());
                }
            })
            .and_then(|()| staging.read(gpu, 0, out));
        staging.destroy(gpu)?;
        result
    }

    /// Destroy the texture.
    ///
    /// Dropping the tracked state here is what lets the render pass tracker
    /// forget it: its weak reference no longer upgrades.
    pub fn destroy(mut self, gpu: &GpuContext) -> Result<()> {
        let device = gpu.device();
        unsafe {
            if self.sampler != vk::Sampler::null() {
                device.destroy_sampler(self.sampler, None);
            }
            if self.view != vk::ImageView::null() {
                device.destroy_image_view(self.view, None);
            }
        }
        match self.allocation.take() {
            Some(allocation) => gpu.allocator().lock().free_image(self.image, allocation),
            None => Ok(()),
        }
    }
}

impl Attachment for Texture {
    fn track(&self) -> &Rc<ImageTrack> {
        &self.track
    }

    fn view(&self) -> vk::ImageView {
        self.view
    }

    fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.extent.width,
            height: self.extent.height,
        }
    }
}

fn extent_offset(extent: vk::Extent3D) -> vk::Offset3D {
    vk::Offset3D {
        x: extent.width as i32,
        y: extent.height as i32,
        z: extent.depth as i32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mip_count_matches_formula() {
        assert_eq!(max_mip_count(256, 256, 1), 9);
        assert_eq!(max_mip_count(1, 1, 1), 1);
        assert_eq!(max_mip_count(0, 0, 0), 0);
        assert_eq!(max_mip_count(300, 150, 1), 9);
    }

    #[test]
    fn mip_count_uses_largest_dimension() {
        assert_eq!(max_mip_count(1, 1, 64), 7);
        assert_eq!(max_mip_count(0, 1024, 0), 11);
    }

    #[test]
    fn mip_extent_floors_and_clamps() {
        let extent = vk::Extent3D {
            width: 300,
            height: 150,
            depth: 1,
        };
        assert_eq!(mip_extent(extent, 1), vk::Extent3D { width: 150, height: 75, depth: 1 });
        assert_eq!(mip_extent(extent, 2), vk::Extent3D { width: 75, height: 37, depth: 1 });
        assert_eq!(mip_extent(extent, 8), vk::Extent3D { width: 1, height: 1, depth: 1 });
    }

    #[test]
    fn cross_regions_follow_face_layout() {
        let regions = cubemap_cross_regions(16, vk::ImageAspectFlags::COLOR);
        let offsets: Vec<(i32, i32, u32)> = regions
            .iter()
            .map(|r| (r.src_offset.x, r.src_offset.y, r.dst_subresource.base_array_layer))
            .collect();
        assert_eq!(
            offsets,
            vec![(32, 16, 0), (0, 16, 1), (16, 0, 2), (16, 32, 3), (16, 16, 4), (48, 16, 5)]
        );
    }

    #[test]
    fn cross_regions_stay_inside_cross_and_do_not_overlap() {
        let face = 8;
        let regions = cubemap_cross_regions(face, vk::ImageAspectFlags::COLOR);
        let mut cells = std::collections::HashSet::new();
        for region in &regions {
            assert_eq!(region.extent.width, face);
            assert_eq!(region.extent.height, face);
            assert!(region.src_offset.x as u32 + face <= face * 4);
            assert!(region.src_offset.y as u32 + face <= face * 3);
            assert_eq!(region.dst_offset, vk::Offset3D::default());
            assert!(cells.insert((region.src_offset.x, region.src_offset.y)));
        }
    }

    #[test]
    fn transfer_bits_are_always_present() {
        let config = TextureConfig::new(4, 4, vk::Format::R8G8B8A8_UNORM, TextureUsage::SAMPLED);
        let usage = config.vk_usage();
        assert!(usage.contains(vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST));
        assert!(usage.contains(vk::ImageUsageFlags::SAMPLED));
        assert!(!usage.contains(vk::ImageUsageFlags::COLOR_ATTACHMENT));
    }

    #[test]
    fn view_types() {
        let format = vk::Format::R8G8B8A8_UNORM;
        let plain = TextureConfig::new(4, 4, format, TextureUsage::SAMPLED);
        assert_eq!(plain.view_type(), vk::ImageViewType::TYPE_2D);

        let cube = TextureConfig::cubemap(4, format, TextureUsage::SAMPLED);
        assert_eq!(cube.view_type(), vk::ImageViewType::CUBE);

        let array = TextureConfig {
            array_layers: 3,
            ..plain.clone()
        };
        assert_eq!(array.view_type(), vk::ImageViewType::TYPE_2D_ARRAY);

        let volume = TextureConfig { depth: 8, ..plain };
        assert_eq!(volume.view_type(), vk::ImageViewType::TYPE_3D);
        assert_eq!(volume.image_type(), vk::ImageType::TYPE_3D);
    }

    #[test]
    fn transfer_only_textures_get_no_view() {
        let config = TextureConfig::new(
            4,
            4,
            vk::Format::R8G8B8A8_UNORM,
            TextureUsage::TRANSFER_SRC | TextureUsage::TRANSFER_DST,
        );
        assert!(!config.needs_view());
    }

    #[test]
    fn zero_mip_levels_means_one() {
        let config = TextureConfig::new(4, 4, vk::Format::R8G8B8A8_UNORM, TextureUsage::SAMPLED)
            .with_mip_levels(0);
        assert_eq!(config.mip_level_count(), 1);
    }

    #[test]
    fn depth_buffer_config() {
        let config = TextureConfig::depth_buffer(640, 480, vk::Format::D32_SFLOAT);
        assert_eq!(config.aspect.to_vk(), vk::ImageAspectFlags::DEPTH);
        assert!(config
            .vk_usage()
            .contains(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT));
    }

    #[test]
    #[should_panic(expected = "cubemap faces must be square")]
    #[cfg(any(debug_assertions, feature = "strict-asserts"))]
    fn rejects_non_square_cubemap() {
        let config = TextureConfig {
            width: 8,
            ..TextureConfig::cubemap(4, vk::Format::R8G8B8A8_UNORM, TextureUsage::SAMPLED)
        };
        config.validate();
    }

    #[test]
    #[should_panic(expected = "dimensions must be non-zero")]
    #[cfg(any(debug_assertions, feature = "strict-asserts"))]
    fn rejects_zero_size() {
        TextureConfig::new(0, 4, vk::Format::R8G8B8A8_UNORM, TextureUsage::SAMPLED).validate();
    }

    #[test]
    fn transfer_len_matches_image() {
        let extent = vk::Extent3D {
            width: 64,
            height: 32,
            depth: 1,
        };
        assert_eq!(mip0_texels(extent, 6), 64 * 32 * 6);
        check_transfer_len(vk::Format::R8G8B8A8_UNORM, mip0_texels(extent, 1), 64 * 32 * 4);
        // Unknown texel size only needs a byte per texel
        check_transfer_len(vk::Format::BC1_RGB_UNORM_BLOCK, 16, 64);
    }

    #[test]
    #[should_panic(expected = "texture transfer of 16 bytes, image needs 16384")]
    #[cfg(any(debug_assertions, feature = "strict-asserts"))]
    fn rejects_short_transfer() {
        let extent = vk::Extent3D {
            width: 64,
            height: 64,
            depth: 1,
        };
        check_transfer_len(vk::Format::R8G8B8A8_UNORM, mip0_texels(extent, 1), 16);
    }

    #[test]
    #[should_panic(expected = "smaller than its 256 texels")]
    #[cfg(any(debug_assertions, feature = "strict-asserts"))]
    fn rejects_short_transfer_of_unknown_format() {
        check_transfer_len(vk::Format::BC1_RGB_UNORM_BLOCK, 256, 100);
    }

    #[test]
    fn known_texel_sizes() {
        assert_eq!(texel_size(vk::Format::R8G8B8A8_UNORM), Some(4));
        assert_eq!(texel_size(vk::Format::R32G32B32A32_SFLOAT), Some(16));
        assert_eq!(texel_size(vk::Format::BC1_RGB_UNORM_BLOCK), None);
    }
}
