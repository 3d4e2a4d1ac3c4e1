//! Descriptor set layouts, per-frame pools and descriptor writes.
//!
//! Sets are transient: every bind allocates a fresh set from the current
//! frame's pool, and the pool is reset wholesale when that frame slot comes
//! around again.

use crate::buffer::Buffer;
use crate::error::Result;
use crate::texture::Texture;
use ash::vk;

/// Descriptors of each type a frame's pool can hand out.
pub const DESCRIPTORS_PER_TYPE: u32 = 512;

/// Sets a frame's pool can hand out.
pub const MAX_DESCRIPTOR_SETS: u32 = 1024;

/// Kind of resource a descriptor binding refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    UniformBuffer,
    StorageBuffer,
    /// Combined image sampler, read in shader-read-only layout.
    SampledTexture,
    /// Storage image, accessed in general layout.
    StorageTexture,
}

impl DescriptorKind {
    pub fn vk_type(self) -> vk::DescriptorType {
        match self {
            Self::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            Self::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
            Self::SampledTexture => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            Self::StorageTexture => vk::DescriptorType::STORAGE_IMAGE,
        }
    }
}

/// Resources for one binding of a descriptor set. The binding index is the
/// descriptor's position in the slice handed to
/// [`RenderContext::bind_descriptor_set`](crate::RenderContext::bind_descriptor_set).
#[derive(Clone, Copy)]
pub enum Descriptor<'a> {
    UniformBuffer(&'a [&'a Buffer]),
    StorageBuffer(&'a [&'a Buffer]),
    SampledTexture(&'a [&'a Texture]),
    StorageTexture(&'a [&'a Texture]),
}

impl Descriptor<'_> {
    pub fn kind(&self) -> DescriptorKind {
        match self {
            Self::UniformBuffer(_) => DescriptorKind::UniformBuffer,
            Self::StorageBuffer(_) => DescriptorKind::StorageBuffer,
            Self::SampledTexture(_) => DescriptorKind::SampledTexture,
            Self::StorageTexture(_) => DescriptorKind::StorageTexture,
        }
    }

    /// Number of array elements.
    pub fn len(&self) -> usize {
        match self {
            Self::UniformBuffer(buffers) | Self::StorageBuffer(buffers) => buffers.len(),
            Self::SampledTexture(textures) | Self::StorageTexture(textures) => textures.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Descriptor set layout builder.
#[derive(Default)]
pub struct DescriptorSetLayoutBuilder<'a> {
    bindings: Vec<vk::DescriptorSetLayoutBinding<'a>>,
}

impl DescriptorSetLayoutBuilder<'_> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a binding.
    pub fn binding(
        mut self,
        binding: u32,
        kind: DescriptorKind,
        count: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(kind.vk_type())
                .descriptor_count(count)
                .stage_flags(stage_flags),
        );
        self
    }

    /// Build the descriptor set layout.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn build(self, device: &ash::Device) -> Result<vk::DescriptorSetLayout> {
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&self.bindings);

        let layout = device.create_descriptor_set_layout(&layout_info, None)?;
        Ok(layout)
    }
}

/// Pool sizes of a frame's descriptor pool.
pub(crate) fn frame_pool_sizes() -> [vk::DescriptorPoolSize; 4] {
    [
        DescriptorKind::UniformBuffer,
        DescriptorKind::StorageBuffer,
        DescriptorKind::SampledTexture,
        DescriptorKind::StorageTexture,
    ]
    .map(|kind| {
        vk::DescriptorPoolSize::default()
            .ty(kind.vk_type())
            .descriptor_count(DESCRIPTORS_PER_TYPE)
    })
}

/// Descriptor pool owned by one frame slot.
///
/// Sets are never freed individually; [`DescriptorPool::reset`] releases them
/// all at once.
pub struct DescriptorPool {
    pool: vk::DescriptorPool,
}

impl DescriptorPool {
    /// Create a pool sized for one frame.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(device: &ash::Device) -> Result<Self> {
        let pool_sizes = frame_pool_sizes();
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(MAX_DESCRIPTOR_SETS)
            .pool_sizes(&pool_sizes);

        let pool = device.create_descriptor_pool(&create_info, None)?;
        Ok(Self { pool })
    }

    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }

    /// Allocate one set with `layout`.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn allocate(
        &self,
        device: &ash::Device,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet> {
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(std::slice::from_ref(&layout));

        let sets = device.allocate_descriptor_sets(&alloc_info)?;
        Ok(sets[0])
    }

    /// Reset the pool, freeing all descriptor sets.
    ///
    /// # Safety
    /// The device must be valid and no set from this pool may be in use.
    pub unsafe fn reset(&self, device: &ash::Device) -> Result<()> {
        device.reset_descriptor_pool(self.pool, vk::DescriptorPoolResetFlags::empty())?;
        Ok(())
    }

    /// Destroy the pool.
    ///
    /// # Safety
    /// The device must be valid and the pool must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_descriptor_pool(self.pool, None);
    }
}

/// Write every element of `descriptors` into `set`, one update per element.
///
/// # Safety
/// The device, the set and every referenced resource must be valid.
pub(crate) unsafe fn write_descriptor_set(
    device: &ash::Device,
    set: vk::DescriptorSet,
    descriptors: &[Descriptor],
) {
    for (binding, descriptor) in descriptors.iter().enumerate() {
        let binding = binding as u32;
        let ty = descriptor.kind().vk_type();
        match descriptor {
            Descriptor::UniformBuffer(buffers) | Descriptor::StorageBuffer(buffers) => {
                for (element, buffer) in buffers.iter().enumerate() {
                    let info = vk::DescriptorBufferInfo::default()
                        .buffer(buffer.handle())
                        .offset(0)
                        .range(buffer.size());
                    let write = vk::WriteDescriptorSet::default()
                        .dst_set(set)
                        .dst_binding(binding)
                        .dst_array_element(element as u32)
                        .descriptor_type(ty)
                        .buffer_info(std::slice::from_ref(&info));
                    device.update_descriptor_sets(&[write], &[]);
                }
            }
            Descriptor::SampledTexture(textures) | Descriptor::StorageTexture(textures) => {
                for (element, texture) in textures.iter().enumerate() {
                    let info = texture_image_info(
                        descriptor.kind(),
                        texture.image_view(),
                        texture.sampler(),
                    );
                    let write = vk::WriteDescriptorSet::default()
                        .dst_set(set)
                        .dst_binding(binding)
                        .dst_array_element(element as u32)
                        .descriptor_type(ty)
                        .image_info(std::slice::from_ref(&info));
                    device.update_descriptor_sets(&[write], &[]);
                }
            }
        }
    }
}

/// Image info for one texture element: sampled textures are read through
/// their sampler in shader-read-only, storage textures in general.
fn texture_image_info(
    kind: DescriptorKind,
    view: vk::ImageView,
    sampler: vk::Sampler,
) -> vk::DescriptorImageInfo {
    hg_assert!(view != vk::ImageView::null(), "texture descriptor without an image view");
    let info = vk::DescriptorImageInfo::default().image_view(view);
    if kind == DescriptorKind::SampledTexture {
        hg_assert!(
            sampler != vk::Sampler::null(),
            "sampled texture descriptor needs a texture created with TextureUsage::SAMPLED"
        );
        info.sampler(sampler)
            .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
    } else {
        info.image_layout(vk::ImageLayout::GENERAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_pool_covers_every_kind() {
        let sizes = frame_pool_sizes();
        let types: Vec<_> = sizes.iter().map(|s| s.ty).collect();
        assert_eq!(
            types,
            vec![
                vk::DescriptorType::UNIFORM_BUFFER,
                vk::DescriptorType::STORAGE_BUFFER,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                vk::DescriptorType::STORAGE_IMAGE,
            ]
        );
        assert!(sizes.iter().all(|s| s.descriptor_count == 512));
        assert_eq!(MAX_DESCRIPTOR_SETS, 1024);
    }

    #[test]
    fn descriptor_kind_and_len() {
        let empty: &[&Buffer] = &[];
        let descriptor = Descriptor::StorageBuffer(empty);
        assert_eq!(descriptor.kind(), DescriptorKind::StorageBuffer);
        assert!(descriptor.is_empty());

        let textures: &[&Texture] = &[];
        assert_eq!(
            Descriptor::SampledTexture(textures).kind().vk_type(),
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        );
    }

    #[test]
    fn texture_infos_pick_layout_by_kind() {
        use ash::vk::Handle;
        let view = vk::ImageView::from_raw(1);
        let sampler = vk::Sampler::from_raw(2);

        let sampled = texture_image_info(DescriptorKind::SampledTexture, view, sampler);
        assert_eq!(sampled.image_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(sampled.sampler, sampler);

        let storage = texture_image_info(DescriptorKind::StorageTexture, view, vk::Sampler::null());
        assert_eq!(storage.image_layout, vk::ImageLayout::GENERAL);
        assert_eq!(storage.sampler, vk::Sampler::null());
    }

    #[test]
    #[should_panic(expected = "needs a texture created with TextureUsage::SAMPLED")]
    #[cfg(any(debug_assertions, feature = "strict-asserts"))]
    fn sampled_descriptor_rejects_missing_sampler() {
        use ash::vk::Handle;
        texture_image_info(
            DescriptorKind::SampledTexture,
            vk::ImageView::from_raw(1),
            vk::Sampler::null(),
        );
    }

    #[test]
    fn layout_builder_collects_bindings() {
        let builder = DescriptorSetLayoutBuilder::new()
            .binding(0, DescriptorKind::UniformBuffer, 1, vk::ShaderStageFlags::VERTEX)
            .binding(1, DescriptorKind::SampledTexture, 4, vk::ShaderStageFlags::FRAGMENT);
        assert_eq!(builder.bindings.len(), 2);
        assert_eq!(builder.bindings[1].descriptor_count, 4);
        assert_eq!(
            builder.bindings[1].descriptor_type,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        );
    }
}
