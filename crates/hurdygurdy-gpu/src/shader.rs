//! Shader objects: a pipeline together with its layout and descriptor set
//! layouts.
//!
//! Fixed-function state is narrow. Viewport and scissor are
//! dynamic, the front face is counter-clockwise, and blending (when enabled)
//! is plain `src_alpha, 1 - src_alpha`.

use crate::context::GpuContext;
use crate::descriptors::{DescriptorKind, DescriptorSetLayoutBuilder};
use crate::error::{GpuError, Result};
use ash::vk;
use std::io::Cursor;

/// One attribute inside a vertex binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexAttribute {
    pub format: vk::Format,
    /// Byte offset inside the vertex.
    pub offset: u32,
}

/// A vertex buffer binding and the attributes read from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexBinding {
    pub stride: u32,
    pub input_rate: vk::VertexInputRate,
    pub attributes: Vec<VertexAttribute>,
}

impl VertexBinding {
    pub fn per_vertex(stride: u32, attributes: Vec<VertexAttribute>) -> Self {
        Self {
            stride,
            input_rate: vk::VertexInputRate::VERTEX,
            attributes,
        }
    }

    pub fn per_instance(stride: u32, attributes: Vec<VertexAttribute>) -> Self {
        Self {
            stride,
            input_rate: vk::VertexInputRate::INSTANCE,
            attributes,
        }
    }
}

/// One binding of a descriptor set. Its binding index is its position in the
/// set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorBinding {
    pub kind: DescriptorKind,
    /// Array size.
    pub count: u32,
}

impl DescriptorBinding {
    pub fn new(kind: DescriptorKind, count: u32) -> Self {
        Self { kind, count }
    }
}

/// Graphics shader parameters.
#[derive(Debug, Clone)]
pub struct ShaderConfig<'a> {
    pub color_format: vk::Format,
    /// Ignored unless `enable_depth_buffer` is set.
    pub depth_format: vk::Format,
    pub vertex_spirv: &'a [u8],
    pub fragment_spirv: &'a [u8],
    pub vertex_bindings: Vec<VertexBinding>,
    /// One entry per descriptor set, each listing that set's bindings.
    pub descriptor_sets: Vec<Vec<DescriptorBinding>>,
    /// Size of the single push constant range; 0 for none.
    pub push_constant_size: u32,
    pub topology: vk::PrimitiveTopology,
    pub cull_mode: vk::CullModeFlags,
    pub enable_depth_buffer: bool,
    pub enable_color_blend: bool,
}

impl<'a> ShaderConfig<'a> {
    pub fn new(vertex_spirv: &'a [u8], fragment_spirv: &'a [u8], color_format: vk::Format) -> Self {
        Self {
            color_format,
            depth_format: vk::Format::UNDEFINED,
            vertex_spirv,
            fragment_spirv,
            vertex_bindings: Vec::new(),
            descriptor_sets: Vec::new(),
            push_constant_size: 0,
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            cull_mode: vk::CullModeFlags::BACK,
            enable_depth_buffer: false,
            enable_color_blend: false,
        }
    }

    pub fn with_depth(mut self, depth_format: vk::Format) -> Self {
        self.depth_format = depth_format;
        self.enable_depth_buffer = true;
        self
    }

    pub fn with_vertex_binding(mut self, binding: VertexBinding) -> Self {
        self.vertex_bindings.push(binding);
        self
    }

    pub fn with_descriptor_set(mut self, bindings: Vec<DescriptorBinding>) -> Self {
        self.descriptor_sets.push(bindings);
        self
    }

    pub fn with_push_constants(mut self, size: u32) -> Self {
        self.push_constant_size = size;
        self
    }

    pub fn with_cull_mode(mut self, cull_mode: vk::CullModeFlags) -> Self {
        self.cull_mode = cull_mode;
        self
    }

    pub fn with_topology(mut self, topology: vk::PrimitiveTopology) -> Self {
        self.topology = topology;
        self
    }

    pub fn with_color_blend(mut self, enable: bool) -> Self {
        self.enable_color_blend = enable;
        self
    }
}

/// Compute shader parameters.
#[derive(Debug, Clone)]
pub struct ComputeShaderConfig<'a> {
    pub spirv: &'a [u8],
    pub descriptor_sets: Vec<Vec<DescriptorBinding>>,
    pub push_constant_size: u32,
}

impl<'a> ComputeShaderConfig<'a> {
    pub fn new(spirv: &'a [u8]) -> Self {
        Self {
            spirv,
            descriptor_sets: Vec::new(),
            push_constant_size: 0,
        }
    }

    pub fn with_descriptor_set(mut self, bindings: Vec<DescriptorBinding>) -> Self {
        self.descriptor_sets.push(bindings);
        self
    }

    pub fn with_push_constants(mut self, size: u32) -> Self {
        self.push_constant_size = size;
        self
    }
}

/// Flatten nested vertex bindings into Vulkan's binding and attribute arrays.
///
/// Locations run on across bindings, so the second binding's first attribute
/// follows the first binding's last one.
pub(crate) fn flatten_vertex_input(
    bindings: &[VertexBinding],
) -> (
    Vec<vk::VertexInputBindingDescription>,
    Vec<vk::VertexInputAttributeDescription>,
) {
    let mut binding_descriptions = Vec::with_capacity(bindings.len());
    let mut attribute_descriptions = Vec::new();
    let mut location = 0;

    for (index, binding) in bindings.iter().enumerate() {
        binding_descriptions.push(
            vk::VertexInputBindingDescription::default()
                .binding(index as u32)
                .stride(binding.stride)
                .input_rate(binding.input_rate),
        );
        for attribute in &binding.attributes {
            attribute_descriptions.push(
                vk::VertexInputAttributeDescription::default()
                    .location(location)
                    .binding(index as u32)
                    .format(attribute.format)
                    .offset(attribute.offset),
            );
            location += 1;
        }
    }

    (binding_descriptions, attribute_descriptions)
}

/// Depth test used by graphics shaders: `LESS_OR_EQUAL` when blending so
/// translucent geometry can be redrawn at equal depth, `LESS` otherwise.
pub(crate) fn depth_compare_op(enable_color_blend: bool) -> vk::CompareOp {
    if enable_color_blend {
        vk::CompareOp::LESS_OR_EQUAL
    } else {
        vk::CompareOp::LESS
    }
}

pub(crate) fn color_blend_attachment(enable: bool) -> vk::PipelineColorBlendAttachmentState {
    let attachment =
        vk::PipelineColorBlendAttachmentState::default().color_write_mask(vk::ColorComponentFlags::RGBA);
    if !enable {
        return attachment.blend_enable(false);
    }
    attachment
        .blend_enable(true)
        .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
        .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
        .color_blend_op(vk::BlendOp::ADD)
        .src_alpha_blend_factor(vk::BlendFactor::ONE)
        .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
        .alpha_blend_op(vk::BlendOp::ADD)
}

/// Decode SPIR-V bytes into words.
pub(crate) fn decode_spirv(bytes: &[u8], what: &str) -> Result<Vec<u32>> {
    hg_assert!(!bytes.is_empty(), "{what} shader SPIR-V is empty");
    ash::util::read_spv(&mut Cursor::new(bytes))
        .map_err(|e| GpuError::InvalidSpirv(format!("{what}: {e}")))
}

unsafe fn create_module(device: &ash::Device, code: &[u32]) -> Result<vk::ShaderModule> {
    let info = vk::ShaderModuleCreateInfo::default().code(code);
    Ok(device.create_shader_module(&info, None)?)
}

/// Descriptor set layouts and the pipeline layout built on them.
struct LayoutParts {
    set_layouts: Vec<vk::DescriptorSetLayout>,
    layout: vk::PipelineLayout,
}

impl LayoutParts {
    unsafe fn new(
        device: &ash::Device,
        descriptor_sets: &[Vec<DescriptorBinding>],
        push_constant_size: u32,
        stages: vk::ShaderStageFlags,
    ) -> Result<Self> {
        let mut set_layouts = Vec::with_capacity(descriptor_sets.len());
        for set in descriptor_sets {
            let builder = set
                .iter()
                .enumerate()
                .fold(DescriptorSetLayoutBuilder::new(), |builder, (index, binding)| {
                    builder.binding(index as u32, binding.kind, binding.count, stages)
                });
            match builder.build(device) {
                Ok(layout) => set_layouts.push(layout),
                Err(e) => {
                    destroy_set_layouts(device, &set_layouts);
                    return Err(e);
                }
            }
        }

        let push_constant_range = vk::PushConstantRange::default()
            .stage_flags(stages)
            .offset(0)
            .size(push_constant_size);
        let push_constant_ranges: &[vk::PushConstantRange] = if push_constant_size > 0 {
            std::slice::from_ref(&push_constant_range)
        } else {
            &[]
        };

        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(push_constant_ranges);
        match device.create_pipeline_layout(&layout_info, None) {
            Ok(layout) => Ok(Self {
                set_layouts,
                layout,
            }),
            Err(e) => {
                destroy_set_layouts(device, &set_layouts);
                Err(GpuError::PipelineCreation(e.to_string()))
            }
        }
    }

    unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_pipeline_layout(self.layout, None);
        destroy_set_layouts(device, &self.set_layouts);
    }
}

unsafe fn destroy_set_layouts(device: &ash::Device, layouts: &[vk::DescriptorSetLayout]) {
    for &layout in layouts {
        device.destroy_descriptor_set_layout(layout, None);
    }
}

/// A graphics or compute pipeline with everything needed to bind it.
pub struct Shader {
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    set_layouts: Vec<vk::DescriptorSetLayout>,
    bind_point: vk::PipelineBindPoint,
    stages: vk::ShaderStageFlags,
    push_constant_size: u32,
}

impl Shader {
    /// Create a graphics shader rendering into `config.color_format` (and
    /// the depth format when depth buffering is enabled).
    pub fn new(gpu: &GpuContext, config: &ShaderConfig) -> Result<Self> {
        hg_assert!(!config.vertex_spirv.is_empty(), "vertex shader SPIR-V is missing");
        hg_assert!(!config.fragment_spirv.is_empty(), "fragment shader SPIR-V is missing");
        hg_assert!(
            config.color_format != vk::Format::UNDEFINED,
            "color format must be defined"
        );
        if config.enable_depth_buffer {
            hg_assert!(
                config.depth_format != vk::Format::UNDEFINED,
                "depth buffering needs a depth format"
            );
        }

        let vertex_code = decode_spirv(config.vertex_spirv, "vertex")?;
        let fragment_code = decode_spirv(config.fragment_spirv, "fragment")?;
        let stages = vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT;
        let device = gpu.device();

        unsafe {
            let parts = LayoutParts::new(
                device,
                &config.descriptor_sets,
                config.push_constant_size,
                stages,
            )?;

            let vertex_module = match create_module(device, &vertex_code) {
                Ok(module) => module,
                Err(e) => {
                    parts.destroy(device);
                    return Err(e);
                }
            };
            let fragment_module = match create_module(device, &fragment_code) {
                Ok(module) => module,
                Err(e) => {
                    device.destroy_shader_module(vertex_module, None);
                    parts.destroy(device);
                    return Err(e);
                }
            };

            let result = create_graphics_pipeline(
                device,
                config,
                parts.layout,
                vertex_module,
                fragment_module,
            );

            device.destroy_shader_module(vertex_module, None);
            device.destroy_shader_module(fragment_module, None);

            let pipeline = match result {
                Ok(pipeline) => pipeline,
                Err(e) => {
                    parts.destroy(device);
                    return Err(e);
                }
            };

            tracing::debug!(
                "Created graphics shader: {} sets, {} push constant bytes",
                parts.set_layouts.len(),
                config.push_constant_size
            );

            Ok(Self {
                pipeline,
                layout: parts.layout,
                set_layouts: parts.set_layouts,
                bind_point: vk::PipelineBindPoint::GRAPHICS,
                stages,
                push_constant_size: config.push_constant_size,
            })
        }
    }

    /// Create a compute shader.
    pub fn new_compute(gpu: &GpuContext, config: &ComputeShaderConfig) -> Result<Self> {
        hg_assert!(!config.spirv.is_empty(), "compute shader SPIR-V is missing");

        let code = decode_spirv(config.spirv, "compute")?;
        let stages = vk::ShaderStageFlags::COMPUTE;
        let device = gpu.device();

        unsafe {
            let parts = LayoutParts::new(
                device,
                &config.descriptor_sets,
                config.push_constant_size,
                stages,
            )?;

            let module = match create_module(device, &code) {
                Ok(module) => module,
                Err(e) => {
                    parts.destroy(device);
                    return Err(e);
                }
            };

            let stage_info = vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::COMPUTE)
                .module(module)
                .name(c"main");
            let pipeline_info = vk::ComputePipelineCreateInfo::default()
                .stage(stage_info)
                .layout(parts.layout);

            let result = device
                .create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
                .map_err(|(_pipelines, e)| GpuError::PipelineCreation(e.to_string()));

            device.destroy_shader_module(module, None);

            let pipeline = match result {
                Ok(pipelines) => pipelines[0],
                Err(e) => {
                    parts.destroy(device);
                    return Err(e);
                }
            };

            tracing::debug!("Created compute shader: {} sets", parts.set_layouts.len());

            Ok(Self {
                pipeline,
                layout: parts.layout,
                set_layouts: parts.set_layouts,
                bind_point: vk::PipelineBindPoint::COMPUTE,
                stages,
                push_constant_size: config.push_constant_size,
            })
        }
    }

    pub fn pipeline(&self) -> vk::Pipeline {
        self.pipeline
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    pub fn set_layouts(&self) -> &[vk::DescriptorSetLayout] {
        &self.set_layouts
    }

    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        self.bind_point
    }

    /// Stages descriptors and push constants are visible to.
    pub fn stages(&self) -> vk::ShaderStageFlags {
        self.stages
    }

    pub fn push_constant_size(&self) -> u32 {
        self.push_constant_size
    }

    /// Destroy the shader. It must not be in use by the GPU.
    pub fn destroy(self, gpu: &GpuContext) {
        let device = gpu.device();
        unsafe {
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.layout, None);
            destroy_set_layouts(device, &self.set_layouts);
        }
    }
}

unsafe fn create_graphics_pipeline(
    device: &ash::Device,
    config: &ShaderConfig,
    layout: vk::PipelineLayout,
    vertex_module: vk::ShaderModule,
    fragment_module: vk::ShaderModule,
) -> Result<vk::Pipeline> {
    let shader_stages = [
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vertex_module)
            .name(c"main"),
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(fragment_module)
            .name(c"main"),
    ];

    let (bindings, attributes) = flatten_vertex_input(&config.vertex_bindings);
    let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(&attributes);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(config.topology)
        .primitive_restart_enable(false);

    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);

    let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
        .polygon_mode(vk::PolygonMode::FILL)
        .cull_mode(config.cull_mode)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .line_width(1.0);

    let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(config.enable_depth_buffer)
        .depth_write_enable(config.enable_depth_buffer)
        .depth_compare_op(depth_compare_op(config.enable_color_blend))
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false);

    let blend_attachment = color_blend_attachment(config.enable_color_blend);
    let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
        .logic_op_enable(false)
        .attachments(std::slice::from_ref(&blend_attachment));

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    let color_formats = [config.color_format];
    let mut rendering_info =
        vk::PipelineRenderingCreateInfo::default().color_attachment_formats(&color_formats);
    if config.enable_depth_buffer {
        rendering_info = rendering_info.depth_attachment_format(config.depth_format);
    }

    let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&shader_stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization)
        .multisample_state(&multisampling)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blending)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .push_next(&mut rendering_info);

    let pipelines = device
        .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        .map_err(|(_pipelines, e)| GpuError::PipelineCreation(e.to_string()))?;
    Ok(pipelines[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attribute(format: vk::Format, offset: u32) -> VertexAttribute {
        VertexAttribute { format, offset }
    }

    #[test]
    fn single_binding_locations_are_attribute_indices() {
        let bindings = [VertexBinding::per_vertex(
            20,
            vec![
                attribute(vk::Format::R32G32B32_SFLOAT, 0),
                attribute(vk::Format::R32G32_SFLOAT, 12),
            ],
        )];
        let (descriptions, attributes) = flatten_vertex_input(&bindings);

        assert_eq!(descriptions.len(), 1);
        assert_eq!(descriptions[0].stride, 20);
        let locations: Vec<_> = attributes.iter().map(|a| (a.location, a.offset)).collect();
        assert_eq!(locations, vec![(0, 0), (1, 12)]);
    }

    #[test]
    fn locations_are_unique_across_bindings() {
        let bindings = [
            VertexBinding::per_vertex(12, vec![attribute(vk::Format::R32G32B32_SFLOAT, 0)]),
            VertexBinding::per_instance(
                32,
                vec![
                    attribute(vk::Format::R32G32B32A32_SFLOAT, 0),
                    attribute(vk::Format::R32G32B32A32_SFLOAT, 16),
                ],
            ),
        ];
        let (descriptions, attributes) = flatten_vertex_input(&bindings);

        assert_eq!(descriptions[1].binding, 1);
        assert_eq!(descriptions[1].input_rate, vk::VertexInputRate::INSTANCE);
        let placed: Vec<_> = attributes.iter().map(|a| (a.binding, a.location)).collect();
        assert_eq!(placed, vec![(0, 0), (1, 1), (1, 2)]);
    }

    #[test]
    fn no_bindings_means_no_vertex_input() {
        let (descriptions, attributes) = flatten_vertex_input(&[]);
        assert!(descriptions.is_empty());
        assert!(attributes.is_empty());
    }

    #[test]
    fn depth_compare_follows_blending() {
        assert_eq!(depth_compare_op(true), vk::CompareOp::LESS_OR_EQUAL);
        assert_eq!(depth_compare_op(false), vk::CompareOp::LESS);
    }

    #[test]
    fn blending_is_standard_alpha() {
        let blend = color_blend_attachment(true);
        assert_eq!(blend.blend_enable, vk::TRUE);
        assert_eq!(blend.src_color_blend_factor, vk::BlendFactor::SRC_ALPHA);
        assert_eq!(blend.dst_color_blend_factor, vk::BlendFactor::ONE_MINUS_SRC_ALPHA);

        let opaque = color_blend_attachment(false);
        assert_eq!(opaque.blend_enable, vk::FALSE);
        assert_eq!(opaque.color_write_mask, vk::ColorComponentFlags::RGBA);
    }

    #[test]
    fn spirv_must_be_whole_words() {
        let err = decode_spirv(&[0x03, 0x02, 0x23], "vertex").unwrap_err();
        assert!(matches!(err, GpuError::InvalidSpirv(ref msg) if msg.starts_with("vertex")));
    }

    #[test]
    fn spirv_words_are_little_endian() {
        let mut bytes = 0x0723_0203u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&0x0001_0600u32.to_le_bytes());
        let words = decode_spirv(&bytes, "compute").unwrap();
        assert_eq!(words, vec![0x0723_0203, 0x0001_0600]);
    }

    #[test]
    fn config_builders() {
        let code = [0u8; 4];
        let config = ShaderConfig::new(&code, &code, vk::Format::B8G8R8A8_SRGB)
            .with_depth(vk::Format::D32_SFLOAT)
            .with_descriptor_set(vec![DescriptorBinding::new(DescriptorKind::UniformBuffer, 1)])
            .with_push_constants(64)
            .with_color_blend(true);
        assert!(config.enable_depth_buffer);
        assert_eq!(config.descriptor_sets.len(), 1);
        assert_eq!(config.push_constant_size, 64);
        assert_eq!(config.cull_mode, vk::CullModeFlags::BACK);
    }
}
