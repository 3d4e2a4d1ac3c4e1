//! The demo application.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3, Vec4};
use hurdygurdy_app::{AppContext, FrameContext, HgApp};
use hurdygurdy_gpu::{
    load_shader_file, Buffer, BufferUsage, Descriptor, DescriptorBinding, DescriptorKind, GpuContext,
    GpuError, MemoryType, Shader, ShaderConfig, ShaderStage, Texture, TextureConfig, TextureUsage,
    VertexAttribute, VertexBinding, FRAMES_IN_FLIGHT,
};
use tracing::{info, warn};

const SHADER_DIR: &str = "build";
const COLOR_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;
const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;
const CLEAR_COLOR: [f32; 4] = [0.05, 0.05, 0.08, 1.0];
/// Radians per second.
const SPIN_SPEED: f32 = 0.8;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Vertex {
    position: Vec2,
    color: Vec3,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Push {
    angle: f32,
    aspect: f32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Globals {
    tint: Vec4,
}

const TRIANGLE: [Vertex; 3] = [
    Vertex {
        position: Vec2::new(0.0, -0.6),
        color: Vec3::new(1.0, 0.2, 0.2),
    },
    Vertex {
        position: Vec2::new(0.6, 0.5),
        color: Vec3::new(0.2, 1.0, 0.2),
    },
    Vertex {
        position: Vec2::new(-0.6, 0.5),
        color: Vec3::new(0.2, 0.4, 1.0),
    },
];

/// Offscreen color and depth targets, sized to the window.
struct Targets {
    color: Option<Texture>,
    depth: Texture,
}

impl Targets {
    fn new(gpu: &GpuContext, width: u32, height: u32, offscreen: bool) -> hurdygurdy_gpu::Result<Self> {
        let depth = Texture::new(gpu, &TextureConfig::depth_buffer(width, height, DEPTH_FORMAT))?;
        let color = if offscreen {
            let config = TextureConfig::new(
                width,
                height,
                COLOR_FORMAT,
                TextureUsage::RENDER_TARGET | TextureUsage::SAMPLED,
            );
            match Texture::new(gpu, &config) {
                Ok(color) => Some(color),
                Err(e) => {
                    depth.destroy(gpu)?;
                    return Err(e);
                }
            }
        } else {
            None
        };
        Ok(Self { color, depth })
    }

    fn destroy(self, gpu: &GpuContext) -> hurdygurdy_gpu::Result<()> {
        if let Some(color) = self.color {
            color.destroy(gpu)?;
        }
        self.depth.destroy(gpu)
    }
}

/// Triangle pipeline and its buffers.
struct Triangle {
    shader: Shader,
    vertices: Buffer,
    /// One per frame slot, so a frame still in flight keeps its values.
    globals: Vec<Buffer>,
}

impl Triangle {
    /// `Ok(None)` when the compiled shaders are not there.
    fn load(gpu: &GpuContext, color_format: vk::Format) -> anyhow::Result<Option<Self>> {
        let vertex_spirv = match load_shader_file(SHADER_DIR, "triangle", ShaderStage::Vertex) {
            Ok(spirv) => spirv,
            Err(GpuError::ShaderNotFound(path)) => {
                warn!("{} is missing, drawing the clear color only", path.display());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let fragment_spirv = load_shader_file(SHADER_DIR, "triangle", ShaderStage::Fragment)?;

        let config = ShaderConfig::new(&vertex_spirv, &fragment_spirv, color_format)
            .with_depth(DEPTH_FORMAT)
            .with_vertex_binding(VertexBinding::per_vertex(
                std::mem::size_of::<Vertex>() as u32,
                vec![
                    VertexAttribute {
                        format: vk::Format::R32G32_SFLOAT,
                        offset: 0,
                    },
                    VertexAttribute {
                        format: vk::Format::R32G32B32_SFLOAT,
                        offset: std::mem::size_of::<Vec2>() as u32,
                    },
                ],
            ))
            .with_descriptor_set(vec![DescriptorBinding::new(DescriptorKind::UniformBuffer, 1)])
            .with_push_constants(std::mem::size_of::<Push>() as u32)
            .with_cull_mode(vk::CullModeFlags::NONE);
        let shader = Shader::new(gpu, &config)?;

        let vertex_bytes = bytemuck::cast_slice(&TRIANGLE);
        let mut vertices = Buffer::new(
            gpu,
            vertex_bytes.len() as u64,
            BufferUsage::VERTEX,
            MemoryType::DeviceLocal,
        )?;
        vertices.write(gpu, 0, vertex_bytes)?;

        let globals = (0..FRAMES_IN_FLIGHT)
            .map(|_| {
                Buffer::new(
                    gpu,
                    std::mem::size_of::<Globals>() as u64,
                    BufferUsage::UNIFORM,
                    MemoryType::RandomAccess,
                )
            })
            .collect::<hurdygurdy_gpu::Result<Vec<_>>>()?;

        info!("Triangle pipeline ready");
        Ok(Some(Self {
            shader,
            vertices,
            globals,
        }))
    }

    fn destroy(self, gpu: &GpuContext) -> hurdygurdy_gpu::Result<()> {
        self.shader.destroy(gpu);
        self.vertices.destroy(gpu)?;
        for globals in self.globals {
            globals.destroy(gpu)?;
        }
        Ok(())
    }
}

pub struct Demo {
    targets: Option<Targets>,
    triangle: Option<Triangle>,
    angle: f32,
    time: f32,
}

impl HgApp for Demo {
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self> {
        let direct = std::env::args().any(|arg| arg == "--direct");
        let color_format = if direct { ctx.surface_format() } else { COLOR_FORMAT };
        info!(
            "Rendering {} ({color_format:?})",
            if direct { "into the swapchain" } else { "offscreen" }
        );

        let targets = Targets::new(ctx.gpu(), ctx.width(), ctx.height(), !direct)?;
        let triangle = Triangle::load(ctx.gpu(), color_format)?;

        Ok(Self {
            targets: Some(targets),
            triangle,
            angle: 0.0,
            time: 0.0,
        })
    }

    fn update(&mut self, _ctx: &AppContext, dt: f32) {
        self.time += dt;
        self.angle = (self.angle + dt * SPIN_SPEED) % std::f32::consts::TAU;
    }

    fn render(&mut self, ctx: &mut AppContext, _frame: &FrameContext) -> anyhow::Result<()> {
        let aspect = ctx.aspect_ratio();
        let Some(targets) = &self.targets else {
            return Ok(());
        };

        let slot = ctx.render.frame_slot().unwrap_or(0);
        if let Some(triangle) = &mut self.triangle {
            let pulse = 0.75 + 0.25 * (self.time * 2.0).sin();
            let globals = Globals {
                tint: Vec4::new(pulse, pulse, pulse, 1.0),
            };
            triangle.globals[slot].write(ctx.gpu(), 0, bytemuck::bytes_of(&globals))?;
        }

        let (render, image) = ctx.frame_parts();
        match (&targets.color, image) {
            (Some(color), _) => {
                render.renderpass_begin(color, Some(&targets.depth), Some(CLEAR_COLOR), Some(1.0))?;
            }
            (None, Some(image)) => {
                render.renderpass_begin(image, Some(&targets.depth), Some(CLEAR_COLOR), Some(1.0))?;
            }
            (None, None) => return Ok(()),
        }

        if let Some(triangle) = &self.triangle {
            render.shader_bind(&triangle.shader)?;
            render.bind_descriptor_set(0, &[Descriptor::UniformBuffer(&[&triangle.globals[slot]])])?;
            render.bind_push_constant(&Push {
                angle: self.angle,
                aspect,
            })?;
            render.draw(Some(&triangle.vertices), None, TRIANGLE.len() as u32)?;
            render.shader_unbind();
        }

        render.renderpass_end()?;
        Ok(())
    }

    fn framebuffer(&self) -> Option<&Texture> {
        self.targets.as_ref().and_then(|targets| targets.color.as_ref())
    }

    fn on_resize(&mut self, ctx: &mut AppContext, _width: u32, _height: u32) -> anyhow::Result<()> {
        // The swapchain extent can differ from the requested window size
        if let Some(targets) = self.targets.take() {
            let offscreen = targets.color.is_some();
            targets.destroy(ctx.gpu())?;
            self.targets = Some(Targets::new(ctx.gpu(), ctx.width(), ctx.height(), offscreen)?);
        }
        Ok(())
    }

    fn cleanup(&mut self, ctx: &mut AppContext) {
        let gpu = ctx.gpu();
        if let Some(targets) = self.targets.take() {
            if let Err(e) = targets.destroy(gpu) {
                warn!("Failed to destroy render targets: {e}");
            }
        }
        if let Some(triangle) = self.triangle.take() {
            if let Err(e) = triangle.destroy(gpu) {
                warn!("Failed to destroy triangle resources: {e}");
            }
        }
    }
}
