//! The frame driver.
//!
//! [`RenderContext`] owns the device context and all per-frame state that is
//! not tied to a swapchain: the descriptor pools, the render pass tracker and
//! the command buffer being recorded. A frame runs
//!
//! ```text
//! frame_begin -> (renderpass_begin .. draw/dispatch .. renderpass_end)* -> frame_end
//! ```
//!
//! `frame_begin` and `frame_end` report an out-of-date swapchain as
//! [`FrameStatus::WindowInvalid`]; every other failure is a [`GpuError`].

use crate::buffer::Buffer;
use crate::command::{begin_command_buffer, end_command_buffer};
use crate::context::GpuContext;
use crate::descriptors::{write_descriptor_set, Descriptor, DescriptorPool};
use crate::error::{GpuError, Result};
use crate::layout::cmd_image_barriers;
use crate::render_pass::{plan_present, Attachment, RenderTargetTracker};
use crate::shader::Shader;
use crate::swapchain::{Acquired, SwapchainCommands};
use crate::texture::Texture;
use crate::FRAMES_IN_FLIGHT;
use ash::vk;

/// Outcome of `frame_begin` / `frame_end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum FrameStatus {
    Ok,
    /// The swapchain no longer matches the window. Recreate it and retry.
    WindowInvalid,
}

/// What draws and binds need from the bound shader.
struct BoundShader {
    layout: vk::PipelineLayout,
    bind_point: vk::PipelineBindPoint,
    set_layouts: Vec<vk::DescriptorSetLayout>,
    stages: vk::ShaderStageFlags,
    push_constant_size: u32,
}

/// The frame currently being recorded.
struct Recording {
    cmd: vk::CommandBuffer,
    slot: usize,
    shader: Option<BoundShader>,
}

/// Single-threaded owner of the device and the frame being recorded.
pub struct RenderContext {
    gpu: GpuContext,
    descriptor_pools: Vec<DescriptorPool>,
    tracker: RenderTargetTracker,
    recording: Option<Recording>,
}

impl RenderContext {
    /// Take ownership of `gpu` and create the per-frame descriptor pools.
    pub fn new(gpu: GpuContext) -> Result<Self> {
        let mut descriptor_pools = Vec::with_capacity(FRAMES_IN_FLIGHT);
        for _ in 0..FRAMES_IN_FLIGHT {
            match unsafe { DescriptorPool::new(gpu.device()) } {
                Ok(pool) => descriptor_pools.push(pool),
                Err(e) => {
                    for pool in &descriptor_pools {
                        unsafe { pool.destroy(gpu.device()) };
                    }
                    return Err(e);
                }
            }
        }

        Ok(Self {
            gpu,
            descriptor_pools,
            tracker: RenderTargetTracker::new(),
            recording: None,
        })
    }

    pub fn gpu(&self) -> &GpuContext {
        &self.gpu
    }

    /// Whether a frame is being recorded.
    pub fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    /// Frame slot being recorded, `0..FRAMES_IN_FLIGHT`.
    ///
    /// Per-frame host-written resources indexed by this slot are no longer in
    /// use by the GPU once `frame_begin` returned.
    pub fn frame_slot(&self) -> Option<usize> {
        self.recording.as_ref().map(|recording| recording.slot)
    }

    fn recording(&self) -> Result<&Recording> {
        self.recording
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("No frame is being recorded".to_string()))
    }

    fn bound_shader(&self) -> Result<(&Recording, &BoundShader)> {
        let recording = self.recording()?;
        let shader = recording
            .shader
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("No shader is bound".to_string()))?;
        Ok((recording, shader))
    }

    /// Start a frame: wait for the slot's previous submission, acquire an
    /// image, reset the slot's descriptor pool and begin recording.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn frame_begin(&mut self, swapchain: &mut SwapchainCommands) -> Result<FrameStatus> {
        hg_assert!(self.recording.is_none(), "frame_begin called while a frame is recording");

        let device = self.gpu.device();
        let (cmd, slot) = match swapchain.acquire(device)? {
            Acquired::Ready { cmd, slot } => (cmd, slot),
            Acquired::WindowInvalid => return Ok(FrameStatus::WindowInvalid),
        };

        unsafe {
            self.descriptor_pools[slot].reset(device)?;
            begin_command_buffer(device, cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        }

        self.recording = Some(Recording {
            cmd,
            slot,
            shader: None,
        });
        Ok(FrameStatus::Ok)
    }

    /// Finish the frame and present it.
    ///
    /// With `framebuffer`, that texture is blitted onto the swapchain image,
    /// scaled to the swapchain's extent. Without it, the swapchain image is
    /// presented as rendered.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn frame_end(
        &mut self,
        swapchain: &mut SwapchainCommands,
        framebuffer: Option<&Texture>,
    ) -> Result<FrameStatus> {
        let recording = self
            .recording
            .take()
            .ok_or_else(|| GpuError::InvalidState("frame_end without frame_begin".to_string()))?;
        let device = self.gpu.device();
        let cmd = recording.cmd;

        unsafe {
            if self.tracker.close() {
                device.cmd_end_rendering(cmd);
            }

            let image = swapchain.current_image().ok_or_else(|| {
                GpuError::InvalidState("frame_end without an acquired image".to_string())
            })?;

            let plan = plan_present(
                image.track(),
                framebuffer.map(|framebuffer| &**framebuffer.track()),
            );

            if let Some(framebuffer) = framebuffer {
                cmd_image_barriers(device, cmd, &plan.before_blit);

                let src = framebuffer.extent();
                let dst = image.extent();
                let layers = vk::ImageSubresourceLayers::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .mip_level(0)
                    .base_array_layer(0)
                    .layer_count(1);
                let blit = vk::ImageBlit2::default()
                    .src_subresource(layers)
                    .src_offsets([vk::Offset3D::default(), corner(src)])
                    .dst_subresource(layers)
                    .dst_offsets([vk::Offset3D::default(), corner(dst)]);
                let info = vk::BlitImageInfo2::default()
                    .src_image(framebuffer.image())
                    .src_image_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                    .dst_image(image.image())
                    .dst_image_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                    .regions(std::slice::from_ref(&blit))
                    .filter(vk::Filter::NEAREST);
                device.cmd_blit_image2(cmd, &info);
            }

            cmd_image_barriers(device, cmd, plan.present.as_slice());

            end_command_buffer(device, cmd)?;
        }

        let status = swapchain.submit_and_present(device, self.gpu.queue())?;
        if status == FrameStatus::WindowInvalid {
            tracing::debug!("Window invalid after present");
        }
        Ok(status)
    }

    /// Begin a rendering pass into `target` and optionally `depth`.
    ///
    /// An open pass is ended first. `None` clears load the previous contents.
    /// Viewport and scissor cover the whole target.
    pub fn renderpass_begin(
        &mut self,
        target: &dyn Attachment,
        depth: Option<&dyn Attachment>,
        clear_color: Option<[f32; 4]>,
        clear_depth: Option<f32>,
    ) -> Result<()> {
        let cmd = self.recording()?.cmd;
        let plan = self
            .tracker
            .begin(target.track(), depth.map(|depth| depth.track()));
        let device = self.gpu.device();
        let extent = target.extent();

        let color_attachment = vk::RenderingAttachmentInfo::default()
            .image_view(target.view())
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(load_op(clear_color.is_some()))
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: clear_color.unwrap_or_default(),
                },
            });
        let depth_attachment = depth.map(|depth| {
            vk::RenderingAttachmentInfo::default()
                .image_view(depth.view())
                .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
                .load_op(load_op(clear_depth.is_some()))
                .store_op(vk::AttachmentStoreOp::STORE)
                .clear_value(vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: clear_depth.unwrap_or(1.0),
                        stencil: 0,
                    },
                })
        });

        let mut rendering_info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent,
            })
            .layer_count(1)
            .color_attachments(std::slice::from_ref(&color_attachment));
        if let Some(depth_attachment) = depth_attachment.as_ref() {
            rendering_info = rendering_info.depth_attachment(depth_attachment);
        }

        unsafe {
            if plan.close_open_pass {
                device.cmd_end_rendering(cmd);
            }
            cmd_image_barriers(device, cmd, &plan.barriers);
            device.cmd_begin_rendering(cmd, &rendering_info);

            let viewport = vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: extent.width as f32,
                height: extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            };
            device.cmd_set_viewport(cmd, 0, &[viewport]);
            device.cmd_set_scissor(
                cmd,
                0,
                &[vk::Rect2D {
                    offset: vk::Offset2D::default(),
                    extent,
                }],
            );
        }
        Ok(())
    }

    /// End the open rendering pass.
    pub fn renderpass_end(&mut self) -> Result<()> {
        let cmd = self.recording()?.cmd;
        let open = self.tracker.is_open();
        self.tracker.end();
        if open {
            unsafe { self.gpu.device().cmd_end_rendering(cmd) };
        }
        Ok(())
    }

    /// Bind `shader` for the following draws or dispatches.
    pub fn shader_bind(&mut self, shader: &Shader) -> Result<()> {
        let recording = self
            .recording
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("No frame is being recorded".to_string()))?;
        unsafe {
            self.gpu
                .device()
                .cmd_bind_pipeline(recording.cmd, shader.bind_point(), shader.pipeline());
        }
        recording.shader = Some(BoundShader {
            layout: shader.layout(),
            bind_point: shader.bind_point(),
            set_layouts: shader.set_layouts().to_vec(),
            stages: shader.stages(),
            push_constant_size: shader.push_constant_size(),
        });
        Ok(())
    }

    /// Forget the bound shader.
    pub fn shader_unbind(&mut self) {
        if let Some(recording) = self.recording.as_mut() {
            recording.shader = None;
        }
    }

    /// Allocate a set for `set_index` of the bound shader, write
    /// `descriptors` into it (binding `i` gets `descriptors[i]`) and bind it.
    pub fn bind_descriptor_set(&mut self, set_index: u32, descriptors: &[Descriptor]) -> Result<()> {
        let (recording, shader) = self.bound_shader()?;
        hg_assert!(
            (set_index as usize) < shader.set_layouts.len(),
            "descriptor set {set_index} out of range ({} sets)",
            shader.set_layouts.len()
        );
        let layout = *shader
            .set_layouts
            .get(set_index as usize)
            .ok_or_else(|| GpuError::InvalidState(format!("No descriptor set {set_index}")))?;

        let device = self.gpu.device();
        unsafe {
            let set = self.descriptor_pools[recording.slot].allocate(device, layout)?;
            write_descriptor_set(device, set, descriptors);
            device.cmd_bind_descriptor_sets(
                recording.cmd,
                shader.bind_point,
                shader.layout,
                set_index,
                &[set],
                &[],
            );
        }
        Ok(())
    }

    /// Push `data` as the bound shader's push constants.
    pub fn bind_push_constant<T: bytemuck::Pod>(&mut self, data: &T) -> Result<()> {
        let (recording, shader) = self.bound_shader()?;
        let bytes = bytemuck::bytes_of(data);
        hg_assert!(
            !bytes.is_empty() && bytes.len() as u32 <= shader.push_constant_size,
            "push constant of {} bytes does not fit the shader's {} bytes",
            bytes.len(),
            shader.push_constant_size
        );
        unsafe {
            self.gpu.device().cmd_push_constants(
                recording.cmd,
                shader.layout,
                shader.stages,
                0,
                bytes,
            );
        }
        Ok(())
    }

    /// Draw `vertex_count` vertices, or the whole index buffer when one is
    /// given (32-bit indices).
    pub fn draw(
        &mut self,
        vertex_buffer: Option<&Buffer>,
        index_buffer: Option<&Buffer>,
        vertex_count: u32,
    ) -> Result<()> {
        let (recording, shader) = self.bound_shader()?;
        hg_assert!(
            shader.bind_point == vk::PipelineBindPoint::GRAPHICS,
            "draw with a compute shader bound"
        );
        hg_assert!(self.tracker.is_open(), "draw outside a render pass");

        let device = self.gpu.device();
        let cmd = recording.cmd;
        unsafe {
            if let Some(vertex_buffer) = vertex_buffer {
                device.cmd_bind_vertex_buffers(cmd, 0, &[vertex_buffer.handle()], &[0]);
            }
            match index_buffer {
                Some(index_buffer) => {
                    device.cmd_bind_index_buffer(cmd, index_buffer.handle(), 0, vk::IndexType::UINT32);
                    device.cmd_draw_indexed(cmd, index_count(index_buffer.size()), 1, 0, 0, 0);
                }
                None => device.cmd_draw(cmd, vertex_count, 1, 0, 0),
            }
        }
        Ok(())
    }

    /// Dispatch the bound compute shader.
    pub fn compute_dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<()> {
        let (recording, shader) = self.bound_shader()?;
        hg_assert!(
            shader.bind_point == vk::PipelineBindPoint::COMPUTE,
            "compute_dispatch with a graphics shader bound"
        );
        unsafe { self.gpu.device().cmd_dispatch(recording.cmd, x, y, z) };
        Ok(())
    }
}

impl Drop for RenderContext {
    fn drop(&mut self) {
        if let Err(e) = self.gpu.wait_idle() {
            tracing::error!("Failed to wait for device idle on shutdown: {e}");
        }
        for pool in &self.descriptor_pools {
            unsafe { pool.destroy(self.gpu.device()) };
        }
    }
}

fn load_op(clear: bool) -> vk::AttachmentLoadOp {
    if clear {
        vk::AttachmentLoadOp::CLEAR
    } else {
        vk::AttachmentLoadOp::LOAD
    }
}

/// Number of 32-bit indices in a buffer of `size` bytes.
fn index_count(size: u64) -> u32 {
    (size / std::mem::size_of::<u32>() as u64) as u32
}

fn corner(extent: vk::Extent2D) -> vk::Offset3D {
    vk::Offset3D {
        x: extent.width as i32,
        y: extent.height as i32,
        z: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clears_only_when_asked() {
        assert_eq!(load_op(true), vk::AttachmentLoadOp::CLEAR);
        assert_eq!(load_op(false), vk::AttachmentLoadOp::LOAD);
    }

    #[test]
    fn index_count_uses_whole_buffer() {
        assert_eq!(index_count(12), 3);
        assert_eq!(index_count(4 * 6), 6);
        assert_eq!(index_count(2), 0);
    }

    #[test]
    fn blit_corner_covers_full_extent() {
        let corner = corner(vk::Extent2D {
            width: 1280,
            height: 720,
        });
        assert_eq!(corner, vk::Offset3D { x: 1280, y: 720, z: 1 });
    }
}
