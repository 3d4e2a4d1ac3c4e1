//! Swapchain and the per-frame command and synchronization objects that
//! drive it.
//!
//! [`SwapchainCommands`] owns everything that depends on the swapchain: the
//! images, one command buffer, fence and image-available semaphore per frame
//! in flight, and one ready-to-present semaphore per swapchain image. On
//! resize the whole object is rebuilt, so no semaphore or fence state leaks
//! from one swapchain into the next.
//!
//! Once it has reported [`FrameStatus::WindowInvalid`] the object is retired:
//! it acquires nothing more and only a rebuild gets frames going again.

use crate::command::{submit, CommandPool, Submission};
use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::frame::FrameStatus;
use crate::layout::{full_range, ImageState, ImageTrack};
use crate::render_pass::Attachment;
use crate::surface::SurfaceContext;
use crate::sync::{reset_fence, wait_for_fence, FrameSlots, FrameSync};
use crate::FRAMES_IN_FLIGHT;
use ash::vk;
use std::rc::Rc;

/// Stage the image-available semaphore is waited at. Barriers on freshly
/// acquired images start here.
const ACQUIRE_WAIT_STAGE: vk::PipelineStageFlags2 = vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT;

/// One presentable image.
pub struct SwapchainImage {
    view: vk::ImageView,
    track: Rc<ImageTrack>,
    extent: vk::Extent2D,
}

impl SwapchainImage {
    pub fn image(&self) -> vk::Image {
        self.track.image()
    }

    pub fn state(&self) -> ImageState {
        self.track.state()
    }
}

impl Attachment for SwapchainImage {
    fn track(&self) -> &Rc<ImageTrack> {
        &self.track
    }

    fn view(&self) -> vk::ImageView {
        self.view
    }

    fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

/// Swapchain wrapper.
pub struct Swapchain {
    swapchain: vk::SwapchainKHR,
    images: Vec<SwapchainImage>,
    format: vk::Format,
    extent: vk::Extent2D,
}

impl Swapchain {
    /// Create a swapchain on `surface`.
    ///
    /// # Safety
    /// `old_swapchain`, if not null, must belong to the same surface and must
    /// not be used for acquiring afterwards.
    pub unsafe fn new(
        gpu: &GpuContext,
        surface: &SurfaceContext,
        width: u32,
        height: u32,
        vsync: bool,
        old_swapchain: vk::SwapchainKHR,
    ) -> Result<Self> {
        let support = surface.support(gpu)?;
        let surface_format = support.recommended_format().ok_or_else(|| {
            GpuError::SwapchainCreation("Surface reports no formats".to_string())
        })?;
        let present_mode = support.recommended_present_mode(vsync);
        let extent = calculate_extent(&support.limits, width, height);
        let image_count = select_image_count(&support.limits);

        let queue_families = [gpu.queue_family()];
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.handle())
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .queue_family_indices(&queue_families)
            .pre_transform(support.limits.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let loader = surface.swapchain_loader();
        let swapchain = loader
            .create_swapchain(&create_info, None)
            .map_err(|e| GpuError::SwapchainCreation(e.to_string()))?;

        let mut this = Self {
            swapchain,
            images: Vec::new(),
            format: surface_format.format,
            extent,
        };
        if let Err(e) = this.create_images(gpu.device(), loader) {
            this.destroy(gpu.device(), loader);
            return Err(e);
        }

        tracing::info!(
            "Created swapchain {}x{}, {} images, {:?}, {:?}",
            extent.width,
            extent.height,
            this.images.len(),
            surface_format.format,
            present_mode
        );

        Ok(this)
    }

    unsafe fn create_images(
        &mut self,
        device: &ash::Device,
        loader: &ash::khr::swapchain::Device,
    ) -> Result<()> {
        let range = full_range(vk::ImageAspectFlags::COLOR, 1, 1);
        for image in loader.get_swapchain_images(self.swapchain)? {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(self.format)
                .components(vk::ComponentMapping::default())
                .subresource_range(range);
            let view = device.create_image_view(&view_info, None)?;

            self.images.push(SwapchainImage {
                view,
                track: Rc::new(ImageTrack::presentable(image, range, ACQUIRE_WAIT_STAGE)),
                extent: self.extent,
            });
        }
        Ok(())
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    pub fn images(&self) -> &[SwapchainImage] {
        &self.images
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Destroy the swapchain.
    ///
    /// # Safety
    /// The swapchain must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device, loader: &ash::khr::swapchain::Device) {
        for image in &self.images {
            device.destroy_image_view(image.view, None);
        }
        loader.destroy_swapchain(self.swapchain, None);
    }
}

/// Result of the acquire step of a frame.
pub(crate) enum Acquired {
    /// An image was acquired; `cmd` is reset and belongs to frame `slot`.
    Ready { cmd: vk::CommandBuffer, slot: usize },
    /// The swapchain no longer matches the window.
    WindowInvalid,
}

/// Swapchain plus frames-in-flight command buffers and synchronization.
pub struct SwapchainCommands {
    loader: ash::khr::swapchain::Device,
    swapchain: Swapchain,
    pool: CommandPool,
    /// Per frame slot.
    command_buffers: Vec<vk::CommandBuffer>,
    sync: FrameSync,
    retired: bool,
    vsync: bool,
}

impl SwapchainCommands {
    /// Create a swapchain of roughly `width` x `height` and its frame objects.
    pub fn new(
        gpu: &GpuContext,
        surface: &SurfaceContext,
        width: u32,
        height: u32,
        vsync: bool,
    ) -> Result<Self> {
        Self::create(gpu, surface, width, height, vsync, vk::SwapchainKHR::null())
    }

    fn create(
        gpu: &GpuContext,
        surface: &SurfaceContext,
        width: u32,
        height: u32,
        vsync: bool,
        old_swapchain: vk::SwapchainKHR,
    ) -> Result<Self> {
        let device = gpu.device();
        let loader = surface.swapchain_loader().clone();
        unsafe {
            let swapchain = Swapchain::new(gpu, surface, width, height, vsync, old_swapchain)?;
            let sync = match FrameSync::new(device, FRAMES_IN_FLIGHT, swapchain.images().len()) {
                Ok(sync) => sync,
                Err(e) => {
                    swapchain.destroy(device, &loader);
                    return Err(e);
                }
            };
            let pool = match CommandPool::new(
                device,
                gpu.queue_family(),
                vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            ) {
                Ok(pool) => pool,
                Err(e) => {
                    sync.destroy(device);
                    swapchain.destroy(device, &loader);
                    return Err(e);
                }
            };

            let mut this = Self {
                loader,
                swapchain,
                pool,
                command_buffers: Vec::new(),
                sync,
                retired: false,
                vsync,
            };
            match this.pool.allocate(device, FRAMES_IN_FLIGHT as u32) {
                Ok(command_buffers) => this.command_buffers = command_buffers,
                Err(e) => {
                    this.destroy(gpu);
                    return Err(e);
                }
            }
            Ok(this)
        }
    }

    /// Rebuild everything at a new size, reusing the old swapchain for a
    /// smoother handover. Waits for the device to go idle first.
    pub fn recreate(
        self,
        gpu: &GpuContext,
        surface: &SurfaceContext,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        gpu.wait_idle()?;
        let result = Self::create(gpu, surface, width, height, self.vsync, self.swapchain.handle());
        self.destroy(gpu);
        result
    }

    /// Destroy the swapchain and every frame object.
    ///
    /// The caller must make sure no frame is still executing.
    pub fn destroy(self, gpu: &GpuContext) {
        let device = gpu.device();
        unsafe {
            self.sync.destroy(device);
            self.pool.destroy(device);
            self.swapchain.destroy(device, &self.loader);
        }
    }

    pub fn swapchain(&self) -> &Swapchain {
        &self.swapchain
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent()
    }

    pub fn format(&self) -> vk::Format {
        self.swapchain.format()
    }

    pub fn vsync(&self) -> bool {
        self.vsync
    }

    pub fn slots(&self) -> &FrameSlots {
        &self.sync.slots
    }

    /// Whether `WindowInvalid` was reported and the object awaits a rebuild.
    pub fn is_retired(&self) -> bool {
        self.retired
    }

    /// Image acquired for the frame being recorded, usable as a render target.
    pub fn current_image(&self) -> Option<&SwapchainImage> {
        self.sync.slots.image().map(|index| &self.swapchain.images()[index])
    }

    /// Advance to the next frame slot, wait for its previous submission and
    /// acquire an image.
    ///
    /// The slot's fence is only reset once an image was acquired, so a frame
    /// abandoned here leaves the fence signaled for the next attempt.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub(crate) fn acquire(&mut self, device: &ash::Device) -> Result<Acquired> {
        if self.retired {
            return Ok(Acquired::WindowInvalid);
        }
        let slot = self.sync.slots.advance();
        unsafe {
            wait_for_fence(device, self.sync.in_flight[slot], u64::MAX)?;

            let acquired = self.loader.acquire_next_image(
                self.swapchain.handle(),
                u64::MAX,
                self.sync.image_available[self.sync.slots.image_available_slot()],
                vk::Fence::null(),
            );
            // A suboptimal acquire has signaled the semaphore; retiring keeps
            // it from being handed to another acquire
            let Some(image_index) = acquired_index(acquired)? else {
                tracing::debug!("Swapchain out of date at acquire");
                self.retired = true;
                return Ok(Acquired::WindowInvalid);
            };

            reset_fence(device, self.sync.in_flight[self.sync.slots.fence_slot()])?;
            self.sync.slots.set_image(image_index);
            self.swapchain.images()[image_index as usize]
                .track
                .reset_state(ImageState::Undefined);

            let cmd = self.command_buffers[slot];
            device.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
            Ok(Acquired::Ready { cmd, slot })
        }
    }

    /// Submit the current slot's recorded commands and present its image.
    ///
    /// The command buffer must already be ended and the image in
    /// [`ImageState::Present`].
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub(crate) fn submit_and_present(
        &mut self,
        device: &ash::Device,
        queue: vk::Queue,
    ) -> Result<FrameStatus> {
        let Some(image) = self.sync.slots.ready_to_present_slot() else {
            return Err(GpuError::InvalidState(
                "frame_end without an acquired image".to_string(),
            ));
        };
        hg_assert!(
            self.swapchain.images()[image].state() == ImageState::Present,
            "swapchain image not ready for present"
        );

        let sync = &self.sync;
        let slot = sync.slots.frame();
        let wait = [(
            sync.image_available[sync.slots.image_available_slot()],
            ACQUIRE_WAIT_STAGE,
        )];
        let signal = [sync.ready_to_present[image]];
        unsafe {
            submit(
                device,
                queue,
                &Submission {
                    command_buffers: &[self.command_buffers[slot]],
                    wait: &wait,
                    signal: &signal,
                    fence: sync.in_flight[sync.slots.fence_slot()],
                },
            )?;

            let swapchains = [self.swapchain.handle()];
            let image_indices = [image as u32];
            let present_info = vk::PresentInfoKHR::default()
                .wait_semaphores(&signal)
                .swapchains(&swapchains)
                .image_indices(&image_indices);

            match self.loader.queue_present(queue, &present_info) {
                Ok(false) => Ok(FrameStatus::Ok),
                Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                    tracing::debug!("Swapchain out of date at present");
                    self.retired = true;
                    Ok(FrameStatus::WindowInvalid)
                }
                Err(e) => Err(e.into()),
            }
        }
    }
}

/// Index of the acquired image, `None` when the swapchain has to be rebuilt.
fn acquired_index(result: ash::prelude::VkResult<(u32, bool)>) -> Result<Option<u32>> {
    match result {
        Ok((index, false)) => Ok(Some(index)),
        Ok((_, true)) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Prefer sRGB BGRA, else whatever comes first.
pub fn select_surface_format(available: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    available
        .iter()
        .find(|format| {
            format.format == vk::Format::B8G8R8A8_SRGB
                && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| available.first())
        .copied()
}

/// FIFO with vsync; otherwise mailbox, then immediate, then FIFO.
pub fn select_present_mode(available: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }
    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
        .into_iter()
        .find(|mode| available.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// Swapchain extent: the surface's current extent when it dictates one,
/// otherwise the requested size clamped to the supported range.
pub fn calculate_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired_width: u32,
    desired_height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: desired_width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: desired_height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

/// One more than the minimum, capped by the maximum when there is one.
pub fn select_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let wanted = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        wanted.min(capabilities.max_image_count)
    } else {
        wanted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space,
        }
    }

    #[test]
    fn suboptimal_or_out_of_date_acquire_needs_rebuild() {
        assert_eq!(acquired_index(Ok((2, false))).unwrap(), Some(2));
        assert_eq!(acquired_index(Ok((2, true))).unwrap(), None);
        assert_eq!(
            acquired_index(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)).unwrap(),
            None
        );
        assert!(matches!(
            acquired_index(Err(vk::Result::ERROR_DEVICE_LOST)),
            Err(GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST))
        ));
    }

    #[test]
    fn prefers_srgb_bgra() {
        let available = [
            format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        assert_eq!(
            select_surface_format(&available).map(|f| f.format),
            Some(vk::Format::B8G8R8A8_SRGB)
        );
    }

    #[test]
    fn falls_back_to_first_format() {
        let available = [format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR)];
        assert_eq!(
            select_surface_format(&available).map(|f| f.format),
            Some(vk::Format::R8G8B8A8_UNORM)
        );
        assert!(select_surface_format(&[]).is_none());
    }

    #[test]
    fn present_mode_selection() {
        let all = [
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::MAILBOX,
        ];
        assert_eq!(select_present_mode(&all, true), vk::PresentModeKHR::FIFO);
        assert_eq!(select_present_mode(&all, false), vk::PresentModeKHR::MAILBOX);
        assert_eq!(
            select_present_mode(&all[..2], false),
            vk::PresentModeKHR::IMMEDIATE
        );
        assert_eq!(
            select_present_mode(&[vk::PresentModeKHR::FIFO], false),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn extent_follows_surface_when_fixed() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            ..Default::default()
        };
        assert_eq!(calculate_extent(&caps, 1920, 1080), caps.current_extent);
    }

    #[test]
    fn extent_is_clamped_when_free() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 16,
                height: 16,
            },
            max_image_extent: vk::Extent2D {
                width: 1024,
                height: 1024,
            },
            ..Default::default()
        };
        assert_eq!(
            calculate_extent(&caps, 4096, 8),
            vk::Extent2D {
                width: 1024,
                height: 16
            }
        );
    }

    #[test]
    fn image_count_respects_maximum() {
        let unbounded = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(select_image_count(&unbounded), 3);

        let bounded = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 2,
            ..Default::default()
        };
        assert_eq!(select_image_count(&bounded), 2);
    }
}
