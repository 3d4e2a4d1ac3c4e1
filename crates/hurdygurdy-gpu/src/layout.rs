//! Image layout state machine.
//!
//! Every image the core touches is in exactly one [`ImageState`]. Moving it to
//! another state goes through [`required_barrier`], which is the single place
//! deciding whether a barrier is needed and which stages and accesses it
//! synchronizes. [`ImageTrack`] holds the last-known state of one image and
//! updates it in the same call that plans the barrier, so the tracked state
//! always matches what the recorded command stream leaves the image in.

use ash::vk;
use std::cell::Cell;

/// Last-known layout of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageState {
    /// Contents are undefined (fresh image, or freshly acquired swapchain image).
    Undefined,
    /// Storage image access from shaders.
    General,
    /// Color attachment of a rendering pass.
    ColorAttachment,
    /// Depth attachment of a rendering pass.
    DepthAttachment,
    /// Sampled from shaders.
    ShaderReadOnly,
    /// Source of a copy or blit.
    TransferSrc,
    /// Destination of a copy or blit.
    TransferDst,
    /// Handed to the presentation engine.
    Present,
}

/// Pipeline stage and accesses associated with an [`ImageState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StateUsage {
    stage: vk::PipelineStageFlags2,
    writes: vk::AccessFlags2,
    reads: vk::AccessFlags2,
}

impl ImageState {
    /// The Vulkan layout of this state.
    pub fn layout(self) -> vk::ImageLayout {
        match self {
            Self::Undefined => vk::ImageLayout::UNDEFINED,
            Self::General => vk::ImageLayout::GENERAL,
            Self::ColorAttachment => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            Self::DepthAttachment => vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
            Self::ShaderReadOnly => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            Self::TransferSrc => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            Self::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            Self::Present => vk::ImageLayout::PRESENT_SRC_KHR,
        }
    }

    fn usage(self) -> StateUsage {
        use vk::{AccessFlags2 as A, PipelineStageFlags2 as S};
        match self {
            Self::Undefined | Self::Present => StateUsage {
                stage: S::NONE,
                writes: A::NONE,
                reads: A::NONE,
            },
            Self::General => StateUsage {
                stage: S::ALL_COMMANDS,
                writes: A::MEMORY_WRITE,
                reads: A::MEMORY_READ,
            },
            Self::ColorAttachment => StateUsage {
                stage: S::COLOR_ATTACHMENT_OUTPUT,
                writes: A::COLOR_ATTACHMENT_WRITE,
                reads: A::COLOR_ATTACHMENT_READ,
            },
            Self::DepthAttachment => StateUsage {
                stage: S::EARLY_FRAGMENT_TESTS | S::LATE_FRAGMENT_TESTS,
                writes: A::DEPTH_STENCIL_ATTACHMENT_WRITE,
                reads: A::DEPTH_STENCIL_ATTACHMENT_READ,
            },
            Self::ShaderReadOnly => StateUsage {
                stage: S::VERTEX_SHADER | S::FRAGMENT_SHADER | S::COMPUTE_SHADER,
                writes: A::NONE,
                reads: A::SHADER_SAMPLED_READ,
            },
            Self::TransferSrc => StateUsage {
                stage: S::TRANSFER,
                writes: A::NONE,
                reads: A::TRANSFER_READ,
            },
            Self::TransferDst => StateUsage {
                stage: S::TRANSFER,
                writes: A::TRANSFER_WRITE,
                reads: A::NONE,
            },
        }
    }
}

/// Synchronization for one layout transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierSpec {
    pub from: ImageState,
    pub to: ImageState,
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
}

impl BarrierSpec {
    /// Replace the source stage.
    ///
    /// Used for freshly acquired swapchain images, whose barrier has to chain
    /// with the stage the acquire semaphore is waited at.
    pub fn after_stage(mut self, stage: vk::PipelineStageFlags2) -> Self {
        self.src_stage = stage;
        self
    }

    pub fn old_layout(&self) -> vk::ImageLayout {
        self.from.layout()
    }

    pub fn new_layout(&self) -> vk::ImageLayout {
        self.to.layout()
    }
}

/// Decide the barrier taking an image from `current` to `desired`.
///
/// Returns `None` when the image is already in the desired state. The source
/// side synchronizes with whatever work produced `current`, the destination
/// side with the work that will use `desired`.
pub fn required_barrier(current: ImageState, desired: ImageState) -> Option<BarrierSpec> {
    if current == desired {
        return None;
    }
    let src = current.usage();
    let dst = desired.usage();
    Some(BarrierSpec {
        from: current,
        to: desired,
        src_stage: src.stage,
        src_access: src.writes,
        dst_stage: dst.stage,
        dst_access: dst.reads | dst.writes,
    })
}

/// A planned barrier on a concrete image subresource range.
#[derive(Debug, Clone, Copy)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub range: vk::ImageSubresourceRange,
    pub access: BarrierSpec,
}

impl ImageBarrier {
    /// Barrier over an explicit range, for subresources moved individually
    /// outside any [`ImageTrack`] (single mip levels, for instance).
    pub fn for_range(
        image: vk::Image,
        range: vk::ImageSubresourceRange,
        from: ImageState,
        to: ImageState,
    ) -> Option<Self> {
        required_barrier(from, to).map(|access| Self { image, range, access })
    }

    pub fn to_vk(&self) -> vk::ImageMemoryBarrier2<'static> {
        vk::ImageMemoryBarrier2::default()
            .src_stage_mask(self.access.src_stage)
            .src_access_mask(self.access.src_access)
            .dst_stage_mask(self.access.dst_stage)
            .dst_access_mask(self.access.dst_access)
            .old_layout(self.access.old_layout())
            .new_layout(self.access.new_layout())
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.image)
            .subresource_range(self.range)
    }
}

/// Record planned barriers as one `vkCmdPipelineBarrier2` call.
///
/// # Safety
/// The device and command buffer must be valid and the command buffer must be
/// recording.
pub unsafe fn cmd_image_barriers(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    barriers: &[ImageBarrier],
) {
    if barriers.is_empty() {
        return;
    }
    let barriers: Vec<vk::ImageMemoryBarrier2> = barriers.iter().map(ImageBarrier::to_vk).collect();
    let dependency = vk::DependencyInfo::default().image_memory_barriers(&barriers);
    device.cmd_pipeline_barrier2(cmd, &dependency);
}

/// Tracked layout of one image.
///
/// Owned by a [`Texture`](crate::Texture) or swapchain image through an `Rc`;
/// the render pass tracker keeps `Weak` references to it. The `Cell` and the
/// `Rc` make the tracking state `!Send`, confining it to the recording thread.
#[derive(Debug)]
pub struct ImageTrack {
    image: vk::Image,
    range: vk::ImageSubresourceRange,
    sampled: bool,
    acquire_stage: Option<vk::PipelineStageFlags2>,
    state: Cell<ImageState>,
}

impl ImageTrack {
    /// Track `image` over `range`, currently in `initial`.
    ///
    /// `sampled` marks images that may be demoted to shader-read-only after
    /// being rendered to.
    pub fn new(
        image: vk::Image,
        range: vk::ImageSubresourceRange,
        sampled: bool,
        initial: ImageState,
    ) -> Self {
        Self {
            image,
            range,
            sampled,
            acquire_stage: None,
            state: Cell::new(initial),
        }
    }

    /// Track a presentable image. Its contents are handed over by a semaphore
    /// waited at `acquire_stage`, so barriers out of
    /// [`ImageState::Undefined`] start at that stage instead of none.
    pub fn presentable(
        image: vk::Image,
        range: vk::ImageSubresourceRange,
        acquire_stage: vk::PipelineStageFlags2,
    ) -> Self {
        Self {
            acquire_stage: Some(acquire_stage),
            ..Self::new(image, range, false, ImageState::Undefined)
        }
    }

    pub fn image(&self) -> vk::Image {
        self.image
    }

    pub fn range(&self) -> vk::ImageSubresourceRange {
        self.range
    }

    pub fn sampled(&self) -> bool {
        self.sampled
    }

    /// Last-known state of the image.
    pub fn state(&self) -> ImageState {
        self.state.get()
    }

    /// Overwrite the tracked state without a barrier.
    ///
    /// Only for state changes performed outside recorded barriers, such as the
    /// presentation engine releasing a swapchain image.
    pub(crate) fn reset_state(&self, state: ImageState) {
        self.state.set(state);
    }

    /// Plan the move to `desired` over the whole range and update the tracked
    /// state in the same step. The returned barrier must be recorded.
    pub fn transition(&self, desired: ImageState) -> Option<ImageBarrier> {
        let current = self.state.get();
        let mut access = required_barrier(current, desired)?;
        if let (ImageState::Undefined, Some(stage)) = (current, self.acquire_stage) {
            access = access.after_stage(stage);
        }
        self.state.set(desired);
        Some(ImageBarrier {
            image: self.image,
            range: self.range,
            access,
        })
    }
}

/// Full subresource range for `aspect`.
pub fn full_range(
    aspect: vk::ImageAspectFlags,
    mip_levels: u32,
    array_layers: u32,
) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(aspect)
        .base_mip_level(0)
        .level_count(mip_levels)
        .base_array_layer(0)
        .layer_count(array_layers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    const ALL: [ImageState; 8] = [
        ImageState::Undefined,
        ImageState::General,
        ImageState::ColorAttachment,
        ImageState::DepthAttachment,
        ImageState::ShaderReadOnly,
        ImageState::TransferSrc,
        ImageState::TransferDst,
        ImageState::Present,
    ];

    fn track(state: ImageState) -> ImageTrack {
        ImageTrack::new(
            vk::Image::from_raw(7),
            full_range(vk::ImageAspectFlags::COLOR, 1, 1),
            true,
            state,
        )
    }

    #[test]
    fn no_barrier_for_same_state() {
        for state in ALL {
            assert_eq!(required_barrier(state, state), None);
        }
    }

    #[test]
    fn barrier_carries_both_layouts() {
        for from in ALL {
            for to in ALL {
                if from == to {
                    continue;
                }
                let access = required_barrier(from, to).unwrap();
                assert_eq!(access.old_layout(), from.layout());
                assert_eq!(access.new_layout(), to.layout());
            }
        }
    }

    #[test]
    fn color_attachment_waits_for_transfer_write() {
        let access = required_barrier(ImageState::TransferDst, ImageState::ColorAttachment).unwrap();
        assert_eq!(access.src_stage, vk::PipelineStageFlags2::TRANSFER);
        assert_eq!(access.src_access, vk::AccessFlags2::TRANSFER_WRITE);
        assert_eq!(access.dst_stage, vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT);
        assert!(access
            .dst_access
            .contains(vk::AccessFlags2::COLOR_ATTACHMENT_WRITE));
    }

    #[test]
    fn depth_uses_fragment_test_stages() {
        let access = required_barrier(ImageState::Undefined, ImageState::DepthAttachment).unwrap();
        assert!(access
            .dst_stage
            .contains(vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS));
        assert_eq!(access.src_access, vk::AccessFlags2::NONE);
    }

    #[test]
    fn read_only_sources_carry_no_access() {
        for from in [ImageState::ShaderReadOnly, ImageState::TransferSrc] {
            let access = required_barrier(from, ImageState::TransferDst).unwrap();
            assert_eq!(access.src_access, vk::AccessFlags2::NONE);
        }
    }

    #[test]
    fn after_stage_overrides_source_stage() {
        let access = required_barrier(ImageState::Undefined, ImageState::TransferDst)
            .unwrap()
            .after_stage(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT);
        assert_eq!(
            access.src_stage,
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT
        );
    }

    #[test]
    fn transition_updates_tracked_state() {
        let image = track(ImageState::Undefined);
        let barrier = image.transition(ImageState::ColorAttachment).unwrap();
        assert_eq!(barrier.access.from, ImageState::Undefined);
        assert_eq!(image.state(), ImageState::ColorAttachment);
        assert!(image.transition(ImageState::ColorAttachment).is_none());
    }

    #[test]
    fn vk_barrier_matches_plan() {
        let image = track(ImageState::ColorAttachment);
        let barrier = image.transition(ImageState::ShaderReadOnly).unwrap();
        let raw = barrier.to_vk();
        assert_eq!(raw.old_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(raw.new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(raw.image, vk::Image::from_raw(7));
        assert_eq!(raw.subresource_range.level_count, 1);
    }

    #[test]
    fn presentable_images_chain_with_acquire() {
        let image = ImageTrack::presentable(
            vk::Image::from_raw(9),
            full_range(vk::ImageAspectFlags::COLOR, 1, 1),
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
        );
        assert!(!image.sampled());

        let first = image.transition(ImageState::ColorAttachment).unwrap();
        assert_eq!(
            first.access.src_stage,
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT
        );

        let second = image.transition(ImageState::Present).unwrap();
        assert_eq!(
            second.access.src_stage,
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT
        );
        assert_eq!(second.access.src_access, vk::AccessFlags2::COLOR_ATTACHMENT_WRITE);

        image.reset_state(ImageState::Undefined);
        let blit = image.transition(ImageState::TransferDst).unwrap();
        assert_eq!(
            blit.access.src_stage,
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT
        );
        assert_eq!(blit.access.dst_stage, vk::PipelineStageFlags2::TRANSFER);
    }
}
