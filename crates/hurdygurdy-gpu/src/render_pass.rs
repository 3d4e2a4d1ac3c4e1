//! Render pass bookkeeping for dynamic rendering.
//!
//! [`RenderTargetTracker`] decides which barriers a pass needs before it
//! starts: the new color and depth attachments are moved into attachment
//! layouts, and the attachments of the previous pass are lazily demoted to
//! shader-read-only so they can be sampled. The previous pass's attachments are
//! only held weakly, so a destroyed texture is simply skipped.
//!
//! [`plan_present`] does the same for the end of a frame, when the swapchain
//! image is handed to the presentation engine.

use crate::layout::{ImageBarrier, ImageState, ImageTrack};
use ash::vk;
use std::rc::{Rc, Weak};

/// Anything a rendering pass can draw into.
pub trait Attachment {
    /// Tracked layout state of the underlying image.
    fn track(&self) -> &Rc<ImageTrack>;
    /// View used as the rendering attachment.
    fn view(&self) -> vk::ImageView;
    /// Full extent of the attachment.
    fn extent(&self) -> vk::Extent2D;
}

/// Work to record before a new rendering scope starts.
#[derive(Debug)]
pub struct PassPlan {
    /// A pass was still open and must be ended first.
    pub close_open_pass: bool,
    /// Barriers to record in one call. Never more than four.
    pub barriers: Vec<ImageBarrier>,
}

/// Barriers that finish a frame, in recording order.
#[derive(Debug, Default)]
pub struct PresentPlan {
    /// Framebuffer to transfer-source and swapchain image to
    /// transfer-destination. Empty when nothing is blitted.
    pub before_blit: Vec<ImageBarrier>,
    /// Swapchain image to present.
    pub present: Option<ImageBarrier>,
}

/// Plan the end of a frame on the swapchain `image`, blitting `framebuffer`
/// onto it first when there is one.
///
/// Tracked states are updated as part of planning, as in
/// [`RenderTargetTracker::begin`].
pub fn plan_present(image: &ImageTrack, framebuffer: Option<&ImageTrack>) -> PresentPlan {
    let before_blit = match framebuffer {
        Some(framebuffer) => framebuffer
            .transition(ImageState::TransferSrc)
            .into_iter()
            .chain(image.transition(ImageState::TransferDst))
            .collect(),
        None => Vec::new(),
    };
    PresentPlan {
        before_blit,
        present: image.transition(ImageState::Present),
    }
}

/// Open-pass flag plus the attachments of the previous pass.
#[derive(Debug, Default)]
pub struct RenderTargetTracker {
    previous_target: Option<Weak<ImageTrack>>,
    previous_depth: Option<Weak<ImageTrack>>,
    open: bool,
}

impl RenderTargetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a rendering scope is currently open.
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Plan the start of a pass into `target` and optionally `depth`.
    ///
    /// Tracked states are updated as part of planning; the caller must record
    /// the returned plan before anything else touches these images.
    pub fn begin(&mut self, target: &Rc<ImageTrack>, depth: Option<&Rc<ImageTrack>>) -> PassPlan {
        let close_open_pass = std::mem::replace(&mut self.open, true);

        let mut barriers = Vec::with_capacity(4);
        barriers.extend(target.transition(ImageState::ColorAttachment));
        if let Some(depth) = depth {
            barriers.extend(depth.transition(ImageState::DepthAttachment));
        }

        let previous = [self.previous_target.take(), self.previous_depth.take()];
        for previous in previous.iter().flatten().filter_map(Weak::upgrade) {
            let in_use = Rc::ptr_eq(&previous, target)
                || depth.is_some_and(|depth| Rc::ptr_eq(&previous, depth));
            if !in_use && previous.sampled() {
                barriers.extend(previous.transition(ImageState::ShaderReadOnly));
            }
        }

        self.previous_target = Some(Rc::downgrade(target));
        self.previous_depth = depth.map(Rc::downgrade);

        PassPlan {
            close_open_pass,
            barriers,
        }
    }

    /// Mark the open pass as ended.
    pub fn end(&mut self) {
        hg_assert!(self.open, "renderpass_end called with no open render pass");
        self.open = false;
    }

    /// Close whatever pass is open. Returns whether one was.
    pub fn close(&mut self) -> bool {
        std::mem::replace(&mut self.open, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::full_range;
    use ash::vk::Handle;
    use std::collections::HashMap;

    /// Stand-in for the GPU: applies recorded barriers and checks each one
    /// starts from the layout the image is actually in.
    #[derive(Default)]
    struct MockDevice {
        layouts: HashMap<u64, vk::ImageLayout>,
        scopes: Vec<&'static str>,
    }

    impl MockDevice {
        fn record(&mut self, plan: &PassPlan) {
            if plan.close_open_pass {
                self.scopes.push("end");
            }
            assert!(plan.barriers.len() <= 4);
            self.apply(&plan.barriers);
            self.scopes.push("begin");
        }

        fn apply(&mut self, barriers: &[ImageBarrier]) {
            for barrier in barriers {
                let actual = self
                    .layouts
                    .entry(barrier.image.as_raw())
                    .or_insert(vk::ImageLayout::UNDEFINED);
                assert_eq!(*actual, barrier.access.old_layout(), "stale tracked layout");
                *actual = barrier.access.new_layout();
            }
        }

        fn end(&mut self, tracker: &mut RenderTargetTracker) {
            tracker.end();
            self.scopes.push("end");
        }

        fn layout_of(&self, track: &ImageTrack) -> vk::ImageLayout {
            self.layouts
                .get(&track.image().as_raw())
                .copied()
                .unwrap_or(vk::ImageLayout::UNDEFINED)
        }
    }

    fn color(raw: u64, sampled: bool) -> Rc<ImageTrack> {
        Rc::new(ImageTrack::new(
            vk::Image::from_raw(raw),
            full_range(vk::ImageAspectFlags::COLOR, 1, 1),
            sampled,
            ImageState::Undefined,
        ))
    }

    fn swapchain_image(raw: u64) -> Rc<ImageTrack> {
        Rc::new(ImageTrack::presentable(
            vk::Image::from_raw(raw),
            full_range(vk::ImageAspectFlags::COLOR, 1, 1),
            ACQUIRE_STAGE,
        ))
    }

    const ACQUIRE_STAGE: vk::PipelineStageFlags2 = vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT;

    fn depth(raw: u64) -> Rc<ImageTrack> {
        Rc::new(ImageTrack::new(
            vk::Image::from_raw(raw),
            full_range(vk::ImageAspectFlags::DEPTH, 1, 1),
            true,
            ImageState::Undefined,
        ))
    }

    #[test]
    fn first_pass_transitions_attachments() {
        let mut tracker = RenderTargetTracker::new();
        let target = color(1, true);
        let depth_buffer = depth(2);

        let plan = tracker.begin(&target, Some(&depth_buffer));
        assert!(!plan.close_open_pass);
        assert_eq!(plan.barriers.len(), 2);
        assert_eq!(target.state(), ImageState::ColorAttachment);
        assert_eq!(depth_buffer.state(), ImageState::DepthAttachment);
        assert!(tracker.is_open());
    }

    #[test]
    fn same_target_twice_needs_no_barriers() {
        let mut tracker = RenderTargetTracker::new();
        let target = color(1, true);

        tracker.begin(&target, None);
        tracker.end();
        let plan = tracker.begin(&target, None);
        assert!(plan.barriers.is_empty());
    }

    #[test]
    fn previous_attachments_are_demoted_for_sampling() {
        let mut tracker = RenderTargetTracker::new();
        let shadow = color(1, true);
        let shadow_depth = depth(2);
        let screen = color(3, true);

        tracker.begin(&shadow, Some(&shadow_depth));
        tracker.end();
        let plan = tracker.begin(&screen, None);

        assert_eq!(plan.barriers.len(), 3);
        assert_eq!(shadow.state(), ImageState::ShaderReadOnly);
        assert_eq!(shadow_depth.state(), ImageState::ShaderReadOnly);
        assert_eq!(screen.state(), ImageState::ColorAttachment);
    }

    #[test]
    fn non_sampled_targets_are_not_demoted() {
        let mut tracker = RenderTargetTracker::new();
        let swapchain_image = color(1, false);
        let other = color(2, true);

        tracker.begin(&swapchain_image, None);
        tracker.end();
        tracker.begin(&other, None);
        assert_eq!(swapchain_image.state(), ImageState::ColorAttachment);
    }

    #[test]
    fn already_read_only_previous_needs_no_barrier() {
        let mut tracker = RenderTargetTracker::new();
        let a = color(1, true);
        let b = color(2, true);

        tracker.begin(&a, None);
        tracker.end();
        a.transition(ImageState::ShaderReadOnly);
        let plan = tracker.begin(&b, None);
        assert_eq!(plan.barriers.len(), 1);
    }

    #[test]
    fn destroyed_previous_target_is_skipped() {
        let mut tracker = RenderTargetTracker::new();
        let a = color(1, true);
        let b = color(2, true);

        tracker.begin(&a, None);
        tracker.end();
        drop(a);
        let plan = tracker.begin(&b, None);
        assert_eq!(plan.barriers.len(), 1);
        assert_eq!(plan.barriers[0].image, vk::Image::from_raw(2));
    }

    #[test]
    fn begin_twice_closes_first_pass() {
        let mut tracker = RenderTargetTracker::new();
        let mut device = MockDevice::default();
        let a = color(1, true);
        let b = color(2, true);

        let plan = tracker.begin(&a, None);
        device.record(&plan);
        let plan = tracker.begin(&b, None);
        assert!(plan.close_open_pass);
        device.record(&plan);
        device.end(&mut tracker);

        assert_eq!(device.scopes, vec!["begin", "end", "begin", "end"]);
        assert!(!tracker.is_open());
    }

    #[test]
    fn tracked_layouts_match_recorded_layouts() {
        let mut tracker = RenderTargetTracker::new();
        let mut device = MockDevice::default();
        let gbuffer = color(1, true);
        let gdepth = depth(2);
        let lighting = color(3, true);
        let post = color(4, true);

        let sequence: [(&Rc<ImageTrack>, Option<&Rc<ImageTrack>>); 6] = [
            (&gbuffer, Some(&gdepth)),
            (&lighting, None),
            (&post, None),
            (&gbuffer, Some(&gdepth)),
            (&gbuffer, None),
            (&lighting, Some(&gdepth)),
        ];

        for (i, (target, depth_buffer)) in sequence.into_iter().enumerate() {
            let plan = tracker.begin(target, depth_buffer);
            device.record(&plan);
            if i % 2 == 0 {
                device.end(&mut tracker);
            }
            for track in [&gbuffer, &gdepth, &lighting, &post] {
                assert_eq!(device.layout_of(track), track.state().layout());
            }
        }
    }

    #[test]
    fn present_after_blit_from_framebuffer() {
        let mut tracker = RenderTargetTracker::new();
        let mut device = MockDevice::default();
        let framebuffer = color(1, true);
        let image = swapchain_image(2);

        device.record(&tracker.begin(&framebuffer, None));
        device.end(&mut tracker);

        let plan = plan_present(&image, Some(&*framebuffer));
        assert_eq!(plan.before_blit.len(), 2);
        let to_dst = &plan.before_blit[1];
        assert_eq!(to_dst.image, image.image());
        assert_eq!(to_dst.access.from, ImageState::Undefined);
        assert_eq!(to_dst.access.src_stage, ACQUIRE_STAGE);
        assert_eq!(to_dst.access.dst_stage, vk::PipelineStageFlags2::TRANSFER);

        device.apply(&plan.before_blit);
        assert_eq!(device.layout_of(&framebuffer), vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        assert_eq!(device.layout_of(&image), vk::ImageLayout::TRANSFER_DST_OPTIMAL);

        let present = plan.present.unwrap();
        assert_eq!(present.access.src_access, vk::AccessFlags2::TRANSFER_WRITE);
        device.apply(&[present]);
        assert_eq!(device.layout_of(&image), vk::ImageLayout::PRESENT_SRC_KHR);
        for track in [&framebuffer, &image] {
            assert_eq!(device.layout_of(track), track.state().layout());
        }

        // The framebuffer is rendered to again next frame
        device.record(&tracker.begin(&framebuffer, None));
        assert_eq!(framebuffer.state(), ImageState::ColorAttachment);
    }

    #[test]
    fn present_swapchain_image_rendered_directly() {
        let mut tracker = RenderTargetTracker::new();
        let mut device = MockDevice::default();
        let image = swapchain_image(1);

        let pass = tracker.begin(&image, None);
        assert_eq!(pass.barriers[0].access.src_stage, ACQUIRE_STAGE);
        device.record(&pass);
        device.end(&mut tracker);

        let plan = plan_present(&image, None);
        assert!(plan.before_blit.is_empty());
        let present = plan.present.unwrap();
        assert_eq!(present.access.from, ImageState::ColorAttachment);
        assert_eq!(
            present.access.src_stage,
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT
        );
        assert_eq!(present.access.src_access, vk::AccessFlags2::COLOR_ATTACHMENT_WRITE);
        device.apply(&[present]);
        assert_eq!(device.layout_of(&image), image.state().layout());
        assert_eq!(image.state(), ImageState::Present);
    }

    #[test]
    fn present_untouched_swapchain_image() {
        let mut device = MockDevice::default();
        let image = swapchain_image(1);

        let plan = plan_present(&image, None);
        assert!(plan.before_blit.is_empty());
        let present = plan.present.unwrap();
        assert_eq!(present.access.from, ImageState::Undefined);
        assert_eq!(present.access.src_stage, ACQUIRE_STAGE);
        device.apply(&[present]);
        assert_eq!(device.layout_of(&image), vk::ImageLayout::PRESENT_SRC_KHR);

        // Presenting again without a new acquire needs nothing
        assert!(plan_present(&image, None).present.is_none());
    }

    #[test]
    #[should_panic(expected = "no open render pass")]
    #[cfg(any(debug_assertions, feature = "strict-asserts"))]
    fn end_without_begin_panics() {
        let mut tracker = RenderTargetTracker::new();
        tracker.end();
    }
}
