//! Synchronization primitives and frame-in-flight slot bookkeeping.

use crate::error::Result;
use ash::vk;

/// Create a semaphore.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_semaphore(device: &ash::Device) -> Result<vk::Semaphore> {
    let create_info = vk::SemaphoreCreateInfo::default();
    let semaphore = device.create_semaphore(&create_info, None)?;
    Ok(semaphore)
}

/// Create a fence.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_fence(device: &ash::Device, signaled: bool) -> Result<vk::Fence> {
    let flags = if signaled {
        vk::FenceCreateFlags::SIGNALED
    } else {
        vk::FenceCreateFlags::empty()
    };

    let create_info = vk::FenceCreateInfo::default().flags(flags);
    let fence = device.create_fence(&create_info, None)?;
    Ok(fence)
}

/// Wait for a fence to be signaled.
///
/// # Safety
/// The device and fence must be valid.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn wait_for_fence(
    device: &ash::Device,
    fence: vk::Fence,
    timeout_ns: u64,
) -> Result<()> {
    device.wait_for_fences(&[fence], true, timeout_ns)?;
    Ok(())
}

/// Reset a fence to unsignaled state.
///
/// # Safety
/// The device and fence must be valid.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn reset_fence(device: &ash::Device, fence: vk::Fence) -> Result<()> {
    device.reset_fences(&[fence])?;
    Ok(())
}

/// Index bookkeeping for frames in flight.
///
/// Two indices advance independently:
/// - the frame slot cycles through `0..frames_in_flight` and selects the
///   command buffer, the in-flight fence, the image-available semaphore and
///   the descriptor pool;
/// - the image index is whatever the presentation engine handed out and
///   selects the swapchain image and its ready-to-present semaphore.
///
/// A presented image can still be queued for display while another slot starts
/// recording, so the ready-to-present semaphore must never be picked by slot.
#[derive(Debug, Clone)]
pub struct FrameSlots {
    frames_in_flight: usize,
    image_count: usize,
    frame: usize,
    image: Option<usize>,
}

impl FrameSlots {
    /// Create slot bookkeeping. The first [`FrameSlots::advance`] selects slot 0.
    pub fn new(frames_in_flight: usize, image_count: usize) -> Self {
        hg_assert!(frames_in_flight > 0, "frames in flight must be non-zero");
        hg_assert!(image_count > 0, "swapchain must have images");
        Self {
            frames_in_flight,
            image_count,
            frame: frames_in_flight - 1,
            image: None,
        }
    }

    /// Move to the next frame slot and forget the previous image.
    pub fn advance(&mut self) -> usize {
        self.frame = (self.frame + 1) % self.frames_in_flight;
        self.image = None;
        self.frame
    }

    /// Record the image acquired for the current slot.
    pub fn set_image(&mut self, image_index: u32) {
        let image_index = image_index as usize;
        hg_assert!(
            image_index < self.image_count,
            "acquired image {image_index} out of range ({} images)",
            self.image_count
        );
        self.image = Some(image_index);
    }

    /// Current frame slot.
    pub fn frame(&self) -> usize {
        self.frame
    }

    /// Image acquired for the current slot, if any.
    pub fn image(&self) -> Option<usize> {
        self.image
    }

    /// Slot of the fence guarding the current command buffer.
    pub fn fence_slot(&self) -> usize {
        self.frame
    }

    /// Slot of the semaphore the acquire signals.
    pub fn image_available_slot(&self) -> usize {
        self.frame
    }

    /// Slot of the semaphore present waits on: the acquired image.
    pub fn ready_to_present_slot(&self) -> Option<usize> {
        self.image
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    pub fn image_count(&self) -> usize {
        self.image_count
    }
}

/// Synchronization objects of one swapchain.
///
/// Every swapchain gets a fresh set. Nothing is carried over on rebuild, so a
/// semaphore left signaled by an abandoned acquire dies with its swapchain.
#[derive(Debug)]
pub struct FrameSync {
    /// Per frame slot, created signaled.
    pub in_flight: Vec<vk::Fence>,
    /// Per frame slot.
    pub image_available: Vec<vk::Semaphore>,
    /// Per swapchain image.
    pub ready_to_present: Vec<vk::Semaphore>,
    pub slots: FrameSlots,
}

impl FrameSync {
    /// Create the objects for `frames_in_flight` slots and `image_count`
    /// swapchain images.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(device: &ash::Device, frames_in_flight: usize, image_count: usize) -> Result<Self> {
        let mut this = Self {
            in_flight: Vec::with_capacity(frames_in_flight),
            image_available: Vec::with_capacity(frames_in_flight),
            ready_to_present: Vec::with_capacity(image_count),
            slots: FrameSlots::new(frames_in_flight, image_count),
        };
        if let Err(e) = this.create_objects(device, frames_in_flight, image_count) {
            this.destroy(device);
            return Err(e);
        }
        Ok(this)
    }

    unsafe fn create_objects(
        &mut self,
        device: &ash::Device,
        frames_in_flight: usize,
        image_count: usize,
    ) -> Result<()> {
        for _ in 0..frames_in_flight {
            self.in_flight.push(create_fence(device, true)?);
            self.image_available.push(create_semaphore(device)?);
        }
        for _ in 0..image_count {
            self.ready_to_present.push(create_semaphore(device)?);
        }
        Ok(())
    }

    /// Destroy every fence and semaphore.
    ///
    /// # Safety
    /// No pending submission or presentation may still use them.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        for &semaphore in self.image_available.iter().chain(&self.ready_to_present) {
            device.destroy_semaphore(semaphore, None);
        }
        for &fence in &self.in_flight {
            device.destroy_fence(fence, None);
        }
    }
}
