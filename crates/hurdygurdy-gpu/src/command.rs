//! Command pools and queue submission.
//!
//! All submission goes through `vkQueueSubmit2`, so waits and signals carry
//! the same 64-bit stage masks the barriers use.

use crate::error::Result;
use crate::sync::{create_fence, reset_fence, wait_for_fence};
use ash::vk;
use parking_lot::Mutex;

/// A command pool on the graphics queue family.
pub struct CommandPool {
    pool: vk::CommandPool,
}

impl CommandPool {
    /// # Safety
    /// The device must be valid and the queue family must exist.
    pub unsafe fn new(
        device: &ash::Device,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<Self> {
        let pool = device.create_command_pool(
            &vk::CommandPoolCreateInfo::default()
                .queue_family_index(queue_family)
                .flags(flags),
            None,
        )?;
        Ok(Self { pool })
    }

    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Allocate `count` primary command buffers.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn allocate(&self, device: &ash::Device, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        Ok(device.allocate_command_buffers(
            &vk::CommandBufferAllocateInfo::default()
                .command_pool(self.pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(count),
        )?)
    }

    /// Destroy the pool along with every buffer allocated from it.
    ///
    /// # Safety
    /// None of the pool's buffers may be pending.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_command_pool(self.pool, None);
    }
}

/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn begin_command_buffer(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    flags: vk::CommandBufferUsageFlags,
) -> Result<()> {
    device.begin_command_buffer(cmd, &vk::CommandBufferBeginInfo::default().flags(flags))?;
    Ok(())
}

/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn end_command_buffer(device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
    device.end_command_buffer(cmd)?;
    Ok(())
}

/// What one queue submission executes, waits on and signals.
#[derive(Debug, Default, Clone, Copy)]
pub struct Submission<'a> {
    pub command_buffers: &'a [vk::CommandBuffer],
    /// Semaphores paired with the stage that waits on them.
    pub wait: &'a [(vk::Semaphore, vk::PipelineStageFlags2)],
    /// Signaled once every command completes.
    pub signal: &'a [vk::Semaphore],
    /// Signaled alongside `signal`. May be null.
    pub fence: vk::Fence,
}

/// # Safety
/// All handles must be valid and the queue externally synchronized.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn submit(device: &ash::Device, queue: vk::Queue, submission: &Submission<'_>) -> Result<()> {
    let command_buffers: Vec<_> = submission
        .command_buffers
        .iter()
        .map(|&cmd| vk::CommandBufferSubmitInfo::default().command_buffer(cmd))
        .collect();
    let waits: Vec<_> = submission
        .wait
        .iter()
        .map(|&(semaphore, stage)| {
            vk::SemaphoreSubmitInfo::default()
                .semaphore(semaphore)
                .stage_mask(stage)
        })
        .collect();
    let signals: Vec<_> = submission
        .signal
        .iter()
        .map(|&semaphore| {
            vk::SemaphoreSubmitInfo::default()
                .semaphore(semaphore)
                .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
        })
        .collect();

    let info = vk::SubmitInfo2::default()
        .command_buffer_infos(&command_buffers)
        .wait_semaphore_infos(&waits)
        .signal_semaphore_infos(&signals);
    device.queue_submit2(queue, &[info], submission.fence)?;
    Ok(())
}

struct OneShotState {
    pool: CommandPool,
    fence: vk::Fence,
}

/// Synchronous command recording outside the frame loop, for uploads,
/// downloads and layout setup.
///
/// A buffer is allocated on begin. On end it is submitted, waited on and
/// freed, whether or not the submission succeeded. The pool is shared by
/// every caller of the device, hence the lock.
pub(crate) struct OneShotCommands {
    state: Mutex<OneShotState>,
}

impl OneShotCommands {
    /// # Safety
    /// The device must be valid and the queue family must exist.
    pub(crate) unsafe fn new(device: &ash::Device, queue_family: u32) -> Result<Self> {
        let pool = CommandPool::new(device, queue_family, vk::CommandPoolCreateFlags::TRANSIENT)?;
        let fence = match create_fence(device, false) {
            Ok(fence) => fence,
            Err(e) => {
                pool.destroy(device);
                return Err(e);
            }
        };
        Ok(Self {
            state: Mutex::new(OneShotState { pool, fence }),
        })
    }

    /// # Safety
    /// The device must be valid.
    pub(crate) unsafe fn begin(&self, device: &ash::Device) -> Result<vk::CommandBuffer> {
        let state = self.state.lock();
        let cmd = state.pool.allocate(device, 1)?[0];
        if let Err(e) = begin_command_buffer(device, cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT) {
            device.free_command_buffers(state.pool.handle(), &[cmd]);
            return Err(e);
        }
        Ok(cmd)
    }

    /// # Safety
    /// `cmd` must come from [`OneShotCommands::begin`] on the same device.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub(crate) unsafe fn end(
        &self,
        device: &ash::Device,
        queue: vk::Queue,
        cmd: vk::CommandBuffer,
    ) -> Result<()> {
        let state = self.state.lock();
        let result = Self::execute(device, queue, cmd, state.fence);
        device.free_command_buffers(state.pool.handle(), &[cmd]);
        tracing::trace!("One-shot command buffer retired");
        result
    }

    unsafe fn execute(
        device: &ash::Device,
        queue: vk::Queue,
        cmd: vk::CommandBuffer,
        fence: vk::Fence,
    ) -> Result<()> {
        end_command_buffer(device, cmd)?;
        submit(
            device,
            queue,
            &Submission {
                command_buffers: &[cmd],
                fence,
                ..Default::default()
            },
        )?;
        wait_for_fence(device, fence, u64::MAX)?;
        reset_fence(device, fence)
    }

    /// # Safety
    /// No one-shot buffer may be pending.
    pub(crate) unsafe fn destroy(&self, device: &ash::Device) {
        let state = self.state.lock();
        device.destroy_fence(state.fence, None);
        state.pool.destroy(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_submission_has_no_fence() {
        let submission = Submission::default();
        assert!(submission.command_buffers.is_empty());
        assert!(submission.wait.is_empty());
        assert!(submission.signal.is_empty());
        assert_eq!(submission.fence, vk::Fence::null());
    }
}
