//! GPU buffers.
//!
//! Host-visible buffers are written and read straight through their persistent
//! mapping. Device-local buffers go through a temporary staging buffer and a
//! one-shot copy that blocks until the GPU is done.

use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use ash::vk;
use bitflags::bitflags;
use gpu_allocator::vulkan::Allocation;

bitflags! {
    /// What a buffer is bound as.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
        const UNIFORM = 1 << 2;
        const STORAGE = 1 << 3;
        const TRANSFER_SRC = 1 << 4;
        const TRANSFER_DST = 1 << 5;
    }
}

/// Where a buffer's memory lives and how the CPU may touch it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryType {
    /// GPU-only memory, reached through staging copies.
    DeviceLocal,
    /// Host-mapped, written once from offset 0.
    LinearAccess,
    /// Host-mapped with cached reads, any offset.
    RandomAccess,
}

impl MemoryType {
    /// Whether writes go straight through the mapping.
    pub fn host_writable(self) -> bool {
        !matches!(self, Self::DeviceLocal)
    }

    /// Whether reads go straight through the mapping.
    ///
    /// Linear-access memory is usually write-combined, so reads are staged
    /// like device-local ones.
    pub fn host_readable(self) -> bool {
        matches!(self, Self::RandomAccess)
    }
}

/// Vulkan usage flags for a buffer, including the transfer bits its staging
/// paths need.
pub(crate) fn vk_buffer_usage(usage: BufferUsage, memory_type: MemoryType) -> vk::BufferUsageFlags {
    let mut flags = vk::BufferUsageFlags::empty();
    if usage.contains(BufferUsage::VERTEX) {
        flags |= vk::BufferUsageFlags::VERTEX_BUFFER;
    }
    if usage.contains(BufferUsage::INDEX) {
        flags |= vk::BufferUsageFlags::INDEX_BUFFER;
    }
    if usage.contains(BufferUsage::UNIFORM) {
        flags |= vk::BufferUsageFlags::UNIFORM_BUFFER;
    }
    if usage.contains(BufferUsage::STORAGE) {
        flags |= vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    if usage.contains(BufferUsage::TRANSFER_SRC) {
        flags |= vk::BufferUsageFlags::TRANSFER_SRC;
    }
    if usage.contains(BufferUsage::TRANSFER_DST) {
        flags |= vk::BufferUsageFlags::TRANSFER_DST;
    }
    if !memory_type.host_writable() {
        flags |= vk::BufferUsageFlags::TRANSFER_DST;
    }
    if !memory_type.host_readable() {
        flags |= vk::BufferUsageFlags::TRANSFER_SRC;
    }
    flags
}

/// A GPU buffer with its allocation.
///
/// Owned exclusively by its creator and released with [`Buffer::destroy`].
pub struct Buffer {
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    size: u64,
    usage: BufferUsage,
    memory_type: MemoryType,
}

impl Buffer {
    /// Create a buffer of `size` bytes.
    pub fn new(
        gpu: &GpuContext,
        size: u64,
        usage: BufferUsage,
        memory_type: MemoryType,
    ) -> Result<Self> {
        hg_assert!(size > 0, "buffer size must be non-zero");
        hg_assert!(!usage.is_empty(), "buffer usage must not be empty");

        let (buffer, allocation) = gpu.allocator().lock().create_buffer(
            size,
            vk_buffer_usage(usage, memory_type),
            memory_type,
            "buffer",
        )?;

        tracing::trace!("Created {memory_type:?} buffer of {size} bytes ({usage:?})");

        Ok(Self {
            buffer,
            allocation: Some(allocation),
            size,
            usage,
            memory_type,
        })
    }

    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    pub fn memory_type(&self) -> MemoryType {
        self.memory_type
    }

    fn mapped(&self) -> Result<&[u8]> {
        self.allocation
            .as_ref()
            .and_then(Allocation::mapped_slice)
            .ok_or_else(|| GpuError::InvalidState("Buffer not mapped".to_string()))
    }

    fn mapped_mut(&mut self) -> Result<&mut [u8]> {
        self.allocation
            .as_mut()
            .and_then(Allocation::mapped_slice_mut)
            .ok_or_else(|| GpuError::InvalidState("Buffer not mapped".to_string()))
    }

    /// Write `data` at `offset`.
    ///
    /// Linear-access buffers only accept writes at offset 0.
    pub fn write(&mut self, gpu: &GpuContext, offset: u64, data: &[u8]) -> Result<()> {
        hg_assert!(!data.is_empty(), "buffer write of zero bytes");
        hg_assert!(
            offset + data.len() as u64 <= self.size,
            "buffer write of {} bytes at {offset} overruns {} byte buffer",
            data.len(),
            self.size
        );

        match self.memory_type {
            MemoryType::LinearAccess | MemoryType::RandomAccess => {
                if self.memory_type == MemoryType::LinearAccess {
                    hg_assert!(offset == 0, "linear-access buffers are written from offset 0");
                }
                let start = offset as usize;
                self.mapped_mut()?[start..start + data.len()].copy_from_slice(data);
                Ok(())
            }
            MemoryType::DeviceLocal => {
                let size = data.len() as u64;
                let mut staging =
                    Buffer::new(gpu, size, BufferUsage::TRANSFER_SRC, MemoryType::LinearAccess)?;
                let result = staging.write(gpu, 0, data).and_then(|()| {
                    gpu.submit_one_shot(|device, cmd| unsafe {
                        cmd_copy_buffer(device, cmd, staging.buffer, 0, self.buffer, offset, size);
                    })
                });
                staging.destroy(gpu)?;
                result
            }
        }
    }

    /// Read `out.len()` bytes starting at `offset`.
    pub fn read(&self, gpu: &GpuContext, offset: u64, out: &mut [u8]) -> Result<()> {
        hg_assert!(!out.is_empty(), "buffer read of zero bytes");
        hg_assert!(
            offset + out.len() as u64 <= self.size,
            "buffer read of {} bytes at {offset} overruns {} byte buffer",
            out.len(),
            self.size
        );

        if self.memory_type.host_readable() {
            let start = offset as usize;
            out.copy_from_slice(&self.mapped()?[start..start + out.len()]);
            return Ok(());
        }

        let size = out.len() as u64;
        let staging = Buffer::new(gpu, size, BufferUsage::TRANSFER_DST, MemoryType::RandomAccess)?;
        let result = gpu
            .submit_one_shot(|device, cmd| unsafe {
                cmd_copy_buffer(device, cmd, self.buffer, offset, staging.buffer, 0, size);
            })
            .and_then(|()| staging.read(gpu, 0, out));
        staging.destroy(gpu)?;
        result
    }

    /// Free the buffer and its memory.
    pub fn destroy(mut self, gpu: &GpuContext) -> Result<()> {
        match self.allocation.take() {
            Some(allocation) => gpu.allocator().lock().free_buffer(self.buffer, allocation),
            None => Ok(()),
        }
    }
}

/// Record a single-region buffer copy.
///
/// # Safety
/// Handles must be valid and the command buffer recording.
pub(crate) unsafe fn cmd_copy_buffer(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    src: vk::Buffer,
    src_offset: u64,
    dst: vk::Buffer,
    dst_offset: u64,
    size: u64,
) {
    let region = vk::BufferCopy2::default()
        .src_offset(src_offset)
        .dst_offset(dst_offset)
        .size(size);
    let info = vk::CopyBufferInfo2::default()
        .src_buffer(src)
        .dst_buffer(dst)
        .regions(std::slice::from_ref(&region));
    device.cmd_copy_buffer2(cmd, &info);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_local_gets_both_transfer_bits() {
        let flags = vk_buffer_usage(BufferUsage::VERTEX, MemoryType::DeviceLocal);
        assert!(flags.contains(vk::BufferUsageFlags::VERTEX_BUFFER));
        assert!(flags.contains(vk::BufferUsageFlags::TRANSFER_DST));
        assert!(flags.contains(vk::BufferUsageFlags::TRANSFER_SRC));
    }

    #[test]
    fn random_access_needs_no_staging_bits() {
        let flags = vk_buffer_usage(BufferUsage::UNIFORM, MemoryType::RandomAccess);
        assert_eq!(flags, vk::BufferUsageFlags::UNIFORM_BUFFER);
    }

    #[test]
    fn linear_access_is_read_through_staging() {
        let flags = vk_buffer_usage(BufferUsage::STORAGE, MemoryType::LinearAccess);
        assert!(flags.contains(vk::BufferUsageFlags::TRANSFER_SRC));
        assert!(!flags.contains(vk::BufferUsageFlags::TRANSFER_DST));
        assert!(!MemoryType::LinearAccess.host_readable());
        assert!(MemoryType::LinearAccess.host_writable());
    }

    #[test]
    fn usage_maps_one_to_one() {
        let all = BufferUsage::all();
        let flags = vk_buffer_usage(all, MemoryType::RandomAccess);
        assert_eq!(
            flags,
            vk::BufferUsageFlags::VERTEX_BUFFER
                | vk::BufferUsageFlags::INDEX_BUFFER
                | vk::BufferUsageFlags::UNIFORM_BUFFER
                | vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::TRANSFER_SRC
                | vk::BufferUsageFlags::TRANSFER_DST
        );
    }
}
