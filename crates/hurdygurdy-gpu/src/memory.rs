//! Device memory.
//!
//! [`GpuAllocator`] sits between the resource types and `gpu-allocator`: it
//! creates the Vulkan object, allocates memory matching its requirements and
//! binds the two, undoing whatever already happened when a later step fails.

use crate::buffer::MemoryType;
use crate::error::{GpuError, Result};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::{AllocatorDebugSettings, MemoryLocation};
use std::sync::Arc;

/// `gpu-allocator` location backing each [`MemoryType`].
pub(crate) fn memory_location(memory_type: MemoryType) -> MemoryLocation {
    match memory_type {
        MemoryType::DeviceLocal => MemoryLocation::GpuOnly,
        MemoryType::LinearAccess => MemoryLocation::CpuToGpu,
        MemoryType::RandomAccess => MemoryLocation::GpuToCpu,
    }
}

/// Allocator shared by every buffer and texture of one device.
pub struct GpuAllocator {
    /// `None` once shut down.
    allocator: Option<Allocator>,
    device: Arc<ash::Device>,
}

impl GpuAllocator {
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let debug_settings = AllocatorDebugSettings {
            log_memory_information: cfg!(debug_assertions),
            log_leaks_on_shutdown: true,
            store_stack_traces: cfg!(debug_assertions),
            log_allocations: false,
            log_frees: false,
            log_stack_traces: false,
        };
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: (*device).clone(),
            physical_device,
            debug_settings,
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        Ok(Self {
            allocator: Some(allocator),
            device,
        })
    }

    fn allocate(
        &mut self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> Result<Allocation> {
        self.allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator already shut down".to_string()))?
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| GpuError::AllocationFailed(format!("{name}: {e}")))
    }

    fn release(&mut self, allocation: Allocation) -> Result<()> {
        match self.allocator.as_mut() {
            Some(allocator) => allocator
                .free(allocation)
                .map_err(|e| GpuError::AllocationFailed(e.to_string())),
            // Shutdown already returned the memory
            None => Ok(()),
        }
    }

    /// Create an exclusive buffer backed by memory of `memory_type`.
    pub fn create_buffer(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
        memory_type: MemoryType,
        name: &str,
    ) -> Result<(vk::Buffer, Allocation)> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None)? };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = match self.allocate(name, requirements, memory_location(memory_type), true) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let bound = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            self.free_buffer(buffer, allocation)?;
            return Err(e.into());
        }

        Ok((buffer, allocation))
    }

    /// Destroy `buffer` and return its memory.
    pub fn free_buffer(&mut self, buffer: vk::Buffer, allocation: Allocation) -> Result<()> {
        unsafe { self.device.destroy_buffer(buffer, None) };
        self.release(allocation)
    }

    /// Create an image in device-local memory.
    pub fn create_image(
        &mut self,
        create_info: &vk::ImageCreateInfo,
        name: &str,
    ) -> Result<(vk::Image, Allocation)> {
        let image = unsafe { self.device.create_image(create_info, None)? };
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let linear = create_info.tiling == vk::ImageTiling::LINEAR;
        let allocation = match self.allocate(name, requirements, MemoryLocation::GpuOnly, linear) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let bound = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            self.free_image(image, allocation)?;
            return Err(e.into());
        }

        Ok((image, allocation))
    }

    /// Destroy `image` and return its memory.
    pub fn free_image(&mut self, image: vk::Image, allocation: Allocation) -> Result<()> {
        unsafe { self.device.destroy_image(image, None) };
        self.release(allocation)
    }

    /// Release all device memory. Must run before the device is destroyed;
    /// allocations still alive are reported as leaks.
    pub fn shutdown(&mut self) {
        if let Some(allocator) = self.allocator.take() {
            drop(allocator);
            tracing::debug!("GPU allocator shut down");
        }
    }
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
