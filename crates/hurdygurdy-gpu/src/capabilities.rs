//! What a physical device offers, and how well it suits the renderer.

use ash::vk;
use std::ffi::CStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify the vendor from its PCI id.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Properties of one physical device, queried once at startup.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    pub vendor: GpuVendor,
    pub device_name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub api_version: u32,
    pub driver_version: u32,

    /// First queue family with both graphics and compute.
    pub general_queue_family: Option<u32>,

    pub supports_dynamic_rendering: bool,
    pub supports_synchronization2: bool,
    pub supports_sampler_anisotropy: bool,

    pub max_sampler_anisotropy: f32,
    /// Bytes.
    pub max_push_constants_size: u32,
    pub device_local_memory_mb: u64,
}

impl GpuCapabilities {
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = instance.get_physical_device_properties(physical_device);
        let memory = instance.get_physical_device_memory_properties(physical_device);

        // Only 1.3 devices may be asked for the 1.3 feature struct
        let has_vulkan_1_3 = api_at_least_1_3(properties.api_version);
        let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default();
        let features = if has_vulkan_1_3 {
            let mut features2 =
                vk::PhysicalDeviceFeatures2::default().push_next(&mut vulkan_1_3_features);
            instance.get_physical_device_features2(physical_device, &mut features2);
            features2.features
        } else {
            instance.get_physical_device_features(physical_device)
        };

        let general_queue_family = instance
            .get_physical_device_queue_family_properties(physical_device)
            .iter()
            .position(|family| {
                family
                    .queue_flags
                    .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
            })
            .map(|index| index as u32);

        let device_local_memory_mb = memory.memory_heaps[..memory.memory_heap_count as usize]
            .iter()
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size >> 20)
            .sum();

        Self {
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_name: CStr::from_ptr(properties.device_name.as_ptr())
                .to_string_lossy()
                .into_owned(),
            device_type: properties.device_type,
            api_version: properties.api_version,
            driver_version: properties.driver_version,
            general_queue_family,
            supports_dynamic_rendering: vulkan_1_3_features.dynamic_rendering == vk::TRUE,
            supports_synchronization2: vulkan_1_3_features.synchronization2 == vk::TRUE,
            supports_sampler_anisotropy: features.sampler_anisotropy == vk::TRUE,
            max_sampler_anisotropy: properties.limits.max_sampler_anisotropy,
            max_push_constants_size: properties.limits.max_push_constants_size,
            device_local_memory_mb,
        }
    }

    /// Vulkan 1.3 with dynamic rendering, synchronization2 and a queue that
    /// does both graphics and compute.
    pub fn meets_requirements(&self) -> bool {
        api_at_least_1_3(self.api_version)
            && self.supports_dynamic_rendering
            && self.supports_synchronization2
            && self.general_queue_family.is_some()
    }

    /// Rank among the available devices, `None` when unusable. Discrete
    /// beats integrated beats virtual; ties go to the larger VRAM.
    pub fn selection_score(&self) -> Option<u64> {
        if !self.meets_requirements() {
            return None;
        }
        let kind = match self.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
            vk::PhysicalDeviceType::VIRTUAL_GPU => 50,
            _ => 0,
        };
        Some(kind + self.device_local_memory_mb / 1024)
    }

    /// Anisotropy to request for samplers, `None` when unsupported.
    pub fn sampler_anisotropy(&self) -> Option<f32> {
        self.supports_sampler_anisotropy
            .then_some(self.max_sampler_anisotropy)
    }

    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}, {:?}) - Vulkan {}.{}.{} - {} MB VRAM",
            self.device_name,
            self.vendor,
            self.device_type,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
        )
    }
}

fn api_at_least_1_3(api_version: u32) -> bool {
    (vk::api_version_major(api_version), vk::api_version_minor(api_version)) >= (1, 3)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(api_version: u32) -> GpuCapabilities {
        GpuCapabilities {
            vendor: GpuVendor::Other(0),
            device_name: "test".to_string(),
            device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
            api_version,
            driver_version: 0,
            general_queue_family: Some(0),
            supports_dynamic_rendering: api_at_least_1_3(api_version),
            supports_synchronization2: api_at_least_1_3(api_version),
            supports_sampler_anisotropy: true,
            max_sampler_anisotropy: 16.0,
            max_push_constants_size: 128,
            device_local_memory_mb: 4096,
        }
    }

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }

    #[test]
    fn requires_vulkan_1_3() {
        assert!(caps(vk::make_api_version(0, 1, 3, 0)).meets_requirements());
        assert!(caps(vk::make_api_version(0, 1, 4, 0)).meets_requirements());
        assert!(caps(vk::make_api_version(0, 2, 0, 0)).meets_requirements());
        assert!(!caps(vk::make_api_version(0, 1, 2, 198)).meets_requirements());
    }

    #[test]
    fn requires_general_queue() {
        let mut c = caps(vk::API_VERSION_1_3);
        c.general_queue_family = None;
        assert!(!c.meets_requirements());
        assert_eq!(c.selection_score(), None);
    }

    #[test]
    fn discrete_outranks_integrated() {
        let discrete = caps(vk::API_VERSION_1_3);
        let mut integrated = caps(vk::API_VERSION_1_3);
        integrated.device_type = vk::PhysicalDeviceType::INTEGRATED_GPU;
        integrated.device_local_memory_mb = 64 * 1024;
        assert!(discrete.selection_score() > integrated.selection_score());
        assert_eq!(discrete.selection_score(), Some(1004));
    }

    #[test]
    fn anisotropy_only_when_supported() {
        let mut c = caps(vk::API_VERSION_1_3);
        assert_eq!(c.sampler_anisotropy(), Some(16.0));
        c.supports_sampler_anisotropy = false;
        assert_eq!(c.sampler_anisotropy(), None);
    }
}
