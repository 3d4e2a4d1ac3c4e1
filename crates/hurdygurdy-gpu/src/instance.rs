//! Vulkan instance creation.

use crate::capabilities::GpuCapabilities;
use crate::error::{GpuError, Result};
use ash::vk;
use raw_window_handle::RawDisplayHandle;
use std::ffi::{c_char, CStr, CString};

/// Validation layers to enable in debug builds.
pub fn validation_layers() -> Vec<&'static CStr> {
    vec![c"VK_LAYER_KHRONOS_validation"]
}

/// Instance extensions needed to present to the given display.
///
/// Headless contexts (no display) need no extensions at all.
pub fn required_instance_extensions(
    display: Option<RawDisplayHandle>,
) -> Result<Vec<*const c_char>> {
    #[allow(unused_mut)]
    let mut extensions = match display {
        Some(display) => ash_window::enumerate_required_extensions(display)
            .map_err(GpuError::from)?
            .to_vec(),
        None => Vec::new(),
    };

    // Required for MoltenVK
    #[cfg(target_os = "macos")]
    extensions.push(ash::khr::portability_enumeration::NAME.as_ptr());

    Ok(extensions)
}

/// Create a Vulkan instance.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    display: Option<RawDisplayHandle>,
    enable_validation: bool,
) -> Result<ash::Instance> {
    let app_name = CString::new(app_name)
        .map_err(|e| GpuError::InvalidState(format!("Application name: {e}")))?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"Hurdy Gurdy")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_3);

    let extension_names = required_instance_extensions(display)?;

    let layers = if enable_validation {
        validation_layers()
    } else {
        vec![]
    };

    // Missing layers are not an error, the instance is created without them
    let available_layers = entry.enumerate_instance_layer_properties()?;
    let layers: Vec<&CStr> = layers
        .into_iter()
        .filter(|layer| {
            let found = available_layers
                .iter()
                .any(|props| CStr::from_ptr(props.layer_name.as_ptr()) == *layer);
            if !found {
                tracing::warn!("Validation layer {} not available", layer.to_string_lossy());
            }
            found
        })
        .collect();

    let layer_names: Vec<*const c_char> = layers.iter().map(|l| l.as_ptr()).collect();

    #[cfg(target_os = "macos")]
    let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    #[cfg(not(target_os = "macos"))]
    let create_flags = vk::InstanceCreateFlags::empty();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names)
        .flags(create_flags);

    let instance = entry.create_instance(&create_info, None)?;

    Ok(instance)
}

/// Pick the highest scoring device that meets the requirements.
///
/// # Safety
/// The instance must be valid.
pub unsafe fn select_physical_device(
    instance: &ash::Instance,
) -> Result<(vk::PhysicalDevice, GpuCapabilities)> {
    instance
        .enumerate_physical_devices()?
        .into_iter()
        .filter_map(|device| {
            let capabilities = GpuCapabilities::query(instance, device);
            let score = capabilities.selection_score();
            tracing::debug!("Candidate GPU {}: score {score:?}", capabilities.device_name);
            score.map(|score| (score, device, capabilities))
        })
        .max_by_key(|(score, _, _)| *score)
        .map(|(_, device, capabilities)| (device, capabilities))
        .ok_or(GpuError::NoSuitableDevice)
}
