// Vulkan Device - logical device and its queues
//
// Responsibilities:
// - Logical device creation with one queue per distinct family
// - Graphics + present queue handles (may be the same queue)
// - Device properties logged at creation

use anyhow::{Context, Result};
use ash::vk;
use std::ffi::CStr;
use std::sync::Arc;

use super::instance::VulkanInstance;
use super::probe::{required_device_extensions, QueueFamilies};

/// Every queue gets the same priority
const QUEUE_PRIORITIES: [f32; 1] = [1.0];

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,

    // Queue handles, owned for the device's lifetime
    pub queue_families: QueueFamilies,
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,

    // Dropped after the device is destroyed
    pub instance: Arc<VulkanInstance>,
}

impl VulkanDevice {
    /// Create the logical device for an already-probed physical device
    pub fn new(
        instance: Arc<VulkanInstance>,
        physical_device: vk::PhysicalDevice,
        queue_families: QueueFamilies,
    ) -> Result<Arc<Self>> {
        let properties = unsafe {
            instance.instance.get_physical_device_properties(physical_device)
        };

        log::info!("Selected GPU: {} ({:?})",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
                .to_string_lossy(),
            properties.device_type);
        log::info!("API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version));
        log::info!("Queue families: graphics={} present={}",
            queue_families.graphics, queue_families.present);

        let queue_create_infos = queue_create_infos(&queue_families);

        let extensions: Vec<_> = required_device_extensions()
            .iter()
            .map(|name| name.as_ptr())
            .collect();
        let layers = instance.enabled_layers();
        let features = vk::PhysicalDeviceFeatures::default();

        // Device layers are ignored by current loaders; pre-1.1 implementations still read them
        #[allow(deprecated)]
        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layers)
            .enabled_features(&features);

        let device = unsafe {
            instance.instance.create_device(physical_device, &create_info, None)
        }
        .context("Failed to create logical device")?;

        let (graphics_queue, present_queue) = unsafe {
            (
                device.get_device_queue(queue_families.graphics, 0),
                device.get_device_queue(queue_families.present, 0),
            )
        };

        Ok(Arc::new(Self {
            device,
            physical_device,
            queue_families,
            graphics_queue,
            present_queue,
            instance,
        }))
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }
            .context("Failed to wait for device idle")?;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        if let Err(e) = self.wait_idle() {
            log::error!("Failed to drain device before destroying it: {:#}", e);
        }

        // Queues die with the device
        unsafe {
            self.device.destroy_device(None);
        }
    }
}

/// One create request per distinct family, index 0 only
pub fn queue_create_infos(families: &QueueFamilies) -> Vec<vk::DeviceQueueCreateInfo> {
    families
        .unique()
        .into_iter()
        .map(|family| {
            vk::DeviceQueueCreateInfo::builder()
                .queue_family_index(family)
                .queue_priorities(&QUEUE_PRIORITIES)
                .build()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_family_creates_one_queue() {
        let infos = queue_create_infos(&QueueFamilies { graphics: 1, present: 1 });
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].queue_family_index, 1);
        assert_eq!(infos[0].queue_count, 1);
    }

    #[test]
    fn test_split_families_create_two_queues() {
        let infos = queue_create_infos(&QueueFamilies { graphics: 0, present: 2 });
        let families: Vec<u32> = infos.iter().map(|info| info.queue_family_index).collect();
        assert_eq!(families, vec![0, 2]);
        assert!(infos.iter().all(|info| info.queue_count == 1));

        let priority = unsafe { *infos[0].p_queue_priorities };
        assert_eq!(priority, 1.0);
    }
}
