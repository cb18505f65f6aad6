// Capability probing - queue families, extensions, surface support
//
// Pure queries: nothing here creates or destroys Vulkan objects.
// Device selection takes the first suitable GPU in enumeration order.

use anyhow::{Context, Result};
use ash::extensions::khr::Swapchain as SwapchainLoader;
use ash::vk;
use std::ffi::CStr;

use super::instance::{Surface, VulkanInstance};

/// Device extensions every candidate must expose
pub fn required_device_extensions() -> [&'static CStr; 1] {
    [SwapchainLoader::name()]
}

/// Queue families found while probing; either may still be missing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: Option<u32>,
    pub present: Option<u32>,
}

impl QueueFamilyIndices {
    pub fn is_complete(&self) -> bool {
        self.graphics.is_some() && self.present.is_some()
    }

    /// Resolved families, only when both roles are covered
    pub fn complete(&self) -> Option<QueueFamilies> {
        Some(QueueFamilies {
            graphics: self.graphics?,
            present: self.present?,
        })
    }

    /// Walk `families` in order, stopping as soon as both roles are found.
    ///
    /// `supports_present` answers whether family `i` can present to the
    /// surface being probed.
    pub fn from_properties<F>(families: &[vk::QueueFamilyProperties], mut supports_present: F) -> Result<Self>
    where
        F: FnMut(u32) -> Result<bool>,
    {
        let mut indices = Self::default();

        for (i, family) in families.iter().enumerate() {
            let index = i as u32;

            if family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
                indices.graphics = Some(index);
            }
            if supports_present(index)? {
                indices.present = Some(index);
            }
            if indices.is_complete() {
                break;
            }
        }

        Ok(indices)
    }
}

/// Graphics and present queue families of the chosen device (may be equal).
///
/// The same value drives device creation and the swapchain sharing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilies {
    pub fn is_shared(&self) -> bool {
        self.graphics == self.present
    }

    /// Distinct family indices, ascending
    pub fn unique(&self) -> Vec<u32> {
        let mut families = vec![self.graphics, self.present];
        families.sort_unstable();
        families.dedup();
        families
    }
}

/// Surface limits, formats and present modes as reported right now.
///
/// Never cached across swapchain builds: a resize can change every field.
#[derive(Debug, Clone)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceSupport {
    pub fn query(physical_device: vk::PhysicalDevice, surface: &Surface) -> Result<Self> {
        let loader = surface.loader();
        unsafe {
            Ok(Self {
                capabilities: loader
                    .get_physical_device_surface_capabilities(physical_device, surface.handle)
                    .context("Failed to query surface capabilities")?,
                formats: loader
                    .get_physical_device_surface_formats(physical_device, surface.handle)
                    .context("Failed to query surface formats")?,
                present_modes: loader
                    .get_physical_device_surface_present_modes(physical_device, surface.handle)
                    .context("Failed to query surface present modes")?,
            })
        }
    }

    /// At least one format and one present mode
    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

/// Queue families of `physical_device` relative to `surface`
pub fn find_queue_families(
    instance: &VulkanInstance,
    physical_device: vk::PhysicalDevice,
    surface: &Surface,
) -> Result<QueueFamilyIndices> {
    let families = unsafe {
        instance
            .instance
            .get_physical_device_queue_family_properties(physical_device)
    };

    QueueFamilyIndices::from_properties(&families, |index| unsafe {
        surface
            .loader()
            .get_physical_device_surface_support(physical_device, index, surface.handle)
            .context("Failed to query surface presentation support")
    })
}

/// Required extensions absent from `available`
pub fn missing_extensions<'a, I>(available: I) -> Vec<&'static CStr>
where
    I: IntoIterator<Item = &'a CStr>,
{
    let available: Vec<&CStr> = available.into_iter().collect();
    required_device_extensions()
        .into_iter()
        .filter(|required| !available.contains(required))
        .collect()
}

fn supports_required_extensions(instance: &VulkanInstance, physical_device: vk::PhysicalDevice) -> Result<bool> {
    let properties = unsafe {
        instance
            .instance
            .enumerate_device_extension_properties(physical_device)
    }
    .context("Failed to enumerate device extensions")?;

    let names = properties
        .iter()
        .map(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) });

    let missing = missing_extensions(names);
    if !missing.is_empty() {
        log::debug!("Device is missing extensions: {:?}", missing);
    }
    Ok(missing.is_empty())
}

/// Resolved queue families when `physical_device` can drive `surface`
fn probe_device(
    instance: &VulkanInstance,
    physical_device: vk::PhysicalDevice,
    surface: &Surface,
) -> Result<Option<QueueFamilies>> {
    let indices = find_queue_families(instance, physical_device, surface)?;
    let Some(families) = indices.complete() else {
        return Ok(None);
    };

    if !supports_required_extensions(instance, physical_device)? {
        return Ok(None);
    }

    // Only meaningful once the swapchain extension is known to exist
    let support = SurfaceSupport::query(physical_device, surface)?;
    if !support.is_adequate() {
        return Ok(None);
    }

    Ok(Some(families))
}

/// First candidate for which `probe` yields queue families.
///
/// No ranking: a discrete GPU listed after a suitable integrated one is
/// never considered.
pub fn select_first_suitable<D, F>(candidates: &[D], mut probe: F) -> Result<(D, QueueFamilies)>
where
    D: Copy,
    F: FnMut(D) -> Result<Option<QueueFamilies>>,
{
    if candidates.is_empty() {
        anyhow::bail!("Failed to find GPUs with Vulkan support");
    }

    for &candidate in candidates {
        if let Some(families) = probe(candidate)? {
            return Ok((candidate, families));
        }
    }

    anyhow::bail!("Failed to find a suitable GPU")
}

/// Pick the physical device that will drive `surface`
pub fn pick_physical_device(
    instance: &VulkanInstance,
    surface: &Surface,
) -> Result<(vk::PhysicalDevice, QueueFamilies)> {
    let devices = unsafe { instance.instance.enumerate_physical_devices() }
        .context("Failed to enumerate physical devices")?;

    log::debug!("Found {} Vulkan device(s)", devices.len());

    select_first_suitable(&devices, |device| probe_device(instance, device, surface))
}
