// Vulkan Instance - loader, validation layers, debug messenger, surface
//
// Responsibilities:
// - Load the Vulkan library at runtime
// - Instance creation with the window system's surface extensions
// - Optional validation layers routed into the `log` crate
// - Surface ownership (destroyed before the instance)

use anyhow::{Context, Result};
use ash::extensions::{ext::DebugUtils, khr::Surface as SurfaceLoader};
use ash::{vk, Entry};
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle, RawDisplayHandle};
use std::ffi::{CStr, CString};
use std::sync::Arc;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Vulkan instance wrapper with automatic cleanup.
///
/// Shared through `Arc` by the device and the surface so that it is
/// destroyed only after both of them.
pub struct VulkanInstance {
    pub instance: ash::Instance,
    pub surface_loader: SurfaceLoader,
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
    validation_enabled: bool,
    // Keeps the loader library alive; dropped last
    entry: Entry,
}

impl VulkanInstance {
    /// Create Vulkan instance
    ///
    /// # Arguments
    /// * `app_name` - Application name reported to the driver
    /// * `display_handle` - Display the surfaces will be created on
    /// * `enable_validation` - Enable Vulkan validation layers (debug only)
    pub fn new(
        app_name: &str,
        display_handle: RawDisplayHandle,
        enable_validation: bool,
    ) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan instance: {}", app_name);

        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        if enable_validation && !Self::validation_layer_supported(&entry)? {
            anyhow::bail!("Validation layers requested, but not available");
        }

        let app_name_cstr = CString::new(app_name)?;
        let engine_name = c"No Engine";

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_0);

        let mut extensions = ash_window::enumerate_required_extensions(display_handle)
            .context("Failed to query surface extensions for this window system")?
            .to_vec();
        if enable_validation {
            extensions.push(DebugUtils::name().as_ptr());
        }

        let layer_names = if enable_validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        // Chained into instance creation so create/destroy are validated too
        let mut debug_info = debug_messenger_info();

        let mut create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);
        if enable_validation {
            create_info = create_info.push_next(&mut debug_info);
        }

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        let debug_utils = if enable_validation {
            let debug_utils = DebugUtils::new(&entry, &instance);
            let messenger = unsafe {
                debug_utils.create_debug_utils_messenger(&debug_messenger_info(), None)
            };
            match messenger {
                Ok(messenger) => Some((debug_utils, messenger)),
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e).context("Failed to set up debug messenger");
                }
            }
        } else {
            None
        };

        let surface_loader = SurfaceLoader::new(&entry, &instance);

        Ok(Arc::new(Self {
            instance,
            surface_loader,
            debug_utils,
            validation_enabled: enable_validation,
            entry,
        }))
    }

    fn validation_layer_supported(entry: &Entry) -> Result<bool> {
        let layers = entry
            .enumerate_instance_layer_properties()
            .context("Failed to enumerate instance layers")?;

        Ok(layers.iter().any(|layer| {
            let name = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
            name == VALIDATION_LAYER
        }))
    }

    /// Layers that must also be passed to device creation for older loaders
    pub fn enabled_layers(&self) -> Vec<*const std::os::raw::c_char> {
        if self.validation_enabled {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        }
    }

    /// Create a presentation surface for `window`
    pub fn create_surface<W>(self: &Arc<Self>, window: &W) -> Result<Surface>
    where
        W: HasRawDisplayHandle + HasRawWindowHandle,
    {
        let handle = unsafe {
            ash_window::create_surface(
                &self.entry,
                &self.instance,
                window.raw_display_handle(),
                window.raw_window_handle(),
                None,
            )
        }
        .context("Failed to create window surface")?;

        Ok(Surface {
            handle,
            instance: Arc::clone(self),
        })
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan instance...");

        unsafe {
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Presentation surface bound to one window
pub struct Surface {
    pub handle: vk::SurfaceKHR,
    instance: Arc<VulkanInstance>,
}

impl Surface {
    pub fn loader(&self) -> &SurfaceLoader {
        &self.instance.surface_loader
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe {
            self.instance.surface_loader.destroy_surface(self.handle, None);
        }
    }
}

fn debug_messenger_info() -> vk::DebugUtilsMessengerCreateInfoEXT {
    vk::DebugUtilsMessengerCreateInfoEXT::builder()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback))
        .build()
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::trace!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}
