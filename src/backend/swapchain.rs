// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen,
// together with one image view and one framebuffer per image.
// A Swapchain value is always complete: construction either yields every
// image/view/framebuffer or cleans up what it created.

use anyhow::{Context, Result};
use ash::extensions::khr::Swapchain as SwapchainLoader;
use ash::prelude::VkResult;
use ash::vk;
use std::sync::Arc;

use super::instance::Surface;
use super::probe::{QueueFamilies, SurfaceSupport};
use super::VulkanDevice;

/// Fallback when the surface has no preference, and the preferred pair otherwise
pub const DEFAULT_SURFACE_FORMAT: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
    format: vk::Format::B8G8R8A8_UNORM,
    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
};

/// Pick the surface format.
///
/// A lone UNDEFINED entry means "anything goes" and yields `preferred`.
/// Otherwise `preferred` wins if listed, else the first reported format.
pub fn choose_surface_format(
    available: &[vk::SurfaceFormatKHR],
    preferred: vk::SurfaceFormatKHR,
) -> vk::SurfaceFormatKHR {
    if let [only] = available {
        if only.format == vk::Format::UNDEFINED {
            return preferred;
        }
    }

    available
        .iter()
        .find(|f| f.format == preferred.format && f.color_space == preferred.color_space)
        .or_else(|| available.first())
        .copied()
        .unwrap_or(preferred)
}

/// Pick the present mode.
///
/// MAILBOX: no tearing, lowest latency, returned as soon as it is seen
/// IMMEDIATE: may tear, kept as a candidate while scanning continues
/// FIFO: vsync, always supported
pub fn choose_present_mode(available: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    let mut best = vk::PresentModeKHR::FIFO;

    for &mode in available {
        if mode == vk::PresentModeKHR::MAILBOX {
            return mode;
        } else if mode == vk::PresentModeKHR::IMMEDIATE {
            best = mode;
        }
    }

    best
}

/// Pick the image extent.
///
/// The surface dictates the extent unless it reports the u32::MAX sentinel,
/// in which case the window's framebuffer size is clamped into range.
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, framebuffer_size: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }

    vk::Extent2D {
        width: framebuffer_size.width.clamp(
            caps.min_image_extent.width,
            caps.max_image_extent.width,
        ),
        height: framebuffer_size.height.clamp(
            caps.min_image_extent.height,
            caps.max_image_extent.height,
        ),
    }
}

/// One more than the minimum, capped by the maximum (0 means unbounded)
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let image_count = caps.min_image_count + 1;
    if caps.max_image_count > 0 && image_count > caps.max_image_count {
        caps.max_image_count
    } else {
        image_count
    }
}

/// Concurrent across both families when they differ, exclusive otherwise
pub fn choose_sharing(families: &QueueFamilies) -> (vk::SharingMode, Vec<u32>) {
    if families.is_shared() {
        (vk::SharingMode::EXCLUSIVE, Vec::new())
    } else {
        (vk::SharingMode::CONCURRENT, vec![families.graphics, families.present])
    }
}

/// Every decision that goes into one swapchain build
#[derive(Debug, Clone)]
pub struct SwapchainPlan {
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub image_count: u32,
    pub sharing_mode: vk::SharingMode,
    pub queue_family_indices: Vec<u32>,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
}

impl SwapchainPlan {
    pub fn new(
        support: &SurfaceSupport,
        families: &QueueFamilies,
        framebuffer_size: vk::Extent2D,
        preferred_format: vk::SurfaceFormatKHR,
    ) -> Self {
        let (sharing_mode, queue_family_indices) = choose_sharing(families);

        Self {
            surface_format: choose_surface_format(&support.formats, preferred_format),
            present_mode: choose_present_mode(&support.present_modes),
            extent: choose_extent(&support.capabilities, framebuffer_size),
            image_count: choose_image_count(&support.capabilities),
            sharing_mode,
            queue_family_indices,
            pre_transform: support.capabilities.current_transform,
        }
    }

    /// A zero-sized extent (minimized window) cannot back a swapchain
    pub fn is_drawable(&self) -> bool {
        self.extent.width > 0 && self.extent.height > 0
    }
}

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub swapchain_loader: SwapchainLoader,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub framebuffers: Vec<vk::Framebuffer>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
    device: Arc<VulkanDevice>,
}

impl Swapchain {
    /// Build the swapchain, its image views and framebuffers for `render_pass`
    pub fn new(
        device: Arc<VulkanDevice>,
        surface: &Surface,
        plan: &SwapchainPlan,
        render_pass: vk::RenderPass,
    ) -> Result<Self> {
        let swapchain_loader = SwapchainLoader::new(&device.instance.instance, &device.device);

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface.handle)
            .min_image_count(plan.image_count)
            .image_format(plan.surface_format.format)
            .image_color_space(plan.surface_format.color_space)
            .image_extent(plan.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(plan.sharing_mode)
            .queue_family_indices(&plan.queue_family_indices)
            .pre_transform(plan.pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(plan.present_mode)
            .clipped(true)
            .old_swapchain(vk::SwapchainKHR::null());

        let swapchain = unsafe { swapchain_loader.create_swapchain(&create_info, None) }
            .context("Failed to create swapchain")?;

        // From here on Drop cleans up whatever has been created so far
        let mut this = Self {
            swapchain,
            swapchain_loader,
            images: Vec::new(),
            image_views: Vec::new(),
            framebuffers: Vec::new(),
            format: plan.surface_format.format,
            extent: plan.extent,
            present_mode: plan.present_mode,
            device,
        };

        this.images = unsafe { this.swapchain_loader.get_swapchain_images(swapchain) }
            .context("Failed to get swapchain images")?;

        for &image in &this.images {
            let view = this.create_image_view(image)?;
            this.image_views.push(view);
        }

        for &view in &this.image_views {
            let framebuffer = this.create_framebuffer(view, render_pass)?;
            this.framebuffers.push(framebuffer);
        }

        log::info!(
            "Created swapchain: {} images, {:?}, {:?}, {}x{}",
            this.images.len(),
            this.format,
            this.present_mode,
            this.extent.width,
            this.extent.height
        );

        Ok(this)
    }

    fn create_image_view(&self, image: vk::Image) -> Result<vk::ImageView> {
        let create_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(self.format)
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::IDENTITY,
                g: vk::ComponentSwizzle::IDENTITY,
                b: vk::ComponentSwizzle::IDENTITY,
                a: vk::ComponentSwizzle::IDENTITY,
            })
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        unsafe { self.device.device.create_image_view(&create_info, None) }
            .context("Failed to create image view")
    }

    fn create_framebuffer(&self, view: vk::ImageView, render_pass: vk::RenderPass) -> Result<vk::Framebuffer> {
        let attachments = [view];
        let framebuffer_info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass)
            .attachments(&attachments)
            .width(self.extent.width)
            .height(self.extent.height)
            .layers(1);

        unsafe { self.device.device.create_framebuffer(&framebuffer_info, None) }
            .context("Failed to create framebuffer")
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Acquire next image, signaling `semaphore` once it is usable
    pub fn acquire_next_image(&self, semaphore: vk::Semaphore) -> VkResult<(u32, bool)> {
        unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        }
    }

    /// Queue `image_index` for display after `wait_semaphores`
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> VkResult<bool> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        unsafe { self.swapchain_loader.queue_present(queue, &present_info) }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        // Framebuffers reference views, views reference swapchain images
        unsafe {
            for &framebuffer in &self.framebuffers {
                self.device.device.destroy_framebuffer(framebuffer, None);
            }
            for &view in &self.image_views {
                self.device.device.destroy_image_view(view, None);
            }
            self.swapchain_loader.destroy_swapchain(self.swapchain, None);
        }
    }
}
