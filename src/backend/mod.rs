// Backend module - Vulkan abstraction layer
//
// Design: Thin wrapper around ash with RAII ownership
// Destruction order is fixed by Arc ownership: swapchain -> surface/device -> instance

pub mod command;
pub mod device;
pub mod instance;
pub mod pipeline;
pub mod probe;
pub mod shader;
pub mod swapchain;
pub mod sync;

pub use device::VulkanDevice;
pub use instance::{Surface, VulkanInstance};
pub use swapchain::Swapchain;
