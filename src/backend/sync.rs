// Synchronization primitives
//
// Fences, semaphores for GPU-CPU and GPU-GPU sync.
// One record per frame in flight; these live for the whole run and are
// not touched by swapchain rebuilds.

use anyhow::{Context, Result};
use ash::vk;

/// Frame synchronization - one per frame in flight
#[derive(Debug, Clone, Copy)]
pub struct FrameSync {
    /// Signaled by acquire, waited on by submit
    pub image_available: vk::Semaphore,
    /// Signaled by submit, waited on by present
    pub render_finished: vk::Semaphore,
    /// Signaled when the slot's submission completes
    pub in_flight_fence: vk::Fence,
}

impl FrameSync {
    pub fn new(device: &ash::Device) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        // Start signaled so the very first wait on each slot returns at once
        let fence_info = vk::FenceCreateInfo::builder()
            .flags(vk::FenceCreateFlags::SIGNALED);

        unsafe {
            let image_available = device
                .create_semaphore(&semaphore_info, None)
                .context("Failed to create image-available semaphore")?;
            let render_finished = match device.create_semaphore(&semaphore_info, None) {
                Ok(semaphore) => semaphore,
                Err(e) => {
                    device.destroy_semaphore(image_available, None);
                    return Err(e).context("Failed to create render-finished semaphore");
                }
            };
            let in_flight_fence = match device.create_fence(&fence_info, None) {
                Ok(fence) => fence,
                Err(e) => {
                    device.destroy_semaphore(image_available, None);
                    device.destroy_semaphore(render_finished, None);
                    return Err(e).context("Failed to create in-flight fence");
                }
            };

            Ok(Self {
                image_available,
                render_finished,
                in_flight_fence,
            })
        }
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.image_available, None);
            device.destroy_semaphore(self.render_finished, None);
            device.destroy_fence(self.in_flight_fence, None);
        }
    }
}

/// Create `depth` sync records, releasing any already created on failure
pub fn create_frame_ring(device: &ash::Device, depth: usize) -> Result<Vec<FrameSync>> {
    let mut frames = Vec::with_capacity(depth);

    for _ in 0..depth {
        match FrameSync::new(device) {
            Ok(sync) => frames.push(sync),
            Err(e) => {
                for sync in &frames {
                    sync.destroy(device);
                }
                return Err(e.context("Failed to create synchronization objects for a frame"));
            }
        }
    }

    Ok(frames)
}
