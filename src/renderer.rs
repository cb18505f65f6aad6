// =============================================================================
// RENDERER - owns every Vulkan object and drives the frame loop
// =============================================================================
//
// OWNERSHIP (drop order runs top to bottom):
// ┌──────────────────────────────────────────────────────────────────┐
// │ Renderer                                                         │
// │   frames     FrameSync ring (destroyed explicitly in Drop)       │
// │   presenter  command pool -> swapchain -> pipeline -> surface    │
// │              -> device (Arc) -> instance (Arc)                   │
// └──────────────────────────────────────────────────────────────────┘

use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::HasRawDisplayHandle;
use std::sync::Arc;
use winit::window::Window;

use crate::backend::command::{CommandRecorder, DrawPass};
use crate::backend::pipeline::GraphicsPipeline;
use crate::backend::probe::{self, SurfaceSupport};
use crate::backend::shader::ShaderSet;
use crate::backend::swapchain::SwapchainPlan;
use crate::backend::sync::{self, FrameSync};
use crate::backend::{Surface, Swapchain, VulkanDevice, VulkanInstance};
use crate::config::Config;
use crate::frame::{AcquireOutcome, FrameDevice, FrameStatus, FrameSynchronizer, PresentOutcome, SurfaceSignals};

/// Everything tied to the surface: swapchain, pipeline and command buffers.
///
/// Field order is drop order.
pub struct Presenter {
    commands: CommandRecorder,
    /// `None` while the window has a zero-sized framebuffer
    swapchain: Option<Swapchain>,
    pipeline: GraphicsPipeline,
    surface: Surface,
    device: Arc<VulkanDevice>,

    shaders: ShaderSet,
    preferred_format: vk::SurfaceFormatKHR,
    clear_color: [f32; 4],
    vertex_count: u32,
    /// Pre-allocated to avoid a per-frame array
    wait_stages: [vk::PipelineStageFlags; 1],
}

impl Presenter {
    fn new(
        device: Arc<VulkanDevice>,
        surface: Surface,
        config: &Config,
        framebuffer_size: vk::Extent2D,
    ) -> Result<Self> {
        let shaders = ShaderSet::load(&config.shaders)?;
        let preferred_format = config.surface_format();

        // The pipeline is built for the format the surface will actually give us
        let support = SurfaceSupport::query(device.physical_device, &surface)?;
        let plan = SwapchainPlan::new(&support, &device.queue_families, framebuffer_size, preferred_format);

        let pipeline = GraphicsPipeline::new(Arc::clone(&device), plan.surface_format.format, &shaders)?;
        let commands = CommandRecorder::new(Arc::clone(&device))?;

        let mut presenter = Self {
            commands,
            swapchain: None,
            pipeline,
            surface,
            device,
            shaders,
            preferred_format,
            clear_color: config.graphics.clear_color,
            vertex_count: config.graphics.vertex_count,
            wait_stages: [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
        };
        presenter.build_swapchain(plan)?;

        Ok(presenter)
    }

    fn build_swapchain(&mut self, plan: SwapchainPlan) -> Result<()> {
        if !plan.is_drawable() {
            log::info!("Framebuffer is zero-sized, deferring swapchain creation");
            return Ok(());
        }

        if plan.surface_format.format != self.pipeline.format {
            log::info!(
                "Surface format changed {:?} -> {:?}, recreating pipeline",
                self.pipeline.format,
                plan.surface_format.format
            );
            self.pipeline = GraphicsPipeline::new(
                Arc::clone(&self.device),
                plan.surface_format.format,
                &self.shaders,
            )?;
        }

        let swapchain = Swapchain::new(
            Arc::clone(&self.device),
            &self.surface,
            &plan,
            self.pipeline.render_pass,
        )?;
        self.commands.ensure_count(swapchain.image_count())?;
        self.swapchain = Some(swapchain);

        Ok(())
    }

    fn swapchain(&self) -> Result<&Swapchain> {
        self.swapchain.as_ref().context("Swapchain not initialized")
    }
}

impl FrameDevice for Presenter {
    fn wait_for_fence(&mut self, fence: vk::Fence) -> Result<()> {
        unsafe { self.device.device.wait_for_fences(&[fence], true, u64::MAX) }
            .context("Failed to wait for in-flight fence")
    }

    fn reset_fence(&mut self, fence: vk::Fence) -> Result<()> {
        unsafe { self.device.device.reset_fences(&[fence]) }
            .context("Failed to reset in-flight fence")
    }

    fn acquire_next_image(&mut self, image_available: vk::Semaphore) -> Result<AcquireOutcome> {
        match self.swapchain {
            Some(ref swapchain) => AcquireOutcome::from_vk(swapchain.acquire_next_image(image_available)),
            // Still minimized: keep asking for a rebuild
            None => Ok(AcquireOutcome::OutOfDate),
        }
    }

    fn record_commands(&mut self, image_index: u32) -> Result<()> {
        let swapchain = self.swapchain()?;
        let framebuffer = *swapchain
            .framebuffers
            .get(image_index as usize)
            .with_context(|| format!("No framebuffer for swapchain image {}", image_index))?;

        let pass = DrawPass {
            render_pass: self.pipeline.render_pass,
            pipeline: self.pipeline.pipeline,
            framebuffer,
            extent: swapchain.extent,
            clear_color: self.clear_color,
            vertex_count: self.vertex_count,
        };

        self.commands.record(image_index, &pass)
    }

    fn submit(&mut self, image_index: u32, sync: &FrameSync) -> Result<()> {
        let cmd = self.commands.buffer(image_index)?;

        let wait_semaphores = [sync.image_available];
        let signal_semaphores = [sync.render_finished];
        let command_buffers = [cmd];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&self.wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device.device.queue_submit(
                self.device.graphics_queue,
                &[submit_info.build()],
                sync.in_flight_fence,
            )
        }
        .context("Failed to submit draw command buffer")
    }

    fn present(&mut self, image_index: u32, render_finished: vk::Semaphore) -> Result<PresentOutcome> {
        let swapchain = self.swapchain()?;
        PresentOutcome::from_vk(swapchain.present(
            self.device.present_queue,
            image_index,
            &[render_finished],
        ))
    }

    fn rebuild_swapchain(&mut self, framebuffer_size: vk::Extent2D) -> Result<()> {
        // Nothing may still reference the old framebuffers or command buffers
        self.device.wait_idle()?;
        self.swapchain = None;

        let support = SurfaceSupport::query(self.device.physical_device, &self.surface)?;
        let plan = SwapchainPlan::new(
            &support,
            &self.device.queue_families,
            framebuffer_size,
            self.preferred_format,
        );
        self.build_swapchain(plan)
    }

    fn wait_idle(&mut self) -> Result<()> {
        self.device.wait_idle()
    }
}

/// The presentation core for one window
pub struct Renderer {
    frames: FrameSynchronizer,
    presenter: Presenter,
}

impl Renderer {
    /// Bring up instance, surface, device, swapchain and sync objects for `window`
    pub fn new(window: &Window, config: &Config) -> Result<Self> {
        log::info!("Initializing Vulkan...");

        let enable_validation = cfg!(debug_assertions) && config.debug.validation_layers;
        let instance = VulkanInstance::new(
            &config.window.title,
            window.raw_display_handle(),
            enable_validation,
        )?;

        let surface = instance.create_surface(window)?;
        let (physical_device, queue_families) = probe::pick_physical_device(&instance, &surface)?;
        let device = VulkanDevice::new(instance, physical_device, queue_families)?;

        let size = window.inner_size();
        let framebuffer_size = vk::Extent2D {
            width: size.width,
            height: size.height,
        };
        let presenter = Presenter::new(Arc::clone(&device), surface, config, framebuffer_size)?;

        // Sync objects survive swapchain rebuilds
        let ring = sync::create_frame_ring(&device.device, config.graphics.max_frames_in_flight)?;
        let frames = FrameSynchronizer::new(ring)?;

        log::info!(
            "Vulkan initialized successfully ({} frames in flight)",
            frames.depth()
        );
        Ok(Self { frames, presenter })
    }

    pub fn draw_frame(&mut self, signals: &mut SurfaceSignals) -> Result<FrameStatus> {
        self.frames.draw_frame(&mut self.presenter, signals)
    }

    /// Block until the GPU has finished all submitted frames
    pub fn wait_idle(&mut self) -> Result<()> {
        self.frames.drain(&mut self.presenter)
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");

        if let Err(e) = self.wait_idle() {
            log::error!("Failed to drain device before cleanup: {:#}", e);
        }

        for sync in self.frames.frames() {
            sync.destroy(&self.presenter.device.device);
        }

        // Presenter fields drop next, command pool first
    }
}
