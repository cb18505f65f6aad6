// Command recording
//
// One command pool on the graphics family, one primary command buffer per
// swapchain image. Buffers are reset and re-recorded every frame, so a
// rebuild never leaves a buffer pointing at a destroyed framebuffer.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::VulkanDevice;

/// Everything one frame's draw depends on
#[derive(Debug, Clone, Copy)]
pub struct DrawPass {
    pub render_pass: vk::RenderPass,
    pub pipeline: vk::Pipeline,
    pub framebuffer: vk::Framebuffer,
    pub extent: vk::Extent2D,
    pub clear_color: [f32; 4],
    pub vertex_count: u32,
}

/// Commands recorded between begin and end of a command buffer
#[derive(Debug, Clone, Copy)]
pub enum DrawCommand {
    BeginRenderPass {
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        render_area: vk::Rect2D,
        clear_color: [f32; 4],
    },
    BindPipeline(vk::Pipeline),
    SetViewport(vk::Viewport),
    SetScissor(vk::Rect2D),
    Draw {
        vertex_count: u32,
        instance_count: u32,
    },
    EndRenderPass,
}

impl DrawPass {
    /// The fixed per-frame sequence.
    ///
    /// Viewport and scissor are dynamic state, so a resize only changes
    /// `extent` here and never requires a new pipeline.
    pub fn commands(&self) -> [DrawCommand; 6] {
        let full_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: self.extent,
        };

        [
            DrawCommand::BeginRenderPass {
                render_pass: self.render_pass,
                framebuffer: self.framebuffer,
                render_area: full_area,
                clear_color: self.clear_color,
            },
            DrawCommand::BindPipeline(self.pipeline),
            DrawCommand::SetViewport(vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: self.extent.width as f32,
                height: self.extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            }),
            DrawCommand::SetScissor(full_area),
            DrawCommand::Draw {
                vertex_count: self.vertex_count,
                instance_count: 1,
            },
            DrawCommand::EndRenderPass,
        ]
    }
}

/// Encode one command into `cmd`
///
/// # Safety
/// `cmd` must be in the recording state.
unsafe fn encode(device: &ash::Device, cmd: vk::CommandBuffer, command: &DrawCommand) {
    match *command {
        DrawCommand::BeginRenderPass {
            render_pass,
            framebuffer,
            render_area,
            clear_color,
        } => {
            let clear_values = [vk::ClearValue {
                color: vk::ClearColorValue { float32: clear_color },
            }];
            let begin_info = vk::RenderPassBeginInfo::builder()
                .render_pass(render_pass)
                .framebuffer(framebuffer)
                .render_area(render_area)
                .clear_values(&clear_values);
            device.cmd_begin_render_pass(cmd, &begin_info, vk::SubpassContents::INLINE);
        }
        DrawCommand::BindPipeline(pipeline) => {
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline);
        }
        DrawCommand::SetViewport(viewport) => {
            device.cmd_set_viewport(cmd, 0, &[viewport]);
        }
        DrawCommand::SetScissor(scissor) => {
            device.cmd_set_scissor(cmd, 0, &[scissor]);
        }
        DrawCommand::Draw {
            vertex_count,
            instance_count,
        } => {
            device.cmd_draw(cmd, vertex_count, instance_count, 0, 0);
        }
        DrawCommand::EndRenderPass => {
            device.cmd_end_render_pass(cmd);
        }
    }
}

/// Record `pass` into `cmd` from scratch
pub fn record_draw(device: &ash::Device, cmd: vk::CommandBuffer, pass: &DrawPass) -> Result<()> {
    let begin_info = vk::CommandBufferBeginInfo::builder()
        .flags(vk::CommandBufferUsageFlags::SIMULTANEOUS_USE);

    unsafe {
        device
            .begin_command_buffer(cmd, &begin_info)
            .context("Failed to begin recording command buffer")?;

        for command in &pass.commands() {
            encode(device, cmd, command);
        }

        device
            .end_command_buffer(cmd)
            .context("Failed to record command buffer")?;
    }

    Ok(())
}

/// What a command buffer set must do to match a new swapchain image count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferResize {
    /// Count already matches
    Keep,
    /// Nothing allocated yet
    Allocate(usize),
    /// Free the existing buffers, then allocate this many
    Reallocate(usize),
}

impl BufferResize {
    pub fn plan(current: usize, wanted: usize) -> Self {
        if current == wanted {
            Self::Keep
        } else if current == 0 {
            Self::Allocate(wanted)
        } else {
            Self::Reallocate(wanted)
        }
    }
}

/// Command pool plus one buffer per swapchain image
pub struct CommandRecorder {
    pool: vk::CommandPool,
    buffers: Vec<vk::CommandBuffer>,
    device: Arc<VulkanDevice>,
}

impl CommandRecorder {
    pub fn new(device: Arc<VulkanDevice>) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.queue_families.graphics)
            // RESET: buffers are reset individually each frame
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;

        Ok(Self {
            pool,
            buffers: Vec::new(),
            device,
        })
    }

    /// Make sure there is exactly one buffer per swapchain image.
    ///
    /// Must only be called while no buffer is pending execution.
    pub fn ensure_count(&mut self, count: usize) -> Result<()> {
        match BufferResize::plan(self.buffers.len(), count) {
            BufferResize::Keep => return Ok(()),
            BufferResize::Allocate(_) => {}
            BufferResize::Reallocate(_) => {
                unsafe {
                    self.device.device.free_command_buffers(self.pool, &self.buffers);
                }
                self.buffers.clear();
            }
        }

        if count == 0 {
            return Ok(());
        }

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count as u32);

        self.buffers = unsafe { self.device.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate command buffers")?;

        log::debug!("Allocated {} command buffers", count);
        Ok(())
    }

    pub fn buffer(&self, image_index: u32) -> Result<vk::CommandBuffer> {
        self.buffers
            .get(image_index as usize)
            .copied()
            .with_context(|| format!("No command buffer for swapchain image {}", image_index))
    }

    /// Reset and re-record the buffer that belongs to `image_index`
    pub fn record(&self, image_index: u32, pass: &DrawPass) -> Result<()> {
        let cmd = self.buffer(image_index)?;

        unsafe {
            self.device
                .device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .context("Failed to reset command buffer")?;
        }

        record_draw(&self.device.device, cmd, pass)
    }
}

impl Drop for CommandRecorder {
    fn drop(&mut self) {
        // Also frees the command buffers
        unsafe {
            self.device.device.destroy_command_pool(self.pool, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn pass(width: u32, height: u32) -> DrawPass {
        DrawPass {
            render_pass: vk::RenderPass::from_raw(1),
            pipeline: vk::Pipeline::from_raw(2),
            framebuffer: vk::Framebuffer::from_raw(3),
            extent: vk::Extent2D { width, height },
            clear_color: [0.1, 0.2, 0.3, 1.0],
            vertex_count: 3,
        }
    }

    #[test]
    fn test_command_order() {
        let commands = pass(800, 600).commands();

        assert!(matches!(commands[0], DrawCommand::BeginRenderPass { .. }));
        assert!(matches!(commands[1], DrawCommand::BindPipeline(_)));
        assert!(matches!(commands[2], DrawCommand::SetViewport(_)));
        assert!(matches!(commands[3], DrawCommand::SetScissor(_)));
        assert!(matches!(
            commands[4],
            DrawCommand::Draw { vertex_count: 3, instance_count: 1 }
        ));
        assert!(matches!(commands[5], DrawCommand::EndRenderPass));
    }

    #[test]
    fn test_render_area_covers_extent() {
        let commands = pass(1024, 768).commands();

        let DrawCommand::BeginRenderPass { framebuffer, render_area, clear_color, .. } = commands[0] else {
            panic!("first command must begin the render pass");
        };
        assert_eq!(framebuffer, vk::Framebuffer::from_raw(3));
        assert_eq!((render_area.offset.x, render_area.offset.y), (0, 0));
        assert_eq!((render_area.extent.width, render_area.extent.height), (1024, 768));
        assert_eq!(clear_color, [0.1, 0.2, 0.3, 1.0]);
    }

    #[test]
    fn test_buffer_resize_plan() {
        assert_eq!(BufferResize::plan(0, 3), BufferResize::Allocate(3));
        assert_eq!(BufferResize::plan(3, 3), BufferResize::Keep);
        // Image count shrank after a rebuild
        assert_eq!(BufferResize::plan(3, 2), BufferResize::Reallocate(2));
        assert_eq!(BufferResize::plan(2, 4), BufferResize::Reallocate(4));
        assert_eq!(BufferResize::plan(0, 0), BufferResize::Keep);
    }

    #[test]
    fn test_viewport_and_scissor_follow_extent() {
        let commands = pass(640, 360).commands();

        let DrawCommand::SetViewport(viewport) = commands[2] else {
            panic!("expected viewport");
        };
        assert_eq!((viewport.width, viewport.height), (640.0, 360.0));
        assert_eq!((viewport.min_depth, viewport.max_depth), (0.0, 1.0));

        let DrawCommand::SetScissor(scissor) = commands[3] else {
            panic!("expected scissor");
        };
        assert_eq!((scissor.extent.width, scissor.extent.height), (640, 360));
    }
}
