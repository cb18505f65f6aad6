// =============================================================================
// FRAME SYNCHRONIZER - the steady-state acquire/record/submit/present loop
// =============================================================================
//
// FRAME TIMELINE (one iteration, slot = current_frame):
// ┌──────────────────────────────────────────────────────────────────────┐
// │ wait_fence(slot) ─> acquire ─> reset_fence ─> record ─> submit ─>    │
// │ present ─> [rebuild if stale or resized] ─> advance slot             │
// └──────────────────────────────────────────────────────────────────────┘
//
// The loop talks to the GPU only through `FrameDevice`, so the protocol can
// be exercised without a driver.

use anyhow::{Context, Result};
use ash::prelude::VkResult;
use ash::vk;

use crate::backend::sync::FrameSync;

/// Result of asking the swapchain for the next image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// Usable image; `suboptimal` images are still rendered this frame
    Acquired { image_index: u32, suboptimal: bool },
    /// Swapchain no longer matches the surface and must be rebuilt first
    OutOfDate,
}

impl AcquireOutcome {
    pub fn from_vk(result: VkResult<(u32, bool)>) -> Result<Self> {
        match result {
            Ok((image_index, suboptimal)) => Ok(Self::Acquired { image_index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Self::OutOfDate),
            Err(e) => Err(e).context("Failed to acquire swapchain image"),
        }
    }
}

/// Result of queueing an image for display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    /// Suboptimal or out of date: rebuild before the next acquire
    Stale,
}

impl PresentOutcome {
    pub fn from_vk(result: VkResult<bool>) -> Result<Self> {
        match result {
            Ok(false) => Ok(Self::Presented),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Self::Stale),
            Err(e) => Err(e).context("Failed to present swapchain image"),
        }
    }
}

/// What one call to [`FrameSynchronizer::draw_frame`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Presented {
        slot: usize,
        image_index: u32,
        /// The swapchain was rebuilt after presenting
        rebuilt: bool,
    },
    /// Acquire found the swapchain out of date; it was rebuilt instead
    Skipped,
}

/// Window state shared with the frame loop.
///
/// The windowing side writes; the frame loop reads the resize flag once per
/// present step and clears it.
#[derive(Debug, Clone, Copy)]
pub struct SurfaceSignals {
    framebuffer_resized: bool,
    framebuffer_size: vk::Extent2D,
}

impl SurfaceSignals {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            framebuffer_resized: false,
            framebuffer_size: vk::Extent2D { width, height },
        }
    }

    /// Record a resize notification and the new framebuffer size
    pub fn notify_resized(&mut self, width: u32, height: u32) {
        self.framebuffer_resized = true;
        self.framebuffer_size = vk::Extent2D { width, height };
    }

    /// Consume a pending resize notification
    pub fn take_resized(&mut self) -> bool {
        std::mem::take(&mut self.framebuffer_resized)
    }

    pub fn framebuffer_size(&self) -> vk::Extent2D {
        self.framebuffer_size
    }

    pub fn is_minimized(&self) -> bool {
        self.framebuffer_size.width == 0 || self.framebuffer_size.height == 0
    }
}

/// The device operations one frame needs.
///
/// Command buffers and framebuffers are addressed by swapchain image index;
/// sync objects come from the synchronizer's ring.
pub trait FrameDevice {
    /// Block until `fence` is signaled (no timeout)
    fn wait_for_fence(&mut self, fence: vk::Fence) -> Result<()>;

    fn reset_fence(&mut self, fence: vk::Fence) -> Result<()>;

    /// Request the next image, signaling `image_available` when it is ready
    fn acquire_next_image(&mut self, image_available: vk::Semaphore) -> Result<AcquireOutcome>;

    /// Reset and re-record the command buffer of `image_index`
    fn record_commands(&mut self, image_index: u32) -> Result<()>;

    /// Submit the command buffer of `image_index` on the graphics queue
    fn submit(&mut self, image_index: u32, sync: &FrameSync) -> Result<()>;

    /// Queue `image_index` for display once `render_finished` is signaled
    fn present(&mut self, image_index: u32, render_finished: vk::Semaphore) -> Result<PresentOutcome>;

    /// Tear down and rebuild the swapchain for the given window size
    fn rebuild_swapchain(&mut self, framebuffer_size: vk::Extent2D) -> Result<()>;

    /// Block until all submitted work has finished
    fn wait_idle(&mut self) -> Result<()>;
}

/// Fixed ring of per-frame sync records, addressed by `current_frame`
pub struct FrameSynchronizer {
    frames: Vec<FrameSync>,
    current_frame: usize,
}

impl FrameSynchronizer {
    pub fn new(frames: Vec<FrameSync>) -> Result<Self> {
        if frames.is_empty() {
            anyhow::bail!("At least one frame in flight is required");
        }
        Ok(Self {
            frames,
            current_frame: 0,
        })
    }

    /// Number of frames that may be in flight at once
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Ring position the next frame will use
    pub fn current_slot(&self) -> usize {
        self.current_frame
    }

    pub fn frames(&self) -> &[FrameSync] {
        &self.frames
    }

    /// Run one iteration of the frame loop
    pub fn draw_frame<D: FrameDevice>(
        &mut self,
        device: &mut D,
        signals: &mut SurfaceSignals,
    ) -> Result<FrameStatus> {
        let slot = self.current_slot();
        let sync = self.frames[slot];

        // The previous submission tagged with this slot must be done before
        // its semaphores and fence are reused
        device.wait_for_fence(sync.in_flight_fence)?;

        let image_index = match device.acquire_next_image(sync.image_available)? {
            AcquireOutcome::Acquired { image_index, suboptimal } => {
                if suboptimal {
                    log::trace!("Acquired suboptimal image {}", image_index);
                }
                image_index
            }
            AcquireOutcome::OutOfDate => {
                log::debug!("Swapchain out of date on acquire, rebuilding");
                device.rebuild_swapchain(signals.framebuffer_size())?;
                return Ok(FrameStatus::Skipped);
            }
        };

        // Only reset once work is certain to be submitted, or the next wait
        // on this slot would never return
        device.reset_fence(sync.in_flight_fence)?;

        device.record_commands(image_index)?;
        device.submit(image_index, &sync)?;

        let outcome = device.present(image_index, sync.render_finished)?;
        let resized = signals.take_resized();

        let rebuilt = outcome == PresentOutcome::Stale || resized;
        if rebuilt {
            log::debug!("Rebuilding swapchain (present: {:?}, resized: {})", outcome, resized);
            device.rebuild_swapchain(signals.framebuffer_size())?;
        }

        self.current_frame = (self.current_frame + 1) % self.frames.len();

        Ok(FrameStatus::Presented {
            slot,
            image_index,
            rebuilt,
        })
    }

    /// Wait until the device has finished everything submitted so far
    pub fn drain<D: FrameDevice>(&self, device: &mut D) -> Result<()> {
        device.wait_idle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::command::BufferResize;
    use ash::vk::Handle;
    use std::collections::{HashMap, VecDeque};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum FenceState {
        Signaled,
        Unsignaled,
        Pending,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        WaitFence { slot: usize, blocked: bool },
        Acquire,
        ResetFence { slot: usize },
        Record { image: u32 },
        Submit { image: u32, slot: usize },
        Present { image: u32 },
        Rebuild { width: u32, height: u32 },
        WaitIdle,
    }

    /// In-memory device: GPU work completes when the CPU waits on its fence
    struct ScriptedDevice {
        fences: HashMap<vk::Fence, FenceState>,
        slot_of: HashMap<vk::Fence, usize>,
        image_count: u32,
        /// Image counts handed out by successive rebuilds
        rebuild_image_counts: VecDeque<u32>,
        command_buffers: usize,
        reallocations: usize,
        next_image: u32,
        generation: u32,
        recorded: HashMap<u32, u32>,
        acquire_script: VecDeque<AcquireOutcome>,
        present_script: VecDeque<PresentOutcome>,
        acquire_error: Option<vk::Result>,
        max_pending: usize,
        calls: Vec<Call>,
    }

    impl ScriptedDevice {
        fn new(frames: &[FrameSync], image_count: u32) -> Self {
            Self {
                fences: frames
                    .iter()
                    .map(|f| (f.in_flight_fence, FenceState::Signaled))
                    .collect(),
                slot_of: frames
                    .iter()
                    .enumerate()
                    .map(|(i, f)| (f.in_flight_fence, i))
                    .collect(),
                image_count,
                rebuild_image_counts: VecDeque::new(),
                command_buffers: image_count as usize,
                reallocations: 0,
                next_image: 0,
                generation: 0,
                recorded: HashMap::new(),
                acquire_script: VecDeque::new(),
                present_script: VecDeque::new(),
                acquire_error: None,
                max_pending: 0,
                calls: Vec::new(),
            }
        }

        fn pending(&self) -> usize {
            self.fences.values().filter(|&&s| s == FenceState::Pending).count()
        }

        fn position(&self, call: &Call) -> Option<usize> {
            self.calls.iter().position(|c| c == call)
        }
    }

    impl FrameDevice for ScriptedDevice {
        fn wait_for_fence(&mut self, fence: vk::Fence) -> Result<()> {
            let slot = self.slot_of[&fence];
            let state = self.fences[&fence];
            let blocked = match state {
                FenceState::Signaled => false,
                FenceState::Pending => true,
                FenceState::Unsignaled => anyhow::bail!("fence of slot {} can never signal", slot),
            };
            self.fences.insert(fence, FenceState::Signaled);
            self.calls.push(Call::WaitFence { slot, blocked });
            Ok(())
        }

        fn reset_fence(&mut self, fence: vk::Fence) -> Result<()> {
            let slot = self.slot_of[&fence];
            if self.fences[&fence] == FenceState::Pending {
                anyhow::bail!("reset of fence {} while its work is pending", slot);
            }
            self.fences.insert(fence, FenceState::Unsignaled);
            self.calls.push(Call::ResetFence { slot });
            Ok(())
        }

        fn acquire_next_image(&mut self, _image_available: vk::Semaphore) -> Result<AcquireOutcome> {
            self.calls.push(Call::Acquire);
            if let Some(e) = self.acquire_error.take() {
                return AcquireOutcome::from_vk(Err(e));
            }
            if let Some(outcome) = self.acquire_script.pop_front() {
                return Ok(outcome);
            }
            let image_index = self.next_image;
            self.next_image = (self.next_image + 1) % self.image_count;
            Ok(AcquireOutcome::Acquired { image_index, suboptimal: false })
        }

        fn record_commands(&mut self, image_index: u32) -> Result<()> {
            if image_index as usize >= self.command_buffers {
                anyhow::bail!("no command buffer for image {}", image_index);
            }
            self.recorded.insert(image_index, self.generation);
            self.calls.push(Call::Record { image: image_index });
            Ok(())
        }

        fn submit(&mut self, image_index: u32, sync: &FrameSync) -> Result<()> {
            let slot = self.slot_of[&sync.in_flight_fence];
            if image_index >= self.image_count {
                anyhow::bail!("image {} does not exist in the current swapchain", image_index);
            }
            if self.recorded.get(&image_index) != Some(&self.generation) {
                anyhow::bail!("image {} was recorded against a destroyed swapchain", image_index);
            }
            if self.fences[&sync.in_flight_fence] != FenceState::Unsignaled {
                anyhow::bail!("submit with a fence that was not reset");
            }
            self.fences.insert(sync.in_flight_fence, FenceState::Pending);
            self.max_pending = self.max_pending.max(self.pending());
            self.calls.push(Call::Submit { image: image_index, slot });
            Ok(())
        }

        fn present(&mut self, image_index: u32, _render_finished: vk::Semaphore) -> Result<PresentOutcome> {
            self.calls.push(Call::Present { image: image_index });
            Ok(self.present_script.pop_front().unwrap_or(PresentOutcome::Presented))
        }

        fn rebuild_swapchain(&mut self, framebuffer_size: vk::Extent2D) -> Result<()> {
            // Rebuild drains the device first
            for state in self.fences.values_mut() {
                if *state == FenceState::Pending {
                    *state = FenceState::Signaled;
                }
            }
            self.generation += 1;
            self.recorded.clear();
            self.next_image = 0;
            if let Some(count) = self.rebuild_image_counts.pop_front() {
                self.image_count = count;
            }
            match BufferResize::plan(self.command_buffers, self.image_count as usize) {
                BufferResize::Keep => {}
                BufferResize::Allocate(n) => self.command_buffers = n,
                BufferResize::Reallocate(n) => {
                    self.command_buffers = n;
                    self.reallocations += 1;
                }
            }
            self.calls.push(Call::Rebuild {
                width: framebuffer_size.width,
                height: framebuffer_size.height,
            });
            Ok(())
        }

        fn wait_idle(&mut self) -> Result<()> {
            for state in self.fences.values_mut() {
                if *state == FenceState::Pending {
                    *state = FenceState::Signaled;
                }
            }
            self.calls.push(Call::WaitIdle);
            Ok(())
        }
    }

    fn ring(depth: usize) -> Vec<FrameSync> {
        (0..depth as u64)
            .map(|i| FrameSync {
                image_available: vk::Semaphore::from_raw(100 + i),
                render_finished: vk::Semaphore::from_raw(200 + i),
                in_flight_fence: vk::Fence::from_raw(300 + i),
            })
            .collect()
    }

    fn setup(depth: usize, image_count: u32) -> (FrameSynchronizer, ScriptedDevice, SurfaceSignals) {
        let frames = ring(depth);
        let device = ScriptedDevice::new(&frames, image_count);
        let sync = FrameSynchronizer::new(frames).unwrap();
        (sync, device, SurfaceSignals::new(800, 600))
    }

    #[test]
    fn test_five_frames_cycle_slots() {
        let (mut sync, mut device, mut signals) = setup(2, 3);

        let mut slots = Vec::new();
        for _ in 0..5 {
            match sync.draw_frame(&mut device, &mut signals).unwrap() {
                FrameStatus::Presented { slot, rebuilt, .. } => {
                    assert!(!rebuilt);
                    slots.push(slot);
                }
                FrameStatus::Skipped => panic!("no frame should be skipped"),
            }
        }
        assert_eq!(slots, vec![0, 1, 0, 1, 0]);

        let waits: Vec<(usize, bool)> = device
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::WaitFence { slot, blocked } => Some((*slot, *blocked)),
                _ => None,
            })
            .collect();
        // Fences start signaled, so only reuse of a slot blocks
        assert_eq!(waits, vec![(0, false), (1, false), (0, true), (1, true), (0, true)]);
    }

    #[test]
    fn test_in_flight_frames_bounded_by_depth() {
        for depth in 1..=3 {
            let (mut sync, mut device, mut signals) = setup(depth, 4);
            for _ in 0..10 {
                sync.draw_frame(&mut device, &mut signals).unwrap();
            }
            assert!(device.max_pending <= depth);
            assert_eq!(device.max_pending, depth);
        }
    }

    #[test]
    fn test_step_order_within_frame() {
        let (mut sync, mut device, mut signals) = setup(2, 3);
        sync.draw_frame(&mut device, &mut signals).unwrap();

        assert_eq!(
            device.calls,
            vec![
                Call::WaitFence { slot: 0, blocked: false },
                Call::Acquire,
                Call::ResetFence { slot: 0 },
                Call::Record { image: 0 },
                Call::Submit { image: 0, slot: 0 },
                Call::Present { image: 0 },
            ]
        );
    }

    #[test]
    fn test_command_buffers_follow_image_index() {
        let (mut sync, mut device, mut signals) = setup(2, 3);
        for _ in 0..4 {
            sync.draw_frame(&mut device, &mut signals).unwrap();
        }

        let submits: Vec<(u32, usize)> = device
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Submit { image, slot } => Some((*image, *slot)),
                _ => None,
            })
            .collect();
        assert_eq!(submits, vec![(0, 0), (1, 1), (2, 0), (0, 1)]);
    }

    #[test]
    fn test_suboptimal_present_rebuilds_before_next_acquire() {
        let (mut sync, mut device, mut signals) = setup(2, 3);
        device.present_script.extend([
            PresentOutcome::Presented,
            PresentOutcome::Presented,
            PresentOutcome::Stale,
        ]);

        let statuses: Vec<FrameStatus> = (0..4)
            .map(|_| sync.draw_frame(&mut device, &mut signals).unwrap())
            .collect();

        assert!(matches!(statuses[2], FrameStatus::Presented { slot: 0, rebuilt: true, .. }));
        assert!(matches!(statuses[3], FrameStatus::Presented { slot: 1, rebuilt: false, .. }));

        let rebuild = device.position(&Call::Rebuild { width: 800, height: 600 }).unwrap();
        let third_present = device
            .calls
            .iter()
            .enumerate()
            .filter(|(_, c)| matches!(c, Call::Present { .. }))
            .nth(2)
            .map(|(i, _)| i)
            .unwrap();
        let fourth_acquire = device
            .calls
            .iter()
            .enumerate()
            .filter(|(_, c)| matches!(c, Call::Acquire))
            .nth(3)
            .map(|(i, _)| i)
            .unwrap();
        assert!(third_present < rebuild && rebuild < fourth_acquire);

        // Frame 4 records against the rebuilt swapchain
        assert_eq!(device.recorded.get(&0), Some(&1));
    }

    #[test]
    fn test_rebuild_with_fewer_images_uses_only_new_indices() {
        let (mut sync, mut device, mut signals) = setup(2, 3);
        device.present_script.extend([PresentOutcome::Presented, PresentOutcome::Stale]);
        device.rebuild_image_counts.push_back(2);

        let statuses: Vec<FrameStatus> = (0..6)
            .map(|_| sync.draw_frame(&mut device, &mut signals).unwrap())
            .collect();
        assert!(matches!(statuses[1], FrameStatus::Presented { rebuilt: true, .. }));

        assert_eq!(device.command_buffers, 2);
        assert_eq!(device.reallocations, 1);

        let rebuild = device.position(&Call::Rebuild { width: 800, height: 600 }).unwrap();
        let images_after: Vec<u32> = device.calls[rebuild..]
            .iter()
            .filter_map(|c| match c {
                Call::Record { image } | Call::Submit { image, .. } => Some(*image),
                _ => None,
            })
            .collect();
        assert_eq!(images_after.len(), 8);
        assert!(images_after.iter().all(|&image| image < 2));
    }

    #[test]
    fn test_rebuild_with_same_image_count_keeps_buffers() {
        let (mut sync, mut device, mut signals) = setup(2, 3);
        signals.notify_resized(640, 480);

        for _ in 0..3 {
            sync.draw_frame(&mut device, &mut signals).unwrap();
        }
        assert_eq!(device.generation, 1);
        assert_eq!(device.command_buffers, 3);
        assert_eq!(device.reallocations, 0);
    }

    #[test]
    fn test_out_of_date_acquire_skips_without_advancing() {
        let (mut sync, mut device, mut signals) = setup(2, 3);
        device.acquire_script.push_back(AcquireOutcome::OutOfDate);

        let status = sync.draw_frame(&mut device, &mut signals).unwrap();
        assert_eq!(status, FrameStatus::Skipped);
        assert_eq!(sync.current_slot(), 0);
        assert!(device.position(&Call::ResetFence { slot: 0 }).is_none());
        assert!(device.position(&Call::Rebuild { width: 800, height: 600 }).is_some());

        // The slot's fence stayed signaled, so retrying cannot deadlock
        let status = sync.draw_frame(&mut device, &mut signals).unwrap();
        assert!(matches!(status, FrameStatus::Presented { slot: 0, image_index: 0, rebuilt: false }));
    }

    #[test]
    fn test_suboptimal_acquire_still_renders() {
        let (mut sync, mut device, mut signals) = setup(2, 3);
        device.acquire_script.push_back(AcquireOutcome::Acquired { image_index: 2, suboptimal: true });

        let status = sync.draw_frame(&mut device, &mut signals).unwrap();
        assert_eq!(status, FrameStatus::Presented { slot: 0, image_index: 2, rebuilt: false });
        assert!(device.position(&Call::Submit { image: 2, slot: 0 }).is_some());
    }

    #[test]
    fn test_resize_notification_consumed_once() {
        let (mut sync, mut device, mut signals) = setup(2, 3);
        signals.notify_resized(1024, 768);

        let first = sync.draw_frame(&mut device, &mut signals).unwrap();
        let second = sync.draw_frame(&mut device, &mut signals).unwrap();

        assert!(matches!(first, FrameStatus::Presented { rebuilt: true, .. }));
        assert!(matches!(second, FrameStatus::Presented { rebuilt: false, .. }));
        assert!(device.position(&Call::Rebuild { width: 1024, height: 768 }).is_some());
        assert!(!signals.take_resized());
    }

    #[test]
    fn test_fatal_acquire_error_propagates() {
        let (mut sync, mut device, mut signals) = setup(2, 3);
        device.acquire_error = Some(vk::Result::ERROR_DEVICE_LOST);

        let err = sync.draw_frame(&mut device, &mut signals).unwrap_err();
        assert!(err.to_string().contains("acquire"));
        assert_eq!(sync.current_slot(), 0);
    }

    #[test]
    fn test_drain_waits_for_device() {
        let (mut sync, mut device, mut signals) = setup(2, 3);
        sync.draw_frame(&mut device, &mut signals).unwrap();
        sync.drain(&mut device).unwrap();

        assert_eq!(device.calls.last(), Some(&Call::WaitIdle));
        assert_eq!(device.pending(), 0);
    }

    #[test]
    fn test_empty_ring_rejected() {
        assert!(FrameSynchronizer::new(Vec::new()).is_err());
        let (sync, _, _) = setup(2, 3);
        assert_eq!(sync.depth(), 2);
        assert_eq!(sync.frames().len(), 2);
    }

    #[test]
    fn test_acquire_classification() {
        assert_eq!(
            AcquireOutcome::from_vk(Ok((1, false))).unwrap(),
            AcquireOutcome::Acquired { image_index: 1, suboptimal: false }
        );
        assert_eq!(
            AcquireOutcome::from_vk(Ok((2, true))).unwrap(),
            AcquireOutcome::Acquired { image_index: 2, suboptimal: true }
        );
        assert_eq!(
            AcquireOutcome::from_vk(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)).unwrap(),
            AcquireOutcome::OutOfDate
        );
        assert!(AcquireOutcome::from_vk(Err(vk::Result::ERROR_SURFACE_LOST_KHR)).is_err());
    }

    #[test]
    fn test_present_classification() {
        assert_eq!(PresentOutcome::from_vk(Ok(false)).unwrap(), PresentOutcome::Presented);
        assert_eq!(PresentOutcome::from_vk(Ok(true)).unwrap(), PresentOutcome::Stale);
        assert_eq!(
            PresentOutcome::from_vk(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)).unwrap(),
            PresentOutcome::Stale
        );
        assert!(PresentOutcome::from_vk(Err(vk::Result::ERROR_DEVICE_LOST)).is_err());
    }

    #[test]
    fn test_surface_signals() {
        let mut signals = SurfaceSignals::new(800, 600);
        assert!(!signals.is_minimized());
        assert!(!signals.take_resized());

        signals.notify_resized(0, 600);
        assert!(signals.is_minimized());
        assert!(signals.take_resized());
        assert!(!signals.take_resized());
    }
}
