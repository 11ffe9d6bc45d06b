// Per-frame acquire -> submit -> present protocol
//
// FRAME TIMELINE (one tick, slot = tick % MAX_FRAMES_IN_FLIGHT):
// ┌──────────────────────────────────────────────────────────────────────────┐
// │ wait slot fence ─> acquire ─> wait image's fence ─> reset ─> submit ─>   │
// │ present ─> next slot                                                     │
// └──────────────────────────────────────────────────────────────────────────┘
//
// The slot fence wait is the only backpressure: the CPU never gets more than
// MAX_FRAMES_IN_FLIGHT submits ahead of the GPU.

use super::swapchain::AcquiredImage;
use super::sync::{FrameSlot, MAX_FRAMES_IN_FLIGHT};
use anyhow::{Context, Result};
use ash::vk;

/// The GPU-queue calls one tick needs. Implemented over the real device and
/// swapchain by the renderer.
pub trait FrameBackend {
    /// Block until `fence` signals (unbounded timeout)
    fn wait_for_fence(&mut self, fence: vk::Fence) -> Result<()>;

    fn reset_fence(&mut self, fence: vk::Fence) -> Result<()>;

    fn acquire_next_image(&mut self, image_available: vk::Semaphore) -> Result<AcquiredImage>;

    /// Submit the pre-recorded commands for `image_index`, waiting on `wait` at
    /// the color-attachment-output stage and signalling `signal` and `fence`.
    fn submit(
        &mut self,
        image_index: u32,
        wait: vk::Semaphore,
        signal: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<()>;

    /// Returns true when the swapchain is suboptimal or out of date
    fn present(&mut self, image_index: u32, wait: vk::Semaphore) -> Result<bool>;
}

/// What a tick did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented,
    /// Presented, but the swapchain no longer matches the surface
    Suboptimal,
    /// No image could be acquired; nothing was submitted
    OutOfDate,
}

impl FrameOutcome {
    pub fn needs_recreation(self) -> bool {
        !matches!(self, FrameOutcome::Presented)
    }
}

/// The fence of the slot that last rendered into each swapchain image.
///
/// Needed whenever the image count exceeds MAX_FRAMES_IN_FLIGHT: the driver
/// may hand out an image that another, still running slot is writing.
#[derive(Clone, Debug, Default)]
pub struct PerImageFence {
    fences: Vec<Option<vk::Fence>>,
}

impl PerImageFence {
    pub fn new(image_count: usize) -> Self {
        Self {
            fences: vec![None; image_count],
        }
    }

    pub fn len(&self) -> usize {
        self.fences.len()
    }

    pub fn get(&self, image_index: usize) -> Option<vk::Fence> {
        self.fences.get(image_index).copied().flatten()
    }

    /// Record `fence` as the last user of `image_index`
    pub fn set(&mut self, image_index: usize, fence: vk::Fence) -> Result<()> {
        let image_count = self.fences.len();
        let entry = self.fences.get_mut(image_index).with_context(|| {
            format!(
                "Acquired image index {} outside swapchain of {} images",
                image_index, image_count
            )
        })?;
        *entry = Some(fence);
        Ok(())
    }
}

/// Rotating frame slots plus the per-image fence table
pub struct FrameSynchronizer {
    slots: [FrameSlot; MAX_FRAMES_IN_FLIGHT],
    image_fences: PerImageFence,
    frame_index: usize,
}

impl FrameSynchronizer {
    pub fn new(slots: [FrameSlot; MAX_FRAMES_IN_FLIGHT], image_count: usize) -> Self {
        Self {
            slots,
            image_fences: PerImageFence::new(image_count),
            frame_index: 0,
        }
    }

    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    pub fn image_fences(&self) -> &PerImageFence {
        &self.image_fences
    }

    /// Forget which slot used which image; called after the swapchain is rebuilt.
    /// Slots and the frame index are kept.
    pub fn reset_image_fences(&mut self, image_count: usize) {
        self.image_fences = PerImageFence::new(image_count);
    }

    /// Run one tick of the frame protocol.
    ///
    /// The slot advances on every tick regardless of the outcome. Errors
    /// other than an out-of-date swapchain are returned as-is and are fatal
    /// to the caller.
    pub fn draw_frame<B: FrameBackend>(&mut self, backend: &mut B) -> Result<FrameOutcome> {
        let slot = self.slots[self.frame_index];
        let outcome = self.run_slot(backend, slot);
        self.frame_index = (self.frame_index + 1) % MAX_FRAMES_IN_FLIGHT;
        outcome
    }

    fn run_slot<B: FrameBackend>(&mut self, backend: &mut B, slot: FrameSlot) -> Result<FrameOutcome> {
        // GPU must be done with this slot's previous submit before we reuse it
        backend
            .wait_for_fence(slot.in_flight_fence)
            .context("Failed waiting for in-flight fence")?;

        let (image_index, acquire_suboptimal) =
            match backend.acquire_next_image(slot.image_available)? {
                AcquiredImage::Ready { index, suboptimal } => (index, suboptimal),
                // Fence is still signaled, so the next use of this slot won't block
                AcquiredImage::OutOfDate => {
                    log::debug!("Swapchain out of date on acquire");
                    return Ok(FrameOutcome::OutOfDate);
                }
            };

        // Another slot may still be rendering into this image
        let image = image_index as usize;
        if let Some(fence) = self
            .image_fences
            .get(image)
            .filter(|&fence| fence != slot.in_flight_fence)
        {
            backend
                .wait_for_fence(fence)
                .context("Failed waiting for image's previous fence")?;
        }
        self.image_fences.set(image, slot.in_flight_fence)?;

        // Fences don't reset themselves; only reset once a submit is certain
        backend.reset_fence(slot.in_flight_fence)?;
        backend
            .submit(
                image_index,
                slot.image_available,
                slot.render_finished,
                slot.in_flight_fence,
            )
            .context("Failed to submit draw command buffer")?;

        let present_stale = backend.present(image_index, slot.render_finished)?;

        Ok(if acquire_suboptimal || present_stale {
            FrameOutcome::Suboptimal
        } else {
            FrameOutcome::Presented
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use std::collections::{HashSet, VecDeque};

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum Call {
        Wait(vk::Fence),
        Reset(vk::Fence),
        Acquire(vk::Semaphore),
        Submit(u32, vk::Fence),
        Present(u32, vk::Semaphore),
    }

    /// Records calls and models fence state: a submitted fence is pending
    /// until someone waits on it.
    #[derive(Default)]
    struct FakeBackend {
        calls: Vec<Call>,
        acquire_results: VecDeque<AcquiredImage>,
        present_stale: bool,
        signaled: HashSet<vk::Fence>,
        pending: HashSet<vk::Fence>,
        max_pending: usize,
    }

    impl FakeBackend {
        fn with_images(images: &[u32], slots: &[FrameSlot]) -> Self {
            Self {
                acquire_results: images
                    .iter()
                    .map(|&index| AcquiredImage::Ready {
                        index,
                        suboptimal: false,
                    })
                    .collect(),
                signaled: slots.iter().map(|s| s.in_flight_fence).collect(),
                ..Default::default()
            }
        }
    }

    impl FrameBackend for FakeBackend {
        fn wait_for_fence(&mut self, fence: vk::Fence) -> Result<()> {
            self.calls.push(Call::Wait(fence));
            // Waiting on a pending fence lets the GPU "finish" it
            if self.pending.remove(&fence) {
                self.signaled.insert(fence);
            }
            anyhow::ensure!(self.signaled.contains(&fence), "wait on never-signaled fence");
            Ok(())
        }

        fn reset_fence(&mut self, fence: vk::Fence) -> Result<()> {
            self.calls.push(Call::Reset(fence));
            anyhow::ensure!(!self.pending.contains(&fence), "reset of a pending fence");
            self.signaled.remove(&fence);
            Ok(())
        }

        fn acquire_next_image(&mut self, image_available: vk::Semaphore) -> Result<AcquiredImage> {
            self.calls.push(Call::Acquire(image_available));
            self.acquire_results
                .pop_front()
                .context("no more scripted acquires")
        }

        fn submit(
            &mut self,
            image_index: u32,
            _wait: vk::Semaphore,
            _signal: vk::Semaphore,
            fence: vk::Fence,
        ) -> Result<()> {
            self.calls.push(Call::Submit(image_index, fence));
            anyhow::ensure!(!self.signaled.contains(&fence), "submit with a signaled fence");
            self.pending.insert(fence);
            self.max_pending = self.max_pending.max(self.pending.len());
            Ok(())
        }

        fn present(&mut self, image_index: u32, wait: vk::Semaphore) -> Result<bool> {
            self.calls.push(Call::Present(image_index, wait));
            Ok(self.present_stale)
        }
    }

    fn slots() -> [FrameSlot; MAX_FRAMES_IN_FLIGHT] {
        std::array::from_fn(|i| {
            let base = (i as u64 + 1) * 10;
            FrameSlot {
                image_available: vk::Semaphore::from_raw(base + 1),
                render_finished: vk::Semaphore::from_raw(base + 2),
                in_flight_fence: vk::Fence::from_raw(base + 3),
            }
        })
    }

    #[test]
    fn slot_rotates_every_tick() {
        let slots = slots();
        let mut backend = FakeBackend::with_images(&[0, 1, 2, 0, 1, 2, 0], &slots);
        let mut sync = FrameSynchronizer::new(slots, 3);

        for tick in 0..7usize {
            assert_eq!(sync.frame_index(), tick % MAX_FRAMES_IN_FLIGHT);
            sync.draw_frame(&mut backend).unwrap();
        }

        let acquires: Vec<_> = backend
            .calls
            .iter()
            .filter_map(|call| match call {
                Call::Acquire(semaphore) => Some(*semaphore),
                _ => None,
            })
            .collect();
        for (tick, semaphore) in acquires.iter().enumerate() {
            assert_eq!(*semaphore, slots[tick % MAX_FRAMES_IN_FLIGHT].image_available);
        }
    }

    #[test]
    fn first_tick_follows_protocol_order() {
        let slots = slots();
        let mut backend = FakeBackend::with_images(&[0], &slots);
        let mut sync = FrameSynchronizer::new(slots, 3);

        let outcome = sync.draw_frame(&mut backend).unwrap();

        let s = slots[0];
        assert_eq!(outcome, FrameOutcome::Presented);
        assert_eq!(
            backend.calls,
            vec![
                Call::Wait(s.in_flight_fence),
                Call::Acquire(s.image_available),
                Call::Reset(s.in_flight_fence),
                Call::Submit(0, s.in_flight_fence),
                Call::Present(0, s.render_finished),
            ]
        );
        assert_eq!(sync.frame_index(), 1);
        assert_eq!(sync.image_fences().get(0), Some(s.in_flight_fence));
    }

    #[test]
    fn image_used_by_other_slot_is_waited_on() {
        let slots = slots();
        // Tick 2 (slot 0) gets image 1, last written by slot 1
        let mut backend = FakeBackend::with_images(&[0, 1, 1], &slots);
        let mut sync = FrameSynchronizer::new(slots, 3);

        for _ in 0..3 {
            sync.draw_frame(&mut backend).unwrap();
        }

        let tick2 = &backend.calls[10..];
        assert_eq!(
            tick2,
            &[
                Call::Wait(slots[0].in_flight_fence),
                Call::Acquire(slots[0].image_available),
                Call::Wait(slots[1].in_flight_fence),
                Call::Reset(slots[0].in_flight_fence),
                Call::Submit(1, slots[0].in_flight_fence),
                Call::Present(1, slots[0].render_finished),
            ]
        );
        assert_eq!(sync.image_fences().get(1), Some(slots[0].in_flight_fence));
    }

    #[test]
    fn same_slot_image_needs_no_extra_wait() {
        let slots = slots();
        let mut backend = FakeBackend::with_images(&[0, 1, 0], &slots);
        let mut sync = FrameSynchronizer::new(slots, 2);

        for _ in 0..3 {
            sync.draw_frame(&mut backend).unwrap();
        }

        let waits = backend
            .calls
            .iter()
            .filter(|c| matches!(c, Call::Wait(_)))
            .count();
        assert_eq!(waits, 3);
    }

    #[test]
    fn never_more_than_max_frames_in_flight() {
        let slots = slots();
        let images: Vec<u32> = (0..50).map(|i| (i * 7 % 4) as u32).collect();
        let mut backend = FakeBackend::with_images(&images, &slots);
        let mut sync = FrameSynchronizer::new(slots, 4);

        for _ in 0..images.len() {
            sync.draw_frame(&mut backend).unwrap();
        }

        assert!(backend.max_pending <= MAX_FRAMES_IN_FLIGHT);
        assert_eq!(backend.max_pending, MAX_FRAMES_IN_FLIGHT);
    }

    #[test]
    fn out_of_date_acquire_skips_submit_and_keeps_fence_signaled() {
        let slots = slots();
        let mut backend = FakeBackend::with_images(&[], &slots);
        backend.acquire_results.push_back(AcquiredImage::OutOfDate);
        backend.acquire_results.push_back(AcquiredImage::Ready {
            index: 0,
            suboptimal: false,
        });
        backend.acquire_results.push_back(AcquiredImage::Ready {
            index: 1,
            suboptimal: false,
        });
        let mut sync = FrameSynchronizer::new(slots, 2);

        assert_eq!(sync.draw_frame(&mut backend).unwrap(), FrameOutcome::OutOfDate);
        assert!(!backend
            .calls
            .iter()
            .any(|c| matches!(c, Call::Reset(_) | Call::Submit(..) | Call::Present(..))));
        // Slot still advances
        assert_eq!(sync.frame_index(), 1);

        sync.draw_frame(&mut backend).unwrap();
        // Slot 0 comes round again and its fence must not deadlock
        assert_eq!(sync.draw_frame(&mut backend).unwrap(), FrameOutcome::Presented);
    }

    #[test]
    fn suboptimal_results_still_present() {
        let slots = slots();
        let mut backend = FakeBackend::with_images(&[], &slots);
        backend.acquire_results.push_back(AcquiredImage::Ready {
            index: 0,
            suboptimal: true,
        });
        let mut sync = FrameSynchronizer::new(slots, 2);

        let outcome = sync.draw_frame(&mut backend).unwrap();
        assert_eq!(outcome, FrameOutcome::Suboptimal);
        assert!(outcome.needs_recreation());
        assert!(backend.calls.contains(&Call::Present(0, slots[0].render_finished)));

        backend.acquire_results.push_back(AcquiredImage::Ready {
            index: 1,
            suboptimal: false,
        });
        backend.present_stale = true;
        assert_eq!(sync.draw_frame(&mut backend).unwrap(), FrameOutcome::Suboptimal);
    }

    #[test]
    fn out_of_range_image_index_is_an_error() {
        let slots = slots();
        let mut backend = FakeBackend::with_images(&[5], &slots);
        let mut sync = FrameSynchronizer::new(slots, 3);

        assert!(sync.draw_frame(&mut backend).is_err());
        assert!(!backend.calls.iter().any(|c| matches!(c, Call::Submit(..))));
    }

    #[test]
    fn reset_image_fences_keeps_frame_index() {
        let slots = slots();
        let mut backend = FakeBackend::with_images(&[0], &slots);
        let mut sync = FrameSynchronizer::new(slots, 3);
        sync.draw_frame(&mut backend).unwrap();

        sync.reset_image_fences(4);
        assert_eq!(sync.image_fences().len(), 4);
        assert!((0..4).all(|i| sync.image_fences().get(i).is_none()));
        assert_eq!(sync.frame_index(), 1);
    }
}
