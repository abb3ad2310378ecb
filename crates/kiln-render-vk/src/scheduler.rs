// SPDX-License-Identifier: CEPL-1.0
//! The frame loop: acquire → record → submit → present over a fixed pool of
//! frames in flight, with swapchain recreation folded in.
use std::sync::Arc;

use ash::vk;
use kiln_render::{PresentPreference, ResizeFlag};
use tracing::{debug, info, trace, warn};

use crate::chain::{Acquired, PresentStatus, PresentationChain};
use crate::device::RenderDevice;
use crate::error::{FrameError, FrameStage, SetupError};
use crate::frame::{create_slots, FrameSlot, FRAMES_IN_FLIGHT};
use crate::targets::{pick_depth_format, FramebufferSet, RenderPass};

const DEFAULT_CLEAR: [f32; 4] = [0.02, 0.02, 0.04, 1.0];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FrameState {
    Idle,
    Recording,
    /// Begun without an image; `end_frame` only advances the slot.
    Dead,
}

/// What `begin_frame` handed out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameBegin {
    /// Record into this command buffer, inside the already-begun render pass.
    Recording(vk::CommandBuffer),
    /// Nothing to record this cycle. Still call `end_frame`.
    Skipped,
}

/// How a frame cycle finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameStatus {
    Presented,
    /// Presented, but the chain will be rebuilt at the next `begin_frame`.
    PresentedStale,
    /// No GPU work was issued.
    Skipped,
}

pub struct FrameScheduler<D: RenderDevice> {
    // Drop order matters: slots and framebuffers go before the pass and chain.
    slots: [FrameSlot<D>; FRAMES_IN_FLIGHT],
    framebuffers: FramebufferSet<D>,
    render_pass: RenderPass<D>,
    chain: PresentationChain<D>,
    device: Arc<D>,

    current_frame: usize,
    image_index: u32,
    state: FrameState,
    recreate_pending: bool,
    resize: ResizeFlag,
    clear: [vk::ClearValue; 2],
}

fn clear_values(rgba: [f32; 4]) -> [vk::ClearValue; 2] {
    [
        vk::ClearValue {
            color: vk::ClearColorValue { float32: rgba },
        },
        vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: 1.0,
                stencil: 0,
            },
        },
    ]
}

impl<D: RenderDevice> FrameScheduler<D> {
    /// Builds the chain, render pass, framebuffers and frame slots.
    ///
    /// `resize` is the flag the windowing layer raises on resize.
    pub fn new(
        device: Arc<D>,
        present: PresentPreference,
        resize: ResizeFlag,
    ) -> Result<Self, SetupError> {
        let chain = PresentationChain::create(device.clone(), present)?;
        let depth_format = pick_depth_format(&*device)?;
        let render_pass = RenderPass::new(device.clone(), chain.format(), depth_format)?;
        let framebuffers = FramebufferSet::build(device.clone(), &render_pass, &chain)?;
        let slots = create_slots(&device)?;

        info!(
            "frame scheduler ready: {} frames in flight over {} drawable images",
            FRAMES_IN_FLIGHT,
            chain.image_count()
        );

        Ok(Self {
            slots,
            framebuffers,
            render_pass,
            chain,
            device,
            current_frame: 0,
            image_index: 0,
            state: FrameState::Idle,
            recreate_pending: false,
            resize,
            clear: clear_values(DEFAULT_CLEAR),
        })
    }

    // STRICT PER-FRAME ORDER (per slot):
    // 1) wait in_flight (GPU is done with this slot's command buffer)
    // 2) acquire (signals image_available)
    // 3) reset in_flight, then reset + begin the command buffer
    // Stale acquire: rebuild targets, leave the fence signaled, dead frame.
    /// Starts the next frame cycle.
    ///
    /// After any error other than [`FrameError::OutOfOrder`] the scheduler
    /// must be dropped: a slot's fence may have been reset with no
    /// submission left to signal it.
    pub fn begin_frame(&mut self) -> Result<FrameBegin, FrameError> {
        if self.state != FrameState::Idle {
            return Err(FrameError::OutOfOrder(
                "begin_frame called twice without end_frame",
            ));
        }

        if self.resize.take() {
            debug!("framebuffer resized, recreating before acquire");
            self.recreate_pending = true;
        }

        if self.device.drawable_size().is_empty() {
            trace!("drawable area is 0x0, skipping frame");
            self.state = FrameState::Dead;
            return Ok(FrameBegin::Skipped);
        }

        if self.recreate_pending && !self.recreate()? {
            self.state = FrameState::Dead;
            return Ok(FrameBegin::Skipped);
        }

        let slot = &self.slots[self.current_frame];
        let (fence, image_available, cmd) =
            (slot.in_flight(), slot.image_available(), slot.command_buffer());

        self.device
            .wait_for_fence(fence)
            .map_err(FrameError::vk(FrameStage::FenceWait))?;

        let generation = self.chain.generation();
        let index = match self.chain.acquire_next(image_available, vk::Fence::null())? {
            Acquired::Image { index, suboptimal } => {
                if suboptimal {
                    debug!("acquire: swapchain suboptimal, recreating at next frame");
                    self.recreate_pending = true;
                }
                index
            }
            Acquired::Stale => {
                if self.chain.generation() != generation {
                    self.rebuild_targets()?;
                } else {
                    self.recreate_pending = true;
                }
                self.state = FrameState::Dead;
                return Ok(FrameBegin::Skipped);
            }
        };

        let framebuffer = self
            .framebuffers
            .get(index)
            .ok_or(FrameError::MissingFramebuffer(index))?;

        self.device
            .reset_fence(fence)
            .map_err(FrameError::vk(FrameStage::Record))?;
        self.device
            .begin_commands(cmd)
            .map_err(FrameError::vk(FrameStage::Record))?;
        self.device.begin_render_pass(
            cmd,
            self.render_pass.handle(),
            framebuffer,
            self.chain.extent(),
            &self.clear,
        );

        self.image_index = index;
        self.state = FrameState::Recording;
        Ok(FrameBegin::Recording(cmd))
    }

    // STRICT ORDER:
    // 1) end render pass + recording
    // 2) submit: wait image_available @ COLOR_ATTACHMENT_OUTPUT,
    //    signal render_finished + in_flight
    // 3) present: wait render_finished
    // 4) advance the slot
    /// Finishes the cycle started by `begin_frame`. The same error contract
    /// applies: drop the scheduler after anything but `OutOfOrder`.
    pub fn end_frame(&mut self) -> Result<FrameStatus, FrameError> {
        match std::mem::replace(&mut self.state, FrameState::Idle) {
            FrameState::Idle => Err(FrameError::OutOfOrder(
                "end_frame called without begin_frame",
            )),
            FrameState::Dead => {
                self.advance();
                Ok(FrameStatus::Skipped)
            }
            FrameState::Recording => {
                let slot = &self.slots[self.current_frame];
                let cmd = slot.command_buffer();
                let render_finished = slot.render_finished();

                self.device.end_render_pass(cmd);
                self.device
                    .end_commands(cmd)
                    .map_err(FrameError::vk(FrameStage::Record))?;
                self.device
                    .submit(cmd, slot.image_available(), render_finished, slot.in_flight())
                    .map_err(FrameError::vk(FrameStage::Submit))?;

                let status = self.chain.present(self.image_index, render_finished)?;
                if status != PresentStatus::Presented || self.resize.is_raised() {
                    debug!("present: {status:?}, recreating at next frame");
                    self.recreate_pending = true;
                }

                self.advance();
                Ok(if self.recreate_pending {
                    FrameStatus::PresentedStale
                } else {
                    FrameStatus::Presented
                })
            }
        }
    }

    fn advance(&mut self) {
        self.current_frame = (self.current_frame + 1) % FRAMES_IN_FLIGHT;
    }

    /// Recreates the chain and everything sized to it. `Ok(false)` means the
    /// surface has no area yet and the recreation stays pending.
    fn recreate(&mut self) -> Result<bool, FrameError> {
        if !self.chain.recreate()? {
            return Ok(false);
        }
        self.rebuild_targets()?;
        self.recreate_pending = false;
        Ok(true)
    }

    fn rebuild_targets(&mut self) -> Result<(), SetupError> {
        if self.chain.format() != self.render_pass.color_format() {
            warn!(
                "swapchain format changed {:?} -> {:?}, rebuilding render pass",
                self.render_pass.color_format(),
                self.chain.format()
            );
            self.device
                .wait_idle()
                .map_err(SetupError::vk("device_wait_idle"))?;
            self.render_pass = RenderPass::new(
                self.device.clone(),
                self.chain.format(),
                self.render_pass.depth_format(),
            )?;
        }
        self.framebuffers.rebuild(&self.render_pass, &self.chain)
    }

    /// Forces a recreation at the next `begin_frame`.
    pub fn request_recreate(&mut self) {
        self.recreate_pending = true;
    }

    pub fn is_recreate_pending(&self) -> bool {
        self.recreate_pending || self.resize.is_raised()
    }

    pub fn set_present_preference(&mut self, present: PresentPreference) {
        if self.chain.present_preference() == present {
            return;
        }
        self.chain.set_present_preference(present);
        self.recreate_pending = true;
    }

    pub fn set_clear_color(&mut self, rgba: [f32; 4]) {
        self.clear = clear_values(rgba);
    }

    pub fn resize_flag(&self) -> ResizeFlag {
        self.resize.clone()
    }

    pub fn current_frame(&self) -> usize {
        self.current_frame
    }

    pub fn image_index(&self) -> u32 {
        self.image_index
    }

    /// For pipelines built against this scheduler's attachments.
    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass.handle()
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.chain.extent()
    }

    pub fn chain(&self) -> &PresentationChain<D> {
        &self.chain
    }

    pub fn framebuffers(&self) -> &FramebufferSet<D> {
        &self.framebuffers
    }

    pub fn slots(&self) -> &[FrameSlot<D>] {
        &self.slots
    }

    pub fn wait_idle(&self) -> Result<(), FrameError> {
        self.device
            .wait_idle()
            .map_err(FrameError::vk(FrameStage::WaitIdle))
    }
}

impl<D: RenderDevice> Drop for FrameScheduler<D> {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            warn!("device_wait_idle during scheduler teardown: {e}");
        }
    }
}
