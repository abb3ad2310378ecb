// SPDX-License-Identifier: CEPL-1.0
use std::fmt;

use ash::vk;
use thiserror::Error;

/// Where in the frame cycle something went wrong. Used in diagnostics so a
/// fatal error names the step that failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameStage {
    FenceWait,
    Acquire,
    Record,
    Submit,
    Present,
    Recreate,
    WaitIdle,
}

impl fmt::Display for FrameStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameStage::FenceWait => "fence wait",
            FrameStage::Acquire => "acquire",
            FrameStage::Record => "record",
            FrameStage::Submit => "submit",
            FrameStage::Present => "present",
            FrameStage::Recreate => "recreate",
            FrameStage::WaitIdle => "device wait idle",
        };
        f.write_str(name)
    }
}

/// Failures while building or rebuilding presentation resources
/// (swapchain, render targets, frame slots).
#[derive(Debug, Error)]
pub enum SetupError {
    /// The surface has no drawable area (minimized window). Retry later.
    #[error("surface has no drawable area yet")]
    NotReady,

    #[error("surface not usable for presentation: {0}")]
    Unsupported(String),

    #[error("{op} failed: {result}")]
    Vulkan {
        op: &'static str,
        #[source]
        result: vk::Result,
    },
}

impl SetupError {
    pub(crate) fn vk(op: &'static str) -> impl FnOnce(vk::Result) -> SetupError {
        move |result| SetupError::Vulkan { op, result }
    }
}

/// Fatal per-frame failures. Out-of-date and suboptimal presentation are not
/// errors; they come back as frame statuses instead.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("{stage} failed: {result}")]
    Vulkan {
        stage: FrameStage,
        #[source]
        result: vk::Result,
    },

    #[error("recreate failed: {0}")]
    Recreate(#[from] SetupError),

    #[error("frame calls out of order: {0}")]
    OutOfOrder(&'static str),

    #[error("no framebuffer for drawable image {0}")]
    MissingFramebuffer(u32),
}

impl FrameError {
    pub(crate) fn vk(stage: FrameStage) -> impl FnOnce(vk::Result) -> FrameError {
        move |result| FrameError::Vulkan { stage, result }
    }

    /// The stage that failed. Ordering and bookkeeping mistakes are reported
    /// as `Record`.
    pub fn stage(&self) -> FrameStage {
        match self {
            FrameError::Vulkan { stage, .. } => *stage,
            FrameError::Recreate(_) => FrameStage::Recreate,
            FrameError::OutOfOrder(_) | FrameError::MissingFramebuffer(_) => FrameStage::Record,
        }
    }
}
