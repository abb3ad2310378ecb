// SPDX-License-Identifier: CEPL-1.0
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// A minimized window reports zero area in at least one dimension.
    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// The window side of presentation: a native surface the backend can bind to,
/// plus the size of its drawable area.
///
/// `drawable_size` must return `(0, 0)` while the window is minimized instead
/// of failing.
pub trait SurfaceProvider: HasWindowHandle + HasDisplayHandle + Send + Sync {
    fn drawable_size(&self) -> RenderSize;
}

/// Which presentation mode the backend should ask for. Unsupported choices
/// fall back to FIFO, which every surface supports.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PresentPreference {
    /// Low latency, uncapped rendering, no tearing.
    #[default]
    Mailbox,
    /// Locked to the display refresh rate.
    Fifo,
    /// No vsync at all; may tear.
    Immediate,
}

/// Shared "framebuffer resized" flag. The windowing layer raises it from its
/// resize callback; the renderer consumes it at the start of the next frame.
#[derive(Clone, Debug, Default)]
pub struct ResizeFlag(Arc<AtomicBool>);

impl ResizeFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Clears the flag and reports whether it was set.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

pub trait Renderer {
    fn new(surface: Arc<dyn SurfaceProvider>, present: PresentPreference) -> Result<Self>
    where
        Self: Sized;

    /// Notes that the window changed size. Recreation happens on the next frame.
    fn resize(&mut self, size: RenderSize);

    /// Draws one frame. `Ok(true)` means an image was queued for presentation.
    fn render(&mut self) -> Result<bool>;
    fn set_clear_color(&mut self, rgba: [f32; 4]);
    fn set_present_preference(&mut self, _present: PresentPreference) {}
}
