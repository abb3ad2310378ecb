// SPDX-License-Identifier: CEPL-1.0
//! Window-system glue. Re-exports `winit` so the app depends on one copy, and
//! adapts a winit window to the renderer's `SurfaceProvider` contract.
use std::sync::Arc;

use kiln_render::{RenderSize, SurfaceProvider};
use winit::raw_window_handle::{
    DisplayHandle, HandleError, HasDisplayHandle, HasWindowHandle, WindowHandle,
};
use winit::window::Window;

pub use winit;

pub struct WinitSurface {
    window: Arc<Window>,
}

impl WinitSurface {
    pub fn new(window: Arc<Window>) -> Self {
        Self { window }
    }

    pub fn window(&self) -> &Window {
        &self.window
    }
}

impl HasWindowHandle for WinitSurface {
    fn window_handle(&self) -> Result<WindowHandle<'_>, HandleError> {
        self.window.window_handle()
    }
}

impl HasDisplayHandle for WinitSurface {
    fn display_handle(&self) -> Result<DisplayHandle<'_>, HandleError> {
        self.window.display_handle()
    }
}

impl SurfaceProvider for WinitSurface {
    fn drawable_size(&self) -> RenderSize {
        // Some platforms keep reporting the last size while minimized.
        if self.window.is_minimized() == Some(true) {
            tracing::trace!("window minimized, drawable size is 0x0");
            return RenderSize::default();
        }
        let size = self.window.inner_size();
        RenderSize::new(size.width, size.height)
    }
}
