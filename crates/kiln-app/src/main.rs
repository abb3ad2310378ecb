// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use anyhow::Result;
use clap::{Parser, ValueEnum};
use kiln_core::init_tracing;
use kiln_platform::WinitSurface;
use kiln_render::{PresentPreference, RenderSize, Renderer, SurfaceProvider};
use kiln_render_vk::VkRenderer;
use tracing::{error, info, warn};

use kiln_platform::winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    window::{Window, WindowId},
};

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file with a [render] table
    #[arg(long, default_value = "kiln.toml")]
    config: PathBuf,
    /// Overrides render.present_mode from the config
    #[arg(long, value_enum)]
    present_mode: Option<PresentModeCfg>,
    /// Exit after this many presented frames
    #[arg(long)]
    max_frames: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
struct RenderCfg {
    #[serde(default = "default_clear")]
    clear_color: [f32; 4],
    #[serde(default)]
    present_mode: PresentModeCfg,
    #[serde(default)]
    unfocused: UnfocusedPolicy,
    #[serde(default = "default_unfocused_fps")]
    unfocused_fps: u32,
    #[serde(default)]
    fps_cap: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum, Default)]
#[serde(rename_all = "snake_case")]
enum PresentModeCfg {
    #[default]
    Mailbox,
    Fifo,
    Immediate,
}

impl From<PresentModeCfg> for PresentPreference {
    fn from(mode: PresentModeCfg) -> Self {
        match mode {
            PresentModeCfg::Mailbox => PresentPreference::Mailbox,
            PresentModeCfg::Fifo => PresentPreference::Fifo,
            PresentModeCfg::Immediate => PresentPreference::Immediate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
enum UnfocusedPolicy {
    None,
    VsyncOn,
    #[default]
    Throttle,
}

#[derive(Debug, Deserialize, Default, PartialEq)]
struct AppCfg {
    #[serde(default)]
    render: RenderCfg,
}

impl Default for RenderCfg {
    fn default() -> Self {
        RenderCfg {
            clear_color: default_clear(),
            present_mode: PresentModeCfg::Mailbox,
            unfocused: UnfocusedPolicy::Throttle,
            unfocused_fps: default_unfocused_fps(),
            fps_cap: 0,
        }
    }
}

fn default_clear() -> [f32; 4] {
    [0.02, 0.02, 0.04, 1.0]
}
fn default_unfocused_fps() -> u32 {
    30
}

fn parse_cfg(text: &str) -> Result<AppCfg, toml::de::Error> {
    toml::from_str(text)
}

fn load_cfg(path: &Path) -> AppCfg {
    match fs::read_to_string(path) {
        Ok(s) => parse_cfg(&s).unwrap_or_else(|e| {
            warn!("{}: {e}; using defaults", path.display());
            AppCfg::default()
        }),
        Err(_) => AppCfg::default(),
    }
}

struct App {
    cfg: AppCfg,
    present: PresentPreference,
    max_frames: Option<u64>,

    window: Option<Arc<Window>>,
    renderer: Option<VkRenderer>,

    exiting: bool,
    frames: u32,
    presented_total: u64,
    last_fps_instant: Instant,

    paused: bool,
    focused: bool,
    next_frame_deadline: Option<Instant>,
}

impl App {
    fn new(args: Args, cfg: AppCfg) -> Self {
        let present = args.present_mode.unwrap_or(cfg.render.present_mode).into();
        Self {
            cfg,
            present,
            max_frames: args.max_frames,
            window: None,
            renderer: None,
            exiting: false,
            frames: 0,
            presented_total: 0,
            last_fps_instant: Instant::now(),
            paused: false,
            focused: true,
            next_frame_deadline: None,
        }
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        self.exiting = true;
        // renderer before the window its surface was made from
        self.renderer = None;
        self.window = None;
        event_loop.exit();
    }

    fn request_redraw(&self) {
        if let Some(w) = &self.window {
            w.request_redraw();
        }
    }

    /// Frame rate to pace to right now. 0 leaves pacing to the present mode.
    fn target_fps(&self) -> u32 {
        if !self.focused && self.cfg.render.unfocused == UnfocusedPolicy::Throttle {
            return self.cfg.render.unfocused_fps;
        }
        self.cfg.render.fps_cap
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_none() {
            let window = match event_loop
                .create_window(Window::default_attributes().with_title("kiln"))
            {
                Ok(w) => Arc::new(w),
                Err(e) => {
                    error!("create_window: {e}");
                    event_loop.exit();
                    return;
                }
            };

            let surface: Arc<dyn SurfaceProvider> = Arc::new(WinitSurface::new(window.clone()));
            let size = surface.drawable_size();
            let mut renderer = match VkRenderer::new(surface, self.present) {
                Ok(r) => r,
                Err(e) => {
                    error!("vk init failed: {e:#}");
                    event_loop.exit();
                    return;
                }
            };
            renderer.set_clear_color(self.cfg.render.clear_color);

            info!("present preference = {:?}", self.present);
            self.paused = size.is_empty();
            self.window = Some(window);
            self.renderer = Some(renderer);
        }

        event_loop.set_control_flow(ControlFlow::Wait);
        info!("resumed → paused={}", self.paused);
        if !self.paused {
            self.request_redraw();
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent,
    ) {
        if let Some(window) = &self.window {
            if window_id != window.id() {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                self.shutdown(event_loop);
            }

            WindowEvent::Resized(new_size) => {
                let size = RenderSize::new(new_size.width, new_size.height);
                self.paused = size.is_empty();
                info!("Resized → {}x{} (paused={})", size.width, size.height, self.paused);

                // Recorded even while paused so the restore recreates.
                if let Some(r) = &mut self.renderer {
                    r.resize(size);
                }
                if !self.paused {
                    self.request_redraw();
                }
            }

            WindowEvent::Occluded(occluded) => {
                let empty = self
                    .window
                    .as_ref()
                    .map(|w| w.inner_size())
                    .is_some_and(|s| s.width == 0 || s.height == 0);
                self.paused = occluded || empty;
                info!("Occluded={} → paused={}", occluded, self.paused);
                if !self.paused {
                    self.request_redraw();
                }
            }

            WindowEvent::Focused(focused) => {
                if self.focused != focused {
                    self.focused = focused;
                    info!("Focused({})", focused);

                    if self.cfg.render.unfocused == UnfocusedPolicy::VsyncOn {
                        if let Some(r) = &mut self.renderer {
                            let present = if focused {
                                self.present
                            } else {
                                PresentPreference::Fifo
                            };
                            r.set_present_preference(present);
                        }
                    }
                    if focused {
                        self.next_frame_deadline = None;
                    }
                }
            }

            WindowEvent::RedrawRequested => {
                if self.exiting || self.paused {
                    return;
                }
                let Some(renderer) = &mut self.renderer else {
                    return;
                };

                match renderer.render() {
                    Ok(true) => {
                        // count only frames that were actually presented
                        self.frames = self.frames.saturating_add(1);
                        self.presented_total += 1;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        error!("render error: {e:#}");
                        self.shutdown(event_loop);
                        return;
                    }
                }

                if self.max_frames.is_some_and(|max| self.presented_total >= max) {
                    info!("presented {} frames, exiting", self.presented_total);
                    self.shutdown(event_loop);
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.exiting {
            return;
        }

        if self.paused {
            // minimized or occluded → sleep until an event
            event_loop.set_control_flow(ControlFlow::Wait);
            self.frames = 0;
            return;
        }

        let target_fps = self.target_fps();
        if target_fps == 0 {
            // Uncapped: the present mode paces us.
            event_loop.set_control_flow(ControlFlow::Poll);
            self.request_redraw();
        } else {
            let now = Instant::now();
            let frame_dt = Duration::from_nanos(1_000_000_000u64 / u64::from(target_fps));

            match self.next_frame_deadline {
                Some(deadline) if now < deadline => {
                    // Not time yet: sleep until the stored deadline.
                    event_loop.set_control_flow(ControlFlow::WaitUntil(deadline));
                }
                _ => {
                    let next = now + frame_dt;
                    self.next_frame_deadline = Some(next);
                    event_loop.set_control_flow(ControlFlow::WaitUntil(next));
                    self.request_redraw();
                }
            }
        }

        let now = Instant::now();
        if now.duration_since(self.last_fps_instant).as_secs_f32() >= 1.0 {
            info!("fps ~ {}", self.frames);
            self.frames = 0;
            self.last_fps_instant = now;
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let cfg = load_cfg(&args.config);
    let event_loop: EventLoop<()> = EventLoop::new()?;

    let mut app = App::new(args, cfg);
    event_loop.run_app(&mut app)?;
    Ok(())
}
