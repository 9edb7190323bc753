//! SDL2 window for the viewer binary.
//! Renders display frames, shows the camera status in the title bar and
//! turns key presses into desired-settings edits.

use color_eyre::{eyre::eyre, Result};
use sdl2::event::Event;
use sdl2::keyboard::Keycode;
use sdl2::pixels::{Color, PixelFormatEnum};
use sdl2::render::{Canvas, TextureCreator};
use sdl2::video::{Window, WindowContext};
use tracing::{debug, info, warn};

use crate::capture::{DisplayFrame, PixelFormat};
use crate::settings::{
    DesiredSettings, SettingsHandle, SettingsStore, KEY_BALANCE_RATIO, KEY_BINNING, KEY_EXPOSURE,
    KEY_LOG_LEVEL, KEY_PIXEL_FORMAT,
};
use crate::{CameraFacade, DisplayConfig};

const EXPOSURE_STEP: f64 = 1.25;
const BALANCE_STEP: f64 = 0.05;

/// SDL2 Window Display
pub struct Sdl2Display {
    canvas: Canvas<Window>,
    texture_creator: TextureCreator<WindowContext>,
    title: String,
    shown_title: String,
}

impl Sdl2Display {
    pub fn new(sdl_context: &sdl2::Sdl, config: &DisplayConfig) -> Result<Self> {
        let video_subsystem = sdl_context.video().map_err(|e| eyre!(e))?;

        let window = video_subsystem
            .window(&config.title, config.width, config.height)
            .position_centered()
            .resizable()
            .build()?;

        let canvas = window.into_canvas().present_vsync().build()?;
        let texture_creator = canvas.texture_creator();

        Ok(Self {
            canvas,
            texture_creator,
            title: config.title.clone(),
            shown_title: String::new(),
        })
    }

    pub fn render_frame(&mut self, frame: &DisplayFrame) -> Result<()> {
        let mut texture = self
            .texture_creator
            .create_texture_streaming(PixelFormatEnum::RGBA32, frame.width, frame.height)
            .map_err(|e| eyre!(e))?;

        texture
            .update(None, &frame.pixels, frame.pitch())
            .map_err(|e| eyre!(e))?;

        self.canvas.set_draw_color(Color::BLACK);
        self.canvas.clear();
        self.canvas
            .copy(&texture, None, None)
            .map_err(|e| eyre!(e))?;
        self.canvas.present();
        Ok(())
    }

    fn render_idle(&mut self) {
        self.canvas.set_draw_color(Color::BLACK);
        self.canvas.clear();
        self.canvas.present();
    }

    fn update_title(&mut self, status_line: &str) -> Result<()> {
        let title = format!("{} | {}", self.title, status_line);
        if title != self.shown_title {
            self.canvas
                .window_mut()
                .set_title(&title)
                .map_err(|e| eyre!(e))?;
            self.shown_title = title;
        }
        Ok(())
    }

    pub fn run(&mut self, sdl_context: &sdl2::Sdl, camera: &mut CameraFacade) -> Result<()> {
        let mut event_pump = sdl_context.event_pump().map_err(|e| eyre!(e))?;

        'running: loop {
            for event in event_pump.poll_iter() {
                match event {
                    Event::Quit { .. }
                    | Event::KeyDown {
                        keycode: Some(Keycode::Escape),
                        ..
                    } => {
                        info!("Quit event received");
                        break 'running;
                    }
                    Event::KeyDown {
                        keycode: Some(key), ..
                    } => {
                        let settings = camera.settings().clone();
                        apply_key(key, &settings, camera.store().as_ref());
                    }
                    _ => {}
                }
            }

            match camera.latest_display_frame() {
                Some(frame) => {
                    if let Err(e) = self.render_frame(&frame) {
                        warn!("Failed to render frame {}: {}", frame.sequence, e);
                    }
                }
                None => self.render_idle(),
            }
            self.update_title(&camera.status_line())?;
        }

        Ok(())
    }
}

/// Maps a key to a settings edit and persists the edited field
fn apply_key(key: Keycode, settings: &SettingsHandle, store: &dyn SettingsStore) {
    let (edit, persist_key): (fn(&mut DesiredSettings), &str) = match key {
        Keycode::B => (|s| s.binning = if s.binning == 0 { 1 } else { 0 }, KEY_BINNING),
        Keycode::Up => (|s| s.exposure_us *= EXPOSURE_STEP, KEY_EXPOSURE),
        Keycode::Down => (|s| s.exposure_us /= EXPOSURE_STEP, KEY_EXPOSURE),
        Keycode::Left => (
            |s| s.balance_ratio = (s.balance_ratio - BALANCE_STEP).max(0.0),
            KEY_BALANCE_RATIO,
        ),
        Keycode::Right => (|s| s.balance_ratio += BALANCE_STEP, KEY_BALANCE_RATIO),
        Keycode::L => (|s| s.log_level = s.log_level.next(), KEY_LOG_LEVEL),
        Keycode::P => (
            |s| {
                s.pixel_format = Some(s.pixel_format.map_or(PixelFormat::Mono8, PixelFormat::next))
            },
            KEY_PIXEL_FORMAT,
        ),
        _ => return,
    };

    settings.update(edit);
    let current = settings.get();
    debug!(?current, "Settings edited");
    current.persist(store, &[persist_key]);
}
