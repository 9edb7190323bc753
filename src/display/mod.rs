#[allow(clippy::module_inception)]
pub mod display;

pub use display::Sdl2Display;
