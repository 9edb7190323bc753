//! Argus camera viewer with SDL2

use std::path::PathBuf;
use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use argus::display::Sdl2Display;
use argus::settings::{DesiredSettings, SettingsHandle, SettingsStore, TomlSettingsStore};
use argus::{build_registry, CameraFacade, Config};

fn main() -> Result<()> {
    color_eyre::install()?;

    // Optional config path as the only argument
    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.filter))?;
    let registry = tracing_subscriber::registry().with(filter).with(
        tracing_subscriber::fmt::layer().with_timer(tracing_subscriber::fmt::time::uptime()),
    );
    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());
    registry.init();

    info!("Argus Launching...");
    info!(backend = ?config.camera.backend, "Using camera backend");

    let store: Arc<dyn SettingsStore> =
        Arc::new(TomlSettingsStore::open(&config.camera.settings_path)?);
    let settings = SettingsHandle::new(DesiredSettings::load_from(store.as_ref()));
    let mut camera = CameraFacade::new(
        &config,
        build_registry(config.camera.backend),
        settings,
        store,
    );

    let sdl_context = sdl2::init().map_err(|e| eyre!(e))?;
    let mut app = Sdl2Display::new(&sdl_context, &config.display)?;
    let outcome = app.run(&sdl_context, &mut camera);

    info!("Argus shutting down");
    camera.shutdown();
    outcome
}
