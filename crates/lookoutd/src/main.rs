use anyhow::{Context, Result};
use lookout_core::{build_extractor, EmbeddingStore, MatchEngine};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod photos;
mod registry;

use config::{BusKind, Config};
use dbus_interface::{RegistryService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("lookoutd starting");

    let config = Config::load().context("loading configuration")?;
    tracing::info!(
        db = %config.db_path.display(),
        photos = %config.photo_dir.display(),
        backend = ?config.backend,
        metric = ?config.metric,
        threshold = config.threshold,
        "configuration loaded"
    );

    // Fail fast: store, photo directory and models must all be usable before
    // the bus name is claimed.
    let store = Arc::new(
        EmbeddingStore::open(&config.db_path, config.dimension())
            .with_context(|| format!("opening store {}", config.db_path.display()))?,
    );
    tracing::info!(persons = store.len()?, "store opened");

    let photos = photos::PhotoStore::open(&config.photo_dir)
        .with_context(|| format!("creating photo dir {}", config.photo_dir.display()))?;
    tracing::debug!(dir = %photos.dir().display(), "photo store ready");

    let extractor = build_extractor(config.backend, &config.model_dir)
        .with_context(|| format!("loading {:?} extractor", config.backend))?;
    let engine = engine::spawn_engine(extractor)?;
    anyhow::ensure!(
        engine.dimension() == store.dimension(),
        "extractor produces {}-dim embeddings but the store holds {}",
        engine.dimension(),
        store.dimension()
    );

    let registry = registry::Registry::new(
        Arc::clone(&store),
        photos,
        engine,
        MatchEngine::new(config.metric),
        config.threshold,
    );

    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, RegistryService::new(registry))?
        .build()
        .await
        .context("registering on D-Bus")?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "lookoutd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("lookoutd shutting down");

    Ok(())
}
