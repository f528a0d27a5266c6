use std::sync::Arc;

use anyhow::{Context, Result};
use likeness_core::{DescriptorExtractor, PixelExtractor, ScrfdDetector};
use likeness_store::SqliteStore;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod pipeline;

use config::Config;
use dbus_interface::{LikenessService, BUS_NAME, OBJECT_PATH};
use pipeline::{Collaborators, Pipeline};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("likenessd starting");

    let config = Config::load().context("loading configuration")?;
    tracing::info!(
        db = %config.db_path.display(),
        models = %config.model_dir.display(),
        threshold = config.similarity_threshold,
        max_jobs = config.max_concurrent_jobs,
        "configuration loaded"
    );

    let store = Arc::new(SqliteStore::open(&config.db_path).context("opening database")?);

    let model_path = config.scrfd_model_path();
    let detector = ScrfdDetector::load(&model_path)
        .with_context(|| format!("loading face detector from {model_path}"))?;
    tracing::info!(path = %model_path, "SCRFD detector loaded");
    let extractor: Arc<dyn DescriptorExtractor> = Arc::new(PixelExtractor::new(detector));

    let pipeline = Pipeline::new(
        Collaborators::shared(store.clone()),
        extractor,
        config.pipeline_config(),
    );
    let service = LikenessService::new(store, pipeline, model_path);

    let _conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering on the session bus")?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "likenessd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("likenessd shutting down");

    Ok(())
}
