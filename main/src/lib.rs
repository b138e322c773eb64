#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

use std::{path::PathBuf, sync::Arc};

use common::{
    error::AppError,
    storage::db::SurrealDbClient,
    utils::{
        config::{get_config, AppConfig, RunSnapshot},
        embedding::EmbeddingProvider,
    },
};
use ingestion_pipeline::{IndexPipeline, IndexRunMode};
use retrieval_pipeline::{
    crossmap::SNAPSHOT_FILE, CrossEncoderReranker, CrossmapPipeline, Reranker,
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init()
        .ok();
}

/// Loads the configuration and rejects it before any store or model is touched.
pub fn load_config() -> Result<AppConfig, AppError> {
    let config = get_config()?;
    config.validate()?;
    Ok(config)
}

/// Store connection and embedding model shared by every run.
pub struct Services {
    pub config: AppConfig,
    pub db: Arc<SurrealDbClient>,
    pub embedding: Arc<EmbeddingProvider>,
}

impl Services {
    pub async fn connect(config: AppConfig) -> Result<Self, AppError> {
        if config.surrealdb_address.starts_with("mem://") {
            warn!("surrealdb_address is in-memory; collections are lost when the process exits");
        }

        let db = Arc::new(SurrealDbClient::from_config(&config).await?);
        let embedding = Arc::new(EmbeddingProvider::from_settings(&config.embedding).await?);

        Ok(Self {
            config,
            db,
            embedding,
        })
    }

    /// Builds or refreshes the collections, then writes the run snapshot.
    pub async fn index(&self, mode: IndexRunMode) -> Result<PathBuf, AppError> {
        let pipeline = IndexPipeline::new(
            Arc::clone(&self.db),
            Arc::clone(&self.embedding),
            self.config.clone(),
        );
        let report = pipeline.run(mode).await?;

        let snapshot = RunSnapshot::new(mode.label(), &self.config, report);
        snapshot.save(&self.config.index_output_dir(), mode.snapshot_file())
    }

    /// Crossmaps the user dictionary with `reranker`, then writes the snapshot next to the table.
    pub async fn crossmap(&self, reranker: Arc<dyn Reranker>) -> Result<PathBuf, AppError> {
        let pipeline = CrossmapPipeline::new(
            Arc::clone(&self.db),
            Arc::clone(&self.embedding),
            reranker,
            self.config.clone(),
        );
        let report = pipeline.run().await?;
        info!(output = %report.output.display(), rows = report.rows, "curation table ready");

        let snapshot = RunSnapshot::new("crossmap", &self.config, report);
        snapshot.save(&self.config.curation_output_dir(), SNAPSHOT_FILE)
    }

    /// Crossmap with the configured cross-encoder.
    pub async fn crossmap_with_cross_encoder(&self) -> Result<PathBuf, AppError> {
        let reranker = CrossEncoderReranker::from_config(&self.config).await?;
        self.crossmap(Arc::new(reranker)).await
    }
}

/// Shared body of the index binaries.
pub async fn run_index(mode: IndexRunMode) -> anyhow::Result<()> {
    let config = load_config()?;
    let services = Services::connect(config).await?;
    let snapshot = services.index(mode).await?;
    info!(run = mode.label(), snapshot = %snapshot.display(), "index run complete");
    Ok(())
}
