mod context;
mod stages;
mod state;

use std::{
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use common::{
    error::AppError,
    storage::db::SurrealDbClient,
    utils::{config::AppConfig, embedding::EmbeddingProvider},
};
use serde::Serialize;
use tracing::info;

use self::{
    context::IndexRunContext,
    stages::{complete, index_fields, load_dictionary},
    state::ready,
};

/// Which index run to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexRunMode {
    /// Build collections from `index.filepath_input`.
    Setup,
    /// Apply `index.filepath_update` to existing collections.
    Update,
}

impl IndexRunMode {
    pub fn label(self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::Update => "update",
        }
    }

    /// File name of the configuration snapshot written after the run.
    pub fn snapshot_file(self) -> &'static str {
        match self {
            Self::Setup => "config_index.yaml",
            Self::Update => "config_update.yaml",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldReport {
    pub field: String,
    pub collection: String,
    pub records: usize,
    pub added: usize,
    pub updated: usize,
    pub total_units: usize,
}

/// Values derived by an index run, recorded in its snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct IndexRunReport {
    pub mode: IndexRunMode,
    pub input: PathBuf,
    pub records: usize,
    pub fields: Vec<FieldReport>,
    pub elapsed_ms: u64,
}

#[allow(clippy::module_name_repetitions)]
pub struct IndexPipeline {
    db: Arc<SurrealDbClient>,
    embedding: Arc<EmbeddingProvider>,
    config: AppConfig,
}

impl IndexPipeline {
    pub fn new(db: Arc<SurrealDbClient>, embedding: Arc<EmbeddingProvider>, config: AppConfig) -> Self {
        Self {
            db,
            embedding,
            config,
        }
    }

    #[tracing::instrument(skip_all, fields(run = mode.label()))]
    pub async fn run(&self, mode: IndexRunMode) -> Result<IndexRunReport, AppError> {
        let mut ctx = IndexRunContext::new(
            mode,
            &self.config,
            self.db.as_ref(),
            self.embedding.as_ref(),
        );

        let started = Instant::now();
        let machine = ready();

        let stage_start = Instant::now();
        let machine = load_dictionary(machine, &mut ctx)
            .await
            .map_err(|err| ctx.abort(err))?;
        let load_ms = duration_millis(stage_start.elapsed());

        let stage_start = Instant::now();
        let machine = index_fields(machine, &mut ctx)
            .await
            .map_err(|err| ctx.abort(err))?;
        let index_ms = duration_millis(stage_start.elapsed());

        let _machine = complete(machine, &mut ctx)
            .await
            .map_err(|err| ctx.abort(err))?;

        let elapsed_ms = duration_millis(started.elapsed());
        let input = match mode {
            IndexRunMode::Setup => self.config.index.filepath_input.clone(),
            IndexRunMode::Update => self.config.index.filepath_update.clone().unwrap_or_default(),
        };
        let records = ctx.dictionary.as_ref().map_or(0, |d| d.len());

        info!(
            run = mode.label(),
            records,
            fields = ctx.fields.len(),
            total_ms = elapsed_ms,
            load_ms,
            index_ms,
            "index run finished"
        );

        Ok(IndexRunReport {
            mode,
            input,
            records,
            fields: ctx.fields,
            elapsed_ms,
        })
    }
}

/// Whole milliseconds, saturating at `u64::MAX`.
pub(crate) fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
