pub mod curation;
mod state;

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use common::{
    error::AppError,
    storage::db::SurrealDbClient,
    utils::{config::AppConfig, data_dictionary::DataDictionary, embedding::EmbeddingProvider},
};
use serde::Serialize;
use state_machines::core::GuardError;
use tracing::{debug, error, info, instrument};

use crate::{query_engine::QueryEngine, reranking::Reranker};

use self::{
    curation::{merge_results, CurationRow, CurationTable, QueryResult},
    state::{ready, Completed, CrossmapMachine, Loaded, Queried, Ready},
};

/// File name of the configuration snapshot written next to the curation table.
pub const SNAPSHOT_FILE: &str = "config_semantic-search.yaml";

/// Values derived by a crossmap run, recorded in its snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct CrossmapReport {
    pub input: PathBuf,
    pub output: PathBuf,
    pub records: usize,
    pub rows: usize,
    pub fields: Vec<String>,
    pub collections: Vec<String>,
    pub rerank_model: String,
    pub elapsed_ms: u64,
}

/// Output path of the curation table for the configured fields.
pub fn curation_file_name(fields: &[String]) -> String {
    format!("semantic-search_{}.csv", fields.join("_"))
}

struct CrossmapContext<'a> {
    config: &'a AppConfig,
    dictionary: Option<DataDictionary>,
    engines: HashMap<String, QueryEngine>,
    rows: Vec<CurationRow>,
    output: Option<PathBuf>,
}

impl CrossmapContext<'_> {
    fn dictionary(&self) -> Result<&DataDictionary, AppError> {
        self.dictionary
            .as_ref()
            .ok_or_else(|| AppError::InternalError("query records expected to be loaded".into()))
    }

    fn abort(&mut self, err: AppError) -> AppError {
        error!(rows = self.rows.len(), error = %err, "crossmap run aborted");
        err
    }
}

/// Queries every configured field's collection with a user data dictionary and writes the
/// ranked candidates as a curation table.
pub struct CrossmapPipeline {
    db: Arc<SurrealDbClient>,
    embedding: Arc<EmbeddingProvider>,
    reranker: Arc<dyn Reranker>,
    config: AppConfig,
}

impl CrossmapPipeline {
    pub fn new(
        db: Arc<SurrealDbClient>,
        embedding: Arc<EmbeddingProvider>,
        reranker: Arc<dyn Reranker>,
        config: AppConfig,
    ) -> Self {
        Self {
            db,
            embedding,
            reranker,
            config,
        }
    }

    /// One engine per registered collection, keyed by field.
    pub async fn build_engines(&self) -> Result<HashMap<String, QueryEngine>, AppError> {
        let settings = &self.config.crossmap;
        let collections = self.db.list_collections().await?;

        let engines: HashMap<String, QueryEngine> = collections
            .into_iter()
            .map(|collection| {
                let engine = QueryEngine::new(
                    Arc::clone(&self.db),
                    Arc::clone(&self.embedding),
                    Arc::clone(&self.reranker),
                    collection,
                    settings.similarity_top_k,
                    settings.rerank.top_n,
                );
                (engine.field().to_string(), engine)
            })
            .collect();

        debug!(engines = engines.len(), "query engines ready");
        Ok(engines)
    }

    #[tracing::instrument(skip_all)]
    pub async fn run(&self) -> Result<CrossmapReport, AppError> {
        let mut ctx = CrossmapContext {
            config: &self.config,
            dictionary: None,
            engines: HashMap::new(),
            rows: Vec::new(),
            output: None,
        };

        let started = Instant::now();
        let machine = ready();

        let machine = self
            .load(machine, &mut ctx)
            .await
            .map_err(|err| ctx.abort(err))?;

        let stage_start = Instant::now();
        let machine = query_fields(machine, &mut ctx)
            .await
            .map_err(|err| ctx.abort(err))?;
        let query_ms = duration_millis(stage_start.elapsed());

        let _machine = write_table(machine, &mut ctx).map_err(|err| ctx.abort(err))?;

        let settings = &self.config.crossmap;
        let mut collections: Vec<String> = ctx
            .engines
            .values()
            .map(|engine| engine.collection().table.clone())
            .collect();
        collections.sort();

        let report = CrossmapReport {
            input: settings.filepath_input.clone(),
            output: ctx.output.take().unwrap_or_default(),
            records: ctx.dictionary.as_ref().map_or(0, DataDictionary::len),
            rows: ctx.rows.len(),
            fields: settings.columns.clone(),
            collections,
            rerank_model: self.reranker.model_name(),
            elapsed_ms: duration_millis(started.elapsed()),
        };

        info!(
            records = report.records,
            rows = report.rows,
            output = %report.output.display(),
            query_ms,
            total_ms = report.elapsed_ms,
            "crossmap run finished"
        );
        Ok(report)
    }

    #[instrument(level = "trace", skip_all)]
    async fn load(
        &self,
        machine: CrossmapMachine<(), Ready>,
        ctx: &mut CrossmapContext<'_>,
    ) -> Result<CrossmapMachine<(), Loaded>, AppError> {
        let settings = &ctx.config.crossmap;
        let dictionary =
            DataDictionary::load(&settings.filepath_input, Some(settings.metadata_columns.as_slice()))?
                .drop_missing_id(&settings.id_column)
                .drop_missing_any(&settings.columns);

        info!(
            path = %settings.filepath_input.display(),
            records = dictionary.len(),
            "crossmap input ready"
        );
        ctx.dictionary = Some(dictionary);
        ctx.engines = self.build_engines().await?;

        machine
            .load()
            .map_err(|(_, guard)| map_guard_error("load", &guard))
    }
}

#[instrument(level = "trace", skip_all)]
async fn query_fields(
    machine: CrossmapMachine<(), Loaded>,
    ctx: &mut CrossmapContext<'_>,
) -> Result<CrossmapMachine<(), Queried>, AppError> {
    let settings = &ctx.config.crossmap;
    let mut rows = Vec::new();

    for field in &settings.columns {
        let engine = ctx.engines.get(field).ok_or_else(|| {
            AppError::NotFound(format!("no collection registered for field '{field}'"))
        })?;
        let dictionary = ctx.dictionary()?;

        let mut results = Vec::new();
        for record in &dictionary.records {
            let (Some(query_id), Some(query_text)) =
                (record.get(&settings.id_column), record.get(field))
            else {
                continue;
            };

            let candidates = engine.query(query_text).await?;
            results.extend(candidates.into_iter().map(|candidate| QueryResult {
                query_id: query_id.to_string(),
                query_text: query_text.to_string(),
                candidate,
            }));
        }

        let field_rows = merge_results(&dictionary.records, field, results, &settings.id_column);
        info!(field = %field, rows = field_rows.len(), "field crossmapped");
        rows.extend(field_rows);
    }

    ctx.rows = rows;

    machine
        .query()
        .map_err(|(_, guard)| map_guard_error("query", &guard))
}

#[instrument(level = "trace", skip_all)]
fn write_table(
    machine: CrossmapMachine<(), Queried>,
    ctx: &mut CrossmapContext<'_>,
) -> Result<CrossmapMachine<(), Completed>, AppError> {
    let settings = &ctx.config.crossmap;
    let headers = ctx.dictionary()?.headers.clone();

    let mut table = CurationTable::new(headers, &settings.id_column, std::mem::take(&mut ctx.rows));
    table.sort();

    let path = ctx
        .config
        .curation_output_dir()
        .join(curation_file_name(&settings.columns));
    table.write_csv(&path)?;
    info!(path = %path.display(), rows = table.len(), "curation table written");

    ctx.rows = table.rows;
    ctx.output = Some(path);

    machine
        .write()
        .map_err(|(_, guard)| map_guard_error("write", &guard))
}

fn map_guard_error(event: &str, guard: &GuardError) -> AppError {
    AppError::InternalError(format!(
        "invalid crossmap transition during {event}: {guard:?}"
    ))
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
