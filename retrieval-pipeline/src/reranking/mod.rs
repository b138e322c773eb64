use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use common::{error::AppError, utils::config::AppConfig};
use fastembed::{RerankInitOptions, TextRerank};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Relevance of one document to a query, `index` pointing into the scored documents.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RerankScore {
    pub index: usize,
    pub score: f32,
}

/// Scores (query, document) pairs jointly.
#[async_trait]
pub trait Reranker: Send + Sync {
    /// Returns scores sorted best first. May return fewer entries than documents.
    async fn rerank(&self, query: &str, documents: Vec<String>)
        -> Result<Vec<RerankScore>, AppError>;

    fn model_name(&self) -> String;
}

/// Cross-encoder backed by a fastembed `TextRerank` model.
pub struct CrossEncoderReranker {
    engine: Arc<Mutex<TextRerank>>,
    model_name: String,
    batch_size: Option<usize>,
}

impl CrossEncoderReranker {
    /// Loads the cross-encoder named by `crossmap.rerank`, downloading it on first use.
    pub async fn from_config(config: &AppConfig) -> Result<Self, AppError> {
        let options = build_rerank_init_options(config)?;
        let model_name = TextRerank::list_supported_models()
            .into_iter()
            .find(|info| info.model == options.model_name)
            .map_or_else(|| format!("{:?}", options.model_name), |info| info.model_code);
        let batch_size = config.crossmap.rerank.batch_size;

        let engine = tokio::task::spawn_blocking(move || TextRerank::try_new(options))
            .await
            .map_err(|e| AppError::InternalError(format!("joining reranker initialisation: {e}")))?
            .map_err(|e| AppError::Rerank(e.to_string()))?;

        info!(model = %model_name, "Cross-encoder ready");
        Ok(Self {
            engine: Arc::new(Mutex::new(engine)),
            model_name,
            batch_size,
        })
    }
}

#[async_trait]
impl Reranker for CrossEncoderReranker {
    async fn rerank(
        &self,
        query: &str,
        documents: Vec<String>,
    ) -> Result<Vec<RerankScore>, AppError> {
        let mut guard = self.engine.lock().await;

        let results = guard
            .rerank(query.to_owned(), documents, false, self.batch_size)
            .map_err(|e| AppError::Rerank(e.to_string()))?;

        debug!(candidates = results.len(), "Cross-encoder scored candidates");
        Ok(results
            .into_iter()
            .map(|r| RerankScore {
                index: r.index,
                score: r.score,
            })
            .collect())
    }

    fn model_name(&self) -> String {
        self.model_name.clone()
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn env_bool(key: &str) -> Option<bool> {
    env::var(key).ok().map(|value| is_truthy(&value))
}

fn build_rerank_init_options(config: &AppConfig) -> Result<RerankInitOptions, AppError> {
    let mut options = RerankInitOptions::default();

    if let Some(code) = config.crossmap.rerank.model_name.as_deref() {
        let info = TextRerank::list_supported_models()
            .into_iter()
            .find(|info| info.model_code.eq_ignore_ascii_case(code))
            .ok_or_else(|| AppError::Validation(format!("unknown rerank model: {code}")))?;
        options.model_name = info.model;
    }

    let cache_dir = config
        .embedding
        .cache_dir
        .as_ref()
        .map(PathBuf::from)
        .or_else(|| env::var("RERANKING_CACHE_DIR").ok().map(PathBuf::from))
        .or_else(|| env::var("FASTEMBED_CACHE_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(|| {
            Path::new(&config.data_dir)
                .join("fastembed")
                .join("reranker")
        });
    fs::create_dir_all(&cache_dir)?;
    options.cache_dir = cache_dir;

    options.show_download_progress = env_bool("RERANKING_SHOW_DOWNLOAD_PROGRESS")
        .or_else(|| env_bool("FASTEMBED_SHOW_DOWNLOAD_PROGRESS"))
        .unwrap_or(config.embedding.show_download_progress);

    if let Some(max_length) = config.crossmap.rerank.max_length.or_else(|| {
        env::var("RERANKING_MAX_LENGTH")
            .ok()
            .and_then(|value| value.parse().ok())
    }) {
        options.max_length = max_length;
    }

    Ok(options)
}
