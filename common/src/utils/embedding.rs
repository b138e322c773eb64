use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    path::PathBuf,
    str::FromStr,
    sync::Arc,
};

use anyhow::{anyhow, Context, Result};
use async_openai::{types::CreateEmbeddingRequestArgs, Client};
use fastembed::{EmbeddingModel, ModelTrait, TextEmbedding, TextInitOptions};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{error::AppError, utils::config::EmbeddingSettings};

/// Deserialized through `FromStr`, so config files and the environment accept the same aliases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum EmbeddingBackend {
    OpenAI,
    #[default]
    FastEmbed,
    Hashed,
}

impl FromStr for EmbeddingBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "hashed" => Ok(Self::Hashed),
            "fastembed" | "fast-embed" | "fast" => Ok(Self::FastEmbed),
            other => Err(anyhow!(
                "unknown embedding backend '{other}'. Expected 'openai', 'hashed', or 'fastembed'."
            )),
        }
    }
}

impl TryFrom<String> for EmbeddingBackend {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Text-to-vector function shared by indexing and querying.
#[derive(Clone)]
pub struct EmbeddingProvider {
    inner: EmbeddingInner,
    batch_size: usize,
}

#[derive(Clone)]
enum EmbeddingInner {
    OpenAI {
        client: Arc<Client<async_openai::config::OpenAIConfig>>,
        model: String,
        dimensions: u32,
    },
    Hashed {
        dimension: usize,
    },
    FastEmbed {
        model: Arc<Mutex<TextEmbedding>>,
        model_name: EmbeddingModel,
        dimension: usize,
    },
}

impl EmbeddingProvider {
    /// Builds the provider selected by `embedding.backend`.
    pub async fn from_settings(settings: &EmbeddingSettings) -> Result<Self, AppError> {
        let provider = match settings.backend {
            EmbeddingBackend::Hashed => Self::new_hashed(settings.dimension)?,
            EmbeddingBackend::FastEmbed => {
                Self::new_fastembed(
                    settings.model_name.clone(),
                    settings.cache_dir.as_ref().map(PathBuf::from),
                    settings.show_download_progress,
                )
                .await?
            }
            EmbeddingBackend::OpenAI => {
                let api_key = settings.openai_api_key.as_deref().ok_or_else(|| {
                    AppError::Validation("missing OpenAI API key for embeddings".into())
                })?;
                let client = Arc::new(Client::with_config(
                    async_openai::config::OpenAIConfig::new()
                        .with_api_key(api_key)
                        .with_api_base(&settings.openai_base_url),
                ));
                let model = settings
                    .model_name
                    .clone()
                    .unwrap_or_else(|| "text-embedding-3-small".to_string());
                let dimensions = u32::try_from(settings.dimension).map_err(|_| {
                    AppError::Validation(format!(
                        "embedding dimension {} is out of range",
                        settings.dimension
                    ))
                })?;
                Self::new_openai(client, model, dimensions)
            }
        };

        info!(
            backend = provider.backend_label(),
            model = provider.model_code().as_deref().unwrap_or("none"),
            dimension = provider.dimension(),
            batch_size = settings.batch_size,
            "Embedding provider ready"
        );

        Ok(provider.with_batch_size(settings.batch_size))
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn backend_label(&self) -> &'static str {
        match self.inner {
            EmbeddingInner::Hashed { .. } => "hashed",
            EmbeddingInner::FastEmbed { .. } => "fastembed",
            EmbeddingInner::OpenAI { .. } => "openai",
        }
    }

    pub fn dimension(&self) -> usize {
        match &self.inner {
            EmbeddingInner::Hashed { dimension } => *dimension,
            EmbeddingInner::FastEmbed { dimension, .. } => *dimension,
            EmbeddingInner::OpenAI { dimensions, .. } => *dimensions as usize,
        }
    }

    pub fn model_code(&self) -> Option<String> {
        match &self.inner {
            EmbeddingInner::FastEmbed { model_name, .. } => Some(model_name.to_string()),
            EmbeddingInner::OpenAI { model, .. } => Some(model.clone()),
            EmbeddingInner::Hashed { .. } => None,
        }
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError> {
        self.embed_batch(vec![text.to_owned()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AppError::Embedding("embedding backend returned no vector".into()))
    }

    /// Embeds `texts` in order, sending at most `batch_size` texts to the backend at a time.
    pub async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, AppError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let expected = texts.len();
        let embeddings = self
            .embed_inner(texts)
            .await
            .map_err(|err| AppError::Embedding(format!("{err:#}")))?;

        if embeddings.len() != expected {
            return Err(AppError::Embedding(format!(
                "expected {expected} embeddings, backend returned {}",
                embeddings.len()
            )));
        }

        debug!(count = expected, backend = self.backend_label(), "Embedded texts");
        Ok(embeddings)
    }

    async fn embed_inner(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        match &self.inner {
            EmbeddingInner::Hashed { dimension } => Ok(texts
                .into_iter()
                .map(|text| hashed_embedding(&text, *dimension))
                .collect()),
            EmbeddingInner::FastEmbed { model, .. } => {
                let mut guard = model.lock().await;
                guard
                    .embed(texts, Some(self.batch_size))
                    .context("generating fastembed batch embeddings")
            }
            EmbeddingInner::OpenAI {
                client,
                model,
                dimensions,
            } => {
                let mut embeddings = Vec::with_capacity(texts.len());
                for batch in texts.chunks(self.batch_size) {
                    let request = CreateEmbeddingRequestArgs::default()
                        .model(model.clone())
                        .input(batch.to_vec())
                        .dimensions(*dimensions)
                        .build()?;

                    let response = client.embeddings().create(request).await?;
                    embeddings.extend(response.data.into_iter().map(|item| item.embedding));
                }
                Ok(embeddings)
            }
        }
    }

    pub fn new_openai(
        client: Arc<Client<async_openai::config::OpenAIConfig>>,
        model: String,
        dimensions: u32,
    ) -> Self {
        EmbeddingProvider {
            inner: EmbeddingInner::OpenAI {
                client,
                model,
                dimensions,
            },
            batch_size: 1,
        }
    }

    pub async fn new_fastembed(
        model_override: Option<String>,
        cache_dir: Option<PathBuf>,
        show_download_progress: bool,
    ) -> Result<Self, AppError> {
        let model_name = if let Some(code) = model_override {
            EmbeddingModel::from_str(&code)
                .map_err(|err| AppError::Validation(format!("unknown embedding model: {err}")))?
        } else {
            EmbeddingModel::default()
        };

        let mut options = TextInitOptions::new(model_name.clone())
            .with_show_download_progress(show_download_progress);
        if let Some(dir) = cache_dir {
            options = options.with_cache_dir(dir);
        }
        let model_name_for_task = model_name.clone();
        let model_name_code = model_name.to_string();

        let (model, dimension) = tokio::task::spawn_blocking(move || -> Result<_> {
            let model =
                TextEmbedding::try_new(options).context("initialising FastEmbed text model")?;
            let info = EmbeddingModel::get_model_info(&model_name_for_task)
                .ok_or_else(|| anyhow!("FastEmbed model metadata missing for {model_name_code}"))?;
            Ok((model, info.dim))
        })
        .await
        .map_err(|err| AppError::InternalError(format!("joining FastEmbed initialisation: {err}")))??;

        Ok(EmbeddingProvider {
            inner: EmbeddingInner::FastEmbed {
                model: Arc::new(Mutex::new(model)),
                model_name,
                dimension,
            },
            batch_size: 1,
        })
    }

    pub fn new_hashed(dimension: usize) -> Result<Self, AppError> {
        Ok(EmbeddingProvider {
            inner: EmbeddingInner::Hashed {
                dimension: dimension.max(1),
            },
            batch_size: 1,
        })
    }
}

// Helper functions for hashed embeddings
fn hashed_embedding(text: &str, dimension: usize) -> Vec<f32> {
    let dim = dimension.max(1);
    let mut vector = vec![0.0f32; dim];
    if text.is_empty() {
        return vector;
    }

    let mut token_count = 0f32;
    for token in tokens(text) {
        token_count += 1.0;
        let idx = bucket(&token, dim);
        vector[idx] += 1.0;
    }

    if token_count == 0.0 {
        return vector;
    }

    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in &mut vector {
            *value /= norm;
        }
    }

    vector
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(|token| token.to_ascii_lowercase())
}

fn bucket(token: &str, dimension: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    token.hash(&mut hasher);
    (hasher.finish() as usize) % dimension
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hashed_embeddings_are_deterministic_and_normalized() {
        let provider = EmbeddingProvider::new_hashed(16)
            .expect("hashed provider")
            .with_batch_size(2);

        let first = provider.embed("Date of birth").await.expect("embed");
        let second = provider.embed("date of BIRTH").await.expect("embed");
        assert_eq!(first, second);
        assert_eq!(first.len(), 16);

        let norm: f32 = first.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn batch_embedding_preserves_order() {
        let provider = EmbeddingProvider::new_hashed(32).expect("hashed provider");
        let texts = vec![
            "participant age".to_string(),
            "systolic blood pressure".to_string(),
            String::new(),
        ];

        let batch = provider.embed_batch(texts.clone()).await.expect("batch");
        assert_eq!(batch.len(), 3);
        for (text, vector) in texts.iter().zip(&batch) {
            assert_eq!(&provider.embed(text).await.expect("single"), vector);
        }
        assert!(batch[2].iter().all(|v| *v == 0.0));
    }

    #[test]
    fn backend_parses_aliases() {
        assert_eq!(
            "fast-embed".parse::<EmbeddingBackend>().unwrap(),
            EmbeddingBackend::FastEmbed
        );
        assert_eq!(
            "OpenAI".parse::<EmbeddingBackend>().unwrap(),
            EmbeddingBackend::OpenAI
        );
        assert!("sbert".parse::<EmbeddingBackend>().is_err());
    }

    #[test]
    fn settings_accept_backend_aliases() {
        let settings: EmbeddingSettings =
            serde_yaml::from_str("backend: fast-embed\ndimension: 8\n").expect("alias");
        assert_eq!(settings.backend, EmbeddingBackend::FastEmbed);

        let settings: EmbeddingSettings =
            serde_yaml::from_str("backend: OpenAI\n").expect("mixed case");
        assert_eq!(settings.backend, EmbeddingBackend::OpenAI);

        let err = serde_yaml::from_str::<EmbeddingSettings>("backend: sbert\n")
            .expect_err("unknown backend");
        assert!(err.to_string().contains("sbert"));

        let written = serde_yaml::to_string(&EmbeddingBackend::FastEmbed).expect("serialize");
        assert_eq!(written.trim(), "fastembed");
    }
}
