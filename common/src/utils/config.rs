use std::{
    env, fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, SecondsFormat, Utc};
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{error::AppError, utils::embedding::EmbeddingBackend};

/// Environment variable pointing at an explicit configuration file.
pub const CONFIG_PATH_ENV: &str = "CROSSMAP_CONFIG";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    #[default]
    Cosine,
    Euclidean,
    Manhattan,
}

impl DistanceMetric {
    /// Keyword used in SurrealDB HNSW index definitions.
    pub fn surreal_keyword(self) -> &'static str {
        match self {
            Self::Cosine => "COSINE",
            Self::Euclidean => "EUCLIDEAN",
            Self::Manhattan => "MANHATTAN",
        }
    }
}

#[derive(Clone, Deserialize, Serialize, Debug)]
pub struct AppConfig {
    #[serde(default = "default_surrealdb_address")]
    pub surrealdb_address: String,
    #[serde(default)]
    pub surrealdb_username: Option<String>,
    #[serde(default, skip_serializing)]
    pub surrealdb_password: Option<String>,
    #[serde(default = "default_namespace")]
    pub surrealdb_namespace: String,
    #[serde(default = "default_database")]
    pub surrealdb_database: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub embedding: EmbeddingSettings,
    pub index: IndexSettings,
    pub crossmap: CrossmapSettings,
}

#[derive(Clone, Deserialize, Serialize, Debug)]
pub struct EmbeddingSettings {
    #[serde(default)]
    pub backend: EmbeddingBackend,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default = "default_embed_batch_size")]
    pub batch_size: usize,
    /// Vector length for the hashed and OpenAI backends; fastembed reports its own.
    #[serde(default = "default_dimension")]
    pub dimension: usize,
    #[serde(default, skip_serializing)]
    pub openai_api_key: Option<String>,
    #[serde(default = "default_base_url")]
    pub openai_base_url: String,
    #[serde(default)]
    pub cache_dir: Option<String>,
    #[serde(default = "default_true")]
    pub show_download_progress: bool,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            backend: EmbeddingBackend::default(),
            model_name: None,
            batch_size: default_embed_batch_size(),
            dimension: default_dimension(),
            openai_api_key: None,
            openai_base_url: default_base_url(),
            cache_dir: None,
            show_download_progress: true,
        }
    }
}

/// Settings for building and refreshing the reference collections.
#[derive(Clone, Deserialize, Serialize, Debug)]
pub struct IndexSettings {
    pub filepath_input: PathBuf,
    #[serde(default)]
    pub filepath_update: Option<PathBuf>,
    #[serde(default = "default_id_column")]
    pub id_column: String,
    pub columns: Vec<String>,
    pub metadata_columns: Vec<String>,
    #[serde(default = "default_last_change_column")]
    pub last_change_column: String,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default)]
    pub distance_metric: DistanceMetric,
}

/// Settings for querying the collections with a user data dictionary.
#[derive(Clone, Deserialize, Serialize, Debug)]
pub struct CrossmapSettings {
    pub filepath_input: PathBuf,
    pub directory_output: PathBuf,
    #[serde(default = "default_id_column")]
    pub id_column: String,
    pub columns: Vec<String>,
    pub metadata_columns: Vec<String>,
    #[serde(default = "default_similarity_top_k")]
    pub similarity_top_k: usize,
    #[serde(default)]
    pub rerank: RerankSettings,
}

#[derive(Clone, Deserialize, Serialize, Debug)]
pub struct RerankSettings {
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default = "default_top_n")]
    pub top_n: usize,
    #[serde(default)]
    pub max_length: Option<usize>,
    #[serde(default)]
    pub batch_size: Option<usize>,
}

impl Default for RerankSettings {
    fn default() -> Self {
        Self {
            model_name: None,
            top_n: default_top_n(),
            max_length: None,
            batch_size: None,
        }
    }
}

fn default_surrealdb_address() -> String {
    "mem://".to_string()
}

fn default_namespace() -> String {
    "crossmap".to_string()
}

fn default_database() -> String {
    "data_dictionary".to_string()
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_id_column() -> String {
    "variable name".to_string()
}

fn default_last_change_column() -> String {
    "last change date".to_string()
}

const fn default_embed_batch_size() -> usize {
    32
}

const fn default_dimension() -> usize {
    384
}

const fn default_max_batch_size() -> usize {
    256
}

const fn default_similarity_top_k() -> usize {
    10
}

const fn default_top_n() -> usize {
    5
}

const fn default_true() -> bool {
    true
}

impl AppConfig {
    /// Checks everything that can be checked before touching the store or the models.
    pub fn validate(&self) -> Result<(), AppError> {
        match (&self.surrealdb_username, &self.surrealdb_password) {
            (Some(_), None) | (None, Some(_)) => {
                return Err(AppError::Validation(
                    "surrealdb_username and surrealdb_password must be set together".into(),
                ))
            }
            _ => {}
        }

        if self.embedding.backend == EmbeddingBackend::OpenAI
            && self
                .embedding
                .openai_api_key
                .as_deref()
                .map_or(true, str::is_empty)
        {
            return Err(AppError::Validation(
                "embedding.openai_api_key (or OPENAI_API_KEY) is required for the openai backend"
                    .into(),
            ));
        }

        if self.embedding.batch_size == 0 {
            return Err(AppError::Validation(
                "embedding.batch_size must be greater than zero".into(),
            ));
        }
        if self.index.max_batch_size == 0 {
            return Err(AppError::Validation(
                "index.max_batch_size must be greater than zero".into(),
            ));
        }
        if self.crossmap.similarity_top_k == 0 {
            return Err(AppError::Validation(
                "crossmap.similarity_top_k must be greater than zero".into(),
            ));
        }
        if self.crossmap.rerank.top_n == 0 {
            return Err(AppError::Validation(
                "crossmap.rerank.top_n must be greater than zero".into(),
            ));
        }

        validate_columns(
            "index",
            &self.index.id_column,
            &self.index.columns,
            &self.index.metadata_columns,
        )?;
        if !self
            .index
            .metadata_columns
            .iter()
            .any(|c| c == &self.index.last_change_column)
        {
            return Err(AppError::Validation(format!(
                "index.metadata_columns must include the last change column '{}'",
                self.index.last_change_column
            )));
        }
        validate_columns(
            "crossmap",
            &self.crossmap.id_column,
            &self.crossmap.columns,
            &self.crossmap.metadata_columns,
        )?;

        Ok(())
    }

    /// Directory holding index run snapshots.
    pub fn index_output_dir(&self) -> PathBuf {
        Path::new(&self.data_dir).join("index")
    }

    /// Directory the crossmap run writes its curation table into.
    pub fn curation_output_dir(&self) -> PathBuf {
        self.crossmap.directory_output.join("curation")
    }
}

fn validate_columns(
    section: &str,
    id_column: &str,
    columns: &[String],
    metadata_columns: &[String],
) -> Result<(), AppError> {
    if columns.is_empty() {
        return Err(AppError::Validation(format!(
            "{section}.columns must name at least one field"
        )));
    }
    if !metadata_columns.iter().any(|c| c == id_column) {
        return Err(AppError::Validation(format!(
            "{section}.metadata_columns must include the id column '{id_column}'"
        )));
    }
    Ok(())
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let file = env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| "config".to_string());
    let config = Config::builder()
        .add_source(File::with_name(&file).required(false))
        .add_source(
            Environment::with_prefix("CROSSMAP")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    let mut app_config: AppConfig = config.try_deserialize()?;
    if app_config.embedding.openai_api_key.is_none() {
        app_config.embedding.openai_api_key = env::var("OPENAI_API_KEY").ok();
    }

    Ok(app_config)
}

/// Configuration of a finished run plus the values the run derived, persisted next to its outputs.
#[derive(Debug, Serialize)]
pub struct RunSnapshot<'a, D: Serialize> {
    pub run: &'a str,
    pub completed_at: String,
    pub config: &'a AppConfig,
    pub derived: D,
}

impl<'a, D: Serialize> RunSnapshot<'a, D> {
    pub fn new(run: &'a str, config: &'a AppConfig, derived: D) -> Self {
        Self::at(run, config, derived, Utc::now())
    }

    pub fn at(run: &'a str, config: &'a AppConfig, derived: D, completed_at: DateTime<Utc>) -> Self {
        Self {
            run,
            completed_at: completed_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            config,
            derived,
        }
    }

    /// Writes the snapshot as YAML to `dir/file_name`, creating `dir` when needed.
    pub fn save(&self, dir: &Path, file_name: &str) -> Result<PathBuf, AppError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(file_name);
        let yaml = serde_yaml::to_string(self)?;
        fs::write(&path, yaml)?;
        info!(path = %path.display(), run = self.run, "Saved run configuration snapshot");
        Ok(path)
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod test_support {
    use super::*;

    pub fn sample_config() -> AppConfig {
        AppConfig {
            surrealdb_address: default_surrealdb_address(),
            surrealdb_username: None,
            surrealdb_password: None,
            surrealdb_namespace: default_namespace(),
            surrealdb_database: default_database(),
            data_dir: default_data_dir(),
            embedding: EmbeddingSettings {
                backend: EmbeddingBackend::Hashed,
                dimension: 8,
                ..EmbeddingSettings::default()
            },
            index: IndexSettings {
                filepath_input: PathBuf::from("reference.csv"),
                filepath_update: None,
                id_column: default_id_column(),
                columns: vec!["title".into(), "definition".into()],
                metadata_columns: vec![
                    "variable name".into(),
                    "title".into(),
                    "definition".into(),
                    "last change date".into(),
                ],
                last_change_column: default_last_change_column(),
                max_batch_size: 2,
                distance_metric: DistanceMetric::Cosine,
            },
            crossmap: CrossmapSettings {
                filepath_input: PathBuf::from("user.csv"),
                directory_output: PathBuf::from("out"),
                id_column: default_id_column(),
                columns: vec!["title".into()],
                metadata_columns: vec!["variable name".into(), "title".into()],
                similarity_top_k: 3,
                rerank: RerankSettings::default(),
            },
        }
    }
}
