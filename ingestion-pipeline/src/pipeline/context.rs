use common::{
    error::AppError,
    storage::db::SurrealDbClient,
    utils::{config::AppConfig, data_dictionary::DataDictionary, embedding::EmbeddingProvider},
};
use tracing::error;

use super::{FieldReport, IndexRunMode};

pub struct IndexRunContext<'a> {
    pub mode: IndexRunMode,
    pub config: &'a AppConfig,
    pub db: &'a SurrealDbClient,
    pub embedding: &'a EmbeddingProvider,
    pub dictionary: Option<DataDictionary>,
    pub fields: Vec<FieldReport>,
}

impl<'a> IndexRunContext<'a> {
    pub fn new(
        mode: IndexRunMode,
        config: &'a AppConfig,
        db: &'a SurrealDbClient,
        embedding: &'a EmbeddingProvider,
    ) -> Self {
        Self {
            mode,
            config,
            db,
            embedding,
            dictionary: None,
            fields: Vec::new(),
        }
    }

    pub fn dictionary(&self) -> Result<&DataDictionary, AppError> {
        self.dictionary
            .as_ref()
            .ok_or_else(|| AppError::InternalError("data dictionary expected to be loaded".into()))
    }

    pub fn abort(&mut self, err: AppError) -> AppError {
        error!(
            run = self.mode.label(),
            fields_done = self.fields.len(),
            error = %err,
            "index run aborted"
        );
        err
    }
}
