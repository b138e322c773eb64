use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            collection_info::{collection_table_name, CollectionInfo},
            retrievable_unit::{EmbeddedUnit, Metadata, RetrievableUnit, ScoredUnit},
        },
    },
    utils::config::DistanceMetric,
};

/// Smallest candidate list explored by the HNSW search. Larger `k` widen it.
const KNN_EF: usize = 40;

/// HNSW returns at most `ef` candidates, so the list must outgrow `k`.
fn search_width(k: usize) -> usize {
    k.saturating_mul(2).max(KNN_EF)
}

#[derive(Serialize)]
struct UnitRow {
    id: String,
    text: String,
    metadata: Metadata,
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct CountRow {
    total: usize,
}

impl SurrealDbClient {
    /// Registered collections, ordered by name.
    pub async fn list_collections(&self) -> Result<Vec<CollectionInfo>, AppError> {
        let mut collections = self.get_all_stored_items::<CollectionInfo>().await?;
        collections.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(collections)
    }

    pub async fn get_collection(&self, name: &str) -> Result<Option<CollectionInfo>, AppError> {
        Ok(self
            .get_item::<CollectionInfo>(&collection_table_name(name))
            .await?)
    }

    /// Returns the collection for `name`, creating its table and HNSW index on first use.
    #[instrument(level = "debug", skip(self), fields(collection = %name))]
    pub async fn get_or_create_collection(
        &self,
        name: &str,
        dimension: usize,
        distance_metric: DistanceMetric,
        embedding_model: Option<String>,
    ) -> Result<CollectionInfo, AppError> {
        if let Some(existing) = self.get_collection(name).await? {
            if existing.dimension != dimension {
                return Err(AppError::Validation(format!(
                    "collection '{name}' stores {}-dimensional vectors, embedding provider produces {dimension}",
                    existing.dimension
                )));
            }
            debug!(table = %existing.table, "Using existing collection");
            return Ok(existing);
        }

        let info = CollectionInfo::new(name, dimension, distance_metric, embedding_model);
        let query = format!(
            "BEGIN TRANSACTION;
             DEFINE TABLE IF NOT EXISTS {table} SCHEMALESS;
             DEFINE INDEX IF NOT EXISTS idx_{table}_embedding ON TABLE {table} FIELDS embedding HNSW DIMENSION {dimension} DIST {metric};
             COMMIT TRANSACTION;",
            table = info.table,
            metric = distance_metric.surreal_keyword(),
        );
        self.client.query(query).await?.check()?;

        let stored = self
            .store_item(info.clone())
            .await?
            .ok_or_else(|| AppError::InternalError(format!("registering collection '{name}'")))?;

        info!(
            table = %stored.table,
            dimension,
            metric = ?distance_metric,
            "Created collection"
        );
        Ok(stored)
    }

    /// Identity, text and metadata of every unit in the collection.
    pub async fn collection_metadata(
        &self,
        collection: &CollectionInfo,
    ) -> Result<Vec<RetrievableUnit>, AppError> {
        let query = format!(
            "SELECT meta::id(id) AS id, text, metadata FROM {}",
            collection.table
        );
        let units: Vec<RetrievableUnit> = self.client.query(query).await?.take(0)?;
        Ok(units)
    }

    /// Inserts or replaces units keyed by identity in one transaction.
    pub async fn upsert_units(
        &self,
        collection: &CollectionInfo,
        units: Vec<EmbeddedUnit>,
    ) -> Result<usize, AppError> {
        if units.is_empty() {
            return Ok(0);
        }

        if let Some(bad) = units
            .iter()
            .find(|u| u.embedding.len() != collection.dimension)
        {
            return Err(AppError::Validation(format!(
                "unit '{}' has a {}-dimensional vector, collection '{}' expects {}",
                bad.unit.id,
                bad.embedding.len(),
                collection.name,
                collection.dimension
            )));
        }

        let rows: Vec<UnitRow> = units
            .into_iter()
            .map(|u| UnitRow {
                id: u.unit.id,
                text: u.unit.text,
                metadata: u.unit.metadata,
                embedding: u.embedding,
            })
            .collect();
        let count = rows.len();

        self.client
            .query(
                "BEGIN TRANSACTION;
                 FOR $unit IN $units {
                     UPSERT type::thing($table, $unit.id) CONTENT {
                         text: $unit.text,
                         metadata: $unit.metadata,
                         embedding: $unit.embedding,
                         updated_at: time::now()
                     };
                 };
                 COMMIT TRANSACTION;",
            )
            .bind(("table", collection.table.clone()))
            .bind(("units", rows))
            .await?
            .check()?;

        debug!(collection = %collection.name, count, "Upserted units");
        Ok(count)
    }

    /// The `k` nearest units to `embedding`, closest first.
    pub async fn query_collection(
        &self,
        collection: &CollectionInfo,
        embedding: Vec<f32>,
        k: usize,
    ) -> Result<Vec<ScoredUnit>, AppError> {
        if k == 0 {
            return Ok(Vec::new());
        }
        if embedding.len() != collection.dimension {
            return Err(AppError::Validation(format!(
                "query vector has {} dimensions, collection '{}' expects {}",
                embedding.len(),
                collection.name,
                collection.dimension
            )));
        }

        let query = format!(
            "SELECT meta::id(id) AS id, text, metadata, vector::distance::knn() AS distance \
             FROM {table} WHERE embedding <|{k},{ef}|> $embedding ORDER BY distance",
            table = collection.table,
            ef = search_width(k),
        );

        let hits: Vec<ScoredUnit> = self
            .client
            .query(query)
            .bind(("embedding", embedding))
            .await?
            .take(0)?;
        Ok(hits)
    }

    pub async fn count_units(&self, collection: &CollectionInfo) -> Result<usize, AppError> {
        let query = format!(
            "SELECT count() AS total FROM {} GROUP ALL",
            collection.table
        );
        let rows: Vec<CountRow> = self.client.query(query).await?.take(0)?;
        Ok(rows.first().map_or(0, |row| row.total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::embedding::EmbeddingProvider;
    use serde_json::json;
    use uuid::Uuid;

    async fn setup_db() -> SurrealDbClient {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb");
        db.ensure_initialized().await.expect("init");
        db
    }

    async fn embedded(provider: &EmbeddingProvider, id: &str, text: &str) -> EmbeddedUnit {
        let mut metadata = Metadata::new();
        metadata.insert("variable name".into(), json!(id));
        metadata.insert("last change date".into(), json!("2024-01-01"));
        EmbeddedUnit {
            unit: RetrievableUnit {
                id: id.to_string(),
                text: text.to_string(),
                metadata,
            },
            embedding: provider.embed(text).await.expect("embed"),
        }
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent_and_checks_dimension() {
        let db = setup_db().await;

        let first = db
            .get_or_create_collection("title", 8, DistanceMetric::Cosine, None)
            .await
            .expect("create");
        let second = db
            .get_or_create_collection("title", 8, DistanceMetric::Cosine, None)
            .await
            .expect("reuse");
        assert_eq!(first.table, second.table);
        assert_eq!(db.list_collections().await.expect("list").len(), 1);

        let err = db
            .get_or_create_collection("title", 16, DistanceMetric::Cosine, None)
            .await
            .expect_err("dimension mismatch");
        assert!(matches!(err, AppError::Validation(_)));

        assert!(db.get_collection("definition").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn upsert_replaces_by_identity() {
        let db = setup_db().await;
        let provider = EmbeddingProvider::new_hashed(8).expect("provider");
        let collection = db
            .get_or_create_collection("title", 8, DistanceMetric::Cosine, None)
            .await
            .expect("create");

        let units = vec![
            embedded(&provider, "V1", "Age at visit").await,
            embedded(&provider, "V2", "Body weight").await,
        ];
        assert_eq!(db.upsert_units(&collection, units).await.expect("upsert"), 2);

        let replacement = vec![embedded(&provider, "V1", "Age at enrolment").await];
        db.upsert_units(&collection, replacement)
            .await
            .expect("upsert again");

        assert_eq!(db.count_units(&collection).await.expect("count"), 2);

        let mut stored = db.collection_metadata(&collection).await.expect("metadata");
        stored.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(stored[0].id, "V1");
        assert_eq!(stored[0].text, "Age at enrolment");
        assert_eq!(stored[0].metadata_str("last change date"), Some("2024-01-01"));
    }

    #[tokio::test]
    async fn upsert_rejects_wrong_dimension() {
        let db = setup_db().await;
        let provider = EmbeddingProvider::new_hashed(4).expect("provider");
        let collection = db
            .get_or_create_collection("title", 8, DistanceMetric::Cosine, None)
            .await
            .expect("create");

        let err = db
            .upsert_units(&collection, vec![embedded(&provider, "V1", "Age").await])
            .await
            .expect_err("wrong dimension");
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(db.count_units(&collection).await.expect("count"), 0);
    }

    #[tokio::test]
    async fn query_returns_nearest_first() {
        let db = setup_db().await;
        let provider = EmbeddingProvider::new_hashed(32).expect("provider");
        let collection = db
            .get_or_create_collection("title", 32, DistanceMetric::Cosine, None)
            .await
            .expect("create");

        let units = vec![
            embedded(&provider, "V1", "Age at visit").await,
            embedded(&provider, "V2", "Systolic blood pressure").await,
            embedded(&provider, "V3", "Smoking status").await,
        ];
        db.upsert_units(&collection, units).await.expect("upsert");

        let query = provider.embed("Systolic blood pressure").await.expect("embed");
        let hits = db
            .query_collection(&collection, query, 2)
            .await
            .expect("query");

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "V2");
        assert!((hits[0].similarity() - 1.0).abs() < 1e-4);
        assert!(hits[0].similarity() >= hits[1].similarity());
        assert_eq!(hits[0].metadata_str("variable name"), Some("V2"));
    }

    #[tokio::test]
    async fn query_returns_k_hits_beyond_default_search_width() {
        let db = setup_db().await;
        let provider = EmbeddingProvider::new_hashed(32).expect("provider");
        let collection = db
            .get_or_create_collection("title", 32, DistanceMetric::Cosine, None)
            .await
            .expect("create");

        let mut units = Vec::new();
        for i in 0..80 {
            let text = format!("variable {i} measured at visit {}", i % 7);
            units.push(embedded(&provider, &format!("V{i}"), &text).await);
        }
        db.upsert_units(&collection, units).await.expect("upsert");

        for k in [10, KNN_EF, 50, 70] {
            let query = provider.embed("variable measured at visit").await.expect("embed");
            let hits = db
                .query_collection(&collection, query, k)
                .await
                .expect("query");
            assert_eq!(hits.len(), k, "k = {k}");
        }
    }

    #[test]
    fn search_width_never_drops_below_k() {
        assert_eq!(search_width(1), KNN_EF);
        assert!(search_width(70) >= 70);
        assert_eq!(search_width(usize::MAX), usize::MAX);
    }

    #[tokio::test]
    async fn empty_collection_counts_zero_and_returns_no_hits() {
        let db = setup_db().await;
        let provider = EmbeddingProvider::new_hashed(8).expect("provider");
        let collection = db
            .get_or_create_collection("definition", 8, DistanceMetric::Euclidean, None)
            .await
            .expect("create");

        assert_eq!(db.count_units(&collection).await.expect("count"), 0);
        let query = provider.embed("anything").await.expect("embed");
        let hits = db
            .query_collection(&collection, query, 5)
            .await
            .expect("query");
        assert!(hits.is_empty());
    }
}
