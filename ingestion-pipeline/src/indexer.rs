use std::time::Instant;

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            collection_info::CollectionInfo,
            retrievable_unit::{EmbeddedUnit, RetrievableUnit},
        },
    },
    utils::embedding::EmbeddingProvider,
};
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::pipeline::duration_millis;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AddReport {
    pub added: usize,
    pub batches: usize,
}

/// Embeds units and writes them into a collection.
pub struct CollectionIndexer<'a> {
    db: &'a SurrealDbClient,
    embedding: &'a EmbeddingProvider,
    max_batch_size: usize,
}

impl<'a> CollectionIndexer<'a> {
    pub fn new(db: &'a SurrealDbClient, embedding: &'a EmbeddingProvider, max_batch_size: usize) -> Self {
        Self {
            db,
            embedding,
            max_batch_size: max_batch_size.max(1),
        }
    }

    /// Adds units in batches of `max_batch_size`. Every batch is committed on its own; the
    /// first failing batch stops the run and leaves earlier batches in place.
    #[instrument(level = "debug", skip_all, fields(collection = %collection.name, units = units.len()))]
    pub async fn add(
        &self,
        units: Vec<RetrievableUnit>,
        collection: &CollectionInfo,
    ) -> Result<AddReport, AppError> {
        let mut report = AddReport::default();
        if units.is_empty() {
            return Ok(report);
        }

        let started = Instant::now();
        let total = units.len();
        let mut pending = units.into_iter().peekable();

        while pending.peek().is_some() {
            let batch: Vec<RetrievableUnit> = pending.by_ref().take(self.max_batch_size).collect();
            let embedded = self.embed_units(batch).await?;
            report.added += self.db.upsert_units(collection, embedded).await?;
            report.batches += 1;

            debug!(
                collection = %collection.name,
                batch = report.batches,
                added = report.added,
                total,
                "Committed batch"
            );
        }

        info!(
            collection = %collection.name,
            added = report.added,
            batches = report.batches,
            elapsed_ms = duration_millis(started.elapsed()),
            "Added units to collection"
        );
        Ok(report)
    }

    /// Re-embeds changed units and replaces them in one pass.
    #[instrument(level = "debug", skip_all, fields(collection = %collection.name, units = units.len()))]
    pub async fn update(
        &self,
        units: Vec<RetrievableUnit>,
        collection: &CollectionInfo,
    ) -> Result<usize, AppError> {
        if units.is_empty() {
            return Ok(0);
        }

        let embedded = self.embed_units(units).await?;
        let updated = self.db.upsert_units(collection, embedded).await?;

        info!(collection = %collection.name, updated, "Updated units in collection");
        Ok(updated)
    }

    async fn embed_units(&self, units: Vec<RetrievableUnit>) -> Result<Vec<EmbeddedUnit>, AppError> {
        let texts = units.iter().map(|unit| unit.text.clone()).collect();
        let vectors = self.embedding.embed_batch(texts).await?;

        Ok(units
            .into_iter()
            .zip(vectors)
            .map(|(unit, embedding)| EmbeddedUnit { unit, embedding })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use common::utils::config::DistanceMetric;
    use serde_json::{json, Map};
    use uuid::Uuid;

    const DIM: usize = 16;

    async fn setup() -> (SurrealDbClient, EmbeddingProvider, CollectionInfo) {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb");
        db.ensure_initialized().await.expect("init");
        let provider = EmbeddingProvider::new_hashed(DIM)
            .expect("provider")
            .with_batch_size(2);
        let collection = db
            .get_or_create_collection("title", DIM, DistanceMetric::Cosine, None)
            .await
            .expect("collection");
        (db, provider, collection)
    }

    fn unit(id: &str, text: &str) -> RetrievableUnit {
        let mut metadata = Map::new();
        metadata.insert("variable name".into(), json!(id));
        RetrievableUnit {
            id: id.into(),
            text: text.into(),
            metadata,
        }
    }

    async fn stored_ids(db: &SurrealDbClient, collection: &CollectionInfo) -> BTreeSet<String> {
        db.collection_metadata(collection)
            .await
            .expect("metadata")
            .into_iter()
            .map(|u| u.id)
            .collect()
    }

    #[tokio::test]
    async fn add_commits_in_batches() {
        let (db, provider, collection) = setup().await;
        let indexer = CollectionIndexer::new(&db, &provider, 2);

        let units = vec![
            unit("V1", "Age at visit"),
            unit("V2", "Body weight"),
            unit("V3", "Body height"),
            unit("V4", "Smoking status"),
            unit("V5", "Heart rate"),
        ];
        let report = indexer.add(units, &collection).await.expect("add");

        assert_eq!(report, AddReport { added: 5, batches: 3 });
        assert_eq!(db.count_units(&collection).await.expect("count"), 5);
    }

    #[tokio::test]
    async fn add_then_update_yields_union_without_duplicates() {
        let (db, provider, collection) = setup().await;
        let indexer = CollectionIndexer::new(&db, &provider, 10);

        indexer
            .add(vec![unit("V1", "Age"), unit("V2", "Weight")], &collection)
            .await
            .expect("initial add");
        let before = stored_ids(&db, &collection).await;

        indexer
            .add(vec![unit("V3", "Height")], &collection)
            .await
            .expect("add new");
        let updated = indexer
            .update(vec![unit("V1", "Age at enrolment")], &collection)
            .await
            .expect("update");
        assert_eq!(updated, 1);

        let after = stored_ids(&db, &collection).await;
        let expected: BTreeSet<String> = before
            .union(&BTreeSet::from(["V3".to_string()]))
            .cloned()
            .collect();
        assert_eq!(after, expected);
        assert_eq!(db.count_units(&collection).await.expect("count"), 3);

        let v1 = db
            .collection_metadata(&collection)
            .await
            .expect("metadata")
            .into_iter()
            .find(|u| u.id == "V1")
            .expect("V1 stored");
        assert_eq!(v1.text, "Age at enrolment");
    }

    #[tokio::test]
    async fn failing_batch_stops_add() {
        let (db, _, collection) = setup().await;
        let mismatched = EmbeddingProvider::new_hashed(DIM / 2).expect("provider");
        let indexer = CollectionIndexer::new(&db, &mismatched, 1);

        let err = indexer
            .add(vec![unit("V1", "Age"), unit("V2", "Weight")], &collection)
            .await
            .expect_err("dimension mismatch");
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(db.count_units(&collection).await.expect("count"), 0);
    }

    #[tokio::test]
    async fn empty_inputs_are_no_ops() {
        let (db, provider, collection) = setup().await;
        let indexer = CollectionIndexer::new(&db, &provider, 4);

        assert_eq!(
            indexer.add(Vec::new(), &collection).await.expect("add"),
            AddReport::default()
        );
        assert_eq!(indexer.update(Vec::new(), &collection).await.expect("update"), 0);
    }
}
