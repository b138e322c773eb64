mod state;

use std::{collections::HashSet, sync::Arc};

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            collection_info::CollectionInfo,
            retrievable_unit::{Metadata, ScoredUnit},
        },
    },
    utils::embedding::EmbeddingProvider,
};
use state_machines::core::GuardError;
use tracing::{debug, instrument, warn};

use crate::reranking::{RerankScore, Reranker};

use self::state::{idle, Idle, QueryMachine, Ranked, Reranking, Retrieving};

/// A reference unit proposed for a query, with its retrieval and rerank scores kept apart.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateMatch {
    pub id: String,
    pub text: String,
    pub metadata: Metadata,
    /// `1 - distance` from the vector search; only a cosine similarity for cosine collections.
    pub similarity: f32,
    /// Cross-encoder relevance.
    pub rerank_score: f32,
    /// 1-based position after reranking.
    pub rank: usize,
}

/// Retrieval plus rerank over a single field's collection.
pub struct QueryEngine {
    db: Arc<SurrealDbClient>,
    embedding: Arc<EmbeddingProvider>,
    reranker: Arc<dyn Reranker>,
    collection: CollectionInfo,
    similarity_top_k: usize,
    rerank_top_n: usize,
}

struct QueryContext<'q> {
    query: &'q str,
    hits: Vec<ScoredUnit>,
    scores: Vec<RerankScore>,
}

impl QueryEngine {
    pub fn new(
        db: Arc<SurrealDbClient>,
        embedding: Arc<EmbeddingProvider>,
        reranker: Arc<dyn Reranker>,
        collection: CollectionInfo,
        similarity_top_k: usize,
        rerank_top_n: usize,
    ) -> Self {
        Self {
            db,
            embedding,
            reranker,
            collection,
            similarity_top_k,
            rerank_top_n,
        }
    }

    /// Field the engine answers for.
    pub fn field(&self) -> &str {
        &self.collection.name
    }

    pub fn collection(&self) -> &CollectionInfo {
        &self.collection
    }

    /// Ranked candidates for `text`, at most `rerank_top_n` of them.
    #[instrument(level = "trace", skip_all, fields(field = %self.collection.name))]
    pub async fn query(&self, text: &str) -> Result<Vec<CandidateMatch>, AppError> {
        let mut ctx = QueryContext {
            query: text,
            hits: Vec::new(),
            scores: Vec::new(),
        };

        let machine = self.retrieve(idle(), &mut ctx).await?;
        let machine = self.rerank(machine, &mut ctx).await?;
        let (_machine, candidates) = Self::rank(machine, ctx, self.rerank_top_n)?;

        debug!(
            field = %self.collection.name,
            candidates = candidates.len(),
            "query ranked"
        );
        Ok(candidates)
    }

    async fn retrieve(
        &self,
        machine: QueryMachine<(), Idle>,
        ctx: &mut QueryContext<'_>,
    ) -> Result<QueryMachine<(), Retrieving>, AppError> {
        let machine = machine
            .retrieve()
            .map_err(|(_, guard)| map_guard_error("retrieve", &guard))?;

        let embedding = self.embedding.embed(ctx.query).await?;
        ctx.hits = self
            .db
            .query_collection(&self.collection, embedding, self.similarity_top_k)
            .await?;

        Ok(machine)
    }

    async fn rerank(
        &self,
        machine: QueryMachine<(), Retrieving>,
        ctx: &mut QueryContext<'_>,
    ) -> Result<QueryMachine<(), Reranking>, AppError> {
        let machine = machine
            .rerank()
            .map_err(|(_, guard)| map_guard_error("rerank", &guard))?;

        if ctx.hits.is_empty() {
            debug!(field = %self.collection.name, "no retrieval hits; skipping rerank");
            return Ok(machine);
        }

        let documents = ctx.hits.iter().map(|hit| hit.text.clone()).collect();
        ctx.scores = self.reranker.rerank(ctx.query, documents).await?;

        Ok(machine)
    }

    fn rank(
        machine: QueryMachine<(), Reranking>,
        ctx: QueryContext<'_>,
        top_n: usize,
    ) -> Result<(QueryMachine<(), Ranked>, Vec<CandidateMatch>), AppError> {
        let machine = machine
            .rank()
            .map_err(|(_, guard)| map_guard_error("rank", &guard))?;

        let QueryContext {
            hits, mut scores, ..
        } = ctx;
        scores.sort_by(|a, b| b.score.total_cmp(&a.score));

        let mut used = HashSet::new();
        let mut candidates = Vec::with_capacity(top_n.min(hits.len()));
        for score in scores {
            if candidates.len() == top_n {
                break;
            }
            let Some(hit) = hits.get(score.index) else {
                warn!(
                    index = score.index,
                    hits = hits.len(),
                    "reranker returned an index outside the retrieved set"
                );
                continue;
            };
            if !used.insert(score.index) {
                continue;
            }

            candidates.push(CandidateMatch {
                id: hit.id.clone(),
                text: hit.text.clone(),
                metadata: hit.metadata.clone(),
                similarity: hit.similarity(),
                rerank_score: score.score,
                rank: candidates.len() + 1,
            });
        }

        Ok((machine, candidates))
    }
}

fn map_guard_error(event: &str, guard: &GuardError) -> AppError {
    AppError::InternalError(format!(
        "invalid query transition during {event}: {guard:?}"
    ))
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;

    /// Scores documents by their position, so the last retrieved document ranks first.
    #[derive(Default)]
    pub struct PositionReranker {
        pub calls: Mutex<Vec<String>>,
        pub extra_index: Option<usize>,
    }

    #[async_trait]
    impl Reranker for PositionReranker {
        async fn rerank(
            &self,
            query: &str,
            documents: Vec<String>,
        ) -> Result<Vec<RerankScore>, AppError> {
            self.calls
                .lock()
                .expect("calls lock")
                .push(query.to_string());

            let mut scores: Vec<RerankScore> = (0..documents.len())
                .map(|index| RerankScore {
                    index,
                    score: index as f32 + 1.0,
                })
                .collect();
            if let Some(index) = self.extra_index {
                scores.push(RerankScore {
                    index,
                    score: 100.0,
                });
            }
            scores.sort_by(|a, b| b.score.total_cmp(&a.score));
            Ok(scores)
        }

        fn model_name(&self) -> String {
            "position".into()
        }
    }
}
