#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod crossmap;
pub mod query_engine;
pub mod reranking;

pub use crossmap::{
    curation::{CurationRow, CurationTable, QueryResult},
    curation_file_name, CrossmapPipeline, CrossmapReport,
};
pub use query_engine::{CandidateMatch, QueryEngine};
pub use reranking::{CrossEncoderReranker, RerankScore, Reranker};
