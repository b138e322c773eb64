#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod differ;
pub mod documents;
pub mod indexer;
pub mod pipeline;

pub use differ::{diff_collection, CollectionDiff};
pub use indexer::{AddReport, CollectionIndexer};
pub use pipeline::{FieldReport, IndexPipeline, IndexRunMode, IndexRunReport};
