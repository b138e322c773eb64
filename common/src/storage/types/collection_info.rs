use crate::{stored_object, utils::config::DistanceMetric};

stored_object!(CollectionInfo, "crossmap_collection", {
    /// Field the collection was built from, e.g. `title`
    name: String,
    /// Table holding the collection's units
    table: String,
    /// Vector length enforced by the HNSW index
    dimension: usize,
    distance_metric: DistanceMetric,
    embedding_model: Option<String>
});

impl CollectionInfo {
    pub fn new(
        name: &str,
        dimension: usize,
        distance_metric: DistanceMetric,
        embedding_model: Option<String>,
    ) -> Self {
        let now = Utc::now();
        let table = collection_table_name(name);
        Self {
            id: table.clone(),
            created_at: now,
            updated_at: now,
            name: name.to_string(),
            table,
            dimension,
            distance_metric,
            embedding_model,
        }
    }
}

/// Table name for a field's collection. Anything outside `[a-z0-9_]` becomes `_`.
pub fn collection_table_name(field: &str) -> String {
    let sanitized: String = field
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("collection_{sanitized}")
}
