use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Flat metadata object carried by every unit.
pub type Metadata = Map<String, Value>;

/// One field value of one data dictionary row, identified by the row's id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievableUnit {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl RetrievableUnit {
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}

/// A unit with its vector, ready to be written to a collection.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedUnit {
    pub unit: RetrievableUnit,
    pub embedding: Vec<f32>,
}

/// A unit returned by a nearest-neighbour query.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScoredUnit {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub distance: f32,
}

impl ScoredUnit {
    /// `1 - distance`. A cosine similarity for cosine collections; for euclidean and
    /// manhattan collections it is the raw transform, unbounded below, still ordered so
    /// that higher is closer.
    pub fn similarity(&self) -> f32 {
        1.0 - self.distance
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}
