//! Data models for vector database operations

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Metadata attached to a stored record
pub type Metadata = Map<String, Value>;

/// The two logical collections this layer manages
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CollectionKind {
    Files,
    Folders,
}

impl CollectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionKind::Files => "files",
            CollectionKind::Folders => "folders",
        }
    }
}

impl fmt::Display for CollectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to a remote collection, valid until the server recreates its storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionHandle {
    /// Server-assigned collection id
    pub id: String,

    /// Collection name
    pub name: String,
}

/// Record stored in a collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    /// Unique identifier (file or folder id)
    pub id: String,

    /// Vector embedding
    pub vector: Vec<f32>,

    /// Associated metadata
    #[serde(default)]
    pub metadata: Metadata,

    /// Source text the embedding was computed from
    #[serde(default)]
    pub document: Option<String>,
}

impl EmbeddingRecord {
    pub fn new(id: impl Into<String>, vector: Vec<f32>) -> Self {
        Self {
            id: id.into(),
            vector,
            metadata: Metadata::new(),
            document: None,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_document(mut self, document: impl Into<String>) -> Self {
        self.document = Some(document.into());
        self
    }

    /// Vector dimensionality
    pub fn dimension(&self) -> usize {
        self.vector.len()
    }
}

/// Re-key a file record after it moved on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathUpdate {
    pub old_id: String,
    pub new_id: String,
    pub new_path: String,
    #[serde(default)]
    pub new_name: Option<String>,
}

/// Nearest-neighbour query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryParams {
    /// Query vector
    pub vector: Vec<f32>,

    /// Maximum number of results
    pub top_k: usize,

    /// Optional metadata filter in the server's `where` syntax
    pub filter: Option<Value>,
}

impl QueryParams {
    pub fn new(vector: Vec<f32>, top_k: usize) -> Self {
        Self {
            vector,
            top_k,
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: Value) -> Self {
        self.filter = Some(filter);
        self
    }
}

/// Query result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryMatch {
    /// Record ID
    pub id: String,

    /// Raw distance reported by the server
    pub distance: f32,

    /// Similarity score (`1 - distance` for cosine space)
    pub score: f32,

    #[serde(default)]
    pub metadata: Metadata,

    #[serde(default)]
    pub document: Option<String>,
}

impl QueryMatch {
    pub fn from_distance(id: String, distance: f32, metadata: Metadata, document: Option<String>) -> Self {
        Self {
            id,
            distance,
            score: 1.0 - distance,
            metadata,
            document,
        }
    }
}

/// Chroma only stores scalar metadata: nested values become JSON strings and
/// nulls are dropped.
pub fn sanitize_metadata(metadata: &Metadata) -> Metadata {
    metadata
        .iter()
        .filter_map(|(key, value)| match value {
            Value::Null => None,
            Value::String(_) | Value::Bool(_) | Value::Number(_) => Some((key.clone(), value.clone())),
            Value::Array(_) | Value::Object(_) => Some((key.clone(), Value::String(value.to_string()))),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sanitize_metadata() {
        let record = EmbeddingRecord::new("f1", vec![0.1])
            .with_metadata("path", "/a")
            .with_metadata("tags", json!(["x", "y"]))
            .with_metadata("size", 42)
            .with_metadata("missing", Value::Null);

        let clean = sanitize_metadata(&record.metadata);
        assert_eq!(clean.get("path"), Some(&json!("/a")));
        assert_eq!(clean.get("tags"), Some(&json!("[\"x\",\"y\"]")));
        assert_eq!(clean.get("size"), Some(&json!(42)));
        assert!(!clean.contains_key("missing"));
    }

    #[test]
    fn test_score_from_distance() {
        let m = QueryMatch::from_distance("a".into(), 0.25, Metadata::new(), None);
        assert!((m.score - 0.75).abs() < f32::EPSILON);
    }
}
