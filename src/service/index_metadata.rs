//! Embedding index metadata file, written when a collection's dimension is first fixed

use crate::error::Result;
use crate::persist::write_json_atomic;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexMetadata {
    pub model: String,
    pub dims: usize,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl IndexMetadata {
    pub fn new(model: impl Into<String>, dims: usize) -> Self {
        Self {
            model: model.into(),
            dims,
            updated_at: Utc::now(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

pub async fn write_index_metadata(path: &Path, metadata: &IndexMetadata) -> Result<()> {
    write_json_atomic(path, metadata).await?;
    info!(
        "Recorded embedding index metadata: model={} dims={} at {}",
        metadata.model,
        metadata.dims,
        path.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[tokio::test]
    async fn test_written_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");

        let metadata = IndexMetadata::new("nomic-embed-text", 768).with_source("folder_embeddings");
        write_index_metadata(&path, &metadata).await.unwrap();

        let value: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(value["model"], "nomic-embed-text");
        assert_eq!(value["dims"], 768);
        assert_eq!(value["source"], "folder_embeddings");
        assert!(value["updatedAt"].is_string());
    }
}
