use std::sync::Arc;

use serde::Serialize;

use crate::{
    blocking,
    error::Result,
    filter::Filter,
    metadata_store::MetadataStore,
    vector_index::VectorIndex,
};

/// Result of deleting one document. An unknown id is an ordinary outcome,
/// not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeleteOutcome {
    Deleted { id: String, chunks_removed: usize },
    NotFound { id: String },
}

impl DeleteOutcome {
    pub fn is_deleted(&self) -> bool {
        matches!(self, DeleteOutcome::Deleted { .. })
    }

    pub fn message(&self) -> String {
        match self {
            DeleteOutcome::Deleted { id, .. } => format!("Deleted document {id}"),
            DeleteOutcome::NotFound { id } => format!("Document {id} not found"),
        }
    }
}

pub struct DeletionPipeline {
    metadata: Arc<MetadataStore>,
    index: Arc<VectorIndex>,
}

impl DeletionPipeline {
    pub fn new(metadata: Arc<MetadataStore>, index: Arc<VectorIndex>) -> Self {
        Self { metadata, index }
    }

    /// Remove the metadata row first; the index is only touched when a row
    /// actually existed.
    pub async fn delete(&self, id: &str) -> Result<DeleteOutcome> {
        let metadata = Arc::clone(&self.metadata);
        let doc_id = id.to_string();
        let removed = blocking::run(move || metadata.delete_by_id(&doc_id)).await?;

        if removed == 0 {
            tracing::debug!(id, "delete of unknown document");
            return Ok(DeleteOutcome::NotFound { id: id.to_string() });
        }

        let chunks_removed = self
            .index
            .delete_where(&Filter::DocumentId(id.to_string()))
            .await?;
        self.index.persist().await?;

        tracing::info!(id, chunks = chunks_removed, "deleted document");
        Ok(DeleteOutcome::Deleted {
            id: id.to_string(),
            chunks_removed,
        })
    }
}

impl std::fmt::Debug for DeletionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeletionPipeline").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        embedding::HashingEmbedder,
        filter::ChunkMetadata,
        resilience::CallPolicy,
        vector_index::NewChunk,
    };

    async fn setup() -> (tempfile::TempDir, Arc<MetadataStore>, Arc<VectorIndex>)
    {
        let tmp = tempfile::tempdir().unwrap();
        let metadata =
            Arc::new(MetadataStore::open(&tmp.path().join("m.redb")).unwrap());
        let index = Arc::new(
            VectorIndex::open(
                &tmp.path().join("v.redb"),
                Arc::new(HashingEmbedder::new(16)),
                CallPolicy::default(),
            )
            .unwrap(),
        );

        for (id, name) in [("doc-a", "a.md"), ("doc-b", "b.md")] {
            metadata.create(id, name).unwrap();
            metadata.mark_committed(id).unwrap();
            index
                .add_chunks(vec![
                    NewChunk {
                        text: format!("{name} first"),
                        metadata: ChunkMetadata {
                            document_id: id.into(),
                            filename: name.into(),
                        },
                    },
                    NewChunk {
                        text: format!("{name} second"),
                        metadata: ChunkMetadata {
                            document_id: id.into(),
                            filename: name.into(),
                        },
                    },
                ])
                .await
                .unwrap();
        }
        index.persist().await.unwrap();
        (tmp, metadata, index)
    }

    #[tokio::test]
    async fn delete_removes_row_and_chunks() {
        let (_tmp, metadata, index) = setup().await;
        let pipeline = DeletionPipeline::new(metadata.clone(), index.clone());

        let outcome = pipeline.delete("doc-a").await.unwrap();
        assert_eq!(
            outcome,
            DeleteOutcome::Deleted {
                id: "doc-a".into(),
                chunks_removed: 2
            }
        );
        assert!(metadata.get("doc-a").unwrap().is_none());
        assert_eq!(index.count(&Filter::DocumentId("doc-a".into())).await, 0);
        assert_eq!(index.len().await, 2);
        assert_eq!(index.pending_writes().await, 0);
    }

    #[tokio::test]
    async fn second_delete_is_not_found() {
        let (_tmp, metadata, index) = setup().await;
        let pipeline = DeletionPipeline::new(metadata, index.clone());

        assert!(pipeline.delete("doc-b").await.unwrap().is_deleted());
        let again = pipeline.delete("doc-b").await.unwrap();
        assert_eq!(again, DeleteOutcome::NotFound { id: "doc-b".into() });
        assert_eq!(index.len().await, 2);
    }

    #[tokio::test]
    async fn unknown_id_leaves_index_untouched() {
        let (_tmp, metadata, index) = setup().await;
        let pipeline = DeletionPipeline::new(metadata, index.clone());

        let outcome = pipeline.delete("missing").await.unwrap();
        assert!(!outcome.is_deleted());
        assert_eq!(index.len().await, 4);
        assert_eq!(outcome.message(), "Document missing not found");
    }
}
