use std::sync::Arc;

use serde::Serialize;

use crate::{
    blocking,
    error::Result,
    metadata_store::MetadataStore,
    session::TopicSessions,
    vector_index::VectorIndex,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResetReport {
    pub documents_removed: usize,
    pub chunks_removed: usize,
}

/// Wipes every document, every chunk and all conversation topics.
pub struct ResetOperation {
    metadata: Arc<MetadataStore>,
    index: Arc<VectorIndex>,
    sessions: Arc<TopicSessions>,
}

impl ResetOperation {
    pub fn new(
        metadata: Arc<MetadataStore>,
        index: Arc<VectorIndex>,
        sessions: Arc<TopicSessions>,
    ) -> Self {
        Self {
            metadata,
            index,
            sessions,
        }
    }

    pub async fn reset(&self) -> Result<ResetReport> {
        let metadata = Arc::clone(&self.metadata);
        let documents_removed = blocking::run(move || metadata.delete_all()).await?;

        let chunks_removed = self.index.clear().await?;
        self.index.persist().await?;
        self.sessions.clear();

        tracing::info!(
            documents = documents_removed,
            chunks = chunks_removed,
            "reset all documents"
        );
        Ok(ResetReport {
            documents_removed,
            chunks_removed,
        })
    }
}

impl std::fmt::Debug for ResetOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResetOperation").finish_non_exhaustive()
    }
}
