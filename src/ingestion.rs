use std::{io::Write, path::PathBuf, sync::Arc};

use serde::Serialize;

use crate::{
    blocking,
    chunking::Chunker,
    data_dir::STAGED_UPLOAD_PREFIX,
    doc_id::DocumentId,
    error::{Error, Result},
    filter::{ChunkMetadata, Filter},
    metadata_store::{DocumentStatus, MetadataStore},
    vector_index::{NewChunk, VectorIndex},
};

pub const INGEST_MESSAGE: &str = "Ingest successfully!";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub id: String,
    pub filename: String,
    pub chunk_count: usize,
    pub status: DocumentStatus,
    pub message: String,
}

/// Registers an upload, chunks it and indexes the chunks.
///
/// The metadata row is written as `pending` before any chunk exists and is
/// flipped to `committed` once the index has been persisted, so a crash in
/// between leaves a row the reconciler can recognise.
pub struct IngestionPipeline {
    metadata: Arc<MetadataStore>,
    index: Arc<VectorIndex>,
    chunker: Arc<dyn Chunker>,
    staging_dir: PathBuf,
    max_upload_bytes: usize,
}

impl IngestionPipeline {
    pub fn new(
        metadata: Arc<MetadataStore>,
        index: Arc<VectorIndex>,
        chunker: Arc<dyn Chunker>,
        staging_dir: PathBuf,
        max_upload_bytes: usize,
    ) -> Self {
        Self {
            metadata,
            index,
            chunker,
            staging_dir,
            max_upload_bytes,
        }
    }

    pub async fn ingest(
        &self,
        filename: &str,
        bytes: Vec<u8>,
    ) -> Result<IngestReport> {
        let filename = display_filename(filename)?;
        if bytes.is_empty() {
            return Err(Error::Validation(format!("'{filename}' is empty")));
        }
        if bytes.len() > self.max_upload_bytes {
            return Err(Error::Validation(format!(
                "'{filename}' is {} bytes, the limit is {}",
                bytes.len(),
                self.max_upload_bytes
            )));
        }

        let id = DocumentId::generate();

        let metadata = Arc::clone(&self.metadata);
        let (doc_id, name) = (id.to_string(), filename.clone());
        blocking::run(move || metadata.create(&doc_id, &name)).await?;
        tracing::debug!(id = %id, filename = %filename, "registered document");

        let chunker = Arc::clone(&self.chunker);
        let staging_dir = self.staging_dir.clone();
        let suffix = extension_suffix(&filename);
        let chunked = blocking::run(move || {
            stage_and_chunk(&staging_dir, &suffix, &bytes, &*chunker)
        })
        .await
        .and_then(|texts| {
            if texts.is_empty() {
                Err(Error::Ingest(format!(
                    "'{filename}' contains no text to index"
                )))
            } else {
                Ok(texts)
            }
        });
        let texts = match chunked {
            Ok(texts) => texts,
            Err(e) => {
                // Nothing reached the index yet, so the row can go now.
                self.forget_record(id.as_str()).await;
                return Err(e);
            }
        };

        let chunks: Vec<NewChunk> = texts
            .into_iter()
            .map(|text| NewChunk {
                text,
                metadata: ChunkMetadata {
                    document_id: id.to_string(),
                    filename: filename.clone(),
                },
            })
            .collect();

        let chunk_count = match self.index_chunks(chunks).await {
            Ok(count) => count,
            Err(e) => {
                self.discard_chunks(id.as_str()).await;
                return Err(e);
            }
        };

        let metadata = Arc::clone(&self.metadata);
        let doc_id = id.to_string();
        let committed =
            blocking::run(move || metadata.mark_committed(&doc_id)).await?;
        if !committed {
            // A delete or reset removed the row while the chunks were being
            // indexed.
            self.discard_chunks(id.as_str()).await;
            return Err(Error::Ingest(format!(
                "'{filename}' was removed while it was being indexed"
            )));
        }

        tracing::info!(
            id = %id,
            filename = %filename,
            chunks = chunk_count,
            "ingested document"
        );

        Ok(IngestReport {
            id: id.into_string(),
            filename,
            chunk_count,
            status: DocumentStatus::Committed,
            message: INGEST_MESSAGE.to_string(),
        })
    }

    async fn index_chunks(&self, chunks: Vec<NewChunk>) -> Result<usize> {
        let added = self.index.add_chunks(chunks).await?;
        self.index.persist().await?;
        Ok(added)
    }

    /// Drop whatever part of a failed upload reached the working set. The
    /// `pending` row stays behind for the reconciler.
    async fn discard_chunks(&self, id: &str) {
        let filter = Filter::DocumentId(id.to_string());
        let result = match self.index.delete_where(&filter).await {
            Ok(0) => Ok(()),
            Ok(_) => self.index.persist().await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::warn!(
                id,
                error = %e,
                "could not discard chunks of failed upload"
            );
        }
    }

    async fn forget_record(&self, id: &str) {
        let metadata = Arc::clone(&self.metadata);
        let doc_id = id.to_string();
        let removed =
            blocking::run(move || metadata.delete_by_id(&doc_id)).await;
        if let Err(e) = removed {
            tracing::warn!(id, error = %e, "could not remove rejected upload");
        }
    }
}

impl std::fmt::Debug for IngestionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionPipeline")
            .field("staging_dir", &self.staging_dir)
            .field("max_upload_bytes", &self.max_upload_bytes)
            .finish_non_exhaustive()
    }
}

/// Reduce a client-supplied name to its last path component.
///
/// Both `/` and `\` count as separators since uploads can come from any OS.
pub fn display_filename(raw: &str) -> Result<String> {
    let name = raw
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    if name.is_empty() || name == "." || name == ".." {
        return Err(Error::Validation(format!("invalid filename '{raw}'")));
    }
    Ok(name.to_string())
}

/// `.ext` of `filename`, kept on the staged copy so chunkers can dispatch
/// on it. Empty when there is no usable extension.
fn extension_suffix(filename: &str) -> String {
    std::path::Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
        .unwrap_or_default()
}

/// Write `bytes` to a unique staging file and chunk it. The file is removed
/// when this returns, on success or failure.
fn stage_and_chunk(
    staging_dir: &std::path::Path,
    suffix: &str,
    bytes: &[u8],
    chunker: &dyn Chunker,
) -> Result<Vec<String>> {
    let mut staged = tempfile::Builder::new()
        .prefix(STAGED_UPLOAD_PREFIX)
        .suffix(suffix)
        .tempfile_in(staging_dir)?;
    staged.write_all(bytes)?;
    staged.flush()?;
    chunker.chunk_file(staged.path())
}
