use std::{path::Path, sync::Arc};

use serde::Serialize;

use crate::{
    answerer::{Answerer, ChatAnswerer, ExtractiveAnswerer},
    blocking,
    chunking::Chunker,
    data_dir::DataDir,
    deletion::{DeleteOutcome, DeletionPipeline},
    embedding::{Embedder, HashingEmbedder, HttpEmbedder},
    error::{Error, Result},
    ingestion::{IngestReport, IngestionPipeline},
    metadata_store::{DocumentRecord, DocumentStatus, MetadataStore},
    openai::OpenAiClient,
    query::{ChatAnswer, QueryPipeline},
    reconcile::{ReconcileReport, Reconciler},
    reset::{ResetOperation, ResetReport},
    session::TopicSessions,
    settings::{AnswererBackend, EmbedderBackend, Settings},
    vector_index::VectorIndex,
};

/// The pluggable collaborators a service is built from.
pub struct Components {
    pub chunker: Arc<dyn Chunker>,
    pub embedder: Arc<dyn Embedder>,
    pub answerer: Arc<dyn Answerer>,
}

impl Components {
    /// Backends selected by `settings`.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let embedder: Arc<dyn Embedder> = match settings.embedder_backend {
            EmbedderBackend::Hashing => {
                Arc::new(HashingEmbedder::new(settings.embedder_dimension))
            }
            EmbedderBackend::OpenAi => {
                let client = OpenAiClient::new(
                    "embedder",
                    &settings.embedder_base_url,
                    settings.api_key.clone(),
                )?;
                Arc::new(HttpEmbedder::new(client, &settings.embedder_model))
            }
        };

        let answerer: Arc<dyn Answerer> = match settings.answerer_backend {
            AnswererBackend::Extractive => Arc::new(ExtractiveAnswerer),
            AnswererBackend::OpenAi => {
                let client = OpenAiClient::new(
                    "answerer",
                    &settings.answerer_base_url,
                    settings.api_key.clone(),
                )?;
                Arc::new(ChatAnswerer::new(client, &settings.answerer_model))
            }
        };

        Ok(Self {
            chunker: Arc::new(settings.splitter()),
            embedder,
            answerer,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub data_dir: String,
    pub documents: usize,
    pub committed: usize,
    pub pending: usize,
    pub chunks: usize,
    pub unsaved_changes: usize,
    pub dimension: Option<usize>,
    pub embedder: String,
    pub answerer: String,
}

/// Entry point shared by the CLI, the HTTP API and the MCP server.
pub struct DocService {
    data_dir: DataDir,
    settings: Settings,
    metadata: Arc<MetadataStore>,
    index: Arc<VectorIndex>,
    answerer_name: String,
    ingestion: IngestionPipeline,
    deletion: DeletionPipeline,
    query: QueryPipeline,
    reset: ResetOperation,
    reconciler: Arc<Reconciler>,
}

impl DocService {
    /// Open the stores in `data_dir` and build backends from the resolved
    /// settings.
    pub fn open(data_dir: DataDir) -> Result<Self> {
        let metadata = MetadataStore::open(&data_dir.metadata_db())?;
        let settings = Settings::resolve(&metadata)?;
        let components = Components::from_settings(&settings)?;
        Self::assemble(data_dir, metadata, settings, components)
    }

    /// Open the stores in `data_dir` with explicit collaborators.
    pub fn with_components(
        data_dir: DataDir,
        settings: Settings,
        components: Components,
    ) -> Result<Self> {
        let metadata = MetadataStore::open(&data_dir.metadata_db())?;
        Self::assemble(data_dir, metadata, settings, components)
    }

    fn assemble(
        data_dir: DataDir,
        metadata: MetadataStore,
        settings: Settings,
        components: Components,
    ) -> Result<Self> {
        // The stores are open, so no other process is staging uploads.
        data_dir.sweep_staging()?;

        let metadata = Arc::new(metadata);
        let policy = settings.call_policy();
        let index = Arc::new(VectorIndex::open(
            &data_dir.vectors_db(),
            components.embedder,
            policy,
        )?);
        let sessions =
            Arc::new(TopicSessions::with_capacity(settings.max_sessions));
        let answerer_name = components.answerer.model_name().to_string();

        let ingestion = IngestionPipeline::new(
            Arc::clone(&metadata),
            Arc::clone(&index),
            components.chunker,
            data_dir.staging_dir()?,
            settings.max_upload_bytes,
        );
        let deletion = DeletionPipeline::new(Arc::clone(&metadata), Arc::clone(&index));
        let query = QueryPipeline::new(
            Arc::clone(&metadata),
            Arc::clone(&index),
            components.answerer,
            Arc::clone(&sessions),
            policy,
        )
        .with_search_window(settings.search_k, settings.search_fetch_k);
        let reset = ResetOperation::new(
            Arc::clone(&metadata),
            Arc::clone(&index),
            Arc::clone(&sessions),
        );
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&metadata),
            Arc::clone(&index),
            settings.reconcile_grace,
        ));

        Ok(Self {
            data_dir,
            settings,
            metadata,
            index,
            answerer_name,
            ingestion,
            deletion,
            query,
            reset,
            reconciler,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn data_dir(&self) -> &DataDir {
        &self.data_dir
    }

    pub fn reconciler(&self) -> Arc<Reconciler> {
        Arc::clone(&self.reconciler)
    }

    pub async fn ingest(&self, filename: &str, bytes: Vec<u8>) -> Result<IngestReport> {
        self.ingestion.ingest(filename, bytes).await
    }

    /// Ingest a file from the local filesystem under its own name.
    pub async fn ingest_path(&self, path: &Path) -> Result<IngestReport> {
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                Error::Validation(format!("invalid file path: {}", path.display()))
            })?
            .to_string();
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound {
                    kind: "file",
                    name: path.display().to_string(),
                }
            } else {
                Error::Io(e)
            }
        })?;
        self.ingest(&filename, bytes).await
    }

    /// Every registered document, oldest first.
    pub async fn list(&self) -> Result<Vec<DocumentRecord>> {
        let metadata = Arc::clone(&self.metadata);
        blocking::run(move || metadata.list()).await
    }

    pub async fn delete(&self, id: &str) -> Result<DeleteOutcome> {
        self.deletion.delete(id).await
    }

    pub async fn reset(&self) -> Result<ResetReport> {
        self.reset.reset().await
    }

    pub async fn chat(&self, query: &str, session: Option<&str>) -> Result<ChatAnswer> {
        self.query.chat(query, session).await
    }

    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        self.reconciler.run().await
    }

    pub async fn status(&self) -> Result<StatusReport> {
        let records = self.list().await?;
        let committed = records
            .iter()
            .filter(|r| r.status == DocumentStatus::Committed)
            .count();

        Ok(StatusReport {
            data_dir: self.data_dir.root().display().to_string(),
            documents: records.len(),
            committed,
            pending: records.len() - committed,
            chunks: self.index.len().await,
            unsaved_changes: self.index.pending_writes().await,
            dimension: self.index.dimension().await,
            embedder: self.index.embedder_name().to_string(),
            answerer: self.answerer_name.clone(),
        })
    }
}

impl std::fmt::Debug for DocService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocService")
            .field("data_dir", &self.data_dir)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_service(tmp: &tempfile::TempDir) -> DocService {
        let data_dir = DataDir::resolve(Some(tmp.path())).unwrap();
        DocService::with_components(
            data_dir,
            Settings::default(),
            Components::from_settings(&Settings::default()).unwrap(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn offline_defaults_answer_from_documents() {
        let tmp = tempfile::tempdir().unwrap();
        let service = open_service(&tmp);

        service
            .ingest(
                "refund-policy.md",
                b"Refunds are issued within thirty days of purchase.".to_vec(),
            )
            .await
            .unwrap();
        service
            .ingest("shipping.md", b"Orders ship within two days.".to_vec())
            .await
            .unwrap();

        let answer = service
            .chat("What is the refund policy?", None)
            .await
            .unwrap();
        assert_eq!(answer.sources, vec!["refund-policy.md"]);
        assert!(answer.answer.contains("thirty days"));
    }

    #[test]
    fn opening_clears_leftover_staged_uploads() {
        let tmp = tempfile::tempdir().unwrap();
        let staging = tmp.path().join("staging");
        std::fs::create_dir_all(&staging).unwrap();
        std::fs::write(staging.join("upload-crashed.md"), "half").unwrap();

        let _service = open_service(&tmp);
        assert_eq!(std::fs::read_dir(&staging).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn ingest_path_uses_file_name() {
        let tmp = tempfile::tempdir().unwrap();
        let service = open_service(&tmp);
        let file = tmp.path().join("notes.txt");
        std::fs::write(&file, "some notes").unwrap();

        let report = service.ingest_path(&file).await.unwrap();
        assert_eq!(report.filename, "notes.txt");

        let missing = service
            .ingest_path(&tmp.path().join("missing.txt"))
            .await
            .unwrap_err();
        assert!(matches!(missing, Error::NotFound { kind: "file", .. }));
    }

    #[tokio::test]
    async fn status_counts_documents_and_chunks() {
        let tmp = tempfile::tempdir().unwrap();
        let service = open_service(&tmp);
        service.ingest("a.md", b"alpha".to_vec()).await.unwrap();

        let status = service.status().await.unwrap();
        assert_eq!(status.documents, 1);
        assert_eq!(status.committed, 1);
        assert_eq!(status.pending, 0);
        assert_eq!(status.chunks, 1);
        assert_eq!(status.unsaved_changes, 0);
        assert_eq!(status.embedder, "hashing");
        assert_eq!(status.answerer, "extractive");
    }

    #[tokio::test]
    async fn data_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let id = {
            let service = open_service(&tmp);
            service.ingest("a.md", b"alpha beta".to_vec()).await.unwrap().id
        };

        let service = open_service(&tmp);
        let listed = service.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, id);
        assert_eq!(service.status().await.unwrap().chunks, 1);
    }
}
