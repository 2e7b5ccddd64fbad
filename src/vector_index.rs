use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
    sync::Arc,
};

use rayon::prelude::*;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::{
    blocking,
    embedding::{Embedder, cosine_similarity},
    error::{Error, Result},
    filter::{ChunkMetadata, Filter},
    resilience::CallPolicy,
};

const CHUNKS: TableDefinition<u64, &[u8]> = TableDefinition::new("chunks");

/// Header size: 4 bytes dimension + 4 bytes payload length.
const HEADER_SIZE: usize = 8;

/// Texts sent to the embedder per call.
const EMBED_BATCH_SIZE: usize = 64;

/// A chunk waiting to be embedded and indexed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChunk {
    pub text: String,
    pub metadata: ChunkMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredChunk {
    pub text: String,
    pub metadata: ChunkMetadata,
    pub score: f32,
}

#[derive(Debug, Clone)]
struct StoredChunk {
    text: String,
    metadata: ChunkMetadata,
    vector: Vec<f32>,
}

#[derive(Serialize, Deserialize)]
struct ChunkPayload {
    document_id: String,
    filename: String,
    text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingWrite {
    Upsert,
    Remove,
}

#[derive(Debug, Default)]
struct IndexState {
    chunks: BTreeMap<u64, StoredChunk>,
    dimension: Option<usize>,
    next_key: u64,
    pending: BTreeMap<u64, PendingWrite>,
    /// Drop the whole table on the next persist.
    clear_on_persist: bool,
}

/// Similarity-searchable chunk store.
///
/// Mutations land in an in-memory working set and are written to disk only
/// by [`VectorIndex::persist`]. Each entry is stored as:
/// - 4 bytes: embedding dimension D (u32 LE)
/// - 4 bytes: payload length P (u32 LE)
/// - D * 4 bytes: f32 LE vector
/// - P bytes: JSON `{document_id, filename, text}`
pub struct VectorIndex {
    db: Arc<Database>,
    state: RwLock<IndexState>,
    embedder: Arc<dyn Embedder>,
    policy: CallPolicy,
}

impl VectorIndex {
    /// Open or create the index at `path` and load its persisted chunks.
    pub fn open(
        path: &Path,
        embedder: Arc<dyn Embedder>,
        policy: CallPolicy,
    ) -> Result<Self> {
        let db = Database::create(path)?;

        let txn = db.begin_write()?;
        txn.open_table(CHUNKS)?;
        txn.commit()?;

        let mut state = IndexState::default();
        {
            let txn = db.begin_read()?;
            let table = txn.open_table(CHUNKS)?;
            for entry in table.iter()? {
                let (k, v) = entry?;
                let key = k.value();
                state.next_key = state.next_key.max(key + 1);

                let Some(chunk) = decode_entry(v.value()) else {
                    tracing::warn!(key, "skipping undecodable chunk entry");
                    continue;
                };
                let dim = *state.dimension.get_or_insert(chunk.vector.len());
                if chunk.vector.len() != dim {
                    tracing::warn!(
                        key,
                        expected = dim,
                        actual = chunk.vector.len(),
                        "skipping chunk with mismatched dimension"
                    );
                    continue;
                }
                state.chunks.insert(key, chunk);
            }
        }
        tracing::debug!(chunks = state.chunks.len(), "loaded vector index");

        Ok(Self {
            db: Arc::new(db),
            state: RwLock::new(state),
            embedder,
            policy,
        })
    }

    /// Embed and append chunks to the working set. Returns how many were
    /// added. Nothing is durable until [`persist`](Self::persist).
    pub async fn add_chunks(&self, chunks: Vec<NewChunk>) -> Result<usize> {
        if chunks.is_empty() {
            return Ok(0);
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(EMBED_BATCH_SIZE) {
            let embedded = self
                .policy
                .run("embed", || self.embedder.embed(batch))
                .await?;
            if embedded.len() != batch.len() {
                return Err(Error::external(
                    "embedder",
                    format!(
                        "expected {} vectors, got {}",
                        batch.len(),
                        embedded.len()
                    ),
                    false,
                ));
            }
            vectors.extend(embedded);
        }

        let mut state = self.state.write().await;
        let dim = state
            .dimension
            .or_else(|| vectors.first().map(Vec::len))
            .unwrap_or_default();
        if dim == 0 {
            return Err(Error::external("embedder", "empty embedding", false));
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != dim) {
            return Err(Error::DimensionMismatch {
                expected: dim,
                actual: bad.len(),
            });
        }
        state.dimension = Some(dim);

        let added = chunks.len();
        for (chunk, vector) in chunks.into_iter().zip(vectors) {
            let key = state.next_key;
            state.next_key += 1;
            state.chunks.insert(
                key,
                StoredChunk {
                    text: chunk.text,
                    metadata: chunk.metadata,
                    vector,
                },
            );
            state.pending.insert(key, PendingWrite::Upsert);
        }
        Ok(added)
    }

    /// Write every pending mutation in one transaction. Returns the number
    /// of entries written or removed. Pending writes survive a failure.
    pub async fn persist(&self) -> Result<usize> {
        let mut state = self.state.write().await;
        if state.pending.is_empty() && !state.clear_on_persist {
            return Ok(0);
        }

        let mut ops: Vec<(u64, Option<Vec<u8>>)> =
            Vec::with_capacity(state.pending.len());
        for (&key, write) in &state.pending {
            let bytes = match (write, state.chunks.get(&key)) {
                (PendingWrite::Upsert, Some(chunk)) => Some(encode_entry(chunk)?),
                _ => None,
            };
            ops.push((key, bytes));
        }

        let clear = state.clear_on_persist;
        let db = Arc::clone(&self.db);
        let applied = ops.len();
        blocking::run(move || {
            let txn = db.begin_write()?;
            if clear {
                txn.delete_table(CHUNKS)?;
            }
            {
                let mut table = txn.open_table(CHUNKS)?;
                for (key, bytes) in &ops {
                    match bytes {
                        Some(bytes) => {
                            table.insert(*key, bytes.as_slice())?;
                        }
                        None => {
                            table.remove(*key)?;
                        }
                    }
                }
            }
            txn.commit()?;
            Ok(())
        })
        .await?;

        state.pending.clear();
        state.clear_on_persist = false;
        tracing::debug!(applied, cleared = clear, "persisted vector index");
        Ok(applied)
    }

    /// Top-`k` chunks matching `filter`, taken from the `fetch_k` nearest
    /// chunks overall. May return fewer than `k` when the window holds
    /// fewer matches.
    pub async fn search(
        &self,
        query: &str,
        k: usize,
        filter: &Filter,
        fetch_k: usize,
    ) -> Result<Vec<ScoredChunk>> {
        if k == 0 || self.state.read().await.chunks.is_empty() {
            return Ok(Vec::new());
        }

        let query_vector = self
            .policy
            .run("embed query", || self.embedder.embed_query(query))
            .await?;

        let state = self.state.read().await;
        if let Some(dim) = state.dimension
            && dim != query_vector.len()
        {
            return Err(Error::DimensionMismatch {
                expected: dim,
                actual: query_vector.len(),
            });
        }

        let mut scored: Vec<(u64, f32)> = state
            .chunks
            .par_iter()
            .map(|(&key, chunk)| {
                (key, cosine_similarity(&query_vector, &chunk.vector))
            })
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.truncate(fetch_k);

        let results = scored
            .into_iter()
            .filter_map(|(key, score)| {
                let chunk = state.chunks.get(&key)?;
                filter.matches(&chunk.metadata).then(|| ScoredChunk {
                    text: chunk.text.clone(),
                    metadata: chunk.metadata.clone(),
                    score,
                })
            })
            .take(k)
            .collect();
        Ok(results)
    }

    /// Remove every chunk matching `filter` from the working set.
    pub async fn delete_where(&self, filter: &Filter) -> Result<usize> {
        let mut state = self.state.write().await;
        let keys: Vec<u64> = state
            .chunks
            .iter()
            .filter(|(_, chunk)| filter.matches(&chunk.metadata))
            .map(|(&key, _)| key)
            .collect();

        for key in &keys {
            state.chunks.remove(key);
            state.pending.insert(*key, PendingWrite::Remove);
        }
        Ok(keys.len())
    }

    /// Remove every chunk from the working set.
    pub async fn clear(&self) -> Result<usize> {
        let mut state = self.state.write().await;
        let removed = state.chunks.len();
        state.chunks.clear();
        state.pending.clear();
        state.dimension = None;
        state.clear_on_persist = true;
        Ok(removed)
    }

    pub async fn count(&self, filter: &Filter) -> usize {
        let state = self.state.read().await;
        state
            .chunks
            .values()
            .filter(|chunk| filter.matches(&chunk.metadata))
            .count()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.chunks.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.chunks.is_empty()
    }

    /// Distinct document ids that own at least one chunk.
    pub async fn document_ids(&self) -> BTreeSet<String> {
        let state = self.state.read().await;
        state
            .chunks
            .values()
            .map(|chunk| chunk.metadata.document_id.clone())
            .collect()
    }

    /// Mutations not yet written by [`persist`](Self::persist).
    pub async fn pending_writes(&self) -> usize {
        let state = self.state.read().await;
        state.pending.len() + usize::from(state.clear_on_persist)
    }

    pub async fn dimension(&self) -> Option<usize> {
        self.state.read().await.dimension
    }

    pub fn embedder_name(&self) -> &str {
        self.embedder.model_name()
    }
}

impl std::fmt::Debug for VectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorIndex")
            .field("embedder", &self.embedder.model_name())
            .finish_non_exhaustive()
    }
}

fn encode_entry(chunk: &StoredChunk) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(&ChunkPayload {
        document_id: chunk.metadata.document_id.clone(),
        filename: chunk.metadata.filename.clone(),
        text: chunk.text.clone(),
    })?;

    let vector_bytes: &[u8] = bytemuck::cast_slice(&chunk.vector);
    let mut bytes =
        Vec::with_capacity(HEADER_SIZE + vector_bytes.len() + payload.len());
    bytes.extend_from_slice(&(chunk.vector.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    bytes.extend_from_slice(vector_bytes);
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

fn decode_entry(bytes: &[u8]) -> Option<StoredChunk> {
    let dim = u32::from_le_bytes(bytes.get(0..4)?.try_into().ok()?) as usize;
    let payload_len =
        u32::from_le_bytes(bytes.get(4..8)?.try_into().ok()?) as usize;

    let vector_end = HEADER_SIZE + dim * 4;
    if bytes.len() != vector_end + payload_len {
        return None;
    }

    let vector: Vec<f32> =
        bytemuck::pod_collect_to_vec(&bytes[HEADER_SIZE..vector_end]);
    let payload: ChunkPayload =
        serde_json::from_slice(&bytes[vector_end..]).ok()?;

    Some(StoredChunk {
        text: payload.text,
        metadata: ChunkMetadata {
            document_id: payload.document_id,
            filename: payload.filename,
        },
        vector,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::embedding::HashingEmbedder;

    fn chunk(doc: &str, filename: &str, text: &str) -> NewChunk {
        NewChunk {
            text: text.to_string(),
            metadata: ChunkMetadata {
                document_id: doc.to_string(),
                filename: filename.to_string(),
            },
        }
    }

    fn open_index(path: &Path) -> VectorIndex {
        VectorIndex::open(
            path,
            Arc::new(HashingEmbedder::new(64)),
            CallPolicy::default(),
        )
        .unwrap()
    }

    fn test_index() -> (tempfile::TempDir, VectorIndex) {
        let tmp = tempfile::tempdir().unwrap();
        let index = open_index(&tmp.path().join("vectors.redb"));
        (tmp, index)
    }

    /// Counts embed calls so tests can assert no embedding happened.
    struct CountingEmbedder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        fn model_name(&self) -> &str {
            "counting"
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    #[tokio::test]
    async fn new_index_is_empty() {
        let (_tmp, index) = test_index();
        assert!(index.is_empty().await);
        assert_eq!(index.pending_writes().await, 0);
        let hits = index.search("anything", 5, &Filter::All, 50).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn empty_search_skips_embedding() {
        let tmp = tempfile::tempdir().unwrap();
        let embedder = Arc::new(CountingEmbedder {
            calls: AtomicUsize::new(0),
        });
        let index = VectorIndex::open(
            &tmp.path().join("vectors.redb"),
            embedder.clone(),
            CallPolicy::default(),
        )
        .unwrap();

        index.search("q", 5, &Filter::All, 50).await.unwrap();
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);

        index.add_chunks(vec![chunk("d", "a.md", "x")]).await.unwrap();
        index.search("q", 0, &Filter::All, 50).await.unwrap();
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn search_ranks_by_similarity() {
        let (_tmp, index) = test_index();
        index
            .add_chunks(vec![
                chunk("d1", "pets.md", "cats and dogs are popular pets"),
                chunk("d2", "rust.md", "rust borrow checker ownership rules"),
            ])
            .await
            .unwrap();

        let hits = index
            .search("ownership in rust", 1, &Filter::All, 50)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].metadata.filename, "rust.md");
    }

    #[tokio::test]
    async fn filter_restricts_results() {
        let (_tmp, index) = test_index();
        index
            .add_chunks(vec![
                chunk("d1", "a.md", "shared words here"),
                chunk("d2", "b.md", "shared words here too"),
            ])
            .await
            .unwrap();

        let hits = index
            .search("shared words", 5, &Filter::filename_in(["b.md"]), 50)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].metadata.document_id, "d2");

        let none = index
            .search("shared words", 5, &Filter::filename_in(Vec::<String>::new()), 50)
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn filter_applies_after_fetch_window() {
        let (_tmp, index) = test_index();
        index
            .add_chunks(vec![
                chunk("d1", "near.md", "solar panels convert sunlight"),
                chunk("d2", "far.md", "medieval castle architecture"),
            ])
            .await
            .unwrap();

        // With a window of one, only the nearest chunk is considered, so a
        // filter selecting the other document finds nothing.
        let hits = index
            .search(
                "solar panels sunlight",
                5,
                &Filter::Filename("far.md".into()),
                1,
            )
            .await
            .unwrap();
        assert!(hits.is_empty());

        let widened = index
            .search(
                "solar panels sunlight",
                5,
                &Filter::Filename("far.md".into()),
                50,
            )
            .await
            .unwrap();
        assert_eq!(widened.len(), 1);
    }

    #[tokio::test]
    async fn delete_where_removes_matching_chunks() {
        let (_tmp, index) = test_index();
        index
            .add_chunks(vec![
                chunk("d1", "a.md", "one"),
                chunk("d1", "a.md", "two"),
                chunk("d2", "b.md", "three"),
            ])
            .await
            .unwrap();

        let removed = index
            .delete_where(&Filter::DocumentId("d1".into()))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(index.len().await, 1);
        assert_eq!(index.count(&Filter::DocumentId("d1".into())).await, 0);
        assert_eq!(
            index.document_ids().await,
            BTreeSet::from(["d2".to_string()])
        );
    }

    #[tokio::test]
    async fn persist_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("vectors.redb");

        {
            let index = open_index(&path);
            index
                .add_chunks(vec![
                    chunk("d1", "a.md", "alpha text"),
                    chunk("d2", "b.md", "beta text"),
                ])
                .await
                .unwrap();
            assert_eq!(index.pending_writes().await, 2);
            assert_eq!(index.persist().await.unwrap(), 2);
            assert_eq!(index.pending_writes().await, 0);
            index
                .delete_where(&Filter::DocumentId("d2".into()))
                .await
                .unwrap();
            index.persist().await.unwrap();
        }

        let index = open_index(&path);
        assert_eq!(index.len().await, 1);
        assert_eq!(index.dimension().await, Some(64));
        let hits = index.search("alpha", 5, &Filter::All, 50).await.unwrap();
        assert_eq!(hits[0].text, "alpha text");
        assert_eq!(hits[0].metadata.filename, "a.md");
    }

    #[tokio::test]
    async fn unpersisted_changes_are_lost_on_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("vectors.redb");

        {
            let index = open_index(&path);
            index.add_chunks(vec![chunk("d1", "a.md", "x")]).await.unwrap();
        }

        assert!(open_index(&path).is_empty().await);
    }

    #[tokio::test]
    async fn clear_then_persist_empties_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("vectors.redb");

        {
            let index = open_index(&path);
            index
                .add_chunks(vec![chunk("d1", "a.md", "x"), chunk("d2", "b.md", "y")])
                .await
                .unwrap();
            index.persist().await.unwrap();

            assert_eq!(index.clear().await.unwrap(), 2);
            assert!(index.pending_writes().await > 0);
            index.persist().await.unwrap();
            assert_eq!(index.pending_writes().await, 0);
        }

        let index = open_index(&path);
        assert!(index.is_empty().await);
        assert_eq!(index.dimension().await, None);
    }

    #[tokio::test]
    async fn dimension_mismatch_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("vectors.redb");

        {
            let index = open_index(&path);
            index.add_chunks(vec![chunk("d1", "a.md", "x")]).await.unwrap();
            index.persist().await.unwrap();
        }

        let index = VectorIndex::open(
            &path,
            Arc::new(HashingEmbedder::new(32)),
            CallPolicy::default(),
        )
        .unwrap();
        let err = index
            .add_chunks(vec![chunk("d2", "b.md", "y")])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::DimensionMismatch {
                expected: 64,
                actual: 32
            }
        ));
        assert_eq!(index.len().await, 1);
    }

    #[test]
    fn entry_encoding_round_trip() {
        let stored = StoredChunk {
            text: "héllo".into(),
            metadata: ChunkMetadata {
                document_id: "d1".into(),
                filename: "a.md".into(),
            },
            vector: vec![0.5, -1.25, 3.0],
        };
        let bytes = encode_entry(&stored).unwrap();
        assert_eq!(&bytes[0..4], &3u32.to_le_bytes());

        let decoded = decode_entry(&bytes).unwrap();
        assert_eq!(decoded.text, stored.text);
        assert_eq!(decoded.metadata, stored.metadata);
        assert_eq!(decoded.vector, stored.vector);
    }

    #[test]
    fn truncated_entry_is_rejected() {
        assert!(decode_entry(&[1, 0, 0]).is_none());
        assert!(decode_entry(&[1, 0, 0, 0, 0, 0, 0, 0]).is_none());
    }
}
