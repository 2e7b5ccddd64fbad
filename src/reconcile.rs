use std::{collections::BTreeSet, sync::Arc, time::Duration};

use serde::Serialize;
use tokio::task::JoinHandle;

use crate::{
    blocking,
    error::Result,
    filter::Filter,
    metadata_store::{DocumentStatus, MetadataStore, unix_now},
    vector_index::VectorIndex,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub orphan_chunks_removed: usize,
    pub stale_documents_removed: usize,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.orphan_chunks_removed == 0 && self.stale_documents_removed == 0
    }
}

/// Repairs drift between the metadata registry and the vector index.
///
/// Two kinds of leftovers are removed: chunks whose document has no
/// metadata row, and `pending` rows from uploads that never finished.
pub struct Reconciler {
    metadata: Arc<MetadataStore>,
    index: Arc<VectorIndex>,
    grace: Duration,
}

impl Reconciler {
    pub fn new(
        metadata: Arc<MetadataStore>,
        index: Arc<VectorIndex>,
        grace: Duration,
    ) -> Self {
        Self {
            metadata,
            index,
            grace,
        }
    }

    pub async fn run(&self) -> Result<ReconcileReport> {
        self.run_at(unix_now()).await
    }

    /// Reconcile as if the current time were `now` (unix seconds).
    pub async fn run_at(&self, now: u64) -> Result<ReconcileReport> {
        // The index snapshot must precede the metadata listing: an upload
        // registers its row before indexing, so any chunk in the snapshot
        // whose row is missing from the later listing is truly orphaned.
        let indexed = self.index.document_ids().await;

        let metadata = Arc::clone(&self.metadata);
        let records = blocking::run(move || metadata.list()).await?;
        let known: BTreeSet<&str> = records.iter().map(|r| r.id.as_str()).collect();

        let orphans: BTreeSet<String> = indexed
            .into_iter()
            .filter(|id| !known.contains(id.as_str()))
            .collect();

        let mut report = ReconcileReport::default();
        if !orphans.is_empty() {
            report.orphan_chunks_removed = self
                .index
                .delete_where(&Filter::DocumentIdIn(orphans))
                .await?;
        }

        let grace = self.grace.as_secs();
        let stale: Vec<String> = records
            .iter()
            .filter(|r| {
                r.status == DocumentStatus::Pending
                    && now.saturating_sub(r.created_at) >= grace
            })
            .map(|r| r.id.clone())
            .collect();

        for id in stale {
            let metadata = Arc::clone(&self.metadata);
            let doc_id = id.clone();
            report.stale_documents_removed +=
                blocking::run(move || metadata.delete_by_id(&doc_id)).await?;
            self.index.delete_where(&Filter::DocumentId(id)).await?;
        }

        if self.index.pending_writes().await > 0 {
            self.index.persist().await?;
        }

        if report.is_clean() {
            tracing::debug!("stores are consistent");
        } else {
            tracing::info!(
                orphan_chunks = report.orphan_chunks_removed,
                stale_documents = report.stale_documents_removed,
                "reconciled stores"
            );
        }
        Ok(report)
    }

    /// Run every `interval` in the background. Returns `None` when the
    /// interval is zero.
    pub fn spawn_periodic(
        self: Arc<Self>,
        interval: Duration,
    ) -> Option<JoinHandle<()>> {
        if interval.is_zero() {
            return None;
        }
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately; skip it so startup
            // does not race with the caller.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = self.run().await {
                    tracing::warn!(error = %e, "reconciliation failed");
                }
            }
        }))
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("grace", &self.grace)
            .finish_non_exhaustive()
    }
}
