use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use serde::Serialize;

use crate::{
    answerer::{Answerer, Routing},
    blocking,
    error::{Error, Result},
    filter::Filter,
    metadata_store::{DocumentStatus, MetadataStore},
    resilience::CallPolicy,
    session::{DEFAULT_SESSION, TopicSessions},
    vector_index::VectorIndex,
};

pub const NO_DOCUMENTS_ANSWER: &str = "No documents have been uploaded yet. \
Upload a document before asking questions.";

pub const DEFAULT_K: usize = 5;
pub const DEFAULT_FETCH_K: usize = 50;

/// What to search when the routing reply cannot be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoutingPolicy {
    /// Search every committed document.
    #[default]
    FailOpen,
    /// Search nothing.
    FailClosed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatAnswer {
    pub answer: String,
    /// Distinct filenames of the chunks the answer was built from, in rank
    /// order.
    pub sources: Vec<String>,
    pub topic: String,
    pub topic_changed: bool,
}

/// Answers a question from the indexed documents.
///
/// Routing narrows the documents by filename before the similarity search,
/// so a question about one file is not answered from another file that
/// happens to use similar words.
pub struct QueryPipeline {
    metadata: Arc<MetadataStore>,
    index: Arc<VectorIndex>,
    answerer: Arc<dyn Answerer>,
    sessions: Arc<TopicSessions>,
    policy: CallPolicy,
    k: usize,
    fetch_k: usize,
    routing_policy: RoutingPolicy,
}

impl QueryPipeline {
    pub fn new(
        metadata: Arc<MetadataStore>,
        index: Arc<VectorIndex>,
        answerer: Arc<dyn Answerer>,
        sessions: Arc<TopicSessions>,
        policy: CallPolicy,
    ) -> Self {
        Self {
            metadata,
            index,
            answerer,
            sessions,
            policy,
            k: DEFAULT_K,
            fetch_k: DEFAULT_FETCH_K,
            routing_policy: RoutingPolicy::default(),
        }
    }

    pub fn with_search_window(mut self, k: usize, fetch_k: usize) -> Self {
        self.k = k;
        self.fetch_k = fetch_k;
        self
    }

    pub fn with_routing_policy(mut self, routing_policy: RoutingPolicy) -> Self {
        self.routing_policy = routing_policy;
        self
    }

    pub async fn chat(
        &self,
        query: &str,
        session: Option<&str>,
    ) -> Result<ChatAnswer> {
        let query = query.trim();
        if query.is_empty() {
            return Err(Error::Validation("query must not be empty".into()));
        }
        let session = session
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_SESSION);

        let topic = self
            .policy
            .run("classify", || self.answerer.classify(query))
            .await?;
        let topic_changed = self.sessions.observe(session, &topic);
        tracing::debug!(session, topic = %topic, topic_changed, "classified query");

        let committed = self.committed_documents().await?;
        if committed.is_empty() {
            return Ok(ChatAnswer {
                answer: NO_DOCUMENTS_ANSWER.to_string(),
                sources: Vec::new(),
                topic,
                topic_changed,
            });
        }

        let universe: BTreeSet<String> = committed.keys().cloned().collect();
        let relevant = self.route(query, &universe).await?;
        // Pending uploads may share a selected filename, so search by id.
        let ids = relevant
            .iter()
            .filter_map(|name| committed.get(name))
            .flatten()
            .cloned();
        let hits = self
            .index
            .search(query, self.k, &Filter::document_id_in(ids), self.fetch_k)
            .await?;

        let texts: Vec<String> = hits.iter().map(|h| h.text.clone()).collect();
        let answer = self
            .policy
            .run("synthesize", || self.answerer.synthesize(query, &texts))
            .await?;

        let mut sources: Vec<String> = Vec::new();
        for hit in &hits {
            if !sources.contains(&hit.metadata.filename) {
                sources.push(hit.metadata.filename.clone());
            }
        }

        tracing::info!(
            session,
            chunks = hits.len(),
            sources = sources.len(),
            "answered query"
        );
        Ok(ChatAnswer {
            answer,
            sources,
            topic,
            topic_changed,
        })
    }

    /// Committed document ids grouped by filename.
    async fn committed_documents(
        &self,
    ) -> Result<BTreeMap<String, Vec<String>>> {
        let metadata = Arc::clone(&self.metadata);
        let records = blocking::run(move || metadata.list()).await?;
        let mut by_name: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for record in records {
            if record.status == DocumentStatus::Committed {
                by_name.entry(record.filename).or_default().push(record.id);
            }
        }
        Ok(by_name)
    }

    /// Filenames to search. Names the model invents are dropped, and an
    /// empty selection stays empty.
    async fn route(
        &self,
        query: &str,
        universe: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>> {
        let filenames: Vec<String> = universe.iter().cloned().collect();
        let routing = self
            .policy
            .run("route", || self.answerer.route(query, &filenames))
            .await?;

        match routing {
            Routing::Selected(names) => {
                let selected: BTreeSet<String> = names
                    .into_iter()
                    .filter(|name| universe.contains(name))
                    .collect();
                tracing::debug!(selected = selected.len(), "routed query");
                Ok(selected)
            }
            Routing::Unparseable(raw) => match self.routing_policy {
                RoutingPolicy::FailOpen => {
                    tracing::warn!(
                        reply = %raw,
                        "unreadable routing reply, searching all documents"
                    );
                    Ok(universe.clone())
                }
                RoutingPolicy::FailClosed => {
                    tracing::warn!(
                        reply = %raw,
                        "unreadable routing reply, searching nothing"
                    );
                    Ok(BTreeSet::new())
                }
            },
        }
    }
}

impl std::fmt::Debug for QueryPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryPipeline")
            .field("answerer", &self.answerer.model_name())
            .field("k", &self.k)
            .field("fetch_k", &self.fetch_k)
            .field("routing_policy", &self.routing_policy)
            .finish_non_exhaustive()
    }
}
