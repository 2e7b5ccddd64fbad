//! Structured predicates over chunk metadata.
//!
//! Filters are plain data so they can be logged, compared in tests and
//! evaluated inside the index without crossing a closure boundary.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Tags attached to every indexed chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub document_id: String,
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// Matches every chunk.
    All,
    DocumentId(String),
    DocumentIdIn(BTreeSet<String>),
    Filename(String),
    FilenameIn(BTreeSet<String>),
    Not(Box<Filter>),
    And(Vec<Filter>),
}

impl Filter {
    pub fn filename_in<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Filter::FilenameIn(names.into_iter().map(Into::into).collect())
    }

    pub fn document_id_in<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Filter::DocumentIdIn(ids.into_iter().map(Into::into).collect())
    }

    pub fn negate(self) -> Self {
        match self {
            Filter::Not(inner) => *inner,
            other => Filter::Not(Box::new(other)),
        }
    }

    pub fn matches(&self, meta: &ChunkMetadata) -> bool {
        match self {
            Filter::All => true,
            Filter::DocumentId(id) => meta.document_id == *id,
            Filter::DocumentIdIn(ids) => ids.contains(&meta.document_id),
            Filter::Filename(name) => meta.filename == *name,
            Filter::FilenameIn(names) => names.contains(&meta.filename),
            Filter::Not(inner) => !inner.matches(meta),
            Filter::And(parts) => parts.iter().all(|f| f.matches(meta)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(id: &str, filename: &str) -> ChunkMetadata {
        ChunkMetadata {
            document_id: id.to_string(),
            filename: filename.to_string(),
        }
    }

    #[test]
    fn leaf_filters() {
        let m = meta("doc-1", "a.md");
        assert!(Filter::All.matches(&m));
        assert!(Filter::DocumentId("doc-1".into()).matches(&m));
        assert!(!Filter::DocumentId("doc-2".into()).matches(&m));
        assert!(Filter::Filename("a.md".into()).matches(&m));
        assert!(Filter::filename_in(["b.md", "a.md"]).matches(&m));
        assert!(!Filter::filename_in(["b.md"]).matches(&m));
        assert!(Filter::document_id_in(["doc-1"]).matches(&m));
    }

    #[test]
    fn empty_set_matches_nothing() {
        let m = meta("doc-1", "a.md");
        assert!(!Filter::filename_in(Vec::<String>::new()).matches(&m));
    }

    #[test]
    fn negation_and_conjunction() {
        let m = meta("doc-1", "a.md");
        let not_a = Filter::Filename("a.md".into()).negate();
        assert!(!not_a.matches(&m));
        assert_eq!(not_a.clone().negate(), Filter::Filename("a.md".into()));

        let both = Filter::And(vec![
            Filter::DocumentId("doc-1".into()),
            Filter::Filename("a.md".into()),
        ]);
        assert!(both.matches(&m));

        let conflicting = Filter::And(vec![
            Filter::DocumentId("doc-1".into()),
            Filter::Filename("b.md".into()),
        ]);
        assert!(!conflicting.matches(&m));
        assert!(Filter::And(vec![]).matches(&m));
    }
}
