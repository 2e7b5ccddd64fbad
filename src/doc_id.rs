use uuid::Uuid;

/// Opaque identifier assigned to a document when it is ingested.
///
/// Ids are random (UUIDv4); collisions are treated as impossible.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentId(String);

impl DocumentId {
    /// Generate a fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// Leading hex characters for compact display.
    pub fn short(&self) -> &str {
        short_id(&self.0)
    }
}

/// First eight characters of an id (or the whole id when shorter).
pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(8) {
        Some((byte_idx, _)) => &id[..byte_idx],
        None => id,
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn generated_ids_are_unique() {
        let ids: HashSet<_> = (0..1000).map(|_| DocumentId::generate()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn generated_id_is_a_uuid() {
        let id = DocumentId::generate();
        assert!(Uuid::parse_str(id.as_str()).is_ok());
        assert_eq!(id.as_str().len(), 36);
    }

    #[test]
    fn short_is_eight_chars() {
        let id = DocumentId::generate();
        assert_eq!(id.short().len(), 8);
        assert!(id.as_str().starts_with(id.short()));
    }

    #[test]
    fn short_id_of_short_input() {
        assert_eq!(short_id("abc"), "abc");
        assert_eq!(short_id(""), "");
    }
}
