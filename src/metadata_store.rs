use std::{
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const DOCUMENTS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("documents");
const SETTINGS: TableDefinition<&str, &str> = TableDefinition::new("settings");

/// Lifecycle of a document across the two stores.
///
/// A record is `Pending` from registration until its chunks have been
/// indexed and persisted, then `Committed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Committed,
}

impl std::fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocumentStatus::Pending => f.write_str("pending"),
            DocumentStatus::Committed => f.write_str("committed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: String,
    pub filename: String,
    /// Seconds since the Unix epoch.
    pub created_at: u64,
    pub status: DocumentStatus,
}

/// Durable registry of uploaded documents plus persisted settings.
pub struct MetadataStore {
    db: Database,
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl MetadataStore {
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)?;

        // Ensure all tables exist by opening them in a write transaction.
        let txn = db.begin_write()?;
        txn.open_table(DOCUMENTS)?;
        txn.open_table(SETTINGS)?;
        txn.commit()?;

        Ok(Self { db })
    }

    // -- Documents --

    /// Register a new document as `Pending`.
    pub fn create(&self, id: &str, filename: &str) -> Result<DocumentRecord> {
        self.create_with_time(id, filename, unix_now())
    }

    pub fn create_with_time(
        &self,
        id: &str,
        filename: &str,
        created_at: u64,
    ) -> Result<DocumentRecord> {
        let record = DocumentRecord {
            id: id.to_string(),
            filename: filename.to_string(),
            created_at,
            status: DocumentStatus::Pending,
        };
        let bytes = serde_json::to_vec(&record)?;

        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(DOCUMENTS)?;
            if table.get(id)?.is_some() {
                return Err(Error::DuplicateId(id.to_string()));
            }
            table.insert(id, bytes.as_slice())?;
        }
        txn.commit()?;
        Ok(record)
    }

    /// Flip a record to `Committed`. Returns false if the id is unknown.
    pub fn mark_committed(&self, id: &str) -> Result<bool> {
        let txn = self.db.begin_write()?;
        let updated = {
            let mut table = txn.open_table(DOCUMENTS)?;
            let existing = table
                .get(id)?
                .map(|guard| serde_json::from_slice::<DocumentRecord>(guard.value()))
                .transpose()?;
            match existing {
                Some(mut record) => {
                    record.status = DocumentStatus::Committed;
                    let bytes = serde_json::to_vec(&record)?;
                    table.insert(id, bytes.as_slice())?;
                    true
                }
                None => false,
            }
        };
        txn.commit()?;
        Ok(updated)
    }

    pub fn get(&self, id: &str) -> Result<Option<DocumentRecord>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DOCUMENTS)?;
        match table.get(id)? {
            Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
            None => Ok(None),
        }
    }

    /// All records, oldest first.
    pub fn list(&self) -> Result<Vec<DocumentRecord>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DOCUMENTS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (k, v) = entry?;
            match serde_json::from_slice::<DocumentRecord>(v.value()) {
                Ok(record) => result.push(record),
                Err(e) => tracing::warn!(
                    id = k.value(),
                    error = %e,
                    "skipping unreadable document record"
                ),
            }
        }
        result.sort_by(|a, b| {
            a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id))
        });
        Ok(result)
    }

    /// Remove one record. Returns the number of rows removed (0 or 1).
    pub fn delete_by_id(&self, id: &str) -> Result<usize> {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(DOCUMENTS)?;
            table.remove(id)?.is_some()
        };
        txn.commit()?;
        Ok(usize::from(removed))
    }

    /// Remove every record. Returns the number of rows removed.
    pub fn delete_all(&self) -> Result<usize> {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(DOCUMENTS)?;
            let mut count = 0;
            table.retain(|_, _| {
                count += 1;
                false
            })?;
            count
        };
        txn.commit()?;
        Ok(removed)
    }

    // -- Settings --

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(SETTINGS)?;
            table.insert(key, value)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SETTINGS)?;
        Ok(table.get(key)?.map(|v| v.value().to_string()))
    }

    pub fn remove_setting(&self, key: &str) -> Result<bool> {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(SETTINGS)?;
            table.remove(key)?.is_some()
        };
        txn.commit()?;
        Ok(removed)
    }

    pub fn list_settings(&self) -> Result<Vec<(String, String)>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SETTINGS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (k, v) = entry?;
            result.push((k.value().to_string(), v.value().to_string()));
        }
        Ok(result)
    }
}

impl std::fmt::Debug for MetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataStore").finish_non_exhaustive()
    }
}
