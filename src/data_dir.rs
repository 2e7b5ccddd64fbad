//! On-disk layout of a docubot installation.
//!
//! ```text
//! <root>/
//!   metadata.redb   document records and stored settings
//!   vectors.redb    embedded chunks
//!   staging/        uploads being chunked, removed when ingest ends
//! ```

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const DATA_DIR_ENV_VAR: &str = "DOCUBOT_DATA_DIR";

const METADATA_FILE: &str = "metadata.redb";
const VECTORS_FILE: &str = "vectors.redb";
const STAGING_DIR: &str = "staging";

/// Prefix of every staged upload.
pub const STAGED_UPLOAD_PREFIX: &str = "upload-";

#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Pick the data root and make sure it exists.
    ///
    /// `--data-dir` wins over `DOCUBOT_DATA_DIR`, which wins over
    /// `$XDG_DATA_HOME/docubot`.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let root = match explicit {
            Some(path) => path.to_path_buf(),
            None => match std::env::var_os(DATA_DIR_ENV_VAR) {
                Some(val) if !val.is_empty() => PathBuf::from(val),
                _ => default_root()?,
            },
        };

        ensure_dir(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn metadata_db(&self) -> PathBuf {
        self.root.join(METADATA_FILE)
    }

    pub fn vectors_db(&self) -> PathBuf {
        self.root.join(VECTORS_FILE)
    }

    pub fn staging_dir(&self) -> Result<PathBuf> {
        let path = self.root.join(STAGING_DIR);
        ensure_dir(&path)?;
        Ok(path)
    }

    /// Remove staged uploads left behind by a process that died mid-ingest.
    ///
    /// Only call this while the stores are held open, since redb's file
    /// lock then guarantees no other process is staging into the same
    /// directory. Returns how many files were removed.
    pub fn sweep_staging(&self) -> Result<usize> {
        let staging = self.staging_dir()?;
        let mut removed = 0;
        for entry in std::fs::read_dir(&staging)? {
            let entry = entry?;
            let staged = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(STAGED_UPLOAD_PREFIX));
            if !staged || !entry.file_type()?.is_file() {
                continue;
            }
            match std::fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!(
                    path = %entry.path().display(),
                    error = %e,
                    "could not remove staged upload"
                ),
            }
        }
        if removed > 0 {
            tracing::info!(removed, "removed leftover staged uploads");
        }
        Ok(removed)
    }
}

fn default_root() -> Result<PathBuf> {
    xdg::BaseDirectories::with_prefix("docubot")
        .get_data_home()
        .ok_or_else(|| {
            Error::Config("could not determine XDG data home directory".into())
        })
}

fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|_| Error::DataDir(path.to_path_buf()))
}
