//! Durable storage for the canonical document
//!
//! The document is kept as a single JSON blob, rewritten wholesale on every
//! flush. Writes are atomic (write to temp file, sync, rename) so the file is
//! never left half-written.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;

use crate::error::SyncError;

/// Ways loading or flushing the data file can fail
#[derive(Error, Debug)]
pub enum PersistenceError {
    /// The directory for the data file could not be created
    #[error("Cannot create directory '{path}' for the data file: {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("No permission to use '{path}'")]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Out of disk space while flushing to '{path}'")]
    DiskFull {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot read data file '{path}': {source}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot write data file '{path}': {source}")]
    WriteError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The file exists but does not hold a JSON document
    #[error("Data file '{path}' is not valid JSON: {details}")]
    InvalidFormat { path: PathBuf, details: String },

    #[error("Data file '{path}' does not exist")]
    NotFound { path: PathBuf },

    /// The flushed copy could not take the place of the old file
    #[error("Cannot replace '{to}' with flushed copy '{from}': {source}")]
    AtomicWriteFailed {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl PersistenceError {
    /// Classify an I/O failure on `path`
    pub fn from_io(error: io::Error, path: PathBuf) -> Self {
        if error.kind() == io::ErrorKind::NotFound {
            return PersistenceError::NotFound { path };
        }
        if error.kind() == io::ErrorKind::PermissionDenied {
            return PersistenceError::PermissionDenied {
                path,
                source: error,
            };
        }
        if looks_like_disk_full(&error) {
            return PersistenceError::DiskFull {
                path,
                source: error,
            };
        }
        PersistenceError::WriteError {
            path,
            source: error,
        }
    }

    /// Whether a later flush may succeed without anyone stepping in
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PersistenceError::DiskFull { .. }
                | PersistenceError::WriteError { .. }
                | PersistenceError::AtomicWriteFailed { .. }
        )
    }

    /// Hint for the operator, logged next to the error
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            PersistenceError::DiskFull { .. } => {
                Some("Free some disk space; the next flush retries automatically.")
            }
            PersistenceError::PermissionDenied { .. } | PersistenceError::CreateDirectory { .. } => {
                Some("Make sure the server user can write to the data file's directory.")
            }
            PersistenceError::InvalidFormat { .. } => {
                Some("The server started from an empty document and will overwrite the file on its next flush.")
            }
            _ => None,
        }
    }
}

impl From<PersistenceError> for SyncError {
    fn from(err: PersistenceError) -> Self {
        SyncError::Persistence(err.to_string())
    }
}

/// `ErrorKind::StorageFull` is not stable, so match on the message
fn looks_like_disk_full(error: &io::Error) -> bool {
    let msg = error.to_string().to_lowercase();
    ["no space left", "disk full", "quota exceeded", "not enough space"]
        .iter()
        .any(|needle| msg.contains(needle))
}

/// Result type for persistence operations
pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// The data file holding the canonical document
#[derive(Debug, Clone)]
pub struct DataFile {
    path: PathBuf,
}

impl DataFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and parse the stored document
    pub fn load(&self) -> PersistenceResult<Value> {
        let content = fs::read_to_string(&self.path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => PersistenceError::NotFound {
                path: self.path.clone(),
            },
            io::ErrorKind::PermissionDenied => PersistenceError::PermissionDenied {
                path: self.path.clone(),
                source: e,
            },
            _ => PersistenceError::ReadError {
                path: self.path.clone(),
                source: e,
            },
        })?;

        serde_json::from_str(&content).map_err(|e| PersistenceError::InvalidFormat {
            path: self.path.clone(),
            details: e.to_string(),
        })
    }

    /// Replace the stored document with an already serialized one
    pub fn save(&self, serialized: &str) -> PersistenceResult<()> {
        atomic_write(&self.path, serialized.as_bytes())
    }
}

/// Write the whole file through a synced sibling `.tmp` file and a rename
fn atomic_write(path: &Path, data: &[u8]) -> PersistenceResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| PersistenceError::CreateDirectory {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }

    // Same directory, so the rename cannot cross filesystems
    let temp_path = path.with_extension("tmp");

    let mut file =
        File::create(&temp_path).map_err(|e| PersistenceError::from_io(e, temp_path.clone()))?;
    file.write_all(data)
        .map_err(|e| PersistenceError::from_io(e, temp_path.clone()))?;
    file.sync_all()
        .map_err(|e| PersistenceError::from_io(e, temp_path.clone()))?;

    fs::rename(&temp_path, path).map_err(|e| PersistenceError::AtomicWriteFailed {
        from: temp_path.clone(),
        to: path.to_path_buf(),
        source: e,
    })?;

    Ok(())
}
