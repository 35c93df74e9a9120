//! Storage Layer
//!
//! Provides the durable device registry and the per-device monthly
//! time-series files holding one row per device per hour.

mod registry;
mod timeseries;

pub use registry::{DeviceEntry, DeviceRegistry, Registration};
pub use timeseries::{
    merge_rows, FileKey, PersistedRow, SampleCounts, TimeSeriesStore, WriteOutcome, CSV_HEADER,
};

use std::fs;
use std::io::Write;
use std::path::Path;
use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error on {path}: {message}")]
    Io { path: String, message: String },
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Corrupt data in {path} line {line}: {reason}")]
    Corrupt {
        path: String,
        line: usize,
        reason: String,
    },
}

impl StorageError {
    pub(crate) fn io(path: &Path, err: std::io::Error) -> Self {
        StorageError::Io {
            path: path.display().to_string(),
            message: err.to_string(),
        }
    }
}

/// Replace `path` with `contents` through a temporary sibling and a rename
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StorageError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
    }

    let tmp = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp).map_err(|e| StorageError::io(&tmp, e))?;
    file.write_all(contents)
        .and_then(|_| file.sync_all())
        .map_err(|e| StorageError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| StorageError::io(path, e))
}
