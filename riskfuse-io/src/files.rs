//! Atomic artifact writes and input fingerprints

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

use riskfuse_core::RiskError;

/// Errors from file-backed inputs and outputs
#[derive(Debug, Error)]
pub enum IoError {
    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid JSON in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Invalid CSV in {}: {source}", path.display())]
    Csv { path: PathBuf, source: csv::Error },

    #[error(transparent)]
    Risk(#[from] RiskError),
}

impl From<IoError> for RiskError {
    fn from(err: IoError) -> Self {
        match err {
            IoError::Risk(inner) => inner,
            // Unparseable configuration files are configuration errors
            IoError::Json { .. } | IoError::Csv { .. } => RiskError::Configuration(err.to_string()),
            other => RiskError::Io(other.to_string()),
        }
    }
}

/// Write `bytes` to a temp file beside `path`, then rename over it.
///
/// Readers see either the old file or the complete new one.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), IoError> {
    let write_err = |source| IoError::Write {
        path: path.to_path_buf(),
        source,
    };
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(write_err)?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(write_err)?;
    tmp.write_all(bytes).map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;
    tmp.persist(path).map_err(|e| write_err(e.error))?;
    Ok(())
}

/// Pretty JSON, newline terminated
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), IoError> {
    let mut bytes = serde_json::to_vec_pretty(value).map_err(|source| IoError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    bytes.push(b'\n');
    write_atomic(path, &bytes)
}

/// One compact JSON document per line
pub fn write_ndjson_atomic<T: Serialize>(path: &Path, records: &[T]) -> Result<(), IoError> {
    let mut bytes = Vec::new();
    for record in records {
        serde_json::to_writer(&mut bytes, record).map_err(|source| IoError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        bytes.push(b'\n');
    }
    write_atomic(path, &bytes)
}

/// SHA-256 of a file's contents, hex encoded
pub fn fingerprint(path: &Path) -> Result<String, IoError> {
    let bytes = fs::read(path).map_err(|source| IoError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}
