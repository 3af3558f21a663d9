use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed (wrong password or damaged token)")]
    Decrypt,
    #[error("malformed token: {0}")]
    MalformedToken(&'static str),
    #[error("cannot initialise integrity mac")]
    MacKey,
}

/// Outcome of a failed store operation.
///
/// `NotFound` and `Corrupted` are ordinary results for callers: both mean
/// "there is no trustworthy document", see [`StoreError::is_absent`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document not found: {0}")]
    NotFound(String),

    #[error("document {document} failed verification: {reason}")]
    Corrupted { document: String, reason: String },

    #[error("write of {document} failed: {source}")]
    WriteFailure {
        document: String,
        #[source]
        source: io::Error,
    },

    #[error("cannot serialise {document}: {source}")]
    Serialize {
        document: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("invalid document name: {0:?}")]
    InvalidName(String),

    /// Verified and decrypted, but the JSON does not fit the expected shape.
    #[error("document {document} has an unexpected shape: {reason}")]
    Schema { document: String, reason: String },

    /// The in-memory copy did not come from the file on disk, so writing it
    /// would replace records that were never read.
    #[error("refusing to overwrite {document}: it was not loaded cleanly ({reason})")]
    NotWritable { document: String, reason: String },
}

impl StoreError {
    /// True when the document should be treated as missing.
    pub fn is_absent(&self) -> bool {
        matches!(self, StoreError::NotFound(_) | StoreError::Corrupted { .. })
    }

    pub(crate) fn corrupted(document: &str, reason: impl Into<String>) -> Self {
        StoreError::Corrupted {
            document: document.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn write(document: &str, source: io::Error) -> Self {
        StoreError::WriteFailure {
            document: document.to_string(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit log io at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("audit log json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot determine data directory")]
    NoDataDir,
    #[error("read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
