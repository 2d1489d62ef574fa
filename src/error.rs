// Upload error taxonomy
// Client-facing failures are typed so the transport layer can map them to 400s;
// anything from the store stays an opaque anyhow error.

use std::error::Error as StdError;
use thiserror::Error;

/// Why an upload was rejected (or failed)
#[derive(Debug, Error)]
pub enum ImportError {
    /// Filename extension is not `.csv`, `.xlsx` or `.xls`
    #[error("Unsupported file type '{0}'. Use CSV or Excel.")]
    UnsupportedFileType(String),

    /// The payload could not be read, or a score cell is not a number
    #[error("Failed to read file: {source}")]
    MalformedInput {
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    /// Required columns are missing
    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    /// Store-layer failure (connectivity, constraint violation, ...)
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl ImportError {
    pub fn malformed(cause: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        ImportError::MalformedInput {
            source: cause.into(),
        }
    }
}

impl From<rusqlite::Error> for ImportError {
    fn from(err: rusqlite::Error) -> Self {
        ImportError::Store(err.into())
    }
}
