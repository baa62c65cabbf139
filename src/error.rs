//! Error taxonomy for the ingestion pipeline.
//!
//! Row-level problems are not errors in this sense: importers collect them
//! as capped strings on the job record and keep going. The variants here are
//! the failures that abort a file or a lookup entirely.

use thiserror::Error;

use crate::store::StoreError;

/// Failure while turning a raw byte buffer into rows.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The spreadsheet container could not be read (bad footer, bad entry,
    /// inflate failure). Carries enough position context to diagnose.
    #[error("archive decode failed at {context}: {message}")]
    Archive { context: String, message: String },

    /// A worksheet part was located but its contents could not be parsed.
    #[error("sheet '{sheet}' could not be parsed: {message}")]
    Sheet { sheet: String, message: String },

    /// Delimited text input could not be split into header and rows.
    #[error("delimited input could not be parsed: {0}")]
    Delimited(String),
}

impl DecodeError {
    pub fn archive(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Archive {
            context: context.into(),
            message: message.into(),
        }
    }

    pub fn sheet(sheet: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Sheet {
            sheet: sheet.into(),
            message: message.into(),
        }
    }
}

/// Top-level import failure. Structural variants flip the job to
/// `import_failed`; they are never produced for a single bad row.
#[derive(Debug, Error)]
pub enum ImportError {
    /// The file as a whole cannot be trusted: required columns missing,
    /// implausible dealer-code cardinality, and similar mis-mappings.
    /// Aborts before any writes.
    #[error("{0}")]
    Structural(String),

    /// Neither the fast decoder nor the fallback reader produced rows.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// No chunks exist for the given upload id (expired, abandoned, typo).
    #[error("no uploaded chunks found for upload '{0}'")]
    ChunksNotFound(String),

    /// The job's raw bytes were already discarded after a successful
    /// import; re-import needs a fresh upload.
    #[error("no source data retained for job {0}; re-upload the file to import again")]
    DataNotFound(uuid::Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ImportError {
    pub fn structural(msg: impl Into<String>) -> Self {
        Self::Structural(msg.into())
    }

    /// True for failures that must abort the whole file.
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::Structural(_) | Self::Decode(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structural_classification() {
        assert!(ImportError::structural("missing columns").is_structural());
        assert!(ImportError::Decode(DecodeError::Delimited("empty".into())).is_structural());
        assert!(!ImportError::ChunksNotFound("abc".into()).is_structural());
    }

    #[test]
    fn test_archive_error_carries_context() {
        let e = DecodeError::archive("central directory offset 512", "bad signature");
        assert!(e.to_string().contains("central directory offset 512"));
    }
}
