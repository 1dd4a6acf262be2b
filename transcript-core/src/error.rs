//! Error types for transcript operations

/// Result type for transcript operations
pub type Result<T> = std::result::Result<T, TranscriptError>;

/// Error types for writing and replaying transcripts
#[derive(Debug, thiserror::Error)]
pub enum TranscriptError {
    /// Input rejected: duplicate header key, dirty scratch directory, unknown key
    #[error("Validation error: {0}")]
    Validation(String),

    /// Archive is not a transcript or its header is corrupt
    #[error("Format error: {0}")]
    Format(String),

    /// Operation not allowed in the current lifecycle state
    #[error("State error: {0}")]
    State(String),

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Payload or header value could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Zip container error
    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse error classification callers can branch on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Format,
    State,
    Io,
}

impl TranscriptError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            TranscriptError::Validation(_) | TranscriptError::Configuration(_) => {
                ErrorKind::Validation
            }
            TranscriptError::Serialization(_) => ErrorKind::Validation,
            TranscriptError::Format(_) => ErrorKind::Format,
            TranscriptError::State(_) => ErrorKind::State,
            TranscriptError::Archive(zip::result::ZipError::Io(_)) => ErrorKind::Io,
            TranscriptError::Archive(_) => ErrorKind::Format,
            TranscriptError::Io(_) => ErrorKind::Io,
        }
    }

    pub(crate) fn sealed() -> Self {
        TranscriptError::State("transcript writer is already sealed".to_string())
    }

    pub(crate) fn closed() -> Self {
        TranscriptError::State("transcript reader is closed".to_string())
    }

    pub(crate) fn not_a_transcript(reason: impl std::fmt::Display) -> Self {
        TranscriptError::Format(format!("not a transcript: {}", reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(TranscriptError::sealed().kind(), ErrorKind::State);
        assert_eq!(
            TranscriptError::not_a_transcript("missing header").kind(),
            ErrorKind::Format
        );
        assert_eq!(
            TranscriptError::from(std::io::Error::other("disk full")).kind(),
            ErrorKind::Io
        );
        assert_eq!(
            TranscriptError::Archive(zip::result::ZipError::FileNotFound).kind(),
            ErrorKind::Format
        );
        assert_eq!(
            TranscriptError::Validation("duplicate".into()).kind(),
            ErrorKind::Validation
        );
    }

    #[test]
    fn test_display_messages() {
        let err = TranscriptError::not_a_transcript("no transcript.json entry");
        assert_eq!(
            err.to_string(),
            "Format error: not a transcript: no transcript.json entry"
        );
    }
}
