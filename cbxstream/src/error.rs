//! Error types for cbxstream
use std::time::Duration;
use thiserror::Error;

/// Engine-level error taxonomy.
///
/// Foreground operations surface these as typed values; background work
/// (preloads, sweeps) logs and swallows them. The enum is `Clone` because a
/// fatal initialization error is stored once per archive identity and handed
/// to every waiter that raced on the same open.
#[derive(Error, Debug, Clone)]
pub enum CbxError {
    #[error("Archive error: {0}")]
    Archive(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Unsupported format: {0}")]
    Unsupported(String),

    #[error("Invalid archive path")]
    InvalidPath,

    #[error("Insufficient scratch space: {needed} bytes needed, {available} available")]
    ResourceExhausted { needed: u64, available: u64 },

    #[error("Archive initialization timed out after {0:?}")]
    InitTimeout(Duration),
}

impl From<std::io::Error> for CbxError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CbxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: CbxError = io.into();
        assert!(matches!(err, CbxError::Io(_)));
        assert!(err.to_string().contains("gone"));
    }

    #[test]
    fn resource_exhausted_names_both_sizes() {
        let err = CbxError::ResourceExhausted {
            needed: 200,
            available: 50,
        };
        let msg = err.to_string();
        assert!(msg.contains("200"));
        assert!(msg.contains("50"));
    }
}
