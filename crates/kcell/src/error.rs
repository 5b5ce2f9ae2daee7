//! Error types.
//!
//! Transport and launch failures travel as `anyhow::Error`; everything a user
//! can trigger from a command is a [`SessionError`] so the session can turn it
//! into a single notification.

use crate::position::BufferId;

/// Cell construction errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CellError {
    #[error("cell anchors live in different buffers ({begin} and {end})")]
    BufferMismatch { begin: BufferId, end: BufferId },
}

/// Integrity errors raised while reading or writing save files.
#[derive(Debug, thiserror::Error)]
pub enum SaveFileError {
    #[error("Missing key: {0}")]
    MissingKey(String),

    #[error("Incorrect type for key '{key}': expected {expected}, got {found}")]
    IncorrectType {
        key: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Bad version: {0}")]
    BadVersion(i64),

    #[error("Bad status: {0}")]
    BadStatus(i64),

    #[error("Buffer contents' checksum does not match!")]
    ChecksumMismatch,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Kernel protocol violations detected while ticking.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("bad value for output status: {0}")]
    UnexpectedStatus(String),
}

/// User-facing command failures.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("No kernel is initialized for this buffer; run init to start one.")]
    NotInitialized,

    #[error("No running kernel with id '{0}'.")]
    UnknownKernel(String),

    #[error("Multiple kernels are attached to this buffer; choose one of: {}", .0.join(", "))]
    AmbiguousKernel(Vec<String>),

    #[error("Kernel is already initialized for this buffer; load initializes a kernel.")]
    AlreadyInitialized,

    #[error("Buffer does not correspond to a file")]
    NoFile,

    #[error("Invalid selection: {0}")]
    BadSelection(String),

    #[error("Unable to find any kernels to launch.")]
    NoKernels,

    #[error("No running kernels to share. Run init without the shared option.")]
    NoSharedKernels,

    #[error("Choose a kernel to start: {}", .0.join(", "))]
    KernelChoice(Vec<String>),

    #[error("Could not start kernel '{name}': {source}")]
    Launch {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Error while doing IO: {0}")]
    Io(#[from] SaveFileError),

    #[error("{0}")]
    Notebook(String),

    #[error("Unknown option '{0}'")]
    UnknownOption(String),

    #[error("Invalid value for option '{name}': {reason}")]
    InvalidOption { name: String, reason: String },

    #[error(transparent)]
    Cell(#[from] CellError),
}

pub type SessionResult<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_file_error_messages() {
        assert_eq!(
            SaveFileError::MissingKey("cells".into()).to_string(),
            "Missing key: cells"
        );
        let err = SaveFileError::IncorrectType {
            key: "version".into(),
            expected: "int",
            found: "str",
        };
        assert_eq!(
            err.to_string(),
            "Incorrect type for key 'version': expected int, got str"
        );
    }

    #[test]
    fn test_io_wrapper_prefix() {
        let err: SessionError = SaveFileError::ChecksumMismatch.into();
        assert_eq!(
            err.to_string(),
            "Error while doing IO: Buffer contents' checksum does not match!"
        );
    }

    #[test]
    fn test_ambiguous_kernel_lists_choices() {
        let err = SessionError::AmbiguousKernel(vec!["python3".into(), "python3_1".into()]);
        assert!(err.to_string().ends_with("python3, python3_1"));
    }
}
