//! Error and status types for the CTC engines.
//!
//! Every [`CtcError`] maps onto exactly one [`CtcStatus`], the coarse status
//! taxonomy exposed to callers that only care about the outcome class.

use thiserror::Error;

/// Result type alias for CTC operations.
pub type Result<T> = std::result::Result<T, CtcError>;

/// Coarse outcome of an engine call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CtcStatus {
    Success,
    InvalidValue,
    MemopsFailed,
    ExecutionFailed,
    UnknownError,
}

impl CtcStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CtcStatus::Success => "no error",
            CtcStatus::InvalidValue => "invalid value",
            CtcStatus::MemopsFailed => "memory operation failed",
            CtcStatus::ExecutionFailed => "execution failed",
            CtcStatus::UnknownError => "unknown error",
        }
    }

    /// Status of a finished call.
    pub fn of<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => CtcStatus::Success,
            Err(err) => err.status(),
        }
    }
}

impl std::fmt::Display for CtcStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while sizing or running a CTC computation.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CtcError {
    /// The minibatch holds no sequence.
    #[error("minibatch must contain at least one sequence")]
    EmptyMinibatch,

    /// The blank index is not a class of the alphabet.
    #[error("blank label {blank} is out of range for alphabet of size {alphabet_size}")]
    BlankOutOfRange { blank: usize, alphabet_size: usize },

    /// A buffer does not have the length its shape implies.
    #[error("{what}: expected {expected} elements, got {actual}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// A value of an input buffer violates its domain.
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// The workspace handed to the engine is not exactly the sized length.
    #[error("workspace holds {actual} elements but the batch needs exactly {expected}")]
    WorkspaceSize { expected: usize, actual: usize },

    /// Scratch memory could not be acquired.
    #[error("failed to acquire a workspace of {elements} elements")]
    Memops { elements: usize },

    /// The engine failed while running on its device.
    #[error("execution failed: {0}")]
    Execution(String),

    /// The CPU worker pool could not be created.
    #[error(transparent)]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    /// Run configuration could not be parsed.
    #[error(transparent)]
    Config(#[from] serde_yaml::Error),

    /// Report could not be serialized.
    #[error(transparent)]
    Report(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CtcError {
    pub fn status(&self) -> CtcStatus {
        match self {
            CtcError::EmptyMinibatch
            | CtcError::BlankOutOfRange { .. }
            | CtcError::ShapeMismatch { .. }
            | CtcError::InvalidValue(_)
            | CtcError::WorkspaceSize { .. } => CtcStatus::InvalidValue,
            CtcError::Memops { .. } => CtcStatus::MemopsFailed,
            CtcError::Execution(_) | CtcError::ThreadPool(_) => CtcStatus::ExecutionFailed,
            CtcError::Config(_) | CtcError::Report(_) | CtcError::Io(_) => {
                CtcStatus::UnknownError
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(CtcError::EmptyMinibatch.status(), CtcStatus::InvalidValue);
        assert_eq!(
            CtcError::Memops { elements: 12 }.status(),
            CtcStatus::MemopsFailed
        );
        assert_eq!(
            CtcError::Execution("lost device".into()).status(),
            CtcStatus::ExecutionFailed
        );

        let ok: Result<()> = Ok(());
        assert_eq!(CtcStatus::of(&ok), CtcStatus::Success);
        let err: Result<()> = Err(CtcError::WorkspaceSize {
            expected: 4,
            actual: 5,
        });
        assert_eq!(CtcStatus::of(&err), CtcStatus::InvalidValue);
        assert_eq!(CtcStatus::InvalidValue.to_string(), "invalid value");
    }
}
