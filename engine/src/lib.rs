//! The process engine: advances each playing job through its step machine,
//! persisting every transition, with failures captured on the process row.

pub mod process;
pub mod script;

pub use process::{RunOptions, Runner, SCRIPT_FILENAME};

use restflow_store::StoreError;
use restflow_transport::TransportError;

/// A failure inside one job's step.
///
/// Step errors never propagate out of the job's task: they are persisted on
/// the process row as `"<Kind>: <message>"` and flip the job to `excepted`.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("script template error: {0}")]
    Template(#[from] minijinja::Error),

    #[error("checksum mismatch for downloaded file: {path}")]
    ChecksumMismatch { path: String },

    #[error("process has no job id to poll")]
    MissingJobId,
}

impl StepError {
    /// The kind prefix of the persisted exception string.
    pub fn kind(&self) -> &'static str {
        match self {
            StepError::Transport(TransportError::Timeout(_)) => "RuntimeError",
            StepError::ChecksumMismatch { .. } => "RuntimeError",
            StepError::Transport(TransportError::NotFound(_)) => "NotFoundError",
            StepError::Transport(_) => "TransportError",
            StepError::Store(StoreError::ObjectNotFound(_)) => "NotFoundError",
            StepError::Store(StoreError::RowNotFound { .. }) => "NotFoundError",
            StepError::Store(_) => "StorageError",
            StepError::Template(_) => "TemplateError",
            StepError::MissingJobId => "ValueError",
        }
    }

    /// The user-visible string recorded on the process row.
    pub fn persisted(&self) -> String {
        format!("{}: {}", self.kind(), self)
    }
}

/// A failure of the driver itself, outside any single job's step machine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Process exit code for a failure, for the CLI shell:
/// 1 user error, 2 transport failure, 3 storage integrity failure.
pub fn exit_code(err: &EngineError) -> i32 {
    match err {
        EngineError::Store(
            StoreError::Validation(_)
            | StoreError::RowNotFound { .. }
            | StoreError::ObjectNotFound(_)
            | StoreError::AlreadySaved(_)
            | StoreError::Filter(_),
        ) => 1,
        EngineError::Store(
            StoreError::Undeletable(_) | StoreError::Sql(_) | StoreError::Io(_),
        ) => 3,
        EngineError::Transport(_) => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_persists_as_runtime_error() {
        let err = StepError::Transport(TransportError::Timeout(
            "timeout waiting for job to finish".to_string(),
        ));
        assert_eq!(
            err.persisted(),
            "RuntimeError: timeout waiting for job to finish"
        );
    }

    #[test]
    fn checksum_mismatch_persists_as_runtime_error() {
        let err = StepError::ChecksumMismatch {
            path: "out/data.bin".to_string(),
        };
        assert!(err.persisted().starts_with("RuntimeError: checksum mismatch"));
    }

    #[test]
    fn exit_codes_follow_the_taxonomy() {
        let user = EngineError::Store(StoreError::Validation("bad".into()));
        assert_eq!(exit_code(&user), 1);

        let transport = EngineError::Transport(TransportError::Timeout("timeout".into()));
        assert_eq!(exit_code(&transport), 2);

        let integrity = EngineError::Store(StoreError::Undeletable("Client(1)".into()));
        assert_eq!(exit_code(&integrity), 3);
    }
}
