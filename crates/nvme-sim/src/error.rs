use std::path::PathBuf;

use thiserror::Error;

use crate::memory::MemoryError;

/// Invalid or unreadable controller configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("namespace id {0:#x} is reserved")]
    ReservedNamespaceId(u32),

    #[error("namespace id {0} is configured more than once")]
    DuplicateNamespace(u32),

    #[error("invalid value for `{field}`: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: String,
    },

    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors constructing a [`crate::Controller`].
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to spawn doorbell watch thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Conditions that put the controller into Controller Fatal Status (CSTS.CFS). Command
/// processing stops until the next reset.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControllerFault {
    #[error("invalid enable parameters: {0}")]
    InvalidEnable(&'static str),

    #[error("failed to fetch command from submission queue {sqid}: {source}")]
    SubmissionQueueRead {
        sqid: u16,
        #[source]
        source: MemoryError,
    },

    #[error("failed to post completion to completion queue {cqid}: {source}")]
    CompletionQueueWrite {
        cqid: u16,
        #[source]
        source: MemoryError,
    },

    #[error("submission queue {sqid} references missing completion queue {cqid}")]
    MissingCompletionQueue { sqid: u16, cqid: u16 },
}
