use std::{io, path::PathBuf, time::Duration};

use thiserror::Error;

use crate::disk::DiskAddress;

/// Everything that can go wrong while backing up a single VM.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("authentication rejected by {url}")]
    Authentication { url: String },

    #[error("request to {url} failed")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} answered with status {status}: {body}")]
    Api {
        url: String,
        status: u16,
        body: String,
    },

    #[error("cannot decode {what}")]
    Decode {
        what: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("task failed: {code}: {detail}")]
    TaskFailure { code: String, detail: String },

    #[error("task {task} still not finished after {waited:?}")]
    TaskTimeout { task: String, waited: Duration },

    #[error("snapshot does not match its source VM: {detail}")]
    ValidationMismatch { detail: String },

    #[error("disk {disk} of VM {vm} not found in snapshot {snapshot}")]
    DiskNotFound {
        vm: String,
        disk: DiskAddress,
        snapshot: String,
    },

    #[error("{} is already a mount point", path.display())]
    MountConflict { path: PathBuf },

    #[error("cannot mount {export} on {}", path.display())]
    MountFailure {
        export: String,
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("copy {} -> {} failed", src.display(), dst.display())]
    TransferFailure {
        src: PathBuf,
        dst: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl BackupError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Short, stable label used in logs and the final report.
    pub fn kind(&self) -> &'static str {
        match self {
            BackupError::Authentication { .. } => "authentication",
            BackupError::Transport { .. } => "transport",
            BackupError::Api { .. } => "api",
            BackupError::Decode { .. } => "decode",
            BackupError::TaskFailure { .. } => "task-failure",
            BackupError::TaskTimeout { .. } => "task-timeout",
            BackupError::ValidationMismatch { .. } => "validation-mismatch",
            BackupError::DiskNotFound { .. } => "disk-not-found",
            BackupError::MountConflict { .. } => "mount-conflict",
            BackupError::MountFailure { .. } => "mount-failure",
            BackupError::TransferFailure { .. } => "transfer-failure",
            BackupError::Io { .. } => "io",
        }
    }
}
