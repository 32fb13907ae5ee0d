use std::{io, path::PathBuf};

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("server process is already running (pid {pid})")]
    AlreadyRunning { pid: u32 },

    #[error("failed to spawn server process with command {command:?}: {source}")]
    Os {
        command: Vec<String>,
        #[source]
        source: io::Error,
    },

    #[error("server process {command:?} could not be supervised: {source}")]
    Unwatched {
        command: Vec<String>,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("failed to open instance lock {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid server command: {0}")]
    InvalidCommand(String),

    #[error("server command is empty")]
    EmptyCommand,
}

/// Failure classes the host surfaces to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    LockAcquisitionFailure,
    SpawnFailure,
    RuntimeSpawnError,
    UnexpectedExit,
    LoadFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HostExitCode {
    Normal,
    LockUnavailable,
    ServerSpawnFailed,
    WindowUnavailable,
}

impl HostExitCode {
    pub fn code(self) -> i32 {
        match self {
            Self::Normal => 0,
            Self::LockUnavailable => 2,
            Self::ServerSpawnFailed => 3,
            Self::WindowUnavailable => 4,
        }
    }
}
