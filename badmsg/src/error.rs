//! Error types for the bad-message subsystem
//!
//! None of these escape [`crate::BadMessageReporter`]; they surface from the
//! lower-level pieces and are logged where the reporter swallows them.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("control thread queue is closed")]
    QueueClosed,
    #[error("failed to spawn control thread")]
    Spawn(#[source] std::io::Error),
    #[error("control thread panicked")]
    Panicked,
}

#[derive(Debug, Error)]
pub enum TerminateError {
    #[error("refusing to signal invalid pid {0}")]
    InvalidPid(u32),
    #[error("failed to signal pid {pid}")]
    Signal {
        pid: u32,
        #[source]
        source: nix::errno::Errno,
    },
}

#[derive(Debug, Error)]
pub enum DumpError {
    #[error("failed to write dump {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize dump record")]
    Serialize(#[from] serde_json::Error),
}
