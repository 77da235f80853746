//! Diagnostic dumps taken without crashing the host
//!
//! The crash-reporting backend that uploads these is outside renderhost.
//! [`FileDumper`] only leaves one JSON record per capture on disk.
//!
//! Annotations are a snapshot of [`CrashKeys`] at capture time. A host dump
//! taken for a report by process id is captured on the reporting thread
//! before the reason is recorded on the control thread, so its
//! `bad_message_reason` is the previous report's reason, or absent. Do not
//! read the reason of such a dump from its annotations.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::DumpError;
use crate::process::ProcessId;
use crate::telemetry::CrashKeys;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DumpTarget {
    /// The host itself, captured at the point a bad message was detected.
    /// Its annotations may predate the report that triggered it.
    Host,
    /// A renderer being terminated
    Child { id: ProcessId, pid: u32 },
}

pub trait CrashDumper: Send + Sync {
    /// Best effort; failures are logged, never returned.
    fn capture(&self, target: DumpTarget);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullDumper;

impl CrashDumper for NullDumper {
    fn capture(&self, target: DumpTarget) {
        debug!("Dump capture disabled, skipping {target:?}");
    }
}

#[derive(Serialize)]
struct DumpRecord<'a> {
    id: String,
    captured_at: String,
    host_pid: u32,
    target: &'a DumpTarget,
    annotations: BTreeMap<String, String>,
}

/// Writes `<uuid>.json` dump records into a directory
#[derive(Debug)]
pub struct FileDumper {
    dir: PathBuf,
    crash_keys: Arc<CrashKeys>,
}

impl FileDumper {
    pub fn new(dir: impl Into<PathBuf>, crash_keys: Arc<CrashKeys>) -> Self {
        Self {
            dir: dir.into(),
            crash_keys,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write(&self, target: &DumpTarget) -> Result<PathBuf, DumpError> {
        let id = uuid::Uuid::new_v4().to_string();
        let record = DumpRecord {
            id: id.clone(),
            captured_at: chrono::Utc::now().to_rfc3339(),
            host_pid: std::process::id(),
            target,
            annotations: self.crash_keys.snapshot(),
        };
        let body = serde_json::to_vec_pretty(&record)?;

        let path = self.dir.join(format!("{id}.json"));
        fs::write(&path, body).map_err(|source| DumpError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}

impl CrashDumper for FileDumper {
    fn capture(&self, target: DumpTarget) {
        match self.write(&target) {
            Ok(path) => info!("Captured dump of {target:?} at {}", path.display()),
            Err(e) => warn!("Failed to capture dump of {target:?}: {e}"),
        }
    }
}
