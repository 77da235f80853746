//! Telemetry Sink — error log line, reason histogram, crash-key annotation
//!
//! Log text, histogram name and crash key are consumed by log scrapers and
//! crash triage tooling. Keep them stable.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::error;

use crate::reason::BadMessageReason;

/// Histogram counting terminations per reason code
pub const BAD_MESSAGE_HISTOGRAM: &str = "Stability.BadMessageTerminated";

/// Crash key holding the most recent reason code
pub const BAD_MESSAGE_CRASH_KEY: &str = "bad_message_reason";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Counter keyed by sample value, only allocating buckets that are hit
#[derive(Debug)]
pub struct SparseHistogram {
    name: &'static str,
    buckets: Mutex<BTreeMap<u32, u64>>,
}

impl SparseHistogram {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            buckets: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn add(&self, sample: u32) {
        let mut buckets = lock(&self.buckets);
        let count = buckets.entry(sample).or_insert(0);
        *count = count.saturating_add(1);
    }

    pub fn count(&self, sample: u32) -> u64 {
        lock(&self.buckets).get(&sample).copied().unwrap_or(0)
    }

    pub fn total_count(&self) -> u64 {
        lock(&self.buckets).values().sum()
    }

    pub fn snapshot(&self) -> BTreeMap<u32, u64> {
        lock(&self.buckets).clone()
    }
}

/// Key/value annotations attached to every diagnostic dump
#[derive(Debug, Default)]
pub struct CrashKeys {
    values: Mutex<HashMap<String, String>>,
}

impl CrashKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: &str, value: impl Into<String>) {
        lock(&self.values).insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<String> {
        lock(&self.values).get(key).cloned()
    }

    pub fn clear(&self, key: &str) {
        lock(&self.values).remove(key);
    }

    /// Sorted copy, so dump records come out in a stable order
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        lock(&self.values)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Records one bad-message event. Never fails and never panics on a
/// poisoned lock.
#[derive(Debug, Clone)]
pub struct Telemetry {
    histogram: Arc<SparseHistogram>,
    crash_keys: Arc<CrashKeys>,
}

impl Telemetry {
    pub fn new(crash_keys: Arc<CrashKeys>) -> Self {
        Self {
            histogram: Arc::new(SparseHistogram::new(BAD_MESSAGE_HISTOGRAM)),
            crash_keys,
        }
    }

    pub fn record(&self, reason: BadMessageReason) {
        error!(
            reason = reason.code(),
            "terminating process for bad IPC message, reason={reason}"
        );
        self.histogram.add(reason.code());
        self.crash_keys
            .set(BAD_MESSAGE_CRASH_KEY, reason.code().to_string());
    }

    pub fn histogram(&self) -> &SparseHistogram {
        &self.histogram
    }

    pub fn crash_keys(&self) -> &Arc<CrashKeys> {
        &self.crash_keys
    }
}
