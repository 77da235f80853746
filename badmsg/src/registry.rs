//! Process Registry — resolving a renderer id to its live host

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

use crate::process::{CrashDumpPolicy, ProcessHost, ProcessId};

/// Lookup from id to live host. `None` means the process already exited.
pub trait ProcessRegistry: Send + Sync {
    fn from_id(&self, id: ProcessId) -> Option<Arc<dyn ProcessHost>>;
}

/// Resolve `id` and shut it down. A miss is a benign race with the child
/// exiting on its own, so it only logs at debug level.
pub fn shutdown_by_id(
    registry: &dyn ProcessRegistry,
    id: ProcessId,
    policy: CrashDumpPolicy,
) -> bool {
    match registry.from_id(id) {
        Some(host) => {
            host.shutdown_for_bad_message(policy);
            true
        }
        None => {
            debug!("Process {id} not found, already exited");
            false
        }
    }
}

/// In-memory registry shared by the host daemon and its control thread
#[derive(Default)]
pub struct HostRegistry {
    hosts: RwLock<HashMap<ProcessId, Arc<dyn ProcessHost>>>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the host previously registered under the same id, if any.
    pub fn register(&self, host: Arc<dyn ProcessHost>) -> Option<Arc<dyn ProcessHost>> {
        let id = host.id();
        self.hosts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, host)
    }

    pub fn unregister(&self, id: ProcessId) -> Option<Arc<dyn ProcessHost>> {
        self.hosts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    pub fn len(&self) -> usize {
        self.hosts.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<ProcessId> {
        let mut ids: Vec<ProcessId> = self
            .hosts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        ids.sort();
        ids
    }
}

impl ProcessRegistry for HostRegistry {
    fn from_id(&self, id: ProcessId) -> Option<Arc<dyn ProcessHost>> {
        self.hosts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct StubHost {
        id: ProcessId,
        calls: Mutex<Vec<CrashDumpPolicy>>,
    }

    impl StubHost {
        fn new(id: u32) -> Arc<Self> {
            Arc::new(Self {
                id: ProcessId::new(id),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    impl ProcessHost for StubHost {
        fn id(&self) -> ProcessId {
            self.id
        }

        fn shutdown_for_bad_message(&self, policy: CrashDumpPolicy) {
            self.calls.lock().unwrap().push(policy);
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = HostRegistry::new();
        assert!(registry.is_empty());

        registry.register(StubHost::new(7));
        registry.register(StubHost::new(3));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.ids(), vec![ProcessId::new(3), ProcessId::new(7)]);
        assert_eq!(
            registry.from_id(ProcessId::new(7)).map(|h| h.id()),
            Some(ProcessId::new(7))
        );
        assert!(registry.from_id(ProcessId::new(8)).is_none());
    }

    #[test]
    fn test_register_replaces_existing() {
        let registry = HostRegistry::new();
        assert!(registry.register(StubHost::new(1)).is_none());
        assert!(registry.register(StubHost::new(1)).is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unregister_makes_lookup_miss() {
        let registry = HostRegistry::new();
        registry.register(StubHost::new(1));
        assert!(registry.unregister(ProcessId::new(1)).is_some());
        assert!(registry.from_id(ProcessId::new(1)).is_none());
    }

    #[test]
    fn test_shutdown_by_id() {
        let registry = HostRegistry::new();
        let host = StubHost::new(5);
        registry.register(host.clone());

        assert!(shutdown_by_id(
            &registry,
            ProcessId::new(5),
            CrashDumpPolicy::NoDump
        ));
        assert!(!shutdown_by_id(
            &registry,
            ProcessId::new(6),
            CrashDumpPolicy::NoDump
        ));
        assert_eq!(*host.calls.lock().unwrap(), vec![CrashDumpPolicy::NoDump]);
    }
}
