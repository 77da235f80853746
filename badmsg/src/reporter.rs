//! Bad-Message Reporter — the public entry points
//!
//! Every report logs once, counts once and triggers at most one
//! termination. Which dump policy a termination uses depends only on how
//! the caller identified the process:
//!
//! | target | dump before dispatch | termination policy |
//! |--------|----------------------|--------------------|
//! | host   | no                   | `GenerateDump`     |
//! | id     | yes, on caller       | `NoDump`           |
//! | filter | owned by the filter  | owned by the filter|

use std::fmt;
use std::sync::Arc;

use crate::connection::MessageFilter;
use crate::dispatcher::ControlThreadHandle;
use crate::dump::{CrashDumper, DumpTarget};
use crate::process::{CrashDumpPolicy, ProcessHost, ProcessId};
use crate::reason::BadMessageReason;
use crate::registry::{shutdown_by_id, ProcessRegistry};
use crate::telemetry::Telemetry;

/// How the caller identifies the offending process
#[derive(Clone)]
pub enum ProcessTarget {
    /// Already resolved; the caller is allowed to act on it directly.
    Host(Arc<dyn ProcessHost>),
    /// Resolved through the registry on the control thread.
    Id(ProcessId),
    /// Channel bound to one renderer; shutdown is delegated to it.
    Filter(Arc<dyn MessageFilter>),
}

impl fmt::Debug for ProcessTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessTarget::Host(host) => f.debug_tuple("Host").field(&host.id()).finish(),
            ProcessTarget::Id(id) => f.debug_tuple("Id").field(id).finish(),
            ProcessTarget::Filter(filter) => {
                f.debug_tuple("Filter").field(&filter.peer_id()).finish()
            }
        }
    }
}

/// One report, discarded once the termination call returns or the lookup
/// misses
#[derive(Debug, Clone)]
pub struct TerminationRequest {
    pub reason: BadMessageReason,
    pub target: ProcessTarget,
    /// `None` when the filter decides for itself
    pub dump_policy: Option<CrashDumpPolicy>,
}

impl TerminationRequest {
    pub fn new(reason: BadMessageReason, target: ProcessTarget) -> Self {
        let dump_policy = match target {
            ProcessTarget::Host(_) => Some(CrashDumpPolicy::GenerateDump),
            // The reporter already captured a dump before the thread hop
            ProcessTarget::Id(_) => Some(CrashDumpPolicy::NoDump),
            ProcessTarget::Filter(_) => None,
        };
        Self {
            reason,
            target,
            dump_policy,
        }
    }

    /// Whether a host dump must be taken synchronously on the reporting
    /// thread. A dump taken after posting to the control thread no longer
    /// shows where the bad message was detected.
    pub fn dumps_before_dispatch(&self) -> bool {
        matches!(self.target, ProcessTarget::Id(_))
    }
}

#[derive(Clone)]
pub struct BadMessageReporter {
    registry: Arc<dyn ProcessRegistry>,
    telemetry: Telemetry,
    control: ControlThreadHandle,
    dumper: Arc<dyn CrashDumper>,
}

impl BadMessageReporter {
    pub fn new(
        registry: Arc<dyn ProcessRegistry>,
        telemetry: Telemetry,
        control: ControlThreadHandle,
        dumper: Arc<dyn CrashDumper>,
    ) -> Self {
        Self {
            registry,
            telemetry,
            control,
            dumper,
        }
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    /// Report a bad message from `target`. Never fails; a target that has
    /// already exited is silently skipped.
    pub fn report(&self, target: ProcessTarget, reason: BadMessageReason) {
        let request = TerminationRequest::new(reason, target);

        if request.dumps_before_dispatch() {
            self.dumper.capture(DumpTarget::Host);
        }

        match request.target {
            ProcessTarget::Host(host) => {
                self.telemetry.record(reason);
                if let Some(policy) = request.dump_policy {
                    host.shutdown_for_bad_message(policy);
                }
            }
            ProcessTarget::Filter(filter) => {
                self.telemetry.record(reason);
                filter.shutdown_for_bad_message();
            }
            ProcessTarget::Id(id) => {
                let policy = request.dump_policy.unwrap_or(CrashDumpPolicy::NoDump);
                let telemetry = self.telemetry.clone();
                let registry = Arc::clone(&self.registry);
                self.control.run_on_control_thread(move || {
                    telemetry.record(reason);
                    shutdown_by_id(registry.as_ref(), id, policy);
                });
            }
        }
    }

    /// The caller already holds a live host and may act on it directly.
    pub fn received_bad_message(&self, host: &Arc<dyn ProcessHost>, reason: BadMessageReason) {
        self.report(ProcessTarget::Host(Arc::clone(host)), reason);
    }

    /// Safe from any thread; termination runs on the control thread.
    pub fn received_bad_message_for_id(&self, id: ProcessId, reason: BadMessageReason) {
        self.report(ProcessTarget::Id(id), reason);
    }

    pub fn received_bad_message_from_filter(
        &self,
        filter: &Arc<dyn MessageFilter>,
        reason: BadMessageReason,
    ) {
        self.report(ProcessTarget::Filter(Arc::clone(filter)), reason);
    }
}

impl fmt::Debug for BadMessageReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BadMessageReporter")
            .field("telemetry", &self.telemetry)
            .field("control", &self.control)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Idle(ProcessId);

    impl ProcessHost for Idle {
        fn id(&self) -> ProcessId {
            self.0
        }

        fn shutdown_for_bad_message(&self, _policy: CrashDumpPolicy) {}
    }

    #[test]
    fn test_dump_policy_per_target() {
        let reason = BadMessageReason::new(1);
        let host: Arc<dyn ProcessHost> = Arc::new(Idle(ProcessId::new(1)));

        let by_host = TerminationRequest::new(reason, ProcessTarget::Host(host));
        assert_eq!(by_host.dump_policy, Some(CrashDumpPolicy::GenerateDump));
        assert!(!by_host.dumps_before_dispatch());

        let by_id = TerminationRequest::new(reason, ProcessTarget::Id(ProcessId::new(1)));
        assert_eq!(by_id.dump_policy, Some(CrashDumpPolicy::NoDump));
        assert!(by_id.dumps_before_dispatch());
    }

    #[test]
    fn test_target_debug_shows_id() {
        let target = ProcessTarget::Id(ProcessId::new(12));
        assert_eq!(format!("{target:?}"), "Id(ProcessId(12))");
    }
}
