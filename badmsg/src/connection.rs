//! Message filters bound to a single renderer
//!
//! A filter sits on one renderer's channel and knows how to shut that
//! renderer down. It owns its own thread hop and dump decision, so the
//! reporter only logs and delegates.

use std::fmt;
use std::sync::Arc;

use crate::dispatcher::ControlThreadHandle;
use crate::dump::{CrashDumper, DumpTarget};
use crate::process::{CrashDumpPolicy, ProcessId};
use crate::registry::{shutdown_by_id, ProcessRegistry};

pub trait MessageFilter: Send + Sync {
    /// The renderer this filter's channel is connected to
    fn peer_id(&self) -> ProcessId;

    fn shutdown_for_bad_message(&self);
}

/// Filter for a renderer channel served off the control thread
///
/// Shutdown captures a host dump where the bad message was seen, then asks
/// the control thread to terminate the peer without a second dump.
pub struct ChannelFilter {
    peer: ProcessId,
    registry: Arc<dyn ProcessRegistry>,
    control: ControlThreadHandle,
    dumper: Arc<dyn CrashDumper>,
}

impl ChannelFilter {
    pub fn new(
        peer: ProcessId,
        registry: Arc<dyn ProcessRegistry>,
        control: ControlThreadHandle,
        dumper: Arc<dyn CrashDumper>,
    ) -> Self {
        Self {
            peer,
            registry,
            control,
            dumper,
        }
    }
}

impl MessageFilter for ChannelFilter {
    fn peer_id(&self) -> ProcessId {
        self.peer
    }

    fn shutdown_for_bad_message(&self) {
        self.dumper.capture(DumpTarget::Host);

        let registry = Arc::clone(&self.registry);
        let peer = self.peer;
        self.control.run_on_control_thread(move || {
            shutdown_by_id(registry.as_ref(), peer, CrashDumpPolicy::NoDump);
        });
    }
}

impl fmt::Debug for ChannelFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelFilter")
            .field("peer", &self.peer)
            .field("control", &self.control)
            .finish()
    }
}
