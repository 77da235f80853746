//! renderhost bad-message handling
//!
//! When a validation call site decides that a renderer sent a malformed,
//! unexpected or policy-violating IPC message, it hands the offending
//! process to [`BadMessageReporter`]. The reporter logs the event, bumps the
//! reason histogram, annotates crash context and terminates that one child.
//!
//! Termination always happens on the control thread, the single thread that
//! owns renderer lifecycle. Reports arriving by process id from any other
//! thread are posted there through [`ControlThreadHandle`].

pub mod connection;
pub mod dispatcher;
pub mod dump;
pub mod error;
pub mod process;
pub mod reason;
pub mod registry;
pub mod reporter;
pub mod telemetry;

pub use connection::{ChannelFilter, MessageFilter};
pub use dispatcher::{ControlThread, ControlThreadHandle};
pub use dump::{CrashDumper, DumpTarget, FileDumper, NullDumper};
pub use error::{DispatchError, DumpError, TerminateError};
pub use process::{
    ChildProcessHost, CrashDumpPolicy, ProcessHost, ProcessId, ProcessState, TerminationPolicy,
};
pub use reason::BadMessageReason;
pub use registry::{HostRegistry, ProcessRegistry};
pub use reporter::{BadMessageReporter, ProcessTarget, TerminationRequest};
pub use telemetry::{CrashKeys, SparseHistogram, Telemetry};
