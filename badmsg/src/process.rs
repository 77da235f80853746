//! Shutdown Controller — terminating a renderer for a bad message
//!
//! A [`ChildProcessHost`] moves through `Running -> TerminationRequested ->
//! Gone`. Only the first transition out of `Running` captures a dump and
//! signals the child; every later request is a no-op.

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::dump::{CrashDumper, DumpTarget};
use crate::error::TerminateError;

/// Host-assigned renderer id, stable for the life of the child
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(u32);

impl ProcessId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether the termination call itself captures a dump
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrashDumpPolicy {
    GenerateDump,
    NoDump,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessState {
    Running = 0,
    TerminationRequested = 1,
    Gone = 2,
}

impl ProcessState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ProcessState::Running,
            1 => ProcessState::TerminationRequested,
            _ => ProcessState::Gone,
        }
    }
}

/// A live child process that can be torn down for a bad message
pub trait ProcessHost: Send + Sync {
    fn id(&self) -> ProcessId;

    /// Must be idempotent: repeated calls on a terminating or exited child
    /// do nothing.
    fn shutdown_for_bad_message(&self, policy: CrashDumpPolicy);
}

#[derive(Debug, Clone, Copy)]
pub struct TerminationPolicy {
    /// When false, bad messages are still logged and counted but the child
    /// keeps running.
    pub kill_enabled: bool,
}

impl Default for TerminationPolicy {
    fn default() -> Self {
        Self { kill_enabled: true }
    }
}

/// Renderer child identified by its OS pid
pub struct ChildProcessHost {
    id: ProcessId,
    pid: u32,
    state: AtomicU8,
    dumper: Arc<dyn CrashDumper>,
    policy: TerminationPolicy,
}

impl ChildProcessHost {
    pub fn new(
        id: ProcessId,
        pid: u32,
        dumper: Arc<dyn CrashDumper>,
        policy: TerminationPolicy,
    ) -> Self {
        Self {
            id,
            pid,
            state: AtomicU8::new(ProcessState::Running as u8),
            dumper,
            policy,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        ProcessState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Record that the child has been reaped. Its pid may be reused after
    /// this, so no signal is ever sent again.
    pub fn mark_gone(&self) {
        self.state.store(ProcessState::Gone as u8, Ordering::Release);
    }

    /// Terminate the child, returning the state it was left in.
    pub fn terminate(&self, policy: CrashDumpPolicy) -> Result<ProcessState, TerminateError> {
        if !self.policy.kill_enabled {
            info!(
                "Kill after bad IPC disabled, leaving process {} (PID {}) running",
                self.id, self.pid
            );
            return Ok(self.state());
        }

        if self.pid == std::process::id() {
            warn!(
                "Process {} shares the host PID {}, not terminating",
                self.id, self.pid
            );
            return Ok(self.state());
        }

        let raw_pid = self.raw_pid()?;

        if self
            .state
            .compare_exchange(
                ProcessState::Running as u8,
                ProcessState::TerminationRequested as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            debug!(
                "Process {} already {:?}, ignoring termination request",
                self.id,
                self.state()
            );
            return Ok(self.state());
        }

        if policy == CrashDumpPolicy::GenerateDump {
            self.dumper.capture(DumpTarget::Child {
                id: self.id,
                pid: self.pid,
            });
        }

        match self.send_kill(raw_pid) {
            Ok(true) => info!("Sent SIGKILL to process {} (PID {})", self.id, self.pid),
            Ok(false) => {
                debug!("Process {} (PID {}) already exited", self.id, self.pid);
                self.mark_gone();
            }
            Err(e) => {
                // No signal was delivered; let a later request try again
                let _ = self.state.compare_exchange(
                    ProcessState::TerminationRequested as u8,
                    ProcessState::Running as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                return Err(e);
            }
        }
        Ok(self.state())
    }

    /// Pid 0 and negative pids address process groups, never one child.
    fn raw_pid(&self) -> Result<i32, TerminateError> {
        i32::try_from(self.pid)
            .ok()
            .filter(|pid| *pid > 0)
            .ok_or(TerminateError::InvalidPid(self.pid))
    }

    /// Returns false when the OS reports no such process.
    fn send_kill(&self, raw_pid: i32) -> Result<bool, TerminateError> {
        match kill(Pid::from_raw(raw_pid), Signal::SIGKILL) {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH) => Ok(false),
            Err(source) => Err(TerminateError::Signal {
                pid: self.pid,
                source,
            }),
        }
    }
}

impl ProcessHost for ChildProcessHost {
    fn id(&self) -> ProcessId {
        self.id
    }

    fn shutdown_for_bad_message(&self, policy: CrashDumpPolicy) {
        if let Err(e) = self.terminate(policy) {
            warn!("Failed to terminate process {}: {e}", self.id);
        }
    }
}

impl fmt::Debug for ChildProcessHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildProcessHost")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("state", &self.state())
            .field("policy", &self.policy)
            .finish()
    }
}
