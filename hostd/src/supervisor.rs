//! Renderer supervisor for renderhost
//!
//! Spawns renderers, registers them with the process registry and reaps
//! them when they exit. Renderers are never restarted.
//!
//! Reaping and bad-message termination both run on the control thread, so
//! a pid is never signalled after its child has been reaped.

use anyhow::{Context, Result};
use renderhost_badmsg::{
    ChildProcessHost, CrashDumper, HostRegistry, ProcessHost, ProcessId, TerminationPolicy,
};
use std::collections::HashMap;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::config::RendererConfig;

/// A running renderer managed by the supervisor
struct ManagedRenderer {
    name: String,
    host: Arc<ChildProcessHost>,
    process: Child,
    started_at: Instant,
}

pub struct RendererSupervisor {
    renderers: HashMap<ProcessId, ManagedRenderer>,
    registry: Arc<HostRegistry>,
    dumper: Arc<dyn CrashDumper>,
    policy: TerminationPolicy,
    next_id: u32,
}

impl RendererSupervisor {
    pub fn new(
        registry: Arc<HostRegistry>,
        dumper: Arc<dyn CrashDumper>,
        policy: TerminationPolicy,
    ) -> Self {
        Self {
            renderers: HashMap::new(),
            registry,
            dumper,
            policy,
            next_id: 1,
        }
    }

    /// Start a renderer and register it. Returns its id and the stdout
    /// stream carrying its messages.
    pub fn start_renderer(&mut self, config: &RendererConfig) -> Result<(ProcessId, ChildStdout)> {
        info!("Starting renderer: {}", config.name);
        let mut child = Command::new(&config.binary)
            .args(&config.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to start renderer {} ({})", config.name, config.binary))?;

        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                anyhow::bail!("Renderer {} has no stdout pipe", config.name);
            }
        };

        let id = ProcessId::new(self.next_id);
        self.next_id += 1;

        let host = Arc::new(ChildProcessHost::new(
            id,
            child.id(),
            Arc::clone(&self.dumper),
            self.policy,
        ));
        self.registry.register(host.clone());
        info!("Renderer {} started as id {id} with PID {}", config.name, child.id());

        self.renderers.insert(
            id,
            ManagedRenderer {
                name: config.name.clone(),
                host,
                process: child,
                started_at: Instant::now(),
            },
        );

        Ok((id, stdout))
    }

    /// Reap renderers that have exited and drop them from the registry
    pub fn reap_exited(&mut self) -> Vec<ProcessId> {
        let mut reaped = Vec::new();
        let mut unknown = Vec::new();

        for (id, renderer) in &mut self.renderers {
            match renderer.process.try_wait() {
                Ok(Some(status)) => {
                    info!(
                        "Renderer {} (id {id}, PID {}) exited after {:?}: {status}",
                        renderer.name,
                        renderer.host.pid(),
                        renderer.started_at.elapsed()
                    );
                    reaped.push(*id);
                }
                Ok(None) => {}
                Err(e) => {
                    error!("Error checking renderer {}: {e}", renderer.name);
                    unknown.push(*id);
                }
            }
        }

        for id in &reaped {
            self.forget(*id);
        }
        // Status unknown: kill before dropping the handle so no child is orphaned
        for id in unknown {
            self.stop_renderer(id);
            reaped.push(id);
        }
        reaped
    }

    /// Kill one renderer, wait for it and drop it from the registry
    fn stop_renderer(&mut self, id: ProcessId) {
        if let Some(renderer) = self.renderers.get_mut(&id) {
            info!("Killing renderer {} (PID {})", renderer.name, renderer.host.pid());
            let _ = renderer.process.kill();
            match renderer.process.wait() {
                Ok(status) => info!("Renderer {} exited: {status}", renderer.name),
                Err(e) => warn!("Error waiting for {}: {e}", renderer.name),
            }
        }
        self.forget(id);
    }

    fn forget(&mut self, id: ProcessId) {
        if let Some(renderer) = self.renderers.remove(&id) {
            renderer.host.mark_gone();
            self.registry.unregister(renderer.host.id());
        }
    }

    pub fn running_count(&self) -> usize {
        self.renderers.len()
    }

    /// Stop all renderers, waiting for each to exit
    pub fn stop_all(&mut self) {
        info!("Stopping all renderers...");
        let ids: Vec<ProcessId> = self.renderers.keys().copied().collect();

        for id in ids {
            self.stop_renderer(id);
        }
        info!("All renderers stopped");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use renderhost_badmsg::{CrashDumpPolicy, NullDumper, ProcessRegistry, ProcessState};
    use std::time::Duration;

    fn sleeper(name: &str) -> RendererConfig {
        RendererConfig {
            name: name.to_string(),
            binary: "sleep".to_string(),
            args: vec!["30".to_string()],
        }
    }

    fn reap_until_empty(sup: &mut RendererSupervisor) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while sup.running_count() > 0 && Instant::now() < deadline {
            sup.reap_exited();
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn test_supervisor_creation() {
        let sup = RendererSupervisor::new(
            Arc::new(HostRegistry::new()),
            Arc::new(NullDumper),
            TerminationPolicy::default(),
        );
        assert_eq!(sup.running_count(), 0);
    }

    #[test]
    fn test_terminated_renderer_is_reaped_and_unregistered() {
        let registry = Arc::new(HostRegistry::new());
        let mut sup = RendererSupervisor::new(
            registry.clone(),
            Arc::new(NullDumper),
            TerminationPolicy::default(),
        );

        let (first, _out1) = sup.start_renderer(&sleeper("tab-1")).unwrap();
        let (second, _out2) = sup.start_renderer(&sleeper("tab-2")).unwrap();
        assert_ne!(first, second);
        assert_eq!(registry.len(), 2);

        registry
            .from_id(first)
            .unwrap()
            .shutdown_for_bad_message(CrashDumpPolicy::NoDump);

        let deadline = Instant::now() + Duration::from_secs(5);
        while sup.running_count() > 1 && Instant::now() < deadline {
            sup.reap_exited();
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(sup.running_count(), 1);
        assert!(registry.from_id(first).is_none());
        assert!(registry.from_id(second).is_some());

        sup.stop_all();
        reap_until_empty(&mut sup);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_missing_binary_fails_to_start() {
        let registry = Arc::new(HostRegistry::new());
        let mut sup = RendererSupervisor::new(
            registry.clone(),
            Arc::new(NullDumper),
            TerminationPolicy::default(),
        );
        let config = RendererConfig {
            name: "ghost".to_string(),
            binary: "/nonexistent/renderer".to_string(),
            args: vec![],
        };
        assert!(sup.start_renderer(&config).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_stopped_renderer_is_killed_before_it_is_forgotten() {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let registry = Arc::new(HostRegistry::new());
        let mut sup = RendererSupervisor::new(
            registry.clone(),
            Arc::new(NullDumper),
            TerminationPolicy::default(),
        );
        let (id, _out) = sup.start_renderer(&sleeper("tab-1")).unwrap();
        let host = Arc::clone(&sup.renderers[&id].host);
        let pid = host.pid();

        sup.stop_renderer(id);

        assert_eq!(sup.running_count(), 0);
        assert!(registry.from_id(id).is_none());
        assert_eq!(host.state(), ProcessState::Gone);
        // Waited on, so the pid no longer names a process
        assert!(kill(Pid::from_raw(pid as i32), None).is_err());
    }
}
