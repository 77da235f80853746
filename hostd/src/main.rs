//! renderhost daemon
//!
//! Responsibilities:
//! - Read configuration from /etc/renderhost/config.toml
//! - Run the control thread that owns renderer lifecycle
//! - Start renderers and watch their message streams
//! - Terminate renderers that send bad IPC messages
//! - Reap exited renderers
//! - Handle shutdown signals

use anyhow::{Context, Result};
use renderhost_badmsg::{
    BadMessageReason, BadMessageReporter, ControlThread, CrashDumper, CrashKeys, FileDumper,
    HostRegistry, Telemetry,
};
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod supervisor;
mod watcher;

use supervisor::RendererSupervisor;
use watcher::{AllowList, MessageValidator};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

fn main() {
    if let Err(e) = run() {
        eprintln!("FATAL: renderhost-hostd failed: {e:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let (config, config_path) = config::load_config()?;
    init_logging(&config.host.log_level)?;

    info!("========================================");
    info!("  renderhost v{}", env!("CARGO_PKG_VERSION"));
    info!("========================================");
    match config_path {
        Some(path) => info!("Configuration loaded from {path}: name={}", config.host.name),
        None => warn!("Config file not found, using defaults"),
    }

    fs::create_dir_all(&config.bad_message.dump_dir).with_context(|| {
        format!(
            "Failed to create dump directory {}",
            config.bad_message.dump_dir
        )
    })?;

    let crash_keys = Arc::new(CrashKeys::new());
    let dumper: Arc<dyn CrashDumper> = Arc::new(FileDumper::new(
        &config.bad_message.dump_dir,
        Arc::clone(&crash_keys),
    ));
    let registry = Arc::new(HostRegistry::new());
    let control = ControlThread::spawn("renderhost-control").context("Failed to start control thread")?;

    let reporter = BadMessageReporter::new(
        registry.clone(),
        Telemetry::new(crash_keys),
        control.handle(),
        Arc::clone(&dumper),
    );
    let validator: Arc<dyn MessageValidator> = Arc::new(AllowList::new(
        &config.ipc.allowed_messages,
        BadMessageReason::new(config.bad_message.unknown_message_reason),
    ));
    let policy = config.bad_message.termination_policy();
    let supervisor = Arc::new(Mutex::new(RendererSupervisor::new(registry, dumper, policy)));

    info!("Starting {} renderers...", config.renderers.len());
    for renderer in &config.renderers {
        let started = lock(&supervisor).start_renderer(renderer);
        match started {
            Ok((id, stdout)) => {
                watcher::spawn_watcher(
                    id,
                    &renderer.name,
                    stdout,
                    Arc::clone(&validator),
                    reporter.clone(),
                    policy,
                )?;
            }
            Err(e) => warn!("Failed to start {}: {e:#}", renderer.name),
        }
    }

    setup_signal_handlers();

    info!("Entering control loop...");
    control_loop(
        &control,
        &supervisor,
        Duration::from_millis(config.control.reap_interval_ms),
    )?;

    info!("renderhost shutting down...");
    let sup = Arc::clone(&supervisor);
    control
        .handle()
        .run_on_control_thread(move || {
            lock(&sup).stop_all();
        });
    control
        .shutdown()
        .context("Control thread did not stop cleanly")?;

    let histogram = reporter.telemetry().histogram();
    info!(
        "{}: {} terminations {:?}",
        histogram.name(),
        histogram.total_count(),
        histogram.snapshot()
    );
    info!("Clean shutdown complete");
    Ok(())
}

fn lock(supervisor: &Mutex<RendererSupervisor>) -> MutexGuard<'_, RendererSupervisor> {
    supervisor.lock().unwrap_or_else(PoisonError::into_inner)
}

fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("Invalid log level {level}"))?;

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .with_level(true)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;
    Ok(())
}

fn setup_signal_handlers() {
    use nix::sys::signal::{signal, SigHandler, Signal};

    for sig in [Signal::SIGTERM, Signal::SIGINT] {
        // Safety: the handler only stores to an atomic
        if let Err(e) = unsafe { signal(sig, SigHandler::Handler(handle_shutdown)) } {
            warn!("Failed to install {sig} handler: {e}");
        }
    }
}

extern "C" fn handle_shutdown(_sig: nix::libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

/// Reap on the control thread until a shutdown signal arrives or every
/// renderer has exited
fn control_loop(
    control: &ControlThread,
    supervisor: &Arc<Mutex<RendererSupervisor>>,
    interval: Duration,
) -> Result<()> {
    let handle = control.handle();
    while !SHUTDOWN.load(Ordering::SeqCst) {
        let sup = Arc::clone(supervisor);
        handle.run_on_control_thread(move || {
            lock(&sup).reap_exited();
        });
        handle.flush().context("Control thread stopped unexpectedly")?;

        if lock(supervisor).running_count() == 0 {
            info!("No renderers running");
            break;
        }
        std::thread::sleep(interval);
    }
    Ok(())
}
