//! Per-renderer message watcher
//!
//! Each renderer's stdout carries one message per line, the first word
//! naming the message kind. A worker thread per renderer checks every
//! message and reports rejected ones by renderer id. Lines that are not
//! valid UTF-8 are rejected too.
//!
//! The watcher keeps draining the stream until it ends, so a renderer is
//! never left blocked on a full pipe. When renderers are killed for bad
//! messages only the first rejection is reported; with kill disabled every
//! rejection is.

use anyhow::{Context, Result};
use renderhost_badmsg::{BadMessageReason, BadMessageReporter, ProcessId, TerminationPolicy};
use std::collections::HashSet;
use std::io::{BufRead, BufReader, Read};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// Decides whether a renderer message is acceptable
pub trait MessageValidator: Send + Sync {
    fn validate(&self, message: &str) -> Result<(), BadMessageReason>;

    /// Reason used for a line that is not valid UTF-8
    fn malformed_reason(&self) -> BadMessageReason;

    fn validate_bytes(&self, line: &[u8]) -> Result<(), BadMessageReason> {
        match std::str::from_utf8(line) {
            Ok(message) => self.validate(message),
            Err(_) => Err(self.malformed_reason()),
        }
    }
}

/// Accepts only messages whose kind is on the list
#[derive(Debug)]
pub struct AllowList {
    allowed: HashSet<String>,
    reject_reason: BadMessageReason,
}

impl AllowList {
    pub fn new<I, S>(allowed: I, reject_reason: BadMessageReason) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: allowed.into_iter().map(Into::into).collect(),
            reject_reason,
        }
    }
}

impl MessageValidator for AllowList {
    fn validate(&self, message: &str) -> Result<(), BadMessageReason> {
        match message.split_whitespace().next() {
            None => Ok(()),
            Some(kind) if self.allowed.contains(kind) => Ok(()),
            Some(_) => Err(self.reject_reason),
        }
    }

    fn malformed_reason(&self) -> BadMessageReason {
        self.reject_reason
    }
}

/// Spawn the worker thread watching one renderer
pub fn spawn_watcher<R>(
    id: ProcessId,
    name: &str,
    stream: R,
    validator: Arc<dyn MessageValidator>,
    reporter: BadMessageReporter,
    policy: TerminationPolicy,
) -> Result<JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    thread::Builder::new()
        .name(format!("watch-{name}"))
        .spawn(move || {
            watch(id, BufReader::new(stream), validator.as_ref(), &reporter, policy);
        })
        .with_context(|| format!("Failed to spawn watcher for renderer {name}"))
}

/// Read until the stream ends, returning the reasons that were reported
fn watch<R: BufRead>(
    id: ProcessId,
    reader: R,
    validator: &dyn MessageValidator,
    reporter: &BadMessageReporter,
    policy: TerminationPolicy,
) -> Vec<BadMessageReason> {
    let mut reported = Vec::new();

    for line in reader.split(b'\n') {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                debug!("Renderer {id} stream closed: {e}");
                return reported;
            }
        };

        // Once a kill is on its way, just drain
        if policy.kill_enabled && !reported.is_empty() {
            continue;
        }

        if let Err(reason) = validator.validate_bytes(&line) {
            let kind = String::from_utf8_lossy(&line)
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .to_string();
            warn!("Renderer {id} sent rejected message kind {kind:?}");
            reporter.received_bad_message_for_id(id, reason);
            reported.push(reason);
        }
    }
    debug!("Renderer {id} stream ended");
    reported
}

#[cfg(test)]
mod tests {
    use super::*;
    use renderhost_badmsg::{
        ControlThread, CrashDumpPolicy, CrashKeys, HostRegistry, NullDumper, ProcessHost,
        Telemetry,
    };
    use std::io::Cursor;
    use std::sync::Mutex;

    struct FlaggedHost {
        id: ProcessId,
        policies: Mutex<Vec<CrashDumpPolicy>>,
    }

    impl ProcessHost for FlaggedHost {
        fn id(&self) -> ProcessId {
            self.id
        }

        fn shutdown_for_bad_message(&self, policy: CrashDumpPolicy) {
            self.policies.lock().unwrap().push(policy);
        }
    }

    fn flagged_fixture(id: u32) -> (ControlThread, Arc<FlaggedHost>, BadMessageReporter) {
        let control = ControlThread::spawn("watch-control").unwrap();
        let registry = Arc::new(HostRegistry::new());
        let host = Arc::new(FlaggedHost {
            id: ProcessId::new(id),
            policies: Mutex::new(Vec::new()),
        });
        registry.register(host.clone());
        let reporter = BadMessageReporter::new(
            registry,
            Telemetry::new(Arc::new(CrashKeys::new())),
            control.handle(),
            Arc::new(NullDumper),
        );
        (control, host, reporter)
    }

    fn allow_list() -> AllowList {
        AllowList::new(["ping", "frame"], BadMessageReason::new(77))
    }

    #[test]
    fn test_allow_list() {
        let list = allow_list();
        assert!(list.validate("ping").is_ok());
        assert!(list.validate("frame 1920 1080").is_ok());
        assert!(list.validate("   ").is_ok());
        assert_eq!(list.validate("exec /bin/sh"), Err(BadMessageReason::new(77)));
    }

    #[test]
    fn test_watch_reports_first_rejected_message() {
        let (control, host, reporter) = flagged_fixture(3);

        let stream = Cursor::new("ping\nframe 1 2\nopen_file /etc/shadow\nexec sh\n");
        let reported = watch(
            ProcessId::new(3),
            stream,
            &allow_list(),
            &reporter,
            TerminationPolicy::default(),
        );
        control.handle().flush().unwrap();

        assert_eq!(reported, vec![BadMessageReason::new(77)]);
        assert_eq!(*host.policies.lock().unwrap(), vec![CrashDumpPolicy::NoDump]);
        assert_eq!(reporter.telemetry().histogram().count(77), 1);
    }

    #[test]
    fn test_watch_clean_stream_reports_nothing() {
        let control = ControlThread::spawn("watch-control").unwrap();
        let reporter = BadMessageReporter::new(
            Arc::new(HostRegistry::new()),
            Telemetry::new(Arc::new(CrashKeys::new())),
            control.handle(),
            Arc::new(NullDumper),
        );

        let reported = watch(
            ProcessId::new(1),
            Cursor::new("ping\nping\n"),
            &allow_list(),
            &reporter,
            TerminationPolicy::default(),
        );
        control.handle().flush().unwrap();

        assert!(reported.is_empty());
        assert_eq!(reporter.telemetry().histogram().total_count(), 0);
    }

    #[test]
    fn test_watch_reports_invalid_utf8() {
        let (control, host, reporter) = flagged_fixture(4);

        let stream = Cursor::new(b"ping\n\xff\xfe exec\nexec sh\n".to_vec());
        let reported = watch(
            ProcessId::new(4),
            stream,
            &allow_list(),
            &reporter,
            TerminationPolicy::default(),
        );
        control.handle().flush().unwrap();

        assert_eq!(reported, vec![BadMessageReason::new(77)]);
        assert_eq!(*host.policies.lock().unwrap(), vec![CrashDumpPolicy::NoDump]);
        assert_eq!(reporter.telemetry().histogram().count(77), 1);
    }

    #[test]
    fn test_watch_keeps_reporting_with_kill_disabled() {
        let (control, host, reporter) = flagged_fixture(5);

        let stream = Cursor::new("exec sh\nping\nopen_file /etc/shadow\nframe 1 2\n");
        let reported = watch(
            ProcessId::new(5),
            stream,
            &allow_list(),
            &reporter,
            TerminationPolicy { kill_enabled: false },
        );
        control.handle().flush().unwrap();

        assert_eq!(reported.len(), 2);
        assert_eq!(host.policies.lock().unwrap().len(), 2);
        assert_eq!(reporter.telemetry().histogram().count(77), 2);
    }
}
