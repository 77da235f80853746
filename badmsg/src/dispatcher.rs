//! Control-Thread Dispatcher
//!
//! One dedicated thread owns renderer lifecycle. Work reaches it as boxed
//! closures over an unbounded queue; senders never block and never learn
//! whether their task ran. Tasks from a single sender run in FIFO order.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle, ThreadId};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::error::DispatchError;

type Task = Box<dyn FnOnce() + Send + 'static>;

enum ControlMessage {
    Run(Task),
    Stop,
}

/// Cloneable handle for posting work to the control thread
#[derive(Clone)]
pub struct ControlThreadHandle {
    sender: mpsc::UnboundedSender<ControlMessage>,
    thread_id: ThreadId,
}

impl ControlThreadHandle {
    /// True when called from the control thread itself
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Queue `task` without running it inline, even on the control thread.
    pub fn post<F>(&self, task: F) -> Result<(), DispatchError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.sender
            .send(ControlMessage::Run(Box::new(task)))
            .map_err(|_| DispatchError::QueueClosed)
    }

    /// Run inline when already on the control thread, otherwise post and
    /// return immediately. A closed queue drops the task.
    pub fn run_on_control_thread<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_current() {
            task();
            return;
        }
        if let Err(e) = self.post(task) {
            debug!("Dropping control-thread task: {e}");
        }
    }

    /// Block until every task queued before this call has run.
    ///
    /// Returns immediately on the control thread, where earlier tasks cannot
    /// make progress until the current one returns.
    pub fn flush(&self) -> Result<(), DispatchError> {
        if self.is_current() {
            return Ok(());
        }
        let (done_tx, done_rx) = oneshot::channel();
        self.post(move || {
            let _ = done_tx.send(());
        })?;
        done_rx.blocking_recv().map_err(|_| DispatchError::QueueClosed)
    }
}

impl fmt::Debug for ControlThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlThreadHandle")
            .field("thread_id", &self.thread_id)
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}

/// Owner of the control thread. Dropping it stops and joins the thread.
#[derive(Debug)]
pub struct ControlThread {
    handle: ControlThreadHandle,
    join: Option<JoinHandle<()>>,
}

impl ControlThread {
    /// Spawn the control thread. It inherits the caller's tracing
    /// subscriber.
    pub fn spawn(name: &str) -> Result<Self, DispatchError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let dispatch = tracing::dispatcher::get_default(|current| current.clone());

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || tracing::dispatcher::with_default(&dispatch, || run_queue(receiver)))
            .map_err(DispatchError::Spawn)?;

        let thread_id = join.thread().id();
        Ok(Self {
            handle: ControlThreadHandle { sender, thread_id },
            join: Some(join),
        })
    }

    pub fn handle(&self) -> ControlThreadHandle {
        self.handle.clone()
    }

    /// Run everything already queued, then stop and join the thread. Tasks
    /// posted afterwards are dropped.
    pub fn shutdown(mut self) -> Result<(), DispatchError> {
        self.stop()
    }

    fn stop(&mut self) -> Result<(), DispatchError> {
        let Some(join) = self.join.take() else {
            return Ok(());
        };
        let _ = self.handle.sender.send(ControlMessage::Stop);
        if self.handle.is_current() {
            return Ok(());
        }
        join.join().map_err(|_| DispatchError::Panicked)
    }
}

impl Drop for ControlThread {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Control thread did not stop cleanly: {e}");
        }
    }
}

fn run_queue(mut receiver: mpsc::UnboundedReceiver<ControlMessage>) {
    debug!("Control thread started");
    while let Some(message) = receiver.blocking_recv() {
        match message {
            ControlMessage::Run(task) => {
                if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                    error!("Control-thread task panicked");
                }
            }
            ControlMessage::Stop => break,
        }
    }
    receiver.close();
    debug!("Control thread stopped");
}
