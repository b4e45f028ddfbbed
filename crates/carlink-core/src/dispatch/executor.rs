//! Execution contexts for subscriber callbacks.
//!
//! Every subscription carries an [`Executor`] that decides *where* its
//! callback runs.  The registry never runs feature code on the transport
//! thread that delivered the event, so a slow or panicking feature cannot
//! stall link handling or other features.
//!
//! # Serial executors
//!
//! [`SerialExecutor`] runs jobs one at a time in submission order.  Ordering
//! matters: buffered messages are enqueued before any later message, and a
//! serial executor is what turns "enqueued first" into "delivered first".
//!
//! Two back-ends are provided:
//!
//! - `spawn_thread` – a dedicated OS thread draining a `std::sync::mpsc` queue.
//! - `on_runtime`   – a Tokio task draining an unbounded mailbox.  Jobs are
//!   synchronous, so keep them short when sharing a runtime with I/O tasks.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;

use tokio::runtime::Handle;
use tokio::sync::mpsc as tokio_mpsc;
use tracing::{debug, warn};

/// A unit of work submitted to an [`Executor`].
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Abstract "where to run" for callbacks.
pub trait Executor: Send + Sync {
    /// Schedules `job`.  Must not run it on the caller's stack.
    fn execute(&self, job: Job);
}

enum Mailbox {
    Thread(mpsc::Sender<Job>),
    Runtime(tokio_mpsc::UnboundedSender<Job>),
}

/// Runs submitted jobs strictly in order, one at a time.
///
/// The worker stops once the executor is dropped and the queue is drained.
pub struct SerialExecutor {
    name: String,
    mailbox: Mailbox,
}

impl SerialExecutor {
    /// Starts a dedicated worker thread named `name`.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the thread cannot be spawned.
    pub fn spawn_thread(name: &str) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel::<Job>();
        let thread_name = name.to_string();
        std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    run_job(&thread_name, job);
                }
                debug!("executor {thread_name} stopped");
            })?;

        Ok(Self {
            name: name.to_string(),
            mailbox: Mailbox::Thread(tx),
        })
    }

    /// Starts a worker task on the given Tokio runtime.
    pub fn on_runtime(name: &str, handle: &Handle) -> Self {
        let (tx, mut rx) = tokio_mpsc::unbounded_channel::<Job>();
        let task_name = name.to_string();
        handle.spawn(async move {
            while let Some(job) = rx.recv().await {
                run_job(&task_name, job);
            }
            debug!("executor {task_name} stopped");
        });

        Self {
            name: name.to_string(),
            mailbox: Mailbox::Runtime(tx),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Executor for SerialExecutor {
    fn execute(&self, job: Job) {
        let accepted = match &self.mailbox {
            Mailbox::Thread(tx) => tx.send(job).is_ok(),
            Mailbox::Runtime(tx) => tx.send(job).is_ok(),
        };
        if !accepted {
            warn!("executor {} is gone; callback not run", self.name);
        }
    }
}

/// Runs one job, containing any panic so the worker keeps draining.
fn run_job(worker: &str, job: Job) {
    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
        warn!("callback panicked on executor {worker}");
    }
}
