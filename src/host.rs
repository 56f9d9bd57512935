//! A dedicated affinity thread.
//!
//! One OS thread runs a tokio current-thread runtime inside a `LocalSet` and
//! is fed continuations over an unbounded channel. Until [`AffinityThread::start`]
//! is called the thread is unknown, which is exactly the bring-up window the
//! scheduler's lazy initialization exists for.

use crate::context::{AffinityContext, Continuation};
use crate::error::{Error, Result};
use futures::future::LocalBoxFuture;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use tokio::runtime::Runtime;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::LocalSet;
use tracing::{debug, info, warn};

/// Settings for the affinity thread.
#[derive(Debug, Clone)]
pub struct AffinityThreadConfig {
    /// OS thread name.
    pub thread_name: String,
    /// Times a continuation yields to the run loop before it runs. Values
    /// below 1 are treated as 1.
    pub yields_per_switch: u32,
}

impl Default for AffinityThreadConfig {
    fn default() -> Self {
        Self {
            thread_name: "affinity".to_string(),
            yields_per_switch: 1,
        }
    }
}

/// The host's affinity thread and its run loop.
pub struct AffinityThread {
    config: AffinityThreadConfig,
    running: OnceLock<Running>,
}

struct Running {
    thread_id: ThreadId,
    sender: mpsc::UnboundedSender<Continuation>,
    shutdown: Arc<Notify>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AffinityThread {
    /// Create a host whose affinity thread does not exist yet.
    pub fn new(config: AffinityThreadConfig) -> Self {
        Self {
            config,
            running: OnceLock::new(),
        }
    }

    /// Create and start a host in one step.
    pub fn spawn(config: AffinityThreadConfig) -> Result<Arc<Self>> {
        let host = Arc::new(Self::new(config));
        host.start()?;
        Ok(host)
    }

    /// Spawn the affinity thread and its run loop.
    pub fn start(&self) -> Result<()> {
        if self.running.get().is_some() {
            return Err(Error::AlreadyStarted);
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let shutdown = Arc::new(Notify::new());
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let loop_shutdown = Arc::clone(&shutdown);
        let yields = self.config.yields_per_switch.max(1);
        let worker = thread::Builder::new()
            .name(self.config.thread_name.clone())
            .spawn(move || run_loop(runtime, receiver, loop_shutdown, yields))?;

        let running = Running {
            thread_id: worker.thread().id(),
            sender,
            shutdown,
            worker: Mutex::new(Some(worker)),
        };

        // A concurrent start that lost the race drops its sender here, which
        // ends its loop.
        self.running
            .set(running)
            .map_err(|_| Error::AlreadyStarted)?;

        info!(thread = %self.config.thread_name, "affinity thread started");
        Ok(())
    }

    /// Run `f` on the affinity thread and block until it returns.
    ///
    /// A panic inside `f` is resumed on the calling thread.
    pub fn invoke<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_on_affinity_thread() {
            return Err(Error::WouldDeadlock);
        }

        let (tx, rx) = oneshot::channel();
        self.switch_to_affinity_thread(Box::new(move || {
            let _ = tx.send(panic::catch_unwind(AssertUnwindSafe(f)));
        }))?;

        match futures::executor::block_on(rx) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(payload)) => panic::resume_unwind(payload),
            Err(_) => Err(Error::HostShutDown),
        }
    }

    /// Stop the run loop and join the thread.
    ///
    /// Continuations still queued are dropped. Called from the affinity
    /// thread itself, this only signals the loop.
    pub fn shutdown(&self) {
        let Some(running) = self.running.get() else {
            return;
        };
        running.shutdown.notify_one();

        if self.is_on_affinity_thread() {
            return;
        }

        let worker = match running.worker.lock() {
            Ok(mut worker) => worker.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(worker) = worker {
            if worker.join().is_err() {
                warn!(thread = %self.config.thread_name, "affinity thread panicked");
            }
            info!(thread = %self.config.thread_name, "affinity thread stopped");
        }
    }
}

impl AffinityContext for AffinityThread {
    fn has_affinity_thread(&self) -> bool {
        self.running.get().is_some()
    }

    fn is_on_affinity_thread(&self) -> bool {
        self.running
            .get()
            .is_some_and(|running| running.thread_id == thread::current().id())
    }

    fn switch_to_affinity_thread(&self, continuation: Continuation) -> Result<()> {
        let running = self.running.get().ok_or(Error::AffinityThreadUnknown)?;
        running
            .sender
            .send(continuation)
            .map_err(|_| Error::HostShutDown)
    }

    fn drive(&self, future: LocalBoxFuture<'static, ()>) {
        debug_assert!(self.is_on_affinity_thread());
        tokio::task::spawn_local(future);
    }
}

impl Drop for AffinityThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_loop(
    runtime: Runtime,
    mut receiver: mpsc::UnboundedReceiver<Continuation>,
    shutdown: Arc<Notify>,
    yields: u32,
) {
    let local = LocalSet::new();
    local.block_on(&runtime, async move {
        debug!("affinity run loop entered");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.notified() => break,
                next = receiver.recv() => match next {
                    Some(continuation) => {
                        tokio::task::spawn_local(async move {
                            for _ in 0..yields {
                                tokio::task::yield_now().await;
                            }
                            continuation();
                        });
                    }
                    None => break,
                },
            }
        }
        debug!("affinity run loop exited");
    });
}
