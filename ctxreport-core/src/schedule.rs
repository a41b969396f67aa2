//! Self-rescheduling background loops
//!
//! A [`RepeatingTask`] runs a job, waits a fixed delay measured from the
//! job's completion, and repeats until stopped. Runs never overlap. Stopping
//! prevents the next run from being armed; a run already in progress is left
//! to finish.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct ActiveLoop {
    generation: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Cancellable repeating job with at most one active loop
pub struct RepeatingTask {
    name: String,
    generation: AtomicU64,
    active: Mutex<Option<ActiveLoop>>,
}

impl RepeatingTask {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            generation: AtomicU64::new(0),
            active: Mutex::new(None),
        }
    }

    fn active(&self) -> MutexGuard<'_, Option<ActiveLoop>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start the loop, replacing any loop that is already running
    ///
    /// The first run begins immediately. Must be called from within a tokio
    /// runtime. Returns the generation number of the new loop.
    pub fn start<F, Fut>(&self, delay: Duration, job: F) -> u64
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut active = self.active();
        if let Some(previous) = active.take() {
            previous.cancel.cancel();
            tracing::debug!(task = %self.name, generation = previous.generation, "Replacing loop");
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_loop(
            self.name.clone(),
            generation,
            delay,
            cancel.clone(),
            job,
        ));

        *active = Some(ActiveLoop {
            generation,
            cancel,
            handle,
        });
        generation
    }

    /// Stop the loop; safe to call when idle
    ///
    /// Returns true if a loop was running.
    pub fn stop(&self) -> bool {
        match self.active().take() {
            Some(current) => {
                current.cancel.cancel();
                tracing::debug!(task = %self.name, generation = current.generation, "Stopped loop");
                true
            }
            None => false,
        }
    }

    /// Stop the loop and wait for an in-flight run to finish
    pub async fn stop_and_wait(&self) {
        let current = self.active().take();
        if let Some(current) = current {
            current.cancel.cancel();
            if let Err(e) = current.handle.await {
                tracing::warn!(task = %self.name, error = %e, "Loop task ended abnormally");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.active().is_some()
    }

    /// Generation of the most recently started loop (0 if never started)
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

impl Drop for RepeatingTask {
    fn drop(&mut self) {
        if let Some(current) = self.active().take() {
            current.cancel.cancel();
        }
    }
}

async fn run_loop<F, Fut>(
    name: String,
    generation: u64,
    delay: Duration,
    cancel: CancellationToken,
    mut job: F,
) where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    loop {
        job().await;

        if cancel.is_cancelled() {
            break;
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    tracing::trace!(task = %name, generation, "Loop exited");
}
