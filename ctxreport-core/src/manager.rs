//! Context manager
//!
//! Owns the registry of context sources and the reporting loop. Each report
//! cycle runs three steps:
//!
//! 1. **Gather**: every source drains its buffer concurrently; the keys each
//!    source returned are that source's deletion obligation for the cycle.
//! 2. **Transmit**: all entries go to the collector as one batch.
//! 3. **Cleanup**: after a successful transmit, exactly the gathered keys are
//!    deleted, source by source.
//!
//! A failed transmit deletes nothing, so samples are delivered at least once.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures::future::join_all;
use uuid::Uuid;

use crate::collector::{CollectorClient, ReportEntry, ReportTransport};
use crate::config::CollectorConfig;
use crate::error::{Error, Result};
use crate::schedule::RepeatingTask;
use crate::session::SessionProvider;
use crate::source::ManagedSource;
use crate::store::SampleKey;

/// Delay between report cycles when none is configured
pub const DEFAULT_REPORT_DELAY: Duration = Duration::from_secs(60);

/// Outcome of a successful report cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportSummary {
    /// Entries transmitted in the batch
    pub sent: usize,
    /// Buffered samples deleted after transmission
    pub deleted: usize,
    /// Sources that took part in the cycle
    pub sources: usize,
}

struct ManagerInner {
    registry: Mutex<Vec<Arc<dyn ManagedSource>>>,
    reporting: RepeatingTask,
    transport: Arc<dyn ReportTransport>,
    session: Arc<dyn SessionProvider>,
    report_delay: Duration,
}

impl ManagerInner {
    fn registry(&self) -> MutexGuard<'_, Vec<Arc<dyn ManagedSource>>> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn snapshot(&self) -> Vec<Arc<dyn ManagedSource>> {
        self.registry().clone()
    }

    async fn report(&self) -> Result<ReportSummary> {
        let token = match self.session.access_token() {
            Some(token) => token,
            None => {
                tracing::debug!("Skipping report, no access token");
                return Err(Error::Unauthenticated);
            }
        };

        let sources = self.snapshot();
        let mut failures = Vec::new();

        // Gather
        let drains = join_all(sources.iter().map(|source| source.drain_for_report())).await;
        let mut batch: Vec<ReportEntry> = Vec::new();
        let mut obligations: Vec<(&Arc<dyn ManagedSource>, Vec<SampleKey>)> = Vec::new();
        for (source, drain) in sources.iter().zip(drains) {
            match drain {
                Ok(drain) => {
                    batch.extend(drain.entries);
                    if !drain.keys.is_empty() {
                        obligations.push((source, drain.keys));
                    }
                }
                Err(e) => {
                    tracing::warn!(source = source.type_id(), error = %e, "Drain failed");
                    failures.push(format!("{}: {}", source.type_id(), e));
                }
            }
        }

        // Transmit
        if let Err(e) = self.transport.send_report(&token, &batch).await {
            tracing::warn!(entries = batch.len(), error = %e, "Report transmission failed");
            return Err(match e {
                Error::Report { .. } => e,
                other => Error::report(other.to_string()),
            });
        }

        // Cleanup
        let results = join_all(
            obligations
                .iter()
                .map(|(source, keys)| source.delete_collected(keys)),
        )
        .await;
        let mut deleted = 0;
        for ((source, _), result) in obligations.iter().zip(results) {
            match result {
                Ok(n) => deleted += n,
                Err(e) => {
                    tracing::warn!(source = source.type_id(), error = %e, "Cleanup failed");
                    failures.push(format!("{}: {}", source.type_id(), e));
                }
            }
        }

        if !failures.is_empty() {
            return Err(Error::report(format!(
                "batch delivered with {} source failure(s): {}",
                failures.len(),
                failures.join("; ")
            )));
        }

        let summary = ReportSummary {
            sent: batch.len(),
            deleted,
            sources: sources.len(),
        };
        tracing::info!(
            sent = summary.sent,
            deleted = summary.deleted,
            sources = summary.sources,
            "Context report delivered"
        );
        Ok(summary)
    }
}

/// Registry of context sources plus the reporting loop
///
/// Cloning is cheap; clones share the same registry and loop. The reporting
/// loop stops once every clone has been dropped.
#[derive(Clone)]
pub struct ContextManager {
    inner: Arc<ManagerInner>,
}

impl ContextManager {
    pub fn new(
        transport: Arc<dyn ReportTransport>,
        session: Arc<dyn SessionProvider>,
        report_delay: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                registry: Mutex::new(Vec::new()),
                reporting: RepeatingTask::new("report"),
                transport,
                session,
                report_delay,
            }),
        }
    }

    /// Manager reporting to the configured collector over HTTP
    pub fn from_config(
        config: &CollectorConfig,
        session: Arc<dyn SessionProvider>,
    ) -> Result<Self> {
        let client = CollectorClient::new(config)?;
        Ok(Self::new(Arc::new(client), session, config.report_delay()))
    }

    pub fn report_delay(&self) -> Duration {
        self.inner.report_delay
    }

    fn find_conflict(
        registry: &[Arc<dyn ManagedSource>],
        source: &dyn ManagedSource,
    ) -> Option<Error> {
        registry.iter().find_map(|existing| {
            if existing.id() == source.id() {
                Some(Error::InvalidArgument(format!(
                    "source {} is already registered",
                    source.id()
                )))
            } else if existing.type_id() == source.type_id() {
                Some(Error::InvalidArgument(format!(
                    "a {} source is already registered",
                    source.type_id()
                )))
            } else {
                None
            }
        })
    }

    /// Register a source and begin collecting from it
    ///
    /// The source must be supported on this host. One-time sources are
    /// sampled once before being added; others have their scheduler started.
    pub async fn register<S>(&self, source: Arc<S>) -> Result<Arc<S>>
    where
        S: ManagedSource + 'static,
    {
        self.register_dyn(source.clone()).await?;
        Ok(source)
    }

    /// [`register`](Self::register) for sources already behind a trait object
    pub async fn register_dyn(&self, source: Arc<dyn ManagedSource>) -> Result<()> {
        if let Some(conflict) = Self::find_conflict(&self.inner.registry(), source.as_ref()) {
            return Err(conflict);
        }

        source.is_supported().await?;

        if source.config().refresh_delay.is_one_time() {
            source.collect_once().await?;
        } else {
            source.start_scheduler();
        }

        if let Err(conflict) = self.insert(Arc::clone(&source)) {
            // Lost a race with a concurrent registration
            let registered = self.inner.registry().iter().any(|s| s.id() == source.id());
            if !registered {
                source.stop_scheduler();
            }
            return Err(conflict);
        }
        Ok(())
    }

    /// Add a source without probing, sampling or scheduling it
    ///
    /// Lets a short-lived process report samples buffered by an earlier run.
    /// [`start_all_services`](Self::start_all_services) starts it later.
    pub fn adopt(&self, source: Arc<dyn ManagedSource>) -> Result<()> {
        self.insert(source)
    }

    fn insert(&self, source: Arc<dyn ManagedSource>) -> Result<()> {
        let mut registry = self.inner.registry();
        if let Some(conflict) = Self::find_conflict(&registry, source.as_ref()) {
            return Err(conflict);
        }
        tracing::info!(source = source.type_id(), id = %source.id(), "Registered context source");
        registry.push(source);
        Ok(())
    }

    /// Remove a source and stop its scheduler; unknown ids are ignored
    pub fn unregister(&self, source_id: Uuid) -> Option<Arc<dyn ManagedSource>> {
        let removed = {
            let mut registry = self.inner.registry();
            let index = registry.iter().position(|s| s.id() == source_id)?;
            registry.remove(index)
        };
        removed.stop_scheduler();
        tracing::info!(source = removed.type_id(), id = %source_id, "Unregistered context source");
        Some(removed)
    }

    /// Remove every source, stopping all schedulers; returns how many were removed
    pub fn unregister_all(&self) -> usize {
        let removed = std::mem::take(&mut *self.inner.registry());
        for source in &removed {
            source.stop_scheduler();
        }
        removed.len()
    }

    /// Restart collection on every registered source
    pub fn start_all_services(&self) {
        for source in self.inner.snapshot() {
            source.start_scheduler();
        }
    }

    /// Stop collection on every registered source, keeping them registered
    pub fn stop_all_services(&self) {
        for source in self.inner.snapshot() {
            source.stop_scheduler();
        }
    }

    /// Snapshot of the registry in registration order
    pub fn sources(&self) -> Vec<Arc<dyn ManagedSource>> {
        self.inner.snapshot()
    }

    /// Begin the reporting loop; the first cycle runs immediately
    ///
    /// Fails with [`Error::Unauthenticated`] if no session can be resolved.
    pub async fn start_reporting(&self) -> Result<()> {
        self.stop_reporting();

        if let Err(e) = self.inner.session.resolve_session().await {
            tracing::debug!(error = %e, "Session resolution failed");
            return Err(Error::Unauthenticated);
        }

        let weak: Weak<ManagerInner> = Arc::downgrade(&self.inner);
        self.inner
            .reporting
            .start(self.inner.report_delay, move || {
                let weak = weak.clone();
                async move {
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    if let Err(e) = inner.report().await {
                        tracing::warn!(error = %e, "Scheduled report failed");
                    }
                }
            });

        tracing::info!(
            delay_ms = self.inner.report_delay.as_millis() as u64,
            "Started reporting"
        );
        Ok(())
    }

    /// Halt the reporting loop; a cycle already running is left to finish
    pub fn stop_reporting(&self) {
        if self.inner.reporting.stop() {
            tracing::info!("Stopped reporting");
        }
    }

    pub fn is_reporting(&self) -> bool {
        self.inner.reporting.is_running()
    }

    /// Run one report cycle now
    pub async fn report(&self) -> Result<ReportSummary> {
        self.inner.report().await
    }

    /// Stop reporting and every source scheduler
    ///
    /// Waits for an in-flight report cycle. Sources stay registered, so a
    /// final [`report`](Self::report) can still flush their buffers.
    pub async fn shutdown(&self) {
        self.inner.reporting.stop_and_wait().await;
        self.stop_all_services();
        tracing::debug!("Context manager shut down");
    }
}
