//! Buffering, eviction and scheduling around a [`ContextSensor`]

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use uuid::Uuid;

use crate::collector::ReportEntry;
use crate::error::{Error, Result};
use crate::schedule::RepeatingTask;
use crate::store::{SampleKey, SampleStore, StoreBackend};

use super::{ContextSensor, ManagedSource, RefreshDelay, SourceConfig};

/// Non-destructive snapshot of a source's buffered samples
#[derive(Debug, Default)]
pub struct Drain {
    /// Samples in collector format
    pub entries: Vec<ReportEntry>,
    /// Keys to delete once the entries have been delivered
    pub keys: Vec<SampleKey>,
}

/// Result of one eviction pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EvictionOutcome {
    pub removed: usize,
    pub failed: usize,
}

/// Keys to evict, oldest first
///
/// First the oldest entries beyond `max_size`, then any remaining entries
/// older than `max_age`, stopping at the first one within the limit.
pub fn evictable_keys(
    mut keys: Vec<SampleKey>,
    max_size: usize,
    max_age: Duration,
    now: SampleKey,
) -> Vec<SampleKey> {
    keys.sort();

    let excess = keys.len().saturating_sub(max_size);
    let mut evict: Vec<SampleKey> = keys.drain(..excess).collect();

    let expired = keys
        .iter()
        .take_while(|key| key.age_at(now) > max_age)
        .count();
    evict.extend(keys.drain(..expired));

    evict
}

struct SourceState<S: ContextSensor> {
    id: Uuid,
    sensor: S,
    config: SourceConfig,
    store: Arc<dyn SampleStore>,
    last_key: Mutex<Option<SampleKey>>,
    last_collected: Mutex<Option<DateTime<Utc>>>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<S: ContextSensor> SourceState<S> {
    /// Current time as a key, bumped past the previous key on collision
    fn next_key(&self) -> SampleKey {
        let now = SampleKey::now();
        let mut last = locked(&self.last_key);
        let key = match *last {
            Some(prev) if now <= prev => SampleKey::from_millis(prev.as_millis() + 1),
            _ => now,
        };
        *last = Some(key);
        key
    }

    async fn collect_once(&self) -> Result<SampleKey> {
        let state = self.sensor.sample_state().await?;
        let value = serde_json::to_value(&state)?;

        let key = self.next_key();
        self.store.set(key, value).await?;
        *locked(&self.last_collected) = Some(Utc::now());

        let count = self.store.count().await?;
        if count >= self.config.max_store_size {
            if let Err(e) = self.validate_store_state().await {
                tracing::warn!(
                    source = self.sensor.type_id(),
                    error = %e,
                    "Store eviction failed"
                );
            }
        }

        tracing::trace!(source = self.sensor.type_id(), key = %key, "Collected sample");
        Ok(key)
    }

    /// Scheduler body: errors are logged, never propagated
    async fn scheduled_collect(&self) {
        let outcome = match self.config.collect_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.collect_once()).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(
                        source = self.sensor.type_id(),
                        timeout_ms = limit.as_millis() as u64,
                        "Collection timed out"
                    );
                    return;
                }
            },
            None => self.collect_once().await,
        };

        if let Err(e) = outcome {
            tracing::warn!(source = self.sensor.type_id(), error = %e, "Collection failed");
        }
    }

    async fn validate_store_state(&self) -> Result<EvictionOutcome> {
        let keys = self.store.keys().await?;
        let evict = evictable_keys(
            keys,
            self.config.max_store_size,
            self.config.max_store_age,
            SampleKey::now(),
        );
        if evict.is_empty() {
            return Ok(EvictionOutcome::default());
        }

        let results = join_all(evict.iter().map(|key| self.store.delete(*key))).await;
        let failed = results.iter().filter(|r| r.is_err()).count();
        let outcome = EvictionOutcome {
            removed: results.len() - failed,
            failed,
        };

        tracing::debug!(
            source = self.sensor.type_id(),
            removed = outcome.removed,
            failed = outcome.failed,
            "Evicted buffered samples"
        );
        Ok(outcome)
    }

    async fn drain_for_report(&self) -> Result<Drain> {
        let type_id = self.sensor.type_id();
        let mut keys = self.store.keys().await?;
        keys.sort_unstable_by(|a, b| b.cmp(a));

        let mut drain = Drain::default();
        for key in keys {
            let value = match self.store.get(key).await {
                Ok(Some(value)) => value,
                Ok(None) => continue,
                Err(e) => {
                    // Left in place; the next cycle retries it
                    tracing::warn!(source = type_id, key = %key, error = %e, "Failed to read sample");
                    continue;
                }
            };

            match serde_json::from_value::<S::State>(value) {
                Ok(state) => {
                    let wire = serde_json::to_value(self.sensor.to_wire_format(&state))?;
                    drain.entries.push(ReportEntry {
                        timestamp: key.as_unix_seconds(),
                        data_type_id: type_id.to_string(),
                        value: wire,
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        source = type_id,
                        key = %key,
                        error = %e,
                        "Dropping undecodable sample after next report"
                    );
                }
            }
            drain.keys.push(key);
        }

        Ok(drain)
    }

    async fn delete_collected(&self, keys: &[SampleKey]) -> Result<usize> {
        let results = join_all(keys.iter().map(|key| self.store.delete(*key))).await;
        let failed = results.iter().filter(|r| r.is_err()).count();

        if failed > 0 {
            return Err(Error::Storage(format!(
                "{}: {} of {} deletions failed",
                self.sensor.type_id(),
                failed,
                keys.len()
            )));
        }
        Ok(keys.len())
    }
}

/// A sensor plus its private store and scheduler
pub struct ContextSource<S: ContextSensor> {
    state: Arc<SourceState<S>>,
    scheduler: RepeatingTask,
}

impl<S: ContextSensor> std::fmt::Debug for ContextSource<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextSource")
            .field("id", &self.state.id)
            .finish_non_exhaustive()
    }
}

impl<S: ContextSensor> ContextSource<S> {
    /// Create a source with the sensor's default configuration
    pub fn new(sensor: S, store: Arc<dyn SampleStore>) -> Self {
        let config = sensor.default_config();
        Self::with_config(sensor, config, store)
    }

    pub fn with_config(sensor: S, config: SourceConfig, store: Arc<dyn SampleStore>) -> Self {
        let scheduler = RepeatingTask::new(format!("collect:{}", sensor.type_id()));
        Self {
            state: Arc::new(SourceState {
                id: Uuid::new_v4(),
                sensor,
                config,
                store,
                last_key: Mutex::new(None),
                last_collected: Mutex::new(None),
            }),
            scheduler,
        }
    }

    /// Create a source whose store lives in `backend` under the sensor's type id
    pub fn open(sensor: S, config: SourceConfig, backend: &StoreBackend) -> Self {
        let store = backend.store_for(sensor.type_id());
        Self::with_config(sensor, config, store)
    }

    pub fn sensor(&self) -> &S {
        &self.state.sensor
    }

    pub fn store(&self) -> &Arc<dyn SampleStore> {
        &self.state.store
    }

    /// Apply size and age limits to the store now
    pub async fn validate_store_state(&self) -> Result<EvictionOutcome> {
        self.state.validate_store_state().await
    }
}

#[async_trait]
impl<S: ContextSensor> ManagedSource for ContextSource<S> {
    fn id(&self) -> Uuid {
        self.state.id
    }

    fn type_id(&self) -> &str {
        self.state.sensor.type_id()
    }

    fn config(&self) -> &SourceConfig {
        &self.state.config
    }

    fn is_service_running(&self) -> bool {
        self.scheduler.is_running()
    }

    fn last_collected(&self) -> Option<DateTime<Utc>> {
        *locked(&self.state.last_collected)
    }

    async fn is_supported(&self) -> Result<()> {
        self.state.sensor.is_supported().await
    }

    async fn collect_once(&self) -> Result<SampleKey> {
        self.state.collect_once().await
    }

    fn start_scheduler(&self) {
        let delay = match self.state.config.refresh_delay {
            RefreshDelay::Every(delay) => delay,
            RefreshDelay::OneTime => {
                tracing::debug!(source = self.type_id(), "One-time source is never scheduled");
                return;
            }
        };

        let state = Arc::clone(&self.state);
        let generation = self.scheduler.start(delay, move || {
            let state = Arc::clone(&state);
            async move { state.scheduled_collect().await }
        });
        tracing::debug!(
            source = self.type_id(),
            generation,
            delay_ms = delay.as_millis() as u64,
            "Started collection"
        );
    }

    fn stop_scheduler(&self) {
        self.scheduler.stop();
    }

    async fn buffered_count(&self) -> Result<usize> {
        self.state.store.count().await
    }

    async fn drain_for_report(&self) -> Result<Drain> {
        self.state.drain_for_report().await
    }

    async fn delete_collected(&self, keys: &[SampleKey]) -> Result<usize> {
        self.state.delete_collected(keys).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::retrieval_error;
    use crate::store::MemoryStore;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Reading {
        level: u32,
    }

    /// Sensor returning an incrementing level, optionally failing
    #[derive(Default)]
    struct CountingSensor {
        calls: AtomicUsize,
        fail: AtomicBool,
    }

    #[async_trait]
    impl ContextSensor for CountingSensor {
        type State = Reading;
        type Wire = serde_json::Value;

        fn type_id(&self) -> &'static str {
            "ctx.test.counter"
        }

        async fn is_supported(&self) -> Result<()> {
            Ok(())
        }

        async fn sample_state(&self) -> Result<Reading> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as u32;
            if self.fail.load(Ordering::SeqCst) {
                return Err(retrieval_error(self.type_id(), "sensor offline"));
            }
            Ok(Reading { level: n })
        }

        fn to_wire_format(&self, state: &Reading) -> serde_json::Value {
            json!({ "lvl": state.level })
        }
    }

    fn source_with(config: SourceConfig) -> ContextSource<CountingSensor> {
        ContextSource::with_config(
            CountingSensor::default(),
            config,
            Arc::new(MemoryStore::new("ctx.test.counter")),
        )
    }

    fn keys(ms: &[i64]) -> Vec<SampleKey> {
        ms.iter().copied().map(SampleKey::from_millis).collect()
    }

    #[test]
    fn test_evictable_keys_size_cap_removes_oldest() {
        let now = SampleKey::from_millis(10_000);
        let evict = evictable_keys(keys(&[5, 1, 4, 2, 3]), 3, Duration::from_secs(3600), now);
        assert_eq!(evict, keys(&[1, 2]));
    }

    #[test]
    fn test_evictable_keys_age_limit_stops_at_first_fresh_entry() {
        let now = SampleKey::from_millis(100_000);
        let max_age = Duration::from_secs(10);
        let evict = evictable_keys(keys(&[99_000, 1_000, 80_000, 95_000]), 10, max_age, now);
        assert_eq!(evict, keys(&[1_000, 80_000]));
    }

    #[test]
    fn test_evictable_keys_combines_size_and_age() {
        let now = SampleKey::from_millis(100_000);
        let evict = evictable_keys(
            keys(&[10_000, 20_000, 30_000, 95_000]),
            3,
            Duration::from_secs(60),
            now,
        );
        assert_eq!(evict, keys(&[10_000, 20_000, 30_000]));
    }

    #[test]
    fn test_evictable_keys_nothing_to_do() {
        let now = SampleKey::from_millis(100_000);
        let evict = evictable_keys(keys(&[99_000]), 5, Duration::from_secs(60), now);
        assert!(evict.is_empty());
    }

    #[tokio::test]
    async fn test_collect_once_adds_exactly_one_sample() {
        let source = source_with(SourceConfig::default());
        assert!(source.last_collected().is_none());

        source.collect_once().await.unwrap();
        assert_eq!(source.buffered_count().await.unwrap(), 1);
        source.collect_once().await.unwrap();
        assert_eq!(source.buffered_count().await.unwrap(), 2);
        assert!(source.last_collected().is_some());
    }

    #[tokio::test]
    async fn test_collect_keys_are_unique_and_increasing() {
        let source = source_with(SourceConfig::default());
        let mut previous = None;
        for _ in 0..20 {
            let key = source.collect_once().await.unwrap();
            if let Some(prev) = previous {
                assert!(key > prev);
            }
            previous = Some(key);
        }
        assert_eq!(source.buffered_count().await.unwrap(), 20);
    }

    #[tokio::test]
    async fn test_failed_sample_leaves_store_untouched() {
        let source = source_with(SourceConfig::default());
        source.sensor().fail.store(true, Ordering::SeqCst);

        let err = source.collect_once().await.unwrap_err();
        assert!(matches!(err, Error::Retrieval { .. }));
        assert_eq!(source.buffered_count().await.unwrap(), 0);
        assert!(source.last_collected().is_none());
    }

    #[tokio::test]
    async fn test_collect_enforces_size_cap() {
        let source = source_with(SourceConfig::default().with_max_store_size(3));
        for _ in 0..6 {
            source.collect_once().await.unwrap();
            assert!(source.buffered_count().await.unwrap() <= 3);
        }

        let mut remaining = source.store().keys().await.unwrap();
        remaining.sort();
        let levels: Vec<_> = futures::future::join_all(
            remaining.iter().map(|k| source.store().get(*k)),
        )
        .await
        .into_iter()
        .map(|v| v.unwrap().unwrap()["level"].as_u64().unwrap())
        .collect();
        assert_eq!(levels, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_validate_store_state_evicts_old_entries_and_is_idempotent() {
        let source = source_with(
            SourceConfig::default()
                .with_max_store_size(100)
                .with_max_store_age(Duration::from_secs(60)),
        );
        let now = SampleKey::now().as_millis();
        let store = source.store();
        store
            .set(SampleKey::from_millis(now - 3_600_000), json!({"level": 0}))
            .await
            .unwrap();
        store
            .set(SampleKey::from_millis(now - 120_000), json!({"level": 1}))
            .await
            .unwrap();
        store
            .set(SampleKey::from_millis(now - 1_000), json!({"level": 2}))
            .await
            .unwrap();

        let first = source.validate_store_state().await.unwrap();
        assert_eq!(first, EvictionOutcome { removed: 2, failed: 0 });
        assert_eq!(store.count().await.unwrap(), 1);

        let second = source.validate_store_state().await.unwrap();
        assert_eq!(second, EvictionOutcome::default());
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_drain_is_non_destructive_and_converts() {
        let source = source_with(SourceConfig::default());
        let store = source.store();
        store
            .set(SampleKey::from_millis(1_700_000_000_400), json!({"level": 7}))
            .await
            .unwrap();
        store
            .set(SampleKey::from_millis(1_700_000_005_600), json!({"level": 8}))
            .await
            .unwrap();

        let drain = source.drain_for_report().await.unwrap();
        assert_eq!(drain.keys.len(), 2);
        assert_eq!(store.count().await.unwrap(), 2);

        let mut entries = drain.entries;
        entries.sort_by_key(|e| e.timestamp);
        assert_eq!(entries[0].timestamp, 1_700_000_000);
        assert_eq!(entries[0].data_type_id, "ctx.test.counter");
        assert_eq!(entries[0].value, json!({"lvl": 7}));
        assert_eq!(entries[1].timestamp, 1_700_000_006);
    }

    #[tokio::test]
    async fn test_drain_skips_but_purges_undecodable_values() {
        let source = source_with(SourceConfig::default());
        let store = source.store();
        store
            .set(SampleKey::from_millis(1_000), json!("not a reading"))
            .await
            .unwrap();
        store
            .set(SampleKey::from_millis(2_000), json!({"level": 1}))
            .await
            .unwrap();

        let drain = source.drain_for_report().await.unwrap();
        assert_eq!(drain.entries.len(), 1);
        assert_eq!(drain.keys.len(), 2);

        assert_eq!(source.delete_collected(&drain.keys).await.unwrap(), 2);
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_to_wire_format_is_deterministic() {
        let sensor = CountingSensor::default();
        let state = Reading { level: 3 };
        assert_eq!(sensor.to_wire_format(&state), sensor.to_wire_format(&state));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_survives_failures() {
        let source = source_with(
            SourceConfig::default().with_refresh_delay(RefreshDelay::from_millis(100)),
        );
        source.sensor().fail.store(true, Ordering::SeqCst);
        source.start_scheduler();
        assert!(source.is_service_running());

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(source.buffered_count().await.unwrap(), 0);

        source.sensor().fail.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(source.buffered_count().await.unwrap() >= 1);

        source.stop_scheduler();
        assert!(!source.is_service_running());
        let calls = source.sensor().calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(source.sensor().calls.load(Ordering::SeqCst), calls);
    }

    #[tokio::test]
    async fn test_one_time_source_never_schedules() {
        let source = source_with(SourceConfig::default().with_refresh_delay(RefreshDelay::OneTime));
        source.start_scheduler();
        assert!(!source.is_service_running());
    }
}
