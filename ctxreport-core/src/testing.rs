//! Fakes shared by unit tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::collector::{ReportEntry, ReportTransport};
use crate::error::{Error, Result};
use crate::source::{not_supported, retrieval_error, ContextSensor, ContextSource, SourceConfig};
use crate::store::{MemoryStore, SampleKey, SampleStore};

#[derive(Debug, Serialize, Deserialize)]
pub struct Tick {
    pub n: usize,
}

/// Sensor producing an incrementing counter
pub struct TickSensor {
    pub type_id: &'static str,
    pub calls: AtomicUsize,
    pub supported: AtomicBool,
    pub fail: AtomicBool,
}

impl TickSensor {
    pub fn new(type_id: &'static str) -> Self {
        Self {
            type_id,
            calls: AtomicUsize::new(0),
            supported: AtomicBool::new(true),
            fail: AtomicBool::new(false),
        }
    }

    pub fn unsupported(type_id: &'static str) -> Self {
        let sensor = Self::new(type_id);
        sensor.supported.store(false, Ordering::SeqCst);
        sensor
    }
}

#[async_trait]
impl ContextSensor for TickSensor {
    type State = Tick;
    type Wire = Value;

    fn type_id(&self) -> &'static str {
        self.type_id
    }

    async fn is_supported(&self) -> Result<()> {
        if self.supported.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(not_supported(self.type_id, "disabled in test"))
        }
    }

    async fn sample_state(&self) -> Result<Tick> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(retrieval_error(self.type_id, "scripted failure"));
        }
        Ok(Tick { n })
    }

    fn to_wire_format(&self, state: &Tick) -> Value {
        json!({ "tick": state.n })
    }
}

/// Store wrapper with injectable failures and a hook into `keys()`
pub struct FaultyStore {
    inner: MemoryStore,
    pub fail_deletes: AtomicBool,
    pub fail_keys: AtomicBool,
    /// Written into the store right after the next `keys()` snapshot is taken
    pub write_after_keys: Mutex<Option<(SampleKey, Value)>>,
}

impl FaultyStore {
    pub fn new(namespace: &str) -> Self {
        Self {
            inner: MemoryStore::new(namespace),
            fail_deletes: AtomicBool::new(false),
            fail_keys: AtomicBool::new(false),
            write_after_keys: Mutex::new(None),
        }
    }
}

#[async_trait]
impl SampleStore for FaultyStore {
    fn namespace(&self) -> &str {
        self.inner.namespace()
    }

    fn is_durable(&self) -> bool {
        false
    }

    async fn count(&self) -> Result<usize> {
        self.inner.count().await
    }

    async fn keys(&self) -> Result<Vec<SampleKey>> {
        if self.fail_keys.load(Ordering::SeqCst) {
            return Err(Error::Storage("keys unavailable".to_string()));
        }
        let snapshot = self.inner.keys().await?;
        let late = self.write_after_keys.lock().unwrap().take();
        if let Some((key, value)) = late {
            self.inner.set(key, value).await?;
        }
        Ok(snapshot)
    }

    async fn get(&self, key: SampleKey) -> Result<Option<Value>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: SampleKey, value: Value) -> Result<Value> {
        self.inner.set(key, value).await
    }

    async fn delete(&self, key: SampleKey) -> Result<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(Error::Storage("delete refused".to_string()));
        }
        self.inner.delete(key).await
    }
}

/// Transport recording every batch it is given
#[derive(Default)]
pub struct RecordingTransport {
    pub batches: Mutex<Vec<Vec<ReportEntry>>>,
    pub tokens: Mutex<Vec<String>>,
    pub fail: AtomicBool,
}

impl RecordingTransport {
    pub fn calls(&self) -> usize {
        self.batches.lock().unwrap().len()
    }

    pub fn last_batch(&self) -> Option<Vec<ReportEntry>> {
        self.batches.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl ReportTransport for RecordingTransport {
    async fn send_report(&self, access_token: &str, entries: &[ReportEntry]) -> Result<()> {
        self.tokens.lock().unwrap().push(access_token.to_string());
        self.batches.lock().unwrap().push(entries.to_vec());
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Report {
                status: Some(503),
                message: "collector unavailable".to_string(),
            });
        }
        Ok(())
    }
}

pub fn tick_source(type_id: &'static str, config: SourceConfig) -> Arc<ContextSource<TickSensor>> {
    Arc::new(ContextSource::with_config(
        TickSensor::new(type_id),
        config,
        Arc::new(MemoryStore::new(type_id)),
    ))
}

pub fn faulty_source(
    type_id: &'static str,
    config: SourceConfig,
) -> (Arc<ContextSource<TickSensor>>, Arc<FaultyStore>) {
    let store = Arc::new(FaultyStore::new(type_id));
    let source = ContextSource::with_config(
        TickSensor::new(type_id),
        config,
        Arc::clone(&store) as Arc<dyn SampleStore>,
    );
    (Arc::new(source), store)
}
