//! In-memory sample store

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::{Error, Result};

use super::{SampleKey, SampleStore};

/// Operation categories that emit their own fallback warning
#[derive(Debug, Clone, Copy)]
enum Op {
    Count,
    Keys,
    Get,
    Set,
    Delete,
}

impl Op {
    fn name(self) -> &'static str {
        match self {
            Op::Count => "count",
            Op::Keys => "keys",
            Op::Get => "get",
            Op::Set => "set",
            Op::Delete => "delete",
        }
    }
}

#[derive(Default)]
struct FallbackWarnings {
    count: AtomicBool,
    keys: AtomicBool,
    get: AtomicBool,
    set: AtomicBool,
    delete: AtomicBool,
}

impl FallbackWarnings {
    fn flag(&self, op: Op) -> &AtomicBool {
        match op {
            Op::Count => &self.count,
            Op::Keys => &self.keys,
            Op::Get => &self.get,
            Op::Set => &self.set,
            Op::Delete => &self.delete,
        }
    }

    /// Returns true the first time `op` is seen
    fn first_use(&self, op: Op) -> bool {
        !self.flag(op).swap(true, Ordering::Relaxed)
    }
}

/// Non-persistent store backed by an ordered map
///
/// Stores created with [`MemoryStore::fallback`] stand in for an unavailable
/// durable store and log one warning per operation category.
pub struct MemoryStore {
    namespace: String,
    entries: Mutex<BTreeMap<SampleKey, serde_json::Value>>,
    warnings: Option<FallbackWarnings>,
}

impl MemoryStore {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            entries: Mutex::new(BTreeMap::new()),
            warnings: None,
        }
    }

    /// Memory store substituted for a durable store that could not be opened
    pub fn fallback(namespace: impl Into<String>) -> Self {
        Self {
            warnings: Some(FallbackWarnings::default()),
            ..Self::new(namespace)
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.warnings.is_some()
    }

    fn entries(&self, op: Op) -> Result<MutexGuard<'_, BTreeMap<SampleKey, serde_json::Value>>> {
        if let Some(warnings) = &self.warnings {
            if warnings.first_use(op) {
                tracing::warn!(
                    namespace = %self.namespace,
                    operation = op.name(),
                    "Durable sample storage not available, using temporary in-memory storage"
                );
            }
        }
        self.entries
            .lock()
            .map_err(|_| Error::Storage(format!("{}: memory store lock poisoned", self.namespace)))
    }
}

#[async_trait]
impl SampleStore for MemoryStore {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn is_durable(&self) -> bool {
        false
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.entries(Op::Count)?.len())
    }

    async fn keys(&self) -> Result<Vec<SampleKey>> {
        Ok(self.entries(Op::Keys)?.keys().copied().collect())
    }

    async fn get(&self, key: SampleKey) -> Result<Option<serde_json::Value>> {
        Ok(self.entries(Op::Get)?.get(&key).cloned())
    }

    async fn set(&self, key: SampleKey, value: serde_json::Value) -> Result<serde_json::Value> {
        self.entries(Op::Set)?.insert(key, value.clone());
        Ok(value)
    }

    async fn delete(&self, key: SampleKey) -> Result<()> {
        self.entries(Op::Delete)?.remove(&key);
        Ok(())
    }
}
