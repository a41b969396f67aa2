//! Context sources
//!
//! A context source samples one category of ambient state (connectivity,
//! location, ...) on its own schedule and buffers the samples in a private
//! [`SampleStore`](crate::store::SampleStore) until the manager reports them.
//!
//! Variant behavior lives behind [`ContextSensor`]; [`ContextSource`] wraps a
//! sensor with storage, eviction and scheduling, and is handed to the
//! manager as a [`ManagedSource`] trait object.

mod context_source;
pub mod location;
pub mod network;

pub use context_source::{evictable_keys, ContextSource, Drain, EvictionOutcome};
pub use location::{FixedPosition, LocationSensor, PositionProvider};
pub use network::NetworkSensor;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::store::SampleKey;

/// How often a source samples its state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshDelay {
    /// Sample exactly once, at registration
    OneTime,
    /// Sample repeatedly, waiting this long after each collection completes
    Every(Duration),
}

impl RefreshDelay {
    pub const THIRTY_SECONDS: RefreshDelay = RefreshDelay::Every(Duration::from_secs(30));
    pub const ONE_MINUTE: RefreshDelay = RefreshDelay::Every(Duration::from_secs(60));
    pub const ONE_HOUR: RefreshDelay = RefreshDelay::Every(Duration::from_secs(60 * 60));
    pub const ONE_DAY: RefreshDelay = RefreshDelay::Every(Duration::from_secs(60 * 60 * 24));

    pub fn from_millis(ms: u64) -> Self {
        RefreshDelay::Every(Duration::from_millis(ms))
    }

    pub fn is_one_time(&self) -> bool {
        matches!(self, RefreshDelay::OneTime)
    }
}

impl Default for RefreshDelay {
    fn default() -> Self {
        RefreshDelay::ONE_MINUTE
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RefreshDelayRepr {
    Millis(u64),
    Keyword(String),
}

impl<'de> Deserialize<'de> for RefreshDelay {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        match RefreshDelayRepr::deserialize(deserializer)? {
            RefreshDelayRepr::Millis(0) => Err(serde::de::Error::custom(
                "refresh_delay must be greater than 0 (use \"once\" for a single sample)",
            )),
            RefreshDelayRepr::Millis(ms) => Ok(RefreshDelay::from_millis(ms)),
            RefreshDelayRepr::Keyword(word) => match word.to_ascii_lowercase().as_str() {
                "once" | "onetime" | "one-time" => Ok(RefreshDelay::OneTime),
                other => Err(serde::de::Error::custom(format!(
                    "unknown refresh_delay {:?}, expected milliseconds or \"once\"",
                    other
                ))),
            },
        }
    }
}

/// Per-source polling and buffering limits, fixed at construction
#[derive(Debug, Clone, PartialEq)]
pub struct SourceConfig {
    pub refresh_delay: RefreshDelay,
    /// Entry count at which eviction runs after a write
    pub max_store_size: usize,
    /// Entries older than this are evicted
    pub max_store_age: Duration,
    /// Abandon a scheduled collection after this long
    pub collect_timeout: Option<Duration>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            refresh_delay: RefreshDelay::ONE_MINUTE,
            max_store_size: 80,
            max_store_age: Duration::from_secs(60 * 60 * 24),
            collect_timeout: None,
        }
    }
}

impl SourceConfig {
    pub fn with_refresh_delay(mut self, refresh_delay: RefreshDelay) -> Self {
        self.refresh_delay = refresh_delay;
        self
    }

    pub fn with_max_store_size(mut self, max_store_size: usize) -> Self {
        self.max_store_size = max_store_size;
        self
    }

    pub fn with_max_store_age(mut self, max_store_age: Duration) -> Self {
        self.max_store_age = max_store_age;
        self
    }

    pub fn with_collect_timeout(mut self, timeout: Duration) -> Self {
        self.collect_timeout = Some(timeout);
        self
    }
}

/// Variant-specific behavior of a context source
///
/// Implementations probe the platform, read the current state, and map it to
/// the shape the remote collector expects. Buffering and scheduling are
/// handled by [`ContextSource`].
#[async_trait]
pub trait ContextSensor: Send + Sync + 'static {
    /// Raw sampled state, persisted in the store as JSON
    type State: Serialize + DeserializeOwned + Send + Sync;

    /// Collector-facing representation of a state
    type Wire: Serialize;

    /// Identifier of this data type on the remote collector
    fn type_id(&self) -> &'static str;

    /// Check that this sensor can run here; must not change any state
    async fn is_supported(&self) -> Result<()>;

    /// Read the current state once
    async fn sample_state(&self) -> Result<Self::State>;

    /// Map a state to the collector format; pure and deterministic
    fn to_wire_format(&self, state: &Self::State) -> Self::Wire;

    /// Defaults applied when the caller does not supply a config
    fn default_config(&self) -> SourceConfig {
        SourceConfig::default()
    }
}

/// Object-safe view of a context source used by the manager registry
#[async_trait]
pub trait ManagedSource: Send + Sync {
    /// Unique per instance
    fn id(&self) -> Uuid;

    fn type_id(&self) -> &str;

    fn config(&self) -> &SourceConfig;

    fn is_service_running(&self) -> bool;

    /// Time of the last successful collection
    fn last_collected(&self) -> Option<DateTime<Utc>>;

    async fn is_supported(&self) -> Result<()>;

    /// Sample once and store the result; returns the new sample's key
    async fn collect_once(&self) -> Result<SampleKey>;

    /// Start (or restart) periodic collection; one-time sources never start
    fn start_scheduler(&self);

    fn stop_scheduler(&self);

    async fn buffered_count(&self) -> Result<usize>;

    /// Read every buffered sample in wire format without deleting anything
    async fn drain_for_report(&self) -> Result<Drain>;

    /// Delete the given keys, attempting every one; returns how many succeeded
    async fn delete_collected(&self, keys: &[SampleKey]) -> Result<usize>;
}

pub(crate) fn retrieval_error(source_type: &str, message: impl Into<String>) -> Error {
    Error::Retrieval {
        source_type: source_type.to_string(),
        message: message.into(),
    }
}

pub(crate) fn not_supported(source_type: &str, reason: impl Into<String>) -> Error {
    Error::NotSupported {
        source_type: source_type.to_string(),
        reason: reason.into(),
    }
}
