//! # ctxreport-core
//!
//! Core library for ctxreport - client-side context collection and reporting.
//!
//! This library provides:
//! - Context sources that sample ambient state on their own schedules
//! - Durable per-source sample buffers in SQLite, with an in-memory fallback
//! - A manager that batches buffered samples to a remote context collector
//! - Configuration management and logging infrastructure
//!
//! ## Architecture
//!
//! Each source owns a private store and a repeating collection task. The
//! manager runs a separate reporting loop: gather every source's buffer,
//! transmit one batch, then delete exactly the samples that were sent.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ctxreport_core::source::{ContextSource, NetworkSensor};
//! use ctxreport_core::{Config, ContextManager, Session, StoreBackend};
//!
//! # async fn run() -> ctxreport_core::Result<()> {
//! let config = Config::load()?;
//! let backend = StoreBackend::open(&config);
//! let session = Arc::new(Session::with_token("access-token"));
//! let manager = ContextManager::from_config(&config.collector, session)?;
//!
//! let network = &config.sources.network;
//! let source = ContextSource::open(
//!     NetworkSensor::from_config(network)?,
//!     network.settings.to_source_config()?,
//!     &backend,
//! );
//! manager.register(Arc::new(source)).await?;
//! manager.start_reporting().await?;
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use collector::{CollectorClient, ReportEntry, ReportTransport};
pub use config::Config;
pub use db::Database;
pub use error::{Error, Result};
pub use manager::{ContextManager, ReportSummary};
pub use session::{Session, SessionProvider};
pub use source::{ContextSensor, ContextSource, ManagedSource, RefreshDelay, SourceConfig};
pub use store::{SampleKey, SampleStore, StoreBackend};

// Public modules
pub mod collector;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod manager;
pub mod schedule;
pub mod session;
pub mod source;
pub mod store;

#[cfg(test)]
mod testing;
