//! Context collector client
//!
//! Buffered samples from every registered source are delivered to the
//! remote collector in a single batch per report cycle.
//!
//! ## Usage
//!
//! Point the client at a collector in `~/.config/ctxreport/config.toml`:
//!
//! ```toml
//! [collector]
//! endpoint = "https://gateway.flybits.com/ctxdata"
//! report_delay_ms = 60000
//! ```

mod batch;
mod client;

pub use batch::{parse_error_message, ReportEntry};
pub use client::CollectorClient;

use async_trait::async_trait;

use crate::error::Result;

/// Delivers a report batch to the collector
#[async_trait]
pub trait ReportTransport: Send + Sync {
    /// Send `entries` as one request; an empty batch is still sent
    async fn send_report(&self, access_token: &str, entries: &[ReportEntry]) -> Result<()>;
}
