//! HTTP client for the context collector
//!
//! Reports are POSTed as a JSON array to the configured endpoint with the
//! session's access token as a bearer credential. Any 2xx response is a
//! success; the body is ignored.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};

use crate::config::CollectorConfig;
use crate::error::{Error, Result};

use super::batch::{parse_error_message, ReportEntry};
use super::ReportTransport;

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// HTTP client for the context collector
pub struct CollectorClient {
    endpoint: String,
    max_retries: usize,
    initial_backoff: Duration,
    http_client: reqwest::Client,
}

impl CollectorClient {
    /// Create a new collector client from configuration
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: &CollectorConfig) -> Result<Self> {
        config.validate()?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            endpoint: config.endpoint.trim().to_string(),
            max_retries: config.max_retries,
            initial_backoff: INITIAL_BACKOFF,
            http_client,
        })
    }

    /// Override the first retry delay
    pub fn with_initial_backoff(mut self, delay: Duration) -> Self {
        self.initial_backoff = delay;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Send one report batch
    pub async fn send_report(&self, access_token: &str, entries: &[ReportEntry]) -> Result<()> {
        let auth = HeaderValue::from_str(&format!("Bearer {}", access_token))
            .map_err(|e| Error::InvalidArgument(format!("invalid access token: {}", e)))?;

        let response = self
            .http_client
            .post(&self.endpoint)
            .header(AUTHORIZATION, auth)
            .json(entries)
            .send()
            .await
            .map_err(|e| Error::report(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(Error::Report {
            status: Some(status.as_u16()),
            message: parse_error_message(&body),
        })
    }

    /// Send a report with retry logic
    ///
    /// Retries transient failures (5xx, network errors) with exponential backoff.
    pub async fn send_report_with_retry(
        &self,
        access_token: &str,
        entries: &[ReportEntry],
    ) -> Result<()> {
        let mut last_error = None;
        let mut delay = self.initial_backoff;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tracing::debug!(
                    "Retrying send_report (attempt {}/{}), waiting {:?}",
                    attempt + 1,
                    self.max_retries + 1,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, MAX_BACKOFF);
            }

            match self.send_report(access_token, entries).await {
                Ok(()) => return Ok(()),
                Err(e) if is_retryable_error(&e) => {
                    tracing::warn!("Transient error sending report: {}", e);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| Error::report("max retries exceeded")))
    }
}

#[async_trait]
impl ReportTransport for CollectorClient {
    async fn send_report(&self, access_token: &str, entries: &[ReportEntry]) -> Result<()> {
        self.send_report_with_retry(access_token, entries).await
    }
}

/// Check if an error is retryable (transient)
fn is_retryable_error(error: &Error) -> bool {
    match error {
        Error::Report { status: None, .. } => true,
        Error::Report {
            status: Some(code), ..
        } => *code >= 500,
        _ => false,
    }
}
