//! Network connectivity source
//!
//! Reports whether the host can reach the network. The soft check opens a
//! TCP connection to a probe address; the hard check issues an HTTP request
//! to a ping URL and treats any response as connected.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;

use crate::config::NetworkSourceConfig;
use crate::error::{Error, Result};

use super::ContextSensor;

/// Collector type id for connectivity samples
pub const NETWORK_TYPE_ID: &str = "ctx.sdk.network";

const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connectivity as understood by the collector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

impl ConnectionState {
    pub const CONNECTED_CODE: i32 = -99;
    pub const DISCONNECTED_CODE: i32 = -1;

    pub fn code(self) -> i32 {
        match self {
            ConnectionState::Connected => Self::CONNECTED_CODE,
            ConnectionState::Disconnected => Self::DISCONNECTED_CODE,
        }
    }
}

impl From<ConnectionState> for i32 {
    fn from(state: ConnectionState) -> i32 {
        state.code()
    }
}

impl TryFrom<i32> for ConnectionState {
    type Error = String;

    fn try_from(code: i32) -> std::result::Result<Self, String> {
        match code {
            ConnectionState::CONNECTED_CODE => Ok(ConnectionState::Connected),
            ConnectionState::DISCONNECTED_CODE => Ok(ConnectionState::Disconnected),
            other => Err(format!("unknown connection state {}", other)),
        }
    }
}

/// Stored sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkState {
    pub state: ConnectionState,
}

/// Collector payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkWire {
    pub connection_type: i32,
}

/// How connectivity is determined
#[derive(Debug, Clone)]
pub enum Probe {
    /// TCP connect to `host:port`
    Tcp { addr: String },
    /// HTTP GET; any response means connected
    Http { url: String },
}

pub struct NetworkSensor {
    probe: Probe,
    timeout: Duration,
    http: Option<reqwest::Client>,
}

impl NetworkSensor {
    pub fn new(probe: Probe) -> Result<Self> {
        Self::with_timeout(probe, DEFAULT_PROBE_TIMEOUT)
    }

    pub fn with_timeout(probe: Probe, timeout: Duration) -> Result<Self> {
        let http = match probe {
            Probe::Http { .. } => Some(
                reqwest::Client::builder()
                    .timeout(timeout)
                    .build()
                    .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?,
            ),
            Probe::Tcp { .. } => None,
        };
        Ok(Self {
            probe,
            timeout,
            http,
        })
    }

    /// Build from the `[sources.network]` config section
    pub fn from_config(config: &NetworkSourceConfig) -> Result<Self> {
        let probe = if config.hard_check {
            Probe::Http {
                url: config.ping_url.clone(),
            }
        } else {
            Probe::Tcp {
                addr: config.probe_addr.clone(),
            }
        };
        Self::new(probe)
    }

    pub fn probe(&self) -> &Probe {
        &self.probe
    }

    async fn check(&self) -> ConnectionState {
        let reachable = match (&self.probe, &self.http) {
            (Probe::Http { url }, Some(http)) => match http.get(url).send().await {
                Ok(_) => true,
                Err(e) => {
                    tracing::debug!(url = %url, error = %e, "Ping failed");
                    false
                }
            },
            (Probe::Tcp { addr }, _) => {
                matches!(
                    tokio::time::timeout(self.timeout, TcpStream::connect(addr.as_str())).await,
                    Ok(Ok(_))
                )
            }
            (Probe::Http { .. }, None) => false,
        };

        if reachable {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }
}

#[async_trait]
impl ContextSensor for NetworkSensor {
    type State = NetworkState;
    type Wire = NetworkWire;

    fn type_id(&self) -> &'static str {
        NETWORK_TYPE_ID
    }

    async fn is_supported(&self) -> Result<()> {
        Ok(())
    }

    async fn sample_state(&self) -> Result<NetworkState> {
        Ok(NetworkState {
            state: self.check().await,
        })
    }

    fn to_wire_format(&self, state: &NetworkState) -> NetworkWire {
        NetworkWire {
            connection_type: state.state.code(),
        }
    }
}
