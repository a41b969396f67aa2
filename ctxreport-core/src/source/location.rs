//! Geographic location source
//!
//! Positions come from a [`PositionProvider`]. The crate ships a
//! [`FixedPosition`] provider for hosts that are configured with a static
//! location; platform geolocation backends plug in through the same trait.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::LocationSourceConfig;
use crate::error::{Error, Result};

use super::{not_supported, retrieval_error, ContextSensor};

/// Collector type id for location samples
pub const LOCATION_TYPE_ID: &str = "ctx.sdk.location";

/// Oldest cached position accepted by default
pub const DEFAULT_MAXIMUM_AGE: Duration = Duration::from_secs(20 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
    /// Accuracy radius in meters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
}

/// Stored sample: coordinates plus the time the fix was taken
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub coords: Coordinates,
    pub timestamp: DateTime<Utc>,
}

/// Collector payload
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LocationWire {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PositionError {
    #[error("location permission denied")]
    PermissionDenied,

    #[error("position unavailable: {0}")]
    Unavailable(String),

    #[error("timed out waiting for a position fix")]
    Timeout,
}

/// Source of device positions
#[async_trait]
pub trait PositionProvider: Send + Sync + 'static {
    /// Current position, or a cached one no older than `maximum_age`
    async fn current_position(
        &self,
        maximum_age: Duration,
    ) -> std::result::Result<Position, PositionError>;
}

/// Provider that always reports the same coordinates
#[derive(Debug, Clone)]
pub struct FixedPosition {
    coords: Coordinates,
}

impl FixedPosition {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            coords: Coordinates {
                latitude,
                longitude,
                accuracy: None,
            },
        }
    }

    pub fn with_accuracy(mut self, meters: f64) -> Self {
        self.coords.accuracy = Some(meters);
        self
    }
}

#[async_trait]
impl PositionProvider for FixedPosition {
    async fn current_position(
        &self,
        _maximum_age: Duration,
    ) -> std::result::Result<Position, PositionError> {
        let Coordinates {
            latitude,
            longitude,
            ..
        } = self.coords;
        if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
            return Err(PositionError::Unavailable(format!(
                "coordinates out of range: {}, {}",
                latitude, longitude
            )));
        }
        Ok(Position {
            coords: self.coords,
            timestamp: Utc::now(),
        })
    }
}

pub struct LocationSensor<P: PositionProvider> {
    provider: P,
    maximum_age: Duration,
}

impl<P: PositionProvider> LocationSensor<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            maximum_age: DEFAULT_MAXIMUM_AGE,
        }
    }

    pub fn with_maximum_age(mut self, maximum_age: Duration) -> Self {
        self.maximum_age = maximum_age;
        self
    }

    pub fn maximum_age(&self) -> Duration {
        self.maximum_age
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }
}

impl LocationSensor<FixedPosition> {
    /// Build a fixed-position sensor from the `[sources.location]` section
    pub fn from_config(config: &LocationSourceConfig) -> Result<Self> {
        let (latitude, longitude) = match (config.latitude, config.longitude) {
            (Some(lat), Some(lng)) => (lat, lng),
            _ => {
                return Err(Error::Config(
                    "sources.location requires latitude and longitude".to_string(),
                ))
            }
        };

        let mut provider = FixedPosition::new(latitude, longitude);
        if let Some(accuracy) = config.accuracy {
            provider = provider.with_accuracy(accuracy);
        }

        let mut sensor = LocationSensor::new(provider);
        if let Some(ms) = config.maximum_age_ms {
            sensor = sensor.with_maximum_age(Duration::from_millis(ms));
        }
        Ok(sensor)
    }
}

#[async_trait]
impl<P: PositionProvider> ContextSensor for LocationSensor<P> {
    type State = Position;
    type Wire = LocationWire;

    fn type_id(&self) -> &'static str {
        LOCATION_TYPE_ID
    }

    async fn is_supported(&self) -> Result<()> {
        self.provider
            .current_position(self.maximum_age)
            .await
            .map(|_| ())
            .map_err(|e| not_supported(LOCATION_TYPE_ID, e.to_string()))
    }

    async fn sample_state(&self) -> Result<Position> {
        self.provider
            .current_position(self.maximum_age)
            .await
            .map_err(|e| retrieval_error(LOCATION_TYPE_ID, e.to_string()))
    }

    fn to_wire_format(&self, state: &Position) -> LocationWire {
        LocationWire {
            lat: state.coords.latitude,
            lng: state.coords.longitude,
        }
    }
}
