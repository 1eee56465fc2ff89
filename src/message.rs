//! Telemetry message construction and JSON encoding
//!
//! One [`TelemetryMessage`] is built per publish cycle, encoded and dropped.
//! The wire form is a flat JSON object: the identity fields and collection
//! time first, then every measurement at top level.
//!
//! ```text
//! {"registry_id":"my-registry","device_id":"pi5",
//!  "time_collected":"2024-03-01T12:00:00Z","cpu_usage":12.4,...}
//! ```
//!
//! Author: Moroya Sakamoto

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Serialize, Serializer};
use std::time::SystemTime;

use crate::device::DeviceIdentity;
use crate::sensors::{Measurements, SensorError, SensorSource};

/// Immutable telemetry payload
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryMessage {
    pub registry_id: String,
    pub device_id: String,
    #[serde(rename = "time_collected", serialize_with = "rfc3339")]
    pub collected_at: DateTime<Utc>,
    #[serde(flatten)]
    pub measurements: Measurements,
}

fn rfc3339<S: Serializer>(time: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&time.to_rfc3339_opts(SecondsFormat::Secs, true))
}

impl TelemetryMessage {
    pub fn new(
        identity: &DeviceIdentity,
        collected_at: SystemTime,
        measurements: Measurements,
    ) -> Self {
        Self {
            registry_id: identity.registry_id.clone(),
            device_id: identity.device_id.clone(),
            collected_at: DateTime::<Utc>::from(collected_at),
            measurements,
        }
    }

    /// JSON text of the message
    pub fn to_json(&self) -> String {
        // Keys are strings and readings are plain numbers, serialization cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Payload bytes handed to the transport
    pub fn encode(&self) -> Vec<u8> {
        self.to_json().into_bytes()
    }
}

/// Builds the message for one publish cycle
pub trait MessageBuilder {
    /// `sequence` is the zero-based loop iteration
    fn build(
        &mut self,
        sequence: u32,
        identity: &DeviceIdentity,
        collected_at: SystemTime,
    ) -> Result<TelemetryMessage, SensorError>;
}

impl<F> MessageBuilder for F
where
    F: FnMut(u32, &DeviceIdentity, SystemTime) -> Result<TelemetryMessage, SensorError>,
{
    fn build(
        &mut self,
        sequence: u32,
        identity: &DeviceIdentity,
        collected_at: SystemTime,
    ) -> Result<TelemetryMessage, SensorError> {
        self(sequence, identity, collected_at)
    }
}

/// Builder that snapshots a [`SensorSource`]
pub struct SensorMessageBuilder<S> {
    source: S,
}

impl<S: SensorSource> SensorMessageBuilder<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }
}

impl<S: SensorSource> MessageBuilder for SensorMessageBuilder<S> {
    fn build(
        &mut self,
        _sequence: u32,
        identity: &DeviceIdentity,
        collected_at: SystemTime,
    ) -> Result<TelemetryMessage, SensorError> {
        let measurements = self.source.snapshot()?;
        Ok(TelemetryMessage::new(identity, collected_at, measurements))
    }
}
