//! Device identity and the bridge topic scheme
//!
//! Author: Moroya Sakamoto

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Who the device is on the bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Cloud project id, also the token audience
    pub project_id: String,
    /// Cloud region of the registry (e.g. `us-central1`)
    pub region: String,
    /// Device registry id
    pub registry_id: String,
    /// Device id inside the registry
    pub device_id: String,
}

impl DeviceIdentity {
    pub fn new(
        project_id: impl Into<String>,
        region: impl Into<String>,
        registry_id: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            region: region.into(),
            registry_id: registry_id.into(),
            device_id: device_id.into(),
        }
    }

    /// MQTT client id expected by the bridge
    ///
    /// `projects/{project}/locations/{region}/registries/{registry}/devices/{device}`
    pub fn client_id(&self) -> String {
        format!(
            "projects/{}/locations/{}/registries/{}/devices/{}",
            self.project_id, self.region, self.registry_id, self.device_id
        )
    }

    pub fn topics(&self) -> Topics {
        Topics::for_device(&self.device_id)
    }
}

/// Fixed topic names for one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    /// Configuration updates pushed by the bridge
    pub config: String,
    /// Commands pushed by the bridge (wildcard filter)
    pub commands: String,
    /// Telemetry events
    pub events: String,
    /// Device state reports
    pub state: String,
}

impl Topics {
    pub fn for_device(device_id: &str) -> Self {
        Self {
            config: format!("devices/{}/config", device_id),
            commands: format!("devices/{}/commands/#", device_id),
            events: format!("devices/{}/events", device_id),
            state: format!("devices/{}/state", device_id),
        }
    }

    /// Publish topic for a message kind
    pub fn publish_topic(&self, kind: MessageKind) -> &str {
        match kind {
            MessageKind::Event => &self.events,
            MessageKind::State => &self.state,
        }
    }
}

/// What a published message reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageKind {
    /// Telemetry event, published to `devices/{device}/events`
    #[default]
    Event,
    /// Device state, published to `devices/{device}/state`
    State,
}

impl MessageKind {
    /// Pause between publishes when none is configured
    ///
    /// State updates are rate limited harder by the bridge than events.
    pub fn default_interval(self) -> Duration {
        match self {
            MessageKind::Event => Duration::from_secs(1),
            MessageKind::State => Duration::from_secs(5),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Event => write!(f, "event"),
            MessageKind::State => write!(f, "state"),
        }
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "event" | "events" => Ok(MessageKind::Event),
            "state" => Ok(MessageKind::State),
            other => Err(format!(
                "unknown message type '{}', expected 'event' or 'state'",
                other
            )),
        }
    }
}
