//! ALICE-IoT-Link: Managed Telemetry Publisher
//!
//! "Authenticate briefly. Publish steadily. Back off politely."
//!
//! Connects a device to a cloud MQTT bridge with a short-lived JWT,
//! publishes sensor telemetry on a fixed interval, refreshes the token
//! before the bridge rejects it, and reconnects with bounded exponential
//! backoff when the connection drops.
//!
//! # Architecture
//!
//! ```text
//! TelemetryLoop ──▶ SessionManager ──▶ Transport / Connection (MQTT)
//!       │               │    │
//!  MessageBuilder       │    └──▶ CredentialProvider (JWT)
//!  (SensorSource)       └──▶ BackoffController
//! ```
//!
//! - **Single thread**: event servicing, publishing and sleeping all happen
//!   on the caller's thread. Notifications are dispatched synchronously to
//!   the [`transport::ConnectionObserver`] the session manager implements.
//! - **Injectable time**: every wait goes through [`clock::Clock`], so token
//!   expiry and backoff are testable with [`clock::ManualClock`].
//! - **Pluggable payloads**: messages come from a [`message::MessageBuilder`],
//!   typically a [`sensors::SensorSource`] snapshot.
//!
//! # Example
//!
//! ```ignore
//! use alice_iot_link::*;
//!
//! let identity = DeviceIdentity::new("my-project", "us-central1", "my-registry", "pi5");
//! let config = SessionConfig::new(identity, Endpoint::new(CLOUD_BRIDGE_HOST, TLS_PORT));
//! let mut session = SessionManager::new(
//!     config,
//!     MqttBridge::new(BridgeConfig::cloud_iot("roots.pem")),
//!     JwtSigner::new("rsa_private.pem", SigningAlgorithm::Rs256),
//!     SystemClock,
//! );
//!
//! session.start()?;
//! let builder = SensorMessageBuilder::new(SimulatedHost::new(4));
//! let report = TelemetryLoop::new(&mut session, builder, LoopConfig::default()).run()?;
//! session.close();
//! ```
//!
//! # Related Projects
//!
//! - [ALICE-Edge](https://github.com/ext-sakamoro/ALICE-Edge) - On-device model fitting

pub mod backoff;
pub mod clock;
pub mod credentials;
pub mod device;
pub mod message;
pub mod mock;
pub mod mqtt_bridge;
pub mod sensors;
pub mod session;
pub mod telemetry;
pub mod transport;

pub use backoff::{BackoffConfig, BackoffController, BackoffPhase, BackoffState, GiveUp};
pub use clock::{Clock, ManualClock, SystemClock};
pub use credentials::{CredentialError, CredentialProvider, JwtSigner, SignedToken, SigningAlgorithm};
pub use device::{DeviceIdentity, MessageKind, Topics};
pub use message::{MessageBuilder, SensorMessageBuilder, TelemetryMessage};
pub use mock::{MockCall, MockCredentials, MockTransport};
pub use mqtt_bridge::{BridgeConfig, MqttBridge, CLOUD_BRIDGE_HOST, TLS_ALT_PORT, TLS_PORT};
pub use sensors::{Measurements, Reading, SensorError, SensorSource, SimulatedHost, SimulatedSensor};
pub use session::{SessionConfig, SessionError, SessionManager, SessionStats};
pub use telemetry::{LoopConfig, LoopOutcome, LoopReport, TelemetryLoop};
pub use transport::{
    ConnectError, Connection, ConnectionObserver, DeliveryGuarantee, DisconnectReason, Endpoint,
    PublishError, Transport, TransportEvent,
};
