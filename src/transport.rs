//! Publish/subscribe transport seam
//!
//! [`Transport`] opens connections; the [`Connection`] it returns is the
//! exclusively-owned handle the session keeps. Connection state changes are
//! not delivered through callbacks registered on the transport: they are
//! returned by [`Connection::poll_events`] and dispatched to a
//! [`ConnectionObserver`] on the caller's thread.
//!
//! Author: Moroya Sakamoto

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// MQTT-style quality of service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryGuarantee {
    /// QoS 0: fire and forget
    AtMostOnce,
    /// QoS 1: acknowledged, possibly duplicated
    AtLeastOnce,
}

impl DeliveryGuarantee {
    pub fn qos(self) -> u8 {
        match self {
            DeliveryGuarantee::AtMostOnce => 0,
            DeliveryGuarantee::AtLeastOnce => 1,
        }
    }
}

/// Bridge host and port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// What the session presents when connecting
#[derive(Clone)]
pub struct ConnectCredentials {
    pub client_id: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for ConnectCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectCredentials")
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Connection-level failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    #[error("connection refused by bridge: {0}")]
    Refused(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("no connection acknowledgement within {0:?}")]
    Timeout(Duration),

    #[error("subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },
}

/// Delivery failures for a single message
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PublishError {
    #[error("not connected")]
    NotConnected,

    #[error("publish rejected: {0}")]
    Rejected(String),

    #[error("no acknowledgement within {0:?}")]
    AckTimeout(Duration),

    #[error("connection lost while publishing: {0}")]
    ConnectionLost(String),
}

/// Why a connection went away
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Bridge sent a disconnect
    ServerClosed,
    /// Socket, TLS or protocol failure
    NetworkError(String),
    /// The transport's request channel was closed
    ClientClosed,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::ServerClosed => write!(f, "closed by bridge"),
            DisconnectReason::NetworkError(e) => write!(f, "network error: {}", e),
            DisconnectReason::ClientClosed => write!(f, "client closed"),
        }
    }
}

/// Message pushed by the bridge on a subscribed topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    /// Payload as text, lossy
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Notification produced while servicing a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Disconnected(DisconnectReason),
    Message(InboundMessage),
    Published { packet_id: u16 },
}

/// Handler for connection notifications
pub trait ConnectionObserver {
    fn on_connected(&mut self);

    fn on_disconnected(&mut self, reason: DisconnectReason);

    fn on_message(&mut self, _message: InboundMessage) {}

    fn on_published(&mut self, _packet_id: u16) {}
}

/// Route one event to the matching observer method
pub fn dispatch(observer: &mut impl ConnectionObserver, event: TransportEvent) {
    match event {
        TransportEvent::Connected => observer.on_connected(),
        TransportEvent::Disconnected(reason) => observer.on_disconnected(reason),
        TransportEvent::Message(message) => observer.on_message(message),
        TransportEvent::Published { packet_id } => observer.on_published(packet_id),
    }
}

/// Live connection handle
pub trait Connection {
    fn subscribe(&mut self, topic: &str, guarantee: DeliveryGuarantee) -> Result<(), ConnectError>;

    /// Publish a payload
    ///
    /// With [`DeliveryGuarantee::AtLeastOnce`] this blocks until the bridge
    /// acknowledges the message.
    fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        guarantee: DeliveryGuarantee,
    ) -> Result<(), PublishError>;

    /// Service pending network traffic and return the notifications it produced
    fn poll_events(&mut self) -> Vec<TransportEvent>;

    /// Client-initiated disconnect; never reported as a notification
    fn disconnect(&mut self);
}

/// Opens connections to a bridge
pub trait Transport {
    type Connection: Connection;

    /// Connect and wait for the bridge to accept
    fn connect(
        &mut self,
        endpoint: &Endpoint,
        credentials: &ConnectCredentials,
    ) -> Result<Self::Connection, ConnectError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        seen: Vec<String>,
    }

    impl ConnectionObserver for Recorder {
        fn on_connected(&mut self) {
            self.seen.push("connected".into());
        }

        fn on_disconnected(&mut self, reason: DisconnectReason) {
            self.seen.push(format!("disconnected: {}", reason));
        }

        fn on_message(&mut self, message: InboundMessage) {
            self.seen
                .push(format!("{} <- {}", message.topic, message.payload_str()));
        }
    }

    #[test]
    fn test_dispatch() {
        let mut recorder = Recorder::default();
        let events = vec![
            TransportEvent::Connected,
            TransportEvent::Message(InboundMessage {
                topic: "devices/pi5/config".into(),
                payload: b"{\"rate\":5}".to_vec(),
            }),
            TransportEvent::Published { packet_id: 7 },
            TransportEvent::Disconnected(DisconnectReason::ServerClosed),
        ];
        for event in events {
            dispatch(&mut recorder, event);
        }

        assert_eq!(
            recorder.seen,
            vec![
                "connected",
                "devices/pi5/config <- {\"rate\":5}",
                "disconnected: closed by bridge",
            ]
        );
    }

    #[test]
    fn test_credentials_debug_is_redacted() {
        let creds = ConnectCredentials {
            client_id: "projects/p/locations/r/registries/g/devices/d".into(),
            username: "unused".into(),
            password: "secret-token".into(),
        };
        let debug = format!("{:?}", creds);
        assert!(!debug.contains("secret-token"));
    }

    #[test]
    fn test_qos_levels() {
        assert_eq!(DeliveryGuarantee::AtMostOnce.qos(), 0);
        assert_eq!(DeliveryGuarantee::AtLeastOnce.qos(), 1);
        assert_eq!(Endpoint::new("mqtt.googleapis.com", 8883).to_string(), "mqtt.googleapis.com:8883");
    }
}
