//! MQTT bridge transport for ALICE-IoT-Link
//!
//! Connects to a cloud MQTT bridge (or a local broker) with `rumqttc`'s
//! synchronous client. The connection's event loop is driven in-line: every
//! call that needs network progress (`connect`, `publish`, `poll_events`)
//! polls it on the calling thread. No background thread is spawned.
//!
//! # Example
//!
//! ```ignore
//! use alice_iot_link::mqtt_bridge::{BridgeConfig, MqttBridge};
//!
//! let mut bridge = MqttBridge::new(BridgeConfig::cloud_iot("roots.pem"));
//! let mut conn = bridge.connect(&endpoint, &credentials)?;
//! conn.publish("devices/pi5/events", b"{}", DeliveryGuarantee::AtLeastOnce)?;
//! ```
//!
//! Author: Moroya Sakamoto

use rumqttc::{
    Client, ConnectReturnCode, ConnectionError, Event, MqttOptions, Outgoing, Packet, QoS,
    RecvTimeoutError,
};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::transport::{
    ConnectCredentials, ConnectError, Connection, DeliveryGuarantee, DisconnectReason, Endpoint,
    InboundMessage, PublishError, Transport, TransportEvent,
};

/// Default cloud bridge host
pub const CLOUD_BRIDGE_HOST: &str = "mqtt.googleapis.com";
/// Standard MQTT-over-TLS port
pub const TLS_PORT: u16 = 8883;
/// Alternate TLS port for networks that block 8883
pub const TLS_ALT_PORT: u16 = 443;

/// Upper bound on events drained by one `poll_events` call
const MAX_EVENTS_PER_POLL: usize = 64;

/// Bridge transport configuration
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Trust-root bundle; `None` connects over plain TCP
    pub ca_certs: Option<PathBuf>,
    /// Keep-alive interval
    pub keep_alive: Duration,
    /// How long `connect` waits for the CONNACK
    pub connect_timeout: Duration,
    /// How long an at-least-once publish waits for its PUBACK
    pub ack_timeout: Duration,
    /// How long `poll_events` waits for traffic before returning
    pub poll_timeout: Duration,
    /// Capacity of the client request channel
    pub request_capacity: usize,
}

impl BridgeConfig {
    /// Configuration for the cloud IoT bridge
    ///
    /// TLS with the given trust-root bundle (typically `roots.pem`).
    pub fn cloud_iot(ca_certs: impl Into<PathBuf>) -> Self {
        Self {
            ca_certs: Some(ca_certs.into()),
            keep_alive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(10),
            poll_timeout: Duration::from_millis(100),
            request_capacity: 64,
        }
    }

    /// Configuration for a local Mosquitto broker
    pub fn local() -> Self {
        Self {
            ca_certs: None,
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            ack_timeout: Duration::from_secs(5),
            poll_timeout: Duration::from_millis(50),
            request_capacity: 64,
        }
    }

    /// Build the `rumqttc` options for one connection attempt
    pub fn mqtt_options(
        &self,
        endpoint: &Endpoint,
        credentials: &ConnectCredentials,
    ) -> Result<MqttOptions, ConnectError> {
        let mut opts = MqttOptions::new(&credentials.client_id, &endpoint.host, endpoint.port);
        opts.set_keep_alive(self.keep_alive);
        opts.set_clean_session(true);
        opts.set_credentials(&credentials.username, &credentials.password);
        // tokens run several hundred bytes
        opts.set_max_packet_size(256 * 1024, 256 * 1024);

        if let Some(path) = &self.ca_certs {
            let ca = std::fs::read(path)
                .map_err(|e| ConnectError::Tls(format!("reading {}: {}", path.display(), e)))?;
            opts.set_transport(rumqttc::Transport::tls(ca, None, None));
        }

        Ok(opts)
    }
}

fn to_qos(guarantee: DeliveryGuarantee) -> QoS {
    match guarantee {
        DeliveryGuarantee::AtMostOnce => QoS::AtMostOnce,
        DeliveryGuarantee::AtLeastOnce => QoS::AtLeastOnce,
    }
}

fn connect_error(e: ConnectionError) -> ConnectError {
    match e {
        ConnectionError::ConnectionRefused(code) => ConnectError::Refused(format!("{:?}", code)),
        ConnectionError::Tls(e) => ConnectError::Tls(e.to_string()),
        ConnectionError::NetworkTimeout => ConnectError::Network("network timeout".into()),
        other => ConnectError::Network(other.to_string()),
    }
}

/// Translate a `rumqttc` event into a transport notification
///
/// Returns `None` for protocol chatter the session does not care about.
pub fn translate_event(event: &Event) -> Option<TransportEvent> {
    match event {
        Event::Incoming(Packet::ConnAck(ack)) if ack.code == ConnectReturnCode::Success => {
            Some(TransportEvent::Connected)
        }
        Event::Incoming(Packet::Publish(publish)) => Some(TransportEvent::Message(InboundMessage {
            topic: publish.topic.clone(),
            payload: publish.payload.to_vec(),
        })),
        Event::Incoming(Packet::PubAck(ack)) => Some(TransportEvent::Published {
            packet_id: ack.pkid,
        }),
        Event::Incoming(Packet::Disconnect) => {
            Some(TransportEvent::Disconnected(DisconnectReason::ServerClosed))
        }
        _ => None,
    }
}

/// Transport over `rumqttc`
#[derive(Debug, Clone)]
pub struct MqttBridge {
    config: BridgeConfig,
}

impl MqttBridge {
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }
}

impl Transport for MqttBridge {
    type Connection = BridgeConnection;

    fn connect(
        &mut self,
        endpoint: &Endpoint,
        credentials: &ConnectCredentials,
    ) -> Result<BridgeConnection, ConnectError> {
        let opts = self.config.mqtt_options(endpoint, credentials)?;
        let (client, connection) = Client::new(opts, self.config.request_capacity);

        let mut conn = BridgeConnection {
            client,
            connection,
            pending: VecDeque::new(),
            connected: false,
            ack_timeout: self.config.ack_timeout,
            poll_timeout: self.config.poll_timeout,
        };
        conn.await_connack(self.config.connect_timeout)?;
        debug!(%endpoint, client_id = %credentials.client_id, "bridge accepted connection");
        Ok(conn)
    }
}

/// One live bridge connection
pub struct BridgeConnection {
    client: Client,
    connection: rumqttc::Connection,
    pending: VecDeque<TransportEvent>,
    connected: bool,
    ack_timeout: Duration,
    poll_timeout: Duration,
}

impl BridgeConnection {
    fn await_connack(&mut self, timeout: Duration) -> Result<(), ConnectError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ConnectError::Timeout(timeout));
            }

            match self.connection.recv_timeout(remaining) {
                Ok(Ok(Event::Incoming(Packet::ConnAck(ack)))) => {
                    if ack.code != ConnectReturnCode::Success {
                        return Err(ConnectError::Refused(format!("{:?}", ack.code)));
                    }
                    self.connected = true;
                    self.pending.push_back(TransportEvent::Connected);
                    return Ok(());
                }
                Ok(Ok(event)) => trace!(?event, "waiting for CONNACK"),
                Ok(Err(e)) => return Err(connect_error(e)),
                Err(RecvTimeoutError::Timeout) => return Err(ConnectError::Timeout(timeout)),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(ConnectError::Network("request channel closed".into()))
                }
            }
        }
    }

    /// Poll once, queueing any notification. Returns the raw event.
    fn pump(&mut self, timeout: Duration) -> Result<Option<Event>, DisconnectReason> {
        match self.connection.recv_timeout(timeout) {
            Ok(Ok(event)) => {
                if let Some(notification) = translate_event(&event) {
                    if let TransportEvent::Disconnected(reason) = &notification {
                        self.connected = false;
                        self.pending.push_back(notification.clone());
                        return Err(reason.clone());
                    }
                    self.pending.push_back(notification);
                }
                Ok(Some(event))
            }
            Ok(Err(e)) => {
                let reason = DisconnectReason::NetworkError(e.to_string());
                self.lost(reason.clone());
                Err(reason)
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                self.lost(DisconnectReason::ClientClosed);
                Err(DisconnectReason::ClientClosed)
            }
        }
    }

    fn lost(&mut self, reason: DisconnectReason) {
        warn!(%reason, "bridge connection lost");
        self.connected = false;
        self.pending.push_back(TransportEvent::Disconnected(reason));
    }

    /// Drive the event loop until our publish is flushed (and acked for QoS 1)
    fn await_delivery(&mut self, guarantee: DeliveryGuarantee) -> Result<(), PublishError> {
        let deadline = Instant::now() + self.ack_timeout;
        let mut packet_id = None;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(PublishError::AckTimeout(self.ack_timeout));
            }

            let event = self
                .pump(remaining)
                .map_err(|reason| PublishError::ConnectionLost(reason.to_string()))?;

            match (event, packet_id) {
                (Some(Event::Outgoing(Outgoing::Publish(pkid))), None) => {
                    if guarantee == DeliveryGuarantee::AtMostOnce {
                        return Ok(());
                    }
                    packet_id = Some(pkid);
                }
                (Some(Event::Incoming(Packet::PubAck(ack))), Some(expected))
                    if ack.pkid == expected =>
                {
                    return Ok(());
                }
                (Some(_), _) => {}
                (None, _) => return Err(PublishError::AckTimeout(self.ack_timeout)),
            }
        }
    }
}

impl Connection for BridgeConnection {
    fn subscribe(&mut self, topic: &str, guarantee: DeliveryGuarantee) -> Result<(), ConnectError> {
        self.client
            .try_subscribe(topic, to_qos(guarantee))
            .map_err(|e| ConnectError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;
        debug!(topic, qos = guarantee.qos(), "subscription requested");
        Ok(())
    }

    fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        guarantee: DeliveryGuarantee,
    ) -> Result<(), PublishError> {
        if !self.connected {
            return Err(PublishError::NotConnected);
        }

        self.client
            .try_publish(topic, to_qos(guarantee), false, payload.to_vec())
            .map_err(|e| PublishError::Rejected(e.to_string()))?;
        self.await_delivery(guarantee)
    }

    fn poll_events(&mut self) -> Vec<TransportEvent> {
        // a failed connection is not polled again: rumqttc would reconnect
        // with the stale token
        let mut drained = 0;
        while self.connected && drained < MAX_EVENTS_PER_POLL {
            match self.pump(self.poll_timeout) {
                Ok(Some(_)) => drained += 1,
                Ok(None) | Err(_) => break,
            }
        }
        self.pending.drain(..).collect()
    }

    fn disconnect(&mut self) {
        if self.connected {
            if let Err(e) = self.client.try_disconnect() {
                debug!(error = %e, "disconnect request not queued");
            } else {
                // flush the DISCONNECT packet
                let deadline = Instant::now() + self.poll_timeout;
                while let Ok(Ok(event)) = self
                    .connection
                    .recv_timeout(deadline.saturating_duration_since(Instant::now()))
                {
                    if matches!(event, Event::Outgoing(Outgoing::Disconnect)) {
                        break;
                    }
                }
            }
        }
        self.connected = false;
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::{ConnAck, PubAck, Publish};
    use std::io::{self, Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread::{self, JoinHandle};

    const CONNECT: u8 = 1;
    const PUBLISH: u8 = 3;
    const DISCONNECT: u8 = 14;
    const CONNACK_ACCEPTED: [u8; 4] = [0x20, 0x02, 0x00, 0x00];
    const CONNACK_NOT_AUTHORIZED: [u8; 4] = [0x20, 0x02, 0x00, 0x05];

    /// Read one MQTT packet; returns its type and variable part
    fn read_packet(stream: &mut TcpStream) -> io::Result<(u8, Vec<u8>)> {
        let mut header = [0u8; 1];
        stream.read_exact(&mut header)?;

        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let mut byte = [0u8; 1];
            stream.read_exact(&mut byte)?;
            len |= ((byte[0] & 0x7f) as usize) << shift;
            if byte[0] & 0x80 == 0 {
                break;
            }
            shift += 7;
        }

        let mut body = vec![0u8; len];
        stream.read_exact(&mut body)?;
        Ok((header[0] >> 4, body))
    }

    /// Packet types received until the client goes away
    fn drain(stream: &mut TcpStream) -> Vec<u8> {
        let mut seen = Vec::new();
        while let Ok((kind, _)) = read_packet(stream) {
            seen.push(kind);
        }
        seen
    }

    /// Single-client broker on a loopback port; `serve` runs after CONNECT
    fn broker<F>(serve: F) -> (Endpoint, JoinHandle<Vec<u8>>)
    where
        F: FnOnce(&mut TcpStream) -> Vec<u8> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let (kind, _) = read_packet(&mut stream).unwrap();
            assert_eq!(kind, CONNECT);
            serve(&mut stream)
        });
        (Endpoint::new("127.0.0.1", port), handle)
    }

    fn loopback_bridge(timeout: Duration) -> MqttBridge {
        MqttBridge::new(BridgeConfig {
            connect_timeout: timeout,
            ack_timeout: timeout,
            poll_timeout: Duration::from_millis(250),
            ..BridgeConfig::local()
        })
    }

    fn credentials() -> ConnectCredentials {
        ConnectCredentials {
            client_id: "projects/p/locations/us-central1/registries/r/devices/pi5".into(),
            username: "unused".into(),
            password: "token".into(),
        }
    }

    #[test]
    fn test_config_cloud_iot() {
        let config = BridgeConfig::cloud_iot("roots.pem");
        assert_eq!(config.ca_certs, Some(PathBuf::from("roots.pem")));
        assert_eq!(config.keep_alive, Duration::from_secs(60));
    }

    #[test]
    fn test_config_local() {
        let config = BridgeConfig::local();
        assert!(config.ca_certs.is_none());
    }

    #[test]
    fn test_mqtt_options() {
        let config = BridgeConfig::local();
        let opts = config
            .mqtt_options(&Endpoint::new("localhost", 1883), &credentials())
            .unwrap();

        assert_eq!(opts.broker_address(), ("localhost".to_string(), 1883));
        assert_eq!(
            opts.client_id(),
            "projects/p/locations/us-central1/registries/r/devices/pi5"
        );
        assert_eq!(
            opts.credentials(),
            Some(("unused".to_string(), "token".to_string()))
        );
        assert!(opts.clean_session());
    }

    #[test]
    fn test_missing_ca_bundle() {
        let config = BridgeConfig::cloud_iot("/nonexistent/roots.pem");
        let err = config
            .mqtt_options(&Endpoint::new(CLOUD_BRIDGE_HOST, TLS_PORT), &credentials())
            .unwrap_err();
        assert!(matches!(err, ConnectError::Tls(_)));
    }

    #[test]
    fn test_translate_events() {
        let connack = Event::Incoming(Packet::ConnAck(ConnAck::new(ConnectReturnCode::Success, false)));
        assert_eq!(translate_event(&connack), Some(TransportEvent::Connected));

        let refused = Event::Incoming(Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::NotAuthorized,
            false,
        )));
        assert_eq!(translate_event(&refused), None);

        let publish = Event::Incoming(Packet::Publish(Publish::new(
            "devices/pi5/config",
            QoS::AtLeastOnce,
            b"{\"interval\":5}".to_vec(),
        )));
        assert_eq!(
            translate_event(&publish),
            Some(TransportEvent::Message(InboundMessage {
                topic: "devices/pi5/config".into(),
                payload: b"{\"interval\":5}".to_vec(),
            }))
        );

        let puback = Event::Incoming(Packet::PubAck(PubAck::new(3)));
        assert_eq!(
            translate_event(&puback),
            Some(TransportEvent::Published { packet_id: 3 })
        );

        assert_eq!(
            translate_event(&Event::Incoming(Packet::Disconnect)),
            Some(TransportEvent::Disconnected(DisconnectReason::ServerClosed))
        );
        assert_eq!(translate_event(&Event::Outgoing(Outgoing::PingReq)), None);
    }

    #[test]
    fn test_refused_connack() {
        let (endpoint, broker) = broker(|stream| {
            stream.write_all(&CONNACK_NOT_AUTHORIZED).unwrap();
            Vec::new()
        });

        let err = loopback_bridge(Duration::from_secs(5))
            .connect(&endpoint, &credentials())
            .err()
            .unwrap();
        assert!(matches!(err, ConnectError::Refused(ref code) if code == "NotAuthorized"));
        broker.join().unwrap();
    }

    #[test]
    fn test_connack_timeout() {
        let (endpoint, broker) = broker(drain);

        let err = loopback_bridge(Duration::from_millis(200))
            .connect(&endpoint, &credentials())
            .err()
            .unwrap();
        assert!(matches!(err, ConnectError::Timeout(t) if t == Duration::from_millis(200)));
        broker.join().unwrap();
    }

    #[test]
    fn test_at_least_once_publish_waits_for_puback() {
        let (endpoint, broker) = broker(|stream| {
            stream.write_all(&CONNACK_ACCEPTED).unwrap();
            let mut seen = Vec::new();
            while let Ok((kind, body)) = read_packet(stream) {
                seen.push(kind);
                if kind == PUBLISH {
                    let topic_len = u16::from_be_bytes([body[0], body[1]]) as usize;
                    let pkid = &body[2 + topic_len..4 + topic_len];
                    stream.write_all(&[0x40, 0x02, pkid[0], pkid[1]]).unwrap();
                }
            }
            seen
        });

        let mut conn = loopback_bridge(Duration::from_secs(5))
            .connect(&endpoint, &credentials())
            .unwrap();
        conn.publish("devices/pi5/events", &[b'x'; 200], DeliveryGuarantee::AtLeastOnce)
            .unwrap();

        let events = conn.poll_events();
        assert_eq!(events.first(), Some(&TransportEvent::Connected));
        assert!(events.contains(&TransportEvent::Published { packet_id: 1 }));

        conn.disconnect();
        drop(conn);
        assert_eq!(broker.join().unwrap(), vec![PUBLISH, DISCONNECT]);
    }

    #[test]
    fn test_missing_puback_times_out() {
        let (endpoint, broker) = broker(|stream| {
            stream.write_all(&CONNACK_ACCEPTED).unwrap();
            drain(stream)
        });

        let mut conn = loopback_bridge(Duration::from_millis(200))
            .connect(&endpoint, &credentials())
            .unwrap();
        assert_eq!(
            conn.publish("devices/pi5/events", b"{}", DeliveryGuarantee::AtLeastOnce),
            Err(PublishError::AckTimeout(Duration::from_millis(200)))
        );

        drop(conn);
        assert_eq!(broker.join().unwrap(), vec![PUBLISH]);
    }

    #[test]
    fn test_closed_socket_is_not_polled_again() {
        let (endpoint, broker) = broker(|stream| {
            stream.write_all(&CONNACK_ACCEPTED).unwrap();
            Vec::new()
        });

        let mut conn = loopback_bridge(Duration::from_secs(5))
            .connect(&endpoint, &credentials())
            .unwrap();
        broker.join().unwrap();

        let events = conn.poll_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], TransportEvent::Connected);
        assert!(matches!(
            events[1],
            TransportEvent::Disconnected(DisconnectReason::NetworkError(_))
        ));

        assert!(conn.poll_events().is_empty());
        assert_eq!(
            conn.publish("devices/pi5/events", b"{}", DeliveryGuarantee::AtLeastOnce),
            Err(PublishError::NotConnected)
        );
    }
}
