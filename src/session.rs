//! Bridge session lifecycle
//!
//! [`SessionManager`] owns the one live [`Session`] for a device: it issues
//! the token, connects, subscribes, refreshes the token when it expires and
//! feeds connection notifications into the [`BackoffController`]. It never
//! retries on its own; the telemetry loop decides when to reconnect.
//!
//! Notifications are handled synchronously: [`SessionManager::service_events`]
//! polls the connection and dispatches each event to the manager's own
//! [`ConnectionObserver`] implementation.
//!
//! Author: Moroya Sakamoto

use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::backoff::{BackoffConfig, BackoffController, JitterSource};
use crate::clock::Clock;
use crate::credentials::{CredentialError, CredentialProvider};
use crate::device::{DeviceIdentity, MessageKind, Topics};
use crate::transport::{
    dispatch, ConnectCredentials, ConnectError, Connection, ConnectionObserver, DeliveryGuarantee,
    DisconnectReason, Endpoint, InboundMessage, PublishError, Transport,
};

/// Username the bridge expects; it authenticates by the token alone
pub const BRIDGE_USERNAME: &str = "unused";

/// Default token lifetime
pub const DEFAULT_TOKEN_VALIDITY: Duration = Duration::from_secs(20 * 60);

/// Pause between polls while listening
const LISTEN_TICK: Duration = Duration::from_millis(100);

/// Session errors
#[derive(Debug, Error)]
pub enum SessionError {
    /// No token could be issued; retrying will not help
    #[error("credential error: {0}")]
    Credential(#[from] CredentialError),

    /// The bridge could not be reached or refused the session
    #[error("connect error: {0}")]
    Connect(#[from] ConnectError),
}

impl SessionError {
    /// Whether the caller should stop instead of backing off
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::Credential(_))
    }
}

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub identity: DeviceIdentity,
    pub endpoint: Endpoint,
    /// How long an issued token is used before the session is reopened
    pub token_validity: Duration,
    pub backoff: BackoffConfig,
}

impl SessionConfig {
    pub fn new(identity: DeviceIdentity, endpoint: Endpoint) -> Self {
        Self {
            identity,
            endpoint,
            token_validity: DEFAULT_TOKEN_VALIDITY,
            backoff: BackoffConfig::default(),
        }
    }

    pub fn with_token_validity(mut self, validity: Duration) -> Self {
        self.token_validity = validity;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }
}

/// One authenticated connection
#[derive(Debug)]
pub struct Session<C> {
    connection: C,
    token_issued_at: Instant,
    token_validity: Duration,
    connected: bool,
}

impl<C> Session<C> {
    /// Whether the token has outlived its validity at `now`
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.token_issued_at) > self.token_validity
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }
}

/// Session counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Sessions opened
    pub connects: u32,
    /// Opens that failed to connect
    pub connect_failures: u32,
    /// Connections lost after being established
    pub disconnects: u32,
    /// Sessions reopened because the token expired
    pub token_refreshes: u32,
    /// Messages pushed by the bridge
    pub messages_received: u32,
}

/// Owns the session, the token lifetime and the backoff state
pub struct SessionManager<T: Transport, P, K> {
    config: SessionConfig,
    topics: Topics,
    transport: T,
    credentials: P,
    clock: K,
    session: Option<Session<T::Connection>>,
    backoff: BackoffController,
    stats: SessionStats,
    last_config: Option<Vec<u8>>,
}

impl<T, P, K> SessionManager<T, P, K>
where
    T: Transport,
    P: CredentialProvider,
    K: Clock,
{
    pub fn new(config: SessionConfig, transport: T, credentials: P, clock: K) -> Self {
        Self {
            topics: config.identity.topics(),
            backoff: BackoffController::new(config.backoff.clone()),
            config,
            transport,
            credentials,
            clock,
            session: None,
            stats: SessionStats::default(),
            last_config: None,
        }
    }

    /// Replace the backoff jitter source
    pub fn with_jitter(mut self, jitter: impl JitterSource + 'static) -> Self {
        self.backoff = BackoffController::with_jitter(self.config.backoff.clone(), jitter);
        self
    }

    /// Open the initial session
    pub fn start(&mut self) -> Result<(), SessionError> {
        info!(
            device = %self.config.identity.device_id,
            endpoint = %self.config.endpoint,
            "starting session"
        );
        self.open()
    }

    /// Issue a fresh token, connect and subscribe
    ///
    /// Any existing session is closed first. A connect failure puts the
    /// backoff controller into its backing-off state; a credential failure
    /// leaves it untouched.
    #[instrument(skip(self), fields(device = %self.config.identity.device_id))]
    pub fn open(&mut self) -> Result<(), SessionError> {
        self.close();

        let token = self
            .credentials
            .issue_token(&self.config.identity, self.config.token_validity)?;
        let issued_at = self.clock.now();

        let credentials = ConnectCredentials {
            client_id: self.config.identity.client_id(),
            username: BRIDGE_USERNAME.to_string(),
            password: token.as_str().to_string(),
        };

        let connection = match self.connect(&credentials) {
            Ok(connection) => connection,
            Err(e) => {
                warn!(error = %e, endpoint = %self.config.endpoint, "failed to open session");
                self.stats.connect_failures += 1;
                self.backoff.on_disconnect();
                return Err(e.into());
            }
        };

        self.session = Some(Session {
            connection,
            token_issued_at: issued_at,
            token_validity: self.config.token_validity,
            connected: true,
        });
        self.stats.connects += 1;
        info!(endpoint = %self.config.endpoint, "session opened");

        // deliver the connect notification right away
        self.service_events();
        Ok(())
    }

    fn connect(&mut self, credentials: &ConnectCredentials) -> Result<T::Connection, ConnectError> {
        let mut connection = self.transport.connect(&self.config.endpoint, credentials)?;

        let subscriptions = [
            (&self.topics.config, DeliveryGuarantee::AtLeastOnce),
            (&self.topics.commands, DeliveryGuarantee::AtMostOnce),
        ];
        for (topic, guarantee) in subscriptions {
            if let Err(e) = connection.subscribe(topic, guarantee) {
                connection.disconnect();
                return Err(e);
            }
        }
        Ok(connection)
    }

    /// Reopen the session if its token has expired
    ///
    /// Returns `true` when a refresh happened. Only a connected session is
    /// refreshed; a lost one is reopened by the backoff path instead.
    pub fn ensure_fresh(&mut self) -> Result<bool, SessionError> {
        let now = self.clock.now();
        let expired = match &self.session {
            Some(session) => session.connected && session.is_expired(now),
            None => false,
        };
        if !expired {
            return Ok(false);
        }

        info!(validity = ?self.config.token_validity, "token expired, refreshing session");
        self.open()?;
        self.stats.token_refreshes += 1;
        Ok(true)
    }

    /// Disconnect and drop the session; no-op without one
    pub fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.connection.disconnect();
            debug!("session closed");
        }
    }

    /// Poll the connection and handle its notifications
    ///
    /// Returns the number of notifications handled. A connection that has
    /// reported a disconnect is not polled again.
    pub fn service_events(&mut self) -> usize {
        let events = match self.session.as_mut() {
            Some(session) if session.connected => session.connection.poll_events(),
            _ => return 0,
        };

        let handled = events.len();
        for event in events {
            dispatch(self, event);
        }
        handled
    }

    /// Publish a payload on the topic for `kind`
    pub fn publish(
        &mut self,
        kind: MessageKind,
        payload: &[u8],
        guarantee: DeliveryGuarantee,
    ) -> Result<(), PublishError> {
        let topic = self.topics.publish_topic(kind);
        let session = match self.session.as_mut() {
            Some(session) if session.connected => session,
            _ => return Err(PublishError::NotConnected),
        };

        session.connection.publish(topic, payload, guarantee)?;
        debug!(topic, bytes = payload.len(), "published");
        Ok(())
    }

    /// Keep servicing the connection for `duration`
    ///
    /// Returns the number of messages received meanwhile. Stops early when
    /// there is no live connection. A duration past the clock's range
    /// listens until the connection drops.
    pub fn listen(&mut self, duration: Duration) -> u32 {
        let received_before = self.stats.messages_received;
        let deadline = self.clock.now().checked_add(duration);
        info!(?duration, "listening for configuration and commands");

        loop {
            self.service_events();
            if !self.is_connected() {
                break;
            }
            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(self.clock.now()),
                None => LISTEN_TICK,
            };
            if remaining.is_zero() {
                break;
            }
            self.clock.sleep(remaining.min(LISTEN_TICK));
        }

        self.stats.messages_received - received_before
    }

    pub fn is_connected(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.connected)
    }

    pub fn session(&self) -> Option<&Session<T::Connection>> {
        self.session.as_ref()
    }

    pub fn backoff(&self) -> &BackoffController {
        &self.backoff
    }

    pub fn backoff_mut(&mut self) -> &mut BackoffController {
        &mut self.backoff
    }

    pub fn clock(&self) -> &K {
        &self.clock
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Latest payload received on the configuration topic
    pub fn last_config(&self) -> Option<&[u8]> {
        self.last_config.as_deref()
    }
}

impl<T, P, K> ConnectionObserver for SessionManager<T, P, K>
where
    T: Transport,
    P: CredentialProvider,
    K: Clock,
{
    fn on_connected(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.connected = true;
        }
        self.backoff.on_connect_success();
        info!(device = %self.config.identity.device_id, "connected to bridge");
    }

    fn on_disconnected(&mut self, reason: DisconnectReason) {
        if let Some(session) = self.session.as_mut() {
            session.connected = false;
        }
        self.stats.disconnects += 1;
        self.backoff.on_disconnect();
        warn!(%reason, "disconnected from bridge");
    }

    fn on_message(&mut self, message: InboundMessage) {
        self.stats.messages_received += 1;
        info!(
            topic = %message.topic,
            payload = %message.payload_str(),
            "received message"
        );
        if message.topic == self.topics.config {
            self.last_config = Some(message.payload);
        }
    }

    fn on_published(&mut self, packet_id: u16) {
        debug!(packet_id, "publish acknowledged");
    }
}

impl<T: Transport, P, K> Drop for SessionManager<T, P, K> {
    fn drop(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.connection.disconnect();
        }
    }
}
