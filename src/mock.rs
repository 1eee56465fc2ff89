//! Mock transport and credentials for testing
//!
//! [`MockTransport`] records every call made through it and answers with
//! scripted results, so the session and telemetry loop can be exercised
//! without a broker. Clones share state: keep one handle in the test and
//! give the other to the session.
//!
//! Author: Moroya Sakamoto

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use crate::credentials::{CredentialError, CredentialProvider, SignedToken};
use crate::device::DeviceIdentity;
use crate::transport::{
    ConnectCredentials, ConnectError, Connection, DeliveryGuarantee, DisconnectReason, Endpoint,
    InboundMessage, PublishError, Transport, TransportEvent,
};

/// Record of a call made through the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Connect { client_id: String, password: String },
    Subscribe { topic: String, guarantee: DeliveryGuarantee },
    Publish { topic: String, payload: Vec<u8>, guarantee: DeliveryGuarantee },
    Disconnect,
}

#[derive(Debug, Default)]
struct MockState {
    calls: Vec<MockCall>,
    /// Consumed first, one per connect
    connect_results: VecDeque<Result<(), ConnectError>>,
    /// Answer for every connect once the queue is empty
    connect_failure: Option<ConnectError>,
    publish_results: VecDeque<Result<(), PublishError>>,
    subscribe_failure: Option<ConnectError>,
    /// Notifications waiting for the live connection
    events: VecDeque<TransportEvent>,
    /// Identifies the live connection; bumped on every successful connect
    generation: u64,
}

/// Mock transport for testing
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue the result of the next connect
    pub fn push_connect_result(&self, result: Result<(), ConnectError>) {
        self.state().connect_results.push_back(result);
    }

    /// Fail every connect not covered by a queued result
    pub fn fail_connects(&self, error: ConnectError) {
        self.state().connect_failure = Some(error);
    }

    /// Accept connects again
    pub fn accept_connects(&self) {
        self.state().connect_failure = None;
    }

    /// Queue the result of the next publish
    pub fn push_publish_result(&self, result: Result<(), PublishError>) {
        self.state().publish_results.push_back(result);
    }

    /// Fail every subscribe
    pub fn fail_subscribes(&self, error: ConnectError) {
        self.state().subscribe_failure = Some(error);
    }

    /// Deliver a notification on the next poll of the live connection
    pub fn inject(&self, event: TransportEvent) {
        self.state().events.push_back(event);
    }

    /// Simulate the bridge pushing a message
    pub fn deliver(&self, topic: impl Into<String>, payload: impl Into<Vec<u8>>) {
        self.inject(TransportEvent::Message(InboundMessage {
            topic: topic.into(),
            payload: payload.into(),
        }));
    }

    /// Simulate losing the live connection
    pub fn drop_connection(&self, reason: DisconnectReason) {
        self.inject(TransportEvent::Disconnected(reason));
    }

    /// Gets all recorded calls
    pub fn calls(&self) -> Vec<MockCall> {
        self.state().calls.clone()
    }

    /// Number of connect attempts, successful or not
    pub fn connect_attempts(&self) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| matches!(c, MockCall::Connect { .. }))
            .count()
    }

    /// Passwords presented on each connect attempt
    pub fn passwords(&self) -> Vec<String> {
        self.state()
            .calls
            .iter()
            .filter_map(|c| match c {
                MockCall::Connect { password, .. } => Some(password.clone()),
                _ => None,
            })
            .collect()
    }

    /// Topic and payload of every publish that reached the transport
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.state()
            .calls
            .iter()
            .filter_map(|c| match c {
                MockCall::Publish { topic, payload, .. } => Some((topic.clone(), payload.clone())),
                _ => None,
            })
            .collect()
    }
}

impl Transport for MockTransport {
    type Connection = MockConnection;

    fn connect(
        &mut self,
        _endpoint: &Endpoint,
        credentials: &ConnectCredentials,
    ) -> Result<MockConnection, ConnectError> {
        let mut state = self.state();
        state.calls.push(MockCall::Connect {
            client_id: credentials.client_id.clone(),
            password: credentials.password.clone(),
        });

        let result = match state.connect_results.pop_front() {
            Some(result) => result,
            None => match &state.connect_failure {
                Some(error) => Err(error.clone()),
                None => Ok(()),
            },
        };
        result?;

        state.generation += 1;
        state.events.clear();
        state.events.push_back(TransportEvent::Connected);

        Ok(MockConnection {
            state: Arc::clone(&self.state),
            generation: state.generation,
            connected: true,
        })
    }
}

/// Connection handed out by [`MockTransport`]
#[derive(Debug)]
pub struct MockConnection {
    state: Arc<Mutex<MockState>>,
    generation: u64,
    connected: bool,
}

impl MockConnection {
    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_live(&self) -> bool {
        self.connected && self.state().generation == self.generation
    }
}

impl Connection for MockConnection {
    fn subscribe(&mut self, topic: &str, guarantee: DeliveryGuarantee) -> Result<(), ConnectError> {
        let mut state = self.state();
        state.calls.push(MockCall::Subscribe {
            topic: topic.to_string(),
            guarantee,
        });
        match &state.subscribe_failure {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        guarantee: DeliveryGuarantee,
    ) -> Result<(), PublishError> {
        if !self.is_live() {
            return Err(PublishError::NotConnected);
        }

        let mut state = self.state();
        state.calls.push(MockCall::Publish {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            guarantee,
        });

        let result = state.publish_results.pop_front().unwrap_or(Ok(()));
        if let Err(PublishError::ConnectionLost(reason)) = &result {
            let reason = DisconnectReason::NetworkError(reason.clone());
            state.events.push_back(TransportEvent::Disconnected(reason));
        }
        result
    }

    fn poll_events(&mut self) -> Vec<TransportEvent> {
        if !self.is_live() {
            return Vec::new();
        }

        let events: Vec<_> = self.state().events.drain(..).collect();
        if events
            .iter()
            .any(|e| matches!(e, TransportEvent::Disconnected(_)))
        {
            self.connected = false;
        }
        events
    }

    fn disconnect(&mut self) {
        if !self.connected {
            return;
        }
        self.connected = false;

        let mut state = self.state();
        state.calls.push(MockCall::Disconnect);
        if state.generation == self.generation {
            state.events.clear();
        }
    }
}

#[derive(Debug, Default)]
struct CredentialState {
    issued: u32,
    failing: bool,
}

/// Credential provider issuing `token-1`, `token-2`, ...
#[derive(Debug, Clone, Default)]
pub struct MockCredentials {
    state: Arc<Mutex<CredentialState>>,
}

impl MockCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, CredentialState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every following issue fail
    pub fn fail(&self) {
        self.state().failing = true;
    }

    /// Tokens issued so far
    pub fn issued(&self) -> u32 {
        self.state().issued
    }
}

impl CredentialProvider for MockCredentials {
    fn issue_token(
        &self,
        _identity: &DeviceIdentity,
        validity: Duration,
    ) -> Result<SignedToken, CredentialError> {
        let mut state = self.state();
        if state.failing {
            return Err(CredentialError::Signing("mock credential failure".into()));
        }

        let now = SystemTime::now();
        let expires_at = now
            .checked_add(validity)
            .ok_or_else(|| CredentialError::Signing(format!("lifetime {:?} out of range", validity)))?;
        state.issued += 1;
        Ok(SignedToken::new(format!("token-{}", state.issued), now, expires_at))
    }
}
