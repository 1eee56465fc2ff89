//! Periodic publish loop
//!
//! Each iteration services the connection, reconnects if the backoff
//! controller says so, builds a message, refreshes the token when due,
//! publishes and sleeps:
//!
//! ```text
//! for i in 0..N:
//!   service_events
//!   backing off? ── next_delay ──GiveUp──▶ stop (GaveUp)
//!        └── sleep(delay), open()
//!   build message ─ensure_fresh─▶ publish (at least once) ─▶ sleep(interval)
//! ```
//!
//! Publish failures are logged and counted; only a credential failure or
//! give-up ends the loop early.
//!
//! Author: Moroya Sakamoto

use std::time::Duration;
use tracing::{error, info, warn};

use crate::backoff::GiveUp;
use crate::clock::Clock;
use crate::credentials::CredentialProvider;
use crate::device::MessageKind;
use crate::message::MessageBuilder;
use crate::session::{SessionError, SessionManager};
use crate::transport::{DeliveryGuarantee, Transport};

/// Loop configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopConfig {
    /// Iterations to run
    pub message_count: u32,
    /// Sleep after each iteration
    pub publish_interval: Duration,
    /// Event or state messages
    pub kind: MessageKind,
}

impl LoopConfig {
    /// `message_count` messages of `kind` at the kind's default interval
    pub fn new(message_count: u32, kind: MessageKind) -> Self {
        Self {
            message_count,
            publish_interval: kind.default_interval(),
            kind,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.publish_interval = interval;
        self
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self::new(100, MessageKind::Event)
    }
}

/// How the loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    /// All iterations ran
    Completed,
    /// Reconnecting was abandoned
    GaveUp(GiveUp),
}

/// Loop counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopReport {
    /// Iterations started
    pub iterations: u32,
    /// Messages the transport accepted
    pub published: u32,
    /// Publishes that failed
    pub publish_failures: u32,
    /// Iterations without a message because the sensors failed
    pub skipped: u32,
    /// Reconnects tried after a backoff delay
    pub reconnect_attempts: u32,
    /// Reconnects that succeeded
    pub reconnects: u32,
    /// Sessions reopened for a fresh token
    pub token_refreshes: u32,
    pub outcome: LoopOutcome,
}

impl LoopReport {
    fn new() -> Self {
        Self {
            iterations: 0,
            published: 0,
            publish_failures: 0,
            skipped: 0,
            reconnect_attempts: 0,
            reconnects: 0,
            token_refreshes: 0,
            outcome: LoopOutcome::Completed,
        }
    }

    pub fn gave_up(&self) -> bool {
        matches!(self.outcome, LoopOutcome::GaveUp(_))
    }
}

/// Drives publish cycles over a borrowed session manager
pub struct TelemetryLoop<'a, T: Transport, P, K, B> {
    session: &'a mut SessionManager<T, P, K>,
    builder: B,
    config: LoopConfig,
}

impl<'a, T, P, K, B> TelemetryLoop<'a, T, P, K, B>
where
    T: Transport,
    P: CredentialProvider,
    K: Clock,
    B: MessageBuilder,
{
    pub fn new(session: &'a mut SessionManager<T, P, K>, builder: B, config: LoopConfig) -> Self {
        Self {
            session,
            builder,
            config,
        }
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    /// Run every iteration, or until reconnecting is abandoned
    ///
    /// Errors only on a credential failure, which no amount of retrying
    /// can fix.
    pub fn run(&mut self) -> Result<LoopReport, SessionError> {
        let mut report = LoopReport::new();
        let total = self.config.message_count;

        for sequence in 0..total {
            report.iterations += 1;

            self.session.service_events();

            if self.session.backoff().is_backing_off() {
                match self.session.backoff_mut().next_delay() {
                    Ok(delay) => {
                        info!(?delay, "waiting before reconnect");
                        self.session.clock().sleep(delay);
                        report.reconnect_attempts += 1;
                        match self.session.open() {
                            Ok(()) => report.reconnects += 1,
                            Err(e) if e.is_fatal() => return Err(e),
                            Err(e) => warn!(error = %e, "reconnect failed"),
                        }
                    }
                    Err(give_up) => {
                        error!(%give_up, "stopping telemetry");
                        report.outcome = LoopOutcome::GaveUp(give_up);
                        return Ok(report);
                    }
                }
            }

            let collected_at = self.session.clock().wall_time();
            let message =
                match self
                    .builder
                    .build(sequence, &self.session.config().identity, collected_at)
                {
                    Ok(message) => Some(message),
                    Err(e) => {
                        warn!(error = %e, sequence, "sensor read failed, skipping publish");
                        report.skipped += 1;
                        None
                    }
                };

            match self.session.ensure_fresh() {
                Ok(true) => report.token_refreshes += 1,
                Ok(false) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(error = %e, "token refresh failed"),
            }

            if let Some(message) = message {
                info!(sequence = sequence + 1, total, kind = %self.config.kind, "publishing message");
                let payload = message.encode();
                match self
                    .session
                    .publish(self.config.kind, &payload, DeliveryGuarantee::AtLeastOnce)
                {
                    Ok(()) => report.published += 1,
                    Err(e) => {
                        warn!(error = %e, sequence = sequence + 1, "publish failed");
                        report.publish_failures += 1;
                    }
                }
            }

            self.session.clock().sleep(self.config.publish_interval);
        }

        info!(
            published = report.published,
            failures = report.publish_failures,
            "finished publishing"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::FixedJitter;
    use crate::clock::ManualClock;
    use crate::device::DeviceIdentity;
    use crate::message::{SensorMessageBuilder, TelemetryMessage};
    use crate::mock::{MockCredentials, MockTransport};
    use crate::sensors::{SensorError, SimulatedHost};
    use crate::session::SessionConfig;
    use crate::transport::{ConnectError, Endpoint, PublishError};
    use std::time::SystemTime;

    fn manager(
        transport: &MockTransport,
        credentials: &MockCredentials,
        clock: &ManualClock,
    ) -> SessionManager<MockTransport, MockCredentials, ManualClock> {
        let config = SessionConfig::new(
            DeviceIdentity::new("my-project", "us-central1", "my-registry", "pi5"),
            Endpoint::new("localhost", 1883),
        );
        SessionManager::new(config, transport.clone(), credentials.clone(), clock.clone())
            .with_jitter(FixedJitter(Duration::ZERO))
    }

    #[test]
    fn test_completes_all_iterations() {
        let (transport, credentials, clock) =
            (MockTransport::new(), MockCredentials::new(), ManualClock::new());
        let mut session = manager(&transport, &credentials, &clock);
        session.start().unwrap();

        let builder = SensorMessageBuilder::new(SimulatedHost::new(4));
        let report = TelemetryLoop::new(&mut session, builder, LoopConfig::new(3, MessageKind::Event))
            .run()
            .unwrap();

        assert_eq!(report.outcome, LoopOutcome::Completed);
        assert_eq!(report.iterations, 3);
        assert_eq!(report.published, 3);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(1); 3]);
        assert!(transport
            .published()
            .iter()
            .all(|(topic, _)| topic == "devices/pi5/events"));
    }

    #[test]
    fn test_publish_failure_is_counted() {
        let (transport, credentials, clock) =
            (MockTransport::new(), MockCredentials::new(), ManualClock::new());
        let mut session = manager(&transport, &credentials, &clock);
        session.start().unwrap();
        transport.push_publish_result(Err(PublishError::AckTimeout(Duration::from_secs(5))));

        let builder = SensorMessageBuilder::new(SimulatedHost::new(4));
        let report = TelemetryLoop::new(&mut session, builder, LoopConfig::new(2, MessageKind::State))
            .run()
            .unwrap();

        assert_eq!(report.publish_failures, 1);
        assert_eq!(report.published, 1);
        assert_eq!(clock.elapsed(), Duration::from_secs(10));
    }

    #[test]
    fn test_sensor_failure_skips_publish() {
        let (transport, credentials, clock) =
            (MockTransport::new(), MockCredentials::new(), ManualClock::new());
        let mut session = manager(&transport, &credentials, &clock);
        session.start().unwrap();

        let builder = |seq: u32, id: &DeviceIdentity, at: SystemTime| {
            if seq == 1 {
                Err(SensorError::NotFound("bme280".into()))
            } else {
                Ok(TelemetryMessage::new(id, at, Default::default()))
            }
        };
        let report = TelemetryLoop::new(&mut session, builder, LoopConfig::new(3, MessageKind::Event))
            .run()
            .unwrap();

        assert_eq!(report.skipped, 1);
        assert_eq!(report.published, 2);
        assert_eq!(transport.published().len(), 2);
    }

    #[test]
    fn test_lost_connection_reconnects() {
        let (transport, credentials, clock) =
            (MockTransport::new(), MockCredentials::new(), ManualClock::new());
        let mut session = manager(&transport, &credentials, &clock);
        session.start().unwrap();
        transport.push_publish_result(Err(PublishError::ConnectionLost("reset".into())));

        let builder = SensorMessageBuilder::new(SimulatedHost::new(4));
        let report = TelemetryLoop::new(&mut session, builder, LoopConfig::new(3, MessageKind::Event))
            .run()
            .unwrap();

        assert_eq!(report.reconnects, 1);
        assert_eq!(report.published, 2);
        assert_eq!(transport.passwords(), vec!["token-1", "token-2"]);
        assert_eq!(
            clock.sleeps(),
            vec![
                Duration::from_secs(1),
                Duration::from_secs(1),
                Duration::from_secs(1),
                Duration::from_secs(1),
            ]
        );
    }

    #[test]
    fn test_credential_failure_on_reconnect_aborts() {
        let (transport, credentials, clock) =
            (MockTransport::new(), MockCredentials::new(), ManualClock::new());
        let mut session = manager(&transport, &credentials, &clock);
        transport.push_connect_result(Err(ConnectError::Network("unreachable".into())));
        assert!(session.start().is_err());
        credentials.fail();

        let builder = SensorMessageBuilder::new(SimulatedHost::new(4));
        let result = TelemetryLoop::new(&mut session, builder, LoopConfig::new(3, MessageKind::Event)).run();

        assert!(matches!(result, Err(SessionError::Credential(_))));
    }
}
