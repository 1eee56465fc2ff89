//! MQTT local publish: run the telemetry loop against a local Mosquitto
//!
//! Prerequisites:
//!   sudo apt install mosquitto mosquitto-clients
//!   sudo systemctl start mosquitto
//!
//! Subscribe to watch messages:
//!   mosquitto_sub -t 'devices/#' -v
//!
//! ```bash
//! cargo run --example mqtt_local
//! ```
//!
//! Author: Moroya Sakamoto

use alice_iot_link::{
    BridgeConfig, CredentialError, CredentialProvider, DeviceIdentity, Endpoint, LoopConfig,
    MessageKind, MqttBridge, SensorMessageBuilder, SessionConfig, SessionManager, SignedToken,
    SimulatedSensor, SystemClock, TelemetryLoop,
};
use std::time::{Duration, SystemTime};

/// Mosquitto accepts any password, so the token is a fixed string
struct LocalToken;

impl CredentialProvider for LocalToken {
    fn issue_token(
        &self,
        _identity: &DeviceIdentity,
        validity: Duration,
    ) -> Result<SignedToken, CredentialError> {
        let now = SystemTime::now();
        let expires_at = now
            .checked_add(validity)
            .ok_or_else(|| CredentialError::Signing("lifetime out of range".into()))?;
        Ok(SignedToken::new("local", now, expires_at))
    }
}

fn main() {
    println!("=== ALICE-IoT-Link: MQTT Local Publish ===\n");

    let identity = DeviceIdentity::new("local", "us-central1", "bench", "pi5");
    let config = SessionConfig::new(identity, Endpoint::new("localhost", 1883))
        .with_token_validity(Duration::from_secs(20));

    let mut session = SessionManager::new(
        config,
        MqttBridge::new(BridgeConfig::local()),
        LocalToken,
        SystemClock,
    );

    if let Err(e) = session.start() {
        eprintln!("Failed to connect: {}", e);
        eprintln!("Is Mosquitto running? sudo systemctl start mosquitto");
        return;
    }
    println!("Connected to localhost:1883");

    // 30 events, one per second: the 20s token forces one refresh
    let builder = SensorMessageBuilder::new(SimulatedSensor::new(2500, 5));
    let loop_config = LoopConfig::new(30, MessageKind::Event);
    let report = match TelemetryLoop::new(&mut session, builder, loop_config).run() {
        Ok(report) => report,
        Err(e) => {
            eprintln!("Loop stopped: {}", e);
            return;
        }
    };

    println!("\nListening for config and commands for 5s...");
    let received = session.listen(Duration::from_secs(5));
    session.close();

    println!(
        "\nStats: {} published, {} failed, {} token refreshes, {} received",
        report.published, report.publish_failures, report.token_refreshes, received
    );
    if let Some(config) = session.last_config() {
        println!("Latest config: {}", String::from_utf8_lossy(config));
    }
    println!("\nDone! Check: mosquitto_sub -t 'devices/#' -v");
}
