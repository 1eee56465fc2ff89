use clap::{Parser, ValueEnum};
use std::num::ParseIntError;
use std::path::PathBuf;
use std::time::Duration;

use alice_iot_link::mqtt_bridge::{CLOUD_BRIDGE_HOST, TLS_ALT_PORT, TLS_PORT};
use alice_iot_link::{MessageKind, SigningAlgorithm};

fn parse_duration(s: &str) -> Result<Duration, ParseIntError> {
    let millis: u64 = s.parse()?;
    Ok(Duration::from_millis(millis))
}

fn parse_seconds(s: &str) -> Result<Duration, ParseIntError> {
    let secs: u64 = s.parse()?;
    Ok(Duration::from_secs(secs))
}

fn parse_minutes(s: &str) -> Result<Duration, String> {
    let minutes: u64 = s.parse().map_err(|e: ParseIntError| e.to_string())?;
    minutes
        .checked_mul(60)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("{minutes} minutes is out of range"))
}

fn parse_bridge_port(s: &str) -> Result<u16, String> {
    let port: u16 = s.parse().map_err(|e: ParseIntError| e.to_string())?;
    if port == TLS_PORT || port == TLS_ALT_PORT {
        Ok(port)
    } else {
        Err(format!("bridge port must be {TLS_PORT} or {TLS_ALT_PORT}"))
    }
}

/// Where message readings come from
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum PayloadSource {
    /// Host metrics: RAM, CPU, cores, processes, battery
    Host,
    /// Environmental sensor: temperature, humidity, pressure
    Environment,
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)] // read from Cargo.toml
pub struct Cli {
    /// Signature algorithm of the device key
    #[arg(env = "IOT_LINK_ALGORITHM", long = "algorithm", value_name = "alg")]
    pub algorithm: SigningAlgorithm,

    /// CA root bundle for the bridge TLS connection
    #[arg(
        env = "IOT_LINK_CA_CERTS",
        long = "ca-certs",
        value_name = "path",
        default_value = "roots.pem"
    )]
    pub ca_certs: PathBuf,

    /// Cloud region of the device registry
    #[arg(
        env = "IOT_LINK_CLOUD_REGION",
        long = "cloud-region",
        value_name = "region",
        default_value = "us-central1"
    )]
    pub cloud_region: String,

    /// Device id inside the registry
    #[arg(env = "IOT_LINK_DEVICE_ID", long = "device-id", value_name = "id")]
    pub device_id: String,

    /// Token lifetime in minutes
    #[arg(
        env = "IOT_LINK_JWT_EXPIRES_MINUTES",
        long = "jwt-expires-minutes",
        value_name = "minutes",
        value_parser = parse_minutes,
        default_value = "20"
    )]
    pub jwt_expires: Duration,

    /// Seconds to keep listening for configuration and commands after publishing
    #[arg(
        env = "IOT_LINK_LISTEN_DUR",
        long = "listen-dur",
        value_name = "secs",
        value_parser = parse_seconds,
        default_value = "60"
    )]
    pub listen_dur: Duration,

    /// Publish telemetry events or device state
    #[arg(
        env = "IOT_LINK_MESSAGE_TYPE",
        long = "message-type",
        value_name = "type",
        default_value = "event"
    )]
    pub message_type: MessageKind,

    /// Bridge host name
    #[arg(
        env = "IOT_LINK_MQTT_BRIDGE_HOSTNAME",
        long = "mqtt-bridge-hostname",
        value_name = "host",
        default_value = CLOUD_BRIDGE_HOST
    )]
    pub mqtt_bridge_hostname: String,

    /// Bridge port (8883 or 443)
    #[arg(
        env = "IOT_LINK_MQTT_BRIDGE_PORT",
        long = "mqtt-bridge-port",
        value_name = "port",
        value_parser = parse_bridge_port,
        default_value_t = TLS_PORT
    )]
    pub mqtt_bridge_port: u16,

    /// Number of messages to publish
    #[arg(
        env = "IOT_LINK_NUM_MESSAGES",
        long = "num-messages",
        value_name = "n",
        default_value_t = 100
    )]
    pub num_messages: u32,

    /// PEM private key used to sign tokens
    #[arg(env = "IOT_LINK_PRIVATE_KEY_FILE", long = "private-key-file", value_name = "path")]
    pub private_key_file: PathBuf,

    /// Cloud project id
    #[arg(env = "GOOGLE_CLOUD_PROJECT", long = "project-id", value_name = "id")]
    pub project_id: String,

    /// Device registry id
    #[arg(env = "IOT_LINK_REGISTRY_ID", long = "registry-id", value_name = "id")]
    pub registry_id: String,

    /// Service account credentials; accepted for compatibility, not used
    #[arg(
        env = "GOOGLE_APPLICATION_CREDENTIALS",
        long = "service-account-json",
        value_name = "path"
    )]
    pub service_account_json: Option<PathBuf>,

    /// Source of message readings
    #[arg(
        env = "IOT_LINK_PAYLOAD",
        long = "payload",
        value_name = "source",
        value_enum,
        default_value_t = PayloadSource::Host
    )]
    pub payload: PayloadSource,

    /// Pause between publishes in milliseconds; defaults to 1s for events, 5s for state
    #[arg(
        env = "IOT_LINK_PUBLISH_INTERVAL_MS",
        long = "publish-interval-ms",
        value_name = "ms",
        value_parser = parse_duration
    )]
    pub publish_interval: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUIRED: [&str; 11] = [
        "alice-iot-link",
        "--algorithm",
        "RS256",
        "--device-id",
        "pi5",
        "--private-key-file",
        "rsa_private.pem",
        "--project-id",
        "my-project",
        "--registry-id",
        "my-registry",
    ];

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(REQUIRED).unwrap();
        assert_eq!(cli.algorithm, SigningAlgorithm::Rs256);
        assert_eq!(cli.ca_certs, PathBuf::from("roots.pem"));
        assert_eq!(cli.cloud_region, "us-central1");
        assert_eq!(cli.jwt_expires, Duration::from_secs(20 * 60));
        assert_eq!(cli.listen_dur, Duration::from_secs(60));
        assert_eq!(cli.message_type, MessageKind::Event);
        assert_eq!(cli.mqtt_bridge_hostname, "mqtt.googleapis.com");
        assert_eq!(cli.mqtt_bridge_port, 8883);
        assert_eq!(cli.num_messages, 100);
        assert_eq!(cli.payload, PayloadSource::Host);
        assert!(cli.publish_interval.is_none());
    }

    #[test]
    fn test_overrides() {
        let mut args = REQUIRED.to_vec();
        args.extend([
            "--message-type",
            "state",
            "--mqtt-bridge-port",
            "443",
            "--publish-interval-ms",
            "250",
            "--payload",
            "environment",
        ]);

        let cli = Cli::try_parse_from(args).unwrap();
        assert_eq!(cli.message_type, MessageKind::State);
        assert_eq!(cli.mqtt_bridge_port, 443);
        assert_eq!(cli.publish_interval, Some(Duration::from_millis(250)));
        assert_eq!(cli.payload, PayloadSource::Environment);
    }

    #[test]
    fn test_rejects_other_ports() {
        let mut args = REQUIRED.to_vec();
        args.extend(["--mqtt-bridge-port", "1883"]);
        assert!(Cli::try_parse_from(args).is_err());
    }

    #[test]
    fn test_rejects_out_of_range_token_lifetime() {
        let mut args = REQUIRED.to_vec();
        let minutes = u64::MAX.to_string();
        args.extend(["--jwt-expires-minutes", minutes.as_str()]);
        assert!(Cli::try_parse_from(args).is_err());
    }

    #[test]
    fn test_long_listen_duration() {
        let mut args = REQUIRED.to_vec();
        let secs = u64::MAX.to_string();
        args.extend(["--listen-dur", secs.as_str()]);

        let cli = Cli::try_parse_from(args).unwrap();
        assert_eq!(cli.listen_dur, Duration::from_secs(u64::MAX));
    }
}
