mod cli;

use alice_iot_link::{
    BridgeConfig, DeviceIdentity, Endpoint, JwtSigner, LoopConfig, LoopOutcome, MqttBridge,
    SensorMessageBuilder, SessionConfig, SessionManager, SimulatedHost, SimulatedSensor,
    SystemClock, TelemetryLoop,
};
use clap::Parser;
use cli::{Cli, PayloadSource};
use std::error::Error;
use tracing::{debug, info, warn};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

fn main() -> Result<(), Box<dyn Error>> {
    // Initialize tracing subscriber for human-readable logs
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or(
                EnvFilter::default()
                    .add_directive("info".parse()?)
                    .add_directive("rumqttc=warn".parse()?),
            ),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::CLOSE)
                .event_format(fmt::format().compact().with_target(false)),
        )
        .init();

    let cli = Cli::parse();
    debug!("{:#?}", cli);

    if let Some(path) = &cli.service_account_json {
        info!(path = %path.display(), "service account credentials are not used by the device");
    }

    let identity = DeviceIdentity::new(
        &cli.project_id,
        &cli.cloud_region,
        &cli.registry_id,
        &cli.device_id,
    );
    let config = SessionConfig::new(
        identity,
        Endpoint::new(&cli.mqtt_bridge_hostname, cli.mqtt_bridge_port),
    )
    .with_token_validity(cli.jwt_expires);

    let mut session = SessionManager::new(
        config,
        MqttBridge::new(BridgeConfig::cloud_iot(&cli.ca_certs)),
        JwtSigner::new(&cli.private_key_file, cli.algorithm),
        SystemClock,
    );

    // a connect failure is retried by the loop's backoff
    if let Err(e) = session.start() {
        if e.is_fatal() {
            return Err(e.into());
        }
        warn!(error = %e, "initial connect failed, backing off");
    }

    let mut loop_config = LoopConfig::new(cli.num_messages, cli.message_type);
    if let Some(interval) = cli.publish_interval {
        loop_config = loop_config.with_interval(interval);
    }

    let report = match cli.payload {
        PayloadSource::Host => {
            let builder = SensorMessageBuilder::new(SimulatedHost::new(cores()));
            TelemetryLoop::new(&mut session, builder, loop_config).run()?
        }
        PayloadSource::Environment => {
            let builder = SensorMessageBuilder::new(SimulatedSensor::new(2500, 5));
            TelemetryLoop::new(&mut session, builder, loop_config).run()?
        }
    };

    if report.outcome == LoopOutcome::Completed {
        session.listen(cli.listen_dur);
    }
    session.close();

    let stats = session.stats();
    info!(
        published = report.published,
        failures = report.publish_failures,
        reconnects = report.reconnects,
        token_refreshes = report.token_refreshes,
        received = stats.messages_received,
        gave_up = report.gave_up(),
        "Finished"
    );
    Ok(())
}

fn cores() -> u64 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u64)
        .unwrap_or(1)
}
