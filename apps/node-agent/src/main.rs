use anyhow::Result;
use node_agent::analog_cache::AnalogCache;
use node_agent::config::{self, Config};
use node_agent::drivers::{AnalogReader, GpioInputDriver, IioAnalogReader, SysfsPulseCounter};
use node_agent::http;
use node_agent::latency::LatencyProbe;
use node_agent::lifecycle::{Services, ShutdownSignals};
use node_agent::liveness::Liveness;
use node_agent::publisher::{self, PublisherSettings, StatusBoard, TelemetryPublisher};
use node_agent::sensors::{Sensor, SensorKind};
use node_agent::simulation::Simulator;
use node_agent::sink::HttpForwardingSink;
use node_agent::task::Worker;
use std::sync::Arc;

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,node_agent=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

/// Builds the publisher and starts its loop. Runs off the async runtime because the
/// forwarding sink owns a blocking HTTP client.
fn start_publisher(
    config: &Config,
    sensors: Vec<Sensor>,
    analog: Arc<AnalogCache>,
    simulator: Simulator,
) -> Result<(Worker, StatusBoard)> {
    let sink = HttpForwardingSink::new(&config.forwarder_url, config.sink_timeout)?;
    tracing::info!(endpoint = %sink.endpoint(), "forwarding telemetry");

    let settings = PublisherSettings {
        node_id: config.node_id.clone(),
        max_pending_samples: config.max_pending_samples,
        analog_stale_after: config.analog_stale_after,
    };
    let publisher = TelemetryPublisher::new(
        settings,
        sensors,
        analog,
        Arc::new(SysfsPulseCounter::new(&config.counter_device_dir)),
        Box::new(sink),
    )
    .with_driver(SensorKind::Digital, Arc::new(GpioInputDriver::new(&config.gpio_root)))
    .with_simulator(simulator);

    let status = publisher.status_board();
    let worker = publisher::spawn_publisher(publisher, config.publish_interval)?;
    Ok((worker, status))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing()?;
    let mut signals = ShutdownSignals::install()?;

    let sensors = config::load_sensors(&config.sensors_path)?;
    let profile = config::load_simulation(config.simulation_path.as_deref())?;
    let simulator = Simulator::new(profile, &config.node_id);
    tracing::info!(
        node_id = %config.node_id,
        sensors = sensors.len(),
        simulation = simulator.is_enabled(),
        "node-agent starting"
    );

    let analog_reader: Arc<dyn AnalogReader> = Arc::new(IioAnalogReader::new(&config.iio_device_dir));
    let analog = Arc::new(AnalogCache::from_sensors(
        &sensors,
        config.analog_interval,
        analog_reader,
    )?);
    if !simulator.is_enabled() && !analog.channels().is_empty() {
        analog.start()?;
    }

    let probe = Arc::new(LatencyProbe::new(config.probe.clone()));
    probe.start()?;

    let publisher_config = config.clone();
    let publisher_analog = analog.clone();
    let (publisher_worker, status) = tokio::task::spawn_blocking(move || {
        start_publisher(&publisher_config, sensors, publisher_analog, simulator)
    })
    .await??;

    let app = http::router(http::HttpState {
        node_id: config.node_id.clone(),
        probe: probe.clone(),
        sensors: status,
    });
    let listener = tokio::net::TcpListener::bind(&config.http_bind).await?;
    tracing::info!(bind = %config.http_bind, "node-agent HTTP listening");
    let mut http_handle = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            tracing::error!(error = %err, "status server exited");
        }
    });

    let services = Services {
        liveness: Liveness::from_env()?,
        publisher: publisher_worker,
        analog,
        probe,
    };

    tokio::select! {
        reason = signals.recv() => {
            tracing::info!(?reason, "shutdown signal received");
        }
        _ = &mut http_handle => {}
    }

    http_handle.abort();
    tokio::task::spawn_blocking(move || services.shutdown()).await?;
    tracing::info!("node-agent stopped");

    Ok(())
}
