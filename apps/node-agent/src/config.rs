use crate::latency::{ProbeConfig, ProbeKind, ProbeTarget};
use crate::sensors::{resolve_sensors, Sensor, SensorConfig};
use crate::simulation::SimulationProfile;
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone)]
pub struct Config {
    pub node_id: String,

    pub sensors_path: PathBuf,
    pub simulation_path: Option<PathBuf>,

    pub forwarder_url: Url,
    pub sink_timeout: Duration,
    pub publish_interval: Duration,
    pub max_pending_samples: usize,

    pub analog_interval: Duration,
    pub analog_stale_after: Duration,
    pub iio_device_dir: PathBuf,
    pub counter_device_dir: PathBuf,
    pub gpio_root: PathBuf,

    pub probe: ProbeConfig,

    pub http_bind: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let node_id = env_string("NODE_NODE_ID", Some("pi-node".to_string()))?;

        let sensors_path = PathBuf::from(env_string(
            "NODE_SENSORS_PATH",
            Some("/opt/node-agent/storage/sensors.json".to_string()),
        )?);
        let simulation_path = env_optional("NODE_SIMULATION_PATH").map(PathBuf::from);

        let forwarder_url =
            env_string("NODE_FORWARDER_URL", Some("http://127.0.0.1:9101".to_string()))?;
        let forwarder_url = Url::parse(&forwarder_url).context("invalid NODE_FORWARDER_URL")?;
        if forwarder_url.host_str().is_none() {
            return Err(anyhow!("NODE_FORWARDER_URL missing host"));
        }

        let sink_timeout = Duration::from_millis(env_u64("NODE_SINK_TIMEOUT_MS", Some(2000))?);
        let publish_interval =
            Duration::from_millis(env_u64("NODE_PUBLISH_INTERVAL_MS", Some(1000))?);
        let max_pending_samples = env_u64("NODE_MAX_PENDING_SAMPLES", Some(5000))? as usize;

        let analog_interval =
            Duration::from_millis(env_u64("NODE_ANALOG_INTERVAL_MS", Some(500))?);
        let analog_stale_after =
            Duration::from_millis(env_u64("NODE_ANALOG_STALE_MS", Some(5000))?);
        let iio_device_dir = PathBuf::from(env_string(
            "NODE_IIO_DEVICE_DIR",
            Some("/sys/bus/iio/devices/iio:device0".to_string()),
        )?);
        let counter_device_dir = PathBuf::from(env_string(
            "NODE_COUNTER_DEVICE_DIR",
            Some("/sys/bus/counter/devices/counter0".to_string()),
        )?);
        let gpio_root = PathBuf::from(env_string("NODE_GPIO_ROOT", Some("/sys/class/gpio".to_string()))?);

        let probe_kind = env_string("NODE_PROBE_KIND", Some("tcp".to_string()))?;
        let probe_kind = ProbeKind::parse(&probe_kind)
            .ok_or_else(|| anyhow!("invalid NODE_PROBE_KIND {probe_kind:?} (expected tcp or icmp)"))?;
        let probe_host = env_string("NODE_PROBE_HOST", Some("127.0.0.1".to_string()))?;
        let probe_port = u16::try_from(env_u64("NODE_PROBE_PORT", Some(1883))?)
            .context("invalid NODE_PROBE_PORT")?;
        let probe = ProbeConfig {
            target: ProbeTarget {
                kind: probe_kind,
                host: probe_host,
                port: (probe_kind == ProbeKind::Tcp).then_some(probe_port),
            },
            interval: Duration::from_millis(env_u64("NODE_PROBE_INTERVAL_MS", Some(5000))?),
            timeout: Duration::from_millis(env_u64("NODE_PROBE_TIMEOUT_MS", Some(2000))?),
            window_samples: env_u64("NODE_PROBE_WINDOW_SAMPLES", Some(360))? as usize,
        };

        let http_bind = env_string("NODE_HTTP_BIND", Some("127.0.0.1:9100".to_string()))?;

        Ok(Self {
            node_id,
            sensors_path,
            simulation_path,
            forwarder_url,
            sink_timeout,
            publish_interval,
            max_pending_samples,
            analog_interval,
            analog_stale_after,
            iio_device_dir,
            counter_device_dir,
            gpio_root,
            probe,
            http_bind,
        })
    }
}

#[derive(Debug, Deserialize)]
struct SensorsFile {
    #[serde(default)]
    sensors: Vec<SensorConfig>,
}

/// Loads and validates the sensor list. A missing file means the node has no sensors yet.
pub fn load_sensors(path: &Path) -> Result<Vec<Sensor>> {
    if !path.exists() {
        tracing::warn!(path = %path.display(), "sensor config not found; starting with no sensors");
        return Ok(Vec::new());
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read sensor config {}", path.display()))?;
    parse_sensors(&raw).with_context(|| format!("invalid sensor config {}", path.display()))
}

pub fn parse_sensors(raw: &str) -> Result<Vec<Sensor>> {
    let file: SensorsFile = serde_json::from_str(raw).context("failed to parse sensors json")?;
    Ok(resolve_sensors(file.sensors)?)
}

pub fn load_simulation(path: Option<&Path>) -> Result<SimulationProfile> {
    let Some(path) = path else {
        return Ok(SimulationProfile::default());
    };
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read simulation profile {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("invalid simulation profile {}", path.display()))
}

fn env_string(key: &str, default: Option<String>) -> Result<String> {
    match env::var(key) {
        Ok(value) => Ok(value.trim().to_string()),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_u64(key: &str, default: Option<u64>) -> Result<u64> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid {key}")),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}
