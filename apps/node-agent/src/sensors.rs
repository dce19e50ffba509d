use crate::error::{NodeError, NodeResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

const DEFAULT_INTERVAL_SECONDS: f64 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    Analog,
    Pulse,
    Digital,
}

/// Declared driver names accepted in sensor configs, lowercase.
const KIND_ALIASES: &[(&str, SensorKind)] = &[
    ("analog", SensorKind::Analog),
    ("ads1115", SensorKind::Analog),
    ("ads1263", SensorKind::Analog),
    ("adc", SensorKind::Analog),
    ("voltage", SensorKind::Analog),
    ("pulse", SensorKind::Pulse),
    ("counter", SensorKind::Pulse),
    ("flow", SensorKind::Pulse),
    ("flow_meter", SensorKind::Pulse),
    ("rain_gauge", SensorKind::Pulse),
    ("digital", SensorKind::Digital),
    ("gpio", SensorKind::Digital),
    ("contact", SensorKind::Digital),
    ("switch", SensorKind::Digital),
];

impl SensorKind {
    pub fn resolve(declared: &str) -> NodeResult<Self> {
        let normalized = declared.trim().to_lowercase();
        KIND_ALIASES
            .iter()
            .find(|(alias, _)| *alias == normalized)
            .map(|(_, kind)| *kind)
            .ok_or_else(|| NodeError::UnknownSensorType(declared.trim().to_string()))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SensorKind::Analog => "analog",
            SensorKind::Pulse => "pulse",
            SensorKind::Digital => "digital",
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-sample status. Encoded as `i16` on the wire, the forwarder's quality field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityCode {
    Ok = 0,
    Error = 1,
    Stale = 2,
    OutOfRange = 3,
}

impl QualityCode {
    pub fn as_wire(self) -> i16 {
        self as i16
    }

    pub fn is_ok(self) -> bool {
        self == QualityCode::Ok
    }
}

fn default_interval_seconds() -> f64 {
    DEFAULT_INTERVAL_SECONDS
}

fn default_scale() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    pub sensor_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub sensor_type: String,
    #[serde(default)]
    pub channel: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_channel: Option<u8>,
    #[serde(default)]
    pub unit: String,
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: f64,
    #[serde(default)]
    pub rolling_average_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_max: Option<f64>,
    #[serde(default)]
    pub offset: f64,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pulses_per_unit: Option<f64>,
}

/// A sensor whose declared type has been resolved and whose settings passed validation.
#[derive(Debug, Clone)]
pub struct Sensor {
    pub config: SensorConfig,
    pub kind: SensorKind,
}

impl Sensor {
    pub fn id(&self) -> &str {
        &self.config.sensor_id
    }

    pub fn pulses_per_unit(&self) -> f64 {
        self.config.pulses_per_unit.unwrap_or(1.0)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.config.interval_seconds)
    }

    pub fn rolling_window(&self) -> Option<Duration> {
        (self.config.rolling_average_seconds > 0.0)
            .then(|| Duration::from_secs_f64(self.config.rolling_average_seconds))
    }

    /// Applies the configured input→output range mapping, then `scale` and `offset`.
    ///
    /// A raw value outside `input_min..=input_max` is reported as-is (after scale/offset)
    /// with `OutOfRange` quality rather than extrapolated.
    pub fn scale_reading(&self, raw: f64) -> (f64, QualityCode) {
        let cfg = &self.config;
        let mut quality = QualityCode::Ok;
        let mut value = raw;

        if let (Some(in_min), Some(in_max)) = (cfg.input_min, cfg.input_max) {
            if raw < in_min || raw > in_max {
                quality = QualityCode::OutOfRange;
            } else if let (Some(out_min), Some(out_max)) = (cfg.output_min, cfg.output_max) {
                let fraction = (raw - in_min) / (in_max - in_min);
                value = out_min + fraction * (out_max - out_min);
            }
        }

        (value * cfg.scale + cfg.offset, quality)
    }
}

/// Resolves declared types and validates a full sensor list.
///
/// Channel numbers must be unique within each hardware namespace (analog inputs,
/// pulse counters, digital inputs); a differential analog pair claims both channels.
pub fn resolve_sensors(configs: Vec<SensorConfig>) -> NodeResult<Vec<Sensor>> {
    let mut seen_ids = HashSet::new();
    let mut claimed: HashSet<(SensorKind, u8)> = HashSet::new();
    let mut sensors = Vec::with_capacity(configs.len());

    for mut config in configs {
        config.sensor_id = config.sensor_id.trim().to_string();
        config.name = config.name.trim().to_string();
        config.unit = config.unit.trim().to_string();
        let sensor_id = config.sensor_id.clone();

        if sensor_id.is_empty() {
            return Err(NodeError::invalid_sensor("<unnamed>", "sensor_id is required"));
        }
        if !seen_ids.insert(sensor_id.clone()) {
            return Err(NodeError::invalid_sensor(sensor_id, "duplicate sensor_id"));
        }

        let kind = SensorKind::resolve(&config.sensor_type)?;
        validate_numbers(&config)?;

        if let Some(negative) = config.negative_channel {
            if kind != SensorKind::Analog {
                return Err(NodeError::invalid_sensor(
                    sensor_id,
                    "negative_channel is only supported for analog sensors",
                ));
            }
            if negative == config.channel {
                return Err(NodeError::invalid_sensor(
                    sensor_id,
                    "negative_channel must differ from channel",
                ));
            }
        }

        let mut channels = vec![config.channel];
        channels.extend(config.negative_channel);
        for channel in channels {
            if !claimed.insert((kind, channel)) {
                return Err(NodeError::DuplicateChannel {
                    namespace: kind.as_str(),
                    channel,
                });
            }
        }

        sensors.push(Sensor { config, kind });
    }

    Ok(sensors)
}

fn validate_numbers(config: &SensorConfig) -> NodeResult<()> {
    let invalid = |reason: &str| NodeError::invalid_sensor(config.sensor_id.clone(), reason);

    if !config.interval_seconds.is_finite() || config.interval_seconds < 0.0 {
        return Err(invalid("interval_seconds must be a non-negative number"));
    }
    if !config.rolling_average_seconds.is_finite() || config.rolling_average_seconds < 0.0 {
        return Err(invalid("rolling_average_seconds must be a non-negative number"));
    }
    if !config.scale.is_finite() || !config.offset.is_finite() {
        return Err(invalid("scale and offset must be finite"));
    }
    if let Some(ppu) = config.pulses_per_unit {
        if !ppu.is_finite() || ppu <= 0.0 {
            return Err(invalid("pulses_per_unit must be a positive number"));
        }
    }

    match (config.input_min, config.input_max) {
        (Some(min), Some(max)) if min.is_finite() && max.is_finite() && min < max => {}
        (None, None) => {
            if config.output_min.is_some() || config.output_max.is_some() {
                return Err(invalid("output range requires an input range"));
            }
        }
        _ => return Err(invalid("input_min/input_max must both be set with input_min < input_max")),
    }
    match (config.output_min, config.output_max) {
        (Some(min), Some(max)) if min.is_finite() && max.is_finite() => {}
        (None, None) => {}
        _ => return Err(invalid("output_min/output_max must both be set")),
    }

    Ok(())
}

#[cfg(test)]
pub(crate) fn test_sensor(sensor_id: &str, sensor_type: &str, channel: u8) -> SensorConfig {
    SensorConfig {
        sensor_id: sensor_id.to_string(),
        name: sensor_id.to_string(),
        sensor_type: sensor_type.to_string(),
        channel,
        negative_channel: None,
        unit: "V".to_string(),
        interval_seconds: 0.0,
        rolling_average_seconds: 0.0,
        input_min: None,
        input_max: None,
        output_min: None,
        output_max: None,
        offset: 0.0,
        scale: 1.0,
        pulses_per_unit: None,
    }
}
