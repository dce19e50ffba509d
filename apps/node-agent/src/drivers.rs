//! Hardware read collaborators.
//!
//! Every trait is blanket-implemented for plain closures so callers (and tests) can
//! inject behavior without a wrapper type. The concrete readers talk to the Linux
//! sysfs interfaces exposed by the IIO, counter and GPIO subsystems.

use crate::error::{NodeError, NodeResult};
use crate::sensors::Sensor;
use std::fs;
use std::path::{Path, PathBuf};

/// Blocking analog read of a single-ended or differential input, in volts.
pub trait AnalogReader: Send + Sync {
    fn read(&self, channel: u8, negative_channel: Option<u8>) -> NodeResult<f64>;
}

impl<F> AnalogReader for F
where
    F: Fn(u8, Option<u8>) -> NodeResult<f64> + Send + Sync,
{
    fn read(&self, channel: u8, negative_channel: Option<u8>) -> NodeResult<f64> {
        self(channel, negative_channel)
    }
}

/// Monotonic hardware pulse counter.
pub trait PulseCounter: Send + Sync {
    fn read_count(&self, channel: u8) -> NodeResult<u64>;
}

impl<F> PulseCounter for F
where
    F: Fn(u8) -> NodeResult<u64> + Send + Sync,
{
    fn read_count(&self, channel: u8) -> NodeResult<u64> {
        self(channel)
    }
}

/// Driver for any sensor kind that is neither cached-analog nor pulse.
pub trait SensorDriver: Send + Sync {
    fn measure(&self, sensor: &Sensor) -> NodeResult<f64>;
}

impl<F> SensorDriver for F
where
    F: Fn(&Sensor) -> NodeResult<f64> + Send + Sync,
{
    fn measure(&self, sensor: &Sensor) -> NodeResult<f64> {
        self(sensor)
    }
}

#[derive(Debug, Clone)]
pub struct IioAnalogReader {
    device_dir: PathBuf,
}

impl IioAnalogReader {
    pub fn new(device_dir: impl Into<PathBuf>) -> Self {
        Self {
            device_dir: device_dir.into(),
        }
    }

    fn scale_for(&self, stem: &str) -> NodeResult<f64> {
        for candidate in [format!("{stem}_scale"), "in_voltage_scale".to_string()] {
            let path = self.device_dir.join(candidate);
            if path.exists() {
                return parse_f64(&path);
            }
        }
        Ok(1.0)
    }
}

impl AnalogReader for IioAnalogReader {
    fn read(&self, channel: u8, negative_channel: Option<u8>) -> NodeResult<f64> {
        let stem = match negative_channel {
            Some(negative) => format!("in_voltage{channel}-voltage{negative}"),
            None => format!("in_voltage{channel}"),
        };
        let raw = parse_f64(&self.device_dir.join(format!("{stem}_raw")))?;
        let scale = self.scale_for(&stem)?;
        // IIO reports millivolts once scaled.
        Ok(raw * scale / 1000.0)
    }
}

#[derive(Debug, Clone)]
pub struct SysfsPulseCounter {
    device_dir: PathBuf,
}

impl SysfsPulseCounter {
    pub fn new(device_dir: impl Into<PathBuf>) -> Self {
        Self {
            device_dir: device_dir.into(),
        }
    }
}

impl PulseCounter for SysfsPulseCounter {
    fn read_count(&self, channel: u8) -> NodeResult<u64> {
        let path = self.device_dir.join(format!("count{channel}")).join("count");
        let raw = read_trimmed(&path)?;
        raw.parse::<u64>()
            .map_err(|err| NodeError::driver(path.display().to_string(), err))
    }
}

#[derive(Debug, Clone)]
pub struct GpioInputDriver {
    gpio_root: PathBuf,
}

impl GpioInputDriver {
    pub fn new(gpio_root: impl Into<PathBuf>) -> Self {
        Self {
            gpio_root: gpio_root.into(),
        }
    }
}

impl SensorDriver for GpioInputDriver {
    fn measure(&self, sensor: &Sensor) -> NodeResult<f64> {
        let path = self
            .gpio_root
            .join(format!("gpio{}", sensor.config.channel))
            .join("value");
        match read_trimmed(&path)?.as_str() {
            "0" => Ok(0.0),
            "1" => Ok(1.0),
            other => Err(NodeError::driver(
                path.display().to_string(),
                format!("unexpected gpio value '{other}'"),
            )),
        }
    }
}

fn read_trimmed(path: &Path) -> NodeResult<String> {
    fs::read_to_string(path)
        .map(|raw| raw.trim().to_string())
        .map_err(|err| NodeError::driver(path.display().to_string(), err))
}

fn parse_f64(path: &Path) -> NodeResult<f64> {
    let raw = read_trimmed(path)?;
    raw.parse::<f64>()
        .map_err(|err| NodeError::driver(path.display().to_string(), err))
}
