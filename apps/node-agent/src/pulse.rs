use crate::error::NodeResult;
use crate::sensors::{QualityCode, Sensor};
use std::collections::HashMap;

/// Converts monotonic hardware pulse counts into per-read deltas, one baseline per sensor.
#[derive(Debug, Default)]
pub struct PulseAccumulator {
    baselines: HashMap<String, u64>,
}

impl PulseAccumulator {
    /// Seeds the accumulator with known baselines (e.g. carried across a restart).
    pub fn new(baselines: HashMap<String, u64>) -> Self {
        Self { baselines }
    }

    pub fn baseline(&self, sensor_id: &str) -> Option<u64> {
        self.baselines.get(sensor_id).copied()
    }

    pub fn baselines(&self) -> &HashMap<String, u64> {
        &self.baselines
    }

    /// Forgets a sensor's baseline; its next read is measured from zero.
    pub fn reset(&mut self, sensor_id: &str) {
        self.baselines.remove(sensor_id);
    }

    /// Reads the counter once and returns the scaled delta since the previous read.
    ///
    /// A failed read reports `(0.0, Error)` and leaves the baseline untouched. A count
    /// below the baseline means the counter restarted: the baseline is re-synchronized
    /// and the cycle reports a zero delta.
    pub fn measure<F>(&mut self, sensor: &Sensor, raw_count: F) -> (f64, QualityCode)
    where
        F: FnOnce() -> NodeResult<u64>,
    {
        let count = match raw_count() {
            Ok(count) => count,
            Err(err) => {
                tracing::warn!(sensor_id = %sensor.id(), error = %err, "pulse counter read failed");
                return (0.0, QualityCode::Error);
            }
        };

        let baseline = self.baselines.entry(sensor.id().to_string()).or_insert(0);
        let delta = match count.checked_sub(*baseline) {
            Some(delta) => delta,
            None => {
                tracing::debug!(
                    sensor_id = %sensor.id(),
                    baseline = *baseline,
                    count,
                    "pulse counter went backwards; re-baselining"
                );
                0
            }
        };
        *baseline = count;

        (delta as f64 / sensor.pulses_per_unit(), QualityCode::Ok)
    }
}
