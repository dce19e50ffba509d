use crate::sensors::{Sensor, SensorKind};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::f64::consts::TAU;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SensorOverride {
    #[serde(default)]
    pub base: Option<f64>,
    #[serde(default)]
    pub amplitude: Option<f64>,
    #[serde(default)]
    pub period_seconds: Option<f64>,
    /// Pins the reading to a constant; jitter and spikes are not applied.
    #[serde(default)]
    pub fixed: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationProfile {
    pub enabled: bool,
    pub seed: Option<u64>,
    pub time_multiplier: f64,
    pub overrides: HashMap<String, SensorOverride>,
    pub spike_probability: f64,
    pub spike_magnitude: f64,
    pub jitter: f64,
    pub stuck_sensors: Vec<String>,
    /// Length of the offline-emulation period in publish cycles (0 disables it).
    pub offline_every_cycles: u64,
    /// Trailing cycles of each period during which the node behaves as offline.
    pub offline_cycles: u64,
}

impl Default for SimulationProfile {
    fn default() -> Self {
        Self {
            enabled: false,
            seed: None,
            time_multiplier: 1.0,
            overrides: HashMap::new(),
            spike_probability: 0.0,
            spike_magnitude: 0.0,
            jitter: 0.0,
            stuck_sensors: Vec::new(),
            offline_every_cycles: 0,
            offline_cycles: 0,
        }
    }
}

/// Deterministic synthetic readings for nodes without (or instead of) real hardware.
///
/// A reading depends only on the seed, the sensor id and the simulated elapsed time, so
/// two simulators built from the same profile and node id produce identical series.
#[derive(Debug)]
pub struct Simulator {
    profile: SimulationProfile,
    seed: u64,
    stuck: HashMap<String, f64>,
}

impl Simulator {
    pub fn new(profile: SimulationProfile, node_id: &str) -> Self {
        let seed = profile.seed.unwrap_or_else(|| hash_to_u64(node_id.as_bytes()));
        Self {
            profile,
            seed,
            stuck: HashMap::new(),
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn is_enabled(&self) -> bool {
        self.profile.enabled
    }

    pub fn is_offline(&self, cycle: u64) -> bool {
        let every = self.profile.offline_every_cycles;
        let offline = self.profile.offline_cycles.min(every);
        every > 0 && offline > 0 && cycle % every >= every - offline
    }

    pub fn reading(&mut self, sensor: &Sensor, elapsed: Duration) -> f64 {
        if let Some(value) = self.stuck.get(sensor.id()) {
            return *value;
        }

        let value = self.generate(sensor, elapsed);
        if self.profile.stuck_sensors.iter().any(|id| id == sensor.id()) {
            self.stuck.insert(sensor.id().to_string(), value);
        }
        value
    }

    fn generate(&self, sensor: &Sensor, elapsed: Duration) -> f64 {
        let overrides = self.profile.overrides.get(sensor.id());
        if let Some(fixed) = overrides.and_then(|o| o.fixed) {
            return fixed;
        }

        let (default_base, default_amplitude, default_period) = match sensor.kind {
            SensorKind::Analog => (2.5, 0.5, 3600.0),
            SensorKind::Pulse => (10.0, 5.0, 1800.0),
            SensorKind::Digital => (0.0, 1.0, 600.0),
        };
        let base = overrides.and_then(|o| o.base).unwrap_or(default_base);
        let amplitude = overrides.and_then(|o| o.amplitude).unwrap_or(default_amplitude);
        let period = overrides
            .and_then(|o| o.period_seconds)
            .filter(|p| *p > 0.0)
            .unwrap_or(default_period);

        let sensor_seed = self.sensor_seed(sensor.id());
        let multiplier = if self.profile.time_multiplier > 0.0 {
            self.profile.time_multiplier
        } else {
            1.0
        };
        let sim_seconds = elapsed.as_secs_f64() * multiplier;
        let phase = (sensor_seed % 1000) as f64 / 1000.0 * TAU;
        let wave = (TAU * sim_seconds / period + phase).sin();

        if sensor.kind == SensorKind::Digital {
            return if wave >= 0.0 { 1.0 } else { 0.0 };
        }

        let mut rng = StdRng::seed_from_u64(sensor_seed ^ (sim_seconds * 1000.0) as u64);
        let mut value = base + amplitude * wave;
        if self.profile.jitter > 0.0 {
            value += rng.gen_range(-self.profile.jitter..=self.profile.jitter);
        }
        if self.profile.spike_probability > 0.0 && rng.gen::<f64>() < self.profile.spike_probability {
            value += self.profile.spike_magnitude;
        }

        if sensor.kind == SensorKind::Pulse {
            value = value.max(0.0);
        }
        value
    }

    fn sensor_seed(&self, sensor_id: &str) -> u64 {
        let mut input = self.seed.to_le_bytes().to_vec();
        input.extend_from_slice(sensor_id.as_bytes());
        hash_to_u64(&input)
    }
}

fn hash_to_u64(bytes: &[u8]) -> u64 {
    let digest = Sha256::digest(bytes);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(head)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::{resolve_sensors, test_sensor};

    fn sensors() -> Vec<Sensor> {
        resolve_sensors(vec![
            test_sensor("soil", "analog", 0),
            test_sensor("rain", "rain_gauge", 1),
            test_sensor("gate", "gpio", 5),
        ])
        .unwrap()
    }

    fn enabled(jitter: f64) -> SimulationProfile {
        SimulationProfile {
            enabled: true,
            jitter,
            ..SimulationProfile::default()
        }
    }

    #[test]
    fn same_profile_and_node_produce_identical_series() {
        let sensors = sensors();
        let mut a = Simulator::new(enabled(0.2), "node-a");
        let mut b = Simulator::new(enabled(0.2), "node-a");
        for step in 0..20 {
            let elapsed = Duration::from_secs(step * 30);
            for sensor in &sensors {
                assert_eq!(a.reading(sensor, elapsed), b.reading(sensor, elapsed));
            }
        }
    }

    #[test]
    fn seed_derives_from_node_identity_unless_pinned() {
        let a = Simulator::new(enabled(0.0), "node-a");
        let b = Simulator::new(enabled(0.0), "node-b");
        assert_ne!(a.seed(), b.seed());

        let pinned = SimulationProfile {
            seed: Some(7),
            ..enabled(0.0)
        };
        assert_eq!(Simulator::new(pinned.clone(), "node-a").seed(), 7);
        assert_eq!(Simulator::new(pinned, "node-b").seed(), 7);
    }

    #[test]
    fn stuck_sensor_repeats_first_value() {
        let sensors = sensors();
        let profile = SimulationProfile {
            stuck_sensors: vec!["soil".to_string()],
            ..enabled(0.5)
        };
        let mut sim = Simulator::new(profile, "node-a");
        let first = sim.reading(&sensors[0], Duration::from_secs(0));
        for step in 1..10 {
            assert_eq!(sim.reading(&sensors[0], Duration::from_secs(step * 97)), first);
        }
    }

    #[test]
    fn overrides_spikes_and_clamping() {
        let sensors = sensors();
        let mut overrides = HashMap::new();
        overrides.insert(
            "soil".to_string(),
            SensorOverride {
                fixed: Some(1.75),
                ..SensorOverride::default()
            },
        );
        overrides.insert(
            "rain".to_string(),
            SensorOverride {
                base: Some(-100.0),
                amplitude: Some(0.0),
                ..SensorOverride::default()
            },
        );
        let profile = SimulationProfile {
            overrides,
            spike_probability: 1.0,
            spike_magnitude: 50.0,
            ..enabled(0.0)
        };
        let mut sim = Simulator::new(profile, "node-a");

        assert_eq!(sim.reading(&sensors[0], Duration::from_secs(10)), 1.75);
        assert_eq!(sim.reading(&sensors[1], Duration::from_secs(10)), 0.0);
        let gate = sim.reading(&sensors[2], Duration::from_secs(10));
        assert!(gate == 0.0 || gate == 1.0);
    }

    #[test]
    fn offline_cycles_fall_at_end_of_each_period() {
        let profile = SimulationProfile {
            offline_every_cycles: 5,
            offline_cycles: 2,
            ..enabled(0.0)
        };
        let sim = Simulator::new(profile, "node-a");
        let pattern: Vec<bool> = (0..10).map(|cycle| sim.is_offline(cycle)).collect();
        assert_eq!(
            pattern,
            vec![false, false, false, true, true, false, false, false, true, true]
        );

        let never = Simulator::new(enabled(0.0), "node-a");
        assert!((0..100).all(|cycle| !never.is_offline(cycle)));
    }

    #[test]
    fn profile_defaults_when_fields_missing() {
        let profile: SimulationProfile = serde_json::from_str(r#"{"enabled": true}"#).unwrap();
        assert!(profile.enabled);
        assert_eq!(profile.time_multiplier, 1.0);
        assert!(profile.overrides.is_empty());
    }
}
