use crate::analog_cache::AnalogCache;
use crate::drivers::{PulseCounter, SensorDriver};
use crate::error::NodeResult;
use crate::pulse::PulseAccumulator;
use crate::sensors::{QualityCode, Sensor, SensorKind};
use crate::simulation::Simulator;
use crate::sink::ForwardingSink;
use crate::task::Worker;
use crate::telemetry::TelemetrySample;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorStatus {
    pub value: f64,
    pub quality: QualityCode,
    pub timestamp: DateTime<Utc>,
}

/// Latest emitted sample per sensor, shared read-only with the status endpoint.
pub type StatusBoard = Arc<RwLock<HashMap<String, SensorStatus>>>;

#[derive(Debug, Clone)]
pub struct PublisherSettings {
    pub node_id: String,
    pub max_pending_samples: usize,
    pub analog_stale_after: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    pub cycle: u64,
    /// Samples measured during this cycle.
    pub samples: Vec<TelemetrySample>,
    /// Samples handed to the sink, including ones carried over from failed cycles.
    pub sent: usize,
    pub accepted: Option<usize>,
    /// Samples held for the next cycle after this one finished.
    pub pending: usize,
    /// Oldest pending samples discarded to respect the pending cap.
    pub dropped: usize,
    pub offline: bool,
}

#[derive(Debug)]
struct RollingMean {
    window: ChronoDuration,
    values: VecDeque<(DateTime<Utc>, f64)>,
}

impl RollingMean {
    fn new(window: Duration) -> Self {
        Self {
            window: ChronoDuration::from_std(window).unwrap_or_else(|_| ChronoDuration::zero()),
            values: VecDeque::new(),
        }
    }

    fn push(&mut self, timestamp: DateTime<Utc>, value: f64) -> f64 {
        self.values.push_back((timestamp, value));
        let window_start = timestamp - self.window;
        while self
            .values
            .front()
            .is_some_and(|(ts, _)| *ts <= window_start)
        {
            self.values.pop_front();
        }
        if self.values.is_empty() {
            return value;
        }
        self.values.iter().map(|(_, v)| *v).sum::<f64>() / self.values.len() as f64
    }
}

pub struct TelemetryPublisher {
    settings: PublisherSettings,
    sensors: Arc<[Sensor]>,
    analog: Arc<AnalogCache>,
    pulse_counter: Arc<dyn PulseCounter>,
    drivers: HashMap<SensorKind, Arc<dyn SensorDriver>>,
    sink: Box<dyn ForwardingSink>,
    simulator: Option<Simulator>,
    pulses: PulseAccumulator,
    rolling: HashMap<String, RollingMean>,
    next_due: HashMap<String, DateTime<Utc>>,
    pending: VecDeque<TelemetrySample>,
    status: StatusBoard,
    cycle: u64,
    started_at: DateTime<Utc>,
}

impl TelemetryPublisher {
    pub fn new(
        settings: PublisherSettings,
        sensors: Vec<Sensor>,
        analog: Arc<AnalogCache>,
        pulse_counter: Arc<dyn PulseCounter>,
        sink: Box<dyn ForwardingSink>,
    ) -> Self {
        Self {
            settings,
            sensors: sensors.into(),
            analog,
            pulse_counter,
            drivers: HashMap::new(),
            sink,
            simulator: None,
            pulses: PulseAccumulator::default(),
            rolling: HashMap::new(),
            next_due: HashMap::new(),
            pending: VecDeque::new(),
            status: Arc::new(RwLock::new(HashMap::new())),
            cycle: 0,
            started_at: Utc::now(),
        }
    }

    pub fn with_driver(mut self, kind: SensorKind, driver: Arc<dyn SensorDriver>) -> Self {
        self.drivers.insert(kind, driver);
        self
    }

    pub fn with_simulator(mut self, simulator: Simulator) -> Self {
        if simulator.is_enabled() {
            tracing::info!(seed = simulator.seed(), "simulation profile active");
        }
        self.simulator = Some(simulator);
        self
    }

    pub fn with_pulse_baselines(mut self, baselines: HashMap<String, u64>) -> Self {
        self.pulses = PulseAccumulator::new(baselines);
        self
    }

    pub fn status_board(&self) -> StatusBoard {
        self.status.clone()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn tick(&mut self) -> BatchResult {
        self.tick_at(Utc::now())
    }

    /// Runs one publish cycle as of `now`: measures every due sensor, then hands the
    /// accumulated batch to the sink. Sink failures keep the batch for the next cycle.
    pub fn tick_at(&mut self, now: DateTime<Utc>) -> BatchResult {
        let cycle = self.cycle;
        self.cycle = self.cycle.saturating_add(1);

        let sensors = self.sensors.clone();
        let mut samples = Vec::new();
        for sensor in sensors.iter() {
            if self
                .next_due
                .get(sensor.id())
                .is_some_and(|due| now < *due)
            {
                continue;
            }
            let Some((value, quality)) = self.measure(sensor, now) else {
                continue;
            };
            let interval =
                ChronoDuration::from_std(sensor.interval()).unwrap_or_else(|_| ChronoDuration::zero());
            self.next_due.insert(sensor.id().to_string(), now + interval);

            samples.push(TelemetrySample {
                sensor_id: sensor.id().to_string(),
                value,
                quality,
                unit: sensor.config.unit.clone(),
                timestamp: now,
            });
        }

        self.update_status(&samples);
        self.pending.extend(samples.iter().cloned());
        let dropped = self.enforce_pending_cap();

        let offline = self
            .simulator
            .as_ref()
            .is_some_and(|sim| sim.is_enabled() && sim.is_offline(cycle));

        let mut result = BatchResult {
            cycle,
            samples,
            dropped,
            offline,
            ..BatchResult::default()
        };

        if offline {
            tracing::info!(cycle, pending = self.pending.len(), "simulated offline cycle; holding batch");
        } else if !self.pending.is_empty() {
            result.sent = self.pending.len();
            match self.sink.forward(self.pending.make_contiguous()) {
                Ok(accepted) => {
                    if accepted < result.sent {
                        tracing::debug!(sent = result.sent, accepted, "forwarder accepted part of batch");
                    }
                    result.accepted = Some(accepted);
                    self.pending.clear();
                }
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        pending = self.pending.len(),
                        "telemetry forward failed; batch kept for next cycle"
                    );
                }
            }
        }

        result.pending = self.pending.len();
        result
    }

    fn measure(&mut self, sensor: &Sensor, now: DateTime<Utc>) -> Option<(f64, QualityCode)> {
        if let Some(simulator) = self.simulator.as_mut().filter(|sim| sim.is_enabled()) {
            let elapsed = (now - self.started_at).to_std().unwrap_or_default();
            let raw = simulator.reading(sensor, elapsed);
            return Some(match sensor.kind {
                SensorKind::Pulse => (raw, QualityCode::Ok),
                _ => sensor.scale_reading(raw),
            });
        }

        match sensor.kind {
            SensorKind::Analog => self.measure_analog(sensor, now),
            SensorKind::Pulse => {
                let counter = self.pulse_counter.clone();
                let channel = sensor.config.channel;
                Some(self.pulses.measure(sensor, || counter.read_count(channel)))
            }
            kind => {
                let Some(driver) = self.drivers.get(&kind) else {
                    tracing::warn!(sensor_id = %sensor.id(), kind = %kind, "no driver registered for sensor kind");
                    return Some((0.0, QualityCode::Error));
                };
                match driver.measure(sensor) {
                    Ok(raw) => Some(sensor.scale_reading(raw)),
                    Err(err) => {
                        tracing::warn!(sensor_id = %sensor.id(), error = %err, "sensor read failed");
                        Some((0.0, QualityCode::Error))
                    }
                }
            }
        }
    }

    fn measure_analog(&mut self, sensor: &Sensor, now: DateTime<Utc>) -> Option<(f64, QualityCode)> {
        let reading = match self.analog.read(sensor.config.channel) {
            Ok(Some(reading)) => reading,
            Ok(None) if self.analog.completed_passes() == 0 => {
                tracing::debug!(sensor_id = %sensor.id(), "analog channel not sampled yet");
                return None;
            }
            Ok(None) => {
                tracing::warn!(
                    sensor_id = %sensor.id(),
                    channel = sensor.config.channel,
                    "analog channel has never produced a reading"
                );
                return Some((0.0, QualityCode::Error));
            }
            Err(err) => {
                tracing::warn!(sensor_id = %sensor.id(), error = %err, "analog cache lookup failed");
                return Some((0.0, QualityCode::Error));
            }
        };

        let (mut value, mut quality) = sensor.scale_reading(reading.value);
        if quality.is_ok() {
            if let Some(window) = sensor.rolling_window() {
                value = self
                    .rolling
                    .entry(sensor.id().to_string())
                    .or_insert_with(|| RollingMean::new(window))
                    .push(now, value);
            }
            let stale_after = ChronoDuration::from_std(self.settings.analog_stale_after)
                .unwrap_or_else(|_| ChronoDuration::zero());
            if now - reading.sampled_at > stale_after {
                quality = QualityCode::Stale;
            }
        }
        Some((value, quality))
    }

    fn update_status(&self, samples: &[TelemetrySample]) {
        if samples.is_empty() {
            return;
        }
        let mut board = self.status.write().unwrap_or_else(PoisonError::into_inner);
        for sample in samples {
            board.insert(
                sample.sensor_id.clone(),
                SensorStatus {
                    value: sample.value,
                    quality: sample.quality,
                    timestamp: sample.timestamp,
                },
            );
        }
    }

    fn enforce_pending_cap(&mut self) -> usize {
        let cap = self.settings.max_pending_samples.max(1);
        let mut dropped = 0;
        while self.pending.len() > cap {
            self.pending.pop_front();
            dropped += 1;
        }
        if dropped > 0 {
            tracing::warn!(dropped, cap, "pending telemetry over cap; dropped oldest samples");
        }
        dropped
    }
}

/// Drives `tick` on its own thread every `interval` until the worker is stopped.
pub fn spawn_publisher(mut publisher: TelemetryPublisher, interval: Duration) -> NodeResult<Worker> {
    let node_id = publisher.settings.node_id.clone();
    Worker::spawn("telemetry-publisher", move |signal| {
        tracing::info!(node_id = %node_id, sensors = publisher.sensors.len(), "telemetry publisher started");
        loop {
            let result = publisher.tick();
            tracing::trace!(
                cycle = result.cycle,
                measured = result.samples.len(),
                sent = result.sent,
                pending = result.pending,
                dropped = result.dropped,
                offline = result.offline,
                "publish cycle complete"
            );
            if signal.wait(interval) {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analog_cache::ChannelPair;
    use crate::drivers::AnalogReader;
    use crate::error::NodeError;
    use crate::sensors::{resolve_sensors, test_sensor, SensorConfig};
    use crate::simulation::SimulationProfile;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Instant;

    type Sent = Arc<Mutex<Vec<Vec<TelemetrySample>>>>;

    fn settings(max_pending_samples: usize) -> PublisherSettings {
        PublisherSettings {
            node_id: "node-test".to_string(),
            max_pending_samples,
            analog_stale_after: Duration::from_secs(5),
        }
    }

    fn recording_sink(fail: Arc<AtomicUsize>) -> (Box<dyn ForwardingSink>, Sent) {
        let sent: Sent = Arc::new(Mutex::new(Vec::new()));
        let record = sent.clone();
        let sink = move |samples: &[TelemetrySample]| -> NodeResult<usize> {
            record.lock().unwrap().push(samples.to_vec());
            if fail.load(Ordering::SeqCst) > 0 {
                fail.fetch_sub(1, Ordering::SeqCst);
                return Err(NodeError::SinkUnavailable("connection refused".to_string()));
            }
            Ok(samples.len())
        };
        (Box::new(sink), sent)
    }

    fn sampled_cache(sensors: &[Sensor], volts: f64) -> Arc<AnalogCache> {
        let reader: Arc<dyn AnalogReader> =
            Arc::new(move |_channel: u8, _negative: Option<u8>| -> NodeResult<f64> { Ok(volts) });
        let cache = Arc::new(AnalogCache::from_sensors(sensors, Duration::from_secs(60), reader).unwrap());
        cache.start().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        for pair in cache.channels().to_vec() {
            while cache.read_voltage(pair.channel).unwrap().is_none() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(2));
            }
        }
        cache
    }

    fn counter_sequence(counts: Vec<NodeResult<u64>>) -> Arc<dyn PulseCounter> {
        let queue = Mutex::new(VecDeque::from(counts));
        Arc::new(move |_channel: u8| -> NodeResult<u64> {
            queue
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(NodeError::driver("counter", "exhausted")))
        })
    }

    fn level_and_flow() -> Vec<Sensor> {
        let mut level = test_sensor("level", "ads1263", 0);
        level.input_min = Some(0.0);
        level.input_max = Some(5.0);
        level.output_min = Some(0.0);
        level.output_max = Some(100.0);
        level.unit = "%".to_string();
        let mut flow: SensorConfig = test_sensor("flow", "flow_meter", 0);
        flow.pulses_per_unit = Some(10.0);
        flow.unit = "L".to_string();
        resolve_sensors(vec![level, flow, test_sensor("gate", "gpio", 17)]).unwrap()
    }

    #[test]
    fn tick_measures_every_kind_and_forwards_one_batch() {
        let sensors = level_and_flow();
        let cache = sampled_cache(&sensors, 2.5);
        let (sink, sent) = recording_sink(Arc::new(AtomicUsize::new(0)));
        let gpio = Arc::new(|_sensor: &Sensor| -> NodeResult<f64> { Ok(1.0) });
        let mut publisher = TelemetryPublisher::new(
            settings(100),
            sensors,
            cache.clone(),
            counter_sequence(vec![Ok(10), Ok(20)]),
            sink,
        )
        .with_driver(SensorKind::Digital, gpio);

        let first = publisher.tick();
        assert_eq!(first.samples.len(), 3);
        assert_eq!(first.accepted, Some(3));
        assert_eq!(first.pending, 0);

        let level = &first.samples[0];
        assert_eq!((level.sensor_id.as_str(), level.unit.as_str()), ("level", "%"));
        assert!((level.value - 50.0).abs() < 1e-9);
        assert_eq!(level.quality, QualityCode::Ok);
        assert_eq!((first.samples[1].value, first.samples[1].quality), (1.0, QualityCode::Ok));
        assert_eq!((first.samples[2].value, first.samples[2].quality), (1.0, QualityCode::Ok));

        let second = publisher.tick();
        assert_eq!((second.samples[1].value, second.samples[1].quality), (1.0, QualityCode::Ok));
        assert_eq!(sent.lock().unwrap().len(), 2);

        let board = publisher.status_board();
        assert_eq!(board.read().unwrap()["flow"].quality, QualityCode::Ok);
        cache.stop();
    }

    #[test]
    fn driver_faults_are_tagged_without_stopping_the_cycle() {
        let sensors = level_and_flow();
        let cache = sampled_cache(&sensors, 6.0);
        let (sink, _sent) = recording_sink(Arc::new(AtomicUsize::new(0)));
        let mut publisher = TelemetryPublisher::new(
            settings(100),
            sensors,
            cache.clone(),
            counter_sequence(vec![Err(NodeError::driver("counter", "bus fault"))]),
            sink,
        );

        let result = publisher.tick();
        let qualities: Vec<QualityCode> = result.samples.iter().map(|s| s.quality).collect();
        assert_eq!(
            qualities,
            vec![QualityCode::OutOfRange, QualityCode::Error, QualityCode::Error]
        );
        assert_eq!(result.samples[1].value, 0.0);
        cache.stop();
    }

    #[test]
    fn unsampled_analog_channels_are_skipped() {
        let sensors = resolve_sensors(vec![test_sensor("soil", "analog", 3)]).unwrap();
        let reader: Arc<dyn AnalogReader> =
            Arc::new(|_channel: u8, _negative: Option<u8>| -> NodeResult<f64> { Ok(1.0) });
        let cache = Arc::new(AnalogCache::from_sensors(&sensors, Duration::from_secs(1), reader).unwrap());
        let (sink, sent) = recording_sink(Arc::new(AtomicUsize::new(0)));
        let mut publisher =
            TelemetryPublisher::new(settings(100), sensors, cache, counter_sequence(vec![]), sink);

        let result = publisher.tick();
        assert!(result.samples.is_empty());
        assert_eq!(result.sent, 0);
        assert!(sent.lock().unwrap().is_empty());
    }

    #[test]
    fn analog_channel_that_never_reads_reports_error() {
        let sensors = resolve_sensors(vec![test_sensor("soil", "analog", 3)]).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let reader: Arc<dyn AnalogReader> =
            Arc::new(move |_channel: u8, _negative: Option<u8>| -> NodeResult<f64> {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(NodeError::driver("adc", "i2c nack"))
            });
        let cache = Arc::new(AnalogCache::from_sensors(&sensors, Duration::from_millis(1), reader).unwrap());
        cache.start().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while cache.completed_passes() < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(calls.load(Ordering::SeqCst) >= 3);

        let (sink, _sent) = recording_sink(Arc::new(AtomicUsize::new(0)));
        let mut publisher =
            TelemetryPublisher::new(settings(100), sensors, cache.clone(), counter_sequence(vec![]), sink);
        let result = publisher.tick();
        assert_eq!(result.samples.len(), 1);
        assert_eq!(result.samples[0].value, 0.0);
        assert_eq!(result.samples[0].quality, QualityCode::Error);
        assert_eq!(
            publisher.status_board().read().unwrap()["soil"].quality,
            QualityCode::Error
        );
        cache.stop();
    }

    #[test]
    fn injected_pulse_baselines_seed_the_first_delta() {
        let mut config = test_sensor("rain", "rain_gauge", 2);
        config.pulses_per_unit = Some(4.0);
        let sensors = resolve_sensors(vec![config]).unwrap();
        let reader: Arc<dyn AnalogReader> =
            Arc::new(|_channel: u8, _negative: Option<u8>| -> NodeResult<f64> { Ok(0.0) });
        let cache = Arc::new(AnalogCache::from_sensors(&sensors, Duration::from_secs(1), reader).unwrap());
        let (sink, _sent) = recording_sink(Arc::new(AtomicUsize::new(0)));
        let mut publisher =
            TelemetryPublisher::new(settings(100), sensors, cache, counter_sequence(vec![Ok(120)]), sink)
                .with_pulse_baselines(HashMap::from([("rain".to_string(), 100)]));

        let result = publisher.tick();
        assert_eq!((result.samples[0].value, result.samples[0].quality), (5.0, QualityCode::Ok));
    }

    #[test]
    fn failed_forward_is_retried_with_next_batch() {
        let sensors = resolve_sensors(vec![test_sensor("soil", "analog", 0)]).unwrap();
        let cache = sampled_cache(&sensors, 1.0);
        let failures = Arc::new(AtomicUsize::new(1));
        let (sink, sent) = recording_sink(failures);
        let mut publisher =
            TelemetryPublisher::new(settings(100), sensors, cache.clone(), counter_sequence(vec![]), sink);

        let first = publisher.tick();
        assert_eq!(first.accepted, None);
        assert_eq!(first.pending, 1);

        let second = publisher.tick();
        assert_eq!(second.sent, 2);
        assert_eq!(second.accepted, Some(2));
        assert_eq!(second.pending, 0);
        assert_eq!(publisher.pending_len(), 0);

        let calls = sent.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].len(), 2);
        cache.stop();
    }

    #[test]
    fn pending_cap_drops_oldest_samples() {
        let sensors = resolve_sensors(vec![
            test_sensor("a", "analog", 0),
            test_sensor("b", "analog", 1),
        ])
        .unwrap();
        let cache = sampled_cache(&sensors, 1.0);
        let (sink, sent) = recording_sink(Arc::new(AtomicUsize::new(usize::MAX)));
        let mut publisher =
            TelemetryPublisher::new(settings(3), sensors, cache.clone(), counter_sequence(vec![]), sink);

        let start = Utc::now();
        publisher.tick_at(start);
        let second = publisher.tick_at(start + ChronoDuration::seconds(1));
        assert_eq!(second.dropped, 1);
        assert_eq!(second.pending, 3);

        let calls = sent.lock().unwrap();
        let last = calls.last().unwrap();
        assert_eq!(last.len(), 3);
        assert_eq!(last[0].sensor_id, "b");
        assert_eq!(last[0].timestamp, start);
        cache.stop();
    }

    #[test]
    fn sensors_are_measured_only_when_due() {
        let mut config = test_sensor("soil", "analog", 0);
        config.interval_seconds = 60.0;
        let sensors = resolve_sensors(vec![config]).unwrap();
        let cache = sampled_cache(&sensors, 1.0);
        let (sink, _sent) = recording_sink(Arc::new(AtomicUsize::new(0)));
        let mut publisher =
            TelemetryPublisher::new(settings(100), sensors, cache.clone(), counter_sequence(vec![]), sink);

        let start = Utc::now();
        assert_eq!(publisher.tick_at(start).samples.len(), 1);
        assert_eq!(publisher.tick_at(start + ChronoDuration::seconds(1)).samples.len(), 0);
        let due = publisher.tick_at(start + ChronoDuration::seconds(60));
        assert_eq!(due.samples.len(), 1);
        // Stale relative to the cache, since the sampler only ran once.
        assert_eq!(due.samples[0].quality, QualityCode::Stale);
        cache.stop();
    }

    #[test]
    fn rolling_average_smooths_analog_values() {
        let mut rolling = RollingMean::new(Duration::from_secs(30));
        let start = Utc::now();
        assert_eq!(rolling.push(start, 10.0), 10.0);
        assert_eq!(rolling.push(start + ChronoDuration::seconds(10), 20.0), 15.0);
        assert_eq!(rolling.push(start + ChronoDuration::seconds(35), 30.0), 25.0);
    }

    #[test]
    fn simulation_replaces_hardware_reads_deterministically() {
        let sensors = level_and_flow();
        let hardware_reads = Arc::new(AtomicU64::new(0));
        let reads = hardware_reads.clone();
        let reader: Arc<dyn AnalogReader> =
            Arc::new(move |_channel: u8, _negative: Option<u8>| -> NodeResult<f64> {
                reads.fetch_add(1, Ordering::SeqCst);
                Ok(0.0)
            });
        let cache = Arc::new(AnalogCache::from_sensors(&sensors, Duration::from_secs(1), reader).unwrap());
        let profile = SimulationProfile {
            enabled: true,
            jitter: 0.1,
            ..SimulationProfile::default()
        };

        let run = |cache: Arc<AnalogCache>| {
            let (sink, _sent) = recording_sink(Arc::new(AtomicUsize::new(0)));
            let mut publisher = TelemetryPublisher::new(
                settings(100),
                sensors.clone(),
                cache,
                counter_sequence(vec![]),
                sink,
            )
            .with_simulator(Simulator::new(profile.clone(), "node-test"));
            publisher.started_at = DateTime::<Utc>::UNIX_EPOCH;
            let at = DateTime::<Utc>::UNIX_EPOCH + ChronoDuration::seconds(120);
            publisher
                .tick_at(at)
                .samples
                .into_iter()
                .map(|sample| (sample.sensor_id, sample.value, sample.quality))
                .collect::<Vec<_>>()
        };

        let first = run(cache.clone());
        let second = run(cache);
        assert_eq!(first.len(), 3);
        assert_eq!(first, second);
        assert_eq!(hardware_reads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn offline_cycles_hold_batches_until_back_online() {
        let sensors = resolve_sensors(vec![test_sensor("gate", "gpio", 4)]).unwrap();
        let reader: Arc<dyn AnalogReader> =
            Arc::new(|_channel: u8, _negative: Option<u8>| -> NodeResult<f64> { Ok(0.0) });
        let cache = Arc::new(AnalogCache::from_sensors(&sensors, Duration::from_secs(1), reader).unwrap());
        let (sink, sent) = recording_sink(Arc::new(AtomicUsize::new(0)));
        let profile = SimulationProfile {
            enabled: true,
            offline_every_cycles: 3,
            offline_cycles: 2,
            ..SimulationProfile::default()
        };
        let mut publisher =
            TelemetryPublisher::new(settings(100), sensors, cache, counter_sequence(vec![]), sink)
                .with_simulator(Simulator::new(profile, "node-test"));

        let start = Utc::now();
        let results: Vec<BatchResult> = (0..3)
            .map(|i| publisher.tick_at(start + ChronoDuration::seconds(i)))
            .collect();
        assert!(!results[0].offline);
        assert!(results[1].offline && results[2].offline);
        assert_eq!(results[2].pending, 2);
        assert_eq!(sent.lock().unwrap().len(), 1);

        let back = publisher.tick_at(start + ChronoDuration::seconds(3));
        assert!(!back.offline);
        assert_eq!(back.sent, 3);
        assert_eq!(back.pending, 0);
    }

    #[test]
    fn missing_driver_reports_error_quality() {
        let sensors = resolve_sensors(vec![test_sensor("door", "contact", 9)]).unwrap();
        let reader: Arc<dyn AnalogReader> =
            Arc::new(|_channel: u8, _negative: Option<u8>| -> NodeResult<f64> { Ok(0.0) });
        let cache = Arc::new(AnalogCache::new(Vec::<ChannelPair>::new(), Duration::from_secs(1), reader).unwrap());
        let (sink, _sent) = recording_sink(Arc::new(AtomicUsize::new(0)));
        let mut publisher =
            TelemetryPublisher::new(settings(100), sensors, cache, counter_sequence(vec![]), sink);
        let result = publisher.tick();
        assert_eq!(result.samples[0].quality, QualityCode::Error);
    }

    #[test]
    fn publisher_loop_stops_cleanly() {
        let sensors = resolve_sensors(vec![test_sensor("gate", "gpio", 4)]).unwrap();
        let reader: Arc<dyn AnalogReader> =
            Arc::new(|_channel: u8, _negative: Option<u8>| -> NodeResult<f64> { Ok(0.0) });
        let cache = Arc::new(AnalogCache::from_sensors(&sensors, Duration::from_secs(1), reader).unwrap());
        let (sink, sent) = recording_sink(Arc::new(AtomicUsize::new(0)));
        let publisher = TelemetryPublisher::new(settings(100), sensors, cache, counter_sequence(vec![]), sink)
            .with_driver(SensorKind::Digital, Arc::new(|_sensor: &Sensor| -> NodeResult<f64> { Ok(1.0) }));

        let mut worker = spawn_publisher(publisher, Duration::from_millis(2)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while sent.lock().unwrap().len() < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        worker.stop();
        let calls = sent.lock().unwrap().len();
        assert!(calls >= 3);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(sent.lock().unwrap().len(), calls);
    }
}
