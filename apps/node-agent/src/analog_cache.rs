use crate::drivers::AnalogReader;
use crate::error::{NodeError, NodeResult};
use crate::sensors::{Sensor, SensorKind};
use crate::task::{StopSignal, Worker};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelPair {
    pub channel: u8,
    pub negative_channel: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CachedReading {
    pub value: f64,
    pub sampled_at: DateTime<Utc>,
}

/// `None` until the first successful hardware read for that channel.
type CacheMap = HashMap<u8, Option<CachedReading>>;

/// Background sampler that keeps the latest voltage per analog channel.
///
/// Request paths only ever inspect the cache; the blocking hardware read happens on the
/// sampler thread, outside the cache lock.
pub struct AnalogCache {
    channels: Arc<Vec<ChannelPair>>,
    interval: Duration,
    reader: Arc<dyn AnalogReader>,
    cache: Arc<RwLock<CacheMap>>,
    completed_passes: Arc<AtomicU64>,
    worker: Mutex<Option<Worker>>,
}

impl AnalogCache {
    pub fn new(
        channels: Vec<ChannelPair>,
        interval: Duration,
        reader: Arc<dyn AnalogReader>,
    ) -> NodeResult<Self> {
        let mut seen = HashSet::new();
        for pair in &channels {
            if !seen.insert(pair.channel) {
                return Err(NodeError::DuplicateChannel {
                    namespace: "analog",
                    channel: pair.channel,
                });
            }
        }
        let cache = channels.iter().map(|pair| (pair.channel, None)).collect();
        Ok(Self {
            channels: Arc::new(channels),
            interval,
            reader,
            cache: Arc::new(RwLock::new(cache)),
            completed_passes: Arc::new(AtomicU64::new(0)),
            worker: Mutex::new(None),
        })
    }

    pub fn from_sensors(
        sensors: &[Sensor],
        interval: Duration,
        reader: Arc<dyn AnalogReader>,
    ) -> NodeResult<Self> {
        let channels = sensors
            .iter()
            .filter(|sensor| sensor.kind == SensorKind::Analog)
            .map(|sensor| ChannelPair {
                channel: sensor.config.channel,
                negative_channel: sensor.config.negative_channel,
            })
            .collect();
        Self::new(channels, interval, reader)
    }

    pub fn channels(&self) -> &[ChannelPair] {
        &self.channels
    }

    /// Starts the sampling loop. A no-op while a loop is already running.
    pub fn start(&self) -> NodeResult<()> {
        let mut slot = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(Worker::is_running) {
            return Ok(());
        }
        if let Some(mut finished) = slot.take() {
            finished.stop();
        }

        let channels = self.channels.clone();
        let reader = self.reader.clone();
        let cache = self.cache.clone();
        let passes = self.completed_passes.clone();
        let interval = self.interval;
        let worker = Worker::spawn("analog-sampler", move |signal| {
            run_sampler(&channels, reader.as_ref(), &cache, &passes, interval, &signal)
        })?;
        tracing::info!(
            channels = self.channels.len(),
            interval_ms = interval.as_millis() as u64,
            "analog sampler started"
        );
        *slot = Some(worker);
        Ok(())
    }

    /// Stops the loop and waits for the sampler thread to exit; no hardware read
    /// happens after this returns.
    pub fn stop(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut worker) = worker {
            worker.stop();
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(Worker::is_running)
    }

    pub fn read(&self, channel: u8) -> NodeResult<Option<CachedReading>> {
        let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
        cache
            .get(&channel)
            .copied()
            .ok_or(NodeError::ChannelNotConfigured(channel))
    }

    pub fn read_voltage(&self, channel: u8) -> NodeResult<Option<f64>> {
        Ok(self.read(channel)?.map(|reading| reading.value))
    }

    /// Full sampler passes over every channel since construction. A channel that is
    /// still empty after the first pass has never produced a successful read.
    pub fn completed_passes(&self) -> u64 {
        self.completed_passes.load(Ordering::Acquire)
    }
}

impl Drop for AnalogCache {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_sampler(
    channels: &[ChannelPair],
    reader: &dyn AnalogReader,
    cache: &RwLock<CacheMap>,
    passes: &AtomicU64,
    interval: Duration,
    signal: &StopSignal,
) {
    loop {
        for pair in channels {
            if signal.is_stopped() {
                return;
            }
            match reader.read(pair.channel, pair.negative_channel) {
                Ok(value) => {
                    let reading = CachedReading {
                        value,
                        sampled_at: Utc::now(),
                    };
                    cache
                        .write()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(pair.channel, Some(reading));
                }
                Err(err) => {
                    tracing::warn!(
                        channel = pair.channel,
                        negative_channel = ?pair.negative_channel,
                        error = %err,
                        "analog read failed; keeping previous value"
                    );
                }
            }
        }
        passes.fetch_add(1, Ordering::Release);
        if signal.wait(interval) {
            return;
        }
    }
}
