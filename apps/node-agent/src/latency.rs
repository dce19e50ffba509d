use crate::error::{NodeError, NodeResult};
use crate::task::{StopSignal, Worker};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::process::Command;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

const UPTIME_WINDOW_SECONDS: i64 = 60 * 60 * 24;
const LATENCY_WINDOW_SECONDS: i64 = 60 * 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    Tcp,
    Icmp,
}

impl ProbeKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "tcp" => Some(ProbeKind::Tcp),
            "icmp" | "ping" => Some(ProbeKind::Icmp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeTarget {
    pub kind: ProbeKind,
    pub host: String,
    pub port: Option<u16>,
}

impl fmt::Display for ProbeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            ProbeKind::Tcp => "tcp",
            ProbeKind::Icmp => "icmp",
        };
        match self.port {
            Some(port) => write!(f, "{kind}://{}:{port}", self.host),
            None => write!(f, "{kind}://{}", self.host),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub target: ProbeTarget,
    pub interval: Duration,
    pub timeout: Duration,
    pub window_samples: usize,
}

/// One blocking reachability check; returns the round-trip latency in milliseconds.
pub trait Prober: Send + Sync {
    fn probe(&self) -> NodeResult<f64>;
}

impl<F> Prober for F
where
    F: Fn() -> NodeResult<f64> + Send + Sync,
{
    fn probe(&self) -> NodeResult<f64> {
        self()
    }
}

#[derive(Debug, Clone)]
pub struct TcpProber {
    host: String,
    port: u16,
    timeout: Duration,
}

impl TcpProber {
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
        }
    }
}

impl Prober for TcpProber {
    fn probe(&self) -> NodeResult<f64> {
        let label = format!("tcp://{}:{}", self.host, self.port);
        let addrs: Vec<SocketAddr> = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|err| NodeError::driver(label.clone(), err))?
            .collect();
        if addrs.is_empty() {
            return Err(NodeError::driver(label, "host resolved to no addresses"));
        }

        let mut last_err: Option<io::Error> = None;
        for addr in addrs {
            let start = Instant::now();
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => {
                    let _ = stream.shutdown(std::net::Shutdown::Both);
                    return Ok(start.elapsed().as_secs_f64() * 1000.0);
                }
                Err(err) => last_err = Some(err),
            }
        }
        Err(NodeError::driver(
            label,
            last_err.map(|err| err.to_string()).unwrap_or_default(),
        ))
    }
}

#[derive(Debug, Clone)]
pub struct IcmpProber {
    host: String,
    timeout: Duration,
}

impl IcmpProber {
    pub fn new(host: impl Into<String>, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            timeout,
        }
    }
}

impl Prober for IcmpProber {
    fn probe(&self) -> NodeResult<f64> {
        let host = self.host.trim();
        let label = format!("icmp://{host}");
        if host.is_empty() {
            return Err(NodeError::driver(label, "empty host"));
        }

        // macOS `ping -W` takes milliseconds, Linux takes seconds.
        let wait = if cfg!(target_os = "macos") {
            self.timeout.as_millis().max(250).to_string()
        } else {
            self.timeout.as_secs().max(1).to_string()
        };
        let output = Command::new("ping")
            .args(["-n", "-q", "-c", "1", "-W", wait.as_str(), host])
            .output()
            .map_err(|err| NodeError::driver(label.clone(), err))?;

        if !output.status.success() {
            return Err(NodeError::driver(label, format!("ping exited with {}", output.status)));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        parse_ping_output_ms(&stdout)
            .or_else(|| parse_ping_output_ms(&stderr))
            .ok_or_else(|| NodeError::driver(label, "could not parse ping output"))
    }
}

pub fn prober_for(target: &ProbeTarget, timeout: Duration) -> Arc<dyn Prober> {
    match target.kind {
        ProbeKind::Tcp => Arc::new(TcpProber::new(
            target.host.clone(),
            target.port.unwrap_or(1883),
            timeout,
        )),
        ProbeKind::Icmp => Arc::new(IcmpProber::new(target.host.clone(), timeout)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencyOutcome {
    pub timestamp: DateTime<Utc>,
    pub succeeded: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LatencySample {
    pub label: String,
    pub latency_ms: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeSnapshot {
    pub uptime_percent_24h: Option<f64>,
    pub p50_latency_ms_30m: Option<f64>,
    pub jitter_ms: Option<f64>,
    pub last_latency_ms: Option<f64>,
    pub last_sample_at: Option<DateTime<Utc>>,
    pub attempts_24h: usize,
}

/// Outcome and latency history for one probe target.
///
/// Both windows are pruned when a new entry is appended; statistics additionally filter
/// by age at snapshot time, so a window that stopped receiving appends still reports
/// only in-horizon data.
#[derive(Debug)]
pub struct LatencyWindows {
    outcomes: VecDeque<LatencyOutcome>,
    samples: VecDeque<LatencySample>,
    window_samples: usize,
}

impl LatencyWindows {
    pub fn new(window_samples: usize) -> Self {
        Self {
            outcomes: VecDeque::new(),
            samples: VecDeque::new(),
            window_samples: window_samples.max(1),
        }
    }

    pub fn record(&mut self, label: &str, timestamp: DateTime<Utc>, latency_ms: Option<f64>) {
        self.outcomes.push_back(LatencyOutcome {
            timestamp,
            succeeded: latency_ms.is_some(),
        });
        if let Some(latency_ms) = latency_ms {
            self.samples.push_back(LatencySample {
                label: label.to_string(),
                latency_ms,
                timestamp,
            });
        }
        self.evict(timestamp);
    }

    fn evict(&mut self, now: DateTime<Utc>) {
        let uptime_horizon = now - ChronoDuration::seconds(UPTIME_WINDOW_SECONDS);
        while self
            .outcomes
            .front()
            .is_some_and(|outcome| outcome.timestamp < uptime_horizon)
        {
            self.outcomes.pop_front();
        }

        let latency_horizon = now - ChronoDuration::seconds(LATENCY_WINDOW_SECONDS);
        while self
            .samples
            .front()
            .is_some_and(|sample| sample.timestamp < latency_horizon)
        {
            self.samples.pop_front();
        }
        while self.samples.len() > self.window_samples {
            self.samples.pop_front();
        }
    }

    pub fn outcomes(&self) -> impl Iterator<Item = &LatencyOutcome> {
        self.outcomes.iter()
    }

    pub fn samples(&self) -> impl Iterator<Item = &LatencySample> {
        self.samples.iter()
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> ProbeSnapshot {
        let uptime_horizon = now - ChronoDuration::seconds(UPTIME_WINDOW_SECONDS);
        let recent_outcomes: Vec<bool> = self
            .outcomes
            .iter()
            .filter(|outcome| outcome.timestamp >= uptime_horizon)
            .map(|outcome| outcome.succeeded)
            .collect();

        let latency_horizon = now - ChronoDuration::seconds(LATENCY_WINDOW_SECONDS);
        let recent_latencies: Vec<f64> = self
            .samples
            .iter()
            .filter(|sample| sample.timestamp >= latency_horizon)
            .map(|sample| sample.latency_ms)
            .collect();

        let retained: Vec<f64> = self.samples.iter().map(|sample| sample.latency_ms).collect();
        let last = self.samples.back();

        ProbeSnapshot {
            uptime_percent_24h: uptime_percent(&recent_outcomes),
            p50_latency_ms_30m: median(&recent_latencies),
            jitter_ms: jitter_ms(&retained),
            last_latency_ms: last.map(|sample| sample.latency_ms),
            last_sample_at: last.map(|sample| sample.timestamp),
            attempts_24h: recent_outcomes.len(),
        }
    }
}

/// Periodic reachability probe with rolling health statistics.
pub struct LatencyProbe {
    config: ProbeConfig,
    label: String,
    prober: Arc<dyn Prober>,
    windows: Arc<RwLock<LatencyWindows>>,
    worker: Mutex<Option<Worker>>,
}

impl LatencyProbe {
    pub fn new(config: ProbeConfig) -> Self {
        let prober = prober_for(&config.target, config.timeout);
        Self::with_prober(config, prober)
    }

    pub fn with_prober(config: ProbeConfig, prober: Arc<dyn Prober>) -> Self {
        let label = config.target.to_string();
        let windows = LatencyWindows::new(config.window_samples);
        Self {
            config,
            label,
            prober,
            windows: Arc::new(RwLock::new(windows)),
            worker: Mutex::new(None),
        }
    }

    pub fn target(&self) -> &ProbeTarget {
        &self.config.target
    }

    pub fn start(&self) -> NodeResult<()> {
        let mut slot = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(Worker::is_running) {
            return Ok(());
        }
        if let Some(mut finished) = slot.take() {
            finished.stop();
        }

        let prober = self.prober.clone();
        let windows = self.windows.clone();
        let label = self.label.clone();
        let interval = self.config.interval;
        let worker = Worker::spawn("latency-probe", move |signal| {
            run_probe_loop(&label, prober.as_ref(), &windows, interval, &signal)
        })?;
        tracing::info!(probe = %self.label, interval_ms = interval.as_millis() as u64, "latency probe started");
        *slot = Some(worker);
        Ok(())
    }

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

    /// Runs one probe attempt synchronously and records its outcome.
    pub fn probe_once(&self) -> Option<f64> {
        probe_and_record(&self.label, self.prober.as_ref(), &self.windows)
    }

    pub fn snapshot(&self) -> ProbeSnapshot {
        self.snapshot_at(Utc::now())
    }

    pub fn snapshot_at(&self, now: DateTime<Utc>) -> ProbeSnapshot {
        self.windows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot(now)
    }
}

impl Drop for LatencyProbe {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_probe_loop(
    label: &str,
    prober: &dyn Prober,
    windows: &RwLock<LatencyWindows>,
    interval: Duration,
    signal: &StopSignal,
) {
    loop {
        if signal.is_stopped() {
            return;
        }
        probe_and_record(label, prober, windows);
        if signal.wait(interval) {
            return;
        }
    }
}

fn probe_and_record(label: &str, prober: &dyn Prober, windows: &RwLock<LatencyWindows>) -> Option<f64> {
    let latency_ms = match prober.probe() {
        Ok(value) if value.is_finite() && value >= 0.0 => Some(value),
        Ok(value) => {
            tracing::debug!(probe = %label, value, "discarding invalid latency value");
            None
        }
        Err(err) => {
            tracing::debug!(probe = %label, error = %err, "probe failed");
            None
        }
    };
    // Timestamp is taken after the blocking probe so appends stay in time order.
    let now = Utc::now();
    windows
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .record(label, now, latency_ms);
    latency_ms
}

fn parse_ping_output_ms(output: &str) -> Option<f64> {
    if let Some(idx) = output.find("time=") {
        let rest = &output[idx + 5..];
        let raw: String = rest
            .chars()
            .take_while(|ch| ch.is_ascii_digit() || *ch == '.')
            .collect();
        if let Ok(value) = raw.parse::<f64>() {
            if value.is_finite() && value >= 0.0 {
                return Some(value);
            }
        }
    }

    // Quiet mode only prints the summary line: "min/avg/max/mdev = a/b/c/d ms".
    if let Some(idx) = output.find("min/avg/max") {
        let rest = &output[idx..];
        let eq_idx = rest.find('=')?;
        let stats = rest[eq_idx + 1..].trim();
        let parts: Vec<&str> = stats.split('/').collect();
        if parts.len() >= 2 {
            if let Ok(value) = parts[1].trim().parse::<f64>() {
                if value.is_finite() && value >= 0.0 {
                    return Some(value);
                }
            }
        }
    }

    None
}

/// Population standard deviation (divides by the sample count).
pub fn jitter_ms(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    if values.len() < 2 {
        return Some(0.0);
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance = values
        .iter()
        .map(|value| {
            let delta = *value - mean;
            delta * delta
        })
        .sum::<f64>()
        / values.len() as f64;
    Some(variance.max(0.0).sqrt())
}

/// Middle element of the ascending order; for an even count the lower of the two middle
/// elements is returned.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut ordered = values.to_vec();
    ordered.sort_by(|a, b| a.total_cmp(b));
    ordered.get((ordered.len() - 1) / 2).copied()
}

pub fn uptime_percent(outcomes: &[bool]) -> Option<f64> {
    if outcomes.is_empty() {
        return None;
    }
    let successes = outcomes.iter().filter(|ok| **ok).count() as f64;
    Some(successes / outcomes.len() as f64 * 100.0)
}
