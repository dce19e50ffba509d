//! Process shutdown: supervisor signals and the ordered stop of every background loop.

use crate::analog_cache::AnalogCache;
use crate::latency::LatencyProbe;
use crate::liveness::Liveness;
use crate::task::Worker;
use std::io;
use std::sync::Arc;
use tokio::signal::unix::{signal, Signal, SignalKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Interrupt,
    Terminate,
}

/// SIGINT and SIGTERM handlers. Both are registered on `install`, so a signal that
/// arrives before `recv` is awaited is still observed.
pub struct ShutdownSignals {
    interrupt: Signal,
    terminate: Signal,
}

impl ShutdownSignals {
    pub fn install() -> io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    pub async fn recv(&mut self) -> ShutdownReason {
        tokio::select! {
            _ = self.interrupt.recv() => ShutdownReason::Interrupt,
            _ = self.terminate.recv() => ShutdownReason::Terminate,
        }
    }
}

/// Background loops owned by the running agent.
pub struct Services {
    pub liveness: Liveness,
    pub publisher: Worker,
    pub analog: Arc<AnalogCache>,
    pub probe: Arc<LatencyProbe>,
}

impl Services {
    /// Sends `STOPPING=1`, then stops and joins every loop. Blocks until all threads exit.
    pub fn shutdown(self) {
        let Services {
            mut liveness,
            mut publisher,
            analog,
            probe,
        } = self;
        liveness.stop();
        publisher.stop();
        analog.stop();
        probe.stop();
        tracing::info!("background loops stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analog_cache::ChannelPair;
    use crate::error::NodeResult;
    use crate::latency::{ProbeConfig, ProbeKind, ProbeTarget};
    use crate::liveness::Notifier;
    use std::os::unix::net::UnixDatagram;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;

    fn recv(socket: &UnixDatagram) -> String {
        let mut buf = [0u8; 64];
        let len = socket.recv(&mut buf).unwrap();
        String::from_utf8_lossy(&buf[..len]).into_owned()
    }

    #[test]
    fn shutdown_notifies_supervisor_and_joins_every_loop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("notify.sock");
        let supervisor = UnixDatagram::bind(&path).unwrap();
        supervisor.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let liveness =
            Liveness::start(Notifier::from_socket(path.to_str()), Some(Duration::from_millis(5))).unwrap();

        let publisher_exited = Arc::new(AtomicBool::new(false));
        let exited = publisher_exited.clone();
        let publisher = Worker::spawn("test-publisher", move |signal| {
            while !signal.wait(Duration::from_millis(5)) {}
            exited.store(true, Ordering::SeqCst);
        })
        .unwrap();

        let analog = Arc::new(
            AnalogCache::new(
                vec![ChannelPair {
                    channel: 0,
                    negative_channel: None,
                }],
                Duration::from_millis(5),
                Arc::new(|_channel: u8, _negative: Option<u8>| -> NodeResult<f64> { Ok(1.0) }),
            )
            .unwrap(),
        );
        analog.start().unwrap();

        let probe = Arc::new(LatencyProbe::with_prober(
            ProbeConfig {
                target: ProbeTarget {
                    kind: ProbeKind::Tcp,
                    host: "127.0.0.1".to_string(),
                    port: Some(1883),
                },
                interval: Duration::from_millis(5),
                timeout: Duration::from_millis(100),
                window_samples: 10,
            },
            Arc::new(|| -> NodeResult<f64> { Ok(1.0) }),
        ));
        probe.start().unwrap();

        Services {
            liveness,
            publisher,
            analog: analog.clone(),
            probe: probe.clone(),
        }
        .shutdown();

        assert!(publisher_exited.load(Ordering::SeqCst));
        assert!(!analog.is_running());
        assert!(!probe.is_running());

        assert_eq!(recv(&supervisor), "READY=1");
        let mut last = recv(&supervisor);
        while last == "WATCHDOG=1" {
            last = recv(&supervisor);
        }
        assert_eq!(last, "STOPPING=1");
    }

    #[tokio::test]
    async fn terminate_signal_is_observed() {
        let mut signals = ShutdownSignals::install().unwrap();
        let status = std::process::Command::new("sh")
            .arg("-c")
            .arg(format!("kill -TERM {}", std::process::id()))
            .status()
            .unwrap();
        assert!(status.success());

        let reason = tokio::time::timeout(Duration::from_secs(5), signals.recv())
            .await
            .unwrap();
        assert_eq!(reason, ShutdownReason::Terminate);
    }
}
