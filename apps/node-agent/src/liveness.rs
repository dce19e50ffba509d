//! Supervisor liveness notifications over the `NOTIFY_SOCKET` datagram protocol.
//!
//! Without a supervisor socket in the environment every call is a silent no-op.

use crate::error::NodeResult;
use crate::task::Worker;
use std::io;
use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
enum NotifyTarget {
    Path(PathBuf),
    Abstract(Vec<u8>),
}

#[derive(Debug)]
pub struct Notifier {
    target: Option<NotifyTarget>,
}

impl Notifier {
    pub fn from_env() -> Self {
        Self::from_socket(std::env::var("NOTIFY_SOCKET").ok().as_deref())
    }

    pub fn from_socket(value: Option<&str>) -> Self {
        let target = value
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| match v.strip_prefix('@') {
                Some(name) => NotifyTarget::Abstract(name.as_bytes().to_vec()),
                None => NotifyTarget::Path(PathBuf::from(v)),
            });
        Self { target }
    }

    pub fn is_enabled(&self) -> bool {
        self.target.is_some()
    }

    pub fn notify(&self, state: &str) -> io::Result<()> {
        let Some(target) = &self.target else {
            return Ok(());
        };
        let socket = UnixDatagram::unbound()?;
        match target {
            NotifyTarget::Path(path) => socket.send_to(state.as_bytes(), path)?,
            NotifyTarget::Abstract(name) => send_abstract(&socket, name, state.as_bytes())?,
        };
        Ok(())
    }

    pub fn ready(&self) -> io::Result<()> {
        self.notify("READY=1")
    }

    pub fn watchdog(&self) -> io::Result<()> {
        self.notify("WATCHDOG=1")
    }

    pub fn stopping(&self) -> io::Result<()> {
        self.notify("STOPPING=1")
    }
}

#[cfg(target_os = "linux")]
fn send_abstract(socket: &UnixDatagram, name: &[u8], payload: &[u8]) -> io::Result<usize> {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::SocketAddr;

    let addr = SocketAddr::from_abstract_name(name)?;
    socket.send_to_addr(payload, &addr)
}

#[cfg(not(target_os = "linux"))]
fn send_abstract(_socket: &UnixDatagram, _name: &[u8], _payload: &[u8]) -> io::Result<usize> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "abstract notify sockets require linux",
    ))
}

/// Heartbeat interval: half of the supervisor's `WATCHDOG_USEC`, if one is set.
pub fn watchdog_interval(watchdog_usec: Option<&str>) -> Option<Duration> {
    let usec: u64 = watchdog_usec?.trim().parse().ok()?;
    (usec > 0).then(|| Duration::from_micros(usec / 2))
}

/// Sends `READY=1` on start, `WATCHDOG=1` on a heartbeat thread and `STOPPING=1` on stop.
pub struct Liveness {
    notifier: Arc<Notifier>,
    heartbeat: Option<Worker>,
    stopped: bool,
}

impl Liveness {
    pub fn from_env() -> NodeResult<Self> {
        let interval = watchdog_interval(std::env::var("WATCHDOG_USEC").ok().as_deref());
        Self::start(Notifier::from_env(), interval)
    }

    pub fn start(notifier: Notifier, interval: Option<Duration>) -> NodeResult<Self> {
        let notifier = Arc::new(notifier);
        if !notifier.is_enabled() {
            tracing::debug!("no supervisor notify socket; liveness disabled");
            return Ok(Self {
                notifier,
                heartbeat: None,
                stopped: false,
            });
        }

        if let Err(err) = notifier.ready() {
            tracing::warn!(error = %err, "failed to send ready notification");
        }

        let heartbeat = match interval {
            Some(interval) if !interval.is_zero() => {
                let beat = notifier.clone();
                tracing::info!(interval_ms = interval.as_millis() as u64, "watchdog heartbeat enabled");
                Some(Worker::spawn("liveness-heartbeat", move |signal| {
                    while !signal.wait(interval) {
                        if let Err(err) = beat.watchdog() {
                            tracing::warn!(error = %err, "watchdog notification failed");
                        }
                    }
                })?)
            }
            _ => None,
        };

        Ok(Self {
            notifier,
            heartbeat,
            stopped: false,
        })
    }

    pub fn is_beating(&self) -> bool {
        self.heartbeat.as_ref().is_some_and(Worker::is_running)
    }

    pub fn stop(&mut self) {
        if std::mem::replace(&mut self.stopped, true) {
            return;
        }
        if let Some(mut heartbeat) = self.heartbeat.take() {
            heartbeat.stop();
        }
        if let Err(err) = self.notifier.stopping() {
            tracing::warn!(error = %err, "failed to send stopping notification");
        }
    }
}

impl Drop for Liveness {
    fn drop(&mut self) {
        self.stop();
    }
}
