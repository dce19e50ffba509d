use crate::error::{NodeError, NodeResult};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Cancellation flag shared between a background loop and its owner.
///
/// `wait` doubles as the loop's sleep: it returns early as soon as `stop` is
/// called, so a stopped loop never sits out a full interval.
#[derive(Debug, Default)]
pub struct StopSignal {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        let mut stopped = self.stopped.lock().unwrap_or_else(PoisonError::into_inner);
        *stopped = true;
        self.cond.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleeps for `timeout` unless stopped first. Returns `true` once stopped.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut stopped = self.stopped.lock().unwrap_or_else(PoisonError::into_inner);
        while !*stopped {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(stopped, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            stopped = guard;
        }
        *stopped
    }
}

/// A named OS thread running one background loop until stopped.
#[derive(Debug)]
pub struct Worker {
    name: String,
    signal: Arc<StopSignal>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn<F>(name: &str, body: F) -> NodeResult<Self>
    where
        F: FnOnce(Arc<StopSignal>) + Send + 'static,
    {
        let signal = Arc::new(StopSignal::new());
        let loop_signal = signal.clone();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(loop_signal))
            .map_err(|source| NodeError::Spawn {
                name: name.to_string(),
                source,
            })?;
        Ok(Self {
            name: name.to_string(),
            signal,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Signals the loop and blocks until its thread has exited. Safe to call repeatedly.
    pub fn stop(&mut self) {
        self.signal.stop();
        let Some(handle) = self.handle.take() else {
            return;
        };
        if handle.join().is_err() {
            tracing::error!(worker = %self.name, "background thread panicked");
        } else {
            tracing::debug!(worker = %self.name, "background thread stopped");
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}
