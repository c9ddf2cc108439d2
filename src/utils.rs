use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error};

/// Granularity of cooperative sleeps
const STOP_POLL: Duration = Duration::from_millis(10);

/// Default bounded wait when a worker is dropped without an explicit join
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Cooperative cancellation flag shared between a worker and its owner
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Sleep for `duration` in short steps. Returns `true` if a stop was
    /// requested while sleeping.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_set() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep((deadline - now).min(STOP_POLL));
        }
    }
}

/// Named worker thread with a cooperative stop flag and a bounded join.
///
/// Every blocking call inside a worker loop has its own timeout, so the stop
/// flag is always re-checked within a bounded latency. If the join still times
/// out the thread is detached and logged; it is never killed.
pub struct Worker {
    name: String,
    stop: StopFlag,
    handle: Option<JoinHandle<()>>,
    done: flume::Receiver<()>,
}

impl Worker {
    pub fn spawn<F>(name: impl Into<String>, body: F) -> io::Result<Self>
    where
        F: FnOnce(StopFlag) + Send + 'static,
    {
        let name = name.into();
        let stop = StopFlag::new();
        // The sender is dropped when the thread exits (also on unwind),
        // which disconnects `done`.
        let (done_tx, done) = flume::bounded::<()>(1);
        let flag = stop.clone();
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            let _done = done_tx;
            body(flag);
        })?;
        debug!(worker = %name, "Worker started");
        Ok(Self {
            name,
            stop,
            handle: Some(handle),
            done,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn request_stop(&self) {
        self.stop.set();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Request a stop and wait at most `timeout` for the thread to exit.
    /// Returns `false` if the thread had to be detached. Idempotent.
    pub fn stop(&mut self, timeout: Duration) -> bool {
        self.request_stop();
        let Some(handle) = self.handle.take() else {
            return true;
        };

        match self.done.recv_timeout(timeout) {
            Err(flume::RecvTimeoutError::Timeout) => {
                error!(worker = %self.name, ?timeout, "Worker did not stop in time, detaching");
                false
            }
            _ => {
                if handle.join().is_err() {
                    error!(worker = %self.name, "Worker panicked");
                }
                debug!(worker = %self.name, "Worker stopped");
                true
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop(DEFAULT_JOIN_TIMEOUT);
    }
}

/// Fire-and-forget executor for disk writes (stereo snapshots, retention
/// cleanup). Backed by the tokio blocking pool when a runtime is available,
/// otherwise the task runs inline on the caller's thread.
#[derive(Clone, Default)]
pub struct BackgroundPool {
    handle: Option<tokio::runtime::Handle>,
}

impl BackgroundPool {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    /// Use the runtime of the calling context, if any
    pub fn current() -> Self {
        Self {
            handle: tokio::runtime::Handle::try_current().ok(),
        }
    }

    /// Run every task synchronously on the caller's thread
    pub fn inline() -> Self {
        Self { handle: None }
    }

    pub fn spawn<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match &self.handle {
            Some(handle) => {
                handle.spawn_blocking(task);
            }
            None => task(),
        }
    }
}
