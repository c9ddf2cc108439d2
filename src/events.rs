//! Typed pipeline events
//!
//! Worker threads never call back into the orchestrator. They publish events
//! on a bounded channel which the orchestrator drains from its own loop and
//! forwards to the host. Failure events that find the channel full are parked
//! in an overflow list instead of being dropped.

use std::fmt;
use std::mem;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use flume::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, warn};

/// Event channel capacity
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Pipeline component an event originates from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Component {
    DeviceManager,
    Capture,
    Overlay,
    Recorder,
    Streamer,
    Snapshot,
    Telemetry,
    Orchestrator,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Component::DeviceManager => "device_manager",
            Component::Capture => "capture",
            Component::Overlay => "overlay",
            Component::Recorder => "recorder",
            Component::Streamer => "streamer",
            Component::Snapshot => "snapshot",
            Component::Telemetry => "telemetry",
            Component::Orchestrator => "orchestrator",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    /// Capture heartbeat, at most once per second per camera
    FrameReady { camera: String, sequence: u64 },
    CaptureFailed {
        camera: String,
        unplugged: bool,
        message: String,
    },
    CamerasFound { names: Vec<String> },
    NoCamerasFound,
    ReconnectComplete,
    RecordingStarted { camera: String, session: PathBuf },
    SegmentClosed {
        camera: String,
        path: PathBuf,
        frames: u64,
    },
    RecordingStopped { camera: String },
    RecordingFailed { camera: String, message: String },
    StreamingStarted { camera: String, addr: SocketAddr },
    ClientConnected { camera: String, peer: SocketAddr },
    ClientDisconnected { camera: String, peer: SocketAddr },
    StreamingStopped { camera: String },
    StreamingFailed { camera: String, message: String },
    SnapshotSaved { left: PathBuf, right: PathBuf },
    Warning {
        component: Component,
        message: String,
    },
    Error {
        component: Component,
        message: String,
    },
    /// System-fatal failure, the host should shut down
    Shutdown { reason: String },
}

impl PipelineEvent {
    /// Events the failure policy acts on; these are never dropped
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            PipelineEvent::CaptureFailed { .. }
                | PipelineEvent::RecordingFailed { .. }
                | PipelineEvent::StreamingFailed { .. }
                | PipelineEvent::Shutdown { .. }
        )
    }
}

/// Cloneable publishing side of the event channel
#[derive(Clone)]
pub struct EventSender {
    tx: Sender<PipelineEvent>,
    overflow: Arc<Mutex<Vec<PipelineEvent>>>,
}

/// Create a bounded event channel
pub fn channel(capacity: usize) -> (EventSender, Receiver<PipelineEvent>) {
    let (tx, rx) = flume::bounded(capacity);
    (
        EventSender {
            tx,
            overflow: Arc::new(Mutex::new(Vec::new())),
        },
        rx,
    )
}

impl EventSender {
    /// Publish without blocking. A full channel drops routine events rather
    /// than stalling a worker thread; critical ones go to the overflow list.
    pub fn publish(&self, event: PipelineEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) if event.is_critical() => {
                warn!(?event, "Event channel full, deferring critical event");
                metrics::counter!("chersonesos_events_deferred").increment(1);
                self.overflow.lock().push(event);
            }
            Err(TrySendError::Full(event)) => {
                warn!(?event, "Event channel full, dropping event");
                metrics::counter!("chersonesos_events_dropped").increment(1);
            }
            // No receiver left, the orchestrator is gone
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Critical events that did not fit in the channel, oldest first
    pub fn take_overflow(&self) -> Vec<PipelineEvent> {
        let mut overflow = self.overflow.lock();
        if overflow.is_empty() {
            return Vec::new();
        }
        mem::take(&mut *overflow)
    }

    pub fn error(&self, component: Component, message: impl Into<String>) {
        let message = message.into();
        error!(%component, "{}", message);
        self.publish(PipelineEvent::Error { component, message });
    }

    pub fn warning(&self, component: Component, message: impl Into<String>) {
        let message = message.into();
        warn!(%component, "{}", message);
        self.publish(PipelineEvent::Warning { component, message });
    }
}
