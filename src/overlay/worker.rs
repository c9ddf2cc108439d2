use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use super::{HudCompositor, HudInputs};
use crate::pipeline::CameraSlots;
use crate::utils::Worker;

/// Composites the HUD onto frames destined for recording.
///
/// While running, the producer feeds `overlay.original`; each tick drains it
/// and pushes the composited frames into `overlay.overlay` for the recorder.
pub struct OverlayWorker {
    camera: String,
    slots: Arc<CameraSlots>,
    composed: Arc<AtomicU64>,
    worker: Option<Worker>,
}

impl OverlayWorker {
    pub fn start(camera: &str, slots: Arc<CameraSlots>, inputs: Arc<HudInputs>, refresh_hz: u32) -> io::Result<Self> {
        let period = Duration::from_secs_f64(1.0 / refresh_hz.max(1) as f64);
        let composed = Arc::new(AtomicU64::new(0));
        slots.set_overlay_active(true);

        let queues = slots.clone();
        let counter = composed.clone();
        let name = camera.to_string();
        let spawned = Worker::spawn(format!("overlay-{camera}"), move |stop| {
            let mut hud = HudCompositor::new();
            while !stop.is_set() {
                let tick = Instant::now();
                while let Some(frame) = queues.overlay.original.pop() {
                    let (telemetry, control) = inputs.snapshot();
                    let started = Instant::now();
                    let out = hud.compose_onto(&frame, &telemetry, &control);
                    metrics::histogram!("chersonesos_overlay_compose_seconds", "camera" => name.clone())
                        .record(started.elapsed().as_secs_f64());
                    if queues.overlay.overlay.push(out).is_some() {
                        debug!(camera = %name, "Overlay queue full, dropped oldest");
                    }
                    counter.fetch_add(1, Ordering::Relaxed);
                }
                stop.sleep(period.saturating_sub(tick.elapsed()));
            }
        });

        match spawned {
            Ok(worker) => {
                info!(camera, refresh_hz, "Overlay compositor started");
                Ok(Self {
                    camera: camera.to_string(),
                    slots,
                    composed,
                    worker: Some(worker),
                })
            }
            Err(e) => {
                slots.set_overlay_active(false);
                Err(e)
            }
        }
    }

    /// Frames composited so far
    pub fn composed(&self) -> u64 {
        self.composed.load(Ordering::Relaxed)
    }

    pub fn stop(&mut self, timeout: Duration) {
        if let Some(mut worker) = self.worker.take() {
            worker.stop(timeout);
            self.slots.set_overlay_active(false);
            info!(camera = %self.camera, "Overlay compositor stopped");
        }
    }
}

impl Drop for OverlayWorker {
    fn drop(&mut self) {
        self.stop(crate::utils::DEFAULT_JOIN_TIMEOUT);
    }
}
