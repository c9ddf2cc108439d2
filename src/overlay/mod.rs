//! Telemetry HUD: packet decoding, rendering and the per-camera compositor worker

pub mod font;
pub mod hud;
pub mod telemetry;
pub mod worker;

use std::sync::Arc;

use arc_swap::ArcSwap;

pub use hud::{HudCompositor, RevolutionCounter};
pub use telemetry::{TelemetryLink, TelemetryPacket, TELEMETRY_PACKET_LEN};
pub use worker::OverlayWorker;

/// Operator-side state shown on the HUD, supplied by the host
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ControlState {
    pub stabilize_roll: bool,
    pub stabilize_pitch: bool,
    pub stabilize_yaw: bool,
    pub stabilize_depth: bool,
    /// Percent of full thrust
    pub power_limit: f32,
    /// Degrees
    pub camera_tilt: f32,
    pub lights: bool,
}

/// Latest telemetry and control snapshots, written by the telemetry link and
/// the host, read by every compositor tick.
#[derive(Default)]
pub struct HudInputs {
    pub telemetry: Arc<ArcSwap<TelemetryPacket>>,
    pub control: ArcSwap<ControlState>,
}

impl HudInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_control(&self, control: ControlState) {
        self.control.store(Arc::new(control));
    }

    pub fn set_telemetry(&self, packet: TelemetryPacket) {
        self.telemetry.store(Arc::new(packet));
    }

    pub fn snapshot(&self) -> (TelemetryPacket, ControlState) {
        (**self.telemetry.load(), **self.control.load())
    }
}
