//! Telemetry HUD rendering

use image::imageops;
use image::{DynamicImage, Rgba, RgbaImage, RgbImage};
use imageproc::drawing::{
    draw_filled_circle_mut, draw_filled_rect_mut, draw_hollow_circle_mut, draw_hollow_rect_mut,
    draw_line_segment_mut,
};
use imageproc::rect::Rect;

use super::font::{self, text_width};
use super::telemetry::TelemetryPacket;
use super::ControlState;
use crate::capture::Frame;

const SCALE_COLOR: Rgba<u8> = Rgba([255, 255, 255, 160]);
const POINTER_COLOR: Rgba<u8> = Rgba([255, 210, 0, 230]);
const SETPOINT_COLOR: Rgba<u8> = Rgba([0, 200, 255, 220]);
const TEXT_COLOR: Rgba<u8> = Rgba([255, 255, 255, 230]);
const ON_COLOR: Rgba<u8> = Rgba([60, 220, 60, 230]);
const OFF_COLOR: Rgba<u8> = Rgba([120, 120, 120, 160]);
const WARN_COLOR: Rgba<u8> = Rgba([230, 40, 40, 230]);

/// Pitch range covered by the ruler, degrees each side of level
const PITCH_RANGE: f32 = 30.0;
/// Depth covered by the depth scale, meters
const DEPTH_RANGE: f32 = 50.0;

/// Counts full heading turns across the 0/360 wrap
#[derive(Debug, Default, Clone)]
pub struct RevolutionCounter {
    last: Option<f32>,
    turns: i32,
}

impl RevolutionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, heading: f32) -> i32 {
        if let Some(last) = self.last {
            let delta = heading - last;
            if delta > 180.0 {
                self.turns -= 1;
            } else if delta < -180.0 {
                self.turns += 1;
            }
        }
        self.last = Some(heading);
        self.turns
    }

    pub fn turns(&self) -> i32 {
        self.turns
    }
}

/// Geometry shared by both layers for one canvas size
#[derive(Debug, Clone, Copy)]
struct Layout {
    width: u32,
    height: u32,
    cx: f32,
    cy: f32,
    /// Roll arc radius
    radius: f32,
    /// Half height of the pitch and depth rulers
    ruler: f32,
    pitch_x: f32,
    depth_x: f32,
    text_scale: u32,
}

impl Layout {
    fn new(width: u32, height: u32) -> Self {
        let (w, h) = (width as f32, height as f32);
        Self {
            width,
            height,
            cx: w / 2.0,
            cy: h / 2.0,
            radius: w.min(h) * 0.4,
            ruler: h * 0.3,
            pitch_x: w * 0.1,
            depth_x: w * 0.9,
            text_scale: if height >= 480 { 2 } else { 1 },
        }
    }

    fn pitch_y(&self, pitch: f32) -> f32 {
        self.cy - pitch.clamp(-PITCH_RANGE, PITCH_RANGE) / PITCH_RANGE * self.ruler
    }

    fn depth_y(&self, depth: f32) -> f32 {
        self.cy - self.ruler + depth.clamp(0.0, DEPTH_RANGE) / DEPTH_RANGE * 2.0 * self.ruler
    }

    /// Point on the roll arc, 0 degrees straight up
    fn arc_point(&self, degrees: f32, radius: f32) -> (f32, f32) {
        let rad = degrees.to_radians();
        (self.cx + radius * rad.sin(), self.cy - radius * rad.cos())
    }

    fn line_height(&self) -> i32 {
        ((font::GLYPH_HEIGHT + 3) * self.text_scale) as i32
    }
}

/// Renders the HUD as a cached static layer (scales, axes, labels) plus a
/// dynamic layer redrawn on every tick.
#[derive(Default)]
pub struct HudCompositor {
    static_layer: Option<RgbaImage>,
    revolutions: RevolutionCounter,
    static_renders: u64,
}

impl HudCompositor {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times the static layer has been rebuilt
    pub fn static_renders(&self) -> u64 {
        self.static_renders
    }

    pub fn revolutions(&self) -> i32 {
        self.revolutions.turns()
    }

    /// Static layer for a canvas size, rebuilt only when the size changes
    pub fn static_layer(&mut self, width: u32, height: u32) -> &RgbaImage {
        let stale = self
            .static_layer
            .as_ref()
            .map_or(true, |layer| layer.dimensions() != (width, height));
        if stale {
            self.static_renders += 1;
            self.static_layer = Some(render_static(Layout::new(width, height)));
        }
        self.static_layer.get_or_insert_with(|| RgbaImage::new(width, height))
    }

    /// Full HUD layer: the static layer with the dynamic elements drawn on top
    pub fn render(&mut self, width: u32, height: u32, telemetry: &TelemetryPacket, control: &ControlState) -> RgbaImage {
        let turns = self.revolutions.update(telemetry.yaw);
        let mut layer = self.static_layer(width, height).clone();
        render_dynamic(&mut layer, Layout::new(width, height), telemetry, control, turns);
        layer
    }

    /// Alpha-blend the HUD onto a copy of `frame`. The source frame is untouched.
    pub fn compose_onto(&mut self, frame: &Frame, telemetry: &TelemetryPacket, control: &ControlState) -> Frame {
        let (width, height) = frame.dimensions();
        let layer = self.render(width, height, telemetry, control);
        frame.with_image(blend(&frame.image, &layer))
    }
}

/// Source-over blend of an RGBA layer onto a copy of an RGB image
pub fn blend(base: &RgbImage, layer: &RgbaImage) -> RgbImage {
    let mut canvas = DynamicImage::ImageRgb8(base.clone()).into_rgba8();
    imageops::overlay(&mut canvas, layer, 0, 0);
    DynamicImage::ImageRgba8(canvas).into_rgb8()
}

fn line(canvas: &mut RgbaImage, from: (f32, f32), to: (f32, f32), color: Rgba<u8>) {
    draw_line_segment_mut(canvas, from, to, color);
}

fn rect(x: f32, y: f32, w: f32, h: f32) -> Rect {
    Rect::at(x as i32, y as i32).of_size((w as u32).max(1), (h as u32).max(1))
}

fn text(canvas: &mut RgbaImage, layout: &Layout, s: &str, x: f32, y: f32, color: Rgba<u8>) {
    font::draw_text(canvas, s, x as i32, y as i32, layout.text_scale, color);
}

fn render_static(layout: Layout) -> RgbaImage {
    let mut canvas = RgbaImage::new(layout.width, layout.height);
    let Layout { cx, cy, radius, ruler, .. } = layout;

    // boresight
    let arm = radius * 0.15;
    line(&mut canvas, (cx - arm, cy), (cx - arm / 3.0, cy), SCALE_COLOR);
    line(&mut canvas, (cx + arm / 3.0, cy), (cx + arm, cy), SCALE_COLOR);
    line(&mut canvas, (cx, cy - arm / 3.0), (cx, cy + arm / 3.0), SCALE_COLOR);

    // roll arc ticks
    for step in -4..=4 {
        let deg = step as f32 * 15.0;
        let len = if step % 2 == 0 { 0.08 } else { 0.04 };
        let outer = layout.arc_point(deg, radius);
        let inner = layout.arc_point(deg, radius * (1.0 - len));
        line(&mut canvas, inner, outer, SCALE_COLOR);
    }

    // pitch ruler
    let px = layout.pitch_x;
    line(&mut canvas, (px, cy - ruler), (px, cy + ruler), SCALE_COLOR);
    for step in -3i32..=3 {
        let deg = step as f32 * 10.0;
        let y = layout.pitch_y(deg);
        let len = if step == 0 { 12.0 } else { 6.0 };
        line(&mut canvas, (px - len, y), (px, y), SCALE_COLOR);
        if step % 3 == 0 {
            text(&mut canvas, &layout, &format!("{}", deg as i32), px + 4.0, y - 3.0, SCALE_COLOR);
        }
    }

    // depth scale
    let dx = layout.depth_x;
    line(&mut canvas, (dx, cy - ruler), (dx, cy + ruler), SCALE_COLOR);
    for step in 0..=5 {
        let meters = step as f32 * DEPTH_RANGE / 5.0;
        let y = layout.depth_y(meters);
        line(&mut canvas, (dx, y), (dx + 6.0, y), SCALE_COLOR);
        let label = format!("{}", meters as i32);
        let w = text_width(&label, layout.text_scale) as f32;
        text(&mut canvas, &layout, &label, dx - w - 4.0, y - 3.0, SCALE_COLOR);
    }

    let lh = layout.line_height() as f32;
    text(&mut canvas, &layout, "PITCH", px - 8.0, cy - ruler - lh, SCALE_COLOR);
    text(&mut canvas, &layout, "DEPTH", dx - 24.0, cy - ruler - lh, SCALE_COLOR);
    canvas
}

fn render_dynamic(
    canvas: &mut RgbaImage,
    layout: Layout,
    telemetry: &TelemetryPacket,
    control: &ControlState,
    turns: i32,
) {
    let Layout { cx, cy, radius, width, height, .. } = layout;
    let (w, h) = (width as f32, height as f32);
    let lh = layout.line_height() as f32;

    // roll pointer and setpoint on the arc
    let tip = layout.arc_point(telemetry.roll, radius * 0.9);
    line(canvas, (cx, cy), tip, POINTER_COLOR);
    draw_filled_circle_mut(canvas, (tip.0 as i32, tip.1 as i32), 3, POINTER_COLOR);
    let sp = layout.arc_point(telemetry.roll_setpoint, radius);
    draw_hollow_circle_mut(canvas, (sp.0 as i32, sp.1 as i32), 4, SETPOINT_COLOR);

    // pitch pointer and setpoint on the ruler
    let px = layout.pitch_x;
    let py = layout.pitch_y(telemetry.pitch);
    draw_filled_rect_mut(canvas, rect(px + 2.0, py - 2.0, 10.0, 5.0), POINTER_COLOR);
    let spy = layout.pitch_y(telemetry.pitch_setpoint);
    draw_hollow_rect_mut(canvas, rect(px - 14.0, spy - 3.0, 10.0, 7.0), SETPOINT_COLOR);

    // depth marker
    let dy = layout.depth_y(telemetry.depth);
    let dx = layout.depth_x;
    line(canvas, (dx - 10.0, dy), (dx + 10.0, dy), POINTER_COLOR);

    // readouts along the top
    let heading = telemetry.yaw.rem_euclid(360.0);
    let top = format!("YAW {:03.0}  REV {:+}", heading, turns);
    let tw = text_width(&top, layout.text_scale) as f32;
    text(canvas, &layout, &top, cx - tw / 2.0, 4.0, TEXT_COLOR);
    let attitude = format!("R {:+.1} P {:+.1}", telemetry.roll, telemetry.pitch);
    let aw = text_width(&attitude, layout.text_scale) as f32;
    text(canvas, &layout, &attitude, cx - aw / 2.0, 4.0 + lh, TEXT_COLOR);
    text(canvas, &layout, &format!("D {:.1}M", telemetry.depth), dx - 40.0, layout.depth_y(DEPTH_RANGE) + 6.0, TEXT_COLOR);
    // measured camera angle, then the commanded tilt
    let camera = format!("CAM {:+.0} SET {:+.0}", telemetry.camera_angle, control.camera_tilt);
    text(canvas, &layout, &camera, 4.0, 4.0, TEXT_COLOR);

    // battery gauge, bottom left
    let gauge_w = (w * 0.15).max(20.0);
    let gauge_h = lh.max(8.0);
    let gy = h - gauge_h - 4.0;
    let charge = telemetry.battery_charge.clamp(0.0, 100.0);
    draw_hollow_rect_mut(canvas, rect(4.0, gy, gauge_w, gauge_h), SCALE_COLOR);
    if charge > 0.0 {
        let fill = if charge < 20.0 { WARN_COLOR } else { ON_COLOR };
        draw_filled_rect_mut(canvas, rect(5.0, gy + 1.0, (gauge_w - 2.0) * charge / 100.0, gauge_h - 2.0), fill);
    }
    text(
        canvas,
        &layout,
        &format!("{:.1}V {:.0}%", telemetry.battery_voltage, charge),
        gauge_w + 10.0,
        gy,
        TEXT_COLOR,
    );

    // stabilization and lights indicators, bottom center
    let indicators = [
        ("R", control.stabilize_roll),
        ("P", control.stabilize_pitch),
        ("Y", control.stabilize_yaw),
        ("D", control.stabilize_depth),
        ("L", control.lights),
    ];
    let step = (font::ADVANCE * 2 * layout.text_scale) as f32;
    let start = cx - step * indicators.len() as f32 / 2.0;
    for (i, (label, on)) in indicators.iter().enumerate() {
        let color = if *on { ON_COLOR } else { OFF_COLOR };
        text(canvas, &layout, label, start + i as f32 * step, h - lh, color);
    }

    // power limit bar, bottom right
    let bar_w = (w * 0.15).max(20.0);
    let bx = w - bar_w - 4.0;
    let power = control.power_limit.clamp(0.0, 100.0);
    draw_hollow_rect_mut(canvas, rect(bx, gy, bar_w, gauge_h), SCALE_COLOR);
    if power > 0.0 {
        draw_filled_rect_mut(canvas, rect(bx + 1.0, gy + 1.0, (bar_w - 2.0) * power / 100.0, gauge_h - 2.0), POINTER_COLOR);
    }
    let label = format!("PWR {:.0}%", power);
    let lw = text_width(&label, layout.text_scale) as f32;
    text(canvas, &layout, &label, bx - lw - 6.0, gy, TEXT_COLOR);
}
