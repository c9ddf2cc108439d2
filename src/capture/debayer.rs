//! Sensor-native to RGB conversion

use image::{Rgb, RgbImage};

use super::frame::{PixelFormat, RawImage};
use crate::error::CaptureError;

/// Convert a raw hardware image to a 3-channel color image
pub fn to_rgb(raw: &RawImage) -> Result<RgbImage, CaptureError> {
    let expected = raw.width as usize * raw.height as usize * raw.format.bytes_per_pixel();
    if raw.data.len() < expected {
        return Err(CaptureError::IncompleteBuffer(format!(
            "{} of {} bytes",
            raw.data.len(),
            expected
        )));
    }

    match raw.format {
        PixelFormat::BayerRg8 => Ok(demosaic_rggb(&raw.data, raw.width, raw.height)),
        PixelFormat::Mono8 => Ok(RgbImage::from_fn(raw.width, raw.height, |x, y| {
            let v = raw.data[(y * raw.width + x) as usize];
            Rgb([v, v, v])
        })),
        PixelFormat::Rgb24 => RgbImage::from_raw(raw.width, raw.height, raw.data[..expected].to_vec())
            .ok_or_else(|| CaptureError::Conversion("rgb buffer size mismatch".into())),
    }
}

/// Demosaic an RGGB pattern: every pixel takes its colors from the 2x2 cell it
/// belongs to (averaging the two greens). Odd trailing rows/columns reuse the
/// last complete cell.
fn demosaic_rggb(data: &[u8], width: u32, height: u32) -> RgbImage {
    let w = width as usize;
    let at = |x: u32, y: u32| data[y as usize * w + x as usize] as u16;
    let last_cell = |v: u32, len: u32| if len < 2 { 0 } else { (v & !1).min((len - 2) & !1) };

    RgbImage::from_fn(width, height, |x, y| {
        if width < 2 || height < 2 {
            let v = at(x, y) as u8;
            return Rgb([v, v, v]);
        }
        let cx = last_cell(x, width);
        let cy = last_cell(y, height);
        let r = at(cx, cy);
        let g = (at(cx + 1, cy) + at(cx, cy + 1)) / 2;
        let b = at(cx + 1, cy + 1);
        Rgb([r as u8, g as u8, b as u8])
    })
}
