use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{ImageResult, RgbImage};
use serde::{Deserialize, Serialize};

/// Color frame shared between the producer and all consumers
#[derive(Clone)]
pub struct Frame {
    /// Immutable pixel data - cloning a frame never copies pixels
    pub image: Arc<RgbImage>,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Capture timestamp for latency tracking
    pub timestamp: Instant,
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

/// Sensor-native image as delivered by a camera handle
#[derive(Debug, Clone)]
pub struct RawImage {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub device_timestamp: Option<Duration>,
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    /// Single-channel RGGB mosaic
    BayerRg8,
    Mono8,
    Rgb24,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::BayerRg8 | PixelFormat::Mono8 => 1,
            PixelFormat::Rgb24 => 3,
        }
    }
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u64, device_timestamp: Option<Duration>) -> Self {
        let meta = FrameMetadata {
            sequence,
            width: image.width(),
            height: image.height(),
            device_timestamp,
        };
        Self {
            image: Arc::new(image),
            meta: Arc::new(meta),
            timestamp: Instant::now(),
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.meta.width, self.meta.height)
    }

    /// Replace the pixels, keeping sequence and timestamps
    pub fn with_image(&self, image: RgbImage) -> Self {
        let mut meta = (*self.meta).clone();
        meta.width = image.width();
        meta.height = image.height();
        Self {
            image: Arc::new(image),
            meta: Arc::new(meta),
            timestamp: self.timestamp,
        }
    }
}

/// Encode an RGB image as baseline JPEG
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> ImageResult<Bytes> {
    let mut buf = Vec::with_capacity((image.width() * image.height()) as usize / 4);
    JpegEncoder::new_with_quality(&mut buf, quality).encode_image(image)?;
    Ok(Bytes::from(buf))
}

#[cfg(test)]
pub(crate) fn test_frame(sequence: u64, width: u32, height: u32) -> Frame {
    let image = RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x * 16) as u8, (y * 16) as u8, sequence as u8])
    });
    Frame::new(image, sequence, None)
}
