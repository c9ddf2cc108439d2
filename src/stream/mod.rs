//! Live video out to topside viewers

pub mod mjpeg;

pub use mjpeg::{mjpeg_part, StreamServer, BOUNDARY};
