pub mod debayer;
pub mod device;
pub mod frame;
pub mod mock;
pub mod producer;
#[cfg(feature = "v4l2")]
pub mod v4l2;

pub use device::{CameraBackend, CameraDescriptor, CameraHandle, DeviceDescriptor, DeviceManager, Transport};
pub use frame::{Frame, FrameMetadata, PixelFormat, RawImage};
pub use mock::{SimulatedBackend, SimulatedDevice};
pub use producer::{FrameProducer, ProducerState};
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Backend;
