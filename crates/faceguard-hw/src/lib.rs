//! faceguard-hw: camera streams for the live recognition loop.
//!
//! Defines the `CameraProvider`/`VideoSource` seam the loop talks to and a
//! V4L2 implementation with RGB frame conversion.

pub mod camera;
pub mod frame;

pub use camera::{
    CameraError, CameraProvider, CameraRequest, DeviceInfo, Facing, PixelFormat, V4lCamera,
    V4lCameraProvider, VideoSource,
};
pub use frame::{Frame, FrameError};
