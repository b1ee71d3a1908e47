//! Camera streams: the acquisition seam and a V4L2 implementation.
//!
//! A [`CameraProvider`] turns a [`CameraRequest`] into a live
//! [`VideoSource`]. The V4L2 source captures on its own thread and keeps
//! only the most recent frame, so readers never queue behind the device.

use crate::frame::{self, Frame};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("camera access denied: {0}")]
    PermissionDenied(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("camera stream stopped")]
    Stopped,
}

/// Which way the requested camera should face.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Facing {
    User,
    Environment,
}

/// Constraints for acquiring a camera stream.
#[derive(Debug, Clone)]
pub struct CameraRequest {
    pub ideal_width: u32,
    pub ideal_height: u32,
    pub facing: Facing,
    /// Explicit device; `None` lets the provider choose.
    pub device: Option<String>,
}

impl Default for CameraRequest {
    fn default() -> Self {
        Self {
            ideal_width: 1280,
            ideal_height: 720,
            facing: Facing::User,
            device: None,
        }
    }
}

/// A live video stream.
pub trait VideoSource: Send + Sync {
    /// Negotiated resolution.
    fn dimensions(&self) -> (u32, u32);
    /// True once at least one frame is available and the stream is running.
    fn is_ready(&self) -> bool;
    /// Most recent frame.
    fn current_frame(&self) -> Result<Frame, CameraError>;
    /// Release every underlying track. Idempotent.
    fn stop_tracks(&self);
}

/// Grants camera streams.
pub trait CameraProvider: Send + Sync {
    fn acquire(&self, request: &CameraRequest) -> Result<Arc<dyn VideoSource>, CameraError>;
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    Yuyv,
    /// Motion-JPEG, one JPEG per buffer.
    Mjpeg,
    /// 8-bit grayscale.
    Grey,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        if fourcc == FourCC::new(b"YUYV") {
            Some(Self::Yuyv)
        } else if fourcc == FourCC::new(b"MJPG") {
            Some(Self::Mjpeg)
        } else if fourcc == FourCC::new(b"GREY") {
            Some(Self::Grey)
        } else {
            None
        }
    }

    fn to_rgb(self, buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, frame::FrameError> {
        match self {
            Self::Yuyv => frame::yuyv_to_rgb(buf, width, height),
            Self::Mjpeg => frame::mjpeg_to_rgb(buf, width, height),
            Self::Grey => frame::grey_to_rgb(buf, width, height),
        }
    }
}

/// Opens V4L2 devices. Defaults to `/dev/video0` when the request names none.
#[derive(Debug, Clone)]
pub struct V4lCameraProvider {
    default_device: String,
}

impl V4lCameraProvider {
    pub fn new(default_device: impl Into<String>) -> Self {
        Self {
            default_device: default_device.into(),
        }
    }
}

impl Default for V4lCameraProvider {
    fn default() -> Self {
        Self::new("/dev/video0")
    }
}

impl CameraProvider for V4lCameraProvider {
    fn acquire(&self, request: &CameraRequest) -> Result<Arc<dyn VideoSource>, CameraError> {
        let path = request.device.as_deref().unwrap_or(&self.default_device);
        if request.facing == Facing::Environment {
            tracing::debug!(device = path, "V4L2 exposes no facing mode; using device as given");
        }
        let camera = V4lCamera::open(path, request.ideal_width, request.ideal_height)?;
        Ok(Arc::new(camera))
    }
}

/// V4L2 camera streaming on a dedicated capture thread.
pub struct V4lCamera {
    pub device_path: String,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    latest: Arc<Mutex<Option<Frame>>>,
    stopped: Arc<AtomicBool>,
    capture_thread: Mutex<Option<JoinHandle<()>>>,
}

impl V4lCamera {
    /// Open a device, negotiate the closest format to `ideal_width` ×
    /// `ideal_height` and start streaming.
    pub fn open(device_path: &str, ideal_width: u32, ideal_height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => {
                CameraError::PermissionDenied(format!("{device_path}: {e}"))
            }
            _ if e.to_string().contains("busy") => CameraError::DeviceBusy,
            _ => CameraError::DeviceNotFound(format!("{device_path}: {e}")),
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;
        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.width = ideal_width;
        fmt.height = ideal_height;
        fmt.fourcc = FourCC::new(b"MJPG");

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;
        let pixel_format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {:?} (need MJPG, YUYV or GREY)",
                negotiated.fourcc
            ))
        })?;

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?negotiated.fourcc,
            "negotiated format"
        );

        let (width, height) = (negotiated.width, negotiated.height);
        let latest = Arc::new(Mutex::new(None));
        let stopped = Arc::new(AtomicBool::new(false));

        let thread_latest = Arc::clone(&latest);
        let thread_stopped = Arc::clone(&stopped);
        let thread_device = device_path.to_string();
        let capture_thread = std::thread::Builder::new()
            .name("faceguard-capture".into())
            .spawn(move || {
                capture_loop(device, pixel_format, width, height, &thread_latest, &thread_stopped);
                tracing::info!(device = %thread_device, "capture thread exiting");
            })
            .map_err(|e| CameraError::CaptureFailed(format!("failed to spawn capture thread: {e}")))?;

        Ok(Self {
            device_path: device_path.to_string(),
            width,
            height,
            pixel_format,
            latest,
            stopped,
            capture_thread: Mutex::new(Some(capture_thread)),
        })
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

/// Longest a dequeue may block before the capture thread rechecks for stop.
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(200);

/// A dequeue that timed out only means the device sent nothing in time.
fn is_dequeue_timeout(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
    )
}

fn capture_loop(
    device: Device,
    pixel_format: PixelFormat,
    width: u32,
    height: u32,
    latest: &Mutex<Option<Frame>>,
    stopped: &AtomicBool,
) {
    let mut stream = match MmapStream::with_buffers(&device, BufType::VideoCapture, 4) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!(error = %e, "failed to create mmap stream");
            return;
        }
    };

    stream.set_timeout(DEQUEUE_TIMEOUT);

    while !stopped.load(Ordering::Acquire) {
        let (buf, meta) = match stream.next() {
            Ok(next) => next,
            Err(e) if is_dequeue_timeout(&e) => {
                tracing::trace!("no frame within dequeue timeout");
                continue;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to dequeue buffer; stopping capture");
                break;
            }
        };

        let used = (meta.bytesused as usize).min(buf.len());
        let payload = if used > 0 { &buf[..used] } else { buf };
        match pixel_format.to_rgb(payload, width, height) {
            Ok(rgb) => {
                let frame = Frame {
                    data: rgb,
                    width,
                    height,
                    timestamp: std::time::Instant::now(),
                    sequence: meta.sequence,
                };
                *latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(frame);
            }
            Err(e) => tracing::debug!(seq = meta.sequence, error = %e, "dropping undecodable frame"),
        }
    }
}

impl VideoSource for V4lCamera {
    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn is_ready(&self) -> bool {
        !self.stopped.load(Ordering::Acquire)
            && self
                .latest
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_some()
    }

    fn current_frame(&self) -> Result<Frame, CameraError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(CameraError::Stopped);
        }
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| CameraError::CaptureFailed("no frame captured yet".into()))
    }

    fn stop_tracks(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let handle = self
            .capture_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::warn!(device = %self.device_path, "capture thread panicked");
            }
        }
        tracing::info!(device = %self.device_path, "camera tracks released");
    }
}

impl Drop for V4lCamera {
    fn drop(&mut self) {
        self.stop_tracks();
    }
}
