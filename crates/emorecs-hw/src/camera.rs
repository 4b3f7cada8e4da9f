//! Camera manager over an ordered list of capture backends.
//!
//! The manager owns one device handle at a time, discards warm-up frames
//! after every open, and on a failed read reopens the device exactly once
//! before giving up with [`CameraError::CameraLost`].

use crate::frame::{self, Frame};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, OnceLock};
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::FourCC;

/// Driver-side buffer queue depth. Kept at two so a tick slower than the
/// camera finds at most one stale frame ahead of the newest one.
const STREAM_BUFFERS: u32 = 2;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("camera unavailable: {0}")]
    CameraUnavailable(String),
    #[error("camera lost: {0}")]
    CameraLost(String),
    #[error("device {0} is already in use")]
    DeviceBusy(u32),
    #[error("camera is not open")]
    NotOpen,
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
}

/// Requested capture configuration.
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    /// Device ordinal (`/dev/video{index}` on Linux).
    pub index: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Frames discarded after every successful open.
    pub warmup_frames: usize,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            index: 0,
            width: 640,
            height: 480,
            fps: 30,
            warmup_frames: 5,
        }
    }
}

/// A way of opening the camera. Backends are tried in priority order.
pub trait CaptureBackend {
    fn name(&self) -> &str;
    fn open(&self, settings: &CaptureSettings) -> Result<Box<dyn CaptureDevice>, CameraError>;
}

/// An opened device. Dropping it releases the underlying handle.
pub trait CaptureDevice {
    fn read(&mut self) -> Result<Frame, CameraError>;
}

/// Summary of the device the manager ended up with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraInfo {
    pub backend: String,
    pub index: u32,
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

static CLAIMED_DEVICES: OnceLock<Mutex<HashSet<u32>>> = OnceLock::new();

/// Process-wide exclusive claim on a device ordinal, released on drop.
struct DeviceClaim {
    index: u32,
}

impl DeviceClaim {
    fn acquire(index: u32) -> Result<Self, CameraError> {
        let mut claimed = CLAIMED_DEVICES
            .get_or_init(|| Mutex::new(HashSet::new()))
            .lock()
            .map_err(|_| CameraError::DeviceBusy(index))?;
        if !claimed.insert(index) {
            return Err(CameraError::DeviceBusy(index));
        }
        Ok(Self { index })
    }
}

impl Drop for DeviceClaim {
    fn drop(&mut self) {
        if let Some(lock) = CLAIMED_DEVICES.get() {
            if let Ok(mut claimed) = lock.lock() {
                claimed.remove(&self.index);
            }
        }
    }
}

struct ActiveDevice {
    backend: String,
    device: Box<dyn CaptureDevice>,
    _claim: DeviceClaim,
}

/// Owns the camera for one pipeline. Not shareable between readers.
pub struct CameraManager {
    backends: Vec<Box<dyn CaptureBackend>>,
    settings: CaptureSettings,
    active: Option<ActiveDevice>,
}

impl CameraManager {
    pub fn new(backends: Vec<Box<dyn CaptureBackend>>, settings: CaptureSettings) -> Self {
        Self {
            backends,
            settings,
            active: None,
        }
    }

    /// Manager over the platform V4L2 backends in their default order.
    pub fn with_default_backends(settings: CaptureSettings) -> Self {
        Self::new(default_backends(), settings)
    }

    pub fn settings(&self) -> &CaptureSettings {
        &self.settings
    }

    pub fn is_open(&self) -> bool {
        self.active.is_some()
    }

    /// Open the first backend that accepts the configured resolution and frame rate.
    pub fn open(&mut self) -> Result<CameraInfo, CameraError> {
        if self.active.is_some() {
            return Err(CameraError::DeviceBusy(self.settings.index));
        }
        let claim = DeviceClaim::acquire(self.settings.index)?;
        let (backend, device) = self.open_device()?;

        tracing::info!(index = self.settings.index, backend = %backend, "camera ready");
        let info = CameraInfo {
            backend: backend.clone(),
            index: self.settings.index,
        };
        self.active = Some(ActiveDevice {
            backend,
            device,
            _claim: claim,
        });
        Ok(info)
    }

    /// Read the newest frame, reopening the device once if the read fails.
    pub fn read(&mut self) -> Result<Frame, CameraError> {
        let active = self.active.as_mut().ok_or(CameraError::NotOpen)?;
        let first_err = match active.device.read() {
            Ok(frame) => return Ok(frame),
            Err(e) => e,
        };

        tracing::warn!(
            index = self.settings.index,
            backend = %active.backend,
            error = %first_err,
            "frame read failed; reopening camera"
        );

        // Drop the stale handle before reopening; the device claim stays held.
        let Some(ActiveDevice { _claim: claim, .. }) = self.active.take() else {
            return Err(CameraError::NotOpen);
        };

        let (backend, mut device) = match self.open_device() {
            Ok(opened) => opened,
            Err(e) => {
                tracing::info!(index = self.settings.index, "camera released");
                return Err(CameraError::CameraLost(format!(
                    "read failed ({first_err}) and reopen failed ({e})"
                )));
            }
        };

        match device.read() {
            Ok(frame) => {
                self.active = Some(ActiveDevice {
                    backend,
                    device,
                    _claim: claim,
                });
                Ok(frame)
            }
            Err(e) => Err(CameraError::CameraLost(format!(
                "read failed again after reopen: {e}"
            ))),
        }
    }

    /// Release the device. Safe to call any number of times.
    pub fn close(&mut self) {
        if let Some(active) = self.active.take() {
            tracing::info!(
                index = self.settings.index,
                backend = %active.backend,
                "camera released"
            );
        }
    }

    /// Try each backend in order, warm up the first one that opens.
    fn open_device(&self) -> Result<(String, Box<dyn CaptureDevice>), CameraError> {
        let mut failures = Vec::with_capacity(self.backends.len());

        for backend in &self.backends {
            match backend.open(&self.settings) {
                Ok(mut device) => {
                    warm_up(device.as_mut(), self.settings.warmup_frames);
                    return Ok((backend.name().to_string(), device));
                }
                Err(e) => {
                    tracing::debug!(backend = backend.name(), error = %e, "capture backend rejected");
                    failures.push(format!("{}: {e}", backend.name()));
                }
            }
        }

        if failures.is_empty() {
            failures.push("no capture backends configured".to_string());
        }
        Err(CameraError::CameraUnavailable(failures.join("; ")))
    }
}

impl Drop for CameraManager {
    fn drop(&mut self) {
        self.close();
    }
}

/// Discard the first frames; some devices deliver stale or black frames right after open.
fn warm_up(device: &mut dyn CaptureDevice, count: usize) {
    if count == 0 {
        return;
    }
    let mut dark = 0usize;
    let mut failed = 0usize;
    let mut settled_brightness = None;
    for _ in 0..count {
        match device.read() {
            Ok(frame) => {
                if frame.is_dark() {
                    dark += 1;
                }
                settled_brightness = Some(frame.avg_brightness());
            }
            Err(_) => failed += 1,
        }
    }
    tracing::debug!(count, dark, failed, brightness = ?settled_brightness, "discarded warm-up frames");
}

/// Pixel format requested from a V4L2 device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    Yuyv,
    /// Motion-JPEG, one JPEG per buffer.
    Mjpeg,
    /// Packed 24-bit RGB.
    Rgb3,
}

impl PixelFormat {
    fn fourcc(self) -> FourCC {
        match self {
            PixelFormat::Yuyv => FourCC::new(b"YUYV"),
            PixelFormat::Mjpeg => FourCC::new(b"MJPG"),
            PixelFormat::Rgb3 => FourCC::new(b"RGB3"),
        }
    }
}

/// V4L2 backend pinned to one pixel format.
pub struct V4lBackend {
    format: PixelFormat,
    name: String,
}

impl V4lBackend {
    pub fn new(format: PixelFormat) -> Self {
        Self {
            format,
            name: format!("v4l2-{format:?}").to_lowercase(),
        }
    }
}

/// Platform backends in priority order.
pub fn default_backends() -> Vec<Box<dyn CaptureBackend>> {
    vec![
        Box::new(V4lBackend::new(PixelFormat::Yuyv)),
        Box::new(V4lBackend::new(PixelFormat::Mjpeg)),
        Box::new(V4lBackend::new(PixelFormat::Rgb3)),
    ]
}

impl CaptureBackend for V4lBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self, settings: &CaptureSettings) -> Result<Box<dyn CaptureDevice>, CameraError> {
        let path = format!("/dev/video{}", settings.index);
        if !Path::new(&path).exists() {
            return Err(CameraError::DeviceNotFound(path));
        }

        let device = Device::new(settings.index as usize).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy(settings.index)
            } else {
                CameraError::DeviceNotFound(format!("{path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = self.format.fourcc();
        fmt.width = settings.width;
        fmt.height = settings.height;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;
        if negotiated.fourcc != self.format.fourcc() {
            return Err(CameraError::FormatNegotiationFailed(format!(
                "driver chose {:?} instead of {:?}",
                negotiated.fourcc,
                self.format.fourcc()
            )));
        }

        device
            .set_params(&Parameters::with_fps(settings.fps))
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to set fps: {e}")))?;

        let stream = MmapStream::with_buffers(&device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;

        tracing::info!(
            device = %path,
            driver = %caps.driver,
            card = %caps.card,
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?negotiated.fourcc,
            "opened camera"
        );

        Ok(Box::new(V4lDevice {
            stream,
            _device: device,
            width: negotiated.width,
            height: negotiated.height,
            format: self.format,
        }))
    }
}

/// Open V4L2 device with a running mmap stream.
struct V4lDevice {
    // Declared before the device so the stream is torn down first.
    stream: MmapStream<'static>,
    _device: Device,
    width: u32,
    height: u32,
    format: PixelFormat,
}

impl CaptureDevice for V4lDevice {
    fn read(&mut self) -> Result<Frame, CameraError> {
        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;

        let used = (meta.bytesused as usize).min(buf.len());
        let image = match self.format {
            PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, self.width, self.height),
            PixelFormat::Mjpeg => frame::mjpeg_to_image(&buf[..used]),
            PixelFormat::Rgb3 => frame::rgb24_to_image(buf, self.width, self.height),
        }
        .map_err(|e| CameraError::CaptureFailed(format!("{:?} conversion failed: {e}", self.format)))?;

        Ok(Frame::new(image, meta.sequence))
    }
}

/// List available V4L2 video capture devices.
pub fn list_devices() -> Vec<DeviceInfo> {
    let mut devices = Vec::new();

    for i in 0..16 {
        let path = format!("/dev/video{i}");
        if !Path::new(&path).exists() {
            continue;
        }
        let Ok(dev) = Device::new(i) else {
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

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Scripted backend: counts opens, can refuse to open after a limit,
    /// and fails the next `fail_reads` reads.
    struct FakeBackend {
        name: &'static str,
        opens: Arc<AtomicUsize>,
        max_opens: usize,
        fail_reads: Arc<AtomicUsize>,
    }

    impl FakeBackend {
        fn new(name: &'static str, max_opens: usize) -> Self {
            Self {
                name,
                opens: Arc::new(AtomicUsize::new(0)),
                max_opens,
                fail_reads: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    struct FakeDevice {
        sequence: u32,
        fail_reads: Arc<AtomicUsize>,
    }

    impl CaptureBackend for FakeBackend {
        fn name(&self) -> &str {
            self.name
        }

        fn open(&self, _settings: &CaptureSettings) -> Result<Box<dyn CaptureDevice>, CameraError> {
            if self.opens.load(Ordering::SeqCst) >= self.max_opens {
                return Err(CameraError::DeviceNotFound(self.name.to_string()));
            }
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeDevice {
                sequence: 0,
                fail_reads: self.fail_reads.clone(),
            }))
        }
    }

    impl CaptureDevice for FakeDevice {
        fn read(&mut self) -> Result<Frame, CameraError> {
            let pending = self.fail_reads.load(Ordering::SeqCst);
            if pending > 0 {
                self.fail_reads.store(pending - 1, Ordering::SeqCst);
                return Err(CameraError::CaptureFailed("scripted".into()));
            }
            let frame = Frame::new(RgbImage::from_pixel(8, 8, Rgb([120, 120, 120])), self.sequence);
            self.sequence += 1;
            Ok(frame)
        }
    }

    fn settings(index: u32, warmup_frames: usize) -> CaptureSettings {
        CaptureSettings {
            index,
            warmup_frames,
            ..CaptureSettings::default()
        }
    }

    #[test]
    fn test_open_uses_first_working_backend() {
        let broken = FakeBackend::new("broken", 0);
        let working = FakeBackend::new("working", usize::MAX);
        let mut camera = CameraManager::new(vec![Box::new(broken), Box::new(working)], settings(100, 0));

        let info = camera.open().unwrap();
        assert_eq!(info.backend, "working");
        assert!(camera.is_open());
    }

    #[test]
    fn test_open_all_backends_fail() {
        let mut camera = CameraManager::new(
            vec![Box::new(FakeBackend::new("a", 0)), Box::new(FakeBackend::new("b", 0))],
            settings(101, 0),
        );
        assert!(matches!(camera.open(), Err(CameraError::CameraUnavailable(_))));
        assert!(!camera.is_open());
    }

    #[test]
    fn test_open_without_backends_is_unavailable() {
        let mut camera = CameraManager::new(Vec::new(), settings(102, 0));
        assert!(matches!(camera.open(), Err(CameraError::CameraUnavailable(_))));
    }

    #[test]
    fn test_warmup_discards_frames() {
        let backend = FakeBackend::new("cam", usize::MAX);
        let mut camera = CameraManager::new(vec![Box::new(backend)], settings(103, 5));
        camera.open().unwrap();
        // Sequences 0..5 were consumed by warm-up.
        assert_eq!(camera.read().unwrap().sequence, 5);
    }

    #[test]
    fn test_read_recovers_after_single_failure() {
        let backend = FakeBackend::new("cam", usize::MAX);
        let opens = backend.opens.clone();
        let fail_reads = backend.fail_reads.clone();
        let mut camera = CameraManager::new(vec![Box::new(backend)], settings(104, 0));
        camera.open().unwrap();

        fail_reads.store(1, Ordering::SeqCst);
        let frame = camera.read().expect("reopen should recover");
        assert_eq!(frame.width(), 8);
        assert_eq!(opens.load(Ordering::SeqCst), 2);
        assert!(camera.read().is_ok());
    }

    #[test]
    fn test_read_lost_when_reopen_fails() {
        let backend = FakeBackend::new("cam", 1);
        let fail_reads = backend.fail_reads.clone();
        let mut camera = CameraManager::new(vec![Box::new(backend)], settings(105, 0));
        camera.open().unwrap();

        fail_reads.store(1, Ordering::SeqCst);
        assert!(matches!(camera.read(), Err(CameraError::CameraLost(_))));
        assert!(!camera.is_open());
    }

    #[test]
    fn test_read_does_not_retry_indefinitely() {
        let backend = FakeBackend::new("cam", usize::MAX);
        let opens = backend.opens.clone();
        let fail_reads = backend.fail_reads.clone();
        let mut camera = CameraManager::new(vec![Box::new(backend)], settings(106, 0));
        camera.open().unwrap();

        fail_reads.store(usize::MAX, Ordering::SeqCst);
        assert!(matches!(camera.read(), Err(CameraError::CameraLost(_))));
        assert_eq!(opens.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_read_before_open() {
        let mut camera = CameraManager::new(Vec::new(), settings(107, 0));
        assert!(matches!(camera.read(), Err(CameraError::NotOpen)));
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut camera =
            CameraManager::new(vec![Box::new(FakeBackend::new("cam", usize::MAX))], settings(108, 0));
        camera.open().unwrap();
        camera.close();
        camera.close();
        assert!(!camera.is_open());
        // The claim was released, so reopening works.
        assert!(camera.open().is_ok());
    }

    #[test]
    fn test_second_open_is_rejected() {
        let mut first =
            CameraManager::new(vec![Box::new(FakeBackend::new("cam", usize::MAX))], settings(109, 0));
        let mut second =
            CameraManager::new(vec![Box::new(FakeBackend::new("cam", usize::MAX))], settings(109, 0));

        first.open().unwrap();
        assert!(matches!(first.open(), Err(CameraError::DeviceBusy(109))));
        assert!(matches!(second.open(), Err(CameraError::DeviceBusy(109))));

        drop(first);
        assert!(second.open().is_ok());
    }

    #[test]
    fn test_backend_names() {
        let names: Vec<String> = default_backends().iter().map(|b| b.name().to_string()).collect();
        assert_eq!(names, vec!["v4l2-yuyv", "v4l2-mjpeg", "v4l2-rgb3"]);
    }

    #[test]
    fn test_stream_queue_holds_at_most_one_stale_frame() {
        // One buffer being filled plus one waiting: a slow reader is never
        // handed a frame older than the previous capture.
        assert!((1..=2).contains(&STREAM_BUFFERS));
    }
}
