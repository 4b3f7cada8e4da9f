//! emorecs-hw: Camera capture for the emotion pipeline.
//!
//! Provides V4L2-based capture backends, RGB frame conversion and a
//! [`CameraManager`] that handles warm-up and one-shot reconnection.

pub mod camera;
pub mod frame;

pub use camera::{
    default_backends, list_devices, CameraError, CameraInfo, CameraManager, CaptureBackend,
    CaptureDevice, CaptureSettings, DeviceInfo, PixelFormat, V4lBackend,
};
pub use frame::Frame;
