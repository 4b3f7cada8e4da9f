//! Haar cascade face locator.
//!
//! Converts the frame to grayscale, equalizes its histogram and runs an
//! OpenCV `CascadeClassifier` multi-scale scan over it.

use crate::types::FaceBox;
use image::RgbImage;
use opencv::core::{AlgorithmHint, Mat, Rect, Size, Vector};
use opencv::imgproc;
use opencv::objdetect::CascadeClassifier;
use opencv::prelude::*;
use std::path::Path;
use thiserror::Error;

// --- Named constants ---
const DEFAULT_SCALE_FACTOR: f64 = 1.1;
const DEFAULT_MIN_NEIGHBORS: i32 = 5;
const STANDARD_MIN_FACE: u32 = 30;
const HIGH_FIDELITY_MIN_FACE: u32 = 60;

#[derive(Error, Debug)]
pub enum LocatorError {
    #[error("cascade file not found: {0} (place haarcascade_frontalface_default.xml in the models directory)")]
    CascadeNotFound(String),
    #[error("cascade {0} loaded but contains no stages")]
    EmptyCascade(String),
    #[error("cascade path is not valid UTF-8: {0}")]
    InvalidPath(String),
    #[error("opencv: {0}")]
    OpenCv(#[from] opencv::Error),
}

/// Anything that finds faces in a frame.
pub trait FaceLocator {
    /// Face boxes ordered top-to-bottom, left-to-right. Empty when nothing is found.
    fn locate(&mut self, frame: &RgbImage) -> Vec<FaceBox>;
}

/// Minimum-face-size presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocatorProfile {
    /// 30×30 pixel minimum.
    Standard,
    /// 60×60 pixel minimum, fewer false positives on close-up video.
    HighFidelity,
}

impl LocatorProfile {
    pub fn min_face_size(self) -> u32 {
        match self {
            LocatorProfile::Standard => STANDARD_MIN_FACE,
            LocatorProfile::HighFidelity => HIGH_FIDELITY_MIN_FACE,
        }
    }

    /// Profile for a configured minimum face size.
    pub fn from_min_size(min_size: u32) -> Self {
        if min_size >= HIGH_FIDELITY_MIN_FACE {
            LocatorProfile::HighFidelity
        } else {
            LocatorProfile::Standard
        }
    }
}

/// `detect_multi_scale` parameters.
#[derive(Debug, Clone)]
pub struct LocatorParams {
    /// Window growth between scales.
    pub scale_factor: f64,
    /// Overlapping hits needed to confirm a face.
    pub min_neighbors: i32,
    pub min_size: u32,
    /// Largest window; defaults to the shorter frame side.
    pub max_size: Option<u32>,
}

impl LocatorParams {
    pub fn for_profile(profile: LocatorProfile) -> Self {
        Self {
            scale_factor: DEFAULT_SCALE_FACTOR,
            min_neighbors: DEFAULT_MIN_NEIGHBORS,
            min_size: profile.min_face_size(),
            max_size: None,
        }
    }

    /// Smallest and largest window side for a `width`×`height` frame, or
    /// `None` when not even the smallest window fits.
    ///
    /// A window exactly as large as the short side is still scanned.
    pub fn window_bounds(&self, width: u32, height: u32) -> Option<(u32, u32)> {
        let short_side = width.min(height);
        let min = self.min_size.max(1);
        let max = self.max_size.unwrap_or(short_side).min(short_side);
        (min <= max).then_some((min, max))
    }
}

impl Default for LocatorParams {
    fn default() -> Self {
        Self::for_profile(LocatorProfile::Standard)
    }
}

/// Haar-cascade-backed [`FaceLocator`].
pub struct CascadeLocator {
    classifier: CascadeClassifier,
    params: LocatorParams,
}

impl CascadeLocator {
    /// Load an OpenCV cascade XML such as `haarcascade_frontalface_default.xml`.
    pub fn load(path: &Path, params: LocatorParams) -> Result<Self, LocatorError> {
        let display = path.display().to_string();
        if !path.exists() {
            return Err(LocatorError::CascadeNotFound(display));
        }
        let path_str = path.to_str().ok_or_else(|| LocatorError::InvalidPath(display.clone()))?;

        let classifier = CascadeClassifier::new(path_str).map_err(|e| {
            tracing::error!(path = %display, error = %e, "failed to load face cascade");
            LocatorError::OpenCv(e)
        })?;
        if classifier.empty()? {
            return Err(LocatorError::EmptyCascade(display));
        }

        tracing::info!(
            path = %display,
            min_size = params.min_size,
            min_neighbors = params.min_neighbors,
            "loaded face cascade"
        );
        Ok(Self { classifier, params })
    }

    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<FaceBox>, LocatorError> {
        let (width, height) = frame.dimensions();
        let Some((min, max)) = self.params.window_bounds(width, height) else {
            return Ok(Vec::new());
        };

        let rgb = Mat::from_slice(frame.as_raw())?;
        let rgb = rgb.reshape(3, height as i32)?;

        let mut gray = Mat::default();
        imgproc::cvt_color(&rgb, &mut gray, imgproc::COLOR_RGB2GRAY, 0, AlgorithmHint::ALGO_HINT_DEFAULT)?;
        let mut equalized = Mat::default();
        imgproc::equalize_hist(&gray, &mut equalized)?;

        let mut rects = Vector::<Rect>::new();
        self.classifier.detect_multi_scale(
            &equalized,
            &mut rects,
            self.params.scale_factor,
            self.params.min_neighbors,
            0,
            Size::new(min as i32, min as i32),
            Size::new(max as i32, max as i32),
        )?;

        Ok(to_face_boxes(rects.iter(), width, height))
    }
}

impl FaceLocator for CascadeLocator {
    fn locate(&mut self, frame: &RgbImage) -> Vec<FaceBox> {
        match self.detect(frame) {
            Ok(faces) => {
                tracing::trace!(faces = faces.len(), "cascade scan");
                faces
            }
            Err(e) => {
                tracing::warn!(error = %e, "face detection failed; treating frame as empty");
                Vec::new()
            }
        }
    }
}

/// Clamp detections to the frame, drop empty ones, sort in reading order.
fn to_face_boxes(rects: impl IntoIterator<Item = Rect>, width: u32, height: u32) -> Vec<FaceBox> {
    let mut faces: Vec<FaceBox> = rects
        .into_iter()
        .map(|r| {
            FaceBox {
                x: r.x.max(0) as u32,
                y: r.y.max(0) as u32,
                width: r.width.max(0) as u32,
                height: r.height.max(0) as u32,
            }
            .clamp_to(width, height)
        })
        .filter(|f| f.width > 0 && f.height > 0)
        .collect();
    faces.sort_by_key(|f| (f.y, f.x));
    faces
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use std::path::PathBuf;

    const SYSTEM_CASCADES: [&str; 2] = [
        "/usr/share/opencv4/haarcascades/haarcascade_frontalface_default.xml",
        "/usr/share/opencv/haarcascades/haarcascade_frontalface_default.xml",
    ];

    fn system_cascade() -> Option<PathBuf> {
        SYSTEM_CASCADES.iter().map(PathBuf::from).find(|p| p.exists())
    }

    #[test]
    fn test_profile_min_sizes() {
        assert_eq!(LocatorProfile::Standard.min_face_size(), 30);
        assert_eq!(LocatorProfile::HighFidelity.min_face_size(), 60);
        assert_eq!(LocatorProfile::from_min_size(60), LocatorProfile::HighFidelity);
        assert_eq!(LocatorProfile::from_min_size(30), LocatorProfile::Standard);
        let params = LocatorParams::default();
        assert!((params.scale_factor - 1.1).abs() < 1e-9);
        assert_eq!(params.min_neighbors, 5);
    }

    #[test]
    fn test_window_exactly_filling_short_side_is_scanned() {
        let params = LocatorParams::for_profile(LocatorProfile::HighFidelity);
        assert_eq!(params.window_bounds(60, 60), Some((60, 60)));
        assert_eq!(params.window_bounds(100, 60), Some((60, 60)));
        assert_eq!(params.window_bounds(59, 200), None);
    }

    #[test]
    fn test_window_bounds_respect_max_size() {
        let params = LocatorParams {
            max_size: Some(120),
            ..LocatorParams::default()
        };
        assert_eq!(params.window_bounds(640, 480), Some((30, 120)));
        // A configured max above the frame is capped by the frame.
        assert_eq!(params.window_bounds(100, 80), Some((30, 80)));
    }

    #[test]
    fn test_face_boxes_clamped_and_in_reading_order() {
        let rects = vec![
            Rect::new(120, 40, 50, 50),
            Rect::new(10, 40, 50, 50),
            Rect::new(60, 5, 40, 40),
            Rect::new(180, 150, 60, 60),
            Rect::new(300, 300, 30, 30),
        ];
        let faces = to_face_boxes(rects, 200, 200);
        assert_eq!(faces.len(), 4);
        assert_eq!((faces[0].x, faces[0].y), (60, 5));
        assert_eq!((faces[1].x, faces[1].y), (10, 40));
        assert_eq!((faces[2].x, faces[2].y), (120, 40));
        // Spills past the right and bottom edges.
        assert_eq!((faces[3].width, faces[3].height), (20, 50));
    }

    #[test]
    fn test_load_missing_file() {
        let err = CascadeLocator::load(Path::new("/nonexistent/haarcascade.xml"), LocatorParams::default());
        assert!(matches!(err, Err(LocatorError::CascadeNotFound(_))));
    }

    #[test]
    fn test_load_rejects_non_cascade_file() {
        let path = std::env::temp_dir().join(format!("emorecs-bad-cascade-{}.xml", std::process::id()));
        std::fs::write(&path, b"<?xml version=\"1.0\"?><opencv_storage></opencv_storage>").unwrap();
        let result = CascadeLocator::load(&path, LocatorParams::default());
        std::fs::remove_file(&path).unwrap();
        assert!(result.is_err());
    }

    #[test]
    fn test_haar_cascade_on_blank_frame() {
        let Some(path) = system_cascade() else {
            eprintln!("no system Haar cascade installed; skipping");
            return;
        };
        let mut locator = CascadeLocator::load(&path, LocatorParams::default()).unwrap();
        let frame = RgbImage::from_pixel(160, 120, Rgb([90, 90, 90]));
        assert!(locator.locate(&frame).is_empty());
        // Smaller than the minimum window: nothing to scan.
        let tiny = RgbImage::from_pixel(20, 20, Rgb([90, 90, 90]));
        assert!(locator.locate(&tiny).is_empty());
    }
}
