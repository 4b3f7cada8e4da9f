use anyhow::{Context, Result};
use emorecs_core::onnx::{LOCAL_MODEL_FILE, NEURAL_MODEL_FILE};
use emorecs_core::{HeuristicRules, LocatorParams, LocatorProfile, UserId};
use emorecs_engine::PipelineConfig;
use emorecs_hw::CaptureSettings;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Runtime configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Camera ordinal (default: 0).
    pub camera_index: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Frames discarded after the camera opens (AGC/AE stabilization).
    pub warmup_frames: usize,
    /// Flip frames horizontally before processing.
    pub mirror: bool,
    /// Directory containing the ONNX emotion models.
    pub model_dir: PathBuf,
    /// OpenCV Haar cascade XML.
    pub cascade_path: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Faces are reclassified every N ticks.
    pub throttle_interval: u64,
    /// Hard limit on one camera session, in seconds.
    pub session_ceiling_secs: u64,
    /// Minimum seconds between two emotion log writes.
    pub cooldown_secs: u64,
    /// Smallest face the locator reports, in pixels.
    pub min_face_size: u32,
    /// Optional TOML file overriding the heuristic thresholds.
    pub rules_path: Option<PathBuf>,
    /// TrueType/OpenType font for overlay labels; boxes only when unset.
    pub font_path: Option<PathBuf>,
    pub user_id: Option<UserId>,
}

impl Config {
    /// Load configuration from `EMORECS_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let model_dir = var("EMORECS_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(emorecs_core::default_model_dir);

        let data_dir = var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("emorecs");

        let cascade_path = var("EMORECS_CASCADE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| model_dir.join(emorecs_core::CASCADE_FILE));

        let db_path = var("EMORECS_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("emorecs.db"));

        Self {
            camera_index: parse_var(&var, "EMORECS_CAMERA_INDEX").unwrap_or(0),
            width: parse_var(&var, "EMORECS_WIDTH").unwrap_or(640),
            height: parse_var(&var, "EMORECS_HEIGHT").unwrap_or(480),
            fps: parse_var(&var, "EMORECS_FPS").unwrap_or(30),
            warmup_frames: parse_var(&var, "EMORECS_WARMUP_FRAMES").unwrap_or(5),
            mirror: var("EMORECS_MIRROR").map(|v| v != "0").unwrap_or(true),
            model_dir,
            cascade_path,
            db_path,
            throttle_interval: parse_var(&var, "EMORECS_THROTTLE_INTERVAL").unwrap_or(10),
            session_ceiling_secs: parse_var(&var, "EMORECS_SESSION_CEILING_SECS").unwrap_or(60),
            cooldown_secs: parse_var(&var, "EMORECS_COOLDOWN_SECS").unwrap_or(5),
            min_face_size: parse_var(&var, "EMORECS_MIN_FACE_SIZE").unwrap_or(30),
            rules_path: var("EMORECS_RULES_PATH").map(PathBuf::from),
            font_path: var("EMORECS_FONT_PATH").map(PathBuf::from),
            user_id: parse_var(&var, "EMORECS_USER_ID"),
        }
    }

    pub fn neural_model_path(&self) -> PathBuf {
        self.model_dir.join(NEURAL_MODEL_FILE)
    }

    pub fn local_model_path(&self) -> PathBuf {
        self.model_dir.join(LOCAL_MODEL_FILE)
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            index: self.camera_index,
            width: self.width,
            height: self.height,
            fps: self.fps,
            warmup_frames: self.warmup_frames,
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            throttle_interval: self.throttle_interval.max(1),
            session_ceiling: Duration::from_secs(self.session_ceiling_secs),
            mirror: self.mirror,
            ..PipelineConfig::default()
        }
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    /// Locator parameters for the configured minimum face size.
    pub fn locator_params(&self) -> LocatorParams {
        LocatorParams {
            min_size: self.min_face_size,
            ..LocatorParams::for_profile(LocatorProfile::from_min_size(self.min_face_size))
        }
    }

    /// Heuristic thresholds from `rules_path`, or the built-in defaults.
    pub fn heuristic_rules(&self) -> Result<HeuristicRules> {
        match &self.rules_path {
            Some(path) => HeuristicRules::load(path)
                .with_context(|| format!("loading heuristic rules from {}", path.display())),
            None => Ok(HeuristicRules::default()),
        }
    }
}

fn parse_var<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    var(key).and_then(|v| v.parse().ok())
}
