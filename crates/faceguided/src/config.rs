use faceguide_core::{CapturePolicy, GuideConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Which capture tuning is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Profile {
    #[default]
    Standard,
    /// Slower ticks and shorter streaks for weak kiosk hardware.
    LowPower,
}

impl Profile {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "standard" => Some(Profile::Standard),
            "low-power" | "low_power" | "lowpower" => Some(Profile::LowPower),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// V4L2 device path.
    pub device: String,
    pub width: u32,
    pub height: u32,
    /// Polls for non-zero frame dimensions before giving up.
    pub ready_attempts: u32,
    pub ready_poll_ms: u64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            width: 640,
            height: 480,
            ready_attempts: 20,
            ready_poll_ms: 100,
        }
    }
}

/// Detection cadence and capture thresholds.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub interval_ms: u64,
    pub good_frames: u32,
    /// `0` disables capturing on a sustained "ok" streak.
    pub sustained_ok_frames: u32,
    /// Detections below this confidence count as "no face".
    pub min_confidence: f32,
    /// How long a match result stays on screen.
    pub dwell_ms: u64,
    pub jpeg_quality: u8,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interval_ms: 100,
            good_frames: 3,
            sustained_ok_frames: 8,
            min_confidence: 0.5,
            dwell_ms: 5000,
            jpeg_quality: 90,
        }
    }
}

impl CaptureConfig {
    fn low_power() -> Self {
        Self {
            interval_ms: 250,
            good_frames: 2,
            sustained_ok_frames: 5,
            ..Self::default()
        }
    }

    pub fn policy(&self) -> CapturePolicy {
        CapturePolicy {
            good_frames: self.good_frames,
            sustained_ok_frames: (self.sustained_ok_frames > 0).then_some(self.sustained_ok_frames),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Base URL of the matching API; `/userDescriptor/match` is appended.
    pub base_url: String,
    pub timeout_ms: u64,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            timeout_ms: 10_000,
        }
    }
}

/// Daemon configuration.
///
/// Defaults, then the TOML file named by `FACEGUIDE_CONFIG` (if any), then
/// `FACEGUIDE_*` environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub profile: Profile,
    pub camera: CameraConfig,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    pub matcher: MatcherConfig,
    pub guide: GuideConfig,
    pub capture: CaptureConfig,
    /// Capture tuning used when `profile = "low-power"`.
    pub low_power: CaptureConfig,
    /// Where the presenter writes the captured still, if anywhere.
    pub preview_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            profile: Profile::Standard,
            camera: CameraConfig::default(),
            model_dir: faceguide_core::default_model_dir(),
            matcher: MatcherConfig::default(),
            guide: GuideConfig::default(),
            capture: CaptureConfig::default(),
            low_power: CaptureConfig::low_power(),
            preview_path: None,
        }
    }
}

impl Config {
    /// Load the full layered configuration.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os("FACEGUIDE_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Overlay `FACEGUIDE_*` variables. Capture overrides land on the
    /// active profile.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(p) = var("FACEGUIDE_PROFILE") {
            self.profile = Profile::parse(&p)
                .ok_or_else(|| ConfigError::Invalid(format!("unknown profile: {p}")))?;
        }
        if let Some(dir) = var("FACEGUIDE_MODEL_DIR") {
            self.model_dir = PathBuf::from(dir);
        }
        if let Some(path) = var("FACEGUIDE_PREVIEW_PATH") {
            self.preview_path = Some(PathBuf::from(path));
        }

        let cam = &mut self.camera;
        if let Some(dev) = var("FACEGUIDE_CAMERA_DEVICE") {
            cam.device = dev;
        }
        set_parsed(&var, "FACEGUIDE_CAMERA_WIDTH", &mut cam.width);
        set_parsed(&var, "FACEGUIDE_CAMERA_HEIGHT", &mut cam.height);
        set_parsed(&var, "FACEGUIDE_READY_ATTEMPTS", &mut cam.ready_attempts);
        set_parsed(&var, "FACEGUIDE_READY_POLL_MS", &mut cam.ready_poll_ms);

        if let Some(url) = var("FACEGUIDE_MATCH_URL") {
            self.matcher.base_url = url;
        }
        set_parsed(&var, "FACEGUIDE_MATCH_TIMEOUT_MS", &mut self.matcher.timeout_ms);

        let guide = &mut self.guide;
        set_parsed(&var, "FACEGUIDE_GUIDE_CENTER_X", &mut guide.center_x);
        set_parsed(&var, "FACEGUIDE_GUIDE_CENTER_Y", &mut guide.center_y);
        set_parsed(&var, "FACEGUIDE_GUIDE_RADIUS", &mut guide.target_radius);
        set_parsed(&var, "FACEGUIDE_POSITION_TOLERANCE", &mut guide.position_tolerance);
        set_parsed(&var, "FACEGUIDE_SIZE_TOLERANCE", &mut guide.size_tolerance);
        set_parsed(&var, "FACEGUIDE_ANGLE_TOLERANCE_DEG", &mut guide.angle_tolerance_deg);

        let capture = match self.profile {
            Profile::Standard => &mut self.capture,
            Profile::LowPower => &mut self.low_power,
        };
        set_parsed(&var, "FACEGUIDE_INTERVAL_MS", &mut capture.interval_ms);
        set_parsed(&var, "FACEGUIDE_GOOD_FRAMES", &mut capture.good_frames);
        set_parsed(&var, "FACEGUIDE_SUSTAINED_OK_FRAMES", &mut capture.sustained_ok_frames);
        set_parsed(&var, "FACEGUIDE_MIN_CONFIDENCE", &mut capture.min_confidence);
        set_parsed(&var, "FACEGUIDE_DWELL_MS", &mut capture.dwell_ms);
        set_parsed(&var, "FACEGUIDE_JPEG_QUALITY", &mut capture.jpeg_quality);
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let g = &self.guide;
        let positive = [
            ("guide.target_radius", g.target_radius),
            ("guide.position_tolerance", g.position_tolerance),
            ("guide.size_tolerance", g.size_tolerance),
            ("guide.angle_tolerance_deg", g.angle_tolerance_deg),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| !(*v > 0.0)) {
            return Err(ConfigError::Invalid(format!("{name} must be positive")));
        }
        let c = self.active_capture();
        if c.interval_ms == 0 {
            return Err(ConfigError::Invalid("interval_ms must be non-zero".into()));
        }
        if c.good_frames == 0 {
            return Err(ConfigError::Invalid("good_frames must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&c.min_confidence) {
            return Err(ConfigError::Invalid("min_confidence must be within [0, 1]".into()));
        }
        if !(1..=100).contains(&c.jpeg_quality) {
            return Err(ConfigError::Invalid("jpeg_quality must be within 1..=100".into()));
        }
        if self.camera.ready_attempts == 0 {
            return Err(ConfigError::Invalid("camera.ready_attempts must be at least 1".into()));
        }
        Ok(())
    }

    /// Capture tuning for the selected profile.
    pub fn active_capture(&self) -> &CaptureConfig {
        match self.profile {
            Profile::Standard => &self.capture,
            Profile::LowPower => &self.low_power,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.active_capture().interval_ms)
    }

    pub fn dwell(&self) -> Duration {
        Duration::from_millis(self.active_capture().dwell_ms)
    }

    pub fn ready_poll(&self) -> Duration {
        Duration::from_millis(self.camera.ready_poll_ms)
    }

    pub fn match_timeout(&self) -> Duration {
        Duration::from_millis(self.matcher.timeout_ms)
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join("det_10g.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace descriptor model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir
            .join("w600k_r50.onnx")
            .to_string_lossy()
            .into_owned()
    }
}

fn set_parsed<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = var(key) else {
        return;
    };
    match raw.parse() {
        Ok(v) => *slot = v,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable override"),
    }
}
