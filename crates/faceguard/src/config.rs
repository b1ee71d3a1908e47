use crate::store::StoreConfig;
use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid config file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
}

/// Component configuration.
///
/// Built from defaults, optionally a TOML file, then `FACEGUARD_*`
/// environment variables, each layer overriding the previous one.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Euclidean distance at or below which a face is recognized.
    pub threshold: f32,
    /// Target detection passes per second.
    pub fps: u32,
    /// Detections classified and drawn per pass.
    pub max_faces: usize,
    /// Minimum detector confidence.
    pub score_threshold: f32,
    /// Directory containing the model weights.
    pub model_dir: PathBuf,
    /// Directory for the identity database and JSON fallback.
    pub data_dir: PathBuf,
    /// V4L2 device path; `None` uses the provider's default.
    pub camera_device: Option<String>,
}

pub const DEFAULT_THRESHOLD: f32 = 0.55;

impl Default for GuardConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            threshold: DEFAULT_THRESHOLD,
            fps: 24,
            max_faces: 5,
            score_threshold: 0.5,
            model_dir: data_dir.join("models"),
            data_dir,
            camera_device: None,
        }
    }
}

impl GuardConfig {
    /// Defaults overridden by `FACEGUARD_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Parse a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(text)?;
        if !is_usable_threshold(config.threshold) {
            tracing::warn!(threshold = config.threshold, "ignoring unusable threshold in config file");
            config.threshold = DEFAULT_THRESHOLD;
        }
        Ok(config)
    }

    /// Read a TOML file, then apply environment overrides.
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::from_toml_str(&text)?.with_env_overrides())
    }

    pub fn with_env_overrides(mut self) -> Self {
        let threshold = env_parse("FACEGUARD_THRESHOLD", self.threshold);
        if is_usable_threshold(threshold) {
            self.threshold = threshold;
        }
        self.fps = env_parse("FACEGUARD_FPS", self.fps);
        self.max_faces = env_parse("FACEGUARD_MAX_FACES", self.max_faces);
        self.score_threshold = env_parse("FACEGUARD_SCORE_THRESHOLD", self.score_threshold);
        if let Ok(dir) = std::env::var("FACEGUARD_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("FACEGUARD_MODEL_DIR") {
            self.model_dir = PathBuf::from(dir);
        }
        if let Ok(device) = std::env::var("FACEGUARD_CAMERA_DEVICE") {
            self.camera_device = Some(device);
        }
        self
    }

    /// Identity store location under [`data_dir`](Self::data_dir).
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig::new(&self.data_dir)
    }
}

/// `$XDG_DATA_HOME/faceguard`, else `~/.local/share/faceguard`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("faceguard")
}

/// Match thresholds must be finite and strictly positive.
pub fn is_usable_threshold(threshold: f32) -> bool {
    threshold.is_finite() && threshold > 0.0
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
