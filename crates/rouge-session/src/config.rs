use rouge_core::compositor::Finish;
use rouge_core::contour::{DEFAULT_SAMPLES_PER_SEGMENT, MAX_SAMPLES_PER_SEGMENT};
use rouge_core::mask::{DEFAULT_FEATHER_RADIUS, DEFAULT_MASK_COVERAGE, MAX_FEATHER_RADIUS};
use rouge_core::tracker::{DEFAULT_FACE_LOST_THRESHOLD, DEFAULT_SMOOTHING_FACTOR};
use rouge_core::{GlossStyle, LipTopology, MaskStyle, RenderStyle, Rgb, TopologyError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const DEFAULT_COLOR: Rgb = Rgb::new(0xdc, 0x26, 0x26);
const DEFAULT_MODEL_FILE: &str = "face_mesh.onnx";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid {key}={value:?}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Try-on session configuration.
///
/// Layered as defaults, then an optional TOML file, then `ROUGE_*`
/// environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Lipstick shade as a hex string in TOML (e.g. "#DC2626").
    pub color: Rgb,
    pub finish: Finish,
    /// Fraction of the remaining distance the rendered landmarks move per render tick.
    pub smoothing_factor: f32,
    pub detection_interval_ms: u64,
    pub render_interval_ms: u64,
    /// Consecutive detection misses before compositing is suspended.
    pub face_lost_threshold: u32,
    pub samples_per_segment: usize,
    pub feather_radius: usize,
    pub mask_coverage: f32,
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    pub camera_width: u32,
    pub camera_height: u32,
    /// Face Mesh ONNX model.
    pub model_path: PathBuf,
    /// Lip topology TOML; the built-in Face Mesh table when unset.
    pub topology_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            color: DEFAULT_COLOR,
            finish: Finish::Matte,
            smoothing_factor: DEFAULT_SMOOTHING_FACTOR,
            detection_interval_ms: 40,
            render_interval_ms: 16,
            face_lost_threshold: DEFAULT_FACE_LOST_THRESHOLD,
            samples_per_segment: DEFAULT_SAMPLES_PER_SEGMENT,
            feather_radius: DEFAULT_FEATHER_RADIUS,
            mask_coverage: DEFAULT_MASK_COVERAGE,
            camera_device: "/dev/video0".to_string(),
            camera_width: 320,
            camera_height: 240,
            model_path: default_model_dir().join(DEFAULT_MODEL_FILE),
            topology_path: None,
        }
    }
}

impl Config {
    /// Load configuration: defaults, the TOML file at `path` if given, then
    /// `ROUGE_*` environment variables. The result is validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus `ROUGE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: display.clone(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })
    }

    /// Apply `ROUGE_*` overrides read through `lookup`.
    ///
    /// Unparsable numbers keep the current value (logged); an unparsable
    /// color or finish is an error.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = lookup("ROUGE_COLOR") {
            self.color = v.parse().map_err(|e: rouge_core::ColorError| ConfigError::InvalidValue {
                key: "ROUGE_COLOR",
                value: v.clone(),
                reason: e.to_string(),
            })?;
        }
        if let Some(v) = lookup("ROUGE_FINISH") {
            self.finish = v.parse().map_err(|reason| ConfigError::InvalidValue {
                key: "ROUGE_FINISH",
                value: v.clone(),
                reason,
            })?;
        }
        self.smoothing_factor = env_parse(&lookup, "ROUGE_SMOOTHING", self.smoothing_factor);
        self.detection_interval_ms = env_parse(&lookup, "ROUGE_DETECTION_INTERVAL_MS", self.detection_interval_ms);
        self.render_interval_ms = env_parse(&lookup, "ROUGE_RENDER_INTERVAL_MS", self.render_interval_ms);
        self.face_lost_threshold = env_parse(&lookup, "ROUGE_FACE_LOST_THRESHOLD", self.face_lost_threshold);
        if let Some(v) = lookup("ROUGE_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = lookup("ROUGE_MODEL_PATH") {
            self.model_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROUGE_TOPOLOGY_PATH") {
            self.topology_path = Some(PathBuf::from(v));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.smoothing_factor > 0.0 && self.smoothing_factor <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "smoothing_factor must be in (0, 1], got {}",
                self.smoothing_factor
            )));
        }
        if self.detection_interval_ms == 0 || self.render_interval_ms == 0 {
            return Err(ConfigError::Invalid("detection and render intervals must be non-zero".into()));
        }
        if self.face_lost_threshold == 0 {
            return Err(ConfigError::Invalid("face_lost_threshold must be at least 1".into()));
        }
        if !(1..=MAX_SAMPLES_PER_SEGMENT).contains(&self.samples_per_segment) {
            return Err(ConfigError::Invalid(format!(
                "samples_per_segment must be in 1..={MAX_SAMPLES_PER_SEGMENT}, got {}",
                self.samples_per_segment
            )));
        }
        if self.feather_radius > MAX_FEATHER_RADIUS {
            return Err(ConfigError::Invalid(format!(
                "feather_radius must be at most {MAX_FEATHER_RADIUS}, got {}",
                self.feather_radius
            )));
        }
        if !(0.0..=1.0).contains(&self.mask_coverage) {
            return Err(ConfigError::Invalid(format!(
                "mask_coverage must be in [0, 1], got {}",
                self.mask_coverage
            )));
        }
        if self.camera_width == 0 || self.camera_height == 0 {
            return Err(ConfigError::Invalid("camera resolution must be non-zero".into()));
        }
        Ok(())
    }

    pub fn detection_interval(&self) -> Duration {
        Duration::from_millis(self.detection_interval_ms)
    }

    pub fn render_interval(&self) -> Duration {
        Duration::from_millis(self.render_interval_ms)
    }

    pub fn render_style(&self) -> RenderStyle {
        RenderStyle {
            color: self.color,
            finish: self.finish,
            samples_per_segment: self.samples_per_segment,
            mask: MaskStyle {
                coverage: self.mask_coverage,
                feather_radius: self.feather_radius,
            },
            gloss: GlossStyle::default(),
        }
    }

    /// The configured lip topology, or the built-in Face Mesh table.
    pub fn topology(&self) -> Result<LipTopology, TopologyError> {
        match &self.topology_path {
            Some(path) => LipTopology::load(path),
            None => Ok(LipTopology::face_mesh()),
        }
    }

    pub fn model_path_string(&self) -> String {
        self.model_path.to_string_lossy().into_owned()
    }
}

/// `$XDG_DATA_HOME/rouge/models`, falling back to `~/.local/share/rouge/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rouge")
        .join("models")
}

fn env_parse<T: std::str::FromStr + Copy>(lookup: &impl Fn(&str) -> Option<String>, key: &str, current: T) -> T {
    match lookup(key) {
        Some(v) => v.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %v, "ignoring unparsable override");
            current
        }),
        None => current,
    }
}
