use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub vision: VisionConfig,
    pub detector: DetectorConfig,
    pub mesh: MeshConfig,
    pub challenge: ChallengeConfig,
    pub token: TokenConfig,
    pub storage: StorageConfig,
    pub debug: DebugConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionConfig {
    /// Downscale target for decoded frames. Frames wider than this are
    /// resized proportionally; narrower frames are left alone.
    #[serde(default = "default_frame_width")]
    pub frame_width: u32,

    /// A gesture must hold for this many consecutive face-bearing frames
    /// before its challenge step commits.
    #[serde(default = "default_min_consecutive_frames")]
    pub min_consecutive_frames: u32,

    /// Upper bound on frames accepted per verification.
    #[serde(default = "default_max_frames")]
    pub max_frames: usize,
}

fn default_frame_width() -> u32 {
    320
}

fn default_min_consecutive_frames() -> u32 {
    2
}

fn default_max_frames() -> usize {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Eye aspect ratio below which the eyes count as closed.
    #[serde(default = "default_ear_threshold")]
    pub ear_threshold: f32,

    /// Mouth width/height ratio above which the expression counts as a smile.
    #[serde(default = "default_smile_ratio_threshold")]
    pub smile_ratio_threshold: f32,

    /// Mouth height/width ratio above which the mouth counts as open.
    #[serde(default = "default_mouth_open_threshold")]
    pub mouth_open_threshold: f32,

    /// Brow-to-eyelid distance (normalized by eye width) above which the
    /// brows count as raised.
    #[serde(default = "default_brow_raise_threshold")]
    pub brow_raise_threshold: f32,

    /// Normalized nose-tip x beyond which the head counts as turned left.
    /// The turn-right threshold is the mirror (1.0 - this value).
    /// Retune per camera geometry.
    #[serde(default = "default_head_turn_nose_x")]
    pub head_turn_nose_x: f32,
}

fn default_ear_threshold() -> f32 {
    0.21
}

fn default_smile_ratio_threshold() -> f32 {
    4.0
}

fn default_mouth_open_threshold() -> f32 {
    0.5
}

fn default_brow_raise_threshold() -> f32 {
    0.35
}

fn default_head_turn_nose_x() -> f32 {
    0.58
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    pub model_path: PathBuf,

    /// Faces scored below this by the mesh model are reported as absent.
    #[serde(default = "default_min_face_confidence")]
    pub min_face_confidence: f32,
}

fn default_min_face_confidence() -> f32 {
    0.5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeConfig {
    /// Seconds until a freshly generated challenge expires.
    #[serde(default = "default_challenge_expiry_seconds")]
    pub expiry_seconds: i64,

    /// Number of gesture steps per challenge, clamped to the pool size.
    #[serde(default = "default_challenge_length")]
    pub length: usize,
}

fn default_challenge_expiry_seconds() -> i64 {
    120
}

fn default_challenge_length() -> usize {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    /// Lifetime of credentials minted on a passed verification.
    #[serde(default = "default_token_ttl_seconds")]
    pub ttl_seconds: i64,
}

fn default_token_ttl_seconds() -> i64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub base_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugConfig {
    pub save_frames: bool,
    pub output_dir: PathBuf,
}

impl Config {
    /// Load configuration with fallback chain:
    /// 1. /etc/lifesign/lifesign.toml (system-wide)
    /// 2. ~/.config/lifesign/lifesign.toml (user)
    /// 3. Compiled defaults
    ///
    /// Recognized environment variables override the loaded file either way.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_file_chain();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn load_file_chain() -> Self {
        if let Ok(config) = Self::load_from_path("/etc/lifesign/lifesign.toml") {
            return config;
        }

        if let Some(home) = std::env::var_os("HOME") {
            let user_config = PathBuf::from(home)
                .join(".config")
                .join("lifesign")
                .join("lifesign.toml");
            if let Ok(config) = Self::load_from_path(&user_config) {
                return config;
            }
        }

        Self::default()
    }

    /// Load configuration from a specific file path
    fn load_from_path<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Apply environment variable overrides. Malformed values are rejected
    /// rather than silently ignored.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(v) = env_override("FRAME_WIDTH")? {
            self.vision.frame_width = v;
        }
        if let Some(v) = env_override("MIN_CONSECUTIVE_FRAMES")? {
            self.vision.min_consecutive_frames = v;
        }
        if let Some(v) = env_override("EAR_THRESHOLD")? {
            self.detector.ear_threshold = v;
        }
        if let Some(v) = env_override("SMILE_RATIO_THRESHOLD")? {
            self.detector.smile_ratio_threshold = v;
        }
        if let Some(v) = env_override("MOUTH_OPEN_THRESHOLD")? {
            self.detector.mouth_open_threshold = v;
        }
        if let Some(v) = env_override("BROW_RAISE_THRESHOLD")? {
            self.detector.brow_raise_threshold = v;
        }
        if let Some(v) = env_override("HEAD_TURN_NOSE_X")? {
            self.detector.head_turn_nose_x = v;
        }
        if let Some(v) = env_override("CHALLENGE_EXPIRY_SECONDS")? {
            self.challenge.expiry_seconds = v;
        }
        if let Some(v) = env_override("CHALLENGE_LENGTH")? {
            self.challenge.length = v;
        }
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vision.frame_width == 0 {
            return Err(ConfigError::Validation(
                "Frame width must be non-zero".to_string(),
            ));
        }

        if self.vision.min_consecutive_frames == 0 {
            return Err(ConfigError::Validation(
                "Min consecutive frames must be greater than 0".to_string(),
            ));
        }

        if self.vision.max_frames == 0 {
            return Err(ConfigError::Validation(
                "Max frames must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.detector.ear_threshold) {
            return Err(ConfigError::Validation(
                "EAR threshold must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.detector.smile_ratio_threshold <= 0.0 {
            return Err(ConfigError::Validation(
                "Smile ratio threshold must be positive".to_string(),
            ));
        }

        if self.detector.mouth_open_threshold <= 0.0 {
            return Err(ConfigError::Validation(
                "Mouth open threshold must be positive".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.detector.brow_raise_threshold) {
            return Err(ConfigError::Validation(
                "Brow raise threshold must be between 0.0 and 1.0".to_string(),
            ));
        }

        if !(0.5..1.0).contains(&self.detector.head_turn_nose_x) {
            return Err(ConfigError::Validation(
                "Head turn nose-x threshold must be between 0.5 and 1.0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.mesh.min_face_confidence) {
            return Err(ConfigError::Validation(
                "Min face confidence must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.challenge.expiry_seconds <= 0 {
            return Err(ConfigError::Validation(
                "Challenge expiry must be greater than 0 seconds".to_string(),
            ));
        }

        if self.challenge.length == 0 {
            return Err(ConfigError::Validation(
                "Challenge length must be greater than 0".to_string(),
            ));
        }

        if self.token.ttl_seconds <= 0 {
            return Err(ConfigError::Validation(
                "Token TTL must be greater than 0 seconds".to_string(),
            ));
        }

        if self.storage.base_path.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "Storage base path cannot be empty".to_string(),
            ));
        }

        if self.debug.output_dir.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "Debug output directory cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

fn env_override<T: FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw.parse::<T>().map(Some).map_err(|_| {
            ConfigError::Validation(format!("Invalid value for {}: {:?}", name, raw))
        }),
        Err(_) => Ok(None),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vision: VisionConfig {
                frame_width: 320,
                min_consecutive_frames: 2,
                max_frames: 60,
            },
            detector: DetectorConfig {
                ear_threshold: 0.21,
                smile_ratio_threshold: 4.0,
                mouth_open_threshold: 0.5,
                brow_raise_threshold: 0.35,
                head_turn_nose_x: 0.58,
            },
            mesh: MeshConfig {
                model_path: PathBuf::from("models/face_landmark_with_attention.onnx"),
                min_face_confidence: 0.5,
            },
            challenge: ChallengeConfig {
                expiry_seconds: 120,
                length: 3,
            },
            token: TokenConfig { ttl_seconds: 300 },
            storage: StorageConfig {
                base_path: PathBuf::from("/var/lib/lifesign"),
            },
            debug: DebugConfig {
                save_frames: false,
                output_dir: PathBuf::from("~/.cache/lifesign/debug"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_frame_width() {
        let mut config = Config::default();
        config.vision.frame_width = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_out_of_range_head_turn() {
        let mut config = Config::default();
        config.detector.head_turn_nose_x = 0.4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_challenge_length() {
        let mut config = Config::default();
        config.challenge.length = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_override_applies() {
        std::env::set_var("EAR_THRESHOLD", "0.25");
        let mut config = Config::default();
        config.apply_env_overrides().unwrap();
        std::env::remove_var("EAR_THRESHOLD");
        assert!((config.detector.ear_threshold - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        std::env::set_var("CHALLENGE_LENGTH", "three");
        let mut config = Config::default();
        let result = config.apply_env_overrides();
        std::env::remove_var("CHALLENGE_LENGTH");
        assert!(result.is_err());
    }
}
