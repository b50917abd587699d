use crate::util::RetryConfig;
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};
use url::Url;

pub const DEFAULT_BACKEND_URL: &str = "https://auratunes.onrender.com";
pub const DEFAULT_SAMPLE_INTERVAL_MS: u64 = 100;
pub const DEFAULT_STABLE_SAMPLES: usize = 1;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_CAMERA_WIDTH: u32 = 640;
pub const DEFAULT_CAMERA_HEIGHT: u32 = 480;
pub const ENV_BACKEND_URL: &str = "AURATUNES_BACKEND_URL";
pub const ENV_CAMERA_URL: &str = "AURATUNES_CAMERA_URL";
pub const ENV_CLASSIFIER_URL: &str = "AURATUNES_CLASSIFIER_URL";
pub const ENV_OUTPUT_DEVICE: &str = "AURATUNES_OUTPUT_DEVICE";

/// An absolute http(s) URL of an external collaborator.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint(Url);

impl Endpoint {
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(ConfigError::EmptyUrl);
        }
        let url = Url::parse(trimmed).map_err(|e| ConfigError::InvalidUrl {
            value: trimmed.to_owned(),
            reason: e.to_string(),
        })?;
        match url.scheme() {
            "http" | "https" => Ok(Self(url)),
            other => Err(ConfigError::UnsupportedScheme(other.to_owned())),
        }
    }

    pub fn url(&self) -> &Url {
        &self.0
    }

    /// Appends `segment` to the path, keeping any path prefix of the base.
    pub fn join(&self, segment: &str) -> Url {
        let mut url = self.0.clone();
        let base = url.path().trim_end_matches('/').to_owned();
        url.set_path(&format!("{base}/{}", segment.trim_start_matches('/')));
        url
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Endpoint({})", self.0)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SampleInterval {
    pub period_ms: u64,
}

impl SampleInterval {
    pub fn new(period_ms: u64) -> Result<Self, ConfigError> {
        if period_ms == 0 {
            return Err(ConfigError::ZeroSampleInterval);
        }
        Ok(Self { period_ms })
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

impl Default for SampleInterval {
    fn default() -> Self {
        Self {
            period_ms: DEFAULT_SAMPLE_INTERVAL_MS,
        }
    }
}

/// How many consecutive identical dominant labels are needed before the
/// current mood switches. 1 means every sample is authoritative.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StableSamples(usize);

impl StableSamples {
    pub fn new(count: usize) -> Result<Self, ConfigError> {
        if count == 0 {
            return Err(ConfigError::ZeroStableSamples);
        }
        Ok(Self(count))
    }

    pub fn get(&self) -> usize {
        self.0
    }
}

impl Default for StableSamples {
    fn default() -> Self {
        Self(DEFAULT_STABLE_SAMPLES)
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SamplingConfig {
    pub interval: SampleInterval,
    pub stable_samples: StableSamples,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum FacingMode {
    #[default]
    User,
    Environment,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CameraSettings {
    pub width: u32,
    pub height: u32,
    pub facing: FacingMode,
}

impl CameraSettings {
    pub fn new(width: u32, height: u32, facing: FacingMode) -> Result<Self, ConfigError> {
        if width == 0 || height == 0 {
            return Err(ConfigError::ZeroCameraDimension);
        }
        Ok(Self {
            width,
            height,
            facing,
        })
    }
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            width: DEFAULT_CAMERA_WIDTH,
            height: DEFAULT_CAMERA_HEIGHT,
            facing: FacingMode::User,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackendConfig {
    pub base_url: Endpoint,
    pub timeout: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: Endpoint(
                Url::parse(DEFAULT_BACKEND_URL).expect("default backend url is valid"),
            ),
            timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AudioConfig {
    pub output_device: Option<String>,
    pub muted: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub backend: BackendConfig,
    pub camera_url: Option<Endpoint>,
    pub classifier_url: Option<Endpoint>,
    pub camera: CameraSettings,
    pub sampling: SamplingConfig,
    pub retry: RetryConfig,
    pub audio: AudioConfig,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("url must not be empty")]
    EmptyUrl,
    #[error("invalid url {value:?}: {reason}")]
    InvalidUrl { value: String, reason: String },
    #[error("unsupported url scheme {0:?} (expected http or https)")]
    UnsupportedScheme(String),
    #[error("sample interval must be > 0 ms")]
    ZeroSampleInterval,
    #[error("stable sample count must be >= 1")]
    ZeroStableSamples,
    #[error("camera width and height must be > 0")]
    ZeroCameraDimension,
}

pub trait Env {
    fn var(&self, key: &str) -> Option<String>;
}

#[derive(Clone, Debug, Default)]
pub struct StdEnv;

impl Env for StdEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

#[derive(Clone, Debug, Default)]
pub struct MapEnv {
    vars: std::collections::BTreeMap<String, String>,
}

impl MapEnv {
    pub fn with_var(mut self, key: &str, value: &str) -> Self {
        self.vars.insert(key.to_owned(), value.to_owned());
        self
    }
}

impl Env for MapEnv {
    fn var(&self, key: &str) -> Option<String> {
        self.vars.get(key).cloned()
    }
}

pub fn resolve_endpoint(
    cli_value: Option<String>,
    env_key: &str,
    env: &impl Env,
) -> Result<Option<Endpoint>, ConfigError> {
    match resolve_optional_string(cli_value, env_key, env) {
        Some(v) => Ok(Some(Endpoint::parse(&v)?)),
        None => Ok(None),
    }
}

pub fn resolve_endpoint_with_default(
    cli_value: Option<String>,
    env_key: &str,
    env: &impl Env,
    default: &str,
) -> Result<Endpoint, ConfigError> {
    Endpoint::parse(&resolve_string_with_default(cli_value, env_key, env, default))
}

pub fn resolve_string_with_default(
    cli_value: Option<String>,
    env_key: &str,
    env: &impl Env,
    default: &str,
) -> String {
    match cli_value {
        Some(v) => v,
        None => env.var(env_key).unwrap_or_else(|| default.to_owned()),
    }
}

pub fn resolve_optional_string(
    cli_value: Option<String>,
    env_key: &str,
    env: &impl Env,
) -> Option<String> {
    match cli_value {
        Some(v) => Some(v),
        None => env.var(env_key),
    }
}
