use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::retry::RetryPolicy;

/// Worker configuration loaded from environment variables.
///
/// | Env Var                           | Default           |
/// |-----------------------------------|-------------------|
/// | `PORT`                            | `8080`            |
/// | `COMFY_HOST`                      | `127.0.0.1:8188`  |
/// | `COMFY_OUTPUT_DIR`                | `/comfyui/output` |
/// | `WORKFLOW_DIR`                    | unset             |
/// | `DEFAULT_WORKFLOW`                | `hunyuan_t2v`     |
/// | `COMFY_POLLING_INTERVAL_MS`       | `250`             |
/// | `COMFY_POLLING_MAX_RETRIES`       | `2400`            |
/// | `COMFY_API_AVAILABLE_INTERVAL_MS` | `50`              |
/// | `COMFY_API_AVAILABLE_MAX_RETRIES` | `500`             |
/// | `REFRESH_WORKER`                  | `false`           |
/// | `ARTIFACT_KEYS`                   | `videos,gifs`     |
/// | `MAX_FRAMES`                      | `129`             |
/// | `MAX_PIXEL_FRAMES`                | `267494400`       |
/// | `PREVIEW_WIDTH` / `PREVIEW_HEIGHT`| `320` / `320`     |
/// | `PREVIEW_QUALITY`                 | `85`              |
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub port: u16,
    pub comfy_host: String,
    pub output_dir: PathBuf,
    pub workflow_dir: Option<PathBuf>,
    pub default_workflow: String,
    pub polling: RetryPolicy,
    pub readiness: RetryPolicy,
    pub refresh_worker: bool,
    pub limits: Limits,
    pub artifacts: ArtifactSettings,
}

/// Hardware ceilings checked before anything is submitted. The pixel budget
/// applies to the larger of the generation and target areas, times frames.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_frames: u32,
    pub max_pixel_frames: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_frames: 129,
            max_pixel_frames: 1920 * 1080 * 129,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactSettings {
    /// Output collection keys searched in order (`videos` for newer templates, `gifs` for older).
    pub collection_keys: Vec<String>,
    pub preview_width: u32,
    pub preview_height: u32,
    pub preview_quality: u8,
}

impl Default for ArtifactSettings {
    fn default() -> Self {
        Self {
            collection_keys: vec!["videos".to_string(), "gifs".to_string()],
            preview_width: 320,
            preview_height: 320,
            preview_quality: 85,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            comfy_host: "127.0.0.1:8188".to_string(),
            output_dir: PathBuf::from("/comfyui/output"),
            workflow_dir: None,
            default_workflow: "hunyuan_t2v".to_string(),
            polling: RetryPolicy::new(Duration::from_millis(250), 2400),
            readiness: RetryPolicy::new(Duration::from_millis(50), 500),
            refresh_worker: false,
            limits: Limits::default(),
            artifacts: ArtifactSettings::default(),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let polling = RetryPolicy::new(
            Duration::from_millis(parse_or(&lookup, "COMFY_POLLING_INTERVAL_MS", 250)?),
            parse_or(&lookup, "COMFY_POLLING_MAX_RETRIES", defaults.polling.max_attempts)?,
        );
        let readiness = RetryPolicy::new(
            Duration::from_millis(parse_or(&lookup, "COMFY_API_AVAILABLE_INTERVAL_MS", 50)?),
            parse_or(&lookup, "COMFY_API_AVAILABLE_MAX_RETRIES", defaults.readiness.max_attempts)?,
        );

        let collection_keys = match lookup("ARTIFACT_KEYS") {
            Some(raw) => {
                let keys: Vec<String> = raw
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
                if keys.is_empty() {
                    return Err(ConfigError::Invalid { var: "ARTIFACT_KEYS", value: raw });
                }
                keys
            }
            None => defaults.artifacts.collection_keys,
        };

        Ok(Self {
            port: parse_or(&lookup, "PORT", defaults.port)?,
            comfy_host: lookup("COMFY_HOST").unwrap_or(defaults.comfy_host),
            output_dir: lookup("COMFY_OUTPUT_DIR").map(PathBuf::from).unwrap_or(defaults.output_dir),
            workflow_dir: lookup("WORKFLOW_DIR").map(PathBuf::from),
            default_workflow: lookup("DEFAULT_WORKFLOW").unwrap_or(defaults.default_workflow),
            polling,
            readiness,
            refresh_worker: parse_flag(&lookup, "REFRESH_WORKER")?,
            limits: Limits {
                max_frames: parse_or(&lookup, "MAX_FRAMES", defaults.limits.max_frames)?,
                max_pixel_frames: parse_or(&lookup, "MAX_PIXEL_FRAMES", defaults.limits.max_pixel_frames)?,
            },
            artifacts: ArtifactSettings {
                collection_keys,
                preview_width: parse_or(&lookup, "PREVIEW_WIDTH", defaults.artifacts.preview_width)?,
                preview_height: parse_or(&lookup, "PREVIEW_HEIGHT", defaults.artifacts.preview_height)?,
                preview_quality: parse_or(&lookup, "PREVIEW_QUALITY", defaults.artifacts.preview_quality)?,
            },
        })
    }

    pub fn engine_base_url(&self) -> String {
        if self.comfy_host.starts_with("http://") || self.comfy_host.starts_with("https://") {
            self.comfy_host.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", self.comfy_host)
        }
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(var) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid { var, value: raw }),
        None => Ok(default),
    }
}

fn parse_flag(lookup: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<bool, ConfigError> {
    match lookup(var).as_deref().map(str::trim) {
        None | Some("") => Ok(false),
        Some(v) if v.eq_ignore_ascii_case("true") || v == "1" || v.eq_ignore_ascii_case("yes") => Ok(true),
        Some(v) if v.eq_ignore_ascii_case("false") || v == "0" || v.eq_ignore_ascii_case("no") => Ok(false),
        Some(v) => Err(ConfigError::Invalid { var, value: v.to_string() }),
    }
}
