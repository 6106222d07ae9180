use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_with::{serde_as, DisplayFromStr, PickFirst};

use crate::dimensions::GenerationDimensions;

pub const DEFAULT_TARGET_SIZE: u32 = 512;
pub const DEFAULT_NUM_FRAMES: u32 = 129;
pub const DEFAULT_FPS: f64 = 24.0;
pub const DEFAULT_INFERENCE_STEPS: u32 = 30;
pub const DEFAULT_GUIDANCE_SCALE: f64 = 6.0;
pub const DEFAULT_FLOW_SHIFT: f64 = 9.0;

/// Inbound generation request, as found under the job envelope's `input`.
///
/// `width`/`height` are accepted as older spellings of `target_width`/`target_height`.
#[serde_as]
#[derive(Debug, Clone, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: String,
    #[serde(default)]
    pub target_width: Option<u32>,
    #[serde(default)]
    pub target_height: Option<u32>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default = "default_num_frames")]
    pub num_frames: u32,
    #[serde(default = "default_fps")]
    pub fps: f64,
    #[serde(default = "default_inference_steps")]
    pub num_inference_steps: u32,
    #[serde(default = "default_guidance_scale")]
    pub guidance_scale: f64,
    #[serde(default = "default_flow_shift")]
    pub flow_shift: f64,
    // clients often send 64-bit seeds as strings
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    pub seed: Option<u64>,
    #[serde(default = "default_include_preview")]
    pub include_preview: bool,
    #[serde(default)]
    pub workflow: Option<String>,
}

fn default_num_frames() -> u32 { DEFAULT_NUM_FRAMES }
fn default_fps() -> f64 { DEFAULT_FPS }
fn default_inference_steps() -> u32 { DEFAULT_INFERENCE_STEPS }
fn default_guidance_scale() -> f64 { DEFAULT_GUIDANCE_SCALE }
fn default_flow_shift() -> f64 { DEFAULT_FLOW_SHIFT }
fn default_include_preview() -> bool { true }

impl GenerationRequest {
    /// Requested output size, preferring the `target_*` spelling.
    pub fn target_size(&self) -> (u32, u32) {
        let width = self.target_width.or(self.width).unwrap_or(DEFAULT_TARGET_SIZE);
        let height = self.target_height.or(self.height).unwrap_or(DEFAULT_TARGET_SIZE);
        (width, height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl From<GenerationDimensions> for Resolution {
    fn from(dims: GenerationDimensions) -> Self {
        Self { width: dims.width, height: dims.height }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationMetadata {
    pub prompt_id: String,
    pub workflow: String,
    pub seed: u64,
    pub fps: f64,
    pub num_frames: u32,
    pub resolution: Resolution,
    pub target_resolution: Resolution,
    /// Wall-clock seconds spent inside the handler.
    pub duration: f64,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOutput {
    pub base64_video: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base64_preview: Option<String>,
    pub metadata: GenerationMetadata,
}

/// Outbound response: always exactly one of the two shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GenerationResponse {
    Success(GenerationOutput),
    Error { error: String },
}

impl GenerationResponse {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error { error: message.into() }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

/// Job envelope delivered by the serverless harness.
#[derive(Debug, Clone, Deserialize)]
pub struct JobRequest {
    #[serde(default, deserialize_with = "string_or_number")]
    pub id: Option<String>,
    #[serde(default)]
    pub input: Option<serde_json::Value>,
}

/// Harness job ids are usually strings, but numeric ids are kept as their decimal text.
fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(Option::<RawId>::deserialize(deserializer)?.map(|raw| match raw {
        RawId::Text(id) => id,
        RawId::Number(id) => id.to_string(),
    }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub id: String,
    pub status: JobStatus,
    pub output: GenerationResponse,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_worker: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub engine_ready: bool,
    pub templates: Vec<String>,
}
