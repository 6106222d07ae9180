use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::artifact::ArtifactPackager;
use crate::config::WorkerConfig;
use crate::dimensions::{normalize, validate_frames, GenerationDimensions};
use crate::engine::EngineApi;
use crate::error::WorkerError;
use crate::job::JobController;
use crate::models::{GenerationMetadata, GenerationOutput, GenerationRequest, GenerationResponse, Resolution};
use crate::readiness::await_ready;
use crate::templates::TemplateStore;
use crate::workflow::{Param, Workflow, WorkflowParams};

/// A validated request, bound into a workflow and ready to submit.
#[derive(Debug, Clone)]
pub struct PreparedJob {
    pub workflow_name: String,
    pub workflow: Workflow,
    pub dimensions: GenerationDimensions,
    pub target: Resolution,
    pub num_frames: u32,
    pub fps: f64,
    pub seed: u64,
    pub include_preview: bool,
}

/// Owns everything one worker instance needs to serve generation requests.
pub struct Orchestrator {
    config: WorkerConfig,
    templates: TemplateStore,
    engine: Arc<dyn EngineApi>,
    packager: ArtifactPackager,
    ready: AtomicBool,
    // one generation in flight per instance
    job_slot: Mutex<()>,
}

impl Orchestrator {
    pub fn new(config: WorkerConfig, templates: TemplateStore, engine: Arc<dyn EngineApi>) -> Self {
        let packager = ArtifactPackager::new(config.output_dir.clone(), config.artifacts.clone());
        Self {
            config,
            templates,
            engine,
            packager,
            ready: AtomicBool::new(false),
            job_slot: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn templates(&self) -> &TemplateStore {
        &self.templates
    }

    pub fn engine_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Entry point for one job input. Every failure becomes `{"error": ...}`.
    pub async fn handle(&self, input: &Value) -> GenerationResponse {
        let started = Instant::now();
        match self.generate(input, started).await {
            Ok(output) => GenerationResponse::Success(output),
            Err(e) => {
                error!(error = %e, "generation request failed");
                GenerationResponse::error(e.to_string())
            }
        }
    }

    async fn generate(&self, input: &Value, started: Instant) -> Result<GenerationOutput, WorkerError> {
        let job = self.prepare(input)?;

        let _slot = self.job_slot.lock().await;
        self.ensure_ready().await?;

        let controller = JobController::new(self.engine.as_ref(), self.config.polling);
        let (handle, outputs) = controller.run(&job.workflow).await?;
        let artifact = self.packager.package(&outputs, job.include_preview).await?;

        let duration = started.elapsed().as_secs_f64();
        info!(
            prompt_id = %handle,
            video = %artifact.video_path.display(),
            duration_secs = duration,
            video_b64_len = artifact.video_base64.len(),
            preview = artifact.preview_base64.is_some(),
            "generation finished"
        );

        Ok(GenerationOutput {
            base64_video: artifact.video_base64,
            base64_preview: artifact.preview_base64,
            metadata: GenerationMetadata {
                prompt_id: handle.to_string(),
                workflow: job.workflow_name,
                seed: job.seed,
                fps: job.fps,
                num_frames: job.num_frames,
                resolution: job.dimensions.into(),
                target_resolution: job.target,
                duration,
                completed_at: Utc::now(),
            },
        })
    }

    /// Validate and materialize without touching the engine.
    pub fn prepare(&self, input: &Value) -> Result<PreparedJob, WorkerError> {
        let Some(fields) = input.as_object() else {
            return Err(WorkerError::validation("Invalid input: expected a JSON object"));
        };
        if !fields.contains_key("prompt") {
            return Err(WorkerError::validation("Missing required parameter: prompt"));
        }
        let request: GenerationRequest = serde_json::from_value(input.clone())
            .map_err(|e| WorkerError::validation(format!("Invalid request: {e}")))?;

        if request.prompt.trim().is_empty() {
            return Err(WorkerError::validation("Prompt must not be empty"));
        }
        let (target_width, target_height) = request.target_size();
        if target_width == 0 || target_height == 0 {
            return Err(WorkerError::validation("Width and height must be greater than 0"));
        }
        if request.num_frames == 0 {
            return Err(WorkerError::validation("num_frames must be at least 1"));
        }
        if !(request.fps.is_finite() && request.fps > 0.0) {
            return Err(WorkerError::validation("fps must be greater than 0"));
        }
        if request.num_inference_steps == 0 {
            return Err(WorkerError::validation("num_inference_steps must be at least 1"));
        }
        if !request.guidance_scale.is_finite() || !request.flow_shift.is_finite() {
            return Err(WorkerError::validation("guidance_scale and flow_shift must be finite numbers"));
        }

        let limits = self.config.limits;
        let dimensions = normalize(target_width, target_height);
        let num_frames = match validate_frames(request.num_frames) {
            Some(n) if n <= limits.max_frames => n,
            _ => {
                return Err(WorkerError::validation(format!(
                    "Too many frames requested (max {})",
                    limits.max_frames
                )));
            }
        };
        let target_pixels = u64::from(target_width) * u64::from(target_height);
        let pixel_frames = dimensions.pixels().max(target_pixels).checked_mul(u64::from(num_frames));
        if pixel_frames.map_or(true, |total| total > limits.max_pixel_frames) {
            return Err(WorkerError::validation("Resolution too high"));
        }

        let workflow_name = request.workflow.clone().unwrap_or_else(|| self.config.default_workflow.clone());
        let template = self
            .templates
            .get(&workflow_name)
            .ok_or_else(|| WorkerError::validation(format!("Unknown workflow: {workflow_name}")))?;

        let seed = request.seed.unwrap_or_else(|| u64::from(rand::random::<u32>()));
        let params = WorkflowParams::new()
            .with(Param::Prompt, request.prompt.as_str())
            .with(Param::NegativePrompt, request.negative_prompt.as_str())
            .with(Param::Width, dimensions.width)
            .with(Param::Height, dimensions.height)
            .with(Param::TargetWidth, target_width)
            .with(Param::TargetHeight, target_height)
            .with(Param::NumFrames, num_frames)
            .with(Param::Fps, request.fps)
            .with(Param::Steps, request.num_inference_steps)
            .with(Param::GuidanceScale, request.guidance_scale)
            .with(Param::FlowShift, request.flow_shift)
            .with(Param::Seed, seed);
        let workflow = template.materialize(&params)?;

        info!(
            prompt = %truncate(&request.prompt, 80),
            workflow = %workflow_name,
            width = dimensions.width,
            height = dimensions.height,
            target_width,
            target_height,
            num_frames,
            seed,
            "request accepted"
        );

        Ok(PreparedJob {
            workflow_name,
            workflow,
            dimensions,
            target: Resolution { width: target_width, height: target_height },
            num_frames,
            fps: request.fps,
            seed,
            include_preview: request.include_preview,
        })
    }

    /// Probe the engine until it is ready; once it has been, never again.
    async fn ensure_ready(&self) -> Result<(), WorkerError> {
        if self.engine_ready() {
            return Ok(());
        }
        if await_ready(self.engine.as_ref(), self.config.readiness).await {
            self.ready.store(true, Ordering::Release);
            Ok(())
        } else {
            Err(WorkerError::ReadinessTimeout)
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{completed_entry, FakeEngine, HistoryReply};
    use crate::retry::RetryPolicy;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    fn config(output_dir: &std::path::Path) -> WorkerConfig {
        WorkerConfig {
            output_dir: output_dir.to_path_buf(),
            polling: RetryPolicy::new(Duration::from_millis(1), 5),
            readiness: RetryPolicy::new(Duration::from_millis(1), 3),
            ..WorkerConfig::default()
        }
    }

    fn orchestrator(engine: Arc<FakeEngine>, output_dir: &std::path::Path) -> Orchestrator {
        Orchestrator::new(config(output_dir), TemplateStore::builtin().unwrap(), engine)
    }

    #[tokio::test]
    async fn missing_prompt_never_reaches_engine() {
        let engine = Arc::new(FakeEngine::default());
        let orch = orchestrator(engine.clone(), std::path::Path::new("/nonexistent"));
        let response = orch.handle(&json!({"target_width": 640})).await;
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({"error": "Missing required parameter: prompt"})
        );
        assert_eq!(FakeEngine::count(&engine.alive_calls), 0);
        assert_eq!(FakeEngine::count(&engine.submit_calls), 0);
    }

    #[test]
    fn prepare_rejects_out_of_range_fields() {
        let orch = orchestrator(Arc::new(FakeEngine::default()), std::path::Path::new("/x"));
        let cases = [
            (json!({"prompt": "  "}), "Prompt must not be empty"),
            (json!({"prompt": "p", "width": 0}), "Width and height must be greater than 0"),
            (json!({"prompt": "p", "num_frames": 0}), "num_frames must be at least 1"),
            (json!({"prompt": "p", "num_frames": 200}), "Too many frames requested (max 129)"),
            (json!({"prompt": "p", "fps": 0}), "fps must be greater than 0"),
            (json!({"prompt": "p", "num_inference_steps": 0}), "num_inference_steps must be at least 1"),
            (json!({"prompt": "p", "target_width": 3840, "target_height": 2160}), "Resolution too high"),
            (json!({"prompt": "p", "workflow": "nope"}), "Unknown workflow: nope"),
            (json!({"prompt": "p", "num_frames": 4294967295u32}), "Too many frames requested (max 129)"),
            (
                json!({"prompt": "p", "target_width": 4294967295u32, "target_height": 4294967295u32}),
                "Resolution too high",
            ),
        ];
        for (input, expected) in cases {
            let err = orch.prepare(&input).unwrap_err();
            assert_eq!(err.to_string(), expected, "input {input}");
        }
        let err = orch.prepare(&json!({"prompt": "p", "width": "wide"})).unwrap_err();
        assert!(err.to_string().starts_with("Invalid request:"));
        let err = orch.prepare(&json!(["prompt"])).unwrap_err();
        assert_eq!(err.to_string(), "Invalid input: expected a JSON object");
    }

    #[test]
    fn ceilings_hold_without_overflow_when_limits_are_lifted() {
        let mut config = config(std::path::Path::new("/x"));
        config.limits = crate::config::Limits { max_frames: u32::MAX, max_pixel_frames: u64::MAX };
        let orch = Orchestrator::new(config, TemplateStore::builtin().unwrap(), Arc::new(FakeEngine::default()));

        let err = orch.prepare(&json!({"prompt": "p", "num_frames": 4294967295u32})).unwrap_err();
        assert_eq!(err.to_string(), format!("Too many frames requested (max {})", u32::MAX));

        let huge = json!({
            "prompt": "p", "target_width": 4294967295u32, "target_height": 4294967295u32, "num_frames": 5
        });
        assert_eq!(orch.prepare(&huge).unwrap_err().to_string(), "Resolution too high");

        let job = orch.prepare(&json!({"prompt": "p", "num_frames": 4294967293u32})).unwrap();
        assert_eq!(job.num_frames, 4294967293);
    }

    #[test]
    fn prepare_normalizes_and_binds() {
        let orch = orchestrator(Arc::new(FakeEngine::default()), std::path::Path::new("/x"));
        let job = orch
            .prepare(&json!({
                "prompt": "a fox in snow", "target_width": 1920, "target_height": 1080,
                "num_frames": 16, "seed": 99
            }))
            .unwrap();
        assert_eq!(job.num_frames, 17);
        assert_eq!(job.seed, 99);
        assert_eq!(job.dimensions.width % 8, 0);
        assert_eq!(job.dimensions.height % 8, 0);
        assert!(job.dimensions.pixels() >= 163_840);
        assert!(job.dimensions.width > job.dimensions.height);
        assert_eq!(job.target, Resolution { width: 1920, height: 1080 });

        let graph = job.workflow.as_value();
        assert_eq!(graph["30"]["inputs"]["prompt"], json!("a fox in snow"));
        assert_eq!(graph["3"]["inputs"]["width"], json!(job.dimensions.width));
        assert_eq!(graph["3"]["inputs"]["height"], json!(job.dimensions.height));
        assert_eq!(graph["3"]["inputs"]["num_frames"], json!(17));
        assert_eq!(graph["3"]["inputs"]["seed"], json!(99));
    }

    #[tokio::test]
    async fn full_run_returns_video_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("HunyuanVideo_00001.mp4"), b"mp4").unwrap();
        let engine = Arc::new(FakeEngine::with_history([
            HistoryReply::Missing,
            HistoryReply::Entry(completed_entry("videos", "HunyuanVideo_00001.mp4")),
        ]));
        let orch = orchestrator(engine.clone(), dir.path());

        let response = orch.handle(&json!({"prompt": "a fox in snow", "seed": "5"})).await;
        let output = match response {
            GenerationResponse::Success(output) => output,
            other => panic!("expected success, got {other:?}"),
        };
        assert_eq!(output.base64_video, "bXA0");
        assert!(output.base64_preview.is_none());
        assert_eq!(output.metadata.prompt_id, "job-1");
        assert_eq!(output.metadata.seed, 5);
        assert_eq!(output.metadata.workflow, "hunyuan_t2v");
        assert_eq!(output.metadata.resolution, Resolution { width: 408, height: 408 });
        assert!(orch.engine_ready());
        assert_eq!(engine.submitted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn readiness_is_probed_only_until_it_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine::default());
        let orch = orchestrator(engine.clone(), dir.path());
        for _ in 0..2 {
            let response = orch.handle(&json!({"prompt": "p"})).await;
            assert_eq!(response, GenerationResponse::error("Timeout waiting for video generation"));
        }
        assert_eq!(FakeEngine::count(&engine.alive_calls), 1);
        assert_eq!(FakeEngine::count(&engine.probe_calls), 1);
        assert_eq!(FakeEngine::count(&engine.submit_calls), 2);
        assert_eq!(FakeEngine::count(&engine.history_calls), 10);
    }

    #[tokio::test]
    async fn unreachable_engine_is_reported() {
        let engine = Arc::new(FakeEngine { dead_for: u32::MAX, ..FakeEngine::default() });
        let orch = orchestrator(engine.clone(), std::path::Path::new("/x"));
        let response = orch.handle(&json!({"prompt": "p"})).await;
        assert_eq!(response, GenerationResponse::error("ComfyUI API is not reachable"));
        assert!(!orch.engine_ready());
        assert_eq!(FakeEngine::count(&engine.submit_calls), 0);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé…");
        assert_eq!(truncate("short", 80), "short");
    }
}
