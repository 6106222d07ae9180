//! HTTP client for the ComfyUI inference engine.
//!
//! Only the endpoints the worker needs: liveness (`GET /`), submission
//! (`POST /prompt`) and execution history (`GET /history/{prompt_id}`).

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::workflow::Workflow;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Error `type` the engine reports for a graph with nothing to execute. Seeing
/// it means the prompt endpoint is fully initialised.
pub const NO_OUTPUTS_MARKER: &str = "prompt_no_outputs";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("ComfyUI API error ({status}): {body}")]
    Api { status: u16, body: String },
    #[error("unexpected response: {0}")]
    Malformed(String),
}

/// Identifier the engine assigns to a submitted graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobHandle(String);

impl JobHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One node's outputs, keyed by collection (`videos`, `gifs`, `images`, ...).
pub type NodeOutput = BTreeMap<String, Value>;

/// Outputs of a finished job, keyed by node id.
pub type Outputs = BTreeMap<String, NodeOutput>;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryEntry {
    #[serde(default)]
    pub outputs: Option<Outputs>,
    #[serde(default)]
    pub status: Option<HistoryStatus>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryStatus {
    #[serde(default)]
    pub status_str: Option<String>,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub messages: Vec<Value>,
}

impl HistoryStatus {
    pub fn is_error(&self) -> bool {
        self.status_str.as_deref() == Some("error")
    }

    /// The engine's exception message, from an `["execution_error", {..}]` entry.
    pub fn error_message(&self) -> String {
        self.messages
            .iter()
            .filter_map(Value::as_array)
            .filter(|m| m.first().and_then(Value::as_str) == Some("execution_error"))
            .filter_map(|m| m.get(1))
            .map(|details| {
                let node = details.get("node_type").and_then(Value::as_str).unwrap_or("unknown node");
                let message = details.get("exception_message").and_then(Value::as_str).unwrap_or("no message");
                format!("{node}: {}", message.trim())
            })
            .next()
            .unwrap_or_else(|| "engine reported an execution error".to_string())
    }
}

/// Descriptor of a file the engine wrote to its output area.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ArtifactReference {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(default, rename = "type")]
    pub folder_type: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
    /// Preview image saved alongside a video, when the combine node wrote one.
    #[serde(default)]
    pub workflow: Option<String>,
}

/// Operations the worker needs from the engine.
#[async_trait]
pub trait EngineApi: Send + Sync {
    /// Liveness: the HTTP server answers at all.
    async fn check_alive(&self) -> Result<(), EngineError>;

    /// Functional readiness: an empty graph is rejected with the
    /// "no outputs" marker rather than a startup error.
    async fn probe_prompt_endpoint(&self) -> Result<bool, EngineError>;

    async fn submit(&self, workflow: &Workflow) -> Result<JobHandle, EngineError>;

    /// `None` while the engine has no history entry for the job.
    async fn history(&self, handle: &JobHandle) -> Result<Option<HistoryEntry>, EngineError>;
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    #[serde(default)]
    prompt_id: Option<String>,
}

pub struct EngineClient {
    client: Client,
    base_url: String,
    client_id: String,
}

impl EngineClient {
    /// `base_url` is the engine root, e.g. `http://127.0.0.1:8188`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            client_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, EngineError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(EngineError::Api { status: status.as_u16(), body });
        }
        Ok(response)
    }
}

#[async_trait]
impl EngineApi for EngineClient {
    async fn check_alive(&self) -> Result<(), EngineError> {
        let response = self.client.get(&self.base_url).timeout(PROBE_TIMEOUT).send().await?;
        Self::ensure_success(response).await?;
        Ok(())
    }

    async fn probe_prompt_endpoint(&self) -> Result<bool, EngineError> {
        let response = self
            .client
            .post(format!("{}/prompt", self.base_url))
            .timeout(PROBE_TIMEOUT)
            .json(&json!({ "prompt": {} }))
            .send()
            .await?;
        let status = response.status();
        let body: Value = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                debug!(%status, error = %e, "prompt endpoint answered without JSON");
                return Ok(false);
            }
        };
        Ok(body.pointer("/error/type").and_then(Value::as_str) == Some(NO_OUTPUTS_MARKER))
    }

    async fn submit(&self, workflow: &Workflow) -> Result<JobHandle, EngineError> {
        let body = json!({
            "prompt": workflow.as_value(),
            "client_id": self.client_id,
        });
        let response = self
            .client
            .post(format!("{}/prompt", self.base_url))
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await?;
        let response = Self::ensure_success(response).await?;
        let text = response.text().await?;
        let parsed: SubmitResponse =
            serde_json::from_str(&text).map_err(|e| EngineError::Malformed(format!("{e}: {text}")))?;
        match parsed.prompt_id {
            Some(id) if !id.is_empty() => {
                info!(prompt_id = %id, "workflow queued");
                Ok(JobHandle(id))
            }
            _ => Err(EngineError::Malformed(format!("no prompt_id in response: {text}"))),
        }
    }

    async fn history(&self, handle: &JobHandle) -> Result<Option<HistoryEntry>, EngineError> {
        let response = self
            .client
            .get(format!("{}/history/{}", self.base_url, handle))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        let response = Self::ensure_success(response).await?;
        let mut entries: HashMap<String, HistoryEntry> = response
            .json()
            .await
            .map_err(|e| EngineError::Malformed(e.to_string()))?;
        Ok(entries.remove(handle.as_str()))
    }
}
