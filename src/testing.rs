//! In-memory engine used by unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::engine::{EngineApi, EngineError, HistoryEntry, JobHandle};
use crate::workflow::Workflow;

pub(crate) enum HistoryReply {
    Missing,
    Entry(Value),
    Fail,
}

#[derive(Default)]
pub(crate) struct FakeEngine {
    /// `check_alive` fails for this many calls before succeeding.
    pub dead_for: u32,
    /// `probe_prompt_endpoint` reports not-ready for this many calls.
    pub warming_for: u32,
    pub reject_submit: bool,
    pub history: Mutex<VecDeque<HistoryReply>>,
    pub submitted: Mutex<Vec<Value>>,
    pub alive_calls: AtomicU32,
    pub probe_calls: AtomicU32,
    pub submit_calls: AtomicU32,
    pub history_calls: AtomicU32,
}

impl FakeEngine {
    pub fn with_history(replies: impl IntoIterator<Item = HistoryReply>) -> Self {
        Self {
            history: Mutex::new(replies.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn count(counter: &AtomicU32) -> u32 {
        counter.load(Ordering::SeqCst)
    }
}

/// History entry for a finished job with one video under `key`.
pub(crate) fn completed_entry(key: &str, filename: &str) -> Value {
    json!({
        "outputs": {
            "34": { key: [{"filename": filename, "subfolder": "", "type": "output", "format": "video/h264-mp4"}] }
        },
        "status": {"status_str": "success", "completed": true, "messages": []}
    })
}

#[async_trait]
impl EngineApi for FakeEngine {
    async fn check_alive(&self) -> Result<(), EngineError> {
        let n = self.alive_calls.fetch_add(1, Ordering::SeqCst);
        if n < self.dead_for {
            Err(EngineError::Malformed("connection refused".into()))
        } else {
            Ok(())
        }
    }

    async fn probe_prompt_endpoint(&self) -> Result<bool, EngineError> {
        let n = self.probe_calls.fetch_add(1, Ordering::SeqCst);
        Ok(n >= self.warming_for)
    }

    async fn submit(&self, workflow: &Workflow) -> Result<JobHandle, EngineError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        if self.reject_submit {
            return Err(EngineError::Api { status: 400, body: "invalid prompt".into() });
        }
        self.submitted.lock().unwrap().push(workflow.as_value().clone());
        Ok(JobHandle::new("job-1"))
    }

    async fn history(&self, _handle: &JobHandle) -> Result<Option<HistoryEntry>, EngineError> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        let reply = self.history.lock().unwrap().pop_front().unwrap_or(HistoryReply::Missing);
        match reply {
            HistoryReply::Missing => Ok(None),
            HistoryReply::Entry(value) => Ok(Some(serde_json::from_value(value).unwrap())),
            HistoryReply::Fail => Err(EngineError::Api { status: 502, body: "bad gateway".into() }),
        }
    }
}
