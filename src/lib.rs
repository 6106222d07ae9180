//! Serverless text-to-video worker.
//!
//! A job input is validated, its resolution normalised, bound into a
//! HunyuanVideo workflow template and submitted to a ComfyUI engine. The
//! worker polls the engine's history until the video appears and returns it
//! base64-encoded, optionally with a recompressed preview frame.

pub mod artifact;
pub mod config;
pub mod dimensions;
pub mod engine;
pub mod error;
pub mod handler;
pub mod job;
pub mod models;
pub mod readiness;
pub mod retry;
pub mod routes;
pub mod templates;
pub mod workflow;

#[cfg(test)]
mod testing;

pub use config::WorkerConfig;
pub use engine::{EngineApi, EngineClient};
pub use error::WorkerError;
pub use handler::Orchestrator;
pub use templates::TemplateStore;
