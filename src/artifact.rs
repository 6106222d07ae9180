use std::io::{Cursor, ErrorKind};
use std::path::{Component, Path, PathBuf};

use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;
use tracing::{info, warn};

use crate::config::ArtifactSettings;
use crate::engine::{ArtifactReference, Outputs};
use crate::error::WorkerError;

/// Produced files, ready for the response body.
#[derive(Debug, Clone)]
pub struct EncodedArtifact {
    pub video_path: PathBuf,
    pub video_base64: String,
    pub preview_base64: Option<String>,
}

pub struct ArtifactPackager {
    output_root: PathBuf,
    settings: ArtifactSettings,
}

impl ArtifactPackager {
    pub fn new(output_root: impl Into<PathBuf>, settings: ArtifactSettings) -> Self {
        Self { output_root: output_root.into(), settings }
    }

    /// First reference under the first configured collection key, scanning
    /// node outputs in node-id order.
    pub fn find_video(&self, outputs: &Outputs) -> Option<ArtifactReference> {
        self.settings.collection_keys.iter().find_map(|key| {
            outputs.values().find_map(|node| {
                let first = node.get(key)?.as_array()?.first()?.clone();
                match serde_json::from_value::<ArtifactReference>(first) {
                    Ok(reference) => Some(reference),
                    Err(e) => {
                        warn!(key = %key, error = %e, "ignoring malformed artifact entry");
                        None
                    }
                }
            })
        })
    }

    /// `<root>/<subfolder>/<filename>`; references that try to leave the
    /// output root resolve to nothing.
    pub fn resolve(&self, subfolder: &str, filename: &str) -> Option<PathBuf> {
        let relative = Path::new(subfolder).join(filename);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes || filename.is_empty() {
            return None;
        }
        Some(self.output_root.join(relative))
    }

    pub async fn package(&self, outputs: &Outputs, include_preview: bool) -> Result<EncodedArtifact, WorkerError> {
        let reference = self.find_video(outputs).ok_or_else(|| {
            WorkerError::ArtifactNotFound(format!(
                "no {} entry in job outputs",
                self.settings.collection_keys.join("/")
            ))
        })?;
        let video_path = self
            .resolve(&reference.subfolder, &reference.filename)
            .ok_or_else(|| WorkerError::ArtifactNotFound(format!("{}/{}", reference.subfolder, reference.filename)))?;

        let video = match tokio::fs::read(&video_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(WorkerError::ArtifactNotFound(video_path.display().to_string()));
            }
            Err(e) => {
                return Err(WorkerError::Internal(format!("failed to read {}: {e}", video_path.display())));
            }
        };
        info!(
            path = %video_path.display(),
            bytes = video.len(),
            format = reference.format.as_deref().unwrap_or("unknown"),
            folder = reference.folder_type.as_deref().unwrap_or("output"),
            "video artifact loaded"
        );

        let preview_base64 = if include_preview {
            self.load_preview(&reference).await.map(|bytes| encode_base64(&bytes))
        } else {
            None
        };

        Ok(EncodedArtifact {
            video_base64: encode_base64(&video),
            preview_base64,
            video_path,
        })
    }

    /// The preview is best-effort: any problem is logged and the response
    /// simply goes without it.
    async fn load_preview(&self, reference: &ArtifactReference) -> Option<Vec<u8>> {
        let name = reference.workflow.as_deref()?;
        let path = self.resolve(&reference.subfolder, name)?;
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "preview image unavailable");
                return None;
            }
        };
        match recompress_preview(&raw, &self.settings) {
            Ok(jpeg) => {
                info!(path = %path.display(), bytes = jpeg.len(), "preview recompressed");
                Some(jpeg)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "preview image could not be decoded");
                None
            }
        }
    }
}

/// Fit the image inside the configured box and re-encode it as JPEG.
pub fn recompress_preview(raw: &[u8], settings: &ArtifactSettings) -> Result<Vec<u8>, image::ImageError> {
    let image = image::load_from_memory(raw)?;
    let resized = image.resize(settings.preview_width, settings.preview_height, FilterType::Lanczos3);
    let rgb = DynamicImage::ImageRgb8(resized.to_rgb8());
    let mut buf = Cursor::new(Vec::new());
    rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut buf, settings.preview_quality))?;
    Ok(buf.into_inner())
}

pub fn encode_base64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}
