use std::collections::BTreeMap;
use std::path::Path;

use include_dir::{include_dir, Dir};
use tracing::info;

use crate::workflow::{TemplateError, WorkflowTemplate};

static BUILTIN_WORKFLOWS: Dir<'_> = include_dir!("$CARGO_MANIFEST_DIR/workflows");

const TEXTUAL_SUFFIX: &str = ".json.tmpl";
const STRUCTURED_SUFFIX: &str = ".json";

/// Workflow templates loaded once at startup, read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct TemplateStore {
    templates: BTreeMap<String, WorkflowTemplate>,
}

impl TemplateStore {
    /// Templates compiled into the binary.
    pub fn builtin() -> Result<Self, TemplateError> {
        let mut store = Self::default();
        for file in BUILTIN_WORKFLOWS.files() {
            let file_name = file.path().file_name().and_then(|n| n.to_str()).unwrap_or_default();
            let contents = file.contents_utf8().ok_or_else(|| TemplateError::Load {
                name: file_name.to_string(),
                reason: "not valid UTF-8".to_string(),
            })?;
            if let Some(template) = parse_template_file(file_name, contents)? {
                store.insert(template);
            }
        }
        Ok(store)
    }

    /// Built-in templates, overridden by same-named files in `dir`.
    pub fn load(dir: Option<&Path>) -> Result<Self, TemplateError> {
        let mut store = Self::builtin()?;
        if let Some(dir) = dir {
            store.load_dir(dir)?;
        }
        info!(templates = ?store.names(), "workflow templates loaded");
        Ok(store)
    }

    pub fn load_dir(&mut self, dir: &Path) -> Result<(), TemplateError> {
        let load_err = |reason: String| TemplateError::Load { name: dir.display().to_string(), reason };
        let entries = std::fs::read_dir(dir).map_err(|e| load_err(e.to_string()))?;
        for entry in entries {
            let path = entry.map_err(|e| load_err(e.to_string()))?.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !is_template_file(file_name) {
                continue;
            }
            let contents = std::fs::read_to_string(&path).map_err(|e| TemplateError::Load {
                name: path.display().to_string(),
                reason: e.to_string(),
            })?;
            if let Some(template) = parse_template_file(file_name, &contents)? {
                info!(name = template.name(), path = %path.display(), "loaded workflow template");
                self.insert(template);
            }
        }
        Ok(())
    }

    pub fn insert(&mut self, template: WorkflowTemplate) {
        self.templates.insert(template.name().to_string(), template);
    }

    pub fn get(&self, name: &str) -> Option<&WorkflowTemplate> {
        self.templates.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.templates.keys().cloned().collect()
    }
}

fn is_template_file(file_name: &str) -> bool {
    file_name.ends_with(TEXTUAL_SUFFIX) || file_name.ends_with(STRUCTURED_SUFFIX)
}

/// `name.json.tmpl` is kept as text, `name.json` is parsed now. Anything
/// else is ignored.
fn parse_template_file(file_name: &str, contents: &str) -> Result<Option<WorkflowTemplate>, TemplateError> {
    if let Some(name) = file_name.strip_suffix(TEXTUAL_SUFFIX) {
        return Ok(Some(WorkflowTemplate::textual(name, contents)));
    }
    if let Some(name) = file_name.strip_suffix(STRUCTURED_SUFFIX) {
        let graph = serde_json::from_str(contents).map_err(|e| TemplateError::Load {
            name: file_name.to_string(),
            reason: e.to_string(),
        })?;
        return WorkflowTemplate::structured(name, graph).map(Some);
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{Param, TemplateSource, WorkflowParams};

    #[test]
    fn builtin_templates_are_embedded() {
        let store = TemplateStore::builtin().unwrap();
        assert!(store.get("hunyuan_t2v").is_some());
        assert!(matches!(
            store.get("hunyuan_t2v_text").map(|t| t.source()),
            Some(TemplateSource::Textual(_))
        ));
    }

    #[test]
    fn builtin_templates_materialize() {
        let store = TemplateStore::builtin().unwrap();
        let params = WorkflowParams::new()
            .with(Param::Prompt, "p")
            .with(Param::NegativePrompt, "")
            .with(Param::Width, 544)
            .with(Param::Height, 304)
            .with(Param::TargetWidth, 1920)
            .with(Param::TargetHeight, 1080)
            .with(Param::NumFrames, 129)
            .with(Param::Fps, 24.0)
            .with(Param::Steps, 30)
            .with(Param::GuidanceScale, 6.0)
            .with(Param::FlowShift, 9.0)
            .with(Param::Seed, 1);
        for name in store.names() {
            let template = store.get(&name).unwrap();
            assert!(template.materialize(&params).is_ok(), "{name} failed to materialize");
        }
    }

    #[test]
    fn directory_overrides_builtin_by_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("hunyuan_t2v.json"),
            r#"{"3": {"class_type": "HyVideoSampler", "inputs": {"width": 8}}}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("custom.json.tmpl"), r#"{"1": {"inputs": {"p": "{{PROMPT}}"}}}"#).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let store = TemplateStore::load(Some(dir.path())).unwrap();
        match store.get("hunyuan_t2v").map(|t| t.source()) {
            Some(TemplateSource::Structured(graph)) => assert_eq!(graph["3"]["inputs"]["width"], 8),
            other => panic!("unexpected template: {other:?}"),
        }
        assert!(store.get("custom").is_some());
        assert!(store.get("notes").is_none());
    }

    #[test]
    fn invalid_structured_file_fails_loading() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.json"), "{not json").unwrap();
        assert!(matches!(
            TemplateStore::load(Some(dir.path())),
            Err(TemplateError::Load { .. })
        ));
    }
}
