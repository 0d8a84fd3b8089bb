use async_trait::async_trait;
use intake_storage::ManifestRecord;
use serde::Deserialize;

use super::{FunnelDefinition, FunnelDefinitionSource, FunnelSource, StepDescriptor, StepKind};
use crate::error::EngineError;

#[derive(Debug, Deserialize)]
struct ManifestDocument {
    steps: Vec<ManifestStep>,
}

#[derive(Debug, Deserialize)]
struct ManifestStep {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    questions: Vec<ManifestQuestion>,
}

#[derive(Debug, Deserialize)]
struct ManifestQuestion {
    id: String,
    #[serde(default = "default_required")]
    required: bool,
}

fn default_required() -> bool {
    true
}

/// Reads a funnel from one version of its manifest document.
pub struct ManifestSource {
    manifest: ManifestRecord,
}

impl ManifestSource {
    pub fn new(manifest: ManifestRecord) -> Self {
        Self { manifest }
    }
}

#[async_trait]
impl FunnelDefinitionSource for ManifestSource {
    fn source(&self) -> FunnelSource {
        FunnelSource::Manifest {
            version: self.manifest.version,
        }
    }

    async fn load(&self) -> Result<FunnelDefinition, EngineError> {
        let slug = self.manifest.funnel_slug.as_str();
        let not_configured = |reason: String| EngineError::FunnelNotConfigured {
            slug: slug.to_string(),
            reason,
        };

        let document: ManifestDocument =
            serde_json::from_value(self.manifest.document.clone()).map_err(|e| {
                not_configured(format!(
                    "manifest version {} is malformed: {e}",
                    self.manifest.version
                ))
            })?;

        let mut steps = Vec::with_capacity(document.steps.len());
        for step in document.steps {
            let kind: StepKind = step.kind.parse().map_err(not_configured)?;
            steps.push(StepDescriptor {
                order_index: 0,
                kind,
                question_ids: step.questions.iter().map(|q| q.id.clone()).collect(),
                required_question_ids: step
                    .questions
                    .iter()
                    .filter(|q| q.required)
                    .map(|q| q.id.clone())
                    .collect(),
                id: step.id,
            });
        }

        tracing::debug!(
            slug,
            version = self.manifest.version,
            steps = steps.len(),
            "loaded funnel manifest"
        );
        FunnelDefinition::from_parts(slug, self.source(), steps)
    }
}
