//! Funnel seed files: authored funnel content loaded into the in-memory
//! backend at startup.
//!
//! ```json
//! {
//!   "legacy_funnels": [
//!     {"id": "f-sleep", "slug": "sleep", "steps": [
//!       {"id": "intro", "order_index": 1, "type": "info"},
//!       {"id": "hours", "order_index": 2, "type": "question",
//!        "questions": [{"id": "q-hours", "required": true}]}
//!     ]}
//!   ],
//!   "manifests": [
//!     {"funnel_slug": "stress", "version": 1, "document": {"steps": []}}
//!   ]
//! }
//! ```

use std::path::Path;

use intake_storage::{
    LegacyFunnelRow, LegacyQuestionRow, LegacyStepRow, ManifestRecord, MemoryStorage,
};
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
pub(crate) struct SeedFile {
    #[serde(default)]
    pub(crate) legacy_funnels: Vec<LegacyFunnelSeed>,
    #[serde(default)]
    pub(crate) manifests: Vec<ManifestRecord>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LegacyFunnelSeed {
    id: String,
    slug: String,
    #[serde(default)]
    steps: Vec<LegacyStepSeed>,
}

#[derive(Debug, Deserialize)]
struct LegacyStepSeed {
    id: String,
    order_index: i32,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    questions: Vec<LegacyQuestionSeed>,
}

#[derive(Debug, Deserialize)]
struct LegacyQuestionSeed {
    id: String,
    #[serde(default = "default_required")]
    required: bool,
}

fn default_required() -> bool {
    true
}

impl SeedFile {
    pub(crate) fn from_path(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        serde_json::from_str(&text)
            .map_err(|e| format!("invalid seed file {}: {}", path.display(), e))
    }

    /// Load every funnel into `storage`. Legacy question order follows the
    /// order questions are listed under their step.
    pub(crate) fn load_into(self, storage: &MemoryStorage) -> SeedSummary {
        let summary = SeedSummary {
            legacy_funnels: self.legacy_funnels.len(),
            manifests: self.manifests.len(),
        };

        for funnel in self.legacy_funnels {
            let mut steps = Vec::with_capacity(funnel.steps.len());
            let mut questions = Vec::new();
            for step in funnel.steps {
                for (position, question) in step.questions.into_iter().enumerate() {
                    questions.push(LegacyQuestionRow {
                        id: question.id,
                        step_id: step.id.clone(),
                        required: question.required,
                        order_index: i32::try_from(position).unwrap_or(i32::MAX),
                    });
                }
                steps.push(LegacyStepRow {
                    id: step.id,
                    funnel_id: funnel.id.clone(),
                    order_index: step.order_index,
                    kind: step.kind,
                    title: step.title,
                });
            }
            storage.add_legacy_funnel(
                LegacyFunnelRow {
                    id: funnel.id,
                    slug: funnel.slug,
                },
                steps,
                questions,
            );
        }
        for manifest in self.manifests {
            storage.add_manifest(manifest);
        }
        summary
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SeedSummary {
    pub(crate) legacy_funnels: usize,
    pub(crate) manifests: usize,
}

/// Build a backend holding the funnels of `path`, or an empty one.
pub(crate) fn load_storage(path: Option<&Path>) -> Result<MemoryStorage, String> {
    let storage = MemoryStorage::new();
    match path {
        Some(path) => {
            let summary = SeedFile::from_path(path)?.load_into(&storage);
            tracing::info!(
                path = %path.display(),
                legacy_funnels = summary.legacy_funnels,
                manifests = summary.manifests,
                "loaded funnel seed"
            );
        }
        None => tracing::warn!("no funnel seed given; every funnel lookup will fail"),
    }
    Ok(storage)
}
