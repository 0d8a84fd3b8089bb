//! Funnel Definition Resolver.
//!
//! Funnels are authored in one of two shapes: a legacy relational step graph
//! (`funnels` / `funnel_steps` / `step_questions`) or a single versioned
//! manifest document. [`FunnelResolver`] performs one existence check up
//! front, picks the matching [`FunnelDefinitionSource`], and hands callers a
//! normalized [`FunnelDefinition`]. Nothing downstream branches on the shape.

mod legacy;
mod manifest;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use intake_storage::{AssessmentRecord, FunnelContentStore};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

pub use legacy::LegacyGraphSource;
pub use manifest::ManifestSource;

/// Step type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Question,
    Info,
    Content,
    Summary,
}

impl FromStr for StepKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "question" | "question_step" => Ok(StepKind::Question),
            "info" | "informational" => Ok(StepKind::Info),
            "content" | "content_page" => Ok(StepKind::Content),
            "summary" => Ok(StepKind::Summary),
            other => Err(format!("unknown step type '{other}'")),
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepKind::Question => "question",
            StepKind::Info => "info",
            StepKind::Content => "content",
            StepKind::Summary => "summary",
        };
        f.write_str(s)
    }
}

/// One normalized step. `order_index` is the 0-based position in the funnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDescriptor {
    pub id: String,
    pub order_index: usize,
    pub kind: StepKind,
    /// Every question shown on the step, in display order.
    pub question_ids: Vec<String>,
    /// The subset of `question_ids` that must be answered to advance.
    pub required_question_ids: Vec<String>,
}

/// Where a definition was loaded from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum FunnelSource {
    Legacy { funnel_id: String },
    Manifest { version: i64 },
}

impl FunnelSource {
    /// The value stored in `assessments.legacy_funnel_id`.
    pub fn legacy_funnel_id(&self) -> Option<&str> {
        match self {
            FunnelSource::Legacy { funnel_id } => Some(funnel_id),
            FunnelSource::Manifest { .. } => None,
        }
    }
}

/// A funnel's ordered steps, independent of how they were stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunnelDefinition {
    pub slug: String,
    pub source: FunnelSource,
    pub steps: Vec<StepDescriptor>,
}

impl FunnelDefinition {
    pub fn step(&self, step_id: &str) -> Option<&StepDescriptor> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn index_of(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == step_id)
    }

    /// The step following `step_id` in order, if any.
    pub fn after(&self, step_id: &str) -> Option<&StepDescriptor> {
        self.index_of(step_id).and_then(|i| self.steps.get(i + 1))
    }

    pub fn first(&self) -> &StepDescriptor {
        &self.steps[0]
    }

    pub fn last(&self) -> &StepDescriptor {
        &self.steps[self.steps.len() - 1]
    }

    /// Whether any step of the funnel shows `question_id`.
    pub fn contains_question(&self, question_id: &str) -> bool {
        self.steps
            .iter()
            .any(|s| s.question_ids.iter().any(|q| q == question_id))
    }

    /// Build a definition from raw steps, enforcing the shared invariants:
    /// at least one step, unique step ids, unique question ids within the
    /// funnel, and required questions drawn from the step's own questions.
    /// Order indices are rewritten to be contiguous from 0.
    pub(crate) fn from_parts(
        slug: &str,
        source: FunnelSource,
        mut steps: Vec<StepDescriptor>,
    ) -> Result<Self, EngineError> {
        let not_configured = |reason: String| EngineError::FunnelNotConfigured {
            slug: slug.to_string(),
            reason,
        };

        if steps.is_empty() {
            return Err(not_configured("funnel has no steps".to_string()));
        }

        let mut seen_steps = std::collections::HashSet::new();
        let mut seen_questions = std::collections::HashSet::new();
        for (index, step) in steps.iter_mut().enumerate() {
            if step.id.is_empty() {
                return Err(not_configured(format!("step at position {index} has no id")));
            }
            if !seen_steps.insert(step.id.clone()) {
                return Err(not_configured(format!("duplicate step id '{}'", step.id)));
            }
            for question in &step.question_ids {
                if !seen_questions.insert(question.clone()) {
                    return Err(not_configured(format!(
                        "question '{question}' appears on more than one step"
                    )));
                }
            }
            if let Some(stray) = step
                .required_question_ids
                .iter()
                .find(|q| !step.question_ids.contains(q))
            {
                return Err(not_configured(format!(
                    "step '{}' requires '{stray}' which it does not show",
                    step.id
                )));
            }
            step.order_index = index;
        }

        Ok(Self {
            slug: slug.to_string(),
            source,
            steps,
        })
    }
}

/// One concrete storage shape a definition can be read from.
#[async_trait]
pub trait FunnelDefinitionSource: Send + Sync {
    /// Which shape this source reads.
    fn source(&self) -> FunnelSource;

    /// Load and normalize the definition.
    async fn load(&self) -> Result<FunnelDefinition, EngineError>;
}

/// Resolves funnel slugs (or an assessment's funnel reference) to normalized
/// definitions.
pub struct FunnelResolver<'a, C: ?Sized> {
    content: &'a C,
}

impl<'a, C> FunnelResolver<'a, C>
where
    C: FunnelContentStore + ?Sized,
{
    pub fn new(content: &'a C) -> Self {
        Self { content }
    }

    /// The single upfront existence check: legacy graph first, then manifest.
    pub async fn locate(
        &self,
        slug: &str,
    ) -> Result<Box<dyn FunnelDefinitionSource + 'a>, EngineError> {
        if let Some(funnel) = self.content.find_legacy_funnel(slug).await? {
            return Ok(Box::new(LegacyGraphSource::new(self.content, funnel)));
        }
        if let Some(manifest) = self.content.latest_manifest(slug).await? {
            return Ok(Box::new(ManifestSource::new(manifest)));
        }
        Err(EngineError::FunnelNotFound {
            slug: slug.to_string(),
        })
    }

    pub async fn resolve(&self, slug: &str) -> Result<FunnelDefinition, EngineError> {
        self.locate(slug).await?.load().await
    }

    /// Resolve the funnel an existing assessment runs on. The legacy foreign
    /// key, when present, wins over the slug.
    pub async fn resolve_for(
        &self,
        assessment: &AssessmentRecord,
    ) -> Result<FunnelDefinition, EngineError> {
        let source: Box<dyn FunnelDefinitionSource + 'a> = match &assessment.legacy_funnel_id {
            Some(funnel_id) => {
                let funnel = self.content.get_legacy_funnel(funnel_id).await?.ok_or_else(
                    || EngineError::FunnelNotFound {
                        slug: assessment.funnel_slug.clone(),
                    },
                )?;
                Box::new(LegacyGraphSource::new(self.content, funnel))
            }
            None => {
                let manifest = self
                    .content
                    .latest_manifest(&assessment.funnel_slug)
                    .await?
                    .ok_or_else(|| EngineError::FunnelNotFound {
                        slug: assessment.funnel_slug.clone(),
                    })?;
                Box::new(ManifestSource::new(manifest))
            }
        };
        source.load().await
    }

    /// Slug of the funnel owning `step_id`, if any funnel does.
    pub async fn owner_of_step(&self, step_id: &str) -> Result<Option<String>, EngineError> {
        Ok(self.content.locate_step(step_id).await?)
    }
}
