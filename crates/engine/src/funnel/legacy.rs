use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use intake_storage::{FunnelContentStore, LegacyFunnelRow, LegacyQuestionRow};

use super::{FunnelDefinition, FunnelDefinitionSource, FunnelSource, StepDescriptor, StepKind};
use crate::error::EngineError;

/// Reads a funnel from the relational `funnels` / `funnel_steps` /
/// `step_questions` layout.
pub struct LegacyGraphSource<'a, C: ?Sized> {
    content: &'a C,
    funnel: LegacyFunnelRow,
}

impl<'a, C: ?Sized> LegacyGraphSource<'a, C> {
    pub fn new(content: &'a C, funnel: LegacyFunnelRow) -> Self {
        Self { content, funnel }
    }
}

#[async_trait]
impl<'a, C> FunnelDefinitionSource for LegacyGraphSource<'a, C>
where
    C: FunnelContentStore + ?Sized,
{
    fn source(&self) -> FunnelSource {
        FunnelSource::Legacy {
            funnel_id: self.funnel.id.clone(),
        }
    }

    async fn load(&self) -> Result<FunnelDefinition, EngineError> {
        let slug = self.funnel.slug.as_str();
        let not_configured = |reason: String| EngineError::FunnelNotConfigured {
            slug: slug.to_string(),
            reason,
        };

        let mut rows = self.content.list_legacy_steps(&self.funnel.id).await?;
        rows.sort_by_key(|r| r.order_index);

        let mut seen_order = HashSet::new();
        for row in &rows {
            if !seen_order.insert(row.order_index) {
                return Err(not_configured(format!(
                    "order index {} is used by more than one step",
                    row.order_index
                )));
            }
        }

        let step_ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
        let mut by_step: HashMap<String, Vec<LegacyQuestionRow>> = HashMap::new();
        for question in self.content.list_legacy_questions(&step_ids).await? {
            by_step
                .entry(question.step_id.clone())
                .or_default()
                .push(question);
        }

        let mut steps = Vec::with_capacity(rows.len());
        for row in rows {
            let kind: StepKind = row.kind.parse().map_err(not_configured)?;
            let mut questions = by_step.remove(&row.id).unwrap_or_default();
            questions.sort_by_key(|q| q.order_index);
            steps.push(StepDescriptor {
                order_index: 0,
                kind,
                question_ids: questions.iter().map(|q| q.id.clone()).collect(),
                required_question_ids: questions
                    .iter()
                    .filter(|q| q.required)
                    .map(|q| q.id.clone())
                    .collect(),
                id: row.id,
            });
        }

        tracing::debug!(slug, steps = steps.len(), "loaded legacy funnel graph");
        FunnelDefinition::from_parts(slug, self.source(), steps)
    }
}
