//! Step Validator: decides whether a step may be completed now, and if so
//! moves the pointer forward.

use std::collections::HashSet;

use intake_storage::{AssessmentRecord, AssessmentStorage, FunnelContentStore};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::funnel::{FunnelDefinition, FunnelResolver, StepDescriptor};
use crate::progression;

/// Where a step sits relative to the current step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPosition {
    Past,
    Current,
    Future,
}

impl StepPosition {
    pub fn of(step_index: usize, current_index: usize) -> Self {
        match step_index.cmp(&current_index) {
            std::cmp::Ordering::Less => StepPosition::Past,
            std::cmp::Ordering::Equal => StepPosition::Current,
            std::cmp::Ordering::Greater => StepPosition::Future,
        }
    }
}

/// Result of a validate-step call. A step with unanswered required questions
/// is a normal outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepValidation {
    pub is_valid: bool,
    pub next_step: Option<StepDescriptor>,
    pub missing_question_ids: Vec<String>,
    /// True when the validated step was the last one.
    pub funnel_exhausted: bool,
}

/// What validating `requested` against `current` amounts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision<'d> {
    /// Required answers are missing; nothing is written.
    Incomplete { missing: Vec<String> },
    /// Complete. Move to `next`, or stay put at the end of the funnel.
    Advance { next: Option<&'d StepDescriptor> },
}

/// Pure decision for a step already known to belong to `definition`.
pub fn decide<'d>(
    definition: &'d FunnelDefinition,
    current: &'d StepDescriptor,
    requested_step_id: &str,
    answered: &HashSet<String>,
) -> Result<Decision<'d>, EngineError> {
    let requested_index =
        definition
            .index_of(requested_step_id)
            .ok_or_else(|| EngineError::StepNotFound {
                step_id: requested_step_id.to_string(),
            })?;
    let current_index = definition.index_of(&current.id).unwrap_or(0);

    if StepPosition::of(requested_index, current_index) != StepPosition::Current {
        return Err(EngineError::SkipPrevented {
            requested_step_id: requested_step_id.to_string(),
            current_step: Box::new(current.clone()),
        });
    }

    let missing = progression::missing_required(current, answered);
    if !missing.is_empty() {
        return Ok(Decision::Incomplete { missing });
    }
    Ok(Decision::Advance {
        next: progression::next_step(definition, &current.id),
    })
}

/// Validate `step_id` for `assessment` inside `snapshot`, advancing the
/// pointer when the step is complete.
///
/// The caller has already loaded the assessment for update and checked
/// ownership and status.
pub async fn validate<S>(
    storage: &S,
    snapshot: &mut S::Snapshot,
    assessment: &AssessmentRecord,
    definition: &FunnelDefinition,
    step_id: &str,
) -> Result<StepValidation, EngineError>
where
    S: AssessmentStorage + FunnelContentStore,
{
    if definition.step(step_id).is_none() {
        let owner = FunnelResolver::new(storage).owner_of_step(step_id).await?;
        return Err(match owner {
            Some(owner) if owner != definition.slug => EngineError::StepForeignToFunnel {
                step_id: step_id.to_string(),
                funnel_slug: definition.slug.clone(),
                owner_slug: owner,
            },
            _ => EngineError::StepNotFound {
                step_id: step_id.to_string(),
            },
        });
    }

    let answered: HashSet<String> = storage
        .load_answers(snapshot, &assessment.id)
        .await?
        .into_iter()
        .map(|a| a.question_id)
        .collect();

    let current = progression::current_step(definition, assessment, &answered)?;
    match decide(definition, current.step, step_id, &answered)? {
        Decision::Incomplete { missing } => {
            tracing::debug!(
                assessment_id = %assessment.id,
                step_id,
                missing = missing.len(),
                "step has unanswered required questions"
            );
            Ok(StepValidation {
                is_valid: false,
                next_step: None,
                missing_question_ids: missing,
                funnel_exhausted: false,
            })
        }
        Decision::Advance { next } => {
            let target = next.unwrap_or(current.step);
            if assessment.current_step_id.as_deref() != Some(target.id.as_str()) {
                storage
                    .update_current_step(snapshot, &assessment.id, assessment.version, &target.id)
                    .await?;
            }
            tracing::debug!(
                assessment_id = %assessment.id,
                from = step_id,
                to = %target.id,
                "step advanced"
            );
            Ok(StepValidation {
                is_valid: true,
                next_step: next.cloned(),
                missing_question_ids: Vec::new(),
                funnel_exhausted: next.is_none(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::funnel::{FunnelSource, StepKind};

    fn funnel() -> FunnelDefinition {
        let step = |id: &str, qs: &[&str]| StepDescriptor {
            id: id.to_string(),
            order_index: 0,
            kind: StepKind::Question,
            question_ids: qs.iter().map(|q| q.to_string()).collect(),
            required_question_ids: qs.iter().map(|q| q.to_string()).collect(),
        };
        FunnelDefinition::from_parts(
            "stress",
            FunnelSource::Manifest { version: 1 },
            vec![step("s0", &["q1", "q2"]), step("s1", &["q3"])],
        )
        .unwrap()
    }

    fn answered(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|q| q.to_string()).collect()
    }

    #[test]
    fn positions() {
        assert_eq!(StepPosition::of(0, 1), StepPosition::Past);
        assert_eq!(StepPosition::of(1, 1), StepPosition::Current);
        assert_eq!(StepPosition::of(2, 1), StepPosition::Future);
    }

    #[test]
    fn future_and_past_steps_are_skip_prevented() {
        let def = funnel();
        let s0 = def.step("s0").unwrap();
        let err = decide(&def, s0, "s1", &answered(&["q1", "q2", "q3"])).unwrap_err();
        match err {
            EngineError::SkipPrevented { current_step, .. } => assert_eq!(current_step.id, "s0"),
            other => panic!("unexpected {other:?}"),
        }

        let s1 = def.step("s1").unwrap();
        let err = decide(&def, s1, "s0", &answered(&["q1", "q2"])).unwrap_err();
        assert_eq!(err.code(), "skip-prevented");
    }

    #[test]
    fn incomplete_and_advance() {
        let def = funnel();
        let s0 = def.step("s0").unwrap();
        assert_eq!(
            decide(&def, s0, "s0", &answered(&["q2"])).unwrap(),
            Decision::Incomplete {
                missing: vec!["q1".to_string()]
            }
        );
        assert_eq!(
            decide(&def, s0, "s0", &answered(&["q1", "q2"])).unwrap(),
            Decision::Advance {
                next: def.step("s1")
            }
        );
        let s1 = def.step("s1").unwrap();
        assert_eq!(
            decide(&def, s1, "s1", &answered(&["q3"])).unwrap(),
            Decision::Advance { next: None }
        );
    }
}
