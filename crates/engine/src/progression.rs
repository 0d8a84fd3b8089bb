//! Progression Resolver: where an assessment is, and where it goes next.
//!
//! Everything here is pure. Callers load the definition, the assessment row
//! and the answered question ids; this module only decides.

use std::collections::HashSet;

use intake_storage::AssessmentRecord;
use serde::Serialize;

use crate::error::EngineError;
use crate::funnel::{FunnelDefinition, StepDescriptor};

/// The step an assessment is positioned on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CurrentStep<'d> {
    pub step: &'d StepDescriptor,
    /// True when no pointer was stored and the position was reconstructed.
    pub derived: bool,
}

/// The step after `step_id` in order, or `None` at the end of the funnel.
pub fn next_step<'d>(
    definition: &'d FunnelDefinition,
    step_id: &str,
) -> Option<&'d StepDescriptor> {
    definition.after(step_id)
}

/// Resolve the current step: the stored pointer when there is one, otherwise
/// the position derived from answers.
pub fn current_step<'d>(
    definition: &'d FunnelDefinition,
    assessment: &AssessmentRecord,
    answered: &HashSet<String>,
) -> Result<CurrentStep<'d>, EngineError> {
    match &assessment.current_step_id {
        Some(step_id) => {
            let step =
                definition
                    .step(step_id)
                    .ok_or_else(|| EngineError::CurrentStepNotFound {
                        assessment_id: assessment.id.clone(),
                        step_id: step_id.clone(),
                    })?;
            Ok(CurrentStep {
                step,
                derived: false,
            })
        }
        None => Ok(CurrentStep {
            step: derive_from_answers(definition, answered),
            derived: true,
        }),
    }
}

/// Reconstruct the current step from persisted answers alone.
///
/// The first step whose required questions are not all answered is current.
/// A step without required questions is only passed once some later step
/// holds an answer. With every step complete, the last step is current.
pub fn derive_from_answers<'d>(
    definition: &'d FunnelDefinition,
    answered: &HashSet<String>,
) -> &'d StepDescriptor {
    let last_touched = definition
        .steps
        .iter()
        .rposition(|s| s.question_ids.iter().any(|q| answered.contains(q)));

    definition
        .steps
        .iter()
        .enumerate()
        .find(|(index, step)| {
            let passed = if step.required_question_ids.is_empty() {
                last_touched.is_some_and(|last| last > *index)
            } else {
                step.required_question_ids
                    .iter()
                    .all(|q| answered.contains(q))
            };
            !passed
        })
        .map(|(_, step)| step)
        .unwrap_or_else(|| definition.last())
}

/// Required questions of `step` that have no answer, in declared order.
pub fn missing_required(step: &StepDescriptor, answered: &HashSet<String>) -> Vec<String> {
    step.required_question_ids
        .iter()
        .filter(|q| !answered.contains(*q))
        .cloned()
        .collect()
}
