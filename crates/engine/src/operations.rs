//! The public operations: start an assessment, save an answer, validate a
//! step, and resume.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use intake_storage::{
    now_rfc3339, AssessmentRecord, AssessmentStatus, AssessmentStorage, FunnelContentStore,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::actor::Actor;
use crate::answers;
use crate::audit::{AuditSink, MutationKind};
use crate::error::EngineError;
use crate::funnel::{FunnelResolver, StepDescriptor};
use crate::gateway::{Mutation, MutationGateway, Replayed};
use crate::progression;
use crate::validator::{self, StepValidation};

// ── Outputs ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartedAssessment {
    pub assessment_id: String,
    pub funnel_slug: String,
    pub current_step: StepDescriptor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedAnswer {
    pub answer_id: String,
    pub assessment_id: String,
    pub question_id: String,
    pub value: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeState {
    pub assessment_id: String,
    pub funnel_slug: String,
    pub status: AssessmentStatus,
    pub current_step: StepDescriptor,
    pub answered_question_ids: Vec<String>,
    /// True when no pointer was stored and `current_step` was reconstructed
    /// from answers.
    pub derived_from_answers: bool,
}

// ── Engine ───────────────────────────────────────────────────────────────────

/// Entry point for transports. Cheap to clone; holds only shared handles.
pub struct Engine<S> {
    storage: Arc<S>,
    gateway: MutationGateway<S>,
}

impl<S> Clone for Engine<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            gateway: self.gateway.clone(),
        }
    }
}

impl<S> Engine<S>
where
    S: AssessmentStorage + FunnelContentStore,
{
    pub fn new(storage: Arc<S>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            gateway: MutationGateway::new(Arc::clone(&storage), audit),
            storage,
        }
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Create an assessment positioned on the funnel's first step.
    #[tracing::instrument(skip(self, actor), fields(patient_id = %actor.patient_id))]
    pub async fn start_assessment(
        &self,
        actor: &Actor,
        funnel_slug: &str,
        mutation_id: Option<&str>,
    ) -> Result<Replayed<StartedAssessment>, EngineError> {
        actor.require_patient()?;
        let mutation = StartAssessment {
            patient_id: actor.patient_id.clone(),
            funnel_slug: funnel_slug.to_string(),
        };
        self.gateway.execute(actor, mutation_id, mutation).await
    }

    /// Upsert one answer. Writes nothing to the step pointer.
    #[tracing::instrument(skip(self, actor, value), fields(patient_id = %actor.patient_id))]
    pub async fn save_answer(
        &self,
        actor: &Actor,
        assessment_id: &str,
        question_id: &str,
        value: Value,
        mutation_id: &str,
    ) -> Result<Replayed<SavedAnswer>, EngineError> {
        actor.require_patient()?;
        let mutation = SaveAnswer {
            actor: actor.clone(),
            assessment_id: assessment_id.to_string(),
            question_id: question_id.to_string(),
            value,
        };
        self.gateway.execute(actor, Some(mutation_id), mutation).await
    }

    /// Validate the current step and advance on success.
    #[tracing::instrument(skip(self, actor), fields(patient_id = %actor.patient_id))]
    pub async fn validate_step(
        &self,
        actor: &Actor,
        assessment_id: &str,
        step_id: &str,
        mutation_id: &str,
    ) -> Result<Replayed<StepValidation>, EngineError> {
        actor.require_patient()?;
        let mutation = ValidateStep {
            actor: actor.clone(),
            assessment_id: assessment_id.to_string(),
            step_id: step_id.to_string(),
        };
        self.gateway.execute(actor, Some(mutation_id), mutation).await
    }

    /// Read-only view of where an assessment stands.
    #[tracing::instrument(skip(self, actor), fields(patient_id = %actor.patient_id))]
    pub async fn resume(
        &self,
        actor: &Actor,
        assessment_id: &str,
    ) -> Result<ResumeState, EngineError> {
        let assessment = self.storage.get_assessment(assessment_id).await?;
        actor.require_reader(&assessment.patient_id)?;

        let definition = FunnelResolver::new(self.storage.as_ref())
            .resolve_for(&assessment)
            .await?;
        let mut answered_question_ids: Vec<String> = self
            .storage
            .list_answers(assessment_id)
            .await?
            .into_iter()
            .map(|a| a.question_id)
            .collect();
        answered_question_ids.sort();
        let answered: HashSet<String> = answered_question_ids.iter().cloned().collect();

        let current = progression::current_step(&definition, &assessment, &answered)?;
        Ok(ResumeState {
            assessment_id: assessment.id.clone(),
            funnel_slug: assessment.funnel_slug.clone(),
            status: assessment.status,
            current_step: current.step.clone(),
            answered_question_ids,
            derived_from_answers: current.derived,
        })
    }
}

// ── Mutations ────────────────────────────────────────────────────────────────

/// Load an assessment the actor may modify.
async fn load_writable<S: AssessmentStorage>(
    storage: &S,
    snapshot: &mut S::Snapshot,
    actor: &Actor,
    assessment_id: &str,
) -> Result<AssessmentRecord, EngineError> {
    let assessment = storage
        .get_assessment_for_update(snapshot, assessment_id)
        .await?;
    actor.require_owner(&assessment.patient_id)?;
    if assessment.status == AssessmentStatus::Completed {
        return Err(EngineError::AssessmentCompleted {
            assessment_id: assessment.id,
        });
    }
    Ok(assessment)
}

struct StartAssessment {
    patient_id: String,
    funnel_slug: String,
}

#[async_trait]
impl<S> Mutation<S> for StartAssessment
where
    S: AssessmentStorage + FunnelContentStore,
{
    type Output = StartedAssessment;

    fn kind(&self) -> MutationKind {
        MutationKind::StartAssessment
    }

    fn endpoint(&self) -> String {
        "/assessments".to_string()
    }

    fn payload(&self) -> Value {
        json!({ "patient_id": self.patient_id, "funnel_slug": self.funnel_slug })
    }

    fn success_status(&self) -> u16 {
        201
    }

    fn assessment_id(&self, output: &StartedAssessment) -> Option<String> {
        Some(output.assessment_id.clone())
    }

    async fn apply(
        &self,
        storage: &S,
        snapshot: &mut S::Snapshot,
    ) -> Result<StartedAssessment, EngineError> {
        let definition = FunnelResolver::new(storage)
            .resolve(&self.funnel_slug)
            .await?;
        let first = definition.first().clone();
        let now = now_rfc3339();
        let record = AssessmentRecord {
            id: uuid::Uuid::new_v4().to_string(),
            patient_id: self.patient_id.clone(),
            funnel_slug: definition.slug.clone(),
            legacy_funnel_id: definition.source.legacy_funnel_id().map(str::to_string),
            status: AssessmentStatus::InProgress,
            current_step_id: Some(first.id.clone()),
            version: 0,
            started_at: now.clone(),
            updated_at: now,
            completed_at: None,
        };
        let assessment_id = record.id.clone();
        storage.insert_assessment(snapshot, record).await?;

        tracing::info!(%assessment_id, funnel = %definition.slug, "assessment started");
        Ok(StartedAssessment {
            assessment_id,
            funnel_slug: definition.slug,
            current_step: first,
        })
    }
}

struct SaveAnswer {
    actor: Actor,
    assessment_id: String,
    question_id: String,
    value: Value,
}

#[async_trait]
impl<S> Mutation<S> for SaveAnswer
where
    S: AssessmentStorage + FunnelContentStore,
{
    type Output = SavedAnswer;

    fn kind(&self) -> MutationKind {
        MutationKind::SaveAnswer
    }

    fn endpoint(&self) -> String {
        format!("/assessments/{}/answers", self.assessment_id)
    }

    fn payload(&self) -> Value {
        json!({
            "patient_id": self.actor.patient_id,
            "assessment_id": self.assessment_id,
            "question_id": self.question_id,
            "value": self.value,
        })
    }

    fn assessment_id(&self, _output: &SavedAnswer) -> Option<String> {
        Some(self.assessment_id.clone())
    }

    async fn apply(&self, storage: &S, snapshot: &mut S::Snapshot) -> Result<SavedAnswer, EngineError> {
        let assessment = load_writable(storage, snapshot, &self.actor, &self.assessment_id).await?;
        let definition = FunnelResolver::new(storage).resolve_for(&assessment).await?;
        if !definition.contains_question(&self.question_id) {
            return Err(EngineError::QuestionNotFound {
                question_id: self.question_id.clone(),
                funnel_slug: definition.slug,
            });
        }

        let stored = answers::save(
            storage,
            snapshot,
            &assessment.id,
            &self.question_id,
            &self.value,
        )
        .await?;
        Ok(SavedAnswer {
            answer_id: stored.id,
            assessment_id: stored.assessment_id,
            question_id: stored.question_id,
            value: stored.value,
        })
    }
}

struct ValidateStep {
    actor: Actor,
    assessment_id: String,
    step_id: String,
}

#[async_trait]
impl<S> Mutation<S> for ValidateStep
where
    S: AssessmentStorage + FunnelContentStore,
{
    type Output = StepValidation;

    fn kind(&self) -> MutationKind {
        MutationKind::ValidateStep
    }

    fn endpoint(&self) -> String {
        format!(
            "/assessments/{}/steps/{}/validate",
            self.assessment_id, self.step_id
        )
    }

    fn payload(&self) -> Value {
        json!({
            "patient_id": self.actor.patient_id,
            "assessment_id": self.assessment_id,
            "step_id": self.step_id,
        })
    }

    fn assessment_id(&self, _output: &StepValidation) -> Option<String> {
        Some(self.assessment_id.clone())
    }

    async fn apply(
        &self,
        storage: &S,
        snapshot: &mut S::Snapshot,
    ) -> Result<StepValidation, EngineError> {
        let assessment = load_writable(storage, snapshot, &self.actor, &self.assessment_id).await?;
        let definition = FunnelResolver::new(storage).resolve_for(&assessment).await?;
        validator::validate(storage, snapshot, &assessment, &definition, &self.step_id).await
    }
}

#[cfg(test)]
mod tests {
    use intake_storage::{ManifestRecord, MemoryStorage};

    use super::*;
    use crate::actor::Role;
    use crate::audit::NoopAuditSink;

    fn engine() -> Engine<MemoryStorage> {
        let storage = MemoryStorage::new();
        storage.add_manifest(ManifestRecord {
            funnel_slug: "stress".to_string(),
            version: 1,
            document: json!({"steps": [
                {"id": "s0", "type": "question", "questions": [{"id": "q1"}]},
                {"id": "s1", "type": "question", "questions": [{"id": "q2"}]}
            ]}),
        });
        Engine::new(Arc::new(storage), Arc::new(NoopAuditSink))
    }

    #[tokio::test]
    async fn non_patients_cannot_mutate() {
        let engine = engine();
        let clinician = Actor {
            patient_id: "c1".to_string(),
            role: Role::Clinician,
        };
        let err = engine
            .start_assessment(&clinician, "stress", None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "forbidden");
    }

    #[tokio::test]
    async fn other_patients_cannot_touch_an_assessment() {
        let engine = engine();
        let owner = Actor::patient("p1");
        let started = engine
            .start_assessment(&owner, "stress", Some("start-1"))
            .await
            .unwrap();
        let id = started.value.assessment_id;

        let intruder = Actor::patient("p2");
        let err = engine
            .save_answer(&intruder, &id, "q1", json!(1), "m1")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "forbidden");
        let err = engine.resume(&intruder, &id).await.unwrap_err();
        assert_eq!(err.code(), "forbidden");

        let clinician = Actor {
            patient_id: "c1".to_string(),
            role: Role::Clinician,
        };
        assert_eq!(
            engine.resume(&clinician, &id).await.unwrap().current_step.id,
            "s0"
        );
    }

    #[tokio::test]
    async fn completed_assessments_reject_writes() {
        let engine = engine();
        let actor = Actor::patient("p1");
        let id = engine
            .start_assessment(&actor, "stress", None)
            .await
            .unwrap()
            .value
            .assessment_id;

        let storage = engine.storage();
        let mut snap = storage.begin_snapshot().await.unwrap();
        let version = storage.get_assessment(&id).await.unwrap().version;
        storage.mark_completed(&mut snap, &id, version).await.unwrap();
        storage.commit_snapshot(snap).await.unwrap();

        let err = engine
            .save_answer(&actor, &id, "q1", json!(1), "m1")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "assessment-completed");
        let err = engine
            .validate_step(&actor, &id, "s0", "m2")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "assessment-completed");
    }

    #[tokio::test]
    async fn unknown_question_is_rejected() {
        let engine = engine();
        let actor = Actor::patient("p1");
        let id = engine
            .start_assessment(&actor, "stress", None)
            .await
            .unwrap()
            .value
            .assessment_id;
        let err = engine
            .save_answer(&actor, &id, "q99", json!(1), "m1")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "question-not-found");
    }
}
