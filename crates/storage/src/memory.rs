//! In-memory reference backend.
//!
//! `MemoryStorage` implements both storage traits with the same observable
//! semantics a relational backend provides: buffered snapshots, all-or-nothing
//! commits, OCC on the assessment version, and uniqueness of the ledger key
//! enforced at insert *and* commit time. It backs the `intake serve` binary
//! and the test suites.
//!
//! Snapshots buffer their writes. Reads inside a snapshot project the
//! buffered writes over the committed tables. `commit_snapshot` replays the
//! write set against a copy of the tables and swaps the copy in only if
//! every write applies, so a losing snapshot leaves no trace.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use async_trait::async_trait;
use tracing::debug;

use crate::content::{LegacyFunnelRow, LegacyQuestionRow, LegacyStepRow, ManifestRecord};
use crate::error::StorageError;
use crate::record::{AnswerRecord, AssessmentRecord, AssessmentStatus, MutationRecord};
use crate::traits::{AssessmentStorage, FunnelContentStore};

/// Committed rows of the three mutable tables.
#[derive(Debug, Clone, Default)]
struct Tables {
    assessments: HashMap<String, AssessmentRecord>,
    /// Keyed by (assessment_id, question_id).
    answers: BTreeMap<(String, String), AnswerRecord>,
    /// Keyed by (endpoint, mutation_id).
    mutations: HashMap<(String, String), MutationRecord>,
}

#[derive(Debug, Default)]
struct Content {
    legacy_funnels: Vec<LegacyFunnelRow>,
    legacy_steps: Vec<LegacyStepRow>,
    legacy_questions: Vec<LegacyQuestionRow>,
    manifests: Vec<ManifestRecord>,
}

#[derive(Debug, Clone)]
enum PendingWrite {
    InsertAssessment(AssessmentRecord),
    SetCurrentStep {
        assessment_id: String,
        expected_version: i64,
        step_id: String,
        at: String,
    },
    Complete {
        assessment_id: String,
        expected_version: i64,
        at: String,
    },
    UpsertAnswer(AnswerRecord),
    InsertMutation(MutationRecord),
}

impl PendingWrite {
    fn assessment_id(&self) -> Option<&str> {
        match self {
            PendingWrite::InsertAssessment(r) => Some(&r.id),
            PendingWrite::SetCurrentStep { assessment_id, .. }
            | PendingWrite::Complete { assessment_id, .. } => Some(assessment_id),
            PendingWrite::UpsertAnswer(r) => Some(&r.assessment_id),
            PendingWrite::InsertMutation(_) => None,
        }
    }
}

impl Tables {
    fn apply(&mut self, write: &PendingWrite) -> Result<(), StorageError> {
        match write {
            PendingWrite::InsertAssessment(record) => {
                if self.assessments.contains_key(&record.id) {
                    return Err(StorageError::AlreadyExists {
                        assessment_id: record.id.clone(),
                    });
                }
                self.assessments.insert(record.id.clone(), record.clone());
            }
            PendingWrite::SetCurrentStep {
                assessment_id,
                expected_version,
                step_id,
                at,
            } => {
                let assessment = self.versioned(assessment_id, *expected_version)?;
                assessment.current_step_id = Some(step_id.clone());
                assessment.version += 1;
                assessment.updated_at = at.clone();
            }
            PendingWrite::Complete {
                assessment_id,
                expected_version,
                at,
            } => {
                let assessment = self.versioned(assessment_id, *expected_version)?;
                if assessment.status == AssessmentStatus::Completed {
                    return Err(StorageError::Constraint(format!(
                        "assessment {assessment_id} is already completed"
                    )));
                }
                assessment.status = AssessmentStatus::Completed;
                assessment.completed_at = Some(at.clone());
                assessment.version += 1;
                assessment.updated_at = at.clone();
            }
            PendingWrite::UpsertAnswer(record) => {
                if !self.assessments.contains_key(&record.assessment_id) {
                    return Err(StorageError::ForeignKey {
                        relation: "assessments".to_string(),
                        key: record.assessment_id.clone(),
                    });
                }
                let key = (record.assessment_id.clone(), record.question_id.clone());
                match self.answers.get_mut(&key) {
                    Some(existing) => {
                        existing.value = record.value;
                        existing.raw_value = record.raw_value.clone();
                        existing.answered_at = record.answered_at.clone();
                    }
                    None => {
                        self.answers.insert(key, record.clone());
                    }
                }
            }
            PendingWrite::InsertMutation(record) => {
                let key = (record.endpoint.clone(), record.mutation_id.clone());
                if self.mutations.contains_key(&key) {
                    return Err(StorageError::DuplicateMutation {
                        endpoint: record.endpoint.clone(),
                        mutation_id: record.mutation_id.clone(),
                    });
                }
                self.mutations.insert(key, record.clone());
            }
        }
        Ok(())
    }

    fn versioned(
        &mut self,
        assessment_id: &str,
        expected_version: i64,
    ) -> Result<&mut AssessmentRecord, StorageError> {
        let assessment =
            self.assessments
                .get_mut(assessment_id)
                .ok_or_else(|| StorageError::AssessmentNotFound {
                    assessment_id: assessment_id.to_string(),
                })?;
        if assessment.version != expected_version {
            return Err(StorageError::ConcurrentConflict {
                assessment_id: assessment_id.to_string(),
                expected_version,
            });
        }
        Ok(assessment)
    }

    fn answers_of(&self, assessment_id: &str) -> Vec<AnswerRecord> {
        self.answers
            .values()
            .filter(|a| a.assessment_id == assessment_id)
            .cloned()
            .collect()
    }
}

/// An in-progress transaction against [`MemoryStorage`].
#[derive(Debug, Default)]
pub struct MemorySnapshot {
    writes: Vec<PendingWrite>,
}

/// Process-local storage backend. Cloning shares the underlying tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    tables: Arc<Mutex<Tables>>,
    content: Arc<RwLock<Content>>,
    injected_failures: Arc<AtomicUsize>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a legacy relational funnel with its steps and questions.
    pub fn add_legacy_funnel(
        &self,
        funnel: LegacyFunnelRow,
        steps: Vec<LegacyStepRow>,
        questions: Vec<LegacyQuestionRow>,
    ) {
        let mut content = self.content.write().unwrap_or_else(PoisonError::into_inner);
        content.legacy_funnels.push(funnel);
        content.legacy_steps.extend(steps);
        content.legacy_questions.extend(questions);
    }

    /// Register one version of a manifest document.
    pub fn add_manifest(&self, manifest: ManifestRecord) {
        let mut content = self.content.write().unwrap_or_else(PoisonError::into_inner);
        content.manifests.push(manifest);
    }

    /// Make the next `n` commits fail with `StorageError::Unavailable`,
    /// discarding their writes. Used to exercise transient-failure paths.
    pub fn fail_next_commits(&self, n: usize) {
        self.injected_failures.store(n, Ordering::SeqCst);
    }

    fn lock_tables(&self) -> Result<MutexGuard<'_, Tables>, StorageError> {
        self.tables
            .lock()
            .map_err(|_| StorageError::Backend("memory tables lock poisoned".to_string()))
    }

    fn take_injected_failure(&self) -> bool {
        self.injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Committed rows of one assessment with the snapshot's own writes to it
    /// applied on top.
    fn project(
        &self,
        snapshot: &MemorySnapshot,
        assessment_id: &str,
    ) -> Result<Tables, StorageError> {
        let mut scratch = {
            let tables = self.lock_tables()?;
            let mut scratch = Tables::default();
            if let Some(a) = tables.assessments.get(assessment_id) {
                scratch.assessments.insert(a.id.clone(), a.clone());
            }
            for answer in tables.answers_of(assessment_id) {
                scratch.answers.insert(
                    (answer.assessment_id.clone(), answer.question_id.clone()),
                    answer,
                );
            }
            scratch
        };
        for write in &snapshot.writes {
            if write.assessment_id() == Some(assessment_id) {
                scratch.apply(write)?;
            }
        }
        Ok(scratch)
    }

    fn projected_assessment(
        &self,
        snapshot: &MemorySnapshot,
        assessment_id: &str,
    ) -> Result<AssessmentRecord, StorageError> {
        self.project(snapshot, assessment_id)?
            .assessments
            .remove(assessment_id)
            .ok_or_else(|| StorageError::AssessmentNotFound {
                assessment_id: assessment_id.to_string(),
            })
    }
}

#[async_trait]
impl AssessmentStorage for MemoryStorage {
    type Snapshot = MemorySnapshot;

    async fn begin_snapshot(&self) -> Result<MemorySnapshot, StorageError> {
        Ok(MemorySnapshot::default())
    }

    async fn commit_snapshot(&self, snapshot: MemorySnapshot) -> Result<(), StorageError> {
        if self.take_injected_failure() {
            return Err(StorageError::Unavailable(
                "injected commit failure".to_string(),
            ));
        }
        let mut tables = self.lock_tables()?;
        let mut staged = tables.clone();
        for write in &snapshot.writes {
            staged.apply(write)?;
        }
        *tables = staged;
        debug!(writes = snapshot.writes.len(), "memory snapshot committed");
        Ok(())
    }

    async fn abort_snapshot(&self, snapshot: MemorySnapshot) -> Result<(), StorageError> {
        debug!(writes = snapshot.writes.len(), "memory snapshot aborted");
        Ok(())
    }

    async fn insert_assessment(
        &self,
        snapshot: &mut MemorySnapshot,
        record: AssessmentRecord,
    ) -> Result<(), StorageError> {
        let assessment_id = record.id.clone();
        let write = PendingWrite::InsertAssessment(record);
        self.project(snapshot, &assessment_id)?.apply(&write)?;
        snapshot.writes.push(write);
        Ok(())
    }

    async fn get_assessment_for_update(
        &self,
        snapshot: &mut MemorySnapshot,
        assessment_id: &str,
    ) -> Result<AssessmentRecord, StorageError> {
        self.projected_assessment(snapshot, assessment_id)
    }

    async fn update_current_step(
        &self,
        snapshot: &mut MemorySnapshot,
        assessment_id: &str,
        expected_version: i64,
        step_id: &str,
    ) -> Result<i64, StorageError> {
        let write = PendingWrite::SetCurrentStep {
            assessment_id: assessment_id.to_string(),
            expected_version,
            step_id: step_id.to_string(),
            at: crate::now_rfc3339(),
        };
        self.project(snapshot, assessment_id)?.apply(&write)?;
        snapshot.writes.push(write);
        Ok(expected_version + 1)
    }

    async fn mark_completed(
        &self,
        snapshot: &mut MemorySnapshot,
        assessment_id: &str,
        expected_version: i64,
    ) -> Result<i64, StorageError> {
        let write = PendingWrite::Complete {
            assessment_id: assessment_id.to_string(),
            expected_version,
            at: crate::now_rfc3339(),
        };
        self.project(snapshot, assessment_id)?.apply(&write)?;
        snapshot.writes.push(write);
        Ok(expected_version + 1)
    }

    async fn load_answers(
        &self,
        snapshot: &mut MemorySnapshot,
        assessment_id: &str,
    ) -> Result<Vec<AnswerRecord>, StorageError> {
        Ok(self.project(snapshot, assessment_id)?.answers_of(assessment_id))
    }

    async fn upsert_answer(
        &self,
        snapshot: &mut MemorySnapshot,
        record: AnswerRecord,
    ) -> Result<AnswerRecord, StorageError> {
        let key = (record.assessment_id.clone(), record.question_id.clone());
        let write = PendingWrite::UpsertAnswer(record);
        let mut scratch = self.project(snapshot, &key.0)?;
        scratch.apply(&write)?;
        let stored = scratch.answers.remove(&key).ok_or_else(|| {
            StorageError::Backend("upserted answer missing from projection".to_string())
        })?;
        snapshot.writes.push(write);
        Ok(stored)
    }

    async fn insert_mutation(
        &self,
        snapshot: &mut MemorySnapshot,
        record: MutationRecord,
    ) -> Result<(), StorageError> {
        let taken = {
            let tables = self.lock_tables()?;
            tables
                .mutations
                .contains_key(&(record.endpoint.clone(), record.mutation_id.clone()))
        };
        let pending = snapshot.writes.iter().any(|w| {
            matches!(w, PendingWrite::InsertMutation(m)
                if m.endpoint == record.endpoint && m.mutation_id == record.mutation_id)
        });
        if taken || pending {
            return Err(StorageError::DuplicateMutation {
                endpoint: record.endpoint,
                mutation_id: record.mutation_id,
            });
        }
        snapshot.writes.push(PendingWrite::InsertMutation(record));
        Ok(())
    }

    async fn get_assessment(&self, assessment_id: &str) -> Result<AssessmentRecord, StorageError> {
        let tables = self.lock_tables()?;
        tables
            .assessments
            .get(assessment_id)
            .cloned()
            .ok_or_else(|| StorageError::AssessmentNotFound {
                assessment_id: assessment_id.to_string(),
            })
    }

    async fn list_answers(&self, assessment_id: &str) -> Result<Vec<AnswerRecord>, StorageError> {
        Ok(self.lock_tables()?.answers_of(assessment_id))
    }

    async fn get_mutation(
        &self,
        endpoint: &str,
        mutation_id: &str,
    ) -> Result<Option<MutationRecord>, StorageError> {
        let tables = self.lock_tables()?;
        Ok(tables
            .mutations
            .get(&(endpoint.to_string(), mutation_id.to_string()))
            .cloned())
    }
}

#[async_trait]
impl FunnelContentStore for MemoryStorage {
    async fn find_legacy_funnel(
        &self,
        slug: &str,
    ) -> Result<Option<LegacyFunnelRow>, StorageError> {
        let content = self.content.read().unwrap_or_else(PoisonError::into_inner);
        Ok(content
            .legacy_funnels
            .iter()
            .find(|f| f.slug == slug)
            .cloned())
    }

    async fn get_legacy_funnel(
        &self,
        funnel_id: &str,
    ) -> Result<Option<LegacyFunnelRow>, StorageError> {
        let content = self.content.read().unwrap_or_else(PoisonError::into_inner);
        Ok(content
            .legacy_funnels
            .iter()
            .find(|f| f.id == funnel_id)
            .cloned())
    }

    async fn list_legacy_steps(
        &self,
        funnel_id: &str,
    ) -> Result<Vec<LegacyStepRow>, StorageError> {
        let content = self.content.read().unwrap_or_else(PoisonError::into_inner);
        let mut steps: Vec<LegacyStepRow> = content
            .legacy_steps
            .iter()
            .filter(|s| s.funnel_id == funnel_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.order_index);
        Ok(steps)
    }

    async fn list_legacy_questions(
        &self,
        step_ids: &[String],
    ) -> Result<Vec<LegacyQuestionRow>, StorageError> {
        let content = self.content.read().unwrap_or_else(PoisonError::into_inner);
        let mut questions: Vec<LegacyQuestionRow> = content
            .legacy_questions
            .iter()
            .filter(|q| step_ids.contains(&q.step_id))
            .cloned()
            .collect();
        questions.sort_by(|a, b| {
            (a.step_id.as_str(), a.order_index).cmp(&(b.step_id.as_str(), b.order_index))
        });
        Ok(questions)
    }

    async fn latest_manifest(&self, slug: &str) -> Result<Option<ManifestRecord>, StorageError> {
        let content = self.content.read().unwrap_or_else(PoisonError::into_inner);
        Ok(content
            .manifests
            .iter()
            .filter(|m| m.funnel_slug == slug)
            .max_by_key(|m| m.version)
            .cloned())
    }

    async fn locate_step(&self, step_id: &str) -> Result<Option<String>, StorageError> {
        let content = self.content.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(step) = content.legacy_steps.iter().find(|s| s.id == step_id) {
            return Ok(content
                .legacy_funnels
                .iter()
                .find(|f| f.id == step.funnel_id)
                .map(|f| f.slug.clone()));
        }

        // Only the latest version of each manifest is authoritative.
        let mut latest: HashMap<&str, &ManifestRecord> = HashMap::new();
        for manifest in &content.manifests {
            let entry = latest.entry(manifest.funnel_slug.as_str()).or_insert(manifest);
            if manifest.version > entry.version {
                *entry = manifest;
            }
        }
        Ok(latest
            .into_values()
            .find(|m| manifest_has_step(&m.document, step_id))
            .map(|m| m.funnel_slug.clone()))
    }
}

fn manifest_has_step(document: &serde_json::Value, step_id: &str) -> bool {
    document
        .get("steps")
        .and_then(|s| s.as_array())
        .map(|steps| {
            steps
                .iter()
                .any(|s| s.get("id").and_then(|id| id.as_str()) == Some(step_id))
        })
        .unwrap_or(false)
}
