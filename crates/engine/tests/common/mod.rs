#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use intake_engine::{Actor, Engine, NoopAuditSink};
use intake_storage::{
    now_rfc3339, AnswerRecord, AssessmentRecord, AssessmentStatus, AssessmentStorage,
    FunnelContentStore, LegacyFunnelRow, LegacyQuestionRow, LegacyStepRow, ManifestRecord,
    MemorySnapshot, MemoryStorage, MutationRecord, StorageError,
};
use serde_json::json;

/// `stress`: s0 (q1, q2 required; q_note optional) → s1 (q3 required) → s2 (summary).
pub fn stress_manifest() -> ManifestRecord {
    ManifestRecord {
        funnel_slug: "stress".to_string(),
        version: 1,
        document: json!({
            "steps": [
                {"id": "s0", "type": "question", "questions": [
                    {"id": "q1"},
                    {"id": "q2"},
                    {"id": "q_note", "required": false}
                ]},
                {"id": "s1", "type": "question", "questions": [{"id": "q3"}]},
                {"id": "s2", "type": "summary"}
            ]
        }),
    }
}

/// `sleep-legacy`: relational graph with an info step up front.
pub fn add_sleep_legacy(storage: &MemoryStorage) {
    let step = |id: &str, order_index: i32, kind: &str| LegacyStepRow {
        id: id.to_string(),
        funnel_id: "f-sleep".to_string(),
        order_index,
        kind: kind.to_string(),
        title: None,
    };
    let question = |id: &str, step_id: &str| LegacyQuestionRow {
        id: id.to_string(),
        step_id: step_id.to_string(),
        required: true,
        order_index: 0,
    };
    storage.add_legacy_funnel(
        LegacyFunnelRow {
            id: "f-sleep".to_string(),
            slug: "sleep-legacy".to_string(),
        },
        vec![
            step("sl-intro", 1, "info"),
            step("sl-hours", 2, "question"),
            step("sl-end", 3, "summary"),
        ],
        vec![question("sl-q-hours", "sl-hours")],
    );
}

pub fn storage() -> Arc<MemoryStorage> {
    let storage = MemoryStorage::new();
    storage.add_manifest(stress_manifest());
    add_sleep_legacy(&storage);
    Arc::new(storage)
}

pub fn engine_over(storage: Arc<MemoryStorage>) -> Engine<MemoryStorage> {
    Engine::new(storage, Arc::new(NoopAuditSink))
}

pub fn patient() -> Actor {
    Actor::patient("patient-1")
}

pub async fn start(engine: &Engine<MemoryStorage>, slug: &str) -> String {
    engine
        .start_assessment(&patient(), slug, None)
        .await
        .unwrap()
        .value
        .assessment_id
}

pub async fn pointer(storage: &MemoryStorage, assessment_id: &str) -> Option<String> {
    storage
        .get_assessment(assessment_id)
        .await
        .unwrap()
        .current_step_id
}

/// Insert an assessment that never had a pointer written.
pub async fn insert_unpointed(storage: &MemoryStorage, id: &str, slug: &str) {
    let mut snap = storage.begin_snapshot().await.unwrap();
    storage
        .insert_assessment(
            &mut snap,
            AssessmentRecord {
                id: id.to_string(),
                patient_id: patient().patient_id,
                funnel_slug: slug.to_string(),
                legacy_funnel_id: None,
                status: AssessmentStatus::InProgress,
                current_step_id: None,
                version: 0,
                started_at: now_rfc3339(),
                updated_at: now_rfc3339(),
                completed_at: None,
            },
        )
        .await
        .unwrap();
    storage.commit_snapshot(snap).await.unwrap();
}

// ── Interleaving backend ─────────────────────────────────────────────────────

/// Wraps [`MemoryStorage`] and yields to the scheduler right before every
/// commit, so requests driven with `tokio::join!` all finish their handler
/// before any of them commits.
pub struct YieldingStorage {
    pub inner: Arc<MemoryStorage>,
    snapshots_begun: AtomicUsize,
}

impl YieldingStorage {
    pub fn new(inner: Arc<MemoryStorage>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            snapshots_begun: AtomicUsize::new(0),
        })
    }

    /// Number of snapshots begun since the last call; one per handler run.
    pub fn take_snapshots_begun(&self) -> usize {
        self.snapshots_begun.swap(0, Ordering::SeqCst)
    }
}

#[async_trait]
impl AssessmentStorage for YieldingStorage {
    type Snapshot = MemorySnapshot;

    async fn begin_snapshot(&self) -> Result<MemorySnapshot, StorageError> {
        self.snapshots_begun.fetch_add(1, Ordering::SeqCst);
        self.inner.begin_snapshot().await
    }

    async fn commit_snapshot(&self, snapshot: MemorySnapshot) -> Result<(), StorageError> {
        tokio::task::yield_now().await;
        self.inner.commit_snapshot(snapshot).await
    }

    async fn abort_snapshot(&self, snapshot: MemorySnapshot) -> Result<(), StorageError> {
        self.inner.abort_snapshot(snapshot).await
    }

    async fn insert_assessment(
        &self,
        snapshot: &mut MemorySnapshot,
        record: AssessmentRecord,
    ) -> Result<(), StorageError> {
        self.inner.insert_assessment(snapshot, record).await
    }

    async fn get_assessment_for_update(
        &self,
        snapshot: &mut MemorySnapshot,
        assessment_id: &str,
    ) -> Result<AssessmentRecord, StorageError> {
        self.inner
            .get_assessment_for_update(snapshot, assessment_id)
            .await
    }

    async fn update_current_step(
        &self,
        snapshot: &mut MemorySnapshot,
        assessment_id: &str,
        expected_version: i64,
        step_id: &str,
    ) -> Result<i64, StorageError> {
        self.inner
            .update_current_step(snapshot, assessment_id, expected_version, step_id)
            .await
    }

    async fn mark_completed(
        &self,
        snapshot: &mut MemorySnapshot,
        assessment_id: &str,
        expected_version: i64,
    ) -> Result<i64, StorageError> {
        self.inner
            .mark_completed(snapshot, assessment_id, expected_version)
            .await
    }

    async fn load_answers(
        &self,
        snapshot: &mut MemorySnapshot,
        assessment_id: &str,
    ) -> Result<Vec<AnswerRecord>, StorageError> {
        self.inner.load_answers(snapshot, assessment_id).await
    }

    async fn upsert_answer(
        &self,
        snapshot: &mut MemorySnapshot,
        record: AnswerRecord,
    ) -> Result<AnswerRecord, StorageError> {
        self.inner.upsert_answer(snapshot, record).await
    }

    async fn insert_mutation(
        &self,
        snapshot: &mut MemorySnapshot,
        record: MutationRecord,
    ) -> Result<(), StorageError> {
        self.inner.insert_mutation(snapshot, record).await
    }

    async fn get_assessment(&self, assessment_id: &str) -> Result<AssessmentRecord, StorageError> {
        self.inner.get_assessment(assessment_id).await
    }

    async fn list_answers(&self, assessment_id: &str) -> Result<Vec<AnswerRecord>, StorageError> {
        self.inner.list_answers(assessment_id).await
    }

    async fn get_mutation(
        &self,
        endpoint: &str,
        mutation_id: &str,
    ) -> Result<Option<MutationRecord>, StorageError> {
        self.inner.get_mutation(endpoint, mutation_id).await
    }
}

#[async_trait]
impl FunnelContentStore for YieldingStorage {
    async fn find_legacy_funnel(
        &self,
        slug: &str,
    ) -> Result<Option<LegacyFunnelRow>, StorageError> {
        self.inner.find_legacy_funnel(slug).await
    }

    async fn get_legacy_funnel(
        &self,
        funnel_id: &str,
    ) -> Result<Option<LegacyFunnelRow>, StorageError> {
        self.inner.get_legacy_funnel(funnel_id).await
    }

    async fn list_legacy_steps(&self, funnel_id: &str) -> Result<Vec<LegacyStepRow>, StorageError> {
        self.inner.list_legacy_steps(funnel_id).await
    }

    async fn list_legacy_questions(
        &self,
        step_ids: &[String],
    ) -> Result<Vec<LegacyQuestionRow>, StorageError> {
        self.inner.list_legacy_questions(step_ids).await
    }

    async fn latest_manifest(&self, slug: &str) -> Result<Option<ManifestRecord>, StorageError> {
        self.inner.latest_manifest(slug).await
    }

    async fn locate_step(&self, step_id: &str) -> Result<Option<String>, StorageError> {
        self.inner.locate_step(step_id).await
    }
}

/// An engine over [`YieldingStorage`] with an assessment on `stress` whose
/// first step is fully answered.
pub async fn interleaving_engine() -> (Engine<YieldingStorage>, Arc<YieldingStorage>, String) {
    let storage = YieldingStorage::new(storage());
    let engine = Engine::new(Arc::clone(&storage), Arc::new(NoopAuditSink));
    let actor = patient();
    let id = engine
        .start_assessment(&actor, "stress", None)
        .await
        .unwrap()
        .value
        .assessment_id;
    engine.save_answer(&actor, &id, "q1", json!(1), "a1").await.unwrap();
    engine.save_answer(&actor, &id, "q2", json!(1), "a2").await.unwrap();
    storage.take_snapshots_begun();
    (engine, storage, id)
}
