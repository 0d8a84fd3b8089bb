use async_trait::async_trait;

use crate::content::{LegacyFunnelRow, LegacyQuestionRow, LegacyStepRow, ManifestRecord};
use crate::error::StorageError;
use crate::record::{AnswerRecord, AssessmentRecord, MutationRecord};

/// The storage trait for assessment progression backends.
///
/// An `AssessmentStorage` implementation provides durable, transactional
/// storage for assessments, their answers, and the mutation ledger.
///
/// ## Snapshot Semantics
///
/// All mutating operations take `&mut Self::Snapshot`, a type representing an
/// in-progress transaction. The lifecycle is:
///
/// 1. `begin_snapshot()`: start a transaction, returns a `Snapshot`
/// 2. Call mutating methods with `&mut snapshot`
/// 3. `commit_snapshot(snapshot)`: commit and consume the transaction
///    OR `abort_snapshot(snapshot)`: roll back and consume the transaction
///
/// If a `Snapshot` is dropped without committing, the underlying transaction
/// MUST be rolled back.
///
/// ## Uniqueness
///
/// Two keys are unique across all snapshots and all processes sharing the
/// backend:
///
/// - `assessment_answers (assessment_id, question_id)`: enforced as an upsert.
/// - `mutation_ledger (endpoint, mutation_id)`: enforced as a plain insert.
///   A second insert of the same key returns `StorageError::DuplicateMutation`,
///   either from `insert_mutation` itself or from `commit_snapshot` when two
///   snapshots race. In both cases none of the losing snapshot's writes become
///   visible.
///
/// ## OCC Conflict Detection
///
/// `update_current_step` and `mark_completed` are conditional on
/// `version = expected_version`. A mismatch returns
/// `StorageError::ConcurrentConflict`.
///
/// ## Thread Safety
///
/// Implementations must be `Send + Sync + 'static` to be used in axum
/// application state and across async task boundaries.
#[async_trait]
pub trait AssessmentStorage: Send + Sync + 'static {
    /// The snapshot (transaction) type used by this storage backend.
    type Snapshot: Send;

    // ── Snapshot lifecycle ────────────────────────────────────────────────────

    /// Begin a new snapshot (transaction).
    async fn begin_snapshot(&self) -> Result<Self::Snapshot, StorageError>;

    /// Commit a snapshot, making all mutations durable.
    async fn commit_snapshot(&self, snapshot: Self::Snapshot) -> Result<(), StorageError>;

    /// Abort (roll back) a snapshot, discarding all mutations.
    async fn abort_snapshot(&self, snapshot: Self::Snapshot) -> Result<(), StorageError>;

    // ── Assessment operations (within snapshot) ──────────────────────────────

    /// Insert a new assessment row.
    ///
    /// Returns `Err(StorageError::AlreadyExists)` if the id is taken.
    async fn insert_assessment(
        &self,
        snapshot: &mut Self::Snapshot,
        record: AssessmentRecord,
    ) -> Result<(), StorageError>;

    /// Read an assessment as seen by this snapshot (including its own
    /// uncommitted writes), with `SELECT ... FOR UPDATE` semantics where the
    /// backend supports them.
    ///
    /// Returns `Err(StorageError::AssessmentNotFound)` if it does not exist.
    async fn get_assessment_for_update(
        &self,
        snapshot: &mut Self::Snapshot,
        assessment_id: &str,
    ) -> Result<AssessmentRecord, StorageError>;

    /// Move the current-step pointer, conditional on `expected_version`.
    ///
    /// Returns the new version number on success.
    async fn update_current_step(
        &self,
        snapshot: &mut Self::Snapshot,
        assessment_id: &str,
        expected_version: i64,
        step_id: &str,
    ) -> Result<i64, StorageError>;

    /// Flip the assessment to `completed`, conditional on `expected_version`.
    ///
    /// Returns `Err(StorageError::Constraint)` if it is already completed.
    async fn mark_completed(
        &self,
        snapshot: &mut Self::Snapshot,
        assessment_id: &str,
        expected_version: i64,
    ) -> Result<i64, StorageError>;

    // ── Answer operations (within snapshot) ──────────────────────────────────

    /// All answers of an assessment as seen by this snapshot.
    async fn load_answers(
        &self,
        snapshot: &mut Self::Snapshot,
        assessment_id: &str,
    ) -> Result<Vec<AnswerRecord>, StorageError>;

    /// Insert or replace the answer for `(assessment_id, question_id)`.
    ///
    /// On overwrite the existing row id is kept and the value, raw value and
    /// timestamp are replaced. Returns the row as stored.
    ///
    /// FK: `assessment_id` must reference an existing assessment, otherwise
    /// `Err(StorageError::ForeignKey)`.
    async fn upsert_answer(
        &self,
        snapshot: &mut Self::Snapshot,
        record: AnswerRecord,
    ) -> Result<AnswerRecord, StorageError>;

    // ── Ledger operations (within snapshot) ──────────────────────────────────

    /// Insert a mutation ledger row. Rows are never updated afterwards.
    async fn insert_mutation(
        &self,
        snapshot: &mut Self::Snapshot,
        record: MutationRecord,
    ) -> Result<(), StorageError>;

    // ── Query operations (outside snapshot, against pool/connection) ──────────

    /// Read an assessment without locking.
    async fn get_assessment(&self, assessment_id: &str)
        -> Result<AssessmentRecord, StorageError>;

    /// All committed answers of an assessment, ordered by question id.
    async fn list_answers(&self, assessment_id: &str) -> Result<Vec<AnswerRecord>, StorageError>;

    /// Read a ledger row by its key.
    async fn get_mutation(
        &self,
        endpoint: &str,
        mutation_id: &str,
    ) -> Result<Option<MutationRecord>, StorageError>;
}

/// Read-only access to authored funnel content in either storage shape.
///
/// Content is written out-of-band; the engine only reads it.
#[async_trait]
pub trait FunnelContentStore: Send + Sync + 'static {
    /// Look up a legacy relational funnel by slug.
    async fn find_legacy_funnel(&self, slug: &str)
        -> Result<Option<LegacyFunnelRow>, StorageError>;

    /// Look up a legacy relational funnel by primary key.
    async fn get_legacy_funnel(
        &self,
        funnel_id: &str,
    ) -> Result<Option<LegacyFunnelRow>, StorageError>;

    /// Steps of a legacy funnel ordered by `order_index` ascending.
    async fn list_legacy_steps(&self, funnel_id: &str)
        -> Result<Vec<LegacyStepRow>, StorageError>;

    /// Questions attached to any of the given steps, ordered by
    /// `(step_id, order_index)`.
    async fn list_legacy_questions(
        &self,
        step_ids: &[String],
    ) -> Result<Vec<LegacyQuestionRow>, StorageError>;

    /// Highest-version manifest document for a slug.
    async fn latest_manifest(&self, slug: &str) -> Result<Option<ManifestRecord>, StorageError>;

    /// Slug of the funnel that owns `step_id`, in either shape.
    async fn locate_step(&self, step_id: &str) -> Result<Option<String>, StorageError>;
}
