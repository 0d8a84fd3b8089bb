/// All errors that can be returned by an `AssessmentStorage` or
/// `FunnelContentStore` implementation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StorageError {
    /// Optimistic concurrency conflict: another transaction moved the
    /// assessment past the expected version.
    #[error("concurrent conflict on assessment {assessment_id}: expected version {expected_version}")]
    ConcurrentConflict {
        assessment_id: String,
        expected_version: i64,
    },

    /// No assessment row with the given id.
    #[error("assessment not found: {assessment_id}")]
    AssessmentNotFound { assessment_id: String },

    /// An assessment with this id already exists.
    #[error("assessment already exists: {assessment_id}")]
    AlreadyExists { assessment_id: String },

    /// The (endpoint, mutation id) ledger key is already taken. Raised either
    /// by the insert itself or by the commit that loses the uniqueness race.
    #[error("mutation already recorded: {endpoint} / {mutation_id}")]
    DuplicateMutation {
        endpoint: String,
        mutation_id: String,
    },

    /// A referenced row does not exist.
    #[error("foreign key violation on {relation}: {key}")]
    ForeignKey { relation: String, key: String },

    /// A row failed a column or check constraint.
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// The backend is temporarily unreachable; the caller may retry.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// A backend-specific storage error (connection, serialization, etc.).
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Whether retrying the same operation may succeed without new input.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageError::Unavailable(_) | StorageError::ConcurrentConflict { .. }
        )
    }
}
