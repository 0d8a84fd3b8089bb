pub mod conformance;
mod content;
mod error;
mod memory;
mod record;
mod traits;

pub use content::{LegacyFunnelRow, LegacyQuestionRow, LegacyStepRow, ManifestRecord};
pub use error::StorageError;
pub use memory::{MemorySnapshot, MemoryStorage};
pub use record::{AnswerRecord, AssessmentRecord, AssessmentStatus, MutationRecord};
pub use traits::{AssessmentStorage, FunnelContentStore};

/// Current UTC time as an RFC 3339 string, the timestamp format used by every record.
pub fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}
