use serde::{Deserialize, Serialize};

/// A funnel row in the legacy relational layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyFunnelRow {
    pub id: String,
    pub slug: String,
}

/// A step row in the legacy relational layout, ordered by `order_index`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyStepRow {
    pub id: String,
    pub funnel_id: String,
    pub order_index: i32,
    /// Step type tag, e.g. `question`, `info`, `content`, `summary`.
    pub kind: String,
    #[serde(default)]
    pub title: Option<String>,
}

/// A question attached to a legacy step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyQuestionRow {
    pub id: String,
    pub step_id: String,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default)]
    pub order_index: i32,
}

fn default_required() -> bool {
    true
}

/// One version of a funnel's manifest document.
///
/// The document is stored as raw JSON; structural validation happens when the
/// engine normalizes it, so a malformed document is still retrievable here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestRecord {
    pub funnel_slug: String,
    pub version: i64,
    pub document: serde_json::Value,
}
