use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Labeling state of a dataset archive.
///
/// The integer codes are the values persisted in `dataset_records.label_status`.
/// Legal transitions are `Pending -> Processing -> {Done, Failed}`; nothing
/// moves a record back to `Pending` or `Processing` automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum LabelStatus {
    Failed = -1,
    Pending = 0,
    Done = 1,
    Processing = 2,
}

impl LabelStatus {
    /// Persisted integer code
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Whether `self -> next` is an edge of the status state machine
    pub fn can_transition_to(self, next: LabelStatus) -> bool {
        matches!(
            (self, next),
            (LabelStatus::Pending, LabelStatus::Processing)
                | (LabelStatus::Processing, LabelStatus::Done)
                | (LabelStatus::Processing, LabelStatus::Failed)
        )
    }

    /// States from which `self` may be entered
    pub fn predecessors(self) -> &'static [LabelStatus] {
        match self {
            LabelStatus::Processing => &[LabelStatus::Pending],
            LabelStatus::Done | LabelStatus::Failed => &[LabelStatus::Processing],
            LabelStatus::Pending => &[],
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, LabelStatus::Done | LabelStatus::Failed)
    }
}

/// A dataset archive tracked in the metadata registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct DatasetRecord {
    /// Unique record ID, assigned at creation
    pub id: Uuid,
    /// Human-chosen unique name
    pub name: String,
    /// Object key of the archive, derived from `name` once and never changed
    pub blob_key: String,
    /// Free-text label forwarded to the captioning service
    pub category: String,
    /// Labeling state
    #[sqlx(rename = "label_status")]
    pub status: LabelStatus,
    /// When the record was created
    pub created_at: DateTime<Utc>,
}

impl DatasetRecord {
    /// Build a fresh `Pending` record whose blob key is derived from `name`
    pub fn new(name: &str, category: &str, key_prefix: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            blob_key: blob_key_for(key_prefix, name),
            category: category.to_string(),
            status: LabelStatus::Pending,
            created_at: Utc::now(),
        }
    }
}

/// Filters for listing datasets
#[derive(Debug, Clone, Default)]
pub struct DatasetQuery {
    /// Case-insensitive substring of the name
    pub keyword: Option<String>,
    /// Exact category
    pub category: Option<String>,
}

impl DatasetQuery {
    /// In-process evaluation of the filter, mirroring the SQL predicate
    pub fn matches(&self, record: &DatasetRecord) -> bool {
        let keyword_ok = match self.keyword.as_deref().filter(|k| !k.is_empty()) {
            Some(keyword) => record
                .name
                .to_lowercase()
                .contains(&keyword.to_lowercase()),
            None => true,
        };
        let category_ok = match self.category.as_deref().filter(|c| !c.is_empty()) {
            Some(category) => record.category == category,
            None => true,
        };
        keyword_ok && category_ok
    }
}

/// Deterministic archive location for a dataset name: `<prefix>/<name>.zip`
pub fn blob_key_for(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        format!("{}.zip", name)
    } else {
        format!("{}/{}.zip", prefix, name)
    }
}

/// Sanitize a path component to prevent path traversal
pub fn sanitize_path_component(component: &str) -> String {
    let sanitized: String = component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect();

    if sanitized.is_empty() {
        "dataset".to_string()
    } else {
        sanitized
    }
}
