use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStatus {
    Pending,
    Analyzed,
    Skipped,
}

impl AnalysisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisStatus::Pending => "pending",
            AnalysisStatus::Analyzed => "analyzed",
            AnalysisStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(AnalysisStatus::Pending),
            "analyzed" => Some(AnalysisStatus::Analyzed),
            "skipped" => Some(AnalysisStatus::Skipped),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryAnalysisStatus {
    pub entry_id: i64,
    pub status: AnalysisStatus,
    pub analyzed_at: Option<DateTime<Utc>>,
    /// Generation of the tag set this entry was last classified against.
    pub tags_version: i64,
}

/// Outcome of an explicit upsert: whether the row was just created or already there.
#[derive(Debug, Clone, PartialEq)]
pub enum Upserted<T> {
    Created(T),
    Existing(T),
}

impl<T> Upserted<T> {
    pub fn was_created(&self) -> bool {
        matches!(self, Upserted::Created(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            Upserted::Created(v) | Upserted::Existing(v) => v,
        }
    }
}

/// Cursor-paginated filter over entries, newest first.
#[derive(Debug, Clone)]
pub struct EntryQuery {
    pub limit: usize,
    /// `(inserted_at, id)` of the last row of the previous page.
    pub cursor: Option<(DateTime<Utc>, i64)>,
    /// Explicit backfill lower bound; overrides the auto-tagging start marker.
    pub backfill_since: Option<DateTime<Utc>>,
}

impl Default for EntryQuery {
    fn default() -> Self {
        Self {
            limit: 50,
            cursor: None,
            backfill_since: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<(DateTime<Utc>, i64)>,
    pub has_more: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AnalysisStats {
    pub pending: i64,
    pub analyzed: i64,
    pub skipped: i64,
    pub with_tags: i64,
    pub without_tags: i64,
}
