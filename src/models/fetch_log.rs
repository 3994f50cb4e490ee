use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchLogStatus {
    Pending,
    Running,
    Success,
    Error,
}

impl FetchLogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchLogStatus::Pending => "pending",
            FetchLogStatus::Running => "running",
            FetchLogStatus::Success => "success",
            FetchLogStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(FetchLogStatus::Pending),
            "running" => Some(FetchLogStatus::Running),
            "success" => Some(FetchLogStatus::Success),
            "error" => Some(FetchLogStatus::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FetchLogStatus::Success | FetchLogStatus::Error)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchLog {
    pub id: i64,
    pub feed_id: i64,
    pub status: FetchLogStatus,
    pub message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub item_count: i64,
}

/// Result of one feed refresh. A failed refresh is data, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchOutcome {
    pub success: bool,
    pub item_count: usize,
    pub error: Option<String>,
}

impl FetchOutcome {
    pub fn succeeded(item_count: usize) -> Self {
        Self {
            success: true,
            item_count,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            item_count: 0,
            error: Some(error.into()),
        }
    }
}
