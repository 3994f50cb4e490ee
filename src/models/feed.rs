use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feed {
    pub id: i64,
    pub url: String,
    pub title: Option<String>,
    pub site_url: Option<String>,
    pub description: Option<String>,
    pub favicon_url: Option<String>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub update_interval_minutes: Option<u32>,
    pub ai_tagging_enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl Feed {
    pub fn display_name(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.url)
    }
}

#[derive(Debug, Clone)]
pub struct NewFeed {
    pub url: String,
    pub title: Option<String>,
    pub update_interval_minutes: Option<u32>,
}

/// Metadata learned from a successful fetch. `None` leaves the stored value alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedMetadata {
    pub title: Option<String>,
    pub site_url: Option<String>,
    pub description: Option<String>,
    pub favicon_url: Option<String>,
}
