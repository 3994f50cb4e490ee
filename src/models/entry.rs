use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub id: i64,
    pub feed_id: i64,
    pub guid: String,
    pub title: Option<String>,
    pub url: Option<String>,
    pub author: Option<String>,
    pub summary: Option<String>,
    pub content: Option<String>,
    pub readability_content: Option<String>,
    pub categories_json: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub inserted_at: DateTime<Utc>,
    pub read: bool,
    pub starred: bool,
    pub enclosure_url: Option<String>,
    pub enclosure_type: Option<String>,
    pub enclosure_length: Option<i64>,
    pub duration: Option<String>,
    pub image_url: Option<String>,
    pub doi: Option<String>,
    pub pmid: Option<String>,
}

impl Entry {
    /// Body preferred for analysis: the extracted article when present, else the raw feed content.
    pub fn best_content(&self) -> Option<&str> {
        self.readability_content
            .as_deref()
            .or(self.content.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enclosure {
    pub url: String,
    pub mime_type: Option<String>,
    pub length: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct NewEntry {
    pub feed_id: i64,
    pub guid: String,
    pub title: Option<String>,
    pub url: Option<String>,
    pub author: Option<String>,
    pub summary: Option<String>,
    pub content: Option<String>,
    pub readability_content: Option<String>,
    pub categories_json: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub enclosure: Option<Enclosure>,
    pub duration: Option<String>,
    pub image_url: Option<String>,
    pub doi: Option<String>,
    pub pmid: Option<String>,
}
