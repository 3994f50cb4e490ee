use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct NewVectorRecord {
    pub entry_id: i64,
    pub feed_id: i64,
    pub title: String,
    /// The exact text that was embedded.
    pub content: String,
    pub published_at: Option<DateTime<Utc>>,
    pub url: Option<String>,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VectorHit {
    pub entry_id: i64,
    pub feed_id: i64,
    pub title: String,
    pub content: String,
    pub published_at: Option<String>,
    pub url: Option<String>,
    pub distance: f32,
}
