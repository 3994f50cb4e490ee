use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::ai::Embedder;
use crate::db::Repository;
use crate::error::{AppError, Result};
use crate::models::{Entry, NewVectorRecord, VectorHit};
use crate::services::content_extractor::{readable_text, truncate_chars};

const MAX_CONTENT_CHARS: usize = 5000;
pub const DEFAULT_SEARCH_LIMIT: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub candidates: usize,
    pub synced: usize,
    pub failed: usize,
}

/// The text an entry is embedded as: title, summary and the body as plain text.
pub fn build_embedding_input(entry: &Entry) -> String {
    let title = entry.title.as_deref().unwrap_or_default();
    let summary = entry.summary.as_deref().unwrap_or_default();
    let content = entry
        .best_content()
        .and_then(readable_text)
        .unwrap_or_default();
    format!(
        "{title} \n {summary} \n {}",
        truncate_chars(&content, MAX_CONTENT_CHARS)
    )
}

/// Keeps the vector store in step with the entry table. An entry without a
/// record is simply a candidate; failures leave nothing behind.
pub struct VectorSync {
    repo: Repository,
    embedder: Arc<dyn Embedder>,
    min_content_len: usize,
}

impl VectorSync {
    pub fn new(repo: Repository, embedder: Arc<dyn Embedder>, min_content_len: usize) -> Self {
        Self {
            repo,
            embedder,
            min_content_len,
        }
    }

    pub async fn sync_batch(&self, limit: usize) -> Result<SyncReport> {
        let candidates = self
            .repo
            .entries_without_vectors(limit, self.min_content_len)
            .await?;
        let mut report = SyncReport {
            candidates: candidates.len(),
            ..Default::default()
        };

        for entry in candidates {
            let input = build_embedding_input(&entry);
            let embedding = match self.embedder.embed(&input).await {
                Ok(v) => v,
                Err(e) => {
                    warn!(entry_id = entry.id, error = %e, "Embedding failed, will retry next batch");
                    report.failed += 1;
                    continue;
                }
            };

            let record = NewVectorRecord {
                entry_id: entry.id,
                feed_id: entry.feed_id,
                title: entry.title.clone().unwrap_or_else(|| "No Title".to_string()),
                content: input,
                published_at: entry.published_at,
                url: entry.url.clone(),
                embedding,
            };
            match self.repo.insert_vector_record(record).await {
                Ok(id) => {
                    debug!(entry_id = entry.id, record_id = id, "Stored vector");
                    report.synced += 1;
                }
                Err(e) => {
                    warn!(entry_id = entry.id, error = %e, "Failed to store vector");
                    report.failed += 1;
                }
            }
        }

        if report.candidates > 0 {
            info!(
                synced = report.synced,
                failed = report.failed,
                "Vector sync batch finished"
            );
        }
        Ok(report)
    }

    /// Nearest records to `query`, closest first.
    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<VectorHit>> {
        if query.trim().is_empty() {
            return Err(AppError::validation("search query is empty"));
        }
        let embedding = self
            .embedder
            .embed(query)
            .await
            .map_err(|e| AppError::embedding(format!("failed to embed query: {e}")))?;
        self.repo.nearest_vectors(embedding, limit.max(1)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(title: Option<&str>, summary: Option<&str>, content: Option<&str>) -> Entry {
        Entry {
            id: 1,
            feed_id: 1,
            guid: "g".into(),
            title: title.map(Into::into),
            url: None,
            author: None,
            summary: summary.map(Into::into),
            content: content.map(Into::into),
            readability_content: None,
            categories_json: None,
            published_at: None,
            inserted_at: Utc::now(),
            read: false,
            starred: false,
            enclosure_url: None,
            enclosure_type: None,
            enclosure_length: None,
            duration: None,
            image_url: None,
            doi: None,
            pmid: None,
        }
    }

    #[test]
    fn input_joins_title_summary_and_clean_content() {
        let e = entry(Some("Title"), Some("Short"), Some("<p>Body text</p>"));
        assert_eq!(build_embedding_input(&e), "Title \n Short \n Body text");
    }

    #[test]
    fn content_is_truncated() {
        let body = format!("<div>{}</div>", "x".repeat(MAX_CONTENT_CHARS * 2));
        let e = entry(None, None, Some(&body));
        let input = build_embedding_input(&e);
        assert_eq!(input.len(), " \n  \n ".len() + MAX_CONTENT_CHARS);
    }
}
