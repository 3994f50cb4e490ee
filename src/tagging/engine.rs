use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::ai::ChatCompletion;
use crate::db::{PipelineSettings, Repository};
use crate::error::{AppError, Result};
use crate::models::{
    AnalysisStats, AnalysisStatus, Entry, EntryAnalysisStatus, EntryQuery, Page, Upserted, UserTag,
};

use super::classifier::{classify, ClassifyInput};
use super::rules::{parse_match_rules, rule_matches};

/// Per-entry result of an explicit analysis request.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisResult {
    pub entry_id: i64,
    /// Whether the tag set was committed and the entry marked analyzed.
    pub success: bool,
    pub tag_ids: Vec<i64>,
    pub tag_names: Vec<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AnalysisSummary {
    pub total: usize,
    pub success: usize,
    pub tagged: usize,
    pub untagged: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AutoTaggingStats {
    pub processed: usize,
    pub tagged: usize,
    pub untagged: usize,
    pub failed: usize,
}

/// The enabled tags split by which matcher handles them.
struct TagSet {
    all: Vec<UserTag>,
    rule_tags: Vec<UserTag>,
    ai_tags: Vec<UserTag>,
}

impl TagSet {
    fn new(all: Vec<UserTag>) -> Self {
        let rule_tags = all
            .iter()
            .filter(|t| t.match_mode.uses_rules())
            .filter(|t| !parse_match_rules(t.match_rules.as_deref()).is_empty())
            .cloned()
            .collect();
        let ai_tags = all.iter().filter(|t| t.match_mode.uses_ai()).cloned().collect();
        Self {
            all,
            rule_tags,
            ai_tags,
        }
    }

    fn names_of(&self, ids: &[i64]) -> Vec<String> {
        ids.iter()
            .filter_map(|id| self.all.iter().find(|t| t.id == *id))
            .map(|t| t.name.clone())
            .collect()
    }
}

/// What happened to one entry inside a batch.
enum Classified {
    /// Tags were committed. `ai_error` is set when the AI half failed but
    /// rule matching still produced a usable result.
    Committed {
        tag_ids: Vec<i64>,
        ai_error: Option<String>,
    },
    /// No matcher succeeded; the entry stays pending.
    Failed(String),
}

pub struct TaggingEngine {
    repo: Repository,
    chat: Option<Arc<dyn ChatCompletion>>,
    batch_size: usize,
}

impl TaggingEngine {
    pub fn new(repo: Repository, chat: Option<Arc<dyn ChatCompletion>>, batch_size: usize) -> Self {
        Self {
            repo,
            chat,
            batch_size: batch_size.max(1),
        }
    }

    pub fn ai_available(&self) -> bool {
        self.chat.is_some()
    }

    /// Classifies the given entries now, regardless of their status.
    pub async fn analyze_entries(&self, entry_ids: &[i64]) -> Result<(Vec<AnalysisResult>, AnalysisSummary)> {
        if entry_ids.is_empty() {
            return Err(AppError::validation("no entries to analyze"));
        }
        let tags = TagSet::new(self.repo.enabled_tags().await?);
        if tags.all.is_empty() {
            return Err(AppError::validation("create at least one enabled tag first"));
        }
        if !self.ai_available() && tags.rule_tags.is_empty() {
            return Err(AppError::config(
                "tagging needs AI credentials or at least one tag with keyword rules",
            ));
        }
        let version = self.repo.tags_version().await?;

        let mut results = Vec::with_capacity(entry_ids.len());
        let mut summary = AnalysisSummary {
            total: entry_ids.len(),
            ..Default::default()
        };

        for &entry_id in entry_ids {
            let Some(entry) = self.repo.get_entry(entry_id).await? else {
                results.push(AnalysisResult {
                    entry_id,
                    success: false,
                    tag_ids: Vec::new(),
                    tag_names: Vec::new(),
                    error: Some("entry not found".to_string()),
                });
                continue;
            };

            let result = match self.classify_and_commit(&entry, &tags, version).await? {
                Classified::Committed { tag_ids, ai_error } => {
                    summary.success += 1;
                    if tag_ids.is_empty() {
                        summary.untagged += 1;
                    } else {
                        summary.tagged += 1;
                    }
                    AnalysisResult {
                        entry_id,
                        success: true,
                        tag_names: tags.names_of(&tag_ids),
                        tag_ids,
                        error: ai_error,
                    }
                }
                Classified::Failed(error) => AnalysisResult {
                    entry_id,
                    success: false,
                    tag_ids: Vec::new(),
                    tag_names: Vec::new(),
                    error: Some(error),
                },
            };
            results.push(result);
        }

        info!(
            total = summary.total,
            success = summary.success,
            tagged = summary.tagged,
            "Analyzed entries"
        );
        Ok((results, summary))
    }

    /// One bounded pass over the pending queue, as run by the scheduler.
    ///
    /// Does nothing unless auto-tagging is on. The first pass after it was
    /// switched on without a start marker only stamps the marker.
    pub async fn run_auto_tagging_batch(&self, limit: Option<usize>) -> Result<AutoTaggingStats> {
        let mut stats = AutoTaggingStats::default();
        let settings = self.repo.pipeline_settings().await?;
        if !settings.auto_tagging {
            return Ok(stats);
        }

        let tags = TagSet::new(self.repo.enabled_tags().await?);
        if tags.all.is_empty() {
            return Ok(stats);
        }
        if !self.ai_available() && tags.rule_tags.is_empty() {
            debug!("Auto-tagging has no usable matcher, skipping batch");
            return Ok(stats);
        }

        let Some(start_at) = settings.auto_tagging_start_at else {
            self.repo.stamp_auto_tagging_start(Utc::now()).await?;
            info!("Auto-tagging start marker set; historical entries are left alone");
            return Ok(stats);
        };

        let query = EntryQuery {
            limit: limit.unwrap_or(self.batch_size),
            ..Default::default()
        };
        let page = self
            .repo
            .pending_entries(Some(start_at), settings.tags_version, query)
            .await?;

        for entry in &page.items {
            match self.classify_and_commit(entry, &tags, settings.tags_version).await? {
                Classified::Committed { tag_ids, .. } => {
                    stats.processed += 1;
                    if tag_ids.is_empty() {
                        stats.untagged += 1;
                    } else {
                        stats.tagged += 1;
                    }
                }
                Classified::Failed(_) => stats.failed += 1,
            }
        }

        if !page.items.is_empty() {
            info!(
                processed = stats.processed,
                tagged = stats.tagged,
                failed = stats.failed,
                "Auto-tagging batch finished"
            );
        }
        Ok(stats)
    }

    /// Runs both matchers, unions their results and commits them. Storage
    /// errors propagate; matcher errors become a per-entry outcome.
    async fn classify_and_commit(&self, entry: &Entry, tags: &TagSet, version: i64) -> Result<Classified> {
        let title = entry.title.as_deref().unwrap_or_default();
        let mut matched: BTreeSet<i64> =
            rule_matches(title, entry.summary.as_deref(), &tags.rule_tags).into_iter().collect();
        let rules_ran = !tags.rule_tags.is_empty();

        let mut ai_error = None;
        let mut ai_ran = false;
        if let Some(chat) = self.chat.as_deref().filter(|_| !tags.ai_tags.is_empty()) {
            let input = ClassifyInput {
                title,
                summary: entry.summary.as_deref(),
                content: entry.best_content(),
            };
            let ai_tags: Vec<&UserTag> = tags.ai_tags.iter().collect();
            match classify(chat, &input, &ai_tags).await {
                Ok(ids) => {
                    ai_ran = true;
                    matched.extend(ids);
                }
                Err(e) => {
                    warn!(entry_id = entry.id, error = %e, "AI classification failed");
                    ai_error = Some(e.to_string());
                }
            }
        }

        if !rules_ran && !ai_ran {
            let error = ai_error.unwrap_or_else(|| "no matcher available".to_string());
            self.repo
                .set_analysis_status(entry.id, AnalysisStatus::Pending, version)
                .await?;
            return Ok(Classified::Failed(error));
        }

        let tag_ids: Vec<i64> = matched.into_iter().collect();
        self.repo
            .commit_analysis(entry.id, tag_ids.clone(), version, Utc::now())
            .await?;
        debug!(entry_id = entry.id, tags = ?tag_ids, "Committed entry tags");
        Ok(Classified::Committed { tag_ids, ai_error })
    }

    pub async fn pending_entries(&self, query: EntryQuery) -> Result<Page<Entry>> {
        let settings = self.repo.pipeline_settings().await?;
        self.repo
            .pending_entries(settings.auto_tagging_start_at, settings.tags_version, query)
            .await
    }

    pub async fn entries_without_tags(&self, query: EntryQuery) -> Result<Page<Entry>> {
        let settings = self.repo.pipeline_settings().await?;
        self.repo
            .entries_without_tags(settings.auto_tagging_start_at, query)
            .await
    }

    pub async fn mark_skipped(&self, entry_id: i64) -> Result<()> {
        self.require_entry(entry_id).await?;
        let version = self.repo.tags_version().await?;
        self.repo
            .set_analysis_status(entry_id, AnalysisStatus::Skipped, version)
            .await
    }

    pub async fn ensure_analysis_status(&self, entry_id: i64) -> Result<Upserted<EntryAnalysisStatus>> {
        self.require_entry(entry_id).await?;
        self.repo.ensure_analysis_status(entry_id).await
    }

    /// Manual edges survive every later automatic analysis.
    pub async fn add_manual_tag(&self, entry_id: i64, tag_id: i64) -> Result<()> {
        self.require_entry(entry_id).await?;
        if self.repo.get_tag(tag_id).await?.is_none() {
            return Err(AppError::not_found("tag", tag_id));
        }
        self.repo.add_entry_tag(entry_id, tag_id, true).await
    }

    pub async fn remove_tag(&self, entry_id: i64, tag_id: i64) -> Result<bool> {
        self.repo.remove_entry_tag(entry_id, tag_id).await
    }

    pub async fn set_auto_tagging(&self, enabled: bool) -> Result<PipelineSettings> {
        self.repo.set_auto_tagging(enabled, Utc::now()).await
    }

    pub async fn analysis_stats(&self) -> Result<AnalysisStats> {
        let settings = self.repo.pipeline_settings().await?;
        self.repo
            .analysis_stats(settings.auto_tagging_start_at, settings.tags_version)
            .await
    }

    async fn require_entry(&self, entry_id: i64) -> Result<()> {
        match self.repo.get_entry(entry_id).await? {
            Some(_) => Ok(()),
            None => Err(AppError::not_found("entry", entry_id)),
        }
    }
}
