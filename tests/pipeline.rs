use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio_test::{assert_err, assert_ok};

use feed_enricher::ai::{ChatCompletion, ChatMessage, ChatOptions, Embedder};
use feed_enricher::config::FetchConfig;
use feed_enricher::db::Repository;
use feed_enricher::error::{AppError, FetchError, Result};
use feed_enricher::feed::{FeedFetcher, HttpFetch, RetryPolicy};
use feed_enricher::models::{AnalysisStatus, EntryQuery, NewEntry, NewFeed, NewTag, RuleOperator, TagMatchRule};
use feed_enricher::scheduler::{
    EnrichmentPipeline, Pipeline, Scheduler, TickOutcome, TickReport, TickSettings,
};
use feed_enricher::tagging::TaggingEngine;
use feed_enricher::vector::VectorSync;

const FEED_URL: &str = "https://feeds.example.com/lab.xml";
const BACKUP_URL: &str = "https://backup.example.com/lab.xml";
const QUIET_URL: &str = "https://quiet.example.com/rss";
const BROKEN_URL: &str = "https://broken.example.com/rss";

const LAB_FEED: &str = r#"<?xml version="1.0"?>
<rss version="2.0" xmlns:dc="http://purl.org/dc/elements/1.1/"><channel>
  <title>Lab News</title>
  <link>https://lab.example.com/</link>
  <item>
    <title>Dublin Core dated</title>
    <link>https://lab.example.com/dc</link>
    <guid>dc-1</guid>
    <dc:date>2025-11-04T08:30:00Z</dc:date>
  </item>
  <item>
    <title>Journal issue</title>
    <link>https://lab.example.com/issue</link>
    <guid>issue-1</guid>
    <description>Volume 12. Publication date: March 2026. Open access.</description>
  </item>
</channel></rss>"#;

/// Serves canned responses per URL and records every request.
#[derive(Default)]
struct ScriptedHttp {
    responses: HashMap<String, std::result::Result<String, u16>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedHttp {
    fn serve(mut self, url: &str, body: &str) -> Self {
        self.responses.insert(url.to_string(), Ok(body.to_string()));
        self
    }

    fn fail(mut self, url: &str, status: u16) -> Self {
        self.responses.insert(url.to_string(), Err(status));
        self
    }

    fn calls_to(&self, url: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|u| *u == url).count()
    }
}

#[async_trait]
impl HttpFetch for ScriptedHttp {
    async fn get(&self, url: &str, _user_agent: &str) -> std::result::Result<Vec<u8>, FetchError> {
        self.calls.lock().unwrap().push(url.to_string());
        match self.responses.get(url) {
            Some(Ok(body)) => Ok(body.clone().into_bytes()),
            Some(Err(status)) => Err(FetchError::Status(*status)),
            None => Err(FetchError::Status(404)),
        }
    }
}

fn fetch_config() -> FetchConfig {
    let mut config = FetchConfig {
        rsshub_url: None,
        mirrors: Vec::new(),
        max_retries: 2,
        ..Default::default()
    };
    config
        .alternatives
        .insert(FEED_URL.to_string(), vec![BACKUP_URL.to_string()]);
    config
}

fn fast_retries() -> RetryPolicy {
    RetryPolicy {
        max_retries: 2,
        delay: Duration::ZERO,
    }
}

async fn subscribe(repo: &Repository) -> i64 {
    repo.insert_feed(NewFeed {
        url: FEED_URL.to_string(),
        title: None,
        update_interval_minutes: None,
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn refreshing_twice_stores_items_once() {
    let repo = Repository::open_in_memory().await.unwrap();
    let feed_id = subscribe(&repo).await;
    let http = Arc::new(ScriptedHttp::default().serve(FEED_URL, LAB_FEED));
    let fetcher = FeedFetcher::new(repo.clone(), http, fetch_config()).with_retry_policy(fast_retries());

    let first = assert_ok!(fetcher.refresh_feed(feed_id).await);
    assert!(first.success);
    assert_eq!(first.item_count, 2);

    let second = assert_ok!(fetcher.refresh_feed(feed_id).await);
    assert!(second.success);
    assert_eq!(second.item_count, 0);
    assert_eq!(repo.count_entries_for_feed(feed_id).await.unwrap(), 2);
}

#[tokio::test]
async fn retryable_failures_fall_back_to_the_next_candidate() {
    let repo = Repository::open_in_memory().await.unwrap();
    let feed_id = subscribe(&repo).await;
    let http = Arc::new(
        ScriptedHttp::default()
            .fail(FEED_URL, 503)
            .serve(BACKUP_URL, LAB_FEED),
    );
    let fetcher = FeedFetcher::new(repo.clone(), http.clone(), fetch_config())
        .with_retry_policy(fast_retries());

    let outcome = fetcher.refresh_feed(feed_id).await.unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.item_count, 2);
    assert_eq!(http.calls_to(FEED_URL), 3);
    assert_eq!(http.calls_to(BACKUP_URL), 1);

    let feed = repo.get_feed(feed_id).await.unwrap().unwrap();
    assert!(feed.last_error.is_none());
    assert!(feed.last_checked_at.is_some());
}

#[tokio::test]
async fn permanent_failures_are_not_retried_and_fail_soft() {
    let repo = Repository::open_in_memory().await.unwrap();
    let feed_id = subscribe(&repo).await;
    let http = Arc::new(ScriptedHttp::default().fail(FEED_URL, 404).fail(BACKUP_URL, 401));
    let fetcher = FeedFetcher::new(repo.clone(), http.clone(), fetch_config())
        .with_retry_policy(fast_retries());

    let outcome = assert_ok!(fetcher.refresh_feed(feed_id).await);
    assert!(!outcome.success);
    assert_eq!(outcome.item_count, 0);
    assert_eq!(outcome.error.as_deref(), Some("HTTP 401"));
    assert_eq!(http.calls_to(FEED_URL), 1);

    let feed = repo.get_feed(feed_id).await.unwrap().unwrap();
    assert_eq!(feed.last_error.as_deref(), Some("HTTP 401"));
    let logs = repo.recent_fetch_logs(feed_id, 1).await.unwrap();
    assert_eq!(logs[0].status.as_str(), "error");
}

#[tokio::test]
async fn dates_fall_back_to_dublin_core_and_description() {
    let repo = Repository::open_in_memory().await.unwrap();
    let feed_id = subscribe(&repo).await;
    let http = Arc::new(ScriptedHttp::default().serve(FEED_URL, LAB_FEED));
    let fetcher = FeedFetcher::new(repo.clone(), http, fetch_config()).with_retry_policy(fast_retries());
    fetcher.refresh_feed(feed_id).await.unwrap();

    let dc = repo.find_entry_by_guid(feed_id, "dc-1").await.unwrap().unwrap();
    assert_eq!(dc.published_at, Some(Utc.with_ymd_and_hms(2025, 11, 4, 8, 30, 0).unwrap()));

    let issue = repo.find_entry_by_guid(feed_id, "issue-1").await.unwrap().unwrap();
    assert_eq!(issue.published_at, Some(Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()));
}

const BLOG_BEFORE: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
  <title>Blog</title>
  <link>https://blog.example.com/</link>
  <item>
    <title>Plain post</title>
    <link>https://blog.example.com/plain</link>
    <description>Nothing nested here.</description>
  </item>
</channel></rss>"#;

const BLOG_AFTER: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
  <title>Blog</title>
  <link>https://blog.example.com/</link>
  <item>
    <title>Markup lists</title>
    <link>https://blog.example.com/lists</link>
    <description><![CDATA[RSS nests <item>one</item> and <item>two</item> inside channels.]]></description>
  </item>
  <item>
    <title>Plain post</title>
    <link>https://blog.example.com/plain</link>
    <description>Nothing nested here.</description>
  </item>
</channel></rss>"#;

#[tokio::test]
async fn item_markup_in_cdata_keeps_guidless_items_deduplicated() {
    let repo = Repository::open_in_memory().await.unwrap();
    let feed_id = subscribe(&repo).await;

    let before = FeedFetcher::new(
        repo.clone(),
        Arc::new(ScriptedHttp::default().serve(FEED_URL, BLOG_BEFORE)),
        fetch_config(),
    )
    .with_retry_policy(fast_retries());
    assert_eq!(before.refresh_feed(feed_id).await.unwrap().item_count, 1);

    let after = FeedFetcher::new(
        repo.clone(),
        Arc::new(ScriptedHttp::default().serve(FEED_URL, BLOG_AFTER)),
        fetch_config(),
    )
    .with_retry_policy(fast_retries());
    let outcome = after.refresh_feed(feed_id).await.unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.item_count, 1);
    assert_eq!(repo.count_entries_for_feed(feed_id).await.unwrap(), 2);

    for link in ["https://blog.example.com/plain", "https://blog.example.com/lists"] {
        assert!(repo.find_entry_by_guid(feed_id, link).await.unwrap().is_some());
    }
}

#[tokio::test]
async fn refresh_all_feeds_reports_each_feed() {
    let repo = Repository::open_in_memory().await.unwrap();
    let good = subscribe(&repo).await;
    let broken = repo
        .insert_feed(NewFeed {
            url: BROKEN_URL.to_string(),
            title: None,
            update_interval_minutes: None,
        })
        .await
        .unwrap();
    let http = Arc::new(ScriptedHttp::default().serve(FEED_URL, LAB_FEED).fail(BROKEN_URL, 404));
    let fetcher = FeedFetcher::new(repo.clone(), http, fetch_config()).with_retry_policy(fast_retries());

    let outcomes: HashMap<i64, _> = assert_ok!(fetcher.refresh_all_feeds().await).into_iter().collect();
    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[&good].item_count, 2);
    assert!(!outcomes[&broken].success);
    assert_eq!(outcomes[&broken].error.as_deref(), Some("HTTP 404"));
}

/// Holds every tick open until released.
#[derive(Default)]
struct GatedPipeline {
    started: tokio::sync::Notify,
    release: tokio::sync::Notify,
    runs: AtomicUsize,
}

#[async_trait]
impl Pipeline for GatedPipeline {
    async fn run_tick(&self) -> TickReport {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();
        self.release.notified().await;
        TickReport::default()
    }
}

#[tokio::test]
async fn manual_trigger_during_a_tick_is_skipped() {
    let pipeline = Arc::new(GatedPipeline::default());
    let scheduler = Arc::new(Scheduler::new(pipeline.clone(), Duration::from_secs(300)));

    let in_flight = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.trigger_refresh().await })
    };
    pipeline.started.notified().await;

    assert!(scheduler.status().await.refreshing);
    assert_eq!(scheduler.trigger_refresh().await, TickOutcome::Skipped);

    pipeline.release.notify_one();
    let outcome = in_flight.await.unwrap();
    assert!(matches!(outcome, TickOutcome::Completed(_)));
    assert_eq!(pipeline.runs.load(Ordering::SeqCst), 1);
    assert!(!scheduler.status().await.refreshing);
}

struct FixedAnswer(String);

#[async_trait]
impl ChatCompletion for FixedAnswer {
    async fn chat(&self, _messages: Vec<ChatMessage>, _options: ChatOptions) -> Result<String> {
        Ok(self.0.clone())
    }
}

async fn repo_with_entry() -> (Repository, i64) {
    let repo = Repository::open_in_memory().await.unwrap();
    let feed_id = subscribe(&repo).await;
    let entry_id = repo
        .insert_entry(NewEntry {
            feed_id,
            guid: "e-1".into(),
            title: Some("Protein folding with diffusion models".into()),
            summary: Some("A new structure prediction method.".into()),
            content: Some(format!("<p>{}</p>", "Structure prediction details. ".repeat(5))),
            ..Default::default()
        })
        .await
        .unwrap()
        .unwrap();
    (repo, entry_id)
}

fn rule(word: &str) -> Vec<TagMatchRule> {
    vec![TagMatchRule {
        keywords: vec![word.to_string()],
        operator: RuleOperator::Or,
        exclude: Vec::new(),
    }]
}

#[tokio::test]
async fn reanalysis_is_idempotent_and_keeps_manual_tags() {
    let (repo, entry_id) = repo_with_entry().await;
    let folding = repo.create_tag(NewTag::rule("folding", rule("protein"))).await.unwrap();
    let ml = repo.create_tag(NewTag::ai("machine learning")).await.unwrap();
    let manual = repo.create_tag(NewTag::ai("to read")).await.unwrap();

    let chat = Arc::new(FixedAnswer(format!("[{}, 12345]", ml.id)));
    let engine = TaggingEngine::new(repo.clone(), Some(chat), 10);
    engine.add_manual_tag(entry_id, manual.id).await.unwrap();

    let (first, _) = engine.analyze_entries(&[entry_id]).await.unwrap();
    let (second, _) = engine.analyze_entries(&[entry_id]).await.unwrap();
    assert_eq!(first[0].tag_ids, vec![folding.id, ml.id]);
    assert_eq!(first[0].tag_ids, second[0].tag_ids);

    let mut stored: Vec<(i64, bool)> = repo
        .entry_tags(entry_id)
        .await
        .unwrap()
        .into_iter()
        .map(|t| (t.tag_id, t.is_manual))
        .collect();
    stored.sort();
    assert_eq!(stored, vec![(folding.id, false), (ml.id, false), (manual.id, true)]);
}

#[tokio::test]
async fn tag_changes_reopen_analyzed_entries() {
    let (repo, entry_id) = repo_with_entry().await;
    repo.create_tag(NewTag::rule("folding", rule("protein"))).await.unwrap();
    let engine = TaggingEngine::new(repo.clone(), None, 10);

    engine.analyze_entries(&[entry_id]).await.unwrap();
    let page = engine.pending_entries(EntryQuery::default()).await.unwrap();
    assert!(page.items.is_empty());

    repo.create_tag(NewTag::rule("diffusion", rule("diffusion"))).await.unwrap();
    let status = repo.get_analysis_status(entry_id).await.unwrap().unwrap();
    assert_eq!(status.status, AnalysisStatus::Analyzed);

    let page = engine.pending_entries(EntryQuery::default()).await.unwrap();
    assert_eq!(page.items.iter().map(|e| e.id).collect::<Vec<_>>(), vec![entry_id]);
}

/// Fails for any text containing "poison", otherwise returns a fixed vector.
struct SelectiveEmbedder;

#[async_trait]
impl Embedder for SelectiveEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.contains("poison") {
            Err(AppError::embedding("503: model overloaded"))
        } else if text.contains("folding") {
            Ok(vec![1.0, 0.0, 0.0])
        } else {
            Ok(vec![0.0, 1.0, 0.0])
        }
    }
}

#[tokio::test]
async fn failed_embeddings_stay_candidates() {
    let (repo, good_id) = repo_with_entry().await;
    let feed_id = repo.get_entry(good_id).await.unwrap().unwrap().feed_id;
    let bad_id = repo
        .insert_entry(NewEntry {
            feed_id,
            guid: "e-2".into(),
            title: Some("poison pill".into()),
            content: Some("x".repeat(200)),
            ..Default::default()
        })
        .await
        .unwrap()
        .unwrap();

    let sync = VectorSync::new(repo.clone(), Arc::new(SelectiveEmbedder), 50);
    let report = sync.sync_batch(10).await.unwrap();
    assert_eq!((report.candidates, report.synced, report.failed), (2, 1, 1));
    assert!(repo.has_vector(good_id).await.unwrap());
    assert!(!repo.has_vector(bad_id).await.unwrap());

    let retry = sync.sync_batch(10).await.unwrap();
    assert_eq!((retry.candidates, retry.synced, retry.failed), (1, 0, 1));

    let hits = sync.search("protein folding", 5).await.unwrap();
    assert_eq!(hits[0].entry_id, good_id);

    let err = assert_err!(sync.search("poison", 5).await);
    assert!(matches!(err, AppError::Embedding(_)));
}

#[tokio::test]
async fn on_disk_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("feeds.db");
    let path = path.to_str().unwrap();

    {
        let repo = assert_ok!(Repository::new(path).await);
        let feed_id = subscribe(&repo).await;
        repo.create_tag(NewTag::rule("folding", rule("protein"))).await.unwrap();
        repo.set_auto_tagging(true, Utc::now()).await.unwrap();
        assert_eq!(feed_id, 1);
    }

    let repo = assert_ok!(Repository::new(path).await);
    assert_eq!(repo.get_all_feeds().await.unwrap().len(), 1);
    assert_eq!(repo.enabled_tags().await.unwrap().len(), 1);
    let settings = repo.pipeline_settings().await.unwrap();
    assert!(settings.auto_tagging);
    assert!(settings.auto_tagging_start_at.is_some());
    assert_eq!(settings.tags_version, 2);
}

const DIGEST_FEED: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
  <title>Lab Digest</title>
  <link>https://lab.example.com/</link>
  <item>
    <title>Protein folding at scale</title>
    <guid>digest-1</guid>
    <description><![CDATA[<p>Diffusion models now predict structures for whole proteomes.</p>]]></description>
  </item>
  <item>
    <title>Open day</title>
    <guid>digest-2</guid>
    <description><![CDATA[<p>Visitors are welcome in the lab all week.</p>]]></description>
  </item>
</channel></rss>"#;

fn tick_settings(auto_refresh: bool) -> TickSettings {
    TickSettings {
        auto_refresh,
        fetch_interval_minutes: 720,
        vector_batch_size: 10,
        tagging_batch_size: 10,
    }
}

#[tokio::test]
async fn a_tick_fetches_due_feeds_then_embeds_then_tags() {
    let repo = Repository::open_in_memory().await.unwrap();
    subscribe(&repo).await;
    let mut feed_ids = Vec::new();
    for url in [QUIET_URL, BROKEN_URL] {
        feed_ids.push(
            repo.insert_feed(NewFeed {
                url: url.to_string(),
                title: None,
                update_interval_minutes: None,
            })
            .await
            .unwrap(),
        );
    }
    repo.mark_feed_checked(feed_ids[0], Utc::now() - chrono::Duration::minutes(5), None)
        .await
        .unwrap();

    let folding = repo.create_tag(NewTag::rule("folding", rule("protein"))).await.unwrap();
    repo.set_auto_tagging(true, Utc::now() - chrono::Duration::hours(1))
        .await
        .unwrap();

    let http = Arc::new(
        ScriptedHttp::default()
            .serve(FEED_URL, DIGEST_FEED)
            .serve(QUIET_URL, LAB_FEED)
            .fail(BROKEN_URL, 404),
    );
    let fetcher = Arc::new(
        FeedFetcher::new(repo.clone(), http.clone(), fetch_config()).with_retry_policy(fast_retries()),
    );
    let vectors = Arc::new(VectorSync::new(repo.clone(), Arc::new(SelectiveEmbedder), 0));
    let tagging = Arc::new(TaggingEngine::new(repo.clone(), None, 10));
    let pipeline = EnrichmentPipeline::new(
        repo.clone(),
        fetcher.clone(),
        Some(vectors.clone()),
        tagging.clone(),
        tick_settings(true),
    );

    let report = pipeline.run_tick().await;
    assert_eq!((report.feeds_refreshed, report.feeds_failed), (1, 1));
    assert_eq!(http.calls_to(QUIET_URL), 0);
    assert_eq!(http.calls_to(BROKEN_URL), 1);
    // Entries fetched in this tick are embedded and tagged by the same tick.
    assert_eq!(report.vectors_synced, 2);
    assert_eq!((report.tagging.processed, report.tagging.tagged), (2, 1));

    let entry = repo.find_entry_by_guid(1, "digest-1").await.unwrap().unwrap();
    assert!(repo.has_vector(entry.id).await.unwrap());
    let tags: Vec<i64> = repo
        .entry_tags(entry.id)
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.tag_id)
        .collect();
    assert_eq!(tags, vec![folding.id]);

    // With auto-refresh off nothing is downloaded, yet the later phases still run.
    let offline = EnrichmentPipeline::new(repo.clone(), fetcher, Some(vectors), tagging, tick_settings(false));
    repo.insert_entry(NewEntry {
        feed_id: 1,
        guid: "manual-1".into(),
        title: Some("Protein design notes".into()),
        content: Some("<p>Notes on designing binders.</p>".into()),
        ..Default::default()
    })
    .await
    .unwrap();
    let calls_before = http.calls.lock().unwrap().len();

    let report = offline.run_tick().await;
    assert_eq!((report.feeds_refreshed, report.feeds_failed), (0, 0));
    assert_eq!(http.calls.lock().unwrap().len(), calls_before);
    assert_eq!(report.vectors_synced, 1);
    assert_eq!((report.tagging.processed, report.tagging.tagged), (1, 1));
}
