//! Periodic enrichment: refresh due feeds, then embed, then tag.
//!
//! A tick is single-flight. Whether it comes from the timer or from a manual
//! trigger, a tick that starts while another is running is skipped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::db::Repository;
use crate::feed::FeedFetcher;
use crate::models::Feed;
use crate::tagging::{AutoTaggingStats, TaggingEngine};
use crate::vector::VectorSync;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub feeds_refreshed: usize,
    pub feeds_failed: usize,
    pub vectors_synced: usize,
    pub tagging: AutoTaggingStats,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "report", rename_all = "lowercase")]
pub enum TickOutcome {
    /// Another tick was already running.
    Skipped,
    Completed(TickReport),
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub scheduled: bool,
    pub refreshing: bool,
    pub last_tick: Option<DateTime<Utc>>,
}

/// The work a tick performs. Never fails as a whole; phase errors are logged.
#[async_trait]
pub trait Pipeline: Send + Sync {
    async fn run_tick(&self) -> TickReport;
}

/// A feed is due when it was never checked, or when the larger of its own
/// interval and the global one has elapsed.
pub fn is_feed_due(feed: &Feed, default_interval_minutes: u32, now: DateTime<Utc>) -> bool {
    let Some(last_checked) = feed.last_checked_at else {
        return true;
    };
    let interval = feed
        .update_interval_minutes
        .unwrap_or(0)
        .max(default_interval_minutes);
    now - last_checked >= chrono::Duration::minutes(i64::from(interval))
}

#[derive(Debug, Clone, Copy)]
pub struct TickSettings {
    pub auto_refresh: bool,
    pub fetch_interval_minutes: u32,
    pub vector_batch_size: usize,
    pub tagging_batch_size: usize,
}

/// Fetch, then vector sync, then auto-tagging, in that order.
pub struct EnrichmentPipeline {
    repo: Repository,
    fetcher: Arc<FeedFetcher>,
    vectors: Option<Arc<VectorSync>>,
    tagging: Arc<TaggingEngine>,
    settings: TickSettings,
}

impl EnrichmentPipeline {
    pub fn new(
        repo: Repository,
        fetcher: Arc<FeedFetcher>,
        vectors: Option<Arc<VectorSync>>,
        tagging: Arc<TaggingEngine>,
        settings: TickSettings,
    ) -> Self {
        Self {
            repo,
            fetcher,
            vectors,
            tagging,
            settings,
        }
    }

    async fn refresh_due_feeds(&self, report: &mut TickReport) {
        if !self.settings.auto_refresh {
            debug!("Auto-refresh disabled, skipping fetch phase");
            return;
        }
        let feeds = match self.repo.get_all_feeds().await {
            Ok(feeds) => feeds,
            Err(e) => {
                error!(error = %e, "Failed to list feeds");
                return;
            }
        };

        let now = Utc::now();
        for feed in feeds
            .iter()
            .filter(|f| is_feed_due(f, self.settings.fetch_interval_minutes, now))
        {
            match self.fetcher.refresh_feed(feed.id).await {
                Ok(outcome) if outcome.success => {
                    report.feeds_refreshed += 1;
                    debug!(feed = feed.display_name(), new_items = outcome.item_count, "Refreshed feed");
                }
                Ok(outcome) => {
                    report.feeds_failed += 1;
                    warn!(
                        feed = feed.display_name(),
                        error = outcome.error.as_deref().unwrap_or_default(),
                        "Failed to refresh feed"
                    );
                }
                Err(e) => {
                    report.feeds_failed += 1;
                    error!(feed_id = feed.id, error = %e, "Error refreshing feed");
                }
            }
        }

        if report.feeds_refreshed > 0 || report.feeds_failed > 0 {
            info!(
                refreshed = report.feeds_refreshed,
                failed = report.feeds_failed,
                "Fetch phase complete"
            );
        }
    }
}

#[async_trait]
impl Pipeline for EnrichmentPipeline {
    async fn run_tick(&self) -> TickReport {
        let mut report = TickReport::default();

        self.refresh_due_feeds(&mut report).await;

        if let Some(vectors) = &self.vectors {
            match vectors.sync_batch(self.settings.vector_batch_size).await {
                Ok(sync) => report.vectors_synced = sync.synced,
                Err(e) => error!(error = %e, "Vector sync error"),
            }
        }

        match self
            .tagging
            .run_auto_tagging_batch(Some(self.settings.tagging_batch_size))
            .await
        {
            Ok(stats) => report.tagging = stats,
            Err(e) => error!(error = %e, "Auto-tagging error"),
        }

        report
    }
}

/// Clears the running flag when dropped, so a panicking tick cannot wedge
/// the scheduler.
struct RunningGuard<'a>(&'a AtomicBool);

impl<'a> RunningGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Shared {
    pipeline: Arc<dyn Pipeline>,
    running: AtomicBool,
    last_tick: Mutex<Option<DateTime<Utc>>>,
}

impl Shared {
    async fn guarded_tick(&self) -> TickOutcome {
        let Some(_guard) = RunningGuard::acquire(&self.running) else {
            info!("Skipping tick, previous run still in progress");
            return TickOutcome::Skipped;
        };
        let report = self.pipeline.run_tick().await;
        *self.last_tick.lock().await = Some(Utc::now());
        TickOutcome::Completed(report)
    }
}

pub struct Scheduler {
    shared: Arc<Shared>,
    period: Duration,
    task: Mutex<Option<(JoinHandle<()>, Arc<Notify>)>>,
}

impl Scheduler {
    pub fn new(pipeline: Arc<dyn Pipeline>, period: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                pipeline,
                running: AtomicBool::new(false),
                last_tick: Mutex::new(None),
            }),
            period,
            task: Mutex::new(None),
        }
    }

    /// Spawns the interval task. The first tick fires one period from now.
    pub async fn start(&self) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            warn!("Scheduler already running");
            return;
        }

        let shared = Arc::clone(&self.shared);
        let shutdown = Arc::new(Notify::new());
        let stop = Arc::clone(&shutdown);
        let period = self.period;
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop.notified() => break,
                }
                // Runs outside the select so a stop never interrupts a tick.
                shared.guarded_tick().await;
            }
            debug!("Scheduler task exited");
        });

        *task = Some((handle, shutdown));
        info!(period_secs = period.as_secs(), "Scheduler started");
    }

    /// Stops scheduling; a tick already in flight finishes first.
    pub async fn stop(&self) {
        let task = self.task.lock().await.take();
        if let Some((handle, shutdown)) = task {
            shutdown.notify_one();
            if let Err(e) = handle.await {
                error!(error = %e, "Scheduler task ended abnormally");
            }
            info!("Scheduler stopped");
        }
    }

    pub async fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            scheduled: self.task.lock().await.is_some(),
            refreshing: self.shared.running.load(Ordering::Acquire),
            last_tick: *self.shared.last_tick.lock().await,
        }
    }

    /// Runs one tick now through the same guard as the timer.
    pub async fn trigger_refresh(&self) -> TickOutcome {
        self.shared.guarded_tick().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn feed(last_checked_mins_ago: Option<i64>, interval: Option<u32>) -> Feed {
        let now = Utc::now();
        Feed {
            id: 1,
            url: "https://example.com/rss".into(),
            title: None,
            site_url: None,
            description: None,
            favicon_url: None,
            last_checked_at: last_checked_mins_ago.map(|m| now - chrono::Duration::minutes(m)),
            last_error: None,
            update_interval_minutes: interval,
            ai_tagging_enabled: true,
            created_at: now,
        }
    }

    #[test]
    fn never_checked_feeds_are_due() {
        assert!(is_feed_due(&feed(None, None), 720, Utc::now()));
    }

    #[test]
    fn larger_interval_wins() {
        let now = Utc::now();
        assert!(!is_feed_due(&feed(Some(30), Some(15)), 60, now));
        assert!(is_feed_due(&feed(Some(61), Some(15)), 60, now));
        assert!(!is_feed_due(&feed(Some(90), Some(120)), 60, now));
        assert!(is_feed_due(&feed(Some(120), Some(120)), 60, now));
    }

    struct Counting(AtomicUsize);

    #[async_trait]
    impl Pipeline for Counting {
        async fn run_tick(&self) -> TickReport {
            self.0.fetch_add(1, Ordering::SeqCst);
            TickReport::default()
        }
    }

    #[tokio::test]
    async fn manual_trigger_runs_and_records_tick() {
        let pipeline = Arc::new(Counting(AtomicUsize::new(0)));
        let scheduler = Scheduler::new(pipeline.clone(), Duration::from_secs(300));

        assert!(matches!(scheduler.trigger_refresh().await, TickOutcome::Completed(_)));
        assert!(matches!(scheduler.trigger_refresh().await, TickOutcome::Completed(_)));
        assert_eq!(pipeline.0.load(Ordering::SeqCst), 2);

        let status = scheduler.status().await;
        assert!(!status.scheduled);
        assert!(!status.refreshing);
        assert!(status.last_tick.is_some());
    }

    #[tokio::test]
    async fn start_and_stop_toggle_schedule() {
        let pipeline = Arc::new(Counting(AtomicUsize::new(0)));
        let scheduler = Scheduler::new(pipeline, Duration::from_secs(3600));

        scheduler.start().await;
        scheduler.start().await;
        assert!(scheduler.status().await.scheduled);

        scheduler.stop().await;
        assert!(!scheduler.status().await.scheduled);
    }

    #[test]
    fn guard_is_exclusive_and_released_on_drop() {
        let flag = AtomicBool::new(false);
        let first = RunningGuard::acquire(&flag);
        assert!(first.is_some());
        assert!(RunningGuard::acquire(&flag).is_none());
        drop(first);
        assert!(RunningGuard::acquire(&flag).is_some());
    }
}
