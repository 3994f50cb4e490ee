use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use feed_rs::parser;
use url::Url;

use crate::config::FetchConfig;
use crate::db::Repository;
use crate::error::{AppError, FetchError, Result};
use crate::models::{Feed, FeedMetadata, FetchLogStatus, FetchOutcome, NewEntry, NewFeed};
use crate::services::content_extractor::{clean_html_text, extract_readable};

use super::extract::{
    dedup_key, extract_doi, extract_duration, extract_enclosure, extract_image, extract_pmid,
    resolve_published, select_feed_icon, ParsedItem,
};
use super::fields::{scan_document, ItemFields};
use super::http::HttpFetch;
use super::policy::{candidate_urls, user_agent_for, RetryPolicy};

/// A successfully downloaded and parsed feed document.
struct FetchedFeed {
    url: String,
    feed: feed_rs::model::Feed,
    channel: ItemFields,
    items: Vec<ItemFields>,
}

pub struct FeedFetcher {
    repo: Repository,
    http: Arc<dyn HttpFetch>,
    config: FetchConfig,
    retry: RetryPolicy,
}

impl FeedFetcher {
    pub fn new(repo: Repository, http: Arc<dyn HttpFetch>, config: FetchConfig) -> Self {
        let retry = RetryPolicy::from_config(&config);
        Self {
            repo,
            http,
            config,
            retry,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Subscribes to `url` and runs its first refresh.
    pub async fn add_feed(&self, url: &str, title: Option<String>) -> Result<(Feed, FetchOutcome)> {
        let url = url.trim();
        let parsed = Url::parse(url)?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(AppError::validation(format!("unsupported feed URL scheme: {}", parsed.scheme())));
        }
        if self.repo.find_feed_by_url(url).await?.is_some() {
            return Err(AppError::validation(format!("already subscribed to {url}")));
        }

        let feed_id = self
            .repo
            .insert_feed(NewFeed {
                url: url.to_string(),
                title,
                update_interval_minutes: None,
            })
            .await?;
        let outcome = self.refresh_feed(feed_id).await?;
        let feed = self
            .repo
            .get_feed(feed_id)
            .await?
            .ok_or_else(|| AppError::not_found("feed", feed_id))?;
        Ok((feed, outcome))
    }

    /// Refreshes every feed in enumeration order, one at a time.
    pub async fn refresh_all_feeds(&self) -> Result<Vec<(i64, FetchOutcome)>> {
        let feeds = self.repo.get_all_feeds().await?;
        tracing::info!("Refreshing {} feeds", feeds.len());

        let mut outcomes = Vec::with_capacity(feeds.len());
        for feed in feeds {
            outcomes.push((feed.id, self.refresh_feed_or_fail(feed.id).await));
        }
        Ok(outcomes)
    }

    /// Like [`refresh_feed`](Self::refresh_feed), but a storage error becomes a failed outcome.
    pub async fn refresh_feed_or_fail(&self, feed_id: i64) -> FetchOutcome {
        match self.refresh_feed(feed_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("Refresh of feed {} aborted: {}", feed_id, e);
                FetchOutcome::failed(e.to_string())
            }
        }
    }

    /// Downloads, parses and stores one feed.
    ///
    /// A failed download or parse is reported in the returned outcome and
    /// recorded on the feed and its fetch log. `Err` is only returned when the
    /// feed does not exist or the fetch log cannot be written.
    pub async fn refresh_feed(&self, feed_id: i64) -> Result<FetchOutcome> {
        let feed = self
            .repo
            .get_feed(feed_id)
            .await?
            .ok_or_else(|| AppError::not_found("feed", feed_id))?;

        let started = Instant::now();
        let log_id = self
            .repo
            .create_fetch_log(feed_id, FetchLogStatus::Running)
            .await?;
        tracing::debug!("Fetching feed {} ({})", feed.display_name(), feed.url);

        let result = self.fetch_and_store(&feed).await;
        let duration_ms = started.elapsed().as_millis() as i64;

        match result {
            Ok(count) => {
                self.repo
                    .finish_fetch_log(log_id, FetchLogStatus::Success, None, duration_ms, count)
                    .await?;
                tracing::info!("Fetched {} new items from {}", count, feed.url);
                Ok(FetchOutcome::succeeded(count))
            }
            Err(e) => {
                let message = e.to_string();
                tracing::warn!("Failed to fetch feed {} ({}): {}", feed_id, feed.url, message);
                if let Err(mark_err) = self
                    .repo
                    .mark_feed_checked(feed_id, Utc::now(), Some(message.clone()))
                    .await
                {
                    tracing::error!("Could not record failure on feed {}: {}", feed_id, mark_err);
                }
                self.repo
                    .finish_fetch_log(
                        log_id,
                        FetchLogStatus::Error,
                        Some(message.clone()),
                        duration_ms,
                        0,
                    )
                    .await?;
                Ok(FetchOutcome::failed(message))
            }
        }
    }

    async fn fetch_and_store(&self, feed: &Feed) -> Result<usize> {
        let fetched = self.download(&feed.url).await?;
        let site_url = self.update_metadata(feed, &fetched).await?;

        let feed_image = fetched
            .channel
            .attr("itunes:image", "href")
            .map(str::to_string)
            .or_else(|| fetched.feed.logo.as_ref().map(|l| l.uri.clone()));

        let raw_items = pair_raw_items(&fetched.feed.entries, fetched.items);

        let mut count = 0;
        for (entry, fields) in fetched.feed.entries.into_iter().zip(raw_items) {
            let item = ParsedItem::from_entry(entry, fields);
            if self
                .store_item(feed, &item, site_url.as_deref(), feed_image.as_deref())
                .await?
            {
                count += 1;
            }
        }

        self.repo.mark_feed_checked(feed.id, Utc::now(), None).await?;
        Ok(count)
    }

    /// Tries every candidate URL under the retry policy; first parseable document wins.
    async fn download(&self, original: &str) -> std::result::Result<FetchedFeed, FetchError> {
        let mut last_error = FetchError::Network(format!("no candidate URLs for {original}"));

        for url in candidate_urls(original, &self.config) {
            let user_agent = user_agent_for(&url, &self.config);
            let mut attempt = 0;
            loop {
                let result = match self.http.get(&url, user_agent).await {
                    Ok(bytes) => parse_document(&url, &bytes),
                    Err(e) => Err(e),
                };
                match result {
                    Ok(fetched) => {
                        if url != original {
                            tracing::info!("Fetched {} via fallback {}", original, url);
                        }
                        return Ok(fetched);
                    }
                    Err(e) => {
                        tracing::debug!("Attempt {} for {} failed: {}", attempt + 1, url, e);
                        let retry = self.retry.should_retry(attempt, &e);
                        last_error = e;
                        if !retry {
                            break;
                        }
                        tokio::time::sleep(self.retry.delay_for(attempt)).await;
                        attempt += 1;
                    }
                }
            }
        }

        Err(last_error)
    }

    /// Applies fetched metadata and returns the site URL used to resolve relative links.
    async fn update_metadata(&self, feed: &Feed, fetched: &FetchedFeed) -> Result<Option<String>> {
        let parsed = &fetched.feed;
        let site_url = parsed
            .links
            .iter()
            .find(|l| l.rel.as_deref().map_or(true, |r| r == "alternate"))
            .map(|l| l.href.clone())
            .or_else(|| feed.site_url.clone());

        let mut candidates: Vec<&str> = Vec::new();
        candidates.extend(parsed.logo.as_ref().map(|i| i.uri.as_str()));
        candidates.extend(parsed.icon.as_ref().map(|i| i.uri.as_str()));
        candidates.extend(fetched.channel.attr("itunes:image", "href"));
        for link in &parsed.links {
            let is_icon = link
                .rel
                .as_deref()
                .is_some_and(|r| r.to_ascii_lowercase().contains("icon"));
            let is_image = link
                .media_type
                .as_deref()
                .is_some_and(|t| t.starts_with("image/"));
            if is_icon || is_image {
                candidates.push(&link.href);
            }
        }
        let favicon_url = select_feed_icon(candidates, site_url.as_deref(), &fetched.url);

        self.repo
            .update_feed_metadata(
                feed.id,
                FeedMetadata {
                    title: parsed
                        .title
                        .as_ref()
                        .map(|t| t.content.trim().to_string())
                        .filter(|t| !t.is_empty()),
                    site_url: site_url.clone(),
                    description: parsed
                        .description
                        .as_ref()
                        .map(|d| d.content.trim().to_string())
                        .filter(|d| !d.is_empty()),
                    favicon_url,
                },
            )
            .await?;

        Ok(site_url)
    }

    /// Stores one item unless its dedup key is missing or already known.
    async fn store_item(
        &self,
        feed: &Feed,
        item: &ParsedItem,
        site_url: Option<&str>,
        feed_image: Option<&str>,
    ) -> Result<bool> {
        let Some(guid) = dedup_key(item) else {
            tracing::debug!("Skipping item without guid, link or title in {}", feed.url);
            return Ok(false);
        };
        if self.repo.find_entry_by_guid(feed.id, &guid).await?.is_some() {
            return Ok(false);
        }

        let published_at = resolve_published(item);
        if published_at.is_none() {
            tracing::warn!(
                "No valid date found for \"{}\" in {}",
                item.title.as_deref().unwrap_or(&guid),
                feed.display_name()
            );
        }

        let content = item.body_html().map(str::to_string);
        let base_url = item.link.as_deref().or(site_url);
        let readability_content = match (content.as_deref(), base_url) {
            (Some(html), Some(base)) => extract_readable(html, base),
            _ => None,
        };
        let categories_json = if item.categories.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&item.categories)?)
        };

        let inserted = self
            .repo
            .insert_entry(NewEntry {
                feed_id: feed.id,
                guid,
                title: item.title.clone(),
                url: item.link.clone(),
                author: item.author.clone(),
                summary: item.summary_source().and_then(clean_html_text),
                content,
                readability_content,
                categories_json,
                published_at,
                enclosure: extract_enclosure(item),
                duration: extract_duration(item),
                image_url: extract_image(item, feed_image),
                doi: extract_doi(item),
                pmid: extract_pmid(item),
            })
            .await?;
        Ok(inserted.is_some())
    }
}

fn parse_document(url: &str, bytes: &[u8]) -> std::result::Result<FetchedFeed, FetchError> {
    let feed = parser::parse(bytes).map_err(|e| FetchError::Parse(e.to_string()))?;
    let raw = scan_document(&String::from_utf8_lossy(bytes));
    Ok(FetchedFeed {
        url: url.to_string(),
        channel: raw.channel,
        items: raw.items,
        feed,
    })
}

/// Matches each parsed entry with its raw item by guid, then link, then
/// title. Each raw item is used once; an entry without a match gets empty
/// fields.
fn pair_raw_items(entries: &[feed_rs::model::Entry], raw: Vec<ItemFields>) -> Vec<ItemFields> {
    let mut pool: Vec<Option<ItemFields>> = raw.into_iter().map(Some).collect();
    let mut unmatched = 0;

    let paired: Vec<ItemFields> = entries
        .iter()
        .map(|entry| {
            let id = entry.id.trim();
            let link = entry.links.first().map(|l| l.href.trim());
            let title = entry.title.as_ref().map(|t| t.content.trim());
            let find = |pick: &dyn Fn(&ItemFields) -> bool| {
                pool.iter()
                    .position(|slot| slot.as_ref().is_some_and(|f| pick(f)))
            };

            let position = find(&|f| f.text("guid").or_else(|| f.text("id")) == Some(id))
                .or_else(|| {
                    link.and_then(|link| {
                        find(&|f| f.text("link").or_else(|| f.attr("link", "href")) == Some(link))
                    })
                })
                .or_else(|| title.and_then(|title| find(&|f| f.text("title") == Some(title))));
            match position.and_then(|i| pool[i].take()) {
                Some(fields) => fields,
                None => {
                    unmatched += 1;
                    ItemFields::default()
                }
            }
        })
        .collect();

    if unmatched > 0 {
        tracing::debug!("{} parsed entries had no matching raw item", unmatched);
    }
    paired
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
  <title>Lab News</title>
  <link>https://lab.example.com/</link>
  <item><title>One</title><link>https://lab.example.com/1</link><guid>a-1</guid></item>
</channel></rss>"#;

    #[test]
    fn parse_document_scans_raw_fields() {
        let fetched = parse_document("https://lab.example.com/rss", RSS.as_bytes()).unwrap();
        assert_eq!(fetched.feed.entries.len(), 1);
        assert_eq!(fetched.items.len(), 1);
        assert_eq!(fetched.items[0].text("guid"), Some("a-1"));
        assert_eq!(fetched.channel.text("title"), Some("Lab News"));
    }

    #[test]
    fn raw_items_pair_by_guid_and_link_not_position() {
        let xml = r#"<rss version="2.0"><channel><title>Blog</title>
  <item><title>A</title><guid>a-1</guid><description><![CDATA[<item>one</item>]]></description></item>
  <item><title>B</title><link>https://blog.example.com/plain</link></item>
</channel></rss>"#;
        let fetched = parse_document("https://blog.example.com/rss", xml.as_bytes()).unwrap();
        assert_eq!(fetched.items.len(), 2);

        let mut raw = fetched.items.clone();
        raw.reverse();
        raw.push(ItemFields::default());
        let paired = pair_raw_items(&fetched.feed.entries, raw);
        assert_eq!(paired.len(), 2);
        assert_eq!(paired[0].text("guid"), Some("a-1"));
        assert_eq!(paired[1].text("link"), Some("https://blog.example.com/plain"));

        // Without raw fields the key still follows the link, never a generated id.
        let bare = ParsedItem::from_entry(fetched.feed.entries[1].clone(), ItemFields::default());
        assert_eq!(dedup_key(&bare).as_deref(), Some("https://blog.example.com/plain"));
    }

    #[test]
    fn malformed_documents_are_parse_errors() {
        let err = parse_document("https://x", b"<html><body>not a feed</body></html>")
            .err()
            .unwrap();
        assert!(matches!(err, FetchError::Parse(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn adding_a_non_http_url_is_rejected() {
        struct Unreachable;
        #[async_trait::async_trait]
        impl HttpFetch for Unreachable {
            async fn get(&self, _: &str, _: &str) -> std::result::Result<Vec<u8>, FetchError> {
                Err(FetchError::Network("offline".into()))
            }
        }

        let repo = Repository::open_in_memory().await.unwrap();
        let fetcher = FeedFetcher::new(repo, Arc::new(Unreachable), FetchConfig::default())
            .with_retry_policy(RetryPolicy {
                max_retries: 0,
                delay: Duration::ZERO,
            });

        assert!(matches!(
            fetcher.add_feed("ftp://example.com/feed", None).await,
            Err(AppError::Validation(_))
        ));

        let (feed, outcome) = fetcher.add_feed("https://example.com/feed", None).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(feed.last_error.as_deref(), Some("network error: offline"));

        assert!(matches!(
            fetcher.add_feed("https://example.com/feed", None).await,
            Err(AppError::Validation(_))
        ));
    }
}
