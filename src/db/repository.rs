use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tokio_rusqlite::Connection;

use crate::error::{AppError, Result};
use crate::models::{
    Entry, Feed, FeedMetadata, FetchLog, FetchLogStatus, NewEntry, NewFeed,
};

use super::schema::SCHEMA;

/// Columns selected for every [`Entry`] read, in `entry_from_row` order.
pub(crate) const ENTRY_COLUMNS: &str = "e.id, e.feed_id, e.guid, e.title, e.url, e.author, \
     e.summary, e.content, e.readability_content, e.categories_json, e.published_at, \
     e.inserted_at, e.read, e.starred, e.enclosure_url, e.enclosure_type, e.enclosure_length, \
     e.duration, e.image_url, e.doi, e.pmid";

const FEED_COLUMNS: &str = "id, url, title, site_url, description, favicon_url, last_checked_at, \
     last_error, update_interval_minutes, ai_tagging_enabled, created_at";

#[derive(Clone)]
pub struct Repository {
    pub(crate) conn: Connection,
}

impl Repository {
    pub async fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).await?;
        Self::init(conn).await
    }

    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self> {
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;

        Ok(Self { conn })
    }

    // Feed operations

    pub async fn insert_feed(&self, feed: NewFeed) -> Result<i64> {
        let now = format_timestamp(Utc::now());
        let id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO feeds (url, title, update_interval_minutes, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?4)",
                    params![feed.url, feed.title, feed.update_interval_minutes, now],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        Ok(id)
    }

    pub async fn get_feed(&self, id: i64) -> Result<Option<Feed>> {
        let feed = self
            .conn
            .call(move |conn| {
                let sql = format!("SELECT {FEED_COLUMNS} FROM feeds WHERE id = ?1");
                let feed = conn
                    .query_row(&sql, params![id], feed_from_row)
                    .optional()?;
                Ok(feed)
            })
            .await?;
        Ok(feed)
    }

    pub async fn find_feed_by_url(&self, url: &str) -> Result<Option<Feed>> {
        let url = url.to_string();
        let feed = self
            .conn
            .call(move |conn| {
                let sql = format!("SELECT {FEED_COLUMNS} FROM feeds WHERE url = ?1");
                let feed = conn
                    .query_row(&sql, params![url], feed_from_row)
                    .optional()?;
                Ok(feed)
            })
            .await?;
        Ok(feed)
    }

    /// All feeds in enumeration (insertion) order.
    pub async fn get_all_feeds(&self) -> Result<Vec<Feed>> {
        let feeds = self
            .conn
            .call(|conn| {
                let sql = format!("SELECT {FEED_COLUMNS} FROM feeds ORDER BY id");
                let mut stmt = conn.prepare(&sql)?;
                let feeds = stmt
                    .query_map([], feed_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(feeds)
            })
            .await?;
        Ok(feeds)
    }

    /// Applies fetched metadata; `None` fields never clear a stored value.
    pub async fn update_feed_metadata(&self, id: i64, meta: FeedMetadata) -> Result<()> {
        let now = format_timestamp(Utc::now());
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE feeds SET
                         title = COALESCE(?1, title),
                         site_url = COALESCE(?2, site_url),
                         description = COALESCE(?3, description),
                         favicon_url = COALESCE(?4, favicon_url),
                         updated_at = ?5
                     WHERE id = ?6",
                    params![meta.title, meta.site_url, meta.description, meta.favicon_url, now, id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Records a fetch attempt. `last_checked_at` never moves backwards.
    pub async fn mark_feed_checked(
        &self,
        id: i64,
        checked_at: DateTime<Utc>,
        error: Option<String>,
    ) -> Result<()> {
        let checked = format_timestamp(checked_at);
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE feeds SET
                         last_checked_at = CASE
                             WHEN last_checked_at IS NULL OR last_checked_at < ?1 THEN ?1
                             ELSE last_checked_at
                         END,
                         last_error = ?2,
                         updated_at = ?1
                     WHERE id = ?3",
                    params![checked, error, id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn set_feed_tagging_enabled(&self, id: i64, enabled: bool) -> Result<()> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE feeds SET ai_tagging_enabled = ?1 WHERE id = ?2",
                    params![enabled, id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn delete_feed(&self, id: i64) -> Result<()> {
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM feeds WHERE id = ?1", params![id])?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // Entry operations

    pub async fn find_entry_by_guid(&self, feed_id: i64, guid: &str) -> Result<Option<Entry>> {
        let guid = guid.to_string();
        let entry = self
            .conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT {ENTRY_COLUMNS} FROM entries e WHERE e.feed_id = ?1 AND e.guid = ?2"
                );
                let entry = conn
                    .query_row(&sql, params![feed_id, guid], entry_from_row)
                    .optional()?;
                Ok(entry)
            })
            .await?;
        Ok(entry)
    }

    pub async fn get_entry(&self, id: i64) -> Result<Option<Entry>> {
        let entry = self
            .conn
            .call(move |conn| {
                let sql = format!("SELECT {ENTRY_COLUMNS} FROM entries e WHERE e.id = ?1");
                let entry = conn.query_row(&sql, params![id], entry_from_row).optional()?;
                Ok(entry)
            })
            .await?;
        Ok(entry)
    }

    /// Inserts a new entry. Returns `None` when `(feed_id, guid)` already exists;
    /// existing rows, including their `inserted_at`, are never touched.
    pub async fn insert_entry(&self, entry: NewEntry) -> Result<Option<i64>> {
        let inserted_at = format_timestamp(Utc::now());
        let id = self
            .conn
            .call(move |conn| {
                let (enclosure_url, enclosure_type, enclosure_length) = match entry.enclosure {
                    Some(enc) => (Some(enc.url), enc.mime_type, enc.length),
                    None => (None, None, None),
                };
                let changed = conn.execute(
                    r#"INSERT INTO entries (
                           feed_id, guid, title, url, author, summary, content,
                           readability_content, categories_json, published_at, inserted_at,
                           enclosure_url, enclosure_type, enclosure_length, duration,
                           image_url, doi, pmid)
                       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                               ?15, ?16, ?17, ?18)
                       ON CONFLICT(feed_id, guid) DO NOTHING"#,
                    params![
                        entry.feed_id,
                        entry.guid,
                        entry.title,
                        entry.url,
                        entry.author,
                        entry.summary,
                        entry.content,
                        entry.readability_content,
                        entry.categories_json,
                        entry.published_at.map(format_timestamp),
                        inserted_at,
                        enclosure_url,
                        enclosure_type,
                        enclosure_length,
                        entry.duration,
                        entry.image_url,
                        entry.doi,
                        entry.pmid,
                    ],
                )?;
                Ok((changed > 0).then(|| conn.last_insert_rowid()))
            })
            .await?;
        Ok(id)
    }

    pub async fn count_entries_for_feed(&self, feed_id: i64) -> Result<i64> {
        let count = self
            .conn
            .call(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM entries WHERE feed_id = ?1",
                    params![feed_id],
                    |row| row.get(0),
                )?;
                Ok(count)
            })
            .await?;
        Ok(count)
    }

    // Fetch log operations

    pub async fn create_fetch_log(&self, feed_id: i64, status: FetchLogStatus) -> Result<i64> {
        let started_at = format_timestamp(Utc::now());
        let id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO fetch_logs (feed_id, status, started_at) VALUES (?1, ?2, ?3)",
                    params![feed_id, status.as_str(), started_at],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        Ok(id)
    }

    /// Moves a log into a terminal state. Returns `false` if the log had
    /// already finished, so each log is finalized exactly once.
    pub async fn finish_fetch_log(
        &self,
        id: i64,
        status: FetchLogStatus,
        message: Option<String>,
        duration_ms: i64,
        item_count: usize,
    ) -> Result<bool> {
        if !status.is_terminal() {
            return Err(AppError::validation(format!(
                "fetch log cannot finish as {}",
                status.as_str()
            )));
        }
        let finished_at = format_timestamp(Utc::now());
        let updated = self
            .conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE fetch_logs SET status = ?1, message = ?2, finished_at = ?3,
                         duration_ms = ?4, item_count = ?5
                     WHERE id = ?6 AND status IN ('pending', 'running')",
                    params![
                        status.as_str(),
                        message,
                        finished_at,
                        duration_ms,
                        item_count as i64,
                        id
                    ],
                )?;
                Ok(changed > 0)
            })
            .await?;
        Ok(updated)
    }

    pub async fn get_fetch_log(&self, id: i64) -> Result<Option<FetchLog>> {
        let log = self
            .conn
            .call(move |conn| {
                let log = conn
                    .query_row(
                        "SELECT id, feed_id, status, message, started_at, finished_at,
                                duration_ms, item_count
                         FROM fetch_logs WHERE id = ?1",
                        params![id],
                        fetch_log_from_row,
                    )
                    .optional()?;
                Ok(log)
            })
            .await?;
        Ok(log)
    }

    pub async fn recent_fetch_logs(&self, feed_id: i64, limit: usize) -> Result<Vec<FetchLog>> {
        let logs = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, feed_id, status, message, started_at, finished_at,
                            duration_ms, item_count
                     FROM fetch_logs WHERE feed_id = ?1
                     ORDER BY id DESC LIMIT ?2",
                )?;
                let logs = stmt
                    .query_map(params![feed_id, limit as i64], fetch_log_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(logs)
            })
            .await?;
        Ok(logs)
    }
}

/// Canonical timestamp text: RFC 3339, millisecond precision, `Z` suffix.
/// Uniform width keeps lexicographic order equal to chronological order.
pub(crate) fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    // Try RFC3339 first (e.g., "2026-01-11T12:34:56+00:00")
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    // Try SQLite datetime format (e.g., "2026-01-11 12:34:56")
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    None
}

fn optional_datetime(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    Ok(row
        .get::<_, Option<String>>(idx)?
        .and_then(|s| parse_datetime(&s)))
}

fn required_datetime(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    Ok(optional_datetime(row, idx)?.unwrap_or_else(Utc::now))
}

fn feed_from_row(row: &Row) -> rusqlite::Result<Feed> {
    Ok(Feed {
        id: row.get(0)?,
        url: row.get(1)?,
        title: row.get(2)?,
        site_url: row.get(3)?,
        description: row.get(4)?,
        favicon_url: row.get(5)?,
        last_checked_at: optional_datetime(row, 6)?,
        last_error: row.get(7)?,
        update_interval_minutes: row.get(8)?,
        ai_tagging_enabled: row.get::<_, i64>(9)? != 0,
        created_at: required_datetime(row, 10)?,
    })
}

pub(crate) fn entry_from_row(row: &Row) -> rusqlite::Result<Entry> {
    Ok(Entry {
        id: row.get(0)?,
        feed_id: row.get(1)?,
        guid: row.get(2)?,
        title: row.get(3)?,
        url: row.get(4)?,
        author: row.get(5)?,
        summary: row.get(6)?,
        content: row.get(7)?,
        readability_content: row.get(8)?,
        categories_json: row.get(9)?,
        published_at: optional_datetime(row, 10)?,
        inserted_at: required_datetime(row, 11)?,
        read: row.get::<_, i64>(12)? != 0,
        starred: row.get::<_, i64>(13)? != 0,
        enclosure_url: row.get(14)?,
        enclosure_type: row.get(15)?,
        enclosure_length: row.get(16)?,
        duration: row.get(17)?,
        image_url: row.get(18)?,
        doi: row.get(19)?,
        pmid: row.get(20)?,
    })
}

fn fetch_log_from_row(row: &Row) -> rusqlite::Result<FetchLog> {
    let status: String = row.get(2)?;
    Ok(FetchLog {
        id: row.get(0)?,
        feed_id: row.get(1)?,
        status: FetchLogStatus::parse(&status).unwrap_or(FetchLogStatus::Pending),
        message: row.get(3)?,
        started_at: required_datetime(row, 4)?,
        finished_at: optional_datetime(row, 5)?,
        duration_ms: row.get(6)?,
        item_count: row.get(7)?,
    })
}
