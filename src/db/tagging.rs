//! Tag definitions, entry↔tag edges, per-entry analysis status and the
//! singleton pipeline settings row that carries `tags_version`.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row, Transaction};

use crate::error::{AppError, Result};
use crate::models::{
    AnalysisStats, AnalysisStatus, Entry, EntryAnalysisStatus, EntryQuery, EntryTag, MatchMode,
    NewTag, Page, TagUpdate, Upserted, UserTag,
};

use super::repository::{entry_from_row, format_timestamp, parse_datetime, ENTRY_COLUMNS};
use super::Repository;

const TAG_COLUMNS: &str =
    "id, name, description, match_mode, match_rules, enabled, sort_order, created_at";

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub tags_version: i64,
    pub auto_tagging: bool,
    pub auto_tagging_start_at: Option<DateTime<Utc>>,
}

impl Repository {
    // Pipeline settings

    pub async fn pipeline_settings(&self) -> Result<PipelineSettings> {
        let settings = self
            .conn
            .call(|conn| {
                let settings = conn.query_row(
                    "SELECT tags_version, auto_tagging, auto_tagging_start_at
                     FROM pipeline_settings WHERE id = 1",
                    [],
                    |row| {
                        Ok(PipelineSettings {
                            tags_version: row.get(0)?,
                            auto_tagging: row.get::<_, i64>(1)? != 0,
                            auto_tagging_start_at: row
                                .get::<_, Option<String>>(2)?
                                .and_then(|s| parse_datetime(&s)),
                        })
                    },
                )?;
                Ok(settings)
            })
            .await?;
        Ok(settings)
    }

    pub async fn tags_version(&self) -> Result<i64> {
        Ok(self.pipeline_settings().await?.tags_version)
    }

    /// Turns auto-tagging on or off. The start marker is stamped only on the
    /// off→on transition so historical entries are not backfilled by default.
    pub async fn set_auto_tagging(&self, enabled: bool, now: DateTime<Utc>) -> Result<PipelineSettings> {
        let now = format_timestamp(now);
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE pipeline_settings SET
                         auto_tagging_start_at = CASE
                             WHEN ?1 = 1 AND auto_tagging = 0 THEN ?2
                             ELSE auto_tagging_start_at
                         END,
                         auto_tagging = ?1,
                         updated_at = ?2
                     WHERE id = 1",
                    params![enabled as i64, now],
                )?;
                Ok(())
            })
            .await?;
        self.pipeline_settings().await
    }

    pub async fn stamp_auto_tagging_start(&self, at: DateTime<Utc>) -> Result<()> {
        let at = format_timestamp(at);
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE pipeline_settings SET auto_tagging_start_at = ?1, updated_at = ?1
                     WHERE id = 1",
                    params![at],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // Tag definitions (every change bumps tags_version)

    pub async fn create_tag(&self, tag: NewTag) -> Result<UserTag> {
        if tag.name.trim().is_empty() {
            return Err(AppError::validation("tag name must not be empty"));
        }
        let rules = rules_json(&tag.match_rules)?;
        let now = format_timestamp(Utc::now());
        let id = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let sort_order: i64 = tx.query_row(
                    "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM user_tags",
                    [],
                    |row| row.get(0),
                )?;
                tx.execute(
                    "INSERT INTO user_tags
                         (name, description, match_mode, match_rules, enabled, sort_order,
                          created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                    params![
                        tag.name.trim(),
                        tag.description,
                        tag.match_mode.as_str(),
                        rules,
                        tag.enabled,
                        sort_order,
                        now
                    ],
                )?;
                let id = tx.last_insert_rowid();
                bump_tags_version(&tx, &now)?;
                tx.commit()?;
                Ok(id)
            })
            .await?;
        self.get_tag(id)
            .await?
            .ok_or_else(|| AppError::not_found("tag", id))
    }

    pub async fn update_tag(&self, id: i64, update: TagUpdate) -> Result<UserTag> {
        if update.is_empty() {
            return self
                .get_tag(id)
                .await?
                .ok_or_else(|| AppError::not_found("tag", id));
        }
        let set_description = update.description.is_some();
        let description = update.description.flatten();
        let set_rules = update.match_rules.is_some();
        let rules = match update.match_rules.flatten() {
            Some(rules) => rules_json(&rules)?,
            None => None,
        };
        let now = format_timestamp(Utc::now());
        let changed = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let changed = tx.execute(
                    "UPDATE user_tags SET
                         name = COALESCE(?1, name),
                         description = CASE WHEN ?2 THEN ?3 ELSE description END,
                         match_mode = COALESCE(?4, match_mode),
                         match_rules = CASE WHEN ?5 THEN ?6 ELSE match_rules END,
                         enabled = COALESCE(?7, enabled),
                         updated_at = ?8
                     WHERE id = ?9",
                    params![
                        update.name.as_deref().map(str::trim),
                        set_description,
                        description,
                        update.match_mode.map(|m| m.as_str()),
                        set_rules,
                        rules,
                        update.enabled,
                        now,
                        id
                    ],
                )?;
                if changed > 0 {
                    bump_tags_version(&tx, &now)?;
                }
                tx.commit()?;
                Ok(changed)
            })
            .await?;
        if changed == 0 {
            return Err(AppError::not_found("tag", id));
        }
        self.get_tag(id)
            .await?
            .ok_or_else(|| AppError::not_found("tag", id))
    }

    /// Deletes a tag and, through the foreign key, all of its entry edges.
    pub async fn delete_tag(&self, id: i64) -> Result<bool> {
        let now = format_timestamp(Utc::now());
        let deleted = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let deleted = tx.execute("DELETE FROM user_tags WHERE id = ?1", params![id])?;
                if deleted > 0 {
                    bump_tags_version(&tx, &now)?;
                }
                tx.commit()?;
                Ok(deleted > 0)
            })
            .await?;
        Ok(deleted)
    }

    pub async fn get_tag(&self, id: i64) -> Result<Option<UserTag>> {
        let tag = self
            .conn
            .call(move |conn| {
                let sql = format!("SELECT {TAG_COLUMNS} FROM user_tags WHERE id = ?1");
                let tag = conn.query_row(&sql, params![id], tag_from_row).optional()?;
                Ok(tag)
            })
            .await?;
        Ok(tag)
    }

    pub async fn enabled_tags(&self) -> Result<Vec<UserTag>> {
        let tags = self
            .conn
            .call(|conn| {
                let sql = format!(
                    "SELECT {TAG_COLUMNS} FROM user_tags WHERE enabled = 1 ORDER BY sort_order, id"
                );
                let mut stmt = conn.prepare(&sql)?;
                let tags = stmt
                    .query_map([], tag_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(tags)
            })
            .await?;
        Ok(tags)
    }

    // Entry ↔ tag edges

    /// Adds one edge. A manual add upgrades an existing automatic edge; an
    /// automatic add never touches an existing edge.
    pub async fn add_entry_tag(&self, entry_id: i64, tag_id: i64, is_manual: bool) -> Result<()> {
        let now = format_timestamp(Utc::now());
        self.conn
            .call(move |conn| {
                let sql = if is_manual {
                    "INSERT INTO entry_tags (entry_id, tag_id, is_manual, created_at)
                     VALUES (?1, ?2, 1, ?3)
                     ON CONFLICT(entry_id, tag_id) DO UPDATE SET is_manual = 1"
                } else {
                    "INSERT INTO entry_tags (entry_id, tag_id, is_manual, created_at)
                     VALUES (?1, ?2, 0, ?3)
                     ON CONFLICT(entry_id, tag_id) DO NOTHING"
                };
                conn.execute(sql, params![entry_id, tag_id, now])?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn remove_entry_tag(&self, entry_id: i64, tag_id: i64) -> Result<bool> {
        let removed = self
            .conn
            .call(move |conn| {
                let removed = conn.execute(
                    "DELETE FROM entry_tags WHERE entry_id = ?1 AND tag_id = ?2",
                    params![entry_id, tag_id],
                )?;
                Ok(removed > 0)
            })
            .await?;
        Ok(removed)
    }

    pub async fn entry_tags(&self, entry_id: i64) -> Result<Vec<EntryTag>> {
        let edges = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT et.entry_id, et.tag_id, et.is_manual, et.created_at
                     FROM entry_tags et
                     JOIN user_tags t ON t.id = et.tag_id
                     WHERE et.entry_id = ?1
                     ORDER BY t.sort_order, t.id",
                )?;
                let edges = stmt
                    .query_map(params![entry_id], |row| {
                        Ok(EntryTag {
                            entry_id: row.get(0)?,
                            tag_id: row.get(1)?,
                            is_manual: row.get::<_, i64>(2)? != 0,
                            created_at: row
                                .get::<_, String>(3)
                                .ok()
                                .and_then(|s| parse_datetime(&s))
                                .unwrap_or_else(Utc::now),
                        })
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(edges)
            })
            .await?;
        Ok(edges)
    }

    /// Replaces the automatic edges of an entry with `tag_ids` and marks it
    /// analyzed at `tags_version`, in one transaction. Manual edges survive.
    pub async fn commit_analysis(
        &self,
        entry_id: i64,
        tag_ids: Vec<i64>,
        tags_version: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let now = format_timestamp(now);
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM entry_tags WHERE entry_id = ?1 AND is_manual = 0",
                    params![entry_id],
                )?;
                {
                    let mut insert = tx.prepare(
                        "INSERT INTO entry_tags (entry_id, tag_id, is_manual, created_at)
                         VALUES (?1, ?2, 0, ?3)
                         ON CONFLICT(entry_id, tag_id) DO NOTHING",
                    )?;
                    for tag_id in &tag_ids {
                        insert.execute(params![entry_id, tag_id, now])?;
                    }
                }
                upsert_status(&tx, entry_id, AnalysisStatus::Analyzed, Some(&now), tags_version)?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // Analysis status

    pub async fn get_analysis_status(&self, entry_id: i64) -> Result<Option<EntryAnalysisStatus>> {
        let status = self
            .conn
            .call(move |conn| {
                let status = conn
                    .query_row(
                        "SELECT entry_id, status, analyzed_at, tags_version
                         FROM entry_analysis_status WHERE entry_id = ?1",
                        params![entry_id],
                        status_from_row,
                    )
                    .optional()?;
                Ok(status)
            })
            .await?;
        Ok(status)
    }

    /// Creates a `pending` status row at version 0 unless one exists.
    pub async fn ensure_analysis_status(&self, entry_id: i64) -> Result<Upserted<EntryAnalysisStatus>> {
        let upserted = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let inserted = tx.execute(
                    "INSERT INTO entry_analysis_status (entry_id, status, analyzed_at, tags_version)
                     VALUES (?1, 'pending', NULL, 0)
                     ON CONFLICT(entry_id) DO NOTHING",
                    params![entry_id],
                )?;
                let status = tx.query_row(
                    "SELECT entry_id, status, analyzed_at, tags_version
                     FROM entry_analysis_status WHERE entry_id = ?1",
                    params![entry_id],
                    status_from_row,
                )?;
                tx.commit()?;
                Ok(if inserted > 0 {
                    Upserted::Created(status)
                } else {
                    Upserted::Existing(status)
                })
            })
            .await?;
        Ok(upserted)
    }

    pub async fn set_analysis_status(
        &self,
        entry_id: i64,
        status: AnalysisStatus,
        tags_version: i64,
    ) -> Result<()> {
        let now = format_timestamp(Utc::now());
        self.conn
            .call(move |conn| {
                let analyzed_at = (status == AnalysisStatus::Analyzed).then_some(now.as_str());
                upsert_status(conn, entry_id, status, analyzed_at, tags_version)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Entries awaiting analysis: no status row, `pending`, or `analyzed` at a
    /// tag generation older than `current_version`.
    pub async fn pending_entries(
        &self,
        start_at: Option<DateTime<Utc>>,
        current_version: i64,
        query: EntryQuery,
    ) -> Result<Page<Entry>> {
        let condition = "(eas.entry_id IS NULL
             OR eas.status = 'pending'
             OR (eas.status = 'analyzed' AND eas.tags_version < :version))";
        self.paged_entries(condition, start_at, Some(current_version), query)
            .await
    }

    /// Analyzed entries that ended up with no tag edges at all.
    pub async fn entries_without_tags(
        &self,
        start_at: Option<DateTime<Utc>>,
        query: EntryQuery,
    ) -> Result<Page<Entry>> {
        let condition = "eas.status = 'analyzed'
             AND NOT EXISTS (SELECT 1 FROM entry_tags et WHERE et.entry_id = e.id)";
        self.paged_entries(condition, start_at, None, query).await
    }

    async fn paged_entries(
        &self,
        condition: &'static str,
        start_at: Option<DateTime<Utc>>,
        version: Option<i64>,
        query: EntryQuery,
    ) -> Result<Page<Entry>> {
        let lower_bound = query.backfill_since.or(start_at).map(format_timestamp);
        let cursor = query.cursor.map(|(at, id)| (format_timestamp(at), id));
        let limit = query.limit.max(1);

        let mut rows = self
            .conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT {ENTRY_COLUMNS}
                     FROM entries e
                     JOIN feeds f ON f.id = e.feed_id
                     LEFT JOIN entry_analysis_status eas ON eas.entry_id = e.id
                     WHERE f.ai_tagging_enabled = 1
                       AND {condition}
                       AND (:since IS NULL OR e.inserted_at >= :since)
                       AND (:cursor_at IS NULL
                            OR e.inserted_at < :cursor_at
                            OR (e.inserted_at = :cursor_at AND e.id < :cursor_id))
                     ORDER BY e.inserted_at DESC, e.id DESC
                     LIMIT :limit"
                );
                let mut stmt = conn.prepare(&sql)?;
                let (cursor_at, cursor_id) = match cursor {
                    Some((at, id)) => (Some(at), Some(id)),
                    None => (None, None),
                };
                let limit_plus_one = (limit + 1) as i64;
                let mut named: Vec<(&str, &dyn rusqlite::ToSql)> = vec![
                    (":since", &lower_bound),
                    (":cursor_at", &cursor_at),
                    (":cursor_id", &cursor_id),
                    (":limit", &limit_plus_one),
                ];
                if let Some(version) = version.as_ref() {
                    named.push((":version", version));
                }
                let rows = stmt
                    .query_map(named.as_slice(), entry_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let has_more = rows.len() > limit;
        rows.truncate(limit);
        let next_cursor = if has_more {
            rows.last().map(|e| (e.inserted_at, e.id))
        } else {
            None
        };
        Ok(Page {
            items: rows,
            next_cursor,
            has_more,
        })
    }

    pub async fn analysis_stats(
        &self,
        start_at: Option<DateTime<Utc>>,
        current_version: i64,
    ) -> Result<AnalysisStats> {
        let since = start_at.map(format_timestamp);
        let stats = self
            .conn
            .call(move |conn| {
                let stats = conn.query_row(
                    "SELECT
                         COALESCE(SUM(CASE
                             WHEN eas.entry_id IS NULL OR eas.status = 'pending'
                                  OR (eas.status = 'analyzed' AND eas.tags_version < ?2)
                             THEN 1 ELSE 0 END), 0),
                         COALESCE(SUM(CASE
                             WHEN eas.status = 'analyzed' AND eas.tags_version >= ?2
                             THEN 1 ELSE 0 END), 0),
                         COALESCE(SUM(CASE WHEN eas.status = 'skipped' THEN 1 ELSE 0 END), 0),
                         COALESCE(SUM(CASE
                             WHEN eas.status = 'analyzed'
                                  AND EXISTS (SELECT 1 FROM entry_tags et WHERE et.entry_id = e.id)
                             THEN 1 ELSE 0 END), 0),
                         COALESCE(SUM(CASE
                             WHEN eas.status = 'analyzed'
                                  AND NOT EXISTS (SELECT 1 FROM entry_tags et WHERE et.entry_id = e.id)
                             THEN 1 ELSE 0 END), 0)
                     FROM entries e
                     JOIN feeds f ON f.id = e.feed_id
                     LEFT JOIN entry_analysis_status eas ON eas.entry_id = e.id
                     WHERE f.ai_tagging_enabled = 1
                       AND (?1 IS NULL OR e.inserted_at >= ?1)",
                    params![since, current_version],
                    |row| {
                        Ok(AnalysisStats {
                            pending: row.get(0)?,
                            analyzed: row.get(1)?,
                            skipped: row.get(2)?,
                            with_tags: row.get(3)?,
                            without_tags: row.get(4)?,
                        })
                    },
                )?;
                Ok(stats)
            })
            .await?;
        Ok(stats)
    }
}

fn rules_json(rules: &[crate::models::TagMatchRule]) -> Result<Option<String>> {
    if rules.is_empty() {
        Ok(None)
    } else {
        Ok(Some(serde_json::to_string(rules)?))
    }
}

fn bump_tags_version(tx: &Transaction<'_>, now: &str) -> rusqlite::Result<()> {
    tx.execute(
        "UPDATE pipeline_settings SET tags_version = tags_version + 1, updated_at = ?1
         WHERE id = 1",
        params![now],
    )?;
    Ok(())
}

fn upsert_status(
    conn: &rusqlite::Connection,
    entry_id: i64,
    status: AnalysisStatus,
    analyzed_at: Option<&str>,
    tags_version: i64,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO entry_analysis_status (entry_id, status, analyzed_at, tags_version)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(entry_id) DO UPDATE SET
             status = excluded.status,
             analyzed_at = excluded.analyzed_at,
             tags_version = excluded.tags_version",
        params![entry_id, status.as_str(), analyzed_at, tags_version],
    )?;
    Ok(())
}

fn tag_from_row(row: &Row) -> rusqlite::Result<UserTag> {
    let mode: String = row.get(3)?;
    Ok(UserTag {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        match_mode: MatchMode::parse(&mode),
        match_rules: row.get(4)?,
        enabled: row.get::<_, i64>(5)? != 0,
        sort_order: row.get(6)?,
        created_at: row
            .get::<_, String>(7)
            .ok()
            .and_then(|s| parse_datetime(&s))
            .unwrap_or_else(Utc::now),
    })
}

fn status_from_row(row: &Row) -> rusqlite::Result<EntryAnalysisStatus> {
    let status: String = row.get(1)?;
    Ok(EntryAnalysisStatus {
        entry_id: row.get(0)?,
        status: AnalysisStatus::parse(&status).unwrap_or(AnalysisStatus::Pending),
        analyzed_at: row
            .get::<_, Option<String>>(2)?
            .and_then(|s| parse_datetime(&s)),
        tags_version: row.get(3)?,
    })
}
