//! Embedding storage. Each vectorized entry owns one `vector_records` row and
//! one `vector_index` row keyed by the record id. Search is an exact cosine
//! scan over the index.

use chrono::Utc;
use rusqlite::params;

use crate::error::{AppError, Result};
use crate::models::{Entry, NewVectorRecord, VectorHit};

use super::repository::{entry_from_row, format_timestamp, ENTRY_COLUMNS};
use super::Repository;

impl Repository {
    /// Entries with no vector record whose content is longer than `min_len`
    /// characters, newest first.
    pub async fn entries_without_vectors(&self, limit: usize, min_len: usize) -> Result<Vec<Entry>> {
        let entries = self
            .conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT {ENTRY_COLUMNS}
                     FROM entries e
                     LEFT JOIN vector_records v ON v.entry_id = e.id
                     WHERE v.id IS NULL
                       AND LENGTH(COALESCE(e.readability_content, e.content, '')) > ?1
                     ORDER BY e.inserted_at DESC, e.id DESC
                     LIMIT ?2"
                );
                let mut stmt = conn.prepare(&sql)?;
                let entries = stmt
                    .query_map(params![min_len as i64, limit as i64], entry_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(entries)
            })
            .await?;
        Ok(entries)
    }

    /// Writes the metadata row and its vector in one transaction.
    pub async fn insert_vector_record(&self, record: NewVectorRecord) -> Result<i64> {
        if record.embedding.is_empty() {
            return Err(AppError::embedding("refusing to store an empty vector"));
        }
        let now = format_timestamp(Utc::now());
        let published_at = record.published_at.map(format_timestamp);
        let id = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO vector_records
                         (entry_id, feed_id, title, content, published_at, url, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        record.entry_id,
                        record.feed_id,
                        record.title,
                        record.content,
                        published_at,
                        record.url,
                        now
                    ],
                )?;
                let record_id = tx.last_insert_rowid();
                tx.execute(
                    "INSERT INTO vector_index (record_id, dim, embedding) VALUES (?1, ?2, ?3)",
                    params![
                        record_id,
                        record.embedding.len() as i64,
                        encode_vector(&record.embedding)
                    ],
                )?;
                tx.commit()?;
                Ok(record_id)
            })
            .await?;
        Ok(id)
    }

    pub async fn has_vector(&self, entry_id: i64) -> Result<bool> {
        let exists = self
            .conn
            .call(move |conn| {
                let exists: bool = conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM vector_records WHERE entry_id = ?1)",
                    params![entry_id],
                    |row| row.get(0),
                )?;
                Ok(exists)
            })
            .await?;
        Ok(exists)
    }

    pub async fn count_vectors(&self) -> Result<i64> {
        let count = self
            .conn
            .call(|conn| {
                let count: i64 =
                    conn.query_row("SELECT COUNT(*) FROM vector_index", [], |row| row.get(0))?;
                Ok(count)
            })
            .await?;
        Ok(count)
    }

    /// The `k` records closest to `query`, ascending by cosine distance.
    /// Vectors of a different dimension are ignored.
    pub async fn nearest_vectors(&self, query: Vec<f32>, k: usize) -> Result<Vec<VectorHit>> {
        if query.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        let hits = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT r.entry_id, r.feed_id, r.title, r.content, r.published_at, r.url,
                            i.embedding
                     FROM vector_index i
                     JOIN vector_records r ON r.id = i.record_id
                     WHERE i.dim = ?1",
                )?;
                let mut rows = stmt.query(params![query.len() as i64])?;
                let mut hits = Vec::new();
                while let Some(row) = rows.next()? {
                    let blob: Vec<u8> = row.get(6)?;
                    let Some(vector) = decode_vector(&blob) else {
                        continue;
                    };
                    hits.push(VectorHit {
                        entry_id: row.get(0)?,
                        feed_id: row.get(1)?,
                        title: row.get(2)?,
                        content: row.get(3)?,
                        published_at: row.get(4)?,
                        url: row.get(5)?,
                        distance: cosine_distance(&query, &vector),
                    });
                }
                hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
                hits.truncate(k);
                Ok(hits)
            })
            .await?;
        Ok(hits)
    }
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_vector(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

/// `1 - cos(a, b)`; zero vectors are maximally distant.
pub(crate) fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let (mut dot, mut na, mut nb) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 2.0;
    }
    1.0 - dot / (na.sqrt() * nb.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewEntry, NewFeed};
    use chrono::TimeZone;

    async fn repo_with_entry(content: &str) -> (Repository, i64, i64) {
        let repo = Repository::open_in_memory().await.unwrap();
        let feed_id = repo
            .insert_feed(NewFeed {
                url: "https://example.com/rss".into(),
                title: None,
                update_interval_minutes: None,
            })
            .await
            .unwrap();
        let entry_id = repo
            .insert_entry(NewEntry {
                feed_id,
                guid: "1".into(),
                title: Some("Hello".into()),
                content: Some(content.into()),
                ..Default::default()
            })
            .await
            .unwrap()
            .unwrap();
        (repo, feed_id, entry_id)
    }

    fn record(entry_id: i64, feed_id: i64, embedding: Vec<f32>) -> NewVectorRecord {
        NewVectorRecord {
            entry_id,
            feed_id,
            title: "Hello".into(),
            content: "Hello body".into(),
            published_at: None,
            url: None,
            embedding,
        }
    }

    #[test]
    fn blob_layout_is_little_endian_f32() {
        let blob = encode_vector(&[1.0, -2.5]);
        assert_eq!(blob.len(), 8);
        assert_eq!(decode_vector(&blob), Some(vec![1.0, -2.5]));
        assert_eq!(decode_vector(&blob[..3]), None);
    }

    #[test]
    fn cosine_distance_orders_by_angle() {
        let q = [1.0, 0.0];
        assert!(cosine_distance(&q, &[1.0, 0.0]).abs() < 1e-6);
        assert!((cosine_distance(&q, &[0.0, 1.0]) - 1.0).abs() < 1e-6);
        assert!((cosine_distance(&q, &[-1.0, 0.0]) - 2.0).abs() < 1e-6);
        assert_eq!(cosine_distance(&q, &[0.0, 0.0]), 2.0);
    }

    #[tokio::test]
    async fn short_content_is_not_a_candidate() {
        let (repo, _, _) = repo_with_entry("tiny").await;
        assert!(repo.entries_without_vectors(10, 50).await.unwrap().is_empty());
        assert_eq!(repo.entries_without_vectors(10, 2).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stored_vector_removes_candidate_and_is_searchable() {
        let body = "x".repeat(80);
        let (repo, feed_id, entry_id) = repo_with_entry(&body).await;
        assert_eq!(repo.entries_without_vectors(10, 50).await.unwrap().len(), 1);

        let published = Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).unwrap();
        repo.insert_vector_record(NewVectorRecord {
            published_at: Some(published),
            ..record(entry_id, feed_id, vec![0.0, 1.0])
        })
        .await
        .unwrap();

        assert!(repo.has_vector(entry_id).await.unwrap());
        assert!(repo.entries_without_vectors(10, 50).await.unwrap().is_empty());

        let hits = repo.nearest_vectors(vec![0.0, 2.0], 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry_id, entry_id);
        assert_eq!(hits[0].published_at.as_deref(), Some("2026-03-01T09:30:00.000Z"));
        assert!(hits[0].distance.abs() < 1e-6);

        assert!(repo.nearest_vectors(vec![1.0, 0.0, 0.0], 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_record_rolls_back_index_row() {
        let body = "y".repeat(80);
        let (repo, feed_id, entry_id) = repo_with_entry(&body).await;
        repo.insert_vector_record(record(entry_id, feed_id, vec![1.0]))
            .await
            .unwrap();

        assert!(repo
            .insert_vector_record(record(entry_id, feed_id, vec![1.0]))
            .await
            .is_err());
        assert_eq!(repo.count_vectors().await.unwrap(), 1);
    }
}
