//! Memory-card repository.
//!
//! The FTS index over `summary` and `content_text` is written in the same
//! transaction as the card row, so full-text search never observes a card
//! without its index entry. Card idempotency — at most one card per
//! `(blob_id, trace_id)` — is enforced here: a duplicate insert returns the
//! existing `memory_id` instead of erroring.

use anyhow::Result;
use sqlx::{Row, SqliteConnection, SqlitePool};

use crate::db::{new_id, now_ts};
use crate::models::MemoryCard;

/// Maximum summary length, enforced at the storage boundary.
pub const MAX_SUMMARY_CHARS: usize = 400;

/// Fields for a new card. `memory_id` is caller-supplied so the pipeline can
/// reference the card (graph nodes, embeddings) before commit.
#[derive(Debug, Clone)]
pub struct NewCard {
    pub memory_id: String,
    pub card_type: String,
    pub summary: String,
    pub content_text: String,
    pub source_time: Option<i64>,
    pub metadata: serde_json::Value,
    pub blob_id: Option<String>,
    pub trace_id: Option<String>,
}

/// List/search filter for [`list`].
#[derive(Debug, Clone, Default)]
pub struct CardFilter {
    pub q: Option<String>,
    pub source_type: Option<String>,
    pub card_type: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

fn clamp_summary(summary: &str) -> String {
    if summary.chars().count() <= MAX_SUMMARY_CHARS {
        return summary.to_string();
    }
    summary.chars().take(MAX_SUMMARY_CHARS).collect()
}

/// Insert a card inside an open transaction, writing the FTS row alongside.
/// Returns the existing `memory_id` when the `(blob_id, trace_id)` pair is
/// already present.
pub async fn insert_on(conn: &mut SqliteConnection, card: &NewCard) -> Result<String> {
    if let (Some(blob_id), Some(trace_id)) = (&card.blob_id, &card.trace_id) {
        let existing: Option<String> = sqlx::query_scalar(
            "SELECT memory_id FROM memory_card WHERE blob_id = ? AND trace_id = ?",
        )
        .bind(blob_id)
        .bind(trace_id)
        .fetch_optional(&mut *conn)
        .await?;
        if let Some(id) = existing {
            return Ok(id);
        }
    }

    let summary = clamp_summary(&card.summary);
    sqlx::query(
        r#"
        INSERT INTO memory_card
            (memory_id, type, summary, content_text, source_time, created_at,
             metadata_json, blob_id, trace_id)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&card.memory_id)
    .bind(&card.card_type)
    .bind(&summary)
    .bind(&card.content_text)
    .bind(card.source_time)
    .bind(now_ts())
    .bind(card.metadata.to_string())
    .bind(&card.blob_id)
    .bind(&card.trace_id)
    .execute(&mut *conn)
    .await?;

    sqlx::query("INSERT INTO memory_card_fts (memory_id, summary, content_text) VALUES (?, ?, ?)")
        .bind(&card.memory_id)
        .bind(&summary)
        .bind(&card.content_text)
        .execute(&mut *conn)
        .await?;

    Ok(card.memory_id.clone())
}

/// Insert a card in its own transaction.
pub async fn insert(pool: &SqlitePool, card: &NewCard) -> Result<String> {
    let mut tx = pool.begin().await?;
    let id = insert_on(&mut *tx, card).await?;
    tx.commit().await?;
    Ok(id)
}

/// Delete a card and everything it owns, in one transaction: the FTS entry,
/// its embedding rows and vector points, and its `mem:` graph node with all
/// edges. Entity nodes left with no remaining edges are swept. The
/// underlying blob is untouched — blob bytes go away only on explicit purge.
/// Returns `false` when no such card exists.
pub async fn delete(pool: &SqlitePool, memory_id: &str) -> Result<bool> {
    let mut tx = pool.begin().await?;

    let exists: Option<String> =
        sqlx::query_scalar("SELECT memory_id FROM memory_card WHERE memory_id = ?")
            .bind(memory_id)
            .fetch_optional(&mut *tx)
            .await?;
    if exists.is_none() {
        return Ok(false);
    }

    sqlx::query("DELETE FROM memory_card_fts WHERE memory_id = ?")
        .bind(memory_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM vector_point WHERE memory_id = ?")
        .bind(memory_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM embedding WHERE memory_id = ?")
        .bind(memory_id)
        .execute(&mut *tx)
        .await?;

    crate::graph::delete_card_node_on(&mut *tx, memory_id).await?;
    crate::graph::gc_orphan_entities_on(&mut *tx).await?;

    sqlx::query("DELETE FROM memory_card WHERE memory_id = ?")
        .bind(memory_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(true)
}

/// Merge keys into a card's metadata (used by the enrichment pipeline).
pub async fn merge_metadata(
    pool: &SqlitePool,
    memory_id: &str,
    patch: &serde_json::Value,
) -> Result<()> {
    let current: Option<String> =
        sqlx::query_scalar("SELECT metadata_json FROM memory_card WHERE memory_id = ?")
            .bind(memory_id)
            .fetch_optional(pool)
            .await?;
    let Some(current) = current else {
        anyhow::bail!("memory card not found: {}", memory_id)
    };

    let mut meta: serde_json::Value =
        serde_json::from_str(&current).unwrap_or_else(|_| serde_json::json!({}));
    if let (Some(obj), Some(patch_obj)) = (meta.as_object_mut(), patch.as_object()) {
        for (k, v) in patch_obj {
            obj.insert(k.clone(), v.clone());
        }
    }

    sqlx::query("UPDATE memory_card SET metadata_json = ? WHERE memory_id = ?")
        .bind(meta.to_string())
        .bind(memory_id)
        .execute(pool)
        .await?;
    Ok(())
}

fn row_to_card(row: &sqlx::sqlite::SqliteRow) -> MemoryCard {
    let metadata: serde_json::Value =
        serde_json::from_str::<serde_json::Value>(&row.get::<String, _>("metadata_json"))
            .unwrap_or_else(|_| serde_json::json!({}));
    MemoryCard {
        memory_id: row.get("memory_id"),
        card_type: row.get("type"),
        summary: row.get("summary"),
        content_text: row.get("content_text"),
        source_time: row.get("source_time"),
        created_at: row.get("created_at"),
        metadata,
        blob_id: row.get("blob_id"),
        trace_id: row.get("trace_id"),
    }
}

const CARD_COLUMNS: &str = "memory_id, type, summary, content_text, source_time, created_at, metadata_json, blob_id, trace_id";

pub async fn get(pool: &SqlitePool, memory_id: &str) -> Result<Option<MemoryCard>> {
    let row = sqlx::query(&format!(
        "SELECT {CARD_COLUMNS} FROM memory_card WHERE memory_id = ?"
    ))
    .bind(memory_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| row_to_card(&r)))
}

/// Lookup by the idempotency key.
pub async fn find_by_blob_trace(
    pool: &SqlitePool,
    blob_id: &str,
    trace_id: &str,
) -> Result<Option<String>> {
    let id: Option<String> =
        sqlx::query_scalar("SELECT memory_id FROM memory_card WHERE blob_id = ? AND trace_id = ?")
            .bind(blob_id)
            .bind(trace_id)
            .fetch_optional(pool)
            .await?;
    Ok(id)
}

/// List cards newest-first, optionally narrowed by FTS query and filters.
pub async fn list(pool: &SqlitePool, filter: &CardFilter) -> Result<Vec<MemoryCard>> {
    let limit = if filter.limit > 0 { filter.limit } else { 50 };

    let rows = if let Some(q) = filter.q.as_deref().filter(|q| !q.trim().is_empty()) {
        let Some(match_expr) = fts_match_expr(q) else {
            return Ok(Vec::new());
        };
        sqlx::query(&format!(
            r#"
            SELECT {CARD_COLUMNS} FROM memory_card
            WHERE memory_id IN
                (SELECT memory_id FROM memory_card_fts WHERE memory_card_fts MATCH ?)
            ORDER BY created_at DESC, memory_id ASC
            LIMIT ? OFFSET ?
            "#
        ))
        .bind(match_expr)
        .bind(limit)
        .bind(filter.offset)
        .fetch_all(pool)
        .await?
    } else {
        sqlx::query(&format!(
            r#"
            SELECT {CARD_COLUMNS} FROM memory_card
            ORDER BY created_at DESC, memory_id ASC
            LIMIT ? OFFSET ?
            "#
        ))
        .bind(limit)
        .bind(filter.offset)
        .fetch_all(pool)
        .await?
    };

    let mut cards: Vec<MemoryCard> = rows.iter().map(row_to_card).collect();
    if let Some(st) = filter.source_type.as_deref() {
        cards.retain(|c| c.source_type() == Some(st));
    }
    if let Some(ct) = filter.card_type.as_deref() {
        cards.retain(|c| c.card_type == ct);
    }
    Ok(cards)
}

/// An FTS candidate: `(memory_id, raw_score, snippet)`. Raw score is the
/// negated engine rank, so higher is better.
#[derive(Debug, Clone)]
pub struct FtsHit {
    pub memory_id: String,
    pub raw_score: f64,
    pub snippet: String,
}

/// Full-text search over summary + content text.
pub async fn fts_search(pool: &SqlitePool, query: &str, limit: i64) -> Result<Vec<FtsHit>> {
    let Some(match_expr) = fts_match_expr(query) else {
        return Ok(Vec::new());
    };

    let rows = sqlx::query(
        r#"
        SELECT memory_id, rank,
               snippet(memory_card_fts, 2, '>>>', '<<<', '...', 24) AS snippet
        FROM memory_card_fts
        WHERE memory_card_fts MATCH ?
        ORDER BY rank
        LIMIT ?
        "#,
    )
    .bind(match_expr)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            let rank: f64 = row.get("rank");
            FtsHit {
                memory_id: row.get("memory_id"),
                raw_score: -rank, // negate so higher = better
                snippet: row.get("snippet"),
            }
        })
        .collect())
}

/// Build a safe FTS5 MATCH expression from free text: quoted tokens OR-ed
/// together. Returns `None` when the query holds no searchable tokens.
pub fn fts_match_expr(query: &str) -> Option<String> {
    let tokens: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" OR "))
    }
}

/// Most recently created cards (for the recency signal and the digest).
pub async fn recent(pool: &SqlitePool, limit: i64) -> Result<Vec<MemoryCard>> {
    let rows = sqlx::query(&format!(
        "SELECT {CARD_COLUMNS} FROM memory_card ORDER BY created_at DESC, memory_id ASC LIMIT ?"
    ))
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(row_to_card).collect())
}

/// Cards created at or after the cutoff, newest-first.
pub async fn created_since(pool: &SqlitePool, cutoff: i64, limit: i64) -> Result<Vec<MemoryCard>> {
    let rows = sqlx::query(&format!(
        "SELECT {CARD_COLUMNS} FROM memory_card WHERE created_at >= ?
         ORDER BY created_at DESC, memory_id ASC LIMIT ?"
    ))
    .bind(cutoff)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(row_to_card).collect())
}

/// Bulk fetch by id; missing ids are silently dropped.
pub async fn fetch_many(pool: &SqlitePool, memory_ids: &[String]) -> Result<Vec<MemoryCard>> {
    let mut cards = Vec::with_capacity(memory_ids.len());
    for id in memory_ids {
        if let Some(card) = get(pool, id).await? {
            cards.push(card);
        }
    }
    Ok(cards)
}

pub async fn count(pool: &SqlitePool) -> Result<i64> {
    Ok(sqlx::query_scalar("SELECT COUNT(*) FROM memory_card")
        .fetch_one(pool)
        .await?)
}

/// Insert an embedding link row inside an open transaction.
pub async fn insert_embedding_on(
    conn: &mut SqliteConnection,
    memory_id: &str,
    modality: &str,
    vector_ref: &str,
) -> Result<String> {
    let embedding_id = new_id();
    sqlx::query(
        "INSERT INTO embedding (embedding_id, memory_id, modality, vector_ref) VALUES (?, ?, ?, ?)",
    )
    .bind(&embedding_id)
    .bind(memory_id)
    .bind(modality)
    .bind(vector_ref)
    .execute(&mut *conn)
    .await?;
    Ok(embedding_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use std::str::FromStr;

    async fn pool() -> SqlitePool {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").unwrap();
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        pool
    }

    fn card(memory_id: &str, blob: Option<&str>, trace: Option<&str>) -> NewCard {
        NewCard {
            memory_id: memory_id.to_string(),
            card_type: "note".to_string(),
            summary: "A note about gardens".to_string(),
            content_text: "Gardens grow knowledge.".to_string(),
            source_time: None,
            metadata: serde_json::json!({"source_type": "api", "pipeline": "text"}),
            blob_id: blob.map(String::from),
            trace_id: trace.map(String::from),
        }
    }

    #[tokio::test]
    async fn duplicate_blob_trace_returns_existing() {
        let pool = pool().await;
        let first = insert(&pool, &card("m1", Some("b1"), Some("t1")))
            .await
            .unwrap();
        let second = insert(&pool, &card("m2", Some("b1"), Some("t1")))
            .await
            .unwrap();
        assert_eq!(first, "m1");
        assert_eq!(second, "m1");
        assert_eq!(count(&pool).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn summary_is_clamped() {
        let pool = pool().await;
        let mut c = card("m1", None, None);
        c.summary = "x".repeat(1000);
        insert(&pool, &c).await.unwrap();
        let got = get(&pool, "m1").await.unwrap().unwrap();
        assert_eq!(got.summary.chars().count(), MAX_SUMMARY_CHARS);
    }

    #[tokio::test]
    async fn fts_finds_content_text() {
        let pool = pool().await;
        insert(&pool, &card("m1", None, None)).await.unwrap();
        let hits = fts_search(&pool, "knowledge", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].memory_id, "m1");
        assert!(hits[0].raw_score.is_finite());
    }

    #[tokio::test]
    async fn fts_expr_survives_punctuation() {
        assert_eq!(
            fts_match_expr("what's a \"garden\"?").as_deref(),
            Some("\"what\" OR \"s\" OR \"a\" OR \"garden\"")
        );
        assert!(fts_match_expr("!?--").is_none());
    }

    #[tokio::test]
    async fn list_filters_by_card_type() {
        let pool = pool().await;
        insert(&pool, &card("m1", None, None)).await.unwrap();
        let mut other = card("m2", None, None);
        other.card_type = "document".to_string();
        insert(&pool, &other).await.unwrap();

        let filter = CardFilter {
            card_type: Some("document".to_string()),
            limit: 10,
            ..Default::default()
        };
        let cards = list(&pool, &filter).await.unwrap();
        assert_eq!(cards.len(), 1);
        assert_eq!(cards[0].memory_id, "m2");
    }

    #[tokio::test]
    async fn delete_removes_card_and_index_entries() {
        let pool = pool().await;
        insert(&pool, &card("m1", Some("b1"), Some("t1"))).await.unwrap();

        assert!(delete(&pool, "m1").await.unwrap());
        assert_eq!(count(&pool).await.unwrap(), 0);
        assert!(get(&pool, "m1").await.unwrap().is_none());
        assert!(fts_search(&pool, "knowledge", 10).await.unwrap().is_empty());

        // Deleting again is a clean miss, not an error.
        assert!(!delete(&pool, "m1").await.unwrap());
    }
}
