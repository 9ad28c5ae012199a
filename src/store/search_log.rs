//! Search history log.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::db::{new_id, now_ts};
use crate::models::SearchQueryRow;

pub async fn log(
    pool: &SqlitePool,
    query_text: &str,
    filters: &serde_json::Value,
    result_count: i64,
    trace_id: Option<&str>,
) -> Result<String> {
    let search_id = new_id();
    sqlx::query(
        r#"
        INSERT INTO search_query (search_id, query_text, filters_json, result_count, trace_id, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&search_id)
    .bind(query_text)
    .bind(filters.to_string())
    .bind(result_count)
    .bind(trace_id)
    .bind(now_ts())
    .execute(pool)
    .await?;
    Ok(search_id)
}

pub async fn recent(pool: &SqlitePool, limit: i64) -> Result<Vec<SearchQueryRow>> {
    let rows = sqlx::query("SELECT * FROM search_query ORDER BY created_at DESC, search_id DESC LIMIT ?")
        .bind(limit)
        .fetch_all(pool)
        .await?;
    Ok(rows
        .iter()
        .map(|r| SearchQueryRow {
            search_id: r.get("search_id"),
            query_text: r.get("query_text"),
            filters: serde_json::from_str::<serde_json::Value>(
                &r.get::<String, _>("filters_json"),
            )
            .unwrap_or_else(|_| serde_json::json!({})),
            result_count: r.get("result_count"),
            trace_id: r.get("trace_id"),
            created_at: r.get("created_at"),
        })
        .collect())
}
