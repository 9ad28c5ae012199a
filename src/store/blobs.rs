//! Source, blob, and file-state repositories for the capture subsystem.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::db::{new_id, now_ts};
use crate::models::{Blob, FileState};

/// Insert or return the existing source for a URI.
pub async fn upsert_source(pool: &SqlitePool, uri: &str, source_type: &str) -> Result<String> {
    let existing: Option<String> = sqlx::query_scalar("SELECT source_id FROM source WHERE uri = ?")
        .bind(uri)
        .fetch_optional(pool)
        .await?;
    if let Some(id) = existing {
        return Ok(id);
    }

    let source_id = new_id();
    sqlx::query("INSERT INTO source (source_id, source_type, uri, created_ts) VALUES (?, ?, ?, ?)")
        .bind(&source_id)
        .bind(source_type)
        .bind(uri)
        .bind(now_ts())
        .execute(pool)
        .await?;
    Ok(source_id)
}

/// Insert or update a blob, deduped by `(sha256, path)`. Identical bytes at
/// two paths are two blobs sharing one sha.
pub async fn upsert_blob(
    pool: &SqlitePool,
    sha256: &str,
    path: &str,
    mime: &str,
    size_bytes: i64,
    source_id: &str,
) -> Result<String> {
    let existing: Option<String> =
        sqlx::query_scalar("SELECT blob_id FROM blob WHERE sha256 = ? AND path = ?")
            .bind(sha256)
            .bind(path)
            .fetch_optional(pool)
            .await?;

    if let Some(blob_id) = existing {
        sqlx::query("UPDATE blob SET mime = ?, size_bytes = ?, source_id = ? WHERE blob_id = ?")
            .bind(mime)
            .bind(size_bytes)
            .bind(source_id)
            .bind(&blob_id)
            .execute(pool)
            .await?;
        return Ok(blob_id);
    }

    let blob_id = new_id();
    sqlx::query(
        r#"
        INSERT INTO blob (blob_id, sha256, path, mime, size_bytes, source_id, created_ts)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&blob_id)
    .bind(sha256)
    .bind(path)
    .bind(mime)
    .bind(size_bytes)
    .bind(source_id)
    .bind(now_ts())
    .execute(pool)
    .await?;
    Ok(blob_id)
}

fn row_to_blob(row: &sqlx::sqlite::SqliteRow) -> Blob {
    Blob {
        blob_id: row.get("blob_id"),
        sha256: row.get("sha256"),
        path: row.get("path"),
        mime: row.get("mime"),
        size_bytes: row.get("size_bytes"),
        source_id: row.get("source_id"),
        created_ts: row.get("created_ts"),
    }
}

pub async fn get(pool: &SqlitePool, blob_id: &str) -> Result<Option<Blob>> {
    let row = sqlx::query("SELECT * FROM blob WHERE blob_id = ?")
        .bind(blob_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| row_to_blob(&r)))
}

pub async fn find_by_sha(pool: &SqlitePool, sha256: &str) -> Result<Vec<Blob>> {
    let rows = sqlx::query("SELECT * FROM blob WHERE sha256 = ? ORDER BY created_ts ASC")
        .bind(sha256)
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(row_to_blob).collect())
}

pub async fn get_file_state(pool: &SqlitePool, path: &str) -> Result<Option<FileState>> {
    let row = sqlx::query("SELECT * FROM file_state WHERE path = ?")
        .bind(path)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| FileState {
        path: r.get("path"),
        mtime_ns: r.get("mtime_ns"),
        size_bytes: r.get("size_bytes"),
        sha256: r.get("sha256"),
        last_seen_ts: r.get("last_seen_ts"),
    }))
}

pub async fn upsert_file_state(
    pool: &SqlitePool,
    path: &str,
    mtime_ns: i64,
    size_bytes: i64,
    sha256: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO file_state (path, mtime_ns, size_bytes, sha256, last_seen_ts)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(path) DO UPDATE SET
            mtime_ns = excluded.mtime_ns,
            size_bytes = excluded.size_bytes,
            sha256 = excluded.sha256,
            last_seen_ts = excluded.last_seen_ts
        "#,
    )
    .bind(path)
    .bind(mtime_ns)
    .bind(size_bytes)
    .bind(sha256)
    .bind(now_ts())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn tracked_file_count(pool: &SqlitePool) -> Result<i64> {
    Ok(sqlx::query_scalar("SELECT COUNT(*) FROM file_state")
        .fetch_one(pool)
        .await?)
}

pub async fn blob_count(pool: &SqlitePool) -> Result<i64> {
    Ok(sqlx::query_scalar("SELECT COUNT(*) FROM blob")
        .fetch_one(pool)
        .await?)
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

    #[tokio::test]
    async fn source_dedup_by_uri() {
        let pool = pool().await;
        let a = upsert_source(&pool, "/watch", "filesystem").await.unwrap();
        let b = upsert_source(&pool, "/watch", "filesystem").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn same_sha_distinct_paths_are_two_blobs() {
        let pool = pool().await;
        let src = upsert_source(&pool, "/watch", "filesystem").await.unwrap();
        let a = upsert_blob(&pool, "abc", "/watch/a.txt", "text/plain", 3, &src)
            .await
            .unwrap();
        let b = upsert_blob(&pool, "abc", "/watch/b.txt", "text/plain", 3, &src)
            .await
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(find_by_sha(&pool, "abc").await.unwrap().len(), 2);

        // Same (sha, path) is one blob
        let a2 = upsert_blob(&pool, "abc", "/watch/a.txt", "text/plain", 3, &src)
            .await
            .unwrap();
        assert_eq!(a, a2);
    }
}
