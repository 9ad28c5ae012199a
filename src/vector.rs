//! Vector index over a SQLite BLOB table.
//!
//! Points are idempotent by `point_id` and carry a modality (`text` or
//! `vision`). A point starts unattached (`memory_id` NULL) when it is
//! produced mid-pipeline or for a query embedding; card commit attaches it.
//! Search only considers attached points, so scratch query embeddings never
//! pollute results.
//!
//! Vectors are encoded as little-endian `f32` bytes. Search is brute-force
//! cosine over one modality — adequate for a personal corpus and trivially
//! swappable for a real ANN backend behind the same functions.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

/// Encode a vector as little-endian bytes for BLOB storage.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vec.len() * 4);
    for v in vec {
        blob.extend_from_slice(&v.to_le_bytes());
    }
    blob
}

/// Decode a BLOB back into a vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Cosine similarity between two vectors; 0.0 when either is degenerate.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut na = 0.0f64;
    let mut nb = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        na += (*x as f64) * (*x as f64);
        nb += (*y as f64) * (*y as f64);
    }
    if na <= 0.0 || nb <= 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

/// Idempotent point upsert. Re-upserting the same `point_id` replaces the
/// vector and keeps any existing attachment.
pub async fn upsert_point(
    pool: &SqlitePool,
    point_id: &str,
    modality: &str,
    vector: &[f32],
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO vector_point (point_id, memory_id, modality, embedding)
        VALUES (?, NULL, ?, ?)
        ON CONFLICT(point_id) DO UPDATE SET
            modality = excluded.modality,
            embedding = excluded.embedding
        "#,
    )
    .bind(point_id)
    .bind(modality)
    .bind(vec_to_blob(vector))
    .execute(pool)
    .await?;
    Ok(())
}

/// Attach a point to a card (called from the commit transaction).
pub async fn attach_point_on(
    conn: &mut sqlx::SqliteConnection,
    point_id: &str,
    memory_id: &str,
) -> Result<()> {
    sqlx::query("UPDATE vector_point SET memory_id = ? WHERE point_id = ?")
        .bind(memory_id)
        .bind(point_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn get_vector(pool: &SqlitePool, point_id: &str) -> Result<Option<Vec<f32>>> {
    let blob: Option<Vec<u8>> =
        sqlx::query_scalar("SELECT embedding FROM vector_point WHERE point_id = ?")
            .bind(point_id)
            .fetch_optional(pool)
            .await?;
    Ok(blob.map(|b| blob_to_vec(&b)))
}

/// Brute-force cosine search over attached points of one modality.
/// Returns `(memory_id, score)` pairs, best-first, score clamped to [0,1].
pub async fn search(
    pool: &SqlitePool,
    modality: &str,
    query: &[f32],
    limit: i64,
) -> Result<Vec<(String, f64)>> {
    let rows = sqlx::query(
        "SELECT memory_id, embedding FROM vector_point WHERE modality = ? AND memory_id IS NOT NULL",
    )
    .bind(modality)
    .fetch_all(pool)
    .await?;

    let mut scored: Vec<(String, f64)> = rows
        .iter()
        .map(|r| {
            let memory_id: String = r.get("memory_id");
            let vec = blob_to_vec(&r.get::<Vec<u8>, _>("embedding"));
            let score = cosine_similarity(query, &vec).clamp(0.0, 1.0);
            (memory_id, score)
        })
        .filter(|(_, score)| *score > 0.0)
        .collect();

    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
    scored.truncate(limit as usize);
    Ok(scored)
}

/// Liveness probe for the health endpoint.
pub async fn status(pool: &SqlitePool) -> bool {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM vector_point")
        .fetch_one(pool)
        .await
        .is_ok()
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

    #[test]
    fn blob_round_trip() {
        let v = vec![0.5f32, -1.25, 3.0, 0.0];
        assert_eq!(blob_to_vec(&vec_to_blob(&v)), v);
    }

    #[test]
    fn cosine_basics() {
        let a = [1.0f32, 0.0];
        let b = [1.0f32, 0.0];
        let c = [0.0f32, 1.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-9);
        assert!(cosine_similarity(&a, &c).abs() < 1e-9);
        assert_eq!(cosine_similarity(&a, &[0.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn unattached_points_are_invisible() {
        let pool = pool().await;
        upsert_point(&pool, "p1", "text", &[1.0, 0.0]).await.unwrap();
        assert!(search(&pool, "text", &[1.0, 0.0], 10).await.unwrap().is_empty());

        let mut conn = pool.acquire().await.unwrap();
        attach_point_on(&mut *conn, "p1", "m1").await.unwrap();
        drop(conn);

        let hits = search(&pool, "text", &[1.0, 0.0], 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "m1");
        assert!((hits[0].1 - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn upsert_is_idempotent_by_point_id() {
        let pool = pool().await;
        upsert_point(&pool, "p1", "text", &[1.0, 0.0]).await.unwrap();
        upsert_point(&pool, "p1", "text", &[0.0, 1.0]).await.unwrap();

        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM vector_point")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(get_vector(&pool, "p1").await.unwrap().unwrap(), vec![0.0, 1.0]);
    }
}
