//! Persistent job queue with visibility leasing.
//!
//! Delivery is at-least-once: a leased job that fails is re-queued with
//! exponential backoff (`next_run_ts = now + min(60s * 2^attempts, 1h)`)
//! until `max_attempts`, after which it goes `dead`. Dequeue order is FIFO
//! within a type, by `created_ts`. Duplicate cards are prevented downstream
//! by the `(blob_id, trace_id)` idempotency key, not here.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::db::{new_id, now_ts};
use crate::models::Job;

const BACKOFF_BASE_S: i64 = 60;
const BACKOFF_CAP_S: i64 = 3600;

/// Backoff delay in seconds for a job that has failed `attempts` times.
pub fn backoff_seconds(attempts: i64) -> i64 {
    let shift = attempts.clamp(0, 30) as u32;
    BACKOFF_BASE_S.saturating_mul(1_i64 << shift).min(BACKOFF_CAP_S)
}

fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> Job {
    let payload: serde_json::Value =
        serde_json::from_str::<serde_json::Value>(&row.get::<String, _>("payload_json"))
            .unwrap_or_else(|_| serde_json::json!({}));
    Job {
        job_id: row.get("job_id"),
        job_type: row.get("type"),
        status: row.get("status"),
        attempts: row.get("attempts"),
        next_run_ts: row.get("next_run_ts"),
        payload,
        error_text: row.get("error_text"),
        created_ts: row.get("created_ts"),
        updated_ts: row.get("updated_ts"),
    }
}

/// Create a new queued job. A `queued`/`running` job with the same type and
/// payload is not enqueued twice; the existing id is returned.
pub async fn enqueue(
    pool: &SqlitePool,
    job_type: &str,
    payload: &serde_json::Value,
) -> Result<String> {
    let payload_str = payload.to_string();

    let existing: Option<String> = sqlx::query_scalar(
        r#"
        SELECT job_id FROM jobs
        WHERE type = ? AND status IN ('queued', 'running') AND payload_json = ?
        "#,
    )
    .bind(job_type)
    .bind(&payload_str)
    .fetch_optional(pool)
    .await?;
    if let Some(id) = existing {
        return Ok(id);
    }

    let job_id = new_id();
    let now = now_ts();
    sqlx::query(
        r#"
        INSERT INTO jobs (job_id, type, status, attempts, next_run_ts, payload_json, created_ts, updated_ts)
        VALUES (?, ?, 'queued', 0, 0, ?, ?, ?)
        "#,
    )
    .bind(&job_id)
    .bind(job_type)
    .bind(&payload_str)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(job_id)
}

/// Atomically lease the oldest due job of one of the given types.
///
/// Selects the oldest `queued` job, or `error` job whose `next_run_ts` has
/// passed, marks it `running` for this worker, and returns it. The claim is
/// a conditional UPDATE; a concurrent worker that raced us simply retries
/// the selection.
pub async fn lease(
    pool: &SqlitePool,
    worker_id: &str,
    types: &[&str],
    now: i64,
) -> Result<Option<Job>> {
    let type_list = types
        .iter()
        .map(|t| format!("'{}'", t))
        .collect::<Vec<_>>()
        .join(", ");

    loop {
        let row = sqlx::query(&format!(
            r#"
            SELECT * FROM jobs
            WHERE type IN ({type_list})
              AND (status = 'queued' OR (status = 'error' AND next_run_ts <= ?))
            ORDER BY created_ts ASC, job_id ASC
            LIMIT 1
            "#
        ))
        .bind(now)
        .fetch_optional(pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let job_id: String = row.get("job_id");

        let claimed = sqlx::query(
            r#"
            UPDATE jobs SET status = 'running', worker_id = ?, updated_ts = ?
            WHERE job_id = ? AND status IN ('queued', 'error')
            "#,
        )
        .bind(worker_id)
        .bind(now_ts())
        .bind(&job_id)
        .execute(pool)
        .await?;

        if claimed.rows_affected() == 1 {
            let mut job = row_to_job(&row);
            job.status = "running".to_string();
            return Ok(Some(job));
        }
        // Lost the race; try the next candidate.
    }
}

pub async fn complete(pool: &SqlitePool, job_id: &str) -> Result<()> {
    sqlx::query("UPDATE jobs SET status = 'done', updated_ts = ? WHERE job_id = ?")
        .bind(now_ts())
        .bind(job_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Mark a job failed. Increments `attempts`, schedules the retry with
/// exponential backoff, and dead-letters after `max_attempts`. Returns the
/// resulting status (`error` or `dead`).
pub async fn fail(
    pool: &SqlitePool,
    job_id: &str,
    error_text: &str,
    max_attempts: i64,
) -> Result<String> {
    let attempts: Option<i64> = sqlx::query_scalar("SELECT attempts FROM jobs WHERE job_id = ?")
        .bind(job_id)
        .fetch_optional(pool)
        .await?;
    let Some(attempts) = attempts else {
        anyhow::bail!("job not found: {}", job_id)
    };

    let attempts = attempts + 1;
    let status = if attempts >= max_attempts {
        "dead"
    } else {
        "error"
    };
    let next_run_ts = now_ts() + backoff_seconds(attempts);

    sqlx::query(
        r#"
        UPDATE jobs SET status = ?, attempts = ?, next_run_ts = ?, error_text = ?, updated_ts = ?
        WHERE job_id = ?
        "#,
    )
    .bind(status)
    .bind(attempts)
    .bind(next_run_ts)
    .bind(error_text)
    .bind(now_ts())
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(status.to_string())
}

/// Failed jobs whose backoff has elapsed, oldest first.
pub async fn due_for_retry(pool: &SqlitePool, now: i64) -> Result<Vec<Job>> {
    let rows = sqlx::query(
        "SELECT * FROM jobs WHERE status = 'error' AND next_run_ts <= ? ORDER BY created_ts ASC",
    )
    .bind(now)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(row_to_job).collect())
}

pub async fn get(pool: &SqlitePool, job_id: &str) -> Result<Option<Job>> {
    let row = sqlx::query("SELECT * FROM jobs WHERE job_id = ?")
        .bind(job_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| row_to_job(&r)))
}

pub async fn list(pool: &SqlitePool, status: Option<&str>, limit: i64) -> Result<Vec<Job>> {
    let rows = if let Some(status) = status {
        sqlx::query("SELECT * FROM jobs WHERE status = ? ORDER BY created_ts DESC LIMIT ?")
            .bind(status)
            .bind(limit)
            .fetch_all(pool)
            .await?
    } else {
        sqlx::query("SELECT * FROM jobs ORDER BY created_ts DESC LIMIT ?")
            .bind(limit)
            .fetch_all(pool)
            .await?
    };
    Ok(rows.iter().map(row_to_job).collect())
}

/// Job counts keyed by status, for `/capture/status`.
pub async fn counts_by_status(pool: &SqlitePool) -> Result<serde_json::Value> {
    let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
        .fetch_all(pool)
        .await?;
    let mut counts = serde_json::Map::new();
    for row in rows {
        let status: String = row.get("status");
        let n: i64 = row.get("n");
        counts.insert(status, serde_json::json!(n));
    }
    Ok(serde_json::Value::Object(counts))
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
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_seconds(0), 60);
        assert_eq!(backoff_seconds(1), 120);
        assert_eq!(backoff_seconds(2), 240);
        assert_eq!(backoff_seconds(5), 1920);
        assert_eq!(backoff_seconds(6), 3600);
        assert_eq!(backoff_seconds(20), 3600);
    }

    #[tokio::test]
    async fn enqueue_dedups_identical_payload() {
        let pool = pool().await;
        let p = serde_json::json!({"blob_id": "b1"});
        let a = enqueue(&pool, "ingest_blob", &p).await.unwrap();
        let b = enqueue(&pool, "ingest_blob", &p).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn lease_is_fifo_and_exclusive() {
        let pool = pool().await;
        let a = enqueue(&pool, "ingest_blob", &serde_json::json!({"n": 1}))
            .await
            .unwrap();
        let _b = enqueue(&pool, "ingest_blob", &serde_json::json!({"n": 2}))
            .await
            .unwrap();

        let now = now_ts();
        let leased = lease(&pool, "w1", &["ingest_blob"], now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(leased.job_id, a);
        assert_eq!(leased.status, "running");

        // A second lease must not return the running job.
        let second = lease(&pool, "w2", &["ingest_blob"], now)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(second.job_id, a);
    }

    #[tokio::test]
    async fn fail_backs_off_then_dead_letters() {
        let pool = pool().await;
        let id = enqueue(&pool, "ingest_blob", &serde_json::json!({"n": 1}))
            .await
            .unwrap();

        let s1 = fail(&pool, &id, "boom", 3).await.unwrap();
        assert_eq!(s1, "error");
        let job = get(&pool, &id).await.unwrap().unwrap();
        assert_eq!(job.attempts, 1);
        assert!(job.next_run_ts > now_ts());

        // Not yet due: lease skips it.
        assert!(lease(&pool, "w1", &["ingest_blob"], now_ts())
            .await
            .unwrap()
            .is_none());
        // Due in the future: lease claims it.
        let retried = lease(&pool, "w1", &["ingest_blob"], now_ts() + 7200)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(retried.job_id, id);

        fail(&pool, &id, "boom", 3).await.unwrap();
        let s3 = fail(&pool, &id, "boom", 3).await.unwrap();
        assert_eq!(s3, "dead");
        assert!(lease(&pool, "w1", &["ingest_blob"], now_ts() + 100_000)
            .await
            .unwrap()
            .is_none());
    }
}
