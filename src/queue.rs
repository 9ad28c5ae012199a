//! Job workers.
//!
//! N workers (config `queue.workers`) each lease one job at a time via the
//! atomic [`jobs::lease`] and hand it to the orchestrator. Workers share no
//! mutable state beyond the database. Delivery is at-least-once; the card
//! idempotency key makes replays harmless.
//!
//! Trace policy: the first delivery of a job uses the trace id minted into
//! its payload; a retry after failure mints a fresh trace so traces stay
//! append-only.

use anyhow::Result;
use std::time::Duration;
use tracing::{info, warn};

use crate::db::{new_id, now_ts};
use crate::models::{EnrichPayload, IngestPayload};
use crate::orchestrator;
use crate::store::jobs;
use crate::tools::ToolContext;

const IDLE_SLEEP: Duration = Duration::from_millis(500);
const JOB_TYPES: &[&str] = &["ingest_blob", "enrich_card"];

/// Lease and process one due job. Returns `false` when the queue is idle.
pub async fn process_one(ctx: &ToolContext, worker_id: &str) -> Result<bool> {
    let Some(job) = jobs::lease(&ctx.pool, worker_id, JOB_TYPES, now_ts()).await? else {
        return Ok(false);
    };

    info!(
        worker = worker_id,
        job_id = %&job.job_id[..12.min(job.job_id.len())],
        job_type = %job.job_type,
        attempt = job.attempts + 1,
        "claimed job"
    );

    let result = handle_job(ctx, &job).await;
    match result {
        Ok(()) => {
            jobs::complete(&ctx.pool, &job.job_id).await?;
            info!(job_id = %&job.job_id[..12.min(job.job_id.len())], "job done");
        }
        Err(err) => {
            let status = jobs::fail(
                &ctx.pool,
                &job.job_id,
                &err.to_string(),
                ctx.config.queue.max_job_attempts,
            )
            .await?;
            warn!(
                job_id = %&job.job_id[..12.min(job.job_id.len())],
                status = %status,
                error = %err,
                "job failed"
            );
        }
    }
    Ok(true)
}

async fn handle_job(ctx: &ToolContext, job: &crate::models::Job) -> Result<()> {
    match job.job_type.as_str() {
        "ingest_blob" => {
            let payload: IngestPayload = serde_json::from_value(job.payload.clone())?;
            // A retried attempt gets its own trace; the payload trace id only
            // covers the first delivery.
            let trace_id = if job.attempts > 0 || payload.trace_id.is_empty() {
                new_id()
            } else {
                payload.trace_id.clone()
            };
            let outcome = orchestrator::ingest_blob(ctx, &payload, &trace_id).await?;
            info!(
                trace_id = %&outcome.trace_id[..12.min(outcome.trace_id.len())],
                pipeline = %outcome.pipeline,
                status = %outcome.status,
                memory_id = outcome.memory_id.as_deref().unwrap_or("-"),
                "ingest complete"
            );
            Ok(())
        }
        "enrich_card" => {
            let payload: EnrichPayload = serde_json::from_value(job.payload.clone())?;
            let trace_id = if job.attempts > 0 || payload.trace_id.is_empty() {
                new_id()
            } else {
                payload.trace_id.clone()
            };
            orchestrator::enrich_card(ctx, &payload.memory_id, &trace_id).await?;
            Ok(())
        }
        other => anyhow::bail!("unknown job type: {}", other),
    }
}

/// Process everything currently due, then return. Used by `eg scan --process`
/// and the test suite.
pub async fn drain(ctx: &ToolContext, worker_id: &str) -> Result<u64> {
    let mut processed = 0;
    while process_one(ctx, worker_id).await? {
        processed += 1;
    }
    Ok(processed)
}

/// Run forever: lease, process, sleep briefly when idle.
pub async fn worker_loop(ctx: ToolContext, worker_id: String) {
    info!(worker = %worker_id, "job worker started");
    loop {
        match process_one(&ctx, &worker_id).await {
            Ok(true) => {}
            Ok(false) => tokio::time::sleep(IDLE_SLEEP).await,
            Err(err) => {
                warn!(worker = %worker_id, error = %err, "worker loop error");
                tokio::time::sleep(IDLE_SLEEP).await;
            }
        }
    }
}
