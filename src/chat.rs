//! Grounded Q&A: retrieve → weave → verify.
//!
//! Every step is dispatched through the tool registry and recorded on the
//! chat trace exactly like an ingest pipeline. The verifier's verdict
//! decides what the user sees: `pass` returns the woven answer, `revise`
//! returns the corrected answer, `abstain` returns a fixed refusal. Missing
//! evidence is never an internal error.
//!
//! A dropped request (client disconnect) finalizes the trace as `cancelled`
//! via a drop guard.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::SqlitePool;
use tracing::info;

use crate::db::new_id;
use crate::orchestrator::run_step;
use crate::store::{conversations, exec};
use crate::tools::ToolContext;

/// Maximum accepted message length.
const MAX_INPUT_CHARS: usize = 50_000;
/// Reject inputs whose non-printable character ratio exceeds this (signals
/// a probable binary paste).
const MAX_NONPRINTABLE_RATIO: f64 = 0.10;

/// Fixed refusal for the abstain verdict.
pub const ABSTAIN_ANSWER: &str =
    "I don't have enough grounded evidence in your memories to answer that. \
     Try capturing some related material first.";

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub top_k: usize,
    #[serde(default = "default_true")]
    pub use_graph: bool,
    #[serde(default = "default_hops")]
    pub hops: u8,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

fn default_true() -> bool {
    true
}
fn default_hops() -> u8 {
    1
}

#[derive(Debug, Clone, Serialize)]
pub struct CitationOut {
    pub memory_id: String,
    pub title: String,
    pub quote: String,
    pub span_start: i64,
    pub span_end: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatOutcome {
    pub trace_id: String,
    pub conversation_id: String,
    pub turn_id: String,
    pub answer: String,
    pub verdict: String,
    pub citations: Vec<CitationOut>,
    pub evidence: Vec<serde_json::Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("{0}")]
    InvalidInput(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Reject oversized or binary-looking input before any tool runs.
fn security_filter(message: &str) -> Result<(), ChatError> {
    let total = message.chars().count();
    if total == 0 {
        return Err(ChatError::InvalidInput("message must not be empty".into()));
    }
    if total > MAX_INPUT_CHARS {
        return Err(ChatError::InvalidInput(format!(
            "message too long: {} chars (max {})",
            total, MAX_INPUT_CHARS
        )));
    }
    let nonprintable = message
        .chars()
        .filter(|c| c.is_control() && !matches!(c, '\n' | '\r' | '\t'))
        .count();
    if nonprintable as f64 / total as f64 > MAX_NONPRINTABLE_RATIO {
        return Err(ChatError::InvalidInput(
            "message looks like binary data".into(),
        ));
    }
    Ok(())
}

/// Finalizes the trace as `cancelled` when the pipeline future is dropped
/// before completing (HTTP client disconnect).
struct TraceGuard {
    pool: SqlitePool,
    trace_id: String,
    armed: bool,
}

impl TraceGuard {
    fn new(pool: SqlitePool, trace_id: String) -> Self {
        Self {
            pool,
            trace_id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TraceGuard {
    fn drop(&mut self) {
        if self.armed {
            let pool = self.pool.clone();
            let trace_id = self.trace_id.clone();
            tokio::spawn(async move {
                let _ = exec::finish_trace(&pool, &trace_id, "cancelled").await;
            });
        }
    }
}

/// Handle one chat message end to end and persist the turn.
pub async fn chat(ctx: &ToolContext, req: &ChatRequest) -> Result<ChatOutcome, ChatError> {
    security_filter(&req.message)?;

    let trace_id = new_id();
    exec::create_trace(&ctx.pool, &trace_id, &json!({ "kind": "chat" })).await?;
    let mut guard = TraceGuard::new(ctx.pool.clone(), trace_id.clone());

    // ── Retrieve ──
    let retrieval = run_step(
        ctx,
        &trace_id,
        "retrieval",
        json!({
            "query": req.message.clone(),
            "top_k": req.top_k,
            "use_graph": req.use_graph && req.hops > 0,
            "trace_id": trace_id.clone(),
        }),
        &[],
    )
    .await?;
    if !retrieval.ok() {
        exec::finish_trace(&ctx.pool, &trace_id, "error").await?;
        guard.disarm();
        return Err(ChatError::Internal(anyhow::anyhow!(
            "retrieval failed: {}",
            retrieval.error.as_deref().unwrap_or("unknown")
        )));
    }

    let evidence: Vec<serde_json::Value> = retrieval
        .outputs
        .get("results")
        .and_then(|r| r.as_array())
        .map(|hits| {
            hits.iter()
                .map(|hit| {
                    json!({
                        "memory_id": hit.get("memory_id").cloned().unwrap_or(json!("")),
                        "title": hit.get("title").cloned().unwrap_or(json!("untitled")),
                        "summary": hit.get("summary").cloned().unwrap_or(json!("")),
                        "snippet": hit.get("snippet").cloned().unwrap_or(json!("")),
                        "score": hit.get("final_score").cloned().unwrap_or(json!(0.0)),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    // ── Weave ──
    let weave = run_step(
        ctx,
        &trace_id,
        "weaver",
        json!({ "query": req.message.clone(), "evidence": evidence.clone() }),
        &[&retrieval.exec_node_id],
    )
    .await?;
    if !weave.ok() {
        exec::finish_trace(&ctx.pool, &trace_id, "error").await?;
        guard.disarm();
        return Err(ChatError::Internal(anyhow::anyhow!(
            "weaver failed: {}",
            weave.error.as_deref().unwrap_or("unknown")
        )));
    }
    let woven_answer = weave
        .outputs
        .get("answer")
        .and_then(|a| a.as_str())
        .unwrap_or("")
        .to_string();
    let cited_ids: Vec<String> = weave
        .outputs
        .get("cited_memory_ids")
        .and_then(|c| c.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|m| m.as_str())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    // ── Verify ──
    let verify = run_step(
        ctx,
        &trace_id,
        "verifier",
        json!({ "query": req.message.clone(), "answer": woven_answer.clone(), "evidence": evidence.clone() }),
        &[&weave.exec_node_id],
    )
    .await?;
    if !verify.ok() {
        exec::finish_trace(&ctx.pool, &trace_id, "error").await?;
        guard.disarm();
        return Err(ChatError::Internal(anyhow::anyhow!(
            "verifier failed: {}",
            verify.error.as_deref().unwrap_or("unknown")
        )));
    }
    let verdict = verify
        .outputs
        .get("verdict")
        .and_then(|v| v.as_str())
        .unwrap_or("pass")
        .to_string();

    let (final_answer, final_cited): (String, Vec<String>) = match verdict.as_str() {
        "abstain" => (ABSTAIN_ANSWER.to_string(), Vec::new()),
        "revise" => {
            let revised = verify
                .outputs
                .get("revised_answer")
                .and_then(|r| r.as_str())
                .filter(|r| !r.trim().is_empty())
                .unwrap_or(&woven_answer)
                .to_string();
            (revised, cited_ids)
        }
        _ => (woven_answer.clone(), cited_ids),
    };

    // ── Persist ──
    let citations = build_citations(&final_answer, &final_cited, &evidence);
    let conversation_id =
        conversations::ensure_conversation(&ctx.pool, req.conversation_id.as_deref(), &req.message)
            .await?;
    let citation_rows: Vec<(String, String, i64, i64)> = citations
        .iter()
        .map(|c| {
            (
                c.memory_id.clone(),
                c.quote.clone(),
                c.span_start,
                c.span_end,
            )
        })
        .collect();
    let turn_id = conversations::append_turn(
        &ctx.pool,
        &conversations::NewTurn {
            conversation_id: conversation_id.clone(),
            user_text: req.message.clone(),
            assistant_text: final_answer.clone(),
            verdict: verdict.clone(),
            trace_id: trace_id.clone(),
            citations: serde_json::to_value(&citations).unwrap_or(json!([])),
            evidence: json!(evidence.clone()),
        },
        &citation_rows,
    )
    .await?;

    exec::finish_trace(&ctx.pool, &trace_id, "ok").await?;
    guard.disarm();

    info!(
        trace_id = %&trace_id[..12.min(trace_id.len())],
        verdict = %verdict,
        citations = citations.len(),
        "chat turn complete"
    );

    Ok(ChatOutcome {
        trace_id,
        conversation_id,
        turn_id,
        answer: final_answer,
        verdict,
        citations,
        evidence,
    })
}

/// One citation per cited memory, with the `[title]` token span located in
/// the final answer where present.
fn build_citations(
    answer: &str,
    cited_ids: &[String],
    evidence: &[serde_json::Value],
) -> Vec<CitationOut> {
    cited_ids
        .iter()
        .filter_map(|memory_id| {
            let ev = evidence
                .iter()
                .find(|e| e.get("memory_id").and_then(|m| m.as_str()) == Some(memory_id.as_str()))?;
            let title = ev
                .get("title")
                .and_then(|t| t.as_str())
                .unwrap_or("untitled")
                .to_string();
            let quote: String = ev
                .get("summary")
                .and_then(|s| s.as_str())
                .unwrap_or("")
                .chars()
                .take(200)
                .collect();

            let token = format!("[{}]", title);
            let (span_start, span_end) = match answer.find(&token) {
                Some(start) => (start as i64, (start + token.len()) as i64),
                None => (0, 0),
            };

            Some(CitationOut {
                memory_id: memory_id.clone(),
                title,
                quote,
                span_start,
                span_end,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_rejects_oversized_input() {
        let long = "x".repeat(MAX_INPUT_CHARS + 1);
        assert!(matches!(
            security_filter(&long),
            Err(ChatError::InvalidInput(_))
        ));
    }

    #[test]
    fn filter_rejects_binary_paste() {
        let binary: String = (0..100u8).map(|b| (b % 32) as char).collect();
        assert!(matches!(
            security_filter(&binary),
            Err(ChatError::InvalidInput(_))
        ));
    }

    #[test]
    fn filter_accepts_normal_text() {
        assert!(security_filter("What did I read about Rust last week?").is_ok());
    }

    #[test]
    fn citations_locate_token_spans() {
        let evidence = vec![json!({
            "memory_id": "m1",
            "title": "notes.md",
            "summary": "Rust notes.",
        })];
        let answer = "Per [notes.md], ownership rules apply.";
        let citations = build_citations(answer, &["m1".to_string()], &evidence);
        assert_eq!(citations.len(), 1);
        assert_eq!(citations[0].span_start, 4);
        assert_eq!(
            &answer[citations[0].span_start as usize..citations[0].span_end as usize],
            "[notes.md]"
        );
    }
}
