//! Ingestion orchestrator.
//!
//! Routes a blob to a pipeline by MIME and extension, drives each step
//! through the tool registry, and materializes the run as an execution DAG
//! (`exec_trace` → `exec_node`s → `exec_edge`s) instead of hiding it in
//! stack frames.
//!
//! # Pipelines
//!
//! | Class | Pipeline |
//! |-------|----------|
//! | document | `doc_parse → summarizer → extractor → text_embed → graph_builder` |
//! | image | `(ocr ∥ vision_embed) → summarizer → extractor → text_embed → graph_builder` |
//! | audio | `asr → summarizer → extractor → text_embed → graph_builder` |
//! | unknown / oversize | placeholder card, no content pipeline |
//!
//! # Failure semantics
//!
//! A parse-step failure (doc_parse / ocr / asr) commits a minimal
//! placeholder card so the artifact stays visible, marks the trace `error`,
//! and completes the job. Any later step failure marks the trace `error`
//! and propagates to job-level retry — no card is committed, so the retry
//! (on a fresh trace) cannot duplicate one.
//!
//! # Commit
//!
//! One transaction inserts the card (+FTS), the embedding rows, the `mem:`
//! node, and the entity nodes and MENTIONS edges, then the trace is
//! finalized `ok`.

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::db::new_id;
use crate::models::{GraphEdge, GraphNode, IngestPayload};
use crate::store::{blobs, cards, exec};
use crate::tools::ToolContext;
use crate::vector;

pub const PIPELINE_VERSION: &str = "1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pipeline {
    Doc,
    Image,
    Audio,
    Placeholder,
}

impl Pipeline {
    pub fn as_str(&self) -> &'static str {
        match self {
            Pipeline::Doc => "doc",
            Pipeline::Image => "ocr",
            Pipeline::Audio => "asr",
            Pipeline::Placeholder => "placeholder",
        }
    }
}

const DOC_EXTENSIONS: &[&str] = &[
    "txt", "md", "json", "csv", "log", "pdf", "docx", "pptx", "html", "htm",
];
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "bmp", "tiff", "tif", "webp", "svg"];
const AUDIO_EXTENSIONS: &[&str] = &["wav", "mp3", "m4a", "ogg", "flac", "aac", "opus", "wma"];

fn file_ext(path: &str) -> String {
    std::path::Path::new(path)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

fn file_name(path: &str) -> String {
    std::path::Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string())
}

/// Routing table: MIME first, extension as fallback. Files above the size
/// cap and unrecognized formats take the placeholder path.
pub fn choose_pipeline(mime: &str, path: &str, size_bytes: i64, max_bytes: i64) -> Pipeline {
    if size_bytes > max_bytes {
        return Pipeline::Placeholder;
    }
    let ext = file_ext(path);

    if mime.starts_with("image/") || IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        return Pipeline::Image;
    }
    if mime.starts_with("audio/") || AUDIO_EXTENSIONS.contains(&ext.as_str()) {
        return Pipeline::Audio;
    }
    if mime.starts_with("text/")
        || mime == "application/pdf"
        || mime == "application/json"
        || mime.starts_with("application/vnd.openxmlformats-officedocument")
        || DOC_EXTENSIONS.contains(&ext.as_str())
    {
        return Pipeline::Doc;
    }
    Pipeline::Placeholder
}

#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub trace_id: String,
    pub memory_id: Option<String>,
    pub pipeline: String,
    /// `ok`, `placeholder`, or `idempotent_skip`.
    pub status: String,
}

/// One executed step: its exec node, terminal state, and outputs.
pub(crate) struct StepResult {
    pub exec_node_id: String,
    pub state: String,
    pub outputs: Value,
    pub error: Option<String>,
}

impl StepResult {
    pub fn ok(&self) -> bool {
        self.state == "ok"
    }

    pub fn text(&self) -> &str {
        self.outputs.get("text").and_then(|t| t.as_str()).unwrap_or("")
    }
}

/// Run one pipeline step: insert the exec node (state `running`), dispatch
/// through the registry under the caller-supplied call id, set the terminal
/// state, and link every predecessor with an `on_ok` (or `on_error`) edge.
/// Errors are storage-level only; tool failure is in the returned state.
pub(crate) async fn run_step(
    ctx: &ToolContext,
    trace_id: &str,
    tool_name: &str,
    inputs: Value,
    preds: &[&str],
) -> Result<StepResult> {
    let call_id = new_id();
    let timeout_ms = ctx
        .registry
        .get(tool_name)
        .map(|t| t.timeout_ms() as i64)
        .unwrap_or(10_000);

    let exec_node_id = exec::create_node(&ctx.pool, trace_id, &call_id, tool_name, timeout_ms).await?;
    if preds.is_empty() {
        exec::set_root_call(&ctx.pool, trace_id, &call_id).await?;
    }

    let (state, outputs, error) = match ctx.dispatch_as(&call_id, tool_name, inputs, Some(trace_id)).await
    {
        Ok(outcome) => ("ok".to_string(), outcome.outputs, None),
        Err(err) => (err.node_state().to_string(), json!({}), Some(err.to_string())),
    };

    exec::update_node_state(&ctx.pool, &exec_node_id, &state).await?;
    let condition = if state == "ok" { "on_ok" } else { "on_error" };
    for pred in preds {
        exec::create_edge(&ctx.pool, trace_id, pred, &exec_node_id, condition).await?;
    }

    if let Some(err) = &error {
        warn!(trace_id = %&trace_id[..12.min(trace_id.len())], tool = tool_name, error = %err, "step failed");
    }

    Ok(StepResult {
        exec_node_id,
        state,
        outputs,
        error,
    })
}

/// Everything the commit transaction writes alongside the card.
struct CommitArgs {
    card: cards::NewCard,
    text_ref: Option<String>,
    vision_ref: Option<String>,
    graph_outputs: Option<Value>,
}

async fn commit_card(ctx: &ToolContext, args: CommitArgs) -> Result<String> {
    let mut tx = ctx.pool.begin().await?;

    let memory_id = cards::insert_on(&mut *tx, &args.card).await?;

    if let Some(text_ref) = &args.text_ref {
        cards::insert_embedding_on(&mut *tx, &memory_id, "text", text_ref).await?;
        vector::attach_point_on(&mut *tx, text_ref, &memory_id).await?;
    }
    if let Some(vision_ref) = &args.vision_ref {
        cards::insert_embedding_on(&mut *tx, &memory_id, "vision", vision_ref).await?;
        vector::attach_point_on(&mut *tx, vision_ref, &memory_id).await?;
    }

    if let Some(graph_outputs) = &args.graph_outputs {
        let nodes: Vec<GraphNode> = graph_outputs
            .get("nodes")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();
        let edges: Vec<GraphEdge> = graph_outputs
            .get("edges")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();
        crate::graph::upsert_nodes_on(&mut *tx, &nodes).await?;
        crate::graph::upsert_edges_on(&mut *tx, &edges).await?;
    }

    tx.commit().await?;
    Ok(memory_id)
}

fn base_metadata(payload: &IngestPayload, pipeline: Pipeline, trace_id: &str) -> Value {
    json!({
        "source_type": "filesystem",
        "pipeline": pipeline.as_str(),
        "pipeline_version": PIPELINE_VERSION,
        "blob_id": payload.blob_id,
        "source_id": payload.source_id,
        "file_path": payload.path,
        "mime": payload.mime,
        "size_bytes": payload.size_bytes,
        "sha256": payload.sha256,
        "trace_id": trace_id,
    })
}

/// Commit the minimal placeholder card for artifacts that cannot (or must
/// not) be parsed. Always succeeds so the artifact stays visible.
async fn commit_placeholder(
    ctx: &ToolContext,
    payload: &IngestPayload,
    trace_id: &str,
    memory_id: &str,
    error_kind: &str,
) -> Result<String> {
    let name = file_name(&payload.path);
    let mut metadata = base_metadata(payload, Pipeline::Placeholder, trace_id);
    metadata["type"] = json!("placeholder");
    metadata["error"] = json!(error_kind);

    let summary = format!(
        "File captured; parsing skipped ({error_kind}). File: {name} | Size: {} bytes | MIME: {}",
        payload.size_bytes, payload.mime
    );
    commit_card(
        ctx,
        CommitArgs {
            card: cards::NewCard {
                memory_id: memory_id.to_string(),
                card_type: "placeholder".to_string(),
                summary,
                content_text: String::new(),
                source_time: None,
                metadata,
                blob_id: Some(payload.blob_id.clone()),
                trace_id: Some(trace_id.to_string()),
            },
            text_ref: None,
            vision_ref: None,
            graph_outputs: None,
        },
    )
    .await
}

/// Ingest one blob under the given trace. Deterministic for a fixed
/// `(blob_id, trace_id)`: a replay returns the already-committed card.
pub async fn ingest_blob(
    ctx: &ToolContext,
    payload: &IngestPayload,
    trace_id: &str,
) -> Result<IngestOutcome> {
    // Idempotency: at-least-once delivery may hand us a blob+trace pair
    // that already committed.
    if let Some(existing) = cards::find_by_blob_trace(&ctx.pool, &payload.blob_id, trace_id).await? {
        info!(
            trace_id = %&trace_id[..12.min(trace_id.len())],
            memory_id = %existing,
            "idempotent skip, card already exists"
        );
        return Ok(IngestOutcome {
            trace_id: trace_id.to_string(),
            memory_id: Some(existing),
            pipeline: "skip".to_string(),
            status: "idempotent_skip".to_string(),
        });
    }

    let pipeline = choose_pipeline(
        &payload.mime,
        &payload.path,
        payload.size_bytes,
        ctx.config.watch.max_file_bytes(),
    );
    info!(
        trace_id = %&trace_id[..12.min(trace_id.len())],
        pipeline = pipeline.as_str(),
        file = %file_name(&payload.path),
        mime = %payload.mime,
        "pipeline chosen"
    );

    exec::create_trace(
        &ctx.pool,
        trace_id,
        &json!({
            "kind": "ingest_blob",
            "blob_id": payload.blob_id,
            "path": payload.path,
            "mime": payload.mime,
            "pipeline": pipeline.as_str(),
        }),
    )
    .await?;

    // The card id is minted up front so graph_builder can reference it.
    let memory_id = new_id();

    if pipeline == Pipeline::Placeholder {
        let reason = if payload.size_bytes > ctx.config.watch.max_file_bytes() {
            "oversized"
        } else {
            "unsupported_format"
        };
        let id = commit_placeholder(ctx, payload, trace_id, &memory_id, reason).await?;
        exec::finish_trace(&ctx.pool, trace_id, "ok").await?;
        return Ok(IngestOutcome {
            trace_id: trace_id.to_string(),
            memory_id: Some(id),
            pipeline: pipeline.as_str().to_string(),
            status: "placeholder".to_string(),
        });
    }

    // ── Content extraction ──
    let blob_inputs = json!({ "blob_id": payload.blob_id });
    let (text, mut title, preds, vision_ref): (String, String, Vec<String>, Option<String>) =
        match pipeline {
            Pipeline::Doc => {
                let parse = run_step(ctx, trace_id, "doc_parse", blob_inputs, &[]).await?;
                if !parse.ok() {
                    // Timeouts re-queue; genuine parse errors still leave a
                    // placeholder so the artifact stays visible.
                    if parse.state == "timeout" {
                        return pipeline_failed(ctx, trace_id, "doc_parse", &parse).await;
                    }
                    return parse_failed(ctx, payload, trace_id, &memory_id, pipeline, &parse).await;
                }
                let title = parse
                    .outputs
                    .get("title")
                    .and_then(|t| t.as_str())
                    .unwrap_or(&file_name(&payload.path))
                    .to_string();
                (
                    parse.text().to_string(),
                    title,
                    vec![parse.exec_node_id],
                    None,
                )
            }
            Pipeline::Audio => {
                let asr = run_step(ctx, trace_id, "asr", blob_inputs, &[]).await?;
                if !asr.ok() {
                    if asr.state == "timeout" {
                        return pipeline_failed(ctx, trace_id, "asr", &asr).await;
                    }
                    return parse_failed(ctx, payload, trace_id, &memory_id, pipeline, &asr).await;
                }
                (
                    asr.text().to_string(),
                    file_name(&payload.path),
                    vec![asr.exec_node_id],
                    None,
                )
            }
            Pipeline::Image => {
                // Two nodes with a common predecessor-free root; both must
                // complete before summarizer. Run them concurrently.
                let (ocr, vision) = tokio::join!(
                    run_step(ctx, trace_id, "ocr", blob_inputs.clone(), &[]),
                    run_step(ctx, trace_id, "vision_embed", blob_inputs.clone(), &[]),
                );
                let ocr = ocr?;
                let vision = vision?;
                if !ocr.ok() {
                    if ocr.state == "timeout" {
                        return pipeline_failed(ctx, trace_id, "ocr", &ocr).await;
                    }
                    return parse_failed(ctx, payload, trace_id, &memory_id, pipeline, &ocr).await;
                }
                if !vision.ok() {
                    return pipeline_failed(ctx, trace_id, "vision_embed", &vision).await;
                }
                let vision_ref = vision
                    .outputs
                    .get("vector_ref")
                    .and_then(|v| v.as_str())
                    .map(String::from);
                (
                    ocr.text().to_string(),
                    file_name(&payload.path),
                    vec![ocr.exec_node_id, vision.exec_node_id],
                    vision_ref,
                )
            }
            Pipeline::Placeholder => unreachable!(),
        };

    if title.is_empty() {
        title = file_name(&payload.path);
    }

    // ── Enrichment tail, shared by every content pipeline ──
    // A silent artifact (image with no OCR text, unparsed audio) still gets
    // a descriptive summary instead of "(empty document)".
    let summarizer_text = if text.trim().is_empty() {
        format!("Captured file: {}", file_name(&payload.path))
    } else {
        text.clone()
    };
    let pred_refs: Vec<&str> = preds.iter().map(String::as_str).collect();
    let summarize = run_step(
        ctx,
        trace_id,
        "summarizer",
        json!({ "text": summarizer_text }),
        &pred_refs,
    )
    .await?;
    if !summarize.ok() {
        return pipeline_failed(ctx, trace_id, "summarizer", &summarize).await;
    }
    let summary = summarize
        .outputs
        .get("summary")
        .and_then(|s| s.as_str())
        .unwrap_or("(no summary)")
        .to_string();

    let extract = run_step(
        ctx,
        trace_id,
        "extractor",
        json!({ "text": text.clone() }),
        &[&summarize.exec_node_id],
    )
    .await?;
    if !extract.ok() {
        return pipeline_failed(ctx, trace_id, "extractor", &extract).await;
    }
    let entities = extract.outputs.get("entities").cloned().unwrap_or(json!([]));
    let tags = extract.outputs.get("tags").cloned().unwrap_or(json!([]));
    let actions = extract.outputs.get("actions").cloned().unwrap_or(json!([]));

    let embed = run_step(
        ctx,
        trace_id,
        "text_embed",
        json!({ "text": text.clone() }),
        &[&extract.exec_node_id],
    )
    .await?;
    if !embed.ok() {
        return pipeline_failed(ctx, trace_id, "text_embed", &embed).await;
    }
    let text_ref = embed
        .outputs
        .get("vector_ref")
        .and_then(|v| v.as_str())
        .map(String::from);

    let build = run_step(
        ctx,
        trace_id,
        "graph_builder",
        json!({
            "memory_id": memory_id.clone(),
            "entities": entities.clone(),
            "label": title.clone(),
            "trace_id": trace_id,
        }),
        &[&embed.exec_node_id],
    )
    .await?;
    if !build.ok() {
        return pipeline_failed(ctx, trace_id, "graph_builder", &build).await;
    }

    // ── Commit ──
    let mut metadata = base_metadata(payload, pipeline, trace_id);
    metadata["title"] = json!(title);
    metadata["entities"] = entities;
    metadata["tags"] = tags;
    metadata["actions"] = actions;
    if let Some(vr) = &vision_ref {
        metadata["vision_vector_ref"] = json!(vr);
    }

    let committed = commit_card(
        ctx,
        CommitArgs {
            card: cards::NewCard {
                memory_id: memory_id.clone(),
                card_type: "document".to_string(),
                summary,
                content_text: text,
                source_time: None,
                metadata,
                blob_id: Some(payload.blob_id.clone()),
                trace_id: Some(trace_id.to_string()),
            },
            text_ref,
            vision_ref,
            graph_outputs: Some(build.outputs),
        },
    )
    .await?;

    exec::finish_trace(&ctx.pool, trace_id, "ok").await?;
    info!(
        trace_id = %&trace_id[..12.min(trace_id.len())],
        memory_id = %committed,
        "memory card committed"
    );

    Ok(IngestOutcome {
        trace_id: trace_id.to_string(),
        memory_id: Some(committed),
        pipeline: pipeline.as_str().to_string(),
        status: "ok".to_string(),
    })
}

/// Parse-step failure: the artifact stays visible as a placeholder card and
/// the job completes. The trace keeps its `error` status for debugging.
async fn parse_failed(
    ctx: &ToolContext,
    payload: &IngestPayload,
    trace_id: &str,
    memory_id: &str,
    pipeline: Pipeline,
    step: &StepResult,
) -> Result<IngestOutcome> {
    let kind = step.error.as_deref().unwrap_or("parse_error");
    let id = commit_placeholder(ctx, payload, trace_id, memory_id, kind).await?;
    exec::finish_trace(&ctx.pool, trace_id, "error").await?;
    Ok(IngestOutcome {
        trace_id: trace_id.to_string(),
        memory_id: Some(id),
        pipeline: pipeline.as_str().to_string(),
        status: "placeholder".to_string(),
    })
}

/// Downstream step failure: no card is committed; the error propagates to
/// job-level retry, which will run under a fresh trace.
async fn pipeline_failed(
    ctx: &ToolContext,
    trace_id: &str,
    tool: &str,
    step: &StepResult,
) -> Result<IngestOutcome> {
    exec::finish_trace(&ctx.pool, trace_id, "error").await?;
    anyhow::bail!(
        "{} failed: {}",
        tool,
        step.error.as_deref().unwrap_or("unknown error")
    )
}

/// Inline text ingest (`POST /ingest`): no blob, pipeline `text` =
/// `summarizer → extractor → text_embed → graph_builder`, card holds the
/// submitted text verbatim.
pub async fn ingest_text(
    ctx: &ToolContext,
    text: &str,
    extra_metadata: Option<&Value>,
) -> Result<IngestOutcome> {
    let trace_id = new_id();
    exec::create_trace(&ctx.pool, &trace_id, &json!({ "kind": "ingest_text" })).await?;

    let source_id = blobs::upsert_source(&ctx.pool, "api://ingest", "api").await?;
    let memory_id = new_id();

    let summarize = run_step(ctx, &trace_id, "summarizer", json!({ "text": text }), &[]).await?;
    if !summarize.ok() {
        return pipeline_failed(ctx, &trace_id, "summarizer", &summarize).await;
    }
    let summary = summarize
        .outputs
        .get("summary")
        .and_then(|s| s.as_str())
        .unwrap_or("(no summary)")
        .to_string();

    let extract = run_step(
        ctx,
        &trace_id,
        "extractor",
        json!({ "text": text }),
        &[&summarize.exec_node_id],
    )
    .await?;
    if !extract.ok() {
        return pipeline_failed(ctx, &trace_id, "extractor", &extract).await;
    }

    let embed = run_step(
        ctx,
        &trace_id,
        "text_embed",
        json!({ "text": text }),
        &[&extract.exec_node_id],
    )
    .await?;
    if !embed.ok() {
        return pipeline_failed(ctx, &trace_id, "text_embed", &embed).await;
    }
    let text_ref = embed
        .outputs
        .get("vector_ref")
        .and_then(|v| v.as_str())
        .map(String::from);

    let label: String = summary.chars().take(60).collect();
    let build = run_step(
        ctx,
        &trace_id,
        "graph_builder",
        json!({
            "memory_id": memory_id.clone(),
            "entities": extract.outputs.get("entities").cloned().unwrap_or(json!([])),
            "label": label,
            "trace_id": trace_id.clone(),
        }),
        &[&embed.exec_node_id],
    )
    .await?;
    if !build.ok() {
        return pipeline_failed(ctx, &trace_id, "graph_builder", &build).await;
    }

    let mut metadata = json!({
        "source_type": "api",
        "pipeline": "text",
        "pipeline_version": PIPELINE_VERSION,
        "source_id": source_id,
        "entities": extract.outputs.get("entities").cloned().unwrap_or(json!([])),
        "tags": extract.outputs.get("tags").cloned().unwrap_or(json!([])),
        "actions": extract.outputs.get("actions").cloned().unwrap_or(json!([])),
    });
    if let Some(extra) = extra_metadata.and_then(|m| m.as_object()) {
        for (k, v) in extra {
            metadata[k.as_str()] = v.clone();
        }
    }

    let committed = commit_card(
        ctx,
        CommitArgs {
            card: cards::NewCard {
                memory_id,
                card_type: "note".to_string(),
                summary,
                content_text: text.to_string(),
                source_time: None,
                metadata,
                blob_id: None,
                trace_id: Some(trace_id.clone()),
            },
            text_ref,
            vision_ref: None,
            graph_outputs: Some(build.outputs),
        },
    )
    .await?;

    exec::finish_trace(&ctx.pool, &trace_id, "ok").await?;
    Ok(IngestOutcome {
        trace_id,
        memory_id: Some(committed),
        pipeline: "text".to_string(),
        status: "ok".to_string(),
    })
}

/// Asynchronous enrichment for cards created directly (browser captures):
/// `extractor → text_embed → graph_builder` over the stored content text,
/// then the extraction results are merged into the card's metadata.
pub async fn enrich_card(ctx: &ToolContext, memory_id: &str, trace_id: &str) -> Result<()> {
    let card = cards::get(&ctx.pool, memory_id)
        .await?
        .with_context(|| format!("memory card not found: {}", memory_id))?;
    let text = if card.content_text.trim().is_empty() {
        card.summary.clone()
    } else {
        card.content_text.clone()
    };

    exec::create_trace(
        &ctx.pool,
        trace_id,
        &json!({ "kind": "enrich_card", "memory_id": memory_id }),
    )
    .await?;

    let extract = run_step(ctx, trace_id, "extractor", json!({ "text": text.clone() }), &[]).await?;
    if !extract.ok() {
        return pipeline_failed(ctx, trace_id, "extractor", &extract).await.map(|_| ());
    }

    let embed = run_step(
        ctx,
        trace_id,
        "text_embed",
        json!({ "text": text }),
        &[&extract.exec_node_id],
    )
    .await?;
    if !embed.ok() {
        return pipeline_failed(ctx, trace_id, "text_embed", &embed).await.map(|_| ());
    }
    let text_ref = embed
        .outputs
        .get("vector_ref")
        .and_then(|v| v.as_str())
        .map(String::from);

    let label = card
        .metadata
        .get("title")
        .and_then(|t| t.as_str())
        .map(String::from)
        .unwrap_or_else(|| card.summary.chars().take(60).collect());
    let build = run_step(
        ctx,
        trace_id,
        "graph_builder",
        json!({
            "memory_id": memory_id,
            "entities": extract.outputs.get("entities").cloned().unwrap_or(json!([])),
            "label": label,
            "trace_id": trace_id,
        }),
        &[&embed.exec_node_id],
    )
    .await?;
    if !build.ok() {
        return pipeline_failed(ctx, trace_id, "graph_builder", &build).await.map(|_| ());
    }

    // Merge extraction into the card and attach the embedding.
    cards::merge_metadata(
        &ctx.pool,
        memory_id,
        &json!({
            "entities": extract.outputs.get("entities").cloned().unwrap_or(json!([])),
            "tags": extract.outputs.get("tags").cloned().unwrap_or(json!([])),
            "actions": extract.outputs.get("actions").cloned().unwrap_or(json!([])),
        }),
    )
    .await?;

    let mut tx = ctx.pool.begin().await?;
    if let Some(text_ref) = &text_ref {
        cards::insert_embedding_on(&mut *tx, memory_id, "text", text_ref).await?;
        vector::attach_point_on(&mut *tx, text_ref, memory_id).await?;
    }
    let nodes: Vec<GraphNode> = build
        .outputs
        .get("nodes")
        .cloned()
        .map(serde_json::from_value)
        .transpose()?
        .unwrap_or_default();
    let edges: Vec<GraphEdge> = build
        .outputs
        .get("edges")
        .cloned()
        .map(serde_json::from_value)
        .transpose()?
        .unwrap_or_default();
    crate::graph::upsert_nodes_on(&mut *tx, &nodes).await?;
    crate::graph::upsert_edges_on(&mut *tx, &edges).await?;
    tx.commit().await?;

    exec::finish_trace(&ctx.pool, trace_id, "ok").await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: i64 = 20 * 1024 * 1024;

    #[test]
    fn routing_table() {
        assert_eq!(choose_pipeline("text/plain", "/w/a.txt", 10, MAX), Pipeline::Doc);
        assert_eq!(choose_pipeline("application/pdf", "/w/a.pdf", 10, MAX), Pipeline::Doc);
        assert_eq!(
            choose_pipeline("application/octet-stream", "/w/a.md", 10, MAX),
            Pipeline::Doc
        );
        assert_eq!(choose_pipeline("image/png", "/w/a.png", 10, MAX), Pipeline::Image);
        assert_eq!(choose_pipeline("audio/wav", "/w/a.wav", 10, MAX), Pipeline::Audio);
        assert_eq!(
            choose_pipeline("application/octet-stream", "/w/a.bin", 10, MAX),
            Pipeline::Placeholder
        );
    }

    #[test]
    fn oversize_always_routes_to_placeholder() {
        assert_eq!(
            choose_pipeline("text/plain", "/w/huge.txt", MAX + 1, MAX),
            Pipeline::Placeholder
        );
    }
}
