//! Core data models used throughout EchoGarden.
//!
//! These types mirror the rows of the relational store. The data lifecycle is:
//!
//! ```text
//! Watcher → Source/Blob/FileState → Job → Orchestrator → MemoryCard
//!                                              ↓              ↓
//!                                         ExecTrace      Embedding + Graph
//!                                              ↓
//!                                    ExecNode / ExecEdge / ToolCall
//! ```
//!
//! Timestamps are Unix epoch seconds (`i64`) throughout; file mtimes are
//! nanoseconds. Identifiers are opaque hex strings.

use serde::{Deserialize, Serialize};

/// One external origin of captured artifacts: a watched directory, a browser,
/// or the HTTP API. Immutable after creation, deduped by `uri`.
#[derive(Debug, Clone, Serialize)]
pub struct Source {
    pub source_id: String,
    /// `filesystem`, `api`, or `browser`.
    pub source_type: String,
    pub uri: String,
    pub created_ts: i64,
}

/// Content-addressed binary. Multiple blobs may share a `sha256` when the same
/// bytes were captured from distinct paths.
#[derive(Debug, Clone, Serialize)]
pub struct Blob {
    pub blob_id: String,
    pub sha256: String,
    pub path: String,
    pub mime: String,
    pub size_bytes: i64,
    pub source_id: String,
    pub created_ts: i64,
}

/// Dedup tracker keyed by path: a file whose `(mtime_ns, size_bytes)` matches
/// the recorded state is skipped without re-hashing.
#[derive(Debug, Clone, Serialize)]
pub struct FileState {
    pub path: String,
    pub mtime_ns: i64,
    pub size_bytes: i64,
    pub sha256: String,
    pub last_seen_ts: i64,
}

/// A queued unit of work. Status: `queued`, `running`, `done`, `error`
/// (awaiting retry), `dead` (retries exhausted).
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub job_id: String,
    pub job_type: String,
    pub status: String,
    pub attempts: i64,
    pub next_run_ts: i64,
    pub payload: serde_json::Value,
    pub error_text: Option<String>,
    pub created_ts: i64,
    pub updated_ts: i64,
}

/// Payload of an `ingest_blob` job. The trace id is minted by the watcher;
/// retried attempts mint a fresh one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestPayload {
    pub blob_id: String,
    pub source_id: String,
    pub path: String,
    pub sha256: String,
    pub mime: String,
    pub size_bytes: i64,
    pub trace_id: String,
}

/// Payload of an `enrich_card` job (browser captures are written as cards
/// first and enriched asynchronously).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichPayload {
    pub memory_id: String,
    pub trace_id: String,
}

/// The atomic knowledge unit.
///
/// `summary` is at most 400 chars; `content_text` holds the full extracted
/// text and may be large. `metadata` carries the pipeline tag, mime,
/// file path or URL, entities, tags, actions, and the source type.
/// At most one card exists per `(blob_id, trace_id)` pair.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryCard {
    pub memory_id: String,
    /// Coarse human-readable tag: `document`, `note`, `browser_highlight`,
    /// `placeholder`. `metadata.pipeline` is authoritative for machinery.
    pub card_type: String,
    pub summary: String,
    pub content_text: String,
    pub source_time: Option<i64>,
    pub created_at: i64,
    pub metadata: serde_json::Value,
    pub blob_id: Option<String>,
    pub trace_id: Option<String>,
}

impl MemoryCard {
    /// The card's source type, taken from metadata.
    pub fn source_type(&self) -> Option<&str> {
        self.metadata.get("source_type").and_then(|v| v.as_str())
    }
}

/// Link from a card to a point in the vector index.
#[derive(Debug, Clone, Serialize)]
pub struct EmbeddingRow {
    pub embedding_id: String,
    pub memory_id: String,
    /// `text` or `vision`.
    pub modality: String,
    pub vector_ref: String,
}

/// Property-graph node. Id namespaces: `mem:<memory_id>` for card nodes,
/// `ent:<canonical-slug>` for extracted entities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub node_id: String,
    /// `MemoryCard`, `Entity`, `Person`, `Organization`, `Location`,
    /// `Topic`, or `Concept`.
    pub node_type: String,
    #[serde(default)]
    pub props: serde_json::Value,
    #[serde(default)]
    pub created_at: i64,
}

/// Property-graph edge with weight in [0,1] and optional validity window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    #[serde(default)]
    pub edge_id: String,
    pub from_node_id: String,
    pub to_node_id: String,
    /// `MENTIONS`, `ABOUT`, `RELATED_TO`.
    pub edge_type: String,
    pub weight: f64,
    #[serde(default)]
    pub valid_from: Option<i64>,
    #[serde(default)]
    pub valid_to: Option<i64>,
    /// Records `created_by`, `confidence`, `trace_id`.
    #[serde(default)]
    pub provenance: serde_json::Value,
}

/// One top-level operation (ingest of one blob, or one chat request).
#[derive(Debug, Clone, Serialize)]
pub struct ExecTrace {
    pub trace_id: String,
    pub started_ts: i64,
    pub finished_ts: Option<i64>,
    /// `running`, `ok`, `error`, `cancelled`.
    pub status: String,
    pub root_call_id: Option<String>,
    pub metadata: serde_json::Value,
}

/// A single tool invocation within a trace.
#[derive(Debug, Clone, Serialize)]
pub struct ExecNode {
    pub exec_node_id: String,
    pub trace_id: String,
    pub call_id: String,
    pub tool_name: String,
    /// `pending`, `running`, `ok`, `error`, `timeout`.
    pub state: String,
    pub attempt: i64,
    pub timeout_ms: i64,
    pub started_ts: i64,
    pub finished_ts: Option<i64>,
}

/// Dependency between two exec nodes; condition is `always`, `on_ok`,
/// or `on_error`.
#[derive(Debug, Clone, Serialize)]
pub struct ExecEdge {
    pub exec_edge_id: String,
    pub trace_id: String,
    pub from_exec_node_id: String,
    pub to_exec_node_id: String,
    pub condition: String,
}

/// One registry dispatch, with input/output snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCall {
    pub call_id: String,
    pub tool_name: String,
    pub ts: i64,
    pub trace_id: Option<String>,
    pub inputs: serde_json::Value,
    pub outputs: Option<serde_json::Value>,
    /// `running`, `ok`, `error`, `timeout`.
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub conversation_id: String,
    pub title: Option<String>,
    pub created_at: i64,
}

/// One user/assistant exchange, with the verifier's verdict and the evidence
/// that grounded the answer.
#[derive(Debug, Clone, Serialize)]
pub struct Turn {
    pub turn_id: String,
    pub conversation_id: String,
    pub user_text: String,
    pub assistant_text: String,
    /// `pass`, `revise`, or `abstain`.
    pub verdict: String,
    pub trace_id: String,
    pub citations: serde_json::Value,
    pub evidence: serde_json::Value,
    pub created_at: i64,
}

/// A quote-level link from a chat turn back to a memory card.
#[derive(Debug, Clone, Serialize)]
pub struct ChatCitation {
    pub citation_id: String,
    pub turn_id: String,
    pub memory_id: String,
    pub quote: String,
    pub span_start: i64,
    pub span_end: i64,
}

/// Search history row.
#[derive(Debug, Clone, Serialize)]
pub struct SearchQueryRow {
    pub search_id: String,
    pub query_text: String,
    pub filters: serde_json::Value,
    pub result_count: i64,
    pub trace_id: Option<String>,
    pub created_at: i64,
}
