//! HTTP surface.
//!
//! Stateless JSON handlers over the storage, graph, retrieval, and chat
//! services. Read paths tolerate concurrent background writers; the only
//! write paths are `/ingest`, `/graph/upsert`, the dev tool runner, and the
//! browser-capture endpoints (which require the `X-EG-KEY` header to match
//! the configured capture key).
//!
//! # Error contract
//!
//! ```json
//! { "error": { "code": "invalid_input", "message": "query must not be empty" } }
//! ```
//!
//! Codes: `invalid_input` (400), `unauthorized` (401), `not_found` (404),
//! `conflict` (409), `dependency_unavailable` (503), `timeout` (504),
//! `internal` (500).

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::chat::{self, ChatError, ChatRequest};
use crate::db::new_id;
use crate::digest;
use crate::graph;
use crate::models::{EnrichPayload, GraphEdge, GraphNode};
use crate::orchestrator::{self, run_step};
use crate::retrieve::RetrieveRequest;
use crate::store::{blobs, cards, conversations, exec, jobs, search_log};
use crate::tools::{DispatchError, ToolContext};
use crate::vector;
use crate::watcher::WatcherStatus;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub ctx: ToolContext,
    pub watcher: Arc<WatcherStatus>,
}

/// Starts the HTTP server on the configured bind address. Runs until the
/// process is terminated.
pub async fn run_server(ctx: ToolContext, watcher: Arc<WatcherStatus>) -> anyhow::Result<()> {
    let bind_addr = ctx.config.server.bind.clone();
    let state = AppState { ctx, watcher };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/healthz", get(handle_healthz))
        .route("/tools", get(handle_tools))
        .route("/tools/{name}/schema", get(handle_tool_schema))
        .route("/tools/{name}/run", post(handle_tool_run))
        .route("/ingest", post(handle_ingest))
        .route("/cards", get(handle_cards))
        .route("/cards/{id}", get(handle_card).delete(handle_card_delete))
        .route("/cards/{id}/open", get(handle_card_open))
        .route("/blobs/{id}", get(handle_blob))
        .route("/retrieve", post(handle_retrieve))
        .route("/chat", post(handle_chat))
        .route("/conversations", get(handle_conversations))
        .route("/conversations/{id}", get(handle_conversation))
        .route("/search/history", get(handle_search_history))
        .route("/digest", get(handle_digest))
        .route("/feed/today", get(handle_feed_today))
        .route("/graph/upsert", post(handle_graph_upsert))
        .route("/graph/query", post(handle_graph_query))
        .route("/graph/expand", post(handle_graph_expand))
        .route("/graph/subgraph", get(handle_graph_subgraph))
        .route("/graph/search", get(handle_graph_search))
        .route("/graph/neighbors", get(handle_graph_neighbors))
        .route("/exec/{trace_id}", get(handle_exec_trace))
        .route("/tool_calls", get(handle_tool_calls))
        .route("/capture/status", get(handle_capture_status))
        .route("/capture/jobs", get(handle_capture_jobs))
        .route("/capture/browser/highlight", post(handle_browser_highlight))
        .route("/capture/browser/bookmark", post(handle_browser_bookmark))
        .route(
            "/capture/browser/research_session",
            post(handle_browser_session),
        )
        .route("/capture/browser/visit", post(handle_browser_visit))
        .route(
            "/capture/browser/import_history",
            post(handle_browser_import),
        )
        .layer(cors)
        .with_state(state);

    info!(bind = %bind_addr, "http server listening");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error response ============

pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": { "code": self.code, "message": self.message }
        });
        (self.status, Json(body)).into_response()
    }
}

fn invalid_input(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "invalid_input",
        message: message.into(),
    }
}

fn unauthorized(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::UNAUTHORIZED,
        code: "unauthorized",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

fn dependency_unavailable(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::SERVICE_UNAVAILABLE,
        code: "dependency_unavailable",
        message: message.into(),
    }
}

fn timeout_error(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::GATEWAY_TIMEOUT,
        code: "timeout",
        message: message.into(),
    }
}

fn internal_error(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: message.into(),
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        internal_error(err.to_string())
    }
}

impl From<DispatchError> for AppError {
    fn from(err: DispatchError) -> Self {
        match &err {
            DispatchError::UnknownTool(_) => not_found(err.to_string()),
            DispatchError::InvalidInput { .. } => invalid_input(err.to_string()),
            DispatchError::Timeout { .. } => timeout_error(err.to_string()),
            DispatchError::Failed { .. } => internal_error(err.to_string()),
        }
    }
}

impl From<ChatError> for AppError {
    fn from(err: ChatError) -> Self {
        match err {
            ChatError::InvalidInput(message) => invalid_input(message),
            ChatError::Internal(e) => internal_error(e.to_string()),
        }
    }
}

// ============ Health ============

async fn handle_healthz(State(state): State<AppState>) -> Json<Value> {
    let db = match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&state.ctx.pool)
        .await
    {
        Ok(_) => "ok",
        Err(_) => "error",
    };
    let vector_index = if vector::status(&state.ctx.pool).await {
        "ok"
    } else {
        "error"
    };
    let llm = if !state.ctx.llm.is_configured() {
        "unconfigured"
    } else if state.ctx.llm.available().await {
        "ok"
    } else {
        "unreachable"
    };

    Json(json!({
        "ok": db == "ok" && vector_index == "ok",
        "db": db,
        "vector_index": vector_index,
        "llm": llm,
    }))
}

// ============ Tools ============

async fn handle_tools(State(state): State<AppState>) -> Json<Value> {
    let tools: Vec<Value> = state
        .ctx
        .registry
        .names()
        .into_iter()
        .map(|name| {
            let tool = state.ctx.registry.get(name).expect("listed tool exists");
            json!({ "name": name, "description": tool.description() })
        })
        .collect();
    Json(json!({ "tools": tools }))
}

async fn handle_tool_schema(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, AppError> {
    let tool = state
        .ctx
        .registry
        .get(&name)
        .ok_or_else(|| not_found(format!("tool '{}' not found", name)))?;
    Ok(Json(json!({
        "tool": tool.name(),
        "description": tool.description(),
        "input_schema": tool.input_schema(),
        "output_schema": tool.output_schema(),
    })))
}

#[derive(Deserialize)]
struct ToolRunRequest {
    #[serde(default)]
    inputs: Value,
}

/// Direct dispatch for development. Recorded like any other call.
async fn handle_tool_run(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<ToolRunRequest>,
) -> Result<Json<Value>, AppError> {
    let inputs = if req.inputs.is_null() {
        json!({})
    } else {
        req.inputs
    };
    let outcome = state.ctx.dispatch(&name, inputs, None).await?;
    Ok(Json(json!({
        "call_id": outcome.call_id,
        "outputs": outcome.outputs,
        "elapsed_ms": outcome.elapsed_ms,
    })))
}

// ============ Ingest ============

#[derive(Deserialize)]
struct IngestRequest {
    text: String,
    #[serde(default)]
    metadata: Option<Value>,
}

async fn handle_ingest(
    State(state): State<AppState>,
    Json(req): Json<IngestRequest>,
) -> Result<Json<Value>, AppError> {
    if req.text.trim().is_empty() {
        return Err(invalid_input("text must not be empty"));
    }
    let outcome = orchestrator::ingest_text(&state.ctx, &req.text, req.metadata.as_ref()).await?;
    Ok(Json(json!({
        "memory_id": outcome.memory_id,
        "trace_id": outcome.trace_id,
    })))
}

// ============ Cards ============

#[derive(Deserialize)]
struct CardsQuery {
    #[serde(default)]
    q: Option<String>,
    #[serde(default)]
    source_type: Option<String>,
    #[serde(default)]
    card_type: Option<String>,
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_limit() -> i64 {
    50
}

async fn handle_cards(
    State(state): State<AppState>,
    Query(query): Query<CardsQuery>,
) -> Result<Json<Value>, AppError> {
    let filter = cards::CardFilter {
        q: query.q,
        source_type: query.source_type,
        card_type: query.card_type,
        limit: query.limit.clamp(1, 200),
        offset: query.offset.max(0),
    };
    let cards = cards::list(&state.ctx.pool, &filter).await?;
    let count = cards.len();
    Ok(Json(json!({ "cards": cards, "count": count })))
}

async fn handle_card(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let card = cards::get(&state.ctx.pool, &id)
        .await?
        .ok_or_else(|| not_found(format!("card not found: {}", id)))?;
    Ok(Json(serde_json::to_value(&card).map_err(anyhow::Error::from)?))
}

/// Delete a card: cascades its embeddings, vector points, and `mem:` graph
/// node; entity nodes left with no edges are garbage-collected. The blob
/// (if any) keeps its bytes.
async fn handle_card_delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let deleted = cards::delete(&state.ctx.pool, &id).await?;
    if !deleted {
        return Err(not_found(format!("card not found: {}", id)));
    }
    Ok(Json(json!({ "memory_id": id, "deleted": true })))
}

async fn stream_file(path: &str, mime: &str) -> Result<Response, AppError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| not_found(format!("file unavailable: {}", e)))?;
    Ok(([(header::CONTENT_TYPE, mime.to_string())], bytes).into_response())
}

/// Stream the original bytes behind a card.
async fn handle_card_open(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let card = cards::get(&state.ctx.pool, &id)
        .await?
        .ok_or_else(|| not_found(format!("card not found: {}", id)))?;

    if let Some(blob_id) = &card.blob_id {
        let blob = blobs::get(&state.ctx.pool, blob_id)
            .await?
            .ok_or_else(|| not_found(format!("blob not found: {}", blob_id)))?;
        return stream_file(&blob.path, &blob.mime).await;
    }
    if let Some(path) = card.metadata.get("file_path").and_then(|p| p.as_str()) {
        return stream_file(path, "application/octet-stream").await;
    }
    Err(not_found("card has no underlying file"))
}

async fn handle_blob(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let blob = blobs::get(&state.ctx.pool, &id)
        .await?
        .ok_or_else(|| not_found(format!("blob not found: {}", id)))?;
    stream_file(&blob.path, &blob.mime).await
}

// ============ Retrieve / Chat ============

async fn handle_retrieve(
    State(state): State<AppState>,
    Json(req): Json<RetrieveRequest>,
) -> Result<Json<Value>, AppError> {
    if req.query.trim().is_empty() {
        return Err(invalid_input("query must not be empty"));
    }

    let ctx = &state.ctx;
    let trace_id = new_id();
    exec::create_trace(&ctx.pool, &trace_id, &json!({ "kind": "retrieve" })).await?;

    let step = run_step(
        ctx,
        &trace_id,
        "retrieval",
        json!({
            "query": req.query,
            "top_k": req.top_k,
            "use_graph": req.use_graph,
            "filters": req.filters,
            "trace_id": trace_id,
        }),
        &[],
    )
    .await?;

    if !step.ok() {
        exec::finish_trace(&ctx.pool, &trace_id, "error").await?;
        return Err(dependency_unavailable(
            step.error.unwrap_or_else(|| "retrieval failed".into()),
        ));
    }
    exec::finish_trace(&ctx.pool, &trace_id, "ok").await?;

    let degraded = step
        .outputs
        .get("degraded")
        .and_then(|d| d.as_bool())
        .unwrap_or(false);
    Ok(Json(json!({
        "results": step.outputs.get("results").cloned().unwrap_or(json!([])),
        "trace_id": trace_id,
        "trace": if degraded { "fts_only" } else { "hybrid" },
    })))
}

async fn handle_chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<Value>, AppError> {
    let outcome = chat::chat(&state.ctx, &req).await?;
    Ok(Json(serde_json::to_value(&outcome).map_err(anyhow::Error::from)?))
}

// ============ Conversations / history ============

#[derive(Deserialize)]
struct LimitQuery {
    #[serde(default = "default_limit")]
    limit: i64,
}

async fn handle_conversations(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Value>, AppError> {
    let list = conversations::list(&state.ctx.pool, query.limit.clamp(1, 200)).await?;
    Ok(Json(json!({ "conversations": list })))
}

async fn handle_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let conversation = conversations::get(&state.ctx.pool, &id)
        .await?
        .ok_or_else(|| not_found(format!("conversation not found: {}", id)))?;
    let turns = conversations::turns(&state.ctx.pool, &id).await?;
    Ok(Json(json!({ "conversation": conversation, "turns": turns })))
}

async fn handle_search_history(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Value>, AppError> {
    let history = search_log::recent(&state.ctx.pool, query.limit.clamp(1, 200)).await?;
    Ok(Json(json!({ "queries": history })))
}

// ============ Digest / feed ============

#[derive(Deserialize)]
struct DigestQuery {
    #[serde(default = "default_window")]
    window: String,
    #[serde(default = "default_digest_limit")]
    limit: i64,
}

fn default_window() -> String {
    "24h".to_string()
}
fn default_digest_limit() -> i64 {
    10
}

async fn handle_digest(
    State(state): State<AppState>,
    Query(query): Query<DigestQuery>,
) -> Result<Json<Value>, AppError> {
    let payload = digest::digest(&state.ctx.pool, &query.window, query.limit.clamp(1, 50))
        .await?
        .ok_or_else(|| invalid_input("window must be one of 24h, 7d, 30d"))?;
    Ok(Json(payload))
}

async fn handle_feed_today(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    Ok(Json(digest::feed_today(&state.ctx.pool).await?))
}

// ============ Graph ============

#[derive(Deserialize)]
struct GraphUpsertRequest {
    #[serde(default)]
    nodes: Vec<GraphNode>,
    #[serde(default)]
    edges: Vec<GraphEdge>,
}

async fn handle_graph_upsert(
    State(state): State<AppState>,
    Json(req): Json<GraphUpsertRequest>,
) -> Result<Json<Value>, AppError> {
    let nodes = graph::upsert_nodes(&state.ctx.pool, &req.nodes)
        .await
        .map_err(|e| invalid_input(e.to_string()))?;
    let edges = graph::upsert_edges(&state.ctx.pool, &req.edges)
        .await
        .map_err(|e| invalid_input(e.to_string()))?;
    Ok(Json(json!({ "nodes_upserted": nodes, "edges_upserted": edges })))
}

#[derive(Deserialize)]
struct GraphQueryRequest {
    node_id: String,
    #[serde(default = "default_direction")]
    direction: String,
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_direction() -> String {
    "both".to_string()
}

async fn handle_graph_query(
    State(state): State<AppState>,
    Json(req): Json<GraphQueryRequest>,
) -> Result<Json<Value>, AppError> {
    let node = graph::get_node(&state.ctx.pool, &req.node_id)
        .await?
        .ok_or_else(|| not_found(format!("node not found: {}", req.node_id)))?;
    let subgraph =
        graph::neighbors(&state.ctx.pool, &req.node_id, &req.direction, req.limit).await?;
    Ok(Json(json!({ "node": node, "subgraph": subgraph })))
}

#[derive(Deserialize)]
struct GraphExpandRequest {
    seed_node_ids: Vec<String>,
    #[serde(default = "default_hops")]
    hops: u8,
    #[serde(default = "default_direction")]
    direction: String,
    #[serde(default)]
    edge_types: Option<Vec<String>>,
    #[serde(default)]
    time_min: Option<i64>,
    #[serde(default)]
    time_max: Option<i64>,
    #[serde(default = "default_max_nodes")]
    max_nodes: usize,
    #[serde(default = "default_max_edges")]
    max_edges: usize,
}

fn default_hops() -> u8 {
    1
}
fn default_max_nodes() -> usize {
    300
}
fn default_max_edges() -> usize {
    1000
}

async fn handle_graph_expand(
    State(state): State<AppState>,
    Json(req): Json<GraphExpandRequest>,
) -> Result<Json<Value>, AppError> {
    if req.seed_node_ids.is_empty() {
        return Err(invalid_input("seed_node_ids must not be empty"));
    }
    let subgraph = graph::expand(
        &state.ctx.pool,
        &graph::ExpandParams {
            seed_node_ids: req.seed_node_ids,
            hops: req.hops,
            direction: req.direction,
            edge_types: req.edge_types,
            time_min: req.time_min,
            time_max: req.time_max,
            max_nodes: req.max_nodes,
            max_edges: req.max_edges,
        },
    )
    .await?;
    Ok(Json(serde_json::to_value(&subgraph).map_err(anyhow::Error::from)?))
}

#[derive(Deserialize)]
struct SubgraphQuery {
    seed: String,
    #[serde(default = "default_hops")]
    hops: u8,
    #[serde(default = "default_limit")]
    limit: i64,
}

async fn handle_graph_subgraph(
    State(state): State<AppState>,
    Query(query): Query<SubgraphQuery>,
) -> Result<Json<Value>, AppError> {
    let subgraph = graph::expand(
        &state.ctx.pool,
        &graph::ExpandParams {
            seed_node_ids: vec![query.seed],
            hops: query.hops,
            max_nodes: query.limit.clamp(1, 500) as usize,
            max_edges: (query.limit.clamp(1, 500) * 4) as usize,
            ..Default::default()
        },
    )
    .await?;
    Ok(Json(serde_json::to_value(&subgraph).map_err(anyhow::Error::from)?))
}

#[derive(Deserialize)]
struct GraphSearchQuery {
    query: String,
    #[serde(default, rename = "type")]
    node_type: Option<String>,
    #[serde(default = "default_limit")]
    limit: i64,
}

async fn handle_graph_search(
    State(state): State<AppState>,
    Query(query): Query<GraphSearchQuery>,
) -> Result<Json<Value>, AppError> {
    let nodes = graph::search_nodes(
        &state.ctx.pool,
        &query.query,
        query.node_type.as_deref(),
        query.limit.clamp(1, 100),
    )
    .await?;
    Ok(Json(json!({ "nodes": nodes })))
}

#[derive(Deserialize)]
struct NeighborsQuery {
    node_id: String,
    #[serde(default = "default_hops")]
    hops: u8,
    #[serde(default = "default_limit")]
    limit: i64,
}

async fn handle_graph_neighbors(
    State(state): State<AppState>,
    Query(query): Query<NeighborsQuery>,
) -> Result<Json<Value>, AppError> {
    let subgraph = graph::expand(
        &state.ctx.pool,
        &graph::ExpandParams {
            seed_node_ids: vec![query.node_id],
            hops: query.hops,
            max_nodes: query.limit.clamp(1, 500) as usize,
            max_edges: (query.limit.clamp(1, 500) * 4) as usize,
            ..Default::default()
        },
    )
    .await?;
    Ok(Json(serde_json::to_value(&subgraph).map_err(anyhow::Error::from)?))
}

// ============ Exec traces / tool calls ============

async fn handle_exec_trace(
    State(state): State<AppState>,
    Path(trace_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let trace = exec::get_trace(&state.ctx.pool, &trace_id)
        .await?
        .ok_or_else(|| not_found(format!("trace not found: {}", trace_id)))?;
    let nodes = exec::nodes_for_trace(&state.ctx.pool, &trace_id).await?;
    let edges = exec::edges_for_trace(&state.ctx.pool, &trace_id).await?;
    let tool_calls = exec::list_tool_calls(&state.ctx.pool, Some(&trace_id), 500).await?;
    Ok(Json(json!({
        "trace": trace,
        "nodes": nodes,
        "edges": edges,
        "tool_calls": tool_calls,
    })))
}

#[derive(Deserialize)]
struct ToolCallsQuery {
    #[serde(default)]
    trace_id: Option<String>,
    #[serde(default = "default_limit")]
    limit: i64,
}

async fn handle_tool_calls(
    State(state): State<AppState>,
    Query(query): Query<ToolCallsQuery>,
) -> Result<Json<Value>, AppError> {
    let calls = exec::list_tool_calls(
        &state.ctx.pool,
        query.trace_id.as_deref(),
        query.limit.clamp(1, 500),
    )
    .await?;
    Ok(Json(json!({ "tool_calls": calls })))
}

// ============ Capture status / jobs ============

async fn handle_capture_status(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let pool = &state.ctx.pool;
    Ok(Json(json!({
        "roots": [state.ctx.config.watch.root],
        "poll_interval_s": state.ctx.config.watch.poll_interval_s,
        "counts": {
            "files_tracked": blobs::tracked_file_count(pool).await?,
            "blobs": blobs::blob_count(pool).await?,
            "cards": cards::count(pool).await?,
            "jobs": jobs::counts_by_status(pool).await?,
            "jobs_due_for_retry": jobs::due_for_retry(pool, crate::db::now_ts()).await?.len(),
        },
        "scans": state.watcher.scan_count.load(Ordering::Relaxed),
        "last_scan_ts": state.watcher.last_scan_ts.load(Ordering::Relaxed),
    })))
}

#[derive(Deserialize)]
struct JobsQuery {
    #[serde(default)]
    status: Option<String>,
    #[serde(default = "default_limit")]
    limit: i64,
}

async fn handle_capture_jobs(
    State(state): State<AppState>,
    Query(query): Query<JobsQuery>,
) -> Result<Json<Value>, AppError> {
    let jobs = jobs::list(
        &state.ctx.pool,
        query.status.as_deref(),
        query.limit.clamp(1, 200),
    )
    .await?;
    Ok(Json(json!({ "jobs": jobs })))
}

// ============ Browser capture ============

fn require_capture_key(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    let Some(expected) = state.ctx.config.capture.api_key.as_deref() else {
        return Err(internal_error("capture.api_key is not configured"));
    };
    let provided = headers
        .get("X-EG-KEY")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if provided != expected {
        return Err(unauthorized("invalid or missing X-EG-KEY header"));
    }
    Ok(())
}

/// Create a browser card and queue its enrichment pipeline.
async fn create_browser_card(
    state: &AppState,
    card_type: &str,
    url: &str,
    summary: String,
    content_text: String,
    mut metadata: Value,
) -> Result<String, AppError> {
    let source_id = blobs::upsert_source(&state.ctx.pool, url, "browser").await?;
    metadata["source_type"] = json!("browser");
    metadata["source_id"] = json!(source_id);
    metadata["url"] = json!(url);
    metadata["pipeline"] = json!("browser_highlight");
    metadata["pipeline_version"] = json!(orchestrator::PIPELINE_VERSION);

    let memory_id = cards::insert(
        &state.ctx.pool,
        &cards::NewCard {
            memory_id: new_id(),
            card_type: card_type.to_string(),
            summary,
            content_text,
            source_time: None,
            metadata,
            blob_id: None,
            trace_id: None,
        },
    )
    .await?;

    let payload = EnrichPayload {
        memory_id: memory_id.clone(),
        trace_id: new_id(),
    };
    jobs::enqueue(
        &state.ctx.pool,
        "enrich_card",
        &serde_json::to_value(&payload).map_err(anyhow::Error::from)?,
    )
    .await?;
    Ok(memory_id)
}

#[derive(Deserialize)]
struct HighlightRequest {
    url: String,
    #[serde(default)]
    title: String,
    highlight_text: String,
    #[serde(default)]
    context: String,
}

async fn handle_browser_highlight(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<HighlightRequest>,
) -> Result<Json<Value>, AppError> {
    require_capture_key(&state, &headers)?;
    if req.highlight_text.trim().is_empty() {
        return Err(invalid_input("highlight_text must not be empty"));
    }

    let content = if req.context.is_empty() {
        req.highlight_text.clone()
    } else {
        format!("{}\n\n{}", req.highlight_text, req.context)
    };
    let memory_id = create_browser_card(
        &state,
        "browser_highlight",
        &req.url,
        req.highlight_text.clone(),
        content,
        json!({ "title": req.title }),
    )
    .await?;
    Ok(Json(json!({ "memory_id": memory_id, "status": "ok" })))
}

#[derive(Deserialize)]
struct BookmarkRequest {
    url: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    folder: String,
}

async fn handle_browser_bookmark(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<BookmarkRequest>,
) -> Result<Json<Value>, AppError> {
    require_capture_key(&state, &headers)?;
    let summary = if req.title.is_empty() {
        format!("Bookmarked {}", req.url)
    } else {
        format!("Bookmarked: {}", req.title)
    };
    let memory_id = create_browser_card(
        &state,
        "browser_bookmark",
        &req.url,
        summary.clone(),
        summary,
        json!({ "title": req.title, "folder": req.folder }),
    )
    .await?;
    Ok(Json(json!({ "memory_id": memory_id, "status": "ok" })))
}

#[derive(Deserialize)]
struct TabInfo {
    url: String,
    #[serde(default)]
    title: String,
}

#[derive(Deserialize)]
struct ResearchSessionRequest {
    session_title: String,
    #[serde(default)]
    started_ts: String,
    #[serde(default)]
    ended_ts: String,
    #[serde(default)]
    tabs: Vec<TabInfo>,
    #[serde(default)]
    notes: String,
}

async fn handle_browser_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ResearchSessionRequest>,
) -> Result<Json<Value>, AppError> {
    require_capture_key(&state, &headers)?;

    let mut content = format!("Research session: {}\n", req.session_title);
    for tab in &req.tabs {
        content.push_str(&format!("- {} ({})\n", tab.title, tab.url));
    }
    if !req.notes.is_empty() {
        content.push_str(&format!("\nNotes: {}", req.notes));
    }

    let summary = format!(
        "Research session '{}' with {} tabs",
        req.session_title,
        req.tabs.len()
    );
    let url = format!("browser://session/{}", graph::canonical_slug(&req.session_title));
    let memory_id = create_browser_card(
        &state,
        "browser_session",
        &url,
        summary,
        content,
        json!({
            "title": req.session_title,
            "started_ts": req.started_ts,
            "ended_ts": req.ended_ts,
            "tab_count": req.tabs.len(),
        }),
    )
    .await?;
    Ok(Json(json!({ "memory_id": memory_id, "status": "ok" })))
}

#[derive(Deserialize)]
struct VisitRequest {
    url: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    duration_s: Option<f64>,
}

async fn handle_browser_visit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<VisitRequest>,
) -> Result<Json<Value>, AppError> {
    require_capture_key(&state, &headers)?;
    let summary = if req.title.is_empty() {
        format!("Visited {}", req.url)
    } else {
        format!("Visited: {}", req.title)
    };
    let memory_id = create_browser_card(
        &state,
        "browser_visit",
        &req.url,
        summary.clone(),
        summary,
        json!({ "title": req.title, "duration_s": req.duration_s }),
    )
    .await?;
    Ok(Json(json!({ "memory_id": memory_id, "status": "ok" })))
}

#[derive(Deserialize)]
struct ImportHistoryRequest {
    #[serde(default = "default_import_max")]
    max_items: usize,
    #[serde(default)]
    entries: Vec<Value>,
}

fn default_import_max() -> usize {
    500
}

async fn handle_browser_import(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ImportHistoryRequest>,
) -> Result<Json<Value>, AppError> {
    require_capture_key(&state, &headers)?;

    let mut memory_ids = Vec::new();
    for entry in req.entries.iter().take(req.max_items.min(10_000)) {
        let Some(url) = entry.get("url").and_then(|u| u.as_str()) else {
            continue;
        };
        let title = entry.get("title").and_then(|t| t.as_str()).unwrap_or("");
        let summary = if title.is_empty() {
            format!("Visited {}", url)
        } else {
            format!("Visited: {}", title)
        };
        // History imports are bulk: card only, no per-card enrichment job.
        let source_id = blobs::upsert_source(&state.ctx.pool, url, "browser").await?;
        let memory_id = cards::insert(
            &state.ctx.pool,
            &cards::NewCard {
                memory_id: new_id(),
                card_type: "browser_visit".to_string(),
                summary: summary.clone(),
                content_text: summary,
                source_time: None,
                metadata: json!({
                    "source_type": "browser",
                    "source_id": source_id,
                    "url": url,
                    "title": title,
                    "pipeline": "browser_highlight",
                    "pipeline_version": orchestrator::PIPELINE_VERSION,
                }),
                blob_id: None,
                trace_id: None,
            },
        )
        .await?;
        memory_ids.push(memory_id);
    }

    Ok(Json(json!({
        "imported": memory_ids.len(),
        "memory_ids": memory_ids,
        "status": "ok",
    })))
}
