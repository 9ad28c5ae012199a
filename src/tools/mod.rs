//! Tool registry and dispatch.
//!
//! A tool is a named, schema-typed function. Every ingestion and chat step
//! goes through [`ToolContext::dispatch`], which records a `tool_call` row
//! with timing, status, and input/output snapshots — calling a tool
//! implementation directly is a contract violation.
//!
//! Schema validation happens at the dispatch boundary: required input keys
//! are checked before `execute`, required output keys after. Execution is
//! bounded by the tool's `timeout_ms`.

mod chat_tools;
mod embed;
mod enrich;
mod parse;

pub use chat_tools::{has_citation_token, RetrievalTool, VerifierTool, WeaverTool};
pub use embed::{embed_text_vector, text_point_id, TextEmbedTool, VisionEmbedTool};
pub use enrich::{fallback_summary, ExtractorTool, GraphBuilderTool, SummarizerTool};
pub use parse::{AsrTool, DocParseTool, OcrTool};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::db::new_id;
use crate::llm::LlmClient;
use crate::store::exec;

/// A named, schema-typed tool dispatched through the registry.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// JSON Schema for the input object. The `required` list is enforced
    /// at dispatch.
    fn input_schema(&self) -> Value;

    /// JSON Schema for the output object. The `required` list is enforced
    /// at dispatch.
    fn output_schema(&self) -> Value;

    /// Wall-clock budget for one execution.
    fn timeout_ms(&self) -> u64 {
        10_000
    }

    async fn execute(&self, inputs: Value, ctx: &ToolContext) -> Result<Value>;
}

/// Process-wide tool registry, populated at init time.
pub struct ToolRegistry {
    tools: HashMap<&'static str, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Registry pre-loaded with the full tool set.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(DocParseTool));
        registry.register(Arc::new(OcrTool));
        registry.register(Arc::new(AsrTool));
        registry.register(Arc::new(TextEmbedTool));
        registry.register(Arc::new(VisionEmbedTool));
        registry.register(Arc::new(SummarizerTool));
        registry.register(Arc::new(ExtractorTool));
        registry.register(Arc::new(GraphBuilderTool));
        registry.register(Arc::new(RetrievalTool));
        registry.register(Arc::new(WeaverTool));
        registry.register(Arc::new(VerifierTool));
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Registered tool names, sorted for stable listings.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.tools.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared state handed to every tool execution and dispatch site.
#[derive(Clone)]
pub struct ToolContext {
    pub pool: SqlitePool,
    pub config: Arc<Config>,
    pub registry: Arc<ToolRegistry>,
    pub llm: LlmClient,
}

impl ToolContext {
    pub fn new(pool: SqlitePool, config: Arc<Config>) -> Self {
        let llm = LlmClient::from_config(&config.llm);
        Self {
            pool,
            config,
            registry: Arc::new(ToolRegistry::with_builtins()),
            llm,
        }
    }
}

/// Result of one dispatch.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub call_id: String,
    pub outputs: Value,
    pub elapsed_ms: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("invalid input for {tool}: {message}")]
    InvalidInput { tool: String, message: String },
    #[error("{tool} timed out after {timeout_ms} ms")]
    Timeout { tool: String, timeout_ms: u64 },
    #[error("{tool} failed: {message}")]
    Failed { tool: String, message: String },
}

impl DispatchError {
    /// The terminal exec-node state for this failure.
    pub fn node_state(&self) -> &'static str {
        match self {
            DispatchError::Timeout { .. } => "timeout",
            _ => "error",
        }
    }
}

/// Check the `required` keys of a JSON Schema against a payload.
fn check_required(schema: &Value, payload: &Value) -> std::result::Result<(), String> {
    let Some(required) = schema.get("required").and_then(|r| r.as_array()) else {
        return Ok(());
    };
    for key in required {
        let Some(key) = key.as_str() else { continue };
        match payload.get(key) {
            Some(v) if !v.is_null() => {}
            _ => return Err(format!("missing required field '{}'", key)),
        }
    }
    Ok(())
}

impl ToolContext {
    /// Dispatch a tool by name: validate inputs, record the call, run under
    /// the tool's timeout, validate outputs, record the result.
    pub async fn dispatch(
        &self,
        name: &str,
        inputs: Value,
        trace_id: Option<&str>,
    ) -> std::result::Result<ToolOutcome, DispatchError> {
        self.dispatch_as(&new_id(), name, inputs, trace_id).await
    }

    /// [`dispatch`](Self::dispatch) with a caller-supplied call id, so the
    /// orchestrator can insert the exec node (keyed by that id) before the
    /// tool runs.
    pub async fn dispatch_as(
        &self,
        call_id: &str,
        name: &str,
        inputs: Value,
        trace_id: Option<&str>,
    ) -> std::result::Result<ToolOutcome, DispatchError> {
        let tool = self
            .registry
            .get(name)
            .ok_or_else(|| DispatchError::UnknownTool(name.to_string()))?;

        check_required(&tool.input_schema(), &inputs).map_err(|message| {
            DispatchError::InvalidInput {
                tool: name.to_string(),
                message,
            }
        })?;

        exec::insert_tool_call(&self.pool, call_id, name, trace_id, &inputs)
            .await
            .map_err(|e| DispatchError::Failed {
                tool: name.to_string(),
                message: e.to_string(),
            })?;

        let timeout_ms = tool.timeout_ms();
        let started = std::time::Instant::now();
        let run = tokio::time::timeout(Duration::from_millis(timeout_ms), tool.execute(inputs, self));

        match run.await {
            Err(_elapsed) => {
                let _ = exec::update_tool_call(&self.pool, call_id, None, "timeout").await;
                Err(DispatchError::Timeout {
                    tool: name.to_string(),
                    timeout_ms,
                })
            }
            Ok(Err(err)) => {
                let _ = exec::update_tool_call(&self.pool, call_id, None, "error").await;
                Err(DispatchError::Failed {
                    tool: name.to_string(),
                    message: err.to_string(),
                })
            }
            Ok(Ok(outputs)) => {
                if let Err(message) = check_required(&tool.output_schema(), &outputs) {
                    let _ = exec::update_tool_call(&self.pool, call_id, None, "error").await;
                    return Err(DispatchError::Failed {
                        tool: name.to_string(),
                        message: format!("output schema check: {}", message),
                    });
                }
                exec::update_tool_call(&self.pool, call_id, Some(&outputs), "ok")
                    .await
                    .map_err(|e| DispatchError::Failed {
                        tool: name.to_string(),
                        message: e.to_string(),
                    })?;
                Ok(ToolOutcome {
                    call_id: call_id.to_string(),
                    outputs,
                    elapsed_ms: started.elapsed().as_millis() as i64,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use std::str::FromStr;

    pub(crate) async fn test_ctx() -> ToolContext {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").unwrap();
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap();
        migrate::run_migrations(&pool).await.unwrap();

        let config: Config = toml::from_str(
            r#"
            [db]
            path = ":memory:"
            [watch]
            root = "/tmp/eg-watch"
            "#,
        )
        .unwrap();
        ToolContext::new(pool, Arc::new(config))
    }

    #[tokio::test]
    async fn registry_has_all_recognized_tools() {
        let ctx = test_ctx().await;
        let names = ctx.registry.names();
        for expected in [
            "asr",
            "doc_parse",
            "extractor",
            "graph_builder",
            "ocr",
            "retrieval",
            "summarizer",
            "text_embed",
            "verifier",
            "vision_embed",
            "weaver",
        ] {
            assert!(names.contains(&expected), "missing tool {expected}");
        }
        assert_eq!(names.len(), 11);
    }

    #[tokio::test]
    async fn dispatch_unknown_tool_is_typed() {
        let ctx = test_ctx().await;
        let err = ctx
            .dispatch("no_such_tool", serde_json::json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::UnknownTool(_)));
    }

    #[tokio::test]
    async fn dispatch_validates_required_inputs() {
        let ctx = test_ctx().await;
        let err = ctx
            .dispatch("summarizer", serde_json::json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn dispatch_records_tool_call_row() {
        let ctx = test_ctx().await;
        let outcome = ctx
            .dispatch(
                "summarizer",
                serde_json::json!({"text": "EchoGarden stores memories."}),
                Some("trace-1"),
            )
            .await
            .unwrap();

        let calls = exec::list_tool_calls(&ctx.pool, Some("trace-1"), 10)
            .await
            .unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].call_id, outcome.call_id);
        assert_eq!(calls[0].tool_name, "summarizer");
        assert_eq!(calls[0].status, "ok");
        assert!(calls[0].outputs.is_some());
    }
}
