//! Content-extraction tools: document parse, OCR, and speech-to-text.
//!
//! Real OCR and ASR engines live behind these tool boundaries and are out of
//! scope; `stub` mode returns deterministic empty transcriptions so the rest
//! of the pipeline (summary, extraction, embedding, graph) still runs and
//! the exec trace keeps its full shape. `local` mode is the seam where an
//! engine would be wired; it degrades to the stub.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use super::{Tool, ToolContext};
use crate::store::blobs;

/// Extensions treated as inline-readable text by `doc_parse`.
const TEXT_EXTENSIONS: &[&str] = &["txt", "md", "json", "csv", "log", "html"];

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

fn is_readable_text(mime: &str, path: &str) -> bool {
    mime.starts_with("text/")
        || mime == "application/json"
        || TEXT_EXTENSIONS.contains(&file_ext(path).as_str())
}

async fn load_blob(ctx: &ToolContext, inputs: &Value) -> Result<crate::models::Blob> {
    let blob_id = inputs
        .get("blob_id")
        .and_then(|b| b.as_str())
        .context("blob_id must be a string")?;
    blobs::get(&ctx.pool, blob_id)
        .await?
        .with_context(|| format!("blob not found: {}", blob_id))
}

/// `doc_parse({blob_id}) -> {text, mime, title?}`
///
/// Text-like blobs are read inline (lossy UTF-8). Binary document formats
/// (PDF, Office) have no parser engine wired here and produce empty text;
/// the card still carries the artifact.
pub struct DocParseTool;

#[async_trait]
impl Tool for DocParseTool {
    fn name(&self) -> &'static str {
        "doc_parse"
    }

    fn description(&self) -> &'static str {
        "Extract text content from a document blob"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "blob_id": { "type": "string", "description": "Blob to parse" }
            },
            "required": ["blob_id"]
        })
    }

    fn output_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "text": { "type": "string" },
                "mime": { "type": "string" },
                "title": { "type": "string" }
            },
            "required": ["text", "mime"]
        })
    }

    fn timeout_ms(&self) -> u64 {
        15_000
    }

    async fn execute(&self, inputs: Value, ctx: &ToolContext) -> Result<Value> {
        let blob = load_blob(ctx, &inputs).await?;
        let title = file_name(&blob.path);

        let text = if is_readable_text(&blob.mime, &blob.path) {
            let bytes = tokio::fs::read(&blob.path)
                .await
                .with_context(|| format!("reading {}", blob.path))?;
            String::from_utf8_lossy(&bytes).into_owned()
        } else {
            String::new()
        };

        Ok(json!({
            "text": text,
            "mime": blob.mime,
            "title": title,
        }))
    }
}

/// `ocr({blob_id}) -> {text, language?, conf}`
pub struct OcrTool;

#[async_trait]
impl Tool for OcrTool {
    fn name(&self) -> &'static str {
        "ocr"
    }

    fn description(&self) -> &'static str {
        "Recognize text in an image blob"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "blob_id": { "type": "string", "description": "Image blob" }
            },
            "required": ["blob_id"]
        })
    }

    fn output_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "text": { "type": "string" },
                "language": { "type": "string" },
                "conf": { "type": "number" }
            },
            "required": ["text", "conf"]
        })
    }

    fn timeout_ms(&self) -> u64 {
        30_000
    }

    async fn execute(&self, inputs: Value, ctx: &ToolContext) -> Result<Value> {
        let blob = load_blob(ctx, &inputs).await?;
        // The blob must at least be readable, stub or not.
        tokio::fs::metadata(&blob.path)
            .await
            .with_context(|| format!("reading {}", blob.path))?;

        Ok(json!({
            "text": "",
            "language": "und",
            "conf": 0.0,
        }))
    }
}

/// `asr({blob_id}) -> {text, language, segments?}`
pub struct AsrTool;

#[async_trait]
impl Tool for AsrTool {
    fn name(&self) -> &'static str {
        "asr"
    }

    fn description(&self) -> &'static str {
        "Transcribe speech from an audio blob"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "blob_id": { "type": "string", "description": "Audio blob" }
            },
            "required": ["blob_id"]
        })
    }

    fn output_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "text": { "type": "string" },
                "language": { "type": "string" },
                "segments": { "type": "array" }
            },
            "required": ["text", "language"]
        })
    }

    fn timeout_ms(&self) -> u64 {
        60_000
    }

    async fn execute(&self, inputs: Value, ctx: &ToolContext) -> Result<Value> {
        let blob = load_blob(ctx, &inputs).await?;
        tokio::fs::metadata(&blob.path)
            .await
            .with_context(|| format!("reading {}", blob.path))?;

        // whisper_mode = "local" is the engine seam; without a bundled
        // model it degrades to the deterministic stub transcription.
        if ctx.config.tools.whisper_mode == "local" {
            tracing::debug!("whisper_mode=local but no engine bundled, using stub");
        }
        Ok(json!({
            "text": "",
            "language": "en",
            "segments": [],
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_detection_by_mime_and_extension() {
        assert!(is_readable_text("text/plain", "/a/b.bin"));
        assert!(is_readable_text("application/octet-stream", "/a/notes.md"));
        assert!(!is_readable_text("application/pdf", "/a/paper.pdf"));
    }

    #[test]
    fn title_is_file_name() {
        assert_eq!(file_name("/watch/inbox/notes.md"), "notes.md");
    }
}
