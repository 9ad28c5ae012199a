//! Optional LLM client for an Ollama-compatible endpoint.
//!
//! Every consumer (summarizer, extractor, weaver, verifier) has a
//! deterministic fallback, so an unconfigured or unreachable endpoint
//! degrades behavior instead of failing requests. JSON-mode responses are
//! parsed tolerantly: markdown fences are stripped and the first `{...}`
//! block is recovered when the model wraps its output in prose.

use anyhow::Result;
use std::time::Duration;

use crate::config::LlmConfig;

#[derive(Debug, thiserror::Error)]
#[error("LLM unavailable: {0}")]
pub struct LlmUnavailable(pub String);

#[derive(Clone)]
pub struct LlmClient {
    url: Option<String>,
    model: String,
    client: reqwest::Client,
}

impl LlmClient {
    pub fn from_config(config: &LlmConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_s))
            .build()
            .unwrap_or_default();
        Self {
            url: config.url.clone(),
            model: config.model.clone(),
            client,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.url.is_some()
    }

    /// Cheap liveness probe for the health endpoint and stub-mode decisions.
    pub async fn available(&self) -> bool {
        let Some(url) = &self.url else {
            return false;
        };
        let probe = self
            .client
            .get(format!("{}/api/tags", url.trim_end_matches('/')))
            .timeout(Duration::from_secs(2))
            .send()
            .await;
        matches!(probe, Ok(resp) if resp.status().is_success())
    }

    /// Single-shot completion. Errors with [`LlmUnavailable`] when no
    /// endpoint is configured or the request fails, so callers can fall back.
    pub async fn generate(&self, prompt: &str, system: Option<&str>) -> Result<String> {
        let url = self
            .url
            .as_deref()
            .ok_or_else(|| LlmUnavailable("no llm.url configured".to_string()))?;

        let mut body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
        });
        if let Some(system) = system {
            body["system"] = serde_json::json!(system);
        }

        let resp = self
            .client
            .post(format!("{}/api/generate", url.trim_end_matches('/')))
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmUnavailable(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(LlmUnavailable(format!("status {}", resp.status())).into());
        }

        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| LlmUnavailable(e.to_string()))?;
        Ok(json
            .get("response")
            .and_then(|r| r.as_str())
            .unwrap_or_default()
            .to_string())
    }

    /// Completion with JSON output expected; parsed tolerantly.
    pub async fn generate_json(
        &self,
        prompt: &str,
        system: Option<&str>,
    ) -> Result<serde_json::Value> {
        let raw = self.generate(prompt, system).await?;
        parse_loose_json(&raw)
            .ok_or_else(|| anyhow::anyhow!("LLM returned unparseable JSON: {}", truncate(&raw, 200)))
    }
}

/// Best-effort JSON parse: strips markdown fences, then falls back to the
/// first `{...}` block in the text.
pub fn parse_loose_json(raw: &str) -> Option<serde_json::Value> {
    let mut text = raw.trim();
    if let Some(stripped) = text.strip_prefix("```json") {
        text = stripped;
    } else if let Some(stripped) = text.strip_prefix("```") {
        text = stripped;
    }
    let text = text.trim_end_matches('`').trim();

    if let Ok(v) = serde_json::from_str::<serde_json::Value>(text) {
        return Some(v);
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        format!("{}…", clip(s, max))
    }
}

// ============ Prompt builders ============

pub fn summarizer_prompt(text: &str, max_chars: usize) -> String {
    format!(
        "Summarize the following content in 1-3 sentences, at most {max_chars} characters. \
         Output only the summary, no preamble.\n\n---\n{}\n---",
        clip(text, 6000)
    )
}

pub fn extractor_system() -> &'static str {
    "You extract structured knowledge from personal notes and documents. \
     Respond with JSON only: {\"entities\": [{\"canonical\": str, \"type\": str}], \
     \"tags\": [str], \"actions\": [str]}. Entity types: Person, Organization, \
     Location, Topic, Concept."
}

pub fn extractor_prompt(text: &str) -> String {
    format!(
        "Extract at most 30 entities, 12 tags, and 10 action items from:\n\n{}",
        clip(text, 6000)
    )
}

pub fn weaver_system() -> &'static str {
    "You answer questions strictly from the provided evidence. Cite every \
     claim with a [title] token naming the evidence it came from. If the \
     evidence does not support an answer, say so. Respond with JSON only: \
     {\"answer\": str, \"cited_memory_ids\": [str]}."
}

pub fn weaver_prompt(query: &str, evidence_block: &str) -> String {
    format!("Question: {query}\n\nEvidence:\n{evidence_block}\n\nAnswer with citations.")
}

pub fn verifier_system() -> &'static str {
    "You verify that an answer is grounded in the provided evidence. Respond \
     with JSON only: {\"verdict\": \"pass\"|\"revise\"|\"abstain\", \
     \"revised_answer\": str, \"flagged_claims\": [str]}."
}

pub fn verifier_prompt(query: &str, answer: &str, evidence_block: &str) -> String {
    format!(
        "Question: {query}\n\nAnswer under review:\n{answer}\n\nEvidence:\n{evidence_block}\n\n\
         Return pass if every claim is supported, revise with a corrected answer if some are, \
         abstain if the evidence cannot support any answer."
    )
}

/// Render evidence items as a numbered block for prompts.
pub fn format_evidence_block(evidence: &[serde_json::Value], max_chars: usize) -> String {
    evidence
        .iter()
        .enumerate()
        .map(|(i, ev)| {
            let title = ev.get("title").and_then(|t| t.as_str()).unwrap_or("untitled");
            let memory_id = ev.get("memory_id").and_then(|m| m.as_str()).unwrap_or("?");
            let summary = ev.get("summary").and_then(|s| s.as_str()).unwrap_or("");
            format!(
                "{}. [{}] (memory_id={}) {}",
                i + 1,
                title,
                memory_id,
                clip(summary, max_chars)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn clip(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loose_json_strips_fences() {
        let raw = "```json\n{\"answer\": \"hi\"}\n```";
        let v = parse_loose_json(raw).unwrap();
        assert_eq!(v["answer"], "hi");
    }

    #[test]
    fn loose_json_recovers_embedded_object() {
        let raw = "Sure! Here you go: {\"verdict\": \"pass\"} Hope that helps.";
        let v = parse_loose_json(raw).unwrap();
        assert_eq!(v["verdict"], "pass");
    }

    #[test]
    fn loose_json_rejects_garbage() {
        assert!(parse_loose_json("no json here").is_none());
    }

    #[test]
    fn evidence_block_numbers_items() {
        let evidence = vec![
            serde_json::json!({"title": "a.txt", "memory_id": "m1", "summary": "First."}),
            serde_json::json!({"title": "b.txt", "memory_id": "m2", "summary": "Second."}),
        ];
        let block = format_evidence_block(&evidence, 100);
        assert!(block.contains("1. [a.txt]"));
        assert!(block.contains("2. [b.txt]"));
    }
}
