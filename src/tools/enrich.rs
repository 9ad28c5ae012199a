//! Enrichment tools: summarizer, extractor, and graph builder.
//!
//! Summarizer and extractor use the configured LLM when one is reachable and
//! fall back to deterministic heuristics otherwise, so the pipeline behaves
//! identically on machines without a model. The graph builder is a pure
//! transform: it emits nodes and edges; the orchestrator commits them.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;

use super::{Tool, ToolContext};
use crate::db::now_ts;
use crate::graph::{canonical_slug, make_edge_id};
use crate::llm;

pub const MAX_SUMMARY_CHARS: usize = 400;
pub const MAX_ENTITIES: usize = 30;
pub const MAX_TAGS: usize = 12;
pub const MAX_ACTIONS: usize = 10;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "about", "after", "all", "also", "been", "but", "for", "from", "had",
    "has", "have", "here", "his", "her", "how", "i", "in", "into", "is", "it", "its", "more",
    "not", "of", "on", "or", "our", "over", "she", "some", "that", "the", "their", "them", "then",
    "there", "these", "they", "this", "under", "was", "were", "what", "when", "where", "which",
    "will", "with", "would", "you", "your",
];

fn is_stopword(word: &str) -> bool {
    STOPWORDS.contains(&word.to_lowercase().as_str())
}

/// First-sentence truncation used when no LLM is reachable.
pub fn fallback_summary(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.is_empty() {
        return "(empty document)".to_string();
    }

    let cut: String = text.chars().take(max_chars).collect();
    // Prefer a sentence boundary, as long as it leaves something substantial.
    for sep in [". ", ".\n", "! ", "? "] {
        if let Some(idx) = cut.rfind(sep) {
            if idx > 40 {
                return cut[..idx + 1].trim().to_string();
            }
        }
    }
    if text.chars().count() > max_chars {
        let hard: String = cut.chars().take(max_chars.saturating_sub(3)).collect();
        return format!("{}...", hard.trim_end());
    }
    cut.trim().to_string()
}

/// `summarizer({text}) -> {summary}` — 1-3 sentences, at most 400 chars.
pub struct SummarizerTool;

#[async_trait]
impl Tool for SummarizerTool {
    fn name(&self) -> &'static str {
        "summarizer"
    }

    fn description(&self) -> &'static str {
        "Produce a short summary of extracted text"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "text": { "type": "string", "description": "Content to summarize" }
            },
            "required": ["text"]
        })
    }

    fn output_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "summary": { "type": "string" }
            },
            "required": ["summary"]
        })
    }

    fn timeout_ms(&self) -> u64 {
        30_000
    }

    async fn execute(&self, inputs: Value, ctx: &ToolContext) -> Result<Value> {
        let text = inputs
            .get("text")
            .and_then(|t| t.as_str())
            .context("text must be a string")?;
        let max_chars = ctx.config.tools.summary_max_chars.min(MAX_SUMMARY_CHARS);

        let summary = if ctx.llm.is_configured() && !text.trim().is_empty() {
            match ctx
                .llm
                .generate(&llm::summarizer_prompt(text, max_chars), None)
                .await
            {
                Ok(raw) => {
                    let s = raw.trim();
                    if s.is_empty() {
                        fallback_summary(text, max_chars)
                    } else {
                        s.chars().take(max_chars).collect()
                    }
                }
                Err(_) => fallback_summary(text, max_chars),
            }
        } else {
            fallback_summary(text, max_chars)
        };

        Ok(json!({ "summary": summary }))
    }
}

// ============ Extractor ============

fn normalize_entity_type(raw: &str) -> &'static str {
    match raw.to_lowercase().as_str() {
        "person" => "Person",
        "organization" | "org" | "company" => "Organization",
        "location" | "place" => "Location",
        "topic" => "Topic",
        "concept" | "technology" | "project" => "Concept",
        _ => "Entity",
    }
}

/// Heuristic extraction: capitalized phrases become entities, frequent
/// non-stopword terms become tags, checkbox/TODO lines become actions.
fn heuristic_extract(text: &str) -> (Vec<Value>, Vec<String>, Vec<String>) {
    // Entities: runs of capitalized words, up to 4 long. A sentence-initial
    // word only qualifies when it is CamelCase (an inner capital or digit),
    // which keeps "EchoGarden stores..." and drops "Met Ada" down to "Ada".
    fn qualifies(word: &str, sentence_initial: bool) -> bool {
        if word.len() < 2 || is_stopword(word) {
            return false;
        }
        if !word.chars().next().is_some_and(|c| c.is_uppercase()) {
            return false;
        }
        !sentence_initial
            || word
                .chars()
                .skip(1)
                .any(|c| c.is_uppercase() || c.is_numeric())
    }

    let mut entities: Vec<Value> = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for sentence in text.split(|c: char| ".!?\n".contains(c)) {
        let words: Vec<&str> = sentence.split_whitespace().collect();
        let mut i = 0;
        while i < words.len() {
            let word = words[i].trim_matches(|c: char| !c.is_alphanumeric());
            if qualifies(word, i == 0) {
                let mut phrase = vec![word];
                let mut j = i + 1;
                while j < words.len() && phrase.len() < 4 {
                    let next = words[j].trim_matches(|c: char| !c.is_alphanumeric());
                    if qualifies(next, false) {
                        phrase.push(next);
                        j += 1;
                    } else {
                        break;
                    }
                }
                let canonical = phrase.join(" ");
                if seen.insert(canonical.to_lowercase()) {
                    let etype = if phrase.len() >= 2 { "Topic" } else { "Concept" };
                    entities.push(json!({ "canonical": canonical, "type": etype }));
                }
                i = j;
            } else {
                i += 1;
            }
        }
    }
    entities.truncate(MAX_ENTITIES);

    // Tags: frequency-ranked lowercase terms.
    let mut freq: BTreeMap<String, usize> = BTreeMap::new();
    for token in text.split(|c: char| !c.is_alphanumeric()) {
        let token = token.to_lowercase();
        if token.len() >= 4 && !is_stopword(&token) && !token.chars().all(|c| c.is_numeric()) {
            *freq.entry(token).or_insert(0) += 1;
        }
    }
    let mut ranked: Vec<(String, usize)> = freq.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    let tags: Vec<String> = ranked.into_iter().take(MAX_TAGS).map(|(t, _)| t).collect();

    // Actions: checkbox and TODO lines.
    let mut actions: Vec<String> = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim();
        let action = trimmed
            .strip_prefix("- [ ]")
            .or_else(|| trimmed.strip_prefix("* [ ]"))
            .or_else(|| trimmed.strip_prefix("TODO:"))
            .or_else(|| trimmed.strip_prefix("TODO "))
            .or_else(|| trimmed.strip_prefix("Action:"));
        if let Some(action) = action {
            let action = action.trim();
            if !action.is_empty() {
                actions.push(action.to_string());
            }
        }
        if actions.len() >= MAX_ACTIONS {
            break;
        }
    }

    (entities, tags, actions)
}

/// Enforce the extractor caps on either path (LLM output included).
fn clean_extraction(data: &Value) -> Value {
    let entities: Vec<Value> = data
        .get("entities")
        .and_then(|e| e.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|ent| {
                    let canonical = ent.get("canonical").and_then(|c| c.as_str())?.trim();
                    if canonical.len() < 2 {
                        return None;
                    }
                    let etype = ent.get("type").and_then(|t| t.as_str()).unwrap_or("Entity");
                    Some(json!({
                        "canonical": canonical,
                        "type": normalize_entity_type(etype),
                    }))
                })
                .take(MAX_ENTITIES)
                .collect()
        })
        .unwrap_or_default();

    let tags: Vec<String> = data
        .get("tags")
        .and_then(|t| t.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|t| t.as_str())
                .map(|t| t.trim().to_lowercase())
                .filter(|t| t.len() >= 2)
                .take(MAX_TAGS)
                .collect()
        })
        .unwrap_or_default();

    let actions: Vec<String> = data
        .get("actions")
        .and_then(|a| a.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|a| a.as_str())
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty())
                .take(MAX_ACTIONS)
                .collect()
        })
        .unwrap_or_default();

    json!({ "entities": entities, "tags": tags, "actions": actions })
}

/// `extractor({text}) -> {entities, tags, actions}` with caps 30/12/10.
pub struct ExtractorTool;

#[async_trait]
impl Tool for ExtractorTool {
    fn name(&self) -> &'static str {
        "extractor"
    }

    fn description(&self) -> &'static str {
        "Extract entities, tags, and action items from text"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "text": { "type": "string", "description": "Content to extract from" }
            },
            "required": ["text"]
        })
    }

    fn output_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "entities": { "type": "array" },
                "tags": { "type": "array" },
                "actions": { "type": "array" }
            },
            "required": ["entities", "tags", "actions"]
        })
    }

    fn timeout_ms(&self) -> u64 {
        30_000
    }

    async fn execute(&self, inputs: Value, ctx: &ToolContext) -> Result<Value> {
        let text = inputs
            .get("text")
            .and_then(|t| t.as_str())
            .context("text must be a string")?;

        if ctx.llm.is_configured() && !text.trim().is_empty() {
            if let Ok(parsed) = ctx
                .llm
                .generate_json(&llm::extractor_prompt(text), Some(llm::extractor_system()))
                .await
            {
                return Ok(clean_extraction(&parsed));
            }
        }

        let (entities, tags, actions) = heuristic_extract(text);
        Ok(clean_extraction(&json!({
            "entities": entities,
            "tags": tags,
            "actions": actions,
        })))
    }
}

// ============ Graph builder ============

/// `graph_builder({memory_id, entities}) -> {nodes, edges}`
///
/// Emits the `mem:` card node, one `ent:` node per entity, and a MENTIONS
/// edge card→entity. Pure transform — nothing is written here; the
/// orchestrator commits the output alongside the card.
pub struct GraphBuilderTool;

#[async_trait]
impl Tool for GraphBuilderTool {
    fn name(&self) -> &'static str {
        "graph_builder"
    }

    fn description(&self) -> &'static str {
        "Derive graph nodes and edges for a memory card"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "memory_id": { "type": "string" },
                "entities": { "type": "array" },
                "label": { "type": "string", "description": "Display label for the card node" },
                "trace_id": { "type": "string" }
            },
            "required": ["memory_id", "entities"]
        })
    }

    fn output_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "nodes": { "type": "array" },
                "edges": { "type": "array" }
            },
            "required": ["nodes", "edges"]
        })
    }

    async fn execute(&self, inputs: Value, _ctx: &ToolContext) -> Result<Value> {
        let memory_id = inputs
            .get("memory_id")
            .and_then(|m| m.as_str())
            .context("memory_id must be a string")?;
        let entities = inputs
            .get("entities")
            .and_then(|e| e.as_array())
            .context("entities must be an array")?;
        let label = inputs
            .get("label")
            .and_then(|l| l.as_str())
            .unwrap_or(memory_id);
        let trace_id = inputs.get("trace_id").and_then(|t| t.as_str()).unwrap_or("");

        let mem_node_id = format!("mem:{}", memory_id);
        let mut nodes = vec![json!({
            "node_id": mem_node_id.clone(),
            "node_type": "MemoryCard",
            "props": { "label": label, "memory_id": memory_id },
        })];
        let mut edges = Vec::new();
        let now = now_ts();

        for entity in entities.iter().take(MAX_ENTITIES) {
            let Some(canonical) = entity.get("canonical").and_then(|c| c.as_str()) else {
                continue;
            };
            let slug = canonical_slug(canonical);
            if slug.is_empty() {
                continue;
            }
            let etype = entity.get("type").and_then(|t| t.as_str()).unwrap_or("Entity");
            let ent_node_id = format!("ent:{}", slug);

            nodes.push(json!({
                "node_id": ent_node_id.clone(),
                "node_type": normalize_entity_type(etype),
                "props": { "label": canonical },
            }));
            edges.push(json!({
                "edge_id": make_edge_id(&mem_node_id, "MENTIONS", &ent_node_id),
                "from_node_id": mem_node_id.clone(),
                "to_node_id": ent_node_id,
                "edge_type": "MENTIONS",
                "weight": 0.6,
                "valid_from": now,
                "provenance": {
                    "created_by": "graph_builder",
                    "confidence": 0.6,
                    "trace_id": trace_id,
                },
            }));
        }

        Ok(json!({ "nodes": nodes, "edges": edges }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_summary_breaks_at_sentence() {
        let text = "EchoGarden is a local-first knowledge garden for personal notes. \
                    It ingests files and answers questions. More text follows here.";
        let s = fallback_summary(text, 120);
        assert!(s.ends_with('.'));
        assert!(s.chars().count() <= 120);
        assert!(s.contains("EchoGarden"));
    }

    #[test]
    fn fallback_summary_handles_empty() {
        assert_eq!(fallback_summary("  \n ", 400), "(empty document)");
    }

    #[test]
    fn fallback_summary_hard_truncates() {
        let text = "word ".repeat(500);
        let s = fallback_summary(&text, 100);
        assert!(s.chars().count() <= 100);
        assert!(s.ends_with("..."));
    }

    #[test]
    fn heuristic_finds_capitalized_entities() {
        let (entities, tags, actions) = heuristic_extract(
            "Met Ada Lovelace at the Analytical Engine workshop.\n- [ ] send follow-up notes",
        );
        let names: Vec<&str> = entities
            .iter()
            .map(|e| e["canonical"].as_str().unwrap())
            .collect();
        assert!(names.contains(&"Ada Lovelace"));
        assert!(names.contains(&"Analytical Engine"));
        assert!(tags.contains(&"workshop".to_string()));
        assert_eq!(actions, vec!["send follow-up notes"]);
    }

    #[test]
    fn caps_are_enforced() {
        let text = (0..100)
            .map(|i| format!("Entity{} Alpha.", i))
            .collect::<Vec<_>>()
            .join(" ");
        let (entities, tags, _) = heuristic_extract(&text);
        assert!(entities.len() <= MAX_ENTITIES);
        assert!(tags.len() <= MAX_TAGS);

        let many_actions = (0..40).map(|i| format!("- [ ] task {}", i)).collect::<Vec<_>>().join("\n");
        let (_, _, actions) = heuristic_extract(&many_actions);
        assert!(actions.len() <= MAX_ACTIONS);
    }

    #[test]
    fn clean_extraction_caps_llm_output() {
        let oversized = json!({
            "entities": (0..50).map(|i| json!({"canonical": format!("E{}", i), "type": "topic"})).collect::<Vec<_>>(),
            "tags": (0..30).map(|i| format!("tag{}", i)).collect::<Vec<_>>(),
            "actions": (0..30).map(|i| format!("do {}", i)).collect::<Vec<_>>(),
        });
        let cleaned = clean_extraction(&oversized);
        assert_eq!(cleaned["entities"].as_array().unwrap().len(), MAX_ENTITIES);
        assert_eq!(cleaned["tags"].as_array().unwrap().len(), MAX_TAGS);
        assert_eq!(cleaned["actions"].as_array().unwrap().len(), MAX_ACTIONS);
    }
}
