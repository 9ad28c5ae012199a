//! Hybrid retrieval: FTS + dense vectors + graph neighborhood + recency.
//!
//! # Fusion
//!
//! 1. Each signal produces a candidate set with raw scores.
//! 2. Raw scores are min-max normalized to [0, 1] within their own set.
//! 3. `final = Σ wᵢ · signalᵢ + source_boost`, weights from config
//!    (defaults: semantic 0.40, fts 0.20, graph 0.20, recency 0.20;
//!    boosts: browser_highlight +0.05, document +0.03).
//! 4. Results are deduped by `memory_id`; ties break by `memory_id`
//!    ascending so identical inputs produce identical outputs.
//!
//! Every hit carries a `reasons` list naming each signal that contributed a
//! positive normalized score. A vector-index failure degrades the query to
//! FTS-only and flags the response rather than erroring.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::db::now_ts;
use crate::graph;
use crate::store::{cards, search_log};
use crate::tools::ToolContext;
use crate::vector;

/// Retrieval request. `top_k` defaults to the configured value when zero.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RetrieveRequest {
    pub query: String,
    #[serde(default)]
    pub top_k: usize,
    #[serde(default)]
    pub filters: Option<RetrieveFilters>,
    /// Graph expansion toggle (on by default).
    #[serde(default = "default_true")]
    pub use_graph: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RetrieveFilters {
    pub source_type: Option<String>,
    pub card_type: Option<String>,
    pub time_min: Option<i64>,
    pub time_max: Option<i64>,
}

/// Per-signal normalized contributions for one hit.
#[derive(Debug, Clone, Serialize, Default)]
pub struct SignalBreakdown {
    pub fts: f64,
    pub semantic: f64,
    pub graph: f64,
    pub recency: f64,
    pub source_boost: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrievedHit {
    pub memory_id: String,
    pub title: String,
    pub summary: String,
    pub snippet: String,
    pub card_type: String,
    pub source_type: Option<String>,
    pub created_at: i64,
    pub final_score: f64,
    pub signals: SignalBreakdown,
    /// Names of every signal with a positive normalized contribution.
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrieveOutcome {
    pub results: Vec<RetrievedHit>,
    /// True when the vector index was unavailable and the query ran FTS-only.
    pub degraded: bool,
}

#[derive(Default)]
struct Candidate {
    fts_raw: Option<f64>,
    semantic_raw: Option<f64>,
    graph_raw: Option<f64>,
    recency_raw: Option<f64>,
    snippet: String,
}

/// Min-max normalize a candidate set. A constant set maps to all-1.0.
pub fn normalize<K: Clone>(raw: &[(K, f64)]) -> Vec<(K, f64)> {
    if raw.is_empty() {
        return Vec::new();
    }
    let min = raw.iter().map(|(_, s)| *s).fold(f64::INFINITY, f64::min);
    let max = raw
        .iter()
        .map(|(_, s)| *s)
        .fold(f64::NEG_INFINITY, f64::max);
    raw.iter()
        .map(|(k, s)| {
            let norm = if (max - min).abs() < f64::EPSILON {
                1.0
            } else {
                (s - min) / (max - min)
            };
            (k.clone(), norm)
        })
        .collect()
}

fn title_for(card: &crate::models::MemoryCard) -> String {
    if let Some(path) = card.metadata.get("file_path").and_then(|p| p.as_str()) {
        if let Some(name) = std::path::Path::new(path).file_name() {
            return name.to_string_lossy().to_string();
        }
    }
    if let Some(url) = card.metadata.get("url").and_then(|u| u.as_str()) {
        return url.chars().take(60).collect();
    }
    let summary: String = card.summary.chars().take(60).collect();
    if summary.is_empty() {
        card.memory_id.chars().take(16).collect()
    } else {
        summary
    }
}

/// Execute the full hybrid retrieval pipeline.
///
/// The query embedding goes through the `text_embed` tool (recorded under
/// `trace_id` when given), like every other model invocation.
pub async fn hybrid_retrieve(
    ctx: &ToolContext,
    req: &RetrieveRequest,
    trace_id: Option<&str>,
) -> Result<RetrieveOutcome> {
    let query = req.query.trim();
    let top_k = if req.top_k == 0 {
        ctx.config.retrieval.top_k
    } else {
        req.top_k.min(100)
    };
    if query.is_empty() {
        return Ok(RetrieveOutcome {
            results: Vec::new(),
            degraded: false,
        });
    }

    let rcfg = &ctx.config.retrieval;
    let candidate_k = rcfg.candidate_k;
    let mut candidates: HashMap<String, Candidate> = HashMap::new();
    let mut degraded = false;

    // ── 1. FTS ──
    for hit in cards::fts_search(&ctx.pool, query, candidate_k).await? {
        let entry = candidates.entry(hit.memory_id).or_default();
        entry.fts_raw = Some(hit.raw_score);
        if entry.snippet.is_empty() {
            entry.snippet = hit.snippet;
        }
    }

    // ── 2. Semantic (text modality) ──
    match semantic_candidates(ctx, query, candidate_k, trace_id).await {
        Ok(hits) => {
            for (memory_id, score) in hits {
                candidates.entry(memory_id).or_default().semantic_raw = Some(score);
            }
        }
        Err(err) => {
            tracing::warn!(error = %err, "vector search unavailable, degrading to FTS-only");
            degraded = true;
        }
    }

    // ── 3. Graph neighborhood ──
    if req.use_graph {
        for (memory_id, score) in graph_candidates(ctx, query, candidate_k).await? {
            let entry = candidates.entry(memory_id).or_default();
            if entry.graph_raw.map_or(true, |g| score > g) {
                entry.graph_raw = Some(score);
            }
        }
    }

    // ── 4. Recency ──
    let now = now_ts();
    let tau = rcfg.recency_tau_days;
    for card in cards::recent(&ctx.pool, candidate_k).await? {
        let age_days = ((now - card.created_at).max(0) as f64) / 86_400.0;
        let score = (-age_days / tau).exp();
        candidates.entry(card.memory_id).or_default().recency_raw = Some(score);
    }

    // ── Normalize per signal ──
    let norm_of = |extract: fn(&Candidate) -> Option<f64>,
                   candidates: &HashMap<String, Candidate>| {
        let raw: Vec<(String, f64)> = candidates
            .iter()
            .filter_map(|(id, c)| extract(c).map(|s| (id.clone(), s)))
            .collect();
        normalize(&raw).into_iter().collect::<HashMap<String, f64>>()
    };
    let norm_fts = norm_of(|c| c.fts_raw, &candidates);
    let norm_semantic = norm_of(|c| c.semantic_raw, &candidates);
    let norm_graph = norm_of(|c| c.graph_raw, &candidates);
    let norm_recency = norm_of(|c| c.recency_raw, &candidates);

    // ── Fetch cards, filter, fuse ──
    let ids: Vec<String> = candidates.keys().cloned().collect();
    let fetched = cards::fetch_many(&ctx.pool, &ids).await?;
    let filters = req.filters.clone().unwrap_or_default();

    let mut results: Vec<RetrievedHit> = Vec::new();
    for card in fetched {
        if let Some(st) = filters.source_type.as_deref() {
            if card.source_type() != Some(st) {
                continue;
            }
        }
        if let Some(ct) = filters.card_type.as_deref() {
            if card.card_type != ct {
                continue;
            }
        }
        if let Some(tmin) = filters.time_min {
            if card.created_at < tmin {
                continue;
            }
        }
        if let Some(tmax) = filters.time_max {
            if card.created_at > tmax {
                continue;
            }
        }

        let id = &card.memory_id;
        let signals = SignalBreakdown {
            fts: norm_fts.get(id).copied().unwrap_or(0.0),
            semantic: norm_semantic.get(id).copied().unwrap_or(0.0),
            graph: norm_graph.get(id).copied().unwrap_or(0.0),
            recency: norm_recency.get(id).copied().unwrap_or(0.0),
            source_boost: source_boost(ctx, &card),
        };

        let mut reasons = Vec::new();
        for (name, value) in [
            ("fts", signals.fts),
            ("semantic", signals.semantic),
            ("graph", signals.graph),
            ("recency", signals.recency),
            ("source_boost", signals.source_boost),
        ] {
            if value > 0.0 {
                reasons.push(name.to_string());
            }
        }

        let final_score = rcfg.w_fts * signals.fts
            + rcfg.w_semantic * signals.semantic
            + rcfg.w_graph * signals.graph
            + rcfg.w_recency * signals.recency
            + signals.source_boost;

        let snippet = {
            let s = &candidates[id].snippet;
            if s.is_empty() {
                card.content_text.chars().take(200).collect()
            } else {
                s.clone()
            }
        };

        results.push(RetrievedHit {
            title: title_for(&card),
            summary: card.summary.clone(),
            snippet,
            card_type: card.card_type.clone(),
            source_type: card.source_type().map(String::from),
            created_at: card.created_at,
            memory_id: card.memory_id,
            final_score,
            signals,
            reasons,
        });
    }

    results.sort_by(|a, b| {
        b.final_score
            .partial_cmp(&a.final_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.memory_id.cmp(&b.memory_id))
    });
    results.truncate(top_k);

    search_log::log(
        &ctx.pool,
        query,
        &filters_json(&filters),
        results.len() as i64,
        trace_id,
    )
    .await?;

    Ok(RetrieveOutcome { results, degraded })
}

fn filters_json(filters: &RetrieveFilters) -> serde_json::Value {
    serde_json::json!({
        "source_type": filters.source_type,
        "card_type": filters.card_type,
        "time_min": filters.time_min,
        "time_max": filters.time_max,
    })
}

fn source_boost(ctx: &ToolContext, card: &crate::models::MemoryCard) -> f64 {
    match card.card_type.as_str() {
        "browser_highlight" => ctx.config.retrieval.boost_browser_highlight,
        "document" => ctx.config.retrieval.boost_document,
        _ => 0.0,
    }
}

/// Embed the query through the `text_embed` tool and search the text index.
async fn semantic_candidates(
    ctx: &ToolContext,
    query: &str,
    limit: i64,
    trace_id: Option<&str>,
) -> Result<Vec<(String, f64)>> {
    let outcome = ctx
        .dispatch("text_embed", serde_json::json!({ "text": query }), trace_id)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    let vector_ref = outcome
        .outputs
        .get("vector_ref")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("text_embed returned no vector_ref"))?;

    let query_vec = vector::get_vector(&ctx.pool, vector_ref)
        .await?
        .ok_or_else(|| anyhow::anyhow!("query vector missing: {}", vector_ref))?;
    vector::search(&ctx.pool, "text", &query_vec, limit).await
}

/// Resolve query terms to entity nodes and collect cards one hop out.
/// Raw score per card = mean weight of its edges to matched entities.
async fn graph_candidates(
    ctx: &ToolContext,
    query: &str,
    limit: i64,
) -> Result<Vec<(String, f64)>> {
    let mut entity_ids: Vec<String> = Vec::new();
    for term in query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 3)
    {
        for node in graph::search_nodes(&ctx.pool, term, None, 5).await? {
            if node.node_id.starts_with("ent:") && !entity_ids.contains(&node.node_id) {
                entity_ids.push(node.node_id);
            }
        }
        if entity_ids.len() >= 16 {
            break;
        }
    }
    if entity_ids.is_empty() {
        return Ok(Vec::new());
    }

    let subgraph = graph::expand(
        &ctx.pool,
        &graph::ExpandParams {
            seed_node_ids: entity_ids,
            hops: 1,
            direction: "both".to_string(),
            edge_types: Some(vec!["MENTIONS".to_string(), "ABOUT".to_string()]),
            max_nodes: limit.max(1) as usize,
            max_edges: (limit.max(1) * 4) as usize,
            ..Default::default()
        },
    )
    .await?;

    let mut sums: HashMap<String, (f64, usize)> = HashMap::new();
    for edge in &subgraph.edges {
        for endpoint in [&edge.from_node_id, &edge.to_node_id] {
            if let Some(memory_id) = endpoint.strip_prefix("mem:") {
                let entry = sums.entry(memory_id.to_string()).or_insert((0.0, 0));
                entry.0 += edge.weight;
                entry.1 += 1;
            }
        }
    }

    Ok(sums
        .into_iter()
        .map(|(id, (total, n))| (id, total / n.max(1) as f64))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_maps_to_unit_interval() {
        let raw = vec![("a", 2.0), ("b", 4.0), ("c", 6.0)];
        let norm: HashMap<&str, f64> = normalize(&raw).into_iter().collect();
        assert_eq!(norm["a"], 0.0);
        assert_eq!(norm["b"], 0.5);
        assert_eq!(norm["c"], 1.0);
    }

    #[test]
    fn normalize_constant_set_is_all_ones() {
        let raw = vec![("a", 3.0), ("b", 3.0)];
        let norm: HashMap<&str, f64> = normalize(&raw).into_iter().collect();
        assert_eq!(norm["a"], 1.0);
        assert_eq!(norm["b"], 1.0);
    }

    #[test]
    fn normalize_empty_is_empty() {
        let raw: Vec<(&str, f64)> = Vec::new();
        assert!(normalize(&raw).is_empty());
    }
}
