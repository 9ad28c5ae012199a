//! Property-graph service: idempotent upserts, neighborhood queries, and
//! bounded BFS expansion.
//!
//! Node id namespaces are `mem:<memory_id>` for card nodes and
//! `ent:<canonical-slug>` for entities. Edge ids are deterministic digests of
//! `(from, type, to)`, so replaying an ingest upserts the same edge instead
//! of multiplying rows; a re-upsert may only increase the weight, capped at
//! 1.0.

use anyhow::Result;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqliteConnection, SqlitePool};

use crate::db::now_ts;
use crate::models::{GraphEdge, GraphNode};

/// A visited subgraph returned by neighborhood and expansion queries.
#[derive(Debug, Clone, Serialize, Default)]
pub struct Subgraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

/// Parameters for [`expand`].
#[derive(Debug, Clone)]
pub struct ExpandParams {
    pub seed_node_ids: Vec<String>,
    pub hops: u8,
    /// `in`, `out`, or `both`.
    pub direction: String,
    pub edge_types: Option<Vec<String>>,
    pub time_min: Option<i64>,
    pub time_max: Option<i64>,
    pub max_nodes: usize,
    pub max_edges: usize,
}

impl Default for ExpandParams {
    fn default() -> Self {
        Self {
            seed_node_ids: Vec::new(),
            hops: 1,
            direction: "both".to_string(),
            edge_types: None,
            time_min: None,
            time_max: None,
            max_nodes: 300,
            max_edges: 1000,
        }
    }
}

/// Canonical slug for entity node ids: lowercase, runs of non-alphanumerics
/// collapsed to a single `-`.
pub fn canonical_slug(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_dash = true;
    for c in name.chars() {
        if c.is_alphanumeric() {
            for lc in c.to_lowercase() {
                slug.push(lc);
            }
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

/// Deterministic edge id from endpoints and type.
pub fn make_edge_id(from: &str, edge_type: &str, to: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(from.as_bytes());
    hasher.update(b"|");
    hasher.update(edge_type.as_bytes());
    hasher.update(b"|");
    hasher.update(to.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..32].to_string()
}

/// Upsert nodes inside an open transaction.
pub async fn upsert_nodes_on(conn: &mut SqliteConnection, nodes: &[GraphNode]) -> Result<usize> {
    for node in nodes {
        sqlx::query(
            r#"
            INSERT INTO graph_node (node_id, node_type, props, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(node_id) DO UPDATE SET
                node_type = excluded.node_type,
                props = excluded.props
            "#,
        )
        .bind(&node.node_id)
        .bind(&node.node_type)
        .bind(node.props.to_string())
        .bind(now_ts())
        .execute(&mut *conn)
        .await?;
    }
    Ok(nodes.len())
}

pub async fn upsert_nodes(pool: &SqlitePool, nodes: &[GraphNode]) -> Result<usize> {
    let mut tx = pool.begin().await?;
    let n = upsert_nodes_on(&mut *tx, nodes).await?;
    tx.commit().await?;
    Ok(n)
}

/// Upsert edges inside an open transaction. Both endpoints must already
/// exist; a dangling edge is rejected. A conflicting upsert never lowers the
/// weight — it nudges it up toward 1.0 to reflect accumulating evidence.
pub async fn upsert_edges_on(conn: &mut SqliteConnection, edges: &[GraphEdge]) -> Result<usize> {
    for edge in edges {
        for endpoint in [&edge.from_node_id, &edge.to_node_id] {
            let exists: Option<String> =
                sqlx::query_scalar("SELECT node_id FROM graph_node WHERE node_id = ?")
                    .bind(endpoint)
                    .fetch_optional(&mut *conn)
                    .await?;
            if exists.is_none() {
                anyhow::bail!("edge endpoint does not exist: {}", endpoint);
            }
        }

        let edge_id = if edge.edge_id.is_empty() {
            make_edge_id(&edge.from_node_id, &edge.edge_type, &edge.to_node_id)
        } else {
            edge.edge_id.clone()
        };
        let weight = edge.weight.clamp(0.0, 1.0);

        sqlx::query(
            r#"
            INSERT INTO graph_edge
                (edge_id, from_node_id, to_node_id, edge_type, weight, valid_from, valid_to, provenance)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(edge_id) DO UPDATE SET
                weight = MIN(1.0, MAX(graph_edge.weight, excluded.weight) + 0.05),
                valid_from = COALESCE(excluded.valid_from, graph_edge.valid_from),
                valid_to = COALESCE(excluded.valid_to, graph_edge.valid_to),
                provenance = excluded.provenance
            "#,
        )
        .bind(&edge_id)
        .bind(&edge.from_node_id)
        .bind(&edge.to_node_id)
        .bind(&edge.edge_type)
        .bind(weight)
        .bind(edge.valid_from)
        .bind(edge.valid_to)
        .bind(edge.provenance.to_string())
        .execute(&mut *conn)
        .await?;
    }
    Ok(edges.len())
}

pub async fn upsert_edges(pool: &SqlitePool, edges: &[GraphEdge]) -> Result<usize> {
    let mut tx = pool.begin().await?;
    let n = upsert_edges_on(&mut *tx, edges).await?;
    tx.commit().await?;
    Ok(n)
}

/// Delete a card's `mem:` node and every edge touching it, inside an open
/// transaction. Entity endpoints are left in place for [`gc_orphan_entities_on`].
pub async fn delete_card_node_on(conn: &mut SqliteConnection, memory_id: &str) -> Result<()> {
    let node_id = format!("mem:{}", memory_id);
    sqlx::query("DELETE FROM graph_edge WHERE from_node_id = ? OR to_node_id = ?")
        .bind(&node_id)
        .bind(&node_id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM graph_node WHERE node_id = ?")
        .bind(&node_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Garbage-collect `ent:` nodes with no remaining edges. Entity nodes
/// persist as long as any card still mentions them; once the last edge is
/// gone they are swept. Returns the number of nodes removed.
pub async fn gc_orphan_entities_on(conn: &mut SqliteConnection) -> Result<u64> {
    let result = sqlx::query(
        r#"
        DELETE FROM graph_node
        WHERE node_id LIKE 'ent:%'
          AND NOT EXISTS (
              SELECT 1 FROM graph_edge e
              WHERE e.from_node_id = graph_node.node_id
                 OR e.to_node_id = graph_node.node_id
          )
        "#,
    )
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

fn row_to_node(row: &sqlx::sqlite::SqliteRow) -> GraphNode {
    GraphNode {
        node_id: row.get("node_id"),
        node_type: row.get("node_type"),
        props: serde_json::from_str::<serde_json::Value>(&row.get::<String, _>("props"))
            .unwrap_or_else(|_| serde_json::json!({})),
        created_at: row.get("created_at"),
    }
}

fn row_to_edge(row: &sqlx::sqlite::SqliteRow) -> GraphEdge {
    GraphEdge {
        edge_id: row.get("edge_id"),
        from_node_id: row.get("from_node_id"),
        to_node_id: row.get("to_node_id"),
        edge_type: row.get("edge_type"),
        weight: row.get("weight"),
        valid_from: row.get("valid_from"),
        valid_to: row.get("valid_to"),
        provenance: serde_json::from_str::<serde_json::Value>(&row.get::<String, _>("provenance"))
            .unwrap_or_else(|_| serde_json::json!({})),
    }
}

pub async fn get_node(pool: &SqlitePool, node_id: &str) -> Result<Option<GraphNode>> {
    let row = sqlx::query("SELECT * FROM graph_node WHERE node_id = ?")
        .bind(node_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| row_to_node(&r)))
}

pub async fn fetch_nodes(pool: &SqlitePool, node_ids: &[String]) -> Result<Vec<GraphNode>> {
    if node_ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; node_ids.len()].join(", ");
    let sql = format!(
        "SELECT * FROM graph_node WHERE node_id IN ({placeholders}) ORDER BY node_id ASC"
    );
    let mut query = sqlx::query(&sql);
    for id in node_ids {
        query = query.bind(id);
    }
    let rows = query.fetch_all(pool).await?;
    Ok(rows.iter().map(row_to_node).collect())
}

/// Fetch edges touching a batch of nodes, best-first (weight, then newer
/// `valid_from`), pruned by direction, edge type, and validity window.
async fn fetch_edges_for(
    pool: &SqlitePool,
    node_ids: &[String],
    direction: &str,
    edge_types: Option<&[String]>,
    time_min: Option<i64>,
    time_max: Option<i64>,
    limit: i64,
) -> Result<Vec<GraphEdge>> {
    if node_ids.is_empty() || limit <= 0 {
        return Ok(Vec::new());
    }

    let id_placeholders = vec!["?"; node_ids.len()].join(", ");
    let dir_clause = match direction {
        "out" => format!("from_node_id IN ({id_placeholders})"),
        "in" => format!("to_node_id IN ({id_placeholders})"),
        _ => format!("(from_node_id IN ({id_placeholders}) OR to_node_id IN ({id_placeholders}))"),
    };

    let mut sql = format!("SELECT * FROM graph_edge WHERE {dir_clause}");
    if let Some(types) = edge_types {
        if !types.is_empty() {
            let type_placeholders = vec!["?"; types.len()].join(", ");
            sql.push_str(&format!(" AND edge_type IN ({type_placeholders})"));
        }
    }
    if time_max.is_some() {
        sql.push_str(" AND (valid_from IS NULL OR valid_from <= ?)");
    }
    if time_min.is_some() {
        sql.push_str(" AND (valid_to IS NULL OR valid_to >= ?)");
    }
    sql.push_str(" ORDER BY weight DESC, valid_from DESC, edge_id ASC LIMIT ?");

    let mut query = sqlx::query(&sql);
    let binds = match direction {
        "out" | "in" => 1,
        _ => 2,
    };
    for _ in 0..binds {
        for id in node_ids {
            query = query.bind(id);
        }
    }
    if let Some(types) = edge_types {
        for t in types {
            query = query.bind(t);
        }
    }
    if let Some(tmax) = time_max {
        query = query.bind(tmax);
    }
    if let Some(tmin) = time_min {
        query = query.bind(tmin);
    }
    query = query.bind(limit);

    let rows = query.fetch_all(pool).await?;
    Ok(rows.iter().map(row_to_edge).collect())
}

/// 1-hop neighborhood of a single node.
pub async fn neighbors(
    pool: &SqlitePool,
    node_id: &str,
    direction: &str,
    limit: i64,
) -> Result<Subgraph> {
    let params = ExpandParams {
        seed_node_ids: vec![node_id.to_string()],
        hops: 1,
        direction: direction.to_string(),
        max_nodes: limit.max(1) as usize,
        max_edges: (limit.max(1) * 4) as usize,
        ..Default::default()
    };
    expand(pool, &params).await
}

/// Bounded BFS from the seed nodes.
///
/// Expands hop by hop, preferring higher-weight then newer edges at the hop
/// boundary, and stops as soon as either `max_nodes` or `max_edges` is
/// reached. Returns the visited subgraph (seed nodes included).
pub async fn expand(pool: &SqlitePool, params: &ExpandParams) -> Result<Subgraph> {
    let hops = params.hops.clamp(1, 2);
    let mut visited: Vec<String> = Vec::new();
    let mut visited_set = std::collections::HashSet::new();
    for seed in &params.seed_node_ids {
        if visited_set.insert(seed.clone()) {
            visited.push(seed.clone());
        }
    }

    let mut collected_edges: Vec<GraphEdge> = Vec::new();
    let mut edge_seen = std::collections::HashSet::new();
    let mut frontier: Vec<String> = visited.clone();

    'hops: for _hop in 0..hops {
        if frontier.is_empty()
            || visited.len() >= params.max_nodes
            || collected_edges.len() >= params.max_edges
        {
            break;
        }

        let remaining_edges = (params.max_edges - collected_edges.len()) as i64;
        let edge_rows = fetch_edges_for(
            pool,
            &frontier,
            &params.direction,
            params.edge_types.as_deref(),
            params.time_min,
            params.time_max,
            remaining_edges,
        )
        .await?;

        let batch: std::collections::HashSet<&String> = frontier.iter().collect();
        let mut next_frontier: Vec<String> = Vec::new();

        for edge in edge_rows {
            if collected_edges.len() >= params.max_edges {
                break 'hops;
            }
            if !edge_seen.insert(edge.edge_id.clone()) {
                continue;
            }

            let other = if batch.contains(&edge.from_node_id) {
                edge.to_node_id.clone()
            } else {
                edge.from_node_id.clone()
            };

            collected_edges.push(edge);

            if !visited_set.contains(&other) {
                if visited.len() >= params.max_nodes {
                    break 'hops;
                }
                visited_set.insert(other.clone());
                visited.push(other.clone());
                next_frontier.push(other);
            }
        }

        frontier = next_frontier;
    }

    let nodes = fetch_nodes(pool, &visited).await?;
    Ok(Subgraph {
        nodes,
        edges: collected_edges,
    })
}

/// Text search over node labels (`props.label`). Prefix matches rank above
/// substring matches; within a tier, nodes with more recently valid attached
/// edges come first.
pub async fn search_nodes(
    pool: &SqlitePool,
    text: &str,
    node_type: Option<&str>,
    limit: i64,
) -> Result<Vec<GraphNode>> {
    let text = text.trim();
    if text.is_empty() || limit <= 0 {
        return Ok(Vec::new());
    }

    let mut found: Vec<GraphNode> = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for pattern in [format!("{}%", text), format!("%{}%", text)] {
        if found.len() >= limit as usize {
            break;
        }
        let mut sql = String::from(
            r#"
            SELECT n.*,
                   COALESCE((SELECT MAX(e.valid_from) FROM graph_edge e
                             WHERE e.from_node_id = n.node_id OR e.to_node_id = n.node_id), 0)
                       AS edge_recency
            FROM graph_node n
            WHERE json_extract(n.props, '$.label') LIKE ?
            "#,
        );
        if node_type.is_some() {
            sql.push_str(" AND n.node_type = ?");
        }
        sql.push_str(" ORDER BY edge_recency DESC, n.node_id ASC LIMIT ?");

        let mut query = sqlx::query(&sql).bind(&pattern);
        if let Some(nt) = node_type {
            query = query.bind(nt);
        }
        query = query.bind(limit);

        for row in query.fetch_all(pool).await? {
            let node = row_to_node(&row);
            if seen.insert(node.node_id.clone()) {
                found.push(node);
                if found.len() >= limit as usize {
                    break;
                }
            }
        }
    }

    Ok(found)
}

pub async fn node_count(pool: &SqlitePool) -> Result<i64> {
    Ok(sqlx::query_scalar("SELECT COUNT(*) FROM graph_node")
        .fetch_one(pool)
        .await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use std::str::FromStr;

    async fn pool() -> SqlitePool {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").unwrap();
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        pool
    }

    fn node(id: &str, label: &str) -> GraphNode {
        GraphNode {
            node_id: id.to_string(),
            node_type: if id.starts_with("mem:") {
                "MemoryCard".to_string()
            } else {
                "Entity".to_string()
            },
            props: serde_json::json!({"label": label}),
            created_at: 0,
        }
    }

    fn edge(from: &str, to: &str, weight: f64) -> GraphEdge {
        GraphEdge {
            edge_id: String::new(),
            from_node_id: from.to_string(),
            to_node_id: to.to_string(),
            edge_type: "MENTIONS".to_string(),
            weight,
            valid_from: Some(100),
            valid_to: None,
            provenance: serde_json::json!({"created_by": "test"}),
        }
    }

    #[test]
    fn slug_is_canonical() {
        assert_eq!(canonical_slug("Ada Lovelace"), "ada-lovelace");
        assert_eq!(canonical_slug("  C++ / Rust!  "), "c-rust");
        assert_eq!(canonical_slug("Écho Garden"), "écho-garden");
    }

    #[test]
    fn edge_id_is_deterministic() {
        let a = make_edge_id("mem:1", "MENTIONS", "ent:rust");
        let b = make_edge_id("mem:1", "MENTIONS", "ent:rust");
        let c = make_edge_id("mem:2", "MENTIONS", "ent:rust");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }

    #[tokio::test]
    async fn node_upsert_is_idempotent() {
        let pool = pool().await;
        let nodes = vec![node("ent:rust", "Rust"), node("ent:sqlite", "SQLite")];
        upsert_nodes(&pool, &nodes).await.unwrap();
        upsert_nodes(&pool, &nodes).await.unwrap();
        assert_eq!(node_count(&pool).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn edge_upsert_accumulates_weight_capped() {
        let pool = pool().await;
        upsert_nodes(&pool, &[node("mem:1", "card"), node("ent:rust", "Rust")])
            .await
            .unwrap();

        let e = edge("mem:1", "ent:rust", 0.9);
        upsert_edges(&pool, &[e.clone()]).await.unwrap();
        let w1: f64 = sqlx::query_scalar("SELECT weight FROM graph_edge")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert!((w1 - 0.9).abs() < 1e-9);

        upsert_edges(&pool, &[e.clone()]).await.unwrap();
        upsert_edges(&pool, &[e.clone()]).await.unwrap();
        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM graph_edge")
            .fetch_one(&pool)
            .await
            .unwrap();
        let w2: f64 = sqlx::query_scalar("SELECT weight FROM graph_edge")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(rows, 1);
        assert!(w2 > w1);
        assert!(w2 <= 1.0);
    }

    #[tokio::test]
    async fn dangling_edge_is_rejected() {
        let pool = pool().await;
        upsert_nodes(&pool, &[node("mem:1", "card")]).await.unwrap();
        let err = upsert_edges(&pool, &[edge("mem:1", "ent:missing", 0.5)]).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn expand_respects_limits_and_hop_superset() {
        let pool = pool().await;
        // mem:1 - ent:a - mem:2 - ent:b - mem:3
        upsert_nodes(
            &pool,
            &[
                node("mem:1", "one"),
                node("mem:2", "two"),
                node("mem:3", "three"),
                node("ent:a", "Alpha"),
                node("ent:b", "Beta"),
            ],
        )
        .await
        .unwrap();
        upsert_edges(
            &pool,
            &[
                edge("mem:1", "ent:a", 0.9),
                edge("mem:2", "ent:a", 0.8),
                edge("mem:2", "ent:b", 0.7),
                edge("mem:3", "ent:b", 0.6),
            ],
        )
        .await
        .unwrap();

        let one_hop = expand(
            &pool,
            &ExpandParams {
                seed_node_ids: vec!["mem:1".to_string()],
                hops: 1,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let two_hop = expand(
            &pool,
            &ExpandParams {
                seed_node_ids: vec!["mem:1".to_string()],
                hops: 2,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let ids = |sg: &Subgraph| {
            sg.nodes
                .iter()
                .map(|n| n.node_id.clone())
                .collect::<std::collections::HashSet<_>>()
        };
        assert!(ids(&two_hop).is_superset(&ids(&one_hop)));
        assert!(ids(&two_hop).contains("mem:2"));

        let bounded = expand(
            &pool,
            &ExpandParams {
                seed_node_ids: vec!["mem:1".to_string()],
                hops: 2,
                max_nodes: 2,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(bounded.nodes.len() <= 2);
    }

    #[tokio::test]
    async fn label_search_prefers_prefix() {
        let pool = pool().await;
        upsert_nodes(
            &pool,
            &[node("ent:rust", "Rust"), node("ent:trust-me", "Trust me")],
        )
        .await
        .unwrap();

        let hits = search_nodes(&pool, "Rust", None, 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].node_id, "ent:rust");
    }

    #[tokio::test]
    async fn deleting_a_card_node_sweeps_orphaned_entities() {
        let pool = pool().await;
        // Two cards mention Rust; only mem:1 mentions SQLite.
        upsert_nodes(
            &pool,
            &[
                node("mem:1", "one"),
                node("mem:2", "two"),
                node("ent:rust", "Rust"),
                node("ent:sqlite", "SQLite"),
            ],
        )
        .await
        .unwrap();
        upsert_edges(
            &pool,
            &[
                edge("mem:1", "ent:rust", 0.6),
                edge("mem:2", "ent:rust", 0.6),
                edge("mem:1", "ent:sqlite", 0.6),
            ],
        )
        .await
        .unwrap();

        let mut tx = pool.begin().await.unwrap();
        delete_card_node_on(&mut *tx, "1").await.unwrap();
        let swept = gc_orphan_entities_on(&mut *tx).await.unwrap();
        tx.commit().await.unwrap();

        // SQLite lost its last edge and is gone; Rust is still mentioned.
        assert_eq!(swept, 1);
        assert!(get_node(&pool, "mem:1").await.unwrap().is_none());
        assert!(get_node(&pool, "ent:sqlite").await.unwrap().is_none());
        assert!(get_node(&pool, "ent:rust").await.unwrap().is_some());

        let mut tx = pool.begin().await.unwrap();
        delete_card_node_on(&mut *tx, "2").await.unwrap();
        let swept = gc_orphan_entities_on(&mut *tx).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(swept, 1);
        assert!(get_node(&pool, "ent:rust").await.unwrap().is_none());
    }
}
