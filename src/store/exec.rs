//! Execution-trace repository: traces, nodes, edges, and tool calls.
//!
//! Exec rows are append-only; nothing mutates a node after its
//! `finished_ts` is set. Within one trace, nodes are committed in causal
//! order — an `on_ok` edge is inserted only after the predecessor reached
//! `ok`.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::db::{new_id, now_ts};
use crate::models::{ExecEdge, ExecNode, ExecTrace, ToolCall};

pub async fn create_trace(
    pool: &SqlitePool,
    trace_id: &str,
    metadata: &serde_json::Value,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO exec_trace (trace_id, started_ts, status, metadata_json)
        VALUES (?, ?, 'running', ?)
        "#,
    )
    .bind(trace_id)
    .bind(now_ts())
    .bind(metadata.to_string())
    .execute(pool)
    .await?;
    Ok(())
}

/// Finalize a trace. Status: `ok`, `error`, or `cancelled`. No-op when the
/// trace is already finished (append-only discipline).
pub async fn finish_trace(pool: &SqlitePool, trace_id: &str, status: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE exec_trace SET status = ?, finished_ts = ?
        WHERE trace_id = ? AND finished_ts IS NULL
        "#,
    )
    .bind(status)
    .bind(now_ts())
    .bind(trace_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn set_root_call(pool: &SqlitePool, trace_id: &str, call_id: &str) -> Result<()> {
    sqlx::query(
        "UPDATE exec_trace SET root_call_id = ? WHERE trace_id = ? AND root_call_id IS NULL",
    )
    .bind(call_id)
    .bind(trace_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_trace(pool: &SqlitePool, trace_id: &str) -> Result<Option<ExecTrace>> {
    let row = sqlx::query("SELECT * FROM exec_trace WHERE trace_id = ?")
        .bind(trace_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| ExecTrace {
        trace_id: r.get("trace_id"),
        started_ts: r.get("started_ts"),
        finished_ts: r.get("finished_ts"),
        status: r.get("status"),
        root_call_id: r.get("root_call_id"),
        metadata: serde_json::from_str::<serde_json::Value>(&r.get::<String, _>("metadata_json"))
            .unwrap_or_else(|_| serde_json::json!({})),
    }))
}

/// Insert a node in state `running`, attempt 1. Returns the node id.
pub async fn create_node(
    pool: &SqlitePool,
    trace_id: &str,
    call_id: &str,
    tool_name: &str,
    timeout_ms: i64,
) -> Result<String> {
    let exec_node_id = new_id();
    sqlx::query(
        r#"
        INSERT INTO exec_node
            (exec_node_id, trace_id, call_id, tool_name, state, attempt, timeout_ms, started_ts)
        VALUES (?, ?, ?, ?, 'running', 1, ?, ?)
        "#,
    )
    .bind(&exec_node_id)
    .bind(trace_id)
    .bind(call_id)
    .bind(tool_name)
    .bind(timeout_ms)
    .bind(now_ts())
    .execute(pool)
    .await?;
    Ok(exec_node_id)
}

/// Terminal transition: `running` → `ok` / `error` / `timeout`.
pub async fn update_node_state(pool: &SqlitePool, exec_node_id: &str, state: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE exec_node SET state = ?, finished_ts = ?
        WHERE exec_node_id = ? AND finished_ts IS NULL
        "#,
    )
    .bind(state)
    .bind(now_ts())
    .bind(exec_node_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn create_edge(
    pool: &SqlitePool,
    trace_id: &str,
    from_exec_node_id: &str,
    to_exec_node_id: &str,
    condition: &str,
) -> Result<String> {
    let exec_edge_id = new_id();
    sqlx::query(
        r#"
        INSERT INTO exec_edge (exec_edge_id, trace_id, from_exec_node_id, to_exec_node_id, condition)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(&exec_edge_id)
    .bind(trace_id)
    .bind(from_exec_node_id)
    .bind(to_exec_node_id)
    .bind(condition)
    .execute(pool)
    .await?;
    Ok(exec_edge_id)
}

pub async fn nodes_for_trace(pool: &SqlitePool, trace_id: &str) -> Result<Vec<ExecNode>> {
    let rows = sqlx::query("SELECT * FROM exec_node WHERE trace_id = ? ORDER BY started_ts ASC, rowid ASC")
        .bind(trace_id)
        .fetch_all(pool)
        .await?;
    Ok(rows
        .iter()
        .map(|r| ExecNode {
            exec_node_id: r.get("exec_node_id"),
            trace_id: r.get("trace_id"),
            call_id: r.get("call_id"),
            tool_name: r.get("tool_name"),
            state: r.get("state"),
            attempt: r.get("attempt"),
            timeout_ms: r.get("timeout_ms"),
            started_ts: r.get("started_ts"),
            finished_ts: r.get("finished_ts"),
        })
        .collect())
}

pub async fn edges_for_trace(pool: &SqlitePool, trace_id: &str) -> Result<Vec<ExecEdge>> {
    let rows = sqlx::query("SELECT * FROM exec_edge WHERE trace_id = ?")
        .bind(trace_id)
        .fetch_all(pool)
        .await?;
    Ok(rows
        .iter()
        .map(|r| ExecEdge {
            exec_edge_id: r.get("exec_edge_id"),
            trace_id: r.get("trace_id"),
            from_exec_node_id: r.get("from_exec_node_id"),
            to_exec_node_id: r.get("to_exec_node_id"),
            condition: r.get("condition"),
        })
        .collect())
}

fn row_to_call(row: &sqlx::sqlite::SqliteRow) -> ToolCall {
    ToolCall {
        call_id: row.get("call_id"),
        tool_name: row.get("tool_name"),
        ts: row.get("ts"),
        trace_id: row.get("trace_id"),
        inputs: serde_json::from_str::<serde_json::Value>(&row.get::<String, _>("inputs"))
            .unwrap_or_else(|_| serde_json::json!({})),
        outputs: row
            .get::<Option<String>, _>("outputs")
            .and_then(|s| serde_json::from_str(&s).ok()),
        status: row.get("status"),
    }
}

pub async fn insert_tool_call(
    pool: &SqlitePool,
    call_id: &str,
    tool_name: &str,
    trace_id: Option<&str>,
    inputs: &serde_json::Value,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO tool_call (call_id, tool_name, ts, trace_id, inputs, status)
        VALUES (?, ?, ?, ?, ?, 'running')
        "#,
    )
    .bind(call_id)
    .bind(tool_name)
    .bind(now_ts())
    .bind(trace_id)
    .bind(inputs.to_string())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn update_tool_call(
    pool: &SqlitePool,
    call_id: &str,
    outputs: Option<&serde_json::Value>,
    status: &str,
) -> Result<()> {
    sqlx::query("UPDATE tool_call SET outputs = ?, status = ? WHERE call_id = ?")
        .bind(outputs.map(|o| o.to_string()))
        .bind(status)
        .bind(call_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn list_tool_calls(
    pool: &SqlitePool,
    trace_id: Option<&str>,
    limit: i64,
) -> Result<Vec<ToolCall>> {
    let rows = if let Some(trace_id) = trace_id {
        sqlx::query("SELECT * FROM tool_call WHERE trace_id = ? ORDER BY ts ASC LIMIT ?")
            .bind(trace_id)
            .bind(limit)
            .fetch_all(pool)
            .await?
    } else {
        sqlx::query("SELECT * FROM tool_call ORDER BY ts DESC LIMIT ?")
            .bind(limit)
            .fetch_all(pool)
            .await?
    };
    Ok(rows.iter().map(row_to_call).collect())
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

    #[tokio::test]
    async fn trace_finish_is_write_once() {
        let pool = pool().await;
        create_trace(&pool, "t1", &serde_json::json!({})).await.unwrap();
        finish_trace(&pool, "t1", "ok").await.unwrap();
        finish_trace(&pool, "t1", "error").await.unwrap();

        let trace = get_trace(&pool, "t1").await.unwrap().unwrap();
        assert_eq!(trace.status, "ok");
        assert!(trace.finished_ts.is_some());
    }

    #[tokio::test]
    async fn nodes_and_edges_round_trip() {
        let pool = pool().await;
        create_trace(&pool, "t1", &serde_json::json!({})).await.unwrap();
        insert_tool_call(&pool, "c1", "doc_parse", Some("t1"), &serde_json::json!({}))
            .await
            .unwrap();
        let n1 = create_node(&pool, "t1", "c1", "doc_parse", 10_000).await.unwrap();
        update_node_state(&pool, &n1, "ok").await.unwrap();
        insert_tool_call(&pool, "c2", "summarizer", Some("t1"), &serde_json::json!({}))
            .await
            .unwrap();
        let n2 = create_node(&pool, "t1", "c2", "summarizer", 10_000).await.unwrap();
        create_edge(&pool, "t1", &n1, &n2, "on_ok").await.unwrap();

        let nodes = nodes_for_trace(&pool, "t1").await.unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].state, "ok");
        assert!(nodes[0].finished_ts.is_some());

        let edges = edges_for_trace(&pool, "t1").await.unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].condition, "on_ok");

        let calls = list_tool_calls(&pool, Some("t1"), 10).await.unwrap();
        assert_eq!(calls.len(), 2);
    }
}
