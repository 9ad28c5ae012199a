//! Database schema migrations.
//!
//! Creates all required tables and ensures idempotent execution. Run via
//! `eg init`; `eg serve` also applies them on startup.
//!
//! # Tables
//!
//! | Table | Purpose |
//! |-------|---------|
//! | `source` | External origins (watched dirs, browser, API), deduped by URI |
//! | `blob` | Content-addressed binaries, deduped by `(sha256, path)` |
//! | `file_state` | Watcher dedup tracker keyed by path |
//! | `jobs` | Persistent at-least-once job queue with leasing |
//! | `memory_card` | Atomic knowledge units |
//! | `memory_card_fts` | FTS5 index over card summary and content text |
//! | `embedding` | Card → vector-index point links per modality |
//! | `vector_point` | Embedding vectors stored as BLOBs |
//! | `graph_node` / `graph_edge` | Property graph (cards, entities, mentions) |
//! | `exec_trace` / `exec_node` / `exec_edge` | Execution DAG per operation |
//! | `tool_call` | One row per registry dispatch |
//! | `conversation` / `conversation_turn` | Chat history |
//! | `chat_citation` | Quote-level answer → card links |
//! | `search_query` | Retrieval history log |
//!
//! # Idempotency
//!
//! All operations use `CREATE TABLE IF NOT EXISTS` or check `sqlite_master`
//! before creation. Running `eg init` multiple times is safe.

use anyhow::Result;
use sqlx::SqlitePool;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS source (
            source_id TEXT PRIMARY KEY,
            source_type TEXT NOT NULL,
            uri TEXT NOT NULL UNIQUE,
            created_ts INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS blob (
            blob_id TEXT PRIMARY KEY,
            sha256 TEXT NOT NULL,
            path TEXT NOT NULL,
            mime TEXT NOT NULL,
            size_bytes INTEGER NOT NULL,
            source_id TEXT NOT NULL,
            created_ts INTEGER NOT NULL,
            UNIQUE(sha256, path),
            FOREIGN KEY (source_id) REFERENCES source(source_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS file_state (
            path TEXT PRIMARY KEY,
            mtime_ns INTEGER NOT NULL,
            size_bytes INTEGER NOT NULL,
            sha256 TEXT NOT NULL,
            last_seen_ts INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            job_id TEXT PRIMARY KEY,
            type TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'queued',
            attempts INTEGER NOT NULL DEFAULT 0,
            next_run_ts INTEGER NOT NULL DEFAULT 0,
            payload_json TEXT NOT NULL,
            error_text TEXT,
            worker_id TEXT,
            created_ts INTEGER NOT NULL,
            updated_ts INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS memory_card (
            memory_id TEXT PRIMARY KEY,
            type TEXT NOT NULL,
            summary TEXT NOT NULL,
            content_text TEXT NOT NULL DEFAULT '',
            source_time INTEGER,
            created_at INTEGER NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            blob_id TEXT,
            trace_id TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Card idempotency: at most one card per (blob_id, trace_id). A partial
    // index so API-ingested cards (no blob) are exempt.
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_card_blob_trace
            ON memory_card(blob_id, trace_id)
            WHERE blob_id IS NOT NULL AND trace_id IS NOT NULL
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 virtual table (not idempotent natively, check first)
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='memory_card_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE memory_card_fts USING fts5(
                memory_id UNINDEXED,
                summary,
                content_text
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS embedding (
            embedding_id TEXT PRIMARY KEY,
            memory_id TEXT NOT NULL,
            modality TEXT NOT NULL,
            vector_ref TEXT NOT NULL,
            FOREIGN KEY (memory_id) REFERENCES memory_card(memory_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Vector-index backing table. Points are idempotent by point_id;
    // memory_id is attached at card commit and NULL for scratch points
    // (query embeddings), which search ignores.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS vector_point (
            point_id TEXT PRIMARY KEY,
            memory_id TEXT,
            modality TEXT NOT NULL,
            embedding BLOB NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS graph_node (
            node_id TEXT PRIMARY KEY,
            node_type TEXT NOT NULL,
            props TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS graph_edge (
            edge_id TEXT PRIMARY KEY,
            from_node_id TEXT NOT NULL,
            to_node_id TEXT NOT NULL,
            edge_type TEXT NOT NULL,
            weight REAL NOT NULL DEFAULT 0.5,
            valid_from INTEGER,
            valid_to INTEGER,
            provenance TEXT NOT NULL DEFAULT '{}',
            FOREIGN KEY (from_node_id) REFERENCES graph_node(node_id),
            FOREIGN KEY (to_node_id) REFERENCES graph_node(node_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS exec_trace (
            trace_id TEXT PRIMARY KEY,
            started_ts INTEGER NOT NULL,
            finished_ts INTEGER,
            status TEXT NOT NULL DEFAULT 'running',
            root_call_id TEXT,
            metadata_json TEXT NOT NULL DEFAULT '{}'
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS exec_node (
            exec_node_id TEXT PRIMARY KEY,
            trace_id TEXT NOT NULL,
            call_id TEXT NOT NULL,
            tool_name TEXT NOT NULL,
            state TEXT NOT NULL DEFAULT 'pending',
            attempt INTEGER NOT NULL DEFAULT 1,
            timeout_ms INTEGER NOT NULL DEFAULT 10000,
            started_ts INTEGER NOT NULL,
            finished_ts INTEGER,
            FOREIGN KEY (trace_id) REFERENCES exec_trace(trace_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS exec_edge (
            exec_edge_id TEXT PRIMARY KEY,
            trace_id TEXT NOT NULL,
            from_exec_node_id TEXT NOT NULL,
            to_exec_node_id TEXT NOT NULL,
            condition TEXT NOT NULL DEFAULT 'on_ok',
            FOREIGN KEY (trace_id) REFERENCES exec_trace(trace_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tool_call (
            call_id TEXT PRIMARY KEY,
            tool_name TEXT NOT NULL,
            ts INTEGER NOT NULL,
            trace_id TEXT,
            inputs TEXT NOT NULL DEFAULT '{}',
            outputs TEXT,
            status TEXT NOT NULL DEFAULT 'running'
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conversation (
            conversation_id TEXT PRIMARY KEY,
            title TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conversation_turn (
            turn_id TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            user_text TEXT NOT NULL,
            assistant_text TEXT NOT NULL,
            verdict TEXT NOT NULL,
            trace_id TEXT NOT NULL,
            citations_json TEXT NOT NULL DEFAULT '[]',
            evidence_json TEXT NOT NULL DEFAULT '[]',
            created_at INTEGER NOT NULL,
            FOREIGN KEY (conversation_id) REFERENCES conversation(conversation_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chat_citation (
            citation_id TEXT PRIMARY KEY,
            turn_id TEXT NOT NULL,
            memory_id TEXT NOT NULL,
            quote TEXT NOT NULL DEFAULT '',
            span_start INTEGER NOT NULL DEFAULT 0,
            span_end INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (turn_id) REFERENCES conversation_turn(turn_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS search_query (
            search_id TEXT PRIMARY KEY,
            query_text TEXT NOT NULL,
            filters_json TEXT NOT NULL DEFAULT '{}',
            result_count INTEGER NOT NULL DEFAULT 0,
            trace_id TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Indexes for common query patterns
    for stmt in [
        "CREATE INDEX IF NOT EXISTS idx_blob_sha ON blob(sha256)",
        "CREATE INDEX IF NOT EXISTS idx_jobs_lease ON jobs(status, type, created_ts)",
        "CREATE INDEX IF NOT EXISTS idx_card_created ON memory_card(created_at DESC)",
        "CREATE INDEX IF NOT EXISTS idx_embedding_memory ON embedding(memory_id)",
        "CREATE INDEX IF NOT EXISTS idx_vector_modality ON vector_point(modality)",
        "CREATE INDEX IF NOT EXISTS idx_edge_from ON graph_edge(from_node_id)",
        "CREATE INDEX IF NOT EXISTS idx_edge_to ON graph_edge(to_node_id)",
        "CREATE INDEX IF NOT EXISTS idx_exec_node_trace ON exec_node(trace_id)",
        "CREATE INDEX IF NOT EXISTS idx_exec_edge_trace ON exec_edge(trace_id)",
        "CREATE INDEX IF NOT EXISTS idx_tool_call_trace ON tool_call(trace_id)",
        "CREATE INDEX IF NOT EXISTS idx_turn_conversation ON conversation_turn(conversation_id, created_at)",
        "CREATE INDEX IF NOT EXISTS idx_search_created ON search_query(created_at DESC)",
    ] {
        sqlx::query(stmt).execute(pool).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use std::str::FromStr;

    async fn mem_pool() -> SqlitePool {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").unwrap();
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let pool = mem_pool().await;
        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let tables: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN
             ('source','blob','file_state','jobs','memory_card','embedding',
              'vector_point','graph_node','graph_edge','exec_trace','exec_node',
              'exec_edge','tool_call','conversation','conversation_turn',
              'chat_citation','search_query')",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(tables, 17);
    }
}
