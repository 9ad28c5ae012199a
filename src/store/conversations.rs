//! Conversation, turn, and citation repositories for the chat surface.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::db::{new_id, now_ts};
use crate::models::{ChatCitation, Conversation, Turn};

/// Return the existing conversation or create one. The title is seeded from
/// the first user message.
pub async fn ensure_conversation(
    pool: &SqlitePool,
    conversation_id: Option<&str>,
    title_hint: &str,
) -> Result<String> {
    if let Some(id) = conversation_id {
        let exists: Option<String> =
            sqlx::query_scalar("SELECT conversation_id FROM conversation WHERE conversation_id = ?")
                .bind(id)
                .fetch_optional(pool)
                .await?;
        if let Some(id) = exists {
            return Ok(id);
        }
    }

    let id = conversation_id
        .map(String::from)
        .unwrap_or_else(new_id);
    let title: String = title_hint.chars().take(80).collect();
    sqlx::query("INSERT INTO conversation (conversation_id, title, created_at) VALUES (?, ?, ?)")
        .bind(&id)
        .bind(&title)
        .bind(now_ts())
        .execute(pool)
        .await?;
    Ok(id)
}

pub struct NewTurn {
    pub conversation_id: String,
    pub user_text: String,
    pub assistant_text: String,
    pub verdict: String,
    pub trace_id: String,
    pub citations: serde_json::Value,
    pub evidence: serde_json::Value,
}

/// Append a turn and its citation rows in one transaction.
pub async fn append_turn(
    pool: &SqlitePool,
    turn: &NewTurn,
    citations: &[(String, String, i64, i64)], // (memory_id, quote, span_start, span_end)
) -> Result<String> {
    let turn_id = new_id();
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO conversation_turn
            (turn_id, conversation_id, user_text, assistant_text, verdict, trace_id,
             citations_json, evidence_json, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&turn_id)
    .bind(&turn.conversation_id)
    .bind(&turn.user_text)
    .bind(&turn.assistant_text)
    .bind(&turn.verdict)
    .bind(&turn.trace_id)
    .bind(turn.citations.to_string())
    .bind(turn.evidence.to_string())
    .bind(now_ts())
    .execute(&mut *tx)
    .await?;

    for (memory_id, quote, span_start, span_end) in citations {
        sqlx::query(
            r#"
            INSERT INTO chat_citation (citation_id, turn_id, memory_id, quote, span_start, span_end)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(new_id())
        .bind(&turn_id)
        .bind(memory_id)
        .bind(quote)
        .bind(span_start)
        .bind(span_end)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(turn_id)
}

/// Conversation summaries, newest-first, with turn counts.
pub async fn list(pool: &SqlitePool, limit: i64) -> Result<Vec<serde_json::Value>> {
    let rows = sqlx::query(
        r#"
        SELECT c.conversation_id, c.title, c.created_at,
               COUNT(t.turn_id) AS turn_count,
               MAX(t.created_at) AS last_turn_at
        FROM conversation c
        LEFT JOIN conversation_turn t ON t.conversation_id = c.conversation_id
        GROUP BY c.conversation_id
        ORDER BY COALESCE(MAX(t.created_at), c.created_at) DESC
        LIMIT ?
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|r| {
            serde_json::json!({
                "conversation_id": r.get::<String, _>("conversation_id"),
                "title": r.get::<Option<String>, _>("title"),
                "created_at": r.get::<i64, _>("created_at"),
                "turn_count": r.get::<i64, _>("turn_count"),
                "last_turn_at": r.get::<Option<i64>, _>("last_turn_at"),
            })
        })
        .collect())
}

pub async fn get(pool: &SqlitePool, conversation_id: &str) -> Result<Option<Conversation>> {
    let row = sqlx::query("SELECT * FROM conversation WHERE conversation_id = ?")
        .bind(conversation_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| Conversation {
        conversation_id: r.get("conversation_id"),
        title: r.get("title"),
        created_at: r.get("created_at"),
    }))
}

/// Ordered turns for one conversation.
pub async fn turns(pool: &SqlitePool, conversation_id: &str) -> Result<Vec<Turn>> {
    let rows = sqlx::query(
        "SELECT * FROM conversation_turn WHERE conversation_id = ? ORDER BY created_at ASC, rowid ASC",
    )
    .bind(conversation_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|r| Turn {
            turn_id: r.get("turn_id"),
            conversation_id: r.get("conversation_id"),
            user_text: r.get("user_text"),
            assistant_text: r.get("assistant_text"),
            verdict: r.get("verdict"),
            trace_id: r.get("trace_id"),
            citations: serde_json::from_str::<serde_json::Value>(
                &r.get::<String, _>("citations_json"),
            )
            .unwrap_or_else(|_| serde_json::json!([])),
            evidence: serde_json::from_str::<serde_json::Value>(
                &r.get::<String, _>("evidence_json"),
            )
            .unwrap_or_else(|_| serde_json::json!([])),
            created_at: r.get("created_at"),
        })
        .collect())
}

pub async fn citations_for_turn(pool: &SqlitePool, turn_id: &str) -> Result<Vec<ChatCitation>> {
    let rows = sqlx::query("SELECT * FROM chat_citation WHERE turn_id = ?")
        .bind(turn_id)
        .fetch_all(pool)
        .await?;
    Ok(rows
        .iter()
        .map(|r| ChatCitation {
            citation_id: r.get("citation_id"),
            turn_id: r.get("turn_id"),
            memory_id: r.get("memory_id"),
            quote: r.get("quote"),
            span_start: r.get("span_start"),
            span_end: r.get("span_end"),
        })
        .collect())
}
