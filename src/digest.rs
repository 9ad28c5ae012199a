//! Time-windowed digest and today feed.
//!
//! Aggregates recent cards into a personal-assistant view: reminders pulled
//! from card metadata `actions`, top entities by MENTIONS activity in the
//! window, tag clusters, and a mime-category activity summary.

use anyhow::Result;
use serde_json::{json, Value};
use sqlx::{Row, SqlitePool};

use crate::db::now_ts;
use crate::models::MemoryCard;
use crate::store::cards;

fn date_of(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}

/// Recognized digest windows, in days.
pub fn window_days(window: &str) -> Option<i64> {
    match window {
        "24h" => Some(1),
        "7d" => Some(7),
        "30d" => Some(30),
        _ => None,
    }
}

fn card_title(card: &MemoryCard) -> String {
    if let Some(title) = card.metadata.get("title").and_then(|t| t.as_str()) {
        return title.to_string();
    }
    if let Some(path) = card.metadata.get("file_path").and_then(|p| p.as_str()) {
        if let Some(name) = std::path::Path::new(path).file_name() {
            return name.to_string_lossy().to_string();
        }
    }
    let summary: String = card.summary.chars().take(60).collect();
    if summary.is_empty() {
        card.memory_id.chars().take(16).collect()
    } else {
        summary
    }
}

fn card_brief(card: &MemoryCard) -> Value {
    json!({
        "memory_id": card.memory_id,
        "title": card_title(card),
        "type": card.card_type,
        "summary": card.summary,
        "created_at": card.created_at,
        "source_type": card.source_type(),
    })
}

fn is_date(s: &str) -> bool {
    chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
}

fn priority_rank(priority: &str) -> u8 {
    match priority {
        "high" => 0,
        "low" => 2,
        _ => 1,
    }
}

/// Pull inline reminder markers out of an action string: a `due:YYYY-MM-DD`
/// (or bare date) token and a `!high` / `!low` priority token. Returns the
/// cleaned display text, the due date, and the priority (default `medium`).
fn parse_action(text: &str) -> (String, Option<String>, &'static str) {
    let mut due: Option<String> = None;
    let mut priority = "medium";
    let mut kept: Vec<&str> = Vec::new();

    for token in text.split_whitespace() {
        if due.is_none() {
            if let Some(date) = token.strip_prefix("due:").filter(|d| is_date(d)) {
                due = Some(date.to_string());
                continue;
            }
            if is_date(token) {
                due = Some(token.to_string());
                continue;
            }
        }
        match token {
            "!high" | "!urgent" => {
                priority = "high";
                continue;
            }
            "!low" => {
                priority = "low";
                continue;
            }
            _ => {}
        }
        kept.push(token);
    }

    (kept.join(" "), due, priority)
}

/// Reminders: every metadata `actions` entry of cards in the window,
/// overdue-first, then priority, then due date.
fn reminders_from(window_cards: &[MemoryCard], today: &str) -> Vec<Value> {
    struct Reminder {
        overdue: bool,
        rank: u8,
        due_key: String,
        json: Value,
    }

    let mut reminders: Vec<Reminder> = Vec::new();
    for card in window_cards {
        let Some(actions) = card.metadata.get("actions").and_then(|a| a.as_array()) else {
            continue;
        };
        for action in actions {
            let Some(raw) = action.as_str().filter(|t| !t.trim().is_empty()) else {
                continue;
            };
            let (text, due, priority) = parse_action(raw.trim());
            if text.is_empty() {
                continue;
            }
            let due_key = due.clone().unwrap_or_else(|| "9999-12-31".to_string());
            reminders.push(Reminder {
                overdue: due_key.as_str() <= today,
                rank: priority_rank(priority),
                due_key,
                json: json!({
                    "memory_id": card.memory_id,
                    "title": card_title(card),
                    "text": text,
                    "due": due.unwrap_or_default(),
                    "priority": priority,
                }),
            });
        }
    }

    reminders.sort_by(|a, b| {
        b.overdue
            .cmp(&a.overdue)
            .then_with(|| a.rank.cmp(&b.rank))
            .then_with(|| a.due_key.cmp(&b.due_key))
    });
    reminders.into_iter().map(|r| r.json).collect()
}

/// Entities ranked by MENTIONS edges that became valid in the window.
async fn top_entities(pool: &SqlitePool, cutoff: i64, limit: i64) -> Result<Vec<Value>> {
    let rows = sqlx::query(
        r#"
        SELECT e.to_node_id AS node_id,
               COUNT(*) AS mentions,
               MAX(n.props) AS props,
               MAX(n.node_type) AS node_type
        FROM graph_edge e
        JOIN graph_node n ON n.node_id = e.to_node_id
        WHERE e.edge_type = 'MENTIONS'
          AND e.to_node_id LIKE 'ent:%'
          AND (e.valid_from IS NULL OR e.valid_from >= ?)
        GROUP BY e.to_node_id
        ORDER BY mentions DESC, e.to_node_id ASC
        LIMIT ?
        "#,
    )
    .bind(cutoff)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|r| {
            let props: Value = serde_json::from_str::<Value>(&r.get::<String, _>("props"))
                .unwrap_or_else(|_| json!({}));
            json!({
                "node_id": r.get::<String, _>("node_id"),
                "label": props.get("label").cloned().unwrap_or(json!("")),
                "node_type": r.get::<String, _>("node_type"),
                "mentions": r.get::<i64, _>("mentions"),
            })
        })
        .collect())
}

/// Tag clusters: tags shared by at least two cards in the window, with the
/// member card ids.
fn tag_clusters(window_cards: &[MemoryCard], limit: usize) -> Vec<Value> {
    let mut by_tag: std::collections::BTreeMap<String, Vec<String>> = Default::default();
    for card in window_cards {
        let Some(tags) = card.metadata.get("tags").and_then(|t| t.as_array()) else {
            continue;
        };
        for tag in tags.iter().filter_map(|t| t.as_str()) {
            by_tag
                .entry(tag.to_string())
                .or_default()
                .push(card.memory_id.clone());
        }
    }

    let mut clusters: Vec<(String, Vec<String>)> = by_tag
        .into_iter()
        .filter(|(_, members)| members.len() >= 2)
        .collect();
    clusters.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then(a.0.cmp(&b.0)));
    clusters
        .into_iter()
        .take(limit)
        .map(|(tag, members)| json!({ "tag": tag, "memory_ids": members }))
        .collect()
}

/// Counts by mime category for the activity summary.
fn activity_summary(window_cards: &[MemoryCard]) -> Value {
    let mut documents = 0;
    let mut images = 0;
    let mut audio = 0;
    let mut notes = 0;
    let mut other = 0;
    for card in window_cards {
        let mime = card
            .metadata
            .get("mime")
            .and_then(|m| m.as_str())
            .unwrap_or("");
        if mime.starts_with("image/") {
            images += 1;
        } else if mime.starts_with("audio/") {
            audio += 1;
        } else if mime.starts_with("text/") || mime.starts_with("application/") {
            documents += 1;
        } else if card.card_type == "note" || card.card_type.starts_with("browser") {
            notes += 1;
        } else {
            other += 1;
        }
    }
    json!({
        "new_documents": documents,
        "new_images": images,
        "new_audio": audio,
        "new_notes": notes,
        "other": other,
        "total": window_cards.len(),
    })
}

/// The `/digest` payload.
pub async fn digest(pool: &SqlitePool, window: &str, limit: i64) -> Result<Option<Value>> {
    let Some(days) = window_days(window) else {
        return Ok(None);
    };
    let now = now_ts();
    let cutoff = now - days * 86_400;
    let window_cards = cards::created_since(pool, cutoff, 200).await?;

    let shown: Vec<Value> = window_cards.iter().take(limit as usize).map(card_brief).collect();
    let entities = top_entities(pool, cutoff, 10).await?;
    let reminders = reminders_from(&window_cards, &date_of(now));
    let clusters = tag_clusters(&window_cards, 8);

    Ok(Some(json!({
        "window": window,
        "cards": shown,
        "top_entities": entities,
        "reminders": reminders,
        "clusters": clusters,
        "activity_summary": activity_summary(&window_cards),
    })))
}

/// The `/feed/today` payload.
pub async fn feed_today(pool: &SqlitePool) -> Result<Value> {
    let now = now_ts();
    let day_cards = cards::created_since(pool, now - 86_400, 200).await?;
    let week_cutoff = now - 7 * 86_400;

    let date = date_of(now);

    Ok(json!({
        "date": date,
        "reminders": reminders_from(&day_cards, &date),
        "recent_memories": day_cards.iter().take(10).map(card_brief).collect::<Vec<_>>(),
        "emerging_topics": top_entities(pool, week_cutoff, 8).await?,
        "activity_summary": activity_summary(&day_cards),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_are_fixed() {
        assert_eq!(window_days("24h"), Some(1));
        assert_eq!(window_days("7d"), Some(7));
        assert_eq!(window_days("30d"), Some(30));
        assert_eq!(window_days("1y"), None);
    }

    fn card_with(metadata: Value) -> MemoryCard {
        MemoryCard {
            memory_id: "m1".to_string(),
            card_type: "note".to_string(),
            summary: "A summary".to_string(),
            content_text: String::new(),
            source_time: None,
            created_at: 0,
            metadata,
            blob_id: None,
            trace_id: None,
        }
    }

    #[test]
    fn reminders_come_from_actions() {
        let card = card_with(json!({"actions": ["water the plants", "  "]}));
        let reminders = reminders_from(&[card], "2026-08-02");
        assert_eq!(reminders.len(), 1);
        assert_eq!(reminders[0]["text"], "water the plants");
        assert_eq!(reminders[0]["priority"], "medium");
        assert_eq!(reminders[0]["due"], "");
    }

    #[test]
    fn action_markers_are_parsed_out() {
        let (text, due, priority) = parse_action("pay rent due:2026-09-01 !high");
        assert_eq!(text, "pay rent");
        assert_eq!(due.as_deref(), Some("2026-09-01"));
        assert_eq!(priority, "high");

        let (text, due, priority) = parse_action("2026-07-01 return library books");
        assert_eq!(text, "return library books");
        assert_eq!(due.as_deref(), Some("2026-07-01"));
        assert_eq!(priority, "medium");

        let (text, due, priority) = parse_action("just a note");
        assert_eq!(text, "just a note");
        assert!(due.is_none());
        assert_eq!(priority, "medium");
    }

    #[test]
    fn reminders_sort_overdue_first_then_priority() {
        let card = card_with(json!({"actions": [
            "someday cleanup !low",
            "future filing due:2026-12-01",
            "late taxes due:2026-01-15",
            "urgent follow-up !high",
            "late watering due:2026-03-01 !high",
        ]}));
        let reminders = reminders_from(&[card], "2026-08-02");
        let texts: Vec<&str> = reminders.iter().map(|r| r["text"].as_str().unwrap()).collect();
        // Overdue (due <= today) sorts first, high before medium, then by due;
        // undated items follow, ranked by priority.
        assert_eq!(
            texts,
            vec![
                "late watering",
                "late taxes",
                "urgent follow-up",
                "future filing",
                "someday cleanup",
            ]
        );
    }

    #[test]
    fn clusters_need_two_members() {
        let a = card_with(json!({"tags": ["rust"]}));
        let mut b = card_with(json!({"tags": ["rust", "garden"]}));
        b.memory_id = "m2".to_string();
        let clusters = tag_clusters(&[a, b], 8);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0]["tag"], "rust");
    }
}
