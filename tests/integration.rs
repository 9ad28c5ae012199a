//! End-to-end scenarios over the library API.
//!
//! Each test builds an isolated garden in a tempdir: file-backed SQLite,
//! a watch root, stub tool modes (no LLM, no model downloads). Worker
//! processing is driven explicitly via `queue::drain` instead of spawning
//! background tasks, so every assertion runs against settled state.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use echo_garden::chat::{chat, ChatRequest};
use echo_garden::config::Config;
use echo_garden::orchestrator::ingest_text;
use echo_garden::retrieve::{hybrid_retrieve, RetrieveRequest};
use echo_garden::store::{blobs, cards, conversations, exec, jobs, search_log};
use echo_garden::tools::ToolContext;
use echo_garden::{db, graph, migrate, queue, watcher};
use tempfile::TempDir;

async fn setup() -> (TempDir, ToolContext) {
    let tmp = TempDir::new().unwrap();
    let inbox = tmp.path().join("inbox");
    fs::create_dir_all(&inbox).unwrap();

    let config_toml = format!(
        r#"
        [db]
        path = "{}/data/eg.sqlite"

        [watch]
        root = "{}/inbox"
        poll_interval_s = 2
        max_file_mb = 20

        [queue]
        workers = 2
        max_job_attempts = 3
        "#,
        tmp.path().display(),
        tmp.path().display()
    );
    let config: Config = toml::from_str(&config_toml).unwrap();
    echo_garden::config::validate(&config).unwrap();

    let pool = db::connect(&config).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    let ctx = ToolContext::new(pool, Arc::new(config));
    (tmp, ctx)
}

fn write_file(dir: &Path, name: &str, bytes: &[u8]) {
    fs::write(dir.join(name), bytes).unwrap();
}

// ── Scenario: inline text ingest round-trips ──

#[tokio::test]
async fn text_ingest_round_trip() {
    let (_tmp, ctx) = setup().await;

    let input = "EchoGarden is a local-first knowledge garden.";
    let outcome = ingest_text(&ctx, input, None).await.unwrap();
    assert_eq!(outcome.status, "ok");
    let memory_id = outcome.memory_id.unwrap();

    let card = cards::get(&ctx.pool, &memory_id).await.unwrap().unwrap();
    assert_eq!(card.content_text, input);
    assert!(!card.summary.is_empty());
    assert!(card.summary.chars().count() <= 400);
    assert_eq!(card.metadata["pipeline"], "text");

    // The trace is finished and every node reached ok.
    let trace = exec::get_trace(&ctx.pool, &outcome.trace_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(trace.status, "ok");
    let nodes = exec::nodes_for_trace(&ctx.pool, &outcome.trace_id)
        .await
        .unwrap();
    assert!(nodes.iter().all(|n| n.state == "ok"));
}

// ── Scenario: duplicate file drop ──

#[tokio::test]
async fn duplicate_file_drop_yields_two_cards_one_sha() {
    let (tmp, ctx) = setup().await;
    let inbox = tmp.path().join("inbox");

    let bytes = b"Identical bytes about perennial gardens.";
    write_file(&inbox, "a.txt", bytes);
    write_file(&inbox, "b.txt", bytes);

    let stats = watcher::scan_once(&ctx).await.unwrap();
    assert_eq!(stats.files_changed, 2);
    queue::drain(&ctx, "test-worker").await.unwrap();

    // Two cards from two blobs sharing one sha.
    assert_eq!(cards::count(&ctx.pool).await.unwrap(), 2);
    let shas: Vec<_> = blobs::find_by_sha(
        &ctx.pool,
        &watcher::sha256_file(&inbox.join("a.txt")).unwrap(),
    )
    .await
    .unwrap();
    assert_eq!(shas.len(), 2);
    assert_ne!(shas[0].blob_id, shas[1].blob_id);

    // A subsequent poll produces no new work.
    let stats = watcher::scan_once(&ctx).await.unwrap();
    assert_eq!(stats.files_changed, 0);
    assert_eq!(queue::drain(&ctx, "test-worker").await.unwrap(), 0);
    assert_eq!(cards::count(&ctx.pool).await.unwrap(), 2);
}

// ── Scenario: hybrid retrieve with reasons ──

#[tokio::test]
async fn retrieve_reports_fts_and_semantic_reasons() {
    let (_tmp, ctx) = setup().await;
    ingest_text(&ctx, "EchoGarden is a local-first knowledge garden.", None)
        .await
        .unwrap();

    let outcome = hybrid_retrieve(
        &ctx,
        &RetrieveRequest {
            query: "knowledge garden".to_string(),
            top_k: 5,
            filters: None,
            use_graph: true,
        },
        None,
    )
    .await
    .unwrap();

    assert!(!outcome.results.is_empty());
    let hit = &outcome.results[0];
    assert!(hit.reasons.contains(&"fts".to_string()), "reasons: {:?}", hit.reasons);
    assert!(
        hit.reasons.contains(&"semantic".to_string()),
        "reasons: {:?}",
        hit.reasons
    );
    assert!(hit.final_score >= 0.2, "score: {}", hit.final_score);

    // Every listed reason corresponds to a positive contribution.
    for reason in &hit.reasons {
        let value = match reason.as_str() {
            "fts" => hit.signals.fts,
            "semantic" => hit.signals.semantic,
            "graph" => hit.signals.graph,
            "recency" => hit.signals.recency,
            "source_boost" => hit.signals.source_boost,
            other => panic!("unknown reason {}", other),
        };
        assert!(value > 0.0, "reason {} has zero contribution", reason);
    }

    // The query landed in the search history.
    let history = search_log::recent(&ctx.pool, 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].query_text, "knowledge garden");
}

#[tokio::test]
async fn retrieve_is_deterministic() {
    let (_tmp, ctx) = setup().await;
    for text in [
        "Garden notes about tomatoes.",
        "Garden notes about roses.",
        "Garden notes about ferns.",
    ] {
        ingest_text(&ctx, text, None).await.unwrap();
    }

    let req = RetrieveRequest {
        query: "garden notes".to_string(),
        top_k: 3,
        filters: None,
        use_graph: true,
    };
    let first = hybrid_retrieve(&ctx, &req, None).await.unwrap();
    let second = hybrid_retrieve(&ctx, &req, None).await.unwrap();
    let ids = |o: &echo_garden::retrieve::RetrieveOutcome| {
        o.results.iter().map(|h| h.memory_id.clone()).collect::<Vec<_>>()
    };
    assert_eq!(ids(&first), ids(&second));
}

// ── Scenario: grounded chat, pass and abstain ──

#[tokio::test]
async fn chat_passes_with_citations_when_grounded() {
    let (_tmp, ctx) = setup().await;
    ingest_text(
        &ctx,
        "EchoGarden is a local-first personal knowledge system.",
        None,
    )
    .await
    .unwrap();

    let outcome = chat(
        &ctx,
        &ChatRequest {
            message: "What is EchoGarden?".to_string(),
            top_k: 5,
            use_graph: true,
            hops: 1,
            conversation_id: None,
        },
    )
    .await
    .unwrap();

    assert_eq!(outcome.verdict, "pass");
    assert!(!outcome.citations.is_empty());
    assert!(
        outcome.answer.contains('[') && outcome.answer.contains(']'),
        "answer lacks citation token: {}",
        outcome.answer
    );

    // Turn and citation rows were persisted.
    let turns = conversations::turns(&ctx.pool, &outcome.conversation_id)
        .await
        .unwrap();
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].verdict, "pass");
    let citation_rows = conversations::citations_for_turn(&ctx.pool, &outcome.turn_id)
        .await
        .unwrap();
    assert_eq!(citation_rows.len(), outcome.citations.len());
}

#[tokio::test]
async fn chat_abstains_on_empty_corpus() {
    let (_tmp, ctx) = setup().await;

    let outcome = chat(
        &ctx,
        &ChatRequest {
            message: "What is the capital of Mars?".to_string(),
            top_k: 5,
            use_graph: true,
            hops: 1,
            conversation_id: None,
        },
    )
    .await
    .unwrap();

    assert_eq!(outcome.verdict, "abstain");
    assert!(outcome.citations.is_empty());
    assert_eq!(outcome.answer, echo_garden::chat::ABSTAIN_ANSWER);
}

#[tokio::test]
async fn chat_turns_accumulate_in_one_conversation() {
    let (_tmp, ctx) = setup().await;
    ingest_text(&ctx, "Ferns prefer shade and moisture.", None)
        .await
        .unwrap();

    let first = chat(
        &ctx,
        &ChatRequest {
            message: "What do ferns prefer?".to_string(),
            top_k: 5,
            use_graph: true,
            hops: 1,
            conversation_id: None,
        },
    )
    .await
    .unwrap();
    let second = chat(
        &ctx,
        &ChatRequest {
            message: "And what about moisture?".to_string(),
            top_k: 5,
            use_graph: true,
            hops: 1,
            conversation_id: Some(first.conversation_id.clone()),
        },
    )
    .await
    .unwrap();

    assert_eq!(first.conversation_id, second.conversation_id);
    let turns = conversations::turns(&ctx.pool, &first.conversation_id)
        .await
        .unwrap();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].user_text, "What do ferns prefer?");
}

// ── Scenario: image ingest exec-trace shape ──

#[tokio::test]
async fn image_ingest_records_full_exec_graph() {
    let (tmp, ctx) = setup().await;
    let inbox = tmp.path().join("inbox");

    // Minimal PNG-ish bytes; the stub OCR never decodes them.
    let mut bytes = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    bytes.extend_from_slice(&[0u8; 64]);
    write_file(&inbox, "shot.png", &bytes);

    watcher::scan_once(&ctx).await.unwrap();
    queue::drain(&ctx, "test-worker").await.unwrap();

    let all = cards::recent(&ctx.pool, 10).await.unwrap();
    assert_eq!(all.len(), 1);
    let card = &all[0];
    assert_eq!(card.metadata["pipeline"], "ocr");
    let trace_id = card.trace_id.clone().unwrap();

    let trace = exec::get_trace(&ctx.pool, &trace_id).await.unwrap().unwrap();
    assert_eq!(trace.status, "ok");

    let nodes = exec::nodes_for_trace(&ctx.pool, &trace_id).await.unwrap();
    let find = |tool: &str| {
        nodes
            .iter()
            .find(|n| n.tool_name == tool)
            .unwrap_or_else(|| panic!("missing exec node for {}", tool))
    };
    for tool in [
        "ocr",
        "vision_embed",
        "summarizer",
        "extractor",
        "text_embed",
        "graph_builder",
    ] {
        assert_eq!(find(tool).state, "ok", "node {} not ok", tool);
    }

    // Both parallel branches feed summarizer through on_ok edges, and every
    // edge respects causal order.
    let edges = exec::edges_for_trace(&ctx.pool, &trace_id).await.unwrap();
    let summarizer_id = &find("summarizer").exec_node_id;
    for parse_tool in ["ocr", "vision_embed"] {
        let from_id = &find(parse_tool).exec_node_id;
        assert!(
            edges.iter().any(|e| &e.from_exec_node_id == from_id
                && &e.to_exec_node_id == summarizer_id
                && e.condition == "on_ok"),
            "missing on_ok edge {} -> summarizer",
            parse_tool
        );
    }
    let node_by_id = |id: &str| nodes.iter().find(|n| n.exec_node_id == id).unwrap();
    for edge in &edges {
        let from = node_by_id(&edge.from_exec_node_id);
        let to = node_by_id(&edge.to_exec_node_id);
        assert!(from.finished_ts.unwrap() <= to.started_ts + 1);
    }

    // Both modalities were embedded and attached.
    let vision_hits = echo_garden::vector::search(
        &ctx.pool,
        "vision",
        &{
            let mut v = vec![0.0f32; 256];
            v[0] = 1.0;
            v
        },
        10,
    )
    .await
    .unwrap();
    assert!(!vision_hits.is_empty());
}

// ── Scenario: oversize and unknown files become placeholders ──

#[tokio::test]
async fn unknown_format_gets_placeholder_card() {
    let (tmp, ctx) = setup().await;
    let inbox = tmp.path().join("inbox");
    write_file(&inbox, "blob.bin", &[0xDE, 0xAD, 0xBE, 0xEF]);

    watcher::scan_once(&ctx).await.unwrap();
    queue::drain(&ctx, "test-worker").await.unwrap();

    let all = cards::recent(&ctx.pool, 10).await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].card_type, "placeholder");
    assert_eq!(all[0].metadata["pipeline"], "placeholder");
    assert!(all[0].metadata["error"].is_string());
}

// ── Scenario: job replay does not duplicate cards ──

#[tokio::test]
async fn replayed_ingest_is_idempotent() {
    let (tmp, ctx) = setup().await;
    let inbox = tmp.path().join("inbox");
    write_file(&inbox, "note.md", b"Replay me twice.");

    watcher::scan_once(&ctx).await.unwrap();
    let pending = jobs::list(&ctx.pool, Some("queued"), 10).await.unwrap();
    assert_eq!(pending.len(), 1);
    let payload: echo_garden::models::IngestPayload =
        serde_json::from_value(pending[0].payload.clone()).unwrap();

    queue::drain(&ctx, "test-worker").await.unwrap();
    assert_eq!(cards::count(&ctx.pool).await.unwrap(), 1);

    // At-least-once delivery: the same payload and trace replayed directly.
    let outcome = echo_garden::orchestrator::ingest_blob(&ctx, &payload, &payload.trace_id)
        .await
        .unwrap();
    assert_eq!(outcome.status, "idempotent_skip");
    assert_eq!(cards::count(&ctx.pool).await.unwrap(), 1);
}

// ── Scenario: card deletion cascades and entity GC ──

#[tokio::test]
async fn deleting_a_card_cascades_and_sweeps_entities() {
    let (_tmp, ctx) = setup().await;
    let first = ingest_text(&ctx, "Met Ada Lovelace about engines.", None)
        .await
        .unwrap()
        .memory_id
        .unwrap();
    let second = ingest_text(&ctx, "Saw Ada Lovelace again at tea.", None)
        .await
        .unwrap()
        .memory_id
        .unwrap();

    assert!(cards::delete(&ctx.pool, &first).await.unwrap());

    // Card, FTS entry, embeddings, vector points, and mem node are gone.
    assert!(cards::get(&ctx.pool, &first).await.unwrap().is_none());
    assert!(cards::fts_search(&ctx.pool, "engines", 10)
        .await
        .unwrap()
        .is_empty());
    assert!(graph::get_node(&ctx.pool, &format!("mem:{}", first))
        .await
        .unwrap()
        .is_none());
    let query_vec = echo_garden::tools::embed_text_vector("Met Ada Lovelace about engines.");
    assert!(echo_garden::vector::search(&ctx.pool, "text", &query_vec, 10)
        .await
        .unwrap()
        .iter()
        .all(|(id, _)| id != &first));

    // The entity is still mentioned by the second card, so it survives.
    assert!(graph::get_node(&ctx.pool, "ent:ada-lovelace")
        .await
        .unwrap()
        .is_some());

    // Deleting the last mention sweeps the orphaned entity.
    assert!(cards::delete(&ctx.pool, &second).await.unwrap());
    assert!(graph::get_node(&ctx.pool, "ent:ada-lovelace")
        .await
        .unwrap()
        .is_none());

    // A repeat delete reports the miss.
    assert!(!cards::delete(&ctx.pool, &first).await.unwrap());
}

// ── Scenario: graph round trip through ingestion ──

#[tokio::test]
async fn ingested_entities_reach_the_graph() {
    let (_tmp, ctx) = setup().await;
    let outcome = ingest_text(
        &ctx,
        "Met Ada Lovelace to discuss the Analytical Engine design.",
        None,
    )
    .await
    .unwrap();
    let memory_id = outcome.memory_id.unwrap();

    let mem_node = graph::get_node(&ctx.pool, &format!("mem:{}", memory_id))
        .await
        .unwrap();
    assert!(mem_node.is_some());

    let ada = graph::get_node(&ctx.pool, "ent:ada-lovelace").await.unwrap();
    assert!(ada.is_some(), "entity node missing");

    let subgraph = graph::neighbors(&ctx.pool, "ent:ada-lovelace", "both", 10)
        .await
        .unwrap();
    assert!(subgraph
        .nodes
        .iter()
        .any(|n| n.node_id == format!("mem:{}", memory_id)));
    assert!(subgraph.edges.iter().all(|e| e.edge_type == "MENTIONS"));
}
