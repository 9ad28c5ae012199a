//! # EchoGarden
//!
//! **A local-first personal knowledge garden.**
//!
//! Drop files into a watched directory or push captures from a browser; the
//! system parses, transcribes, OCRs, summarizes, embeds, and links each
//! artifact into a **memory card**, then serves grounded search and
//! question-answering over the corpus.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────┐   ┌────────┐   ┌──────────────┐   ┌──────────┐
//! │ Watcher  │──▶│ Queue │──▶│ Worker │──▶│ Orchestrator │──▶│  SQLite   │
//! │ (poll)   │   │(lease)│   │  (xN)  │   │  (exec DAG)  │   │ FTS5+Vec │
//! └──────────┘   └───────┘   └────────┘   └──────┬───────┘   └────┬─────┘
//!                                                │                │
//!                                         ┌──────▼──────┐   ┌─────▼─────┐
//!                                         │Tool Registry│   │   HTTP    │
//!                                         │ (dispatch)  │   │  (axum)   │
//!                                         └─────────────┘   └───────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. The **watcher** ([`watcher`]) polls the watch root, hashes new or
//!    changed files (SHA-256), records [`models::Source`] /
//!    [`models::Blob`] / [`models::FileState`] rows, and enqueues
//!    `ingest_blob` jobs.
//! 2. **Workers** ([`queue`]) lease jobs at-least-once and hand them to the
//!    **orchestrator** ([`orchestrator`]), which routes each blob to a
//!    pipeline (document / image / audio), dispatches every step through
//!    the **tool registry** ([`tools`]), and materializes the run as an
//!    execution DAG.
//! 3. Committed cards are indexed in **FTS5**, embedded into the **vector
//!    index** ([`vector`]), and linked into the **property graph**
//!    ([`graph`]).
//! 4. The **hybrid retriever** ([`retrieve`]) fuses FTS, vectors, graph
//!    neighborhood, and recency into ranked, explained hits.
//! 5. **Chat** ([`chat`]) grounds answers: retrieve → weave → verify, with
//!    citations and a `pass` / `revise` / `abstain` verdict.
//! 6. Everything is exposed over the **HTTP surface** ([`server`]) and the
//!    `eg` CLI.

pub mod chat;
pub mod config;
pub mod db;
pub mod digest;
pub mod graph;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod orchestrator;
pub mod queue;
pub mod retrieve;
pub mod server;
pub mod store;
pub mod tools;
pub mod vector;
pub mod watcher;
