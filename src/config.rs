use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub server: ServerConfig,
    pub watch: WatchConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7877".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatchConfig {
    /// Absolute path scanned by the watcher.
    pub root: PathBuf,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_s: u64,
    /// Files above this size still get a blob and a placeholder card,
    /// but are never parsed for content.
    #[serde(default = "default_max_file_mb")]
    pub max_file_mb: u64,
    /// Extra exclusion globs on top of the built-in ignore set.
    #[serde(default)]
    pub ignore_globs: Vec<String>,
}

fn default_poll_interval() -> u64 {
    2
}
fn default_max_file_mb() -> u64 {
    20
}

impl WatchConfig {
    pub fn max_file_bytes(&self) -> i64 {
        (self.max_file_mb as i64) * 1024 * 1024
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_job_attempts")]
    pub max_job_attempts: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_job_attempts: default_max_job_attempts(),
        }
    }
}

fn default_workers() -> usize {
    2
}
fn default_max_job_attempts() -> i64 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Per-signal fusion weights. Must sum to something sensible; each in [0,1].
    #[serde(default = "default_w_semantic")]
    pub w_semantic: f64,
    #[serde(default = "default_w_fts")]
    pub w_fts: f64,
    #[serde(default = "default_w_graph")]
    pub w_graph: f64,
    #[serde(default = "default_w_recency")]
    pub w_recency: f64,
    /// Recency decay constant in days: score = exp(-age_days / tau).
    #[serde(default = "default_recency_tau")]
    pub recency_tau_days: f64,
    #[serde(default = "default_boost_highlight")]
    pub boost_browser_highlight: f64,
    #[serde(default = "default_boost_document")]
    pub boost_document: f64,
    /// Per-signal candidate pool size.
    #[serde(default = "default_candidate_k")]
    pub candidate_k: i64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            w_semantic: default_w_semantic(),
            w_fts: default_w_fts(),
            w_graph: default_w_graph(),
            w_recency: default_w_recency(),
            recency_tau_days: default_recency_tau(),
            boost_browser_highlight: default_boost_highlight(),
            boost_document: default_boost_document(),
            candidate_k: default_candidate_k(),
        }
    }
}

fn default_top_k() -> usize {
    8
}
fn default_w_semantic() -> f64 {
    0.40
}
fn default_w_fts() -> f64 {
    0.20
}
fn default_w_graph() -> f64 {
    0.20
}
fn default_w_recency() -> f64 {
    0.20
}
fn default_recency_tau() -> f64 {
    14.0
}
fn default_boost_highlight() -> f64 {
    0.05
}
fn default_boost_document() -> f64 {
    0.03
}
fn default_candidate_k() -> i64 {
    80
}

#[derive(Debug, Deserialize, Clone)]
pub struct ToolsConfig {
    /// `local` wires a real speech-to-text engine; `stub` is deterministic.
    #[serde(default = "default_mode")]
    pub whisper_mode: String,
    /// `local` wires a real vision encoder; `stub` is deterministic.
    #[serde(default = "default_mode")]
    pub vision_mode: String,
    #[serde(default = "default_summary_max_chars")]
    pub summary_max_chars: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            whisper_mode: default_mode(),
            vision_mode: default_mode(),
            summary_max_chars: default_summary_max_chars(),
        }
    }
}

fn default_mode() -> String {
    "stub".to_string()
}
fn default_summary_max_chars() -> usize {
    400
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LlmConfig {
    /// Base URL of an Ollama-compatible endpoint. Absent means stub mode.
    pub url: Option<String>,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_llm_timeout")]
    pub timeout_s: u64,
}

fn default_llm_model() -> String {
    "llama3.2".to_string()
}
fn default_llm_timeout() -> u64 {
    30
}

impl LlmConfig {
    pub fn is_configured(&self) -> bool {
        self.url.is_some()
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CaptureConfig {
    /// Required value of the X-EG-KEY header on browser-capture endpoints.
    pub api_key: Option<String>,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.watch.poll_interval_s == 0 {
        anyhow::bail!("watch.poll_interval_s must be > 0");
    }
    if config.queue.workers == 0 {
        anyhow::bail!("queue.workers must be >= 1");
    }
    if config.queue.max_job_attempts < 1 {
        anyhow::bail!("queue.max_job_attempts must be >= 1");
    }
    if config.retrieval.top_k == 0 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }

    for (name, w) in [
        ("w_semantic", config.retrieval.w_semantic),
        ("w_fts", config.retrieval.w_fts),
        ("w_graph", config.retrieval.w_graph),
        ("w_recency", config.retrieval.w_recency),
    ] {
        if !(0.0..=1.0).contains(&w) {
            anyhow::bail!("retrieval.{} must be in [0.0, 1.0]", name);
        }
    }
    if config.retrieval.recency_tau_days <= 0.0 {
        anyhow::bail!("retrieval.recency_tau_days must be > 0");
    }

    match config.tools.whisper_mode.as_str() {
        "local" | "stub" => {}
        other => anyhow::bail!("Unknown whisper_mode: '{}'. Must be local or stub.", other),
    }
    match config.tools.vision_mode.as_str() {
        "local" | "stub" => {}
        other => anyhow::bail!("Unknown vision_mode: '{}'. Must be local or stub.", other),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml(dir: &Path) -> String {
        format!(
            r#"[db]
path = "{}/eg.sqlite"

[watch]
root = "{}/inbox"
"#,
            dir.display(),
            dir.display()
        )
    }

    #[test]
    fn defaults_fill_in() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg_path = tmp.path().join("eg.toml");
        std::fs::write(&cfg_path, minimal_toml(tmp.path())).unwrap();

        let cfg = load_config(&cfg_path).unwrap();
        assert_eq!(cfg.watch.poll_interval_s, 2);
        assert_eq!(cfg.watch.max_file_mb, 20);
        assert_eq!(cfg.queue.workers, 2);
        assert_eq!(cfg.queue.max_job_attempts, 5);
        assert_eq!(cfg.retrieval.top_k, 8);
        assert!((cfg.retrieval.w_semantic - 0.40).abs() < 1e-9);
        assert!((cfg.retrieval.w_fts - 0.20).abs() < 1e-9);
        assert_eq!(cfg.tools.whisper_mode, "stub");
        assert!(!cfg.llm.is_configured());
    }

    #[test]
    fn rejects_bad_weight() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg_path = tmp.path().join("eg.toml");
        let mut body = minimal_toml(tmp.path());
        body.push_str("\n[retrieval]\nw_semantic = 1.5\n");
        std::fs::write(&cfg_path, body).unwrap();

        assert!(load_config(&cfg_path).is_err());
    }

    #[test]
    fn rejects_unknown_mode() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg_path = tmp.path().join("eg.toml");
        let mut body = minimal_toml(tmp.path());
        body.push_str("\n[tools]\nwhisper_mode = \"cloud\"\n");
        std::fs::write(&cfg_path, body).unwrap();

        assert!(load_config(&cfg_path).is_err());
    }
}
