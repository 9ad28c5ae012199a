//! Polling file watcher.
//!
//! A single loop scans the watch root every `poll_interval_s`, skipping
//! hidden entries and the built-in ignore set. Unchanged files — same
//! `(mtime_ns, size_bytes)` as the recorded [`FileState`](crate::models::FileState) —
//! are skipped without re-hashing. Changed files are streamed through
//! SHA-256, recorded as source + blob, and enqueued as an `ingest_blob` job
//! carrying a freshly minted trace id.
//!
//! The loop is re-entrant-safe by construction: the next tick is not armed
//! until the current scan finishes.

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::db::{new_id, now_ts};
use crate::models::IngestPayload;
use crate::store::{blobs, jobs};
use crate::tools::ToolContext;

/// Directory names that are never descended into.
const IGNORED_DIRS: &[&str] = &[
    "node_modules",
    ".git",
    ".svn",
    "__pycache__",
    "target",
    ".DS_Store",
    ".cache",
];

const HASH_CHUNK: usize = 64 * 1024;

/// Shared watcher counters surfaced by `/capture/status`.
#[derive(Default)]
pub struct WatcherStatus {
    pub scan_count: AtomicU64,
    pub last_scan_ts: AtomicI64,
    pub files_seen: AtomicU64,
    pub jobs_enqueued: AtomicU64,
}

/// Result of one scan pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScanStats {
    pub files_seen: u64,
    pub files_changed: u64,
    pub jobs_enqueued: u64,
}

/// Streaming SHA-256 of a file, 64 KiB chunks, no full-file buffering.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// MIME type from the file extension; `application/octet-stream` otherwise.
pub fn detect_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "txt" | "log" => "text/plain",
        "md" => "text/markdown",
        "html" | "htm" => "text/html",
        "csv" => "text/csv",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "tiff" | "tif" => "image/tiff",
        "svg" => "image/svg+xml",
        "wav" => "audio/wav",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "ogg" => "audio/ogg",
        "flac" => "audio/flac",
        _ => "application/octet-stream",
    }
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

fn build_ignore_set(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

fn mtime_ns(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|m| m.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_nanos().min(i64::MAX as u128) as i64)
        .unwrap_or(0)
}

/// One full scan of the watch root.
pub async fn scan_once(ctx: &ToolContext) -> Result<ScanStats> {
    let root = ctx.config.watch.root.clone();
    if !root.is_dir() {
        warn!(root = %root.display(), "watch root does not exist");
        return Ok(ScanStats::default());
    }
    let ignore_set = build_ignore_set(&ctx.config.watch.ignore_globs)?;

    let mut stats = ScanStats::default();
    let walker = WalkDir::new(&root).into_iter().filter_entry(|entry| {
        let name = entry.file_name().to_string_lossy();
        if entry.file_type().is_dir() {
            !is_hidden(&name) && !IGNORED_DIRS.contains(&name.as_ref())
        } else {
            !is_hidden(&name)
        }
    });

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(err) => {
                warn!(error = %err, "walk error");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path.strip_prefix(&root).unwrap_or(path);
        if ignore_set.is_match(relative) {
            continue;
        }

        stats.files_seen += 1;
        match process_file(ctx, path).await {
            Ok(true) => {
                stats.files_changed += 1;
                stats.jobs_enqueued += 1;
            }
            Ok(false) => {}
            Err(err) => warn!(path = %path.display(), error = %err, "error processing file"),
        }
    }

    Ok(stats)
}

/// Check one file against its recorded state; hash, record, and enqueue when
/// new or changed. Returns whether a job was enqueued.
async fn process_file(ctx: &ToolContext, path: &Path) -> Result<bool> {
    let metadata = std::fs::metadata(path)?;
    let mtime = mtime_ns(&metadata);
    let size_bytes = metadata.len() as i64;
    let path_str = path.to_string_lossy().to_string();

    if let Some(state) = blobs::get_file_state(&ctx.pool, &path_str).await? {
        if state.mtime_ns == mtime && state.size_bytes == size_bytes {
            return Ok(false);
        }
        info!(path = %path_str, "modified file detected");
    } else {
        info!(path = %path_str, size_bytes, "new file detected");
    }

    // Hash off the async executor; files can be large.
    let hash_path = path.to_path_buf();
    let sha256 = tokio::task::spawn_blocking(move || sha256_file(&hash_path)).await??;

    blobs::upsert_file_state(&ctx.pool, &path_str, mtime, size_bytes, &sha256).await?;
    let source_id = blobs::upsert_source(&ctx.pool, &path_str, "filesystem").await?;
    let mime = detect_mime(path);
    let blob_id =
        blobs::upsert_blob(&ctx.pool, &sha256, &path_str, mime, size_bytes, &source_id).await?;

    let payload = IngestPayload {
        blob_id: blob_id.clone(),
        source_id,
        path: path_str.clone(),
        sha256: sha256.clone(),
        mime: mime.to_string(),
        size_bytes,
        trace_id: new_id(),
    };
    let job_id = jobs::enqueue(
        &ctx.pool,
        "ingest_blob",
        &serde_json::to_value(&payload)?,
    )
    .await?;
    info!(
        path = %path_str,
        blob_id = %&blob_id[..12.min(blob_id.len())],
        job_id = %&job_id[..12.min(job_id.len())],
        sha256 = %&sha256[..12],
        "enqueued ingest job"
    );
    Ok(true)
}

/// Run forever: scan, update counters, sleep, repeat. A slow scan never
/// overlaps the next one.
pub async fn watch_loop(ctx: ToolContext, status: std::sync::Arc<WatcherStatus>) {
    let interval = Duration::from_secs(ctx.config.watch.poll_interval_s);
    info!(
        root = %ctx.config.watch.root.display(),
        interval_s = ctx.config.watch.poll_interval_s,
        "watcher started"
    );
    loop {
        match scan_once(&ctx).await {
            Ok(stats) => {
                status.scan_count.fetch_add(1, Ordering::Relaxed);
                status.last_scan_ts.store(now_ts(), Ordering::Relaxed);
                status.files_seen.store(stats.files_seen, Ordering::Relaxed);
                status
                    .jobs_enqueued
                    .fetch_add(stats.jobs_enqueued, Ordering::Relaxed);
                if stats.files_changed > 0 {
                    info!(
                        files_seen = stats.files_seen,
                        files_changed = stats.files_changed,
                        "scan complete"
                    );
                }
            }
            Err(err) => warn!(error = %err, "watcher scan error"),
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_detection_covers_pipelines() {
        assert_eq!(detect_mime(Path::new("a.md")), "text/markdown");
        assert_eq!(detect_mime(Path::new("a.png")), "image/png");
        assert_eq!(detect_mime(Path::new("a.wav")), "audio/wav");
        assert_eq!(detect_mime(Path::new("a.xyz")), "application/octet-stream");
    }

    #[test]
    fn streaming_hash_matches_known_digest() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("x.txt");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
