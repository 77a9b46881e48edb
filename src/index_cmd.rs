//! Indexing pipeline orchestration.
//!
//! Drives the full flow: resolve configs → probe embedding dimensionality
//! per content type → ensure both collections and their `content_type`
//! keyword index → scan → classify + chunk per file → embed per bucket →
//! upsert into the matching collection → emit one JSON report.
//!
//! Chunking failures are tolerated per file (counted, pipeline continues);
//! embedding and upsert failures are fatal. A file-coverage gate guards
//! against silently indexing a sliver of the repository: when
//! `files_indexed / files_scanned` falls below `min_file_coverage` the run
//! reports `insufficient_coverage` and the CLI exits non-zero.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::json;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::chunk::{chunk_file, make_point_id, Chunk};
use crate::classify::{classify_content, ContentType};
use crate::config::{
    load_chunk_config, load_runtime_config, load_scan_config, ScanOverrides,
};
use crate::embedding::{create_embedder, Embedder};
use crate::qdrant::{
    load_qdrant_config, EnsureOutcome, QdrantStore, SplitCollections, VectorPoint,
};
use crate::scan::scan_repo;

/// Payload field carrying the content-type bucket; keyword-indexed so
/// filtered search stays cheap.
pub const CONTENT_TYPE_FIELD: &str = "content_type";

/// Identifies points written by this tool in mixed collections.
const POINT_SOURCE: &str = "codescout";

#[derive(Debug, Clone, Default, Serialize)]
pub struct TypeCounts {
    pub code: usize,
    pub docs: usize,
}

impl TypeCounts {
    fn add(&mut self, content_type: ContentType, amount: usize) {
        match content_type {
            ContentType::Code => self.code += amount,
            ContentType::Docs => self.docs += amount,
        }
    }
}

/// The single JSON report emitted by `scout index`.
#[derive(Debug, Clone, Serialize)]
pub struct IndexReport {
    pub status: String,
    pub files_scanned: usize,
    pub files_indexed: usize,
    pub files_failed: usize,
    pub file_coverage: f64,
    pub chunks_total: usize,
    pub chunks_by_type: TypeCounts,
    pub embeddings_generated: usize,
    pub points_upserted: usize,
    pub upsert_by_type: TypeCounts,
    pub collections: SplitCollections,
    pub elapsed_ms: u64,
}

/// Report emitted by `scout init`.
#[derive(Debug, Clone, Serialize)]
pub struct InitReport {
    pub collections: SplitCollections,
    pub code: EnsureOutcome,
    pub docs: EnsureOutcome,
    pub payload_index_field: &'static str,
    /// Whether both collections report the keyword index in their payload
    /// schema after creation.
    pub payload_index_ready: bool,
}

#[derive(Debug, Clone, Default)]
pub struct IndexOptions {
    pub scan: ScanOverrides,
    pub chunk_lines: Option<String>,
    pub overlap_lines: Option<String>,
    pub max_files: Option<usize>,
}

/// Coverage is 1.0 by definition when nothing was scanned.
fn file_coverage(files_scanned: usize, files_indexed: usize) -> f64 {
    if files_scanned == 0 {
        1.0
    } else {
        files_indexed as f64 / files_scanned as f64
    }
}

/// Materialize one chunk as a vector store point with the standard payload.
fn build_point(
    chunk: &Chunk,
    vector: Vec<f32>,
    content_type: ContentType,
    repo: &str,
    repo_root: &str,
    mtime: i64,
    size_bytes: u64,
) -> VectorPoint {
    let ext = Path::new(&chunk.path)
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy().to_lowercase()))
        .unwrap_or_default();

    VectorPoint {
        id: make_point_id(&chunk.path, chunk.chunk_index, &chunk.content_hash),
        vector,
        payload: json!({
            "repo": repo,
            "path": chunk.path,
            "chunk_index": chunk.chunk_index,
            "content_hash": chunk.content_hash,
            "ext": ext,
            "mtime": mtime,
            "size_bytes": size_bytes,
            "text_len": chunk.content.chars().count(),
            "start_line": chunk.start_line,
            "end_line": chunk.end_line,
            "language": chunk.language,
            "content_type": content_type.as_str(),
            "source": POINT_SOURCE,
            "repo_root": repo_root,
            "text": chunk.content,
        }),
    }
}

struct PendingChunk {
    chunk: Chunk,
    mtime: i64,
    size_bytes: u64,
}

async fn ensure_split_collections<E>(
    env: &E,
) -> Result<(QdrantStore, SplitCollections, usize, usize, EnsureOutcome, EnsureOutcome)>
where
    E: Fn(&str) -> Option<String>,
{
    let code_embedder = create_embedder(Some(ContentType::Code), |k| env(k))?;
    let docs_embedder = create_embedder(Some(ContentType::Docs), |k| env(k))?;

    let dim_code = code_embedder
        .probe_vector_size()
        .await
        .context("probing code embedding size")?;
    let dim_docs = docs_embedder
        .probe_vector_size()
        .await
        .context("probing docs embedding size")?;

    let store = QdrantStore::new(load_qdrant_config(|k| env(k))?)?;
    let collections = store.resolve_split_collection_names(dim_code, code_embedder.model_name());

    let code_outcome = store.ensure_collection(&collections.code, dim_code).await?;
    store
        .ensure_payload_keyword_index(&collections.code, CONTENT_TYPE_FIELD)
        .await?;
    let docs_outcome = store.ensure_collection(&collections.docs, dim_docs).await?;
    store
        .ensure_payload_keyword_index(&collections.docs, CONTENT_TYPE_FIELD)
        .await?;

    Ok((store, collections, dim_code, dim_docs, code_outcome, docs_outcome))
}

/// Probe the embedders and prepare both collections; the `init` subcommand.
pub async fn run_init<E>(env: &E) -> Result<InitReport>
where
    E: Fn(&str) -> Option<String>,
{
    let (store, collections, _, _, code, docs) = ensure_split_collections(env).await?;

    let payload_index_ready = store
        .has_payload_field(&collections.code, CONTENT_TYPE_FIELD)
        .await?
        && store
            .has_payload_field(&collections.docs, CONTENT_TYPE_FIELD)
            .await?;

    Ok(InitReport {
        collections,
        code,
        docs,
        payload_index_field: CONTENT_TYPE_FIELD,
        payload_index_ready,
    })
}

/// Run the full indexing pipeline; the `index` subcommand.
pub async fn run_index<E>(options: &IndexOptions, env: &E) -> Result<IndexReport>
where
    E: Fn(&str) -> Option<String>,
{
    let started = Instant::now();

    let scan_config = load_scan_config(&options.scan, |k| env(k));
    let chunk_config = load_chunk_config(
        options.scan.repo_root.as_deref(),
        options.chunk_lines.as_deref(),
        options.overlap_lines.as_deref(),
        |k| env(k),
    )?;
    let runtime_config = load_runtime_config(|k| env(k));

    anyhow::ensure!(
        scan_config.repo_root.is_dir(),
        "repo root does not exist or is not a directory: {}",
        scan_config.repo_root.display()
    );

    let (store, collections, dim_code, dim_docs, _, _) = ensure_split_collections(env).await?;

    let (files, scan_stats) = scan_repo(&scan_config, options.max_files)?;
    info!(
        files = files.len(),
        ignored_binary = scan_stats.files_ignored_binary,
        "scan complete"
    );

    let repo_root = &scan_config.repo_root;
    let repo_name = repo_root
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| repo_root.display().to_string());
    let repo_root_str = repo_root.display().to_string();

    let mut code_chunks: Vec<PendingChunk> = Vec::new();
    let mut docs_chunks: Vec<PendingChunk> = Vec::new();
    let mut files_indexed = 0usize;
    let mut files_failed = 0usize;
    let mut chunks_by_type = TypeCounts::default();

    for relative in &files {
        let absolute = repo_root.join(relative);
        let (content_type, path_hint) = classify_content(relative, &runtime_config);
        if content_type == ContentType::Docs {
            let ext = Path::new(relative)
                .extension()
                .map(|ext| format!(".{}", ext.to_string_lossy().to_lowercase()))
                .unwrap_or_default();
            debug!(
                file = %relative,
                ext = %ext,
                path_hint = ?path_hint,
                classified_as = "docs",
                "content classified"
            );
        }

        let chunked = match chunk_file(
            &absolute,
            repo_root,
            chunk_config.chunk_lines,
            chunk_config.overlap_lines,
            true,
        ) {
            Ok(chunked) => chunked,
            Err(err) => {
                warn!(file = %relative, error = %err, "chunking failed, skipping file");
                files_failed += 1;
                continue;
            }
        };

        let metadata = std::fs::metadata(&absolute).ok();
        let mtime = metadata
            .as_ref()
            .and_then(|m| m.modified().ok())
            .and_then(|m| m.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let size_bytes = metadata.map(|m| m.len()).unwrap_or(0);

        files_indexed += 1;
        chunks_by_type.add(content_type, chunked.chunks.len());
        let bucket = match content_type {
            ContentType::Code => &mut code_chunks,
            ContentType::Docs => &mut docs_chunks,
        };
        for chunk in chunked.chunks {
            bucket.push(PendingChunk {
                chunk,
                mtime,
                size_bytes,
            });
        }
    }

    let coverage = file_coverage(files.len(), files_indexed);
    let chunks_total = code_chunks.len() + docs_chunks.len();

    let mut report = IndexReport {
        status: "success".to_string(),
        files_scanned: files.len(),
        files_indexed,
        files_failed,
        file_coverage: coverage,
        chunks_total,
        chunks_by_type,
        embeddings_generated: 0,
        points_upserted: 0,
        upsert_by_type: TypeCounts::default(),
        collections,
        elapsed_ms: 0,
    };

    if coverage < runtime_config.min_file_coverage {
        warn!(
            coverage,
            minimum = runtime_config.min_file_coverage,
            "file coverage below threshold"
        );
        report.status = "insufficient_coverage".to_string();
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        return Ok(report);
    }

    if chunks_total == 0 {
        report.status = "empty".to_string();
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        return Ok(report);
    }

    let mut code_bucket = Some((ContentType::Code, code_chunks, dim_code));
    let mut docs_bucket = Some((ContentType::Docs, docs_chunks, dim_docs));
    let ordered = [
        runtime_config.content_types.0.clone(),
        runtime_config.content_types.1.clone(),
    ];

    for bucket_name in ordered {
        let taken = match bucket_name.as_str() {
            "docs" => docs_bucket.take(),
            _ => code_bucket.take(),
        };
        let Some((content_type, pending, dim)) = taken else {
            continue;
        };
        if pending.is_empty() {
            continue;
        }

        let embedder = create_embedder(Some(content_type), |k| env(k))?;
        let texts: Vec<String> = pending.iter().map(|p| p.chunk.content.clone()).collect();
        let vectors = embedder
            .embed_texts_batched(&texts, Some(dim))
            .await
            .with_context(|| format!("embedding {} chunks", content_type))?;
        report.embeddings_generated += vectors.len();

        let points: Vec<VectorPoint> = pending
            .iter()
            .zip(vectors)
            .map(|(p, vector)| {
                build_point(
                    &p.chunk,
                    vector,
                    content_type,
                    &repo_name,
                    &repo_root_str,
                    p.mtime,
                    p.size_bytes,
                )
            })
            .collect();

        let collection = match content_type {
            ContentType::Code => &report.collections.code,
            ContentType::Docs => &report.collections.docs,
        };
        let stats = store.upsert(&points, collection).await?;
        report.points_upserted += stats.points_upserted;
        report.upsert_by_type.add(content_type, stats.points_upserted);
    }

    report.elapsed_ms = started.elapsed().as_millis() as u64;
    Ok(report)
}
