//! Line-window chunker.
//!
//! Decodes a source file to text and emits overlapping line windows with
//! deterministic identities. Two identifiers are derived per chunk:
//!
//! - `chunk_id` — SHA-256 of `"{path}:{start}:{end}:{content_hash}"`,
//!   identifying a chunk within one file version.
//! - `point_id` — a namespace UUID (v5) of
//!   `"{path}|{chunk_index}|{content_hash}"`, used as the vector store
//!   record id. Stable across runs iff the file content is unchanged.
//!
//! Text decoding tries UTF-8 strict, then UTF-8 with BOM (stripping it),
//! then Latin-1 byte-to-char, which cannot fail. Lines are split without
//! their terminators; chunk content is the newline-join of the raw window.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("chunk_lines must be greater than 0")]
    ZeroChunkLines,
    #[error("overlap must be smaller than chunk_lines ({overlap} >= {chunk_lines})")]
    OverlapTooLarge { overlap: usize, chunk_lines: usize },
    #[error("invalid or missing file: {0}")]
    InvalidFile(PathBuf),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One emitted line window. Line numbers are 1-based inclusive.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub chunk_id: String,
    pub content_hash: String,
    pub path: String,
    pub chunk_index: usize,
    pub start_line: usize,
    pub end_line: usize,
    pub language: String,
    pub content: String,
}

/// The chunking result for one file.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkedFile {
    pub path: String,
    pub path_is_relative: bool,
    pub total_lines: usize,
    pub encoding: &'static str,
    pub chunks: Vec<Chunk>,
    pub warnings: Vec<String>,
}

/// Decode file bytes to text: UTF-8 strict → UTF-8 with BOM → Latin-1.
///
/// Returns the text and the encoding label that produced it. The Latin-1
/// fallback maps every byte to the corresponding code point, so decoding
/// never fails once the file is readable.
pub fn read_text(path: &Path) -> Result<(String, &'static str), ChunkError> {
    let bytes = std::fs::read(path).map_err(|source| ChunkError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    if let Ok(text) = std::str::from_utf8(&bytes) {
        if let Some(stripped) = text.strip_prefix('\u{feff}') {
            return Ok((stripped.to_string(), "utf-8-sig"));
        }
        return Ok((text.to_string(), "utf-8"));
    }

    let text: String = bytes.iter().map(|&b| b as char).collect();
    Ok((text, "latin-1"))
}

fn validate_window(chunk_lines: usize, overlap: usize) -> Result<(), ChunkError> {
    if chunk_lines == 0 {
        return Err(ChunkError::ZeroChunkLines);
    }
    if overlap >= chunk_lines {
        return Err(ChunkError::OverlapTooLarge {
            overlap,
            chunk_lines,
        });
    }
    Ok(())
}

/// Emit `(start_line, end_line, window)` triples over `lines`.
///
/// The window advances by `chunk_lines - overlap` and stops after the first
/// window that reaches the last line, so every line is covered and the last
/// window ends exactly at `lines.len()`.
pub fn window_lines<'a>(
    lines: &'a [&'a str],
    chunk_lines: usize,
    overlap: usize,
) -> Result<Vec<(usize, usize, &'a [&'a str])>, ChunkError> {
    validate_window(chunk_lines, overlap)?;

    if lines.is_empty() {
        return Ok(Vec::new());
    }

    let step = chunk_lines - overlap;
    let mut windows = Vec::new();
    let mut start = 0usize;

    loop {
        let end = (start + chunk_lines).min(lines.len());
        windows.push((start + 1, end, &lines[start..end]));
        if end >= lines.len() {
            break;
        }
        start += step;
    }

    Ok(windows)
}

/// SHA-256 hex digest of the full decoded file text.
pub fn hash_content(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Chunk id within one file version: SHA-256 of path, line range, and
/// content hash, joined with `:`.
pub fn make_chunk_id(path: &str, start: usize, end: usize, content_hash: &str) -> String {
    let composed = format!("{path}:{start}:{end}:{content_hash}");
    let mut hasher = Sha256::new();
    hasher.update(composed.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Deterministic vector-store point id: a v5 UUID in the URL namespace over
/// `"{relative_path}|{chunk_index}|{content_hash}"`.
pub fn make_point_id(relative_path: &str, chunk_index: usize, content_hash: &str) -> String {
    let composed = format!("{relative_path}|{chunk_index}|{content_hash}");
    Uuid::new_v5(&Uuid::NAMESPACE_URL, composed.as_bytes()).to_string()
}

/// Language label by file suffix; anything unknown is `text`.
pub fn detect_language(path: &Path) -> &'static str {
    let suffix = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    match suffix.as_str() {
        "ts" => "typescript",
        "tsx" => "typescriptreact",
        "js" => "javascript",
        "jsx" => "javascriptreact",
        "py" => "python",
        "rs" => "rust",
        "go" => "go",
        "md" => "markdown",
        "json" => "json",
        "yaml" | "yml" => "yaml",
        "toml" => "toml",
        _ => "text",
    }
}

fn to_posix(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Normalize `file_path` relative to `repo_root`. Files outside the root
/// keep their absolute path as identity; the flag reports which case hit.
pub fn normalize_path(file_path: &Path, repo_root: &Path, as_posix: bool) -> (String, bool) {
    match file_path.strip_prefix(repo_root) {
        Ok(relative) => {
            let rendered = if as_posix {
                to_posix(relative)
            } else {
                relative.to_string_lossy().to_string()
            };
            (rendered, true)
        }
        Err(_) => {
            let rendered = if as_posix {
                to_posix(file_path)
            } else {
                file_path.to_string_lossy().to_string()
            };
            (rendered, false)
        }
    }
}

/// Chunk a single file into overlapping line windows with stable identities.
pub fn chunk_file(
    file_path: &Path,
    repo_root: &Path,
    chunk_lines: usize,
    overlap: usize,
    as_posix: bool,
) -> Result<ChunkedFile, ChunkError> {
    validate_window(chunk_lines, overlap)?;

    let resolved_file = file_path
        .canonicalize()
        .map_err(|_| ChunkError::InvalidFile(file_path.to_path_buf()))?;
    if !resolved_file.is_file() {
        return Err(ChunkError::InvalidFile(resolved_file));
    }
    let resolved_root = repo_root.canonicalize().unwrap_or_else(|_| repo_root.to_path_buf());

    let (normalized_path, path_is_relative) =
        normalize_path(&resolved_file, &resolved_root, as_posix);

    let mut warnings = Vec::new();
    if !path_is_relative {
        warnings.push("file outside of repo root; using absolute path".to_string());
    }

    let (text, encoding) = read_text(&resolved_file)?;
    let lines: Vec<&str> = text.lines().collect();
    let content_hash = hash_content(&text);
    let language = detect_language(&resolved_file).to_string();

    let chunks = window_lines(&lines, chunk_lines, overlap)?
        .into_iter()
        .enumerate()
        .map(|(index, (start, end, window))| Chunk {
            chunk_id: make_chunk_id(&normalized_path, start, end, &content_hash),
            content_hash: content_hash.clone(),
            path: normalized_path.clone(),
            chunk_index: index,
            start_line: start,
            end_line: end,
            language: language.clone(),
            content: window.join("\n"),
        })
        .collect();

    Ok(ChunkedFile {
        path: normalized_path,
        path_is_relative,
        total_lines: lines.len(),
        encoding,
        chunks,
        warnings,
    })
}
