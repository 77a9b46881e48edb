//! Configuration resolution.
//!
//! Every tunable in codescout is resolved from three sources, in order of
//! decreasing precedence: explicit caller arguments → environment variables →
//! compiled-in defaults. The resolved configs are plain frozen structs; no
//! module re-reads the environment after construction.
//!
//! Three config families live here: [`ScanConfig`] (traversal filters),
//! [`ChunkConfig`] (line windowing), and [`RuntimeConfig`] (classification,
//! snippets, coverage gate). The embedder and vector store load their own
//! configs in their modules, following the same precedence rule.
//!
//! Loaders take an environment lookup function instead of touching
//! `std::env` directly, so tests can inject values without mutating process
//! state. Production call sites pass [`process_env`].

use anyhow::{bail, Result};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

pub const DEFAULT_IGNORE_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "dist",
    "build",
    ".next",
    ".qdrant_storage",
    "coverage",
    ".venv",
    "venv",
    "__pycache__",
    ".pytest_cache",
    ".mypy_cache",
    ".ruff_cache",
    "target",
];

pub const DEFAULT_ALLOW_EXTS: &[&str] = &[
    ".ts", ".tsx", ".js", ".jsx", ".py", ".rs", ".go", ".md", ".json", ".yaml", ".yml", ".toml",
];

pub const DEFAULT_CHUNK_LINES: usize = 120;
pub const DEFAULT_CHUNK_OVERLAP_LINES: usize = 20;

pub const DEFAULT_EXCLUDED_CONTEXT_PATH_PARTS: &[&str] = &[
    "/.venv/",
    "/venv/",
    "/__pycache__/",
    "/.pytest_cache/",
    "/.mypy_cache/",
    "/.ruff_cache/",
    "/node_modules/",
    "/target/",
];

pub const DEFAULT_SEARCH_SNIPPET_MAX_CHARS: usize = 300;

pub const DEFAULT_DOC_EXTENSIONS: &[&str] = &[".md", ".mdx", ".rst", ".adoc", ".txt"];

pub const DEFAULT_DOC_PATH_HINTS: &[&str] = &[
    "/docs/",
    "/documentation/",
    "/adr",
    "/wiki/",
    "/changelog",
    "/contributing",
    "/license",
    "/readme",
];

pub const DEFAULT_CONTENT_TYPES: (&str, &str) = ("code", "docs");

pub const DEFAULT_MIN_FILE_COVERAGE: f64 = 0.95;

/// Scanner filters, frozen after resolution.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub repo_root: PathBuf,
    pub ignore_dirs: BTreeSet<String>,
    pub allow_exts: BTreeSet<String>,
    pub ignore_patterns: Vec<String>,
}

/// Line-window chunking parameters.
#[derive(Debug, Clone)]
pub struct ChunkConfig {
    pub repo_root: PathBuf,
    pub chunk_lines: usize,
    pub overlap_lines: usize,
}

/// Classification and retrieval-surface tuning.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub excluded_context_path_parts: Vec<String>,
    pub search_snippet_max_chars: usize,
    pub doc_extensions: BTreeSet<String>,
    pub doc_path_hints: Vec<String>,
    /// Processing order of the two buckets; always a permutation of
    /// `("code", "docs")`.
    pub content_types: (String, String),
    pub min_file_coverage: f64,
}

/// Caller-supplied scan overrides (CLI flags). All optional; CSV strings.
#[derive(Debug, Clone, Default)]
pub struct ScanOverrides {
    pub repo_root: Option<String>,
    pub ignore_dirs: Option<String>,
    pub allow_exts: Option<String>,
    pub ignore_patterns: Option<String>,
}

/// Default environment lookup backed by the process environment.
pub fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Split a CSV string, trimming entries and dropping empties.
pub fn parse_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

/// Truthy strings accepted across all boolean env vars.
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Tri-state boolean parsing for grounded-style flags.
///
/// Returns `Some(true)` for truthy strings, `Some(false)` for explicit
/// falsy strings, `None` for anything else (treated as unset).
pub fn parse_tristate(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Normalize ignore-dir entries to bare basenames.
///
/// Accepts either names (`node_modules`) or trailing path components
/// (`some/path/node_modules`); only the basename participates in matching.
fn normalize_ignore_dirs(values: &[String]) -> BTreeSet<String> {
    values
        .iter()
        .filter_map(|value| {
            Path::new(value.trim())
                .file_name()
                .map(|name| name.to_string_lossy().trim().to_string())
        })
        .filter(|name| !name.is_empty())
        .collect()
}

/// Normalize extensions to lower-case with a leading dot.
fn normalize_allow_exts(values: &[String]) -> BTreeSet<String> {
    values
        .iter()
        .map(|value| value.trim().to_lowercase())
        .filter(|item| !item.is_empty())
        .map(|item| {
            if item.starts_with('.') {
                item
            } else {
                format!(".{item}")
            }
        })
        .collect()
}

/// Normalize path markers to lowercase POSIX form starting with `/`.
///
/// When `ensure_trailing_slash` is set the marker also ends with `/`
/// (exclusion markers match whole path components).
pub fn normalize_path_markers(values: &[String], ensure_trailing_slash: bool) -> Vec<String> {
    let mut normalized = Vec::new();
    let mut seen = BTreeSet::new();

    for value in values {
        let mut marker = value.trim().replace('\\', "/").to_lowercase();
        if marker.is_empty() {
            continue;
        }
        if !marker.starts_with('/') {
            marker = format!("/{marker}");
        }
        if ensure_trailing_slash && !marker.ends_with('/') {
            marker = format!("{marker}/");
        }
        if seen.insert(marker.clone()) {
            normalized.push(marker);
        }
    }

    normalized
}

/// Resolve the repo root to an absolute canonical path.
///
/// Expands a leading `~`, anchors relative paths at the current working
/// directory, and canonicalizes when the path exists.
pub fn resolve_repo_root(raw: Option<&str>) -> PathBuf {
    let raw = raw.map(str::trim).filter(|s| !s.is_empty()).unwrap_or("..");

    let expanded = if raw == "~" {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(raw))
    } else if let Some(rest) = raw.strip_prefix("~/") {
        match std::env::var("HOME") {
            Ok(home) => Path::new(&home).join(rest),
            Err(_) => PathBuf::from(raw),
        }
    } else {
        PathBuf::from(raw)
    };

    let absolute = if expanded.is_absolute() {
        expanded
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(&expanded))
            .unwrap_or(expanded)
    };

    absolute.canonicalize().unwrap_or(absolute)
}

fn resolve_int(
    value: Option<&str>,
    env_value: Option<&str>,
    default: usize,
    label: &str,
) -> Result<usize> {
    let selected = match (value, env_value) {
        (Some(v), _) => v,
        (None, Some(v)) => v,
        (None, None) => return Ok(default),
    };

    match selected.trim().parse::<usize>() {
        Ok(parsed) => Ok(parsed),
        Err(_) => bail!("{} must be a valid integer, got '{}'", label, selected),
    }
}

fn parse_positive_int(value: Option<&str>, default: usize, minimum: usize) -> usize {
    let Some(raw) = value else { return default };
    if raw.trim().is_empty() {
        return default;
    }
    match raw.trim().parse::<usize>() {
        Ok(parsed) if parsed >= minimum => parsed,
        _ => default,
    }
}

/// Accept only an explicit permutation of both buckets; anything else
/// falls back to the default ordering.
fn resolve_content_types(raw_values: &[String]) -> (String, String) {
    let mut normalized: Vec<String> = Vec::new();
    for value in raw_values {
        let item = value.trim().to_lowercase();
        if (item == "code" || item == "docs") && !normalized.contains(&item) {
            normalized.push(item);
        }
    }

    if normalized.len() == 2 {
        (normalized[0].clone(), normalized[1].clone())
    } else {
        (
            DEFAULT_CONTENT_TYPES.0.to_string(),
            DEFAULT_CONTENT_TYPES.1.to_string(),
        )
    }
}

fn parse_min_file_coverage(value: Option<&str>, default: f64) -> f64 {
    let Some(raw) = value else { return default };
    if raw.trim().is_empty() {
        return default;
    }
    match raw.trim().parse::<f64>() {
        Ok(parsed) if parsed > 0.0 => parsed.min(1.0),
        _ => default,
    }
}

/// Resolve the scan configuration from overrides, environment, and defaults.
///
/// Extra ignore-dirs from CLI/env are merged on top of the defaults;
/// allow-exts and ignore-patterns replace the defaults when present.
pub fn load_scan_config<E>(overrides: &ScanOverrides, env: E) -> ScanConfig
where
    E: Fn(&str) -> Option<String>,
{
    let repo_root_raw = overrides.repo_root.clone().or_else(|| env("REPO_ROOT"));

    let extra_ignore_dirs = overrides
        .ignore_dirs
        .clone()
        .or_else(|| env("SCAN_IGNORE_DIRS"))
        .map(|s| parse_csv(&s))
        .unwrap_or_default();

    let allow_raw = overrides
        .allow_exts
        .clone()
        .or_else(|| env("SCAN_ALLOW_EXTS"))
        .map(|s| parse_csv(&s))
        .unwrap_or_default();

    let patterns_raw = overrides
        .ignore_patterns
        .clone()
        .or_else(|| env("SCAN_IGNORE_PATTERNS"))
        .map(|s| parse_csv(&s))
        .unwrap_or_default();

    let mut ignore_dirs: BTreeSet<String> =
        DEFAULT_IGNORE_DIRS.iter().map(|s| s.to_string()).collect();
    ignore_dirs.extend(normalize_ignore_dirs(&extra_ignore_dirs));

    let allow_exts = if allow_raw.is_empty() {
        DEFAULT_ALLOW_EXTS.iter().map(|s| s.to_string()).collect()
    } else {
        normalize_allow_exts(&allow_raw)
    };

    ScanConfig {
        repo_root: resolve_repo_root(repo_root_raw.as_deref()),
        ignore_dirs,
        allow_exts,
        ignore_patterns: patterns_raw,
    }
}

/// Resolve the chunk configuration. Integer settings fail loudly when the
/// override or env string is not parseable.
pub fn load_chunk_config<E>(
    repo_root: Option<&str>,
    chunk_lines: Option<&str>,
    overlap_lines: Option<&str>,
    env: E,
) -> Result<ChunkConfig>
where
    E: Fn(&str) -> Option<String>,
{
    let repo_root_raw = repo_root.map(str::to_string).or_else(|| env("REPO_ROOT"));
    let chunk_env = env("CHUNK_LINES");
    let overlap_env = env("CHUNK_OVERLAP_LINES");

    Ok(ChunkConfig {
        repo_root: resolve_repo_root(repo_root_raw.as_deref()),
        chunk_lines: resolve_int(
            chunk_lines,
            chunk_env.as_deref(),
            DEFAULT_CHUNK_LINES,
            "CHUNK_LINES",
        )?,
        overlap_lines: resolve_int(
            overlap_lines,
            overlap_env.as_deref(),
            DEFAULT_CHUNK_OVERLAP_LINES,
            "CHUNK_OVERLAP_LINES",
        )?,
    })
}

/// Resolve the runtime configuration (classification + retrieval tuning).
///
/// Invalid or empty values silently fall back to defaults; this config can
/// never fail construction.
pub fn load_runtime_config<E>(env: E) -> RuntimeConfig
where
    E: Fn(&str) -> Option<String>,
{
    let excluded_raw = env("EXCLUDED_CONTEXT_PATH_PARTS")
        .map(|s| parse_csv(&s))
        .unwrap_or_default();
    let mut excluded = normalize_path_markers(&excluded_raw, true);
    if excluded.is_empty() {
        excluded = DEFAULT_EXCLUDED_CONTEXT_PATH_PARTS
            .iter()
            .map(|s| s.to_string())
            .collect();
    }

    let doc_exts_raw = env("DOC_EXTENSIONS")
        .map(|s| parse_csv(&s))
        .unwrap_or_default();
    let mut doc_extensions = normalize_allow_exts(&doc_exts_raw);
    if doc_extensions.is_empty() {
        doc_extensions = DEFAULT_DOC_EXTENSIONS
            .iter()
            .map(|s| s.to_string())
            .collect();
    }

    let hints_raw = env("DOC_PATH_HINTS").map(|s| parse_csv(&s)).unwrap_or_default();
    let mut doc_path_hints = normalize_path_markers(&hints_raw, false);
    if doc_path_hints.is_empty() {
        doc_path_hints = DEFAULT_DOC_PATH_HINTS.iter().map(|s| s.to_string()).collect();
    }

    RuntimeConfig {
        excluded_context_path_parts: excluded,
        search_snippet_max_chars: parse_positive_int(
            env("SEARCH_SNIPPET_MAX_CHARS").as_deref(),
            DEFAULT_SEARCH_SNIPPET_MAX_CHARS,
            4,
        ),
        doc_extensions,
        doc_path_hints,
        content_types: resolve_content_types(
            &env("CONTENT_TYPES").map(|s| parse_csv(&s)).unwrap_or_default(),
        ),
        min_file_coverage: parse_min_file_coverage(
            env("INDEX_MIN_FILE_COVERAGE").as_deref(),
            DEFAULT_MIN_FILE_COVERAGE,
        ),
    }
}
