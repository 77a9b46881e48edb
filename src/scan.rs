//! Repository scanner.
//!
//! Walks a repository root depth-first, applies the resolved filters, and
//! produces a sorted list of repo-relative POSIX paths plus traversal stats.
//!
//! Rejection order, short-circuiting on the first match:
//! 1. directory basename in the ignore-dirs set → prune the subtree
//! 2. non-regular files (symlinks, sockets) → skipped silently
//! 3. extension not in the allow-exts set → rejected
//! 4. repo-relative path matches a pre-compiled ignore glob → rejected
//! 5. binary sniff: a NUL byte in the first 4 KiB (or an unreadable file)
//!    → rejected
//!
//! Symlinks are never followed. Malformed glob patterns are logged and
//! dropped, never fatal.

use anyhow::Result;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use std::io::Read;
use std::path::Path;
use std::time::Instant;
use tracing::warn;
use walkdir::WalkDir;

use crate::config::ScanConfig;

/// Bytes sniffed from the head of each candidate file.
const BINARY_SNIFF_BYTES: usize = 4096;

/// Counters recorded during one traversal.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanStats {
    pub total_files_seen: u64,
    pub total_dirs_seen: u64,
    pub files_kept: u64,
    pub files_ignored_ext: u64,
    pub files_ignored_pattern: u64,
    pub files_ignored_binary: u64,
    pub dirs_ignored: u64,
    pub elapsed_ms: u64,
}

/// True when the file looks binary: unreadable, or a NUL byte within the
/// first [`BINARY_SNIFF_BYTES`] bytes.
fn is_binary_file(path: &Path) -> bool {
    let mut handle = match std::fs::File::open(path) {
        Ok(handle) => handle,
        Err(_) => return true,
    };

    let mut buffer = [0u8; BINARY_SNIFF_BYTES];
    let read = match handle.read(&mut buffer) {
        Ok(read) => read,
        Err(_) => return true,
    };

    buffer[..read].contains(&0)
}

/// Compile ignore patterns into a [`GlobSet`], dropping malformed entries.
fn compile_ignore_patterns(patterns: &[String]) -> GlobSet {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        match Glob::new(pattern) {
            Ok(glob) => {
                builder.add(glob);
            }
            Err(err) => {
                warn!(pattern = %pattern, error = %err, "ignoring malformed glob pattern");
            }
        }
    }
    builder.build().unwrap_or_else(|_| GlobSet::empty())
}

/// Lower-cased extension with leading dot, or `None` when the file has none.
fn file_suffix(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy().to_lowercase()))
}

/// Scan the repository and return kept repo-relative POSIX paths plus stats.
///
/// The returned list is sorted lexicographically. `max_files` truncates the
/// list but does not affect the counters.
pub fn scan_repo(config: &ScanConfig, max_files: Option<usize>) -> Result<(Vec<String>, ScanStats)> {
    let started = Instant::now();
    let mut stats = ScanStats::default();
    let mut files: Vec<String> = Vec::new();

    let ignore_set = compile_ignore_patterns(&config.ignore_patterns);
    let root = &config.repo_root;

    let mut walker = WalkDir::new(root).follow_links(false).into_iter();
    while let Some(entry) = walker.next() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => continue,
        };

        if entry.file_type().is_dir() {
            let name = entry.file_name().to_string_lossy();
            if entry.depth() > 0 && config.ignore_dirs.contains(name.as_ref()) {
                stats.dirs_ignored += 1;
                walker.skip_current_dir();
                continue;
            }
            stats.total_dirs_seen += 1;
            continue;
        }

        if !entry.file_type().is_file() {
            continue;
        }

        stats.total_files_seen += 1;

        let name = entry.file_name().to_string_lossy();
        match file_suffix(&name) {
            Some(suffix) if config.allow_exts.contains(&suffix) => {}
            _ => {
                stats.files_ignored_ext += 1;
                continue;
            }
        }

        let relative = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if ignore_set.is_match(&relative) {
            stats.files_ignored_pattern += 1;
            continue;
        }

        if is_binary_file(entry.path()) {
            stats.files_ignored_binary += 1;
            continue;
        }

        files.push(relative);
        stats.files_kept += 1;
    }

    files.sort();
    stats.elapsed_ms = started.elapsed().as_millis() as u64;

    if let Some(limit) = max_files {
        files.truncate(limit);
    }

    Ok((files, stats))
}
