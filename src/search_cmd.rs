//! Search and ask surfaces.
//!
//! **Search** embeds the query once per selected content type, queries the
//! matching collection(s), merges and re-sorts the hits, filters out noise
//! paths (virtualenvs, caches), and resolves a display snippet per hit —
//! from the stored `text` payload when present, otherwise by splicing the
//! recorded line range out of the file on disk.
//!
//! **Ask** goes through the external tool server: it spawns the
//! `MCP_COMMAND` child, performs the MCP handshake, calls the `ask_code`
//! tool with the composed request, and returns the parsed
//! `{answer, evidences, meta}` object.

use anyhow::{bail, Context, Result};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::bridge::{resolve_mcp_command, AskBridge, McpBridge, McpBridgeConfig};
use crate::classify::ContentType;
use crate::config::{load_runtime_config, parse_csv, RuntimeConfig};
use crate::embedding::{create_embedder, Embedder};
use crate::qdrant::{load_qdrant_config, QdrantStore, ScoredPoint};

/// Placeholder when no snippet can be produced.
pub const NO_TEXT_PAYLOAD: &str = "(no text payload)";

/// Default `tools/call` timeout for the ask path.
pub const DEFAULT_ASK_TIMEOUT_SECONDS: u64 = 120;

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub query: String,
    /// `code`, `docs`, or `all` (default).
    pub content_type: Option<String>,
    pub top_k: usize,
    pub path_prefix: Option<String>,
    pub language: Option<String>,
    pub repo: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: String,
    pub score: f64,
    pub payload: Value,
    pub snippet: String,
}

#[derive(Debug, Clone, Default)]
pub struct SearchOutcome {
    pub hits: Vec<SearchHit>,
    pub excluded: usize,
}

#[derive(Debug, Clone)]
pub struct AskOptions {
    pub query: String,
    pub repo: Option<String>,
    pub top_k: Option<u64>,
    pub min_score: Option<f64>,
    pub llm_model: Option<String>,
    pub path_prefix: Option<String>,
    pub language: Option<String>,
    pub grounded: Option<bool>,
    pub content_type: Option<String>,
    pub strict: bool,
    pub timeout_seconds: u64,
}

/// Collapse runs of whitespace and truncate to `max_chars` with a `...`
/// marker that fits inside the budget.
pub fn normalize_snippet(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }
    let keep = max_chars.saturating_sub(3);
    let truncated: String = collapsed.chars().take(keep).collect();
    format!("{truncated}...")
}

/// True when the path touches one of the excluded context markers
/// (virtualenvs, caches, build output).
pub fn should_exclude_context_path(path: Option<&str>, runtime: &RuntimeConfig) -> bool {
    let Some(path) = path else { return false };
    let wrapped = format!(
        "/{}/",
        path.trim().replace('\\', "/").to_lowercase().trim_matches('/')
    );
    runtime
        .excluded_context_path_parts
        .iter()
        .any(|marker| wrapped.contains(marker.as_str()))
}

/// Drop hits living under excluded paths. Returns the survivors and the
/// number removed.
pub fn filter_context_results(
    hits: Vec<ScoredPoint>,
    runtime: &RuntimeConfig,
) -> (Vec<ScoredPoint>, usize) {
    let total = hits.len();
    let kept: Vec<ScoredPoint> = hits
        .into_iter()
        .filter(|hit| {
            !should_exclude_context_path(
                hit.payload.get("path").and_then(Value::as_str),
                runtime,
            )
        })
        .collect();
    let excluded = total - kept.len();
    (kept, excluded)
}

/// Render one search hit in the fixed CLI layout.
pub fn format_search_result_block(index: usize, score: f64, payload: &Value, snippet: &str) -> String {
    let path = payload.get("path").and_then(Value::as_str).unwrap_or("?");
    let start = payload.get("start_line").and_then(Value::as_u64).unwrap_or(0);
    let end = payload.get("end_line").and_then(Value::as_u64).unwrap_or(0);
    format!("[{index}] score={score:.4}  {path}:{start}-{end}\n    snippet: \"{snippet}\"")
}

/// Resolves snippets with a per-path line cache so each file is read once.
pub struct SnippetResolver {
    max_chars: usize,
    line_cache: HashMap<PathBuf, Option<Vec<String>>>,
}

impl SnippetResolver {
    pub fn new(max_chars: usize) -> Self {
        Self {
            max_chars,
            line_cache: HashMap::new(),
        }
    }

    /// Snippet from the `text` payload, else from the file on disk within
    /// the recorded `repo_root`. Every failure path (escaping the root,
    /// missing file, decode error) yields the placeholder.
    pub fn resolve(&mut self, payload: &Value) -> String {
        if let Some(text) = payload.get("text").and_then(Value::as_str) {
            if !text.trim().is_empty() {
                return normalize_snippet(text, self.max_chars);
            }
        }

        self.resolve_from_file(payload)
            .unwrap_or_else(|| NO_TEXT_PAYLOAD.to_string())
    }

    fn resolve_from_file(&mut self, payload: &Value) -> Option<String> {
        let repo_root = payload.get("repo_root").and_then(Value::as_str)?;
        let path = payload.get("path").and_then(Value::as_str)?;
        let start = payload.get("start_line").and_then(Value::as_u64)? as usize;
        let end = payload.get("end_line").and_then(Value::as_u64)? as usize;
        if start == 0 || end < start {
            return None;
        }

        let root = Path::new(repo_root).canonicalize().ok()?;
        let file = root.join(path).canonicalize().ok()?;
        if !file.starts_with(&root) {
            return None;
        }

        let lines = self
            .line_cache
            .entry(file.clone())
            .or_insert_with(|| {
                std::fs::read_to_string(&file)
                    .ok()
                    .map(|text| text.lines().map(str::to_string).collect())
            })
            .as_ref()?;

        if start > lines.len() {
            return None;
        }
        let spliced = lines[start - 1..end.min(lines.len())].join("\n");
        Some(normalize_snippet(&spliced, self.max_chars))
    }
}

fn selected_types(content_type: Option<&str>) -> Result<Vec<ContentType>> {
    match content_type.map(|v| v.trim().to_lowercase()).as_deref() {
        None | Some("all") | Some("") => Ok(vec![ContentType::Code, ContentType::Docs]),
        Some("code") => Ok(vec![ContentType::Code]),
        Some("docs") => Ok(vec![ContentType::Docs]),
        Some(other) => bail!("unknown content type: '{}'. Use code, docs, or all.", other),
    }
}

/// Merge per-type hits: a single selected type passes through; both types
/// merge, re-sort by descending score, and keep the top K.
pub fn merge_hits(mut groups: Vec<Vec<ScoredPoint>>, top_k: usize) -> Vec<ScoredPoint> {
    if groups.len() == 1 {
        let mut hits = groups.pop().unwrap_or_default();
        hits.truncate(top_k);
        return hits;
    }

    let mut merged: Vec<ScoredPoint> = groups.into_iter().flatten().collect();
    merged.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    merged.truncate(top_k);
    merged
}

/// Run a semantic search across the selected collections; the `search`
/// subcommand.
pub async fn run_search<E>(options: &SearchOptions, env: &E) -> Result<SearchOutcome>
where
    E: Fn(&str) -> Option<String>,
{
    if options.query.trim().is_empty() {
        return Ok(SearchOutcome::default());
    }

    let runtime = load_runtime_config(|k| env(k));
    let store = QdrantStore::new(load_qdrant_config(|k| env(k))?)?;
    let types = selected_types(options.content_type.as_deref())?;

    let mut filters = Map::new();
    if let Some(prefix) = options.path_prefix.as_deref().filter(|p| !p.is_empty()) {
        filters.insert("path_prefix".to_string(), json!(prefix));
    }
    if let Some(language) = options.language.as_deref().filter(|l| !l.is_empty()) {
        filters.insert("language".to_string(), json!(language));
    }
    if let Some(repo) = options.repo.as_deref().filter(|r| !r.is_empty()) {
        let repos = parse_csv(repo);
        if repos.len() == 1 {
            filters.insert("repo".to_string(), json!(repos[0]));
        } else if !repos.is_empty() {
            filters.insert("repo".to_string(), json!(repos));
        }
    }
    let filters = if filters.is_empty() { None } else { Some(filters) };

    let mut groups = Vec::new();
    for content_type in &types {
        let embedder = create_embedder(Some(*content_type), |k| env(k))?;
        let query_vector = embedder
            .embed_texts(&[options.query.clone()], None)
            .await?
            .into_iter()
            .next()
            .context("empty embedding response for query")?;

        let names = store.resolve_split_collection_names(query_vector.len(), embedder.model_name());
        let collection = match content_type {
            ContentType::Code => names.code,
            ContentType::Docs => names.docs,
        };

        let hits = store
            .search(&query_vector, &collection, filters.as_ref(), options.top_k, false)
            .await?;
        debug!(collection = %collection, hits = hits.len(), "collection searched");
        groups.push(hits);
    }

    let merged = merge_hits(groups, options.top_k);
    let (kept, excluded) = filter_context_results(merged, &runtime);

    let mut resolver = SnippetResolver::new(runtime.search_snippet_max_chars);
    let hits = kept
        .into_iter()
        .map(|hit| {
            let snippet = resolver.resolve(&hit.payload);
            SearchHit {
                id: hit.id,
                score: hit.score,
                payload: hit.payload,
                snippet,
            }
        })
        .collect();

    Ok(SearchOutcome { hits, excluded })
}

/// Compose the `ask_code` request body. Only keys with meaningful values
/// are included; the repo selector lowers to the scope variants.
pub fn build_ask_input<E>(options: &AskOptions, env: &E) -> Map<String, Value>
where
    E: Fn(&str) -> Option<String>,
{
    let mut payload = Map::new();
    payload.insert("query".to_string(), json!(options.query));

    let repo_csv = options
        .repo
        .clone()
        .or_else(|| env("ACP_REPO"))
        .unwrap_or_default();
    let mut repos = Vec::new();
    for repo in parse_csv(&repo_csv) {
        if !repos.contains(&repo) {
            repos.push(repo);
        }
    }
    let scope = match repos.as_slice() {
        [] => json!({"type": "all"}),
        [repo] => json!({"type": "repo", "repo": repo}),
        many => json!({"type": "repos", "repos": many}),
    };
    payload.insert("scope".to_string(), scope);

    if let Some(top_k) = options.top_k.filter(|v| *v > 0) {
        payload.insert("topK".to_string(), json!(top_k));
    }
    if let Some(min_score) = options.min_score.filter(|v| (0.0..=1.0).contains(v)) {
        payload.insert("minScore".to_string(), json!(min_score));
    }
    if let Some(model) = options.llm_model.as_deref().filter(|m| !m.is_empty()) {
        payload.insert("llmModel".to_string(), json!(model));
    }
    if let Some(prefix) = options.path_prefix.as_deref().filter(|p| !p.is_empty()) {
        payload.insert("pathPrefix".to_string(), json!(prefix));
    }
    if let Some(language) = options.language.as_deref().filter(|l| !l.is_empty()) {
        payload.insert("language".to_string(), json!(language));
    }
    if let Some(grounded) = options.grounded {
        payload.insert("grounded".to_string(), json!(grounded));
    }
    if let Some(content_type) = options
        .content_type
        .as_deref()
        .map(str::to_lowercase)
        .filter(|v| matches!(v.as_str(), "code" | "docs" | "all"))
    {
        payload.insert("contentType".to_string(), json!(content_type));
    }
    if options.strict {
        payload.insert("strict".to_string(), json!(true));
    }

    payload
}

/// Ask a question through the external tool server; the `ask` subcommand.
pub async fn run_ask<E>(options: &AskOptions, env: &E) -> Result<Value>
where
    E: Fn(&str) -> Option<String>,
{
    if options.query.trim().is_empty() {
        bail!("query must not be empty");
    }

    let command = resolve_mcp_command(|k| env(k))?;
    let bridge = McpBridge::new(McpBridgeConfig {
        command,
        env: HashMap::new(),
    });

    let payload = Value::Object(build_ask_input(options, env));
    let result = tokio::time::timeout(
        Duration::from_secs(options.timeout_seconds.max(1)),
        async {
            bridge.start().await?;
            bridge.ask_code(payload, CancellationToken::new()).await
        },
    )
    .await;

    let output = match result {
        Ok(Ok(output)) => output,
        Ok(Err(err)) => {
            bridge.close().await;
            return Err(err).context("ask_code call failed");
        }
        Err(_) => {
            bridge.abort().await;
            bail!(
                "ask_code timed out after {} seconds",
                options.timeout_seconds
            );
        }
    };

    bridge.close().await;
    Ok(output)
}
