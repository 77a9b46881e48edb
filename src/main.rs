//! `scout` — the codescout command line.
//!
//! Subcommands cover the whole lifecycle: `scan` and `chunk` inspect the
//! pipeline inputs, `init` prepares the vector collections, `index` runs
//! the full indexing pipeline, `search` queries the collections directly,
//! `ask` goes through the external tool server, and `serve acp` runs the
//! stdio agent. Machine-readable flows print JSON on stdout; logs always
//! go to stderr.

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;

use codescout::config::{
    is_truthy, load_chunk_config, load_scan_config, process_env, ScanOverrides,
};
use codescout::index_cmd::{run_index, run_init, IndexOptions};
use codescout::scan::scan_repo;
use codescout::search_cmd::{
    build_ask_input, format_search_result_block, run_ask, run_search, AskOptions, SearchOptions,
    DEFAULT_ASK_TIMEOUT_SECONDS,
};

#[derive(Parser)]
#[command(
    name = "scout",
    about = "codescout — code-aware retrieval-augmented QA over repositories",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan the repository and list indexable files
    Scan {
        #[arg(long)]
        repo_root: Option<String>,

        /// CSV of allowed extensions (e.g. ".rs,.md")
        #[arg(long)]
        allow_exts: Option<String>,

        /// CSV of extra directory names to ignore
        #[arg(long)]
        ignore_dirs: Option<String>,

        /// CSV of glob patterns to ignore
        #[arg(long)]
        ignore_patterns: Option<String>,

        /// Truncate the file list (counters are unaffected)
        #[arg(long)]
        max_files: Option<usize>,
    },

    /// Chunk a single file into line windows
    Chunk {
        /// File to chunk
        #[arg(long)]
        file: PathBuf,

        #[arg(long)]
        chunk_lines: Option<String>,

        #[arg(long)]
        overlap_lines: Option<String>,

        #[arg(long)]
        repo_root: Option<String>,

        /// Keep OS-native separators in the reported path
        #[arg(long)]
        no_as_posix: bool,
    },

    /// Probe embedders and prepare both vector collections
    Init,

    /// Run the full indexing pipeline and emit a JSON report
    Index {
        #[arg(long)]
        repo_root: Option<String>,

        #[arg(long)]
        allow_exts: Option<String>,

        #[arg(long)]
        ignore_dirs: Option<String>,

        #[arg(long)]
        ignore_patterns: Option<String>,

        #[arg(long)]
        chunk_lines: Option<String>,

        #[arg(long)]
        overlap_lines: Option<String>,

        #[arg(long)]
        max_files: Option<usize>,
    },

    /// Semantic search over the indexed collections
    Search {
        query: String,

        /// code, docs, or all
        #[arg(long, default_value = "all")]
        content_type: String,

        #[arg(long, default_value_t = 10)]
        top_k: usize,

        #[arg(long)]
        path_prefix: Option<String>,

        #[arg(long)]
        language: Option<String>,

        /// Repo filter (CSV for multiple repos)
        #[arg(long)]
        repo: Option<String>,
    },

    /// Ask a question through the external tool server
    Ask {
        query: String,

        /// Repo scope (CSV for multiple repos); defaults to ACP_REPO
        #[arg(long)]
        repo: Option<String>,

        #[arg(long)]
        top_k: Option<u64>,

        #[arg(long)]
        min_score: Option<f64>,

        #[arg(long)]
        llm_model: Option<String>,

        #[arg(long)]
        path_prefix: Option<String>,

        #[arg(long)]
        language: Option<String>,

        /// on or off; defaults to ACP_GROUNDED
        #[arg(long)]
        grounded: Option<String>,

        /// code, docs, or all
        #[arg(long)]
        content_type: Option<String>,

        #[arg(long)]
        strict: bool,

        /// Print the raw JSON output instead of formatted text
        #[arg(long)]
        json: bool,

        #[arg(long, default_value_t = DEFAULT_ASK_TIMEOUT_SECONDS)]
        timeout: u64,
    },

    /// Run a long-lived service
    Serve {
        #[command(subcommand)]
        service: ServeService,
    },
}

#[derive(Subcommand)]
enum ServeService {
    /// Run the agent protocol over stdio
    Acp,
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let default_level = if process_env("ACP_DEBUG").as_deref().map(is_truthy) == Some(true) {
        "debug"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn scan_command(
    repo_root: Option<String>,
    allow_exts: Option<String>,
    ignore_dirs: Option<String>,
    ignore_patterns: Option<String>,
    max_files: Option<usize>,
) -> Result<i32> {
    let overrides = ScanOverrides {
        repo_root,
        ignore_dirs,
        allow_exts,
        ignore_patterns,
    };
    let config = load_scan_config(&overrides, process_env);

    if !config.repo_root.is_dir() {
        eprintln!(
            "Error: repo root does not exist or is not a directory: {}",
            config.repo_root.display()
        );
        return Ok(1);
    }

    let (files, stats) = scan_repo(&config, max_files)?;
    let payload = json!({
        "repoRoot": config.repo_root.display().to_string(),
        "ignoreDirs": config.ignore_dirs.iter().collect::<Vec<_>>(),
        "allowExts": config.allow_exts.iter().collect::<Vec<_>>(),
        "stats": stats,
        "files": files,
    });
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(0)
}

fn chunk_command(
    file: PathBuf,
    chunk_lines: Option<String>,
    overlap_lines: Option<String>,
    repo_root: Option<String>,
    as_posix: bool,
) -> Result<i32> {
    let config = load_chunk_config(
        repo_root.as_deref(),
        chunk_lines.as_deref(),
        overlap_lines.as_deref(),
        process_env,
    )?;

    let result = match codescout::chunk::chunk_file(
        &file,
        &config.repo_root,
        config.chunk_lines,
        config.overlap_lines,
        as_posix,
    ) {
        Ok(result) => result,
        Err(err) => {
            eprintln!("Error: {err}");
            return Ok(1);
        }
    };

    let payload = json!({
        "file": file.display().to_string(),
        "repoRoot": config.repo_root.display().to_string(),
        "path": result.path,
        "pathIsRelative": result.path_is_relative,
        "asPosix": as_posix,
        "chunkLines": config.chunk_lines,
        "overlapLines": config.overlap_lines,
        "totalLines": result.total_lines,
        "encoding": result.encoding,
        "chunks": result.chunks,
        "stats": {"chunks": result.chunks.len()},
        "warnings": result.warnings,
    });
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(0)
}

fn print_ask_output(output: &Value, as_json: bool) -> Result<()> {
    if as_json {
        println!("{}", serde_json::to_string_pretty(output)?);
        return Ok(());
    }

    let answer = output.get("answer").and_then(Value::as_str).unwrap_or("");
    println!("{answer}");

    if let Some(evidences) = output.get("evidences").and_then(Value::as_array) {
        if !evidences.is_empty() {
            println!("\nevidences:");
            for (index, evidence) in evidences.iter().enumerate() {
                let repo = evidence.get("repo").and_then(Value::as_str).unwrap_or("?");
                let path = evidence.get("path").and_then(Value::as_str).unwrap_or("?");
                let start = evidence.get("startLine").and_then(Value::as_u64).unwrap_or(0);
                let end = evidence.get("endLine").and_then(Value::as_u64).unwrap_or(0);
                let score = evidence.get("score").and_then(Value::as_f64).unwrap_or(0.0);
                println!(
                    "  [{}] {}:{}:{}-{} score={:.4}",
                    index + 1,
                    repo,
                    path,
                    start,
                    end,
                    score
                );
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let exit_code = match cli.command {
        Commands::Scan {
            repo_root,
            allow_exts,
            ignore_dirs,
            ignore_patterns,
            max_files,
        } => scan_command(repo_root, allow_exts, ignore_dirs, ignore_patterns, max_files)?,

        Commands::Chunk {
            file,
            chunk_lines,
            overlap_lines,
            repo_root,
            no_as_posix,
        } => chunk_command(file, chunk_lines, overlap_lines, repo_root, !no_as_posix)?,

        Commands::Init => {
            let report = run_init(&process_env).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            0
        }

        Commands::Index {
            repo_root,
            allow_exts,
            ignore_dirs,
            ignore_patterns,
            chunk_lines,
            overlap_lines,
            max_files,
        } => {
            let options = IndexOptions {
                scan: ScanOverrides {
                    repo_root,
                    ignore_dirs,
                    allow_exts,
                    ignore_patterns,
                },
                chunk_lines,
                overlap_lines,
                max_files,
            };
            let report = run_index(&options, &process_env).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.status == "insufficient_coverage" {
                1
            } else {
                0
            }
        }

        Commands::Search {
            query,
            content_type,
            top_k,
            path_prefix,
            language,
            repo,
        } => {
            let options = SearchOptions {
                query,
                content_type: Some(content_type),
                top_k,
                path_prefix,
                language,
                repo,
            };
            let outcome = run_search(&options, &process_env).await?;
            if outcome.hits.is_empty() {
                println!("no results");
            }
            for (index, hit) in outcome.hits.iter().enumerate() {
                println!(
                    "{}",
                    format_search_result_block(index + 1, hit.score, &hit.payload, &hit.snippet)
                );
            }
            if outcome.excluded > 0 {
                println!("({} result(s) excluded by context path filters)", outcome.excluded);
            }
            0
        }

        Commands::Ask {
            query,
            repo,
            top_k,
            min_score,
            llm_model,
            path_prefix,
            language,
            grounded,
            content_type,
            strict,
            json: as_json,
            timeout,
        } => {
            let options = AskOptions {
                query,
                repo,
                top_k,
                min_score,
                llm_model,
                path_prefix,
                language,
                grounded: grounded
                    .as_deref()
                    .and_then(codescout::config::parse_tristate),
                content_type,
                strict: strict
                    || process_env("ACP_STRICT").as_deref().map(is_truthy) == Some(true),
                timeout_seconds: timeout,
            };
            // The composed request is logged for operator triage.
            let ask_payload = Value::Object(build_ask_input(&options, &process_env));
            tracing::debug!(
                payload = %ask_payload,
                "ask_code request"
            );
            let output = run_ask(&options, &process_env).await?;
            print_ask_output(&output, as_json)?;
            0
        }

        Commands::Serve { service } => match service {
            ServeService::Acp => {
                codescout::server::run_acp_server().await?;
                0
            }
        },
    };

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}
