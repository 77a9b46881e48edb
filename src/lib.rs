//! # codescout
//!
//! **Code-aware retrieval-augmented question answering over pre-indexed
//! repositories.**
//!
//! codescout indexes source repositories into a vector store split by
//! content type (`code` / `docs`), serves filtered semantic search over
//! those collections, and runs an interactive stdio agent that forwards
//! questions to an external tool server and streams grounded answers back.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────┐   ┌─────────────────┐   ┌──────────┐   ┌─────────────┐
//! │ Scanner │──▶│ Chunk + Classify │──▶│ Embedder │──▶│   Qdrant    │
//! └─────────┘   └─────────────────┘   └──────────┘   │ code / docs │
//!                                                    └──────┬──────┘
//!                              ┌────────────┐               │
//!                              │    CLI     │◀──────────────┤
//!                              │  (scout)   │               │
//!                              └────────────┘        ┌──────┴──────┐
//!                         ┌───────────────┐          │ tool server │
//!                         │  ACP agent    │─ stdio ─▶│ (ask_code)  │
//!                         │ (scout serve) │          └─────────────┘
//!                         └───────────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. The **scanner** ([`scan`]) walks a repository root and keeps text
//!    files that pass the extension, glob, and binary filters.
//! 2. The **chunker** ([`chunk`]) decodes each file and emits overlapping
//!    line windows with deterministic identities.
//! 3. The **classifier** ([`classify`]) buckets each file as `code` or
//!    `docs` from path hints and extensions.
//! 4. The **embedder** ([`embedding`]) vectorizes chunks per bucket over
//!    HTTP with batching and retry/backoff.
//! 5. The **vector store client** ([`qdrant`]) manages the split
//!    collections and performs idempotent upserts and filtered search.
//! 6. The **indexer** ([`index_cmd`]) orchestrates the full pipeline and
//!    enforces the file-coverage gate.
//! 7. The **search/ask surfaces** ([`search_cmd`]) answer queries directly
//!    from the store or through the external tool server.
//! 8. The **agent** ([`agent`], [`server`]) exposes the whole thing as a
//!    bidirectional stdio protocol with sessions, cancellation, streaming,
//!    and slash commands, owning one MCP [`bridge`] per session.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | Precedence-based config resolution (args → env → defaults) |
//! | [`scan`] | Filtered depth-first repository traversal |
//! | [`chunk`] | Line-window chunking with stable chunk/point identities |
//! | [`classify`] | `code` vs `docs` content-type classification |
//! | [`embedding`] | Batched HTTP embeddings with retry/backoff |
//! | [`qdrant`] | Vector store REST client (collections, upsert, search) |
//! | [`index_cmd`] | Indexing pipeline orchestration and report |
//! | [`search_cmd`] | Semantic search and tool-server ask surfaces |
//! | [`bridge`] | Long-lived MCP child process (JSON-RPC over stdio) |
//! | [`protocol`] | Agent control protocol wire types |
//! | [`agent`] | Session management, slash commands, prompt streaming |
//! | [`server`] | ACP stdio serving loop |
//! | [`profiles`] | TOML model profiles for LLM runtime hot-swap |
//! | [`paragraph`] | Paragraph chunker for streamed answers |

pub mod agent;
pub mod bridge;
pub mod chunk;
pub mod classify;
pub mod config;
pub mod embedding;
pub mod index_cmd;
pub mod paragraph;
pub mod profiles;
pub mod protocol;
pub mod qdrant;
pub mod scan;
pub mod search_cmd;
pub mod server;

#[cfg(test)]
pub(crate) mod testutil;
