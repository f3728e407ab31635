//! heuristic-mcp: per-workspace semantic code search engine for MCP IDE
//! assistants. The library exposes the indexing and retrieval core; the
//! binary wires it to a stdio tool-call loop.

pub mod ann;
pub mod cache;
pub mod callgraph;
pub mod chunker;
pub mod config;
pub mod embedder;
pub mod error;
pub mod hasher;
pub mod indexer;
pub mod lang;
pub mod lock;
pub mod progress;
pub mod search;
pub mod state;
pub mod store;
pub mod subprocess;
pub mod tools;
pub mod watcher;
pub mod worker_pool;
