//! Tool surface: a compile-time dispatch table of `(name, tool)` pairs over
//! a tagged request. Results are MCP-shaped (`content` blocks plus an
//! `isError` flag) and no error crosses this boundary as a panic.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::EngineResult;
use crate::indexer::IndexOutcome;
use crate::search::{self, SearchRequest};
use crate::state::Engine;

#[derive(Debug, Clone, Deserialize)]
pub struct ToolRequest {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolContent {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolResult {
    pub content: Vec<ToolContent>,
    #[serde(rename = "isError", skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl ToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent {
                kind: "text",
                text: text.into(),
            }],
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent {
                kind: "text",
                text: text.into(),
            }],
            is_error: true,
        }
    }

    fn from_result(result: EngineResult<String>) -> Self {
        match result {
            Ok(text) => Self::text(text),
            Err(e) => Self::error(format!("Error ({}): {e}", e.kind())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tool {
    SemanticSearch,
    IndexCodebase,
    ClearCache,
    FindSimilarCode,
    CheckPackageVersion,
    SetWorkspace,
    AnnConfig,
}

/// The dispatch table. Order matches the tool listing shown to clients.
const DISPATCH: &[(&str, Tool)] = &[
    ("a_semantic_search", Tool::SemanticSearch),
    ("b_index_codebase", Tool::IndexCodebase),
    ("c_clear_cache", Tool::ClearCache),
    ("d_find_similar_code", Tool::FindSimilarCode),
    ("e_check_package_version", Tool::CheckPackageVersion),
    ("f_set_workspace", Tool::SetWorkspace),
    ("ann_config", Tool::AnnConfig),
];

pub fn tool_names() -> Vec<&'static str> {
    DISPATCH.iter().map(|(name, _)| *name).collect()
}

/// Route one tool call. Unknown names and handler failures come back as
/// `isError` results, never as errors to the transport.
pub async fn dispatch(engine: &Arc<Engine>, request: ToolRequest) -> ToolResult {
    let Some((_, tool)) = DISPATCH.iter().find(|(name, _)| *name == request.name) else {
        return ToolResult::error(format!("Unknown tool: {}", request.name));
    };

    match tool {
        Tool::SemanticSearch => semantic_search(engine, request.arguments).await,
        Tool::IndexCodebase => index_codebase(engine, request.arguments).await,
        Tool::ClearCache => clear_cache(engine),
        Tool::FindSimilarCode => find_similar_code(engine, request.arguments).await,
        Tool::CheckPackageVersion => {
            ToolResult::error("e_check_package_version is not available in this build")
        }
        Tool::SetWorkspace => set_workspace(engine, request.arguments).await,
        Tool::AnnConfig => ann_config(engine, request.arguments).await,
    }
}

fn search_request_from(args: &serde_json::Value, query_key: &str) -> Option<SearchRequest> {
    let query = args.get(query_key)?.as_str()?.to_string();
    Some(SearchRequest {
        query,
        max_results: args
            .get("maxResults")
            .and_then(|v| v.as_u64())
            .map(|v| (v as usize).min(1000)),
        min_similarity: args
            .get("minSimilarity")
            .and_then(|v| v.as_f64())
            .map(|v| v as f32),
        include_files: string_list(args.get("includeFiles")),
        exclude_files: string_list(args.get("excludeFiles")),
        languages: string_list(args.get("languages")),
    })
}

fn string_list(value: Option<&serde_json::Value>) -> Option<Vec<String>> {
    value.and_then(|v| v.as_array()).map(|items| {
        items
            .iter()
            .filter_map(|item| item.as_str().map(|s| s.to_string()))
            .collect()
    })
}

async fn semantic_search(engine: &Arc<Engine>, args: serde_json::Value) -> ToolResult {
    let Some(request) = search_request_from(&args, "query") else {
        return ToolResult::error("a_semantic_search requires a string \"query\"");
    };
    let ws = engine.indexer.workspace();
    ToolResult::from_result(
        search::search(&ws, &request)
            .await
            .map(|response| response.formatted()),
    )
}

async fn find_similar_code(engine: &Arc<Engine>, args: serde_json::Value) -> ToolResult {
    let Some(request) = search_request_from(&args, "code") else {
        return ToolResult::error("d_find_similar_code requires a string \"code\"");
    };
    let ws = engine.indexer.workspace();
    ToolResult::from_result(
        search::find_similar(&ws, &request)
            .await
            .map(|response| response.formatted()),
    )
}

/// Indexing is fire-and-forget relative to the tool call; a concurrent
/// caller is told it was skipped.
async fn index_codebase(engine: &Arc<Engine>, args: serde_json::Value) -> ToolResult {
    let force = args
        .get("force")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    if engine.indexer.is_indexing() {
        return ToolResult::text("Indexing skipped: indexing is already in progress");
    }

    let indexer = Arc::clone(&engine.indexer);
    tokio::spawn(async move {
        match indexer.index_all(force).await {
            Ok(IndexOutcome::Done(summary)) => info!(
                files = summary.files_indexed,
                chunks = summary.chunks_added,
                duration_ms = summary.duration_ms,
                "Background indexing finished"
            ),
            Ok(IndexOutcome::Skipped { reason }) => {
                info!(reason = %reason, "Background indexing skipped")
            }
            Err(e) => warn!(error = %e, "Background indexing failed"),
        }
    });
    ToolResult::text(if force {
        "Indexing started (force)"
    } else {
        "Indexing started"
    })
}

fn clear_cache(engine: &Arc<Engine>) -> ToolResult {
    let ws = engine.indexer.workspace();
    match ws.cache.clear() {
        Ok(()) => ToolResult::text("Cache cleared"),
        Err(e) => ToolResult::error(format!("Error ({}): {e}", e.kind())),
    }
}

async fn set_workspace(engine: &Arc<Engine>, args: serde_json::Value) -> ToolResult {
    let Some(path) = args.get("workspacePath").and_then(|v| v.as_str()) else {
        return ToolResult::error("f_set_workspace requires a string \"workspacePath\"");
    };
    let reindex = args
        .get("reindex")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    ToolResult::from_result(
        engine
            .set_workspace(std::path::Path::new(path), reindex)
            .await,
    )
}

async fn ann_config(engine: &Arc<Engine>, args: serde_json::Value) -> ToolResult {
    let action = args.get("action").and_then(|v| v.as_str()).unwrap_or("");
    let ws = engine.indexer.workspace();
    match action {
        "stats" => {
            let stats = ws.cache.ann_stats();
            match serde_json::to_string_pretty(&stats) {
                Ok(json) => ToolResult::text(json),
                Err(e) => ToolResult::error(format!("Error: {e}")),
            }
        }
        "set_ef_search" => {
            let Some(ef) = args.get("efSearch").and_then(|v| v.as_u64()) else {
                return ToolResult::error("set_ef_search requires a numeric \"efSearch\"");
            };
            let ef = (ef as usize).clamp(1, 4096);
            ws.cache.set_ef_search(ef);
            ToolResult::text(format!("efSearch set to {ef}"))
        }
        "rebuild" => {
            ws.cache.invalidate_ann_index();
            match ws.cache.ensure_ann_index().await {
                Ok(()) => {
                    let stats = ws.cache.ann_stats();
                    if stats.built {
                        ToolResult::text(format!(
                            "ANN index rebuilt ({} vectors)",
                            stats.indexed_vectors
                        ))
                    } else {
                        ToolResult::text(format!(
                            "ANN index not built: store has {} chunks, minimum is {}",
                            stats.store_size, stats.min_chunks
                        ))
                    }
                }
                Err(e) => ToolResult::error(format!("Error ({}): {e}", e.kind())),
            }
        }
        other => ToolResult::error(format!(
            "ann_config action must be stats | set_ef_search | rebuild, got \"{other}\""
        )),
    }
}
