use anyhow::Result;
use std::io::Write;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

use heuristic_mcp::config::ENV_PREFIX;
use heuristic_mcp::embedder::FastTextEmbedder;
use heuristic_mcp::error::EngineError;
use heuristic_mcp::state::Engine;
use heuristic_mcp::subprocess;
use heuristic_mcp::tools::{self, ToolRequest, ToolResult};

#[tokio::main]
async fn main() -> Result<()> {
    // Child mode: one embedding batch over stdio, then exit. No logging
    // setup; stdout is the protocol channel.
    if std::env::args().nth(1).as_deref() == Some("embed-worker") {
        let model = std::env::var(format!("{ENV_PREFIX}EMBEDDING_MODEL"))
            .unwrap_or_else(|_| "Qwen/Qwen3-Embedding-0.6B".to_string());
        let embedder = FastTextEmbedder::new(model);
        return subprocess::run_embed_worker(&embedder).map_err(Into::into);
    }

    let workspace_root = std::env::var(format!("{ENV_PREFIX}SEARCH_DIRECTORY"))
        .map(std::path::PathBuf::from)
        .or_else(|_| std::env::current_dir())?;

    let _log_guard = init_tracing(&workspace_root);

    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic| {
        let location = panic
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_default();
        error!(target: "heuristic_mcp::panic", location = %location, "PANIC: thread panicked");
        default_panic(panic);
    }));

    let engine = match Engine::new(&workspace_root).await {
        Ok(engine) => engine,
        Err(EngineError::WorkspaceLocked { pid, workspace }) => {
            // Another live server owns this workspace; defer to it.
            info!(pid, workspace = %workspace, "Workspace already served by another process, exiting");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    info!(tools = ?tools::tool_names(), "Serving tool calls on stdin");
    serve_stdio(&engine).await;

    engine.shutdown().await;
    info!("heuristic-mcp shutdown complete");
    Ok(())
}

/// Newline-delimited JSON tool calls on stdin, one JSON result per line on
/// stdout. Transport framing beyond that is the MCP host's concern.
async fn serve_stdio(engine: &Arc<Engine>) {
    use tokio::io::{AsyncBufReadExt, BufReader};

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = shutdown_signal() => {
                info!("Shutdown signal received");
                break;
            }
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "stdin read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let result = match serde_json::from_str::<ToolRequest>(&line) {
            Ok(request) => tools::dispatch(engine, request).await,
            Err(e) => ToolResult::error(format!("Malformed tool request: {e}")),
        };
        match serde_json::to_string(&result) {
            Ok(json) => {
                let mut stdout = std::io::stdout().lock();
                let _ = writeln!(stdout, "{json}");
                let _ = stdout.flush();
            }
            Err(e) => warn!(error = %e, "Failed to serialize tool result"),
        }
    }
}

fn init_tracing(workspace_root: &std::path::Path) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let config = heuristic_mcp::config::Config::load(workspace_root).ok();
    let verbose = config.as_ref().map(|c| c.verbose).unwrap_or(false);

    let default_filter = if verbose {
        "heuristic_mcp=debug"
    } else {
        "heuristic_mcp=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    // stderr layer; stdout carries tool results.
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact();

    let log_dir = config
        .map(|c| c.resolve_cache_dir().join("logs"))
        .unwrap_or_else(|| std::path::PathBuf::from(".heuristic-cache/logs"));
    std::fs::create_dir_all(&log_dir).ok();

    let file_appender = tracing_appender::rolling::never(&log_dir, "server.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(false)
        .with_writer(non_blocking)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    Some(guard)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
