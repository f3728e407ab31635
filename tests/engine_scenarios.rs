//! End-to-end scenarios over the indexing and retrieval engine, using the
//! deterministic hash embedder and the exact-scan ANN stub so no model
//! download is required.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use heuristic_mcp::ann::{AnnBackend, AnnParams, StubAnn};
use heuristic_mcp::cache::{Cache, CacheSettings};
use heuristic_mcp::config::{Config, VectorStoreFormat};
use heuristic_mcp::embedder::{HashEmbedder, TextEmbedder};
use heuristic_mcp::indexer::{IndexOutcome, Indexer, Workspace};
use heuristic_mcp::search::{self, SearchRequest};
use heuristic_mcp::store::{CachePaths, StoreTelemetry};
use heuristic_mcp::watcher::{FileEvent, FileEventKind};
use heuristic_mcp::worker_pool::{EmbedderFactory, WorkerPool};
use tempfile::TempDir;

fn test_config(root: &Path, cache_dir: &Path) -> Config {
    Config {
        search_directory: root.to_path_buf(),
        cache_directory: Some(cache_dir.to_path_buf()),
        embedding_model: "hash-projection-test".into(),
        batch_size: 2,
        save_every_n: 2,
        watch_files: false,
        chunk_size: 32,
        ..Config::default()
    }
}

fn build_workspace(config: Config) -> Workspace {
    let config = Arc::new(config);
    let settings = CacheSettings {
        embedding_model: config.embedding_model.clone(),
        vector_store_format: config.vector_store_format,
        enable_cache: config.enable_cache,
        ann_enabled: config.ann_enabled,
        ann_min_chunks: config.ann_min_chunks,
        ann_index_cache: config.ann_index_cache,
        ann_params: AnnParams::from_config(&config),
    };
    let cache = Arc::new(Cache::with_ann_factory(
        CachePaths::new(config.cache_directory.clone().unwrap()),
        Vec::new(),
        settings,
        Box::new(|_, _| Ok(Box::new(StubAnn::new()) as Box<dyn AnnBackend>)),
    ));
    let embedder: Arc<dyn TextEmbedder> = Arc::new(HashEmbedder::default());
    let factory: EmbedderFactory =
        Arc::new(|| Arc::new(HashEmbedder::default()) as Arc<dyn TextEmbedder>);
    let pool = Arc::new(WorkerPool::new(1, factory, Arc::clone(&embedder)));
    Workspace {
        config,
        cache,
        pool,
        embedder,
    }
}

fn write_file(root: &Path, name: &str, content: &str) -> PathBuf {
    let path = root.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

fn summary(outcome: IndexOutcome) -> heuristic_mcp::indexer::IndexSummary {
    match outcome {
        IndexOutcome::Done(summary) => summary,
        IndexOutcome::Skipped { reason } => panic!("unexpected skip: {reason}"),
    }
}

// ---------------------------------------------------------------------------
// S1: fresh index
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s1_fresh_index_two_files() {
    let root = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    write_file(root.path(), "a.js", "export function greet(){return 'hi'}");
    write_file(root.path(), "b.js", "console.log('bye')");

    let indexer = Arc::new(Indexer::new(build_workspace(test_config(
        root.path(),
        cache_dir.path(),
    ))));
    let s = summary(indexer.index_all(false).await.unwrap());
    assert_eq!(s.files_indexed, 2);
    assert_eq!(s.chunks_added, 2);

    let ws = indexer.workspace();
    assert_eq!(ws.cache.store_len(), 2);
    assert_eq!(ws.cache.file_hashes_snapshot().len(), 2);

    let meta = ws.cache.meta_snapshot();
    assert_eq!(meta.files_indexed, 2);
    assert_eq!(meta.chunks_stored, 2);

    let progress = heuristic_mcp::progress::ProgressWriter::read(
        &cache_dir.path().join("progress.json"),
    )
    .unwrap();
    assert_eq!((progress.progress, progress.total), (2, 2));
}

// ---------------------------------------------------------------------------
// S2: incremental change re-embeds exactly one file
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s2_incremental_change() {
    let root = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    let a = write_file(root.path(), "a.js", "export function greet(){return 'hi'}");
    let b = write_file(root.path(), "b.js", "console.log('bye')");

    let indexer = Arc::new(Indexer::new(build_workspace(test_config(
        root.path(),
        cache_dir.path(),
    ))));
    indexer.index_all(false).await.unwrap();

    let ws = indexer.workspace();
    let b_hash_before = ws.cache.file_hash(&b.to_string_lossy()).unwrap();
    let a_chunk_before: Vec<String> = ws.cache.with_store(|store| {
        store
            .iter()
            .filter(|c| c.file.ends_with("a.js"))
            .map(|c| c.content.clone())
            .collect()
    });

    write_file(
        root.path(),
        "a.js",
        "export function greet(name){return 'hi '+name}",
    );
    let s = summary(indexer.index_all(false).await.unwrap());
    assert_eq!(s.files_indexed, 1);
    assert_eq!(s.files_unchanged, 1);

    assert_eq!(
        ws.cache.file_hash(&b.to_string_lossy()).unwrap(),
        b_hash_before
    );
    let a_hash_after = ws.cache.file_hash(&a.to_string_lossy()).unwrap();
    assert_eq!(
        a_hash_after,
        heuristic_mcp::hasher::content_hash(
            "export function greet(name){return 'hi '+name}".as_bytes()
        )
    );
    let a_chunk_after: Vec<String> = ws.cache.with_store(|store| {
        store
            .iter()
            .filter(|c| c.file.ends_with("a.js"))
            .map(|c| c.content.clone())
            .collect()
    });
    assert_ne!(a_chunk_before, a_chunk_after);
    assert_eq!(ws.cache.store_len(), 2);
}

// ---------------------------------------------------------------------------
// S3: unlink removes chunks, hash, and search hits
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s3_unlink_removes_file_from_index_and_search() {
    let root = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    write_file(root.path(), "a.js", "export function greet(){return 'hi'}");
    let b = write_file(root.path(), "b.js", "console.log('bye')");

    let indexer = Arc::new(Indexer::new(build_workspace(test_config(
        root.path(),
        cache_dir.path(),
    ))));
    indexer.index_all(false).await.unwrap();

    std::fs::remove_file(&b).unwrap();
    let s = summary(
        indexer
            .index_files(vec![FileEvent {
                path: b.clone(),
                kind: FileEventKind::Unlink,
            }])
            .await
            .unwrap(),
    );
    assert_eq!(s.files_removed, 1);

    let ws = indexer.workspace();
    assert!(ws.cache.file_hash(&b.to_string_lossy()).is_none());

    let response = search::search(
        &ws,
        &SearchRequest {
            query: "console log bye".into(),
            min_similarity: Some(0.0),
            ..SearchRequest::default()
        },
    )
    .await
    .unwrap();
    assert!(response.hits.iter().all(|hit| hit.file.ends_with("a.js")));
}

// ---------------------------------------------------------------------------
// S4: search formatting and ranking
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s4_search_returns_formatted_top_hit() {
    let root = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    let a = write_file(root.path(), "a.js", "export function greet(){return 'hi'}");
    write_file(root.path(), "b.js", "console.log('bye')");

    let indexer = Arc::new(Indexer::new(build_workspace(test_config(
        root.path(),
        cache_dir.path(),
    ))));
    indexer.index_all(false).await.unwrap();

    let ws = indexer.workspace();
    let response = search::search(
        &ws,
        &SearchRequest {
            query: "greet user".into(),
            max_results: Some(3),
            min_similarity: Some(0.1),
            ..SearchRequest::default()
        },
    )
    .await
    .unwrap();

    assert!(!response.hits.is_empty());
    let top = &response.hits[0];
    assert!(top.file.ends_with("a.js"));
    assert_eq!(top.start_line, 1);
    assert!(top.score > 0.1);

    let formatted = response.formatted();
    assert!(formatted.contains("Result 1"));
    assert!(formatted.contains(&a.to_string_lossy().to_string()));
}

// ---------------------------------------------------------------------------
// S5: clear() rejected while indexing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s5_concurrent_clear_rejected() {
    let root = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    for i in 0..120 {
        let body = (0..8)
            .map(|j| format!("export const value_{i}_{j} = compute({i}, {j});"))
            .collect::<Vec<_>>()
            .join("\n");
        write_file(root.path(), &format!("file_{i}.js"), &body);
    }

    let mut config = test_config(root.path(), cache_dir.path());
    config.save_every_n = 50;
    let indexer = Arc::new(Indexer::new(build_workspace(config)));
    let ws = indexer.workspace();

    let run = {
        let indexer = Arc::clone(&indexer);
        tokio::spawn(async move { indexer.index_all(true).await })
    };

    // Wait until the run claims the indexing flag, then try to clear.
    let mut attempts = 0;
    while !indexer.is_indexing() && attempts < 500 {
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        attempts += 1;
    }
    assert!(indexer.is_indexing(), "indexing never started");

    let err = ws.cache.clear().unwrap_err();
    assert!(err.to_string().contains("indexing is in progress"));

    let s = summary(run.await.unwrap().unwrap());
    assert!(s.files_indexed > 0);
    assert!(ws.cache.store_len() > 0);
}

// ---------------------------------------------------------------------------
// S6: crash-injected save leaves the prior artifact set valid
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s6_atomic_save_under_crash() {
    let root = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    write_file(root.path(), "a.js", "export function greet(){return 'hi'}");

    let indexer = Arc::new(Indexer::new(build_workspace(test_config(
        root.path(),
        cache_dir.path(),
    ))));
    indexer.index_all(false).await.unwrap();

    let meta_before = std::fs::read(cache_dir.path().join("meta.json")).unwrap();
    let embeddings_before = std::fs::read(cache_dir.path().join("embeddings.json")).unwrap();

    // Crash between temp write and rename.
    let mut telemetry = StoreTelemetry::load(&cache_dir.path().join("binary-store-telemetry.json"));
    let result = heuristic_mcp::store::atomic_replace_many_with(
        vec![
            (cache_dir.path().join("meta.json"), b"{\"torn\": true}".to_vec()),
            (
                cache_dir.path().join("embeddings.json"),
                b"[\"torn\"]".to_vec(),
            ),
        ],
        &mut telemetry,
        |_| Err(std::io::Error::other("injected crash")),
    );
    assert!(result.is_err());
    telemetry.persist(&cache_dir.path().join("binary-store-telemetry.json"));

    assert_eq!(
        std::fs::read(cache_dir.path().join("meta.json")).unwrap(),
        meta_before
    );
    assert_eq!(
        std::fs::read(cache_dir.path().join("embeddings.json")).unwrap(),
        embeddings_before
    );

    let telemetry = StoreTelemetry::load(&cache_dir.path().join("binary-store-telemetry.json"));
    assert!(telemetry.atomic_replace_failures >= 1);
    assert!(telemetry.rollback_count >= 1);

    // A fresh engine still loads the prior valid state.
    let reopened = build_workspace(test_config(root.path(), cache_dir.path()));
    reopened.cache.load().await.unwrap();
    assert_eq!(reopened.cache.store_len(), 1);
}

// ---------------------------------------------------------------------------
// Quantified properties
// ---------------------------------------------------------------------------

#[tokio::test]
async fn all_stored_vectors_are_unit_norm() {
    let root = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    for i in 0..10 {
        write_file(
            root.path(),
            &format!("mod_{i}.js"),
            &format!("export function handler_{i}(input) {{ return input + {i}; }}"),
        );
    }

    let indexer = Arc::new(Indexer::new(build_workspace(test_config(
        root.path(),
        cache_dir.path(),
    ))));
    indexer.index_all(false).await.unwrap();

    indexer.workspace().cache.with_store(|store| {
        assert!(!store.is_empty());
        for chunk in store {
            let norm = chunk.vector.iter().map(|x| x * x).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-4, "norm was {norm}");
        }
    });
}

#[tokio::test]
async fn file_hashes_match_disk_after_save() {
    let root = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    write_file(root.path(), "a.js", "export function greet(){return 'hi'}");
    write_file(root.path(), "b.js", "console.log('bye')");

    let indexer = Arc::new(Indexer::new(build_workspace(test_config(
        root.path(),
        cache_dir.path(),
    ))));
    indexer.index_all(false).await.unwrap();

    let ws = indexer.workspace();
    for chunk_file in ws.cache.with_store(|store| {
        store.iter().map(|c| c.file.clone()).collect::<Vec<_>>()
    }) {
        let on_disk = heuristic_mcp::hasher::hash_file(Path::new(&chunk_file)).unwrap();
        assert_eq!(ws.cache.file_hash(&chunk_file).unwrap(), on_disk);
    }
}

#[tokio::test]
async fn reindex_without_changes_embeds_nothing() {
    let root = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    write_file(root.path(), "a.js", "export function greet(){return 'hi'}");
    write_file(root.path(), "b.js", "console.log('bye')");

    let indexer = Arc::new(Indexer::new(build_workspace(test_config(
        root.path(),
        cache_dir.path(),
    ))));
    indexer.index_all(false).await.unwrap();

    let s = summary(indexer.index_all(false).await.unwrap());
    assert_eq!(s.batches_embedded, 0);
    assert_eq!(s.files_indexed, 0);
}

#[tokio::test]
async fn load_reproduces_saved_state() {
    let root = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    write_file(root.path(), "a.js", "export function greet(){return 'hi'}");
    write_file(root.path(), "b.js", "console.log('bye')");

    let indexer = Arc::new(Indexer::new(build_workspace(test_config(
        root.path(),
        cache_dir.path(),
    ))));
    indexer.index_all(true).await.unwrap();

    let ws = indexer.workspace();
    let store_before = ws.cache.with_store(|store| store.to_vec());
    let hashes_before = ws.cache.file_hashes_snapshot();

    let reopened = build_workspace(test_config(root.path(), cache_dir.path()));
    reopened.cache.load().await.unwrap();
    let store_after = reopened.cache.with_store(|store| store.to_vec());
    assert_eq!(store_before, store_after);
    assert_eq!(hashes_before, reopened.cache.file_hashes_snapshot());
    let meta = reopened.cache.meta_snapshot();
    assert_eq!(meta.chunks_stored, store_after.len());
}

#[tokio::test]
async fn unlink_then_identical_add_restores_content() {
    let root = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    let content = "export function greet(){return 'hi'}";
    let a = write_file(root.path(), "a.js", content);

    let indexer = Arc::new(Indexer::new(build_workspace(test_config(
        root.path(),
        cache_dir.path(),
    ))));
    indexer.index_all(false).await.unwrap();
    let ws = indexer.workspace();
    let before: Vec<(String, String)> = ws.cache.with_store(|store| {
        store
            .iter()
            .map(|c| (c.file.clone(), c.content.clone()))
            .collect()
    });

    std::fs::remove_file(&a).unwrap();
    indexer
        .index_files(vec![FileEvent {
            path: a.clone(),
            kind: FileEventKind::Unlink,
        }])
        .await
        .unwrap();
    assert_eq!(ws.cache.store_len(), 0);

    write_file(root.path(), "a.js", content);
    indexer
        .index_files(vec![FileEvent {
            path: a.clone(),
            kind: FileEventKind::Add,
        }])
        .await
        .unwrap();

    let after: Vec<(String, String)> = ws.cache.with_store(|store| {
        store
            .iter()
            .map(|c| (c.file.clone(), c.content.clone()))
            .collect()
    });
    assert_eq!(before, after);
}

#[tokio::test]
async fn ann_results_agree_with_exact_scan_on_small_corpus() {
    let root = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    for i in 0..20 {
        write_file(
            root.path(),
            &format!("mod_{i}.js"),
            &format!("export function feature_{i}(arg) {{ return arg * {i}; }}"),
        );
    }

    // ANN eligible from the first chunk.
    let mut config = test_config(root.path(), cache_dir.path());
    config.ann_min_chunks = 1;
    let indexer = Arc::new(Indexer::new(build_workspace(config.clone())));
    indexer.index_all(false).await.unwrap();
    let ws = indexer.workspace();
    ws.cache.ensure_ann_index().await.unwrap();

    let request = SearchRequest {
        query: "feature_7 arg".into(),
        max_results: Some(3),
        min_similarity: Some(0.0),
        ..SearchRequest::default()
    };
    let with_ann = search::search(&ws, &request).await.unwrap();

    let mut no_ann_config = config;
    no_ann_config.ann_enabled = false;
    let exact_ws = build_workspace(no_ann_config);
    exact_ws.cache.load().await.unwrap();
    let exact = search::search(&exact_ws, &request).await.unwrap();

    let ann_files: Vec<&String> = with_ann.hits.iter().map(|h| &h.file).collect();
    let exact_files: Vec<&String> = exact.hits.iter().map(|h| &h.file).collect();
    assert_eq!(ann_files, exact_files);
}

#[tokio::test]
async fn ann_candidates_are_distinct_store_indices() {
    let root = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    for i in 0..15 {
        write_file(
            root.path(),
            &format!("mod_{i}.js"),
            &format!("export const item_{i} = {i};"),
        );
    }
    let mut config = test_config(root.path(), cache_dir.path());
    config.ann_min_chunks = 1;
    let indexer = Arc::new(Indexer::new(build_workspace(config)));
    indexer.index_all(false).await.unwrap();
    let ws = indexer.workspace();

    // The pipeline kicks off a background build; wait until a query lands.
    let query = ws.embedder.embed(&["item_3".to_string()]).unwrap().remove(0);
    let mut matches = None;
    for _ in 0..200 {
        ws.cache.ensure_ann_index().await.unwrap();
        matches = ws.cache.query_ann(&query, 5);
        if matches.is_some() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    let matches = matches.expect("ANN index never became queryable");
    assert!(matches.len() <= 5);
    let store_len = ws.cache.store_len();
    let mut seen = std::collections::HashSet::new();
    for (index, _) in matches {
        assert!(index < store_len);
        assert!(seen.insert(index));
    }
}

// ---------------------------------------------------------------------------
// FindSimilar
// ---------------------------------------------------------------------------

#[tokio::test]
async fn find_similar_suppresses_exact_duplicates() {
    let root = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    let content = "export function greet(){return 'hi'}";
    write_file(root.path(), "a.js", content);
    write_file(
        root.path(),
        "c.js",
        "export function greetPerson(){return 'hello'}",
    );

    let indexer = Arc::new(Indexer::new(build_workspace(test_config(
        root.path(),
        cache_dir.path(),
    ))));
    indexer.index_all(false).await.unwrap();

    let ws = indexer.workspace();
    let response = search::find_similar(
        &ws,
        &SearchRequest {
            query: content.to_string(),
            min_similarity: Some(0.0),
            ..SearchRequest::default()
        },
    )
    .await
    .unwrap();

    // The exact duplicate chunk (a.js) is suppressed; the near-duplicate
    // survives.
    assert!(response.hits.iter().all(|hit| !hit.file.ends_with("a.js")));
    assert!(response.hits.iter().any(|hit| hit.file.ends_with("c.js")));
}

#[tokio::test]
async fn find_similar_truncates_oversized_snippets_with_warning() {
    let root = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    write_file(root.path(), "a.js", "export function greet(){return 'hi'}");

    let indexer = Arc::new(Indexer::new(build_workspace(test_config(
        root.path(),
        cache_dir.path(),
    ))));
    indexer.index_all(false).await.unwrap();

    let ws = indexer.workspace();
    let huge_snippet = (0..400)
        .map(|i| format!("const filler_value_{i} = compute_everything({i});"))
        .collect::<Vec<_>>()
        .join("\n");
    let response = search::find_similar(
        &ws,
        &SearchRequest {
            query: huge_snippet,
            min_similarity: Some(0.0),
            ..SearchRequest::default()
        },
    )
    .await
    .unwrap();
    assert!(response.message.contains("truncated"));
}

// ---------------------------------------------------------------------------
// Boundary behaviors
// ---------------------------------------------------------------------------

#[tokio::test]
async fn file_at_size_limit_indexed_one_over_skipped() {
    let root = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    let mut config = test_config(root.path(), cache_dir.path());
    config.max_file_size = 40;

    write_file(root.path(), "exact.js", &"a".repeat(40));
    write_file(root.path(), "over.js", &"b".repeat(41));

    let indexer = Arc::new(Indexer::new(build_workspace(config)));
    indexer.index_all(false).await.unwrap();

    let ws = indexer.workspace();
    let files: Vec<String> =
        ws.cache.with_store(|store| store.iter().map(|c| c.file.clone()).collect());
    assert!(files.iter().any(|f| f.ends_with("exact.js")));
    assert!(files.iter().all(|f| !f.ends_with("over.js")));
}

#[tokio::test]
async fn below_ann_threshold_queries_fall_back_to_exact_scan() {
    let root = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    write_file(root.path(), "a.js", "export function greet(){return 'hi'}");

    let indexer = Arc::new(Indexer::new(build_workspace(test_config(
        root.path(),
        cache_dir.path(),
    ))));
    indexer.index_all(false).await.unwrap();

    let ws = indexer.workspace();
    // Default annMinChunks (5000) far exceeds the store; ANN must decline.
    let query = ws.embedder.embed(&["greet".to_string()]).unwrap().remove(0);
    assert!(ws.cache.query_ann(&query, 5).is_none());

    // Search still works through the exact path.
    let response = search::search(
        &ws,
        &SearchRequest {
            query: "greet".into(),
            min_similarity: Some(0.0),
            ..SearchRequest::default()
        },
    )
    .await
    .unwrap();
    assert!(!response.hits.is_empty());
}

#[tokio::test]
async fn call_graph_edges_persist_across_reload() {
    let root = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    write_file(
        root.path(),
        "app.js",
        "import { greet } from './greeter';\ngreet();",
    );
    write_file(
        root.path(),
        "greeter.js",
        "export function greet(){return 'hi'}",
    );

    let indexer = Arc::new(Indexer::new(build_workspace(test_config(
        root.path(),
        cache_dir.path(),
    ))));
    indexer.index_all(false).await.unwrap();

    let ws = indexer.workspace();
    let graph = ws.cache.call_graph_snapshot();
    let app = root.path().join("app.js").to_string_lossy().to_string();
    let greeter = root.path().join("greeter.js").to_string_lossy().to_string();
    assert!(graph.nodes.get(&app).unwrap().calls_to.contains(&greeter));
    assert!(graph.nodes.get(&greeter).unwrap().called_by.contains(&app));

    let reopened = build_workspace(test_config(root.path(), cache_dir.path()));
    reopened.cache.load().await.unwrap();
    let graph = reopened.cache.call_graph_snapshot();
    assert!(graph.nodes.get(&app).unwrap().calls_to.contains(&greeter));
}
