//! Hybrid search: dense similarity + lexical token hits + recency +
//! call-graph proximity, over ANN candidates with an exact-scan fallback.
//!
//! Scoring runs in cooperative batches so tool calls stay responsive while
//! indexing works in the background.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::debug;

use crate::chunker::{self, ChunkPolicy};
use crate::config::{MAX_FULL_SCAN_SIZE, MAX_SEARCH_QUERY_LENGTH};
use crate::error::{EngineError, EngineResult};
use crate::indexer::Workspace;

/// Candidates scored between cooperative yields.
const SCORE_BATCH: usize = 500;

/// Similarity floor applied when the caller does not set one.
const DEFAULT_MIN_SIMILARITY: f32 = 0.1;

#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub query: String,
    pub max_results: Option<usize>,
    pub min_similarity: Option<f32>,
    pub include_files: Option<Vec<String>>,
    pub exclude_files: Option<Vec<String>>,
    pub languages: Option<Vec<String>>,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub file: String,
    pub start_line: u32,
    pub end_line: u32,
    pub score: f32,
    pub language: &'static str,
    pub content: String,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub hits: Vec<SearchHit>,
    pub message: String,
}

impl SearchResponse {
    /// Human-readable rendering used in tool results.
    pub fn formatted(&self) -> String {
        if self.hits.is_empty() {
            return self.message.clone();
        }
        let mut out = String::with_capacity(256 * self.hits.len());
        out.push_str(&self.message);
        for (rank, hit) in self.hits.iter().enumerate() {
            out.push_str(&format!(
                "\n\nResult {}\n{}:{}-{} (similarity {:.3}, {})\n{}",
                rank + 1,
                hit.file,
                hit.start_line,
                hit.end_line,
                hit.score,
                hit.language,
                hit.content
            ));
        }
        out
    }
}

struct Candidate {
    index: usize,
    dense: f32,
    lex: f32,
}

/// Hybrid search over the current workspace index.
pub async fn search(ws: &Workspace, request: &SearchRequest) -> EngineResult<SearchResponse> {
    let query = request.query.trim();
    if query.is_empty() {
        return Err(EngineError::ConfigInvalid(
            "search query must not be empty".into(),
        ));
    }
    if query.len() > MAX_SEARCH_QUERY_LENGTH {
        return Err(EngineError::ConfigInvalid(format!(
            "search query too long ({} chars, max {MAX_SEARCH_QUERY_LENGTH})",
            query.len()
        )));
    }

    ws.cache.load().await?;
    if ws.cache.store_len() == 0 {
        return Ok(SearchResponse {
            hits: Vec::new(),
            message: "No results: the index is empty. Run b_index_codebase first.".into(),
        });
    }

    let query_vector = embed_query(ws, query.to_string()).await?;
    let tokens = lex_tokens(query);

    let response = run_scored_query(ws, request, &query_vector, &tokens, None).await?;

    if ws.config.unload_model_after_search {
        ws.embedder.unload();
    }
    Ok(response)
}

/// Find code similar to a snippet. The snippet is truncated to its first
/// chunk when it exceeds the model budget, and exact duplicates of the
/// input are suppressed.
pub async fn find_similar(ws: &Workspace, request: &SearchRequest) -> EngineResult<SearchResponse> {
    let code = request.query.as_str();
    if code.trim().is_empty() {
        return Err(EngineError::ConfigInvalid(
            "code snippet must not be empty".into(),
        ));
    }

    ws.cache.load().await?;
    if ws.cache.store_len() == 0 {
        return Ok(SearchResponse {
            hits: Vec::new(),
            message: "No results: the index is empty. Run b_index_codebase first.".into(),
        });
    }

    let policy = ChunkPolicy::from_config(&ws.config);
    let pieces = chunker::chunk(code, policy);
    let (snippet, truncated) = match pieces.first() {
        Some(first) if pieces.len() > 1 => (first.text.clone(), true),
        Some(first) => (first.text.clone(), false),
        None => (code.to_string(), false),
    };

    let query_vector = embed_query(ws, snippet.clone()).await?;
    let tokens = lex_tokens(&snippet);
    let normalized_input = normalize_snippet(code);

    let mut response = run_scored_query(
        ws,
        request,
        &query_vector,
        &tokens,
        Some(&normalized_input),
    )
    .await?;

    if truncated {
        response.message = format!(
            "Warning: input exceeded the model budget and was truncated to its first {} tokens. {}",
            pieces[0].token_count, response.message
        );
    }
    if ws.config.unload_model_after_search {
        ws.embedder.unload();
    }
    Ok(response)
}

async fn embed_query(ws: &Workspace, text: String) -> EngineResult<Vec<f32>> {
    let embedder = Arc::clone(&ws.embedder);
    let mut vectors =
        tokio::task::spawn_blocking(move || embedder.embed(std::slice::from_ref(&text)))
            .await
            .map_err(|_| EngineError::Cancelled)??;
    vectors
        .pop()
        .ok_or_else(|| EngineError::DimensionMismatch {
            expected: 1,
            got: 0,
        })
}

async fn run_scored_query(
    ws: &Workspace,
    request: &SearchRequest,
    query_vector: &[f32],
    tokens: &[String],
    suppress_normalized: Option<&str>,
) -> EngineResult<SearchResponse> {
    let max_results = request.max_results.unwrap_or(ws.config.max_results).max(1);
    let min_similarity = request.min_similarity.unwrap_or(DEFAULT_MIN_SIMILARITY);

    // A read session keeps chunk positions stable across scoring batches.
    let _read = ws.cache.start_read();

    let candidates = select_candidates(ws, query_vector, max_results);
    let used_ann = candidates.is_some();

    let scored = score_candidates(ws, query_vector, tokens, candidates).await;
    let mut hits = finalize(
        ws,
        scored,
        request,
        max_results,
        min_similarity,
        tokens,
        suppress_normalized,
    );

    // ANN can undershoot; small stores fall back to the exact scan.
    if used_ann && hits.len() < max_results && ws.cache.store_len() <= MAX_FULL_SCAN_SIZE {
        debug!("ANN candidates scored below target, falling back to exact scan");
        let rescored = score_candidates(ws, query_vector, tokens, None).await;
        hits = finalize(
            ws,
            rescored,
            request,
            max_results,
            min_similarity,
            tokens,
            suppress_normalized,
        );
    }

    let message = if hits.is_empty() {
        "No results above the similarity threshold.".to_string()
    } else {
        format!("Found {} result(s).", hits.len())
    };
    Ok(SearchResponse { hits, message })
}

/// ANN candidate selection; `None` means scan the whole store.
fn select_candidates(ws: &Workspace, query_vector: &[f32], max_results: usize) -> Option<Vec<usize>> {
    let config = &ws.config;
    if !config.ann_enabled {
        return None;
    }
    let wanted = ((max_results as f32) * config.ann_candidate_multiplier).ceil() as usize;
    let k = wanted
        .max(config.ann_min_candidates)
        .clamp(max_results, config.ann_max_candidates);
    ws.cache
        .query_ann(query_vector, k)
        .map(|matches| matches.into_iter().map(|(index, _)| index).collect())
}

/// Dense + lexical scoring in cooperative batches of [`SCORE_BATCH`].
async fn score_candidates(
    ws: &Workspace,
    query_vector: &[f32],
    tokens: &[String],
    candidates: Option<Vec<usize>>,
) -> Vec<Candidate> {
    let store_len = ws.cache.store_len();
    let indices: Vec<usize> = match candidates {
        Some(list) => list,
        None => (0..store_len).collect(),
    };

    let mut scored = Vec::with_capacity(indices.len());
    for window in indices.chunks(SCORE_BATCH) {
        ws.cache.with_store(|store| {
            for &index in window {
                let Some(chunk) = store.get(index) else {
                    continue;
                };
                if chunk.vector.len() != query_vector.len() {
                    continue;
                }
                let dense: f32 = chunk
                    .vector
                    .iter()
                    .zip(query_vector)
                    .map(|(a, b)| a * b)
                    .sum();
                let lex = lexical_score(&chunk.content, tokens, ws.config.exact_match_boost);
                scored.push(Candidate { index, dense, lex });
            }
        });
        tokio::task::yield_now().await;
    }
    scored
}

#[allow(clippy::too_many_arguments)]
fn finalize(
    ws: &Workspace,
    scored: Vec<Candidate>,
    request: &SearchRequest,
    max_results: usize,
    min_similarity: f32,
    tokens: &[String],
    suppress_normalized: Option<&str>,
) -> Vec<SearchHit> {
    let config = &ws.config;
    let semantic_weight = config.semantic_weight;

    // Proximity frontier: query tokens that name an indexed file's stem.
    let proximity: HashMap<String, u32> = if config.call_graph_enabled {
        let graph = ws.cache.call_graph_snapshot();
        let seeds: Vec<String> = ws.cache.with_store(|store| {
            let mut seeds = Vec::new();
            for chunk in store {
                let stem = Path::new(&chunk.file)
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_lowercase())
                    .unwrap_or_default();
                if tokens.iter().any(|t| *t == stem) && !seeds.contains(&chunk.file) {
                    seeds.push(chunk.file.clone());
                }
            }
            seeds
        });
        let mut merged = HashMap::new();
        for seed in seeds {
            for (file, hops) in graph.neighbors_within(&seed, config.call_graph_max_hops) {
                let entry = merged.entry(file).or_insert(hops);
                *entry = (*entry).min(hops);
            }
        }
        merged
    } else {
        HashMap::new()
    };

    let mut mtimes: HashMap<String, Option<SystemTime>> = HashMap::new();

    let mut hits: Vec<SearchHit> = Vec::new();
    ws.cache.with_store(|store| {
        for candidate in scored {
            let Some(chunk) = store.get(candidate.index) else {
                continue;
            };

            if !file_filters_allow(&chunk.file, request) {
                continue;
            }
            if let Some(normalized) = suppress_normalized {
                if normalize_snippet(&chunk.content) == normalized {
                    continue;
                }
            }

            let mtime = *mtimes
                .entry(chunk.file.clone())
                .or_insert_with(|| std::fs::metadata(&chunk.file).and_then(|m| m.modified()).ok());
            let recency = recency_boost(mtime, config.recency_boost, config.recency_decay_days);
            let proximity_boost = proximity
                .get(&chunk.file)
                .map(|&hops| config.call_graph_boost * 0.5f32.powi(hops.saturating_sub(1) as i32))
                .unwrap_or(0.0);

            let score = semantic_weight * candidate.dense
                + (1.0 - semantic_weight) * candidate.lex
                + recency
                + proximity_boost;
            if score < min_similarity {
                continue;
            }

            hits.push(SearchHit {
                file: chunk.file.clone(),
                start_line: chunk.start_line,
                end_line: chunk.end_line,
                score,
                language: crate::lang::language_of(Path::new(&chunk.file)),
                content: chunk.content.clone(),
            });
        }
    });

    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.file.cmp(&b.file))
            .then_with(|| a.start_line.cmp(&b.start_line))
    });
    hits.truncate(max_results);
    hits
}

fn file_filters_allow(file: &str, request: &SearchRequest) -> bool {
    if let Some(includes) = &request.include_files {
        if !includes.is_empty() && !includes.iter().any(|pattern| file.contains(pattern)) {
            return false;
        }
    }
    if let Some(excludes) = &request.exclude_files {
        if excludes.iter().any(|pattern| file.contains(pattern)) {
            return false;
        }
    }
    if let Some(languages) = &request.languages {
        if !languages.is_empty() {
            let language = crate::lang::language_of(Path::new(file));
            if !languages.iter().any(|l| l.eq_ignore_ascii_case(language)) {
                return false;
            }
        }
    }
    true
}

/// Lowercase alphanumeric query tokens. Repeated tokens are kept, so the
/// lexical denominator depends only on the token sequence, not adjacency.
pub fn lex_tokens(query: &str) -> Vec<String> {
    query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// `exactMatchBoost * hits / |tokens|` over the candidate content.
fn lexical_score(content: &str, tokens: &[String], exact_match_boost: f32) -> f32 {
    if tokens.is_empty() {
        return 0.0;
    }
    let haystack = content.to_lowercase();
    let hits = tokens.iter().filter(|t| haystack.contains(t.as_str())).count();
    exact_match_boost * (hits as f32) / (tokens.len() as f32)
}

/// Linear decay from `recency_boost` at age zero to 0 at `decay_days`.
fn recency_boost(mtime: Option<SystemTime>, boost: f32, decay_days: u32) -> f32 {
    let Some(mtime) = mtime else {
        return 0.0;
    };
    let age_days = mtime
        .elapsed()
        .map(|age| age.as_secs_f32() / 86_400.0)
        .unwrap_or(f32::MAX);
    let decay = decay_days.max(1) as f32;
    (boost * (1.0 - age_days / decay)).max(0.0)
}

fn normalize_snippet(code: &str) -> String {
    code.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_lowercase_alphanumeric() {
        let tokens = lex_tokens("Greet_user(42)!");
        assert_eq!(tokens, vec!["greet", "user", "42"]);

        let tokens = lex_tokens("find-similar code");
        assert_eq!(tokens, vec!["find", "similar", "code"]);
    }

    #[test]
    fn repeated_tokens_score_the_same_regardless_of_order() {
        let adjacent = lex_tokens("greet greet missing");
        let separated = lex_tokens("greet missing greet");
        assert_eq!(adjacent.len(), separated.len());

        let content = "function greet() {}";
        assert_eq!(
            lexical_score(content, &adjacent, 1.5),
            lexical_score(content, &separated, 1.5)
        );
    }

    #[test]
    fn lexical_score_counts_token_hits() {
        let tokens = lex_tokens("greet user");
        let full = lexical_score("function greet(user) {}", &tokens, 1.5);
        assert!((full - 1.5).abs() < 1e-6);

        let half = lexical_score("function greet() {}", &tokens, 1.5);
        assert!((half - 0.75).abs() < 1e-6);

        let none = lexical_score("console.log('bye')", &tokens, 1.5);
        assert_eq!(none, 0.0);
    }

    #[test]
    fn lexical_score_empty_tokens_is_zero() {
        assert_eq!(lexical_score("anything", &[], 1.5), 0.0);
    }

    #[test]
    fn recency_decays_linearly_to_zero() {
        let now = SystemTime::now();
        let fresh = recency_boost(Some(now), 0.1, 30);
        assert!(fresh > 0.099);

        let old = now - std::time::Duration::from_secs(86_400 * 60);
        assert_eq!(recency_boost(Some(old), 0.1, 30), 0.0);

        let halfway = now - std::time::Duration::from_secs(86_400 * 15);
        let mid = recency_boost(Some(halfway), 0.1, 30);
        assert!(mid > 0.04 && mid < 0.06);
    }

    #[test]
    fn recency_without_mtime_is_zero() {
        assert_eq!(recency_boost(None, 0.1, 30), 0.0);
    }

    #[test]
    fn normalize_collapses_whitespace() {
        assert_eq!(
            normalize_snippet("  fn  main() {\n    body\n}\n"),
            "fn main() { body }"
        );
    }

    #[test]
    fn file_filters_apply_in_order() {
        let request = SearchRequest {
            include_files: Some(vec!["src/".into()]),
            exclude_files: Some(vec!["test".into()]),
            languages: Some(vec!["rust".into()]),
            ..SearchRequest::default()
        };
        assert!(file_filters_allow("/ws/src/main.rs", &request));
        assert!(!file_filters_allow("/ws/lib/main.rs", &request));
        assert!(!file_filters_allow("/ws/src/test_util.rs", &request));
        assert!(!file_filters_allow("/ws/src/main.py", &request));
    }
}
