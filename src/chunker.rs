//! Token-budget chunker.
//!
//! Splits file text into overlapping chunks sized by an estimated token
//! budget. Semantic boundaries (blank lines, top-level declarations) are
//! preferred over raw line windows so chunks tend to align with whole
//! functions and blocks. Token counts are estimates; the embedder is
//! authoritative and may truncate further.

use crate::config::Config;

/// Hard cap on chunks emitted per file, bounding memory on pathological
/// inputs (generated bundles, minified sources).
const MAX_CHUNKS_PER_FILE: usize = 200;

/// Fraction of the model budget actually targeted per chunk.
const TARGET_FRACTION: f32 = 0.85;

/// Overlap fraction of the target budget when no explicit overlap is set.
const OVERLAP_FRACTION: f32 = 0.18;

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkPiece {
    pub text: String,
    /// 1-indexed, inclusive.
    pub start_line: u32,
    pub end_line: u32,
    pub token_count: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkPolicy {
    pub target_tokens: u32,
    pub overlap_tokens: u32,
}

impl ChunkPolicy {
    pub fn from_config(config: &Config) -> Self {
        let target = ((config.chunk_size as f32) * TARGET_FRACTION).round() as u32;
        let target = target.max(8);
        let overlap = if config.chunk_overlap > 0 {
            config.chunk_overlap.min(target / 2)
        } else {
            ((target as f32) * OVERLAP_FRACTION).round() as u32
        };
        Self {
            target_tokens: target,
            overlap_tokens: overlap,
        }
    }
}

/// Split `text` into ordered chunks under the policy's token budget.
/// Non-empty input always yields at least one chunk; empty input yields none.
pub fn chunk(text: &str, policy: ChunkPolicy) -> Vec<ChunkPiece> {
    if text.is_empty() {
        return Vec::new();
    }

    let lines: Vec<&str> = text.lines().collect();
    if lines.is_empty() {
        // Whitespace-only content such as "\n": still a chunk.
        return vec![ChunkPiece {
            text: text.to_string(),
            start_line: 1,
            end_line: 1,
            token_count: estimate_tokens(text),
        }];
    }

    let line_costs: Vec<u32> = lines.iter().map(|l| line_token_cost(l)).collect();

    let mut chunks = Vec::new();
    // Indices into `lines` for the chunk currently being accumulated.
    let mut current: Vec<usize> = Vec::new();
    let mut current_tokens = 0u32;

    let mut i = 0usize;
    while i < lines.len() {
        let cost = line_costs[i];

        if !current.is_empty() && current_tokens + cost > policy.target_tokens {
            // Prefer cutting at the most recent semantic boundary past the
            // chunk midpoint; otherwise fall back to a plain line window.
            let cut = best_boundary(&lines, &current).unwrap_or(current.len());
            let emitted: Vec<usize> = current[..cut].to_vec();
            push_chunk(&mut chunks, &lines, &emitted);
            if chunks.len() >= MAX_CHUNKS_PER_FILE {
                return chunks;
            }

            // Lines after the cut plus the overlap tail seed the next chunk.
            let mut next: Vec<usize> = Vec::new();
            let mut overlap_tokens = 0u32;
            for &idx in emitted.iter().rev() {
                if overlap_tokens >= policy.overlap_tokens {
                    break;
                }
                overlap_tokens += line_costs[idx];
                next.insert(0, idx);
            }
            next.extend_from_slice(&current[cut..]);

            current_tokens = next.iter().map(|&idx| line_costs[idx]).sum();
            current = next;
        }

        current.push(i);
        current_tokens += cost;
        i += 1;
    }

    if !current.is_empty() && chunks.len() < MAX_CHUNKS_PER_FILE {
        push_chunk(&mut chunks, &lines, &current);
    }

    chunks
}

/// Validate bytes as UTF-8 before chunking. The engine reads files as bytes
/// so that encoding failures surface as a typed error instead of lossy text.
pub fn chunk_bytes(
    bytes: &[u8],
    path: &std::path::Path,
    policy: ChunkPolicy,
) -> crate::error::EngineResult<Vec<ChunkPiece>> {
    let text = std::str::from_utf8(bytes).map_err(|e| crate::error::EngineError::FileReadError {
        path: path.display().to_string(),
        detail: format!("invalid UTF-8: {e}"),
    })?;
    Ok(chunk(text, policy))
}

fn push_chunk(chunks: &mut Vec<ChunkPiece>, lines: &[&str], indices: &[usize]) {
    let first = match indices.first() {
        Some(&idx) => idx,
        None => return,
    };
    let last = indices[indices.len() - 1];
    let text = indices
        .iter()
        .map(|&idx| lines[idx])
        .collect::<Vec<_>>()
        .join("\n");
    let token_count = estimate_tokens(&text);
    chunks.push(ChunkPiece {
        text,
        start_line: (first + 1) as u32,
        end_line: (last + 1) as u32,
        token_count,
    });
}

/// Index into `current` (exclusive cut point) of the latest semantic
/// boundary in the second half of the accumulated chunk, if any.
fn best_boundary(lines: &[&str], current: &[usize]) -> Option<usize> {
    if current.len() < 4 {
        return None;
    }
    let midpoint = current.len() / 2;
    for pos in (midpoint..current.len()).rev() {
        let line = lines[current[pos]];
        if line.trim().is_empty() {
            // Cut after the blank line so it stays with the earlier chunk.
            return Some(pos + 1);
        }
        if is_top_level_declaration(line) {
            // Cut before the declaration so it opens the next chunk.
            return Some(pos);
        }
    }
    None
}

/// A top-level declaration starts at column zero with a known keyword.
fn is_top_level_declaration(line: &str) -> bool {
    if line.starts_with(char::is_whitespace) {
        return false;
    }
    let trimmed = line.trim_start_matches("export ").trim_start_matches("pub ");
    const KEYWORDS: &[&str] = &[
        "fn ",
        "async fn ",
        "function ",
        "async function ",
        "class ",
        "struct ",
        "enum ",
        "trait ",
        "impl ",
        "interface ",
        "type ",
        "def ",
        "async def ",
        "const ",
        "let ",
        "var ",
        "mod ",
        "module ",
        "func ",
    ];
    KEYWORDS.iter().any(|kw| trimmed.starts_with(kw))
}

/// Estimated token count for a chunk of text: base 2 (start/end tokens)
/// plus per-line content costs.
pub fn estimate_tokens(text: &str) -> u32 {
    2 + text.lines().map(line_token_cost).sum::<u32>()
}

/// Content cost of a single line, without the per-chunk base.
///
/// Words split on Unicode whitespace cost by alphanumeric length
/// (`<=4` chars: 1, `<=10`: 2, else `ceil(len/4)`); CJK characters cost one
/// token each; other special characters cost half a token, rounded up over
/// the whole line.
fn line_token_cost(line: &str) -> u32 {
    let mut tokens = 0u32;
    let mut specials = 0u32;

    for word in line.split_whitespace() {
        let mut alnum_len = 0u32;
        for ch in word.chars() {
            if is_cjk(ch) {
                tokens += 1;
            } else if ch.is_alphanumeric() || ch == '_' {
                alnum_len += 1;
            } else {
                specials += 1;
            }
        }
        tokens += match alnum_len {
            0 => 0,
            1..=4 => 1,
            5..=10 => 2,
            n => n.div_ceil(4),
        };
    }

    tokens + specials.div_ceil(2)
}

fn is_cjk(ch: char) -> bool {
    matches!(ch as u32,
        0x4E00..=0x9FFF      // CJK Unified Ideographs
        | 0x3400..=0x4DBF    // Extension A
        | 0x3040..=0x30FF    // Hiragana + Katakana
        | 0xAC00..=0xD7AF    // Hangul syllables
        | 0xF900..=0xFAFF    // Compatibility Ideographs
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(target: u32, overlap: u32) -> ChunkPolicy {
        ChunkPolicy {
            target_tokens: target,
            overlap_tokens: overlap,
        }
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        assert!(chunk("", policy(100, 10)).is_empty());
    }

    #[test]
    fn small_input_yields_single_chunk() {
        let chunks = chunk("hello world", policy(100, 10));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "hello world");
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks[0].end_line, 1);
    }

    #[test]
    fn line_spans_are_one_indexed_and_contiguous() {
        let text = (0..40)
            .map(|i| format!("let value_{i} = compute_{i}();"))
            .collect::<Vec<_>>()
            .join("\n");
        let chunks = chunk(&text, policy(40, 6));
        assert!(chunks.len() > 1);
        assert_eq!(chunks[0].start_line, 1);
        for chunk in &chunks {
            assert!(chunk.start_line <= chunk.end_line);
        }
        // Full coverage: last chunk reaches the last line.
        assert_eq!(chunks.last().unwrap().end_line, 40);
    }

    #[test]
    fn consecutive_chunks_overlap() {
        let text = (0..60)
            .map(|i| format!("statement_number_{i} = {i};"))
            .collect::<Vec<_>>()
            .join("\n");
        let chunks = chunk(&text, policy(50, 10));
        assert!(chunks.len() >= 2);
        for pair in chunks.windows(2) {
            assert!(pair[1].start_line <= pair[0].end_line + 1);
        }
    }

    #[test]
    fn prefers_blank_line_boundaries() {
        let mut text = String::new();
        for block in 0..6 {
            for i in 0..8 {
                text.push_str(&format!("block_{block}_line_{i} = some_call({i});\n"));
            }
            text.push('\n');
        }
        let chunks = chunk(&text, policy(60, 8));
        assert!(chunks.len() > 1);
        // At least one cut should land right after a blank line, so some
        // chunk ends with an empty line.
        assert!(chunks
            .iter()
            .any(|c| c.text.ends_with('\n') || c.text.lines().last() == Some("")));
    }

    #[test]
    fn declaration_opens_next_chunk() {
        let mut text = String::new();
        for i in 0..10 {
            text.push_str(&format!("    body_line_{i} = {i};\n"));
        }
        text.push_str("fn second_function() {\n");
        for i in 0..10 {
            text.push_str(&format!("    more_{i} = {i};\n"));
        }
        text.push('}');
        let chunks = chunk(&text, policy(40, 4));
        if chunks.len() > 1 {
            assert!(chunks
                .iter()
                .skip(1)
                .any(|c| c.text.starts_with("fn second_function")));
        }
    }

    #[test]
    fn token_estimate_base_and_words() {
        // "hi" -> base 2 + one short word = 3
        assert_eq!(estimate_tokens("hi"), 3);
        // len<=4 words cost 1, len<=10 cost 2
        assert_eq!(estimate_tokens("tiny"), 3);
        assert_eq!(estimate_tokens("mediumword"), 4);
        // 12-char word costs ceil(12/4) = 3
        assert_eq!(estimate_tokens("abcdefghijkl"), 5);
    }

    #[test]
    fn token_estimate_counts_specials_at_half() {
        // "a=b;" -> word 'a' (1) + word 'b' (1) + 2 specials -> +1
        let with_specials = estimate_tokens("a = b ;");
        let without = estimate_tokens("a b");
        assert!(with_specials > without);
    }

    #[test]
    fn token_estimate_cjk_per_char() {
        let three_cjk = estimate_tokens("你好吗");
        assert_eq!(three_cjk, 2 + 3);
    }

    #[test]
    fn huge_single_line_still_chunks() {
        let text = "x".repeat(50_000);
        let chunks = chunk(&text, policy(50, 5));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start_line, 1);
    }

    #[test]
    fn chunk_cap_bounds_output() {
        let text = (0..100_000)
            .map(|i| format!("line_{i}"))
            .collect::<Vec<_>>()
            .join("\n");
        let chunks = chunk(&text, policy(10, 2));
        assert!(chunks.len() <= MAX_CHUNKS_PER_FILE);
    }

    #[test]
    fn chunk_bytes_rejects_non_utf8() {
        let err = chunk_bytes(&[0xff, 0xfe, 0x00], std::path::Path::new("bad.bin"), policy(50, 5));
        assert!(err.is_err());
    }

    #[test]
    fn policy_derives_from_config() {
        let config = crate::config::Config::default();
        let p = ChunkPolicy::from_config(&config);
        assert_eq!(p.target_tokens, (512.0f32 * 0.85).round() as u32);
        assert_eq!(p.overlap_tokens, (p.target_tokens as f32 * 0.18).round() as u32);
    }
}
