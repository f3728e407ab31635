//! File-level call graph.
//!
//! Import/include references are extracted per file with language-family
//! regexes at index time. The graph only feeds proximity boosts in hybrid
//! search, so extraction is deliberately heuristic: it resolves module
//! specifiers against the set of indexed files and records edges both ways.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::sync::LazyLock;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct CallGraphNode {
    pub calls_to: BTreeSet<String>,
    pub called_by: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallGraph {
    pub nodes: HashMap<String, CallGraphNode>,
}

impl CallGraph {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Replace the outgoing edges of `file`, fixing reverse edges on both
    /// the dropped and added targets.
    pub fn set_file_edges(&mut self, file: &str, targets: BTreeSet<String>) {
        let previous = self
            .nodes
            .get(file)
            .map(|n| n.calls_to.clone())
            .unwrap_or_default();

        for dropped in previous.difference(&targets) {
            if let Some(node) = self.nodes.get_mut(dropped) {
                node.called_by.remove(file);
            }
        }
        for added in targets.difference(&previous) {
            self.nodes
                .entry(added.clone())
                .or_default()
                .called_by
                .insert(file.to_string());
        }
        self.nodes.entry(file.to_string()).or_default().calls_to = targets;
        self.prune(file);
    }

    pub fn remove_file(&mut self, file: &str) {
        if let Some(node) = self.nodes.remove(file) {
            for target in node.calls_to {
                if let Some(t) = self.nodes.get_mut(&target) {
                    t.called_by.remove(file);
                }
                self.prune(&target);
            }
            for source in node.called_by {
                if let Some(s) = self.nodes.get_mut(&source) {
                    s.calls_to.remove(file);
                }
                self.prune(&source);
            }
        }
    }

    fn prune(&mut self, file: &str) {
        if let Some(node) = self.nodes.get(file) {
            if node.calls_to.is_empty() && node.called_by.is_empty() {
                self.nodes.remove(file);
            }
        }
    }

    /// BFS over undirected edges: files within `max_hops` of `start`,
    /// mapped to their hop distance (start itself excluded).
    pub fn neighbors_within(&self, start: &str, max_hops: u32) -> HashMap<String, u32> {
        let mut distances = HashMap::new();
        let mut queue = VecDeque::new();
        queue.push_back((start.to_string(), 0u32));
        let mut visited = std::collections::HashSet::new();
        visited.insert(start.to_string());

        while let Some((file, hops)) = queue.pop_front() {
            if hops >= max_hops {
                continue;
            }
            if let Some(node) = self.nodes.get(&file) {
                for next in node.calls_to.iter().chain(node.called_by.iter()) {
                    if visited.insert(next.clone()) {
                        distances.insert(next.clone(), hops + 1);
                        queue.push_back((next.clone(), hops + 1));
                    }
                }
            }
        }
        distances
    }
}

// ---------------------------------------------------------------------------
// Reference extraction
// ---------------------------------------------------------------------------

static RE_JS_IMPORTS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r#"(?m)^\s*import\s+.*?from\s+['"]([^'"]+)['"]"#).unwrap(),
        Regex::new(r#"(?m)^\s*import\s+['"]([^'"]+)['"]"#).unwrap(),
        Regex::new(r#"require\(\s*['"]([^'"]+)['"]\s*\)"#).unwrap(),
        Regex::new(r#"(?m)^\s*export\s+.*?from\s+['"]([^'"]+)['"]"#).unwrap(),
    ]
});

static RE_PY_IMPORTS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?m)^\s*from\s+([\w.]+)\s+import").unwrap(),
        Regex::new(r"(?m)^\s*import\s+([\w.]+)").unwrap(),
    ]
});

static RE_RUST_IMPORTS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?m)^\s*use\s+crate::([\w:]+)").unwrap(),
        Regex::new(r"(?m)^\s*mod\s+(\w+)\s*;").unwrap(),
    ]
});

static RE_GO_IMPORTS: LazyLock<Vec<Regex>> =
    LazyLock::new(|| vec![Regex::new(r#"(?m)^\s*(?:import\s+)?"([\w./-]+)""#).unwrap()]);

static RE_C_INCLUDES: LazyLock<Vec<Regex>> =
    LazyLock::new(|| vec![Regex::new(r#"(?m)^\s*#include\s+"([^"]+)""#).unwrap()]);

/// Raw module specifiers referenced by `content`.
pub fn extract_references(content: &str, language: &str) -> Vec<String> {
    let regexes: &[Regex] = match language {
        "typescript" | "javascript" | "vue" | "svelte" | "astro" => &RE_JS_IMPORTS,
        "python" => &RE_PY_IMPORTS,
        "rust" => &RE_RUST_IMPORTS,
        "go" => &RE_GO_IMPORTS,
        "c" | "cpp" => &RE_C_INCLUDES,
        _ => return Vec::new(),
    };

    let mut seen = BTreeSet::new();
    for re in regexes {
        for cap in re.captures_iter(content) {
            if let Some(m) = cap.get(1) {
                seen.insert(m.as_str().to_string());
            }
        }
    }
    seen.into_iter().collect()
}

/// Resolve module specifiers to indexed files. A specifier matches a file
/// when the file's extension-less path ends with the specifier's segments,
/// so `./util`, `../lib/util`, and `pkg.util` all land on `.../util.*`.
pub fn resolve_references(
    source_file: &str,
    specifiers: &[String],
    indexed_files: &BTreeSet<String>,
) -> BTreeSet<String> {
    let mut targets = BTreeSet::new();
    for spec in specifiers {
        let normalized = spec
            .trim_start_matches("./")
            .replace('\\', "/")
            .replace('.', "/");
        let tail = normalized
            .rsplit('/')
            .find(|s| !s.is_empty() && *s != "/" && !s.starts_with(".."))
            .unwrap_or(&normalized)
            .to_string();
        if tail.is_empty() {
            continue;
        }
        for candidate in indexed_files {
            if candidate == source_file {
                continue;
            }
            let stem = Path::new(candidate)
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            if stem.eq_ignore_ascii_case(&tail) {
                targets.insert(candidate.clone());
            }
        }
    }
    targets
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn extracts_js_imports() {
        let src = r#"
import { greet } from './greeter';
import config from "../config";
const db = require('./db/client');
export { x } from './re-export';
"#;
        let refs = extract_references(src, "javascript");
        assert!(refs.contains(&"./greeter".to_string()));
        assert!(refs.contains(&"../config".to_string()));
        assert!(refs.contains(&"./db/client".to_string()));
        assert!(refs.contains(&"./re-export".to_string()));
    }

    #[test]
    fn extracts_python_imports() {
        let src = "from app.models import User\nimport utils\n";
        let refs = extract_references(src, "python");
        assert!(refs.contains(&"app.models".to_string()));
        assert!(refs.contains(&"utils".to_string()));
    }

    #[test]
    fn extracts_rust_use_and_mod() {
        let src = "mod cache;\nuse crate::chunker::ChunkPiece;\n";
        let refs = extract_references(src, "rust");
        assert!(refs.iter().any(|r| r.starts_with("chunker")));
        assert!(refs.contains(&"cache".to_string()));
    }

    #[test]
    fn unknown_language_has_no_references() {
        assert!(extract_references("import x from 'y'", "markdown").is_empty());
    }

    #[test]
    fn resolves_specifier_to_file_stem() {
        let files = set(&["/ws/src/greeter.js", "/ws/src/db/client.js", "/ws/a.js"]);
        let targets = resolve_references(
            "/ws/a.js",
            &["./greeter".to_string(), "./db/client".to_string()],
            &files,
        );
        assert_eq!(
            targets,
            set(&["/ws/src/greeter.js", "/ws/src/db/client.js"])
        );
    }

    #[test]
    fn edges_are_bidirectional() {
        let mut graph = CallGraph::default();
        graph.set_file_edges("/ws/a.js", set(&["/ws/b.js"]));
        assert!(graph.nodes["/ws/b.js"].called_by.contains("/ws/a.js"));
        assert!(graph.nodes["/ws/a.js"].calls_to.contains("/ws/b.js"));
    }

    #[test]
    fn replacing_edges_fixes_reverse_links() {
        let mut graph = CallGraph::default();
        graph.set_file_edges("/ws/a.js", set(&["/ws/b.js"]));
        graph.set_file_edges("/ws/a.js", set(&["/ws/c.js"]));
        assert!(!graph.nodes.contains_key("/ws/b.js"));
        assert!(graph.nodes["/ws/c.js"].called_by.contains("/ws/a.js"));
    }

    #[test]
    fn remove_file_cleans_both_directions() {
        let mut graph = CallGraph::default();
        graph.set_file_edges("/ws/a.js", set(&["/ws/b.js"]));
        graph.set_file_edges("/ws/b.js", set(&["/ws/c.js"]));
        graph.remove_file("/ws/b.js");
        assert!(!graph.nodes.contains_key("/ws/b.js"));
        if let Some(a) = graph.nodes.get("/ws/a.js") {
            assert!(!a.calls_to.contains("/ws/b.js"));
        }
    }

    #[test]
    fn remove_file_prunes_edgeless_callers() {
        let mut graph = CallGraph::default();
        // C's only edge is its import of B.
        graph.set_file_edges("/ws/c.js", set(&["/ws/b.js"]));
        graph.remove_file("/ws/b.js");
        assert!(!graph.nodes.contains_key("/ws/b.js"));
        assert!(!graph.nodes.contains_key("/ws/c.js"));
        assert!(graph.is_empty());
    }

    #[test]
    fn neighbors_respect_hop_limit() {
        let mut graph = CallGraph::default();
        graph.set_file_edges("/a", set(&["/b"]));
        graph.set_file_edges("/b", set(&["/c"]));
        graph.set_file_edges("/c", set(&["/d"]));

        let one_hop = graph.neighbors_within("/a", 1);
        assert_eq!(one_hop.get("/b"), Some(&1));
        assert!(!one_hop.contains_key("/c"));

        let two_hops = graph.neighbors_within("/a", 2);
        assert_eq!(two_hops.get("/c"), Some(&2));
        assert!(!two_hops.contains_key("/d"));
    }

    #[test]
    fn serializes_camel_case_fields() {
        let mut graph = CallGraph::default();
        graph.set_file_edges("/a", set(&["/b"]));
        let json = serde_json::to_string(&graph).unwrap();
        assert!(json.contains("callsTo"));
        assert!(json.contains("calledBy"));
    }
}
