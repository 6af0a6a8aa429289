//! Directed (non-event) dependent propagation.
//!
//! Repositories may declare `dependents` in `tako.yml`; the graph builder
//! turns those declarations into a deterministic propagation order for a
//! given source repository. This is the interface consumed by hybrid
//! directed-plus-event orchestration; it is deliberately separate from the
//! event-subscription orchestrator.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::PathBuf;

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use thiserror::Error;

use crate::config::{self, CONFIG_FILE};
use crate::subscription::discovery::DISCOVERY_BRANCH;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from dependent-graph construction.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("dependent cycle detected involving '{0}'")]
    CycleDetected(String),

    #[error("cache walk failed: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Port
// ---------------------------------------------------------------------------

/// Capability contract for computing dependent propagation order.
pub trait DependencyGraphBuilder: Send + Sync {
    /// Repositories reachable from `source` through `dependents` edges, in
    /// a deterministic topological order (dependencies before dependents),
    /// excluding `source` itself.
    fn dependent_order(
        &self,
        source: &str,
    ) -> impl Future<Output = Result<Vec<String>, GraphError>> + Send;
}

// ---------------------------------------------------------------------------
// CacheDependencyGraph
// ---------------------------------------------------------------------------

/// Graph builder reading `dependents` declarations from the repository
/// cache (`<cache>/repos/*/*/main/tako.yml`).
#[derive(Debug, Clone)]
pub struct CacheDependencyGraph {
    cache_dir: PathBuf,
}

impl CacheDependencyGraph {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    /// Adjacency of `repository -> dependents`, sorted for determinism.
    fn load_edges(&self) -> Result<BTreeMap<String, BTreeSet<String>>, GraphError> {
        let mut edges: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let repos_root = self.cache_dir.join("repos");
        let owners = match std::fs::read_dir(&repos_root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(edges),
            Err(err) => return Err(GraphError::Io(err)),
        };

        for owner_entry in owners.flatten() {
            if !owner_entry.path().is_dir() {
                continue;
            }
            let owner = owner_entry.file_name().to_string_lossy().to_string();
            let Ok(repos) = std::fs::read_dir(owner_entry.path()) else {
                continue;
            };
            for repo_entry in repos.flatten() {
                let repo_path = repo_entry.path().join(DISCOVERY_BRANCH);
                if !repo_path.join(CONFIG_FILE).is_file() {
                    continue;
                }
                let repository =
                    format!("{owner}/{}", repo_entry.file_name().to_string_lossy());
                let Ok(repo_config) = config::load_repo_config(&repo_path) else {
                    continue;
                };
                let dependents = edges.entry(repository).or_default();
                for dependent in repo_config.dependents {
                    dependents.insert(dependent.repo);
                }
            }
        }
        Ok(edges)
    }
}

impl DependencyGraphBuilder for CacheDependencyGraph {
    async fn dependent_order(&self, source: &str) -> Result<Vec<String>, GraphError> {
        let edges = self.load_edges()?;

        // Restrict to the subgraph reachable from the source.
        let mut reachable = BTreeSet::new();
        let mut stack = vec![source.to_string()];
        while let Some(current) = stack.pop() {
            if let Some(dependents) = edges.get(&current) {
                for dependent in dependents {
                    if reachable.insert(dependent.clone()) {
                        stack.push(dependent.clone());
                    }
                }
            }
        }

        let mut nodes: Vec<String> = reachable.into_iter().collect();
        nodes.insert(0, source.to_string());

        let mut graph = DiGraph::<&str, ()>::new();
        let indices: BTreeMap<&str, _> = nodes
            .iter()
            .map(|name| (name.as_str(), graph.add_node(name.as_str())))
            .collect();
        for node in &nodes {
            if let Some(dependents) = edges.get(node) {
                for dependent in dependents {
                    if let (Some(&from), Some(&to)) =
                        (indices.get(node.as_str()), indices.get(dependent.as_str()))
                    {
                        graph.add_edge(from, to, ());
                    }
                }
            }
        }

        let sorted = toposort(&graph, None).map_err(|cycle| {
            GraphError::CycleDetected(graph[cycle.node_id()].to_string())
        })?;

        Ok(sorted
            .into_iter()
            .map(|idx| graph[idx].to_string())
            .filter(|name| name != source)
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seed_repo(cache: &TempDir, repository: &str, dependents: &[&str]) {
        let repo_dir = cache
            .path()
            .join("repos")
            .join(repository)
            .join(DISCOVERY_BRANCH);
        std::fs::create_dir_all(&repo_dir).unwrap();
        let mut yaml = String::from(
            "version: \"1\"\nworkflows:\n  noop:\n    steps:\n      - id: s\n        run: true\n",
        );
        if !dependents.is_empty() {
            yaml.push_str("dependents:\n");
            for dependent in dependents {
                yaml.push_str(&format!("  - repo: {dependent}\n"));
            }
        }
        std::fs::write(repo_dir.join(CONFIG_FILE), yaml).unwrap();
    }

    #[tokio::test]
    async fn linear_chain_orders_dependencies_first() {
        let cache = TempDir::new().unwrap();
        seed_repo(&cache, "ex/lib", &["ex/mid"]);
        seed_repo(&cache, "ex/mid", &["ex/app"]);
        seed_repo(&cache, "ex/app", &[]);

        let graph = CacheDependencyGraph::new(cache.path());
        let order = graph.dependent_order("ex/lib").await.unwrap();
        assert_eq!(order, vec!["ex/mid".to_string(), "ex/app".to_string()]);
    }

    #[tokio::test]
    async fn unrelated_repositories_are_excluded() {
        let cache = TempDir::new().unwrap();
        seed_repo(&cache, "ex/lib", &["ex/app"]);
        seed_repo(&cache, "ex/app", &[]);
        seed_repo(&cache, "ex/elsewhere", &["ex/other"]);
        seed_repo(&cache, "ex/other", &[]);

        let graph = CacheDependencyGraph::new(cache.path());
        let order = graph.dependent_order("ex/lib").await.unwrap();
        assert_eq!(order, vec!["ex/app".to_string()]);
    }

    #[tokio::test]
    async fn diamond_resolves_deterministically() {
        let cache = TempDir::new().unwrap();
        seed_repo(&cache, "ex/lib", &["ex/a", "ex/b"]);
        seed_repo(&cache, "ex/a", &["ex/app"]);
        seed_repo(&cache, "ex/b", &["ex/app"]);
        seed_repo(&cache, "ex/app", &[]);

        let graph = CacheDependencyGraph::new(cache.path());
        let first = graph.dependent_order("ex/lib").await.unwrap();
        let second = graph.dependent_order("ex/lib").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
        assert_eq!(first.last().unwrap(), "ex/app");
    }

    #[tokio::test]
    async fn cycle_is_reported() {
        let cache = TempDir::new().unwrap();
        seed_repo(&cache, "ex/lib", &["ex/a"]);
        seed_repo(&cache, "ex/a", &["ex/lib"]);

        let graph = CacheDependencyGraph::new(cache.path());
        let err = graph.dependent_order("ex/lib").await.unwrap_err();
        assert!(matches!(err, GraphError::CycleDetected(_)));
    }

    #[tokio::test]
    async fn empty_cache_yields_empty_order() {
        let cache = TempDir::new().unwrap();
        let graph = CacheDependencyGraph::new(cache.path());
        assert!(graph.dependent_order("ex/lib").await.unwrap().is_empty());
    }
}
