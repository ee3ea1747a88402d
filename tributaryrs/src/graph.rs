//! Per-datasource join graph.
//!
//! Nodes are table names; a directed edge carries the dimension names used
//! as equality join conditions. Simple paths are found by a bounded DFS
//! and memoized per (anchor, target) pair; the graphs are small (tens to
//! hundreds of nodes), so exhaustive enumeration under a length cap is
//! fine.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;

#[derive(Debug, Clone)]
pub struct JoinEdge {
    pub join_fields: Vec<String>,
}

#[derive(Debug)]
pub struct JoinGraph {
    graph: DiGraph<String, JoinEdge>,
    indices: HashMap<String, NodeIndex>,
    max_path_len: usize,
    path_cache: RwLock<HashMap<(String, String), Arc<Vec<Vec<String>>>>>,
}

impl JoinGraph {
    pub fn new(max_path_len: usize) -> Self {
        Self {
            graph: DiGraph::new(),
            indices: HashMap::new(),
            max_path_len: max_path_len.max(2),
            path_cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn add_table(&mut self, name: &str) -> NodeIndex {
        if let Some(idx) = self.indices.get(name) {
            return *idx;
        }
        let idx = self.graph.add_node(name.to_string());
        self.indices.insert(name.to_string(), idx);
        idx
    }

    pub fn add_join(&mut self, from: &str, to: &str, join_fields: Vec<String>) {
        let from_idx = self.add_table(from);
        let to_idx = self.add_table(to);
        if self.graph.find_edge(from_idx, to_idx).is_none() {
            self.graph.add_edge(from_idx, to_idx, JoinEdge { join_fields });
        }
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.indices.contains_key(name)
    }

    pub fn max_path_len(&self) -> usize {
        self.max_path_len
    }

    /// The join fields on the edge `from -> to`, if one exists.
    pub fn edge_fields(&self, from: &str, to: &str) -> Option<Vec<String>> {
        let from_idx = self.indices.get(from)?;
        let to_idx = self.indices.get(to)?;
        let edge = self.graph.find_edge(*from_idx, *to_idx)?;
        Some(self.graph[edge].join_fields.clone())
    }

    /// All simple paths from `from` to `to`, bounded by the configured
    /// maximum length. Results are memoized.
    pub fn simple_paths(&self, from: &str, to: &str) -> Arc<Vec<Vec<String>>> {
        let key = (from.to_string(), to.to_string());
        if let Some(paths) = self
            .path_cache
            .read()
            .expect("path cache poisoned")
            .get(&key)
        {
            return paths.clone();
        }

        let paths = Arc::new(self.compute_simple_paths(from, to));
        self.path_cache
            .write()
            .expect("path cache poisoned")
            .insert(key, paths.clone());
        paths
    }

    fn compute_simple_paths(&self, from: &str, to: &str) -> Vec<Vec<String>> {
        let (Some(&start), Some(&goal)) = (self.indices.get(from), self.indices.get(to)) else {
            return Vec::new();
        };
        if start == goal {
            return vec![vec![from.to_string()]];
        }

        let mut paths = Vec::new();
        let mut stack = vec![start];
        let mut visited: BTreeSet<NodeIndex> = BTreeSet::new();
        visited.insert(start);
        self.dfs(start, goal, &mut stack, &mut visited, &mut paths);
        paths
    }

    fn dfs(
        &self,
        node: NodeIndex,
        goal: NodeIndex,
        stack: &mut Vec<NodeIndex>,
        visited: &mut BTreeSet<NodeIndex>,
        paths: &mut Vec<Vec<String>>,
    ) {
        if stack.len() >= self.max_path_len {
            return;
        }
        for edge in self.graph.edges(node) {
            let next = edge.target();
            if visited.contains(&next) {
                continue;
            }
            stack.push(next);
            if next == goal {
                paths.push(stack.iter().map(|idx| self.graph[*idx].clone()).collect());
            } else {
                visited.insert(next);
                self.dfs(next, goal, stack, visited, paths);
                visited.remove(&next);
            }
            stack.pop();
        }
    }

    /// Tables reachable from `from` by following join edges.
    pub fn descendants(&self, from: &str) -> BTreeSet<String> {
        let Some(&start) = self.indices.get(from) else {
            return BTreeSet::new();
        };
        let mut seen: BTreeSet<NodeIndex> = BTreeSet::new();
        let mut queue = vec![start];
        while let Some(node) = queue.pop() {
            for edge in self.graph.edges(node) {
                let next = edge.target();
                if next != start && seen.insert(next) {
                    queue.push(next);
                }
            }
        }
        seen.into_iter().map(|idx| self.graph[idx].clone()).collect()
    }
}
