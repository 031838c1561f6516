//! Foreign-key dependency graph and deterministic table ordering.
//!
//! Tables are ordered parent-before-child. Mutually referencing tables form
//! strongly connected components; each component of two or more tables is a
//! deferred group, loaded with integrity checks suspended and its foreign keys
//! applied after the data.

use crate::error::{MigrateError, Result};
use crate::schema::{DependencyEdge, TableMeta};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// How a table takes part in ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "snake_case")]
pub enum NodeTag {
    /// Ordinary topological position.
    Acyclic,
    /// Member of a cycle; `group` indexes `GraphOrder::deferred_groups`.
    Deferred { group: usize },
}

/// A table in dependency order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphNode {
    pub name: String,
    /// Kahn wave the table was released in. Equal ranks share no dependency.
    pub rank: usize,
    pub tag: NodeTag,
    /// Has a foreign key to itself.
    #[serde(default)]
    pub self_referencing: bool,
}

/// Result of ordering a set of tables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphOrder {
    pub nodes: Vec<GraphNode>,
    /// Each cycle's members, sorted by name.
    pub deferred_groups: Vec<Vec<String>>,
}

impl GraphOrder {
    pub fn order(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.name.as_str()).collect()
    }

    pub fn node(&self, name: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn rank_of(&self, name: &str) -> Option<usize> {
        self.node(name).map(|n| n.rank)
    }

    /// Constraints touching this table must wait until after the data load.
    pub fn defers_constraints(&self, name: &str) -> bool {
        self.node(name)
            .map(|n| n.self_referencing || matches!(n.tag, NodeTag::Deferred { .. }))
            .unwrap_or(false)
    }

    pub fn self_referencing(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| n.self_referencing)
            .map(|n| n.name.as_str())
            .collect()
    }
}

/// Orders tables by their foreign keys.
#[derive(Debug, Clone)]
pub struct DependencyGraphBuilder {
    defer_cycles: bool,
}

impl Default for DependencyGraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DependencyGraphBuilder {
    pub fn new() -> Self {
        Self { defer_cycles: true }
    }

    /// When false, a cycle is a fatal `DependencyCycle` error.
    pub fn defer_cycles(mut self, defer: bool) -> Self {
        self.defer_cycles = defer;
        self
    }

    pub fn build(&self, tables: &[TableMeta]) -> Result<GraphOrder> {
        let edges: Vec<DependencyEdge> = tables
            .iter()
            .flat_map(|t| {
                t.referenced_tables().map(move |parent| DependencyEdge {
                    from_table: t.name.clone(),
                    to_table: parent.to_string(),
                })
            })
            .collect();
        self.build_from_edges(tables.iter().map(|t| t.name.as_str()), &edges)
    }

    pub fn build_from_edges<'a, I>(&self, tables: I, edges: &[DependencyEdge]) -> Result<GraphOrder>
    where
        I: IntoIterator<Item = &'a str>,
    {
        // BTreeMap keeps node indices in name order
        let names: BTreeSet<&str> = tables.into_iter().collect();
        let names: Vec<&str> = names.into_iter().collect();
        let index: BTreeMap<&str, usize> = names.iter().enumerate().map(|(i, n)| (*n, i)).collect();

        let mut parents: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); names.len()];
        let mut self_ref = vec![false; names.len()];

        for edge in edges {
            let child = *index.get(edge.from_table.as_str()).ok_or_else(|| {
                MigrateError::Plan(format!(
                    "foreign key declared on unknown table '{}'",
                    edge.from_table
                ))
            })?;
            let parent = *index.get(edge.to_table.as_str()).ok_or_else(|| {
                MigrateError::Plan(format!(
                    "table '{}' references '{}', which is not in the schema description",
                    edge.from_table, edge.to_table
                ))
            })?;
            if child == parent {
                self_ref[child] = true;
            } else {
                parents[child].insert(parent);
            }
        }

        let components = strongly_connected(&parents);

        let mut deferred_groups: Vec<Vec<String>> = Vec::new();
        let mut component_group: Vec<Option<usize>> = vec![None; components.len()];
        let mut by_min: Vec<usize> = (0..components.len()).collect();
        by_min.sort_by_key(|&c| components[c][0]);
        for c in by_min {
            if components[c].len() > 1 {
                component_group[c] = Some(deferred_groups.len());
                deferred_groups.push(components[c].iter().map(|&i| names[i].to_string()).collect());
            }
        }

        if !deferred_groups.is_empty() && !self.defer_cycles {
            let members: Vec<String> = deferred_groups.iter().flatten().cloned().collect();
            return Err(MigrateError::DependencyCycle(members));
        }
        for group in &deferred_groups {
            warn!(
                "Cyclic foreign keys between {}; loading as a deferred-constraint group",
                group.join(", ")
            );
        }

        // Condense each component to one node keyed by its smallest member
        let mut component_of = vec![0usize; names.len()];
        for (c, members) in components.iter().enumerate() {
            for &m in members {
                component_of[m] = c;
            }
        }
        let mut component_parents: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); components.len()];
        for (child, ps) in parents.iter().enumerate() {
            for &p in ps {
                let (cc, pc) = (component_of[child], component_of[p]);
                if cc != pc {
                    component_parents[cc].insert(pc);
                }
            }
        }
        let keys: Vec<&str> = components.iter().map(|members| names[members[0]]).collect();

        let (ordered, leftover) = layered_topological_order(&keys, &component_parents);
        debug_assert!(leftover.is_empty(), "condensation is acyclic");

        let mut nodes = Vec::with_capacity(names.len());
        for (c, rank) in ordered {
            let tag = match component_group[c] {
                Some(group) => NodeTag::Deferred { group },
                None => NodeTag::Acyclic,
            };
            for &m in &components[c] {
                nodes.push(GraphNode {
                    name: names[m].to_string(),
                    rank,
                    tag,
                    self_referencing: self_ref[m],
                });
            }
        }

        debug!(
            "Dependency order: {} tables, {} deferred groups",
            nodes.len(),
            deferred_groups.len()
        );

        Ok(GraphOrder {
            nodes,
            deferred_groups,
        })
    }
}

/// Kahn's algorithm released in waves, each wave sorted by `keys`.
///
/// `parents[i]` lists the nodes `i` waits for and must not contain `i`.
/// Returns `(node, wave)` pairs in order plus the nodes stuck on a cycle,
/// sorted by key.
pub(crate) fn layered_topological_order<K: Ord>(
    keys: &[K],
    parents: &[BTreeSet<usize>],
) -> (Vec<(usize, usize)>, Vec<usize>) {
    let n = keys.len();
    let mut in_degree: Vec<usize> = parents.iter().map(|p| p.len()).collect();
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (child, ps) in parents.iter().enumerate() {
        for &p in ps {
            children[p].push(child);
        }
    }

    let mut wave: Vec<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut ordered = Vec::with_capacity(n);
    let mut rank = 0;
    while !wave.is_empty() {
        wave.sort_by(|&a, &b| keys[a].cmp(&keys[b]));
        let mut next = Vec::new();
        for &node in &wave {
            ordered.push((node, rank));
            for &child in &children[node] {
                in_degree[child] -= 1;
                if in_degree[child] == 0 {
                    next.push(child);
                }
            }
        }
        wave = next;
        rank += 1;
    }

    let mut emitted = vec![false; n];
    for &(node, _) in &ordered {
        emitted[node] = true;
    }
    let mut leftover: Vec<usize> = (0..n).filter(|&i| !emitted[i]).collect();
    leftover.sort_by(|&a, &b| keys[a].cmp(&keys[b]));

    (ordered, leftover)
}

/// Tarjan's algorithm. Components come back with members sorted ascending.
fn strongly_connected(edges: &[BTreeSet<usize>]) -> Vec<Vec<usize>> {
    struct Tarjan<'a> {
        edges: &'a [BTreeSet<usize>],
        next_index: usize,
        index: Vec<Option<usize>>,
        lowlink: Vec<usize>,
        on_stack: Vec<bool>,
        stack: Vec<usize>,
        components: Vec<Vec<usize>>,
    }

    impl Tarjan<'_> {
        fn visit(&mut self, v: usize) {
            self.index[v] = Some(self.next_index);
            self.lowlink[v] = self.next_index;
            self.next_index += 1;
            self.stack.push(v);
            self.on_stack[v] = true;

            let edges = self.edges;
            for &w in &edges[v] {
                match self.index[w] {
                    None => {
                        self.visit(w);
                        self.lowlink[v] = self.lowlink[v].min(self.lowlink[w]);
                    }
                    Some(wi) if self.on_stack[w] => {
                        self.lowlink[v] = self.lowlink[v].min(wi);
                    }
                    Some(_) => {}
                }
            }

            if self.index[v] == Some(self.lowlink[v]) {
                let mut component = Vec::new();
                while let Some(w) = self.stack.pop() {
                    self.on_stack[w] = false;
                    component.push(w);
                    if w == v {
                        break;
                    }
                }
                component.sort_unstable();
                self.components.push(component);
            }
        }
    }

    let n = edges.len();
    let mut tarjan = Tarjan {
        edges,
        next_index: 0,
        index: vec![None; n],
        lowlink: vec![0; n],
        on_stack: vec![false; n],
        stack: Vec::new(),
        components: Vec::new(),
    };
    for v in 0..n {
        if tarjan.index[v].is_none() {
            tarjan.visit(v);
        }
    }
    tarjan.components
}
