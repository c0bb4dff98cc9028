use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::error::{Result, TychoError};

pub mod analysis;

/// Task dependency graph. Forward adjacency maps a node to the nodes it
/// depends on; reverse adjacency maps a node to its dependents. Both are
/// kept in lockstep by every mutation.
#[derive(Debug, Default, Clone)]
pub struct Dag {
    priorities: HashMap<String, i64>,
    forward: HashMap<String, BTreeSet<String>>,
    reverse: HashMap<String, BTreeSet<String>>,
}

impl Dag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node; fails if the id is already present.
    pub fn add_node(&mut self, id: &str, priority: i64) -> Result<()> {
        if self.priorities.contains_key(id) {
            return Err(TychoError::DuplicateNode(id.to_string()));
        }
        self.insert_node(id, priority);
        Ok(())
    }

    /// Add a node if absent; existing nodes keep their priority.
    pub fn ensure_node(&mut self, id: &str, priority: i64) {
        if !self.priorities.contains_key(id) {
            self.insert_node(id, priority);
        }
    }

    fn insert_node(&mut self, id: &str, priority: i64) {
        self.priorities.insert(id.to_string(), priority);
        self.forward.insert(id.to_string(), BTreeSet::new());
        self.reverse.insert(id.to_string(), BTreeSet::new());
    }

    /// Add an edge "`from` depends on `to`". Duplicate edges are a no-op;
    /// self-edges, unknown endpoints, and cycle-closing edges are errors.
    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<()> {
        if from == to {
            return Err(TychoError::SelfEdge(from.to_string()));
        }
        if !self.priorities.contains_key(from) {
            return Err(TychoError::NodeNotFound(from.to_string()));
        }
        if !self.priorities.contains_key(to) {
            return Err(TychoError::NodeNotFound(to.to_string()));
        }
        if self.forward[from].contains(to) {
            return Ok(());
        }
        // The edge closes a loop iff `to` already reaches `from` through
        // existing dependencies.
        if self.has_path(to, from) {
            return Err(TychoError::Cycle(from.to_string(), to.to_string()));
        }

        self.forward.get_mut(from).expect("checked above").insert(to.to_string());
        self.reverse.get_mut(to).expect("checked above").insert(from.to_string());
        Ok(())
    }

    /// Remove a node and every edge touching it.
    pub fn remove_node(&mut self, id: &str) -> Result<()> {
        if self.priorities.remove(id).is_none() {
            return Err(TychoError::NodeNotFound(id.to_string()));
        }
        if let Some(deps) = self.forward.remove(id) {
            for dep in deps {
                if let Some(dependents) = self.reverse.get_mut(&dep) {
                    dependents.remove(id);
                }
            }
        }
        if let Some(dependents) = self.reverse.remove(id) {
            for dependent in dependents {
                if let Some(deps) = self.forward.get_mut(&dependent) {
                    deps.remove(id);
                }
            }
        }
        Ok(())
    }

    /// Remove an edge; no-op if it does not exist.
    pub fn remove_edge(&mut self, from: &str, to: &str) -> Result<()> {
        if !self.priorities.contains_key(from) {
            return Err(TychoError::NodeNotFound(from.to_string()));
        }
        if !self.priorities.contains_key(to) {
            return Err(TychoError::NodeNotFound(to.to_string()));
        }
        self.forward.get_mut(from).expect("checked above").remove(to);
        self.reverse.get_mut(to).expect("checked above").remove(from);
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.priorities.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.priorities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.priorities.is_empty()
    }

    pub fn priority_of(&self, id: &str) -> Option<i64> {
        self.priorities.get(id).copied()
    }

    pub fn node_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.priorities.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Direct dependencies of a node.
    pub fn dependencies_of(&self, id: &str) -> Result<Vec<String>> {
        self.forward
            .get(id)
            .map(|deps| deps.iter().cloned().collect())
            .ok_or_else(|| TychoError::NodeNotFound(id.to_string()))
    }

    /// Direct dependents of a node.
    pub fn dependents_of(&self, id: &str) -> Result<Vec<String>> {
        self.reverse
            .get(id)
            .map(|deps| deps.iter().cloned().collect())
            .ok_or_else(|| TychoError::NodeNotFound(id.to_string()))
    }

    /// True if `src` reaches `dst` following dependency edges. Unknown
    /// nodes reach nothing.
    pub fn has_path(&self, src: &str, dst: &str) -> bool {
        if src == dst {
            return self.priorities.contains_key(src);
        }
        let mut visited: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = vec![src];
        while let Some(node) = stack.pop() {
            if !visited.insert(node) {
                continue;
            }
            let Some(deps) = self.forward.get(node) else {
                continue;
            };
            for dep in deps {
                if dep == dst {
                    return true;
                }
                stack.push(dep);
            }
        }
        false
    }

    /// All transitive dependencies of a node.
    pub fn ancestors(&self, id: &str) -> Result<BTreeSet<String>> {
        self.closure(id, &self.forward)
    }

    /// All transitive dependents of a node.
    pub fn descendants(&self, id: &str) -> Result<BTreeSet<String>> {
        self.closure(id, &self.reverse)
    }

    fn closure(
        &self,
        id: &str,
        adjacency: &HashMap<String, BTreeSet<String>>,
    ) -> Result<BTreeSet<String>> {
        if !self.priorities.contains_key(id) {
            return Err(TychoError::NodeNotFound(id.to_string()));
        }
        let mut out = BTreeSet::new();
        let mut stack: Vec<&String> = adjacency[id].iter().collect();
        while let Some(node) = stack.pop() {
            if out.insert(node.clone()) {
                stack.extend(adjacency[node].iter());
            }
        }
        Ok(out)
    }

    /// Nodes not yet done whose dependencies are all done, ordered by
    /// priority (higher first), ties broken lexicographically.
    pub fn ready(&self, done: &BTreeSet<String>) -> Vec<String> {
        let mut out: Vec<&String> = self
            .forward
            .iter()
            .filter(|(id, deps)| !done.contains(*id) && deps.iter().all(|d| done.contains(d)))
            .map(|(id, _)| id)
            .collect();
        out.sort_by(|a, b| {
            self.priorities[*b]
                .cmp(&self.priorities[*a])
                .then_with(|| a.cmp(b))
        });
        out.into_iter().cloned().collect()
    }

    /// Full topological order: every dependency precedes its dependents.
    /// Among simultaneously-ready nodes, higher priority first, then
    /// lexicographic. Fails if the graph holds a cycle.
    pub fn topological_sort(&self) -> Result<Vec<String>> {
        let mut remaining: HashMap<&String, usize> = self
            .forward
            .iter()
            .map(|(id, deps)| (id, deps.len()))
            .collect();
        let mut ready: Vec<&String> = remaining
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut out = Vec::with_capacity(remaining.len());

        while !ready.is_empty() {
            // Highest priority wins; lexicographically smallest breaks ties.
            ready.sort_by(|a, b| {
                self.priorities[*b]
                    .cmp(&self.priorities[*a])
                    .then_with(|| a.cmp(b))
            });
            let next = ready.remove(0);
            out.push(next.clone());
            remaining.remove(next);

            for dependent in &self.reverse[next] {
                if let Some(n) = remaining.get_mut(dependent) {
                    *n -= 1;
                    if *n == 0 {
                        ready.push(dependent);
                    }
                }
            }
        }

        if !remaining.is_empty() {
            return Err(TychoError::GraphCyclic);
        }
        Ok(out)
    }

    /// Kahn layering: each wave holds nodes whose dependencies all live in
    /// strictly earlier waves; lexicographic order within a wave. Fails if
    /// the graph holds a cycle.
    pub fn waves(&self) -> Result<Vec<Vec<String>>> {
        let mut remaining: BTreeMap<&String, BTreeSet<&String>> = self
            .forward
            .iter()
            .map(|(id, deps)| (id, deps.iter().collect()))
            .collect();
        let mut waves = Vec::new();

        while !remaining.is_empty() {
            let layer: Vec<String> = remaining
                .iter()
                .filter(|(_, deps)| deps.is_empty())
                .map(|(id, _)| (*id).clone())
                .collect();
            if layer.is_empty() {
                return Err(TychoError::GraphCyclic);
            }
            for id in &layer {
                remaining.remove(id);
            }
            for deps in remaining.values_mut() {
                deps.retain(|d| !layer.contains(*d));
            }
            waves.push(layer);
        }
        Ok(waves)
    }
}
