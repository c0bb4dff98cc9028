use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::dag::Dag;
use crate::error::{Result, TychoError};

const DAMPING: f64 = 0.85;
const PAGERANK_ITERATIONS: usize = 100;
const PAGERANK_EPSILON: f64 = 1e-9;

/// PageRank over the dependency graph, normalized so the highest-ranked
/// node scores 1.0. Mass flows from a dependent to its dependencies, so
/// widely-depended-on tasks rank high.
pub fn pagerank(dag: &Dag) -> BTreeMap<String, f64> {
    let ids = dag.node_ids();
    let n = ids.len();
    if n == 0 {
        return BTreeMap::new();
    }

    let index: HashMap<&String, usize> = ids.iter().enumerate().map(|(i, id)| (id, i)).collect();
    let out_edges: Vec<Vec<usize>> = ids
        .iter()
        .map(|id| {
            dag.dependencies_of(id)
                .expect("node listed by the graph")
                .iter()
                .map(|dep| index[dep])
                .collect()
        })
        .collect();

    let uniform = 1.0 / n as f64;
    let mut rank = vec![uniform; n];

    for _ in 0..PAGERANK_ITERATIONS {
        let mut next = vec![(1.0 - DAMPING) / n as f64; n];
        let mut dangling = 0.0;
        for (i, targets) in out_edges.iter().enumerate() {
            if targets.is_empty() {
                dangling += rank[i];
            } else {
                let share = DAMPING * rank[i] / targets.len() as f64;
                for &t in targets {
                    next[t] += share;
                }
            }
        }
        // Dangling mass is spread uniformly.
        let dangling_share = DAMPING * dangling / n as f64;
        for value in &mut next {
            *value += dangling_share;
        }

        let delta: f64 = rank
            .iter()
            .zip(&next)
            .map(|(a, b)| (a - b).abs())
            .sum();
        rank = next;
        if delta < PAGERANK_EPSILON {
            break;
        }
    }

    let max = rank.iter().cloned().fold(0.0, f64::max);
    let scale = if max > 0.0 { 1.0 / max } else { 1.0 };
    ids.into_iter()
        .zip(rank)
        .map(|(id, r)| (id, r * scale))
        .collect()
}

/// Brandes betweenness centrality over dependency edges, normalized so the
/// most-central node scores 1.0 (all zeros stay zero).
pub fn betweenness(dag: &Dag) -> BTreeMap<String, f64> {
    let ids = dag.node_ids();
    let n = ids.len();
    if n == 0 {
        return BTreeMap::new();
    }

    let index: HashMap<&String, usize> = ids.iter().enumerate().map(|(i, id)| (id, i)).collect();
    let out_edges: Vec<Vec<usize>> = ids
        .iter()
        .map(|id| {
            dag.dependencies_of(id)
                .expect("node listed by the graph")
                .iter()
                .map(|dep| index[dep])
                .collect()
        })
        .collect();

    let mut centrality = vec![0.0_f64; n];

    for source in 0..n {
        // Single-source shortest paths (unweighted).
        let mut stack = Vec::new();
        let mut predecessors: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut sigma = vec![0.0_f64; n];
        let mut dist = vec![-1_i64; n];
        sigma[source] = 1.0;
        dist[source] = 0;

        let mut queue = VecDeque::new();
        queue.push_back(source);
        while let Some(v) = queue.pop_front() {
            stack.push(v);
            for &w in &out_edges[v] {
                if dist[w] < 0 {
                    dist[w] = dist[v] + 1;
                    queue.push_back(w);
                }
                if dist[w] == dist[v] + 1 {
                    sigma[w] += sigma[v];
                    predecessors[w].push(v);
                }
            }
        }

        // Back-propagate dependencies.
        let mut delta = vec![0.0_f64; n];
        while let Some(w) = stack.pop() {
            for &v in &predecessors[w] {
                delta[v] += sigma[v] / sigma[w] * (1.0 + delta[w]);
            }
            if w != source {
                centrality[w] += delta[w];
            }
        }
    }

    let max = centrality.iter().cloned().fold(0.0, f64::max);
    let scale = if max > 0.0 { 1.0 / max } else { 1.0 };
    ids.into_iter()
        .zip(centrality)
        .map(|(id, c)| (id, c * scale))
        .collect()
}

/// Composite impact score: `alpha * pagerank + (1 - alpha) * betweenness`.
/// `alpha` must lie in [0, 1].
pub fn impact_scores(dag: &Dag, alpha: f64) -> Result<BTreeMap<String, f64>> {
    if !(0.0..=1.0).contains(&alpha) || alpha.is_nan() {
        return Err(TychoError::AlphaOutOfRange(alpha));
    }
    let pr = pagerank(dag);
    let bc = betweenness(dag);
    Ok(pr
        .into_iter()
        .map(|(id, p)| {
            let b = bc.get(&id).copied().unwrap_or(0.0);
            (id, alpha * p + (1.0 - alpha) * b)
        })
        .collect())
}

/// Union-find partition of the graph into independent tracks (weakly
/// connected components). Partition ids are stable: components are numbered
/// by their lexicographically smallest member.
pub fn partitions(dag: &Dag) -> BTreeMap<String, usize> {
    let ids = dag.node_ids();
    let index: HashMap<&String, usize> = ids.iter().enumerate().map(|(i, id)| (id, i)).collect();
    let mut parent: Vec<usize> = (0..ids.len()).collect();

    fn find(parent: &mut Vec<usize>, x: usize) -> usize {
        let mut root = x;
        while parent[root] != root {
            root = parent[root];
        }
        // Path compression.
        let mut cursor = x;
        while parent[cursor] != root {
            let next = parent[cursor];
            parent[cursor] = root;
            cursor = next;
        }
        root
    }

    for id in &ids {
        for dep in dag.dependencies_of(id).expect("node listed by the graph") {
            let a = find(&mut parent, index[id]);
            let b = find(&mut parent, index[&dep]);
            if a != b {
                parent[a.max(b)] = a.min(b);
            }
        }
    }

    // Number components by smallest member; ids are sorted, so the first
    // occurrence of each root assigns the next partition number.
    let mut numbering: HashMap<usize, usize> = HashMap::new();
    let mut out = BTreeMap::new();
    for (i, id) in ids.iter().enumerate() {
        let root = find(&mut parent, i);
        let next = numbering.len();
        let track = *numbering.entry(root).or_insert(next);
        out.insert(id.clone(), track);
    }
    out
}
