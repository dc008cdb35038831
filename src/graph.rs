//! Happens-before graph (spec.md §4.5): program-order edges per rank
//! plus synchronization edges from matched MPI calls, including the
//! ghost-node encoding that keeps all-to-all collectives acyclic.

use std::collections::{HashMap, VecDeque};

use crate::mpi::{MpiEdge, VerifyIoNode};

/// Rank value used for synthetic ghost nodes; never a real trace rank.
pub const GHOST_RANK: u32 = u32::MAX;

#[derive(Debug)]
pub struct Graph {
    nodes: Vec<VerifyIoNode>,
    successors: Vec<Vec<usize>>,
    predecessors: Vec<Vec<usize>>,
    index_by_key: HashMap<(u32, usize), usize>,
    /// Node indices in program order, per real rank (ghost nodes excluded).
    rank_sequences: Vec<Vec<usize>>,
    num_ranks: u32,
    vector_clocks: Vec<Vec<i64>>,
}

impl Graph {
    /// Builds the graph from each rank's retained nodes in program
    /// order plus the matched synchronization edges. `rank_sequences`
    /// must list every retained node (MPI calls and conflicting I/O
    /// calls) for that rank in emission order.
    pub fn build(rank_sequences_in: &[Vec<VerifyIoNode>], edges: &[MpiEdge]) -> Self {
        let num_ranks = rank_sequences_in.len() as u32;
        let mut nodes = Vec::new();
        let mut index_by_key = HashMap::new();
        let mut rank_sequences: Vec<Vec<usize>> = vec![Vec::new(); rank_sequences_in.len()];

        for (rank, seq_nodes) in rank_sequences_in.iter().enumerate() {
            for node in seq_nodes {
                let idx = nodes.len();
                index_by_key.insert((node.rank, node.seq), idx);
                nodes.push(node.clone());
                rank_sequences[rank].push(idx);
            }
        }

        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];

        for seq in &rank_sequences {
            for window in seq.windows(2) {
                successors[window[0]].push(window[1]);
            }
        }

        let mut ghost_seq = 0usize;
        let mut push_node = |nodes: &mut Vec<VerifyIoNode>, successors: &mut Vec<Vec<usize>>, node: VerifyIoNode| -> usize {
            let idx = nodes.len();
            nodes.push(node);
            successors.push(Vec::new());
            idx
        };

        let lookup = |index_by_key: &HashMap<(u32, usize), usize>, n: &VerifyIoNode| index_by_key.get(&(n.rank, n.seq)).copied();

        for edge in edges {
            match edge {
                MpiEdge::PointToPoint { head, tail } => {
                    if let (Some(h), Some(t)) = (lookup(&index_by_key, head), lookup(&index_by_key, tail)) {
                        successors[h].push(t);
                    }
                }
                MpiEdge::OneToMany { head, tails } => {
                    if let Some(h) = lookup(&index_by_key, head) {
                        for tail in tails {
                            if let Some(t) = lookup(&index_by_key, tail) {
                                successors[h].push(t);
                            }
                        }
                    }
                }
                MpiEdge::ManyToOne { heads, tail } => {
                    if let Some(t) = lookup(&index_by_key, tail) {
                        for head in heads {
                            if let Some(h) = lookup(&index_by_key, head) {
                                successors[h].push(t);
                            }
                        }
                    }
                }
                MpiEdge::AllToAll { participants } => {
                    let ghost = VerifyIoNode {
                        rank: GHOST_RANK,
                        seq: ghost_seq,
                        func: String::new(),
                        file_id: None,
                        file_handle: None,
                    };
                    ghost_seq += 1;
                    let g = push_node(&mut nodes, &mut successors, ghost);

                    for p in participants {
                        let p_idx = match lookup(&index_by_key, p) {
                            Some(i) => i,
                            None => continue,
                        };
                        // Redirect p's existing program-order successor
                        // (if any) to be a successor of the ghost node
                        // instead, then link p -> g.
                        if let Some(s) = next_po_successor(&rank_sequences, &index_by_key, p) {
                            successors[p_idx].retain(|&x| x != s);
                            successors[g].push(s);
                        }
                        successors[p_idx].push(g);
                    }
                }
            }
        }

        let mut predecessors: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
        for (u, outs) in successors.iter().enumerate() {
            for &v in outs {
                predecessors[v].push(u);
            }
        }

        let vector_clocks = compute_vector_clocks(&nodes, &successors, &predecessors, num_ranks);

        Graph {
            nodes,
            successors,
            predecessors,
            index_by_key,
            rank_sequences,
            num_ranks,
            vector_clocks,
        }
    }

    pub fn node_index(&self, rank: u32, seq: usize) -> Option<usize> {
        self.index_by_key.get(&(rank, seq)).copied()
    }

    pub fn node(&self, idx: usize) -> &VerifyIoNode {
        &self.nodes[idx]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn has_self_loop(&self, u: usize) -> bool {
        self.successors[u].contains(&u)
    }

    /// Reflexive-transitive reachability: `u` is reachable from itself.
    pub fn has_path(&self, u: usize, v: usize) -> bool {
        if u == v {
            return true;
        }
        let mut visited = vec![false; self.nodes.len()];
        let mut queue = VecDeque::from([u]);
        visited[u] = true;
        while let Some(cur) = queue.pop_front() {
            for &next in &self.successors[cur] {
                if next == v {
                    return true;
                }
                if !visited[next] {
                    visited[next] = true;
                    queue.push_back(next);
                }
            }
        }
        false
    }

    /// Any minimal-hop path from `u` to `v`, inclusive of both ends.
    pub fn shortest_path(&self, u: usize, v: usize) -> Option<Vec<usize>> {
        if u == v {
            return Some(vec![u]);
        }
        let mut visited = vec![false; self.nodes.len()];
        let mut parent = vec![usize::MAX; self.nodes.len()];
        let mut queue = VecDeque::from([u]);
        visited[u] = true;
        while let Some(cur) = queue.pop_front() {
            for &next in &self.successors[cur] {
                if visited[next] {
                    continue;
                }
                visited[next] = true;
                parent[next] = cur;
                if next == v {
                    let mut path = vec![v];
                    let mut cursor = cur;
                    while cursor != u {
                        path.push(cursor);
                        cursor = parent[cursor];
                    }
                    path.push(u);
                    path.reverse();
                    return Some(path);
                }
                queue.push_back(next);
            }
        }
        None
    }

    /// Nearest node of a function name in `names` strictly after `u`
    /// on `u`'s own rank, in program order.
    pub fn next_po(&self, u: usize, names: &[&str]) -> Option<usize> {
        let rank = self.nodes[u].rank;
        let seq = self.rank_sequence(rank)?;
        let pos = seq.iter().position(|&idx| idx == u)?;
        seq[pos + 1..].iter().copied().find(|&idx| names.contains(&self.nodes[idx].func.as_str()))
    }

    /// Nearest node of a function name in `names` strictly before `u`
    /// on `u`'s own rank, in program order.
    pub fn prev_po(&self, u: usize, names: &[&str]) -> Option<usize> {
        let rank = self.nodes[u].rank;
        let seq = self.rank_sequence(rank)?;
        let pos = seq.iter().position(|&idx| idx == u)?;
        seq[..pos].iter().rev().copied().find(|&idx| names.contains(&self.nodes[idx].func.as_str()))
    }

    /// Nearest node on `target_rank` whose function is in `names` and
    /// is reachable from `u`, scanning `target_rank`'s program order.
    pub fn next_hb(&self, u: usize, names: &[&str], target_rank: u32) -> Option<usize> {
        let seq = self.rank_sequence(target_rank)?;
        seq.iter()
            .copied()
            .find(|&idx| names.contains(&self.nodes[idx].func.as_str()) && self.has_path(u, idx))
    }

    pub fn vector_clock(&self, u: usize) -> &[i64] {
        &self.vector_clocks[u]
    }

    /// `u` happens-before `v` via vector-clock comparison rather than
    /// a graph search.
    pub fn happens_before_vc(&self, u: usize, v: usize) -> bool {
        let rank = self.rank_component(self.nodes[u].rank);
        self.vector_clocks[u][rank] < self.vector_clocks[v][rank]
    }

    fn rank_component(&self, rank: u32) -> usize {
        if rank == GHOST_RANK {
            self.num_ranks as usize
        } else {
            rank as usize
        }
    }

    fn rank_sequence(&self, rank: u32) -> Option<&[usize]> {
        if rank == GHOST_RANK {
            return None;
        }
        self.rank_sequences.get(rank as usize).map(|v| v.as_slice())
    }
}

fn next_po_successor(
    rank_sequences: &[Vec<usize>],
    index_by_key: &HashMap<(u32, usize), usize>,
    p: &VerifyIoNode,
) -> Option<usize> {
    let p_idx = *index_by_key.get(&(p.rank, p.seq))?;
    let seq = rank_sequences.get(p.rank as usize)?;
    let pos = seq.iter().position(|&idx| idx == p_idx)?;
    seq.get(pos + 1).copied()
}

/// Processes nodes in topological order, assigning each an (N+1)-wide
/// vector clock per spec.md §4.5's update rule.
fn compute_vector_clocks(
    nodes: &[VerifyIoNode],
    successors: &[Vec<usize>],
    predecessors: &[Vec<usize>],
    num_ranks: u32,
) -> Vec<Vec<i64>> {
    let width = num_ranks as usize + 1;
    let mut in_degree: Vec<usize> = predecessors.iter().map(|p| p.len()).collect();
    let mut queue: VecDeque<usize> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(u) = queue.pop_front() {
        order.push(u);
        for &v in &successors[u] {
            in_degree[v] -= 1;
            if in_degree[v] == 0 {
                queue.push_back(v);
            }
        }
    }

    let rank_component = |rank: u32| -> usize {
        if rank == GHOST_RANK {
            num_ranks as usize
        } else {
            rank as usize
        }
    };

    let mut vc = vec![vec![0i64; width]; nodes.len()];
    for u in order {
        let mut merged = vec![0i64; width];
        for &p in &predecessors[u] {
            let mut bumped = vc[p].clone();
            bumped[rank_component(nodes[p].rank)] += 1;
            for i in 0..width {
                merged[i] = merged[i].max(bumped[i]);
            }
        }
        vc[u] = merged;
    }
    vc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(rank: u32, seq: usize, func: &str) -> VerifyIoNode {
        VerifyIoNode { rank, seq, func: func.to_string(), file_id: None, file_handle: None }
    }

    #[test]
    fn reflexive_reachability() {
        let seqs = vec![vec![node(0, 0, "write")]];
        let graph = Graph::build(&seqs, &[]);
        assert!(graph.has_path(0, 0));
    }

    #[test]
    fn point_to_point_edge_is_reachable() {
        let seqs = vec![vec![node(0, 0, "write"), node(0, 1, "MPI_Send")], vec![node(1, 0, "MPI_Recv"), node(1, 1, "read")]];
        let edges = vec![MpiEdge::PointToPoint { head: node(0, 1, "MPI_Send"), tail: node(1, 0, "MPI_Recv") }];
        let graph = Graph::build(&seqs, &edges);
        let write = graph.node_index(0, 0).unwrap();
        let read = graph.node_index(1, 1).unwrap();
        assert!(graph.has_path(write, read));
    }

    #[test]
    fn all_to_all_ghost_node_keeps_graph_acyclic_and_connects_participants() {
        let seqs = vec![
            vec![node(0, 0, "write"), node(0, 1, "MPI_Barrier"), node(0, 2, "after0")],
            vec![node(1, 0, "read"), node(1, 1, "MPI_Barrier"), node(1, 2, "after1")],
        ];
        let participants = vec![node(0, 1, "MPI_Barrier"), node(1, 1, "MPI_Barrier")];
        let edges = vec![MpiEdge::AllToAll { participants }];
        let graph = Graph::build(&seqs, &edges);

        let write = graph.node_index(0, 0).unwrap();
        let read_node = graph.node_index(1, 0).unwrap();
        assert!(graph.has_path(write, read_node) || graph.has_path(read_node, write));

        // The ghost node is the extra node beyond the 6 real ones, and
        // is not reachable from itself through any other path.
        assert_eq!(graph.len(), 7);
        let ghost = graph.len() - 1;
        assert!(!graph.has_self_loop(ghost));
    }

    #[test]
    fn next_po_finds_nearest_matching_function_after() {
        let seqs = vec![vec![node(0, 0, "open"), node(0, 1, "write"), node(0, 2, "close")]];
        let graph = Graph::build(&seqs, &[]);
        let write = graph.node_index(0, 1).unwrap();
        let close = graph.next_po(write, &["close", "fclose"]).unwrap();
        assert_eq!(graph.node(close).func, "close");
    }

    #[test]
    fn vector_clock_orders_causally_related_nodes() {
        let seqs = vec![vec![node(0, 0, "write"), node(0, 1, "MPI_Send")], vec![node(1, 0, "MPI_Recv"), node(1, 1, "read")]];
        let edges = vec![MpiEdge::PointToPoint { head: node(0, 1, "MPI_Send"), tail: node(1, 0, "MPI_Recv") }];
        let graph = Graph::build(&seqs, &edges);
        let write = graph.node_index(0, 0).unwrap();
        let read = graph.node_index(1, 1).unwrap();
        assert!(graph.happens_before_vc(write, read));
    }
}
