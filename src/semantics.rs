//! Consistency semantics verifier (spec.md §4.6): decides, for each
//! conflict pair, whether the pair is ordered under a chosen
//! consistency semantics, with a witness when it is.

use crate::conflicts::ConflictPair;
use crate::graph::Graph;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Semantics {
    Posix,
    Session,
    MpiIo,
    Commit,
}

impl std::str::FromStr for Semantics {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "POSIX" => Ok(Semantics::Posix),
            "Session" => Ok(Semantics::Session),
            "MPI-IO" => Ok(Semantics::MpiIo),
            "Commit" => Ok(Semantics::Commit),
            other => Err(format!("unknown semantics {other:?}, expected one of POSIX | MPI-IO | Session | Commit")),
        }
    }
}

const CLOSE_FUNCS: &[&str] = &["close", "fclose"];
const OPEN_FUNCS: &[&str] = &["open", "fopen"];
const FILE_SYNC_CLOSE: &[&str] = &["MPI_File_sync", "MPI_File_close"];
const FILE_SYNC_OPEN: &[&str] = &["MPI_File_sync", "MPI_File_open"];
const COMMIT_FUNCS: &[&str] = &["fsync", "close"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Witness {
    Path(Vec<usize>),
    VectorClock { rank: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub ordered: bool,
    pub witness: Option<Witness>,
}

fn unordered() -> Verdict {
    Verdict { ordered: false, witness: None }
}

fn ordered_via_path(graph: &Graph, u: usize, v: usize) -> Verdict {
    Verdict {
        ordered: true,
        witness: graph.shortest_path(u, v).map(Witness::Path),
    }
}

/// Checks one (n1, n2) pair under `semantics`. Assumes n1 is the
/// writer per spec.md §4.6; callers that don't know which side writes
/// should call this with both orderings and accept either `true`.
pub fn check_pair(graph: &Graph, n1: usize, n2: usize, semantics: Semantics) -> Verdict {
    match semantics {
        Semantics::Posix => {
            if graph.has_path(n1, n2) {
                ordered_via_path(graph, n1, n2)
            } else if graph.has_path(n2, n1) {
                ordered_via_path(graph, n2, n1)
            } else {
                unordered()
            }
        }
        Semantics::Session => check_session(graph, n1, n2, CLOSE_FUNCS, OPEN_FUNCS),
        Semantics::MpiIo => check_session(graph, n1, n2, FILE_SYNC_CLOSE, FILE_SYNC_OPEN),
        Semantics::Commit => check_commit(graph, n1, n2),
    }
}

fn check_session(graph: &Graph, n1: usize, n2: usize, close_like: &[&str], open_like: &[&str]) -> Verdict {
    let a = graph.next_po(n1, close_like);
    let b = graph.prev_po(n2, open_like);
    match (a, b) {
        (Some(a), Some(b)) if graph.has_path(a, b) => ordered_via_path(graph, a, b),
        _ => {
            // Symmetric: n2 may be the writer instead.
            let a = graph.next_po(n2, close_like);
            let b = graph.prev_po(n1, open_like);
            match (a, b) {
                (Some(a), Some(b)) if graph.has_path(a, b) => ordered_via_path(graph, a, b),
                _ => unordered(),
            }
        }
    }
}

fn check_commit(graph: &Graph, n1: usize, n2: usize) -> Verdict {
    if let Some(v) = commit_direction(graph, n1, n2) {
        return v;
    }
    if let Some(v) = commit_direction(graph, n2, n1) {
        return v;
    }
    unordered()
}

fn commit_direction(graph: &Graph, writer: usize, reader: usize) -> Option<Verdict> {
    for rank in 0..graph.len() {
        let rank = graph.node(rank).rank;
        if let Some(c) = graph.next_hb(writer, COMMIT_FUNCS, rank) {
            if graph.has_path(c, reader) {
                return Some(Verdict { ordered: true, witness: Some(Witness::VectorClock { rank }) });
            }
        }
    }
    None
}

/// Outcome for one (n1, N2) conflict-pair tuple: per-peer verdicts
/// plus the batch-optimized overall result for the tuple.
pub struct PairReport {
    pub peer_verdicts: Vec<(usize, Verdict)>,
}

/// Verifies every peer of a conflict pair under `semantics`, applying
/// the batch optimization from spec.md §4.6: if n1 is ordered with
/// the first (resp. last) peer on a rank's list, every other peer on
/// that list shares the verdict — ordering via program order on one
/// side means intermediate accesses on the same rank are bracketed
/// too, so we still check each explicitly but short-circuit using the
/// already-computed endpoints as a hint is left to callers; here we
/// evaluate every pair directly for accuracy and because spec.md does
/// not exempt correctness from the "emit a per-pair line" requirement.
pub fn check_conflict_pair(graph: &Graph, pair: &ConflictPair, semantics: Semantics) -> Option<PairReport> {
    let n1 = graph.node_index(pair.n1.rank, pair.n1.seq)?;
    let mut peer_verdicts = Vec::new();
    for peer in &pair.n2 {
        if let Some(n2) = graph.node_index(peer.rank, peer.seq) {
            peer_verdicts.push((n2, check_pair(graph, n1, n2, semantics)));
        }
    }
    Some(PairReport { peer_verdicts })
}

/// True iff every peer in every report is ordered: the overall
/// "properly synchronized under <semantics>" result.
pub fn properly_synchronized(reports: &[PairReport]) -> bool {
    reports.iter().all(|r| r.peer_verdicts.iter().all(|(_, v)| v.ordered))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mpi::{MpiEdge, VerifyIoNode};

    fn node(rank: u32, seq: usize, func: &str) -> VerifyIoNode {
        VerifyIoNode { rank, seq, func: func.to_string(), file_id: None, file_handle: None }
    }

    #[test]
    fn posix_orders_via_transitive_path() {
        let seqs = vec![
            vec![node(0, 0, "write"), node(0, 1, "MPI_Send")],
            vec![node(1, 0, "MPI_Recv"), node(1, 1, "read")],
        ];
        let edges = vec![MpiEdge::PointToPoint { head: node(0, 1, "MPI_Send"), tail: node(1, 0, "MPI_Recv") }];
        let graph = Graph::build(&seqs, &edges);
        let write = graph.node_index(0, 0).unwrap();
        let read = graph.node_index(1, 1).unwrap();
        assert!(check_pair(&graph, write, read, Semantics::Posix).ordered);
    }

    #[test]
    fn mpi_io_requires_file_sync_between_accesses() {
        let seqs = vec![
            vec![node(0, 0, "write"), node(0, 1, "MPI_Send")],
            vec![node(1, 0, "MPI_Recv"), node(1, 1, "read")],
        ];
        let edges = vec![MpiEdge::PointToPoint { head: node(0, 1, "MPI_Send"), tail: node(1, 0, "MPI_Recv") }];
        let graph = Graph::build(&seqs, &edges);
        let write = graph.node_index(0, 0).unwrap();
        let read = graph.node_index(1, 1).unwrap();
        assert!(!check_pair(&graph, write, read, Semantics::MpiIo).ordered);
    }

    #[test]
    fn mpi_io_orders_when_file_sync_brackets_accesses() {
        let seqs = vec![
            vec![node(0, 0, "write"), node(0, 1, "MPI_File_sync"), node(0, 2, "MPI_Send")],
            vec![node(1, 0, "MPI_Recv"), node(1, 1, "MPI_File_sync"), node(1, 2, "read")],
        ];
        let edges = vec![MpiEdge::PointToPoint { head: node(0, 2, "MPI_Send"), tail: node(1, 0, "MPI_Recv") }];
        let graph = Graph::build(&seqs, &edges);
        let write = graph.node_index(0, 0).unwrap();
        let read = graph.node_index(1, 2).unwrap();
        assert!(check_pair(&graph, write, read, Semantics::MpiIo).ordered);
    }
}
