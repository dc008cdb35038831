//! MPI call matcher (spec.md §4.4): classifies MPI-prefixed calls,
//! extracts their synchronization-relevant fields, and matches
//! point-to-point sends to receives and collective instances across
//! ranks into [`MpiEdge`]s.

use std::collections::{HashMap, VecDeque};

use crate::error::{AnalysisWarning, WarningKind, WarningSink};
use crate::meta::FunctionTable;
use crate::record::Record;
use crate::translator::{Translator, ANY_SOURCE};

const ANY_TAG: i32 = -1;

/// Identifies one retained MPI call: (rank, sequence-index-within-rank,
/// function-name). Optional file context is informational only;
/// identity is the triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyIoNode {
    pub rank: u32,
    pub seq: usize,
    pub func: String,
    pub file_id: Option<i32>,
    pub file_handle: Option<String>,
}

impl VerifyIoNode {
    fn new(rank: u32, seq: usize, func: &str) -> Self {
        VerifyIoNode {
            rank,
            seq,
            func: func.to_string(),
            file_id: None,
            file_handle: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MpiEdge {
    AllToAll { participants: Vec<VerifyIoNode> },
    OneToMany { head: VerifyIoNode, tails: Vec<VerifyIoNode> },
    ManyToOne { heads: Vec<VerifyIoNode>, tail: VerifyIoNode },
    PointToPoint { head: VerifyIoNode, tail: VerifyIoNode },
}

/// Whether to use the full classification set or the sync-only subset
/// used for MPI-IO consistency reasoning (spec.md §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassSet {
    Standard,
    SyncOnly,
}

const SEND_FUNCS: &[&str] = &["MPI_Send", "MPI_Ssend", "MPI_Isend", "MPI_Sendrecv"];
const RECV_FUNCS: &[&str] = &["MPI_Recv", "MPI_Irecv", "MPI_Sendrecv"];
const BCAST_FUNCS: &[&str] = &["MPI_Bcast", "MPI_Ibcast"];
const REDGAT_FUNCS: &[&str] = &[
    "MPI_Reduce", "MPI_Ireduce", "MPI_Gather", "MPI_Igather", "MPI_Gatherv", "MPI_Igatherv",
];
const ALLTOALL_FUNCS_STANDARD: &[&str] = &[
    "MPI_Barrier", "MPI_Allreduce", "MPI_Allgather", "MPI_Allgatherv", "MPI_Alltoall",
    "MPI_Alltoallv", "MPI_Alltoallw", "MPI_Reduce_scatter", "MPI_Reduce_scatter_block",
    "MPI_File_open", "MPI_File_close", "MPI_File_read_all", "MPI_File_read_at_all",
    "MPI_File_read_ordered", "MPI_File_write_all", "MPI_File_write_at_all",
    "MPI_File_write_ordered", "MPI_File_set_size", "MPI_File_set_view", "MPI_File_sync",
    "MPI_Comm_dup", "MPI_Comm_split", "MPI_Comm_split_type", "MPI_Comm_create",
    "MPI_Cart_create", "MPI_Cart_sub",
];
const ALLTOALL_FUNCS_SYNC_ONLY: &[&str] = &[
    "MPI_Barrier", "MPI_Allgather", "MPI_Alltoall", "MPI_Alltoallv", "MPI_Alltoallw",
    "MPI_Allreduce", "MPI_Reduce_scatter", "MPI_Reduce_scatter_block",
];
const COMPLETION_FUNCS: &[&str] = &[
    "MPI_Wait", "MPI_Waitall", "MPI_Waitany", "MPI_Waitsome",
    "MPI_Test", "MPI_Testall", "MPI_Testany", "MPI_Testsome",
];

fn is_blocking(func: &str) -> bool {
    !func.starts_with("MPI_I")
}

fn is_bcast(func: &str, classes: ClassSet) -> bool {
    classes == ClassSet::Standard && BCAST_FUNCS.contains(&func)
}

fn is_redgat(func: &str) -> bool {
    REDGAT_FUNCS.contains(&func)
}

fn is_all_to_all(func: &str, classes: ClassSet) -> bool {
    match classes {
        ClassSet::Standard => ALLTOALL_FUNCS_STANDARD.contains(&func),
        ClassSet::SyncOnly => ALLTOALL_FUNCS_SYNC_ONLY.contains(&func),
    }
}

fn is_collective(func: &str, classes: ClassSet) -> bool {
    is_bcast(func, classes) || is_redgat(func) || is_all_to_all(func, classes)
}

/// Completion semantics for a wait/test-family call: how many of the
/// requests it names must resolve, and whether it resolves a specific
/// index or any/all of its request set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompletionKind {
    All,
    Any,
    Some_,
}

fn completion_kind(func: &str) -> CompletionKind {
    match func {
        "MPI_Waitany" | "MPI_Testany" => CompletionKind::Any,
        "MPI_Waitsome" | "MPI_Testsome" => CompletionKind::Some_,
        _ => CompletionKind::All,
    }
}

#[derive(Debug, Clone)]
struct MpiCall {
    node: VerifyIoNode,
    func: String,
    src: Option<i32>,
    dst: Option<i32>,
    stag: Option<i32>,
    rtag: Option<i32>,
    comm: Option<String>,
    /// The request or file handle this call issues, for nonblocking
    /// sends/receives and nonblocking collectives/file calls.
    request: Option<String>,
}

#[derive(Debug, Clone)]
struct WaitTestCall {
    node: VerifyIoNode,
    kind: CompletionKind,
    requests: Vec<String>,
    tindx: Option<Vec<String>>,
    src: Option<i32>,
    rtag: Option<i32>,
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_status(raw: &str) -> (i32, i32) {
    if let Some(inner) = raw.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        let mut parts = inner.splitn(2, '_');
        let src = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        let tag = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        (src, tag)
    } else {
        (0, 0)
    }
}

fn arg(record: &Record, idx: usize) -> Option<String> {
    record.arg_str(idx).map(|s| s.into_owned())
}

fn arg_i32(record: &Record, idx: usize) -> Option<i32> {
    arg(record, idx).and_then(|s| s.trim().parse().ok())
}

enum Extracted {
    Call(MpiCall),
    Completion(WaitTestCall),
    /// A recognized call that contributes nothing: a flag-false
    /// `MPI_Test`/`MPI_Testall`/`MPI_Testsome` (spec.md §4.4). Not a
    /// warning-worthy condition, unlike `Ignored`.
    NoOp,
    /// A function id the matcher doesn't recognize at all.
    Ignored,
}

/// Table-driven per-call field extraction, grounded on
/// `examples/original_source/tools/verifyio/gen_nodes.py::generate_mpi_nodes`.
fn extract(node: VerifyIoNode, func: &str, record: &Record) -> Extracted {
    match func {
        "MPI_Send" | "MPI_Ssend" | "MPI_Isend" => Extracted::Call(MpiCall {
            node: node.clone(),
            func: func.to_string(),
            src: None,
            dst: arg_i32(record, 3),
            stag: arg_i32(record, 4),
            rtag: None,
            comm: arg(record, 5),
            request: if func == "MPI_Isend" { arg(record, 6) } else { None },
        }),
        "MPI_Recv" => {
            let mut src = arg_i32(record, 3);
            let mut rtag = arg_i32(record, 4);
            if src == Some(ANY_SOURCE) || rtag == Some(ANY_TAG) {
                if let Some(status) = arg(record, 6) {
                    let (s, t) = parse_status(&status);
                    if src == Some(ANY_SOURCE) {
                        src = Some(s);
                    }
                    if rtag == Some(ANY_TAG) {
                        rtag = Some(t);
                    }
                }
            }
            Extracted::Call(MpiCall {
                node,
                func: func.to_string(),
                src,
                dst: None,
                stag: None,
                rtag,
                comm: arg(record, 5),
                request: None,
            })
        }
        "MPI_Irecv" => Extracted::Call(MpiCall {
            node,
            func: func.to_string(),
            src: arg_i32(record, 3),
            dst: None,
            stag: None,
            rtag: arg_i32(record, 4),
            comm: arg(record, 5),
            request: arg(record, 6),
        }),
        "MPI_Sendrecv" => Extracted::Call(MpiCall {
            node,
            func: func.to_string(),
            src: arg_i32(record, 8),
            dst: arg_i32(record, 3),
            stag: arg_i32(record, 4),
            rtag: arg_i32(record, 9),
            comm: arg(record, 10),
            request: None,
        }),
        "MPI_Wait" => Extracted::completion_single(node, func, record, 0, Some(1)),
        "MPI_Test" => {
            if arg_i32(record, 1) == Some(0) {
                return Extracted::NoOp;
            }
            Extracted::completion_single(node, func, record, 0, Some(2))
        }
        "MPI_Waitall" => Extracted::completion_all(node, func, record, 1),
        "MPI_Testall" => {
            if arg_i32(record, 2) == Some(0) {
                return Extracted::NoOp;
            }
            Extracted::completion_all(node, func, record, 1)
        }
        "MPI_Waitany" => Extracted::completion_any(node, func, record, 1, 2),
        "MPI_Testany" => Extracted::completion_any(node, func, record, 1, 2),
        "MPI_Waitsome" => Extracted::completion_some(node, func, record, 1, 3),
        "MPI_Testsome" => {
            if arg_i32(record, 2) == Some(0) {
                return Extracted::NoOp;
            }
            Extracted::completion_some(node, func, record, 1, 3)
        }
        "MPI_Bcast" => Extracted::Call(MpiCall {
            node,
            func: func.to_string(),
            src: arg_i32(record, 3),
            dst: None,
            stag: None,
            rtag: None,
            comm: arg(record, 4),
            request: None,
        }),
        "MPI_Ibcast" => Extracted::Call(MpiCall {
            node,
            func: func.to_string(),
            src: arg_i32(record, 3),
            dst: None,
            stag: None,
            rtag: None,
            comm: arg(record, 4),
            request: arg(record, 5),
        }),
        "MPI_Reduce" => many_to_one(node, func, record, 5, 6, None),
        "MPI_Ireduce" => many_to_one(node, func, record, 5, 6, Some(7)),
        "MPI_Gather" => many_to_one(node, func, record, 6, 7, None),
        "MPI_Igather" => many_to_one(node, func, record, 6, 7, Some(8)),
        "MPI_Gatherv" => many_to_one(node, func, record, 7, 8, None),
        "MPI_Igatherv" => many_to_one(node, func, record, 7, 8, Some(9)),
        "MPI_Barrier" => all_to_all_no_req(node, func, record, 0),
        "MPI_Alltoall" => all_to_all_no_req(node, func, record, 6),
        "MPI_Alltoallv" => all_to_all_no_req(node, func, record, 8),
        "MPI_Alltoallw" => all_to_all_no_req(node, func, record, 8),
        "MPI_Allreduce" => all_to_all_no_req(node, func, record, 5),
        "MPI_Allgather" => all_to_all_no_req(node, func, record, 6),
        "MPI_Allgatherv" => all_to_all_no_req(node, func, record, 7),
        "MPI_Reduce_scatter" => all_to_all_no_req(node, func, record, 5),
        "MPI_Reduce_scatter_block" => all_to_all_no_req(node, func, record, 5),
        "MPI_File_open" => Extracted::Call(MpiCall {
            node,
            func: func.to_string(),
            src: None,
            dst: None,
            stag: None,
            rtag: None,
            comm: arg(record, 0),
            request: arg(record, 1),
        }),
        "MPI_File_close" | "MPI_File_set_size" | "MPI_File_sync" | "MPI_File_read_all"
        | "MPI_File_read_ordered" | "MPI_File_write_all" | "MPI_File_write_ordered" => {
            Extracted::Call(MpiCall {
                node,
                func: func.to_string(),
                src: None,
                dst: None,
                stag: None,
                rtag: None,
                comm: None,
                request: arg(record, 0),
            })
        }
        "MPI_File_read_at_all" | "MPI_File_write_at_all" => Extracted::Call(MpiCall {
            node,
            func: func.to_string(),
            src: None,
            dst: None,
            stag: None,
            rtag: None,
            comm: None,
            request: arg(record, 0),
        }),
        "MPI_File_set_view" => Extracted::Call(MpiCall {
            node,
            func: func.to_string(),
            src: None,
            dst: None,
            stag: None,
            rtag: None,
            comm: arg(record, 0),
            request: arg(record, 2),
        }),
        "MPI_Comm_dup" => all_to_all_no_req(node, func, record, 1),
        "MPI_Comm_split" => all_to_all_no_req(node, func, record, 3),
        "MPI_Comm_split_type" => all_to_all_no_req(node, func, record, 4),
        "MPI_Comm_create" => all_to_all_no_req(node, func, record, 2),
        "MPI_Cart_create" => all_to_all_no_req(node, func, record, 5),
        "MPI_Cart_sub" => all_to_all_no_req(node, func, record, 2),
        _ => Extracted::Ignored,
    }
}

fn many_to_one(node: VerifyIoNode, func: &str, record: &Record, dst_idx: usize, comm_idx: usize, req_idx: Option<usize>) -> Extracted {
    Extracted::Call(MpiCall {
        node,
        func: func.to_string(),
        src: None,
        dst: arg_i32(record, dst_idx),
        stag: None,
        rtag: None,
        comm: arg(record, comm_idx),
        request: req_idx.and_then(|i| arg(record, i)),
    })
}

fn all_to_all_no_req(node: VerifyIoNode, func: &str, record: &Record, comm_idx: usize) -> Extracted {
    Extracted::Call(MpiCall {
        node,
        func: func.to_string(),
        src: None,
        dst: None,
        stag: None,
        rtag: None,
        comm: arg(record, comm_idx),
        request: None,
    })
}

impl Extracted {
    fn completion_single(node: VerifyIoNode, func: &str, record: &Record, req_idx: usize, status_idx: Option<usize>) -> Self {
        let req = arg(record, req_idx).unwrap_or_default();
        let (src, rtag) = status_idx
            .and_then(|i| arg(record, i))
            .map(|s| parse_status(&s))
            .map(|(s, t)| (Some(s), Some(t)))
            .unwrap_or((None, None));
        Extracted::Completion(WaitTestCall {
            node,
            kind: completion_kind(func),
            requests: vec![req],
            tindx: None,
            src,
            rtag,
        })
    }

    fn completion_all(node: VerifyIoNode, func: &str, record: &Record, req_idx: usize) -> Self {
        let requests = arg(record, req_idx).map(|s| parse_list(&s)).unwrap_or_default();
        Extracted::Completion(WaitTestCall {
            node,
            kind: completion_kind(func),
            requests,
            tindx: None,
            src: None,
            rtag: None,
        })
    }

    fn completion_any(node: VerifyIoNode, func: &str, record: &Record, req_idx: usize, tindx_idx: usize) -> Self {
        let requests = arg(record, req_idx).map(|s| parse_list(&s)).unwrap_or_default();
        let tindx = arg(record, tindx_idx).map(|s| vec![s]);
        Extracted::Completion(WaitTestCall {
            node,
            kind: completion_kind(func),
            requests,
            tindx,
            src: None,
            rtag: None,
        })
    }

    fn completion_some(node: VerifyIoNode, func: &str, record: &Record, req_idx: usize, tindx_idx: usize) -> Self {
        let requests = arg(record, req_idx).map(|s| parse_list(&s)).unwrap_or_default();
        let tindx = arg(record, tindx_idx).map(|s| parse_list(&s));
        Extracted::Completion(WaitTestCall {
            node,
            kind: completion_kind(func),
            requests,
            tindx,
            src: None,
            rtag: None,
        })
    }
}

fn coll_key(call: &MpiCall) -> String {
    let id = call.comm.clone().or_else(|| call.request.clone()).unwrap_or_default();
    format!("{};{}", call.func, id)
}

/// Pops the earliest wait/test call on `rank` that resolves `req`,
/// consuming it (and, for single/all completions, removing the whole
/// entry once its request set is empty). Grounded on
/// `match_mpi.py::find_wait_test_call`.
fn resolve_completion(
    rank: u32,
    req: &str,
    need_src_tag: bool,
    src: i32,
    tag: i32,
    wait_test: &mut HashMap<u32, Vec<WaitTestCall>>,
) -> Option<VerifyIoNode> {
    let calls = wait_test.entry(rank).or_default();
    for i in 0..calls.len() {
        let matches_req = calls[i].requests.iter().any(|r| r == req);
        if !matches_req {
            continue;
        }
        match calls[i].kind {
            CompletionKind::All => {
                if need_src_tag && (calls[i].src != Some(src) || calls[i].rtag != Some(tag)) {
                    continue;
                }
                let node = calls[i].node.clone();
                calls[i].requests.retain(|r| r != req);
                if calls[i].requests.is_empty() {
                    calls.remove(i);
                }
                return Some(node);
            }
            CompletionKind::Any => {
                let pos = calls[i].requests.iter().position(|r| r == req).unwrap();
                let resolves = calls[i]
                    .tindx
                    .as_ref()
                    .map(|t| t.iter().any(|s| s == &pos.to_string()))
                    .unwrap_or(false);
                if resolves {
                    let node = calls[i].node.clone();
                    calls.remove(i);
                    return Some(node);
                }
            }
            CompletionKind::Some_ => {
                let pos = calls[i].requests.iter().position(|r| r == req).unwrap();
                let resolves = calls[i]
                    .tindx
                    .as_ref()
                    .map(|t| t.iter().any(|s| s == &pos.to_string()))
                    .unwrap_or(false);
                if resolves {
                    let node = calls[i].node.clone();
                    calls[i].requests.retain(|r| r != req);
                    if let Some(t) = calls[i].tindx.as_mut() {
                        t.retain(|s| s != &pos.to_string());
                    }
                    if calls[i].tindx.as_ref().map(|t| t.is_empty()).unwrap_or(true) {
                        calls.remove(i);
                    }
                    return Some(node);
                }
            }
        }
    }
    None
}

/// Lists every retained MPI call per rank, in program order, the same
/// way [`match_calls`] walks records internally but without discarding
/// the node identities. Used by callers assembling a [`crate::graph::Graph`]'s
/// per-rank node sequences.
pub fn collect_mpi_nodes(records: &[Vec<Record>], functions: &FunctionTable) -> Vec<Vec<VerifyIoNode>> {
    records
        .iter()
        .enumerate()
        .map(|(rank_idx, rank_records)| {
            let rank = rank_idx as u32;
            rank_records
                .iter()
                .enumerate()
                .filter_map(|(seq, record)| {
                    let func = functions.get(record.func_id)?;
                    if !func.starts_with("MPI_") {
                        return None;
                    }
                    let node = VerifyIoNode::new(rank, seq, func);
                    match extract(node.clone(), func, record) {
                        Extracted::Ignored | Extracted::NoOp => None,
                        Extracted::Call(_) | Extracted::Completion(_) => Some(node),
                    }
                })
                .collect()
        })
        .collect()
}

/// Matches every rank's extracted MPI calls into [`MpiEdge`]s.
/// Two-phase: extract every call up front, then walk rank-major,
/// draining collective FIFOs and pending-receive indices as matches
/// are found. Grounded on `match_mpi.py::match_mpi_calls`.
pub fn match_calls(
    records: &[Vec<Record>],
    functions: &FunctionTable,
    translator: &Translator,
    classes: ClassSet,
    warnings: &mut WarningSink,
) -> Vec<MpiEdge> {
    let num_ranks = records.len() as u32;
    let mut all_calls: Vec<Vec<MpiCall>> = vec![Vec::new(); num_ranks as usize];
    let mut coll_fifo: Vec<HashMap<String, VecDeque<usize>>> = vec![HashMap::new(); num_ranks as usize];
    // recv_pending[receiver][sender] -> indices into all_calls[receiver]; sender == ANY_SOURCE bucketed separately.
    let mut recv_pending: HashMap<(u32, i32), VecDeque<usize>> = HashMap::new();
    let mut wait_test: HashMap<u32, Vec<WaitTestCall>> = HashMap::new();

    for (rank_idx, rank_records) in records.iter().enumerate() {
        let rank = rank_idx as u32;
        for (seq, record) in rank_records.iter().enumerate() {
            let func = match functions.get(record.func_id) {
                Some(f) => f,
                None => continue,
            };
            if !func.starts_with("MPI_") {
                continue;
            }
            let node = VerifyIoNode::new(rank, seq, func);
            match extract(node, func, record) {
                Extracted::NoOp => {}
                Extracted::Ignored => {
                    warnings.push(AnalysisWarning::at(
                        WarningKind::UnknownFunctionId { func_id: record.func_id },
                        rank,
                        seq,
                    ));
                }
                Extracted::Completion(w) => {
                    wait_test.entry(rank).or_default().push(w);
                }
                Extracted::Call(call) => {
                    let idx = all_calls[rank_idx].len();
                    if is_collective(&call.func, classes) {
                        let key = coll_key(&call);
                        coll_fifo[rank_idx].entry(key).or_default().push_back(idx);
                    }
                    if RECV_FUNCS.contains(&call.func.as_str()) {
                        let comm = call.comm.clone().unwrap_or_default();
                        let global_src = call
                            .src
                            .map(|s| translator.local_to_global_checked(&comm, s, warnings, rank, seq) as i32)
                            .unwrap_or(ANY_SOURCE);
                        recv_pending.entry((rank, global_src)).or_default().push_back(idx);
                    }
                    all_calls[rank_idx].push(call);
                }
            }
        }
    }

    let mut edges = Vec::new();
    let mut matched: Vec<Vec<bool>> = all_calls.iter().map(|c| vec![false; c.len()]).collect();

    for rank_idx in 0..num_ranks as usize {
        for idx in 0..all_calls[rank_idx].len() {
            if matched[rank_idx][idx] {
                continue;
            }
            let func = all_calls[rank_idx][idx].func.clone();
            if is_collective(&func, classes) {
                if let Some(edge) = match_collective(
                    rank_idx as u32,
                    idx,
                    &func,
                    classes,
                    &all_calls,
                    &mut matched,
                    &mut coll_fifo,
                    &mut wait_test,
                    translator,
                    warnings,
                ) {
                    edges.push(edge);
                }
            } else if SEND_FUNCS.contains(&func.as_str()) {
                matched[rank_idx][idx] = true;
                match match_point_to_point(
                    rank_idx as u32,
                    idx,
                    &all_calls,
                    &mut recv_pending,
                    &mut matched,
                    &mut wait_test,
                    translator,
                    warnings,
                ) {
                    Some(edge) => edges.push(edge),
                    None => warnings.push(AnalysisWarning::at(WarningKind::UnmatchedSend, rank_idx as u32, idx)),
                }
            }
        }
    }

    for rank_idx in 0..num_ranks as usize {
        for (key, fifo) in &coll_fifo[rank_idx] {
            if !fifo.is_empty() {
                warnings.push(AnalysisWarning::new(WarningKind::UnmatchedCollective {
                    key: key.clone(),
                    stragglers: fifo.len(),
                }));
            }
        }
    }

    edges
}

#[allow(clippy::too_many_arguments)]
fn match_collective(
    rank: u32,
    idx: usize,
    func: &str,
    classes: ClassSet,
    all_calls: &[Vec<MpiCall>],
    matched: &mut [Vec<bool>],
    coll_fifo: &mut [HashMap<String, VecDeque<usize>>],
    wait_test: &mut HashMap<u32, Vec<WaitTestCall>>,
    translator: &Translator,
    warnings: &mut WarningSink,
) -> Option<MpiEdge> {
    let anchor = &all_calls[rank as usize][idx];
    let key = coll_key(anchor);
    let is_alltoall = is_all_to_all(func, classes);
    let comm = anchor.comm.clone().unwrap_or_default();

    // Root rank (translated to world) for one-to-many / many-to-one
    // classification; irrelevant for all-to-all.
    let root_field = if is_bcast(func, classes) { anchor.src } else { anchor.dst };
    let global_root = root_field.map(|r| translator.local_to_global_checked(&comm, r, warnings, rank, idx));

    let mut participants: Vec<VerifyIoNode> = Vec::new();
    let mut head: Option<VerifyIoNode> = None;
    let mut tail: Option<VerifyIoNode> = None;
    let mut others: Vec<VerifyIoNode> = Vec::new();

    for r in 0..all_calls.len() as u32 {
        let fifo = match coll_fifo[r as usize].get_mut(&key) {
            Some(f) => f,
            None => continue,
        };
        let other_idx = match fifo.pop_front() {
            Some(i) => i,
            None => continue,
        };
        if fifo.is_empty() {
            coll_fifo[r as usize].remove(&key);
        }
        matched[r as usize][other_idx] = true;
        let other = &all_calls[r as usize][other_idx];

        let resolved = if is_blocking(&other.func) {
            Some(other.node.clone())
        } else {
            other
                .request
                .as_ref()
                .and_then(|req| resolve_completion(r, req, false, 0, 0, wait_test))
        };
        let resolved = match resolved {
            Some(n) => n,
            None => continue,
        };

        if is_alltoall {
            participants.push(resolved);
        } else if is_bcast(func, classes) {
            if Some(r) == global_root {
                head = Some(resolved);
            } else {
                others.push(resolved);
            }
        } else {
            if Some(r) == global_root {
                tail = Some(resolved);
            } else {
                others.push(resolved);
            }
        }
    }

    if is_alltoall {
        if participants.is_empty() {
            return None;
        }
        Some(MpiEdge::AllToAll { participants })
    } else if is_bcast(func, classes) {
        head.map(|h| MpiEdge::OneToMany { head: h, tails: others })
    } else {
        tail.map(|t| MpiEdge::ManyToOne { heads: others, tail: t })
    }
}

fn match_point_to_point(
    rank: u32,
    idx: usize,
    all_calls: &[Vec<MpiCall>],
    recv_pending: &mut HashMap<(u32, i32), VecDeque<usize>>,
    matched: &mut [Vec<bool>],
    wait_test: &mut HashMap<u32, Vec<WaitTestCall>>,
    translator: &Translator,
    warnings: &mut WarningSink,
) -> Option<MpiEdge> {
    let send = all_calls[rank as usize][idx].clone();
    let comm = send.comm.clone().unwrap_or_default();
    let global_dst = translator.local_to_global_checked(&comm, send.dst.unwrap_or(0), warnings, rank, idx);

    let candidates = [(global_dst, rank as i32), (global_dst, ANY_SOURCE)];
    for (recv_rank, sender_key) in candidates {
        let queue = match recv_pending.get_mut(&(recv_rank, sender_key)) {
            Some(q) => q,
            None => continue,
        };
        let mut found_pos = None;
        for (pos, &recv_idx) in queue.iter().enumerate() {
            let recv = &all_calls[recv_rank as usize][recv_idx];
            let recv_comm = recv.comm.clone().unwrap_or_default();
            if recv_comm != comm {
                continue;
            }
            if recv.rtag == send.stag || recv.rtag == Some(ANY_TAG) {
                found_pos = Some(pos);
                break;
            }
        }
        if let Some(pos) = found_pos {
            let recv_idx = queue.remove(pos).unwrap();
            let recv = all_calls[recv_rank as usize][recv_idx].clone();
            matched[recv_rank as usize][recv_idx] = true;

            let tail = if is_blocking(&recv.func) {
                Some(recv.node.clone())
            } else {
                let need_src_tag = recv.rtag == Some(ANY_TAG) || sender_key == ANY_SOURCE;
                recv.request.as_ref().and_then(|req| {
                    resolve_completion(
                        recv_rank,
                        req,
                        need_src_tag,
                        rank as i32,
                        send.stag.unwrap_or(0),
                        wait_test,
                    )
                })
            };

            return tail.map(|t| MpiEdge::PointToPoint { head: send.node.clone(), tail: t });
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::FunctionTable;

    fn rec(func: &str, args: &[&str], functions: &mut Vec<String>) -> (u8, Record) {
        let id = functions.iter().position(|f| f == func).unwrap_or_else(|| {
            functions.push(func.to_string());
            functions.len() - 1
        }) as u8;
        (
            id,
            Record {
                func_id: id,
                tstart: 0,
                tend: 0,
                result: 0,
                args: args.iter().map(|a| a.as_bytes().to_vec()).collect(),
            },
        )
    }

    #[test]
    fn collect_mpi_nodes_skips_non_mpi_and_unrecognized_calls() {
        let mut names = Vec::new();
        let (_, send) = rec("MPI_Send", &["0", "0", "0", "1", "7", "MPI_COMM_WORLD"], &mut names);
        let (_, write) = rec("write", &["3", "buf", "10"], &mut names);
        let functions = FunctionTable::from_names(names);
        let records = vec![vec![send, write]];
        let nodes = collect_mpi_nodes(&records, &functions);
        assert_eq!(nodes[0].len(), 1);
        assert_eq!(nodes[0][0].func, "MPI_Send");
    }

    #[test]
    fn blocking_send_matches_blocking_recv() {
        let mut names = Vec::new();
        let (_, send) = rec("MPI_Send", &["0", "0", "0", "1", "7", "MPI_COMM_WORLD"], &mut names);
        let (_, recv) = rec("MPI_Recv", &["0", "0", "0", "0", "7", "MPI_COMM_WORLD", "IGNORE"], &mut names);
        let functions = FunctionTable::from_names(names);
        let records = vec![vec![send], vec![recv]];
        let translator = Translator::build(&records, &functions, 2);
        let mut warnings = WarningSink::new();
        let edges = match_calls(&records, &functions, &translator, ClassSet::Standard, &mut warnings);
        assert_eq!(edges.len(), 1);
        assert!(matches!(edges[0], MpiEdge::PointToPoint { .. }));
        assert!(warnings.is_empty());
    }

    #[test]
    fn unmatched_send_produces_warning() {
        let mut names = Vec::new();
        let (_, send) = rec("MPI_Send", &["0", "0", "0", "1", "7", "MPI_COMM_WORLD"], &mut names);
        let functions = FunctionTable::from_names(names);
        let records = vec![vec![send], vec![]];
        let translator = Translator::build(&records, &functions, 2);
        let mut warnings = WarningSink::new();
        let edges = match_calls(&records, &functions, &translator, ClassSet::Standard, &mut warnings);
        assert!(edges.is_empty());
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn unknown_communicator_still_matches_but_warns() {
        let mut names = Vec::new();
        let (_, send) = rec("MPI_Send", &["0", "0", "0", "1", "7", "C_unknown"], &mut names);
        let (_, recv) = rec("MPI_Recv", &["0", "0", "0", "0", "7", "C_unknown", "IGNORE"], &mut names);
        let functions = FunctionTable::from_names(names);
        let records = vec![vec![send], vec![recv]];
        let translator = Translator::build(&records, &functions, 2);
        let mut warnings = WarningSink::new();
        let edges = match_calls(&records, &functions, &translator, ClassSet::Standard, &mut warnings);
        assert_eq!(edges.len(), 1);
        assert!(warnings
            .iter()
            .any(|w| w.kind_label() == "unknown-communicator"));
    }

    #[test]
    fn flag_false_test_call_is_silently_skipped() {
        let mut names = Vec::new();
        let (_, test) = rec("MPI_Test", &["0", "0"], &mut names);
        let functions = FunctionTable::from_names(names);
        let records = vec![vec![test]];
        let translator = Translator::build(&records, &functions, 1);
        let mut warnings = WarningSink::new();
        let edges = match_calls(&records, &functions, &translator, ClassSet::Standard, &mut warnings);
        assert!(edges.is_empty());
        assert!(warnings.is_empty());
        assert!(collect_mpi_nodes(&records, &functions)[0].is_empty());
    }

    #[test]
    fn barrier_forms_all_to_all_edge_with_every_rank() {
        let mut names = Vec::new();
        let (_, b0) = rec("MPI_Barrier", &["MPI_COMM_WORLD"], &mut names);
        let (_, b1) = rec("MPI_Barrier", &["MPI_COMM_WORLD"], &mut names);
        let (_, b2) = rec("MPI_Barrier", &["MPI_COMM_WORLD"], &mut names);
        let functions = FunctionTable::from_names(names);
        let records = vec![vec![b0], vec![b1], vec![b2]];
        let translator = Translator::build(&records, &functions, 3);
        let mut warnings = WarningSink::new();
        let edges = match_calls(&records, &functions, &translator, ClassSet::Standard, &mut warnings);
        assert_eq!(edges.len(), 1);
        match &edges[0] {
            MpiEdge::AllToAll { participants } => assert_eq!(participants.len(), 3),
            other => panic!("expected AllToAll, got {other:?}"),
        }
    }

    #[test]
    fn nonblocking_pair_resolves_through_completion_calls() {
        let mut names = Vec::new();
        let (_, isend) = rec("MPI_Isend", &["0", "0", "0", "1", "7", "MPI_COMM_WORLD", "r0"], &mut names);
        let (_, wait) = rec("MPI_Wait", &["r0", "IGNORE"], &mut names);
        let (_, irecv) = rec("MPI_Irecv", &["0", "0", "0", "0", "7", "MPI_COMM_WORLD", "r1"], &mut names);
        let (_, waitall) = rec("MPI_Waitall", &["1", "[r1]"], &mut names);
        let functions = FunctionTable::from_names(names);
        let records = vec![vec![isend, wait], vec![irecv, waitall]];
        let translator = Translator::build(&records, &functions, 2);
        let mut warnings = WarningSink::new();
        let edges = match_calls(&records, &functions, &translator, ClassSet::Standard, &mut warnings);
        assert_eq!(edges.len(), 1);
        match &edges[0] {
            MpiEdge::PointToPoint { head, tail } => {
                assert_eq!(head.func, "MPI_Isend");
                assert_eq!(tail.func, "MPI_Waitall");
            }
            other => panic!("expected PointToPoint, got {other:?}"),
        }
    }
}
