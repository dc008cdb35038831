//! Offset-interval reconstructor (spec.md §4.3): turns raw data calls
//! into (file, offset, length, read/write) facts, tracking per-rank
//! file position and a cross-rank commit map for append-open and
//! session reasoning.

use std::collections::HashMap;

use crate::error::{AnalysisWarning, WarningKind, WarningSink};
use crate::meta::FunctionTable;
use crate::record::Record;

/// Whether closing/syncing a file on one rank should open a fresh
/// segment for every other rank that still has it open. Defaults to
/// `true` (broader session visibility), per spec.md §9.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentPolicy {
    pub open_segment_on_remote_close: bool,
}

impl Default for SegmentPolicy {
    fn default() -> Self {
        SegmentPolicy {
            open_segment_on_remote_close: true,
        }
    }
}

/// A per-(rank, file) open/close lifetime used for session reasoning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde_crate::Serialize, serde_crate::Deserialize), serde(crate = "serde_crate"))]
pub struct Segment {
    pub id: u64,
    pub open: bool,
}

/// A reconstructed data access: everything the semantics verifier and
/// the (out-of-scope) conflict detector need about one I/O call. Kept
/// serializable so the external conflict detector can consume it
/// directly instead of re-deriving offsets from the raw trace.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde_crate::Serialize, serde_crate::Deserialize), serde(crate = "serde_crate"))]
pub struct DataInterval {
    pub rank: u32,
    pub index: usize,
    pub func: String,
    pub path: String,
    pub offset: i64,
    pub length: i64,
    pub is_read: bool,
    pub tstart: i64,
    pub tend: i64,
    pub local_segment: Segment,
    pub remote_open_segments: Vec<(u32, Segment)>,
}

#[derive(Debug, Clone)]
struct FdState {
    path: String,
    position: i64,
}

#[derive(Debug, Default, Clone, Copy)]
struct FileState {
    local_eof: i64,
    committed: i64,
}

/// Excluded from interval output per spec.md §4.3's path-filtering
/// policy.
fn is_filtered_path(path: &str) -> bool {
    const PREFIXES: &[&str] = &["/sys/", "/dev", "/proc", "/etc/"];
    const STD_STREAMS: &[&str] = &["stdin", "stdout", "stderr"];
    PREFIXES.iter().any(|p| path.starts_with(p))
        || STD_STREAMS.contains(&path)
        || path.contains("pipe:")
}

const SEEK_SET: i64 = 0;
const SEEK_CUR: i64 = 1;
const SEEK_END: i64 = 2;

/// Reconstructs offset intervals for one rank's decoded records,
/// mutating the shared cross-rank file-size and segment books as it
/// goes. Call once per rank, in any order, since the commit map and
/// segment set are the only cross-rank state.
pub struct Reconstructor<'a> {
    functions: &'a FunctionTable,
    policy: SegmentPolicy,
    fds: HashMap<u32, HashMap<String, FdState>>,
    files: HashMap<String, FileState>,
    segments: HashMap<String, HashMap<u32, Segment>>,
    next_segment_id: u64,
}

impl<'a> Reconstructor<'a> {
    pub fn new(functions: &'a FunctionTable, policy: SegmentPolicy) -> Self {
        Reconstructor {
            functions,
            policy,
            fds: HashMap::new(),
            files: HashMap::new(),
            segments: HashMap::new(),
            next_segment_id: 0,
        }
    }

    fn new_segment_id(&mut self) -> u64 {
        let id = self.next_segment_id;
        self.next_segment_id += 1;
        id
    }

    fn open_segment(&mut self, path: &str, rank: u32) -> Segment {
        let id = self.new_segment_id();
        let segment = Segment { id, open: true };
        self.segments
            .entry(path.to_string())
            .or_default()
            .insert(rank, segment);
        segment
    }

    fn close_segments_for_rank(&mut self, path: &str, rank: u32) {
        if let Some(by_rank) = self.segments.get_mut(path) {
            if let Some(seg) = by_rank.get_mut(&rank) {
                seg.open = false;
            }
        }
    }

    fn current_segment(&self, path: &str, rank: u32) -> Segment {
        self.segments
            .get(path)
            .and_then(|m| m.get(&rank))
            .copied()
            .unwrap_or(Segment { id: u64::MAX, open: false })
    }

    fn remote_open_segments(&self, path: &str, rank: u32) -> Vec<(u32, Segment)> {
        self.segments
            .get(path)
            .map(|m| {
                m.iter()
                    .filter(|(&r, s)| r != rank && s.open)
                    .map(|(&r, &s)| (r, s))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Processes one rank's records in emission order, emitting one
    /// [`DataInterval`] per retained data call. Unknown-fd records are
    /// dropped with a warning; unrecognized functions are skipped
    /// silently (they simply aren't data calls).
    pub fn process_rank(
        &mut self,
        rank: u32,
        records: &[Record],
        warnings: &mut WarningSink,
    ) -> Vec<DataInterval> {
        let mut out = Vec::new();
        let fd_table = self.fds.entry(rank).or_default();

        for (index, record) in records.iter().enumerate() {
            let func = match self.functions.get(record.func_id) {
                Some(f) => f.to_string(),
                None => continue,
            };

            if is_open_call(&func) {
                let path = match record.arg_str(0) {
                    Some(p) => p.into_owned(),
                    None => continue,
                };
                if is_filtered_path(&path) {
                    continue;
                }
                let append = is_append_open(&func, record);
                let committed = self.files.entry(path.clone()).or_default().committed;
                let local_eof = self.files.get(&path).map(|f| f.local_eof).unwrap_or(0);
                let position = if append {
                    committed.max(local_eof)
                } else {
                    0
                };
                let fd_table = self.fds.entry(rank).or_default();
                fd_table.insert(
                    record.result.to_string(),
                    FdState { path: path.clone(), position },
                );
                self.open_segment(&path, rank);
                continue;
            }

            if is_fdopen_call(&func) {
                let fds = self.fds.entry(rank).or_default();
                let existing = record
                    .arg_str(0)
                    .and_then(|fd| fds.get(fd.as_ref()).cloned());
                if let Some(existing) = existing {
                    let fds = self.fds.entry(rank).or_default();
                    fds.insert(record.result.to_string(), existing.clone());
                    self.open_segment(&existing.path, rank);
                } else {
                    warnings.push(AnalysisWarning::at(
                        WarningKind::UnknownFd {
                            fd: record.arg_str(0).map(|s| s.into_owned()).unwrap_or_default(),
                        },
                        rank,
                        index,
                    ));
                }
                continue;
            }

            if is_close_call(&func) {
                let fd_key = match record.arg_str(0) {
                    Some(f) => f.into_owned(),
                    None => continue,
                };
                let fds = self.fds.entry(rank).or_default();
                let state = match fds.remove(&fd_key) {
                    Some(s) => s,
                    None => {
                        warnings.push(AnalysisWarning::at(
                            WarningKind::UnknownFd { fd: fd_key },
                            rank,
                            index,
                        ));
                        continue;
                    }
                };
                self.publish_and_close(&state.path, rank, state.position);
                continue;
            }

            if is_sync_call(&func) {
                let fd_key = match record.arg_str(0) {
                    Some(f) => f.into_owned(),
                    None => continue,
                };
                let fds = self.fds.entry(rank).or_default();
                let position = match fds.get(&fd_key) {
                    Some(s) => s.position,
                    None => {
                        warnings.push(AnalysisWarning::at(
                            WarningKind::UnknownFd { fd: fd_key },
                            rank,
                            index,
                        ));
                        continue;
                    }
                };
                let path = self.fds[&rank][&fd_key].path.clone();
                self.publish_and_close(&path, rank, position);
                continue;
            }

            if is_lseek_call(&func) {
                let fd_key = match record.arg_str(0) {
                    Some(f) => f.into_owned(),
                    None => continue,
                };
                let offset: i64 = record.arg_str(1).and_then(|s| s.trim().parse().ok()).unwrap_or(0);
                let whence: i64 = record.arg_str(2).and_then(|s| s.trim().parse().ok()).unwrap_or(0);

                let path_and_committed = {
                    let fds = self.fds.entry(rank).or_default();
                    fds.get(&fd_key).map(|s| s.path.clone())
                };
                let path = match path_and_committed {
                    Some(p) => p,
                    None => {
                        warnings.push(AnalysisWarning::at(
                            WarningKind::UnknownFd { fd: fd_key },
                            rank,
                            index,
                        ));
                        continue;
                    }
                };
                let committed = self.files.entry(path.clone()).or_default().committed;
                let local_eof = self.files.get(&path).map(|f| f.local_eof).unwrap_or(0);

                let fds = self.fds.entry(rank).or_default();
                if let Some(state) = fds.get_mut(&fd_key) {
                    state.position = match whence {
                        SEEK_SET => offset,
                        SEEK_CUR => state.position + offset,
                        SEEK_END => committed.max(local_eof),
                        _ => state.position,
                    };
                }
                continue;
            }

            if let Some((offset, length, is_read, moves_position)) =
                data_call_shape(&func, record, self.fd_position(rank, record))
            {
                let fd_key = match fd_key_for_data_call(&func, record) {
                    Some(k) => k,
                    None => continue,
                };
                let path = {
                    let fds = self.fds.entry(rank).or_default();
                    fds.get(&fd_key).map(|s| s.path.clone())
                };
                let path = match path {
                    Some(p) => p,
                    None => {
                        warnings.push(AnalysisWarning::at(
                            WarningKind::UnknownFd { fd: fd_key },
                            rank,
                            index,
                        ));
                        continue;
                    }
                };
                if is_filtered_path(&path) {
                    continue;
                }

                if moves_position {
                    let fds = self.fds.entry(rank).or_default();
                    if let Some(state) = fds.get_mut(&fd_key) {
                        state.position += length;
                    }
                }

                let file = self.files.entry(path.clone()).or_default();
                file.local_eof = file.local_eof.max(offset + length);

                let local_segment = self.current_segment(&path, rank);
                let remote_open_segments = self.remote_open_segments(&path, rank);

                out.push(DataInterval {
                    rank,
                    index,
                    func: func.clone(),
                    path,
                    offset,
                    length,
                    is_read,
                    tstart: record.tstart,
                    tend: record.tend,
                    local_segment,
                    remote_open_segments,
                });
            }
        }

        out
    }

    fn fd_position(&self, rank: u32, record: &Record) -> i64 {
        let fd_key = fd_key_for_data_call(
            self.functions.get(record.func_id).unwrap_or(""),
            record,
        );
        fd_key
            .and_then(|k| self.fds.get(&rank).and_then(|m| m.get(&k)))
            .map(|s| s.position)
            .unwrap_or(0)
    }

    fn publish_and_close(&mut self, path: &str, rank: u32, position: i64) {
        {
            let file = self.files.entry(path.to_string()).or_default();
            file.committed = file.committed.max(position);
        }
        self.close_segments_for_rank(path, rank);

        if self.policy.open_segment_on_remote_close {
            let other_ranks: Vec<u32> = self
                .segments
                .get(path)
                .map(|m| m.iter().filter(|(&r, s)| r != rank && s.open).map(|(&r, _)| r).collect())
                .unwrap_or_default();
            for other in other_ranks {
                self.open_segment(path, other);
            }
        }
    }
}

/// Runs the reconstructor across every rank and merges the results
/// into one list in global `tstart` order, mirroring
/// `build_offset_intervals.py`'s single sorted interval list (grouped
/// there by filename; callers here can group by [`DataInterval::path`]
/// themselves since nothing downstream needs the grouping).
pub fn collect_intervals(
    functions: &FunctionTable,
    policy: SegmentPolicy,
    records: &[Vec<Record>],
    warnings: &mut WarningSink,
) -> Vec<DataInterval> {
    let mut reconstructor = Reconstructor::new(functions, policy);
    let mut intervals = Vec::new();
    for (rank, rank_records) in records.iter().enumerate() {
        intervals.extend(reconstructor.process_rank(rank as u32, rank_records, warnings));
    }
    intervals.sort_by_key(|iv| iv.tstart);
    intervals
}

fn is_open_call(func: &str) -> bool {
    matches!(
        func,
        "open" | "open64" | "creat" | "creat64" | "fopen" | "fopen64"
    )
}

fn is_fdopen_call(func: &str) -> bool {
    func == "fdopen"
}

fn is_close_call(func: &str) -> bool {
    matches!(func, "close" | "close64" | "fclose" | "fclose64")
}

fn is_sync_call(func: &str) -> bool {
    matches!(func, "fsync" | "fdatasync")
}

fn is_lseek_call(func: &str) -> bool {
    matches!(func, "lseek" | "lseek64" | "fseek")
}

fn is_append_open(func: &str, record: &Record) -> bool {
    if func.starts_with("fopen") {
        return record
            .arg_str(1)
            .map(|mode| mode.contains('a'))
            .unwrap_or(false);
    }
    // POSIX open/creat: look for O_APPEND either as a parsed bit
    // (0x400 on Linux) or, if the tracer recorded symbolic flag names,
    // as a literal substring.
    if let Some(flags) = record.arg_str(1) {
        if let Ok(bits) = flags.trim().parse::<i64>() {
            return bits & 0x400 != 0;
        }
        return flags.to_uppercase().contains("APPEND");
    }
    false
}

/// Resolves the fd/path key a data call references. Grounded on
/// spec.md §4.3's documented argument positions.
fn fd_key_for_data_call(func: &str, record: &Record) -> Option<String> {
    let idx = match func {
        "read" | "write" | "readv" | "writev" | "pread" | "pwrite" | "pread64" | "pwrite64" => 0,
        "fread" | "fwrite" => 3,
        "fprintf" => 0,
        _ => return None,
    };
    record.arg_str(idx).map(|s| s.into_owned())
}

/// Returns `(offset, length, is_read, moves_position)` for a data
/// call, or `None` if `func` isn't one.
fn data_call_shape(
    func: &str,
    record: &Record,
    current_position: i64,
) -> Option<(i64, i64, bool, bool)> {
    let parse = |idx: usize| -> i64 { record.arg_str(idx).and_then(|s| s.trim().parse().ok()).unwrap_or(0) };

    match func {
        "read" | "readv" => Some((current_position, parse(2), true, true)),
        "write" | "writev" => Some((current_position, parse(2), false, true)),
        "pread" | "pread64" => Some((parse(3), parse(2), true, false)),
        "pwrite" | "pwrite64" => Some((parse(3), parse(2), false, false)),
        "fread" => Some((current_position, parse(1) * parse(2), true, true)),
        "fwrite" => Some((current_position, parse(1) * parse(2), false, true)),
        "fprintf" => Some((current_position, parse(1), false, true)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(func_id: u8, result: i32, args: &[&str]) -> Record {
        Record {
            func_id,
            tstart: 0,
            tend: 0,
            result,
            args: args.iter().map(|a| a.as_bytes().to_vec()).collect(),
        }
    }

    fn funcs() -> FunctionTable {
        FunctionTable::from_names(
            ["open", "write", "read", "close", "lseek", "pwrite"].map(String::from),
        )
    }

    #[test]
    fn write_then_read_tracks_position_and_eof() {
        let functions = funcs();
        let mut r = Reconstructor::new(&functions, SegmentPolicy::default());
        let mut warnings = WarningSink::new();

        let records = vec![
            rec(0, 3, &["f"]),       // open("f") -> fd 3
            rec(1, 0, &["3", "buf", "10"]), // write(3, buf, 10)
        ];
        let intervals = r.process_rank(0, &records, &mut warnings);
        assert_eq!(intervals.len(), 1);
        assert_eq!(intervals[0].offset, 0);
        assert_eq!(intervals[0].length, 10);
        assert!(!intervals[0].is_read);
        assert!(warnings.is_empty());
    }

    #[test]
    fn unknown_fd_is_dropped_with_warning() {
        let functions = funcs();
        let mut r = Reconstructor::new(&functions, SegmentPolicy::default());
        let mut warnings = WarningSink::new();
        let records = vec![rec(1, 0, &["99", "buf", "10"])];
        let intervals = r.process_rank(0, &records, &mut warnings);
        assert!(intervals.is_empty());
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn append_open_reads_global_commit_map_not_local_eof() {
        let functions = funcs();
        let mut r = Reconstructor::new(&functions, SegmentPolicy::default());
        let mut warnings = WarningSink::new();

        // Rank 0: write 100 bytes, then close.
        let rank0 = vec![
            rec(0, 3, &["f"]),
            rec(1, 0, &["3", "buf", "100"]),
            rec(3, 0, &["3"]),
        ];
        r.process_rank(0, &rank0, &mut warnings);

        // Rank 1: open "f" in append mode (simulated as posix open with
        // a numeric flags argument carrying the O_APPEND bit, 0x400).
        let rank1_open = rec(0, 7, &["f", "1024"]);
        let path = rank1_open.arg_str(0).unwrap().into_owned();
        assert!(is_append_open("open", &rank1_open));
        let rank1 = vec![rank1_open, rec(2, 0, &["7", "buf", "5"])];
        let intervals = r.process_rank(1, &rank1, &mut warnings);
        assert_eq!(intervals[0].offset, 100);
        assert_eq!(path, "f");
    }

    #[test]
    fn pwrite_does_not_move_position() {
        let functions = funcs();
        let mut r = Reconstructor::new(&functions, SegmentPolicy::default());
        let mut warnings = WarningSink::new();
        let records = vec![
            rec(0, 3, &["f"]),
            rec(5, 0, &["3", "buf", "8", "40"]),
            rec(2, 0, &["3", "buf", "8"]), // subsequent read still at position 0
        ];
        let intervals = r.process_rank(0, &records, &mut warnings);
        assert_eq!(intervals[0].offset, 40);
        assert_eq!(intervals[1].offset, 0);
    }

    #[test]
    fn collect_intervals_merges_ranks_in_global_tstart_order() {
        let functions = funcs();
        let mut warnings = WarningSink::new();

        let mut late_write = rec(1, 0, &["3", "buf", "10"]);
        late_write.tstart = 50;
        let records = vec![
            vec![rec(0, 3, &["f"]), late_write],
            vec![rec(0, 4, &["g"]), { let mut r = rec(1, 0, &["4", "buf", "5"]); r.tstart = 10; r }],
        ];
        let intervals = collect_intervals(&functions, SegmentPolicy::default(), &records, &mut warnings);
        assert_eq!(intervals.len(), 2);
        assert_eq!(intervals[0].tstart, 10);
        assert_eq!(intervals[0].path, "g");
        assert_eq!(intervals[1].path, "f");
    }

    #[test]
    fn filtered_paths_are_excluded() {
        assert!(is_filtered_path("/proc/self/maps"));
        assert!(is_filtered_path("/dev/null"));
        assert!(is_filtered_path("pipe:[12345]"));
        assert!(!is_filtered_path("/home/user/data.bin"));
    }
}
