//! Error and warning types for trace decoding and happens-before analysis.
//!
//! Following the policy in spec.md §7: some failures abort the unit of
//! work they occur in ([`TraceError`]); others are recorded and
//! analysis continues ([`AnalysisWarning`]).

use std::path::PathBuf;

/// A failure that aborts decoding, matching, or loading of the unit of
/// work it occurred in.
#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    /// A record's framing or back-reference decompression could not be
    /// resolved. Aborts decoding of the rank it was found in.
    #[error("rank {rank}: malformed record at index {index}: {reason}")]
    MalformedRecord {
        rank: u32,
        index: usize,
        reason: String,
    },

    /// `recorder.mt` or a `<r>.mt` file was shorter than its fixed
    /// header, or contained an inconsistent length field.
    #[error("malformed metadata in {path:?}: {reason}")]
    MalformedMetadata { path: PathBuf, reason: String },

    /// A conflict-list data line could not be parsed at all (as
    /// opposed to [`AnalysisWarning::BadConflictLine`], which is used
    /// when only one pair entry within an otherwise valid line fails).
    #[error("conflict file {path:?}, line {line}: {reason}")]
    MalformedConflictFile {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("I/O error reading {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The kind of a recoverable analysis anomaly. Carries enough context
/// to be printed as a diagnostic and tallied by kind, per spec.md §7.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WarningKind {
    /// A record's function id did not resolve to a known function
    /// name. The record is ignored.
    UnknownFunctionId { func_id: u8 },

    /// A record referenced a communicator id with no known
    /// translation entry. The world mapping (identity) is used
    /// instead.
    UnknownCommunicator { comm_id: String },

    /// A blocking or nonblocking send had no matching receive by the
    /// time matching finished.
    UnmatchedSend,

    /// A collective call's per-rank FIFO was not fully drained by the
    /// time matching finished.
    UnmatchedCollective { key: String, stragglers: usize },

    /// A data call referenced a file descriptor with no open-call
    /// record on that rank. The record is dropped.
    UnknownFd { fd: String },

    /// A line in the conflict list file could not be parsed as a
    /// conflict pair or file binding.
    BadConflictLine { line: usize, text: String },
}

/// A recoverable anomaly observed at a specific point in the trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisWarning {
    pub kind: WarningKind,
    pub rank: Option<u32>,
    pub index: Option<usize>,
}

impl AnalysisWarning {
    pub fn new(kind: WarningKind) -> Self {
        AnalysisWarning {
            kind,
            rank: None,
            index: None,
        }
    }

    pub fn at(kind: WarningKind, rank: u32, index: usize) -> Self {
        AnalysisWarning {
            kind,
            rank: Some(rank),
            index: Some(index),
        }
    }

    /// A short, stable label for grouping warnings by kind, e.g. for
    /// the CLI's trailing "counts of warnings by kind" summary.
    pub fn kind_label(&self) -> &'static str {
        match self.kind {
            WarningKind::UnknownFunctionId { .. } => "unknown-function-id",
            WarningKind::UnknownCommunicator { .. } => "unknown-communicator",
            WarningKind::UnmatchedSend => "unmatched-send",
            WarningKind::UnmatchedCollective { .. } => "unmatched-collective",
            WarningKind::UnknownFd { .. } => "unknown-fd",
            WarningKind::BadConflictLine { .. } => "bad-conflict-line",
        }
    }
}

impl std::fmt::Display for AnalysisWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            WarningKind::UnknownFunctionId { func_id } => {
                write!(f, "unknown function id {func_id}")
            }
            WarningKind::UnknownCommunicator { comm_id } => {
                write!(f, "unknown communicator {comm_id}, falling back to identity")
            }
            WarningKind::UnmatchedSend => write!(f, "send with no matching receive"),
            WarningKind::UnmatchedCollective { key, stragglers } => {
                write!(f, "collective {key} left {stragglers} unmatched call(s)")
            }
            WarningKind::UnknownFd { fd } => write!(f, "data call on unopened fd {fd}"),
            WarningKind::BadConflictLine { line, text } => {
                write!(f, "unparseable conflict line {line}: {text}")
            }
        }?;
        if let (Some(rank), Some(index)) = (self.rank, self.index) {
            write!(f, " (rank {rank}, seq {index})")?;
        }
        Ok(())
    }
}

/// Accumulates warnings in emission order and tallies them by kind.
#[derive(Debug, Default)]
pub struct WarningSink {
    warnings: Vec<AnalysisWarning>,
}

impl WarningSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, warning: AnalysisWarning) {
        log::warn!("{warning}");
        self.warnings.push(warning);
    }

    pub fn iter(&self) -> impl Iterator<Item = &AnalysisWarning> {
        self.warnings.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.warnings.is_empty()
    }

    pub fn len(&self) -> usize {
        self.warnings.len()
    }

    /// Counts by [`AnalysisWarning::kind_label`], in first-seen order.
    pub fn counts_by_kind(&self) -> Vec<(&'static str, usize)> {
        let mut order = Vec::new();
        let mut counts: std::collections::HashMap<&'static str, usize> =
            std::collections::HashMap::new();
        for w in &self.warnings {
            let label = w.kind_label();
            if !counts.contains_key(label) {
                order.push(label);
            }
            *counts.entry(label).or_insert(0) += 1;
        }
        order.into_iter().map(|l| (l, counts[l])).collect()
    }
}
