//! Conflict pair loader (spec.md §4.7): reads the external detector's
//! conflict-pair list into `(n1, N2)` tuples for the semantics
//! verifier.

use std::path::Path;

use crate::error::{AnalysisWarning, TraceError, WarningKind, WarningSink};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeRef {
    pub rank: u32,
    pub seq: usize,
    pub func: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictPair {
    pub n1: NodeRef,
    pub n2: Vec<NodeRef>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBinding {
    pub file_id: i32,
    pub path: String,
}

#[derive(Debug, Default)]
pub struct ConflictFile {
    pub bindings: Vec<FileBinding>,
    pub pairs: Vec<ConflictPair>,
}

fn parse_node(text: &str) -> Option<NodeRef> {
    let mut parts = text.splitn(3, ',');
    let rank: u32 = parts.next()?.trim().parse().ok()?;
    let seq: usize = parts.next()?.trim().parse().ok()?;
    let func = parts.next()?.trim().to_string();
    Some(NodeRef { rank, seq, func })
}

fn parse_binding(line: &str) -> Option<FileBinding> {
    let rest = line.strip_prefix('#')?;
    let mut parts = rest.splitn(2, ':');
    let file_id: i32 = parts.next()?.trim().parse().ok()?;
    let path = parts.next()?.trim().to_string();
    Some(FileBinding { file_id, path })
}

fn parse_data_line(line: &str) -> Option<ConflictPair> {
    let (head, peers_text) = line.split_once(':')?;
    let mut head_parts = head.splitn(3, ',');
    let rank: u32 = head_parts.next()?.trim().parse().ok()?;
    let seq: usize = head_parts.next()?.trim().parse().ok()?;
    let func = head_parts.next()?.trim().to_string();

    let mut peers = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for peer_text in peers_text.split_whitespace() {
        if let Some(peer) = parse_node(peer_text) {
            if seen.insert(peer.clone()) {
                peers.push(peer);
            }
        }
    }

    Some(ConflictPair {
        n1: NodeRef { rank, seq, func },
        n2: peers,
    })
}

/// Reads a conflict-pair list: one ignored header line, `#fileId:path`
/// bindings, and `rank,seq,func:peer peer…` data lines. Lines that
/// fail to parse produce a `BadConflictLine` warning and are skipped
/// rather than aborting the whole file.
pub fn read_conflicts(path: &Path, drop_same_rank: bool, warnings: &mut WarningSink) -> Result<ConflictFile, TraceError> {
    let text = std::fs::read_to_string(path).map_err(|source| TraceError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut out = ConflictFile::default();
    let mut seen_n1: std::collections::HashSet<NodeRef> = std::collections::HashSet::new();

    for (line_no, line) in text.lines().enumerate().skip(1) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.starts_with('#') {
            match parse_binding(trimmed) {
                Some(binding) => out.bindings.push(binding),
                None => warnings.push(AnalysisWarning::new(WarningKind::BadConflictLine {
                    line: line_no + 1,
                    text: trimmed.to_string(),
                })),
            }
            continue;
        }

        match parse_data_line(trimmed) {
            Some(mut pair) => {
                if drop_same_rank {
                    let n1_rank = pair.n1.rank;
                    pair.n2.retain(|peer| peer.rank != n1_rank);
                }
                if pair.n2.is_empty() {
                    continue;
                }
                if seen_n1.insert(pair.n1.clone()) {
                    out.pairs.push(pair);
                } else if let Some(existing) = out.pairs.iter_mut().find(|p| p.n1 == pair.n1) {
                    for peer in pair.n2 {
                        if !existing.n2.contains(&peer) {
                            existing.n2.push(peer);
                        }
                    }
                }
            }
            None => warnings.push(AnalysisWarning::new(WarningKind::BadConflictLine {
                line: line_no + 1,
                text: trimmed.to_string(),
            })),
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    struct TempFile {
        path: std::path::PathBuf,
    }

    impl TempFile {
        fn new(name: &str, contents: &str) -> Self {
            let path = std::env::temp_dir().join(format!("verifyio-conflicts-test-{name}.txt"));
            let mut file = std::fs::File::create(&path).unwrap();
            file.write_all(contents.as_bytes()).unwrap();
            TempFile { path }
        }
    }

    impl Drop for TempFile {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    #[test]
    fn parses_bindings_and_data_lines() {
        let file = TempFile::new("bindings", "header\n#7:f.nc\n0,1,write:1,3,read 1,5,read\n");
        let mut warnings = WarningSink::new();
        let parsed = read_conflicts(&file.path, false, &mut warnings).unwrap();
        assert_eq!(parsed.bindings, vec![FileBinding { file_id: 7, path: "f.nc".to_string() }]);
        assert_eq!(parsed.pairs.len(), 1);
        assert_eq!(parsed.pairs[0].n1, NodeRef { rank: 0, seq: 1, func: "write".to_string() });
        assert_eq!(parsed.pairs[0].n2.len(), 2);
        assert!(warnings.is_empty());
    }

    #[test]
    fn drops_same_rank_peers_when_requested() {
        let file = TempFile::new("same-rank", "header\n0,1,write:0,2,read 1,3,read\n");
        let mut warnings = WarningSink::new();
        let parsed = read_conflicts(&file.path, true, &mut warnings).unwrap();
        assert_eq!(parsed.pairs[0].n2, vec![NodeRef { rank: 1, seq: 3, func: "read".to_string() }]);
    }

    #[test]
    fn unparseable_line_produces_warning_and_is_skipped() {
        let file = TempFile::new("bad-line", "header\nnot a valid line\n0,1,write:1,2,read\n");
        let mut warnings = WarningSink::new();
        let parsed = read_conflicts(&file.path, false, &mut warnings).unwrap();
        assert_eq!(parsed.pairs.len(), 1);
        assert_eq!(warnings.len(), 1);
    }
}
