//! Global and per-rank trace metadata readers (spec.md §6).

use std::convert::TryInto;
use std::path::{Path, PathBuf};

use crate::error::TraceError;

/// Bytes of fixed header read from `recorder.mt` before the
/// newline-delimited function name list begins: 8-byte time
/// resolution, three 4-byte ints, and 4 reserved/padding bytes.
const GLOBAL_HEADER_LEN: usize = 24;

/// One function name per instrumented call, indexed by `func_id`.
/// `PMPI_*` names are canonicalized to `MPI_*` on read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionTable {
    names: Vec<String>,
}

impl FunctionTable {
    /// Builds a table directly from names, in `func_id` order. Used by
    /// tests and by the text-trace reader, which has no binary header
    /// to parse a table out of.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        FunctionTable {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn get(&self, func_id: u8) -> Option<&str> {
        self.names.get(func_id as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names_iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

fn canonicalize_func_name(name: &str) -> String {
    if let Some(rest) = name.strip_prefix("PMPI") {
        format!("MPI{rest}")
    } else {
        name.to_string()
    }
}

/// Global metadata shared by all ranks of a trace (`recorder.mt`).
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalMetadata {
    /// Seconds per tick; absolute seconds = tick * time_resolution.
    pub time_resolution: f64,
    pub total_ranks: u32,
    pub compression_mode: i32,
    pub window_size: i32,
    pub functions: FunctionTable,
}

impl GlobalMetadata {
    pub fn read(path: &Path) -> Result<Self, TraceError> {
        let bytes = std::fs::read(path).map_err(|source| TraceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&bytes, path)
    }

    fn parse(bytes: &[u8], path: &Path) -> Result<Self, TraceError> {
        if bytes.len() < GLOBAL_HEADER_LEN {
            return Err(TraceError::MalformedMetadata {
                path: path.to_path_buf(),
                reason: format!(
                    "expected at least {GLOBAL_HEADER_LEN} header bytes, found {}",
                    bytes.len()
                ),
            });
        }

        let time_resolution = f64::from_le_bytes(bytes[0..8].try_into().unwrap());
        let total_ranks = i32::from_le_bytes(bytes[8..12].try_into().unwrap());
        let compression_mode = i32::from_le_bytes(bytes[12..16].try_into().unwrap());
        let window_size = i32::from_le_bytes(bytes[16..20].try_into().unwrap());

        if total_ranks < 0 {
            return Err(TraceError::MalformedMetadata {
                path: path.to_path_buf(),
                reason: format!("negative total_ranks: {total_ranks}"),
            });
        }

        let rest = &bytes[GLOBAL_HEADER_LEN..];
        let names = String::from_utf8_lossy(rest)
            .lines()
            .map(|line| canonicalize_func_name(line.trim_end_matches('\r')))
            .collect();

        Ok(GlobalMetadata {
            time_resolution,
            total_ranks: total_ranks as u32,
            compression_mode,
            window_size,
            functions: FunctionTable { names },
        })
    }

    pub fn seconds(&self, ticks: i64) -> f64 {
        ticks as f64 * self.time_resolution
    }
}

/// A single entry in a rank's file map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMapEntry {
    pub file_id: i32,
    pub file_size: i64,
    pub path: PathBuf,
}

/// Per-rank metadata (`<r>.mt`).
#[derive(Debug, Clone, PartialEq)]
pub struct RankMetadata {
    pub tstart: f64,
    pub tend: f64,
    pub num_files: i32,
    pub total_records: i32,
    pub function_counts: [i32; 256],
    pub file_map: Vec<FileMapEntry>,
}

impl RankMetadata {
    pub fn read(path: &Path) -> Result<Self, TraceError> {
        let bytes = std::fs::read(path).map_err(|source| TraceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&bytes, path)
    }

    fn parse(bytes: &[u8], path: &Path) -> Result<Self, TraceError> {
        let mut cursor = Cursor::new(bytes, path);

        let tstart = cursor.f64()?;
        let tend = cursor.f64()?;
        let num_files = cursor.i32()?;
        let total_records = cursor.i32()?;
        cursor.skip(16)?; // two legacy pointer-width fields

        let mut function_counts = [0i32; 256];
        for slot in function_counts.iter_mut() {
            *slot = cursor.i32()?;
        }

        if num_files < 0 {
            return Err(TraceError::MalformedMetadata {
                path: path.to_path_buf(),
                reason: format!("negative num_files: {num_files}"),
            });
        }

        let mut file_map = Vec::with_capacity(num_files as usize);
        for _ in 0..num_files {
            let file_id = cursor.i32()?;
            let file_size = cursor.i64()?;
            let name_len = cursor.i32()?;
            if name_len < 0 {
                return Err(TraceError::MalformedMetadata {
                    path: path.to_path_buf(),
                    reason: format!("negative file name length: {name_len}"),
                });
            }
            let name_bytes = cursor.take(name_len as usize)?;
            let name = String::from_utf8_lossy(name_bytes).into_owned();
            file_map.push(FileMapEntry {
                file_id,
                file_size,
                path: PathBuf::from(name),
            });
        }

        Ok(RankMetadata {
            tstart,
            tend,
            num_files,
            total_records,
            function_counts,
            file_map,
        })
    }
}

/// Minimal forward-only byte cursor used by both metadata readers.
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
    path: &'a Path,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8], path: &'a Path) -> Self {
        Cursor {
            bytes,
            pos: 0,
            path,
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], TraceError> {
        if self.pos + n > self.bytes.len() {
            return Err(TraceError::MalformedMetadata {
                path: self.path.to_path_buf(),
                reason: format!(
                    "expected {n} more bytes at offset {}, found {}",
                    self.pos,
                    self.bytes.len() - self.pos
                ),
            });
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn skip(&mut self, n: usize) -> Result<(), TraceError> {
        self.take(n).map(|_| ())
    }

    fn i32(&mut self) -> Result<i32, TraceError> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64, TraceError> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn f64(&mut self) -> Result<f64, TraceError> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn global_bytes(names: &[&str]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1e-6f64.to_le_bytes());
        bytes.extend_from_slice(&4i32.to_le_bytes());
        bytes.extend_from_slice(&0i32.to_le_bytes());
        bytes.extend_from_slice(&16i32.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 4]);
        bytes.extend_from_slice(names.join("\n").as_bytes());
        bytes
    }

    #[test]
    fn parses_global_metadata_and_canonicalizes_pmpi() {
        let bytes = global_bytes(&["open", "PMPI_Send", "PMPI_Recv"]);
        let meta = GlobalMetadata::parse(&bytes, Path::new("recorder.mt")).unwrap();
        assert_eq!(meta.total_ranks, 4);
        assert_eq!(meta.window_size, 16);
        assert_eq!(meta.functions.get(0), Some("open"));
        assert_eq!(meta.functions.get(1), Some("MPI_Send"));
        assert_eq!(meta.functions.get(2), Some("MPI_Recv"));
    }

    #[test]
    fn rejects_truncated_global_metadata() {
        let bytes = vec![0u8; 10];
        assert!(GlobalMetadata::parse(&bytes, Path::new("recorder.mt")).is_err());
    }

    #[test]
    fn parses_rank_metadata_with_file_map() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0.0f64.to_le_bytes());
        bytes.extend_from_slice(&1.5f64.to_le_bytes());
        bytes.extend_from_slice(&1i32.to_le_bytes()); // num_files
        bytes.extend_from_slice(&3i32.to_le_bytes()); // total_records
        bytes.extend_from_slice(&[0u8; 16]); // legacy pointers
        bytes.extend_from_slice(&[0u8; 256 * 4]); // function counts
        bytes.extend_from_slice(&7i32.to_le_bytes()); // file id
        bytes.extend_from_slice(&1024i64.to_le_bytes()); // file size
        bytes.extend_from_slice(&4i32.to_le_bytes()); // name len
        bytes.extend_from_slice(b"f.nc");

        let meta = RankMetadata::parse(&bytes, Path::new("0.mt")).unwrap();
        assert_eq!(meta.num_files, 1);
        assert_eq!(meta.total_records, 3);
        assert_eq!(meta.file_map.len(), 1);
        assert_eq!(meta.file_map[0].file_id, 7);
        assert_eq!(meta.file_map[0].file_size, 1024);
        assert_eq!(meta.file_map[0].path, PathBuf::from("f.nc"));
    }
}
