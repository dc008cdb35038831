//! Communicator translator (spec.md §4.2): maps (communicator id,
//! local rank) pairs observed at communicator-creation calls to world
//! ranks.

use std::collections::HashMap;

use crate::error::{AnalysisWarning, WarningKind, WarningSink};
use crate::meta::FunctionTable;
use crate::record::Record;

/// `MPI_ANY_SOURCE`; maps to itself rather than being translated.
pub const ANY_SOURCE: i32 = -2;

pub const WORLD_COMM: &str = "MPI_COMM_WORLD";

/// Creation calls that establish a new communicator, and the argument
/// positions of the returned communicator id and the caller's rank
/// within it. Grounded on
/// `examples/original_source/tools/verifyio/match_mpi.py::get_translation_table`.
struct CreationSite {
    func: &'static str,
    comm_arg: usize,
    local_rank_arg: usize,
}

const CREATION_SITES: &[CreationSite] = &[
    CreationSite { func: "MPI_Comm_split", comm_arg: 3, local_rank_arg: 4 },
    CreationSite { func: "MPI_Comm_split_type", comm_arg: 4, local_rank_arg: 5 },
    CreationSite { func: "MPI_Comm_dup", comm_arg: 1, local_rank_arg: 2 },
    CreationSite { func: "MPI_Comm_create", comm_arg: 2, local_rank_arg: 3 },
    CreationSite { func: "MPI_Cart_create", comm_arg: 5, local_rank_arg: 6 },
    CreationSite { func: "MPI_Cart_sub", comm_arg: 2, local_rank_arg: 3 },
];

/// Maps (communicator id, local rank) to world rank.
#[derive(Debug, Default)]
pub struct Translator {
    table: HashMap<String, Vec<u32>>,
}

impl Translator {
    /// Builds the translation table by scanning every rank's decoded
    /// records for communicator-creation calls, seeding the world
    /// communicator with the identity mapping.
    pub fn build(records: &[Vec<Record>], functions: &FunctionTable, total_ranks: u32) -> Self {
        let mut table: HashMap<String, Vec<u32>> = HashMap::new();
        table.insert(WORLD_COMM.to_string(), (0..total_ranks).collect());

        for (rank, rank_records) in records.iter().enumerate() {
            let world_rank = rank as u32;
            for record in rank_records {
                let func = match functions.get(record.func_id) {
                    Some(f) => f,
                    None => continue,
                };
                let site = match CREATION_SITES.iter().find(|s| s.func == func) {
                    Some(s) => s,
                    None => continue,
                };
                let comm_id = match record.arg_str(site.comm_arg) {
                    Some(c) => c.into_owned(),
                    None => continue,
                };
                let local_rank: i64 = match record
                    .arg_str(site.local_rank_arg)
                    .and_then(|s| s.trim().parse().ok())
                {
                    Some(r) => r,
                    None => continue,
                };
                if local_rank < 0 {
                    continue;
                }
                let entry = table
                    .entry(comm_id)
                    .or_insert_with(|| (0..total_ranks).collect());
                if (local_rank as usize) < entry.len() {
                    entry[local_rank as usize] = world_rank;
                }
            }
        }

        Translator { table }
    }

    /// Maps a local rank within `comm` to its world rank. `ANY_SOURCE`
    /// maps to itself; an unknown communicator falls back to identity.
    pub fn local_to_global(&self, comm: &str, local_rank: i32) -> u32 {
        if local_rank == ANY_SOURCE {
            return local_rank as u32;
        }
        match self.table.get(comm) {
            Some(entries) => entries
                .get(local_rank as usize)
                .copied()
                .unwrap_or(local_rank as u32),
            None => local_rank as u32,
        }
    }

    /// Like [`Translator::local_to_global`], but records an
    /// `UnknownCommunicator` warning (spec.md §7) when `comm` has no
    /// translation entry. `ANY_SOURCE` never consults the table and so
    /// never warns.
    pub fn local_to_global_checked(
        &self,
        comm: &str,
        local_rank: i32,
        warnings: &mut WarningSink,
        rank: u32,
        seq: usize,
    ) -> u32 {
        if local_rank != ANY_SOURCE && !self.table.contains_key(comm) {
            warnings.push(AnalysisWarning::at(
                WarningKind::UnknownCommunicator { comm_id: comm.to_string() },
                rank,
                seq,
            ));
        }
        self.local_to_global(comm, local_rank)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn func_table(names: &[&str]) -> FunctionTable {
        FunctionTable::from_names(names.iter().map(|s| s.to_string()))
    }

    #[test]
    fn world_communicator_is_identity() {
        let functions = func_table(&["MPI_Send"]);
        let records: Vec<Vec<Record>> = vec![vec![], vec![], vec![]];
        let translator = Translator::build(&records, &functions, 3);
        assert_eq!(translator.local_to_global(WORLD_COMM, 0), 0);
        assert_eq!(translator.local_to_global(WORLD_COMM, 2), 2);
        assert_eq!(translator.local_to_global(WORLD_COMM, ANY_SOURCE), ANY_SOURCE as u32);
    }

    #[test]
    fn comm_split_remaps_local_rank_to_world_rank() {
        let functions = func_table(&["MPI_Comm_split"]);
        // Rank 2 (world) calls MPI_Comm_split(..., newcomm="C1", local_rank=0)
        let record = Record {
            func_id: 0,
            tstart: 0,
            tend: 0,
            result: 0,
            args: vec![
                b"0".to_vec(),
                b"0".to_vec(),
                b"0".to_vec(),
                b"C1".to_vec(),
                b"0".to_vec(),
            ],
        };
        let records: Vec<Vec<Record>> = vec![vec![], vec![], vec![record]];
        let translator = Translator::build(&records, &functions, 3);
        assert_eq!(translator.local_to_global("C1", 0), 2);
        // untouched entries keep identity default
        assert_eq!(translator.local_to_global("C1", 1), 1);
    }

    #[test]
    fn unknown_communicator_falls_back_to_identity() {
        let functions = func_table(&[]);
        let records: Vec<Vec<Record>> = vec![vec![]];
        let translator = Translator::build(&records, &functions, 1);
        assert_eq!(translator.local_to_global("unknown", 0), 0);
    }
}
