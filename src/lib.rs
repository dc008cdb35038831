//! Offline happens-before verification for parallel-I/O traces.
//!
//! A trace is a directory of per-rank metadata and record-stream
//! files produced by an instrumented MPI program. This crate decodes
//! that trace, reconstructs file offset intervals and MPI
//! synchronization edges, builds the resulting happens-before graph,
//! and checks externally supplied conflicting-access pairs against a
//! chosen consistency semantics.
//!
//! Pipeline: [`record`] decodes raw per-rank byte streams (or, behind
//! the `text-trace` feature, [`text`] parses the legacy line-oriented
//! format) into [`record::Record`]s; [`translator`] resolves
//! communicator-local ranks to world ranks; [`offsets`] turns data
//! calls into [`offsets::DataInterval`]s; [`mpi`] matches MPI calls
//! into [`mpi::MpiEdge`]s; [`graph`] assembles the happens-before DAG;
//! [`semantics`] answers ordering queries against it; [`conflicts`]
//! loads the external detector's candidate pairs.

pub mod conflicts;
pub mod error;
pub mod graph;
pub mod meta;
pub mod mpi;
pub mod offsets;
pub mod record;
pub mod semantics;
#[cfg(feature = "text-trace")]
pub mod text;
pub mod translator;
