//! Crate root: module orchestration and public re-exports.
//!
//! Modules:
//! - `bitset`: compact bitset representation, backing `tree::TreeIndex`.
//! - `numerics`: constant-rate birth-death kernel and rate optimizers.
//! - `sampler`: missing-speciation-time draws (`get_new_times`).
//! - `tree`: arena-allocated dated tree, MRCA index, grafting primitives.
//! - `taxonomy`: ranked taxonomy tree construction from a CSV table.
//! - `rates`: per-rank rate table built by walking the taxonomy.
//! - `engine`: the post-order grafting state machine and `create_clade`.
//! - `check`: backbone-vs-simulated rank comparison for `check-results`.
//! - `replicate`: multi-replicate driver with independent seeded RNGs.
//! - `io`: Newick/NEXUS/CSV/TOML readers and writers.
//! - `errors`: the crate's error taxonomy.

pub mod bitset;
pub mod check;
pub mod engine;
pub mod errors;
pub mod io;
pub mod numerics;
pub mod rates;
pub mod replicate;
pub mod sampler;
pub mod taxonomy;
pub mod tree;

pub use bitset::Bitset;
pub use errors::{TactError, TactResult};
pub use tree::{Node, NodeId, TactTree, TreeIndex};
