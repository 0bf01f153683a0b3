//! Error taxonomy for the TACT core and its adapters.
//!
//! Kinds mirror the error taxonomy in the design spec: malformed input,
//! broken invariants, failed placements, disjoint age constraints, and
//! optimizer/config failures. Each carries enough context to reproduce the
//! log messages the original Python implementation emitted.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TactError {
    #[error("input error: {0}")]
    Input(String),

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("could not place node in clade {recipient}: no eligible edge (stem={stem})")]
    Placement { recipient: String, stem: bool },

    #[error("disjoint constraint: unlocked ages under {node} form a non-atomic interval")]
    DisjointConstraint { node: String },

    #[error("optimizer did not converge: {0}")]
    Numeric(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("newick/tree error: {0}")]
    Tree(#[from] phylotree::tree::TreeError),
}

pub type TactResult<T> = Result<T, TactError>;
