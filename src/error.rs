//! Error type for the likelihood engine.
//!
//! Every precondition violation is reported as a [`LikelihoodError`] and
//! aborts the evaluation in progress. Numerical degeneracy (a `-inf`
//! log-likelihood) is not an error.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LikelihoodError {
    #[error("invalid branch length {length} above node {node}")]
    InvalidBranchLength { node: usize, length: f64 },
    #[error("invalid rate {rate} for category {category}")]
    InvalidRate { category: usize, rate: f64 },
    #[error("node index {node} out of range (node count {node_count})")]
    NodeOutOfRange { node: usize, node_count: usize },
    #[error("node {0} already has a coding; a node's coding never changes")]
    CodingAlreadySet(usize),
    #[error("node {0} has no states or partials")]
    NodeNotCreated(usize),
    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),
    #[error("site range [{start}, {end}) outside [0, {pattern_count})")]
    InvalidSiteRange {
        start: usize,
        end: usize,
        pattern_count: usize,
    },
    #[error("taxon {0} in tree is not found in the pattern data")]
    MissingTaxon(String),
    #[error("unsupported topology: {0}")]
    UnsupportedTopology(String),
    #[error("invalid tree: {0}")]
    InvalidTree(String),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, LikelihoodError>;
