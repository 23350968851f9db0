//! Phylogenetic partial-likelihood engine.
//!
//! Felsenstein pruning over a rooted tree with:
//! - discrete rate categories, integrated at the root or assigned per pattern
//! - per-pattern rescaling against underflow, switched on reactively
//! - incremental recomputation of dirty subtrees only
//! - double-buffered partials and matrices for O(1) store/restore in MCMC
//!
//! ```no_run
//! use pruning_core::{LikelihoodConfig, PatternSet, RateCategories, Tree, TreeLikelihood, F81};
//!
//! # fn main() -> pruning_core::Result<()> {
//! let taxa: Vec<String> = ["A", "B", "C"].iter().map(|s| s.to_string()).collect();
//! let tree = Tree::from_newick("(A:2.0,(B:1.0,C:1.0):1.0);", &taxa)?;
//! let patterns = PatternSet::from_dna(taxa, &["A", "C", "C"])?;
//! let mut likelihood = TreeLikelihood::new(
//!     tree,
//!     patterns,
//!     F81::jukes_cantor(4)?,
//!     RateCategories::single(),
//!     LikelihoodConfig::default(),
//! )?;
//!
//! let ll = likelihood.log_likelihood()?;
//! likelihood.store_state();
//! likelihood.set_branch_length(0, 0.5)?;
//! let proposed = likelihood.log_likelihood()?;
//! if proposed < ll {
//!     likelihood.restore_state();
//! } else {
//!     likelihood.accept_state();
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod likelihood;
pub mod patterns;
pub mod rates;
pub mod simulate;
pub mod substitution;
pub mod tree;

#[cfg(feature = "python")]
mod python;

pub use config::{LikelihoodConfig, ScalingMode, ScalingPolicy};
pub use crate::core::{Dimensions, LikelihoodCore, NodeCoding};
pub use error::{LikelihoodError, Result};
pub use likelihood::{log_likelihoods_parallel, TreeLikelihood};
pub use patterns::{encode_dna, states_to_partials, Ascertainment, PatternSet, TipData};
pub use rates::{CategoryAssignment, RateCategories};
pub use simulate::{simulate_alignment, simulate_patterns};
pub use substitution::{BinaryGainLoss, SubstitutionModel, F81};
pub use tree::Tree;
