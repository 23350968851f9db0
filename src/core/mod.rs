//! Partial-likelihood core.
//!
//! - `buffers`: current/stored slot indices
//! - `storage`: per-node partials, scale factors and matrices
//! - `pruning`: Felsenstein kernels
//! - `scaling`: underflow protection
//! - `integrate`: root integration
//! - `engine`: [`LikelihoodCore`], the API over all of the above

pub mod buffers;
pub mod engine;
pub mod integrate;
pub mod pruning;
pub mod scaling;
pub mod storage;

pub use buffers::BufferIndices;
pub use engine::LikelihoodCore;
pub use integrate::{calculate_log_likelihoods, integrate_partials};
pub use pruning::{CategoryMap, ChildInput};
pub use storage::{Dimensions, NodeCoding};
