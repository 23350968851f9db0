//! Configuration for the likelihood engine and its owning likelihood.

/// When partials are rescaled after a node computation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ScalingMode {
    /// No rescaling.
    Off,
    /// Rescale a pattern when its largest entry drops below the threshold.
    Threshold,
    /// Rescale every pattern at every node.
    Always,
}

/// Scaling policy carried by each engine instance.
#[derive(Clone, Debug)]
pub struct ScalingPolicy {
    /// Mode at construction time.
    pub mode: ScalingMode,
    /// Threshold used by [`ScalingMode::Threshold`]. Default: 1e-100
    pub threshold: f64,
    /// Switch to threshold scaling and recompute once when an evaluation
    /// underflows to `-inf`. Default: true
    pub rescale_on_underflow: bool,
}

impl Default for ScalingPolicy {
    fn default() -> Self {
        Self {
            mode: ScalingMode::Off,
            threshold: 1e-100,
            rescale_on_underflow: true,
        }
    }
}

impl ScalingPolicy {
    /// Scaling on from the start.
    pub fn forced() -> Self {
        Self {
            mode: ScalingMode::Threshold,
            ..Self::default()
        }
    }

    /// No scaling and no retry; underflow is reported as `-inf`.
    pub fn disabled() -> Self {
        Self {
            mode: ScalingMode::Off,
            rescale_on_underflow: false,
            ..Self::default()
        }
    }
}

/// Configuration for a [`TreeLikelihood`](crate::likelihood::TreeLikelihood).
#[derive(Clone, Debug)]
pub struct LikelihoodConfig {
    pub scaling: ScalingPolicy,
    /// Install tips as partials so ambiguity codes become all-ones vectors.
    pub use_ambiguities: bool,
    /// Tree tips without data are treated as fully missing instead of an error.
    pub allow_missing_taxa: bool,
    /// Keep the stored copy for O(1) restore; otherwise restore recomputes.
    pub store_partials: bool,
    /// Minimum pattern count before kernels split work across threads.
    /// Default: 512
    pub parallel_pattern_threshold: usize,
}

impl Default for LikelihoodConfig {
    fn default() -> Self {
        Self {
            scaling: ScalingPolicy::default(),
            use_ambiguities: false,
            allow_missing_taxa: false,
            store_partials: true,
            parallel_pattern_threshold: 512,
        }
    }
}
