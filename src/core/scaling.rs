//! Per-pattern rescaling of partials to avoid underflow.
//!
//! A rescaled pattern is divided by its largest entry `m` and `ln(m)` is
//! recorded as the node's scale factor for that pattern. Summing the
//! factors of every internal node at the root restores the true
//! log-likelihood.

use std::ops::Range;

use rayon::prelude::*;

use crate::config::ScalingMode;

/// Rescale the patterns in `range` of one node's partials.
///
/// # Arguments
/// * `partials` - Node partials, `block` entries per pattern
/// * `factors` - Node log scale factors, one per pattern
/// * `mode` - [`ScalingMode::Off`] only zeroes the factors
/// * `threshold` - Patterns whose maximum is below this are rescaled in
///   threshold mode
pub fn scale_partials(
    partials: &mut [f64],
    factors: &mut [f64],
    block: usize,
    range: Range<usize>,
    mode: ScalingMode,
    threshold: f64,
    parallel: bool,
) {
    let factors = &mut factors[range.clone()];
    if mode == ScalingMode::Off {
        factors.fill(0.0);
        return;
    }

    let region = &mut partials[range.start * block..range.end * block];
    let scale = |(pattern, factor): (&mut [f64], &mut f64)| {
        *factor = scale_pattern(pattern, mode, threshold);
    };

    if parallel {
        region
            .par_chunks_mut(block)
            .zip(factors.par_iter_mut())
            .for_each(scale);
    } else {
        region.chunks_mut(block).zip(factors.iter_mut()).for_each(scale);
    }
}

/// Rescale one pattern block, returning its log scale factor.
#[inline]
fn scale_pattern(pattern: &mut [f64], mode: ScalingMode, threshold: f64) -> f64 {
    let max = pattern.iter().copied().fold(0.0_f64, f64::max);

    // an all-zero pattern stays zero; it contributes ln(0) at the root
    let rescale = max > 0.0 && (mode == ScalingMode::Always || max < threshold);
    if !rescale {
        return 0.0;
    }
    for value in pattern.iter_mut() {
        *value /= max;
    }
    max.ln()
}
