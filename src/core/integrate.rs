//! Root integration: categories, then states, then logs.

/// Collapse root partials over rate categories.
///
/// # Arguments
/// * `partials` - Root partials, `proportions.len() * state_count` per pattern
/// * `proportions` - Category weights; one entry means no integration
/// * `out` - `pattern_count × state_count`
pub fn integrate_partials(partials: &[f64], proportions: &[f64], state_count: usize, out: &mut [f64]) {
    let block = proportions.len() * state_count;

    for (pattern, row) in partials.chunks_exact(block).zip(out.chunks_exact_mut(state_count)) {
        row.fill(0.0);
        for (slot, &weight) in pattern.chunks_exact(state_count).zip(proportions) {
            for (acc, &value) in row.iter_mut().zip(slot) {
                *acc += weight * value;
            }
        }
    }
}

/// Per-pattern log-likelihoods from integrated root partials.
///
/// `out[p] = ln(Σ_i π_i · root[p, i]) + scale_sums[p]`. A pattern with zero
/// probability yields `-inf`.
pub fn calculate_log_likelihoods(
    root: &[f64],
    frequencies: &[f64],
    scale_sums: &[f64],
    out: &mut [f64],
) {
    let n = frequencies.len();
    for ((row, &scale), value) in root.chunks_exact(n).zip(scale_sums).zip(out.iter_mut()) {
        let sum: f64 = row.iter().zip(frequencies).map(|(x, f)| x * f).sum();
        *value = sum.ln() + scale;
    }
}
