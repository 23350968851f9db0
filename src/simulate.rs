//! Forward simulation of alignments along a tree.
//!
//! Root states are drawn from the equilibrium frequencies and evolved down
//! each branch with the model's transition matrices. Mostly used to generate
//! realistic data for tests and benchmarks.

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{LikelihoodError, Result};
use crate::patterns::PatternSet;
use crate::rates::RateCategories;
use crate::substitution::SubstitutionModel;
use crate::tree::Tree;

/// Simulate `site_count` sites, returning a (tips × sites) array of states.
///
/// Each site draws its rate category from the mixing proportions, or takes
/// it from the per-pattern map (which must then have one entry per site).
pub fn simulate_alignment<M, R>(
    tree: &Tree,
    model: &M,
    rates: &RateCategories,
    site_count: usize,
    rng: &mut R,
) -> Result<Array2<u32>>
where
    M: SubstitutionModel + ?Sized,
    R: Rng + ?Sized,
{
    let n = model.state_count();
    let category_count = rates.category_count();
    if let Some(map) = rates.pattern_categories() {
        if map.len() != site_count {
            return Err(LikelihoodError::DimensionMismatch(format!(
                "{} site categories for {} sites",
                map.len(),
                site_count
            )));
        }
    }

    // matrices[node][category]
    let mut matrices = vec![Vec::new(); tree.n_nodes];
    for node in tree.post_order() {
        if node == tree.root_index {
            continue;
        }
        let length = tree.branch_lengths[node];
        if !length.is_finite() || length < 0.0 {
            return Err(LikelihoodError::InvalidBranchLength { node, length });
        }
        matrices[node] = rates
            .rates()
            .iter()
            .enumerate()
            .map(|(category, &rate)| {
                let mut m = vec![0.0; n * n];
                model.fill_transition_matrix(length, rate, category, &mut m);
                m
            })
            .collect::<Vec<Vec<f64>>>();
    }

    let mut preorder = tree.post_order();
    preorder.reverse();

    let mut alignment = Array2::zeros((tree.n_tips, site_count));
    let mut states = vec![0usize; tree.n_nodes];
    for site in 0..site_count {
        let category = match rates.proportions() {
            Some(proportions) => sample_index(proportions, rng),
            None => rates.pattern_categories().map_or(0, |map| map[site]),
        }
        .min(category_count - 1);

        for &node in &preorder {
            states[node] = match tree.parent(node) {
                None => sample_index(model.frequencies(), rng),
                Some(parent) => {
                    let row = states[parent] * n;
                    sample_index(&matrices[node][category][row..row + n], rng)
                }
            };
            if tree.is_tip(node) {
                alignment[[node, site]] = states[node] as u32;
            }
        }
    }
    Ok(alignment)
}

/// Simulate and compress into patterns, seeded for reproducibility.
///
/// Taxa are named after the tree's tips, or `t0`, `t1`, ... when the tree
/// has no names.
pub fn simulate_patterns<M: SubstitutionModel + ?Sized>(
    tree: &Tree,
    model: &M,
    rates: &RateCategories,
    site_count: usize,
    seed: u64,
) -> Result<PatternSet> {
    let mut rng = StdRng::seed_from_u64(seed);
    let alignment = simulate_alignment(tree, model, rates, site_count, &mut rng)?;
    let taxa = (0..tree.n_tips)
        .map(|tip| {
            tree.tip_name(tip)
                .map_or_else(|| format!("t{}", tip), str::to_string)
        })
        .collect();
    PatternSet::from_alignment(taxa, alignment.view(), model.state_count())
}

/// Draw an index with probability proportional to `weights`.
fn sample_index<R: Rng + ?Sized>(weights: &[f64], rng: &mut R) -> usize {
    let total: f64 = weights.iter().sum();
    let target = rng.gen::<f64>() * total;

    let mut cumulative = 0.0;
    for (i, &w) in weights.iter().enumerate() {
        cumulative += w;
        if target < cumulative {
            return i;
        }
    }
    weights.len().saturating_sub(1)
}
