//! Python bindings, built with `--features python`.

use ndarray::ArrayView2;
use numpy::{PyArray1, PyReadonlyArray1, PyReadonlyArray2};
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use pyo3::wrap_pyfunction;

use crate::config::{LikelihoodConfig, ScalingPolicy};
use crate::error::{self, LikelihoodError};
use crate::likelihood::{log_likelihoods_parallel, TreeLikelihood};
use crate::patterns::{PatternSet, TipData};
use crate::rates::RateCategories;
use crate::substitution::{BinaryGainLoss, SubstitutionModel, F81};
use crate::tree::Tree;

impl From<LikelihoodError> for PyErr {
    fn from(err: LikelihoodError) -> Self {
        PyValueError::new_err(err.to_string())
    }
}

/// Tip rows of `alignment` are matched to tree tips by position.
fn positional_patterns(alignment: ArrayView2<u32>, state_count: usize) -> error::Result<PatternSet> {
    let taxa = (0..alignment.nrows()).map(|i| format!("t{}", i)).collect();
    PatternSet::from_alignment(taxa, alignment, state_count)
}

fn build_likelihood(
    parent_indices: PyReadonlyArray1<i32>,
    branch_lengths: PyReadonlyArray1<f64>,
    alignment: PyReadonlyArray2<u32>,
    n_tips: usize,
    frequencies: Option<PyReadonlyArray1<f64>>,
    category_rates: Option<PyReadonlyArray1<f64>>,
    force_scaling: bool,
) -> error::Result<TreeLikelihood<F81>> {
    let tree = Tree::from_structure(
        parent_indices.as_array().to_vec(),
        branch_lengths.as_array().to_vec(),
        n_tips,
    )?;
    let model = match frequencies {
        Some(freqs) => F81::new(freqs.as_array().to_vec())?,
        None => F81::jukes_cantor(4)?,
    };
    let rates = match category_rates {
        Some(r) => RateCategories::equal(r.as_array().to_vec())?,
        None => RateCategories::single(),
    };
    let config = LikelihoodConfig {
        scaling: if force_scaling {
            ScalingPolicy::forced()
        } else {
            ScalingPolicy::default()
        },
        ..LikelihoodConfig::default()
    };
    let patterns = positional_patterns(alignment.as_array(), model.state_count())?;
    TreeLikelihood::new(tree, patterns, model, rates, config)
}

/// Log-likelihood of one alignment under F81 (Jukes-Cantor by default).
///
/// # Arguments
/// * `parent_indices` - Parent index for each node (-1 for root)
/// * `branch_lengths` - Branch length for each node
/// * `alignment` - (n_tips, n_sites) state codes; codes ≥ state count are missing
/// * `n_tips` - Number of tip nodes
/// * `frequencies` - Optional equilibrium frequencies (defaults to 4 uniform states)
/// * `category_rates` - Optional equally weighted rate categories
/// * `force_scaling` - Rescale partials from the start
#[pyfunction]
#[pyo3(signature = (parent_indices, branch_lengths, alignment, n_tips, frequencies=None, category_rates=None, force_scaling=false))]
fn compute_log_likelihood(
    parent_indices: PyReadonlyArray1<i32>,
    branch_lengths: PyReadonlyArray1<f64>,
    alignment: PyReadonlyArray2<u32>,
    n_tips: usize,
    frequencies: Option<PyReadonlyArray1<f64>>,
    category_rates: Option<PyReadonlyArray1<f64>>,
    force_scaling: bool,
) -> PyResult<f64> {
    let mut likelihood = build_likelihood(
        parent_indices,
        branch_lengths,
        alignment,
        n_tips,
        frequencies,
        category_rates,
        force_scaling,
    )?;
    Ok(likelihood.log_likelihood()?)
}

/// Per-site log-likelihoods, same arguments as `compute_log_likelihood`.
#[pyfunction]
#[pyo3(signature = (parent_indices, branch_lengths, alignment, n_tips, frequencies=None, category_rates=None, force_scaling=false))]
#[allow(clippy::too_many_arguments)]
fn compute_site_log_likelihoods<'py>(
    py: Python<'py>,
    parent_indices: PyReadonlyArray1<i32>,
    branch_lengths: PyReadonlyArray1<f64>,
    alignment: PyReadonlyArray2<u32>,
    n_tips: usize,
    frequencies: Option<PyReadonlyArray1<f64>>,
    category_rates: Option<PyReadonlyArray1<f64>>,
    force_scaling: bool,
) -> PyResult<&'py PyArray1<f64>> {
    let mut likelihood = build_likelihood(
        parent_indices,
        branch_lengths,
        alignment,
        n_tips,
        frequencies,
        category_rates,
        force_scaling,
    )?;
    let sites = likelihood.site_log_likelihoods()?;
    Ok(PyArray1::from_vec(py, sites))
}

/// Compute log-likelihoods for all gene families in parallel.
///
/// Each family is a single presence/absence column evolving under its own
/// binary gain/loss process.
///
/// # Arguments
/// * `parent_indices` - Parent index for each node (-1 for root)
/// * `branch_lengths` - Branch length for each node
/// * `presence_matrix` - (n_tips, n_families) matrix of 0/1; other values are missing
/// * `gain_rates` - (n_families,) gain rates for each family
/// * `loss_rates` - (n_families,) loss rates for each family
/// * `n_tips` - Number of tip nodes
///
/// # Returns
/// * Vector of log-likelihoods, one per family
#[pyfunction]
fn compute_likelihoods_parallel<'py>(
    py: Python<'py>,
    parent_indices: PyReadonlyArray1<i32>,
    branch_lengths: PyReadonlyArray1<f64>,
    presence_matrix: PyReadonlyArray2<i8>,
    gain_rates: PyReadonlyArray1<f64>,
    loss_rates: PyReadonlyArray1<f64>,
    n_tips: usize,
) -> PyResult<&'py PyArray1<f64>> {
    let tree = Tree::from_structure(
        parent_indices.as_array().to_vec(),
        branch_lengths.as_array().to_vec(),
        n_tips,
    )?;

    let presence = presence_matrix.as_array();
    let gains = gain_rates.as_array();
    let losses = loss_rates.as_array();
    let n_families = presence.ncols();
    if gains.len() != n_families || losses.len() != n_families {
        return Err(LikelihoodError::DimensionMismatch(format!(
            "{} families but {} gain and {} loss rates",
            n_families,
            gains.len(),
            losses.len()
        ))
        .into());
    }

    let taxa: Vec<String> = (0..presence.nrows()).map(|i| format!("t{}", i)).collect();
    let mut families = Vec::with_capacity(n_families);
    for fam_idx in 0..n_families {
        let tips = presence
            .column(fam_idx)
            .iter()
            .map(|&v| {
                TipData::States(vec![match v {
                    0 => 0,
                    1 => 1,
                    _ => 2,
                }])
            })
            .collect();
        let patterns = PatternSet::new(taxa.clone(), tips, vec![1.0], 2)?;
        let model = BinaryGainLoss::new(gains[fam_idx], losses[fam_idx])?;
        families.push((patterns, model));
    }

    let log_likelihoods = log_likelihoods_parallel(
        &tree,
        families,
        &RateCategories::single(),
        &LikelihoodConfig::default(),
    )
    .into_iter()
    .collect::<error::Result<Vec<f64>>>()?;

    Ok(PyArray1::from_vec(py, log_likelihoods))
}

/// Python module definition
#[pymodule]
fn pruning_core(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(compute_log_likelihood, m)?)?;
    m.add_function(wrap_pyfunction!(compute_site_log_likelihoods, m)?)?;
    m.add_function(wrap_pyfunction!(compute_likelihoods_parallel, m)?)?;
    Ok(())
}
