//! Tree likelihood: dirty tracking, traversal and the store/restore protocol
//! around a [`LikelihoodCore`].
//!
//! # Algorithm
//! 1. Callers mark what changed (branch lengths, model, rates, patterns)
//! 2. On [`log_likelihood`](TreeLikelihood::log_likelihood), a post-order
//!    traversal refreshes matrices of dirty branches and recomputes partials
//!    of every node with a changed child
//! 3. At the root, partials are integrated over categories and frequencies
//!    and per-pattern scale factors are added back

use std::ops::Range;

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::config::{LikelihoodConfig, ScalingMode};
use crate::core::{calculate_log_likelihoods, Dimensions, LikelihoodCore};
use crate::error::{LikelihoodError, Result};
use crate::patterns::{states_to_partials, PatternSet, TipData};
use crate::rates::RateCategories;
use crate::substitution::SubstitutionModel;
use crate::tree::Tree;

/// Values captured by [`TreeLikelihood::store_state`].
#[derive(Clone, Debug)]
struct StoredState<M> {
    model: M,
    rates: RateCategories,
    log_likelihood: f64,
    pattern_log_likelihoods: Vec<f64>,
    likelihood_known: bool,
    update_node: Vec<bool>,
    dirty_patterns: Option<Range<usize>>,
}

/// Lazily evaluated log-likelihood of a pattern set on a tree.
#[derive(Clone, Debug)]
pub struct TreeLikelihood<M: SubstitutionModel + Clone> {
    tree: Tree,
    patterns: PatternSet,
    model: M,
    rates: RateCategories,
    config: LikelihoodConfig,
    core: LikelihoodCore,

    update_node: Vec<bool>,
    dirty_patterns: Option<Range<usize>>,

    pattern_log_likelihoods: Vec<f64>,
    integrated: Vec<f64>,
    scale_sums: Vec<f64>,
    log_likelihood: f64,
    likelihood_known: bool,
    last_update_count: usize,

    stored: StoredState<M>,
}

impl<M: SubstitutionModel + Clone> TreeLikelihood<M> {
    /// Set up storage and tip data.
    ///
    /// Tips are matched to taxa by name when the tree carries tip names,
    /// otherwise by position.
    ///
    /// # Arguments
    /// * `tree` - Rooted tree; every internal node needs two or more children
    /// * `patterns` - Compressed alignment, one row per taxon
    /// * `model` - Substitution process with the same state count as the data
    /// * `rates` - Rate categories; a per-pattern map must cover every pattern
    /// * `config` - Scaling, ambiguity and storage options
    pub fn new(
        tree: Tree,
        patterns: PatternSet,
        model: M,
        rates: RateCategories,
        config: LikelihoodConfig,
    ) -> Result<Self> {
        let state_count = patterns.state_count();
        let pattern_count = patterns.pattern_count();
        if model.state_count() != state_count || model.frequencies().len() != state_count {
            return Err(LikelihoodError::DimensionMismatch(format!(
                "model has {} states, data has {}",
                model.state_count(),
                state_count
            )));
        }
        check_rates(&rates, pattern_count)?;
        check_topology(&tree)?;

        let dims = Dimensions {
            integrate_categories: rates.integrates_categories(),
            ..Dimensions::new(tree.n_nodes, pattern_count, rates.category_count(), state_count)
        };
        let mut core = LikelihoodCore::new(dims, &config)?;

        for tip in 0..tree.n_tips {
            install_tip(&mut core, &tree, &patterns, &config, tip)?;
        }
        for node in tree.n_tips..tree.n_nodes {
            core.create_node_partials(node)?;
        }

        info!(
            nodes = tree.n_nodes,
            tips = tree.n_tips,
            patterns = pattern_count,
            categories = rates.category_count(),
            states = state_count,
            tip_coding = if config.use_ambiguities { "partials" } else { "states" },
            "created tree likelihood"
        );

        let node_count = tree.n_nodes;
        let stored = StoredState {
            model: model.clone(),
            rates: rates.clone(),
            log_likelihood: f64::NEG_INFINITY,
            pattern_log_likelihoods: vec![0.0; pattern_count],
            likelihood_known: false,
            update_node: vec![true; node_count],
            dirty_patterns: Some(0..pattern_count),
        };

        Ok(Self {
            tree,
            patterns,
            model,
            rates,
            config,
            core,
            update_node: vec![true; node_count],
            dirty_patterns: Some(0..pattern_count),
            pattern_log_likelihoods: vec![0.0; pattern_count],
            integrated: vec![0.0; pattern_count * state_count],
            scale_sums: vec![0.0; pattern_count],
            log_likelihood: f64::NEG_INFINITY,
            likelihood_known: false,
            last_update_count: 0,
            stored,
        })
    }

    /// Total log-likelihood, recomputing whatever is dirty.
    pub fn log_likelihood(&mut self) -> Result<f64> {
        if !self.likelihood_known {
            self.calculate()?;
            self.likelihood_known = true;
        }
        Ok(self.log_likelihood)
    }

    /// Log-likelihood of each unique pattern (unweighted), conditioned on
    /// the pattern set's ascertainment when it has one.
    pub fn pattern_log_likelihoods(&mut self) -> Result<&[f64]> {
        self.log_likelihood()?;
        Ok(&self.pattern_log_likelihoods)
    }

    /// Log-likelihood of each original alignment site.
    pub fn site_log_likelihoods(&mut self) -> Result<Vec<f64>> {
        self.log_likelihood()?;
        Ok(self
            .patterns
            .site_patterns()
            .iter()
            .map(|&p| self.pattern_log_likelihoods[p])
            .collect())
    }

    /// Remember the current state as the rollback point.
    pub fn store_state(&mut self) {
        if self.config.store_partials {
            self.core.store_state();
        }
        self.tree.store_state();
        self.stored = self.snapshot();
    }

    /// Roll back to the last stored state.
    ///
    /// With `store_partials` this only flips buffer indices; otherwise every
    /// node is recomputed on the next evaluation.
    pub fn restore_state(&mut self) {
        self.tree.restore_state();
        self.model = self.stored.model.clone();
        self.rates = self.stored.rates.clone();

        if self.config.store_partials {
            self.core.restore_state();
            self.log_likelihood = self.stored.log_likelihood;
            self.pattern_log_likelihoods
                .clone_from(&self.stored.pattern_log_likelihoods);
            self.likelihood_known = self.stored.likelihood_known;
            self.update_node.clone_from(&self.stored.update_node);
            self.update_node.resize(self.core.node_count(), false);
            self.dirty_patterns = self.stored.dirty_patterns.clone();
        } else {
            self.mark_all_dirty();
        }
    }

    /// Make the current state the new rollback point.
    pub fn accept_state(&mut self) {
        if self.config.store_partials {
            self.core.accept_state();
        }
        self.tree.store_state();
        self.stored = self.snapshot();
    }

    /// Change a branch length and mark the branch dirty.
    pub fn set_branch_length(&mut self, node: usize, length: f64) -> Result<()> {
        if !length.is_finite() || length < 0.0 {
            return Err(LikelihoodError::InvalidBranchLength { node, length });
        }
        self.tree.set_branch_length(node, length)?;
        self.mark_node_dirty(node)
    }

    /// Mark the branch above `node` and its partials stale.
    pub fn mark_node_dirty(&mut self, node: usize) -> Result<()> {
        self.check_node(node)?;
        self.update_node[node] = true;
        self.likelihood_known = false;
        Ok(())
    }

    /// Mark `node` and the branches to its children stale.
    pub fn mark_node_and_children_dirty(&mut self, node: usize) -> Result<()> {
        self.mark_node_dirty(node)?;
        for &child in &self.tree.children[node] {
            self.update_node[child] = true;
        }
        Ok(())
    }

    pub fn mark_all_dirty(&mut self) {
        self.update_node.fill(true);
        self.dirty_patterns = Some(0..self.patterns.pattern_count());
        self.likelihood_known = false;
    }

    /// Recompute `range` of the patterns at every internal node.
    pub fn mark_patterns_dirty(&mut self, range: Range<usize>) -> Result<()> {
        let pattern_count = self.patterns.pattern_count();
        if range.start >= range.end || range.end > pattern_count {
            return Err(LikelihoodError::InvalidSiteRange {
                start: range.start,
                end: range.end,
                pattern_count,
            });
        }
        self.dirty_patterns = merge(self.dirty_patterns.take(), Some(range));
        self.likelihood_known = false;
        Ok(())
    }

    /// Mutate the substitution process in place; everything becomes dirty.
    pub fn update_model<F: FnOnce(&mut M)>(&mut self, update: F) -> Result<()> {
        let mut model = self.model.clone();
        update(&mut model);
        self.set_model(model)
    }

    pub fn set_model(&mut self, model: M) -> Result<()> {
        if model.state_count() != self.patterns.state_count() {
            return Err(LikelihoodError::DimensionMismatch(format!(
                "model has {} states, data has {}",
                model.state_count(),
                self.patterns.state_count()
            )));
        }
        self.model = model;
        self.mark_all_dirty();
        Ok(())
    }

    /// Replace the rate categories. The category count and assignment kind
    /// must stay the same, since buffers are sized for them.
    pub fn set_rate_categories(&mut self, rates: RateCategories) -> Result<()> {
        if rates.category_count() != self.rates.category_count()
            || rates.integrates_categories() != self.rates.integrates_categories()
        {
            return Err(LikelihoodError::DimensionMismatch(format!(
                "{} rate categories cannot replace {}",
                rates.category_count(),
                self.rates.category_count()
            )));
        }
        check_rates(&rates, self.patterns.pattern_count())?;
        self.rates = rates;
        self.mark_all_dirty();
        Ok(())
    }

    /// Move one pattern to another category (per-pattern mode only).
    pub fn set_pattern_category(&mut self, pattern: usize, category: usize) -> Result<()> {
        let mut categories = self
            .rates
            .pattern_categories()
            .ok_or_else(|| {
                LikelihoodError::InvalidParameter(
                    "categories are integrated, not assigned per pattern".to_string(),
                )
            })?
            .to_vec();
        if pattern >= categories.len() {
            return Err(LikelihoodError::InvalidSiteRange {
                start: pattern,
                end: pattern + 1,
                pattern_count: categories.len(),
            });
        }
        categories[pattern] = category;
        self.rates = RateCategories::per_pattern(self.rates.rates().to_vec(), categories)?;
        self.mark_patterns_dirty(pattern..pattern + 1)
    }

    /// Append `extra` detached nodes to the tree and the core.
    ///
    /// Returns the index of the first new node. The likelihood of the
    /// existing tree is unchanged.
    pub fn grow_storage(&mut self, extra: usize) -> usize {
        let first = self.core.grow_storage(extra);
        let tree_first = self.tree.add_nodes(extra);
        debug_assert_eq!(first, tree_first);
        self.update_node.resize(self.core.node_count(), false);
        first
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn patterns(&self) -> &PatternSet {
        &self.patterns
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn rates(&self) -> &RateCategories {
        &self.rates
    }

    pub fn config(&self) -> &LikelihoodConfig {
        &self.config
    }

    pub fn core(&self) -> &LikelihoodCore {
        &self.core
    }

    pub fn scaling_mode(&self) -> ScalingMode {
        self.core.scaling_mode()
    }

    /// Number of partials computations in the last evaluation.
    pub fn last_update_count(&self) -> usize {
        self.last_update_count
    }

    fn snapshot(&self) -> StoredState<M> {
        StoredState {
            model: self.model.clone(),
            rates: self.rates.clone(),
            log_likelihood: self.log_likelihood,
            pattern_log_likelihoods: self.pattern_log_likelihoods.clone(),
            likelihood_known: self.likelihood_known,
            update_node: self.update_node.clone(),
            dirty_patterns: self.dirty_patterns.clone(),
        }
    }

    fn calculate(&mut self) -> Result<()> {
        self.evaluate()?;

        if self.log_likelihood == f64::NEG_INFINITY
            && self.core.scaling_mode() == ScalingMode::Off
            && self.config.scaling.rescale_on_underflow
        {
            info!(
                threshold = self.core.scaling_threshold(),
                "log-likelihood underflowed, switching on partials scaling"
            );
            self.core.set_scaling_mode(ScalingMode::Threshold);
            self.mark_all_dirty();
            self.evaluate()?;

            if self.log_likelihood == f64::NEG_INFINITY {
                warn!("log-likelihood is -inf even with scaling");
            }
        }
        Ok(())
    }

    /// One post-order pass over dirty nodes, then root integration.
    fn evaluate(&mut self) -> Result<()> {
        let order = self.tree.post_order();
        let root = self.tree.root_index;
        let full = 0..self.patterns.pattern_count();
        let map = self.rates.pattern_categories();

        let mut changed: Vec<Option<Range<usize>>> = vec![None; self.core.node_count()];
        let mut update_count = 0;

        for &node in &order {
            let mut node_changed = None;
            if self.update_node[node] && node != root {
                update_matrices(
                    &mut self.core,
                    &self.model,
                    &self.rates,
                    node,
                    self.tree.branch_lengths[node],
                )?;
                node_changed = Some(full.clone());
            }

            let children = &self.tree.children[node];
            if !children.is_empty() {
                let own = self.update_node[node].then(|| full.clone());
                let range = children
                    .iter()
                    .map(|&child| changed[child].clone())
                    .fold(merge(own, self.dirty_patterns.clone()), merge);

                if let Some(range) = range {
                    self.core.prepare_partials_for_update(node)?;
                    self.core
                        .compute_partials_multi(children, node, map, Some(range.clone()))?;
                    update_count += 1;
                    node_changed = merge(node_changed, Some(range));
                }
            }
            changed[node] = node_changed;
        }

        let internal: Vec<usize> = order
            .iter()
            .copied()
            .filter(|&node| !self.tree.children[node].is_empty())
            .collect();
        self.core
            .sum_log_scaling_factors(&internal, &mut self.scale_sums)?;

        let proportions = self
            .rates
            .proportions()
            .map_or_else(|| vec![1.0], |p| p.to_vec());
        self.core
            .integrate_partials(root, &proportions, &mut self.integrated)?;
        calculate_log_likelihoods(
            &self.integrated,
            self.model.frequencies(),
            &self.scale_sums,
            &mut self.pattern_log_likelihoods,
        );
        let correction = self
            .patterns
            .ascertainment_correction(&self.pattern_log_likelihoods);
        if correction != 0.0 {
            for ll in &mut self.pattern_log_likelihoods {
                *ll -= correction;
            }
        }

        self.log_likelihood = self
            .pattern_log_likelihoods
            .iter()
            .zip(self.patterns.weights())
            .filter(|(_, w)| **w > 0.0)
            .map(|(ll, w)| ll * w)
            .sum();
        self.last_update_count = update_count;

        self.update_node.fill(false);
        self.dirty_patterns = None;

        debug!(
            recomputed = update_count,
            log_likelihood = self.log_likelihood,
            "evaluated tree likelihood"
        );
        Ok(())
    }

    fn check_node(&self, node: usize) -> Result<()> {
        if node >= self.update_node.len() {
            return Err(LikelihoodError::NodeOutOfRange {
                node,
                node_count: self.update_node.len(),
            });
        }
        Ok(())
    }
}

/// Evaluate one dataset per entry on a shared tree, in parallel.
///
/// Each dataset gets its own [`TreeLikelihood`]; results keep the input order.
pub fn log_likelihoods_parallel<M>(
    tree: &Tree,
    datasets: Vec<(PatternSet, M)>,
    rates: &RateCategories,
    config: &LikelihoodConfig,
) -> Vec<Result<f64>>
where
    M: SubstitutionModel + Clone + Send,
{
    datasets
        .into_par_iter()
        .map(|(patterns, model)| {
            let mut likelihood =
                TreeLikelihood::new(tree.clone(), patterns, model, rates.clone(), config.clone())?;
            likelihood.log_likelihood()
        })
        .collect()
}

fn update_matrices<M: SubstitutionModel + ?Sized>(
    core: &mut LikelihoodCore,
    model: &M,
    rates: &RateCategories,
    node: usize,
    branch_length: f64,
) -> Result<()> {
    core.prepare_matrix_for_update(node)?;
    for (category, &rate) in rates.rates().iter().enumerate() {
        core.set_matrix(node, category, branch_length, rate, model)?;
    }
    Ok(())
}

/// Smallest range covering both.
fn merge(a: Option<Range<usize>>, b: Option<Range<usize>>) -> Option<Range<usize>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.start.min(b.start)..a.end.max(b.end)),
        (a, None) => a,
        (None, b) => b,
    }
}

fn check_rates(rates: &RateCategories, pattern_count: usize) -> Result<()> {
    if let Some(categories) = rates.pattern_categories() {
        if categories.len() != pattern_count {
            return Err(LikelihoodError::DimensionMismatch(format!(
                "{} pattern categories for {} patterns",
                categories.len(),
                pattern_count
            )));
        }
    }
    Ok(())
}

fn check_topology(tree: &Tree) -> Result<()> {
    if tree.is_tip(tree.root_index) {
        return Err(LikelihoodError::UnsupportedTopology(
            "the root must be an internal node".to_string(),
        ));
    }
    for node in tree.post_order() {
        if !tree.is_tip(node) && tree.children[node].len() < 2 {
            return Err(LikelihoodError::UnsupportedTopology(format!(
                "internal node {} has {} children",
                node,
                tree.children[node].len()
            )));
        }
    }
    Ok(())
}

fn install_tip(
    core: &mut LikelihoodCore,
    tree: &Tree,
    patterns: &PatternSet,
    config: &LikelihoodConfig,
    tip: usize,
) -> Result<()> {
    let state_count = patterns.state_count();
    let taxon = if tree.tip_name_to_idx.is_empty() {
        (tip < patterns.taxon_count()).then_some(tip)
    } else {
        tree.tip_name(tip).and_then(|name| patterns.taxon_index(name))
    };

    let missing;
    let data = match taxon {
        Some(taxon) => patterns.tip(taxon),
        None if config.allow_missing_taxa => {
            missing = TipData::States(vec![state_count as u32; patterns.pattern_count()]);
            &missing
        }
        None => {
            let name = tree
                .tip_name(tip)
                .map_or_else(|| format!("tip {}", tip), str::to_string);
            return Err(LikelihoodError::MissingTaxon(name));
        }
    };

    match data {
        TipData::States(states) if config.use_ambiguities => {
            core.create_tip_partials(tip, &states_to_partials(states, state_count))
        }
        TipData::States(states) => core.create_tip_states(tip, states),
        TipData::Partials(partials) => core.create_tip_partials(tip, partials),
    }
}
