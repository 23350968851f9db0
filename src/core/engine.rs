//! The likelihood core: storage, matrices, kernels and scaling behind one API.

use std::ops::Range;

use tracing::debug;

use crate::config::{LikelihoodConfig, ScalingMode};
use crate::error::{LikelihoodError, Result};
use crate::substitution::SubstitutionModel;

use super::integrate;
use super::pruning::{self, CategoryMap, ChildInput, KernelShape};
use super::scaling::scale_partials;
use super::storage::{Dimensions, MatrixCache, NodeCoding, PartialsStorage};

/// Partial-likelihood engine for one dataset.
///
/// Owns every per-node buffer. The caller decides traversal order and which
/// nodes are dirty; the core only computes what it is asked to.
#[derive(Clone, Debug)]
pub struct LikelihoodCore {
    dims: Dimensions,
    partials: PartialsStorage,
    matrices: MatrixCache,
    scaling_mode: ScalingMode,
    scaling_threshold: f64,
    parallel_pattern_threshold: usize,
}

impl LikelihoodCore {
    /// Allocate double-buffered storage for `dims.node_count` nodes.
    pub fn new(dims: Dimensions, config: &LikelihoodConfig) -> Result<Self> {
        dims.validate()?;
        if !(config.scaling.threshold > 0.0) {
            return Err(LikelihoodError::InvalidParameter(format!(
                "scaling threshold must be positive (got {})",
                config.scaling.threshold
            )));
        }
        Ok(Self {
            dims,
            partials: PartialsStorage::allocate(dims),
            matrices: MatrixCache::allocate(dims),
            scaling_mode: config.scaling.mode,
            scaling_threshold: config.scaling.threshold,
            parallel_pattern_threshold: config.parallel_pattern_threshold.max(1),
        })
    }

    pub fn dimensions(&self) -> &Dimensions {
        &self.dims
    }

    pub fn node_count(&self) -> usize {
        self.dims.node_count
    }

    pub fn coding(&self, node: usize) -> Option<NodeCoding> {
        self.partials.coding(node)
    }

    pub fn create_tip_states(&mut self, node: usize, states: &[u32]) -> Result<()> {
        self.partials.create_tip_states(node, states)
    }

    pub fn create_tip_partials(&mut self, node: usize, partials: &[f64]) -> Result<()> {
        self.partials.create_tip_partials(node, partials)
    }

    pub fn create_node_partials(&mut self, node: usize) -> Result<()> {
        self.partials.create_node_partials(node)
    }

    /// Append `extra` partials-coded nodes. Returns the first new index.
    ///
    /// Existing buffers and their current/stored indices are kept as they are.
    pub fn grow_storage(&mut self, extra: usize) -> usize {
        let first = self.partials.grow(extra);
        self.matrices.grow(extra);
        self.dims.node_count = self.partials.node_count();
        debug!(
            first_new = first,
            node_count = self.dims.node_count,
            "grew likelihood storage"
        );
        first
    }

    pub fn prepare_matrix_for_update(&mut self, node: usize) -> Result<()> {
        self.check_node(node)?;
        self.matrices.prepare_for_update(node);
        Ok(())
    }

    /// Fill the transition matrix of `category` on the branch above `node`.
    ///
    /// # Arguments
    /// * `branch_length` - Must be finite and non-negative
    /// * `rate` - Category rate multiplier, finite and non-negative
    pub fn set_matrix<M: SubstitutionModel + ?Sized>(
        &mut self,
        node: usize,
        category: usize,
        branch_length: f64,
        rate: f64,
        model: &M,
    ) -> Result<()> {
        self.check_node(node)?;
        self.check_category(category)?;
        if !branch_length.is_finite() || branch_length < 0.0 {
            return Err(LikelihoodError::InvalidBranchLength {
                node,
                length: branch_length,
            });
        }
        if !rate.is_finite() || rate < 0.0 {
            return Err(LikelihoodError::InvalidRate { category, rate });
        }
        if model.state_count() != self.dims.state_count {
            return Err(LikelihoodError::DimensionMismatch(format!(
                "model has {} states, engine has {}",
                model.state_count(),
                self.dims.state_count
            )));
        }
        model.fill_transition_matrix(branch_length, rate, category, self.matrices.block_mut(node, category));
        Ok(())
    }

    /// Copy a precomputed matrix into the current buffer.
    pub fn set_matrix_values(&mut self, node: usize, category: usize, values: &[f64]) -> Result<()> {
        self.check_node(node)?;
        self.check_category(category)?;
        if values.len() != self.dims.matrix_size() {
            return Err(LikelihoodError::DimensionMismatch(format!(
                "matrix of {} entries, expected {}",
                values.len(),
                self.dims.matrix_size()
            )));
        }
        self.matrices.block_mut(node, category).copy_from_slice(values);
        Ok(())
    }

    pub fn matrix(&self, node: usize, category: usize) -> Result<&[f64]> {
        self.check_node(node)?;
        self.check_category(category)?;
        let size = self.dims.matrix_size();
        Ok(&self.matrices.current(node)[category * size..(category + 1) * size])
    }

    pub fn prepare_partials_for_update(&mut self, node: usize) -> Result<()> {
        self.partials.prepare_for_update(node)
    }

    /// Combine two children into `parent`, integrating over every category.
    ///
    /// `site_range` defaults to all patterns.
    pub fn compute_partials(
        &mut self,
        child1: usize,
        child2: usize,
        parent: usize,
        site_range: Option<Range<usize>>,
    ) -> Result<()> {
        self.compute_partials_multi(&[child1, child2], parent, None, site_range)
    }

    /// Combine two children into `parent` using one category per pattern.
    pub fn compute_partials_mapped(
        &mut self,
        child1: usize,
        child2: usize,
        parent: usize,
        matrix_map: &[usize],
        site_range: Option<Range<usize>>,
    ) -> Result<()> {
        self.compute_partials_multi(&[child1, child2], parent, Some(matrix_map), site_range)
    }

    /// Combine any number (≥ 2) of children into `parent`.
    ///
    /// The first two children go through the specialized kernels, later
    /// ones are multiplied in left to right. Partials are rescaled after
    /// every step and the step factors summed, so wide nodes cannot
    /// underflow part way through the fold.
    pub fn compute_partials_multi(
        &mut self,
        children: &[usize],
        parent: usize,
        matrix_map: Option<&[usize]>,
        site_range: Option<Range<usize>>,
    ) -> Result<()> {
        if children.len() < 2 {
            return Err(LikelihoodError::UnsupportedTopology(format!(
                "node {} has {} children, at least two are required",
                parent,
                children.len()
            )));
        }
        let map = self.category_map(matrix_map)?;
        let range = self.site_range(site_range)?;
        self.check_children(children, parent)?;

        let (mut data, mut factors) = self.partials.take_current(parent, &range)?;
        let shape = self.kernel_shape(&range);

        let result = self.run_kernels(children, map, &range, &shape, &mut data, &mut factors);
        self.partials.put_current(parent, data, factors);
        result
    }

    /// Multiply one more child into the current partials of `parent`.
    ///
    /// Any rescaling this causes is added to the factors already recorded.
    pub fn accumulate_partials(
        &mut self,
        child: usize,
        parent: usize,
        matrix_map: Option<&[usize]>,
        site_range: Option<Range<usize>>,
    ) -> Result<()> {
        let map = self.category_map(matrix_map)?;
        let range = self.site_range(site_range)?;
        self.check_children(&[child], parent)?;

        let (mut data, mut factors) = self.partials.take_current(parent, &range)?;
        let shape = self.kernel_shape(&range);

        let result = self.child_input(child).map(|input| {
            pruning::accumulate(input, self.matrices.current(child), &mut data, &shape, map, range.clone());
        });
        if result.is_ok() {
            self.rescale_step(&mut data, &mut factors, &range, shape.parallel);
        }
        self.partials.put_current(parent, data, factors);
        result
    }

    pub fn set_scaling_mode(&mut self, mode: ScalingMode) {
        self.scaling_mode = mode;
    }

    pub fn scaling_mode(&self) -> ScalingMode {
        self.scaling_mode
    }

    pub fn scaling_threshold(&self) -> f64 {
        self.scaling_threshold
    }

    /// Log scale factors recorded at an internal node, one per pattern.
    pub fn log_scaling_factors(&self, node: usize) -> Result<&[f64]> {
        self.check_node(node)?;
        self.partials.scale_factors(node).ok_or_else(|| {
            LikelihoodError::UnsupportedTopology(format!("node {} has no scale factors", node))
        })
    }

    /// Overwrite `out` with the per-pattern sum of scale factors over `nodes`.
    ///
    /// Tips carry no factors and are skipped.
    pub fn sum_log_scaling_factors(&self, nodes: &[usize], out: &mut [f64]) -> Result<()> {
        if out.len() != self.dims.pattern_count {
            return Err(LikelihoodError::DimensionMismatch(format!(
                "{} scale sums for {} patterns",
                out.len(),
                self.dims.pattern_count
            )));
        }
        out.fill(0.0);
        for &node in nodes {
            self.check_node(node)?;
            if let Some(factors) = self.partials.scale_factors(node) {
                for (sum, f) in out.iter_mut().zip(factors) {
                    *sum += f;
                }
            }
        }
        Ok(())
    }

    /// Current partials of a partials-coded node.
    pub fn partials(&self, node: usize) -> Result<&[f64]> {
        self.check_node(node)?;
        self.partials
            .partials(node)
            .ok_or(LikelihoodError::NodeNotCreated(node))
    }

    /// Collapse the partials of `node` over categories into `out`
    /// (`pattern_count × state_count`).
    pub fn integrate_partials(&self, node: usize, proportions: &[f64], out: &mut [f64]) -> Result<()> {
        if proportions.len() != self.dims.category_slots() {
            return Err(LikelihoodError::DimensionMismatch(format!(
                "{} proportions for {} category slots",
                proportions.len(),
                self.dims.category_slots()
            )));
        }
        if out.len() != self.dims.pattern_count * self.dims.state_count {
            return Err(LikelihoodError::DimensionMismatch(format!(
                "integration output of {} entries, expected {}",
                out.len(),
                self.dims.pattern_count * self.dims.state_count
            )));
        }
        let partials = self.partials(node)?;
        integrate::integrate_partials(partials, proportions, self.dims.state_count, out);
        Ok(())
    }

    pub fn store_state(&mut self) {
        self.partials.store();
        self.matrices.store();
    }

    pub fn restore_state(&mut self) {
        self.partials.restore();
        self.matrices.restore();
    }

    pub fn accept_state(&mut self) {
        self.partials.accept();
        self.matrices.accept();
    }

    /// Writes `out` and `factors` only once every child has been resolved.
    fn run_kernels(
        &self,
        children: &[usize],
        map: CategoryMap,
        range: &Range<usize>,
        shape: &KernelShape,
        out: &mut [f64],
        factors: &mut [f64],
    ) -> Result<()> {
        let inputs = children
            .iter()
            .map(|&child| self.child_input(child).map(|input| (input, self.matrices.current(child))))
            .collect::<Result<Vec<_>>>()?;

        let (first, first_matrix) = inputs[0];
        let (second, second_matrix) = inputs[1];
        pruning::combine(first, first_matrix, second, second_matrix, out, shape, map, range.clone());
        scale_partials(
            out,
            factors,
            self.dims.pattern_block(),
            range.clone(),
            self.scaling_mode,
            self.scaling_threshold,
            shape.parallel,
        );
        for &(input, matrix) in &inputs[2..] {
            pruning::accumulate(input, matrix, out, shape, map, range.clone());
            self.rescale_step(out, factors, range, shape.parallel);
        }
        Ok(())
    }

    /// Rescale after one fold step, adding to the factors already recorded.
    fn rescale_step(&self, data: &mut [f64], factors: &mut [f64], range: &Range<usize>, parallel: bool) {
        if self.scaling_mode == ScalingMode::Off {
            return;
        }
        let mut step = vec![0.0; self.dims.pattern_count];
        scale_partials(
            data,
            &mut step,
            self.dims.pattern_block(),
            range.clone(),
            self.scaling_mode,
            self.scaling_threshold,
            parallel,
        );
        for p in range.clone() {
            factors[p] += step[p];
        }
    }

    fn child_input(&self, node: usize) -> Result<ChildInput<'_>> {
        if let Some(states) = self.partials.states(node) {
            return Ok(ChildInput::States(states));
        }
        self.partials
            .partials(node)
            .map(ChildInput::Partials)
            .ok_or(LikelihoodError::NodeNotCreated(node))
    }

    fn kernel_shape(&self, range: &Range<usize>) -> KernelShape {
        KernelShape {
            state_count: self.dims.state_count,
            category_slots: self.dims.category_slots(),
            parallel: range.len() >= self.parallel_pattern_threshold,
        }
    }

    fn category_map<'a>(&self, matrix_map: Option<&'a [usize]>) -> Result<CategoryMap<'a>> {
        match (self.dims.integrate_categories, matrix_map) {
            (true, None) => Ok(CategoryMap::Integrated),
            (false, Some(map)) => {
                if map.len() != self.dims.pattern_count {
                    return Err(LikelihoodError::DimensionMismatch(format!(
                        "matrix map has {} entries for {} patterns",
                        map.len(),
                        self.dims.pattern_count
                    )));
                }
                if let Some(&bad) = map.iter().find(|&&c| c >= self.dims.category_count) {
                    return Err(LikelihoodError::InvalidParameter(format!(
                        "matrix map names category {} of {}",
                        bad, self.dims.category_count
                    )));
                }
                Ok(CategoryMap::Mapped(map))
            }
            (true, Some(_)) => Err(LikelihoodError::InvalidParameter(
                "engine integrates categories; a matrix map is not accepted".to_string(),
            )),
            (false, None) => Err(LikelihoodError::InvalidParameter(
                "engine uses per-pattern categories; a matrix map is required".to_string(),
            )),
        }
    }

    fn site_range(&self, site_range: Option<Range<usize>>) -> Result<Range<usize>> {
        let pattern_count = self.dims.pattern_count;
        let range = site_range.unwrap_or(0..pattern_count);
        if range.start >= range.end || range.end > pattern_count {
            return Err(LikelihoodError::InvalidSiteRange {
                start: range.start,
                end: range.end,
                pattern_count,
            });
        }
        Ok(range)
    }

    fn check_children(&self, children: &[usize], parent: usize) -> Result<()> {
        self.check_node(parent)?;
        for &child in children {
            self.check_node(child)?;
            if child == parent {
                return Err(LikelihoodError::UnsupportedTopology(format!(
                    "node {} cannot be its own child",
                    parent
                )));
            }
            if self.partials.coding(child).is_none() {
                return Err(LikelihoodError::NodeNotCreated(child));
            }
        }
        Ok(())
    }

    fn check_node(&self, node: usize) -> Result<()> {
        if node >= self.dims.node_count {
            return Err(LikelihoodError::NodeOutOfRange {
                node,
                node_count: self.dims.node_count,
            });
        }
        Ok(())
    }

    fn check_category(&self, category: usize) -> Result<()> {
        if category >= self.dims.category_count {
            return Err(LikelihoodError::InvalidParameter(format!(
                "category {} of {}",
                category, self.dims.category_count
            )));
        }
        Ok(())
    }
}
