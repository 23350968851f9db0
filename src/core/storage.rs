//! Per-node partials, scale factors and transition matrices.
//!
//! Layout of a partials vector: pattern-major, then category slot, then
//! state: `(pattern * category_slots + slot) * state_count + state`.

use std::ops::Range;

use crate::error::{LikelihoodError, Result};

use super::buffers::BufferIndices;

/// Sizes of every per-node array.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Dimensions {
    pub node_count: usize,
    pub pattern_count: usize,
    pub category_count: usize,
    pub state_count: usize,
    /// Integrate every pattern over all categories; otherwise each pattern
    /// uses one category chosen by a matrix map.
    pub integrate_categories: bool,
}

impl Dimensions {
    pub fn new(node_count: usize, pattern_count: usize, category_count: usize, state_count: usize) -> Self {
        Self {
            node_count,
            pattern_count,
            category_count,
            state_count,
            integrate_categories: true,
        }
    }

    /// Category slots stored per pattern in a partials vector.
    pub fn category_slots(&self) -> usize {
        if self.integrate_categories {
            self.category_count
        } else {
            1
        }
    }

    /// Entries per pattern in a partials vector.
    pub fn pattern_block(&self) -> usize {
        self.category_slots() * self.state_count
    }

    pub fn partials_size(&self) -> usize {
        self.pattern_count * self.pattern_block()
    }

    pub fn matrix_size(&self) -> usize {
        self.state_count * self.state_count
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.pattern_count == 0 || self.category_count == 0 {
            return Err(LikelihoodError::DimensionMismatch(
                "pattern and category counts must be positive".to_string(),
            ));
        }
        if self.state_count < 2 {
            return Err(LikelihoodError::DimensionMismatch(
                "at least two states are required".to_string(),
            ));
        }
        Ok(())
    }
}

/// How a node's data is held. Fixed once the node is created.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeCoding {
    StateCoded,
    PartialsCoded,
}

#[derive(Clone, Debug)]
enum NodeSlot {
    Empty,
    States(Vec<u32>),
    /// Immutable tip partials, single copy.
    TipPartials(Vec<f64>),
    /// Computed partials plus per-pattern log scale factors, two copies each.
    Computed {
        partials: [Vec<f64>; 2],
        scale_factors: [Vec<f64>; 2],
    },
}

/// Double-buffered node storage.
#[derive(Clone, Debug)]
pub struct PartialsStorage {
    dims: Dimensions,
    nodes: Vec<NodeSlot>,
    indices: BufferIndices,
    /// Flipped this cycle; untouched patterns must be copied over before a
    /// partial-range update.
    pending_sync: Vec<bool>,
}

impl PartialsStorage {
    pub fn allocate(dims: Dimensions) -> Self {
        Self {
            dims,
            nodes: vec![NodeSlot::Empty; dims.node_count],
            indices: BufferIndices::new(dims.node_count),
            pending_sync: vec![false; dims.node_count],
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn coding(&self, node: usize) -> Option<NodeCoding> {
        match self.nodes.get(node)? {
            NodeSlot::Empty => None,
            NodeSlot::States(_) => Some(NodeCoding::StateCoded),
            NodeSlot::TipPartials(_) | NodeSlot::Computed { .. } => Some(NodeCoding::PartialsCoded),
        }
    }

    /// Install observed state codes for a tip.
    pub fn create_tip_states(&mut self, node: usize, states: &[u32]) -> Result<()> {
        self.check_empty(node)?;
        if states.len() != self.dims.pattern_count {
            return Err(LikelihoodError::DimensionMismatch(format!(
                "{} tip states for {} patterns",
                states.len(),
                self.dims.pattern_count
            )));
        }
        self.nodes[node] = NodeSlot::States(states.to_vec());
        Ok(())
    }

    /// Install tip partials, either one vector per pattern
    /// (`pattern_count × state_count`, replicated into every category
    /// slot) or a full partials vector.
    pub fn create_tip_partials(&mut self, node: usize, partials: &[f64]) -> Result<()> {
        self.check_empty(node)?;
        let dims = self.dims;
        let per_pattern = dims.pattern_count * dims.state_count;

        let data = if partials.len() == dims.partials_size() {
            partials.to_vec()
        } else if partials.len() == per_pattern {
            let mut data = Vec::with_capacity(dims.partials_size());
            for row in partials.chunks_exact(dims.state_count) {
                for _ in 0..dims.category_slots() {
                    data.extend_from_slice(row);
                }
            }
            data
        } else {
            return Err(LikelihoodError::DimensionMismatch(format!(
                "{} tip partials, expected {} or {}",
                partials.len(),
                per_pattern,
                dims.partials_size()
            )));
        };

        if data.iter().any(|&p| !p.is_finite() || p < 0.0) {
            return Err(LikelihoodError::InvalidParameter(format!(
                "tip partials for node {} must be finite and non-negative",
                node
            )));
        }
        self.nodes[node] = NodeSlot::TipPartials(data);
        Ok(())
    }

    /// Allocate both partials copies for an internal node.
    pub fn create_node_partials(&mut self, node: usize) -> Result<()> {
        self.check_empty(node)?;
        self.nodes[node] = self.computed_slot();
        Ok(())
    }

    /// Append `extra` internal nodes; returns the first new index.
    pub fn grow(&mut self, extra: usize) -> usize {
        let first = self.nodes.len();
        let slot = self.computed_slot();
        self.nodes.resize(first + extra, slot);
        self.indices.grow(extra);
        self.pending_sync.resize(first + extra, false);
        self.dims.node_count = self.nodes.len();
        first
    }

    pub fn states(&self, node: usize) -> Option<&[u32]> {
        match self.nodes.get(node)? {
            NodeSlot::States(states) => Some(states),
            _ => None,
        }
    }

    /// Current partials of a partials-coded node.
    pub fn partials(&self, node: usize) -> Option<&[f64]> {
        match self.nodes.get(node)? {
            NodeSlot::TipPartials(data) => Some(data),
            NodeSlot::Computed { partials, .. } => Some(&partials[self.indices.current(node)]),
            _ => None,
        }
    }

    /// Current log scale factors of a computed node.
    pub fn scale_factors(&self, node: usize) -> Option<&[f64]> {
        match self.nodes.get(node)? {
            NodeSlot::Computed { scale_factors, .. } => {
                Some(&scale_factors[self.indices.current(node)])
            }
            _ => None,
        }
    }

    pub fn prepare_for_update(&mut self, node: usize) -> Result<()> {
        self.check_computed(node)?;
        if self.indices.prepare_for_update(node) {
            self.pending_sync[node] = true;
        }
        Ok(())
    }

    /// Take the current partials and scale factors of `node` out for writing.
    ///
    /// Must be paired with [`put_current`](Self::put_current).
    pub(crate) fn take_current(&mut self, node: usize, range: &Range<usize>) -> Result<(Vec<f64>, Vec<f64>)> {
        self.check_computed(node)?;
        let block = self.dims.pattern_block();
        let pattern_count = self.dims.pattern_count;
        let current = self.indices.current(node);
        let sync = std::mem::take(&mut self.pending_sync[node]);

        let NodeSlot::Computed {
            partials,
            scale_factors,
        } = &mut self.nodes[node]
        else {
            return Err(LikelihoodError::UnsupportedTopology(format!(
                "node {} does not hold computed partials",
                node
            )));
        };

        let partial_range = range.start > 0 || range.end < pattern_count;
        if sync && partial_range {
            let [a, b] = partials;
            let (src, dst) = if current == 0 { (&*b, a) } else { (&*a, b) };
            dst[..range.start * block].copy_from_slice(&src[..range.start * block]);
            dst[range.end * block..].copy_from_slice(&src[range.end * block..]);

            let [a, b] = scale_factors;
            let (src, dst) = if current == 0 { (&*b, a) } else { (&*a, b) };
            dst[..range.start].copy_from_slice(&src[..range.start]);
            dst[range.end..].copy_from_slice(&src[range.end..]);
        }

        Ok((
            std::mem::take(&mut partials[current]),
            std::mem::take(&mut scale_factors[current]),
        ))
    }

    pub(crate) fn put_current(&mut self, node: usize, data: Vec<f64>, factors: Vec<f64>) {
        let current = self.indices.current(node);
        if let NodeSlot::Computed {
            partials,
            scale_factors,
        } = &mut self.nodes[node]
        {
            partials[current] = data;
            scale_factors[current] = factors;
        }
    }

    pub fn store(&mut self) {
        self.indices.store();
    }

    pub fn restore(&mut self) {
        self.indices.restore();
        self.pending_sync.fill(false);
    }

    pub fn accept(&mut self) {
        self.indices.accept();
    }

    fn computed_slot(&self) -> NodeSlot {
        let size = self.dims.partials_size();
        let patterns = self.dims.pattern_count;
        NodeSlot::Computed {
            partials: [vec![0.0; size], vec![0.0; size]],
            scale_factors: [vec![0.0; patterns], vec![0.0; patterns]],
        }
    }

    fn check_node(&self, node: usize) -> Result<()> {
        if node >= self.nodes.len() {
            return Err(LikelihoodError::NodeOutOfRange {
                node,
                node_count: self.nodes.len(),
            });
        }
        Ok(())
    }

    fn check_empty(&self, node: usize) -> Result<()> {
        self.check_node(node)?;
        match self.nodes[node] {
            NodeSlot::Empty => Ok(()),
            _ => Err(LikelihoodError::CodingAlreadySet(node)),
        }
    }

    fn check_computed(&self, node: usize) -> Result<()> {
        self.check_node(node)?;
        match self.nodes[node] {
            NodeSlot::Computed { .. } => Ok(()),
            NodeSlot::Empty => Err(LikelihoodError::NodeNotCreated(node)),
            _ => Err(LikelihoodError::UnsupportedTopology(format!(
                "node {} holds tip data and cannot be recomputed",
                node
            ))),
        }
    }
}

/// Double-buffered transition matrices, one block per rate category.
#[derive(Clone, Debug)]
pub struct MatrixCache {
    dims: Dimensions,
    matrices: Vec<[Vec<f64>; 2]>,
    indices: BufferIndices,
}

impl MatrixCache {
    pub fn allocate(dims: Dimensions) -> Self {
        let size = dims.category_count * dims.matrix_size();
        Self {
            dims,
            matrices: vec![[vec![0.0; size], vec![0.0; size]]; dims.node_count],
            indices: BufferIndices::new(dims.node_count),
        }
    }

    pub fn grow(&mut self, extra: usize) {
        let size = self.dims.category_count * self.dims.matrix_size();
        let n = self.matrices.len() + extra;
        self.matrices.resize(n, [vec![0.0; size], vec![0.0; size]]);
        self.indices.grow(extra);
        self.dims.node_count = n;
    }

    pub fn prepare_for_update(&mut self, node: usize) {
        self.indices.prepare_for_update(node);
    }

    /// Current matrices for all categories of `node`.
    pub fn current(&self, node: usize) -> &[f64] {
        &self.matrices[node][self.indices.current(node)]
    }

    /// Writable block for one category in the current copy.
    pub fn block_mut(&mut self, node: usize, category: usize) -> &mut [f64] {
        let size = self.dims.matrix_size();
        let current = self.indices.current(node);
        &mut self.matrices[node][current][category * size..(category + 1) * size]
    }

    pub fn store(&mut self) {
        self.indices.store();
    }

    pub fn restore(&mut self) {
        self.indices.restore();
    }

    pub fn accept(&mut self) {
        self.indices.accept();
    }
}
