//! Felsenstein pruning kernels.
//!
//! Each kernel combines two children into a parent:
//!
//! ```text
//! parent[p, c, i] = (Σ_j M1[c, i, j] · child1[p, c, j]) · (Σ_j M2[c, i, j] · child2[p, c, j])
//! ```
//!
//! A state-coded child replaces its sum with a single matrix entry, or with
//! 1.0 when its code is ambiguous. Patterns are independent, so a kernel
//! splits its range across the rayon pool when `parallel` is set.

use std::ops::Range;

use rayon::prelude::*;

/// One child's data as seen by a kernel.
#[derive(Clone, Copy, Debug)]
pub enum ChildInput<'a> {
    States(&'a [u32]),
    Partials(&'a [f64]),
}

/// Which rate categories each pattern is computed for.
#[derive(Clone, Copy, Debug)]
pub enum CategoryMap<'a> {
    /// Every category, each in its own slot.
    Integrated,
    /// One category per pattern, written to slot 0.
    Mapped(&'a [usize]),
}

impl CategoryMap<'_> {
    /// Categories for `pattern`; the slot of category `c` is `c - range.start`.
    #[inline]
    fn categories(&self, pattern: usize, slots: usize) -> Range<usize> {
        match self {
            CategoryMap::Integrated => 0..slots,
            CategoryMap::Mapped(map) => map[pattern]..map[pattern] + 1,
        }
    }
}

/// Sizes shared by all kernels for one call.
#[derive(Clone, Copy, Debug)]
pub struct KernelShape {
    pub state_count: usize,
    pub category_slots: usize,
    pub parallel: bool,
}

impl KernelShape {
    fn block(&self) -> usize {
        self.state_count * self.category_slots
    }

    fn matrix_size(&self) -> usize {
        self.state_count * self.state_count
    }
}

#[inline]
fn state_factor(matrix: &[f64], row: usize, state: u32, n: usize) -> f64 {
    let s = state as usize;
    if s < n {
        matrix[row + s]
    } else {
        1.0
    }
}

#[inline]
fn partials_factor(matrix_row: &[f64], child: &[f64]) -> f64 {
    matrix_row.iter().zip(child).map(|(m, x)| m * x).sum()
}

/// Run `f(pattern, block)` over every pattern block in `range`.
fn for_each_pattern<F>(out: &mut [f64], range: Range<usize>, shape: &KernelShape, f: F)
where
    F: Fn(usize, &mut [f64]) + Send + Sync,
{
    let block = shape.block();
    let start = range.start;
    let region = &mut out[range.start * block..range.end * block];

    if shape.parallel {
        region
            .par_chunks_mut(block)
            .enumerate()
            .for_each(|(k, chunk)| f(start + k, chunk));
    } else {
        region
            .chunks_mut(block)
            .enumerate()
            .for_each(|(k, chunk)| f(start + k, chunk));
    }
}

/// Both children state-coded.
///
/// If both codes of a pattern are ambiguous the parent block is all ones.
#[allow(clippy::too_many_arguments)]
pub fn states_states(
    states1: &[u32],
    matrices1: &[f64],
    states2: &[u32],
    matrices2: &[f64],
    out: &mut [f64],
    shape: &KernelShape,
    map: CategoryMap,
    range: Range<usize>,
) {
    let n = shape.state_count;
    let msize = shape.matrix_size();

    for_each_pattern(out, range, shape, |p, block| {
        let (s1, s2) = (states1[p], states2[p]);
        let cats = map.categories(p, shape.category_slots);
        for c in cats.clone() {
            let m1 = &matrices1[c * msize..(c + 1) * msize];
            let m2 = &matrices2[c * msize..(c + 1) * msize];
            let slot = &mut block[(c - cats.start) * n..(c - cats.start + 1) * n];
            for (i, value) in slot.iter_mut().enumerate() {
                let row = i * n;
                *value = state_factor(m1, row, s1, n) * state_factor(m2, row, s2, n);
            }
        }
    });
}

/// First child state-coded, second partials-coded.
#[allow(clippy::too_many_arguments)]
pub fn states_partials(
    states1: &[u32],
    matrices1: &[f64],
    partials2: &[f64],
    matrices2: &[f64],
    out: &mut [f64],
    shape: &KernelShape,
    map: CategoryMap,
    range: Range<usize>,
) {
    let n = shape.state_count;
    let msize = shape.matrix_size();
    let block_len = shape.block();

    for_each_pattern(out, range, shape, |p, block| {
        let s1 = states1[p];
        let cats = map.categories(p, shape.category_slots);
        for c in cats.clone() {
            let slot_index = c - cats.start;
            let m1 = &matrices1[c * msize..(c + 1) * msize];
            let m2 = &matrices2[c * msize..(c + 1) * msize];
            let offset = p * block_len + slot_index * n;
            let child2 = &partials2[offset..offset + n];
            let slot = &mut block[slot_index * n..(slot_index + 1) * n];
            for (i, value) in slot.iter_mut().enumerate() {
                let row = i * n;
                *value = state_factor(m1, row, s1, n) * partials_factor(&m2[row..row + n], child2);
            }
        }
    });
}

/// Both children partials-coded.
#[allow(clippy::too_many_arguments)]
pub fn partials_partials(
    partials1: &[f64],
    matrices1: &[f64],
    partials2: &[f64],
    matrices2: &[f64],
    out: &mut [f64],
    shape: &KernelShape,
    map: CategoryMap,
    range: Range<usize>,
) {
    let n = shape.state_count;
    let msize = shape.matrix_size();
    let block_len = shape.block();

    for_each_pattern(out, range, shape, |p, block| {
        let cats = map.categories(p, shape.category_slots);
        for c in cats.clone() {
            let slot_index = c - cats.start;
            let m1 = &matrices1[c * msize..(c + 1) * msize];
            let m2 = &matrices2[c * msize..(c + 1) * msize];
            let offset = p * block_len + slot_index * n;
            let child1 = &partials1[offset..offset + n];
            let child2 = &partials2[offset..offset + n];
            let slot = &mut block[slot_index * n..(slot_index + 1) * n];
            for (i, value) in slot.iter_mut().enumerate() {
                let row = i * n..(i + 1) * n;
                *value = partials_factor(&m1[row.clone()], child1) * partials_factor(&m2[row], child2);
            }
        }
    });
}

/// Dispatch two children to the matching kernel.
#[allow(clippy::too_many_arguments)]
pub fn combine(
    child1: ChildInput,
    matrices1: &[f64],
    child2: ChildInput,
    matrices2: &[f64],
    out: &mut [f64],
    shape: &KernelShape,
    map: CategoryMap,
    range: Range<usize>,
) {
    match (child1, child2) {
        (ChildInput::States(s1), ChildInput::States(s2)) => {
            states_states(s1, matrices1, s2, matrices2, out, shape, map, range)
        }
        (ChildInput::States(s1), ChildInput::Partials(p2)) => {
            states_partials(s1, matrices1, p2, matrices2, out, shape, map, range)
        }
        (ChildInput::Partials(p1), ChildInput::States(s2)) => {
            states_partials(s2, matrices2, p1, matrices1, out, shape, map, range)
        }
        (ChildInput::Partials(p1), ChildInput::Partials(p2)) => {
            partials_partials(p1, matrices1, p2, matrices2, out, shape, map, range)
        }
    }
}

/// Multiply one more child's branch factor into already computed partials.
///
/// Used for the third and later children of a multifurcating node.
pub fn accumulate(
    child: ChildInput,
    matrices: &[f64],
    out: &mut [f64],
    shape: &KernelShape,
    map: CategoryMap,
    range: Range<usize>,
) {
    let n = shape.state_count;
    let msize = shape.matrix_size();
    let block_len = shape.block();

    for_each_pattern(out, range, shape, |p, block| {
        let cats = map.categories(p, shape.category_slots);
        for c in cats.clone() {
            let slot_index = c - cats.start;
            let m = &matrices[c * msize..(c + 1) * msize];
            let slot = &mut block[slot_index * n..(slot_index + 1) * n];
            match child {
                ChildInput::States(states) => {
                    let s = states[p];
                    for (i, value) in slot.iter_mut().enumerate() {
                        *value *= state_factor(m, i * n, s, n);
                    }
                }
                ChildInput::Partials(partials) => {
                    let offset = p * block_len + slot_index * n;
                    let x = &partials[offset..offset + n];
                    for (i, value) in slot.iter_mut().enumerate() {
                        *value *= partials_factor(&m[i * n..(i + 1) * n], x);
                    }
                }
            }
        }
    });
}
