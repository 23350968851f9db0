//! Current/stored buffer indices shared by every double-buffered per-node array.

/// One `current` and one `stored` slot index (0 or 1) per node.
///
/// A node is "flipped" when its current slot differs from its stored slot;
/// it then writes into scratch space and the stored slot stays untouched
/// until the next [`store`](BufferIndices::store).
#[derive(Clone, Debug, Default)]
pub struct BufferIndices {
    current: Vec<u8>,
    stored: Vec<u8>,
}

impl BufferIndices {
    pub fn new(node_count: usize) -> Self {
        Self {
            current: vec![0; node_count],
            stored: vec![0; node_count],
        }
    }

    pub fn len(&self) -> usize {
        self.current.len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }

    /// Slot holding the authoritative copy for `node`.
    #[inline]
    pub fn current(&self, node: usize) -> usize {
        self.current[node] as usize
    }

    /// The slot that is not current.
    #[inline]
    pub fn other(&self, node: usize) -> usize {
        1 - self.current(node)
    }

    /// Move `node` into its scratch slot before it is rewritten.
    ///
    /// Returns `true` if the node flipped. A node that already flipped since
    /// the last store keeps writing into the same scratch slot, so the
    /// stored copy is never overwritten.
    pub fn prepare_for_update(&mut self, node: usize) -> bool {
        if self.current[node] == self.stored[node] {
            self.current[node] = 1 - self.current[node];
            true
        } else {
            false
        }
    }

    /// Remember the current slots as the rollback point.
    pub fn store(&mut self) {
        self.stored.copy_from_slice(&self.current);
    }

    /// Point every node back at its stored slot. No partials are copied.
    pub fn restore(&mut self) {
        self.current.copy_from_slice(&self.stored);
    }

    /// Make the current slots authoritative; the old stored copies become scratch.
    pub fn accept(&mut self) {
        self.store();
    }

    /// Append `extra` nodes, both slots at 0.
    pub fn grow(&mut self, extra: usize) {
        let n = self.current.len() + extra;
        self.current.resize(n, 0);
        self.stored.resize(n, 0);
    }
}
