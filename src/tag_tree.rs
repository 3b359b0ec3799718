//! Tag trees for packet header coding, ISO/IEC 15444-1 B.10.2.
//!
//! A tag tree signals a 2D grid of monotonically revealed integers (first
//! inclusion layers, zero bit-plane counts) with near-minimal bit cost.
//! Nodes form a pyramid built by 2x2 grouping of the leaf grid; encode and
//! decode walk the leaf's ancestor chain from the root down, carrying a
//! running lower bound so information shared between neighbouring leaves
//! is emitted only once.

use crate::bit_io::{BitReader, BitWriter};
use crate::constants::TAG_TREE_SENTINEL;
use crate::error::Tier2Error;

#[derive(Clone, Debug, Default)]
struct TagNode {
    /// Current known upper bound on the signaled value.
    value: u32,
    /// Lowest threshold already resolved for this node.
    low: u32,
    known: bool,
    parent: Option<usize>,
}

/// Tag tree over a `leaf_width x leaf_height` grid.
#[derive(Debug)]
pub struct TagTree {
    nodes: Vec<TagNode>,
    leaf_width: usize,
    leaf_height: usize,
}

impl TagTree {
    /// Create a tree for a `w x h` leaf grid. Returns `None` for a
    /// degenerate grid.
    pub fn new(w: usize, h: usize) -> Option<Self> {
        if w == 0 || h == 0 {
            return None;
        }
        let mut tree = Self {
            nodes: Vec::new(),
            leaf_width: w,
            leaf_height: h,
        };
        tree.build();
        tree.reset();
        Some(tree)
    }

    /// Re-initialize for a new leaf grid, reusing storage. A no-op when
    /// the grid is unchanged; otherwise the tree is rebuilt and reset.
    pub fn init(&mut self, w: usize, h: usize) {
        debug_assert!(w > 0 && h > 0);
        if w == self.leaf_width && h == self.leaf_height {
            return;
        }
        self.leaf_width = w;
        self.leaf_height = h;
        self.build();
        self.reset();
    }

    fn build(&mut self) {
        self.nodes.clear();

        let mut level_start = 0usize;
        let mut level_w = self.leaf_width;
        let mut level_h = self.leaf_height;
        self.nodes
            .resize(level_w * level_h, TagNode::default());

        // Merge 2x2 until a single root remains.
        while level_w > 1 || level_h > 1 {
            let next_w = level_w.div_ceil(2);
            let next_h = level_h.div_ceil(2);
            let next_start = self.nodes.len();
            self.nodes
                .resize(next_start + next_w * next_h, TagNode::default());

            for y in 0..level_h {
                for x in 0..level_w {
                    let child = level_start + y * level_w + x;
                    let parent = next_start + (y / 2) * next_w + (x / 2);
                    self.nodes[child].parent = Some(parent);
                }
            }

            level_start = next_start;
            level_w = next_w;
            level_h = next_h;
        }
    }

    /// Restore every node to its unresolved state.
    pub fn reset(&mut self) {
        for node in &mut self.nodes {
            node.value = TAG_TREE_SENTINEL;
            node.low = 0;
            node.known = false;
        }
    }

    pub fn num_leafs(&self) -> usize {
        self.leaf_width * self.leaf_height
    }

    /// Lower the value at `leafno`, propagating the decrease to ancestors
    /// while it remains below theirs. Values only ever decrease.
    pub fn set_value(&mut self, leafno: usize, value: u32) {
        debug_assert!(leafno < self.num_leafs());
        let mut idx = Some(leafno);
        while let Some(i) = idx {
            let node = &mut self.nodes[i];
            if node.value <= value {
                break;
            }
            node.value = value;
            idx = node.parent;
        }
    }

    /// Current value at `leafno` (for diagnostics and tests).
    pub fn value(&self, leafno: usize) -> u32 {
        self.nodes[leafno].value
    }

    fn ancestor_chain(&self, leafno: usize) -> Vec<usize> {
        let mut chain = Vec::with_capacity(8);
        let mut idx = Some(leafno);
        while let Some(i) = idx {
            chain.push(i);
            idx = self.nodes[i].parent;
        }
        chain
    }

    /// Emit the bits establishing whether `value(leafno) < threshold`.
    /// Per-node `low`/`known` state persists, so subsequent calls resume
    /// rather than re-signal. Returns false when the writer's budget is
    /// exhausted.
    pub fn encode(&mut self, writer: &mut BitWriter, leafno: usize, threshold: u32) -> bool {
        debug_assert!(leafno < self.num_leafs());
        let chain = self.ancestor_chain(leafno);

        let mut low = 0u32;
        for &idx in chain.iter().rev() {
            if low > self.nodes[idx].low {
                self.nodes[idx].low = low;
            } else {
                low = self.nodes[idx].low;
            }
            while low < threshold {
                if low >= self.nodes[idx].value {
                    if !self.nodes[idx].known {
                        if !writer.write_bit(1) {
                            return false;
                        }
                        self.nodes[idx].known = true;
                    }
                    break;
                }
                if !writer.write_bit(0) {
                    return false;
                }
                low += 1;
            }
            self.nodes[idx].low = low;
        }
        true
    }

    /// Mirror of [`encode`](Self::encode): consume bits until the
    /// relation of `value(leafno)` to `threshold` is established, and
    /// return whether `value(leafno) < threshold`.
    pub fn decode(
        &mut self,
        reader: &mut BitReader,
        leafno: usize,
        threshold: u32,
    ) -> Result<bool, Tier2Error> {
        debug_assert!(leafno < self.num_leafs());
        let chain = self.ancestor_chain(leafno);

        let mut low = 0u32;
        for &idx in chain.iter().rev() {
            if low > self.nodes[idx].low {
                self.nodes[idx].low = low;
            } else {
                low = self.nodes[idx].low;
            }
            while low < threshold && low < self.nodes[idx].value {
                if reader.read_bit()? == 1 {
                    self.nodes[idx].value = low;
                } else {
                    low += 1;
                }
            }
            self.nodes[idx].low = low;
        }
        Ok(self.nodes[leafno].value < threshold)
    }

    /// Resolve the exact value at `leafno` by raising the threshold until
    /// the leaf is established (zero bit-plane signaling, B.10.5).
    pub fn decode_value(
        &mut self,
        reader: &mut BitReader,
        leafno: usize,
    ) -> Result<u32, Tier2Error> {
        let mut t = 0u32;
        while !self.decode(reader, leafno, t + 1)? {
            t += 1;
        }
        Ok(t)
    }
}
