//! Tag trees (B.10.2): 2-D min-trees used by the packet headers for
//! inclusion signalling and zero-bit-plane counts.
//!
//! Each node stores the minimum of its children; coding walks the
//! root-to-leaf path and emits only bits not implied by earlier queries,
//! tracked by a per-node lower bound and a resolved mark.

use crate::bit_io::{BitReader, BitWriter};
use crate::error::Result;

/// Larger than any legitimate zero-bit-plane count; an uninitialized node.
pub const TAG_TREE_UNINITIALIZED: u32 = 999;

#[derive(Debug, Clone)]
struct TagNode {
    parent: usize,
    value: u32,
    low: u32,
    known: bool,
}

const NO_PARENT: usize = usize::MAX;

#[derive(Debug, Clone)]
pub struct TagTree {
    width: u32,
    height: u32,
    nodes: Vec<TagNode>,
}

impl TagTree {
    /// Build the tree for a `width` x `height` leaf grid. Leaves come
    /// first, then each coarser level, ending with the root.
    pub fn new(width: u32, height: u32) -> Self {
        let mut nodes = Vec::new();
        let mut level_start = 0usize;
        let (mut w, mut h) = (width.max(1), height.max(1));
        loop {
            for _ in 0..(w * h) {
                nodes.push(TagNode {
                    parent: NO_PARENT,
                    value: TAG_TREE_UNINITIALIZED,
                    low: 0,
                    known: false,
                });
            }
            if w == 1 && h == 1 {
                break;
            }
            let (pw, ph) = (w.div_ceil(2), h.div_ceil(2));
            let parent_start = level_start + (w * h) as usize;
            for y in 0..h {
                for x in 0..w {
                    let idx = level_start + (y * w + x) as usize;
                    nodes[idx].parent = parent_start + ((y / 2) * pw + x / 2) as usize;
                }
            }
            level_start = parent_start;
            w = pw;
            h = ph;
        }
        Self {
            width,
            height,
            nodes,
        }
    }

    pub fn reset(&mut self) {
        for node in &mut self.nodes {
            node.value = TAG_TREE_UNINITIALIZED;
            node.low = 0;
            node.known = false;
        }
    }

    /// Set a leaf value, propagating the minimum toward the root.
    pub fn set_value(&mut self, leaf: u32, value: u32) {
        let mut idx = leaf as usize;
        loop {
            if self.nodes[idx].value <= value {
                break;
            }
            self.nodes[idx].value = value;
            if self.nodes[idx].parent == NO_PARENT {
                break;
            }
            idx = self.nodes[idx].parent;
        }
    }

    /// Current value at a leaf (the decoded minimum on the decode side).
    pub fn value(&self, leaf: u32) -> u32 {
        self.nodes[leaf as usize].value
    }

    pub fn num_leaves(&self) -> u32 {
        self.width.max(1) * self.height.max(1)
    }

    /// Root-to-leaf node path.
    fn path(&self, leaf: u32) -> Vec<usize> {
        let mut path = Vec::new();
        let mut idx = leaf as usize;
        loop {
            path.push(idx);
            if self.nodes[idx].parent == NO_PARENT {
                break;
            }
            idx = self.nodes[idx].parent;
        }
        path.reverse();
        path
    }

    /// Emit the bits answering "is the leaf value < threshold?", skipping
    /// everything earlier queries already told the decoder.
    pub fn encode(&mut self, bio: &mut BitWriter, leaf: u32, threshold: u32) {
        debug_assert!((leaf as usize) < self.nodes.len());
        let path = self.path(leaf);
        let mut low = 0u32;
        for idx in path {
            let node = &mut self.nodes[idx];
            if low > node.low {
                node.low = low;
            } else {
                low = node.low;
            }
            while low < threshold {
                if low >= node.value {
                    if !node.known {
                        bio.put_bit(1);
                        node.known = true;
                    }
                    break;
                }
                bio.put_bit(0);
                low += 1;
            }
            node.low = low;
        }
    }

    /// Mirror of `encode`: returns whether the leaf value is < threshold,
    /// refining the stored minimum along the way.
    pub fn decode(&mut self, bio: &mut BitReader<'_>, leaf: u32, threshold: u32) -> Result<bool> {
        let path = self.path(leaf);
        let mut last = 0;
        let mut low = 0u32;
        for idx in path {
            let node = &mut self.nodes[idx];
            if low > node.low {
                node.low = low;
            } else {
                low = node.low;
            }
            while low < threshold && low < node.value {
                if bio.get_bit()? == 1 {
                    node.value = low;
                } else {
                    low += 1;
                }
            }
            node.low = low;
            last = idx;
        }
        Ok(self.nodes[last].value < threshold)
    }
}
