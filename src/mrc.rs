use crate::bitmap::AtomicBitmap;
use crate::index_set::NodeIdSet;
use crate::table::UniqueTable;
use crate::AlignedBox;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};

/// An array of clamped 8-bit atomic counters.
///
/// A counter that reaches `u8::MAX` is pinned there: saturation means
/// "many" and a saturated count can never participate in isolation or
/// death decisions again. Underflow is clamped to zero.
pub struct AtomicCounters {
    cells: AlignedBox<AtomicU8>,
}

impl AtomicCounters {
    pub fn new(len: usize) -> AtomicCounters {
        AtomicCounters {
            cells: AlignedBox::zeroed(len),
        }
    }

    #[inline]
    pub fn get(&self, idx: usize) -> u8 {
        self.cells[idx].load(Ordering::Relaxed)
    }

    pub fn set(&self, idx: usize, value: u8) {
        self.cells[idx].store(value, Ordering::Relaxed);
    }

    /// Add `delta` with saturation pinning and underflow clamping. Returns
    /// the `(previous, new)` pair actually realised.
    pub fn add(&self, idx: usize, delta: i32) -> (u8, u8) {
        let cell = &self.cells[idx];
        loop {
            let current = cell.load(Ordering::Relaxed);
            if current == u8::MAX {
                return (current, current);
            }
            let next = if delta < 0 {
                current.saturating_sub((-delta) as u8)
            } else {
                let sum = u32::from(current) + delta as u32;
                if sum >= u32::from(u8::MAX) {
                    u8::MAX
                } else {
                    sum as u8
                }
            };
            if cell
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return (current, next);
            }
        }
    }
}

/// Manual reference counters, alive only while a reordering pass runs.
///
/// They replace stop-the-world mark-sweep during swaps: phase 2 can tell
/// exactly which nodes die when an edge is rewired, without re-running
/// garbage collection. `ref_nodes` and `ext_ref` are indexed by table slot,
/// `ref_vars` and `var_nnodes` by the level a node currently sits at.
pub struct Mrc {
    ref_nodes: AtomicCounters,
    ref_vars: AtomicCounters,
    var_nnodes: AlignedBox<AtomicU32>,
    ext_ref: AtomicBitmap,
    nnodes: AtomicU64,
    isolated: AtomicI64,
}

impl Mrc {
    pub fn new(nvars: usize, capacity: usize) -> Mrc {
        Mrc {
            ref_nodes: AtomicCounters::new(capacity),
            ref_vars: AtomicCounters::new(nvars),
            var_nnodes: AlignedBox::zeroed(nvars),
            ext_ref: AtomicBitmap::new(capacity),
            nnodes: AtomicU64::new(0),
            isolated: AtomicI64::new(0),
        }
    }

    /// Number of live slots (internal nodes and leaves, the two reserved
    /// terminals excluded).
    #[inline]
    pub fn nnodes(&self) -> u64 {
        self.nnodes.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn var_nnodes(&self, var: u32) -> u64 {
        u64::from(self.var_nnodes[var as usize].load(Ordering::Relaxed))
    }

    /// Number of variables with exactly one internal reference.
    #[inline]
    pub fn isolated_count(&self) -> i64 {
        self.isolated.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_isolated(&self, var: u32) -> bool {
        self.ref_vars.get(var as usize) == 1
    }

    #[inline]
    pub fn mark_external(&self, index: u64) {
        self.ext_ref.set(index as usize);
    }

    #[inline]
    pub fn has_external(&self, index: u64) -> bool {
        self.ext_ref.get(index as usize)
    }

    #[inline]
    pub fn node_refs(&self, index: u64) -> u8 {
        self.ref_nodes.get(index as usize)
    }

    #[inline]
    pub fn is_dead(&self, index: u64) -> bool {
        self.ref_nodes.get(index as usize) == 0 && !self.has_external(index)
    }

    /// A node appeared at `var` (created by swap phase 2).
    pub fn added_node(&self, var: u32) {
        self.nnodes.fetch_add(1, Ordering::Relaxed);
        self.var_nnodes[var as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// A node at `var` was deleted.
    pub fn removed_node(&self, var: u32) {
        self.nnodes.fetch_sub(1, Ordering::Relaxed);
        self.var_nnodes[var as usize].fetch_sub(1, Ordering::Relaxed);
    }

    /// A leaf was deleted; leaves count towards the total but sit at no
    /// level.
    pub fn removed_leaf(&self) {
        self.nnodes.fetch_sub(1, Ordering::Relaxed);
    }

    /// A node was retagged between the two adjacent levels of a swap.
    pub fn moved_node(&self, from: u32, to: u32) {
        self.var_nnodes[from as usize].fetch_sub(1, Ordering::Relaxed);
        self.var_nnodes[to as usize].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_node_ref(&self, index: u64) -> (u8, u8) {
        self.ref_nodes.add(index as usize, 1)
    }

    /// Decrement an internal reference; returns true when the node just
    /// transitioned to dead (zero references, no external bit).
    pub fn dec_node_ref(&self, index: u64) -> bool {
        let (prev, new) = self.ref_nodes.add(index as usize, -1);
        prev == 1 && new == 0 && !self.has_external(index)
    }

    fn note_var_transition(&self, prev: u8, new: u8) {
        if prev == new {
            return;
        }
        if new == 1 {
            self.isolated.fetch_add(1, Ordering::Relaxed);
        } else if prev == 1 {
            self.isolated.fetch_sub(1, Ordering::Relaxed);
        }
    }

    pub fn add_var_ref(&self, var: u32, delta: i32) {
        let (prev, new) = self.ref_vars.add(var as usize, delta);
        self.note_var_transition(prev, new);
    }

    /// Move `amount` variable references from one level to the other, used
    /// when a node (and everything referencing it) changes label.
    pub fn transfer_var_refs(&self, from: u32, to: u32, amount: u8) {
        if amount == 0 || from == to {
            return;
        }
        self.add_var_ref(from, -i32::from(amount));
        self.add_var_ref(to, i32::from(amount));
    }

    /// Exact reference-count initialisation over the live-node snapshot:
    /// every internal node contributes one reference to each of its two
    /// children. Nodes and variables that end up without any reference get
    /// a floor of one so that root structures never count as dead.
    pub fn init(&self, table: &UniqueTable, ids: &NodeIdSet) {
        let mut nnodes = 0u64;
        for index in ids.iter() {
            nnodes += 1;
            let node = table.node(index);
            if node.is_leaf() {
                continue;
            }
            self.var_nnodes[node.variable() as usize].fetch_add(1, Ordering::Relaxed);
            for child in [node.high_edge(), node.low_edge()] {
                let ci = child.index();
                if ci < 2 {
                    continue;
                }
                self.ref_nodes.add(ci as usize, 1);
                let child_node = table.node(ci);
                if !child_node.is_leaf() {
                    self.ref_vars.add(child_node.variable() as usize, 1);
                }
            }
        }
        self.nnodes.store(nnodes, Ordering::Relaxed);

        for index in ids.iter() {
            if self.ref_nodes.get(index as usize) == 0 {
                self.ref_nodes.set(index as usize, 1);
            }
            let node = table.node(index);
            if !node.is_leaf() && self.ref_vars.get(node.variable() as usize) == 0 {
                self.ref_vars.set(node.variable() as usize, 1);
            }
        }

        let mut isolated = 0i64;
        for var in 0..self.var_nnodes.len() {
            if self.ref_vars.get(var) == 1 {
                isolated += 1;
            }
        }
        self.isolated.store(isolated, Ordering::Relaxed);
    }
}
