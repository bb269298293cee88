use crate::bitmap::AtomicBitmap;
use crate::index_set::NodeIdSet;
use crate::levels::Levels;
use crate::node::Edge;
use crate::table::UniqueTable;

/// The variable interaction matrix.
///
/// Two variables interact when they appear together in the support of some
/// root. Sifting uses this to prune: swapping a variable past a level it
/// does not interact with cannot change the graph size. Only the upper
/// triangle is stored; queries sort their arguments. Indexing is by stable
/// variable, not by level, so the matrix stays valid while sifting permutes
/// the order.
pub struct InteractionMatrix {
    bits: AtomicBitmap,
    nvars: usize,
}

impl InteractionMatrix {
    pub fn new(nvars: usize) -> InteractionMatrix {
        InteractionMatrix {
            bits: AtomicBitmap::new(nvars * nvars.saturating_sub(1) / 2 + 1),
            nvars,
        }
    }

    #[inline]
    fn triangle_index(&self, x: usize, y: usize) -> usize {
        debug_assert!(x < y && y < self.nvars);
        x * (2 * self.nvars - x - 1) / 2 + (y - x - 1)
    }

    pub fn set(&self, x: u32, y: u32) {
        let (x, y) = (x.min(y) as usize, x.max(y) as usize);
        if x == y {
            return;
        }
        self.bits.set(self.triangle_index(x, y));
    }

    pub fn test(&self, x: u32, y: u32) -> bool {
        let (x, y) = (x.min(y) as usize, x.max(y) as usize);
        if x == y {
            return false;
        }
        self.bits.get(self.triangle_index(x, y))
    }

    /// Fold one root's support set into the matrix, consuming the support
    /// bitmap in the process.
    fn update_from_support(&self, support: &AtomicBitmap) {
        for i in 0..self.nvars.saturating_sub(1) {
            if support.get(i) {
                support.clear(i);
                for j in (i + 1)..self.nvars {
                    if support.get(j) {
                        self.set(i as u32, j as u32);
                    }
                }
            }
        }
        if self.nvars > 0 {
            support.clear(self.nvars - 1);
        }
    }

    /// Populate the matrix from the live-node snapshot.
    ///
    /// A node that was never reached while traversing earlier candidates is
    /// a root; each root contributes its support set. The local-visited
    /// bitmap deduplicates work inside one tree and is wiped between roots,
    /// the global one identifies roots across trees.
    pub fn init(&self, table: &UniqueTable, levels: &Levels, ids: &NodeIdSet) {
        let capacity = table.size();
        let support = AtomicBitmap::new(self.nvars);
        let global = AtomicBitmap::new(capacity);
        let local = AtomicBitmap::new(capacity);

        for index in ids.iter() {
            let node = table.node(index);
            if node.is_leaf() {
                continue;
            }
            if global.get(index as usize) {
                // reachable from an earlier candidate, not a root
                continue;
            }
            let (f1, f0) = (node.high_edge(), node.low_edge());
            rayon::join(
                || find_support(table, levels, f1, &support, &global, &local),
                || find_support(table, levels, f0, &support, &global, &local),
            );
            support.set(levels.level_to_variable(node.variable()) as usize);
            local.clear_all();
            self.update_from_support(&support);
        }
    }
}

/// Accumulate into `support` the stable variables the function reachable
/// through `f` depends on, marking every visited node in both scratch
/// bitmaps.
fn find_support(
    table: &UniqueTable,
    levels: &Levels,
    f: Edge,
    support: &AtomicBitmap,
    global: &AtomicBitmap,
    local: &AtomicBitmap,
) {
    let index = f.index();
    if index < 2 {
        return;
    }
    if local.get(index as usize) {
        return;
    }
    let node = table.node(index);
    if !node.is_leaf() {
        support.set(levels.level_to_variable(node.variable()) as usize);
        let (f1, f0) = (node.high_edge(), node.low_edge());
        rayon::join(
            || find_support(table, levels, f1, support, global, local),
            || find_support(table, levels, f0, support, global, local),
        );
    }
    local.set(index as usize);
    global.set(index as usize);
}

#[cfg(test)]
mod test {
    use super::InteractionMatrix;
    use crate::index_set::NodeIdSet;
    use crate::levels::Levels;
    use crate::node::{Edge, Node};
    use crate::table::UniqueTable;

    #[test]
    pub fn triangle_is_symmetric_and_irreflexive() {
        let m = InteractionMatrix::new(8);
        m.set(6, 2);
        assert!(m.test(2, 6));
        assert!(m.test(6, 2));
        assert!(!m.test(2, 5));
        assert!(!m.test(3, 3));
    }

    #[test]
    pub fn all_pairs_addressable() {
        let n = 17;
        let m = InteractionMatrix::new(n);
        for x in 0..n as u32 {
            for y in (x + 1)..n as u32 {
                assert!(!m.test(x, y));
                m.set(x, y);
            }
        }
        for x in 0..n as u32 {
            for y in (x + 1)..n as u32 {
                assert!(m.test(x, y));
            }
        }
    }

    #[test]
    pub fn roots_contribute_their_supports() {
        let table = UniqueTable::new(1 << 10, 1 << 10, 1);
        let mut levels = Levels::new();
        let mut insert = |node: Node| {
            let (a, b) = node.words();
            let (idx, _) = table.lookup_or_insert(a, b);
            Edge::new(idx)
        };
        // two disjoint chains: one over levels {0, 1}, one over {2, 3}
        let t = Edge::TRUE;
        let n1 = insert(Node::inner(1, t, t.complemented()));
        let n0 = insert(Node::inner(0, n1, t));
        let n3 = insert(Node::inner(3, t, t.complemented()));
        let n2 = insert(Node::inner(2, n3, t));
        let _ = (n0, n2);
        for i in 2..6 {
            levels.register(Edge::new(i));
        }

        let mut ids = NodeIdSet::new();
        ids.refill(&table);
        let m = InteractionMatrix::new(4);
        m.init(&table, &levels, &ids);

        assert!(m.test(0, 1));
        assert!(m.test(2, 3));
        assert!(!m.test(0, 2));
        assert!(!m.test(0, 3));
        assert!(!m.test(1, 2));
        assert!(!m.test(1, 3));
    }
}
