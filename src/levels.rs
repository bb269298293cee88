use crate::node::Edge;
use crate::table::{UniqueTable, BLOCK_SIZE};
use std::sync::atomic::{AtomicU64, Ordering};

/// The level <-> variable permutation.
///
/// A *variable* is the stable label handed out when a level is registered;
/// a *level* is a position in the current order. Nodes store the level they
/// currently sit at (that is what keeps the graph ordered under adjacent
/// swaps), while the two mapping arrays remember which stable variable
/// occupies which position. Registration is append-only; reordering only
/// permutes the mappings.
pub struct Levels {
    count: u32,
    /// Representative edge (`node(k, false, true)` at creation time) per
    /// stable variable.
    table: Vec<Edge>,
    level_to_variable: Vec<u32>,
    variable_to_level: Vec<u32>,
}

impl Levels {
    pub fn new() -> Levels {
        Levels {
            count: 0,
            table: Vec::new(),
            level_to_variable: Vec::new(),
            variable_to_level: Vec::new(),
        }
    }

    #[inline]
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Register a new level with its representative node. The new level
    /// takes the next position with an identity mapping.
    pub fn register(&mut self, representative: Edge) -> u32 {
        let k = self.count;
        self.table.push(representative);
        self.level_to_variable.push(k);
        self.variable_to_level.push(k);
        self.count += 1;
        k
    }

    /// The representative edge of whatever variable currently sits at
    /// `level`.
    pub fn ithlevel(&self, level: u32) -> Option<Edge> {
        if level < self.count {
            Some(self.table[self.level_to_variable[level as usize] as usize])
        } else {
            None
        }
    }

    /// Lookup beyond the registered range falls back to the identity.
    #[inline]
    pub fn level_to_variable(&self, level: u32) -> u32 {
        if level < self.count {
            self.level_to_variable[level as usize]
        } else {
            level
        }
    }

    #[inline]
    pub fn variable_to_level(&self, variable: u32) -> u32 {
        if variable < self.count {
            self.variable_to_level[variable as usize]
        } else {
            variable
        }
    }

    /// Exchange the mappings of `level` and `level + 1` after a successful
    /// swap of the two positions.
    pub fn swap_adjacent(&mut self, level: u32) {
        debug_assert!(level + 1 < self.count);
        let (a, b) = (level as usize, level as usize + 1);
        self.level_to_variable.swap(a, b);
        self.variable_to_level[self.level_to_variable[a] as usize] = level;
        self.variable_to_level[self.level_to_variable[b] as usize] = level + 1;
    }

    /// Representative edges of all registered variables, for root marking.
    pub fn representatives(&self) -> &[Edge] {
        &self.table
    }

    /// Snapshot of the number of internal nodes sitting at each level.
    /// Parallel over the table index space.
    pub fn count_level_nodes(&self, table: &UniqueTable) -> Vec<u64> {
        let counts: Vec<AtomicU64> = (0..self.count).map(|_| AtomicU64::new(0)).collect();
        self.count_level_range(table, &counts, 0, table.size());
        counts.into_iter().map(|c| c.into_inner()).collect()
    }

    fn count_level_range(
        &self,
        table: &UniqueTable,
        counts: &[AtomicU64],
        first: usize,
        count: usize,
    ) {
        if count > BLOCK_SIZE {
            let split = count / 2;
            rayon::join(
                || self.count_level_range(table, counts, first, split),
                || self.count_level_range(table, counts, first + split, count - split),
            );
            return;
        }
        let mut local = vec![0u64; counts.len()];
        let end = first + count;
        for idx in first.max(2)..end {
            if !table.is_marked(idx as u64) {
                continue;
            }
            let node = table.node(idx as u64);
            if node.is_leaf() {
                continue;
            }
            let level = node.variable() as usize;
            if level < local.len() {
                local[level] += 1;
            }
        }
        for (level, n) in local.into_iter().enumerate() {
            if n != 0 {
                counts[level].fetch_add(n, Ordering::Relaxed);
            }
        }
    }

    /// Build the sifting order: one entry per level, `-1` for levels whose
    /// node count falls below the threshold.
    pub fn mark_threshold(&self, counts: &[u64], threshold: u32) -> Vec<i64> {
        (0..self.count as usize)
            .map(|level| {
                if counts[level] < u64::from(threshold) {
                    -1
                } else {
                    level as i64
                }
            })
            .collect()
    }

    /// Gnome-sort the level list in place, descending by node count, with
    /// discarded (`-1`) entries sinking to the end.
    pub fn gnome_sort(&self, order: &mut [i64], counts: &[u64]) {
        let mut i = 1usize;
        let mut j = 2usize;
        while i < order.len() {
            let p = if order[i - 1] == -1 {
                -1
            } else {
                counts[order[i - 1] as usize] as i64
            };
            let q = if order[i] == -1 {
                -1
            } else {
                counts[order[i] as usize] as i64
            };
            if p < q {
                order.swap(i - 1, i);
                i -= 1;
                if i > 0 {
                    continue;
                }
            }
            i = j;
            j += 1;
        }
    }
}

impl Default for Levels {
    fn default() -> Self {
        Levels::new()
    }
}
