use crate::levels::Levels;
use crate::mrc::Mrc;
use crate::node::{Edge, Node};
use crate::table::{UniqueTable, BLOCK_SIZE};
use log::{debug, error, info};
use std::sync::atomic::{AtomicI32, Ordering};
use thiserror::Error;

/// Outcomes of the reordering subsystem. Phase functions record the first
/// failure they observe; the controller combines and propagates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReorderError {
    #[error("the swap was aborted and rolled back; the graph is unchanged")]
    Rollback,
    #[error("cannot clear a bucket hash in phase 0")]
    P0ClearFail,
    #[error("cannot rehash in phase 1, no marked nodes remaining")]
    P1RehashFail,
    #[error("cannot rehash in phase 1 with marked nodes remaining")]
    P1RehashFailMarked,
    #[error("cannot rehash in phase 2")]
    P2RehashFail,
    #[error("cannot create a node in phase 2, marked nodes remaining")]
    P2CreateFail,
    #[error("cannot rehash nor create nodes in phase 2")]
    P2RehashAndCreateFail,
    #[error("cannot rehash in phase 3")]
    P3RehashFail,
    #[error("cannot clear in phase 3")]
    P3ClearFail,
    #[error("there are no registered variables")]
    NoRegisteredVars,
    #[error("reordering is not initialised")]
    NotInitialised,
    #[error("reordering is already running")]
    AlreadyRunning,
    #[error("not enough memory")]
    NotEnoughMemory,
}

impl ReorderError {
    /// True for failures that a garbage collection plus one retry of the
    /// sifting pass is expected to cure.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ReorderError::Rollback | ReorderError::P2CreateFail | ReorderError::P3ClearFail
        )
    }

    fn code(self) -> i32 {
        match self {
            ReorderError::Rollback => 1,
            ReorderError::P0ClearFail => 2,
            ReorderError::P1RehashFail => 3,
            ReorderError::P1RehashFailMarked => 4,
            ReorderError::P2RehashFail => 5,
            ReorderError::P2CreateFail => 6,
            ReorderError::P2RehashAndCreateFail => 7,
            ReorderError::P3RehashFail => 8,
            ReorderError::P3ClearFail => 9,
            ReorderError::NoRegisteredVars => 10,
            ReorderError::NotInitialised => 11,
            ReorderError::AlreadyRunning => 12,
            ReorderError::NotEnoughMemory => 13,
        }
    }

    fn from_code(code: i32) -> Option<ReorderError> {
        Some(match code {
            1 => ReorderError::Rollback,
            2 => ReorderError::P0ClearFail,
            3 => ReorderError::P1RehashFail,
            4 => ReorderError::P1RehashFailMarked,
            5 => ReorderError::P2RehashFail,
            6 => ReorderError::P2CreateFail,
            7 => ReorderError::P2RehashAndCreateFail,
            8 => ReorderError::P3RehashFail,
            9 => ReorderError::P3ClearFail,
            10 => ReorderError::NoRegisteredVars,
            11 => ReorderError::NotInitialised,
            12 => ReorderError::AlreadyRunning,
            13 => ReorderError::NotEnoughMemory,
            _ => return None,
        })
    }
}

/// First-error cell shared by the workers of one phase.
struct PhaseResult(AtomicI32);

impl PhaseResult {
    fn new() -> PhaseResult {
        PhaseResult(AtomicI32::new(0))
    }

    fn set(&self, error: ReorderError) {
        let _ = self
            .0
            .compare_exchange(0, error.code(), Ordering::Relaxed, Ordering::Relaxed);
    }

    #[inline]
    fn is_ok(&self) -> bool {
        self.0.load(Ordering::Relaxed) == 0
    }

    fn get(&self) -> Option<ReorderError> {
        ReorderError::from_code(self.0.load(Ordering::Relaxed))
    }
}

pub(crate) struct SwapContext<'a> {
    pub table: &'a UniqueTable,
    pub mrc: Option<&'a Mrc>,
}

/// Exchange the two adjacent levels `level` and `level + 1` in place.
///
/// Phase 0 unhashes every node at either level, phase 1 resolves the
/// trivial rewrites and marks the rest, phase 2 exchanges the marked nodes
/// by creating the swapped cofactor pair. All three phases are parallel
/// over the index space; the swap as a whole is stop-the-world.
///
/// On a phase 2 failure the phases are run once more: applying the same
/// adjacent swap a second time restores the original graph (nodes that were
/// never exchanged come back through the leftover-mark path in phase 1),
/// after which `Rollback` is reported.
pub(crate) fn var_swap(
    table: &UniqueTable,
    mrc: Option<&Mrc>,
    levels: &mut Levels,
    level: u32,
) -> Result<(), ReorderError> {
    if levels.count() == 0 {
        return Err(ReorderError::NoRegisteredVars);
    }
    if level + 1 >= levels.count() {
        return Err(ReorderError::NoRegisteredVars);
    }
    let (x, y) = (level, level + 1);
    let ctx = SwapContext { table, mrc };
    let size = table.size();

    swap_p0(&ctx, x, y, 0, size);
    let marked = swap_p1(&ctx, x, y, 0, size);
    if marked > 0 {
        let result = PhaseResult::new();
        swap_p2(&ctx, x, y, 0, size, &result);
        if let Some(failure) = result.get() {
            info!("swap of levels {x} and {y} failed ({failure}), recovering");
            swap_p0(&ctx, x, y, 0, size);
            let remarked = swap_p1(&ctx, x, y, 0, size);
            if remarked > 0 {
                let recovery = PhaseResult::new();
                swap_p2(&ctx, x, y, 0, size, &recovery);
                if recovery.get().is_some() {
                    error!("recovery swap failed at levels {x} and {y}");
                    return Err(ReorderError::P2RehashAndCreateFail);
                }
            }
            info!("recovery of levels {x} and {y} complete");
            return Err(ReorderError::Rollback);
        }
    }
    levels.swap_adjacent(level);
    Ok(())
}

/// Phase 0: unhash every live internal node sitting at `x` or `y`. Node
/// data stays intact, only the chain linkage goes.
fn swap_p0(ctx: &SwapContext, x: u32, y: u32, first: usize, count: usize) {
    if count > BLOCK_SIZE {
        let split = count / 2;
        rayon::join(
            || swap_p0(ctx, x, y, first, split),
            || swap_p0(ctx, x, y, first + split, count - split),
        );
        return;
    }
    let end = first + count;
    for idx in first.max(2)..end {
        let idx = idx as u64;
        if !ctx.table.is_marked(idx) {
            continue;
        }
        let node = ctx.table.node(idx);
        if node.is_leaf() {
            continue;
        }
        let var = node.variable();
        if (var == x || var == y) && !ctx.table.clear_bucket_hash(idx) {
            debug!("phase 0: node {idx} at level {var} was not hashed");
        }
    }
}

fn retagged(node: Node, var: u32) -> Node {
    if node.is_map_node() {
        Node::map(var, node.low_edge(), node.high_edge())
    } else {
        Node::inner(var, node.low_edge(), node.high_edge())
    }
}

/// Retag a node between the two swap levels and put it back into its
/// chain, moving its per-level bookkeeping along.
fn retag_and_rehash(ctx: &SwapContext, idx: u64, node: Node, from: u32, to: u32) {
    ctx.table.store_node(idx, retagged(node, to));
    ctx.table.rehash_bucket(idx);
    if let Some(mrc) = ctx.mrc {
        mrc.moved_node(from, to);
        mrc.transfer_var_refs(from, to, mrc.node_refs(idx));
    }
}

/// Phase 1: handle every trivial case, mark the rest.
///
/// Nodes at `y` move to `x`. Nodes at `x` that do not depend on either swap
/// level move to `y`. Nodes at `x` with a child at `x` or `y` are marked
/// for phase 2 and stay unhashed. A node still carrying a mark means a
/// failed phase 2 is being rolled back: the mark is dropped and the node
/// rehashed unchanged.
///
/// Map-chain nodes follow the chain successor instead of the cofactors:
/// the node is retagged to `y` when the successor sits strictly below
/// `y`, and marked otherwise.
///
/// Classification reads child labels while other workers retag them, which
/// is safe: retagging only moves labels within `{x, y}` and the decisions
/// below depend on membership in that set, not on which of the two.
fn swap_p1(ctx: &SwapContext, x: u32, y: u32, first: usize, count: usize) -> u64 {
    if count > BLOCK_SIZE {
        let split = count / 2;
        let (a, b) = rayon::join(
            || swap_p1(ctx, x, y, first, split),
            || swap_p1(ctx, x, y, first + split, count - split),
        );
        return a + b;
    }
    let mut marked = 0u64;
    let end = first + count;
    for idx in first.max(2)..end {
        let idx = idx as u64;
        if !ctx.table.is_marked(idx) {
            continue;
        }
        let node = ctx.table.node(idx);
        if node.is_leaf() {
            continue;
        }
        let var = node.variable();
        if var == y {
            retag_and_rehash(ctx, idx, node, y, x);
            continue;
        } else if var != x {
            continue;
        }

        if node.has_mark() {
            // leftover from a failed phase 2: restore the node as it was
            ctx.table.clear_mark_bit(idx);
            ctx.table.rehash_bucket(idx);
            continue;
        }

        if node.is_map_node() {
            let next = node.low_edge();
            if next.is_terminal() {
                retag_and_rehash(ctx, idx, node, x, y);
            } else if ctx.table.node(next.index()).variable() > y {
                retag_and_rehash(ctx, idx, node, x, y);
            } else {
                ctx.table.set_mark_bit(idx);
                marked += 1;
            }
        } else {
            let mut exchange = child_at_swap_level(ctx, node.low_edge(), x, y);
            if !exchange {
                exchange = child_at_swap_level(ctx, node.high_edge(), x, y);
            }
            if exchange {
                ctx.table.set_mark_bit(idx);
                marked += 1;
            } else {
                retag_and_rehash(ctx, idx, node, x, y);
            }
        }
    }
    marked
}

#[inline]
fn child_at_swap_level(ctx: &SwapContext, child: Edge, x: u32, y: u32) -> bool {
    if child.index() < 2 {
        return false;
    }
    let node = ctx.table.node(child.index());
    if node.is_leaf() {
        return false;
    }
    let var = node.variable();
    var == x || var == y
}

/// Phase 2: exchange every marked node in place.
///
/// For a marked `n = (x, f0, f1)` the four grand-cofactors are gathered
/// (children that were at `y` are labeled `x` by now) and two nodes
/// `g0 = (y, f00, f10)`, `g1 = (y, f01, f11)` are created; `n` then becomes
/// `(x, g0, g1)` and is rehashed. New references are counted before old
/// ones are released, so a shared node can never be observed dead while a
/// worker still intends to link it.
fn swap_p2(ctx: &SwapContext, x: u32, y: u32, first: usize, count: usize, result: &PhaseResult) {
    if count > BLOCK_SIZE {
        let split = count / 2;
        rayon::join(
            || swap_p2(ctx, x, y, first, split, result),
            || swap_p2(ctx, x, y, first + split, count - split, result),
        );
        return;
    }
    let end = first + count;
    for idx in first.max(2)..end {
        if !result.is_ok() {
            return;
        }
        let idx = idx as u64;
        if !ctx.table.is_marked(idx) {
            continue;
        }
        let node = ctx.table.node(idx);
        if node.is_leaf() || !node.has_mark() {
            continue;
        }

        if node.is_map_node() {
            // swap places with the chain successor
            let next = node.low_edge();
            let value = node.high_edge();
            let succ = ctx.table.node(next.index());
            let succ_next = succ.low_edge();
            let succ_value = succ.high_edge();
            let new_next = make_map_node(ctx, y, succ_next, value);
            if new_next.is_invalid() {
                error!("phase 2: map node creation failed at slot {idx}");
                result.set(ReorderError::P2CreateFail);
                return;
            }
            ctx.table.store_node(idx, Node::map(x, new_next, succ_value));
            ctx.table.rehash_bucket(idx);
            if ctx.mrc.is_some() {
                inc_ref(ctx, new_next);
                inc_ref(ctx, succ_value);
                dec_ref_recursive(ctx, next);
                dec_ref_recursive(ctx, value);
            }
        } else {
            let f0 = node.low_edge();
            let f1 = node.high_edge();
            let (mut f00, mut f01) = (f0, f0);
            if f0.index() >= 2 {
                let n0 = ctx.table.node(f0.index());
                if !n0.is_leaf() && n0.variable() == x {
                    f00 = f0.transfer_complement(n0.low_edge());
                    f01 = f0.transfer_complement(n0.high_edge());
                }
            }
            let (mut f10, mut f11) = (f1, f1);
            if f1.index() >= 2 {
                let n1 = ctx.table.node(f1.index());
                if !n1.is_leaf() && n1.variable() == x {
                    f10 = f1.transfer_complement(n1.low_edge());
                    f11 = f1.transfer_complement(n1.high_edge());
                }
            }

            let g0 = make_node(ctx, y, f00, f10);
            let g1 = make_node(ctx, y, f01, f11);
            if g0.is_invalid() || g1.is_invalid() {
                error!("phase 2: node creation failed at slot {idx}");
                result.set(ReorderError::P2CreateFail);
                return;
            }
            ctx.table.store_node(idx, Node::inner(x, g0, g1));
            ctx.table.rehash_bucket(idx);
            if ctx.mrc.is_some() {
                inc_ref(ctx, g0);
                inc_ref(ctx, g1);
                dec_ref_recursive(ctx, f0);
                dec_ref_recursive(ctx, f1);
            }
        }
    }
}

/// A make-node that never triggers garbage collection: the caller handles
/// `Edge::INVALID` when the table has no capacity left.
pub(crate) fn make_node(ctx: &SwapContext, var: u32, low: Edge, high: Edge) -> Edge {
    if low == high {
        return low;
    }
    let (complement, low, high) = if low.is_complemented() {
        (true, low.complemented(), high.complemented())
    } else {
        (false, low, high)
    };
    let (a, b) = Node::inner(var, low, high).words();
    let (index, created) = ctx.table.lookup_or_insert(a, b);
    if index == 0 {
        return Edge::INVALID;
    }
    if created && ctx.mrc.is_some() {
        ctx.mrc.unwrap().added_node(var);
        inc_ref(ctx, low);
        inc_ref(ctx, high);
    }
    Edge::from_parts(index, complement)
}

pub(crate) fn make_map_node(ctx: &SwapContext, var: u32, next: Edge, value: Edge) -> Edge {
    debug_assert!(!next.is_complemented());
    let (a, b) = Node::map(var, next, value).words();
    let (index, created) = ctx.table.lookup_or_insert(a, b);
    if index == 0 {
        return Edge::INVALID;
    }
    if created && ctx.mrc.is_some() {
        ctx.mrc.unwrap().added_node(var);
        inc_ref(ctx, next);
        inc_ref(ctx, value);
    }
    Edge::new(index)
}

fn inc_ref(ctx: &SwapContext, edge: Edge) {
    let index = edge.index();
    if index < 2 {
        return;
    }
    let mrc = ctx.mrc.expect("reference bookkeeping without counters");
    mrc.inc_node_ref(index);
    let node = ctx.table.node(index);
    if !node.is_leaf() {
        mrc.add_var_ref(node.variable(), 1);
    }
}

/// Release one reference; a node that drops to zero references without an
/// external bit dies on the spot: it is unhashed, its slot freed, and its
/// own references released in cascade.
fn dec_ref_recursive(ctx: &SwapContext, edge: Edge) {
    let index = edge.index();
    if index < 2 {
        return;
    }
    let mrc = ctx.mrc.expect("reference bookkeeping without counters");
    let node = ctx.table.node(index);
    if !node.is_leaf() {
        mrc.add_var_ref(node.variable(), -1);
    }
    if mrc.dec_node_ref(index) {
        ctx.table.clear_bucket_hash(index);
        ctx.table.clear_bucket_data(index);
        if node.is_leaf() {
            mrc.removed_leaf();
        } else {
            mrc.removed_node(node.variable());
            dec_ref_recursive(ctx, node.low_edge());
            dec_ref_recursive(ctx, node.high_edge());
        }
    }
}

#[cfg(test)]
mod test {
    use crate::mtbdd::{Forest, ForestConfig};
    use crate::node::Edge;
    use crate::varswap::ReorderError;

    fn forest(levels: u32) -> Forest {
        let mut forest = Forest::new(ForestConfig {
            workers: 2,
            table_size: 1 << 14,
            cache_size: 1 << 12,
            ..ForestConfig::default()
        });
        forest.new_levels(levels);
        forest
    }

    fn truth_table(forest: &Forest, edge: Edge, vars: usize) -> Vec<bool> {
        (0..(1usize << vars))
            .map(|bits| {
                let assignment: Vec<bool> = (0..vars).map(|i| bits & (1 << i) != 0).collect();
                forest.eval(edge, &assignment)
            })
            .collect()
    }

    #[test]
    pub fn swap_exchanges_two_adjacent_levels() {
        let mut forest = forest(10);
        let one = forest.ithlevel(6).unwrap();
        let two = forest.ithlevel(7).unwrap();
        assert_eq!(forest.variable_of(one), 6);
        assert_eq!(forest.variable_of(two), 7);
        assert_eq!(forest.ithvar(6), one);
        assert_eq!(forest.ithvar(7), two);

        forest.swap_adjacent(6).unwrap();

        assert_eq!(forest.variable_of(one), 7);
        assert_eq!(forest.variable_of(two), 6);
        assert_eq!(forest.level_to_variable(6), 7);
        assert_eq!(forest.level_to_variable(7), 6);
        assert_eq!(forest.variable_to_level(6), 7);
        assert_eq!(forest.variable_to_level(7), 6);
        assert_eq!(forest.ithlevel(6), Some(two));
        assert_eq!(forest.ithlevel(7), Some(one));
        // the node labeled 7 is now the one that moved down
        assert_eq!(forest.ithvar(7), one);
        assert_eq!(forest.ithvar(6), two);
    }

    #[test]
    pub fn swap_matches_a_label_exchange_by_composition() {
        let mut forest = forest(10);
        let v3 = forest.ithlevel(3).unwrap();
        let v6 = forest.ithlevel(6).unwrap();
        let v7 = forest.ithlevel(7).unwrap();
        let conj = forest.and(v6, v3.complemented());
        let one = forest.xor(conj, v7);
        forest.protect(one);

        // exchange the labels 6 and 7 through a substitution map
        let mut map = forest.map_empty();
        map = forest.map_add(map, 6, v7);
        map = forest.map_add(map, 7, v6);
        forest.protect(map);
        let two = forest.compose(one, map);
        forest.protect(two);
        assert_eq!(forest.compose(two, map), one);

        let one_before = truth_table(&forest, one, 10);
        let two_before = truth_table(&forest, two, 10);

        forest.swap_adjacent(6).unwrap();

        assert_eq!(truth_table(&forest, one, 10), one_before);
        assert_eq!(truth_table(&forest, two, 10), two_before);
    }

    #[test]
    pub fn swap_chain_rotates_the_order() {
        let mut forest = forest(4);
        forest.swap_adjacent(0).unwrap();
        forest.swap_adjacent(1).unwrap();
        forest.swap_adjacent(2).unwrap();
        assert_eq!(
            (0..4).map(|l| forest.level_to_variable(l)).collect::<Vec<_>>(),
            vec![1, 2, 3, 0]
        );
        assert_eq!(
            (0..4).map(|v| forest.variable_to_level(v)).collect::<Vec<_>>(),
            vec![3, 0, 1, 2]
        );
    }

    #[test]
    pub fn double_swap_cancels() {
        let mut forest = forest(4);
        let v0 = forest.ithlevel(0).unwrap();
        let v1 = forest.ithlevel(1).unwrap();
        let v2 = forest.ithlevel(2).unwrap();
        let conj = forest.and(v1, v2);
        let f = forest.or(v0, conj);
        forest.protect(f);
        let before = truth_table(&forest, f, 4);

        forest.swap_adjacent(1).unwrap();
        forest.swap_adjacent(1).unwrap();

        assert_eq!(
            (0..4).map(|l| forest.level_to_variable(l)).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );
        assert_eq!(truth_table(&forest, f, 4), before);
    }

    #[test]
    pub fn swaps_preserve_every_root_function() {
        let mut forest = forest(4);
        let v0 = forest.ithlevel(0).unwrap();
        let v1 = forest.ithlevel(1).unwrap();
        let v2 = forest.ithlevel(2).unwrap();
        let v3 = forest.ithlevel(3).unwrap();
        let left = forest.and(v0, v1);
        let right = forest.and(v2, v3.complemented());
        let f = forest.or(left, right);
        let g = forest.xor(v0, v2);
        forest.protect(f);
        forest.protect(g);
        let f_before = truth_table(&forest, f, 4);
        let g_before = truth_table(&forest, g, 4);

        for level in [0, 1, 2, 0, 1, 0] {
            forest.swap_adjacent(level).unwrap();
            assert_eq!(truth_table(&forest, f, 4), f_before);
            assert_eq!(truth_table(&forest, g, 4), g_before);
        }
    }

    fn splitmix(state: &mut u64) -> u64 {
        *state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut z = *state;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        z ^ (z >> 31)
    }

    /// A deterministic pseudo-random disjunction of partial terms.
    fn random_function(forest: &mut Forest, vars: u32, seed: u64, terms: usize) -> Edge {
        let mut state = seed;
        let mut f = Edge::FALSE;
        for _ in 0..terms {
            let mut term = Edge::TRUE;
            for v in 0..vars {
                let literal = forest.ithlevel(v).unwrap();
                match splitmix(&mut state) % 3 {
                    0 => {}
                    1 => term = forest.and(term, literal),
                    _ => term = forest.and(term, literal.complemented()),
                }
            }
            f = forest.or(f, term);
        }
        f
    }

    #[test]
    pub fn random_swap_walk_preserves_semantics() {
        let mut forest = forest(8);
        let f = random_function(&mut forest, 8, 0x5eed, 6);
        let g = random_function(&mut forest, 8, 0x1234, 5);
        forest.protect(f);
        forest.protect(g);
        let f_before = truth_table(&forest, f, 8);
        let g_before = truth_table(&forest, g, 8);

        let mut state = 0xfeed_face_u64;
        for _ in 0..30 {
            let level = (splitmix(&mut state) % 7) as u32;
            forest.swap_adjacent(level).unwrap();
            for l in 0..8 {
                assert_eq!(forest.variable_to_level(forest.level_to_variable(l)), l);
            }
        }
        assert_eq!(truth_table(&forest, f, 8), f_before);
        assert_eq!(truth_table(&forest, g, 8), g_before);
    }

    #[test]
    pub fn leaf_children_are_a_trivial_case() {
        let mut forest = forest(3);
        let rep = forest.ithlevel(1).unwrap();
        let before = forest.live_nodes();
        forest.swap_adjacent(1).unwrap();
        // both children of the representative are terminal, so the node is
        // just retagged; nothing is created
        assert_eq!(forest.variable_of(rep), 2);
        assert_eq!(forest.live_nodes(), before);
    }

    #[test]
    pub fn map_chain_swaps_with_its_successor() {
        let mut forest = forest(8);
        let a = forest.ithlevel(5).unwrap();
        let b = forest.ithlevel(6).unwrap();
        let mut map = forest.map_empty();
        map = forest.map_add(map, 2, a);
        map = forest.map_add(map, 3, b);
        forest.protect(map);

        forest.swap_adjacent(2).unwrap();

        let head = forest.node(map);
        assert!(head.is_map_node());
        assert_eq!(head.variable(), 2);
        assert_eq!(head.high_edge(), b);
        let next = forest.node(head.low_edge());
        assert_eq!(next.variable(), 3);
        assert_eq!(next.high_edge(), a);
        assert!(next.low_edge().is_terminal());
    }

    #[test]
    pub fn map_chain_with_distant_successor_is_trivial() {
        let mut forest = forest(8);
        let a = forest.ithlevel(6).unwrap();
        let mut map = forest.map_empty();
        map = forest.map_add(map, 2, a);
        map = forest.map_add(map, 5, a);
        forest.protect(map);
        let before = forest.live_nodes();

        // the successor of the binding at 2 sits at 5, far below the swap
        forest.swap_adjacent(2).unwrap();

        let head = forest.node(map);
        assert_eq!(head.variable(), 3);
        assert_eq!(forest.node(head.low_edge()).variable(), 5);
        assert_eq!(forest.live_nodes(), before);
    }

    #[test]
    pub fn full_table_rolls_the_swap_back() {
        let mut forest = Forest::new(ForestConfig {
            workers: 1,
            table_size: 512,
            max_table_size: 512,
            cache_size: 1 << 10,
            ..ForestConfig::default()
        });
        forest.new_levels(3);
        let v0 = forest.ithlevel(0).unwrap();
        let v1 = forest.ithlevel(1).unwrap();
        let v2 = forest.ithlevel(2).unwrap();
        let conj = forest.and(v1, v2);
        let f = forest.xor(v0, conj);
        forest.protect(f);
        let before = truth_table(&forest, f, 3);

        // leave no free slot, so the exchange in phase 2 cannot allocate
        let mut payload = 0u64;
        while forest.live_nodes() < 512 {
            forest.leaf(7, payload);
            payload += 1;
        }

        let result = forest.swap_adjacent(0);
        assert_eq!(result, Err(ReorderError::Rollback));
        // the graph is unchanged: same order, same semantics
        assert_eq!(forest.level_to_variable(0), 0);
        assert_eq!(forest.level_to_variable(1), 1);
        assert_eq!(truth_table(&forest, f, 3), before);
    }

    #[test]
    pub fn swapping_without_levels_is_an_error() {
        let mut forest = Forest::new(ForestConfig {
            workers: 1,
            table_size: 1 << 10,
            cache_size: 1 << 10,
            ..ForestConfig::default()
        });
        assert_eq!(
            forest.swap_adjacent(0),
            Err(ReorderError::NoRegisteredVars)
        );
        forest.new_levels(2);
        assert_eq!(
            forest.swap_adjacent(1),
            Err(ReorderError::NoRegisteredVars)
        );
    }
}
