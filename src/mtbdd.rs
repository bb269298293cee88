use crate::cache::{op, OpCache};
use crate::levels::Levels;
use crate::node::{Edge, Node};
use crate::reorder::{ReorderState, ReorderType};
use crate::table::{CustomLeafOps, UniqueTable};
use crate::varswap::{self, ReorderError, SwapContext};
use fxhash::FxHashMap;
use fxhash::FxHashSet;
use log::info;
use parking_lot::Mutex;

/// Process-wide configuration of a forest.
#[derive(Clone)]
pub struct ForestConfig {
    /// Worker threads for the internal pool; 0 picks the available
    /// parallelism.
    pub workers: usize,
    /// Initial unique table capacity in slots; must be a power of two.
    pub table_size: usize,
    /// Upper bound the table may grow to during collections; a power of
    /// two, at least `table_size`.
    pub max_table_size: usize,
    /// Operation cache capacity in entries.
    pub cache_size: usize,
    /// Reordering algorithm dispatched by `reduce_heap`.
    pub reorder_type: ReorderType,
}

impl Default for ForestConfig {
    fn default() -> ForestConfig {
        ForestConfig {
            workers: 0,
            table_size: 1 << 20,
            max_table_size: 1 << 22,
            cache_size: 1 << 18,
            reorder_type: ReorderType::BoundedSift,
        }
    }
}

/// Returned by the internal apply steps when the table has no capacity
/// left; the public operations collect garbage and retry.
pub(crate) struct TableFull;

#[derive(Default)]
pub(crate) struct RootSet {
    pub(crate) next_handle: u64,
    pub(crate) edges: FxHashMap<u64, Edge>,
}

/// The forest owns the unique table, the operation cache, the level
/// registry, the reordering state and the worker pool.
///
/// Concurrency contract: operations that mutate the graph structure in
/// bulk (garbage collection, swaps, sifting) take `&mut self` and are
/// therefore stop-the-world by construction; node creation and the apply
/// algorithms only need `&self` internally and go through the lock-free
/// table.
pub struct Forest {
    pub(crate) table: UniqueTable,
    pub(crate) cache: OpCache,
    pub(crate) levels: Levels,
    pub(crate) reorder: ReorderState,
    pub(crate) roots: Mutex<RootSet>,
    pub(crate) pool: rayon::ThreadPool,
}

impl Forest {
    pub fn new(config: ForestConfig) -> Forest {
        let workers = if config.workers == 0 {
            std::thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(1)
        } else {
            config.workers
        };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .expect("failed to build the worker pool");
        Forest {
            table: UniqueTable::new(
                config.table_size,
                config.max_table_size.max(config.table_size),
                workers,
            ),
            cache: OpCache::new(config.cache_size),
            levels: Levels::new(),
            reorder: ReorderState::new(config.reorder_type),
            roots: Mutex::new(RootSet::default()),
            pool,
        }
    }

    /// Number of worker threads in the internal pool.
    pub fn workers(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Register custom leaf callbacks (hash, equality, create, destroy).
    pub fn set_custom_leaf_ops(&mut self, ops: CustomLeafOps) {
        self.table.set_custom_ops(ops);
    }

    /// Append one level; its representative is `node(k, false, true)` for
    /// the fresh variable `k`.
    pub fn new_level(&mut self) -> Edge {
        let var = self.levels.count();
        let edge = self.make_node_or_gc(var, Edge::FALSE, Edge::TRUE);
        self.levels.register(edge);
        edge
    }

    pub fn new_levels(&mut self, amount: u32) {
        for _ in 0..amount {
            self.new_level();
        }
    }

    pub fn level_count(&self) -> u32 {
        self.levels.count()
    }

    /// Representative of the variable currently sitting at `level`.
    pub fn ithlevel(&self, level: u32) -> Option<Edge> {
        self.levels.ithlevel(level)
    }

    /// The projection function of the node labeled `var`, i.e. of the
    /// variable currently sitting at that position of the order.
    pub fn ithvar(&mut self, var: u32) -> Edge {
        self.make_node_or_gc(var, Edge::FALSE, Edge::TRUE)
    }

    /// Per-level node counts of the live graph.
    pub fn level_node_counts(&self) -> Vec<u64> {
        self.pool
            .install(|| self.levels.count_level_nodes(&self.table))
    }

    pub fn level_to_variable(&self, level: u32) -> u32 {
        self.levels.level_to_variable(level)
    }

    pub fn variable_to_level(&self, variable: u32) -> u32 {
        self.levels.variable_to_level(variable)
    }

    /// The level label stored in the node behind `edge`.
    pub fn variable_of(&self, edge: Edge) -> u32 {
        self.table.node(edge.index()).variable()
    }

    pub fn node(&self, edge: Edge) -> Node {
        self.table.node(edge.index())
    }

    /// `(occupied slots, capacity)` of the unique table.
    pub fn table_usage(&self) -> (u64, u64) {
        self.pool.install(|| self.table.usage())
    }

    /// Current number of live nodes (including the reserved terminals).
    pub fn live_nodes(&self) -> u64 {
        self.pool.install(|| self.table.count_marked())
    }

    /// Register an external reference; the node set reachable from it
    /// survives garbage collection and is treated as a root by reordering.
    pub fn protect(&self, edge: Edge) -> u64 {
        let mut roots = self.roots.lock();
        let handle = roots.next_handle;
        roots.next_handle += 1;
        roots.edges.insert(handle, edge);
        handle
    }

    pub fn unprotect(&self, handle: u64) {
        self.roots.lock().edges.remove(&handle);
    }

    pub(crate) fn protected_roots(&self) -> Vec<Edge> {
        self.roots.lock().edges.values().copied().collect()
    }

    fn swap_context(&self) -> SwapContext<'_> {
        SwapContext {
            table: &self.table,
            mrc: self.reorder.mrc.as_ref(),
        }
    }

    /// Create (or find) an internal node, collecting garbage once when the
    /// table is full. Running out of space again afterwards is fatal by
    /// policy.
    pub(crate) fn make_node_or_gc(&mut self, var: u32, low: Edge, high: Edge) -> Edge {
        let edge = varswap::make_node(&self.swap_context(), var, low, high);
        if !edge.is_invalid() {
            return edge;
        }
        self.gc();
        let edge = varswap::make_node(&self.swap_context(), var, low, high);
        if edge.is_invalid() {
            panic!("node table is full even after garbage collection");
        }
        edge
    }

    /// A Boolean leaf is the terminal; other leaves carry a type tag and an
    /// opaque payload and live in the table like everything else.
    pub fn leaf(&mut self, leaf_type: u32, payload: u64) -> Edge {
        let (a, b) = Node::leaf(leaf_type, payload).words();
        let (index, _) = self.table.lookup_or_insert(a, b);
        if index != 0 {
            return Edge::new(index);
        }
        self.gc();
        let (index, _) = self.table.lookup_or_insert(a, b);
        if index == 0 {
            panic!("node table is full even after garbage collection");
        }
        Edge::new(index)
    }

    /// A leaf whose payload is managed through the registered custom
    /// callbacks (hashing, equality, creation and destruction).
    pub fn custom_leaf(&mut self, leaf_type: u32, payload: u64) -> Edge {
        let (a, b) = Node::leaf(leaf_type, payload).words();
        let (index, _) = self.table.lookup_or_insert_custom(a, b);
        if index != 0 {
            return Edge::new(index);
        }
        self.gc();
        let (index, _) = self.table.lookup_or_insert_custom(a, b);
        if index == 0 {
            panic!("node table is full even after garbage collection");
        }
        Edge::new(index)
    }

    /// The empty variable-to-value map: just the chain terminator.
    pub fn map_empty(&self) -> Edge {
        Edge::TRUE
    }

    /// Insert (or replace) the binding `var -> value`, keeping the chain
    /// sorted by variable.
    pub fn map_add(&mut self, map: Edge, var: u32, value: Edge) -> Edge {
        if map.is_terminal() {
            return self.make_map_or_gc(var, map, value);
        }
        let node = self.table.node(map.index());
        let mvar = node.variable();
        if mvar > var {
            self.make_map_or_gc(var, map, value)
        } else if mvar == var {
            let next = node.low_edge();
            self.make_map_or_gc(var, next, value)
        } else {
            let sub = self.map_add(node.low_edge(), var, value);
            self.make_map_or_gc(mvar, sub, node.high_edge())
        }
    }

    fn make_map_or_gc(&mut self, var: u32, next: Edge, value: Edge) -> Edge {
        let edge = varswap::make_map_node(&self.swap_context(), var, next, value);
        if !edge.is_invalid() {
            return edge;
        }
        self.gc();
        let edge = varswap::make_map_node(&self.swap_context(), var, next, value);
        if edge.is_invalid() {
            panic!("node table is full even after garbage collection");
        }
        edge
    }

    pub fn not(&self, edge: Edge) -> Edge {
        edge.complemented()
    }

    /// Conjunction. A full table triggers a collection and a retry, so the
    /// operands (like every edge the caller still needs) must be reachable
    /// from a protected root or a level representative.
    pub fn and(&mut self, a: Edge, b: Edge) -> Edge {
        if let Ok(result) = self.apply_and(a, b) {
            return result;
        }
        self.gc();
        match self.apply_and(a, b) {
            Ok(result) => result,
            Err(TableFull) => panic!("node table is full even after garbage collection"),
        }
    }

    pub fn or(&mut self, a: Edge, b: Edge) -> Edge {
        self.and(a.complemented(), b.complemented()).complemented()
    }

    pub fn xor(&mut self, a: Edge, b: Edge) -> Edge {
        if let Ok(result) = self.apply_xor(a, b) {
            return result;
        }
        self.gc();
        match self.apply_xor(a, b) {
            Ok(result) => result,
            Err(TableFull) => panic!("node table is full even after garbage collection"),
        }
    }

    fn apply_and(&self, a: Edge, b: Edge) -> Result<Edge, TableFull> {
        if a.is_false() || b.is_false() || a == b.complemented() {
            return Ok(Edge::FALSE);
        }
        if a.is_true() {
            return Ok(b);
        }
        if b.is_true() || a == b {
            return Ok(a);
        }
        // commutative, so normalise the argument order for the cache
        let (a, b) = if u64::from(a) > u64::from(b) { (b, a) } else { (a, b) };
        if let Some(result) = self.cache.get(op::AND, a, b, Edge::INVALID) {
            return Ok(Edge::from(result));
        }

        let (var, (a0, a1), (b0, b1)) = self.cofactor_pair(a, b);
        let r0 = self.apply_and(a0, b0)?;
        let r1 = self.apply_and(a1, b1)?;
        let result = self.make_node_checked(var, r0, r1)?;
        self.cache.put(op::AND, a, b, Edge::INVALID, u64::from(result));
        Ok(result)
    }

    fn apply_xor(&self, a: Edge, b: Edge) -> Result<Edge, TableFull> {
        if a.is_false() {
            return Ok(b);
        }
        if b.is_false() {
            return Ok(a);
        }
        if a.is_true() {
            return Ok(b.complemented());
        }
        if b.is_true() {
            return Ok(a.complemented());
        }
        if a == b {
            return Ok(Edge::FALSE);
        }
        if a == b.complemented() {
            return Ok(Edge::TRUE);
        }
        // xor ignores complements up to output parity
        let parity = a.is_complemented() != b.is_complemented();
        let (a, b) = (a.without_complement(), b.without_complement());
        let (a, b) = if u64::from(a) > u64::from(b) { (b, a) } else { (a, b) };

        let stripped = if let Some(result) = self.cache.get(op::XOR, a, b, Edge::INVALID) {
            Edge::from(result)
        } else {
            let (var, (a0, a1), (b0, b1)) = self.cofactor_pair(a, b);
            let r0 = self.apply_xor(a0, b0)?;
            let r1 = self.apply_xor(a1, b1)?;
            let result = self.make_node_checked(var, r0, r1)?;
            self.cache.put(op::XOR, a, b, Edge::INVALID, u64::from(result));
            result
        };
        Ok(if parity { stripped.complemented() } else { stripped })
    }

    /// If-then-else.
    pub fn ite(&mut self, f: Edge, g: Edge, h: Edge) -> Edge {
        if let Ok(result) = self.apply_ite(f, g, h) {
            return result;
        }
        self.gc();
        match self.apply_ite(f, g, h) {
            Ok(result) => result,
            Err(TableFull) => panic!("node table is full even after garbage collection"),
        }
    }

    /// Substitute every variable bound by the map chain with its value
    /// function.
    pub fn compose(&mut self, f: Edge, map: Edge) -> Edge {
        if let Ok(result) = self.apply_compose(f, map) {
            return result;
        }
        self.gc();
        match self.apply_compose(f, map) {
            Ok(result) => result,
            Err(TableFull) => panic!("node table is full even after garbage collection"),
        }
    }

    /// Existentially quantify the variables of `cube` out of `f`.
    pub fn exists(&mut self, f: Edge, cube: Edge) -> Edge {
        if let Ok(result) = self.apply_exists(f, cube) {
            return result;
        }
        self.gc();
        match self.apply_exists(f, cube) {
            Ok(result) => result,
            Err(TableFull) => panic!("node table is full even after garbage collection"),
        }
    }

    /// The conjunction of the given (positive) variable labels, for use
    /// as a quantification cube.
    pub fn cube(&mut self, vars: &[u32]) -> Edge {
        let mut sorted = vars.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        let mut result = Edge::TRUE;
        for var in sorted.into_iter().rev() {
            result = self.make_node_or_gc(var, Edge::FALSE, result);
        }
        result
    }

    fn apply_ite(&self, f: Edge, g: Edge, h: Edge) -> Result<Edge, TableFull> {
        if f.is_true() {
            return Ok(g);
        }
        if f.is_false() {
            return Ok(h);
        }
        if g == h {
            return Ok(g);
        }
        if g.is_true() && h.is_false() {
            return Ok(f);
        }
        if g.is_false() && h.is_true() {
            return Ok(f.complemented());
        }
        // normalise: the condition and the then-branch are positive
        if f.is_complemented() {
            return self.apply_ite(f.complemented(), h, g);
        }
        if g.is_complemented() {
            return Ok(self
                .apply_ite(f, g.complemented(), h.complemented())?
                .complemented());
        }
        if let Some(result) = self.cache.get(op::ITE, f, g, h) {
            return Ok(Edge::from(result));
        }

        let mut var = u32::MAX;
        for e in [f, g, h] {
            if !e.is_terminal() {
                var = var.min(self.table.node(e.index()).variable());
            }
        }
        let (f0, f1) = self.cofactors(f, var);
        let (g0, g1) = self.cofactors(g, var);
        let (h0, h1) = self.cofactors(h, var);
        let r0 = self.apply_ite(f0, g0, h0)?;
        let r1 = self.apply_ite(f1, g1, h1)?;
        let result = self.make_node_checked(var, r0, r1)?;
        self.cache.put(op::ITE, f, g, h, u64::from(result));
        Ok(result)
    }

    fn apply_compose(&self, f: Edge, map: Edge) -> Result<Edge, TableFull> {
        if f.is_terminal() || map.is_terminal() {
            return Ok(f);
        }
        let node = self.table.node(f.index());
        let var = node.variable();
        // bindings above the top variable of f cannot apply any more
        let mut map = map;
        while !map.is_terminal() && self.table.node(map.index()).variable() < var {
            map = self.table.node(map.index()).low_edge();
        }
        if map.is_terminal() {
            return Ok(f);
        }
        if let Some(result) = self.cache.get(op::COMPOSE, f, map, Edge::INVALID) {
            return Ok(Edge::from(result));
        }

        let f0 = f.transfer_complement(node.low_edge());
        let f1 = f.transfer_complement(node.high_edge());
        let r0 = self.apply_compose(f0, map)?;
        let r1 = self.apply_compose(f1, map)?;
        let map_node = self.table.node(map.index());
        let branch = if map_node.variable() == var {
            map_node.high_edge()
        } else {
            // unbound: branch on the variable itself (the substituted
            // cofactors may reach above `var`, so a plain make-node is not
            // enough)
            self.make_node_checked(var, Edge::FALSE, Edge::TRUE)?
        };
        let result = self.apply_ite(branch, r1, r0)?;
        self.cache.put(op::COMPOSE, f, map, Edge::INVALID, u64::from(result));
        Ok(result)
    }

    fn apply_exists(&self, f: Edge, cube: Edge) -> Result<Edge, TableFull> {
        if f.is_terminal() || cube.is_terminal() {
            return Ok(f);
        }
        let node = self.table.node(f.index());
        let var = node.variable();
        // skip quantified variables that can no longer occur in f
        let mut cube = cube;
        while !cube.is_terminal() {
            let cube_node = self.table.node(cube.index());
            if cube_node.variable() >= var {
                break;
            }
            cube = cube.transfer_complement(cube_node.high_edge());
        }
        if cube.is_terminal() {
            return Ok(f);
        }
        if let Some(result) = self.cache.get(op::EXISTS, f, cube, Edge::INVALID) {
            return Ok(Edge::from(result));
        }

        let f0 = f.transfer_complement(node.low_edge());
        let f1 = f.transfer_complement(node.high_edge());
        let cube_node = self.table.node(cube.index());
        let result = if cube_node.variable() == var {
            let rest = cube.transfer_complement(cube_node.high_edge());
            let r0 = self.apply_exists(f0, rest)?;
            let r1 = self.apply_exists(f1, rest)?;
            // disjunction of the two cofactors
            self.apply_and(r0.complemented(), r1.complemented())?
                .complemented()
        } else {
            let r0 = self.apply_exists(f0, cube)?;
            let r1 = self.apply_exists(f1, cube)?;
            self.make_node_checked(var, r0, r1)?
        };
        self.cache.put(op::EXISTS, f, cube, Edge::INVALID, u64::from(result));
        Ok(result)
    }

    /// Top level of the two operands and their cofactors with respect to
    /// it.
    fn cofactor_pair(&self, a: Edge, b: Edge) -> (u32, (Edge, Edge), (Edge, Edge)) {
        let va = self.table.node(a.index()).variable();
        let vb = self.table.node(b.index()).variable();
        let var = va.min(vb);
        (var, self.cofactors(a, var), self.cofactors(b, var))
    }

    fn cofactors(&self, e: Edge, var: u32) -> (Edge, Edge) {
        if e.is_terminal() {
            return (e, e);
        }
        let node = self.table.node(e.index());
        if node.is_leaf() || node.variable() != var {
            (e, e)
        } else {
            (
                e.transfer_complement(node.low_edge()),
                e.transfer_complement(node.high_edge()),
            )
        }
    }

    fn make_node_checked(&self, var: u32, low: Edge, high: Edge) -> Result<Edge, TableFull> {
        let edge = varswap::make_node(
            &SwapContext {
                table: &self.table,
                mrc: None,
            },
            var,
            low,
            high,
        );
        if edge.is_invalid() {
            Err(TableFull)
        } else {
            Ok(edge)
        }
    }

    /// Evaluate the Boolean function under an assignment indexed by stable
    /// variable.
    pub fn eval(&self, edge: Edge, assignment: &[bool]) -> bool {
        let mut e = edge;
        loop {
            if e.is_terminal() {
                return !e.is_complemented();
            }
            let node = self.table.node(e.index());
            let stable = self.levels.level_to_variable(node.variable());
            let child = if assignment[stable as usize] {
                node.high_edge()
            } else {
                node.low_edge()
            };
            e = e.transfer_complement(child);
        }
    }

    /// Number of distinct nodes reachable from `edge`, terminal included.
    pub fn node_count(&self, edge: Edge) -> usize {
        let mut seen: FxHashSet<u64> = FxHashSet::default();
        let mut stack = vec![edge.index()];
        while let Some(index) = stack.pop() {
            if index == 0 || !seen.insert(index) {
                continue;
            }
            if index == 1 {
                continue;
            }
            let node = self.table.node(index);
            if !node.is_leaf() {
                stack.push(node.low_edge().index());
                stack.push(node.high_edge().index());
            }
        }
        seen.len()
    }

    /// Stop-the-world mark-and-rehash garbage collection. Everything
    /// reachable from the level representatives and the protected roots
    /// survives in place; node indices are stable across a collection.
    /// When more than half of the (post-sweep) slots remain live, the
    /// active table size is doubled before rehashing, up to the reserved
    /// maximum.
    pub fn gc(&mut self) {
        let before = if log::log_enabled!(log::Level::Info) {
            self.live_nodes()
        } else {
            0
        };
        self.cache.clear();
        let mut marks: Vec<Edge> = self.levels.representatives().to_vec();
        marks.extend(self.protected_roots());
        {
            let table = &self.table;
            self.pool.install(|| {
                table.bulk_clear_data();
                for edge in &marks {
                    mark_recursive(table, *edge);
                }
                table.destroy_unmarked();
            });
        }
        let survivors = self.live_nodes();
        if survivors * 2 > self.table.size() as u64 && self.table.grow() {
            info!("gc: growing the table to {} slots", self.table.size());
        }
        let table = &self.table;
        self.pool.install(|| {
            table.bulk_clear_hashes();
            table.rehash_all();
        });
        if log::log_enabled!(log::Level::Info) {
            info!(
                "gc: {before} -> {survivors} nodes ({} slots)",
                self.table.size()
            );
        }
    }

    /// Swap the two adjacent levels `level` and `level + 1` as a standalone
    /// stop-the-world operation.
    pub fn swap_adjacent(&mut self, level: u32) -> Result<(), ReorderError> {
        self.cache.clear();
        let Forest {
            table,
            levels,
            reorder,
            pool,
            ..
        } = self;
        pool.install(|| varswap::var_swap(table, reorder.mrc.as_ref(), levels, level))
    }
}

/// Mark everything reachable from `edge`, forking below every freshly
/// marked node.
fn mark_recursive(table: &UniqueTable, edge: Edge) {
    let index = edge.index();
    if index < 2 {
        return;
    }
    if !table.mark(index) {
        return;
    }
    let node = table.node(index);
    if !node.is_leaf() {
        rayon::join(
            || mark_recursive(table, node.low_edge()),
            || mark_recursive(table, node.high_edge()),
        );
    }
}

#[cfg(test)]
mod test {
    use super::{Forest, ForestConfig};

    pub fn small_forest() -> Forest {
        Forest::new(ForestConfig {
            workers: 2,
            table_size: 1 << 14,
            cache_size: 1 << 12,
            ..ForestConfig::default()
        })
    }

    fn assignments(n: usize) -> impl Iterator<Item = Vec<bool>> {
        (0..(1usize << n)).map(move |bits| (0..n).map(|i| bits & (1 << i) != 0).collect())
    }

    #[test]
    pub fn apply_matches_truth_tables() {
        let mut forest = small_forest();
        forest.new_levels(3);
        let v0 = forest.ithlevel(0).unwrap();
        let v1 = forest.ithlevel(1).unwrap();
        let v2 = forest.ithlevel(2).unwrap();

        let conj = forest.and(v0, v1);
        let disj = forest.or(v0, v2);
        let parity = forest.xor(conj, disj);

        for a in assignments(3) {
            let (x0, x1, x2) = (a[0], a[1], a[2]);
            assert_eq!(forest.eval(conj, &a), x0 && x1);
            assert_eq!(forest.eval(disj, &a), x0 || x2);
            assert_eq!(forest.eval(parity, &a), (x0 && x1) != (x0 || x2));
        }
    }

    #[test]
    pub fn complement_edges_share_structure() {
        let mut forest = small_forest();
        forest.new_levels(2);
        let v0 = forest.ithlevel(0).unwrap();
        let v1 = forest.ithlevel(1).unwrap();
        let f = forest.and(v0, v1);
        let g = forest.not(f);
        assert_eq!(forest.node_count(f), forest.node_count(g));
        for a in assignments(2) {
            assert_eq!(forest.eval(g, &a), !forest.eval(f, &a));
        }
    }

    #[test]
    pub fn low_edges_are_never_complemented() {
        let mut forest = small_forest();
        forest.new_levels(4);
        let mut f = forest.ithlevel(0).unwrap();
        for i in 1..4 {
            let v = forest.ithlevel(i).unwrap().complemented();
            f = forest.xor(f, v);
        }
        let mut stack = vec![f.index()];
        let mut seen = std::collections::HashSet::new();
        while let Some(idx) = stack.pop() {
            if idx < 2 || !seen.insert(idx) {
                continue;
            }
            let node = forest.table.node(idx);
            assert!(!node.low_edge().is_complemented());
            stack.push(node.low_edge().index());
            stack.push(node.high_edge().index());
        }
    }

    #[test]
    pub fn gc_keeps_protected_and_drops_garbage() {
        let mut forest = small_forest();
        forest.new_levels(6);
        let v0 = forest.ithlevel(0).unwrap();
        let v1 = forest.ithlevel(1).unwrap();
        let keep = forest.and(v0, v1);
        let handle = forest.protect(keep);

        // transient junk that nothing protects
        for i in 2..6 {
            let a = forest.ithlevel(i - 1).unwrap();
            let b = forest.ithlevel(i).unwrap();
            let _junk = forest.xor(a, b);
        }
        let before = forest.live_nodes();
        forest.gc();
        let after = forest.live_nodes();
        assert!(after < before);

        for a in [[false, false], [false, true], [true, false], [true, true]] {
            let mut assignment = vec![false; 6];
            assignment[0] = a[0];
            assignment[1] = a[1];
            assert_eq!(forest.eval(keep, &assignment), a[0] && a[1]);
        }
        forest.unprotect(handle);
    }

    #[test]
    pub fn leaves_are_canonical() {
        let mut forest = small_forest();
        let a = forest.leaf(3, 1234);
        let b = forest.leaf(3, 1234);
        let c = forest.leaf(3, 1235);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    pub fn ite_matches_its_truth_table() {
        let mut forest = small_forest();
        forest.new_levels(3);
        let v0 = forest.ithlevel(0).unwrap();
        let v1 = forest.ithlevel(1).unwrap();
        let v2 = forest.ithlevel(2).unwrap();
        let f = forest.ite(v0, v1, v2);
        let g = forest.ite(v0.complemented(), v1, v2.complemented());
        for a in assignments(3) {
            assert_eq!(forest.eval(f, &a), if a[0] { a[1] } else { a[2] });
            assert_eq!(forest.eval(g, &a), if !a[0] { a[1] } else { !a[2] });
        }
    }

    #[test]
    pub fn compose_substitutes_bound_variables() {
        let mut forest = small_forest();
        forest.new_levels(4);
        let v0 = forest.ithlevel(0).unwrap();
        let v1 = forest.ithlevel(1).unwrap();
        let v2 = forest.ithlevel(2).unwrap();
        let v3 = forest.ithlevel(3).unwrap();
        let f = forest.xor(v0, v1);

        let replacement = forest.and(v2, v3);
        let mut map = forest.map_empty();
        map = forest.map_add(map, 0, replacement);
        let g = forest.compose(f, map);

        for a in assignments(4) {
            assert_eq!(forest.eval(g, &a), (a[2] && a[3]) != a[1]);
        }
        // an empty map is the identity substitution
        let empty = forest.map_empty();
        assert_eq!(forest.compose(f, empty), f);
    }

    #[test]
    pub fn exists_quantifies_the_cube_variables() {
        let mut forest = small_forest();
        forest.new_levels(3);
        let v0 = forest.ithlevel(0).unwrap();
        let v1 = forest.ithlevel(1).unwrap();
        let v2 = forest.ithlevel(2).unwrap();
        let conj = forest.and(v0, v1);
        let f = forest.or(conj, v2);

        let c0 = forest.cube(&[0]);
        let expected = forest.or(v1, v2);
        assert_eq!(forest.exists(f, c0), expected);

        let c01 = forest.cube(&[0, 1]);
        assert_eq!(forest.exists(f, c01), crate::node::Edge::TRUE);
    }

    #[test]
    pub fn cube_is_the_conjunction_of_its_variables() {
        let mut forest = small_forest();
        forest.new_levels(4);
        let cube = forest.cube(&[1, 3]);
        for a in assignments(4) {
            assert_eq!(forest.eval(cube, &a), a[1] && a[3]);
        }
        assert!(forest.cube(&[]).is_true());
    }

    #[test]
    pub fn gc_grows_the_table_under_pressure() {
        let mut forest = Forest::new(ForestConfig {
            workers: 1,
            table_size: 512,
            max_table_size: 2048,
            cache_size: 1 << 10,
            ..ForestConfig::default()
        });
        forest.new_levels(2);
        for payload in 0..600u64 {
            let leaf = forest.leaf(5, payload);
            forest.protect(leaf);
        }
        // two reserved slots, two representatives, six hundred leaves
        assert_eq!(forest.live_nodes(), 604);
        let (_, total) = forest.table_usage();
        assert_eq!(total, 1024);
    }

    #[test]
    pub fn custom_leaves_are_canonical_and_destroyed() {
        use crate::table::CustomLeafOps;
        use std::sync::atomic::{AtomicUsize, Ordering};
        static DESTROYED: AtomicUsize = AtomicUsize::new(0);

        fn hash(a: u64, b: u64, seed: u64) -> u64 {
            crate::hash::tabhash16(a ^ seed, b)
        }
        fn equals(a: u64, b: u64, other_a: u64, other_b: u64) -> bool {
            a == other_a && b == other_b
        }
        fn create(_a: &mut u64, _b: &mut u64) {}
        fn destroy(_a: u64, _b: u64) {
            DESTROYED.fetch_add(1, Ordering::Relaxed);
        }

        let mut forest = small_forest();
        forest.set_custom_leaf_ops(CustomLeafOps {
            hash,
            equals,
            create,
            destroy,
        });
        let x = forest.custom_leaf(9, 100);
        let y = forest.custom_leaf(9, 100);
        let z = forest.custom_leaf(9, 101);
        assert_eq!(x, y);
        assert_ne!(x, z);
        assert!(forest.node(x).is_leaf());

        // nothing protects the two leaves, so a collection destroys both
        forest.gc();
        assert_eq!(DESTROYED.load(Ordering::Relaxed), 2);
    }

    #[test]
    pub fn map_chain_stays_sorted() {
        let mut forest = small_forest();
        forest.new_levels(8);
        let v7 = forest.ithlevel(7).unwrap();
        let v3 = forest.ithlevel(3).unwrap();
        let v5 = forest.ithlevel(5).unwrap();

        let mut map = forest.map_empty();
        map = forest.map_add(map, 5, v5);
        map = forest.map_add(map, 3, v3);
        map = forest.map_add(map, 7, v7);

        let mut vars = Vec::new();
        let mut cursor = map;
        while !cursor.is_terminal() {
            let node = forest.table.node(cursor.index());
            assert!(node.is_map_node());
            vars.push(node.variable());
            cursor = node.low_edge();
        }
        assert_eq!(vars, vec![3, 5, 7]);
    }
}
