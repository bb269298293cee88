use crate::interact::InteractionMatrix;
use crate::mrc::Mrc;
use crate::mtbdd::Forest;
use crate::varswap::{self, ReorderError};
use log::{error, info};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

mod sift;

/// Default budgets, mirrored by [`ReorderConfig::default`].
pub const DEFAULT_MAX_VAR: u32 = 1000;
pub const DEFAULT_MAX_SWAPS: u32 = 10_000;
pub const DEFAULT_MAX_GROWTH: f64 = 1.2;
pub const DEFAULT_NODES_THRESHOLD: u32 = 1;
pub const DEFAULT_TIME_LIMIT_MS: u64 = 10_000 * 60 * 1000;
pub const FIRST_REORDER_THRESHOLD: u64 = 5000;
pub const REORDER_SIZE_RATIO: f64 = 1.6;
/// Maximum number of reordering calls; also the additive threshold bump
/// once the call budget is exhausted.
pub const REORDER_LIMIT: u64 = 20;

/// Which sifting variant `reduce_heap` dispatches to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReorderType {
    /// Plain Rudell sifting: swap, measure, keep the best position.
    Sift,
    /// Sifting pruned by the interaction matrix and the isolated-variable
    /// lower/upper bounds.
    BoundedSift,
}

/// Numeric budgets for one reordering call.
#[derive(Clone, Debug)]
pub struct ReorderConfig {
    /// Abort a single variable's sift after this many swaps.
    pub max_swap: u32,
    /// Stop after this many variables have been sifted.
    pub max_var: u32,
    /// Abandon a direction when the graph grows beyond
    /// `best_size * max_growth`.
    pub max_growth: f64,
    /// Levels with fewer nodes than this are not worth sifting.
    pub threshold: u32,
    /// Wall-clock budget for the whole call.
    pub time_limit: Duration,
}

impl Default for ReorderConfig {
    fn default() -> ReorderConfig {
        ReorderConfig {
            max_swap: DEFAULT_MAX_SWAPS,
            max_var: DEFAULT_MAX_VAR,
            max_growth: DEFAULT_MAX_GROWTH,
            threshold: DEFAULT_NODES_THRESHOLD,
            time_limit: Duration::from_millis(DEFAULT_TIME_LIMIT_MS),
        }
    }
}

type Hook = Arc<dyn Fn() + Send + Sync>;
type TerminationHook = Arc<dyn Fn() -> bool + Send + Sync>;

/// Callback lists; within each category the most recently registered hook
/// runs first.
#[derive(Default)]
pub(crate) struct Hooks {
    pre: Mutex<Vec<Hook>>,
    post: Mutex<Vec<Hook>>,
    progress: Mutex<Vec<Hook>>,
    termination: Mutex<Vec<TerminationHook>>,
}

impl Hooks {
    fn snapshot(list: &Mutex<Vec<Hook>>) -> Vec<Hook> {
        list.lock().clone()
    }

    fn run(list: &Mutex<Vec<Hook>>) {
        for hook in Hooks::snapshot(list) {
            hook();
        }
    }

    fn should_terminate(&self) -> bool {
        let hooks = self.termination.lock().clone();
        hooks.iter().any(|hook| hook())
    }
}

/// Everything the reordering subsystem keeps between and during calls. The
/// reference counters and the interaction matrix only exist while a pass
/// is running.
pub(crate) struct ReorderState {
    pub reorder_type: ReorderType,
    pub config: ReorderConfig,
    pub node_ids: crate::index_set::NodeIdSet,
    pub mrc: Option<Mrc>,
    pub matrix: Option<InteractionMatrix>,
    pub call_count: u64,
    pub size_threshold: u64,
    pub hooks: Hooks,
}

impl ReorderState {
    pub fn new(reorder_type: ReorderType) -> ReorderState {
        ReorderState {
            reorder_type,
            config: ReorderConfig::default(),
            node_ids: crate::index_set::NodeIdSet::new(),
            mrc: None,
            matrix: None,
            call_count: 0,
            size_threshold: FIRST_REORDER_THRESHOLD,
            hooks: Hooks::default(),
        }
    }
}

/// Per-call bookkeeping shared by the sifting loops.
pub(crate) struct RunState {
    pub started: Instant,
    pub swaps_this_var: u32,
    pub sifted_vars: u32,
}

impl RunState {
    fn new() -> RunState {
        RunState {
            started: Instant::now(),
            swaps_this_var: 0,
            sifted_vars: 0,
        }
    }
}

impl Forest {
    /// Tune the reordering budgets.
    pub fn set_reorder_config(&mut self, config: ReorderConfig) {
        assert!(config.max_growth > 1.0);
        assert!(config.max_swap > 1 && config.max_var >= 1);
        self.reorder.config = config;
    }

    pub fn reorder_config(&self) -> &ReorderConfig {
        &self.reorder.config
    }

    /// Called before dynamic variable reordering begins.
    pub fn on_pre_reorder(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.reorder.hooks.pre.lock().insert(0, Arc::new(hook));
    }

    /// Called after dynamic variable reordering finished.
    pub fn on_post_reorder(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.reorder.hooks.post.lock().insert(0, Arc::new(hook));
    }

    /// Called whenever a sifted variable ended up reducing the graph.
    pub fn on_reorder_progress(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.reorder.hooks.progress.lock().insert(0, Arc::new(hook));
    }

    /// Polled regularly; returning true stops the search early (the graph
    /// is always left consistent).
    pub fn on_reorder_termination(&self, hook: impl Fn() -> bool + Send + Sync + 'static) {
        self.reorder.hooks.termination.lock().insert(0, Arc::new(hook));
    }

    /// Run dynamic reordering now, using the configured algorithm.
    pub fn reduce_heap(&mut self, reorder_type: ReorderType) -> Result<(), ReorderError> {
        if self.levels.count() < 1 {
            error!("reordering skipped: {}", ReorderError::NoRegisteredVars);
            return Err(ReorderError::NoRegisteredVars);
        }
        let before = self.pre_reorder();
        let mut run = RunState::new();
        let high = self.levels.count() - 1;
        let result = match reorder_type {
            ReorderType::Sift => self.sift(0, high, &mut run),
            ReorderType::BoundedSift => self.bounded_sift(0, high, &mut run),
        };
        let result = match result {
            // a rolled-back swap leaves the graph unchanged; the search was
            // merely truncated
            Err(ReorderError::Rollback) => {
                info!("reordering stopped on a rolled-back swap");
                Ok(())
            }
            other => other,
        };
        if let Err(failure) = &result {
            error!("reordering failed: {failure}");
        }
        self.post_reorder(before, run.started);
        result
    }

    /// Trigger `reduce_heap` when the table population crossed the current
    /// threshold and the call budget still allows it.
    pub fn maybe_reduce_heap(&mut self) -> Result<(), ReorderError> {
        let live = self.live_nodes();
        if live >= self.reorder.size_threshold && self.reorder.call_count < REORDER_LIMIT {
            self.reduce_heap(self.reorder.reorder_type)
        } else {
            Ok(())
        }
    }

    /// Realise an arbitrary permutation of the variable order by bubbling
    /// each variable to its target level with adjacent swaps. `perm[level]`
    /// names the stable variable that should end up at `level`. The
    /// identity permutation is recognised and skipped.
    pub fn permute(&mut self, perm: &[u32]) -> Result<(), ReorderError> {
        assert_eq!(perm.len(), self.levels.count() as usize);
        let identity = (0..self.levels.count()).all(|l| perm[l as usize] == self.levels.level_to_variable(l));
        if identity {
            return Ok(());
        }
        self.cache.clear();
        for level in 0..self.levels.count() {
            let var = perm[level as usize];
            let mut pos = self.levels.variable_to_level(var);
            while pos < level {
                self.swap_in_pool(pos)?;
                pos += 1;
            }
            while pos > level {
                self.swap_in_pool(pos - 1)?;
                pos -= 1;
            }
        }
        Ok(())
    }

    /// One adjacent swap inside the worker pool, without clearing the
    /// cache (callers clear it once per stop-the-world section).
    pub(crate) fn swap_in_pool(&mut self, level: u32) -> Result<(), ReorderError> {
        let Forest {
            table,
            levels,
            reorder,
            pool,
            ..
        } = self;
        pool.install(|| varswap::var_swap(table, reorder.mrc.as_ref(), levels, level))
    }

    /// Snapshot the live node indices, allocate the reference counters and
    /// the interaction matrix sized to the current table and level count,
    /// and mark the externally referenced nodes.
    pub(crate) fn alloc_reorder_scratch(&mut self) {
        let Forest {
            table,
            levels,
            reorder,
            pool,
            roots,
            ..
        } = self;
        reorder.node_ids.refill(table);

        let mrc = Mrc::new(levels.count() as usize, table.size());
        let matrix = InteractionMatrix::new(levels.count() as usize);
        for root in roots.lock().edges.values() {
            mrc.mark_external(root.index());
        }
        // the registry itself holds its representatives alive
        for representative in levels.representatives() {
            mrc.mark_external(representative.index());
        }
        pool.install(|| {
            mrc.init(table, &reorder.node_ids);
            matrix.init(table, levels, &reorder.node_ids);
        });
        reorder.mrc = Some(mrc);
        reorder.matrix = Some(matrix);
    }

    /// Clear the cache, build the per-pass scratch and run the pre hooks.
    /// Returns the node count before reordering.
    fn pre_reorder(&mut self) -> u64 {
        self.cache.clear();
        self.alloc_reorder_scratch();
        self.reorder.call_count += 1;

        Hooks::run(&self.reorder.hooks.pre);

        let before = self.live_nodes();
        info!(
            "reordering ({:?}, chaining): from {} nodes",
            self.reorder.reorder_type, before
        );
        before
    }

    /// Free the per-pass scratch, recompute the next size threshold and run
    /// the post hooks.
    fn post_reorder(&mut self, before: u64, started: Instant) {
        let after = self.live_nodes();

        let new_threshold = ((after + 1) as f64 * REORDER_SIZE_RATIO) as u64;
        if self.reorder.call_count < REORDER_LIMIT || new_threshold > self.reorder.size_threshold {
            self.reorder.size_threshold = new_threshold;
        } else {
            self.reorder.size_threshold += REORDER_LIMIT;
        }

        self.reorder.mrc = None;
        self.reorder.matrix = None;
        self.reorder.node_ids.clear();

        let (used, total) = self.table_usage();
        info!(
            "reordering: {} -> {} nodes in {:.3}s ({}/{} slots, {:.2}%)",
            before,
            after,
            started.elapsed().as_secs_f64(),
            used,
            total,
            used as f64 / total as f64 * 100.0
        );

        Hooks::run(&self.reorder.hooks.post);
    }

    pub(crate) fn run_progress_hooks(&self) {
        Hooks::run(&self.reorder.hooks.progress);
    }

    /// Budget checks polled between swaps of one variable's sift.
    pub(crate) fn should_terminate_sifting(&self, run: &RunState) -> bool {
        if self.reorder.hooks.should_terminate() {
            info!("sifting exit: termination callback");
            return true;
        }
        if run.swaps_this_var > self.reorder.config.max_swap {
            info!(
                "sifting exit: {} swaps over the budget of {}",
                run.swaps_this_var, self.reorder.config.max_swap
            );
            return true;
        }
        if run.started.elapsed() > self.reorder.config.time_limit {
            info!("sifting exit: time limit reached");
            return true;
        }
        false
    }

    /// Budget checks polled between variables.
    pub(crate) fn should_terminate_reordering(&self, run: &RunState) -> bool {
        if self.reorder.hooks.should_terminate() {
            info!("reordering exit: termination callback");
            return true;
        }
        if run.sifted_vars > self.reorder.config.max_var {
            info!(
                "reordering exit: {} variables over the budget of {}",
                run.sifted_vars, self.reorder.config.max_var
            );
            return true;
        }
        if run.started.elapsed() > self.reorder.config.time_limit {
            info!("reordering exit: time limit reached");
            return true;
        }
        false
    }
}

#[cfg(test)]
mod test {
    use crate::mtbdd::{Forest, ForestConfig};
    use crate::node::Edge;
    use crate::reorder::ReorderType;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn forest(levels: u32) -> Forest {
        let mut forest = Forest::new(ForestConfig {
            workers: 2,
            table_size: 1 << 15,
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

    /// `(v_a1 & v_b1) | (v_a2 & v_b2) | ...`
    fn disjunction_of_pairs(forest: &mut Forest, pairs: &[(u32, u32)]) -> Edge {
        let mut f = Edge::FALSE;
        for (a, b) in pairs {
            let va = forest.ithlevel(*a).unwrap();
            let vb = forest.ithlevel(*b).unwrap();
            let conj = forest.and(va, vb);
            f = forest.or(f, conj);
        }
        f
    }

    #[test]
    pub fn permute_realises_the_target_order() {
        let mut forest = forest(4);
        let f = disjunction_of_pairs(&mut forest, &[(0, 2), (1, 3)]);
        forest.protect(f);
        let before = truth_table(&forest, f, 4);

        forest.permute(&[3, 0, 2, 1]).unwrap();

        assert_eq!(
            (0..4).map(|l| forest.level_to_variable(l)).collect::<Vec<_>>(),
            vec![3, 0, 2, 1]
        );
        assert_eq!(truth_table(&forest, f, 4), before);
    }

    #[test]
    pub fn permute_identity_is_a_no_op() {
        let mut forest = forest(4);
        let before = forest.live_nodes();
        forest.permute(&[0, 1, 2, 3]).unwrap();
        assert_eq!(forest.live_nodes(), before);
        assert_eq!(
            (0..4).map(|l| forest.level_to_variable(l)).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );
    }

    #[test]
    pub fn bounded_sift_finds_the_good_order() {
        // measure the formula in its optimal variable order first
        let mut reference = forest(6);
        let best = disjunction_of_pairs(&mut reference, &[(0, 1), (2, 3), (4, 5)]);
        let optimal_size = reference.node_count(best);

        // the same function under a pessimal order
        let mut forest = forest(6);
        let g = disjunction_of_pairs(&mut forest, &[(0, 3), (1, 4), (2, 5)]);
        forest.protect(g);
        let before = truth_table(&forest, g, 6);
        assert!(forest.node_count(g) > optimal_size);

        forest.gc();
        forest.reduce_heap(ReorderType::BoundedSift).unwrap();

        assert!(forest.node_count(g) <= optimal_size + 2);
        assert_eq!(truth_table(&forest, g, 6), before);
    }

    #[test]
    pub fn plain_sift_finds_the_good_order() {
        let mut reference = forest(6);
        let best = disjunction_of_pairs(&mut reference, &[(0, 1), (2, 3), (4, 5)]);
        let optimal_size = reference.node_count(best);

        let mut forest = forest(6);
        let g = disjunction_of_pairs(&mut forest, &[(0, 3), (1, 4), (2, 5)]);
        forest.protect(g);
        let before = truth_table(&forest, g, 6);

        forest.gc();
        forest.reduce_heap(ReorderType::Sift).unwrap();

        assert!(forest.node_count(g) <= optimal_size + 2);
        assert_eq!(truth_table(&forest, g, 6), before);
    }

    #[test]
    pub fn sifting_reports_progress_on_a_pathological_order() {
        let n = 16u32;
        let mut forest = forest(n);
        // pairs (i, i + n/2): exponential in this order, linear when the
        // partners are adjacent
        let pairs: Vec<(u32, u32)> = (0..n / 2).map(|i| (i, i + n / 2)).collect();
        let f = disjunction_of_pairs(&mut forest, &pairs);
        forest.protect(f);
        forest.gc();
        let initial = forest.live_nodes();

        let fired = Arc::new(AtomicUsize::new(0));
        let observer = fired.clone();
        forest.on_reorder_progress(move || {
            observer.fetch_add(1, Ordering::Relaxed);
        });

        forest.reduce_heap(ReorderType::BoundedSift).unwrap();

        assert!(fired.load(Ordering::Relaxed) >= 1);
        assert!(forest.live_nodes() < initial);
    }

    #[test]
    pub fn termination_hook_truncates_the_search() {
        let mut forest = forest(6);
        let g = disjunction_of_pairs(&mut forest, &[(0, 3), (1, 4), (2, 5)]);
        forest.protect(g);
        let before = truth_table(&forest, g, 6);

        forest.on_reorder_termination(|| true);
        forest.reduce_heap(ReorderType::BoundedSift).unwrap();

        // the search stopped early but the graph stayed consistent
        assert_eq!(truth_table(&forest, g, 6), before);
    }

    #[test]
    pub fn pre_and_post_hooks_run_in_lifo_order() {
        let mut forest = forest(2);
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let log = log.clone();
            forest.on_pre_reorder(move || log.lock().push(tag));
        }
        let post_log = log.clone();
        forest.on_post_reorder(move || post_log.lock().push("post"));

        forest.reduce_heap(ReorderType::BoundedSift).unwrap();

        assert_eq!(*log.lock(), vec!["second", "first", "post"]);
    }

    #[test]
    pub fn maybe_reduce_heap_waits_for_the_threshold() {
        let mut forest = forest(4);
        let f = disjunction_of_pairs(&mut forest, &[(0, 2), (1, 3)]);
        forest.protect(f);
        // far below the first threshold: nothing happens
        forest.maybe_reduce_heap().unwrap();
        assert_eq!(
            (0..4).map(|l| forest.level_to_variable(l)).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );
    }

    #[test]
    pub fn reference_counters_stay_exact_across_swaps() {
        let mut forest = forest(6);
        let f = disjunction_of_pairs(&mut forest, &[(0, 3), (1, 4), (2, 5)]);
        forest.protect(f);
        forest.gc();

        forest.alloc_reorder_scratch();
        for level in [0, 2, 4, 1, 3, 2, 0] {
            forest.cache.clear();
            forest.swap_in_pool(level).unwrap();
            let tracked = forest.reorder.mrc.as_ref().unwrap().nnodes() + 2;
            assert_eq!(tracked, forest.live_nodes());
        }
        forest.reorder.mrc = None;
        forest.reorder.matrix = None;
    }
}
