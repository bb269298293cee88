use super::RunState;
use crate::mtbdd::Forest;
use crate::varswap::ReorderError;
use log::info;

/// Position bookkeeping for one variable being sifted. `pos` is always the
/// level the variable currently sits at.
pub(crate) struct SiftState {
    pub pos: u32,
    pub size: i64,
    pub best_pos: u32,
    pub best_size: i64,
    pub low: u32,
    pub high: u32,
}

impl Forest {
    /// Graph size as tracked by the reference counters (live slots plus
    /// the two reserved terminals).
    fn sift_size(&self) -> i64 {
        self.reorder
            .mrc
            .as_ref()
            .map(|mrc| mrc.nnodes() as i64)
            .unwrap_or(0)
            + 2
    }

    fn level_node_delta(&self, level: u32) -> i64 {
        let mrc = self.reorder.mrc.as_ref().unwrap();
        mrc.var_nnodes(level) as i64 - i64::from(mrc.is_isolated(level))
    }

    fn interacts(&self, var_a: u32, var_b: u32) -> bool {
        self.reorder.matrix.as_ref().unwrap().test(var_a, var_b)
    }

    fn isolated_count(&self) -> i64 {
        self.reorder.mrc.as_ref().unwrap().isolated_count()
    }

    /// Move the variable at `state.pos` downwards while the quantitative
    /// bound says a smaller graph is still reachable.
    ///
    /// The part of the graph above the variable cannot change, and below
    /// it only the levels it interacts with can shrink; summing those
    /// levels (minus their isolated representative) gives the largest
    /// possible decrease. Once the current size minus that bound cannot
    /// undercut the best size seen, the direction is abandoned.
    pub(crate) fn sift_down(
        &mut self,
        state: &mut SiftState,
        run: &mut RunState,
    ) -> Result<(), ReorderError> {
        if self.reorder.mrc.is_none() {
            return Err(ReorderError::NotInitialised);
        }
        state.size = self.sift_size() - self.isolated_count();
        let mut limit = state.size;
        let moving_var = self.levels.level_to_variable(state.pos);

        let mut bound = 0i64;
        for y in (state.pos + 1)..=state.high {
            let y_var = self.levels.level_to_variable(y);
            if self.interacts(moving_var, y_var) {
                bound += self.level_node_delta(y);
            }
        }

        while state.pos < state.high && state.size - bound < limit {
            let y = state.pos + 1;
            let y_var = self.levels.level_to_variable(y);
            if self.interacts(moving_var, y_var) {
                bound -= self.level_node_delta(y);
            }
            self.swap_in_pool(state.pos)?;
            run.swaps_this_var += 1;
            state.pos += 1;
            state.size = self.sift_size();
            if state.size as f64 > state.best_size as f64 * self.reorder.config.max_growth {
                break;
            }
            if state.size <= state.best_size {
                state.best_size = state.size;
                state.best_pos = state.pos;
            }
            if state.size < limit {
                limit = state.size;
            }
            if self.should_terminate_sifting(run) {
                break;
            }
        }
        Ok(())
    }

    /// The mirror image of `sift_down`: only interacting levels above the
    /// variable can shrink, so their total bounds the reachable size from
    /// below.
    pub(crate) fn sift_up(
        &mut self,
        state: &mut SiftState,
        run: &mut RunState,
    ) -> Result<(), ReorderError> {
        if self.reorder.mrc.is_none() {
            return Err(ReorderError::NotInitialised);
        }
        state.size = self.sift_size() - self.isolated_count();
        let mut limit = state.size;
        let moving_var = self.levels.level_to_variable(state.pos);

        let mut lower = state.size;
        for x in (state.low + 1)..state.pos {
            let x_var = self.levels.level_to_variable(x);
            if self.interacts(moving_var, x_var) {
                lower -= self.level_node_delta(x);
            }
        }
        lower -= self.level_node_delta(state.pos);

        while state.pos > state.low && lower <= limit {
            let x = state.pos - 1;
            let x_var = self.levels.level_to_variable(x);
            self.swap_in_pool(x)?;
            run.swaps_this_var += 1;
            state.pos -= 1;
            state.size = self.sift_size();
            if state.size as f64 > state.best_size as f64 * self.reorder.config.max_growth {
                break;
            }
            if state.size <= state.best_size {
                state.best_size = state.size;
                state.best_pos = state.pos;
            }
            if self.interacts(moving_var, x_var) {
                // the passed variable sits below us now and may shrink again
                lower += self.level_node_delta(state.pos + 1);
            }
            if state.size < limit {
                limit = state.size;
            }
            if self.should_terminate_sifting(run) {
                break;
            }
        }
        Ok(())
    }

    /// Return the variable to the best position seen during the two
    /// directional passes.
    pub(crate) fn sift_back(
        &mut self,
        state: &mut SiftState,
        run: &mut RunState,
    ) -> Result<(), ReorderError> {
        while state.pos < state.best_pos {
            if state.size == state.best_size {
                return Ok(());
            }
            self.swap_in_pool(state.pos)?;
            run.swaps_this_var += 1;
            state.pos += 1;
            state.size = self.sift_size();
        }
        while state.pos > state.best_pos {
            if state.size == state.best_size {
                return Ok(());
            }
            self.swap_in_pool(state.pos - 1)?;
            run.swaps_this_var += 1;
            state.pos -= 1;
            state.size = self.sift_size();
        }
        Ok(())
    }

    /// Heaviest levels first: snapshot the per-level node counts, discard
    /// levels under the threshold, and gnome-sort the rest descending.
    /// Returns the order plus the level-to-variable snapshot used to find
    /// each entry again after earlier sifts moved it.
    fn sifting_order(&self, threshold: u32) -> (Vec<i64>, Vec<u32>) {
        let counts = self
            .pool
            .install(|| self.levels.count_level_nodes(&self.table));
        let mut order = self.levels.mark_threshold(&counts, threshold);
        self.levels.gnome_sort(&mut order, &counts);
        let snapshot = (0..self.levels.count())
            .map(|l| self.levels.level_to_variable(l))
            .collect();
        (order, snapshot)
    }

    /// Plain Rudell sifting over `[low, high]`: move each variable all the
    /// way in one direction, then the other, then back to the best level.
    pub(crate) fn sift(
        &mut self,
        low: u32,
        high: u32,
        run: &mut RunState,
    ) -> Result<(), ReorderError> {
        let (order, snapshot) = self.sifting_order(0);
        let mut cursize = self.sift_size();

        for lvl in order {
            if lvl < 0 {
                break;
            }
            let var = snapshot[lvl as usize];
            let mut pos = self.levels.variable_to_level(var);
            if pos < low || pos > high {
                continue;
            }
            run.swaps_this_var = 0;
            let start_size = cursize;
            let mut best_pos = pos;
            let mut best_size = cursize;

            let down_first = pos - low > high - pos;
            for direction in 0..2 {
                let down = (direction == 0) == down_first;
                if down {
                    while pos < high {
                        self.swap_in_pool(pos)?;
                        pos += 1;
                        run.swaps_this_var += 1;
                        cursize = self.sift_size();
                        if self.should_terminate_sifting(run) {
                            break;
                        }
                        if cursize as f64 > best_size as f64 * self.reorder.config.max_growth {
                            break;
                        }
                        if cursize < best_size {
                            best_size = cursize;
                            best_pos = pos;
                        }
                    }
                } else {
                    while pos > low {
                        self.swap_in_pool(pos - 1)?;
                        pos -= 1;
                        run.swaps_this_var += 1;
                        cursize = self.sift_size();
                        if self.should_terminate_sifting(run) {
                            break;
                        }
                        if cursize as f64 > best_size as f64 * self.reorder.config.max_growth {
                            break;
                        }
                        if cursize < best_size {
                            best_size = cursize;
                            best_pos = pos;
                        }
                    }
                }
            }

            // optimum position restoration
            while pos < best_pos {
                self.swap_in_pool(pos)?;
                pos += 1;
                run.swaps_this_var += 1;
            }
            while pos > best_pos {
                self.swap_in_pool(pos - 1)?;
                pos -= 1;
                run.swaps_this_var += 1;
            }
            cursize = self.sift_size();
            run.sifted_vars += 1;

            if cursize < start_size {
                self.run_progress_hooks();
            }
            if self.should_terminate_reordering(run) {
                break;
            }
        }
        Ok(())
    }

    /// Bounded sifting over `[low, high]`, with one garbage-collect-and-
    /// retry when a swap runs out of table space mid-pass.
    pub(crate) fn bounded_sift(
        &mut self,
        low: u32,
        high: u32,
        run: &mut RunState,
    ) -> Result<(), ReorderError> {
        match self.bounded_sift_once(low, high, run) {
            Err(failure) if failure.is_retryable() => {
                info!("sifting ran out of table space ({failure}); collecting garbage and retrying");
                self.reorder.mrc = None;
                self.reorder.matrix = None;
                self.gc();
                self.alloc_reorder_scratch();
                self.bounded_sift_once(low, high, run)
            }
            other => other,
        }
    }

    fn bounded_sift_once(
        &mut self,
        low: u32,
        high: u32,
        run: &mut RunState,
    ) -> Result<(), ReorderError> {
        let threshold = self.reorder.config.threshold;
        let (order, snapshot) = self.sifting_order(threshold);

        let mut state = SiftState {
            pos: 0,
            size: self.sift_size(),
            best_pos: 0,
            best_size: self.sift_size(),
            low,
            high,
        };

        for lvl in order {
            if lvl < 0 {
                break;
            }
            state.pos = self.levels.variable_to_level(snapshot[lvl as usize]);
            if state.pos < low || state.pos > high {
                continue;
            }
            run.swaps_this_var = 0;
            state.best_pos = state.pos;
            state.best_size = state.size;
            let start_size = state.size;

            if state.pos == low {
                self.sift_down(&mut state, run)?;
                self.sift_back(&mut state, run)?;
            } else if state.pos == high {
                self.sift_up(&mut state, run)?;
                self.sift_back(&mut state, run)?;
            } else if state.pos - low > high - state.pos {
                self.sift_down(&mut state, run)?;
                self.sift_up(&mut state, run)?;
                self.sift_back(&mut state, run)?;
            } else {
                self.sift_up(&mut state, run)?;
                self.sift_down(&mut state, run)?;
                self.sift_back(&mut state, run)?;
            }

            run.sifted_vars += 1;
            if state.best_size < start_size {
                self.run_progress_hooks();
            }
            if self.should_terminate_reordering(run) {
                break;
            }
        }
        Ok(())
    }
}
