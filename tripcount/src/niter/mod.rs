//! Trip-count analysis
//!
//! For an exit edge of a loop, `number_of_iterations_exit` derives how many
//! times the loop body runs before the exit is taken:
//!
//! 1. `normalize::analyze_exit` canonicalizes the staying condition and
//!    dispatches to `modular::solve_ne` or `range::solve_le`
//! 2. the result is tightened with enclosing-loop values and dominating
//!    guards (`simplify`)
//! 3. exits no closed form covers may still be counted by `eval`
//!
//! Proven counts feed each loop's bound ledger (`bounds`), which answers
//! whether an induction variable can be counted in a wider type.

mod bounds;
mod eval;
mod modular;
mod normalize;
mod range;
mod simplify;

pub use bounds::{
    BoundIter, BoundList, BoundRecord, Estimate, can_widen, can_widen_with_bound, compare_exprs,
    lower_bound_in_type, record_estimate, upper_bound_in_type,
};
pub use modular::{inverse, solve_ne};
pub use normalize::analyze_exit;
pub use range::solve_le;

use crate::config::NiterConfig;
use crate::ir::{BlockId, DomTree, Edge, EdgeKind, ExprArena, ExprId, ExprKind, Function, LoopForest, LoopId};
use crate::ir::{RangeFacts, StmtId, Type, simple_iv};
use std::collections::HashMap;

/// Closed-form description of one exit's iteration count
///
/// `niter` is only meaningful when `assumptions` holds; when `may_be_zero`
/// holds the loop may leave through this exit before `niter` iterations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NiterDescriptor {
    /// Iterations before the exit, in the unsigned variant of the IV type
    pub niter: ExprId,
    pub assumptions: ExprId,
    pub may_be_zero: ExprId,
    /// Dominating conditions the simplifier relied on
    pub additional_info: ExprId,
}

impl NiterDescriptor {
    /// The loop provably does not run: niter 0 under no assumptions
    pub fn zero(arena: &mut ExprArena, niter_ty: Type) -> Self {
        Self {
            niter: arena.constant(niter_ty, 0),
            assumptions: arena.boolean(true),
            may_be_zero: arena.boolean(true),
            additional_info: arena.boolean(true),
        }
    }

    /// `niter` holds without further conditions
    pub fn is_unconditional(&self, arena: &ExprArena) -> bool {
        arena.is_true(self.assumptions)
    }
}

/// Trip-count engine over one function
///
/// Borrows the function and its analyses; the expression arena is borrowed
/// mutably because every derived expression is interned there. Bound
/// ledgers live on the loops of `loops`.
pub struct NiterAnalyzer<'a> {
    arena: &'a mut ExprArena,
    func: &'a Function,
    dom: &'a DomTree,
    loops: &'a mut LoopForest,
    config: NiterConfig,
    /// Enclosing-loop IV ranges per loop, see `outer_evolution_ranges`
    outer_ranges: HashMap<LoopId, RangeFacts>,
}

impl<'a> NiterAnalyzer<'a> {
    pub fn new(
        arena: &'a mut ExprArena,
        func: &'a Function,
        dom: &'a DomTree,
        loops: &'a mut LoopForest,
        config: NiterConfig,
    ) -> Self {
        Self { arena, func, dom, loops, config, outer_ranges: HashMap::new() }
    }

    pub fn arena(&self) -> &ExprArena {
        &*self.arena
    }

    pub fn arena_mut(&mut self) -> &mut ExprArena {
        &mut *self.arena
    }

    pub fn loops(&self) -> &LoopForest {
        &*self.loops
    }

    pub fn config(&self) -> &NiterConfig {
        &self.config
    }

    /// Iteration count of `lp` before it leaves through `exit`
    ///
    /// `None` when the exit is not analyzable. A returned descriptor whose
    /// assumptions are not literally true is still reported; consumers that
    /// need a proven count check `is_unconditional`.
    pub fn number_of_iterations_exit(&mut self, lp: LoopId, exit: Edge) -> Option<NiterDescriptor> {
        let func = self.func;
        let l = self.loops.get(lp);
        if !l.contains(exit.src) || l.contains(exit.dest) {
            return None;
        }
        if !l.latches.iter().all(|&latch| self.dom.dominates(exit.src, latch)) {
            return None;
        }
        let header = l.header;

        let (stmt, cond) = func.branch_of(exit.src)?;
        let ExprKind::Cmp(op, op0, op1) = self.arena.kind(cond) else {
            return None;
        };
        // Condition for staying inside the loop
        let op = match exit.kind {
            EdgeKind::True => op.invert(),
            EdgeKind::False => op,
            EdgeKind::Fallthru => return None,
        };
        let ty = self.arena.ty(op0);
        if !ty.is_integer() && !ty.pointer {
            return None;
        }

        let iv0 = simple_iv(&mut *self.arena, func, &*self.loops, lp, stmt, op0)?;
        let iv1 = simple_iv(&mut *self.arena, func, &*self.loops, lp, stmt, op1)?;
        let mut desc = analyze_exit(&mut *self.arena, ty, iv0, op, iv1)?;

        if self.config.simplify_outer_context {
            desc.assumptions = self.simplify_using_outer_evolutions(lp, desc.assumptions);
            desc.may_be_zero = self.simplify_using_outer_evolutions(lp, desc.may_be_zero);
            desc.niter = self.simplify_using_outer_evolutions(lp, desc.niter);

            let mut additional = self.arena.boolean(true);
            desc.assumptions = self.simplify_using_initial_conditions(lp, desc.assumptions, &mut additional);
            desc.may_be_zero = self.simplify_using_initial_conditions(lp, desc.may_be_zero, &mut additional);
            desc.niter = self.simplify_using_initial_conditions(lp, desc.niter, &mut additional);
            desc.additional_info = additional;
        }
        if self.arena.is_true(desc.may_be_zero) {
            let niter_ty = self.arena.ty(desc.niter);
            desc.niter = self.arena.constant(niter_ty, 0);
        }

        tracing::debug!(
            header = header.0,
            exit = %format_args!("{} -> {}", exit.src.0, exit.dest.0),
            niter = %self.arena.display(desc.niter),
            assumptions = %self.arena.display(desc.assumptions),
            may_be_zero = %self.arena.display(desc.may_be_zero),
            "analyzed exit"
        );
        Some(desc)
    }

    /// True when `block` runs exactly once per iteration of `lp`
    fn executes_once_per_iteration(&self, lp: LoopId, block: BlockId) -> bool {
        self.loops.innermost_loop_of(block) == Some(lp)
            && self.loops.get(lp).latches.iter().all(|&latch| self.dom.dominates(block, latch))
    }

    /// Smallest iteration count proven by simulation over all exits of `lp`
    pub fn find_loop_niter_by_eval(&mut self, lp: LoopId) -> Option<(u64, Edge)> {
        let mut best: Option<(u64, Edge)> = None;
        for exit in self.loops.exit_edges(self.func, lp) {
            if !self.executes_once_per_iteration(lp, exit.src) {
                continue;
            }
            let Some(niter) = self.evaluate_by_simulation(lp, exit) else {
                continue;
            };
            if best.is_none_or(|(current, _)| niter < current) {
                best = Some((niter, exit));
            }
        }
        best
    }

    /// Record the bounds every exit of `lp` implies
    ///
    /// Runs once per loop until the estimates are freed.
    pub fn estimate_numbers_of_iterations(&mut self, lp: LoopId) {
        if self.loops.get(lp).estimate != Estimate::NotComputed {
            return;
        }
        self.loops.get_mut(lp).estimate = Estimate::Unknown;

        let func = self.func;
        for exit in self.loops.exit_edges(func, lp) {
            let Some((anchor, _)) = func.branch_of(exit.src) else {
                continue;
            };
            match self.number_of_iterations_exit(lp, exit) {
                Some(desc) if desc.is_unconditional(&*self.arena) => {
                    let bound = if self.arena.is_false(desc.may_be_zero) {
                        desc.niter
                    } else {
                        let niter_ty = self.arena.ty(desc.niter);
                        let zero = self.arena.constant(niter_ty, 0);
                        self.arena.fold_select(desc.may_be_zero, zero, desc.niter)
                    };
                    self.record(lp, bound, desc.additional_info, anchor);
                }
                _ if self.config.brute_force_fallback && self.executes_once_per_iteration(lp, exit.src) => {
                    if let Some(niter) = self.evaluate_by_simulation(lp, exit) {
                        let bound = self.arena.constant(Type::uint(64), niter);
                        let always = self.arena.boolean(true);
                        self.record(lp, bound, always, anchor);
                    }
                }
                _ => {}
            }
        }
    }

    fn record(&mut self, lp: LoopId, bound: ExprId, additional: ExprId, anchor: StmtId) {
        record_estimate(&*self.arena, self.loops.get_mut(lp), bound, additional, anchor);
    }

    pub fn estimate_all_numbers_of_iterations(&mut self) {
        for lp in self.loops.ids() {
            self.estimate_numbers_of_iterations(lp);
        }
    }

    /// Drop every recorded bound and estimate
    pub fn free_numbers_of_iterations_estimates(&mut self) {
        for lp in self.loops.ids() {
            let l = self.loops.get_mut(lp);
            l.bounds.clear();
            l.estimate = Estimate::NotComputed;
        }
    }

    /// Step of `base + step * i` in `wide` if the IV, used at `at_stmt`, can
    /// be counted in `wide` without changing its value
    pub fn can_count_iv_in_wider_type(
        &mut self,
        lp: LoopId,
        wide: Type,
        base: ExprId,
        step: ExprId,
        at_stmt: StmtId,
    ) -> Option<ExprId> {
        can_widen(&mut *self.arena, self.func, self.dom, self.loops.get(lp), wide, base, step, at_stmt)
    }

    /// Loops none of whose exits has an unconditional closed-form count
    pub fn maybe_infinite_loops(&mut self) -> Vec<LoopId> {
        let mut result = Vec::new();
        for lp in self.loops.ids() {
            let mut finite = false;
            for exit in self.loops.exit_edges(self.func, lp) {
                if let Some(desc) = self.number_of_iterations_exit(lp, exit) {
                    finite |= desc.is_unconditional(&*self.arena);
                }
            }
            if !finite {
                tracing::debug!(header = self.loops.get(lp).header.0, "loop may be infinite");
                result.push(lp);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BinOp, CmpOp, FunctionBuilder, StmtKind};

    /// `for (i = start; i < limit; i += step)` over `ty`, guarded or not
    struct CountedLoop {
        arena: ExprArena,
        func: Function,
        header: BlockId,
        exit_branch: StmtId,
    }

    fn counted_loop(ty: Type, start: i128, limit: i128, step: i128) -> CountedLoop {
        let mut arena = ExprArena::new();
        let i = arena.new_var("i", ty);
        let inext = arena.new_var("i.next", ty);
        let iv = arena.var(i);
        let inv = arena.var(inext);
        let start = arena.int(ty, start);
        let limit = arena.int(ty, limit);
        let step = arena.int(ty, step);

        let mut fb = FunctionBuilder::new("counted");
        let entry = fb.add_block("entry");
        let header = fb.add_block("header");
        let latch = fb.add_block("latch");
        let exit = fb.add_block("exit");
        fb.goto(entry, header);
        fb.push(header, StmtKind::Phi { dest: i, args: vec![(entry, start), (latch, inv)] });
        let cond = arena.compare(CmpOp::Lt, iv, limit);
        let exit_branch = fb.branch(header, cond, latch, exit);
        let next = arena.binary(BinOp::Add, ty, iv, step);
        fb.push(latch, StmtKind::Assign { dest: inext, value: next });
        fb.goto(latch, header);
        fb.ret(exit, None);
        let func = fb.finish(&arena).expect("valid function");
        CountedLoop { arena, func, header, exit_branch }
    }

    #[test]
    fn test_exit_of_simple_counted_loop() {
        let CountedLoop { mut arena, func, header, .. } = counted_loop(Type::sint(32), 0, 10, 1);
        let dom = DomTree::new(&func);
        let mut loops = LoopForest::discover(&func, &dom);
        let lp = loops.innermost_loop_of(header).expect("loop");
        let exit = loops.exit_edges(&func, lp)[0];
        let mut analyzer = NiterAnalyzer::new(&mut arena, &func, &dom, &mut loops, NiterConfig::default());
        let desc = analyzer.number_of_iterations_exit(lp, exit).expect("analyzable");
        let arena = analyzer.arena();
        assert_eq!(arena.const_value(desc.niter), Some(10));
        assert!(arena.is_true(desc.assumptions));
        assert!(arena.is_false(desc.may_be_zero));
    }

    #[test]
    fn test_estimate_records_bound_once() {
        let CountedLoop { mut arena, func, header, exit_branch } = counted_loop(Type::sint(32), 0, 100, 3);
        let dom = DomTree::new(&func);
        let mut loops = LoopForest::discover(&func, &dom);
        let lp = loops.innermost_loop_of(header).expect("loop");
        let mut analyzer = NiterAnalyzer::new(&mut arena, &func, &dom, &mut loops, NiterConfig::default());
        analyzer.estimate_numbers_of_iterations(lp);
        analyzer.estimate_numbers_of_iterations(lp);

        let l = analyzer.loops().get(lp);
        assert_eq!(l.bounds.len(), 1);
        let record = l.bounds.iter().next().expect("record");
        assert_eq!(record.anchor, exit_branch);
        // i = 0, 3, ..., 99
        assert_eq!(analyzer.arena().const_value(record.bound), Some(34));
        assert_eq!(l.estimate, Estimate::Constant(34));

        analyzer.free_numbers_of_iterations_estimates();
        let l = analyzer.loops().get(lp);
        assert!(l.bounds.is_empty());
        assert_eq!(l.estimate, Estimate::NotComputed);
    }

    #[test]
    fn test_widening_after_estimate() {
        let CountedLoop { mut arena, func, header, exit_branch } = counted_loop(Type::sint(8), 0, 100, 1);
        let dom = DomTree::new(&func);
        let mut loops = LoopForest::discover(&func, &dom);
        let lp = loops.innermost_loop_of(header).expect("loop");
        let mut analyzer = NiterAnalyzer::new(&mut arena, &func, &dom, &mut loops, NiterConfig::default());
        let base = analyzer.arena_mut().int(Type::sint(8), 0);
        let step = analyzer.arena_mut().int(Type::sint(8), 1);
        assert!(analyzer.can_count_iv_in_wider_type(lp, Type::sint(32), base, step, exit_branch).is_none());

        analyzer.estimate_all_numbers_of_iterations();
        let new_step = analyzer.can_count_iv_in_wider_type(lp, Type::sint(32), base, step, exit_branch);
        assert_eq!(new_step.and_then(|s| analyzer.arena().const_int(s)), Some(1));
        assert!(analyzer.maybe_infinite_loops().is_empty());
    }
}
