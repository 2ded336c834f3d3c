//! Brute-force evaluation of exit conditions
//!
//! Handles small loops the closed forms cannot express, such as
//! `for (i = 1; i != 64; i *= 2)`. Each side of the exit comparison must be
//! a constant or computed from a header phi through a chain of single-use
//! assignments whose other operands are constants. The phis are then
//! stepped concretely until the staying condition folds to false.

use super::NiterAnalyzer;
use crate::ir::{CmpOp, Edge, EdgeKind, ExprArena, ExprId, ExprKind, Function, Loop, LoopId, StmtKind, VarId};
use std::collections::{HashMap, HashSet};

/// Outcome of one bounded simulation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Simulation {
    /// Iteration at which the exit is taken, if within the cap
    pub niter: Option<u64>,
    /// Candidate iterations whose exit condition was evaluated
    pub evaluated: u64,
}

/// `expr` computed from the header phi `phi`: `steps[k]` reads the variable
/// it names and produces the value read by `steps[k + 1]`
#[derive(Debug)]
struct Chain {
    phi: VarId,
    steps: Vec<(VarId, ExprId)>,
}

impl Chain {
    /// Value at the end of the chain when the phi holds `phi_value`
    fn value(&self, arena: &mut ExprArena, phi_value: ExprId) -> ExprId {
        let mut cur = phi_value;
        for &(var, expr) in &self.steps {
            let map = HashMap::from([(var, cur)]);
            let substituted = arena.substitute(expr, &map);
            cur = arena.fold(substituted);
        }
        cur
    }
}

/// Follow `expr` back to a header phi of `lp` through single-use assignments
fn chain_of(arena: &ExprArena, func: &Function, lp: &Loop, expr: ExprId) -> Option<Chain> {
    let mut steps = Vec::new();
    let mut seen = HashSet::new();
    let mut cur = expr;
    loop {
        let &[var] = arena.var_uses(cur).as_slice() else {
            return None;
        };
        if !seen.insert(var) {
            return None;
        }
        steps.push((var, cur));
        let stmt = func.stmt(func.def_stmt(var)?);
        if !lp.contains(stmt.block) {
            return None;
        }
        match &stmt.kind {
            StmtKind::Phi { .. } if stmt.block == lp.header => {
                steps.reverse();
                return Some(Chain { phi: var, steps });
            }
            StmtKind::Assign { value, .. } => cur = *value,
            _ => return None,
        }
    }
}

/// One side of the exit comparison
enum Operand {
    Fixed(ExprId),
    Evolving { value: Chain, next: Chain, current: ExprId },
}

/// Resolve a comparison operand to a constant or a phi recurrence with a
/// constant initial value
fn operand_for(arena: &mut ExprArena, func: &Function, lp: &Loop, expr: ExprId) -> Option<Operand> {
    if arena.is_constant(expr) {
        return Some(Operand::Fixed(expr));
    }
    let value = chain_of(arena, func, lp, expr)?;
    let def = func.def_stmt(value.phi)?;
    let StmtKind::Phi { args, .. } = &func.stmt(def).kind else {
        return None;
    };
    let latch = lp.latch?;

    let mut init = None;
    let mut next = None;
    for &(from, arg) in args {
        if from != latch && lp.contains(from) {
            return None;
        }
        let slot = if from == latch { &mut next } else { &mut init };
        match *slot {
            None => *slot = Some(arg),
            Some(prev) if prev == arg => {}
            Some(_) => return None,
        }
    }
    let init = arena.fold(init?);
    if !arena.is_constant(init) {
        return None;
    }
    let next = chain_of(arena, func, lp, next?)?;
    if next.phi != value.phi {
        return None;
    }
    Some(Operand::Evolving { value, next, current: init })
}

impl Operand {
    fn value(&self, arena: &mut ExprArena) -> ExprId {
        match self {
            Operand::Fixed(c) => *c,
            Operand::Evolving { value, current, .. } => value.value(arena, *current),
        }
    }

    /// Advance to the next iteration; false when the value stops being constant
    fn advance(&mut self, arena: &mut ExprArena) -> bool {
        match self {
            Operand::Fixed(_) => true,
            Operand::Evolving { next, current, .. } => {
                *current = next.value(arena, *current);
                arena.is_constant(*current)
            }
        }
    }
}

impl NiterAnalyzer<'_> {
    /// Number of iterations of `lp` before `exit` is taken, found by
    /// stepping the loop at most `max_iterations_to_track` times
    pub fn evaluate_by_simulation(&mut self, lp: LoopId, exit: Edge) -> Option<u64> {
        let niter = self.simulate(lp, exit)?.niter?;
        tracing::debug!(header = self.loops.get(lp).header.0, niter, "proved that loop iterates {niter} times");
        Some(niter)
    }

    /// `None` when the exit condition is out of reach of the simulator
    pub(crate) fn simulate(&mut self, lp: LoopId, exit: Edge) -> Option<Simulation> {
        let func = self.func;
        let l = self.loops.get(lp);
        if !l.contains(exit.src) || l.contains(exit.dest) {
            return None;
        }
        let (_, cond) = func.branch_of(exit.src)?;
        let ExprKind::Cmp(op, op0, op1) = self.arena.kind(cond) else {
            return None;
        };
        let op: CmpOp = match exit.kind {
            EdgeKind::True => op.invert(),
            EdgeKind::False => op,
            EdgeKind::Fallthru => return None,
        };

        let arena = &mut *self.arena;
        let mut lhs = operand_for(arena, func, l, op0)?;
        let mut rhs = operand_for(arena, func, l, op1)?;
        let cap = self.config.max_iterations_to_track;

        let mut evaluated = 0;
        for i in 0..=cap {
            evaluated += 1;
            let a = lhs.value(arena);
            let b = rhs.value(arena);
            let stays = arena.fold_cmp(op, a, b);
            if arena.is_false(stays) {
                return Some(Simulation { niter: Some(i), evaluated });
            }
            if !arena.is_true(stays) || !lhs.advance(arena) || !rhs.advance(arena) {
                return None;
            }
        }
        tracing::trace!(cap, "simulation exhausted the iteration cap");
        Some(Simulation { niter: None, evaluated })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NiterConfig;
    use crate::ir::{BinOp, BlockId, DomTree, FunctionBuilder, LoopForest, Type};
    use crate::niter::Estimate;

    struct Built {
        arena: ExprArena,
        func: Function,
        header: BlockId,
    }

    /// `for (i = start; i cmp limit; i = i op k)` over `ty`
    fn irregular_loop(ty: Type, start: i128, cmp: CmpOp, limit: i128, op: BinOp, k: i128) -> Built {
        let mut arena = ExprArena::new();
        let i = arena.new_var("i", ty);
        let inext = arena.new_var("i.next", ty);
        let (iv, inv) = (arena.var(i), arena.var(inext));
        let start = arena.int(ty, start);
        let limit = arena.int(ty, limit);
        let k = arena.int(ty, k);

        let mut fb = FunctionBuilder::new("irregular");
        let entry = fb.add_block("entry");
        let header = fb.add_block("header");
        let latch = fb.add_block("latch");
        let exit = fb.add_block("exit");
        fb.goto(entry, header);
        fb.push(header, StmtKind::Phi { dest: i, args: vec![(entry, start), (latch, inv)] });
        let cond = arena.compare(cmp, iv, limit);
        fb.branch(header, cond, latch, exit);
        let next = arena.binary(op, ty, iv, k);
        fb.push(latch, StmtKind::Assign { dest: inext, value: next });
        fb.goto(latch, header);
        fb.ret(exit, None);
        let func = fb.finish(&arena).expect("valid function");
        Built { arena, func, header }
    }

    #[test]
    fn test_doubling_loop() {
        let Built { mut arena, func, header } = irregular_loop(Type::uint(32), 1, CmpOp::Ne, 64, BinOp::Mul, 2);
        let dom = DomTree::new(&func);
        let mut loops = LoopForest::discover(&func, &dom);
        let lp = loops.innermost_loop_of(header).expect("loop");
        let exit = loops.exit_edges(&func, lp)[0];
        let mut analyzer = NiterAnalyzer::new(&mut arena, &func, &dom, &mut loops, NiterConfig::default());

        assert!(analyzer.number_of_iterations_exit(lp, exit).is_none());
        // i = 1, 2, 4, 8, 16, 32 stay; 64 leaves
        assert_eq!(analyzer.find_loop_niter_by_eval(lp), Some((6, exit)));

        analyzer.estimate_numbers_of_iterations(lp);
        assert_eq!(analyzer.loops().get(lp).estimate, Estimate::Constant(6));
    }

    #[test]
    fn test_equality_exit() {
        // Stays while i == 3, so the second test leaves
        let Built { mut arena, func, header } = irregular_loop(Type::sint(8), 3, CmpOp::Eq, 3, BinOp::Add, 1);
        let dom = DomTree::new(&func);
        let mut loops = LoopForest::discover(&func, &dom);
        let lp = loops.innermost_loop_of(header).expect("loop");
        let exit = loops.exit_edges(&func, lp)[0];
        let mut analyzer = NiterAnalyzer::new(&mut arena, &func, &dom, &mut loops, NiterConfig::default());
        assert_eq!(analyzer.evaluate_by_simulation(lp, exit), Some(1));
    }

    #[test]
    fn test_cap_bounds_the_work() {
        let Built { mut arena, func, header } = irregular_loop(Type::sint(32), 0, CmpOp::Ne, 5000, BinOp::Add, 1);
        let dom = DomTree::new(&func);
        let mut loops = LoopForest::discover(&func, &dom);
        let lp = loops.innermost_loop_of(header).expect("loop");
        let exit = loops.exit_edges(&func, lp)[0];

        let config = NiterConfig { max_iterations_to_track: 100, ..NiterConfig::default() };
        let mut analyzer = NiterAnalyzer::new(&mut arena, &func, &dom, &mut loops, config);
        let sim = analyzer.simulate(lp, exit).expect("simulable");
        assert_eq!(sim, Simulation { niter: None, evaluated: 101 });
        assert_eq!(analyzer.evaluate_by_simulation(lp, exit), None);

        let config = NiterConfig { max_iterations_to_track: 5000, ..NiterConfig::default() };
        let mut analyzer = NiterAnalyzer::new(&mut arena, &func, &dom, &mut loops, config);
        assert_eq!(analyzer.evaluate_by_simulation(lp, exit), Some(5000));
    }

    #[test]
    fn test_memory_in_chain_disqualifies() {
        let mut arena = ExprArena::new();
        let ty = Type::sint(32);
        let p = arena.new_var("p", Type::ptr(64));
        let i = arena.new_var("i", ty);
        let x = arena.new_var("x", ty);
        let inext = arena.new_var("i.next", ty);
        let (pv, iv, xv, inv) = (arena.var(p), arena.var(i), arena.var(x), arena.var(inext));
        let zero = arena.int(ty, 0);
        let one = arena.int(ty, 1);
        let ten = arena.int(ty, 10);

        let mut fb = FunctionBuilder::new("loads");
        fb.add_param(p);
        let entry = fb.add_block("entry");
        let header = fb.add_block("header");
        let latch = fb.add_block("latch");
        let exit = fb.add_block("exit");
        fb.goto(entry, header);
        fb.push(header, StmtKind::Phi { dest: i, args: vec![(entry, zero), (latch, inv)] });
        fb.push(header, StmtKind::Load { dest: x, addr: pv });
        let cond = arena.compare(CmpOp::Lt, xv, ten);
        fb.branch(header, cond, latch, exit);
        let next = arena.binary(BinOp::Add, ty, iv, one);
        fb.push(latch, StmtKind::Assign { dest: inext, value: next });
        fb.goto(latch, header);
        fb.ret(exit, None);
        let func = fb.finish(&arena).expect("valid function");

        let dom = DomTree::new(&func);
        let mut loops = LoopForest::discover(&func, &dom);
        let lp = loops.innermost_loop_of(header).expect("loop");
        let exit = loops.exit_edges(&func, lp)[0];
        let mut analyzer = NiterAnalyzer::new(&mut arena, &func, &dom, &mut loops, NiterConfig::default());
        assert!(analyzer.simulate(lp, exit).is_none());
        assert_eq!(analyzer.find_loop_niter_by_eval(lp), None);
    }
}
