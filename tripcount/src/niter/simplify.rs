//! Tightening of descriptors with facts from outside the loop
//!
//! Two best-effort rewrites, both allowed to leave an expression unchanged:
//! values defined before the loop are instantiated and refolded, with the
//! induction variables of enclosing loops bounded by the values they take
//! over those loops' trip counts, and the conditions of the branches that
//! dominate the loop header are used to decide comparisons.

use super::NiterAnalyzer;
use crate::ir::{
    AffineIv, BinOp, BlockId, CmpOp, EdgeKind, ExprArena, ExprId, ExprKind, Function, Loop, LoopId, RangeFacts,
    STACK_GROW_SIZE, STACK_RED_ZONE, StmtKind, VarId, simple_iv,
};
use std::collections::{HashMap, HashSet};

impl NiterAnalyzer<'_> {
    /// Both rewrites in sequence
    pub fn simplify(&mut self, lp: LoopId, expr: ExprId) -> ExprId {
        let expr = self.simplify_using_outer_evolutions(lp, expr);
        let mut used = self.arena.boolean(true);
        self.simplify_using_initial_conditions(lp, expr, &mut used)
    }

    /// Replace values defined outside `lp` by their definitions and refold
    ///
    /// The result is kept only when it folds to a constant, or when the
    /// ranges of the enclosing loops' induction variables decide it.
    pub fn simplify_using_outer_evolutions(&mut self, lp: LoopId, expr: ExprId) -> ExprId {
        let facts = self.outer_evolution_ranges(lp);
        let mut inst = Instantiator {
            arena: &mut *self.arena,
            func: self.func,
            lp: self.loops.get(lp),
            facts: &facts,
            memo: HashMap::new(),
            active: HashSet::new(),
        };
        inst.simplify(expr)
    }

    /// Values the header phis of the loops enclosing `lp` take while `lp`
    /// runs
    ///
    /// A phi is bounded when it is affine in its loop, that loop has a
    /// constant unconditional trip count, and its values over that many
    /// iterations do not wrap.
    pub fn outer_evolution_ranges(&mut self, lp: LoopId) -> RangeFacts {
        if let Some(facts) = self.outer_ranges.get(&lp) {
            return facts.clone();
        }
        let header = self.loops.get(lp).header;
        let mut facts = RangeFacts::new();
        let mut outer = self.loops.get(lp).parent;
        while let Some(anc) = outer {
            if let Some(last) = self.last_iteration_reaching(anc, header) {
                self.bound_header_phis(anc, last, &mut facts);
            }
            outer = self.loops.get(anc).parent;
        }
        self.outer_ranges.insert(lp, facts.clone());
        facts
    }

    /// Last iteration of `lp` in which `block` can run, from the constant
    /// counts of its exits
    fn last_iteration_reaching(&mut self, lp: LoopId, block: BlockId) -> Option<u64> {
        let func = self.func;
        let mut last: Option<u64> = None;
        for exit in self.loops.exit_edges(func, lp) {
            let Some(desc) = self.number_of_iterations_exit(lp, exit) else {
                continue;
            };
            if !desc.is_unconditional(&*self.arena) || !self.arena.is_false(desc.may_be_zero) {
                continue;
            }
            let Some(niter) = self.arena.const_value(desc.niter) else {
                continue;
            };
            // Blocks only the staying edge leads to miss the final test
            let stay = func.succs(exit.src).iter().find(|e| e.dest != exit.dest).map(|e| e.dest);
            let after_test = stay.is_some_and(|s| {
                matches!(func.preds(s), [p] if *p == exit.src) && self.dom.dominates(s, block)
            });
            let k = if after_test { niter.saturating_sub(1) } else { niter };
            last = Some(last.map_or(k, |cur| cur.min(k)));
        }
        last
    }

    fn bound_header_phis(&mut self, lp: LoopId, last: u64, facts: &mut RangeFacts) {
        let func = self.func;
        let header = self.loops.get(lp).header;
        for &stmt in &func.block(header).stmts {
            let StmtKind::Phi { dest, .. } = &func.stmt(stmt).kind else {
                continue;
            };
            let var = self.arena.var(*dest);
            let ty = self.arena.ty(var);
            if !ty.is_integer() {
                continue;
            }
            let Some(AffineIv { base, step: Some(step) }) =
                simple_iv(&mut *self.arena, func, &*self.loops, lp, stmt, var)
            else {
                continue;
            };
            let base = self.simplify_using_outer_evolutions(lp, base);
            let (Some(base), Some(step)) = (self.arena.const_value(base), self.arena.const_value(step)) else {
                continue;
            };
            let first = ty.value_of(base);
            let Some(end) = ty.signed_value_of(step).checked_mul(last as i128).and_then(|d| d.checked_add(first))
            else {
                continue;
            };
            if ty.contains(end) {
                tracing::trace!(
                    var = %self.arena.display(var),
                    lo = first.min(end),
                    hi = first.max(end),
                    "bounded by the enclosing loop's trip count"
                );
                facts.insert(var, (first.min(end), first.max(end)));
            }
        }
    }

    /// Walk the single-predecessor dominators of the loop header and
    /// simplify `expr` under each branch condition
    ///
    /// Every condition that changed `expr` is conjoined into `conds_used`.
    pub fn simplify_using_initial_conditions(&mut self, lp: LoopId, expr: ExprId, conds_used: &mut ExprId) -> ExprId {
        let func = self.func;
        let mut expr = expr;
        let mut block = self.dom.immediate_dominator(self.loops.get(lp).header);

        while let Some(bb) = block {
            if self.arena.is_constant(expr) {
                break;
            }
            let &[pred] = func.preds(bb) else {
                break;
            };
            block = self.dom.immediate_dominator(bb);

            let Some(edge) = func.edge(pred, bb) else {
                continue;
            };
            let Some((_, cond)) = func.branch_of(pred) else {
                continue;
            };
            let cond = match edge.kind {
                EdgeKind::True => cond,
                EdgeKind::False => self.arena.fold_not(cond),
                EdgeKind::Fallthru => continue,
            };

            let simplified = simplify_using_condition(&mut *self.arena, cond, expr);
            if simplified != expr {
                tracing::trace!(
                    cond = %self.arena.display(cond),
                    from = %self.arena.display(expr),
                    to = %self.arena.display(simplified),
                    "simplified under dominating condition"
                );
                *conds_used = self.arena.fold_and(*conds_used, cond);
                expr = simplified;
            }
        }
        expr
    }
}

/// Simplify `expr` knowing that `cond` holds
pub(crate) fn simplify_using_condition(arena: &mut ExprArena, cond: ExprId, expr: ExprId) -> ExprId {
    stacker::maybe_grow(STACK_RED_ZONE, STACK_GROW_SIZE, || simplify_using_condition_inner(arena, cond, expr))
}

fn simplify_using_condition_inner(arena: &mut ExprArena, cond: ExprId, expr: ExprId) -> ExprId {
    match arena.kind(expr) {
        ExprKind::Binary(op @ (BinOp::And | BinOp::Or), a, b) => {
            let na = simplify_using_condition(arena, cond, a);
            let nb = simplify_using_condition(arena, cond, b);
            if (na, nb) != (a, b) {
                return if op == BinOp::And { arena.fold_and(na, nb) } else { arena.fold_or(na, nb) };
            }
        }
        ExprKind::Select(c, a, b) => {
            let nc = simplify_using_condition(arena, cond, c);
            let na = simplify_using_condition(arena, cond, a);
            let nb = simplify_using_condition(arena, cond, b);
            if (nc, na, nb) != (c, a, b) {
                return arena.fold_select(nc, na, nb);
            }
        }
        _ => {}
    }

    // cond: x == y lets either side stand for the other
    if let ExprKind::Cmp(CmpOp::Eq, x, y) = arena.kind(cond) {
        for (from, to) in [(x, y), (y, x)] {
            let replaced = arena.replace(expr, from, to);
            let folded = arena.fold(replaced);
            if arena.is_constant(folded) {
                return folded;
            }
        }
    }

    // expr: x == y (or x != y) contradicts cond when cond fails with x := y
    if let ExprKind::Cmp(op @ (CmpOp::Eq | CmpOp::Ne), x, y) = arena.kind(expr) {
        for (from, to) in [(x, y), (y, x)] {
            let replaced = arena.replace(cond, from, to);
            let folded = arena.fold(replaced);
            if arena.is_false(folded) {
                return arena.boolean(op == CmpOp::Ne);
            }
        }
    }

    if !arena.ty(expr).is_bool() {
        return expr;
    }

    let not_cond = arena.fold_not(cond);
    let implied = arena.fold_or(not_cond, expr);
    if arena.is_true(implied) {
        return implied;
    }
    let contradicted = arena.fold_and(cond, expr);
    if arena.is_false(contradicted) {
        return contradicted;
    }
    expr
}

/// Rewrites variables defined outside one loop into their definitions
struct Instantiator<'b> {
    arena: &'b mut ExprArena,
    func: &'b Function,
    lp: &'b Loop,
    /// Ranges of the enclosing loops' induction variables
    facts: &'b RangeFacts,
    memo: HashMap<VarId, ExprId>,
    /// Variables whose definitions are being expanded
    active: HashSet<VarId>,
}

impl Instantiator<'_> {
    fn simplify(&mut self, expr: ExprId) -> ExprId {
        stacker::maybe_grow(STACK_RED_ZONE, STACK_GROW_SIZE, || self.simplify_inner(expr))
    }

    fn simplify_inner(&mut self, expr: ExprId) -> ExprId {
        match self.arena.kind(expr) {
            ExprKind::Binary(op @ (BinOp::And | BinOp::Or), a, b) => {
                let na = self.simplify(a);
                let nb = self.simplify(b);
                if (na, nb) == (a, b) {
                    return expr;
                }
                return if op == BinOp::And { self.arena.fold_and(na, nb) } else { self.arena.fold_or(na, nb) };
            }
            ExprKind::Select(c, a, b) => {
                let nc = self.simplify(c);
                let na = self.simplify(a);
                let nb = self.simplify(b);
                if (nc, na, nb) == (c, a, b) {
                    return expr;
                }
                return self.arena.fold_select(nc, na, nb);
            }
            _ => {}
        }

        let instantiated = self.instantiate(expr);
        let folded = self.arena.fold(instantiated);
        if self.arena.is_constant(folded) {
            return folded;
        }
        self.decide_with_ranges(folded).unwrap_or(expr)
    }

    /// Constant value of `expr` implied by the enclosing loops' ranges
    fn decide_with_ranges(&mut self, expr: ExprId) -> Option<ExprId> {
        if self.facts.is_empty() {
            return None;
        }
        if let ExprKind::Cmp(op, a, b) = self.arena.kind(expr) {
            let value = self.arena.decide_cmp_under(op, a, b, self.facts)?;
            return Some(self.arena.boolean(value));
        }
        let ty = self.arena.ty(expr);
        if ty.is_bool() {
            return None;
        }
        let (lo, hi) = self.arena.value_range_under(expr, self.facts);
        (lo == hi).then(|| self.arena.int(ty, lo))
    }

    fn instantiate(&mut self, expr: ExprId) -> ExprId {
        let mut map = HashMap::new();
        for var in self.arena.var_uses(expr) {
            if !map.contains_key(&var) {
                let value = self.instantiate_var(var);
                map.insert(var, value);
            }
        }
        self.arena.substitute(expr, &map)
    }

    fn instantiate_var(&mut self, var: VarId) -> ExprId {
        if let Some(&value) = self.memo.get(&var) {
            return value;
        }
        let own = self.arena.var(var);
        if self.active.contains(&var) {
            return own;
        }
        let Some(def) = self.func.def_stmt(var) else {
            return own;
        };
        let func = self.func;
        let stmt = func.stmt(def);
        if self.lp.contains(stmt.block) {
            return own;
        }

        self.active.insert(var);
        let value = stacker::maybe_grow(STACK_RED_ZONE, STACK_GROW_SIZE, || match &stmt.kind {
            StmtKind::Assign { value, .. } => self.instantiate(*value),
            // A merge whose incoming values all agree
            StmtKind::Phi { args, .. } => {
                let mut agreed = None;
                for &(_, arg) in args {
                    if arg == own {
                        continue;
                    }
                    let value = self.instantiate(arg);
                    match agreed {
                        None => agreed = Some(value),
                        Some(prev) if prev == value => {}
                        Some(_) => return own,
                    }
                }
                agreed.unwrap_or(own)
            }
            _ => own,
        });
        self.active.remove(&var);
        self.memo.insert(var, value);
        value
    }
}
