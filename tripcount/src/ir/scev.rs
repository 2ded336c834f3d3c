//! Induction-variable recognition
//!
//! `simple_iv` describes the value of an expression at a statement of a loop
//! as `base + step * i`, where `i` counts the completed iterations of that
//! loop, `base` is loop invariant and `step` is a compile-time constant.

use super::fold::{STACK_GROW_SIZE, STACK_RED_ZONE};
use super::{
    BinOp, BlockId, ExprArena, ExprId, ExprKind, Function, LoopForest, LoopId, StmtId, StmtKind, UnOp, VarId,
};
use std::collections::HashSet;

/// `base + step * i`; `step == None` means the value is loop invariant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AffineIv {
    pub base: ExprId,
    pub step: Option<ExprId>,
}

/// Evolution of a value in the loop, step as a bit pattern of its width
#[derive(Debug, Clone, Copy)]
struct Evolution {
    base: ExprId,
    step: u64,
}

struct Analyzer<'a> {
    arena: &'a mut ExprArena,
    func: &'a Function,
    loops: &'a LoopForest,
    lp: LoopId,
    /// Header phis under evaluation, read as symbols
    bound: HashSet<VarId>,
}

/// Recognize `expr`, evaluated at `at_stmt`, as an affine function of the
/// iteration count of `lp`
pub fn simple_iv(
    arena: &mut ExprArena,
    func: &Function,
    loops: &LoopForest,
    lp: LoopId,
    at_stmt: StmtId,
    expr: ExprId,
) -> Option<AffineIv> {
    if !loops.contains(lp, func.stmt(at_stmt).block) {
        return None;
    }
    let ty = arena.ty(expr);
    let mut analyzer = Analyzer { arena, func, loops, lp, bound: HashSet::new() };
    let evolution = analyzer.evolve(expr)?;
    let base = analyzer.arena.fold(evolution.base);
    let step = (evolution.step != 0).then(|| {
        let step_ty = if ty.pointer { ty.unsigned() } else { ty };
        analyzer.arena.constant(step_ty, evolution.step)
    });
    Some(AffineIv { base, step })
}

impl Analyzer<'_> {
    fn invariant(&self, base: ExprId) -> Evolution {
        Evolution { base, step: 0 }
    }

    fn evolve(&mut self, expr: ExprId) -> Option<Evolution> {
        stacker::maybe_grow(STACK_RED_ZONE, STACK_GROW_SIZE, || self.evolve_inner(expr))
    }

    fn evolve_inner(&mut self, expr: ExprId) -> Option<Evolution> {
        let node = self.arena.node(expr);
        let ty = node.ty;
        let mask = ty.mask();
        match node.kind {
            ExprKind::Const(_) => Some(self.invariant(expr)),
            ExprKind::Var(var) => self.evolve_var(var, expr),
            ExprKind::Binary(op @ (BinOp::Add | BinOp::Sub), a, b) => {
                let ea = self.evolve(a)?;
                let eb = self.evolve(b)?;
                let base = self.arena.fold_binary(op, ty, ea.base, eb.base);
                let step = if op == BinOp::Add { ea.step.wrapping_add(eb.step) } else { ea.step.wrapping_sub(eb.step) };
                Some(Evolution { base, step: step & mask })
            }
            ExprKind::Binary(op @ (BinOp::Mul | BinOp::Shl), a, b) => {
                let ea = self.evolve(a)?;
                let eb = self.evolve(b)?;
                let base = self.arena.fold_binary(op, ty, ea.base, eb.base);
                if ea.step == 0 && eb.step == 0 {
                    return Some(self.invariant(base));
                }
                let arena: &ExprArena = self.arena;
                let constant = |e: Evolution| if e.step == 0 { arena.const_value(e.base) } else { None };
                let step = match op {
                    BinOp::Shl => {
                        let k = constant(eb).filter(|&k| k < ty.bits as u64)?;
                        ea.step.wrapping_mul(1u64 << k)
                    }
                    _ => match (constant(ea), constant(eb)) {
                        (_, Some(c)) => ea.step.wrapping_mul(c),
                        (Some(c), _) => eb.step.wrapping_mul(c),
                        _ => return None,
                    },
                };
                Some(Evolution { base, step: step & mask })
            }
            ExprKind::Unary(UnOp::Neg, a) => {
                let ea = self.evolve(a)?;
                let base = self.arena.fold_neg(ty, ea.base);
                Some(Evolution { base, step: 0u64.wrapping_sub(ea.step) & mask })
            }
            ExprKind::Cast(a) => {
                let ea = self.evolve(a)?;
                let from = self.arena.ty(a);
                if ea.step != 0 && from.bits != ty.bits {
                    return None;
                }
                let base = self.arena.fold_cast(ty, ea.base);
                Some(Evolution { base, step: ea.step & mask })
            }
            _ => {
                // Any other operator is only affine when all operands are invariant
                let ops = self.arena.operands(expr);
                let mut bases = Vec::with_capacity(ops.len());
                for op in ops {
                    let e = self.evolve(op)?;
                    if e.step != 0 {
                        return None;
                    }
                    bases.push(e.base);
                }
                let rebuilt = self.arena.with_operands(expr, &bases);
                let base = self.arena.fold(rebuilt);
                Some(self.invariant(base))
            }
        }
    }

    fn evolve_var(&mut self, var: VarId, expr: ExprId) -> Option<Evolution> {
        if self.bound.contains(&var) {
            return Some(self.invariant(expr));
        }
        let func = self.func;
        let Some(def) = func.def_stmt(var) else {
            return Some(self.invariant(expr));
        };
        let stmt = func.stmt(def);
        let loops = self.loops;
        let lp = loops.get(self.lp);
        if !lp.contains(stmt.block) {
            return Some(self.invariant(expr));
        }
        match &stmt.kind {
            StmtKind::Assign { value, .. } => self.evolve(*value),
            StmtKind::Phi { args, .. } if stmt.block == lp.header => self.evolve_header_phi(var, expr, args),
            _ => None,
        }
    }

    fn evolve_header_phi(&mut self, var: VarId, expr: ExprId, args: &[(BlockId, ExprId)]) -> Option<Evolution> {
        let loops = self.loops;
        let lp = loops.get(self.lp);
        let mut entry_value = None;
        let mut latch_value = None;
        for &(from, value) in args {
            let slot = if lp.contains(from) { &mut latch_value } else { &mut entry_value };
            match *slot {
                None => *slot = Some(value),
                Some(prev) if prev == value => {}
                Some(_) => return None,
            }
        }
        let (entry_value, latch_value) = (entry_value?, latch_value?);

        let init = self.evolve(entry_value)?;
        if init.step != 0 {
            return None;
        }

        self.bound.insert(var);
        let next = self.evolve(latch_value);
        self.bound.remove(&var);
        let next = next?;
        if next.step != 0 {
            return None;
        }
        let step = self.arena.constant_difference(next.base, expr)?;
        Some(Evolution { base: init.base, step })
    }
}
