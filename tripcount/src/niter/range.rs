//! Solver for `<=` exits that could not be rewritten as `!=`
//!
//! With one side moving by `s` per iteration, the loop runs
//! `floor((upper + s - lower) / s)` times, provided the extended bound does
//! not overflow and the first test passes.

use super::NiterDescriptor;
use crate::ir::{BinOp, CmpOp, ExprArena, ExprId, Type};

/// Count `base0 + s0·i <= base1 + s1·i` where exactly one step is nonzero
/// (`s0` nonnegative or `s1` negative under the signed interpretation)
pub fn solve_le(arena: &mut ExprArena, ty: Type, base0: ExprId, s0: u64, base1: ExprId, s1: u64) -> NiterDescriptor {
    debug_assert!((s0 == 0) != (s1 == 0), "exactly one side of a `<=` exit moves");
    let niter_ty = ty.unsigned();
    let offset_ty = if ty.pointer { niter_ty } else { ty };
    let mut assumptions = arena.boolean(true);

    let (step, may_be_zero, delta) = if s1 == 0 {
        // base0 + s·i <= base1: base1 + s must not overflow
        let step = ty.signed_value_of(s0);
        if !ty.pointer {
            let bound = arena.int(ty, ty.max_value() - step);
            assumptions = arena.fold_cmp(CmpOp::Le, base1, bound);
        }
        let offset = arena.constant(offset_ty, s0);
        let upper = arena.fold_add(ty, base1, offset);
        let may_be_zero = arena.fold_cmp(CmpOp::Gt, base0, upper);
        let upper = arena.fold_cast(niter_ty, upper);
        let lower = arena.fold_cast(niter_ty, base0);
        (step, may_be_zero, arena.fold_sub(niter_ty, upper, lower))
    } else {
        // base0 <= base1 - s·i: base0 - s must not overflow
        let step = -ty.signed_value_of(s1);
        if !ty.pointer {
            let bound = arena.int(ty, ty.min_value() + step);
            assumptions = arena.fold_cmp(CmpOp::Le, bound, base0);
        }
        let offset = arena.constant(offset_ty, s1);
        let lower = arena.fold_add(ty, base0, offset);
        let may_be_zero = arena.fold_cmp(CmpOp::Gt, lower, base1);
        let upper = arena.fold_cast(niter_ty, base1);
        let lower = arena.fold_cast(niter_ty, lower);
        (step, may_be_zero, arena.fold_sub(niter_ty, upper, lower))
    };

    let step = arena.int(niter_ty, step);
    let niter = arena.fold_binary(BinOp::FloorDiv, niter_ty, delta, step);
    tracing::trace!(
        niter = %arena.display(niter),
        assumptions = %arena.display(assumptions),
        "solved `<=` exit by division"
    );

    NiterDescriptor { niter, assumptions, may_be_zero, additional_info: arena.boolean(true) }
}
