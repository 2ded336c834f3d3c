//! Exit-condition normalization
//!
//! Brings the staying condition `base0 + step0 * i  cmp  base1 + step1 * i`
//! into one of two solvable shapes. `>`/`>=` are mirrored to `<`/`<=`, `<`
//! is tightened to `<=`, and `<=` is rewritten to `!=` whenever the distance
//! between the bounds is a known multiple of the step plus a constant.

use super::{NiterDescriptor, solve_le, solve_ne};
use crate::ir::{AffineIv, BinOp, CmpOp, ExprArena, ExprId, Type};

/// Step of an IV as a bit pattern, 0 when invariant; `None` when symbolic
fn step_bits(arena: &ExprArena, step: Option<ExprId>) -> Option<u64> {
    match step {
        None => Some(0),
        Some(step) => arena.const_value(step),
    }
}

/// Iteration count for the staying condition `iv0 cmp iv1` over `ty`
///
/// `None` when the condition has no supported shape: both sides invariant,
/// a step moving away from the bound, two moving sides under an ordering
/// comparison, or `==`.
pub fn analyze_exit(
    arena: &mut ExprArena,
    ty: Type,
    iv0: AffineIv,
    cmp: CmpOp,
    iv1: AffineIv,
) -> Option<NiterDescriptor> {
    if !ty.is_integer() && !ty.pointer {
        return None;
    }
    let (iv0, cmp, iv1) = match cmp {
        CmpOp::Gt | CmpOp::Ge => (iv1, cmp.swap(), iv0),
        CmpOp::Eq => return None,
        _ => (iv0, cmp, iv1),
    };
    let mask = ty.mask();
    let mut s0 = step_bits(arena, iv0.step)?;
    let mut s1 = step_bits(arena, iv1.step)?;
    let (mut base0, mut base1) = (iv0.base, iv1.base);
    let mut cmp = cmp;

    // Two moving sides only make sense for `!=`, where only the relative
    // speed matters
    if s0 != 0 && s1 != 0 {
        if cmp != CmpOp::Ne {
            tracing::trace!("both sides of an ordering exit move");
            return None;
        }
        s0 = s0.wrapping_sub(s1) & mask;
        s1 = 0;
    }
    if s0 == 0 && s1 == 0 {
        return None;
    }

    let negative = |s: u64| ty.signed_value_of(s) < 0;
    if cmp != CmpOp::Ne && (negative(s0) || (s1 != 0 && !negative(s1))) {
        tracing::trace!("induction variable moves away from the bound");
        return None;
    }

    // Pointer arithmetic never overflows
    let (mmin, mmax) = if ty.pointer { (None, None) } else { (Some(ty.min_value()), Some(ty.max_value())) };
    let offset_ty = if ty.pointer { ty.unsigned() } else { ty };
    let niter_ty = ty.unsigned();

    let mut assumptions = arena.boolean(true);
    let mut noloop = arena.boolean(false);
    let mut was_sharp = false;

    if cmp == CmpOp::Lt {
        let one = arena.constant(offset_ty, 1);
        let assumption = if s0 == 0 {
            // base0 < base1 - s·i: base0 + 1 overflows exactly when base0 is the maximum
            let assumption = match mmax {
                Some(max) => {
                    let max = arena.int(ty, max);
                    arena.fold_cmp(CmpOp::Eq, base0, max)
                }
                None => arena.boolean(false),
            };
            if !arena.is_true(assumption) {
                base0 = arena.fold_add(ty, base0, one);
            }
            assumption
        } else {
            let assumption = match mmin {
                Some(min) => {
                    let min = arena.int(ty, min);
                    arena.fold_cmp(CmpOp::Eq, base1, min)
                }
                None => arena.boolean(false),
            };
            if !arena.is_true(assumption) {
                base1 = arena.fold_sub(ty, base1, one);
            }
            assumption
        };
        if arena.is_true(assumption) {
            tracing::debug!("`<` bound at the type's extreme: loop never runs");
            return Some(NiterDescriptor::zero(arena, niter_ty));
        }
        noloop = assumption;
        cmp = CmpOp::Le;
        was_sharp = true;
    }

    if cmp == CmpOp::Le {
        // x <= max and min <= x never fail
        let lower_at_min = mmin.is_some() && arena.const_int(base0) == mmin;
        let upper_at_max = mmax.is_some() && arena.const_int(base1) == mmax;
        if (s0 == 0 && lower_at_min) || (s1 == 0 && upper_at_max) {
            tracing::trace!("exit condition is always true");
            return None;
        }

        if let Some(xform) = promote_to_ne(arena, ty, base0, s0, base1, s1, was_sharp, mmin, mmax) {
            if !arena.is_true(xform.may_xform) {
                assumptions = xform.may_xform;
            }
            base0 = xform.base0;
            base1 = xform.base1;
            let crossed = arena.fold_cmp(CmpOp::Gt, base0, base1);
            noloop = arena.fold_or(noloop, crossed);
            cmp = CmpOp::Ne;
            tracing::debug!(
                base0 = %arena.display(base0),
                base1 = %arena.display(base1),
                "rewrote `<=` exit as `!=`"
            );
        }
    }

    if arena.is_true(noloop) {
        tracing::debug!("loop provably does not roll");
        return Some(NiterDescriptor::zero(arena, niter_ty));
    }

    let desc = if cmp == CmpOp::Ne {
        let b1 = arena.fold_cast(niter_ty, base1);
        let b0 = arena.fold_cast(niter_ty, base0);
        let c = arena.fold_sub(niter_ty, b1, b0);
        let step = if s1 == 0 { s0 } else { s1.wrapping_neg() & mask };
        tracing::trace!(c = %arena.display(c), step, "dispatching to the `!=` solver");
        solve_ne(arena, niter_ty, c, step)
    } else {
        tracing::trace!("dispatching to the `<=` solver");
        solve_le(arena, ty, base0, s0, base1, s1)
    };

    let assumptions = arena.fold_and(assumptions, desc.assumptions);
    let may_be_zero = arena.fold_or(noloop, desc.may_be_zero);
    if arena.is_true(may_be_zero) {
        return Some(NiterDescriptor::zero(arena, niter_ty));
    }
    Some(NiterDescriptor { niter: desc.niter, assumptions, may_be_zero, additional_info: desc.additional_info })
}

/// Bounds of the `!=` form of a `<=` condition, and the condition under
/// which the rewrite is exact
struct NeForm {
    base0: ExprId,
    base1: ExprId,
    may_xform: ExprId,
}

/// Rewrite `base0 + s0·i <= base1 + s1·i` (one side moving) as `!=`
///
/// The moving side must hit the other bound exactly, so the invariant bound
/// is moved to the last value the IV takes plus one step. That needs
/// `(base1 - base0) mod step` as a known constant, and is exact only when the
/// moved bound does not overflow.
#[allow(clippy::too_many_arguments)]
fn promote_to_ne(
    arena: &mut ExprArena,
    ty: Type,
    base0: ExprId,
    s0: u64,
    base1: ExprId,
    s1: u64,
    was_sharp: bool,
    mmin: Option<i128>,
    mmax: Option<i128>,
) -> Option<NeForm> {
    let step_bits = if s0 == 0 { s1.wrapping_neg() & ty.mask() } else { s0 };
    let step = ty.signed_value_of(step_bits);

    // (base1 - base0) mod step. A difference wrapped around 2^bits keeps its
    // residue only for power-of-two steps; otherwise both bounds must be known.
    let delta = match (arena.const_int(base0), arena.const_int(base1)) {
        (Some(v0), Some(v1)) => (v1 - v0).rem_euclid(step),
        _ if step_bits.is_power_of_two() => {
            let uty = ty.unsigned();
            let b1 = arena.fold_cast(uty, base1);
            let b0 = arena.fold_cast(uty, base0);
            let diff = arena.fold_sub(uty, b1, b0);
            let modulus = arena.constant(uty, step_bits);
            let delta = arena.fold_binary(BinOp::FloorMod, uty, diff, modulus);
            arena.const_int(delta)?
        }
        _ => return None,
    };

    let may_xform = if was_sharp && delta == step - 1 {
        // The `<` tightening already excluded the overflow
        arena.boolean(true)
    } else if s0 == 0 {
        match mmin {
            None => arena.boolean(true),
            Some(min) => {
                let bound = arena.int(ty, min + step - delta);
                arena.fold_cmp(CmpOp::Le, bound, base0)
            }
        }
    } else {
        match mmax {
            None => arena.boolean(true),
            Some(max) => {
                let bound = arena.int(ty, max - step + delta);
                arena.fold_cmp(CmpOp::Le, base1, bound)
            }
        }
    };
    if arena.is_false(may_xform) {
        return None;
    }

    let offset_ty = if ty.pointer { ty.unsigned() } else { ty };
    let (base0, base1) = if s0 == 0 {
        let shift = arena.int(offset_ty, delta - step);
        (arena.fold_add(ty, base0, shift), base1)
    } else {
        let shift = arena.int(offset_ty, step - delta);
        (base0, arena.fold_add(ty, base1, shift))
    };
    Some(NeForm { base0, base1, may_xform })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iv(arena: &mut ExprArena, ty: Type, base: i128, step: i128) -> AffineIv {
        let base = arena.int(ty, base);
        let step_ty = if ty.pointer { ty.unsigned() } else { ty };
        let step = (step != 0).then(|| arena.int(step_ty, step));
        AffineIv { base, step }
    }

    fn invariant(base: ExprId) -> AffineIv {
        AffineIv { base, step: None }
    }

    #[test]
    fn test_constant_sharp_bound() {
        let mut arena = ExprArena::new();
        let ty = Type::sint(32);
        let i = iv(&mut arena, ty, 0, 1);
        let ten = iv(&mut arena, ty, 10, 0);
        let desc = analyze_exit(&mut arena, ty, i, CmpOp::Lt, ten).expect("countable");
        assert_eq!(arena.const_value(desc.niter), Some(10));
        assert!(arena.is_true(desc.assumptions));
        assert!(arena.is_false(desc.may_be_zero));
        assert_eq!(arena.ty(desc.niter), Type::uint(32));
    }

    #[test]
    fn test_loop_that_never_runs() {
        let mut arena = ExprArena::new();
        let ty = Type::uint(32);
        let i = iv(&mut arena, ty, 10, 1);
        let five = iv(&mut arena, ty, 5, 0);
        let desc = analyze_exit(&mut arena, ty, i, CmpOp::Lt, five).expect("countable");
        assert!(arena.is_zero(desc.niter));
        assert!(arena.is_true(desc.may_be_zero));
        assert!(arena.is_true(desc.assumptions));
    }

    #[test]
    fn test_bound_at_minimum_short_circuits() {
        let mut arena = ExprArena::new();
        let ty = Type::uint(8);
        let i = iv(&mut arena, ty, 3, 1);
        let zero = iv(&mut arena, ty, 0, 0);
        let desc = analyze_exit(&mut arena, ty, i, CmpOp::Lt, zero).expect("countable");
        assert!(arena.is_true(desc.may_be_zero));
    }

    #[test]
    fn test_mirrored_comparison_counts_down() {
        let mut arena = ExprArena::new();
        let ty = Type::uint(32);
        let n = arena.new_var("n", ty);
        let nv = arena.var(n);
        let minus_one = arena.constant(ty, ty.mask());
        let i = AffineIv { base: nv, step: Some(minus_one) };
        let zero = iv(&mut arena, ty, 0, 0);
        // while (i > 0) i--
        let desc = analyze_exit(&mut arena, ty, i, CmpOp::Gt, zero).expect("countable");
        assert_eq!(desc.niter, nv);
        assert!(arena.is_true(desc.assumptions));
        assert!(arena.is_false(desc.may_be_zero));
    }

    #[test]
    fn test_symbolic_signed_bound() {
        let mut arena = ExprArena::new();
        let ty = Type::sint(32);
        let n = arena.new_var("n", ty);
        let nv = arena.var(n);
        let i = iv(&mut arena, ty, 0, 1);
        let desc = analyze_exit(&mut arena, ty, i, CmpOp::Lt, invariant(nv)).expect("countable");
        assert_eq!(arena.display(desc.niter).to_string(), "(u32) n");
        assert_eq!(arena.display(desc.may_be_zero).to_string(), "n < 0");
        assert!(arena.is_true(desc.assumptions));
    }

    #[test]
    fn test_unpromotable_stride_uses_range_solver() {
        let mut arena = ExprArena::new();
        let ty = Type::sint(32);
        let n = arena.new_var("n", ty);
        let nv = arena.var(n);
        let i = iv(&mut arena, ty, 0, 3);
        let desc = analyze_exit(&mut arena, ty, i, CmpOp::Le, invariant(nv)).expect("countable");
        assert!(!arena.is_constant(desc.assumptions));
        assert_eq!(arena.ty(desc.niter), Type::uint(32));
        let mut env = std::collections::HashMap::new();
        env.insert(n, 10);
        // i = 0, 3, 6, 9 stay; the formula counts the steps before 12
        assert_eq!(arena.evaluate(desc.niter, &env), Some(4));
        assert_eq!(arena.evaluate(desc.may_be_zero, &env), Some(0));
    }

    #[test]
    fn test_rejected_shapes() {
        let mut arena = ExprArena::new();
        let ty = Type::sint(32);
        let a = iv(&mut arena, ty, 0, 1);
        let b = iv(&mut arena, ty, 100, 2);
        let c = iv(&mut arena, ty, 5, 0);
        let up = iv(&mut arena, ty, 0, -1);
        assert!(analyze_exit(&mut arena, ty, a, CmpOp::Lt, b).is_none());
        assert!(analyze_exit(&mut arena, ty, c, CmpOp::Ne, c).is_none());
        assert!(analyze_exit(&mut arena, ty, a, CmpOp::Eq, c).is_none());
        assert!(analyze_exit(&mut arena, ty, up, CmpOp::Lt, c).is_none());
        assert!(analyze_exit(&mut arena, Type::BOOL, a, CmpOp::Ne, c).is_none());
    }

    #[test]
    fn test_two_moving_sides_under_ne() {
        let mut arena = ExprArena::new();
        let ty = Type::uint(8);
        let a = iv(&mut arena, ty, 0, 3);
        let b = iv(&mut arena, ty, 10, 1);
        // 0 + 3i != 10 + i  ⇔  2i != 10
        let desc = analyze_exit(&mut arena, ty, a, CmpOp::Ne, b).expect("countable");
        assert_eq!(arena.const_value(desc.niter), Some(5));
        assert!(arena.is_true(desc.assumptions));
    }

    #[test]
    fn test_pointer_walk() {
        let mut arena = ExprArena::new();
        let ty = Type::ptr(64);
        let buf = arena.new_var("buf", ty);
        let len = arena.new_var("len", Type::uint(64));
        let bv = arena.var(buf);
        let lv = arena.var(len);
        let end = arena.binary(BinOp::Add, ty, bv, lv);
        let eight = arena.constant(Type::uint(64), 8);
        let p = AffineIv { base: bv, step: Some(eight) };
        let desc = analyze_exit(&mut arena, ty, p, CmpOp::Ne, invariant(end)).expect("countable");
        assert_eq!(arena.display(desc.niter).to_string(), "len / 8");
        assert_eq!(arena.display(desc.assumptions).to_string(), "(len % 8) == 0");
    }
}
