//! Solver for `!=` exits
//!
//! The staying condition `base0 + step * i != base1` becomes
//! `step * i ≡ c (mod 2^w)` with `c = base1 - base0`; the smallest solution
//! is found in closed form through a modular inverse.

use super::NiterDescriptor;
use crate::ir::{BinOp, CmpOp, ExprArena, ExprId, Type, low_bits_mask};

/// Multiplicative inverse of the odd `s` modulo `mask + 1`, where `mask` is
/// a low-bits mask
///
/// Squares `s` once per bit of the modulus; `s^(2^k - 1)` is the inverse of
/// an odd `s` modulo `2^k`.
pub fn inverse(s: u64, mask: u64) -> u64 {
    debug_assert!(s & 1 == 1, "only odd values are invertible modulo 2^k");
    let rounds = u64::BITS - mask.leading_zeros();
    let mut result: u64 = 1;
    let mut base = s;
    for _ in 0..rounds {
        result = result.wrapping_mul(base);
        base = base.wrapping_mul(base);
    }
    result & mask
}

/// Solve `step * i ≡ c` in `niter_ty`
///
/// `c` must already have type `niter_ty`; `step` is a nonzero bit pattern of
/// that width. Unsolvable instances are reported through the assumption
/// `c % 2^tz(step) == 0`.
pub fn solve_ne(arena: &mut ExprArena, niter_ty: Type, c: ExprId, step: u64) -> NiterDescriptor {
    debug_assert!(!niter_ty.signed && !niter_ty.pointer);
    let width = niter_ty.bits as u32;
    let mut step = step & niter_ty.mask();
    debug_assert!(step != 0, "zero step reached the `!=` solver");
    let mut c = c;

    // Make the step positive; the solution set of -s·i ≡ -c is the same
    if niter_ty.signed_value_of(step) < 0 {
        step = step.wrapping_neg() & niter_ty.mask();
        c = arena.fold_neg(niter_ty, c);
    }

    let bits = step.trailing_zeros().min(width - 1);
    let d = arena.constant(niter_ty, 1u64 << bits);
    let s = step >> bits;
    let bound = low_bits_mask(width - bits);

    let remainder = arena.fold_binary(BinOp::FloorMod, niter_ty, c, d);
    let zero = arena.constant(niter_ty, 0);
    let assumptions = arena.fold_cmp(CmpOp::Eq, remainder, zero);

    let quotient = arena.fold_binary(BinOp::ExactDiv, niter_ty, c, d);
    let inv = arena.constant(niter_ty, inverse(s, bound));
    let product = arena.fold_mul(niter_ty, quotient, inv);
    let mask = arena.constant(niter_ty, bound);
    let niter = arena.fold_binary(BinOp::BitAnd, niter_ty, product, mask);

    tracing::trace!(
        step,
        bits,
        niter = %arena.display(niter),
        "solved modular equation"
    );

    NiterDescriptor {
        niter,
        assumptions,
        may_be_zero: arena.boolean(false),
        additional_info: arena.boolean(true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inverse_small_moduli() {
        assert_eq!(inverse(1, 1), 1);
        assert_eq!(inverse(3, 3), 3);
        assert_eq!(inverse(3, 0xff), 171);
        assert_eq!((7u64.wrapping_mul(inverse(7, u64::MAX))), 1);
    }

    #[test]
    fn test_inverse_exhaustive_small_widths() {
        for k in 1..=12u32 {
            let mask = low_bits_mask(k);
            for s in (1..=mask).step_by(2) {
                assert_eq!(s.wrapping_mul(inverse(s, mask)) & mask, 1, "s = {s}, k = {k}");
            }
        }
    }

    #[test]
    fn test_constant_equation() {
        let mut arena = ExprArena::new();
        let ty = Type::uint(8);
        // 6·i ≡ 4 (mod 256): i = 86 is the smallest solution
        let c = arena.constant(ty, 4);
        let desc = solve_ne(&mut arena, ty, c, 6);
        assert!(arena.is_true(desc.assumptions));
        let i = arena.const_value(desc.niter).expect("constant");
        assert_eq!((6 * i) & 0xff, 4);
        assert_eq!(i, 86);
    }

    #[test]
    fn test_unsolvable_equation_is_an_assumption() {
        let mut arena = ExprArena::new();
        let ty = Type::uint(8);
        let c = arena.constant(ty, 3);
        let desc = solve_ne(&mut arena, ty, c, 2);
        assert!(arena.is_false(desc.assumptions));
    }

    #[test]
    fn test_negative_step_counts_down() {
        let mut arena = ExprArena::new();
        let ty = Type::uint(32);
        // i starts at 10 and moves by -1 toward 0: c = 0 - 10
        let c = arena.constant(ty, 10u64.wrapping_neg());
        let desc = solve_ne(&mut arena, ty, c, ty.mask());
        assert_eq!(arena.const_value(desc.niter), Some(10));
    }

    #[test]
    fn test_symbolic_stride() {
        let mut arena = ExprArena::new();
        let ty = Type::uint(32);
        let n = arena.new_var("n", ty);
        let nv = arena.var(n);
        let desc = solve_ne(&mut arena, ty, nv, 4);
        assert_eq!(arena.display(desc.niter).to_string(), "n / 4");
        assert_eq!(arena.display(desc.assumptions).to_string(), "(n % 4) == 0");
    }
}
