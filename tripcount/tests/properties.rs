//! Property tests for the trip-count engine
//!
//! Descriptors are checked against a direct simulation of the loop they
//! describe, widening approvals against the values the narrow IV takes.

use proptest::prelude::*;
use std::collections::HashMap;
use tripcount::ir::{AffineIv, CmpOp, DomTree, ExprArena, ExprId, LoopForest, Type, low_bits_mask};
use tripcount::niter::{analyze_exit, can_widen_with_bound, inverse};
use tripcount::{NiterAnalyzer, NiterConfig, Program, parse};

const OPS: [CmpOp; 5] = [CmpOp::Lt, CmpOp::Le, CmpOp::Gt, CmpOp::Ge, CmpOp::Ne];

fn affine(arena: &mut ExprArena, ty: Type, base: u64, step: u64) -> AffineIv {
    let base = arena.constant(ty, base);
    let step = (step != 0).then(|| arena.constant(ty, step));
    AffineIv { base, step }
}

/// Value of `base + step * i` in `ty`
fn value_at(ty: Type, base: u64, step: u64, i: u64) -> i128 {
    ty.value_of(base.wrapping_add(step.wrapping_mul(i)))
}

/// Closed-form count for constant IVs, when it holds unconditionally
fn proven_niter(ty: Type, iv0: (u64, u64), cmp: CmpOp, iv1: (u64, u64)) -> Option<u64> {
    let mut arena = ExprArena::new();
    let a = affine(&mut arena, ty, iv0.0, iv0.1);
    let b = affine(&mut arena, ty, iv1.0, iv1.1);
    let desc = analyze_exit(&mut arena, ty, a, cmp, b)?;
    let env = HashMap::new();
    let holds = arena.evaluate(desc.assumptions, &env)? == 1;
    let may_be_zero = arena.evaluate(desc.may_be_zero, &env)? == 1;
    let niter = arena.evaluate(desc.niter, &env)?;
    (holds && !may_be_zero).then_some(niter)
}

fn small_type() -> impl Strategy<Value = Type> {
    (prop_oneof![Just(4u8), Just(8u8)], any::<bool>()).prop_map(|(bits, signed)| Type::int(bits, signed))
}

proptest! {
    #[test]
    fn prop_inverse_of_odd_values(s in any::<u64>(), k in 1u32..=64) {
        let s = s | 1;
        let mask = low_bits_mask(k);
        prop_assert_eq!(s.wrapping_mul(inverse(s, mask)) & mask, 1);
    }

    #[test]
    fn prop_descriptor_matches_simulation(
        ty in small_type(),
        b0 in any::<u64>(),
        s0 in any::<u64>(),
        b1 in any::<u64>(),
        s1 in any::<u64>(),
        op in 0usize..OPS.len(),
    ) {
        let mask = ty.mask();
        let cmp = OPS[op];
        let (b0, b1) = (b0 & mask, b1 & mask);
        let s0 = s0 & mask;
        // Only `!=` supports two moving sides
        let s1 = if cmp != CmpOp::Ne && s0 != 0 { 0 } else { s1 & mask };

        if let Some(niter) = proven_niter(ty, (b0, s0), cmp, (b1, s1)) {
            for i in 0..niter {
                prop_assert!(
                    cmp.evaluate(value_at(ty, b0, s0, i), value_at(ty, b1, s1, i)),
                    "exited early at iteration {} of {}", i, niter
                );
            }
            prop_assert!(
                !cmp.evaluate(value_at(ty, b0, s0, niter), value_at(ty, b1, s1, niter)),
                "still looping after {} iterations", niter
            );
        }
    }

    #[test]
    fn prop_widening_never_overflows_8_bits(
        signed in any::<bool>(),
        base in any::<u8>(),
        step in any::<u8>(),
        bound in any::<u8>(),
        anchor_dominates in any::<bool>(),
    ) {
        let narrow = Type::int(8, signed);
        check_widening(narrow, base as u64, step as u64, bound as u64, anchor_dominates)?;
    }

    #[test]
    fn prop_simplify_is_idempotent(
        leaves in prop::collection::vec((0usize..6, -4i128..9), 1..5),
        conjunctions in prop::collection::vec(any::<bool>(), 4),
    ) {
        check_idempotence(&leaves, &conjunctions)?;
    }
}

/// Approval of a widening implies every IV value up to the bound (one
/// further when the anchor does not dominate the use) fits the narrow type
fn check_widening(narrow: Type, base: u64, step: u64, bound: u64, anchor_dominates: bool) -> Result<(), TestCaseError> {
    let mut arena = ExprArena::new();
    let wide = Type::int(16, narrow.signed);
    let base_e = arena.constant(narrow, base);
    let step_e = arena.constant(narrow, step);
    let bound_e = arena.constant(narrow.unsigned(), bound);
    let always = arena.boolean(true);
    let Some(new_step) = can_widen_with_bound(&mut arena, wide, base_e, step_e, bound_e, always, anchor_dominates)
    else {
        return Ok(());
    };

    let signed_step = narrow.signed_value_of(step);
    prop_assert_eq!(arena.const_int(new_step), Some(signed_step));
    let last = if anchor_dominates { bound } else { bound + 1 };
    let start = narrow.value_of(base);
    for i in 0..=last as i128 {
        let value = start + signed_step * i;
        prop_assert!(narrow.contains(value), "{} overflows {} after {} steps", value, narrow, i);
    }
    Ok(())
}

const GUARDED: &str = "
fn guarded(n: i32) {
entry:
  br n > 0, pre, exit
pre:
  goto header
header:
  i: i32 = phi [pre: 0, latch: i.next]
  br i < n, latch, exit
latch:
  i.next: i32 = i + 1
  goto header
exit:
  return
}
";

fn check_idempotence(leaves: &[(usize, i128)], conjunctions: &[bool]) -> Result<(), TestCaseError> {
    const CMPS: [CmpOp; 6] = [CmpOp::Lt, CmpOp::Le, CmpOp::Gt, CmpOp::Ge, CmpOp::Eq, CmpOp::Ne];
    let Program { mut arena, functions } = parse(GUARDED).expect("IR should parse");
    let func = &functions[0];
    let dom = DomTree::new(func);
    let mut loops = LoopForest::discover(func, &dom);
    let lp = loops.ids().next().expect("one loop");
    let n = func.params[0];

    let mut analyzer = NiterAnalyzer::new(&mut arena, func, &dom, &mut loops, NiterConfig::default());
    let arena = analyzer.arena_mut();
    let nv = arena.var(n);
    let mut expr: Option<ExprId> = None;
    for (index, &(op, k)) in leaves.iter().enumerate() {
        let k = arena.int(Type::sint(32), k);
        let leaf = arena.fold_cmp(CMPS[op], nv, k);
        expr = Some(match expr {
            None => leaf,
            Some(acc) if conjunctions[index % conjunctions.len()] => arena.fold_and(acc, leaf),
            Some(acc) => arena.fold_or(acc, leaf),
        });
    }
    let expr = expr.expect("at least one leaf");

    let once = analyzer.simplify(lp, expr);
    let twice = analyzer.simplify(lp, once);
    prop_assert_eq!(once, twice, "{} is not stable", analyzer.arena().display(once));
    Ok(())
}

#[test]
fn test_widening_exhaustive_4_bits() {
    for signed in [false, true] {
        let narrow = Type::int(4, signed);
        for base in 0..16 {
            for step in 0..16 {
                for bound in 0..16 {
                    for anchor_dominates in [false, true] {
                        check_widening(narrow, base, step, bound, anchor_dominates).expect("sound widening");
                    }
                }
            }
        }
    }
}

#[test]
fn test_inverse_exhaustive_up_to_16_bits() {
    for k in 1..=16u32 {
        let mask = low_bits_mask(k);
        for s in (1..=mask).step_by(2) {
            assert_eq!(s.wrapping_mul(inverse(s, mask)) & mask, 1, "s = {s}, k = {k}");
        }
    }
}

#[test]
fn test_descriptor_exhaustive_4_bits() {
    for signed in [false, true] {
        let ty = Type::int(4, signed);
        for cmp in OPS {
            for b0 in 0..16 {
                for s0 in 0..16 {
                    for b1 in 0..16 {
                        // One moving side for ordering comparisons
                        let s1_range = if cmp == CmpOp::Ne || s0 == 0 { 0..16 } else { 0..1 };
                        for s1 in s1_range {
                            let Some(niter) = proven_niter(ty, (b0, s0), cmp, (b1, s1)) else {
                                continue;
                            };
                            let stays = |i: u64| cmp.evaluate(value_at(ty, b0, s0, i), value_at(ty, b1, s1, i));
                            assert!((0..niter).all(stays), "{cmp:?} {b0}+{s0}i vs {b1}+{s1}i: early exit");
                            assert!(!stays(niter), "{cmp:?} {b0}+{s0}i vs {b1}+{s1}i: niter {niter} too small");
                        }
                    }
                }
            }
        }
    }
}

/// Check a descriptor of `base0 + step0 * i  cmp  base1 + step1 * i` against
/// simulation under every valuation of the variable `n` in `ty`
fn check_symbolic(ty: Type, cmp: CmpOp, iv0: (Option<u64>, u64), iv1: (Option<u64>, u64)) {
    let mut arena = ExprArena::new();
    let n = arena.new_var("n", ty);
    let nv = arena.var(n);
    let mut side = |(base, step): (Option<u64>, u64)| {
        let base = base.map_or(nv, |b| arena.constant(ty, b));
        let step = (step != 0).then(|| arena.constant(ty, step));
        AffineIv { base, step }
    };
    let (a, b) = (side(iv0), side(iv1));
    let Some(desc) = analyze_exit(&mut arena, ty, a, cmp, b) else {
        return;
    };

    for value in 0..=ty.mask() {
        let env = HashMap::from([(n, value)]);
        let mut eval = |e: ExprId| arena.evaluate(e, &env);
        let (Some(holds), Some(may_be_zero), Some(niter)) =
            (eval(desc.assumptions), eval(desc.may_be_zero), eval(desc.niter))
        else {
            continue;
        };
        if holds == 0 || may_be_zero == 1 {
            continue;
        }
        let (b0, b1) = (iv0.0.unwrap_or(value), iv1.0.unwrap_or(value));
        let stays = |i: u64| cmp.evaluate(value_at(ty, b0, iv0.1, i), value_at(ty, b1, iv1.1, i));
        let case = format!("{ty} n = {value}: {cmp:?} {iv0:?} vs {iv1:?}");
        assert!((0..niter).all(stays), "{case}: exits before {niter} iterations");
        assert!(!stays(niter), "{case}: still looping after {niter} iterations");
    }
}

#[test]
fn test_symbolic_base_exhaustive_4_bits() {
    for signed in [false, true] {
        let ty = Type::int(4, signed);
        for cmp in OPS {
            for s0 in 0..16 {
                for k in 0..16 {
                    // The variable as the start of the moving side, then as the bound
                    check_symbolic(ty, cmp, (None, s0), (Some(k), 0));
                    check_symbolic(ty, cmp, (Some(k), s0), (None, 0));
                    check_symbolic(ty, cmp, (Some(k), 0), (None, s0));
                    if cmp == CmpOp::Ne {
                        for s1 in 1..16 {
                            check_symbolic(ty, cmp, (None, s0), (Some(k), s1));
                        }
                    }
                }
            }
        }
    }
}

/// Loop shape for the guarded sweep: start, staying condition and update
/// in the IR, with the same loop simulated directly
struct Shape {
    start: &'static str,
    cond: &'static str,
    next: &'static str,
    /// `None` starts from `n`
    first: Option<i128>,
    step: i128,
    /// Staying condition on `(i, n)`
    stays: fn(i128, i128) -> bool,
}

fn shapes() -> Vec<Shape> {
    vec![
        Shape { start: "0", cond: "i < n", next: "i + 1", first: Some(0), step: 1, stays: |i, n| i < n },
        Shape { start: "1", cond: "i < n", next: "i + 3", first: Some(1), step: 3, stays: |i, n| i < n },
        Shape { start: "0", cond: "i <= n", next: "i + 2", first: Some(0), step: 2, stays: |i, n| i <= n },
        Shape { start: "n", cond: "i > 0", next: "i - 1", first: None, step: -1, stays: |i, _| i > 0 },
        Shape { start: "0", cond: "n != i", next: "i + 1", first: Some(0), step: 1, stays: |i, n| n != i },
    ]
}

const GUARDS: [(CmpOp, &str); 5] =
    [(CmpOp::Gt, ">"), (CmpOp::Ge, ">="), (CmpOp::Lt, "<"), (CmpOp::Le, "<="), (CmpOp::Ne, "!=")];

#[test]
fn test_guarded_loops_against_simulation() {
    for (ty_name, ty) in [("i8", Type::int(8, true)), ("u8", Type::int(8, false))] {
        for (guard_op, guard) in GUARDS {
            for k in [0i128, 1, 5] {
                for shape in &shapes() {
                    check_guarded(ty_name, ty, guard_op, guard, k, shape);
                }
            }
        }
    }
}

fn check_guarded(ty_name: &str, ty: Type, guard_op: CmpOp, guard: &str, k: i128, shape: &Shape) {
    let source = format!(
        "
fn guarded(n: {ty_name}) {{
entry:
  br n {guard} {k}, pre, exit
pre:
  goto header
header:
  i: {ty_name} = phi [pre: {start}, latch: i.next]
  br {cond}, latch, exit
latch:
  i.next: {ty_name} = {next}
  goto header
exit:
  return
}}
",
        start = shape.start,
        cond = shape.cond,
        next = shape.next,
    );
    let Program { mut arena, functions } = parse(&source).expect("IR should parse");
    let func = &functions[0];
    let n = func.params[0];
    let dom = DomTree::new(func);
    let mut loops = LoopForest::discover(func, &dom);
    let lp = loops.ids().next().expect("one loop");
    let exit = loops.exit_edges(func, lp)[0];
    let mut analyzer = NiterAnalyzer::new(&mut arena, func, &dom, &mut loops, NiterConfig::default());
    let Some(desc) = analyzer.number_of_iterations_exit(lp, exit) else {
        return;
    };
    let arena = analyzer.arena_mut();

    for bits in 0..=ty.mask() {
        let value = ty.value_of(bits);
        if !guard_op.evaluate(value, k) {
            continue;
        }
        let env = HashMap::from([(n, bits)]);
        let case = format!("{ty_name} n = {value}, guard n {guard} {k}, loop {}", shape.cond);
        assert_eq!(arena.evaluate(desc.additional_info, &env), Some(1), "{case}: guard facts do not hold");
        let (Some(holds), Some(may_be_zero), Some(niter)) = (
            arena.evaluate(desc.assumptions, &env),
            arena.evaluate(desc.may_be_zero, &env),
            arena.evaluate(desc.niter, &env),
        ) else {
            continue;
        };
        if holds == 0 || may_be_zero == 1 {
            continue;
        }
        let first = shape.first.unwrap_or(value);
        let stays = |i: u64| (shape.stays)(ty.value_of(ty.wrap(first + shape.step * i as i128)), value);
        assert!((0..niter).all(stays), "{case}: exits before {niter} iterations");
        assert!(!stays(niter), "{case}: still looping after {niter} iterations");
    }
}
