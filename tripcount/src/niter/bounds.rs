//! Bound ledger and widening oracle
//!
//! Each loop carries an append-only list of `BoundRecord`s: "statements after
//! `anchor` execute at most `bound` times per entry of the loop, provided
//! `additional` holds". The list is a persistent linked list of shared
//! nodes; cloning a `BoundList` takes a snapshot that later appends do not
//! disturb.

use crate::ir::{BinOp, CmpOp, DomTree, ExprArena, ExprId, Function, Loop, StmtId, Type, low_bits_mask};
use std::cmp::Ordering;
use std::sync::Arc;

#[derive(Debug)]
pub struct BoundRecord {
    pub bound: ExprId,
    pub additional: ExprId,
    pub anchor: StmtId,
    next: Option<Arc<BoundRecord>>,
}

impl BoundRecord {
    pub fn next(&self) -> Option<&BoundRecord> {
        self.next.as_deref()
    }
}

/// Append-only list of bound records, most recent first
#[derive(Debug, Clone, Default)]
pub struct BoundList {
    head: Option<Arc<BoundRecord>>,
    len: usize,
}

impl BoundList {
    pub fn push(&mut self, bound: ExprId, additional: ExprId, anchor: StmtId) {
        let next = self.head.take();
        self.head = Some(Arc::new(BoundRecord { bound, additional, anchor, next }));
        self.len += 1;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn iter(&self) -> BoundIter<'_> {
        BoundIter { cur: self.head.as_deref() }
    }

    pub fn clear(&mut self) {
        *self = BoundList::default();
    }
}

impl Drop for BoundList {
    fn drop(&mut self) {
        // Unlink iteratively; only nodes no snapshot still shares are freed
        let mut cur = self.head.take();
        while let Some(node) = cur {
            match Arc::try_unwrap(node) {
                Ok(mut record) => cur = record.next.take(),
                Err(_) => break,
            }
        }
    }
}

pub struct BoundIter<'a> {
    cur: Option<&'a BoundRecord>,
}

impl<'a> Iterator for BoundIter<'a> {
    type Item = &'a BoundRecord;

    fn next(&mut self) -> Option<Self::Item> {
        let record = self.cur?;
        self.cur = record.next();
        Some(record)
    }
}

/// Iteration-count estimate of a loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Estimate {
    #[default]
    NotComputed,
    /// Computed, but no constant unconditional bound was found
    Unknown,
    Constant(u64),
}

/// Append a bound to the loop's ledger
pub fn record_estimate(arena: &ExprArena, lp: &mut Loop, bound: ExprId, additional: ExprId, anchor: StmtId) {
    tracing::debug!(
        header = lp.header.0,
        bound = %arena.display(bound),
        additional = %arena.display(additional),
        "statements after the anchor execute at most `bound` times"
    );
    lp.bounds.push(bound, additional, anchor);

    let Some(value) = arena.const_value(bound) else {
        return;
    };
    if !arena.is_true(additional) {
        return;
    }
    match lp.estimate {
        Estimate::Constant(old) if old <= value => {}
        _ => lp.estimate = Estimate::Constant(value),
    }
}

// ============================================================================
// Type bounds
// ============================================================================

/// Largest value of `outer` obtainable by converting a value of `inner`
pub fn upper_bound_in_type(arena: &mut ExprArena, outer: Type, inner: Type) -> ExprId {
    let (oprec, iprec) = (outer.bits as u32, inner.bits as u32);
    let outer_unsigned = !outer.signed;
    let inner_unsigned = !inner.signed;
    let prec = match (oprec > iprec, outer_unsigned, inner_unsigned) {
        (false, false, _) => oprec - 1,
        (false, true, _) => oprec,
        (true, false, false) => iprec - 1,
        (true, false, true) => iprec,
        // Negative inner values extend to the top of the unsigned range
        (true, true, false) => oprec,
        (true, true, true) => iprec,
    };
    arena.constant(outer, low_bits_mask(prec))
}

/// Smallest value of `outer` obtainable by converting a value of `inner`
pub fn lower_bound_in_type(arena: &mut ExprArena, outer: Type, inner: Type) -> ExprId {
    let (oprec, iprec) = (outer.bits as u32, inner.bits as u32);
    if !outer.signed || !inner.signed {
        return arena.constant(outer, 0);
    }
    let prec = if oprec > iprec { iprec } else { oprec };
    arena.int(outer, -(1i128 << (prec - 1)))
}

/// Three-way comparison of two expressions, when the fold oracle decides it
///
/// Both sides are first converted to the more precise of their types.
pub fn compare_exprs(arena: &mut ExprArena, a: ExprId, b: ExprId) -> Option<Ordering> {
    let (ta, tb) = (arena.ty(a), arena.ty(b));
    let ty = if ta.bits > tb.bits { ta } else { tb };
    let a = arena.fold_cast(ty, a);
    let b = arena.fold_cast(ty, b);
    for (op, ordering) in [(CmpOp::Eq, Ordering::Equal), (CmpOp::Lt, Ordering::Less), (CmpOp::Gt, Ordering::Greater)] {
        let cmp = arena.fold_cmp(op, a, b);
        if arena.is_true(cmp) {
            return Some(ordering);
        }
    }
    None
}

// ============================================================================
// Widening
// ============================================================================

/// Can an IV `base + step * i` of `base`'s type be counted in `wide` given
/// one bound record? Returns the step in `wide` on success.
///
/// `anchor_dominates` tells whether the bound's anchor statement dominates
/// the statement where the IV is used; otherwise one extra iteration is
/// allowed for.
pub fn can_widen_with_bound(
    arena: &mut ExprArena,
    wide: Type,
    base: ExprId,
    step: ExprId,
    bound: ExprId,
    additional: ExprId,
    anchor_dominates: bool,
) -> Option<ExprId> {
    let narrow = arena.ty(base);
    if narrow.pointer || wide.pointer || wide.bits < narrow.bits {
        return None;
    }
    let step = arena.fold(step);
    let step_bits = arena.const_value(step)?;
    let signed_step = narrow.signed_value_of(step_bits);
    let new_step = arena.int(wide, signed_step);
    let (extreme, magnitude) = match signed_step.cmp(&0) {
        Ordering::Equal => return Some(new_step),
        Ordering::Greater => (narrow.max_value(), signed_step),
        Ordering::Less => (narrow.min_value(), -signed_step),
    };

    // The distance to the extreme lies in [0, 2^narrow.bits), so it is exact
    // modulo 2^wide.bits
    let uwide = wide.unsigned();
    let extreme = arena.int(uwide, extreme);
    let b = arena.fold_cast(uwide, base);
    let delta = if signed_step > 0 { arena.fold_sub(uwide, extreme, b) } else { arena.fold_sub(uwide, b, extreme) };
    let magnitude = arena.int(uwide, magnitude);
    let mut valid_niter = arena.fold_binary(BinOp::FloorDiv, uwide, delta, magnitude);

    let bound_ty = arena.ty(bound);
    let bound = if uwide.bits > bound_ty.bits {
        arena.fold_cast(uwide, bound)
    } else {
        valid_niter = arena.fold_cast(bound_ty, valid_niter);
        bound
    };

    let op = if anchor_dominates { CmpOp::Ge } else { CmpOp::Gt };
    let cond = arena.fold_cmp(op, valid_niter, bound);
    if arena.is_true(cond) {
        return Some(new_step);
    }
    let not_additional = arena.fold_not(additional);
    let implied = arena.fold_or(not_additional, cond);
    if arena.is_true(implied) {
        return Some(new_step);
    }
    // The guard may constrain an atom the bound only reaches through a cast
    let facts = arena.range_facts(additional);
    (arena.decide_cmp_under(op, valid_niter, bound, &facts) == Some(true)).then_some(new_step)
}

/// Walk the loop's bound records, most recent first
#[allow(clippy::too_many_arguments)]
pub fn can_widen(
    arena: &mut ExprArena,
    func: &Function,
    dom: &DomTree,
    lp: &Loop,
    wide: Type,
    base: ExprId,
    step: ExprId,
    at_stmt: StmtId,
) -> Option<ExprId> {
    for record in lp.bounds.iter() {
        let anchor_dominates = dom.stmt_dominates_stmt(func, record.anchor, at_stmt);
        if let Some(new_step) =
            can_widen_with_bound(arena, wide, base, step, record.bound, record.additional, anchor_dominates)
        {
            tracing::debug!(
                header = lp.header.0,
                wide = %wide,
                bound = %arena.display(record.bound),
                "induction variable can be counted in a wider type"
            );
            return Some(new_step);
        }
    }
    None
}
