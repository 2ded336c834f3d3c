//! Conservative value ranges
//!
//! `value_range` bounds the value of an expression in its type's own
//! interpretation (pointers are unsigned). Any step that could wrap widens
//! to the full range of the type, so the bounds hold under wraparound
//! evaluation.
//!
//! `RangeFacts` carry bounds known from context (a dominating guard, an
//! enclosing loop's trip count) for individual atoms; every expression
//! built on those atoms is then bounded through them.

use super::fold::{STACK_GROW_SIZE, STACK_RED_ZONE};
use super::{BinOp, CmpOp, ExprArena, ExprId, ExprKind, Type, UnOp};
use std::collections::HashMap;

/// Known inclusive bounds of atoms, in each atom's own interpretation
pub type RangeFacts = HashMap<ExprId, (i128, i128)>;

fn full(ty: Type) -> (i128, i128) {
    (ty.min_value(), ty.max_value())
}

fn clamp(ty: Type, lo: Option<i128>, hi: Option<i128>) -> (i128, i128) {
    match (lo, hi) {
        (Some(lo), Some(hi)) if ty.contains(lo) && ty.contains(hi) && lo <= hi => (lo, hi),
        _ => full(ty),
    }
}

fn div_floor(a: i128, b: i128) -> i128 {
    let q = a / b;
    if a % b != 0 && ((a < 0) != (b < 0)) { q - 1 } else { q }
}

impl ExprArena {
    /// Inclusive bounds on the value of `id`
    pub fn value_range(&self, id: ExprId) -> (i128, i128) {
        self.value_range_under(id, &RangeFacts::new())
    }

    /// Inclusive bounds on the value of `id` when every atom in `facts`
    /// lies within its recorded bounds
    pub fn value_range_under(&self, id: ExprId, facts: &RangeFacts) -> (i128, i128) {
        stacker::maybe_grow(STACK_RED_ZONE, STACK_GROW_SIZE, || {
            let (lo, hi) = self.compute_range(id, facts);
            match facts.get(&id) {
                Some(&(flo, fhi)) if flo.max(lo) <= fhi.min(hi) => (flo.max(lo), fhi.min(hi)),
                _ => (lo, hi),
            }
        })
    }

    /// Bounds on the atoms compared against constants in the conjunction
    /// `cond`
    ///
    /// Comparisons the conjunction cannot satisfy are left out.
    pub fn range_facts(&self, cond: ExprId) -> RangeFacts {
        let mut facts = RangeFacts::new();
        for leaf in self.truth_leaves(BinOp::And, cond) {
            let ExprKind::Cmp(op, x, k) = self.kind(leaf) else {
                continue;
            };
            let (x, k, op) = match (self.const_int(x), self.const_int(k)) {
                (None, Some(k)) => (x, k, op),
                (Some(c), None) => (k, c, op.swap()),
                _ => continue,
            };
            let domain = facts.get(&x).copied().unwrap_or_else(|| self.value_range(x));
            let allowed = IntervalSet::from_cmp(op, k, domain);
            if let (Some(&(lo, _)), Some(&(_, hi))) = (allowed.ranges().first(), allowed.ranges().last()) {
                facts.insert(x, (lo, hi));
            }
        }
        facts
    }

    fn compute_range(&self, id: ExprId, facts: &RangeFacts) -> (i128, i128) {
        let node = self.node(id);
        let ty = node.ty;
        if ty.is_bool() {
            return match node.kind {
                ExprKind::Const(bits) => (bits as i128, bits as i128),
                _ => (0, 1),
            };
        }
        match node.kind {
            ExprKind::Const(bits) => {
                let v = ty.value_of(bits);
                (v, v)
            }
            ExprKind::Var(_) | ExprKind::Cmp(..) => full(ty),
            ExprKind::Binary(op, a, b) => self.binary_range(op, ty, a, b, facts),
            ExprKind::Unary(UnOp::Neg, a) => {
                let (lo, hi) = self.value_range_under(a, facts);
                clamp(ty, Some(-hi), Some(-lo))
            }
            ExprKind::Unary(UnOp::BitNot, a) => {
                let (lo, hi) = self.value_range_under(a, facts);
                if ty.signed {
                    clamp(ty, Some(-hi - 1), Some(-lo - 1))
                } else {
                    let m = ty.mask() as i128;
                    clamp(ty, Some(m - hi), Some(m - lo))
                }
            }
            ExprKind::Unary(UnOp::Not, _) => (0, 1),
            ExprKind::Cast(a) => {
                let (lo, hi) = self.value_range_under(a, facts);
                clamp(ty, Some(lo), Some(hi))
            }
            ExprKind::Select(_, a, b) => {
                let (al, ah) = self.value_range_under(a, facts);
                let (bl, bh) = self.value_range_under(b, facts);
                (al.min(bl), ah.max(bh))
            }
        }
    }

    fn binary_range(&self, op: BinOp, ty: Type, a: ExprId, b: ExprId, facts: &RangeFacts) -> (i128, i128) {
        let (al, ah) = self.value_range_under(a, facts);
        let (bl, bh) = self.value_range_under(b, facts);
        let divisor = self.const_int(b).filter(|&c| c != 0);
        match op {
            BinOp::Add => clamp(ty, al.checked_add(bl), ah.checked_add(bh)),
            BinOp::Sub => clamp(ty, al.checked_sub(bh), ah.checked_sub(bl)),
            BinOp::Mul => {
                let corners = [al.checked_mul(bl), al.checked_mul(bh), ah.checked_mul(bl), ah.checked_mul(bh)];
                if corners.iter().any(Option::is_none) {
                    return full(ty);
                }
                let values = corners.iter().flatten();
                clamp(ty, values.clone().min().copied(), values.max().copied())
            }
            BinOp::FloorDiv | BinOp::ExactDiv => {
                let Some(c) = divisor else {
                    return full(ty);
                };
                let div = |x: i128| if op == BinOp::FloorDiv { div_floor(x, c) } else { x / c };
                if c > 0 {
                    clamp(ty, Some(div(al)), Some(div(ah)))
                } else {
                    clamp(ty, Some(div(ah)), Some(div(al)))
                }
            }
            BinOp::FloorMod => match divisor {
                Some(c) if c > 0 && al >= 0 && ah < c => (al, ah),
                Some(c) if c > 0 => clamp(ty, Some(0), Some(c - 1)),
                Some(c) => clamp(ty, Some(c + 1), Some(0)),
                None => full(ty),
            },
            BinOp::BitAnd => match (al >= 0, bl >= 0) {
                (true, true) => (0, ah.min(bh)),
                (true, false) => (0, ah),
                (false, true) => (0, bh),
                (false, false) => full(ty),
            },
            BinOp::BitOr | BinOp::BitXor if al >= 0 && bl >= 0 => {
                let top = ah.max(bh);
                let bound = if top == 0 { 0 } else { (1i128 << (128 - top.leading_zeros())) - 1 };
                clamp(ty, Some(0), Some(bound))
            }
            BinOp::Shr => match self.const_value(b) {
                Some(k) if k < ty.bits as u64 => (al >> k, ah >> k),
                _ => full(ty),
            },
            BinOp::Shl => match self.const_value(b) {
                Some(k) if k < ty.bits as u64 => {
                    let f = 1i128 << k;
                    clamp(ty, al.checked_mul(f), ah.checked_mul(f))
                }
                _ => full(ty),
            },
            BinOp::And | BinOp::Or => (0, 1),
            BinOp::BitOr | BinOp::BitXor => full(ty),
        }
    }
}

// ============================================================================
// Interval sets
// ============================================================================

/// Finite union of disjoint inclusive integer intervals
///
/// Used to combine comparisons of one value against constants.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IntervalSet {
    ranges: Vec<(i128, i128)>,
}

impl IntervalSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn interval(lo: i128, hi: i128) -> Self {
        if lo > hi { Self::empty() } else { Self { ranges: vec![(lo, hi)] } }
    }

    /// `{x ∈ domain | x op k}`
    pub fn from_cmp(op: CmpOp, k: i128, (lo, hi): (i128, i128)) -> Self {
        let set = match op {
            CmpOp::Lt => Self::interval(lo, k - 1),
            CmpOp::Le => Self::interval(lo, k),
            CmpOp::Gt => Self::interval(k + 1, hi),
            CmpOp::Ge => Self::interval(k, hi),
            CmpOp::Eq => Self::interval(k, k),
            CmpOp::Ne => Self::interval(lo, k - 1).union(&Self::interval(k + 1, hi)),
        };
        set.intersect(&Self::interval(lo, hi))
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn ranges(&self) -> &[(i128, i128)] {
        &self.ranges
    }

    pub fn union(&self, other: &IntervalSet) -> IntervalSet {
        let mut all: Vec<(i128, i128)> = self.ranges.iter().chain(&other.ranges).copied().collect();
        all.sort();
        let mut merged: Vec<(i128, i128)> = Vec::with_capacity(all.len());
        for (lo, hi) in all {
            match merged.last_mut() {
                Some(last) if lo <= last.1.saturating_add(1) => last.1 = last.1.max(hi),
                _ => merged.push((lo, hi)),
            }
        }
        IntervalSet { ranges: merged }
    }

    pub fn intersect(&self, other: &IntervalSet) -> IntervalSet {
        let mut out = Vec::new();
        for &(alo, ahi) in &self.ranges {
            for &(blo, bhi) in &other.ranges {
                let (lo, hi) = (alo.max(blo), ahi.min(bhi));
                if lo <= hi {
                    out.push((lo, hi));
                }
            }
        }
        out.sort();
        IntervalSet { ranges: out }
    }

    /// `other ⊆ self`
    pub fn contains(&self, other: &IntervalSet) -> bool {
        self.intersect(other) == *other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_set_operations() {
        let dom = (-128, 127);
        let lt = IntervalSet::from_cmp(CmpOp::Lt, 0, dom);
        let ne = IntervalSet::from_cmp(CmpOp::Ne, 5, dom);
        assert_eq!(lt.ranges(), &[(-128, -1)]);
        assert_eq!(ne.ranges(), &[(-128, 4), (6, 127)]);
        assert!(ne.contains(&lt));
        assert!(!lt.contains(&ne));
        let ge = IntervalSet::from_cmp(CmpOp::Ge, 0, dom);
        assert!(lt.intersect(&ge).is_empty());
        assert_eq!(lt.union(&ge), IntervalSet::interval(-128, 127));
    }

    #[test]
    fn test_range_widens_on_overflow() {
        let mut arena = ExprArena::new();
        let ty = Type::uint(8);
        let x = arena.new_var("x", ty);
        let xv = arena.var(x);
        let mask = arena.int(ty, 15);
        let low = arena.binary(BinOp::BitAnd, ty, xv, mask);
        assert_eq!(arena.value_range(low), (0, 15));
        let ten = arena.int(ty, 10);
        let sum = arena.binary(BinOp::Add, ty, low, ten);
        assert_eq!(arena.value_range(sum), (10, 25));
        let big = arena.int(ty, 250);
        let wrap = arena.binary(BinOp::Add, ty, low, big);
        assert_eq!(arena.value_range(wrap), (0, 255));
    }

    #[test]
    fn test_division_and_modulo_ranges() {
        let mut arena = ExprArena::new();
        let ty = Type::uint(32);
        let n = arena.new_var("n", ty);
        let nv = arena.var(n);
        let four = arena.int(ty, 4);
        let div = arena.binary(BinOp::FloorDiv, ty, nv, four);
        assert_eq!(arena.value_range(div), (0, (1 << 30) - 1));
        let rem = arena.binary(BinOp::FloorMod, ty, nv, four);
        assert_eq!(arena.value_range(rem), (0, 3));
    }
    #[test]
    fn test_facts_bound_expressions_through_casts() {
        let mut arena = ExprArena::new();
        let narrow = Type::sint(8);
        let n = arena.new_var("n", narrow);
        let nv = arena.var(n);
        let zero = arena.int(narrow, 0);
        let positive = arena.fold_cmp(CmpOp::Gt, nv, zero);
        let facts = arena.range_facts(positive);
        assert_eq!(facts.get(&nv), Some(&(1, 127)));

        let as_u8 = arena.cast(Type::uint(8), nv);
        let as_u32 = arena.cast(Type::uint(32), as_u8);
        assert_eq!(arena.value_range(as_u32), (0, 255));
        assert_eq!(arena.value_range_under(as_u32, &facts), (1, 127));

        let limit = arena.int(Type::uint(32), 127);
        assert_eq!(arena.decide_cmp_under(CmpOp::Ge, limit, as_u32, &facts), Some(true));
        assert_eq!(arena.decide_cmp_under(CmpOp::Ge, limit, as_u32, &RangeFacts::new()), None);
    }

    #[test]
    fn test_facts_from_conjunction() {
        let mut arena = ExprArena::new();
        let ty = Type::sint(32);
        let n = arena.new_var("n", ty);
        let m = arena.new_var("m", ty);
        let (nv, mv) = (arena.var(n), arena.var(m));
        let zero = arena.int(ty, 0);
        let ten = arena.int(ty, 10);
        let low = arena.fold_cmp(CmpOp::Ge, nv, zero);
        let high = arena.fold_cmp(CmpOp::Lt, nv, ten);
        let other = arena.fold_cmp(CmpOp::Ne, mv, zero);
        let both = arena.fold_and(low, high);
        let cond = arena.fold_and(both, other);

        let facts = arena.range_facts(cond);
        assert_eq!(facts.get(&nv), Some(&(0, 9)));
        // `m != 0` excludes a single point, so only the hull is kept
        assert_eq!(facts.get(&mv), Some(&(i32::MIN as i128, i32::MAX as i128)));
    }
}
