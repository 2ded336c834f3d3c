//! Fold Oracle
//!
//! `fold` rewrites an expression bottom-up into a canonical simplified form.
//! Results are memoized and every result is recorded as its own fold, so
//! `fold(fold(e)) == fold(e)` holds by construction.
//!
//! Integer arithmetic is normalized into linear forms `Σ cᵢ·atomᵢ + k`
//! modulo `2^bits`; comparisons and masks are decided with conservative
//! value ranges; conjunctions and disjunctions are flattened and their
//! comparison leaves combined as interval sets.

use super::ranges::{IntervalSet, RangeFacts};
use super::{BinOp, CmpOp, ExprArena, ExprId, ExprKind, ExprNode, Type, UnOp};
use std::collections::BTreeMap;

/// Minimum stack space before growing (128KB)
pub(crate) const STACK_RED_ZONE: usize = 128 * 1024;

/// Stack growth size (4MB)
pub(crate) const STACK_GROW_SIZE: usize = 4 * 1024 * 1024;

// ============================================================================
// Linear forms
// ============================================================================

/// `Σ terms[atom]·atom + constant` modulo `2^ty.bits`
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LinearForm {
    pub ty: Type,
    pub terms: BTreeMap<ExprId, u64>,
    pub constant: u64,
}

impl LinearForm {
    fn constant(ty: Type, value: u64) -> Self {
        Self { ty, terms: BTreeMap::new(), constant: value & ty.mask() }
    }

    fn atom(ty: Type, id: ExprId) -> Self {
        Self { ty, terms: BTreeMap::from([(id, 1)]), constant: 0 }
    }

    /// Relabel with another type of the same width
    fn retyped(mut self, ty: Type) -> Self {
        debug_assert_eq!(self.ty.bits, ty.bits);
        self.ty = ty;
        self
    }

    fn add_scaled(&mut self, other: &LinearForm, factor: u64) {
        let mask = self.ty.mask();
        for (&atom, &coeff) in &other.terms {
            let old = self.terms.get(&atom).copied().unwrap_or(0);
            let new = old.wrapping_add(coeff.wrapping_mul(factor)) & mask;
            if new == 0 {
                self.terms.remove(&atom);
            } else {
                self.terms.insert(atom, new);
            }
        }
        self.constant = self.constant.wrapping_add(other.constant.wrapping_mul(factor)) & mask;
    }

    fn scale(self, factor: u64) -> Self {
        let mut scaled = LinearForm::constant(self.ty, 0);
        scaled.add_scaled(&self, factor);
        scaled
    }

    pub fn as_constant(&self) -> Option<u64> {
        self.terms.is_empty().then_some(self.constant)
    }
}

fn is_negative(ty: Type, bits: u64) -> bool {
    ty.signed_value_of(bits) < 0
}

fn negate(ty: Type, bits: u64) -> u64 {
    0u64.wrapping_sub(bits) & ty.mask()
}

// ============================================================================
// Constant evaluation
// ============================================================================

fn div_floor(a: i128, b: i128) -> i128 {
    let q = a / b;
    if a % b != 0 && ((a < 0) != (b < 0)) { q - 1 } else { q }
}

fn mod_floor(a: i128, b: i128) -> i128 {
    let r = a % b;
    if r != 0 && ((r < 0) != (b < 0)) { r + b } else { r }
}

fn eval_binary(op: BinOp, ty: Type, a: u64, b: u64) -> Option<u64> {
    let mask = ty.mask();
    let (va, vb) = (ty.value_of(a), ty.value_of(b));
    let value = match op {
        BinOp::Add => a.wrapping_add(b) & mask,
        BinOp::Sub => a.wrapping_sub(b) & mask,
        BinOp::Mul => a.wrapping_mul(b) & mask,
        BinOp::FloorDiv if vb != 0 => ty.wrap(div_floor(va, vb)),
        BinOp::ExactDiv if vb != 0 => ty.wrap(va / vb),
        BinOp::FloorMod if vb != 0 => ty.wrap(mod_floor(va, vb)),
        BinOp::FloorDiv | BinOp::ExactDiv | BinOp::FloorMod => return None,
        BinOp::BitAnd | BinOp::And => a & b,
        BinOp::BitOr | BinOp::Or => a | b,
        BinOp::BitXor => a ^ b,
        BinOp::Shl if b < ty.bits as u64 => (a << b) & mask,
        BinOp::Shr if b < ty.bits as u64 => ty.wrap(va >> b),
        BinOp::Shl | BinOp::Shr => return None,
    };
    Some(value)
}

fn eval_cast(from: Type, to: Type, bits: u64) -> u64 {
    if to.is_bool() {
        (bits & from.mask() != 0) as u64
    } else {
        to.wrap(from.value_of(bits))
    }
}

// ============================================================================
// Truth-value merging
// ============================================================================

/// Outcome of combining two leaves of a conjunction/disjunction
enum Merge {
    /// The whole connective collapses to its absorbing value
    Absorb,
    /// The new leaf adds nothing
    KeepExisting,
    /// The new leaf subsumes the existing one
    ReplaceExisting,
    Independent,
}

impl ExprArena {
    // ------------------------------------------------------------------
    // Entry points
    // ------------------------------------------------------------------

    /// Fold an expression to its canonical simplified form
    pub fn fold(&mut self, root: ExprId) -> ExprId {
        if let Some(&done) = self.folded.get(&root) {
            return done;
        }
        let mut stack = vec![(root, false)];
        while let Some((id, expanded)) = stack.pop() {
            if self.folded.contains_key(&id) {
                continue;
            }
            let ops = self.operands(id);
            if !expanded {
                stack.push((id, true));
                stack.extend(ops.into_iter().filter(|op| !self.folded.contains_key(op)).map(|op| (op, false)));
                continue;
            }
            let new_ops: Vec<ExprId> = ops.iter().map(|op| self.folded[op]).collect();
            let node = self.node(id);
            let result = self.simplify_node(node.ty, node.kind, &new_ops);
            // Every cached value is a fixed point
            let result = match self.folded.get(&result) {
                Some(&fixed) => fixed,
                None => {
                    self.folded.insert(result, result);
                    result
                }
            };
            self.folded.insert(id, result);
        }
        self.folded[&root]
    }

    pub fn fold_binary(&mut self, op: BinOp, ty: Type, a: ExprId, b: ExprId) -> ExprId {
        let e = self.binary(op, ty, a, b);
        self.fold(e)
    }

    pub fn fold_add(&mut self, ty: Type, a: ExprId, b: ExprId) -> ExprId {
        self.fold_binary(BinOp::Add, ty, a, b)
    }

    pub fn fold_sub(&mut self, ty: Type, a: ExprId, b: ExprId) -> ExprId {
        self.fold_binary(BinOp::Sub, ty, a, b)
    }

    pub fn fold_mul(&mut self, ty: Type, a: ExprId, b: ExprId) -> ExprId {
        self.fold_binary(BinOp::Mul, ty, a, b)
    }

    pub fn fold_neg(&mut self, ty: Type, a: ExprId) -> ExprId {
        let e = self.unary(UnOp::Neg, ty, a);
        self.fold(e)
    }

    pub fn fold_cast(&mut self, ty: Type, a: ExprId) -> ExprId {
        let e = self.cast(ty, a);
        self.fold(e)
    }

    pub fn fold_cmp(&mut self, op: CmpOp, a: ExprId, b: ExprId) -> ExprId {
        let e = self.compare(op, a, b);
        self.fold(e)
    }

    pub fn fold_and(&mut self, a: ExprId, b: ExprId) -> ExprId {
        self.fold_binary(BinOp::And, Type::BOOL, a, b)
    }

    pub fn fold_or(&mut self, a: ExprId, b: ExprId) -> ExprId {
        self.fold_binary(BinOp::Or, Type::BOOL, a, b)
    }

    pub fn fold_not(&mut self, a: ExprId) -> ExprId {
        let e = self.unary(UnOp::Not, Type::BOOL, a);
        self.fold(e)
    }

    pub fn fold_select(&mut self, cond: ExprId, then: ExprId, otherwise: ExprId) -> ExprId {
        let e = self.select(cond, then, otherwise);
        self.fold(e)
    }

    // ------------------------------------------------------------------
    // Linear forms
    // ------------------------------------------------------------------

    /// Decompose an expression into a linear form over its own type
    pub(crate) fn linear_of(&self, id: ExprId) -> LinearForm {
        stacker::maybe_grow(STACK_RED_ZONE, STACK_GROW_SIZE, || {
            let node = self.node(id);
            let ty = node.ty;
            if ty.is_bool() {
                return LinearForm::atom(ty, id);
            }
            match node.kind {
                ExprKind::Const(bits) => LinearForm::constant(ty, bits),
                ExprKind::Binary(BinOp::Add, a, b) => {
                    let mut form = self.linear_of(a).retyped(ty);
                    form.add_scaled(&self.linear_of(b).retyped(ty), 1);
                    form
                }
                ExprKind::Binary(BinOp::Sub, a, b) => {
                    let mut form = self.linear_of(a).retyped(ty);
                    form.add_scaled(&self.linear_of(b).retyped(ty), ty.mask());
                    form
                }
                ExprKind::Binary(BinOp::Mul, a, b) => match (self.const_value(a), self.const_value(b)) {
                    (_, Some(c)) => self.linear_of(a).retyped(ty).scale(c),
                    (Some(c), _) => self.linear_of(b).retyped(ty).scale(c),
                    _ => LinearForm::atom(ty, id),
                },
                ExprKind::Binary(BinOp::Shl, a, b) => match self.const_value(b) {
                    Some(k) if k < ty.bits as u64 => self.linear_of(a).retyped(ty).scale(1u64 << k),
                    _ => LinearForm::atom(ty, id),
                },
                ExprKind::Unary(UnOp::Neg, a) => self.linear_of(a).retyped(ty).scale(ty.mask()),
                ExprKind::Cast(a) if self.ty(a).bits == ty.bits && !self.ty(a).is_bool() => {
                    self.linear_of(a).retyped(ty)
                }
                _ => LinearForm::atom(ty, id),
            }
        })
    }

    /// Constant difference `a - b` when both sides share all their terms
    pub(crate) fn constant_difference(&self, a: ExprId, b: ExprId) -> Option<u64> {
        let ty = self.ty(a);
        let mut diff = self.linear_of(a);
        diff.add_scaled(&self.linear_of(b).retyped(ty), ty.mask());
        diff.as_constant()
    }

    fn coerce_atom(&mut self, ty: Type, atom: ExprId) -> ExprId {
        if self.ty(atom) == ty { atom } else { self.cast(ty, atom) }
    }

    fn scaled_term(&mut self, ty: Type, atom: ExprId, coeff: u64) -> ExprId {
        let atom = self.coerce_atom(ty, atom);
        if coeff == 1 {
            atom
        } else {
            let c = self.constant(ty, coeff);
            self.binary(BinOp::Mul, ty, atom, c)
        }
    }

    /// Rebuild a linear form as a canonical expression
    fn build_linear(&mut self, form: &LinearForm) -> ExprId {
        let ty = form.ty;
        if ty.pointer {
            return self.build_pointer_linear(form);
        }
        let mut positive = Vec::new();
        let mut negative = Vec::new();
        for (&atom, &coeff) in &form.terms {
            if is_negative(ty, coeff) {
                negative.push(self.scaled_term(ty, atom, negate(ty, coeff)));
            } else {
                positive.push(self.scaled_term(ty, atom, coeff));
            }
        }

        let k = form.constant;
        let mut constant_used = k == 0;
        let mut acc: Option<ExprId> = None;
        for term in positive {
            acc = Some(match acc {
                None => term,
                Some(sum) => self.binary(BinOp::Add, ty, sum, term),
            });
        }
        if acc.is_none() && !negative.is_empty() && !constant_used && !is_negative(ty, k) {
            acc = Some(self.constant(ty, k));
            constant_used = true;
        }
        for term in negative {
            acc = Some(match acc {
                None => self.unary(UnOp::Neg, ty, term),
                Some(sum) => self.binary(BinOp::Sub, ty, sum, term),
            });
        }
        if !constant_used {
            acc = Some(match acc {
                None => self.constant(ty, k),
                Some(sum) if is_negative(ty, k) => {
                    let c = self.constant(ty, negate(ty, k));
                    self.binary(BinOp::Sub, ty, sum, c)
                }
                Some(sum) => {
                    let c = self.constant(ty, k);
                    self.binary(BinOp::Add, ty, sum, c)
                }
            });
        }
        match acc {
            Some(e) => e,
            None => self.constant(ty, 0),
        }
    }

    /// Pointer forms are rebuilt as `base ± offset` around their unique
    /// pointer atom, or as a cast of the integer form otherwise
    fn build_pointer_linear(&mut self, form: &LinearForm) -> ExprId {
        let ty = form.ty;
        let uty = ty.unsigned();
        let bases: Vec<ExprId> = form
            .terms
            .iter()
            .filter(|&(&atom, &coeff)| coeff == 1 && self.ty(atom).pointer)
            .map(|(&atom, _)| atom)
            .collect();
        if form.terms.is_empty() {
            return self.constant(ty, form.constant);
        }
        let &[base] = bases.as_slice() else {
            let offset = form.clone().retyped(uty);
            let int = self.build_linear(&offset);
            return self.cast(ty, int);
        };
        let mut offset = form.clone().retyped(uty);
        offset.terms.remove(&base);
        if offset.terms.is_empty() && offset.constant == 0 {
            return base;
        }
        let all_negative = offset.terms.values().all(|&c| is_negative(uty, c))
            && (offset.constant == 0 || is_negative(uty, offset.constant));
        if all_negative {
            let magnitude = offset.scale(uty.mask());
            let off = self.build_linear(&magnitude);
            self.binary(BinOp::Sub, ty, base, off)
        } else {
            let off = self.build_linear(&offset);
            self.binary(BinOp::Add, ty, base, off)
        }
    }

    fn fold_linear(&mut self, raw: ExprId) -> ExprId {
        let form = self.linear_of(raw);
        self.build_linear(&form)
    }

    // ------------------------------------------------------------------
    // Node simplification (operands already folded)
    // ------------------------------------------------------------------

    fn simplify_node(&mut self, ty: Type, kind: ExprKind, ops: &[ExprId]) -> ExprId {
        stacker::maybe_grow(STACK_RED_ZONE, STACK_GROW_SIZE, || match kind {
            ExprKind::Const(bits) => self.constant(ty, bits),
            ExprKind::Var(_) => self.intern(ExprNode { kind, ty }),
            ExprKind::Binary(op, _, _) => self.simplify_binary(op, ty, ops[0], ops[1]),
            ExprKind::Unary(op, _) => self.simplify_unary(op, ty, ops[0]),
            ExprKind::Cast(_) => self.simplify_cast(ty, ops[0]),
            ExprKind::Cmp(op, _, _) => self.simplify_cmp(op, ops[0], ops[1]),
            ExprKind::Select(..) => self.simplify_select(ops[0], ops[1], ops[2]),
        })
    }

    fn simplify_binary(&mut self, op: BinOp, ty: Type, a: ExprId, b: ExprId) -> ExprId {
        if let (Some(x), Some(y)) = (self.const_value(a), self.const_value(b))
            && let Some(value) = eval_binary(op, ty, x, y)
        {
            return self.constant(ty, value);
        }
        let mask = ty.mask();
        let cb = self.const_value(b);
        match op {
            BinOp::And | BinOp::Or => return self.simplify_truth(op, a, b),
            BinOp::Add | BinOp::Sub => {
                let raw = self.binary(op, ty, a, b);
                return self.fold_linear(raw);
            }
            BinOp::Mul if self.is_constant(a) || cb.is_some() => {
                let raw = self.binary(op, ty, a, b);
                return self.fold_linear(raw);
            }
            BinOp::Shl => match cb {
                Some(0) => return a,
                Some(k) if k < ty.bits as u64 => {
                    let raw = self.binary(op, ty, a, b);
                    return self.fold_linear(raw);
                }
                _ => {}
            },
            BinOp::Shr => {
                if cb == Some(0) || self.is_zero(a) {
                    return a;
                }
            }
            BinOp::FloorDiv | BinOp::ExactDiv => {
                if cb == Some(1) {
                    return a;
                }
                if let Some(c) = self.const_int(b)
                    && c > 0
                {
                    let (lo, hi) = self.value_range(a);
                    if lo >= 0 && hi < c {
                        return self.constant(ty, 0);
                    }
                }
            }
            BinOp::FloorMod => {
                if cb == Some(1) || self.is_zero(a) {
                    return self.constant(ty, 0);
                }
                if let Some(simplified) = self.simplify_mod(ty, a, b) {
                    return simplified;
                }
            }
            BinOp::BitAnd => {
                if self.is_zero(a) || cb == Some(0) {
                    return self.constant(ty, 0);
                }
                if cb == Some(mask) || a == b {
                    return a;
                }
                if self.const_value(a) == Some(mask) {
                    return b;
                }
                if let Some(kept) = self.drop_redundant_mask(a, b) {
                    return kept;
                }
            }
            BinOp::BitOr => {
                if cb == Some(0) || a == b {
                    return a;
                }
                if self.is_zero(a) {
                    return b;
                }
                if cb == Some(mask) || self.const_value(a) == Some(mask) {
                    return self.constant(ty, mask);
                }
            }
            BinOp::BitXor => {
                if cb == Some(0) {
                    return a;
                }
                if self.is_zero(a) {
                    return b;
                }
                if a == b {
                    return self.constant(ty, 0);
                }
            }
            _ => {}
        }
        let (a, b) = if op.is_commutative() && self.operand_order(a, b) { (b, a) } else { (a, b) };
        self.binary(op, ty, a, b)
    }

    /// True when commutative operands `a`, `b` must be swapped
    fn operand_order(&self, a: ExprId, b: ExprId) -> bool {
        match (self.is_constant(a), self.is_constant(b)) {
            (true, false) => true,
            (false, true) => false,
            _ => a > b,
        }
    }

    /// `x % c` for a positive constant `c`
    fn simplify_mod(&mut self, ty: Type, a: ExprId, b: ExprId) -> Option<ExprId> {
        let c = self.const_int(b).filter(|&c| c > 0)?;
        let (lo, hi) = self.value_range(a);
        if lo >= 0 && hi < c {
            return Some(a);
        }
        // With c a power of two dividing 2^bits, terms that are multiples
        // of c do not change the remainder
        let cu = c as u64;
        if !cu.is_power_of_two() || ty.pointer {
            return None;
        }
        let mut form = self.linear_of(a);
        let before = form.clone();
        form.terms.retain(|_, coeff| *coeff % cu != 0);
        form.constant %= cu;
        if form == before {
            return None;
        }
        if let Some(k) = form.as_constant() {
            return Some(self.constant(ty, k));
        }
        let reduced = self.build_linear(&form);
        Some(self.simplify_binary(BinOp::FloorMod, ty, reduced, b))
    }

    /// `x & (2^k - 1)` where `x` already lies in `[0, 2^k - 1]`
    fn drop_redundant_mask(&self, a: ExprId, b: ExprId) -> Option<ExprId> {
        let (value, mask) = match (self.const_value(a), self.const_value(b)) {
            (None, Some(m)) => (a, m),
            (Some(m), None) => (b, m),
            _ => return None,
        };
        if mask & mask.wrapping_add(1) != 0 {
            return None;
        }
        let limit = self.ty(value).value_of(mask);
        if limit < 0 {
            return None;
        }
        let (lo, hi) = self.value_range(value);
        (lo >= 0 && hi <= limit).then_some(value)
    }

    fn simplify_unary(&mut self, op: UnOp, ty: Type, a: ExprId) -> ExprId {
        match op {
            UnOp::Not => self.simplify_not(a),
            UnOp::Neg => {
                if let Some(x) = self.const_value(a) {
                    return self.constant(ty, negate(ty, x));
                }
                let raw = self.unary(op, ty, a);
                if ty.pointer { raw } else { self.fold_linear(raw) }
            }
            UnOp::BitNot => {
                if let Some(x) = self.const_value(a) {
                    return self.constant(ty, !x);
                }
                if let ExprKind::Unary(UnOp::BitNot, inner) = self.kind(a) {
                    return inner;
                }
                self.unary(op, ty, a)
            }
        }
    }

    fn simplify_cast(&mut self, ty: Type, a: ExprId) -> ExprId {
        let from = self.ty(a);
        if from == ty {
            return a;
        }
        if let Some(bits) = self.const_value(a) {
            return self.constant(ty, eval_cast(from, ty, bits));
        }
        if ty.is_bool() || from.is_bool() {
            return self.cast(ty, a);
        }
        if from.bits == ty.bits {
            let form = self.linear_of(a).retyped(ty);
            return self.build_linear(&form);
        }
        if let ExprKind::Cast(inner) = self.kind(a) {
            let orig = self.ty(inner);
            // Truncation back to the original type undoes any extension
            if orig == ty && from.bits >= ty.bits {
                return inner;
            }
            let narrowing = ty.bits <= from.bits && from.bits <= orig.bits;
            let widening = orig.bits < from.bits && from.bits < ty.bits && (!orig.signed || from.signed);
            if (narrowing || widening) && !orig.is_bool() {
                return self.simplify_cast(ty, inner);
            }
        }
        self.cast(ty, a)
    }

    fn decide_by_ranges(&self, op: CmpOp, a: ExprId, b: ExprId) -> Option<bool> {
        self.decide_cmp_under(op, a, b, &RangeFacts::new())
    }

    /// Truth value of `a op b` when the atoms in `facts` respect their
    /// bounds, if the value ranges alone decide it
    pub fn decide_cmp_under(&self, op: CmpOp, a: ExprId, b: ExprId, facts: &RangeFacts) -> Option<bool> {
        let (al, ah) = self.value_range_under(a, facts);
        let (bl, bh) = self.value_range_under(b, facts);
        let ordered = |lt_strict: bool, (xl, xh): (i128, i128), (yl, yh): (i128, i128)| {
            if lt_strict {
                if xh < yl {
                    Some(true)
                } else if xl >= yh {
                    Some(false)
                } else {
                    None
                }
            } else if xh <= yl {
                Some(true)
            } else if xl > yh {
                Some(false)
            } else {
                None
            }
        };
        let disjoint = ah < bl || bh < al;
        match op {
            CmpOp::Lt => ordered(true, (al, ah), (bl, bh)),
            CmpOp::Le => ordered(false, (al, ah), (bl, bh)),
            CmpOp::Gt => ordered(true, (bl, bh), (al, ah)),
            CmpOp::Ge => ordered(false, (bl, bh), (al, ah)),
            CmpOp::Eq => disjoint.then_some(false),
            CmpOp::Ne => disjoint.then_some(true),
        }
    }

    fn simplify_cmp(&mut self, op: CmpOp, a: ExprId, b: ExprId) -> ExprId {
        let ty = self.ty(a);
        if let (Some(x), Some(y)) = (self.const_value(a), self.const_value(b)) {
            return self.boolean(op.evaluate(ty.value_of(x), ty.value_of(y)));
        }
        if a == b {
            return self.boolean(matches!(op, CmpOp::Le | CmpOp::Ge | CmpOp::Eq));
        }
        if let Some(value) = self.decide_by_ranges(op, a, b) {
            return self.boolean(value);
        }
        if matches!(op, CmpOp::Eq | CmpOp::Ne) && !ty.is_bool() {
            let mut diff = self.linear_of(a);
            diff.add_scaled(&self.linear_of(b).retyped(ty), ty.mask());
            if let Some(c) = diff.as_constant() {
                return self.boolean((c == 0) == (op == CmpOp::Eq));
            }
            if let Some((&atom, &coeff)) = diff.terms.iter().next()
                && diff.terms.len() == 1
                && self.ty(atom) == ty
                && (coeff == 1 || coeff == ty.mask())
            {
                // coeff·atom + k == 0
                let k = if coeff == 1 { negate(ty, diff.constant) } else { diff.constant };
                let rhs = self.constant(ty, k);
                if (atom, rhs) != (a, b) {
                    return self.simplify_cmp(op, atom, rhs);
                }
            }
        }
        let (op, a, b) = if self.is_constant(a) && !self.is_constant(b) { (op.swap(), b, a) } else { (op, a, b) };
        self.compare(op, a, b)
    }

    fn simplify_not(&mut self, a: ExprId) -> ExprId {
        stacker::maybe_grow(STACK_RED_ZONE, STACK_GROW_SIZE, || {
            if let Some(x) = self.const_value(a) {
                return self.boolean(x == 0);
            }
            match self.kind(a) {
                ExprKind::Cmp(op, x, y) => self.simplify_cmp(op.invert(), x, y),
                ExprKind::Unary(UnOp::Not, inner) => inner,
                ExprKind::Binary(op @ (BinOp::And | BinOp::Or), x, y) => {
                    let nx = self.simplify_not(x);
                    let ny = self.simplify_not(y);
                    let dual = if op == BinOp::And { BinOp::Or } else { BinOp::And };
                    self.simplify_truth(dual, nx, ny)
                }
                _ => self.unary(UnOp::Not, Type::BOOL, a),
            }
        })
    }

    /// Leaves of a chain of the same connective
    pub(crate) fn truth_leaves(&self, op: BinOp, root: ExprId) -> Vec<ExprId> {
        let mut leaves = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            match self.kind(id) {
                ExprKind::Binary(inner, x, y) if inner == op => {
                    stack.push(y);
                    stack.push(x);
                }
                _ => leaves.push(id),
            }
        }
        leaves
    }

    fn simplify_truth(&mut self, op: BinOp, a: ExprId, b: ExprId) -> ExprId {
        // `true` absorbs a disjunction, `false` a conjunction
        let absorbing = op == BinOp::Or;
        let mut candidates = self.truth_leaves(op, a);
        candidates.extend(self.truth_leaves(op, b));

        let mut leaves: Vec<ExprId> = Vec::new();
        for leaf in candidates {
            match self.const_value(leaf) {
                Some(v) if (v != 0) == absorbing => return self.boolean(absorbing),
                Some(_) => continue,
                None => {}
            }
            let mut keep = true;
            let mut i = 0;
            while i < leaves.len() {
                match self.merge_leaves(op, leaves[i], leaf) {
                    Merge::Absorb => return self.boolean(absorbing),
                    Merge::KeepExisting => {
                        keep = false;
                        break;
                    }
                    Merge::ReplaceExisting => {
                        leaves.remove(i);
                    }
                    Merge::Independent => i += 1,
                }
            }
            if keep {
                leaves.push(leaf);
            }
        }

        leaves.sort();
        let mut iter = leaves.into_iter();
        let Some(first) = iter.next() else {
            return self.boolean(!absorbing);
        };
        iter.fold(first, |acc, leaf| self.binary(op, Type::BOOL, acc, leaf))
    }

    fn merge_leaves(&mut self, op: BinOp, existing: ExprId, new: ExprId) -> Merge {
        if existing == new {
            return Merge::KeepExisting;
        }
        if self.simplify_not(existing) == new {
            return Merge::Absorb;
        }
        let (ExprKind::Cmp(op_a, xa, ka), ExprKind::Cmp(op_b, xb, kb)) = (self.kind(existing), self.kind(new)) else {
            return Merge::Independent;
        };
        if xa != xb {
            return Merge::Independent;
        }
        let (Some(ka), Some(kb)) = (self.const_int(ka), self.const_int(kb)) else {
            return Merge::Independent;
        };
        let domain = self.value_range(xa);
        let sa = IntervalSet::from_cmp(op_a, ka, domain);
        let sb = IntervalSet::from_cmp(op_b, kb, domain);
        if op == BinOp::And {
            if sa.intersect(&sb).is_empty() {
                Merge::Absorb
            } else if sb.contains(&sa) {
                Merge::KeepExisting
            } else if sa.contains(&sb) {
                Merge::ReplaceExisting
            } else {
                Merge::Independent
            }
        } else if sa.union(&sb).contains(&IntervalSet::interval(domain.0, domain.1)) {
            Merge::Absorb
        } else if sb.contains(&sa) {
            Merge::ReplaceExisting
        } else if sa.contains(&sb) {
            Merge::KeepExisting
        } else {
            Merge::Independent
        }
    }

    fn simplify_select(&mut self, cond: ExprId, then: ExprId, otherwise: ExprId) -> ExprId {
        if self.is_true(cond) || then == otherwise {
            return then;
        }
        if self.is_false(cond) {
            return otherwise;
        }
        if self.ty(then).is_bool() {
            if self.is_true(then) && self.is_false(otherwise) {
                return cond;
            }
            if self.is_false(then) && self.is_true(otherwise) {
                return self.simplify_not(cond);
            }
        }
        self.select(cond, then, otherwise)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(ty: Type) -> (ExprArena, ExprId) {
        let mut arena = ExprArena::new();
        let n = arena.new_var("n", ty);
        let nv = arena.var(n);
        (arena, nv)
    }

    #[test]
    fn test_constant_arithmetic_wraps() {
        let mut arena = ExprArena::new();
        let ty = Type::uint(8);
        let a = arena.int(ty, 250);
        let b = arena.int(ty, 10);
        let sum = arena.fold_add(ty, a, b);
        assert_eq!(arena.const_value(sum), Some(4));
    }

    #[test]
    fn test_signed_floor_division() {
        let mut arena = ExprArena::new();
        let ty = Type::sint(32);
        let a = arena.int(ty, -7);
        let b = arena.int(ty, 2);
        let q = arena.fold_binary(BinOp::FloorDiv, ty, a, b);
        let r = arena.fold_binary(BinOp::FloorMod, ty, a, b);
        assert_eq!(arena.const_int(q), Some(-4));
        assert_eq!(arena.const_int(r), Some(1));
    }

    #[test]
    fn test_pointer_difference_cancels() {
        let mut arena = ExprArena::new();
        let pty = Type::ptr(64);
        let uty = Type::uint(64);
        let buf = arena.new_var("buf", pty);
        let len = arena.new_var("len", uty);
        let bv = arena.var(buf);
        let lv = arena.var(len);
        let end = arena.binary(BinOp::Add, pty, bv, lv);
        let ue = arena.cast(uty, end);
        let ub = arena.cast(uty, bv);
        let diff = arena.fold_sub(uty, ue, ub);
        assert_eq!(diff, lv);
    }

    #[test]
    fn test_linear_terms_collect() {
        let ty = Type::sint(32);
        let (mut arena, n) = setup(ty);
        let one = arena.int(ty, 1);
        let a = arena.binary(BinOp::Add, ty, n, one);
        let b = arena.binary(BinOp::Sub, ty, a, n);
        let folded = arena.fold(b);
        assert_eq!(arena.const_int(folded), Some(1));

        let m = arena.binary(BinOp::Sub, ty, n, one);
        let folded = arena.fold(m);
        assert_eq!(arena.display(folded).to_string(), "n - 1");
    }

    #[test]
    fn test_redundant_mask_dropped() {
        let ty = Type::uint(32);
        let (mut arena, n) = setup(ty);
        let four = arena.int(ty, 4);
        let div = arena.binary(BinOp::ExactDiv, ty, n, four);
        let mask = arena.int(ty, 0x3fff_ffff);
        let masked = arena.fold_binary(BinOp::BitAnd, ty, div, mask);
        assert_eq!(masked, div);
    }

    #[test]
    fn test_eq_normalizes_to_atom() {
        let ty = Type::sint(32);
        let (mut arena, n) = setup(ty);
        let one = arena.int(ty, 1);
        let five = arena.int(ty, 5);
        let lhs = arena.binary(BinOp::Add, ty, n, one);
        let eq = arena.fold_cmp(CmpOp::Eq, lhs, five);
        assert_eq!(arena.display(eq).to_string(), "n == 4");
    }

    #[test]
    fn test_comparisons_decided_by_range() {
        let ty = Type::uint(32);
        let (mut arena, n) = setup(ty);
        let zero = arena.int(ty, 0);
        let ge = arena.fold_cmp(CmpOp::Ge, n, zero);
        assert!(arena.is_true(ge));
        let lt = arena.fold_cmp(CmpOp::Lt, n, zero);
        assert!(arena.is_false(lt));
    }

    #[test]
    fn test_range_tests_combine() {
        let ty = Type::sint(32);
        let (mut arena, n) = setup(ty);
        let zero = arena.int(ty, 0);
        let pos = arena.fold_cmp(CmpOp::Gt, n, zero);
        let neg = arena.fold_cmp(CmpOp::Lt, n, zero);
        let both = arena.fold_and(pos, neg);
        assert!(arena.is_false(both));

        let le = arena.fold_cmp(CmpOp::Le, n, zero);
        let either = arena.fold_or(le, pos);
        assert!(arena.is_true(either));

        let weaker = arena.fold_or(neg, le);
        assert_eq!(weaker, le);
    }

    #[test]
    fn test_complement_and_de_morgan() {
        let ty = Type::sint(32);
        let (mut arena, n) = setup(ty);
        let m = arena.new_var("m", ty);
        let mv = arena.var(m);
        let c = arena.fold_cmp(CmpOp::Lt, n, mv);
        let not_c = arena.fold_not(c);
        assert_eq!(arena.display(not_c).to_string(), "n >= m");
        let contradiction = arena.fold_and(c, not_c);
        assert!(arena.is_false(contradiction));

        let d = arena.fold_cmp(CmpOp::Eq, n, mv);
        let conj = arena.fold_and(c, d);
        let negated = arena.fold_not(conj);
        assert!(matches!(arena.kind(negated), ExprKind::Binary(BinOp::Or, _, _)));
    }

    #[test]
    fn test_mod_drops_multiples() {
        let ty = Type::uint(32);
        let (mut arena, n) = setup(ty);
        let eight = arena.int(ty, 8);
        let four = arena.int(ty, 4);
        let shifted = arena.binary(BinOp::Mul, ty, n, eight);
        let m = arena.fold_binary(BinOp::FloorMod, ty, shifted, four);
        assert!(arena.is_zero(m));
    }

    #[test]
    fn test_fold_is_idempotent() {
        let ty = Type::sint(16);
        let (mut arena, n) = setup(ty);
        let three = arena.int(ty, 3);
        let e1 = arena.binary(BinOp::Mul, ty, n, three);
        let e2 = arena.binary(BinOp::Sub, ty, three, e1);
        let e3 = arena.compare(CmpOp::Le, e2, n);
        let once = arena.fold(e3);
        let twice = arena.fold(once);
        assert_eq!(once, twice);
    }
}
