//! Loop IR
//!
//! The IR the trip-count engine reads: a hash-consed expression arena with a
//! constant folder (the fold oracle), a CFG of basic blocks in SSA form, its
//! dominator tree, the loop forest, and the induction-variable recognizer.
//!
//! Expressions are immutable nodes addressed by `ExprId`. Building the same
//! node twice yields the same id, so structural equality is id equality.
//! All integer constants are stored as zero-extended bit patterns of their
//! type's width; arithmetic wraps modulo `2^bits`.

mod cfg;
mod dom;
mod fold;
mod loops;
mod ranges;
mod scev;

pub(crate) use fold::{STACK_GROW_SIZE, STACK_RED_ZONE};
pub use cfg::{BasicBlock, Edge, EdgeKind, Function, FunctionBuilder, Stmt, StmtKind};
pub use dom::DomTree;
pub use loops::{Loop, LoopForest};
pub use ranges::{IntervalSet, RangeFacts};
pub use scev::{AffineIv, simple_iv};

use std::collections::HashMap;
use std::fmt;

// ============================================================================
// Ids
// ============================================================================

macro_rules! index_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl $name {
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

index_type!(
    /// Expression node in an `ExprArena`
    ExprId
);
index_type!(
    /// SSA variable
    VarId
);
index_type!(
    /// Basic block in a `Function`
    BlockId
);
index_type!(
    /// Statement in a `Function`
    StmtId
);
index_type!(
    /// Loop in a `LoopForest`
    LoopId
);

// ============================================================================
// Types
// ============================================================================

/// Scalar type of an IR value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Type {
    pub bits: u8,
    pub signed: bool,
    pub pointer: bool,
}

impl Type {
    pub const BOOL: Type = Type { bits: 1, signed: false, pointer: false };

    pub const fn int(bits: u8, signed: bool) -> Self {
        Self { bits, signed, pointer: false }
    }

    pub const fn sint(bits: u8) -> Self {
        Self::int(bits, true)
    }

    pub const fn uint(bits: u8) -> Self {
        Self::int(bits, false)
    }

    pub const fn ptr(bits: u8) -> Self {
        Self { bits, signed: false, pointer: true }
    }

    pub fn is_bool(&self) -> bool {
        *self == Self::BOOL
    }

    pub fn is_integer(&self) -> bool {
        !self.pointer && !self.is_bool()
    }

    /// All-ones pattern of this width
    pub fn mask(&self) -> u64 {
        low_bits_mask(self.bits as u32)
    }

    /// Unsigned integer type of the same width (the niter type)
    pub fn unsigned(&self) -> Type {
        Type::uint(self.bits)
    }

    /// Interpret a bit pattern as an integer of this type
    pub fn value_of(&self, bits: u64) -> i128 {
        let bits = bits & self.mask();
        if self.signed && self.bits < 128 && bits >> (self.bits - 1) & 1 == 1 {
            bits as i128 - (1i128 << self.bits)
        } else {
            bits as i128
        }
    }

    /// Interpret a bit pattern as a signed integer regardless of signedness
    pub fn signed_value_of(&self, bits: u64) -> i128 {
        Type::sint(self.bits).value_of(bits)
    }

    /// Wrap an integer into this type's bit pattern
    pub fn wrap(&self, value: i128) -> u64 {
        (value as u64) & self.mask()
    }

    /// Smallest representable value
    pub fn min_value(&self) -> i128 {
        if self.signed { -(1i128 << (self.bits - 1)) } else { 0 }
    }

    /// Largest representable value
    pub fn max_value(&self) -> i128 {
        if self.signed {
            (1i128 << (self.bits - 1)) - 1
        } else {
            self.mask() as i128
        }
    }

    pub fn contains(&self, value: i128) -> bool {
        value >= self.min_value() && value <= self.max_value()
    }

    /// Parse a type name as printed by `Display` (`i32`, `u8`, `bool`, `ptr`, `ptr32`)
    pub fn from_name(name: &str) -> Option<Type> {
        let width = |digits: &str| digits.parse::<u8>().ok().filter(|bits| (1..=64).contains(bits));
        match name {
            "bool" => Some(Type::BOOL),
            "ptr" => Some(Type::ptr(64)),
            _ => {
                if let Some(bits) = name.strip_prefix("ptr") {
                    return width(bits).map(Type::ptr);
                }
                let (signed, bits) = match name.split_at_checked(1)? {
                    ("i", bits) => (true, bits),
                    ("u", bits) => (false, bits),
                    _ => return None,
                };
                if !bits.starts_with(|c: char| c.is_ascii_digit()) {
                    return None;
                }
                width(bits).map(|bits| Type::int(bits, signed))
            }
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_bool() {
            write!(f, "bool")
        } else if self.pointer {
            if self.bits == 64 { write!(f, "ptr") } else { write!(f, "ptr{}", self.bits) }
        } else {
            write!(f, "{}{}", if self.signed { 'i' } else { 'u' }, self.bits)
        }
    }
}

/// Mask of the `n` low bits (`n` may be 64)
pub fn low_bits_mask(n: u32) -> u64 {
    if n >= 64 { u64::MAX } else { (1u64 << n) - 1 }
}

// ============================================================================
// Operators
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    /// Division rounding toward negative infinity
    FloorDiv,
    /// Remainder with the sign of the divisor
    FloorMod,
    /// Division known to leave no remainder
    ExactDiv,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    /// Truth-value conjunction
    And,
    /// Truth-value disjunction
    Or,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::FloorDiv | BinOp::ExactDiv => "/",
            BinOp::FloorMod => "%",
            BinOp::BitAnd => "&",
            BinOp::BitOr => "|",
            BinOp::BitXor => "^",
            BinOp::Shl => "<<",
            BinOp::Shr => ">>",
            BinOp::And => "&&",
            BinOp::Or => "||",
        }
    }

    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            BinOp::Add | BinOp::Mul | BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor | BinOp::And | BinOp::Or
        )
    }

    pub fn is_truth(self) -> bool {
        matches!(self, BinOp::And | BinOp::Or)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnOp {
    Neg,
    BitNot,
    /// Truth-value negation
    Not,
}

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl CmpOp {
    /// Operator for `b op' a` equivalent to `a op b`
    pub fn swap(self) -> CmpOp {
        match self {
            CmpOp::Lt => CmpOp::Gt,
            CmpOp::Le => CmpOp::Ge,
            CmpOp::Gt => CmpOp::Lt,
            CmpOp::Ge => CmpOp::Le,
            CmpOp::Eq => CmpOp::Eq,
            CmpOp::Ne => CmpOp::Ne,
        }
    }

    /// Logical negation of the comparison
    pub fn invert(self) -> CmpOp {
        match self {
            CmpOp::Lt => CmpOp::Ge,
            CmpOp::Le => CmpOp::Gt,
            CmpOp::Gt => CmpOp::Le,
            CmpOp::Ge => CmpOp::Lt,
            CmpOp::Eq => CmpOp::Ne,
            CmpOp::Ne => CmpOp::Eq,
        }
    }

    pub fn evaluate(self, lhs: i128, rhs: i128) -> bool {
        match self {
            CmpOp::Lt => lhs < rhs,
            CmpOp::Le => lhs <= rhs,
            CmpOp::Gt => lhs > rhs,
            CmpOp::Ge => lhs >= rhs,
            CmpOp::Eq => lhs == rhs,
            CmpOp::Ne => lhs != rhs,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
        }
    }
}

// ============================================================================
// Expressions
// ============================================================================

/// Expression node kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExprKind {
    /// Bit pattern of the node type's width
    Const(u64),
    Var(VarId),
    Binary(BinOp, ExprId, ExprId),
    Unary(UnOp, ExprId),
    /// Conversion of the operand to the node type
    Cast(ExprId),
    /// Comparison of two operands of the same type; the node type is bool
    Cmp(CmpOp, ExprId, ExprId),
    /// `cond ? then : else`
    Select(ExprId, ExprId, ExprId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExprNode {
    pub kind: ExprKind,
    pub ty: Type,
}

#[derive(Debug, Clone)]
struct VarInfo {
    name: String,
    ty: Type,
}

/// Hash-consed expression store
///
/// Owns every expression node and every SSA variable of the functions built
/// against it. Nodes are never mutated or removed.
#[derive(Debug, Default)]
pub struct ExprArena {
    nodes: Vec<ExprNode>,
    interned: HashMap<ExprNode, ExprId>,
    vars: Vec<VarInfo>,
    /// Memoized `fold` results
    folded: HashMap<ExprId, ExprId>,
}

impl ExprArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn intern(&mut self, node: ExprNode) -> ExprId {
        if let Some(&id) = self.interned.get(&node) {
            return id;
        }
        let id = ExprId(self.nodes.len() as u32);
        self.nodes.push(node);
        self.interned.insert(node, id);
        id
    }

    pub fn node(&self, id: ExprId) -> ExprNode {
        self.nodes[id.index()]
    }

    pub fn kind(&self, id: ExprId) -> ExprKind {
        self.nodes[id.index()].kind
    }

    pub fn ty(&self, id: ExprId) -> Type {
        self.nodes[id.index()].ty
    }

    // --- variables ---

    pub fn new_var(&mut self, name: impl Into<String>, ty: Type) -> VarId {
        let id = VarId(self.vars.len() as u32);
        self.vars.push(VarInfo { name: name.into(), ty });
        id
    }

    pub fn var_name(&self, var: VarId) -> &str {
        &self.vars[var.index()].name
    }

    pub fn var_type(&self, var: VarId) -> Type {
        self.vars[var.index()].ty
    }

    /// Expression reading `var`
    pub fn var(&mut self, var: VarId) -> ExprId {
        let ty = self.var_type(var);
        self.intern(ExprNode { kind: ExprKind::Var(var), ty })
    }

    // --- raw constructors (no folding) ---

    pub fn constant(&mut self, ty: Type, bits: u64) -> ExprId {
        self.intern(ExprNode { kind: ExprKind::Const(bits & ty.mask()), ty })
    }

    /// Constant from an integer value, wrapped into `ty`
    pub fn int(&mut self, ty: Type, value: i128) -> ExprId {
        self.constant(ty, ty.wrap(value))
    }

    pub fn boolean(&mut self, value: bool) -> ExprId {
        self.constant(Type::BOOL, value as u64)
    }

    pub fn binary(&mut self, op: BinOp, ty: Type, lhs: ExprId, rhs: ExprId) -> ExprId {
        self.intern(ExprNode { kind: ExprKind::Binary(op, lhs, rhs), ty })
    }

    pub fn unary(&mut self, op: UnOp, ty: Type, operand: ExprId) -> ExprId {
        self.intern(ExprNode { kind: ExprKind::Unary(op, operand), ty })
    }

    pub fn cast(&mut self, ty: Type, operand: ExprId) -> ExprId {
        self.intern(ExprNode { kind: ExprKind::Cast(operand), ty })
    }

    pub fn compare(&mut self, op: CmpOp, lhs: ExprId, rhs: ExprId) -> ExprId {
        self.intern(ExprNode { kind: ExprKind::Cmp(op, lhs, rhs), ty: Type::BOOL })
    }

    pub fn select(&mut self, cond: ExprId, then: ExprId, otherwise: ExprId) -> ExprId {
        let ty = self.ty(then);
        self.intern(ExprNode { kind: ExprKind::Select(cond, then, otherwise), ty })
    }

    // --- queries ---

    pub fn const_value(&self, id: ExprId) -> Option<u64> {
        match self.kind(id) {
            ExprKind::Const(bits) => Some(bits),
            _ => None,
        }
    }

    /// Constant interpreted in its own type
    pub fn const_int(&self, id: ExprId) -> Option<i128> {
        self.const_value(id).map(|bits| self.ty(id).value_of(bits))
    }

    pub fn is_constant(&self, id: ExprId) -> bool {
        matches!(self.kind(id), ExprKind::Const(_))
    }

    /// Literal boolean true
    pub fn is_true(&self, id: ExprId) -> bool {
        self.ty(id).is_bool() && self.const_value(id) == Some(1)
    }

    /// Literal boolean false
    pub fn is_false(&self, id: ExprId) -> bool {
        self.ty(id).is_bool() && self.const_value(id) == Some(0)
    }

    pub fn is_zero(&self, id: ExprId) -> bool {
        self.const_value(id) == Some(0)
    }

    /// Direct operands of a node
    pub fn operands(&self, id: ExprId) -> Vec<ExprId> {
        match self.kind(id) {
            ExprKind::Const(_) | ExprKind::Var(_) => Vec::new(),
            ExprKind::Binary(_, a, b) | ExprKind::Cmp(_, a, b) => vec![a, b],
            ExprKind::Unary(_, a) | ExprKind::Cast(a) => vec![a],
            ExprKind::Select(c, a, b) => vec![c, a, b],
        }
    }

    /// Variables read by an expression, with multiplicity, in visit order
    pub fn var_uses(&self, root: ExprId) -> Vec<VarId> {
        let mut uses = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            match self.kind(id) {
                ExprKind::Var(v) => uses.push(v),
                _ => {
                    let mut ops = self.operands(id);
                    ops.reverse();
                    stack.extend(ops);
                }
            }
        }
        uses
    }

    /// Same node with its operands replaced (in `operands` order)
    pub fn with_operands(&mut self, id: ExprId, ops: &[ExprId]) -> ExprId {
        let node = self.node(id);
        let kind = match node.kind {
            ExprKind::Const(_) | ExprKind::Var(_) => return id,
            ExprKind::Binary(op, _, _) => ExprKind::Binary(op, ops[0], ops[1]),
            ExprKind::Cmp(op, _, _) => ExprKind::Cmp(op, ops[0], ops[1]),
            ExprKind::Unary(op, _) => ExprKind::Unary(op, ops[0]),
            ExprKind::Cast(_) => ExprKind::Cast(ops[0]),
            ExprKind::Select(..) => ExprKind::Select(ops[0], ops[1], ops[2]),
        };
        self.intern(ExprNode { kind, ty: node.ty })
    }

    /// Rebuild `root` with variables replaced according to `map`
    ///
    /// The result is not folded.
    pub fn substitute(&mut self, root: ExprId, map: &HashMap<VarId, ExprId>) -> ExprId {
        self.rewrite_leaves(root, |arena, id| match arena.kind(id) {
            ExprKind::Var(v) => map.get(&v).copied(),
            _ => None,
        })
    }

    /// Rebuild `root` with every occurrence of `from` replaced by `to`
    ///
    /// The result is not folded.
    pub fn replace(&mut self, root: ExprId, from: ExprId, to: ExprId) -> ExprId {
        self.rewrite_leaves(root, |_, id| (id == from).then_some(to))
    }

    /// Bottom-up rebuild; `leaf` returns a replacement for a node, which is
    /// then not descended into
    fn rewrite_leaves(&mut self, root: ExprId, leaf: impl Fn(&ExprArena, ExprId) -> Option<ExprId>) -> ExprId {
        let mut done: HashMap<ExprId, ExprId> = HashMap::new();
        let mut stack = vec![(root, false)];
        while let Some((id, expanded)) = stack.pop() {
            if done.contains_key(&id) {
                continue;
            }
            if let Some(replacement) = leaf(self, id) {
                done.insert(id, replacement);
                continue;
            }
            let ops = self.operands(id);
            if !expanded {
                stack.push((id, true));
                stack.extend(ops.iter().filter(|op| !done.contains_key(op)).map(|&op| (op, false)));
                continue;
            }
            let new_ops: Vec<ExprId> = ops.iter().map(|op| done[op]).collect();
            let rebuilt = if new_ops == ops { id } else { self.with_operands(id, &new_ops) };
            done.insert(id, rebuilt);
        }
        done[&root]
    }

    /// Evaluate an expression under a full valuation of its variables
    ///
    /// Returns `None` when a variable is unbound or the expression does not
    /// reduce to a constant (e.g. division by zero).
    pub fn evaluate(&mut self, root: ExprId, values: &HashMap<VarId, u64>) -> Option<u64> {
        let mut map = HashMap::new();
        for var in self.var_uses(root) {
            let bits = *values.get(&var)?;
            let ty = self.var_type(var);
            let c = self.constant(ty, bits);
            map.insert(var, c);
        }
        let closed = self.substitute(root, &map);
        let folded = self.fold(closed);
        self.const_value(folded)
    }

    pub fn display(&self, id: ExprId) -> DisplayExpr<'_> {
        DisplayExpr { arena: self, id }
    }
}

/// `Display` adapter for an expression
pub struct DisplayExpr<'a> {
    arena: &'a ExprArena,
    id: ExprId,
}

impl DisplayExpr<'_> {
    fn write_operand(&self, f: &mut fmt::Formatter<'_>, id: ExprId) -> fmt::Result {
        let nested = matches!(
            self.arena.kind(id),
            ExprKind::Binary(..) | ExprKind::Cmp(..) | ExprKind::Select(..)
        );
        let inner = DisplayExpr { arena: self.arena, id };
        if nested { write!(f, "({inner})") } else { write!(f, "{inner}") }
    }
}

impl fmt::Display for DisplayExpr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let node = self.arena.node(self.id);
        match node.kind {
            ExprKind::Const(bits) => {
                if node.ty.is_bool() {
                    write!(f, "{}", bits != 0)
                } else {
                    write!(f, "{}", node.ty.value_of(bits))
                }
            }
            ExprKind::Var(v) => write!(f, "{}", self.arena.var_name(v)),
            ExprKind::Binary(op, a, b) => {
                self.write_operand(f, a)?;
                write!(f, " {} ", op.symbol())?;
                self.write_operand(f, b)
            }
            ExprKind::Cmp(op, a, b) => {
                self.write_operand(f, a)?;
                write!(f, " {} ", op.symbol())?;
                self.write_operand(f, b)
            }
            ExprKind::Unary(op, a) => {
                let sym = match op {
                    UnOp::Neg => "-",
                    UnOp::BitNot => "~",
                    UnOp::Not => "!",
                };
                write!(f, "{sym}")?;
                self.write_operand(f, a)
            }
            ExprKind::Cast(a) => {
                write!(f, "({}) ", node.ty)?;
                self.write_operand(f, a)
            }
            ExprKind::Select(c, a, b) => {
                self.write_operand(f, c)?;
                write!(f, " ? ")?;
                self.write_operand(f, a)?;
                write!(f, " : ")?;
                self.write_operand(f, b)
            }
        }
    }
}
