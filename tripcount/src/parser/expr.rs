//! Expression syntax and its lowering into the arena
//!
//! Expressions are parsed untyped first, since a phi may read a variable
//! defined further down. Lowering then assigns every literal the type of its
//! suffix or of its context.

use super::Parser;
use crate::error::{NiterError, Result};
use crate::ir::{BinOp, CmpOp, ExprArena, ExprId, Type, UnOp, VarId};
use crate::lexer::Token;
use crate::span::Span;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub(super) enum SynKind {
    Int { value: u128, suffix: Option<Type> },
    Bool(bool),
    Name(String),
    Unary(UnOp, Box<Syn>),
    Binary(BinOp, Box<Syn>, Box<Syn>),
    Cmp(CmpOp, Box<Syn>, Box<Syn>),
    Cast(Type, Box<Syn>),
    Select(Box<Syn>, Box<Syn>, Box<Syn>),
}

/// Untyped expression
#[derive(Debug, Clone, PartialEq)]
pub(super) struct Syn {
    pub kind: SynKind,
    pub span: Span,
}

impl Syn {
    fn new(kind: SynKind, span: Span) -> Self {
        Self { kind, span }
    }
}

// ============================================================================
// Parsing
// ============================================================================

/// Number of binary precedence levels
const LEVELS: usize = 9;

/// Level at which comparisons bind (non-associative)
const CMP_LEVEL: usize = 2;

/// Binary operator of `token` at precedence `level`, loosest level first
fn binary_op(level: usize, token: &Token) -> Option<BinOp> {
    Some(match (level, token) {
        (0, Token::PipePipe) => BinOp::Or,
        (1, Token::AmpAmp) => BinOp::And,
        (3, Token::Pipe) => BinOp::BitOr,
        (4, Token::Caret) => BinOp::BitXor,
        (5, Token::Amp) => BinOp::BitAnd,
        (6, Token::LtLt) => BinOp::Shl,
        (6, Token::GtGt) => BinOp::Shr,
        (7, Token::Plus) => BinOp::Add,
        (7, Token::Minus) => BinOp::Sub,
        (8, Token::Star) => BinOp::Mul,
        (8, Token::Slash) => BinOp::FloorDiv,
        (8, Token::Percent) => BinOp::FloorMod,
        _ => return None,
    })
}

fn cmp_op(token: &Token) -> Option<CmpOp> {
    Some(match token {
        Token::EqEq => CmpOp::Eq,
        Token::NotEq => CmpOp::Ne,
        Token::Lt => CmpOp::Lt,
        Token::LtEq => CmpOp::Le,
        Token::Gt => CmpOp::Gt,
        Token::GtEq => CmpOp::Ge,
        _ => return None,
    })
}

impl Parser {
    pub(super) fn parse_expr(&mut self) -> Result<Syn> {
        stacker::maybe_grow(crate::ir::STACK_RED_ZONE, crate::ir::STACK_GROW_SIZE, || self.parse_select())
    }

    fn parse_select(&mut self) -> Result<Syn> {
        let cond = self.parse_level(0)?;
        if !self.eat(&Token::Question) {
            return Ok(cond);
        }
        let then = self.parse_expr()?;
        self.expect(&Token::Colon)?;
        let otherwise = self.parse_expr()?;
        let span = cond.span.merge(otherwise.span);
        Ok(Syn::new(SynKind::Select(Box::new(cond), Box::new(then), Box::new(otherwise)), span))
    }

    fn parse_level(&mut self, level: usize) -> Result<Syn> {
        if level == LEVELS {
            return self.parse_unary();
        }
        let mut lhs = self.parse_level(level + 1)?;
        if level == CMP_LEVEL {
            if let Some(op) = self.peek().and_then(cmp_op) {
                self.advance();
                let rhs = self.parse_level(level + 1)?;
                let span = lhs.span.merge(rhs.span);
                lhs = Syn::new(SynKind::Cmp(op, Box::new(lhs), Box::new(rhs)), span);
            }
            return Ok(lhs);
        }
        loop {
            let Some(op) = self.peek().and_then(|tok| binary_op(level, tok)) else {
                return Ok(lhs);
            };
            self.advance();
            let rhs = self.parse_level(level + 1)?;
            let span = lhs.span.merge(rhs.span);
            lhs = Syn::new(SynKind::Binary(op, Box::new(lhs), Box::new(rhs)), span);
        }
    }

    fn parse_unary(&mut self) -> Result<Syn> {
        let start = self.current_span();
        let op = match self.peek() {
            Some(Token::Minus) => UnOp::Neg,
            Some(Token::Tilde) => UnOp::BitNot,
            Some(Token::Bang) => UnOp::Not,
            Some(Token::LParen) if self.at_cast() => {
                self.advance();
                let ty = self.parse_type()?;
                self.expect(&Token::RParen)?;
                let operand = self.parse_unary()?;
                let span = start.merge(operand.span);
                return Ok(Syn::new(SynKind::Cast(ty, Box::new(operand)), span));
            }
            _ => return self.parse_primary(),
        };
        self.advance();
        let operand = stacker::maybe_grow(crate::ir::STACK_RED_ZONE, crate::ir::STACK_GROW_SIZE, || {
            self.parse_unary()
        })?;
        let span = start.merge(operand.span);
        Ok(Syn::new(SynKind::Unary(op, Box::new(operand)), span))
    }

    /// `(` type-name `)`
    fn at_cast(&self) -> bool {
        matches!(self.peek_at(1), Some(Token::Ident(name)) if Type::from_name(name).is_some())
            && self.peek_at(2) == Some(&Token::RParen)
    }

    fn parse_primary(&mut self) -> Result<Syn> {
        let span = self.current_span();
        let kind = match self.advance() {
            Some(Token::IntLit(lit)) => SynKind::Int { value: lit.value, suffix: lit.suffix },
            Some(Token::True) => SynKind::Bool(true),
            Some(Token::False) => SynKind::Bool(false),
            Some(Token::Ident(name)) => SynKind::Name(name),
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                return Ok(inner);
            }
            Some(other) => return Err(NiterError::parser(format!("expected expression, found `{other}`"), span)),
            None => return Err(NiterError::parser("expected expression, found end of input", span)),
        };
        Ok(Syn::new(kind, span))
    }
}

// ============================================================================
// Lowering
// ============================================================================

/// Variables in scope while lowering one function
pub(super) struct Lowering<'a> {
    pub arena: &'a mut ExprArena,
    pub vars: &'a HashMap<String, VarId>,
}

impl Lowering<'_> {
    /// Lower `syn`, which must have type `ty`
    pub fn lower_as(&mut self, syn: &Syn, ty: Type) -> Result<ExprId> {
        let id = self.lower(syn, Some(ty))?;
        let found = self.arena.ty(id);
        if found != ty {
            return Err(NiterError::parser(format!("expected a value of type {ty}, found {found}"), syn.span));
        }
        Ok(id)
    }

    /// Lower `syn` where its type must be inferable on its own
    pub fn lower_untyped(&mut self, syn: &Syn) -> Result<ExprId> {
        self.lower(syn, None)
    }

    /// Type of `syn` that does not depend on context
    fn infer(&self, syn: &Syn) -> Option<Type> {
        match &syn.kind {
            SynKind::Int { suffix, .. } => *suffix,
            SynKind::Bool(_) | SynKind::Cmp(..) | SynKind::Unary(UnOp::Not, _) => Some(Type::BOOL),
            SynKind::Binary(op, _, _) if op.is_truth() => Some(Type::BOOL),
            SynKind::Name(name) => self.vars.get(name).map(|&v| self.arena.var_type(v)),
            SynKind::Unary(_, inner) => self.infer(inner),
            SynKind::Binary(_, lhs, rhs) => self.infer(lhs).or_else(|| self.infer(rhs).filter(|t| !t.pointer)),
            SynKind::Cast(ty, _) => Some(*ty),
            SynKind::Select(_, a, b) => self.infer(a).or_else(|| self.infer(b)),
        }
    }

    fn lower(&mut self, syn: &Syn, expected: Option<Type>) -> Result<ExprId> {
        stacker::maybe_grow(crate::ir::STACK_RED_ZONE, crate::ir::STACK_GROW_SIZE, || {
            self.lower_inner(syn, expected)
        })
    }

    fn lower_inner(&mut self, syn: &Syn, expected: Option<Type>) -> Result<ExprId> {
        let span = syn.span;
        let untyped = || NiterError::parser("cannot infer the type of this expression; add a suffix such as `1i32`", span);
        match &syn.kind {
            SynKind::Int { value, suffix } => {
                let ty = suffix.or(expected).ok_or_else(untyped)?;
                self.literal(ty, *value, false, span)
            }
            SynKind::Bool(b) => Ok(self.arena.boolean(*b)),
            SynKind::Name(name) => {
                let var = self
                    .vars
                    .get(name)
                    .ok_or_else(|| NiterError::parser(format!("unknown variable `{name}`"), span))?;
                Ok(self.arena.var(*var))
            }
            SynKind::Unary(UnOp::Neg, inner) if matches!(inner.kind, SynKind::Int { .. }) => {
                let SynKind::Int { value, suffix } = &inner.kind else {
                    return Err(untyped());
                };
                let ty = suffix.or(expected).ok_or_else(untyped)?;
                self.literal(ty, *value, true, span)
            }
            SynKind::Unary(UnOp::Not, inner) => {
                let operand = self.lower_as(inner, Type::BOOL)?;
                Ok(self.arena.unary(UnOp::Not, Type::BOOL, operand))
            }
            SynKind::Unary(op, inner) => {
                let operand = self.lower(inner, expected)?;
                let ty = self.arena.ty(operand);
                Ok(self.arena.unary(*op, ty, operand))
            }
            SynKind::Binary(op, lhs, rhs) if op.is_truth() => {
                let a = self.lower_as(lhs, Type::BOOL)?;
                let b = self.lower_as(rhs, Type::BOOL)?;
                Ok(self.arena.binary(*op, Type::BOOL, a, b))
            }
            SynKind::Binary(op, lhs, rhs) => {
                let ty = self.infer(syn).or(expected).ok_or_else(untyped)?;
                let a = self.lower_as(lhs, ty)?;
                // Pointers are offset by unsigned byte counts of their width
                let rhs_ty = if ty.pointer && matches!(op, BinOp::Add | BinOp::Sub) { ty.unsigned() } else { ty };
                let b = self.lower_as(rhs, rhs_ty)?;
                Ok(self.arena.binary(*op, ty, a, b))
            }
            SynKind::Cmp(op, lhs, rhs) => {
                let ty = self.infer(lhs).or_else(|| self.infer(rhs)).ok_or_else(untyped)?;
                let a = self.lower_as(lhs, ty)?;
                let b = self.lower_as(rhs, ty)?;
                Ok(self.arena.compare(*op, a, b))
            }
            SynKind::Cast(ty, inner) => {
                let hint = if self.infer(inner).is_none() { Some(*ty) } else { None };
                let operand = self.lower(inner, hint)?;
                Ok(self.arena.cast(*ty, operand))
            }
            SynKind::Select(cond, a, b) => {
                let ty = self.infer(syn).or(expected).ok_or_else(untyped)?;
                let c = self.lower_as(cond, Type::BOOL)?;
                let then = self.lower_as(a, ty)?;
                let otherwise = self.lower_as(b, ty)?;
                Ok(self.arena.select(c, then, otherwise))
            }
        }
    }

    fn literal(&mut self, ty: Type, value: u128, negative: bool, span: Span) -> Result<ExprId> {
        if ty.is_bool() {
            return Err(NiterError::parser("integer literal where a bool is expected", span));
        }
        if value > ty.mask() as u128 {
            return Err(NiterError::parser(format!("literal {value} does not fit in {ty}"), span));
        }
        let bits = if negative { (value as u64).wrapping_neg() } else { value as u64 };
        Ok(self.arena.constant(ty, bits))
    }
}
