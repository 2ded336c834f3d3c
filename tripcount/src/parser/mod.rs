//! Recursive-descent parser for the textual loop IR
//!
//! ```text
//! fn count(n: i32) {
//! entry:
//!   goto header
//! header:
//!   i: i32 = phi [entry: 0, latch: i.next]
//!   br i < n, latch, exit
//! latch:
//!   i.next: i32 = i + 1
//!   goto header
//! exit:
//!   return
//! }
//! ```
//!
//! A file holds one or more functions sharing one expression arena. The
//! first block of a function is its entry.

mod expr;

use crate::error::{NiterError, Result};
use crate::ir::{ExprArena, Function, FunctionBuilder, StmtKind, Type, VarId};
use crate::lexer::{self, Token};
use crate::span::Span;
use expr::{Lowering, Syn};
use std::collections::HashMap;

/// Parsed IR file
#[derive(Debug)]
pub struct Program {
    pub arena: ExprArena,
    pub functions: Vec<Function>,
}

impl Program {
    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }
}

/// Parse loop IR source
pub fn parse(source: &str) -> Result<Program> {
    let tokens = lexer::tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0, eof: Span::new(source.len(), source.len()) };
    let mut arena = ExprArena::new();
    let mut functions = Vec::new();
    while !parser.at_end() {
        let syntax = parser.parse_function()?;
        functions.push(build_function(&mut arena, syntax)?);
    }
    tracing::trace!(functions = functions.len(), nodes = arena.len(), "parsed IR");
    Ok(Program { arena, functions })
}

// ============================================================================
// Syntax
// ============================================================================

type Name = (String, Span);

enum Rhs {
    Phi(Vec<(Name, Syn)>),
    Load(Syn),
    Call(String, Vec<Syn>),
    Value(Syn),
}

enum SynStmt {
    Def { dest: Name, ty: Type, rhs: Rhs },
    Store { addr: Syn, value: Syn },
    Call { callee: String, args: Vec<Syn> },
    Branch { cond: Syn, if_true: Name, if_false: Name },
    Goto(Name),
    Return(Option<Syn>),
}

struct SynBlock {
    label: Name,
    stmts: Vec<(SynStmt, Span)>,
}

struct SynFunction {
    name: String,
    params: Vec<(Name, Type)>,
    blocks: Vec<SynBlock>,
}

// ============================================================================
// Token stream
// ============================================================================

struct Parser {
    tokens: Vec<(Token, Span)>,
    pos: usize,
    /// Empty span at the end of the source
    eof: Span,
}

impl Parser {
    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek(&self) -> Option<&Token> {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset).map(|(t, _)| t)
    }

    fn current_span(&self) -> Span {
        self.tokens.get(self.pos).map_or(self.eof, |(_, s)| *s)
    }

    fn advance(&mut self) -> Option<Token> {
        let (token, _) = self.tokens.get(self.pos)?.clone();
        self.pos += 1;
        Some(token)
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token) -> Result<Span> {
        let span = self.current_span();
        match self.peek() {
            Some(t) if t == token => {
                self.pos += 1;
                Ok(span)
            }
            Some(t) => Err(NiterError::parser(format!("expected `{token}`, found `{t}`"), span)),
            None => Err(NiterError::parser(format!("expected `{token}`, found end of input"), span)),
        }
    }

    fn expect_ident(&mut self, what: &str) -> Result<Name> {
        let span = self.current_span();
        match self.advance() {
            Some(Token::Ident(name)) => Ok((name, span)),
            Some(t) => Err(NiterError::parser(format!("expected {what}, found `{t}`"), span)),
            None => Err(NiterError::parser(format!("expected {what}, found end of input"), span)),
        }
    }

    fn parse_type(&mut self) -> Result<Type> {
        let (name, span) = self.expect_ident("a type")?;
        Type::from_name(&name).ok_or_else(|| NiterError::parser(format!("unknown type `{name}`"), span))
    }
}

// ============================================================================
// Functions and statements
// ============================================================================

impl Parser {
    fn parse_function(&mut self) -> Result<SynFunction> {
        self.expect(&Token::Fn)?;
        let (name, _) = self.expect_ident("a function name")?;
        self.expect(&Token::LParen)?;
        let mut params = Vec::new();
        if !self.eat(&Token::RParen) {
            loop {
                let param = self.expect_ident("a parameter name")?;
                self.expect(&Token::Colon)?;
                let ty = self.parse_type()?;
                params.push((param, ty));
                if self.eat(&Token::RParen) {
                    break;
                }
                self.expect(&Token::Comma)?;
            }
        }
        self.expect(&Token::LBrace)?;

        let mut blocks: Vec<SynBlock> = Vec::new();
        while !self.eat(&Token::RBrace) {
            if self.at_label() {
                let label = self.expect_ident("a block label")?;
                self.expect(&Token::Colon)?;
                blocks.push(SynBlock { label, stmts: Vec::new() });
                continue;
            }
            let start = self.current_span();
            let stmt = self.parse_stmt()?;
            let Some(block) = blocks.last_mut() else {
                return Err(NiterError::parser("statement before the first block label", start));
            };
            block.stmts.push((stmt, start));
        }
        Ok(SynFunction { name, params, blocks })
    }

    /// `label:` as opposed to `name: type = ...`
    fn at_label(&self) -> bool {
        let is_def = matches!(self.peek_at(2), Some(Token::Ident(ty)) if Type::from_name(ty).is_some())
            && self.peek_at(3) == Some(&Token::Eq);
        matches!(self.peek(), Some(Token::Ident(_))) && self.peek_at(1) == Some(&Token::Colon) && !is_def
    }

    fn parse_stmt(&mut self) -> Result<SynStmt> {
        let span = self.current_span();
        match self.peek() {
            Some(Token::Ident(_)) => {
                let dest = self.expect_ident("a variable")?;
                self.expect(&Token::Colon)?;
                let ty = self.parse_type()?;
                self.expect(&Token::Eq)?;
                let rhs = self.parse_rhs()?;
                Ok(SynStmt::Def { dest, ty, rhs })
            }
            Some(Token::Store) => {
                self.advance();
                let addr = self.parse_expr()?;
                self.expect(&Token::Comma)?;
                let value = self.parse_expr()?;
                Ok(SynStmt::Store { addr, value })
            }
            Some(Token::Call) => {
                self.advance();
                let (callee, args) = self.parse_call_tail()?;
                Ok(SynStmt::Call { callee, args })
            }
            Some(Token::Br) => {
                self.advance();
                let cond = self.parse_expr()?;
                self.expect(&Token::Comma)?;
                let if_true = self.expect_ident("a block label")?;
                self.expect(&Token::Comma)?;
                let if_false = self.expect_ident("a block label")?;
                Ok(SynStmt::Branch { cond, if_true, if_false })
            }
            Some(Token::Goto) => {
                self.advance();
                Ok(SynStmt::Goto(self.expect_ident("a block label")?))
            }
            Some(Token::Return) => {
                self.advance();
                // A value never starts with `name:`
                let ends = matches!(self.peek(), None | Some(Token::RBrace))
                    || matches!(self.peek(), Some(Token::Ident(_))) && self.peek_at(1) == Some(&Token::Colon);
                let value = if ends { None } else { Some(self.parse_expr()?) };
                Ok(SynStmt::Return(value))
            }
            Some(t) => Err(NiterError::parser(format!("expected a statement, found `{t}`"), span)),
            None => Err(NiterError::parser("expected a statement, found end of input", span)),
        }
    }

    fn parse_rhs(&mut self) -> Result<Rhs> {
        if self.eat(&Token::Phi) {
            self.expect(&Token::LBracket)?;
            let mut args = Vec::new();
            if !self.eat(&Token::RBracket) {
                loop {
                    let from = self.expect_ident("a block label")?;
                    self.expect(&Token::Colon)?;
                    args.push((from, self.parse_expr()?));
                    if self.eat(&Token::RBracket) {
                        break;
                    }
                    self.expect(&Token::Comma)?;
                }
            }
            return Ok(Rhs::Phi(args));
        }
        if self.eat(&Token::Load) {
            return Ok(Rhs::Load(self.parse_expr()?));
        }
        if self.eat(&Token::Call) {
            let (callee, args) = self.parse_call_tail()?;
            return Ok(Rhs::Call(callee, args));
        }
        Ok(Rhs::Value(self.parse_expr()?))
    }

    /// `name(args)`
    fn parse_call_tail(&mut self) -> Result<(String, Vec<Syn>)> {
        let (callee, _) = self.expect_ident("a function name")?;
        self.expect(&Token::LParen)?;
        let mut args = Vec::new();
        if !self.eat(&Token::RParen) {
            loop {
                args.push(self.parse_expr()?);
                if self.eat(&Token::RParen) {
                    break;
                }
                self.expect(&Token::Comma)?;
            }
        }
        Ok((callee, args))
    }
}

// ============================================================================
// Building
// ============================================================================

fn build_function(arena: &mut ExprArena, syntax: SynFunction) -> Result<Function> {
    let mut fb = FunctionBuilder::new(syntax.name.as_str());

    let mut vars: HashMap<String, VarId> = HashMap::new();
    let mut declare = |arena: &mut ExprArena, (name, span): &Name, ty: Type| {
        if vars.contains_key(name) {
            return Err(NiterError::parser(format!("`{name}` is defined more than once"), *span));
        }
        let var = arena.new_var(name.as_str(), ty);
        vars.insert(name.clone(), var);
        Ok(var)
    };
    for (param, ty) in &syntax.params {
        let var = declare(arena, param, *ty)?;
        fb.add_param(var);
    }
    for block in &syntax.blocks {
        for (stmt, _) in &block.stmts {
            if let SynStmt::Def { dest, ty, .. } = stmt {
                declare(arena, dest, *ty)?;
            }
        }
    }

    let mut labels = HashMap::new();
    for block in &syntax.blocks {
        let (label, span) = &block.label;
        if labels.insert(label.clone(), fb.add_block(label.as_str())).is_some() {
            return Err(NiterError::parser(format!("duplicate block `{label}`"), *span));
        }
    }
    let target = |(label, span): &Name| {
        labels
            .get(label)
            .copied()
            .ok_or_else(|| NiterError::parser(format!("unknown block `{label}`"), *span))
    };

    let mut lower = Lowering { arena, vars: &vars };
    for block in &syntax.blocks {
        let id = target(&block.label)?;
        for (stmt, span) in &block.stmts {
            match stmt {
                SynStmt::Def { dest, ty, rhs } => {
                    let dest = vars[&dest.0];
                    let kind = match rhs {
                        Rhs::Phi(args) => {
                            let mut lowered = Vec::with_capacity(args.len());
                            for (from, value) in args {
                                lowered.push((target(from)?, lower.lower_as(value, *ty)?));
                            }
                            StmtKind::Phi { dest, args: lowered }
                        }
                        Rhs::Load(addr) => StmtKind::Load { dest, addr: lower.lower_untyped(addr)? },
                        Rhs::Call(callee, args) => StmtKind::Call {
                            dest: Some(dest),
                            callee: callee.clone(),
                            args: args.iter().map(|a| lower.lower_untyped(a)).collect::<Result<_>>()?,
                        },
                        Rhs::Value(value) => StmtKind::Assign { dest, value: lower.lower_as(value, *ty)? },
                    };
                    fb.push(id, kind);
                }
                SynStmt::Store { addr, value } => {
                    let addr = lower.lower_untyped(addr)?;
                    let value = lower.lower_untyped(value)?;
                    fb.push(id, StmtKind::Store { addr, value });
                }
                SynStmt::Call { callee, args } => {
                    let args = args.iter().map(|a| lower.lower_untyped(a)).collect::<Result<_>>()?;
                    fb.push(id, StmtKind::Call { dest: None, callee: callee.clone(), args });
                }
                SynStmt::Branch { cond, if_true, if_false } => {
                    let cond = lower.lower_as(cond, Type::BOOL)?;
                    fb.branch(id, cond, target(if_true)?, target(if_false)?);
                }
                SynStmt::Goto(label) => fb.goto(id, target(label)?),
                SynStmt::Return(value) => {
                    let value = value.as_ref().map(|v| lower.lower_untyped(v)).transpose()?;
                    fb.ret(id, value);
                }
            }
            tracing::trace!(block = %block.label.0, span = %span, "lowered statement");
        }
    }

    fb.finish(lower.arena)
}
