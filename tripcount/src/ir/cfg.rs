//! Control-flow graph in SSA form

use super::{BlockId, ExprArena, ExprId, StmtId, Type, VarId};
use crate::error::{NiterError, Result};
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;

/// Polarity of a CFG edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    /// Taken when the block's branch condition holds
    True,
    /// Taken when the block's branch condition fails
    False,
    /// Unconditional
    Fallthru,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Edge {
    pub src: BlockId,
    pub dest: BlockId,
    pub kind: EdgeKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Phi { dest: VarId, args: Vec<(BlockId, ExprId)> },
    Assign { dest: VarId, value: ExprId },
    Load { dest: VarId, addr: ExprId },
    Store { addr: ExprId, value: ExprId },
    Call { dest: Option<VarId>, callee: String, args: Vec<ExprId> },
    /// Two-way conditional terminator
    Branch { cond: ExprId },
    Return(Option<ExprId>),
}

impl StmtKind {
    pub fn dest(&self) -> Option<VarId> {
        match self {
            StmtKind::Phi { dest, .. } | StmtKind::Assign { dest, .. } | StmtKind::Load { dest, .. } => Some(*dest),
            StmtKind::Call { dest, .. } => *dest,
            _ => None,
        }
    }

    /// Reads or writes memory, or calls out
    pub fn has_side_effects(&self) -> bool {
        matches!(self, StmtKind::Load { .. } | StmtKind::Store { .. } | StmtKind::Call { .. })
    }

    /// Expressions read by the statement
    pub fn uses(&self) -> Vec<ExprId> {
        match self {
            StmtKind::Phi { args, .. } => args.iter().map(|&(_, e)| e).collect(),
            StmtKind::Assign { value, .. } => vec![*value],
            StmtKind::Load { addr, .. } => vec![*addr],
            StmtKind::Store { addr, value } => vec![*addr, *value],
            StmtKind::Call { args, .. } => args.clone(),
            StmtKind::Branch { cond } => vec![*cond],
            StmtKind::Return(value) => value.iter().copied().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub block: BlockId,
}

#[derive(Debug, Clone, Default)]
pub struct BasicBlock {
    pub name: String,
    pub stmts: Vec<StmtId>,
    pub succs: Vec<Edge>,
    pub preds: Vec<BlockId>,
}

/// A function body: blocks, statements and SSA definitions
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub params: Vec<VarId>,
    blocks: Vec<BasicBlock>,
    stmts: Vec<Stmt>,
    defs: HashMap<VarId, StmtId>,
}

impl Function {
    pub fn entry(&self) -> BlockId {
        BlockId(0)
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        (0..self.blocks.len() as u32).map(BlockId)
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.index()]
    }

    pub fn block_by_name(&self, name: &str) -> Option<BlockId> {
        self.blocks.iter().position(|b| b.name == name).map(|i| BlockId(i as u32))
    }

    pub fn stmt(&self, id: StmtId) -> &Stmt {
        &self.stmts[id.index()]
    }

    pub fn succs(&self, id: BlockId) -> &[Edge] {
        &self.blocks[id.index()].succs
    }

    pub fn preds(&self, id: BlockId) -> &[BlockId] {
        &self.blocks[id.index()].preds
    }

    /// The edge from `src` to `dest`, if any
    pub fn edge(&self, src: BlockId, dest: BlockId) -> Option<Edge> {
        self.succs(src).iter().copied().find(|e| e.dest == dest)
    }

    /// Defining statement of an SSA variable (`None` for parameters)
    pub fn def_stmt(&self, var: VarId) -> Option<StmtId> {
        self.defs.get(&var).copied()
    }

    pub fn is_param(&self, var: VarId) -> bool {
        self.params.contains(&var)
    }

    pub fn last_stmt(&self, block: BlockId) -> Option<StmtId> {
        self.block(block).stmts.last().copied()
    }

    /// Branch statement and condition ending `block`
    pub fn branch_of(&self, block: BlockId) -> Option<(StmtId, ExprId)> {
        let last = self.last_stmt(block)?;
        match self.stmt(last).kind {
            StmtKind::Branch { cond } => Some((last, cond)),
            _ => None,
        }
    }

    /// Position of a statement inside its block
    pub fn position(&self, stmt: StmtId) -> usize {
        let block = self.stmt(stmt).block;
        self.block(block).stmts.iter().position(|&s| s == stmt).unwrap_or(usize::MAX)
    }

    /// Render the function in textual IR syntax
    pub fn display(&self, arena: &ExprArena) -> String {
        let mut out = String::new();
        let params: Vec<String> = self
            .params
            .iter()
            .map(|&p| format!("{}: {}", arena.var_name(p), arena.var_type(p)))
            .collect();
        let _ = writeln!(out, "fn {}({}) {{", self.name, params.join(", "));
        for block in &self.blocks {
            let _ = writeln!(out, "{}:", block.name);
            for &sid in &block.stmts {
                let _ = writeln!(out, "  {}", self.display_stmt(arena, sid));
            }
            if let &[edge] = block.succs.as_slice() {
                let _ = writeln!(out, "  goto {}", self.block(edge.dest).name);
            }
        }
        out.push('}');
        out.push('\n');
        out
    }

    pub fn display_stmt(&self, arena: &ExprArena, stmt: StmtId) -> String {
        let def = |v: VarId| format!("{}: {}", arena.var_name(v), arena.var_type(v));
        let block = self.stmt(stmt).block;
        match &self.stmt(stmt).kind {
            StmtKind::Phi { dest, args } => {
                let args: Vec<String> = args
                    .iter()
                    .map(|&(b, e)| format!("{}: {}", self.block(b).name, arena.display(e)))
                    .collect();
                format!("{} = phi [{}]", def(*dest), args.join(", "))
            }
            StmtKind::Assign { dest, value } => format!("{} = {}", def(*dest), arena.display(*value)),
            StmtKind::Load { dest, addr } => format!("{} = load {}", def(*dest), arena.display(*addr)),
            StmtKind::Store { addr, value } => {
                format!("store {}, {}", arena.display(*addr), arena.display(*value))
            }
            StmtKind::Call { dest, callee, args } => {
                let args: Vec<String> = args.iter().map(|&a| arena.display(a).to_string()).collect();
                let call = format!("call {}({})", callee, args.join(", "));
                match dest {
                    Some(d) => format!("{} = {}", def(*d), call),
                    None => call,
                }
            }
            StmtKind::Branch { cond } => {
                let target = |kind| {
                    self.succs(block)
                        .iter()
                        .find(|e| e.kind == kind)
                        .map_or("?", |e| self.block(e.dest).name.as_str())
                };
                format!(
                    "br {}, {}, {}",
                    arena.display(*cond),
                    target(EdgeKind::True),
                    target(EdgeKind::False)
                )
            }
            StmtKind::Return(Some(value)) => format!("return {}", arena.display(*value)),
            StmtKind::Return(None) => "return".to_string(),
        }
    }
}

// ============================================================================
// Builder
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Terminator {
    Open,
    Goto(BlockId),
    Branch,
    Return,
}

/// Incremental construction of a `Function`
///
/// Blocks may be referenced before they receive statements. `finish`
/// checks the SSA and terminator rules and computes predecessor lists.
#[derive(Debug)]
pub struct FunctionBuilder {
    name: String,
    params: Vec<VarId>,
    blocks: Vec<BasicBlock>,
    terminators: Vec<Terminator>,
    stmts: Vec<Stmt>,
    errors: Vec<String>,
}

impl FunctionBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            blocks: Vec::new(),
            terminators: Vec::new(),
            stmts: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn add_param(&mut self, var: VarId) {
        self.params.push(var);
    }

    /// Create a block; the first block created is the entry
    pub fn add_block(&mut self, name: impl Into<String>) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BasicBlock { name: name.into(), ..BasicBlock::default() });
        self.terminators.push(Terminator::Open);
        id
    }

    pub fn block_name(&self, block: BlockId) -> &str {
        &self.blocks[block.index()].name
    }

    /// Append a non-terminator statement
    pub fn push(&mut self, block: BlockId, kind: StmtKind) -> StmtId {
        if matches!(kind, StmtKind::Branch { .. } | StmtKind::Return(_)) {
            self.errors.push(format!("terminator pushed as a plain statement in `{}`", self.block_name(block)));
        }
        self.check_open(block);
        self.append(block, kind)
    }

    pub fn goto(&mut self, block: BlockId, target: BlockId) {
        self.check_open(block);
        self.terminators[block.index()] = Terminator::Goto(target);
    }

    pub fn branch(&mut self, block: BlockId, cond: ExprId, if_true: BlockId, if_false: BlockId) -> StmtId {
        self.check_open(block);
        let sid = self.append(block, StmtKind::Branch { cond });
        let b = &mut self.blocks[block.index()];
        b.succs.push(Edge { src: block, dest: if_true, kind: EdgeKind::True });
        b.succs.push(Edge { src: block, dest: if_false, kind: EdgeKind::False });
        self.terminators[block.index()] = Terminator::Branch;
        sid
    }

    pub fn ret(&mut self, block: BlockId, value: Option<ExprId>) -> StmtId {
        self.check_open(block);
        let sid = self.append(block, StmtKind::Return(value));
        self.terminators[block.index()] = Terminator::Return;
        sid
    }

    fn check_open(&mut self, block: BlockId) {
        if self.terminators[block.index()] != Terminator::Open {
            self.errors.push(format!("block `{}` continues after its terminator", self.block_name(block)));
        }
    }

    fn append(&mut self, block: BlockId, kind: StmtKind) -> StmtId {
        let id = StmtId(self.stmts.len() as u32);
        self.stmts.push(Stmt { kind, block });
        self.blocks[block.index()].stmts.push(id);
        id
    }

    /// Validate and produce the function
    pub fn finish(mut self, arena: &ExprArena) -> Result<Function> {
        if let Some(first) = self.errors.first() {
            return Err(NiterError::ir(first.clone()));
        }
        if self.blocks.is_empty() {
            return Err(NiterError::ir(format!("function `{}` has no blocks", self.name)));
        }

        let mut names = HashSet::new();
        for block in &self.blocks {
            if !names.insert(block.name.as_str()) {
                return Err(NiterError::ir(format!("duplicate block `{}`", block.name)));
            }
        }

        for (index, term) in self.terminators.iter().enumerate() {
            let block = BlockId(index as u32);
            match *term {
                Terminator::Open => {
                    return Err(NiterError::ir(format!("block `{}` has no terminator", self.blocks[index].name)));
                }
                Terminator::Goto(target) => {
                    self.blocks[index].succs.push(Edge { src: block, dest: target, kind: EdgeKind::Fallthru });
                }
                Terminator::Branch | Terminator::Return => {}
            }
        }

        let count = self.blocks.len();
        for index in 0..count {
            let succs = self.blocks[index].succs.clone();
            for edge in succs {
                if edge.dest.index() >= count {
                    return Err(NiterError::ir(format!("edge to unknown block from `{}`", self.blocks[index].name)));
                }
                let preds = &mut self.blocks[edge.dest.index()].preds;
                if !preds.contains(&edge.src) {
                    preds.push(edge.src);
                }
            }
        }

        let mut defs = HashMap::new();
        let mut defined: HashSet<VarId> = self.params.iter().copied().collect();
        if defined.len() != self.params.len() {
            return Err(NiterError::ir("duplicate parameter"));
        }
        for (index, stmt) in self.stmts.iter().enumerate() {
            if let Some(dest) = stmt.kind.dest() {
                if !defined.insert(dest) {
                    return Err(NiterError::ir(format!("`{}` is defined more than once", arena.var_name(dest))));
                }
                defs.insert(dest, StmtId(index as u32));
            }
        }

        for block in &self.blocks {
            let mut seen_other = false;
            for &sid in &block.stmts {
                let stmt = &self.stmts[sid.index()];
                match &stmt.kind {
                    StmtKind::Phi { args, dest } => {
                        if seen_other {
                            return Err(NiterError::ir(format!("phi `{}` after a non-phi statement", arena.var_name(*dest))));
                        }
                        for (from, _) in args {
                            if !block.preds.contains(from) {
                                return Err(NiterError::ir(format!(
                                    "phi `{}` names `{}`, which is not a predecessor of `{}`",
                                    arena.var_name(*dest),
                                    self.blocks.get(from.index()).map_or("?", |b| b.name.as_str()),
                                    block.name
                                )));
                            }
                        }
                    }
                    StmtKind::Branch { cond } if arena.ty(*cond) != Type::BOOL => {
                        return Err(NiterError::ir(format!("branch condition in `{}` is not bool", block.name)));
                    }
                    _ => seen_other = true,
                }
                for used in stmt.kind.uses() {
                    if let Some(var) = arena.var_uses(used).into_iter().find(|v| !defined.contains(v)) {
                        return Err(NiterError::ir(format!("`{}` is used but never defined", arena.var_name(var))));
                    }
                }
            }
        }

        Ok(Function { name: self.name, params: self.params, blocks: self.blocks, stmts: self.stmts, defs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_computes_preds() {
        let mut arena = ExprArena::new();
        let mut fb = FunctionBuilder::new("f");
        let entry = fb.add_block("entry");
        let body = fb.add_block("body");
        let exit = fb.add_block("exit");
        let t = arena.boolean(true);
        fb.branch(entry, t, body, exit);
        fb.goto(body, exit);
        fb.ret(exit, None);
        let func = fb.finish(&arena).expect("valid function");
        assert_eq!(func.preds(exit), &[entry, body]);
        assert_eq!(func.succs(entry).len(), 2);
        assert!(func.branch_of(entry).is_some());
        assert!(func.branch_of(body).is_none());
    }

    #[test]
    fn test_missing_terminator_rejected() {
        let arena = ExprArena::new();
        let mut fb = FunctionBuilder::new("f");
        fb.add_block("entry");
        let err = fb.finish(&arena).unwrap_err();
        assert!(err.message().contains("no terminator"));
    }

    #[test]
    fn test_double_definition_rejected() {
        let mut arena = ExprArena::new();
        let ty = Type::sint(32);
        let x = arena.new_var("x", ty);
        let one = arena.int(ty, 1);
        let mut fb = FunctionBuilder::new("f");
        let entry = fb.add_block("entry");
        fb.push(entry, StmtKind::Assign { dest: x, value: one });
        fb.push(entry, StmtKind::Assign { dest: x, value: one });
        fb.ret(entry, None);
        let err = fb.finish(&arena).unwrap_err();
        assert!(err.message().contains("more than once"));
    }
}
