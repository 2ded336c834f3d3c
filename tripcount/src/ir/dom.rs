//! Dominator tree
//!
//! Cooper, Harvey and Kennedy's iterative algorithm over reverse postorder.
//! Queries walk the immediate-dominator chain iteratively.

use super::{BlockId, Function, StmtId};

#[derive(Debug, Clone)]
pub struct DomTree {
    idom: Vec<Option<BlockId>>,
    /// Reverse-postorder number, `None` for unreachable blocks
    order: Vec<Option<usize>>,
    rpo: Vec<BlockId>,
}

impl DomTree {
    pub fn new(func: &Function) -> Self {
        let n = func.num_blocks();
        let rpo = reverse_postorder(func);
        let mut order = vec![None; n];
        for (i, &b) in rpo.iter().enumerate() {
            order[b.index()] = Some(i);
        }

        let entry = func.entry();
        let mut idom: Vec<Option<BlockId>> = vec![None; n];
        idom[entry.index()] = Some(entry);

        let mut changed = true;
        while changed {
            changed = false;
            for &b in rpo.iter().skip(1) {
                let mut new_idom: Option<BlockId> = None;
                for &p in func.preds(b) {
                    if idom[p.index()].is_none() {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => p,
                        Some(cur) => intersect(&idom, &order, p, cur),
                    });
                }
                if new_idom.is_some() && idom[b.index()] != new_idom {
                    idom[b.index()] = new_idom;
                    changed = true;
                }
            }
        }
        // The entry has no immediate dominator
        idom[entry.index()] = None;

        Self { idom, order, rpo }
    }

    pub fn immediate_dominator(&self, block: BlockId) -> Option<BlockId> {
        self.idom[block.index()]
    }

    pub fn is_reachable(&self, block: BlockId) -> bool {
        self.order[block.index()].is_some()
    }

    pub fn reverse_postorder(&self) -> &[BlockId] {
        &self.rpo
    }

    /// `a` dominates `b` (reflexive)
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        if a == b {
            return true;
        }
        let mut cur = b;
        while let Some(parent) = self.idom[cur.index()] {
            if parent == a {
                return true;
            }
            cur = parent;
        }
        false
    }

    /// `b` is dominated by `a`
    pub fn dominated_by(&self, b: BlockId, a: BlockId) -> bool {
        self.dominates(a, b)
    }

    /// `s1` executes before `s2` on every path reaching `s2`
    pub fn stmt_dominates_stmt(&self, func: &Function, s1: StmtId, s2: StmtId) -> bool {
        let b1 = func.stmt(s1).block;
        let b2 = func.stmt(s2).block;
        if b1 != b2 {
            return self.dominates(b1, b2);
        }
        func.position(s1) <= func.position(s2)
    }
}

fn intersect(idom: &[Option<BlockId>], order: &[Option<usize>], a: BlockId, b: BlockId) -> BlockId {
    let rank = |x: BlockId| order[x.index()].unwrap_or(usize::MAX);
    let (mut f1, mut f2) = (a, b);
    while f1 != f2 {
        while rank(f1) > rank(f2) {
            match idom[f1.index()] {
                Some(up) => f1 = up,
                None => return f2,
            }
        }
        while rank(f2) > rank(f1) {
            match idom[f2.index()] {
                Some(up) => f2 = up,
                None => return f1,
            }
        }
    }
    f1
}

fn reverse_postorder(func: &Function) -> Vec<BlockId> {
    let n = func.num_blocks();
    let mut visited = vec![false; n];
    let mut post = Vec::with_capacity(n);
    let entry = func.entry();
    let mut stack = vec![(entry, 0usize)];
    visited[entry.index()] = true;
    while let Some((block, next)) = stack.pop() {
        let succs = func.succs(block);
        if next < succs.len() {
            stack.push((block, next + 1));
            let dest = succs[next].dest;
            if !visited[dest.index()] {
                visited[dest.index()] = true;
                stack.push((dest, 0));
            }
        } else {
            post.push(block);
        }
    }
    post.reverse();
    post
}
