//! Natural-loop discovery
//!
//! A back edge is an edge `u -> h` whose target dominates its source. All
//! back edges into one header form one loop; its body is everything that
//! reaches a latch without passing through the header.

use super::{BlockId, DomTree, Edge, Function, LoopId};
use crate::niter::{BoundList, Estimate};
use std::collections::BTreeSet;

#[derive(Debug, Clone)]
pub struct Loop {
    pub id: LoopId,
    pub header: BlockId,
    /// Unique latch, when the loop has exactly one back edge
    pub latch: Option<BlockId>,
    pub latches: Vec<BlockId>,
    pub blocks: BTreeSet<BlockId>,
    pub parent: Option<LoopId>,
    /// 1 for outermost loops
    pub depth: u32,
    /// Iteration bounds recorded by the estimator
    pub bounds: BoundList,
    pub estimate: Estimate,
}

impl Loop {
    pub fn contains(&self, block: BlockId) -> bool {
        self.blocks.contains(&block)
    }
}

/// All loops of a function, outer loops before the loops they contain
#[derive(Debug, Clone, Default)]
pub struct LoopForest {
    loops: Vec<Loop>,
    innermost: Vec<Option<LoopId>>,
}

impl LoopForest {
    pub fn discover(func: &Function, dom: &DomTree) -> Self {
        let mut headers: Vec<(BlockId, Vec<BlockId>)> = Vec::new();
        for &block in dom.reverse_postorder() {
            for edge in func.succs(block) {
                if dom.dominates(edge.dest, block) {
                    match headers.iter_mut().find(|(h, _)| *h == edge.dest) {
                        Some((_, latches)) => latches.push(block),
                        None => headers.push((edge.dest, vec![block])),
                    }
                }
            }
        }

        let mut found: Vec<(BlockId, Vec<BlockId>, BTreeSet<BlockId>)> = headers
            .into_iter()
            .map(|(header, latches)| {
                let body = natural_loop_body(func, dom, header, &latches);
                (header, latches, body)
            })
            .collect();
        // Larger bodies first so that every loop follows its ancestors
        found.sort_by(|a, b| {
            b.2.len()
                .cmp(&a.2.len())
                .then_with(|| rpo_rank(dom, a.0).cmp(&rpo_rank(dom, b.0)))
        });

        let mut loops: Vec<Loop> = Vec::with_capacity(found.len());
        let mut innermost = vec![None; func.num_blocks()];
        for (index, (header, latches, blocks)) in found.into_iter().enumerate() {
            let id = LoopId(index as u32);
            let parent = innermost[header.index()];
            let depth = parent.map_or(1, |p: LoopId| loops[p.index()].depth + 1);
            for &b in &blocks {
                innermost[b.index()] = Some(id);
            }
            loops.push(Loop {
                id,
                header,
                latch: if latches.len() == 1 { Some(latches[0]) } else { None },
                latches,
                blocks,
                parent,
                depth,
                bounds: BoundList::default(),
                estimate: Estimate::NotComputed,
            });
        }

        tracing::trace!(count = loops.len(), "discovered loops");
        Self { loops, innermost }
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Loop> {
        self.loops.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = LoopId> + use<> {
        (0..self.loops.len() as u32).map(LoopId)
    }

    pub fn get(&self, id: LoopId) -> &Loop {
        &self.loops[id.index()]
    }

    pub fn get_mut(&mut self, id: LoopId) -> &mut Loop {
        &mut self.loops[id.index()]
    }

    /// Innermost loop containing `block`
    pub fn innermost_loop_of(&self, block: BlockId) -> Option<LoopId> {
        self.innermost[block.index()]
    }

    pub fn contains(&self, lp: LoopId, block: BlockId) -> bool {
        self.get(lp).contains(block)
    }

    /// `outer` is `inner` or one of its ancestors
    pub fn encloses(&self, outer: LoopId, inner: LoopId) -> bool {
        let mut cur = Some(inner);
        while let Some(id) = cur {
            if id == outer {
                return true;
            }
            cur = self.get(id).parent;
        }
        false
    }

    /// Edges leaving the loop body
    pub fn exit_edges(&self, func: &Function, lp: LoopId) -> Vec<Edge> {
        let lp = self.get(lp);
        lp.blocks
            .iter()
            .flat_map(|&b| func.succs(b).iter().copied())
            .filter(|e| !lp.contains(e.dest))
            .collect()
    }
}

fn rpo_rank(dom: &DomTree, block: BlockId) -> usize {
    dom.reverse_postorder().iter().position(|&b| b == block).unwrap_or(usize::MAX)
}

fn natural_loop_body(func: &Function, dom: &DomTree, header: BlockId, latches: &[BlockId]) -> BTreeSet<BlockId> {
    let mut body = BTreeSet::from([header]);
    let mut work: Vec<BlockId> = latches.to_vec();
    while let Some(block) = work.pop() {
        if !dom.is_reachable(block) || !body.insert(block) {
            continue;
        }
        work.extend(func.preds(block).iter().copied());
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ExprArena, FunctionBuilder, Type};

    #[test]
    fn test_nested_loops() {
        let mut arena = ExprArena::new();
        let c = arena.new_var("c", Type::BOOL);
        let cv = arena.var(c);
        let mut fb = FunctionBuilder::new("nest");
        fb.add_param(c);
        let entry = fb.add_block("entry");
        let outer = fb.add_block("outer");
        let inner = fb.add_block("inner");
        let olatch = fb.add_block("olatch");
        let exit = fb.add_block("exit");
        fb.goto(entry, outer);
        fb.branch(outer, cv, inner, exit);
        fb.branch(inner, cv, inner, olatch);
        fb.goto(olatch, outer);
        fb.ret(exit, None);
        let func = fb.finish(&arena).expect("valid");
        let dom = DomTree::new(&func);
        let loops = LoopForest::discover(&func, &dom);

        assert_eq!(loops.len(), 2);
        let o = loops.innermost_loop_of(olatch).expect("outer loop");
        let i = loops.innermost_loop_of(inner).expect("inner loop");
        assert_eq!(loops.get(o).header, outer);
        assert_eq!(loops.get(o).latch, Some(olatch));
        assert_eq!(loops.get(i).latch, Some(inner));
        assert_eq!(loops.get(i).parent, Some(o));
        assert_eq!(loops.get(i).depth, 2);
        assert!(loops.encloses(o, i));
        assert_eq!(loops.innermost_loop_of(exit), None);

        let exits = loops.exit_edges(&func, i);
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].dest, olatch);
    }
}
