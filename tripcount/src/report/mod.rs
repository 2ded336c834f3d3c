//! Per-function analysis report
//!
//! Runs every public entry point of the engine over each loop of a parsed
//! program and collects the results as plain data, printable as text or
//! serializable as JSON.

use crate::config::NiterConfig;
use crate::ir::{DomTree, Edge, ExprArena, ExprId, Function, LoopForest, LoopId};
use crate::niter::{Estimate, NiterAnalyzer, NiterDescriptor};
use crate::parser::Program;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FunctionReport {
    pub name: String,
    pub loops: Vec<LoopReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoopReport {
    /// Header block label
    pub header: String,
    pub depth: u32,
    pub exits: Vec<ExitReport>,
    /// Smallest count proven by simulation, over all exits
    pub brute_force: Option<BruteForceReport>,
    pub bounds: Vec<BoundReport>,
    /// Constant estimate recorded in the bound ledger
    pub estimate: Option<u64>,
    pub maybe_infinite: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExitReport {
    pub from: String,
    pub to: String,
    /// `None` when the exit is not analyzable in closed form
    pub descriptor: Option<DescriptorReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DescriptorReport {
    pub niter: String,
    pub assumptions: String,
    pub may_be_zero: String,
    pub additional_info: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BruteForceReport {
    pub niter: u64,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BoundReport {
    pub bound: String,
    pub additional: String,
    /// Block of the branch the bound is anchored at
    pub anchor: String,
}

impl DescriptorReport {
    fn new(arena: &ExprArena, desc: &NiterDescriptor) -> Self {
        let show = |e: ExprId| arena.display(e).to_string();
        Self {
            niter: show(desc.niter),
            assumptions: show(desc.assumptions),
            may_be_zero: show(desc.may_be_zero),
            additional_info: show(desc.additional_info),
        }
    }
}

/// Analyze every function of `program`
pub fn analyze_program(program: &mut Program, config: &NiterConfig) -> Vec<FunctionReport> {
    let Program { arena, functions } = program;
    functions.iter().map(|func| analyze_function(arena, func, config)).collect()
}

/// Analyze every loop of `func`, outer loops first
pub fn analyze_function(arena: &mut ExprArena, func: &Function, config: &NiterConfig) -> FunctionReport {
    let dom = DomTree::new(func);
    let mut loops = LoopForest::discover(func, &dom);
    let ids: Vec<LoopId> = loops.ids().collect();
    let mut analyzer = NiterAnalyzer::new(arena, func, &dom, &mut loops, config.clone());
    let label = |edge: &Edge| (func.block(edge.src).name.clone(), func.block(edge.dest).name.clone());

    let mut reports = Vec::with_capacity(ids.len());
    for &lp in &ids {
        let mut exits = Vec::new();
        for exit in analyzer.loops().exit_edges(func, lp) {
            let descriptor = analyzer
                .number_of_iterations_exit(lp, exit)
                .map(|desc| DescriptorReport::new(analyzer.arena(), &desc));
            let (from, to) = label(&exit);
            exits.push(ExitReport { from, to, descriptor });
        }
        let brute_force = analyzer.find_loop_niter_by_eval(lp).map(|(niter, exit)| {
            let (from, to) = label(&exit);
            BruteForceReport { niter, from, to }
        });
        let l = analyzer.loops().get(lp);
        reports.push(LoopReport {
            header: func.block(l.header).name.clone(),
            depth: l.depth,
            exits,
            brute_force,
            bounds: Vec::new(),
            estimate: None,
            maybe_infinite: false,
        });
    }

    analyzer.estimate_all_numbers_of_iterations();
    let infinite = analyzer.maybe_infinite_loops();
    for (report, &lp) in reports.iter_mut().zip(&ids) {
        let l = analyzer.loops().get(lp);
        let arena = analyzer.arena();
        let mut bounds: Vec<BoundReport> = l
            .bounds
            .iter()
            .map(|record| BoundReport {
                bound: arena.display(record.bound).to_string(),
                additional: arena.display(record.additional).to_string(),
                anchor: func.block(func.stmt(record.anchor).block).name.clone(),
            })
            .collect();
        // The ledger yields the most recent record first
        bounds.reverse();
        report.bounds = bounds;
        report.estimate = match l.estimate {
            Estimate::Constant(n) => Some(n),
            Estimate::NotComputed | Estimate::Unknown => None,
        };
        report.maybe_infinite = infinite.contains(&lp);
    }

    tracing::debug!(function = %func.name, loops = reports.len(), "analyzed function");
    FunctionReport { name: func.name.clone(), loops: reports }
}

impl fmt::Display for FunctionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "fn {}", self.name)?;
        if self.loops.is_empty() {
            return writeln!(f, "  no loops");
        }
        for lp in &self.loops {
            write!(f, "{lp}")?;
        }
        Ok(())
    }
}

impl fmt::Display for LoopReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  loop {} (depth {})", self.header, self.depth)?;
        for exit in &self.exits {
            writeln!(f, "    exit {} -> {}", exit.from, exit.to)?;
            match &exit.descriptor {
                Some(d) => {
                    writeln!(f, "      niter: {}", d.niter)?;
                    writeln!(f, "      assumptions: {}", d.assumptions)?;
                    writeln!(f, "      may_be_zero: {}", d.may_be_zero)?;
                    writeln!(f, "      additional_info: {}", d.additional_info)?;
                }
                None => writeln!(f, "      unknown")?,
            }
        }
        match &self.brute_force {
            Some(b) => writeln!(f, "    brute force: {} via {} -> {}", b.niter, b.from, b.to)?,
            None => writeln!(f, "    brute force: unknown")?,
        }
        for bound in &self.bounds {
            write!(f, "    bound: {} at {}", bound.bound, bound.anchor)?;
            if bound.additional != "true" {
                write!(f, " if {}", bound.additional)?;
            }
            writeln!(f)?;
        }
        match self.estimate {
            Some(n) => writeln!(f, "    estimate: {n}")?,
            None => writeln!(f, "    estimate: unknown")?,
        }
        writeln!(f, "    may be infinite: {}", if self.maybe_infinite { "yes" } else { "no" })
    }
}

/// Reports as pretty-printed JSON
pub fn to_json(reports: &[FunctionReport]) -> serde_json::Result<String> {
    serde_json::to_string_pretty(reports)
}
