//! Fixed point propagation over two call graphs and their flow graphs.

use log::debug;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::basic_block_steps;
use crate::config::{DiffConfig, ENTRY_POINT_STEP};
use crate::error::Result;
use crate::function_steps;
use crate::instruction::Address;
use crate::program::{BasicBlock, FlowGraph, Function, Program};

/// Cooperative cancellation handle. Checked between matching steps; the step
/// in flight always runs to completion, so a cancelled run still yields a
/// valid partial fixed point set.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A (primary, secondary) pair proposed by one step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub primary: Address,
    pub secondary: Address,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// A step proposed a candidate referencing an already matched entity.
    /// The resolver preserves the one-to-one invariant, so the candidate is
    /// dropped and matching continues.
    InvariantViolation,
}

/// Structured event surfaced by the engine. Never silently swallowed: every
/// diagnostic is logged and kept for the caller.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub step: &'static str,
    pub primary: Address,
    pub secondary: Address,
    pub message: String,
}

/// Matched basic block pair inside a function fixed point, with the LCS
/// instruction alignment.
#[derive(Debug, Clone)]
pub struct BasicBlockFixedPoint {
    pub primary: Address,
    pub secondary: Address,
    pub step: &'static str,
    /// Aligned (primary, secondary) instruction address pairs.
    pub instruction_matches: Vec<(Address, Address)>,
}

impl BasicBlockFixedPoint {
    /// Bitmap over the primary block's instructions: bit i set when the i-th
    /// instruction is part of the alignment.
    pub fn alignment_bitmap(&self, primary_block: &BasicBlock) -> Vec<u8> {
        let mut bits = vec![0u8; primary_block.instructions.len().div_ceil(8)];
        for (i, ins) in primary_block.instructions.iter().enumerate() {
            if self
                .instruction_matches
                .iter()
                .any(|&(p, _)| p == ins.address)
            {
                bits[i / 8] |= 1 << (i % 8);
            }
        }
        bits
    }
}

/// An admitted match between a primary and a secondary function. Append only:
/// once admitted it is never removed or rewritten.
#[derive(Debug, Clone)]
pub struct FixedPoint {
    pub primary: Address,
    pub secondary: Address,
    pub step: &'static str,
    pub confidence: f64,
    pub basic_blocks: Vec<BasicBlockFixedPoint>,
}

impl FixedPoint {
    pub fn matched_instruction_count(&self) -> usize {
        self.basic_blocks
            .iter()
            .map(|b| b.instruction_matches.len())
            .sum()
    }
}

/// Unmatched functions eligible for the current pass, address sorted.
pub struct FunctionPool<'a> {
    pub primary: Vec<&'a Function>,
    pub secondary: Vec<&'a Function>,
}

/// A call graph matching step: proposes candidate pairs from the current
/// context. The engine never inspects step internals.
pub trait FunctionMatchStep: Send + Sync {
    fn id(&self) -> &'static str;
    fn confidence(&self) -> f64;
    fn propose(&self, ctx: &MatchingContext<'_>, pool: &FunctionPool<'_>) -> Vec<Candidate>;
}

/// A basic block matching step operating on one matched function pair.
pub trait BasicBlockMatchStep: Send + Sync {
    fn id(&self) -> &'static str;
    fn confidence(&self) -> f64;
    fn propose(&self, ctx: &BlockContext<'_>) -> Vec<Candidate>;
}

/// Shared read state plus the growing fixed point set for one program pair.
pub struct MatchingContext<'a> {
    pub primary: &'a Program,
    pub secondary: &'a Program,
    fixed_points: BTreeMap<Address, FixedPoint>,
    secondary_to_primary: FxHashMap<Address, Address>,
    diagnostics: Vec<Diagnostic>,
}

impl<'a> MatchingContext<'a> {
    pub fn new(primary: &'a Program, secondary: &'a Program) -> Self {
        Self {
            primary,
            secondary,
            fixed_points: BTreeMap::new(),
            secondary_to_primary: FxHashMap::default(),
            diagnostics: Vec::new(),
        }
    }

    pub fn is_matched_primary(&self, address: Address) -> bool {
        self.fixed_points.contains_key(&address)
    }

    pub fn is_matched_secondary(&self, address: Address) -> bool {
        self.secondary_to_primary.contains_key(&address)
    }

    pub fn counterpart_of_primary(&self, address: Address) -> Option<Address> {
        self.fixed_points.get(&address).map(|fp| fp.secondary)
    }

    pub fn counterpart_of_secondary(&self, address: Address) -> Option<Address> {
        self.secondary_to_primary.get(&address).copied()
    }

    /// Fixed points in ascending primary address order.
    pub fn fixed_points(&self) -> impl Iterator<Item = &FixedPoint> {
        self.fixed_points.values()
    }

    pub fn fixed_point_count(&self) -> usize {
        self.fixed_points.len()
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    fn unmatched_pool(&self, library: bool) -> FunctionPool<'a> {
        FunctionPool {
            primary: self
                .primary
                .call_graph
                .functions()
                .filter(|f| f.library == library && !self.is_matched_primary(f.address))
                .collect(),
            secondary: self
                .secondary
                .call_graph
                .functions()
                .filter(|f| f.library == library && !self.is_matched_secondary(f.address))
                .collect(),
        }
    }

    fn record_violation(&mut self, step: &'static str, candidate: &Candidate) {
        let diagnostic = Diagnostic {
            kind: DiagnosticKind::InvariantViolation,
            step,
            primary: candidate.primary,
            secondary: candidate.secondary,
            message: format!(
                "step '{}' proposed {:#x} <-> {:#x} but one side is already matched",
                step, candidate.primary, candidate.secondary
            ),
        };
        log::warn!("{}", diagnostic.message);
        self.diagnostics.push(diagnostic);
    }

    pub(crate) fn admit(
        &mut self,
        candidate: Candidate,
        step: &'static str,
        basic_blocks: Vec<BasicBlockFixedPoint>,
    ) {
        debug_assert!(!self.is_matched_primary(candidate.primary));
        debug_assert!(!self.is_matched_secondary(candidate.secondary));
        self.secondary_to_primary
            .insert(candidate.secondary, candidate.primary);
        self.fixed_points.insert(
            candidate.primary,
            FixedPoint {
                primary: candidate.primary,
                secondary: candidate.secondary,
                step,
                confidence: candidate.confidence,
                basic_blocks,
            },
        );
    }

    fn into_outcome(self, cancelled: bool) -> MatchOutcome {
        MatchOutcome {
            fixed_points: self.fixed_points.into_values().collect(),
            diagnostics: self.diagnostics,
            cancelled,
        }
    }
}

/// Block level state for one matched function pair.
pub struct BlockContext<'a> {
    pub primary: &'a FlowGraph,
    pub secondary: &'a FlowGraph,
    matched: Vec<BasicBlockFixedPoint>,
    primary_to_secondary: FxHashMap<Address, Address>,
    secondary_to_primary: FxHashMap<Address, Address>,
}

impl<'a> BlockContext<'a> {
    pub(crate) fn new(primary: &'a FlowGraph, secondary: &'a FlowGraph) -> Self {
        Self {
            primary,
            secondary,
            matched: Vec::new(),
            primary_to_secondary: FxHashMap::default(),
            secondary_to_primary: FxHashMap::default(),
        }
    }

    pub fn is_matched_primary(&self, address: Address) -> bool {
        self.primary_to_secondary.contains_key(&address)
    }

    pub fn is_matched_secondary(&self, address: Address) -> bool {
        self.secondary_to_primary.contains_key(&address)
    }

    pub fn counterpart_of_primary(&self, address: Address) -> Option<Address> {
        self.primary_to_secondary.get(&address).copied()
    }

    /// Matched (primary, secondary) block pairs in admission order.
    pub fn matched_pairs(&self) -> impl Iterator<Item = (Address, Address)> + '_ {
        self.matched.iter().map(|m| (m.primary, m.secondary))
    }

    pub fn unmatched_primary(&self) -> Vec<&'a BasicBlock> {
        self.primary
            .blocks()
            .filter(|b| !self.is_matched_primary(b.address))
            .collect()
    }

    pub fn unmatched_secondary(&self) -> Vec<&'a BasicBlock> {
        self.secondary
            .blocks()
            .filter(|b| !self.is_matched_secondary(b.address))
            .collect()
    }

    pub(crate) fn admit(&mut self, candidate: Candidate, step: &'static str) {
        let instruction_matches = match (
            self.primary.block(candidate.primary),
            self.secondary.block(candidate.secondary),
        ) {
            (Some(p), Some(s)) => align_instructions(p, s),
            _ => Vec::new(),
        };
        self.primary_to_secondary
            .insert(candidate.primary, candidate.secondary);
        self.secondary_to_primary
            .insert(candidate.secondary, candidate.primary);
        self.matched.push(BasicBlockFixedPoint {
            primary: candidate.primary,
            secondary: candidate.secondary,
            step,
            instruction_matches,
        });
    }
}

/// Longest common subsequence over instruction identity (cache ids), mapping
/// primary instruction addresses to secondary ones. No further propagation
/// follows from instruction matches.
pub fn align_instructions(
    primary: &BasicBlock,
    secondary: &BasicBlock,
) -> Vec<(Address, Address)> {
    let a = &primary.instructions;
    let b = &secondary.instructions;
    let mut table = vec![vec![0usize; b.len() + 1]; a.len() + 1];
    for i in (0..a.len()).rev() {
        for j in (0..b.len()).rev() {
            table[i][j] = if a[i].cache_id == b[j].cache_id {
                table[i + 1][j + 1] + 1
            } else {
                table[i + 1][j].max(table[i][j + 1])
            };
        }
    }

    let mut pairs = Vec::with_capacity(table[0][0]);
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        if a[i].cache_id == b[j].cache_id {
            pairs.push((a[i].address, b[j].address));
            i += 1;
            j += 1;
        } else if table[i + 1][j] >= table[i][j + 1] {
            i += 1;
        } else {
            j += 1;
        }
    }
    pairs
}

/// One-to-one resolution of a step's candidates.
///
/// Candidates are first reduced per primary and per secondary to the
/// strictly highest confidence subset; a pair survives when afterwards its
/// primary occurs in exactly one candidate and its secondary occurs in
/// exactly one candidate. Everything else is dropped; a later step may
/// resolve it. Output is sorted by (primary, secondary) address so admission
/// order is fully deterministic.
fn resolve(mut candidates: Vec<Candidate>) -> Vec<Candidate> {
    candidates.sort_by(|a, b| {
        (a.primary, a.secondary)
            .cmp(&(b.primary, b.secondary))
            .then(b.confidence.total_cmp(&a.confidence))
    });
    candidates.dedup_by_key(|c| (c.primary, c.secondary));

    let mut best_primary: FxHashMap<Address, f64> = FxHashMap::default();
    let mut best_secondary: FxHashMap<Address, f64> = FxHashMap::default();
    for c in &candidates {
        let p = best_primary.entry(c.primary).or_insert(c.confidence);
        *p = p.max(c.confidence);
        let s = best_secondary.entry(c.secondary).or_insert(c.confidence);
        *s = s.max(c.confidence);
    }
    candidates.retain(|c| {
        c.confidence >= best_primary[&c.primary] && c.confidence >= best_secondary[&c.secondary]
    });

    let mut primary_count: FxHashMap<Address, usize> = FxHashMap::default();
    let mut secondary_count: FxHashMap<Address, usize> = FxHashMap::default();
    for c in &candidates {
        *primary_count.entry(c.primary).or_insert(0) += 1;
        *secondary_count.entry(c.secondary).or_insert(0) += 1;
    }
    candidates.retain(|c| primary_count[&c.primary] == 1 && secondary_count[&c.secondary] == 1);
    candidates
}

/// Result of one matching run. With cancellation unset the outcome is fully
/// deterministic for identical inputs and step lists.
#[derive(Debug, Clone)]
pub struct MatchOutcome {
    pub fixed_points: Vec<FixedPoint>,
    pub diagnostics: Vec<Diagnostic>,
    pub cancelled: bool,
}

impl MatchOutcome {
    pub fn matched_basic_block_count(&self) -> usize {
        self.fixed_points
            .iter()
            .map(|fp| fp.basic_blocks.len())
            .sum()
    }

    pub fn matched_instruction_count(&self) -> usize {
        self.fixed_points
            .iter()
            .map(|fp| fp.matched_instruction_count())
            .sum()
    }
}

/// The staged matching engine. Steps run in configuration order, first on the
/// non-library pool, then on the library pool; every newly admitted function
/// pair has its basic blocks matched before the next call graph step runs.
pub struct MatchingEngine {
    call_graph_steps: Vec<Box<dyn FunctionMatchStep>>,
    basic_block_steps: Vec<Box<dyn BasicBlockMatchStep>>,
    entry_confidence: f64,
}

impl MatchingEngine {
    pub fn from_config(config: &DiffConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            call_graph_steps: function_steps::create_steps(&config.call_graph_steps, config)?,
            basic_block_steps: basic_block_steps::create_steps(&config.basic_block_steps, config)?,
            entry_confidence: config.confidence_weight(ENTRY_POINT_STEP),
        })
    }

    pub fn run(
        &self,
        primary: &Program,
        secondary: &Program,
        cancel: &CancelToken,
    ) -> MatchOutcome {
        let mut ctx = MatchingContext::new(primary, secondary);
        let mut cancelled = false;

        // Library and non-library functions never mix: two passes over the
        // same pipeline with disjoint pools.
        'passes: for library in [false, true] {
            for step in &self.call_graph_steps {
                if cancel.is_cancelled() {
                    cancelled = true;
                    break 'passes;
                }
                let pool = ctx.unmatched_pool(library);
                if pool.primary.is_empty() || pool.secondary.is_empty() {
                    continue;
                }

                let proposed = step.propose(&ctx, &pool);
                let mut candidates = Vec::with_capacity(proposed.len());
                for candidate in proposed {
                    if ctx.is_matched_primary(candidate.primary)
                        || ctx.is_matched_secondary(candidate.secondary)
                    {
                        ctx.record_violation(step.id(), &candidate);
                    } else {
                        candidates.push(candidate);
                    }
                }

                let admitted = resolve(candidates);
                if !admitted.is_empty() {
                    debug!(
                        "step '{}' ({}): admitting {} function pairs",
                        step.id(),
                        if library { "library" } else { "non-library" },
                        admitted.len()
                    );
                }
                for candidate in admitted {
                    let basic_blocks =
                        self.match_basic_blocks(candidate.primary, candidate.secondary, &mut ctx);
                    ctx.admit(candidate, step.id(), basic_blocks);
                }
            }
        }

        ctx.into_outcome(cancelled)
    }

    /// Basic block matching for one newly admitted function pair. The entry
    /// blocks anchor the search and are matched unconditionally first.
    fn match_basic_blocks(
        &self,
        primary_fn: Address,
        secondary_fn: Address,
        ctx: &mut MatchingContext<'_>,
    ) -> Vec<BasicBlockFixedPoint> {
        let (Some(primary), Some(secondary)) = (
            ctx.primary.flow_graph(primary_fn),
            ctx.secondary.flow_graph(secondary_fn),
        ) else {
            return Vec::new();
        };

        let mut block_ctx = BlockContext::new(primary, secondary);
        if primary.entry_block().is_some() && secondary.entry_block().is_some() {
            block_ctx.admit(
                Candidate {
                    primary: primary.entry(),
                    secondary: secondary.entry(),
                    confidence: self.entry_confidence,
                },
                ENTRY_POINT_STEP,
            );
        }

        let mut violations: Vec<(&'static str, Candidate)> = Vec::new();
        for step in &self.basic_block_steps {
            let proposed = step.propose(&block_ctx);
            let mut candidates = Vec::with_capacity(proposed.len());
            for candidate in proposed {
                if block_ctx.is_matched_primary(candidate.primary)
                    || block_ctx.is_matched_secondary(candidate.secondary)
                {
                    violations.push((step.id(), candidate));
                } else {
                    candidates.push(candidate);
                }
            }
            for candidate in resolve(candidates) {
                block_ctx.admit(candidate, step.id());
            }
        }
        for (step, candidate) in violations {
            ctx.record_violation(step, &candidate);
        }

        block_ctx.matched
    }
}
