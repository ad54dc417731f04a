//! Compares two disassembled programs and maps their functions and basic
//! blocks onto each other through staged fixed point propagation.

use log::info;

pub mod basic_block_steps;
pub mod batch;
pub mod config;
pub mod error;
pub mod function_steps;
pub mod instruction;
pub mod load;
pub mod matching;
pub mod md_index;
pub mod program;
pub mod report;
pub mod scoring;

#[cfg(test)]
pub(crate) mod tests_support;

pub use config::DiffConfig;
pub use error::{DiffError, Result};
pub use instruction::{Address, InstructionCache};
pub use load::{build_program, load_program, parse_program, ProgramExport};
pub use matching::{
    BasicBlockFixedPoint, CancelToken, Diagnostic, DiagnosticKind, FixedPoint, MatchingEngine,
};
pub use program::{BasicBlock, CallGraph, FlowGraph, Function, Program};
pub use scoring::{Counts, Histogram};

/// Complete result of diffing one program pair: the fixed point set with its
/// producer tags plus the derived scores.
#[derive(Debug, Clone)]
pub struct DiffResult {
    pub fixed_points: Vec<FixedPoint>,
    pub histogram: Histogram,
    pub counts: Counts,
    pub similarity: f64,
    pub confidence: f64,
    pub diagnostics: Vec<Diagnostic>,
    /// True when the run was cut short by the cancel token. The fixed point
    /// set is still a valid partial result.
    pub cancelled: bool,
}

/// Diff two loaded programs. The engine is single threaded and deterministic:
/// identical inputs, step lists and configuration yield identical fixed point
/// sets and producer tags.
pub fn diff(
    primary: &Program,
    secondary: &Program,
    config: &DiffConfig,
    cancel: &CancelToken,
) -> Result<DiffResult> {
    let engine = MatchingEngine::from_config(config)?;
    info!(
        "diffing '{}' ({} functions, {} calls) vs '{}' ({} functions, {} calls)",
        primary.name,
        primary.function_count(),
        primary.call_graph.call_count(),
        secondary.name,
        secondary.function_count(),
        secondary.call_graph.call_count()
    );

    let outcome = engine.run(primary, secondary, cancel);
    let (histogram, counts) = scoring::counts_and_histogram(
        primary,
        secondary,
        &outcome.fixed_points,
    );
    let similarity = scoring::similarity(primary, secondary, &counts, &config.similarity_weights);
    let confidence = scoring::confidence(
        &histogram,
        &config.confidence_weights,
        DiffConfig::FALLBACK_CONFIDENCE,
    );

    info!(
        "matched {} of {}/{} functions, similarity {:.4}, confidence {:.4}{}",
        counts.matched_functions,
        counts.functions_primary,
        counts.functions_secondary,
        similarity,
        confidence,
        if outcome.cancelled { " (cancelled)" } else { "" }
    );

    Ok(DiffResult {
        fixed_points: outcome.fixed_points,
        histogram,
        counts,
        similarity,
        confidence,
        diagnostics: outcome.diagnostics,
        cancelled: outcome.cancelled,
    })
}
