//! Similarity and confidence scoring over a finished fixed point set.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::matching::FixedPoint;
use crate::program::Program;

/// Fixed points per producing step, separately for functions and blocks.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Histogram {
    pub functions: BTreeMap<&'static str, usize>,
    pub basic_blocks: BTreeMap<&'static str, usize>,
}

/// Match totals over both programs.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Counts {
    pub functions_primary: usize,
    pub functions_secondary: usize,
    pub functions_primary_library: usize,
    pub functions_secondary_library: usize,
    pub matched_functions: usize,
    pub matched_library_functions: usize,
    pub unmatched_functions_primary: usize,
    pub unmatched_functions_secondary: usize,
    pub basic_blocks_primary: usize,
    pub basic_blocks_secondary: usize,
    pub matched_basic_blocks: usize,
    pub instructions_primary: usize,
    pub instructions_secondary: usize,
    pub matched_instructions: usize,
}

/// Collect the per-step histogram and the match totals.
pub fn counts_and_histogram(
    primary: &Program,
    secondary: &Program,
    fixed_points: &[FixedPoint],
) -> (Histogram, Counts) {
    let mut histogram = Histogram::default();
    let mut counts = Counts {
        functions_primary: primary.function_count(),
        functions_secondary: secondary.function_count(),
        functions_primary_library: primary
            .call_graph
            .functions()
            .filter(|f| f.library)
            .count(),
        functions_secondary_library: secondary
            .call_graph
            .functions()
            .filter(|f| f.library)
            .count(),
        basic_blocks_primary: primary.basic_block_count(),
        basic_blocks_secondary: secondary.basic_block_count(),
        instructions_primary: primary.instruction_count(),
        instructions_secondary: secondary.instruction_count(),
        ..Counts::default()
    };

    for fp in fixed_points {
        *histogram.functions.entry(fp.step).or_insert(0) += 1;
        counts.matched_functions += 1;
        if primary
            .call_graph
            .function(fp.primary)
            .is_some_and(|f| f.library)
        {
            counts.matched_library_functions += 1;
        }
        for block in &fp.basic_blocks {
            *histogram.basic_blocks.entry(block.step).or_insert(0) += 1;
            counts.matched_basic_blocks += 1;
            counts.matched_instructions += block.instruction_matches.len();
        }
    }

    counts.unmatched_functions_primary = counts.functions_primary - counts.matched_functions;
    counts.unmatched_functions_secondary = counts.functions_secondary - counts.matched_functions;
    (histogram, counts)
}

fn fraction(matched: usize, primary_total: usize, secondary_total: usize) -> f64 {
    let larger = primary_total.max(secondary_total);
    if larger == 0 {
        return 1.0;
    }
    (matched as f64 / larger as f64).min(1.0)
}

/// Fraction of matched entities out of the union of both sides. One-to-one
/// matching bounds `matched` by the smaller side, so the denominator never
/// drops below the larger side.
fn union_fraction(matched: usize, primary_total: usize, secondary_total: usize) -> f64 {
    let union = (primary_total + secondary_total).saturating_sub(matched);
    if union == 0 {
        return 1.0;
    }
    (matched as f64 / union as f64).min(1.0)
}

/// Similarity in [0, 1]: a weighted combination of matched function, basic
/// block and instruction fractions plus call graph MD-index agreement. The
/// function and instruction fractions are measured against the larger side;
/// the basic block fraction is measured against the union of both sides.
/// For a fixed configuration the score is monotone in the fixed point set.
pub fn similarity(
    primary: &Program,
    secondary: &Program,
    counts: &Counts,
    weights: &[f64; 4],
) -> f64 {
    let function_fraction = fraction(
        counts.matched_functions - counts.matched_library_functions,
        counts.functions_primary - counts.functions_primary_library,
        counts.functions_secondary - counts.functions_secondary_library,
    );
    let block_fraction = union_fraction(
        counts.matched_basic_blocks,
        counts.basic_blocks_primary,
        counts.basic_blocks_secondary,
    );
    let instruction_fraction = fraction(
        counts.matched_instructions,
        counts.instructions_primary,
        counts.instructions_secondary,
    );

    let md1 = primary.call_graph.md_index();
    let md2 = secondary.call_graph.md_index();
    let md_agreement = if md1.max(md2) <= f64::EPSILON {
        1.0
    } else {
        1.0 - (md1 - md2).abs() / md1.max(md2)
    };

    let score = weights[0] * function_fraction
        + weights[1] * block_fraction
        + weights[2] * instruction_fraction
        + weights[3] * md_agreement;
    score.clamp(0.0, 1.0)
}

/// Saturating clamp: 0 at 0, exactly 1 at 1, concave in between.
fn saturate(x: f64) -> f64 {
    const K: f64 = 3.0;
    (((-K * x).exp() - 1.0) / ((-K).exp() - 1.0)).clamp(0.0, 1.0)
}

/// Confidence in [0, 1]: every step contributes its configured weight scaled
/// by its share of the function matches, passed through a saturating clamp.
/// An empty fixed point set has zero confidence.
pub fn confidence(histogram: &Histogram, weights: &BTreeMap<String, f64>, fallback: f64) -> f64 {
    let total: usize = histogram.functions.values().sum();
    if total == 0 {
        return 0.0;
    }
    let weighted: f64 = histogram
        .functions
        .iter()
        .map(|(step, &count)| {
            let weight = weights.get(*step).copied().unwrap_or(fallback);
            weight * count as f64 / total as f64
        })
        .sum();
    saturate(weighted)
}
