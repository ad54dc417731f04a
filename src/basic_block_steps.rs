//! Basic block level matching steps, run once per newly matched function
//! pair after the entry blocks have been anchored.

use rustc_hash::FxHashMap;
use std::hash::Hash;

use crate::config::DiffConfig;
use crate::error::{DiffError, Result};
use crate::instruction::Address;
use crate::matching::{BasicBlockMatchStep, BlockContext, Candidate};
use crate::program::BasicBlock;

/// Build the configured block step pipeline. Unknown ids are a configuration
/// error.
pub fn create_steps(
    ids: &[String],
    config: &DiffConfig,
) -> Result<Vec<Box<dyn BasicBlockMatchStep>>> {
    ids.iter().map(|id| create_step(id, config)).collect()
}

fn create_step(id: &str, config: &DiffConfig) -> Result<Box<dyn BasicBlockMatchStep>> {
    let confidence = config.confidence_weight(id);
    let step: Box<dyn BasicBlockMatchStep> = match id {
        "prime" => Box::new(PrimeStep { confidence }),
        "mnemonic-hash" => Box::new(MnemonicHashStep { confidence }),
        "md-index-neighborhood" => Box::new(MdIndexNeighborhoodStep { confidence }),
        "edge-propagation" => Box::new(EdgePropagationStep { confidence }),
        "loop-index" => Box::new(LoopIndexStep { confidence }),
        _ => {
            return Err(DiffError::Config(format!(
                "unknown basic block step '{id}'"
            )))
        }
    };
    Ok(step)
}

/// Propose every pair of unmatched blocks agreeing on a key; the resolver
/// drops ambiguous buckets.
fn bucket_candidates<K, F>(ctx: &BlockContext<'_>, confidence: f64, key: F) -> Vec<Candidate>
where
    K: Eq + Hash,
    F: Fn(&BasicBlock) -> Option<K>,
{
    let mut buckets: FxHashMap<K, Vec<Address>> = FxHashMap::default();
    for block in ctx.unmatched_secondary() {
        if let Some(k) = key(block) {
            buckets.entry(k).or_default().push(block.address);
        }
    }

    let mut candidates = Vec::new();
    for block in ctx.unmatched_primary() {
        let Some(k) = key(block) else { continue };
        let Some(bucket) = buckets.get(&k) else {
            continue;
        };
        for &secondary in bucket {
            candidates.push(Candidate {
                primary: block.address,
                secondary,
                confidence,
            });
        }
    }
    candidates
}

/// Block prime signature equality. Order independent, so it survives
/// instruction scheduling differences inside the block.
struct PrimeStep {
    confidence: f64,
}

impl BasicBlockMatchStep for PrimeStep {
    fn id(&self) -> &'static str {
        "prime"
    }

    fn confidence(&self) -> f64 {
        self.confidence
    }

    fn propose(&self, ctx: &BlockContext<'_>) -> Vec<Candidate> {
        bucket_candidates(ctx, self.confidence, |b| {
            (b.instruction_count() > 0).then_some(b.prime_signature)
        })
    }
}

/// Hash of the ordered mnemonic sequence.
struct MnemonicHashStep {
    confidence: f64,
}

impl BasicBlockMatchStep for MnemonicHashStep {
    fn id(&self) -> &'static str {
        "mnemonic-hash"
    }

    fn confidence(&self) -> f64 {
        self.confidence
    }

    fn propose(&self, ctx: &BlockContext<'_>) -> Vec<Candidate> {
        bucket_candidates(ctx, self.confidence, |b| {
            (b.instruction_count() > 0).then_some(b.mnemonic_hash)
        })
    }
}

/// MD-index of the block's one-hop neighborhood in the flow graph.
struct MdIndexNeighborhoodStep {
    confidence: f64,
}

impl BasicBlockMatchStep for MdIndexNeighborhoodStep {
    fn id(&self) -> &'static str {
        "md-index-neighborhood"
    }

    fn confidence(&self) -> f64 {
        self.confidence
    }

    fn propose(&self, ctx: &BlockContext<'_>) -> Vec<Candidate> {
        let mut buckets: FxHashMap<u64, Vec<Address>> = FxHashMap::default();
        for block in ctx.unmatched_secondary() {
            let md = ctx.secondary.neighborhood_md_index(block.address);
            if md != 0.0 {
                buckets.entry(md.to_bits()).or_default().push(block.address);
            }
        }

        let mut candidates = Vec::new();
        for block in ctx.unmatched_primary() {
            let md = ctx.primary.neighborhood_md_index(block.address);
            if md == 0.0 {
                continue;
            }
            if let Some(bucket) = buckets.get(&md.to_bits()) {
                for &secondary in bucket {
                    candidates.push(Candidate {
                        primary: block.address,
                        secondary,
                        confidence: self.confidence,
                    });
                }
            }
        }
        candidates
    }
}

/// Propagation along flow edges of already matched blocks: a matched pair
/// with exactly one unmatched successor on each side pins those successors
/// together; likewise for predecessors.
struct EdgePropagationStep {
    confidence: f64,
}

impl BasicBlockMatchStep for EdgePropagationStep {
    fn id(&self) -> &'static str {
        "edge-propagation"
    }

    fn confidence(&self) -> f64 {
        self.confidence
    }

    fn propose(&self, ctx: &BlockContext<'_>) -> Vec<Candidate> {
        let mut candidates = Vec::new();
        for (primary, secondary) in ctx.matched_pairs() {
            for predecessors in [false, true] {
                let open_primary: Vec<Address> = if predecessors {
                    ctx.primary.predecessors(primary)
                } else {
                    ctx.primary.successors(primary)
                }
                .into_iter()
                .filter(|&a| !ctx.is_matched_primary(a))
                .collect();
                let open_secondary: Vec<Address> = if predecessors {
                    ctx.secondary.predecessors(secondary)
                } else {
                    ctx.secondary.successors(secondary)
                }
                .into_iter()
                .filter(|&a| !ctx.is_matched_secondary(a))
                .collect();

                if let ([p], [s]) = (open_primary.as_slice(), open_secondary.as_slice()) {
                    candidates.push(Candidate {
                        primary: *p,
                        secondary: *s,
                        confidence: self.confidence,
                    });
                }
            }
        }
        candidates
    }
}

/// Coarse fallback: blocks sharing a loop index and instruction count.
struct LoopIndexStep {
    confidence: f64,
}

impl BasicBlockMatchStep for LoopIndexStep {
    fn id(&self) -> &'static str {
        "loop-index"
    }

    fn confidence(&self) -> f64 {
        self.confidence
    }

    fn propose(&self, ctx: &BlockContext<'_>) -> Vec<Candidate> {
        bucket_candidates(ctx, self.confidence, |b| {
            (b.loop_index > 0).then_some((b.loop_index, b.instruction_count()))
        })
    }
}
