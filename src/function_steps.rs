//! Call graph level matching steps, ordered from most to least selective by
//! the default configuration.

use rustc_hash::{FxHashMap, FxHashSet};
use std::hash::Hash;

use crate::config::DiffConfig;
use crate::error::{DiffError, Result};
use crate::instruction::{fnv1a, Address};
use crate::matching::{Candidate, FunctionMatchStep, FunctionPool, MatchingContext};
use crate::program::Function;

/// Build the configured step pipeline. Unknown ids are a configuration error.
pub fn create_steps(
    ids: &[String],
    config: &DiffConfig,
) -> Result<Vec<Box<dyn FunctionMatchStep>>> {
    ids.iter().map(|id| create_step(id, config)).collect()
}

fn create_step(id: &str, config: &DiffConfig) -> Result<Box<dyn FunctionMatchStep>> {
    let confidence = config.confidence_weight(id);
    let step: Box<dyn FunctionMatchStep> = match id {
        "name" => Box::new(NameStep { confidence }),
        "hash" => Box::new(HashStep { confidence }),
        "prime-signature" => Box::new(PrimeSignatureStep {
            confidence,
            min_function_size: config.min_function_size,
        }),
        "md-index-flow-graph" => Box::new(FlowGraphMdIndexStep { confidence }),
        "md-index-call-graph" => Box::new(CallGraphMdIndexStep { confidence }),
        "call-reference-propagation" => Box::new(CallReferencePropagationStep { confidence }),
        "string-references" => Box::new(StringReferencesStep { confidence }),
        "loop-count" => Box::new(LoopCountStep { confidence }),
        "instruction-count" => Box::new(InstructionCountStep { confidence }),
        _ => {
            return Err(DiffError::Config(format!(
                "unknown call graph step '{id}'"
            )))
        }
    };
    Ok(step)
}

/// Propose every pair of pool functions agreeing on a key. Ambiguous buckets
/// produce a cross product on purpose; the resolver decides.
fn bucket_candidates<K, F>(pool: &FunctionPool<'_>, confidence: f64, key: F) -> Vec<Candidate>
where
    K: Eq + Hash,
    F: Fn(&Function) -> Option<K>,
{
    let mut buckets: FxHashMap<K, Vec<Address>> = FxHashMap::default();
    for f in &pool.secondary {
        if let Some(k) = key(f) {
            buckets.entry(k).or_default().push(f.address);
        }
    }

    let mut candidates = Vec::new();
    for f in &pool.primary {
        let Some(k) = key(f) else { continue };
        let Some(bucket) = buckets.get(&k) else {
            continue;
        };
        for &secondary in bucket {
            candidates.push(Candidate {
                primary: f.address,
                secondary,
                confidence,
            });
        }
    }
    candidates
}

/// Exact symbol name equality, preferring demangled names. Stubs are thunks
/// that frequently share names across unrelated targets, so they are excluded.
struct NameStep {
    confidence: f64,
}

impl FunctionMatchStep for NameStep {
    fn id(&self) -> &'static str {
        "name"
    }

    fn confidence(&self) -> f64 {
        self.confidence
    }

    fn propose(&self, _ctx: &MatchingContext<'_>, pool: &FunctionPool<'_>) -> Vec<Candidate> {
        bucket_candidates(pool, self.confidence, |f| {
            if f.stub || f.name.is_empty() {
                return None;
            }
            Some(f.demangled_name.clone().unwrap_or_else(|| f.name.clone()))
        })
    }
}

/// Hash of the function's raw instruction bytes.
struct HashStep {
    confidence: f64,
}

impl FunctionMatchStep for HashStep {
    fn id(&self) -> &'static str {
        "hash"
    }

    fn confidence(&self) -> f64 {
        self.confidence
    }

    fn propose(&self, _ctx: &MatchingContext<'_>, pool: &FunctionPool<'_>) -> Vec<Candidate> {
        bucket_candidates(pool, self.confidence, |f| f.byte_hash)
    }
}

/// Function prime signature equality, restricted to non-trivial functions so
/// the ubiquitous one-block wrappers cannot flood the buckets.
struct PrimeSignatureStep {
    confidence: f64,
    min_function_size: usize,
}

impl FunctionMatchStep for PrimeSignatureStep {
    fn id(&self) -> &'static str {
        "prime-signature"
    }

    fn confidence(&self) -> f64 {
        self.confidence
    }

    fn propose(&self, _ctx: &MatchingContext<'_>, pool: &FunctionPool<'_>) -> Vec<Candidate> {
        bucket_candidates(pool, self.confidence, |f| {
            (f.basic_block_count >= self.min_function_size).then_some(f.prime_signature)
        })
    }
}

/// Flow graph MD-index equality, compared bit exact.
struct FlowGraphMdIndexStep {
    confidence: f64,
}

impl FunctionMatchStep for FlowGraphMdIndexStep {
    fn id(&self) -> &'static str {
        "md-index-flow-graph"
    }

    fn confidence(&self) -> f64 {
        self.confidence
    }

    fn propose(&self, _ctx: &MatchingContext<'_>, pool: &FunctionPool<'_>) -> Vec<Candidate> {
        // Single block functions all share an MD-index of zero; skip them.
        bucket_candidates(pool, self.confidence, |f| {
            (f.md_index != 0.0).then_some(f.md_index.to_bits())
        })
    }
}

/// MD-index of the function's one-hop neighborhood in the call graph.
struct CallGraphMdIndexStep {
    confidence: f64,
}

impl FunctionMatchStep for CallGraphMdIndexStep {
    fn id(&self) -> &'static str {
        "md-index-call-graph"
    }

    fn confidence(&self) -> f64 {
        self.confidence
    }

    fn propose(&self, ctx: &MatchingContext<'_>, pool: &FunctionPool<'_>) -> Vec<Candidate> {
        let mut buckets: FxHashMap<u64, Vec<Address>> = FxHashMap::default();
        for f in &pool.secondary {
            let md = ctx.secondary.call_graph.neighborhood_md_index(f.address);
            if md != 0.0 {
                buckets.entry(md.to_bits()).or_default().push(f.address);
            }
        }

        let mut candidates = Vec::new();
        for f in &pool.primary {
            let md = ctx.primary.call_graph.neighborhood_md_index(f.address);
            if md == 0.0 {
                continue;
            }
            if let Some(bucket) = buckets.get(&md.to_bits()) {
                for &secondary in bucket {
                    candidates.push(Candidate {
                        primary: f.address,
                        secondary,
                        confidence: self.confidence,
                    });
                }
            }
        }
        candidates
    }
}

/// Propagation along call edges of already matched pairs: when a matched
/// function pair has exactly one unmatched callee on each side, those callees
/// correspond; likewise for callers.
struct CallReferencePropagationStep {
    confidence: f64,
}

impl FunctionMatchStep for CallReferencePropagationStep {
    fn id(&self) -> &'static str {
        "call-reference-propagation"
    }

    fn confidence(&self) -> f64 {
        self.confidence
    }

    fn propose(&self, ctx: &MatchingContext<'_>, pool: &FunctionPool<'_>) -> Vec<Candidate> {
        let eligible_primary: FxHashSet<Address> =
            pool.primary.iter().map(|f| f.address).collect();
        let eligible_secondary: FxHashSet<Address> =
            pool.secondary.iter().map(|f| f.address).collect();

        let mut candidates = Vec::new();
        for fp in ctx.fixed_points() {
            for callers in [false, true] {
                let primary_refs = if callers {
                    ctx.primary.call_graph.callers(fp.primary)
                } else {
                    ctx.primary.call_graph.callees(fp.primary)
                };
                let secondary_refs = if callers {
                    ctx.secondary.call_graph.callers(fp.secondary)
                } else {
                    ctx.secondary.call_graph.callees(fp.secondary)
                };

                let open_primary: Vec<Address> = primary_refs
                    .into_iter()
                    .filter(|a| eligible_primary.contains(a))
                    .collect();
                let open_secondary: Vec<Address> = secondary_refs
                    .into_iter()
                    .filter(|a| eligible_secondary.contains(a))
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

/// Identical sets of referenced string constants.
struct StringReferencesStep {
    confidence: f64,
}

impl FunctionMatchStep for StringReferencesStep {
    fn id(&self) -> &'static str {
        "string-references"
    }

    fn confidence(&self) -> f64 {
        self.confidence
    }

    fn propose(&self, _ctx: &MatchingContext<'_>, pool: &FunctionPool<'_>) -> Vec<Candidate> {
        // string_refs is sorted and deduplicated at load time, so a hash over
        // the joined sequence identifies the set.
        bucket_candidates(pool, self.confidence, |f| {
            if f.string_refs.is_empty() {
                return None;
            }
            Some(fnv1a(
                f.string_refs
                    .iter()
                    .flat_map(|s| s.bytes().chain(std::iter::once(0u8))),
            ))
        })
    }
}

/// Coarse fallback: number of loops in the flow graph.
struct LoopCountStep {
    confidence: f64,
}

impl FunctionMatchStep for LoopCountStep {
    fn id(&self) -> &'static str {
        "loop-count"
    }

    fn confidence(&self) -> f64 {
        self.confidence
    }

    fn propose(&self, _ctx: &MatchingContext<'_>, pool: &FunctionPool<'_>) -> Vec<Candidate> {
        bucket_candidates(pool, self.confidence, |f| {
            (f.loop_count > 0).then_some(f.loop_count)
        })
    }
}

/// Coarsest fallback: total instruction count.
struct InstructionCountStep {
    confidence: f64,
}

impl FunctionMatchStep for InstructionCountStep {
    fn id(&self) -> &'static str {
        "instruction-count"
    }

    fn confidence(&self) -> f64 {
        self.confidence
    }

    fn propose(&self, _ctx: &MatchingContext<'_>, pool: &FunctionPool<'_>) -> Vec<Candidate> {
        bucket_candidates(pool, self.confidence, |f| {
            (f.instruction_count > 0).then_some(f.instruction_count)
        })
    }
}
