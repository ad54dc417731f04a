use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{DiffError, Result};

/// Default call graph step order, most selective first.
pub const DEFAULT_CALL_GRAPH_STEPS: [&str; 9] = [
    "name",
    "hash",
    "prime-signature",
    "md-index-flow-graph",
    "md-index-call-graph",
    "call-reference-propagation",
    "string-references",
    "loop-count",
    "instruction-count",
];

/// Default basic block step order, most selective first.
pub const DEFAULT_BASIC_BLOCK_STEPS: [&str; 5] = [
    "prime",
    "mnemonic-hash",
    "md-index-neighborhood",
    "edge-propagation",
    "loop-index",
];

/// Producer id reserved for the unconditional entry block match.
pub const ENTRY_POINT_STEP: &str = "entry-point";

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_call_graph_steps() -> Vec<String> {
    DEFAULT_CALL_GRAPH_STEPS.iter().map(|s| s.to_string()).collect()
}

fn default_basic_block_steps() -> Vec<String> {
    DEFAULT_BASIC_BLOCK_STEPS.iter().map(|s| s.to_string()).collect()
}

fn default_similarity_weights() -> [f64; 4] {
    [0.35, 0.25, 0.10, 0.30]
}

fn default_confidence_weights() -> BTreeMap<String, f64> {
    [
        ("name", 1.0),
        ("hash", 1.0),
        ("prime-signature", 0.9),
        ("md-index-flow-graph", 0.9),
        ("md-index-call-graph", 0.8),
        ("call-reference-propagation", 0.7),
        ("string-references", 0.6),
        ("loop-count", 0.4),
        ("instruction-count", 0.3),
        (ENTRY_POINT_STEP, 1.0),
        ("prime", 0.9),
        ("mnemonic-hash", 0.8),
        ("md-index-neighborhood", 0.7),
        ("edge-propagation", 0.6),
        ("loop-index", 0.4),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

fn default_min_function_size() -> usize {
    3
}

/// Diff configuration. Every field has a documented default, so a config
/// deserialized from an empty JSON object behaves like [`DiffConfig::default`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffConfig {
    /// Worker threads for the outer batch. The engine for one pair is always
    /// single threaded.
    pub threads: usize,
    /// Ordered call graph step ids.
    pub call_graph_steps: Vec<String>,
    /// Ordered basic block step ids.
    pub basic_block_steps: Vec<String>,
    /// Weights for the four similarity components: matched functions,
    /// matched basic blocks, matched instructions, call graph MD-index
    /// agreement. Must be non-negative and sum to 1.
    pub similarity_weights: [f64; 4],
    /// Per step confidence weight in [0, 1]. Steps missing from the map get
    /// [`DiffConfig::FALLBACK_CONFIDENCE`].
    pub confidence_weights: BTreeMap<String, f64>,
    /// Minimum block count for prime signature matching.
    pub min_function_size: usize,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            call_graph_steps: default_call_graph_steps(),
            basic_block_steps: default_basic_block_steps(),
            similarity_weights: default_similarity_weights(),
            confidence_weights: default_confidence_weights(),
            min_function_size: default_min_function_size(),
        }
    }
}

impl DiffConfig {
    pub const FALLBACK_CONFIDENCE: f64 = 0.5;

    pub fn confidence_weight(&self, step_id: &str) -> f64 {
        self.confidence_weights
            .get(step_id)
            .copied()
            .unwrap_or(Self::FALLBACK_CONFIDENCE)
    }

    /// Structural validation. Step id resolution happens in the registry,
    /// which reports unknown ids as its own [`DiffError::Config`].
    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(DiffError::Config("threads must be at least 1".to_string()));
        }
        if self.call_graph_steps.is_empty() {
            return Err(DiffError::Config(
                "empty call graph step list".to_string(),
            ));
        }
        if self.basic_block_steps.is_empty() {
            return Err(DiffError::Config(
                "empty basic block step list".to_string(),
            ));
        }
        if self.similarity_weights.iter().any(|&w| w < 0.0) {
            return Err(DiffError::Config(
                "similarity weights must be non-negative".to_string(),
            ));
        }
        let sum: f64 = self.similarity_weights.iter().sum();
        if (sum - 1.0).abs() > 1e-6 {
            return Err(DiffError::Config(format!(
                "similarity weights must sum to 1, got {sum}"
            )));
        }
        for (id, &weight) in &self.confidence_weights {
            if !(0.0..=1.0).contains(&weight) {
                return Err(DiffError::Config(format!(
                    "confidence weight for '{id}' out of range: {weight}"
                )));
            }
        }
        if self.min_function_size == 0 {
            return Err(DiffError::Config(
                "min_function_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
