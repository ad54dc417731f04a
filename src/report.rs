//! Result writers: human readable log output and a JSON record of the fixed
//! point set. Writers can be chained so one diff produces several artifacts.

use anyhow::{Context, Result};
use log::info;
use serde::Serialize;
use std::fmt::Write as _;
use std::path::PathBuf;

use crate::program::Program;
use crate::DiffResult;

/// Consumes a finished diff result. Multiple writers may be chained.
pub trait ResultWriter {
    fn write(&self, result: &DiffResult, primary: &Program, secondary: &Program) -> Result<()>;
}

/// Fans a result out to every added writer.
#[derive(Default)]
pub struct ChainWriter {
    writers: Vec<Box<dyn ResultWriter>>,
}

impl ChainWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, writer: Box<dyn ResultWriter>) {
        self.writers.push(writer);
    }

    pub fn is_empty(&self) -> bool {
        self.writers.is_empty()
    }
}

impl ResultWriter for ChainWriter {
    fn write(&self, result: &DiffResult, primary: &Program, secondary: &Program) -> Result<()> {
        for writer in &self.writers {
            writer.write(result, primary, secondary)?;
        }
        Ok(())
    }
}

/// Plain text results file.
pub struct LogWriter {
    path: PathBuf,
}

impl LogWriter {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl ResultWriter for LogWriter {
    fn write(&self, result: &DiffResult, primary: &Program, secondary: &Program) -> Result<()> {
        let mut out = String::new();
        let _ = writeln!(out, "{} vs {}", primary.name, secondary.name);
        let _ = writeln!(out, "similarity: {:.6}", result.similarity);
        let _ = writeln!(out, "confidence: {:.6}", result.confidence);
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "matched functions: {} ({} primary, {} secondary)",
            result.counts.matched_functions,
            result.counts.functions_primary,
            result.counts.functions_secondary
        );
        let _ = writeln!(
            out,
            "matched basic blocks: {} ({} primary, {} secondary)",
            result.counts.matched_basic_blocks,
            result.counts.basic_blocks_primary,
            result.counts.basic_blocks_secondary
        );
        let _ = writeln!(
            out,
            "matched instructions: {} ({} primary, {} secondary)",
            result.counts.matched_instructions,
            result.counts.instructions_primary,
            result.counts.instructions_secondary
        );
        let _ = writeln!(out);

        let _ = writeln!(out, "function matches by step:");
        for (step, count) in &result.histogram.functions {
            let _ = writeln!(out, "  {step}: {count}");
        }
        let _ = writeln!(out, "basic block matches by step:");
        for (step, count) in &result.histogram.basic_blocks {
            let _ = writeln!(out, "  {step}: {count}");
        }
        let _ = writeln!(out);

        for fp in &result.fixed_points {
            let name = primary
                .call_graph
                .function(fp.primary)
                .map(|f| f.name.as_str())
                .unwrap_or("?");
            let _ = writeln!(
                out,
                "{:#x} <-> {:#x} \"{}\" via '{}' ({} basic blocks, {} instructions)",
                fp.primary,
                fp.secondary,
                name,
                fp.step,
                fp.basic_blocks.len(),
                fp.matched_instruction_count()
            );
        }

        std::fs::write(&self.path, out)
            .with_context(|| format!("writing results to {}", self.path.display()))?;
        info!("results written to {}", self.path.display());
        Ok(())
    }
}

#[derive(Serialize)]
struct ProgramRecord<'a> {
    executable_id: &'a str,
    name: &'a str,
    architecture: &'a str,
    functions: usize,
    basic_blocks: usize,
    instructions: usize,
}

impl<'a> ProgramRecord<'a> {
    fn new(program: &'a Program) -> Self {
        Self {
            executable_id: &program.executable_id,
            name: &program.name,
            architecture: &program.architecture,
            functions: program.function_count(),
            basic_blocks: program.basic_block_count(),
            instructions: program.instruction_count(),
        }
    }
}

#[derive(Serialize)]
struct BasicBlockRecord {
    primary: u64,
    secondary: u64,
    step: &'static str,
    /// Hex encoded bitmap over the primary block's instructions; set bits are
    /// aligned instructions.
    instruction_bitmap: String,
}

#[derive(Serialize)]
struct MatchRecord {
    primary: u64,
    secondary: u64,
    step: &'static str,
    confidence: f64,
    basic_blocks: Vec<BasicBlockRecord>,
}

#[derive(Serialize)]
struct JsonReport<'a> {
    created_at: String,
    version: &'static str,
    primary: ProgramRecord<'a>,
    secondary: ProgramRecord<'a>,
    similarity: f64,
    confidence: f64,
    counts: &'a crate::Counts,
    histogram: &'a crate::Histogram,
    matches: Vec<MatchRecord>,
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// Machine readable results file.
pub struct JsonWriter {
    path: PathBuf,
}

impl JsonWriter {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl ResultWriter for JsonWriter {
    fn write(&self, result: &DiffResult, primary: &Program, secondary: &Program) -> Result<()> {
        let matches = result
            .fixed_points
            .iter()
            .map(|fp| {
                let flow_graph = primary.flow_graph(fp.primary);
                let basic_blocks = fp
                    .basic_blocks
                    .iter()
                    .map(|block| {
                        let bitmap = flow_graph
                            .and_then(|fg| fg.block(block.primary))
                            .map(|b| hex_encode(&block.alignment_bitmap(b)))
                            .unwrap_or_default();
                        BasicBlockRecord {
                            primary: block.primary,
                            secondary: block.secondary,
                            step: block.step,
                            instruction_bitmap: bitmap,
                        }
                    })
                    .collect();
                MatchRecord {
                    primary: fp.primary,
                    secondary: fp.secondary,
                    step: fp.step,
                    confidence: fp.confidence,
                    basic_blocks,
                }
            })
            .collect();

        let report = JsonReport {
            created_at: chrono::Utc::now().to_rfc3339(),
            version: env!("CARGO_PKG_VERSION"),
            primary: ProgramRecord::new(primary),
            secondary: ProgramRecord::new(secondary),
            similarity: result.similarity,
            confidence: result.confidence,
            counts: &result.counts,
            histogram: &result.histogram,
            matches,
        };

        let json = serde_json::to_string_pretty(&report).context("serializing diff results")?;
        std::fs::write(&self.path, json)
            .with_context(|| format!("writing results to {}", self.path.display()))?;
        info!("results written to {}", self.path.display());
        Ok(())
    }
}
