//! Program loader: turns the serialized export representation into a
//! [`Program`] with all signatures computed eagerly.

use log::info;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{DiffError, Result};
use crate::instruction::{Address, InstructionCache};
use crate::program::{BasicBlock, CallGraph, FlowGraph, Function, Instruction, Program};

/// Serialized program representation. Only the abstract quantities the core
/// consumes are modeled: addresses, names, flags, topology and the
/// instruction stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramExport {
    pub meta: MetaInformation,
    pub functions: Vec<FunctionExport>,
    #[serde(default)]
    pub call_edges: Vec<CallEdgeExport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaInformation {
    pub executable_id: String,
    pub executable_name: String,
    pub architecture: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionExport {
    pub address: Address,
    pub name: String,
    #[serde(default)]
    pub demangled_name: Option<String>,
    #[serde(default)]
    pub library: bool,
    #[serde(default)]
    pub stub: bool,
    #[serde(default)]
    pub string_refs: Vec<String>,
    pub basic_blocks: Vec<BasicBlockExport>,
    #[serde(default)]
    pub edges: Vec<FlowEdgeExport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicBlockExport {
    pub address: Address,
    pub instructions: Vec<InstructionExport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstructionExport {
    pub address: Address,
    pub mnemonic: String,
    #[serde(default)]
    pub operands: String,
    #[serde(default)]
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FlowEdgeExport {
    pub source: Address,
    pub target: Address,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CallEdgeExport {
    pub caller: Address,
    pub callee: Address,
    pub call_site: Address,
}

/// Read and build a program from an export file.
pub fn load_program(path: &Path, cache: &mut InstructionCache) -> Result<Program> {
    info!("reading {}", path.display());
    let data = std::fs::read_to_string(path)?;
    parse_program(&data, cache)
}

/// Build a program from export JSON.
pub fn parse_program(data: &str, cache: &mut InstructionCache) -> Result<Program> {
    let export: ProgramExport =
        serde_json::from_str(data).map_err(|e| DiffError::Load(e.to_string()))?;
    build_program(export, cache)
}

/// Build a program from a parsed export, interning all instructions into the
/// shared cache and computing every signature the matchers rely on.
pub fn build_program(export: ProgramExport, cache: &mut InstructionCache) -> Result<Program> {
    let ProgramExport {
        meta,
        functions,
        call_edges,
    } = export;
    let mut call_graph = CallGraph::new();
    let mut flow_graphs: BTreeMap<Address, FlowGraph> = BTreeMap::new();
    let mut pending: Vec<(Address, FunctionExport, Option<[u8; 32]>)> = Vec::new();

    for function in functions {
        if flow_graphs.contains_key(&function.address) {
            return Err(DiffError::Load(format!(
                "duplicate function at {:#x}",
                function.address
            )));
        }
        if function.basic_blocks.is_empty() {
            return Err(DiffError::Load(format!(
                "function {:#x} has no basic blocks",
                function.address
            )));
        }

        let mut flow_graph = FlowGraph::new(function.address);
        let mut hasher = Sha256::new();
        let mut have_bytes = false;
        for block in &function.basic_blocks {
            if flow_graph.block(block.address).is_some() {
                return Err(DiffError::Load(format!(
                    "duplicate basic block at {:#x} in function {:#x}",
                    block.address, function.address
                )));
            }
            let instructions = block
                .instructions
                .iter()
                .map(|ins| {
                    let interned = cache.intern(&ins.mnemonic, &ins.operands);
                    hasher.update(&ins.bytes);
                    have_bytes |= !ins.bytes.is_empty();
                    Instruction {
                        address: ins.address,
                        cache_id: interned.id,
                        mnemonic_id: interned.mnemonic_id,
                        prime: interned.prime,
                    }
                })
                .collect();
            flow_graph.add_block(BasicBlock::new(block.address, instructions));
        }
        if flow_graph.entry_block().is_none() {
            return Err(DiffError::Load(format!(
                "function {:#x} has no entry block at its own address",
                function.address
            )));
        }
        for edge in &function.edges {
            if !flow_graph.add_edge(edge.source, edge.target) {
                return Err(DiffError::Load(format!(
                    "flow edge {:#x} -> {:#x} references an unknown block in function {:#x}",
                    edge.source, edge.target, function.address
                )));
            }
        }

        let byte_hash = have_bytes.then(|| hasher.finalize().into());
        let address = function.address;
        flow_graphs.insert(address, flow_graph);
        pending.push((address, function, byte_hash));
    }

    // Structural analysis per flow graph is independent work.
    flow_graphs
        .values_mut()
        .collect::<Vec<_>>()
        .par_iter_mut()
        .for_each(|fg| fg.analyze());

    for (address, function, byte_hash) in pending {
        let flow_graph = &flow_graphs[&address];
        let mut string_refs = function.string_refs;
        string_refs.sort_unstable();
        string_refs.dedup();

        call_graph.add_function(Function {
            address,
            name: function.name,
            demangled_name: function.demangled_name,
            library: function.library,
            stub: function.stub,
            byte_hash,
            prime_signature: flow_graph.prime_signature(),
            basic_block_count: flow_graph.block_count(),
            instruction_count: flow_graph.instruction_count(),
            loop_count: flow_graph.loop_count(),
            md_index: flow_graph.md_index(),
            string_refs,
        });
    }

    for edge in &call_edges {
        if !call_graph.add_call(edge.caller, edge.callee, edge.call_site) {
            return Err(DiffError::Load(format!(
                "call edge {:#x} -> {:#x} references an unknown function",
                edge.caller, edge.callee
            )));
        }
    }
    call_graph.analyze();

    let program = Program::new(
        meta.executable_id,
        meta.executable_name,
        meta.architecture,
        call_graph,
        flow_graphs,
    );
    info!(
        "loaded '{}': {} functions, {} basic blocks, {} instructions",
        program.name,
        program.function_count(),
        program.basic_block_count(),
        program.instruction_count()
    );
    Ok(program)
}
