use petgraph::graph::{DiGraph, NodeIndex};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;

use crate::instruction::{fnv1a, Address};
use crate::md_index;

/// One instruction, referencing the shared instruction cache by id. The
/// mnemonic and operand text live in the cache; the prime is denormalized
/// here because signature computation is the hot path.
#[derive(Debug, Clone, Copy)]
pub struct Instruction {
    pub address: Address,
    pub cache_id: u32,
    pub mnemonic_id: u32,
    pub prime: u64,
}

/// Basic block with its derived signatures. Signatures are computed at
/// construction and never change afterwards; the loop index is filled in by
/// [`FlowGraph::analyze`].
#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub address: Address,
    pub instructions: Vec<Instruction>,
    /// Product of instruction primes, wrapping modulo 2^64. Compared for
    /// equality only, never magnitude.
    pub prime_signature: u64,
    /// Stable 64-bit hash of the ordered mnemonic id sequence.
    pub mnemonic_hash: u64,
    /// 1-based index of the loop (non-trivial SCC) this block belongs to,
    /// 0 for blocks outside any loop.
    pub loop_index: u32,
}

impl BasicBlock {
    pub fn new(address: Address, instructions: Vec<Instruction>) -> Self {
        let prime_signature = instructions
            .iter()
            .fold(1u64, |acc, ins| acc.wrapping_mul(ins.prime));
        let mnemonic_hash = fnv1a(
            instructions
                .iter()
                .flat_map(|ins| ins.mnemonic_id.to_le_bytes()),
        );
        Self {
            address,
            instructions,
            prime_signature,
            mnemonic_hash,
            loop_index: 0,
        }
    }

    pub fn instruction_count(&self) -> usize {
        self.instructions.len()
    }
}

/// Control flow graph of a single function.
#[derive(Debug, Clone, Default)]
pub struct FlowGraph {
    entry: Address,
    blocks: BTreeMap<Address, BasicBlock>,
    graph: DiGraph<Address, ()>,
    node_of: FxHashMap<Address, NodeIndex>,
    md_index: f64,
    loop_count: u32,
}

impl FlowGraph {
    pub fn new(entry: Address) -> Self {
        Self {
            entry,
            ..Self::default()
        }
    }

    pub fn add_block(&mut self, block: BasicBlock) {
        let node = self.graph.add_node(block.address);
        self.node_of.insert(block.address, node);
        self.blocks.insert(block.address, block);
    }

    /// Add a control transfer edge. Returns false when either endpoint is not
    /// a known block head.
    pub fn add_edge(&mut self, from: Address, to: Address) -> bool {
        match (self.node_of.get(&from), self.node_of.get(&to)) {
            (Some(&u), Some(&v)) => {
                self.graph.add_edge(u, v, ());
                true
            }
            _ => false,
        }
    }

    /// Compute the MD-index and assign loop indices. Called once after all
    /// blocks and edges are in place.
    pub fn analyze(&mut self) {
        self.md_index = md_index::md_index(&self.graph);
        let sccs = md_index::nontrivial_sccs(&self.graph);
        for (loop_idx, scc) in sccs.iter().enumerate() {
            for &node in scc {
                let address = self.graph[node];
                if let Some(block) = self.blocks.get_mut(&address) {
                    block.loop_index = loop_idx as u32 + 1;
                }
            }
        }
        self.loop_count = sccs.len() as u32;
    }

    pub fn entry(&self) -> Address {
        self.entry
    }

    pub fn entry_block(&self) -> Option<&BasicBlock> {
        self.blocks.get(&self.entry)
    }

    pub fn block(&self, address: Address) -> Option<&BasicBlock> {
        self.blocks.get(&address)
    }

    /// Blocks in ascending address order.
    pub fn blocks(&self) -> impl Iterator<Item = &BasicBlock> {
        self.blocks.values()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn instruction_count(&self) -> usize {
        self.blocks.values().map(|b| b.instructions.len()).sum()
    }

    pub fn successors(&self, address: Address) -> Vec<Address> {
        self.neighbors(address, petgraph::Direction::Outgoing)
    }

    pub fn predecessors(&self, address: Address) -> Vec<Address> {
        self.neighbors(address, petgraph::Direction::Incoming)
    }

    fn neighbors(&self, address: Address, direction: petgraph::Direction) -> Vec<Address> {
        let Some(&node) = self.node_of.get(&address) else {
            return Vec::new();
        };
        let mut out: Vec<Address> = self
            .graph
            .neighbors_directed(node, direction)
            .map(|n| self.graph[n])
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    pub fn md_index(&self) -> f64 {
        self.md_index
    }

    pub fn loop_count(&self) -> u32 {
        self.loop_count
    }

    /// Product of the block prime signatures, wrapping modulo 2^64.
    pub fn prime_signature(&self) -> u64 {
        self.blocks
            .values()
            .fold(1u64, |acc, b| acc.wrapping_mul(b.prime_signature))
    }

    /// MD-index of the one-hop neighborhood of a block.
    pub fn neighborhood_md_index(&self, address: Address) -> f64 {
        self.node_of
            .get(&address)
            .map(|&node| md_index::neighborhood_md_index(&self.graph, node))
            .unwrap_or(0.0)
    }
}

/// Function metadata attached to a call graph node. The aggregates mirror the
/// function's flow graph and are filled in by the loader so matchers never
/// have to touch the flow graph for call-graph level decisions.
#[derive(Debug, Clone)]
pub struct Function {
    pub address: Address,
    pub name: String,
    pub demangled_name: Option<String>,
    pub library: bool,
    pub stub: bool,
    pub byte_hash: Option<[u8; 32]>,
    pub prime_signature: u64,
    pub basic_block_count: usize,
    pub instruction_count: usize,
    pub loop_count: u32,
    pub md_index: f64,
    /// Referenced string constants, sorted and deduplicated.
    pub string_refs: Vec<String>,
}

/// Call site address inside the caller, attached to a call edge.
#[derive(Debug, Clone, Copy)]
pub struct CallSite {
    pub address: Address,
}

/// Directed graph of functions for one program.
#[derive(Debug, Clone, Default)]
pub struct CallGraph {
    graph: DiGraph<Address, CallSite>,
    node_of: BTreeMap<Address, NodeIndex>,
    functions: BTreeMap<Address, Function>,
    md_index: f64,
}

impl CallGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_function(&mut self, function: Function) {
        let node = self.graph.add_node(function.address);
        self.node_of.insert(function.address, node);
        self.functions.insert(function.address, function);
    }

    /// Add a direct call edge. Returns false when either endpoint is unknown.
    pub fn add_call(&mut self, caller: Address, callee: Address, call_site: Address) -> bool {
        match (self.node_of.get(&caller), self.node_of.get(&callee)) {
            (Some(&u), Some(&v)) => {
                self.graph.add_edge(
                    u,
                    v,
                    CallSite {
                        address: call_site,
                    },
                );
                true
            }
            _ => false,
        }
    }

    pub fn analyze(&mut self) {
        self.md_index = md_index::md_index(&self.graph);
    }

    pub fn function(&self, address: Address) -> Option<&Function> {
        self.functions.get(&address)
    }

    /// Functions in ascending address order.
    pub fn functions(&self) -> impl Iterator<Item = &Function> {
        self.functions.values()
    }

    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    pub fn call_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn callees(&self, address: Address) -> Vec<Address> {
        self.neighbors(address, petgraph::Direction::Outgoing)
    }

    pub fn callers(&self, address: Address) -> Vec<Address> {
        self.neighbors(address, petgraph::Direction::Incoming)
    }

    fn neighbors(&self, address: Address, direction: petgraph::Direction) -> Vec<Address> {
        let Some(&node) = self.node_of.get(&address) else {
            return Vec::new();
        };
        let mut out: Vec<Address> = self
            .graph
            .neighbors_directed(node, direction)
            .map(|n| self.graph[n])
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    pub fn md_index(&self) -> f64 {
        self.md_index
    }

    /// MD-index of a function's one-hop call neighborhood.
    pub fn neighborhood_md_index(&self, address: Address) -> f64 {
        self.node_of
            .get(&address)
            .map(|&node| md_index::neighborhood_md_index(&self.graph, node))
            .unwrap_or(0.0)
    }
}

/// One loaded program: its call graph plus a flow graph per function. Built
/// once by the loader and read-only during matching.
#[derive(Debug, Clone)]
pub struct Program {
    pub executable_id: String,
    pub name: String,
    pub architecture: String,
    pub call_graph: CallGraph,
    flow_graphs: BTreeMap<Address, FlowGraph>,
}

impl Program {
    pub(crate) fn new(
        executable_id: String,
        name: String,
        architecture: String,
        call_graph: CallGraph,
        flow_graphs: BTreeMap<Address, FlowGraph>,
    ) -> Self {
        Self {
            executable_id,
            name,
            architecture,
            call_graph,
            flow_graphs,
        }
    }

    pub fn flow_graph(&self, address: Address) -> Option<&FlowGraph> {
        self.flow_graphs.get(&address)
    }

    /// Flow graphs in ascending entry address order.
    pub fn flow_graphs(&self) -> impl Iterator<Item = &FlowGraph> {
        self.flow_graphs.values()
    }

    pub fn function_count(&self) -> usize {
        self.call_graph.function_count()
    }

    pub fn basic_block_count(&self) -> usize {
        self.flow_graphs.values().map(|g| g.block_count()).sum()
    }

    pub fn instruction_count(&self) -> usize {
        self.flow_graphs
            .values()
            .map(|g| g.instruction_count())
            .sum()
    }
}
