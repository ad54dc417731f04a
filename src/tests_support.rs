//! Shared fixtures for in-crate tests.

use crate::instruction::{Address, InstructionCache};
use crate::load::{
    build_program, BasicBlockExport, CallEdgeExport, FlowEdgeExport, FunctionExport,
    InstructionExport, MetaInformation, ProgramExport,
};
use crate::program::Program;

pub(crate) fn instruction(address: Address, mnemonic: &str, operands: &str) -> InstructionExport {
    InstructionExport {
        address,
        mnemonic: mnemonic.to_string(),
        operands: operands.to_string(),
        bytes: mnemonic.bytes().chain(operands.bytes()).collect(),
    }
}

/// Two functions: "main" with an if/else diamond calling "helper", which is a
/// straight line of two blocks. Every block has a distinct mnemonic sequence.
pub(crate) fn two_block_export(name: &str) -> ProgramExport {
    ProgramExport {
        meta: MetaInformation {
            executable_id: format!("{name}-id"),
            executable_name: name.to_string(),
            architecture: "x86-64".to_string(),
        },
        functions: vec![
            FunctionExport {
                address: 0x1000,
                name: "main".to_string(),
                demangled_name: None,
                library: false,
                stub: false,
                string_refs: vec!["usage: demo".to_string()],
                basic_blocks: vec![
                    BasicBlockExport {
                        address: 0x1000,
                        instructions: vec![
                            instruction(0x1000, "push", "rbp"),
                            instruction(0x1001, "cmp", "edi, 1"),
                            instruction(0x1004, "jle", "0x1020"),
                        ],
                    },
                    BasicBlockExport {
                        address: 0x1010,
                        instructions: vec![
                            instruction(0x1010, "call", "helper"),
                            instruction(0x1015, "jmp", "0x1030"),
                        ],
                    },
                    BasicBlockExport {
                        address: 0x1020,
                        instructions: vec![instruction(0x1020, "xor", "eax, eax")],
                    },
                    BasicBlockExport {
                        address: 0x1030,
                        instructions: vec![
                            instruction(0x1030, "pop", "rbp"),
                            instruction(0x1031, "ret", ""),
                        ],
                    },
                ],
                edges: vec![
                    FlowEdgeExport {
                        source: 0x1000,
                        target: 0x1010,
                    },
                    FlowEdgeExport {
                        source: 0x1000,
                        target: 0x1020,
                    },
                    FlowEdgeExport {
                        source: 0x1010,
                        target: 0x1030,
                    },
                    FlowEdgeExport {
                        source: 0x1020,
                        target: 0x1030,
                    },
                ],
            },
            FunctionExport {
                address: 0x2000,
                name: "helper".to_string(),
                demangled_name: None,
                library: false,
                stub: false,
                string_refs: Vec::new(),
                basic_blocks: vec![
                    BasicBlockExport {
                        address: 0x2000,
                        instructions: vec![
                            instruction(0x2000, "mov", "eax, edi"),
                            instruction(0x2003, "add", "eax, 1"),
                        ],
                    },
                    BasicBlockExport {
                        address: 0x2010,
                        instructions: vec![instruction(0x2010, "ret", "")],
                    },
                ],
                edges: vec![FlowEdgeExport {
                    source: 0x2000,
                    target: 0x2010,
                }],
            },
        ],
        call_edges: vec![CallEdgeExport {
            caller: 0x1000,
            callee: 0x2000,
            call_site: 0x1010,
        }],
    }
}

pub(crate) fn two_block_program(name: &str, cache: &mut InstructionCache) -> Program {
    build_program(two_block_export(name), cache).expect("fixture export is well formed")
}
