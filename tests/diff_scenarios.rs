//! End to end scenarios over the public API: synthetic program exports are
//! built, loaded and diffed with the default configuration.

use binmatch::load::{
    BasicBlockExport, CallEdgeExport, FlowEdgeExport, FunctionExport, InstructionExport,
    MetaInformation,
};
use binmatch::{
    build_program, diff, Address, CancelToken, DiffConfig, DiffResult, InstructionCache, Program,
    ProgramExport,
};
use rustc_hash::FxHashSet;

const OPS: [&str; 16] = [
    "mov", "add", "sub", "xor", "cmp", "test", "lea", "push", "pop", "call", "jmp", "jne", "je",
    "shl", "shr", "and",
];

fn instruction(address: Address, mnemonic: &str, operands: &str, salt: u8) -> InstructionExport {
    InstructionExport {
        address,
        mnemonic: mnemonic.to_string(),
        operands: operands.to_string(),
        bytes: mnemonic
            .bytes()
            .chain(operands.bytes())
            .chain(std::iter::once(salt))
            .collect(),
    }
}

struct FunctionSpec {
    address: Address,
    name: &'static str,
    blocks: usize,
    /// Step between consecutive block addresses (the entry always sits at the
    /// function address itself).
    block_stride: Address,
    byte_salt: u8,
    library: bool,
}

impl FunctionSpec {
    fn new(address: Address, name: &'static str, blocks: usize) -> Self {
        Self {
            address,
            name,
            blocks,
            block_stride: 0x10,
            byte_salt: 0,
            library: false,
        }
    }
}

/// A chain shaped function whose k-th block carries the mnemonic pair
/// (OPS[k % 16], OPS[k / 16]), which is unique for k < 256.
fn function_export(spec: &FunctionSpec) -> FunctionExport {
    let mut basic_blocks = Vec::new();
    let mut edges = Vec::new();
    let block_address =
        |k: usize| -> Address { spec.address + k as Address * spec.block_stride };

    for k in 0..spec.blocks {
        let address = block_address(k);
        basic_blocks.push(BasicBlockExport {
            address,
            instructions: vec![
                instruction(address, OPS[k % OPS.len()], "eax, ebx", spec.byte_salt),
                instruction(
                    address + 4,
                    OPS[(k / OPS.len()) % OPS.len()],
                    "ecx, 1",
                    spec.byte_salt,
                ),
            ],
        });
        if k + 1 < spec.blocks {
            edges.push(FlowEdgeExport {
                source: address,
                target: block_address(k + 1),
            });
        }
    }

    FunctionExport {
        address: spec.address,
        name: spec.name.to_string(),
        demangled_name: None,
        library: spec.library,
        stub: false,
        string_refs: Vec::new(),
        basic_blocks,
        edges,
    }
}

fn program_export(
    name: &str,
    functions: Vec<FunctionExport>,
    call_edges: Vec<(Address, Address)>,
) -> ProgramExport {
    ProgramExport {
        meta: MetaInformation {
            executable_id: format!("{name}-id"),
            executable_name: name.to_string(),
            architecture: "x86-64".to_string(),
        },
        functions,
        call_edges: call_edges
            .into_iter()
            .map(|(caller, callee)| CallEdgeExport {
                caller,
                callee,
                call_site: caller + 4,
            })
            .collect(),
    }
}

const F0: Address = 0x1000;
const F1: Address = 0x10000;
const F2: Address = 0x20000;

/// Three functions: f0 (100 blocks) calling f1 (5 blocks) and f2 (1 block).
fn reference_export(name: &str) -> ProgramExport {
    program_export(
        name,
        vec![
            function_export(&FunctionSpec::new(F0, "f0", 100)),
            function_export(&FunctionSpec::new(F1, "f1", 5)),
            function_export(&FunctionSpec::new(F2, "f2", 1)),
        ],
        vec![(F0, F1), (F0, F2)],
    )
}

fn load(export: ProgramExport, cache: &mut InstructionCache) -> Program {
    build_program(export, cache).expect("scenario export must load")
}

fn run(primary: &Program, secondary: &Program) -> DiffResult {
    let _ = env_logger::builder().is_test(true).try_init();
    diff(primary, secondary, &DiffConfig::default(), &CancelToken::new()).unwrap()
}

/// Every scenario must uphold one-to-one on both levels.
fn assert_one_to_one(result: &DiffResult) {
    let mut primaries = FxHashSet::default();
    let mut secondaries = FxHashSet::default();
    for fp in &result.fixed_points {
        assert!(primaries.insert(fp.primary), "duplicate primary function");
        assert!(
            secondaries.insert(fp.secondary),
            "duplicate secondary function"
        );
        let mut block_primaries = FxHashSet::default();
        let mut block_secondaries = FxHashSet::default();
        for block in &fp.basic_blocks {
            assert!(block_primaries.insert(block.primary), "duplicate block");
            assert!(block_secondaries.insert(block.secondary), "duplicate block");
        }
    }
}

#[test]
fn identity_diff_matches_everything() {
    let mut cache = InstructionCache::new();
    let primary = load(reference_export("base"), &mut cache);
    let secondary = load(reference_export("copy"), &mut cache);

    let result = run(&primary, &secondary);
    assert_one_to_one(&result);

    assert_eq!(result.counts.matched_functions, 3);
    assert_eq!(result.counts.matched_basic_blocks, 106);
    assert_eq!(result.counts.matched_instructions, 212);
    assert_eq!(result.counts.unmatched_functions_primary, 0);
    assert_eq!(result.counts.unmatched_functions_secondary, 0);
    for fp in &result.fixed_points {
        assert_eq!(fp.step, "name");
    }
    assert!((result.similarity - 1.0).abs() < 1e-9);
    assert!((result.confidence - 1.0).abs() < 1e-9);
}

#[test]
fn rename_only_still_matches_via_hash() {
    let mut cache = InstructionCache::new();
    let primary = load(reference_export("base"), &mut cache);

    let mut renamed = reference_export("renamed");
    for (function, name) in renamed.functions.iter_mut().zip(["a", "b", "c"]) {
        function.name = name.to_string();
    }
    let secondary = load(renamed, &mut cache);

    let result = run(&primary, &secondary);
    assert_one_to_one(&result);

    assert_eq!(result.counts.matched_functions, 3);
    for fp in &result.fixed_points {
        assert_ne!(fp.step, "name");
    }
    assert!((result.similarity - 1.0).abs() < 1e-9);
    assert!((result.confidence - 1.0).abs() < 1e-9);
}

#[test]
fn deleted_function_stays_unmatched() {
    let mut cache = InstructionCache::new();
    let primary = load(reference_export("base"), &mut cache);

    let secondary = load(
        program_export(
            "smaller",
            vec![
                function_export(&FunctionSpec::new(F0, "f0", 100)),
                function_export(&FunctionSpec::new(F2, "f2", 1)),
            ],
            vec![(F0, F2)],
        ),
        &mut cache,
    );

    let result = run(&primary, &secondary);
    assert_one_to_one(&result);

    assert_eq!(result.counts.matched_functions, 2);
    assert_eq!(result.counts.unmatched_functions_primary, 1);
    assert!(result.fixed_points.iter().all(|fp| fp.primary != F1));
    assert!(result.similarity > 0.5);
    assert!(result.similarity < 1.0);
}

#[test]
fn reordered_blocks_match_via_structure() {
    let mut cache = InstructionCache::new();
    let primary = load(reference_export("base"), &mut cache);

    // f0 recompiled: every non-entry block lands at a different address and
    // all byte patterns change, so name and hash cannot fire.
    let mut f0 = FunctionSpec::new(F0, "", 100);
    f0.block_stride = 0x40;
    f0.byte_salt = 1;
    let secondary = load(
        program_export(
            "recompiled",
            vec![
                function_export(&f0),
                function_export(&FunctionSpec::new(F1, "f1", 5)),
                function_export(&FunctionSpec::new(F2, "f2", 1)),
            ],
            vec![(F0, F1), (F0, F2)],
        ),
        &mut cache,
    );

    let result = run(&primary, &secondary);
    assert_one_to_one(&result);

    assert_eq!(result.counts.matched_functions, 3);
    let f0_match = result
        .fixed_points
        .iter()
        .find(|fp| fp.primary == F0)
        .expect("f0 must be matched");
    assert!(
        f0_match.step == "prime-signature" || f0_match.step == "md-index-flow-graph",
        "unexpected producer {}",
        f0_match.step
    );
    assert_eq!(f0_match.basic_blocks.len(), 100);
    assert_eq!(result.counts.matched_basic_blocks, 106);
    assert!(result.similarity > 0.99);
}

#[test]
fn merged_blocks_give_partial_coverage() {
    let mut cache = InstructionCache::new();
    let primary = load(reference_export("base"), &mut cache);

    // Optimized rebuild: f0 lost 15 blocks and its symbol.
    let secondary = load(
        program_export(
            "optimized",
            vec![
                function_export(&FunctionSpec::new(F0, "", 85)),
                function_export(&FunctionSpec::new(F1, "f1", 5)),
                function_export(&FunctionSpec::new(F2, "f2", 1)),
            ],
            vec![(F0, F1), (F0, F2)],
        ),
        &mut cache,
    );

    let result = run(&primary, &secondary);
    assert_one_to_one(&result);

    assert_eq!(result.counts.matched_functions, 3);
    let f0_match = result
        .fixed_points
        .iter()
        .find(|fp| fp.primary == F0)
        .expect("f0 must be matched");
    assert!(
        f0_match.step == "md-index-call-graph"
            || f0_match.step == "call-reference-propagation",
        "unexpected producer {}",
        f0_match.step
    );
    assert!(result.counts.matched_basic_blocks < 106);
    assert!(result.counts.matched_basic_blocks >= 91);

    // Strictly between the deleted-function case and identity.
    let deleted = {
        let mut cache = InstructionCache::new();
        let primary = load(reference_export("base"), &mut cache);
        let secondary = load(
            program_export(
                "smaller",
                vec![
                    function_export(&FunctionSpec::new(F0, "f0", 100)),
                    function_export(&FunctionSpec::new(F2, "f2", 1)),
                ],
                vec![(F0, F2)],
            ),
            &mut cache,
        );
        run(&primary, &secondary).similarity
    };
    assert!(result.similarity > deleted);
    assert!(result.similarity < 1.0);
}

#[test]
fn partially_matched_blocks_score_against_the_union() {
    let mut cache = InstructionCache::new();
    let primary = load(reference_export("base"), &mut cache);

    // f0 rebuilt: the first 85 blocks survive, the tail is 15 filler blocks
    // of foreign code, so both sides still hold 106 blocks but fewer than the
    // smaller side can ever match.
    let mut f0 = function_export(&FunctionSpec::new(F0, "f0", 85));
    for k in 85..100u64 {
        let address = F0 + k * 0x10;
        f0.basic_blocks.push(BasicBlockExport {
            address,
            instructions: (0..5)
                .map(|i| instruction(address + i * 4, "nop", "", 0))
                .collect(),
        });
        f0.edges.push(FlowEdgeExport {
            source: address - 0x10,
            target: address,
        });
    }
    let secondary = load(
        program_export(
            "rebuilt",
            vec![
                f0,
                function_export(&FunctionSpec::new(F1, "f1", 5)),
                function_export(&FunctionSpec::new(F2, "f2", 1)),
            ],
            vec![(F0, F1), (F0, F2)],
        ),
        &mut cache,
    );

    let result = run(&primary, &secondary);
    assert_one_to_one(&result);

    let counts = &result.counts;
    assert_eq!(counts.matched_functions, 3);
    // Fewer blocks matched than either side holds: the one case where the
    // union and larger-side denominators disagree.
    let smaller = counts
        .basic_blocks_primary
        .min(counts.basic_blocks_secondary);
    assert!(counts.matched_basic_blocks < smaller);

    let union = counts.basic_blocks_primary + counts.basic_blocks_secondary
        - counts.matched_basic_blocks;
    let block_fraction = counts.matched_basic_blocks as f64 / union as f64;
    let larger_side = counts.matched_basic_blocks as f64
        / counts
            .basic_blocks_primary
            .max(counts.basic_blocks_secondary) as f64;
    assert!(block_fraction < larger_side);

    // The similarity must be built from the union block fraction.
    let function_fraction = counts.matched_functions as f64
        / counts.functions_primary.max(counts.functions_secondary) as f64;
    let instruction_fraction = counts.matched_instructions as f64
        / counts
            .instructions_primary
            .max(counts.instructions_secondary) as f64;
    let md1 = primary.call_graph.md_index();
    let md2 = secondary.call_graph.md_index();
    let md_agreement = 1.0 - (md1 - md2).abs() / md1.max(md2);

    let weights = DiffConfig::default().similarity_weights;
    let expected = weights[0] * function_fraction
        + weights[1] * block_fraction
        + weights[2] * instruction_fraction
        + weights[3] * md_agreement;
    assert!((result.similarity - expected).abs() < 1e-12);
}

#[test]
fn ambiguous_hash_pair_is_resolved_by_call_graph_context() {
    const MAIN: Address = 0x100;
    const DUP_A: Address = 0x1000;
    const DUP_B: Address = 0x2000;

    let build = |name: &str| {
        program_export(
            name,
            vec![
                function_export(&FunctionSpec::new(MAIN, "main", 2)),
                function_export(&FunctionSpec::new(DUP_A, "", 3)),
                function_export(&FunctionSpec::new(DUP_B, "", 3)),
            ],
            vec![(MAIN, DUP_A)],
        )
    };

    let mut cache = InstructionCache::new();
    let primary = load(build("left"), &mut cache);
    let secondary = load(build("right"), &mut cache);

    let result = run(&primary, &secondary);
    assert_one_to_one(&result);

    // The identical twins cannot be told apart by name, hash, prime or
    // MD-index; only the call from main disambiguates dup_a.
    let dup_a = result
        .fixed_points
        .iter()
        .find(|fp| fp.primary == DUP_A)
        .expect("dup_a must be matched");
    assert_eq!(dup_a.secondary, DUP_A);
    assert!(
        dup_a.step == "md-index-call-graph" || dup_a.step == "call-reference-propagation",
        "unexpected producer {}",
        dup_a.step
    );

    // Deterministic across runs.
    let again = run(&primary, &secondary);
    let tags: Vec<_> = result
        .fixed_points
        .iter()
        .map(|fp| (fp.primary, fp.secondary, fp.step))
        .collect();
    let tags_again: Vec<_> = again
        .fixed_points
        .iter()
        .map(|fp| (fp.primary, fp.secondary, fp.step))
        .collect();
    assert_eq!(tags, tags_again);
}

#[test]
fn dropping_the_last_step_only_removes_its_matches() {
    const MAIN: Address = 0x100;
    const DUP_A: Address = 0x1000;
    const DUP_B: Address = 0x2000;

    let build = |name: &str| {
        program_export(
            name,
            vec![
                function_export(&FunctionSpec::new(MAIN, "main", 2)),
                function_export(&FunctionSpec::new(DUP_A, "", 3)),
                function_export(&FunctionSpec::new(DUP_B, "", 3)),
            ],
            vec![(MAIN, DUP_A)],
        )
    };

    let mut cache = InstructionCache::new();
    let primary = load(build("left"), &mut cache);
    let secondary = load(build("right"), &mut cache);

    let full_config = DiffConfig::default();
    assert_eq!(
        full_config.call_graph_steps.last().map(String::as_str),
        Some("instruction-count")
    );
    let mut trimmed_config = full_config.clone();
    trimmed_config.call_graph_steps.pop();

    let full = diff(&primary, &secondary, &full_config, &CancelToken::new()).unwrap();
    let trimmed = diff(&primary, &secondary, &trimmed_config, &CancelToken::new()).unwrap();

    // dup_b is only reachable through the final fallback step.
    assert!(full
        .fixed_points
        .iter()
        .any(|fp| fp.step == "instruction-count"));
    let full_without_last: Vec<_> = full
        .fixed_points
        .iter()
        .filter(|fp| fp.step != "instruction-count")
        .map(|fp| (fp.primary, fp.secondary, fp.step))
        .collect();
    let trimmed_tags: Vec<_> = trimmed
        .fixed_points
        .iter()
        .map(|fp| (fp.primary, fp.secondary, fp.step))
        .collect();
    assert_eq!(full_without_last, trimmed_tags);
}

#[test]
fn input_order_does_not_change_the_result() {
    let mut cache = InstructionCache::new();
    let primary = load(reference_export("base"), &mut cache);
    let secondary = load(reference_export("copy"), &mut cache);
    let reference = run(&primary, &secondary);

    let mut shuffled_export = reference_export("copy");
    shuffled_export.functions.reverse();
    let mut cache2 = InstructionCache::new();
    let primary2 = load(reference_export("base"), &mut cache2);
    let secondary2 = load(shuffled_export, &mut cache2);
    let shuffled = run(&primary2, &secondary2);

    let tags = |r: &DiffResult| {
        r.fixed_points
            .iter()
            .map(|fp| (fp.primary, fp.secondary, fp.step))
            .collect::<Vec<_>>()
    };
    assert_eq!(tags(&reference), tags(&shuffled));
}

#[test]
fn cancelled_run_is_a_valid_partial_result() {
    let mut cache = InstructionCache::new();
    let primary = load(reference_export("base"), &mut cache);
    let secondary = load(reference_export("copy"), &mut cache);

    let cancel = CancelToken::new();
    cancel.cancel();
    let result = diff(&primary, &secondary, &DiffConfig::default(), &cancel).unwrap();

    assert!(result.cancelled);
    assert!(result.fixed_points.is_empty());
    assert_eq!(result.confidence, 0.0);
    assert!(result.similarity >= 0.0 && result.similarity <= 1.0);
}

#[test]
fn library_functions_never_match_application_functions() {
    let mut lib_spec = FunctionSpec::new(0x5000, "memcpy", 4);
    lib_spec.library = true;
    let app_spec = FunctionSpec::new(0x5000, "memcpy", 4);

    let mut cache = InstructionCache::new();
    let primary = load(
        program_export("lib-side", vec![function_export(&lib_spec)], vec![]),
        &mut cache,
    );
    let secondary = load(
        program_export("app-side", vec![function_export(&app_spec)], vec![]),
        &mut cache,
    );

    let result = run(&primary, &secondary);
    assert!(result.fixed_points.is_empty());

    // Both library: matched in the library pass.
    let secondary_lib = load(
        program_export("lib-side-2", vec![function_export(&lib_spec)], vec![]),
        &mut cache,
    );
    let result = run(&primary, &secondary_lib);
    assert_eq!(result.counts.matched_functions, 1);
    assert_eq!(result.counts.matched_library_functions, 1);
}

#[test]
fn extending_the_fixed_point_set_never_lowers_similarity() {
    use binmatch::scoring;

    let mut cache = InstructionCache::new();
    let primary = load(reference_export("base"), &mut cache);
    let secondary = load(reference_export("copy"), &mut cache);
    let result = run(&primary, &secondary);

    let weights = DiffConfig::default().similarity_weights;
    let mut last = -1.0;
    for end in 0..=result.fixed_points.len() {
        let (_, counts) = scoring::counts_and_histogram(
            &primary,
            &secondary,
            &result.fixed_points[..end],
        );
        let value = scoring::similarity(&primary, &secondary, &counts, &weights);
        assert!(value >= last, "similarity decreased at prefix {end}");
        last = value;
    }
}
