//! End-to-end pipeline tests over complete Yul sources.

use neo_yul::assembler;
use neo_yul::codegen::{CodeGenerator, CompiledObject};
use neo_yul::compiler::{compile, CompilerConfig};
use neo_yul::diagnostics::{DiagnosticSink, Stage};
use neo_yul::ir::{Instruction, Op, Operand};
use neo_yul::optimizer;
use neo_yul::parser::parse_source;
use neo_yul::runtime::services;
use pretty_assertions::assert_eq;

/// A hand-written ERC-20 style token in the solc IR dialect: selector
/// dispatch over balanceOf / transfer / approve.
const TOKEN_SOURCE: &str = r#"
object "Token" {
    code {
        datacopy(0, dataoffset("runtime"), datasize("runtime"))
        return(0, datasize("runtime"))
    }
    object "runtime" {
        code {
            let selector := div(calldataload(0), 0x100000000000000000000000000000000000000000000000000000000)
            switch selector
            case 0x70a08231 {
                returnUint(getBalance(calldataload(4)))
            }
            case 0xa9059cbb {
                returnBool(transfer(calldataload(4), calldataload(36)))
            }
            case 0x095ea7b3 {
                returnBool(approve(calldataload(4), calldataload(36)))
            }
            default {
                revert(0, 0)
            }

            function getBalance(account) -> bal {
                bal := sload(account)
            }

            function setBalance(account, amount) {
                sstore(account, amount)
            }

            function setAllowance(owner, spender, amount) {
                sstore(add(owner, spender), amount)
            }

            function transfer(to, amount) -> ok {
                let from := caller()
                require(gte(getBalance(from), amount))
                setBalance(from, sub(getBalance(from), amount))
                setBalance(to, safeAdd(getBalance(to), amount))
                log3(0, 0, from, to, amount)
                ok := 1
            }

            function approve(spender, amount) -> ok {
                setAllowance(caller(), spender, amount)
                ok := 1
            }

            function require(cond) {
                if iszero(cond) { revert(0, 0) }
            }

            function safeAdd(a, b) -> c {
                c := add(a, b)
                require(gte(c, a))
            }

            function gte(a, b) -> r {
                r := iszero(lt(a, b))
            }

            function returnUint(v) {
                mstore(0, v)
                return(0, 32)
            }

            function returnBool(v) {
                mstore(0, v)
                return(0, 32)
            }
        }
    }
}
"#;

fn generate_object(source: &str, config: &CompilerConfig) -> (CompiledObject, DiagnosticSink) {
    let (object, errors) = parse_source(source);
    assert!(errors.is_empty(), "parse errors: {errors:?}");
    let object = object.unwrap();
    let mut sink = DiagnosticSink::new();
    neo_yul::semantic::analyze(&object, &mut sink);
    let compiled = CodeGenerator::new(config, &mut sink).generate(&object);
    (compiled, sink)
}

fn runtime_of(compiled: &CompiledObject) -> &CompiledObject {
    compiled
        .sub_objects
        .iter()
        .find(|o| o.name == "runtime")
        .unwrap_or(compiled)
}

fn service_calls(instructions: &[Instruction]) -> Vec<String> {
    instructions
        .iter()
        .filter_map(|i| match (&i.op, &i.operand) {
            (Op::Syscall, Operand::Service(name)) => Some(name.clone()),
            _ => None,
        })
        .collect()
}

// --- Scenario A: minimal ERC-20 dispatch ---------------------------------

#[test]
fn token_runtime_reaches_storage_events_and_arithmetic() {
    let (compiled, sink) = generate_object(TOKEN_SOURCE, &CompilerConfig::default());
    assert!(!sink.has_errors(), "{:?}", sink.all());

    let runtime = runtime_of(&compiled);
    let services_used = service_calls(&runtime.instructions);
    assert!(services_used.contains(&services::STORAGE_GET.to_string()));
    assert!(services_used.contains(&services::STORAGE_PUT.to_string()));
    assert!(services_used.contains(&services::NOTIFY.to_string()));

    let ops: Vec<Op> = runtime.instructions.iter().map(|i| i.op).collect();
    assert!(ops.contains(&Op::Add));
    assert!(ops.contains(&Op::Sub));
}

#[test]
fn token_function_table_is_total() {
    let (compiled, sink) = generate_object(TOKEN_SOURCE, &CompilerConfig::default());
    assert!(!sink.has_errors(), "{:?}", sink.all());
    let runtime = runtime_of(&compiled);

    for name in [
        "getBalance",
        "transfer",
        "approve",
        "setBalance",
        "setAllowance",
        "require",
        "safeAdd",
        "gte",
        "returnUint",
        "returnBool",
    ] {
        let entry = runtime
            .function_table
            .get(name)
            .unwrap_or_else(|| panic!("'{name}' missing from the function table"));
        assert!(entry.emitted, "'{name}' registered but not emitted");
        assert!(!entry.is_helper);
    }

    // Arities match the declarations.
    assert_eq!(runtime.function_table["transfer"].params, 2);
    assert_eq!(runtime.function_table["transfer"].returns, 1);
    assert_eq!(runtime.function_table["setAllowance"].params, 3);
    assert_eq!(runtime.function_table["setAllowance"].returns, 0);
}

#[test]
fn token_compiles_to_full_artifact() {
    let config = CompilerConfig {
        supported_standards: vec!["NEP-17".to_string()],
        ..CompilerConfig::default()
    };
    let result = compile(TOKEN_SOURCE, &config);
    assert!(result.succeeded(), "{:?}", result.errors);

    let artifact = result.artifact.unwrap();
    assert!(!artifact.init.is_empty());
    assert!(!artifact.runtime.is_empty());
    assert_eq!(artifact.manifest.name, "Token");
    assert_eq!(artifact.manifest.supported_standards, vec!["NEP-17"]);

    // The ABI recovered the user functions with resolved offsets.
    let names: Vec<&str> = artifact
        .manifest
        .abi
        .methods
        .iter()
        .map(|m| m.name.as_str())
        .collect();
    assert!(names.contains(&"transfer"));
    assert!(names.contains(&"getBalance"));
    let get_balance = artifact
        .manifest
        .abi
        .methods
        .iter()
        .find(|m| m.name == "getBalance")
        .unwrap();
    assert!((get_balance.offset as usize) < artifact.runtime.len());
    assert!(get_balance.safe, "a read-only function is safe");
    let transfer = artifact
        .manifest
        .abi
        .methods
        .iter()
        .find(|m| m.name == "transfer")
        .unwrap();
    assert!(!transfer.safe, "a storage-writing function is not safe");

    // Events from the log helpers appear in the ABI.
    assert!(artifact.manifest.abi.events.iter().any(|e| e.name == "Log3"));
}

// --- Scenario B: constant folding ----------------------------------------

#[test]
fn constant_addition_folds_away() {
    let source = "{ let x := add(1, 2) pop(x) }";
    for level in 1..=3u8 {
        let (mut compiled, sink) = generate_object(source, &CompilerConfig::default());
        assert!(!sink.has_errors(), "{:?}", sink.all());
        let (optimized, _) =
            optimizer::optimize(std::mem::take(&mut compiled.instructions), level).unwrap();

        assert!(
            !optimized.iter().any(|i| i.op == Op::Add),
            "ADD survived folding at level {level}"
        );
        assert!(
            optimized
                .iter()
                .any(|i| i.pushed_word().map(|w| w == &3u8.into()).unwrap_or(false)),
            "folded constant 3 missing at level {level}"
        );
    }
}

#[test]
fn unoptimized_addition_is_kept() {
    let source = "{ let x := add(1, 2) pop(x) }";
    let (compiled, _) = generate_object(source, &CompilerConfig::default());
    assert!(compiled.instructions.iter().any(|i| i.op == Op::Add));
}

// --- Scenario C: dead code elimination -----------------------------------

#[test]
fn code_after_return_is_eliminated() {
    let source = "{ function f() { return(0, 0) let x := 1 sstore(0, x) } pop(0) f() }";
    let (mut compiled, sink) = generate_object(source, &CompilerConfig::default());
    assert!(!sink.has_errors(), "{:?}", sink.all());

    let had_sstore = compiled
        .function_table
        .contains_key("__sstore");
    assert!(had_sstore, "unoptimized code calls the storage helper");

    let sstore_entry = compiled.function_table["__sstore"].entry;
    let (optimized, _) =
        optimizer::optimize(std::mem::take(&mut compiled.instructions), 2).unwrap();

    // The call site after return(0,0) is unreachable and must be gone;
    // only the (now uncalled) helper body's own instructions remain.
    let calls_to_sstore = optimized
        .iter()
        .filter(|i| i.op == Op::Call && i.jump_target() == Some(sstore_entry))
        .count();
    assert_eq!(calls_to_sstore, 0);
}

// --- Scenario D: unresolved identifier -----------------------------------

#[test]
fn unresolved_identifier_is_exactly_one_semantic_error() {
    let source = "{ let x := y }";
    let result = compile(source, &CompilerConfig::default());
    assert!(!result.succeeded());
    assert_eq!(result.errors.len(), 1);

    let error = &result.errors[0];
    assert_eq!(error.stage, Stage::Semantic);
    let span = error.span.expect("semantic errors carry spans");
    assert_eq!(&source[span.offset..span.offset + span.len], "y");
}

// --- Scenario E: stack limit ---------------------------------------------

#[test]
fn four_thousand_locals_overflow_a_256_slot_stack() {
    let mut body = String::from("{ function flood() { ");
    for i in 0..4096 {
        body.push_str(&format!("let v{i} := {i} "));
    }
    body.push_str("} flood() }");

    let config = CompilerConfig {
        max_stack_depth: 256,
        ..CompilerConfig::default()
    };
    let result = compile(&body, &config);
    assert!(!result.succeeded());
    assert!(result.errors.iter().any(|e| {
        e.stage == Stage::Codegen && e.message.contains("stack depth")
    }));
}

// --- Scenario F: determinism ---------------------------------------------

#[test]
fn identical_inputs_give_identical_artifacts() {
    let config = CompilerConfig::default();
    let first = compile(TOKEN_SOURCE, &config);
    let second = compile(TOKEN_SOURCE, &config);
    assert!(first.succeeded() && second.succeeded());

    let a = first.artifact.unwrap();
    let b = second.artifact.unwrap();
    assert_eq!(a.runtime, b.runtime);
    assert_eq!(a.init, b.init);
    assert_eq!(a.nef, b.nef);
    assert_eq!(a.manifest, b.manifest);
}

// --- boundary behaviors ---------------------------------------------------

#[test]
fn empty_object_is_a_minimal_valid_contract() {
    let result = compile(r#"object "Nil" { code { } }"#, &CompilerConfig::default());
    assert!(result.succeeded(), "{:?}", result.errors);
    let artifact = result.artifact.unwrap();
    assert!(neo_yul::nef::decode_script(&artifact.nef).is_ok());
    assert!(artifact.manifest.abi.methods.iter().any(|m| m.name == "main"));
}

#[test]
fn single_revert_runtime_compiles() {
    let result = compile(
        r#"object "R" { code { } object "runtime" { code { revert(0, 0) } } }"#,
        &CompilerConfig::default(),
    );
    assert!(result.succeeded(), "{:?}", result.errors);
    let artifact = result.artifact.unwrap();
    assert!(artifact.assembly.contains("Throw"));
}

#[test]
fn sixteen_parameter_function_compiles_end_to_end() {
    let params: Vec<String> = (0..16).map(|i| format!("p{i}")).collect();
    let args: Vec<String> = (0..16).map(|i| i.to_string()).collect();
    let source = format!(
        "{{ function wide({}) -> r {{ r := add(p0, add(p7, p15)) }} sstore(0, wide({})) }}",
        params.join(", "),
        args.join(", ")
    );
    let result = compile(&source, &CompilerConfig::default());
    assert!(result.succeeded(), "{:?}", result.errors);
    assert_eq!(result.function_table["wide"].params, 16);
}

// --- structural invariants ------------------------------------------------

#[test]
fn every_jump_target_lies_within_the_script() {
    let (mut compiled, sink) = generate_object(TOKEN_SOURCE, &CompilerConfig::default());
    assert!(!sink.has_errors(), "{:?}", sink.all());

    let (optimized, _) =
        optimizer::optimize(std::mem::take(&mut compiled.instructions), 3).unwrap();
    compiled.instructions = optimized;
    let assembled = assembler::assemble(&compiled).unwrap();

    fn check(assembled: &assembler::Assembled) {
        for offset in assembled.label_offsets.values() {
            assert!(*offset <= assembled.code_len);
        }
        for sub in &assembled.sub_objects {
            check(sub);
        }
    }
    check(&assembled);
}

#[test]
fn storage_and_logs_always_lower_to_syscalls() {
    let source = r#"{
        sstore(0, 1)
        let v := sload(0)
        log0(0, 0)
        log4(0, 0, 1, 2, 3, 4)
        pop(v)
    }"#;
    let (compiled, sink) = generate_object(source, &CompilerConfig::default());
    assert!(!sink.has_errors(), "{:?}", sink.all());
    let services_used = service_calls(&compiled.instructions);
    assert!(services_used.contains(&services::STORAGE_GET.to_string()));
    assert!(services_used.contains(&services::STORAGE_PUT.to_string()));
    assert_eq!(
        services_used
            .iter()
            .filter(|s| s.as_str() == services::NOTIFY)
            .count(),
        2,
        "log0 and log4 each emit through one Notify helper body"
    );
}

#[test]
fn runtime_script_respects_memory_limit() {
    let config = CompilerConfig {
        memory_limit: 128,
        ..CompilerConfig::default()
    };
    let result = compile(TOKEN_SOURCE, &config);
    assert!(!result.succeeded());
    assert!(result.artifact.is_none(), "partial artifacts are discarded");
}

#[test]
fn optimizer_level_three_is_idempotent_on_real_code() {
    let (mut compiled, sink) = generate_object(TOKEN_SOURCE, &CompilerConfig::default());
    assert!(!sink.has_errors(), "{:?}", sink.all());
    let runtime = compiled
        .sub_objects
        .iter_mut()
        .find(|o| o.name == "runtime")
        .unwrap();

    let (once, _) = optimizer::optimize(std::mem::take(&mut runtime.instructions), 3).unwrap();
    let (twice, _) = optimizer::optimize(once.clone(), 3).unwrap();
    assert_eq!(once, twice);
}

#[test]
fn optimization_levels_only_shrink_the_script() {
    let mut sizes = Vec::new();
    for level in 0..=3u8 {
        let config = CompilerConfig {
            optimization_level: level,
            ..CompilerConfig::default()
        };
        let result = compile(TOKEN_SOURCE, &config);
        assert!(result.succeeded(), "level {level}: {:?}", result.errors);
        sizes.push(result.statistics.compiled_size_bytes);
    }
    assert!(sizes[1] <= sizes[0]);
    assert!(sizes[2] <= sizes[1]);
    assert!(sizes[3] <= sizes[2]);
}

#[test]
fn diagnostics_arrive_in_source_order() {
    let source = "{ let a := nope1 let b := nope2 let c := nope3 }";
    let result = compile(source, &CompilerConfig::default());
    assert_eq!(result.errors.len(), 3);
    let offsets: Vec<usize> = result
        .errors
        .iter()
        .map(|e| e.span.unwrap().offset)
        .collect();
    let mut sorted = offsets.clone();
    sorted.sort_unstable();
    assert_eq!(offsets, sorted);
}
