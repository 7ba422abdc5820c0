//! Pipeline driver.
//!
//! `compile` runs the whole pipeline synchronously on the caller's
//! thread: lex, parse, analyze, generate, optimize, assemble, pack. All
//! stages report into one diagnostic sink owned here; the build fails
//! iff that sink holds at least one error, and no artifact is returned
//! for a failed build.

use crate::assembler::{self, Assembled, DebugEntry};
use crate::codegen::{CodeGenerator, CompiledObject};
use crate::diagnostics::{Diagnostic, DiagnosticSink, Stage};
use crate::ir::{FunctionTable, Instruction, Op, Operand};
use crate::manifest::{self, Manifest};
use crate::nef;
use crate::optimizer::{self, OptimizerStats};
use crate::parser::{parse_source, ParseError};
use crate::runtime::services;
use crate::semantic;
use serde::{Deserialize, Serialize};

/// The only NeoVM target the opcode table covers today.
pub const SUPPORTED_TARGET: &str = "3.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilerConfig {
    /// 0 = none, 1 = peephole + folding, 2 = + DCE/copy-prop/threading,
    /// 3 = fixpoint.
    pub optimization_level: u8,
    pub target_version: String,
    pub enable_bounds_checks: bool,
    pub enable_debug_info: bool,
    /// Static ceiling for the evaluation stack and slot usage.
    pub max_stack_depth: usize,
    /// Cap on emitted bytes plus working buffers.
    pub memory_limit: usize,
    /// Manifest contract name; defaults to the top-level object name.
    pub contract_name: Option<String>,
    /// Declared supported standards, e.g. "NEP-17".
    pub supported_standards: Vec<String>,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            optimization_level: 2,
            target_version: SUPPORTED_TARGET.to_string(),
            enable_bounds_checks: false,
            enable_debug_info: false,
            max_stack_depth: 2048,
            memory_limit: 1 << 20,
            contract_name: None,
            supported_standards: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Statistics {
    pub compiled_size_bytes: usize,
    pub instruction_count: usize,
    pub function_count: usize,
    pub optimization_passes: u32,
}

/// Final build product: deploy script, runtime script, manifest and the
/// NEF container around the runtime.
#[derive(Debug, Clone)]
pub struct ContractArtifact {
    pub init: Vec<u8>,
    pub runtime: Vec<u8>,
    pub manifest: Manifest,
    pub debug_map: Option<Vec<DebugEntry>>,
    pub nef: Vec<u8>,
    /// Readable listing of the runtime instruction stream.
    pub assembly: String,
}

#[derive(Debug)]
pub struct CompilationResult {
    pub artifact: Option<ContractArtifact>,
    /// The runtime object's function table (user functions and runtime
    /// helpers), keyed by name.
    pub function_table: FunctionTable,
    pub statistics: Statistics,
    pub errors: Vec<Diagnostic>,
    pub warnings: Vec<Diagnostic>,
}

impl CompilationResult {
    pub fn succeeded(&self) -> bool {
        self.errors.is_empty() && self.artifact.is_some()
    }
}

/// One compiler instance per compilation; the instance accumulates
/// diagnostics and is not reentrant.
pub struct Compiler {
    config: CompilerConfig,
}

impl Compiler {
    pub fn new(config: CompilerConfig) -> Self {
        Self { config }
    }

    pub fn compile(&self, source: &str) -> CompilationResult {
        compile(source, &self.config)
    }
}

/// Compiles Yul source text into a contract artifact.
pub fn compile(source: &str, config: &CompilerConfig) -> CompilationResult {
    let mut sink = DiagnosticSink::new();

    if config.target_version != SUPPORTED_TARGET {
        sink.error(
            Stage::Codegen,
            None,
            format!(
                "target NeoVM version '{}' is not supported (expected '{SUPPORTED_TARGET}')",
                config.target_version
            ),
        );
        return finish(None, FunctionTable::new(), Statistics::default(), sink);
    }

    // Lex + parse.
    let (object, parse_errors) = parse_source(source);
    for error in &parse_errors {
        let stage = match error {
            ParseError::Lex(_) => Stage::Lex,
            _ => Stage::Parse,
        };
        sink.error(stage, error.span(), error.to_string());
    }
    let Some(object) = object else {
        return finish(None, FunctionTable::new(), Statistics::default(), sink);
    };
    tracing::debug!(object = %object.name, "parsed");

    // Semantic analysis always completes.
    let info = semantic::analyze(&object, &mut sink);
    tracing::debug!(
        functions = info.function_count,
        variables = info.variable_count,
        errors = sink.error_count(),
        "analyzed"
    );

    // Code generation, even in the presence of semantic errors: later
    // diagnostics can still be useful, the artifact is discarded anyway.
    let mut compiled = CodeGenerator::new(config, &mut sink).generate(&object);

    // Optimization over every object's instruction list.
    let mut opt_stats = OptimizerStats::default();
    optimize_tree(
        &mut compiled,
        config.optimization_level,
        &mut opt_stats,
        &mut sink,
    );
    tracing::debug!(
        passes = opt_stats.passes_run,
        folded = opt_stats.constants_folded,
        removed = opt_stats.instructions_removed,
        "optimized"
    );

    // Assembly.
    let assembled = match assembler::assemble(&compiled) {
        Ok(assembled) => assembled,
        Err(errors) => {
            for error in errors {
                sink.error(Stage::Assemble, None, error.to_string());
            }
            return finish(None, FunctionTable::new(), Statistics::default(), sink);
        }
    };

    let (artifact, function_table, statistics) =
        package(source, config, &compiled, &assembled, &opt_stats, &mut sink);

    let artifact = if sink.has_errors() { None } else { Some(artifact) };
    finish(artifact, function_table, statistics, sink)
}

fn optimize_tree(
    object: &mut CompiledObject,
    level: u8,
    stats: &mut OptimizerStats,
    sink: &mut DiagnosticSink,
) {
    let instructions = std::mem::take(&mut object.instructions);
    match optimizer::optimize(instructions.clone(), level) {
        Ok((optimized, pass_stats)) => {
            object.instructions = optimized;
            stats.passes_run += pass_stats.passes_run;
            stats.instructions_removed += pass_stats.instructions_removed;
            stats.constants_folded += pass_stats.constants_folded;
            stats.jumps_threaded += pass_stats.jumps_threaded;
        }
        Err(err) => {
            // Internal invariant violation: report it and keep the
            // unoptimized code so assembly diagnostics stay meaningful.
            sink.error(Stage::Optimize, None, err.to_string());
            object.instructions = instructions;
        }
    }
    for sub in &mut object.sub_objects {
        optimize_tree(sub, level, stats, sink);
    }
}

/// Picks the runtime object: the conventional sub-object when present,
/// the top-level object itself otherwise.
fn runtime_index(compiled: &CompiledObject) -> Option<usize> {
    if compiled.sub_objects.is_empty() {
        return None;
    }
    compiled
        .sub_objects
        .iter()
        .position(|o| o.name == "runtime" || o.name.ends_with("_deployed"))
        .or(Some(0))
}

fn package(
    source: &str,
    config: &CompilerConfig,
    compiled: &CompiledObject,
    assembled: &Assembled,
    opt_stats: &OptimizerStats,
    sink: &mut DiagnosticSink,
) -> (ContractArtifact, FunctionTable, Statistics) {
    let (runtime_compiled, runtime_assembled, init_script) = match runtime_index(compiled) {
        Some(index) => (
            &compiled.sub_objects[index],
            &assembled.sub_objects[index],
            assembled.script.clone(),
        ),
        None => {
            // Single-object source: the object's own code is the
            // runtime; synthesize the canonical loader as the deploy
            // script (push the runtime blob, return it).
            let loader = loader_object(&assembled.script);
            let init = match assembler::assemble(&loader) {
                Ok(assembled_loader) => assembled_loader.script,
                Err(errors) => {
                    for error in errors {
                        sink.error(Stage::Assemble, None, error.to_string());
                    }
                    Vec::new()
                }
            };
            (compiled, assembled, init)
        }
    };

    let runtime_script = runtime_assembled.script.clone();

    // Spec invariant: the emitted runtime must fit the memory limit.
    if runtime_script.len() > config.memory_limit {
        sink.error(
            Stage::Assemble,
            None,
            format!(
                "runtime script is {} bytes, memory limit is {}",
                runtime_script.len(),
                config.memory_limit
            ),
        );
    } else if runtime_script.len() * 4 > config.memory_limit * 3 {
        sink.warning(
            Stage::Assemble,
            None,
            format!(
                "runtime script is {} bytes, above 75% of the {} byte limit",
                runtime_script.len(),
                config.memory_limit
            ),
        );
    }

    let contract_name = config
        .contract_name
        .clone()
        .unwrap_or_else(|| compiled.name.clone());
    let manifest = manifest::build(
        &contract_name,
        &config.supported_standards,
        &runtime_compiled.function_table,
        runtime_assembled,
        &runtime_compiled.instructions,
    );

    let nef = match nef::encode(&runtime_script, crate::COMPILER_NAME, source) {
        Ok(container) => container,
        Err(err) => {
            sink.error(Stage::Assemble, None, err.to_string());
            Vec::new()
        }
    };

    let statistics = Statistics {
        compiled_size_bytes: runtime_script.len(),
        instruction_count: runtime_compiled
            .instructions
            .iter()
            .filter(|i| !i.is_label())
            .count(),
        function_count: runtime_compiled
            .function_table
            .values()
            .filter(|entry| !entry.is_helper && entry.emitted)
            .count(),
        optimization_passes: opt_stats.passes_run,
    };

    let artifact = ContractArtifact {
        init: init_script,
        runtime: runtime_script,
        manifest,
        debug_map: config
            .enable_debug_info
            .then(|| runtime_assembled.debug_map.clone()),
        nef,
        assembly: crate::ir::disassemble(&runtime_compiled.instructions),
    };

    (artifact, runtime_compiled.function_table.clone(), statistics)
}

/// `datacopy(0, dataoffset("runtime"), datasize("runtime"));
/// return(0, datasize("runtime"))` collapses to pushing the runtime
/// blob and returning it, which is what the synthesized loader does.
fn loader_object(runtime_script: &[u8]) -> CompiledObject {
    CompiledObject {
        name: "loader".to_string(),
        instructions: vec![
            Instruction::with(Op::Push, Operand::Bytes(runtime_script.to_vec())),
            Instruction::syscall(services::EXIT),
        ],
        function_table: FunctionTable::new(),
        sub_objects: Vec::new(),
        data_items: Vec::new(),
    }
}

fn finish(
    artifact: Option<ContractArtifact>,
    function_table: FunctionTable,
    statistics: Statistics,
    sink: DiagnosticSink,
) -> CompilationResult {
    let (errors, rest) = sink.into_parts();
    let warnings = rest
        .into_iter()
        .filter(|d| d.severity == crate::diagnostics::Severity::Warning)
        .collect();
    let artifact = if errors.is_empty() { artifact } else { None };
    CompilationResult {
        artifact,
        function_table,
        statistics,
        errors,
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_compiles_to_minimal_contract() {
        let result = compile(r#"object "Empty" { code { } }"#, &CompilerConfig::default());
        assert!(result.succeeded(), "{:?}", result.errors);
        let artifact = result.artifact.unwrap();
        assert!(!artifact.runtime.is_empty());
        assert!(!artifact.init.is_empty());
        assert_eq!(artifact.manifest.name, "Empty");
        assert!(nef::decode_script(&artifact.nef).is_ok());
    }

    #[test]
    fn runtime_subobject_is_selected() {
        let result = compile(
            r#"object "C" {
                code {
                    datacopy(0, dataoffset("runtime"), datasize("runtime"))
                    return(0, datasize("runtime"))
                }
                object "runtime" {
                    code { sstore(0, 1) }
                }
            }"#,
            &CompilerConfig::default(),
        );
        assert!(result.succeeded(), "{:?}", result.errors);
        let artifact = result.artifact.unwrap();
        // The init script embeds the runtime blob and is therefore
        // strictly longer than it.
        assert!(artifact.init.len() > artifact.runtime.len());
    }

    #[test]
    fn unknown_target_fails() {
        let config = CompilerConfig {
            target_version: "9.9".to_string(),
            ..CompilerConfig::default()
        };
        let result = compile("{ }", &config);
        assert!(!result.succeeded());
        assert!(result.errors[0].message.contains("not supported"));
    }

    #[test]
    fn failed_build_has_no_artifact() {
        let result = compile("{ let x := y }", &CompilerConfig::default());
        assert!(!result.succeeded());
        assert!(result.artifact.is_none());
        assert_eq!(result.errors.len(), 1);
    }

    #[test]
    fn statistics_are_populated() {
        let result = compile(
            "{ function f(a) -> r { r := add(a, 1) } sstore(0, f(1)) }",
            &CompilerConfig::default(),
        );
        assert!(result.succeeded(), "{:?}", result.errors);
        assert!(result.statistics.compiled_size_bytes > 0);
        assert!(result.statistics.instruction_count > 0);
        assert_eq!(result.statistics.function_count, 1);
        assert!(result.statistics.optimization_passes > 0);
    }

    #[test]
    fn debug_map_follows_config() {
        let source = "{ sstore(0, 1) }";
        let without = compile(source, &CompilerConfig::default());
        assert!(without.artifact.unwrap().debug_map.is_none());

        let config = CompilerConfig {
            enable_debug_info: true,
            ..CompilerConfig::default()
        };
        let with = compile(source, &config);
        let map = with.artifact.unwrap().debug_map.unwrap();
        assert!(!map.is_empty());
    }
}
