//! Command-line front end for the Yul to NeoVM compiler.

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use neo_yul::{compile, CompilerConfig};
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    /// NEF container plus manifest JSON.
    Nef,
    /// Hex dump of the runtime script.
    Hex,
    /// Readable instruction listing.
    Asm,
    /// One JSON document with scripts, manifest and statistics.
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "neo-yulc", version, about = "Compiles Yul to NeoVM bytecode")]
struct Cli {
    /// Input Yul source file.
    input: PathBuf,

    /// Output path; defaults next to the input.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Optimization level.
    #[arg(short = 'O', long = "optimize", default_value_t = 2, value_parser = clap::value_parser!(u8).range(0..=3))]
    optimize: u8,

    #[arg(short, long, value_enum, default_value_t = Format::Nef)]
    format: Format,

    /// Target NeoVM version.
    #[arg(short, long, default_value = neo_yul::compiler::SUPPORTED_TARGET)]
    target: String,

    /// Preserve source spans and emit the debug map.
    #[arg(short, long)]
    debug: bool,

    /// Emit range checks on memory and calldata access.
    #[arg(long)]
    bounds_checks: bool,

    /// Contract name for the manifest.
    #[arg(long)]
    contract_name: Option<String>,

    /// Supported standard to declare (repeatable), e.g. NEP-17.
    #[arg(long = "standard")]
    standards: Vec<String>,

    /// Verbose stage logging.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("neo_yul=debug,neo_yulc=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let source = fs::read_to_string(&cli.input)
        .with_context(|| format!("reading {}", cli.input.display()))?;

    let config = CompilerConfig {
        optimization_level: cli.optimize,
        target_version: cli.target.clone(),
        enable_bounds_checks: cli.bounds_checks,
        enable_debug_info: cli.debug,
        contract_name: cli.contract_name.clone(),
        supported_standards: cli.standards.clone(),
        ..CompilerConfig::default()
    };

    let result = compile(&source, &config);

    for warning in &result.warnings {
        eprintln!("{warning}");
    }
    if !result.errors.is_empty() {
        for error in &result.errors {
            eprintln!("{error}");
        }
        bail!("compilation failed with {} error(s)", result.errors.len());
    }

    let artifact = result
        .artifact
        .as_ref()
        .expect("successful compilation carries an artifact");

    let stem = cli
        .output
        .clone()
        .unwrap_or_else(|| cli.input.with_extension(""));

    match cli.format {
        Format::Nef => {
            let nef_path = stem.with_extension("nef");
            let manifest_path = stem.with_extension("manifest.json");
            fs::write(&nef_path, &artifact.nef)
                .with_context(|| format!("writing {}", nef_path.display()))?;
            write_manifest(&manifest_path, artifact)?;
            if cli.debug {
                let debug_path = stem.with_extension("debug.json");
                let map = serde_json::to_string_pretty(&artifact.debug_map)?;
                fs::write(&debug_path, map)
                    .with_context(|| format!("writing {}", debug_path.display()))?;
            }
            eprintln!(
                "wrote {} ({} bytes) and {}",
                nef_path.display(),
                artifact.nef.len(),
                manifest_path.display()
            );
        }
        Format::Hex => {
            emit(&stem.with_extension("hex"), hex::encode(&artifact.runtime), cli.output.is_some())?;
        }
        Format::Asm => {
            emit(&stem.with_extension("asm"), artifact.assembly.clone(), cli.output.is_some())?;
        }
        Format::Json => {
            let bundle = serde_json::json!({
                "contract": {
                    "init": hex::encode(&artifact.init),
                    "runtime": hex::encode(&artifact.runtime),
                    "nef": hex::encode(&artifact.nef),
                    "manifest": artifact.manifest,
                    "debugMap": artifact.debug_map,
                },
                "statistics": result.statistics,
            });
            emit(
                &stem.with_extension("json"),
                serde_json::to_string_pretty(&bundle)?,
                cli.output.is_some(),
            )?;
        }
    }

    Ok(())
}

fn write_manifest(path: &Path, artifact: &neo_yul::ContractArtifact) -> Result<()> {
    let json = serde_json::to_string_pretty(&artifact.manifest)?;
    fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

/// Writes to the output file when `-o` was given, stdout otherwise.
fn emit(path: &Path, content: String, to_file: bool) -> Result<()> {
    if to_file {
        fs::write(path, content).with_context(|| format!("writing {}", path.display()))?;
        eprintln!("wrote {}", path.display());
    } else {
        println!("{content}");
    }
    Ok(())
}
