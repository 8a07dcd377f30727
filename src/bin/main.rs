//! Smoke test for a compiled OPA policy
//!
//! Loads the policy once and evaluates it against a fixed set of inputs in
//! order, printing one report line per evaluation.

use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use opa_wasm_smoke::report::{self, smoke_inputs};
use opa_wasm_smoke::wasm::StubPolicyCodeGen;
use opa_wasm_smoke::{
    Entrypoint, Policy, PolicyArtifact, PolicyLoader, PolicyModule, PolicyResult,
};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_ARTIFACT_PATH: &str = "compiled-policies/policy.wasm";

#[derive(Debug, Parser)]
#[command(name = "opa-smoke", version, about = "Evaluate a compiled OPA policy against smoke-test inputs")]
struct Cli {
    /// Compiled policy module
    #[arg(default_value = DEFAULT_ARTIFACT_PATH)]
    artifact: PathBuf,

    /// Entrypoint id or name
    #[arg(short, long, default_value = "0")]
    entrypoint: String,

    /// Data document as JSON
    #[arg(long, value_name = "JSON")]
    data: Option<String>,

    /// Input as JSON; repeatable, replaces the built-in inputs
    #[arg(short, long = "input", value_name = "JSON")]
    inputs: Vec<String>,

    /// Instantiate the policy afresh for every input
    #[arg(long)]
    isolate: bool,

    /// Write a stub policy module to PATH and exit
    #[arg(long, value_name = "PATH")]
    emit_stub: Option<PathBuf>,

    /// ABI minor version advertised by the stub
    #[arg(long, default_value_t = 2)]
    stub_abi_minor: i32,
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> PolicyResult<()> {
    if let Some(path) = &cli.emit_stub {
        let wasm_bytes = StubPolicyCodeGen::new()
            .with_abi_minor(cli.stub_abi_minor)
            .generate()?;
        std::fs::write(path, &wasm_bytes)?;
        println!(
            "Wrote stub policy ({} bytes) to {}",
            wasm_bytes.len(),
            path.display()
        );
        return Ok(());
    }

    let inputs: Vec<Value> = if cli.inputs.is_empty() {
        smoke_inputs()
    } else {
        cli.inputs
            .iter()
            .map(|input| serde_json::from_str(input))
            .collect::<Result<_, _>>()?
    };
    let data: Option<Value> = cli.data.as_deref().map(serde_json::from_str).transpose()?;
    let entrypoint = Entrypoint::parse(&cli.entrypoint);

    let loader = PolicyLoader::new();
    let artifact = PolicyArtifact::from_file(&cli.artifact)?;
    info!(
        path = %cli.artifact.display(),
        abi = %artifact.info().abi,
        "loaded policy artifact"
    );
    let module = loader.compile(&artifact)?;

    let mut shared = if cli.isolate {
        None
    } else {
        Some(prepare(&loader, &module, data.as_ref())?)
    };

    let stdout = io::stdout();
    let stderr = io::stderr();
    let mut out = stdout.lock();
    let mut err = stderr.lock();
    for input in &inputs {
        let mut fresh;
        let policy = match shared.as_mut() {
            Some(policy) => policy,
            None => {
                fresh = prepare(&loader, &module, data.as_ref())?;
                &mut fresh
            }
        };
        report::evaluate_and_report(policy, input, entrypoint.clone(), &mut out, &mut err)?;
    }

    Ok(())
}

fn prepare(loader: &PolicyLoader, module: &PolicyModule, data: Option<&Value>) -> PolicyResult<Policy> {
    let mut policy = loader.instantiate(module)?;
    if let Some(data) = data {
        policy.set_data(data)?;
    }
    Ok(policy)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal())
        .init();
}
