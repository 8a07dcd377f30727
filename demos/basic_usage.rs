//! Basic usage of the policy host

use opa_wasm_smoke::wasm::StubPolicyCodeGen;
use opa_wasm_smoke::{PolicyLoader, PolicyResult};
use serde_json::{json, Value};

fn main() -> PolicyResult<()> {
    // Example 1: Evaluate a policy from bytes
    let wasm_bytes = StubPolicyCodeGen::new().generate()?;
    let loader = PolicyLoader::new()
        .with_builtin("custom.echo", |args: &[Value]| Ok(json!({ "args": args })));
    let mut policy = loader.load(wasm_bytes.clone())?;

    let results = policy.evaluate(&json!({"role": "admin", "name": "Doe"}))?;
    println!("result: {results}");

    // Example 2: Pick an entrypoint by name
    let results = policy.evaluate_entrypoint(&json!("hello"), "stub/builtin")?;
    println!("builtin result: {results}");

    // Example 3: Collect what the policy printed
    let results = policy.evaluate_entrypoint(&json!({"note": "hi"}), "stub/println")?;
    println!("entries: {:?}", results.entries());
    for line in policy.take_printed() {
        println!("policy printed: {line}");
    }

    // Example 4: Load from a file
    std::fs::write("stub.wasm", &wasm_bytes)?;
    let mut from_file = loader.load_file("stub.wasm")?;
    println!("entrypoints: {:?}", from_file.entrypoints());
    println!("undefined: {}", from_file.evaluate_entrypoint(&json!({}), "stub/undefined")?.is_empty());

    Ok(())
}
