//! OPA WebAssembly policy host
//!
//! Loads Open Policy Agent policies compiled to WebAssembly, evaluates them
//! against JSON input and reports each outcome.

pub mod artifact;
pub mod builtins;
pub mod loader;
pub mod policy;
pub mod report;
pub mod wasm;

pub use artifact::PolicyArtifact;
pub use builtins::{BuiltinError, Builtins};
pub use loader::{PolicyError, PolicyLoader, PolicyModule, PolicyResult};
pub use policy::{Entrypoint, Policy, ResultSet};
pub use report::{evaluate_and_report, Outcome};

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_basic_evaluation() {
        let wasm_bytes = wasm::StubPolicyCodeGen::new().generate().unwrap();
        let mut policy = PolicyLoader::new().load(wasm_bytes).unwrap();

        let results = policy.evaluate(&json!({"role": "admin", "name": "Doe"})).unwrap();
        assert!(!results.is_empty());
    }
}
