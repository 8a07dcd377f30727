//! WebAssembly plumbing: the policy ABI, host bindings and stub generation

pub mod abi;
pub mod codegen;
pub mod host;
pub mod types;

pub use codegen::StubPolicyCodeGen;
