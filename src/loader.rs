//! Policy loading: compile artifacts and instantiate them against the host

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use wasmtime::{Engine, MemoryType, Module};

use crate::artifact::{ArtifactInfo, PolicyArtifact};
use crate::builtins::{BuiltinError, Builtins};
use crate::policy::Policy;
use crate::wasm::abi::memory;

pub type PolicyResult<T> = Result<T, PolicyError>;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Failed to read policy artifact {}: {source}", path.display())]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Parse error: {0}")]
    ParseError(#[from] wasmparser::BinaryReaderError),

    #[error("Missing required exports: {0}")]
    MissingExportsError(String),

    #[error("WASM runtime error: {0:#}")]
    WasmError(wasmtime::Error),

    #[error("Memory error: {0}")]
    MemoryError(String),

    /// `opa_abort` was called; `printed` holds the lines printed before it
    #[error("Policy aborted: {message}{}", printed_context(printed))]
    AbortError {
        message: String,
        printed: Vec<String>,
    },

    #[error("Unknown builtin id {0}")]
    UnknownBuiltinError(i32),

    #[error("Builtin {name} failed: {source}")]
    BuiltinCallError { name: String, source: BuiltinError },

    #[error("Evaluation failed with status {0}")]
    EvalError(String),

    #[error("Null address returned by {0}")]
    NullAddressError(&'static str),

    #[error("Malformed result: {0}")]
    MalformedResultError(String),

    #[error("Unknown entrypoint {0}")]
    UnknownEntrypointError(String),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Code generation error: {0}")]
    CodegenError(String),
}

fn printed_context(printed: &[String]) -> String {
    if printed.is_empty() {
        String::new()
    } else {
        format!("\nprinted:\n{}", printed.join("\n"))
    }
}

impl From<wasmtime::Error> for PolicyError {
    /// Host imports fail with a `PolicyError`; recover it when it comes back out of the guest
    fn from(err: wasmtime::Error) -> Self {
        match err.downcast::<PolicyError>() {
            Ok(err) => err,
            Err(err) => PolicyError::WasmError(err),
        }
    }
}

/// A compiled policy module, ready to be instantiated any number of times
#[derive(Debug, Clone)]
pub struct PolicyModule {
    module: Module,
    info: ArtifactInfo,
}

impl PolicyModule {
    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn info(&self) -> &ArtifactInfo {
        &self.info
    }
}

/// Loads policy artifacts into evaluable instances
pub struct PolicyLoader {
    engine: Engine,
    /// Linear memory pages provided to each instance (raised to the module's minimum)
    initial_memory_pages: u32,
    maximum_memory_pages: Option<u32>,
    builtins: Arc<Builtins>,
}

impl PolicyLoader {
    /// Create a new loader with default settings
    pub fn new() -> Self {
        Self {
            engine: Engine::default(),
            initial_memory_pages: memory::DEFAULT_INITIAL_PAGES,
            maximum_memory_pages: None,
            builtins: Arc::new(Builtins::default()),
        }
    }

    pub fn with_initial_memory_pages(mut self, pages: u32) -> Self {
        self.initial_memory_pages = pages;
        self
    }

    pub fn with_maximum_memory_pages(mut self, pages: u32) -> Self {
        self.maximum_memory_pages = Some(pages);
        self
    }

    /// Replace the whole builtin registry
    pub fn with_builtins(mut self, builtins: Builtins) -> Self {
        self.builtins = Arc::new(builtins);
        self
    }

    /// Register one host builtin, overriding any default of the same name
    pub fn with_builtin<F>(mut self, name: impl Into<String>, function: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, BuiltinError> + Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.builtins).register(name, function);
        self
    }

    pub fn builtins(&self) -> &Builtins {
        &self.builtins
    }

    /// Compile an inspected artifact
    pub fn compile(&self, artifact: &PolicyArtifact) -> PolicyResult<PolicyModule> {
        let module = Module::new(&self.engine, artifact.bytes())?;
        debug!(
            abi = %artifact.info().abi,
            bytes = artifact.bytes().len(),
            "compiled policy module"
        );

        Ok(PolicyModule {
            module,
            info: artifact.info().clone(),
        })
    }

    /// Create a fresh instance of a compiled module
    pub fn instantiate(&self, module: &PolicyModule) -> PolicyResult<Policy> {
        let memory_type = self.memory_type(module.info())?;
        Policy::instantiate(
            &self.engine,
            module,
            Arc::clone(&self.builtins),
            memory_type,
        )
    }

    /// Inspect, compile and instantiate in one step
    pub fn load(&self, bytes: impl Into<Vec<u8>>) -> PolicyResult<Policy> {
        let artifact = PolicyArtifact::from_bytes(bytes)?;
        let module = self.compile(&artifact)?;
        self.instantiate(&module)
    }

    /// Load a policy from a file
    pub fn load_file(&self, path: impl AsRef<Path>) -> PolicyResult<Policy> {
        let artifact = PolicyArtifact::from_file(path)?;
        let module = self.compile(&artifact)?;
        self.instantiate(&module)
    }

    fn memory_type(&self, info: &ArtifactInfo) -> PolicyResult<MemoryType> {
        let required = info.memory.map(|m| m.minimum).unwrap_or(0);
        let required = u32::try_from(required).map_err(|_| {
            PolicyError::MemoryError(format!("module requires {required} memory pages"))
        })?;
        let minimum = self.initial_memory_pages.max(required);

        // An import with a maximum only accepts memories bounded at least as tightly
        let maximum = match (self.maximum_memory_pages, info.memory.and_then(|m| m.maximum)) {
            (Some(ours), Some(theirs)) => Some(u64::from(ours).min(theirs)),
            (Some(ours), None) => Some(u64::from(ours)),
            (None, theirs) => theirs,
        };
        let maximum = maximum
            .map(|pages| {
                u32::try_from(pages).map_err(|_| {
                    PolicyError::MemoryError(format!("maximum of {pages} memory pages"))
                })
            })
            .transpose()?;

        if let Some(maximum) = maximum {
            if maximum < minimum {
                return Err(PolicyError::MemoryError(format!(
                    "maximum of {maximum} pages is below the required {minimum}"
                )));
            }
        }

        Ok(MemoryType::new(minimum, maximum))
    }
}

impl Default for PolicyLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::MemoryLimits;
    use crate::wasm::codegen::StubPolicyCodeGen;

    #[test]
    fn test_loader_defaults() {
        let loader = PolicyLoader::new();
        assert_eq!(loader.initial_memory_pages, memory::DEFAULT_INITIAL_PAGES);
        assert!(loader.maximum_memory_pages.is_none());
        assert!(loader.builtins().contains("json.is_valid"));
    }

    #[test]
    fn test_memory_raised_to_module_minimum() {
        let loader = PolicyLoader::new().with_initial_memory_pages(1);
        let info = ArtifactInfo {
            memory: Some(MemoryLimits {
                minimum: 2,
                maximum: None,
            }),
            ..ArtifactInfo::default()
        };

        let ty = loader.memory_type(&info).unwrap();
        assert_eq!(ty.minimum(), 2);
        assert_eq!(ty.maximum(), None);
    }

    #[test]
    fn test_memory_maximum_below_minimum_is_rejected() {
        let loader = PolicyLoader::new().with_maximum_memory_pages(3);
        let err = loader.memory_type(&ArtifactInfo::default()).unwrap_err();
        assert!(matches!(err, PolicyError::MemoryError(_)));
    }

    #[test]
    fn test_load_stub() {
        let wasm_bytes = StubPolicyCodeGen::new().generate().unwrap();
        let policy = PolicyLoader::new().load(wasm_bytes).unwrap();
        assert_eq!(policy.abi_version().to_string(), "1.2");
    }

    #[test]
    fn test_load_missing_file() {
        let err = PolicyLoader::new()
            .load_file("/nonexistent/policy.wasm")
            .unwrap_err();
        assert!(matches!(err, PolicyError::ReadError { .. }));
        assert!(err.to_string().contains("/nonexistent/policy.wasm"));
    }

    #[test]
    fn test_abort_message_carries_printed_lines() {
        let quiet = PolicyError::AbortError {
            message: "halt".into(),
            printed: vec![],
        };
        assert_eq!(quiet.to_string(), "Policy aborted: halt");

        let chatty = PolicyError::AbortError {
            message: "halt".into(),
            printed: vec!["one".into(), "two".into()],
        };
        assert_eq!(chatty.to_string(), "Policy aborted: halt\nprinted:\none\ntwo");
    }

    #[test]
    fn test_guest_errors_round_trip_through_wasmtime() {
        let err = wasmtime::Error::new(PolicyError::AbortError {
            message: "boom".into(),
            printed: vec!["before".into()],
        });
        match PolicyError::from(err) {
            PolicyError::AbortError { message, printed } => {
                assert_eq!(message, "boom");
                assert_eq!(printed, vec!["before"]);
            }
            other => panic!("unexpected error: {other}"),
        }

        let err = PolicyError::from(wasmtime::Error::msg("trap"));
        assert!(matches!(err, PolicyError::WasmError(_)));
    }
}
