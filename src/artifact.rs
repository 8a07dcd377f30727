//! Policy artifacts: the compiled module bytes and what they declare

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use itertools::Itertools;
use tracing::debug;
use wasmparser::{ConstExpr, ExternalKind, Operator, Parser, Payload, TypeRef};

use crate::loader::{PolicyError, PolicyResult};
use crate::wasm::abi::{self, exports, imports, AbiVersion};

/// Page limits of the imported linear memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLimits {
    pub minimum: u64,
    pub maximum: Option<u64>,
}

/// Summary of a policy module's imports and exports
#[derive(Debug, Clone, Default)]
pub struct ArtifactInfo {
    pub abi: AbiVersion,
    /// Limits of the `env.memory` import, if the module imports memory
    pub memory: Option<MemoryLimits>,
    /// Functions imported from the host module
    pub host_functions: BTreeSet<String>,
    /// Exported functions
    pub functions: BTreeSet<String>,
}

impl ArtifactInfo {
    pub fn exports_function(&self, name: &str) -> bool {
        self.functions.contains(name)
    }

    pub fn imports_host_function(&self, name: &str) -> bool {
        self.host_functions.contains(name)
    }

    /// Required exports this module lacks
    pub fn missing_exports(&self) -> Vec<&'static str> {
        exports::REQUIRED
            .iter()
            .copied()
            .filter(|name| !self.exports_function(name))
            .collect()
    }
}

/// A policy module read into memory, immutable once loaded
#[derive(Debug, Clone)]
pub struct PolicyArtifact {
    bytes: Vec<u8>,
    info: ArtifactInfo,
    path: Option<PathBuf>,
}

impl PolicyArtifact {
    /// Read and inspect an artifact from disk
    pub fn from_file(path: impl AsRef<Path>) -> PolicyResult<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| PolicyError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), bytes = bytes.len(), "read policy artifact");

        let mut artifact = Self::from_bytes(bytes)?;
        artifact.path = Some(path.to_path_buf());
        Ok(artifact)
    }

    /// Inspect an artifact already in memory
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> PolicyResult<Self> {
        let bytes = bytes.into();
        let info = inspect(&bytes)?;

        let missing = info.missing_exports();
        if !missing.is_empty() {
            return Err(PolicyError::MissingExportsError(missing.iter().join(", ")));
        }

        Ok(Self {
            bytes,
            info,
            path: None,
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn info(&self) -> &ArtifactInfo {
        &self.info
    }

    /// Where the artifact was read from, if it came from a file
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// Walk the module sections and collect what the host needs to know
pub fn inspect(bytes: &[u8]) -> PolicyResult<ArtifactInfo> {
    let mut info = ArtifactInfo::default();
    let mut imported_globals = 0u32;
    let mut global_values: Vec<Option<i32>> = Vec::new();
    let mut exported_globals: Vec<(String, u32)> = Vec::new();

    for payload in Parser::new(0).parse_all(bytes) {
        match payload? {
            Payload::ImportSection(reader) => {
                for import in reader {
                    let import = import?;
                    match import.ty {
                        TypeRef::Memory(memory)
                            if import.module == abi::IMPORT_MODULE
                                && import.name == imports::MEMORY =>
                        {
                            info.memory = Some(MemoryLimits {
                                minimum: memory.initial,
                                maximum: memory.maximum,
                            });
                        }
                        TypeRef::Func(_) if import.module == abi::IMPORT_MODULE => {
                            info.host_functions.insert(import.name.to_string());
                        }
                        TypeRef::Global(_) => imported_globals += 1,
                        _ => {}
                    }
                }
            }
            Payload::GlobalSection(reader) => {
                for global in reader {
                    let global = global?;
                    global_values.push(const_i32(&global.init_expr)?);
                }
            }
            Payload::ExportSection(reader) => {
                for export in reader {
                    let export = export?;
                    match export.kind {
                        ExternalKind::Func => {
                            info.functions.insert(export.name.to_string());
                        }
                        ExternalKind::Global => {
                            exported_globals.push((export.name.to_string(), export.index));
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }

    let global = |name: &str| {
        exported_globals
            .iter()
            .find(|(export, _)| export == name)
            .and_then(|(_, index)| index.checked_sub(imported_globals))
            .and_then(|index| global_values.get(index as usize).copied().flatten())
    };
    if let Some(major) = global(exports::ABI_VERSION) {
        info.abi = AbiVersion::new(major, global(exports::ABI_MINOR_VERSION).unwrap_or(0));
    }

    Ok(info)
}

/// Value of an `i32.const` initializer
fn const_i32(expr: &ConstExpr<'_>) -> PolicyResult<Option<i32>> {
    let mut reader = expr.get_operators_reader();
    match reader.read()? {
        Operator::I32Const { value } => Ok(Some(value)),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wasm::codegen::{layout, StubPolicyCodeGen};

    #[test]
    fn test_inspect_stub() {
        let wasm_bytes = StubPolicyCodeGen::new().generate().unwrap();
        let artifact = PolicyArtifact::from_bytes(wasm_bytes).unwrap();
        let info = artifact.info();

        assert_eq!(info.abi, AbiVersion::new(1, 2));
        assert_eq!(
            info.memory,
            Some(MemoryLimits {
                minimum: layout::MEMORY_PAGES,
                maximum: None
            })
        );
        assert!(info.imports_host_function(imports::OPA_ABORT));
        assert!(info.imports_host_function(imports::OPA_BUILTIN1));
        assert!(info.exports_function(exports::OPA_EVAL));
        assert!(info.missing_exports().is_empty());
        assert!(artifact.path().is_none());
    }

    #[test]
    fn test_rejects_non_wasm() {
        let err = PolicyArtifact::from_bytes(b"not a policy".to_vec()).unwrap_err();
        assert!(matches!(err, PolicyError::ParseError(_)));
    }

    #[test]
    fn test_rejects_module_without_abi() {
        // An empty module: magic and version only
        let wasm_bytes = wasm_encoder::Module::new().finish();
        let err = PolicyArtifact::from_bytes(wasm_bytes).unwrap_err();

        match err {
            PolicyError::MissingExportsError(missing) => {
                assert!(missing.starts_with("opa_malloc, opa_json_parse"));
                assert!(missing.ends_with("eval, builtins"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_file_names_path() {
        let err = PolicyArtifact::from_file("/nonexistent/dir/policy.wasm").unwrap_err();
        assert!(err
            .to_string()
            .starts_with("failed to read policy artifact /nonexistent/dir/policy.wasm"));
    }
}
