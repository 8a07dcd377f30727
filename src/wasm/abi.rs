//! Names and constants of the OPA WebAssembly ABI

use std::fmt;

/// Module name of every host import
pub const IMPORT_MODULE: &str = "env";

/// Host imports a policy may reference
pub mod imports {
    pub const MEMORY: &str = "memory";
    pub const OPA_ABORT: &str = "opa_abort";
    pub const OPA_PRINTLN: &str = "opa_println";
    pub const OPA_BUILTIN0: &str = "opa_builtin0";
    pub const OPA_BUILTIN1: &str = "opa_builtin1";
    pub const OPA_BUILTIN2: &str = "opa_builtin2";
    pub const OPA_BUILTIN3: &str = "opa_builtin3";
    pub const OPA_BUILTIN4: &str = "opa_builtin4";
}

/// Exports a policy module provides
pub mod exports {
    pub const OPA_MALLOC: &str = "opa_malloc";
    pub const OPA_FREE: &str = "opa_free";
    pub const OPA_JSON_PARSE: &str = "opa_json_parse";
    pub const OPA_VALUE_PARSE: &str = "opa_value_parse";
    pub const OPA_JSON_DUMP: &str = "opa_json_dump";
    pub const OPA_VALUE_DUMP: &str = "opa_value_dump";
    pub const OPA_HEAP_PTR_GET: &str = "opa_heap_ptr_get";
    pub const OPA_HEAP_PTR_SET: &str = "opa_heap_ptr_set";
    pub const OPA_EVAL_CTX_NEW: &str = "opa_eval_ctx_new";
    pub const OPA_EVAL_CTX_SET_INPUT: &str = "opa_eval_ctx_set_input";
    pub const OPA_EVAL_CTX_SET_DATA: &str = "opa_eval_ctx_set_data";
    pub const OPA_EVAL_CTX_SET_ENTRYPOINT: &str = "opa_eval_ctx_set_entrypoint";
    pub const OPA_EVAL_CTX_GET_RESULT: &str = "opa_eval_ctx_get_result";
    pub const EVAL: &str = "eval";
    pub const OPA_EVAL: &str = "opa_eval";
    pub const BUILTINS: &str = "builtins";
    pub const ENTRYPOINTS: &str = "entrypoints";
    pub const ABI_VERSION: &str = "opa_wasm_abi_version";
    pub const ABI_MINOR_VERSION: &str = "opa_wasm_abi_minor_version";

    /// Function exports every supported policy must carry
    pub const REQUIRED: &[&str] = &[
        OPA_MALLOC,
        OPA_JSON_PARSE,
        OPA_JSON_DUMP,
        OPA_HEAP_PTR_GET,
        OPA_HEAP_PTR_SET,
        OPA_EVAL_CTX_NEW,
        OPA_EVAL_CTX_SET_INPUT,
        OPA_EVAL_CTX_SET_DATA,
        OPA_EVAL_CTX_GET_RESULT,
        EVAL,
        BUILTINS,
    ];
}

/// Linear memory parameters
pub mod memory {
    /// Size of a WASM page in bytes
    pub const PAGE_SIZE: u64 = 0x1_0000;

    /// Pages the host provides when the policy asks for fewer
    pub const DEFAULT_INITIAL_PAGES: u32 = 5;
}

/// `opa_eval` result format: JSON text
pub const RESULT_FORMAT_JSON: i32 = 0;

/// ABI version advertised by a policy module
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct AbiVersion {
    pub major: i32,
    pub minor: i32,
}

impl AbiVersion {
    /// Version assumed for modules without version globals
    pub const LEGACY: AbiVersion = AbiVersion { major: 1, minor: 0 };

    pub fn new(major: i32, minor: i32) -> Self {
        Self { major, minor }
    }

    /// Whether the single-call `opa_eval` export may be used
    pub fn supports_fastpath_eval(self) -> bool {
        self >= AbiVersion::new(1, 2)
    }
}

impl Default for AbiVersion {
    fn default() -> Self {
        Self::LEGACY
    }
}

impl fmt::Display for AbiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Status codes returned by the `eval` export
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum EvalStatus {
    Ok = 0,
    Err = 1,
    InvalidType = 2,
    InvalidPath = 3,
}

impl EvalStatus {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(EvalStatus::Ok),
            1 => Some(EvalStatus::Err),
            2 => Some(EvalStatus::InvalidType),
            3 => Some(EvalStatus::InvalidPath),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EvalStatus::Ok => "OK",
            EvalStatus::Err => "ERR",
            EvalStatus::InvalidType => "INVALID_TYPE",
            EvalStatus::InvalidPath => "INVALID_PATH",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fastpath_threshold() {
        assert!(!AbiVersion::LEGACY.supports_fastpath_eval());
        assert!(!AbiVersion::new(1, 1).supports_fastpath_eval());
        assert!(AbiVersion::new(1, 2).supports_fastpath_eval());
        assert!(AbiVersion::new(1, 3).supports_fastpath_eval());
    }

    #[test]
    fn test_eval_status_codes() {
        assert_eq!(EvalStatus::from_code(0), Some(EvalStatus::Ok));
        assert_eq!(EvalStatus::from_code(3).map(EvalStatus::name), Some("INVALID_PATH"));
        assert_eq!(EvalStatus::from_code(42), None);
    }
}
