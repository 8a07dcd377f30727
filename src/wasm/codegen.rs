//! Stub policy generation
//!
//! Produces a small module that speaks the OPA evaluation ABI without any
//! rule logic of its own. Values inside the stub are NUL-terminated JSON texts,
//! so parsing copies bytes and dumping returns the same address. It is enough
//! to drive every host path (both evaluation ABIs, builtins, `opa_println`
//! and `opa_abort`) without the external policy toolchain.

use serde_json::{Map, Value};
use wasm_encoder::{
    BlockType, CodeSection, ConstExpr, DataSection, EntityType, ExportKind, ExportSection,
    Function, FunctionSection, GlobalSection, GlobalType, ImportSection, Instruction as WasmInst,
    MemArg, MemoryType, Module, ValType,
};

use crate::loader::{PolicyError, PolicyResult};
use crate::wasm::abi::{self, exports, imports};
use crate::wasm::types::{FunctionSignature, TypeTable};

/// Builtin the `stub/builtin` entrypoint calls with its input
pub const STUB_BUILTIN: &str = "custom.echo";

/// Entrypoints of the stub, indexed by id
pub const STUB_ENTRYPOINTS: &[&str] = &[
    "stub/echo",
    "stub/undefined",
    "stub/abort",
    "stub/builtin",
    "stub/println",
    "stub/status",
];

/// Id of `stub/status`: `eval` returns `ERR` and `opa_eval` a null address
const STATUS_ENTRYPOINT: i32 = 5;

/// Message the `stub/abort` entrypoint aborts with
pub const STUB_ABORT_MESSAGE: &str = "stub/abort reached";

/// Function indices of the stub; imports come first
pub mod func {
    pub const OPA_ABORT: u32 = 0;
    pub const OPA_PRINTLN: u32 = 1;
    pub const OPA_BUILTIN1: u32 = 2;
    pub const IMPORTED: u32 = 3;

    pub const MALLOC: u32 = 3;
    pub const FREE: u32 = 4;
    pub const HEAP_PTR_GET: u32 = 5;
    pub const HEAP_PTR_SET: u32 = 6;
    pub const JSON_PARSE: u32 = 7;
    pub const VALUE_PARSE: u32 = 8;
    pub const JSON_DUMP: u32 = 9;
    pub const VALUE_DUMP: u32 = 10;
    pub const BUILTINS: u32 = 11;
    pub const ENTRYPOINTS: u32 = 12;
    pub const EVAL_CTX_NEW: u32 = 13;
    pub const EVAL_CTX_SET_INPUT: u32 = 14;
    pub const EVAL_CTX_SET_DATA: u32 = 15;
    pub const EVAL_CTX_SET_ENTRYPOINT: u32 = 16;
    pub const EVAL_CTX_GET_RESULT: u32 = 17;
    pub const EVAL: u32 = 18;
    pub const OPA_EVAL: u32 = 19;
    pub const STRLEN: u32 = 20;
    pub const WRAP_RESULT: u32 = 21;
    pub const RUN: u32 = 22;
}

/// Global indices of the stub
pub mod global {
    pub const HEAP: u32 = 0;
    pub const ABI_VERSION: u32 = 1;
    pub const ABI_MINOR_VERSION: u32 = 2;
}

/// Layout of the stub's linear memory
pub mod layout {
    /// Pages the stub imports
    pub const MEMORY_PAGES: u64 = 2;

    /// Constant strings start here; address 0 stays the null value
    pub const STRING_POOL_START: u32 = 0x400;

    /// First heap address
    pub const HEAP_START: u32 = 0x1000;
}

// Eval context record: input, data, entrypoint, result
const CTX_INPUT: u64 = 0;
const CTX_DATA: u64 = 4;
const CTX_ENTRYPOINT: u64 = 8;
const CTX_RESULT: u64 = 12;
const CTX_SIZE: i32 = 16;

fn word(offset: u64) -> MemArg {
    MemArg {
        offset,
        align: 2,
        memory_index: 0,
    }
}

fn byte() -> MemArg {
    MemArg {
        offset: 0,
        align: 0,
        memory_index: 0,
    }
}

/// A NUL-terminated string placed in the pool
#[derive(Debug, Clone, Copy)]
struct PoolString {
    addr: i32,
    len: i32,
}

#[derive(Debug, Default)]
struct StringPool {
    bytes: Vec<u8>,
}

impl StringPool {
    fn add(&mut self, s: &str) -> PoolString {
        let addr = layout::STRING_POOL_START as usize + self.bytes.len();
        self.bytes.extend_from_slice(s.as_bytes());
        self.bytes.push(0);
        PoolString {
            addr: addr as i32,
            len: s.len() as i32,
        }
    }

    fn end(&self) -> u32 {
        layout::STRING_POOL_START + self.bytes.len() as u32
    }
}

/// Addresses of the constants function bodies refer to
struct Strings {
    builtins: PoolString,
    entrypoints: PoolString,
    result_prefix: PoolString,
    result_suffix: PoolString,
    empty_result: PoolString,
    abort: PoolString,
    bad_entrypoint: PoolString,
    out_of_memory: PoolString,
}

struct StubFunction {
    export: Option<&'static str>,
    signature: FunctionSignature,
    locals: u32,
    body: Vec<WasmInst<'static>>,
}

impl StubFunction {
    fn new(
        export: Option<&'static str>,
        params: usize,
        results: usize,
        locals: u32,
        body: Vec<WasmInst<'static>>,
    ) -> Self {
        Self {
            export,
            signature: FunctionSignature::i32s(params, results),
            locals,
            body,
        }
    }

    fn encode(&self) -> Function {
        let locals = if self.locals > 0 {
            vec![(self.locals, ValType::I32)]
        } else {
            vec![]
        };
        let mut f = Function::new(locals);
        for inst in &self.body {
            f.instruction(inst);
        }
        f.instruction(&WasmInst::End);
        f
    }
}

/// Generator for the stub policy module
pub struct StubPolicyCodeGen {
    abi_minor: i32,
}

impl StubPolicyCodeGen {
    pub fn new() -> Self {
        Self { abi_minor: 2 }
    }

    /// Advertised ABI minor version; below 2 the `opa_eval` export is left out
    pub fn with_abi_minor(mut self, minor: i32) -> Self {
        self.abi_minor = minor.clamp(0, 3);
        self
    }

    pub fn abi_minor(&self) -> i32 {
        self.abi_minor
    }

    /// Generate the complete module
    pub fn generate(&self) -> PolicyResult<Vec<u8>> {
        let mut pool = StringPool::default();
        let strings = Strings {
            builtins: pool.add(&Value::Object(Self::id_table(&[STUB_BUILTIN])).to_string()),
            entrypoints: pool.add(&Value::Object(Self::id_table(STUB_ENTRYPOINTS)).to_string()),
            result_prefix: pool.add(r#"[{"result":"#),
            result_suffix: pool.add("}]"),
            empty_result: pool.add("[]"),
            abort: pool.add(STUB_ABORT_MESSAGE),
            bad_entrypoint: pool.add("invalid entrypoint id"),
            out_of_memory: pool.add("out of memory"),
        };
        if pool.end() > layout::HEAP_START {
            return Err(PolicyError::CodegenError(format!(
                "string pool ends at {:#x}, past the heap start {:#x}",
                pool.end(),
                layout::HEAP_START
            )));
        }

        let defined = self.defined_functions(&strings);
        if defined.len() as u32 != func::RUN + 1 - func::IMPORTED {
            return Err(PolicyError::CodegenError(format!(
                "function table out of sync: {} defined functions",
                defined.len()
            )));
        }

        let mut types = TypeTable::new();

        // Imports: memory and the host functions the stub calls
        let mut import_section = ImportSection::new();
        import_section.import(
            abi::IMPORT_MODULE,
            imports::MEMORY,
            EntityType::Memory(MemoryType {
                minimum: layout::MEMORY_PAGES,
                maximum: None,
                memory64: false,
                shared: false,
                page_size_log2: None,
            }),
        );
        for (name, sig) in [
            (imports::OPA_ABORT, FunctionSignature::i32s(1, 0)),
            (imports::OPA_PRINTLN, FunctionSignature::i32s(1, 0)),
            (imports::OPA_BUILTIN1, FunctionSignature::i32s(3, 1)),
        ] {
            let ty = types.index_of(sig);
            import_section.import(abi::IMPORT_MODULE, name, EntityType::Function(ty));
        }

        let mut functions = FunctionSection::new();
        let mut export_section = ExportSection::new();
        let mut codes = CodeSection::new();
        for (offset, function) in defined.iter().enumerate() {
            let index = func::IMPORTED + offset as u32;
            functions.function(types.index_of(function.signature.clone()));
            if let Some(name) = function.export {
                export_section.export(name, ExportKind::Func, index);
            }
            codes.function(&function.encode());
        }

        let mut globals = GlobalSection::new();
        globals.global(
            GlobalType {
                val_type: ValType::I32,
                mutable: true,
                shared: false,
            },
            &ConstExpr::i32_const(layout::HEAP_START as i32),
        );
        for value in [1, self.abi_minor] {
            globals.global(
                GlobalType {
                    val_type: ValType::I32,
                    mutable: false,
                    shared: false,
                },
                &ConstExpr::i32_const(value),
            );
        }
        export_section.export(exports::ABI_VERSION, ExportKind::Global, global::ABI_VERSION);
        export_section.export(
            exports::ABI_MINOR_VERSION,
            ExportKind::Global,
            global::ABI_MINOR_VERSION,
        );

        let mut data = DataSection::new();
        data.active(
            0,
            &ConstExpr::i32_const(layout::STRING_POOL_START as i32),
            pool.bytes.iter().copied(),
        );

        let mut module = Module::new();
        module.section(&types.to_section());
        module.section(&import_section);
        module.section(&functions);
        module.section(&globals);
        module.section(&export_section);
        module.section(&codes);
        module.section(&data);

        Ok(module.finish())
    }

    fn id_table(names: &[&str]) -> Map<String, Value> {
        names
            .iter()
            .enumerate()
            .map(|(id, name)| (name.to_string(), Value::from(id)))
            .collect()
    }

    /// Bodies of all defined functions, in index order starting at `func::IMPORTED`
    fn defined_functions(&self, s: &Strings) -> Vec<StubFunction> {
        use WasmInst::*;

        let fastpath_export = (self.abi_minor >= 2).then_some(exports::OPA_EVAL);

        vec![
            // opa_malloc(size) -> addr; locals: 1 = addr, 2 = end
            StubFunction::new(
                Some(exports::OPA_MALLOC),
                1,
                1,
                2,
                vec![
                    GlobalGet(global::HEAP),
                    LocalSet(1),
                    GlobalGet(global::HEAP),
                    LocalGet(0),
                    I32Add,
                    LocalTee(2),
                    GlobalSet(global::HEAP),
                    LocalGet(2),
                    MemorySize(0),
                    I32Const(16),
                    I32Shl,
                    I32GtU,
                    If(BlockType::Empty),
                    LocalGet(2),
                    MemorySize(0),
                    I32Const(16),
                    I32Shl,
                    I32Sub,
                    I32Const(16),
                    I32ShrU,
                    I32Const(1),
                    I32Add,
                    MemoryGrow(0),
                    I32Const(-1),
                    I32Eq,
                    If(BlockType::Empty),
                    I32Const(s.out_of_memory.addr),
                    Call(func::OPA_ABORT),
                    Unreachable,
                    End,
                    End,
                    LocalGet(1),
                ],
            ),
            // opa_free(addr): bump allocator, nothing to release
            StubFunction::new(Some(exports::OPA_FREE), 1, 0, 0, vec![]),
            StubFunction::new(
                Some(exports::OPA_HEAP_PTR_GET),
                0,
                1,
                0,
                vec![GlobalGet(global::HEAP)],
            ),
            StubFunction::new(
                Some(exports::OPA_HEAP_PTR_SET),
                1,
                0,
                0,
                vec![LocalGet(0), GlobalSet(global::HEAP)],
            ),
            // opa_json_parse(addr, len) -> value; local 2 = copy
            StubFunction::new(
                Some(exports::OPA_JSON_PARSE),
                2,
                1,
                1,
                vec![
                    LocalGet(1),
                    I32Const(1),
                    I32Add,
                    Call(func::MALLOC),
                    LocalTee(2),
                    LocalGet(0),
                    LocalGet(1),
                    MemoryCopy {
                        src_mem: 0,
                        dst_mem: 0,
                    },
                    LocalGet(2),
                    LocalGet(1),
                    I32Add,
                    I32Const(0),
                    I32Store8(byte()),
                    LocalGet(2),
                ],
            ),
            StubFunction::new(
                Some(exports::OPA_VALUE_PARSE),
                2,
                1,
                0,
                vec![LocalGet(0), LocalGet(1), Call(func::JSON_PARSE)],
            ),
            StubFunction::new(Some(exports::OPA_JSON_DUMP), 1, 1, 0, vec![LocalGet(0)]),
            StubFunction::new(Some(exports::OPA_VALUE_DUMP), 1, 1, 0, vec![LocalGet(0)]),
            StubFunction::new(
                Some(exports::BUILTINS),
                0,
                1,
                0,
                vec![I32Const(s.builtins.addr)],
            ),
            StubFunction::new(
                Some(exports::ENTRYPOINTS),
                0,
                1,
                0,
                vec![I32Const(s.entrypoints.addr)],
            ),
            // opa_eval_ctx_new() -> ctx; the heap is reused, so zero every field
            StubFunction::new(
                Some(exports::OPA_EVAL_CTX_NEW),
                0,
                1,
                1,
                vec![
                    I32Const(CTX_SIZE),
                    Call(func::MALLOC),
                    LocalSet(0),
                    LocalGet(0),
                    I32Const(0),
                    I32Store(word(CTX_INPUT)),
                    LocalGet(0),
                    I32Const(0),
                    I32Store(word(CTX_DATA)),
                    LocalGet(0),
                    I32Const(0),
                    I32Store(word(CTX_ENTRYPOINT)),
                    LocalGet(0),
                    I32Const(0),
                    I32Store(word(CTX_RESULT)),
                    LocalGet(0),
                ],
            ),
            StubFunction::new(
                Some(exports::OPA_EVAL_CTX_SET_INPUT),
                2,
                0,
                0,
                vec![LocalGet(0), LocalGet(1), I32Store(word(CTX_INPUT))],
            ),
            StubFunction::new(
                Some(exports::OPA_EVAL_CTX_SET_DATA),
                2,
                0,
                0,
                vec![LocalGet(0), LocalGet(1), I32Store(word(CTX_DATA))],
            ),
            StubFunction::new(
                Some(exports::OPA_EVAL_CTX_SET_ENTRYPOINT),
                2,
                0,
                0,
                vec![LocalGet(0), LocalGet(1), I32Store(word(CTX_ENTRYPOINT))],
            ),
            StubFunction::new(
                Some(exports::OPA_EVAL_CTX_GET_RESULT),
                1,
                1,
                0,
                vec![LocalGet(0), I32Load(word(CTX_RESULT))],
            ),
            // eval(ctx) -> status
            StubFunction::new(
                Some(exports::EVAL),
                1,
                1,
                0,
                vec![
                    LocalGet(0),
                    I32Load(word(CTX_ENTRYPOINT)),
                    I32Const(STATUS_ENTRYPOINT),
                    I32Eq,
                    If(BlockType::Empty),
                    I32Const(abi::EvalStatus::Err as i32),
                    Return,
                    End,
                    LocalGet(0),
                    LocalGet(0),
                    I32Load(word(CTX_ENTRYPOINT)),
                    LocalGet(0),
                    I32Load(word(CTX_INPUT)),
                    Call(func::RUN),
                    I32Store(word(CTX_RESULT)),
                    I32Const(0),
                ],
            ),
            // opa_eval(reserved, entrypoint, data, input, input_len, heap, format) -> json
            StubFunction::new(
                fastpath_export,
                7,
                1,
                0,
                vec![
                    LocalGet(1),
                    I32Const(STATUS_ENTRYPOINT),
                    I32Eq,
                    If(BlockType::Empty),
                    I32Const(0),
                    Return,
                    End,
                    LocalGet(5),
                    GlobalSet(global::HEAP),
                    LocalGet(1),
                    LocalGet(3),
                    LocalGet(4),
                    Call(func::JSON_PARSE),
                    Call(func::RUN),
                ],
            ),
            // strlen(addr) -> len; local 1 = len
            StubFunction::new(
                None,
                1,
                1,
                1,
                vec![
                    Block(BlockType::Empty),
                    Loop(BlockType::Empty),
                    LocalGet(0),
                    LocalGet(1),
                    I32Add,
                    I32Load8U(byte()),
                    I32Eqz,
                    BrIf(1),
                    LocalGet(1),
                    I32Const(1),
                    I32Add,
                    LocalSet(1),
                    Br(0),
                    End,
                    End,
                    LocalGet(1),
                ],
            ),
            // wrap_result(value) -> `[{"result":<value>}]`; locals: 1 = len, 2 = dst, 3 = total
            StubFunction::new(
                None,
                1,
                1,
                3,
                vec![
                    LocalGet(0),
                    Call(func::STRLEN),
                    LocalSet(1),
                    I32Const(s.result_prefix.len),
                    LocalGet(1),
                    I32Add,
                    I32Const(s.result_suffix.len),
                    I32Add,
                    LocalSet(3),
                    LocalGet(3),
                    I32Const(1),
                    I32Add,
                    Call(func::MALLOC),
                    LocalSet(2),
                    // prefix
                    LocalGet(2),
                    I32Const(s.result_prefix.addr),
                    I32Const(s.result_prefix.len),
                    MemoryCopy {
                        src_mem: 0,
                        dst_mem: 0,
                    },
                    // value
                    LocalGet(2),
                    I32Const(s.result_prefix.len),
                    I32Add,
                    LocalGet(0),
                    LocalGet(1),
                    MemoryCopy {
                        src_mem: 0,
                        dst_mem: 0,
                    },
                    // suffix
                    LocalGet(2),
                    I32Const(s.result_prefix.len),
                    I32Add,
                    LocalGet(1),
                    I32Add,
                    I32Const(s.result_suffix.addr),
                    I32Const(s.result_suffix.len),
                    MemoryCopy {
                        src_mem: 0,
                        dst_mem: 0,
                    },
                    LocalGet(2),
                    LocalGet(3),
                    I32Add,
                    I32Const(0),
                    I32Store8(byte()),
                    LocalGet(2),
                ],
            ),
            // run(entrypoint, input) -> result json
            StubFunction::new(
                None,
                2,
                1,
                0,
                vec![
                    // stub/echo
                    LocalGet(0),
                    I32Eqz,
                    If(BlockType::Empty),
                    LocalGet(1),
                    Call(func::WRAP_RESULT),
                    Return,
                    End,
                    // stub/undefined
                    LocalGet(0),
                    I32Const(1),
                    I32Eq,
                    If(BlockType::Empty),
                    I32Const(s.empty_result.addr),
                    Return,
                    End,
                    // stub/abort
                    LocalGet(0),
                    I32Const(2),
                    I32Eq,
                    If(BlockType::Empty),
                    I32Const(s.abort.addr),
                    Call(func::OPA_ABORT),
                    Unreachable,
                    End,
                    // stub/builtin
                    LocalGet(0),
                    I32Const(3),
                    I32Eq,
                    If(BlockType::Empty),
                    I32Const(0),
                    I32Const(0),
                    LocalGet(1),
                    Call(func::OPA_BUILTIN1),
                    Call(func::WRAP_RESULT),
                    Return,
                    End,
                    // stub/println
                    LocalGet(0),
                    I32Const(4),
                    I32Eq,
                    If(BlockType::Empty),
                    LocalGet(1),
                    Call(func::OPA_PRINTLN),
                    LocalGet(1),
                    Call(func::WRAP_RESULT),
                    Return,
                    End,
                    I32Const(s.bad_entrypoint.addr),
                    Call(func::OPA_ABORT),
                    Unreachable,
                ],
            ),
        ]
    }
}

impl Default for StubPolicyCodeGen {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::PolicyArtifact;

    #[test]
    fn test_stub_is_valid_wasm() {
        let wasm_bytes = StubPolicyCodeGen::new().generate().unwrap();

        assert_eq!(&wasm_bytes[0..4], b"\0asm");
        wasmparser::Validator::new().validate_all(&wasm_bytes).unwrap();
    }

    #[test]
    fn test_legacy_stub_omits_fastpath_export() {
        let wasm_bytes = StubPolicyCodeGen::new().with_abi_minor(1).generate().unwrap();
        let artifact = PolicyArtifact::from_bytes(wasm_bytes).unwrap();

        assert_eq!(artifact.info().abi.to_string(), "1.1");
        assert!(!artifact.info().exports_function(exports::OPA_EVAL));
        assert!(artifact.info().exports_function(exports::EVAL));
    }

    #[test]
    fn test_status_entrypoint_is_advertised() {
        assert_eq!(
            STUB_ENTRYPOINTS.get(STATUS_ENTRYPOINT as usize),
            Some(&"stub/status")
        );
    }

    #[test]
    fn test_abi_minor_is_clamped() {
        assert_eq!(StubPolicyCodeGen::new().with_abi_minor(9).abi_minor(), 3);
        assert_eq!(StubPolicyCodeGen::new().with_abi_minor(-1).abi_minor(), 0);
    }
}
