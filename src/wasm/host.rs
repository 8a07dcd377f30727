//! Host side of the policy ABI
//!
//! Binds the `env` imports a policy expects, resolves the guest exports the
//! host calls back into, and moves JSON values across linear memory.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};
use wasmtime::{
    AsContext, AsContextMut, Caller, Instance, Linker, Memory, TypedFunc, WasmParams, WasmResults,
};

use crate::builtins::Builtins;
use crate::loader::{PolicyError, PolicyResult};
use crate::wasm::abi::{self, exports, imports, memory::PAGE_SIZE};

/// Per-instance state reachable from host imports
pub struct HostState {
    pub(crate) memory: Option<Memory>,
    pub(crate) guest: Option<Arc<GuestExports>>,
    pub(crate) builtins: Arc<Builtins>,
    /// Builtin names by the id the policy calls them with
    pub(crate) builtin_ids: HashMap<i32, String>,
    /// Lines passed to `opa_println`, oldest first
    pub(crate) printed: Vec<String>,
}

impl HostState {
    pub fn new(builtins: Arc<Builtins>) -> Self {
        Self {
            memory: None,
            guest: None,
            builtins,
            builtin_ids: HashMap::new(),
            printed: Vec::new(),
        }
    }
}

/// Typed handles on the guest exports the host uses
pub struct GuestExports {
    pub malloc: TypedFunc<i32, i32>,
    pub json_parse: TypedFunc<(i32, i32), i32>,
    pub json_dump: TypedFunc<i32, i32>,
    pub heap_ptr_get: TypedFunc<(), i32>,
    pub heap_ptr_set: TypedFunc<i32, ()>,
    pub eval_ctx_new: TypedFunc<(), i32>,
    pub eval_ctx_set_input: TypedFunc<(i32, i32), ()>,
    pub eval_ctx_set_data: TypedFunc<(i32, i32), ()>,
    pub eval_ctx_set_entrypoint: Option<TypedFunc<(i32, i32), ()>>,
    pub eval_ctx_get_result: TypedFunc<i32, i32>,
    pub eval: TypedFunc<i32, i32>,
    pub builtins: TypedFunc<(), i32>,
    pub entrypoints: Option<TypedFunc<(), i32>>,
    /// `opa_eval(reserved, entrypoint, data, input, input_len, heap_ptr, format)`
    pub opa_eval: Option<TypedFunc<(i32, i32, i32, i32, i32, i32, i32), i32>>,
}

impl GuestExports {
    pub fn resolve(instance: &Instance, mut store: impl AsContextMut) -> PolicyResult<Self> {
        let store = &mut store;
        Ok(Self {
            malloc: required(instance, store, exports::OPA_MALLOC)?,
            json_parse: required(instance, store, exports::OPA_JSON_PARSE)?,
            json_dump: required(instance, store, exports::OPA_JSON_DUMP)?,
            heap_ptr_get: required(instance, store, exports::OPA_HEAP_PTR_GET)?,
            heap_ptr_set: required(instance, store, exports::OPA_HEAP_PTR_SET)?,
            eval_ctx_new: required(instance, store, exports::OPA_EVAL_CTX_NEW)?,
            eval_ctx_set_input: required(instance, store, exports::OPA_EVAL_CTX_SET_INPUT)?,
            eval_ctx_set_data: required(instance, store, exports::OPA_EVAL_CTX_SET_DATA)?,
            eval_ctx_set_entrypoint: optional(
                instance,
                store,
                exports::OPA_EVAL_CTX_SET_ENTRYPOINT,
            )?,
            eval_ctx_get_result: required(instance, store, exports::OPA_EVAL_CTX_GET_RESULT)?,
            eval: required(instance, store, exports::EVAL)?,
            builtins: required(instance, store, exports::BUILTINS)?,
            entrypoints: optional(instance, store, exports::ENTRYPOINTS)?,
            opa_eval: optional(instance, store, exports::OPA_EVAL)?,
        })
    }
}

fn optional<P, R>(
    instance: &Instance,
    store: &mut impl AsContextMut,
    name: &str,
) -> PolicyResult<Option<TypedFunc<P, R>>>
where
    P: WasmParams,
    R: WasmResults,
{
    match instance.get_func(&mut *store, name) {
        Some(func) => Ok(Some(func.typed::<P, R>(&*store)?)),
        None => Ok(None),
    }
}

fn required<P, R>(
    instance: &Instance,
    store: &mut impl AsContextMut,
    name: &str,
) -> PolicyResult<TypedFunc<P, R>>
where
    P: WasmParams,
    R: WasmResults,
{
    optional(instance, store, name)?
        .ok_or_else(|| PolicyError::MissingExportsError(name.to_string()))
}

/// Define the `env` host functions on `linker`; `env.memory` is defined per store
pub fn define_imports(linker: &mut Linker<HostState>) -> PolicyResult<()> {
    linker.func_wrap(
        abi::IMPORT_MODULE,
        imports::OPA_ABORT,
        |caller: Caller<'_, HostState>, addr: i32| -> wasmtime::Result<()> {
            let message = read_cstr(guest_memory(&caller)?, &caller, addr)?;
            let printed = caller.data().printed.clone();
            Err(PolicyError::AbortError { message, printed }.into())
        },
    )?;
    linker.func_wrap(
        abi::IMPORT_MODULE,
        imports::OPA_PRINTLN,
        |mut caller: Caller<'_, HostState>, addr: i32| -> wasmtime::Result<()> {
            let message = read_cstr(guest_memory(&caller)?, &caller, addr)?;
            info!(target: "opa_println", "{message}");
            caller.data_mut().printed.push(message);
            Ok(())
        },
    )?;
    linker.func_wrap(
        abi::IMPORT_MODULE,
        imports::OPA_BUILTIN0,
        |mut caller: Caller<'_, HostState>, id: i32, _ctx: i32| -> wasmtime::Result<i32> {
            Ok(call_builtin(&mut caller, id, &[])?)
        },
    )?;
    linker.func_wrap(
        abi::IMPORT_MODULE,
        imports::OPA_BUILTIN1,
        |mut caller: Caller<'_, HostState>, id: i32, _ctx: i32, a: i32| -> wasmtime::Result<i32> {
            Ok(call_builtin(&mut caller, id, &[a])?)
        },
    )?;
    linker.func_wrap(
        abi::IMPORT_MODULE,
        imports::OPA_BUILTIN2,
        |mut caller: Caller<'_, HostState>,
         id: i32,
         _ctx: i32,
         a: i32,
         b: i32|
         -> wasmtime::Result<i32> { Ok(call_builtin(&mut caller, id, &[a, b])?) },
    )?;
    linker.func_wrap(
        abi::IMPORT_MODULE,
        imports::OPA_BUILTIN3,
        |mut caller: Caller<'_, HostState>,
         id: i32,
         _ctx: i32,
         a: i32,
         b: i32,
         c: i32|
         -> wasmtime::Result<i32> { Ok(call_builtin(&mut caller, id, &[a, b, c])?) },
    )?;
    linker.func_wrap(
        abi::IMPORT_MODULE,
        imports::OPA_BUILTIN4,
        |mut caller: Caller<'_, HostState>,
         id: i32,
         _ctx: i32,
         a: i32,
         b: i32,
         c: i32,
         d: i32|
         -> wasmtime::Result<i32> { Ok(call_builtin(&mut caller, id, &[a, b, c, d])?) },
    )?;
    Ok(())
}

/// Dispatch `opa_builtinN`: dump the arguments, run the host function, load the result
fn call_builtin(caller: &mut Caller<'_, HostState>, id: i32, args: &[i32]) -> PolicyResult<i32> {
    let name = caller
        .data()
        .builtin_ids
        .get(&id)
        .cloned()
        .ok_or(PolicyError::UnknownBuiltinError(id))?;

    let mut values = Vec::with_capacity(args.len());
    for &addr in args {
        values.push(dump_json(&mut *caller, addr)?);
    }

    debug!(builtin = %name, args = values.len(), "calling host builtin");
    let builtins = Arc::clone(&caller.data().builtins);
    let result = builtins
        .call(&name, &values)
        .map_err(|source| PolicyError::BuiltinCallError { name, source })?;

    load_json(&mut *caller, &serde_json::to_vec(&result)?)
}

fn guest_memory(store: &impl AsContext<Data = HostState>) -> PolicyResult<Memory> {
    store
        .as_context()
        .data()
        .memory
        .ok_or_else(|| PolicyError::MemoryError("guest memory is not bound".into()))
}

fn guest_handles(
    store: &impl AsContext<Data = HostState>,
) -> PolicyResult<(Memory, Arc<GuestExports>)> {
    let memory = guest_memory(store)?;
    let guest = store
        .as_context()
        .data()
        .guest
        .clone()
        .ok_or_else(|| PolicyError::MemoryError("guest exports are not resolved".into()))?;
    Ok((memory, guest))
}

fn guest_addr(addr: i32) -> PolicyResult<usize> {
    usize::try_from(addr).map_err(|_| PolicyError::MemoryError(format!("negative address {addr}")))
}

/// Read a NUL-terminated UTF-8 string out of guest memory
pub fn read_cstr(memory: Memory, store: impl AsContext, addr: i32) -> PolicyResult<String> {
    let data = memory.data(&store);
    let tail = data.get(guest_addr(addr)?..).ok_or_else(|| {
        PolicyError::MemoryError(format!("address {addr:#x} is outside guest memory"))
    })?;
    let len = tail.iter().position(|&b| b == 0).ok_or_else(|| {
        PolicyError::MemoryError(format!("string at {addr:#x} is not NUL-terminated"))
    })?;

    String::from_utf8(tail[..len].to_vec()).map_err(|e| {
        PolicyError::MemoryError(format!("string at {addr:#x} is not UTF-8: {e}"))
    })
}

/// Copy `bytes` to `addr`, growing guest memory when they do not fit
pub fn write_bytes(
    memory: Memory,
    mut store: impl AsContextMut,
    addr: i32,
    bytes: &[u8],
) -> PolicyResult<()> {
    let start = guest_addr(addr)?;
    let end = start + bytes.len();
    let size = memory.data_size(&store);
    if end > size {
        let pages = (end - size).div_ceil(PAGE_SIZE as usize) as u64;
        memory.grow(&mut store, pages)?;
        debug!(pages, "grew guest memory");
    }

    memory
        .write(&mut store, start, bytes)
        .map_err(|e| PolicyError::MemoryError(format!("write at {addr:#x}: {e}")))
}

pub fn byte_len(bytes: &[u8]) -> PolicyResult<i32> {
    i32::try_from(bytes.len())
        .map_err(|_| PolicyError::MemoryError(format!("{} bytes exceed guest limits", bytes.len())))
}

/// Parse JSON text inside the guest, returning the value address
pub fn load_json(mut store: impl AsContextMut<Data = HostState>, json: &[u8]) -> PolicyResult<i32> {
    let (memory, guest) = guest_handles(&store)?;
    let len = byte_len(json)?;

    let raw = guest.malloc.call(&mut store, len)?;
    write_bytes(memory, &mut store, raw, json)?;

    let parsed = guest.json_parse.call(&mut store, (raw, len))?;
    if parsed == 0 {
        return Err(PolicyError::NullAddressError(exports::OPA_JSON_PARSE));
    }
    Ok(parsed)
}

/// Serialize the guest value at `addr` and parse it on the host
pub fn dump_json(mut store: impl AsContextMut<Data = HostState>, addr: i32) -> PolicyResult<Value> {
    Ok(serde_json::from_str(&dump_json_text(&mut store, addr)?)?)
}

/// Serialize the guest value at `addr` to JSON text
pub fn dump_json_text(
    mut store: impl AsContextMut<Data = HostState>,
    addr: i32,
) -> PolicyResult<String> {
    let (memory, guest) = guest_handles(&store)?;
    let text = guest.json_dump.call(&mut store, addr)?;
    if text == 0 {
        return Err(PolicyError::NullAddressError(exports::OPA_JSON_DUMP));
    }
    read_cstr(memory, &store, text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasmtime::{Engine, MemoryType, Store};

    fn store_with_memory() -> (Store<HostState>, Memory) {
        let engine = Engine::default();
        let mut store = Store::new(&engine, HostState::new(Arc::new(Builtins::default())));
        let memory = Memory::new(&mut store, MemoryType::new(1, None)).unwrap();
        store.data_mut().memory = Some(memory);
        (store, memory)
    }

    #[test]
    fn test_read_null_terminated_string() {
        let (mut store, memory) = store_with_memory();
        write_bytes(memory, &mut store, 16, "Štěpán\0world".as_bytes()).unwrap();

        assert_eq!(read_cstr(memory, &store, 16).unwrap(), "Štěpán");
    }

    #[test]
    fn test_unterminated_string_is_rejected() {
        let (mut store, memory) = store_with_memory();
        let size = memory.data_size(&store) as i32;
        write_bytes(memory, &mut store, size - 2, b"ab").unwrap();

        let err = read_cstr(memory, &store, size - 2).unwrap_err();
        assert!(matches!(err, PolicyError::MemoryError(_)));
    }

    #[test]
    fn test_write_grows_memory() {
        let (mut store, memory) = store_with_memory();
        let before = memory.data_size(&store);
        let payload = vec![b'x'; PAGE_SIZE as usize];
        write_bytes(memory, &mut store, 8, &payload).unwrap();

        assert!(memory.data_size(&store) > before);
        assert_eq!(&memory.data(&store)[8..16], b"xxxxxxxx");
    }

    #[test]
    fn test_negative_address_is_rejected() {
        let (store, memory) = store_with_memory();
        assert!(matches!(
            read_cstr(memory, &store, -4),
            Err(PolicyError::MemoryError(_))
        ));
    }

    #[test]
    fn test_unresolved_guest_is_an_error() {
        let (mut store, _memory) = store_with_memory();
        let err = load_json(&mut store, b"{}").unwrap_err();
        assert!(err.to_string().contains("guest exports are not resolved"));
    }
}
