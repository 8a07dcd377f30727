//! Instantiated policies and their evaluation

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use wasmtime::{Engine, Linker, Memory, MemoryType, Store};

use crate::builtins::Builtins;
use crate::loader::{PolicyError, PolicyModule, PolicyResult};
use crate::wasm::abi::{self, exports, imports, AbiVersion, EvalStatus};
use crate::wasm::host::{self, GuestExports, HostState};

/// Rule path to evaluate, by id or by the name the module advertises
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entrypoint {
    Id(i32),
    Name(String),
}

impl Entrypoint {
    /// Numeric text is an id, anything else a name
    pub fn parse(text: &str) -> Self {
        match text.parse::<i32>() {
            Ok(id) => Entrypoint::Id(id),
            Err(_) => Entrypoint::Name(text.to_string()),
        }
    }
}

impl Default for Entrypoint {
    fn default() -> Self {
        Entrypoint::Id(0)
    }
}

impl From<i32> for Entrypoint {
    fn from(id: i32) -> Self {
        Entrypoint::Id(id)
    }
}

impl From<&str> for Entrypoint {
    fn from(name: &str) -> Self {
        Entrypoint::Name(name.to_string())
    }
}

impl fmt::Display for Entrypoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entrypoint::Id(id) => write!(f, "#{id}"),
            Entrypoint::Name(name) => f.write_str(name),
        }
    }
}

/// The JSON array a policy evaluation produces; empty when no rule matched
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultSet(Vec<Value>);

impl ResultSet {
    pub fn from_json(text: &str) -> PolicyResult<Self> {
        match serde_json::from_str::<Value>(text)? {
            Value::Array(entries) => Ok(ResultSet(entries)),
            other => Err(PolicyError::MalformedResultError(format!(
                "expected an array, got {other}"
            ))),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn entries(&self) -> &[Value] {
        &self.0
    }

    /// The `result` member of each entry
    pub fn results(&self) -> impl Iterator<Item = &Value> {
        self.0.iter().filter_map(|entry| entry.get("result"))
    }

    pub fn into_inner(self) -> Vec<Value> {
        self.0
    }
}

impl fmt::Display for ResultSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(&self.0).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}

/// A policy instance: its own store, memory and data document
pub struct Policy {
    store: Store<HostState>,
    memory: Memory,
    guest: Arc<GuestExports>,
    abi: AbiVersion,
    entrypoints: BTreeMap<String, i32>,
    /// Address of the loaded data document
    data_addr: i32,
    /// Heap pointer right after instantiation; data is loaded here
    base_heap_ptr: i32,
    /// Heap pointer past the data document; each evaluation starts here
    data_heap_ptr: i32,
}

impl Policy {
    pub(crate) fn instantiate(
        engine: &Engine,
        module: &PolicyModule,
        builtins: Arc<Builtins>,
        memory_type: MemoryType,
    ) -> PolicyResult<Self> {
        let mut store = Store::new(engine, HostState::new(Arc::clone(&builtins)));
        let memory = Memory::new(&mut store, memory_type)?;
        store.data_mut().memory = Some(memory);

        let mut linker = Linker::new(engine);
        linker.define(&store, abi::IMPORT_MODULE, imports::MEMORY, memory)?;
        host::define_imports(&mut linker)?;
        let instance = linker.instantiate(&mut store, module.module())?;

        let guest = Arc::new(GuestExports::resolve(&instance, &mut store)?);
        store.data_mut().guest = Some(Arc::clone(&guest));

        // Builtin ids must be known before any evaluation can call one
        let table = guest.builtins.call(&mut store, ())?;
        let builtin_ids = id_table(host::dump_json(&mut store, table)?, exports::BUILTINS)?;
        for name in builtin_ids.keys().filter(|name| !builtins.contains(name)) {
            warn!(builtin = %name, "policy references a builtin the host does not provide");
        }
        store.data_mut().builtin_ids = builtin_ids
            .into_iter()
            .map(|(name, id)| (id, name))
            .collect();

        let entrypoints = match &guest.entrypoints {
            Some(entrypoints) => {
                let table = entrypoints.call(&mut store, ())?;
                id_table(host::dump_json(&mut store, table)?, exports::ENTRYPOINTS)?
            }
            None => BTreeMap::new(),
        };

        let data_addr = host::load_json(&mut store, b"{}")?;
        let base_heap_ptr = guest.heap_ptr_get.call(&mut store, ())?;

        debug!(
            abi = %module.info().abi,
            entrypoints = entrypoints.len(),
            base_heap_ptr,
            "instantiated policy"
        );

        Ok(Self {
            store,
            memory,
            guest,
            abi: module.info().abi,
            entrypoints,
            data_addr,
            base_heap_ptr,
            data_heap_ptr: base_heap_ptr,
        })
    }

    pub fn abi_version(&self) -> AbiVersion {
        self.abi
    }

    /// Entrypoint ids by name; empty for modules that do not advertise any
    pub fn entrypoints(&self) -> &BTreeMap<String, i32> {
        &self.entrypoints
    }

    /// Names of the builtins the policy calls
    pub fn required_builtins(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .store
            .data()
            .builtin_ids
            .values()
            .map(String::as_str)
            .collect();
        names.sort_unstable();
        names
    }

    /// Lines the policy printed through `opa_println` since the last call
    pub fn take_printed(&mut self) -> Vec<String> {
        std::mem::take(&mut self.store.data_mut().printed)
    }

    /// Replace the data document; the previous one is discarded
    pub fn set_data<D: Serialize + ?Sized>(&mut self, data: &D) -> PolicyResult<()> {
        let json = serde_json::to_vec(data)?;
        let guest = Arc::clone(&self.guest);

        guest.heap_ptr_set.call(&mut self.store, self.base_heap_ptr)?;
        self.data_addr = host::load_json(&mut self.store, &json)?;
        self.data_heap_ptr = guest.heap_ptr_get.call(&mut self.store, ())?;

        debug!(bytes = json.len(), data_heap_ptr = self.data_heap_ptr, "loaded data document");
        Ok(())
    }

    /// Evaluate the default entrypoint
    pub fn evaluate<I: Serialize + ?Sized>(&mut self, input: &I) -> PolicyResult<ResultSet> {
        self.evaluate_entrypoint(input, Entrypoint::default())
    }

    pub fn evaluate_entrypoint<I: Serialize + ?Sized>(
        &mut self,
        input: &I,
        entrypoint: impl Into<Entrypoint>,
    ) -> PolicyResult<ResultSet> {
        let entrypoint = self.resolve_entrypoint(entrypoint.into())?;
        let input = serde_json::to_vec(input)?;

        let text = match self.guest.opa_eval.clone() {
            Some(opa_eval) if self.abi.supports_fastpath_eval() => {
                debug!(entrypoint, input_len = input.len(), "evaluating via opa_eval");
                self.eval_fastpath(&opa_eval, entrypoint, &input)?
            }
            _ => {
                debug!(entrypoint, input_len = input.len(), "evaluating via eval context");
                self.eval_context(entrypoint, &input)?
            }
        };

        ResultSet::from_json(&text)
    }

    fn resolve_entrypoint(&self, entrypoint: Entrypoint) -> PolicyResult<i32> {
        match entrypoint {
            Entrypoint::Id(id)
                if self.entrypoints.is_empty() || self.entrypoints.values().any(|&v| v == id) =>
            {
                Ok(id)
            }
            Entrypoint::Name(name) => self
                .entrypoints
                .get(&name)
                .copied()
                .ok_or(PolicyError::UnknownEntrypointError(name)),
            other => Err(PolicyError::UnknownEntrypointError(other.to_string())),
        }
    }

    /// Single call evaluation: input text goes at the data heap pointer, the
    /// guest heap starts right after it
    fn eval_fastpath(
        &mut self,
        opa_eval: &wasmtime::TypedFunc<(i32, i32, i32, i32, i32, i32, i32), i32>,
        entrypoint: i32,
        input: &[u8],
    ) -> PolicyResult<String> {
        let input_addr = self.data_heap_ptr;
        let input_len = host::byte_len(input)?;
        let heap_ptr = input_addr.checked_add(input_len).ok_or_else(|| {
            PolicyError::MemoryError(format!("input of {input_len} bytes overflows the heap"))
        })?;
        host::write_bytes(self.memory, &mut self.store, input_addr, input)?;

        let result = opa_eval.call(
            &mut self.store,
            (
                0,
                entrypoint,
                self.data_addr,
                input_addr,
                input_len,
                heap_ptr,
                abi::RESULT_FORMAT_JSON,
            ),
        )?;
        if result == 0 {
            return Err(PolicyError::NullAddressError(exports::OPA_EVAL));
        }

        host::read_cstr(self.memory, &self.store, result)
    }

    /// Context API evaluation for modules below ABI 1.2
    fn eval_context(&mut self, entrypoint: i32, input: &[u8]) -> PolicyResult<String> {
        let guest = Arc::clone(&self.guest);
        let store = &mut self.store;

        guest.heap_ptr_set.call(&mut *store, self.data_heap_ptr)?;
        let input_addr = host::load_json(&mut *store, input)?;

        let ctx = guest.eval_ctx_new.call(&mut *store, ())?;
        guest.eval_ctx_set_input.call(&mut *store, (ctx, input_addr))?;
        guest.eval_ctx_set_data.call(&mut *store, (ctx, self.data_addr))?;
        match &guest.eval_ctx_set_entrypoint {
            Some(set_entrypoint) => set_entrypoint.call(&mut *store, (ctx, entrypoint))?,
            None if entrypoint != 0 => {
                return Err(PolicyError::UnknownEntrypointError(entrypoint.to_string()))
            }
            None => {}
        }

        let status = guest.eval.call(&mut *store, ctx)?;
        match EvalStatus::from_code(status) {
            Some(EvalStatus::Ok) => {}
            Some(status) => return Err(PolicyError::EvalError(status.name().to_string())),
            None => return Err(PolicyError::EvalError(format!("unknown status {status}"))),
        }

        let result = guest.eval_ctx_get_result.call(&mut *store, ctx)?;
        if result == 0 {
            return Err(PolicyError::NullAddressError(exports::OPA_EVAL_CTX_GET_RESULT));
        }
        host::dump_json_text(&mut *store, result)
    }
}

impl fmt::Debug for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Policy")
            .field("abi", &self.abi)
            .field("entrypoints", &self.entrypoints)
            .field("data_addr", &self.data_addr)
            .field("base_heap_ptr", &self.base_heap_ptr)
            .field("data_heap_ptr", &self.data_heap_ptr)
            .finish()
    }
}

/// `{"name": id, ...}` tables returned by `builtins()` and `entrypoints()`
fn id_table(value: Value, what: &str) -> PolicyResult<BTreeMap<String, i32>> {
    let Value::Object(entries) = value else {
        return Err(PolicyError::MalformedResultError(format!(
            "{what} table is not an object"
        )));
    };

    entries
        .into_iter()
        .map(|(name, id)| {
            let id = id
                .as_i64()
                .and_then(|id| i32::try_from(id).ok())
                .ok_or_else(|| {
                    PolicyError::MalformedResultError(format!("{what} id for {name} is {id}"))
                })?;
            Ok((name, id))
        })
        .collect()
}
