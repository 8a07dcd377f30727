//! Host builtins a policy can call by name

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use itertools::Itertools;
use serde_json::Value;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum BuiltinError {
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Expected {expected} arguments, got {actual}")]
    Arity { expected: usize, actual: usize },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

pub type BuiltinFn = dyn Fn(&[Value]) -> Result<Value, BuiltinError> + Send + Sync;

/// Registry of host builtins, keyed by the name the policy references
#[derive(Clone)]
pub struct Builtins {
    functions: HashMap<String, Arc<BuiltinFn>>,
}

impl Builtins {
    /// A registry with no builtins at all
    pub fn empty() -> Self {
        Self {
            functions: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, name: impl Into<String>, function: F) -> &mut Self
    where
        F: Fn(&[Value]) -> Result<Value, BuiltinError> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(function));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str).sorted()
    }

    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value, BuiltinError> {
        let function = self
            .functions
            .get(name)
            .ok_or_else(|| BuiltinError::NotImplemented(name.to_string()))?;
        function(args)
    }
}

impl Default for Builtins {
    /// The builtins OPA leaves to the host that need no external state
    fn default() -> Self {
        let mut builtins = Self::empty();
        builtins
            .register("json.is_valid", json_is_valid)
            .register("time.now_ns", time_now_ns)
            .register("sprintf", sprintf)
            .register("trace", trace);
        builtins
    }
}

impl fmt::Debug for Builtins {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.names()).finish()
    }
}

fn expect_args(args: &[Value], expected: usize) -> Result<(), BuiltinError> {
    if args.len() != expected {
        return Err(BuiltinError::Arity {
            expected,
            actual: args.len(),
        });
    }
    Ok(())
}

fn json_is_valid(args: &[Value]) -> Result<Value, BuiltinError> {
    expect_args(args, 1)?;
    let valid = match &args[0] {
        Value::String(text) => serde_json::from_str::<Value>(text).is_ok(),
        _ => false,
    };
    Ok(Value::Bool(valid))
}

fn time_now_ns(args: &[Value]) -> Result<Value, BuiltinError> {
    expect_args(args, 0)?;
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .map(Value::from)
        .ok_or_else(|| BuiltinError::InvalidArgument("clock outside the i64 nanosecond range".into()))
}

fn trace(args: &[Value]) -> Result<Value, BuiltinError> {
    expect_args(args, 1)?;
    match &args[0] {
        Value::String(note) => info!(target: "opa_trace", "{note}"),
        other => info!(target: "opa_trace", "{other}"),
    }
    Ok(Value::Bool(true))
}

/// `sprintf(format, values)` with the `%v`, `%s`, `%d` and `%%` verbs; other verbs
/// consume a value and render as `%!<verb>(<value>)`
fn sprintf(args: &[Value]) -> Result<Value, BuiltinError> {
    expect_args(args, 2)?;
    let Value::String(format) = &args[0] else {
        return Err(BuiltinError::InvalidArgument("format must be a string".into()));
    };
    let Value::Array(values) = &args[1] else {
        return Err(BuiltinError::InvalidArgument("values must be an array".into()));
    };

    let mut out = String::with_capacity(format.len());
    let mut values = values.iter();
    let mut chars = format.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some(verb) => match values.next() {
                Some(value) => format_verb(&mut out, verb, value),
                None => out.push_str(&format!("%!{verb}(MISSING)")),
            },
            None => out.push_str("%!(NOVERB)"),
        }
    }

    Ok(Value::String(out))
}

fn format_verb(out: &mut String, verb: char, value: &Value) {
    match (verb, value) {
        ('v' | 's', Value::String(s)) => out.push_str(s),
        ('v' | 's', other) => out.push_str(&other.to_string()),
        ('d', Value::Number(n)) => match n.as_i64() {
            Some(i) => out.push_str(&i.to_string()),
            None => out.push_str(&format!("%!d({n})")),
        },
        (_, other) => out.push_str(&format!("%!{verb}({other})")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_registered() {
        let builtins = Builtins::default();
        assert_eq!(
            builtins.names().collect::<Vec<_>>(),
            vec!["json.is_valid", "sprintf", "time.now_ns", "trace"]
        );
    }

    #[test]
    fn test_missing_builtin_is_not_implemented() {
        let err = Builtins::empty().call("custom.echo", &[]).unwrap_err();
        assert_eq!(err.to_string(), "Not implemented: custom.echo");
    }

    #[test]
    fn test_custom_builtin_overrides_default() {
        let mut builtins = Builtins::default();
        builtins.register("json.is_valid", |_args: &[Value]| Ok(json!("overridden")));
        assert_eq!(builtins.call("json.is_valid", &[]).unwrap(), json!("overridden"));
    }

    #[test]
    fn test_json_is_valid() {
        let builtins = Builtins::default();
        assert_eq!(builtins.call("json.is_valid", &[json!("{\"a\": 1}")]).unwrap(), json!(true));
        assert_eq!(builtins.call("json.is_valid", &[json!("{nope")]).unwrap(), json!(false));
        assert_eq!(builtins.call("json.is_valid", &[json!(3)]).unwrap(), json!(false));
        assert!(matches!(
            builtins.call("json.is_valid", &[]),
            Err(BuiltinError::Arity { expected: 1, actual: 0 })
        ));
    }

    #[test]
    fn test_sprintf() {
        let builtins = Builtins::default();
        let out = builtins
            .call(
                "sprintf",
                &[json!("%s is %d (%v) 100%%"), json!(["Štěpán", 42, {"role": "admin"}])],
            )
            .unwrap();
        assert_eq!(out, json!("Štěpán is 42 ({\"role\":\"admin\"}) 100%"));

        let out = builtins.call("sprintf", &[json!("%v and %v"), json!(["x"])]).unwrap();
        assert_eq!(out, json!("x and %!v(MISSING)"));
    }

    #[test]
    fn test_sprintf_unknown_verb_is_inlined() {
        let builtins = Builtins::default();
        let out = builtins
            .call("sprintf", &[json!("%q then %s"), json!(["a", "b"])])
            .unwrap();
        assert_eq!(out, json!("%!q(\"a\") then b"));

        let out = builtins.call("sprintf", &[json!("%x"), json!([])]).unwrap();
        assert_eq!(out, json!("%!x(MISSING)"));
    }

    #[test]
    fn test_time_now_ns_is_positive() {
        let now = Builtins::default().call("time.now_ns", &[]).unwrap();
        assert!(now.as_i64().unwrap() > 0);
    }
}
