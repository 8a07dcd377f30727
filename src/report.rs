//! Evaluate-and-report: one evaluation, one report line

use std::fmt;
use std::io::{self, Write};

use serde::Serialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::loader::{PolicyError, PolicyResult};
use crate::policy::{Entrypoint, Policy, ResultSet};

/// What a single evaluation amounted to
#[derive(Debug)]
pub enum Outcome {
    /// No result set was produced
    Error(PolicyError),
    /// A result set with no entries: no rule matched
    Undefined,
    Defined(ResultSet),
}

/// Shape of an [`Outcome`], for comparing evaluations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Error,
    Undefined,
    Defined,
}

impl Outcome {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Outcome::Error(_) => OutcomeKind::Error,
            Outcome::Undefined => OutcomeKind::Undefined,
            Outcome::Defined(_) => OutcomeKind::Defined,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Outcome::Error(_))
    }
}

impl From<PolicyResult<ResultSet>> for Outcome {
    fn from(result: PolicyResult<ResultSet>) -> Self {
        match result {
            Err(err) => Outcome::Error(err),
            Ok(results) if results.is_empty() => Outcome::Undefined,
            Ok(results) => Outcome::Defined(results),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Error(_) => f.write_str("evaluation error"),
            Outcome::Undefined => f.write_str("undefined"),
            Outcome::Defined(results) => write!(f, "result: {results}"),
        }
    }
}

/// The three inputs the smoke test runs: plain ASCII, non-ASCII, and a lone backslash
pub fn smoke_inputs() -> Vec<Value> {
    vec![
        json!({"role": "admin", "name": "Doe"}),
        json!({"role": "admin", "name": "Štěpán"}),
        json!({"role": "admin", "name": "\\"}),
    ]
}

/// Evaluate `input` and write its report lines
///
/// `input: <json>` and a defined or undefined outcome go to `out`; an
/// evaluation error goes to `err`. The evaluation error is returned inside the
/// [`Outcome`], only write failures are returned as `Err`.
pub fn evaluate_and_report<I, O, E>(
    policy: &mut Policy,
    input: &I,
    entrypoint: Entrypoint,
    out: &mut O,
    err: &mut E,
) -> io::Result<Outcome>
where
    I: Serialize + ?Sized,
    O: Write,
    E: Write,
{
    match serde_json::to_string(input) {
        Ok(json) => writeln!(out, "input: {json}")?,
        Err(e) => writeln!(out, "input: <unserializable: {e}>")?,
    }

    let outcome = Outcome::from(policy.evaluate_entrypoint(input, entrypoint));
    match &outcome {
        Outcome::Error(e) => {
            warn!(error = %e, "policy evaluation failed");
            writeln!(err, "{outcome}")?;
        }
        _ => writeln!(out, "{outcome}")?,
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::PolicyLoader;
    use crate::wasm::codegen::StubPolicyCodeGen;

    fn stub_policy() -> Policy {
        let wasm_bytes = StubPolicyCodeGen::new().generate().unwrap();
        PolicyLoader::new().load(wasm_bytes).unwrap()
    }

    fn report(policy: &mut Policy, input: &Value, entrypoint: &str) -> (Outcome, String, String) {
        let mut out = Vec::new();
        let mut err = Vec::new();
        let outcome =
            evaluate_and_report(policy, input, Entrypoint::from(entrypoint), &mut out, &mut err)
                .unwrap();
        (
            outcome,
            String::from_utf8(out).unwrap(),
            String::from_utf8(err).unwrap(),
        )
    }

    #[test]
    fn test_defined_report() {
        let mut policy = stub_policy();
        let (outcome, out, err) = report(&mut policy, &smoke_inputs()[0], "stub/echo");

        assert_eq!(outcome.kind(), OutcomeKind::Defined);
        assert_eq!(
            out,
            "input: {\"name\":\"Doe\",\"role\":\"admin\"}\n\
             result: [{\"result\":{\"name\":\"Doe\",\"role\":\"admin\"}}]\n"
        );
        assert!(err.is_empty());
    }

    #[test]
    fn test_undefined_report() {
        let mut policy = stub_policy();
        let (outcome, out, _) = report(&mut policy, &smoke_inputs()[1], "stub/undefined");

        assert_eq!(outcome.kind(), OutcomeKind::Undefined);
        assert!(out.ends_with("\nundefined\n"));
    }

    #[test]
    fn test_error_goes_to_error_stream() {
        let mut policy = stub_policy();
        let (outcome, out, err) = report(&mut policy, &smoke_inputs()[2], "stub/abort");

        assert!(outcome.is_error());
        assert_eq!(out, "input: {\"name\":\"\\\\\",\"role\":\"admin\"}\n");
        assert_eq!(err, "evaluation error\n");
    }

    #[test]
    fn test_eval_status_is_reported_as_error() {
        for minor in [1, 2] {
            let wasm_bytes = StubPolicyCodeGen::new().with_abi_minor(minor).generate().unwrap();
            let mut policy = PolicyLoader::new().load(wasm_bytes).unwrap();

            let (outcome, _, err) = report(&mut policy, &smoke_inputs()[0], "stub/status");
            assert!(outcome.is_error());
            assert_eq!(err, "evaluation error\n");

            let (outcome, _, _) = report(&mut policy, &smoke_inputs()[0], "stub/echo");
            assert_eq!(outcome.kind(), OutcomeKind::Defined);
        }
    }

    #[test]
    fn test_smoke_inputs_are_independent() {
        let mut policy = stub_policy();
        let kinds: Vec<_> = smoke_inputs()
            .iter()
            .map(|input| report(&mut policy, input, "stub/echo").0.kind())
            .collect();
        assert_eq!(kinds, vec![OutcomeKind::Defined; 3]);

        let (_, out, _) = report(&mut policy, &smoke_inputs()[1], "stub/echo");
        assert!(out.contains("result: [{\"result\":{\"name\":\"Štěpán\",\"role\":\"admin\"}}]"));
    }

    #[test]
    fn test_outcome_from_result() {
        assert_eq!(
            Outcome::from(Ok(ResultSet::default())).kind(),
            OutcomeKind::Undefined
        );
        let outcome = Outcome::from(Err(PolicyError::EvalError("ERR".into())));
        assert_eq!(outcome.to_string(), "evaluation error");
    }
}
