//! Stateful SQL functions backed by a [`FuncContext`].
//!
//! Every function is called with the SQL arguments followed by the
//! partition key string, which selects the state slot. Accumulators
//! additionally receive a `valid` boolean just before the key.

use std::collections::HashMap;

use crate::context::FuncContext;
use crate::errors::invalid_arg;
use crate::errors::StateError;
use crate::errors::StateResult;
use crate::value::Value;

pub mod acc;
pub mod analytic;
pub mod ring_queue;

/// Run a function against its call-site's state.
pub type ExecFn = fn(&FuncContext, &[Value]) -> StateResult<Value>;

/// Check the number of SQL arguments at plan time.
pub type ValidateFn = fn(usize) -> StateResult<()>;

#[derive(Debug, Clone, Copy)]
pub struct BuiltinFunc {
    pub exec: ExecFn,
    pub validate: ValidateFn,
}

/// Name to function lookup.
#[derive(Debug, Clone, Default)]
pub struct FunctionRegistry {
    funcs: HashMap<String, BuiltinFunc>,
}

impl FunctionRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every builtin stateful function.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        analytic::register(&mut registry);
        acc::register(&mut registry);
        registry
    }

    /// Register `func` under `name`, replacing any previous entry.
    pub fn register(&mut self, name: impl Into<String>, func: BuiltinFunc) {
        let name = name.into();
        if self.funcs.insert(name.clone(), func).is_some() {
            tracing::debug!("Function {name} re-registered");
        }
    }

    pub fn get(&self, name: &str) -> Option<&BuiltinFunc> {
        self.funcs.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.funcs.keys().map(String::as_str)
    }

    pub fn validate(&self, name: &str, arity: usize) -> StateResult<()> {
        let func = self.lookup(name)?;
        (func.validate)(arity)
    }

    pub fn exec(&self, name: &str, ctx: &FuncContext, args: &[Value]) -> StateResult<Value> {
        let func = self.lookup(name)?;
        (func.exec)(ctx, args)
    }

    fn lookup(&self, name: &str) -> StateResult<&BuiltinFunc> {
        self.funcs
            .get(name)
            .ok_or_else(|| StateError::UnknownFunction(name.to_owned()))
    }
}

/// Split off the trailing partition key.
#[track_caller]
pub(crate) fn split_key(args: &[Value]) -> StateResult<(&str, &[Value])> {
    match args.split_last() {
        Some((Value::String(key), rest)) => Ok((key, rest)),
        Some((other, _)) => Err(invalid_arg(format!(
            "the partition key should be a string, got {}",
            other.kind()
        ))),
        None => Err(invalid_arg("missing partition key")),
    }
}

#[track_caller]
pub(crate) fn bool_arg(value: &Value, name: &str) -> StateResult<bool> {
    value
        .as_bool()
        .ok_or_else(|| invalid_arg(format!("{name} should be boolean")))
}

#[track_caller]
pub(crate) fn arity_between(arity: usize, min: usize, max: usize) -> StateResult<()> {
    if arity < min || arity > max {
        if min == max {
            Err(invalid_arg(format!("expect {min} arguments but found {arity}")))
        } else {
            Err(invalid_arg(format!(
                "expect {min} to {max} arguments but found {arity}"
            )))
        }
    } else {
        Ok(())
    }
}

#[test]
fn builtins_are_registered() {
    let registry = FunctionRegistry::with_builtins();
    for name in [
        "lag",
        "latest",
        "changed_col",
        "had_changed",
        "acc_sum",
        "acc_min",
        "acc_max",
        "acc_avg",
        "acc_count",
    ] {
        assert!(registry.get(name).is_some(), "{name} missing");
    }
    assert!(matches!(
        registry.validate("nope", 1),
        Err(StateError::UnknownFunction(_))
    ));
}

#[test]
fn validate_checks_arity() {
    let registry = FunctionRegistry::with_builtins();
    assert!(registry.validate("lag", 1).is_ok());
    assert!(registry.validate("lag", 4).is_ok());
    assert!(registry.validate("lag", 5).is_err());
    assert!(registry.validate("latest", 0).is_err());
    assert!(registry.validate("changed_col", 2).is_ok());
    assert!(registry.validate("changed_col", 3).is_err());
    assert!(registry.validate("had_changed", 1).is_err());
    assert!(registry.validate("had_changed", 5).is_ok());
    assert!(registry.validate("acc_sum", 1).is_ok());
    assert!(registry.validate("acc_sum", 2).is_err());
    assert!(registry.validate("acc_sum", 3).is_ok());
}

#[test]
fn key_must_be_a_string() {
    assert!(split_key(&[Value::from(1), Value::from(2)]).is_err());
    assert!(split_key(&[]).is_err());
    let args = [Value::from(1), Value::from("k")];
    let (key, rest) = split_key(&args).expect("key is a string");
    assert_eq!(key, "k");
    assert_eq!(rest, &[Value::from(1)]);
}
