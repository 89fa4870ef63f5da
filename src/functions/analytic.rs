//! Analytic functions comparing the current row with earlier rows of
//! the same partition.

use super::arity_between;
use super::bool_arg;
use super::split_key;
use super::BuiltinFunc;
use super::FunctionRegistry;
use crate::context::FuncContext;
use crate::errors::invalid_arg;
use crate::errors::StateError;
use crate::errors::StateResult;
use crate::functions::ring_queue::RingQueue;
use crate::state::StateValue;
use crate::value::Value;

/// Largest history `lag` keeps per partition.
pub const MAX_LAG_SIZE: usize = 1 << 16;

fn type_error(key: &str, expected: &'static str, found: &StateValue) -> StateError {
    StateError::Type {
        key: key.to_owned(),
        expected,
        found: found.kind(),
    }
}

/// The value stored by [`latest`] or [`changed_col`] at `key`, if any.
fn stored_value<'a>(key: &str, current: Option<&'a StateValue>) -> StateResult<Option<&'a Value>> {
    match current {
        None => Ok(None),
        Some(StateValue::Value(v)) => Ok(Some(v)),
        Some(other) => Err(type_error(key, "a value", other)),
    }
}

/// `lag(value [, size [, default [, ignore_null]]], key)`
///
/// Returns the value seen `size` rows ago (default 1), or `default`
/// until that many rows have been seen. With `ignore_null`, null rows
/// neither enter the history nor advance it.
fn lag(ctx: &FuncContext, args: &[Value]) -> StateResult<Value> {
    let (key, rest) = split_key(args)?;
    arity_between(rest.len(), 1, 4)?;
    let value = &rest[0];
    let size = match rest.get(1) {
        None => 1,
        Some(size) => size
            .as_i64()
            .and_then(|size| usize::try_from(size).ok())
            .filter(|size| *size <= MAX_LAG_SIZE)
            .ok_or_else(|| {
                invalid_arg(format!(
                    "invalid lag size {size}, must be between 0 and {MAX_LAG_SIZE}"
                ))
            })?,
    };
    let default = rest.get(2).cloned().unwrap_or_default();
    let ignore_null = match rest.get(3) {
        None => false,
        Some(flag) => bool_arg(flag, "ignore_null")?,
    };

    ctx.update_state(key, |current| {
        let mut queue = match current {
            Some(StateValue::Ring(queue)) => queue.clone(),
            Some(other) => return Err(type_error(key, "a ring queue", other)),
            None => {
                let mut queue = RingQueue::new(size);
                queue.fill(default.clone());
                queue
            }
        };
        if ignore_null && value.is_null() {
            let out = queue.peek().cloned().unwrap_or_default();
            return Ok((out, None));
        }
        let out = queue.fetch().unwrap_or_default();
        queue.append(value.clone());
        Ok((out, Some(StateValue::Ring(queue))))
    })
}

/// `latest(value [, default], key)`
///
/// The most recent non-null value of the partition, or `default`.
fn latest(ctx: &FuncContext, args: &[Value]) -> StateResult<Value> {
    let (key, rest) = split_key(args)?;
    arity_between(rest.len(), 1, 2)?;
    let value = &rest[0];

    ctx.update_state(key, |current| {
        if !value.is_null() {
            return Ok((value.clone(), Some(StateValue::Value(value.clone()))));
        }
        let out = match stored_value(key, current)? {
            Some(stored) => stored.clone(),
            None => rest.get(1).cloned().unwrap_or_default(),
        };
        Ok((out, None))
    })
}

/// Store `value` at `key` if it differs from what is there, returning
/// whether it did. Nothing stored compares equal to null.
fn swap_if_changed(ctx: &FuncContext, key: &str, value: &Value) -> StateResult<bool> {
    ctx.update_state(key, |current| {
        let unchanged = match stored_value(key, current)? {
            Some(stored) => stored == value,
            None => value.is_null(),
        };
        if unchanged {
            Ok((false, None))
        } else {
            Ok((true, Some(StateValue::Value(value.clone()))))
        }
    })
}

/// `changed_col(ignore_null, value, key)`
///
/// `value` if it differs from the previous row's, null otherwise.
fn changed_col(ctx: &FuncContext, args: &[Value]) -> StateResult<Value> {
    let (key, rest) = split_key(args)?;
    let [ignore_null, value] = rest else {
        return Err(invalid_arg(format!(
            "expect 2 arguments but found {}",
            rest.len()
        )));
    };
    let ignore_null = bool_arg(ignore_null, "ignore_null")?;
    if ignore_null && value.is_null() {
        return Ok(Value::Null);
    }
    if swap_if_changed(ctx, key, value)? {
        Ok(value.clone())
    } else {
        Ok(Value::Null)
    }
}

/// `had_changed(ignore_null, v1, ..., vn, key)`
///
/// Whether any of the values differs from the same position in the
/// previous row. Each position is tracked separately.
fn had_changed(ctx: &FuncContext, args: &[Value]) -> StateResult<Value> {
    let (key, rest) = split_key(args)?;
    let Some((ignore_null, values)) = rest.split_first() else {
        return Err(invalid_arg("expect at least 2 arguments but found 0"));
    };
    if values.is_empty() {
        return Err(invalid_arg("expect at least 2 arguments but found 1"));
    }
    let ignore_null = bool_arg(ignore_null, "ignore_null")?;

    let mut changed = false;
    for (i, value) in values.iter().enumerate() {
        if ignore_null && value.is_null() {
            continue;
        }
        // Every position is compared and updated, even after a change
        // has been found.
        changed |= swap_if_changed(ctx, &format!("{key}{}", i + 1), value)?;
    }
    Ok(Value::Bool(changed))
}

pub(crate) fn register(registry: &mut FunctionRegistry) {
    registry.register(
        "lag",
        BuiltinFunc {
            exec: lag,
            validate: |arity| arity_between(arity, 1, 4),
        },
    );
    registry.register(
        "latest",
        BuiltinFunc {
            exec: latest,
            validate: |arity| arity_between(arity, 1, 2),
        },
    );
    registry.register(
        "changed_col",
        BuiltinFunc {
            exec: changed_col,
            validate: |arity| arity_between(arity, 2, 2),
        },
    );
    registry.register(
        "had_changed",
        BuiltinFunc {
            exec: had_changed,
            validate: |arity| arity_between(arity, 2, usize::MAX),
        },
    );
}

#[cfg(test)]
fn call(
    f: fn(&FuncContext, &[Value]) -> StateResult<Value>,
    ctx: &FuncContext,
    args: &[Value],
    key: &str,
) -> StateResult<Value> {
    let mut args = args.to_vec();
    args.push(Value::from(key));
    f(ctx, &args)
}

#[test]
fn lag_returns_previous_row() -> StateResult<()> {
    let ctx = crate::context::test_func_ctx();
    let mut found = Vec::new();
    for v in [1, 2, 3] {
        found.push(call(lag, &ctx, &[Value::from(v)], "self")?);
    }
    assert_eq!(found, vec![Value::Null, Value::from(1), Value::from(2)]);
    Ok(())
}

#[test]
fn lag_with_size_and_default() -> StateResult<()> {
    let ctx = crate::context::test_func_ctx();
    let mut found = Vec::new();
    for v in [1, 2, 3, 4] {
        found.push(call(
            lag,
            &ctx,
            &[Value::from(v), Value::from(2), Value::from(0)],
            "self",
        )?);
    }
    assert_eq!(
        found,
        vec![Value::from(0), Value::from(0), Value::from(1), Value::from(2)]
    );
    Ok(())
}

#[test]
fn lag_partitions_are_independent() -> StateResult<()> {
    let ctx = crate::context::test_func_ctx();
    call(lag, &ctx, &[Value::from("a1")], "a")?;
    call(lag, &ctx, &[Value::from("b1")], "b")?;
    assert_eq!(call(lag, &ctx, &[Value::from("a2")], "a")?, Value::from("a1"));
    assert_eq!(call(lag, &ctx, &[Value::from("b2")], "b")?, Value::from("b1"));
    Ok(())
}

#[test]
fn lag_ignore_null_does_not_advance() -> StateResult<()> {
    let ctx = crate::context::test_func_ctx();
    let args = |v: Value| [v, Value::from(1), Value::Null, Value::Bool(true)];
    assert_eq!(call(lag, &ctx, &args(Value::from(1)), "self")?, Value::Null);
    assert_eq!(call(lag, &ctx, &args(Value::Null), "self")?, Value::from(1));
    assert_eq!(call(lag, &ctx, &args(Value::Null), "self")?, Value::from(1));
    assert_eq!(call(lag, &ctx, &args(Value::from(2)), "self")?, Value::from(1));
    assert_eq!(call(lag, &ctx, &args(Value::from(3)), "self")?, Value::from(2));
    Ok(())
}

#[test]
fn lag_rejects_bad_sizes() {
    let ctx = crate::context::test_func_ctx();
    let too_big = Value::Int(MAX_LAG_SIZE as i64 + 1);
    for size in [
        Value::from(-1),
        Value::from(1.5),
        Value::from("2"),
        too_big,
        Value::Int(1_000_000_000_000),
    ] {
        let res = call(lag, &ctx, &[Value::from(1), size], "self");
        assert!(matches!(res, Err(StateError::InvalidArg(_))));
    }
}

#[test]
fn lag_size_zero_is_always_null() -> StateResult<()> {
    let ctx = crate::context::test_func_ctx();
    for v in [1, 2] {
        let found = call(lag, &ctx, &[Value::from(v), Value::from(0)], "self")?;
        assert_eq!(found, Value::Null);
    }
    Ok(())
}

#[test]
fn latest_keeps_last_non_null() -> StateResult<()> {
    let ctx = crate::context::test_func_ctx();
    assert_eq!(
        call(latest, &ctx, &[Value::Null, Value::from("d")], "self")?,
        Value::from("d")
    );
    assert_eq!(call(latest, &ctx, &[Value::Null], "self")?, Value::Null);
    assert_eq!(call(latest, &ctx, &[Value::from(1)], "self")?, Value::from(1));
    assert_eq!(
        call(latest, &ctx, &[Value::Null, Value::from("d")], "self")?,
        Value::from(1)
    );
    Ok(())
}

#[test]
fn changed_col_reports_changes_only() -> StateResult<()> {
    let ctx = crate::context::test_func_ctx();
    let mut found = Vec::new();
    for v in [Value::from(1), Value::from(1), Value::Null, Value::from(2)] {
        found.push(call(changed_col, &ctx, &[Value::Bool(true), v], "self")?);
    }
    assert_eq!(found, vec![Value::from(1), Value::Null, Value::Null, Value::from(2)]);

    // Without ignore_null a null after a value is a change, but null
    // on a fresh key is not.
    assert_eq!(
        call(changed_col, &ctx, &[Value::Bool(false), Value::Null], "other")?,
        Value::Null
    );
    assert_eq!(
        call(changed_col, &ctx, &[Value::Bool(false), Value::from(2)], "self")?,
        Value::Null
    );
    call(changed_col, &ctx, &[Value::Bool(false), Value::Null], "self")?;
    assert_eq!(
        ctx.get_state("self")?,
        Some(StateValue::Value(Value::Null))
    );
    Ok(())
}

#[test]
fn changed_col_compares_deeply() -> StateResult<()> {
    let ctx = crate::context::test_func_ctx();
    let arr = || Value::from(vec![Value::from(1), Value::from("a")]);
    assert_eq!(
        call(changed_col, &ctx, &[Value::Bool(true), arr()], "self")?,
        arr()
    );
    assert_eq!(
        call(changed_col, &ctx, &[Value::Bool(true), arr()], "self")?,
        Value::Null
    );
    Ok(())
}

#[test]
fn had_changed_tracks_each_position() -> StateResult<()> {
    let ctx = crate::context::test_func_ctx();
    let run = |a: Value, b: Value| call(had_changed, &ctx, &[Value::Bool(true), a, b], "self");

    assert_eq!(run(Value::from(1), Value::from("x"))?, Value::Bool(true));
    assert_eq!(run(Value::from(1), Value::from("x"))?, Value::Bool(false));
    assert_eq!(run(Value::Null, Value::from("x"))?, Value::Bool(false));
    assert_eq!(run(Value::from(1), Value::from("y"))?, Value::Bool(true));
    assert_eq!(ctx.get_state("self1")?, Some(StateValue::Value(Value::from(1))));
    assert_eq!(ctx.get_state("self2")?, Some(StateValue::Value(Value::from("y"))));
    Ok(())
}

#[test]
fn ignore_null_must_be_bool() {
    let ctx = crate::context::test_func_ctx();
    let res = call(changed_col, &ctx, &[Value::from(1), Value::from(1)], "self");
    assert!(matches!(res, Err(StateError::InvalidArg(_))));
    let res = call(had_changed, &ctx, &[Value::from("no"), Value::from(1)], "self");
    assert!(matches!(res, Err(StateError::InvalidArg(_))));
}

#[test]
fn wrong_state_kind_is_a_type_error() -> StateResult<()> {
    let ctx = crate::context::test_func_ctx();
    ctx.incr_counter("self", 1)?;
    assert!(matches!(
        call(lag, &ctx, &[Value::from(1)], "self"),
        Err(StateError::Type { .. })
    ));
    assert!(matches!(
        call(latest, &ctx, &[Value::Null], "self"),
        Err(StateError::Type { .. })
    ));
    Ok(())
}
