//! Running aggregates over a partition with optional begin/reset
//! gating.
//!
//! Called as `acc_x(value, valid, key)` the aggregate folds every
//! valid row. Called as `acc_x(value, on_begin, on_reset, valid, key)`
//! it only folds between a row with `on_begin` and the next row with
//! `on_reset`, starting from empty on every begin.

use serde::Deserialize;
use serde::Serialize;

use super::arity_between;
use super::bool_arg;
use super::split_key;
use super::BuiltinFunc;
use super::FunctionRegistry;
use crate::context::FuncContext;
use crate::errors::invalid_arg;
use crate::errors::StateError;
use crate::errors::StateResult;
use crate::state::StateValue;
use crate::value::float_repr;
use crate::value::Value;

/// Persisted progress of one accumulator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccumulatorStatus {
    /// [`None`] until the first value is folded (or, for counts,
    /// until the first reset).
    pub value: Option<AccValue>,
    /// Whether the gated form is between a begin and a reset.
    pub has_begun: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum AccValue {
    Count(i64),
    Sum(#[serde(with = "float_repr")] f64),
    Min(#[serde(with = "float_repr")] f64),
    Max(#[serde(with = "float_repr")] f64),
    Avg {
        #[serde(with = "float_repr")]
        sum: f64,
        count: i64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccKind {
    Sum,
    Min,
    Max,
    Avg,
    Count,
}

impl AccKind {
    pub fn name(self) -> &'static str {
        match self {
            AccKind::Sum => "acc_sum",
            AccKind::Min => "acc_min",
            AccKind::Max => "acc_max",
            AccKind::Avg => "acc_avg",
            AccKind::Count => "acc_count",
        }
    }

    fn reset(self, status: &mut AccumulatorStatus) {
        status.value = match self {
            AccKind::Count => Some(AccValue::Count(0)),
            _ => None,
        };
    }

    fn fold(self, key: &str, status: &mut AccumulatorStatus, value: &Value) -> StateResult<()> {
        if value.is_null() {
            return Ok(());
        }
        let number = || {
            value
                .as_f64()
                .ok_or_else(|| invalid_arg(format!("the value should be number, got {}", value.kind())))
        };
        status.value = Some(match (self, status.value) {
            (AccKind::Count, None) => AccValue::Count(1),
            (AccKind::Count, Some(AccValue::Count(n))) => AccValue::Count(n + 1),
            (AccKind::Sum, None) => AccValue::Sum(number()?),
            (AccKind::Sum, Some(AccValue::Sum(s))) => AccValue::Sum(s + number()?),
            (AccKind::Min, None) => AccValue::Min(f64::INFINITY.min(number()?)),
            (AccKind::Min, Some(AccValue::Min(m))) => AccValue::Min(m.min(number()?)),
            (AccKind::Max, None) => AccValue::Max(f64::NEG_INFINITY.max(number()?)),
            (AccKind::Max, Some(AccValue::Max(m))) => AccValue::Max(m.max(number()?)),
            (AccKind::Avg, None) => AccValue::Avg {
                sum: number()?,
                count: 1,
            },
            (AccKind::Avg, Some(AccValue::Avg { sum, count })) => AccValue::Avg {
                sum: sum + number()?,
                count: count + 1,
            },
            (kind, Some(other)) => return Err(mismatch(key, kind, other)),
        });
        Ok(())
    }

    /// Current result. No data yet reads as zero.
    fn output(self, status: &AccumulatorStatus) -> Value {
        match status.value {
            None if self == AccKind::Count => Value::Int(0),
            None => Value::Float(0.0),
            Some(AccValue::Count(n)) => Value::Int(n),
            Some(AccValue::Sum(x) | AccValue::Min(x) | AccValue::Max(x)) => Value::Float(x),
            Some(AccValue::Avg { count: 0, .. }) => Value::Float(0.0),
            Some(AccValue::Avg { sum, count }) => Value::Float(sum / count as f64),
        }
    }

    fn exec(self, ctx: &FuncContext, args: &[Value]) -> StateResult<Value> {
        let (key, rest) = split_key(args)?;
        let (valid, rest) = match rest.split_last() {
            Some((valid, rest)) => (bool_arg(valid, "validData")?, rest),
            None => return Err(invalid_arg("missing validData")),
        };
        let (value, gates) = match rest {
            [value] => (value, None),
            [value, on_begin, on_reset] => (
                value,
                Some((
                    bool_arg(on_begin, "onBegin")?,
                    bool_arg(on_reset, "onReset")?,
                )),
            ),
            _ => {
                return Err(invalid_arg(format!(
                    "{} expects 1 or 3 arguments but found {}",
                    self.name(),
                    rest.len()
                )))
            }
        };

        ctx.update_state(key, |current| {
            let mut status = match current {
                None => AccumulatorStatus::default(),
                Some(StateValue::Acc(status)) => status.clone(),
                Some(other) => {
                    return Err(StateError::Type {
                        key: key.to_owned(),
                        expected: "an accumulator",
                        found: other.kind(),
                    })
                }
            };
            match gates {
                None => {
                    if status.value.is_none() {
                        self.reset(&mut status);
                    }
                    if valid {
                        self.fold(key, &mut status, value)?;
                    }
                }
                Some((on_begin, on_reset)) => {
                    if !status.has_begun {
                        self.reset(&mut status);
                    }
                    if on_begin && !status.has_begun {
                        self.reset(&mut status);
                        status.has_begun = true;
                    }
                    if status.has_begun && valid {
                        self.fold(key, &mut status, value)?;
                    }
                    if on_reset {
                        status.has_begun = false;
                    }
                }
            }
            let out = self.output(&status);
            Ok((out, Some(StateValue::Acc(status))))
        })
    }
}

fn mismatch(key: &str, kind: AccKind, found: AccValue) -> StateError {
    StateError::Type {
        key: key.to_owned(),
        expected: kind.name(),
        found: format!("{found:?}"),
    }
}

fn validate(arity: usize) -> StateResult<()> {
    arity_between(arity, 1, 3)?;
    if arity == 2 {
        return Err(invalid_arg("expect 1 or 3 arguments but found 2"));
    }
    Ok(())
}

fn acc_sum(ctx: &FuncContext, args: &[Value]) -> StateResult<Value> {
    AccKind::Sum.exec(ctx, args)
}

fn acc_min(ctx: &FuncContext, args: &[Value]) -> StateResult<Value> {
    AccKind::Min.exec(ctx, args)
}

fn acc_max(ctx: &FuncContext, args: &[Value]) -> StateResult<Value> {
    AccKind::Max.exec(ctx, args)
}

fn acc_avg(ctx: &FuncContext, args: &[Value]) -> StateResult<Value> {
    AccKind::Avg.exec(ctx, args)
}

fn acc_count(ctx: &FuncContext, args: &[Value]) -> StateResult<Value> {
    AccKind::Count.exec(ctx, args)
}

pub(crate) fn register(registry: &mut FunctionRegistry) {
    let funcs: [(&str, super::ExecFn); 5] = [
        (AccKind::Sum.name(), acc_sum),
        (AccKind::Min.name(), acc_min),
        (AccKind::Max.name(), acc_max),
        (AccKind::Avg.name(), acc_avg),
        (AccKind::Count.name(), acc_count),
    ];
    for (name, exec) in funcs {
        registry.register(name, BuiltinFunc { exec, validate });
    }
}

#[cfg(test)]
fn gated_run(kind: AccKind, rows: &[(Value, bool, bool)]) -> StateResult<Vec<Value>> {
    let ctx = crate::context::test_func_ctx();
    rows.iter()
        .map(|(value, on_begin, on_reset)| {
            kind.exec(
                &ctx,
                &[
                    value.clone(),
                    Value::Bool(*on_begin),
                    Value::Bool(*on_reset),
                    Value::Bool(true),
                    Value::from("self"),
                ],
            )
        })
        .collect()
}

#[cfg(test)]
fn gated_rows(values: [i64; 5]) -> Vec<(Value, bool, bool)> {
    let gates = [(false, false), (true, false), (false, false), (false, true), (false, false)];
    values
        .into_iter()
        .zip(gates)
        .map(|(v, (b, r))| (Value::from(v), b, r))
        .collect()
}

#[test]
fn gated_sum() -> StateResult<()> {
    let found = gated_run(AccKind::Sum, &gated_rows([1, 1, 1, 1, 1]))?;
    let expected: Vec<Value> = [0.0, 1.0, 2.0, 3.0, 0.0].into_iter().map(Value::from).collect();
    assert_eq!(found, expected);
    Ok(())
}

#[test]
fn gated_min() -> StateResult<()> {
    let found = gated_run(AccKind::Min, &gated_rows([6, 5, 4, 3, 2]))?;
    let expected: Vec<Value> = [0.0, 5.0, 4.0, 3.0, 0.0].into_iter().map(Value::from).collect();
    assert_eq!(found, expected);
    Ok(())
}

#[test]
fn gated_max() -> StateResult<()> {
    let found = gated_run(AccKind::Max, &gated_rows([9, 2, 3, 4, 10]))?;
    let expected: Vec<Value> = [0.0, 2.0, 3.0, 4.0, 0.0].into_iter().map(Value::from).collect();
    assert_eq!(found, expected);
    Ok(())
}

#[test]
fn gated_avg() -> StateResult<()> {
    let found = gated_run(AccKind::Avg, &gated_rows([1, 1, 1, 1, 1]))?;
    let expected: Vec<Value> = [0.0, 1.0, 1.0, 1.0, 0.0].into_iter().map(Value::from).collect();
    assert_eq!(found, expected);
    Ok(())
}

#[test]
fn gated_count() -> StateResult<()> {
    let found = gated_run(AccKind::Count, &gated_rows([1, 1, 1, 1, 1]))?;
    let expected: Vec<Value> = [0, 1, 2, 3, 0].into_iter().map(Value::from).collect();
    assert_eq!(found, expected);
    Ok(())
}

#[test]
fn plain_sum_is_running() -> StateResult<()> {
    let ctx = crate::context::test_func_ctx();
    let mut found = Vec::new();
    for v in [1, 2, 3] {
        found.push(acc_sum(
            &ctx,
            &[Value::from(v), Value::Bool(true), Value::from("self")],
        )?);
    }
    assert_eq!(
        found,
        vec![Value::from(1.0), Value::from(3.0), Value::from(6.0)]
    );
    Ok(())
}

#[test]
fn invalid_rows_are_not_folded() -> StateResult<()> {
    let ctx = crate::context::test_func_ctx();
    let first = acc_sum(&ctx, &[Value::from(1), Value::Bool(false), Value::from("self")])?;
    assert_eq!(first, Value::from(0.0));
    let second = acc_sum(&ctx, &[Value::from(2), Value::Bool(true), Value::from("self")])?;
    assert_eq!(second, Value::from(2.0));
    Ok(())
}

#[test]
fn nulls_are_skipped() -> StateResult<()> {
    let ctx = crate::context::test_func_ctx();
    acc_count(&ctx, &[Value::from(1), Value::Bool(true), Value::from("self")])?;
    let found = acc_count(&ctx, &[Value::Null, Value::Bool(true), Value::from("self")])?;
    assert_eq!(found, Value::Int(1));
    Ok(())
}

#[test]
fn non_numbers_fail_without_mutating() -> StateResult<()> {
    let ctx = crate::context::test_func_ctx();
    acc_sum(&ctx, &[Value::from(5), Value::Bool(true), Value::from("self")])?;
    for kind in [AccKind::Sum, AccKind::Min, AccKind::Max, AccKind::Avg] {
        let res = kind.exec(
            &ctx,
            &[Value::from("1"), Value::Bool(true), Value::from(kind.name())],
        );
        assert!(matches!(res, Err(StateError::InvalidArg(_))), "{kind:?}");
    }
    let res = acc_sum(&ctx, &[Value::from("1"), Value::Bool(true), Value::from("self")]);
    assert!(res.is_err());
    let found = acc_sum(&ctx, &[Value::from(1), Value::Bool(true), Value::from("self")])?;
    assert_eq!(found, Value::from(6.0));

    // Counting only needs a non-null value.
    let count = acc_count(&ctx, &[Value::from("1"), Value::Bool(true), Value::from("n")])?;
    assert_eq!(count, Value::Int(1));
    Ok(())
}

#[test]
fn gates_must_be_bools() {
    let ctx = crate::context::test_func_ctx();
    let res = acc_sum(
        &ctx,
        &[
            Value::from(1),
            Value::from("yes"),
            Value::Bool(false),
            Value::Bool(true),
            Value::from("self"),
        ],
    );
    assert!(matches!(res, Err(StateError::InvalidArg(msg)) if msg.contains("onBegin")));
    let res = acc_sum(&ctx, &[Value::from(1), Value::from(1), Value::from("self")]);
    assert!(matches!(res, Err(StateError::InvalidArg(msg)) if msg.contains("validData")));
}

#[test]
fn status_is_persisted_per_key() -> StateResult<()> {
    let ctx = crate::context::test_func_ctx();
    acc_max(&ctx, &[Value::from(3), Value::Bool(true), Value::from("a")])?;
    acc_max(&ctx, &[Value::from(7), Value::Bool(true), Value::from("b")])?;
    assert_eq!(
        ctx.get_state("a")?,
        Some(StateValue::Acc(AccumulatorStatus {
            value: Some(AccValue::Max(3.0)),
            has_begun: false,
        }))
    );
    assert_eq!(
        ctx.get_state("b")?,
        Some(StateValue::Acc(AccumulatorStatus {
            value: Some(AccValue::Max(7.0)),
            has_begun: false,
        }))
    );
    Ok(())
}
