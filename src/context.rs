//! Per-operator and per-function views over operator state.
//!
//! An [`OperatorContext`] owns the live state map of one operator
//! instance and hands snapshots of it to the rule's
//! [`StateStore`]. A [`FuncContext`] wraps it for one stateful
//! function call-site, namespacing every key so call-sites sharing an
//! operator never collide.
//!
//! Different keys may be touched concurrently. Read-modify-write of a
//! single key must go through [`OperatorContext::update_state`] (or
//! [`OperatorContext::incr_counter`] for counters); a
//! [`OperatorContext::get_state`] followed by a
//! [`OperatorContext::put_state`] is not atomic.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::checkpoint::StateStore;
use crate::errors::invalid_arg;
use crate::errors::StateError;
use crate::errors::StateResult;
use crate::state::CheckpointId;
use crate::state::StateMap;
use crate::state::StateValue;

/// Prefix of every key written through a [`FuncContext`].
pub const FUNC_KEY_PREFIX: &str = "$$func";

/// State facade of one operator instance.
pub struct OperatorContext {
    rule_id: String,
    op_id: String,
    instance_id: usize,
    store: Arc<dyn StateStore>,
    /// Shared between all instances of the operator.
    state: Arc<DashMap<String, StateValue>>,
    /// Taken by [`Self::snapshot`], consumed by [`Self::save_state`].
    snapshot: Mutex<Option<StateMap>>,
}

impl std::fmt::Debug for OperatorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorContext")
            .field("rule_id", &self.rule_id)
            .field("op_id", &self.op_id)
            .field("instance_id", &self.instance_id)
            .field("keys", &self.state.len())
            .finish_non_exhaustive()
    }
}

impl OperatorContext {
    /// Create the context of an operator, resuming from the state the
    /// store holds for it in the newest checkpoint.
    pub fn new(rule_id: &str, op_id: &str, store: Arc<dyn StateStore>) -> StateResult<Self> {
        let resumed = store.get_op_state(op_id)?;
        if !resumed.is_empty() {
            tracing::debug!(
                "Resuming {} keys for operator {op_id} of rule {rule_id}",
                resumed.len()
            );
        }
        Ok(Self {
            rule_id: rule_id.to_owned(),
            op_id: op_id.to_owned(),
            instance_id: 0,
            store,
            state: Arc::new(resumed.into_iter().collect()),
            snapshot: Mutex::new(None),
        })
    }

    /// Another instance of the same operator. State is shared;
    /// pending snapshots are not.
    pub fn with_instance(&self, instance_id: usize) -> Self {
        Self {
            rule_id: self.rule_id.clone(),
            op_id: self.op_id.clone(),
            instance_id,
            store: self.store.clone(),
            state: self.state.clone(),
            snapshot: Mutex::new(None),
        }
    }

    pub fn rule_id(&self) -> &str {
        &self.rule_id
    }

    pub fn op_id(&self) -> &str {
        &self.op_id
    }

    pub fn instance_id(&self) -> usize {
        self.instance_id
    }

    pub fn get_state(&self, key: &str) -> StateResult<Option<StateValue>> {
        Ok(self.state.get(key).map(|v| v.value().clone()))
    }

    /// Last write wins.
    pub fn put_state(&self, key: &str, value: impl Into<StateValue>) -> StateResult<()> {
        self.state.insert(key.to_owned(), value.into());
        Ok(())
    }

    pub fn delete_state(&self, key: &str) -> StateResult<()> {
        self.state.remove(key);
        Ok(())
    }

    /// Atomically read and replace the value of one key.
    ///
    /// `f` sees the current value and returns a result plus the new
    /// value to store, or [`None`] to leave the key untouched. If `f`
    /// fails nothing is written. The key is held exclusively while
    /// `f` runs, so `f` must not access this context.
    pub fn update_state<R>(
        &self,
        key: &str,
        f: impl FnOnce(Option<&StateValue>) -> StateResult<(R, Option<StateValue>)>,
    ) -> StateResult<R> {
        match self.state.entry(key.to_owned()) {
            Entry::Occupied(mut entry) => {
                let (out, new) = f(Some(entry.get()))?;
                if let Some(new) = new {
                    entry.insert(new);
                }
                Ok(out)
            }
            Entry::Vacant(entry) => {
                let (out, new) = f(None)?;
                if let Some(new) = new {
                    entry.insert(new);
                }
                Ok(out)
            }
        }
    }

    /// Add `amount` to the counter at `key`, starting from 0.
    ///
    /// Uses an optimistic compare-and-swap loop so concurrent
    /// increments are never lost.
    pub fn incr_counter(&self, key: &str, amount: i64) -> StateResult<()> {
        loop {
            let current = self.state.get(key).map(|v| v.value().clone());
            let old = match &current {
                Some(value) => counter_of(key, value)?,
                None => 0,
            };
            let new = old
                .checked_add(amount)
                .ok_or_else(|| invalid_arg(format!("counter state[{key}] overflowed")))?;

            match self.state.entry(key.to_owned()) {
                Entry::Occupied(mut entry) if Some(entry.get()) == current.as_ref() => {
                    entry.insert(StateValue::Counter(new));
                    return Ok(());
                }
                Entry::Vacant(entry) if current.is_none() => {
                    entry.insert(StateValue::Counter(new));
                    return Ok(());
                }
                _ => {
                    tracing::trace!("Counter state[{key}] changed underneath increment; retrying");
                }
            }
        }
    }

    /// Current counter value, materializing 0 if absent.
    pub fn get_counter(&self, key: &str) -> StateResult<i64> {
        let value = self
            .state
            .entry(key.to_owned())
            .or_insert(StateValue::Counter(0));
        counter_of(key, value.value())
    }

    /// Capture the whole state map to hand to [`Self::save_state`].
    pub fn snapshot(&self) -> StateResult<()> {
        let captured: StateMap = self
            .state
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        tracing::trace!(
            "Snapshotted {} keys of operator {}",
            captured.len(),
            self.op_id
        );
        *self.snapshot.lock().unwrap_or_else(PoisonError::into_inner) = Some(captured);
        Ok(())
    }

    /// Hand the pending snapshot to the store for `checkpoint_id`.
    ///
    /// The snapshot is kept if the store refuses it.
    pub fn save_state(&self, checkpoint_id: CheckpointId) -> StateResult<()> {
        let mut pending = self.snapshot.lock().unwrap_or_else(PoisonError::into_inner);
        let state = pending
            .as_ref()
            .ok_or_else(|| StateError::MissingSnapshot {
                op_id: self.op_id.clone(),
            })?
            .clone();
        self.store.save_state(checkpoint_id, &self.op_id, state)?;
        *pending = None;
        Ok(())
    }
}

fn counter_of(key: &str, value: &StateValue) -> StateResult<i64> {
    value.as_counter().ok_or_else(|| StateError::Type {
        key: key.to_owned(),
        expected: "an int",
        found: value.kind(),
    })
}

/// State facade of one stateful function call-site within an
/// operator.
///
/// Every key is rewritten to `"$$func<func_id>_<key>"` before it
/// reaches the operator's state.
#[derive(Debug, Clone)]
pub struct FuncContext {
    ctx: Arc<OperatorContext>,
    func_id: usize,
}

impl FuncContext {
    pub fn new(ctx: Arc<OperatorContext>, func_id: usize) -> Self {
        Self { ctx, func_id }
    }

    pub fn func_id(&self) -> usize {
        self.func_id
    }

    pub fn operator(&self) -> &OperatorContext {
        &self.ctx
    }

    fn convert_key(&self, key: &str) -> String {
        format!("{FUNC_KEY_PREFIX}{}_{key}", self.func_id)
    }

    pub fn get_state(&self, key: &str) -> StateResult<Option<StateValue>> {
        self.ctx.get_state(&self.convert_key(key))
    }

    pub fn put_state(&self, key: &str, value: impl Into<StateValue>) -> StateResult<()> {
        self.ctx.put_state(&self.convert_key(key), value)
    }

    pub fn delete_state(&self, key: &str) -> StateResult<()> {
        self.ctx.delete_state(&self.convert_key(key))
    }

    pub fn update_state<R>(
        &self,
        key: &str,
        f: impl FnOnce(Option<&StateValue>) -> StateResult<(R, Option<StateValue>)>,
    ) -> StateResult<R> {
        self.ctx.update_state(&self.convert_key(key), f)
    }

    pub fn incr_counter(&self, key: &str, amount: i64) -> StateResult<()> {
        self.ctx.incr_counter(&self.convert_key(key), amount)
    }

    pub fn get_counter(&self, key: &str) -> StateResult<i64> {
        self.ctx.get_counter(&self.convert_key(key))
    }
}

#[cfg(test)]
pub(crate) fn test_ctx() -> Arc<OperatorContext> {
    let store: Arc<dyn StateStore> = Arc::new(crate::checkpoint::MemStore);
    Arc::new(OperatorContext::new("rule1", "op1", store).expect("MemStore can't fail"))
}

#[cfg(test)]
pub(crate) fn test_func_ctx() -> FuncContext {
    FuncContext::new(test_ctx(), 1)
}

#[test]
fn put_get_delete() -> StateResult<()> {
    use crate::value::Value;

    let ctx = test_ctx();
    assert_eq!(ctx.get_state("a")?, None);

    ctx.put_state("a", Value::from(1))?;
    ctx.put_state("a", Value::from("x"))?;
    assert_eq!(ctx.get_state("a")?, Some(StateValue::Value(Value::from("x"))));

    ctx.delete_state("a")?;
    ctx.delete_state("a")?;
    assert_eq!(ctx.get_state("a")?, None);
    Ok(())
}

#[test]
fn counter_defaults_to_zero_and_materializes() -> StateResult<()> {
    let ctx = test_ctx();
    assert_eq!(ctx.get_counter("c")?, 0);
    assert_eq!(ctx.get_state("c")?, Some(StateValue::Counter(0)));

    ctx.incr_counter("c", 5)?;
    ctx.incr_counter("c", -2)?;
    assert_eq!(ctx.get_counter("c")?, 3);
    Ok(())
}

#[test]
fn counter_rejects_non_integers() -> StateResult<()> {
    use crate::value::Value;

    let ctx = test_ctx();
    ctx.put_state("seeded", Value::from(10))?;
    ctx.incr_counter("seeded", 1)?;
    assert_eq!(ctx.get_counter("seeded")?, 11);

    ctx.put_state("c", Value::from("ten"))?;
    assert!(matches!(
        ctx.incr_counter("c", 1),
        Err(StateError::Type { .. })
    ));
    assert!(matches!(ctx.get_counter("c"), Err(StateError::Type { .. })));
    // The bad value is left as is.
    assert_eq!(ctx.get_state("c")?, Some(StateValue::Value(Value::from("ten"))));
    Ok(())
}

#[test]
fn concurrent_increments_are_not_lost() -> StateResult<()> {
    let ctx = test_ctx();
    let workers = 8;
    let per_worker = 500;

    std::thread::scope(|s| {
        for _ in 0..workers {
            let ctx = ctx.clone();
            s.spawn(move || {
                for _ in 0..per_worker {
                    ctx.incr_counter("hits", 1).expect("increment failed");
                }
            });
        }
    });

    assert_eq!(ctx.get_counter("hits")?, workers * per_worker);
    Ok(())
}

#[test]
fn update_state_writes_nothing_on_error() -> StateResult<()> {
    use crate::value::Value;

    let ctx = test_ctx();
    ctx.put_state("k", Value::from(1))?;
    let res: StateResult<()> = ctx.update_state("k", |_| Err(invalid_arg("nope")));
    assert!(res.is_err());
    assert_eq!(ctx.get_state("k")?, Some(StateValue::Value(Value::from(1))));

    let out = ctx.update_state("fresh", |current| {
        assert_eq!(current, None);
        Ok((7, Some(StateValue::Counter(7))))
    })?;
    assert_eq!(out, 7);
    assert_eq!(ctx.get_counter("fresh")?, 7);
    Ok(())
}

#[test]
fn func_keys_are_namespaced() -> StateResult<()> {
    use crate::value::Value;

    let ctx = test_ctx();
    let f1 = FuncContext::new(ctx.clone(), 1);
    let f2 = FuncContext::new(ctx.clone(), 2);

    f1.put_state("k", Value::from("one"))?;
    f2.put_state("k", Value::from("two"))?;
    f1.incr_counter("n", 3)?;

    assert_eq!(f1.get_state("k")?, Some(StateValue::Value(Value::from("one"))));
    assert_eq!(f2.get_state("k")?, Some(StateValue::Value(Value::from("two"))));
    assert_eq!(f2.get_counter("n")?, 0);
    assert_eq!(
        ctx.get_state("$$func1_k")?,
        Some(StateValue::Value(Value::from("one")))
    );
    assert_eq!(ctx.get_state("k")?, None);

    f1.delete_state("k")?;
    assert_eq!(ctx.get_state("$$func1_k")?, None);
    assert!(ctx.get_state("$$func2_k")?.is_some());
    Ok(())
}

#[test]
fn instances_share_state() -> StateResult<()> {
    let ctx = test_ctx();
    let other = ctx.with_instance(1);
    other.incr_counter("n", 2)?;
    assert_eq!(ctx.get_counter("n")?, 2);
    assert_eq!(other.instance_id(), 1);
    assert_eq!(other.op_id(), "op1");
    Ok(())
}

#[test]
fn save_state_needs_a_snapshot() -> StateResult<()> {
    let ctx = test_ctx();
    assert!(matches!(
        ctx.save_state(1),
        Err(StateError::MissingSnapshot { .. })
    ));
    ctx.snapshot()?;
    ctx.save_state(1)?;
    // Consumed.
    assert!(ctx.save_state(2).is_err());
    Ok(())
}
