use std::sync::Arc;

use opstate::checkpoint::create_store;
use opstate::checkpoint::CheckpointConfig;
use opstate::checkpoint::KvStore;
use opstate::checkpoint::Qos;
use opstate::functions::FunctionRegistry;
use opstate::FuncContext;
use opstate::OperatorContext;
use opstate::StateResult;
use opstate::StateStore;
use opstate::StateValue;
use opstate::Value;

fn config(dir: &tempfile::TempDir) -> CheckpointConfig {
    CheckpointConfig {
        data_dir: dir.path().to_owned(),
        max_retained: 2,
    }
}

/// Run one checkpoint barrier across all operators of a rule.
fn barrier(
    store: &dyn StateStore,
    ops: &[&OperatorContext],
    checkpoint_id: i64,
) -> StateResult<()> {
    for op in ops {
        op.snapshot()?;
    }
    for op in ops {
        op.save_state(checkpoint_id)?;
    }
    store.save_checkpoint(checkpoint_id)
}

#[test]
fn operators_resume_after_restart() -> StateResult<()> {
    let dir = tempfile::tempdir()?;
    let config = config(&dir);
    let registry = FunctionRegistry::with_builtins();

    {
        let store = create_store("rule1", Qos::AtLeastOnce, &config)?;
        let source = OperatorContext::new("rule1", "source", store.clone())?;
        let project = Arc::new(OperatorContext::new("rule1", "project", store.clone())?);
        let lag = FuncContext::new(project.clone(), 0);

        for (checkpoint_id, v) in [(1, 10), (2, 20), (3, 30)] {
            source.incr_counter("offset", 1)?;
            registry.exec("lag", &lag, &[Value::from(v), Value::from("all")])?;
            barrier(store.as_ref(), &[&source, &project], checkpoint_id)?;
        }

        // Progress after the last checkpoint is lost on restart.
        source.incr_counter("offset", 100)?;
    }

    let store = create_store("rule1", Qos::AtLeastOnce, &config)?;
    let source = OperatorContext::new("rule1", "source", store.clone())?;
    let project = Arc::new(OperatorContext::new("rule1", "project", store.clone())?);
    let lag = FuncContext::new(project, 0);

    assert_eq!(source.get_counter("offset")?, 3);
    let found = registry.exec("lag", &lag, &[Value::from(40), Value::from("all")])?;
    assert_eq!(found, Value::from(30));
    Ok(())
}

#[test]
fn only_the_newest_checkpoints_survive() -> StateResult<()> {
    let dir = tempfile::tempdir()?;
    let config = config(&dir);

    {
        let store = Arc::new(KvStore::open("rule1", &config)?);
        let op = OperatorContext::new("rule1", "op", store.clone())?;
        for checkpoint_id in 1..=4 {
            op.put_state("last", Value::from(checkpoint_id))?;
            barrier(store.as_ref(), &[&op], checkpoint_id)?;
        }
        store.wait_for_evictions();
    }

    let store = KvStore::open("rule1", &config)?;
    assert_eq!(store.checkpoints(), vec![3, 4]);
    let state = store.get_op_state("op")?;
    assert_eq!(state.get("last"), Some(&StateValue::Value(Value::from(4))));
    Ok(())
}

#[test]
fn rules_do_not_share_state() -> StateResult<()> {
    let dir = tempfile::tempdir()?;
    let config = config(&dir);

    let a = create_store("a", Qos::ExactlyOnce, &config)?;
    let b = create_store("b", Qos::ExactlyOnce, &config)?;
    let op_a = OperatorContext::new("a", "op", a.clone())?;
    op_a.incr_counter("n", 5)?;
    barrier(a.as_ref(), &[&op_a], 1)?;

    assert!(b.get_op_state("op")?.is_empty());
    assert_eq!(a.get_op_state("op")?.len(), 1);
    Ok(())
}

#[test]
fn accumulators_resume_mid_window() -> StateResult<()> {
    let dir = tempfile::tempdir()?;
    let config = config(&dir);
    let registry = FunctionRegistry::with_builtins();
    let row = |v: i64, on_begin: bool, on_reset: bool| {
        [
            Value::from(v),
            Value::Bool(on_begin),
            Value::Bool(on_reset),
            Value::Bool(true),
            Value::from("k"),
        ]
    };

    {
        let store = create_store("rule1", Qos::AtLeastOnce, &config)?;
        let op = Arc::new(OperatorContext::new("rule1", "agg", store.clone())?);
        let sum = FuncContext::new(op.clone(), 3);
        registry.exec("acc_sum", &sum, &row(1, true, false))?;
        registry.exec("acc_sum", &sum, &row(2, false, false))?;
        barrier(store.as_ref(), &[&op], 1)?;
    }

    let store = create_store("rule1", Qos::AtLeastOnce, &config)?;
    let op = Arc::new(OperatorContext::new("rule1", "agg", store)?);
    let sum = FuncContext::new(op, 3);
    let found = registry.exec("acc_sum", &sum, &row(4, false, true))?;
    assert_eq!(found, Value::from(7.0));
    let found = registry.exec("acc_sum", &sum, &row(8, false, false))?;
    assert_eq!(found, Value::from(0.0));
    Ok(())
}
