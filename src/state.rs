//! Data model of operator state and checkpoints.
//!
//! An operator's state is a K-V mapping from an opaque string key to
//! a [`StateValue`]. A checkpoint snapshot maps operator IDs to those
//! mappings, all captured as of one [`CheckpointId`].

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::functions::acc::AccumulatorStatus;
use crate::functions::ring_queue::RingQueue;
use crate::value::Value;

/// Monotonically increasing ID of a consistent snapshot point across
/// all operators of a rule. Not required to be contiguous.
pub type CheckpointId = i64;

/// A value held under one key of an operator's state.
///
/// Each key class gets its own variant so readers can check they got
/// what they expect instead of downcasting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StateValue {
    /// A plain datum, e.g. the last seen value of a column.
    Value(Value),
    /// An integer maintained by increments.
    Counter(i64),
    /// Backing queue for lag-style functions.
    Ring(RingQueue),
    /// Running accumulator with begin/reset gating.
    Acc(AccumulatorStatus),
}

impl StateValue {
    /// Name of the variant, for error messages.
    pub fn kind(&self) -> String {
        match self {
            StateValue::Value(v) => format!("value({})", v.kind()),
            StateValue::Counter(_) => "counter".to_owned(),
            StateValue::Ring(_) => "ring queue".to_owned(),
            StateValue::Acc(_) => "accumulator".to_owned(),
        }
    }

    /// Interpret this slot as an integer counter.
    ///
    /// Plain integer values and integral floats are accepted, the way
    /// a counter that was seeded with [`crate::context::OperatorContext::put_state`]
    /// should still be usable.
    pub fn as_counter(&self) -> Option<i64> {
        match self {
            StateValue::Counter(n) => Some(*n),
            StateValue::Value(v) => v.as_i64(),
            _ => None,
        }
    }
}

impl From<Value> for StateValue {
    fn from(v: Value) -> Self {
        StateValue::Value(v)
    }
}

impl From<RingQueue> for StateValue {
    fn from(rq: RingQueue) -> Self {
        StateValue::Ring(rq)
    }
}

impl From<AccumulatorStatus> for StateValue {
    fn from(status: AccumulatorStatus) -> Self {
        StateValue::Acc(status)
    }
}

/// Plain copy of one operator's state.
///
/// Ordered so the serialized form is deterministic.
pub type StateMap = BTreeMap<String, StateValue>;

/// All operators' state as of one checkpoint, keyed by operator ID.
pub type CheckpointSnapshot = BTreeMap<String, StateMap>;

#[test]
fn counter_accepts_integral_values() {
    assert_eq!(StateValue::Counter(4).as_counter(), Some(4));
    assert_eq!(StateValue::Value(Value::Int(4)).as_counter(), Some(4));
    assert_eq!(StateValue::Value(Value::Float(4.0)).as_counter(), Some(4));
    assert_eq!(StateValue::Value(Value::Float(4.2)).as_counter(), None);
    assert_eq!(
        StateValue::Value(Value::String("4".to_owned())).as_counter(),
        None
    );
    assert_eq!(StateValue::Ring(RingQueue::new(1)).as_counter(), None);
}
