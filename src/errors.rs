//! Error taxonomy for state access and checkpointing.
//!
//! Storage and integrity errors abort the enclosing checkpoint or
//! restore. Type and argument errors are local to one state access
//! and are reported to the function invocation that caused them.

use std::panic::Location;

use crate::state::CheckpointId;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// The durable engine failed to open, read, write or close.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("storage migration error: {0}")]
    Migration(#[from] rusqlite_migration::Error),

    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),

    /// The retained checkpoint list references data that can't be
    /// found or decoded. The store can't be trusted after this.
    #[error("checkpoint {checkpoint_id} is corrupt: {reason}")]
    Integrity {
        checkpoint_id: CheckpointId,
        reason: String,
    },

    #[error("error encoding state: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("error decoding state: {0}")]
    Decode(#[source] serde_json::Error),

    /// A stored value is not of the kind the reader expects.
    #[error("state[{key}] must be {expected} but found {found}")]
    Type {
        key: String,
        expected: &'static str,
        found: String,
    },

    #[error("{0}")]
    InvalidArg(String),

    #[error("checkpoint {checkpoint_id} is at or below the last persisted checkpoint {high_water}")]
    StaleCheckpoint {
        checkpoint_id: CheckpointId,
        high_water: CheckpointId,
    },

    #[error("checkpoint {0} has no state to save")]
    UnknownCheckpoint(CheckpointId),

    #[error("operator {op_id} has no pending snapshot")]
    MissingSnapshot { op_id: String },

    #[error("unknown function {0}")]
    UnknownFunction(String),

    #[error("logging setup error: {0}")]
    Logging(String),

    #[error("metrics setup error: {0}")]
    Metrics(String),
}

pub type StateResult<T> = Result<T, StateError>;

/// Build an [`StateError::InvalidArg`] tagged with the caller's
/// location.
#[track_caller]
pub(crate) fn invalid_arg(msg: impl AsRef<str>) -> StateError {
    let caller = Location::caller();
    StateError::InvalidArg(prepend_caller(caller, msg.as_ref()))
}

/// Prepend '({caller}) ' to the message
fn prepend_caller(caller: &Location, msg: &str) -> String {
    format!("({caller}) {msg}")
}

#[test]
fn invalid_arg_names_the_caller() {
    let err = invalid_arg("onBegin should be boolean");
    let msg = err.to_string();
    assert!(msg.starts_with("(src/errors.rs:"), "got {msg}");
    assert!(msg.ends_with(") onBegin should be boolean"), "got {msg}");
}
