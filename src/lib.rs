//! Operator state and checkpointing for a streaming rule engine.
//!
//! Each operator of a rule keeps a K-V state map through an
//! [`context::OperatorContext`]. Stateful SQL functions get their own
//! namespaced view through a [`context::FuncContext`]. On every
//! checkpoint barrier operators snapshot their state into the rule's
//! [`checkpoint::StateStore`], which persists a bounded window of the
//! most recent checkpoints and restores them on restart.
//!
//! ```no_run
//! use opstate::checkpoint::create_store;
//! use opstate::checkpoint::CheckpointConfig;
//! use opstate::checkpoint::Qos;
//! use opstate::context::OperatorContext;
//!
//! # fn main() -> opstate::errors::StateResult<()> {
//! let config = CheckpointConfig::new("/var/lib/rules");
//! let store = create_store("rule1", Qos::AtLeastOnce, &config)?;
//! let ctx = OperatorContext::new("rule1", "op1", store.clone())?;
//!
//! ctx.incr_counter("seen", 1)?;
//! ctx.snapshot()?;
//! ctx.save_state(1)?;
//! store.save_checkpoint(1)?;
//! # Ok(())
//! # }
//! ```

pub mod checkpoint;
pub mod context;
pub mod engine;
pub mod errors;
pub mod functions;
pub mod logging;
pub mod metrics;
pub mod state;
pub mod value;

pub use checkpoint::StateStore;
pub use context::FuncContext;
pub use context::OperatorContext;
pub use errors::StateError;
pub use errors::StateResult;
pub use state::CheckpointId;
pub use state::StateValue;
pub use value::Value;
