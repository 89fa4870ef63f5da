//! Checkpoint management for operator state.
//!
//! Operators hand a snapshot of their state to the store with
//! [`StateStore::save_state`] once per checkpoint. When every operator
//! of a rule has done so, [`StateStore::save_checkpoint`] makes the
//! checkpoint durable and retires the oldest one beyond the retention
//! window. On restart the store restores every retained checkpoint
//! and operators resume from the newest with
//! [`StateStore::get_op_state`].
//!
//! The durable layout is two kinds of keys in one [`KvEngine`]:
//!
//! - `"checkpoints"` holds the retained checkpoint IDs, oldest first.
//!
//! - `"<checkpoint_id>"` holds the [`CheckpointSnapshot`] of that
//!   checkpoint.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use serde::Deserialize;
use serde::Serialize;
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tracing::instrument;

use crate::engine::get_json;
use crate::engine::to_json;
use crate::engine::KvEngine;
use crate::engine::SqliteEngine;
use crate::errors::invalid_arg;
use crate::errors::StateError;
use crate::errors::StateResult;
use crate::metrics::StoreMetrics;
use crate::state::CheckpointId;
use crate::state::CheckpointSnapshot;
use crate::state::StateMap;
use crate::with_timer;

/// Key of the retained checkpoint list.
pub const CHECKPOINT_LIST_KEY: &str = "checkpoints";

/// Name of the SQLite file within a rule's checkpoint directory.
pub const DB_FILE_NAME: &str = "state.sqlite3";

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_max_retained() -> usize {
    3
}

/// Configuration settings for checkpoint storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Root directory; each rule gets its own subdirectory.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Number of checkpoints kept durable at once.
    #[serde(default = "default_max_retained")]
    pub max_retained: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            max_retained: default_max_retained(),
        }
    }
}

impl CheckpointConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    pub fn from_json(doc: &str) -> StateResult<Self> {
        serde_json::from_str(doc).map_err(StateError::Decode)
    }

    /// Directory holding the checkpoints of one rule.
    pub fn rule_dir(&self, rule_id: &str) -> PathBuf {
        self.data_dir.join(rule_id).join("checkpoints")
    }
}

/// Processing guarantee of a rule.
///
/// Only rules with at-least-once or stronger guarantees persist
/// state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Qos {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

/// What the operator runtime needs from a checkpoint store.
pub trait StateStore: Send + Sync {
    /// Attach one operator's state to a pending checkpoint.
    fn save_state(
        &self,
        checkpoint_id: CheckpointId,
        op_id: &str,
        state: StateMap,
    ) -> StateResult<()>;

    /// Persist a pending checkpoint and retire old ones.
    fn save_checkpoint(&self, checkpoint_id: CheckpointId) -> StateResult<()>;

    /// State of an operator in the newest retained checkpoint, or
    /// empty on a cold start.
    fn get_op_state(&self, op_id: &str) -> StateResult<StateMap>;

    /// Drop all checkpoints, durable and in memory.
    fn clean(&self) -> StateResult<()>;
}

/// Build the store for a rule according to its QoS.
pub fn create_store(
    rule_id: &str,
    qos: Qos,
    config: &CheckpointConfig,
) -> StateResult<Arc<dyn StateStore>> {
    match qos {
        Qos::AtMostOnce => Ok(Arc::new(MemStore)),
        Qos::AtLeastOnce | Qos::ExactlyOnce => Ok(Arc::new(KvStore::open(rule_id, config)?)),
    }
}

/// Store for rules that don't checkpoint. Nothing is kept.
#[derive(Debug, Default)]
pub struct MemStore;

impl StateStore for MemStore {
    fn save_state(
        &self,
        _checkpoint_id: CheckpointId,
        _op_id: &str,
        _state: StateMap,
    ) -> StateResult<()> {
        Ok(())
    }

    fn save_checkpoint(&self, _checkpoint_id: CheckpointId) -> StateResult<()> {
        Ok(())
    }

    fn get_op_state(&self, _op_id: &str) -> StateResult<StateMap> {
        Ok(StateMap::new())
    }

    fn clean(&self) -> StateResult<()> {
        Ok(())
    }
}

/// In-memory index of checkpoints, guarded by the store's mutex.
#[derive(Debug, Default)]
struct Checkpoints {
    /// Durable checkpoint IDs in arrival order, oldest first.
    retained: VecDeque<CheckpointId>,
    /// Snapshots of retained and pending checkpoints.
    snapshots: HashMap<CheckpointId, CheckpointSnapshot>,
    /// Newest checkpoint ever made durable by this store.
    high_water: Option<CheckpointId>,
    /// Checkpoint currently being written by `save_checkpoint`.
    in_flight: Option<CheckpointId>,
}

impl Checkpoints {
    /// Reject IDs at or below anything persisted or being persisted.
    fn check_fresh(&self, checkpoint_id: CheckpointId) -> StateResult<()> {
        match self.high_water.max(self.in_flight) {
            Some(high_water) if checkpoint_id <= high_water => Err(StateError::StaleCheckpoint {
                checkpoint_id,
                high_water,
            }),
            _ => Ok(()),
        }
    }
}

/// Durable, bounded-retention checkpoint store for one rule.
///
/// Saves of different checkpoints are serialized. Dropping the store
/// abandons evictions still running; their records are left behind.
pub struct KvStore {
    rule_id: String,
    engine: Arc<dyn KvEngine>,
    max: usize,
    inner: Mutex<Checkpoints>,
    /// Held for the whole of `save_checkpoint` and `clean`.
    save_lock: Mutex<()>,
    /// Runs eviction deletes in the background. Only taken on drop.
    rt: Option<Runtime>,
    evictions: Mutex<Vec<JoinHandle<()>>>,
    metrics: StoreMetrics,
}

impl std::fmt::Debug for KvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvStore")
            .field("rule_id", &self.rule_id)
            .field("max", &self.max)
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl KvStore {
    /// Open the SQLite-backed store of a rule and restore its
    /// retained checkpoints.
    pub fn open(rule_id: &str, config: &CheckpointConfig) -> StateResult<Self> {
        let file = config.rule_dir(rule_id).join(DB_FILE_NAME);
        Self::with_engine(rule_id, Arc::new(SqliteEngine::new(file)), config.max_retained)
    }

    /// Open the store on an arbitrary engine and restore its retained
    /// checkpoints.
    #[instrument(name = "open_checkpoint_store", skip(engine))]
    pub fn with_engine(
        rule_id: &str,
        engine: Arc<dyn KvEngine>,
        max_retained: usize,
    ) -> StateResult<Self> {
        if max_retained == 0 {
            return Err(invalid_arg("checkpoint retention must be at least 1"));
        }
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let store = Self {
            rule_id: rule_id.to_owned(),
            engine,
            max: max_retained,
            inner: Mutex::new(Checkpoints::default()),
            save_lock: Mutex::new(()),
            rt: Some(rt),
            evictions: Mutex::new(Vec::new()),
            metrics: StoreMetrics::new(rule_id),
        };
        store.restore()?;
        Ok(store)
    }

    fn lock(&self) -> MutexGuard<'_, Checkpoints> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load every retained checkpoint into memory.
    ///
    /// A retained ID whose payload is missing or can't be decoded
    /// means the durable state can't be trusted, so this fails rather
    /// than continuing with empty state.
    fn restore(&self) -> StateResult<()> {
        let mut conn = self.engine.open()?;
        let retained: Vec<CheckpointId> =
            get_json(conn.as_mut(), CHECKPOINT_LIST_KEY)?.unwrap_or_default();

        let mut snapshots = HashMap::with_capacity(retained.len());
        for &checkpoint_id in &retained {
            let snapshot: CheckpointSnapshot = get_json(conn.as_mut(), &checkpoint_id.to_string())
                .map_err(|err| match err {
                    StateError::Decode(err) => StateError::Integrity {
                        checkpoint_id,
                        reason: err.to_string(),
                    },
                    err => err,
                })?
                .ok_or_else(|| StateError::Integrity {
                    checkpoint_id,
                    reason: "payload is missing".to_owned(),
                })?;
            snapshots.insert(checkpoint_id, snapshot);
        }
        conn.close()?;

        if retained.is_empty() {
            tracing::debug!("No checkpoints to restore for rule {}", self.rule_id);
        } else {
            tracing::info!(
                "Restored checkpoints {retained:?} for rule {}",
                self.rule_id
            );
        }

        let mut inner = self.lock();
        inner.high_water = retained.iter().copied().max();
        inner.retained = retained.into();
        inner.snapshots = snapshots;
        Ok(())
    }

    /// Retained checkpoint IDs, oldest first.
    pub fn checkpoints(&self) -> Vec<CheckpointId> {
        self.lock().retained.iter().copied().collect()
    }

    /// Snapshot held in memory for a checkpoint, retained or pending.
    pub fn snapshot(&self, checkpoint_id: CheckpointId) -> Option<CheckpointSnapshot> {
        self.lock().snapshots.get(&checkpoint_id).cloned()
    }

    pub fn rule_id(&self) -> &str {
        &self.rule_id
    }

    /// Block until all dispatched eviction deletes finish.
    ///
    /// Must not be called from within an async context.
    pub fn wait_for_evictions(&self) {
        let Some(rt) = &self.rt else {
            return;
        };
        let handles: Vec<_> = {
            let mut evictions = self.evictions.lock().unwrap_or_else(PoisonError::into_inner);
            evictions.drain(..).collect()
        };
        for handle in handles {
            if let Err(err) = rt.block_on(handle) {
                tracing::warn!("Checkpoint eviction task failed: {err}");
            }
        }
    }

    /// Delete a checkpoint record in the background. Failure is
    /// logged and otherwise ignored; a stale record is only extra
    /// disk usage.
    fn evict(&self, checkpoint_id: CheckpointId) {
        let Some(rt) = &self.rt else {
            return;
        };
        let engine = self.engine.clone();
        let rule_id = self.rule_id.clone();
        let evicted_count = self.metrics.evicted_count.clone();
        let evict_error_count = self.metrics.evict_error_count.clone();
        let labels = self.metrics.labels.clone();

        let handle = rt.spawn_blocking(move || {
            let key = checkpoint_id.to_string();
            let result = engine.open().and_then(|mut conn| {
                conn.delete(&key)?;
                conn.close()
            });
            match result {
                Ok(()) => {
                    tracing::debug!("Evicted checkpoint {checkpoint_id} of rule {rule_id}");
                    evicted_count.add(1, &labels);
                }
                Err(err) => {
                    tracing::warn!(
                        "Error deleting evicted checkpoint {checkpoint_id} of rule {rule_id}: {err}"
                    );
                    evict_error_count.add(1, &labels);
                }
            }
        });

        let mut evictions = self.evictions.lock().unwrap_or_else(PoisonError::into_inner);
        evictions.retain(|pending| !pending.is_finished());
        evictions.push(handle);
    }

    /// Write the snapshot and the new retained list in one batch.
    fn persist(
        &self,
        checkpoint_id: CheckpointId,
        snapshot: &CheckpointSnapshot,
        retained: &VecDeque<CheckpointId>,
    ) -> StateResult<()> {
        let entries = [
            (checkpoint_id.to_string(), to_json(snapshot)?),
            (CHECKPOINT_LIST_KEY.to_owned(), to_json(retained)?),
        ];
        let entries: Vec<_> = entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.clone()))
            .collect();

        let mut conn = self.engine.open()?;
        conn.set_all(&entries)?;
        conn.close()
    }
}

impl Drop for KvStore {
    fn drop(&mut self) {
        // A plain drop blocks on the runtime's shutdown, which panics
        // inside an async context.
        if let Some(rt) = self.rt.take() {
            rt.shutdown_background();
        }
    }
}

impl StateStore for KvStore {
    fn save_state(
        &self,
        checkpoint_id: CheckpointId,
        op_id: &str,
        state: StateMap,
    ) -> StateResult<()> {
        let mut inner = self.lock();
        // Resurrecting an already persisted ID would make the retained
        // list ambiguous, and a checkpoint being written is frozen.
        inner.check_fresh(checkpoint_id)?;
        tracing::trace!("Saving state of {op_id} for checkpoint {checkpoint_id}");
        inner
            .snapshots
            .entry(checkpoint_id)
            .or_default()
            .insert(op_id.to_owned(), state);
        Ok(())
    }

    #[instrument(skip(self), fields(rule_id = %self.rule_id))]
    fn save_checkpoint(&self, checkpoint_id: CheckpointId) -> StateResult<()> {
        let _saving = self.save_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let (snapshot, mut retained) = {
            let mut inner = self.lock();
            inner.check_fresh(checkpoint_id)?;
            let snapshot = inner
                .snapshots
                .get(&checkpoint_id)
                .cloned()
                .ok_or(StateError::UnknownCheckpoint(checkpoint_id))?;
            inner.in_flight = Some(checkpoint_id);
            (snapshot, inner.retained.clone())
        };

        retained.push_back(checkpoint_id);
        let mut evicted = Vec::new();
        while retained.len() > self.max {
            if let Some(oldest) = retained.pop_front() {
                evicted.push(oldest);
            }
        }

        let persisted = with_timer!(
            self.metrics.save_duration,
            self.metrics.labels,
            self.persist(checkpoint_id, &snapshot, &retained)
        );

        {
            let mut inner = self.lock();
            inner.in_flight = None;
            persisted?;

            inner.retained = retained.clone();
            inner.high_water = Some(checkpoint_id);
            for checkpoint_id in &evicted {
                inner.snapshots.remove(checkpoint_id);
            }
            // Pending checkpoints older than this one will never
            // complete.
            let Checkpoints {
                retained,
                snapshots,
                ..
            } = &mut *inner;
            snapshots.retain(|id, _| *id > checkpoint_id || retained.contains(id));
        }
        self.metrics.saved_count.add(1, &self.metrics.labels);
        tracing::debug!("Saved checkpoint {checkpoint_id}, retained {retained:?}");

        for checkpoint_id in evicted {
            self.evict(checkpoint_id);
        }
        Ok(())
    }

    fn get_op_state(&self, op_id: &str) -> StateResult<StateMap> {
        let inner = self.lock();
        let Some(&newest) = inner.retained.back() else {
            return Ok(StateMap::new());
        };
        let snapshot = inner
            .snapshots
            .get(&newest)
            .ok_or_else(|| StateError::Integrity {
                checkpoint_id: newest,
                reason: "newest retained checkpoint is not loaded".to_owned(),
            })?;
        match snapshot.get(op_id) {
            Some(state) => Ok(state.clone()),
            None => {
                if !snapshot.is_empty() {
                    tracing::warn!("No resume state for {op_id:?} in checkpoint {newest}, but other operators have state");
                }
                Ok(StateMap::new())
            }
        }
    }

    #[instrument(skip(self), fields(rule_id = %self.rule_id))]
    fn clean(&self) -> StateResult<()> {
        let _saving = self.save_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let retained = self.checkpoints();
        let mut conn = self.engine.open()?;
        for checkpoint_id in &retained {
            conn.delete(&checkpoint_id.to_string())?;
        }
        conn.delete(CHECKPOINT_LIST_KEY)?;
        conn.close()?;

        *self.lock() = Checkpoints::default();
        tracing::info!("Cleaned checkpoints {retained:?}");
        Ok(())
    }
}

#[cfg(test)]
fn op_state(pairs: &[(&str, i64)]) -> StateMap {
    pairs
        .iter()
        .map(|(key, n)| ((*key).to_owned(), crate::state::StateValue::Counter(*n)))
        .collect()
}

#[cfg(test)]
fn checkpoint_all(store: &KvStore, checkpoint_id: CheckpointId, n: i64) -> StateResult<()> {
    store.save_state(checkpoint_id, "op1", op_state(&[("n", n)]))?;
    store.save_state(checkpoint_id, "op2", op_state(&[("m", n * 10)]))?;
    store.save_checkpoint(checkpoint_id)
}

/// Engine whose writes or deletes can be made to fail, and whose
/// writes can be slowed down.
#[cfg(test)]
#[derive(Debug, Clone, Default)]
struct FlakyEngine {
    inner: crate::engine::MemEngine,
    fail_writes: Arc<std::sync::atomic::AtomicBool>,
    fail_deletes: Arc<std::sync::atomic::AtomicBool>,
    write_delay_ms: Arc<std::sync::atomic::AtomicU64>,
    writes_started: Arc<std::sync::atomic::AtomicUsize>,
}

#[cfg(test)]
impl KvEngine for FlakyEngine {
    fn open(&self) -> StateResult<Box<dyn crate::engine::KvConn + '_>> {
        Ok(Box::new(FlakyConn {
            inner: self.inner.open()?,
            fail_writes: self.fail_writes.clone(),
            fail_deletes: self.fail_deletes.clone(),
            write_delay_ms: self.write_delay_ms.clone(),
            writes_started: self.writes_started.clone(),
        }))
    }
}

#[cfg(test)]
struct FlakyConn<'a> {
    inner: Box<dyn crate::engine::KvConn + 'a>,
    fail_writes: Arc<std::sync::atomic::AtomicBool>,
    fail_deletes: Arc<std::sync::atomic::AtomicBool>,
    write_delay_ms: Arc<std::sync::atomic::AtomicU64>,
    writes_started: Arc<std::sync::atomic::AtomicUsize>,
}

#[cfg(test)]
fn flaky_check(fail: &std::sync::atomic::AtomicBool) -> StateResult<()> {
    if fail.load(std::sync::atomic::Ordering::SeqCst) {
        Err(StateError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "disk full",
        )))
    } else {
        Ok(())
    }
}

#[cfg(test)]
impl FlakyConn<'_> {
    fn check(&self) -> StateResult<()> {
        flaky_check(&self.fail_writes)
    }
}

#[cfg(test)]
impl crate::engine::KvConn for FlakyConn<'_> {
    fn get(&mut self, key: &str) -> StateResult<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    fn set(&mut self, key: &str, value: &[u8]) -> StateResult<()> {
        self.check()?;
        self.inner.set(key, value)
    }

    fn set_all(&mut self, entries: &[(&str, Vec<u8>)]) -> StateResult<()> {
        self.writes_started
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let delay = self
            .write_delay_ms
            .load(std::sync::atomic::Ordering::SeqCst);
        std::thread::sleep(std::time::Duration::from_millis(delay));
        self.check()?;
        self.inner.set_all(entries)
    }

    fn delete(&mut self, key: &str) -> StateResult<()> {
        flaky_check(&self.fail_deletes)?;
        self.inner.delete(key)
    }

    fn close(self: Box<Self>) -> StateResult<()> {
        self.inner.close()
    }
}

#[test]
fn cold_start_is_empty() -> StateResult<()> {
    let store = KvStore::with_engine("rule1", Arc::new(crate::engine::MemEngine::new()), 3)?;
    assert_eq!(store.checkpoints(), Vec::<CheckpointId>::new());
    assert_eq!(store.get_op_state("op1")?, StateMap::new());
    Ok(())
}

#[test]
fn zero_retention_is_rejected() {
    let res = KvStore::with_engine("rule1", Arc::new(crate::engine::MemEngine::new()), 0);
    assert!(matches!(res, Err(StateError::InvalidArg(_))));
}

#[test]
fn resume_from_newest_after_reopen() -> StateResult<()> {
    let dir = tempfile::tempdir()?;
    let config = CheckpointConfig {
        data_dir: dir.path().to_owned(),
        max_retained: 3,
    };
    {
        let store = KvStore::open("rule1", &config)?;
        checkpoint_all(&store, 1, 1)?;
        checkpoint_all(&store, 2, 2)?;
        store.wait_for_evictions();
    }
    assert!(config.rule_dir("rule1").join(DB_FILE_NAME).exists());

    let store = KvStore::open("rule1", &config)?;
    assert_eq!(store.checkpoints(), vec![1, 2]);
    assert_eq!(store.get_op_state("op1")?, op_state(&[("n", 2)]));
    assert_eq!(store.get_op_state("op2")?, op_state(&[("m", 20)]));
    // Older retained checkpoints are restored too.
    let first = store.snapshot(1).expect("checkpoint 1 is retained");
    assert_eq!(first.get("op1"), Some(&op_state(&[("n", 1)])));
    Ok(())
}

#[test]
fn retention_is_bounded() -> StateResult<()> {
    let engine = crate::engine::MemEngine::new();
    let store = KvStore::with_engine("rule1", Arc::new(engine.clone()), 3)?;
    for checkpoint_id in 1..=5 {
        checkpoint_all(&store, checkpoint_id, checkpoint_id)?;
        assert!(store.checkpoints().len() <= 3);
    }
    store.wait_for_evictions();

    assert_eq!(store.checkpoints(), vec![3, 4, 5]);
    assert_eq!(store.snapshot(1), None);
    assert_eq!(
        engine.keys(),
        vec!["3".to_owned(), "4".to_owned(), "5".to_owned(), "checkpoints".to_owned()]
    );
    Ok(())
}

#[test]
fn ids_need_not_be_contiguous() -> StateResult<()> {
    let store = KvStore::with_engine("rule1", Arc::new(crate::engine::MemEngine::new()), 2)?;
    for checkpoint_id in [10, 20, 35] {
        checkpoint_all(&store, checkpoint_id, checkpoint_id)?;
    }
    assert_eq!(store.checkpoints(), vec![20, 35]);
    Ok(())
}

#[test]
fn operators_are_isolated() -> StateResult<()> {
    let store = KvStore::with_engine("rule1", Arc::new(crate::engine::MemEngine::new()), 3)?;
    store.save_state(1, "op1", op_state(&[("n", 1)]))?;
    // Saving again for the same checkpoint replaces only that operator.
    store.save_state(1, "op1", op_state(&[("n", 2)]))?;
    store.save_state(1, "op2", op_state(&[("n", 9)]))?;
    store.save_checkpoint(1)?;

    assert_eq!(store.get_op_state("op1")?, op_state(&[("n", 2)]));
    assert_eq!(store.get_op_state("op2")?, op_state(&[("n", 9)]));
    assert_eq!(store.get_op_state("op3")?, StateMap::new());
    Ok(())
}

#[test]
fn operators_save_concurrently() -> StateResult<()> {
    let store = KvStore::with_engine("rule1", Arc::new(crate::engine::MemEngine::new()), 3)?;
    let ops: Vec<String> = (0..8).map(|i| format!("op{i}")).collect();

    std::thread::scope(|s| {
        for (i, op_id) in ops.iter().enumerate() {
            let store = &store;
            s.spawn(move || {
                for checkpoint_id in [1, 2] {
                    let n = i as i64 * 10 + checkpoint_id;
                    store
                        .save_state(checkpoint_id, op_id, op_state(&[("n", n)]))
                        .expect("save_state failed");
                }
            });
        }
    });
    store.save_checkpoint(1)?;
    store.save_checkpoint(2)?;

    for (i, op_id) in ops.iter().enumerate() {
        assert_eq!(store.get_op_state(op_id)?, op_state(&[("n", i as i64 * 10 + 2)]));
    }
    let first = store.snapshot(1).expect("checkpoint 1 is retained");
    assert_eq!(first.len(), ops.len());
    Ok(())
}

#[test]
fn concurrent_saves_keep_every_checkpoint() -> StateResult<()> {
    use std::sync::atomic::Ordering;

    let engine = FlakyEngine::default();
    let store = KvStore::with_engine("rule1", Arc::new(engine.clone()), 3)?;
    for checkpoint_id in [1, 2] {
        store.save_state(checkpoint_id, "op1", op_state(&[("n", checkpoint_id)]))?;
    }
    engine.write_delay_ms.store(200, Ordering::SeqCst);

    std::thread::scope(|s| -> StateResult<()> {
        let first = s.spawn(|| store.save_checkpoint(1));
        while engine.writes_started.load(Ordering::SeqCst) == 0 {
            std::thread::yield_now();
        }
        // Checkpoint 1 is being written; it can't change any more.
        assert!(matches!(
            store.save_state(1, "op2", StateMap::new()),
            Err(StateError::StaleCheckpoint { .. })
        ));
        let second = s.spawn(|| store.save_checkpoint(2));

        first.join().expect("save of 1 panicked")?;
        second.join().expect("save of 2 panicked")?;
        Ok(())
    })?;

    assert_eq!(store.checkpoints(), vec![1, 2]);
    assert_eq!(store.get_op_state("op1")?, op_state(&[("n", 2)]));
    assert_eq!(store.snapshot(1).map(|snapshot| snapshot.len()), Some(1));

    let mut conn = engine.inner.open()?;
    let durable: Option<Vec<CheckpointId>> = get_json(conn.as_mut(), CHECKPOINT_LIST_KEY)?;
    assert_eq!(durable, Some(vec![1, 2]));
    Ok(())
}

#[test]
fn non_finite_floats_survive_reopen() -> StateResult<()> {
    use crate::functions::acc::AccValue;
    use crate::functions::acc::AccumulatorStatus;
    use crate::state::StateValue;
    use crate::value::Value;

    let dir = tempfile::tempdir()?;
    let config = CheckpointConfig::new(dir.path());
    let state: StateMap = [
        ("inf", StateValue::Value(Value::Float(f64::INFINITY))),
        ("ninf", StateValue::Value(Value::Float(f64::NEG_INFINITY))),
        ("nan", StateValue::Value(Value::Float(f64::NAN))),
        (
            "sum",
            StateValue::Acc(AccumulatorStatus {
                value: Some(AccValue::Sum(f64::INFINITY)),
                has_begun: true,
            }),
        ),
    ]
    .into_iter()
    .map(|(key, value)| (key.to_owned(), value))
    .collect();
    {
        let store = KvStore::open("rule1", &config)?;
        store.save_state(1, "op1", state)?;
        store.save_checkpoint(1)?;
    }

    let store = KvStore::open("rule1", &config)?;
    let found = store.get_op_state("op1")?;
    assert_eq!(
        found.get("inf"),
        Some(&StateValue::Value(Value::Float(f64::INFINITY)))
    );
    assert_eq!(
        found.get("ninf"),
        Some(&StateValue::Value(Value::Float(f64::NEG_INFINITY)))
    );
    assert!(matches!(
        found.get("nan"),
        Some(StateValue::Value(Value::Float(x))) if x.is_nan()
    ));
    assert_eq!(
        found.get("sum"),
        Some(&StateValue::Acc(AccumulatorStatus {
            value: Some(AccValue::Sum(f64::INFINITY)),
            has_begun: true,
        }))
    );
    Ok(())
}

#[test]
fn drop_inside_async_context() -> StateResult<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(async {
        let store = KvStore::with_engine("rule1", Arc::new(crate::engine::MemEngine::new()), 1)?;
        checkpoint_all(&store, 1, 1)?;
        checkpoint_all(&store, 2, 2)?;
        drop(store);
        Ok::<(), StateError>(())
    })
}

#[test]
fn stale_and_unknown_checkpoints_are_rejected() -> StateResult<()> {
    let store = KvStore::with_engine("rule1", Arc::new(crate::engine::MemEngine::new()), 3)?;
    checkpoint_all(&store, 5, 5)?;

    assert!(matches!(
        store.save_state(5, "op1", StateMap::new()),
        Err(StateError::StaleCheckpoint { .. })
    ));
    assert!(matches!(
        store.save_state(3, "op1", StateMap::new()),
        Err(StateError::StaleCheckpoint { .. })
    ));
    assert!(matches!(
        store.save_checkpoint(5),
        Err(StateError::StaleCheckpoint { .. })
    ));
    assert!(matches!(
        store.save_checkpoint(6),
        Err(StateError::UnknownCheckpoint(6))
    ));
    assert_eq!(store.checkpoints(), vec![5]);
    Ok(())
}

#[test]
fn abandoned_pending_checkpoints_are_dropped() -> StateResult<()> {
    let store = KvStore::with_engine("rule1", Arc::new(crate::engine::MemEngine::new()), 3)?;
    store.save_state(1, "op1", op_state(&[("n", 1)]))?;
    store.save_state(3, "op1", op_state(&[("n", 3)]))?;
    checkpoint_all(&store, 2, 2)?;

    assert_eq!(store.snapshot(1), None);
    assert!(store.snapshot(3).is_some());
    store.save_checkpoint(3)?;
    assert_eq!(store.checkpoints(), vec![2, 3]);
    Ok(())
}

#[test]
fn failed_write_keeps_previous_checkpoint() -> StateResult<()> {
    let engine = FlakyEngine::default();
    let store = KvStore::with_engine("rule1", Arc::new(engine.clone()), 3)?;
    checkpoint_all(&store, 1, 1)?;

    engine
        .fail_writes
        .store(true, std::sync::atomic::Ordering::SeqCst);
    store.save_state(2, "op1", op_state(&[("n", 2)]))?;
    assert!(matches!(store.save_checkpoint(2), Err(StateError::Io(_))));
    assert_eq!(store.checkpoints(), vec![1]);
    assert_eq!(store.get_op_state("op1")?, op_state(&[("n", 1)]));
    assert!(!engine.inner.contains("2"));

    // The pending checkpoint can be retried.
    engine
        .fail_writes
        .store(false, std::sync::atomic::Ordering::SeqCst);
    store.save_checkpoint(2)?;
    assert_eq!(store.checkpoints(), vec![1, 2]);
    Ok(())
}

#[test]
fn failed_eviction_is_not_fatal() -> StateResult<()> {
    let engine = FlakyEngine::default();
    let store = KvStore::with_engine("rule1", Arc::new(engine.clone()), 1)?;
    engine
        .fail_deletes
        .store(true, std::sync::atomic::Ordering::SeqCst);
    checkpoint_all(&store, 1, 1)?;
    checkpoint_all(&store, 2, 2)?;
    store.wait_for_evictions();

    assert_eq!(store.checkpoints(), vec![2]);
    assert_eq!(store.snapshot(1), None);
    // The stale record is left behind.
    assert!(engine.inner.contains("1"));
    Ok(())
}

#[test]
fn missing_payload_fails_restore() -> StateResult<()> {
    let engine = crate::engine::MemEngine::new();
    {
        let store = KvStore::with_engine("rule1", Arc::new(engine.clone()), 3)?;
        checkpoint_all(&store, 1, 1)?;
        checkpoint_all(&store, 2, 2)?;
    }
    engine.remove_raw("1");
    let res = KvStore::with_engine("rule1", Arc::new(engine.clone()), 3);
    assert!(matches!(
        res,
        Err(StateError::Integrity {
            checkpoint_id: 1,
            ..
        })
    ));

    engine.put_raw("1", b"{broken");
    let res = KvStore::with_engine("rule1", Arc::new(engine), 3);
    assert!(matches!(
        res,
        Err(StateError::Integrity {
            checkpoint_id: 1,
            ..
        })
    ));
    Ok(())
}

#[test]
fn clean_drops_everything() -> StateResult<()> {
    let engine = crate::engine::MemEngine::new();
    let store = KvStore::with_engine("rule1", Arc::new(engine.clone()), 3)?;
    checkpoint_all(&store, 1, 1)?;
    checkpoint_all(&store, 2, 2)?;
    store.wait_for_evictions();

    store.clean()?;
    assert_eq!(store.checkpoints(), Vec::<CheckpointId>::new());
    assert_eq!(store.get_op_state("op1")?, StateMap::new());
    assert_eq!(engine.keys(), Vec::<String>::new());

    // IDs can start over after a clean.
    checkpoint_all(&store, 1, 7)?;
    assert_eq!(store.get_op_state("op1")?, op_state(&[("n", 7)]));
    Ok(())
}

#[test]
fn store_follows_qos() -> StateResult<()> {
    let dir = tempfile::tempdir()?;
    let config = CheckpointConfig::new(dir.path());

    let volatile = create_store("rule1", Qos::AtMostOnce, &config)?;
    volatile.save_state(1, "op1", op_state(&[("n", 1)]))?;
    volatile.save_checkpoint(1)?;
    assert_eq!(volatile.get_op_state("op1")?, StateMap::new());
    assert!(!config.rule_dir("rule1").exists());

    let durable = create_store("rule1", Qos::ExactlyOnce, &config)?;
    durable.save_state(1, "op1", op_state(&[("n", 1)]))?;
    durable.save_checkpoint(1)?;
    assert_eq!(durable.get_op_state("op1")?, op_state(&[("n", 1)]));
    Ok(())
}

#[test]
fn config_from_json() -> StateResult<()> {
    let config = CheckpointConfig::from_json(r#"{"data_dir": "/tmp/x", "max_retained": 5}"#)?;
    assert_eq!(config.data_dir, PathBuf::from("/tmp/x"));
    assert_eq!(config.max_retained, 5);
    assert_eq!(
        config.rule_dir("r"),
        PathBuf::from("/tmp/x").join("r").join("checkpoints")
    );

    let config = CheckpointConfig::from_json("{}")?;
    assert_eq!(config, CheckpointConfig::default());

    let qos: Qos = serde_json::from_str(r#""at_least_once""#).map_err(StateError::Decode)?;
    assert_eq!(qos, Qos::AtLeastOnce);
    Ok(())
}
