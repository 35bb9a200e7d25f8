//! Per-dataset batching of cell fetches.
//!
//! Cells ask the coordinator to populate `(row, column)` pairs. Requests land
//! in a pending set; the first request of a burst arms a single dispatch
//! timer (no delay for the very first batch of a dataset, the debounce window
//! afterwards). When the timer fires the pending set is drained into one
//! `fetch_records_data` call for the rows × columns it references, and the
//! results are fanned back out to the live cell entries.
//!
//! At most one dispatch is armed or in flight per dataset. Requests that
//! arrive while a batch is in flight wait in the pending set and are picked
//! up by a trailing batch once the current one has been applied. An armed or
//! in-flight dispatch holds a lease on its coordinator, so the coordinator
//! stays registered until the batch has been applied.
//!
//! Dispatches run on the tokio runtime of the caller. The zero-delay first
//! batch only gathers a whole burst of requests when that burst is queued
//! before the runtime gets to run the dispatch task, which a current-thread
//! runtime guarantees for requests made without an intervening `.await`.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::attribute::{CellAttribute, CellKey};
use crate::error::Result;
use crate::registry::{Lease, WeakRegistry, lock};
use crate::signal::Signal;
use crate::transport::{ColumnId, DatasetId, RowId, Transport};

/// A fetched value parked for a cell entry that did not exist when it arrived.
#[derive(Debug, Clone, PartialEq)]
pub struct Hydrated {
    pub value: String,
    pub version: u64,
    pub populated_at: DateTime<Utc>,
    pub populated_instant: Instant,
    pub batch_seq: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    pub batches_dispatched: u64,
    pub batches_failed: u64,
    pub cells_applied: u64,
    /// Results that arrived for cells no longer cached.
    pub cells_orphaned: u64,
}

#[derive(Debug, Clone, Default)]
pub struct CoordinatorState {
    pub pending_cells_to_fetch: BTreeMap<RowId, BTreeSet<ColumnId>>,
    /// True from arming the timer until the batch it dispatches is applied.
    pub dispatch_armed: bool,
    pub has_populated_any_row_data: bool,
    pub batch_seq: u64,
    pub stats: CoordinatorStats,
}

impl CoordinatorState {
    pub fn pending_count(&self) -> usize {
        self.pending_cells_to_fetch.values().map(BTreeSet::len).sum()
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub debounce_delay: Duration,
    pub hydrate_evicted_cells: bool,
    /// Source of batch sequence numbers. Cells are shared by every
    /// coordinator a context ever creates for a dataset, so the numbers must
    /// keep increasing across coordinators.
    pub batch_counter: Arc<AtomicU64>,
}

impl CoordinatorSettings {
    pub fn new(debounce_delay: Duration, hydrate_evicted_cells: bool) -> Self {
        CoordinatorSettings {
            debounce_delay,
            hydrate_evicted_cells,
            batch_counter: Arc::new(AtomicU64::new(0)),
        }
    }
}

/// Outcome of one dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub batch_seq: u64,
    pub row_ids: Vec<RowId>,
    pub column_ids: Vec<ColumnId>,
    pub cells_applied: usize,
}

struct CoordinatorInner {
    dataset_id: DatasetId,
    transport: Arc<dyn Transport>,
    debounce_delay: Duration,
    hydrate_evicted_cells: bool,
    batch_counter: Arc<AtomicU64>,
    cells: WeakRegistry<CellKey, CellAttribute>,
    owner: OnceLock<WeakRegistry<DatasetId, FetchCoordinator>>,
    state: Signal<CoordinatorState>,
    hydration: Mutex<HashMap<(RowId, ColumnId), Hydrated>>,
    dispatch_task: Mutex<Option<JoinHandle<Result<BatchReport>>>>,
}

pub struct FetchCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl FetchCoordinator {
    pub fn new(
        dataset_id: impl Into<DatasetId>,
        transport: Arc<dyn Transport>,
        settings: CoordinatorSettings,
        cells: WeakRegistry<CellKey, CellAttribute>,
    ) -> Self {
        FetchCoordinator {
            inner: Arc::new(CoordinatorInner {
                dataset_id: dataset_id.into(),
                transport,
                debounce_delay: settings.debounce_delay,
                hydrate_evicted_cells: settings.hydrate_evicted_cells,
                batch_counter: settings.batch_counter,
                cells,
                owner: OnceLock::new(),
                state: Signal::new(CoordinatorState::default()),
                hydration: Mutex::new(HashMap::new()),
                dispatch_task: Mutex::new(None),
            }),
        }
    }

    /// Registry this coordinator lives in; armed dispatches lease it from there.
    pub(crate) fn owned_by(self, registry: WeakRegistry<DatasetId, FetchCoordinator>) -> Self {
        // only ever set right after construction
        let _ = self.inner.owner.set(registry);
        self
    }

    pub fn dataset_id(&self) -> &str {
        &self.inner.dataset_id
    }

    /// Adds `(row_id, column_id)` to the pending set and arms a dispatch if
    /// none is armed. Returns false when the pair was already pending.
    ///
    /// Arming needs a tokio runtime; called outside one the pair stays
    /// pending until a later call from inside a runtime arms the dispatch.
    pub fn populate_attribute(&self, row_id: &str, column_id: &str) -> bool {
        let added = self.inner.state.mutate_if(|s| {
            let columns = s.pending_cells_to_fetch.entry(row_id.to_string()).or_default();
            columns.insert(column_id.to_string())
        });
        if !added {
            return false;
        }
        CoordinatorInner::queue_dispatch(&self.inner);
        true
    }

    /// Removes a pair from the pending set. Only prevents requests that have
    /// not been sent yet; returns whether anything was removed.
    pub fn cancel_populate_attribute(&self, row_id: &str, column_id: &str) -> bool {
        self.inner.state.mutate_if(|s| {
            let Some(columns) = s.pending_cells_to_fetch.get_mut(row_id) else {
                return false;
            };
            let removed = columns.remove(column_id);
            if columns.is_empty() {
                s.pending_cells_to_fetch.remove(row_id);
            }
            removed
        })
    }

    pub fn is_pending(&self, row_id: &str, column_id: &str) -> bool {
        self.inner.state.with(|s| {
            s.pending_cells_to_fetch
                .get(row_id)
                .is_some_and(|columns| columns.contains(column_id))
        })
    }

    pub fn pending_count(&self) -> usize {
        self.inner.state.with(CoordinatorState::pending_count)
    }

    pub fn is_dispatch_armed(&self) -> bool {
        self.inner.state.with(|s| s.dispatch_armed)
    }

    pub fn has_populated_any_row_data(&self) -> bool {
        self.inner.state.with(|s| s.has_populated_any_row_data)
    }

    pub fn stats(&self) -> CoordinatorStats {
        self.inner.state.with(|s| s.stats.clone())
    }

    pub fn state(&self) -> CoordinatorState {
        self.inner.state.get()
    }

    pub fn signal(&self) -> &Signal<CoordinatorState> {
        &self.inner.state
    }

    /// Waits until no dispatch is armed or in flight, following trailing batches.
    pub async fn wait_idle(&self) {
        loop {
            let task = lock(&self.inner.dispatch_task).take();
            match task {
                Some(task) => {
                    // batch failures are already logged and reflected in cell state
                    if let Err(e) = task.await {
                        log::error!("records {}: dispatch task aborted: {}", self.inner.dataset_id, e);
                        // the aborted batch never cleared its marker
                        self.inner.state.mutate(|s| s.dispatch_armed = false);
                    }
                }
                None if !self.is_dispatch_armed() => return,
                None => tokio::task::yield_now().await,
            }
        }
    }

    pub fn hydrates_evicted_cells(&self) -> bool {
        self.inner.hydrate_evicted_cells
    }

    pub(crate) fn take_hydrated(&self, row_id: &str, column_id: &str) -> Option<Hydrated> {
        if !self.inner.hydrate_evicted_cells {
            return None;
        }
        lock(&self.inner.hydration).remove(&(row_id.to_string(), column_id.to_string()))
    }

    pub(crate) fn store_hydrated(&self, row_id: &str, column_id: &str, hydrated: Hydrated) {
        if self.inner.hydrate_evicted_cells {
            lock(&self.inner.hydration).insert((row_id.to_string(), column_id.to_string()), hydrated);
        }
    }

    pub fn hydrated_count(&self) -> usize {
        lock(&self.inner.hydration).len()
    }
}

impl CoordinatorInner {
    fn queue_dispatch(this: &Arc<Self>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::warn!(
                "records {}: no tokio runtime, leaving {} cells pending",
                this.dataset_id,
                this.state.with(CoordinatorState::pending_count)
            );
            return;
        };

        let mut delay = None;
        this.state.mutate_if(|s| {
            if s.dispatch_armed || s.pending_cells_to_fetch.is_empty() {
                return false;
            }
            s.dispatch_armed = true;
            delay = Some(if s.has_populated_any_row_data {
                this.debounce_delay
            } else {
                Duration::ZERO
            });
            true
        });

        let Some(delay) = delay else {
            return;
        };
        log::debug!("records {}: batch armed, delay {:?}", this.dataset_id, delay);

        let inner = Arc::clone(this);
        let keep_alive = this.lease_self();
        // held across the spawn so a trailing batch cannot store its handle first
        let mut slot = lock(&this.dispatch_task);
        *slot = Some(runtime.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let report = CoordinatorInner::run_pending_fetch(&inner).await;
            drop(keep_alive);
            report
        }));
    }

    async fn run_pending_fetch(this: &Arc<Self>) -> Result<BatchReport> {
        let mut pending = BTreeMap::new();
        let mut batch_seq = 0;
        this.state.mutate(|s| {
            pending = std::mem::take(&mut s.pending_cells_to_fetch);
            if !pending.is_empty() {
                batch_seq = this.batch_counter.fetch_add(1, Ordering::SeqCst) + 1;
                s.batch_seq = batch_seq;
            }
        });

        if pending.is_empty() {
            // everything was cancelled before the timer fired
            this.state.mutate(|s| s.dispatch_armed = false);
            CoordinatorInner::queue_dispatch(this);
            return Ok(BatchReport::default());
        }

        let row_ids: Vec<RowId> = pending.keys().cloned().collect();
        let column_ids: Vec<ColumnId> = pending
            .values()
            .flatten()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        for (row_id, columns) in &pending {
            for column_id in columns {
                if let Some(cell) = this.cells.get(&this.cell_key(row_id, column_id)) {
                    cell.mark_in_flight();
                }
            }
        }

        log::info!(
            "records {}: dispatching batch {} ({} rows x {} columns)",
            this.dataset_id,
            batch_seq,
            row_ids.len(),
            column_ids.len()
        );

        let outcome = this
            .transport
            .fetch_records_data(&this.dataset_id, &row_ids, &column_ids)
            .await;

        let result = match outcome {
            Ok(records) => {
                let mut applied = 0;
                let mut orphaned = 0;
                for (row_id, columns) in records {
                    for (column_id, value) in columns {
                        match this.cells.get(&this.cell_key(&row_id, &column_id)) {
                            Some(cell) => {
                                if cell.set_value(value, batch_seq) {
                                    applied += 1;
                                }
                            }
                            None => {
                                orphaned += 1;
                                this.park_result(row_id.clone(), column_id, value, batch_seq);
                            }
                        }
                    }
                }
                for (row_id, columns) in &pending {
                    for column_id in columns {
                        if let Some(cell) = this.cells.get(&this.cell_key(row_id, column_id)) {
                            cell.settle_in_flight();
                        }
                    }
                }

                this.state.mutate(|s| {
                    s.has_populated_any_row_data = true;
                    s.dispatch_armed = false;
                    s.stats.batches_dispatched += 1;
                    s.stats.cells_applied += applied as u64;
                    s.stats.cells_orphaned += orphaned;
                });
                log::debug!(
                    "records {}: batch {} applied to {} cells, {} orphaned",
                    this.dataset_id,
                    batch_seq,
                    applied,
                    orphaned
                );

                Ok(BatchReport {
                    batch_seq,
                    row_ids,
                    column_ids,
                    cells_applied: applied,
                })
            }
            Err(e) => {
                log::error!("records {}: batch {} failed: {}", this.dataset_id, batch_seq, e);
                for (row_id, columns) in &pending {
                    for column_id in columns {
                        if let Some(cell) = this.cells.get(&this.cell_key(row_id, column_id)) {
                            cell.mark_failed(&e);
                        }
                    }
                }
                this.state.mutate(|s| {
                    s.dispatch_armed = false;
                    s.stats.batches_dispatched += 1;
                    s.stats.batches_failed += 1;
                });
                Err(e)
            }
        };

        // the pending set may have grown while the batch was in flight
        CoordinatorInner::queue_dispatch(this);
        result
    }

    fn lease_self(&self) -> Option<Lease<DatasetId, FetchCoordinator>> {
        self.owner.get()?.acquire_existing(&self.dataset_id)
    }

    fn park_result(&self, row_id: RowId, column_id: ColumnId, value: String, batch_seq: u64) {
        if !self.hydrate_evicted_cells {
            return;
        }
        let mut hydration = lock(&self.hydration);
        let version = hydration
            .get(&(row_id.clone(), column_id.clone()))
            .map_or(1, |previous| previous.version + 1);
        hydration.insert(
            (row_id, column_id),
            Hydrated {
                value,
                version,
                populated_at: Utc::now(),
                populated_instant: Instant::now(),
                batch_seq,
            },
        );
    }

    fn cell_key(&self, row_id: &str, column_id: &str) -> CellKey {
        CellKey::new(self.dataset_id.clone(), row_id, column_id)
    }
}

impl std::fmt::Debug for FetchCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchCoordinator")
            .field("dataset_id", &self.inner.dataset_id)
            .field("pending", &self.pending_count())
            .field("armed", &self.is_dispatch_armed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eviction::EvictionPolicy;
    use crate::registry::KeyedRegistry;
    use crate::transport::{ObjectDefinition, RecordsData, RowIdPage, SimulatedTransport};
    use async_trait::async_trait;

    struct PanickingTransport;

    #[async_trait]
    impl Transport for PanickingTransport {
        async fn fetch_object_definition(&self, _: &str) -> Result<Option<ObjectDefinition>> {
            Ok(None)
        }

        async fn fetch_row_ids(&self, _: &str, _: usize, _: usize) -> Result<RowIdPage> {
            panic!("row ids requested")
        }

        async fn fetch_records_data(&self, _: &str, _: &[RowId], _: &[ColumnId]) -> Result<RecordsData> {
            panic!("backend went away")
        }
    }

    fn detached(settings: CoordinatorSettings) -> FetchCoordinator {
        let cells: KeyedRegistry<CellKey, CellAttribute> =
            KeyedRegistry::new("cell-attribute", EvictionPolicy::Immediate);
        FetchCoordinator::new(
            "object-1",
            Arc::new(SimulatedTransport::default()),
            settings,
            cells.downgrade(),
        )
    }

    #[test]
    fn populate_outside_a_runtime_stays_pending() {
        let coordinator = detached(CoordinatorSettings::new(Duration::from_millis(500), false));
        assert!(coordinator.populate_attribute("r1", "c1"));
        assert!(coordinator.is_pending("r1", "c1"));
        assert_eq!(coordinator.pending_count(), 1);
        assert!(!coordinator.is_dispatch_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn pending_pairs_are_armed_once_inside_a_runtime() {
        let coordinator = std::thread::spawn(|| {
            let coordinator = detached(CoordinatorSettings::new(Duration::from_millis(500), false));
            coordinator.populate_attribute("r1", "c1");
            coordinator
        })
        .join()
        .unwrap();
        assert!(!coordinator.is_dispatch_armed());

        coordinator.populate_attribute("r2", "c1");
        assert!(coordinator.is_dispatch_armed());
        coordinator.wait_idle().await;
        assert_eq!(coordinator.pending_count(), 0);
        assert_eq!(coordinator.stats().batches_dispatched, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sequence_numbers_continue_across_coordinators() {
        let settings = CoordinatorSettings::new(Duration::from_millis(500), false);
        let first = detached(settings.clone());
        first.populate_attribute("r1", "c1");
        first.wait_idle().await;
        assert_eq!(first.state().batch_seq, 1);
        drop(first);

        let second = detached(settings);
        second.populate_attribute("r1", "c1");
        second.wait_idle().await;
        assert_eq!(second.state().batch_seq, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn armed_dispatch_keeps_its_coordinator_registered() {
        let coordinators: KeyedRegistry<DatasetId, FetchCoordinator> =
            KeyedRegistry::new("fetch-coordinator", EvictionPolicy::Immediate);
        let owner = coordinators.downgrade();
        let lease = coordinators.acquire_with("object-1".to_string(), |_| {
            detached(CoordinatorSettings::new(Duration::from_millis(500), false)).owned_by(owner)
        });
        lease.populate_attribute("r1", "c1");
        assert_eq!(lease.ref_count(), 2);

        let watcher = lease.signal().subscribe();
        drop(lease);
        assert!(coordinators.contains(&"object-1".to_string()));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(watcher.borrow().stats.batches_dispatched, 1);
        assert!(!coordinators.contains(&"object-1".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn aborted_dispatch_does_not_wedge_the_dataset() {
        let cells: KeyedRegistry<CellKey, CellAttribute> =
            KeyedRegistry::new("cell-attribute", EvictionPolicy::Immediate);
        let coordinator = FetchCoordinator::new(
            "object-1",
            Arc::new(PanickingTransport),
            CoordinatorSettings::new(Duration::from_millis(500), false),
            cells.downgrade(),
        );
        coordinator.populate_attribute("r1", "c1");
        coordinator.wait_idle().await;
        assert!(!coordinator.is_dispatch_armed());

        // the next request arms a fresh dispatch
        coordinator.populate_attribute("r2", "c1");
        assert!(coordinator.is_dispatch_armed());
        coordinator.wait_idle().await;
        assert!(!coordinator.is_dispatch_armed());
    }
}
