use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::Instant;

use crate::coordinator::{FetchCoordinator, Hydrated};
use crate::error::GridError;
use crate::registry::Lease;
use crate::signal::Signal;
use crate::transport::{ColumnId, DatasetId, RowId};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellKey {
    pub dataset_id: DatasetId,
    pub row_id: RowId,
    pub column_id: ColumnId,
}

impl CellKey {
    pub fn new(
        dataset_id: impl Into<DatasetId>,
        row_id: impl Into<RowId>,
        column_id: impl Into<ColumnId>,
    ) -> Self {
        CellKey {
            dataset_id: dataset_id.into(),
            row_id: row_id.into(),
            column_id: column_id.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum FetchState {
    #[default]
    Idle,
    /// Waiting in the coordinator's pending set.
    Queued,
    /// Part of a batch that has been sent.
    InFlight,
    /// The last batch covering this cell failed; not retried automatically.
    Failed(GridError),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributeState {
    pub value: Option<String>,
    /// Number of successful populations so far.
    pub version: u64,
    /// `None` exactly when `value` is `None`.
    pub populated_at: Option<DateTime<Utc>>,
    pub fetch: FetchState,
    pub(crate) populated_instant: Option<Instant>,
    pub(crate) applied_batch: u64,
}

/// Cached value of one (dataset, row, column) cell.
pub struct CellAttribute {
    key: CellKey,
    coordinator: Lease<DatasetId, FetchCoordinator>,
    stale_threshold: Duration,
    state: Signal<AttributeState>,
}

impl CellAttribute {
    pub fn new(
        key: CellKey,
        coordinator: Lease<DatasetId, FetchCoordinator>,
        stale_threshold: Duration,
    ) -> Self {
        let hydrated = coordinator.take_hydrated(&key.row_id, &key.column_id);
        let state = match hydrated {
            Some(h) => AttributeState {
                value: Some(h.value),
                version: h.version,
                populated_at: Some(h.populated_at),
                fetch: FetchState::Idle,
                populated_instant: Some(h.populated_instant),
                applied_batch: h.batch_seq,
            },
            None => AttributeState::default(),
        };

        CellAttribute {
            key,
            coordinator,
            stale_threshold,
            state: Signal::new(state),
        }
    }

    pub fn key(&self) -> &CellKey {
        &self.key
    }

    /// Requests population unless a fresh value is already cached.
    ///
    /// A non-forced call is also a no-op while a request for this cell is
    /// queued or in flight. Returns whether a request was queued.
    pub fn populate(&self, force: bool) -> bool {
        let (has_value, outstanding) = self.state.with(|s| {
            (
                s.value.is_some(),
                matches!(s.fetch, FetchState::Queued | FetchState::InFlight),
            )
        });

        if !force {
            if outstanding {
                return false;
            }
            if has_value && !self.is_stale() {
                return false;
            }
            if has_value {
                log::debug!("cell {:?}: stale, re-fetching", self.key);
            }
        }

        self.state.mutate(|s| s.fetch = FetchState::Queued);
        self.coordinator
            .populate_attribute(&self.key.row_id, &self.key.column_id);
        true
    }

    /// Withdraws a not-yet-dispatched request; a sent batch is not aborted.
    pub fn cancel_populate(&self) -> bool {
        let removed = self
            .coordinator
            .cancel_populate_attribute(&self.key.row_id, &self.key.column_id);
        if removed {
            self.state.mutate_if(|s| {
                if s.fetch == FetchState::Queued {
                    s.fetch = FetchState::Idle;
                    true
                } else {
                    false
                }
            });
        }
        removed
    }

    pub fn is_stale(&self) -> bool {
        self.state.with(|s| match s.populated_instant {
            Some(at) => at.elapsed() > self.stale_threshold,
            None => false,
        })
    }

    /// Applies a batch result. Results from a batch older than the last one
    /// applied are discarded.
    pub(crate) fn set_value(&self, value: String, batch_seq: u64) -> bool {
        self.state.mutate_if(|s| {
            if batch_seq <= s.applied_batch {
                log::debug!(
                    "cell {:?}: dropping result of batch {} (already at {})",
                    self.key,
                    batch_seq,
                    s.applied_batch
                );
                return false;
            }
            s.value = Some(value);
            s.version += 1;
            s.populated_at = Some(Utc::now());
            s.populated_instant = Some(Instant::now());
            s.applied_batch = batch_seq;
            if s.fetch == FetchState::InFlight {
                s.fetch = FetchState::Idle;
            }
            true
        })
    }

    pub(crate) fn mark_in_flight(&self) {
        self.state.mutate_if(|s| {
            if s.fetch == FetchState::Queued {
                s.fetch = FetchState::InFlight;
                true
            } else {
                false
            }
        });
    }

    /// Returns a cell the server sent nothing for to `Idle`.
    pub(crate) fn settle_in_flight(&self) {
        self.state.mutate_if(|s| {
            if s.fetch == FetchState::InFlight {
                s.fetch = FetchState::Idle;
                true
            } else {
                false
            }
        });
    }

    pub(crate) fn mark_failed(&self, error: &GridError) {
        self.state.mutate_if(|s| {
            if s.fetch == FetchState::InFlight {
                s.fetch = FetchState::Failed(error.clone());
                true
            } else {
                false
            }
        });
    }

    pub fn value(&self) -> Option<String> {
        self.state.with(|s| s.value.clone())
    }

    pub fn version(&self) -> u64 {
        self.state.with(|s| s.version)
    }

    pub fn populated_at(&self) -> Option<DateTime<Utc>> {
        self.state.with(|s| s.populated_at)
    }

    pub fn fetch_state(&self) -> FetchState {
        self.state.with(|s| s.fetch.clone())
    }

    pub fn state(&self) -> AttributeState {
        self.state.get()
    }

    pub fn signal(&self) -> &Signal<AttributeState> {
        &self.state
    }

    pub(crate) fn hydrated(&self) -> Option<Hydrated> {
        self.state.with(|s| {
            Some(Hydrated {
                value: s.value.clone()?,
                version: s.version,
                populated_at: s.populated_at?,
                populated_instant: s.populated_instant?,
                batch_seq: s.applied_batch,
            })
        })
    }
}

impl Drop for CellAttribute {
    fn drop(&mut self) {
        // teardown before the batch is sent withdraws the request
        if self.state.with(|s| s.fetch == FetchState::Queued) {
            self.coordinator
                .cancel_populate_attribute(&self.key.row_id, &self.key.column_id);
        }
        if self.coordinator.hydrates_evicted_cells() {
            if let Some(hydrated) = self.hydrated() {
                self.coordinator
                    .store_hydrated(&self.key.row_id, &self.key.column_id, hydrated);
            }
        }
    }
}

impl std::fmt::Debug for CellAttribute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellAttribute")
            .field("key", &self.key)
            .field("state", &self.state)
            .finish()
    }
}
