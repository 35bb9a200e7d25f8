use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

use crate::coordinator::FetchCoordinator;
use crate::error::{GridError, Result};
use crate::registry::{Lease, lock};
use crate::signal::Signal;
use crate::transport::{DatasetId, RowId, Transport};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowIdState {
    /// Row ids by index; `None` until the bucket holding the index resolves.
    pub rows: Vec<Option<RowId>>,
    /// Set once the first bucket has resolved; `total_row_count` is only
    /// authoritative from then on.
    pub row_ids_populated: bool,
    pub total_row_count: usize,
    pub last_error: Option<GridError>,
}

struct PagerInner {
    dataset_id: DatasetId,
    bucket_size: usize,
    transport: Arc<dyn Transport>,
    state: Signal<RowIdState>,
    buckets_in_flight: Mutex<HashSet<usize>>,
}

/// Lazily pages a dataset's ordered row ids in fixed-size buckets.
///
/// A pager handed out by the context also holds the dataset's fetch
/// coordinator, so the coordinator lives as long as the table is open.
pub struct RowIdPager {
    inner: Arc<PagerInner>,
    coordinator: Option<Lease<DatasetId, FetchCoordinator>>,
}

impl RowIdPager {
    pub fn new(dataset_id: impl Into<DatasetId>, bucket_size: usize, transport: Arc<dyn Transport>) -> Self {
        RowIdPager {
            inner: Arc::new(PagerInner {
                dataset_id: dataset_id.into(),
                bucket_size: bucket_size.max(1),
                transport,
                state: Signal::new(RowIdState::default()),
                buckets_in_flight: Mutex::new(HashSet::new()),
            }),
            coordinator: None,
        }
    }

    pub(crate) fn holding(mut self, coordinator: Lease<DatasetId, FetchCoordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn dataset_id(&self) -> &str {
        &self.inner.dataset_id
    }

    /// Fetch coordinator of the dataset, when the pager holds one.
    pub fn coordinator(&self) -> Option<&FetchCoordinator> {
        self.coordinator.as_deref()
    }

    pub fn bucket_size(&self) -> usize {
        self.inner.bucket_size
    }

    pub fn bucket_offset(&self, from_index: usize) -> usize {
        self.inner.bucket_offset(from_index)
    }

    /// Fire-and-forget population of the bucket holding `from_index`.
    ///
    /// Returns `None` when that bucket is already being fetched.
    pub fn populate_row_ids(&self, from_index: usize) -> Option<JoinHandle<Result<()>>> {
        let offset = self.inner.claim_bucket(from_index)?;
        let inner = Arc::clone(&self.inner);
        Some(tokio::spawn(async move { inner.fetch_claimed_bucket(offset).await }))
    }

    /// Same as [`populate_row_ids`](Self::populate_row_ids) but awaited in place.
    ///
    /// Returns `Ok(false)` when the bucket was already in flight.
    pub async fn fetch_bucket(&self, from_index: usize) -> Result<bool> {
        match self.inner.claim_bucket(from_index) {
            Some(offset) => self.inner.fetch_claimed_bucket(offset).await.map(|_| true),
            None => Ok(false),
        }
    }

    pub fn row_id_at(&self, index: usize) -> Option<RowId> {
        self.inner
            .state
            .with(|s| s.rows.get(index).cloned().flatten())
    }

    /// Returns the row id at `index`, requesting its bucket when it is missing.
    pub fn ensure_row_id_at(&self, index: usize) -> Option<RowId> {
        if let Some(row_id) = self.row_id_at(index) {
            return Some(row_id);
        }
        let out_of_range = self
            .inner
            .state
            .with(|s| s.row_ids_populated && index >= s.total_row_count);
        if !out_of_range {
            self.populate_row_ids(index);
        }
        None
    }

    pub fn total_row_count(&self) -> usize {
        self.inner.state.with(|s| s.total_row_count)
    }

    pub fn row_ids_populated(&self) -> bool {
        self.inner.state.with(|s| s.row_ids_populated)
    }

    pub fn is_bucket_in_flight(&self, offset: usize) -> bool {
        lock(&self.inner.buckets_in_flight).contains(&offset)
    }

    pub fn state(&self) -> RowIdState {
        self.inner.state.get()
    }

    pub fn signal(&self) -> &Signal<RowIdState> {
        &self.inner.state
    }
}

impl PagerInner {
    fn bucket_offset(&self, from_index: usize) -> usize {
        (from_index / self.bucket_size) * self.bucket_size
    }

    fn claim_bucket(&self, from_index: usize) -> Option<usize> {
        let offset = self.bucket_offset(from_index);
        if !lock(&self.buckets_in_flight).insert(offset) {
            log::debug!(
                "rows {}: bucket {} already in flight",
                self.dataset_id,
                offset
            );
            return None;
        }
        Some(offset)
    }

    async fn fetch_claimed_bucket(&self, offset: usize) -> Result<()> {
        log::debug!("rows {}: fetching bucket {}", self.dataset_id, offset);
        let outcome = self
            .transport
            .fetch_row_ids(&self.dataset_id, self.bucket_size, offset)
            .await;

        let result = match outcome {
            Ok(page) => {
                self.state.mutate(|s| {
                    let total = page.total_row_count;
                    let end = (offset + page.rows.len()).min(total);
                    if s.rows.len() < end {
                        s.rows.resize(end, None);
                    }
                    for (local, row) in page.rows.into_iter().enumerate() {
                        let index = offset + local;
                        // ignore ids past the end of the dataset
                        if index >= total {
                            break;
                        }
                        s.rows[index] = Some(row.id);
                    }
                    s.row_ids_populated = true;
                    s.total_row_count = total;
                    s.last_error = None;
                });
                Ok(())
            }
            Err(e) => {
                log::error!("rows {}: bucket {} failed: {}", self.dataset_id, offset, e);
                self.state.mutate(|s| s.last_error = Some(e.clone()));
                Err(e)
            }
        };

        lock(&self.buckets_in_flight).remove(&offset);
        result
    }
}

impl std::fmt::Debug for RowIdPager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowIdPager")
            .field("dataset_id", &self.inner.dataset_id)
            .field("bucket_size", &self.inner.bucket_size)
            .finish()
    }
}
