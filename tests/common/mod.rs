#![allow(dead_code)]

use async_trait::async_trait;
use lazygrid::{
    AppContext, CellKey, ColumnId, GridConfig, GridError, ObjectDefinition, RecordingTransport,
    RecordsData, RowId, RowIdPage, SimulatedTransport, Transport,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

pub const DATASET: &str = "object-1";

pub fn config() -> GridConfig {
    GridConfig::default()
}

pub fn key(row_id: &str, column_id: &str) -> CellKey {
    CellKey::new(DATASET, row_id, column_id)
}

/// Context over the simulated backend with every request recorded.
pub fn recorded_context(config: GridConfig) -> (AppContext, Arc<RecordingTransport>) {
    let recorder = Arc::new(RecordingTransport::new(Arc::new(SimulatedTransport::new(&config))));
    let ctx = AppContext::new(config, recorder.clone()).unwrap();
    (ctx, recorder)
}

/// Context whose backend can be told to fail its next N calls of each kind.
pub fn flaky_context(config: GridConfig) -> (AppContext, Arc<FlakyTransport>, Arc<RecordingTransport>) {
    let flaky = Arc::new(FlakyTransport::new(&config));
    let recorder = Arc::new(RecordingTransport::new(flaky.clone()));
    let ctx = AppContext::new(config, recorder.clone()).unwrap();
    (ctx, flaky, recorder)
}

pub struct FlakyTransport {
    inner: SimulatedTransport,
    failing_definitions: AtomicUsize,
    failing_row_ids: AtomicUsize,
    failing_records: AtomicUsize,
}

impl FlakyTransport {
    pub fn new(config: &GridConfig) -> Self {
        FlakyTransport {
            inner: SimulatedTransport::new(config),
            failing_definitions: AtomicUsize::new(0),
            failing_row_ids: AtomicUsize::new(0),
            failing_records: AtomicUsize::new(0),
        }
    }

    pub fn fail_next_definitions(&self, n: usize) {
        self.failing_definitions.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_row_ids(&self, n: usize) {
        self.failing_row_ids.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_records(&self, n: usize) {
        self.failing_records.store(n, Ordering::SeqCst);
    }
}

fn take_failure(counter: &AtomicUsize, what: &str) -> Result<(), GridError> {
    match counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)) {
        Ok(_) => Err(GridError::TransportFailure(format!("{} unavailable", what))),
        Err(_) => Ok(()),
    }
}

#[async_trait]
impl Transport for FlakyTransport {
    async fn fetch_object_definition(&self, dataset_id: &str) -> lazygrid::Result<Option<ObjectDefinition>> {
        take_failure(&self.failing_definitions, "definitions")?;
        self.inner.fetch_object_definition(dataset_id).await
    }

    async fn fetch_row_ids(&self, dataset_id: &str, limit: usize, offset: usize) -> lazygrid::Result<RowIdPage> {
        take_failure(&self.failing_row_ids, "row ids")?;
        self.inner.fetch_row_ids(dataset_id, limit, offset).await
    }

    async fn fetch_records_data(
        &self,
        dataset_id: &str,
        row_ids: &[RowId],
        column_ids: &[ColumnId],
    ) -> lazygrid::Result<RecordsData> {
        take_failure(&self.failing_records, "records")?;
        self.inner.fetch_records_data(dataset_id, row_ids, column_ids).await
    }
}
