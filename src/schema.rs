use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::sync::{Arc, Mutex};

use crate::error::{GridError, Result};
use crate::registry::lock;
use crate::signal::Signal;
use crate::transport::{Column, DatasetId, ObjectDefinition, Transport};

#[derive(Debug, Clone, PartialEq)]
pub enum SchemaState {
    /// Nothing fetched yet, or a fetch is outstanding.
    Loading,
    Ready(Arc<ObjectDefinition>),
    NotFound,
    Failed(GridError),
}

type SharedFetch = Shared<BoxFuture<'static, Result<Arc<ObjectDefinition>>>>;

/// Column definitions of one dataset, fetched once and shared by every consumer.
pub struct ObjectSchema {
    dataset_id: DatasetId,
    transport: Arc<dyn Transport>,
    state: Signal<SchemaState>,
    in_flight: Mutex<Option<(u64, SharedFetch)>>,
    fetch_seq: Mutex<u64>,
}

impl ObjectSchema {
    pub fn new(dataset_id: impl Into<DatasetId>, transport: Arc<dyn Transport>) -> Self {
        ObjectSchema {
            dataset_id: dataset_id.into(),
            transport,
            state: Signal::new(SchemaState::Loading),
            in_flight: Mutex::new(None),
            fetch_seq: Mutex::new(0),
        }
    }

    pub fn dataset_id(&self) -> &str {
        &self.dataset_id
    }

    /// Resolves the dataset definition.
    ///
    /// Concurrent callers share one request. A failure is not cached and the
    /// next call issues a fresh fetch.
    pub async fn definition(&self) -> Result<Arc<ObjectDefinition>> {
        if let SchemaState::Ready(def) = self.state.get() {
            return Ok(def);
        }

        let (seq, fetch) = self.shared_fetch();
        let outcome = fetch.await;
        self.settle(seq, &outcome);
        outcome
    }

    pub async fn columns(&self) -> Result<Vec<Column>> {
        Ok(self.definition().await?.columns.clone())
    }

    /// Columns if already resolved; empty while loading or after a failure.
    pub fn columns_now(&self) -> Vec<Column> {
        self.state.with(|state| match state {
            SchemaState::Ready(def) => def.columns.clone(),
            _ => Vec::new(),
        })
    }

    pub fn column_at(&self, index: usize) -> Option<Column> {
        self.state.with(|state| match state {
            SchemaState::Ready(def) => def.columns.get(index).cloned(),
            _ => None,
        })
    }

    pub fn column_count(&self) -> Option<usize> {
        self.state.with(|state| match state {
            SchemaState::Ready(def) => Some(def.columns.len()),
            _ => None,
        })
    }

    pub fn state(&self) -> SchemaState {
        self.state.get()
    }

    pub fn signal(&self) -> &Signal<SchemaState> {
        &self.state
    }

    fn shared_fetch(&self) -> (u64, SharedFetch) {
        let mut in_flight = lock(&self.in_flight);
        if let Some((seq, fetch)) = in_flight.as_ref() {
            log::debug!("schema {}: joining in-flight fetch", self.dataset_id);
            return (*seq, fetch.clone());
        }

        let seq = {
            let mut next = lock(&self.fetch_seq);
            *next += 1;
            *next
        };
        let transport = Arc::clone(&self.transport);
        let dataset_id = self.dataset_id.clone();
        let fetch = async move {
            match transport.fetch_object_definition(&dataset_id).await {
                Ok(Some(def)) => Ok(Arc::new(def)),
                Ok(None) => Err(GridError::dataset_not_found(dataset_id)),
                Err(e) => Err(e),
            }
        }
        .boxed()
        .shared();

        log::debug!("schema {}: fetching definition", self.dataset_id);
        *in_flight = Some((seq, fetch.clone()));
        (seq, fetch)
    }

    fn settle(&self, seq: u64, outcome: &Result<Arc<ObjectDefinition>>) {
        {
            let mut in_flight = lock(&self.in_flight);
            match in_flight.as_ref() {
                Some((current, _)) if *current == seq => *in_flight = None,
                // someone else already settled this fetch
                _ => return,
            }
        }

        let next = match outcome {
            Ok(def) => SchemaState::Ready(Arc::clone(def)),
            Err(e) if e.is_not_found() => {
                log::warn!("schema {}: dataset not found", self.dataset_id);
                SchemaState::NotFound
            }
            Err(e) => {
                log::error!("schema {}: {}", self.dataset_id, e);
                SchemaState::Failed(e.clone())
            }
        };
        self.state.set(next);
    }
}

impl std::fmt::Debug for ObjectSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectSchema")
            .field("dataset_id", &self.dataset_id)
            .field("state", &self.state)
            .finish()
    }
}
