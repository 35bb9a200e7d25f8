use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::GridConfig;
use crate::error::{GridError, Result, ensure_dataset_id};
use crate::registry::lock;

pub type DatasetId = String;
pub type RowId = String;
pub type ColumnId = String;

lazy_static! {
    static ref ROW_ID_REGEX: Regex = Regex::new(r"^r([0-9]+)$").unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub id: ColumnId,
    pub name: String,
    pub width: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectDefinition {
    pub id: DatasetId,
    pub name: String,
    pub columns: Vec<Column>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowDescriptor {
    pub id: RowId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowIdPage {
    pub total_row_count: usize,
    pub rows: Vec<RowDescriptor>,
}

/// Dense cross-product result: row id → column id → cell content.
pub type RecordsData = HashMap<RowId, HashMap<ColumnId, String>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordsRequest {
    pub record_ids: Vec<RowId>,
    pub column_ids: Vec<ColumnId>,
}

/// The three server operations the engine consumes.
#[async_trait]
pub trait Transport: Send + Sync {
    /// `Ok(None)` when the dataset is unknown upstream.
    async fn fetch_object_definition(&self, dataset_id: &str) -> Result<Option<ObjectDefinition>>;

    async fn fetch_row_ids(&self, dataset_id: &str, limit: usize, offset: usize) -> Result<RowIdPage>;

    async fn fetch_records_data(
        &self,
        dataset_id: &str,
        row_ids: &[RowId],
        column_ids: &[ColumnId],
    ) -> Result<RecordsData>;
}

/// In-process stand-in for the server: deterministic ids `r<index>` and
/// `c<n>`, cell content `<row>-<column>`, and a fixed latency on every call.
#[derive(Debug, Clone)]
pub struct SimulatedTransport {
    latency: Duration,
    row_count: usize,
    objects: Vec<ObjectDefinition>,
}

impl SimulatedTransport {
    pub fn new(config: &GridConfig) -> Self {
        let objects = (1..=config.simulated_object_count)
            .map(|i| ObjectDefinition {
                id: format!("object-{}", i),
                name: format!("Object {}", i),
                columns: (1..=config.simulated_column_count)
                    .map(|c| Column {
                        id: format!("c{}", c),
                        name: format!("Column {}", c),
                        width: 120,
                    })
                    .collect(),
            })
            .collect();

        SimulatedTransport {
            latency: config.simulated_latency(),
            row_count: config.simulated_row_count,
            objects,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }

    pub fn objects(&self) -> &[ObjectDefinition] {
        &self.objects
    }

    fn object(&self, dataset_id: &str) -> Result<&ObjectDefinition> {
        self.objects
            .iter()
            .find(|o| o.id == dataset_id)
            .ok_or_else(|| GridError::dataset_not_found(dataset_id))
    }

    fn row_index(&self, row_id: &str) -> Option<usize> {
        let caps = ROW_ID_REGEX.captures(row_id)?;
        let index = caps[1].parse::<usize>().ok()?;
        (index < self.row_count).then_some(index)
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        SimulatedTransport::new(&GridConfig::default())
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn fetch_object_definition(&self, dataset_id: &str) -> Result<Option<ObjectDefinition>> {
        ensure_dataset_id(dataset_id)?;
        self.simulate_latency().await;
        Ok(self.objects.iter().find(|o| o.id == dataset_id).cloned())
    }

    async fn fetch_row_ids(&self, dataset_id: &str, limit: usize, offset: usize) -> Result<RowIdPage> {
        ensure_dataset_id(dataset_id)?;
        self.simulate_latency().await;
        self.object(dataset_id)?;

        Ok(RowIdPage {
            total_row_count: self.row_count,
            rows: (0..limit)
                .map(|i| RowDescriptor {
                    id: format!("r{}", offset + i),
                })
                .collect(),
        })
    }

    async fn fetch_records_data(
        &self,
        dataset_id: &str,
        row_ids: &[RowId],
        column_ids: &[ColumnId],
    ) -> Result<RecordsData> {
        ensure_dataset_id(dataset_id)?;
        self.simulate_latency().await;
        let object = self.object(dataset_id)?;

        for column_id in column_ids {
            if !object.columns.iter().any(|c| &c.id == column_id) {
                return Err(GridError::column_not_found(column_id.clone()));
            }
        }

        let mut records = RecordsData::with_capacity(row_ids.len());
        for row_id in row_ids {
            if self.row_index(row_id).is_none() {
                return Err(GridError::row_not_found(row_id.clone()));
            }
            let row = records.entry(row_id.clone()).or_default();
            for column_id in column_ids {
                row.insert(column_id.clone(), format!("{}-{}", row_id, column_id));
            }
        }

        Ok(records)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    ObjectDefinition {
        dataset_id: DatasetId,
    },
    RowIds {
        dataset_id: DatasetId,
        limit: usize,
        offset: usize,
    },
    Records {
        dataset_id: DatasetId,
        row_ids: Vec<RowId>,
        column_ids: Vec<ColumnId>,
    },
}

/// Wraps another transport and keeps a log of every request sent through it.
pub struct RecordingTransport {
    inner: Arc<dyn Transport>,
    calls: Mutex<Vec<TransportCall>>,
}

impl RecordingTransport {
    pub fn new(inner: Arc<dyn Transport>) -> Self {
        RecordingTransport {
            inner,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        lock(&self.calls).clone()
    }

    pub fn object_definition_calls(&self) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| matches!(c, TransportCall::ObjectDefinition { .. }))
            .count()
    }

    /// Offsets of every row-id bucket requested, in request order.
    pub fn row_id_offsets(&self) -> Vec<usize> {
        lock(&self.calls)
            .iter()
            .filter_map(|c| match c {
                TransportCall::RowIds { offset, .. } => Some(*offset),
                _ => None,
            })
            .collect()
    }

    /// `(row_ids, column_ids)` of every batched records request, in request order.
    pub fn record_batches(&self) -> Vec<(Vec<RowId>, Vec<ColumnId>)> {
        lock(&self.calls)
            .iter()
            .filter_map(|c| match c {
                TransportCall::Records {
                    row_ids, column_ids, ..
                } => Some((row_ids.clone(), column_ids.clone())),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: TransportCall) {
        lock(&self.calls).push(call);
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn fetch_object_definition(&self, dataset_id: &str) -> Result<Option<ObjectDefinition>> {
        self.record(TransportCall::ObjectDefinition {
            dataset_id: dataset_id.to_string(),
        });
        self.inner.fetch_object_definition(dataset_id).await
    }

    async fn fetch_row_ids(&self, dataset_id: &str, limit: usize, offset: usize) -> Result<RowIdPage> {
        self.record(TransportCall::RowIds {
            dataset_id: dataset_id.to_string(),
            limit,
            offset,
        });
        self.inner.fetch_row_ids(dataset_id, limit, offset).await
    }

    async fn fetch_records_data(
        &self,
        dataset_id: &str,
        row_ids: &[RowId],
        column_ids: &[ColumnId],
    ) -> Result<RecordsData> {
        self.record(TransportCall::Records {
            dataset_id: dataset_id.to_string(),
            row_ids: row_ids.to_vec(),
            column_ids: column_ids.to_vec(),
        });
        self.inner.fetch_records_data(dataset_id, row_ids, column_ids).await
    }
}
