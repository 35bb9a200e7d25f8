use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use crate::attribute::{CellAttribute, CellKey};
use crate::cell::MountedCell;
use crate::config::GridConfig;
use crate::coordinator::{CoordinatorSettings, FetchCoordinator};
use crate::error::{GridError, Result, ensure_dataset_id};
use crate::eviction::EvictionPolicy;
use crate::pager::RowIdPager;
use crate::registry::{KeyedRegistry, Lease};
use crate::schema::ObjectSchema;
use crate::selectors::ActiveRecord;
use crate::transport::{DatasetId, SimulatedTransport, Transport};

pub type SchemaLease = Lease<DatasetId, ObjectSchema>;
pub type TableLease = Lease<DatasetId, RowIdPager>;
pub type CoordinatorLease = Lease<DatasetId, FetchCoordinator>;
pub type AttributeLease = Lease<CellKey, CellAttribute>;

/// Composition root: owns the transport, the configuration and one keyed
/// registry per component kind. Cheap to clone; clones share everything.
///
/// Batch dispatch runs on the caller's tokio runtime. Use a current-thread
/// runtime so that cells mounted without awaiting in between are gathered
/// into one batch.
#[derive(Clone)]
pub struct AppContext {
    config: Arc<GridConfig>,
    transport: Arc<dyn Transport>,
    schemas: KeyedRegistry<DatasetId, ObjectSchema>,
    tables: KeyedRegistry<DatasetId, RowIdPager>,
    coordinators: KeyedRegistry<DatasetId, FetchCoordinator>,
    attributes: KeyedRegistry<CellKey, CellAttribute>,
    /// Batch sequence numbers, shared by every coordinator this context creates.
    batch_counter: Arc<AtomicU64>,
    active_record: Arc<ActiveRecord>,
}

pub struct AppContextBuilder {
    config: GridConfig,
    transport: Option<Arc<dyn Transport>>,
    dataset_policy: Option<EvictionPolicy>,
    cell_policy: Option<EvictionPolicy>,
}

impl AppContextBuilder {
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Overrides `dataset_retention` from the config.
    pub fn dataset_eviction(mut self, policy: EvictionPolicy) -> Self {
        self.dataset_policy = Some(policy);
        self
    }

    /// Overrides `cell_retention` from the config.
    pub fn cell_eviction(mut self, policy: EvictionPolicy) -> Self {
        self.cell_policy = Some(policy);
        self
    }

    pub fn build(self) -> Result<AppContext> {
        self.config.validate()?;
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(SimulatedTransport::new(&self.config)),
        };
        let dataset_policy = self
            .dataset_policy
            .unwrap_or_else(|| self.config.dataset_retention.to_policy());
        let cell_policy = self
            .cell_policy
            .unwrap_or_else(|| self.config.cell_retention.to_policy());

        Ok(AppContext {
            config: Arc::new(self.config),
            transport,
            schemas: KeyedRegistry::new("object-schema", dataset_policy.clone()),
            tables: KeyedRegistry::new("row-id-pager", dataset_policy.clone()),
            coordinators: KeyedRegistry::new("fetch-coordinator", dataset_policy),
            attributes: KeyedRegistry::new("cell-attribute", cell_policy),
            batch_counter: Arc::new(AtomicU64::new(0)),
            active_record: Arc::new(ActiveRecord::default()),
        })
    }
}

impl AppContext {
    pub fn builder(config: GridConfig) -> AppContextBuilder {
        AppContextBuilder {
            config,
            transport: None,
            dataset_policy: None,
            cell_policy: None,
        }
    }

    pub fn new(config: GridConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        Self::builder(config).transport(transport).build()
    }

    /// Context backed by the in-process simulated backend.
    pub fn simulated(config: GridConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn schema(&self, dataset_id: &str) -> Result<SchemaLease> {
        ensure_dataset_id(dataset_id)?;
        let transport = Arc::clone(&self.transport);
        Ok(self
            .schemas
            .acquire_with(dataset_id.to_string(), |id| ObjectSchema::new(id.clone(), transport)))
    }

    /// Row-id pager for a dataset. A newly created pager starts fetching its
    /// first bucket when `prefetch_first_bucket` is set, and keeps the
    /// dataset's coordinator alive until the pager itself is evicted.
    pub fn table(&self, dataset_id: &str) -> Result<TableLease> {
        ensure_dataset_id(dataset_id)?;
        let transport = Arc::clone(&self.transport);
        let bucket_size = self.config.bucket_size;
        // acquired outside the table registry lock; released unused when the
        // pager already exists
        let coordinator = self.acquire_coordinator(dataset_id);
        let mut created = false;
        let lease = self.tables.acquire_with(dataset_id.to_string(), |id| {
            created = true;
            RowIdPager::new(id.clone(), bucket_size, transport).holding(coordinator)
        });
        if created && self.config.prefetch_first_bucket {
            lease.populate_row_ids(0);
        }
        Ok(lease)
    }

    pub fn coordinator(&self, dataset_id: &str) -> Result<CoordinatorLease> {
        ensure_dataset_id(dataset_id)?;
        Ok(self.acquire_coordinator(dataset_id))
    }

    pub fn attribute(&self, key: CellKey) -> Result<AttributeLease> {
        ensure_dataset_id(&key.dataset_id)?;
        if key.row_id.is_empty() || key.column_id.is_empty() {
            return Err(GridError::InvariantViolation(format!(
                "cell key needs a row and a column: {:?}",
                key
            )));
        }

        // acquired outside the attribute registry lock
        let coordinator = self.acquire_coordinator(&key.dataset_id);
        let stale_threshold = self.config.stale_threshold();
        Ok(self.attributes.acquire_with(key, move |k| {
            CellAttribute::new(k.clone(), coordinator, stale_threshold)
        }))
    }

    /// Mounts the cell at (`row_id`, column `column_index`) of a dataset:
    /// resolves the column, acquires the attribute and requests population.
    pub async fn mount_cell(
        &self,
        dataset_id: &str,
        row_id: &str,
        column_index: usize,
    ) -> Result<MountedCell> {
        let schema = self.schema(dataset_id)?;
        let columns = schema.columns().await?;
        let column = columns
            .get(column_index)
            .cloned()
            .ok_or_else(|| GridError::column_not_found(format!("#{}", column_index)))?;

        let attribute = self.attribute(CellKey::new(dataset_id, row_id, column.id.clone()))?;
        Ok(MountedCell::mount(column, attribute))
    }

    pub fn active_record(&self) -> &ActiveRecord {
        &self.active_record
    }

    /// Live cell attribute entry, if one is cached. Does not create it.
    pub fn cached_attribute(&self, key: &CellKey) -> Option<Arc<CellAttribute>> {
        self.attributes.get(key)
    }

    pub fn cached_attribute_count(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_dataset_cached(&self, dataset_id: &str) -> bool {
        let key = dataset_id.to_string();
        self.schemas.contains(&key) || self.tables.contains(&key) || self.coordinators.contains(&key)
    }

    /// Applies the eviction policies to every idle entry.
    pub fn sweep(&self) -> usize {
        self.attributes.sweep() + self.coordinators.sweep() + self.tables.sweep() + self.schemas.sweep()
    }

    fn acquire_coordinator(&self, dataset_id: &str) -> CoordinatorLease {
        let transport = Arc::clone(&self.transport);
        let settings = CoordinatorSettings {
            debounce_delay: self.config.debounce_delay(),
            hydrate_evicted_cells: self.config.hydrate_evicted_cells,
            batch_counter: Arc::clone(&self.batch_counter),
        };
        let cells = self.attributes.downgrade();
        let owner = self.coordinators.downgrade();
        self.coordinators.acquire_with(dataset_id.to_string(), move |id| {
            FetchCoordinator::new(id.clone(), transport, settings, cells).owned_by(owner)
        })
    }
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("config", &self.config)
            .field("schemas", &self.schemas.len())
            .field("tables", &self.tables.len())
            .field("coordinators", &self.coordinators.len())
            .field("attributes", &self.attributes.len())
            .finish()
    }
}
