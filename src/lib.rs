/*!
# Lazy Grid

Incremental, cell-level population engine for a virtualized data grid.

## Overview

A grid over a large dataset only ever shows a small window of it. This crate
keeps that window filled without over-fetching: row ids are paged in fixed
buckets as the viewport scrolls, cells ask for their values individually, and
those requests are coalesced into one batched call per dataset. Values carry a
version and a population timestamp so the grid can tell fresh data from stale.

## Architecture

### Caches
- **Object schema** - column definitions per dataset, fetched once; concurrent
  callers share the in-flight request
- **Row-id pager** - ordered row ids in buckets of 100, pulled on demand
- **Cell attribute** - value, version and staleness of one (dataset, row, column)

### Coordination
- **Fetch coordinator** - per-dataset pending set, debounce timer (zero delay
  for the first batch, 500ms afterwards) and fan-out of batch results
- **Viewport tracker** - rendered row/column bounds derived from the cells on screen
- **Selectors** - row id at index, column at index, total rows, table status

### Plumbing
- **Registry** - keyed singletons with reference-counted leases and an
  explicit eviction policy
- **Signal** - observable value cell with change-filtered selectors
- **Transport** - the three server operations, plus an in-process simulated backend
- **Context** - the composition root everything is acquired from

## Data Flow

viewport scroll → bounds update → row id at index → bucket fetch if missing →
cell mount → coalesced batch → values fanned out to cells → selectors re-project

## Modules

- **attribute**: per-cell cache entry and its fetch state
- **cell**: scoped mount/unmount of an on-screen cell
- **config**: tunables and JSON config loading
- **context**: application context and registries
- **coordinator**: batching and dispatch of cell fetches
- **error**: error taxonomy
- **eviction**: eviction policies
- **pager**: row-id buckets
- **registry**: keyed registry and leases
- **schema**: dataset column definitions
- **selectors**: derived read-only views
- **server**: HTTP surface for the simulated backend (feature `web`)
- **signal**: reactive value cell
- **transport**: transport trait and simulated backend
- **viewport**: rendered bounds
*/

pub mod attribute;
pub mod cell;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod eviction;
pub mod pager;
pub mod registry;
pub mod schema;
pub mod selectors;
#[cfg(feature = "web")]
pub mod server;
pub mod signal;
pub mod transport;
pub mod viewport;

/// Re-export the types most callers need
pub use attribute::{AttributeState, CellAttribute, CellKey, FetchState};
pub use cell::MountedCell;
pub use config::{GridConfig, RetentionSetting};
pub use context::AppContext;
pub use coordinator::{BatchReport, CoordinatorSettings, CoordinatorStats, FetchCoordinator};
pub use error::{GridError, Result};
pub use eviction::{EvictionPolicy, IdleEntry};
pub use pager::{RowIdPager, RowIdState};
pub use registry::{KeyedRegistry, Lease};
pub use schema::{ObjectSchema, SchemaState};
pub use selectors::{ActiveRecord, TableStatus, table_status};
pub use signal::{Selector, Signal};
pub use transport::{
    Column, ColumnId, DatasetId, ObjectDefinition, RecordingTransport, RecordsData, RowId,
    RowIdPage, SimulatedTransport, Transport,
};
pub use viewport::{RenderedCell, ViewportBounds, ViewportTracker};
