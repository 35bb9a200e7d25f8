//! Read-only projections over the caches, in the shape the grid consumes them.

use crate::pager::RowIdPager;
use crate::schema::{ObjectSchema, SchemaState};
use crate::signal::Signal;
use crate::transport::{Column, RowId};

pub fn column_at(schema: &ObjectSchema, index: usize) -> Option<Column> {
    schema.column_at(index)
}

pub fn row_id_at(pager: &RowIdPager, index: usize) -> Option<RowId> {
    pager.row_id_at(index)
}

pub fn total_row_count(pager: &RowIdPager) -> usize {
    pager.total_row_count()
}

pub fn row_ids_populated(pager: &RowIdPager) -> bool {
    pager.row_ids_populated()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableStatus {
    NotFound,
    /// The schema fetch failed for a reason other than a missing dataset.
    Unavailable(String),
    LoadingColumns,
    LoadingRowIds,
    NoColumns,
    Ready { total_rows: usize, column_count: usize },
}

/// What the grid should render for a dataset right now.
pub fn table_status(schema: &ObjectSchema, pager: &RowIdPager) -> TableStatus {
    let column_count = match schema.state() {
        SchemaState::NotFound => return TableStatus::NotFound,
        SchemaState::Failed(e) => return TableStatus::Unavailable(e.to_string()),
        SchemaState::Loading => return TableStatus::LoadingColumns,
        SchemaState::Ready(def) => def.columns.len(),
    };

    if !pager.row_ids_populated() {
        return TableStatus::LoadingRowIds;
    }
    if column_count == 0 {
        return TableStatus::NoColumns;
    }
    TableStatus::Ready {
        total_rows: pager.total_row_count(),
        column_count,
    }
}

/// The record currently opened in a detail view, if any.
#[derive(Debug, Default)]
pub struct ActiveRecord {
    current: Signal<Option<RowId>>,
}

impl ActiveRecord {
    pub fn set(&self, row_id: Option<RowId>) {
        self.current.set(row_id);
    }

    pub fn get(&self) -> Option<RowId> {
        self.current.get()
    }

    pub fn is_record_active(&self, row_id: &str) -> bool {
        !row_id.is_empty() && self.current.with(|c| c.as_deref() == Some(row_id))
    }

    pub fn signal(&self) -> &Signal<Option<RowId>> {
        &self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_record_matches_only_non_empty_ids() {
        let active = ActiveRecord::default();
        assert!(!active.is_record_active("r1"));

        active.set(Some("r1".to_string()));
        assert!(active.is_record_active("r1"));
        assert!(!active.is_record_active("r2"));

        active.set(Some(String::new()));
        assert!(!active.is_record_active(""));
    }
}
