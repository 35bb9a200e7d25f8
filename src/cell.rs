use crate::attribute::{AttributeState, CellAttribute, CellKey, FetchState};
use crate::registry::Lease;
use crate::transport::Column;

/// A grid cell currently on screen.
///
/// Mounting acquires the cell's attribute entry and requests population;
/// dropping the handle (or calling [`release`](Self::release)) releases the
/// entry on every exit path. The last handle on an entry also withdraws any
/// request that has not been sent yet.
#[derive(Debug)]
pub struct MountedCell {
    column: Column,
    attribute: Lease<CellKey, CellAttribute>,
}

impl MountedCell {
    pub(crate) fn mount(column: Column, attribute: Lease<CellKey, CellAttribute>) -> Self {
        attribute.populate(false);
        MountedCell { column, attribute }
    }

    pub fn key(&self) -> &CellKey {
        self.attribute.key()
    }

    pub fn column(&self) -> &Column {
        &self.column
    }

    pub fn attribute(&self) -> &CellAttribute {
        &self.attribute
    }

    pub fn value(&self) -> Option<String> {
        self.attribute.value()
    }

    pub fn version(&self) -> u64 {
        self.attribute.version()
    }

    pub fn state(&self) -> AttributeState {
        self.attribute.state()
    }

    /// What the grid shows: the value, a failure marker, or the placeholder.
    pub fn display_text(&self) -> String {
        let state = self.attribute.state();
        match (state.value, state.fetch) {
            (Some(value), _) => value,
            (None, FetchState::Failed(_)) => "!".to_string(),
            (None, _) => "...".to_string(),
        }
    }

    pub fn release(self) {}
}

impl Drop for MountedCell {
    fn drop(&mut self) {
        // another mount of the same cell still wants the value
        if self.attribute.ref_count() == 1 {
            self.attribute.cancel_populate();
        }
    }
}
