use std::ops::RangeInclusive;

use crate::signal::{Selector, Signal};

/// Grid position of one cell the presentation layer is currently rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderedCell {
    pub row_index: usize,
    pub column_index: usize,
}

impl RenderedCell {
    pub fn new(row_index: usize, column_index: usize) -> Self {
        RenderedCell {
            row_index,
            column_index,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewportBounds {
    pub min_row: usize,
    pub max_row: usize,
    pub min_column: usize,
    pub max_column: usize,
}

impl ViewportBounds {
    /// Min/max over the rendered set; `None` when nothing is rendered.
    pub fn from_rendered(cells: &[RenderedCell]) -> Option<Self> {
        let first = cells.first()?;
        let seed = ViewportBounds {
            min_row: first.row_index,
            max_row: first.row_index,
            min_column: first.column_index,
            max_column: first.column_index,
        };
        Some(cells.iter().fold(seed, |b, c| ViewportBounds {
            min_row: b.min_row.min(c.row_index),
            max_row: b.max_row.max(c.row_index),
            min_column: b.min_column.min(c.column_index),
            max_column: b.max_column.max(c.column_index),
        }))
    }

    pub fn rows(&self) -> RangeInclusive<usize> {
        self.min_row..=self.max_row
    }

    pub fn columns(&self) -> RangeInclusive<usize> {
        self.min_column..=self.max_column
    }

    pub fn contains(&self, row_index: usize, column_index: usize) -> bool {
        self.rows().contains(&row_index) && self.columns().contains(&column_index)
    }
}

/// Derives rendered bounds from the set of cells on screen.
///
/// Purely geometric; it may lag the real viewport by one render.
#[derive(Debug, Default)]
pub struct ViewportTracker {
    bounds: Signal<Option<ViewportBounds>>,
}

impl ViewportTracker {
    pub fn new() -> Self {
        ViewportTracker::default()
    }

    pub fn update_from_rendered_set(&self, rendered: &[RenderedCell]) {
        let next = ViewportBounds::from_rendered(rendered);
        self.bounds.mutate_if(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    pub fn bounds(&self) -> Option<ViewportBounds> {
        self.bounds.get()
    }

    pub fn min_row(&self) -> Option<usize> {
        self.bounds.with(|b| b.map(|b| b.min_row))
    }

    pub fn max_row(&self) -> Option<usize> {
        self.bounds.with(|b| b.map(|b| b.max_row))
    }

    pub fn min_column(&self) -> Option<usize> {
        self.bounds.with(|b| b.map(|b| b.min_column))
    }

    pub fn max_column(&self) -> Option<usize> {
        self.bounds.with(|b| b.map(|b| b.max_column))
    }

    /// Rows that need a sticky column-0 companion because column 0 itself has
    /// scrolled out of the rendered window.
    pub fn pinned_rows(&self) -> Option<RangeInclusive<usize>> {
        self.bounds
            .with(|b| b.filter(|b| b.min_column > 0).map(|b| b.rows()))
    }

    pub fn min_row_selector(&self) -> Selector<Option<ViewportBounds>, Option<usize>> {
        self.bounds.selector(|b: &Option<ViewportBounds>| b.map(|b| b.min_row))
    }

    pub fn max_row_selector(&self) -> Selector<Option<ViewportBounds>, Option<usize>> {
        self.bounds.selector(|b: &Option<ViewportBounds>| b.map(|b| b.max_row))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(rows: RangeInclusive<usize>, cols: RangeInclusive<usize>) -> Vec<RenderedCell> {
        rows.flat_map(|r| cols.clone().map(move |c| RenderedCell::new(r, c)))
            .collect()
    }

    #[test]
    fn bounds_are_min_max_of_rendered_cells() {
        let tracker = ViewportTracker::new();
        tracker.update_from_rendered_set(&[
            RenderedCell::new(12, 3),
            RenderedCell::new(4, 9),
            RenderedCell::new(7, 1),
        ]);
        assert_eq!(
            tracker.bounds(),
            Some(ViewportBounds {
                min_row: 4,
                max_row: 12,
                min_column: 1,
                max_column: 9,
            })
        );
        assert_eq!(tracker.min_row(), Some(4));
        assert_eq!(tracker.max_row(), Some(12));
    }

    #[test]
    fn empty_render_clears_bounds() {
        let tracker = ViewportTracker::new();
        tracker.update_from_rendered_set(&window(0..=3, 0..=3));
        tracker.update_from_rendered_set(&[]);
        assert_eq!(tracker.bounds(), None);
        assert_eq!(tracker.min_row(), None);
    }

    #[test]
    fn pinned_rows_only_when_first_column_scrolled_away() {
        let tracker = ViewportTracker::new();
        tracker.update_from_rendered_set(&window(10..=20, 0..=5));
        assert_eq!(tracker.pinned_rows(), None);

        tracker.update_from_rendered_set(&window(10..=20, 4..=9));
        assert_eq!(tracker.pinned_rows(), Some(10..=20));
    }

    #[test]
    fn contains_checks_both_axes() {
        let bounds = ViewportBounds::from_rendered(&window(5..=6, 2..=3)).unwrap();
        assert!(bounds.contains(5, 3));
        assert!(!bounds.contains(7, 3));
        assert!(!bounds.contains(5, 1));
    }

    #[tokio::test]
    async fn row_selector_ignores_horizontal_scroll() {
        let tracker = ViewportTracker::new();
        tracker.update_from_rendered_set(&window(0..=9, 0..=4));
        let mut min_row = tracker.min_row_selector();
        assert_eq!(min_row.current(), Some(0));

        tracker.update_from_rendered_set(&window(0..=9, 3..=7));
        tracker.update_from_rendered_set(&window(5..=14, 3..=7));
        assert_eq!(min_row.changed().await, Some(Some(5)));
    }
}
