use lazygrid::{
    AppContext, GridConfig, RecordingTransport, RenderedCell, RowIdPager, SimulatedTransport,
    ViewportTracker, table_status,
};
use std::env;
use std::ops::RangeInclusive;
use std::sync::Arc;

const VISIBLE_ROWS: usize = 30;
const VISIBLE_COLUMNS: usize = 8;
const SCROLL_STEP: usize = 75;

// a screenful of mounts must be queued before the first batch task runs
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = env::args().collect();

    // Default dataset and number of scroll steps
    let mut dataset_id = "object-1".to_string();
    let mut steps = 5;

    if args.len() >= 2 {
        dataset_id = args[1].clone();
    }
    if args.len() >= 3 {
        steps = args[2].parse().unwrap_or(5);
    }

    let config = GridConfig::load()?;
    let recorder = Arc::new(RecordingTransport::new(Arc::new(SimulatedTransport::new(&config))));
    let ctx = AppContext::new(config, recorder.clone())?;

    let schema = ctx.schema(&dataset_id)?;
    let table = ctx.table(&dataset_id)?;
    let coordinator = ctx.coordinator(&dataset_id)?;
    let viewport = ViewportTracker::new();

    if let Err(e) = schema.definition().await {
        println!("{}: {}", dataset_id, e);
        return Ok(());
    }
    wait_for_rows(&table, 0..=0).await?;
    println!("{}: {:?}", dataset_id, table_status(&schema, &table));

    for step in 0..steps {
        let first_row = step * SCROLL_STEP;
        let first_column = step % 3;
        let rendered: Vec<RenderedCell> = (first_row..first_row + VISIBLE_ROWS)
            .filter(|r| *r < table.total_row_count())
            .flat_map(|r| (first_column..first_column + VISIBLE_COLUMNS).map(move |c| RenderedCell::new(r, c)))
            .collect();
        viewport.update_from_rendered_set(&rendered);

        let Some(bounds) = viewport.bounds() else {
            println!("step {}: nothing to render", step);
            break;
        };
        wait_for_rows(&table, bounds.rows()).await?;

        let mut mounted = Vec::new();
        for row_index in bounds.rows() {
            let Some(row_id) = table.row_id_at(row_index) else {
                continue;
            };
            for column_index in bounds.columns() {
                mounted.push(ctx.mount_cell(&dataset_id, &row_id, column_index).await?);
            }
            // sticky first column while scrolled horizontally
            if viewport.pinned_rows().is_some() {
                mounted.push(ctx.mount_cell(&dataset_id, &row_id, 0).await?);
            }
        }
        coordinator.wait_idle().await;

        println!(
            "step {}: rows {:?} columns {:?}, {} cells mounted, {} batches so far",
            step,
            bounds.rows(),
            bounds.columns(),
            mounted.len(),
            coordinator.stats().batches_dispatched
        );
        if let (Some(first), Some(last)) = (mounted.first(), mounted.last()) {
            println!(
                "  {}/{} = {} (v{}), {}/{} = {} (v{})",
                first.key().row_id,
                first.key().column_id,
                first.display_text(),
                first.version(),
                last.key().row_id,
                last.key().column_id,
                last.display_text(),
                last.version()
            );
        }
        // scrolled away
        drop(mounted);
    }

    let stats = coordinator.stats();
    println!(
        "done: {} batches ({} failed), {} cells applied, buckets fetched at {:?}",
        stats.batches_dispatched,
        stats.batches_failed,
        stats.cells_applied,
        recorder.row_id_offsets()
    );

    Ok(())
}

/// Requests the buckets covering `rows` and waits until they have resolved.
async fn wait_for_rows(
    table: &RowIdPager,
    rows: RangeInclusive<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut changes = table.signal().subscribe();
    loop {
        let missing: Vec<usize> = rows.clone().filter(|i| table.ensure_row_id_at(*i).is_none()).collect();
        let state = table.state();
        if let Some(e) = state.last_error {
            return Err(e.into());
        }
        // rows past the end never fill in
        if missing.iter().all(|i| state.row_ids_populated && *i >= state.total_row_count) {
            return Ok(());
        }
        changes.changed().await?;
    }
}
