mod common;

use common::{DATASET, config, flaky_context, recorded_context};
use lazygrid::GridConfig;
use std::time::Duration;

fn without_prefetch() -> GridConfig {
    GridConfig {
        prefetch_first_bucket: false,
        ..config()
    }
}

#[tokio::test(start_paused = true)]
async fn new_table_fetches_first_bucket() {
    let (ctx, recorder) = recorded_context(config());
    let table = ctx.table(DATASET).unwrap();
    assert!(table.is_bucket_in_flight(0));
    assert!(!table.row_ids_populated());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(table.row_ids_populated());
    assert_eq!(table.total_row_count(), 10_000);
    assert_eq!(table.row_id_at(0).as_deref(), Some("r0"));
    assert_eq!(table.row_id_at(99).as_deref(), Some("r99"));
    assert_eq!(table.row_id_at(100), None);

    // a second consumer shares the pager
    let again = ctx.table(DATASET).unwrap();
    assert_eq!(again.row_id_at(42).as_deref(), Some("r42"));
    assert_eq!(recorder.row_id_offsets(), vec![0]);
}

#[tokio::test(start_paused = true)]
async fn prefetch_can_be_disabled() {
    let (ctx, recorder) = recorded_context(without_prefetch());
    let table = ctx.table(DATASET).unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!table.row_ids_populated());
    assert!(recorder.row_id_offsets().is_empty());
}

#[tokio::test(start_paused = true)]
async fn missing_index_requests_its_bucket_once() {
    let (ctx, recorder) = recorded_context(config());
    let table = ctx.table(DATASET).unwrap();

    assert_eq!(table.ensure_row_id_at(150), None);
    assert_eq!(table.ensure_row_id_at(150), None);
    assert_eq!(table.ensure_row_id_at(199), None);
    assert!(table.is_bucket_in_flight(100));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(table.ensure_row_id_at(150).as_deref(), Some("r150"));
    assert_eq!(recorder.row_id_offsets(), vec![0, 100]);
}

#[tokio::test(start_paused = true)]
async fn failed_bucket_can_be_retried() {
    let (ctx, flaky, recorder) = flaky_context(without_prefetch());
    flaky.fail_next_row_ids(1);
    let table = ctx.table(DATASET).unwrap();

    assert!(table.fetch_bucket(0).await.is_err());
    assert!(table.state().last_error.is_some());
    assert!(!table.is_bucket_in_flight(0));
    assert!(!table.row_ids_populated());

    assert!(table.fetch_bucket(0).await.unwrap());
    assert!(table.state().last_error.is_none());
    assert_eq!(table.row_id_at(7).as_deref(), Some("r7"));
    assert_eq!(recorder.row_id_offsets(), vec![0, 0]);
}

#[tokio::test(start_paused = true)]
async fn unknown_dataset_records_the_error() {
    let (ctx, _) = recorded_context(config());
    let table = ctx.table("object-404").unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    let state = table.state();
    assert!(state.last_error.is_some_and(|e| e.is_not_found()));
    assert!(!state.row_ids_populated);
}

#[tokio::test(start_paused = true)]
async fn row_ids_change_notifies_subscribers() {
    let (ctx, _) = recorded_context(without_prefetch());
    let table = ctx.table(DATASET).unwrap();
    let mut total = table.signal().selector(|s: &lazygrid::RowIdState| s.total_row_count);
    assert_eq!(total.current(), 0);

    table.populate_row_ids(0);
    assert_eq!(total.changed().await, Some(10_000));
}
