use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

use crate::config::GridConfig;
use crate::error::GridError;
use crate::transport::{RecordsRequest, SimulatedTransport, Transport};

pub struct AppState {
    transport: Arc<dyn Transport>,
    bucket_size: usize,
}

#[derive(Deserialize)]
struct RowsQuery {
    limit: Option<usize>,
    offset: Option<usize>,
}

#[derive(Serialize)]
struct ErrorResponse {
    status: String,
    message: Option<String>,
}

impl IntoResponse for GridError {
    fn into_response(self) -> Response {
        let status = match &self {
            GridError::NotFound { .. } => StatusCode::NOT_FOUND,
            GridError::InvariantViolation(_) => StatusCode::BAD_REQUEST,
            GridError::TransportFailure(_) => StatusCode::BAD_GATEWAY,
        };
        let body = ErrorResponse {
            status: "error".to_string(),
            message: Some(self.to_string()),
        };
        (status, Json(body)).into_response()
    }
}

/// Routes serving a transport over HTTP, the shape the grid's client expects.
pub fn router(transport: Arc<dyn Transport>, bucket_size: usize) -> Router {
    let state = Arc::new(AppState {
        transport,
        bucket_size,
    });

    Router::new()
        .route("/api/objects/:object_id", get(get_object))
        .route("/api/objects/:object_id/rows", get(get_rows))
        .route("/api/objects/:object_id/records", post(get_records))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run(addr: SocketAddr, config: GridConfig) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    let transport: Arc<dyn Transport> = Arc::new(SimulatedTransport::new(&config));
    let app = router(transport, config.bucket_size);

    let listener = TcpListener::bind(addr).await?;
    log::info!("simulated backend listening on http://{}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}

async fn get_object(
    Path(object_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Response {
    match state.transport.fetch_object_definition(&object_id).await {
        Ok(Some(def)) => Json(def).into_response(),
        Ok(None) => GridError::dataset_not_found(object_id).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn get_rows(
    Path(object_id): Path<String>,
    Query(params): Query<RowsQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let limit = params.limit.unwrap_or(state.bucket_size);
    let offset = params.offset.unwrap_or(0);

    match state.transport.fetch_row_ids(&object_id, limit, offset).await {
        Ok(page) => Json(page).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn get_records(
    Path(object_id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(request): Json<RecordsRequest>,
) -> Response {
    log::debug!(
        "records request for {}: {} rows x {} columns",
        object_id,
        request.record_ids.len(),
        request.column_ids.len()
    );
    match state
        .transport
        .fetch_records_data(&object_id, &request.record_ids, &request.column_ids)
        .await
    {
        Ok(records) => Json(records).into_response(),
        Err(e) => e.into_response(),
    }
}
