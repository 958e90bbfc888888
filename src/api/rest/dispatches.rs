use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Json;
use axum::Router;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::AppError;
use crate::models::order::DispatchRecord;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/dispatches", get(list_dispatches).post(submit_order))
        .route("/dispatches/:order_id", get(get_dispatch))
}

#[derive(Deserialize)]
pub struct SubmitOrderRequest {
    pub order_id: String,
}

#[derive(Serialize)]
pub struct SubmitOrderResponse {
    pub order_id: String,
    pub status: &'static str,
}

async fn submit_order(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SubmitOrderRequest>,
) -> Result<(StatusCode, Json<SubmitOrderResponse>), AppError> {
    let order_id = payload.order_id.trim();
    if order_id.is_empty() {
        return Err(AppError::BadRequest("order_id cannot be empty".to_string()));
    }

    state.queue.enqueue(order_id).await?;
    info!(order_id = %order_id, "order submitted over http");

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitOrderResponse {
            order_id: order_id.to_string(),
            status: "queued",
        }),
    ))
}

async fn get_dispatch(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<String>,
) -> Result<Json<DispatchRecord>, AppError> {
    let record = state
        .dispatcher
        .record(&order_id)
        .ok_or_else(|| AppError::NotFound(format!("dispatch for order {} not found", order_id)))?;

    Ok(Json(record))
}

async fn list_dispatches(State(state): State<Arc<AppState>>) -> Json<Vec<DispatchRecord>> {
    Json(state.dispatcher.records())
}
