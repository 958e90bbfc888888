use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::get;
use axum::Json;
use axum::Router;

use crate::error::AppError;
use crate::models::courier::CourierSnapshot;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/couriers", get(list_couriers))
        .route("/couriers/:id", get(get_courier))
}

async fn list_couriers(State(state): State<Arc<AppState>>) -> Json<Vec<CourierSnapshot>> {
    Json(state.registry.list())
}

async fn get_courier(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<CourierSnapshot>, AppError> {
    let courier = state
        .registry
        .get(&id)
        .ok_or_else(|| AppError::NotFound(format!("courier {} not found", id)))?;

    Ok(Json(courier))
}
