use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde::Deserialize;
use uuid::Uuid;

use crate::engine::dispatch::{self, NewServiceOrder};
use crate::error::AppError;
use crate::models::service_order::ServiceOrder;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/service-orders", post(create_service_order))
        .route("/service-orders/:id", get(get_service_order))
        .route("/service-orders/:id/complete", post(complete_service_order))
}

#[derive(Deserialize)]
pub struct CompleteServiceRequest {
    pub driver_id: Uuid,
}

async fn create_service_order(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<NewServiceOrder>,
) -> Result<Json<ServiceOrder>, AppError> {
    Ok(Json(dispatch::place_service_order(&state, payload)?))
}

async fn get_service_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ServiceOrder>, AppError> {
    let ticket = state
        .service_orders
        .get(&id)
        .ok_or_else(|| AppError::NotFound(format!("service order {} not found", id)))?;

    Ok(Json(ticket.value().clone()))
}

async fn complete_service_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CompleteServiceRequest>,
) -> Result<Json<ServiceOrder>, AppError> {
    Ok(Json(
        dispatch::complete_service_order(&state, id, payload.driver_id).await?,
    ))
}
