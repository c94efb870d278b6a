use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde::Deserialize;
use uuid::Uuid;

use crate::engine::offers;
use crate::error::AppError;
use crate::models::driver_request::{DriverRequest, OfferAction};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/offers/:id", get(get_offer))
        .route("/offers/:id/respond", post(respond_offer))
}

#[derive(Deserialize)]
pub struct RespondRequest {
    pub driver_id: Uuid,
    pub action: OfferAction,
}

async fn get_offer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<DriverRequest>, AppError> {
    Ok(Json(state.offer(id)?))
}

async fn respond_offer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<RespondRequest>,
) -> Result<Json<DriverRequest>, AppError> {
    let offer = offers::respond(&state, id, payload.driver_id, payload.action).await?;
    Ok(Json(offer))
}
