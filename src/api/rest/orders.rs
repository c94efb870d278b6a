use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::dispatch::start_dispatch;
use crate::engine::orders::{self, CancelledBy};
use crate::error::AppError;
use crate::models::driver::GeoPoint;
use crate::models::driver_request::DriverRequest;
use crate::models::menu::{MenuItem, OrderItem};
use crate::models::order::{NewOrder, Order, TrackingUpdate};
use crate::models::review::DeliveryRating;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/menu-items", post(create_menu_item))
        .route("/menu-items/:id", get(get_menu_item))
        .route("/orders", post(create_order))
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/tracking", get(get_tracking))
        .route("/orders/:id/offers", get(list_offers))
        .route("/orders/:id/rating", get(get_rating))
        .route("/orders/:id/dispatch", post(restart_dispatch))
        .route("/orders/:id/approve", post(approve_order))
        .route("/orders/:id/reject", post(reject_order))
        .route("/orders/:id/ready", post(ready_order))
        .route("/orders/:id/pickup", post(pickup_order))
        .route("/orders/:id/start-delivery", post(start_delivery))
        .route("/orders/:id/complete", post(complete_order))
        .route("/orders/:id/cancel", post(cancel_order))
}

#[derive(Deserialize)]
pub struct CreateMenuItemRequest {
    pub store_id: Uuid,
    pub name: String,
    pub quantity: u32,
}

#[derive(Deserialize)]
pub struct CreateOrderRequest {
    pub customer_id: Uuid,
    pub store_id: Uuid,
    pub customer_token: Option<String>,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    pub items: Vec<OrderItem>,
}

#[derive(Deserialize)]
pub struct StoreAction {
    pub store_id: Uuid,
    pub reason: Option<String>,
}

#[derive(Deserialize)]
pub struct DriverAction {
    pub driver_id: Uuid,
}

#[derive(Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum CancelRequest {
    Customer {
        customer_id: Uuid,
        reason: Option<String>,
    },
    Store {
        store_id: Uuid,
        reason: Option<String>,
    },
}

#[derive(Serialize)]
pub struct CompletedDelivery {
    pub order: Order,
    pub rating: DeliveryRating,
}

#[derive(Serialize)]
pub struct DispatchStarted {
    pub started: bool,
}

async fn create_menu_item(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateMenuItemRequest>,
) -> Result<Json<MenuItem>, AppError> {
    if payload.name.trim().is_empty() {
        return Err(AppError::BadRequest("name cannot be empty".to_string()));
    }

    let item = MenuItem {
        id: Uuid::new_v4(),
        store_id: payload.store_id,
        name: payload.name,
        quantity: payload.quantity,
    };
    state.menu_items.insert(item.id, item.clone());
    Ok(Json(item))
}

async fn get_menu_item(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<MenuItem>, AppError> {
    let item = state
        .menu_items
        .get(&id)
        .ok_or_else(|| AppError::NotFound(format!("menu item {} not found", id)))?;

    Ok(Json(item.value().clone()))
}

async fn create_order(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateOrderRequest>,
) -> Result<Json<Order>, AppError> {
    if payload.items.iter().any(|item| item.quantity == 0) {
        return Err(AppError::BadRequest("item quantity must be > 0".to_string()));
    }

    let order = orders::place_order(
        &state,
        NewOrder {
            customer_id: payload.customer_id,
            store_id: payload.store_id,
            customer_token: payload.customer_token,
            pickup: payload.pickup,
            dropoff: payload.dropoff,
            items: payload.items,
        },
    )
    .await?;

    Ok(Json(order))
}

async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(state.order(id)?))
}

async fn get_tracking(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<TrackingUpdate>>, AppError> {
    let order = state.order(id)?;
    Ok(Json(order.tracking_updates().to_vec()))
}

async fn list_offers(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<DriverRequest>>, AppError> {
    state.order(id)?;
    Ok(Json(state.offers_for_order(id)))
}

async fn get_rating(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<DeliveryRating>, AppError> {
    let review = state
        .reviews
        .get(&id)
        .ok_or_else(|| AppError::NotFound(format!("order {} has no rating", id)))?;

    Ok(Json(review.value().clone()))
}

async fn restart_dispatch(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<DispatchStarted>, AppError> {
    let order = state.order(id)?;
    if order.order_status.is_terminal() || order.driver_id.is_some() {
        return Err(AppError::StateConflict(format!(
            "order {} no longer needs a driver",
            id
        )));
    }

    Ok(Json(DispatchStarted {
        started: start_dispatch(&state, id),
    }))
}

async fn approve_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<StoreAction>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(orders::approve(&state, id, payload.store_id).await?))
}

async fn reject_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<StoreAction>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(
        orders::reject(&state, id, payload.store_id, payload.reason).await?,
    ))
}

async fn ready_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<StoreAction>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(orders::mark_ready(&state, id, payload.store_id).await?))
}

async fn pickup_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<DriverAction>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(
        orders::confirm_pickup(&state, id, payload.driver_id).await?,
    ))
}

async fn start_delivery(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<DriverAction>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(
        orders::start_delivery(&state, id, payload.driver_id).await?,
    ))
}

async fn complete_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<DriverAction>,
) -> Result<Json<CompletedDelivery>, AppError> {
    let (order, rating) = orders::complete_delivery(&state, id, payload.driver_id).await?;
    Ok(Json(CompletedDelivery { order, rating }))
}

async fn cancel_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CancelRequest>,
) -> Result<Json<Order>, AppError> {
    let (by, reason) = match payload {
        CancelRequest::Customer {
            customer_id,
            reason,
        } => (CancelledBy::Customer(customer_id), reason),
        CancelRequest::Store { store_id, reason } => (CancelledBy::Store(store_id), reason),
    };

    Ok(Json(orders::cancel(&state, id, by, reason).await?))
}
