//! Order lifecycle: store decisions, driver pickup and delivery, and
//! cancellation. Each public operation runs under the order lock and
//! appends exactly one tracking entry per transition.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::{dispatch, offers, rating};
use crate::error::AppError;
use crate::models::driver::DriverStatus;
use crate::models::driver_request::{DriverRequest, DriverRequestStatus};
use crate::models::menu::OrderItem;
use crate::models::order::{DeliveryStatus, NewOrder, Order, OrderStatus};
use crate::models::review::DeliveryRating;
use crate::notify::Notification;
use crate::state::AppState;

#[derive(Debug, Clone, Copy)]
pub enum CancelledBy {
    Customer(Uuid),
    Store(Uuid),
    System,
}

/// Reserves stock, stores the order as `pending` and starts its driver search.
pub async fn place_order(state: &Arc<AppState>, new: NewOrder) -> Result<Order, AppError> {
    if new.items.is_empty() {
        return Err(AppError::BadRequest("order has no items".to_string()));
    }
    new.pickup.validate()?;
    new.dropoff.validate()?;

    reserve_inventory(state, new.store_id, &new.items)?;

    let order = Order::place(new);
    state.orders.insert(order.id, order.clone());
    state.publish(&order, "order_placed");
    info!(order_id = %order.id, store_id = %order.store_id, "order placed");

    dispatch::start_dispatch(state, order.id);
    Ok(order)
}

pub async fn approve(
    state: &Arc<AppState>,
    order_id: Uuid,
    store_id: Uuid,
) -> Result<Order, AppError> {
    let lock = state.order_lock(order_id);
    let _guard = lock.lock().await;

    let mut order = store_order(state, order_id, store_id)?;
    require_pending(&order)?;
    order.transition(OrderStatus::Preparing, None, "order approved by store", None)?;
    commit(state, &order, "order_approved");

    state.notify(Notification::new(
        order.customer_token.clone(),
        "Order accepted",
        "The store is preparing your order",
        json!({ "order_id": order.id }),
    ));
    Ok(order)
}

pub async fn reject(
    state: &Arc<AppState>,
    order_id: Uuid,
    store_id: Uuid,
    reason: Option<String>,
) -> Result<Order, AppError> {
    let lock = state.order_lock(order_id);
    let _guard = lock.lock().await;

    let mut order = store_order(state, order_id, store_id)?;
    require_pending(&order)?;

    let reason = reason.unwrap_or_else(|| "rejected by store".to_string());
    order.transition(
        OrderStatus::Rejected,
        Some(DeliveryStatus::Rejected),
        format!("order rejected: {reason}"),
        None,
    )?;
    order.cancel_reason = Some(reason);
    release_order(state, &mut order);
    commit(state, &order, "order_rejected");

    state.notify(Notification::new(
        order.customer_token.clone(),
        "Order rejected",
        "The store could not take your order",
        json!({ "order_id": order.id }),
    ));
    Ok(order)
}

pub async fn mark_ready(
    state: &Arc<AppState>,
    order_id: Uuid,
    store_id: Uuid,
) -> Result<Order, AppError> {
    let lock = state.order_lock(order_id);
    let _guard = lock.lock().await;

    let mut order = store_order(state, order_id, store_id)?;
    order.transition(OrderStatus::ReadyForPickup, None, "order ready for pickup", None)?;
    commit(state, &order, "order_ready");

    if let Some(driver_id) = order.driver_id {
        let token = state.driver(driver_id).ok().and_then(|driver| driver.device_token);
        state.notify(Notification::new(
            token,
            "Order ready",
            "The order is ready for pickup",
            json!({ "order_id": order.id }),
        ));
    }
    Ok(order)
}

/// Driver confirms the parcel is in hand before leaving the store.
pub async fn confirm_pickup(
    state: &Arc<AppState>,
    order_id: Uuid,
    driver_id: Uuid,
) -> Result<Order, AppError> {
    let lock = state.order_lock(order_id);
    let _guard = lock.lock().await;

    accepted_offer_of(state, order_id, driver_id)?;
    let mut order = state.order(order_id)?;
    if order.order_status != OrderStatus::ReadyForPickup {
        return Err(AppError::StateConflict(format!(
            "order {order_id} is {:?}, not ready for pickup",
            order.order_status
        )));
    }

    let location = state.driver(driver_id)?.location;
    order.advance_delivery(DeliveryStatus::PickedUp, "order picked up", location)?;
    order.record_pickup(Utc::now());
    commit(state, &order, "order_picked_up");

    state.notify(Notification::new(
        order.customer_token.clone(),
        "Order picked up",
        "Your driver has collected the order",
        json!({ "order_id": order.id }),
    ));
    Ok(order)
}

pub async fn start_delivery(
    state: &Arc<AppState>,
    order_id: Uuid,
    driver_id: Uuid,
) -> Result<Order, AppError> {
    let lock = state.order_lock(order_id);
    let _guard = lock.lock().await;

    accepted_offer_of(state, order_id, driver_id)?;
    let mut order = state.order(order_id)?;
    let location = state.driver(driver_id)?.location;

    order.transition(
        OrderStatus::OnDelivery,
        Some(DeliveryStatus::OnWay),
        "driver on the way",
        location,
    )?;
    order.record_pickup(Utc::now());
    commit(state, &order, "order_on_delivery");

    state.notify(Notification::new(
        order.customer_token.clone(),
        "On the way",
        "Your order is on its way",
        json!({ "order_id": order.id }),
    ));
    Ok(order)
}

/// Marks the order delivered, closes the winning offer, frees the driver and
/// records the punctuality rating.
pub async fn complete_delivery(
    state: &Arc<AppState>,
    order_id: Uuid,
    driver_id: Uuid,
) -> Result<(Order, DeliveryRating), AppError> {
    let lock = state.order_lock(order_id);
    let _guard = lock.lock().await;

    let mut offer = accepted_offer_of(state, order_id, driver_id)?;
    let mut order = state.order(order_id)?;
    let location = state.driver(driver_id)?.location;

    order.transition(
        OrderStatus::Delivered,
        Some(DeliveryStatus::Delivered),
        "order delivered",
        location,
    )?;
    order.record_delivery(Utc::now());

    offer.transition(DriverRequestStatus::Completed)?;
    state.driver_requests.insert(offer.id, offer.clone());
    state.metrics.offer("completed");

    if let Some(mut driver) = state.drivers.get_mut(&driver_id) {
        driver.status = DriverStatus::Active;
        driver.updated_at = Utc::now();
    }

    commit(state, &order, "order_delivered");
    let review = rating::rate_locked(state, &order)?;

    state.notify(Notification::new(
        order.customer_token.clone(),
        "Delivered",
        "Your order has arrived",
        json!({ "order_id": order.id, "rating": review.rating }),
    ));
    Ok((order, review))
}

pub async fn cancel(
    state: &Arc<AppState>,
    order_id: Uuid,
    by: CancelledBy,
    reason: Option<String>,
) -> Result<Order, AppError> {
    let lock = state.order_lock(order_id);
    let _guard = lock.lock().await;

    let order = state.order(order_id)?;
    let default_reason = match by {
        CancelledBy::Customer(customer_id) => {
            if order.customer_id != customer_id {
                return Err(AppError::Forbidden(format!(
                    "order {order_id} belongs to another customer"
                )));
            }
            "cancelled by customer"
        }
        CancelledBy::Store(store_id) => {
            if order.store_id != store_id {
                return Err(AppError::Forbidden(format!(
                    "order {order_id} belongs to another store"
                )));
            }
            "cancelled by store"
        }
        CancelledBy::System => "cancelled",
    };

    let reason = reason.unwrap_or_else(|| default_reason.to_string());
    cancel_locked(state, order_id, &reason)
}

/// Caller must hold the order lock.
pub(crate) fn cancel_locked(
    state: &AppState,
    order_id: Uuid,
    reason: &str,
) -> Result<Order, AppError> {
    let mut order = state.order(order_id)?;
    let driver_id = order.driver_id;

    order.transition(
        OrderStatus::Cancelled,
        Some(DeliveryStatus::Rejected),
        format!("order cancelled: {reason}"),
        None,
    )?;
    order.cancel_reason = Some(reason.to_string());
    release_order(state, &mut order);
    commit(state, &order, "order_cancelled");

    state.notify(Notification::new(
        order.customer_token.clone(),
        "Order cancelled",
        reason.to_string(),
        json!({ "order_id": order.id }),
    ));
    if let Some(driver_id) = driver_id {
        let token = state.driver(driver_id).ok().and_then(|driver| driver.device_token);
        state.notify(Notification::new(
            token,
            "Order cancelled",
            reason.to_string(),
            json!({ "order_id": order.id }),
        ));
    }
    Ok(order)
}

/// Tears down everything a resolved-without-delivery order still holds:
/// the search, open offers, the assigned driver and reserved stock.
fn release_order(state: &AppState, order: &mut Order) {
    state.dispatch_tasks.disarm(&order.id);
    offers::cancel_open_offers_locked(state, order.id);
    order.driver_id = None;
    restore_inventory(state, &order.items);
}

fn reserve_inventory(
    state: &AppState,
    store_id: Uuid,
    items: &[OrderItem],
) -> Result<(), AppError> {
    let mut reserved: Vec<&OrderItem> = Vec::new();

    for item in items {
        let outcome = match state.menu_items.get_mut(&item.menu_item_id) {
            None => Err(AppError::NotFound(format!(
                "menu item {} not found",
                item.menu_item_id
            ))),
            Some(menu_item) if menu_item.store_id != store_id => {
                Err(AppError::BadRequest(format!(
                    "menu item {} is not sold by store {store_id}",
                    item.menu_item_id
                )))
            }
            Some(menu_item) if menu_item.quantity < item.quantity => {
                Err(AppError::BadRequest(format!(
                    "menu item {} has only {} left",
                    item.menu_item_id, menu_item.quantity
                )))
            }
            Some(mut menu_item) => {
                menu_item.quantity -= item.quantity;
                Ok(())
            }
        };

        if let Err(err) = outcome {
            restore_inventory_items(state, reserved.into_iter());
            return Err(err);
        }
        reserved.push(item);
    }

    Ok(())
}

fn restore_inventory(state: &AppState, items: &[OrderItem]) {
    restore_inventory_items(state, items.iter());
}

fn restore_inventory_items<'a>(state: &AppState, items: impl Iterator<Item = &'a OrderItem>) {
    for item in items {
        match state.menu_items.get_mut(&item.menu_item_id) {
            Some(mut menu_item) => {
                menu_item.quantity = menu_item.quantity.saturating_add(item.quantity)
            }
            None => warn!(
                menu_item_id = %item.menu_item_id,
                "menu item vanished; stock not restored"
            ),
        }
    }
}

fn store_order(state: &AppState, order_id: Uuid, store_id: Uuid) -> Result<Order, AppError> {
    let order = state.order(order_id)?;
    if order.store_id != store_id {
        return Err(AppError::Forbidden(format!(
            "order {order_id} belongs to another store"
        )));
    }
    Ok(order)
}

fn require_pending(order: &Order) -> Result<(), AppError> {
    if order.order_status != OrderStatus::Pending {
        return Err(AppError::StateConflict(format!(
            "order {} is {:?}, not pending",
            order.id, order.order_status
        )));
    }
    Ok(())
}

/// The acting driver must hold the accepted offer for this order.
fn accepted_offer_of(
    state: &AppState,
    order_id: Uuid,
    driver_id: Uuid,
) -> Result<DriverRequest, AppError> {
    state
        .offers_for_order(order_id)
        .into_iter()
        .find(|offer| {
            offer.driver_id == driver_id && offer.status == DriverRequestStatus::Accepted
        })
        .ok_or_else(|| {
            AppError::Forbidden(format!(
                "driver {driver_id} holds no accepted offer for order {order_id}"
            ))
        })
}

fn commit(state: &AppState, order: &Order, kind: &str) {
    state.orders.insert(order.id, order.clone());
    if order.order_status.is_terminal() {
        state.forget_order_lock(order.id);
    }
    state.publish(order, kind);
    info!(
        order_id = %order.id,
        status = ?order.order_status,
        delivery = ?order.delivery_status,
        kind,
        "order updated"
    );
}
