//! Lifecycle of a single driver offer: creation with an armed expiry timer,
//! the driver's response, expiry with reassignment, and cancellation.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::DispatchSettings;
use crate::engine::guard;
use crate::engine::orders;
use crate::error::AppError;
use crate::geo::{find_nearest, planar_distance_km};
use crate::models::driver::{Driver, DriverStatus};
use crate::models::driver_request::{DriverRequest, DriverRequestStatus, OfferAction};
use crate::models::order::Order;
use crate::notify::Notification;
use crate::state::AppState;

pub const NO_DRIVERS_AVAILABLE: &str = "no drivers available";

#[derive(Debug, Clone)]
pub enum ExpiryOutcome {
    /// Expired while another offer or an assignment still covers the order.
    Expired,
    Reoffered(DriverRequest),
    OrderCancelled(Order),
}

/// Offers `order_id` to `driver_id` outside the dispatch loop.
pub async fn create_offer(
    state: &Arc<AppState>,
    order_id: Uuid,
    driver_id: Uuid,
) -> Result<DriverRequest, AppError> {
    let lock = state.order_lock(order_id);
    let _guard = lock.lock().await;

    let order = state.order(order_id)?;
    let driver = state.driver(driver_id)?;
    let location = driver
        .location
        .ok_or_else(|| AppError::BadRequest(format!("driver {driver_id} has no location")))?;
    if driver.status != DriverStatus::Active {
        return Err(AppError::StateConflict(format!(
            "driver {driver_id} is {:?}",
            driver.status
        )));
    }

    let distance_km = planar_distance_km(&location, &order.pickup);
    create_offer_locked(state, &order, &driver, distance_km)
}

/// Caller must hold the order lock.
pub(crate) fn create_offer_locked(
    state: &Arc<AppState>,
    order: &Order,
    driver: &Driver,
    distance_km: f64,
) -> Result<DriverRequest, AppError> {
    if order.order_status.is_terminal() {
        return Err(AppError::StateConflict(format!(
            "order {} is {:?}",
            order.id, order.order_status
        )));
    }

    let offers = state.offers_for_order(order.id);
    if offers
        .iter()
        .any(|offer| offer.status == DriverRequestStatus::Accepted)
    {
        return Err(AppError::StateConflict(format!(
            "order {} already has an accepted offer",
            order.id
        )));
    }
    if offers.iter().any(|offer| {
        offer.driver_id == driver.id && offer.status == DriverRequestStatus::Pending
    }) {
        return Err(AppError::StateConflict(format!(
            "driver {} already holds a pending offer for order {}",
            driver.id, order.id
        )));
    }

    let now = Utc::now();
    let (estimated_pickup_time, estimated_delivery_time) =
        estimate_times(&state.settings, distance_km, order, now)?;

    let offer = DriverRequest {
        id: Uuid::new_v4(),
        order_id: order.id,
        driver_id: driver.id,
        status: DriverRequestStatus::Pending,
        distance_km,
        estimated_pickup_time,
        estimated_delivery_time,
        created_at: now,
        updated_at: now,
    };

    state.driver_requests.insert(offer.id, offer.clone());
    arm_expiry(state, offer.id);
    state.metrics.offer("created");

    info!(
        order_id = %order.id,
        driver_id = %driver.id,
        offer_id = %offer.id,
        distance_km,
        "offer created"
    );

    state.notify(Notification::new(
        driver.device_token.clone(),
        "New delivery request",
        format!("Pickup {:.1} km away", distance_km),
        json!({ "offer_id": offer.id, "order_id": order.id }),
    ));

    Ok(offer)
}

fn arm_expiry(state: &Arc<AppState>, offer_id: Uuid) {
    let timer_state = state.clone();
    state
        .offer_timers
        .arm_after(offer_id, state.settings.offer_ttl, move |handle| async move {
            match expire(&timer_state, offer_id).await {
                Ok(outcome) => debug!(offer_id = %offer_id, ?outcome, "offer timer fired"),
                Err(err) => debug!(
                    offer_id = %offer_id,
                    error = %err,
                    "offer timer found nothing to expire"
                ),
            }
            timer_state.offer_timers.release(&handle);
        });
}

/// Applies the driver's answer to a pending offer.
pub async fn respond(
    state: &Arc<AppState>,
    offer_id: Uuid,
    driver_id: Uuid,
    action: OfferAction,
) -> Result<DriverRequest, AppError> {
    let order_id = state.offer(offer_id)?.order_id;
    let lock = state.order_lock(order_id);
    let _guard = lock.lock().await;

    let mut offer = state.offer(offer_id)?;
    if offer.driver_id != driver_id {
        return Err(AppError::Forbidden(format!(
            "offer {offer_id} belongs to another driver"
        )));
    }
    if offer.status != DriverRequestStatus::Pending {
        return Err(AppError::StateConflict(format!(
            "offer {offer_id} is {:?}",
            offer.status
        )));
    }

    match action {
        OfferAction::Reject => {
            state.offer_timers.disarm(&offer_id);
            offer.transition(DriverRequestStatus::Rejected)?;
            state.driver_requests.insert(offer.id, offer.clone());
            state.metrics.offer("rejected");

            info!(
                order_id = %order_id,
                driver_id = %driver_id,
                offer_id = %offer_id,
                "offer rejected"
            );
            Ok(offer)
        }
        OfferAction::Accept => guard::accept_locked(state, offer),
    }
}

/// Expires a pending offer and tries to hand the order to someone else.
pub async fn expire(state: &Arc<AppState>, offer_id: Uuid) -> Result<ExpiryOutcome, AppError> {
    let order_id = state.offer(offer_id)?.order_id;
    let lock = state.order_lock(order_id);
    let _guard = lock.lock().await;

    let offer = state.offer(offer_id)?;
    if offer.status != DriverRequestStatus::Pending {
        return Err(AppError::StateConflict(format!(
            "offer {offer_id} is {:?}",
            offer.status
        )));
    }
    expire_locked(state, offer)?;

    let order = state.order(order_id)?;
    if order.order_status.is_terminal() || order.driver_id.is_some() {
        return Ok(ExpiryOutcome::Expired);
    }

    let offers = state.offers_for_order(order_id);
    if offers
        .iter()
        .any(|other| other.status == DriverRequestStatus::Pending)
    {
        return Ok(ExpiryOutcome::Expired);
    }

    match next_candidate(state, &order, &offers) {
        Some((driver, distance_km)) => {
            let reoffer = create_offer_locked(state, &order, &driver, distance_km)?;
            Ok(ExpiryOutcome::Reoffered(reoffer))
        }
        None => {
            warn!(order_id = %order_id, "no other driver to reassign to; cancelling order");
            let cancelled = orders::cancel_locked(state, order_id, NO_DRIVERS_AVAILABLE)?;
            Ok(ExpiryOutcome::OrderCancelled(cancelled))
        }
    }
}

/// Moves a pending offer to `expired`. Caller must hold the order lock.
pub(crate) fn expire_locked(
    state: &AppState,
    mut offer: DriverRequest,
) -> Result<DriverRequest, AppError> {
    state.offer_timers.disarm(&offer.id);
    offer.transition(DriverRequestStatus::Expired)?;
    state.driver_requests.insert(offer.id, offer.clone());
    state.metrics.offer("expired");
    info!(
        order_id = %offer.order_id,
        driver_id = %offer.driver_id,
        offer_id = %offer.id,
        "offer expired"
    );
    Ok(offer)
}

/// Nearest active driver who has not been offered this order yet.
pub(crate) fn next_candidate(
    state: &AppState,
    order: &Order,
    offers: &[DriverRequest],
) -> Option<(Driver, f64)> {
    let excluded = excluded_drivers(offers);
    let candidates: Vec<Driver> = state
        .drivers
        .iter()
        .map(|entry| entry.value().clone())
        .collect();

    find_nearest(
        &order.pickup,
        &candidates,
        state.settings.search_radius_km,
        &excluded,
    )
}

/// Moves every open offer of the order to `cancelled` and frees the
/// driver holding an accepted one. Caller must hold the order lock.
pub(crate) fn cancel_open_offers_locked(state: &AppState, order_id: Uuid) -> Vec<DriverRequest> {
    let mut cancelled = Vec::new();

    for mut offer in state.offers_for_order(order_id) {
        if offer.status.is_terminal() {
            continue;
        }

        let was_accepted = offer.status == DriverRequestStatus::Accepted;
        state.offer_timers.disarm(&offer.id);
        if let Err(err) = offer.transition(DriverRequestStatus::Cancelled) {
            warn!(offer_id = %offer.id, error = %err, "could not cancel offer");
            continue;
        }
        state.driver_requests.insert(offer.id, offer.clone());
        state.metrics.offer("cancelled");

        if was_accepted {
            if let Some(mut driver) = state.drivers.get_mut(&offer.driver_id) {
                driver.status = DriverStatus::Active;
                driver.updated_at = Utc::now();
            }
        }

        cancelled.push(offer);
    }

    cancelled
}

/// Drivers who already had a shot at this order are never offered it again.
pub(crate) fn excluded_drivers(offers: &[DriverRequest]) -> HashSet<Uuid> {
    offers.iter().map(|offer| offer.driver_id).collect()
}

pub(crate) fn estimate_times(
    settings: &DispatchSettings,
    driver_to_pickup_km: f64,
    order: &Order,
    now: DateTime<Utc>,
) -> Result<(DateTime<Utc>, DateTime<Utc>), AppError> {
    let leg_km = planar_distance_km(&order.pickup, &order.dropoff);
    let pickup = now
        .checked_add_signed(travel_time(settings, driver_to_pickup_km)?)
        .ok_or_else(|| out_of_range(driver_to_pickup_km))?;
    let delivery = pickup
        .checked_add_signed(travel_time(settings, leg_km)?)
        .ok_or_else(|| out_of_range(leg_km))?;
    Ok((pickup, delivery))
}

fn travel_time(settings: &DispatchSettings, km: f64) -> Result<ChronoDuration, AppError> {
    let seconds = (km.max(0.0) / settings.average_speed_kmh * 3600.0).round();
    if !seconds.is_finite() || seconds >= i64::MAX as f64 {
        return Err(out_of_range(km));
    }
    ChronoDuration::try_seconds(seconds as i64).ok_or_else(|| out_of_range(km))
}

fn out_of_range(km: f64) -> AppError {
    AppError::BadRequest(format!("travel distance of {km} km is out of range"))
}
