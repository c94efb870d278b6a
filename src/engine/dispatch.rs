//! Per-order driver search.
//!
//! Each unresolved order gets one background loop registered under its id.
//! The first pass runs immediately, later passes follow the search interval.
//! The loop ends when an offer is accepted, the order is resolved elsewhere,
//! the deadline passes, or the attempt cap is hit; the last two cancel the
//! order.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep_until};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::timers::TaskHandle;
use crate::engine::{offers, orders};
use crate::error::AppError;
use crate::geo::find_nearest;
use crate::models::driver::{Driver, DriverStatus, GeoPoint};
use crate::models::driver_request::{DriverRequest, DriverRequestStatus};
use crate::models::order::Order;
use crate::models::service_order::{ServiceOrder, ServiceStatus};
use crate::notify::Notification;
use crate::state::AppState;

pub const SEARCH_TIMED_OUT: &str = "driver search timed out";
pub const SEARCH_EXHAUSTED: &str = "driver search exhausted";

#[derive(Debug, Clone)]
pub enum PassOutcome {
    Assigned,
    /// The order reached a terminal state without an assignment.
    Resolved,
    AwaitingResponse,
    Offered(DriverRequest),
    NoCandidate,
}

impl PassOutcome {
    fn label(&self) -> &'static str {
        match self {
            PassOutcome::Assigned => "assigned",
            PassOutcome::Resolved => "resolved",
            PassOutcome::AwaitingResponse => "awaiting_response",
            PassOutcome::Offered(_) => "offered",
            PassOutcome::NoCandidate => "no_candidate",
        }
    }

    fn ends_search(&self) -> bool {
        matches!(self, PassOutcome::Assigned | PassOutcome::Resolved)
    }
}

enum Finish {
    Stopped,
    Deadline,
    Exhausted(u32),
}

/// Starts the search loop for `order_id`. Returns `false` when one is
/// already running.
pub fn start_dispatch(state: &Arc<AppState>, order_id: Uuid) -> bool {
    if state.dispatch_tasks.is_armed(&order_id) {
        debug!(order_id = %order_id, "dispatch already running");
        return false;
    }

    let task_state = state.clone();
    state
        .dispatch_tasks
        .spawn(order_id, move |handle| run_dispatch(task_state, handle));
    true
}

/// Restarts searches for every order still waiting on a driver.
pub fn resume_dispatches(state: &Arc<AppState>) -> usize {
    let waiting: Vec<Uuid> = state
        .orders
        .iter()
        .filter(|entry| {
            let order = entry.value();
            !order.order_status.is_terminal() && order.driver_id.is_none()
        })
        .map(|entry| *entry.key())
        .collect();

    waiting
        .into_iter()
        .filter(|order_id| start_dispatch(state, *order_id))
        .count()
}

async fn run_dispatch(state: Arc<AppState>, handle: TaskHandle) {
    let order_id = handle.key;
    let settings = state.settings.clone();
    state.metrics.active_dispatches.inc();
    info!(order_id = %order_id, "driver search started");

    let deadline = Instant::now() + settings.search_deadline;
    let mut ticker = interval(settings.search_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut attempts = 0u32;

    let finish = loop {
        tokio::select! {
            biased;
            _ = handle.token.cancelled() => break Finish::Stopped,
            _ = sleep_until(deadline) => break Finish::Deadline,
            _ = ticker.tick() => {}
        }

        attempts += 1;
        match search_pass(&state, order_id).await {
            Ok(outcome) if outcome.ends_search() => break Finish::Stopped,
            Ok(outcome) => debug!(
                order_id = %order_id,
                attempts,
                outcome = outcome.label(),
                "search pass"
            ),
            Err(AppError::NotFound(_)) => break Finish::Stopped,
            Err(err) => warn!(order_id = %order_id, error = %err, "search pass failed"),
        }

        if attempts >= settings.max_search_attempts {
            break Finish::Exhausted(attempts);
        }
    };

    let abandon_reason = match finish {
        Finish::Stopped => None,
        Finish::Deadline => Some(SEARCH_TIMED_OUT.to_string()),
        Finish::Exhausted(attempts) => {
            Some(format!("{SEARCH_EXHAUSTED} after {attempts} attempts"))
        }
    };
    if let Some(reason) = abandon_reason {
        match abandon_search(&state, order_id, &reason).await {
            Ok(_) => warn!(order_id = %order_id, reason = %reason, "driver search abandoned"),
            Err(err) => debug!(
                order_id = %order_id,
                error = %err,
                "search ended on a resolved order"
            ),
        }
    }

    state.dispatch_tasks.release(&handle);
    state.metrics.active_dispatches.dec();
    info!(order_id = %order_id, attempts, "driver search stopped");
}

/// One matching pass. Safe to call repeatedly; it checks the current order
/// and offer state before creating anything.
pub async fn search_pass(state: &Arc<AppState>, order_id: Uuid) -> Result<PassOutcome, AppError> {
    let lock = state.order_lock(order_id);
    let _guard = lock.lock().await;

    let outcome = pass_locked(state, order_id);
    match &outcome {
        Ok(outcome) => state.metrics.pass(outcome.label()),
        Err(_) => state.metrics.pass("error"),
    }
    outcome
}

fn pass_locked(state: &Arc<AppState>, order_id: Uuid) -> Result<PassOutcome, AppError> {
    let order = state.order(order_id)?;
    if order.order_status.is_terminal() {
        return Ok(PassOutcome::Resolved);
    }

    let offers = state.offers_for_order(order_id);
    if order.driver_id.is_some()
        || offers
            .iter()
            .any(|offer| offer.status == DriverRequestStatus::Accepted)
    {
        return Ok(PassOutcome::Assigned);
    }
    if offers
        .iter()
        .any(|offer| offer.status == DriverRequestStatus::Pending)
    {
        return Ok(PassOutcome::AwaitingResponse);
    }

    match offers::next_candidate(state, &order, &offers) {
        Some((driver, distance_km)) => {
            let offer = offers::create_offer_locked(state, &order, &driver, distance_km)?;
            Ok(PassOutcome::Offered(offer))
        }
        None => Ok(PassOutcome::NoCandidate),
    }
}

/// Cancels an order whose search ran out, unless a driver got it meanwhile.
///
/// Offers still pending at this point are expired first. When nobody else
/// could take the order the cancellation carries the expiry reason.
async fn abandon_search(
    state: &Arc<AppState>,
    order_id: Uuid,
    reason: &str,
) -> Result<Order, AppError> {
    let lock = state.order_lock(order_id);
    let _guard = lock.lock().await;

    let order = state.order(order_id)?;
    if order.driver_id.is_some() || order.order_status.is_terminal() {
        return Err(AppError::StateConflict(format!(
            "order {order_id} already resolved"
        )));
    }
    state.metrics.pass("exhausted");

    let pending: Vec<DriverRequest> = state
        .offers_for_order(order_id)
        .into_iter()
        .filter(|offer| offer.status == DriverRequestStatus::Pending)
        .collect();
    if pending.is_empty() {
        return orders::cancel_locked(state, order_id, reason);
    }

    for offer in pending {
        offers::expire_locked(state, offer)?;
    }
    let offers = state.offers_for_order(order_id);
    let reason = match offers::next_candidate(state, &order, &offers) {
        Some(_) => reason,
        None => offers::NO_DRIVERS_AVAILABLE,
    };
    orders::cancel_locked(state, order_id, reason)
}

fn snapshot_drivers(state: &AppState) -> Vec<Driver> {
    state
        .drivers
        .iter()
        .map(|entry| entry.value().clone())
        .collect()
}

#[derive(Debug, Deserialize)]
pub struct NewServiceOrder {
    pub customer_id: Uuid,
    pub customer_token: Option<String>,
    pub description: String,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
}

/// Stores an errand ticket and starts its immediate-assign search.
pub fn place_service_order(
    state: &Arc<AppState>,
    new: NewServiceOrder,
) -> Result<ServiceOrder, AppError> {
    if new.description.trim().is_empty() {
        return Err(AppError::BadRequest("description cannot be empty".to_string()));
    }
    new.pickup.validate()?;
    new.dropoff.validate()?;

    let now = Utc::now();
    let ticket = ServiceOrder {
        id: Uuid::new_v4(),
        customer_id: new.customer_id,
        customer_token: new.customer_token,
        description: new.description,
        pickup: new.pickup,
        dropoff: new.dropoff,
        status: ServiceStatus::Searching,
        driver_id: None,
        attempts: 0,
        cancel_reason: None,
        created_at: now,
        updated_at: now,
    };

    state.service_orders.insert(ticket.id, ticket.clone());
    info!(service_order_id = %ticket.id, "service order placed");

    let task_state = state.clone();
    state
        .dispatch_tasks
        .spawn(ticket.id, move |handle| run_service_search(task_state, handle));
    Ok(ticket)
}

async fn run_service_search(state: Arc<AppState>, handle: TaskHandle) {
    let ticket_id = handle.key;
    let mut ticker = interval(state.settings.search_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = handle.token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match service_pass(&state, ticket_id).await {
            Ok(true) => break,
            Ok(false) => {}
            Err(AppError::NotFound(_)) => break,
            Err(AppError::Exhausted(reason)) => {
                warn!(service_order_id = %ticket_id, reason = %reason, "service search exhausted");
                break;
            }
            Err(err) => warn!(service_order_id = %ticket_id, error = %err, "service pass failed"),
        }
    }

    state.dispatch_tasks.release(&handle);
}

/// Assigns the nearest active driver outright. Returns `true` once the
/// ticket no longer needs searching.
pub async fn service_pass(state: &Arc<AppState>, ticket_id: Uuid) -> Result<bool, AppError> {
    let lock = state.order_lock(ticket_id);
    let _guard = lock.lock().await;

    let mut ticket = state
        .service_orders
        .get(&ticket_id)
        .map(|entry| entry.value().clone())
        .ok_or_else(|| AppError::NotFound(format!("service order {ticket_id} not found")))?;
    if ticket.status != ServiceStatus::Searching {
        return Ok(true);
    }

    ticket.attempts += 1;
    ticket.updated_at = Utc::now();

    let candidates = snapshot_drivers(state);
    let mut excluded = HashSet::new();
    loop {
        let Some((driver, distance_km)) = find_nearest(
            &ticket.pickup,
            &candidates,
            state.settings.search_radius_km,
            &excluded,
        ) else {
            break;
        };

        if claim_driver(state, driver.id) {
            ticket.status = ServiceStatus::DriverFound;
            ticket.driver_id = Some(driver.id);
            state.service_orders.insert(ticket.id, ticket.clone());
            state.metrics.pass("assigned");

            info!(
                service_order_id = %ticket.id,
                driver_id = %driver.id,
                distance_km,
                "service driver found"
            );
            state.notify(Notification::new(
                driver.device_token.clone(),
                "New service order",
                ticket.description.clone(),
                json!({ "service_order_id": ticket.id }),
            ));
            state.notify(Notification::new(
                ticket.customer_token.clone(),
                "Driver found",
                format!("{} is on the way", driver.name),
                json!({ "service_order_id": ticket.id, "driver_id": driver.id }),
            ));
            return Ok(true);
        }

        // Lost the driver to another assignment since the snapshot.
        excluded.insert(driver.id);
    }

    state.metrics.pass("no_candidate");
    if ticket.attempts >= state.settings.service_max_attempts {
        ticket.status = ServiceStatus::Cancelled;
        ticket.cancel_reason = Some(offers::NO_DRIVERS_AVAILABLE.to_string());
        state.service_orders.insert(ticket.id, ticket.clone());
        state.forget_order_lock(ticket.id);

        state.notify(Notification::new(
            ticket.customer_token.clone(),
            "Service order cancelled",
            offers::NO_DRIVERS_AVAILABLE,
            json!({ "service_order_id": ticket.id }),
        ));
        return Err(AppError::Exhausted(format!(
            "service order {ticket_id} found no driver in {} attempts",
            ticket.attempts
        )));
    }

    state.service_orders.insert(ticket.id, ticket);
    Ok(false)
}

/// Driver finishes the errand and becomes available again.
pub async fn complete_service_order(
    state: &Arc<AppState>,
    ticket_id: Uuid,
    driver_id: Uuid,
) -> Result<ServiceOrder, AppError> {
    let lock = state.order_lock(ticket_id);
    let _guard = lock.lock().await;

    let mut ticket = state
        .service_orders
        .get(&ticket_id)
        .map(|entry| entry.value().clone())
        .ok_or_else(|| AppError::NotFound(format!("service order {ticket_id} not found")))?;
    if ticket.driver_id != Some(driver_id) {
        return Err(AppError::Forbidden(format!(
            "service order {ticket_id} is not assigned to driver {driver_id}"
        )));
    }
    if ticket.status != ServiceStatus::DriverFound {
        return Err(AppError::StateConflict(format!(
            "service order {ticket_id} is {:?}",
            ticket.status
        )));
    }

    ticket.status = ServiceStatus::Completed;
    ticket.updated_at = Utc::now();
    state.service_orders.insert(ticket.id, ticket.clone());
    state.forget_order_lock(ticket.id);

    if let Some(mut driver) = state.drivers.get_mut(&driver_id) {
        driver.status = DriverStatus::Active;
        driver.updated_at = Utc::now();
    }

    info!(service_order_id = %ticket.id, driver_id = %driver_id, "service order completed");
    Ok(ticket)
}

fn claim_driver(state: &AppState, driver_id: Uuid) -> bool {
    match state.drivers.get_mut(&driver_id) {
        Some(mut driver) if driver.status == DriverStatus::Active => {
            driver.status = DriverStatus::Busy;
            driver.updated_at = Utc::now();
            true
        }
        _ => false,
    }
}
