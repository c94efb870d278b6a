//! Single-winner arbitration for offer acceptance.
//!
//! Runs inside the order's critical section, so the rival check and the
//! writes that follow cannot interleave with another accept, an expiry, or
//! a cancellation of the same order.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use crate::error::AppError;
use crate::models::driver::DriverStatus;
use crate::models::driver_request::{DriverRequest, DriverRequestStatus};
use crate::notify::Notification;
use crate::state::AppState;

/// Caller must hold the order lock and have checked the offer is pending.
pub(crate) fn accept_locked(
    state: &Arc<AppState>,
    offer: DriverRequest,
) -> Result<DriverRequest, AppError> {
    let mut order = state.order(offer.order_id)?;
    if order.order_status.is_terminal() {
        return Err(AppError::StateConflict(format!(
            "order {} is {:?}",
            order.id, order.order_status
        )));
    }

    let mut accepted = offer.clone();
    accepted.transition(DriverRequestStatus::Accepted)?;

    let rival = state.driver_requests.iter().any(|entry| {
        let other = entry.value();
        other.order_id == accepted.order_id
            && other.id != accepted.id
            && other.status == DriverRequestStatus::Accepted
    });
    if rival || order.driver_id.is_some() {
        // The tentative accept is never written; the offer stays pending.
        state.metrics.offer("conflict");
        warn!(
            order_id = %order.id,
            driver_id = %offer.driver_id,
            offer_id = %offer.id,
            "accept lost the race"
        );
        return Err(AppError::AssignmentConflict(order.id.to_string()));
    }

    // Claim the driver atomically; they may be racing on another order.
    let driver = {
        let mut driver = state
            .drivers
            .get_mut(&accepted.driver_id)
            .ok_or_else(|| AppError::NotFound(format!("driver {} not found", accepted.driver_id)))?;
        if driver.status != DriverStatus::Active {
            return Err(AppError::StateConflict(format!(
                "driver {} is {:?}",
                driver.id, driver.status
            )));
        }
        driver.status = DriverStatus::Busy;
        driver.updated_at = Utc::now();
        driver.clone()
    };

    state.offer_timers.disarm(&accepted.id);
    state.driver_requests.insert(accepted.id, accepted.clone());

    order.driver_id = Some(driver.id);
    order.estimated_pickup_time = Some(accepted.estimated_pickup_time);
    order.estimated_delivery_time = Some(accepted.estimated_delivery_time);
    order.note(
        format!("driver {} assigned", driver.name),
        driver.location,
        Some(accepted.distance_km),
    );
    state.orders.insert(order.id, order.clone());

    state.dispatch_tasks.disarm(&order.id);
    state.metrics.offer("accepted");
    let waited = (Utc::now() - order.created_at).num_milliseconds().max(0) as f64 / 1000.0;
    state.metrics.time_to_assignment_seconds.observe(waited);

    info!(order_id = %order.id, driver_id = %driver.id, offer_id = %accepted.id, "offer accepted");

    state.publish(&order, "driver_assigned");
    state.notify(Notification::new(
        order.customer_token.clone(),
        "Driver found",
        format!("{} is heading to the store", driver.name),
        json!({ "order_id": order.id, "driver_id": driver.id }),
    ));
    for loser in state
        .offers_for_order(order.id)
        .into_iter()
        .filter(|other| other.status == DriverRequestStatus::Pending)
    {
        let token = state
            .drivers
            .get(&loser.driver_id)
            .and_then(|entry| entry.value().device_token.clone());
        state.notify(Notification::new(
            token,
            "Order taken",
            "Another driver accepted this order",
            json!({ "offer_id": loser.id, "order_id": order.id }),
        ));
    }

    Ok(accepted)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::Value;

    use super::*;
    use crate::engine::offers::{create_offer, respond};
    use crate::engine::testing::{add_driver, add_order, state, state_notifying};
    use crate::models::driver_request::OfferAction;
    use crate::notify::Notifier;

    struct GatewayDown {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Notifier for GatewayDown {
        async fn notify(&self, _: &str, _: &str, _: &str, _: Value) -> Result<(), AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(AppError::DependencyFailure("push gateway down".to_string()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn accept_commits_even_when_every_notification_fails() {
        let gateway = Arc::new(GatewayDown {
            calls: AtomicU32::new(0),
        });
        let state = state_notifying(gateway.clone());
        let driver = add_driver(&state, 1.0);
        let order = add_order(&state);
        let offer = create_offer(&state, order.id, driver.id).await.unwrap();

        let accepted = respond(&state, offer.id, driver.id, OfferAction::Accept)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(gateway.calls.load(Ordering::SeqCst) > 0);
        assert_eq!(accepted.status, DriverRequestStatus::Accepted);
        assert_eq!(state.offer(offer.id).unwrap().status, DriverRequestStatus::Accepted);
        assert_eq!(state.order(order.id).unwrap().driver_id, Some(driver.id));
        assert_eq!(state.driver(driver.id).unwrap().status, DriverStatus::Busy);
    }

    #[tokio::test]
    async fn accept_binds_driver_and_order() {
        let state = state();
        let driver = add_driver(&state, 1.0);
        let order = add_order(&state);
        let offer = create_offer(&state, order.id, driver.id).await.unwrap();

        let accepted = respond(&state, offer.id, driver.id, OfferAction::Accept)
            .await
            .unwrap();

        assert_eq!(accepted.status, DriverRequestStatus::Accepted);
        assert_eq!(state.driver(driver.id).unwrap().status, DriverStatus::Busy);
        let order = state.order(order.id).unwrap();
        assert_eq!(order.driver_id, Some(driver.id));
        assert_eq!(order.estimated_pickup_time, Some(accepted.estimated_pickup_time));
        assert_eq!(order.estimated_delivery_time, Some(accepted.estimated_delivery_time));
        assert!(!state.offer_timers.is_armed(&offer.id));
    }

    #[tokio::test]
    async fn second_accept_loses_and_stays_pending() {
        let state = state();
        let first = add_driver(&state, 1.0);
        let second = add_driver(&state, 2.0);
        let order = add_order(&state);
        let first_offer = create_offer(&state, order.id, first.id).await.unwrap();
        let second_offer = create_offer(&state, order.id, second.id).await.unwrap();

        respond(&state, first_offer.id, first.id, OfferAction::Accept)
            .await
            .unwrap();
        let err = respond(&state, second_offer.id, second.id, OfferAction::Accept)
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::AssignmentConflict(_)));
        assert_eq!(
            state.offer(second_offer.id).unwrap().status,
            DriverRequestStatus::Pending
        );
        assert_eq!(state.driver(second.id).unwrap().status, DriverStatus::Active);
        assert_eq!(state.order(order.id).unwrap().driver_id, Some(first.id));
    }

    #[tokio::test]
    async fn busy_driver_cannot_take_a_second_order() {
        let state = state();
        let driver = add_driver(&state, 1.0);
        let first_order = add_order(&state);
        let second_order = add_order(&state);
        let first = create_offer(&state, first_order.id, driver.id).await.unwrap();
        let second = create_offer(&state, second_order.id, driver.id).await.unwrap();

        respond(&state, first.id, driver.id, OfferAction::Accept).await.unwrap();
        let err = respond(&state, second.id, driver.id, OfferAction::Accept)
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::StateConflict(_)));
        assert_eq!(state.order(second_order.id).unwrap().driver_id, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_accepts_have_exactly_one_winner() {
        for _ in 0..20 {
            let state = state();
            let order = add_order(&state);
            let mut offers = Vec::new();
            for i in 0..8 {
                let driver = add_driver(&state, 0.5 + i as f64 * 0.1);
                offers.push(create_offer(&state, order.id, driver.id).await.unwrap());
            }

            let barrier = Arc::new(tokio::sync::Barrier::new(offers.len()));
            let attempts: Vec<_> = offers
                .iter()
                .map(|offer| {
                    let state = state.clone();
                    let barrier = barrier.clone();
                    let (offer_id, driver_id) = (offer.id, offer.driver_id);
                    tokio::spawn(async move {
                        barrier.wait().await;
                        respond(&state, offer_id, driver_id, OfferAction::Accept).await
                    })
                })
                .collect();

            let mut winners = 0;
            let mut conflicts = 0;
            for attempt in attempts {
                match attempt.await.unwrap() {
                    Ok(_) => winners += 1,
                    Err(AppError::AssignmentConflict(_)) => conflicts += 1,
                    Err(other) => panic!("unexpected error: {other}"),
                }
            }

            assert_eq!(winners, 1);
            assert_eq!(conflicts, offers.len() - 1);

            let accepted: Vec<_> = state
                .offers_for_order(order.id)
                .into_iter()
                .filter(|offer| offer.status == DriverRequestStatus::Accepted)
                .collect();
            assert_eq!(accepted.len(), 1);
            let busy = state
                .drivers
                .iter()
                .filter(|entry| entry.value().status == DriverStatus::Busy)
                .count();
            assert_eq!(busy, 1);
            assert_eq!(state.order(order.id).unwrap().driver_id, Some(accepted[0].driver_id));
        }
    }
}
