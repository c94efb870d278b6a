//! Punctuality rating: a 1-5 score from the gap between the estimated and
//! actual delivery time, folded into the driver's running average.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use tracing::info;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::order::{Order, OrderStatus};
use crate::models::review::DeliveryRating;
use crate::state::AppState;

pub fn gap_minutes(estimated: DateTime<Utc>, actual: DateTime<Utc>) -> f64 {
    (actual - estimated).num_seconds().unsigned_abs() as f64 / 60.0
}

pub fn score(estimated: DateTime<Utc>, actual: DateTime<Utc>) -> u8 {
    let gap = gap_minutes(estimated, actual);

    if gap <= 5.0 {
        5
    } else if gap <= 10.0 {
        4
    } else if gap <= 20.0 {
        3
    } else if gap <= 30.0 {
        2
    } else {
        1
    }
}

/// Returns the new `(average, count)` after adding one rating.
pub fn fold(average: f64, count: u32, rating: u8) -> (f64, u32) {
    let next = count + 1;
    let folded = (average * count as f64 + rating as f64) / next as f64;
    (folded, next)
}

pub fn punctuality_comment(estimated: DateTime<Utc>, actual: DateTime<Utc>) -> String {
    let gap = gap_minutes(estimated, actual).round() as i64;
    if gap == 0 {
        "Delivered right on time".to_string()
    } else if actual > estimated {
        format!("Delivered {gap} minute(s) later than estimated")
    } else {
        format!("Delivered {gap} minute(s) earlier than estimated")
    }
}

/// Rates a delivered order that has not been rated yet.
///
/// Delivered orders no longer change and have no order lock left, so the
/// review entry alone decides which caller rates.
pub async fn rate_delivery(
    state: &Arc<AppState>,
    order_id: Uuid,
) -> Result<DeliveryRating, AppError> {
    let order = state.order(order_id)?;
    rate_locked(state, &order)
}

/// The review table is keyed by order id, which makes rating once-only.
pub(crate) fn rate_locked(state: &AppState, order: &Order) -> Result<DeliveryRating, AppError> {
    if order.order_status != OrderStatus::Delivered {
        return Err(AppError::StateConflict(format!(
            "order {} is {:?}, not delivered",
            order.id, order.order_status
        )));
    }
    let driver_id = order
        .driver_id
        .ok_or_else(|| AppError::StateConflict(format!("order {} has no driver", order.id)))?;
    let estimated = order.estimated_delivery_time.ok_or_else(|| {
        AppError::StateConflict(format!("order {} has no delivery estimate", order.id))
    })?;
    let actual = order.actual_delivery_time.ok_or_else(|| {
        AppError::StateConflict(format!("order {} has no delivery time", order.id))
    })?;

    let review = match state.reviews.entry(order.id) {
        Entry::Occupied(_) => {
            return Err(AppError::StateConflict(format!(
                "order {} is already rated",
                order.id
            )));
        }
        Entry::Vacant(slot) => {
            let review = DeliveryRating {
                id: Uuid::new_v4(),
                driver_id,
                order_id: order.id,
                rating: score(estimated, actual),
                comment: punctuality_comment(estimated, actual),
                created_at: Utc::now(),
            };
            slot.insert(review.clone());
            review
        }
    };

    let mut driver = state
        .drivers
        .get_mut(&driver_id)
        .ok_or_else(|| AppError::NotFound(format!("driver {driver_id} not found")))?;
    let (average, count) = fold(driver.rating, driver.reviews_count, review.rating);
    driver.rating = average;
    driver.reviews_count = count;

    info!(
        order_id = %order.id,
        driver_id = %driver_id,
        rating = review.rating,
        average,
        "delivery rated"
    );
    Ok(review)
}
