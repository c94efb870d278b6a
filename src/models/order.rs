use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::driver::GeoPoint;
use crate::models::menu::OrderItem;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Preparing,
    ReadyForPickup,
    OnDelivery,
    Delivered,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;

        matches!(
            (self, next),
            (Pending, Preparing)
                | (Pending, Rejected)
                | (Preparing, ReadyForPickup)
                | (ReadyForPickup, OnDelivery)
                | (OnDelivery, Delivered)
                | (Pending, Cancelled)
                | (Preparing, Cancelled)
                | (ReadyForPickup, Cancelled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Delivered | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    PickedUp,
    OnWay,
    Delivered,
    Rejected,
}

impl DeliveryStatus {
    pub fn can_transition_to(self, next: DeliveryStatus) -> bool {
        use DeliveryStatus::*;

        matches!(
            (self, next),
            (Pending, PickedUp)
                | (Pending, OnWay)
                | (PickedUp, OnWay)
                | (OnWay, Delivered)
                | (Pending, Rejected)
                | (PickedUp, Rejected)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingUpdate {
    pub timestamp: DateTime<Utc>,
    pub status: OrderStatus,
    pub delivery_status: DeliveryStatus,
    pub message: String,
    pub location: Option<GeoPoint>,
    pub estimated_pickup_time: Option<DateTime<Utc>>,
    pub estimated_delivery_time: Option<DateTime<Utc>>,
    pub distance_km: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub store_id: Uuid,
    pub driver_id: Option<Uuid>,
    pub customer_token: Option<String>,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    pub items: Vec<OrderItem>,
    pub order_status: OrderStatus,
    pub delivery_status: DeliveryStatus,
    pub cancel_reason: Option<String>,
    pub estimated_pickup_time: Option<DateTime<Utc>>,
    pub actual_pickup_time: Option<DateTime<Utc>>,
    pub estimated_delivery_time: Option<DateTime<Utc>>,
    pub actual_delivery_time: Option<DateTime<Utc>>,
    tracking_updates: Vec<TrackingUpdate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub struct NewOrder {
    pub customer_id: Uuid,
    pub store_id: Uuid,
    pub customer_token: Option<String>,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    pub items: Vec<OrderItem>,
}

impl Order {
    pub fn place(new: NewOrder) -> Self {
        let now = Utc::now();
        let mut order = Self {
            id: Uuid::new_v4(),
            customer_id: new.customer_id,
            store_id: new.store_id,
            driver_id: None,
            customer_token: new.customer_token,
            pickup: new.pickup,
            dropoff: new.dropoff,
            items: new.items,
            order_status: OrderStatus::Pending,
            delivery_status: DeliveryStatus::Pending,
            cancel_reason: None,
            estimated_pickup_time: None,
            actual_pickup_time: None,
            estimated_delivery_time: None,
            actual_delivery_time: None,
            tracking_updates: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        order.track("order placed", None, None);
        order
    }

    /// Append-only log of every transition the order went through.
    pub fn tracking_updates(&self) -> &[TrackingUpdate] {
        &self.tracking_updates
    }

    /// Moves the order (and optionally its delivery sub-status) and logs the step.
    pub fn transition(
        &mut self,
        next: OrderStatus,
        delivery: Option<DeliveryStatus>,
        message: impl Into<String>,
        location: Option<GeoPoint>,
    ) -> Result<(), AppError> {
        if !self.order_status.can_transition_to(next) {
            return Err(AppError::StateConflict(format!(
                "order {} cannot move from {:?} to {:?}",
                self.id, self.order_status, next
            )));
        }
        if let Some(delivery) = delivery {
            self.check_delivery(delivery)?;
        }

        self.order_status = next;
        if let Some(delivery) = delivery {
            self.delivery_status = delivery;
        }
        self.track(message, location, None);
        Ok(())
    }

    /// Moves only the delivery sub-status and logs the step.
    pub fn advance_delivery(
        &mut self,
        next: DeliveryStatus,
        message: impl Into<String>,
        location: Option<GeoPoint>,
    ) -> Result<(), AppError> {
        self.check_delivery(next)?;
        self.delivery_status = next;
        self.track(message, location, None);
        Ok(())
    }

    /// Logs an event that does not change either status, e.g. a driver assignment.
    pub fn note(
        &mut self,
        message: impl Into<String>,
        location: Option<GeoPoint>,
        distance_km: Option<f64>,
    ) {
        self.track(message, location, distance_km);
    }

    /// Set-once; later calls keep the first recorded instant.
    pub fn record_pickup(&mut self, at: DateTime<Utc>) {
        if self.actual_pickup_time.is_none() {
            self.actual_pickup_time = Some(at);
        }
    }

    pub fn record_delivery(&mut self, at: DateTime<Utc>) {
        if self.actual_delivery_time.is_none() {
            self.actual_delivery_time = Some(at);
        }
    }

    fn check_delivery(&self, next: DeliveryStatus) -> Result<(), AppError> {
        if self.delivery_status.can_transition_to(next) {
            Ok(())
        } else {
            Err(AppError::StateConflict(format!(
                "order {} delivery cannot move from {:?} to {:?}",
                self.id, self.delivery_status, next
            )))
        }
    }

    fn track(
        &mut self,
        message: impl Into<String>,
        location: Option<GeoPoint>,
        distance_km: Option<f64>,
    ) {
        let now = Utc::now();
        self.tracking_updates.push(TrackingUpdate {
            timestamp: now,
            status: self.order_status,
            delivery_status: self.delivery_status,
            message: message.into(),
            location,
            estimated_pickup_time: self.estimated_pickup_time,
            estimated_delivery_time: self.estimated_delivery_time,
            distance_km,
        });
        self.updated_at = now;
    }
}
