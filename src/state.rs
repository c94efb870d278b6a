use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex, broadcast};
use uuid::Uuid;

use crate::config::DispatchSettings;
use crate::engine::timers::TaskRegistry;
use crate::error::AppError;
use crate::models::driver::Driver;
use crate::models::driver_request::DriverRequest;
use crate::models::menu::MenuItem;
use crate::models::order::{DeliveryStatus, Order, OrderStatus};
use crate::models::review::DeliveryRating;
use crate::models::service_order::ServiceOrder;
use crate::notify::{Notification, Notifier, notify_in_background};
use crate::observability::metrics::Metrics;

/// Pushed to websocket subscribers after every committed order change.
#[derive(Debug, Clone, Serialize)]
pub struct OrderEvent {
    pub order_id: Uuid,
    pub kind: String,
    pub order_status: OrderStatus,
    pub delivery_status: DeliveryStatus,
    pub driver_id: Option<Uuid>,
    pub at: DateTime<Utc>,
}

impl OrderEvent {
    pub fn from_order(order: &Order, kind: &str) -> Self {
        Self {
            order_id: order.id,
            kind: kind.to_string(),
            order_status: order.order_status,
            delivery_status: order.delivery_status,
            driver_id: order.driver_id,
            at: Utc::now(),
        }
    }
}

pub struct AppState {
    pub settings: DispatchSettings,
    pub drivers: DashMap<Uuid, Driver>,
    pub orders: DashMap<Uuid, Order>,
    pub driver_requests: DashMap<Uuid, DriverRequest>,
    pub reviews: DashMap<Uuid, DeliveryRating>,
    pub menu_items: DashMap<Uuid, MenuItem>,
    pub service_orders: DashMap<Uuid, ServiceOrder>,
    /// Serializes every write touching one order, its offers and its driver.
    order_locks: DashMap<Uuid, Arc<Mutex<()>>>,
    pub offer_timers: TaskRegistry,
    pub dispatch_tasks: TaskRegistry,
    pub order_events_tx: broadcast::Sender<OrderEvent>,
    pub notifier: Arc<dyn Notifier>,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(
        settings: DispatchSettings,
        event_buffer_size: usize,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let (order_events_tx, _unused_rx) = broadcast::channel(event_buffer_size);

        Self {
            settings,
            drivers: DashMap::new(),
            orders: DashMap::new(),
            driver_requests: DashMap::new(),
            reviews: DashMap::new(),
            menu_items: DashMap::new(),
            service_orders: DashMap::new(),
            order_locks: DashMap::new(),
            offer_timers: TaskRegistry::new(),
            dispatch_tasks: TaskRegistry::new(),
            order_events_tx,
            notifier,
            metrics: Metrics::new(),
        }
    }

    /// Lock guarding the read-check-write sections for `order_id`.
    ///
    /// Service orders share the same registry, keyed by their own id.
    pub fn order_lock(&self, order_id: Uuid) -> Arc<Mutex<()>> {
        self.order_locks.entry(order_id).or_default().clone()
    }

    /// Drops the lock of an order that reached a terminal state. Anyone still
    /// holding or waiting on it finishes on the old lock.
    pub fn forget_order_lock(&self, order_id: Uuid) {
        self.order_locks.remove(&order_id);
    }

    pub fn tracked_order_locks(&self) -> usize {
        self.order_locks.len()
    }

    pub fn order(&self, order_id: Uuid) -> Result<Order, AppError> {
        self.orders
            .get(&order_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| AppError::NotFound(format!("order {order_id} not found")))
    }

    pub fn driver(&self, driver_id: Uuid) -> Result<Driver, AppError> {
        self.drivers
            .get(&driver_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| AppError::NotFound(format!("driver {driver_id} not found")))
    }

    pub fn offer(&self, offer_id: Uuid) -> Result<DriverRequest, AppError> {
        self.driver_requests
            .get(&offer_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| AppError::NotFound(format!("offer {offer_id} not found")))
    }

    pub fn offers_for_order(&self, order_id: Uuid) -> Vec<DriverRequest> {
        let mut offers: Vec<DriverRequest> = self
            .driver_requests
            .iter()
            .filter(|entry| entry.value().order_id == order_id)
            .map(|entry| entry.value().clone())
            .collect();
        offers.sort_by_key(|offer| offer.created_at);
        offers
    }

    pub fn publish(&self, order: &Order, kind: &str) {
        let _ = self.order_events_tx.send(OrderEvent::from_order(order, kind));
    }

    pub fn notify(&self, notification: Notification) {
        notify_in_background(self.notifier.clone(), notification);
    }
}
