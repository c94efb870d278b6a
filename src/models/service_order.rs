use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::driver::GeoPoint;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Searching,
    DriverFound,
    Completed,
    Cancelled,
}

/// Courier-errand ticket. Assigned straight to the nearest driver, no offer step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceOrder {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub customer_token: Option<String>,
    pub description: String,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    pub status: ServiceStatus,
    pub driver_id: Option<Uuid>,
    pub attempts: u32,
    pub cancel_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
