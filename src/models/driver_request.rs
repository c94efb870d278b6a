use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DriverRequestStatus {
    Pending,
    Accepted,
    Rejected,
    Expired,
    Cancelled,
    Completed,
}

impl DriverRequestStatus {
    pub fn can_transition_to(self, next: DriverRequestStatus) -> bool {
        use DriverRequestStatus::*;

        matches!(
            (self, next),
            (Pending, Accepted)
                | (Pending, Rejected)
                | (Pending, Expired)
                | (Pending, Cancelled)
                | (Accepted, Completed)
                | (Accepted, Cancelled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DriverRequestStatus::Rejected
                | DriverRequestStatus::Expired
                | DriverRequestStatus::Cancelled
                | DriverRequestStatus::Completed
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OfferAction {
    Accept,
    Reject,
}

/// An offer of one order to one driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverRequest {
    pub id: Uuid,
    pub order_id: Uuid,
    pub driver_id: Uuid,
    pub status: DriverRequestStatus,
    pub distance_km: f64,
    pub estimated_pickup_time: DateTime<Utc>,
    pub estimated_delivery_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DriverRequest {
    pub fn transition(&mut self, next: DriverRequestStatus) -> Result<(), AppError> {
        if !self.status.can_transition_to(next) {
            return Err(AppError::StateConflict(format!(
                "offer {} cannot move from {:?} to {:?}",
                self.id, self.status, next
            )));
        }

        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}
