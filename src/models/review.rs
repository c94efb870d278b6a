use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Punctuality rating recorded once per delivered order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRating {
    pub id: Uuid,
    pub driver_id: Uuid,
    pub order_id: Uuid,
    pub rating: u8,
    pub comment: String,
    pub created_at: DateTime<Utc>,
}
