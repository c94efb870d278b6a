use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

/// Decimal degrees, as reported by the driver app.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn validate(&self) -> Result<(), AppError> {
        if !(-90.0..=90.0).contains(&self.lat) || !(-180.0..=180.0).contains(&self.lng) {
            return Err(AppError::BadRequest(format!(
                "coordinates out of range: {}, {}",
                self.lat, self.lng
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DriverStatus {
    Inactive,
    Active,
    Busy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Driver {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub device_token: Option<String>,
    /// `None` until the first location report.
    pub location: Option<GeoPoint>,
    pub status: DriverStatus,
    pub rating: f64,
    pub reviews_count: u32,
    pub updated_at: DateTime<Utc>,
}

impl Driver {
    pub fn new(user_id: Uuid, name: String, device_token: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            name,
            device_token,
            location: None,
            status: DriverStatus::Inactive,
            rating: 0.0,
            reviews_count: 0,
            updated_at: Utc::now(),
        }
    }

    /// Only active drivers with a known position take part in matching.
    pub fn is_matchable(&self) -> bool {
        self.status == DriverStatus::Active && self.location.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coordinates_outside_the_globe_are_rejected() {
        assert!(GeoPoint { lat: -6.2, lng: 106.8 }.validate().is_ok());
        assert!(GeoPoint { lat: 90.0, lng: -180.0 }.validate().is_ok());

        for bad in [
            GeoPoint { lat: 1e12, lng: 0.0 },
            GeoPoint { lat: 0.0, lng: 180.5 },
            GeoPoint { lat: f64::NAN, lng: 0.0 },
        ] {
            assert!(matches!(bad.validate(), Err(AppError::BadRequest(_))));
        }
    }
}
