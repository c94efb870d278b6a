//! Nearest-driver selection.
//!
//! Distances are planar: the Euclidean norm of the raw latitude/longitude
//! delta, scaled by a fixed km-per-degree factor. This is not geodesic and is
//! only meaningful over short, city-sized spans. Search radii are tuned
//! against this metric, so swapping in a great-circle formula changes which
//! drivers qualify.

use std::collections::HashSet;

use uuid::Uuid;

use crate::models::driver::{Driver, GeoPoint};

/// Length of one degree of latitude.
pub const KM_PER_DEGREE: f64 = 111.32;

pub fn planar_distance_km(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let delta_lat = b.lat - a.lat;
    let delta_lng = b.lng - a.lng;

    (delta_lat * delta_lat + delta_lng * delta_lng).sqrt() * KM_PER_DEGREE
}

/// Returns the closest matchable driver within `max_radius_km`, skipping `excluded`.
///
/// Ties on exact distance resolve to whichever candidate is seen first.
pub fn find_nearest<'a, I>(
    origin: &GeoPoint,
    candidates: I,
    max_radius_km: f64,
    excluded: &HashSet<Uuid>,
) -> Option<(Driver, f64)>
where
    I: IntoIterator<Item = &'a Driver>,
{
    candidates
        .into_iter()
        .filter(|driver| driver.is_matchable() && !excluded.contains(&driver.id))
        .filter_map(|driver| {
            let location = driver.location.as_ref()?;
            let distance = planar_distance_km(origin, location);
            (distance <= max_radius_km).then_some((driver, distance))
        })
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(driver, distance)| (driver.clone(), distance))
}
