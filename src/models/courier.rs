use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

/// The slice of the courier account the dispatch core reads. Registration and
/// profile editing live elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourierProfile {
    pub id: Uuid,
    pub is_active: bool,
    pub deleted: bool,
}

impl CourierProfile {
    pub fn dispatchable(&self) -> bool {
        self.is_active && !self.deleted
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Restaurant {
    pub id: Uuid,
    pub location: Option<GeoPoint>,
}

/// Last known position of a courier. One per courier, overwritten on every report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceSnapshot {
    pub courier_id: Uuid,
    pub location: GeoPoint,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceEvent {
    pub courier_id: Uuid,
    pub is_online: bool,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourierStatus {
    pub courier_id: Uuid,
    pub online: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NearbyCourier {
    pub courier_id: Uuid,
    pub distance_km: f64,
}
