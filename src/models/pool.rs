use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::courier::GeoPoint;
use crate::models::order::OrderStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolEntry {
    pub order_id: Uuid,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A pool entry joined with the order fields a courier needs to decide.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolListing {
    pub order_id: Uuid,
    pub restaurant_id: Uuid,
    pub code: String,
    pub status: OrderStatus,
    pub message: Option<String>,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    pub delivery_address: String,
    pub amount: f64,
    pub created_at: DateTime<Utc>,
}
