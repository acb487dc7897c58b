pub mod serpapi;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::courier::GeoPoint;

pub use serpapi::SerpApiDirections;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum DirectionsError {
    #[error("directions provider is not configured")]
    NotConfigured,

    #[error("directions provider returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("directions request failed: {0}")]
    Network(String),

    #[error("could not read directions response: {0}")]
    Parse(String),

    #[error("no route between the given points")]
    NoRoute,
}

impl DirectionsError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            DirectionsError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// One point-to-point query result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteLeg {
    pub polyline: String,
    pub distance_m: f64,
    pub duration_s: f64,
    pub steps: Vec<String>,
}

#[async_trait]
pub trait DirectionsProvider: Send + Sync {
    async fn leg(&self, from: GeoPoint, to: GeoPoint) -> Result<RouteLeg, DirectionsError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteSummary {
    pub route_polyline: String,
    pub distance_m: f64,
    pub duration_s: f64,
    pub driver: GeoPoint,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    pub steps: Vec<String>,
}

/// Driver → pickup → dropoff as two sequential provider queries. Distances,
/// durations and steps are summed; the polyline is the first leg's.
pub async fn compute_route(
    provider: &dyn DirectionsProvider,
    driver: GeoPoint,
    pickup: GeoPoint,
    dropoff: GeoPoint,
) -> Result<RouteSummary, DirectionsError> {
    let to_pickup = provider.leg(driver, pickup).await?;
    let to_dropoff = provider.leg(pickup, dropoff).await?;

    let mut steps = to_pickup.steps;
    steps.extend(to_dropoff.steps);

    Ok(RouteSummary {
        route_polyline: to_pickup.polyline,
        distance_m: to_pickup.distance_m + to_dropoff.distance_m,
        duration_s: to_pickup.duration_s + to_dropoff.duration_s,
        driver,
        pickup,
        dropoff,
        steps,
    })
}
