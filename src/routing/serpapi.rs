//! Google Maps directions through SerpAPI.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::Secret;
use crate::models::courier::GeoPoint;
use crate::routing::{DirectionsError, DirectionsProvider, RouteLeg};

pub struct SerpApiDirections {
    client: Client,
    base_url: String,
    api_key: Option<Secret<String>>,
}

impl SerpApiDirections {
    pub fn new(
        base_url: &str,
        api_key: Option<Secret<String>>,
        timeout: Duration,
    ) -> Result<Self, DirectionsError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| DirectionsError::Network(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[derive(Deserialize)]
struct DirectionsResponse {
    #[serde(default)]
    directions: Vec<Direction>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct Direction {
    distance: Option<f64>,
    duration: Option<f64>,
    #[serde(default)]
    polyline: Option<String>,
    #[serde(default)]
    trips: Vec<Trip>,
}

#[derive(Deserialize)]
struct Trip {
    title: Option<String>,
    #[serde(default)]
    details: Vec<TripDetail>,
}

#[derive(Deserialize)]
struct TripDetail {
    title: Option<String>,
}

impl Direction {
    fn into_leg(self) -> RouteLeg {
        let steps = self
            .trips
            .into_iter()
            .flat_map(|trip| {
                if trip.details.is_empty() {
                    trip.title.into_iter().collect::<Vec<_>>()
                } else {
                    trip.details.into_iter().filter_map(|d| d.title).collect()
                }
            })
            .collect();

        RouteLeg {
            polyline: self.polyline.unwrap_or_default(),
            distance_m: self.distance.unwrap_or_default(),
            duration_s: self.duration.unwrap_or_default(),
            steps,
        }
    }
}

fn coords(point: GeoPoint) -> String {
    format!("{},{}", point.lat, point.lng)
}

#[async_trait]
impl DirectionsProvider for SerpApiDirections {
    async fn leg(&self, from: GeoPoint, to: GeoPoint) -> Result<RouteLeg, DirectionsError> {
        let api_key = self.api_key.as_ref().ok_or(DirectionsError::NotConfigured)?;

        let response = self
            .client
            .get(format!("{}/search.json", self.base_url))
            .query(&[
                ("engine", "google_maps_directions"),
                ("start_coords", coords(from).as_str()),
                ("end_coords", coords(to).as_str()),
                ("travel_mode", "0"),
                ("api_key", api_key.reveal().as_str()),
            ])
            .send()
            .await
            .map_err(|err| {
                warn!(error = %err, "directions request failed");
                DirectionsError::Network(err.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "directions provider returned an error");
            return Err(DirectionsError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let body: DirectionsResponse = response
            .json()
            .await
            .map_err(|err| DirectionsError::Parse(err.to_string()))?;

        if let Some(error) = body.error {
            return Err(DirectionsError::Parse(error));
        }

        let leg = body
            .directions
            .into_iter()
            .next()
            .map(Direction::into_leg)
            .ok_or(DirectionsError::NoRoute)?;

        debug!(
            distance_m = leg.distance_m,
            duration_s = leg.duration_s,
            "directions leg resolved"
        );
        Ok(leg)
    }
}

#[cfg(test)]
mod tests {
    use super::DirectionsResponse;

    #[test]
    fn parses_steps_from_trip_details() {
        let raw = r#"{
            "directions": [{
                "distance": 2345,
                "duration": 410,
                "trips": [
                    {"title": "Drive", "details": [{"title": "Head north"}, {"title": "Turn right"}]},
                    {"title": "Arrive"}
                ]
            }]
        }"#;
        let body: DirectionsResponse = serde_json::from_str(raw).unwrap();
        let leg = body.directions.into_iter().next().unwrap().into_leg();

        assert_eq!(leg.distance_m, 2345.0);
        assert_eq!(leg.duration_s, 410.0);
        assert_eq!(leg.steps, vec!["Head north", "Turn right", "Arrive"]);
        assert!(leg.polyline.is_empty());
    }
}
