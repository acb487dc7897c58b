#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;
use yuksi_dispatch::auth::{Claims, JwtKeys, Role};
use yuksi_dispatch::config::{DispatchSettings, Secret};
use yuksi_dispatch::engine::orders::{OrderDraft, OrderItemDraft};
use yuksi_dispatch::models::courier::{CourierProfile, GeoPoint, Restaurant};
use yuksi_dispatch::models::order::{DeliveryType, Order};
use yuksi_dispatch::routing::{DirectionsError, DirectionsProvider, RouteLeg};
use yuksi_dispatch::state::AppState;
use yuksi_dispatch::store::{MemoryStore, PresenceRepository};

pub const JWT_SECRET: &str = "test-signing-key";

/// Directions stub: two fixed legs, or a provider error when `fail_with` is set.
#[derive(Default)]
pub struct ScriptedDirections {
    pub fail_with: Mutex<Option<u16>>,
    pub calls: Mutex<Vec<(GeoPoint, GeoPoint)>>,
}

impl ScriptedDirections {
    pub fn fail_with(&self, status: Option<u16>) {
        *self.fail_with.lock().unwrap() = status;
    }
}

#[async_trait]
impl DirectionsProvider for ScriptedDirections {
    async fn leg(&self, from: GeoPoint, to: GeoPoint) -> Result<RouteLeg, DirectionsError> {
        let leg_number = {
            let mut calls = self.calls.lock().unwrap();
            calls.push((from, to));
            calls.len()
        };

        if let Some(status) = *self.fail_with.lock().unwrap() {
            return Err(DirectionsError::Status {
                status,
                message: "provider unavailable".to_string(),
            });
        }

        Ok(if leg_number % 2 == 1 {
            RouteLeg {
                polyline: "leg-to-pickup".to_string(),
                distance_m: 1000.0,
                duration_s: 100.0,
                steps: vec!["head to pickup".to_string()],
            }
        } else {
            RouteLeg {
                polyline: "leg-to-dropoff".to_string(),
                distance_m: 2000.0,
                duration_s: 200.0,
                steps: vec!["head to dropoff".to_string()],
            }
        })
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub directions: Arc<ScriptedDirections>,
    pub state: Arc<AppState>,
    pub jwt: JwtKeys,
}

pub fn harness() -> (Harness, mpsc::Receiver<Uuid>) {
    let store = Arc::new(MemoryStore::new());
    let directions = Arc::new(ScriptedDirections::default());
    let jwt = JwtKeys::new(Secret::new(JWT_SECRET.to_string()));

    let (state, order_rx) = AppState::new(
        store.clone(),
        directions.clone(),
        jwt.clone(),
        DispatchSettings::default(),
        64,
    );

    (
        Harness {
            store,
            directions,
            state: Arc::new(state),
            jwt,
        },
        order_rx,
    )
}

impl Harness {
    pub fn token(&self, sub: Uuid, role: Role) -> String {
        self.jwt.sign(&Claims::new(sub, role, Duration::minutes(10)))
    }

    pub fn restaurant(&self, location: Option<GeoPoint>) -> Uuid {
        let id = Uuid::new_v4();
        self.store.add_restaurant(Restaurant { id, location });
        id
    }

    /// Seeds an active courier, optionally with a GPS fix, online or not.
    pub async fn courier(&self, location: Option<GeoPoint>, online: bool) -> Uuid {
        let id = Uuid::new_v4();
        self.store.add_courier(CourierProfile {
            id,
            is_active: true,
            deleted: false,
        });
        if let Some(location) = location {
            self.store.upsert_location(id, location).await.unwrap();
        }
        self.store.set_online(id, online).await.unwrap();
        id
    }

    /// Creates the order and runs its first dispatch, as the queue consumer would.
    pub async fn dispatch_order(&self, restaurant_id: Uuid, pickup: Option<GeoPoint>) -> Order {
        let order = self
            .state
            .orders
            .create(restaurant_id, draft(pickup))
            .await
            .unwrap();
        self.state.offers.open(order.id).await.unwrap();
        self.state.orders.get(order.id, None).await.unwrap()
    }
}

pub fn draft(pickup: Option<GeoPoint>) -> OrderDraft {
    OrderDraft {
        customer: "Zeynep".to_string(),
        phone: "+905551112233".to_string(),
        address: "Bağdat Cd. 1".to_string(),
        delivery_address: "Bağdat Cd. 99".to_string(),
        delivery_type: DeliveryType::Package,
        amount: None,
        pickup,
        dropoff: GeoPoint::new(40.02, 29.02),
        carrier_type: None,
        vehicle_type: Some("motorcycle".to_string()),
        cargo_type: None,
        special_requests: None,
        items: vec![OrderItemDraft {
            product_name: "pide".to_string(),
            price: 120.0,
            quantity: 2,
        }],
    }
}
