use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::DispatchSettings;
use crate::error::AppError;
use crate::store::DispatchStore;

/// Produces the initial direct-offer audience for a restaurant's order.
#[derive(Clone)]
pub struct EligibilityResolver {
    store: Arc<dyn DispatchStore>,
    settings: DispatchSettings,
}

impl EligibilityResolver {
    pub fn new(store: Arc<dyn DispatchStore>, settings: DispatchSettings) -> Self {
        Self { store, settings }
    }

    /// In-house couriers plus anyone nearby; both sources only yield couriers
    /// that are active, not deleted and online.
    pub async fn resolve_candidates(&self, restaurant_id: Uuid) -> Result<BTreeSet<Uuid>, AppError> {
        let mut candidates: BTreeSet<Uuid> = self
            .store
            .online_restaurant_couriers(restaurant_id)
            .await?
            .into_iter()
            .collect();
        let assigned = candidates.len();

        match self.store.restaurant(restaurant_id).await? {
            Some(restaurant) => match restaurant.location {
                Some(origin) => {
                    let nearby = self
                        .store
                        .nearby_online(
                            origin,
                            self.settings.nearby_radius_km,
                            self.settings.nearby_limit,
                        )
                        .await?;
                    candidates.extend(nearby.into_iter().map(|c| c.courier_id));
                }
                None => debug!(restaurant_id = %restaurant_id, "restaurant has no coordinates"),
            },
            None => warn!(restaurant_id = %restaurant_id, "restaurant missing from directory"),
        }

        debug!(
            restaurant_id = %restaurant_id,
            assigned,
            total = candidates.len(),
            "candidates resolved"
        );
        Ok(candidates)
    }
}
