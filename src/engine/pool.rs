use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::pool::{PoolEntry, PoolListing};
use crate::observability::metrics::Metrics;
use crate::store::DispatchStore;

/// Shared pool of orders that direct offers did not place.
#[derive(Clone)]
pub struct PoolService {
    store: Arc<dyn DispatchStore>,
    metrics: Metrics,
}

impl PoolService {
    pub fn new(store: Arc<dyn DispatchStore>, metrics: Metrics) -> Self {
        Self { store, metrics }
    }

    /// `Conflict` when the order is already pooled.
    pub async fn push(&self, order_id: Uuid, message: Option<String>) -> Result<PoolEntry, AppError> {
        let entry = self
            .store
            .insert_pool_entry(order_id, message)
            .await?
            .ok_or_else(|| AppError::Conflict(format!("order {order_id} is already in the pool")))?;

        self.metrics.pool_pushes_total.inc();
        info!(order_id = %order_id, "order pushed to pool");
        Ok(entry)
    }

    /// Nearest pickups first by planar delta from the courier's last fix;
    /// oldest first when the courier has never reported a position.
    pub async fn list_for_courier(&self, courier_id: Uuid) -> Result<Vec<PoolListing>, AppError> {
        let origin = self
            .store
            .location(courier_id)
            .await?
            .map(|snapshot| snapshot.location);
        Ok(self.store.pool_listings(origin).await?)
    }

    pub async fn delete(&self, order_id: Uuid) -> Result<(), AppError> {
        if !self.store.delete_pool_entry(order_id).await? {
            return Err(AppError::NotFound(format!("pool entry for order {order_id}")));
        }
        info!(order_id = %order_id, "order removed from pool");
        Ok(())
    }

    /// Removal that tolerates a missing entry.
    pub async fn discard(&self, order_id: Uuid) -> Result<bool, AppError> {
        Ok(self.store.delete_pool_entry(order_id).await?)
    }
}
