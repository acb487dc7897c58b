use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use crate::engine::eligibility::EligibilityResolver;
use crate::error::AppError;
use crate::models::order::Order;
use crate::models::watcher::OrderWatcher;
use crate::store::DispatchStore;

/// Per-order candidate bookkeeping. Mutated only by the offer engine.
#[derive(Clone)]
pub struct WatcherService {
    store: Arc<dyn DispatchStore>,
    eligibility: EligibilityResolver,
}

impl WatcherService {
    pub fn new(store: Arc<dyn DispatchStore>, eligibility: EligibilityResolver) -> Self {
        Self { store, eligibility }
    }

    /// Creating twice returns the first watcher unchanged.
    pub async fn create(&self, order: &Order) -> Result<OrderWatcher, AppError> {
        let available = self
            .eligibility
            .resolve_candidates(order.restaurant_id)
            .await?;
        let watcher = self
            .store
            .create_watcher(order.id, order.restaurant_id, &available)
            .await?;

        info!(
            order_id = %order.id,
            candidates = watcher.available_couriers.len(),
            "watcher created"
        );
        Ok(watcher)
    }

    pub async fn get(&self, order_id: Uuid) -> Result<Option<OrderWatcher>, AppError> {
        Ok(self.store.watcher(order_id).await?)
    }

    /// Re-resolves `available`; `rejected` is kept. Returns false when the
    /// watcher is missing or closed.
    pub async fn refresh_available(&self, watcher: &OrderWatcher) -> Result<bool, AppError> {
        if watcher.closed {
            return Ok(false);
        }
        let available = self
            .eligibility
            .resolve_candidates(watcher.restaurant_id)
            .await?;
        let replaced = self
            .store
            .replace_available(watcher.order_id, &available)
            .await?;

        debug!(
            order_id = %watcher.order_id,
            candidates = available.len(),
            replaced,
            "watcher refreshed"
        );
        Ok(replaced)
    }

    pub async fn record_rejection(&self, order_id: Uuid, courier_id: Uuid) -> Result<bool, AppError> {
        Ok(self.store.append_rejection(order_id, courier_id).await?)
    }

    /// `available \ rejected`; `None` when there is no open watcher.
    pub async fn effective_candidates(
        &self,
        order_id: Uuid,
    ) -> Result<Option<BTreeSet<Uuid>>, AppError> {
        Ok(self.store.effective_candidates(order_id).await?)
    }

    pub async fn touch(&self, order_id: Uuid) -> Result<(), AppError> {
        Ok(self.store.touch_watcher(order_id).await?)
    }

    pub async fn close(&self, order_id: Uuid) -> Result<bool, AppError> {
        let closed = self.store.close_watcher(order_id).await?;
        if closed {
            info!(order_id = %order_id, "watcher closed");
        }
        Ok(closed)
    }

    pub async fn delete(&self, order_id: Uuid) -> Result<bool, AppError> {
        let deleted = self.store.delete_watcher(order_id).await?;
        if deleted {
            debug!(order_id = %order_id, "watcher deleted");
        }
        Ok(deleted)
    }

    pub async fn open_watchers(&self) -> Result<Vec<OrderWatcher>, AppError> {
        Ok(self.store.open_watchers().await?)
    }

    pub async fn offered_to(&self, courier_id: Uuid) -> Result<Vec<Uuid>, AppError> {
        Ok(self.store.orders_offered_to(courier_id).await?)
    }
}
