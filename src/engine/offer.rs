//! Offer engine: couples watchers to the order store and the pool.
//!
//! Every mutation of one order's dispatch state runs under that order's async
//! mutex. The status compare-and-set in the store is still the arbitration
//! point; the lock keeps watcher, pool and status writes of one order from
//! interleaving.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

use crate::engine::orders::OrderService;
use crate::engine::pool::PoolService;
use crate::engine::watcher::WatcherService;
use crate::error::AppError;
use crate::models::Page;
use crate::models::offer_log::{OfferAction, OfferLogEntry};
use crate::models::order::{Order, OrderStatus};
use crate::models::pool::PoolEntry;
use crate::observability::metrics::Metrics;
use crate::realtime::RoutePusher;
use crate::store::DispatchStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// No open watcher, or the order has left the watched states.
    Idle,
    /// Offer stays open to this many couriers.
    Offered(usize),
    Pooled,
}

impl TickOutcome {
    fn label(&self) -> &'static str {
        match self {
            TickOutcome::Idle => "idle",
            TickOutcome::Offered(_) => "offered",
            TickOutcome::Pooled => "pooled",
        }
    }
}

#[derive(Clone)]
pub struct OfferEngine {
    store: Arc<dyn DispatchStore>,
    orders: OrderService,
    watchers: WatcherService,
    pool: PoolService,
    routes: RoutePusher,
    metrics: Metrics,
    locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
}

impl OfferEngine {
    pub fn new(
        store: Arc<dyn DispatchStore>,
        orders: OrderService,
        watchers: WatcherService,
        pool: PoolService,
        routes: RoutePusher,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            orders,
            watchers,
            pool,
            routes,
            metrics,
            locks: Arc::new(DashMap::new()),
        }
    }

    async fn lock(&self, order_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(self.locks.entry(order_id).or_default().value());
        lock.lock_owned().await
    }

    /// Drops the guard and forgets the lock if nobody else is waiting on it.
    fn release(&self, order_id: Uuid, guard: OwnedMutexGuard<()>) {
        drop(guard);
        self.locks
            .remove_if(&order_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// First dispatch of a freshly created order: watcher, then tick.
    pub async fn open(&self, order_id: Uuid) -> Result<TickOutcome, AppError> {
        let guard = self.lock(order_id).await;

        let order = self.orders.get(order_id, None).await?;
        if order.status != OrderStatus::Preparing {
            debug!(order_id = %order_id, status = %order.status, "order already dispatched");
            self.release(order_id, guard);
            return Ok(TickOutcome::Idle);
        }

        self.watchers.create(&order).await?;
        let outcome = self.tick_locked(order_id).await;
        self.release(order_id, guard);
        outcome
    }

    pub async fn tick(&self, order_id: Uuid) -> Result<TickOutcome, AppError> {
        let guard = self.lock(order_id).await;
        let outcome = self.tick_locked(order_id).await;
        self.release(order_id, guard);
        outcome
    }

    /// Re-resolves the audience and ticks. Newcomers to the effective set
    /// re-open an order a courier had rejected.
    pub async fn refresh(&self, order_id: Uuid) -> Result<TickOutcome, AppError> {
        let guard = self.lock(order_id).await;
        let outcome = self.refresh_locked(order_id).await;
        self.release(order_id, guard);
        outcome
    }

    async fn refresh_locked(&self, order_id: Uuid) -> Result<TickOutcome, AppError> {
        let Some(watcher) = self.watchers.get(order_id).await? else {
            return Ok(TickOutcome::Idle);
        };
        if watcher.closed {
            return Ok(TickOutcome::Idle);
        }

        let before = watcher.effective_candidates();
        self.watchers.refresh_available(&watcher).await?;

        if let Some(after) = self.watchers.effective_candidates(order_id).await? {
            if after.difference(&before).next().is_some() {
                self.orders
                    .transition_status(
                        order_id,
                        &[OrderStatus::RejectedByCourier],
                        OrderStatus::Offered,
                        None,
                    )
                    .await?;
            }
        }

        self.tick_locked(order_id).await
    }

    async fn tick_locked(&self, order_id: Uuid) -> Result<TickOutcome, AppError> {
        let started = Instant::now();
        let outcome = self.evaluate(order_id).await;

        let label = match &outcome {
            Ok(outcome) => outcome.label(),
            Err(_) => "error",
        };
        self.metrics
            .dispatch_tick_seconds
            .with_label_values(&[label])
            .observe(started.elapsed().as_secs_f64());
        outcome
    }

    async fn evaluate(&self, order_id: Uuid) -> Result<TickOutcome, AppError> {
        let Some(candidates) = self.watchers.effective_candidates(order_id).await? else {
            return Ok(TickOutcome::Idle);
        };
        self.watchers.touch(order_id).await?;

        if !candidates.is_empty() {
            self.orders
                .transition_status(
                    order_id,
                    &[OrderStatus::Preparing],
                    OrderStatus::Offered,
                    None,
                )
                .await?;
            debug!(order_id = %order_id, candidates = candidates.len(), "offer open");
            return Ok(TickOutcome::Offered(candidates.len()));
        }

        let order = self.orders.get(order_id, None).await?;
        if !OrderStatus::WATCHED.contains(&order.status) {
            self.watchers.delete(order_id).await?;
            return Ok(TickOutcome::Idle);
        }

        match self.pool.push(order_id, None).await {
            Ok(_) | Err(AppError::Conflict(_)) => {}
            Err(err) => return Err(err),
        }
        self.orders
            .transition_status(order_id, &OrderStatus::WATCHED, OrderStatus::InPool, None)
            .await?;
        self.watchers.close(order_id).await?;

        info!(order_id = %order_id, "no candidates left; order moved to pool");
        Ok(TickOutcome::Pooled)
    }

    pub async fn courier_reject(&self, courier_id: Uuid, order_id: Uuid) -> Result<Order, AppError> {
        let guard = self.lock(order_id).await;
        let result = self.reject_locked(courier_id, order_id).await;
        self.release(order_id, guard);
        result
    }

    async fn reject_locked(&self, courier_id: Uuid, order_id: Uuid) -> Result<Order, AppError> {
        let order = self.orders.get(order_id, None).await?;
        if !matches!(
            order.status,
            OrderStatus::Offered | OrderStatus::RejectedByCourier
        ) {
            return Err(AppError::InvalidTransition(format!(
                "order is {} and not on offer",
                order.status
            )));
        }

        let watcher = self.watchers.get(order_id).await?;
        match watcher {
            Some(watcher) if watcher.rejected_couriers.contains(&courier_id) => {
                self.count_decision(OfferAction::Reject, "duplicate");
                return Err(AppError::Conflict(
                    "a decision on this order is already recorded".to_string(),
                ));
            }
            Some(watcher) if watcher.is_offered_to(&courier_id) => {}
            _ => {
                self.count_decision(OfferAction::Reject, "refused");
                return Err(AppError::InvalidTransition(
                    "order is not offered to this courier".to_string(),
                ));
            }
        }

        if self
            .store
            .record_offer_action(courier_id, order_id, OfferAction::Reject)
            .await?
            .is_none()
        {
            self.count_decision(OfferAction::Reject, "duplicate");
            return Err(AppError::Conflict(
                "a decision on this order is already recorded".to_string(),
            ));
        }

        self.watchers.record_rejection(order_id, courier_id).await?;
        self.orders
            .transition_status(
                order_id,
                &[OrderStatus::Offered],
                OrderStatus::RejectedByCourier,
                None,
            )
            .await?;
        let outcome = self.tick_locked(order_id).await?;

        self.count_decision(OfferAction::Reject, "recorded");
        info!(
            order_id = %order_id,
            courier_id = %courier_id,
            outcome = outcome.label(),
            "courier rejected offer"
        );
        self.orders.get(order_id, None).await
    }

    /// Exactly one concurrent accept wins; the others get `AlreadyAssigned`
    /// with their accept still logged.
    pub async fn courier_accept(&self, courier_id: Uuid, order_id: Uuid) -> Result<Order, AppError> {
        let guard = self.lock(order_id).await;
        let result = self.accept_locked(courier_id, order_id).await;
        self.release(order_id, guard);

        let order = result?;
        self.routes.push_for_courier(courier_id).await;
        Ok(order)
    }

    async fn accept_locked(&self, courier_id: Uuid, order_id: Uuid) -> Result<Order, AppError> {
        let order = self.orders.get(order_id, None).await?;
        if order.status.is_terminal() || order.status == OrderStatus::Preparing {
            self.count_decision(OfferAction::Accept, "refused");
            return Err(AppError::InvalidTransition(format!(
                "order is {} and cannot be accepted",
                order.status
            )));
        }

        if self
            .store
            .record_offer_action(courier_id, order_id, OfferAction::Accept)
            .await?
            .is_none()
        {
            debug!(
                order_id = %order_id,
                courier_id = %courier_id,
                "earlier decision on record; accept proceeds"
            );
        }

        let Some(assigned) = self.orders.assign_courier(order_id, courier_id).await? else {
            self.count_decision(OfferAction::Accept, "lost");
            info!(order_id = %order_id, courier_id = %courier_id, "accept lost the race");
            return Err(AppError::AlreadyAssigned);
        };

        self.watchers.delete(order_id).await?;
        self.pool.discard(order_id).await?;

        self.count_decision(OfferAction::Accept, "won");
        info!(order_id = %order_id, courier_id = %courier_id, "courier accepted order");
        Ok(assigned)
    }

    pub async fn cancel(&self, restaurant_id: Uuid, order_id: Uuid) -> Result<Order, AppError> {
        let guard = self.lock(order_id).await;
        let result = self.cancel_locked(restaurant_id, order_id).await;
        self.release(order_id, guard);
        result
    }

    async fn cancel_locked(&self, restaurant_id: Uuid, order_id: Uuid) -> Result<Order, AppError> {
        let order = self.orders.get(order_id, Some(restaurant_id)).await?;
        let live: Vec<OrderStatus> = OrderStatus::ALL
            .into_iter()
            .filter(|status| !status.is_terminal())
            .collect();

        let cancelled = self
            .orders
            .transition_status(order_id, &live, OrderStatus::Cancelled, None)
            .await?
            .ok_or_else(|| {
                AppError::InvalidTransition(format!("order is already {}", order.status))
            })?;

        self.watchers.delete(order_id).await?;
        self.pool.discard(order_id).await?;
        info!(order_id = %order_id, "order cancelled");
        Ok(cancelled)
    }

    /// The restaurant summons a courier itself; direct dispatch and the pool
    /// stop offering the order.
    pub async fn call_courier(&self, restaurant_id: Uuid, order_id: Uuid) -> Result<Order, AppError> {
        let guard = self.lock(order_id).await;
        let result = self.call_courier_locked(restaurant_id, order_id).await;
        self.release(order_id, guard);
        result
    }

    async fn call_courier_locked(
        &self,
        restaurant_id: Uuid,
        order_id: Uuid,
    ) -> Result<Order, AppError> {
        let order = self.orders.get(order_id, Some(restaurant_id)).await?;
        let called = self
            .orders
            .transition_status(
                order_id,
                &[
                    OrderStatus::Preparing,
                    OrderStatus::Offered,
                    OrderStatus::InPool,
                ],
                OrderStatus::CourierCalled,
                None,
            )
            .await?
            .ok_or_else(|| {
                AppError::InvalidTransition(format!(
                    "order is {} and a courier cannot be called",
                    order.status
                ))
            })?;

        self.watchers.delete(order_id).await?;
        self.pool.discard(order_id).await?;
        info!(order_id = %order_id, "courier called by restaurant");
        Ok(called)
    }

    /// Manual push with an optional announcement. Unlike the tick's push, a
    /// repeat is reported as a conflict.
    pub async fn send_to_pool(
        &self,
        restaurant_id: Uuid,
        order_id: Uuid,
        message: Option<String>,
    ) -> Result<PoolEntry, AppError> {
        let guard = self.lock(order_id).await;
        let result = self
            .send_to_pool_locked(restaurant_id, order_id, message)
            .await;
        self.release(order_id, guard);
        result
    }

    async fn send_to_pool_locked(
        &self,
        restaurant_id: Uuid,
        order_id: Uuid,
        message: Option<String>,
    ) -> Result<PoolEntry, AppError> {
        let order = self.orders.get(order_id, Some(restaurant_id)).await?;
        if order.status == OrderStatus::InPool {
            return Err(AppError::Conflict(format!(
                "order {order_id} is already in the pool"
            )));
        }
        if !OrderStatus::WATCHED.contains(&order.status) {
            return Err(AppError::InvalidTransition(format!(
                "order is {} and cannot be pooled",
                order.status
            )));
        }

        let entry = self.pool.push(order_id, message).await?;
        self.orders
            .transition_status(order_id, &OrderStatus::WATCHED, OrderStatus::InPool, None)
            .await?;
        self.watchers.close(order_id).await?;
        Ok(entry)
    }

    /// Admin withdrawal of a pooled order. Nothing would offer it again, so a
    /// pooled order is cancelled along with its entry.
    pub async fn withdraw_from_pool(&self, order_id: Uuid) -> Result<Order, AppError> {
        let guard = self.lock(order_id).await;
        let result = self.withdraw_locked(order_id).await;
        self.release(order_id, guard);
        result
    }

    async fn withdraw_locked(&self, order_id: Uuid) -> Result<Order, AppError> {
        self.pool.delete(order_id).await?;
        let cancelled = self
            .orders
            .transition_status(
                order_id,
                &[OrderStatus::InPool],
                OrderStatus::Cancelled,
                None,
            )
            .await?;

        match cancelled {
            Some(order) => {
                self.watchers.delete(order_id).await?;
                info!(order_id = %order_id, "order withdrawn from pool");
                Ok(order)
            }
            None => self.orders.get(order_id, None).await,
        }
    }

    pub async fn delete_order(&self, restaurant_id: Uuid, order_id: Uuid) -> Result<(), AppError> {
        let guard = self.lock(order_id).await;
        let result = self.delete_locked(restaurant_id, order_id).await;
        self.release(order_id, guard);
        result
    }

    async fn delete_locked(&self, restaurant_id: Uuid, order_id: Uuid) -> Result<(), AppError> {
        self.orders.delete(order_id, restaurant_id).await?;
        self.watchers.delete(order_id).await?;
        self.pool.discard(order_id).await?;
        Ok(())
    }

    pub async fn pickup(&self, courier_id: Uuid, order_id: Uuid) -> Result<Order, AppError> {
        let order = self
            .advance(
                courier_id,
                order_id,
                &[OrderStatus::Assigned],
                OrderStatus::EnRoute,
            )
            .await?;
        self.routes.push_for_courier(courier_id).await;
        Ok(order)
    }

    pub async fn arrive(&self, courier_id: Uuid, order_id: Uuid) -> Result<Order, AppError> {
        self.advance(
            courier_id,
            order_id,
            &[OrderStatus::EnRoute],
            OrderStatus::AtLocation,
        )
        .await
    }

    pub async fn deliver(&self, courier_id: Uuid, order_id: Uuid) -> Result<Order, AppError> {
        let order = self
            .advance(
                courier_id,
                order_id,
                &[OrderStatus::EnRoute, OrderStatus::AtLocation],
                OrderStatus::Delivered,
            )
            .await?;
        self.watchers.delete(order_id).await?;
        info!(order_id = %order_id, courier_id = %courier_id, "order delivered");
        Ok(order)
    }

    /// Courier-held progress; the store checks both status and binding.
    async fn advance(
        &self,
        courier_id: Uuid,
        order_id: Uuid,
        from: &[OrderStatus],
        to: OrderStatus,
    ) -> Result<Order, AppError> {
        if let Some(order) = self
            .orders
            .transition_status(order_id, from, to, Some(courier_id))
            .await?
        {
            return Ok(order);
        }

        let current = self.orders.get(order_id, None).await?;
        if current.courier_id != Some(courier_id) {
            return Err(AppError::InvalidTransition(
                "order is not assigned to this courier".to_string(),
            ));
        }
        Err(AppError::InvalidTransition(format!(
            "order is {} and cannot move to {to}",
            current.status
        )))
    }

    pub async fn open_watcher_ids(&self) -> Result<Vec<Uuid>, AppError> {
        Ok(self
            .watchers
            .open_watchers()
            .await?
            .into_iter()
            .map(|watcher| watcher.order_id)
            .collect())
    }

    /// Orders whose open offer still includes the courier.
    pub async fn offers_for_courier(&self, courier_id: Uuid) -> Result<Vec<Order>, AppError> {
        let mut offers = Vec::new();
        for order_id in self.watchers.offered_to(courier_id).await? {
            if let Some(order) = self.store.fetch_order(order_id).await? {
                if matches!(
                    order.status,
                    OrderStatus::Offered | OrderStatus::RejectedByCourier
                ) {
                    offers.push(order);
                }
            }
        }
        offers.sort_by_key(|order| order.created_at);
        Ok(offers)
    }

    pub async fn offer_log(
        &self,
        courier_id: Uuid,
        action: Option<OfferAction>,
        limit: u32,
        offset: u32,
    ) -> Result<Page<OfferLogEntry>, AppError> {
        Ok(self.store.offer_log(courier_id, action, limit, offset).await?)
    }

    fn count_decision(&self, action: OfferAction, outcome: &str) {
        let action = match action {
            OfferAction::Accept => "accept",
            OfferAction::Reject => "reject",
        };
        self.metrics
            .offer_decisions_total
            .with_label_values(&[action, outcome])
            .inc();
    }
}
