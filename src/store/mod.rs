//! Persistence for the dispatch core.
//!
//! Every component talks to storage through the repository traits below.
//! `PgStore` is the production backend; `MemoryStore` keeps the same
//! row-level guarantees in process and backs the tests.

pub mod memory;
pub mod postgres;

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::models::Page;
use crate::models::courier::{
    CourierProfile, CourierStatus, GeoPoint, NearbyCourier, PresenceEvent, PresenceSnapshot,
    Restaurant,
};
use crate::models::offer_log::{OfferAction, OfferLogEntry};
use crate::models::order::{NewOrder, Order, OrderFilter, OrderScope, OrderStatus, OrderUpdate};
use crate::models::pool::{PoolEntry, PoolListing};
use crate::models::watcher::OrderWatcher;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    Conflict(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Read access to account data owned by other subsystems.
#[async_trait]
pub trait DirectoryRepository: Send + Sync {
    async fn courier(&self, courier_id: Uuid) -> StoreResult<Option<CourierProfile>>;

    async fn restaurant(&self, restaurant_id: Uuid) -> StoreResult<Option<Restaurant>>;

    /// Couriers assigned to the restaurant that are active, not deleted and online.
    async fn online_restaurant_couriers(&self, restaurant_id: Uuid) -> StoreResult<Vec<Uuid>>;
}

#[async_trait]
pub trait PresenceRepository: Send + Sync {
    async fn upsert_location(
        &self,
        courier_id: Uuid,
        location: GeoPoint,
    ) -> StoreResult<PresenceSnapshot>;

    async fn location(&self, courier_id: Uuid) -> StoreResult<Option<PresenceSnapshot>>;

    async fn set_online(&self, courier_id: Uuid, online: bool) -> StoreResult<CourierStatus>;

    async fn append_presence_event(&self, courier_id: Uuid, online: bool) -> StoreResult<()>;

    async fn presence_events(
        &self,
        courier_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<PresenceEvent>>;

    /// Active, online, non-deleted couriers within `radius_km`, nearest first.
    async fn nearby_online(
        &self,
        origin: GeoPoint,
        radius_km: f64,
        limit: u32,
    ) -> StoreResult<Vec<NearbyCourier>>;
}

#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Inserts the order and its items atomically, drawing the next code from
    /// the restaurant's sequence.
    async fn insert_order(&self, restaurant_id: Uuid, order: NewOrder) -> StoreResult<Order>;

    async fn fetch_order(&self, order_id: Uuid) -> StoreResult<Option<Order>>;

    /// Applies a partial update unless the order is terminal. `None` means the
    /// order is missing or terminal.
    async fn update_order(&self, order_id: Uuid, update: &OrderUpdate)
    -> StoreResult<Option<Order>>;

    /// Deletes unless delivered. Returns whether a row was removed.
    async fn delete_order(&self, order_id: Uuid) -> StoreResult<bool>;

    /// Compare-and-set on the status column. With `held_by`, the order must also
    /// be bound to that courier. `None` means the precondition did not hold.
    async fn transition_status(
        &self,
        order_id: Uuid,
        from: &[OrderStatus],
        to: OrderStatus,
        held_by: Option<Uuid>,
    ) -> StoreResult<Option<Order>>;

    /// Compare-and-set to `assigned` that binds the courier in the same write.
    async fn assign_courier(
        &self,
        order_id: Uuid,
        courier_id: Uuid,
        from: &[OrderStatus],
    ) -> StoreResult<Option<Order>>;

    async fn list_orders(&self, scope: OrderScope, filter: &OrderFilter)
    -> StoreResult<Page<Order>>;

    /// Most recently updated order bound to the courier in one of `statuses`.
    async fn active_order_for_courier(
        &self,
        courier_id: Uuid,
        statuses: &[OrderStatus],
    ) -> StoreResult<Option<Order>>;
}

#[async_trait]
pub trait WatcherRepository: Send + Sync {
    /// Inserts a fresh watcher, or returns the existing one untouched.
    async fn create_watcher(
        &self,
        order_id: Uuid,
        restaurant_id: Uuid,
        available: &BTreeSet<Uuid>,
    ) -> StoreResult<OrderWatcher>;

    async fn watcher(&self, order_id: Uuid) -> StoreResult<Option<OrderWatcher>>;

    /// Replaces `available`, leaving `rejected` alone. No-op when closed.
    async fn replace_available(
        &self,
        order_id: Uuid,
        available: &BTreeSet<Uuid>,
    ) -> StoreResult<bool>;

    /// Adds the courier to `rejected` if not already there. No-op when closed.
    async fn append_rejection(&self, order_id: Uuid, courier_id: Uuid) -> StoreResult<bool>;

    /// `available \ rejected`, computed by the store. `None` when no open watcher exists.
    async fn effective_candidates(&self, order_id: Uuid) -> StoreResult<Option<BTreeSet<Uuid>>>;

    async fn touch_watcher(&self, order_id: Uuid) -> StoreResult<()>;

    async fn close_watcher(&self, order_id: Uuid) -> StoreResult<bool>;

    async fn delete_watcher(&self, order_id: Uuid) -> StoreResult<bool>;

    async fn open_watchers(&self) -> StoreResult<Vec<OrderWatcher>>;

    /// Orders whose open watcher still counts the courier as a candidate.
    async fn orders_offered_to(&self, courier_id: Uuid) -> StoreResult<Vec<Uuid>>;
}

#[async_trait]
pub trait PoolRepository: Send + Sync {
    /// `None` when the order is already pooled.
    async fn insert_pool_entry(
        &self,
        order_id: Uuid,
        message: Option<String>,
    ) -> StoreResult<Option<PoolEntry>>;

    async fn pool_entry(&self, order_id: Uuid) -> StoreResult<Option<PoolEntry>>;

    async fn delete_pool_entry(&self, order_id: Uuid) -> StoreResult<bool>;

    /// Pool listings ranked by squared planar distance of the pickup from
    /// `origin`, oldest first when there is no origin.
    async fn pool_listings(&self, origin: Option<GeoPoint>) -> StoreResult<Vec<PoolListing>>;
}

#[async_trait]
pub trait OfferLogRepository: Send + Sync {
    /// `None` when the courier already has a decision on record for the order.
    async fn record_offer_action(
        &self,
        courier_id: Uuid,
        order_id: Uuid,
        action: OfferAction,
    ) -> StoreResult<Option<OfferLogEntry>>;

    async fn offer_log(
        &self,
        courier_id: Uuid,
        action: Option<OfferAction>,
        limit: u32,
        offset: u32,
    ) -> StoreResult<Page<OfferLogEntry>>;
}

pub trait DispatchStore:
    DirectoryRepository
    + PresenceRepository
    + OrderRepository
    + WatcherRepository
    + PoolRepository
    + OfferLogRepository
{
    fn backend(&self) -> &'static str;
}

/// Picks the backend from configuration: PostgreSQL when `DATABASE_URL` is
/// set (migrations applied on connect), otherwise the in-process store.
pub async fn init_store(config: &Config) -> StoreResult<Arc<dyn DispatchStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgStore::connect(url.reveal(), config.db_max_connections).await?;
            info!(backend = "postgres", "storage ready");
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!("DATABASE_URL not set; state lives in memory and is lost on restart");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}
