use std::collections::{BTreeSet, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use uuid::Uuid;

use crate::geo::{great_circle_km, planar_delta_sq};
use crate::models::Page;
use crate::models::courier::{
    CourierProfile, CourierStatus, GeoPoint, NearbyCourier, PresenceEvent, PresenceSnapshot,
    Restaurant,
};
use crate::models::offer_log::{OfferAction, OfferLogEntry};
use crate::models::order::{NewOrder, Order, OrderFilter, OrderScope, OrderStatus, OrderUpdate};
use crate::models::pool::{PoolEntry, PoolListing};
use crate::models::watcher::OrderWatcher;
use crate::store::{
    DirectoryRepository, DispatchStore, OfferLogRepository, OrderRepository, PoolRepository,
    PresenceRepository, StoreResult, WatcherRepository,
};

/// In-process store. Each map entry is a row; DashMap's shard locks give the
/// same per-row atomicity the SQL backend gets from single statements.
#[derive(Default)]
pub struct MemoryStore {
    couriers: DashMap<Uuid, CourierProfile>,
    restaurants: DashMap<Uuid, Restaurant>,
    restaurant_couriers: DashMap<Uuid, HashSet<Uuid>>,
    gps: DashMap<Uuid, PresenceSnapshot>,
    statuses: DashMap<Uuid, CourierStatus>,
    presence_events: Mutex<Vec<PresenceEvent>>,
    orders: DashMap<Uuid, Order>,
    order_counters: DashMap<Uuid, u64>,
    watchers: DashMap<Uuid, OrderWatcher>,
    pool: DashMap<Uuid, PoolEntry>,
    offer_log: DashMap<(Uuid, Uuid), OfferLogEntry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_courier(&self, courier: CourierProfile) {
        self.couriers.insert(courier.id, courier);
    }

    pub fn add_restaurant(&self, restaurant: Restaurant) {
        self.restaurants.insert(restaurant.id, restaurant);
    }

    pub fn assign_courier_to_restaurant(&self, restaurant_id: Uuid, courier_id: Uuid) {
        self.restaurant_couriers
            .entry(restaurant_id)
            .or_default()
            .insert(courier_id);
    }

    pub fn pool_len(&self) -> usize {
        self.pool.len()
    }

    pub fn order_count(&self) -> usize {
        self.orders.len()
    }

    fn is_online(&self, courier_id: &Uuid) -> bool {
        self.statuses
            .get(courier_id)
            .map(|status| status.online)
            .unwrap_or(false)
    }

    fn is_dispatchable(&self, courier_id: &Uuid) -> bool {
        self.couriers
            .get(courier_id)
            .map(|courier| courier.dispatchable())
            .unwrap_or(false)
    }
}

#[async_trait]
impl DirectoryRepository for MemoryStore {
    async fn courier(&self, courier_id: Uuid) -> StoreResult<Option<CourierProfile>> {
        Ok(self.couriers.get(&courier_id).map(|c| c.value().clone()))
    }

    async fn restaurant(&self, restaurant_id: Uuid) -> StoreResult<Option<Restaurant>> {
        Ok(self.restaurants.get(&restaurant_id).map(|r| r.value().clone()))
    }

    async fn online_restaurant_couriers(&self, restaurant_id: Uuid) -> StoreResult<Vec<Uuid>> {
        let assigned: Vec<Uuid> = self
            .restaurant_couriers
            .get(&restaurant_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();

        Ok(assigned
            .into_iter()
            .filter(|id| self.is_dispatchable(id) && self.is_online(id))
            .collect())
    }
}

#[async_trait]
impl PresenceRepository for MemoryStore {
    async fn upsert_location(
        &self,
        courier_id: Uuid,
        location: GeoPoint,
    ) -> StoreResult<PresenceSnapshot> {
        let snapshot = PresenceSnapshot {
            courier_id,
            location,
            updated_at: Utc::now(),
        };
        self.gps.insert(courier_id, snapshot.clone());
        Ok(snapshot)
    }

    async fn location(&self, courier_id: Uuid) -> StoreResult<Option<PresenceSnapshot>> {
        Ok(self.gps.get(&courier_id).map(|s| s.value().clone()))
    }

    async fn set_online(&self, courier_id: Uuid, online: bool) -> StoreResult<CourierStatus> {
        let status = CourierStatus {
            courier_id,
            online,
            updated_at: Utc::now(),
        };
        self.statuses.insert(courier_id, status.clone());
        Ok(status)
    }

    async fn append_presence_event(&self, courier_id: Uuid, online: bool) -> StoreResult<()> {
        let mut events = self
            .presence_events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        events.push(PresenceEvent {
            courier_id,
            is_online: online,
            at: Utc::now(),
        });
        Ok(())
    }

    async fn presence_events(
        &self,
        courier_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<PresenceEvent>> {
        let events = self
            .presence_events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut selected: Vec<PresenceEvent> = events
            .iter()
            .filter(|e| e.courier_id == courier_id && e.at >= from && e.at <= to)
            .cloned()
            .collect();
        selected.sort_by_key(|e| e.at);
        Ok(selected)
    }

    async fn nearby_online(
        &self,
        origin: GeoPoint,
        radius_km: f64,
        limit: u32,
    ) -> StoreResult<Vec<NearbyCourier>> {
        let mut nearby: Vec<NearbyCourier> = self
            .gps
            .iter()
            .filter(|entry| self.is_dispatchable(entry.key()) && self.is_online(entry.key()))
            .filter_map(|entry| {
                let distance_km = great_circle_km(&origin, &entry.value().location);
                (distance_km <= radius_km).then_some(NearbyCourier {
                    courier_id: *entry.key(),
                    distance_km,
                })
            })
            .collect();

        nearby.sort_by(|a, b| a.distance_km.total_cmp(&b.distance_km));
        nearby.truncate(limit as usize);
        Ok(nearby)
    }
}

#[async_trait]
impl OrderRepository for MemoryStore {
    async fn insert_order(&self, restaurant_id: Uuid, order: NewOrder) -> StoreResult<Order> {
        let sequence = {
            let mut counter = self.order_counters.entry(restaurant_id).or_insert(0);
            *counter += 1;
            *counter
        };

        let now = Utc::now();
        let order = Order {
            id: Uuid::new_v4(),
            restaurant_id,
            courier_id: None,
            code: format_order_code(sequence),
            customer: order.customer,
            phone: order.phone,
            address: order.address,
            delivery_address: order.delivery_address,
            delivery_type: order.delivery_type,
            status: OrderStatus::Preparing,
            amount: order.amount,
            pickup: order.pickup,
            dropoff: order.dropoff,
            carrier_type: order.carrier_type,
            vehicle_type: order.vehicle_type,
            cargo_type: order.cargo_type,
            special_requests: order.special_requests,
            items: order.items,
            created_at: now,
            updated_at: now,
        };

        self.orders.insert(order.id, order.clone());
        Ok(order)
    }

    async fn fetch_order(&self, order_id: Uuid) -> StoreResult<Option<Order>> {
        Ok(self.orders.get(&order_id).map(|o| o.value().clone()))
    }

    async fn update_order(
        &self,
        order_id: Uuid,
        update: &OrderUpdate,
    ) -> StoreResult<Option<Order>> {
        let Some(mut order) = self.orders.get_mut(&order_id) else {
            return Ok(None);
        };
        if order.status.is_terminal() {
            return Ok(None);
        }
        update.apply(&mut order);
        order.updated_at = Utc::now();
        Ok(Some(order.clone()))
    }

    async fn delete_order(&self, order_id: Uuid) -> StoreResult<bool> {
        let removed = self
            .orders
            .remove_if(&order_id, |_, order| order.status != OrderStatus::Delivered);
        if removed.is_some() {
            self.watchers.remove(&order_id);
            self.pool.remove(&order_id);
        }
        Ok(removed.is_some())
    }

    async fn transition_status(
        &self,
        order_id: Uuid,
        from: &[OrderStatus],
        to: OrderStatus,
        held_by: Option<Uuid>,
    ) -> StoreResult<Option<Order>> {
        let Some(mut order) = self.orders.get_mut(&order_id) else {
            return Ok(None);
        };
        if !from.contains(&order.status) {
            return Ok(None);
        }
        if held_by.is_some() && order.courier_id != held_by {
            return Ok(None);
        }
        order.status = to;
        order.updated_at = Utc::now();
        Ok(Some(order.clone()))
    }

    async fn assign_courier(
        &self,
        order_id: Uuid,
        courier_id: Uuid,
        from: &[OrderStatus],
    ) -> StoreResult<Option<Order>> {
        let Some(mut order) = self.orders.get_mut(&order_id) else {
            return Ok(None);
        };
        if !from.contains(&order.status) {
            return Ok(None);
        }
        order.status = OrderStatus::Assigned;
        order.courier_id = Some(courier_id);
        order.updated_at = Utc::now();
        Ok(Some(order.clone()))
    }

    async fn list_orders(
        &self,
        scope: OrderScope,
        filter: &OrderFilter,
    ) -> StoreResult<Page<Order>> {
        let mut orders: Vec<Order> = self
            .orders
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|order| match scope {
                OrderScope::Restaurant(id) => order.restaurant_id == id,
                OrderScope::Courier(id) => order.courier_id == Some(id),
            })
            .filter(|order| filter.matches(order))
            .collect();

        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(Page::from_vec(orders, filter.limit, filter.offset))
    }

    async fn active_order_for_courier(
        &self,
        courier_id: Uuid,
        statuses: &[OrderStatus],
    ) -> StoreResult<Option<Order>> {
        Ok(self
            .orders
            .iter()
            .filter(|entry| {
                entry.courier_id == Some(courier_id) && statuses.contains(&entry.status)
            })
            .max_by_key(|entry| entry.updated_at)
            .map(|entry| entry.value().clone()))
    }
}

#[async_trait]
impl WatcherRepository for MemoryStore {
    async fn create_watcher(
        &self,
        order_id: Uuid,
        restaurant_id: Uuid,
        available: &BTreeSet<Uuid>,
    ) -> StoreResult<OrderWatcher> {
        let watcher = match self.watchers.entry(order_id) {
            Entry::Occupied(existing) => existing.get().clone(),
            Entry::Vacant(slot) => slot
                .insert(OrderWatcher::new(order_id, restaurant_id, available.clone()))
                .clone(),
        };
        Ok(watcher)
    }

    async fn watcher(&self, order_id: Uuid) -> StoreResult<Option<OrderWatcher>> {
        Ok(self.watchers.get(&order_id).map(|w| w.value().clone()))
    }

    async fn replace_available(
        &self,
        order_id: Uuid,
        available: &BTreeSet<Uuid>,
    ) -> StoreResult<bool> {
        match self.watchers.get_mut(&order_id) {
            Some(mut watcher) if !watcher.closed => {
                watcher.available_couriers = available.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn append_rejection(&self, order_id: Uuid, courier_id: Uuid) -> StoreResult<bool> {
        match self.watchers.get_mut(&order_id) {
            Some(mut watcher) if !watcher.closed => {
                Ok(watcher.rejected_couriers.insert(courier_id))
            }
            _ => Ok(false),
        }
    }

    async fn effective_candidates(&self, order_id: Uuid) -> StoreResult<Option<BTreeSet<Uuid>>> {
        Ok(self
            .watchers
            .get(&order_id)
            .filter(|watcher| !watcher.closed)
            .map(|watcher| watcher.effective_candidates()))
    }

    async fn touch_watcher(&self, order_id: Uuid) -> StoreResult<()> {
        if let Some(mut watcher) = self.watchers.get_mut(&order_id) {
            if !watcher.closed {
                watcher.last_tick_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn close_watcher(&self, order_id: Uuid) -> StoreResult<bool> {
        match self.watchers.get_mut(&order_id) {
            Some(mut watcher) if !watcher.closed => {
                watcher.closed = true;
                watcher.last_tick_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_watcher(&self, order_id: Uuid) -> StoreResult<bool> {
        Ok(self.watchers.remove(&order_id).is_some())
    }

    async fn open_watchers(&self) -> StoreResult<Vec<OrderWatcher>> {
        Ok(self
            .watchers
            .iter()
            .filter(|w| !w.closed)
            .map(|w| w.value().clone())
            .collect())
    }

    async fn orders_offered_to(&self, courier_id: Uuid) -> StoreResult<Vec<Uuid>> {
        Ok(self
            .watchers
            .iter()
            .filter(|w| w.is_offered_to(&courier_id))
            .map(|w| w.order_id)
            .collect())
    }
}

#[async_trait]
impl PoolRepository for MemoryStore {
    async fn insert_pool_entry(
        &self,
        order_id: Uuid,
        message: Option<String>,
    ) -> StoreResult<Option<PoolEntry>> {
        match self.pool.entry(order_id) {
            Entry::Occupied(_) => Ok(None),
            Entry::Vacant(slot) => {
                let entry = PoolEntry {
                    order_id,
                    message,
                    created_at: Utc::now(),
                };
                slot.insert(entry.clone());
                Ok(Some(entry))
            }
        }
    }

    async fn pool_entry(&self, order_id: Uuid) -> StoreResult<Option<PoolEntry>> {
        Ok(self.pool.get(&order_id).map(|e| e.value().clone()))
    }

    async fn delete_pool_entry(&self, order_id: Uuid) -> StoreResult<bool> {
        Ok(self.pool.remove(&order_id).is_some())
    }

    async fn pool_listings(&self, origin: Option<GeoPoint>) -> StoreResult<Vec<PoolListing>> {
        let entries: Vec<PoolEntry> = self.pool.iter().map(|e| e.value().clone()).collect();

        let mut listings: Vec<PoolListing> = entries
            .into_iter()
            .filter_map(|entry| {
                let order = self.orders.get(&entry.order_id)?;
                Some(PoolListing {
                    order_id: order.id,
                    restaurant_id: order.restaurant_id,
                    code: order.code.clone(),
                    status: order.status,
                    message: entry.message,
                    pickup: order.pickup,
                    dropoff: order.dropoff,
                    delivery_address: order.delivery_address.clone(),
                    amount: order.amount,
                    created_at: entry.created_at,
                })
            })
            .collect();

        match origin {
            Some(origin) => listings.sort_by(|a, b| {
                planar_delta_sq(&origin, &a.pickup)
                    .total_cmp(&planar_delta_sq(&origin, &b.pickup))
                    .then(a.created_at.cmp(&b.created_at))
            }),
            None => listings.sort_by_key(|listing| listing.created_at),
        }
        Ok(listings)
    }
}

#[async_trait]
impl OfferLogRepository for MemoryStore {
    async fn record_offer_action(
        &self,
        courier_id: Uuid,
        order_id: Uuid,
        action: OfferAction,
    ) -> StoreResult<Option<OfferLogEntry>> {
        match self.offer_log.entry((courier_id, order_id)) {
            Entry::Occupied(_) => Ok(None),
            Entry::Vacant(slot) => {
                let entry = OfferLogEntry {
                    courier_id,
                    order_id,
                    action,
                    created_at: Utc::now(),
                };
                slot.insert(entry.clone());
                Ok(Some(entry))
            }
        }
    }

    async fn offer_log(
        &self,
        courier_id: Uuid,
        action: Option<OfferAction>,
        limit: u32,
        offset: u32,
    ) -> StoreResult<Page<OfferLogEntry>> {
        let mut entries: Vec<OfferLogEntry> = self
            .offer_log
            .iter()
            .filter(|e| e.courier_id == courier_id)
            .filter(|e| action.is_none_or(|a| e.action == a))
            .map(|e| e.value().clone())
            .collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(Page::from_vec(entries, limit, offset))
    }
}

impl DispatchStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }
}

pub fn format_order_code(sequence: u64) -> String {
    format!("RST{sequence:03}")
}
