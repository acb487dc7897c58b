use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::models::Page;
use crate::models::courier::{
    CourierProfile, CourierStatus, GeoPoint, NearbyCourier, PresenceEvent, PresenceSnapshot,
    Restaurant,
};
use crate::models::offer_log::{OfferAction, OfferLogEntry};
use crate::models::order::{
    DeliveryType, NewOrder, Order, OrderFilter, OrderItem, OrderScope, OrderStatus, OrderUpdate,
};
use crate::models::pool::{PoolEntry, PoolListing};
use crate::models::watcher::OrderWatcher;
use crate::store::memory::format_order_code;
use crate::store::{
    DirectoryRepository, DispatchStore, OfferLogRepository, OrderRepository, PoolRepository,
    PresenceRepository, StoreError, StoreResult, WatcherRepository,
};

const ORDER_COLUMNS: &str = "id, restaurant_id, courier_id, code, customer, phone, address, \
     delivery_address, type, status, amount, pickup_lat, pickup_lng, dropoff_lat, dropoff_lng, \
     carrier_type, vehicle_type, cargo_type, special_requests, created_at, updated_at";

const WATCHER_COLUMNS: &str =
    "order_id, restaurant_id, available_couriers, rejected_couriers, last_check, closed";

/// Great-circle distance from ($1, $2) to the gps row, law of cosines with the
/// cosine clamped into [-1, 1].
const DISTANCE_KM_SQL: &str = "6371.0 * acos(LEAST(1.0, GREATEST(-1.0, \
     cos(radians($1)) * cos(radians(g.latitude)) * cos(radians(g.longitude) - radians($2)) \
     + sin(radians($1)) * sin(radians(g.latitude)))))";

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn attach_items(&self, rows: Vec<OrderRow>) -> StoreResult<Vec<Order>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<Uuid> = rows.iter().map(|row| row.id).collect();
        let items: Vec<OrderItemRow> = sqlx::query_as(
            "SELECT order_id, product_name, price, quantity, total \
             FROM order_items WHERE order_id = ANY($1) ORDER BY id",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut by_order: HashMap<Uuid, Vec<OrderItem>> = HashMap::new();
        for item in items {
            by_order
                .entry(item.order_id)
                .or_default()
                .push(item.into_item()?);
        }

        Ok(rows
            .into_iter()
            .map(|row| {
                let items = by_order.remove(&row.id).unwrap_or_default();
                row.into_order(items)
            })
            .collect())
    }

    async fn attach_one(&self, row: Option<OrderRow>) -> StoreResult<Option<Order>> {
        match row {
            Some(row) => Ok(self.attach_items(vec![row]).await?.pop()),
            None => Ok(None),
        }
    }
}

#[derive(FromRow)]
struct OrderRow {
    id: Uuid,
    restaurant_id: Uuid,
    courier_id: Option<Uuid>,
    code: String,
    customer: String,
    phone: String,
    address: String,
    delivery_address: String,
    #[sqlx(rename = "type")]
    delivery_type: DeliveryType,
    status: OrderStatus,
    amount: f64,
    pickup_lat: f64,
    pickup_lng: f64,
    dropoff_lat: f64,
    dropoff_lng: f64,
    carrier_type: Option<String>,
    vehicle_type: Option<String>,
    cargo_type: Option<String>,
    special_requests: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl OrderRow {
    fn into_order(self, items: Vec<OrderItem>) -> Order {
        Order {
            id: self.id,
            restaurant_id: self.restaurant_id,
            courier_id: self.courier_id,
            code: self.code,
            customer: self.customer,
            phone: self.phone,
            address: self.address,
            delivery_address: self.delivery_address,
            delivery_type: self.delivery_type,
            status: self.status,
            amount: self.amount,
            pickup: GeoPoint::new(self.pickup_lat, self.pickup_lng),
            dropoff: GeoPoint::new(self.dropoff_lat, self.dropoff_lng),
            carrier_type: self.carrier_type,
            vehicle_type: self.vehicle_type,
            cargo_type: self.cargo_type,
            special_requests: self.special_requests,
            items,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(FromRow)]
struct OrderItemRow {
    order_id: Uuid,
    product_name: String,
    price: f64,
    quantity: i32,
    total: f64,
}

impl OrderItemRow {
    fn into_item(self) -> StoreResult<OrderItem> {
        let quantity = u32::try_from(self.quantity)
            .map_err(|_| StoreError::Corrupt(format!("negative quantity on {}", self.order_id)))?;
        Ok(OrderItem {
            product_name: self.product_name,
            price: self.price,
            quantity,
            total: self.total,
        })
    }
}

#[derive(FromRow)]
struct WatcherRow {
    order_id: Uuid,
    restaurant_id: Uuid,
    available_couriers: Vec<Uuid>,
    rejected_couriers: Vec<Uuid>,
    last_check: DateTime<Utc>,
    closed: bool,
}

impl From<WatcherRow> for OrderWatcher {
    fn from(row: WatcherRow) -> Self {
        OrderWatcher {
            order_id: row.order_id,
            restaurant_id: row.restaurant_id,
            available_couriers: row.available_couriers.into_iter().collect(),
            rejected_couriers: row.rejected_couriers.into_iter().collect(),
            last_tick_at: row.last_check,
            closed: row.closed,
        }
    }
}

#[derive(FromRow)]
struct PoolListingRow {
    order_id: Uuid,
    restaurant_id: Uuid,
    code: String,
    status: OrderStatus,
    message: Option<String>,
    pickup_lat: f64,
    pickup_lng: f64,
    dropoff_lat: f64,
    dropoff_lng: f64,
    delivery_address: String,
    amount: f64,
    created_at: DateTime<Utc>,
}

impl From<PoolListingRow> for PoolListing {
    fn from(row: PoolListingRow) -> Self {
        PoolListing {
            order_id: row.order_id,
            restaurant_id: row.restaurant_id,
            code: row.code,
            status: row.status,
            message: row.message,
            pickup: GeoPoint::new(row.pickup_lat, row.pickup_lng),
            dropoff: GeoPoint::new(row.dropoff_lat, row.dropoff_lng),
            delivery_address: row.delivery_address,
            amount: row.amount,
            created_at: row.created_at,
        }
    }
}

fn status_names(statuses: &[OrderStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

fn push_order_filters(builder: &mut QueryBuilder<'_, Postgres>, scope: OrderScope, filter: &OrderFilter) {
    match scope {
        OrderScope::Restaurant(id) => {
            builder.push(" WHERE restaurant_id = ").push_bind(id);
        }
        OrderScope::Courier(id) => {
            builder.push(" WHERE courier_id = ").push_bind(id);
        }
    }
    if !filter.statuses.is_empty() {
        builder
            .push(" AND status::text = ANY(")
            .push_bind(status_names(&filter.statuses))
            .push(")");
    }
    if let Some(delivery_type) = filter.delivery_type {
        builder.push(" AND type = ").push_bind(delivery_type);
    }
    if let Some(from) = filter.created_from {
        builder.push(" AND created_at >= ").push_bind(from);
    }
    if let Some(to) = filter.created_to {
        builder.push(" AND created_at <= ").push_bind(to);
    }
    if let Some(search) = &filter.search {
        let pattern = format!("%{}%", search.replace('%', "\\%").replace('_', "\\_"));
        builder
            .push(" AND (code ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR customer ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR phone ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR delivery_address ILIKE ")
            .push_bind(pattern)
            .push(")");
    }
}

#[async_trait]
impl DirectoryRepository for PgStore {
    async fn courier(&self, courier_id: Uuid) -> StoreResult<Option<CourierProfile>> {
        let row: Option<(Uuid, bool, bool)> =
            sqlx::query_as("SELECT id, is_active, deleted FROM drivers WHERE id = $1")
                .bind(courier_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(id, is_active, deleted)| CourierProfile {
            id,
            is_active,
            deleted,
        }))
    }

    async fn restaurant(&self, restaurant_id: Uuid) -> StoreResult<Option<Restaurant>> {
        let row: Option<(Uuid, Option<f64>, Option<f64>)> =
            sqlx::query_as("SELECT id, latitude, longitude FROM restaurants WHERE id = $1")
                .bind(restaurant_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(id, lat, lng)| Restaurant {
            id,
            location: lat.zip(lng).map(|(lat, lng)| GeoPoint::new(lat, lng)),
        }))
    }

    async fn online_restaurant_couriers(&self, restaurant_id: Uuid) -> StoreResult<Vec<Uuid>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT d.id FROM restaurant_couriers rc \
             JOIN drivers d ON d.id = rc.courier_id \
             JOIN driver_status s ON s.driver_id = d.id \
             WHERE rc.restaurant_id = $1 AND d.is_active AND NOT d.deleted AND s.online",
        )
        .bind(restaurant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}

#[async_trait]
impl PresenceRepository for PgStore {
    async fn upsert_location(
        &self,
        courier_id: Uuid,
        location: GeoPoint,
    ) -> StoreResult<PresenceSnapshot> {
        let (lat, lng, updated_at): (f64, f64, DateTime<Utc>) = sqlx::query_as(
            "INSERT INTO gps_table (driver_id, latitude, longitude, updated_at) \
             VALUES ($1, $2, $3, now()) \
             ON CONFLICT (driver_id) DO UPDATE SET \
                latitude = EXCLUDED.latitude, \
                longitude = EXCLUDED.longitude, \
                updated_at = EXCLUDED.updated_at \
             RETURNING latitude, longitude, updated_at",
        )
        .bind(courier_id)
        .bind(location.lat)
        .bind(location.lng)
        .fetch_one(&self.pool)
        .await?;

        Ok(PresenceSnapshot {
            courier_id,
            location: GeoPoint::new(lat, lng),
            updated_at,
        })
    }

    async fn location(&self, courier_id: Uuid) -> StoreResult<Option<PresenceSnapshot>> {
        let row: Option<(f64, f64, DateTime<Utc>)> = sqlx::query_as(
            "SELECT latitude, longitude, updated_at FROM gps_table WHERE driver_id = $1",
        )
        .bind(courier_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(lat, lng, updated_at)| PresenceSnapshot {
            courier_id,
            location: GeoPoint::new(lat, lng),
            updated_at,
        }))
    }

    async fn set_online(&self, courier_id: Uuid, online: bool) -> StoreResult<CourierStatus> {
        let updated_at: DateTime<Utc> = sqlx::query_scalar(
            "INSERT INTO driver_status (driver_id, online, updated_at) VALUES ($1, $2, now()) \
             ON CONFLICT (driver_id) DO UPDATE SET online = EXCLUDED.online, updated_at = EXCLUDED.updated_at \
             RETURNING updated_at",
        )
        .bind(courier_id)
        .bind(online)
        .fetch_one(&self.pool)
        .await?;
        Ok(CourierStatus {
            courier_id,
            online,
            updated_at,
        })
    }

    async fn append_presence_event(&self, courier_id: Uuid, online: bool) -> StoreResult<()> {
        sqlx::query("INSERT INTO driver_presence_events (driver_id, is_online) VALUES ($1, $2)")
            .bind(courier_id)
            .bind(online)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn presence_events(
        &self,
        courier_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<PresenceEvent>> {
        let rows: Vec<(bool, DateTime<Utc>)> = sqlx::query_as(
            "SELECT is_online, at_utc FROM driver_presence_events \
             WHERE driver_id = $1 AND at_utc >= $2 AND at_utc <= $3 ORDER BY at_utc, id",
        )
        .bind(courier_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(is_online, at)| PresenceEvent {
                courier_id,
                is_online,
                at,
            })
            .collect())
    }

    async fn nearby_online(
        &self,
        origin: GeoPoint,
        radius_km: f64,
        limit: u32,
    ) -> StoreResult<Vec<NearbyCourier>> {
        let sql = format!(
            "SELECT courier_id, distance_km FROM ( \
                SELECT d.id AS courier_id, {DISTANCE_KM_SQL} AS distance_km \
                FROM gps_table g \
                JOIN drivers d ON d.id = g.driver_id \
                JOIN driver_status s ON s.driver_id = d.id \
                WHERE d.is_active AND NOT d.deleted AND s.online \
             ) nearby \
             WHERE distance_km <= $3 \
             ORDER BY distance_km ASC \
             LIMIT $4"
        );
        let rows: Vec<(Uuid, f64)> = sqlx::query_as(&sql)
            .bind(origin.lat)
            .bind(origin.lng)
            .bind(radius_km)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(courier_id, distance_km)| NearbyCourier {
                courier_id,
                distance_km,
            })
            .collect())
    }
}

#[async_trait]
impl OrderRepository for PgStore {
    async fn insert_order(&self, restaurant_id: Uuid, order: NewOrder) -> StoreResult<Order> {
        let mut tx = self.pool.begin().await?;

        // Row lock on the counter serializes concurrent creates for one restaurant.
        let sequence: i64 = sqlx::query_scalar(
            "INSERT INTO restaurant_order_counters (restaurant_id, last_value) VALUES ($1, 1) \
             ON CONFLICT (restaurant_id) DO UPDATE \
                SET last_value = restaurant_order_counters.last_value + 1 \
             RETURNING last_value",
        )
        .bind(restaurant_id)
        .fetch_one(&mut *tx)
        .await?;
        let sequence = u64::try_from(sequence)
            .map_err(|_| StoreError::Corrupt(format!("order counter for {restaurant_id}")))?;

        let sql = format!(
            "INSERT INTO orders (id, restaurant_id, code, customer, phone, address, \
                delivery_address, type, status, amount, pickup_lat, pickup_lng, dropoff_lat, \
                dropoff_lng, carrier_type, vehicle_type, cargo_type, special_requests) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'preparing', $9, $10, $11, $12, $13, $14, $15, $16, $17) \
             RETURNING {ORDER_COLUMNS}"
        );
        let row: OrderRow = sqlx::query_as(&sql)
            .bind(Uuid::new_v4())
            .bind(restaurant_id)
            .bind(format_order_code(sequence))
            .bind(&order.customer)
            .bind(&order.phone)
            .bind(&order.address)
            .bind(&order.delivery_address)
            .bind(order.delivery_type)
            .bind(order.amount)
            .bind(order.pickup.lat)
            .bind(order.pickup.lng)
            .bind(order.dropoff.lat)
            .bind(order.dropoff.lng)
            .bind(&order.carrier_type)
            .bind(&order.vehicle_type)
            .bind(&order.cargo_type)
            .bind(&order.special_requests)
            .fetch_one(&mut *tx)
            .await?;

        for item in &order.items {
            let quantity = i32::try_from(item.quantity)
                .map_err(|_| StoreError::Corrupt(format!("quantity {} too large", item.quantity)))?;
            sqlx::query(
                "INSERT INTO order_items (order_id, product_name, price, quantity, total) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(row.id)
            .bind(&item.product_name)
            .bind(item.price)
            .bind(quantity)
            .bind(item.total)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(order_id = %row.id, code = %row.code, "order inserted");
        Ok(row.into_order(order.items))
    }

    async fn fetch_order(&self, order_id: Uuid) -> StoreResult<Option<Order>> {
        let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1");
        let row: Option<OrderRow> = sqlx::query_as(&sql)
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;
        self.attach_one(row).await
    }

    async fn update_order(
        &self,
        order_id: Uuid,
        update: &OrderUpdate,
    ) -> StoreResult<Option<Order>> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("UPDATE orders SET updated_at = now()");
        if let Some(customer) = &update.customer {
            builder.push(", customer = ").push_bind(customer.clone());
        }
        if let Some(phone) = &update.phone {
            builder.push(", phone = ").push_bind(phone.clone());
        }
        if let Some(address) = &update.address {
            builder.push(", address = ").push_bind(address.clone());
        }
        if let Some(delivery_address) = &update.delivery_address {
            builder
                .push(", delivery_address = ")
                .push_bind(delivery_address.clone());
        }
        if let Some(delivery_type) = update.delivery_type {
            builder.push(", type = ").push_bind(delivery_type);
        }
        if let Some(amount) = update.amount {
            builder.push(", amount = ").push_bind(amount);
        }
        if let Some(dropoff) = update.dropoff {
            builder
                .push(", dropoff_lat = ")
                .push_bind(dropoff.lat)
                .push(", dropoff_lng = ")
                .push_bind(dropoff.lng);
        }
        if let Some(carrier_type) = &update.carrier_type {
            builder.push(", carrier_type = ").push_bind(carrier_type.clone());
        }
        if let Some(vehicle_type) = &update.vehicle_type {
            builder.push(", vehicle_type = ").push_bind(vehicle_type.clone());
        }
        if let Some(cargo_type) = &update.cargo_type {
            builder.push(", cargo_type = ").push_bind(cargo_type.clone());
        }
        if let Some(special_requests) = &update.special_requests {
            builder
                .push(", special_requests = ")
                .push_bind(special_requests.clone());
        }
        builder
            .push(" WHERE id = ")
            .push_bind(order_id)
            .push(" AND status NOT IN ('delivered', 'cancelled') RETURNING ")
            .push(ORDER_COLUMNS);

        trace!(sql = builder.sql(), "updating order");
        let row: Option<OrderRow> = builder
            .build_query_as()
            .fetch_optional(&self.pool)
            .await?;
        self.attach_one(row).await
    }

    async fn delete_order(&self, order_id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM orders WHERE id = $1 AND status <> 'delivered'")
            .bind(order_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn transition_status(
        &self,
        order_id: Uuid,
        from: &[OrderStatus],
        to: OrderStatus,
        held_by: Option<Uuid>,
    ) -> StoreResult<Option<Order>> {
        let sql = format!(
            "UPDATE orders SET status = $2, updated_at = now() \
             WHERE id = $1 AND status::text = ANY($3) \
               AND ($4::uuid IS NULL OR courier_id = $4) \
             RETURNING {ORDER_COLUMNS}"
        );
        let row: Option<OrderRow> = sqlx::query_as(&sql)
            .bind(order_id)
            .bind(to)
            .bind(status_names(from))
            .bind(held_by)
            .fetch_optional(&self.pool)
            .await?;
        self.attach_one(row).await
    }

    async fn assign_courier(
        &self,
        order_id: Uuid,
        courier_id: Uuid,
        from: &[OrderStatus],
    ) -> StoreResult<Option<Order>> {
        let sql = format!(
            "UPDATE orders SET status = 'assigned', courier_id = $2, updated_at = now() \
             WHERE id = $1 AND status::text = ANY($3) \
             RETURNING {ORDER_COLUMNS}"
        );
        let row: Option<OrderRow> = sqlx::query_as(&sql)
            .bind(order_id)
            .bind(courier_id)
            .bind(status_names(from))
            .fetch_optional(&self.pool)
            .await?;
        self.attach_one(row).await
    }

    async fn list_orders(
        &self,
        scope: OrderScope,
        filter: &OrderFilter,
    ) -> StoreResult<Page<Order>> {
        let mut count: QueryBuilder<Postgres> = QueryBuilder::new("SELECT COUNT(*) FROM orders");
        push_order_filters(&mut count, scope, filter);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut select: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {ORDER_COLUMNS} FROM orders"));
        push_order_filters(&mut select, scope, filter);
        select
            .push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(i64::from(filter.limit))
            .push(" OFFSET ")
            .push_bind(i64::from(filter.offset));

        trace!(sql = select.sql(), "listing orders");
        let rows: Vec<OrderRow> = select.build_query_as().fetch_all(&self.pool).await?;

        Ok(Page {
            items: self.attach_items(rows).await?,
            total: total.max(0) as u64,
            limit: filter.limit,
            offset: filter.offset,
        })
    }

    async fn active_order_for_courier(
        &self,
        courier_id: Uuid,
        statuses: &[OrderStatus],
    ) -> StoreResult<Option<Order>> {
        let sql = format!(
            "SELECT {ORDER_COLUMNS} FROM orders \
             WHERE courier_id = $1 AND status::text = ANY($2) \
             ORDER BY updated_at DESC LIMIT 1"
        );
        let row: Option<OrderRow> = sqlx::query_as(&sql)
            .bind(courier_id)
            .bind(status_names(statuses))
            .fetch_optional(&self.pool)
            .await?;
        self.attach_one(row).await
    }
}

#[async_trait]
impl WatcherRepository for PgStore {
    async fn create_watcher(
        &self,
        order_id: Uuid,
        restaurant_id: Uuid,
        available: &BTreeSet<Uuid>,
    ) -> StoreResult<OrderWatcher> {
        let available: Vec<Uuid> = available.iter().copied().collect();
        sqlx::query(
            "INSERT INTO order_watchers (order_id, restaurant_id, available_couriers) \
             VALUES ($1, $2, $3) ON CONFLICT (order_id) DO NOTHING",
        )
        .bind(order_id)
        .bind(restaurant_id)
        .bind(&available)
        .execute(&self.pool)
        .await?;

        self.watcher(order_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("watcher for order {order_id}")))
    }

    async fn watcher(&self, order_id: Uuid) -> StoreResult<Option<OrderWatcher>> {
        let sql = format!("SELECT {WATCHER_COLUMNS} FROM order_watchers WHERE order_id = $1");
        let row: Option<WatcherRow> = sqlx::query_as(&sql)
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(OrderWatcher::from))
    }

    async fn replace_available(
        &self,
        order_id: Uuid,
        available: &BTreeSet<Uuid>,
    ) -> StoreResult<bool> {
        let available: Vec<Uuid> = available.iter().copied().collect();
        let result = sqlx::query(
            "UPDATE order_watchers SET available_couriers = $2 WHERE order_id = $1 AND NOT closed",
        )
        .bind(order_id)
        .bind(&available)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn append_rejection(&self, order_id: Uuid, courier_id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE order_watchers \
             SET rejected_couriers = array_append(rejected_couriers, $2) \
             WHERE order_id = $1 AND NOT closed AND NOT ($2 = ANY(rejected_couriers))",
        )
        .bind(order_id)
        .bind(courier_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn effective_candidates(&self, order_id: Uuid) -> StoreResult<Option<BTreeSet<Uuid>>> {
        let row: Option<Vec<Uuid>> = sqlx::query_scalar(
            "SELECT ARRAY(SELECT unnest(available_couriers) EXCEPT SELECT unnest(rejected_couriers)) \
             FROM order_watchers WHERE order_id = $1 AND NOT closed",
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|ids| ids.into_iter().collect()))
    }

    async fn touch_watcher(&self, order_id: Uuid) -> StoreResult<()> {
        sqlx::query("UPDATE order_watchers SET last_check = now() WHERE order_id = $1 AND NOT closed")
            .bind(order_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn close_watcher(&self, order_id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE order_watchers SET closed = TRUE, last_check = now() \
             WHERE order_id = $1 AND NOT closed",
        )
        .bind(order_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_watcher(&self, order_id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM order_watchers WHERE order_id = $1")
            .bind(order_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn open_watchers(&self) -> StoreResult<Vec<OrderWatcher>> {
        let sql = format!("SELECT {WATCHER_COLUMNS} FROM order_watchers WHERE NOT closed");
        let rows: Vec<WatcherRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(OrderWatcher::from).collect())
    }

    async fn orders_offered_to(&self, courier_id: Uuid) -> StoreResult<Vec<Uuid>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT order_id FROM order_watchers \
             WHERE NOT closed AND $1 = ANY(available_couriers) AND NOT ($1 = ANY(rejected_couriers))",
        )
        .bind(courier_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}

#[async_trait]
impl PoolRepository for PgStore {
    async fn insert_pool_entry(
        &self,
        order_id: Uuid,
        message: Option<String>,
    ) -> StoreResult<Option<PoolEntry>> {
        let row: Option<(Option<String>, DateTime<Utc>)> = sqlx::query_as(
            "INSERT INTO pool_orders (order_id, message) VALUES ($1, $2) \
             ON CONFLICT (order_id) DO NOTHING \
             RETURNING message, created_at",
        )
        .bind(order_id)
        .bind(message)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(message, created_at)| PoolEntry {
            order_id,
            message,
            created_at,
        }))
    }

    async fn pool_entry(&self, order_id: Uuid) -> StoreResult<Option<PoolEntry>> {
        let row: Option<(Option<String>, DateTime<Utc>)> =
            sqlx::query_as("SELECT message, created_at FROM pool_orders WHERE order_id = $1")
                .bind(order_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(message, created_at)| PoolEntry {
            order_id,
            message,
            created_at,
        }))
    }

    async fn delete_pool_entry(&self, order_id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM pool_orders WHERE order_id = $1")
            .bind(order_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn pool_listings(&self, origin: Option<GeoPoint>) -> StoreResult<Vec<PoolListing>> {
        const SELECT: &str = "SELECT p.order_id, o.restaurant_id, o.code, o.status, p.message, \
             o.pickup_lat, o.pickup_lng, o.dropoff_lat, o.dropoff_lng, o.delivery_address, \
             o.amount, p.created_at \
             FROM pool_orders p JOIN orders o ON o.id = p.order_id";

        let rows: Vec<PoolListingRow> = match origin {
            Some(origin) => {
                let sql = format!(
                    "{SELECT} ORDER BY power(o.pickup_lat - $1, 2) + power(o.pickup_lng - $2, 2) ASC, \
                     p.created_at ASC"
                );
                sqlx::query_as(&sql)
                    .bind(origin.lat)
                    .bind(origin.lng)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!("{SELECT} ORDER BY p.created_at ASC");
                sqlx::query_as(&sql).fetch_all(&self.pool).await?
            }
        };
        Ok(rows.into_iter().map(PoolListing::from).collect())
    }
}

#[async_trait]
impl OfferLogRepository for PgStore {
    async fn record_offer_action(
        &self,
        courier_id: Uuid,
        order_id: Uuid,
        action: OfferAction,
    ) -> StoreResult<Option<OfferLogEntry>> {
        let created_at: Option<DateTime<Utc>> = sqlx::query_scalar(
            "INSERT INTO courier_orders_log (courier_id, order_id, action) VALUES ($1, $2, $3) \
             ON CONFLICT (courier_id, order_id) DO NOTHING \
             RETURNING created_at",
        )
        .bind(courier_id)
        .bind(order_id)
        .bind(action)
        .fetch_optional(&self.pool)
        .await?;
        Ok(created_at.map(|created_at| OfferLogEntry {
            courier_id,
            order_id,
            action,
            created_at,
        }))
    }

    async fn offer_log(
        &self,
        courier_id: Uuid,
        action: Option<OfferAction>,
        limit: u32,
        offset: u32,
    ) -> StoreResult<Page<OfferLogEntry>> {
        let mut count: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT COUNT(*) FROM courier_orders_log WHERE courier_id = ");
        count.push_bind(courier_id);
        if let Some(action) = action {
            count.push(" AND action = ").push_bind(action);
        }
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut select: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT order_id, action, created_at FROM courier_orders_log WHERE courier_id = ",
        );
        select.push_bind(courier_id);
        if let Some(action) = action {
            select.push(" AND action = ").push_bind(action);
        }
        select
            .push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(i64::from(limit))
            .push(" OFFSET ")
            .push_bind(i64::from(offset));

        let rows: Vec<(Uuid, OfferAction, DateTime<Utc>)> =
            select.build_query_as().fetch_all(&self.pool).await?;

        Ok(Page {
            items: rows
                .into_iter()
                .map(|(order_id, action, created_at)| OfferLogEntry {
                    courier_id,
                    order_id,
                    action,
                    created_at,
                })
                .collect(),
            total: total.max(0) as u64,
            limit,
            offset,
        })
    }
}

impl DispatchStore for PgStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }
}
