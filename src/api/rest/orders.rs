//! Restaurant-facing order endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::api::rest::envelope::{Envelope, ValidJson, ValidPath, ValidQuery, ok};
use crate::auth::AuthUser;
use crate::engine::orders::OrderDraft;
use crate::engine::queue::enqueue_order;
use crate::error::AppError;
use crate::models::Page;
use crate::models::clamp_limit;
use crate::models::courier::PresenceSnapshot;
use crate::models::order::{DeliveryType, Order, OrderFilter, OrderStatus, OrderUpdate};
use crate::models::pool::PoolEntry;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/restaurant/:restaurant_id/orders",
            post(create_order).get(list_orders),
        )
        .route("/restaurant/:restaurant_id/orders/history", get(order_history))
        .route(
            "/restaurant/:restaurant_id/orders/:order_id",
            get(get_order).put(update_order).delete(delete_order),
        )
        .route(
            "/restaurant/:restaurant_id/orders/:order_id/cancel",
            post(cancel_order),
        )
        .route(
            "/restaurant/:restaurant_id/orders/:order_id/call-courier",
            post(call_courier),
        )
        .route(
            "/restaurant/:restaurant_id/orders/:order_id/pool",
            post(send_to_pool),
        )
        .route(
            "/restaurant/:restaurant_id/orders/:order_id/courier-gps",
            get(courier_gps),
        )
}

/// Query string shared by every order listing.
#[derive(Debug, Default, Deserialize)]
pub struct OrderListQuery {
    /// Comma-separated status names.
    pub status: Option<String>,
    #[serde(rename = "type")]
    pub delivery_type: Option<DeliveryType>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub search: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl OrderListQuery {
    pub fn into_filter(self) -> Result<OrderFilter, AppError> {
        let statuses = match self.status.as_deref() {
            Some(raw) => raw
                .split(',')
                .filter(|part| !part.trim().is_empty())
                .map(|part| part.parse::<OrderStatus>().map_err(AppError::Validation))
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };

        Ok(OrderFilter {
            statuses,
            delivery_type: self.delivery_type,
            created_from: self.from,
            created_to: self.to,
            search: self.search.filter(|s| !s.trim().is_empty()),
            limit: clamp_limit(self.limit),
            offset: self.offset.unwrap_or(0),
        })
    }
}

#[derive(Deserialize)]
pub struct PoolRequest {
    pub message: Option<String>,
}

async fn create_order(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    ValidPath(restaurant_id): ValidPath<Uuid>,
    ValidJson(draft): ValidJson<OrderDraft>,
) -> Result<Json<Envelope<Order>>, AppError> {
    user.require_restaurant(restaurant_id)?;

    let order = state.orders.create(restaurant_id, draft).await?;
    enqueue_order(&state, order.id).await?;

    Ok(ok("Order created", order))
}

async fn list_orders(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    ValidPath(restaurant_id): ValidPath<Uuid>,
    ValidQuery(query): ValidQuery<OrderListQuery>,
) -> Result<Json<Envelope<Page<Order>>>, AppError> {
    user.require_restaurant(restaurant_id)?;

    let page = state
        .orders
        .list_by_restaurant(restaurant_id, query.into_filter()?)
        .await?;
    Ok(ok("Orders", page))
}

async fn order_history(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    ValidPath(restaurant_id): ValidPath<Uuid>,
    ValidQuery(query): ValidQuery<OrderListQuery>,
) -> Result<Json<Envelope<Page<Order>>>, AppError> {
    user.require_restaurant(restaurant_id)?;

    let page = state
        .orders
        .history(restaurant_id, query.into_filter()?)
        .await?;
    Ok(ok("Order history", page))
}

async fn get_order(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    ValidPath((restaurant_id, order_id)): ValidPath<(Uuid, Uuid)>,
) -> Result<Json<Envelope<Order>>, AppError> {
    user.require_restaurant(restaurant_id)?;

    let order = state.orders.get(order_id, Some(restaurant_id)).await?;
    Ok(ok("Order", order))
}

async fn update_order(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    ValidPath((restaurant_id, order_id)): ValidPath<(Uuid, Uuid)>,
    ValidJson(update): ValidJson<OrderUpdate>,
) -> Result<Json<Envelope<Order>>, AppError> {
    user.require_restaurant(restaurant_id)?;

    let order = state.orders.update(order_id, restaurant_id, update).await?;
    Ok(ok("Order updated", order))
}

async fn delete_order(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    ValidPath((restaurant_id, order_id)): ValidPath<(Uuid, Uuid)>,
) -> Result<Json<Envelope<Value>>, AppError> {
    user.require_restaurant(restaurant_id)?;

    state.offers.delete_order(restaurant_id, order_id).await?;
    Ok(ok("Order deleted", json!({})))
}

async fn cancel_order(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    ValidPath((restaurant_id, order_id)): ValidPath<(Uuid, Uuid)>,
) -> Result<Json<Envelope<Order>>, AppError> {
    user.require_restaurant(restaurant_id)?;

    let order = state.offers.cancel(restaurant_id, order_id).await?;
    Ok(ok("Order cancelled", order))
}

async fn call_courier(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    ValidPath((restaurant_id, order_id)): ValidPath<(Uuid, Uuid)>,
) -> Result<Json<Envelope<Order>>, AppError> {
    user.require_restaurant(restaurant_id)?;

    let order = state.offers.call_courier(restaurant_id, order_id).await?;
    Ok(ok("Courier called", order))
}

async fn send_to_pool(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    ValidPath((restaurant_id, order_id)): ValidPath<(Uuid, Uuid)>,
    ValidJson(request): ValidJson<PoolRequest>,
) -> Result<Json<Envelope<PoolEntry>>, AppError> {
    user.require_restaurant(restaurant_id)?;

    let message = request.message.filter(|m| !m.trim().is_empty());
    let entry = state
        .offers
        .send_to_pool(restaurant_id, order_id, message)
        .await?;
    Ok(ok("Order sent to pool", entry))
}

async fn courier_gps(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    ValidPath((restaurant_id, order_id)): ValidPath<(Uuid, Uuid)>,
) -> Result<Json<Envelope<PresenceSnapshot>>, AppError> {
    user.require_restaurant(restaurant_id)?;

    let order = state.orders.get(order_id, Some(restaurant_id)).await?;
    let courier_id = order
        .courier_id
        .ok_or_else(|| AppError::NotFound("assigned courier".to_string()))?;
    let snapshot = state
        .presence
        .get_location(courier_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("location of courier {courier_id}")))?;

    Ok(ok("Courier location", snapshot))
}
