//! Courier-facing endpoints: offers, order progress, presence.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::api::rest::envelope::{Envelope, ValidJson, ValidPath, ValidQuery, ok};
use crate::api::rest::orders::OrderListQuery;
use crate::auth::AuthUser;
use crate::engine::presence::WorkHours;
use crate::error::AppError;
use crate::models::courier::{CourierStatus, GeoPoint, PresenceSnapshot};
use crate::models::offer_log::{OfferAction, OfferLogEntry};
use crate::models::order::Order;
use crate::models::pool::PoolListing;
use crate::models::{Page, clamp_limit};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/courier/:courier_id/orders/:order_id/accept",
            post(accept_order),
        )
        .route(
            "/courier/:courier_id/orders/:order_id/reject",
            post(reject_order),
        )
        .route(
            "/courier/:courier_id/orders/:order_id/pickup",
            post(pickup_order),
        )
        .route(
            "/courier/:courier_id/orders/:order_id/arrive",
            post(arrive_order),
        )
        .route(
            "/courier/:courier_id/orders/:order_id/deliver",
            post(deliver_order),
        )
        .route("/courier/:courier_id/orders", get(list_orders))
        .route("/courier/:courier_id/assigned-orders", get(assigned_orders))
        .route("/courier/:courier_id/orders-log", get(orders_log))
        .route("/courier/:courier_id/offers", get(offers))
        .route("/courier/:courier_id/pool", get(pool))
        .route("/courier/:courier_id/gps", post(report_gps))
        .route("/courier/:courier_id/online", put(set_online))
        .route("/courier/:courier_id/work-hours", get(work_hours))
}

#[derive(Deserialize)]
pub struct OnlineRequest {
    pub online: bool,
}

#[derive(Deserialize)]
pub struct OfferLogQuery {
    pub action: Option<OfferAction>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Deserialize)]
pub struct WorkHoursQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

async fn accept_order(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    ValidPath((courier_id, order_id)): ValidPath<(Uuid, Uuid)>,
) -> Result<Json<Envelope<Order>>, AppError> {
    user.require_courier(courier_id)?;

    let order = state.offers.courier_accept(courier_id, order_id).await?;
    Ok(ok("Order accepted", order))
}

async fn reject_order(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    ValidPath((courier_id, order_id)): ValidPath<(Uuid, Uuid)>,
) -> Result<Json<Envelope<Order>>, AppError> {
    user.require_courier(courier_id)?;

    let order = state.offers.courier_reject(courier_id, order_id).await?;
    Ok(ok("Order rejected", order))
}

async fn pickup_order(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    ValidPath((courier_id, order_id)): ValidPath<(Uuid, Uuid)>,
) -> Result<Json<Envelope<Order>>, AppError> {
    user.require_courier(courier_id)?;

    let order = state.offers.pickup(courier_id, order_id).await?;
    Ok(ok("Order picked up", order))
}

async fn arrive_order(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    ValidPath((courier_id, order_id)): ValidPath<(Uuid, Uuid)>,
) -> Result<Json<Envelope<Order>>, AppError> {
    user.require_courier(courier_id)?;

    let order = state.offers.arrive(courier_id, order_id).await?;
    Ok(ok("Courier at location", order))
}

async fn deliver_order(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    ValidPath((courier_id, order_id)): ValidPath<(Uuid, Uuid)>,
) -> Result<Json<Envelope<Order>>, AppError> {
    user.require_courier(courier_id)?;

    let order = state.offers.deliver(courier_id, order_id).await?;
    Ok(ok("Order delivered", order))
}

async fn list_orders(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    ValidPath(courier_id): ValidPath<Uuid>,
    ValidQuery(query): ValidQuery<OrderListQuery>,
) -> Result<Json<Envelope<Page<Order>>>, AppError> {
    user.require_courier(courier_id)?;

    let page = state
        .orders
        .list_by_courier(courier_id, query.into_filter()?)
        .await?;
    Ok(ok("Orders", page))
}

async fn assigned_orders(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    ValidPath(courier_id): ValidPath<Uuid>,
    ValidQuery(query): ValidQuery<OrderListQuery>,
) -> Result<Json<Envelope<Page<Order>>>, AppError> {
    user.require_courier(courier_id)?;

    let page = state
        .orders
        .list_assigned_to_courier(courier_id, query.into_filter()?)
        .await?;
    Ok(ok("Assigned orders", page))
}

async fn orders_log(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    ValidPath(courier_id): ValidPath<Uuid>,
    ValidQuery(query): ValidQuery<OfferLogQuery>,
) -> Result<Json<Envelope<Page<OfferLogEntry>>>, AppError> {
    user.require_courier(courier_id)?;

    let page = state
        .offers
        .offer_log(
            courier_id,
            query.action,
            clamp_limit(query.limit),
            query.offset.unwrap_or(0),
        )
        .await?;
    Ok(ok("Order log", page))
}

async fn offers(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    ValidPath(courier_id): ValidPath<Uuid>,
) -> Result<Json<Envelope<Vec<Order>>>, AppError> {
    user.require_courier(courier_id)?;

    let offers = state.offers.offers_for_courier(courier_id).await?;
    Ok(ok("Open offers", offers))
}

async fn pool(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    ValidPath(courier_id): ValidPath<Uuid>,
) -> Result<Json<Envelope<Vec<PoolListing>>>, AppError> {
    user.require_courier(courier_id)?;

    let listings = state.pool.list_for_courier(courier_id).await?;
    Ok(ok("Pool", listings))
}

async fn report_gps(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    ValidPath(courier_id): ValidPath<Uuid>,
    ValidJson(location): ValidJson<GeoPoint>,
) -> Result<Json<Envelope<PresenceSnapshot>>, AppError> {
    user.require_courier(courier_id)?;

    let snapshot = state.presence.upsert_location(courier_id, location).await?;
    Ok(ok("Location updated", snapshot))
}

async fn set_online(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    ValidPath(courier_id): ValidPath<Uuid>,
    ValidJson(request): ValidJson<OnlineRequest>,
) -> Result<Json<Envelope<CourierStatus>>, AppError> {
    user.require_courier(courier_id)?;

    let status = state.presence.set_online(courier_id, request.online).await?;
    Ok(ok("Status updated", status))
}

/// Defaults to the last 24 hours.
async fn work_hours(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    ValidPath(courier_id): ValidPath<Uuid>,
    ValidQuery(query): ValidQuery<WorkHoursQuery>,
) -> Result<Json<Envelope<WorkHours>>, AppError> {
    user.require_courier(courier_id)?;

    let to = query.to.unwrap_or_else(Utc::now);
    let from = query.from.unwrap_or(to - Duration::hours(24));
    let hours = state.presence.work_hours(courier_id, from, to).await?;
    Ok(ok("Work hours", hours))
}
