use std::sync::Arc;

use axum::extract::State;
use axum::routing::delete;
use axum::{Json, Router};
use uuid::Uuid;

use crate::api::rest::envelope::{Envelope, ValidPath, ok};
use crate::auth::AuthUser;
use crate::error::AppError;
use crate::models::order::Order;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/admin/pool/:order_id", delete(remove_from_pool))
}

/// Takes the entry out of the pool and cancels a still pooled order.
async fn remove_from_pool(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    ValidPath(order_id): ValidPath<Uuid>,
) -> Result<Json<Envelope<Order>>, AppError> {
    user.require_admin()?;

    let order = state.offers.withdraw_from_pool(order_id).await?;
    Ok(ok("Pool entry removed", order))
}
