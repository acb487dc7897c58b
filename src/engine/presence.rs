use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::courier::{CourierStatus, GeoPoint, NearbyCourier, PresenceEvent, PresenceSnapshot};
use crate::realtime::RoutePusher;
use crate::store::DispatchStore;

#[derive(Clone)]
pub struct PresenceFeed {
    store: Arc<dyn DispatchStore>,
    routes: RoutePusher,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkHours {
    pub courier_id: Uuid,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub online_seconds: i64,
}

impl PresenceFeed {
    pub fn new(store: Arc<dyn DispatchStore>, routes: RoutePusher) -> Self {
        Self { store, routes }
    }

    /// Records the fix, then recomputes the courier's route before returning.
    pub async fn upsert_location(
        &self,
        courier_id: Uuid,
        location: GeoPoint,
    ) -> Result<PresenceSnapshot, AppError> {
        if !location.is_valid() {
            return Err(AppError::Validation(format!(
                "coordinates out of range: {}, {}",
                location.lat, location.lng
            )));
        }

        let snapshot = self.store.upsert_location(courier_id, location).await?;
        self.routes.push_for_courier(courier_id).await;
        Ok(snapshot)
    }

    pub async fn get_location(&self, courier_id: Uuid) -> Result<Option<PresenceSnapshot>, AppError> {
        Ok(self.store.location(courier_id).await?)
    }

    /// The status row is authoritative; the event log is analytics only, so a
    /// failed append is logged and dropped.
    pub async fn set_online(&self, courier_id: Uuid, online: bool) -> Result<CourierStatus, AppError> {
        let status = self.store.set_online(courier_id, online).await?;

        if let Err(err) = self.store.append_presence_event(courier_id, online).await {
            warn!(courier_id = %courier_id, error = %err, "presence event not recorded");
        }

        info!(courier_id = %courier_id, online, "courier presence changed");
        Ok(status)
    }

    pub async fn nearby_online(
        &self,
        origin: GeoPoint,
        radius_km: f64,
        limit: u32,
    ) -> Result<Vec<NearbyCourier>, AppError> {
        Ok(self.store.nearby_online(origin, radius_km, limit).await?)
    }

    pub async fn work_hours(
        &self,
        courier_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<WorkHours, AppError> {
        if to <= from {
            return Err(AppError::Validation("`to` must be after `from`".to_string()));
        }

        let events = self.store.presence_events(courier_id, from, to).await?;
        Ok(WorkHours {
            courier_id,
            from,
            to,
            online_seconds: online_duration(&events, from, to).num_seconds(),
        })
    }
}

/// Sums the online spans inside `[from, to]`. Events must be sorted by time.
/// A window that opens with an offline event counts as online from `from`;
/// a trailing online span is closed at `to`.
pub fn online_duration(
    events: &[PresenceEvent],
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> chrono::Duration {
    let mut online_since = match events.first() {
        Some(first) if !first.is_online => Some(from),
        _ => None,
    };
    let mut total = chrono::Duration::zero();

    for event in events {
        let at = event.at.clamp(from, to);
        match (event.is_online, online_since) {
            (true, None) => online_since = Some(at),
            (false, Some(since)) => {
                total += at - since;
                online_since = None;
            }
            _ => {}
        }
    }

    if let Some(since) = online_since {
        total += to - since;
    }
    total
}
