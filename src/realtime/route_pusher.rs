use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::order::OrderStatus;
use crate::observability::metrics::Metrics;
use crate::routing::{DirectionsProvider, RouteSummary, compute_route};
use crate::store::DispatchStore;

/// Frames buffered per socket before new ones are dropped.
const SOCKET_BUFFER: usize = 16;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RouteFrame {
    RouteUpdate {
        order_id: Uuid,
        data: RouteSummary,
    },
    RouteError {
        order_id: Uuid,
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        status_code: Option<u16>,
    },
}

impl RouteFrame {
    fn kind(&self) -> &'static str {
        match self {
            RouteFrame::RouteUpdate { .. } => "route_update",
            RouteFrame::RouteError { .. } => "route_error",
        }
    }
}

struct Subscriber {
    id: Uuid,
    tx: mpsc::Sender<String>,
}

/// A socket's handle on the registry.
pub struct RouteSubscription {
    pub id: Uuid,
    pub courier_id: Uuid,
    pub frames: mpsc::Receiver<String>,
}

/// Process-local registry of courier route sockets. Nothing survives a restart.
#[derive(Clone)]
pub struct RoutePusher {
    store: Arc<dyn DispatchStore>,
    directions: Arc<dyn DirectionsProvider>,
    connections: Arc<DashMap<Uuid, Vec<Subscriber>>>,
    metrics: Metrics,
}

impl RoutePusher {
    pub fn new(
        store: Arc<dyn DispatchStore>,
        directions: Arc<dyn DirectionsProvider>,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            directions,
            connections: Arc::new(DashMap::new()),
            metrics,
        }
    }

    pub fn subscribe(&self, courier_id: Uuid) -> RouteSubscription {
        let (tx, frames) = mpsc::channel(SOCKET_BUFFER);
        let id = Uuid::new_v4();
        self.connections
            .entry(courier_id)
            .or_default()
            .push(Subscriber { id, tx });
        self.metrics.route_sockets_open.inc();

        info!(courier_id = %courier_id, subscription_id = %id, "route socket registered");
        RouteSubscription {
            id,
            courier_id,
            frames,
        }
    }

    pub fn unsubscribe(&self, courier_id: Uuid, subscription_id: Uuid) {
        let mut removed = 0;
        if let Some(mut subscribers) = self.connections.get_mut(&courier_id) {
            let before = subscribers.len();
            subscribers.retain(|s| s.id != subscription_id);
            removed = before - subscribers.len();
        }
        self.connections
            .remove_if(&courier_id, |_, subscribers| subscribers.is_empty());

        if removed > 0 {
            self.metrics.route_sockets_open.sub(removed as i64);
            info!(courier_id = %courier_id, subscription_id = %subscription_id, "route socket dropped");
        }
    }

    pub fn is_connected(&self, courier_id: Uuid) -> bool {
        self.connections.contains_key(&courier_id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.iter().map(|entry| entry.value().len()).sum()
    }

    /// Recomputes the courier's route and sends it to every open socket.
    /// Returns the frame sent, or `None` when there was nothing to send.
    pub async fn push_for_courier(&self, courier_id: Uuid) -> Option<RouteFrame> {
        if !self.is_connected(courier_id) {
            return None;
        }

        let frame = match self.build_frame(courier_id).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return None,
            Err(err) => {
                warn!(courier_id = %courier_id, error = %err, "route lookup failed");
                return None;
            }
        };

        self.broadcast(courier_id, &frame);
        Some(frame)
    }

    async fn build_frame(
        &self,
        courier_id: Uuid,
    ) -> Result<Option<RouteFrame>, crate::store::StoreError> {
        let Some(order) = self
            .store
            .active_order_for_courier(courier_id, &OrderStatus::ROUTED)
            .await?
        else {
            return Ok(None);
        };

        let Some(fix) = self.store.location(courier_id).await? else {
            return Ok(Some(RouteFrame::RouteError {
                order_id: order.id,
                error: "courier location unknown".to_string(),
                status_code: None,
            }));
        };

        let frame = match compute_route(
            self.directions.as_ref(),
            fix.location,
            order.pickup,
            order.dropoff,
        )
        .await
        {
            Ok(route) => RouteFrame::RouteUpdate {
                order_id: order.id,
                data: route,
            },
            Err(err) => {
                warn!(order_id = %order.id, error = %err, "route computation failed");
                RouteFrame::RouteError {
                    order_id: order.id,
                    error: err.to_string(),
                    status_code: err.status_code(),
                }
            }
        };
        Ok(Some(frame))
    }

    /// Sends to every socket of the courier; closed sockets are pruned and a
    /// full buffer drops the frame for that socket only.
    fn broadcast(&self, courier_id: Uuid, frame: &RouteFrame) {
        let json = match serde_json::to_string(frame) {
            Ok(json) => json,
            Err(err) => {
                warn!(error = %err, "failed to serialize route frame");
                return;
            }
        };

        let mut pruned = 0;
        if let Some(mut subscribers) = self.connections.get_mut(&courier_id) {
            subscribers.retain(|subscriber| match subscriber.tx.try_send(json.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(courier_id = %courier_id, "route socket lagging; frame dropped");
                    true
                }
                Err(TrySendError::Closed(_)) => {
                    pruned += 1;
                    false
                }
            });
        }
        self.connections
            .remove_if(&courier_id, |_, subscribers| subscribers.is_empty());

        if pruned > 0 {
            self.metrics.route_sockets_open.sub(pruned);
            debug!(courier_id = %courier_id, pruned, "pruned closed route sockets");
        }
        self.metrics
            .route_frames_total
            .with_label_values(&[frame.kind()])
            .inc();
    }

    /// Safety net for sparse GPS: one push per connected courier.
    pub async fn sweep(&self) -> usize {
        let couriers: Vec<Uuid> = self.connections.iter().map(|entry| *entry.key()).collect();

        let mut sent = 0;
        for courier_id in couriers {
            if self.push_for_courier(courier_id).await.is_some() {
                sent += 1;
            }
        }
        sent
    }
}
