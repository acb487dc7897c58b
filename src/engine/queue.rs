use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

/// Hands a freshly created order to the offer task.
pub async fn enqueue_order(state: &AppState, order_id: Uuid) -> Result<(), AppError> {
    state
        .order_tx
        .send(order_id)
        .await
        .map_err(|err| AppError::Internal(format!("order queue send failed: {err}")))?;

    state.metrics.orders_in_queue.inc();
    Ok(())
}

/// Consumes the new-order queue: watcher creation followed by the first tick.
pub async fn run_offer_engine(state: Arc<AppState>, mut order_rx: mpsc::Receiver<Uuid>) {
    info!("offer engine started");

    while let Some(order_id) = order_rx.recv().await {
        state.metrics.orders_in_queue.dec();

        match state.offers.open(order_id).await {
            Ok(outcome) => {
                info!(order_id = %order_id, outcome = ?outcome, "order dispatched");
            }
            Err(err) => {
                error!(order_id = %order_id, error = %err, "failed to dispatch order");
            }
        }
    }

    warn!("offer engine stopped: queue channel closed");
}
