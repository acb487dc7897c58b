use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::engine::offer::{OfferEngine, TickOutcome};

/// Periodically re-resolves every open watcher so presence changes reach
/// running offers. Do not await the returned handle; it runs forever.
pub fn start_dispatch_sweeper(engine: OfferEngine, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(every);
        info!(interval_secs = every.as_secs(), "dispatch sweeper started");
        loop {
            timer.tick().await;
            let (checked, pooled) = sweep_once(&engine).await;
            if pooled > 0 {
                info!(checked, pooled, "dispatch sweep moved orders to pool");
            } else {
                debug!(checked, "dispatch sweep finished");
            }
        }
    })
}

/// Returns how many watchers were visited and how many of them ended pooled.
pub async fn sweep_once(engine: &OfferEngine) -> (usize, usize) {
    let watchers = match engine.open_watcher_ids().await {
        Ok(ids) => ids,
        Err(err) => {
            error!(error = %err, "dispatch sweep could not list watchers");
            return (0, 0);
        }
    };

    let mut pooled = 0;
    for order_id in &watchers {
        match engine.refresh(*order_id).await {
            Ok(TickOutcome::Pooled) => pooled += 1,
            Ok(_) => {}
            Err(err) => warn!(order_id = %order_id, error = %err, "dispatch sweep tick failed"),
        }
    }
    (watchers.len(), pooled)
}
