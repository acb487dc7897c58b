pub mod route_pusher;

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

pub use route_pusher::{RouteFrame, RoutePusher, RouteSubscription};

/// Re-pushes routes to every open courier socket on a fixed period. Do not
/// await the returned handle; it runs forever.
pub fn start_route_sweeper(routes: RoutePusher, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(every);
        info!(interval_secs = every.as_secs(), "route sweeper started");
        loop {
            timer.tick().await;
            let sent = routes.sweep().await;
            debug!(sent, sockets = routes.connection_count(), "route sweep finished");
        }
    })
}
