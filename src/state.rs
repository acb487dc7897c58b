use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::auth::JwtKeys;
use crate::config::DispatchSettings;
use crate::engine::eligibility::EligibilityResolver;
use crate::engine::offer::OfferEngine;
use crate::engine::orders::OrderService;
use crate::engine::pool::PoolService;
use crate::engine::presence::PresenceFeed;
use crate::engine::watcher::WatcherService;
use crate::observability::metrics::Metrics;
use crate::realtime::RoutePusher;
use crate::routing::DirectionsProvider;
use crate::store::DispatchStore;

pub struct AppState {
    pub store: Arc<dyn DispatchStore>,
    pub orders: OrderService,
    pub presence: PresenceFeed,
    pub pool: PoolService,
    pub offers: OfferEngine,
    pub routes: RoutePusher,
    pub jwt: JwtKeys,
    pub order_tx: mpsc::Sender<Uuid>,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(
        store: Arc<dyn DispatchStore>,
        directions: Arc<dyn DirectionsProvider>,
        jwt: JwtKeys,
        dispatch: DispatchSettings,
        order_queue_size: usize,
    ) -> (Self, mpsc::Receiver<Uuid>) {
        let (order_tx, order_rx) = mpsc::channel(order_queue_size);
        let metrics = Metrics::new();

        let routes = RoutePusher::new(store.clone(), directions, metrics.clone());
        let orders = OrderService::new(store.clone(), metrics.clone());
        let pool = PoolService::new(store.clone(), metrics.clone());
        let watchers = WatcherService::new(
            store.clone(),
            EligibilityResolver::new(store.clone(), dispatch),
        );
        let offers = OfferEngine::new(
            store.clone(),
            orders.clone(),
            watchers,
            pool.clone(),
            routes.clone(),
            metrics.clone(),
        );

        (
            Self {
                presence: PresenceFeed::new(store.clone(), routes.clone()),
                store,
                orders,
                pool,
                offers,
                routes,
                jwt,
                order_tx,
                metrics,
            },
            order_rx,
        )
    }
}
