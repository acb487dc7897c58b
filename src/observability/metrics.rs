use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub orders_created_total: IntCounter,
    pub orders_in_queue: IntGauge,
    pub dispatch_tick_seconds: HistogramVec,
    pub offer_decisions_total: IntCounterVec,
    pub pool_pushes_total: IntCounter,
    pub route_frames_total: IntCounterVec,
    pub route_sockets_open: IntGauge,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let orders_created_total =
            IntCounter::new("orders_created_total", "Orders accepted from restaurants")
                .expect("valid orders_created_total metric");

        let orders_in_queue = IntGauge::new(
            "orders_in_queue",
            "New orders waiting for their first dispatch",
        )
        .expect("valid orders_in_queue metric");

        let dispatch_tick_seconds = HistogramVec::new(
            HistogramOpts::new(
                "dispatch_tick_seconds",
                "Latency of one offer engine tick in seconds",
            ),
            &["outcome"],
        )
        .expect("valid dispatch_tick_seconds metric");

        let offer_decisions_total = IntCounterVec::new(
            Opts::new(
                "offer_decisions_total",
                "Courier accept/reject calls by outcome",
            ),
            &["action", "outcome"],
        )
        .expect("valid offer_decisions_total metric");

        let pool_pushes_total = IntCounter::new("pool_pushes_total", "Orders pushed to the pool")
            .expect("valid pool_pushes_total metric");

        let route_frames_total = IntCounterVec::new(
            Opts::new("route_frames_total", "Route frames sent by kind"),
            &["kind"],
        )
        .expect("valid route_frames_total metric");

        let route_sockets_open =
            IntGauge::new("route_sockets_open", "Currently open courier route sockets")
                .expect("valid route_sockets_open metric");

        registry
            .register(Box::new(orders_created_total.clone()))
            .expect("register orders_created_total");
        registry
            .register(Box::new(orders_in_queue.clone()))
            .expect("register orders_in_queue");
        registry
            .register(Box::new(dispatch_tick_seconds.clone()))
            .expect("register dispatch_tick_seconds");
        registry
            .register(Box::new(offer_decisions_total.clone()))
            .expect("register offer_decisions_total");
        registry
            .register(Box::new(pool_pushes_total.clone()))
            .expect("register pool_pushes_total");
        registry
            .register(Box::new(route_frames_total.clone()))
            .expect("register route_frames_total");
        registry
            .register(Box::new(route_sockets_open.clone()))
            .expect("register route_sockets_open");

        Self {
            registry,
            orders_created_total,
            orders_in_queue,
            dispatch_tick_seconds,
            offer_decisions_total,
            pool_pushes_total,
            route_frames_total,
            route_sockets_open,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}
