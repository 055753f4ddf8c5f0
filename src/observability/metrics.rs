use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub refreshes_total: IntCounterVec,
    pub realtime_events_total: IntCounterVec,
    pub position_uploads_total: IntCounterVec,
    pub finalizations_total: IntCounterVec,
    pub active_orders: IntGauge,
    pub alerts_total: IntCounter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let refreshes_total = IntCounterVec::new(
            Opts::new("refreshes_total", "Order list refreshes by outcome"),
            &["outcome"],
        )
        .expect("valid refreshes_total metric");

        let realtime_events_total = IntCounterVec::new(
            Opts::new("realtime_events_total", "Realtime order events by kind and outcome"),
            &["kind", "outcome"],
        )
        .expect("valid realtime_events_total metric");

        let position_uploads_total = IntCounterVec::new(
            Opts::new("position_uploads_total", "Location samples by outcome"),
            &["outcome"],
        )
        .expect("valid position_uploads_total metric");

        let finalizations_total = IntCounterVec::new(
            Opts::new("finalizations_total", "Delivered/failed workflows by outcome"),
            &["kind", "outcome"],
        )
        .expect("valid finalizations_total metric");

        let active_orders = IntGauge::new("active_orders", "Orders currently in the active list")
            .expect("valid active_orders metric");

        let alerts_total = IntCounter::new("alerts_total", "En-route alerts raised")
            .expect("valid alerts_total metric");

        registry
            .register(Box::new(refreshes_total.clone()))
            .expect("register refreshes_total");
        registry
            .register(Box::new(realtime_events_total.clone()))
            .expect("register realtime_events_total");
        registry
            .register(Box::new(position_uploads_total.clone()))
            .expect("register position_uploads_total");
        registry
            .register(Box::new(finalizations_total.clone()))
            .expect("register finalizations_total");
        registry
            .register(Box::new(active_orders.clone()))
            .expect("register active_orders");
        registry
            .register(Box::new(alerts_total.clone()))
            .expect("register alerts_total");

        Self {
            registry,
            refreshes_total,
            realtime_events_total,
            position_uploads_total,
            finalizations_total,
            active_orders,
            alerts_total,
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
