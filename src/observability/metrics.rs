use prometheus::{
    Encoder, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub offers_sent_total: IntCounterVec,
    pub dispatch_outcomes_total: IntCounterVec,
    pub offer_send_seconds: HistogramVec,
    pub active_offers: IntGauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let offers_sent_total = IntCounterVec::new(
            Opts::new("offers_sent_total", "Offers emitted to vendors by outcome"),
            &["outcome"],
        )
        .expect("valid offers_sent_total metric");

        let dispatch_outcomes_total = IntCounterVec::new(
            Opts::new(
                "dispatch_outcomes_total",
                "Terminal pickup outcomes by kind",
            ),
            &["outcome"],
        )
        .expect("valid dispatch_outcomes_total metric");

        let offer_send_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "offer_send_seconds",
                "Latency of the offer HTTP exchange in seconds",
            ),
            &["outcome"],
        )
        .expect("valid offer_send_seconds metric");

        let active_offers = IntGauge::new(
            "active_offers",
            "Offers currently outstanding with an armed timer",
        )
        .expect("valid active_offers metric");

        registry
            .register(Box::new(offers_sent_total.clone()))
            .expect("register offers_sent_total");
        registry
            .register(Box::new(dispatch_outcomes_total.clone()))
            .expect("register dispatch_outcomes_total");
        registry
            .register(Box::new(offer_send_seconds.clone()))
            .expect("register offer_send_seconds");
        registry
            .register(Box::new(active_offers.clone()))
            .expect("register active_offers");

        Self {
            registry,
            offers_sent_total,
            dispatch_outcomes_total,
            offer_send_seconds,
            active_offers,
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

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
