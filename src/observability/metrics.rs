use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub offers_total: IntCounterVec,
    pub dispatch_passes_total: IntCounterVec,
    pub active_dispatches: IntGauge,
    pub time_to_assignment_seconds: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let offers_total = IntCounterVec::new(
            Opts::new("offers_total", "Driver offers by outcome"),
            &["outcome"],
        )
        .expect("valid offers_total metric");

        let dispatch_passes_total = IntCounterVec::new(
            Opts::new("dispatch_passes_total", "Dispatch search passes by outcome"),
            &["outcome"],
        )
        .expect("valid dispatch_passes_total metric");

        let active_dispatches = IntGauge::new(
            "active_dispatches",
            "Orders with a running driver search",
        )
        .expect("valid active_dispatches metric");

        let time_to_assignment_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "time_to_assignment_seconds",
                "Time from order placement to an accepted offer",
            )
            .buckets(vec![5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 900.0]),
        )
        .expect("valid time_to_assignment_seconds metric");

        registry
            .register(Box::new(offers_total.clone()))
            .expect("register offers_total");
        registry
            .register(Box::new(dispatch_passes_total.clone()))
            .expect("register dispatch_passes_total");
        registry
            .register(Box::new(active_dispatches.clone()))
            .expect("register active_dispatches");
        registry
            .register(Box::new(time_to_assignment_seconds.clone()))
            .expect("register time_to_assignment_seconds");

        Self {
            registry,
            offers_total,
            dispatch_passes_total,
            active_dispatches,
            time_to_assignment_seconds,
        }
    }

    pub fn offer(&self, outcome: &str) {
        self.offers_total.with_label_values(&[outcome]).inc();
    }

    pub fn pass(&self, outcome: &str) {
        self.dispatch_passes_total.with_label_values(&[outcome]).inc();
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
