use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub store_commands_total: IntCounterVec,
    pub store_command_latency_seconds: HistogramVec,
    pub telemetry_datagrams_total: IntCounterVec,
    pub hub_connections: IntGauge,
    pub hub_evictions_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let store_commands_total = IntCounterVec::new(
            Opts::new("store_commands_total", "Store commands by command and outcome"),
            &["command", "outcome"],
        )
        .expect("valid store_commands_total metric");

        let store_command_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "store_command_latency_seconds",
                "Store command round trip latency in seconds",
            )
            .buckets(vec![0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 1.0]),
            &["command"],
        )
        .expect("valid store_command_latency_seconds metric");

        let telemetry_datagrams_total = IntCounterVec::new(
            Opts::new("telemetry_datagrams_total", "Telemetry datagrams by outcome"),
            &["outcome"],
        )
        .expect("valid telemetry_datagrams_total metric");

        let hub_connections =
            IntGauge::new("hub_connections", "Viewer connections currently registered")
                .expect("valid hub_connections metric");

        let hub_evictions_total = IntCounterVec::new(
            Opts::new("hub_evictions_total", "Viewer connections evicted by reason"),
            &["reason"],
        )
        .expect("valid hub_evictions_total metric");

        registry
            .register(Box::new(store_commands_total.clone()))
            .expect("register store_commands_total");
        registry
            .register(Box::new(store_command_latency_seconds.clone()))
            .expect("register store_command_latency_seconds");
        registry
            .register(Box::new(telemetry_datagrams_total.clone()))
            .expect("register telemetry_datagrams_total");
        registry
            .register(Box::new(hub_connections.clone()))
            .expect("register hub_connections");
        registry
            .register(Box::new(hub_evictions_total.clone()))
            .expect("register hub_evictions_total");

        Self {
            registry,
            store_commands_total,
            store_command_latency_seconds,
            telemetry_datagrams_total,
            hub_connections,
            hub_evictions_total,
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
