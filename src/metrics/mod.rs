//! Prometheus metrics for the HTTP surface and the evaluation pipeline

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

pub struct Metrics {
    registry: Registry,
    pub http_requests_total: IntCounter,
    pub http_requests_in_flight: IntGauge,
    pub http_request_duration_seconds: Histogram,
    pub evaluations_total: IntCounter,
    pub evaluation_duration_seconds: Histogram,
    pub evaluation_faults_total: IntCounter,
    pub transitions_total: IntCounterVec,
    pub coalesced_snapshots_total: IntCounter,
    pub discarded_evaluations_total: IntCounter,
    pub publish_failures_total: IntCounter,
    pub instances_active: IntGauge,
    pub push_clients_connected: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let http_requests_total =
            IntCounter::new("http_requests_total", "Total HTTP requests handled")?;
        let http_requests_in_flight =
            IntGauge::new("http_requests_in_flight", "HTTP requests currently in flight")?;
        let http_request_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "http_request_duration_seconds",
            "HTTP request latency in seconds",
        ))?;
        let evaluations_total = IntCounter::new(
            "evaluations_total",
            "Instance evaluations applied to a snapshot",
        )?;
        let evaluation_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "evaluation_duration_seconds",
                "Time spent evaluating one instance against one snapshot",
            )
            .buckets(vec![0.00001, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05]),
        )?;
        let evaluation_faults_total = IntCounter::new(
            "evaluation_faults_total",
            "Evaluations that forced an instance into ERROR",
        )?;
        let transitions_total = IntCounterVec::new(
            Opts::new("transitions_total", "State transitions by trigger"),
            &["trigger"],
        )?;
        let coalesced_snapshots_total = IntCounter::new(
            "coalesced_snapshots_total",
            "Pending snapshots replaced by a newer one before evaluation",
        )?;
        let discarded_evaluations_total = IntCounter::new(
            "discarded_evaluations_total",
            "Evaluations dropped because the instance was removed",
        )?;
        let publish_failures_total =
            IntCounter::new("publish_failures_total", "Events that could not be published")?;
        let instances_active = IntGauge::new("instances_active", "Registered strategy instances")?;
        let push_clients_connected =
            IntGauge::new("push_clients_connected", "Connected push channel clients")?;

        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(http_requests_in_flight.clone()))?;
        registry.register(Box::new(http_request_duration_seconds.clone()))?;
        registry.register(Box::new(evaluations_total.clone()))?;
        registry.register(Box::new(evaluation_duration_seconds.clone()))?;
        registry.register(Box::new(evaluation_faults_total.clone()))?;
        registry.register(Box::new(transitions_total.clone()))?;
        registry.register(Box::new(coalesced_snapshots_total.clone()))?;
        registry.register(Box::new(discarded_evaluations_total.clone()))?;
        registry.register(Box::new(publish_failures_total.clone()))?;
        registry.register(Box::new(instances_active.clone()))?;
        registry.register(Box::new(push_clients_connected.clone()))?;

        Ok(Self {
            registry,
            http_requests_total,
            http_requests_in_flight,
            http_request_duration_seconds,
            evaluations_total,
            evaluation_duration_seconds,
            evaluation_faults_total,
            transitions_total,
            coalesced_snapshots_total,
            discarded_evaluations_total,
            publish_failures_total,
            instances_active,
            push_clients_connected,
        })
    }

    /// Render every registered metric in the Prometheus text format.
    pub fn export(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
