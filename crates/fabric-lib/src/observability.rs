//! Observability for the flow scheduler
//!
//! Provides:
//! - Prometheus metrics (cycle latency, inferred flows, congestions, remediations)
//! - Structured event logging with tracing

use crate::models::HostAddr;
use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter,
    IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for a scheduler cycle (in seconds)
const CYCLE_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
];

/// Registered once per process; every handle shares it
static GLOBAL_METRICS: OnceLock<SchedulerMetricsInner> = OnceLock::new();

struct SchedulerMetricsInner {
    cycle_latency_seconds: Histogram,
    active_flows: IntGauge,
    active_congestions: IntGauge,
    known_switches: IntGauge,
    stats_replies: IntCounter,
    reroutes: IntCounter,
    migrations: IntCounter,
    route_install_errors: IntCounter,
    placement_errors: IntCounter,
}

impl SchedulerMetricsInner {
    fn new() -> Self {
        Self {
            cycle_latency_seconds: register_histogram!(
                "fabric_scheduler_cycle_latency_seconds",
                "Time spent in one inference/detection/remediation cycle",
                CYCLE_BUCKETS.to_vec()
            )
            .expect("Failed to register cycle_latency_seconds"),

            active_flows: register_int_gauge!(
                "fabric_scheduler_active_flows",
                "Flows currently inferred on core switches"
            )
            .expect("Failed to register active_flows"),

            active_congestions: register_int_gauge!(
                "fabric_scheduler_active_congestions",
                "Core downlinks currently carrying more than one flow"
            )
            .expect("Failed to register active_congestions"),

            known_switches: register_int_gauge!(
                "fabric_scheduler_known_switches",
                "Switches that have reported port statistics"
            )
            .expect("Failed to register known_switches"),

            stats_replies: register_int_counter!(
                "fabric_scheduler_stats_replies_total",
                "Port stats replies merged into the statistics store"
            )
            .expect("Failed to register stats_replies"),

            reroutes: register_int_counter!(
                "fabric_scheduler_reroutes_total",
                "Congestions remediated by an alternate core switch"
            )
            .expect("Failed to register reroutes"),

            migrations: register_int_counter!(
                "fabric_scheduler_migrations_total",
                "Services relocated to relieve a congested downlink"
            )
            .expect("Failed to register migrations"),

            route_install_errors: register_int_counter!(
                "fabric_scheduler_route_install_errors_total",
                "Route installs rejected by the southbound layer"
            )
            .expect("Failed to register route_install_errors"),

            placement_errors: register_int_counter!(
                "fabric_scheduler_placement_errors_total",
                "Remediation passes abandoned because of placement store errors"
            )
            .expect("Failed to register placement_errors"),
        }
    }
}

/// Lightweight handle to the process-wide scheduler metrics
#[derive(Clone)]
pub struct SchedulerMetrics {
    _private: (),
}

impl Default for SchedulerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SchedulerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerMetrics").finish_non_exhaustive()
    }
}

impl SchedulerMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(SchedulerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &SchedulerMetricsInner {
        GLOBAL_METRICS.get_or_init(SchedulerMetricsInner::new)
    }

    pub fn observe_cycle_latency(&self, duration_secs: f64) {
        self.inner().cycle_latency_seconds.observe(duration_secs);
    }

    pub fn set_pipeline_state(&self, flows: usize, congestions: usize, switches: usize) {
        let inner = self.inner();
        inner.active_flows.set(flows as i64);
        inner.active_congestions.set(congestions as i64);
        inner.known_switches.set(switches as i64);
    }

    pub fn inc_stats_replies(&self) {
        self.inner().stats_replies.inc();
    }

    pub fn inc_reroutes(&self) {
        self.inner().reroutes.inc();
    }

    pub fn inc_migrations(&self) {
        self.inner().migrations.inc();
    }

    pub fn inc_route_install_errors(&self) {
        self.inner().route_install_errors.inc();
    }

    pub fn inc_placement_errors(&self) {
        self.inner().placement_errors.inc();
    }
}

/// Structured logger for scheduler events
///
/// Every significant control-plane decision is logged as one event with a
/// stable `event` field so logs can be filtered per action.
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    controller: String,
}

impl StructuredLogger {
    pub fn new(controller: impl Into<String>) -> Self {
        Self {
            controller: controller.into(),
        }
    }

    pub fn log_flow_inferred(&self, switch: &str, in_pod: u8, out_pod: u8, ttl: u32) {
        info!(
            event = "flow_inferred",
            controller = %self.controller,
            switch = %switch,
            in_pod = in_pod,
            out_pod = out_pod,
            ttl = ttl,
            "Inferred flow on core switch"
        );
    }

    pub fn log_congestion(&self, switch: &str, dst_pod: u8, flow_count: u32) {
        warn!(
            event = "congestion_detected",
            controller = %self.controller,
            switch = %switch,
            dst_pod = dst_pod,
            flow_count = flow_count,
            "Congested downlink detected"
        );
    }

    pub fn log_reroute(&self, service: &str, destination: HostAddr, via: &str, rules: usize) {
        info!(
            event = "path_rerouted",
            controller = %self.controller,
            service = %service,
            destination = %destination,
            via = %via,
            rules = rules,
            "Rerouted service through alternate core switch"
        );
    }

    pub fn log_migration(
        &self,
        service: &str,
        from: HostAddr,
        to: HostAddr,
        slice: Option<&str>,
    ) {
        info!(
            event = "service_migrated",
            controller = %self.controller,
            service = %service,
            from = %from,
            to = %to,
            slice = ?slice,
            "Relocated service to relieve congestion"
        );
    }

    pub fn log_startup(&self, version: &str, k: u8) {
        info!(
            event = "controller_started",
            controller = %self.controller,
            version = %version,
            fat_tree_k = k,
            "Fabric controller started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "controller_shutdown",
            controller = %self.controller,
            reason = %reason,
            "Fabric controller shutting down"
        );
    }
}
