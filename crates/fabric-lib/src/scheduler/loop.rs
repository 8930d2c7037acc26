//! Scheduler loop
//!
//! Owns the port statistics, the inferred flows and the congestion list, and
//! drives them from a single tokio task. Replies and switch registrations come
//! in from other tasks through the same shared state.

use super::congestion::{detect, Congestion};
use super::inference::{Flow, FlowInference};
use super::planner::{Remediation, RemediationPlanner};
use super::{
    CongestionView, FlowView, LoopState, PortView, SchedulerConfig, SchedulerSnapshot,
    SwitchPortsView,
};
use crate::error::{SchedulerError, SinkError, StoreError};
use crate::health::{components, HealthRegistry};
use crate::models::{HostAddr, PortCounters, DEFAULT_PRIORITY};
use crate::observability::{SchedulerMetrics, StructuredLogger};
use crate::sinks::{InMemorySliceStore, PlacementStore, RouteInstaller, SliceStore, StatsTransport};
use crate::stats::PortStatsStore;
use crate::switch::{FatTree, SwitchIdentity};
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Produces the ordering value of newly installed remediation routes. Only
/// the low 15 bits are used; see [`remediation_priority`].
pub type PrioritySource = Arc<dyn Fn() -> u16 + Send + Sync>;

/// Unix time truncated to 16 bits, so later routes usually win
fn unix_time_priority() -> u16 {
    (chrono::Utc::now().timestamp() & 0xFFFF) as u16
}

/// Remediation routes occupy the upper half of the priority space, above the
/// packet-in routes they override. `ordering` picks the slot inside the band.
pub fn remediation_priority(ordering: u16) -> u16 {
    DEFAULT_PRIORITY | (ordering & !DEFAULT_PRIORITY)
}

#[derive(Debug, Default)]
struct SchedulerState {
    ports: PortStatsStore,
    flows: Vec<Flow>,
    congestions: Vec<Congestion>,
    connected: BTreeSet<u16>,
    tick: u64,
}

/// Outcome of one scheduler cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub tick: u64,
    pub new_flows: usize,
    pub flows: usize,
    pub congestions: Vec<Congestion>,
    pub remediation: Option<Remediation>,
    pub stats_requests: usize,
}

/// Periodic flow scheduler
pub struct FlowScheduler {
    config: SchedulerConfig,
    transport: Arc<dyn StatsTransport>,
    installer: Arc<dyn RouteInstaller>,
    placements: Arc<dyn PlacementStore>,
    slices: Arc<dyn SliceStore>,
    health: HealthRegistry,
    metrics: SchedulerMetrics,
    logger: StructuredLogger,
    priority: PrioritySource,
    inference: FlowInference,
    planner: RemediationPlanner,
    lifecycle: AtomicU8,
    shared: Mutex<SchedulerState>,
    shutdown: broadcast::Sender<()>,
}

impl std::fmt::Debug for FlowScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowScheduler")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl FlowScheduler {
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::new()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn fabric(&self) -> FatTree {
        self.config.fabric
    }

    pub fn state(&self) -> LoopState {
        LoopState::from_u8(self.lifecycle.load(Ordering::SeqCst))
    }

    /// Record a datapath that completed its handshake. Only connected core
    /// switches are polled for statistics.
    pub async fn register_switch(&self, switch: SwitchIdentity) -> Result<(), SchedulerError> {
        if !self.config.fabric.contains(&switch) {
            return Err(SchedulerError::UnknownSwitch(u64::from(switch.dpid())));
        }

        let inserted = self.shared.lock().await.connected.insert(switch.dpid());
        if inserted {
            info!(switch = %switch.name(), dpid = switch.dpid(), "Switch registered");
        }
        Ok(())
    }

    /// Merge a port stats reply. Replies from switches outside the fabric and
    /// ports outside `1..=k` are ignored. Returns the number of ports merged.
    pub async fn on_port_stats_reply(&self, dpid: u16, counters: &[PortCounters]) -> usize {
        let switch = SwitchIdentity::decode(dpid);
        if !self.config.fabric.contains(&switch) {
            debug!(dpid = dpid, "Ignoring stats reply from unknown switch");
            return 0;
        }

        let k = u32::from(self.config.fabric.k());
        let mut merged = 0;
        {
            let mut state = self.shared.lock().await;
            for c in counters.iter().filter(|c| (1..=k).contains(&c.port_no)) {
                state.ports.update(dpid, c.port_no, c.tx_bytes, c.rx_bytes);
                merged += 1;
            }
        }

        self.metrics.inc_stats_replies();
        debug!(switch = %switch.name(), ports = merged, "Port stats merged");
        merged
    }

    /// Run one tick: inference, detection, remediation on every Nth tick,
    /// then stats requests to the connected core switches.
    ///
    /// A stopped scheduler does nothing. The only error is a closed stats
    /// transport.
    pub async fn run_cycle(&self) -> Result<CycleReport, SchedulerError> {
        if self.state() == LoopState::Stopped {
            return Ok(CycleReport::default());
        }

        let start = Instant::now();
        let fabric = self.config.fabric;

        let (mut report, new_flows, cores, polled) = {
            let mut guard = self.shared.lock().await;
            let state = &mut *guard;
            state.tick += 1;

            let before: HashSet<(u16, u8, u8)> = state
                .flows
                .iter()
                .map(|f| (f.switch, f.in_pod, f.out_pod))
                .collect();
            let added = self.inference.run(&mut state.flows, &state.ports);
            let new_flows: Vec<Flow> = state
                .flows
                .iter()
                .filter(|f| !before.contains(&(f.switch, f.in_pod, f.out_pod)))
                .cloned()
                .collect();

            state.congestions = detect(&fabric, &mut state.ports, &state.flows);

            let cores: Vec<SwitchIdentity> = state
                .ports
                .core_switches()
                .into_iter()
                .filter(|c| fabric.contains(c))
                .collect();
            let polled: Vec<u16> = state
                .connected
                .iter()
                .copied()
                .filter(|dpid| SwitchIdentity::decode(*dpid).is_core())
                .collect();

            self.metrics.set_pipeline_state(
                state.flows.len(),
                state.congestions.len(),
                state.ports.switches().count(),
            );

            let report = CycleReport {
                tick: state.tick,
                new_flows: added,
                flows: state.flows.len(),
                congestions: state.congestions.clone(),
                remediation: None,
                stats_requests: 0,
            };
            (report, new_flows, cores, polled)
        };

        for flow in &new_flows {
            self.logger.log_flow_inferred(
                &SwitchIdentity::decode(flow.switch).name(),
                flow.in_pod,
                flow.out_pod,
                flow.ttl,
            );
        }
        for c in &report.congestions {
            self.logger
                .log_congestion(&SwitchIdentity::decode(c.switch).name(), c.dst_pod, c.flow_count);
        }

        let every = self.config.remediation_every.max(1);
        if report.tick % every == 0 {
            report.remediation = self.remediate(&cores, &report.congestions).await;
        }

        if self.state() != LoopState::Stopped {
            for dpid in polled {
                match self.transport.request_port_stats(dpid).await {
                    Ok(()) => report.stats_requests += 1,
                    Err(SinkError::Closed) => return Err(SchedulerError::TransportClosed),
                    Err(e) => warn!(dpid = dpid, error = %e, "Port stats request failed"),
                }
            }
        }

        self.metrics
            .observe_cycle_latency(start.elapsed().as_secs_f64());
        Ok(report)
    }

    /// Plan and execute at most one remediation. Store failures abandon the
    /// pass; the next pass retries from fresh state.
    async fn remediate(
        &self,
        cores: &[SwitchIdentity],
        congestions: &[Congestion],
    ) -> Option<Remediation> {
        if congestions.is_empty() {
            debug!("No congested downlinks");
            return None;
        }

        let placements = match self.placements.read_all().await {
            Ok(table) => table,
            Err(e) => {
                self.placement_failed("read", &e).await;
                return None;
            }
        };

        let Some(plan) = self.planner.plan(cores, congestions, &placements) else {
            debug!(
                congestions = congestions.len(),
                "No remediation available for congested downlinks"
            );
            return None;
        };

        match &plan {
            Remediation::Reroute {
                service,
                destination,
                via,
                ..
            } => {
                let installed = self.install_path(*destination, via).await;
                self.metrics.inc_reroutes();
                self.logger
                    .log_reroute(service, *destination, &via.name(), installed);
            }
            Remediation::Migrate {
                service,
                from,
                to,
                via,
                ..
            } => {
                let mut updated = placements.clone();
                updated.insert(service.clone(), *to);
                if let Err(e) = self.placements.write_all(&updated).await {
                    self.placement_failed("write", &e).await;
                    return None;
                }
                self.health.set_healthy(components::PLACEMENT_STORE).await;

                let slice = match self.slices.relocate(*from, *to).await {
                    Ok(slice) => slice,
                    Err(e) => {
                        warn!(service = %service, error = %e, "Slice update failed, restoring placement");
                        self.metrics.inc_placement_errors();
                        if let Err(rollback) = self.placements.write_all(&placements).await {
                            error!(
                                service = %service,
                                error = %rollback,
                                "Placement rollback failed, service may be unreachable until the next pass"
                            );
                        }
                        self.health
                            .set_degraded(components::PLACEMENT_STORE, format!("slice update failed: {}", e))
                            .await;
                        return None;
                    }
                };

                self.logger
                    .log_migration(service, *from, *to, slice.as_deref());
                self.install_path(*to, via).await;
                self.metrics.inc_migrations();
            }
        }

        Some(plan)
    }

    /// Install the `/32` path towards `destination` through `via`. Failures
    /// are logged and counted; the next pass supersedes them.
    async fn install_path(&self, destination: HostAddr, via: &SwitchIdentity) -> usize {
        let rules = self.planner.path_rules(
            destination,
            via,
            self.config.route_idle_timeout_secs,
            remediation_priority((self.priority)()),
        );

        let mut installed = 0;
        for rule in &rules {
            match self.installer.install_route(rule).await {
                Ok(()) => installed += 1,
                Err(e) => {
                    warn!(
                        switch = %SwitchIdentity::decode(rule.switch).name(),
                        destination = %destination,
                        error = %e,
                        "Route install failed"
                    );
                    self.metrics.inc_route_install_errors();
                    self.health
                        .set_degraded(components::SOUTHBOUND, format!("route install failed: {}", e))
                        .await;
                }
            }
        }
        if installed == rules.len() {
            self.health.set_healthy(components::SOUTHBOUND).await;
        }
        installed
    }

    async fn placement_failed(&self, op: &str, e: &StoreError) {
        warn!(operation = op, error = %e, "Placement store failed, abandoning remediation pass");
        self.metrics.inc_placement_errors();
        self.health
            .set_degraded(components::PLACEMENT_STORE, format!("{} failed: {}", op, e))
            .await;
    }

    /// Spawn the loop task. Only a freshly built scheduler can be started.
    pub async fn start(self: &Arc<Self>) -> Result<SchedulerHandle, SchedulerError> {
        if let Err(current) = self.lifecycle.compare_exchange(
            LoopState::Created as u8,
            LoopState::Running as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            return Err(SchedulerError::InvalidState {
                action: "start",
                state: LoopState::from_u8(current),
            });
        }

        for name in [
            components::SCHEDULER,
            components::PLACEMENT_STORE,
            components::SOUTHBOUND,
        ] {
            self.health.register(name).await;
        }
        self.health.set_ready(true).await;

        let shutdown = self.shutdown.subscribe();
        let scheduler = Arc::clone(self);
        let task = tokio::spawn(async move { scheduler.run(shutdown).await });

        Ok(SchedulerHandle {
            scheduler: Arc::clone(self),
            task,
        })
    }

    async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> Result<(), SchedulerError> {
        info!(
            interval_secs = self.config.tick_interval.as_secs(),
            fat_tree_k = self.config.fabric.k(),
            "Starting flow scheduler loop"
        );

        let mut ticker = interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    info!("Shutting down flow scheduler loop");
                    break;
                }
                _ = ticker.tick() => {
                    if self.state() != LoopState::Running {
                        break;
                    }
                    if let Err(e) = self.run_cycle().await {
                        error!(error = %e, "Flow scheduler loop failed");
                        self.lifecycle.store(LoopState::Stopped as u8, Ordering::SeqCst);
                        self.health
                            .set_unhealthy(components::SOUTHBOUND, e.to_string())
                            .await;
                        self.health
                            .set_unhealthy(components::SCHEDULER, "loop terminated")
                            .await;
                        self.health.set_ready(false).await;
                        return Err(e);
                    }
                }
            }
        }

        Ok(())
    }

    /// Stop the loop. Idempotent; a never-started scheduler goes straight to
    /// `Stopped`.
    pub async fn stop(&self) {
        let previous = LoopState::from_u8(
            self.lifecycle
                .swap(LoopState::Stopped as u8, Ordering::SeqCst),
        );
        if previous == LoopState::Stopped {
            return;
        }

        // No receiver just means the loop was never started
        let _ = self.shutdown.send(());
        self.health.set_ready(false).await;
        info!(previous = %previous, "Flow scheduler stopped");
    }

    pub async fn snapshot(&self) -> SchedulerSnapshot {
        let state = self.shared.lock().await;

        let mut dpids: BTreeSet<u16> = state.ports.switches().collect();
        dpids.extend(state.connected.iter().copied());

        let switches = dpids
            .into_iter()
            .map(|dpid| SwitchPortsView {
                switch: SwitchIdentity::decode(dpid).name(),
                dpid,
                connected: state.connected.contains(&dpid),
                ports: state
                    .ports
                    .ports(dpid)
                    .map(|(port_no, s)| PortView {
                        port_no,
                        tx_bytes: s.tx_bytes,
                        rx_bytes: s.rx_bytes,
                        delta_tx: s.delta_tx,
                        delta_rx: s.delta_rx,
                        downlink_flow_count: s.downlink_flow_count,
                    })
                    .collect(),
            })
            .collect();

        SchedulerSnapshot {
            state: self.state(),
            tick: state.tick,
            fat_tree_k: self.config.fabric.k(),
            flows: state.flows.iter().map(FlowView::from).collect(),
            congestions: state.congestions.iter().map(CongestionView::from).collect(),
            switches,
        }
    }
}

/// Handle to a running scheduler task
#[derive(Debug)]
pub struct SchedulerHandle {
    scheduler: Arc<FlowScheduler>,
    task: JoinHandle<Result<(), SchedulerError>>,
}

impl SchedulerHandle {
    pub fn scheduler(&self) -> &Arc<FlowScheduler> {
        &self.scheduler
    }

    pub async fn stop(&self) {
        self.scheduler.stop().await;
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the loop task; a fatal loop error surfaces here
    pub async fn join(self) -> Result<(), SchedulerError> {
        self.task
            .await
            .map_err(|e| SchedulerError::Join(e.to_string()))?
    }
}

/// Builder for the flow scheduler
pub struct SchedulerBuilder {
    transport: Option<Arc<dyn StatsTransport>>,
    installer: Option<Arc<dyn RouteInstaller>>,
    placements: Option<Arc<dyn PlacementStore>>,
    slices: Option<Arc<dyn SliceStore>>,
    health: Option<HealthRegistry>,
    priority: Option<PrioritySource>,
    controller_name: String,
    config: SchedulerConfig,
}

impl SchedulerBuilder {
    pub fn new() -> Self {
        Self {
            transport: None,
            installer: None,
            placements: None,
            slices: None,
            health: None,
            priority: None,
            controller_name: "fabric-controller".to_string(),
            config: SchedulerConfig::default(),
        }
    }

    /// Set the port stats transport
    pub fn transport(mut self, transport: Arc<dyn StatsTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set the route installer
    pub fn installer(mut self, installer: Arc<dyn RouteInstaller>) -> Self {
        self.installer = Some(installer);
        self
    }

    pub fn placements(mut self, placements: Arc<dyn PlacementStore>) -> Self {
        self.placements = Some(placements);
        self
    }

    /// Set the slice store (default: empty in-memory store)
    pub fn slices(mut self, slices: Arc<dyn SliceStore>) -> Self {
        self.slices = Some(slices);
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Override the route priority source (default: truncated unix time)
    pub fn priority_source(mut self, priority: PrioritySource) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn controller_name(mut self, name: impl Into<String>) -> Self {
        self.controller_name = name.into();
        self
    }

    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn fabric(mut self, fabric: FatTree) -> Self {
        self.config.fabric = fabric;
        self
    }

    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.config.tick_interval = interval;
        self
    }

    pub fn congestion_threshold(mut self, bytes: u64) -> Self {
        self.config.congestion_threshold_bytes = bytes;
        self
    }

    pub fn remediation_every(mut self, ticks: u64) -> Self {
        self.config.remediation_every = ticks;
        self
    }

    pub fn flow_ttl(mut self, ttl: u32) -> Self {
        self.config.flow_ttl = ttl;
        self
    }

    pub fn route_idle_timeout(mut self, secs: u16) -> Self {
        self.config.route_idle_timeout_secs = secs;
        self
    }

    pub fn build(self) -> Result<FlowScheduler, SchedulerError> {
        let transport = self
            .transport
            .ok_or(SchedulerError::MissingComponent("stats transport"))?;
        let installer = self
            .installer
            .ok_or(SchedulerError::MissingComponent("route installer"))?;
        let placements = self
            .placements
            .ok_or(SchedulerError::MissingComponent("placement store"))?;
        let slices = self
            .slices
            .unwrap_or_else(|| Arc::new(InMemorySliceStore::default()) as Arc<dyn SliceStore>);

        let config = self.config;
        let (shutdown, _) = broadcast::channel(1);

        Ok(FlowScheduler {
            inference: FlowInference::new(
                config.fabric,
                config.congestion_threshold_bytes,
                config.flow_ttl,
            ),
            planner: RemediationPlanner::new(config.fabric),
            config,
            transport,
            installer,
            placements,
            slices,
            health: self.health.unwrap_or_default(),
            metrics: SchedulerMetrics::new(),
            logger: StructuredLogger::new(self.controller_name),
            priority: self
                .priority
                .unwrap_or_else(|| Arc::new(unix_time_priority) as PrioritySource),
            lifecycle: AtomicU8::new(LoopState::Created as u8),
            shared: Mutex::new(SchedulerState::default()),
            shutdown,
        })
    }
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
