//! Scenario tests for the scheduler pipeline with mock sinks

use super::*;
use crate::error::{SchedulerError, SinkError, StoreError};
use crate::health::{components, ComponentStatus, HealthRegistry};
use crate::controller::FabricController;
use crate::models::{
    HostAddr, OutPort, PlacementTable, PortCounters, RouteRule, SliceId, SliceTable,
    DEFAULT_PRIORITY, PACKET_IN_PRIORITY,
};
use crate::sinks::{
    InMemoryPlacementStore, InMemorySliceStore, PlacementStore, RouteInstaller, RouteTable,
    SliceStore, StatsTransport,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const C11: u16 = 0x8101;
const C12: u16 = 0x8102;
const P0_S0: u16 = 0x4000;
const P0_S1: u16 = 0x4001;

/// Records stats requests; can simulate a vanished adapter
#[derive(Default)]
struct MockTransport {
    requests: Mutex<Vec<u16>>,
    closed: AtomicBool,
}

#[async_trait]
impl StatsTransport for MockTransport {
    async fn request_port_stats(&self, dpid: u16) -> Result<(), SinkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SinkError::Closed);
        }
        self.requests.lock().await.push(dpid);
        Ok(())
    }
}

struct FailingPlacementStore;

#[async_trait]
impl PlacementStore for FailingPlacementStore {
    async fn read_all(&self) -> Result<PlacementTable, StoreError> {
        Err(StoreError::Unavailable("disk gone".to_string()))
    }

    async fn write_all(&self, _table: &PlacementTable) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("disk gone".to_string()))
    }
}

/// Reads from a fixed table, never persists
struct ReadOnlyPlacementStore {
    table: PlacementTable,
}

#[async_trait]
impl PlacementStore for ReadOnlyPlacementStore {
    async fn read_all(&self) -> Result<PlacementTable, StoreError> {
        Ok(self.table.clone())
    }

    async fn write_all(&self, _table: &PlacementTable) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("read-only volume".to_string()))
    }
}

/// Slice table whose membership changes always fail
struct FrozenSliceStore {
    inner: InMemorySliceStore,
}

#[async_trait]
impl SliceStore for FrozenSliceStore {
    async fn read_all(&self) -> Result<SliceTable, StoreError> {
        self.inner.read_all().await
    }

    async fn slice_of(&self, addr: HostAddr) -> Result<Option<SliceId>, StoreError> {
        self.inner.slice_of(addr).await
    }

    async fn assign(&self, _addr: HostAddr, _slice: &str) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("slice table locked".to_string()))
    }

    async fn remove(&self, _addr: HostAddr) -> Result<Option<SliceId>, StoreError> {
        Err(StoreError::Unavailable("slice table locked".to_string()))
    }
}

/// Route installer that can be switched into failing
#[derive(Default)]
struct FlakyInstaller {
    routes: RouteTable,
    failing: AtomicBool,
}

#[async_trait]
impl RouteInstaller for FlakyInstaller {
    async fn install_route(&self, rule: &RouteRule) -> Result<(), SinkError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SinkError::Rejected {
                dpid: rule.switch,
                reason: "table full".to_string(),
            });
        }
        self.routes.install_route(rule).await
    }
}

struct Harness {
    scheduler: Arc<FlowScheduler>,
    transport: Arc<MockTransport>,
    routes: Arc<RouteTable>,
    placements: Arc<InMemoryPlacementStore>,
    slices: Arc<InMemorySliceStore>,
    health: HealthRegistry,
}

fn addr(s: &str) -> HostAddr {
    s.parse().unwrap()
}

fn harness(remediation_every: u64, placements: &[(&str, &str)], slices: SliceTable) -> Harness {
    harness_with_priority(remediation_every, placements, slices, Arc::new(|| 42u16))
}

fn harness_with_priority(
    remediation_every: u64,
    placements: &[(&str, &str)],
    slices: SliceTable,
    priority: PrioritySource,
) -> Harness {
    let transport = Arc::new(MockTransport::default());
    let routes = Arc::new(RouteTable::new());
    let placements = Arc::new(InMemoryPlacementStore::new(
        placements
            .iter()
            .map(|(s, a)| (s.to_string(), addr(a)))
            .collect(),
    ));
    let slices = Arc::new(InMemorySliceStore::new(slices));
    let health = HealthRegistry::new();

    let scheduler = FlowScheduler::builder()
        .transport(transport.clone())
        .installer(routes.clone())
        .placements(placements.clone())
        .slices(slices.clone())
        .health(health.clone())
        .priority_source(priority)
        .remediation_every(remediation_every)
        .tick_interval(Duration::from_millis(10))
        .build()
        .unwrap();

    Harness {
        scheduler: Arc::new(scheduler),
        transport,
        routes,
        placements,
        slices,
        health,
    }
}

/// Two flows from pods 0 and 1 leave `core` towards pod 2
async fn two_flows_to_pod_2(scheduler: &FlowScheduler, core: u16) {
    let counters = [
        PortCounters::new(1, 0, 5_000),
        PortCounters::new(2, 0, 5_000),
        PortCounters::new(3, 10_000, 0),
        PortCounters::new(4, 0, 0),
    ];
    assert_eq!(scheduler.on_port_stats_reply(core, &counters).await, 4);
}

async fn idle_core(scheduler: &FlowScheduler, core: u16) {
    let counters: Vec<PortCounters> = (1..=4).map(|p| PortCounters::new(p, 0, 0)).collect();
    scheduler.on_port_stats_reply(core, &counters).await;
}

#[tokio::test]
async fn test_congestion_is_rerouted_through_free_core() {
    let h = harness(1, &[("web", "10.2.0.2")], SliceTable::new());
    for dpid in [C11, C12, P0_S0] {
        h.scheduler
            .register_switch(crate::switch::SwitchIdentity::decode(dpid))
            .await
            .unwrap();
    }
    two_flows_to_pod_2(&h.scheduler, C11).await;
    idle_core(&h.scheduler, C12).await;

    let report = h.scheduler.run_cycle().await.unwrap();

    assert_eq!(report.flows, 2);
    assert_eq!(
        report.congestions,
        vec![Congestion {
            switch: C11,
            dst_pod: 2,
            flow_count: 2
        }]
    );
    match report.remediation {
        Some(Remediation::Reroute {
            ref service,
            destination,
            via,
            ..
        }) => {
            assert_eq!(service, "web");
            assert_eq!(destination, addr("10.2.0.2"));
            assert_eq!(via.dpid(), C12);
        }
        other => panic!("expected reroute, got {:?}", other),
    }

    // No placement change on a reroute
    assert_eq!(
        h.placements.read_all().await.unwrap()["web"],
        addr("10.2.0.2")
    );

    let rules = h.routes.list();
    assert_eq!(rules.len(), 12);
    for rule in &rules {
        let switch = crate::switch::SwitchIdentity::decode(rule.switch);
        assert_ne!(switch.pod(), Some(2));
        assert_eq!(rule.destination, addr("10.2.0.2").ipv4());
        assert_eq!(rule.priority, remediation_priority(42));
        assert_eq!(rule.idle_timeout_secs, 30);
        let expected = if switch.is_edge() { 3 } else { 4 };
        assert_eq!(rule.out_port, OutPort::Physical(expected));
    }

    // Only connected core switches are polled
    assert_eq!(report.stats_requests, 2);
    assert_eq!(*h.transport.requests.lock().await, vec![C11, C12]);
}

#[tokio::test]
async fn test_migration_when_every_core_is_congested() {
    let mut slices = SliceTable::new();
    slices.insert(
        "blue".to_string(),
        [addr("10.2.0.2"), addr("10.1.0.2")].into_iter().collect(),
    );
    let h = harness(1, &[("web", "10.2.0.2")], slices);
    two_flows_to_pod_2(&h.scheduler, C11).await;
    two_flows_to_pod_2(&h.scheduler, C12).await;

    let report = h.scheduler.run_cycle().await.unwrap();
    assert_eq!(report.congestions.len(), 2);

    let remediation = report.remediation.unwrap();
    assert!(matches!(remediation, Remediation::Migrate { .. }));
    assert_eq!(remediation.destination(), addr("10.0.0.2"));
    assert_eq!(remediation.via().dpid(), C11);

    assert_eq!(
        h.placements.read_all().await.unwrap()["web"],
        addr("10.0.0.2")
    );
    assert_eq!(
        h.slices.slice_of(addr("10.0.0.2")).await.unwrap().as_deref(),
        Some("blue")
    );
    assert_eq!(h.slices.slice_of(addr("10.2.0.2")).await.unwrap(), None);

    let rules = h.routes.list();
    assert_eq!(rules.len(), 12);
    assert!(rules.iter().all(|r| r.destination == addr("10.0.0.2").ipv4()));
    // c11 is column 1, row 1: every uplink is port k/2 + 1
    assert!(rules.iter().all(|r| r.out_port == OutPort::Physical(3)));
}

#[tokio::test]
async fn test_no_service_in_congested_pod() {
    let h = harness(1, &[("web", "10.1.0.2")], SliceTable::new());
    two_flows_to_pod_2(&h.scheduler, C11).await;
    idle_core(&h.scheduler, C12).await;

    let report = h.scheduler.run_cycle().await.unwrap();
    assert_eq!(report.congestions.len(), 1);
    assert!(report.remediation.is_none());
    assert!(h.routes.is_empty());
}

#[tokio::test]
async fn test_remediation_runs_every_nth_tick() {
    let h = harness(4, &[("web", "10.2.0.2")], SliceTable::new());
    two_flows_to_pod_2(&h.scheduler, C11).await;
    idle_core(&h.scheduler, C12).await;

    for tick in 1..=3 {
        let report = h.scheduler.run_cycle().await.unwrap();
        assert_eq!(report.tick, tick);
        assert_eq!(report.congestions.len(), 1, "deltas persist until the next reply");
        assert!(report.remediation.is_none());
    }
    assert!(h.routes.is_empty());

    let report = h.scheduler.run_cycle().await.unwrap();
    assert_eq!(report.tick, 4);
    assert!(report.remediation.is_some());
    assert_eq!(h.routes.len(), 12);
}

#[tokio::test]
async fn test_repeated_remediation_is_idempotent() {
    let h = harness(1, &[("web", "10.2.0.2")], SliceTable::new());
    two_flows_to_pod_2(&h.scheduler, C11).await;
    idle_core(&h.scheduler, C12).await;

    h.scheduler.run_cycle().await.unwrap();
    let first = h.routes.list();
    h.scheduler.run_cycle().await.unwrap();

    assert_eq!(h.routes.list(), first);
}

#[tokio::test]
async fn test_flows_expire_when_traffic_stops() {
    let h = harness(100, &[], SliceTable::new());
    two_flows_to_pod_2(&h.scheduler, C11).await;

    assert_eq!(h.scheduler.run_cycle().await.unwrap().flows, 2);

    // Same cumulative counters again: every delta drops to zero
    two_flows_to_pod_2(&h.scheduler, C11).await;
    let report = h.scheduler.run_cycle().await.unwrap();
    assert_eq!(report.flows, 0);
    assert!(report.congestions.is_empty());
}

#[tokio::test]
async fn test_placement_failure_abandons_pass() {
    let transport = Arc::new(MockTransport::default());
    let routes = Arc::new(RouteTable::new());
    let health = HealthRegistry::new();
    let scheduler = FlowScheduler::builder()
        .transport(transport)
        .installer(routes.clone())
        .placements(Arc::new(FailingPlacementStore))
        .health(health.clone())
        .remediation_every(1)
        .build()
        .unwrap();

    two_flows_to_pod_2(&scheduler, C11).await;
    idle_core(&scheduler, C12).await;

    let report = scheduler.run_cycle().await.unwrap();
    assert_eq!(report.congestions.len(), 1);
    assert!(report.remediation.is_none());
    assert!(routes.is_empty());

    let status = health.health().await;
    assert_eq!(
        status.components[components::PLACEMENT_STORE].status,
        ComponentStatus::Degraded
    );
}

fn blue_pair() -> SliceTable {
    let mut slices = SliceTable::new();
    slices.insert(
        "blue".to_string(),
        [addr("10.2.0.2"), addr("10.1.0.2")].into_iter().collect(),
    );
    slices
}

#[tokio::test]
async fn test_migration_write_failure_leaves_everything_in_place() {
    let routes = Arc::new(RouteTable::new());
    let slices = Arc::new(InMemorySliceStore::new(blue_pair()));
    let health = HealthRegistry::new();
    let scheduler = FlowScheduler::builder()
        .transport(Arc::new(MockTransport::default()))
        .installer(routes.clone())
        .placements(Arc::new(ReadOnlyPlacementStore {
            table: [("web".to_string(), addr("10.2.0.2"))].into_iter().collect(),
        }))
        .slices(slices.clone())
        .health(health.clone())
        .remediation_every(1)
        .build()
        .unwrap();

    two_flows_to_pod_2(&scheduler, C11).await;
    two_flows_to_pod_2(&scheduler, C12).await;

    let report = scheduler.run_cycle().await.unwrap();
    assert_eq!(report.congestions.len(), 2);
    assert!(report.remediation.is_none());
    assert!(routes.is_empty());
    assert_eq!(
        slices.slice_of(addr("10.2.0.2")).await.unwrap().as_deref(),
        Some("blue")
    );
    assert_eq!(slices.slice_of(addr("10.0.0.2")).await.unwrap(), None);

    let status = health.health().await;
    assert_eq!(
        status.components[components::PLACEMENT_STORE].status,
        ComponentStatus::Degraded
    );
}

#[tokio::test]
async fn test_migration_slice_failure_restores_placement() {
    let routes = Arc::new(RouteTable::new());
    let placements = Arc::new(InMemoryPlacementStore::new(
        [("web".to_string(), addr("10.2.0.2"))].into_iter().collect(),
    ));
    let health = HealthRegistry::new();
    let scheduler = FlowScheduler::builder()
        .transport(Arc::new(MockTransport::default()))
        .installer(routes.clone())
        .placements(placements.clone())
        .slices(Arc::new(FrozenSliceStore {
            inner: InMemorySliceStore::new(blue_pair()),
        }))
        .health(health.clone())
        .remediation_every(1)
        .build()
        .unwrap();

    two_flows_to_pod_2(&scheduler, C11).await;
    two_flows_to_pod_2(&scheduler, C12).await;

    let report = scheduler.run_cycle().await.unwrap();
    assert!(report.remediation.is_none());
    assert!(routes.is_empty());
    assert_eq!(
        placements.read_all().await.unwrap()["web"],
        addr("10.2.0.2")
    );

    let status = health.health().await;
    let placement = &status.components[components::PLACEMENT_STORE];
    assert_eq!(placement.status, ComponentStatus::Degraded);
    assert!(placement
        .message
        .as_deref()
        .unwrap_or_default()
        .contains("slice update failed"));
}

#[tokio::test]
async fn test_reroute_outranks_earlier_packet_in_route() {
    let mut slices = SliceTable::new();
    slices.insert(
        "blue".to_string(),
        [addr("10.0.1.2"), addr("10.2.0.2")].into_iter().collect(),
    );
    let h = harness(1, &[("web", "10.2.0.2")], slices);
    let controller = FabricController::new(h.scheduler.clone(), h.routes.clone(), h.slices.clone());

    let punted = controller
        .packet_in(u64::from(P0_S1), addr("10.0.1.2"), addr("10.2.0.2"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(punted.out_port, OutPort::Physical(4));
    assert_eq!(
        h.routes.lookup(P0_S1, addr("10.2.0.2").ipv4()),
        Some(punted.clone())
    );

    two_flows_to_pod_2(&h.scheduler, C11).await;
    idle_core(&h.scheduler, C12).await;
    let report = h.scheduler.run_cycle().await.unwrap();
    assert_eq!(report.remediation.unwrap().via().dpid(), C12);

    let winner = h.routes.lookup(P0_S1, addr("10.2.0.2").ipv4()).unwrap();
    assert_eq!(winner.out_port, OutPort::Physical(3));
    assert!(winner.priority > punted.priority);

    // A later packet-in for the same host stays shadowed
    controller
        .packet_in(u64::from(P0_S1), addr("10.0.1.2"), addr("10.2.0.2"))
        .await
        .unwrap();
    assert_eq!(h.routes.lookup(P0_S1, addr("10.2.0.2").ipv4()), Some(winner));
}

#[test]
fn test_remediation_priority_band() {
    for ordering in [0u16, 42, 0x7FFF, 0x8000, 0xFFFF] {
        let priority = remediation_priority(ordering);
        assert!(priority >= DEFAULT_PRIORITY);
        assert!(priority > PACKET_IN_PRIORITY);
    }
    assert_eq!(remediation_priority(0x1234), 0x9234);
    assert_eq!(remediation_priority(0x9234), 0x9234);
}

#[tokio::test]
async fn test_repeated_reroutes_replace_older_routes() {
    let next = Arc::new(AtomicU16::new(1));
    let source = {
        let next = next.clone();
        Arc::new(move || next.fetch_add(1, Ordering::SeqCst)) as PrioritySource
    };
    let h = harness_with_priority(1, &[("web", "10.2.0.2")], SliceTable::new(), source);
    two_flows_to_pod_2(&h.scheduler, C11).await;
    idle_core(&h.scheduler, C12).await;

    for _ in 0..5 {
        assert!(h.scheduler.run_cycle().await.unwrap().remediation.is_some());
    }

    let rules = h.routes.list();
    assert_eq!(rules.len(), 12);
    assert!(rules.iter().all(|r| r.priority == remediation_priority(5)));
}

#[tokio::test]
async fn test_southbound_recovers_after_clean_install() {
    let installer = Arc::new(FlakyInstaller::default());
    let health = HealthRegistry::new();
    let scheduler = FlowScheduler::builder()
        .transport(Arc::new(MockTransport::default()))
        .installer(installer.clone())
        .placements(Arc::new(InMemoryPlacementStore::new(
            [("web".to_string(), addr("10.2.0.2"))].into_iter().collect(),
        )))
        .health(health.clone())
        .remediation_every(1)
        .build()
        .unwrap();
    two_flows_to_pod_2(&scheduler, C11).await;
    idle_core(&scheduler, C12).await;

    installer.failing.store(true, Ordering::SeqCst);
    assert!(scheduler.run_cycle().await.unwrap().remediation.is_some());
    assert!(installer.routes.is_empty());
    assert_eq!(
        health.health().await.components[components::SOUTHBOUND].status,
        ComponentStatus::Degraded
    );

    installer.failing.store(false, Ordering::SeqCst);
    assert!(scheduler.run_cycle().await.unwrap().remediation.is_some());
    assert_eq!(installer.routes.len(), 12);
    assert_eq!(
        health.health().await.components[components::SOUTHBOUND].status,
        ComponentStatus::Healthy
    );
}

#[tokio::test]
async fn test_replies_outside_fabric_are_ignored() {
    let h = harness(1, &[], SliceTable::new());

    assert_eq!(
        h.scheduler
            .on_port_stats_reply(0, &[PortCounters::new(1, 10, 10)])
            .await,
        0
    );
    // OFPP_LOCAL and ports beyond k
    let merged = h
        .scheduler
        .on_port_stats_reply(
            C11,
            &[
                PortCounters::new(0xfffe, 10, 10),
                PortCounters::new(5, 10, 10),
                PortCounters::new(2, 10, 10),
            ],
        )
        .await;
    assert_eq!(merged, 1);

    let snapshot = h.scheduler.snapshot().await;
    assert_eq!(snapshot.switches.len(), 1);
    assert_eq!(snapshot.switches[0].switch, "c11");
    assert_eq!(snapshot.switches[0].ports.len(), 1);
}

#[tokio::test]
async fn test_register_rejects_unknown_switch() {
    let h = harness(1, &[], SliceTable::new());
    let result = h
        .scheduler
        .register_switch(crate::switch::SwitchIdentity::decode(0))
        .await;
    assert!(matches!(result, Err(SchedulerError::UnknownSwitch(0))));
}

#[tokio::test]
async fn test_snapshot_reports_pipeline_state() {
    let h = harness(100, &[], SliceTable::new());
    h.scheduler
        .register_switch(crate::switch::SwitchIdentity::decode(C12))
        .await
        .unwrap();
    two_flows_to_pod_2(&h.scheduler, C11).await;
    h.scheduler.run_cycle().await.unwrap();

    let snapshot = h.scheduler.snapshot().await;
    assert_eq!(snapshot.state, LoopState::Created);
    assert_eq!(snapshot.tick, 1);
    assert_eq!(snapshot.fat_tree_k, 4);
    assert_eq!(snapshot.flows.len(), 2);
    assert!(snapshot.flows.iter().all(|f| f.switch == "c11" && f.out_pod == 2));
    assert_eq!(snapshot.congestions.len(), 1);
    assert_eq!(snapshot.congestions[0].flow_count, 2);

    let names: Vec<(&str, bool)> = snapshot
        .switches
        .iter()
        .map(|s| (s.switch.as_str(), s.connected))
        .collect();
    assert_eq!(names, vec![("c11", false), ("c12", true)]);
}

#[tokio::test]
async fn test_closed_transport_fails_cycle() {
    let h = harness(1, &[], SliceTable::new());
    h.scheduler
        .register_switch(crate::switch::SwitchIdentity::decode(C11))
        .await
        .unwrap();
    h.transport.closed.store(true, Ordering::SeqCst);

    assert!(matches!(
        h.scheduler.run_cycle().await,
        Err(SchedulerError::TransportClosed)
    ));
}

#[tokio::test]
async fn test_closed_transport_surfaces_through_handle() {
    let h = harness(1, &[], SliceTable::new());
    h.scheduler
        .register_switch(crate::switch::SwitchIdentity::decode(C11))
        .await
        .unwrap();
    h.transport.closed.store(true, Ordering::SeqCst);

    let handle = h.scheduler.start().await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), handle.join())
        .await
        .expect("loop should terminate");

    assert!(matches!(result, Err(SchedulerError::TransportClosed)));
    assert_eq!(h.scheduler.state(), LoopState::Stopped);
    assert!(!h.health.readiness().await.ready);
}

#[tokio::test]
async fn test_lifecycle_start_and_stop() {
    let h = harness(1, &[], SliceTable::new());
    h.scheduler
        .register_switch(crate::switch::SwitchIdentity::decode(C11))
        .await
        .unwrap();
    assert_eq!(h.scheduler.state(), LoopState::Created);

    let handle = h.scheduler.start().await.unwrap();
    assert_eq!(h.scheduler.state(), LoopState::Running);
    assert!(h.health.readiness().await.ready);

    let second = h.scheduler.start().await;
    assert!(matches!(
        second,
        Err(SchedulerError::InvalidState {
            action: "start",
            state: LoopState::Running
        })
    ));

    // Let a few ticks go by
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!h.transport.requests.lock().await.is_empty());

    handle.stop().await;
    tokio::time::timeout(Duration::from_secs(5), handle.join())
        .await
        .expect("loop should stop promptly")
        .unwrap();

    assert_eq!(h.scheduler.state(), LoopState::Stopped);
    assert!(!h.health.readiness().await.ready);

    // Nothing is sent after stop
    let sent = h.transport.requests.lock().await.len();
    let report = h.scheduler.run_cycle().await.unwrap();
    assert_eq!(report.stats_requests, 0);
    assert_eq!(h.transport.requests.lock().await.len(), sent);

    let restart = h.scheduler.start().await;
    assert!(matches!(restart, Err(SchedulerError::InvalidState { .. })));
}

#[tokio::test]
async fn test_stop_before_start() {
    let h = harness(1, &[], SliceTable::new());
    h.scheduler.stop().await;
    h.scheduler.stop().await;

    assert_eq!(h.scheduler.state(), LoopState::Stopped);
    assert!(h.scheduler.start().await.is_err());
}

#[test]
fn test_builder_requires_sinks() {
    let result = FlowScheduler::builder()
        .transport(Arc::new(MockTransport::default()))
        .build();
    assert!(matches!(
        result,
        Err(SchedulerError::MissingComponent("route installer"))
    ));
}
