//! Flow scheduling for the Fat-Tree fabric
//!
//! The scheduler runs one background task that periodically:
//! 1. Infers inter-pod flows from core switch port deltas
//! 2. Recomputes the congested downlinks
//! 3. Every few ticks, remediates one congestion by rerouting or migrating
//! 4. Requests fresh port statistics from the connected core switches

mod congestion;
mod inference;
mod planner;
mod r#loop;

#[cfg(test)]
mod tests;

pub use congestion::{detect, Congestion};
pub use inference::{age, Flow, FlowInference, DEFAULT_FLOW_TTL, DEFAULT_THRESHOLD_BYTES};
pub use planner::{Remediation, RemediationPlanner};
pub use r#loop::{
    remediation_priority, CycleReport, FlowScheduler, PrioritySource, SchedulerBuilder,
    SchedulerHandle,
};

use crate::switch::{FatTree, SwitchIdentity};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Default time between two scheduler ticks
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(10);

/// Default number of ticks between two remediation passes
pub const DEFAULT_REMEDIATION_EVERY: u64 = 4;

/// Default idle timeout of remediation routes
pub const DEFAULT_ROUTE_IDLE_TIMEOUT_SECS: u16 = 30;

/// Lifecycle of the scheduler task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum LoopState {
    Created = 0,
    Running = 1,
    Stopped = 2,
}

impl LoopState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => LoopState::Created,
            1 => LoopState::Running,
            _ => LoopState::Stopped,
        }
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LoopState::Created => "created",
            LoopState::Running => "running",
            LoopState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Tuning of the scheduler loop
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Fabric geometry
    pub fabric: FatTree,
    /// Time between ticks (default: 10 seconds)
    pub tick_interval: Duration,
    /// Minimum per-port delta for a port to carry a flow (default: 1000 bytes)
    pub congestion_threshold_bytes: u64,
    /// Remediate on every Nth tick (default: 4)
    pub remediation_every: u64,
    /// Cycles an inferred flow survives without fresh traffic (default: 1)
    pub flow_ttl: u32,
    /// Idle timeout of installed remediation routes (default: 30 seconds)
    pub route_idle_timeout_secs: u16,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            fabric: FatTree::default(),
            tick_interval: DEFAULT_TICK_INTERVAL,
            congestion_threshold_bytes: DEFAULT_THRESHOLD_BYTES,
            remediation_every: DEFAULT_REMEDIATION_EVERY,
            flow_ttl: DEFAULT_FLOW_TTL,
            route_idle_timeout_secs: DEFAULT_ROUTE_IDLE_TIMEOUT_SECS,
        }
    }
}

/// Point-in-time view of the scheduler, served by the diagnostics API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerSnapshot {
    pub state: LoopState,
    pub tick: u64,
    pub fat_tree_k: u8,
    pub flows: Vec<FlowView>,
    pub congestions: Vec<CongestionView>,
    pub switches: Vec<SwitchPortsView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowView {
    pub switch: String,
    pub dpid: u16,
    pub in_pod: u8,
    pub out_pod: u8,
    pub ttl: u32,
}

impl From<&Flow> for FlowView {
    fn from(flow: &Flow) -> Self {
        Self {
            switch: SwitchIdentity::decode(flow.switch).name(),
            dpid: flow.switch,
            in_pod: flow.in_pod,
            out_pod: flow.out_pod,
            ttl: flow.ttl,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CongestionView {
    pub switch: String,
    pub dpid: u16,
    pub dst_pod: u8,
    pub flow_count: u32,
}

impl From<&Congestion> for CongestionView {
    fn from(congestion: &Congestion) -> Self {
        Self {
            switch: SwitchIdentity::decode(congestion.switch).name(),
            dpid: congestion.switch,
            dst_pod: congestion.dst_pod,
            flow_count: congestion.flow_count,
        }
    }
}

/// Latest counters of one switch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchPortsView {
    pub switch: String,
    pub dpid: u16,
    pub connected: bool,
    pub ports: Vec<PortView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortView {
    pub port_no: u32,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub delta_tx: u64,
    pub delta_rx: u64,
    pub downlink_flow_count: u32,
}
