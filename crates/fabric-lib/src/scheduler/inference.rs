//! Flow inference from core switch port deltas
//!
//! Flows are never observed directly. A core switch port that transmitted
//! at least `threshold` bytes since the last reply is paired with other ports
//! of the same switch that received at least `threshold` bytes. Each pairing
//! becomes a flow from the ingress pod to the egress pod.

use crate::stats::PortStatsStore;
use crate::switch::{FatTree, SwitchIdentity};
use serde::{Deserialize, Serialize};

/// Default minimum delta, in bytes, for a port to count as active
pub const DEFAULT_THRESHOLD_BYTES: u64 = 1000;

/// Default number of cycles an inferred flow lives without refreshing traffic
pub const DEFAULT_FLOW_TTL: u32 = 1;

/// Inferred flow crossing a core switch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flow {
    /// Core switch the flow crosses
    pub switch: u16,
    pub in_pod: u8,
    pub out_pod: u8,
    /// Remaining inference cycles
    pub ttl: u32,
}

impl Flow {
    pub fn new(switch: u16, in_pod: u8, out_pod: u8, ttl: u32) -> Self {
        Self {
            switch,
            in_pod,
            out_pod,
            ttl,
        }
    }

    fn same_path(&self, other: &Flow) -> bool {
        self.switch == other.switch && self.in_pod == other.in_pod && self.out_pod == other.out_pod
    }
}

/// Heuristic flow detector over the port statistics store
#[derive(Debug, Clone)]
pub struct FlowInference {
    fabric: FatTree,
    threshold: u64,
    ttl: u32,
}

impl FlowInference {
    pub fn new(fabric: FatTree, threshold: u64, ttl: u32) -> Self {
        Self {
            fabric,
            threshold,
            ttl: ttl.max(1),
        }
    }

    /// Age the existing flows, then add or refresh the flows visible in the
    /// current deltas. Returns the number of newly inferred flows.
    pub fn run(&self, flows: &mut Vec<Flow>, stats: &PortStatsStore) -> usize {
        age(flows);

        let mut added = 0;
        for observed in self.observe(stats) {
            match flows.iter_mut().find(|f| f.same_path(&observed)) {
                Some(existing) => existing.ttl = observed.ttl,
                None => {
                    flows.push(observed);
                    added += 1;
                }
            }
        }
        added
    }

    /// Flows visible in the current deltas of every core switch
    pub fn observe(&self, stats: &PortStatsStore) -> Vec<Flow> {
        let mut flows = Vec::new();

        for dpid in stats.switches() {
            let switch = SwitchIdentity::decode(dpid);
            if !switch.is_core() {
                continue;
            }

            for out_port in self.fabric.ports() {
                let (mut tx, _) = stats.deltas(dpid, out_port);
                if tx < self.threshold {
                    continue;
                }

                for in_port in self.fabric.ports() {
                    if in_port == out_port || tx < self.threshold {
                        continue;
                    }
                    let (_, rx) = stats.deltas(dpid, in_port);
                    if rx < self.threshold {
                        continue;
                    }

                    let (Some(in_pod), Some(out_pod)) = (
                        self.fabric.pod_for_core_port(in_port),
                        self.fabric.pod_for_core_port(out_port),
                    ) else {
                        continue;
                    };

                    flows.push(Flow::new(dpid, in_pod, out_pod, self.ttl));
                    // An inbound port feeds at most this much of the outbound traffic
                    tx = tx.saturating_sub(rx);
                }
            }
        }

        flows
    }
}

/// Decrement every TTL and drop the expired flows
pub fn age(flows: &mut Vec<Flow>) {
    for flow in flows.iter_mut() {
        flow.ttl = flow.ttl.saturating_sub(1);
    }
    flows.retain(|f| f.ttl > 0);
}
