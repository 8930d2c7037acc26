//! Congested downlink detection

use super::inference::Flow;
use crate::stats::PortStatsStore;
use crate::switch::FatTree;
use serde::{Deserialize, Serialize};

/// Core switch downlink towards a pod carrying more than one flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Congestion {
    pub switch: u16,
    pub dst_pod: u8,
    pub flow_count: u32,
}

/// Recount flows per egress port and return every downlink with more than
/// one of them. The result replaces the previous congestion list.
pub fn detect(fabric: &FatTree, stats: &mut PortStatsStore, flows: &[Flow]) -> Vec<Congestion> {
    stats.reset_downlink_counts();

    for flow in flows {
        stats.increment_downlink_count(flow.switch, fabric.core_port_for_pod(flow.out_pod));
    }

    let mut congestions = Vec::new();
    for dpid in stats.switches() {
        for (port, port_stats) in stats.ports(dpid) {
            if port_stats.downlink_flow_count <= 1 {
                continue;
            }
            if let Some(dst_pod) = fabric.pod_for_core_port(port) {
                congestions.push(Congestion {
                    switch: dpid,
                    dst_pod,
                    flow_count: port_stats.downlink_flow_count,
                });
            }
        }
    }
    congestions
}
