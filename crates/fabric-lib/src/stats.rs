//! Per-switch, per-port traffic counters with delta tracking

use crate::switch::SwitchIdentity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

/// Counters for a single switch port
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortStats {
    /// Cumulative transmitted bytes
    pub tx_bytes: u64,
    /// Cumulative received bytes
    pub rx_bytes: u64,
    /// Transmitted bytes since the previous reply
    pub delta_tx: u64,
    /// Received bytes since the previous reply
    pub delta_rx: u64,
    /// Flows currently egressing this port, recomputed every detection cycle
    pub downlink_flow_count: u32,
}

impl PortStats {
    /// Apply new cumulative counters. Returns true when a counter went
    /// backwards and its delta was clamped to zero.
    fn apply(&mut self, tx_bytes: u64, rx_bytes: u64) -> bool {
        let tx = tx_bytes.checked_sub(self.tx_bytes);
        let rx = rx_bytes.checked_sub(self.rx_bytes);

        self.delta_tx = tx.unwrap_or(0);
        self.delta_rx = rx.unwrap_or(0);
        self.tx_bytes = tx_bytes;
        self.rx_bytes = rx_bytes;

        tx.is_none() || rx.is_none()
    }
}

/// Statistics for every switch that has reported, keyed by 16-bit dpid
#[derive(Debug, Default, Clone)]
pub struct PortStatsStore {
    switches: BTreeMap<u16, BTreeMap<u32, PortStats>>,
}

impl PortStatsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new cumulative sample, creating the entry on first report
    pub fn update(&mut self, dpid: u16, port: u32, tx_bytes: u64, rx_bytes: u64) -> PortStats {
        let stats = self
            .switches
            .entry(dpid)
            .or_default()
            .entry(port)
            .or_default();

        let previous = (stats.tx_bytes, stats.rx_bytes);
        if stats.apply(tx_bytes, rx_bytes) {
            warn!(
                dpid = dpid,
                port = port,
                previous_tx = previous.0,
                previous_rx = previous.1,
                tx_bytes = tx_bytes,
                rx_bytes = rx_bytes,
                "Port counters went backwards, clamping delta to zero"
            );
        }
        *stats
    }

    pub fn get(&self, dpid: u16, port: u32) -> Option<PortStats> {
        self.switches.get(&dpid)?.get(&port).copied()
    }

    /// `(Δtx, Δrx)` of a port, zero when it never reported
    pub fn deltas(&self, dpid: u16, port: u32) -> (u64, u64) {
        self.get(dpid, port)
            .map(|s| (s.delta_tx, s.delta_rx))
            .unwrap_or((0, 0))
    }

    pub fn reset_downlink_counts(&mut self) {
        for ports in self.switches.values_mut() {
            for stats in ports.values_mut() {
                stats.downlink_flow_count = 0;
            }
        }
    }

    /// Count one more flow on a port. Ports that never reported are left
    /// alone and `false` is returned.
    pub fn increment_downlink_count(&mut self, dpid: u16, port: u32) -> bool {
        match self.switches.get_mut(&dpid).and_then(|p| p.get_mut(&port)) {
            Some(stats) => {
                stats.downlink_flow_count += 1;
                true
            }
            None => false,
        }
    }

    /// Switches in ascending dpid order
    pub fn switches(&self) -> impl Iterator<Item = u16> + '_ {
        self.switches.keys().copied()
    }

    /// Switches whose dpid decodes to a core switch, ascending
    pub fn core_switches(&self) -> Vec<SwitchIdentity> {
        self.switches()
            .map(SwitchIdentity::decode)
            .filter(|s| s.is_core())
            .collect()
    }

    /// Ports of a switch in ascending order
    pub fn ports(&self, dpid: u16) -> impl Iterator<Item = (u32, &PortStats)> + '_ {
        self.switches
            .get(&dpid)
            .into_iter()
            .flat_map(|ports| ports.iter().map(|(port, stats)| (*port, stats)))
    }

    pub fn len(&self) -> usize {
        self.switches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.switches.is_empty()
    }
}
