//! Controller event layer
//!
//! Translates southbound events (switch handshake, port stats replies,
//! table-miss packets) into scheduler calls and forwarding rules. Switches
//! get static two-level routing for traffic entering their subtree; traffic
//! leaving a pod is only routed once a packet-in passes the slice policy.

use crate::error::{SchedulerError, SinkError};
use crate::models::{HostAddr, PortCounters, RouteRule, PACKET_IN_PRIORITY};
use crate::scheduler::FlowScheduler;
use crate::sinks::{RouteInstaller, SliceStore};
use crate::switch::{FatTree, SwitchIdentity, SwitchRole};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Idle timeout of host routes installed on packet-in
pub const PACKET_IN_IDLE_TIMEOUT_SECS: u16 = 30;

const MASK_16: u32 = 0xFFFF_0000;
const MASK_24: u32 = 0xFFFF_FF00;

/// Static rules for a freshly connected switch: downward routes plus the
/// table-miss entry.
///
/// - core: `10.pod.0.0/16` on port `pod + 1` for every pod
/// - edge: `10.pod.swn.h/32` on port `h - 1` for every attached host
/// - aggregation: `10.pod.sub.0/24` on port `sub + 1` for every edge subnet
pub fn two_level_rules(fabric: &FatTree, switch: &SwitchIdentity) -> Vec<RouteRule> {
    let dpid = switch.dpid();
    let half = fabric.half();

    let mut rules: Vec<RouteRule> = match switch.role() {
        SwitchRole::Core { .. } => fabric
            .pods()
            .map(|pod| {
                RouteRule::prefix(
                    dpid,
                    Ipv4Addr::new(10, pod, 0, 0),
                    MASK_16,
                    u16::from(pod) + 1,
                )
            })
            .collect(),
        SwitchRole::Edge { pod, index } => (2..half + 2)
            .map(|host| {
                RouteRule::prefix(
                    dpid,
                    HostAddr::new(pod, index, host).ipv4(),
                    u32::MAX,
                    u16::from(host) - 1,
                )
            })
            .collect(),
        SwitchRole::Aggregation { pod, .. } => (0..half)
            .map(|sub| {
                RouteRule::prefix(
                    dpid,
                    Ipv4Addr::new(10, pod, sub, 0),
                    MASK_24,
                    u16::from(sub) + 1,
                )
            })
            .collect(),
        SwitchRole::Unknown => return Vec::new(),
    };

    rules.push(RouteRule::table_miss(dpid));
    rules
}

/// Entry point for southbound events
pub struct FabricController {
    fabric: FatTree,
    scheduler: Arc<FlowScheduler>,
    installer: Arc<dyn RouteInstaller>,
    slices: Arc<dyn SliceStore>,
}

impl FabricController {
    pub fn new(
        scheduler: Arc<FlowScheduler>,
        installer: Arc<dyn RouteInstaller>,
        slices: Arc<dyn SliceStore>,
    ) -> Self {
        Self {
            fabric: scheduler.fabric(),
            scheduler,
            installer,
            slices,
        }
    }

    pub fn scheduler(&self) -> &Arc<FlowScheduler> {
        &self.scheduler
    }

    fn identify(&self, raw_dpid: u64) -> Result<SwitchIdentity, SchedulerError> {
        let switch = SwitchIdentity::from_raw(raw_dpid);
        if self.fabric.contains(&switch) {
            Ok(switch)
        } else {
            Err(SchedulerError::UnknownSwitch(raw_dpid))
        }
    }

    /// Handle a completed switch handshake: register it with the scheduler
    /// and install its two-level routing rules.
    pub async fn switch_connected(&self, raw_dpid: u64) -> Result<SwitchIdentity, SchedulerError> {
        let switch = self.identify(raw_dpid)?;
        self.scheduler.register_switch(switch).await?;

        let rules = two_level_rules(&self.fabric, &switch);
        for rule in &rules {
            self.install(rule).await?;
        }

        info!(
            switch = %switch.name(),
            raw_dpid = raw_dpid,
            rules = rules.len(),
            "Installed two-level routing"
        );
        Ok(switch)
    }

    /// Forward a port stats reply. Unknown datapaths yield no data.
    pub async fn port_stats_reply(&self, raw_dpid: u64, counters: &[PortCounters]) -> usize {
        match self.identify(raw_dpid) {
            Ok(switch) => {
                self.scheduler
                    .on_port_stats_reply(switch.dpid(), counters)
                    .await
            }
            Err(_) => {
                debug!(raw_dpid = raw_dpid, "Dropping stats reply from unknown datapath");
                0
            }
        }
    }

    /// Handle a table-miss packet. Hosts in the same slice get a `/32` route
    /// towards `dst` on the packet-in uplink; anything else is dropped.
    pub async fn packet_in(
        &self,
        raw_dpid: u64,
        src: HostAddr,
        dst: HostAddr,
    ) -> Result<Option<RouteRule>, SchedulerError> {
        let switch = self.identify(raw_dpid)?;

        if !self.slices.same_slice(src, dst).await? {
            debug!(src = %src, dst = %dst, switch = %switch.name(), "Slice policy denies traffic");
            return Ok(None);
        }

        let Some(port) = self.fabric.packet_in_port(&switch, dst) else {
            debug!(dst = %dst, switch = %switch.name(), "No uplink for packet-in destination");
            return Ok(None);
        };

        let rule = RouteRule::to_host(
            switch.dpid(),
            dst,
            port,
            PACKET_IN_IDLE_TIMEOUT_SECS,
            PACKET_IN_PRIORITY,
        );
        self.install(&rule).await?;

        debug!(src = %src, dst = %dst, switch = %switch.name(), port = port, "Slice route installed");
        Ok(Some(rule))
    }

    async fn install(&self, rule: &RouteRule) -> Result<(), SchedulerError> {
        match self.installer.install_route(rule).await {
            Ok(()) => Ok(()),
            Err(SinkError::Closed) => Err(SchedulerError::TransportClosed),
            Err(e) => {
                warn!(
                    switch = %SwitchIdentity::decode(rule.switch).name(),
                    destination = %rule.destination,
                    error = %e,
                    "Route install rejected"
                );
                Ok(())
            }
        }
    }
}
