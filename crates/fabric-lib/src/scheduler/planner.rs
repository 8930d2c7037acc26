//! Remediation planning for congested downlinks
//!
//! For each congestion the planner first looks for another core switch whose
//! downlink to the destination pod is free and reroutes the affected service
//! through it. Only when every core switch is congested towards that pod does
//! it relocate the service to the first pod (ascending index) that has both
//! a free core downlink and an unused host.
//!
//! Planning is pure: the scheduler loop executes the returned effects.

use super::congestion::Congestion;
use crate::models::{HostAddr, PlacementTable, RouteRule, ServiceId};
use crate::switch::{FatTree, SwitchIdentity};
use std::collections::{BTreeSet, HashSet};

/// Action chosen for one congestion
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Remediation {
    /// Route the service through another core switch
    Reroute {
        congestion: Congestion,
        service: ServiceId,
        destination: HostAddr,
        via: SwitchIdentity,
    },
    /// Move the service to a host in another pod, then route to it
    Migrate {
        congestion: Congestion,
        service: ServiceId,
        from: HostAddr,
        to: HostAddr,
        via: SwitchIdentity,
    },
}

impl Remediation {
    /// Address the new path must lead to
    pub fn destination(&self) -> HostAddr {
        match self {
            Remediation::Reroute { destination, .. } => *destination,
            Remediation::Migrate { to, .. } => *to,
        }
    }

    pub fn via(&self) -> SwitchIdentity {
        match self {
            Remediation::Reroute { via, .. } | Remediation::Migrate { via, .. } => *via,
        }
    }

    pub fn congestion(&self) -> Congestion {
        match self {
            Remediation::Reroute { congestion, .. } | Remediation::Migrate { congestion, .. } => {
                *congestion
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RemediationPlanner {
    fabric: FatTree,
}

impl RemediationPlanner {
    pub fn new(fabric: FatTree) -> Self {
        Self { fabric }
    }

    /// Pick the remediation for the first congestion that has one.
    ///
    /// `cores` are the known core switches; they are tried in ascending dpid
    /// order regardless of the order given.
    pub fn plan(
        &self,
        cores: &[SwitchIdentity],
        congestions: &[Congestion],
        placements: &PlacementTable,
    ) -> Option<Remediation> {
        let mut cores: Vec<SwitchIdentity> = cores.iter().copied().filter(|c| c.is_core()).collect();
        cores.sort_by_key(|c| c.dpid());

        let congested: HashSet<(u16, u8)> =
            congestions.iter().map(|c| (c.switch, c.dst_pod)).collect();

        for congestion in congestions {
            let Some((service, current)) = placements
                .iter()
                .find(|(_, addr)| addr.pod == congestion.dst_pod)
            else {
                continue;
            };

            if let Some(via) = free_core(&cores, &congested, congestion.dst_pod) {
                return Some(Remediation::Reroute {
                    congestion: *congestion,
                    service: service.clone(),
                    destination: *current,
                    via,
                });
            }

            if let Some((to, via)) = self.migration_target(&cores, &congested, placements) {
                return Some(Remediation::Migrate {
                    congestion: *congestion,
                    service: service.clone(),
                    from: *current,
                    to,
                    via,
                });
            }
        }

        None
    }

    /// First pod with a free core downlink and an unused host (first fit)
    fn migration_target(
        &self,
        cores: &[SwitchIdentity],
        congested: &HashSet<(u16, u8)>,
        placements: &PlacementTable,
    ) -> Option<(HostAddr, SwitchIdentity)> {
        let used: BTreeSet<HostAddr> = placements.values().copied().collect();

        self.fabric.pods().find_map(|pod| {
            let via = free_core(cores, congested, pod)?;
            let host = self.fabric.hosts_in_pod(pod).find(|h| !used.contains(h))?;
            Some((host, via))
        })
    }

    /// Exact-match rules steering traffic for `destination` through `via` on
    /// every pod switch outside the destination pod.
    pub fn path_rules(
        &self,
        destination: HostAddr,
        via: &SwitchIdentity,
        idle_timeout_secs: u16,
        priority: u16,
    ) -> Vec<RouteRule> {
        self.fabric
            .pods()
            .filter(|pod| *pod != destination.pod)
            .flat_map(|pod| self.fabric.pod_switches(pod))
            .filter_map(|switch| {
                let port = self.fabric.uplink_port(&switch, via)?;
                Some(RouteRule::to_host(
                    switch.dpid(),
                    destination,
                    port,
                    idle_timeout_secs,
                    priority,
                ))
            })
            .collect()
    }
}

fn free_core(
    cores: &[SwitchIdentity],
    congested: &HashSet<(u16, u8)>,
    pod: u8,
) -> Option<SwitchIdentity> {
    cores
        .iter()
        .copied()
        .find(|core| !congested.contains(&(core.dpid(), pod)))
}
