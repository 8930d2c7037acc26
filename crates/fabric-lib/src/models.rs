//! Core data models for the flow scheduler

use crate::error::AddrError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// First octet shared by every host in the fabric
pub const FABRIC_OCTET: u8 = 10;

/// Priority OpenFlow assigns to flow entries that do not set one
pub const DEFAULT_PRIORITY: u16 = 0x8000;

/// Priority of host routes installed on packet-in. Remediation routes for the
/// same host always outrank it.
pub const PACKET_IN_PRIORITY: u16 = 0x0100;

/// Host address following the `10.<pod>.<subnet>.<host>` convention.
///
/// This is the only place where pod/subnet/host are extracted from an
/// address; everything else goes through these fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HostAddr {
    pub pod: u8,
    pub subnet: u8,
    pub host: u8,
}

impl HostAddr {
    pub const fn new(pod: u8, subnet: u8, host: u8) -> Self {
        Self { pod, subnet, host }
    }

    pub fn ipv4(&self) -> Ipv4Addr {
        Ipv4Addr::new(FABRIC_OCTET, self.pod, self.subnet, self.host)
    }
}

impl fmt::Display for HostAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", FABRIC_OCTET, self.pod, self.subnet, self.host)
    }
}

impl From<HostAddr> for Ipv4Addr {
    fn from(addr: HostAddr) -> Self {
        addr.ipv4()
    }
}

impl TryFrom<Ipv4Addr> for HostAddr {
    type Error = AddrError;

    fn try_from(ip: Ipv4Addr) -> Result<Self, Self::Error> {
        let [first, pod, subnet, host] = ip.octets();
        if first != FABRIC_OCTET {
            return Err(AddrError::OutsideFabric(ip.to_string()));
        }
        Ok(Self::new(pod, subnet, host))
    }
}

impl FromStr for HostAddr {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ip: Ipv4Addr = s
            .trim()
            .parse()
            .map_err(|_| AddrError::Malformed(s.to_string()))?;
        Self::try_from(ip)
    }
}

impl TryFrom<String> for HostAddr {
    type Error = AddrError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<HostAddr> for String {
    fn from(addr: HostAddr) -> Self {
        addr.to_string()
    }
}

/// Service identifier as stored in the placement table
pub type ServiceId = String;

/// Slice identifier
pub type SliceId = String;

/// Service id -> current host, persisted as a flat map of dotted quads
pub type PlacementTable = BTreeMap<ServiceId, HostAddr>;

/// Slice id -> hosts allowed to talk to each other
pub type SliceTable = BTreeMap<SliceId, BTreeSet<HostAddr>>;

/// One port entry of a port stats reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortCounters {
    pub port_no: u32,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
}

impl PortCounters {
    pub fn new(port_no: u32, tx_bytes: u64, rx_bytes: u64) -> Self {
        Self {
            port_no,
            tx_bytes,
            rx_bytes,
        }
    }
}

/// Output action of a forwarding rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutPort {
    Physical(u16),
    Controller,
}

/// Destination-based forwarding rule for a single switch
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteRule {
    /// 16-bit datapath id of the target switch
    pub switch: u16,
    pub destination: Ipv4Addr,
    pub mask: u32,
    pub out_port: OutPort,
    /// Zero means the rule never idles out
    pub idle_timeout_secs: u16,
    pub priority: u16,
}

impl RouteRule {
    /// Exact-match rule for a single host
    pub fn to_host(
        switch: u16,
        destination: HostAddr,
        out_port: u16,
        idle_timeout_secs: u16,
        priority: u16,
    ) -> Self {
        Self {
            switch,
            destination: destination.ipv4(),
            mask: u32::MAX,
            out_port: OutPort::Physical(out_port),
            idle_timeout_secs,
            priority,
        }
    }

    /// Prefix rule with the default priority and no idle timeout
    pub fn prefix(switch: u16, destination: Ipv4Addr, mask: u32, out_port: u16) -> Self {
        Self {
            switch,
            destination,
            mask,
            out_port: OutPort::Physical(out_port),
            idle_timeout_secs: 0,
            priority: DEFAULT_PRIORITY,
        }
    }

    /// Lowest-priority IPv4 rule punting unmatched packets to the controller
    pub fn table_miss(switch: u16) -> Self {
        Self {
            switch,
            destination: Ipv4Addr::UNSPECIFIED,
            mask: 0,
            out_port: OutPort::Controller,
            idle_timeout_secs: 0,
            priority: 0,
        }
    }

    /// Switch and match of the flow entry
    pub fn key(&self) -> (u16, Ipv4Addr, u32) {
        (self.switch, self.destination, self.mask)
    }

    /// Whether a packet towards `dst` hits this rule
    pub fn matches(&self, dst: Ipv4Addr) -> bool {
        u32::from(dst) & self.mask == u32::from(self.destination) & self.mask
    }
}
