//! Switch identity codec and Fat-Tree geometry
//!
//! A datapath id packs the switch role and its coordinates into 16 bits:
//!
//! ```text
//!   is_core | is_edge | coord_hi | coord_lo
//!    1 bit  |  1 bit  |  6 bits  |  8 bits
//! ```
//!
//! Core switches use `coord_hi` as the grid column `j` and `coord_lo` as the
//! grid row `i`. Pod switches use them as the pod number and the switch
//! number inside the pod.

use crate::error::CodecError;
use crate::models::HostAddr;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

const CORE_BIT: u16 = 1 << 15;
const EDGE_BIT: u16 = 1 << 14;
const COORD_HI_MASK: u16 = 0x3F00;
const COORD_LO_MASK: u16 = 0x00FF;

/// Largest value the 6-bit high coordinate can hold
pub const MAX_COORD_HI: u8 = 0x3F;

/// Role of a switch together with its topological coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum SwitchRole {
    Core { column: u8, row: u8 },
    Aggregation { pod: u8, index: u8 },
    Edge { pod: u8, index: u8 },
    Unknown,
}

/// Decoded identity of a switch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SwitchIdentity {
    dpid: u16,
    role: SwitchRole,
}

impl SwitchIdentity {
    /// Decode a 16-bit datapath id. Zero is never a valid switch.
    pub fn decode(dpid: u16) -> Self {
        if dpid == 0 {
            return Self {
                dpid,
                role: SwitchRole::Unknown,
            };
        }

        let hi = ((dpid & COORD_HI_MASK) >> 8) as u8;
        let lo = (dpid & COORD_LO_MASK) as u8;

        let role = if dpid & CORE_BIT != 0 {
            SwitchRole::Core {
                column: hi,
                row: lo,
            }
        } else if dpid & EDGE_BIT != 0 {
            SwitchRole::Edge { pod: hi, index: lo }
        } else {
            SwitchRole::Aggregation { pod: hi, index: lo }
        };

        Self { dpid, role }
    }

    /// Decode an identifier as reported by the transport, which may be the
    /// 64-bit extended form.
    pub fn from_raw(raw: u64) -> Self {
        match u16::try_from(raw) {
            Ok(dpid) => Self::decode(dpid),
            Err(_) => Self::decode(reduce_64_to_16(raw)),
        }
    }

    pub fn dpid(&self) -> u16 {
        self.dpid
    }

    pub fn role(&self) -> SwitchRole {
        self.role
    }

    pub fn is_core(&self) -> bool {
        matches!(self.role, SwitchRole::Core { .. })
    }

    pub fn is_edge(&self) -> bool {
        matches!(self.role, SwitchRole::Edge { .. })
    }

    pub fn is_known(&self) -> bool {
        self.role != SwitchRole::Unknown
    }

    /// Pod of an edge or aggregation switch
    pub fn pod(&self) -> Option<u8> {
        match self.role {
            SwitchRole::Aggregation { pod, .. } | SwitchRole::Edge { pod, .. } => Some(pod),
            _ => None,
        }
    }

    /// `(is_core, x, y)` as passed to [`encode`]
    pub fn coordinates(&self) -> Option<(bool, u8, u8)> {
        match self.role {
            SwitchRole::Core { column, row } => Some((true, column, row)),
            SwitchRole::Aggregation { pod, index } | SwitchRole::Edge { pod, index } => {
                Some((false, pod, index))
            }
            SwitchRole::Unknown => None,
        }
    }

    pub fn name(&self) -> String {
        match self.role {
            SwitchRole::Core { column, row } => format!("c{}{}", column, row),
            SwitchRole::Aggregation { pod, index } | SwitchRole::Edge { pod, index } => {
                format!("p{}_s{}", pod, index)
            }
            SwitchRole::Unknown => "unknown".to_string(),
        }
    }
}

impl fmt::Display for SwitchIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Build a 16-bit datapath id.
///
/// For pod switches the edge bit is set when `y < k/2`; core switches never
/// carry it.
pub fn encode(core: bool, x: u8, y: u8, k: u8) -> Result<u16, CodecError> {
    if x > MAX_COORD_HI {
        return Err(CodecError::CoordinateOutOfRange { value: x });
    }

    let edge = !core && y < k / 2;
    let mut dpid = (u16::from(x) << 8) | u16::from(y);
    if core {
        dpid |= CORE_BIT;
    }
    if edge {
        dpid |= EDGE_BIT;
    }
    Ok(dpid)
}

/// Reduce a 64-bit extended identifier to the 16-bit form.
///
/// Walks the binary representation from the most significant set bit
/// downwards, keeping every 4th bit; the kept bits, in order, form the short
/// id. The emulator writes the 16-bit id as a binary string that the switch
/// reads back as hex, so for its identifiers each kept bit is one original
/// bit. Zero reduces to zero.
pub fn reduce_64_to_16(id64: u64) -> u16 {
    if id64 == 0 {
        return 0;
    }
    let top = 63 - id64.leading_zeros();
    // At most 16 positions are visited: top <= 63
    (0..=top / 4).fold(0u16, |acc, step| {
        let bit = ((id64 >> (top - 4 * step)) & 1) as u16;
        (acc << 1) | bit
    })
}

/// Geometry of a k-ary Fat-Tree as wired by the emulation scripts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FatTree {
    k: u8,
}

/// Arity of the emulated fabric
pub const DEFAULT_ARITY: u8 = 4;

impl Default for FatTree {
    fn default() -> Self {
        Self { k: DEFAULT_ARITY }
    }
}

impl FatTree {
    pub fn new(k: u8) -> Result<Self, CodecError> {
        if k < 2 || k % 2 != 0 || k > MAX_COORD_HI + 1 {
            return Err(CodecError::InvalidArity(k));
        }
        Ok(Self { k })
    }

    pub fn k(&self) -> u8 {
        self.k
    }

    pub fn half(&self) -> u8 {
        self.k / 2
    }

    pub fn pods(&self) -> Range<u8> {
        0..self.k
    }

    /// Physical ports per switch, numbered from 1
    pub fn ports(&self) -> impl Iterator<Item = u32> {
        1..=u32::from(self.k)
    }

    /// Core switches in row-major order (`c11, c21, ..., c12, c22, ...`)
    pub fn core_switches(&self) -> Vec<SwitchIdentity> {
        let half = self.half();
        let mut switches = Vec::with_capacity(usize::from(half) * usize::from(half));
        for row in 1..=half {
            for column in 1..=half {
                switches.push(self.identity(true, column, row));
            }
        }
        switches
    }

    /// Edge switches `0..k/2` followed by aggregation switches `k/2..k`
    pub fn pod_switches(&self, pod: u8) -> Vec<SwitchIdentity> {
        (0..self.k).map(|swn| self.identity(false, pod, swn)).collect()
    }

    /// Host addresses of a pod in subnet-then-host order
    pub fn hosts_in_pod(&self, pod: u8) -> impl Iterator<Item = HostAddr> {
        let half = self.half();
        (0..half).flat_map(move |subnet| (2..half + 2).map(move |host| HostAddr::new(pod, subnet, host)))
    }

    /// Whether the identity is a switch this fabric actually contains
    pub fn contains(&self, switch: &SwitchIdentity) -> bool {
        let half = self.half();
        match switch.role() {
            SwitchRole::Core { column, row } => {
                (1..=half).contains(&column) && (1..=half).contains(&row)
            }
            SwitchRole::Edge { pod, index } => pod < self.k && index < half,
            SwitchRole::Aggregation { pod, index } => pod < self.k && (half..self.k).contains(&index),
            SwitchRole::Unknown => false,
        }
    }

    /// Core switch port facing a pod
    pub fn core_port_for_pod(&self, pod: u8) -> u32 {
        u32::from(pod) + 1
    }

    /// Pod reached through a core switch port
    pub fn pod_for_core_port(&self, port: u32) -> Option<u8> {
        if (1..=u32::from(self.k)).contains(&port) {
            Some((port - 1) as u8)
        } else {
            None
        }
    }

    /// Uplink a pod switch uses to reach `via`: edge switches pick the
    /// aggregation switch of the core's column, aggregation switches pick the
    /// core's row.
    pub fn uplink_port(&self, switch: &SwitchIdentity, via: &SwitchIdentity) -> Option<u16> {
        let SwitchRole::Core { column, row } = via.role() else {
            return None;
        };
        let half = u16::from(self.half());
        match switch.role() {
            SwitchRole::Edge { .. } => Some(half + u16::from(column)),
            SwitchRole::Aggregation { .. } => Some(half + u16::from(row)),
            _ => None,
        }
    }

    /// Uplink chosen for a host-specific rule installed on packet-in; spreads
    /// destinations over the upper ports by host id and switch number.
    pub fn packet_in_port(&self, switch: &SwitchIdentity, dst: HostAddr) -> Option<u16> {
        let (_, _, swn) = switch.coordinates()?;
        if switch.is_core() || dst.host < 2 {
            return None;
        }
        let half = u16::from(self.half());
        let offset = (u16::from(dst.host) - 2 + u16::from(swn)) % half;
        Some(offset + half + 1)
    }

    fn identity(&self, core: bool, x: u8, y: u8) -> SwitchIdentity {
        // Coordinates generated here are bounded by k <= 64.
        let dpid = encode(core, x, y, self.k).unwrap_or_default();
        SwitchIdentity::decode(dpid)
    }
}
