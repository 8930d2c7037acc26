//! External collaborators of the scheduler
//!
//! The scheduler never talks OpenFlow or touches files directly. It requests
//! port stats, installs routes and reads/writes placement and slice tables
//! through the traits below, so the transport and storage can be swapped
//! without touching the control loop.

mod placement;
mod slices;
mod southbound;

pub use placement::{FilePlacementStore, InMemoryPlacementStore};
pub use slices::InMemorySliceStore;
pub use southbound::{ChannelSouthbound, RouteTable, SouthboundCommand};

use crate::error::{SinkError, StoreError};
use crate::models::{HostAddr, PlacementTable, RouteRule, SliceId, SliceTable};
use async_trait::async_trait;

/// Fire-and-forget port statistics requests; replies arrive later through
/// `FlowScheduler::on_port_stats_reply`.
#[async_trait]
pub trait StatsTransport: Send + Sync {
    async fn request_port_stats(&self, dpid: u16) -> Result<(), SinkError>;
}

/// Idempotent upsert of forwarding rules
#[async_trait]
pub trait RouteInstaller: Send + Sync {
    async fn install_route(&self, rule: &RouteRule) -> Result<(), SinkError>;
}

/// Shared service placement table with whole-table replace semantics.
///
/// `read_all` returns a fresh snapshot; `write_all` is atomic and visible
/// to every subsequent read.
#[async_trait]
pub trait PlacementStore: Send + Sync {
    async fn read_all(&self) -> Result<PlacementTable, StoreError>;

    async fn write_all(&self, table: &PlacementTable) -> Result<(), StoreError>;
}

/// Slice membership; every address belongs to at most one slice
#[async_trait]
pub trait SliceStore: Send + Sync {
    async fn read_all(&self) -> Result<SliceTable, StoreError>;

    async fn slice_of(&self, addr: HostAddr) -> Result<Option<SliceId>, StoreError>;

    /// Put `addr` in `slice`, removing it from any other slice first
    async fn assign(&self, addr: HostAddr, slice: &str) -> Result<(), StoreError>;

    /// Remove `addr` from its slice, returning the slice it left
    async fn remove(&self, addr: HostAddr) -> Result<Option<SliceId>, StoreError>;

    async fn same_slice(&self, a: HostAddr, b: HostAddr) -> Result<bool, StoreError> {
        let slice_a = self.slice_of(a).await?;
        Ok(slice_a.is_some() && slice_a == self.slice_of(b).await?)
    }

    /// Hand the slice membership of a migrated service from `from` to `to`.
    ///
    /// `to` leaves whatever slice it was in and joins the slice of `from`,
    /// which then leaves it. Returns the slice `to` ended up in.
    async fn relocate(&self, from: HostAddr, to: HostAddr) -> Result<Option<SliceId>, StoreError> {
        let Some(slice) = self.slice_of(from).await? else {
            self.remove(to).await?;
            return Ok(None);
        };
        self.assign(to, &slice).await?;
        self.remove(from).await?;
        Ok(Some(slice))
    }
}
