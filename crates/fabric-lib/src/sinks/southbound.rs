//! Southbound command channel and route bookkeeping

use super::{RouteInstaller, StatsTransport};
use crate::error::SinkError;
use crate::models::RouteRule;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Command for the OpenFlow adapter sitting below the scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SouthboundCommand {
    RequestPortStats { dpid: u16 },
    InstallRoute { rule: RouteRule },
}

/// Stats transport and route installer backed by an mpsc channel.
///
/// A closed receiver means the adapter is gone, which the scheduler treats
/// as fatal. Stats requests never wait for buffer space: a full buffer
/// rejects the request and the next tick polls again. Route installs wait.
#[derive(Debug, Clone)]
pub struct ChannelSouthbound {
    tx: mpsc::Sender<SouthboundCommand>,
}

impl ChannelSouthbound {
    pub fn new(buffer_size: usize) -> (Self, mpsc::Receiver<SouthboundCommand>) {
        let (tx, rx) = mpsc::channel(buffer_size);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl StatsTransport for ChannelSouthbound {
    async fn request_port_stats(&self, dpid: u16) -> Result<(), SinkError> {
        match self.tx.try_send(SouthboundCommand::RequestPortStats { dpid }) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(SinkError::Rejected {
                dpid,
                reason: "southbound buffer full".to_string(),
            }),
            Err(TrySendError::Closed(_)) => Err(SinkError::Closed),
        }
    }
}

#[async_trait]
impl RouteInstaller for ChannelSouthbound {
    async fn install_route(&self, rule: &RouteRule) -> Result<(), SinkError> {
        self.tx
            .send(SouthboundCommand::InstallRoute { rule: rule.clone() })
            .await
            .map_err(|_| SinkError::Closed)
    }
}

#[derive(Debug, Clone)]
struct InstalledRoute {
    rule: RouteRule,
    installed_at: Instant,
}

impl InstalledRoute {
    /// Rules without an idle timeout never expire. Traffic that refreshes the
    /// switch entry is invisible here, so this errs towards forgetting.
    fn is_live(&self, now: Instant) -> bool {
        self.rule.idle_timeout_secs == 0
            || now.saturating_duration_since(self.installed_at)
                < Duration::from_secs(u64::from(self.rule.idle_timeout_secs))
    }
}

/// Mirror of the forwarding rules pushed to the switches.
///
/// One entry per (switch, match). A new install replaces the entry unless
/// the entry is still live and has a higher priority, in which case it
/// keeps shadowing the new rule on the switch. Expired entries are skipped
/// on read and dropped by [`RouteTable::prune_expired`].
#[derive(Debug, Default)]
pub struct RouteTable {
    rules: DashMap<(u16, Ipv4Addr, u32), InstalledRoute>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, rule: RouteRule) {
        self.record_at(rule, Instant::now());
    }

    fn record_at(&self, rule: RouteRule, installed_at: Instant) {
        let entry = InstalledRoute { rule, installed_at };
        match self.rules.entry(entry.rule.key()) {
            Entry::Occupied(mut current) => {
                let shadowed = current.get().is_live(installed_at)
                    && current.get().rule.priority > entry.rule.priority;
                if !shadowed {
                    current.insert(entry);
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(entry);
            }
        }
    }

    fn live(&self) -> Vec<RouteRule> {
        let now = Instant::now();
        self.rules
            .iter()
            .filter(|r| r.value().is_live(now))
            .map(|r| r.value().rule.clone())
            .collect()
    }

    /// Rules installed on a switch, most specific first
    pub fn rules_for(&self, switch: u16) -> Vec<RouteRule> {
        let mut rules: Vec<RouteRule> = self
            .live()
            .into_iter()
            .filter(|r| r.switch == switch)
            .collect();
        rules.sort_by(|a, b| {
            b.mask
                .cmp(&a.mask)
                .then(b.priority.cmp(&a.priority))
                .then(a.destination.cmp(&b.destination))
        });
        rules
    }

    /// Rule a switch applies to packets towards `dst`: highest priority
    /// first, longest mask on ties
    pub fn lookup(&self, switch: u16, dst: Ipv4Addr) -> Option<RouteRule> {
        self.live()
            .into_iter()
            .filter(|r| r.switch == switch && r.matches(dst))
            .max_by_key(|r| (r.priority, r.mask))
    }

    /// Every rule, ordered by switch then destination
    pub fn list(&self) -> Vec<RouteRule> {
        let mut rules = self.live();
        rules.sort_by_key(|r| (r.switch, r.destination, r.mask, r.priority));
        rules
    }

    /// Drop entries whose idle timeout has run out
    pub fn prune_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.rules.len();
        self.rules.retain(|_, r| r.is_live(now));
        before - self.rules.len()
    }

    pub fn len(&self) -> usize {
        self.live().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RouteInstaller for RouteTable {
    async fn install_route(&self, rule: &RouteRule) -> Result<(), SinkError> {
        self.record(rule.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{HostAddr, OutPort, PACKET_IN_PRIORITY};

    #[tokio::test]
    async fn test_channel_forwards_commands() {
        let (southbound, mut rx) = ChannelSouthbound::new(4);
        southbound.request_port_stats(0x8101).await.unwrap();

        let rule = RouteRule::to_host(0x4000, HostAddr::new(2, 0, 2), 3, 30, 5);
        southbound.install_route(&rule).await.unwrap();

        assert_eq!(
            rx.recv().await,
            Some(SouthboundCommand::RequestPortStats { dpid: 0x8101 })
        );
        assert_eq!(rx.recv().await, Some(SouthboundCommand::InstallRoute { rule }));
    }

    #[tokio::test]
    async fn test_closed_channel_is_reported() {
        let (southbound, rx) = ChannelSouthbound::new(1);
        drop(rx);

        assert_eq!(
            southbound.request_port_stats(0x8101).await,
            Err(SinkError::Closed)
        );
    }

    #[tokio::test]
    async fn test_installing_twice_is_idempotent() {
        let table = RouteTable::new();
        let rule = RouteRule::to_host(0x4000, HostAddr::new(2, 0, 2), 3, 30, 5);

        table.install_route(&rule).await.unwrap();
        let once = table.list();
        table.install_route(&rule).await.unwrap();

        assert_eq!(table.list(), once);
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_same_match_overwrites_action() {
        let table = RouteTable::new();
        let dst = HostAddr::new(2, 0, 2);
        table
            .install_route(&RouteRule::to_host(0x4000, dst, 3, 30, 5))
            .await
            .unwrap();
        table
            .install_route(&RouteRule::to_host(0x4000, dst, 4, 30, 5))
            .await
            .unwrap();

        let rules = table.rules_for(0x4000);
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].out_port, OutPort::Physical(4));
    }

    #[tokio::test]
    async fn test_full_buffer_rejects_stats_request() {
        let (southbound, mut rx) = ChannelSouthbound::new(1);
        southbound.request_port_stats(0x8101).await.unwrap();

        assert_eq!(
            southbound.request_port_stats(0x8102).await,
            Err(SinkError::Rejected {
                dpid: 0x8102,
                reason: "southbound buffer full".to_string(),
            })
        );

        assert_eq!(
            rx.recv().await,
            Some(SouthboundCommand::RequestPortStats { dpid: 0x8101 })
        );
        southbound.request_port_stats(0x8102).await.unwrap();
    }

    #[tokio::test]
    async fn test_reinstalls_with_new_priority_do_not_accumulate() {
        let table = RouteTable::new();
        let dst = HostAddr::new(2, 0, 2);

        for priority in 0x8001..=0x8005 {
            table
                .install_route(&RouteRule::to_host(0x4000, dst, 3, 30, priority))
                .await
                .unwrap();
        }

        assert_eq!(table.len(), 1);
        assert_eq!(table.rules_for(0x4000)[0].priority, 0x8005);
    }

    #[test]
    fn test_live_higher_priority_rule_shadows_new_install() {
        let table = RouteTable::new();
        let dst = HostAddr::new(2, 0, 2);
        table.record(RouteRule::to_host(0x4001, dst, 3, 30, 0x8123));
        table.record(RouteRule::to_host(0x4001, dst, 4, 30, PACKET_IN_PRIORITY));

        let rule = table.lookup(0x4001, dst.ipv4()).unwrap();
        assert_eq!(rule.out_port, OutPort::Physical(3));
        assert_eq!(rule.priority, 0x8123);
    }

    #[test]
    fn test_expired_rule_is_replaced_and_pruned() {
        let table = RouteTable::new();
        let dst = HostAddr::new(2, 0, 2);
        let long_ago = Instant::now()
            .checked_sub(Duration::from_secs(60))
            .unwrap();

        table.record_at(RouteRule::to_host(0x4001, dst, 3, 30, 0x8123), long_ago);
        assert!(table.is_empty());
        assert!(table.lookup(0x4001, dst.ipv4()).is_none());

        table.record(RouteRule::to_host(0x4001, dst, 4, 30, PACKET_IN_PRIORITY));
        assert_eq!(
            table.lookup(0x4001, dst.ipv4()).unwrap().out_port,
            OutPort::Physical(4)
        );

        table.record_at(RouteRule::to_host(0x4002, dst, 3, 30, 0x8123), long_ago);
        table.record(RouteRule::table_miss(0x4002));
        assert_eq!(table.prune_expired(), 1);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_lookup_prefers_priority_then_mask() {
        let table = RouteTable::new();
        table.record(RouteRule::prefix(0x8101, Ipv4Addr::new(10, 2, 0, 0), 0xFFFF_0000, 3));
        table.record(RouteRule::table_miss(0x8101));

        let dst = Ipv4Addr::new(10, 2, 1, 3);
        assert_eq!(table.lookup(0x8101, dst).unwrap().out_port, OutPort::Physical(3));
        assert_eq!(
            table.lookup(0x8101, Ipv4Addr::new(10, 3, 0, 2)).unwrap().out_port,
            OutPort::Controller
        );
        assert!(table.lookup(0x8102, dst).is_none());
    }

    #[test]
    fn test_command_json_shape() {
        let json = serde_json::to_value(SouthboundCommand::RequestPortStats { dpid: 33025 }).unwrap();
        assert_eq!(json["type"], "request_port_stats");
        assert_eq!(json["dpid"], 33025);
    }
}
