//! Scheduler state commands: flows, congestions and port counters

use anyhow::{bail, Result};
use colored::Colorize;
use tabled::Tabled;

use crate::client::{ApiClient, SchedulerSnapshot};
use crate::output::{
    color_flow_count, color_status, format_bytes, format_dpid, print_info, print_json,
    print_table, OutputFormat,
};

#[derive(Tabled)]
struct FlowRow {
    #[tabled(rename = "Core")]
    switch: String,
    #[tabled(rename = "DPID")]
    dpid: String,
    #[tabled(rename = "From Pod")]
    in_pod: u8,
    #[tabled(rename = "To Pod")]
    out_pod: u8,
    #[tabled(rename = "TTL")]
    ttl: u32,
}

#[derive(Tabled)]
struct CongestionRow {
    #[tabled(rename = "Core")]
    switch: String,
    #[tabled(rename = "DPID")]
    dpid: String,
    #[tabled(rename = "Dst Pod")]
    dst_pod: u8,
    #[tabled(rename = "Flows")]
    flow_count: String,
}

#[derive(Tabled)]
struct PortRow {
    #[tabled(rename = "Switch")]
    switch: String,
    #[tabled(rename = "Port")]
    port_no: u32,
    #[tabled(rename = "TX")]
    tx_bytes: String,
    #[tabled(rename = "RX")]
    rx_bytes: String,
    #[tabled(rename = "ΔTX")]
    delta_tx: String,
    #[tabled(rename = "ΔRX")]
    delta_rx: String,
    #[tabled(rename = "Down Flows")]
    downlink_flow_count: u32,
}

fn print_header(snapshot: &SchedulerSnapshot) {
    println!(
        "Scheduler {} at tick {} (k={})",
        color_status(&snapshot.state),
        snapshot.tick.to_string().cyan(),
        snapshot.fat_tree_k
    );
    println!();
}

/// List the inferred core flows
pub async fn show_flows(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let snapshot = client.snapshot().await?;

    match format {
        OutputFormat::Json => print_json(&snapshot.flows)?,
        OutputFormat::Table => {
            print_header(&snapshot);
            let rows: Vec<FlowRow> = snapshot
                .flows
                .iter()
                .map(|f| FlowRow {
                    switch: f.switch.clone(),
                    dpid: format_dpid(f.dpid),
                    in_pod: f.in_pod,
                    out_pod: f.out_pod,
                    ttl: f.ttl,
                })
                .collect();
            print_table(rows);
        }
    }

    Ok(())
}

/// List the congested (core, destination pod) pairs
pub async fn show_congestions(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let snapshot = client.snapshot().await?;

    match format {
        OutputFormat::Json => print_json(&snapshot.congestions)?,
        OutputFormat::Table => {
            print_header(&snapshot);
            if snapshot.congestions.is_empty() {
                print_info("No congested downlinks");
                return Ok(());
            }
            let rows: Vec<CongestionRow> = snapshot
                .congestions
                .iter()
                .map(|c| CongestionRow {
                    switch: c.switch.clone(),
                    dpid: format_dpid(c.dpid),
                    dst_pod: c.dst_pod,
                    flow_count: color_flow_count(c.flow_count),
                })
                .collect();
            print_table(rows);
        }
    }

    Ok(())
}

/// Show per-port counters, optionally for a single switch
pub async fn show_ports(
    client: &ApiClient,
    switch: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let snapshot = client.snapshot().await?;

    let switches: Vec<_> = snapshot
        .switches
        .iter()
        .filter(|s| switch.as_deref().map_or(true, |name| s.switch == name))
        .collect();
    if let (Some(name), true) = (&switch, switches.is_empty()) {
        bail!("switch {} has not reported any port statistics", name);
    }

    match format {
        OutputFormat::Json => print_json(&switches)?,
        OutputFormat::Table => {
            print_header(&snapshot);
            let rows: Vec<PortRow> = switches
                .iter()
                .flat_map(|s| {
                    s.ports.iter().map(move |p| PortRow {
                        switch: if s.connected {
                            s.switch.clone()
                        } else {
                            format!("{} {}", s.switch, "(disconnected)".dimmed())
                        },
                        port_no: p.port_no,
                        tx_bytes: format_bytes(p.tx_bytes),
                        rx_bytes: format_bytes(p.rx_bytes),
                        delta_tx: format_bytes(p.delta_tx),
                        delta_rx: format_bytes(p.delta_rx),
                        downlink_flow_count: p.downlink_flow_count,
                    })
                })
                .collect();
            print_table(rows);
        }
    }

    Ok(())
}
