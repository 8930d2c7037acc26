//! Fabric tables and controller health

use anyhow::Result;
use chrono::{TimeZone, Utc};
use colored::Colorize;
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{
    color_status, format_dpid, format_out_port, format_prefix, print_json, print_table,
    print_warning, OutputFormat,
};

#[derive(Tabled)]
struct PlacementRow {
    #[tabled(rename = "Service")]
    service: String,
    #[tabled(rename = "Host")]
    host: String,
}

#[derive(Tabled)]
struct SliceRow {
    #[tabled(rename = "Slice")]
    slice: String,
    #[tabled(rename = "Hosts")]
    hosts: String,
}

#[derive(Tabled)]
struct RouteRow {
    #[tabled(rename = "Switch")]
    switch: String,
    #[tabled(rename = "Match")]
    prefix: String,
    #[tabled(rename = "Out")]
    out_port: String,
    #[tabled(rename = "Priority")]
    priority: u16,
    #[tabled(rename = "Idle (s)")]
    idle_timeout_secs: u16,
}

#[derive(Tabled)]
struct ComponentRow {
    #[tabled(rename = "Component")]
    name: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Message")]
    message: String,
    #[tabled(rename = "Last Check")]
    last_check: String,
}

pub async fn show_placements(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let placements = client.placements().await?;

    match format {
        OutputFormat::Json => print_json(&placements)?,
        OutputFormat::Table => {
            let rows: Vec<PlacementRow> = placements
                .into_iter()
                .map(|(service, host)| PlacementRow { service, host })
                .collect();
            print_table(rows);
        }
    }

    Ok(())
}

pub async fn show_slices(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let slices = client.slices().await?;

    match format {
        OutputFormat::Json => print_json(&slices)?,
        OutputFormat::Table => {
            let rows: Vec<SliceRow> = slices
                .into_iter()
                .map(|(slice, hosts)| SliceRow {
                    slice,
                    hosts: hosts.join(", "),
                })
                .collect();
            print_table(rows);
        }
    }

    Ok(())
}

/// Show rules handed to the southbound adapter
pub async fn show_routes(client: &ApiClient, dpid: Option<u16>, format: OutputFormat) -> Result<()> {
    let routes = client.routes(dpid).await?;

    match format {
        OutputFormat::Json => print_json(&routes)?,
        OutputFormat::Table => {
            let rows: Vec<RouteRow> = routes
                .iter()
                .map(|r| RouteRow {
                    switch: format_dpid(r.switch),
                    prefix: format_prefix(&r.destination, r.mask),
                    out_port: format_out_port(r.out_port),
                    priority: r.priority,
                    idle_timeout_secs: r.idle_timeout_secs,
                })
                .collect();
            print_table(rows);
        }
    }

    Ok(())
}

pub async fn show_health(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let health = client.health().await?;

    match format {
        OutputFormat::Json => print_json(&health)?,
        OutputFormat::Table => {
            println!("{} {}", "Controller".bold(), color_status(&health.status));
            println!();

            let rows: Vec<ComponentRow> = health
                .components
                .iter()
                .map(|(name, c)| ComponentRow {
                    name: name.clone(),
                    status: color_status(&c.status),
                    message: c.message.clone().unwrap_or_default(),
                    last_check: format_timestamp(c.last_check_timestamp),
                })
                .collect();
            print_table(rows);

            if health.status == "unhealthy" {
                print_warning("The scheduler loop is not running; restart the controller");
            }
        }
    }

    Ok(())
}

fn format_timestamp(secs: i64) -> String {
    match Utc.timestamp_opt(secs, 0).single() {
        Some(ts) => ts.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => "-".to_string(),
    }
}
