//! Output formatting utilities

use crate::client::OutPort;
use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Print a table from a list of rows
pub fn print_table<T: Tabled>(rows: Vec<T>) {
    if rows.is_empty() {
        println!("{}", "No items found".yellow());
        return;
    }
    let table = Table::new(rows).with(Style::rounded()).to_string();
    println!("{}", table);
}

/// Print any response as pretty JSON
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2}Gi", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2}Mi", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2}Ki", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

/// Render a dpid the way switch logs print it
pub fn format_dpid(dpid: u16) -> String {
    format!("{:#06x}", dpid)
}

/// Render a destination and its mask as CIDR
pub fn format_prefix(destination: &str, mask: u32) -> String {
    format!("{}/{}", destination, mask.count_ones())
}

pub fn format_out_port(port: OutPort) -> String {
    match port {
        OutPort::Physical(n) => n.to_string(),
        OutPort::Controller => "controller".cyan().to_string(),
    }
}

/// Color status based on value
pub fn color_status(status: &str) -> String {
    match status.to_lowercase().as_str() {
        "healthy" | "running" | "yes" => status.green().to_string(),
        "degraded" | "created" => status.yellow().to_string(),
        "unhealthy" | "stopped" | "no" => status.red().to_string(),
        _ => status.to_string(),
    }
}

/// Highlight congested pairs by how many flows share the downlink
pub fn color_flow_count(count: u32) -> String {
    let formatted = count.to_string();
    if count >= 3 {
        formatted.red().to_string()
    } else {
        formatted.yellow().to_string()
    }
}
