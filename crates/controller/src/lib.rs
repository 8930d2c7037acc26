//! Fabric controller daemon
//!
//! Wires the flow scheduler to its stores and the southbound channel, and
//! serves health, metrics, diagnostics and event ingestion over HTTP.

pub mod api;
pub mod config;
