//! Flow scheduler library for a Fat-Tree SDN controller
//!
//! This crate provides the control-plane logic for:
//! - Decoding switch identity from datapath identifiers
//! - Per-port traffic delta statistics
//! - Flow inference and congested downlink detection
//! - Remediation by alternate-path routing or service migration
//! - The periodic scheduler loop and its external sinks
//! - Health checks and observability

pub mod controller;
pub mod error;
pub mod health;
pub mod models;
pub mod observability;
pub mod scheduler;
pub mod sinks;
pub mod stats;
pub mod switch;

pub use controller::FabricController;
pub use error::{AddrError, CodecError, SchedulerError, SinkError, StoreError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{SchedulerMetrics, StructuredLogger};
pub use scheduler::{FlowScheduler, LoopState, SchedulerBuilder, SchedulerConfig, SchedulerHandle};
pub use switch::{FatTree, SwitchIdentity, SwitchRole};
